//! Terminal output helpers for appbridge subcommands.

use appbridge_wire::{SessionInfo, SessionStatus};
use colored::Colorize;
use std::fmt;

/// Bold heading with a cyan marker, printed before each block of output.
pub fn section(title: &str) {
    println!("{} {}", "::".bright_cyan(), title.bold());
}

/// Aligned `label: value` row. Values may be pre-colored.
pub fn kv(label: &str, value: impl fmt::Display) {
    println!("  {:<13}{value}", format!("{label}:"));
}

pub fn hint(msg: &str) {
    println!("  {}", format!("hint: {msg}").dimmed());
}

/// Red error + yellow "fix:" suggestion. Goes to stderr so stdout stays parseable.
pub fn error_with_fix(msg: &str, fix: Option<&str>) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
    if let Some(fix) = fix {
        eprintln!("    {} {}", "fix:".bright_yellow(), fix);
    }
}

/// One session line: marker, endpoint, identifier, default flag.
pub fn session_line(info: &SessionInfo, is_default: bool) {
    let marker = if is_default {
        "\u{25cf}".bright_green()
    } else {
        "\u{25cb}".dimmed()
    };
    let identifier = info.identifier.as_deref().unwrap_or("(unidentified)");
    let default = if is_default { " (default)" } else { "" };
    println!(
        "  {} {:<22} {}{}",
        marker,
        format!("{}:{}", info.host, info.port),
        identifier,
        default.bright_cyan()
    );
}

/// Block describing one session's status.
pub fn status_block(status: &SessionStatus) {
    let endpoint = format!("{}:{}", status.host, status.port);
    let connected = if status.connected {
        "yes".bright_green()
    } else {
        "no".bright_yellow()
    };
    kv("Connected", connected);
    kv("Endpoint", &endpoint);
    kv(
        "Identifier",
        status.identifier.as_deref().unwrap_or("(unidentified)"),
    );
    if status.is_default == Some(true) {
        kv("Default", "yes");
    }
}
