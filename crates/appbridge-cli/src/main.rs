//! appbridge CLI: discover running applications and drive them over their
//! WebSocket bridge from the terminal.
//!
//! Each invocation owns a short-lived session registry: it discovers or
//! connects, runs one subcommand, then closes every session it opened.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use appbridge_wire::config::load_config;
use clap::Parser;

fn init_tracing_stderr(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.log_format);

    let config = load_config(cli.config.as_deref());
    let ctx = cmd::Context::new(config, cli.endpoint);

    let result = match cli.command {
        Commands::Discover { all, json } => cmd::session::cmd_discover(&ctx, all, json),
        Commands::Status { target, json } => {
            cmd::session::cmd_status(&ctx, target.as_deref(), json)
        }
        Commands::Exec {
            command,
            args,
            target,
            timeout_ms,
        } => cmd::exec::cmd_exec(&ctx, &command, &args, target.as_deref(), timeout_ms),
        Commands::Watch { target, event } => {
            cmd::exec::cmd_watch(&ctx, target.as_deref(), event.as_deref())
        }
    };

    if let Err(e) = result {
        ui::error_with_fix(&e.to_string(), e.fix());
        std::process::exit(1);
    }
}
