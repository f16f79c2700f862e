//! `discover` and `status`.

use super::{block_on, CliError, CliResult, Context};
use crate::ui;
use appbridge_wire::{DiscoveryMode, StatusReport};
use colored::Colorize;

pub fn cmd_discover(ctx: &Context, all: bool, json: bool) -> CliResult {
    let mode = if all {
        DiscoveryMode::All
    } else {
        DiscoveryMode::First
    };
    block_on(async {
        let outcome = run_discover(ctx, mode, json).await;
        ctx.shutdown().await;
        outcome
    })
}

async fn run_discover(ctx: &Context, mode: DiscoveryMode, json: bool) -> CliResult {
    ctx.connect(None, mode).await?;
    let sessions = ctx.registry.sessions();
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    ui::section(&format!("Found {} application(s)", sessions.len()));
    // Sessions come back in creation order; the last one is the default.
    let last = sessions.len().saturating_sub(1);
    for (i, info) in sessions.iter().enumerate() {
        ui::session_line(info, i == last);
    }
    Ok(())
}

pub fn cmd_status(ctx: &Context, target: Option<&str>, json: bool) -> CliResult {
    block_on(async {
        let outcome = run_status(ctx, target, json).await;
        ctx.shutdown().await;
        outcome
    })
}

async fn run_status(ctx: &Context, target: Option<&str>, json: bool) -> CliResult {
    // Nothing found is still a status: the report says "not connected".
    match ctx.connect(target, DiscoveryMode::First).await {
        Ok(_) | Err(CliError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let report = ctx.registry.status(target);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match &report {
        StatusReport::Single(status) => {
            ui::section("Session");
            ui::status_block(status);
            if !status.connected {
                ui::hint("run `appbridge discover` once the application is running");
            }
        }
        StatusReport::Multiple(all) => {
            ui::section(&format!("{} sessions", all.len()));
            for status in all {
                println!();
                ui::status_block(status);
            }
        }
        StatusReport::NotFound { target, .. } => {
            ui::section("Session");
            ui::kv("Not found", target.as_str().bright_yellow());
        }
    }
    Ok(())
}
