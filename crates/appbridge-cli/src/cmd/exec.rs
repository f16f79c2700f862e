//! `exec` and `watch`.

use super::{block_on, CliResult, Context};
use appbridge_wire::{DiscoveryMode, WireEvent};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub fn cmd_exec(
    ctx: &Context,
    command: &str,
    args: &str,
    target: Option<&str>,
    timeout_ms: Option<u64>,
) -> CliResult {
    let args: Value = serde_json::from_str(args)?;
    let timeout = timeout_ms.map(Duration::from_millis);

    block_on(async {
        let outcome = run_exec(ctx, command, args, target, timeout).await;
        ctx.shutdown().await;
        outcome
    })
}

async fn run_exec(
    ctx: &Context,
    command: &str,
    args: Value,
    target: Option<&str>,
    timeout: Option<Duration>,
) -> CliResult {
    ctx.connect(target, DiscoveryMode::First).await?;
    let value = ctx.registry.execute(target, command, args, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub fn cmd_watch(ctx: &Context, target: Option<&str>, event_type: Option<&str>) -> CliResult {
    block_on(async {
        let outcome = run_watch(ctx, target, event_type).await;
        ctx.shutdown().await;
        outcome
    })
}

async fn run_watch(ctx: &Context, target: Option<&str>, event_type: Option<&str>) -> CliResult {
    ctx.connect(target, DiscoveryMode::First).await?;
    let client = ctx.registry.resolve(target)?;
    let mut events = client.subscribe();
    eprintln!("Watching {} (Ctrl+C to stop)", client.endpoint());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = client.closed() => {
                warn!(endpoint = %client.endpoint(), "Application closed the connection");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&event, event_type)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged; some events were dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn event_matches(event: &WireEvent, filter: Option<&str>) -> bool {
    filter.map_or(true, |wanted| wanted == "*" || wanted == event.event_type)
}

fn print_event(event: &WireEvent, filter: Option<&str>) -> CliResult {
    if event_matches(event, filter) {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}
