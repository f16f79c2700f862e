//! Clap CLI definitions for appbridge.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  appbridge discover                      Find running applications on this machine
  appbridge discover --all                Connect to every application in the scan range
  appbridge status                        Show the default session
  appbridge exec list_windows             Run a command against the default session
  appbridge exec execute_js '{\"script\":\"document.title\"}' --target com.example.app
  appbridge watch --event console         Stream console events until Ctrl+C

\x1b[1;36mEnvironment:\x1b[0m
  MCP_BRIDGE_HOST    Host to connect to (default: localhost)
  MCP_BRIDGE_PORT    Port to connect to (default: 9223)
  TAURI_DEV_HOST     Remote device host tried after the local one
  RUST_LOG           Log filter (default: warn)";

/// appbridge: drive running applications over their WebSocket bridge.
#[derive(Parser)]
#[command(name = "appbridge", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.appbridge/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub endpoint: EndpointArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where to look for applications.
#[derive(Args, Clone, Debug, Default)]
pub struct EndpointArgs {
    /// Host to connect to.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to connect to.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Remote device host, tried after the local host.
    #[arg(long, global = true)]
    pub remote_host: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover running applications and list the sessions found.
    Discover {
        /// Keep scanning after the first hit and connect to every application.
        #[arg(long)]
        all: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show session status for the default or a named target.
    Status {
        /// Port, host:port, or application identifier.
        target: Option<String>,
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run one command and print its JSON result.
    Exec {
        /// Command name, e.g. `execute_js` or `list_windows`.
        command: String,
        /// Arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,
        /// Port, host:port, or application identifier.
        #[arg(long, short = 't')]
        target: Option<String>,
        /// Override the per-command timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Stream events from a session until Ctrl+C or the application exits.
    Watch {
        /// Port, host:port, or application identifier.
        #[arg(long, short = 't')]
        target: Option<String>,
        /// Only print events of this type.
        #[arg(long)]
        event: Option<String>,
    },
}
