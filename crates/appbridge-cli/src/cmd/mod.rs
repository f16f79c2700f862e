//! Subcommand implementations.

pub mod exec;
pub mod session;

use crate::cli::EndpointArgs;
use appbridge_wire::{
    BridgeConfig, BridgeError, DiscoveryMode, SessionInfo, SessionRegistry, StartOutcome,
    StartRequest,
};
use thiserror::Error;
use tracing::debug;

/// Everything a subcommand can fail with.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("No running application found (searched {})", .0.join(", "))]
    NotFound(Vec<String>),
    #[error("Invalid arguments JSON: {0}")]
    Args(#[from] serde_json::Error),
    #[error("Failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl CliError {
    /// A suggestion printed under the error, when there is an obvious one.
    pub fn fix(&self) -> Option<&'static str> {
        match self {
            CliError::NotFound(_) => {
                Some("start the application with its bridge plugin enabled, or pass --host/--port")
            }
            CliError::Bridge(BridgeError::AmbiguousTarget { .. }) => {
                Some("name the session by port or host:port instead")
            }
            CliError::Bridge(BridgeError::HandshakeFailed { .. }) => {
                Some("something is listening there, but it is not an application bridge")
            }
            CliError::Args(_) => Some("pass arguments as a JSON object, e.g. '{\"script\":\"1+1\"}'"),
            _ => None,
        }
    }
}

pub type CliResult<T = ()> = Result<T, CliError>;

/// Shared state for one CLI invocation.
pub struct Context {
    pub registry: SessionRegistry,
    endpoint: EndpointArgs,
}

impl Context {
    pub fn new(config: BridgeConfig, endpoint: EndpointArgs) -> Self {
        Self {
            registry: SessionRegistry::new(config),
            endpoint,
        }
    }

    pub fn start_request(&self, target: Option<&str>, mode: DiscoveryMode) -> StartRequest {
        StartRequest {
            target: target.map(str::to_string),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            remote_host: self.endpoint.remote_host.clone(),
            mode,
        }
    }

    /// Start sessions, treating "nothing found" as an error.
    pub async fn connect(
        &self,
        target: Option<&str>,
        mode: DiscoveryMode,
    ) -> CliResult<Vec<SessionInfo>> {
        match self.registry.start(self.start_request(target, mode)).await? {
            StartOutcome::Connected { sessions, .. } => Ok(sessions),
            StartOutcome::Reused(info) => Ok(vec![info]),
            StartOutcome::NotFound { searched } => Err(CliError::NotFound(searched)),
        }
    }

    /// Close every session this invocation opened.
    pub async fn shutdown(&self) {
        match self.registry.stop(None).await {
            Ok(stopped) => debug!(count = stopped.len(), "Closed sessions"),
            Err(e) => debug!(error = %e, "Failed to close sessions"),
        }
    }
}

/// Run a future on a fresh current-thread runtime.
pub fn block_on<F: std::future::Future<Output = CliResult>>(fut: F) -> CliResult {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_searched_locations() {
        let err = CliError::NotFound(vec!["localhost:9223".into(), "localhost:9223-9322".into()]);
        assert_eq!(
            err.to_string(),
            "No running application found (searched localhost:9223, localhost:9223-9322)"
        );
        assert!(err.fix().is_some());
    }

    #[test]
    fn test_start_request_carries_endpoint_flags() {
        let ctx = Context::new(
            BridgeConfig::default(),
            EndpointArgs {
                host: Some("10.0.0.2".into()),
                port: Some(9300),
                remote_host: None,
            },
        );
        let request = ctx.start_request(Some("com.example.app"), DiscoveryMode::All);
        assert_eq!(request.target.as_deref(), Some("com.example.app"));
        assert_eq!(request.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(request.port, Some(9300));
        assert_eq!(request.mode, DiscoveryMode::All);
    }
}
