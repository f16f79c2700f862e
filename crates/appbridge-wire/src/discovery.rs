//! Discovery turns a loosely specified target into live endpoint clients.
//!
//! Attempts run in order, stopping at the first success unless
//! [`DiscoveryMode::All`] is requested:
//!
//! 1. explicit host + port
//! 2. configured host at the configured port
//! 3. remote-device host at the configured port
//! 4. a contiguous port scan, collecting every endpoint that answers
//!
//! Finding nothing is not an error: the report is simply empty.

use crate::client::EndpointClient;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::message::Endpoint;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// How a caller names a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Port only; matches any host.
    Port(u16),
    /// Full endpoint identity.
    Endpoint(Endpoint),
    /// Application identifier reported during the handshake.
    AppId(String),
}

impl Target {
    /// Parse `"9223"`, `"host:9223"`, or an application identifier.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(port) = raw.parse::<u16>() {
            return Target::Port(port);
        }
        if let Some((host, port)) = raw.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() {
                    return Target::Endpoint(Endpoint::new(host, port));
                }
            }
        }
        Target::AppId(raw.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Port(port) => write!(f, "{port}"),
            Target::Endpoint(ep) => write!(f, "{ep}"),
            Target::AppId(id) => f.write_str(id),
        }
    }
}

/// Whether to stop at the first live endpoint or keep collecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    #[default]
    First,
    All,
}

/// What the caller knows about where to look.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub remote_host: Option<String>,
    pub mode: DiscoveryMode,
    /// Endpoints that already have a live session; never probed again.
    pub known: Vec<Endpoint>,
}

/// Result of a discovery run.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Connected clients, sorted by endpoint.
    pub clients: Vec<Arc<EndpointClient>>,
    /// Endpoints that answered TCP but did not complete the protocol handshake.
    pub handshake_failures: Vec<(Endpoint, String)>,
    /// Human-readable description of every location tried.
    pub searched: Vec<String>,
    tried: BTreeSet<Endpoint>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn absorb(&mut self, endpoint: &Endpoint, outcome: Result<EndpointClient, BridgeError>) {
        match outcome {
            Ok(client) => self.clients.push(Arc::new(client)),
            Err(BridgeError::HandshakeFailed { reason, .. }) => {
                self.handshake_failures.push((endpoint.clone(), reason));
            }
            Err(e) => debug!(endpoint = %endpoint, error = %e, "Nothing listening"),
        }
    }
}

/// Endpoint discovery driven by a [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct Discovery {
    config: BridgeConfig,
}

impl Discovery {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Inclusive port range scanned in the last step.
    pub fn scan_range(&self) -> (u16, u16) {
        let start = self.config.scan_start_port;
        let end = start.saturating_add(self.config.scan_width.saturating_sub(1));
        (start, end)
    }

    /// Run discovery. Never fails; an empty report means nothing was found.
    pub async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryReport {
        let mut report = DiscoveryReport {
            tried: request.known.iter().cloned().collect(),
            ..Default::default()
        };
        let all = request.mode == DiscoveryMode::All;

        if let (Some(host), Some(port)) = (request.host.as_deref(), request.port) {
            let endpoint = Endpoint::new(host, port);
            self.attempt(&endpoint, self.config.connect_timeout(), &mut report)
                .await;
            if !report.is_empty() && !all {
                return finish(report);
            }
        }

        let host = self.config.resolve_host(request.host.as_deref());
        let port = self.config.resolve_port(request.port);
        let local = Endpoint::new(host.clone(), port);
        self.attempt(&local, self.config.connect_timeout(), &mut report)
            .await;
        if !report.is_empty() && !all {
            return finish(report);
        }

        if let Some(remote) = self
            .config
            .resolve_remote_host(request.remote_host.as_deref())
        {
            let endpoint = Endpoint::new(remote, port);
            self.attempt(&endpoint, self.config.connect_timeout(), &mut report)
                .await;
            if !report.is_empty() && !all {
                return finish(report);
            }
        }

        self.scan(&host, &mut report).await;
        finish(report)
    }

    /// Try one endpoint unless an earlier step already did.
    async fn attempt(&self, endpoint: &Endpoint, timeout: Duration, report: &mut DiscoveryReport) {
        if !report.tried.insert(endpoint.clone()) {
            return;
        }
        report.searched.push(endpoint.to_string());
        let outcome = probe(endpoint.clone(), &self.config, timeout).await;
        report.absorb(endpoint, outcome);
    }

    /// Probe the scan range with bounded concurrent fan-out.
    async fn scan(&self, host: &str, report: &mut DiscoveryReport) {
        let (start, end) = self.scan_range();
        report.searched.push(format!("{host}:{start}-{end}"));

        let endpoints: Vec<Endpoint> = (start..=end)
            .map(|port| Endpoint::new(host, port))
            .filter(|ep| report.tried.insert(ep.clone()))
            .collect();

        debug!(host, start, end, "Scanning for endpoints");
        let timeout = self.config.probe_timeout();
        let permits = Arc::new(Semaphore::new(self.config.scan_concurrency.max(1)));
        let config = Arc::new(self.config.clone());

        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let permits = Arc::clone(&permits);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        let err = BridgeError::Connection(format!("{endpoint}: scan cancelled"));
                        return (endpoint, Err(err));
                    };
                    let outcome = probe(endpoint.clone(), &config, timeout).await;
                    (endpoint, outcome)
                })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok((endpoint, outcome)) => report.absorb(&endpoint, outcome),
                Err(e) => debug!(error = %e, "Probe task failed"),
            }
        }
    }
}

fn finish(mut report: DiscoveryReport) -> DiscoveryReport {
    report
        .clients
        .sort_by(|a, b| a.endpoint().cmp(b.endpoint()));
    report.handshake_failures.sort_by(|a, b| a.0.cmp(&b.0));
    info!(
        found = report.clients.len(),
        handshake_failures = report.handshake_failures.len(),
        "Discovery finished"
    );
    report
}

/// Open one connection with the given connect timeout.
async fn probe(
    endpoint: Endpoint,
    config: &BridgeConfig,
    timeout: Duration,
) -> Result<EndpointClient, BridgeError> {
    let client = EndpointClient::new(endpoint, config).with_connect_timeout(timeout);
    client.connect().await?;
    Ok(client)
}
