//! Session registry: the directory of live application sessions.
//!
//! Sessions are keyed by endpoint identity `(host, port)`. When a caller does
//! not name a target, the registry picks one: the only session if there is
//! exactly one, otherwise the most recently created. Concurrent `start` calls
//! for the same identity are coalesced through a per-identity async lock, and a
//! watcher task per session removes it when its transport closes.

use crate::client::EndpointClient;
use crate::config::BridgeConfig;
use crate::discovery::{Discovery, DiscoveryMode, DiscoveryRequest, Target};
use crate::error::{BridgeError, BridgeResult};
use crate::message::Endpoint;
use crate::retry::RetryPolicy;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connectivity of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    /// Transport lost; the entry is about to be removed.
    Stale,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub host: String,
    pub port: u16,
    pub identifier: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Consumer-facing status of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connected: bool,
    pub identifier: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

/// Result of [`SessionRegistry::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    /// Exactly one session (or none, with `connected: false`).
    Single(SessionStatus),
    /// Several sessions, the default one flagged.
    Multiple(Vec<SessionStatus>),
    /// The named target matched nothing.
    NotFound { found: bool, target: String },
}

/// Result of [`SessionRegistry::start`]. Hard failures are `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// New sessions were created; `default` is the registry's default afterwards.
    Connected {
        default: SessionInfo,
        sessions: Vec<SessionInfo>,
    },
    /// A live session already matched the target; nothing was reconnected.
    Reused(SessionInfo),
    /// Nothing answered. Not an error: the caller decides how to react.
    NotFound { searched: Vec<String> },
}

/// Parameters for [`SessionRegistry::start`].
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// `"9223"`, `"host:9223"`, or an application identifier.
    pub target: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub remote_host: Option<String>,
    pub mode: DiscoveryMode,
}

struct SessionEntry {
    client: Arc<EndpointClient>,
    identifier: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Creation order; the highest live value is the default session.
    seq: u64,
    watcher: Option<JoinHandle<()>>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        let endpoint = self.client.endpoint();
        SessionInfo {
            host: endpoint.host.clone(),
            port: endpoint.port,
            identifier: self.identifier.clone(),
            state: if self.client.is_connected() {
                SessionState::Connected
            } else {
                SessionState::Stale
            },
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn status(&self, is_default: Option<bool>) -> SessionStatus {
        let endpoint = self.client.endpoint();
        SessionStatus {
            connected: self.client.is_connected(),
            identifier: self.identifier.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            is_default,
        }
    }

    fn matches(&self, target: &Target) -> bool {
        let endpoint = self.client.endpoint();
        match target {
            Target::Port(port) => endpoint.port == *port,
            Target::Endpoint(ep) => endpoint == ep,
            Target::AppId(id) => self.identifier.as_deref() == Some(id.as_str()),
        }
    }

    fn retire(mut self) -> Arc<EndpointClient> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.client
    }
}

struct Inner {
    config: BridgeConfig,
    discovery: Discovery,
    retry: RetryPolicy,
    sessions: RwLock<HashMap<Endpoint, SessionEntry>>,
    /// Per-identity locks held while a `start` is connecting.
    connecting: DashMap<Endpoint, Arc<tokio::sync::Mutex<()>>>,
    next_seq: AtomicU64,
}

/// Thread-safe directory of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            inner: Arc::new(Inner {
                discovery: Discovery::new(config.clone()),
                config,
                retry,
                sessions: RwLock::new(HashMap::new()),
                connecting: DashMap::new(),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Connect to the target (or discover one), reusing a live session if one
    /// already matches.
    pub async fn start(&self, request: StartRequest) -> BridgeResult<StartOutcome> {
        let target = request.target.as_deref().map(Target::parse);
        if let Some(info) = self.find_reusable(target.as_ref(), &request)? {
            debug!(endpoint = %info.endpoint(), "Reusing live session");
            return Ok(StartOutcome::Reused(info));
        }

        let lock_key = self.wanted_endpoint(target.as_ref(), &request);
        let lock = self
            .inner
            .connecting
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.start_locked(target.as_ref(), &request).await
        };

        // Drop the lock entry unless another start is still queued on it.
        self.inner
            .connecting
            .remove_if(&lock_key, |_, entry| Arc::strong_count(entry) <= 2);
        outcome
    }

    async fn start_locked(
        &self,
        target: Option<&Target>,
        request: &StartRequest,
    ) -> BridgeResult<StartOutcome> {
        // A concurrent start may have finished while we waited.
        if let Some(info) = self.find_reusable(target, request)? {
            debug!(endpoint = %info.endpoint(), "Coalesced with in-flight start");
            return Ok(StartOutcome::Reused(info));
        }

        let discovery_request = self.discovery_request(target, request);
        let report = self.inner.discovery.discover(&discovery_request).await;

        let mut created = Vec::new();
        let mut reused = Vec::new();
        let mut failures: Vec<(Endpoint, String)> = report.handshake_failures.clone();

        for client in report.clients {
            match client.identify().await {
                Ok(identifier) => match self.register(client, identifier) {
                    (info, true) => created.push(info),
                    (info, false) => reused.push(info),
                },
                Err(e) => {
                    warn!(endpoint = %client.endpoint(), error = %e, "Handshake failed");
                    failures.push((client.endpoint().clone(), e.to_string()));
                    client.disconnect().await;
                }
            }
        }

        if !created.is_empty() {
            let default = self
                .default_entry_info()
                .unwrap_or_else(|| created[created.len() - 1].clone());
            info!(
                created = created.len(),
                default = %default.endpoint(),
                "Sessions started"
            );
            return Ok(StartOutcome::Connected {
                default,
                sessions: created,
            });
        }
        if let Some(info) = reused.pop() {
            return Ok(StartOutcome::Reused(info));
        }
        // An untargeted start with a live default is satisfied by it, whatever
        // else answered on the way.
        if target.is_none() {
            if let Some(info) = self.default_entry_info() {
                if !failures.is_empty() {
                    debug!(
                        failures = failures.len(),
                        "Ignoring handshake failures; default session is live"
                    );
                }
                return Ok(StartOutcome::Reused(info));
            }
        }
        if let Some((endpoint, reason)) = failures.into_iter().next() {
            return Err(BridgeError::HandshakeFailed {
                endpoint: endpoint.to_string(),
                reason,
            });
        }

        info!(searched = ?report.searched, "No running application found");
        Ok(StartOutcome::NotFound {
            searched: report.searched,
        })
    }

    /// Remove one session (by identifier) or all of them. Unknown identifiers
    /// are a no-op. Returns the sessions that were removed.
    pub async fn stop(&self, target: Option<&str>) -> BridgeResult<Vec<SessionInfo>> {
        let retired: Vec<(SessionInfo, Arc<EndpointClient>)> = match target {
            None => {
                let mut sessions = self.write_sessions();
                sessions
                    .drain()
                    .map(|(_, entry)| (entry.info(), entry.retire()))
                    .collect()
            }
            Some(raw) => {
                let parsed = Target::parse(raw);
                let mut sessions = self.write_sessions();
                let matches: Vec<Endpoint> = sessions
                    .iter()
                    .filter(|(_, e)| e.matches(&parsed))
                    .map(|(ep, _)| ep.clone())
                    .collect();
                match matches.len() {
                    0 => Vec::new(),
                    1 => sessions
                        .remove(&matches[0])
                        .map(|entry| vec![(entry.info(), entry.retire())])
                        .unwrap_or_default(),
                    _ => {
                        return Err(ambiguous(raw, &matches));
                    }
                }
            }
        };

        let mut removed = Vec::with_capacity(retired.len());
        for (info, client) in retired {
            client.disconnect().await;
            info!(endpoint = %info.endpoint(), "Session stopped");
            removed.push(info);
        }
        Ok(removed)
    }

    /// Status of the default session, all sessions, or one named session.
    pub fn status(&self, target: Option<&str>) -> StatusReport {
        self.prune_stale();
        let sessions = self.read_sessions();

        if let Some(raw) = target {
            let parsed = Target::parse(raw);
            let mut matches: Vec<&SessionEntry> =
                sessions.values().filter(|e| e.matches(&parsed)).collect();
            return match matches.len() {
                0 => StatusReport::NotFound {
                    found: false,
                    target: raw.to_string(),
                },
                1 => StatusReport::Single(matches[0].status(None)),
                _ => {
                    matches.sort_by_key(|e| e.seq);
                    StatusReport::Multiple(matches.iter().map(|e| e.status(Some(false))).collect())
                }
            };
        }

        let mut entries: Vec<&SessionEntry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        match entries.as_slice() {
            [] => StatusReport::Single(SessionStatus {
                connected: false,
                identifier: None,
                host: self.inner.config.resolve_host(None),
                port: self.inner.config.resolve_port(None),
                is_default: None,
            }),
            [only] => StatusReport::Single(only.status(None)),
            many => {
                let default_seq = many.iter().map(|e| e.seq).max();
                StatusReport::Multiple(
                    many.iter()
                        .map(|e| e.status(Some(Some(e.seq) == default_seq)))
                        .collect(),
                )
            }
        }
    }

    /// Route a call to a client.
    ///
    /// A port or `host:port` matches by identity, anything else by application
    /// identifier. Without an identifier the only session, or else the most
    /// recently created one, is used.
    pub fn resolve(&self, target: Option<&str>) -> BridgeResult<Arc<EndpointClient>> {
        self.prune_stale();
        let sessions = self.read_sessions();

        match target {
            Some(raw) => {
                let parsed = Target::parse(raw);
                let matches: Vec<&SessionEntry> =
                    sessions.values().filter(|e| e.matches(&parsed)).collect();
                match matches.as_slice() {
                    [] => Err(BridgeError::NoActiveSession {
                        target: Some(raw.to_string()),
                    }),
                    [only] => Ok(Arc::clone(&only.client)),
                    many => {
                        let endpoints: Vec<Endpoint> =
                            many.iter().map(|e| e.client.endpoint().clone()).collect();
                        Err(ambiguous(raw, &endpoints))
                    }
                }
            }
            None => sessions
                .values()
                .max_by_key(|e| e.seq)
                .map(|e| Arc::clone(&e.client))
                .ok_or(BridgeError::NoActiveSession { target: None }),
        }
    }

    /// Resolve, run with the registration-race retry policy, and record activity.
    pub async fn execute(
        &self,
        target: Option<&str>,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        let client = self.resolve(target)?;
        let result = self
            .inner
            .retry
            .execute(client.as_ref(), command, args, timeout)
            .await;

        match &result {
            Ok(_) => self.touch(client.endpoint()),
            Err(e) if e.is_connection_lost() => self.remove_if_owned(client.endpoint(), &client),
            Err(_) => {}
        }
        result
    }

    /// All live sessions in creation order.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.read_sessions();
        let mut entries: Vec<&SessionEntry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(SessionEntry::info).collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── internals ──────────────────────────────────────────────────────

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Endpoint, SessionEntry>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Endpoint, SessionEntry>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// The endpoint a start request is aiming at, used as the coalescing key.
    fn wanted_endpoint(&self, target: Option<&Target>, request: &StartRequest) -> Endpoint {
        let config = &self.inner.config;
        match target {
            Some(Target::Endpoint(ep)) => ep.clone(),
            Some(Target::Port(port)) => {
                Endpoint::new(config.resolve_host(request.host.as_deref()), *port)
            }
            _ => Endpoint::new(
                config.resolve_host(request.host.as_deref()),
                config.resolve_port(request.port),
            ),
        }
    }

    fn find_reusable(
        &self,
        target: Option<&Target>,
        request: &StartRequest,
    ) -> BridgeResult<Option<SessionInfo>> {
        self.prune_stale();
        match target {
            Some(t) => {
                let sessions = self.read_sessions();
                let matches: Vec<&SessionEntry> =
                    sessions.values().filter(|e| e.matches(t)).collect();
                match matches.as_slice() {
                    [] => Ok(None),
                    [only] => Ok(Some(only.info())),
                    many => {
                        let endpoints: Vec<Endpoint> =
                            many.iter().map(|e| e.client.endpoint().clone()).collect();
                        Err(ambiguous(&t.to_string(), &endpoints))
                    }
                }
            }
            None => {
                let wanted = self.wanted_endpoint(None, request);
                Ok(self.read_sessions().get(&wanted).map(SessionEntry::info))
            }
        }
    }

    fn discovery_request(&self, target: Option<&Target>, request: &StartRequest) -> DiscoveryRequest {
        let mut discovery = DiscoveryRequest {
            host: request.host.clone(),
            port: request.port,
            remote_host: request.remote_host.clone(),
            mode: request.mode,
            known: self.read_sessions().keys().cloned().collect(),
        };
        match target {
            Some(Target::Endpoint(ep)) => {
                discovery.host = Some(ep.host.clone());
                discovery.port = Some(ep.port);
            }
            Some(Target::Port(port)) => {
                discovery.host = Some(self.inner.config.resolve_host(request.host.as_deref()));
                discovery.port = Some(*port);
            }
            Some(Target::AppId(_)) => discovery.mode = DiscoveryMode::All,
            None => {}
        }
        discovery
    }

    /// Insert a freshly identified client. Returns the session and whether it
    /// was newly created (false when a live session already owned the identity).
    fn register(&self, client: Arc<EndpointClient>, identifier: Option<String>) -> (SessionInfo, bool) {
        let endpoint = client.endpoint().clone();
        let mut sessions = self.write_sessions();

        if let Some(existing) = sessions.get(&endpoint) {
            if existing.client.is_connected() {
                let info = existing.info();
                drop(sessions);
                tokio::spawn(async move { client.disconnect().await });
                return (info, false);
            }
        }
        if let Some(old) = sessions.remove(&endpoint) {
            let old_client = old.retire();
            tokio::spawn(async move { old_client.disconnect().await });
        }

        let now = Utc::now();
        let entry = SessionEntry {
            watcher: Some(spawn_watcher(Arc::downgrade(&self.inner), Arc::clone(&client))),
            client,
            identifier,
            created_at: now,
            last_activity: now,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let info = entry.info();
        sessions.insert(endpoint.clone(), entry);
        info!(
            endpoint = %endpoint,
            identifier = ?info.identifier,
            "Session created"
        );
        (info, true)
    }

    fn default_entry_info(&self) -> Option<SessionInfo> {
        self.read_sessions()
            .values()
            .max_by_key(|e| e.seq)
            .map(SessionEntry::info)
    }

    fn touch(&self, endpoint: &Endpoint) {
        if let Some(entry) = self.write_sessions().get_mut(endpoint) {
            entry.last_activity = Utc::now();
        }
    }

    fn remove_if_owned(&self, endpoint: &Endpoint, client: &Arc<EndpointClient>) {
        self.inner.remove_if_owned(endpoint, client);
    }

    /// Drop entries whose transport is already gone.
    fn prune_stale(&self) {
        let mut sessions = self.write_sessions();
        sessions.retain(|endpoint, entry| {
            let live = entry.client.is_connected();
            if !live {
                info!(endpoint = %endpoint, "Removing stale session");
                if let Some(watcher) = entry.watcher.take() {
                    watcher.abort();
                }
            }
            live
        });
    }
}

impl Inner {
    fn remove_if_owned(&self, endpoint: &Endpoint, client: &Arc<EndpointClient>) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let owned = sessions
            .get(endpoint)
            .is_some_and(|entry| Arc::ptr_eq(&entry.client, client));
        if owned {
            sessions.remove(endpoint);
            info!(endpoint = %endpoint, "Session removed after disconnect");
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

/// Remove the session when its client reports the transport closed.
fn spawn_watcher(registry: Weak<Inner>, client: Arc<EndpointClient>) -> JoinHandle<()> {
    tokio::spawn(async move {
        client.closed().await;
        if let Some(inner) = registry.upgrade() {
            inner.remove_if_owned(client.endpoint(), &client);
        }
    })
}

fn ambiguous(target: &str, endpoints: &[Endpoint]) -> BridgeError {
    let mut names: Vec<String> = endpoints.iter().map(Endpoint::to_string).collect();
    names.sort();
    BridgeError::AmbiguousTarget {
        target: target.to_string(),
        candidates: names.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_with_no_sessions_is_single_disconnected() {
        let registry = SessionRegistry::new(BridgeConfig {
            host: Some("127.0.0.1".into()),
            port: Some(9300),
            ..Default::default()
        });
        match registry.status(None) {
            StatusReport::Single(status) => {
                assert!(!status.connected);
                assert_eq!(status.identifier, None);
                assert_eq!(status.port, registry.config().resolve_port(None));
                assert_eq!(status.is_default, None);
            }
            other => panic!("Expected Single, got {other:?}"),
        }
    }

    #[test]
    fn test_status_unknown_target() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        let report = registry.status(Some("com.example.missing"));
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({"found": false, "target": "com.example.missing"})
        );
    }

    #[test]
    fn test_resolve_empty_registry() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        assert!(matches!(
            registry.resolve(None),
            Err(BridgeError::NoActiveSession { target: None })
        ));
        assert!(matches!(
            registry.resolve(Some("9223")),
            Err(BridgeError::NoActiveSession { target: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        assert!(registry.stop(Some("9223")).await.unwrap().is_empty());
        assert!(registry.stop(None).await.unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_releases_connect_lock() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let registry = SessionRegistry::new(BridgeConfig {
            host: Some("127.0.0.1".into()),
            port: Some(port),
            scan_start_port: port,
            scan_width: 1,
            connect_timeout_ms: 300,
            probe_timeout_ms: 300,
            ..Default::default()
        });

        let (a, b) = tokio::join!(
            registry.start(StartRequest::default()),
            registry.start(StartRequest::default()),
        );
        assert!(matches!(a.unwrap(), StartOutcome::NotFound { .. }));
        assert!(matches!(b.unwrap(), StartOutcome::NotFound { .. }));
        assert!(registry.inner.connecting.is_empty());

        registry
            .start(StartRequest {
                port: Some(port),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(registry.inner.connecting.is_empty());
    }

    #[test]
    fn test_status_serialization_shapes() {
        let single = StatusReport::Single(SessionStatus {
            connected: true,
            identifier: Some("com.example.app".into()),
            host: "localhost".into(),
            port: 9223,
            is_default: None,
        });
        assert_eq!(
            serde_json::to_value(&single).unwrap(),
            serde_json::json!({
                "connected": true,
                "identifier": "com.example.app",
                "host": "localhost",
                "port": 9223
            })
        );

        let multiple = StatusReport::Multiple(vec![SessionStatus {
            connected: true,
            identifier: None,
            host: "localhost".into(),
            port: 9224,
            is_default: Some(true),
        }]);
        assert_eq!(
            serde_json::to_value(&multiple).unwrap(),
            serde_json::json!([{
                "connected": true,
                "identifier": null,
                "host": "localhost",
                "port": 9224,
                "isDefault": true
            }])
        );
    }
}
