//! Error taxonomy for the bridge layer.

use thiserror::Error;

/// Remote error fragments that mean "the connection is up but the target
/// window has not been registered yet". Matched case-insensitively.
const REGISTRATION_RACE_SIGNATURES: &[&str] = &[
    "window not found",
    "no window available",
    "not yet registered",
    "webview not ready",
];

/// Errors from the bridge layer.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Transport unreachable or lost. Never retried here; callers re-`start`.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response within the deadline.
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The application answered with a structured error.
    #[error("Remote command '{command}' failed: {message}")]
    RemoteCommand { command: String, message: String },

    /// Resolution found no matching or default session.
    #[error("No active session{}", target_suffix(.target))]
    NoActiveSession { target: Option<String> },

    /// An identifier matched more than one session.
    #[error("Target '{target}' is ambiguous: matches {candidates}")]
    AmbiguousTarget { target: String, candidates: String },

    /// Something answered at the address but did not complete the handshake.
    #[error("Handshake failed with {endpoint}: {reason}")]
    HandshakeFailed { endpoint: String, reason: String },

    #[error("JSON error: {0}")]
    Json(String),
}

fn target_suffix(target: &Option<String>) -> String {
    match target {
        Some(t) => format!(" matching '{t}'"),
        None => String::new(),
    }
}

impl BridgeError {
    /// Whether this is the transient "target not yet registered" remote error.
    pub fn is_registration_race(&self) -> bool {
        match self {
            BridgeError::RemoteCommand { message, .. } => {
                let lower = message.to_lowercase();
                REGISTRATION_RACE_SIGNATURES
                    .iter()
                    .any(|sig| lower.contains(sig))
            }
            _ => false,
        }
    }

    /// Whether the transport is gone (the session should be considered stale).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BridgeError::Connection(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Json(e.to_string())
    }
}

/// Alias for bridge results.
pub type BridgeResult<T> = Result<T, BridgeError>;
