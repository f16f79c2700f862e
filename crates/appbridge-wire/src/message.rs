//! Wire protocol message types.
//!
//! All communication with an application endpoint uses JSON text frames over
//! a WebSocket. The controller sends requests; the application answers with
//! correlated responses or pushes unsolicited events (no `id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Default port the application plugin listens on.
pub const DEFAULT_PORT: u16 = 9223;

/// Number of ports probed by a discovery scan, starting at the default port.
pub const DEFAULT_SCAN_WIDTH: u16 = 100;

/// Maximum accepted inbound frame (screenshots arrive as data URLs).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Command used for the identification handshake.
pub const HANDSHAKE_COMMAND: &str = "invoke_tauri";

/// Plugin command proxied by the handshake; its result carries the app identifier.
pub const HANDSHAKE_PLUGIN_COMMAND: &str = "plugin:mcp-bridge|get_backend_state";

/// Commands that wait on UI state and therefore get the longer timeout.
const INTERACTIVE_COMMANDS: &[&str] = &[
    "execute_js",
    "capture_native_screenshot",
    "invoke_tauri",
    "resize_window",
];

/// Identity of one application instance: a `(host, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// WebSocket URL for this endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Timeout class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Synchronous query answered immediately by the application.
    Query,
    /// Operation that itself waits on UI state (script evaluation, capture).
    Interactive,
}

impl CommandClass {
    /// Classify a command by name.
    pub fn of(command: &str) -> Self {
        if INTERACTIVE_COMMANDS.contains(&command) {
            CommandClass::Interactive
        } else {
            CommandClass::Query
        }
    }

    /// Pick the timeout for this class from the two configured values.
    pub fn timeout(self, query: Duration, interactive: Duration) -> Duration {
        match self {
            CommandClass::Query => query,
            CommandClass::Interactive => interactive,
        }
    }
}

/// Request frame (controller → application).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Correlation id, unique per connection.
    pub id: String,
    pub command: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

impl WireRequest {
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Value) -> Self {
        let args = if args.is_null() { empty_args() } else { args };
        Self {
            id: id.into(),
            command: command.into(),
            args,
        }
    }
}

/// Window targeting details some application versions attach to replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowContext {
    #[serde(default)]
    pub window_label: Option<String>,
    #[serde(default)]
    pub total_windows: Option<u64>,
    #[serde(default)]
    pub warning: Option<String>,
}

/// A decoded response frame (application → controller).
#[derive(Debug, Clone, PartialEq)]
pub struct WireReply {
    pub id: String,
    /// Result payload, or the remote-reported error message.
    pub outcome: Result<Value, String>,
    pub window_context: Option<WindowContext>,
}

/// An unsolicited event frame: `{ type, payload }` with no `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Every inbound frame falls into one of these shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Reply(WireReply),
    Event(WireEvent),
    /// Valid JSON that is neither a response nor an event.
    Unrecognized(Value),
}

/// Encode a request as a JSON text frame.
pub fn encode_request(req: &WireRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(req)
}

/// Decode an inbound text frame.
///
/// Accepts both response generations: `{id, result}` / `{id, error}` and
/// `{id, success, data, error}`.
pub fn decode_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(classify(value))
}

fn classify(value: Value) -> InboundFrame {
    let Some(obj) = value.as_object() else {
        return InboundFrame::Unrecognized(value);
    };

    let id = match obj.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    if let Some(id) = id {
        let is_response = ["result", "error", "success", "data"]
            .iter()
            .any(|k| obj.contains_key(*k));
        if !is_response {
            return InboundFrame::Unrecognized(value);
        }
        let window_context = obj
            .get("windowContext")
            .and_then(|v| serde_json::from_value::<WindowContext>(v.clone()).ok());
        return InboundFrame::Reply(WireReply {
            id,
            outcome: reply_outcome(obj),
            window_context,
        });
    }

    if obj.get("type").is_some_and(Value::is_string) {
        if let Ok(event) = serde_json::from_value::<WireEvent>(value.clone()) {
            return InboundFrame::Event(event);
        }
    }

    InboundFrame::Unrecognized(value)
}

fn reply_outcome(obj: &serde_json::Map<String, Value>) -> Result<Value, String> {
    let error_text = || match obj.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    };
    let payload = || {
        obj.get("result")
            .or_else(|| obj.get("data"))
            .cloned()
            .unwrap_or(Value::Null)
    };

    match obj.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(payload()),
        Some(false) => Err(error_text().unwrap_or_else(|| "Unknown error".to_string())),
        None => match error_text() {
            Some(message) => Err(message),
            None => Ok(payload()),
        },
    }
}
