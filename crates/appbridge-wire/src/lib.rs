//! Application bridge wire layer: sessions and command protocol.
//!
//! Lets a controller drive one or more running applications over persistent
//! WebSocket links. Commands are opaque names with JSON arguments; this crate
//! only correlates, times out, retries, and routes them.
//!
//! ## Architecture
//!
//! - **EndpointClient**: one transport connection to one application instance
//! - **RetryPolicy**: absorbs the window-registration startup race
//! - **Discovery**: finds live endpoints (direct, remote host, port scan)
//! - **SessionRegistry**: directory of live sessions and default-target routing
//! - **WireRequest / InboundFrame**: JSON message shapes on the wire

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod message;
pub mod registry;
pub mod retry;

pub use client::{CommandExecutor, EndpointClient, SubscriptionId};
pub use config::{BridgeConfig, RetrySettings};
pub use discovery::{Discovery, DiscoveryMode, DiscoveryReport, DiscoveryRequest, Target};
pub use error::{BridgeError, BridgeResult};
pub use message::{CommandClass, Endpoint, InboundFrame, WireEvent, WireReply, WireRequest};
pub use registry::{
    SessionInfo, SessionRegistry, SessionState, SessionStatus, StartOutcome, StartRequest,
    StatusReport,
};
pub use retry::RetryPolicy;
