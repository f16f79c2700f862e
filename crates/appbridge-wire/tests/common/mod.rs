//! In-process stand-in for a running application.
//!
//! Listens on `127.0.0.1:0`, accepts WebSocket connections, and answers the
//! request frames the bridge sends. Dropping a [`StubApp`] closes its listener
//! and every open connection, which looks like the application exiting.

#![allow(dead_code)]

use appbridge_wire::message::HANDSHAKE_PLUGIN_COMMAND;
use appbridge_wire::{BridgeConfig, RetrySettings};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// How the stub behaves.
#[derive(Debug, Clone, Default)]
pub struct StubOptions {
    /// Identifier reported by the handshake; `None` rejects the handshake command.
    pub identifier: Option<String>,
    /// How many `execute_js` calls fail with "Window not found" before succeeding.
    pub race_failures: u32,
}

impl StubOptions {
    pub fn app(identifier: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            ..Default::default()
        }
    }
}

struct StubState {
    identifier: Option<String>,
    race_remaining: AtomicU32,
    connections: AtomicU32,
}

pub struct StubApp {
    port: u16,
    state: Arc<StubState>,
    accept_task: JoinHandle<()>,
    _shutdown: watch::Sender<bool>,
}

impl StubApp {
    pub async fn spawn(options: StubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, options)
    }

    fn serve(listener: TcpListener, options: StubOptions) -> Self {
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(StubState {
            identifier: options.identifier,
            race_remaining: AtomicU32::new(options.race_failures),
            connections: AtomicU32::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(&accept_state),
                    shutdown_rx.clone(),
                ));
            }
        });

        Self {
            port,
            state,
            accept_task,
            _shutdown: shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Completed WebSocket handshakes so far.
    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for StubApp {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Two stubs on consecutive ports, lower port first.
pub async fn spawn_adjacent(first: StubOptions, second: StubOptions) -> (StubApp, StubApp) {
    for _ in 0..50 {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = a.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(b) = TcpListener::bind(("127.0.0.1", port + 1)).await {
            return (StubApp::serve(a, first), StubApp::serve(b, second));
        }
    }
    panic!("could not find two adjacent free ports");
}

/// A port with nothing listening on it.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A TCP server that answers every connection with a plain HTTP 404.
pub async fn spawn_http_404() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = stream.shutdown().await;
        }
    });
    (port, task)
}

/// Config pointed at one local port with short timeouts and a fast retry policy.
pub fn test_config(port: u16) -> BridgeConfig {
    BridgeConfig {
        host: Some("127.0.0.1".into()),
        port: Some(port),
        scan_start_port: port,
        scan_width: 1,
        connect_timeout_ms: 1000,
        probe_timeout_ms: 300,
        query_timeout_ms: 2000,
        interactive_timeout_ms: 2000,
        retry: RetrySettings {
            max_attempts: 5,
            initial_delay_ms: 5,
            max_delay_ms: 20,
        },
        ..Default::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<StubState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !respond(&text, &state, &out_tx) {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }

    // Dropping both halves closes the TCP stream without a close frame.
    writer.abort();
}

/// Answer one request frame. Returns false when the connection should drop.
fn respond(text: &str, state: &StubState, out: &mpsc::UnboundedSender<Message>) -> bool {
    let request: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let id = request["id"].clone();
    let command = request["command"].as_str().unwrap_or_default();
    let args = request["args"].clone();

    let send = |frame: Value| {
        let _ = out.send(Message::Text(frame.to_string()));
    };

    match command {
        "invoke_tauri" if args["command"] == HANDSHAKE_PLUGIN_COMMAND => {
            match &state.identifier {
                Some(identifier) => send(json!({
                    "id": id,
                    "success": true,
                    "data": { "app": { "identifier": identifier, "version": "1.0.0" } }
                })),
                None => send(json!({ "id": id, "error": "Unknown plugin command" })),
            }
        }
        "echo" => send(json!({ "id": id, "result": args })),
        "delayed" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let frame = json!({ "id": id, "result": args });
                let _ = out.send(Message::Text(frame.to_string()));
            });
        }
        "never" => {}
        "close" => return false,
        "emit" => {
            let count = args["count"].as_u64().unwrap_or(0);
            for n in 0..count {
                send(json!({ "type": "console", "payload": { "n": n } }));
            }
            send(json!({ "id": id, "result": { "emitted": count } }));
        }
        "warn_window" => send(json!({
            "id": id,
            "success": true,
            "data": "ok",
            "windowContext": {
                "windowLabel": "main",
                "totalWindows": 2,
                "warning": "Multiple windows open; defaulted to main"
            }
        })),
        "execute_js" => {
            let raced = state
                .race_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if raced {
                send(json!({ "id": id, "error": "Window not found: main" }));
            } else {
                send(json!({ "id": id, "result": { "value": 42 } }));
            }
        }
        other => send(json!({ "id": id, "error": format!("Unknown command: {other}") })),
    }
    true
}
