//! MCP transport layer implementations.
//!
//! Client-side transports move whole JSON-RPC envelopes between a
//! [`Session`](crate::mcp::session::Session) and a peer. They carry no protocol
//! semantics: ids, handshakes and pending-request bookkeeping live one layer up.
//!
//! - `stdio` - spawned child process, newline-delimited JSON
//! - `sse` - HTTP POST for outgoing messages, Server-Sent Events for incoming
//! - `memory` - in-process loopback to an [`McpServer`](crate::mcp::server::McpServer)

pub mod memory;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::protocol::Message;

pub use memory::MemoryTransport;
pub use sse::{SseClientTransport, SseConfig};
pub use stdio::{ProcessLauncher, StdioClientTransport, StdioConfig, TokioProcessLauncher};

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Error,
}

/// Everything a transport reports to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Message),
    Error(String),
    Closed,
    StateChanged(TransportState),
}

/// The single consumer slot a transport reports into.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Create a sink and the receiver its owner drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn message(&self, message: Message) {
        self.emit(TransportEvent::Message(message));
    }

    pub fn error(&self, error: impl Into<String>) {
        self.emit(TransportEvent::Error(error.into()));
    }

    pub fn closed(&self) {
        self.emit(TransportEvent::Closed);
    }

    pub fn state_changed(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            debug!("Transport event dropped: owner is gone");
        }
    }
}

/// Shared state machine used by the concrete transports.
///
/// Guarantees that the close event fires at most once.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<TransportState>,
    sink: Mutex<Option<EventSink>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Disconnected),
            sink: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub(crate) fn sink(&self) -> Option<EventSink> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move to `next`, reporting the change. Closed is terminal.
    pub(crate) fn set(&self, next: TransportState) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == next || *state == TransportState::Closed {
                return false;
            }
            *state = next;
        }
        if let Some(sink) = self.sink() {
            sink.state_changed(next);
        }
        true
    }

    /// Transition to `Closed` and fire the close event, once.
    pub(crate) fn close(&self) -> bool {
        if !self.set(TransportState::Closed) {
            return false;
        }
        if let Some(sink) = self.sink() {
            sink.closed();
        }
        true
    }

    /// Report a fault and move to the error state.
    pub(crate) fn fail(&self, error: impl Into<String>) {
        if let Some(sink) = self.sink() {
            sink.error(error);
        }
        self.set(TransportState::Error);
    }

    /// Check that `start` may proceed.
    pub(crate) fn begin_start(&self) -> Result<()> {
        match self.get() {
            TransportState::Disconnected | TransportState::Error => {
                self.set(TransportState::Connecting);
                Ok(())
            }
            TransportState::Closed => Err(Error::ConnectionClosed),
            state => Err(Error::Transport(format!("transport already started ({:?})", state))),
        }
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        match self.get() {
            TransportState::Connected => Ok(()),
            TransportState::Closed => Err(Error::ConnectionClosed),
            _ => Err(Error::NotConnected),
        }
    }
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel; events flow into `events` from now on.
    async fn start(&self, events: EventSink) -> Result<()>;

    /// Write one envelope. Resolves once the channel accepted it.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Tear the channel down. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Short transport name for logs.
    fn kind(&self) -> &'static str;
}

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub url: String,
}

/// How to reach an external MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
    Websocket(WebSocketConfig),
}

/// Host capabilities handed to transport construction.
#[derive(Clone)]
pub struct Platform {
    launcher: Option<Arc<dyn ProcessLauncher>>,
    http: reqwest::Client,
}

impl Platform {
    /// A platform able to spawn processes and speak HTTP.
    pub fn native() -> Self {
        Self {
            launcher: Some(Arc::new(TokioProcessLauncher)),
            http: reqwest::Client::new(),
        }
    }

    /// A platform without process spawning; stdio configs are rejected.
    pub fn without_processes() -> Self {
        Self {
            launcher: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn can_spawn_processes(&self) -> bool {
        self.launcher.is_some()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::native()
    }
}

/// Build the concrete transport for a config.
pub fn create_transport(config: &TransportConfig, platform: &Platform) -> Result<Arc<dyn Transport>> {
    match config {
        TransportConfig::Stdio(stdio) => {
            let launcher = platform.launcher.clone().ok_or_else(|| {
                Error::Unsupported("stdio transport requires a process-spawning platform".to_string())
            })?;
            Ok(Arc::new(StdioClientTransport::new(stdio.clone(), launcher)))
        }
        TransportConfig::Sse(sse) => Ok(Arc::new(SseClientTransport::new(
            sse.clone(),
            platform.http.clone(),
        )?)),
        TransportConfig::Websocket(ws) => Err(Error::Unsupported(format!(
            "WebSocket transport is not implemented ({})",
            ws.url
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A spy transport that records sends and lets tests inject events.

    use super::*;
    use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

    type Responder = Box<dyn Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync>;

    pub(crate) struct SpyTransport {
        state: StateCell,
        sent: Mutex<Vec<Message>>,
        responder: Option<Responder>,
    }

    impl SpyTransport {
        pub(crate) fn new() -> Self {
            Self {
                state: StateCell::new(),
                sent: Mutex::new(Vec::new()),
                responder: None,
            }
        }

        /// Answer every request synchronously through `responder`.
        pub(crate) fn with_responder(
            responder: impl Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Some(Box::new(responder)),
                ..Self::new()
            }
        }

        pub(crate) fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn sent_methods(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter_map(|m| m.method().map(String::from))
                .collect()
        }

        pub(crate) fn send_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub(crate) fn inject(&self, message: Message) {
            self.state.sink().expect("transport not started").message(message);
        }

        pub(crate) fn inject_error(&self, error: &str) {
            self.state.sink().expect("transport not started").error(error);
        }

        pub(crate) fn drop_connection(&self) {
            self.state.close();
        }
    }

    #[async_trait]
    impl Transport for SpyTransport {
        async fn start(&self, events: EventSink) -> Result<()> {
            self.state.begin_start()?;
            self.state.attach(events);
            self.state.set(TransportState::Connected);
            Ok(())
        }

        async fn send(&self, message: &Message) -> Result<()> {
            self.state.ensure_connected()?;
            self.sent.lock().unwrap().push(message.clone());
            if let (Message::Request(req), Some(responder)) = (message, &self.responder) {
                if let Some(response) = responder(req) {
                    self.inject(Message::Response(response));
                }
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state.close();
            Ok(())
        }

        fn state(&self) -> TransportState {
            self.state.get()
        }

        fn kind(&self) -> &'static str {
            "spy"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_tagged_by_type() {
        let yaml = "type: stdio\ncommand: acme-mcp\nargs: [\"--quiet\"]\n";
        let config: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        match config {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "acme-mcp");
                assert_eq!(stdio.args, vec!["--quiet"]);
            }
            other => panic!("Expected stdio config, got {:?}", other),
        }

        let json = serde_json::json!({"type": "sse", "url": "http://localhost:3001/sse"});
        let config: TransportConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config, TransportConfig::Sse(_)));
    }

    #[test]
    fn test_websocket_is_unsupported() {
        let config = TransportConfig::Websocket(WebSocketConfig {
            url: "ws://localhost:9000".to_string(),
        });
        let err = create_transport(&config, &Platform::native()).err().unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_stdio_requires_launcher() {
        let config = TransportConfig::Stdio(StdioConfig::new("acme-mcp"));
        let platform = Platform::without_processes();
        assert!(!platform.can_spawn_processes());

        let err = create_transport(&config, &platform).err().unwrap();
        assert!(matches!(err, Error::Unsupported(_)));

        let transport = create_transport(&config, &Platform::native()).unwrap();
        assert_eq!(transport.kind(), "stdio");
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_state_cell_closes_once() {
        let (sink, mut rx) = EventSink::channel();
        let cell = StateCell::new();
        cell.attach(sink);

        assert!(cell.close());
        assert!(!cell.close());
        assert!(!cell.set(TransportState::Connected));

        let mut closes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TransportEvent::Closed) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
        assert_eq!(cell.get(), TransportState::Closed);
    }
}
