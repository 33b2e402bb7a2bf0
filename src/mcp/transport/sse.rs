//! SSE transport: incoming messages over Server-Sent Events, outgoing over HTTP POST.
//!
//! The server announces the session id in a `session` event; every POST carries it
//! in the `X-Session-ID` header. An `endpoint` event may redirect where POSTs go.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{EventSink, StateCell, Transport, TransportState};
use crate::error::{Error, Result};
use crate::mcp::protocol::Message;

/// Header carrying the SSE session id on POSTed messages.
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Event names used on the stream.
pub mod events {
    pub const MESSAGE: &str = "message";
    pub const SESSION: &str = "session";
    pub const ENDPOINT: &str = "endpoint";
    pub const CLOSE: &str = "close";
}

fn default_session_wait_ms() -> u64 {
    5_000
}

/// SSE endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseConfig {
    /// URL of the event stream.
    pub url: String,
    /// Where to POST messages. Defaults to `message` next to the stream URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// How long `start` waits for the server to announce its session.
    #[serde(default = "default_session_wait_ms")]
    pub session_wait_ms: u64,
}

impl SseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message_url: None,
            headers: HashMap::new(),
            session_wait_ms: default_session_wait_ms(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by a blank line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if let Some(event) = self.process_line(line) {
                out.push(event);
            }
        }
        out
    }

    /// Dispatch whatever is pending at end of stream.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        Some(SseEvent {
            event: self
                .event
                .take()
                .unwrap_or_else(|| events::MESSAGE.to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionAnnouncement {
    session_id: String,
}

/// Mutable routing shared between the stream reader and `send`.
#[derive(Debug)]
struct Routing {
    message_url: RwLock<Url>,
    session_id: RwLock<Option<String>>,
    announced: Notify,
}

impl Routing {
    fn message_url(&self) -> Url {
        self.message_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Client transport over an SSE stream plus POST endpoint.
pub struct SseClientTransport {
    config: SseConfig,
    stream_url: Url,
    http: reqwest::Client,
    routing: Arc<Routing>,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
}

impl SseClientTransport {
    pub fn new(config: SseConfig, http: reqwest::Client) -> Result<Self> {
        let stream_url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid SSE url '{}': {}", config.url, e)))?;
        let message_url = match &config.message_url {
            Some(url) => Url::parse(url)
                .map_err(|e| Error::Config(format!("invalid message url '{}': {}", url, e)))?,
            None => stream_url
                .join("message")
                .map_err(|e| Error::Config(format!("cannot derive message url: {}", e)))?,
        };

        Ok(Self {
            config,
            stream_url,
            http,
            routing: Arc::new(Routing {
                message_url: RwLock::new(message_url),
                session_id: RwLock::new(None),
                announced: Notify::new(),
            }),
            state: Arc::new(StateCell::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Session id announced by the server, once seen.
    pub fn session_id(&self) -> Option<String> {
        self.routing.session_id()
    }

    /// Current POST target.
    pub fn message_url(&self) -> Url {
        self.routing.message_url()
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request
    }
}

/// Apply one stream event. Returns false when the server asked to close.
fn handle_event(event: SseEvent, sink: &EventSink, routing: &Routing, base: &Url) -> bool {
    trace!(event = %event.event, "SSE event");
    match event.event.as_str() {
        events::MESSAGE => match Message::parse(&event.data) {
            Ok(message) => sink.message(message),
            Err(e) => {
                warn!("Malformed message on SSE stream: {}", e);
                sink.error(format!("malformed SSE message: {}", e));
            }
        },
        events::SESSION => match serde_json::from_str::<SessionAnnouncement>(&event.data) {
            Ok(announcement) => {
                debug!(session_id = %announcement.session_id, "SSE session announced");
                *routing
                    .session_id
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(announcement.session_id);
                routing.announced.notify_one();
            }
            Err(e) => warn!("Ignoring malformed session event: {}", e),
        },
        events::ENDPOINT => match base.join(event.data.trim()) {
            Ok(url) => {
                debug!(url = %url, "SSE message endpoint announced");
                *routing
                    .message_url
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = url;
                routing.announced.notify_one();
            }
            Err(e) => warn!("Ignoring malformed endpoint event: {}", e),
        },
        events::CLOSE => {
            info!("Server closed the SSE stream");
            return false;
        }
        other => debug!("Ignoring SSE event '{}'", other),
    }
    true
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn start(&self, events: EventSink) -> Result<()> {
        self.state.begin_start()?;
        self.state.attach(events.clone());

        let request = self.with_headers(
            self.http
                .get(self.stream_url.clone())
                .header(ACCEPT, "text/event-stream"),
        );
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.state.fail(format!("SSE connect failed: {}", e));
                return Err(e.into());
            }
        };
        if !response.status().is_success() {
            let message = format!("SSE endpoint returned HTTP {}", response.status());
            self.state.fail(message.clone());
            return Err(Error::Transport(message));
        }

        info!(url = %self.stream_url, "SSE stream opened");
        self.state.set(TransportState::Connected);

        let state = self.state.clone();
        let routing = self.routing.clone();
        let token = self.shutdown.clone();
        let base = self.stream_url.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            'read: loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for event in decoder.feed(&bytes) {
                                if !handle_event(event, &events, &routing, &base) {
                                    break 'read;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("SSE stream error: {}", e);
                            events.error(format!("SSE stream error: {}", e));
                            break;
                        }
                        None => {
                            if let Some(event) = decoder.flush() {
                                handle_event(event, &events, &routing, &base);
                            }
                            debug!("SSE stream ended");
                            break;
                        }
                    }
                }
            }
            state.close();
        });

        // Servers that announce a session do so first; give them a moment.
        let wait = Duration::from_millis(self.config.session_wait_ms);
        if !wait.is_zero()
            && tokio::time::timeout(wait, self.routing.announced.notified())
                .await
                .is_err()
        {
            debug!("No session announced within {:?}, continuing without one", wait);
        }

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.state.ensure_connected()?;

        let mut request = self.with_headers(self.http.post(self.routing.message_url()).json(message));
        if let Some(session_id) = self.routing.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(Error::Transport(format!(
                "message endpoint returned HTTP {}: {}",
                status, body
            )));
        }
        trace!(%status, "Message accepted");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        if self.state.close() {
            debug!(url = %self.stream_url, "SSE transport closed");
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}
