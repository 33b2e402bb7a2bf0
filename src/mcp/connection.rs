//! Server-side connections and the SSE connection manager.

use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::Message;
use crate::metrics::Metrics;

/// One frame queued for a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A JSON-RPC message.
    Message(Message),
    /// An out-of-band named event (SSE only).
    Event { event: String, data: String },
    /// The connection is done; no frames follow.
    Close,
}

/// A single client attached to the server.
#[derive(Debug)]
pub struct ServerConnection {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl ServerConnection {
    /// Create a connection and the receiver its transport drains.
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: id.into(),
            tx,
            closed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.push(Outbound::Message(message))
    }

    pub fn send_event(&self, event: impl Into<String>, data: impl Into<String>) -> Result<()> {
        self.push(Outbound::Event {
            event: event.into(),
            data: data.into(),
        })
    }

    /// Queue the close frame. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
            debug!(connection_id = %self.id, "Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    fn push(&self, frame: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }
}

/// Called with the id of every connection the manager drops.
pub type CloseHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Tracks live SSE connections by id.
pub struct ConnectionManager {
    connections: DashMap<String, Arc<ServerConnection>>,
    on_close: Option<CloseHook>,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            connections: DashMap::new(),
            on_close: None,
            metrics,
        }
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    /// Open a connection with a fresh random id.
    ///
    /// Dropping the returned stream removes the connection.
    pub fn create(self: &Arc<Self>) -> (Arc<ServerConnection>, ConnectionStream) {
        let id = Uuid::new_v4().to_string();
        let (conn, rx) = ServerConnection::new(id.clone());
        self.connections.insert(id.clone(), conn.clone());
        self.metrics.set_active_connections(self.connections.len() as u64);
        info!(connection_id = %id, "Connection opened");

        let stream = ConnectionStream {
            rx,
            id,
            manager: Arc::downgrade(self),
            finished: false,
        };
        (conn, stream)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Close and forget a connection. Returns false for unknown ids.
    pub fn close(&self, id: &str) -> bool {
        match self.connections.remove(id) {
            Some((_, conn)) => {
                conn.close();
                self.after_removed(id);
                true
            }
            None => false,
        }
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn remove(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            self.after_removed(id);
        }
    }

    fn after_removed(&self, id: &str) {
        self.metrics.set_active_connections(self.connections.len() as u64);
        if let Some(hook) = &self.on_close {
            hook(id);
        }
        info!(connection_id = %id, "Connection removed");
    }
}

/// Outbound frames of one connection, ending after `Close`.
pub struct ConnectionStream {
    rx: mpsc::UnboundedReceiver<Outbound>,
    id: String,
    manager: Weak<ConnectionManager>,
    finished: bool,
}

impl ConnectionStream {
    pub fn connection_id(&self) -> &str {
        &self.id
    }
}

impl Stream for ConnectionStream {
    type Item = Outbound;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Outbound>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Outbound::Close)) => {
                this.finished = true;
                Poll::Ready(Some(Outbound::Close))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(&self.id);
        }
    }
}
