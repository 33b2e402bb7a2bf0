//! In-process transport bound directly to an [`McpServer`].
//!
//! Used for embedding and tests: no serialization to bytes, but messages still
//! pass through the server's full JSON dispatch path.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{EventSink, StateCell, Transport, TransportState};
use crate::error::{Error, Result};
use crate::mcp::connection::{Outbound, ServerConnection};
use crate::mcp::protocol::Message;
use crate::mcp::server::McpServer;

/// Client transport looping back into an in-process server.
pub struct MemoryTransport {
    server: Arc<McpServer>,
    state: Arc<StateCell>,
    connection: Mutex<Option<Arc<ServerConnection>>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self {
            server,
            state: Arc::new(StateCell::new()),
            connection: Mutex::new(None),
            inbox: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Server-side id of the connection, once started.
    pub fn connection_id(&self) -> Option<String> {
        self.connection().map(|conn| conn.id().to_string())
    }

    fn connection(&self) -> Option<Arc<ServerConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, events: EventSink) -> Result<()> {
        self.state.begin_start()?;
        self.state.attach(events.clone());

        let (conn, mut outbound) = ServerConnection::new(format!("memory-{}", Uuid::new_v4()));
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.clone());
        let inbox = self.server.spawn_inbox(conn.clone());
        *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbox);
        self.state.set(TransportState::Connected);

        let server = self.server.clone();
        let state = self.state.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = outbound.recv() => match frame {
                        Some(Outbound::Message(message)) => events.message(message),
                        Some(Outbound::Event { event, .. }) => debug!("Ignoring out-of-band event '{}'", event),
                        Some(Outbound::Close) | None => break,
                    }
                }
            }
            server.connection_closed(conn.id());
            state.close();
        });

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.state.ensure_connected()?;
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)?;
        let value = serde_json::to_value(message)?;
        inbox.send(value).map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = self.connection() {
            conn.close();
        }
        self.state.close();
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
