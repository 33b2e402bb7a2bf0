//! Model Context Protocol (MCP) implementation.
//!
//! Both halves of the protocol live here: the client side (`session`, `client`)
//! that talks to external servers, and the server side (`server`, `handler`,
//! `connection`) that answers the hub's own clients.
//!
//! # Architecture
//!
//! - `protocol` - Core MCP types and message definitions
//! - `transport` - Client transports (stdio, SSE, in-memory)
//! - `session` - Request correlation and the initialize handshake
//! - `client` - Typed operations over a session
//! - `handler` - Tool and resource registration for the server side
//! - `connection` - Server-side connections and the SSE connection manager
//! - `server` - MCP server implementation

pub mod client;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use handler::{McpHandler, ToolContext, ToolHandler, ToolProvider};
pub use protocol::*;
pub use server::McpServer;
pub use session::{Session, SessionOptions};
pub use transport::{Platform, Transport, TransportConfig, TransportState};
