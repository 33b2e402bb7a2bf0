//! MCP Hub - a bidirectional Model Context Protocol runtime.
//!
//! The hub acts as an MCP **client** towards any number of external servers
//! (stdio child processes or SSE endpoints) and as an MCP **server** towards its
//! own clients (stdio or HTTP/SSE). External tools are merged with the hub's
//! internal tools in one registry and served under a single namespace.
//!
//! # Architecture
//!
//! 1. **Protocol** (`mcp::protocol`) - JSON-RPC 2.0 and MCP message types
//! 2. **Transports** (`mcp::transport`) - stdio, SSE and in-memory byte carriers
//! 3. **Session** (`mcp::session`) - request/response correlation, timeouts, handshake
//! 4. **Client** (`mcp::client`) - typed MCP operations with list caching
//! 5. **Server** (`mcp::server`, `http`) - dispatch of incoming requests to handlers
//! 6. **Registry** (`registry`) - unified internal/external tool catalogue

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod registry;
pub mod tools;

pub use error::{Error, Result};

/// Crate version reported to peers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
