//! Error types for the MCP hub.

use thiserror::Error;

use crate::mcp::protocol::{error_codes, JsonRpcError};

/// Result type alias for MCP hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MCP hub.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Protocol Errors =====
    /// The peer answered with a JSON-RPC error.
    #[error("MCP error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("MCP protocol error: {0}")]
    McpProtocol(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    #[error("Session not initialized: call initialize() first")]
    NotInitialized,

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Capability not supported by server: {0}")]
    CapabilityNotSupported(String),

    // ===== Session / Transport Errors =====
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout: {method} did not complete within {millis}ms")]
    Timeout { method: String, millis: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // ===== Tool Errors =====
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool already registered: {0}")]
    ToolAlreadyRegistered(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("External server not found: {0}")]
    ServerNotFound(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ===== HTTP Errors =====
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a timeout error for a request.
    pub fn timeout(method: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            method: method.into(),
            millis,
        }
    }

    /// Check if this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error means the connection went away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::NotConnected)
    }

    /// The JSON-RPC error code carried by an `Rpc` error.
    pub fn rpc_code(&self) -> Option<i32> {
        match self {
            Self::Rpc(e) => Some(e.code),
            _ => None,
        }
    }

    /// Check if this error is retriable (transient failures).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionClosed | Self::NotConnected => true,
            Self::Rpc(e) => e.code == error_codes::RATE_LIMITED,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Convert into the JSON-RPC error payload sent back to a peer.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Rpc(e) => e.clone(),
            Self::McpProtocol(msg) => JsonRpcError::invalid_request(msg),
            Self::NotInitialized => JsonRpcError::invalid_request("connection not initialized"),
            Self::InvalidToolArguments(msg) => JsonRpcError::invalid_params(msg),
            Self::Json(e) => JsonRpcError::invalid_params(e),
            Self::ToolNotFound(name) => JsonRpcError::not_found(format!("tool {}", name)),
            Self::ServerNotFound(name) => JsonRpcError::not_found(format!("server {}", name)),
            Self::ToolExecutionFailed(msg) => {
                JsonRpcError::new(error_codes::TOOL_EXECUTION_FAILED, format!("Tool execution failed: {}", msg))
            }
            Self::ResourceNotFound(uri) => JsonRpcError::resource_not_found(uri),
            Self::Timeout { .. } | Self::ConnectionClosed | Self::Transport(_) | Self::NotConnected => {
                JsonRpcError::server_error(self)
            }
            other => JsonRpcError::internal_error(other),
        }
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Self::Rpc(err)
    }
}
