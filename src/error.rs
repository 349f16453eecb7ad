//! Error types for the MCP runtime.
//!
//! One error enum covers the whole crate. The variants map onto the
//! distinct failure phases a connection can go through: configuration
//! problems are surfaced synchronously and never retried, spawn failures
//! are eligible for reconnection, and transport failures (`Closed`,
//! `Timeout`) are what in-flight requests observe.
//!
//! `call_tool` never returns one of these to its caller; every failure
//! mode is folded into a `ToolResult` at the client boundary.

use thiserror::Error;

/// Errors produced by transports, protocol handling, and the registry.
#[derive(Debug, Error)]
pub enum McpError {
    /// Invalid server configuration: unknown transport, YAML parse
    /// failure, duplicate name, out-of-range timeout.
    ///
    /// Surfaced to the caller synchronously; never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server subprocess could not be spawned.
    ///
    /// Fatal for this connection attempt; eligible for `reconnect`.
    #[error("Transport start error: {0}")]
    TransportStart(String),

    /// The child exited or a pipe broke while a request was in flight.
    #[error("Transport closed: {0}")]
    Closed(String),

    /// A per-request deadline elapsed before the response arrived.
    ///
    /// The pending correlation entry is discarded; a late reply for the
    /// timed-out id is dropped by the reader.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// The server returned a JSON-RPC error object, or a message violated
    /// the MCP protocol (missing result, handshake failure).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation referenced a server name the registry does not know.
    #[error("Server not registered: {0}")]
    ServerNotRegistered(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, McpError>;
