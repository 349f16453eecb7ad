//! mcp-fleet: a host-side MCP (Model Context Protocol) client runtime.
//!
//! This library manages a fleet of long-lived MCP server subprocesses,
//! multiplexes JSON-RPC 2.0 request/response traffic over their standard
//! streams, and exposes a uniform interface for discovering and invoking
//! the tools those servers publish.
//!
//! # Architecture
//!
//! The crate is layered, leaves first:
//!
//! 1. **Types** (`types.rs`): MCP/JSON-RPC message shapes and tool schema
//!    conversion to and from the MCP wire form.
//! 2. **Transport** (`transport.rs`, `stdio.rs`): newline-delimited
//!    JSON-RPC frames over a child process's stdin/stdout, with concurrent
//!    send/receive multiplexing and request-response correlation.
//! 3. **Protocol** (`protocol.rs`): request-id allocation and the MCP
//!    method surface (initialize, tools/list, tools/call, ...).
//! 4. **Client** (`client.rs`): per-server sessions, handshake, cached
//!    tool catalog, and the `call_tool` facade.
//! 5. **Registry** (`registry.rs`): the fleet, with registration, lifecycle
//!    state machine, connect/disconnect fan-out, reconnection with
//!    exponential backoff, event emission, catalog aggregation.
//!
//! Permission evaluation (`permissions.rs`) and audit logging (`audit.rs`)
//! bracket every registry-initiated tool call. Configuration loading from
//! YAML files and environment variables lives in `config.rs`.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use mcp_fleet::{RegisteredServer, ServerRegistry};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ServerRegistry::new(3, Duration::from_secs(1));
//!     let server = RegisteredServer::new(
//!         "files",
//!         "npx",
//!         vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into()],
//!     );
//!     registry.register(server, true).await;
//!
//!     let result = registry
//!         .call_tool("read_file", Some(serde_json::json!({"path": "/etc/hosts"})), None)
//!         .await;
//!     println!("{:?}", result.content);
//!
//!     registry.shutdown().await;
//! }
//! ```

pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod stdio;
pub mod transport;
pub mod types;

// Re-export commonly used types for convenience
pub use audit::{
    AuditEvent, AuditEventType, AuditFilter, AuditLogger, AuditStorage, FileAuditStorage,
    InMemoryAuditStorage,
};
pub use client::{McpClient, ServerConfig};
pub use config::{ConfigLoader, ServerDefinition};
pub use error::{McpError, Result};
pub use permissions::{Permission, PermissionLevel, PermissionManager, PermissionPolicy};
pub use protocol::{McpProtocol, ToolHandler};
pub use registry::{CallContext, RegisteredServer, ServerRegistry, ServerStatus};
pub use stdio::StdioTransport;
pub use transport::{InMemoryTransport, Transport};
pub use types::{
    McpRequest, McpResponse, RequestId, ToolInputType, ToolParameter, ToolResult, ToolSchema,
};

/// MCP protocol version implemented by this crate.
///
/// Covers core JSON-RPC 2.0 messaging, tools (tools/list, tools/call),
/// resources, prompts, and logging capabilities.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent in `clientInfo` during the MCP handshake.
pub const MCP_CLIENT_NAME: &str = "mcp-fleet";

/// Client version sent in `clientInfo` during the MCP handshake.
pub fn mcp_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
