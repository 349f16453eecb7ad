//! Transport abstraction for MCP communication.
//!
//! A [`Transport`] carries newline-delimited JSON-RPC 2.0 frames between
//! this process and one MCP server, and delivers every reply to the exact
//! pending request that produced it. The subprocess implementation lives in
//! [`crate::stdio`]; the in-memory variant here routes requests straight to
//! an in-process protocol handler and exists so that clients, the registry,
//! and deadline behavior can be tested without spawning anything.
//!
//! All methods take `&self`: requests may be issued concurrently from any
//! number of callers, so implementations guard their mutable state
//! internally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{McpError, Result};
use crate::protocol::McpProtocol;
use crate::types::{McpRequest, McpResponse};

/// Carrier of framed JSON-RPC messages between host and server.
///
/// Thread safety: implementations must be `Send + Sync`; any number of
/// callers may `send` concurrently, each awaiting its own reply.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection.
    ///
    /// For subprocess transports this spawns the server and starts the
    /// background reader; success requires a running process but no
    /// protocol handshake. Fails with `TransportStart`.
    async fn start(&self) -> Result<()>;

    /// Tear the connection down.
    ///
    /// Fails all pending requests with `Closed`. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Send a request and await its correlated response.
    ///
    /// `timeout` overrides the transport's default deadline for this call.
    /// Notifications (requests without an id) are written best-effort and
    /// return a synthesized empty-result response immediately; the receiver
    /// is not required to reply and a missing reply is not an error.
    ///
    /// Error conditions:
    /// - `Timeout`: the effective deadline elapsed
    /// - `Closed`: the transport stopped while waiting
    /// - `Json`: the request could not be serialized
    async fn send(&self, request: McpRequest, timeout: Option<Duration>) -> Result<McpResponse>;

    /// True between a successful `start` and any subsequent `stop` or
    /// reader-detected EOF. Pure state inspection, never suspends.
    fn is_connected(&self) -> bool;
}

/// In-memory transport for tests and local development.
///
/// Routes requests synchronously to an [`McpProtocol`] handler without a
/// subprocess. The per-call deadline is still enforced, so timeout behavior
/// can be exercised against a deliberately slow tool handler.
pub struct InMemoryTransport {
    protocol: Arc<McpProtocol>,
    timeout: Duration,
    connected: AtomicBool,
}

impl InMemoryTransport {
    /// Wrap a protocol handler with the default 30 s deadline.
    pub fn new(protocol: Arc<McpProtocol>) -> Self {
        Self::with_timeout(protocol, Duration::from_secs(30))
    }

    pub fn with_timeout(protocol: Arc<McpProtocol>, timeout: Duration) -> Self {
        Self {
            protocol,
            timeout,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, request: McpRequest, timeout: Option<Duration>) -> Result<McpResponse> {
        if !self.is_connected() {
            return Err(McpError::Closed("transport not connected".to_string()));
        }

        if request.is_notification() {
            // Handled for effect only; the reply is synthesized.
            let _ = self.protocol.handle_request(request).await;
            return Ok(McpResponse::success(None, serde_json::json!({})));
        }

        let method = request.method.clone();
        let deadline = timeout.unwrap_or(self.timeout);
        tokio::time::timeout(deadline, self.protocol.handle_request(request))
            .await
            .map_err(|_| McpError::Timeout(format!("request timed out: {method}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
