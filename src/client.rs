//! MCP client: per-server sessions.
//!
//! [`McpClient`] maintains connections to multiple MCP servers and offers a
//! unified interface for tool discovery and execution. For each server it
//! owns a transport and a protocol instance, runs the initialize handshake,
//! caches the server's tool catalog, and exposes [`McpClient::call_tool`],
//! the central operation, which never fails out of band: every failure mode
//! is folded into the returned [`ToolResult`].
//!
//! The client is cheaply clonable; all state lives behind `Arc<RwLock<..>>`
//! so concurrent callers (and the registry above) share one view.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{McpError, Result};
use crate::protocol::McpProtocol;
use crate::stdio::StdioTransport;
use crate::transport::Transport;
use crate::types::{first_content_text, ToolResult, ToolSchema};

/// Static configuration for one MCP server connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub name: String,

    /// Command to execute for the server.
    pub command: String,

    /// Command arguments.
    pub args: Vec<String>,

    /// Environment variables overlaid on the host environment.
    pub env: HashMap<String, String>,

    /// Transport kind; only "stdio" is implemented.
    pub transport: String,

    /// Default timeout for operations on this server.
    pub timeout: Duration,

    /// Working directory for the server process.
    pub cwd: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: "stdio".to_string(),
            timeout: Duration::from_secs(30),
            cwd: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(McpError::Config("server name is required".to_string()));
        }
        if self.command.is_empty() {
            return Err(McpError::Config("server command is required".to_string()));
        }
        Ok(())
    }
}

/// Live state for one connected server.
#[derive(Clone)]
struct ServerSession {
    transport: Arc<dyn Transport>,
    protocol: Arc<McpProtocol>,
    tools: HashMap<String, ToolSchema>,
    server_info: Value,
}

/// Client managing sessions to multiple MCP servers.
#[derive(Clone, Default)]
pub struct McpClient {
    sessions: Arc<RwLock<HashMap<String, ServerSession>>>,
}

impl McpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to an MCP server.
    ///
    /// Runs the handshake in order: start the transport, `initialize`,
    /// `initialized` notification (errors swallowed; servers vary),
    /// `tools/list`, then record the session. Connecting an already
    /// connected name succeeds without side effects.
    ///
    /// `transport` overrides construction from the config, which is how
    /// tests wire an in-memory transport in.
    pub async fn connect(
        &self,
        config: ServerConfig,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<()> {
        config.validate()?;

        if self.sessions.read().await.contains_key(&config.name) {
            warn!(server = %config.name, "server already connected");
            return Ok(());
        }

        let transport: Arc<dyn Transport> = match transport {
            Some(t) => t,
            None => match config.transport.as_str() {
                "stdio" => Arc::new(StdioTransport::new(config.clone())),
                other => {
                    return Err(McpError::Config(format!(
                        "unsupported transport: {other}"
                    )));
                }
            },
        };

        transport.start().await?;

        let protocol = Arc::new(McpProtocol::new());

        let init_request = protocol.create_request(
            "initialize",
            Some(json!({
                "protocolVersion": crate::MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "resources": {} },
                "clientInfo": {
                    "name": crate::MCP_CLIENT_NAME,
                    "version": crate::mcp_client_version(),
                },
            })),
        );

        let response = match transport.send(init_request, None).await {
            Ok(response) => response,
            Err(e) => {
                let _ = transport.stop().await;
                return Err(e);
            }
        };

        if let Some(err) = &response.error {
            error!(server = %config.name, error = %err.message, "initialize failed");
            let _ = transport.stop().await;
            return Err(McpError::Protocol(format!(
                "initialize failed: {} (code: {})",
                err.message, err.code
            )));
        }

        let server_info = response.result.unwrap_or_else(|| json!({}));

        // Some servers never reply to the initialized notification; any
        // transport error here is non-fatal.
        let initialized = protocol.create_notification("initialized", None);
        if let Err(e) = transport.send(initialized, None).await {
            debug!(server = %config.name, error = %e, "initialized notification not acknowledged");
        }

        let tools_request = protocol.create_request("tools/list", Some(json!({})));
        let tools_response = match transport.send(tools_request, None).await {
            Ok(response) => response,
            Err(e) => {
                let _ = transport.stop().await;
                return Err(e);
            }
        };

        let mut tools = HashMap::new();
        if let Some(list) = tools_response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
        {
            for tool_data in list {
                let schema = ToolSchema::from_mcp_format(tool_data);
                tools.insert(schema.name.clone(), schema);
            }
        }

        let tool_count = tools.len();
        let session = ServerSession {
            transport: Arc::clone(&transport),
            protocol,
            tools,
            server_info,
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&config.name) {
            // Lost a connect race; keep the existing session.
            drop(sessions);
            let _ = transport.stop().await;
            return Ok(());
        }
        sessions.insert(config.name.clone(), session);
        drop(sessions);

        info!(server = %config.name, tools = tool_count, "connected to MCP server");
        Ok(())
    }

    /// Disconnect from a server and drop its state.
    ///
    /// Idempotent: disconnecting an unknown name succeeds without change.
    pub async fn disconnect(&self, server_name: &str) -> Result<()> {
        let session = self.sessions.write().await.remove(server_name);
        match session {
            Some(session) => {
                session.transport.stop().await?;
                info!(server = %server_name, "disconnected from MCP server");
            }
            None => debug!(server = %server_name, "server not connected"),
        }
        Ok(())
    }

    /// List cached tool catalogs, optionally refreshing from the servers
    /// first by re-issuing `tools/list`.
    pub async fn list_tools(
        &self,
        server_name: Option<&str>,
        refresh: bool,
    ) -> HashMap<String, Vec<ToolSchema>> {
        if refresh {
            self.refresh_tools(server_name).await;
        }

        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(name, _)| server_name.map_or(true, |wanted| wanted == name.as_str()))
            .map(|(name, session)| (name.clone(), session.tools.values().cloned().collect()))
            .collect()
    }

    async fn refresh_tools(&self, server_name: Option<&str>) {
        let targets: Vec<(String, Arc<dyn Transport>, Arc<McpProtocol>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(name, _)| server_name.map_or(true, |wanted| wanted == name.as_str()))
                .map(|(name, s)| (name.clone(), Arc::clone(&s.transport), Arc::clone(&s.protocol)))
                .collect()
        };

        for (name, transport, protocol) in targets {
            let request = protocol.create_request("tools/list", Some(json!({})));
            match transport.send(request, None).await {
                Ok(response) => {
                    let Some(list) = response
                        .result
                        .as_ref()
                        .and_then(|r| r.get("tools"))
                        .and_then(Value::as_array)
                    else {
                        continue;
                    };
                    let mut tools = HashMap::new();
                    for tool_data in list {
                        let schema = ToolSchema::from_mcp_format(tool_data);
                        tools.insert(schema.name.clone(), schema);
                    }
                    if let Some(session) = self.sessions.write().await.get_mut(&name) {
                        session.tools = tools;
                    }
                }
                Err(e) => error!(server = %name, error = %e, "failed to refresh tools"),
            }
        }
    }

    /// Schema of a specific cached tool.
    pub async fn tool_schema(&self, server: &str, tool: &str) -> Option<ToolSchema> {
        self.sessions
            .read()
            .await
            .get(server)
            .and_then(|s| s.tools.get(tool).cloned())
    }

    /// Call a tool on a connected server.
    ///
    /// Never fails out of band: unknown server, unknown tool, transport
    /// failures, JSON-RPC errors, and tool-level `isError` results all come
    /// back as `ToolResult { success: false, .. }`. The result metadata
    /// carries the server and tool names.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(server) {
                Some(session) => session.clone(),
                None => {
                    return ToolResult::failure(format!("Server not connected: {server}"));
                }
            }
        };

        if !session.tools.contains_key(tool) {
            return ToolResult::failure(format!("Tool not found: {server}/{tool}"));
        }

        let request = session.protocol.create_request(
            "tools/call",
            Some(json!({
                "name": tool,
                "arguments": arguments.unwrap_or_else(|| json!({})),
            })),
        );

        let response = match session.transport.send(request, timeout).await {
            Ok(response) => response,
            Err(e) => {
                error!(server = %server, tool = %tool, error = %e, "tool call failed");
                return ToolResult::failure(e.to_string()).with_metadata(server, tool);
            }
        };

        if let Some(err) = &response.error {
            return ToolResult::failure(err.message.clone()).with_metadata(server, tool);
        }

        let result = response.result.unwrap_or_else(|| json!({}));

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let text =
                first_content_text(&result).unwrap_or_else(|| "Unknown error".to_string());
            return ToolResult::failure(text).with_metadata(server, tool);
        }

        let content = first_content_text(&result).unwrap_or_default();
        ToolResult::ok(content).with_metadata(server, tool)
    }

    /// Whether a server has a live session.
    pub async fn is_connected(&self, server_name: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(server_name)
            .map(|s| s.transport.is_connected())
            .unwrap_or(false)
    }

    /// Names of connected servers.
    pub async fn connected_servers(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// The `initialize` result stored for a server.
    pub async fn server_info(&self, server_name: &str) -> Option<Value> {
        self.sessions
            .read()
            .await
            .get(server_name)
            .map(|s| s.server_info.clone())
    }

    /// Disconnect every server.
    pub async fn close(&self) {
        let names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                warn!(server = %name, error = %e, "error during disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tool_handler;
    use crate::transport::InMemoryTransport;
    use crate::types::{ToolInputType, ToolParameter};

    fn echo_transport() -> Arc<dyn Transport> {
        let protocol = McpProtocol::with_server_info("echo-server", "1.0.0");
        protocol.register_tool(
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo the input text".to_string(),
                parameters: vec![ToolParameter::new(
                    "text",
                    ToolInputType::String,
                    "Text to echo back",
                )],
                returns: None,
            },
            tool_handler(|args: Value| async move {
                match args.get("text").and_then(Value::as_str) {
                    Some(text) => ToolResult::ok(text.to_string()),
                    None => ToolResult::failure("missing required argument: text"),
                }
            }),
        );
        Arc::new(InMemoryTransport::new(Arc::new(protocol)))
    }

    #[tokio::test]
    async fn test_connect_populates_catalog() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();

        assert!(client.is_connected("s1").await);
        let tools = client.list_tools(Some("s1"), false).await;
        assert_eq!(tools["s1"].len(), 1);
        assert_eq!(tools["s1"][0].name, "echo");

        let info = client.server_info("s1").await.unwrap();
        assert_eq!(info["serverInfo"]["name"], "echo-server");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();
        assert_eq!(client.connected_servers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transport_kind() {
        let client = McpClient::new();
        let mut config = ServerConfig::new("s1", "server");
        config.transport = "websocket".to_string();

        let result = client.connect(config, None).await;
        assert!(matches!(result, Err(McpError::Config(_))));
    }

    #[tokio::test]
    async fn test_call_tool_success() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();

        let result = client
            .call_tool("s1", "echo", Some(json!({"text": "hi"})), None)
            .await;
        assert!(result.success);
        assert_eq!(result.content, json!("hi"));
        assert_eq!(result.metadata["server"], json!("s1"));
        assert_eq!(result.metadata["tool"], json!("echo"));
    }

    #[tokio::test]
    async fn test_call_tool_server_not_connected() {
        let client = McpClient::new();
        let result = client.call_tool("ghost", "echo", None, None).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Server not connected: ghost"));
    }

    #[tokio::test]
    async fn test_call_tool_unknown_tool() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();

        let result = client.call_tool("s1", "nope", None, None).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Tool not found: s1/nope"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();

        client.disconnect("s1").await.unwrap();
        client.disconnect("s1").await.unwrap();
        assert!(!client.is_connected("s1").await);
    }

    #[tokio::test]
    async fn test_close_disconnects_all() {
        let client = McpClient::new();
        client
            .connect(ServerConfig::new("s1", "unused"), Some(echo_transport()))
            .await
            .unwrap();
        client
            .connect(ServerConfig::new("s2", "unused"), Some(echo_transport()))
            .await
            .unwrap();

        client.close().await;
        assert!(client.connected_servers().await.is_empty());
    }
}
