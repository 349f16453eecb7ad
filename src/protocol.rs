//! MCP protocol handler.
//!
//! [`McpProtocol`] owns the request-id allocation for one connection and
//! implements the MCP JSON-RPC 2.0 method surface:
//!
//! - `initialize`: connection handshake and capability exchange
//! - `initialized`: readiness notification (no reply expected)
//! - `tools/list`, `tools/call`: tool discovery and execution
//! - `resources/list`, `resources/read`: resource surface (empty defaults)
//! - `prompts/list`, `prompts/get`: prompt surface (empty defaults)
//! - `ping`: health check
//!
//! The same type serves both directions: the client uses it as a request
//! factory with monotonic ids, and the in-memory transport and reference
//! servers use `handle_request` as the receiving end. Tool-level failures
//! are carried inside the result payload (`isError: true`), never as
//! JSON-RPC errors; only an unknown method or an internal fault produces an
//! error object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::types::{
    error_codes, McpRequest, McpResponse, RequestId, ToolResult, ToolSchema,
};

/// Async handler invoked for `tools/call`; receives the raw `arguments`
/// object and returns a [`ToolResult`].
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// Box an async closure into a [`ToolHandler`].
pub fn tool_handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: ToolHandler,
}

/// MCP protocol handler for one connection.
pub struct McpProtocol {
    server_name: String,
    server_version: String,
    tools: RwLock<HashMap<String, RegisteredTool>>,
    initialized: AtomicBool,
    client_info: RwLock<Option<Value>>,
    request_id: AtomicU64,
}

impl Default for McpProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl McpProtocol {
    pub fn new() -> Self {
        Self::with_server_info(crate::MCP_CLIENT_NAME, &crate::mcp_client_version())
    }

    /// The name/version identify the server implementation when this
    /// instance answers `initialize` (in-memory and reference servers).
    pub fn with_server_info(name: &str, version: &str) -> Self {
        Self {
            server_name: name.to_string(),
            server_version: version.to_string(),
            tools: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            client_info: RwLock::new(None),
            request_id: AtomicU64::new(0),
        }
    }

    /// Allocate the next request id and build a request.
    ///
    /// Ids are strictly monotonically increasing per protocol instance,
    /// starting at 1.
    pub fn create_request(&self, method: impl Into<String>, params: Option<Value>) -> McpRequest {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst) + 1;
        McpRequest::new(RequestId::Number(id), method, params)
    }

    /// Build a notification (a request without an id).
    ///
    /// Notifications are never added to the transport's correlation table.
    pub fn create_notification(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> McpRequest {
        McpRequest::notification(method, params)
    }

    /// Register a tool under its schema name.
    pub fn register_tool(&self, schema: ToolSchema, handler: ToolHandler) {
        let name = schema.name.clone();
        let mut tools = self.tools.write().expect("tools lock poisoned");
        if tools.contains_key(&name) {
            warn!(tool = %name, "overwriting existing tool registration");
        }
        tools.insert(name.clone(), RegisteredTool { schema, handler });
        info!(tool = %name, "registered MCP tool");
    }

    /// Unregister a tool. Returns false if it was not registered.
    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = self
            .tools
            .write()
            .expect("tools lock poisoned")
            .remove(name)
            .is_some();
        if removed {
            info!(tool = %name, "unregistered MCP tool");
        }
        removed
    }

    /// Schema of a registered tool.
    pub fn tool_schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools
            .read()
            .expect("tools lock poisoned")
            .get(name)
            .map(|t| t.schema.clone())
    }

    /// Names of all registered tools.
    pub fn registered_tools(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("tools lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether an `initialize` request has been handled.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Route a request to the appropriate method handler.
    pub async fn handle_request(&self, request: McpRequest) -> McpResponse {
        let params = request.params.clone().unwrap_or_else(|| json!({}));
        debug!(method = %request.method, "handling MCP request");

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(&params),
            "initialized" => json!({}),
            "tools/list" => self.handle_tools_list(&params),
            "tools/call" => self.handle_tools_call(&params).await,
            "resources/list" => json!({ "resources": [] }),
            "resources/read" => json!({ "contents": [] }),
            "prompts/list" => json!({ "prompts": [] }),
            "prompts/get" => json!({ "messages": [] }),
            "ping" => json!({}),
            other => {
                return McpResponse::error_response(
                    request.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                    None,
                );
            }
        };

        McpResponse::success(request.id, result)
    }

    fn handle_initialize(&self, params: &Value) -> Value {
        let client_info = params.get("clientInfo").cloned();
        let client_version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(client = ?client_info, protocol = %client_version, "MCP initialize");

        *self.client_info.write().expect("client_info lock poisoned") = client_info;
        self.initialized.store(true, Ordering::SeqCst);

        json!({
            "protocolVersion": crate::MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": false, "listChanged": false },
                "prompts": { "listChanged": false },
                "logging": {},
            },
            "serverInfo": {
                "name": self.server_name,
                "version": self.server_version,
            },
        })
    }

    fn handle_tools_list(&self, params: &Value) -> Value {
        let tools: Vec<Value> = self
            .tools
            .read()
            .expect("tools lock poisoned")
            .values()
            .map(|t| t.schema.to_mcp_format())
            .collect();

        let mut result = json!({ "tools": tools });
        // A cursor is accepted but there is no paging; signal the end.
        if params.get("cursor").is_some() {
            result
                .as_object_mut()
                .expect("literal object")
                .insert("nextCursor".to_string(), Value::Null);
        }
        result
    }

    async fn handle_tools_call(&self, params: &Value) -> Value {
        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            return ToolResult::failure("Tool name is required").to_mcp_format();
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let handler = {
            let tools = self.tools.read().expect("tools lock poisoned");
            match tools.get(tool_name) {
                Some(tool) => Arc::clone(&tool.handler),
                None => {
                    return ToolResult::failure(format!("Tool not found: {tool_name}"))
                        .to_mcp_format();
                }
            }
        };

        handler(arguments).await.to_mcp_format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolInputType, ToolParameter};

    fn protocol_with_echo() -> McpProtocol {
        let protocol = McpProtocol::with_server_info("test-server", "1.0.0");
        let schema = ToolSchema {
            name: "echo".to_string(),
            description: "Echo the input text".to_string(),
            parameters: vec![ToolParameter::new(
                "text",
                ToolInputType::String,
                "Text to echo back",
            )],
            returns: None,
        };
        protocol.register_tool(
            schema,
            tool_handler(|args: Value| async move {
                match args.get("text").and_then(Value::as_str) {
                    Some(text) => ToolResult::ok(text.to_string()),
                    None => ToolResult::failure("missing required argument: text"),
                }
            }),
        );
        protocol
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let protocol = McpProtocol::new();
        let first = protocol.create_request("ping", None);
        let second = protocol.create_request("ping", None);
        let third = protocol.create_request("ping", None);

        assert_eq!(first.id, Some(RequestId::Number(1)));
        assert_eq!(second.id, Some(RequestId::Number(2)));
        assert_eq!(third.id, Some(RequestId::Number(3)));
    }

    #[test]
    fn test_notification_has_no_id() {
        let protocol = McpProtocol::new();
        assert!(protocol.create_notification("initialized", None).is_notification());
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let protocol = protocol_with_echo();
        let request = protocol.create_request(
            "initialize",
            Some(json!({
                "protocolVersion": crate::MCP_PROTOCOL_VERSION,
                "clientInfo": { "name": "host", "version": "0.1" },
            })),
        );

        let response = protocol.handle_request(request).await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], crate::MCP_PROTOCOL_VERSION);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], false);
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert!(protocol.is_initialized());
    }

    #[tokio::test]
    async fn test_tools_list_contains_registered_schema() {
        let protocol = protocol_with_echo();
        let response = protocol
            .handle_request(protocol.create_request("tools/list", None))
            .await;

        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn test_tools_call_dispatches_handler() {
        let protocol = protocol_with_echo();
        let request = protocol.create_request(
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        );

        let response = protocol.handle_request(request).await;
        let result = response.result.unwrap();
        assert!(result.get("isError").is_none());
        assert_eq!(result["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_tools_call_unknown_tool_is_payload_error() {
        let protocol = protocol_with_echo();
        let request = protocol.create_request(
            "tools/call",
            Some(json!({"name": "nope", "arguments": {}})),
        );

        // Unknown tool is a tool-level error, not a JSON-RPC error.
        let response = protocol.handle_request(request).await;
        assert!(response.is_success());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Tool not found: nope");
    }

    #[tokio::test]
    async fn test_unknown_method_is_rpc_error() {
        let protocol = protocol_with_echo();
        let response = protocol
            .handle_request(protocol.create_request("tools/destroy", None))
            .await;

        assert!(!response.is_success());
        assert_eq!(response.error_code(), Some(error_codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_optional_surfaces_return_empty() {
        let protocol = McpProtocol::new();
        for (method, key) in [
            ("resources/list", "resources"),
            ("resources/read", "contents"),
            ("prompts/list", "prompts"),
            ("prompts/get", "messages"),
        ] {
            let response = protocol
                .handle_request(protocol.create_request(method, None))
                .await;
            assert_eq!(response.result.unwrap()[key], json!([]));
        }
    }

    #[test]
    fn test_unregister_tool() {
        let protocol = protocol_with_echo();
        assert!(protocol.tool_schema("echo").is_some());
        assert!(protocol.unregister_tool("echo"));
        assert!(!protocol.unregister_tool("echo"));
        assert!(protocol.registered_tools().is_empty());
    }
}
