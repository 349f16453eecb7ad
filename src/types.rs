//! Core MCP message types.
//!
//! Defines the JSON-RPC 2.0 request/response shapes and the tool schema
//! model used across the crate, with lossless conversion to and from the
//! MCP wire form.
//!
//! Wire reference:
//! - MCP specification: <https://modelcontextprotocol.io/>
//! - JSON-RPC 2.0: <https://www.jsonrpc.org/specification>

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tool parameter types, following JSON Schema primitive tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolInputType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl ToolInputType {
    /// JSON Schema tag for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }

    /// Parse a JSON Schema type tag, falling back to `String` for anything
    /// unrecognized so that foreign schemas never fail to decode.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            "null" => Self::Null,
            _ => Self::String,
        }
    }
}

/// Definition of a single tool parameter.
///
/// Round-trips losslessly to the `inputSchema.properties[name]` fragment
/// of the MCP tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name.
    pub name: String,

    /// Parameter type.
    #[serde(rename = "type")]
    pub param_type: ToolInputType,

    /// Human-readable description.
    pub description: String,

    /// Whether the parameter is required.
    pub required: bool,

    /// Default value if not provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// List of allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_values: Option<Vec<String>>,

    /// For array types, the type of items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,

    /// For object types, nested properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl ToolParameter {
    /// Create a required parameter with no extras.
    pub fn new(
        name: impl Into<String>,
        param_type: ToolInputType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
            items: None,
            properties: None,
        }
    }

    /// Mark the parameter optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Convert to the JSON Schema fragment placed under
    /// `inputSchema.properties[name]`.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = json!({
            "type": self.param_type.as_str(),
            "description": self.description,
        });
        let obj = schema.as_object_mut().expect("literal object");

        if let Some(default) = &self.default {
            obj.insert("default".to_string(), default.clone());
        }
        if let Some(enum_values) = &self.enum_values {
            obj.insert("enum".to_string(), json!(enum_values));
        }
        if let Some(items) = &self.items {
            obj.insert("items".to_string(), items.clone());
        }
        if let Some(properties) = &self.properties {
            obj.insert("properties".to_string(), properties.clone());
        }

        schema
    }
}

/// MCP tool schema definition.
///
/// The canonical wire form is
/// `{ name, description, inputSchema: { type: "object", properties, required } }`
/// where `required` lists the names of required parameters and is omitted
/// when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier within its server.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// Input parameters.
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,

    /// Description of what the tool returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

impl ToolSchema {
    /// Convert to the MCP wire form.
    pub fn to_mcp_format(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            properties.insert(param.name.clone(), param.to_json_schema());
            if param.required {
                required.push(param.name.clone());
            }
        }

        let mut input_schema = json!({
            "type": "object",
            "properties": Value::Object(properties),
        });
        if !required.is_empty() {
            input_schema
                .as_object_mut()
                .expect("literal object")
                .insert("required".to_string(), json!(required));
        }

        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": input_schema,
        })
    }

    /// Build a `ToolSchema` from the MCP wire form.
    ///
    /// Tolerant of foreign schemas: missing fields default to empty and
    /// unknown parameter types decode as `string`.
    pub fn from_mcp_format(data: &Value) -> Self {
        let input_schema = data.get("inputSchema");
        let required: Vec<&str> = input_schema
            .and_then(|s| s.get("required"))
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut parameters = Vec::new();
        if let Some(properties) = input_schema
            .and_then(|s| s.get("properties"))
            .and_then(Value::as_object)
        {
            for (name, prop) in properties {
                parameters.push(ToolParameter {
                    name: name.clone(),
                    param_type: ToolInputType::from_wire(
                        prop.get("type").and_then(Value::as_str).unwrap_or("string"),
                    ),
                    description: prop
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    required: required.contains(&name.as_str()),
                    default: prop.get("default").cloned(),
                    enum_values: prop.get("enum").and_then(Value::as_array).map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    }),
                    items: prop.get("items").cloned(),
                    properties: prop.get("properties").cloned(),
                });
            }
        }

        Self {
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description: data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parameters,
            returns: None,
        }
    }
}

/// Result of a tool execution.
///
/// This is the caller-facing shape: tool-level failures (`isError` on the
/// wire) become `success: false` here, never an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the execution was successful.
    pub success: bool,

    /// The result content.
    pub content: Value,

    /// Error message if execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Additional metadata about the execution (server, tool, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ToolResult {
    /// Successful result with the given content.
    pub fn ok(content: impl Into<Value>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Failed result with the given error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: Value::Null,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    /// Attach server/tool metadata.
    pub fn with_metadata(mut self, server: &str, tool: &str) -> Self {
        self.metadata
            .insert("server".to_string(), json!(server));
        self.metadata.insert("tool".to_string(), json!(tool));
        self
    }

    /// Convert to the MCP wire form.
    ///
    /// Success: `{ content: [{type:"text", text}] }`, where non-string
    /// content is serialized as JSON with 2-space indentation. Failure:
    /// `{ isError: true, content: [{type:"text", text:<error>}] }`.
    pub fn to_mcp_format(&self) -> Value {
        if self.success {
            let text = match &self.content {
                Value::String(s) => s.clone(),
                v @ (Value::Object(_) | Value::Array(_)) => {
                    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
                }
                v => v.to_string(),
            };
            json!({ "content": [{"type": "text", "text": text}] })
        } else {
            let text = self.error.as_deref().unwrap_or("Unknown error");
            json!({ "isError": true, "content": [{"type": "text", "text": text}] })
        }
    }

    /// Build a `ToolResult` from the MCP wire form.
    ///
    /// The first content entry's `text` is taken; on `isError` it becomes
    /// the error message, otherwise the content.
    pub fn from_mcp_format(data: &Value) -> Self {
        let is_error = data
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = first_content_text(data).unwrap_or_default();

        if is_error {
            Self::failure(text)
        } else {
            Self::ok(text)
        }
    }
}

/// Extract the first content entry's `text` from a tools/call payload.
pub(crate) fn first_content_text(data: &Value) -> Option<String> {
    let first = data.get("content")?.as_array()?.first()?;
    if first.is_object() {
        Some(
            first
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )
    } else {
        Some(first.to_string())
    }
}

/// JSON-RPC request/response identifier.
///
/// JSON-RPC allows ids to be numbers or strings; numbers are used for the
/// sequential ids this crate allocates, strings are accepted from peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// MCP JSON-RPC 2.0 request.
///
/// A request with `id: None` is a **notification**: it is omitted from the
/// wire frame, the sender does not wait for a reply, and the receiver does
/// not produce one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    /// JSON-RPC version, always "2.0".
    pub jsonrpc: String,

    /// Request identifier; `None` marks a notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    /// Method name to invoke.
    pub method: String,

    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Request without an id; the transport will not wait for a reply.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP JSON-RPC 2.0 response.
///
/// Exactly one of `result`/`error` is present on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    /// JSON-RPC version, always "2.0".
    pub jsonrpc: String,

    /// Request identifier, matching the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    /// Success result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpErrorObject>,
}

impl McpResponse {
    /// Successful response carrying `result`.
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response with the given code and message.
    pub fn error_response(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(McpErrorObject {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_schema() -> ToolSchema {
        ToolSchema {
            name: "echo".to_string(),
            description: "Echo the input text".to_string(),
            parameters: vec![ToolParameter::new(
                "text",
                ToolInputType::String,
                "Text to echo back",
            )],
            returns: Some("The same text".to_string()),
        }
    }

    #[test]
    fn test_tool_schema_wire_form() {
        let wire = echo_schema().to_mcp_format();
        assert_eq!(wire["name"], "echo");
        assert_eq!(wire["inputSchema"]["type"], "object");
        assert_eq!(wire["inputSchema"]["properties"]["text"]["type"], "string");
        assert_eq!(wire["inputSchema"]["required"], serde_json::json!(["text"]));
    }

    #[test]
    fn test_tool_schema_required_omitted_when_empty() {
        let mut schema = echo_schema();
        schema.parameters[0].required = false;
        let wire = schema.to_mcp_format();
        assert!(wire["inputSchema"].get("required").is_none());
    }

    #[test]
    fn test_tool_schema_round_trip() {
        let schema = echo_schema();
        let round_tripped = ToolSchema::from_mcp_format(&schema.to_mcp_format());

        assert_eq!(round_tripped.name, schema.name);
        assert_eq!(round_tripped.description, schema.description);
        assert_eq!(round_tripped.parameters.len(), 1);
        let param = &round_tripped.parameters[0];
        assert_eq!(param.name, "text");
        assert_eq!(param.param_type, ToolInputType::String);
        assert!(param.required);
        assert_eq!(param.description, "Text to echo back");
    }

    #[test]
    fn test_unknown_param_type_decodes_as_string() {
        let wire = serde_json::json!({
            "name": "t",
            "description": "",
            "inputSchema": {
                "type": "object",
                "properties": { "x": { "type": "tuple" } }
            }
        });
        let schema = ToolSchema::from_mcp_format(&wire);
        assert_eq!(schema.parameters[0].param_type, ToolInputType::String);
    }

    #[test]
    fn test_tool_result_success_wire_form() {
        let wire = ToolResult::ok("hello").to_mcp_format();
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][0]["text"], "hello");
        assert!(wire.get("isError").is_none());
    }

    #[test]
    fn test_tool_result_object_content_serialized_pretty() {
        let wire = ToolResult::ok(serde_json::json!({"a": 1})).to_mcp_format();
        let text = wire["content"][0]["text"].as_str().unwrap();
        assert_eq!(text, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_tool_result_error_wire_form() {
        let wire = ToolResult::failure("boom").to_mcp_format();
        assert_eq!(wire["isError"], true);
        assert_eq!(wire["content"][0]["text"], "boom");
    }

    #[test]
    fn test_tool_result_from_wire() {
        let ok = ToolResult::from_mcp_format(&serde_json::json!({
            "content": [{"type": "text", "text": "out"}]
        }));
        assert!(ok.success);
        assert_eq!(ok.content, serde_json::json!("out"));

        let err = ToolResult::from_mcp_format(&serde_json::json!({
            "isError": true,
            "content": [{"type": "text", "text": "bad"}]
        }));
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("bad"));
    }

    #[test]
    fn test_request_id_serialization() {
        assert_eq!(
            serde_json::to_string(&RequestId::Number(42)).unwrap(),
            "42"
        );
        assert_eq!(
            serde_json::to_string(&RequestId::String("req-1".to_string())).unwrap(),
            r#""req-1""#
        );
    }

    #[test]
    fn test_request_round_trip_identity() {
        let request = McpRequest::new(
            RequestId::Number(7),
            "tools/call",
            Some(serde_json::json!({"name": "echo"})),
        );
        let value = serde_json::to_value(&request).unwrap();
        let back: McpRequest = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), value);
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn test_notification_omits_id() {
        let notification = McpRequest::notification("initialized", None);
        let value = serde_json::to_value(&notification).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());

        let back: McpRequest = serde_json::from_value(value).unwrap();
        assert!(back.is_notification());
    }

    #[test]
    fn test_response_round_trip_identity() {
        let response = McpResponse::error_response(
            Some(RequestId::Number(3)),
            error_codes::METHOD_NOT_FOUND,
            "Method not found: foo",
            None,
        );
        let value = serde_json::to_value(&response).unwrap();
        let back: McpResponse = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), value);
        assert_eq!(back.error_code(), Some(-32601));
        assert!(!back.is_success());
    }
}
