//! JSON-RPC 2.0 wire types for the MCP protocol
//!
//! Every transport speaks the same envelope: requests carry an id and a
//! method, responses carry the same id with either a result or an error,
//! notifications carry a method and no id. `JsonRpcMessage::from_value`
//! classifies an incoming frame by exactly those fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PING: &str = "ping";
pub const NOTIFICATION_TOOLS_CHANGED: &str = "notifications/tools/list_changed";

// JSON-RPC error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;

/// A request: id + method, params optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    /// Params by reference, `Null` when absent.
    pub fn params_ref(&self) -> &Value {
        self.params.as_ref().unwrap_or(&Value::Null)
    }
}

/// A response: mirrors the request id, carries result xor error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A notification: method without an id. Never answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// One classified wire frame.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classify a frame by its fields: a non-null id plus result/error is a
    /// response, id plus method is a request, method without id is a
    /// notification. Anything else is rejected.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        use serde::de::Error;

        let obj = value
            .as_object()
            .ok_or_else(|| serde_json::Error::custom("frame is not a JSON object"))?;

        let has_id = obj.get("id").map(|id| !id.is_null()).unwrap_or(false);
        let has_method = obj.contains_key("method");
        let has_outcome = obj.contains_key("result") || obj.contains_key("error");

        if has_id && has_outcome {
            return Ok(Self::Response(serde_json::from_value(value)?));
        }
        if has_id && has_method {
            return Ok(Self::Request(serde_json::from_value(value)?));
        }
        if has_method {
            return Ok(Self::Notification(serde_json::from_value(value)?));
        }
        Err(serde_json::Error::custom(
            "frame is neither request, response nor notification",
        ))
    }
}

/// A tool as advertised by a backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Params for the MCP `initialize` request this gateway sends upstream.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": "mcpd",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Pull tool definitions out of a `tools/list` result; tolerant of missing
/// or oddly-shaped entries, which are skipped.
pub fn parse_tools_result(result: &Value) -> Vec<ToolDefinition> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
