//! Gateway client: the only surface callers touch.
//!
//! Builds JSON-RPC requests, hands them to the supervisor task, and turns
//! responses into plain results. Transport details (process or socket,
//! restarts, port changes) stay behind this type.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::supervisor::{Command, Supervisor, SupervisorStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};

/// A tool advertised by the server. Fields beyond the ones named here are
/// kept as-is in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

/// Client for one tool server.
///
/// `new` spawns the supervisor task, so it must be called from within a
/// tokio runtime. Dropping the client shuts the server down.
pub struct GatewayClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SupervisorStatus>,
    next_id: AtomicU64,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let (commands, commands_rx) = mpsc::channel(64);
        let (supervisor, status) = Supervisor::new(Arc::new(config), commands_rx);
        tokio::spawn(supervisor.run());

        Self {
            commands,
            status,
            next_id: AtomicU64::new(1),
        }
    }

    /// Establish the transport and wait until the server is ready.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .await
            .map_err(|_| GatewayError::Stopped)?;
        rx.await.map_err(|_| GatewayError::Stopped)?
    }

    /// List the tools the server exposes.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let resp = self.request("tools/list", serde_json::json!({})).await?;
        interpret_tools_list(resp)
    }

    /// Invoke a tool by name.
    ///
    /// Tool-reported failures come back as [`GatewayError::ToolFailed`]; a
    /// structured result nested in the text content is unwrapped.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let resp = self.request("tools/call", params).await?;
        interpret_tool_call(resp)
    }

    /// Stop the server. Safe to call any number of times.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current supervisor state.
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Watch supervisor state changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    async fn request(&self, method: &str, params: Value) -> Result<JsonRpcResponse, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = JsonRpcRequest::new(id, method, params);

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call { request, reply })
            .await
            .map_err(|_| GatewayError::Stopped)?;
        rx.await.map_err(|_| GatewayError::Stopped)?
    }
}

/// Turn a `tools/list` response into tool descriptors.
pub fn interpret_tools_list(resp: JsonRpcResponse) -> Result<Vec<ToolDescriptor>, GatewayError> {
    if !resp.is_valid() {
        return Err(GatewayError::InvalidResponse(
            "tools/list response has neither result nor error".to_string(),
        ));
    }
    if let Some(result) = resp.result {
        let list: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            GatewayError::InvalidResponse(format!("Failed to parse tools/list result: {e}"))
        })?;
        return Ok(list.tools);
    }
    match resp.error {
        Some(err) => Err(GatewayError::JsonRpc {
            code: err.code,
            message: err.message,
        }),
        None => Err(GatewayError::InvalidResponse(
            "tools/list response has neither result nor error".to_string(),
        )),
    }
}

/// Turn a `tools/call` response into a value.
///
/// Checked in order: an error-flagged content entry, a JSON-RPC error, a
/// content entry whose text is JSON wrapping a single result object, and
/// finally the raw result.
pub fn interpret_tool_call(resp: JsonRpcResponse) -> Result<Value, GatewayError> {
    if !resp.is_valid() {
        return Err(GatewayError::InvalidResponse(
            "tools/call response has neither result nor error".to_string(),
        ));
    }
    if let Some(result) = &resp.result {
        if let Some(message) = tool_error_text(result) {
            return Err(GatewayError::ToolFailed(message));
        }
    }

    if let Some(err) = resp.error {
        return Err(GatewayError::JsonRpc {
            code: err.code,
            message: err.message,
        });
    }

    let Some(result) = resp.result else {
        return Err(GatewayError::InvalidResponse(
            "tools/call response has neither result nor error".to_string(),
        ));
    };

    let nested = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("text").and_then(Value::as_str))
                .find_map(nested_result)
        });

    Ok(nested.unwrap_or(result))
}

const GENERIC_TOOL_ERROR: &str = "Tool reported an error";

/// The failure message if the result reports a tool-level error.
fn tool_error_text(result: &Value) -> Option<String> {
    let entries = result.get("content").and_then(Value::as_array);

    if let Some(entries) = entries {
        let flagged = entries
            .iter()
            .find(|e| e.get("isError").and_then(Value::as_bool) == Some(true));
        if let Some(entry) = flagged {
            return Some(
                entry
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or(GENERIC_TOOL_ERROR)
                    .to_string(),
            );
        }
    }

    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }

    let text = entries
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if text.is_empty() {
        Some(GENERIC_TOOL_ERROR.to_string())
    } else {
        Some(text)
    }
}

/// `{"key": {...}}` → `{...}`.
fn nested_result(text: &str) -> Option<Value> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    map.into_iter()
        .next()
        .map(|(_, value)| value)
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::JsonRpcError;

    fn ok(result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            id: "1".to_string(),
            result: Some(result),
            error: None,
        }
    }

    fn err(code: i64, message: &str) -> JsonRpcResponse {
        JsonRpcResponse {
            id: "1".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    fn empty() -> JsonRpcResponse {
        JsonRpcResponse {
            id: "1".to_string(),
            result: None,
            error: None,
        }
    }

    #[test]
    fn deserialize_tool_descriptor_keeps_unknown_fields() {
        let json = r#"{
            "name": "post_message",
            "description": "Post a message",
            "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}},
            "annotations": {"readOnlyHint": false}
        }"#;
        let tool: ToolDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "post_message");
        assert_eq!(tool.description.as_deref(), Some("Post a message"));
        assert_eq!(tool.input_schema["properties"]["text"]["type"], "string");
        assert_eq!(tool.extra["annotations"]["readOnlyHint"], false);

        let back = serde_json::to_value(&tool).unwrap();
        assert_eq!(back["annotations"]["readOnlyHint"], false);
        assert_eq!(back["inputSchema"]["type"], "object");
    }

    #[test]
    fn tools_list_result() {
        let tools = interpret_tools_list(ok(serde_json::json!({
            "tools": [
                {"name": "a", "inputSchema": {"type": "object"}},
                {"name": "b"}
            ]
        })))
        .unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "a");
        assert!(tools[1].description.is_none());
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[test]
    fn tools_list_error_uses_message() {
        match interpret_tools_list(err(-32601, "Method not found")) {
            Err(GatewayError::JsonRpc { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("Expected JsonRpc error, got {other:?}"),
        }
    }

    #[test]
    fn tools_list_without_result_or_error_is_invalid() {
        assert!(matches!(
            interpret_tools_list(empty()),
            Err(GatewayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn tool_call_unwraps_nested_result() {
        let resp = ok(serde_json::json!({
            "content": [{"type": "text", "text": "{\"tweet\":{\"id\":\"123\"}}"}]
        }));
        assert_eq!(
            interpret_tool_call(resp).unwrap(),
            serde_json::json!({"id": "123"})
        );
    }

    #[test]
    fn tool_call_flagged_entry_rejects_with_text() {
        let resp = ok(serde_json::json!({
            "content": [{"isError": true, "text": "rate limited"}]
        }));
        match interpret_tool_call(resp) {
            Err(GatewayError::ToolFailed(msg)) => assert_eq!(msg, "rate limited"),
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_result_level_error_flag() {
        let resp = ok(serde_json::json!({
            "content": [{"type": "text", "text": "not found"}],
            "isError": true
        }));
        match interpret_tool_call(resp) {
            Err(GatewayError::ToolFailed(msg)) => assert_eq!(msg, "not found"),
            other => panic!("Expected ToolFailed, got {other:?}"),
        }

        let bare = ok(serde_json::json!({"isError": true}));
        match interpret_tool_call(bare) {
            Err(GatewayError::ToolFailed(msg)) => assert_eq!(msg, GENERIC_TOOL_ERROR),
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_top_level_error() {
        match interpret_tool_call(err(-32000, "upstream unavailable")) {
            Err(GatewayError::JsonRpc { message, .. }) => {
                assert_eq!(message, "upstream unavailable")
            }
            other => panic!("Expected JsonRpc error, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_plain_text_returns_raw_result() {
        let raw = serde_json::json!({"content": [{"type": "text", "text": "done"}]});
        assert_eq!(interpret_tool_call(ok(raw.clone())).unwrap(), raw);
    }

    #[test]
    fn tool_call_json_text_without_single_nested_object_returns_raw() {
        let raw = serde_json::json!({
            "content": [{"type": "text", "text": "{\"a\":1,\"b\":{\"c\":2}}"}]
        });
        assert_eq!(interpret_tool_call(ok(raw.clone())).unwrap(), raw);

        let scalar = serde_json::json!({
            "content": [{"type": "text", "text": "{\"count\":3}"}]
        });
        assert_eq!(interpret_tool_call(ok(scalar.clone())).unwrap(), scalar);
    }

    #[test]
    fn tool_call_without_result_or_error_is_invalid() {
        assert!(matches!(
            interpret_tool_call(empty()),
            Err(GatewayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn gateway_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayClient>();
    }
}
