/// JSON-RPC 2.0 Message Model
///
/// JSON-RPC is inherently dynamic: a single message may be a request, a
/// response, a notification, or an error. Rather than carry a generic
/// `serde_json::Value` everywhere, `Message` is a tagged sum over the four
/// shapes the proxy actually needs to distinguish, and only the fields the
/// proxy inspects (`id`, `method`, `params`, `result`, `error`) are named —
/// everything else round-trips through the embedded `serde_json::Value`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSON-RPC 2.0 message in any of its four shapes.
///
/// Deserialization picks the variant by field presence: a message with an
/// `id` and no `result`/`error` is a `Request`; with `result` or `error` is
/// a `Response`; without an `id` is a `Notification`. This mirrors how real
/// MCP traffic is actually framed — the wire format does not tag the
/// variant explicitly.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Not part of the wire format: back-filled by the proxy from the
    /// matching request when a response arrives with no `method` of its
    /// own, per data-model invariant (b).
    #[serde(skip)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC error code for a proxy-level block surfaced as an error object
/// (used on the HTTP transport) rather than as a blocked-content result.
pub const BLOCKED_ERROR_CODE: i32 = -32000;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const PARSE_ERROR: i32 = -32700;

impl Message {
    /// Parse a raw JSON-RPC line/body into a `Message`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let has_id = value.get("id").is_some_and(|v| !v.is_null());
        let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();
        if has_result_or_error {
            let resp: Response = serde_json::from_value(value)?;
            Ok(Message::Response(resp))
        } else if has_id {
            let req: Request = serde_json::from_value(value)?;
            Ok(Message::Request(req))
        } else {
            let note: Notification = serde_json::from_value(value)?;
            Ok(Message::Notification(note))
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Message::Response(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Message::Notification(n) => serde_json::to_value(n).unwrap_or(Value::Null),
        }
    }

    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(r.method.as_str()),
            Message::Notification(n) => Some(n.method.as_str()),
            Message::Response(r) => r.method.as_deref(),
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request(r) => r.params.as_ref(),
            Message::Notification(n) => n.params.as_ref(),
            Message::Response(_) => None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.method() == Some("tools/call")
    }

    pub fn is_tools_list(&self) -> bool {
        self.method() == Some("tools/list")
    }

    /// The tool name for a `tools/call` request, if present.
    pub fn tool_name(&self) -> Option<&str> {
        self.params()?.get("name")?.as_str()
    }

    /// Build a blocked-content result response for the given reason,
    /// preserving the original `id`.
    pub fn block_result(id: Value, prefix: &str, reason: &str) -> Response {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(serde_json::json!({
                "content": [{ "type": "text", "text": format!("{prefix} blocked: {reason}") }],
                "isError": true,
            })),
            error: None,
            method: None,
        }
    }

    /// Build a blocked response surfaced as a JSON-RPC error object
    /// (the HTTP-transport alternative to `block_result`).
    pub fn block_error(id: Value, prefix: &str, reason: &str) -> Response {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code: BLOCKED_ERROR_CODE,
                message: format!("{prefix} blocked: {reason}"),
                data: None,
            }),
            method: None,
        }
    }
}

/// Strip `tool_call_reason` from `params.arguments` in place. Tool-call
/// arguments must never reach the target with this key present (data-model
/// invariant (d)).
pub fn strip_tool_call_reason(params: &mut Value) {
    if let Some(args) = params.get_mut("arguments").and_then(|v| v.as_object_mut()) {
        args.remove("tool_call_reason");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        match Message::parse(raw).unwrap() {
            Message::Request(r) => {
                assert_eq!(r.method, "initialize");
                assert_eq!(r.id, Value::from(1));
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn parses_notification_without_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(matches!(
            Message::parse(raw).unwrap(),
            Message::Notification(_)
        ));
    }

    #[test]
    fn parses_response_with_result() {
        let raw = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#;
        match Message::parse(raw).unwrap() {
            Message::Response(r) => {
                assert!(r.result.is_some());
                assert!(r.method.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"read_file","arguments":{"path":"/tmp/x"}}}"#;
        let msg = Message::parse(raw).unwrap();
        let value = msg.to_value();
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["params"]["name"], "read_file");
    }

    #[test]
    fn strip_tool_call_reason_removes_key_only() {
        let mut params = serde_json::json!({
            "name": "read_file",
            "arguments": {"path": "/tmp/x", "tool_call_reason": "debug"}
        });
        strip_tool_call_reason(&mut params);
        assert!(params["arguments"].get("tool_call_reason").is_none());
        assert_eq!(params["arguments"]["path"], "/tmp/x");
    }
}
