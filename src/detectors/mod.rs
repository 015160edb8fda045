/// Pattern and LLM-backed detectors (§4.7–§4.10)
///
/// Each detector implements `bus::Detector`. Shared helpers for pulling the
/// text a `tools/call` message carries live here so the three pattern
/// detectors don't each re-derive it.
pub mod command_injection;
pub mod filesystem_exposure;
pub mod pii_leak;
pub mod semantic_gap;

use crate::jrpc::Message;
use serde_json::Value;

/// Extract the text surface of a `tools/call` request or response that
/// pattern detectors scan: method, tool name, arguments, and any text
/// content blocks in a response result.
pub fn tool_call_text(message: &Message) -> Option<String> {
    match message {
        Message::Request(req) if req.method == "tools/call" => {
            let params = req.params.as_ref()?;
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            Some(format!("{} {} {}", req.method, name, arguments))
        }
        Message::Response(resp) => {
            let result = resp.result.as_ref()?;
            let content = result.get("content")?.as_array()?;
            let text: String = content
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

/// Walk `arguments`, yielding `(key_path, value)` for every leaf (string,
/// number, bool) reachable through objects and arrays. Used by the
/// file-system-exposure detector to find path-shaped leaves regardless of
/// nesting depth.
pub fn walk_leaves(value: &Value, path: &str, depth: usize, out: &mut Vec<(String, String, usize)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let next_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                walk_leaves(v, &next_path, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk_leaves(v, &format!("{path}[{i}]"), depth + 1, out);
            }
        }
        Value::String(s) => out.push((path.to_string(), s.clone(), depth)),
        Value::Number(n) => out.push((path.to_string(), n.to_string(), depth)),
        Value::Bool(b) => out.push((path.to_string(), b.to_string(), depth)),
        Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_text_includes_name_and_arguments() {
        let req = Message::Request(crate::jrpc::Request {
            jsonrpc: "2.0".into(),
            id: Value::from(1),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "read_file", "arguments": {"path": "/tmp/x"}})),
        });
        let text = tool_call_text(&req).unwrap();
        assert!(text.contains("read_file"));
        assert!(text.contains("/tmp/x"));
    }

    #[test]
    fn walk_leaves_tracks_depth() {
        let value = serde_json::json!({"a": {"b": {"c": "deep"}}});
        let mut out = Vec::new();
        walk_leaves(&value, "", 0, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, "deep");
        assert_eq!(out[0].2, 3);
    }
}
