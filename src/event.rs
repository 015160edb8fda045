/// MCPEvent — The Unit of Observation
///
/// Every JSON-RPC message that crosses any transport is turned into an
/// `MCPEvent` exactly once, on read. It is consumed synchronously by
/// verification and at-least-once asynchronously by the event bus, then
/// persisted as a journal row.
use crate::jrpc::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a message originated from the proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Producer {
    /// The MCP client (e.g. a desktop AI application).
    Local,
    /// The MCP tool server being proxied to.
    Remote,
    /// The proxy itself (pre-init handshake traffic, synthetic messages).
    Proxy,
}

/// Coarse event category. `Proxy` marks pre-init handshake traffic that the
/// client never sees as proxied; `MCP` is ordinary JSON-RPC traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    MCP,
    Proxy,
    File,
    Process,
    Network,
}

/// Direction of a message relative to the proxy: sent toward the target, or
/// received from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Send,
    Recv,
}

/// An observed JSON-RPC exchange, ready for verification and the event bus.
#[derive(Debug, Clone)]
pub struct MCPEvent {
    pub timestamp_ms: u64,
    pub producer: Producer,
    pub pid: Option<u32>,
    pub process_name: Option<String>,
    pub event_type: EventType,
    /// Opaque per-server identifier: a friendly name for local transports,
    /// the SHA-256 hex digest of the target URL for remote ones.
    pub mcp_tag: String,
    pub task: Task,
    pub message: Message,
    /// Set by a cached `tools/list` short-circuit (STDIO pre-init scenario)
    /// to tell detectors not to re-run expensive analysis (e.g. the LLM
    /// call) on a response that was already scored once.
    pub skip_analysis: bool,
}

impl MCPEvent {
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn new(
        producer: Producer,
        event_type: EventType,
        mcp_tag: impl Into<String>,
        task: Task,
        message: Message,
    ) -> Self {
        Self {
            timestamp_ms: Self::now_ms(),
            producer,
            pid: None,
            process_name: None,
            event_type,
            mcp_tag: mcp_tag.into(),
            task,
            message,
            skip_analysis: false,
        }
    }

    pub fn with_skip_analysis(mut self, skip: bool) -> Self {
        self.skip_analysis = skip;
        self
    }

    pub fn with_process(mut self, pid: Option<u32>, process_name: Option<String>) -> Self {
        self.pid = pid;
        self.process_name = process_name;
        self
    }

    /// The `(mcp_tag, id)` correlation key for request/response pairing, if
    /// the embedded message carries an id.
    pub fn correlation_key(&self) -> Option<(String, Value)> {
        self.message.id().map(|id| (self.mcp_tag.clone(), id.clone()))
    }
}

/// Compute the `mcp_tag` for a remote target: the SHA-256 hex digest of its
/// URL.
pub fn remote_mcp_tag(target_url: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(target_url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jrpc::Notification;

    #[test]
    fn remote_tag_is_stable_sha256() {
        let a = remote_mcp_tag("https://example.com/mcp");
        let b = remote_mcp_tag("https://example.com/mcp");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn remote_tag_differs_by_url() {
        assert_ne!(
            remote_mcp_tag("https://a.example/mcp"),
            remote_mcp_tag("https://b.example/mcp")
        );
    }

    #[test]
    fn request_response_ordering_key_matches() {
        let note = Message::Notification(Notification {
            jsonrpc: "2.0".into(),
            method: "notifications/initialized".into(),
            params: None,
        });
        let event = MCPEvent::new(Producer::Local, EventType::MCP, "s1", Task::Send, note);
        assert!(event.correlation_key().is_none());
    }
}
