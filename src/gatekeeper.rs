/// Verification Gatekeeper (§4.2, state machine from §4.11)
///
/// A synchronous decision point invoked by every transport on every
/// JSON-RPC message. Kept as a leaf with a narrow decision interface
/// (`Verdict`) so transports are the only callers and detectors are reached
/// only through the event bus — this breaks the "verification calls
/// transport calls verification" cycle called out in the Design Notes.
use crate::jrpc::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The denylist applied to request arguments. Deliberately tiny: detector
/// findings are journaled/pushed but do not loop back into this decision
/// today (Design Note / Open Question (b)).
const DENYLIST: &[&str] = &["rm -rf", "/etc/", "format", "del /f"];

/// The gatekeeper's decision for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(String),
}

/// Lifecycle of one `(app, server, id)` call key, per §4.11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    PendingReq,
    Allowed,
    BlockedReq,
    PendingResp,
    Forwarded,
    BlockedResp,
    Dropped,
}

pub type CallKey = (String, String, Value);

/// Tracks the state machine for in-flight calls. Held separately from
/// `Supervisor`'s `PendingCall` map (which carries the call's *data*) since
/// this is purely about lifecycle state for tests and observability.
#[derive(Default)]
pub struct CallStateTracker {
    states: Mutex<HashMap<CallKey, (CallState, Instant)>>,
}

impl CallStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(&self, key: CallKey, state: CallState) {
        self.states.lock().unwrap().insert(key, (state, Instant::now()));
    }

    pub fn get(&self, key: &CallKey) -> Option<CallState> {
        self.states.lock().unwrap().get(key).map(|(s, _)| *s)
    }

    /// Move any `PendingResp` entry older than `max_age` to `Dropped`.
    /// Independent of target liveness — exercised directly in tests.
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let mut states = self.states.lock().unwrap();
        let mut reaped = 0;
        for (state, since) in states.values_mut() {
            if *state == CallState::PendingResp && since.elapsed() >= max_age {
                *state = CallState::Dropped;
                reaped += 1;
            }
        }
        reaped
    }
}

/// Evaluate the request-path denylist against a `tools/call` request's
/// arguments. Non-tool-call requests and all responses always pass.
pub fn check_request(message: &Message) -> Verdict {
    let Message::Request(req) = message else {
        return Verdict::Allow;
    };
    if req.method != "tools/call" {
        return Verdict::Allow;
    }
    let Some(params) = &req.params else {
        return Verdict::Allow;
    };
    let haystack = params.to_string().to_lowercase();
    for needle in DENYLIST {
        if haystack.contains(&needle.to_lowercase()) {
            return Verdict::Block(format!("matched denylisted pattern \"{needle}\""));
        }
    }
    Verdict::Allow
}

/// Responses are not denylist-checked today; this exists so the response
/// path has the same shaped entry point as the request path, per the
/// spec's "policy today: ... all responses pass".
pub fn check_response(_message: &Message) -> Verdict {
    Verdict::Allow
}

/// Build the wire-level outcome of a `Block` verdict. `as_error` selects
/// the HTTP-transport alternative (`-32000` error object) over the default
/// blocked-content result.
pub fn block_response(id: Value, prefix: &str, reason: &str, as_error: bool) -> crate::jrpc::Response {
    if as_error {
        Message::block_error(id, prefix, reason)
    } else {
        Message::block_result(id, prefix, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jrpc::Request;

    fn tool_call(arguments: Value) -> Message {
        Message::Request(Request {
            jsonrpc: "2.0".into(),
            id: Value::from(1),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "read_file", "arguments": arguments})),
        })
    }

    #[test]
    fn blocks_denylisted_path() {
        let msg = tool_call(serde_json::json!({"path": "/etc/passwd"}));
        assert!(matches!(check_request(&msg), Verdict::Block(_)));
    }

    #[test]
    fn allows_benign_call() {
        let msg = tool_call(serde_json::json!({"path": "/tmp/notes.txt"}));
        assert_eq!(check_request(&msg), Verdict::Allow);
    }

    #[test]
    fn non_tool_call_always_allowed() {
        let msg = Message::Request(Request {
            jsonrpc: "2.0".into(),
            id: Value::from(2),
            method: "tools/list".into(),
            params: None,
        });
        assert_eq!(check_request(&msg), Verdict::Allow);
    }

    #[test]
    fn pending_resp_eviction_independent_of_liveness() {
        let tracker = CallStateTracker::new();
        let key: CallKey = ("app".into(), "srv".into(), Value::from(7));
        tracker.transition(key.clone(), CallState::PendingResp);
        std::thread::sleep(Duration::from_millis(10));
        let reaped = tracker.reap_stale(Duration::from_millis(5));
        assert_eq!(reaped, 1);
        assert_eq!(tracker.get(&key), Some(CallState::Dropped));
    }

    #[test]
    fn block_response_as_error_uses_dashed_code() {
        let resp = block_response(Value::from(3), "Request", "test", true);
        assert!(resp.error.is_some());
        assert_eq!(resp.error.unwrap().code, crate::jrpc::BLOCKED_ERROR_CODE);
    }
}
