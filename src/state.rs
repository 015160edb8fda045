/// Shared Process-Wide State
///
/// The SSEConnection registry, PendingCalls map, ToolsCatalog, and
/// DangerousToolSet are process-wide mutable state. Per §5, fine-grained
/// locking is unnecessary at current throughput, so all four live behind
/// one coarse lock inside a single `Supervisor` handle passed by `Arc` to
/// every component — there is no process-wide singleton, which keeps the
/// whole thing testable by constructing a fresh `Supervisor` per test.
use crate::tools::ToolDescriptor;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A tool invocation awaiting its matching response.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: Instant,
}

/// Key identifying one in-flight or cached tool call / catalog.
pub type CallKey = (String, String, Value); // (app_name, server_name, request_id)
pub type CatalogKey = (String, String); // (app_name, server_name)

/// The most recently observed, *unmodified* tool list for one server.
#[derive(Debug, Clone, Default)]
pub struct CatalogEntry {
    pub tools: Vec<ToolDescriptor>,
    pub server_info: Option<Value>,
    pub last_updated: Option<Instant>,
}

/// Per-server set of tool names flagged dangerous by the semantic-gap
/// detector, paired with whether filtering is currently enabled.
#[derive(Debug, Clone, Default)]
pub struct DangerousEntry {
    pub tools: std::collections::HashSet<String>,
    pub filter_enabled: bool,
}

/// A live SSE connection's routing and queuing state.
pub struct SSEConnection {
    pub id: String,
    pub server_name: String,
    pub app_name: String,
    pub target_url: String,
    pub forwarded_headers: HashMap<String, String>,
    pub created_at: Instant,
    /// Messages queued by the POST handler, drained by the client→target
    /// forwarding task. Bounded per §5 backpressure.
    pub outbound: mpsc::Sender<Value>,
    /// The target's own message-sink endpoint, captured from its `endpoint`
    /// SSE event once observed.
    pub target_message_endpoint: Mutex<Option<String>>,
}

impl std::fmt::Debug for SSEConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSEConnection")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .field("app_name", &self.app_name)
            .finish()
    }
}

const SSE_QUEUE_CAPACITY: usize = 256;

/// Process-wide mutable state, guarded by one coarse lock per table.
#[derive(Default)]
pub struct Supervisor {
    pending: Mutex<HashMap<CallKey, PendingCall>>,
    catalog: Mutex<HashMap<CatalogKey, CatalogEntry>>,
    dangerous: Mutex<HashMap<String, DangerousEntry>>,
    sse_connections: Mutex<HashMap<String, Arc<SSEConnection>>>,
    shed_counter: std::sync::atomic::AtomicU64,
}

pub type SharedSupervisor = Arc<Supervisor>;

impl Supervisor {
    pub fn new() -> SharedSupervisor {
        Arc::new(Self::default())
    }

    // --- PendingCalls -----------------------------------------------------

    pub fn insert_pending(&self, key: CallKey, call: PendingCall) {
        self.pending.lock().unwrap().insert(key, call);
    }

    pub fn take_pending(&self, key: &CallKey) -> Option<PendingCall> {
        self.pending.lock().unwrap().remove(key)
    }

    /// Evict `PendingResp` entries older than `max_age`, independent of
    /// whether the target is still alive. Returns the number reaped.
    pub fn reap_pending(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, call| call.created_at.elapsed() < max_age);
        before - pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    // --- ToolsCatalog -------------------------------------------------------

    pub fn set_catalog(&self, key: CatalogKey, tools: Vec<ToolDescriptor>, server_info: Option<Value>) {
        self.catalog.lock().unwrap().insert(
            key,
            CatalogEntry {
                tools,
                server_info,
                last_updated: Some(Instant::now()),
            },
        );
    }

    pub fn get_catalog(&self, key: &CatalogKey) -> Option<CatalogEntry> {
        self.catalog.lock().unwrap().get(key).cloned()
    }

    pub fn find_tool(&self, key: &CatalogKey, tool_name: &str) -> Option<ToolDescriptor> {
        self.catalog
            .lock()
            .unwrap()
            .get(key)?
            .tools
            .iter()
            .find(|t| t.name == tool_name)
            .cloned()
    }

    /// Find a tool by name in any catalog entry for the given server name,
    /// regardless of which app it was registered under. Used by the
    /// semantic-gap detector, which only carries an `mcp_tag` (server name)
    /// and not the owning app's name.
    pub fn find_tool_by_server(&self, server_name: &str, tool_name: &str) -> Option<ToolDescriptor> {
        self.catalog
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, srv), _)| srv == server_name)
            .find_map(|(_, entry)| entry.tools.iter().find(|t| t.name == tool_name).cloned())
    }

    // --- DangerousToolSet ---------------------------------------------------

    pub fn dangerous_for(&self, server_name: &str) -> DangerousEntry {
        self.dangerous
            .lock()
            .unwrap()
            .get(server_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mark_dangerous(&self, server_name: &str, tool_name: &str, filter_enabled: bool) {
        let mut dangerous = self.dangerous.lock().unwrap();
        let entry = dangerous.entry(server_name.to_string()).or_default();
        entry.tools.insert(tool_name.to_string());
        entry.filter_enabled = filter_enabled;
    }

    pub fn set_filter_enabled(&self, server_name: &str, enabled: bool) {
        let mut dangerous = self.dangerous.lock().unwrap();
        dangerous.entry(server_name.to_string()).or_default().filter_enabled = enabled;
    }

    // --- SSEConnection registry ----------------------------------------------

    pub fn new_sse_connection(
        &self,
        id: String,
        server_name: String,
        app_name: String,
        target_url: String,
        forwarded_headers: HashMap<String, String>,
    ) -> (Arc<SSEConnection>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SSE_QUEUE_CAPACITY);
        let conn = Arc::new(SSEConnection {
            id: id.clone(),
            server_name,
            app_name,
            target_url,
            forwarded_headers,
            created_at: Instant::now(),
            outbound: tx,
            target_message_endpoint: Mutex::new(None),
        });
        self.sse_connections
            .lock()
            .unwrap()
            .insert(id, conn.clone());
        (conn, rx)
    }

    pub fn get_sse_connection(&self, id: &str) -> Option<Arc<SSEConnection>> {
        self.sse_connections.lock().unwrap().get(id).cloned()
    }

    pub fn remove_sse_connection(&self, id: &str) {
        self.sse_connections.lock().unwrap().remove(id);
    }

    pub fn sse_connection_count(&self) -> usize {
        self.sse_connections.lock().unwrap().len()
    }

    // --- backpressure bookkeeping --------------------------------------------

    pub fn record_shed(&self) {
        self.shed_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn shed_count(&self) -> u64 {
        self.shed_counter.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn pending_resp_eviction_is_independent_of_target_liveness() {
        let sup = Supervisor::new();
        let key: CallKey = ("app".into(), "srv".into(), Value::from(1));
        sup.insert_pending(
            key.clone(),
            PendingCall {
                tool_name: "read_file".into(),
                arguments: Value::Null,
                created_at: Instant::now(),
            },
        );
        assert_eq!(sup.pending_len(), 1);
        sleep(Duration::from_millis(10));
        let reaped = sup.reap_pending(Duration::from_millis(5));
        assert_eq!(reaped, 1);
        assert_eq!(sup.pending_len(), 0);
    }

    #[test]
    fn dangerous_set_filter_flag_is_per_server() {
        let sup = Supervisor::new();
        sup.mark_dangerous("srv1", "run_shell", true);
        let entry = sup.dangerous_for("srv1");
        assert!(entry.filter_enabled);
        assert!(entry.tools.contains("run_shell"));
        assert!(sup.dangerous_for("srv2").tools.is_empty());
    }
}
