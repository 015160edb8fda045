/// Transport Adapters (§4.3–§4.5)
///
/// Each adapter turns one wire protocol into the same shape: read a
/// JSON-RPC message, build an `MCPEvent`, run it through the gatekeeper,
/// forward, and fan out to the event bus. STDIO talks to a spawned child
/// process; SSE and HTTP talk to a remote target over `reqwest`.
pub mod http;
pub mod sse;
pub mod stdio;

use crate::bus::EventBus;
use crate::journal::Journal;
use crate::notifier::Notifier;
use crate::state::SharedSupervisor;
use std::sync::Arc;

/// Everything a transport adapter needs, bundled so handlers take one
/// `web::Data<ProxyContext>` instead of five separate extractors.
#[derive(Clone)]
pub struct ProxyContext {
    pub supervisor: SharedSupervisor,
    pub bus: Arc<EventBus>,
    pub journal: Journal,
    pub notifier: Notifier,
    pub http_client: reqwest::Client,
    pub pending_call_max_age: std::time::Duration,
}
