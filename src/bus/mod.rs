/// Event Bus (§4.6)
///
/// Fan-out dispatcher from `MCPEvent` to the detector pool. `dispatch_async`
/// spawns one task per detector and returns immediately; `dispatch_sync`
/// awaits all of them, used by the gatekeeper on `tools/list` responses so
/// the DangerousToolSet is current before the rewriter runs. One detector's
/// error never suppresses another's finding.
use crate::event::{MCPEvent, Producer};
use crate::journal::Journal;
use crate::notifier::{Notifier, PushEvent};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Severity bucket for a `Finding`, ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// One matched pattern or rubric item contributing to a `Finding`'s score.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubFinding {
    pub category: String,
    pub matched: String,
    pub reason: String,
}

/// A detector's verdict on one `MCPEvent`, ready to journal and push.
#[derive(Debug, Clone)]
pub struct Finding {
    pub detector_name: String,
    pub producer: String,
    pub server_name: String,
    pub severity: Severity,
    pub score: i64,
    pub sub_findings: Vec<SubFinding>,
    pub raw_event_id: Option<i64>,
}

/// Declares which events a detector wants to see, so the bus can skip
/// dispatch entirely for events nothing subscribes to.
pub struct Interest {
    pub event_types: &'static [crate::event::EventType],
    pub producers: &'static [Producer],
}

impl Interest {
    pub fn matches(&self, event: &MCPEvent) -> bool {
        self.event_types.contains(&event.event_type) && self.producers.contains(&event.producer)
    }
}

/// Lowercase label for a `Severity`, shared by the journal and the notifier.
pub fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::None => "none",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

/// A pluggable detector. Implementations must not panic; any `Err` is
/// logged by the bus and treated as "no finding" for that event.
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn interest(&self) -> Interest;
    async fn inspect(&self, event: &MCPEvent) -> anyhow::Result<Option<Finding>>;
}

const DETECTOR_QUEUE_CAPACITY: usize = 256;

/// Holds the detector pool and a journal handle. One bus per process.
pub struct EventBus {
    detectors: Vec<Arc<dyn Detector>>,
    journal: Journal,
    notifier: Option<Notifier>,
    shed_counter: AtomicU64,
}

impl EventBus {
    pub fn new(journal: Journal, detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self {
            detectors,
            journal,
            notifier: None,
            shed_counter: AtomicU64::new(0),
        }
    }

    /// Attach a push notifier so every recorded finding is also broadcast to
    /// connected `/ws` frontends.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Fire-and-forget fan-out: records the raw event once, then spawns one
    /// task per interested detector. Callers do not await detector results.
    pub fn dispatch_async(self: &Arc<Self>, event: MCPEvent) {
        let bus = self.clone();
        tokio::task::spawn(async move {
            bus.run(event).await;
        });
    }

    /// Awaited fan-out, used when the caller (the gatekeeper, on `tools/list`
    /// responses) needs every detector's finding recorded before proceeding.
    pub async fn dispatch_sync(&self, event: MCPEvent) {
        self.run(event).await;
    }

    async fn run(&self, event: MCPEvent) {
        let raw_event_id = match self.journal.record_event(event.clone()).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "journal write failed, event continues unrecorded");
                None
            }
        };

        let interested: Vec<_> = self
            .detectors
            .iter()
            .filter(|d| d.interest().matches(&event))
            .cloned()
            .collect();

        let futures = interested.into_iter().map(|detector| {
            let event = event.clone();
            async move {
                match detector.inspect(&event).await {
                    Ok(Some(finding)) => Some((detector.name().to_string(), finding)),
                    Ok(None) => None,
                    Err(err) => {
                        warn!(detector = detector.name(), error = %err, "detector failed, skipping finding");
                        None
                    }
                }
            }
        });

        for result in join_all(futures).await.into_iter().flatten() {
            let (_, mut finding) = result;
            finding.raw_event_id = raw_event_id;

            if let Some(notifier) = &self.notifier {
                notifier.publish(PushEvent::Finding {
                    server_name: finding.server_name.clone(),
                    detector_name: finding.detector_name.clone(),
                    severity: severity_label(finding.severity).to_string(),
                    score: finding.score,
                });
            }

            if let Some(id) = raw_event_id {
                if let Err(err) = self.journal.record_finding(id, finding).await {
                    warn!(error = %err, "failed to journal finding");
                }
            }
        }
    }

    /// Attempt to enqueue onto a bounded per-detector channel, incrementing
    /// the shed counter oldest-first on overflow. Used by transports that
    /// hold their own bounded queue in front of the bus (§5 Backpressure).
    pub fn try_enqueue<T>(sender: &tokio::sync::mpsc::Sender<T>, item: T) -> bool {
        match sender.try_send(item) {
            Ok(()) => true,
            Err(_) => false,
        }
    }

    pub fn record_shed(&self) {
        self.shed_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shed_count(&self) -> u64 {
        self.shed_counter.load(Ordering::Relaxed)
    }

    pub fn bounded_channel<T>() -> (tokio::sync::mpsc::Sender<T>, tokio::sync::mpsc::Receiver<T>) {
        tokio::sync::mpsc::channel(DETECTOR_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Task};
    use crate::jrpc::{Message, Notification};

    struct AlwaysFindsSomething;

    #[async_trait::async_trait]
    impl Detector for AlwaysFindsSomething {
        fn name(&self) -> &str {
            "always-finds"
        }

        fn interest(&self) -> Interest {
            Interest {
                event_types: &[EventType::MCP],
                producers: &[Producer::Local, Producer::Remote],
            }
        }

        async fn inspect(&self, _event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
            Ok(Some(Finding {
                detector_name: "always-finds".into(),
                producer: "local".into(),
                server_name: "srv1".into(),
                severity: Severity::Low,
                score: 20,
                sub_findings: vec![],
                raw_event_id: None,
            }))
        }
    }

    struct NeverFires;

    #[async_trait::async_trait]
    impl Detector for NeverFires {
        fn name(&self) -> &str {
            "never-fires"
        }

        fn interest(&self) -> Interest {
            Interest {
                event_types: &[EventType::Proxy],
                producers: &[Producer::Local, Producer::Remote],
            }
        }

        async fn inspect(&self, _event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
            panic!("should never be dispatched to")
        }
    }

    fn sample_event() -> MCPEvent {
        MCPEvent::new(
            Producer::Local,
            EventType::MCP,
            "srv1",
            Task::Send,
            Message::Notification(Notification {
                jsonrpc: "2.0".into(),
                method: "notifications/initialized".into(),
                params: None,
            }),
        )
    }

    #[tokio::test]
    async fn dispatch_sync_skips_uninterested_detectors() {
        let journal = Journal::open_in_memory().unwrap();
        let bus = EventBus::new(
            journal,
            vec![Arc::new(AlwaysFindsSomething), Arc::new(NeverFires)],
        );
        bus.dispatch_sync(sample_event()).await;
    }

    #[tokio::test]
    async fn dispatch_async_returns_without_waiting() {
        let journal = Journal::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(journal, vec![Arc::new(AlwaysFindsSomething)]));
        bus.dispatch_async(sample_event());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[test]
    fn shed_counter_increments() {
        let journal = Journal::open_in_memory().unwrap();
        let bus = EventBus::new(journal, vec![]);
        bus.record_shed();
        bus.record_shed();
        assert_eq!(bus.shed_count(), 2);
    }

    #[test]
    fn interest_filters_by_producer_independent_of_event_type() {
        let proxy_only = Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Proxy],
        };
        assert!(!proxy_only.matches(&sample_event()));

        let local_and_remote = Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Local, Producer::Remote],
        };
        assert!(local_and_remote.matches(&sample_event()));
    }
}
