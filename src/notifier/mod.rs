/// Push Notifier (§6 `/ws`)
///
/// Findings and journal events are pushed to connected frontends over a
/// websocket. The registry of live sockets is held here rather than in
/// `Supervisor`, since it is purely an outbound fan-out concern distinct
/// from the proxy's routing state.
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

const NOTIFY_QUEUE_CAPACITY: usize = 256;

/// One message pushed to every connected frontend socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Finding {
        server_name: String,
        detector_name: String,
        severity: String,
        score: i64,
    },
    ToolSafetyUpdated {
        server_name: String,
        tool_name: String,
        safety: String,
    },
    AnalysisStatus {
        server_name: String,
        pending: usize,
    },
}

struct Subscriber {
    sender: mpsc::Sender<PushEvent>,
}

/// Fan-out hub for `/ws` connections. Cheap to clone; all clones share the
/// same subscriber table.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: std::sync::Arc<Mutex<std::collections::HashMap<Uuid, Subscriber>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new frontend connection, returning its id (for later
    /// `unsubscribe`) and the receiving half of its push queue.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<PushEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Push `event` to every connected subscriber. A full queue drops the
    /// event for that one subscriber rather than blocking the publisher.
    pub fn publish(&self, event: PushEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.values() {
            let _ = subscriber.sender.try_send(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let notifier = Notifier::new();
        let (_id1, mut rx1) = notifier.subscribe();
        let (_id2, mut rx2) = notifier.subscribe();

        notifier.publish(PushEvent::AnalysisStatus {
            server_name: "srv1".into(),
            pending: 3,
        });

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn unsubscribe_removes_entry() {
        let notifier = Notifier::new();
        let (id, _rx) = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        notifier.unsubscribe(id);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
