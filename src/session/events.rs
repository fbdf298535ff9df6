//! Subscriber event stream.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::storage::TaskStatus;
use crate::tracker::StepOutcome;

/// Queue depth granted to each subscriber. A subscriber that falls this far
/// behind is disconnected rather than back-pressuring the agent.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Events fanned out to session subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StepUpdate {
        task_id: Uuid,
        step_number: u32,
        thought: String,
        action: Value,
        outcome: StepOutcome,
        screenshot_ref: Option<String>,
        success: bool,
        finished: bool,
    },
    Overflow {
        task_id: Uuid,
        dropped: u64,
    },
    Terminal {
        task_id: Uuid,
        status: TaskStatus,
        message: String,
    },
    /// Final event delivered to a subscriber that is being dropped.
    Disconnected {
        reason: String,
    },
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Terminal { .. })
    }
}

/// Per-session event fan-out.
///
/// Subscribers sit behind bounded queues; delivery is `try_send`, so a slow
/// consumer can never stall the publishing agent. On overflow the subscriber
/// is dropped (with a best-effort final [`TaskEvent::Disconnected`]) while
/// core events keep flowing to the remaining subscribers.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::Sender<TaskEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its receiving end.
    pub fn subscribe(&self) -> mpsc::Receiver<TaskEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every live subscriber, in registration order.
    pub fn publish(&self, event: &TaskEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("subscriber backlog exceeded, disconnecting");
                let _ = tx.try_send(TaskEvent::Disconnected {
                    reason: "subscriber backlog exceeded".to_string(),
                });
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_event(n: u32) -> TaskEvent {
        TaskEvent::StepUpdate {
            task_id: Uuid::nil(),
            step_number: n,
            thought: String::new(),
            action: serde_json::json!({ "action": "back" }),
            outcome: StepOutcome::Success,
            screenshot_ref: None,
            success: true,
            finished: false,
        }
    }

    #[tokio::test]
    async fn test_publish_in_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        for n in 1..=5 {
            hub.publish(&step_event(n));
        }

        for expected in 1..=5 {
            match rx.recv().await.unwrap() {
                TaskEvent::StepUpdate { step_number, .. } => assert_eq!(step_number, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_blocking() {
        let hub = EventHub::new();
        let _rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        // overflow the bounded queue without consuming
        for n in 0..(SUBSCRIBER_QUEUE_CAPACITY as u32 + 10) {
            hub.publish(&step_event(n));
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        drop(rx);
        hub.publish(&step_event(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_tags() {
        let json = serde_json::to_value(TaskEvent::Overflow {
            task_id: Uuid::nil(),
            dropped: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "overflow");
        assert_eq!(json["dropped"], 3);

        let json = serde_json::to_value(TaskEvent::Terminal {
            task_id: Uuid::nil(),
            status: TaskStatus::Completed,
            message: "ok".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "terminal");
        assert_eq!(json["status"], "completed");
    }
}
