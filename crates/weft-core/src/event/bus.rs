//! Broadcast event bus for distributing `OrchestrationEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Executors subscribe to receive abort
//! and expire requests; publishing with no active subscribers is a no-op.

use tokio::sync::broadcast;
use weft_types::event::OrchestrationEvent;

/// Multi-consumer bus for orchestration events.
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers and return how many
    /// there were. With none the event is dropped.
    pub fn publish(&self, event: OrchestrationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_types::execution::Status;

    fn abort_requested(node_execution_id: Uuid) -> OrchestrationEvent {
        OrchestrationEvent::AbortRequested {
            node_execution_id,
            ack_correlation_id: format!("{}:{node_execution_id}", Uuid::now_v7()),
        }
    }

    #[tokio::test]
    async fn abort_request_reaches_every_executor() {
        let bus = EventBus::new(16);
        let mut shell_executor = bus.subscribe();
        let mut docker_executor = bus.subscribe();
        let node = Uuid::now_v7();

        assert_eq!(bus.publish(abort_requested(node)), 2);

        for rx in [&mut shell_executor, &mut docker_executor] {
            match rx.recv().await.unwrap() {
                OrchestrationEvent::AbortRequested {
                    node_execution_id,
                    ack_correlation_id,
                } => {
                    assert_eq!(node_execution_id, node);
                    assert!(ack_correlation_id.ends_with(&node.to_string()));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn request_without_executors_is_dropped() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(abort_requested(Uuid::now_v7())), 0);

        // A late subscriber does not see earlier requests.
        let mut rx = bus.subscribe();
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn lagging_executor_still_gets_latest_request() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let plan_execution_id = Uuid::now_v7();

        for _ in 0..10 {
            bus.publish(OrchestrationEvent::NodeStatusChanged {
                plan_execution_id,
                node_execution_id: Uuid::now_v7(),
                status: Status::Running,
            });
        }
        let node = Uuid::now_v7();
        bus.publish(abort_requested(node));

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(OrchestrationEvent::AbortRequested { node_execution_id, .. }) if node_execution_id == node
        ));
    }

    #[test]
    fn debug_reports_subscribers() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("EventBus"));
        assert!(debug.contains("receiver_count: 1"));
    }
}
