use tokio::sync::broadcast;

use crate::execution::EngineEvent;

/// Fan-out of run lifecycle events to every live subscriber.
///
/// Subscribers that fall more than `capacity` events behind see
/// `RecvError::Lagged` and skip ahead.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event`. Returns how many subscribers it reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;

    fn finished(id: &str) -> EngineEvent {
        EngineEvent::RunFinished {
            execution_id: id.into(),
            status: ExecutionStatus::Completed,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_the_event() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(finished("x")), 2);
        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                EngineEvent::RunFinished { execution_id, status } => {
                    assert_eq!(execution_id, "x");
                    assert_eq!(status, ExecutionStatus::Completed);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        let delivered = bus.publish(EngineEvent::CheckpointSaved {
            execution_id: "x".into(),
            step: 1,
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_dropped_subscriber_is_not_counted() {
        let bus = EventBus::new(0);
        let rx = bus.subscribe();
        assert_eq!(bus.publish(finished("a")), 1);
        drop(rx);
        assert_eq!(bus.publish(finished("b")), 0);
    }
}
