//! TopicEventBus - per-action broadcast fan-out.
//!
//! One broadcast channel per action id. Publishers never block: a
//! subscriber that falls behind its bounded ring loses the oldest
//! events and observes a `lag` marker through [`Subscription`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use ensemble_core::event::{ActionEvent, EventBus};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// In-process EventBus with one bounded ring per subscriber.
pub struct TopicEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<ActionEvent>>>,
    capacity: usize,
}

impl TopicEventBus {
    /// Create a bus with per-subscriber ring capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Configured per-subscriber ring capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, action_id: &str) -> usize {
        self.lock_topics()
            .get(action_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<ActionEvent>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TopicEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl EventBus for TopicEventBus {
    async fn publish(&self, action_id: &str, event: ActionEvent) {
        let sender = self.lock_topics().get(action_id).cloned();
        let Some(tx) = sender else {
            // No subscriber ever looked at this topic.
            return;
        };
        if tx.send(event).is_err() {
            // Last subscriber went away; drop the idle topic.
            let mut topics = self.lock_topics();
            if topics
                .get(action_id)
                .is_some_and(|t| t.receiver_count() == 0)
            {
                topics.remove(action_id);
            }
        }
    }

    fn subscribe(&self, action_id: &str) -> broadcast::Receiver<ActionEvent> {
        let mut topics = self.lock_topics();
        topics
            .entry(action_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(action_id: &str) -> ActionEvent {
        ActionEvent::ActionStarted {
            action_id: action_id.to_string(),
        }
    }

    #[test]
    fn test_topics_are_isolated() {
        tokio_test::block_on(async {
            let bus = TopicEventBus::new(16);
            let mut a = bus.subscribe("action-a");
            let mut b = bus.subscribe("action-b");

            bus.publish("action-a", started("action-a")).await;
            bus.publish("action-b", started("action-b")).await;

            match a.recv().await.expect("event") {
                ActionEvent::ActionStarted { action_id } => assert_eq!(action_id, "action-a"),
                other => panic!("unexpected event {other:?}"),
            }
            match b.recv().await.expect("event") {
                ActionEvent::ActionStarted { action_id } => assert_eq!(action_id, "action-b"),
                other => panic!("unexpected event {other:?}"),
            }
        });
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        tokio_test::block_on(async {
            let bus = TopicEventBus::new(4);
            bus.publish("nobody", started("nobody")).await;
            assert_eq!(bus.subscriber_count("nobody"), 0);
        });
    }

    #[test]
    fn test_fan_out_reaches_every_subscriber_in_order() {
        tokio_test::block_on(async {
            let bus = TopicEventBus::new(16);
            let mut first = bus.subscribe("a");
            let mut second = bus.subscribe("a");

            for attempt in 1..=3u32 {
                bus.publish(
                    "a",
                    ActionEvent::ActionRetrying {
                        action_id: "a".to_string(),
                        attempt,
                    },
                )
                .await;
            }

            for rx in [&mut first, &mut second] {
                for expected in 1..=3u32 {
                    match rx.recv().await.expect("event") {
                        ActionEvent::ActionRetrying { attempt, .. } => {
                            assert_eq!(attempt, expected)
                        }
                        other => panic!("unexpected event {other:?}"),
                    }
                }
            }
        });
    }

    #[test]
    fn test_idle_topic_is_dropped_after_last_unsubscribe() {
        tokio_test::block_on(async {
            let bus = TopicEventBus::new(4);
            let rx = bus.subscribe("a");
            assert_eq!(bus.subscriber_count("a"), 1);
            drop(rx);
            bus.publish("a", started("a")).await;
            assert_eq!(bus.subscriber_count("a"), 0);
        });
    }
}
