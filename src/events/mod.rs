//! Event system for engine notifications
//!
//! Each engine publishes lifecycle and error events on an [`EventBus`] so the
//! surrounding pipeline can react to negotiation failures, end-of-stream and
//! fatal device errors without polling.

pub mod types;

pub use types::EngineEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus shared by the engines of one pipeline
///
/// Cloning is cheap; all clones publish into the same channel.
///
/// # Example
///
/// ```no_run
/// use m2m_codec::events::{EngineEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(EngineEvent::NotNegotiated {
///     element: "jpegenc0".to_string(),
///     reason: "no caps".to_string(),
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}: {:?}", event.event_name(), event);
///     }
/// });
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        // If no subscribers, send returns Err which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Returns a receiver that will receive all future events.
    /// The receiver uses a ring buffer, so if a subscriber falls too far
    /// behind, it will receive a `Lagged` error and miss some events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StreamState;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::StateChanged {
            element: "h264enc0".to_string(),
            from: StreamState::Null,
            to: StreamState::Ready,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            EngineEvent::StateChanged {
                to: StreamState::Ready,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_clones_share_channel() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.clone().publish(EngineEvent::EndOfStream {
            element: "aacenc0".to_string(),
            frames: 100,
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            EngineEvent::EndOfStream { frames: 100, .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            EngineEvent::EndOfStream { .. }
        ));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(EngineEvent::Fatal {
            element: "jpegenc0".to_string(),
            reason: "test".to_string(),
        });
    }
}
