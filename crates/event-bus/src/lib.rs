//! Event plumbing for the taskloop execution core.
//!
//! The [`publisher::EventPublisher`] adapter turns internal state transitions
//! into an ordered stream of typed [`envelope::TaskLoopEvent`] envelopes. Two
//! consumption styles hang off the same drain: push delivery to registered
//! [`publisher::EventSink`]s, and pull delivery through the broadcast-backed
//! [`InMemoryBus`] that `EventPublisher::subscribe` exposes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use taskloop_core_types::TaskLoopError;

pub mod envelope;
pub mod publisher;

pub use envelope::{TaskLoopEvent, TaskLoopEventType};
pub use publisher::{EventPublisher, EventSink};

/// Payload types that can ride the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

/// Fan-out surface: publish to everyone currently subscribed.
#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), TaskLoopError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Broadcast-channel bus. Slow subscribers lag and lose old events rather
/// than back-pressuring the producer; the publisher's sink path is the
/// lossless one.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), TaskLoopError> {
        // Publishing with zero live subscribers is a non-event, not a fault.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber() {
        let bus: Arc<InMemoryBus<String>> = InMemoryBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish("hello".to_string()).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus: Arc<InMemoryBus<u32>> = InMemoryBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(7).await.unwrap();
    }
}
