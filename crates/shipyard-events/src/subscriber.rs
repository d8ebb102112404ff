use crate::Event;
use async_trait::async_trait;
use shipyard_core::{ShipyardError, ShipyardResult};
use tokio::sync::mpsc;

/// Consumer of published events.
///
/// Implementations must tolerate concurrent invocation: the bus delivers one
/// event to all of its subscribers at once.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &Event) -> ShipyardResult<()>;
}

/// Subscriber that runs a synchronous callback.
pub struct CallbackSubscriber<F>
where
    F: Fn(&Event) -> ShipyardResult<()> + Send + Sync,
{
    callback: F,
}

impl<F> CallbackSubscriber<F>
where
    F: Fn(&Event) -> ShipyardResult<()> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> EventSubscriber for CallbackSubscriber<F>
where
    F: Fn(&Event) -> ShipyardResult<()> + Send + Sync,
{
    async fn on_event(&self, event: &Event) -> ShipyardResult<()> {
        (self.callback)(event)
    }
}

/// Subscriber that forwards events into a bounded channel, e.g. for UI streaming.
///
/// A full channel is reported as a subscriber failure rather than blocking the
/// publisher.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Event>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving half of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSubscriber for ChannelSubscriber {
    async fn on_event(&self, event: &Event) -> ShipyardResult<()> {
        self.tx.try_send(event.clone()).map_err(|e| {
            ShipyardError::Orchestrator(format!("event channel rejected {}: {e}", event.event_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBus, EventType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_callback_subscriber() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe_type(
            EventType::GateCreated,
            Arc::new(CallbackSubscriber::new(move |_event: &Event| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );

        bus.publish(Event::new(EventType::GateCreated, "p1")).await;
        bus.publish(Event::new(EventType::TaskCreated, "p1")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_subscriber_streams_events() {
        let bus = EventBus::new();
        let (subscriber, mut rx) = ChannelSubscriber::new(8);
        bus.subscribe_project("p1", Arc::new(subscriber));

        bus.publish(Event::new(EventType::PhaseStarted, "p1")).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::PhaseStarted);
    }

    #[tokio::test]
    async fn test_full_channel_is_a_failure_not_a_block() {
        let bus = EventBus::new();
        let (subscriber, _rx) = ChannelSubscriber::new(1);
        bus.subscribe_all(Arc::new(subscriber));

        assert_eq!(bus.publish(Event::new(EventType::TaskCreated, "p1")).await, 1);
        assert_eq!(bus.publish(Event::new(EventType::TaskCreated, "p1")).await, 0);
    }
}
