//! Event distribution layer.
//!
//! Exactly two topic families exist: `salon:{id}` for staff and `user:{id}` for
//! customers. Lanes hand their events to an [`EventPublisher`] through an
//! [`Outbox`], which the store runs inline so each lane's events keep their order.

pub mod events;
pub mod hub;
pub mod topic;

pub use events::{ClearReason, OutboundEvent, OverallStatus, Snapshot};
pub use hub::{ConnectionId, Delivery, Hub, Subscription};
pub use topic::{Topic, TopicError};

use salon_queue_core::effect::Effect;
use std::sync::Arc;

/// Sink for events produced by reducers
pub trait EventPublisher: Send + Sync {
    /// Deliver `event` to every subscriber of `topic`
    fn publish(&self, topic: &Topic, event: &OutboundEvent);
}

/// Events collected while reducing one action
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<(Topic, OutboundEvent)>,
}

impl Outbox {
    /// Creates an empty outbox
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Queue an event
    pub fn push(&mut self, topic: Topic, event: OutboundEvent) {
        self.messages.push((topic, event));
    }

    /// Turn the outbox into one ordered publication, `None` if empty
    #[must_use]
    pub fn into_effect<A>(self, publisher: &Arc<dyn EventPublisher>) -> Option<Effect<A>> {
        if self.messages.is_empty() {
            return None;
        }
        let publisher = Arc::clone(publisher);
        Some(Effect::publish(move || {
            for (topic, event) in &self.messages {
                publisher.publish(topic, event);
            }
        }))
    }
}

/// Publisher that records everything, for tests
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: std::sync::Mutex<Vec<(Topic, OutboundEvent)>>,
}

impl RecordingPublisher {
    /// Creates an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far
    #[must_use]
    pub fn published(&self) -> Vec<(Topic, OutboundEvent)> {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Events published on one topic
    #[must_use]
    pub fn on_topic(&self, topic: &Topic) -> Vec<OutboundEvent> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event)
            .collect()
    }

    /// Forget everything recorded
    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, topic: &Topic, event: &OutboundEvent) {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((*topic, event.clone()));
    }
}
