//! Topic hub: connection registry and fan-out.
//!
//! # Architecture
//!
//! ```text
//! Store lane                 Hub                           Connections
//!   │                         │                                │
//!   ├─ publish(salon:A, E1) ─>│── Delivery::Event ────────────>│ staff tablet
//!   │                         │── Delivery::Event ────────────>│ front desk
//!   │                         │                                │
//!   │        subscribe(user:U)│<───────────────────────────────┤ phone
//!   │                         ├─ register + buffer events      │
//!   │                         ├─ Delivery::Snapshot ──────────>│
//!   │                         ├─ flush buffered events ───────>│
//! ```
//!
//! Every connection has one bounded ordered channel. Publishing never blocks:
//! it runs inside a store lane while the lane is held, so a lane's events reach
//! each connection in the order the lane produced them. A connection whose
//! channel is full has stopped reading and is dropped; its client reconnects and
//! gets a fresh snapshot.

use super::events::{OutboundEvent, Snapshot};
use super::topic::{Topic, TopicError};
use super::EventPublisher;
use crate::types::Principal;
use salon_queue_runtime::metrics::HubMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Deliveries a connection may have queued before it is dropped
pub const DEFAULT_CONNECTION_BUFFER: usize = 1024;

/// Identifier of one live connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection receives
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    /// State pulled right after a subscribe
    Snapshot {
        /// Topic the snapshot belongs to
        topic: Topic,
        /// The state
        snapshot: Snapshot,
    },
    /// A published event
    Event {
        /// Topic it was published on
        topic: Topic,
        /// The event
        event: OutboundEvent,
    },
}

/// One registered topic of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// Connection
    pub connection_id: ConnectionId,
    /// Who the connection belongs to
    pub principal: Principal,
    /// Subscribed topic
    pub topic: Topic,
}

struct Connection {
    principal: Principal,
    sender: mpsc::Sender<Delivery>,
    topics: BTreeSet<Topic>,
    /// Events held back until the topic's snapshot has been delivered
    pending: HashMap<Topic, Vec<OutboundEvent>>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    topics: HashMap<Topic, BTreeSet<ConnectionId>>,
}

impl Registry {
    /// Queue a delivery; false if the connection is closed or stopped reading
    fn deliver(&self, id: ConnectionId, delivery: Delivery) -> bool {
        let Some(connection) = self.connections.get(&id) else {
            return false;
        };
        match connection.sender.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = %id, "Connection buffer full, dropping connection");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(&id) else {
            return false;
        };
        for topic in connection.topics {
            self.detach(topic, id);
        }
        true
    }

    fn detach(&mut self, topic: Topic, id: ConnectionId) {
        if let Some(members) = self.topics.get_mut(&topic) {
            members.remove(&id);
            if members.is_empty() {
                self.topics.remove(&topic);
            }
        }
    }
}

/// Topic hub
///
/// # Example
///
/// ```ignore
/// let hub = Hub::new();
/// let (conn, mut rx) = hub.connect(Principal::Customer { user_id });
///
/// hub.subscribe(conn, Topic::User(user_id), |topic| service.snapshot(topic)).await?;
///
/// while let Some(delivery) = rx.recv().await {
///     // Snapshot first, then events in lane order
/// }
/// ```
pub struct Hub {
    registry: RwLock<Registry>,
    next_connection: AtomicU64,
    connection_buffer: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::with_connection_buffer(DEFAULT_CONNECTION_BUFFER)
    }
}

impl Hub {
    /// Creates an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty hub whose connections queue at most `capacity` deliveries
    #[must_use]
    pub fn with_connection_buffer(capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_connection: AtomicU64::new(0),
            connection_buffer: capacity.max(1),
        }
    }

    /// Register a connection for `principal`
    pub fn connect(&self, principal: Principal) -> (ConnectionId, mpsc::Receiver<Delivery>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.connection_buffer);

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.connections.insert(
            id,
            Connection {
                principal,
                sender,
                topics: BTreeSet::new(),
                pending: HashMap::new(),
            },
        );
        HubMetrics::record_connections(registry.connections.len());
        tracing::debug!(connection = %id, ?principal, "Connection registered");

        (id, receiver)
    }

    /// Remove a connection and all its subscriptions
    pub fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.remove_connection(id) {
            HubMetrics::record_connections(registry.connections.len());
            tracing::debug!(connection = %id, "Connection removed");
        }
    }

    /// Subscribe a connection to a topic, then deliver a snapshot
    ///
    /// Snapshot-on-subscribe is part of the contract: the hub keeps no history, so a
    /// (re)subscribing client always receives the current state first. Events
    /// published while the snapshot is being taken are held back and delivered right
    /// after it; some of them may already be reflected in the snapshot.
    ///
    /// # Errors
    ///
    /// - [`TopicError::UnknownConnection`] if the connection is gone
    /// - [`TopicError::Forbidden`] if the connection's principal may not read the topic
    pub async fn subscribe<F, Fut>(
        &self,
        id: ConnectionId,
        topic: Topic,
        snapshot: F,
    ) -> Result<(), TopicError>
    where
        F: FnOnce(Topic) -> Fut,
        Fut: Future<Output = Snapshot>,
    {
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let connection = registry
                .connections
                .get_mut(&id)
                .ok_or(TopicError::UnknownConnection(id))?;

            if !topic.authorizes(&connection.principal) {
                tracing::warn!(connection = %id, %topic, "Subscription refused");
                return Err(TopicError::Forbidden(topic));
            }

            connection.topics.insert(topic);
            connection.pending.insert(topic, Vec::new());
            registry.topics.entry(topic).or_default().insert(id);
        }

        let snapshot = snapshot(topic).await;

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = registry.connections.get_mut(&id) else {
            return Err(TopicError::UnknownConnection(id));
        };
        // Unsubscribed while the snapshot was taken
        let Some(held) = connection.pending.remove(&topic) else {
            return Ok(());
        };

        let mut delivered = registry.deliver(id, Delivery::Snapshot { topic, snapshot });
        for event in held {
            if !delivered {
                break;
            }
            delivered = registry.deliver(id, Delivery::Event { topic, event });
        }

        if delivered {
            tracing::debug!(connection = %id, %topic, "Subscribed");
        } else {
            registry.remove_connection(id);
            HubMetrics::record_pruned(1);
        }
        Ok(())
    }

    /// Remove one subscription; returns false if it did not exist
    pub fn unsubscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let removed = registry.connections.get_mut(&id).is_some_and(|connection| {
            connection.pending.remove(&topic);
            connection.topics.remove(&topic)
        });
        if removed {
            registry.detach(topic, id);
            tracing::debug!(connection = %id, %topic, "Unsubscribed");
        }
        removed
    }

    /// Deliver an event to every connection subscribed to `topic`
    ///
    /// Returns the number of connections that received it. Connections still
    /// waiting for the topic's snapshot hold the event back. Connections that are
    /// closed or stopped reading are pruned.
    ///
    /// Runs entirely under the write lock so a subscribe cannot flush its held
    /// events between deciding to hold this one and holding it.
    pub fn publish(&self, topic: &Topic, event: &OutboundEvent) -> usize {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = registry.topics.get(topic) else {
            tracing::trace!(%topic, event = event.name(), "No subscribers");
            return 0;
        };
        let members: Vec<ConnectionId> = members.iter().copied().collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in members {
            let Some(connection) = registry.connections.get_mut(&id) else {
                continue;
            };
            if let Some(held) = connection.pending.get_mut(topic) {
                held.push(event.clone());
                continue;
            }
            let delivery = Delivery::Event {
                topic: *topic,
                event: event.clone(),
            };
            if registry.deliver(id, delivery) {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            for id in &dead {
                registry.remove_connection(*id);
            }
            tracing::debug!(%topic, pruned = dead.len(), "Pruned closed connections");
            HubMetrics::record_pruned(dead.len());
            HubMetrics::record_connections(registry.connections.len());
        }

        HubMetrics::record_deliveries(delivered);
        tracing::trace!(%topic, event = event.name(), delivered, "Published");
        delivered
    }

    /// Current subscriptions of a connection
    #[must_use]
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<Subscription> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .connections
            .get(&id)
            .map(|connection| {
                connection
                    .topics
                    .iter()
                    .map(|topic| Subscription {
                        connection_id: id,
                        principal: connection.principal,
                        topic: *topic,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of connections subscribed to a topic
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .get(topic)
            .map_or(0, BTreeSet::len)
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }
}

impl EventPublisher for Hub {
    fn publish(&self, topic: &Topic, event: &OutboundEvent) {
        Self::publish(self, topic, event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use crate::types::{SalonId, UserId, WaitlistEntryId};
    use chrono::Utc;
    use std::sync::Arc;

    fn user_snapshot(user_id: UserId) -> Snapshot {
        Snapshot::User {
            user_id,
            departures: Vec::new(),
            waitlist: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    fn expired(entry_id: WaitlistEntryId) -> OutboundEvent {
        OutboundEvent::WaitlistEntryExpired {
            entry_id,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_precedes_events() {
        let hub = Hub::new();
        let user = UserId::new();
        let (conn, mut rx) = hub.connect(Principal::Customer { user_id: user });

        hub.subscribe(conn, Topic::User(user), |_| async move { user_snapshot(user) })
            .await
            .unwrap();
        hub.publish(&Topic::User(user), &expired(WaitlistEntryId::new()));

        assert!(matches!(rx.recv().await, Some(Delivery::Snapshot { .. })));
        assert!(matches!(rx.recv().await, Some(Delivery::Event { .. })));
    }

    #[tokio::test]
    async fn events_during_snapshot_are_delivered_after_it() {
        let hub = Hub::new();
        let user = UserId::new();
        let topic = Topic::User(user);
        let (conn, mut rx) = hub.connect(Principal::Customer { user_id: user });
        let entry = WaitlistEntryId::new();

        hub.subscribe(conn, topic, |_| {
            // Published while the snapshot is being taken
            hub.publish(&topic, &expired(entry));
            async move { user_snapshot(user) }
        })
        .await
        .unwrap();

        assert!(matches!(rx.recv().await, Some(Delivery::Snapshot { .. })));
        match rx.recv().await {
            Some(Delivery::Event {
                event: OutboundEvent::WaitlistEntryExpired { entry_id, .. },
                ..
            }) => assert_eq!(entry_id, entry),
            other => panic!("expected held event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_topics_are_forbidden() {
        let hub = Hub::new();
        let (conn, _rx) = hub.connect(Principal::Customer { user_id: UserId::new() });

        let result = hub
            .subscribe(conn, Topic::Salon(SalonId::new()), |_| async {
                user_snapshot(UserId::new())
            })
            .await;

        assert!(matches!(result, Err(TopicError::Forbidden(_))));
        assert_eq!(hub.subscriptions(conn).len(), 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let hub = Hub::new();
        let user = UserId::new();
        let topic = Topic::User(user);
        let (conn, rx) = hub.connect(Principal::Customer { user_id: user });
        hub.subscribe(conn, topic, |_| async move { user_snapshot(user) })
            .await
            .unwrap();

        drop(rx);

        assert_eq!(hub.publish(&topic, &expired(WaitlistEntryId::new())), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn events_racing_a_subscribe_arrive_without_gaps() {
        const EVENTS: usize = 2_000;

        let hub = Arc::new(Hub::with_connection_buffer(EVENTS + 8));
        let user = UserId::new();
        let topic = Topic::User(user);
        let entry = WaitlistEntryId::new();
        let (conn, mut rx) = hub.connect(Principal::Customer { user_id: user });

        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for position in 0..EVENTS {
                    let event = OutboundEvent::WaitlistPositionChanged {
                        entry_id: entry,
                        position,
                        previous_position: None,
                    };
                    hub.publish(&topic, &event);
                }
            })
        };

        hub.subscribe(conn, topic, |_| async move {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            user_snapshot(user)
        })
        .await
        .unwrap();
        publisher.join().unwrap();

        assert!(matches!(rx.try_recv(), Ok(Delivery::Snapshot { .. })));
        let mut positions = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            match delivery {
                Delivery::Event {
                    event: OutboundEvent::WaitlistPositionChanged { position, .. },
                    ..
                } => positions.push(position),
                other => panic!("unexpected delivery {other:?}"),
            }
        }

        // Every event after the subscription took effect, in order
        if let Some(first) = positions.first().copied() {
            let expected: Vec<usize> = (first..EVENTS).collect();
            assert_eq!(positions, expected);
        }
    }

    #[tokio::test]
    async fn connections_that_stop_reading_are_dropped() {
        let hub = Hub::with_connection_buffer(2);
        let user = UserId::new();
        let topic = Topic::User(user);
        let (conn, mut rx) = hub.connect(Principal::Customer { user_id: user });
        hub.subscribe(conn, topic, |_| async move { user_snapshot(user) })
            .await
            .unwrap();

        // Snapshot plus one event fill the buffer
        assert_eq!(hub.publish(&topic, &expired(WaitlistEntryId::new())), 1);
        assert_eq!(hub.publish(&topic, &expired(WaitlistEntryId::new())), 0);

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(&topic), 0);
        assert!(matches!(rx.recv().await, Some(Delivery::Snapshot { .. })));
        assert!(matches!(rx.recv().await, Some(Delivery::Event { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn unsubscribe_of_unknown_topic_is_false() {
        let hub = Hub::new();
        let user = UserId::new();
        let (conn, _rx) = hub.connect(Principal::Customer { user_id: user });

        assert!(!hub.unsubscribe(conn, Topic::User(user)));
    }
}
