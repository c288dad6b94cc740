//! Queue service: routes every command to its salon's lanes.
//!
//! Each salon gets two stores, started lazily on first use: a queue lane
//! (staff queues plus departure predictions) and a waitlist lane. A store
//! reduces one action at a time and publishes its events before the next one,
//! so per-salon ordering holds without any cross-salon locking.

use crate::aggregates::{
    JoinRequest, NewBooking, QueueAction, QueueEnvironment, QueueReducer, QueueStore,
    SalonQueueState, WaitlistAction, WaitlistEntry, WaitlistEnvironment, WaitlistReducer,
    WaitlistRejection, WaitlistState, WaitlistStore,
};
use crate::config::Config;
use crate::distribution::{
    ConnectionId, Delivery, EventPublisher, Hub, OverallStatus, Snapshot, Topic,
};
use crate::error::{QueueError, Result};
use crate::providers::{SlotAvailability, StaffDirectory, TravelBuffers};
use crate::types::{
    BookingId, Principal, ReleaseId, RequestId, SalonId, ServiceId, StaffId, StaffStatus,
    TimeWindow, UserId, WaitlistEntryId,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use salon_queue_core::environment::Clock;
use salon_queue_runtime::{HealthCheck, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Collaborators owned by other systems
#[derive(Clone)]
pub struct Collaborators {
    /// Clock for "now"
    pub clock: Arc<dyn Clock>,
    /// Staff → salon/name
    pub directory: Arc<dyn StaffDirectory>,
    /// Booking engine's view of open slots
    pub slots: Arc<dyn SlotAvailability>,
    /// Per-customer travel buffers
    pub travel: Arc<dyn TravelBuffers>,
}

/// Tunables shared by every lane
#[derive(Clone, Debug)]
pub struct LaneSettings {
    /// Minimum delay growth before a customer is alerted again
    pub delay_alert_threshold_minutes: i64,
    /// How long a customer has to answer an offer
    pub offer_timeout: TimeDelta,
    /// How long a command waits for its lane's reply
    pub request_timeout: Duration,
    /// Capacity of each lane's action broadcast
    pub broadcast_capacity: usize,
}

impl LaneSettings {
    /// Settings from the service configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            delay_alert_threshold_minutes: config.queue.delay_alert_threshold_minutes,
            offer_timeout: config.offer_timeout(),
            request_timeout: config.request_timeout(),
            broadcast_capacity: config.runtime.action_broadcast_capacity,
        }
    }
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A booked slot handed back by the booking engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedSlot {
    /// Service the slot was booked for
    pub service_id: ServiceId,
    /// Staff member of the slot, if any
    pub staff_id: Option<StaffId>,
    /// Slot date
    pub date: NaiveDate,
    /// Slot time
    pub window: TimeWindow,
}

/// Entry point for bookings, staff, waitlist and subscription traffic
pub struct QueueService {
    collaborators: Collaborators,
    settings: LaneSettings,
    hub: Arc<Hub>,
    queue_lanes: RwLock<HashMap<SalonId, Arc<QueueStore>>>,
    waitlist_lanes: RwLock<HashMap<SalonId, Arc<WaitlistStore>>>,
    entry_salons: RwLock<HashMap<WaitlistEntryId, SalonId>>,
}

impl QueueService {
    /// Creates a service with no lanes started
    #[must_use]
    pub fn new(collaborators: Collaborators, hub: Arc<Hub>, settings: LaneSettings) -> Self {
        Self {
            collaborators,
            settings,
            hub,
            queue_lanes: RwLock::new(HashMap::new()),
            waitlist_lanes: RwLock::new(HashMap::new()),
            entry_salons: RwLock::new(HashMap::new()),
        }
    }

    /// The distribution hub
    #[must_use]
    pub const fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Current time according to the injected clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.collaborators.clock.now()
    }

    fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.hub.clone()
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig::default().with_broadcast_capacity(self.settings.broadcast_capacity)
    }

    fn queue_lane(&self, salon_id: SalonId) -> Arc<QueueStore> {
        if let Some(lane) = self.existing_queue_lane(salon_id) {
            return lane;
        }
        let mut lanes = self
            .queue_lanes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(salon_id).or_insert_with(|| {
            tracing::info!(%salon_id, "Starting queue lane");
            let env = QueueEnvironment::new(
                Arc::clone(&self.collaborators.clock),
                Arc::clone(&self.collaborators.directory),
                Arc::clone(&self.collaborators.travel),
                self.publisher(),
                self.settings.delay_alert_threshold_minutes,
            );
            Arc::new(QueueStore::with_config(
                SalonQueueState::new(salon_id),
                QueueReducer::new(),
                env,
                self.store_config(),
            ))
        });
        Arc::clone(lane)
    }

    fn existing_queue_lane(&self, salon_id: SalonId) -> Option<Arc<QueueStore>> {
        self.queue_lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&salon_id)
            .cloned()
    }

    fn waitlist_lane(&self, salon_id: SalonId) -> Arc<WaitlistStore> {
        if let Some(lane) = self.existing_waitlist_lane(salon_id) {
            return lane;
        }
        let mut lanes = self
            .waitlist_lanes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(salon_id).or_insert_with(|| {
            tracing::info!(%salon_id, "Starting waitlist lane");
            let env = WaitlistEnvironment::new(
                Arc::clone(&self.collaborators.clock),
                Arc::clone(&self.collaborators.slots),
                self.publisher(),
                self.settings.offer_timeout,
            );
            Arc::new(WaitlistStore::with_config(
                WaitlistState::new(salon_id),
                WaitlistReducer::new(),
                env,
                self.store_config(),
            ))
        });
        Arc::clone(lane)
    }

    fn existing_waitlist_lane(&self, salon_id: SalonId) -> Option<Arc<WaitlistStore>> {
        self.waitlist_lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&salon_id)
            .cloned()
    }

    fn all_queue_lanes(&self) -> Vec<(SalonId, Arc<QueueStore>)> {
        self.queue_lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, lane)| (*id, Arc::clone(lane)))
            .collect()
    }

    fn all_waitlist_lanes(&self) -> Vec<(SalonId, Arc<WaitlistStore>)> {
        self.waitlist_lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, lane)| (*id, Arc::clone(lane)))
            .collect()
    }

    /// Salon a staff member works at, if known
    #[must_use]
    pub fn staff_salon(&self, staff_id: StaffId) -> Option<SalonId> {
        self.collaborators
            .directory
            .lookup(staff_id)
            .map(|profile| profile.salon_id)
    }

    // ========================================================================
    // Appointment and staff events
    // ========================================================================

    /// Route a staff-scoped event to its salon's queue lane
    ///
    /// Returns `false` when the staff member is unknown; the event is dropped.
    async fn dispatch_staff_event(&self, staff_id: StaffId, action: QueueAction) -> Result<bool> {
        let Some(profile) = self.collaborators.directory.lookup(staff_id) else {
            tracing::warn!(%staff_id, "Event for unknown staff member dropped");
            return Ok(false);
        };
        self.queue_lane(profile.salon_id).send(action).await?;
        Ok(true)
    }

    /// A confirmed booking joins a staff queue
    ///
    /// # Errors
    ///
    /// [`QueueError::LaneUnavailable`] if the lane is shutting down.
    pub async fn appointment_inserted(
        &self,
        staff_id: StaffId,
        booking: NewBooking,
        position: Option<usize>,
    ) -> Result<bool> {
        self.dispatch_staff_event(
            staff_id,
            QueueAction::AppointmentInserted {
                staff_id,
                booking,
                position,
            },
        )
        .await
    }

    /// Service started
    ///
    /// # Errors
    ///
    /// [`QueueError::LaneUnavailable`] if the lane is shutting down.
    pub async fn appointment_started(&self, staff_id: StaffId, booking_id: BookingId) -> Result<bool> {
        self.dispatch_staff_event(
            staff_id,
            QueueAction::AppointmentStarted {
                staff_id,
                booking_id,
            },
        )
        .await
    }

    /// Service ended; `actual_end` defaults to now
    ///
    /// # Errors
    ///
    /// [`QueueError::LaneUnavailable`] if the lane is shutting down.
    pub async fn appointment_completed(
        &self,
        staff_id: StaffId,
        booking_id: BookingId,
        actual_end: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let actual_end = actual_end.unwrap_or_else(|| self.now());
        self.dispatch_staff_event(
            staff_id,
            QueueAction::AppointmentCompleted {
                staff_id,
                booking_id,
                actual_end,
            },
        )
        .await
    }

    /// Booking cancelled
    ///
    /// # Errors
    ///
    /// [`QueueError::LaneUnavailable`] if the lane is shutting down.
    pub async fn appointment_cancelled(&self, staff_id: StaffId, booking_id: BookingId) -> Result<bool> {
        self.dispatch_staff_event(
            staff_id,
            QueueAction::AppointmentCancelled {
                staff_id,
                booking_id,
            },
        )
        .await
    }

    /// Operator changed a staff member's status
    ///
    /// # Errors
    ///
    /// [`QueueError::LaneUnavailable`] if the lane is shutting down.
    pub async fn staff_status_changed(&self, staff_id: StaffId, status: StaffStatus) -> Result<bool> {
        self.dispatch_staff_event(staff_id, QueueAction::StaffStatusChanged { staff_id, status })
            .await
    }

    // ========================================================================
    // Waitlist
    // ========================================================================

    /// A booked slot became free
    ///
    /// # Errors
    ///
    /// - [`QueueError::UnknownSalon`] if no staff member is registered for the salon
    /// - [`QueueError::LaneUnavailable`] if the lane is shutting down
    pub async fn slot_released(&self, salon_id: SalonId, slot: ReleasedSlot) -> Result<ReleaseId> {
        self.require_salon(salon_id)?;
        let release_id = ReleaseId::new();
        self.waitlist_lane(salon_id)
            .send(WaitlistAction::SlotReleased {
                release_id,
                service_id: slot.service_id,
                staff_id: slot.staff_id,
                date: slot.date,
                window: slot.window,
            })
            .await?;
        Ok(release_id)
    }

    /// Put a customer on a salon's waitlist
    ///
    /// # Errors
    ///
    /// - [`QueueError::UnknownSalon`] if no staff member is registered for the salon
    /// - [`QueueError::Rejected`] with `INVALID_REQUEST`, `SLOTS_AVAILABLE` or `DUPLICATE_ENTRY`
    /// - [`QueueError::LaneUnavailable`] if the lane did not answer in time
    pub async fn join_waitlist(&self, salon_id: SalonId, request: JoinRequest) -> Result<WaitlistEntry> {
        self.require_salon(salon_id)?;
        let request_id = RequestId::new();
        let entry_id = WaitlistEntryId::new();

        let entry = self
            .ask(
                salon_id,
                request_id,
                WaitlistAction::Join {
                    request_id,
                    entry_id,
                    request,
                },
            )
            .await?;

        self.entry_salons
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.entry_id, salon_id);
        Ok(entry)
    }

    /// Accept or decline the offer an entry holds
    ///
    /// # Errors
    ///
    /// - [`QueueError::Rejected`] with `ENTRY_NOT_FOUND`, `NO_PENDING_OFFER` or `OFFER_EXPIRED`
    /// - [`QueueError::LaneUnavailable`] if the lane did not answer in time
    pub async fn respond_to_offer(
        &self,
        entry_id: WaitlistEntryId,
        principal: &Principal,
        accept: bool,
    ) -> Result<WaitlistEntry> {
        let (salon_id, user_id) = self.route_entry(entry_id, principal)?;
        let request_id = RequestId::new();
        self.ask(
            salon_id,
            request_id,
            WaitlistAction::Respond {
                request_id,
                entry_id,
                user_id,
                accept,
            },
        )
        .await
    }

    /// Leave the waitlist
    ///
    /// # Errors
    ///
    /// - [`QueueError::Rejected`] with `ENTRY_NOT_FOUND` or `INVALID_REQUEST`
    /// - [`QueueError::LaneUnavailable`] if the lane did not answer in time
    pub async fn withdraw(&self, entry_id: WaitlistEntryId, principal: &Principal) -> Result<WaitlistEntry> {
        let (salon_id, user_id) = self.route_entry(entry_id, principal)?;
        let request_id = RequestId::new();
        self.ask(
            salon_id,
            request_id,
            WaitlistAction::Withdraw {
                request_id,
                entry_id,
                user_id,
            },
        )
        .await
    }

    /// Look up an entry, as seen by `principal`
    ///
    /// # Errors
    ///
    /// [`QueueError::Rejected`] with `ENTRY_NOT_FOUND` if the entry does not exist
    /// or is not visible to the caller.
    pub async fn waitlist_entry(
        &self,
        entry_id: WaitlistEntryId,
        principal: &Principal,
    ) -> Result<WaitlistEntry> {
        let (salon_id, user_id) = self.route_entry(entry_id, principal)?;
        let lane = self.waitlist_lane(salon_id);
        lane.state(|state| state.entry(entry_id).cloned())
            .await
            .filter(|entry| user_id.is_none_or(|user| user == entry.user_id))
            .ok_or(QueueError::Rejected(WaitlistRejection::EntryNotFound))
    }

    fn require_salon(&self, salon_id: SalonId) -> Result<()> {
        if self.collaborators.directory.has_salon(salon_id) {
            Ok(())
        } else {
            Err(QueueError::UnknownSalon(salon_id))
        }
    }

    /// Salon owning an entry, plus the customer to check ownership against
    ///
    /// Staff of the owning salon act without an ownership check; anyone else
    /// sees the entry as missing.
    fn route_entry(
        &self,
        entry_id: WaitlistEntryId,
        principal: &Principal,
    ) -> Result<(SalonId, Option<UserId>)> {
        let salon_id = self
            .entry_salons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entry_id)
            .copied()
            .ok_or(QueueError::Rejected(WaitlistRejection::EntryNotFound))?;

        match principal {
            Principal::Customer { user_id } => Ok((salon_id, Some(*user_id))),
            Principal::Staff { salon_id: staff_salon } if *staff_salon == salon_id => {
                Ok((salon_id, None))
            },
            Principal::Staff { .. } => Err(QueueError::Rejected(WaitlistRejection::EntryNotFound)),
        }
    }

    /// Send a waitlist command and wait for its correlated reply
    async fn ask(
        &self,
        salon_id: SalonId,
        request_id: RequestId,
        action: WaitlistAction,
    ) -> Result<WaitlistEntry> {
        let reply = self
            .waitlist_lane(salon_id)
            .send_and_wait_for(
                action,
                move |candidate: &WaitlistAction| candidate.is_reply_to(request_id),
                self.settings.request_timeout,
            )
            .await?;

        match reply {
            WaitlistAction::Replied { reply, .. } => Ok(reply.into_result()?),
            other => {
                tracing::error!(?other, "Reply predicate matched a non-reply action");
                Err(QueueError::LaneUnavailable(StoreError::ChannelClosed))
            },
        }
    }

    // ========================================================================
    // Distribution
    // ========================================================================

    /// Register a live connection
    pub fn connect(&self, principal: Principal) -> (ConnectionId, mpsc::Receiver<Delivery>) {
        self.hub.connect(principal)
    }

    /// Drop a live connection
    pub fn disconnect(&self, id: ConnectionId) {
        self.hub.disconnect(id);
    }

    /// Subscribe a connection, delivering a snapshot first
    ///
    /// # Errors
    ///
    /// [`QueueError::Topic`] if the connection is gone or may not read the topic.
    pub async fn subscribe(&self, id: ConnectionId, topic: Topic) -> Result<()> {
        self.hub
            .subscribe(id, topic, |topic| self.snapshot(topic))
            .await?;
        Ok(())
    }

    /// Remove one subscription
    pub fn unsubscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        self.hub.unsubscribe(id, topic)
    }

    /// Current state behind a topic
    pub async fn snapshot(&self, topic: Topic) -> Snapshot {
        let taken_at = self.now();

        match topic {
            Topic::Salon(salon_id) => {
                let queues = match self.existing_queue_lane(salon_id) {
                    Some(lane) => {
                        lane.state(|state| state.queues.values().cloned().collect::<Vec<_>>())
                            .await
                    },
                    None => Vec::new(),
                };
                let today = taken_at.date_naive();
                let (overall_status, _) =
                    OverallStatus::from_queues(queues.iter().filter(|q| q.date == today));
                let waitlist_open_entries = match self.existing_waitlist_lane(salon_id) {
                    Some(lane) => lane.state(WaitlistState::open_entry_count).await,
                    None => 0,
                };

                Snapshot::Salon {
                    salon_id,
                    queues,
                    overall_status,
                    waitlist_open_entries,
                    taken_at,
                }
            },
            Topic::User(user_id) => {
                let mut departures = Vec::new();
                for (_, lane) in self.all_queue_lanes() {
                    departures.extend(lane.state(|state| state.departures_for(user_id)).await);
                }
                let mut waitlist = Vec::new();
                for (_, lane) in self.all_waitlist_lanes() {
                    waitlist.extend(lane.state(|state| state.entries_for(user_id)).await);
                }

                Snapshot::User {
                    user_id,
                    departures,
                    waitlist,
                    taken_at,
                }
            },
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Re-evaluate every lane against the clock
    pub async fn tick(&self) {
        for (salon_id, lane) in self.all_queue_lanes() {
            if let Err(error) = lane.send(QueueAction::Tick).await {
                tracing::warn!(%salon_id, %error, "Queue tick rejected");
            }
        }
        for (salon_id, lane) in self.all_waitlist_lanes() {
            if let Err(error) = lane.send(WaitlistAction::Tick).await {
                tracing::warn!(%salon_id, %error, "Waitlist tick rejected");
            }
        }
    }

    /// Drop every queue of days before `today`
    pub async fn reset_day(&self, today: NaiveDate) {
        for (salon_id, lane) in self.all_queue_lanes() {
            if let Err(error) = lane.send(QueueAction::ResetDay { today }).await {
                tracing::warn!(%salon_id, %error, "Day reset rejected");
            }
        }
    }

    /// Health of every started lane
    #[must_use]
    pub fn health(&self) -> Vec<HealthCheck> {
        let queues = self
            .all_queue_lanes()
            .into_iter()
            .map(|(salon_id, lane)| lane.health(&format!("queue:{salon_id}")));
        let waitlists = self
            .all_waitlist_lanes()
            .into_iter()
            .map(|(salon_id, lane)| lane.health(&format!("waitlist:{salon_id}")));
        queues.chain(waitlists).collect()
    }

    /// Stop accepting commands and wait for in-flight work
    ///
    /// Pending offer timers count as in-flight work; lanes still holding them
    /// when `timeout` expires are reported and abandoned.
    pub async fn shutdown(&self, timeout: Duration) {
        for (salon_id, lane) in self.all_queue_lanes() {
            if let Err(error) = lane.shutdown(timeout).await {
                tracing::warn!(%salon_id, %error, "Queue lane did not drain");
            }
        }
        for (salon_id, lane) in self.all_waitlist_lanes() {
            if let Err(error) = lane.shutdown(timeout).await {
                tracing::warn!(%salon_id, %error, "Waitlist lane did not drain");
            }
        }
        tracing::info!("Queue service stopped");
    }
}
