//! Staff queue tracker.
//!
//! One queue lane per salon owns every staff member's queue (per business day)
//! and every departure prediction derived from it. Appointment lifecycle events
//! come in, the affected queue is recomputed from its facts, the departure
//! predictor re-derives the customers' statuses, and the resulting events are
//! published in order before the lane takes its next action.
//!
//! Delay is never accumulated incrementally. It is the projected moment the
//! staff member becomes free minus the scheduled start of the next pending
//! appointment, floored at zero, so replaying an event cannot drift it.

use super::departure::{self, DepartureStatus};
use crate::distribution::{
    ClearReason, EventPublisher, OutboundEvent, OverallStatus, Outbox, Topic,
};
use crate::providers::{StaffDirectory, TravelBuffers};
use crate::types::{
    minutes_between, BookingId, SalonId, StaffId, StaffProfile, StaffStatus, UserId,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use salon_queue_core::{effect::Effect, environment::Clock, reducer::Reducer, SmallVec};
use salon_queue_runtime::metrics::QueueMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A staff member's queue for one business day
pub type QueueKey = (StaffId, NaiveDate);

/// Longest bookable service, in minutes
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

// ============================================================================
// State
// ============================================================================

/// A confirmed booking entering a staff queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    /// Booking ID
    pub booking_id: BookingId,
    /// Customer
    pub user_id: UserId,
    /// Scheduled start
    pub scheduled_start: DateTime<Utc>,
    /// Service duration in minutes
    pub duration_minutes: i64,
}

/// Lifecycle of a queued appointment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Not started yet
    Scheduled,
    /// In the chair
    InProgress {
        /// When service started
        started_at: DateTime<Utc>,
    },
    /// Finished
    Completed {
        /// When service actually ended
        ended_at: DateTime<Utc>,
    },
    /// Will not happen
    Cancelled,
}

/// An appointment reference in a staff queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAppointment {
    /// Booking ID
    pub booking_id: BookingId,
    /// Customer
    pub user_id: UserId,
    /// Scheduled start
    pub scheduled_start: DateTime<Utc>,
    /// Service duration in minutes
    pub duration_minutes: i64,
    /// Lifecycle status
    pub status: AppointmentStatus,
}

impl QueuedAppointment {
    /// Not started yet
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, AppointmentStatus::Scheduled)
    }

    /// Scheduled or in progress
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Scheduled | AppointmentStatus::InProgress { .. }
        )
    }

    /// Service duration
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::try_minutes(self.duration_minutes.clamp(0, MAX_DURATION_MINUTES))
            .unwrap_or_default()
    }
}

/// One staff member's queue for one business day
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffQueue {
    /// Staff member
    pub staff_id: StaffId,
    /// Salon
    pub salon_id: SalonId,
    /// Display name
    pub staff_name: String,
    /// Business day
    pub date: NaiveDate,
    /// What the staff member is doing
    pub current_status: StaffStatus,
    /// Appointments in service order
    pub appointments: Vec<QueuedAppointment>,
    /// Not-started appointments scheduled before now
    pub appointments_ahead: usize,
    /// Running lateness in minutes, 0 when on time
    pub estimated_delay_minutes: i64,
    /// When the staff member is projected to be free, if serving or late
    pub next_available_at: Option<DateTime<Utc>>,
    /// Last time a derived value changed
    pub updated_at: DateTime<Utc>,
}

impl StaffQueue {
    /// Creates an empty queue
    #[must_use]
    pub fn new(profile: &StaffProfile, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            staff_id: profile.staff_id,
            salon_id: profile.salon_id,
            staff_name: profile.name.clone(),
            date,
            current_status: StaffStatus::Idle,
            appointments: Vec::new(),
            appointments_ahead: 0,
            estimated_delay_minutes: 0,
            next_available_at: None,
            updated_at: now,
        }
    }

    /// Look up an appointment
    #[must_use]
    pub fn appointment(&self, booking_id: BookingId) -> Option<&QueuedAppointment> {
        self.appointments.iter().find(|a| a.booking_id == booking_id)
    }

    fn appointment_mut(&mut self, booking_id: BookingId) -> Option<&mut QueuedAppointment> {
        self.appointments
            .iter_mut()
            .find(|a| a.booking_id == booking_id)
    }

    /// The appointment being served, latest start wins
    #[must_use]
    pub fn in_progress(&self) -> Option<(&QueuedAppointment, DateTime<Utc>)> {
        self.appointments
            .iter()
            .filter_map(|a| match a.status {
                AppointmentStatus::InProgress { started_at } => Some((a, started_at)),
                _ => None,
            })
            .max_by_key(|(_, started_at)| *started_at)
    }

    /// First not-started appointment in service order
    #[must_use]
    pub fn next_pending(&self) -> Option<&QueuedAppointment> {
        self.appointments.iter().find(|a| a.is_pending())
    }

    /// Latest actual completion time
    #[must_use]
    pub fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        self.appointments
            .iter()
            .filter_map(|a| match a.status {
                AppointmentStatus::Completed { ended_at } => Some(ended_at),
                _ => None,
            })
            .max()
    }

    /// When the staff member is projected to be free
    ///
    /// While serving: the scheduled end of the current service, or now if it
    /// already overran. Otherwise: the last completion, or now.
    #[must_use]
    pub fn projected_free_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let free_at = match self.in_progress() {
            Some((appointment, started_at)) => started_at
                .checked_add_signed(appointment.duration())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => self.last_completed_at().unwrap_or(now),
        };
        free_at.max(now)
    }

    /// Number of not-started appointments scheduled before `now`
    #[must_use]
    pub fn pending_before(&self, now: DateTime<Utc>) -> usize {
        self.appointments
            .iter()
            .filter(|a| a.is_pending() && a.scheduled_start < now)
            .count()
    }

    /// Insert at an explicit index, or by scheduled start
    fn insert(&mut self, appointment: QueuedAppointment, position: Option<usize>) {
        let index = position.map_or_else(
            || {
                self.appointments
                    .iter()
                    .position(|a| a.scheduled_start > appointment.scheduled_start)
                    .unwrap_or(self.appointments.len())
            },
            |p| p.min(self.appointments.len()),
        );
        self.appointments.insert(index, appointment);
    }

    /// Status after the current service ended
    fn settle_status(&mut self, now: DateTime<Utc>) {
        if matches!(self.current_status, StaffStatus::OnBreak | StaffStatus::Offline) {
            return;
        }
        let next_due = self.next_pending().is_some_and(|a| a.scheduled_start <= now);
        self.current_status = if self.in_progress().is_some() || next_due {
            StaffStatus::Serving
        } else {
            StaffStatus::Idle
        };
    }

    /// Recompute derived values from the facts; returns true if any changed
    ///
    /// An offline staff member's delay is frozen at its last value.
    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let ahead = self.pending_before(now);

        let (delay, next_available) = if self.current_status.is_offline() {
            (self.estimated_delay_minutes, self.next_available_at)
        } else {
            let free_at = self.projected_free_at(now);
            let delay = self.next_pending().map_or(0, |next| {
                minutes_between(next.scheduled_start, free_at).max(0)
            });
            let next_available = (self.in_progress().is_some() || delay > 0).then_some(free_at);
            (delay, next_available)
        };

        let changed = ahead != self.appointments_ahead
            || delay != self.estimated_delay_minutes
            || next_available != self.next_available_at;

        if changed {
            self.appointments_ahead = ahead;
            self.estimated_delay_minutes = delay;
            self.next_available_at = next_available;
            self.updated_at = now;
        }
        changed
    }
}

/// State of one salon's queue lane
#[derive(Clone, Debug)]
pub struct SalonQueueState {
    /// Salon this lane owns
    pub salon_id: SalonId,
    /// Staff queues by staff and day
    pub queues: BTreeMap<QueueKey, StaffQueue>,
    /// Departure predictions by booking
    pub departures: BTreeMap<BookingId, DepartureStatus>,
    /// Which queue holds each booking
    bookings: HashMap<BookingId, QueueKey>,
}

impl SalonQueueState {
    /// Creates an empty lane state
    #[must_use]
    pub fn new(salon_id: SalonId) -> Self {
        Self {
            salon_id,
            queues: BTreeMap::new(),
            departures: BTreeMap::new(),
            bookings: HashMap::new(),
        }
    }

    /// A staff member's queue for a day
    #[must_use]
    pub fn queue(&self, staff_id: StaffId, date: NaiveDate) -> Option<&StaffQueue> {
        self.queues.get(&(staff_id, date))
    }

    /// The queue holding a booking
    #[must_use]
    pub fn queue_of(&self, booking_id: BookingId) -> Option<&StaffQueue> {
        self.bookings
            .get(&booking_id)
            .and_then(|key| self.queues.get(key))
    }

    /// Every queue of a day
    pub fn queues_on(&self, date: NaiveDate) -> impl Iterator<Item = &StaffQueue> {
        self.queues.values().filter(move |q| q.date == date)
    }

    /// A customer's departure statuses
    #[must_use]
    pub fn departures_for(&self, user_id: UserId) -> Vec<DepartureStatus> {
        self.departures
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect()
    }

    fn keys_of(&self, staff_id: StaffId) -> Vec<QueueKey> {
        self.queues
            .keys()
            .filter(|(staff, _)| *staff == staff_id)
            .copied()
            .collect()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Actions of the queue lane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueAction {
    /// A confirmed booking joins a staff queue
    AppointmentInserted {
        /// Staff member
        staff_id: StaffId,
        /// The booking
        booking: NewBooking,
        /// Explicit index (walk-ins), otherwise ordered by start
        position: Option<usize>,
    },
    /// Service started
    AppointmentStarted {
        /// Staff member
        staff_id: StaffId,
        /// Booking
        booking_id: BookingId,
    },
    /// Service ended (on time, late or early)
    AppointmentCompleted {
        /// Staff member
        staff_id: StaffId,
        /// Booking
        booking_id: BookingId,
        /// When service actually ended
        actual_end: DateTime<Utc>,
    },
    /// Booking cancelled
    AppointmentCancelled {
        /// Staff member
        staff_id: StaffId,
        /// Booking
        booking_id: BookingId,
    },
    /// Operator changed a staff member's status
    StaffStatusChanged {
        /// Staff member
        staff_id: StaffId,
        /// New status
        status: StaffStatus,
    },
    /// Periodic re-evaluation
    Tick,
    /// Drop every queue of days before `today`
    ResetDay {
        /// The current business day
        today: NaiveDate,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the queue lane
#[derive(Clone)]
pub struct QueueEnvironment {
    /// Clock for "now"
    pub clock: Arc<dyn Clock>,
    /// Staff → salon/name
    pub directory: Arc<dyn StaffDirectory>,
    /// Per-customer travel buffers
    pub travel: Arc<dyn TravelBuffers>,
    /// Where events go
    pub publisher: Arc<dyn EventPublisher>,
    /// Minimum delay increase before a customer is alerted again
    pub delay_alert_threshold_minutes: i64,
}

impl QueueEnvironment {
    /// Creates a new `QueueEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        directory: Arc<dyn StaffDirectory>,
        travel: Arc<dyn TravelBuffers>,
        publisher: Arc<dyn EventPublisher>,
        delay_alert_threshold_minutes: i64,
    ) -> Self {
        Self {
            clock,
            directory,
            travel,
            publisher,
            delay_alert_threshold_minutes,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the queue lane (tracker plus departure predictor)
#[derive(Clone, Debug, Default)]
pub struct QueueReducer;

impl QueueReducer {
    /// Creates a new `QueueReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Staff profile, if the staff member belongs to this lane's salon
    fn profile_in_salon(
        state: &SalonQueueState,
        staff_id: StaffId,
        env: &QueueEnvironment,
    ) -> Option<StaffProfile> {
        match env.directory.lookup(staff_id) {
            Some(profile) if profile.salon_id == state.salon_id => Some(profile),
            Some(profile) => {
                tracing::warn!(
                    %staff_id,
                    salon_id = %state.salon_id,
                    staff_salon = %profile.salon_id,
                    "Staff member belongs to another salon, event dropped"
                );
                None
            },
            None => {
                tracing::warn!(%staff_id, "Unknown staff member, event dropped");
                None
            },
        }
    }

    /// Queue key of a booking, checked against the reporting staff member
    fn key_for(
        state: &SalonQueueState,
        staff_id: StaffId,
        booking_id: BookingId,
    ) -> Option<QueueKey> {
        match state.bookings.get(&booking_id) {
            Some(key) if key.0 == staff_id => Some(*key),
            Some(key) => {
                tracing::warn!(
                    %booking_id,
                    %staff_id,
                    owner = %key.0,
                    "Booking is queued with another staff member, event dropped"
                );
                None
            },
            None => {
                tracing::debug!(%booking_id, %staff_id, "Unknown booking, event ignored");
                None
            },
        }
    }

    fn insert(
        state: &mut SalonQueueState,
        staff_id: StaffId,
        booking: NewBooking,
        position: Option<usize>,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(profile) = Self::profile_in_salon(state, staff_id, env) else {
            return;
        };
        if state.bookings.contains_key(&booking.booking_id) {
            tracing::debug!(booking_id = %booking.booking_id, "Booking already queued");
            return;
        }
        if !(1..=MAX_DURATION_MINUTES).contains(&booking.duration_minutes) {
            tracing::warn!(
                booking_id = %booking.booking_id,
                duration_minutes = booking.duration_minutes,
                "Booking duration out of range, event dropped"
            );
            return;
        }

        let key = (staff_id, booking.scheduled_start.date_naive());
        let queue = state
            .queues
            .entry(key)
            .or_insert_with(|| StaffQueue::new(&profile, key.1, now));

        queue.insert(
            QueuedAppointment {
                booking_id: booking.booking_id,
                user_id: booking.user_id,
                scheduled_start: booking.scheduled_start,
                duration_minutes: booking.duration_minutes,
                status: AppointmentStatus::Scheduled,
            },
            position,
        );
        state.bookings.insert(booking.booking_id, key);
        state.departures.insert(
            booking.booking_id,
            DepartureStatus::new(
                &booking,
                queue,
                env.travel.buffer_for(booking.user_id),
                now,
            ),
        );

        tracing::info!(
            booking_id = %booking.booking_id,
            %staff_id,
            scheduled_start = %booking.scheduled_start,
            "Appointment queued"
        );
        Self::recompute(state, key, env, now, outbox);
    }

    fn start(
        state: &mut SalonQueueState,
        staff_id: StaffId,
        booking_id: BookingId,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(key) = Self::key_for(state, staff_id, booking_id) else {
            return;
        };
        let Some(queue) = state.queues.get_mut(&key) else {
            return;
        };
        let Some(appointment) = queue.appointment_mut(booking_id) else {
            return;
        };
        if !appointment.is_pending() {
            tracing::debug!(%booking_id, status = ?appointment.status, "Start ignored");
            return;
        }

        appointment.status = AppointmentStatus::InProgress { started_at: now };
        queue.current_status = StaffStatus::Serving;

        tracing::info!(%booking_id, %staff_id, "Appointment started");
        Self::recompute(state, key, env, now, outbox);
    }

    #[allow(clippy::too_many_arguments)] // lane handlers share one shape
    fn finish(
        state: &mut SalonQueueState,
        staff_id: StaffId,
        booking_id: BookingId,
        outcome: AppointmentStatus,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(key) = Self::key_for(state, staff_id, booking_id) else {
            return;
        };
        let Some(queue) = state.queues.get_mut(&key) else {
            return;
        };
        let Some(appointment) = queue.appointment_mut(booking_id) else {
            return;
        };
        if !appointment.is_active() {
            // Replayed completion or cancellation
            tracing::debug!(%booking_id, status = ?appointment.status, "Already finished");
            return;
        }

        appointment.status = outcome;
        let user_id = appointment.user_id;
        queue.settle_status(now);

        let reason = match outcome {
            AppointmentStatus::Cancelled => ClearReason::Cancelled,
            _ => ClearReason::Completed,
        };
        tracing::info!(%booking_id, %staff_id, ?reason, "Appointment finished");

        if state.departures.remove(&booking_id).is_some() {
            outbox.push(
                Topic::User(user_id),
                OutboundEvent::DepartureCleared {
                    booking_id,
                    reason,
                    timestamp: now,
                },
            );
        }
        Self::recompute(state, key, env, now, outbox);
    }

    fn change_status(
        state: &mut SalonQueueState,
        staff_id: StaffId,
        status: StaffStatus,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(profile) = Self::profile_in_salon(state, staff_id, env) else {
            return;
        };

        let mut keys = state.keys_of(staff_id);
        if keys.is_empty() {
            let key = (staff_id, now.date_naive());
            state
                .queues
                .insert(key, StaffQueue::new(&profile, key.1, now));
            keys.push(key);
        }

        tracing::info!(%staff_id, %status, "Staff status changed");
        for key in keys {
            if let Some(queue) = state.queues.get_mut(&key) {
                if queue.current_status == status {
                    continue;
                }
                queue.current_status = status;
                queue.updated_at = now;
                Self::recompute(state, key, env, now, outbox);
            }
        }
    }

    fn tick(
        state: &mut SalonQueueState,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        Self::reset_before(state, now.date_naive(), now, outbox);

        let keys: Vec<QueueKey> = state.queues.keys().copied().collect();
        for key in keys {
            let changed = state
                .queues
                .get_mut(&key)
                .is_some_and(|queue| queue.refresh(now));
            if changed {
                Self::publish_queue(state, key, now, outbox);
                departure::recompute_for_staff(state, key, env, now, outbox);
            }
        }
    }

    fn reset_before(
        state: &mut SalonQueueState,
        today: NaiveDate,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let stale: Vec<QueueKey> = state
            .queues
            .keys()
            .filter(|(_, date)| *date < today)
            .copied()
            .collect();
        if stale.is_empty() {
            return;
        }

        for key in &stale {
            state.queues.remove(key);
        }
        let SalonQueueState {
            bookings,
            departures,
            ..
        } = state;
        bookings.retain(|booking_id, key| {
            let keep = key.1 >= today;
            if !keep {
                if let Some(status) = departures.remove(booking_id) {
                    outbox.push(
                        Topic::User(status.user_id),
                        OutboundEvent::DepartureCleared {
                            booking_id: *booking_id,
                            reason: ClearReason::DayClosed,
                            timestamp: now,
                        },
                    );
                }
            }
            keep
        });

        tracing::info!(salon_id = %state.salon_id, dropped = stale.len(), %today, "Day reset");
    }

    /// Refresh a queue, announce it, and re-derive its customers' departures
    fn recompute(
        state: &mut SalonQueueState,
        key: QueueKey,
        env: &QueueEnvironment,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(queue) = state.queues.get_mut(&key) else {
            return;
        };
        queue.refresh(now);
        queue.updated_at = now;

        Self::publish_queue(state, key, now, outbox);
        departure::recompute_for_staff(state, key, env, now, outbox);
    }

    /// `StaffUpdate` and `SalonQueueUpdate` on the salon topic
    fn publish_queue(
        state: &SalonQueueState,
        key: QueueKey,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(queue) = state.queues.get(&key) else {
            return;
        };
        let topic = Topic::Salon(state.salon_id);

        outbox.push(
            topic,
            OutboundEvent::StaffUpdate {
                salon_id: state.salon_id,
                queue: queue.clone(),
            },
        );

        let staff: Vec<StaffQueue> = state.queues_on(key.1).cloned().collect();
        let (overall_status, average_delay_minutes) = OverallStatus::from_queues(&staff);
        let max_delay = staff
            .iter()
            .map(|q| q.estimated_delay_minutes)
            .max()
            .unwrap_or(0);
        QueueMetrics::record_max_delay(&state.salon_id.to_string(), max_delay);

        outbox.push(
            topic,
            OutboundEvent::SalonQueueUpdate {
                salon_id: state.salon_id,
                date: key.1,
                staff,
                overall_status,
                average_delay_minutes,
                updated_at: now,
            },
        );
    }
}

impl Reducer for QueueReducer {
    type State = SalonQueueState;
    type Action = QueueAction;
    type Environment = QueueEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let now = env.clock.now();
        let mut outbox = Outbox::new();

        match action {
            QueueAction::AppointmentInserted {
                staff_id,
                booking,
                position,
            } => Self::insert(state, staff_id, booking, position, env, now, &mut outbox),

            QueueAction::AppointmentStarted {
                staff_id,
                booking_id,
            } => Self::start(state, staff_id, booking_id, env, now, &mut outbox),

            QueueAction::AppointmentCompleted {
                staff_id,
                booking_id,
                actual_end,
            } => Self::finish(
                state,
                staff_id,
                booking_id,
                AppointmentStatus::Completed { ended_at: actual_end },
                env,
                now,
                &mut outbox,
            ),

            QueueAction::AppointmentCancelled {
                staff_id,
                booking_id,
            } => Self::finish(
                state,
                staff_id,
                booking_id,
                AppointmentStatus::Cancelled,
                env,
                now,
                &mut outbox,
            ),

            QueueAction::StaffStatusChanged { staff_id, status } => {
                Self::change_status(state, staff_id, status, env, now, &mut outbox);
            },

            QueueAction::Tick => Self::tick(state, env, now, &mut outbox),

            QueueAction::ResetDay { today } => Self::reset_before(state, today, now, &mut outbox),
        }

        outbox.into_effect(&env.publisher).into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use crate::distribution::RecordingPublisher;
    use crate::providers::{FixedTravelBuffers, InMemoryStaffDirectory};
    use salon_queue_testing::{assertions, helpers::at, test_clock, ReducerTest};

    struct Fixture {
        salon_id: SalonId,
        staff_id: StaffId,
        publisher: Arc<RecordingPublisher>,
        env: QueueEnvironment,
    }

    fn fixture() -> Fixture {
        let salon_id = SalonId::new();
        let staff_id = StaffId::new();
        let directory = InMemoryStaffDirectory::with_staff([StaffProfile {
            staff_id,
            salon_id,
            name: "Alex".to_string(),
        }]);
        let publisher = Arc::new(RecordingPublisher::new());
        let env = QueueEnvironment::new(
            Arc::new(test_clock()),
            Arc::new(directory),
            Arc::new(FixedTravelBuffers::new(TimeDelta::minutes(20))),
            publisher.clone(),
            10,
        );
        Fixture {
            salon_id,
            staff_id,
            publisher,
            env,
        }
    }

    fn booking(start_offset_minutes: i64, duration_minutes: i64) -> NewBooking {
        NewBooking {
            booking_id: BookingId::new(),
            user_id: UserId::new(),
            scheduled_start: at(test_clock().now(), start_offset_minutes),
            duration_minutes,
        }
    }

    fn insert(staff_id: StaffId, booking: &NewBooking) -> QueueAction {
        QueueAction::AppointmentInserted {
            staff_id,
            booking: booking.clone(),
            position: None,
        }
    }

    #[test]
    fn insert_orders_by_scheduled_start() {
        let f = fixture();
        let late = booking(60, 30);
        let early = booking(0, 30);
        let staff_id = f.staff_id;
        let (late_id, early_id) = (late.booking_id, early.booking_id);

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([insert(staff_id, &late)])
            .when_action(insert(staff_id, &early))
            .then_state(move |state| {
                let queue = state.queue_of(early_id).unwrap();
                let order: Vec<_> = queue.appointments.iter().map(|a| a.booking_id).collect();
                assert_eq!(order, vec![early_id, late_id]);
                assert_eq!(state.departures.len(), 2);
            })
            .then_effects(|effects| assert_eq!(assertions::publication_count(effects), 1))
            .run();
    }

    #[test]
    fn out_of_range_durations_are_dropped() {
        let f = fixture();
        let staff_id = f.staff_id;
        let endless = booking(0, 1_000_000_000_000);
        let endless_id = endless.booking_id;

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([
                insert(staff_id, &endless),
                insert(staff_id, &booking(30, 0)),
                insert(staff_id, &booking(60, MAX_DURATION_MINUTES + 1)),
                QueueAction::AppointmentStarted {
                    staff_id,
                    booking_id: endless_id,
                },
            ])
            .when_action(QueueAction::Tick)
            .then_state(|state| {
                assert!(state.bookings.is_empty());
                assert!(state.departures.is_empty());
            })
            .run();
    }

    #[test]
    fn longest_service_projects_without_overflow() {
        let f = fixture();
        let staff_id = f.staff_id;
        let long = booking(0, MAX_DURATION_MINUTES);
        let long_id = long.booking_id;

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([insert(staff_id, &long)])
            .when_action(QueueAction::AppointmentStarted {
                staff_id,
                booking_id: long_id,
            })
            .then_state(move |state| {
                let queue = state.queue_of(long_id).unwrap();
                let now = test_clock().now();
                assert_eq!(
                    queue.projected_free_at(now),
                    now + TimeDelta::minutes(MAX_DURATION_MINUTES)
                );
            })
            .run();
    }

    #[test]
    fn walk_in_inserted_at_explicit_position() {
        let f = fixture();
        let first = booking(0, 30);
        let second = booking(30, 30);
        let walk_in = booking(10, 15);
        let staff_id = f.staff_id;
        let walk_in_id = walk_in.booking_id;

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([insert(staff_id, &first), insert(staff_id, &second)])
            .when_action(QueueAction::AppointmentInserted {
                staff_id,
                booking: walk_in,
                position: Some(0),
            })
            .then_state(move |state| {
                let queue = state.queue_of(walk_in_id).unwrap();
                assert_eq!(queue.appointments[0].booking_id, walk_in_id);
            })
            .run();
    }

    #[test]
    fn unknown_staff_is_dropped() {
        let f = fixture();
        let stranger = StaffId::new();

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .when_action(insert(stranger, &booking(0, 30)))
            .then_state(|state| assert!(state.queues.is_empty()))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn cancel_of_unknown_booking_is_a_no_op() {
        let f = fixture();

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .when_action(QueueAction::AppointmentCancelled {
                staff_id: f.staff_id,
                booking_id: BookingId::new(),
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn late_completion_sets_delay_and_next_available() {
        let f = fixture();
        let first = booking(0, 60);
        let second = booking(60, 60);
        let staff_id = f.staff_id;
        let first_id = first.booking_id;
        let now = test_clock().now();

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([
                insert(staff_id, &first),
                insert(staff_id, &second),
                QueueAction::AppointmentStarted {
                    staff_id,
                    booking_id: first_id,
                },
            ])
            .when_action(QueueAction::AppointmentCompleted {
                staff_id,
                booking_id: first_id,
                actual_end: at(now, 75),
            })
            .then_state(move |state| {
                let queue = state.queue_of(first_id).unwrap();
                assert_eq!(queue.estimated_delay_minutes, 15);
                assert_eq!(queue.next_available_at, Some(at(now, 75)));
                assert_eq!(queue.current_status, StaffStatus::Idle);
                assert!(!state.departures.contains_key(&first_id));
            })
            .run();
    }

    #[test]
    fn completion_replay_is_idempotent() {
        let f = fixture();
        let first = booking(0, 60);
        let second = booking(60, 60);
        let staff_id = f.staff_id;
        let first_id = first.booking_id;
        let completed = QueueAction::AppointmentCompleted {
            staff_id,
            booking_id: first_id,
            actual_end: at(test_clock().now(), 75),
        };

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([
                insert(staff_id, &first),
                insert(staff_id, &second),
                completed.clone(),
            ])
            .when_action(completed)
            .then_state(move |state| {
                assert_eq!(state.queue_of(first_id).unwrap().estimated_delay_minutes, 15);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn serving_overrun_uses_now_as_free_time() {
        let clock = test_clock();
        let mut queue = StaffQueue::new(
            &StaffProfile {
                staff_id: StaffId::new(),
                salon_id: SalonId::new(),
                name: "Sam".to_string(),
            },
            clock.now().date_naive(),
            clock.now(),
        );
        let started_at = at(clock.now(), -90);
        queue.insert(
            QueuedAppointment {
                booking_id: BookingId::new(),
                user_id: UserId::new(),
                scheduled_start: started_at,
                duration_minutes: 60,
                status: AppointmentStatus::InProgress { started_at },
            },
            None,
        );
        queue.insert(
            QueuedAppointment {
                booking_id: BookingId::new(),
                user_id: UserId::new(),
                scheduled_start: at(clock.now(), -30),
                duration_minutes: 30,
                status: AppointmentStatus::Scheduled,
            },
            None,
        );

        assert!(queue.refresh(clock.now()));
        assert_eq!(queue.estimated_delay_minutes, 30);
        assert_eq!(queue.appointments_ahead, 1);
        assert_eq!(queue.next_available_at, Some(clock.now()));
    }

    #[test]
    fn status_change_publishes_salon_update() {
        let f = fixture();
        let salon_topic = Topic::Salon(f.salon_id);
        let publisher = f.publisher.clone();

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .when_action(QueueAction::StaffStatusChanged {
                staff_id: f.staff_id,
                status: StaffStatus::Offline,
            })
            .run();

        let events = publisher.on_topic(&salon_topic);
        assert!(matches!(
            events.last(),
            Some(OutboundEvent::SalonQueueUpdate {
                overall_status: OverallStatus::Closed,
                ..
            })
        ));
    }

    #[test]
    fn reset_day_drops_earlier_queues() {
        let f = fixture();
        let staff_id = f.staff_id;
        let today = booking(0, 30);
        let yesterday = booking(-24 * 60, 30);
        let (today_id, yesterday_id) = (today.booking_id, yesterday.booking_id);

        ReducerTest::new(QueueReducer::new())
            .with_env(f.env)
            .given_state(SalonQueueState::new(f.salon_id))
            .given_actions([insert(staff_id, &today), insert(staff_id, &yesterday)])
            .when_action(QueueAction::ResetDay {
                today: test_clock().now().date_naive(),
            })
            .then_state(move |state| {
                assert_eq!(state.queues.len(), 1);
                assert!(state.departures.contains_key(&today_id));
                assert!(!state.departures.contains_key(&yesterday_id));
                assert!(state.queue_of(yesterday_id).is_none());
            })
            .then_effects(|effects| assert_eq!(assertions::publication_count(effects), 1))
            .run();
    }

    #[test]
    fn reset_day_clears_departures_of_earlier_days() {
        let f = fixture();
        let mut state = SalonQueueState::new(f.salon_id);
        let yesterday = booking(-24 * 60, 30);
        let reducer = QueueReducer::new();
        let _ = reducer.reduce(&mut state, insert(f.staff_id, &yesterday), &f.env);
        f.publisher.clear();

        let effects = reducer.reduce(
            &mut state,
            QueueAction::ResetDay {
                today: test_clock().now().date_naive(),
            },
            &f.env,
        );
        for effect in effects {
            if let Effect::Publish(publication) = effect {
                publication();
            }
        }

        let events = f.publisher.on_topic(&Topic::User(yesterday.user_id));
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::DepartureCleared {
                reason: ClearReason::DayClosed,
                booking_id,
                ..
            }] if *booking_id == yesterday.booking_id
        ));
    }
}
