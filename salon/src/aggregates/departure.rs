//! Departure predictor.
//!
//! Turns a staff queue into per-customer guidance: when service will really
//! start, and when to leave home to arrive on time. Runs inside the queue lane
//! right after a queue is recomputed, so predictions never lag the queue.

use super::staff_queue::{
    AppointmentStatus, NewBooking, QueueEnvironment, QueueKey, SalonQueueState, StaffQueue,
};
use crate::distribution::{OutboundEvent, Outbox, Topic};
use crate::types::{minutes_between, BookingId, SalonId, StaffId, StaffStatus, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use salon_queue_runtime::metrics::QueueMetrics;
use serde::{Deserialize, Serialize};

/// Delay reason while the staff member works late
pub const REASON_RUNNING_LATE: &str = "running_late";
/// Delay reason while the staff member is on a break
pub const REASON_ON_BREAK: &str = "staff_on_break";
/// Reason while the staff member is offline and the prediction is frozen
pub const REASON_STAFF_UNAVAILABLE: &str = "staff_unavailable";

/// A customer's live departure guidance for one booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartureStatus {
    /// Booking
    pub booking_id: BookingId,
    /// Customer
    pub user_id: UserId,
    /// Salon
    pub salon_id: SalonId,
    /// Staff member
    pub staff_id: StaffId,
    /// Booked start
    pub original_time: DateTime<Utc>,
    /// When service is now expected to start
    pub predicted_start_time: DateTime<Utc>,
    /// Predicted minus booked start, in minutes
    pub delay_minutes: i64,
    /// Why it is late, if it is
    pub delay_reason: Option<String>,
    /// Predicted start minus the customer's travel buffer
    pub suggested_departure_time: DateTime<Utc>,
    /// Staff display name
    pub staff_name: String,
    /// What the staff member is doing
    pub staff_status: StaffStatus,
    /// Unfinished appointments ahead of this one
    pub appointments_ahead: usize,
    /// Last time the guidance changed
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    last_alerted_delay: i64,
    #[serde(skip)]
    announced: bool,
}

impl DepartureStatus {
    /// Start tracking a freshly queued booking
    #[must_use]
    pub fn new(
        booking: &NewBooking,
        queue: &StaffQueue,
        travel_buffer: TimeDelta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            booking_id: booking.booking_id,
            user_id: booking.user_id,
            salon_id: queue.salon_id,
            staff_id: queue.staff_id,
            original_time: booking.scheduled_start,
            predicted_start_time: booking.scheduled_start,
            delay_minutes: 0,
            delay_reason: None,
            suggested_departure_time: leave_by(booking.scheduled_start, travel_buffer),
            staff_name: queue.staff_name.clone(),
            staff_status: queue.current_status,
            appointments_ahead: 0,
            updated_at: now,
            last_alerted_delay: 0,
            announced: false,
        }
    }

    /// Returns true while the prediction is frozen
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.delay_reason.as_deref() == Some(REASON_STAFF_UNAVAILABLE)
    }
}

/// Threshold crossings produced by one recompute
enum Alert {
    Delayed,
    CaughtUp { minutes_saved: i64 },
}

/// Re-derive the departure status of every unfinished booking in a queue
///
/// Publishes `DepartureStatusUpdate` only for statuses that changed, followed by
/// `DelayAlert` when the delay grew by at least the threshold since the last
/// alert and `QueueCaughtUp` when a positive delay dropped back to zero.
pub fn recompute_for_staff(
    state: &mut SalonQueueState,
    key: QueueKey,
    env: &QueueEnvironment,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) {
    let Some(queue) = state.queues.get(&key) else {
        return;
    };
    let frozen = queue.current_status.is_offline();
    let mut ahead = 0;

    for appointment in queue.appointments.iter().filter(|a| a.is_active()) {
        let Some(status) = state.departures.get_mut(&appointment.booking_id) else {
            ahead += 1;
            continue;
        };

        let before = status.clone();
        let mut alert = None;

        status.staff_name.clone_from(&queue.staff_name);
        status.staff_status = queue.current_status;
        status.appointments_ahead = ahead;

        match appointment.status {
            AppointmentStatus::InProgress { started_at } => {
                status.predicted_start_time = started_at;
                status.delay_minutes = minutes_between(status.original_time, started_at).max(0);
                status.delay_reason = None;
            },
            AppointmentStatus::Scheduled if frozen => {
                status.delay_reason = Some(REASON_STAFF_UNAVAILABLE.to_string());
            },
            AppointmentStatus::Scheduled => {
                let delay = queue.estimated_delay_minutes;
                status.delay_minutes = delay;
                status.predicted_start_time = TimeDelta::try_minutes(delay)
                    .and_then(|shift| status.original_time.checked_add_signed(shift))
                    .unwrap_or(status.original_time);
                status.delay_reason = (delay > 0).then(|| {
                    let reason = if queue.current_status == StaffStatus::OnBreak {
                        REASON_ON_BREAK
                    } else {
                        REASON_RUNNING_LATE
                    };
                    reason.to_string()
                });

                if delay > 0
                    && delay - status.last_alerted_delay >= env.delay_alert_threshold_minutes
                {
                    status.last_alerted_delay = delay;
                    alert = Some(Alert::Delayed);
                } else if delay <= 0 && before.delay_minutes > 0 {
                    status.last_alerted_delay = 0;
                    alert = Some(Alert::CaughtUp {
                        minutes_saved: before.delay_minutes,
                    });
                }
            },
            AppointmentStatus::Completed { .. } | AppointmentStatus::Cancelled => {},
        }

        status.suggested_departure_time =
            leave_by(status.predicted_start_time, env.travel.buffer_for(status.user_id));

        let changed = !status.announced || guidance_differs(&before, status);
        let topic = Topic::User(status.user_id);

        if changed {
            status.announced = true;
            status.updated_at = now;
            outbox.push(
                topic,
                OutboundEvent::DepartureStatusUpdate {
                    status: status.clone(),
                },
            );
        }

        match alert {
            Some(Alert::Delayed) => {
                tracing::info!(
                    booking_id = %status.booking_id,
                    delay_minutes = status.delay_minutes,
                    "Delay alert"
                );
                QueueMetrics::record_delay_alert();
                outbox.push(
                    topic,
                    OutboundEvent::DelayAlert {
                        booking_id: status.booking_id,
                        delay_minutes: status.delay_minutes,
                        new_departure_time: status.suggested_departure_time,
                        reason: status
                            .delay_reason
                            .clone()
                            .unwrap_or_else(|| REASON_RUNNING_LATE.to_string()),
                        timestamp: now,
                    },
                );
            },
            Some(Alert::CaughtUp { minutes_saved }) => {
                tracing::info!(booking_id = %status.booking_id, minutes_saved, "Queue caught up");
                QueueMetrics::record_caught_up();
                outbox.push(
                    topic,
                    OutboundEvent::QueueCaughtUp {
                        booking_id: status.booking_id,
                        new_departure_time: status.suggested_departure_time,
                        minutes_saved,
                        timestamp: now,
                    },
                );
            },
            None => {},
        }

        ahead += 1;
    }
}

/// Start time minus the travel buffer, clamped at the earliest representable instant
fn leave_by(start: DateTime<Utc>, travel_buffer: TimeDelta) -> DateTime<Utc> {
    start
        .checked_sub_signed(travel_buffer)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn guidance_differs(before: &DepartureStatus, after: &DepartureStatus) -> bool {
    before.predicted_start_time != after.predicted_start_time
        || before.delay_minutes != after.delay_minutes
        || before.delay_reason != after.delay_reason
        || before.suggested_departure_time != after.suggested_departure_time
        || before.staff_name != after.staff_name
        || before.staff_status != after.staff_status
        || before.appointments_ahead != after.appointments_ahead
}
