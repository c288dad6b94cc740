//! The closed set of messages pushed to subscribers.

use crate::aggregates::departure::DepartureStatus;
use crate::aggregates::staff_queue::StaffQueue;
use crate::aggregates::waitlist::{OfferOutcome, WaitlistEntry};
use crate::types::{
    BookingId, ReleaseId, SalonId, ServiceId, StaffId, TimeWindow, UserId, WaitlistEntryId,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Salon-wide summary of how late things are running
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Nobody is running late
    OnTime,
    /// Some lateness
    Delayed,
    /// Average delay of working staff is 30 minutes or more
    HeavilyDelayed,
    /// Every staff member is offline
    Closed,
}

impl OverallStatus {
    /// Average delay at which a salon counts as heavily delayed
    pub const HEAVY_DELAY_MINUTES: i64 = 30;

    /// Derive the salon status from its staff queues
    #[must_use]
    pub fn from_queues<'a>(queues: impl IntoIterator<Item = &'a StaffQueue>) -> (Self, i64) {
        let mut working = 0_i64;
        let mut total_delay = 0_i64;
        let mut any = false;

        for queue in queues {
            any = true;
            if !queue.current_status.is_offline() {
                working += 1;
                total_delay += queue.estimated_delay_minutes.max(0);
            }
        }

        if !any {
            return (Self::OnTime, 0);
        }
        if working == 0 {
            return (Self::Closed, 0);
        }

        let average = total_delay / working;
        let status = if average >= Self::HEAVY_DELAY_MINUTES {
            Self::HeavilyDelayed
        } else if total_delay > 0 {
            Self::Delayed
        } else {
            Self::OnTime
        };
        (status, average)
    }
}

/// Why a departure status went away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    /// Appointment finished
    Completed,
    /// Appointment was cancelled
    Cancelled,
    /// The business day it belonged to is over
    DayClosed,
}

/// Event pushed to a topic
///
/// Consumers de-duplicate on the entity id plus the event timestamp; replays of
/// an unchanged fact never produce a new event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// All staff queues of a salon for one day (`salon:{id}`)
    SalonQueueUpdate {
        /// Salon
        salon_id: SalonId,
        /// Business day
        date: NaiveDate,
        /// Every staff queue of that day
        staff: Vec<StaffQueue>,
        /// Summary status
        overall_status: OverallStatus,
        /// Average delay across working staff
        average_delay_minutes: i64,
        /// When the summary was computed
        updated_at: DateTime<Utc>,
    },

    /// One staff member's queue changed (`salon:{id}`)
    StaffUpdate {
        /// Salon
        salon_id: SalonId,
        /// The recomputed queue
        queue: StaffQueue,
    },

    /// A customer's departure prediction changed (`user:{id}`)
    DepartureStatusUpdate {
        /// The new status
        status: DepartureStatus,
    },

    /// A customer's departure prediction is no longer tracked (`user:{id}`)
    DepartureCleared {
        /// Booking
        booking_id: BookingId,
        /// Why it was cleared
        reason: ClearReason,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// Predicted delay grew past the alert threshold (`user:{id}`)
    DelayAlert {
        /// Booking
        booking_id: BookingId,
        /// Current delay
        delay_minutes: i64,
        /// When the customer should now leave
        new_departure_time: DateTime<Utc>,
        /// Why it is late
        reason: String,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A delayed booking is back on time (`user:{id}`)
    QueueCaughtUp {
        /// Booking
        booking_id: BookingId,
        /// When the customer should now leave
        new_departure_time: DateTime<Utc>,
        /// Delay that disappeared
        minutes_saved: i64,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A slot is offered to a waitlisted customer (`user:{id}`)
    WaitlistOffer {
        /// Entry
        entry_id: WaitlistEntryId,
        /// Released slot
        release_id: ReleaseId,
        /// Salon
        salon_id: SalonId,
        /// Service
        service_id: ServiceId,
        /// Staff member of the slot, if any
        staff_id: Option<StaffId>,
        /// Slot date
        date: NaiveDate,
        /// Slot time
        window: TimeWindow,
        /// Answer before this instant
        accept_deadline: DateTime<Utc>,
    },

    /// An offer was accepted (`user:{id}` and `salon:{id}`)
    ///
    /// The booking engine finalizes the booking from this event.
    WaitlistOfferAccepted {
        /// Entry
        entry_id: WaitlistEntryId,
        /// Released slot
        release_id: ReleaseId,
        /// Customer
        user_id: UserId,
        /// Salon
        salon_id: SalonId,
        /// Service
        service_id: ServiceId,
        /// Staff member of the slot, if any
        staff_id: Option<StaffId>,
        /// Slot date
        date: NaiveDate,
        /// Slot time
        window: TimeWindow,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// An offer lapsed or was declined (`user:{id}`)
    WaitlistOfferExpired {
        /// Entry
        entry_id: WaitlistEntryId,
        /// Released slot
        release_id: ReleaseId,
        /// Lapsed or declined
        outcome: OfferOutcome,
        /// Whether the entry went back into the queue
        returned_to_queue: bool,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// An entry's rank changed (`user:{id}`)
    WaitlistPositionChanged {
        /// Entry
        entry_id: WaitlistEntryId,
        /// New 1-based position
        position: usize,
        /// Previous position
        previous_position: Option<usize>,
    },

    /// A listing ran past its date window (`user:{id}`)
    WaitlistEntryExpired {
        /// Entry
        entry_id: WaitlistEntryId,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// Nobody on the waitlist took a released slot (`salon:{id}`)
    SlotUnclaimed {
        /// Released slot
        release_id: ReleaseId,
        /// Salon
        salon_id: SalonId,
        /// Service
        service_id: ServiceId,
        /// Staff member of the slot, if any
        staff_id: Option<StaffId>,
        /// Slot date
        date: NaiveDate,
        /// Slot time
        window: TimeWindow,
        /// When
        timestamp: DateTime<Utc>,
    },
}

impl OutboundEvent {
    /// The snake_case event name, as used in the `type` tag
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SalonQueueUpdate { .. } => "salon_queue_update",
            Self::StaffUpdate { .. } => "staff_update",
            Self::DepartureStatusUpdate { .. } => "departure_status_update",
            Self::DepartureCleared { .. } => "departure_cleared",
            Self::DelayAlert { .. } => "delay_alert",
            Self::QueueCaughtUp { .. } => "queue_caught_up",
            Self::WaitlistOffer { .. } => "waitlist_offer",
            Self::WaitlistOfferAccepted { .. } => "waitlist_offer_accepted",
            Self::WaitlistOfferExpired { .. } => "waitlist_offer_expired",
            Self::WaitlistPositionChanged { .. } => "waitlist_position_changed",
            Self::WaitlistEntryExpired { .. } => "waitlist_entry_expired",
            Self::SlotUnclaimed { .. } => "slot_unclaimed",
        }
    }
}

/// State pulled for a topic right after subscribing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    /// Salon topic snapshot
    Salon {
        /// Salon
        salon_id: SalonId,
        /// Every tracked staff queue
        queues: Vec<StaffQueue>,
        /// Summary status over the queues
        overall_status: OverallStatus,
        /// Entries currently waiting or holding an offer
        waitlist_open_entries: usize,
        /// When the snapshot was taken
        taken_at: DateTime<Utc>,
    },
    /// User topic snapshot
    User {
        /// Customer
        user_id: UserId,
        /// Departure statuses across salons
        departures: Vec<DepartureStatus>,
        /// Non-terminal waitlist entries across salons
        waitlist: Vec<WaitlistEntry>,
        /// When the snapshot was taken
        taken_at: DateTime<Utc>,
    },
}
