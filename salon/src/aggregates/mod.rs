//! Reducers for the two per-salon processing lanes.
//!
//! - [`staff_queue`] and [`departure`] form the queue lane: one store per salon
//!   owning every staff queue and every departure prediction derived from them.
//! - [`waitlist`] is the waitlist lane: one store per salon owning entries,
//!   released slots and the offer timers.

pub mod departure;
pub mod staff_queue;
pub mod waitlist;

pub use departure::DepartureStatus;
pub use staff_queue::{
    AppointmentStatus, NewBooking, QueueAction, QueueEnvironment, QueueReducer,
    QueuedAppointment, SalonQueueState, StaffQueue,
};
pub use waitlist::{
    EntryStatus, JoinRequest, OfferOutcome, WaitlistAction, WaitlistEntry, WaitlistEnvironment,
    WaitlistReducer, WaitlistRejection, WaitlistReply, WaitlistState,
};

use salon_queue_runtime::Store;

/// Store running one salon's queue lane
pub type QueueStore = Store<SalonQueueState, QueueAction, QueueEnvironment, QueueReducer>;

/// Store running one salon's waitlist lane
pub type WaitlistStore =
    Store<WaitlistState, WaitlistAction, WaitlistEnvironment, WaitlistReducer>;
