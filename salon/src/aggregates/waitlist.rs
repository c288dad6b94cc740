//! Waitlist manager.
//!
//! Customers who found no open slot queue up for one. When a booked slot is
//! released, the best-ranked eligible entry gets an exclusive offer with a
//! deadline; a decline, a lapse or a withdrawal cascades the slot to the next
//! candidate, and a slot nobody can take is announced as unclaimed.
//!
//! Ranking is first-come-first-served, except that entries which already let an
//! offer pass move behind entries that never had one. Within one queue key
//! (service, staff preference, requested date) at most one entry holds an offer
//! at a time, and one slot is never on offer twice; releases that would break
//! either rule wait in `pending`.

use crate::distribution::{EventPublisher, OutboundEvent, Outbox, Topic};
use crate::providers::{SlotAvailability, SlotQuery};
use crate::types::{
    ReleaseId, RequestId, SalonId, ServiceId, StaffId, TimeWindow, UserId, WaitlistEntryId,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use salon_queue_core::{
    effect::{Effect, EffectId},
    environment::Clock,
    reducer::Reducer,
    SmallVec,
};
use salon_queue_runtime::metrics::WaitlistMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted date flexibility, in days either side
pub const MAX_FLEXIBILITY_DAYS: i64 = 14;

/// Entries competing for the same slots: service, staff preference, requested date
pub type WaitlistKey = (ServiceId, Option<StaffId>, NaiveDate);

// ============================================================================
// Errors
// ============================================================================

/// Why the waitlist refused a command
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitlistRejection {
    /// Matching slots can be booked directly
    #[error("Open slots exist for the requested dates and window")]
    SlotsAvailable,

    /// The customer is already waiting for this
    #[error("An open waitlist entry already exists for this request")]
    DuplicateEntry,

    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Answer arrived after the accept deadline
    #[error("The offer has expired")]
    OfferExpired,

    /// Entry holds no offer to answer
    #[error("No pending offer for this entry")]
    NoPendingOffer,

    /// No such entry (or not visible to the caller)
    #[error("Waitlist entry not found")]
    EntryNotFound,
}

impl WaitlistRejection {
    /// Stable error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SlotsAvailable => "SLOTS_AVAILABLE",
            Self::DuplicateEntry => "DUPLICATE_ENTRY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::OfferExpired => "OFFER_EXPIRED",
            Self::NoPendingOffer => "NO_PENDING_OFFER",
            Self::EntryNotFound => "ENTRY_NOT_FOUND",
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a waitlist entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for a slot
    Active,
    /// Holding an offer
    Notified,
    /// Took a slot
    Accepted,
    /// Declined an offer after the listing ran out
    Declined,
    /// Listing ran past its dates
    Expired,
    /// Withdrawn by the customer
    Cancelled,
}

impl EntryStatus {
    /// Waiting or holding an offer
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Notified)
    }
}

/// How an offer ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    /// Customer took the slot
    Accepted,
    /// Customer said no
    Declined,
    /// Deadline passed without an answer
    Lapsed,
    /// Customer left the waitlist while holding the offer
    Withdrawn,
}

/// What a customer asks to wait for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Customer
    pub user_id: UserId,
    /// Service
    pub service_id: ServiceId,
    /// Specific staff member, or any
    pub staff_id: Option<StaffId>,
    /// Preferred date
    pub requested_date: NaiveDate,
    /// Acceptable time of day
    pub window: TimeWindow,
    /// Days either side of `requested_date` that are also acceptable
    pub flexibility_days: i64,
}

/// A customer waiting for a slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    /// Entry
    pub entry_id: WaitlistEntryId,
    /// Customer
    pub user_id: UserId,
    /// Salon
    pub salon_id: SalonId,
    /// Service
    pub service_id: ServiceId,
    /// Specific staff member, or any
    pub staff_id: Option<StaffId>,
    /// Preferred date
    pub requested_date: NaiveDate,
    /// Acceptable time of day
    pub window: TimeWindow,
    /// Days either side of `requested_date`
    pub flexibility_days: i64,
    /// Lifecycle status
    pub status: EntryStatus,
    /// 1-based rank within its queue key while open
    pub position: Option<usize>,
    /// When the customer joined
    pub joined_at: DateTime<Utc>,
    /// End of the last acceptable window
    pub expires_at: DateTime<Utc>,
    /// When the current offer was sent
    pub notified_at: Option<DateTime<Utc>>,
    /// Current offer's deadline
    pub accept_deadline: Option<DateTime<Utc>>,
    /// Slot currently offered
    pub current_offer: Option<ReleaseId>,
    /// Offers declined or left to lapse
    pub passed_offers: u32,
    /// How the most recent offer ended
    pub last_offer_outcome: Option<OfferOutcome>,
    /// When the entry reached a terminal status
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    join_seq: u64,
    #[serde(skip)]
    offer_seq: u64,
}

impl WaitlistEntry {
    /// Queue key this entry competes in
    #[must_use]
    pub const fn key(&self) -> WaitlistKey {
        (self.service_id, self.staff_id, self.requested_date)
    }

    /// Sort key; lower ranks first
    #[must_use]
    pub const fn rank(&self) -> (bool, DateTime<Utc>, u64) {
        (self.passed_offers > 0, self.joined_at, self.join_seq)
    }

    /// Returns true if the entry may be offered `release` at `now`
    #[must_use]
    pub fn is_eligible_for(&self, release: &SlotRelease, now: DateTime<Utc>) -> bool {
        let staff_matches = match (self.staff_id, release.staff_id) {
            (None, _) => true,
            (Some(wanted), Some(offered)) => wanted == offered,
            (Some(_), None) => false,
        };
        let day_distance = (release.date - self.requested_date).num_days().abs();

        self.status == EntryStatus::Active
            && self.service_id == release.service_id
            && staff_matches
            && self.window.overlaps(&release.window)
            && day_distance <= self.flexibility_days
            && !release.passed_over.contains(&self.entry_id)
            && self.expires_at > now
    }
}

/// Where a released slot stands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Waiting for a candidate
    Open,
    /// Offered to an entry
    Offered {
        /// Entry holding the offer
        entry_id: WaitlistEntryId,
    },
    /// Taken from the waitlist
    Claimed {
        /// Entry that accepted
        entry_id: WaitlistEntryId,
    },
    /// Nobody on the waitlist could take it
    Unfilled,
}

/// A booked slot that became free
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRelease {
    /// Release
    pub release_id: ReleaseId,
    /// Service the slot was booked for
    pub service_id: ServiceId,
    /// Staff member of the slot, if any
    pub staff_id: Option<StaffId>,
    /// Slot date
    pub date: NaiveDate,
    /// Slot time
    pub window: TimeWindow,
    /// When it was released
    pub released_at: DateTime<Utc>,
    /// Where it stands
    pub status: ReleaseStatus,
    /// Entries that already let this slot pass
    pub passed_over: BTreeSet<WaitlistEntryId>,
}

impl SlotRelease {
    /// Returns true if both releases free the same service, staff, date and time
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        self.service_id == other.service_id
            && self.staff_id == other.staff_id
            && self.date == other.date
            && self.window == other.window
    }

    /// When the slot starts
    #[must_use]
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.window.start).and_utc()
    }
}

/// State of one salon's waitlist lane
#[derive(Clone, Debug)]
pub struct WaitlistState {
    /// Salon this lane owns
    pub salon_id: SalonId,
    /// Entries by id
    pub entries: BTreeMap<WaitlistEntryId, WaitlistEntry>,
    /// Releases by id
    pub releases: BTreeMap<ReleaseId, SlotRelease>,
    /// Open releases waiting for a candidate, in order
    pending: VecDeque<ReleaseId>,
    next_join_seq: u64,
}

impl WaitlistState {
    /// Creates an empty waitlist
    #[must_use]
    pub const fn new(salon_id: SalonId) -> Self {
        Self {
            salon_id,
            entries: BTreeMap::new(),
            releases: BTreeMap::new(),
            pending: VecDeque::new(),
            next_join_seq: 0,
        }
    }

    /// Look up an entry
    #[must_use]
    pub fn entry(&self, entry_id: WaitlistEntryId) -> Option<&WaitlistEntry> {
        self.entries.get(&entry_id)
    }

    /// Entries waiting or holding an offer
    #[must_use]
    pub fn open_entry_count(&self) -> usize {
        self.entries.values().filter(|e| e.status.is_open()).count()
    }

    /// A customer's open entries
    #[must_use]
    pub fn entries_for(&self, user_id: UserId) -> Vec<WaitlistEntry> {
        self.entries
            .values()
            .filter(|e| e.user_id == user_id && e.status.is_open())
            .cloned()
            .collect()
    }

    /// Releases waiting for a candidate
    #[must_use]
    pub fn pending_releases(&self) -> Vec<ReleaseId> {
        self.pending.iter().copied().collect()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Outcome of a waitlist command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WaitlistReply {
    /// Entry created
    Joined {
        /// The new entry
        entry: WaitlistEntry,
    },
    /// Offer accepted
    Accepted {
        /// The entry
        entry: WaitlistEntry,
    },
    /// Offer declined
    Declined {
        /// The entry
        entry: WaitlistEntry,
    },
    /// Entry withdrawn
    Withdrawn {
        /// The entry
        entry: WaitlistEntry,
    },
    /// Command refused
    Rejected {
        /// Why
        rejection: WaitlistRejection,
    },
}

impl WaitlistReply {
    /// The entry, or the rejection
    ///
    /// # Errors
    ///
    /// Returns the rejection carried by a `Rejected` reply.
    pub fn into_result(self) -> Result<WaitlistEntry, WaitlistRejection> {
        match self {
            Self::Joined { entry }
            | Self::Accepted { entry }
            | Self::Declined { entry }
            | Self::Withdrawn { entry } => Ok(entry),
            Self::Rejected { rejection } => Err(rejection),
        }
    }
}

/// Actions of the waitlist lane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistAction {
    /// Customer asks to wait for a slot
    Join {
        /// Correlation id for the reply
        request_id: RequestId,
        /// Id the entry will get
        entry_id: WaitlistEntryId,
        /// What is asked for
        request: JoinRequest,
    },
    /// A booked slot became free
    SlotReleased {
        /// Release
        release_id: ReleaseId,
        /// Service
        service_id: ServiceId,
        /// Staff member of the slot, if any
        staff_id: Option<StaffId>,
        /// Slot date
        date: NaiveDate,
        /// Slot time
        window: TimeWindow,
    },
    /// Customer answers an offer
    Respond {
        /// Correlation id for the reply
        request_id: RequestId,
        /// Entry
        entry_id: WaitlistEntryId,
        /// Caller; `None` for staff of the salon
        user_id: Option<UserId>,
        /// Take the slot?
        accept: bool,
    },
    /// Customer leaves the waitlist
    Withdraw {
        /// Correlation id for the reply
        request_id: RequestId,
        /// Entry
        entry_id: WaitlistEntryId,
        /// Caller; `None` for staff of the salon
        user_id: Option<UserId>,
    },
    /// An offer's deadline timer fired
    OfferDeadlineElapsed {
        /// Entry
        entry_id: WaitlistEntryId,
        /// Which offer the timer belongs to
        offer_seq: u64,
    },
    /// Periodic re-evaluation
    Tick,
    /// Reply to a command (observed by the caller, no state change)
    Replied {
        /// Correlation id
        request_id: RequestId,
        /// The outcome
        reply: WaitlistReply,
    },
}

impl WaitlistAction {
    /// Returns true if this is the reply to `request_id`
    #[must_use]
    pub fn is_reply_to(&self, request_id: RequestId) -> bool {
        matches!(self, Self::Replied { request_id: id, .. } if *id == request_id)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the waitlist lane
#[derive(Clone)]
pub struct WaitlistEnvironment {
    /// Clock for "now"
    pub clock: Arc<dyn Clock>,
    /// Booking engine's view of open slots
    pub slots: Arc<dyn SlotAvailability>,
    /// Where events go
    pub publisher: Arc<dyn EventPublisher>,
    /// How long a customer has to answer an offer
    pub offer_timeout: TimeDelta,
}

impl WaitlistEnvironment {
    /// Creates a new `WaitlistEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        slots: Arc<dyn SlotAvailability>,
        publisher: Arc<dyn EventPublisher>,
        offer_timeout: TimeDelta,
    ) -> Self {
        Self {
            clock,
            slots,
            publisher,
            offer_timeout,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Timer key of one offer
#[must_use]
pub fn offer_timer_id(entry_id: WaitlistEntryId, offer_seq: u64) -> EffectId {
    EffectId::new(format!("offer:{entry_id}:{offer_seq}"))
}

/// Per-action scratch: the clock reading and everything to emit
struct Pass<'a> {
    env: &'a WaitlistEnvironment,
    now: DateTime<Utc>,
    outbox: Outbox,
    effects: SmallVec<[Effect<WaitlistAction>; 4]>,
}

enum Attempt {
    Offered,
    Blocked,
    Unfilled,
    Skipped,
}

fn shift(date: NaiveDate, days: i64) -> NaiveDate {
    date.checked_add_signed(TimeDelta::days(days))
        .unwrap_or(date)
}

/// Reducer for the waitlist lane
#[derive(Clone, Debug, Default)]
pub struct WaitlistReducer;

impl WaitlistReducer {
    /// Creates a new `WaitlistReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate(request: &JoinRequest, now: DateTime<Utc>) -> Result<DateTime<Utc>, WaitlistRejection> {
        if !request.window.is_valid() {
            return Err(WaitlistRejection::InvalidRequest(
                "window end must be after its start".to_string(),
            ));
        }
        if !(0..=MAX_FLEXIBILITY_DAYS).contains(&request.flexibility_days) {
            return Err(WaitlistRejection::InvalidRequest(format!(
                "flexibility must be between 0 and {MAX_FLEXIBILITY_DAYS} days"
            )));
        }
        let expires_at = request
            .window
            .end_on(shift(request.requested_date, request.flexibility_days));
        if expires_at <= now {
            return Err(WaitlistRejection::InvalidRequest(
                "requested dates are in the past".to_string(),
            ));
        }
        Ok(expires_at)
    }

    fn join(
        state: &mut WaitlistState,
        entry_id: WaitlistEntryId,
        request: JoinRequest,
        pass: &mut Pass<'_>,
    ) -> Result<WaitlistEntry, WaitlistRejection> {
        let expires_at = Self::validate(&request, pass.now)?;

        let query = SlotQuery {
            salon_id: state.salon_id,
            service_id: request.service_id,
            staff_id: request.staff_id,
            from: shift(request.requested_date, -request.flexibility_days),
            to: shift(request.requested_date, request.flexibility_days),
            window: request.window,
        };
        if pass.env.slots.has_open_slots(&query) {
            return Err(WaitlistRejection::SlotsAvailable);
        }

        let duplicate = state.entries.contains_key(&entry_id)
            || state.entries.values().any(|e| {
                e.status.is_open()
                    && e.user_id == request.user_id
                    && e.service_id == request.service_id
                    && e.staff_id == request.staff_id
                    && e.requested_date == request.requested_date
            });
        if duplicate {
            return Err(WaitlistRejection::DuplicateEntry);
        }

        let entry = WaitlistEntry {
            entry_id,
            user_id: request.user_id,
            salon_id: state.salon_id,
            service_id: request.service_id,
            staff_id: request.staff_id,
            requested_date: request.requested_date,
            window: request.window,
            flexibility_days: request.flexibility_days,
            status: EntryStatus::Active,
            position: None,
            joined_at: pass.now,
            expires_at,
            notified_at: None,
            accept_deadline: None,
            current_offer: None,
            passed_offers: 0,
            last_offer_outcome: None,
            closed_at: None,
            join_seq: state.next_join_seq,
            offer_seq: 0,
        };
        state.next_join_seq += 1;
        state.entries.insert(entry_id, entry);

        tracing::info!(
            %entry_id,
            user_id = %request.user_id,
            service_id = %request.service_id,
            requested_date = %request.requested_date,
            "Joined waitlist"
        );
        WaitlistMetrics::record_join();

        Self::reposition(state, pass);
        Self::drain_pending(state, pass);

        state
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(WaitlistRejection::EntryNotFound)
    }

    fn release(
        state: &mut WaitlistState,
        release: SlotRelease,
        pass: &mut Pass<'_>,
    ) {
        if state.releases.contains_key(&release.release_id) {
            tracing::debug!(release_id = %release.release_id, "Release already known");
            return;
        }
        tracing::info!(
            release_id = %release.release_id,
            service_id = %release.service_id,
            date = %release.date,
            window = %release.window,
            "Slot released"
        );
        state.pending.push_back(release.release_id);
        state.releases.insert(release.release_id, release);
        Self::drain_pending(state, pass);
    }

    /// Entry visible to `user_id` (`None` is salon staff)
    fn visible_entry(
        state: &WaitlistState,
        entry_id: WaitlistEntryId,
        user_id: Option<UserId>,
    ) -> Result<&WaitlistEntry, WaitlistRejection> {
        state
            .entries
            .get(&entry_id)
            .filter(|e| user_id.is_none_or(|user| user == e.user_id))
            .ok_or(WaitlistRejection::EntryNotFound)
    }

    fn respond(
        state: &mut WaitlistState,
        entry_id: WaitlistEntryId,
        user_id: Option<UserId>,
        accept: bool,
        pass: &mut Pass<'_>,
    ) -> Result<WaitlistEntry, WaitlistRejection> {
        let entry = Self::visible_entry(state, entry_id, user_id)?;
        if entry.status != EntryStatus::Notified {
            // The deadline already ended the latest offer
            if entry.last_offer_outcome == Some(OfferOutcome::Lapsed) {
                return Err(WaitlistRejection::OfferExpired);
            }
            return Err(WaitlistRejection::NoPendingOffer);
        }
        let seq = entry.offer_seq;
        let expired = entry.accept_deadline.is_none_or(|deadline| pass.now >= deadline);

        pass.effects.push(Effect::Cancel(offer_timer_id(entry_id, seq)));

        if expired {
            Self::resolve_offer(state, entry_id, OfferOutcome::Lapsed, pass);
            return Err(WaitlistRejection::OfferExpired);
        }
        if accept {
            Self::accept(state, entry_id, pass);
        } else {
            Self::resolve_offer(state, entry_id, OfferOutcome::Declined, pass);
        }

        state
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(WaitlistRejection::EntryNotFound)
    }

    fn accept(state: &mut WaitlistState, entry_id: WaitlistEntryId, pass: &mut Pass<'_>) {
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return;
        };
        let Some(release_id) = entry.current_offer.take() else {
            return;
        };
        entry.status = EntryStatus::Accepted;
        entry.closed_at = Some(pass.now);
        entry.last_offer_outcome = Some(OfferOutcome::Accepted);
        let user_id = entry.user_id;

        let Some(release) = state.releases.get_mut(&release_id) else {
            return;
        };
        release.status = ReleaseStatus::Claimed { entry_id };

        let event = OutboundEvent::WaitlistOfferAccepted {
            entry_id,
            release_id,
            user_id,
            salon_id: state.salon_id,
            service_id: release.service_id,
            staff_id: release.staff_id,
            date: release.date,
            window: release.window,
            timestamp: pass.now,
        };
        pass.outbox.push(Topic::User(user_id), event.clone());
        pass.outbox.push(Topic::Salon(state.salon_id), event);

        tracing::info!(%entry_id, %release_id, "Offer accepted");
        WaitlistMetrics::record_accept();

        Self::reposition(state, pass);
        Self::drain_pending(state, pass);
    }

    fn withdraw(
        state: &mut WaitlistState,
        entry_id: WaitlistEntryId,
        user_id: Option<UserId>,
        pass: &mut Pass<'_>,
    ) -> Result<WaitlistEntry, WaitlistRejection> {
        let entry = Self::visible_entry(state, entry_id, user_id)?;
        let offer_seq = entry.offer_seq;
        match entry.status {
            EntryStatus::Cancelled => return Ok(entry.clone()),
            EntryStatus::Notified => {
                pass.effects
                    .push(Effect::Cancel(offer_timer_id(entry_id, offer_seq)));
                Self::resolve_offer(state, entry_id, OfferOutcome::Withdrawn, pass);
            },
            EntryStatus::Active => {
                if let Some(entry) = state.entries.get_mut(&entry_id) {
                    entry.status = EntryStatus::Cancelled;
                    entry.closed_at = Some(pass.now);
                }
                Self::reposition(state, pass);
            },
            EntryStatus::Accepted | EntryStatus::Declined | EntryStatus::Expired => {
                return Err(WaitlistRejection::InvalidRequest(
                    "entry is already closed".to_string(),
                ));
            },
        }

        tracing::info!(%entry_id, "Left waitlist");
        state
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(WaitlistRejection::EntryNotFound)
    }

    fn deadline_elapsed(
        state: &mut WaitlistState,
        entry_id: WaitlistEntryId,
        offer_seq: u64,
        pass: &mut Pass<'_>,
    ) {
        let current = state
            .entries
            .get(&entry_id)
            .is_some_and(|e| e.status == EntryStatus::Notified && e.offer_seq == offer_seq);
        if !current {
            tracing::debug!(%entry_id, offer_seq, "Stale offer deadline ignored");
            return;
        }
        Self::resolve_offer(state, entry_id, OfferOutcome::Lapsed, pass);
    }

    /// End an offer that was not accepted, then cascade the slot
    fn resolve_offer(
        state: &mut WaitlistState,
        entry_id: WaitlistEntryId,
        outcome: OfferOutcome,
        pass: &mut Pass<'_>,
    ) {
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return;
        };
        let Some(release_id) = entry.current_offer.take() else {
            tracing::warn!(%entry_id, "Notified entry without an offer");
            return;
        };

        let returned = outcome != OfferOutcome::Withdrawn && entry.expires_at > pass.now;
        if matches!(outcome, OfferOutcome::Declined | OfferOutcome::Lapsed) {
            entry.passed_offers += 1;
        }
        entry.last_offer_outcome = Some(outcome);
        entry.notified_at = None;
        entry.accept_deadline = None;
        entry.status = match outcome {
            OfferOutcome::Withdrawn => EntryStatus::Cancelled,
            _ if returned => EntryStatus::Active,
            OfferOutcome::Declined => EntryStatus::Declined,
            _ => EntryStatus::Expired,
        };
        if !entry.status.is_open() {
            entry.closed_at = Some(pass.now);
        }
        let user_id = entry.user_id;

        if let Some(release) = state.releases.get_mut(&release_id) {
            release.passed_over.insert(entry_id);
            release.status = ReleaseStatus::Open;
            state.pending.push_front(release_id);
        }

        pass.outbox.push(
            Topic::User(user_id),
            OutboundEvent::WaitlistOfferExpired {
                entry_id,
                release_id,
                outcome,
                returned_to_queue: returned,
                timestamp: pass.now,
            },
        );
        if outcome == OfferOutcome::Lapsed {
            WaitlistMetrics::record_expired();
        }
        tracing::info!(%entry_id, %release_id, ?outcome, returned, "Offer ended");

        Self::reposition(state, pass);
        Self::drain_pending(state, pass);
    }

    /// Offer every pending release that can be offered now
    fn drain_pending(state: &mut WaitlistState, pass: &mut Pass<'_>) {
        let queued: Vec<ReleaseId> = state.pending.drain(..).collect();
        for release_id in queued {
            match Self::try_offer(state, release_id, pass) {
                Attempt::Blocked => state.pending.push_back(release_id),
                Attempt::Offered | Attempt::Unfilled | Attempt::Skipped => {},
            }
        }
    }

    fn try_offer(state: &mut WaitlistState, release_id: ReleaseId, pass: &mut Pass<'_>) -> Attempt {
        let Some(release) = state.releases.get(&release_id) else {
            return Attempt::Skipped;
        };
        if release.status != ReleaseStatus::Open {
            return Attempt::Skipped;
        }
        if release.starts_at() <= pass.now {
            Self::mark_unfilled(state, release_id, pass);
            return Attempt::Unfilled;
        }
        let slot_on_offer = state.releases.values().any(|other| {
            other.release_id != release_id
                && other.same_slot(release)
                && matches!(other.status, ReleaseStatus::Offered { .. })
        });
        if slot_on_offer {
            tracing::debug!(%release_id, "Same slot already on offer, release waits");
            return Attempt::Blocked;
        }

        let busy: HashSet<WaitlistKey> = state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Notified)
            .map(WaitlistEntry::key)
            .collect();

        let mut candidates: Vec<&WaitlistEntry> = state
            .entries
            .values()
            .filter(|e| e.is_eligible_for(release, pass.now))
            .collect();
        if candidates.is_empty() {
            Self::mark_unfilled(state, release_id, pass);
            return Attempt::Unfilled;
        }
        candidates.sort_by_key(|e| e.rank());

        let Some(chosen) = candidates
            .iter()
            .find(|e| !busy.contains(&e.key()))
            .map(|e| e.entry_id)
        else {
            tracing::debug!(%release_id, "Every candidate's queue holds an offer, release waits");
            return Attempt::Blocked;
        };

        Self::offer(state, release_id, chosen, pass);
        Attempt::Offered
    }

    fn offer(
        state: &mut WaitlistState,
        release_id: ReleaseId,
        entry_id: WaitlistEntryId,
        pass: &mut Pass<'_>,
    ) {
        let deadline = pass.now + pass.env.offer_timeout;
        let (Some(entry), Some(release)) = (
            state.entries.get_mut(&entry_id),
            state.releases.get_mut(&release_id),
        ) else {
            return;
        };

        entry.status = EntryStatus::Notified;
        entry.notified_at = Some(pass.now);
        entry.accept_deadline = Some(deadline);
        entry.current_offer = Some(release_id);
        entry.offer_seq += 1;
        release.status = ReleaseStatus::Offered { entry_id };

        pass.outbox.push(
            Topic::User(entry.user_id),
            OutboundEvent::WaitlistOffer {
                entry_id,
                release_id,
                salon_id: state.salon_id,
                service_id: release.service_id,
                staff_id: release.staff_id,
                date: release.date,
                window: release.window,
                accept_deadline: deadline,
            },
        );
        pass.effects.push(Effect::timer(
            offer_timer_id(entry_id, entry.offer_seq),
            (deadline - pass.now).to_std().unwrap_or(Duration::ZERO),
            WaitlistAction::OfferDeadlineElapsed {
                entry_id,
                offer_seq: entry.offer_seq,
            },
        ));

        tracing::info!(%entry_id, %release_id, %deadline, "Slot offered");
        WaitlistMetrics::record_offer();
    }

    fn mark_unfilled(state: &mut WaitlistState, release_id: ReleaseId, pass: &mut Pass<'_>) {
        let Some(release) = state.releases.get_mut(&release_id) else {
            return;
        };
        release.status = ReleaseStatus::Unfilled;

        pass.outbox.push(
            Topic::Salon(state.salon_id),
            OutboundEvent::SlotUnclaimed {
                release_id,
                salon_id: state.salon_id,
                service_id: release.service_id,
                staff_id: release.staff_id,
                date: release.date,
                window: release.window,
                timestamp: pass.now,
            },
        );
        tracing::info!(%release_id, "Slot unclaimed");
        WaitlistMetrics::record_unclaimed();
    }

    fn tick(state: &mut WaitlistState, pass: &mut Pass<'_>) {
        let now = pass.now;

        for entry in state.entries.values_mut() {
            if entry.status == EntryStatus::Active && entry.expires_at <= now {
                entry.status = EntryStatus::Expired;
                entry.closed_at = Some(now);
                pass.outbox.push(
                    Topic::User(entry.user_id),
                    OutboundEvent::WaitlistEntryExpired {
                        entry_id: entry.entry_id,
                        timestamp: now,
                    },
                );
                tracing::info!(entry_id = %entry.entry_id, "Waitlist entry expired");
            }
        }

        // Closed records are kept for a day so late answers still get a precise error
        let horizon = now - TimeDelta::days(1);
        state
            .entries
            .retain(|_, e| e.status.is_open() || e.closed_at.is_none_or(|closed| closed > horizon));
        state.releases.retain(|_, r| {
            matches!(r.status, ReleaseStatus::Open | ReleaseStatus::Offered { .. })
                || r.starts_at() > horizon
        });

        Self::reposition(state, pass);
        Self::drain_pending(state, pass);
    }

    /// Recompute positions, announcing every change
    fn reposition(state: &mut WaitlistState, pass: &mut Pass<'_>) {
        let mut groups: BTreeMap<WaitlistKey, Vec<((bool, DateTime<Utc>, u64), WaitlistEntryId)>> =
            BTreeMap::new();

        for entry in state.entries.values_mut() {
            if entry.status.is_open() {
                groups
                    .entry(entry.key())
                    .or_default()
                    .push((entry.rank(), entry.entry_id));
            } else {
                entry.position = None;
            }
        }

        for mut members in groups.into_values() {
            members.sort_unstable();
            for (index, (_, entry_id)) in members.into_iter().enumerate() {
                let Some(entry) = state.entries.get_mut(&entry_id) else {
                    continue;
                };
                let position = index + 1;
                if entry.position == Some(position) {
                    continue;
                }
                let previous_position = entry.position.replace(position);
                pass.outbox.push(
                    Topic::User(entry.user_id),
                    OutboundEvent::WaitlistPositionChanged {
                        entry_id,
                        position,
                        previous_position,
                    },
                );
            }
        }
    }

    fn reply(request_id: RequestId, result: Result<WaitlistReply, WaitlistRejection>) -> Effect<WaitlistAction> {
        let reply = result.unwrap_or_else(|rejection| {
            tracing::debug!(%request_id, code = rejection.code(), "Waitlist command rejected");
            WaitlistReply::Rejected { rejection }
        });
        Effect::Future(Box::pin(async move {
            Some(WaitlistAction::Replied { request_id, reply })
        }))
    }
}

impl Reducer for WaitlistReducer {
    type State = WaitlistState;
    type Action = WaitlistAction;
    type Environment = WaitlistEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let mut pass = Pass {
            env,
            now: env.clock.now(),
            outbox: Outbox::new(),
            effects: SmallVec::new(),
        };

        let reply = match action {
            WaitlistAction::Join {
                request_id,
                entry_id,
                request,
            } => Some((
                request_id,
                Self::join(state, entry_id, request, &mut pass)
                    .map(|entry| WaitlistReply::Joined { entry }),
            )),

            WaitlistAction::SlotReleased {
                release_id,
                service_id,
                staff_id,
                date,
                window,
            } => {
                let release = SlotRelease {
                    release_id,
                    service_id,
                    staff_id,
                    date,
                    window,
                    released_at: pass.now,
                    status: ReleaseStatus::Open,
                    passed_over: BTreeSet::new(),
                };
                Self::release(state, release, &mut pass);
                None
            },

            WaitlistAction::Respond {
                request_id,
                entry_id,
                user_id,
                accept,
            } => Some((
                request_id,
                Self::respond(state, entry_id, user_id, accept, &mut pass).map(|entry| {
                    if accept {
                        WaitlistReply::Accepted { entry }
                    } else {
                        WaitlistReply::Declined { entry }
                    }
                }),
            )),

            WaitlistAction::Withdraw {
                request_id,
                entry_id,
                user_id,
            } => Some((
                request_id,
                Self::withdraw(state, entry_id, user_id, &mut pass)
                    .map(|entry| WaitlistReply::Withdrawn { entry }),
            )),

            WaitlistAction::OfferDeadlineElapsed {
                entry_id,
                offer_seq,
            } => {
                Self::deadline_elapsed(state, entry_id, offer_seq, &mut pass);
                None
            },

            WaitlistAction::Tick => {
                Self::tick(state, &mut pass);
                None
            },

            // Observed by whoever sent the command
            WaitlistAction::Replied { .. } => None,
        };

        let Pass {
            outbox,
            mut effects,
            ..
        } = pass;
        if let Some(publication) = outbox.into_effect(&env.publisher) {
            effects.insert(0, publication);
        }
        if let Some((request_id, result)) = reply {
            effects.push(Self::reply(request_id, result));
        }
        effects
    }
}
