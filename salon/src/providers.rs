//! External collaborators, abstracted behind traits.
//!
//! The catalog, the booking engine and customer profiles live outside this
//! service. Reducers only see these traits; the in-memory implementations below
//! back the binary and the tests.

use crate::types::{SalonId, ServiceId, StaffId, StaffProfile, TimeWindow, UserId};
use chrono::{NaiveDate, TimeDelta};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

// ============================================================================
// Staff directory
// ============================================================================

/// Staff → salon/name lookup
pub trait StaffDirectory: Send + Sync {
    /// Look up a staff member
    fn lookup(&self, staff_id: StaffId) -> Option<StaffProfile>;

    /// Returns true if any staff member works at the salon
    fn has_salon(&self, salon_id: SalonId) -> bool;
}

/// Errors loading a staff roster
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    /// Roster file could not be read
    #[error("Failed to read staff roster: {0}")]
    Io(#[from] std::io::Error),
    /// Roster file is not valid JSON
    #[error("Failed to parse staff roster: {0}")]
    Parse(#[from] serde_json::Error),
}

/// In-memory staff directory
#[derive(Debug, Default)]
pub struct InMemoryStaffDirectory {
    staff: RwLock<HashMap<StaffId, StaffProfile>>,
}

impl InMemoryStaffDirectory {
    /// Creates an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory from a list of profiles
    #[must_use]
    pub fn with_staff(profiles: impl IntoIterator<Item = StaffProfile>) -> Self {
        let directory = Self::new();
        for profile in profiles {
            directory.register(profile);
        }
        directory
    }

    /// Loads a JSON array of profiles
    ///
    /// # Errors
    ///
    /// Returns [`RosterError`] if the file cannot be read or parsed.
    pub fn from_roster_file(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let raw = std::fs::read_to_string(path)?;
        let profiles: Vec<StaffProfile> = serde_json::from_str(&raw)?;
        Ok(Self::with_staff(profiles))
    }

    /// Adds or replaces a staff member
    pub fn register(&self, profile: StaffProfile) {
        self.staff
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.staff_id, profile);
    }

    /// Number of known staff members
    #[must_use]
    pub fn len(&self) -> usize {
        self.staff.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nobody is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StaffDirectory for InMemoryStaffDirectory {
    fn lookup(&self, staff_id: StaffId) -> Option<StaffProfile> {
        self.staff
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&staff_id)
            .cloned()
    }

    fn has_salon(&self, salon_id: SalonId) -> bool {
        self.staff
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|p| p.salon_id == salon_id)
    }
}

// ============================================================================
// Slot availability
// ============================================================================

/// What a waitlist join is asking for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotQuery {
    /// Salon
    pub salon_id: SalonId,
    /// Service
    pub service_id: ServiceId,
    /// Specific staff member, or any
    pub staff_id: Option<StaffId>,
    /// First acceptable date
    pub from: NaiveDate,
    /// Last acceptable date
    pub to: NaiveDate,
    /// Acceptable time of day
    pub window: TimeWindow,
}

/// Are bookable slots open for a query (owned by the booking engine)
pub trait SlotAvailability: Send + Sync {
    /// Returns true if at least one slot matching the query can be booked directly
    fn has_open_slots(&self, query: &SlotQuery) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct OpenSlot {
    salon_id: SalonId,
    service_id: ServiceId,
    staff_id: StaffId,
    date: NaiveDate,
    window: TimeWindow,
}

/// In-memory slot availability
#[derive(Debug, Default)]
pub struct InMemorySlotAvailability {
    open: RwLock<HashSet<OpenSlot>>,
}

impl InMemorySlotAvailability {
    /// Creates an availability view with nothing open
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a slot as bookable
    pub fn open(
        &self,
        salon_id: SalonId,
        service_id: ServiceId,
        staff_id: StaffId,
        date: NaiveDate,
        window: TimeWindow,
    ) {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(OpenSlot {
                salon_id,
                service_id,
                staff_id,
                date,
                window,
            });
    }

    /// Marks every slot of a staff member on a date as taken
    pub fn close_day(&self, staff_id: StaffId, date: NaiveDate) {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| !(slot.staff_id == staff_id && slot.date == date));
    }
}

impl SlotAvailability for InMemorySlotAvailability {
    fn has_open_slots(&self, query: &SlotQuery) -> bool {
        self.open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|slot| {
                slot.salon_id == query.salon_id
                    && slot.service_id == query.service_id
                    && query.staff_id.is_none_or(|staff| staff == slot.staff_id)
                    && (query.from..=query.to).contains(&slot.date)
                    && slot.window.overlaps(&query.window)
            })
    }
}

// ============================================================================
// Travel buffers
// ============================================================================

/// How long before the predicted start a customer should leave
pub trait TravelBuffers: Send + Sync {
    /// Travel buffer for a customer
    fn buffer_for(&self, user_id: UserId) -> TimeDelta;
}

/// Fixed default buffer with per-customer overrides
#[derive(Debug)]
pub struct FixedTravelBuffers {
    default: TimeDelta,
    overrides: RwLock<HashMap<UserId, TimeDelta>>,
}

impl FixedTravelBuffers {
    /// Creates buffers with a default
    #[must_use]
    pub fn new(default: TimeDelta) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides the buffer for one customer
    pub fn set_override(&self, user_id: UserId, buffer: TimeDelta) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, buffer);
    }
}

impl TravelBuffers for FixedTravelBuffers {
    fn buffer_for(&self, user_id: UserId) -> TimeDelta {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .copied()
            .unwrap_or(self.default)
    }
}
