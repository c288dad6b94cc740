//! Domain types shared by the salon queue lanes.
//!
//! Identifiers, staff status, time windows and the principal model used for
//! topic authorization.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a salon (one tenant location)
    SalonId
);
uuid_id!(
    /// Unique identifier for a staff member
    StaffId
);
uuid_id!(
    /// Unique identifier for a customer
    UserId
);
uuid_id!(
    /// Unique identifier for a confirmed booking
    BookingId
);
uuid_id!(
    /// Unique identifier for a bookable service
    ServiceId
);
uuid_id!(
    /// Unique identifier for a waitlist entry
    WaitlistEntryId
);
uuid_id!(
    /// Unique identifier for a released slot
    ReleaseId
);
uuid_id!(
    /// Correlates a lane command with its reply
    RequestId
);

// ============================================================================
// Staff
// ============================================================================

/// What a staff member is doing right now
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffStatus {
    /// Available, nobody in the chair
    #[default]
    Idle,
    /// With a customer (or the next customer is already due)
    Serving,
    /// Temporarily away
    OnBreak,
    /// Not working; predictions are frozen
    Offline,
}

impl StaffStatus {
    /// Returns true if the staff member is not working
    #[must_use]
    pub const fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }
}

impl fmt::Display for StaffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Serving => "serving",
            Self::OnBreak => "on_break",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A staff member as known to the staff directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffProfile {
    /// Staff ID
    pub staff_id: StaffId,
    /// Salon the staff member works at
    pub salon_id: SalonId,
    /// Display name shown to customers
    pub name: String,
}

// ============================================================================
// Time windows
// ============================================================================

/// Daily time-of-day range, end exclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start
    pub start: NaiveTime,
    /// Window end
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Creates a window, `None` unless `start < end`
    #[must_use]
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Returns true if the window is well formed
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Returns true if the two windows share any time
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Length of the window
    #[must_use]
    pub fn length(&self) -> TimeDelta {
        self.end - self.start
    }

    /// The window's end on `date`, in UTC
    #[must_use]
    pub fn end_on(&self, date: NaiveDate) -> DateTime<Utc> {
        date.and_time(self.end).and_utc()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ============================================================================
// Principals
// ============================================================================

/// Who is on the other end of a connection or request
///
/// Asserted by the gateway; this crate never authenticates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Principal {
    /// A customer
    Customer {
        /// The customer's ID
        user_id: UserId,
    },
    /// A staff member acting for a salon
    Staff {
        /// The salon the staff member works at
        salon_id: SalonId,
    },
}

impl Principal {
    /// The customer's ID, if this is a customer
    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Customer { user_id } => Some(*user_id),
            Self::Staff { .. } => None,
        }
    }

    /// Returns true if the principal is staff of `salon_id`
    #[must_use]
    pub fn is_staff_of(&self, salon_id: SalonId) -> bool {
        matches!(self, Self::Staff { salon_id: s } if *s == salon_id)
    }
}

/// Whole minutes between two instants, rounded toward zero
#[must_use]
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_minutes()
}
