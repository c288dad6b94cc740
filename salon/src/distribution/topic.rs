//! The two topic families and who may read them.

use crate::types::{Principal, SalonId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from topic parsing and subscription management
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// Topic string is not `salon:{uuid}` or `user:{uuid}`
    #[error("Malformed topic: {0}")]
    Malformed(String),

    /// Principal may not read the topic
    #[error("Not allowed to subscribe to {0}")]
    Forbidden(Topic),

    /// Connection is not (or no longer) registered
    #[error("Unknown connection {0}")]
    UnknownConnection(super::ConnectionId),
}

/// A subscription topic
///
/// `salon:{salon_id}` carries staff-facing queue state; `user:{user_id}` carries
/// one customer's departure statuses and waitlist notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Topic {
    /// Staff view of one salon
    Salon(SalonId),
    /// One customer's private channel
    User(UserId),
}

impl Topic {
    /// Returns true if `principal` may subscribe
    ///
    /// Staff read their own salon; customers read their own user topic.
    #[must_use]
    pub fn authorizes(&self, principal: &Principal) -> bool {
        match self {
            Self::Salon(salon_id) => principal.is_staff_of(*salon_id),
            Self::User(user_id) => principal.user_id() == Some(*user_id),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Salon(id) => write!(f, "salon:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TopicError::Malformed(s.to_string());
        let (family, id) = s.split_once(':').ok_or_else(malformed)?;

        match family {
            "salon" => id.parse().map(Self::Salon).map_err(|_| malformed()),
            "user" => id.parse().map(Self::User).map_err(|_| malformed()),
            _ => Err(malformed()),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
