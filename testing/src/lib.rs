//! # Salon Queue Testing
//!
//! Testing utilities for the salon queue reducers and stores.
//!
//! This crate provides:
//! - Deterministic clocks (fixed and manually advanced)
//! - A Given-When-Then harness for reducers
//! - proptest strategies for schedule-shaped data
//! - Assertion helpers for effects
//!
//! ## Example
//!
//! ```ignore
//! use salon_queue_testing::{test_clock, ManualClock};
//!
//! #[tokio::test]
//! async fn offer_lapses() {
//!     let clock = ManualClock::new(test_clock().now());
//!     let store = WaitlistStore::new(WaitlistState::default(), WaitlistReducer, env(&clock));
//!
//!     clock.advance(chrono::Duration::minutes(15));
//!     store.send(WaitlistAction::Tick).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use salon_queue_core::environment::Clock;


pub use reducer_test::{assertions, ReducerTest};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use salon_queue_testing::mocks::FixedClock;
    /// use salon_queue_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test says so
    ///
    /// Clones share the same time, so a test can keep one handle and pass another
    /// into an environment.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (Monday 2025-03-03 09:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-03-03T09:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities
pub mod helpers {
    use chrono::{DateTime, Duration, Utc};

    /// `base` plus a number of minutes
    #[must_use]
    pub fn at(base: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        base + Duration::minutes(minutes)
    }

    /// Install a test-friendly tracing subscriber; repeated calls are no-ops
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "salon_queue=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One appointment in a generated day: minutes after opening, and duration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotShape {
        /// Scheduled start, minutes after opening
        pub offset_minutes: i64,
        /// Service duration in minutes
        pub duration_minutes: i64,
    }

    /// A day of non-overlapping appointments for one staff member, sorted by start.
    pub fn day_schedule(max_len: usize) -> impl Strategy<Value = Vec<SlotShape>> {
        prop::collection::vec((0_i64..=30, 15_i64..=90), 1..=max_len).prop_map(|gaps| {
            let mut cursor = 0;
            gaps.into_iter()
                .map(|(gap, duration)| {
                    let slot = SlotShape {
                        offset_minutes: cursor + gap,
                        duration_minutes: duration,
                    };
                    cursor = slot.offset_minutes + duration;
                    slot
                })
                .collect()
        })
    }

    /// Overrun (positive) or early finish (negative) in minutes.
    pub fn overrun_minutes() -> impl Strategy<Value = i64> {
        -20_i64..=60
    }
}

// Re-export commonly used items
pub use mocks::{test_clock, FixedClock, ManualClock};
