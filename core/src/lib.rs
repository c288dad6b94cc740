//! # Salon Queue Core
//!
//! Core traits and types shared by every processing lane of the salon queue.
//!
//! All business logic is written as reducers: pure functions that take the current
//! state of one shard, an action and the injected environment, mutate the state and
//! return descriptions of the side effects to perform. The runtime crate executes those
//! descriptions.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one shard (one salon's queue, one salon's waitlist)
//! - **Action**: All inputs to a reducer (inbound commands, timer callbacks, replies)
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions (timers, publications, async work)
//! - **Environment**: Injected collaborators behind traits (clock, directories)
//!
//! ## Example
//!
//! ```ignore
//! use salon_queue_core::*;
//!
//! impl Reducer for WaitlistReducer {
//!     type State = WaitlistState;
//!     type Action = WaitlistAction;
//!     type Environment = WaitlistEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut WaitlistState,
//!         action: WaitlistAction,
//!         env: &WaitlistEnvironment,
//!     ) -> SmallVec<[Effect<WaitlistAction>; 4]> {
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// Most actions produce no more than a handful of effects, so they are
        /// returned inline without allocating.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the Store runtime.
/// They are values (not execution), composable and, for timers, cancellable.
pub mod effect {
    use std::fmt;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Identifier of a cancellable effect.
    ///
    /// Reducers choose ids that are unique per scheduled callback (for example an
    /// offer id plus its generation), so cancelling one never suppresses a newer one.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EffectId(String);

    impl EffectId {
        /// Creates an effect id from any string-like key
        #[must_use]
        pub fn new(key: impl Into<String>) -> Self {
            Self(key.into())
        }

        /// Returns the id as a string slice
        #[must_use]
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for EffectId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// A synchronous publication run by the runtime while the lane is still held.
    pub type Publication = Box<dyn FnOnce() + Send>;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (for timeouts, deadlines)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// An effect that can later be suppressed with [`Effect::Cancel`]
        ///
        /// Only `Delay` and `Future` are spawned and therefore cancellable; other
        /// variants run to completion as if they were not wrapped.
        Cancellable {
            /// Key used to cancel the effect
            id: EffectId,
            /// The wrapped effect
            effect: Box<Effect<Action>>,
        },

        /// Cancel a pending [`Effect::Cancellable`]. Unknown ids are ignored.
        Cancel(EffectId),

        /// Ordered publication
        ///
        /// Top-level publications run inline, in the order returned, before the store
        /// accepts its next action. This is what gives subscribers per-shard ordering.
        Publish(Publication),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> fmt::Debug for Effect<Action>
    where
        Action: fmt::Debug,
    {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::Cancellable { id, effect } => f
                    .debug_struct("Effect::Cancellable")
                    .field("id", id)
                    .field("effect", effect)
                    .finish(),
                Effect::Cancel(id) => f.debug_tuple("Effect::Cancel").field(id).finish(),
                Effect::Publish(_) => write!(f, "Effect::Publish(<publication>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Schedule `action` after `duration` under a cancellation key
        #[must_use]
        pub fn timer(id: EffectId, duration: Duration, action: Action) -> Effect<Action> {
            Effect::Cancellable {
                id,
                effect: Box::new(Effect::Delay {
                    duration,
                    action: Box::new(action),
                }),
            }
        }

        /// Wrap a closure as an ordered publication
        #[must_use]
        pub fn publish<F>(f: F) -> Effect<Action>
        where
            F: FnOnce() + Send + 'static,
        {
            Effect::Publish(Box::new(f))
        }

        /// Returns the cancellation key if this is a cancellable effect
        #[must_use]
        pub const fn cancellable_id(&self) -> Option<&EffectId> {
            match self {
                Effect::Cancellable { id, .. } => Some(id),
                _ => None,
            }
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Reducers never call `Utc::now()` directly; deadlines, predictions and listing
    /// expiry are all computed from the injected clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)] // Test code can panic
mod tests {
    use super::effect::{Effect, EffectId};
    use std::time::Duration;

    #[test]
    fn timer_wraps_delay_in_cancellable() {
        let effect: Effect<u8> = Effect::timer(EffectId::new("offer-1"), Duration::from_secs(5), 7);

        assert_eq!(effect.cancellable_id().map(EffectId::as_str), Some("offer-1"));
        match effect {
            Effect::Cancellable { effect, .. } => {
                assert!(matches!(*effect, Effect::Delay { ref action, .. } if **action == 7));
            },
            other => panic!("expected cancellable, got {other:?}"),
        }
    }

    #[test]
    fn debug_hides_closures() {
        let effect: Effect<u8> = Effect::publish(|| {});
        assert_eq!(format!("{effect:?}"), "Effect::Publish(<publication>)");
    }
}
