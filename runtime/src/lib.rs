//! # Salon Queue Runtime
//!
//! Store runtime that coordinates reducer execution and effect handling for one
//! processing lane (one shard of domain state).
//!
//! ## Core Components
//!
//! - **Store**: Owns the state of one shard and serializes every action through its reducer
//! - **Effect Executor**: Executes effect descriptions and feeds actions back to the reducer
//! - **Timer Registry**: Tracks cancellable timers so an early answer can suppress a deadline
//!
//! ## Example
//!
//! ```ignore
//! use salon_queue_runtime::Store;
//!
//! let store = Store::new(WaitlistState::default(), WaitlistReducer::new(), environment);
//!
//! store.send(WaitlistAction::Tick).await?;
//!
//! let active = store.state(|s| s.active_count()).await;
//! ```

use salon_queue_core::{
    effect::{Effect, EffectId},
    reducer::Reducer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::AbortHandle;

/// Prometheus metrics for observability
pub mod metrics;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        ///
        /// This error is returned when `send()` is called after shutdown initiated.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        ///
        /// Some effects were still running when the timeout elapsed.
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a reply action
        ///
        /// Returned by `send_and_wait_for` when the timeout expires before
        /// a matching action is received.
        #[error("Timeout waiting for action")]
        Timeout,

        /// Action broadcast channel closed
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component works but is under pressure
    Degraded,
    /// Component is not accepting work
    Unhealthy,
}

impl HealthStatus {
    /// Returns true if healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Returns the worse of two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a health check on one component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Current status
    pub status: HealthStatus,
    /// Optional explanation
    pub message: Option<String>,
    /// Extra key/value details
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Healthy check for `component`
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Degraded check for `component`
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Unhealthy check for `component`
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Configuration for a Store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the action broadcast channel
    pub broadcast_capacity: usize,
    /// Pending effects above which the store reports itself degraded
    pub pending_effects_warning: usize,
}

impl StoreConfig {
    /// Set the broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Set the pending effect warning level
    #[must_use]
    pub const fn with_pending_effects_warning(mut self, level: usize) -> Self {
        self.pending_effects_warning = level;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 16,
            pending_effects_warning: 10_000,
        }
    }
}

/// Handle for waiting on effect completion
///
/// Returned by [`Store::send`]. Offer deadlines are long-running effects, so
/// waiting on a handle whose action scheduled one blocks until the timer fires
/// or is cancelled.
#[derive(Clone)]
pub struct EffectHandle {
    effects: Arc<AtomicUsize>,
    completion: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(());

        let handle = Self {
            effects: Arc::clone(&counter),
            completion: rx,
        };

        let tracking = EffectTracking {
            counter,
            notifier: tx,
        };

        (handle, tracking)
    }

    /// Create a handle that is already completed
    #[must_use]
    pub fn completed() -> Self {
        let (tx, rx) = watch::channel(());
        let _ = tx.send(());

        Self {
            effects: Arc::new(AtomicUsize::new(0)),
            completion: rx,
        }
    }

    /// Wait for all tracked effects to complete
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            if self.completion.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait with a timeout
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if effects are still running after `timeout`.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StoreError::Timeout)
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending_effects", &self.effects.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Internal tracking context for effect execution
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Counter reached zero, notify waiters
            let _ = self.notifier.send(());
        }
    }
}

/// Decrements tracking when dropped, including when the task is aborted
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

struct AtomicCounterGuard(Arc<AtomicUsize>);

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of spawned cancellable effects
///
/// Each registration gets a generation so a finished task only removes its own entry,
/// never one that replaced it under the same id.
#[derive(Default)]
struct TimerRegistry {
    next_generation: AtomicU64,
    handles: Mutex<HashMap<EffectId, (u64, AbortHandle)>>,
}

impl TimerRegistry {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: EffectId, generation: u64, handle: AbortHandle) {
        let replaced = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (generation, handle));

        if let Some((_, previous)) = replaced {
            previous.abort();
        }
    }

    fn finish(&self, id: &EffectId, generation: u64) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.get(id).is_some_and(|(g, _)| *g == generation) {
            handles.remove(id);
        }
    }

    fn cancel(&self, id: &EffectId) -> bool {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        removed.is_some_and(|(_, handle)| {
            handle.abort();
            true
        })
    }

    fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Store module - The runtime for reducers
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicCounterGuard, AtomicUsize, DecrementGuard, Duration, Effect,
        EffectHandle, EffectTracking, HealthCheck, Ordering, Reducer, RwLock, StoreConfig,
        StoreError, TimerRegistry,
    };
    use std::future::Future;
    use tokio::sync::{broadcast, watch};
    use tokio::task::JoinHandle;

    /// The Store - runtime coordinator for a reducer
    ///
    /// One Store is one single-writer lane: every action is reduced while holding the
    /// state's write lock, so actions on the same Store never interleave, while
    /// separate Stores (separate shards) run fully in parallel.
    ///
    /// Reads through [`Store::state`] take the read lock and therefore always observe
    /// the state between two reductions, never a partially applied one.
    ///
    /// # Type Parameters
    ///
    /// - `S`: State type
    /// - `A`: Action type
    /// - `E`: Environment type
    /// - `R`: Reducer implementation
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        config: StoreConfig,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        timers: Arc<TimerRegistry>,
        /// Action broadcast channel for observing actions produced by effects.
        ///
        /// All actions produced by effects (replies from `Effect::Future`, fired
        /// timers) are broadcast to observers. This enables request-response patterns.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        ///
        /// Uses [`StoreConfig::default`] (action broadcast capacity 16).
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_config(initial_state, reducer, environment, StoreConfig::default())
        }

        /// Create a new Store with custom configuration
        #[must_use]
        pub fn with_config(
            initial_state: S,
            reducer: R,
            environment: E,
            config: StoreConfig,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                config,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                timers: Arc::new(TimerRegistry::default()),
                action_broadcast,
            }
        }

        /// Number of cancellable effects currently scheduled
        #[must_use]
        pub fn pending_timers(&self) -> usize {
            self.timers.len()
        }

        /// Perform a health check on the Store
        ///
        /// Unhealthy once shutdown started, degraded when the number of in-flight
        /// effects passes the configured warning level.
        #[must_use]
        pub fn health(&self, component: &str) -> HealthCheck {
            let pending = self.pending_effects.load(Ordering::Acquire);

            let check = if self.shutdown.load(Ordering::Acquire) {
                HealthCheck::unhealthy(component, "Store is shutting down")
            } else if pending > self.config.pending_effects_warning {
                HealthCheck::degraded(component, format!("{pending} effects in flight"))
            } else {
                HealthCheck::healthy(component)
            };

            check
                .with_metadata("pending_effects", pending.to_string())
                .with_metadata("pending_timers", self.timers.len().to_string())
        }

        /// Initiate graceful shutdown of the store
        ///
        /// This method:
        /// 1. Sets the shutdown flag (rejecting new actions)
        /// 2. Cancels are not forced: pending timers keep counting as in-flight effects
        /// 3. Returns when all effects finish or timeout expires
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before all
        /// pending effects complete.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            metrics::counter!("store.shutdown.initiated").increment(1);

            self.shutdown.store(true, Ordering::Release);

            let start = std::time::Instant::now();
            let poll_interval = Duration::from_millis(100);

            loop {
                let pending = self.pending_effects.load(Ordering::Acquire);

                if pending == 0 {
                    tracing::info!("All effects completed, shutdown successful");
                    metrics::counter!("store.shutdown.completed").increment(1);
                    return Ok(());
                }

                if start.elapsed() >= timeout {
                    tracing::error!(
                        pending_effects = pending,
                        "Shutdown timeout: {} effects still running", pending
                    );
                    metrics::counter!("store.shutdown.timeout").increment(1);
                    return Err(StoreError::ShutdownTimeout(pending));
                }

                tokio::time::sleep(poll_interval).await;
            }
        }

        /// Send an action to the store
        ///
        /// 1. Acquires write lock on state
        /// 2. Calls reducer with (state, action, environment)
        /// 3. Runs publications and cancellations inline, in order, still under the lock
        /// 4. Spawns the remaining effects (timers, futures) after releasing the lock
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError>
        where
            R: Clone,
            E: Clone,
        {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                metrics::counter!("store.shutdown.rejected_actions").increment(1);
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!("store.commands.total").increment(1);

            let (handle, tracking) = EffectHandle::new();

            let deferred = {
                let mut state = self.state.write().await;

                let start = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut state, action, &self.environment);
                metrics::histogram!("store.reducer.duration_seconds")
                    .record(start.elapsed().as_secs_f64());

                tracing::trace!("Reducer completed, returned {} effects", effects.len());

                // Publications and cancellations must happen before the next action is
                // reduced on this lane.
                let mut deferred = Vec::with_capacity(effects.len());
                for effect in effects {
                    match effect {
                        Effect::Publish(publication) => {
                            metrics::counter!("store.effects.executed", "type" => "publish")
                                .increment(1);
                            publication();
                        },
                        Effect::Cancel(id) => self.cancel_timer(&id),
                        other => deferred.push(other),
                    }
                }
                deferred
            };

            for effect in deferred {
                self.execute_effect(effect, tracking.clone());
            }

            Ok(handle)
        }

        /// Send an action and wait for a matching reply action
        ///
        /// Designed for request-response patterns: the reducer answers a command with
        /// an `Effect::Future` producing a reply carrying the request's correlation id.
        ///
        /// 1. Subscribe to the action broadcast BEFORE sending (avoids races)
        /// 2. Send the initial action through the store
        /// 3. Return the first broadcast action matching the predicate
        ///
        /// # Errors
        ///
        /// - [`StoreError::Timeout`]: Timeout expired before matching action received
        /// - [`StoreError::ChannelClosed`]: Action broadcast channel closed
        /// - [`StoreError::ShutdownInProgress`]: Store is shutting down
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            R: Clone,
            E: Clone,
            F: Fn(&A) -> bool,
        {
            let mut rx = self.action_broadcast.subscribe();

            self.send(action).await?;

            tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(action) if predicate(&action) => return Ok(action),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // If the reply was dropped the timeout catches it
                            tracing::warn!(skipped, "Action observer lagged, {} actions skipped", skipped);
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::ChannelClosed);
                        },
                    }
                }
            })
            .await
            .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to all actions produced by effects of this store
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let active = store.state(|s| s.active_count()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        fn cancel_timer(&self, id: &super::EffectId) {
            if self.timers.cancel(id) {
                tracing::debug!(timer = %id, "Cancelled timer");
                metrics::counter!("store.timers.cancelled").increment(1);
            } else {
                tracing::trace!(timer = %id, "Cancel for unknown or finished timer ignored");
            }
        }

        /// Spawn a tracked task; the guards keep the counters right even on abort
        fn spawn_tracked<Fut>(&self, tracking: &EffectTracking, fut: Fut) -> JoinHandle<()>
        where
            Fut: Future<Output = ()> + Send + 'static,
            R: Clone,
            E: Clone,
        {
            tracking.increment();
            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let pending_guard = AtomicCounterGuard(Arc::clone(&self.pending_effects));
            let guard = DecrementGuard(tracking.clone());

            tokio::spawn(async move {
                let _guard = guard;
                let _pending_guard = pending_guard;
                fut.await;
            })
        }

        /// Feed an action produced by an effect back into the store
        async fn feedback(self, action: A)
        where
            R: Clone,
            E: Clone,
        {
            // Broadcast to observers (request-response waiters)
            let _ = self.action_broadcast.send(action.clone());

            if let Err(error) = self.send(action).await {
                tracing::debug!(%error, "Dropped effect feedback");
            }
        }

        fn spawn_effect(&self, effect: Effect<A>, tracking: &EffectTracking) -> Option<JoinHandle<()>>
        where
            R: Clone,
            E: Clone,
        {
            match effect {
                Effect::Future(fut) => {
                    metrics::counter!("store.effects.executed", "type" => "future").increment(1);
                    let store = self.clone();
                    Some(self.spawn_tracked(tracking, async move {
                        if let Some(action) = fut.await {
                            store.feedback(action).await;
                        }
                    }))
                },
                Effect::Delay { duration, action } => {
                    metrics::counter!("store.effects.executed", "type" => "delay").increment(1);
                    let store = self.clone();
                    Some(self.spawn_tracked(tracking, async move {
                        tokio::time::sleep(duration).await;
                        tracing::trace!("Effect::Delay completed, sending action");
                        store.feedback(*action).await;
                    }))
                },
                other => {
                    self.execute_effect(other, tracking.clone());
                    None
                },
            }
        }

        /// Execute an effect with tracking
        ///
        /// - `None`: No-op
        /// - `Future` / `Delay`: spawned, resulting action fed back
        /// - `Cancellable`: spawned and registered under its id
        /// - `Parallel`: every child executed concurrently
        /// - `Sequential`: children executed in order, each awaited
        /// - `Publish` / `Cancel` nested in a composite run when reached
        #[allow(clippy::needless_pass_by_value)] // tracking is cloned per child
        fn execute_effect(&self, effect: Effect<A>, tracking: EffectTracking)
        where
            R: Clone,
            E: Clone,
        {
            match effect {
                Effect::None => {},
                Effect::Future(_) | Effect::Delay { .. } => {
                    let _ = self.spawn_effect(effect, &tracking);
                },
                Effect::Cancellable { id, effect } => {
                    let generation = self.timers.next_generation();
                    let timers = Arc::clone(&self.timers);
                    let timer_id = id.clone();

                    match *effect {
                        inner @ (Effect::Future(_) | Effect::Delay { .. }) => {
                            let wrapped: Effect<A> = match inner {
                                Effect::Delay { duration, action } => {
                                    Effect::Future(Box::pin(async move {
                                        tokio::time::sleep(duration).await;
                                        timers.finish(&timer_id, generation);
                                        Some(*action)
                                    }))
                                },
                                Effect::Future(fut) => Effect::Future(Box::pin(async move {
                                    let result = fut.await;
                                    timers.finish(&timer_id, generation);
                                    result
                                })),
                                _ => Effect::None,
                            };
                            if let Some(handle) = self.spawn_effect(wrapped, &tracking) {
                                tracing::debug!(timer = %id, "Scheduled cancellable effect");
                                self.timers.register(id, generation, handle.abort_handle());
                            }
                        },
                        other => {
                            tracing::warn!(timer = %id, "Effect is not spawnable, running without cancellation");
                            self.execute_effect(other, tracking);
                        },
                    }
                },
                Effect::Cancel(id) => self.cancel_timer(&id),
                Effect::Publish(publication) => publication(),
                Effect::Parallel(effects) => {
                    for effect in effects {
                        self.execute_effect(effect, tracking.clone());
                    }
                },
                Effect::Sequential(effects) => {
                    let store = self.clone();
                    let _ = self.spawn_tracked(&tracking, async move {
                        for effect in effects {
                            let (sub_tx, mut sub_rx) = watch::channel(());
                            let sub_tracking = EffectTracking {
                                counter: Arc::new(AtomicUsize::new(0)),
                                notifier: sub_tx,
                            };

                            store.execute_effect(effect, sub_tracking.clone());

                            while sub_tracking.counter.load(Ordering::SeqCst) > 0 {
                                if sub_rx.changed().await.is_err() {
                                    break;
                                }
                            }
                        }
                    });
                },
            }
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                config: self.config.clone(),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                timers: Arc::clone(&self.timers),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

// Re-export for convenience
pub use store::Store;
