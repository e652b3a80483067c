//! # Packboard Runtime
//!
//! Runtime implementation for the packboard reducer architecture.
//!
//! This crate provides the Store runtime that coordinates reducer execution
//! and effect handling.
//!
//! ## Core Responsibilities
//!
//! - **Store**: Manages state and coordinates reducer execution
//! - **Effect Execution**: Executes effect descriptions produced by reducers
//! - **Cancellation**: Aborts superseded effects registered under the same [`EffectId`]
//! - **Feedback Loop**: Actions produced by effects are fed back into the reducer
//!
//! ## Example
//!
//! ```ignore
//! use packboard_runtime::Store;
//!
//! let store = Store::new(BoardState::default(), BoardReducer, environment);
//!
//! let mut handle = store.send(BoardAction::Refresh { filter: None }).await?;
//! handle.wait().await;
//! let cards = store.state(|s| s.board.len()).await;
//! ```

use futures::future::{AbortHandle, AbortRegistration};
use packboard_core::effect::{Effect, EffectId};
use packboard_core::reducer::Reducer;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, watch};

/// Retry policies with exponential backoff and jitter
pub mod retry;

/// Prometheus metrics
pub mod metrics;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out with effects still running
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timed out waiting for effects or a matching action
        #[error("Timed out waiting for store")]
        Timeout,

        /// Action broadcast channel closed
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

type BoxedEffectFuture<A> = Pin<Box<dyn Future<Output = Option<A>> + Send>>;

/// Handle for tracking effect completion
///
/// Returned by [`Store::send()`] to allow waiting for the effects of one
/// action to finish. An effect counts as finished once the action it produced
/// (if any) has itself been reduced.
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
            notifier: Arc::new(tx),
        };

        (handle, tracking)
    }

    /// Create a handle that's already complete
    #[must_use]
    pub fn completed() -> Self {
        let (_tx, rx) = watch::channel(());
        Self {
            effects: Arc::new(AtomicUsize::new(0)),
            completion: rx,
        }
    }

    /// Number of effects still running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.effects.load(Ordering::SeqCst)
    }

    /// Wait for all effects to complete
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            if self.completion.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for all effects to complete with a timeout
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the timeout expires before all effects complete.
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

/// Internal: Effect tracking context passed through effect execution
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: Arc<watch::Sender<()>>,
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

/// Internal: RAII guard that decrements effect counter on drop
///
/// Ensures the effect counter is always decremented, even if the effect panics.
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Guard that decrements an atomic counter on drop (for shutdown tracking)
struct AtomicCounterGuard(Arc<AtomicUsize>);

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Internal: abort handles of cancellable effects currently in flight, by id.
///
/// Each registration carries a generation so a finishing effect only removes
/// its own entry, never the one that replaced it.
#[derive(Default)]
struct CancellationRegistry {
    next_generation: AtomicU64,
    in_flight: Mutex<HashMap<EffectId, (u64, AbortHandle)>>,
}

impl CancellationRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<EffectId, (u64, AbortHandle)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new effect under `id`, aborting the one it replaces.
    fn register(&self, id: &EffectId) -> (u64, AbortRegistration) {
        let (handle, registration) = AbortHandle::new_pair();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        if let Some((_, previous)) = self.lock().insert(id.clone(), (generation, handle)) {
            previous.abort();
            tracing::debug!(effect_id = %id, "Aborted superseded effect");
            metrics::counter!("store_effects_cancelled_total").increment(1);
        }

        (generation, registration)
    }

    fn cancel(&self, id: &EffectId) -> bool {
        match self.lock().remove(id) {
            Some((_, handle)) => {
                handle.abort();
                metrics::counter!("store_effects_cancelled_total").increment(1);
                true
            },
            None => false,
        }
    }

    fn finish(&self, id: &EffectId, generation: u64) {
        let mut in_flight = self.lock();
        if in_flight
            .get(id)
            .is_some_and(|(current, _)| *current == generation)
        {
            in_flight.remove(id);
        }
    }

    fn is_registered(&self, id: &EffectId) -> bool {
        self.lock().contains_key(id)
    }
}

/// Store runtime for coordinating reducer execution and effect handling.
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicCounterGuard, AtomicUsize, BoxedEffectFuture,
        CancellationRegistry, DecrementGuard, Duration, Effect, EffectHandle, EffectId,
        EffectTracking, Ordering, Reducer, RwLock, StoreError,
    };
    use futures::future::{Abortable, Aborted};
    use tokio::sync::{broadcast, watch};

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock`, the reducer is the only writer)
    /// 2. Reducer (business logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (with feedback loop and cancellation)
    ///
    /// Reducer calls are serialized by the write lock, so every transition is
    /// applied atomically with respect to every other one.
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
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        cancellations: Arc<CancellationRegistry>,
        /// Action broadcast channel for observing actions produced by effects.
        ///
        /// An action is broadcast after the reducer has applied it, so an
        /// observer that reads state on receipt sees the result.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        ///
        /// The action broadcast channel buffers 16 actions; use
        /// [`Store::with_broadcast_capacity`] for more.
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_broadcast_capacity(initial_state, reducer, environment, 16)
        }

        /// Create a new Store with custom action broadcast capacity
        #[must_use]
        pub fn with_broadcast_capacity(
            initial_state: S,
            reducer: R,
            environment: E,
            capacity: usize,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(capacity);

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                cancellations: Arc::new(CancellationRegistry::default()),
                action_broadcast,
            }
        }

        /// The injected environment.
        #[must_use]
        pub const fn environment(&self) -> &E {
            &self.environment
        }

        /// `true` while a cancellable effect is registered under `id`.
        #[must_use]
        pub fn is_in_flight(&self, id: &EffectId) -> bool {
            self.cancellations.is_registered(id)
        }

        /// Initiate graceful shutdown of the store
        ///
        /// Sets the shutdown flag (rejecting new actions) and waits for pending
        /// effects to complete.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before all
        /// pending effects complete.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            self.shutdown.store(true, Ordering::Release);

            let start = tokio::time::Instant::now();
            let poll_interval = Duration::from_millis(50);

            loop {
                let pending = self.pending_effects.load(Ordering::Acquire);

                if pending == 0 {
                    tracing::info!("All effects completed, shutdown successful");
                    return Ok(());
                }

                if start.elapsed() >= timeout {
                    tracing::error!(
                        pending_effects = pending,
                        "Shutdown timeout: {} effects still running", pending
                    );
                    return Err(StoreError::ShutdownTimeout(pending));
                }

                tokio::time::sleep(poll_interval).await;
            }
        }

        /// Send an action to the store
        ///
        /// 1. Acquires write lock on state
        /// 2. Calls reducer with (state, action, environment)
        /// 3. Starts the returned effects asynchronously
        ///
        /// `send()` returns after starting effect execution, not completion.
        /// Use the returned [`EffectHandle`] to wait for effects.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!("store_actions_processed_total").increment(1);

            let (handle, tracking) = EffectHandle::new();

            let effects = {
                let mut state = self.state.write().await;

                let start = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut *state, action, &self.environment);
                metrics::histogram!("store_reducer_duration_seconds")
                    .record(start.elapsed().as_secs_f64());

                tracing::trace!("Reducer completed, returned {} effects", effects.len());
                effects
            };

            for effect in effects {
                self.execute_effect_internal(effect, tracking.clone());
            }

            Ok(handle)
        }

        /// Send an action and wait for a matching action produced by effects
        ///
        /// Subscribes to the action broadcast before sending, then returns the
        /// first action matching the predicate. The returned action has already
        /// been applied to state.
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

        /// Subscribe to all actions produced by effects
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let card_count = store.state(|s| s.board.len()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&*state)
        }

        /// Reduce an action produced by an effect, then broadcast it.
        async fn feed_back(&self, action: A) {
            let observed = action.clone();
            match self.send(action).await {
                Ok(_) => {
                    let _ = self.action_broadcast.send(observed);
                },
                Err(error) => {
                    tracing::warn!(error = %error, "Dropped action produced by effect");
                },
            }
        }

        /// Execute an effect with tracking
        ///
        /// - `None`: No-op
        /// - `Future`: Executes async computation, feeds back the resulting action if `Some`
        /// - `Delay`: Waits for duration, then feeds back the action
        /// - `Parallel`: Executes effects concurrently
        /// - `Sequential`: Executes effects in order, waiting for each to complete
        /// - `Cancellable`: Aborts the effect registered under the same id, then runs
        /// - `Cancel`: Aborts the effect registered under the id
        ///
        /// Effect tasks are isolated: a panicking effect is logged by tokio and
        /// the [`DecrementGuard`] still updates the counter.
        #[allow(clippy::needless_pass_by_value)] // tracking is cloned into spawned tasks
        fn execute_effect_internal(&self, effect: Effect<A>, tracking: EffectTracking) {
            match effect {
                Effect::None => {
                    metrics::counter!("store_effects_executed_total", "type" => "none").increment(1);
                },
                Effect::Future(fut) => {
                    tracing::trace!("Executing Effect::Future");
                    metrics::counter!("store_effects_executed_total", "type" => "future").increment(1);
                    self.spawn_effect(fut, &tracking);
                },
                Effect::Delay { duration, action } => {
                    tracing::trace!("Executing Effect::Delay (duration: {:?})", duration);
                    metrics::counter!("store_effects_executed_total", "type" => "delay").increment(1);
                    self.spawn_effect(delayed(duration, *action), &tracking);
                },
                Effect::Parallel(effects) => {
                    metrics::counter!("store_effects_executed_total", "type" => "parallel").increment(1);
                    for effect in effects {
                        self.execute_effect_internal(effect, tracking.clone());
                    }
                },
                Effect::Sequential(effects) => {
                    metrics::counter!("store_effects_executed_total", "type" => "sequential").increment(1);
                    self.spawn_sequential(effects, &tracking);
                },
                Effect::Cancellable { id, effect } => {
                    metrics::counter!("store_effects_executed_total", "type" => "cancellable").increment(1);
                    match *effect {
                        Effect::Future(fut) => self.spawn_cancellable(id, fut, &tracking),
                        Effect::Delay { duration, action } => {
                            self.spawn_cancellable(id, delayed(duration, *action), &tracking);
                        },
                        other => {
                            tracing::warn!(effect_id = %id, "Effect is not abortable, running without cancellation");
                            self.execute_effect_internal(other, tracking);
                        },
                    }
                },
                Effect::Cancel(id) => {
                    metrics::counter!("store_effects_executed_total", "type" => "cancel").increment(1);
                    if self.cancellations.cancel(&id) {
                        tracing::debug!(effect_id = %id, "Cancelled effect");
                    }
                },
            }
        }

        fn spawn_effect(&self, fut: BoxedEffectFuture<A>, tracking: &EffectTracking) {
            tracking.increment();

            // Track global pending effects for shutdown
            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let pending_guard = AtomicCounterGuard(Arc::clone(&self.pending_effects));

            let guard = DecrementGuard(tracking.clone());
            let store = self.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let _pending_guard = pending_guard;

                if let Some(action) = fut.await {
                    store.feed_back(action).await;
                }
            });
        }

        fn spawn_cancellable(&self, id: EffectId, fut: BoxedEffectFuture<A>, tracking: &EffectTracking) {
            let (generation, registration) = self.cancellations.register(&id);
            let registry = Arc::clone(&self.cancellations);
            let abortable = Abortable::new(fut, registration);

            self.spawn_effect(
                Box::pin(async move {
                    let outcome = abortable.await;
                    registry.finish(&id, generation);
                    match outcome {
                        Ok(action) => action,
                        Err(Aborted) => {
                            tracing::trace!(effect_id = %id, "Effect aborted before completion");
                            None
                        },
                    }
                }),
                tracking,
            );
        }

        fn spawn_sequential(&self, effects: Vec<Effect<A>>, tracking: &EffectTracking) {
            tracking.increment();

            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let pending_guard = AtomicCounterGuard(Arc::clone(&self.pending_effects));

            let guard = DecrementGuard(tracking.clone());
            let store = self.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let _pending_guard = pending_guard;

                for effect in effects {
                    let (tx, mut rx) = watch::channel(());
                    let sub_tracking = EffectTracking {
                        counter: Arc::new(AtomicUsize::new(0)),
                        notifier: Arc::new(tx),
                    };

                    store.execute_effect_internal(effect, sub_tracking.clone());

                    while sub_tracking.counter.load(Ordering::SeqCst) > 0 {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    }

    fn delayed<A: Send + 'static>(duration: Duration, action: A) -> BoxedEffectFuture<A> {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            Some(action)
        })
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
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                cancellations: Arc::clone(&self.cancellations),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

// Re-export for convenience
pub use store::Store;
