//! Rate limiter orchestrator.
//!
//! [`RateLimiter`] owns every gate for one credential behind a single lock and
//! exposes the check, wait and execute operations. Clones share state.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kraken_rate_limiter::{Priority, RateLimitConfig, RateLimiter, RateLimitError, RequestOptions};
//!
//! # async fn place_order() -> Result<String, RateLimitError> { Ok("OABC12".into()) }
//! # #[tokio::main]
//! # async fn main() -> Result<(), RateLimitError> {
//! let limiter = RateLimiter::start(RateLimitConfig::from_env()?).await?;
//!
//! let options = RequestOptions::new()
//!     .priority(Priority::High)
//!     .timeout(Duration::from_secs(10));
//! let txid = limiter
//!     .execute_with_rate_limit("AddOrder", &options, || place_order())
//!     .await?;
//! limiter.record_order_time(txid, None).await;
//!
//! limiter.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::endpoints::{self, EndpointDescriptor, ResolvedEndpoint};
use crate::error::RateLimitError;
use crate::queue::{
    CompletionHandle, PriorityRequestQueue, QueuedRequest, SchedulingStrategy, Verdict,
};
use crate::rate_limit::{
    BreakerStatus, CategoryStatus, CircuitBreaker, LimiterStats, OrderAgeRegistry,
    PenaltyStatus, PenaltyTracker, PersistedState, RateLimitConfig, RateLimitStatus,
    SNAPSHOT_VERSION, SlidingWindow, TierProfile, TokenBucket, age_penalty, snapshot_path,
};
use crate::types::{DenyReason, EndpointCategory, Priority, VerificationTier};

/// Shortest pause between admission attempts.
const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the endpoint's token weight
    pub weight: Option<u32>,
    /// Age of the order being amended, edited or cancelled
    pub order_age: Option<Duration>,
    /// Order being amended, edited or cancelled; its age is looked up when
    /// `order_age` is not given
    pub order_id: Option<String>,
    /// Queue priority
    pub priority: Priority,
    /// Give up waiting after this long
    pub timeout: Option<Duration>,
    /// Queue requeues allowed after a failed admission attempt
    pub max_retries: u32,
    /// Queue request ID. Generated when not set.
    pub request_id: Option<String>,
    /// Stops waiting when cancelled
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the endpoint's token weight.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Set the age of the order being modified.
    pub fn order_age(mut self, age: Duration) -> Self {
        self.order_age = Some(age);
        self
    }

    /// Set the order being modified; its age comes from the tracked order times.
    pub fn order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Set the queue priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Give up waiting after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allow queue requeues.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Use a caller-chosen queue request ID.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Stop waiting when `token` is cancelled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the call may proceed now
    pub allowed: bool,
    /// The gate that denied the call
    pub reason: Option<DenyReason>,
    /// Suggested wait before retrying. Zero when allowed.
    pub wait: Duration,
    /// Category the call was charged to
    pub category: EndpointCategory,
    /// Penalty points the call costs, including any age surcharge
    pub penalty_points: f64,
}

impl RateLimitDecision {
    fn allow(category: EndpointCategory, penalty_points: f64) -> Self {
        Self {
            allowed: true,
            reason: None,
            wait: Duration::ZERO,
            category,
            penalty_points,
        }
    }

    fn deny(
        category: EndpointCategory,
        reason: DenyReason,
        wait: Duration,
        penalty_points: f64,
    ) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            wait,
            category,
            penalty_points,
        }
    }

    /// Convert a denial into the matching error.
    pub fn into_result(self) -> Result<(), RateLimitError> {
        match self.reason {
            None => Ok(()),
            Some(reason) => Err(RateLimitError::denied(reason, self.wait)),
        }
    }
}

/// Everything guarded by the limiter lock.
#[derive(Debug)]
struct LimiterState {
    /// Indexed by [`EndpointCategory::index`]
    buckets: [TokenBucket; 2],
    windows: [SlidingWindow; 2],
    penalty: PenaltyTracker,
    breaker: Option<CircuitBreaker>,
    orders: OrderAgeRegistry,
    queue: Option<PriorityRequestQueue<RequestOptions>>,
    stats: LimiterStats,
    persistence_active: bool,
    next_request_id: u64,
}

impl LimiterState {
    fn new(config: &RateLimitConfig, profile: &TierProfile, persist: bool, now: Instant) -> Self {
        let bucket = |category: EndpointCategory| {
            TokenBucket::new(
                profile.burst(category),
                f64::from(profile.limit(category)) / 60.0,
                now,
            )
        };
        let window = |category: EndpointCategory| SlidingWindow::per_minute(profile.limit(category));

        Self {
            buckets: EndpointCategory::ALL.map(bucket),
            windows: EndpointCategory::ALL.map(window),
            penalty: PenaltyTracker::new(
                profile.max_penalty_points,
                profile.penalty_decay_rate,
                now,
            ),
            breaker: config
                .enable_circuit_breaker
                .then(|| CircuitBreaker::new(config.circuit_breaker.clone())),
            orders: OrderAgeRegistry::new(config.order_retention),
            queue: config
                .enable_queue
                .then(|| PriorityRequestQueue::new(config.queue.clone(), profile.queue_capacity)),
            stats: LimiterStats::default(),
            persistence_active: persist,
            next_request_id: 0,
        }
    }

    /// Run the gates in order: breaker, penalty budget, token bucket, sliding window.
    fn check(
        &mut self,
        resolved: &ResolvedEndpoint,
        options: &RequestOptions,
        now: Instant,
        wall: OffsetDateTime,
    ) -> RateLimitDecision {
        let descriptor = resolved.descriptor();
        let category = descriptor.category;
        self.stats.total_requests += 1;
        if !resolved.is_known() {
            self.stats.unknown_endpoints += 1;
        }

        if let Some(breaker) = self.breaker.as_mut() {
            if !breaker.can_proceed(now) {
                let wait = breaker.retry_after(now);
                return self.deny(descriptor, DenyReason::CircuitOpen, wait, 0.0);
            }
        }

        let penalty = self.penalty_points(descriptor, options, wall);
        if !self.penalty.can_add(penalty, now) {
            let wait = self.penalty.time_until_available(penalty, now);
            return self.deny(descriptor, DenyReason::PenaltyBudgetExceeded, wait, penalty);
        }

        let slot = category.index();
        let weight = f64::from(options.weight.unwrap_or(descriptor.weight));
        if !self.buckets[slot].consume(weight, now) {
            let wait = self.buckets[slot].time_until_available(weight, now);
            return self.deny(descriptor, DenyReason::TokenBucketEmpty, wait, penalty);
        }

        if !self.windows[slot].can_admit(now) {
            self.buckets[slot].refund(weight, now);
            let wait = self.windows[slot].time_until_available(now);
            return self.deny(descriptor, DenyReason::SlidingWindowFull, wait, penalty);
        }

        self.windows[slot].record(now);
        self.penalty.add(penalty, now);
        self.stats.allowed += 1;
        self.stats.penalty_points_charged += penalty;
        RateLimitDecision::allow(category, penalty)
    }

    /// Base penalty plus the age surcharge, if the endpoint has one and the age is known.
    fn penalty_points(
        &self,
        descriptor: &EndpointDescriptor,
        options: &RequestOptions,
        wall: OffsetDateTime,
    ) -> f64 {
        let surcharge = descriptor.age_penalty.and_then(|kind| {
            let age = options.order_age.or_else(|| {
                options
                    .order_id
                    .as_deref()
                    .and_then(|id| self.orders.age(id, wall))
            })?;
            Some(age_penalty(kind, age))
        });
        descriptor.base_penalty_points + surcharge.unwrap_or(0.0)
    }

    fn deny(
        &mut self,
        descriptor: &EndpointDescriptor,
        reason: DenyReason,
        wait: Duration,
        penalty: f64,
    ) -> RateLimitDecision {
        self.stats.record_denial(reason);
        tracing::debug!(
            endpoint = %descriptor.name,
            category = %descriptor.category,
            %reason,
            ?wait,
            "Rate limit denied"
        );
        RateLimitDecision::deny(descriptor.category, reason, wait, penalty)
    }

    fn category_status(&mut self, category: EndpointCategory, now: Instant) -> CategoryStatus {
        let slot = category.index();
        let window = &mut self.windows[slot];
        CategoryStatus {
            category,
            tokens_available: self.buckets[slot].available(now),
            bucket_capacity: self.buckets[slot].capacity(),
            window_count: window.count(now),
            window_limit: window.max_requests(),
        }
    }

    fn snapshot(&self, config: &RateLimitConfig, now: Instant, wall: OffsetDateTime) -> PersistedState {
        PersistedState {
            version: SNAPSHOT_VERSION,
            credential: config.credential.clone(),
            tier: config.tier,
            penalty_points: self.penalty.current(now),
            saved_at: wall,
            orders: self
                .orders
                .iter()
                .map(|(id, created_at)| (id.clone(), *created_at))
                .collect(),
            stats: self.stats.clone(),
        }
    }

    fn next_request_id(&mut self) -> String {
        self.next_request_id += 1;
        format!("req-{}", self.next_request_id)
    }
}

struct Inner {
    config: RateLimitConfig,
    profile: TierProfile,
    snapshot_path: Option<PathBuf>,
    state: Mutex<LimiterState>,
    /// Wakes the dispatcher when a request is queued
    queue_ready: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatcher_started: AtomicBool,
}

/// Admission control for one credential.
///
/// Clones share the same state, so one limiter can be handed to every task that
/// talks to the exchange with the same API key.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a limiter without loading state or starting background tasks.
    ///
    /// `config` is not validated; use [`try_new`](Self::try_new) or
    /// [`start`](Self::start) for configuration that comes from outside the
    /// program. The queue dispatcher is started on first use. See [`start`](Self::start) for
    /// a limiter that restores its snapshot and maintains itself.
    pub fn new(config: RateLimitConfig) -> Self {
        let profile = config.effective_profile();
        let snapshot_path = config
            .state_dir
            .as_deref()
            .map(|dir| snapshot_path(dir, config.credential.as_ref()));
        let state = LimiterState::new(&config, &profile, snapshot_path.is_some(), Instant::now());

        Self {
            inner: Arc::new(Inner {
                config,
                profile,
                snapshot_path,
                state: Mutex::new(state),
                queue_ready: Notify::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                dispatcher_started: AtomicBool::new(false),
            }),
        }
    }

    /// Validate `config` and create a limiter.
    pub fn try_new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Create a limiter, restore its snapshot and start background maintenance.
    ///
    /// A snapshot that cannot be read is logged and ignored. Call
    /// [`shutdown`](Self::shutdown) to stop the background tasks.
    pub async fn start(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let limiter = Self::try_new(config)?;
        if let Err(e) = limiter.load_state().await {
            tracing::warn!(error = %e, "Failed to load rate limit state, starting cold");
        }
        limiter.spawn_background_tasks().await;

        tracing::info!(
            tier = %limiter.inner.config.tier,
            queue = limiter.inner.config.enable_queue,
            persistence = limiter.inner.snapshot_path.is_some(),
            "Rate limiter started"
        );
        Ok(limiter)
    }

    /// Configuration in use.
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Limits in use.
    pub fn profile(&self) -> &TierProfile {
        &self.inner.profile
    }

    /// Configured verification tier.
    pub fn tier(&self) -> VerificationTier {
        self.inner.config.tier
    }

    /// Snapshot file, if persistence is configured.
    pub fn snapshot_path(&self) -> Option<&std::path::Path> {
        self.inner.snapshot_path.as_deref()
    }

    /// Check whether a call may proceed now, and charge it if so.
    ///
    /// Never waits and never fails; a denial carries the gate that refused and a
    /// wait hint.
    pub async fn check_rate_limit(&self, endpoint: &str, options: &RequestOptions) -> RateLimitDecision {
        let resolved = endpoints::resolve(endpoint);
        if !self.inner.config.enabled {
            return RateLimitDecision::allow(resolved.descriptor().category, 0.0);
        }
        let wall = OffsetDateTime::now_utc();
        let mut state = self.inner.state.lock().await;
        state.check(&resolved, options, Instant::now(), wall)
    }

    /// Wait until a call is admitted.
    ///
    /// Returns `false` if `options.timeout` elapses, `options.cancel` fires or the
    /// limiter shuts down first. A call that gives up has consumed nothing.
    pub async fn wait_for_rate_limit(&self, endpoint: &str, options: &RequestOptions) -> bool {
        let deadline = options
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        match self.admit(endpoint, options, deadline).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(endpoint, error = %e, "Gave up waiting for rate limit");
                false
            }
        }
    }

    /// Wait until a call is admitted, through the priority queue when enabled.
    ///
    /// Fails with the last denial if the wait times out, and with
    /// [`RateLimitError::RequestCancelled`] if `options.cancel` fires.
    pub async fn acquire(&self, endpoint: &str, options: &RequestOptions) -> Result<(), RateLimitError> {
        if !self.inner.config.enabled {
            return Ok(());
        }
        if !self.inner.config.enable_queue {
            let deadline = options
                .timeout
                .and_then(|timeout| Instant::now().checked_add(timeout));
            return self.admit(endpoint, options, deadline).await;
        }

        let handle = self.submit(endpoint, options).await?;
        let mut guard = QueuedWait {
            limiter: self,
            id: handle.id().to_string(),
            armed: true,
        };
        let outcome = tokio::select! {
            outcome = handle.wait() => outcome,
            _ = cancelled(options.cancel.as_ref()) => {
                // The request may already be resolved; the caller stops here regardless.
                let _ = self.cancel_request(&guard.id).await;
                Err(RateLimitError::RequestCancelled(guard.id.clone()))
            }
        };
        guard.armed = false;
        outcome
    }

    /// Wait for admission, run `operation` and report its outcome to the breaker.
    ///
    /// The operation's own error is returned unchanged. Limiter errors are converted
    /// with `From`. The operation is never retried here.
    pub async fn execute_with_rate_limit<F, Fut, T, E>(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitError>,
    {
        self.acquire(endpoint, options).await?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    /// Put a call in the priority queue and return a handle resolving on admission.
    ///
    /// Dropping the handle withdraws the request; it is removed as cancelled the
    /// next time the queue is scheduled and consumes nothing.
    pub async fn submit(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<CompletionHandle, RateLimitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RateLimitError::Shutdown);
        }
        let resolved = endpoints::resolve(endpoint);
        let descriptor = resolved.descriptor();
        let now = Instant::now();
        let wall = OffsetDateTime::now_utc();

        let handle = {
            let mut state = self.inner.state.lock().await;
            let penalty = state.penalty_points(descriptor, options, wall);
            let id = match &options.request_id {
                Some(id) => id.clone(),
                None => state.next_request_id(),
            };
            let queue = state.queue.as_mut().ok_or(RateLimitError::QueueDisabled)?;

            let mut request = QueuedRequest::new(id, endpoint, options.priority, options.clone(), now)
                .with_max_retries(options.max_retries)
                .with_cost(options.weight.unwrap_or(descriptor.weight), penalty);
            if let Some(timeout) = options.timeout {
                request = request.with_timeout(timeout);
            }
            queue.enqueue(request)?
        };

        self.ensure_dispatcher().await;
        self.inner.queue_ready.notify_one();
        Ok(handle)
    }

    /// Cancel a queued or in-flight request.
    pub async fn cancel_request(&self, id: &str) -> Result<(), RateLimitError> {
        let mut state = self.inner.state.lock().await;
        state
            .queue
            .as_mut()
            .ok_or(RateLimitError::QueueDisabled)?
            .cancel_request(id)
    }

    /// Switch the queue's scheduling strategy.
    pub async fn set_strategy(&self, strategy: SchedulingStrategy) -> Result<(), RateLimitError> {
        let mut state = self.inner.state.lock().await;
        state
            .queue
            .as_mut()
            .ok_or(RateLimitError::QueueDisabled)?
            .set_strategy(strategy);
        Ok(())
    }

    /// Report a successful call to the circuit breaker.
    pub async fn record_success(&self) {
        let mut state = self.inner.state.lock().await;
        state.stats.operation_successes += 1;
        if let Some(breaker) = state.breaker.as_mut() {
            breaker.record_success();
        }
    }

    /// Report a failed call to the circuit breaker.
    pub async fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.stats.operation_failures += 1;
        if let Some(breaker) = state.breaker.as_mut() {
            breaker.record_failure(now);
        }
    }

    /// Track when an order was created. `None` means now.
    pub async fn record_order_time(&self, order_id: impl Into<String>, created_at: Option<OffsetDateTime>) {
        let created_at = created_at.unwrap_or_else(OffsetDateTime::now_utc);
        self.inner.state.lock().await.orders.record(order_id, created_at);
    }

    /// Age of a tracked order.
    pub async fn get_order_age(&self, order_id: &str) -> Option<Duration> {
        let now = OffsetDateTime::now_utc();
        self.inner.state.lock().await.orders.age(order_id, now)
    }

    /// Stop tracking an order. Returns whether it was tracked.
    pub async fn remove_order_time(&self, order_id: &str) -> bool {
        self.inner.state.lock().await.orders.remove(order_id).is_some()
    }

    /// Number of tracked orders.
    pub async fn tracked_orders(&self) -> usize {
        self.inner.state.lock().await.orders.len()
    }

    /// Point-in-time view of every gate, the queue and the counters.
    pub async fn get_status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        RateLimitStatus {
            tier: self.inner.config.tier,
            enabled: self.inner.config.enabled,
            public: state.category_status(EndpointCategory::Public, now),
            private: state.category_status(EndpointCategory::Private, now),
            penalty: PenaltyStatus {
                points: state.penalty.current(now),
                max_points: state.penalty.max_points(),
                decay_rate: state.penalty.decay_rate(),
                utilization: state.penalty.utilization(now),
            },
            circuit_breaker: state.breaker.as_ref().map(|breaker| BreakerStatus {
                state: breaker.state(),
                failure_count: breaker.failure_count(),
                trips: breaker.trips(),
            }),
            queue: state.queue.as_ref().map(|queue| queue.status()),
            tracked_orders: state.orders.len(),
            persistence_active: state.persistence_active,
            stats: state.stats.clone(),
        }
    }

    /// Zero the cumulative counters, including the queue's.
    pub async fn reset_stats(&self) {
        let mut state = self.inner.state.lock().await;
        state.stats = LimiterStats::default();
        if let Some(queue) = state.queue.as_mut() {
            queue.reset_stats();
        }
    }

    /// Restore the snapshot, if one exists and is fresh.
    ///
    /// Penalty points are decayed for the time since the snapshot was taken. The
    /// configured tier always wins over the saved one. Returns whether state was
    /// restored.
    pub async fn load_state(&self) -> Result<bool, RateLimitError> {
        let Some(path) = self.inner.snapshot_path.as_deref() else {
            return Ok(false);
        };
        let Some(snapshot) = PersistedState::load(path).await? else {
            tracing::debug!(path = %path.display(), "No rate limit snapshot found");
            return Ok(false);
        };

        let wall = OffsetDateTime::now_utc();
        let age = snapshot.age(wall);
        if !snapshot.is_fresh(wall, self.inner.config.snapshot_max_age) {
            tracing::warn!(
                path = %path.display(),
                age_secs = age.as_secs(),
                "Discarding stale rate limit snapshot"
            );
            return Ok(false);
        }
        if snapshot.credential != self.inner.config.credential {
            tracing::warn!(path = %path.display(), "Snapshot belongs to another credential, ignoring");
            return Ok(false);
        }
        if snapshot.tier != self.inner.config.tier {
            tracing::warn!(
                saved = %snapshot.tier,
                configured = %self.inner.config.tier,
                "Snapshot tier differs from configured tier, keeping configured tier"
            );
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.penalty.restore(snapshot.penalty_points, age, now);
        for (order_id, created_at) in snapshot.orders {
            state.orders.record(order_id, created_at);
        }
        state.orders.purge(wall);
        state.stats = snapshot.stats;

        tracing::info!(
            penalty_points = state.penalty.current(now),
            orders = state.orders.len(),
            age_secs = age.as_secs_f64(),
            "Rate limit state restored"
        );
        Ok(true)
    }

    /// Write a snapshot now.
    ///
    /// A failed write switches the limiter to in-memory mode: the periodic task
    /// stops writing until an explicit call succeeds again.
    pub async fn save_state(&self) -> Result<(), RateLimitError> {
        let Some(path) = self.inner.snapshot_path.as_deref() else {
            return Ok(());
        };
        let snapshot = {
            let state = self.inner.state.lock().await;
            state.snapshot(&self.inner.config, Instant::now(), OffsetDateTime::now_utc())
        };
        let result = snapshot.save(path).await;

        let mut state = self.inner.state.lock().await;
        match &result {
            Ok(()) => {
                if !state.persistence_active {
                    tracing::info!(path = %path.display(), "Rate limit persistence resumed");
                }
                state.persistence_active = true;
            }
            Err(e) => {
                if state.persistence_active {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to persist rate limit state, continuing in memory"
                    );
                }
                state.persistence_active = false;
            }
        }
        result
    }

    /// Stop background tasks, resolve queued requests as shut down and write a final
    /// snapshot.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Rate limiter background task failed");
            }
        }

        let drained = {
            let mut state = self.inner.state.lock().await;
            state.queue.as_mut().map_or(0, |queue| queue.drain())
        };
        if drained > 0 {
            tracing::info!(drained, "Resolved queued requests at shutdown");
        }

        if self.save_state().await.is_ok() && self.inner.snapshot_path.is_some() {
            tracing::info!("Final rate limit snapshot written");
        }
        tracing::info!("Rate limiter shut down");
    }

    /// Check, back off and re-check until admitted, `deadline` passes, the caller
    /// cancels or the limiter shuts down.
    async fn admit(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        deadline: Option<Instant>,
    ) -> Result<(), RateLimitError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.note_gave_up().await;
                return Err(RateLimitError::RequestCancelled(endpoint.to_string()));
            }

            let decision = self.check_rate_limit(endpoint, options).await;
            let Some(reason) = decision.reason else {
                let waited = started.elapsed();
                if !waited.is_zero() {
                    self.inner.state.lock().await.stats.total_wait += waited;
                }
                return Ok(());
            };

            let now = Instant::now();
            let mut pause = decision.wait.min(self.inner.profile.backoff(attempt));
            if let Some(deadline) = deadline {
                if now >= deadline {
                    self.note_gave_up().await;
                    return Err(RateLimitError::denied(reason, decision.wait));
                }
                pause = pause.min(deadline.saturating_duration_since(now));
            }
            let pause = pause.max(MIN_PAUSE);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancelled(options.cancel.as_ref()) => {
                    self.note_gave_up().await;
                    return Err(RateLimitError::RequestCancelled(endpoint.to_string()));
                }
                _ = self.inner.shutdown.cancelled() => return Err(RateLimitError::Shutdown),
            }
        }
    }

    async fn note_gave_up(&self) {
        self.inner.state.lock().await.stats.wait_timeouts += 1;
    }

    async fn ensure_dispatcher(&self) {
        if self.inner.dispatcher_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let limiter = self.clone();
        let task = tokio::spawn(async move { limiter.run_dispatcher().await });
        self.inner.tasks.lock().await.push(task);
    }

    /// Schedule the queue whenever a request arrives or a blocked one may be ready.
    async fn run_dispatcher(self) {
        tracing::debug!("Queue dispatcher started");
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            let next_pass = self.schedule_queue().await;
            tokio::select! {
                _ = self.inner.queue_ready.notified() => {}
                _ = tokio::time::sleep(next_pass.unwrap_or_default()), if next_pass.is_some() => {}
                _ = self.inner.shutdown.cancelled() => break,
            }
        }
        tracing::debug!("Queue dispatcher stopped");
    }

    /// Offer every queued request to the gates once, in strategy order.
    ///
    /// A denial blocks only the requests the failing gate governs: a full bucket or
    /// window blocks its category, a full penalty budget blocks requests that carry
    /// penalty points, and an open breaker blocks everything. Blocked requests keep
    /// their place. A request still blocked once `backoff_max` has passed since its
    /// attempt began is requeued if it has retries left, or failed with the denial.
    ///
    /// Returns how long until the next pass is due, if anything is waiting.
    async fn schedule_queue(&self) -> Option<Duration> {
        let attempt_window = self.inner.profile.max_backoff();
        let now = Instant::now();
        let wall = OffsetDateTime::now_utc();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let mut queue = state.queue.take()?;
        let mut blocked = BlockedGates::default();
        let mut next_pass: Option<Duration> = None;

        let pass = queue.schedule(now, |request| {
            let options = &request.payload;
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                state.stats.wait_timeouts += 1;
                return Verdict::Cancel;
            }

            let resolved = endpoints::resolve(&request.endpoint);
            let category = resolved.descriptor().category;
            let (reason, wait) = match blocked.denial(category, request.penalty_points) {
                Some(denial) => denial,
                None => {
                    let decision = state.check(&resolved, options, now, wall);
                    let Some(reason) = decision.reason else {
                        state.stats.total_wait += now.saturating_duration_since(request.created_at);
                        return Verdict::Admit;
                    };
                    blocked.record(category, reason, decision.wait);
                    (reason, decision.wait)
                }
            };

            let started = request.scheduled_at.unwrap_or(now);
            let deadline = [started.checked_add(attempt_window), request.expires_at]
                .into_iter()
                .flatten()
                .min();
            if deadline.is_some_and(|deadline| now >= deadline) {
                if request.retry_count >= request.max_retries {
                    state.stats.wait_timeouts += 1;
                }
                return Verdict::Fail(RateLimitError::denied(reason, wait));
            }
            let until = deadline.map_or(wait, |deadline| {
                wait.min(deadline.saturating_duration_since(now))
            });
            next_pass = Some(next_pass.map_or(until, |next| next.min(until)));
            Verdict::Skip
        });
        state.queue = Some(queue);

        if pass.admitted > 0 || pass.abandoned > 0 {
            tracing::debug!(
                admitted = pass.admitted,
                waiting = pass.skipped,
                abandoned = pass.abandoned,
                "Queue scheduled"
            );
        }
        if pass.requeued > 0 {
            return Some(Duration::ZERO);
        }
        next_pass.map(|next| next.max(MIN_PAUSE))
    }

    async fn spawn_background_tasks(&self) {
        let config = &self.inner.config;
        let mut tasks = Vec::new();

        if self.inner.snapshot_path.is_some() {
            tasks.push(self.spawn_periodic("persist", config.persist_interval, |limiter| async move {
                let active = limiter.inner.state.lock().await.persistence_active;
                if active {
                    // Failures are logged and flip the limiter to in-memory mode.
                    let _ = limiter.save_state().await;
                }
            }));
        }

        tasks.push(self.spawn_periodic("order_cleanup", config.cleanup_interval, |limiter| async move {
            let now = OffsetDateTime::now_utc();
            limiter.inner.state.lock().await.orders.purge(now);
        }));

        if config.enable_queue {
            tasks.push(self.spawn_periodic("queue_sweep", config.queue.sweep_interval, |limiter| async move {
                let now = Instant::now();
                let mut state = limiter.inner.state.lock().await;
                if let Some(queue) = state.queue.as_mut() {
                    let expired = queue.sweep_expired(now);
                    if expired > 0 {
                        tracing::debug!(expired, "Swept expired queued requests");
                    }
                }
            }));
        }

        self.inner.tasks.lock().await.extend(tasks);
        if config.enable_queue {
            self.ensure_dispatcher().await;
        }
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut(RateLimiter) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let limiter = self.clone();
        tokio::spawn(async move {
            let start = Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick(limiter.clone()).await,
                    _ = limiter.inner.shutdown.cancelled() => break,
                }
            }
            tracing::debug!(task = name, "Rate limiter background task stopped");
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tier", &self.inner.config.tier)
            .field("enabled", &self.inner.config.enabled)
            .field("queue", &self.inner.config.enable_queue)
            .field("snapshot_path", &self.inner.snapshot_path)
            .finish()
    }
}

/// Withdraws a queued request if the [`RateLimiter::acquire`] waiting on it is dropped.
struct QueuedWait<'a> {
    limiter: &'a RateLimiter,
    id: String,
    armed: bool,
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Under contention the next scheduling pass finds the closed handle instead.
        if let Ok(mut state) = self.limiter.inner.state.try_lock() {
            let withdrawn = state
                .queue
                .as_mut()
                .is_some_and(|queue| queue.cancel_request(&self.id).is_ok());
            if withdrawn {
                state.stats.wait_timeouts += 1;
            }
        }
    }
}

/// Gates found closed during one scheduling pass, with the denial each produced.
#[derive(Debug, Default)]
struct BlockedGates {
    breaker: Option<(DenyReason, Duration)>,
    penalty: Option<(DenyReason, Duration)>,
    /// Indexed by [`EndpointCategory::index`]
    categories: [Option<(DenyReason, Duration)>; 2],
}

impl BlockedGates {
    fn denial(&self, category: EndpointCategory, penalty_points: f64) -> Option<(DenyReason, Duration)> {
        self.breaker
            .or(self.penalty.filter(|_| penalty_points > 0.0))
            .or(self.categories[category.index()])
    }

    fn record(&mut self, category: EndpointCategory, reason: DenyReason, wait: Duration) {
        let slot = match reason {
            DenyReason::CircuitOpen => &mut self.breaker,
            DenyReason::PenaltyBudgetExceeded => &mut self.penalty,
            DenyReason::TokenBucketEmpty | DenyReason::SlidingWindowFull => {
                &mut self.categories[category.index()]
            }
        };
        if slot.is_none() {
            *slot = Some((reason, wait));
        }
    }
}

/// Resolves when `token` is cancelled; never resolves without one.
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
