//! Priority request queue.
//!
//! Holds callers waiting for rate limit capacity and releases them according to a
//! [`SchedulingStrategy`]. The queue itself never blocks. Consumers either take
//! requests one at a time with [`PriorityRequestQueue::try_dequeue`], or let
//! [`PriorityRequestQueue::schedule`] offer every pending request in strategy
//! order, which is how the [`RateLimiter`] releases its waiting callers.
//!
//! # Example
//!
//! ```rust
//! use kraken_rate_limiter::queue::{PriorityRequestQueue, QueueConfig, QueuedRequest};
//! use kraken_rate_limiter::Priority;
//! use tokio::time::Instant;
//!
//! let now = Instant::now();
//! let mut queue: PriorityRequestQueue<()> = PriorityRequestQueue::new(QueueConfig::default(), 10);
//!
//! queue.enqueue(QueuedRequest::new("low", "Ledgers", Priority::Low, (), now)).unwrap();
//! queue.enqueue(QueuedRequest::new("urgent", "CancelOrder", Priority::Critical, (), now)).unwrap();
//!
//! let next = queue.try_dequeue(now).unwrap();
//! assert_eq!(next.id, "urgent");
//! ```
//!
//! [`RateLimiter`]: crate::RateLimiter

mod request;
mod strategy;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub use request::{CompletionHandle, QueuedRequest, RequestOutcome};
pub use strategy::{DEFAULT_WEIGHTS, SchedulingStrategy, WeightedCredits};

use crate::error::RateLimitError;
use crate::types::Priority;

const LEVELS: usize = Priority::ALL.len();

/// Queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Selection strategy
    pub strategy: SchedulingStrategy,
    /// Requests older than this are expired regardless of their own deadline
    pub max_age: Duration,
    /// How often the limiter sweeps expired requests
    pub sweep_interval: Duration,
    /// Overrides the tier's queue capacity
    pub capacity: Option<usize>,
    /// Weighted-fair credit weights, most urgent level first
    pub weights: [f64; LEVELS],
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::default(),
            max_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            capacity: None,
            weights: DEFAULT_WEIGHTS,
        }
    }
}

/// Cumulative queue counters.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests accepted
    pub enqueued: u64,
    /// Requests handed to a consumer
    pub dequeued: u64,
    /// Requests completed
    pub completed: u64,
    /// Requests cancelled by their submitter
    pub cancelled: u64,
    /// Requests dropped for exceeding their deadline or the maximum age
    pub expired: u64,
    /// Requests that ran out of retries
    pub failed: u64,
    /// Requeues after a failed attempt
    pub retried: u64,
    /// Enqueues refused because the queue was full
    pub rejected_full: u64,
    /// Enqueues refused because the ID was in use
    pub rejected_duplicate: u64,
    /// Sum of scheduling latencies
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub total_wait: Duration,
    /// Largest scheduling latency seen
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_wait: Duration,
}

impl QueueStats {
    /// Mean time between enqueue and dequeue.
    pub fn average_wait(&self) -> Duration {
        if self.dequeued == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total_wait.as_secs_f64() / self.dequeued as f64)
        }
    }

    fn record_wait(&mut self, wait: Duration) {
        self.dequeued += 1;
        self.total_wait += wait;
        self.max_wait = self.max_wait.max(wait);
    }
}

/// Snapshot of queue depth and counters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Active strategy
    pub strategy: SchedulingStrategy,
    /// Pending requests per priority
    pub depth: BTreeMap<Priority, usize>,
    /// Total pending requests
    pub pending: usize,
    /// Requests dequeued but not yet completed
    pub processing: usize,
    /// Maximum pending requests
    pub capacity: usize,
    /// Mean scheduling latency
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub average_wait: Duration,
    /// Cumulative counters
    pub stats: QueueStats,
}

/// What a [`PriorityRequestQueue::schedule`] consumer decided for one request.
#[derive(Debug)]
pub enum Verdict {
    /// Resolve the request successfully
    Admit,
    /// Leave it queued in its place and offer the next one
    Skip,
    /// Resolve it as cancelled
    Cancel,
    /// Requeue it at the back of its level if it has retries left, otherwise
    /// resolve it with the error
    Fail(RateLimitError),
}

/// Counts from one [`PriorityRequestQueue::schedule`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulePass {
    /// Requests admitted
    pub admitted: usize,
    /// Requests left in place
    pub skipped: usize,
    /// Requests requeued for another attempt
    pub requeued: usize,
    /// Requests dropped because their submitter stopped waiting
    pub abandoned: usize,
}

/// A dequeued request awaiting completion.
#[derive(Debug)]
struct InFlight {
    priority: Priority,
    completion: Option<oneshot::Sender<RequestOutcome>>,
}

/// Priority queue with pluggable selection strategy.
#[derive(Debug)]
pub struct PriorityRequestQueue<P> {
    config: QueueConfig,
    capacity: usize,
    /// Pending requests by ID
    pending: HashMap<String, QueuedRequest<P>>,
    /// Per-level insertion order as `(seq, id)`. Entries whose request has left
    /// `pending` are skipped lazily.
    levels: [VecDeque<(u64, String)>; LEVELS],
    depth: [usize; LEVELS],
    processing: HashMap<String, InFlight>,
    credits: WeightedCredits,
    next_seq: u64,
    stats: QueueStats,
}

impl<P> PriorityRequestQueue<P> {
    /// Create an empty queue holding at most `capacity` pending requests.
    pub fn new(config: QueueConfig, capacity: usize) -> Self {
        let capacity = config.capacity.unwrap_or(capacity);
        Self {
            credits: WeightedCredits::new(config.weights),
            config,
            capacity,
            pending: HashMap::new(),
            levels: Default::default(),
            depth: [0; LEVELS],
            processing: HashMap::new(),
            next_seq: 0,
            stats: QueueStats::default(),
        }
    }

    /// Add a request.
    ///
    /// Fails with [`RateLimitError::QueueFull`] at capacity and with
    /// [`RateLimitError::DuplicateRequestId`] if the ID is pending or in flight.
    pub fn enqueue(&mut self, mut request: QueuedRequest<P>) -> Result<CompletionHandle, RateLimitError> {
        if self.pending.contains_key(&request.id) || self.processing.contains_key(&request.id) {
            self.stats.rejected_duplicate += 1;
            return Err(RateLimitError::DuplicateRequestId(request.id));
        }
        if self.pending.len() >= self.capacity {
            self.stats.rejected_full += 1;
            return Err(RateLimitError::QueueFull {
                capacity: self.capacity,
            });
        }

        let (tx, rx) = oneshot::channel();
        request.completion = Some(tx);
        let handle = CompletionHandle::new(request.id.clone(), rx);

        tracing::debug!(
            id = %request.id,
            endpoint = %request.endpoint,
            priority = %request.priority,
            "Request queued"
        );
        self.insert(request);
        self.stats.enqueued += 1;
        Ok(handle)
    }

    fn insert(&mut self, mut request: QueuedRequest<P>) {
        request.seq = self.next_seq;
        self.next_seq += 1;
        let level = request.priority.index();
        self.levels[level].push_back((request.seq, request.id.clone()));
        self.depth[level] += 1;
        self.pending.insert(request.id.clone(), request);
    }

    /// Put a request taken by [`pop_next`](Self::pop_next) back in front of its
    /// level, keeping its sequence number.
    fn restore_front(&mut self, request: QueuedRequest<P>) {
        let level = request.priority.index();
        self.levels[level].push_front((request.seq, request.id.clone()));
        self.depth[level] += 1;
        self.pending.insert(request.id.clone(), request);
    }

    fn take_pending(&mut self, id: &str) -> Option<QueuedRequest<P>> {
        let request = self.pending.remove(id)?;
        self.depth[request.priority.index()] -= 1;
        Some(request)
    }

    /// Sequence number of the oldest live entry at `level`, dropping stale entries.
    fn front_seq(&mut self, level: usize) -> Option<u64> {
        while let Some((seq, id)) = self.levels[level].front() {
            if self.pending.get(id).is_some_and(|r| r.seq == *seq) {
                return Some(*seq);
            }
            self.levels[level].pop_front();
        }
        None
    }

    fn select_level(&mut self) -> Option<usize> {
        match self.config.strategy {
            SchedulingStrategy::Fifo => (0..LEVELS)
                .filter_map(|level| self.front_seq(level).map(|seq| (seq, level)))
                .min()
                .map(|(_, level)| level),
            SchedulingStrategy::PriorityFifo => {
                (0..LEVELS).find(|&level| self.front_seq(level).is_some())
            }
            SchedulingStrategy::WeightedFair => self.credits.select(&self.depth, false),
            SchedulingStrategy::Adaptive => self.credits.select(&self.depth, true),
        }
    }

    /// Remove the next live request in strategy order, expiring stale ones on the way.
    fn pop_next(&mut self, now: Instant) -> Option<QueuedRequest<P>> {
        loop {
            let level = self.select_level()?;
            self.front_seq(level)?;
            let (_, id) = self.levels[level].pop_front()?;
            let Some(request) = self.take_pending(&id) else {
                continue;
            };

            if request.is_expired(now, self.config.max_age) {
                self.expire(request);
                continue;
            }
            return Some(request);
        }
    }

    /// Take the next request according to the active strategy, without waiting.
    ///
    /// Requests found expired on the way are resolved as expired and skipped. The
    /// returned request is tracked as in flight until completed, failed or cancelled.
    pub fn try_dequeue(&mut self, now: Instant) -> Option<QueuedRequest<P>> {
        let mut request = self.pop_next(now)?;
        request.scheduled_at = Some(now);
        self.stats
            .record_wait(now.saturating_duration_since(request.created_at));
        self.processing.insert(
            request.id.clone(),
            InFlight {
                priority: request.priority,
                completion: request.completion.take(),
            },
        );
        tracing::debug!(
            id = %request.id,
            priority = %request.priority,
            retry = request.retry_count,
            "Request dequeued"
        );
        Some(request)
    }

    /// Offer every pending request to `decide`, in strategy order, and apply its verdicts.
    ///
    /// Skipped requests keep their place and are not offered again in the same pass,
    /// so a request that cannot go yet never holds up the ones behind it. Requests
    /// whose submitter dropped its [`CompletionHandle`] are removed as cancelled
    /// without being offered. `scheduled_at` is set on first offer and cleared
    /// when a request is requeued.
    pub fn schedule<F>(&mut self, now: Instant, mut decide: F) -> SchedulePass
    where
        F: FnMut(&QueuedRequest<P>) -> Verdict,
    {
        let mut pass = SchedulePass::default();
        let mut skipped = Vec::new();
        let mut requeued = Vec::new();

        while let Some(mut request) = self.pop_next(now) {
            if request.is_abandoned() {
                tracing::debug!(id = %request.id, "Request abandoned by its submitter");
                self.stats.cancelled += 1;
                pass.abandoned += 1;
                continue;
            }
            if request.scheduled_at.is_none() {
                request.scheduled_at = Some(now);
            }

            match decide(&request) {
                Verdict::Admit => {
                    self.stats
                        .record_wait(now.saturating_duration_since(request.created_at));
                    self.stats.completed += 1;
                    tracing::debug!(
                        id = %request.id,
                        priority = %request.priority,
                        retry = request.retry_count,
                        "Request admitted"
                    );
                    request.resolve(Ok(()));
                    pass.admitted += 1;
                }
                Verdict::Skip => skipped.push(request),
                Verdict::Cancel => {
                    tracing::debug!(id = %request.id, "Request cancelled");
                    let error = RateLimitError::RequestCancelled(request.id.clone());
                    request.cancelled = true;
                    request.resolve(Err(error));
                    self.stats.cancelled += 1;
                }
                Verdict::Fail(error) => {
                    if self.retry(&mut request) {
                        requeued.push(request);
                    } else {
                        request.resolve(Err(error));
                        self.stats.failed += 1;
                    }
                }
            }
        }

        pass.skipped = skipped.len();
        pass.requeued = requeued.len();
        for request in skipped.into_iter().rev() {
            self.restore_front(request);
        }
        for request in requeued {
            self.insert(request);
        }
        pass
    }

    /// Count a retry if `request` has one left.
    fn retry(&mut self, request: &mut QueuedRequest<P>) -> bool {
        if request.retry_count >= request.max_retries {
            return false;
        }
        request.retry_count += 1;
        request.scheduled_at = None;
        self.stats.retried += 1;
        tracing::debug!(
            id = %request.id,
            retry = request.retry_count,
            max_retries = request.max_retries,
            "Request requeued"
        );
        true
    }

    /// Resolve an in-flight request successfully.
    pub fn complete_request(&mut self, id: &str) -> Result<(), RateLimitError> {
        let mut in_flight = self
            .processing
            .remove(id)
            .ok_or_else(|| RateLimitError::UnknownRequest(id.to_string()))?;
        if let Some(tx) = in_flight.completion.take() {
            let _ = tx.send(Ok(()));
        }
        self.stats.completed += 1;
        Ok(())
    }

    /// Cancel a pending or in-flight request.
    pub fn cancel_request(&mut self, id: &str) -> Result<(), RateLimitError> {
        let cancelled = RateLimitError::RequestCancelled(id.to_string());
        if let Some(mut request) = self.take_pending(id) {
            request.cancelled = true;
            request.resolve(Err(cancelled));
        } else if let Some(mut in_flight) = self.processing.remove(id) {
            if let Some(tx) = in_flight.completion.take() {
                let _ = tx.send(Err(cancelled));
            }
        } else {
            return Err(RateLimitError::UnknownRequest(id.to_string()));
        }
        tracing::debug!(id, "Request cancelled");
        self.stats.cancelled += 1;
        Ok(())
    }

    /// Report that an in-flight request could not be served.
    ///
    /// The request is requeued at the back of its level if it has retries left and
    /// `true` is returned. Otherwise its submitter receives `error` and `false` is
    /// returned. A request cancelled while in flight is dropped.
    pub fn fail_request(&mut self, mut request: QueuedRequest<P>, error: RateLimitError) -> bool {
        let Some(mut in_flight) = self.processing.remove(&request.id) else {
            return false;
        };
        if self.retry(&mut request) {
            request.completion = in_flight.completion.take();
            self.insert(request);
            true
        } else {
            if let Some(tx) = in_flight.completion.take() {
                let _ = tx.send(Err(error));
            }
            self.stats.failed += 1;
            false
        }
    }

    fn expire(&mut self, mut request: QueuedRequest<P>) {
        tracing::debug!(id = %request.id, priority = %request.priority, "Request expired");
        let error = RateLimitError::RequestExpired(request.id.clone());
        request.resolve(Err(error));
        self.stats.expired += 1;
    }

    /// Expire pending requests past their deadline or the maximum age.
    ///
    /// Returns the number of requests expired.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_age;
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|r| r.is_expired(now, max_age))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            if let Some(request) = self.take_pending(id) {
                self.expire(request);
            }
        }

        let pending = &self.pending;
        for level in &mut self.levels {
            level.retain(|(seq, id)| pending.get(id).is_some_and(|r| r.seq == *seq));
        }
        expired.len()
    }

    /// Check if a request is pending.
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Check if a request is in flight.
    pub fn is_processing(&self, id: &str) -> bool {
        self.processing.contains_key(id)
    }

    /// Total pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending requests at one priority.
    pub fn depth(&self, priority: Priority) -> usize {
        self.depth[priority.index()]
    }

    /// Requests in flight at one priority.
    pub fn processing_at(&self, priority: Priority) -> usize {
        self.processing
            .values()
            .filter(|f| f.priority == priority)
            .count()
    }

    /// Maximum pending requests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Active strategy.
    pub fn strategy(&self) -> SchedulingStrategy {
        self.config.strategy
    }

    /// Switch strategy. Weighted-fair credits restart from zero.
    pub fn set_strategy(&mut self, strategy: SchedulingStrategy) {
        self.config.strategy = strategy;
        self.credits.reset();
    }

    /// Cumulative counters.
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Zero the cumulative counters.
    pub fn reset_stats(&mut self) {
        self.stats = QueueStats::default();
    }

    /// Depth and counters snapshot.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            strategy: self.config.strategy,
            depth: Priority::ALL.iter().map(|p| (*p, self.depth(*p))).collect(),
            pending: self.pending.len(),
            processing: self.processing.len(),
            capacity: self.capacity,
            average_wait: self.stats.average_wait(),
            stats: self.stats.clone(),
        }
    }

    /// Resolve everything pending or in flight as shut down. Returns how many were resolved.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for (_, mut request) in self.pending.drain() {
            request.resolve(Err(RateLimitError::Shutdown));
            drained += 1;
        }
        for (_, mut in_flight) in self.processing.drain() {
            if let Some(tx) = in_flight.completion.take() {
                let _ = tx.send(Err(RateLimitError::Shutdown));
            }
            drained += 1;
        }
        for level in &mut self.levels {
            level.clear();
        }
        self.depth = [0; LEVELS];
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(strategy: SchedulingStrategy, capacity: usize) -> PriorityRequestQueue<u32> {
        PriorityRequestQueue::new(
            QueueConfig {
                strategy,
                ..QueueConfig::default()
            },
            capacity,
        )
    }

    fn req(id: &str, priority: Priority, now: Instant) -> QueuedRequest<u32> {
        QueuedRequest::new(id, "Balance", priority, 0, now)
    }

    fn drain_ids(q: &mut PriorityRequestQueue<u32>, now: Instant) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(r) = q.try_dequeue(now) {
            q.complete_request(&r.id).unwrap();
            ids.push(r.id);
        }
        ids
    }

    #[test]
    fn test_priority_fifo_critical_overtakes_low() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        q.enqueue(req("low", Priority::Low, t0)).unwrap();
        q.enqueue(req("critical", Priority::Critical, t0 + Duration::from_millis(1)))
            .unwrap();

        assert_eq!(drain_ids(&mut q, t0), vec!["critical", "low"]);
    }

    #[test]
    fn test_priority_fifo_order_across_levels() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        for p in Priority::ALL.iter().rev() {
            q.enqueue(req(&p.to_string(), *p, t0)).unwrap();
        }
        assert_eq!(
            drain_ids(&mut q, t0),
            vec!["critical", "high", "normal", "low", "background"]
        );
    }

    #[test]
    fn test_fifo_within_level() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        q.enqueue(req("a", Priority::Normal, t0)).unwrap();
        q.enqueue(req("b", Priority::Normal, t0)).unwrap();
        q.enqueue(req("c", Priority::Normal, t0)).unwrap();
        assert_eq!(drain_ids(&mut q, t0), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fifo_ignores_priority() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::Fifo, 10);
        q.enqueue(req("bg", Priority::Background, t0)).unwrap();
        q.enqueue(req("crit", Priority::Critical, t0)).unwrap();
        q.enqueue(req("low", Priority::Low, t0)).unwrap();
        assert_eq!(drain_ids(&mut q, t0), vec!["bg", "crit", "low"]);
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 2);
        q.enqueue(req("a", Priority::Normal, t0)).unwrap();
        assert!(matches!(
            q.enqueue(req("a", Priority::High, t0)),
            Err(RateLimitError::DuplicateRequestId(id)) if id == "a"
        ));
        q.enqueue(req("b", Priority::Normal, t0)).unwrap();
        assert!(matches!(
            q.enqueue(req("c", Priority::Normal, t0)),
            Err(RateLimitError::QueueFull { capacity: 2 })
        ));

        // In-flight IDs are still taken.
        let r = q.try_dequeue(t0).unwrap();
        assert!(matches!(
            q.enqueue(req(&r.id, Priority::Normal, t0)),
            Err(RateLimitError::DuplicateRequestId(_))
        ));
        assert_eq!(q.stats().rejected_full, 1);
        assert_eq!(q.stats().rejected_duplicate, 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_request() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let handle = q.enqueue(req("a", Priority::Normal, t0)).unwrap();
        q.enqueue(req("b", Priority::Normal, t0)).unwrap();

        q.cancel_request("a").unwrap();
        assert!(matches!(
            handle.wait().await,
            Err(RateLimitError::RequestCancelled(_))
        ));
        assert_eq!(q.depth(Priority::Normal), 1);
        assert_eq!(drain_ids(&mut q, t0), vec!["b"]);
        assert!(matches!(
            q.cancel_request("a"),
            Err(RateLimitError::UnknownRequest(_))
        ));
        assert_eq!(q.stats().cancelled, 1);
    }

    #[test]
    fn test_id_reuse_after_cancel() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        q.enqueue(req("a", Priority::Low, t0)).unwrap();
        q.cancel_request("a").unwrap();
        q.enqueue(req("x", Priority::Low, t0)).unwrap();
        q.enqueue(req("a", Priority::Low, t0)).unwrap();
        assert_eq!(drain_ids(&mut q, t0), vec!["x", "a"]);
    }

    #[tokio::test]
    async fn test_expired_requests_swept() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let handle = q
            .enqueue(req("short", Priority::High, t0).with_timeout(Duration::from_secs(1)))
            .unwrap();
        q.enqueue(req("long", Priority::High, t0)).unwrap();

        assert_eq!(q.sweep_expired(t0 + Duration::from_secs(2)), 1);
        assert!(matches!(
            handle.wait().await,
            Err(RateLimitError::RequestExpired(_))
        ));
        assert_eq!(q.stats().expired, 1);
        assert_eq!(q.stats().cancelled, 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_dequeue_skips_expired() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        q.enqueue(req("stale", Priority::Critical, t0).with_timeout(Duration::from_secs(1)))
            .unwrap();
        q.enqueue(req("fresh", Priority::Low, t0)).unwrap();

        let r = q.try_dequeue(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(r.id, "fresh");
        assert_eq!(q.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_fail_request_retries_then_fails() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let handle = q
            .enqueue(req("a", Priority::Normal, t0).with_max_retries(1))
            .unwrap();

        let r = q.try_dequeue(t0).unwrap();
        assert!(q.fail_request(r, RateLimitError::Shutdown));
        assert!(q.is_pending("a"));

        let r = q.try_dequeue(t0).unwrap();
        assert_eq!(r.retry_count, 1);
        let denied = RateLimitError::CapacityExceeded {
            reason: crate::types::DenyReason::TokenBucketEmpty,
            retry_after: Duration::from_secs(1),
        };
        assert!(!q.fail_request(r, denied));
        assert!(matches!(
            handle.wait().await,
            Err(RateLimitError::CapacityExceeded { .. })
        ));
        assert_eq!(q.stats().retried, 1);
        assert_eq!(q.stats().failed, 1);
    }

    #[test]
    fn test_scheduling_latency_recorded() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        q.enqueue(req("a", Priority::Normal, t0)).unwrap();
        q.enqueue(req("b", Priority::Normal, t0)).unwrap();

        let a = q.try_dequeue(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(a.wait_time(), Some(Duration::from_secs(2)));
        q.try_dequeue(t0 + Duration::from_secs(4)).unwrap();

        assert_eq!(q.stats().average_wait(), Duration::from_secs(3));
        assert_eq!(q.stats().max_wait, Duration::from_secs(4));
        assert_eq!(q.status().processing, 2);
    }

    #[test]
    fn test_average_wait_with_large_count() {
        let stats = QueueStats {
            dequeued: 1 << 32,
            total_wait: Duration::from_secs(1 << 33),
            ..QueueStats::default()
        };
        assert_eq!(stats.average_wait(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_schedule_skipped_requests_keep_their_place() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let blocked = q.enqueue(req("blocked", Priority::Critical, t0)).unwrap();
        let second = q.enqueue(req("second", Priority::Critical, t0)).unwrap();
        let free = q
            .enqueue(QueuedRequest::new("free", "Ticker", Priority::Low, 0, t0))
            .unwrap();

        let mut offered = Vec::new();
        let pass = q.schedule(t0, |r| {
            offered.push(r.id.clone());
            if r.endpoint == "Ticker" {
                Verdict::Admit
            } else {
                Verdict::Skip
            }
        });

        assert_eq!(offered, vec!["blocked", "second", "free"]);
        assert_eq!(pass.admitted, 1);
        assert_eq!(pass.skipped, 2);
        assert!(free.wait().await.is_ok());
        assert!(q.is_pending("blocked"));
        assert_eq!(q.status().processing, 0);
        assert_eq!(drain_ids(&mut q, t0), vec!["blocked", "second"]);
        assert!(blocked.wait().await.is_ok());
        assert!(second.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_schedule_drops_abandoned_requests() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let gone = q.enqueue(req("gone", Priority::High, t0)).unwrap();
        let kept = q.enqueue(req("kept", Priority::Low, t0)).unwrap();
        drop(gone);

        let mut offered = Vec::new();
        let pass = q.schedule(t0, |r| {
            offered.push(r.id.clone());
            Verdict::Admit
        });

        assert_eq!(offered, vec!["kept"]);
        assert_eq!(pass.abandoned, 1);
        assert!(kept.wait().await.is_ok());
        assert_eq!(q.stats().cancelled, 1);
        assert_eq!(q.stats().completed, 1);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_fail_requeues_after_the_pass() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let handle = q
            .enqueue(req("a", Priority::Normal, t0).with_max_retries(1))
            .unwrap();
        let cancel = q.enqueue(req("b", Priority::Normal, t0)).unwrap();

        let pass = q.schedule(t0, |r| match r.id.as_str() {
            "a" => Verdict::Fail(RateLimitError::Shutdown),
            _ => Verdict::Cancel,
        });
        assert_eq!(pass.requeued, 1);
        assert!(matches!(
            cancel.wait().await,
            Err(RateLimitError::RequestCancelled(_))
        ));

        let later = t0 + Duration::from_secs(1);
        let mut started = None;
        let pass = q.schedule(later, |r| {
            started = r.scheduled_at;
            Verdict::Fail(RateLimitError::QueueDisabled)
        });
        assert_eq!(pass.requeued, 0);
        assert_eq!(started, Some(later));
        assert!(matches!(handle.wait().await, Err(RateLimitError::QueueDisabled)));
        assert_eq!(q.stats().retried, 1);
        assert_eq!(q.stats().failed, 1);
        assert_eq!(q.stats().cancelled, 1);
    }

    #[test]
    fn test_weighted_fair_serves_all_levels() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::WeightedFair, 500);
        for p in Priority::ALL {
            for i in 0..40 {
                q.enqueue(req(&format!("{p}-{i}"), p, t0)).unwrap();
            }
        }
        let mut served: BTreeMap<Priority, usize> = BTreeMap::new();
        for _ in 0..37 {
            let r = q.try_dequeue(t0).unwrap();
            *served.entry(r.priority).or_default() += 1;
        }
        assert_eq!(served[&Priority::Critical], 20);
        assert_eq!(served[&Priority::High], 10);
        assert_eq!(served[&Priority::Normal], 4);
        assert_eq!(served[&Priority::Low], 2);
        assert_eq!(served[&Priority::Background], 1);
    }

    #[tokio::test]
    async fn test_drain_resolves_everything() {
        let t0 = Instant::now();
        let mut q = queue(SchedulingStrategy::PriorityFifo, 10);
        let pending = q.enqueue(req("a", Priority::Normal, t0)).unwrap();
        let in_flight = q.enqueue(req("b", Priority::Critical, t0)).unwrap();
        q.try_dequeue(t0).unwrap();

        assert_eq!(q.drain(), 2);
        assert!(matches!(pending.wait().await, Err(RateLimitError::Shutdown)));
        assert!(matches!(in_flight.wait().await, Err(RateLimitError::Shutdown)));
        assert!(q.is_empty());
    }
}
