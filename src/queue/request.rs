//! Queued request and its completion handle.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RateLimitError;
use crate::types::Priority;

/// What the submitter of a queued request eventually learns.
pub type RequestOutcome = Result<(), RateLimitError>;

/// A request waiting in, or dequeued from, a [`PriorityRequestQueue`].
///
/// [`PriorityRequestQueue`]: crate::queue::PriorityRequestQueue
#[derive(Debug)]
pub struct QueuedRequest<P> {
    /// Unique request ID
    pub id: String,
    /// Endpoint the request is for
    pub endpoint: String,
    /// Scheduling priority
    pub priority: Priority,
    /// Caller data carried through the queue
    pub payload: P,
    /// When the request was first enqueued
    pub created_at: Instant,
    /// When the current scheduling attempt began
    pub scheduled_at: Option<Instant>,
    /// Deadline after which the request is expired instead of scheduled
    pub expires_at: Option<Instant>,
    /// Penalty points the request is expected to cost
    pub penalty_points: f64,
    /// Tokens the request is expected to consume
    pub weight: u32,
    /// How many times the request has been requeued
    pub retry_count: u32,
    /// Maximum number of requeues
    pub max_retries: u32,
    /// Set once the request has been cancelled
    pub cancelled: bool,
    /// Insertion sequence number; orders requests globally
    pub(crate) seq: u64,
    pub(crate) completion: Option<oneshot::Sender<RequestOutcome>>,
}

impl<P> QueuedRequest<P> {
    /// Create a request created at `now`, with no deadline and no retries.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        priority: Priority,
        payload: P,
        now: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            priority,
            payload,
            created_at: now,
            scheduled_at: None,
            expires_at: None,
            penalty_points: 0.0,
            weight: 1,
            retry_count: 0,
            max_retries: 0,
            cancelled: false,
            seq: 0,
            completion: None,
        }
    }

    /// Expire the request if it is not scheduled within `timeout` of creation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.expires_at = self.created_at.checked_add(timeout);
        self
    }

    /// Allow the request to be requeued up to `max_retries` times.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Record the expected cost of the request.
    pub fn with_cost(mut self, weight: u32, penalty_points: f64) -> Self {
        self.weight = weight;
        self.penalty_points = penalty_points;
        self
    }

    /// Check if the request should be expired at `now`.
    pub fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
            || now.saturating_duration_since(self.created_at) >= max_age
    }

    /// Time spent waiting before being scheduled.
    pub fn wait_time(&self) -> Option<Duration> {
        self.scheduled_at
            .map(|at| at.saturating_duration_since(self.created_at))
    }

    /// Check if the submitter dropped its [`CompletionHandle`].
    pub fn is_abandoned(&self) -> bool {
        self.completion.as_ref().is_some_and(|tx| tx.is_closed())
    }

    pub(crate) fn resolve(&mut self, outcome: RequestOutcome) {
        if let Some(tx) = self.completion.take() {
            // The submitter may have stopped waiting; nothing to do then.
            let _ = tx.send(outcome);
        }
    }
}

/// Handle returned by [`PriorityRequestQueue::enqueue`] that resolves when the
/// request is completed, cancelled, expired or finally failed.
///
/// [`PriorityRequestQueue::enqueue`]: crate::queue::PriorityRequestQueue::enqueue
#[derive(Debug)]
pub struct CompletionHandle {
    id: String,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl CompletionHandle {
    pub(crate) fn new(id: String, rx: oneshot::Receiver<RequestOutcome>) -> Self {
        Self { id, rx }
    }

    /// ID of the request this handle belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the request's outcome.
    ///
    /// If the queue is dropped without resolving the request, returns
    /// [`RateLimitError::Shutdown`].
    pub async fn wait(self) -> RequestOutcome {
        self.rx.await.unwrap_or(Err(RateLimitError::Shutdown))
    }

    /// Check for an outcome without waiting.
    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RateLimitError::Shutdown)),
        }
    }
}
