use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kraken_rate_limiter::queue::{
    PriorityRequestQueue, QueueConfig, QueuedRequest, SchedulingStrategy,
};
use kraken_rate_limiter::rate_limit::TierProfile;
use kraken_rate_limiter::types::DenyReason;
use kraken_rate_limiter::{Priority, RateLimitConfig, RateLimitError, RateLimiter, RequestOptions};

/// A limiter whose private window admits one call per minute, with the window
/// already used up.
async fn blocked_limiter(queue: QueueConfig, backoff_max: f64) -> RateLimiter {
    let profile = TierProfile {
        private_limit: 1,
        private_burst: 10,
        backoff_max,
        ..TierProfile::default()
    };
    let limiter = RateLimiter::new(
        RateLimitConfig::builder()
            .profile(profile)
            .enable_queue(true)
            .queue(queue)
            .build(),
    );
    assert!(
        limiter
            .check_rate_limit("Balance", &RequestOptions::default())
            .await
            .allowed
    );
    limiter
}

fn at(priority: Priority) -> RequestOptions {
    RequestOptions::new().priority(priority)
}

#[test]
fn test_priority_fifo_releases_levels_in_order() {
    let now = Instant::now();
    let mut queue = PriorityRequestQueue::new(QueueConfig::default(), 10);
    for priority in Priority::ALL.iter().rev() {
        queue
            .enqueue(QueuedRequest::new(priority.to_string(), "Balance", *priority, (), now))
            .unwrap();
    }

    let order: Vec<Priority> = std::iter::from_fn(|| queue.try_dequeue(now))
        .map(|request| request.priority)
        .collect();
    assert_eq!(order, Priority::ALL.to_vec());
}

#[test]
fn test_adaptive_serves_growing_backlog() {
    let now = Instant::now();
    let config = QueueConfig {
        strategy: SchedulingStrategy::Adaptive,
        ..QueueConfig::default()
    };
    let mut queue = PriorityRequestQueue::new(config, 100);
    queue
        .enqueue(QueuedRequest::new("h", "AddOrder", Priority::High, (), now))
        .unwrap();
    for i in 0..20 {
        queue
            .enqueue(QueuedRequest::new(format!("l{i}"), "Ledgers", Priority::Low, (), now))
            .unwrap();
    }

    let first = queue.try_dequeue(now).unwrap();
    assert_eq!(first.priority, Priority::Low);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_callers_released_by_priority() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;
    let released = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |name: &'static str, priority: Priority| {
        let limiter = limiter.clone();
        let released = released.clone();
        tokio::spawn(async move {
            limiter.acquire("Balance", &at(priority)).await.unwrap();
            released.lock().unwrap().push(name);
        })
    };

    // The oldest waiter does not hold up more urgent ones that arrive later.
    let low = spawn_waiter("low", Priority::Low);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let normal = spawn_waiter("normal", Priority::Normal);
    let critical = spawn_waiter("critical", Priority::Critical);

    for waiter in [low, normal, critical] {
        waiter.await.unwrap();
    }
    assert_eq!(
        *released.lock().unwrap(),
        vec!["critical", "normal", "low"]
    );

    let queue = limiter.get_status().await.queue.unwrap();
    assert_eq!(queue.stats.completed, 3);
    assert!(queue.stats.max_wait >= Duration::from_secs(179));
}

#[tokio::test(start_paused = true)]
async fn test_public_request_not_held_up_by_private_backlog() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;
    let private = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire("Balance", &at(Priority::Low)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    limiter
        .acquire("Ticker", &at(Priority::Critical))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let status = limiter.get_status().await;
    assert_eq!(status.public.window_count, 1);
    assert_eq!(status.queue.unwrap().pending, 1);

    limiter.shutdown().await;
    assert!(matches!(
        private.await.unwrap(),
        Err(RateLimitError::Shutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_and_duplicate_ids() {
    let queue = QueueConfig {
        capacity: Some(2),
        ..QueueConfig::default()
    };
    let limiter = blocked_limiter(queue, 300.0).await;

    let _a = limiter
        .submit("Balance", &RequestOptions::new().request_id("a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let _b = limiter
        .submit("Balance", &RequestOptions::new().request_id("b"))
        .await
        .unwrap();

    assert!(matches!(
        limiter.submit("Balance", &RequestOptions::new().request_id("c")).await,
        Err(RateLimitError::QueueFull { capacity: 2 })
    ));
    assert!(matches!(
        limiter.submit("Balance", &RequestOptions::new().request_id("a")).await,
        Err(RateLimitError::DuplicateRequestId(id)) if id == "a"
    ));

    let queue = limiter.get_status().await.queue.unwrap();
    assert_eq!(queue.pending, 2);
    assert_eq!(queue.processing, 0);
    assert_eq!(queue.stats.rejected_full, 1);
    assert_eq!(queue.stats.rejected_duplicate, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_acquire_consumes_nothing() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;

    let gave_up = tokio::time::timeout(
        Duration::from_secs(1),
        limiter.acquire("Balance", &RequestOptions::default()),
    )
    .await;
    assert!(gave_up.is_err());
    tokio::time::sleep(Duration::from_secs(70)).await;

    let status = limiter.get_status().await;
    assert_eq!(status.stats.allowed, 1);
    assert_eq!(status.private.window_count, 0);
    let queue = status.queue.unwrap();
    assert_eq!(queue.pending, 0);
    assert_eq!(queue.stats.completed, 0);
    assert_eq!(queue.stats.cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_consumes_nothing() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;

    let handle = limiter
        .submit("Balance", &RequestOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(handle);
    tokio::time::sleep(Duration::from_secs(70)).await;

    let status = limiter.get_status().await;
    assert_eq!(status.stats.allowed, 1);
    assert_eq!(status.private.window_count, 0);
    let queue = status.queue.unwrap();
    assert_eq!(queue.pending, 0);
    assert_eq!(queue.stats.completed, 0);
    assert_eq!(queue.stats.cancelled, 1);

    // The slot it would have taken is still free.
    assert!(
        limiter
            .check_rate_limit("Balance", &RequestOptions::default())
            .await
            .allowed
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_request() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;

    let _first = limiter
        .submit("Balance", &RequestOptions::new().request_id("first"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let queued = limiter
        .submit("Balance", &RequestOptions::new().request_id("second"))
        .await
        .unwrap();

    limiter.cancel_request("second").await.unwrap();
    assert!(matches!(
        queued.wait().await,
        Err(RateLimitError::RequestCancelled(id)) if id == "second"
    ));
    assert!(matches!(
        limiter.cancel_request("second").await,
        Err(RateLimitError::UnknownRequest(_))
    ));

    let token = CancellationToken::new();
    let waiter = {
        let limiter = limiter.clone();
        let options = RequestOptions::new().cancel_token(token.clone());
        tokio::spawn(async move { limiter.acquire("Balance", &options).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    token.cancel();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(RateLimitError::RequestCancelled(_))
    ));

    let queue = limiter.get_status().await.queue.unwrap();
    assert_eq!(queue.stats.cancelled, 2);
    assert_eq!(queue.stats.expired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_expires_while_queued() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;

    let first = limiter
        .submit("Balance", &RequestOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let impatient = limiter
        .submit("Balance", &RequestOptions::new().timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(first.wait().await.is_ok());
    assert!(matches!(
        impatient.wait().await,
        Err(RateLimitError::RequestExpired(_))
    ));
    let queue = limiter.get_status().await.queue.unwrap();
    assert_eq!(queue.stats.expired, 1);
    assert_eq!(queue.stats.cancelled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    // Each attempt lasts at most one second, far less than the window needs.
    let limiter = blocked_limiter(QueueConfig::default(), 1.0).await;

    let handle = limiter
        .submit("Balance", &RequestOptions::new().max_retries(2))
        .await
        .unwrap();
    let outcome = handle.wait().await;
    assert!(matches!(
        outcome,
        Err(RateLimitError::CapacityExceeded {
            reason: DenyReason::SlidingWindowFull,
            ..
        })
    ));

    let queue = limiter.get_status().await.queue.unwrap();
    assert_eq!(queue.stats.retried, 2);
    assert_eq!(queue.stats.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_pending_requests() {
    let limiter = blocked_limiter(QueueConfig::default(), 300.0).await;
    let first = limiter
        .submit("Balance", &RequestOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = limiter
        .submit("Balance", &RequestOptions::default())
        .await
        .unwrap();

    limiter.shutdown().await;
    assert!(matches!(first.wait().await, Err(RateLimitError::Shutdown)));
    assert!(matches!(second.wait().await, Err(RateLimitError::Shutdown)));
}
