//! Example: Admission checks, waiting, the priority queue and status.
//!
//! Run with: cargo run --example rate_limit
//!
//! Set `RUST_LOG=kraken_rate_limiter=debug` to see every denial.

use std::time::Duration;

use kraken_rate_limiter::auth::Credentials;
use kraken_rate_limiter::queue::SchedulingStrategy;
use kraken_rate_limiter::rate_limit::{AgePenaltyKind, age_penalty};
use kraken_rate_limiter::{
    Priority, RateLimitConfig, RateLimitError, RateLimiter, RequestOptions, VerificationTier,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RateLimitError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let state_dir = std::env::temp_dir().join("kraken-rate-limiter-demo");
    let mut builder = RateLimitConfig::builder()
        .tier(VerificationTier::Starter)
        .enable_queue(true)
        .state_dir(&state_dir);
    // State is keyed by a fingerprint of the API key, if one is configured.
    if let Some(credentials) = Credentials::try_from_env() {
        println!("Using credentials {:?}", credentials);
        builder = builder.credential(credentials.id());
    }
    let config = builder.build();
    let limiter = RateLimiter::start(config).await?;

    // Plain checks until the private bucket runs dry.
    for i in 1..=12 {
        let decision = limiter
            .check_rate_limit("Balance", &RequestOptions::default())
            .await;
        println!(
            "Balance #{i}: allowed={} reason={:?} wait={:?}",
            decision.allowed, decision.reason, decision.wait
        );
    }

    // Cancelling a fresh order costs far more than cancelling an old one.
    println!(
        "Cancel penalty at 2s: {}, at 10min: {}",
        age_penalty(AgePenaltyKind::Cancel, Duration::from_secs(2)),
        age_penalty(AgePenaltyKind::Cancel, Duration::from_secs(600))
    );
    limiter.record_order_time("ODEMO1", None).await;
    let cancel = RequestOptions::new().order_id("ODEMO1");
    let decision = limiter.check_rate_limit("CancelOrder", &cancel).await;
    println!("CancelOrder: {decision:?}");

    // Public endpoints have their own budget.
    let ticker = limiter
        .check_rate_limit("Ticker", &RequestOptions::default())
        .await;
    println!("Ticker allowed: {}", ticker.allowed);

    // Waiting with a timeout.
    let short = RequestOptions::new().timeout(Duration::from_millis(500));
    let admitted = limiter.wait_for_rate_limit("Balance", &short).await;
    println!("Admitted within 500ms: {admitted}");

    // Queued callers are released by priority.
    limiter.set_strategy(SchedulingStrategy::WeightedFair).await?;
    let handle = limiter
        .submit(
            "AddOrder",
            &RequestOptions::new()
                .priority(Priority::High)
                .timeout(Duration::from_secs(2)),
        )
        .await?;
    let id = handle.id().to_string();
    println!("Queued {}: {:?}", id, handle.wait().await);

    let status = limiter.get_status().await;
    match serde_json::to_string_pretty(&status) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to render status: {e}"),
    }

    limiter.shutdown().await;
    println!("Snapshot written to {}", state_dir.display());
    Ok(())
}
