use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_test::assert_ok;

use kraken_rate_limiter::auth::CredentialId;
use kraken_rate_limiter::rate_limit::{
    LimiterStats, PersistedState, SNAPSHOT_VERSION, TierProfile, snapshot_path,
};
use kraken_rate_limiter::{RateLimitConfig, RateLimiter, RequestOptions, VerificationTier};

fn snapshot(penalty_points: f64, age: Duration) -> PersistedState {
    PersistedState {
        version: SNAPSHOT_VERSION,
        credential: None,
        tier: VerificationTier::Starter,
        penalty_points,
        saved_at: OffsetDateTime::now_utc() - age,
        orders: BTreeMap::new(),
        stats: LimiterStats::default(),
    }
}

fn config(dir: &Path) -> RateLimitConfig {
    RateLimitConfig::builder()
        .tier(VerificationTier::Starter)
        .state_dir(dir)
        .build()
}

#[tokio::test]
async fn test_restored_penalty_is_decayed() {
    let dir = tempfile::tempdir().unwrap();
    snapshot(100.0, Duration::from_secs(50))
        .save(&snapshot_path(dir.path(), None))
        .await
        .unwrap();

    let profile = TierProfile {
        max_penalty_points: 200.0,
        penalty_decay_rate: 1.0,
        ..TierProfile::for_tier(VerificationTier::Starter)
    };
    let config = RateLimitConfig::builder()
        .state_dir(dir.path())
        .profile(profile)
        .build();
    let limiter = RateLimiter::start(config).await.unwrap();

    let points = limiter.get_status().await.penalty.points;
    assert!((points - 50.0).abs() < 1.0, "restored {points} points");

    limiter.shutdown().await;
}

#[tokio::test]
async fn test_stale_snapshot_discarded() {
    let dir = tempfile::tempdir().unwrap();
    snapshot(10.0, Duration::from_secs(2 * 3600))
        .save(&snapshot_path(dir.path(), None))
        .await
        .unwrap();

    let limiter = RateLimiter::new(config(dir.path()));
    assert!(!limiter.load_state().await.unwrap());
    assert_eq!(limiter.get_status().await.penalty.points, 0.0);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = RateLimiter::start(config(dir.path())).await.unwrap();
    let cancel = RequestOptions::new().order_age(Duration::from_secs(1));
    let decision = first.check_rate_limit("CancelOrder", &cancel).await;
    assert!(decision.allowed);
    assert_eq!(decision.penalty_points, 8.0);
    first.record_order_time("OTXQ3M", None).await;
    first.shutdown().await;
    assert!(snapshot_path(dir.path(), None).exists());

    let second = RateLimiter::start(config(dir.path())).await.unwrap();
    let status = second.get_status().await;
    assert!(status.penalty.points > 6.0 && status.penalty.points <= 8.0);
    assert_eq!(status.tracked_orders, 1);
    assert_eq!(status.stats.allowed, 1);
    assert!(status.persistence_active);
    assert!(second.get_order_age("OTXQ3M").await.is_some());

    // Window and bucket are not persisted.
    assert_eq!(status.private.window_count, 0);
    second.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_keyed_by_credential() {
    let dir = tempfile::tempdir().unwrap();
    let api_key = "kraken-test-api-key-0001";
    let id = CredentialId::from_api_key(api_key);
    let config = RateLimitConfig::builder()
        .state_dir(dir.path())
        .credential(id.clone())
        .build();

    let limiter = RateLimiter::new(config);
    limiter.check_rate_limit("Balance", &RequestOptions::default()).await;
    assert_ok!(limiter.save_state().await);

    let path = snapshot_path(dir.path(), Some(&id));
    assert_eq!(limiter.snapshot_path(), Some(path.as_path()));
    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(!contents.contains(api_key));
    assert!(!snapshot_path(dir.path(), None).exists());

    // Someone else's snapshot at our path is ignored.
    let mut foreign = snapshot(12.0, Duration::from_secs(1));
    foreign.credential = Some(CredentialId::from_label("other-desk"));
    foreign.save(&path).await.unwrap();
    assert!(!limiter.load_state().await.unwrap());
}

#[tokio::test]
async fn test_configured_tier_wins_over_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut saved = snapshot(4.0, Duration::from_secs(1));
    saved.tier = VerificationTier::Pro;
    saved.save(&snapshot_path(dir.path(), None)).await.unwrap();

    let limiter = RateLimiter::new(config(dir.path()));
    assert!(limiter.load_state().await.unwrap());

    let status = limiter.get_status().await;
    assert_eq!(status.tier, VerificationTier::Starter);
    assert_eq!(status.private.window_limit, 10);
    assert!(status.penalty.points > 3.0);
}

#[tokio::test]
async fn test_unwritable_state_dir_degrades_to_memory() {
    // A regular file where the state directory should be.
    let file = tempfile::NamedTempFile::new().unwrap();
    let limiter = RateLimiter::start(config(file.path())).await.unwrap();
    assert!(limiter.get_status().await.persistence_active);

    assert!(limiter.save_state().await.is_err());
    let status = limiter.get_status().await;
    assert!(!status.persistence_active);

    let decision = limiter
        .check_rate_limit("Balance", &RequestOptions::default())
        .await;
    assert!(decision.allowed);

    limiter.shutdown().await;
}
