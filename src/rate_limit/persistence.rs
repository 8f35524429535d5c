//! Snapshot persistence.
//!
//! Only state that outlives a restart on the exchange side is saved: the penalty
//! budget, order creation times and cumulative statistics. Token buckets and
//! sliding windows cover at most a minute and start fresh.
//!
//! ```text
//! state_dir/
//! └── rate_limit_<credential-id|anonymous>.json
//! ```
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::auth::CredentialId;
use crate::error::RateLimitError;
use crate::rate_limit::LimiterStats;
use crate::types::VerificationTier;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot file for a credential under `dir`.
pub fn snapshot_path(dir: &Path, credential: Option<&CredentialId>) -> PathBuf {
    let key = credential.map_or("anonymous", CredentialId::as_str);
    dir.join(format!("rate_limit_{key}.json"))
}

/// Limiter state written to disk.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version
    pub version: u32,
    /// Credential the state belongs to
    pub credential: Option<CredentialId>,
    /// Tier at save time
    pub tier: VerificationTier,
    /// Penalty points at save time, before any decay
    pub penalty_points: f64,
    /// Wall-clock save time
    #[serde_as(as = "Rfc3339")]
    pub saved_at: OffsetDateTime,
    /// Tracked order creation times
    #[serde_as(as = "BTreeMap<_, Rfc3339>")]
    #[serde(default)]
    pub orders: BTreeMap<String, OffsetDateTime>,
    /// Cumulative counters
    #[serde(default)]
    pub stats: LimiterStats,
}

impl PersistedState {
    /// Time elapsed since the snapshot was taken. Zero if `saved_at` is in the future.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        let elapsed = now - self.saved_at;
        if elapsed.is_negative() {
            Duration::ZERO
        } else {
            elapsed.unsigned_abs()
        }
    }

    /// Check if the snapshot is recent enough to restore.
    pub fn is_fresh(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        self.age(now) < max_age
    }

    /// Write the snapshot atomically to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<(), RateLimitError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        tracing::debug!(
            path = %path.display(),
            penalty_points = self.penalty_points,
            orders = self.orders.len(),
            "Rate limit state saved"
        );
        Ok(())
    }

    /// Read a snapshot from `path`.
    ///
    /// Returns `Ok(None)` if no snapshot exists. Returns `Err` only on actual I/O
    /// or parse errors.
    pub async fn load(path: &Path) -> Result<Option<Self>, RateLimitError> {
        let json = match tokio::fs::read(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: Self = serde_json::from_slice(&json)?;
        if state.version > SNAPSHOT_VERSION {
            return Err(RateLimitError::InvalidConfig(format!(
                "snapshot version {} is newer than supported version {}",
                state.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> PersistedState {
        let mut orders = BTreeMap::new();
        orders.insert("OABC".to_string(), datetime!(2024-05-01 11:59:50 UTC));
        PersistedState {
            version: SNAPSHOT_VERSION,
            credential: Some(CredentialId::from_label("desk")),
            tier: VerificationTier::Intermediate,
            penalty_points: 12.5,
            saved_at: datetime!(2024-05-01 12:00:00 UTC),
            orders,
            stats: LimiterStats {
                allowed: 42,
                ..LimiterStats::default()
            },
        }
    }

    #[test]
    fn test_snapshot_path() {
        let dir = Path::new("/var/lib/kraken");
        assert_eq!(
            snapshot_path(dir, None),
            PathBuf::from("/var/lib/kraken/rate_limit_anonymous.json")
        );
        let id = CredentialId::from_label("desk");
        assert_eq!(
            snapshot_path(dir, Some(&id)),
            PathBuf::from("/var/lib/kraken/rate_limit_desk.json")
        );
    }

    #[test]
    fn test_freshness() {
        let state = sample();
        let max_age = Duration::from_secs(3600);
        assert!(state.is_fresh(datetime!(2024-05-01 12:59:59 UTC), max_age));
        assert!(!state.is_fresh(datetime!(2024-05-01 13:00:00 UTC), max_age));
        assert_eq!(state.age(datetime!(2024-05-01 11:00:00 UTC)), Duration::ZERO);
    }

    #[test]
    fn test_timestamps_serialized_as_rfc3339() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["saved_at"], "2024-05-01T12:00:00Z");
        assert_eq!(json["orders"]["OABC"], "2024-05-01T11:59:50Z");
        assert_eq!(json["tier"], "intermediate");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(&dir.path().join("nested"), None);

        assert!(PersistedState::load(&path).await.unwrap().is_none());

        let state = sample();
        state.save(&path).await.unwrap();
        assert!(!dir.path().join("nested/rate_limit_anonymous.json.tmp").exists());

        let loaded = PersistedState::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate_limit_anonymous.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(matches!(
            PersistedState::load(&path).await,
            Err(RateLimitError::Json(_))
        ));
    }
}
