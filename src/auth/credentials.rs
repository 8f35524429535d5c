//! Credential identity for keying rate limit state.
//!
//! Kraken tracks the penalty budget per API key, so persisted limiter state has to
//! be keyed by the key it was accumulated under. The key itself never reaches the
//! disk: state files are named after a SHA-256 fingerprint of it.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// API credentials containing the key and secret.
///
/// The limiter only needs the key's identity; the secret is carried so callers can
/// hand over the same value they give their transport layer.
#[derive(Clone)]
pub struct Credentials {
    /// The API key (public identifier)
    pub api_key: String,
    /// The API secret (private, used for signing by the transport layer)
    api_secret: SecretString,
}

impl Credentials {
    /// Create new credentials from an API key and secret.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
        }
    }

    /// Try to read credentials from `KRAKEN_API_KEY` and `KRAKEN_API_SECRET`.
    ///
    /// Returns `None` if either variable is not set.
    pub fn try_from_env() -> Option<Self> {
        Self::try_from_env_vars("KRAKEN_API_KEY", "KRAKEN_API_SECRET")
    }

    /// Try to read credentials from custom environment variable names.
    pub fn try_from_env_vars(key_var: &str, secret_var: &str) -> Option<Self> {
        let api_key = std::env::var(key_var).ok()?;
        let api_secret = std::env::var(secret_var).ok()?;
        Some(Self::new(api_key, api_secret))
    }

    /// Get the API secret.
    ///
    /// This method exposes the secret - use carefully.
    pub fn expose_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }

    /// Fingerprint identifying these credentials.
    pub fn id(&self) -> CredentialId {
        CredentialId::from_api_key(&self.api_key)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Stable, filesystem-safe fingerprint of an API key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Number of base64 characters kept from the digest.
    const LEN: usize = 22;

    /// Fingerprint an API key.
    pub fn from_api_key(api_key: &str) -> Self {
        let digest = Sha256::digest(api_key.as_bytes());
        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(Self::LEN);
        Self(encoded)
    }

    /// Use an already-safe identifier as-is (for example an account label).
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced with `_`.
    pub fn from_label(label: &str) -> Self {
        Self(
            label
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
        )
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
