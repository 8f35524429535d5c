//! Endpoint descriptors and lookup.
//!
//! Every outgoing call is priced from its [`EndpointDescriptor`]: which category's
//! bucket and window it draws from, how many tokens it consumes, how many penalty
//! points it adds and whether order age adds a surcharge.
//!
//! # Example
//!
//! ```rust
//! use kraken_rate_limiter::endpoints::{self, ResolvedEndpoint};
//!
//! let cancel = endpoints::resolve("/0/private/CancelOrder");
//! assert!(cancel.is_known());
//! assert!(cancel.descriptor().has_age_penalty());
//!
//! let unknown = endpoints::resolve("SomethingNew");
//! assert!(matches!(unknown, ResolvedEndpoint::Fallback(_)));
//! ```

use std::borrow::Cow;

use serde::Serialize;

use crate::rate_limit::AgePenaltyKind;
use crate::types::EndpointCategory;

pub mod catalog;

pub use catalog::{private, public, ENDPOINTS};

/// Static rate limit description of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointDescriptor {
    /// Endpoint name without path prefix (e.g. `CancelOrder`)
    pub name: Cow<'static, str>,
    /// Category whose bucket and window the endpoint draws from
    pub category: EndpointCategory,
    /// Tokens consumed per call
    pub weight: u32,
    /// Penalty points added per call, before any age surcharge
    pub base_penalty_points: f64,
    /// Advertised per-endpoint ceiling
    pub max_requests_per_minute: u32,
    /// Whether the endpoint needs an API key
    pub requires_auth: bool,
    /// Whether the endpoint places or modifies orders
    pub is_trading_endpoint: bool,
    /// Age surcharge schedule, for endpoints that modify an existing order
    pub age_penalty: Option<AgePenaltyKind>,
}

impl EndpointDescriptor {
    /// Check if calls to this endpoint are surcharged by order age.
    pub fn has_age_penalty(&self) -> bool {
        self.age_penalty.is_some()
    }
}

/// Result of an endpoint lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedEndpoint {
    /// Found in the catalog.
    Known(&'static EndpointDescriptor),
    /// Not in the catalog; priced with the conservative private default.
    Fallback(EndpointDescriptor),
}

impl ResolvedEndpoint {
    /// The descriptor to price the call with.
    pub fn descriptor(&self) -> &EndpointDescriptor {
        match self {
            ResolvedEndpoint::Known(descriptor) => descriptor,
            ResolvedEndpoint::Fallback(descriptor) => descriptor,
        }
    }

    /// Check if the endpoint was found in the catalog.
    pub fn is_known(&self) -> bool {
        matches!(self, ResolvedEndpoint::Known(_))
    }
}

/// Strip a REST path prefix, leaving the bare endpoint name.
pub fn endpoint_name(endpoint: &str) -> &str {
    endpoint
        .strip_prefix(catalog::PRIVATE_PREFIX)
        .or_else(|| endpoint.strip_prefix(catalog::PUBLIC_PREFIX))
        .unwrap_or(endpoint)
}

/// Look up an endpoint by name (`"CancelOrder"`) or path (`"/0/private/CancelOrder"`).
///
/// Unknown names resolve to [`ResolvedEndpoint::Fallback`] and log a warning.
pub fn resolve(endpoint: &str) -> ResolvedEndpoint {
    let name = endpoint_name(endpoint);
    match ENDPOINTS.iter().find(|d| d.name == name) {
        Some(descriptor) => ResolvedEndpoint::Known(descriptor),
        None => {
            tracing::warn!(
                endpoint = %endpoint,
                "Unknown endpoint, applying conservative private defaults"
            );
            ResolvedEndpoint::Fallback(catalog::fallback(name))
        }
    }
}
