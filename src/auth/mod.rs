//! Credential identity.
//!
//! Signing requests is the transport layer's job. The limiter only needs to know
//! which API key a budget belongs to.

mod credentials;

pub use credentials::{CredentialId, Credentials};
