//! Common types used across the rate limiter.

pub mod common;

pub use common::*;
