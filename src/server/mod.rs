//! HTTP admin surface for a running cache.
//!
//! - [`admin_api`]: Health, cache statistics, per-sequence inspection and
//!   Prometheus metrics

pub mod admin_api;
