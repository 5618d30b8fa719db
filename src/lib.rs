//! paged-kv-cache: a paged key/value cache for transformer attention.
//!
//! The cache is a pool of fixed-size blocks addressed through per-sequence
//! block tables:
//!   BlockStore (blocks + refcounts) ← BlockTable (position → slot)
//!   CacheWriter (scatter + quantize) → BlockStore
//!   BlockMigrator (swap device↔host, copy, fp8 convert)
//!
//! [`cache::manager::CacheManager`] ties these together for a scheduler and
//! [`kernels::ops`] exposes the classic operator surface.

pub mod cache;
pub mod config;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod simulation;

pub use error::{CacheError, Result};
