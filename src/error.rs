//! Error taxonomy for the paged KV cache.
//!
//! Every error is reported synchronously by the call that triggered it.
//! Nothing is retried internally; recovery (evict-then-retry and the like)
//! is a scheduler policy built on top of these primitives.

use thiserror::Error;

use crate::cache::block::{BlockId, StorageDomain};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Out of {domain} blocks: requested {requested}, {free} free")]
    OutOfMemory {
        domain: StorageDomain,
        requested: usize,
        free: usize,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Position {position} out of range (length {length})")]
    OutOfRange { position: usize, length: usize },

    #[error("Sequence overflow: {requested} tokens exceeds maximum of {max}")]
    Overflow { requested: usize, max: usize },

    #[error("Domain mismatch: {0}")]
    DomainMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported kernel: {0}")]
    Unsupported(String),
}

impl CacheError {
    /// Short, stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::OutOfMemory { .. } => "out_of_memory",
            CacheError::InvalidState(_) => "invalid_state",
            CacheError::OutOfRange { .. } => "out_of_range",
            CacheError::Overflow { .. } => "overflow",
            CacheError::DomainMismatch(_) => "domain_mismatch",
            CacheError::InvalidArgument(_) => "invalid_argument",
            CacheError::Unsupported(_) => "unsupported",
        }
    }

    pub(crate) fn double_free(block: BlockId) -> Self {
        CacheError::InvalidState(format!("block {block} is already free"))
    }
}
