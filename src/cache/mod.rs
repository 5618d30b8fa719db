//! Paged KV cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: Block ids, storage domains, slot and block mappings
//! - [`dtype`]: Element/storage dtypes and the fp8/int8 codecs
//! - [`layout`]: Versioned physical layouts (standard, asm, flash)
//! - [`tensor`]: Typed cache and scale tensors
//! - [`store`]: Block pool with refcounts, and the block store owning contents
//! - [`table`]: Per-sequence block tables
//! - [`writer`]: Scatter of new K/V into the cache, with quantization
//! - [`migrator`]: Swap, copy, and fp8 conversion of blocks
//! - [`evictor`]: Victim selection under device memory pressure
//! - [`manager`]: Scheduler-facing coordinator

pub mod block;
pub mod dtype;
pub mod evictor;
pub mod layout;
pub mod manager;
pub mod migrator;
pub mod store;
pub mod table;
pub mod tensor;
pub mod writer;
