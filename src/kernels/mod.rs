//! Kernel dispatch and the cache operator surface.
//!
//! - [`registry`]: Lazily built, process-lifetime kernels keyed by (op, layout, dtype)
//! - [`ops`]: `swap_blocks`, `copy_blocks`, `reshape_and_cache*`, `convert_fp8`

pub mod ops;
pub mod registry;
