//! Capability-keyed kernel registry.
//!
//! A kernel is resolved for an `(operation, layout, dtype)` key the first
//! time that key is used and cached for the life of the process. Concurrent
//! first use of one key builds it exactly once (the map is guarded by a
//! mutex held across the build).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::cache::dtype::StorageDtype;
use crate::cache::layout::{CacheLayout, LayoutDescriptor};
use crate::cache::writer::CacheWriter;
use crate::error::{CacheError, Result};

/// Operator names of the cache module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOp {
    SwapBlocks,
    CopyBlocks,
    ReshapeAndCache,
    ReshapeAndCacheFlash,
    ReshapeAndCacheWithPertokenQuant,
    ConvertFp8,
}

impl CacheOp {
    pub fn name(&self) -> &'static str {
        match self {
            CacheOp::SwapBlocks => "swap_blocks",
            CacheOp::CopyBlocks => "copy_blocks",
            CacheOp::ReshapeAndCache => "reshape_and_cache",
            CacheOp::ReshapeAndCacheFlash => "reshape_and_cache_flash",
            CacheOp::ReshapeAndCacheWithPertokenQuant => "reshape_and_cache_with_pertoken_quant",
            CacheOp::ConvertFp8 => "convert_fp8",
        }
    }

    fn writes_cache(&self) -> bool {
        matches!(
            self,
            CacheOp::ReshapeAndCache
                | CacheOp::ReshapeAndCacheFlash
                | CacheOp::ReshapeAndCacheWithPertokenQuant
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct KernelKey {
    pub op: CacheOp,
    pub layout: CacheLayout,
    pub dtype: StorageDtype,
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}, {}]", self.op.name(), self.layout, self.dtype)
    }
}

/// A resolved implementation for one key.
#[derive(Debug)]
pub struct CacheKernel {
    key: KernelKey,
    descriptor: &'static dyn LayoutDescriptor,
    writer: Option<CacheWriter>,
    built_at: Instant,
    invocations: AtomicU64,
}

impl CacheKernel {
    fn build(key: KernelKey) -> Result<Self> {
        let unsupported = |why: &str| Err(CacheError::Unsupported(format!("{key}: {why}")));
        match key.op {
            CacheOp::ReshapeAndCache if key.layout == CacheLayout::Flash => {
                return unsupported("flash caches are written by reshape_and_cache_flash")
            }
            CacheOp::ReshapeAndCacheFlash if key.layout != CacheLayout::Flash => {
                return unsupported("needs a flash layout cache")
            }
            CacheOp::ReshapeAndCacheWithPertokenQuant if !key.dtype.is_quantized() => {
                return unsupported("per-token quantization needs an fp8/int8 cache")
            }
            CacheOp::ReshapeAndCacheWithPertokenQuant if key.layout == CacheLayout::Flash => {
                return unsupported("per-token quantization supports standard and asm layouts")
            }
            _ => {}
        }

        Ok(Self {
            key,
            descriptor: key.layout.descriptor(),
            writer: key
                .op
                .writes_cache()
                .then(|| CacheWriter::for_layout(key.layout)),
            built_at: Instant::now(),
            invocations: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> KernelKey {
        self.key
    }

    pub fn descriptor(&self) -> &'static dyn LayoutDescriptor {
        self.descriptor
    }

    pub fn writer(&self) -> Result<&CacheWriter> {
        self.writer
            .as_ref()
            .ok_or_else(|| CacheError::Unsupported(format!("{} does not write the cache", self.key)))
    }

    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }
}

/// One row of [`KernelRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct KernelInfo {
    pub key: KernelKey,
    pub name: String,
    pub layout_version: u32,
    pub invocations: u64,
    pub age_secs: f64,
}

#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: Mutex<HashMap<KernelKey, Arc<CacheKernel>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by the operator functions.
    pub fn global() -> &'static KernelRegistry {
        static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();
        REGISTRY.get_or_init(KernelRegistry::new)
    }

    /// Look up the kernel for `key`, building it on first use.
    pub fn resolve(&self, key: KernelKey) -> Result<Arc<CacheKernel>> {
        let mut kernels = self.kernels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(kernel) = kernels.get(&key) {
            return Ok(kernel.clone());
        }
        let kernel = Arc::new(CacheKernel::build(key)?);
        kernels.insert(key, kernel.clone());
        info!(kernel = %key, "Resolved cache kernel");
        Ok(kernel)
    }

    pub fn len(&self) -> usize {
        self.kernels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<KernelInfo> {
        let kernels = self.kernels.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<KernelInfo> = kernels
            .values()
            .map(|k| KernelInfo {
                key: k.key,
                name: k.key.to_string(),
                layout_version: k.descriptor.version(),
                invocations: k.invocations(),
                age_secs: k.age().as_secs_f64(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}
