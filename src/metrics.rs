//! Prometheus metrics for cache operations.
//!
//! Metrics live in a registry owned by [`CacheMetrics`] rather than the
//! process-wide default, so independent caches (and tests) never share
//! counters.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::block::{StorageDomain, SwapDirection};
use crate::error::CacheError;

pub struct CacheMetrics {
    registry: Registry,
    pub blocks_allocated: IntCounter,
    pub blocks_freed: IntCounter,
    pub blocks_forked: IntCounter,
    pub blocks_copied: IntCounter,
    blocks_swapped: IntCounterVec,
    pub tokens_written: IntCounter,
    pub tokens_discarded: IntCounter,
    errors: IntCounterVec,
    free_blocks: IntGaugeVec,
    pub sequences: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let blocks_allocated =
            IntCounter::new("paged_kv_blocks_allocated_total", "Blocks handed out by allocate")?;
        let blocks_freed =
            IntCounter::new("paged_kv_blocks_freed_total", "Blocks returned to a free list")?;
        let blocks_forked =
            IntCounter::new("paged_kv_blocks_forked_total", "Copy-on-write block shares")?;
        let blocks_copied =
            IntCounter::new("paged_kv_blocks_copied_total", "Blocks copied within a domain")?;
        let blocks_swapped = IntCounterVec::new(
            Opts::new("paged_kv_blocks_swapped_total", "Blocks swapped between domains"),
            &["direction"],
        )?;
        let tokens_written =
            IntCounter::new("paged_kv_tokens_written_total", "Tokens stored by cache writes")?;
        let tokens_discarded = IntCounter::new(
            "paged_kv_tokens_discarded_total",
            "Tokens skipped by cache writes (discard slot)",
        )?;
        let errors = IntCounterVec::new(
            Opts::new("paged_kv_errors_total", "Failed cache operations"),
            &["kind"],
        )?;
        let free_blocks = IntGaugeVec::new(
            Opts::new("paged_kv_free_blocks", "Free blocks per storage domain"),
            &["domain"],
        )?;
        let sequences = IntGauge::new("paged_kv_sequences", "Sequences tracked by the manager")?;

        registry.register(Box::new(blocks_allocated.clone()))?;
        registry.register(Box::new(blocks_freed.clone()))?;
        registry.register(Box::new(blocks_forked.clone()))?;
        registry.register(Box::new(blocks_copied.clone()))?;
        registry.register(Box::new(blocks_swapped.clone()))?;
        registry.register(Box::new(tokens_written.clone()))?;
        registry.register(Box::new(tokens_discarded.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(free_blocks.clone()))?;
        registry.register(Box::new(sequences.clone()))?;

        Ok(Self {
            registry,
            blocks_allocated,
            blocks_freed,
            blocks_forked,
            blocks_copied,
            blocks_swapped,
            tokens_written,
            tokens_discarded,
            errors,
            free_blocks,
            sequences,
        })
    }

    pub fn record_swap(&self, direction: SwapDirection, blocks: usize) {
        let label = match direction {
            SwapDirection::DeviceToHost => "out",
            SwapDirection::HostToDevice => "in",
        };
        self.blocks_swapped
            .with_label_values(&[label])
            .inc_by(blocks as u64);
    }

    pub fn swapped(&self, direction: SwapDirection) -> u64 {
        let label = match direction {
            SwapDirection::DeviceToHost => "out",
            SwapDirection::HostToDevice => "in",
        };
        self.blocks_swapped.with_label_values(&[label]).get()
    }

    pub fn record_error(&self, err: &CacheError) {
        self.errors.with_label_values(&[err.kind()]).inc();
    }

    pub fn errors(&self, kind: &str) -> u64 {
        self.errors.with_label_values(&[kind]).get()
    }

    pub fn set_free_blocks(&self, domain: StorageDomain, free: usize) {
        let label = domain.to_string();
        self.free_blocks
            .with_label_values(&[label.as_str()])
            .set(free as i64);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("blocks_allocated", &self.blocks_allocated.get())
            .field("blocks_freed", &self.blocks_freed.get())
            .field("sequences", &self.sequences.get())
            .finish_non_exhaustive()
    }
}
