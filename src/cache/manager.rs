//! Cache manager: the scheduler-facing coordinator.
//!
//! The manager is the central owner of the paged KV cache. It:
//! - Owns the device and host block stores
//! - Keeps one block table per sequence and knows where each sequence lives
//! - Applies copy-on-write before appending to a forked sequence, and only
//!   lets a sequence write its own reserved, unshared slots
//! - Swaps whole sequences between device and host under memory pressure
//! - Keeps the Prometheus counters and gauges current
//!
//! Everything here is synchronous; there is exactly one scheduling authority.
//! For sharing with the admin server the manager sits behind a tokio `RwLock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::block::{BlockId, BlockMapping, SlotMapping, StorageDomain, SwapDirection};
use crate::cache::dtype::{Element, KvCacheDtype, StorageDtype};
use crate::cache::evictor::{Evictor, SequenceUsage};
use crate::cache::layout::CacheLayout;
use crate::cache::migrator::{BlockMigrator, MigrationStats};
use crate::cache::store::{BlockPool, BlockStore};
use crate::cache::table::BlockTable;
use crate::cache::writer::{CacheWriter, WriteRequest, WriteScales, WriteSummary};
use crate::config::{CacheConfig, EvictionConfig};
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;

pub type SequenceId = u64;

#[derive(Debug, Clone)]
struct SequenceState {
    table: BlockTable,
    residency: StorageDomain,
    last_access: Instant,
}

/// Usage of one block pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub allocated: usize,
    pub total_refcount: u64,
}

impl PoolStats {
    fn of(store: &BlockStore) -> Self {
        let pool = store.pool();
        Self {
            capacity: pool.capacity(),
            free: pool.free_count(),
            allocated: pool.allocated_count(),
            total_refcount: pool.total_refcount(),
        }
    }
}

/// Snapshot served by `/v1/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub device: PoolStats,
    pub host: PoolStats,
    pub sequences: usize,
    pub device_resident: usize,
    pub host_resident: usize,
    pub block_size: usize,
    pub storage_dtype: StorageDtype,
    pub layout: String,
    pub migration: MigrationStats,
}

pub struct CacheManager {
    device: BlockStore,
    host: BlockStore,
    sequences: HashMap<SequenceId, SequenceState>,
    next_sequence_id: SequenceId,
    writer: CacheWriter,
    migrator: BlockMigrator,
    evictor: Evictor,
    metrics: Arc<CacheMetrics>,
    kv_cache_dtype: KvCacheDtype,
    max_seq_len: usize,
}

impl CacheManager {
    pub fn new(
        config: &CacheConfig,
        eviction: EvictionConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let device = BlockStore::new(config.store_spec(StorageDomain::Device))?;
        let host = BlockStore::new(config.store_spec(StorageDomain::Host))?;

        info!(
            device_blocks = config.num_device_blocks,
            host_blocks = config.num_host_blocks,
            block_size = config.block_size,
            dtype = %config.storage_dtype(),
            layout = %config.layout,
            "Cache manager ready"
        );

        let manager = Self {
            device,
            host,
            sequences: HashMap::new(),
            next_sequence_id: 0,
            writer: CacheWriter::for_layout(config.layout),
            migrator: BlockMigrator::new(),
            evictor: Evictor::new(eviction),
            metrics,
            kv_cache_dtype: config.cache_dtype,
            max_seq_len: config.max_seq_len,
        };
        manager.refresh_gauges();
        Ok(manager)
    }

    pub fn device(&self) -> &BlockStore {
        &self.device
    }

    pub fn host(&self) -> &BlockStore {
        &self.host
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn layout(&self) -> CacheLayout {
        self.writer.layout()
    }

    /// Register a new, empty sequence.
    pub fn add_sequence(&mut self) -> SequenceId {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        self.sequences.insert(
            id,
            SequenceState {
                table: BlockTable::new(self.device.block_size(), self.max_seq_len),
                residency: StorageDomain::Device,
                last_access: Instant::now(),
            },
        );
        self.refresh_gauges();
        debug!(sequence = id, "Added sequence");
        id
    }

    pub fn contains(&self, seq: SequenceId) -> bool {
        self.sequences.contains_key(&seq)
    }

    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        let mut ids: Vec<_> = self.sequences.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn block_table(&self, seq: SequenceId) -> Result<&BlockTable> {
        Ok(&self.state(seq)?.table)
    }

    pub fn residency(&self, seq: SequenceId) -> Result<StorageDomain> {
        Ok(self.state(seq)?.residency)
    }

    /// Device blocks `reserve(seq, n)` would take from the free list.
    pub fn blocks_to_reserve(&self, seq: SequenceId, n: usize) -> Result<usize> {
        let state = self.state(seq)?;
        let cow = n > 0 && state.table.needs_copy_on_write(&self.device)?;
        Ok(state.table.blocks_needed(n) + usize::from(cow))
    }

    /// Make room for `n` more tokens of `seq` and return their slots.
    ///
    /// Applies copy-on-write first if the partially filled last block is
    /// shared. Fails with `OutOfMemory` when the device pool is short; the
    /// caller decides whether to evict and retry.
    pub fn reserve(&mut self, seq: SequenceId, n: usize) -> Result<SlotMapping> {
        let result = self.reserve_inner(seq, n);
        self.observe(result)
    }

    fn reserve_inner(&mut self, seq: SequenceId, n: usize) -> Result<SlotMapping> {
        let max_seq_len = self.max_seq_len;
        let state = self
            .sequences
            .get_mut(&seq)
            .ok_or_else(|| unknown_sequence(seq))?;
        if state.residency != StorageDomain::Device {
            return Err(CacheError::InvalidState(format!(
                "sequence {seq} is swapped out to {}",
                state.residency
            )));
        }
        state.last_access = Instant::now();
        if n == 0 {
            return Ok(SlotMapping::default());
        }

        let start = state.table.len();
        if start + n > max_seq_len {
            return Err(CacheError::Overflow {
                requested: start + n,
                max: max_seq_len,
            });
        }
        let needed = state.table.blocks_needed(n);
        let cow = state.table.needs_copy_on_write(&self.device)?;
        let free = self.device.pool().free_count();
        if needed + usize::from(cow) > free {
            return Err(CacheError::OutOfMemory {
                domain: StorageDomain::Device,
                requested: needed + usize::from(cow),
                free,
            });
        }

        if let Some((shared, fresh)) = state.table.prepare_append(&mut self.device)? {
            self.migrator
                .copy(&mut self.device, &BlockMapping::new(vec![(shared, fresh)])?)?;
            self.metrics.blocks_allocated.inc();
            self.metrics.blocks_copied.inc();
        }

        let fresh = self.device.allocate(needed)?;
        self.metrics.blocks_allocated.inc_by(needed as u64);
        if let Err(e) = state.table.append(&fresh) {
            for id in fresh {
                self.device.free(id)?;
            }
            return Err(e);
        }
        state.table.advance(n)?;
        state.table.slot_mapping(start..start + n)
    }

    /// Store new K/V for `seq` in one layer at the given slots.
    pub fn write<T: Element>(
        &mut self,
        seq: SequenceId,
        layer: usize,
        key: &[T],
        value: &[T],
        slot_mapping: &SlotMapping,
        scales: WriteScales,
    ) -> Result<WriteSummary> {
        let result = self.write_inner(seq, layer, key, value, slot_mapping, scales);
        self.observe(result)
    }

    fn write_inner<T: Element>(
        &mut self,
        seq: SequenceId,
        layer: usize,
        key: &[T],
        value: &[T],
        slot_mapping: &SlotMapping,
        scales: WriteScales,
    ) -> Result<WriteSummary> {
        let state = self
            .sequences
            .get_mut(&seq)
            .ok_or_else(|| unknown_sequence(seq))?;
        if state.residency != StorageDomain::Device {
            return Err(CacheError::DomainMismatch(format!(
                "sequence {seq} lives in {} storage, writes go to device",
                state.residency
            )));
        }
        state.last_access = Instant::now();
        check_owned_slots(seq, &state.table, self.device.pool(), slot_mapping)?;

        let request = WriteRequest {
            key,
            value,
            slot_mapping,
            kv_cache_dtype: self.kv_cache_dtype,
            scales,
        };
        let summary = self.writer.write(self.device.layer_mut(layer)?, &request)?;
        self.metrics.tokens_written.inc_by(summary.written as u64);
        self.metrics.tokens_discarded.inc_by(summary.discarded as u64);
        Ok(summary)
    }

    /// Dequantized K/V of one token, looked up through the block table.
    pub fn read_token(
        &self,
        seq: SequenceId,
        layer: usize,
        position: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let state = self.state(seq)?;
        let slot = state.table.slot_for(position)?;
        self.store(state.residency).layer(layer)?.read_token(slot)
    }

    /// Branch `parent` into a new sequence sharing every block.
    pub fn fork_sequence(&mut self, parent: SequenceId) -> Result<SequenceId> {
        let result = self.fork_inner(parent);
        self.observe(result)
    }

    fn fork_inner(&mut self, parent: SequenceId) -> Result<SequenceId> {
        let state = self
            .sequences
            .get(&parent)
            .ok_or_else(|| unknown_sequence(parent))?;
        let residency = state.residency;
        let store = match residency {
            StorageDomain::Device => &mut self.device,
            StorageDomain::Host => &mut self.host,
        };
        let table = state.table.fork(store)?;
        self.metrics.blocks_forked.inc_by(table.num_blocks() as u64);

        let child = self.next_sequence_id;
        self.next_sequence_id += 1;
        self.sequences.insert(
            child,
            SequenceState {
                table,
                residency,
                last_access: Instant::now(),
            },
        );
        debug!(parent, child, "Forked sequence");
        Ok(child)
    }

    /// Roll `seq` back to `new_len` tokens, releasing blocks no longer used.
    pub fn truncate(&mut self, seq: SequenceId, new_len: usize) -> Result<Vec<BlockId>> {
        let result = self.truncate_inner(seq, new_len);
        self.observe(result)
    }

    fn truncate_inner(&mut self, seq: SequenceId, new_len: usize) -> Result<Vec<BlockId>> {
        let state = self
            .sequences
            .get_mut(&seq)
            .ok_or_else(|| unknown_sequence(seq))?;
        let store = match state.residency {
            StorageDomain::Device => &mut self.device,
            StorageDomain::Host => &mut self.host,
        };
        let before = store.pool().free_count();
        let removed = state.table.truncate(new_len, store)?;
        self.metrics
            .blocks_freed
            .inc_by((store.pool().free_count() - before) as u64);
        state.last_access = Instant::now();
        Ok(removed)
    }

    /// Drop a finished sequence and its block references.
    pub fn free_sequence(&mut self, seq: SequenceId) -> Result<()> {
        let result = self.free_inner(seq);
        self.observe(result)
    }

    fn free_inner(&mut self, seq: SequenceId) -> Result<()> {
        let mut state = self
            .sequences
            .remove(&seq)
            .ok_or_else(|| unknown_sequence(seq))?;
        let store = match state.residency {
            StorageDomain::Device => &mut self.device,
            StorageDomain::Host => &mut self.host,
        };
        let before = store.pool().free_count();
        state.table.release(store)?;
        self.metrics
            .blocks_freed
            .inc_by((store.pool().free_count() - before) as u64);
        debug!(sequence = seq, "Freed sequence");
        Ok(())
    }

    /// Move every block of `seq` from device to host memory.
    pub fn swap_out(&mut self, seq: SequenceId) -> Result<usize> {
        let result = self.swap_inner(seq, SwapDirection::DeviceToHost);
        self.observe(result)
    }

    /// Bring a swapped-out sequence back to device memory.
    pub fn swap_in(&mut self, seq: SequenceId) -> Result<usize> {
        let result = self.swap_inner(seq, SwapDirection::HostToDevice);
        self.observe(result)
    }

    fn swap_inner(&mut self, seq: SequenceId, direction: SwapDirection) -> Result<usize> {
        let (from, to) = direction.domains();
        let state = self
            .sequences
            .get_mut(&seq)
            .ok_or_else(|| unknown_sequence(seq))?;
        if state.residency != from {
            return Err(CacheError::InvalidState(format!(
                "sequence {seq} is already in {} storage",
                state.residency
            )));
        }

        let (src, dst) = match direction {
            SwapDirection::DeviceToHost => (&mut self.device, &mut self.host),
            SwapDirection::HostToDevice => (&mut self.host, &mut self.device),
        };
        let blocks = state.table.blocks().to_vec();
        for &id in &blocks {
            if src.pool().is_shared(id)? {
                return Err(CacheError::InvalidState(format!(
                    "sequence {seq} shares block {id}; swap needs exclusive ownership"
                )));
            }
        }

        let fresh = dst.allocate(blocks.len())?;
        let mapping = BlockMapping::new(blocks.iter().copied().zip(fresh.iter().copied()).collect())?;
        if let Err(e) = self.migrator.swap(src, dst, &mapping, direction) {
            for id in fresh {
                dst.free(id)?;
            }
            return Err(e);
        }
        for &id in &blocks {
            src.free(id)?;
        }

        state.table.remap(fresh);
        state.residency = to;
        state.last_access = Instant::now();
        self.metrics.record_swap(direction, blocks.len());
        self.metrics.blocks_allocated.inc_by(blocks.len() as u64);
        self.metrics.blocks_freed.inc_by(blocks.len() as u64);
        debug!(sequence = seq, ?direction, blocks = blocks.len(), "Swapped sequence");
        Ok(blocks.len())
    }

    /// Swap out victims until the device pool has `blocks_needed` free blocks.
    ///
    /// `requester` is never chosen. Returns the evicted sequences; fails with
    /// `OutOfMemory` if not enough sequences could be moved.
    pub fn evict_for(
        &mut self,
        blocks_needed: usize,
        requester: Option<SequenceId>,
    ) -> Result<Vec<SequenceId>> {
        let result = self.evict_inner(blocks_needed, requester);
        self.observe(result)
    }

    fn evict_inner(
        &mut self,
        blocks_needed: usize,
        requester: Option<SequenceId>,
    ) -> Result<Vec<SequenceId>> {
        let free = self.device.pool().free_count();
        if free >= blocks_needed {
            return Ok(Vec::new());
        }

        let pool = self.device.pool();
        let usages: Vec<SequenceUsage> = self
            .sequences
            .iter()
            .filter(|(_, s)| s.residency == StorageDomain::Device)
            .filter(|(_, s)| {
                s.table
                    .blocks()
                    .iter()
                    .all(|&id| pool.refcount(id).map(|rc| rc == 1).unwrap_or(false))
            })
            .map(|(&id, s)| SequenceUsage {
                sequence_id: id,
                last_access: s.last_access,
                device_blocks: s.table.num_blocks(),
            })
            .collect();
        let protected: Vec<SequenceId> = requester.into_iter().collect();
        let victims = self.evictor.select_victims(
            usages.into_iter(),
            blocks_needed - free,
            &protected,
            Instant::now(),
        );

        let mut evicted = Vec::new();
        for victim in victims {
            if self.device.pool().free_count() >= blocks_needed {
                break;
            }
            match self.swap_inner(victim.sequence_id, SwapDirection::DeviceToHost) {
                Ok(_) => evicted.push(victim.sequence_id),
                // Host pool exhausted: nothing more can be moved.
                Err(CacheError::OutOfMemory { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        let free = self.device.pool().free_count();
        if free < blocks_needed {
            return Err(CacheError::OutOfMemory {
                domain: StorageDomain::Device,
                requested: blocks_needed,
                free,
            });
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), free, "Eviction round complete");
        }
        Ok(evicted)
    }

    /// Start a new scale generation on both stores (all blocks must be free).
    pub fn begin_generation(&mut self) -> Result<()> {
        let result = self
            .device
            .begin_generation()
            .and_then(|_| self.host.begin_generation());
        self.observe(result)
    }

    pub fn stats(&self) -> CacheStats {
        let device_resident = self
            .sequences
            .values()
            .filter(|s| s.residency == StorageDomain::Device)
            .count();
        CacheStats {
            device: PoolStats::of(&self.device),
            host: PoolStats::of(&self.host),
            sequences: self.sequences.len(),
            device_resident,
            host_resident: self.sequences.len() - device_resident,
            block_size: self.device.block_size(),
            storage_dtype: self.device.spec().dtype,
            layout: self.layout().to_string(),
            migration: *self.migrator.stats(),
        }
    }

    fn state(&self, seq: SequenceId) -> Result<&SequenceState> {
        self.sequences.get(&seq).ok_or_else(|| unknown_sequence(seq))
    }

    fn store(&self, domain: StorageDomain) -> &BlockStore {
        match domain {
            StorageDomain::Device => &self.device,
            StorageDomain::Host => &self.host,
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e);
            debug!(error = %e, kind = e.kind(), "Cache operation failed");
        }
        self.refresh_gauges();
        result
    }

    fn refresh_gauges(&self) {
        self.metrics
            .set_free_blocks(StorageDomain::Device, self.device.pool().free_count());
        self.metrics
            .set_free_blocks(StorageDomain::Host, self.host.pool().free_count());
        self.metrics.sequences.set(self.sequences.len() as i64);
    }
}

/// Every stored slot must hold one of `seq`'s reserved tokens, in a block no
/// other table shares. Copy-on-write happens in `reserve`, never here.
fn check_owned_slots(
    seq: SequenceId,
    table: &BlockTable,
    pool: &BlockPool,
    slot_mapping: &SlotMapping,
) -> Result<()> {
    let block_size = table.block_size();
    for slot in (0..slot_mapping.len()).filter_map(|i| slot_mapping.get(i)) {
        let (physical, offset) = (slot / block_size, slot % block_size);
        let owned = table
            .blocks()
            .iter()
            .position(|&id| id as usize == physical)
            .filter(|idx| idx * block_size + offset < table.len());
        let Some(idx) = owned else {
            return Err(CacheError::InvalidArgument(format!(
                "slot {slot} is not a reserved position of sequence {seq}"
            )));
        };
        let block = table.blocks()[idx];
        if pool.is_shared(block)? {
            return Err(CacheError::InvalidState(format!(
                "slot {slot} lies in block {block}, still shared with another sequence"
            )));
        }
    }
    Ok(())
}

fn unknown_sequence(seq: SequenceId) -> CacheError {
    CacheError::InvalidArgument(format!("unknown sequence {seq}"))
}

/// Thread-safe wrapper around the manager.
pub type SharedCacheManager = Arc<RwLock<CacheManager>>;

/// Create a new thread-safe manager.
pub fn new_shared_manager(
    config: &CacheConfig,
    eviction: EvictionConfig,
    metrics: Arc<CacheMetrics>,
) -> Result<SharedCacheManager> {
    Ok(Arc::new(RwLock::new(CacheManager::new(
        config, eviction, metrics,
    )?)))
}
