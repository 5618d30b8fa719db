//! Block pool and the block store that owns cache contents.
//!
//! The pool is a free list plus a reference count per block:
//!
//! ```text
//! FREE --allocate--> ALLOCATED(1) --fork--> ALLOCATED(n>1)
//!   ^                     |                      |
//!   +------free (rc→0)----+<--------free---------+
//! ```
//!
//! Allocation pops from the free list in O(count) and never compacts.
//! allocate/free/fork never touch tensor data.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::block::{BlockId, StorageDomain};
use crate::cache::dtype::StorageDtype;
use crate::cache::layout::{CacheGeometry, CacheLayout, CacheRole};
use crate::cache::tensor::{CacheTensor, ScaleTensor};
use crate::error::{CacheError, Result};

/// Lifecycle state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Free,
    Allocated { refcount: u32 },
}

/// Free-list allocator with copy-on-write reference counts.
#[derive(Debug, Clone)]
pub struct BlockPool {
    domain: StorageDomain,
    refcounts: Vec<u32>,
    free_list: VecDeque<BlockId>,
}

impl BlockPool {
    /// A pool of `num_blocks` free blocks. Every id must fit in a [`BlockId`].
    pub fn new(domain: StorageDomain, num_blocks: usize) -> Result<Self> {
        let last = BlockId::try_from(num_blocks).map_err(|_| {
            CacheError::InvalidArgument(format!(
                "{num_blocks} blocks exceed the block id range (max {})",
                BlockId::MAX
            ))
        })?;
        Ok(Self {
            domain,
            refcounts: vec![0; num_blocks],
            free_list: (0..last).collect(),
        })
    }

    pub fn domain(&self) -> StorageDomain {
        self.domain
    }

    /// Take `count` free blocks, each with refcount 1.
    ///
    /// Either all `count` blocks are handed out or none are.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if count > self.free_list.len() {
            return Err(CacheError::OutOfMemory {
                domain: self.domain,
                requested: count,
                free: self.free_list.len(),
            });
        }

        let blocks: Vec<BlockId> = self.free_list.drain(..count).collect();
        for &id in &blocks {
            debug_assert_eq!(self.refcounts[id as usize], 0);
            self.refcounts[id as usize] = 1;
        }

        debug!(
            domain = %self.domain,
            count,
            free = self.free_list.len(),
            "Allocated blocks"
        );
        Ok(blocks)
    }

    /// Drop one reference. Returns `true` when the block went back to the free list.
    pub fn free(&mut self, id: BlockId) -> Result<bool> {
        self.check(id)?;
        let rc = &mut self.refcounts[id as usize];
        if *rc == 0 {
            return Err(CacheError::double_free(id));
        }
        *rc -= 1;
        if *rc == 0 {
            self.free_list.push_back(id);
            debug!(domain = %self.domain, block = id, "Freed block");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Share `id` with one more owner and return the same id.
    pub fn fork(&mut self, id: BlockId) -> Result<BlockId> {
        self.check(id)?;
        let rc = &mut self.refcounts[id as usize];
        if *rc == 0 {
            return Err(CacheError::InvalidState(format!(
                "cannot fork free block {id}"
            )));
        }
        *rc += 1;
        debug!(domain = %self.domain, block = id, refcount = *rc, "Forked block");
        Ok(id)
    }

    pub fn refcount(&self, id: BlockId) -> Result<u32> {
        self.check(id)?;
        Ok(self.refcounts[id as usize])
    }

    pub fn state(&self, id: BlockId) -> Result<BlockState> {
        Ok(match self.refcount(id)? {
            0 => BlockState::Free,
            refcount => BlockState::Allocated { refcount },
        })
    }

    pub fn is_shared(&self, id: BlockId) -> Result<bool> {
        Ok(self.refcount(id)? > 1)
    }

    pub fn capacity(&self) -> usize {
        self.refcounts.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// Sum of all reference counts (number of live block handles).
    pub fn total_refcount(&self) -> u64 {
        self.refcounts.iter().map(|&rc| rc as u64).sum()
    }

    fn check(&self, id: BlockId) -> Result<()> {
        if id as usize >= self.refcounts.len() {
            return Err(CacheError::OutOfRange {
                position: id as usize,
                length: self.refcounts.len(),
            });
        }
        Ok(())
    }
}

/// How quantized values of a layer are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScaleMode {
    /// Nothing quantized written yet in this generation.
    Unset,
    /// One scalar per tensor.
    PerTensor { k_scale: f32, v_scale: f32 },
    /// One scale per (head, slot), stored in the layer's scale tensors.
    PerToken,
}

/// Key/value tensors of one layer plus their dequantization scales.
#[derive(Debug, Clone)]
pub struct LayerCache {
    pub key: CacheTensor,
    pub value: CacheTensor,
    pub k_scales: ScaleTensor,
    pub v_scales: ScaleTensor,
    scale_mode: ScaleMode,
}

impl LayerCache {
    pub fn new(
        domain: StorageDomain,
        dtype: StorageDtype,
        layout: CacheLayout,
        geometry: CacheGeometry,
    ) -> Result<Self> {
        // Per-token scale storage only exists for quantized caches.
        let scale_geometry = if dtype.is_quantized() {
            geometry
        } else {
            CacheGeometry {
                num_blocks: 0,
                ..geometry
            }
        };
        Ok(Self {
            key: CacheTensor::new(CacheRole::Key, domain, dtype, layout, geometry)?,
            value: CacheTensor::new(CacheRole::Value, domain, dtype, layout, geometry)?,
            k_scales: ScaleTensor::for_geometry(&scale_geometry),
            v_scales: ScaleTensor::for_geometry(&scale_geometry),
            scale_mode: ScaleMode::Unset,
        })
    }

    pub fn scale_mode(&self) -> ScaleMode {
        self.scale_mode
    }

    pub fn dtype(&self) -> StorageDtype {
        self.key.dtype()
    }

    /// Record the scale mode a write is about to use.
    ///
    /// Quantized values must be read back with the scales they were written
    /// with, so a layer keeps one mode per cache generation.
    pub fn bind_scales(&mut self, mode: ScaleMode) -> Result<()> {
        if !self.dtype().is_quantized() {
            return Ok(());
        }
        match (self.scale_mode, mode) {
            (ScaleMode::Unset, _) => {
                self.scale_mode = mode;
                Ok(())
            }
            (current, requested) if current == requested => Ok(()),
            (current, requested) => Err(CacheError::InvalidState(format!(
                "layer scales already bound to {current:?}, write requested {requested:?}"
            ))),
        }
    }

    pub(crate) fn reset_scales(&mut self) {
        self.scale_mode = ScaleMode::Unset;
    }

    /// Dequantization scales for (head, slot).
    pub fn scales_at(&self, head: usize, slot: usize) -> (f32, f32) {
        match self.scale_mode {
            ScaleMode::PerTensor { k_scale, v_scale } if self.dtype().is_quantized() => {
                (k_scale, v_scale)
            }
            ScaleMode::PerToken => (self.k_scales.get(head, slot), self.v_scales.get(head, slot)),
            _ => (1.0, 1.0),
        }
    }

    /// Read back one token's key and value, `[num_kv_heads * head_dim]` each,
    /// dequantized with the layer's scales.
    pub fn read_token(&self, slot: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        let g = *self.key.geometry();
        if slot >= g.num_slots() {
            return Err(CacheError::OutOfRange {
                position: slot,
                length: g.num_slots(),
            });
        }
        let block = (slot / g.block_size) as BlockId;
        let offset = slot % g.block_size;

        let mut k = Vec::with_capacity(g.token_elems());
        let mut v = Vec::with_capacity(g.token_elems());
        for head in 0..g.num_kv_heads {
            let (ks, vs) = self.scales_at(head, slot);
            for dim in 0..g.head_dim {
                k.push(self.key.load(self.key.index(block, offset, head, dim)) * ks);
                v.push(self.value.load(self.value.index(block, offset, head, dim)) * vs);
            }
        }
        Ok((k, v))
    }
}

/// Shape and encoding of every tensor in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSpec {
    pub domain: StorageDomain,
    pub geometry: CacheGeometry,
    pub num_layers: usize,
    pub dtype: StorageDtype,
    pub layout: CacheLayout,
}

/// A pool of blocks in one storage domain together with their contents.
///
/// The store is the only owner of block data. Block tables hold plain ids;
/// the refcounts here decide when a block is actually released.
#[derive(Debug, Clone)]
pub struct BlockStore {
    spec: StoreSpec,
    pool: BlockPool,
    layers: Vec<LayerCache>,
}

impl BlockStore {
    pub fn new(spec: StoreSpec) -> Result<Self> {
        if spec.geometry.block_size == 0 || spec.num_layers == 0 {
            return Err(CacheError::InvalidArgument(
                "block_size and num_layers must be non-zero".into(),
            ));
        }
        let pool = BlockPool::new(spec.domain, spec.geometry.num_blocks)?;
        let layers = (0..spec.num_layers)
            .map(|_| LayerCache::new(spec.domain, spec.dtype, spec.layout, spec.geometry))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            domain = %spec.domain,
            blocks = spec.geometry.num_blocks,
            layers = spec.num_layers,
            dtype = %spec.dtype,
            layout = %spec.layout,
            "Created block store"
        );

        Ok(Self {
            pool,
            spec,
            layers,
        })
    }

    pub fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        self.pool.allocate(count)
    }

    pub fn free(&mut self, id: BlockId) -> Result<bool> {
        self.pool.free(id)
    }

    pub fn fork(&mut self, id: BlockId) -> Result<BlockId> {
        self.pool.fork(id)
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn spec(&self) -> &StoreSpec {
        &self.spec
    }

    pub fn domain(&self) -> StorageDomain {
        self.spec.domain
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.spec.geometry
    }

    pub fn block_size(&self) -> usize {
        self.spec.geometry.block_size
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerCache] {
        &mut self.layers
    }

    pub fn layer(&self, idx: usize) -> Result<&LayerCache> {
        let len = self.layers.len();
        self.layers.get(idx).ok_or(CacheError::OutOfRange {
            position: idx,
            length: len,
        })
    }

    pub fn layer_mut(&mut self, idx: usize) -> Result<&mut LayerCache> {
        let len = self.layers.len();
        self.layers.get_mut(idx).ok_or(CacheError::OutOfRange {
            position: idx,
            length: len,
        })
    }

    /// Start a new cache generation so that new scales may be bound.
    ///
    /// Only legal while no block is allocated.
    pub fn begin_generation(&mut self) -> Result<()> {
        if self.pool.allocated_count() > 0 {
            return Err(CacheError::InvalidState(format!(
                "{} blocks still allocated",
                self.pool.allocated_count()
            )));
        }
        for layer in &mut self.layers {
            layer.reset_scales();
        }
        Ok(())
    }

    /// Bytes of K+V storage per block across all layers.
    pub fn block_bytes(&self) -> usize {
        self.spec.geometry.block_elems() * self.spec.dtype.element_bytes() * 2 * self.spec.num_layers
    }
}
