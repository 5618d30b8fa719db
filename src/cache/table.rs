//! Per-sequence block table: logical token position → physical slot.
//!
//! The table holds block ids only. Whether a block is still alive is decided
//! by the refcounts in [`BlockStore`]; the table merely asks the store to drop
//! its references when it shrinks.

use std::ops::Range;

use tracing::debug;

use crate::cache::block::{BlockId, SlotMapping};
use crate::cache::store::BlockStore;
use crate::error::{CacheError, Result};

/// The block table maps sequence positions to blocks.
///
/// Entries are contiguous from position 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens: usize,
    block_size: usize,
    max_seq_len: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize, max_seq_len: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
            max_seq_len,
        }
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Number of tokens in the sequence.
    pub fn len(&self) -> usize {
        self.num_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Token slots covered by the blocks already in the table.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    fn max_blocks(&self) -> usize {
        self.max_seq_len.div_ceil(self.block_size)
    }

    /// Blocks that must be appended before `new_tokens` more tokens fit.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        (self.num_tokens + new_tokens)
            .div_ceil(self.block_size)
            .saturating_sub(self.blocks.len())
    }

    /// Extend the table with freshly allocated (or forked) blocks.
    pub fn append(&mut self, block_ids: &[BlockId]) -> Result<()> {
        let new_len = self.blocks.len() + block_ids.len();
        if new_len > self.max_blocks() {
            return Err(CacheError::Overflow {
                requested: new_len * self.block_size,
                max: self.max_seq_len,
            });
        }
        self.blocks.extend_from_slice(block_ids);
        Ok(())
    }

    /// Grow the logical length by `n` tokens within the current capacity.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let new_len = self.num_tokens + n;
        if new_len > self.max_seq_len {
            return Err(CacheError::Overflow {
                requested: new_len,
                max: self.max_seq_len,
            });
        }
        if new_len > self.capacity() {
            return Err(CacheError::InvalidState(format!(
                "{new_len} tokens need {} blocks, table has {}",
                new_len.div_ceil(self.block_size),
                self.blocks.len()
            )));
        }
        self.num_tokens = new_len;
        Ok(())
    }

    /// Physical slot of a logical position.
    pub fn slot_for(&self, position: usize) -> Result<usize> {
        if position >= self.num_tokens {
            return Err(CacheError::OutOfRange {
                position,
                length: self.num_tokens,
            });
        }
        let block = self.blocks[position / self.block_size] as usize;
        Ok(block * self.block_size + position % self.block_size)
    }

    /// Slot mapping for a range of logical positions.
    pub fn slot_mapping(&self, positions: Range<usize>) -> Result<SlotMapping> {
        let slots = positions
            .map(|p| self.slot_for(p).map(|s| s as i64))
            .collect::<Result<Vec<_>>>()?;
        Ok(SlotMapping::new(slots))
    }

    /// Shrink to `new_length` tokens and drop the table's reference to every
    /// block that no longer holds a position.
    ///
    /// Returns the blocks removed from the table; whether each was actually
    /// freed depends on its remaining refcount.
    pub fn truncate(&mut self, new_length: usize, store: &mut BlockStore) -> Result<Vec<BlockId>> {
        if new_length > self.num_tokens {
            return Err(CacheError::OutOfRange {
                position: new_length,
                length: self.num_tokens,
            });
        }
        let keep = new_length.div_ceil(self.block_size);
        let removed = if keep < self.blocks.len() {
            self.blocks.split_off(keep)
        } else {
            Vec::new()
        };
        self.num_tokens = new_length;

        for &id in &removed {
            store.free(id)?;
        }
        if !removed.is_empty() {
            debug!(new_length, released = removed.len(), "Truncated block table");
        }
        Ok(removed)
    }

    /// Drop every reference held by this table.
    pub fn release(&mut self, store: &mut BlockStore) -> Result<Vec<BlockId>> {
        self.truncate(0, store)
    }

    /// Share every block with a new table (beam search branch).
    ///
    /// On failure no reference is left behind.
    pub fn fork(&self, store: &mut BlockStore) -> Result<BlockTable> {
        for (i, &id) in self.blocks.iter().enumerate() {
            if let Err(e) = store.fork(id) {
                for &done in &self.blocks[..i] {
                    store.free(done)?;
                }
                return Err(e);
            }
        }
        Ok(self.clone())
    }

    /// Whether the block the next token lands in is shared with another table.
    pub fn needs_copy_on_write(&self, store: &BlockStore) -> Result<bool> {
        match self.blocks.get(self.num_tokens / self.block_size) {
            Some(&id) => store.pool().is_shared(id),
            None => Ok(false),
        }
    }

    /// Point the table at blocks holding the same contents elsewhere (after a
    /// swap between domains). Lengths must match.
    pub(crate) fn remap(&mut self, blocks: Vec<BlockId>) {
        debug_assert_eq!(blocks.len(), self.blocks.len());
        self.blocks = blocks;
    }

    /// Copy-on-write before appending the next token.
    ///
    /// If the block the next token lands in is shared, swap it for a fresh
    /// private block and return `(shared, fresh)`. The caller must copy the
    /// shared block's contents into the fresh one before writing.
    pub fn prepare_append(&mut self, store: &mut BlockStore) -> Result<Option<(BlockId, BlockId)>> {
        let idx = self.num_tokens / self.block_size;
        let Some(&shared) = self.blocks.get(idx) else {
            return Ok(None);
        };
        if !store.pool().is_shared(shared)? {
            return Ok(None);
        }

        let fresh = store.allocate(1)?[0];
        store.free(shared)?;
        self.blocks[idx] = fresh;
        debug!(shared, fresh, "Copy-on-write block");
        Ok(Some((shared, fresh)))
    }
}
