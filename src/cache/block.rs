//! Block identifiers, storage domains, and the transient mapping arrays
//! passed to cache writes and block migrations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Index of a block within one storage domain's pool.
pub type BlockId = u32;

/// Slot value meaning "do not cache this token" (padding, rejected
/// speculative tokens). Any negative slot is treated the same way.
pub const DISCARD_SLOT: i64 = -1;

/// Where a pool's block contents live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDomain {
    /// Accelerator memory (hot).
    Device,
    /// Host RAM (swap target).
    Host,
}

impl std::fmt::Display for StorageDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageDomain::Device => write!(f, "device"),
            StorageDomain::Host => write!(f, "host"),
        }
    }
}

/// Direction of a bulk swap between storage domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDirection {
    /// Evict: device → host.
    DeviceToHost,
    /// Restore: host → device.
    HostToDevice,
}

impl SwapDirection {
    /// The (source, destination) domains this direction requires.
    pub fn domains(&self) -> (StorageDomain, StorageDomain) {
        match self {
            SwapDirection::DeviceToHost => (StorageDomain::Device, StorageDomain::Host),
            SwapDirection::HostToDevice => (StorageDomain::Host, StorageDomain::Device),
        }
    }

    pub fn reverse(&self) -> SwapDirection {
        match self {
            SwapDirection::DeviceToHost => SwapDirection::HostToDevice,
            SwapDirection::HostToDevice => SwapDirection::DeviceToHost,
        }
    }
}

/// Flat physical slot index (`block_id * block_size + offset`) per new token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMapping {
    slots: Vec<i64>,
}

impl SlotMapping {
    pub fn new(slots: Vec<i64>) -> Self {
        Self { slots }
    }

    /// Build a mapping from resolved slots, `None` becoming the discard sentinel.
    pub fn from_optional(slots: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self {
            slots: slots
                .into_iter()
                .map(|s| s.map(|v| v as i64).unwrap_or(DISCARD_SLOT))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.slots
    }

    /// Resolved slot for token `i`, or `None` if the token is discarded.
    pub fn get(&self, i: usize) -> Option<usize> {
        self.slots.get(i).and_then(|&s| usize::try_from(s).ok())
    }

    /// Number of tokens that will actually be stored.
    pub fn stored_count(&self) -> usize {
        self.slots.iter().filter(|&&s| s >= 0).count()
    }
}

impl From<Vec<i64>> for SlotMapping {
    fn from(slots: Vec<i64>) -> Self {
        Self::new(slots)
    }
}

/// Split a flat slot into (block id, offset within block).
pub fn split_slot(slot: usize, block_size: usize) -> (BlockId, usize) {
    ((slot / block_size) as BlockId, slot % block_size)
}

/// Dense (source, destination) block pairs for swap/copy.
///
/// No destination appears twice, so a single call never has two writes
/// racing for the same block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMapping {
    pairs: Vec<(BlockId, BlockId)>,
}

impl BlockMapping {
    pub fn new(pairs: Vec<(BlockId, BlockId)>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(pairs.len());
        for &(_, dst) in &pairs {
            if !seen.insert(dst) {
                return Err(CacheError::InvalidArgument(format!(
                    "destination block {dst} appears more than once in block mapping"
                )));
            }
        }
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[(BlockId, BlockId)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Mapping with every pair reversed (undo of a swap).
    pub fn inverse(&self) -> Result<Self> {
        Self::new(self.pairs.iter().map(|&(s, d)| (d, s)).collect())
    }

    /// Largest block id referenced on each side.
    pub(crate) fn max_ids(&self) -> Option<(BlockId, BlockId)> {
        let max_src = self.pairs.iter().map(|p| p.0).max()?;
        let max_dst = self.pairs.iter().map(|p| p.1).max()?;
        Some((max_src, max_dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_mapping_discard() {
        let mapping = SlotMapping::new(vec![0, DISCARD_SLOT, 17, -5]);
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping.get(0), Some(0));
        assert_eq!(mapping.get(1), None);
        assert_eq!(mapping.get(2), Some(17));
        assert_eq!(mapping.get(3), None);
        assert_eq!(mapping.stored_count(), 2);
    }

    #[test]
    fn test_split_slot() {
        assert_eq!(split_slot(0, 16), (0, 0));
        assert_eq!(split_slot(19, 16), (1, 3));
        assert_eq!(split_slot(47, 16), (2, 15));
    }

    #[test]
    fn test_block_mapping_rejects_duplicate_destination() {
        assert!(BlockMapping::new(vec![(0, 3), (1, 4)]).is_ok());
        // Repeated sources are fine (fan-out copy).
        assert!(BlockMapping::new(vec![(0, 3), (0, 4)]).is_ok());
        let err = BlockMapping::new(vec![(0, 3), (1, 3)]).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_swap_direction_domains() {
        assert_eq!(
            SwapDirection::DeviceToHost.domains(),
            (StorageDomain::Device, StorageDomain::Host)
        );
        assert_eq!(
            SwapDirection::DeviceToHost.reverse(),
            SwapDirection::HostToDevice
        );
    }
}
