//! Physical layouts of the key/value cache tensors.
//!
//! A layout is a pure addressing scheme: it maps a logical
//! (block, offset-in-block, head, dim) coordinate to an element index in the
//! flat cache tensor. Layouts are versioned descriptors so that a kernel's
//! expected byte ordering can change without touching the writer.
//!
//! `x` below is the dtype pack factor (elements per 16 bytes).
//!
//! | layout   | key                               | value                             |
//! |----------|-----------------------------------|-----------------------------------|
//! | standard | `[B, H, D/x, S, x]`               | `[B, H, D, S]`                    |
//! | asm      | `[B, H, D/x, S, x]`               | `[B, H, S/x, D, x]`               |
//! | flash    | `[B, S, H, D]`                    | `[B, S, H, D]`                    |
//!
//! In every layout a block occupies one contiguous range of `S * H * D`
//! elements.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::block::BlockId;
use crate::cache::dtype::StorageDtype;
use crate::error::{CacheError, Result};

/// Dimensions shared by every tensor of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    /// Number of blocks in the pool.
    pub num_blocks: usize,
    /// Token slots per block.
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl CacheGeometry {
    /// Elements of one token across all heads.
    pub fn token_elems(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Elements of one block.
    pub fn block_elems(&self) -> usize {
        self.block_size * self.token_elems()
    }

    /// Elements of the whole tensor.
    pub fn total_elems(&self) -> usize {
        self.num_blocks * self.block_elems()
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }
}

/// Which half of the cache a tensor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheRole {
    Key,
    Value,
}

/// Addressing scheme for one cache layout version.
pub trait LayoutDescriptor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Check that `geometry` can be expressed in this layout for `dtype`.
    fn validate(&self, geometry: &CacheGeometry, dtype: StorageDtype) -> Result<()> {
        let x = dtype.pack_factor();
        if geometry.head_dim % x != 0 {
            return Err(CacheError::InvalidArgument(format!(
                "{} layout needs head_dim divisible by {x} for {dtype}, got {}",
                self.name(),
                geometry.head_dim
            )));
        }
        Ok(())
    }

    /// Element index of (block, offset, head, dim) in the `role` tensor.
    fn offset(
        &self,
        role: CacheRole,
        geometry: &CacheGeometry,
        x: usize,
        block: BlockId,
        block_offset: usize,
        head: usize,
        dim: usize,
    ) -> usize;

    /// Logical tensor shape, for diagnostics.
    fn shape(&self, role: CacheRole, geometry: &CacheGeometry, x: usize) -> Vec<usize>;
}

fn x_split_key_offset(
    g: &CacheGeometry,
    x: usize,
    block: BlockId,
    block_offset: usize,
    head: usize,
    dim: usize,
) -> usize {
    block as usize * g.block_elems()
        + head * g.head_dim * g.block_size
        + (dim / x) * g.block_size * x
        + block_offset * x
        + dim % x
}

fn x_split_key_shape(g: &CacheGeometry, x: usize) -> Vec<usize> {
    vec![g.num_blocks, g.num_kv_heads, g.head_dim / x, g.block_size, x]
}

/// Row-major per-block layout used by the generic paged-attention kernels.
#[derive(Debug)]
pub struct StandardLayout;

impl LayoutDescriptor for StandardLayout {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn version(&self) -> u32 {
        1
    }

    fn offset(
        &self,
        role: CacheRole,
        g: &CacheGeometry,
        x: usize,
        block: BlockId,
        block_offset: usize,
        head: usize,
        dim: usize,
    ) -> usize {
        match role {
            CacheRole::Key => x_split_key_offset(g, x, block, block_offset, head, dim),
            CacheRole::Value => {
                block as usize * g.block_elems()
                    + head * g.head_dim * g.block_size
                    + dim * g.block_size
                    + block_offset
            }
        }
    }

    fn shape(&self, role: CacheRole, g: &CacheGeometry, x: usize) -> Vec<usize> {
        match role {
            CacheRole::Key => x_split_key_shape(g, x),
            CacheRole::Value => vec![g.num_blocks, g.num_kv_heads, g.head_dim, g.block_size],
        }
    }
}

/// Packed layout expected by the hand-written assembly attention kernel:
/// values are tiled `x` tokens at a time.
#[derive(Debug)]
pub struct AsmLayout;

impl LayoutDescriptor for AsmLayout {
    fn name(&self) -> &'static str {
        "asm"
    }

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, g: &CacheGeometry, dtype: StorageDtype) -> Result<()> {
        StandardLayout.validate(g, dtype)?;
        let x = dtype.pack_factor();
        if g.block_size % x != 0 {
            return Err(CacheError::InvalidArgument(format!(
                "asm layout needs block_size divisible by {x} for {dtype}, got {}",
                g.block_size
            )));
        }
        Ok(())
    }

    fn offset(
        &self,
        role: CacheRole,
        g: &CacheGeometry,
        x: usize,
        block: BlockId,
        block_offset: usize,
        head: usize,
        dim: usize,
    ) -> usize {
        match role {
            CacheRole::Key => x_split_key_offset(g, x, block, block_offset, head, dim),
            CacheRole::Value => {
                block as usize * g.block_elems()
                    + head * g.block_size * g.head_dim
                    + (block_offset / x) * g.head_dim * x
                    + dim * x
                    + block_offset % x
            }
        }
    }

    fn shape(&self, role: CacheRole, g: &CacheGeometry, x: usize) -> Vec<usize> {
        match role {
            CacheRole::Key => x_split_key_shape(g, x),
            CacheRole::Value => vec![g.num_blocks, g.num_kv_heads, g.block_size / x, g.head_dim, x],
        }
    }
}

/// Token-major layout shared by key and value (flash-attention style).
#[derive(Debug)]
pub struct FlashLayout;

impl LayoutDescriptor for FlashLayout {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, _g: &CacheGeometry, _dtype: StorageDtype) -> Result<()> {
        Ok(())
    }

    fn offset(
        &self,
        _role: CacheRole,
        g: &CacheGeometry,
        _x: usize,
        block: BlockId,
        block_offset: usize,
        head: usize,
        dim: usize,
    ) -> usize {
        block as usize * g.block_elems() + block_offset * g.token_elems() + head * g.head_dim + dim
    }

    fn shape(&self, _role: CacheRole, g: &CacheGeometry, _x: usize) -> Vec<usize> {
        vec![g.num_blocks, g.block_size, g.num_kv_heads, g.head_dim]
    }
}

/// The layout tag carried by a cache tensor, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayout {
    Standard,
    Asm,
    Flash,
}

impl CacheLayout {
    pub fn descriptor(&self) -> &'static dyn LayoutDescriptor {
        match self {
            CacheLayout::Standard => &StandardLayout,
            CacheLayout::Asm => &AsmLayout,
            CacheLayout::Flash => &FlashLayout,
        }
    }
}

impl std::fmt::Display for CacheLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.descriptor();
        write!(f, "{}/v{}", d.name(), d.version())
    }
}

impl FromStr for CacheLayout {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(CacheLayout::Standard),
            "asm" => Ok(CacheLayout::Asm),
            "flash" => Ok(CacheLayout::Flash),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown cache layout '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn geometry() -> CacheGeometry {
        CacheGeometry {
            num_blocks: 3,
            block_size: 16,
            num_kv_heads: 2,
            head_dim: 8,
        }
    }

    /// Every coordinate of a block maps to a distinct element inside that block's range.
    fn assert_bijective(layout: CacheLayout, role: CacheRole, x: usize) {
        let g = geometry();
        let d = layout.descriptor();
        for block in 0..g.num_blocks as BlockId {
            let lo = block as usize * g.block_elems();
            let hi = lo + g.block_elems();
            let mut seen = HashSet::new();
            for off in 0..g.block_size {
                for head in 0..g.num_kv_heads {
                    for dim in 0..g.head_dim {
                        let idx = d.offset(role, &g, x, block, off, head, dim);
                        assert!((lo..hi).contains(&idx), "{layout} {role:?} escaped its block");
                        assert!(seen.insert(idx), "{layout} {role:?} collision at {idx}");
                    }
                }
            }
            assert_eq!(seen.len(), g.block_elems());
        }
    }

    #[test]
    fn test_layouts_are_bijective_within_blocks() {
        for layout in [CacheLayout::Standard, CacheLayout::Asm, CacheLayout::Flash] {
            for role in [CacheRole::Key, CacheRole::Value] {
                assert_bijective(layout, role, 8);
                assert_bijective(layout, role, 4);
            }
        }
    }

    #[test]
    fn test_asm_value_tiles_tokens() {
        let g = geometry();
        let d = CacheLayout::Asm.descriptor();
        // Consecutive tokens within one x-tile are adjacent in memory.
        let a = d.offset(CacheRole::Value, &g, 8, 0, 0, 0, 0);
        let b = d.offset(CacheRole::Value, &g, 8, 0, 1, 0, 0);
        assert_eq!(b, a + 1);
        // The next dim skips a whole tile of x tokens.
        let c = d.offset(CacheRole::Value, &g, 8, 0, 0, 0, 1);
        assert_eq!(c, a + 8);
    }

    #[test]
    fn test_validate_rejects_unaligned_geometry() {
        let mut g = geometry();
        g.block_size = 12;
        assert!(CacheLayout::Asm
            .descriptor()
            .validate(&g, StorageDtype::F16)
            .is_err());
        assert!(CacheLayout::Standard
            .descriptor()
            .validate(&g, StorageDtype::F16)
            .is_ok());
        // fp8 packs 16 per tile; head_dim 8 cannot be split.
        assert!(CacheLayout::Standard
            .descriptor()
            .validate(&geometry(), StorageDtype::Fp8E4m3)
            .is_err());
    }

    #[test]
    fn test_layout_display_and_parse() {
        assert_eq!(CacheLayout::Asm.to_string(), "asm/v1");
        assert_eq!("flash".parse::<CacheLayout>().unwrap(), CacheLayout::Flash);
        assert!("tiled".parse::<CacheLayout>().is_err());
    }
}
