//! Typed backing storage for cache tensors.
//!
//! A [`CacheTensor`] is one key or value cache for one layer in one storage
//! domain. Its dtype, layout, and domain are fixed at allocation; only
//! element contents change afterwards.

use half::{bf16, f16};

use crate::cache::block::{BlockId, StorageDomain};
use crate::cache::dtype::{decode_byte, encode_byte, StorageDtype};
use crate::cache::layout::{CacheGeometry, CacheLayout, CacheRole};
use crate::error::{CacheError, Result};

/// Element storage, one variant per physical element width.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    /// One-byte codes (fp8 bit patterns or two's-complement int8).
    Bytes(Vec<u8>),
}

impl CacheData {
    fn zeroed(dtype: StorageDtype, len: usize) -> Self {
        match dtype {
            StorageDtype::F32 => CacheData::F32(vec![0.0; len]),
            StorageDtype::F16 => CacheData::F16(vec![f16::ZERO; len]),
            StorageDtype::Bf16 => CacheData::Bf16(vec![bf16::ZERO; len]),
            StorageDtype::Fp8E4m3 | StorageDtype::Fp8E5m2 | StorageDtype::Int8 => {
                CacheData::Bytes(vec![0; len])
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            CacheData::F32(v) => v.len(),
            CacheData::F16(v) => v.len(),
            CacheData::Bf16(v) => v.len(),
            CacheData::Bytes(v) => v.len(),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            CacheData::F32(v) => bytemuck::cast_slice(v),
            CacheData::F16(v) => bytemuck::cast_slice(v),
            CacheData::Bf16(v) => bytemuck::cast_slice(v),
            CacheData::Bytes(v) => v,
        }
    }
}

/// A key or value cache tensor for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheTensor {
    role: CacheRole,
    domain: StorageDomain,
    dtype: StorageDtype,
    layout: CacheLayout,
    geometry: CacheGeometry,
    data: CacheData,
}

impl CacheTensor {
    /// Allocate a zero-filled tensor.
    pub fn new(
        role: CacheRole,
        domain: StorageDomain,
        dtype: StorageDtype,
        layout: CacheLayout,
        geometry: CacheGeometry,
    ) -> Result<Self> {
        layout.descriptor().validate(&geometry, dtype)?;
        Ok(Self {
            role,
            domain,
            dtype,
            layout,
            geometry,
            data: CacheData::zeroed(dtype, geometry.total_elems()),
        })
    }

    pub fn role(&self) -> CacheRole {
        self.role
    }

    pub fn domain(&self) -> StorageDomain {
        self.domain
    }

    pub fn dtype(&self) -> StorageDtype {
        self.dtype
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Layout pack factor for this tensor's dtype.
    pub fn pack_factor(&self) -> usize {
        self.dtype.pack_factor()
    }

    /// Flat element index of a logical coordinate.
    pub fn index(&self, block: BlockId, block_offset: usize, head: usize, dim: usize) -> usize {
        self.layout.descriptor().offset(
            self.role,
            &self.geometry,
            self.pack_factor(),
            block,
            block_offset,
            head,
            dim,
        )
    }

    /// Raw element value in the storage (scaled) domain.
    pub fn load(&self, idx: usize) -> f32 {
        match &self.data {
            CacheData::F32(v) => v[idx],
            CacheData::F16(v) => v[idx].to_f32(),
            CacheData::Bf16(v) => v[idx].to_f32(),
            CacheData::Bytes(v) => decode_byte(self.dtype, v[idx]),
        }
    }

    /// Store an already-scaled value, rounding to the storage dtype.
    pub fn store(&mut self, idx: usize, value: f32) {
        match &mut self.data {
            CacheData::F32(v) => v[idx] = value,
            CacheData::F16(v) => v[idx] = f16::from_f32(value),
            CacheData::Bf16(v) => v[idx] = bf16::from_f32(value),
            CacheData::Bytes(v) => v[idx] = encode_byte(self.dtype, value),
        }
    }

    /// Element range occupied by `block`.
    pub fn block_range(&self, block: BlockId) -> std::ops::Range<usize> {
        let elems = self.geometry.block_elems();
        let start = block as usize * elems;
        start..start + elems
    }

    pub fn check_block(&self, block: BlockId) -> Result<()> {
        if block as usize >= self.geometry.num_blocks {
            return Err(CacheError::OutOfRange {
                position: block as usize,
                length: self.geometry.num_blocks,
            });
        }
        Ok(())
    }

    /// Whole-tensor byte view.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Byte view of one block.
    pub fn block_bytes(&self, block: BlockId) -> &[u8] {
        let width = self.dtype.element_bytes();
        let range = self.block_range(block);
        &self.as_bytes()[range.start * width..range.end * width]
    }

    /// Whether `other` stores blocks with the same element encoding and size.
    pub fn block_compatible(&self, other: &CacheTensor) -> bool {
        self.dtype == other.dtype
            && self.layout == other.layout
            && self.geometry.block_elems() == other.geometry.block_elems()
    }

    /// Copy one block of `src` into block `dst_block` of this tensor.
    pub(crate) fn copy_block_from(
        &mut self,
        src: &CacheTensor,
        src_block: BlockId,
        dst_block: BlockId,
    ) {
        let s = src.block_range(src_block);
        let d = self.block_range(dst_block);
        match (&mut self.data, &src.data) {
            (CacheData::F32(dst), CacheData::F32(src)) => dst[d].copy_from_slice(&src[s]),
            (CacheData::F16(dst), CacheData::F16(src)) => dst[d].copy_from_slice(&src[s]),
            (CacheData::Bf16(dst), CacheData::Bf16(src)) => dst[d].copy_from_slice(&src[s]),
            (CacheData::Bytes(dst), CacheData::Bytes(src)) => dst[d].copy_from_slice(&src[s]),
            _ => unreachable!("block_compatible checked before copy"),
        }
    }

    /// Copy block `src_block` onto `dst_block` within this tensor.
    pub(crate) fn copy_block_within(&mut self, src_block: BlockId, dst_block: BlockId) {
        if src_block == dst_block {
            return;
        }
        let s = self.block_range(src_block);
        let d = self.block_range(dst_block).start;
        match &mut self.data {
            CacheData::F32(v) => v.copy_within(s, d),
            CacheData::F16(v) => v.copy_within(s, d),
            CacheData::Bf16(v) => v.copy_within(s, d),
            CacheData::Bytes(v) => v.copy_within(s, d),
        }
    }
}

/// Per-token dequantization scales, `[num_kv_heads, num_slots]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTensor {
    num_kv_heads: usize,
    num_slots: usize,
    data: Vec<f32>,
}

impl ScaleTensor {
    pub fn new(num_kv_heads: usize, num_slots: usize) -> Self {
        Self {
            num_kv_heads,
            num_slots,
            data: vec![1.0; num_kv_heads * num_slots],
        }
    }

    pub fn for_geometry(geometry: &CacheGeometry) -> Self {
        Self::new(geometry.num_kv_heads, geometry.num_slots())
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn get(&self, head: usize, slot: usize) -> f32 {
        self.data[head * self.num_slots + slot]
    }

    pub fn set(&mut self, head: usize, slot: usize, scale: f32) {
        self.data[head * self.num_slots + slot] = scale;
    }

    /// Copy the scales of `block_size` slots starting at `src_slot` in `src`.
    pub(crate) fn copy_slots_from(
        &mut self,
        src: &ScaleTensor,
        src_slot: usize,
        dst_slot: usize,
        block_size: usize,
    ) {
        for head in 0..self.num_kv_heads {
            let s = head * src.num_slots + src_slot;
            let d = head * self.num_slots + dst_slot;
            self.data[d..d + block_size].copy_from_slice(&src.data[s..s + block_size]);
        }
    }

    pub(crate) fn copy_slots_within(&mut self, src_slot: usize, dst_slot: usize, block_size: usize) {
        for head in 0..self.num_kv_heads {
            let s = head * self.num_slots + src_slot;
            let d = head * self.num_slots + dst_slot;
            self.data.copy_within(s..s + block_size, d);
        }
    }
}
