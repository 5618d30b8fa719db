//! Bulk block movement: swap between storage domains, copy within one
//! domain, and whole-tensor precision conversion.
//!
//! Blocks occupy one contiguous element range in every layout, so swap and
//! copy are plain range copies. Quantized stores also carry per-token scales,
//! which travel with their block.

use serde::Serialize;
use tracing::debug;

use crate::cache::block::{BlockId, BlockMapping, StorageDomain, SwapDirection};
use crate::cache::dtype::KvCacheDtype;
use crate::cache::layout::CacheGeometry;
use crate::cache::store::{BlockStore, LayerCache, ScaleMode};
use crate::cache::tensor::{CacheTensor, ScaleTensor};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MigrationStats {
    pub swapped_out_blocks: u64,
    pub swapped_in_blocks: u64,
    pub copied_blocks: u64,
    pub swapped_bytes: u64,
    pub converted_elements: u64,
}

/// Executes block swaps, copies, and fp8 conversions.
///
/// Stateless apart from running totals; every call completes before it
/// returns.
#[derive(Debug, Default)]
pub struct BlockMigrator {
    stats: MigrationStats,
}

impl BlockMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &MigrationStats {
        &self.stats
    }

    /// Copy the blocks named by `mapping` from `src` into `dst`, every layer.
    ///
    /// The stores' domains must be the pair `direction` requires.
    pub fn swap(
        &mut self,
        src: &BlockStore,
        dst: &mut BlockStore,
        mapping: &BlockMapping,
        direction: SwapDirection,
    ) -> Result<usize> {
        let (want_src, want_dst) = direction.domains();
        if src.domain() != want_src || dst.domain() != want_dst {
            return Err(CacheError::DomainMismatch(format!(
                "{direction:?} needs {want_src} -> {want_dst}, got {} -> {}",
                src.domain(),
                dst.domain()
            )));
        }
        if src.layers().len() != dst.layers().len() {
            return Err(CacheError::DomainMismatch(format!(
                "source has {} layers, destination {}",
                src.layers().len(),
                dst.layers().len()
            )));
        }
        for (s, d) in src.layers().iter().zip(dst.layers()) {
            check_layer_pair(s, d)?;
            check_mapping(&s.key, &d.key, mapping)?;
        }

        let block_size = src.block_size();
        for (s, d) in src.layers().iter().zip(dst.layers_mut()) {
            if s.scale_mode() != ScaleMode::Unset {
                d.bind_scales(s.scale_mode())?;
            }
            for &(src_block, dst_block) in mapping.pairs() {
                d.key.copy_block_from(&s.key, src_block, dst_block);
                d.value.copy_block_from(&s.value, src_block, dst_block);
                if s.dtype().is_quantized() {
                    let (ss, ds) = (src_block as usize * block_size, dst_block as usize * block_size);
                    d.k_scales.copy_slots_from(&s.k_scales, ss, ds, block_size);
                    d.v_scales.copy_slots_from(&s.v_scales, ss, ds, block_size);
                }
            }
        }

        let n = mapping.len() as u64;
        match direction {
            SwapDirection::DeviceToHost => self.stats.swapped_out_blocks += n,
            SwapDirection::HostToDevice => self.stats.swapped_in_blocks += n,
        }
        self.stats.swapped_bytes += n * src.block_bytes() as u64;

        debug!(?direction, blocks = mapping.len(), "Swapped blocks");
        Ok(mapping.len())
    }

    /// Copy blocks within one store, every layer (copy-on-write materialization).
    pub fn copy(&mut self, store: &mut BlockStore, mapping: &BlockMapping) -> Result<usize> {
        for layer in store.layers() {
            check_mapping(&layer.key, &layer.key, mapping)?;
        }

        let block_size = store.block_size();
        for layer in store.layers_mut() {
            let quantized = layer.dtype().is_quantized();
            for &(src_block, dst_block) in mapping.pairs() {
                layer.key.copy_block_within(src_block, dst_block);
                layer.value.copy_block_within(src_block, dst_block);
                if quantized {
                    let (ss, ds) = (src_block as usize * block_size, dst_block as usize * block_size);
                    layer.k_scales.copy_slots_within(ss, ds, block_size);
                    layer.v_scales.copy_slots_within(ss, ds, block_size);
                }
            }
        }

        self.stats.copied_blocks += mapping.len() as u64;
        debug!(domain = %store.domain(), blocks = mapping.len(), "Copied blocks");
        Ok(mapping.len())
    }

    /// Requantize or dequantize a whole cache tensor with one scalar scale.
    pub fn convert_fp8(
        &mut self,
        dst: &mut CacheTensor,
        src: &CacheTensor,
        scale: f32,
        kv_cache_dtype: KvCacheDtype,
    ) -> Result<()> {
        let direction = check_conversion(dst, src, kv_cache_dtype)?;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CacheError::InvalidArgument(format!(
                "conversion scale must be finite and positive, got {scale}"
            )));
        }
        let count = convert_elements(dst, src, direction, |_, _| scale);
        self.stats.converted_elements += count as u64;
        debug!(src = %src.dtype(), dst = %dst.dtype(), scale, "Converted cache tensor");
        Ok(())
    }

    /// Like [`convert_fp8`](Self::convert_fp8), but scaling each element by
    /// the per-token scale stored for its (head, slot).
    pub fn convert_fp8_per_token(
        &mut self,
        dst: &mut CacheTensor,
        src: &CacheTensor,
        scales: &ScaleTensor,
        kv_cache_dtype: KvCacheDtype,
    ) -> Result<()> {
        let direction = check_conversion(dst, src, kv_cache_dtype)?;
        let g = src.geometry();
        if scales.num_kv_heads() != g.num_kv_heads || scales.num_slots() != g.num_slots() {
            return Err(CacheError::InvalidArgument(format!(
                "scale tensor is [{}, {}], cache needs [{}, {}]",
                scales.num_kv_heads(),
                scales.num_slots(),
                g.num_kv_heads,
                g.num_slots()
            )));
        }
        let count = convert_elements(dst, src, direction, |head, slot| scales.get(head, slot));
        self.stats.converted_elements += count as u64;
        debug!(src = %src.dtype(), dst = %dst.dtype(), "Converted cache tensor with per-token scales");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Quantize,
    Dequantize,
    Cast,
}

fn check_layer_pair(src: &LayerCache, dst: &LayerCache) -> Result<()> {
    if !src.key.block_compatible(&dst.key) || !src.value.block_compatible(&dst.value) {
        return Err(CacheError::DomainMismatch(format!(
            "blocks are not interchangeable: {} {} vs {} {}",
            src.dtype(),
            src.key.layout(),
            dst.dtype(),
            dst.key.layout()
        )));
    }
    let (from, to) = (src.scale_mode(), dst.scale_mode());
    if from != ScaleMode::Unset && to != ScaleMode::Unset && from != to {
        return Err(CacheError::InvalidState(format!(
            "destination scales bound to {to:?}, source uses {from:?}"
        )));
    }
    Ok(())
}

fn check_mapping(src: &CacheTensor, dst: &CacheTensor, mapping: &BlockMapping) -> Result<()> {
    if let Some((max_src, max_dst)) = mapping.max_ids() {
        src.check_block(max_src)?;
        dst.check_block(max_dst)?;
    }
    Ok(())
}

fn check_conversion(
    dst: &CacheTensor,
    src: &CacheTensor,
    kv_cache_dtype: KvCacheDtype,
) -> Result<Conversion> {
    if dst.domain() != src.domain() {
        return Err(CacheError::DomainMismatch(format!(
            "convert from {} to {} storage",
            src.domain(),
            dst.domain()
        )));
    }
    if dst.geometry() != src.geometry() || dst.layout() != src.layout() || dst.role() != src.role()
    {
        return Err(CacheError::InvalidArgument(
            "convert needs tensors of the same role, layout, and geometry".into(),
        ));
    }

    let (s, d) = (src.dtype(), dst.dtype());
    let conversion = match (s.is_fp8(), d.is_fp8()) {
        (true, false) if !d.is_quantized() => Conversion::Dequantize,
        (false, true) if !s.is_quantized() => Conversion::Quantize,
        (false, false) if !s.is_quantized() && !d.is_quantized() => Conversion::Cast,
        _ => {
            return Err(CacheError::DomainMismatch(format!(
                "no fp8 conversion from {s} to {d}"
            )))
        }
    };

    let fp8_side = match conversion {
        Conversion::Dequantize => Some(s),
        Conversion::Quantize => Some(d),
        Conversion::Cast => None,
    };
    match (kv_cache_dtype, fp8_side) {
        (KvCacheDtype::Auto, None) => Ok(conversion),
        (requested, Some(side)) if requested.storage() == Some(side) => Ok(conversion),
        (requested, _) => Err(CacheError::DomainMismatch(format!(
            "kv_cache_dtype {requested} does not describe {s} -> {d}"
        ))),
    }
}

/// Element-wise conversion by logical coordinate, so tensors whose pack
/// factors differ still line up. Returns the number of elements written.
fn convert_elements(
    dst: &mut CacheTensor,
    src: &CacheTensor,
    conversion: Conversion,
    scale_at: impl Fn(usize, usize) -> f32,
) -> usize {
    let g: CacheGeometry = *src.geometry();
    let mut count = 0;
    for block in 0..g.num_blocks as BlockId {
        for offset in 0..g.block_size {
            let slot = block as usize * g.block_size + offset;
            for head in 0..g.num_kv_heads {
                let scale = scale_at(head, slot);
                for dim in 0..g.head_dim {
                    let v = src.load(src.index(block, offset, head, dim));
                    let out = match conversion {
                        Conversion::Dequantize => v * scale,
                        Conversion::Quantize => v / scale,
                        Conversion::Cast => v,
                    };
                    let idx = dst.index(block, offset, head, dim);
                    dst.store(idx, out);
                    count += 1;
                }
            }
        }
    }
    count
}

/// Domain pair a swap between `src` and `dst` implies.
pub fn swap_direction(src: StorageDomain, dst: StorageDomain) -> Result<SwapDirection> {
    match (src, dst) {
        (StorageDomain::Device, StorageDomain::Host) => Ok(SwapDirection::DeviceToHost),
        (StorageDomain::Host, StorageDomain::Device) => Ok(SwapDirection::HostToDevice),
        (a, b) => Err(CacheError::DomainMismatch(format!(
            "swap needs different domains, got {a} -> {b}; use copy within a domain"
        ))),
    }
}

/// Tensor-level swap used by the operator surface.
pub(crate) fn swap_tensor_blocks(
    src: &CacheTensor,
    dst: &mut CacheTensor,
    mapping: &BlockMapping,
) -> Result<SwapDirection> {
    let direction = swap_direction(src.domain(), dst.domain())?;
    if !src.block_compatible(dst) {
        return Err(CacheError::DomainMismatch(format!(
            "cannot swap {} {} blocks into {} {}",
            src.dtype(),
            src.layout(),
            dst.dtype(),
            dst.layout()
        )));
    }
    check_mapping(src, dst, mapping)?;
    for &(s, d) in mapping.pairs() {
        dst.copy_block_from(src, s, d);
    }
    Ok(direction)
}

/// Tensor-level copy used by the operator surface.
pub(crate) fn copy_tensor_blocks(
    key_caches: &mut [CacheTensor],
    value_caches: &mut [CacheTensor],
    mapping: &BlockMapping,
) -> Result<()> {
    if key_caches.len() != value_caches.len() {
        return Err(CacheError::InvalidArgument(format!(
            "{} key caches but {} value caches",
            key_caches.len(),
            value_caches.len()
        )));
    }
    let Some(first) = key_caches.first() else {
        return Ok(());
    };
    let domain = first.domain();
    for tensor in key_caches.iter().chain(value_caches.iter()) {
        if tensor.domain() != domain {
            return Err(CacheError::DomainMismatch(format!(
                "copy_blocks needs one domain, found {domain} and {}",
                tensor.domain()
            )));
        }
        check_mapping(tensor, tensor, mapping)?;
    }
    for tensor in key_caches.iter_mut().chain(value_caches.iter_mut()) {
        for &(s, d) in mapping.pairs() {
            tensor.copy_block_within(s, d);
        }
    }
    Ok(())
}
