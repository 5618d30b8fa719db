//! Operator surface of the cache module.
//!
//! Each function takes concrete cache tensors plus scalar/string options,
//! resolves its kernel through [`KernelRegistry::global`] and runs it to
//! completion. Nothing here allocates cache storage; all tensors must already
//! live in the domain the operation expects.

use tracing::debug;

use crate::cache::block::{BlockMapping, SlotMapping};
use crate::cache::dtype::{Element, KvCacheDtype, StorageDtype};
use crate::cache::layout::CacheLayout;
use crate::cache::migrator::{copy_tensor_blocks, swap_tensor_blocks, BlockMigrator};
use crate::cache::tensor::{CacheTensor, ScaleTensor};
use crate::cache::writer::{WriteRequest, WriteScales};
use crate::error::{CacheError, Result};
use crate::kernels::registry::{CacheKernel, CacheOp, KernelKey, KernelRegistry};

fn kernel(op: CacheOp, tensor: &CacheTensor) -> Result<std::sync::Arc<CacheKernel>> {
    let kernel = KernelRegistry::global().resolve(KernelKey {
        op,
        layout: tensor.layout(),
        dtype: tensor.dtype(),
    })?;
    kernel.record_invocation();
    Ok(kernel)
}

fn expect_layout(cache: &CacheTensor, asm_layout: bool) -> Result<()> {
    let expected = if asm_layout {
        CacheLayout::Asm
    } else {
        CacheLayout::Standard
    };
    if cache.layout() != expected {
        return Err(CacheError::InvalidArgument(format!(
            "asm_layout={asm_layout} expects a {expected} cache, got {}",
            cache.layout()
        )));
    }
    Ok(())
}

/// Copy blocks between a device and a host tensor.
pub fn swap_blocks(src: &CacheTensor, dst: &mut CacheTensor, block_mapping: &BlockMapping) -> Result<()> {
    kernel(CacheOp::SwapBlocks, src)?;
    let direction = swap_tensor_blocks(src, dst, block_mapping)?;
    debug!(?direction, blocks = block_mapping.len(), "swap_blocks");
    Ok(())
}

/// Copy blocks within every layer's key and value cache.
pub fn copy_blocks(
    key_caches: &mut [CacheTensor],
    value_caches: &mut [CacheTensor],
    block_mapping: &BlockMapping,
) -> Result<()> {
    if let Some(first) = key_caches.first() {
        kernel(CacheOp::CopyBlocks, first)?;
    }
    copy_tensor_blocks(key_caches, value_caches, block_mapping)?;
    debug!(
        layers = key_caches.len(),
        blocks = block_mapping.len(),
        "copy_blocks"
    );
    Ok(())
}

/// Write new K/V into a standard or asm layout cache.
#[allow(clippy::too_many_arguments)]
pub fn reshape_and_cache<T: Element>(
    key: &[T],
    value: &[T],
    key_cache: &mut CacheTensor,
    value_cache: &mut CacheTensor,
    slot_mapping: &SlotMapping,
    kv_cache_dtype: &str,
    k_scale: f32,
    v_scale: f32,
    asm_layout: bool,
) -> Result<()> {
    let kv_cache_dtype: KvCacheDtype = kv_cache_dtype.parse()?;
    expect_layout(key_cache, asm_layout)?;
    let kernel = kernel(CacheOp::ReshapeAndCache, key_cache)?;
    kernel.writer()?.write_tensors(
        key_cache,
        value_cache,
        None,
        &WriteRequest {
            key,
            value,
            slot_mapping,
            kv_cache_dtype,
            scales: WriteScales::PerTensor { k_scale, v_scale },
        },
    )?;
    Ok(())
}

/// Write new K/V into a flash layout cache. Same contract as
/// [`reshape_and_cache`].
#[allow(clippy::too_many_arguments)]
pub fn reshape_and_cache_flash<T: Element>(
    key: &[T],
    value: &[T],
    key_cache: &mut CacheTensor,
    value_cache: &mut CacheTensor,
    slot_mapping: &SlotMapping,
    kv_cache_dtype: &str,
    k_scale: f32,
    v_scale: f32,
) -> Result<()> {
    let kv_cache_dtype: KvCacheDtype = kv_cache_dtype.parse()?;
    let kernel = kernel(CacheOp::ReshapeAndCacheFlash, key_cache)?;
    kernel.writer()?.write_tensors(
        key_cache,
        value_cache,
        None,
        &WriteRequest {
            key,
            value,
            slot_mapping,
            kv_cache_dtype,
            scales: WriteScales::PerTensor { k_scale, v_scale },
        },
    )?;
    Ok(())
}

/// Quantize each (token, head) with its own absmax scale and store the
/// dequantization scales at the destination slots.
#[allow(clippy::too_many_arguments)]
pub fn reshape_and_cache_with_pertoken_quant<T: Element>(
    key: &[T],
    value: &[T],
    key_cache: &mut CacheTensor,
    value_cache: &mut CacheTensor,
    k_dequant_scales: &mut ScaleTensor,
    v_dequant_scales: &mut ScaleTensor,
    slot_mapping: &SlotMapping,
    asm_layout: bool,
) -> Result<()> {
    expect_layout(key_cache, asm_layout)?;
    let kernel = kernel(CacheOp::ReshapeAndCacheWithPertokenQuant, key_cache)?;
    let kv_cache_dtype = match key_cache.dtype() {
        StorageDtype::Fp8E4m3 => KvCacheDtype::Fp8E4m3,
        StorageDtype::Fp8E5m2 => KvCacheDtype::Fp8E5m2,
        StorageDtype::Int8 => KvCacheDtype::Int8,
        other => {
            return Err(CacheError::DomainMismatch(format!(
                "per-token quantization cannot store into {other}"
            )))
        }
    };
    kernel.writer()?.write_tensors(
        key_cache,
        value_cache,
        Some((k_dequant_scales, v_dequant_scales)),
        &WriteRequest {
            key,
            value,
            slot_mapping,
            kv_cache_dtype,
            scales: WriteScales::PerToken,
        },
    )?;
    Ok(())
}

/// Quantize into or dequantize out of an fp8 cache tensor with one scale.
pub fn convert_fp8(dst: &mut CacheTensor, src: &CacheTensor, scale: f32, kv_cache_dtype: &str) -> Result<()> {
    let kv_cache_dtype: KvCacheDtype = kv_cache_dtype.parse()?;
    kernel(CacheOp::ConvertFp8, src)?;
    BlockMigrator::new().convert_fp8(dst, src, scale, kv_cache_dtype)
}

#[cfg(test)]
mod tests {
    use half::bf16;

    use super::*;
    use crate::cache::block::StorageDomain;
    use crate::cache::layout::{CacheGeometry, CacheRole};

    fn pair(dtype: StorageDtype, layout: CacheLayout) -> (CacheTensor, CacheTensor) {
        let g = CacheGeometry {
            num_blocks: 2,
            block_size: 16,
            num_kv_heads: 1,
            head_dim: 16,
        };
        (
            CacheTensor::new(CacheRole::Key, StorageDomain::Device, dtype, layout, g).unwrap(),
            CacheTensor::new(CacheRole::Value, StorageDomain::Device, dtype, layout, g).unwrap(),
        )
    }

    #[test]
    fn test_asm_flag_must_match_cache_layout() {
        let (mut k, mut v) = pair(StorageDtype::Bf16, CacheLayout::Standard);
        let x: Vec<bf16> = vec![bf16::ONE; 16];
        let slots = SlotMapping::new(vec![3]);
        let err = reshape_and_cache(&x, &x, &mut k, &mut v, &slots, "auto", 1.0, 1.0, true).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        reshape_and_cache(&x, &x, &mut k, &mut v, &slots, "auto", 1.0, 1.0, false).unwrap();
        assert_eq!(k.load(k.index(0, 3, 0, 5)), 1.0);
    }

    #[test]
    fn test_flash_writer_rejects_standard_cache() {
        let (mut k, mut v) = pair(StorageDtype::Bf16, CacheLayout::Standard);
        let x: Vec<bf16> = vec![bf16::ONE; 16];
        let slots = SlotMapping::new(vec![0]);
        let err = reshape_and_cache_flash(&x, &x, &mut k, &mut v, &slots, "auto", 1.0, 1.0).unwrap_err();
        assert_eq!(err.kind(), "unsupported");
    }

    #[test]
    fn test_unknown_dtype_string() {
        let (mut k, mut v) = pair(StorageDtype::Fp8E4m3, CacheLayout::Flash);
        let x = vec![0.5f32; 16];
        let slots = SlotMapping::new(vec![0]);
        let err = reshape_and_cache_flash(&x, &x, &mut k, &mut v, &slots, "fp4", 1.0, 1.0).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        reshape_and_cache_flash(&x, &x, &mut k, &mut v, &slots, "fp8", 1.0, 1.0).unwrap();
        assert_eq!(v.load(v.index(0, 0, 0, 0)), 0.5);
    }

    #[test]
    fn test_pertoken_quant_stores_scales() {
        let (mut k, mut v) = pair(StorageDtype::Int8, CacheLayout::Asm);
        let mut ks = ScaleTensor::new(1, 32);
        let mut vs = ScaleTensor::new(1, 32);
        let x: Vec<f32> = (0..16).map(|i| i as f32 - 8.0).collect();
        let slots = SlotMapping::new(vec![17]);
        reshape_and_cache_with_pertoken_quant(&x, &x, &mut k, &mut v, &mut ks, &mut vs, &slots, true)
            .unwrap();
        assert_eq!(ks.get(0, 17), 8.0 / 127.0);
        // The absmax element lands exactly on the int8 max.
        assert_eq!(k.load(k.index(1, 1, 0, 0)), -127.0);
    }
}
