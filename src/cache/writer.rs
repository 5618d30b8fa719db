//! Cache writer: scatters freshly computed K/V into the block store.
//!
//! For every token whose slot is not the discard sentinel, the destination is
//! `(slot / block_size, slot % block_size)`; the layout descriptor turns that
//! into element offsets. Quantized caches store `x / scale` encoded in the
//! narrow dtype, together with the scale (per-tensor on the layer, per-token
//! in the layer's scale tensors at the destination slot).
//!
//! All validation happens before the first element is stored, so a call
//! either fails untouched or writes every non-discarded token. Each token's
//! key, value, and scales are stored together.

use serde::Serialize;
use tracing::debug;

use crate::cache::block::{split_slot, SlotMapping};
use crate::cache::dtype::{absmax_scale, Element, KvCacheDtype};
use crate::cache::layout::{CacheLayout, CacheRole, LayoutDescriptor};
use crate::cache::store::{LayerCache, ScaleMode};
use crate::cache::tensor::{CacheTensor, ScaleTensor};
use crate::error::{CacheError, Result};

/// Where quantization scales come from for a write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteScales {
    /// Caller-supplied scalar scales (ignored for `auto` storage).
    PerTensor { k_scale: f32, v_scale: f32 },
    /// Computed per (token, head) from the data being written.
    PerToken,
}

/// One batched write of new tokens.
///
/// `key` and `value` are dense `[num_tokens, num_kv_heads, head_dim]`.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a, T: Element> {
    pub key: &'a [T],
    pub value: &'a [T],
    pub slot_mapping: &'a SlotMapping,
    pub kv_cache_dtype: KvCacheDtype,
    pub scales: WriteScales,
}

/// What a write did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub written: usize,
    pub discarded: usize,
}

/// Scatter writer specialised for one cache layout.
#[derive(Debug, Clone, Copy)]
pub struct CacheWriter {
    layout: CacheLayout,
    descriptor: &'static dyn LayoutDescriptor,
}

impl CacheWriter {
    pub fn for_layout(layout: CacheLayout) -> Self {
        Self {
            layout,
            descriptor: layout.descriptor(),
        }
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    /// Validate `req` against `layer` and store every non-discarded token.
    ///
    /// The layer's scale mode is bound by the first quantized write.
    pub fn write<T: Element>(
        &self,
        layer: &mut LayerCache,
        req: &WriteRequest<'_, T>,
    ) -> Result<WriteSummary> {
        let mode = self.validate(
            &layer.key,
            &layer.value,
            Some((&layer.k_scales, &layer.v_scales)),
            req,
        )?;
        layer.bind_scales(mode)?;
        Ok(self.scatter(
            &mut layer.key,
            &mut layer.value,
            Some((&mut layer.k_scales, &mut layer.v_scales)),
            mode,
            req,
        ))
    }

    /// Write into bare cache tensors. Per-token scales, if requested, go to
    /// `scales`; per-tensor scales are the caller's to keep.
    pub fn write_tensors<T: Element>(
        &self,
        key_cache: &mut CacheTensor,
        value_cache: &mut CacheTensor,
        scales: Option<(&mut ScaleTensor, &mut ScaleTensor)>,
        req: &WriteRequest<'_, T>,
    ) -> Result<WriteSummary> {
        let mode = self.validate(
            key_cache,
            value_cache,
            scales.as_ref().map(|(k, v)| (&**k, &**v)),
            req,
        )?;
        Ok(self.scatter(key_cache, value_cache, scales, mode, req))
    }

    fn scatter<T: Element>(
        &self,
        key_cache: &mut CacheTensor,
        value_cache: &mut CacheTensor,
        mut scales: Option<(&mut ScaleTensor, &mut ScaleTensor)>,
        mode: ScaleMode,
        req: &WriteRequest<'_, T>,
    ) -> WriteSummary {
        let g = *key_cache.geometry();
        let x = key_cache.pack_factor();
        let token_elems = g.token_elems();
        let dtype = key_cache.dtype();
        let quantized = dtype.is_quantized();

        let mut summary = WriteSummary::default();
        for token in 0..req.slot_mapping.len() {
            let Some(slot) = req.slot_mapping.get(token) else {
                summary.discarded += 1;
                continue;
            };
            let (block, offset) = split_slot(slot, g.block_size);
            let base = token * token_elems;

            for head in 0..g.num_kv_heads {
                let row = base + head * g.head_dim..base + (head + 1) * g.head_dim;
                let k_row = &req.key[row.clone()];
                let v_row = &req.value[row];

                let (k_scale, v_scale) = match (mode, scales.as_mut()) {
                    _ if !quantized => (1.0, 1.0),
                    (ScaleMode::PerToken, Some((k_scales, v_scales))) => {
                        let ks = absmax_scale(k_row.iter().map(|v| v.to_f32()), dtype);
                        let vs = absmax_scale(v_row.iter().map(|v| v.to_f32()), dtype);
                        k_scales.set(head, slot, ks);
                        v_scales.set(head, slot, vs);
                        (ks, vs)
                    }
                    (ScaleMode::PerTensor { k_scale, v_scale }, _) => (k_scale, v_scale),
                    _ => (1.0, 1.0),
                };

                for dim in 0..g.head_dim {
                    let k_idx = self.descriptor.offset(CacheRole::Key, &g, x, block, offset, head, dim);
                    let v_idx =
                        self.descriptor
                            .offset(CacheRole::Value, &g, x, block, offset, head, dim);
                    key_cache.store(k_idx, k_row[dim].to_f32() / k_scale);
                    value_cache.store(v_idx, v_row[dim].to_f32() / v_scale);
                }
            }
            summary.written += 1;
        }

        debug!(
            layout = %self.layout,
            dtype = %dtype,
            written = summary.written,
            discarded = summary.discarded,
            "Cache write"
        );
        summary
    }

    /// Every check that can fail, before anything is stored.
    fn validate<T: Element>(
        &self,
        key_cache: &CacheTensor,
        value_cache: &CacheTensor,
        scales: Option<(&ScaleTensor, &ScaleTensor)>,
        req: &WriteRequest<'_, T>,
    ) -> Result<ScaleMode> {
        if key_cache.layout() != self.layout || value_cache.layout() != self.layout {
            return Err(CacheError::InvalidArgument(format!(
                "cache layout is {}, writer expects {}",
                key_cache.layout(),
                self.layout
            )));
        }
        if key_cache.domain() != value_cache.domain() {
            return Err(CacheError::DomainMismatch(
                "key and value caches live in different domains".into(),
            ));
        }
        if key_cache.dtype() != value_cache.dtype()
            || key_cache.geometry() != value_cache.geometry()
        {
            return Err(CacheError::InvalidArgument(
                "key and value caches differ in dtype or geometry".into(),
            ));
        }

        let g = key_cache.geometry();
        let n = req.slot_mapping.len();
        let expected = n * g.token_elems();
        if req.key.len() != expected || req.value.len() != expected {
            return Err(CacheError::InvalidArgument(format!(
                "key/value have {}/{} elements, slot mapping of {n} tokens needs {expected}",
                req.key.len(),
                req.value.len()
            )));
        }

        let num_slots = g.num_slots();
        for i in 0..n {
            if let Some(slot) = req.slot_mapping.get(i) {
                if slot >= num_slots {
                    return Err(CacheError::OutOfRange {
                        position: slot,
                        length: num_slots,
                    });
                }
            }
        }

        let dtype = key_cache.dtype();
        match req.kv_cache_dtype.storage() {
            None if dtype.is_quantized() => {
                return Err(CacheError::DomainMismatch(format!(
                    "kv_cache_dtype auto cannot write into a {dtype} cache"
                )))
            }
            Some(expected) if expected != dtype => {
                return Err(CacheError::DomainMismatch(format!(
                    "kv_cache_dtype {} does not match {dtype} cache",
                    req.kv_cache_dtype
                )))
            }
            _ => {}
        }

        match req.scales {
            WriteScales::PerToken => {
                if !dtype.is_quantized() {
                    return Err(CacheError::DomainMismatch(format!(
                        "per-token quantization needs an fp8/int8 cache, got {dtype}"
                    )));
                }
                let Some((k_scales, v_scales)) = scales else {
                    return Err(CacheError::InvalidArgument(
                        "per-token quantization needs scale tensors".into(),
                    ));
                };
                for s in [k_scales, v_scales] {
                    if s.num_kv_heads() != g.num_kv_heads || s.num_slots() != num_slots {
                        return Err(CacheError::InvalidArgument(format!(
                            "scale tensor is [{}, {}], cache needs [{}, {num_slots}]",
                            s.num_kv_heads(),
                            s.num_slots(),
                            g.num_kv_heads
                        )));
                    }
                }
                Ok(ScaleMode::PerToken)
            }
            WriteScales::PerTensor { k_scale, v_scale } => {
                if dtype.is_quantized() {
                    for s in [k_scale, v_scale] {
                        if !(s.is_finite() && s > 0.0) {
                            return Err(CacheError::InvalidArgument(format!(
                                "quantization scale must be finite and positive, got {s}"
                            )));
                        }
                    }
                }
                Ok(ScaleMode::PerTensor { k_scale, v_scale })
            }
        }
    }
}
