//! Scheduler-level behaviour of the cache manager.

use std::sync::Arc;

use half::f16;

use paged_kv_cache::cache::block::StorageDomain;
use paged_kv_cache::cache::dtype::{KvCacheDtype, StorageDtype};
use paged_kv_cache::cache::layout::CacheLayout;
use paged_kv_cache::cache::manager::{new_shared_manager, CacheManager};
use paged_kv_cache::cache::writer::WriteScales;
use paged_kv_cache::config::{CacheConfig, EvictionConfig};
use paged_kv_cache::metrics::CacheMetrics;

fn config(cache_dtype: KvCacheDtype, layout: CacheLayout) -> CacheConfig {
    CacheConfig {
        block_size: 16,
        num_device_blocks: 4,
        num_host_blocks: 8,
        num_layers: 2,
        num_kv_heads: 2,
        head_dim: 16,
        max_seq_len: 64,
        cache_dtype,
        native_dtype: StorageDtype::F16,
        layout,
    }
}

fn manager(cache_dtype: KvCacheDtype, layout: CacheLayout) -> CacheManager {
    CacheManager::new(
        &config(cache_dtype, layout),
        EvictionConfig::default(),
        Arc::new(CacheMetrics::new().unwrap()),
    )
    .unwrap()
}

fn fill(m: &mut CacheManager, seq: u64, n: usize, seed: f32) -> Vec<f16> {
    let slots = m.reserve(seq, n).unwrap();
    let elems = n * m.device().geometry().token_elems();
    let data: Vec<f16> = (0..elems)
        .map(|i| f16::from_f32(((i as f32 + seed) * 0.13).cos()))
        .collect();
    for layer in 0..2 {
        m.write(seq, layer, &data, &data, &slots, WriteScales::PerTensor { k_scale: 1.0, v_scale: 1.0 })
            .unwrap();
    }
    data
}

#[test]
fn test_swap_round_trip_preserves_tokens() {
    for layout in [CacheLayout::Standard, CacheLayout::Asm] {
        let mut m = manager(KvCacheDtype::Auto, layout);
        let seq = m.add_sequence();
        let data = fill(&mut m, seq, 20, 0.0);
        let before: Vec<_> = (0..20).map(|p| m.read_token(seq, 1, p).unwrap()).collect();

        assert_eq!(m.swap_out(seq).unwrap(), 2);
        assert_eq!(m.residency(seq).unwrap(), StorageDomain::Host);
        assert_eq!(m.device().pool().free_count(), 4);

        // Occupy the old device blocks so the sequence comes back elsewhere.
        let other = m.add_sequence();
        fill(&mut m, other, 16, 5.0);

        m.swap_in(seq).unwrap();
        assert_eq!(m.residency(seq).unwrap(), StorageDomain::Device);
        assert_eq!(m.host().pool().free_count(), 8);
        for (p, want) in before.iter().enumerate() {
            assert_eq!(&m.read_token(seq, 1, p).unwrap(), want);
        }
        assert_eq!(before[3].0[0], data[3 * 32].to_f32());
    }
}

#[test]
fn test_fp8_writes_read_back_within_one_step() {
    let mut m = manager(KvCacheDtype::Fp8E4m3, CacheLayout::Standard);
    let seq = m.add_sequence();
    let slots = m.reserve(seq, 3).unwrap();
    let data: Vec<f16> = (0..3 * 32).map(|i| f16::from_f32(i as f32 * 0.05 - 2.0)).collect();
    let scale = 4.0 / 448.0;
    m.write(seq, 0, &data, &data, &slots, WriteScales::PerTensor { k_scale: scale, v_scale: scale })
        .unwrap();

    for p in 0..3 {
        let (k, _) = m.read_token(seq, 0, p).unwrap();
        for (i, got) in k.iter().enumerate() {
            let x = data[p * 32 + i].to_f32();
            let bound = scale
                * paged_kv_cache::cache::dtype::quantization_step(StorageDtype::Fp8E4m3, x.abs() / scale);
            assert!((got - x).abs() <= bound + 1e-6);
        }
    }

    // The layer is now bound to per-tensor scales.
    let next = m.reserve(seq, 1).unwrap();
    let token = vec![f16::ONE; 32];
    let err = m.write(seq, 0, &token, &token, &next, WriteScales::PerToken).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[test]
fn test_fork_diverges_on_partial_block() {
    let mut m = manager(KvCacheDtype::Auto, CacheLayout::Standard);
    let parent = m.add_sequence();
    fill(&mut m, parent, 20, 1.0);
    let child = m.fork_sequence(parent).unwrap();
    assert_eq!(m.device().pool().total_refcount(), 4);

    fill(&mut m, child, 1, 2.0);
    let (pb, cb) = (
        m.block_table(parent).unwrap().blocks().to_vec(),
        m.block_table(child).unwrap().blocks().to_vec(),
    );
    assert_eq!(pb[0], cb[0]);
    assert_ne!(pb[1], cb[1]);
    for p in 0..20 {
        assert_eq!(m.read_token(parent, 0, p).unwrap(), m.read_token(child, 0, p).unwrap());
    }

    m.free_sequence(parent).unwrap();
    m.free_sequence(child).unwrap();
    assert_eq!(m.device().pool().free_count(), 4);
    assert_eq!(m.device().pool().total_refcount(), 0);
}

#[test]
fn test_out_of_memory_is_pushed_back_then_eviction_makes_room() {
    let mut m = manager(KvCacheDtype::Auto, CacheLayout::Standard);
    let idle = m.add_sequence();
    fill(&mut m, idle, 48, 0.0);
    let busy = m.add_sequence();

    let err = m.reserve(busy, 20).unwrap_err();
    assert_eq!(err.kind(), "out_of_memory");
    assert!(m.block_table(busy).unwrap().is_empty());
    assert_eq!(m.device().pool().free_count(), 1);

    let evicted = m.evict_for(m.blocks_to_reserve(busy, 20).unwrap(), Some(busy)).unwrap();
    assert_eq!(evicted, vec![idle]);
    m.reserve(busy, 20).unwrap();
    assert_eq!(m.metrics().errors("out_of_memory"), 1);
}

#[test]
fn test_overflow_past_max_seq_len() {
    let mut m = manager(KvCacheDtype::Auto, CacheLayout::Standard);
    let seq = m.add_sequence();
    let err = m.reserve(seq, 65).unwrap_err();
    assert_eq!(err.kind(), "overflow");
    assert_eq!(m.device().pool().free_count(), 4);
}

#[tokio::test]
async fn test_shared_manager_across_tasks() {
    let shared = new_shared_manager(
        &config(KvCacheDtype::Auto, CacheLayout::Standard),
        EvictionConfig::default(),
        Arc::new(CacheMetrics::new().unwrap()),
    )
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            let mut m = shared.write().await;
            let seq = m.add_sequence();
            m.reserve(seq, 16).unwrap();
            seq
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let m = shared.read().await;
    assert_eq!(m.sequence_ids().len(), 4);
    assert_eq!(m.device().pool().free_count(), 0);
}
