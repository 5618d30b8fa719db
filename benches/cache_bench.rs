//! Benchmarks for the paged KV cache.

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use half::f16;

use paged_kv_cache::cache::block::{BlockMapping, SlotMapping, StorageDomain, SwapDirection};
use paged_kv_cache::cache::dtype::{KvCacheDtype, StorageDtype};
use paged_kv_cache::cache::evictor::{Evictor, SequenceUsage};
use paged_kv_cache::cache::layout::{CacheGeometry, CacheLayout};
use paged_kv_cache::cache::migrator::BlockMigrator;
use paged_kv_cache::cache::store::{BlockPool, BlockStore, StoreSpec};
use paged_kv_cache::cache::table::BlockTable;
use paged_kv_cache::cache::writer::{CacheWriter, WriteRequest, WriteScales};
use paged_kv_cache::config::EvictionConfig;

fn spec(domain: StorageDomain, dtype: StorageDtype, layout: CacheLayout) -> StoreSpec {
    StoreSpec {
        domain,
        geometry: CacheGeometry {
            num_blocks: 256,
            block_size: 16,
            num_kv_heads: 8,
            head_dim: 128,
        },
        num_layers: 1,
        dtype,
        layout,
    }
}

fn bench_pool_allocate_free(c: &mut Criterion) {
    let mut pool = BlockPool::new(StorageDomain::Device, 4096).unwrap();

    c.bench_function("pool_allocate_free_64", |b| {
        b.iter(|| {
            let ids = pool.allocate(black_box(64)).unwrap();
            for id in ids {
                pool.free(id).unwrap();
            }
        })
    });
}

fn bench_write(c: &mut Criterion) {
    let writer = CacheWriter::for_layout(CacheLayout::Standard);
    let tokens = 64;
    let elems = tokens * 8 * 128;
    let key: Vec<f16> = (0..elems).map(|i| f16::from_f32((i % 251) as f32 * 0.01)).collect();
    let slots = SlotMapping::new((0..tokens as i64).collect());

    for (name, dtype, kv, scales) in [
        ("write_64_tokens_f16", StorageDtype::F16, KvCacheDtype::Auto, WriteScales::PerTensor { k_scale: 1.0, v_scale: 1.0 }),
        ("write_64_tokens_fp8_per_token", StorageDtype::Fp8E4m3, KvCacheDtype::Fp8E4m3, WriteScales::PerToken),
    ] {
        let mut store = BlockStore::new(spec(StorageDomain::Device, dtype, CacheLayout::Standard)).unwrap();
        let request = WriteRequest {
            key: &key,
            value: &key,
            slot_mapping: &slots,
            kv_cache_dtype: kv,
            scales,
        };
        c.bench_function(name, |b| {
            b.iter(|| {
                let layer = store.layer_mut(0).unwrap();
                black_box(writer.write(layer, black_box(&request)).unwrap());
            })
        });
    }
}

fn bench_swap(c: &mut Criterion) {
    let device = BlockStore::new(spec(StorageDomain::Device, StorageDtype::F16, CacheLayout::Asm)).unwrap();
    let mut host = BlockStore::new(spec(StorageDomain::Host, StorageDtype::F16, CacheLayout::Asm)).unwrap();
    let mapping = BlockMapping::new((0..32).map(|i| (i, 255 - i)).collect()).unwrap();
    let mut migrator = BlockMigrator::new();

    c.bench_function("swap_out_32_blocks", |b| {
        b.iter(|| {
            black_box(
                migrator
                    .swap(&device, &mut host, &mapping, SwapDirection::DeviceToHost)
                    .unwrap(),
            );
        })
    });
}

fn bench_eviction_scoring(c: &mut Criterion) {
    let evictor = Evictor::new(EvictionConfig::default());
    let now = Instant::now();
    let usages: Vec<SequenceUsage> = (0..10_000u64)
        .map(|i| SequenceUsage {
            sequence_id: i,
            last_access: now.checked_sub(Duration::from_millis(i % 5_000)).unwrap_or(now),
            device_blocks: (i % 17) as usize + 1,
        })
        .collect();

    c.bench_function("eviction_select_100_blocks_from_10k", |b| {
        b.iter(|| {
            let victims = evictor.select_victims(black_box(usages.iter().copied()), 100, &[], now);
            black_box(victims);
        })
    });
}

fn bench_slot_lookup(c: &mut Criterion) {
    let mut table = BlockTable::new(16, 1 << 20);
    table.append(&(0..4096).collect::<Vec<_>>()).unwrap();
    table.advance(4096 * 16).unwrap();

    c.bench_function("slot_mapping_64k_positions", |b| {
        b.iter(|| black_box(table.slot_mapping(0..black_box(65_536)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_pool_allocate_free,
    bench_write,
    bench_swap,
    bench_eviction_scoring,
    bench_slot_lookup,
);
criterion_main!(benches);
