//! Synthetic scheduler workload.
//!
//! Drives a [`CacheManager`] the way a serving scheduler would:
//! 1. Admits new sequences and prefills their prompts
//! 2. Decodes one token per running sequence per step
//! 3. Forks beams and rolls back speculative tokens at random
//! 4. Evicts idle sequences to host memory when the device pool runs out,
//!    and swaps them back in when room frees up
//! 5. Streams per-step events through a channel
//!
//! K/V contents come from a seeded ChaCha RNG, so a seed replays the same
//! workload.

use std::time::Duration;

use half::{bf16, f16};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::block::{SlotMapping, StorageDomain};
use crate::cache::dtype::{Element, StorageDtype};
use crate::cache::manager::{CacheManager, SequenceId, SharedCacheManager};
use crate::cache::writer::WriteScales;
use crate::config::SimulationConfig;
use crate::error::{CacheError, Result};

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    pub steps: u64,
    pub sequences_started: u64,
    pub sequences_completed: u64,
    pub sequences_rejected: u64,
    pub forks: u64,
    pub rollbacks: u64,
    pub evictions: u64,
    pub swap_ins: u64,
    pub stalls: u64,
    pub tokens_written: u64,
}

/// Progress events.
#[derive(Debug, Clone)]
pub enum SimulationEvent {
    Step { step: u64, running: usize },
    Done(SimulationStats),
    Error(String),
}

#[derive(Debug, Clone)]
struct Running {
    sequence_id: SequenceId,
    remaining: usize,
}

pub struct Simulation {
    manager: SharedCacheManager,
    config: SimulationConfig,
    native_dtype: StorageDtype,
    max_seq_len: usize,
    rng: ChaCha8Rng,
    running: Vec<Running>,
    stats: SimulationStats,
}

impl Simulation {
    pub fn new(
        manager: SharedCacheManager,
        config: SimulationConfig,
        native_dtype: StorageDtype,
        max_seq_len: usize,
    ) -> Self {
        Self {
            manager,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            native_dtype,
            max_seq_len,
            running: Vec::new(),
            stats: SimulationStats::default(),
        }
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Run `steps` scheduler steps in the background, streaming events.
    pub fn spawn(mut self, steps: u64) -> mpsc::Receiver<SimulationEvent> {
        let (tx, rx) = mpsc::channel(32);
        let interval = Duration::from_millis(self.config.step_interval_ms);

        tokio::spawn(async move {
            info!(steps, seed = self.config.seed, "Starting simulation");

            for _ in 0..steps {
                if let Err(e) = self.step().await {
                    warn!("Simulation step failed: {e}");
                    let _ = tx.send(SimulationEvent::Error(e.to_string())).await;
                    return;
                }
                let event = SimulationEvent::Step {
                    step: self.stats.steps,
                    running: self.running.len(),
                };
                if tx.send(event).await.is_err() {
                    // Receiver dropped, stop stepping.
                    break;
                }
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }

            info!(
                steps = self.stats.steps,
                completed = self.stats.sequences_completed,
                evictions = self.stats.evictions,
                "Simulation complete"
            );
            let _ = tx.send(SimulationEvent::Done(self.stats.clone())).await;
        });

        rx
    }

    /// One scheduler step: admit, decode, fork, roll back, complete.
    pub async fn step(&mut self) -> Result<()> {
        let manager = self.manager.clone();
        let mut m = manager.write().await;

        self.admit(&mut m)?;

        let mut forked = Vec::new();
        let mut finished = Vec::new();
        for i in 0..self.running.len() {
            let seq = self.running[i].sequence_id;

            if m.residency(seq)? == StorageDomain::Host {
                let needed = m.block_table(seq)?.num_blocks() + 1;
                if m.device().pool().free_count() < needed {
                    self.stats.stalls += 1;
                    continue;
                }
                m.swap_in(seq)?;
                self.stats.swap_ins += 1;
            }

            let Some(slots) = self.reserve(&mut m, seq, 1)? else {
                self.stats.stalls += 1;
                continue;
            };
            self.write_tokens(&mut m, seq, &slots)?;
            self.running[i].remaining -= 1;

            let len = m.block_table(seq)?.len();
            if len > 1 && self.rng.gen_bool(self.config.rollback_probability) {
                m.truncate(seq, len - 1)?;
                self.running[i].remaining += 1;
                self.stats.rollbacks += 1;
            }

            if self.running[i].remaining == 0 {
                finished.push(i);
            } else if self.rng.gen_bool(self.config.fork_probability) {
                let child = m.fork_sequence(seq)?;
                self.stats.forks += 1;
                forked.push(Running {
                    sequence_id: child,
                    remaining: self.running[i].remaining,
                });
            }
        }

        for &i in finished.iter().rev() {
            let done = self.running.swap_remove(i);
            m.free_sequence(done.sequence_id)?;
            self.stats.sequences_completed += 1;
        }
        self.running.extend(forked);
        self.stats.steps += 1;

        debug!(
            step = self.stats.steps,
            running = self.running.len(),
            free = m.device().pool().free_count(),
            "Simulation step"
        );
        Ok(())
    }

    fn admit(&mut self, m: &mut CacheManager) -> Result<()> {
        while self.running.len() < self.config.max_running {
            let max_prompt = self.config.max_prompt_len.min(self.max_seq_len - 1);
            let min_prompt = self.config.min_prompt_len.clamp(1, max_prompt);
            let prompt_len = self.rng.gen_range(min_prompt..=max_prompt);
            let remaining = self.config.decode_len.clamp(1, self.max_seq_len - prompt_len);

            let seq = m.add_sequence();
            let Some(slots) = self.reserve(m, seq, prompt_len)? else {
                m.free_sequence(seq)?;
                self.stats.sequences_rejected += 1;
                break;
            };
            self.write_tokens(m, seq, &slots)?;
            self.running.push(Running {
                sequence_id: seq,
                remaining,
            });
            self.stats.sequences_started += 1;
        }
        Ok(())
    }

    /// Reserve, evicting other sequences and retrying once on `OutOfMemory`.
    /// `None` means the device pool cannot make room right now.
    fn reserve(&mut self, m: &mut CacheManager, seq: SequenceId, n: usize) -> Result<Option<SlotMapping>> {
        match m.reserve(seq, n) {
            Ok(slots) => Ok(Some(slots)),
            Err(CacheError::OutOfMemory { .. }) => {
                let needed = m.blocks_to_reserve(seq, n)?;
                match m.evict_for(needed, Some(seq)) {
                    Ok(evicted) => {
                        self.stats.evictions += evicted.len() as u64;
                        m.reserve(seq, n).map(Some)
                    }
                    Err(CacheError::OutOfMemory { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn write_tokens(&mut self, m: &mut CacheManager, seq: SequenceId, slots: &SlotMapping) -> Result<()> {
        match self.native_dtype {
            StorageDtype::F32 => self.write_as::<f32>(m, seq, slots),
            StorageDtype::F16 => self.write_as::<f16>(m, seq, slots),
            StorageDtype::Bf16 => self.write_as::<bf16>(m, seq, slots),
            other => Err(CacheError::InvalidArgument(format!(
                "model dtype must be f32, f16 or bf16, got {other}"
            ))),
        }
    }

    fn write_as<T: Element>(&mut self, m: &mut CacheManager, seq: SequenceId, slots: &SlotMapping) -> Result<()> {
        let geometry = *m.device().geometry();
        let dtype = m.device().spec().dtype;
        let scales = if dtype.is_quantized() {
            let s = 1.0 / dtype.max_value();
            WriteScales::PerTensor { k_scale: s, v_scale: s }
        } else {
            WriteScales::PerTensor { k_scale: 1.0, v_scale: 1.0 }
        };

        let n = slots.len() * geometry.token_elems();
        for layer in 0..m.device().layers().len() {
            let key: Vec<T> = (0..n).map(|_| T::from_f32(self.rng.gen_range(-1.0..1.0))).collect();
            let value: Vec<T> = (0..n).map(|_| T::from_f32(self.rng.gen_range(-1.0..1.0))).collect();
            let summary = m.write(seq, layer, &key, &value, slots, scales)?;
            self.stats.tokens_written += summary.written as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::dtype::KvCacheDtype;
    use crate::cache::layout::CacheLayout;
    use crate::cache::manager::new_shared_manager;
    use crate::config::{CacheConfig, EvictionConfig};
    use crate::metrics::CacheMetrics;

    fn cache_config(device: usize, host: usize, cache_dtype: KvCacheDtype) -> CacheConfig {
        CacheConfig {
            block_size: 16,
            num_device_blocks: device,
            num_host_blocks: host,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 16,
            max_seq_len: 256,
            cache_dtype,
            native_dtype: StorageDtype::F16,
            layout: CacheLayout::Standard,
        }
    }

    fn sim_config(seed: u64, fork_probability: f64) -> SimulationConfig {
        SimulationConfig {
            seed,
            max_running: 6,
            min_prompt_len: 8,
            max_prompt_len: 40,
            decode_len: 64,
            fork_probability,
            rollback_probability: 0.1,
            step_interval_ms: 0,
        }
    }

    fn simulation(cache: CacheConfig, sim: SimulationConfig) -> Simulation {
        let manager = new_shared_manager(
            &cache,
            EvictionConfig::default(),
            Arc::new(CacheMetrics::new().unwrap()),
        )
        .unwrap();
        Simulation::new(manager, sim, cache.native_dtype, cache.max_seq_len)
    }

    /// Every reference held by a block table is counted exactly once.
    async fn assert_refcounts_match_tables(sim: &Simulation) {
        let m = sim.manager.read().await;
        let mut device_refs = 0u64;
        let mut host_refs = 0u64;
        for seq in m.sequence_ids() {
            let blocks = m.block_table(seq).unwrap().num_blocks() as u64;
            match m.residency(seq).unwrap() {
                StorageDomain::Device => device_refs += blocks,
                StorageDomain::Host => host_refs += blocks,
            }
        }
        assert_eq!(m.device().pool().total_refcount(), device_refs);
        assert_eq!(m.host().pool().total_refcount(), host_refs);
    }

    #[tokio::test]
    async fn test_same_seed_replays_same_workload() {
        let mut a = simulation(cache_config(512, 0, KvCacheDtype::Auto), sim_config(7, 0.05));
        let mut b = simulation(cache_config(512, 0, KvCacheDtype::Auto), sim_config(7, 0.05));
        for _ in 0..50 {
            a.step().await.unwrap();
            b.step().await.unwrap();
        }
        assert_eq!(a.stats(), b.stats());
        assert!(a.stats().tokens_written > 0);
        assert_refcounts_match_tables(&a).await;
    }

    #[tokio::test]
    async fn test_pressure_triggers_eviction() {
        let sim_config = SimulationConfig {
            decode_len: 16,
            ..sim_config(3, 0.0)
        };
        let mut sim = simulation(cache_config(8, 128, KvCacheDtype::Fp8E4m3), sim_config);
        for _ in 0..300 {
            sim.step().await.unwrap();
            assert_refcounts_match_tables(&sim).await;
        }
        assert!(sim.stats().evictions > 0);
        assert!(sim.stats().sequences_completed > 0);
    }

    #[tokio::test]
    async fn test_spawn_streams_events() {
        let sim = simulation(cache_config(64, 64, KvCacheDtype::Auto), sim_config(1, 0.0));
        let mut rx = sim.spawn(5);

        let mut steps = 0;
        let mut done = None;
        while let Some(event) = rx.recv().await {
            match event {
                SimulationEvent::Step { .. } => steps += 1,
                SimulationEvent::Done(stats) => done = Some(stats),
                SimulationEvent::Error(e) => panic!("Unexpected error: {e}"),
            }
        }
        assert_eq!(steps, 5);
        assert_eq!(done.unwrap().steps, 5);
    }
}
