//! Eviction policy: decides which sequences to swap out to host memory.
//!
//! Uses a weighted scoring function combining:
//! - Time since the sequence was last touched (old → evictable)
//! - Device blocks it holds (large → frees more per swap)

use std::collections::BinaryHeap;
use std::time::Instant;

use crate::cache::manager::SequenceId;
use crate::config::EvictionConfig;

/// What the evictor needs to know about a device-resident sequence.
#[derive(Debug, Clone, Copy)]
pub struct SequenceUsage {
    pub sequence_id: SequenceId,
    pub last_access: Instant,
    pub device_blocks: usize,
}

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub sequence_id: SequenceId,
    pub score: f64,
    pub device_blocks: usize,
}

// Higher score = higher eviction priority (should be evicted first).
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.sequence_id == other.sequence_id
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            // Ties go to the older sequence id.
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Compute eviction priority for a single sequence.
    ///
    /// ```text
    /// eviction_priority(seq) =
    ///     idle_weight × seconds_since_last_access +
    ///     footprint_weight × device_blocks
    /// ```
    pub fn compute_priority(&self, usage: &SequenceUsage, now: Instant) -> f64 {
        let idle_secs = now.saturating_duration_since(usage.last_access).as_secs_f64();
        self.config.idle_weight * idle_secs + self.config.footprint_weight * usage.device_blocks as f64
    }

    /// Pick sequences to swap out until at least `blocks_needed` device
    /// blocks would be released.
    ///
    /// Returns candidates ordered by eviction priority (highest first).
    /// Sequences in `protected` (e.g. the one asking for room) are never
    /// chosen, nor are sequences holding no device blocks. If every eligible
    /// sequence together is not enough, all of them are returned.
    pub fn select_victims(
        &self,
        sequences: impl Iterator<Item = SequenceUsage>,
        blocks_needed: usize,
        protected: &[SequenceId],
        now: Instant,
    ) -> Vec<EvictionCandidate> {
        let mut heap = BinaryHeap::new();

        for usage in sequences {
            if usage.device_blocks == 0 || protected.contains(&usage.sequence_id) {
                continue;
            }
            heap.push(EvictionCandidate {
                sequence_id: usage.sequence_id,
                score: self.compute_priority(&usage, now),
                device_blocks: usage.device_blocks,
            });
        }

        let mut victims = Vec::new();
        let mut freed = 0;
        while freed < blocks_needed {
            let Some(candidate) = heap.pop() else {
                break;
            };
            freed += candidate.device_blocks;
            victims.push(candidate);
        }

        victims
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn usage(id: SequenceId, idle_secs: u64, blocks: usize, now: Instant) -> SequenceUsage {
        SequenceUsage {
            sequence_id: id,
            last_access: now - Duration::from_secs(idle_secs),
            device_blocks: blocks,
        }
    }

    #[test]
    fn test_eviction_prefers_idle_sequences() {
        let evictor = Evictor::new(EvictionConfig::default());
        let now = Instant::now() + Duration::from_secs(100);

        let sequences = vec![
            usage(0, 1, 2, now),
            usage(1, 60, 2, now), // idle longest → evicted first
            usage(2, 5, 2, now),
        ];

        let victims = evictor.select_victims(sequences.into_iter(), 1, &[], now);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].sequence_id, 1);
    }

    #[test]
    fn test_selects_until_enough_blocks() {
        let evictor = Evictor::new(EvictionConfig::default());
        let now = Instant::now() + Duration::from_secs(100);

        let sequences = vec![
            usage(0, 30, 1, now),
            usage(1, 20, 1, now),
            usage(2, 10, 1, now),
        ];
        let victims = evictor.select_victims(sequences.into_iter(), 2, &[], now);
        let ids: Vec<_> = victims.iter().map(|v| v.sequence_id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_protected_and_empty_sequences_excluded() {
        let evictor = Evictor::new(EvictionConfig::default());
        let now = Instant::now() + Duration::from_secs(100);

        let sequences = vec![usage(0, 90, 4, now), usage(1, 50, 0, now), usage(2, 10, 1, now)];

        let victims = evictor.select_victims(sequences.into_iter(), 8, &[0], now);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].sequence_id, 2);
    }
}
