//! Runtime configuration for paged-kv-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizes, tensor geometry, storage dtype and layout, eviction weights and
//! the synthetic workload all live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::block::{BlockId, StorageDomain};
use crate::cache::dtype::{KvCacheDtype, StorageDtype};
use crate::cache::layout::{CacheGeometry, CacheLayout};
use crate::cache::store::StoreSpec;
use crate::error::CacheError;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "paged-kv-cache", about = "Paged KV-cache manager with an admin HTTP surface")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of synthetic scheduler steps to run (0 = serve an idle cache).
    #[arg(long, default_value_t = 0)]
    pub steps: u64,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Block pools and tensor shapes.
    pub cache: CacheConfig,

    /// Eviction policy tuning.
    pub eviction: EvictionConfig,

    /// Synthetic workload.
    pub simulation: SimulationConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Cache geometry, pool sizes and storage encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Token slots per block.
    pub block_size: usize,

    /// Blocks in the device pool.
    pub num_device_blocks: usize,

    /// Blocks in the host (swap) pool.
    pub num_host_blocks: usize,

    /// Number of transformer layers.
    pub num_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub num_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Longest sequence a block table may describe.
    pub max_seq_len: usize,

    /// Storage mode: "auto" keeps `native_dtype`, otherwise fp8/int8.
    pub cache_dtype: KvCacheDtype,

    /// Dtype K/V arrive in from the model.
    pub native_dtype: StorageDtype,

    /// Physical tensor layout.
    pub layout: CacheLayout,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_device_blocks: 256,
            num_host_blocks: 512,
            num_layers: 4,
            num_kv_heads: 8,
            head_dim: 128,
            max_seq_len: 4096,
            cache_dtype: KvCacheDtype::Auto,
            native_dtype: StorageDtype::F16,
            layout: CacheLayout::Standard,
        }
    }
}

impl CacheConfig {
    /// The dtype blocks are actually stored in.
    pub fn storage_dtype(&self) -> StorageDtype {
        self.cache_dtype.resolve(self.native_dtype)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let sizes = [
            ("block_size", self.block_size),
            ("num_device_blocks", self.num_device_blocks),
            ("num_layers", self.num_layers),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("max_seq_len", self.max_seq_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(CacheError::InvalidArgument(format!("{name} must be non-zero")));
            }
        }
        for (name, value) in [
            ("num_device_blocks", self.num_device_blocks),
            ("num_host_blocks", self.num_host_blocks),
        ] {
            if BlockId::try_from(value).is_err() {
                return Err(CacheError::InvalidArgument(format!(
                    "{name} must fit in a block id, got {value}"
                )));
            }
        }
        if self.native_dtype.is_quantized() {
            return Err(CacheError::InvalidArgument(format!(
                "native_dtype must be f32, f16 or bf16, got {}",
                self.native_dtype
            )));
        }
        let geometry = self.geometry(StorageDomain::Device);
        self.layout
            .descriptor()
            .validate(&geometry, self.storage_dtype())
    }

    /// Tensor geometry of the pool in `domain`.
    pub fn geometry(&self, domain: StorageDomain) -> CacheGeometry {
        CacheGeometry {
            num_blocks: match domain {
                StorageDomain::Device => self.num_device_blocks,
                StorageDomain::Host => self.num_host_blocks,
            },
            block_size: self.block_size,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
        }
    }

    pub fn store_spec(&self, domain: StorageDomain) -> StoreSpec {
        StoreSpec {
            domain,
            geometry: self.geometry(domain),
            num_layers: self.num_layers,
            dtype: self.storage_dtype(),
            layout: self.layout,
        }
    }

    /// Size of a single block in bytes (K and V, all layers, storage dtype).
    pub fn kv_block_bytes(&self) -> usize {
        let per_layer = self.block_size
            * self.num_kv_heads
            * self.head_dim
            * self.storage_dtype().element_bytes()
            * 2;
        per_layer * self.num_layers
    }

    /// How many blocks fit in a given byte budget.
    pub fn blocks_for_budget(&self, budget_bytes: usize) -> usize {
        let block_bytes = self.kv_block_bytes();
        if block_bytes == 0 {
            return 0;
        }
        budget_bytes / block_bytes
    }

    /// How many tokens fit in a given byte budget.
    pub fn tokens_for_budget(&self, budget_bytes: usize) -> usize {
        self.blocks_for_budget(budget_bytes) * self.block_size
    }
}

/// Eviction policy weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Weight for seconds since the sequence was last touched.
    pub idle_weight: f64,

    /// Weight for the number of device blocks a sequence holds.
    pub footprint_weight: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_weight: 1.0,
            footprint_weight: 0.1,
        }
    }
}

/// Synthetic scheduler workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// RNG seed; the same seed replays the same workload.
    pub seed: u64,

    /// Sequences decoded concurrently.
    pub max_running: usize,

    /// Prompt length range (inclusive).
    pub min_prompt_len: usize,
    pub max_prompt_len: usize,

    /// Tokens generated per sequence before it completes.
    pub decode_len: usize,

    /// Chance per step that a running sequence forks a beam.
    pub fork_probability: f64,

    /// Chance per step that a sequence rolls back a speculative token.
    pub rollback_probability: f64,

    /// Delay between steps.
    pub step_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_running: 8,
            min_prompt_len: 8,
            max_prompt_len: 96,
            decode_len: 64,
            fork_probability: 0.02,
            rollback_probability: 0.05,
            step_interval_ms: 10,
        }
    }
}

impl SimulationConfig {
    /// Check the workload can run against sequences of at most `max_seq_len` tokens.
    pub fn validate(&self, max_seq_len: usize) -> crate::Result<()> {
        if max_seq_len < 2 {
            return Err(CacheError::InvalidArgument(
                "simulation needs max_seq_len of at least 2".into(),
            ));
        }
        if self.max_prompt_len == 0 || self.min_prompt_len > self.max_prompt_len {
            return Err(CacheError::InvalidArgument(format!(
                "invalid prompt length range {}..={}",
                self.min_prompt_len, self.max_prompt_len
            )));
        }
        for (name, p) in [
            ("fork_probability", self.fork_probability),
            ("rollback_probability", self.rollback_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(CacheError::InvalidArgument(format!(
                    "{name} must be within [0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.cache.validate()?;
        config.simulation.validate(config.cache.max_seq_len)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.block_size, 16);
        assert_eq!(cfg.cache.storage_dtype(), StorageDtype::F16);
        cfg.cache.validate().unwrap();
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_validate_rejects_pool_beyond_block_ids() {
        let cfg = CacheConfig {
            num_host_blocks: BlockId::MAX as usize + 1,
            ..CacheConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(err.to_string().contains("num_host_blocks"));
    }

    #[test]
    fn test_simulation_validate() {
        let sim = SimulationConfig::default();
        sim.validate(4096).unwrap();
        assert!(sim.validate(1).is_err());

        let bad = SimulationConfig {
            fork_probability: 1.5,
            ..SimulationConfig::default()
        };
        assert!(bad.validate(4096).is_err());

        let bad = SimulationConfig {
            min_prompt_len: 10,
            max_prompt_len: 4,
            ..SimulationConfig::default()
        };
        assert!(bad.validate(4096).is_err());
    }

    #[test]
    fn test_kv_block_bytes() {
        let cfg = CacheConfig::default();
        // block_size(16) * n_kv_heads(8) * head_dim(128) * 2(fp16) * 2(K+V) * n_layers(4)
        let expected = 16 * 8 * 128 * 2 * 2 * 4;
        assert_eq!(cfg.kv_block_bytes(), expected);
        assert_eq!(cfg.blocks_for_budget(expected * 3 + 1), 3);
        assert_eq!(cfg.tokens_for_budget(expected * 3), 48);

        let fp8 = CacheConfig {
            cache_dtype: KvCacheDtype::Fp8E4m3,
            ..CacheConfig::default()
        };
        assert_eq!(fp8.kv_block_bytes(), expected / 2);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let cfg = CacheConfig {
            block_size: 0,
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_err());

        // fp8 packs 16 elements per tile; asm needs block_size divisible by it.
        let cfg = CacheConfig {
            cache_dtype: KvCacheDtype::Fp8E4m3,
            layout: CacheLayout::Asm,
            block_size: 8,
            ..CacheConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), "invalid_argument");

        let cfg = CacheConfig {
            native_dtype: StorageDtype::Int8,
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cache": {{"num_device_blocks": 32, "cache_dtype": "fp8", "layout": "flash"}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.cache.num_device_blocks, 32);
        assert_eq!(cfg.cache.storage_dtype(), StorageDtype::Fp8E4m3);
        assert_eq!(cfg.cache.layout, CacheLayout::Flash);
        assert_eq!(cfg.cache.num_host_blocks, 512);
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.cache.num_device_blocks, 256);
    }
}
