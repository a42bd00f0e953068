//! Runtime configuration for lowmem-llm.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every subsystem knob (page table size, codec limits, KV slot count, training
//! precision policy) lives here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::quant::mixed_precision::MixedPrecisionConfig;
use crate::quant::qat::QatConfig;
use crate::quant::state_file::SaveOptions;
use crate::quant::QuantConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "lowmem-llm", about = "Paged weight store and tiered KV cache tooling")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream a weight file into the paged store and flush every page to swap.
    PackWeights {
        /// Weight file (MLLM format).
        path: PathBuf,
    },
    /// Print the tensor shapes stored in a weight file.
    InspectWeights {
        /// Weight file (MLLM format).
        path: PathBuf,
    },
    /// Check magic, version, and checksums of a saved training state file.
    VerifyState {
        /// State file (MPST or QATS container).
        path: PathBuf,
    },
    /// Print the effective configuration (file merged over defaults) and the
    /// memory each subsystem will reserve.
    ShowConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block codec limits.
    pub codec: CodecConfig,

    /// Paged weight store.
    pub store: StoreConfig,

    /// Slot-based KV cache.
    pub kv_cache: KvCacheConfig,

    /// Per-layer KV cache with disk offload.
    pub layer_cache: LayerCacheConfig,

    /// Default quantization settings for weights.
    pub quant: QuantConfig,

    /// Mixed-precision training policy.
    pub mixed_precision: MixedPrecisionConfig,

    /// Quantization-aware training policy.
    pub qat: QatConfig,

    /// Training state file options.
    pub state_file: SaveOptions,
}

/// Block codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Shortest byte sequence registered in the pattern dictionary.
    pub min_pattern_length: usize,

    /// Longest byte sequence a single reference may cover (at most 65535).
    pub max_pattern_length: usize,

    /// Dictionary stops growing once it holds this many patterns.
    pub max_patterns: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            min_pattern_length: 4,
            max_pattern_length: 1024,
            max_patterns: 256 * 1024,
        }
    }
}

/// Paged weight store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bytes per page.
    pub page_size: usize,

    /// Maximum resident pages before eviction kicks in.
    pub max_active_pages: usize,

    /// Directory holding `weight_page<id>.bin` swap files.
    pub swap_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * 1024,
            max_active_pages: 1024,
            swap_dir: PathBuf::from("weight_cache"),
        }
    }
}

/// How a full KV cache picks the slot to overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Overwrite slot `total_tokens_processed % total_blocks`.
    #[default]
    TokenModulo,
    /// Overwrite the slot with the oldest store/retrieve access.
    LeastRecentlyUsed,
}

/// Slot-based KV cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    /// Bytes per arena slot (at most 65535).
    pub block_size: usize,

    /// Number of arena slots.
    pub max_blocks: usize,

    /// Directory for spilled slots.
    pub spill_dir: PathBuf,

    /// Replacement policy once every slot is in use.
    pub slot_policy: SlotPolicy,

    /// Keep vectors the codec cannot fit as raw bytes in their slot when they
    /// fit, instead of spilling them to disk.
    #[serde(default)]
    pub raw_in_arena: bool,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            max_blocks: 4,
            spill_dir: PathBuf::from("."),
            slot_policy: SlotPolicy::TokenModulo,
            raw_in_arena: false,
        }
    }
}

/// Per-layer KV cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerCacheConfig {
    /// Maximum tokens held per layer.
    pub max_seq_length: usize,

    /// Number of transformer layers.
    pub num_layers: usize,

    /// Attention heads per layer.
    pub num_heads: usize,

    /// Dimension of each head.
    pub head_dim: usize,

    /// Directory for `layer_<idx>_kv_cache.bin` offload files.
    pub offload_dir: PathBuf,
}

impl Default for LayerCacheConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 2048,
            num_layers: 32,
            num_heads: 32,
            head_dim: 128,
            offload_dir: PathBuf::from("kv_offload"),
        }
    }
}

impl KvCacheConfig {
    /// `block_size * max_blocks`, or `None` on overflow.
    pub fn arena_bytes(&self) -> Option<usize> {
        self.block_size.checked_mul(self.max_blocks)
    }
}

impl LayerCacheConfig {
    /// Floats in one token's key (or value) row.
    pub fn row_len(&self) -> usize {
        self.num_heads.saturating_mul(self.head_dim)
    }

    /// Bytes needed for one layer's keys and values at full length.
    pub fn layer_bytes(&self) -> Option<usize> {
        self.max_seq_length
            .checked_mul(self.row_len())?
            .checked_mul(std::mem::size_of::<f32>() * 2)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Upper bound on resident weight bytes.
    pub fn resident_weight_bytes(&self) -> Option<usize> {
        self.store.page_size.checked_mul(self.store.max_active_pages)
    }

    /// Size of the KV cache's in-memory arena.
    pub fn kv_arena_bytes(&self) -> Option<usize> {
        self.kv_cache.arena_bytes()
    }

    /// Bytes the per-layer cache holds with every layer at full length.
    pub fn layer_cache_bytes(&self) -> Option<usize> {
        self.layer_cache
            .layer_bytes()?
            .checked_mul(self.layer_cache.num_layers)
    }
}
