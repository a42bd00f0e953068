//! Slot metadata for the KV cache.
//!
//! Every occupied arena slot carries one [`CacheBlockMeta`] describing which
//! (sequence position, layer, key-or-value) vector it holds and in which tier
//! the bytes currently live.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where a slot's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLocation {
    /// Raw bytes in the slot's arena region.
    Memory,
    /// Block-codec stream in the slot's arena region.
    Compressed,
    /// Raw bytes in a spill file.
    Disk,
}

impl CacheLocation {
    /// Numeric tier level (lower = faster to read back).
    pub fn level(&self) -> u8 {
        match self {
            CacheLocation::Memory => 0,
            CacheLocation::Compressed => 1,
            CacheLocation::Disk => 2,
        }
    }

    /// Whether the bytes occupy the slot's arena region.
    pub fn in_arena(&self) -> bool {
        !matches!(self, CacheLocation::Disk)
    }
}

impl std::fmt::Display for CacheLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLocation::Memory => write!(f, "MEMORY"),
            CacheLocation::Compressed => write!(f, "COMPRESSED"),
            CacheLocation::Disk => write!(f, "DISK"),
        }
    }
}

/// Identifies the vector held by a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub sequence_pos: u32,
    pub layer_id: u32,
    pub is_key: bool,
}

impl BlockKey {
    pub fn new(sequence_pos: u32, layer_id: u32, is_key: bool) -> Self {
        Self {
            sequence_pos,
            layer_id,
            is_key,
        }
    }

    /// `kv_cache_<seq>_<layer>_<k|v>.tmp`
    pub fn spill_file_name(&self) -> String {
        format!(
            "kv_cache_{}_{}_{}.tmp",
            self.sequence_pos,
            self.layer_id,
            if self.is_key { 'k' } else { 'v' }
        )
    }

    pub fn spill_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.spill_file_name())
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seq {} layer {} {}",
            self.sequence_pos,
            self.layer_id,
            if self.is_key { "key" } else { "value" }
        )
    }
}

/// Metadata of one occupied slot.
#[derive(Debug, Clone)]
pub struct CacheBlockMeta {
    pub key: BlockKey,

    pub location: CacheLocation,

    /// Bytes the slot occupies in its tier (codec stream length when compressed).
    pub stored_size: usize,

    /// Exact byte length of the original vector.
    pub original_size: usize,

    /// `original_size / stored_size`; 1.0 for raw tiers.
    pub compression_ratio: f32,

    /// Set while `location == Disk`.
    pub spill_path: Option<PathBuf>,

    /// Logical tick of the last store or retrieve.
    pub last_access: u64,
}

impl CacheBlockMeta {
    pub fn matches(&self, key: &BlockKey) -> bool {
        self.key == *key
    }

    /// Record an access.
    pub fn touch(&mut self, tick: u64) {
        self.last_access = tick;
    }
}
