//! Fixed-slot, three-tier KV cache.
//!
//! The cache owns one contiguous arena of `block_size * max_blocks` bytes.
//! Each stored key or value vector lands in one slot. A block-codec stream
//! that fits the slot region stays there (`Compressed`); anything else is
//! written raw to a spill file under `spill_dir` (`Disk`). With
//! `raw_in_arena` set, raw bytes that fit the slot stay in the arena
//! (`Memory`) instead of spilling.
//!
//! The cache is best-effort: [`KvCache::store`] and [`KvCache::retrieve_into`]
//! report failure as `false` and callers treat that as "data unavailable".
//! The `try_` variants expose the underlying error.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::block::{BlockKey, CacheBlockMeta, CacheLocation};
use crate::cache::evictor::Evictor;
use crate::codec::{CodecError, CompressContext};
use crate::config::{CodecConfig, KvCacheConfig};
use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum KvCacheError {
    #[error("Out of memory allocating {size} bytes of cache storage")]
    OutOfMemory { size: usize },

    #[error("Invalid KV cache configuration: {0}")]
    InvalidConfig(String),

    #[error("Spill I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Cannot store an empty vector")]
    EmptyInput,

    #[error("No cached vector for {0}")]
    NotFound(BlockKey),

    #[error("Output holds {capacity} bytes, cached vector needs {needed}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Cached vector for {key} is corrupt: {reason}")]
    CorruptData { key: BlockKey, reason: String },

    #[error("Blocking worker failed: {0}")]
    Worker(String),
}

impl KvCacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvCacheError::OutOfMemory { .. } | KvCacheError::BufferTooSmall { .. } => {
                ErrorKind::Allocation
            }
            KvCacheError::Io(_) | KvCacheError::Worker(_) => ErrorKind::Io,
            KvCacheError::Codec(e) => e.kind(),
            KvCacheError::CorruptData { .. } => ErrorKind::CorruptData,
            KvCacheError::InvalidConfig(_)
            | KvCacheError::EmptyInput
            | KvCacheError::NotFound(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct KvCacheStats {
    pub stores: u64,
    pub compressed_stores: u64,
    pub memory_stores: u64,
    pub spills: u64,
    pub retrieves: u64,
    pub misses: u64,
    /// Stores that replaced another vector's slot.
    pub overwrites: u64,
}

pub struct KvCache {
    config: KvCacheConfig,

    /// One entry per arena slot; `None` means unused.
    slots: Vec<Option<CacheBlockMeta>>,

    arena: Vec<u8>,

    /// Codec session private to this cache.
    codec: CompressContext,

    evictor: Evictor,

    total_tokens_processed: u64,

    /// Running mean of per-store compression ratios.
    avg_compression_ratio: f64,

    /// Logical clock for slot accesses.
    clock: u64,

    stats: KvCacheStats,
}

impl KvCache {
    pub fn new(config: KvCacheConfig, codec: CodecConfig) -> Result<Self, KvCacheError> {
        if config.block_size == 0 || config.block_size > u16::MAX as usize {
            return Err(KvCacheError::InvalidConfig(format!(
                "block_size must be in 1..=65535, got {}",
                config.block_size
            )));
        }
        if config.max_blocks == 0 {
            return Err(KvCacheError::InvalidConfig(
                "max_blocks must be non-zero".into(),
            ));
        }

        let size = config.arena_bytes().ok_or_else(|| {
            KvCacheError::InvalidConfig(format!(
                "{} blocks of {} bytes overflow the address space",
                config.max_blocks, config.block_size
            ))
        })?;
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(size)
            .map_err(|_| KvCacheError::OutOfMemory { size })?;
        arena.resize(size, 0);

        let mut slots = Vec::new();
        slots.try_reserve_exact(config.max_blocks).map_err(|_| KvCacheError::OutOfMemory {
            size: config
                .max_blocks
                .saturating_mul(std::mem::size_of::<Option<CacheBlockMeta>>()),
        })?;
        slots.resize(config.max_blocks, None);

        std::fs::create_dir_all(&config.spill_dir)?;

        info!(
            block_size = config.block_size,
            max_blocks = config.max_blocks,
            policy = ?config.slot_policy,
            spill_dir = %config.spill_dir.display(),
            "KV cache initialised"
        );

        Ok(Self {
            slots,
            arena,
            codec: CompressContext::new(codec)?,
            evictor: Evictor::new(config.slot_policy),
            total_tokens_processed: 0,
            avg_compression_ratio: 1.0,
            clock: 0,
            stats: KvCacheStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &KvCacheStats {
        &self.stats
    }

    pub fn total_blocks(&self) -> usize {
        self.slots.len()
    }

    pub fn total_tokens_processed(&self) -> u64 {
        self.total_tokens_processed
    }

    pub fn avg_compression_ratio(&self) -> f64 {
        self.avg_compression_ratio
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Metadata of the slot holding `key`, if any.
    pub fn lookup(&self, seq_pos: u32, layer_id: u32, is_key: bool) -> Option<&CacheBlockMeta> {
        let key = BlockKey::new(seq_pos, layer_id, is_key);
        self.find(&key).and_then(|i| self.slots[i].as_ref())
    }

    /// Metadata of every slot, in arena order.
    pub fn slots(&self) -> &[Option<CacheBlockMeta>] {
        &self.slots
    }

    /// Store a vector, returning whether it was cached.
    pub fn store(&mut self, data: &[f32], seq_pos: u32, layer_id: u32, is_key: bool) -> bool {
        match self.try_store(data, seq_pos, layer_id, is_key) {
            Ok(_) => true,
            Err(e) => {
                warn!(seq_pos, layer_id, is_key, error = %e, "KV store failed");
                false
            }
        }
    }

    /// Store a vector, returning the tier it landed in.
    ///
    /// A vector already cached under the same triple is replaced in place.
    pub fn try_store(
        &mut self,
        data: &[f32],
        seq_pos: u32,
        layer_id: u32,
        is_key: bool,
    ) -> Result<CacheLocation, KvCacheError> {
        if data.is_empty() {
            return Err(KvCacheError::EmptyInput);
        }
        let key = BlockKey::new(seq_pos, layer_id, is_key);
        let bytes: &[u8] = bytemuck::cast_slice(data);

        let slot = match self.find(&key) {
            Some(slot) => slot,
            None => self
                .evictor
                .select_slot(&self.slots, self.total_tokens_processed),
        };
        if let Some(old) = self.release(slot) {
            if !old.matches(&key) {
                self.stats.overwrites += 1;
                debug!(slot, evicted = %old.key, "KV slot overwritten");
            }
        }

        let block_size = self.config.block_size;
        let region = slot * block_size..(slot + 1) * block_size;

        let (location, stored_size, spill_path) =
            match self.codec.compress_into(bytes, &mut self.arena[region.clone()]) {
                Ok(n) => (CacheLocation::Compressed, n, None),
                Err(e) => {
                    if !matches!(e, CodecError::BufferTooSmall { .. }) {
                        warn!(%key, error = %e, "KV compression failed, storing uncompressed");
                    }
                    if self.config.raw_in_arena && bytes.len() <= block_size {
                        self.arena[region.start..region.start + bytes.len()].copy_from_slice(bytes);
                        (CacheLocation::Memory, bytes.len(), None)
                    } else {
                        let path = key.spill_path(&self.config.spill_dir);
                        std::fs::write(&path, bytes)?;
                        debug!(slot, %key, path = %path.display(), bytes = bytes.len(), "KV vector spilled");
                        (CacheLocation::Disk, bytes.len(), Some(path))
                    }
                }
            };

        let compression_ratio = bytes.len() as f32 / stored_size as f32;
        match location {
            CacheLocation::Compressed => {
                self.stats.compressed_stores += 1;
                let n = self.total_tokens_processed as f64;
                self.avg_compression_ratio =
                    (self.avg_compression_ratio * n + f64::from(compression_ratio)) / (n + 1.0);
            }
            CacheLocation::Memory => self.stats.memory_stores += 1,
            CacheLocation::Disk => self.stats.spills += 1,
        }

        self.clock += 1;
        self.slots[slot] = Some(CacheBlockMeta {
            key,
            location,
            stored_size,
            original_size: bytes.len(),
            compression_ratio,
            spill_path,
            last_access: self.clock,
        });
        self.total_tokens_processed += 1;
        self.stats.stores += 1;

        debug!(slot, %key, %location, stored_size, "KV vector stored");
        Ok(location)
    }

    /// Copy a cached vector into `out`, returning whether it was found.
    pub fn retrieve_into(&mut self, out: &mut [f32], seq_pos: u32, layer_id: u32, is_key: bool) -> bool {
        match self.try_retrieve_into(out, seq_pos, layer_id, is_key) {
            Ok(_) => true,
            Err(KvCacheError::NotFound(_)) => false,
            Err(e) => {
                warn!(seq_pos, layer_id, is_key, error = %e, "KV retrieve failed");
                false
            }
        }
    }

    /// Copy a cached vector into the front of `out`, returning its length in floats.
    pub fn try_retrieve_into(
        &mut self,
        out: &mut [f32],
        seq_pos: u32,
        layer_id: u32,
        is_key: bool,
    ) -> Result<usize, KvCacheError> {
        let key = BlockKey::new(seq_pos, layer_id, is_key);
        let Some(slot) = self.find(&key) else {
            self.stats.misses += 1;
            return Err(KvCacheError::NotFound(key));
        };
        let Some(meta) = self.slots[slot].as_ref() else {
            return Err(KvCacheError::NotFound(key));
        };

        let needed = meta.original_size;
        let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        if out_bytes.len() < needed {
            return Err(KvCacheError::BufferTooSmall {
                needed,
                capacity: out_bytes.len(),
            });
        }
        let dest = &mut out_bytes[..needed];
        let base = slot * self.config.block_size;

        match meta.location {
            CacheLocation::Memory => {
                dest.copy_from_slice(&self.arena[base..base + needed]);
            }
            CacheLocation::Compressed => {
                let stream = &self.arena[base..base + meta.stored_size];
                let mut decoded = vec![0u8; needed];
                let n = self
                    .codec
                    .decompress_into(stream, &mut decoded)
                    .map_err(|e| KvCacheError::CorruptData {
                        key,
                        reason: e.to_string(),
                    })?;
                if n != needed {
                    return Err(KvCacheError::CorruptData {
                        key,
                        reason: format!("decoded {n} bytes, expected {needed}"),
                    });
                }
                dest.copy_from_slice(&decoded);
            }
            CacheLocation::Disk => {
                let path = meta
                    .spill_path
                    .clone()
                    .unwrap_or_else(|| key.spill_path(&self.config.spill_dir));
                let raw = std::fs::read(&path)?;
                if raw.len() != needed {
                    return Err(KvCacheError::CorruptData {
                        key,
                        reason: format!("spill file holds {} bytes, expected {needed}", raw.len()),
                    });
                }
                dest.copy_from_slice(&raw);
            }
        }

        self.clock += 1;
        let tick = self.clock;
        if let Some(meta) = self.slots[slot].as_mut() {
            meta.touch(tick);
        }
        self.stats.retrieves += 1;
        Ok(needed / std::mem::size_of::<f32>())
    }

    /// Fetch a cached vector into a fresh buffer.
    pub fn retrieve(&mut self, seq_pos: u32, layer_id: u32, is_key: bool) -> Option<Vec<f32>> {
        let len = self.lookup(seq_pos, layer_id, is_key)?.original_size / std::mem::size_of::<f32>();
        let mut out = vec![0f32; len];
        self.retrieve_into(&mut out, seq_pos, layer_id, is_key)
            .then_some(out)
    }

    /// Delete every spill file and mark all slots unused.
    pub fn cleanup(&mut self) {
        let mut removed = 0usize;
        for slot in 0..self.slots.len() {
            if let Some(meta) = self.release(slot) {
                if meta.location == CacheLocation::Disk {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "KV cache spill files removed");
        }
    }

    fn find(&self, key: &BlockKey) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|m| m.matches(key)))
    }

    /// Empty a slot, deleting its spill file if it has one.
    fn release(&mut self, slot: usize) -> Option<CacheBlockMeta> {
        let meta = self.slots[slot].take()?;
        if let Some(path) = &meta.spill_path {
            remove_spill(path);
        }
        Some(meta)
    }
}

fn remove_spill(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Spill file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove spill file"),
    }
}

impl Drop for KvCache {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("block_size", &self.config.block_size)
            .field("total_blocks", &self.slots.len())
            .field("occupied", &self.occupied())
            .field("total_tokens_processed", &self.total_tokens_processed)
            .field("avg_compression_ratio", &self.avg_compression_ratio)
            .finish()
    }
}
