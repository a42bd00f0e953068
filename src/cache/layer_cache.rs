//! Per-layer KV cache with sliding-window rotation and disk offload.
//!
//! Each layer keeps its key and value rows (`num_heads * head_dim` floats per
//! token) in append order together with the sequence position each row came
//! from. Rows can be looked up by index, dropped from the front (rotation),
//! invalidated and compacted away, or the whole layer can be offloaded to
//! `layer_<idx>_kv_cache.bin` and loaded back.
//!
//! Offload file layout (little-endian):
//!
//! ```text
//! u64 count | count x u64 positions | count x row keys (f32) | count x row values (f32)
//! ```

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LayerCacheConfig;
use crate::error::ErrorKind;

/// Position marker for an invalidated row.
pub const INVALID_POSITION: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum LayerCacheError {
    #[error("Layer {layer} out of range ({num_layers} layers)")]
    InvalidLayer { layer: usize, num_layers: usize },

    #[error("Layer {layer} is full ({max} tokens)")]
    Full { layer: usize, max: usize },

    #[error("Row has {actual} floats, expected {expected}")]
    RowLength { expected: usize, actual: usize },

    #[error("Row index {index} out of range (layer holds {length})")]
    IndexOutOfRange { index: usize, length: usize },

    #[error("Rotation offset {offset} must be below the layer length {length}")]
    InvalidOffset { offset: usize, length: usize },

    #[error("Layer {0} is offloaded")]
    Offloaded(usize),

    #[error("Sequence position {0:#x} is reserved for invalidated rows")]
    ReservedPosition(u64),

    #[error("Out of memory allocating {size} bytes for a layer")]
    OutOfMemory { size: usize },

    #[error("Invalid layer cache configuration: {0}")]
    InvalidConfig(String),

    #[error("Offload I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt offload file {path}: {reason}")]
    CorruptData { path: PathBuf, reason: String },
}

impl LayerCacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LayerCacheError::OutOfMemory { .. } | LayerCacheError::Full { .. } => {
                ErrorKind::Allocation
            }
            LayerCacheError::Io(_) => ErrorKind::Io,
            LayerCacheError::CorruptData { .. } => ErrorKind::CorruptData,
            LayerCacheError::InvalidLayer { .. }
            | LayerCacheError::RowLength { .. }
            | LayerCacheError::IndexOutOfRange { .. }
            | LayerCacheError::InvalidOffset { .. }
            | LayerCacheError::Offloaded(_)
            | LayerCacheError::ReservedPosition(_)
            | LayerCacheError::InvalidConfig(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Rows gathered by [`LayerKvCache::lookup`], concatenated in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct KvRows {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
}

#[derive(Debug, Default)]
struct LayerItem {
    keys: Vec<f32>,
    values: Vec<f32>,
    positions: Vec<u64>,
    /// Rows live in the offload file, not in memory.
    offloaded: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LayerCacheStats {
    pub appends: u64,
    pub lookups: u64,
    pub rotations: u64,
    pub compactions: u64,
    pub offloads: u64,
    pub loads: u64,
}

#[derive(Debug)]
pub struct LayerKvCache {
    config: LayerCacheConfig,
    items: Vec<LayerItem>,
    stats: LayerCacheStats,
}

impl LayerKvCache {
    pub fn new(config: LayerCacheConfig) -> Result<Self, LayerCacheError> {
        if config.num_layers == 0 || config.row_len() == 0 || config.max_seq_length == 0 {
            return Err(LayerCacheError::InvalidConfig(
                "num_layers, num_heads, head_dim and max_seq_length must be non-zero".into(),
            ));
        }
        if config.layer_bytes().is_none() {
            return Err(LayerCacheError::InvalidConfig(format!(
                "{} tokens of {} floats overflow the address space",
                config.max_seq_length,
                config.row_len()
            )));
        }
        let mut items = Vec::new();
        reserve_rows(&mut items, config.num_layers)?;
        items.resize_with(config.num_layers, LayerItem::default);
        Ok(Self {
            config,
            items,
            stats: LayerCacheStats::default(),
        })
    }

    pub fn config(&self) -> &LayerCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &LayerCacheStats {
        &self.stats
    }

    /// Tokens currently held by `layer`.
    pub fn len(&self, layer: usize) -> Result<usize, LayerCacheError> {
        Ok(self.item(layer)?.positions.len())
    }

    pub fn is_offloaded(&self, layer: usize) -> Result<bool, LayerCacheError> {
        Ok(self.item(layer)?.offloaded)
    }

    /// Sequence positions of `layer`'s rows, in row order.
    pub fn positions(&self, layer: usize) -> Result<&[u64], LayerCacheError> {
        Ok(&self.resident(layer)?.positions)
    }

    /// Bytes of key and value rows held in memory across all layers.
    pub fn resident_bytes(&self) -> usize {
        self.items
            .iter()
            .map(|item| (item.keys.len() + item.values.len()) * std::mem::size_of::<f32>())
            .sum()
    }

    /// Forget every row of every layer. Offload files are left on disk.
    pub fn reset(&mut self) {
        for item in &mut self.items {
            item.keys.clear();
            item.values.clear();
            item.positions.clear();
            item.offloaded = false;
        }
    }

    /// Append one token's key and value rows.
    pub fn append(
        &mut self,
        layer: usize,
        key: &[f32],
        value: &[f32],
        seq_idx: u64,
    ) -> Result<(), LayerCacheError> {
        if seq_idx == INVALID_POSITION {
            return Err(LayerCacheError::ReservedPosition(seq_idx));
        }
        let row = self.config.row_len();
        let max = self.config.max_seq_length;
        for actual in [key.len(), value.len()] {
            if actual != row {
                return Err(LayerCacheError::RowLength {
                    expected: row,
                    actual,
                });
            }
        }

        let item = self.resident_mut(layer)?;
        if item.positions.len() >= max {
            return Err(LayerCacheError::Full { layer, max });
        }
        if item.keys.capacity() == 0 {
            // First append reserves the whole window.
            reserve_rows(&mut item.keys, max * row)?;
            reserve_rows(&mut item.values, max * row)?;
            reserve_rows(&mut item.positions, max)?;
        }
        item.keys.extend_from_slice(key);
        item.values.extend_from_slice(value);
        item.positions.push(seq_idx);
        self.stats.appends += 1;
        Ok(())
    }

    /// Gather the rows at the given row indices.
    pub fn lookup(&mut self, layer: usize, indices: &[usize]) -> Result<KvRows, LayerCacheError> {
        let row = self.config.row_len();
        let item = self.resident(layer)?;
        let length = item.positions.len();

        let mut rows = KvRows {
            keys: Vec::with_capacity(indices.len() * row),
            values: Vec::with_capacity(indices.len() * row),
        };
        for &index in indices {
            if index >= length {
                return Err(LayerCacheError::IndexOutOfRange { index, length });
            }
            let span = index * row..(index + 1) * row;
            rows.keys.extend_from_slice(&item.keys[span.clone()]);
            rows.values.extend_from_slice(&item.values[span]);
        }
        self.stats.lookups += 1;
        Ok(rows)
    }

    /// Drop the first `offset` rows, sliding the rest to the front.
    pub fn rotate(&mut self, layer: usize, offset: usize) -> Result<(), LayerCacheError> {
        let row = self.config.row_len();
        let item = self.resident_mut(layer)?;
        let length = item.positions.len();
        if offset >= length {
            return Err(LayerCacheError::InvalidOffset { offset, length });
        }
        item.keys.drain(..offset * row);
        item.values.drain(..offset * row);
        item.positions.drain(..offset);
        self.stats.rotations += 1;
        debug!(layer, offset, remaining = length - offset, "Layer cache rotated");
        Ok(())
    }

    /// Mark a row for removal by the next [`compact`](Self::compact).
    pub fn invalidate(&mut self, layer: usize, index: usize) -> Result<(), LayerCacheError> {
        let item = self.resident_mut(layer)?;
        let length = item.positions.len();
        match item.positions.get_mut(index) {
            Some(pos) => {
                *pos = INVALID_POSITION;
                Ok(())
            }
            None => Err(LayerCacheError::IndexOutOfRange { index, length }),
        }
    }

    /// Remove invalidated rows, keeping the survivors in order. Returns the
    /// number of rows removed.
    pub fn compact(&mut self, layer: usize) -> Result<usize, LayerCacheError> {
        let row = self.config.row_len();
        let item = self.resident_mut(layer)?;
        let length = item.positions.len();

        let mut kept = 0;
        for i in 0..length {
            if item.positions[i] == INVALID_POSITION {
                continue;
            }
            if kept != i {
                item.positions[kept] = item.positions[i];
                item.keys.copy_within(i * row..(i + 1) * row, kept * row);
                item.values.copy_within(i * row..(i + 1) * row, kept * row);
            }
            kept += 1;
        }
        item.positions.truncate(kept);
        item.keys.truncate(kept * row);
        item.values.truncate(kept * row);

        let removed = length - kept;
        if removed > 0 {
            self.stats.compactions += 1;
            debug!(layer, removed, kept, "Layer cache compacted");
        }
        Ok(removed)
    }

    /// Path of `layer`'s offload file under `dir`.
    pub fn offload_path(dir: &Path, layer: usize) -> PathBuf {
        dir.join(format!("layer_{layer}_kv_cache.bin"))
    }

    /// Offload `layer` to the configured `offload_dir`.
    pub fn offload(&mut self, layer: usize) -> Result<PathBuf, LayerCacheError> {
        let dir = self.config.offload_dir.clone();
        self.offload_to(layer, &dir)
    }

    /// Reload `layer` from the configured `offload_dir`.
    pub fn load(&mut self, layer: usize) -> Result<usize, LayerCacheError> {
        let dir = self.config.offload_dir.clone();
        self.load_from(layer, &dir)
    }

    /// Write `layer` to its offload file under `dir` and release its rows.
    pub fn offload_to(&mut self, layer: usize, dir: &Path) -> Result<PathBuf, LayerCacheError> {
        let item = self.resident_mut(layer)?;
        let count = item.positions.len();

        let mut buf = Vec::with_capacity(
            8 + count * 8 + (item.keys.len() + item.values.len()) * std::mem::size_of::<f32>(),
        );
        buf.put_u64_le(count as u64);
        for &pos in &item.positions {
            buf.put_u64_le(pos);
        }
        for &k in &item.keys {
            buf.put_f32_le(k);
        }
        for &v in &item.values {
            buf.put_f32_le(v);
        }

        std::fs::create_dir_all(dir)?;
        let path = Self::offload_path(dir, layer);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &path)?;

        item.keys = Vec::new();
        item.values = Vec::new();
        item.positions = Vec::new();
        item.offloaded = true;
        self.stats.offloads += 1;

        info!(layer, tokens = count, bytes = buf.len(), path = %path.display(), "Layer cache offloaded");
        Ok(path)
    }

    /// Replace `layer`'s rows with the contents of its offload file under `dir`.
    pub fn load_from(&mut self, layer: usize, dir: &Path) -> Result<usize, LayerCacheError> {
        let row = self.config.row_len();
        let max = self.config.max_seq_length;
        self.item(layer)?;

        let path = Self::offload_path(dir, layer);
        let raw = std::fs::read(&path)?;
        let corrupt = |reason: String| LayerCacheError::CorruptData {
            path: path.clone(),
            reason,
        };

        let mut cur = raw.as_slice();
        if cur.remaining() < 8 {
            return Err(corrupt("missing token count".into()));
        }
        let count = cur.get_u64_le();
        if count > max as u64 {
            return Err(corrupt(format!("{count} tokens exceeds the {max}-token window")));
        }
        let count = count as usize;
        let expected = count * 8 + 2 * count * row * std::mem::size_of::<f32>();
        if cur.remaining() != expected {
            return Err(corrupt(format!(
                "expected {expected} bytes after the header, found {}",
                cur.remaining()
            )));
        }

        let mut positions = Vec::new();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        reserve_rows(&mut positions, max)?;
        reserve_rows(&mut keys, max * row)?;
        reserve_rows(&mut values, max * row)?;
        for _ in 0..count {
            positions.push(cur.get_u64_le());
        }
        for _ in 0..count * row {
            keys.push(cur.get_f32_le());
        }
        for _ in 0..count * row {
            values.push(cur.get_f32_le());
        }

        let item = &mut self.items[layer];
        item.positions = positions;
        item.keys = keys;
        item.values = values;
        item.offloaded = false;
        self.stats.loads += 1;

        info!(layer, tokens = count, path = %path.display(), "Layer cache loaded");
        Ok(count)
    }

    fn item(&self, layer: usize) -> Result<&LayerItem, LayerCacheError> {
        self.items.get(layer).ok_or(LayerCacheError::InvalidLayer {
            layer,
            num_layers: self.config.num_layers,
        })
    }

    fn resident(&self, layer: usize) -> Result<&LayerItem, LayerCacheError> {
        let item = self.item(layer)?;
        if item.offloaded {
            return Err(LayerCacheError::Offloaded(layer));
        }
        Ok(item)
    }

    fn resident_mut(&mut self, layer: usize) -> Result<&mut LayerItem, LayerCacheError> {
        let num_layers = self.config.num_layers;
        let item = self
            .items
            .get_mut(layer)
            .ok_or(LayerCacheError::InvalidLayer { layer, num_layers })?;
        if item.offloaded {
            return Err(LayerCacheError::Offloaded(layer));
        }
        Ok(item)
    }
}

fn reserve_rows<T>(buf: &mut Vec<T>, additional: usize) -> Result<(), LayerCacheError> {
    buf.try_reserve_exact(additional)
        .map_err(|_| LayerCacheError::OutOfMemory {
            size: additional.saturating_mul(std::mem::size_of::<T>()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> LayerCacheConfig {
        LayerCacheConfig {
            max_seq_length: 8,
            num_layers: 2,
            num_heads: 2,
            head_dim: 2,
            offload_dir: PathBuf::from("unused"),
        }
    }

    fn row(v: f32) -> Vec<f32> {
        vec![v; 4]
    }

    #[test]
    fn test_append_and_lookup() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        for t in 0..3 {
            cache.append(0, &row(t as f32), &row(-(t as f32)), t + 10).unwrap();
        }
        assert_eq!(cache.len(0).unwrap(), 3);
        assert_eq!(cache.positions(0).unwrap(), &[10, 11, 12]);

        let rows = cache.lookup(0, &[2, 0]).unwrap();
        assert_eq!(rows.keys, [row(2.0), row(0.0)].concat());
        assert_eq!(rows.values, [row(-2.0), row(0.0)].concat());

        let err = cache.lookup(0, &[3]).unwrap_err();
        assert!(matches!(err, LayerCacheError::IndexOutOfRange { index: 3, length: 3 }));
    }

    #[test]
    fn test_append_validates() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        assert!(matches!(
            cache.append(5, &row(0.0), &row(0.0), 0),
            Err(LayerCacheError::InvalidLayer { layer: 5, .. })
        ));
        assert!(matches!(
            cache.append(0, &[1.0; 3], &row(0.0), 0),
            Err(LayerCacheError::RowLength { expected: 4, actual: 3 })
        ));
        for t in 0..8 {
            cache.append(1, &row(0.0), &row(0.0), t).unwrap();
        }
        let err = cache.append(1, &row(0.0), &row(0.0), 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
    }

    #[test]
    fn test_reserved_position_rejected() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        cache.append(0, &row(1.0), &row(1.0), INVALID_POSITION - 1).unwrap();
        let err = cache
            .append(0, &row(2.0), &row(2.0), INVALID_POSITION)
            .unwrap_err();
        assert!(matches!(err, LayerCacheError::ReservedPosition(INVALID_POSITION)));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The valid row is not swept up by compaction.
        assert_eq!(cache.compact(0).unwrap(), 0);
        assert_eq!(cache.positions(0).unwrap(), &[INVALID_POSITION - 1]);
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let config = LayerCacheConfig {
            head_dim: usize::MAX / 2,
            ..small_config()
        };
        assert!(matches!(
            LayerKvCache::new(config),
            Err(LayerCacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rotate_slides_window() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        for t in 0..5 {
            cache.append(0, &row(t as f32), &row(t as f32), t).unwrap();
        }
        cache.rotate(0, 2).unwrap();
        assert_eq!(cache.positions(0).unwrap(), &[2, 3, 4]);
        assert_eq!(cache.lookup(0, &[0]).unwrap().keys, row(2.0));
        assert!(cache.rotate(0, 3).is_err());
    }

    #[test]
    fn test_invalidate_and_compact() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        for t in 0..4 {
            cache.append(0, &row(t as f32), &row(t as f32 * 2.0), t).unwrap();
        }
        cache.invalidate(0, 1).unwrap();
        cache.invalidate(0, 2).unwrap();
        assert_eq!(cache.compact(0).unwrap(), 2);
        assert_eq!(cache.positions(0).unwrap(), &[0, 3]);
        let rows = cache.lookup(0, &[1]).unwrap();
        assert_eq!(rows.keys, row(3.0));
        assert_eq!(rows.values, row(6.0));
        assert_eq!(cache.compact(0).unwrap(), 0);
    }

    #[test]
    fn test_offload_and_load() {
        let tmp = TempDir::new().unwrap();
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        for t in 0..3 {
            cache.append(1, &row(t as f32 + 0.5), &row(t as f32 - 0.5), 100 + t).unwrap();
        }
        let path = cache.offload_to(1, tmp.path()).unwrap();
        assert_eq!(path, tmp.path().join("layer_1_kv_cache.bin"));
        // 8-byte count, 3 positions, 3 key rows, 3 value rows.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 + 3 * 8 + 2 * 3 * 4 * 4);
        assert!(cache.is_offloaded(1).unwrap());
        assert!(matches!(cache.lookup(1, &[0]), Err(LayerCacheError::Offloaded(1))));
        assert_eq!(cache.resident_bytes(), 0);

        assert_eq!(cache.load_from(1, tmp.path()).unwrap(), 3);
        assert_eq!(cache.positions(1).unwrap(), &[100, 101, 102]);
        assert_eq!(cache.lookup(1, &[2]).unwrap().values, row(1.5));
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let tmp = TempDir::new().unwrap();
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        cache.append(0, &row(1.0), &row(1.0), 0).unwrap();
        let path = cache.offload_to(0, tmp.path()).unwrap();
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 4]).unwrap();
        let err = cache.load_from(0, tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }

    #[test]
    fn test_reset_clears_all_layers() {
        let mut cache = LayerKvCache::new(small_config()).unwrap();
        cache.append(0, &row(1.0), &row(1.0), 0).unwrap();
        cache.append(1, &row(1.0), &row(1.0), 0).unwrap();
        cache.reset();
        assert_eq!(cache.len(0).unwrap(), 0);
        assert_eq!(cache.len(1).unwrap(), 0);
    }
}
