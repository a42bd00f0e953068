//! Pattern dictionary for the block codec.
//!
//! Patterns live in an append-only vector, so a pattern's index is a stable
//! identifier that can be written into compressed streams and persisted.
//! Lookup goes through hash chains keyed by a 16-bit polynomial hash and is
//! confirmed by an exact byte comparison.

use std::collections::HashMap;
use std::path::Path;

use bytes::{Buf, BufMut};
use tracing::debug;

use super::CodecError;

/// Stable index of a pattern within its [`PatternTable`].
pub type PatternId = u32;

/// Number of hash buckets.
pub const HASH_BUCKETS: u32 = 1 << 16;

/// "PTBL"
const TABLE_MAGIC: u32 = 0x5054_424C;

/// One registered byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    pub bytes: Vec<u8>,
    /// Number of times the pattern was referenced by a compressed stream.
    pub frequency: u32,
}

/// Feed one byte into the running pattern hash (before bucket reduction).
#[inline]
pub fn hash_step(hash: u32, byte: u8) -> u32 {
    hash.wrapping_mul(31).wrapping_add(u32::from(byte))
}

/// Bucket of a complete byte sequence.
pub fn pattern_hash(data: &[u8]) -> u32 {
    data.iter().fold(0, |h, &b| hash_step(h, b)) % HASH_BUCKETS
}

/// Append-only table of patterns with hash-chained lookup.
#[derive(Debug, Default)]
pub struct PatternTable {
    entries: Vec<PatternEntry>,
    chains: HashMap<u32, Vec<PatternId>>,
    longest: usize,
    capacity: usize,
}

impl PatternTable {
    /// Create an empty table that accepts at most `capacity` patterns.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            chains: HashMap::new(),
            longest: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Length of the longest pattern ever registered.
    pub fn longest(&self) -> usize {
        self.longest
    }

    pub fn get(&self, id: PatternId) -> Option<&PatternEntry> {
        self.entries.get(id as usize)
    }

    /// Find `data` given its unreduced running hash.
    pub fn find_hashed(&self, raw_hash: u32, data: &[u8]) -> Option<PatternId> {
        self.chains
            .get(&(raw_hash % HASH_BUCKETS))?
            .iter()
            .copied()
            .find(|&id| self.entries[id as usize].bytes == data)
    }

    pub fn find(&self, data: &[u8]) -> Option<PatternId> {
        let raw = data.iter().fold(0, |h, &b| hash_step(h, b));
        self.find_hashed(raw, data)
    }

    /// Register `data` unless it is already present or the table is full.
    ///
    /// Returns the id of the existing or new entry, or `None` when the table
    /// is full and `data` is unknown.
    pub fn insert(&mut self, data: &[u8]) -> Option<PatternId> {
        if let Some(id) = self.find(data) {
            return Some(id);
        }
        if self.is_full() || data.is_empty() || data.len() > usize::from(u16::MAX) {
            return None;
        }
        let id = self.entries.len() as PatternId;
        self.entries.push(PatternEntry {
            bytes: data.to_vec(),
            frequency: 0,
        });
        self.chains.entry(pattern_hash(data)).or_default().push(id);
        self.longest = self.longest.max(data.len());
        Some(id)
    }

    /// Count one more reference to `id`.
    pub fn record_hit(&mut self, id: PatternId) {
        if let Some(entry) = self.entries.get_mut(id as usize) {
            entry.frequency = entry.frequency.saturating_add(1);
        }
    }

    /// Serialize the table. Ids are preserved because entries are written in
    /// id order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body: usize = self.entries.iter().map(|e| 6 + e.bytes.len()).sum();
        let mut buf = Vec::with_capacity(8 + body);
        buf.put_u32_le(TABLE_MAGIC);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u16_le(entry.bytes.len() as u16);
            buf.put_u32_le(entry.frequency);
            buf.put_slice(&entry.bytes);
        }
        buf
    }

    /// Rebuild a table from [`PatternTable::to_bytes`] output.
    pub fn from_bytes(mut data: &[u8], capacity: usize) -> Result<Self, CodecError> {
        let corrupt = |reason| CodecError::CorruptDictionary { reason };
        if data.remaining() < 8 {
            return Err(corrupt("header truncated"));
        }
        if data.get_u32_le() != TABLE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let count = data.get_u32_le() as usize;
        let mut table = Self::new(capacity.max(count));
        for _ in 0..count {
            if data.remaining() < 6 {
                return Err(corrupt("record truncated"));
            }
            let len = usize::from(data.get_u16_le());
            let frequency = data.get_u32_le();
            if len == 0 || data.remaining() < len {
                return Err(corrupt("pattern bytes truncated"));
            }
            let bytes = data[..len].to_vec();
            data.advance(len);

            let id = table.entries.len() as PatternId;
            table.chains.entry(pattern_hash(&bytes)).or_default().push(id);
            table.longest = table.longest.max(len);
            table.entries.push(PatternEntry { bytes, frequency });
        }
        if data.has_remaining() {
            return Err(corrupt("trailing bytes"));
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<(), CodecError> {
        let bytes = self.to_bytes();
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %path.display(), patterns = self.len(), size = bytes.len(), "Saved pattern table");
        Ok(())
    }

    pub fn load(path: &Path, capacity: usize) -> Result<Self, CodecError> {
        let bytes = std::fs::read(path)?;
        let table = Self::from_bytes(&bytes, capacity)?;
        debug!(path = %path.display(), patterns = table.len(), "Loaded pattern table");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_insertion_order() {
        let mut table = PatternTable::new(16);
        assert_eq!(table.insert(b"abcd"), Some(0));
        assert_eq!(table.insert(b"efgh"), Some(1));
        assert_eq!(table.insert(b"abcd"), Some(0));
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(b"efgh"), Some(1));
        assert_eq!(table.find(b"zzzz"), None);
    }

    #[test]
    fn test_capacity_stops_growth() {
        let mut table = PatternTable::new(1);
        assert_eq!(table.insert(b"aaaa"), Some(0));
        assert_eq!(table.insert(b"bbbb"), None);
        assert!(table.is_full());
    }

    #[test]
    fn test_hash_collisions_resolve_by_bytes() {
        // "Aa" and "BB" collide under h*31+b.
        assert_eq!(pattern_hash(b"Aa"), pattern_hash(b"BB"));
        let mut table = PatternTable::new(8);
        let a = table.insert(b"Aa").unwrap();
        let b = table.insert(b"BB").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.find(b"BB"), Some(b));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut table = PatternTable::new(8);
        table.insert(b"\x01\x02\x03\x04");
        table.insert(b"\xff\xfe\xfd\xfc\xfb");
        table.record_hit(1);

        let restored = PatternTable::from_bytes(&table.to_bytes(), 8).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.longest(), 5);
        assert_eq!(restored.get(1).unwrap().frequency, 1);
        assert_eq!(restored.find(b"\x01\x02\x03\x04"), Some(0));
    }

    #[test]
    fn test_truncated_table_rejected() {
        let mut table = PatternTable::new(8);
        table.insert(b"abcd");
        let bytes = table.to_bytes();
        let err = PatternTable::from_bytes(&bytes[..bytes.len() - 1], 8).unwrap_err();
        assert!(matches!(err, CodecError::CorruptDictionary { .. }));
    }
}
