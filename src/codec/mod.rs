//! Block codec: delta encoding followed by dictionary substitution.
//!
//! A [`CompressContext`] owns the pattern dictionary its streams refer to.
//! Streams are only decodable by the context (or a reloaded copy of its
//! dictionary) that produced them.
//!
//! Stream grammar, little-endian:
//!
//! | bytes                              | meaning                 |
//! |------------------------------------|-------------------------|
//! | `b` (`b != 0xFF`)                  | literal delta byte      |
//! | `0xFF 0x00`                        | literal `0xFF`          |
//! | `0xFF 0x01 <u32 id> <u16 len>`     | pattern reference       |

pub mod dictionary;

use std::path::Path;

use thiserror::Error;

use crate::config::CodecConfig;
use crate::error::ErrorKind;
use dictionary::{hash_step, PatternId, PatternTable};

pub const SENTINEL: u8 = 0xFF;
const TAG_LITERAL: u8 = 0x00;
const TAG_PATTERN: u8 = 0x01;
/// Sentinel, tag, id, length.
const REFERENCE_LEN: usize = 1 + 1 + 4 + 2;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Output buffer too small ({capacity} bytes)")]
    BufferTooSmall { capacity: usize },

    #[error("Corrupt compressed stream at byte {offset}: {reason}")]
    CorruptStream { offset: usize, reason: &'static str },

    #[error("Corrupt pattern table: {reason}")]
    CorruptDictionary { reason: &'static str },

    #[error("Cannot compress an empty block")]
    EmptyInput,

    #[error("Invalid codec configuration: {0}")]
    InvalidConfig(String),

    #[error("Dictionary I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::BufferTooSmall { .. } => ErrorKind::Allocation,
            CodecError::CorruptStream { .. } | CodecError::CorruptDictionary { .. } => {
                ErrorKind::CorruptData
            }
            CodecError::EmptyInput | CodecError::InvalidConfig(_) => ErrorKind::InvalidArgument,
            CodecError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Byte-wise wrapping delta: `out[0] = in[0]`, `out[i] = in[i] - in[i-1]`.
pub fn delta_encode(input: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(input.len());
    let mut prev = 0u8;
    for &b in input {
        out.push(b.wrapping_sub(prev));
        prev = b;
    }
}

/// Inverse of [`delta_encode`], in place.
pub fn delta_decode(buf: &mut [u8]) {
    let mut prev = 0u8;
    for b in buf.iter_mut() {
        *b = b.wrapping_add(prev);
        prev = *b;
    }
}

/// Destination for encoded or decoded bytes.
trait Sink {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError>;
    fn written(&self) -> usize;
}

struct SliceSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Sink for SliceSink<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::BufferTooSmall {
                capacity: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn written(&self) -> usize {
        self.pos
    }
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn written(&self) -> usize {
        self.len()
    }
}

/// Compression state for one stream of blocks.
#[derive(Debug)]
pub struct CompressContext {
    config: CodecConfig,
    table: PatternTable,
    delta: Vec<u8>,
    /// Uncompressed bytes seen by `compress`.
    total_size: u64,
    /// Bytes produced by `compress`.
    compressed_size: u64,
}

impl CompressContext {
    pub fn new(config: CodecConfig) -> Result<Self, CodecError> {
        if config.min_pattern_length < 2 {
            return Err(CodecError::InvalidConfig(format!(
                "min_pattern_length must be at least 2, got {}",
                config.min_pattern_length
            )));
        }
        if config.max_pattern_length < config.min_pattern_length
            || config.max_pattern_length > usize::from(u16::MAX)
        {
            return Err(CodecError::InvalidConfig(format!(
                "max_pattern_length must be in [{}, {}], got {}",
                config.min_pattern_length,
                u16::MAX,
                config.max_pattern_length
            )));
        }
        let table = PatternTable::new(config.max_patterns);
        Ok(Self {
            config,
            table,
            delta: Vec::new(),
            total_size: 0,
            compressed_size: 0,
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn dictionary(&self) -> &PatternTable {
        &self.table
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Compressed bytes over uncompressed bytes for everything compressed so far.
    pub fn ratio(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.total_size as f64
        }
    }

    /// Compress `input` into a fresh buffer.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        // Worst case every byte is an escaped sentinel.
        let mut out = Vec::with_capacity(input.len() + input.len() / 8);
        self.encode(input, &mut out)?;
        Ok(out)
    }

    /// Compress `input` into `output`, returning the number of bytes written.
    pub fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let mut sink = SliceSink { buf: output, pos: 0 };
        self.encode(input, &mut sink)
    }

    fn encode<S: Sink>(&mut self, input: &[u8], sink: &mut S) -> Result<usize, CodecError> {
        if input.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        delta_encode(input, &mut self.delta);

        let delta = &self.delta;
        let table = &mut self.table;
        let min = self.config.min_pattern_length;
        let n = delta.len();
        let mut i = 0;

        while i < n {
            let upper = self.config.max_pattern_length.min(table.longest()).min(n - i);
            let mut best: Option<(PatternId, usize)> = None;
            if upper >= min {
                let mut hash = 0u32;
                for (k, &b) in delta[i..i + upper].iter().enumerate() {
                    hash = hash_step(hash, b);
                    let len = k + 1;
                    if len < min {
                        continue;
                    }
                    if let Some(id) = table.find_hashed(hash, &delta[i..i + len]) {
                        best = Some((id, len));
                    }
                }
            }

            match best {
                Some((id, len)) => {
                    let mut record = [0u8; REFERENCE_LEN];
                    record[0] = SENTINEL;
                    record[1] = TAG_PATTERN;
                    record[2..6].copy_from_slice(&id.to_le_bytes());
                    record[6..8].copy_from_slice(&(len as u16).to_le_bytes());
                    sink.put(&record)?;
                    table.record_hit(id);
                    // Grow the dictionary so repeated runs are covered by
                    // ever longer references.
                    let grown = (len * 2).min(self.config.max_pattern_length).min(n - i);
                    if grown > len {
                        table.insert(&delta[i..i + grown]);
                    }
                    i += len;
                }
                None => {
                    let b = delta[i];
                    if b == SENTINEL {
                        sink.put(&[SENTINEL, TAG_LITERAL])?;
                    } else {
                        sink.put(&[b])?;
                    }
                    if i + min <= n {
                        table.insert(&delta[i..i + min]);
                    }
                    i += 1;
                }
            }
        }

        let written = sink.written();
        self.total_size += n as u64;
        self.compressed_size += written as u64;
        Ok(written)
    }

    /// Decompress a stream into a fresh buffer.
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(input.len() * 2);
        self.decode(input, &mut out)?;
        delta_decode(&mut out);
        Ok(out)
    }

    /// Decompress a stream into `output`, returning the decoded length.
    pub fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let written = {
            let mut sink = SliceSink {
                buf: &mut *output,
                pos: 0,
            };
            self.decode(input, &mut sink)?;
            sink.pos
        };
        delta_decode(&mut output[..written]);
        Ok(written)
    }

    fn decode<S: Sink>(&self, input: &[u8], sink: &mut S) -> Result<(), CodecError> {
        if input.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        let corrupt = |offset, reason| CodecError::CorruptStream { offset, reason };
        let mut pos = 0;
        while pos < input.len() {
            let b = input[pos];
            if b != SENTINEL {
                sink.put(&[b])?;
                pos += 1;
                continue;
            }
            match input.get(pos + 1) {
                Some(&TAG_LITERAL) => {
                    sink.put(&[SENTINEL])?;
                    pos += 2;
                }
                Some(&TAG_PATTERN) => {
                    let record = input
                        .get(pos..pos + REFERENCE_LEN)
                        .ok_or_else(|| corrupt(pos, "truncated pattern reference"))?;
                    let id = u32::from_le_bytes([record[2], record[3], record[4], record[5]]);
                    let len = usize::from(u16::from_le_bytes([record[6], record[7]]));
                    let entry = self
                        .table
                        .get(id)
                        .ok_or_else(|| corrupt(pos, "unknown pattern id"))?;
                    if entry.bytes.len() != len {
                        return Err(corrupt(pos, "pattern length mismatch"));
                    }
                    sink.put(&entry.bytes)?;
                    pos += REFERENCE_LEN;
                }
                Some(_) => return Err(corrupt(pos, "unknown sentinel tag")),
                None => return Err(corrupt(pos, "truncated sentinel")),
            }
        }
        Ok(())
    }

    /// Persist the dictionary so streams written this session stay decodable.
    pub fn save_dictionary(&self, path: &Path) -> Result<(), CodecError> {
        self.table.save(path)
    }

    /// Replace the dictionary with one previously saved by [`Self::save_dictionary`].
    pub fn load_dictionary(&mut self, path: &Path) -> Result<(), CodecError> {
        self.table = PatternTable::load(path, self.config.max_patterns)?;
        Ok(())
    }
}
