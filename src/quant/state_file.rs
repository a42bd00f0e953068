//! Versioned, checksummed container for training state.
//!
//! Layout (little-endian):
//!
//! ```text
//! offset  size  field
//!      0     4  magic            MPST (mixed precision) or QATS (QAT)
//!      4     4  version          1
//!      8     4  header_crc       CRC-32 of magic + version
//!     12     4  data_crc         CRC-32 of the uncompressed payload
//!     16     8  original_size    uncompressed payload bytes
//!     24     8  compressed_size  payload bytes on disk
//!     32     4  compressed       0 = raw, 1 = zlib
//!     36     …  payload
//! ```

use std::io::{Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;

/// "MPST"
pub const MIXED_PRECISION_MAGIC: u32 = 0x4D50_5354;
/// "QATS"
pub const QAT_MAGIC: u32 = 0x5141_5453;
pub const STATE_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 36;

#[derive(Error, Debug)]
pub enum StateFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Unsupported state file version {0}")]
    UnsupportedVersion(u32),

    #[error("Header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderChecksum { stored: u32, computed: u32 },

    #[error("Data checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    DataChecksum { stored: u32, computed: u32 },

    #[error("File truncated or padded: expected {expected} bytes, found {actual}")]
    Length { expected: u64, actual: u64 },

    #[error("Malformed state file: {0}")]
    Malformed(String),

    #[error("State has {found} layers, expected {expected}")]
    LayerMismatch { expected: usize, found: usize },

    #[error("Invalid save options: {0}")]
    InvalidOptions(String),
}

impl StateFileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateFileError::Io(_) => ErrorKind::Io,
            StateFileError::UnsupportedVersion(_) => ErrorKind::Unsupported,
            StateFileError::InvalidOptions(_) => ErrorKind::InvalidArgument,
            StateFileError::BadMagic { .. }
            | StateFileError::HeaderChecksum { .. }
            | StateFileError::DataChecksum { .. }
            | StateFileError::Length { .. }
            | StateFileError::Malformed(_)
            | StateFileError::LayerMismatch { .. } => ErrorKind::CorruptData,
        }
    }
}

/// How state files are written and checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    /// zlib-compress the payload.
    pub use_compression: bool,

    /// zlib level, 0-9.
    pub compression_level: u32,

    /// Check both CRCs on load.
    pub verify_checksum: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            use_compression: true,
            compression_level: 6,
            verify_checksum: true,
        }
    }
}

/// Parsed header of a state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateHeader {
    pub magic: u32,
    pub version: u32,
    pub header_crc: u32,
    pub data_crc: u32,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compressed: bool,
}

impl StateHeader {
    pub fn kind_name(&self) -> &'static str {
        match self.magic {
            MIXED_PRECISION_MAGIC => "mixed-precision",
            QAT_MAGIC => "qat",
            _ => "unknown",
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

fn header_crc(magic: u32, version: u32) -> u32 {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&magic.to_le_bytes());
    buf[4..].copy_from_slice(&version.to_le_bytes());
    crc32(&buf)
}

/// Build a complete container around `payload`.
pub fn encode(magic: u32, payload: &[u8], options: &SaveOptions) -> Result<Vec<u8>, StateFileError> {
    if options.compression_level > 9 {
        return Err(StateFileError::InvalidOptions(format!(
            "compression_level must be 0-9, got {}",
            options.compression_level
        )));
    }
    let body = if options.use_compression {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(options.compression_level));
        encoder.write_all(payload)?;
        encoder.finish()?
    } else {
        payload.to_vec()
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.put_u32_le(magic);
    out.put_u32_le(STATE_VERSION);
    out.put_u32_le(header_crc(magic, STATE_VERSION));
    out.put_u32_le(crc32(payload));
    out.put_u64_le(payload.len() as u64);
    out.put_u64_le(body.len() as u64);
    out.put_u32_le(u32::from(options.use_compression));
    out.put_slice(&body);
    Ok(out)
}

/// Parse and validate the header. Checks magic (when `expected_magic` is
/// given), the header CRC (when `verify`), version, flag, and total length.
pub fn parse_header(
    file: &[u8],
    expected_magic: Option<u32>,
    verify: bool,
) -> Result<StateHeader, StateFileError> {
    if file.len() < HEADER_LEN {
        return Err(StateFileError::Length {
            expected: HEADER_LEN as u64,
            actual: file.len() as u64,
        });
    }
    let mut buf = &file[..HEADER_LEN];
    let magic = buf.get_u32_le();
    let version = buf.get_u32_le();
    let stored_header_crc = buf.get_u32_le();
    let data_crc = buf.get_u32_le();
    let original_size = buf.get_u64_le();
    let compressed_size = buf.get_u64_le();
    let flag = buf.get_u32_le();

    match expected_magic {
        Some(expected) if magic != expected => {
            return Err(StateFileError::BadMagic {
                expected,
                found: magic,
            })
        }
        None if magic != MIXED_PRECISION_MAGIC && magic != QAT_MAGIC => {
            return Err(StateFileError::BadMagic {
                expected: MIXED_PRECISION_MAGIC,
                found: magic,
            })
        }
        _ => {}
    }
    if verify {
        let computed = header_crc(magic, version);
        if computed != stored_header_crc {
            return Err(StateFileError::HeaderChecksum {
                stored: stored_header_crc,
                computed,
            });
        }
    }
    if version != STATE_VERSION {
        return Err(StateFileError::UnsupportedVersion(version));
    }
    let compressed = match flag {
        0 => false,
        1 => true,
        other => {
            return Err(StateFileError::Malformed(format!(
                "compression flag {other}"
            )))
        }
    };
    if !compressed && original_size != compressed_size {
        return Err(StateFileError::Malformed(format!(
            "uncompressed payload with original_size {original_size} != compressed_size {compressed_size}"
        )));
    }
    let expected_len = (HEADER_LEN as u64).checked_add(compressed_size);
    if expected_len != Some(file.len() as u64) {
        return Err(StateFileError::Length {
            expected: expected_len.unwrap_or(u64::MAX),
            actual: file.len() as u64,
        });
    }

    Ok(StateHeader {
        magic,
        version,
        header_crc: stored_header_crc,
        data_crc,
        original_size,
        compressed_size,
        compressed,
    })
}

/// Validate a container and return its header and uncompressed payload.
pub fn decode(
    file: &[u8],
    expected_magic: Option<u32>,
    verify: bool,
) -> Result<(StateHeader, Vec<u8>), StateFileError> {
    let header = parse_header(file, expected_magic, verify)?;
    let body = &file[HEADER_LEN..];

    let payload = if header.compressed {
        let mut payload = Vec::new();
        ZlibDecoder::new(body)
            .take(header.original_size.saturating_add(1))
            .read_to_end(&mut payload)
            .map_err(|e| StateFileError::Malformed(format!("zlib: {e}")))?;
        payload
    } else {
        body.to_vec()
    };
    if payload.len() as u64 != header.original_size {
        return Err(StateFileError::Malformed(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.original_size
        )));
    }
    if verify {
        let computed = crc32(&payload);
        if computed != header.data_crc {
            return Err(StateFileError::DataChecksum {
                stored: header.data_crc,
                computed,
            });
        }
    }
    Ok((header, payload))
}

/// Write a container to `path` through a temporary file.
pub fn write(path: &Path, magic: u32, payload: &[u8], options: &SaveOptions) -> Result<(), StateFileError> {
    let bytes = encode(magic, payload, options)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    info!(
        path = %path.display(),
        payload = payload.len(),
        size = bytes.len(),
        compressed = options.use_compression,
        "Saved state file"
    );
    Ok(())
}

/// Read and validate a container with the given magic.
pub fn read(path: &Path, magic: u32, options: &SaveOptions) -> Result<Vec<u8>, StateFileError> {
    let file = std::fs::read(path)?;
    let (header, payload) = decode(&file, Some(magic), options.verify_checksum)?;
    debug!(
        path = %path.display(),
        kind = header.kind_name(),
        payload = payload.len(),
        "Loaded state file"
    );
    Ok(payload)
}

/// Fully check a state file of either kind, including both checksums.
pub fn verify_state_file(path: &Path) -> Result<StateHeader, StateFileError> {
    let file = std::fs::read(path)?;
    let (header, _) = decode(&file, None, true)?;
    Ok(header)
}

/// Cursor over a decoded payload that reports truncation instead of panicking.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), StateFileError> {
        if self.buf.remaining() < n {
            return Err(StateFileError::Malformed(format!(
                "payload truncated: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, StateFileError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, StateFileError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn f32(&mut self) -> Result<f32, StateFileError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], StateFileError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>, StateFileError> {
        let len = n
            .checked_mul(4)
            .ok_or_else(|| StateFileError::Malformed(format!("array of {n} floats")))?;
        let raw = self.bytes(len)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Fail if anything is left over.
    pub(crate) fn finish(self) -> Result<(), StateFileError> {
        if self.buf.has_remaining() {
            return Err(StateFileError::Malformed(format!(
                "{} trailing payload bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_encode_decode_compressed() {
        let payload = vec![7u8; 1000];
        let file = encode(QAT_MAGIC, &payload, &SaveOptions::default()).unwrap();
        assert!(file.len() < HEADER_LEN + payload.len());
        let (header, back) = decode(&file, Some(QAT_MAGIC), true).unwrap();
        assert!(header.compressed);
        assert_eq!(header.original_size, 1000);
        assert_eq!(back, payload);
    }

    #[test]
    fn test_uncompressed_sizes_match() {
        let opts = SaveOptions {
            use_compression: false,
            ..SaveOptions::default()
        };
        let file = encode(MIXED_PRECISION_MAGIC, b"abc", &opts).unwrap();
        let header = parse_header(&file, None, true).unwrap();
        assert_eq!(header.original_size, header.compressed_size);
        assert_eq!(header.kind_name(), "mixed-precision");
    }

    #[test]
    fn test_wrong_magic() {
        let file = encode(QAT_MAGIC, b"abc", &SaveOptions::default()).unwrap();
        let err = decode(&file, Some(MIXED_PRECISION_MAGIC), true).unwrap_err();
        assert!(matches!(err, StateFileError::BadMagic { .. }));
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }

    #[test]
    fn test_bad_level_rejected() {
        let opts = SaveOptions {
            compression_level: 12,
            ..SaveOptions::default()
        };
        let err = encode(QAT_MAGIC, b"abc", &opts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_payload_reader_truncation() {
        let mut r = PayloadReader::new(&[1, 0, 0]);
        assert!(matches!(r.u32(), Err(StateFileError::Malformed(_))));
        let mut r = PayloadReader::new(&[1, 0, 0, 0, 9]);
        assert_eq!(r.u32().unwrap(), 1);
        assert!(r.finish().is_err());
    }
}
