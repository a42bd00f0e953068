//! MLLM weight files.
//!
//! A weight file is the 4-byte magic `0x4D4C4C4D` followed by tensors until
//! end of file. Each tensor is a `u32` dimension count, that many `u32`
//! dimension sizes, then the row-major `f32` elements. All fields are
//! little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::store::{StoreError, WeightStore};

pub const WEIGHT_MAGIC: u32 = 0x4D4C4C4D;

/// Upper bound on tensor rank accepted from a file.
pub const MAX_DIMS: u32 = 8;

/// Bytes streamed into the store per write.
const CHUNK_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum WeightFileError {
    #[error("Weight file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad weight file magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Tensor {index}: {reason}")]
    InvalidShape { index: usize, reason: String },

    #[error("Tensor {index} truncated")]
    Truncated { index: usize },

    #[error("Tensor has {actual} elements, shape needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Weight store error: {0}")]
    Store(#[from] StoreError),
}

impl WeightFileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeightFileError::Io(_) => ErrorKind::Io,
            WeightFileError::BadMagic { .. }
            | WeightFileError::InvalidShape { .. }
            | WeightFileError::Truncated { .. } => ErrorKind::CorruptData,
            WeightFileError::SizeMismatch { .. } => ErrorKind::InvalidArgument,
            WeightFileError::Store(e) => e.kind(),
        }
    }
}

/// A tensor read fully into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub dims: Vec<u32>,
    pub data: Vec<f32>,
}

impl WeightTensor {
    pub fn new(dims: Vec<u32>, data: Vec<f32>) -> Result<Self, WeightFileError> {
        let expected = element_count(&dims).unwrap_or(usize::MAX);
        if expected != data.len() {
            return Err(WeightFileError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }
}

/// Where a tensor landed in the paged address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorEntry {
    pub dims: Vec<u32>,
    /// Byte offset in the store.
    pub offset: u64,
    /// Bytes of `f32` data.
    pub len: usize,
}

impl TensorEntry {
    pub fn elements(&self) -> usize {
        self.len / std::mem::size_of::<f32>()
    }
}

fn element_count(dims: &[u32]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
}

/// Streaming tensor reader.
struct TensorReader<R> {
    inner: R,
    index: usize,
}

impl<R: Read> TensorReader<R> {
    fn new(mut inner: R) -> Result<Self, WeightFileError> {
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        let found = u32::from_le_bytes(magic);
        if found != WEIGHT_MAGIC {
            return Err(WeightFileError::BadMagic { found });
        }
        Ok(Self { inner, index: 0 })
    }

    /// Next tensor's dimensions, or `None` at a clean end of file.
    fn next_dims(&mut self) -> Result<Option<Vec<u32>>, WeightFileError> {
        let mut word = [0u8; 4];
        let mut filled = 0;
        while filled < word.len() {
            match self.inner.read(&mut word[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(WeightFileError::Truncated { index: self.index }),
                Ok(n) => filled += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let ndim = u32::from_le_bytes(word);
        let index = self.index;
        if ndim == 0 || ndim > MAX_DIMS {
            return Err(WeightFileError::InvalidShape {
                index,
                reason: format!("rank {ndim} outside 1..={MAX_DIMS}"),
            });
        }
        let mut dims = Vec::with_capacity(ndim as usize);
        for _ in 0..ndim {
            self.read_exact(&mut word)?;
            let d = u32::from_le_bytes(word);
            if d == 0 {
                return Err(WeightFileError::InvalidShape {
                    index,
                    reason: "zero-sized dimension".into(),
                });
            }
            dims.push(d);
        }
        if element_count(&dims)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .is_none()
        {
            return Err(WeightFileError::InvalidShape {
                index,
                reason: format!("shape {dims:?} overflows"),
            });
        }
        Ok(Some(dims))
    }

    /// Stream `len` data bytes of the current tensor through `sink`.
    fn read_data<F>(&mut self, mut len: usize, mut sink: F) -> Result<(), WeightFileError>
    where
        F: FnMut(&[u8]) -> Result<(), WeightFileError>,
    {
        let mut chunk = vec![0u8; CHUNK_BYTES.min(len)];
        while len > 0 {
            let n = CHUNK_BYTES.min(len);
            self.read_exact(&mut chunk[..n])?;
            sink(&chunk[..n])?;
            len -= n;
        }
        self.index += 1;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WeightFileError> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == IoErrorKind::UnexpectedEof {
                WeightFileError::Truncated { index: self.index }
            } else {
                e.into()
            }
        })
    }
}

/// Read every tensor of a weight file into memory.
pub fn read_weight_file(path: &Path) -> Result<Vec<WeightTensor>, WeightFileError> {
    let mut reader = TensorReader::new(BufReader::new(File::open(path)?))?;
    let mut tensors = Vec::new();
    while let Some(dims) = reader.next_dims()? {
        let count = element_count(&dims).unwrap_or(0);
        // Grows with the bytes actually read; the header alone is not trusted.
        let mut data = Vec::new();
        reader.read_data(count * std::mem::size_of::<f32>(), |bytes| {
            data.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
            Ok(())
        })?;
        tensors.push(WeightTensor { dims, data });
    }
    debug!(path = %path.display(), tensors = tensors.len(), "Weight file read");
    Ok(tensors)
}

pub fn write_weight_file(path: &Path, tensors: &[WeightTensor]) -> Result<(), WeightFileError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&WEIGHT_MAGIC.to_le_bytes())?;
    for tensor in tensors {
        let expected = element_count(&tensor.dims).unwrap_or(usize::MAX);
        if expected != tensor.data.len() {
            return Err(WeightFileError::SizeMismatch {
                expected,
                actual: tensor.data.len(),
            });
        }
        out.write_all(&(tensor.dims.len() as u32).to_le_bytes())?;
        for d in &tensor.dims {
            out.write_all(&d.to_le_bytes())?;
        }
        for x in &tensor.data {
            out.write_all(&x.to_le_bytes())?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Stream every tensor of a weight file into `store` at consecutive offsets
/// starting from 0.
pub fn load_into_store(path: &Path, store: &mut WeightStore) -> Result<Vec<TensorEntry>, WeightFileError> {
    let mut reader = TensorReader::new(BufReader::new(File::open(path)?))?;
    let mut entries = Vec::new();
    let mut offset = 0u64;

    while let Some(dims) = reader.next_dims()? {
        let len = element_count(&dims).unwrap_or(0) * std::mem::size_of::<f32>();
        let mut cursor = offset;
        reader.read_data(len, |bytes| {
            store.write(cursor, bytes)?;
            cursor += bytes.len() as u64;
            Ok(())
        })?;
        debug!(tensor = entries.len(), ?dims, offset, len, "Tensor paged in");
        entries.push(TensorEntry { dims, offset, len });
        offset += len as u64;
    }

    info!(
        path = %path.display(),
        tensors = entries.len(),
        bytes = offset,
        "Weight file loaded into store"
    );
    Ok(entries)
}

/// Read a tensor back out of the store.
pub fn read_tensor(store: &mut WeightStore, entry: &TensorEntry) -> Result<Vec<f32>, WeightFileError> {
    let mut data = vec![0f32; entry.elements()];
    if entry.len > 0 {
        store.read(entry.offset, bytemuck::cast_slice_mut(&mut data))?;
    }
    Ok(data)
}
