//! Paged weight store.
//!
//! Presents a flat logical byte address space for model weights. A bounded
//! table of resident pages is backed by compressed swap files; pages are
//! faulted in on demand and the least recently used page is evicted (after
//! flushing, if dirty) when the table is full.

pub mod page;
pub mod shared;
pub mod swap;

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, CompressContext};
use crate::config::{CodecConfig, StoreConfig};
use crate::error::ErrorKind;
use page::{spans, Page, PageId};
use swap::{SwapDir, SwapStats};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Out of memory allocating a {size}-byte page")]
    OutOfMemory { size: usize },

    #[error("Swap I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt swap file for page {page_id}: {reason}")]
    CorruptData { page_id: PageId, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Empty read or write at offset {offset}")]
    EmptyRange { offset: u64 },

    #[error("Range at offset {offset} with length {length} overflows the address space")]
    InvalidRange { offset: u64, length: usize },

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Blocking worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::OutOfMemory { .. } => ErrorKind::Allocation,
            StoreError::Io(_) | StoreError::Worker(_) => ErrorKind::Io,
            StoreError::CorruptData { .. } => ErrorKind::CorruptData,
            StoreError::Codec(e) => e.kind(),
            StoreError::EmptyRange { .. }
            | StoreError::InvalidRange { .. }
            | StoreError::InvalidConfig(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Counters for page table activity.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    /// Accesses to an already-resident page.
    pub hits: u64,
    /// Accesses that had to bring a page in.
    pub faults: u64,
    /// Faults satisfied from a swap file.
    pub swap_reads: u64,
    /// Faults satisfied by zero-filling a never-written page.
    pub zero_fills: u64,
    pub evictions: u64,
    pub flushes: u64,
    /// Uncompressed bytes flushed to swap.
    pub bytes_flushed: u64,
}

/// Virtual-memory-style page cache over a logical weight address space.
pub struct WeightStore {
    config: StoreConfig,

    /// Resident pages, in insertion order.
    pages: Vec<Page>,

    /// page_id → index into `pages`.
    index: HashMap<PageId, usize>,

    /// Codec session shared by every swap file of this store.
    codec: CompressContext,

    swap: SwapDir,

    /// Decode buffer for swap reads.
    scratch: Vec<u8>,

    /// Logical clock for `last_access`.
    clock: u64,

    /// Patterns already persisted in `dictionary.bin`.
    saved_patterns: usize,

    stats: StoreStats,
}

impl WeightStore {
    /// Open a store over `config.swap_dir`, reloading the codec dictionary
    /// saved alongside the swap files.
    pub fn open(config: StoreConfig, codec: CodecConfig) -> Result<Self, StoreError> {
        if config.page_size == 0 {
            return Err(StoreError::InvalidConfig("page_size must be non-zero".into()));
        }
        if config.max_active_pages == 0 {
            return Err(StoreError::InvalidConfig(
                "max_active_pages must be non-zero".into(),
            ));
        }

        let swap = SwapDir::open(config.swap_dir.clone())?;
        let mut codec = CompressContext::new(codec)?;
        let dictionary = swap.dictionary_path();
        if dictionary.exists() {
            codec.load_dictionary(&dictionary)?;
        }
        let scratch = alloc_zeroed(config.page_size)?;
        let saved_patterns = codec.dictionary().len();

        info!(
            swap_dir = %swap.dir().display(),
            page_size = config.page_size,
            max_active_pages = config.max_active_pages,
            patterns = codec.dictionary().len(),
            "Opened weight store"
        );

        Ok(Self {
            config,
            pages: Vec::new(),
            index: HashMap::new(),
            codec,
            swap,
            scratch,
            clock: 0,
            saved_patterns,
            stats: StoreStats::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn swap_stats(&self) -> &SwapStats {
        self.swap.stats()
    }

    /// Compressed over uncompressed bytes for every page flushed this session.
    pub fn compression_ratio(&self) -> f64 {
        self.codec.ratio()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.index.contains_key(&page_id)
    }

    /// `None` when the page is not resident.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        self.index.get(&page_id).map(|&idx| self.pages[idx].dirty)
    }

    /// Copy `dest.len()` bytes starting at `offset` into `dest`.
    pub fn read(&mut self, offset: u64, dest: &mut [u8]) -> Result<(), StoreError> {
        check_range(offset, dest.len())?;
        for span in spans(offset, dest.len(), self.config.page_size) {
            let idx = self.fault_in(span.page_id)?;
            let page = &self.pages[idx].data;
            dest[span.buf_offset..span.buf_offset + span.len]
                .copy_from_slice(&page[span.page_offset..span.page_offset + span.len]);
        }
        Ok(())
    }

    /// Copy `src` into the address space at `offset`, dirtying every touched page.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<(), StoreError> {
        check_range(offset, src.len())?;
        for span in spans(offset, src.len(), self.config.page_size) {
            let idx = self.fault_in(span.page_id)?;
            let page = &mut self.pages[idx];
            page.data[span.page_offset..span.page_offset + span.len]
                .copy_from_slice(&src[span.buf_offset..span.buf_offset + span.len]);
            page.dirty = true;
        }
        Ok(())
    }

    /// Make `page_id` resident and return its table index.
    pub fn fault_in(&mut self, page_id: PageId) -> Result<usize, StoreError> {
        self.clock += 1;
        let now = self.clock;

        if let Some(&idx) = self.index.get(&page_id) {
            self.pages[idx].last_access = now;
            self.stats.hits += 1;
            return Ok(idx);
        }
        self.stats.faults += 1;

        if self.pages.len() < self.config.max_active_pages {
            let mut data = alloc_zeroed(self.config.page_size)?;
            if self.read_swap(page_id)? {
                data.copy_from_slice(&self.scratch);
            }
            let idx = self.pages.len();
            self.pages.push(Page {
                page_id,
                data,
                dirty: false,
                last_access: now,
            });
            self.index.insert(page_id, idx);
            debug!(page_id, resident = self.pages.len(), "Faulted in page");
            return Ok(idx);
        }

        let victim = self.lru_victim();
        if self.pages[victim].dirty {
            self.flush_page(victim)?;
        }
        let loaded = self.read_swap(page_id)?;

        let page = &mut self.pages[victim];
        let evicted = page.page_id;
        if loaded {
            page.data.copy_from_slice(&self.scratch);
        } else {
            page.data.fill(0);
        }
        page.page_id = page_id;
        page.dirty = false;
        page.last_access = now;
        self.index.remove(&evicted);
        self.index.insert(page_id, victim);
        self.stats.evictions += 1;

        debug!(page_id, evicted, slot = victim, "Evicted page");
        Ok(victim)
    }

    /// Compress and persist every dirty page, then the codec dictionary.
    ///
    /// Stops at the first failure; pages that were not written stay dirty.
    pub fn flush_all(&mut self) -> Result<(), StoreError> {
        let mut flushed = 0usize;
        for idx in 0..self.pages.len() {
            if self.pages[idx].dirty {
                self.flush_page(idx)?;
                flushed += 1;
            }
        }
        self.save_dictionary()?;
        info!(
            flushed,
            ratio = format!("{:.3}", self.codec.ratio()),
            "Flushed weight store"
        );
        Ok(())
    }

    /// Oldest `last_access`; the first such page in table order wins ties.
    fn lru_victim(&self) -> usize {
        let mut victim = 0;
        for (idx, page) in self.pages.iter().enumerate().skip(1) {
            if page.last_access < self.pages[victim].last_access {
                victim = idx;
            }
        }
        victim
    }

    fn flush_page(&mut self, idx: usize) -> Result<(), StoreError> {
        let page = &self.pages[idx];
        let compressed = self.codec.compress(&page.data)?;
        // A swap file must never reference patterns missing from dictionary.bin.
        self.save_dictionary()?;
        let page = &self.pages[idx];
        if let Err(e) = self.swap.write_page(page.page_id, &compressed) {
            warn!(page_id = page.page_id, error = %e, "Swap write failed, page stays dirty");
            return Err(e.into());
        }
        self.stats.flushes += 1;
        self.stats.bytes_flushed += self.config.page_size as u64;
        self.pages[idx].dirty = false;
        Ok(())
    }

    /// Persist the dictionary if it grew since the last save.
    fn save_dictionary(&mut self) -> Result<(), StoreError> {
        let patterns = self.codec.dictionary().len();
        if patterns == self.saved_patterns && self.swap.dictionary_path().exists() {
            return Ok(());
        }
        self.codec.save_dictionary(&self.swap.dictionary_path())?;
        self.saved_patterns = patterns;
        Ok(())
    }

    /// Decode `page_id`'s swap file into `scratch`. Returns false when the
    /// page was never written.
    fn read_swap(&mut self, page_id: PageId) -> Result<bool, StoreError> {
        let Some(compressed) = self.swap.read_page(page_id)? else {
            self.stats.zero_fills += 1;
            return Ok(false);
        };
        let decoded = self
            .codec
            .decompress_into(&compressed, &mut self.scratch)
            .map_err(|e| StoreError::CorruptData {
                page_id,
                reason: e.to_string(),
            })?;
        if decoded != self.config.page_size {
            return Err(StoreError::CorruptData {
                page_id,
                reason: format!(
                    "decoded {decoded} bytes, expected {}",
                    self.config.page_size
                ),
            });
        }
        self.stats.swap_reads += 1;
        Ok(true)
    }
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("swap_dir", &self.swap.dir())
            .field("resident", &self.pages.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn check_range(offset: u64, length: usize) -> Result<(), StoreError> {
    if length == 0 {
        return Err(StoreError::EmptyRange { offset });
    }
    if offset.checked_add(length as u64).is_none() {
        return Err(StoreError::InvalidRange { offset, length });
    }
    Ok(())
}

fn alloc_zeroed(size: usize) -> Result<Vec<u8>, StoreError> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| StoreError::OutOfMemory { size })?;
    data.resize(size, 0);
    Ok(data)
}
