//! Swap directory for compressed weight pages.
//!
//! One file per page, `weight_page<id>.bin`, holding the raw codec stream of
//! exactly one page. Writes land in a `.tmp` sibling and are renamed into
//! place so a crash never leaves a half-written page behind.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::page::PageId;

/// File the session dictionary is persisted to.
const DICTIONARY_FILE: &str = "dictionary.bin";

#[derive(Debug, Default, Clone, Serialize)]
pub struct SwapStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
    /// Reads of pages that were never written.
    pub misses: u64,
}

/// Reads and writes page files under one directory.
#[derive(Debug)]
pub struct SwapDir {
    dir: PathBuf,
    stats: SwapStats,
}

impl SwapDir {
    /// Open `dir`, creating it if needed.
    pub fn open(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stats: SwapStats::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, page_id: PageId) -> PathBuf {
        self.dir.join(format!("weight_page{page_id}.bin"))
    }

    pub fn dictionary_path(&self) -> PathBuf {
        self.dir.join(DICTIONARY_FILE)
    }

    /// Write a compressed page.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> std::io::Result<()> {
        let path = self.page_path(page_id);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        debug!(page_id, path = %path.display(), size = data.len(), "Wrote page to swap");
        self.stats.total_writes += 1;
        self.stats.total_bytes_written += data.len() as u64;
        Ok(())
    }

    /// Read a compressed page. `Ok(None)` means the page was never swapped out.
    pub fn read_page(&mut self, page_id: PageId) -> std::io::Result<Option<Vec<u8>>> {
        let path = self.page_path(page_id);
        match std::fs::read(&path) {
            Ok(data) => {
                debug!(page_id, path = %path.display(), size = data.len(), "Read page from swap");
                self.stats.total_reads += 1;
                self.stats.total_bytes_read += data.len() as u64;
                Ok(Some(data))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.stats.misses += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> &SwapStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_page() {
        let tmp = TempDir::new().unwrap();
        let mut swap = SwapDir::open(tmp.path().join("swap")).unwrap();

        swap.write_page(7, b"compressed").unwrap();
        assert!(swap.page_path(7).ends_with("weight_page7.bin"));
        assert!(!swap.page_path(7).with_extension("bin.tmp").exists());

        assert_eq!(swap.read_page(7).unwrap().as_deref(), Some(&b"compressed"[..]));
        assert_eq!(swap.stats().total_writes, 1);
        assert_eq!(swap.stats().total_bytes_read, 10);
    }

    #[test]
    fn test_missing_page_is_none() {
        let tmp = TempDir::new().unwrap();
        let mut swap = SwapDir::open(tmp.path().to_path_buf()).unwrap();
        assert!(swap.read_page(42).unwrap().is_none());
        assert_eq!(swap.stats().misses, 1);
    }
}
