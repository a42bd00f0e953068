//! Resident page record and address-range splitting.

/// Identifier of a `page_size`-byte page: `offset / page_size`.
pub type PageId = u64;

/// A resident page.
#[derive(Debug)]
pub struct Page {
    pub page_id: PageId,
    pub data: Vec<u8>,
    /// Modified since it was loaded or last flushed.
    pub dirty: bool,
    /// Logical tick of the most recent access.
    pub last_access: u64,
}

/// The part of a byte range that falls inside a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub page_id: PageId,
    /// Offset of the span within its page.
    pub page_offset: usize,
    /// Offset of the span within the caller's buffer.
    pub buf_offset: usize,
    pub len: usize,
}

/// Iterator over the per-page pieces of `[offset, offset + length)`.
#[derive(Debug, Clone)]
pub struct Spans {
    offset: u64,
    remaining: usize,
    buf_offset: usize,
    page_size: usize,
}

/// Split `[offset, offset + length)` at page boundaries.
pub fn spans(offset: u64, length: usize, page_size: usize) -> Spans {
    Spans {
        offset,
        remaining: length,
        buf_offset: 0,
        page_size,
    }
}

impl Iterator for Spans {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.remaining == 0 || self.page_size == 0 {
            return None;
        }
        let page_size = self.page_size as u64;
        let page_offset = (self.offset % page_size) as usize;
        let len = (self.page_size - page_offset).min(self.remaining);
        let span = Span {
            page_id: self.offset / page_size,
            page_offset,
            buf_offset: self.buf_offset,
            len,
        };
        self.offset += len as u64;
        self.buf_offset += len;
        self.remaining -= len;
        Some(span)
    }
}
