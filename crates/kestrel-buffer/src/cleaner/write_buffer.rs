//! Scratch space for one contiguous run of page images.

use crate::control_block::FrameIndex;
use kestrel_common::page::{read_lsn, PageImage};
use kestrel_common::{KestrelError, Lsn, PageId, Result, PAGE_SIZE};

/// A page copied into the buffer, with what is needed to decide afterwards
/// whether its frame may be marked clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferedPage {
    pub idx: FrameIndex,
    pub page_id: PageId,
    /// LSN of the copy that was written.
    pub lsn: Lsn,
}

/// Page images for consecutive page numbers of one volume, laid out back to
/// back for a single `write_many_pages` call.
pub(crate) struct WriteBuffer {
    pages: Vec<u8>,
    entries: Vec<BufferedPage>,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pages: vec![0u8; capacity * PAGE_SIZE],
            entries: Vec::with_capacity(capacity),
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
        self.entries.len() == self.capacity
    }

    pub fn start(&self) -> Option<PageId> {
        self.entries.first().map(|e| e.page_id)
    }

    /// True if `page_id` extends the buffered run without a gap.
    pub fn continues_run(&self, page_id: PageId) -> bool {
        match self.entries.last() {
            None => true,
            Some(last) => {
                last.page_id.vol == page_id.vol
                    && last.page_id.page_num.checked_add(1) == Some(page_id.page_num)
            }
        }
    }

    /// Highest LSN among the buffered copies.
    pub fn max_lsn(&self) -> Lsn {
        self.entries.iter().map(|e| e.lsn).max().unwrap_or(Lsn::INVALID)
    }

    /// Appends `image` and returns the slot holding the copy, for the caller
    /// to finish (unswizzle, checksum) before releasing its latch.
    pub fn push(&mut self, idx: FrameIndex, page_id: PageId, image: &PageImage) -> Result<&mut PageImage> {
        if self.is_full() {
            return Err(KestrelError::Internal("write buffer overflow".to_string()));
        }
        let slot = self.entries.len();
        self.entries.push(BufferedPage {
            idx,
            page_id,
            lsn: read_lsn(&image[..]),
        });
        let copy: &mut PageImage = (&mut self.pages[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE])
            .try_into()
            .map_err(|_| KestrelError::Internal("write buffer slot is not page sized".to_string()))?;
        copy.copy_from_slice(&image[..]);
        Ok(copy)
    }

    /// The buffered images, back to back.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pages[..self.entries.len() * PAGE_SIZE]
    }

    pub fn entries(&self) -> &[BufferedPage] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
