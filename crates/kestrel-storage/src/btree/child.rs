//! Child page references.

/// Tag bit marking a swizzled reference in the stored 4-byte form.
const SWIZZLED_BIT: u32 = 0x8000_0000;

/// A reference from a B-tree page to another page.
///
/// On disk a child is always a page number. While the parent is resident the
/// buffer pool may replace it with the index of the frame holding the child,
/// which lets descents skip the page table. Write-back converts any
/// `FrameIndex` back to a `PageId` before the image leaves memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRef {
    PageId(u32),
    FrameIndex(u32),
}

impl ChildRef {
    /// Decodes the stored form. Zero means "no page".
    pub fn decode(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else if raw & SWIZZLED_BIT != 0 {
            Some(ChildRef::FrameIndex(raw & !SWIZZLED_BIT))
        } else {
            Some(ChildRef::PageId(raw))
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            ChildRef::PageId(page_num) => page_num & !SWIZZLED_BIT,
            ChildRef::FrameIndex(idx) => idx | SWIZZLED_BIT,
        }
    }

    /// Encodes an optional reference, writing zero for `None`.
    pub fn encode_opt(child: Option<Self>) -> u32 {
        child.map_or(0, Self::encode)
    }

    pub fn is_swizzled(&self) -> bool {
        matches!(self, ChildRef::FrameIndex(_))
    }

    /// Page number, if this reference is not swizzled.
    pub fn page_num(&self) -> Option<u32> {
        match self {
            ChildRef::PageId(page_num) => Some(*page_num),
            ChildRef::FrameIndex(_) => None,
        }
    }
}
