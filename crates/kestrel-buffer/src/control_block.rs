//! Buffer control blocks.

use crate::latch::Latch;
use kestrel_common::page::PageId;
use kestrel_common::{Lsn, StoreId};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Index of a frame in the buffer pool.
pub type FrameIndex = u32;

/// Sentinel value indicating no page is bound to the block.
const NO_PAGE: u64 = u64::MAX;

/// Sentinel for an unset dependency.
const NO_FRAME: u32 = u32::MAX;

/// Pin count value held while the frame is being evicted or discarded.
const PIN_EVICTING: i32 = -1;

/// Bookkeeping for one buffer frame.
///
/// The page image itself lives inside `latch`. Every other field is an
/// atomic so the cleaner can run its fuzzy scan without latching; any
/// decision taken on that scan is re-checked under the latch before it
/// touches the page.
pub struct ControlBlock {
    idx: FrameIndex,
    /// Packed `PageId`, or `NO_PAGE`.
    page_id: AtomicU64,
    store: AtomicU16,
    used: AtomicBool,
    dirty: AtomicBool,
    /// Recovery has not decided this page yet; the cleaner must skip it.
    in_doubt: AtomicBool,
    recovery_access: AtomicBool,
    /// Non-negative pin count, or `PIN_EVICTING`.
    pin_count: AtomicI32,
    /// LSN of the first update since the page was last clean.
    rec_lsn: AtomicU64,
    /// Mirror of the header LSN, readable without the latch.
    page_lsn: AtomicU64,
    /// Frame of a page that has to reach disk no later than this one.
    dependency_idx: AtomicU32,
    dependency_page_num: AtomicU32,
    dependency_lsn: AtomicU64,
    /// A parent holds this frame's index in place of its page id.
    swizzled: AtomicBool,
    /// Pinned for good as a store root.
    is_root: AtomicBool,
    reference_bit: AtomicBool,
    latch: Latch,
}

impl ControlBlock {
    pub fn new(idx: FrameIndex) -> Self {
        Self {
            idx,
            page_id: AtomicU64::new(NO_PAGE),
            store: AtomicU16::new(0),
            used: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            in_doubt: AtomicBool::new(false),
            recovery_access: AtomicBool::new(false),
            pin_count: AtomicI32::new(0),
            rec_lsn: AtomicU64::new(0),
            page_lsn: AtomicU64::new(0),
            dependency_idx: AtomicU32::new(NO_FRAME),
            dependency_page_num: AtomicU32::new(0),
            dependency_lsn: AtomicU64::new(0),
            swizzled: AtomicBool::new(false),
            is_root: AtomicBool::new(false),
            reference_bit: AtomicBool::new(false),
            latch: Latch::new(),
        }
    }

    #[inline]
    pub fn idx(&self) -> FrameIndex {
        self.idx
    }

    #[inline]
    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Returns the page bound to this block.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId::from_u64(packed))
        }
    }

    pub(crate) fn bind(&self, page_id: PageId, store: StoreId) {
        self.store.store(store, Ordering::Relaxed);
        self.page_id.store(page_id.as_u64(), Ordering::Release);
        self.used.store(true, Ordering::Release);
    }

    #[inline]
    pub fn store(&self) -> StoreId {
        self.store.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets the dirty bit and returns its previous value.
    #[inline]
    pub(crate) fn mark_dirty(&self) -> bool {
        self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Clears the dirty bit and the recovery LSN. Returns the previous bit.
    #[inline]
    pub(crate) fn mark_clean(&self) -> bool {
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        self.rec_lsn.store(0, Ordering::Release);
        was_dirty
    }

    #[inline]
    pub fn is_in_doubt(&self) -> bool {
        self.in_doubt.load(Ordering::Acquire)
    }

    pub fn set_in_doubt(&self, in_doubt: bool) {
        self.in_doubt.store(in_doubt, Ordering::Release);
    }

    #[inline]
    pub fn recovery_access(&self) -> bool {
        self.recovery_access.load(Ordering::Acquire)
    }

    pub fn set_recovery_access(&self, access: bool) {
        self.recovery_access.store(access, Ordering::Release);
    }

    #[inline]
    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count unless the frame is being evicted.
    #[inline]
    pub(crate) fn try_pin(&self) -> bool {
        let pinned = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count >= 0).then_some(count + 1)
            })
            .is_ok();
        if pinned {
            self.reference_bit.store(true, Ordering::Relaxed);
        }
        pinned
    }

    /// Decrements the pin count and returns the new count.
    #[inline]
    pub(crate) fn unpin(&self) -> i32 {
        match self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count - 1)
            }) {
            Ok(prev) => prev - 1,
            Err(current) => current,
        }
    }

    /// Claims an unpinned frame for eviction. Pins fail until `release`.
    #[inline]
    pub(crate) fn try_claim_for_eviction(&self) -> bool {
        self.pin_count
            .compare_exchange(0, PIN_EVICTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives back a claimed frame, pinned once for the new owner.
    #[inline]
    pub(crate) fn release_claim_pinned(&self) {
        self.pin_count.store(1, Ordering::Release);
    }

    /// Gives back a claimed frame without pinning it.
    #[inline]
    pub(crate) fn release_claim(&self) {
        self.pin_count.store(0, Ordering::Release);
    }

    #[inline]
    pub fn rec_lsn(&self) -> Lsn {
        Lsn(self.rec_lsn.load(Ordering::Acquire))
    }

    /// Records `lsn` as the recovery LSN if none is set yet.
    pub(crate) fn note_rec_lsn(&self, lsn: Lsn) {
        let _ = self
            .rec_lsn
            .compare_exchange(0, lsn.0, Ordering::AcqRel, Ordering::Acquire);
    }

    #[inline]
    pub fn page_lsn(&self) -> Lsn {
        Lsn(self.page_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn.0, Ordering::Release);
    }

    /// Returns the recorded write-order dependency:
    /// `(frame, page number, lsn)`.
    pub fn dependency(&self) -> Option<(FrameIndex, u32, Lsn)> {
        let idx = self.dependency_idx.load(Ordering::Acquire);
        if idx == NO_FRAME {
            return None;
        }
        Some((
            idx,
            self.dependency_page_num.load(Ordering::Acquire),
            Lsn(self.dependency_lsn.load(Ordering::Acquire)),
        ))
    }

    pub(crate) fn set_dependency(&self, idx: FrameIndex, page_num: u32, lsn: Lsn) {
        self.dependency_page_num.store(page_num, Ordering::Release);
        self.dependency_lsn.store(lsn.0, Ordering::Release);
        self.dependency_idx.store(idx, Ordering::Release);
    }

    pub(crate) fn clear_dependency(&self) {
        self.dependency_idx.store(NO_FRAME, Ordering::Release);
        self.dependency_page_num.store(0, Ordering::Release);
        self.dependency_lsn.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_swizzled(&self) -> bool {
        self.swizzled.load(Ordering::Acquire)
    }

    pub(crate) fn set_swizzled(&self, swizzled: bool) {
        self.swizzled.store(swizzled, Ordering::Release);
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, root: bool) {
        self.is_root.store(root, Ordering::Release);
    }

    /// Clock sweep: returns the old reference bit and clears it.
    #[inline]
    pub(crate) fn take_reference_bit(&self) -> bool {
        self.reference_bit.swap(false, Ordering::Relaxed)
    }

    /// True if eviction may take this frame: resident, clean, unpinned, and
    /// not reachable through a swizzled pointer.
    pub(crate) fn is_evictable(&self) -> bool {
        self.is_used()
            && !self.is_dirty()
            && self.pin_count() == 0
            && !self.is_swizzled()
            && !self.is_root()
            && !self.is_in_doubt()
    }

    /// Re-check after the eviction claim, when the pin count holds the
    /// claim marker.
    pub(crate) fn is_evictable_claimed(&self) -> bool {
        self.is_used() && !self.is_dirty() && !self.is_swizzled() && !self.is_root()
    }

    /// Returns the block to the unused state. The caller has claimed it.
    pub(crate) fn reset(&self) {
        self.used.store(false, Ordering::Release);
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.store.store(0, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Release);
        self.in_doubt.store(false, Ordering::Release);
        self.recovery_access.store(false, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.swizzled.store(false, Ordering::Release);
        self.is_root.store(false, Ordering::Release);
        self.reference_bit.store(false, Ordering::Relaxed);
        self.clear_dependency();
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("idx", &self.idx)
            .field("page_id", &self.page_id())
            .field("used", &self.is_used())
            .field("dirty", &self.is_dirty())
            .field("in_doubt", &self.is_in_doubt())
            .field("pin_count", &self.pin_count())
            .field("rec_lsn", &self.rec_lsn())
            .field("page_lsn", &self.page_lsn())
            .finish()
    }
}
