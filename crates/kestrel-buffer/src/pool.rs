//! Buffer pool core.
//!
//! Owns the control blocks and their frames, maps page ids to frames, reads
//! pages in through the volume layer, and keeps the dirty-page count the
//! cleaner's urgency thresholds are computed from. Writing pages back is the
//! cleaner's job; the pool never writes on its own and never evicts a dirty
//! frame.

use crate::control_block::{ControlBlock, FrameIndex};
use crate::latch::{LatchGuard, LatchMode};
use crate::page_table::PageTable;
use kestrel_common::page::{read_lsn, read_page_id, verify_checksum, PageHeader, PageImage, PageType};
use kestrel_common::{
    KestrelError, Lsn, PageId, Result, StorageConfig, StoreId, VolumeId, PAGE_SIZE,
};
use kestrel_storage::{BTreePage, ChildRef, VolumeStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, trace, warn};

/// Configuration for the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Replace child page ids with frame indexes in exclusively latched
    /// parents.
    pub swizzling: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            swizzling: true,
        }
    }
}

impl BufferPoolConfig {
    /// Sizes the pool to 25% of available system RAM, at least 1,000 frames.
    pub fn auto_sized() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let num_frames = (available_bytes / 4 / PAGE_SIZE).max(1_000);

        Self {
            num_frames,
            ..Default::default()
        }
    }
}

impl From<&StorageConfig> for BufferPoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
            swizzling: config.swizzling,
        }
    }
}

/// Pool-wide counters.
///
/// `dirty_pages` moves only on dirty-bit transitions (0 to 1 in
/// `set_dirty`, 1 to 0 when the cleaner or a discard clears the bit), so it
/// is exact whenever no transition is in flight. The cleaner reads it with
/// acquire ordering to pick its urgency level.
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    dirty_pages: AtomicUsize,
    pages_read: AtomicU64,
    pages_written: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPoolStats {
    pub fn dirty_pages(&self) -> usize {
        self.dirty_pages.load(Ordering::Acquire)
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read.load(Ordering::Relaxed)
    }

    pub fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub(crate) fn add_pages_written(&self, count: u64) {
        self.pages_written.fetch_add(count, Ordering::Relaxed);
    }
}

/// Where a child reference sits inside a B-tree page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildPos {
    Pid0,
    Foster,
    Slot(usize),
}

/// Every child reference stored in `image`. Empty for non-B-tree pages.
fn child_refs(image: &PageImage) -> Vec<(ChildPos, ChildRef)> {
    if PageHeader::from_bytes(&image[..]).page_type != PageType::BTree {
        return Vec::new();
    }
    let page = BTreePage::new(image);
    let mut refs = Vec::new();
    if let Some(foster) = page.foster() {
        refs.push((ChildPos::Foster, foster));
    }
    if page.is_node() {
        if let Some(pid0) = page.pid0() {
            refs.push((ChildPos::Pid0, pid0));
        }
        for slot in 0..page.nrecs() {
            if let Some(child) = page.child(slot) {
                refs.push((ChildPos::Slot(slot), child));
            }
        }
    }
    refs
}

fn set_child_ref(image: &mut PageImage, pos: ChildPos, child: ChildRef) {
    let mut page = BTreePage::new(image);
    match pos {
        ChildPos::Pid0 => page.set_pid0(Some(child)),
        ChildPos::Foster => page.set_foster(Some(child)),
        ChildPos::Slot(slot) => page.set_child(slot, child),
    }
}

/// Buffer pool manager.
///
/// Frames are addressed by `FrameIndex`. A frame is found through the page
/// table, pinned, then latched; eviction claims a frame only when its pin
/// count is zero, so a pinned frame keeps its page.
pub struct BufferPool {
    config: BufferPoolConfig,
    blocks: Box<[ControlBlock]>,
    page_table: PageTable,
    /// Frames never used since startup or returned by a discard. Its mutex
    /// also serializes page table writes.
    free_list: Mutex<Vec<FrameIndex>>,
    clock_hand: AtomicUsize,
    roots: RwLock<HashMap<(VolumeId, StoreId), FrameIndex>>,
    volumes: Arc<dyn VolumeStore>,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, volumes: Arc<dyn VolumeStore>) -> Self {
        let num_frames = config.num_frames;
        let blocks: Box<[ControlBlock]> = (0..num_frames)
            .map(|i| ControlBlock::new(i as FrameIndex))
            .collect();
        // Reversed so frames are handed out from index 0 upward.
        let free_list = (0..num_frames as FrameIndex).rev().collect();

        Self {
            config,
            blocks,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            clock_hand: AtomicUsize::new(0),
            roots: RwLock::new(HashMap::new()),
            volumes,
            stats: BufferPoolStats::default(),
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn num_frames(&self) -> usize {
        self.blocks.len()
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    pub fn volumes(&self) -> &Arc<dyn VolumeStore> {
        &self.volumes
    }

    #[inline]
    pub fn block(&self, idx: FrameIndex) -> &ControlBlock {
        &self.blocks[idx as usize]
    }

    pub fn blocks(&self) -> &[ControlBlock] {
        &self.blocks
    }

    /// Frame currently holding `page_id`. Unpinned, so only a hint.
    pub fn lookup(&self, page_id: PageId) -> Option<FrameIndex> {
        self.page_table.get(page_id)
    }

    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.stats.dirty_pages()
    }

    /// Pins the frame holding `page_id`, if the page is resident.
    fn pin_resident(&self, page_id: PageId) -> Option<FrameIndex> {
        loop {
            let idx = self.page_table.get(page_id)?;
            let cb = self.block(idx);
            if !cb.try_pin() {
                // Being evicted; the mapping is about to go away.
                std::hint::spin_loop();
                continue;
            }
            if cb.page_id() == Some(page_id) && cb.is_used() {
                return Some(idx);
            }
            cb.unpin();
        }
    }

    fn latch_pinned<'a>(
        &self,
        cb: &'a ControlBlock,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<LatchGuard<'a>> {
        if conditional {
            cb.latch().try_acquire(mode)
        } else {
            Ok(cb.latch().acquire(mode))
        }
    }

    /// Fixes `page_id`: pins its frame, loading the page if needed, and
    /// latches it in `mode`.
    ///
    /// With `conditional` a latch held by someone else yields
    /// `LatchWouldBlock` instead of waiting. With `virgin` a missing page is
    /// not read; the frame starts zeroed for the caller to format.
    pub(crate) fn fix_page(
        &self,
        page_id: PageId,
        store: StoreId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
    ) -> Result<(FrameIndex, LatchGuard<'_>)> {
        loop {
            if let Some(idx) = self.pin_resident(page_id) {
                let cb = self.block(idx);
                let guard = match self.latch_pinned(cb, mode, conditional) {
                    Ok(guard) => guard,
                    Err(e) => {
                        cb.unpin();
                        return Err(e);
                    }
                };
                // A failed load may have unbound the frame while we waited.
                if cb.page_id() != Some(page_id) || !cb.is_used() {
                    drop(guard);
                    cb.unpin();
                    continue;
                }
                return Ok((idx, guard));
            }

            if let Some(fixed) = self.load_page(page_id, store, mode, virgin)? {
                return Ok(fixed);
            }
        }
    }

    /// Binds a frame to `page_id` and fills it. Returns `None` if another
    /// thread mapped the page first.
    fn load_page(
        &self,
        page_id: PageId,
        store: StoreId,
        mode: LatchMode,
        virgin: bool,
    ) -> Result<Option<(FrameIndex, LatchGuard<'_>)>> {
        let (idx, mut guard) = {
            let mut free = self.free_list.lock();
            if self.page_table.contains(page_id) {
                return Ok(None);
            }
            let idx = self.claim_frame(&mut free)?;
            let cb = self.block(idx);
            let guard = cb.latch().exclusive();
            cb.bind(page_id, store);
            cb.release_claim_pinned();
            if !self.page_table.insert(page_id, idx) {
                cb.reset();
                cb.release_claim();
                free.push(idx);
                return Err(KestrelError::BufferPoolFull);
            }
            (idx, guard)
        };

        let cb = self.block(idx);
        let filled = match guard.image_mut() {
            Some(image) if virgin => {
                image.fill(0);
                Ok(())
            }
            Some(image) => self.read_verified(page_id, image),
            None => Err(KestrelError::Internal("load without exclusive latch".into())),
        };
        if let Err(e) = filled {
            warn!(page = %page_id, error = %e, "buffer.load_failed");
            {
                let _free = self.free_list.lock();
                self.page_table.remove(page_id);
                cb.reset();
            }
            cb.unpin();
            return Err(e);
        }

        cb.set_page_lsn(read_lsn(&guard[..]));
        if !virgin {
            self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        }
        trace!(page = %page_id, frame = idx, virgin, "buffer.load");

        let guard = match mode {
            LatchMode::Exclusive => guard,
            LatchMode::Shared => guard.downgrade(cb.latch()),
        };
        Ok(Some((idx, guard)))
    }

    /// Reads a page image and checks it. An all-zero image is a page that
    /// was allocated but never written, and is accepted as is.
    fn read_verified(&self, page_id: PageId, image: &mut PageImage) -> Result<()> {
        self.volumes.read_page(page_id, image)?;
        if image.iter().all(|&b| b == 0) {
            return Ok(());
        }
        if let Err((stored, computed)) = verify_checksum(&image[..]) {
            return Err(KestrelError::ChecksumMismatch {
                page_id: page_id.as_u64(),
                stored,
                computed,
            });
        }
        let on_page = read_page_id(&image[..]);
        if on_page != page_id {
            return Err(KestrelError::PageCorrupted {
                page_id: page_id.as_u64(),
                reason: format!("header names page {}", on_page),
            });
        }
        Ok(())
    }

    /// Takes a frame off the free list, or evicts one. The frame comes back
    /// claimed (pins fail) and unbound.
    fn claim_frame(&self, free: &mut Vec<FrameIndex>) -> Result<FrameIndex> {
        while let Some(idx) = free.pop() {
            let cb = self.block(idx);
            // The clock may already have reused a listed frame.
            if !cb.is_used() && cb.try_claim_for_eviction() {
                return Ok(idx);
            }
        }
        self.evict_one()
    }

    /// Clock sweep over the frames. Called with the free list locked.
    fn evict_one(&self) -> Result<FrameIndex> {
        let n = self.blocks.len();
        for _ in 0..n * 2 {
            let idx = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
            let cb = &self.blocks[idx];

            if !cb.is_used() {
                // Left unbound by a failed load.
                if cb.try_claim_for_eviction() {
                    return Ok(idx as FrameIndex);
                }
                continue;
            }
            if cb.take_reference_bit() || !cb.is_evictable() {
                continue;
            }
            if !cb.try_claim_for_eviction() {
                continue;
            }
            // Only a pin can dirty a page, and pins now fail.
            if !cb.is_evictable_claimed() {
                cb.release_claim();
                continue;
            }
            let guard = match cb.latch().try_exclusive() {
                Ok(guard) => guard,
                Err(_) => {
                    cb.release_claim();
                    continue;
                }
            };

            if let Some(page_id) = cb.page_id() {
                self.page_table.remove(page_id);
                trace!(page = %page_id, frame = idx, "buffer.evict");
            }
            self.release_swizzled_children(&guard);
            cb.reset();
            drop(guard);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(idx as FrameIndex);
        }
        Err(KestrelError::BufferPoolFull)
    }

    /// Children an evicted parent pointed at by frame index may be evicted
    /// themselves from now on.
    fn release_swizzled_children(&self, image: &PageImage) {
        for (_, child) in child_refs(image) {
            if let ChildRef::FrameIndex(child_idx) = child {
                if let Some(cb) = self.blocks.get(child_idx as usize) {
                    cb.set_swizzled(false);
                }
            }
        }
    }

    /// Pins and latches a frame by index. For swizzled pointers and refixes,
    /// where the frame is known to stay resident.
    pub(crate) fn fix_direct(
        &self,
        idx: FrameIndex,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<LatchGuard<'_>> {
        let cb = self
            .blocks
            .get(idx as usize)
            .ok_or_else(|| KestrelError::Internal(format!("frame {} out of range", idx)))?;
        if !cb.try_pin() {
            return Err(KestrelError::FrameMismatch {
                frame: idx,
                page_id: 0,
            });
        }
        if !cb.is_used() {
            cb.unpin();
            return Err(KestrelError::FrameMismatch {
                frame: idx,
                page_id: 0,
            });
        }
        match self.latch_pinned(cb, mode, conditional) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                cb.unpin();
                Err(e)
            }
        }
    }

    pub(crate) fn unfix(&self, idx: FrameIndex) {
        self.block(idx).unpin();
    }

    /// Adds a pin that outlives the current fix.
    pub(crate) fn pin_for_refix(&self, idx: FrameIndex) -> Result<()> {
        if self.block(idx).try_pin() {
            Ok(())
        } else {
            Err(KestrelError::FrameMismatch {
                frame: idx,
                page_id: 0,
            })
        }
    }

    pub fn unpin_for_refix(&self, idx: FrameIndex) {
        self.block(idx).unpin();
    }

    /// Registers `page_id` as the root of `(vol, store)` and keeps it
    /// resident for good.
    pub fn register_root(&self, page_id: PageId, store: StoreId) -> Result<()> {
        let (idx, guard) = self.fix_page(page_id, store, LatchMode::Shared, false, false)?;
        drop(guard);
        self.install_root(page_id.vol, store, idx);
        Ok(())
    }

    /// Keeps the fix's pin as the registry's pin.
    fn install_root(&self, vol: VolumeId, store: StoreId, idx: FrameIndex) {
        let cb = self.block(idx);
        cb.set_root(true);
        let previous = self.roots.write().insert((vol, store), idx);
        match previous {
            Some(old) if old != idx => {
                let old_cb = self.block(old);
                old_cb.set_root(false);
                old_cb.unpin();
            }
            // Re-registering the same frame: drop the extra pin.
            Some(_) => {
                cb.unpin();
            }
            None => {}
        }
        debug!(vol, store, frame = idx, "buffer.register_root");
    }

    pub(crate) fn fix_root(
        &self,
        vol: VolumeId,
        store: StoreId,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<(FrameIndex, LatchGuard<'_>)> {
        let idx = self
            .roots
            .read()
            .get(&(vol, store))
            .copied()
            .ok_or(KestrelError::StoreNotFound { vol, store })?;
        let guard = self.fix_direct(idx, mode, conditional)?;
        Ok((idx, guard))
    }

    /// Binds a fresh root frame for a new store. The frame comes back zeroed
    /// and exclusively latched.
    pub(crate) fn fix_virgin_root(
        &self,
        page_id: PageId,
        store: StoreId,
    ) -> Result<(FrameIndex, LatchGuard<'_>)> {
        let (idx, guard) = self.fix_page(page_id, store, LatchMode::Exclusive, false, true)?;
        // One pin for the caller's fix, one for the registry.
        self.pin_for_refix(idx)?;
        self.install_root(page_id.vol, store, idx);
        Ok((idx, guard))
    }

    pub fn root_frame(&self, vol: VolumeId, store: StoreId) -> Option<FrameIndex> {
        self.roots.read().get(&(vol, store)).copied()
    }

    /// Sets the dirty bit, counting the page on its clean-to-dirty edge.
    pub(crate) fn set_dirty(&self, idx: FrameIndex) {
        if !self.block(idx).mark_dirty() {
            self.stats.dirty_pages.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clears the dirty bit, uncounting the page if it was dirty.
    pub(crate) fn clear_dirty(&self, idx: FrameIndex) {
        if self.block(idx).mark_clean() {
            self.stats.dirty_pages.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Mirrors a new page LSN into the control block.
    pub(crate) fn note_page_lsn(&self, idx: FrameIndex, lsn: Lsn) {
        let cb = self.block(idx);
        cb.set_page_lsn(lsn);
        cb.note_rec_lsn(lsn);
    }

    /// Records that `dependency` must reach disk no later than `page`.
    pub(crate) fn register_write_order_dependency(
        &self,
        page: FrameIndex,
        dependency: FrameIndex,
        dependency_page_num: u32,
        dependency_lsn: Lsn,
    ) -> bool {
        if page == dependency {
            return false;
        }
        self.block(page)
            .set_dependency(dependency, dependency_page_num, dependency_lsn);
        true
    }

    /// Drops a page from the pool without writing it. Fails (returns false)
    /// if the frame was rebound or someone holds a pin or the latch.
    pub(crate) fn discard_frame(&self, idx: FrameIndex, page_id: PageId) -> bool {
        let mut free = self.free_list.lock();
        let cb = self.block(idx);
        if cb.page_id() != Some(page_id) || !cb.try_claim_for_eviction() {
            return false;
        }
        let guard = match cb.latch().try_exclusive() {
            Ok(guard) => guard,
            Err(_) => {
                cb.release_claim();
                return false;
            }
        };

        self.page_table.remove(page_id);
        if cb.mark_clean() {
            self.stats.dirty_pages.fetch_sub(1, Ordering::AcqRel);
        }
        if cb.is_root() {
            self.roots.write().retain(|_, frame| *frame != idx);
        }
        self.release_swizzled_children(&guard);
        cb.reset();
        drop(guard);
        cb.release_claim();
        free.push(idx);
        debug!(page = %page_id, frame = idx, "buffer.discard");
        true
    }

    /// Replaces the on-disk child reference to `child_page_num` with the
    /// frame index `child_idx`. The caller holds the parent exclusively.
    pub(crate) fn swizzle_child(
        &self,
        parent: &mut PageImage,
        child_page_num: u32,
        child_idx: FrameIndex,
    ) -> bool {
        if !self.config.swizzling {
            return false;
        }
        let pos = child_refs(parent)
            .into_iter()
            .find(|(_, child)| *child == ChildRef::PageId(child_page_num))
            .map(|(pos, _)| pos);
        match pos {
            Some(pos) => {
                set_child_ref(parent, pos, ChildRef::FrameIndex(child_idx));
                self.block(child_idx).set_swizzled(true);
                true
            }
            None => false,
        }
    }

    /// Converts every swizzled child reference in a copied image back to a
    /// page id. Write-back runs this on its copy before checksumming.
    pub fn unswizzle_image(&self, image: &mut PageImage) -> Result<()> {
        for (pos, child) in child_refs(image) {
            if let ChildRef::FrameIndex(child_idx) = child {
                let page_num = self
                    .blocks
                    .get(child_idx as usize)
                    .and_then(|cb| cb.page_id())
                    .map(|page_id| page_id.page_num)
                    .ok_or_else(|| KestrelError::PageCorrupted {
                        page_id: read_page_id(&image[..]).as_u64(),
                        reason: format!("swizzled child in unbound frame {}", child_idx),
                    })?;
                set_child_ref(image, pos, ChildRef::PageId(page_num));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("num_frames", &self.num_frames())
            .field("dirty_pages", &self.stats.dirty_pages())
            .field("swizzling", &self.config.swizzling)
            .finish()
    }
}
