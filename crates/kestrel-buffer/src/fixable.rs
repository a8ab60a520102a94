//! Fixable page handles.
//!
//! A `FixablePage` ties a page to what currently backs it: nothing, a pinned
//! and latched buffer frame, or a caller-owned image outside the pool. It is
//! the only place foreground code pins, latches, and dirties frames.

use crate::control_block::FrameIndex;
use crate::latch::{LatchGuard, LatchMode};
use crate::pool::BufferPool;
use kestrel_common::page::{read_flags, read_page_id, read_lsn, write_flags, write_lsn, PageHeader, PageImage};
use kestrel_common::{KestrelError, Lsn, PageId, Result, StoreId, VolumeId};
use kestrel_storage::{BTreePage, ChildRef};
use std::mem;
use tracing::trace;

enum Binding<'a> {
    Unfixed,
    Frame {
        pool: &'a BufferPool,
        idx: FrameIndex,
        guard: LatchGuard<'a>,
    },
    Standalone(&'a mut PageImage),
}

/// A page fixed in the buffer pool, or a standalone image.
///
/// Dropping the handle unfixes it.
pub struct FixablePage<'a> {
    binding: Binding<'a>,
}

impl<'a> FixablePage<'a> {
    /// An unfixed handle.
    pub fn new() -> Self {
        Self {
            binding: Binding::Unfixed,
        }
    }

    /// Wraps a page image the buffer pool does not manage. Such a handle
    /// behaves as exclusively latched and ignores `set_dirty`.
    pub fn standalone(image: &'a mut PageImage) -> Self {
        Self {
            binding: Binding::Standalone(image),
        }
    }

    /// Fixes the child `child` of `parent`.
    ///
    /// A swizzled reference goes straight to its frame. Otherwise the child
    /// is looked up by page id on the parent's volume and, when the parent is
    /// held exclusively, the parent's reference is swizzled. With `virgin`
    /// the child is not read from its volume.
    pub fn fix_nonroot(
        &mut self,
        parent: &mut FixablePage<'a>,
        child: ChildRef,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
    ) -> Result<()> {
        let pool = parent.pool().ok_or_else(|| {
            KestrelError::Internal("fix_nonroot under an unmanaged parent".to_string())
        })?;
        let parent_pid = parent.pid()?;
        let store = PageHeader::from_bytes(&parent.image()?[..]).store;
        self.unfix();

        match child {
            ChildRef::FrameIndex(idx) => {
                let guard = pool.fix_direct(idx, mode, conditional)?;
                self.binding = Binding::Frame { pool, idx, guard };
            }
            ChildRef::PageId(page_num) => {
                let page_id = PageId::new(parent_pid.vol, page_num);
                let (idx, guard) = pool.fix_page(page_id, store, mode, conditional, virgin)?;
                self.binding = Binding::Frame { pool, idx, guard };

                if parent.latch_mode() == Some(LatchMode::Exclusive) {
                    if let Ok(parent_image) = parent.image_mut() {
                        if pool.swizzle_child(parent_image, page_num, idx) {
                            trace!(parent = %parent_pid, child = page_num, frame = idx, "buffer.swizzle");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fixes the registered root page of `(vol, store)`.
    pub fn fix_root(
        &mut self,
        pool: &'a BufferPool,
        vol: VolumeId,
        store: StoreId,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<()> {
        self.unfix();
        let (idx, guard) = pool.fix_root(vol, store, mode, conditional)?;
        self.binding = Binding::Frame { pool, idx, guard };
        Ok(())
    }

    /// Fixes a new root page for `(vol, store)` exclusively, zeroed for
    /// formatting, and registers it.
    pub fn fix_virgin_root(
        &mut self,
        pool: &'a BufferPool,
        vol: VolumeId,
        store: StoreId,
        page_num: u32,
    ) -> Result<()> {
        self.unfix();
        let (idx, guard) = pool.fix_virgin_root(PageId::new(vol, page_num), store)?;
        self.binding = Binding::Frame { pool, idx, guard };
        Ok(())
    }

    /// Fixes a page by its frame index, skipping the page table.
    pub fn fix_direct(
        &mut self,
        pool: &'a BufferPool,
        idx: FrameIndex,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<()> {
        self.unfix();
        let guard = pool.fix_direct(idx, mode, conditional)?;
        self.binding = Binding::Frame { pool, idx, guard };
        Ok(())
    }

    /// Pins the frame beyond this fix so that it can be unfixed and
    /// re-latched later with `refix_direct`. Undo with
    /// `BufferPool::unpin_for_refix`.
    pub fn pin_for_refix(&self) -> Result<FrameIndex> {
        match &self.binding {
            Binding::Frame { pool, idx, .. } => {
                pool.pin_for_refix(*idx)?;
                Ok(*idx)
            }
            _ => Err(KestrelError::Internal(
                "pin_for_refix on a page outside the pool".to_string(),
            )),
        }
    }

    /// Re-latches a frame kept resident by `pin_for_refix`.
    pub fn refix_direct(
        &mut self,
        pool: &'a BufferPool,
        idx: FrameIndex,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<()> {
        self.fix_direct(pool, idx, mode, conditional)
    }

    /// Releases the latch and the pin. Safe to call on an unfixed handle.
    pub fn unfix(&mut self) {
        if let Binding::Frame { pool, idx, guard } = mem::replace(&mut self.binding, Binding::Unfixed) {
            drop(guard);
            pool.unfix(idx);
        }
    }

    pub fn is_fixed(&self) -> bool {
        !matches!(self.binding, Binding::Unfixed)
    }

    pub fn is_bufferpool_managed(&self) -> bool {
        matches!(self.binding, Binding::Frame { .. })
    }

    pub fn latch_mode(&self) -> Option<LatchMode> {
        match &self.binding {
            Binding::Unfixed => None,
            Binding::Frame { guard, .. } => Some(guard.mode()),
            Binding::Standalone(_) => Some(LatchMode::Exclusive),
        }
    }

    pub fn frame(&self) -> Option<FrameIndex> {
        match &self.binding {
            Binding::Frame { idx, .. } => Some(*idx),
            _ => None,
        }
    }

    fn pool(&self) -> Option<&'a BufferPool> {
        match &self.binding {
            Binding::Frame { pool, .. } => Some(*pool),
            _ => None,
        }
    }

    pub fn image(&self) -> Result<&PageImage> {
        match &self.binding {
            Binding::Unfixed => Err(not_fixed()),
            Binding::Frame { guard, .. } => Ok(guard.image()),
            Binding::Standalone(image) => Ok(&**image),
        }
    }

    /// Mutable image, available under an exclusive latch.
    pub fn image_mut(&mut self) -> Result<&mut PageImage> {
        match &mut self.binding {
            Binding::Unfixed => Err(not_fixed()),
            Binding::Frame { guard, .. } => guard.image_mut().ok_or_else(|| {
                KestrelError::Internal("page is not latched exclusively".to_string())
            }),
            Binding::Standalone(image) => Ok(&mut **image),
        }
    }

    pub fn btree(&self) -> Result<BTreePage<&PageImage>> {
        Ok(BTreePage::new(self.image()?))
    }

    pub fn btree_mut(&mut self) -> Result<BTreePage<&mut PageImage>> {
        Ok(BTreePage::new(self.image_mut()?))
    }

    pub fn pid(&self) -> Result<PageId> {
        match &self.binding {
            Binding::Frame { pool, idx, .. } => pool
                .block(*idx)
                .page_id()
                .ok_or_else(|| KestrelError::FrameMismatch { frame: *idx, page_id: 0 }),
            _ => Ok(read_page_id(&self.image()?[..])),
        }
    }

    pub fn lsn(&self) -> Result<Lsn> {
        Ok(read_lsn(&self.image()?[..]))
    }

    /// Stamps the page LSN. For a pool page the first LSN since the page was
    /// last clean becomes its recovery LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) -> Result<()> {
        write_lsn(&mut self.image_mut()?[..], lsn);
        if let Binding::Frame { pool, idx, .. } = &self.binding {
            pool.note_page_lsn(*idx, lsn);
        }
        Ok(())
    }

    /// Marks the frame dirty. A no-op for standalone pages.
    pub fn set_dirty(&self) {
        if let Binding::Frame { pool, idx, .. } = &self.binding {
            pool.set_dirty(*idx);
        }
    }

    pub fn is_dirty(&self) -> bool {
        match &self.binding {
            Binding::Frame { pool, idx, .. } => pool.block(*idx).is_dirty(),
            _ => false,
        }
    }

    /// Tries to turn a shared latch into an exclusive one without waiting.
    /// Returns true if the handle now holds the latch exclusively.
    pub fn upgrade_latch_conditional(&mut self) -> bool {
        match mem::replace(&mut self.binding, Binding::Unfixed) {
            Binding::Frame { pool, idx, guard } => {
                let (guard, upgraded) = match pool.block(idx).latch().upgrade_conditional(guard) {
                    Ok(guard) => (guard, true),
                    Err((guard, _)) => (guard, false),
                };
                self.binding = Binding::Frame { pool, idx, guard };
                upgraded
            }
            Binding::Standalone(image) => {
                self.binding = Binding::Standalone(image);
                true
            }
            Binding::Unfixed => false,
        }
    }

    /// Tombstones the page: the cleaner deallocates it instead of writing
    /// it back.
    pub fn set_to_be_deleted(&mut self) -> Result<()> {
        self.update_to_be_deleted(true)
    }

    pub fn unset_to_be_deleted(&mut self) -> Result<()> {
        self.update_to_be_deleted(false)
    }

    fn update_to_be_deleted(&mut self, deleted: bool) -> Result<()> {
        let image = self.image_mut()?;
        let mut flags = read_flags(&image[..]);
        if flags.is_to_be_deleted() == deleted {
            return Ok(());
        }
        flags.set_to_be_deleted(deleted);
        write_flags(&mut image[..], flags);
        self.set_dirty();
        Ok(())
    }

    pub fn is_to_be_deleted(&self) -> Result<bool> {
        Ok(read_flags(&self.image()?[..]).is_to_be_deleted())
    }

    /// Requires `dependency` to reach disk no later than this page, as of
    /// the dependency's current LSN. Both pages must be fixed in the same
    /// pool.
    pub fn register_write_order_dependency(&self, dependency: &FixablePage<'_>) -> Result<bool> {
        let (pool, idx) = match &self.binding {
            Binding::Frame { pool, idx, .. } => (*pool, *idx),
            _ => return Ok(false),
        };
        let dep_idx = match dependency.frame() {
            Some(dep_idx) => dep_idx,
            None => return Ok(false),
        };
        let dep_pid = dependency.pid()?;
        Ok(pool.register_write_order_dependency(idx, dep_idx, dep_pid.page_num, dependency.lsn()?))
    }
}

impl Default for FixablePage<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FixablePage<'_> {
    fn drop(&mut self) {
        self.unfix();
    }
}

impl std::fmt::Debug for FixablePage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixablePage")
            .field("frame", &self.frame())
            .field("latch_mode", &self.latch_mode())
            .field("managed", &self.is_bufferpool_managed())
            .finish()
    }
}

fn not_fixed() -> KestrelError {
    KestrelError::Internal("page handle is not fixed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPoolConfig;
    use kestrel_common::page::zeroed_page;
    use kestrel_storage::{DiskManager, DiskManagerConfig, FenceKeys, FormatSpec, KeyStr};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn pool(frames: usize) -> (TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap();
        let pool = BufferPool::new(
            BufferPoolConfig {
                num_frames: frames,
                swizzling: true,
            },
            Arc::new(disk),
        );
        (dir, pool)
    }

    fn format(page: &mut FixablePage<'_>, level: i16, pid0: Option<u32>) {
        let page_id = page.pid().unwrap();
        let spec = FormatSpec {
            page_id,
            store: 1,
            root: page_id.page_num,
            level,
            pid0: pid0.map(ChildRef::PageId),
            foster: None,
            fences: FenceKeys::infinite(),
        };
        page.btree_mut()
            .unwrap()
            .format_steal(&spec, None, None, false)
            .unwrap();
    }

    #[test]
    fn test_standalone_page() {
        let mut image = zeroed_page();
        PageHeader::new(PageId::new(1, 9), 1, kestrel_common::PageType::BTree)
            .write_to(&mut image[..]);
        let mut page = FixablePage::standalone(&mut image);

        assert!(page.is_fixed());
        assert!(!page.is_bufferpool_managed());
        assert_eq!(page.latch_mode(), Some(LatchMode::Exclusive));
        assert_eq!(page.pid().unwrap(), PageId::new(1, 9));

        page.set_dirty();
        assert!(!page.is_dirty());
        page.set_lsn(Lsn(12)).unwrap();
        assert_eq!(page.lsn().unwrap(), Lsn(12));
        assert!(page.upgrade_latch_conditional());
    }

    #[test]
    fn test_unfix_is_idempotent() {
        let (_dir, pool) = pool(4);
        let mut page = FixablePage::new();
        page.unfix();
        assert!(!page.is_fixed());
        assert!(page.image().is_err());

        page.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        let idx = page.frame().unwrap();
        assert_eq!(pool.block(idx).pin_count(), 2);
        page.unfix();
        page.unfix();
        // The root registry keeps its own pin.
        assert_eq!(pool.block(idx).pin_count(), 1);
    }

    #[test]
    fn test_dirty_and_rec_lsn() {
        let (_dir, pool) = pool(4);
        let mut page = FixablePage::new();
        page.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut page, 1, None);

        page.set_lsn(Lsn(50)).unwrap();
        page.set_dirty();
        page.set_dirty();
        page.set_lsn(Lsn(60)).unwrap();

        let idx = page.frame().unwrap();
        assert!(page.is_dirty());
        assert_eq!(pool.dirty_page_count(), 1);
        assert_eq!(pool.block(idx).rec_lsn(), Lsn(50));
        assert_eq!(pool.block(idx).page_lsn(), Lsn(60));
        assert_eq!(page.btree().unwrap().lsn(), Lsn(60));
    }

    #[test]
    fn test_shared_fix_cannot_mutate() {
        let (_dir, pool) = pool(4);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut root, 1, None);
        root.unfix();

        let mut page = FixablePage::new();
        page.fix_root(&pool, 1, 1, LatchMode::Shared, false).unwrap();
        assert_eq!(page.latch_mode(), Some(LatchMode::Shared));
        assert!(page.image_mut().is_err());
        assert!(page.set_lsn(Lsn(3)).is_err());
        assert!(page.btree().unwrap().is_leaf());
    }

    #[test]
    fn test_upgrade_latch_conditional() {
        let (_dir, pool) = pool(4);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        root.unfix();

        let mut a = FixablePage::new();
        a.fix_root(&pool, 1, 1, LatchMode::Shared, false).unwrap();
        let mut b = FixablePage::new();
        b.fix_root(&pool, 1, 1, LatchMode::Shared, false).unwrap();

        assert!(!a.upgrade_latch_conditional());
        assert_eq!(a.latch_mode(), Some(LatchMode::Shared));

        b.unfix();
        assert!(a.upgrade_latch_conditional());
        assert_eq!(a.latch_mode(), Some(LatchMode::Exclusive));
    }

    #[test]
    fn test_conditional_fix_root() {
        let (_dir, pool) = pool(4);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();

        let mut other = FixablePage::new();
        let err = other
            .fix_root(&pool, 1, 1, LatchMode::Shared, true)
            .unwrap_err();
        assert!(matches!(err, KestrelError::LatchWouldBlock));
        assert!(!other.is_fixed());
    }

    #[test]
    fn test_refix_keeps_frame_pinned() {
        let (_dir, pool) = pool(4);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut root, 2, Some(3));

        let mut child = FixablePage::new();
        child
            .fix_nonroot(&mut root, ChildRef::PageId(3), LatchMode::Exclusive, false, true)
            .unwrap();
        format(&mut child, 1, None);

        let idx = child.pin_for_refix().unwrap();
        child.unfix();
        assert_eq!(pool.block(idx).pin_count(), 1);

        child
            .refix_direct(&pool, idx, LatchMode::Shared, false)
            .unwrap();
        assert_eq!(child.pid().unwrap(), PageId::new(1, 3));
        child.unfix();
        pool.unpin_for_refix(idx);
        assert_eq!(pool.block(idx).pin_count(), 0);
    }

    #[test]
    fn test_fix_nonroot_swizzles_exclusive_parent() {
        let (_dir, pool) = pool(8);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut root, 2, Some(3));
        root.btree_mut()
            .unwrap()
            .insert_node(&KeyStr::from_data(b"m"), 0, ChildRef::PageId(4))
            .unwrap();

        let mut child = FixablePage::new();
        child
            .fix_nonroot(&mut root, ChildRef::PageId(4), LatchMode::Exclusive, false, true)
            .unwrap();
        format(&mut child, 1, None);
        let child_idx = child.frame().unwrap();
        child.unfix();

        let swizzled = root.btree().unwrap().child(0).unwrap();
        assert_eq!(swizzled, ChildRef::FrameIndex(child_idx));
        assert!(pool.block(child_idx).is_swizzled());
        // pid0 was not touched.
        assert_eq!(root.btree().unwrap().pid0(), Some(ChildRef::PageId(3)));

        // Following the swizzled pointer lands on the same frame.
        child
            .fix_nonroot(&mut root, swizzled, LatchMode::Shared, false, false)
            .unwrap();
        assert_eq!(child.frame(), Some(child_idx));
        assert_eq!(child.pid().unwrap(), PageId::new(1, 4));
    }

    #[test]
    fn test_shared_parent_is_not_swizzled() {
        let (_dir, pool) = pool(8);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut root, 2, Some(3));
        root.unfix();

        let mut parent = FixablePage::new();
        parent.fix_root(&pool, 1, 1, LatchMode::Shared, false).unwrap();
        let mut child = FixablePage::new();
        child
            .fix_nonroot(&mut parent, ChildRef::PageId(3), LatchMode::Exclusive, false, true)
            .unwrap();
        assert_eq!(parent.btree().unwrap().pid0(), Some(ChildRef::PageId(3)));
        assert!(!pool.block(child.frame().unwrap()).is_swizzled());
    }

    #[test]
    fn test_to_be_deleted_marks_dirty() {
        let (_dir, pool) = pool(4);
        let mut page = FixablePage::new();
        page.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut page, 1, None);
        assert!(!page.is_to_be_deleted().unwrap());

        page.set_to_be_deleted().unwrap();
        assert!(page.is_to_be_deleted().unwrap());
        assert!(page.is_dirty());

        page.unset_to_be_deleted().unwrap();
        assert!(!page.is_to_be_deleted().unwrap());
    }

    #[test]
    fn test_write_order_dependency() {
        let (_dir, pool) = pool(8);
        let mut root = FixablePage::new();
        root.fix_virgin_root(&pool, 1, 1, 2).unwrap();
        format(&mut root, 2, Some(3));

        let mut child = FixablePage::new();
        child
            .fix_nonroot(&mut root, ChildRef::PageId(3), LatchMode::Exclusive, false, true)
            .unwrap();
        format(&mut child, 1, None);
        child.set_lsn(Lsn(70)).unwrap();

        assert!(root.register_write_order_dependency(&child).unwrap());
        let (dep_idx, dep_page, dep_lsn) = pool.block(root.frame().unwrap()).dependency().unwrap();
        assert_eq!(dep_idx, child.frame().unwrap());
        assert_eq!(dep_page, 3);
        assert_eq!(dep_lsn, Lsn(70));

        // A page never depends on itself.
        assert!(!child.register_write_order_dependency(&child).unwrap());
        assert!(pool.block(child.frame().unwrap()).dependency().is_none());
    }
}
