//! B-tree page header fields and the slotted item heap.
//!
//! `BTreePage` is a view over a page image. It borrows or owns the bytes
//! through any `Deref<Target = PageImage>`, so the same code runs over a
//! latched buffer frame, a boxed scratch page, or a test array. Read-only
//! accessors need `Deref`; every mutator needs `DerefMut`.
//!
//! Items are addressed by position: item 0 is the fence record and items
//! `1..nitems` are user records in key order. The primitives here know
//! nothing about keys. They keep the slot table, the body heap, and the
//! ghost count consistent, and every mutator checks space before touching
//! a byte so a failed call leaves the page unchanged.

use super::constants::*;
use kestrel_common::page::{read_lsn, read_page_id, PageImage, PAGE_SIZE};
use kestrel_common::{Lsn, PageId};
use std::ops::{Deref, DerefMut};

#[inline]
pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn slot_pos(item: usize) -> usize {
    ITEM_AREA_START + item * SLOT_SIZE
}

/// A B-tree page over some page image storage.
pub struct BTreePage<B> {
    buf: B,
}

impl<B: Deref<Target = PageImage>> BTreePage<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    pub fn image(&self) -> &PageImage {
        &self.buf
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    pub fn page_id(&self) -> PageId {
        read_page_id(&self.buf[..])
    }

    pub fn lsn(&self) -> Lsn {
        read_lsn(&self.buf[..])
    }

    // ------------------------------------------------------------------
    // B-tree header
    // ------------------------------------------------------------------

    /// Page number of the root of this page's tree.
    pub fn root(&self) -> u32 {
        read_u32(&self.buf[..], ROOT_OFFSET)
    }

    pub(crate) fn pid0_raw(&self) -> u32 {
        read_u32(&self.buf[..], PID0_OFFSET)
    }

    pub(crate) fn foster_raw(&self) -> u32 {
        read_u32(&self.buf[..], FOSTER_OFFSET)
    }

    /// 1 for leaves, higher for interior nodes.
    pub fn level(&self) -> i16 {
        read_u16(&self.buf[..], LEVEL_OFFSET) as i16
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == LEAF_LEVEL
    }

    pub fn is_node(&self) -> bool {
        self.level() > LEAF_LEVEL
    }

    /// Length of the low fence key, prefix included.
    pub fn fence_low_len(&self) -> usize {
        read_u16(&self.buf[..], FENCE_LOW_LEN_OFFSET) as usize
    }

    /// Length of the high fence key, prefix included.
    pub fn fence_high_len(&self) -> usize {
        read_u16(&self.buf[..], FENCE_HIGH_LEN_OFFSET) as usize
    }

    /// Length of the foster chain's high fence key; 0 when there is none.
    pub fn chain_fence_high_len(&self) -> usize {
        read_u16(&self.buf[..], CHAIN_HIGH_LEN_OFFSET) as usize
    }

    /// Bytes shared by both fence keys and elided from every stored key.
    pub fn prefix_len(&self) -> usize {
        read_u16(&self.buf[..], PREFIX_LEN_OFFSET) as usize
    }

    /// Positive after a run of right-most inserts, negative after left-most.
    pub fn consecutive_skewed_insertions(&self) -> i16 {
        read_u16(&self.buf[..], SKEW_OFFSET) as i16
    }

    /// Item count, fence record included.
    pub fn nitems(&self) -> usize {
        read_u16(&self.buf[..], NITEMS_OFFSET) as usize
    }

    pub fn nghosts(&self) -> usize {
        read_u16(&self.buf[..], NGHOSTS_OFFSET) as usize
    }

    /// Lowest byte used by item bodies.
    pub fn record_head(&self) -> usize {
        read_u16(&self.buf[..], RECORD_HEAD_OFFSET) as usize
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    fn body_offset(&self, item: usize) -> usize {
        (read_u16(&self.buf[..], slot_pos(item)) & !GHOST_BIT) as usize
    }

    fn body_len(&self, item: usize) -> usize {
        read_u16(&self.buf[..], slot_pos(item) + 2) as usize
    }

    /// Bytes of child reference in front of an item's data.
    pub(crate) fn child_size(&self, item: usize) -> usize {
        if self.is_node() && item > 0 {
            CHILD_SIZE
        } else {
            0
        }
    }

    pub fn item_poor(&self, item: usize) -> u16 {
        read_u16(&self.buf[..], slot_pos(item) + 4)
    }

    pub fn is_item_ghost(&self, item: usize) -> bool {
        read_u16(&self.buf[..], slot_pos(item)) & GHOST_BIT != 0
    }

    /// Stored child reference of an interior item, 0 for items without one.
    pub fn item_child(&self, item: usize) -> u32 {
        if self.child_size(item) == 0 {
            return 0;
        }
        read_u32(&self.buf[..], self.body_offset(item))
    }

    /// Item payload after the child reference.
    pub fn item_data(&self, item: usize) -> &[u8] {
        let start = self.body_offset(item) + self.child_size(item);
        let end = self.body_offset(item) + self.body_len(item);
        &self.buf[start..end]
    }

    pub fn item_data_len(&self, item: usize) -> usize {
        self.body_len(item) - self.child_size(item)
    }

    /// Bytes an item occupies, slot included.
    pub fn item_space(&self, item: usize) -> usize {
        SLOT_SIZE + self.body_len(item)
    }

    /// Contiguous free bytes between the slot table and the body heap.
    ///
    /// Gaps left behind by resized or deleted items are not counted; only
    /// `compact` returns them.
    pub fn usable_space(&self) -> usize {
        self.record_head()
            .saturating_sub(slot_pos(self.nitems()))
    }

    pub fn used_space(&self) -> usize {
        ITEM_AREA_SIZE - self.usable_space()
    }

    /// Space a new item with `data_len` bytes of payload would consume.
    pub fn predict_item_space(&self, data_len: usize) -> usize {
        let child = if self.is_node() { CHILD_SIZE } else { 0 };
        SLOT_SIZE + child + data_len
    }

    /// Verifies the slot table and body heap: bounds, overlap, ghost count.
    pub fn items_are_consistent(&self) -> bool {
        let nitems = self.nitems();
        let record_head = self.record_head();
        if record_head < slot_pos(nitems) || record_head > PAGE_SIZE {
            return false;
        }

        let mut ghosts = 0;
        let mut extents = Vec::with_capacity(nitems);
        for item in 0..nitems {
            let offset = self.body_offset(item);
            let len = self.body_len(item);
            if offset < record_head || offset + len > PAGE_SIZE || len < self.child_size(item) {
                return false;
            }
            if self.is_item_ghost(item) {
                ghosts += 1;
            }
            extents.push((offset, len));
        }
        if ghosts != self.nghosts() {
            return false;
        }

        extents.sort_unstable();
        extents
            .windows(2)
            .all(|pair| pair[0].0 + pair[0].1 <= pair[1].0)
    }
}

impl<B: DerefMut<Target = PageImage>> BTreePage<B> {
    pub fn image_mut(&mut self) -> &mut PageImage {
        &mut self.buf
    }

    pub(crate) fn set_root(&mut self, root: u32) {
        write_u32(&mut self.buf[..], ROOT_OFFSET, root);
    }

    pub(crate) fn set_pid0_raw(&mut self, raw: u32) {
        write_u32(&mut self.buf[..], PID0_OFFSET, raw);
    }

    pub(crate) fn set_foster_raw(&mut self, raw: u32) {
        write_u32(&mut self.buf[..], FOSTER_OFFSET, raw);
    }

    pub(crate) fn set_level(&mut self, level: i16) {
        write_u16(&mut self.buf[..], LEVEL_OFFSET, level as u16);
    }

    pub(crate) fn set_fence_lens(&mut self, low: usize, high: usize, chain: usize) {
        write_u16(&mut self.buf[..], FENCE_LOW_LEN_OFFSET, low as u16);
        write_u16(&mut self.buf[..], FENCE_HIGH_LEN_OFFSET, high as u16);
        write_u16(&mut self.buf[..], CHAIN_HIGH_LEN_OFFSET, chain as u16);
    }

    pub(crate) fn set_prefix_len(&mut self, len: usize) {
        write_u16(&mut self.buf[..], PREFIX_LEN_OFFSET, len as u16);
    }

    pub(crate) fn set_consecutive_skewed_insertions(&mut self, value: i16) {
        write_u16(&mut self.buf[..], SKEW_OFFSET, value as u16);
    }

    fn set_nitems(&mut self, n: usize) {
        write_u16(&mut self.buf[..], NITEMS_OFFSET, n as u16);
    }

    fn set_nghosts(&mut self, n: usize) {
        write_u16(&mut self.buf[..], NGHOSTS_OFFSET, n as u16);
    }

    fn set_record_head(&mut self, head: usize) {
        write_u16(&mut self.buf[..], RECORD_HEAD_OFFSET, head as u16);
    }

    fn write_slot(&mut self, item: usize, offset: usize, ghost: bool, len: usize, poor: u16) {
        let pos = slot_pos(item);
        let word = offset as u16 | if ghost { GHOST_BIT } else { 0 };
        write_u16(&mut self.buf[..], pos, word);
        write_u16(&mut self.buf[..], pos + 2, len as u16);
        write_u16(&mut self.buf[..], pos + 4, poor);
    }

    /// Empties the item heap.
    pub(crate) fn init_items(&mut self) {
        self.set_nitems(0);
        self.set_nghosts(0);
        self.set_record_head(PAGE_SIZE);
    }

    pub(crate) fn set_item_child(&mut self, item: usize, raw: u32) {
        if self.child_size(item) == 0 {
            return;
        }
        let offset = self.body_offset(item);
        write_u32(&mut self.buf[..], offset, raw);
    }

    pub fn item_data_mut(&mut self, item: usize) -> &mut [u8] {
        let start = self.body_offset(item) + self.child_size(item);
        let end = self.body_offset(item) + self.body_len(item);
        &mut self.buf[start..end]
    }

    /// Inserts an item at `pos`, shifting later items up by one.
    ///
    /// Returns false without touching the page if the item does not fit in
    /// `usable_space()`. Position 0 is reserved for the fence record and is
    /// only accepted on an empty heap.
    pub fn insert_item(&mut self, pos: usize, ghost: bool, poor: u16, child: u32, data: &[u8]) -> bool {
        if !self.insert_item_zeroed(pos, ghost, poor, child, data.len()) {
            return false;
        }
        self.item_data_mut(pos).copy_from_slice(data);
        true
    }

    /// Like `insert_item`, with a zero-filled payload of `data_len` bytes.
    pub(crate) fn insert_item_zeroed(
        &mut self,
        pos: usize,
        ghost: bool,
        poor: u16,
        child: u32,
        data_len: usize,
    ) -> bool {
        let nitems = self.nitems();
        if pos > nitems || (pos == 0 && nitems > 0) {
            return false;
        }
        let child_size = self.child_size(pos);
        let body_len = child_size + data_len;
        if SLOT_SIZE + body_len > self.usable_space() {
            return false;
        }

        let table_start = slot_pos(pos);
        let table_end = slot_pos(nitems);
        self.buf.copy_within(table_start..table_end, table_start + SLOT_SIZE);

        let offset = self.record_head() - body_len;
        self.buf[offset..offset + body_len].fill(0);
        if child_size > 0 {
            write_u32(&mut self.buf[..], offset, child);
        }
        self.set_record_head(offset);
        self.write_slot(pos, offset, ghost, body_len, poor);
        self.set_nitems(nitems + 1);
        if ghost {
            self.set_nghosts(self.nghosts() + 1);
        }
        true
    }

    /// Changes an item's payload length, keeping its first `keep` bytes.
    ///
    /// Shrinking happens in place. Growing moves the body to the top of the
    /// heap; the old body becomes a gap until the next `compact`.
    pub fn resize_item(&mut self, item: usize, new_data_len: usize, keep: usize) -> bool {
        let child_size = self.child_size(item);
        let old_len = self.body_len(item);
        let new_len = child_size + new_data_len;
        let poor = self.item_poor(item);
        let ghost = self.is_item_ghost(item);
        let old_offset = self.body_offset(item);

        if new_len <= old_len {
            self.write_slot(item, old_offset, ghost, new_len, poor);
            return true;
        }
        if new_len > self.usable_space() {
            return false;
        }

        let keep = child_size + keep.min(old_len - child_size);
        let new_offset = self.record_head() - new_len;
        self.buf.copy_within(old_offset..old_offset + keep, new_offset);
        self.buf[new_offset + keep..new_offset + new_len].fill(0);
        self.set_record_head(new_offset);
        self.write_slot(item, new_offset, ghost, new_len, poor);
        true
    }

    /// Replaces an item's payload from `data_offset` on with `data`.
    pub fn replace_item_data(&mut self, item: usize, data_offset: usize, data: &[u8]) -> bool {
        if data_offset > self.item_data_len(item) {
            return false;
        }
        if !self.resize_item(item, data_offset + data.len(), data_offset) {
            return false;
        }
        self.item_data_mut(item)[data_offset..].copy_from_slice(data);
        true
    }

    /// Removes an item, shifting later items down by one.
    pub fn delete_item(&mut self, item: usize) {
        let nitems = self.nitems();
        if item >= nitems {
            return;
        }
        let offset = self.body_offset(item);
        let len = self.body_len(item);
        let ghost = self.is_item_ghost(item);

        if offset == self.record_head() {
            self.set_record_head(offset + len);
        }
        let table_start = slot_pos(item + 1);
        let table_end = slot_pos(nitems);
        self.buf.copy_within(table_start..table_end, slot_pos(item));
        self.set_nitems(nitems - 1);
        if ghost {
            self.set_nghosts(self.nghosts() - 1);
        }
    }

    /// Removes items `from..to`.
    pub fn delete_range(&mut self, from: usize, to: usize) {
        for _ in from..to.min(self.nitems()) {
            self.delete_item(from);
        }
    }

    pub fn set_ghost(&mut self, item: usize) {
        if self.is_item_ghost(item) {
            return;
        }
        let pos = slot_pos(item);
        let word = read_u16(&self.buf[..], pos) | GHOST_BIT;
        write_u16(&mut self.buf[..], pos, word);
        self.set_nghosts(self.nghosts() + 1);
    }

    pub fn unset_ghost(&mut self, item: usize) {
        if !self.is_item_ghost(item) {
            return;
        }
        let pos = slot_pos(item);
        let word = read_u16(&self.buf[..], pos) & !GHOST_BIT;
        write_u16(&mut self.buf[..], pos, word);
        self.set_nghosts(self.nghosts() - 1);
    }

    /// Drops every ghost and squeezes out gaps, keeping item order.
    ///
    /// The only primitive that moves surviving item bodies.
    pub fn compact(&mut self) {
        let nitems = self.nitems();
        let live: Vec<(u16, Vec<u8>)> = (0..nitems)
            .filter(|&item| !self.is_item_ghost(item))
            .map(|item| {
                let offset = self.body_offset(item);
                let body = self.buf[offset..offset + self.body_len(item)].to_vec();
                (self.item_poor(item), body)
            })
            .collect();

        let mut head = PAGE_SIZE;
        for (item, (poor, body)) in live.iter().enumerate() {
            head -= body.len();
            self.buf[head..head + body.len()].copy_from_slice(body);
            self.write_slot(item, head, false, body.len(), *poor);
        }
        let table_end = slot_pos(live.len());
        self.buf[table_end..head].fill(0);
        self.set_nitems(live.len());
        self.set_nghosts(0);
        self.set_record_head(head);
    }
}
