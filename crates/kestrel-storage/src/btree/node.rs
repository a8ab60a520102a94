//! Record-level operations: fence keys, search, and leaf/interior records.
//!
//! Record slots are numbered from 0 and map onto heap item `slot + 1`; item
//! 0 is the fence record.

use super::child::ChildRef;
use super::constants::*;
use super::key::{is_pos_inf, poor_man_key, KeyStr};
use super::page::{read_u16, write_u16, BTreePage};
use kestrel_common::page::{write_lsn, PageImage};
use kestrel_common::{KestrelError, Lsn, Result};
use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

/// Payload length of a leaf record.
pub(crate) fn predict_leaf_data_len(trunc_key_len: usize, element_len: usize) -> usize {
    KEY_LENGTH_SIZE + trunc_key_len + element_len
}

/// Leaf record payload: key length, truncated key, element.
pub(crate) fn pack_leaf_record(trunc_key: &[u8], element: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(predict_leaf_data_len(trunc_key.len(), element.len()));
    out.extend_from_slice(&(trunc_key.len() as u16).to_le_bytes());
    out.extend_from_slice(trunc_key);
    out.extend_from_slice(element);
    out
}

impl<B: Deref<Target = PageImage>> BTreePage<B> {
    /// Number of user records, ghosts included.
    pub fn nrecs(&self) -> usize {
        self.nitems().saturating_sub(1)
    }

    // ------------------------------------------------------------------
    // Fence keys
    // ------------------------------------------------------------------

    fn fence_rec(&self) -> &[u8] {
        self.item_data(0)
    }

    /// Low fence key, inclusive.
    pub fn fence_low(&self) -> &[u8] {
        &self.fence_rec()[..self.fence_low_len()]
    }

    /// High fence key with the shared prefix removed.
    pub fn fence_high_noprefix(&self) -> &[u8] {
        let start = self.fence_low_len();
        &self.fence_rec()[start..start + self.fence_high_len() - self.prefix_len()]
    }

    /// High fence key, exclusive.
    pub fn fence_high(&self) -> KeyStr {
        KeyStr::from_parts(self.prefix_key(), self.fence_high_noprefix())
    }

    /// High fence of the foster chain, stored in full. Empty without a chain.
    pub fn chain_fence_high(&self) -> &[u8] {
        let start = self.fence_low_len() + self.fence_high_len() - self.prefix_len();
        &self.fence_rec()[start..start + self.chain_fence_high_len()]
    }

    pub fn prefix_key(&self) -> &[u8] {
        &self.fence_low()[..self.prefix_len()]
    }

    pub fn is_fence_low_infimum(&self) -> bool {
        self.fence_low() == KeyStr::neg_inf().as_bytes()
    }

    pub fn is_fence_high_supremum(&self) -> bool {
        self.prefix_len() == 0 && is_pos_inf(self.fence_high_noprefix())
    }

    /// Orders `key` against the low fence.
    pub fn compare_with_fence_low(&self, key: &KeyStr) -> Ordering {
        key.as_bytes().cmp(self.fence_low())
    }

    /// Orders `key` against the high fence without rebuilding it.
    pub fn compare_with_fence_high(&self, key: &KeyStr) -> Ordering {
        let key = key.as_bytes();
        let prefix = self.prefix_key();
        if prefix.len() > key.len() {
            return key.cmp(&prefix[..key.len()]).then(Ordering::Less);
        }
        key[..prefix.len()]
            .cmp(prefix)
            .then_with(|| key[prefix.len()..].cmp(self.fence_high_noprefix()))
    }

    pub fn compare_with_chain_fence_high(&self, key: &KeyStr) -> Ordering {
        key.as_bytes().cmp(self.chain_fence_high())
    }

    /// True iff `low <= key < high`.
    pub fn fence_contains(&self, key: &KeyStr) -> bool {
        self.compare_with_fence_low(key) != Ordering::Less
            && self.compare_with_fence_high(key) == Ordering::Less
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    fn poor(&self, slot: usize) -> u16 {
        self.item_poor(slot + 1)
    }

    fn leaf_key_noprefix(&self, slot: usize) -> &[u8] {
        let data = self.item_data(slot + 1);
        let len = read_u16(data, 0) as usize;
        &data[KEY_LENGTH_SIZE..KEY_LENGTH_SIZE + len]
    }

    /// Stored key of a record, prefix removed.
    pub fn key_noprefix(&self, slot: usize) -> &[u8] {
        if self.is_leaf() {
            self.leaf_key_noprefix(slot)
        } else {
            self.item_data(slot + 1)
        }
    }

    fn element_offset(&self, slot: usize) -> usize {
        KEY_LENGTH_SIZE + self.leaf_key_noprefix(slot).len()
    }

    /// Full key of a record, prefix restored.
    pub fn get_key(&self, slot: usize) -> KeyStr {
        KeyStr::from_parts(self.prefix_key(), self.key_noprefix(slot))
    }

    pub fn is_ghost(&self, slot: usize) -> bool {
        self.is_item_ghost(slot + 1)
    }

    /// Element bytes of a leaf record.
    pub fn element(&self, slot: usize) -> &[u8] {
        &self.item_data(slot + 1)[self.element_offset(slot)..]
    }

    /// Copies a record's element into `out`.
    ///
    /// Returns the element length, or `Err(needed)` if `out` is too short.
    pub fn copy_element(&self, slot: usize, out: &mut [u8]) -> std::result::Result<usize, usize> {
        let element = self.element(slot);
        if out.len() < element.len() {
            return Err(element.len());
        }
        out[..element.len()].copy_from_slice(element);
        Ok(element.len())
    }

    /// Child of an interior record.
    pub fn child(&self, slot: usize) -> Option<ChildRef> {
        ChildRef::decode(self.item_child(slot + 1))
    }

    /// Left-most child of an interior node.
    pub fn pid0(&self) -> Option<ChildRef> {
        ChildRef::decode(self.pid0_raw())
    }

    /// Foster child, the right sibling of an unfinished split.
    pub fn foster(&self) -> Option<ChildRef> {
        ChildRef::decode(self.foster_raw())
    }

    fn compare_slot_with_key(&self, slot: usize, trunc_key: &[u8], poor: u16) -> Ordering {
        self.poor(slot)
            .cmp(&poor)
            .then_with(|| self.key_noprefix(slot).cmp(trunc_key))
    }

    /// Binary search over the records, ghosts included.
    ///
    /// Returns `Ok(slot)` on an exact match, otherwise `Err(slot)` with the
    /// position the key would be inserted at (`nrecs()` appends).
    pub fn search(&self, key: &KeyStr) -> std::result::Result<usize, usize> {
        let raw = key.as_bytes();
        let prefix = self.prefix_key();
        let n = self.nrecs();
        if !raw.starts_with(prefix) {
            return if raw < prefix { Err(0) } else { Err(n) };
        }
        if n == 0 {
            return Err(0);
        }

        let trunc = &raw[prefix.len()..];
        let poor = poor_man_key(trunc);

        // Sorted inserts hit the last record; check it first.
        match self.compare_slot_with_key(n - 1, trunc, poor) {
            Ordering::Less => return Err(n),
            Ordering::Equal => return Ok(n - 1),
            Ordering::Greater => {}
        }

        let (mut low, mut high) = (0, n - 1);
        while low < high {
            let mid = (low + high) / 2;
            match self.compare_slot_with_key(mid, trunc, poor) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    /// Picks the record whose child covers `key`; `None` means pid0.
    ///
    /// A key equal to a separator descends to that separator's child.
    pub fn search_node(&self, key: &KeyStr) -> Option<usize> {
        match self.search(key) {
            Ok(slot) => Some(slot),
            Err(0) => None,
            Err(slot) => Some(slot - 1),
        }
    }

    pub fn is_insertion_skewed_right(&self) -> bool {
        self.consecutive_skewed_insertions() > SKEWED_THRESHOLD
    }

    pub fn is_insertion_skewed_left(&self) -> bool {
        self.consecutive_skewed_insertions() < -SKEWED_THRESHOLD
    }

    /// Pre-sorted insertion such as a bulk load.
    pub fn is_insertion_extremely_skewed_right(&self) -> bool {
        let ins = self.consecutive_skewed_insertions() as i64;
        let n = self.nrecs() as i64;
        ins > EXTREME_SKEW_THRESHOLD as i64 || ins > n * 9 / 10 || (ins > 1 && ins >= n - 1)
    }

    fn check_space_for_insert(&self, data_len: usize) -> bool {
        self.usable_space() >= self.predict_item_space(data_len)
    }

    pub fn check_space_for_insert_leaf(&self, trunc_key_len: usize, element_len: usize) -> bool {
        self.is_leaf()
            && self.check_space_for_insert(predict_leaf_data_len(trunc_key_len, element_len))
    }

    /// Conservative: counts the whole key, prefix included.
    pub fn check_space_for_insert_node(&self, key: &KeyStr) -> bool {
        self.is_node() && self.check_space_for_insert(key.len())
    }

    /// Keys and elements above this size are never accepted.
    pub fn max_entry_size() -> usize {
        MAX_ENTRY_SIZE
    }

    fn check_entry_size(key: &KeyStr, element_len: usize) -> Result<()> {
        let size = key.data().len() + element_len;
        if size > MAX_ENTRY_SIZE {
            return Err(KestrelError::KeyTooLarge {
                size,
                max: MAX_ENTRY_SIZE,
            });
        }
        Ok(())
    }

    fn check_fence_contains(&self, key: &KeyStr) -> Result<()> {
        if !self.fence_contains(key) {
            return Err(KestrelError::InvalidParameter {
                name: "key".to_string(),
                value: format!("{:?} outside page {}", key.data(), self.page_id()),
            });
        }
        Ok(())
    }

    fn wont_fit(&self, data_len: usize) -> KestrelError {
        KestrelError::RecordWontFit {
            needed: self.predict_item_space(data_len),
            available: self.usable_space(),
        }
    }
}

impl<B: DerefMut<Target = PageImage>> BTreePage<B> {
    pub fn set_lsn(&mut self, lsn: Lsn) {
        write_lsn(&mut self.image_mut()[..], lsn);
    }

    pub fn set_child(&mut self, slot: usize, child: ChildRef) {
        self.set_item_child(slot + 1, child.encode());
    }

    pub fn set_pid0(&mut self, child: Option<ChildRef>) {
        self.set_pid0_raw(ChildRef::encode_opt(child));
    }

    pub fn set_foster(&mut self, child: Option<ChildRef>) {
        self.set_foster_raw(ChildRef::encode_opt(child));
    }

    /// Tracks runs of inserts at either end of the page.
    pub fn update_consecutive_skewed_insertions(&mut self, slot: usize) {
        let n = self.nrecs();
        if n == 0 {
            return;
        }
        let val = self.consecutive_skewed_insertions();
        let val = if slot == 0 {
            if val >= 0 {
                -1
            } else {
                val - 1
            }
        } else if slot == n {
            if val <= 0 {
                1
            } else {
                val + 1
            }
        } else {
            0
        };
        self.set_consecutive_skewed_insertions(val.clamp(-SKEW_LIMIT, SKEW_LIMIT));
    }

    /// Inserts a ghost leaf record with a zeroed element of `element_len`
    /// bytes, returning its slot.
    pub fn reserve_ghost(&mut self, key: &KeyStr, element_len: usize) -> Result<usize> {
        if !self.is_leaf() {
            return Err(KestrelError::BTreeCorrupted(
                "ghost records exist only in leaves".to_string(),
            ));
        }
        Self::check_entry_size(key, element_len)?;
        self.check_fence_contains(key)?;

        let slot = match self.search(key) {
            Ok(_) => return Err(KestrelError::DuplicateKey),
            Err(slot) => slot,
        };
        let trunc = &key.as_bytes()[self.prefix_len()..];
        let data_len = predict_leaf_data_len(trunc.len(), element_len);
        if !self.check_space_for_insert(data_len) {
            return Err(self.wont_fit(data_len));
        }

        self.update_consecutive_skewed_insertions(slot);
        let poor = poor_man_key(trunc);
        let trunc = trunc.to_vec();
        if !self.insert_item_zeroed(slot + 1, true, poor, 0, data_len) {
            return Err(self.wont_fit(data_len));
        }
        let data = self.item_data_mut(slot + 1);
        write_u16(data, 0, trunc.len() as u16);
        data[KEY_LENGTH_SIZE..KEY_LENGTH_SIZE + trunc.len()].copy_from_slice(&trunc);
        Ok(slot)
    }

    /// Fills the ghost record for `key` with `element` and revives it.
    pub fn replace_ghost(&mut self, key: &KeyStr, element: &[u8]) -> Result<usize> {
        let slot = match self.search(key) {
            Ok(slot) if self.is_ghost(slot) => slot,
            Ok(_) => return Err(KestrelError::DuplicateKey),
            Err(_) => return Err(KestrelError::KeyNotFound),
        };
        let offset = self.element_offset(slot);
        if !self.replace_item_data(slot + 1, offset, element) {
            return Err(self.wont_fit(offset + element.len()));
        }
        self.unset_ghost(slot + 1);
        Ok(slot)
    }

    /// Inserts a leaf record, reusing a ghost with the same key if present.
    pub fn insert_leaf(&mut self, key: &KeyStr, element: &[u8]) -> Result<usize> {
        Self::check_entry_size(key, element.len())?;
        match self.search(key) {
            Ok(slot) if !self.is_ghost(slot) => Err(KestrelError::DuplicateKey),
            Ok(_) => self.replace_ghost(key, element),
            Err(_) => {
                self.reserve_ghost(key, element.len())?;
                self.replace_ghost(key, element)
            }
        }
    }

    /// Inserts a separator and its child at `slot`.
    pub fn insert_node(&mut self, key: &KeyStr, slot: usize, child: ChildRef) -> Result<()> {
        if !self.is_node() {
            return Err(KestrelError::BTreeCorrupted(
                "separator inserted into a leaf".to_string(),
            ));
        }
        if slot > self.nrecs() || !key.as_bytes().starts_with(self.prefix_key()) {
            return Err(KestrelError::InvalidParameter {
                name: "slot".to_string(),
                value: slot.to_string(),
            });
        }
        self.update_consecutive_skewed_insertions(slot);

        let trunc = key.as_bytes()[self.prefix_len()..].to_vec();
        let poor = poor_man_key(&trunc);
        if !self.insert_item(slot + 1, false, poor, child.encode(), &trunc) {
            return Err(self.wont_fit(trunc.len()));
        }
        Ok(())
    }

    pub fn mark_ghost(&mut self, slot: usize) {
        self.set_ghost(slot + 1);
    }

    pub fn unmark_ghost(&mut self, slot: usize) {
        self.unset_ghost(slot + 1);
    }

    /// Physically removes a record.
    pub fn remove_shift(&mut self, slot: usize) {
        self.delete_item(slot + 1);
    }

    /// Replaces a live record's element.
    pub fn replace_el(&mut self, slot: usize, element: &[u8]) -> Result<()> {
        if self.is_ghost(slot) {
            return Err(KestrelError::KeyNotFound);
        }
        let offset = self.element_offset(slot);
        if !self.replace_item_data(slot + 1, offset, element) {
            return Err(self.wont_fit(offset + element.len()));
        }
        Ok(())
    }

    /// Overwrites part of a live record's element without resizing it.
    pub fn overwrite_el(&mut self, slot: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.is_ghost(slot) {
            return Err(KestrelError::KeyNotFound);
        }
        let start = self.element_offset(slot) + offset;
        let data = self.item_data_mut(slot + 1);
        if start + bytes.len() > data.len() {
            return Err(KestrelError::InvalidParameter {
                name: "offset".to_string(),
                value: offset.to_string(),
            });
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
