//! Whole-page formatting, fence maintenance, and split planning.

use super::child::ChildRef;
use super::constants::*;
use super::key::{common_leading_bytes, poor_man_key, KeyStr};
use super::node::pack_leaf_record;
use super::page::BTreePage;
use kestrel_common::page::{zeroed_page, PageHeader, PageImage, PageType, PAGE_SIZE};
use kestrel_common::{KestrelError, PageId, Result, StoreId};
use std::ops::{Deref, DerefMut};

/// Low, high, and foster-chain high fence keys of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceKeys {
    pub low: KeyStr,
    pub high: KeyStr,
    /// Empty when the page heads no foster chain.
    pub chain_high: KeyStr,
}

impl FenceKeys {
    pub fn new(low: KeyStr, high: KeyStr, chain_high: KeyStr) -> Self {
        Self {
            low,
            high,
            chain_high,
        }
    }

    /// `[-inf, +inf)` with no chain: the fences of a fresh root.
    pub fn infinite() -> Self {
        Self::new(KeyStr::neg_inf(), KeyStr::pos_inf(), KeyStr::empty())
    }

    /// Bytes shared by low and high.
    pub fn prefix_len(&self) -> usize {
        self.low.common_leading_bytes(&self.high)
    }

    /// The fence record: low, high without the prefix, then chain.
    fn pack(&self, prefix_len: usize) -> Vec<u8> {
        let high = &self.high.as_bytes()[prefix_len..];
        let mut out =
            Vec::with_capacity(self.low.len() + high.len() + self.chain_high.len());
        out.extend_from_slice(self.low.as_bytes());
        out.extend_from_slice(high);
        out.extend_from_slice(self.chain_high.as_bytes());
        out
    }
}

/// Header values for `format_steal`.
#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub page_id: PageId,
    pub store: StoreId,
    pub root: u32,
    pub level: i16,
    /// Required on interior pages.
    pub pid0: Option<ChildRef>,
    pub foster: Option<ChildRef>,
    pub fences: FenceKeys,
}

/// A run of records `from..to` to copy out of another page.
#[derive(Clone, Copy)]
pub struct StealSource<'a> {
    pub image: &'a PageImage,
    pub from: usize,
    pub to: usize,
}

/// Space accounting of a leaf page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafStats {
    pub header_bytes: usize,
    pub unused_bytes: usize,
    pub entry_count: usize,
    pub key_bytes: usize,
    pub data_bytes: usize,
    pub entry_overhead_bytes: usize,
}

impl<B: Deref<Target = PageImage>> BTreePage<B> {
    /// Separator for a split whose right half begins at `right_begins_from`.
    ///
    /// Leaves get the shortest key `k` with `left < k <= right`; interior
    /// nodes reuse the existing separator.
    pub fn recalculate_fence_for_split(&self, right_begins_from: usize) -> Result<KeyStr> {
        let first = if self.is_leaf() { 1 } else { 0 };
        if right_begins_from < first || right_begins_from >= self.nrecs() {
            return Err(KestrelError::InvalidParameter {
                name: "right_begins_from".to_string(),
                value: right_begins_from.to_string(),
            });
        }
        if self.is_leaf() {
            let left = self.key_noprefix(right_begins_from - 1);
            let right = self.key_noprefix(right_begins_from);
            let common = common_leading_bytes(left, right);
            Ok(KeyStr::from_parts(self.prefix_key(), &right[..(common + 1).min(right.len())]))
        } else {
            Ok(KeyStr::from_parts(
                self.prefix_key(),
                self.key_noprefix(right_begins_from),
            ))
        }
    }

    /// Chooses a split point, returning the separator and the first slot
    /// that moves right.
    ///
    /// The center sits at the middle record, at 90% after a run of
    /// right-most inserts, or at 10% after left-most ones. Within a window
    /// of a tenth of the records either side, the shortest separator wins
    /// and ties go to the center. A page being filled in key order by a
    /// bulk load may instead split with no records at all, making
    /// `triggering_key` the separator.
    pub fn suggest_fence_for_split(&self, triggering_key: &KeyStr) -> Result<(KeyStr, usize)> {
        let n = self.nrecs();
        if self.check_chance_for_norecord_split(triggering_key) {
            let mid = if self.is_leaf() {
                let last = self.get_key(n - 1);
                let common = last.common_leading_bytes(triggering_key);
                let raw = triggering_key.as_bytes();
                KeyStr::from_stored(&raw[..(common + 1).min(raw.len())])
            } else {
                triggering_key.clone()
            };
            return Ok((mid, n));
        }

        if n < 2 {
            return Err(KestrelError::InvalidParameter {
                name: "nrecs".to_string(),
                value: n.to_string(),
            });
        }

        let center = if self.is_insertion_skewed_right() {
            n * 9 / 10
        } else if self.is_insertion_skewed_left() {
            n / 10
        } else {
            n / 2
        };
        let start = if center > n / 10 { center - n / 10 } else { 1 };
        let end = (center + n / 10 + 1).min(n);

        let mut best: Option<(usize, usize)> = None;
        for boundary in start..end {
            let len = if self.is_leaf() {
                let left = self.key_noprefix(boundary - 1);
                let right = self.key_noprefix(boundary);
                common_leading_bytes(left, right) + 1
            } else {
                self.key_noprefix(boundary).len()
            };
            let better = match best {
                None => true,
                Some((_, best_len)) => len < best_len || (len == best_len && boundary == center),
            };
            if better {
                best = Some((boundary, len));
            }
        }

        let (boundary, _) = best.ok_or_else(|| {
            KestrelError::BTreeCorrupted(format!("no split point among {} records", n))
        })?;
        Ok((self.recalculate_fence_for_split(boundary)?, boundary))
    }

    /// Whether inserting `key` should split off an empty right page instead
    /// of moving records.
    ///
    /// Only worth it for pre-sorted insertion that has nearly filled the
    /// page and is appending past the last record, and only while the
    /// page still has room for the longer fence record.
    pub fn check_chance_for_norecord_split(&self, key: &KeyStr) -> bool {
        let n = self.nrecs();
        if !self.is_insertion_extremely_skewed_right() || n == 0 {
            return false;
        }
        let usable = self.usable_space();
        if usable > self.used_space() * 3 / n && usable > PAGE_SIZE / 10 {
            return false;
        }

        let raw = key.as_bytes();
        let prefix = self.prefix_key();
        if !raw.starts_with(prefix) {
            return false;
        }
        if self.key_noprefix(n - 1) >= &raw[prefix.len()..] {
            return false;
        }

        let mut needed = self.fence_low_len() + key.len();
        needed += if self.chain_fence_high_len() == 0 {
            self.fence_high_len()
        } else {
            self.chain_fence_high_len()
        };
        usable >= needed
    }

    /// Verifies poor-man's keys and, optionally, key order and the heap.
    pub fn is_consistent(&self, check_keyorder: bool, check_space: bool) -> bool {
        if self.nitems() == 0 || self.item_poor(0) != 0 {
            return false;
        }
        let poor_ok = (0..self.nrecs())
            .all(|slot| self.item_poor(slot + 1) == poor_man_key(self.key_noprefix(slot)));
        if !poor_ok {
            return false;
        }
        if check_keyorder && !self.is_consistent_keyorder() {
            return false;
        }
        if check_space && !self.items_are_consistent() {
            return false;
        }
        true
    }

    fn is_consistent_keyorder(&self) -> bool {
        let n = self.nrecs();
        let low_noprefix = &self.fence_low()[self.prefix_len()..];
        if n == 0 {
            return low_noprefix < self.fence_high_noprefix();
        }
        if low_noprefix > self.key_noprefix(0) {
            return false;
        }
        let ordered = (1..n).all(|slot| self.key_noprefix(slot - 1) < self.key_noprefix(slot));
        ordered && self.key_noprefix(n - 1) < self.fence_high_noprefix()
    }

    /// Space accounting of a leaf.
    pub fn leaf_stats(&self) -> LeafStats {
        let mut stats = LeafStats {
            header_bytes: ITEM_AREA_START + self.item_space(0),
            unused_bytes: self.usable_space(),
            ..LeafStats::default()
        };
        for slot in 0..self.nrecs() {
            let key_len = self.key_noprefix(slot).len();
            let el_len = self.element(slot).len();
            stats.entry_count += 1;
            stats.key_bytes += key_len;
            stats.data_bytes += el_len;
            stats.entry_overhead_bytes += self.item_space(slot + 1) - key_len - el_len;
        }
        stats
    }
}

impl<B: DerefMut<Target = PageImage>> BTreePage<B> {
    /// Reinitializes the page, optionally filling it with records taken
    /// from one or two other pages.
    ///
    /// Records are re-truncated to this page's prefix. With
    /// `steal_src2_pid0` the second source's pid0 is also brought over,
    /// keyed by that source's low fence. The new image is built aside and
    /// copied in only when everything fit, so on error the page is
    /// untouched.
    pub fn format_steal(
        &mut self,
        spec: &FormatSpec,
        src1: Option<StealSource<'_>>,
        src2: Option<StealSource<'_>>,
        steal_src2_pid0: bool,
    ) -> Result<()> {
        if spec.level > LEAF_LEVEL && spec.pid0.is_none() {
            return Err(KestrelError::InvalidParameter {
                name: "pid0".to_string(),
                value: "none on an interior page".to_string(),
            });
        }
        let prefix_len = spec.fences.prefix_len();
        for key in [&spec.fences.low, &spec.fences.high, &spec.fences.chain_high] {
            if key.len() > MAX_ENTRY_SIZE + 1 {
                return Err(KestrelError::KeyTooLarge {
                    size: key.len(),
                    max: MAX_ENTRY_SIZE + 1,
                });
            }
        }

        let mut scratch = BTreePage::new(zeroed_page());
        PageHeader::new(spec.page_id, spec.store, PageType::BTree)
            .write_to(&mut scratch.image_mut()[..]);
        scratch.set_root(spec.root);
        scratch.set_level(spec.level);
        scratch.set_pid0(spec.pid0);
        scratch.set_foster(spec.foster);
        scratch.set_fence_lens(
            spec.fences.low.len(),
            spec.fences.high.len(),
            spec.fences.chain_high.len(),
        );
        scratch.set_prefix_len(prefix_len);
        scratch.set_consecutive_skewed_insertions(0);
        scratch.init_items();

        let fence_rec = spec.fences.pack(prefix_len);
        if !scratch.insert_item(0, false, 0, 0, &fence_rec) {
            return Err(scratch.wont_fit_fence(fence_rec.len()));
        }

        if let Some(src) = src1 {
            scratch.steal_records(src)?;
        }
        if steal_src2_pid0 {
            let src = src2.ok_or_else(|| KestrelError::InvalidParameter {
                name: "steal_src2_pid0".to_string(),
                value: "without a second source".to_string(),
            })?;
            let src_page = BTreePage::new(src.image);
            let src_pid0 = src_page.pid0().ok_or_else(|| {
                KestrelError::BTreeCorrupted(format!("page {} has no pid0", src_page.page_id()))
            })?;
            let low = src_page.fence_low();
            let trunc = scratch.truncate(low, src_page.page_id())?;
            let slot = scratch.nrecs();
            if !scratch.insert_item(slot + 1, false, poor_man_key(trunc), src_pid0.encode(), trunc) {
                return Err(scratch.wont_fit_fence(trunc.len()));
            }
        }
        if let Some(src) = src2 {
            scratch.steal_records(src)?;
        }

        self.image_mut().copy_from_slice(&scratch.image()[..]);
        Ok(())
    }

    fn truncate<'k>(&self, key: &'k [u8], source: PageId) -> Result<&'k [u8]> {
        let prefix = self.prefix_key();
        if !key.starts_with(prefix) {
            return Err(KestrelError::BTreeCorrupted(format!(
                "record from page {} lies outside the new fences",
                source
            )));
        }
        Ok(&key[prefix.len()..])
    }

    fn wont_fit_fence(&self, data_len: usize) -> KestrelError {
        KestrelError::RecordWontFit {
            needed: self.predict_item_space(data_len),
            available: self.usable_space(),
        }
    }

    fn steal_records(&mut self, src: StealSource<'_>) -> Result<()> {
        let src_page = BTreePage::new(src.image);
        if src.from > src.to || src.to > src_page.nrecs() {
            return Err(KestrelError::InvalidParameter {
                name: "steal range".to_string(),
                value: format!("{}..{} of {}", src.from, src.to, src_page.nrecs()),
            });
        }
        if src_page.is_leaf() != self.is_leaf() {
            return Err(KestrelError::BTreeCorrupted(
                "records stolen across tree levels".to_string(),
            ));
        }

        for slot in src.from..src.to {
            let key = src_page.get_key(slot);
            if !self.fence_contains(&key) {
                return Err(KestrelError::BTreeCorrupted(format!(
                    "record from page {} lies outside the new fences",
                    src_page.page_id()
                )));
            }
            let trunc = self.truncate(key.as_bytes(), src_page.page_id())?;
            let poor = poor_man_key(trunc);
            let (child, data) = if self.is_leaf() {
                (0, pack_leaf_record(trunc, src_page.element(slot)))
            } else {
                (src_page.item_child(slot + 1), trunc.to_vec())
            };
            let pos = self.nrecs() + 1;
            if !self.insert_item(pos, src_page.is_ghost(slot), poor, child, &data) {
                return Err(self.wont_fit_fence(data.len()));
            }
        }
        Ok(())
    }

    /// Rewrites the fence record with the current prefix length.
    pub fn replace_fence_rec(&mut self, fences: &FenceKeys) -> Result<()> {
        let prefix_len = self.prefix_len();
        if fences.prefix_len() < prefix_len {
            return Err(KestrelError::InvalidParameter {
                name: "fences".to_string(),
                value: format!("share fewer than {} prefix bytes", prefix_len),
            });
        }
        let fence_rec = fences.pack(prefix_len);
        if !self.replace_item_data(0, 0, &fence_rec) {
            return Err(self.wont_fit_fence(fence_rec.len()));
        }
        self.set_fence_lens(fences.low.len(), fences.high.len(), fences.chain_high.len());
        Ok(())
    }

    /// Splits off an empty foster child covering `[fence_high, chain_high)`.
    ///
    /// When the narrower range buys more than a few bytes of prefix the
    /// page is reformatted to compress its keys. Otherwise only the fence
    /// record and header change.
    pub fn norecord_split(
        &mut self,
        foster: ChildRef,
        fence_high: &KeyStr,
        chain_high: &KeyStr,
    ) -> Result<()> {
        let low = KeyStr::from_stored(self.fence_low());
        let fences = FenceKeys::new(low, fence_high.clone(), chain_high.clone());
        let new_prefix_len = fences.prefix_len();

        if new_prefix_len > self.prefix_len() + 3 {
            let copy: Box<PageImage> = Box::new(*self.image());
            let old = BTreePage::new(&*copy);
            let spec = FormatSpec {
                page_id: old.page_id(),
                store: PageHeader::from_bytes(&copy[..]).store,
                root: old.root(),
                level: old.level(),
                pid0: old.pid0(),
                foster: Some(foster),
                fences,
            };
            let all = StealSource {
                image: &*copy,
                from: 0,
                to: old.nrecs(),
            };
            self.format_steal(&spec, Some(all), None, false)?;
            self.set_lsn(old.lsn());
        } else {
            self.replace_fence_rec(&fences)?;
            self.set_foster(Some(foster));
            self.set_consecutive_skewed_insertions(0);
        }
        Ok(())
    }

    /// Drops the foster child and the chain fence.
    ///
    /// The chain bytes stay in the fence record; only its length is reset.
    pub fn clear_foster(&mut self) {
        self.set_foster(None);
        let (low, high) = (self.fence_low_len(), self.fence_high_len());
        self.set_fence_lens(low, high, 0);
    }

    /// Reclaims ghosts and gaps. Returns the slots of the reclaimed ghosts.
    pub fn defrag(&mut self) -> Vec<usize> {
        let ghosts: Vec<usize> = (0..self.nrecs()).filter(|&slot| self.is_ghost(slot)).collect();
        self.compact();
        ghosts
    }
}
