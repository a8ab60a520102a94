//! Page id to frame index mapping.

use crate::control_block::FrameIndex;
use kestrel_common::page::PageId;
use kestrel_common::VolumeId;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Volume served by the direct array. Single-volume setups never hash.
const DIRECT_VOLUME: VolumeId = 1;

/// Direct array size. Covers the first 128 MB of the volume at 8 KB pages.
const DIRECT_PATH_SIZE: usize = 16384;

const EMPTY_FRAME: u32 = u32::MAX;
const EMPTY_KEY: u64 = u64::MAX;
const TOMBSTONE_KEY: u64 = u64::MAX - 1;

/// Lock-free reads, serialized writes.
///
/// Lookups take no lock: a reader may observe a mapping that is being torn
/// down, so callers pin the frame and re-check its control block. Inserts and
/// removals must be serialized by the caller; the buffer pool does so under
/// its frame-allocation mutex.
///
/// Two tiers:
/// - a direct array for volume 1 pages below `DIRECT_PATH_SIZE`
/// - an open-addressing hash table with linear probing for everything else
pub struct PageTable {
    direct_path: Box<[AtomicU32]>,
    hash_keys: Box<[AtomicU64]>,
    hash_values: Box<[AtomicU32]>,
    hash_mask: usize,
}

impl PageTable {
    /// Creates a table sized for `capacity` resident pages.
    pub fn new(capacity: usize) -> Self {
        // 2x capacity keeps the load factor near 50%.
        let hash_size = (capacity * 2).next_power_of_two().max(1024);

        Self {
            direct_path: (0..DIRECT_PATH_SIZE)
                .map(|_| AtomicU32::new(EMPTY_FRAME))
                .collect(),
            hash_keys: (0..hash_size).map(|_| AtomicU64::new(EMPTY_KEY)).collect(),
            hash_values: (0..hash_size)
                .map(|_| AtomicU32::new(EMPTY_FRAME))
                .collect(),
            hash_mask: hash_size - 1,
        }
    }

    #[inline(always)]
    fn direct_slot(page_id: PageId) -> Option<usize> {
        (page_id.vol == DIRECT_VOLUME && (page_id.page_num as usize) < DIRECT_PATH_SIZE)
            .then_some(page_id.page_num as usize)
    }

    #[inline(always)]
    pub fn get(&self, page_id: PageId) -> Option<FrameIndex> {
        if let Some(slot) = Self::direct_slot(page_id) {
            let val = self.direct_path[slot].load(Ordering::Acquire);
            return (val != EMPTY_FRAME).then_some(val);
        }

        let key = page_id.as_u64();
        let mut idx = self.hash_index(key);
        for _ in 0..self.hash_keys.len() {
            let stored = self.hash_keys[idx].load(Ordering::Acquire);
            if stored == EMPTY_KEY {
                return None;
            }
            if stored == key {
                return Some(self.hash_values[idx].load(Ordering::Acquire));
            }
            idx = (idx + 1) & self.hash_mask;
        }
        None
    }

    /// Maps `page_id` to `frame`. Returns false only if the hash tier is full.
    pub fn insert(&self, page_id: PageId, frame: FrameIndex) -> bool {
        if let Some(slot) = Self::direct_slot(page_id) {
            self.direct_path[slot].store(frame, Ordering::Release);
            return true;
        }

        let key = page_id.as_u64();
        let mut idx = self.hash_index(key);
        let mut reusable = None;
        for _ in 0..self.hash_keys.len() {
            let stored = self.hash_keys[idx].load(Ordering::Acquire);
            if stored == key {
                self.hash_values[idx].store(frame, Ordering::Release);
                return true;
            }
            if stored == TOMBSTONE_KEY && reusable.is_none() {
                reusable = Some(idx);
            }
            if stored == EMPTY_KEY {
                let target = reusable.unwrap_or(idx);
                // Value before key, so a reader that sees the key sees the frame.
                self.hash_values[target].store(frame, Ordering::Release);
                self.hash_keys[target].store(key, Ordering::Release);
                return true;
            }
            idx = (idx + 1) & self.hash_mask;
        }

        match reusable {
            Some(target) => {
                self.hash_values[target].store(frame, Ordering::Release);
                self.hash_keys[target].store(key, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Removes the mapping and returns the frame it pointed at.
    pub fn remove(&self, page_id: PageId) -> Option<FrameIndex> {
        if let Some(slot) = Self::direct_slot(page_id) {
            let old = self.direct_path[slot].swap(EMPTY_FRAME, Ordering::AcqRel);
            return (old != EMPTY_FRAME).then_some(old);
        }

        let key = page_id.as_u64();
        let mut idx = self.hash_index(key);
        for _ in 0..self.hash_keys.len() {
            let stored = self.hash_keys[idx].load(Ordering::Acquire);
            if stored == EMPTY_KEY {
                return None;
            }
            if stored == key {
                let frame = self.hash_values[idx].load(Ordering::Acquire);
                self.hash_keys[idx].store(TOMBSTONE_KEY, Ordering::Release);
                return Some(frame);
            }
            idx = (idx + 1) & self.hash_mask;
        }
        None
    }

    #[inline(always)]
    fn hash_index(&self, key: u64) -> usize {
        // FxHash-style multiply.
        let hash = key.wrapping_mul(0x517cc1b727220a95);
        (hash as usize) & self.hash_mask
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.get(page_id).is_some()
    }

    /// Number of mapped pages. Walks the whole table.
    pub fn len(&self) -> usize {
        let direct = self
            .direct_path
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != EMPTY_FRAME)
            .count();
        let hashed = self
            .hash_keys
            .iter()
            .filter(|slot| {
                let key = slot.load(Ordering::Relaxed);
                key != EMPTY_KEY && key != TOMBSTONE_KEY
            })
            .count();
        direct + hashed
    }
}
