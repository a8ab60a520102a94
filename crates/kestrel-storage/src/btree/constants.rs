//! Byte layout of a B-tree page.

use kestrel_common::page::{PageHeader, PAGE_SIZE};

// B-tree header fields, immediately after the generic page header.

pub(crate) const ROOT_OFFSET: usize = PageHeader::SIZE;
pub(crate) const PID0_OFFSET: usize = PageHeader::SIZE + 4;
pub(crate) const FOSTER_OFFSET: usize = PageHeader::SIZE + 8;
pub(crate) const LEVEL_OFFSET: usize = PageHeader::SIZE + 12;
pub(crate) const FENCE_LOW_LEN_OFFSET: usize = PageHeader::SIZE + 14;
pub(crate) const FENCE_HIGH_LEN_OFFSET: usize = PageHeader::SIZE + 16;
pub(crate) const CHAIN_HIGH_LEN_OFFSET: usize = PageHeader::SIZE + 18;
pub(crate) const PREFIX_LEN_OFFSET: usize = PageHeader::SIZE + 20;
pub(crate) const SKEW_OFFSET: usize = PageHeader::SIZE + 22;
pub(crate) const NITEMS_OFFSET: usize = PageHeader::SIZE + 24;
pub(crate) const NGHOSTS_OFFSET: usize = PageHeader::SIZE + 26;
pub(crate) const RECORD_HEAD_OFFSET: usize = PageHeader::SIZE + 28;

/// Size of the B-tree header (30 bytes of fields, 2 reserved).
pub const BTREE_HEADER_SIZE: usize = 32;

/// First byte of the slot table.
pub const ITEM_AREA_START: usize = PageHeader::SIZE + BTREE_HEADER_SIZE;

/// Bytes available to slots and item bodies together.
pub const ITEM_AREA_SIZE: usize = PAGE_SIZE - ITEM_AREA_START;

/// Slot entry: offset with ghost bit (2), data length (2), poor-man's key (2).
pub const SLOT_SIZE: usize = 6;

/// High bit of a slot's offset word marks a ghost.
pub(crate) const GHOST_BIT: u16 = 0x8000;

/// Child page reference stored at the front of every interior item body.
pub const CHILD_SIZE: usize = 4;

/// Leaf item bodies start with the truncated key length.
pub const KEY_LENGTH_SIZE: usize = 2;

/// Worst-case per-item overhead beyond the payload.
pub const MAX_ITEM_OVERHEAD: usize = SLOT_SIZE + CHILD_SIZE;

/// Level of leaf pages. Interior levels count upward from here.
pub const LEAF_LEVEL: i16 = 1;

/// Bound on the consecutive-skewed-insertion counter.
pub const SKEW_LIMIT: i16 = 100;

/// Counter value beyond which a split favors the tail (or head, negated).
pub const SKEWED_THRESHOLD: i16 = 5;

/// Counter value treated as pure sequential (bulk-load) insertion.
pub const EXTREME_SKEW_THRESHOLD: i16 = 50;

/// Largest key or element accepted on a page.
///
/// Two entries must always fit: the fence item (low, high, and chain keys at
/// up to `MAX_ENTRY_SIZE + 1` bytes each) plus two leaf records.
pub const MAX_ENTRY_SIZE: usize =
    (ITEM_AREA_SIZE - 3 * MAX_ITEM_OVERHEAD - 2 * KEY_LENGTH_SIZE) / 5 - 1;
