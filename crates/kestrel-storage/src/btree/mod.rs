//! Slotted B-tree page layout.
//!
//! Every B-tree page, leaf or interior, shares one persisted format:
//!
//! ```text
//! +---------------------------+ 0
//! | generic page header       |   page id, store, LSN, type, flags, CRC32
//! +---------------------------+ 32
//! | root: u32                 |
//! | pid0: u32                 |   left-most child (interior only)
//! | foster: u32               |   foster child of an unfinished split
//! | level: i16                |   1 = leaf
//! | fence_low_len: u16        |
//! | fence_high_len: u16       |
//! | chain_high_len: u16       |
//! | prefix_len: u16           |
//! | skewed_insertions: i16    |
//! | nitems: u16               |
//! | nghosts: u16              |
//! | record_head: u16          |
//! | reserved: [u8; 2]         |
//! +---------------------------+ 64
//! | slot 0 | slot 1 | ...     |   {offset | ghost bit, length, poor key}
//! |             →             |
//! |        free space         |
//! |             ←             |
//! | ... | body 1 | body 0     |
//! +---------------------------+ 8192
//! ```
//!
//! Item 0 holds the fence record: the low fence, the high fence without
//! the shared prefix, then the foster chain's high fence. Items 1.. are
//! records in key order with the prefix elided:
//!
//! ```text
//! leaf body:     [key_len: u16][truncated key][element]
//! interior body: [child: u32][truncated key]
//! ```
//!
//! Deleting a record normally only sets its ghost bit. The bytes come
//! back when `compact` (or `defrag`) rebuilds the heap, and a later insert
//! of the same key reuses the ghost in place.
//!
//! Keys are `KeyStr`s whose leading sign byte lets `-inf` and `+inf` fences
//! compare against user keys with plain byte order.

mod child;
mod constants;
mod format;
mod key;
mod node;
mod page;

pub use child::ChildRef;
pub use constants::{
    CHILD_SIZE, ITEM_AREA_SIZE, ITEM_AREA_START, KEY_LENGTH_SIZE, LEAF_LEVEL, MAX_ENTRY_SIZE,
    SLOT_SIZE,
};
pub use format::{FenceKeys, FormatSpec, LeafStats, StealSource};
pub use key::{common_leading_bytes, poor_man_key, KeyStr};
pub use page::BTreePage;
