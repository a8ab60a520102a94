//! Buffer pool management for Kestrel.
//!
//! This crate provides:
//! - Control blocks: per-frame metadata (dirty bit, pin count, rec_lsn,
//!   write-order dependencies) and the upgradeable page latch
//! - `BufferPool`: frames, page table, clock eviction of clean pages, root
//!   registry, and child pointer swizzling
//! - `FixablePage`: the handle B-tree code fixes, latches, and dirties pages
//!   through
//! - `PageCleaner`: background threads that write dirty pages back in
//!   page-id order without ever getting ahead of the log

mod cleaner;
mod control_block;
mod fixable;
mod latch;
mod page_table;
mod pool;

pub use cleaner::{CleanerRequestState, PageCleaner, SlaveStatus};
pub use control_block::{ControlBlock, FrameIndex};
pub use fixable::FixablePage;
pub use latch::{Latch, LatchGuard, LatchMode};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
