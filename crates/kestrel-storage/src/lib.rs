//! Storage layer for Kestrel.
//!
//! This crate provides:
//! - The `VolumeStore` contract the buffer pool and cleaner read and write
//!   pages through
//! - `DiskManager`, one file per volume
//! - The slotted B-tree page layout

pub mod btree;
mod disk;

pub use btree::{BTreePage, ChildRef, FenceKeys, FormatSpec, KeyStr, StealSource};
pub use disk::{DiskManager, DiskManagerConfig, VolumeStore};
