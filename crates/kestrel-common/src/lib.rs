//! Kestrel common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Kestrel components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{CleanerConfig, StorageConfig};
pub use error::{KestrelError, Result};
pub use page::{PageFlags, PageHeader, PageId, PageImage, PageType, PAGE_SIZE};
pub use types::{Lsn, StoreId, VolumeId, MAX_VOLUME_COUNT};
