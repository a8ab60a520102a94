//! Configuration structures for Kestrel.

use crate::error::{KestrelError, Result};
use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the engine as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for volume files.
    pub data_dir: PathBuf,
    /// Directory for WAL files.
    pub wal_dir: PathBuf,
    /// Page size in bytes. Fixed at compile time, recorded for validation.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_pool_pages: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
    /// Replace child page ids with frame indexes while the child is resident.
    pub swizzling: bool,
    /// Background page cleaner settings.
    pub cleaner: CleanerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_dir: PathBuf::from("./data/wal"),
            page_size: PAGE_SIZE,
            buffer_pool_pages: 16384, // 128 MB with 8 KB pages
            fsync_enabled: true,
            swizzling: true,
            cleaner: CleanerConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }

    /// Checks the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size != PAGE_SIZE {
            return Err(KestrelError::InvalidParameter {
                name: "page_size".to_string(),
                value: self.page_size.to_string(),
            });
        }
        if self.buffer_pool_pages == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "buffer_pool_pages".to_string(),
                value: "0".to_string(),
            });
        }
        self.cleaner.validate()
    }
}

/// Settings for the background page cleaner.
///
/// Sleep intervals are in milliseconds. A slave that finds nothing to do
/// sleeps `interval_min_ms`, doubling on every uninterrupted sleep up to
/// `interval_max_ms`. The force paths poll with the same doubling scheme
/// between `force_poll_min_ms` and `force_poll_max_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Number of slave threads. Volumes map to threads by `vol % threads`.
    pub threads: u32,
    pub interval_min_ms: u32,
    pub interval_max_ms: u32,
    /// Capacity of each slave's write buffer, in pages.
    pub write_buffer_pages: u32,
    /// Start cleaning as soon as the threads are spawned instead of on the
    /// first explicit wake-up.
    pub initially_wakeup: bool,
    /// Rounds of latch contention tolerated before a demanded flush is
    /// declared stuck.
    pub max_contention_rounds: u32,
    pub force_poll_min_ms: u32,
    pub force_poll_max_ms: u32,
    /// Bounded join used when a dirty shutdown cuts a force short.
    pub join_timeout_on_dirty_shutdown_ms: u32,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            interval_min_ms: 1,
            interval_max_ms: 256,
            write_buffer_pages: 64,
            initially_wakeup: true,
            max_contention_rounds: 50,
            force_poll_min_ms: 1,
            force_poll_max_ms: 128,
            join_timeout_on_dirty_shutdown_ms: 1000,
        }
    }
}

impl CleanerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(invalid("cleaner.threads", self.threads));
        }
        if self.interval_min_ms == 0 || self.interval_min_ms > self.interval_max_ms {
            return Err(invalid("cleaner.interval_min_ms", self.interval_min_ms));
        }
        if self.write_buffer_pages == 0 {
            return Err(invalid("cleaner.write_buffer_pages", self.write_buffer_pages));
        }
        if self.force_poll_min_ms == 0 || self.force_poll_min_ms > self.force_poll_max_ms {
            return Err(invalid("cleaner.force_poll_min_ms", self.force_poll_min_ms));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: u32) -> KestrelError {
    KestrelError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
