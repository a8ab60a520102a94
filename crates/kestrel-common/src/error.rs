//! Error types for Kestrel.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in Kestrel storage operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Volume and page errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    #[error("Checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page_id: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Volume {vol} is not mounted")]
    VolumeNotMounted { vol: u16 },

    #[error("Volume id {vol} out of range (max {max})")]
    InvalidVolume { vol: u16, max: u16 },

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Latch would block")]
    LatchWouldBlock,

    #[error("No root page registered for store {store} on volume {vol}")]
    StoreNotFound { vol: u16, store: u16 },

    #[error("Frame {frame} does not hold page {page_id}")]
    FrameMismatch { frame: u32, page_id: u64 },

    // Page layout errors
    #[error("Record won't fit: needs {needed} bytes, {available} available")]
    RecordWontFit { needed: usize, available: usize },

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("B-tree page inconsistent: {0}")]
    BTreeCorrupted(String),

    // WAL errors
    #[error("WAL write failed: {0}")]
    WalWriteFailed(String),

    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    // Cleaner errors
    #[error("Page cleaner failed: {0}")]
    CleanerFailed(String),

    #[error("Page cleaner gave up after {rounds} rounds of latch contention")]
    CleanerContention { rounds: u32 },

    #[error("Page cleaners did not stop within {waited_ms} ms")]
    CleanerJoinTimeout { waited_ms: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Returns true for the won't-fit class of errors a caller resolves by
    /// compacting or splitting the page.
    pub fn is_record_wont_fit(&self) -> bool {
        matches!(self, KestrelError::RecordWontFit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = KestrelError::PageCorrupted {
            page_id: 100,
            reason: "bad slot table".to_string(),
        };
        assert_eq!(err.to_string(), "Page corrupted: 100, reason: bad slot table");
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = KestrelError::ChecksumMismatch {
            page_id: 7,
            stored: 0xdead_beef,
            computed: 0x0000_0001,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch on page 7: stored 0xdeadbeef, computed 0x00000001"
        );
    }

    #[test]
    fn test_record_wont_fit() {
        let err = KestrelError::RecordWontFit {
            needed: 120,
            available: 40,
        };
        assert!(err.is_record_wont_fit());
        assert_eq!(err.to_string(), "Record won't fit: needs 120 bytes, 40 available");
        assert!(!KestrelError::LatchWouldBlock.is_record_wont_fit());
    }

    #[test]
    fn test_cleaner_errors_display() {
        let err = KestrelError::CleanerContention { rounds: 51 };
        assert_eq!(
            err.to_string(),
            "Page cleaner gave up after 51 rounds of latch contention"
        );

        let err = KestrelError::CleanerJoinTimeout { waited_ms: 1000 };
        assert_eq!(err.to_string(), "Page cleaners did not stop within 1000 ms");

        let err = KestrelError::CleanerFailed("write error".to_string());
        assert_eq!(err.to_string(), "Page cleaner failed: write error");
    }

    #[test]
    fn test_wal_errors_display() {
        let err = KestrelError::WalWriteFailed("disk full".to_string());
        assert_eq!(err.to_string(), "WAL write failed: disk full");

        let err = KestrelError::WalCorrupted {
            lsn: 12345,
            reason: "truncated record".to_string(),
        };
        assert_eq!(err.to_string(), "WAL corrupted at LSN 12345: truncated record");
    }

    #[test]
    fn test_invalid_volume_display() {
        let err = KestrelError::InvalidVolume { vol: 40, max: 32 };
        assert_eq!(err.to_string(), "Volume id 40 out of range (max 32)");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KestrelError>();
    }
}
