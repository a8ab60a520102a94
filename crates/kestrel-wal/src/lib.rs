//! Write-Ahead Log (WAL) for Kestrel.
//!
//! Page images reach their volume only after the log records describing
//! them are durable. This crate provides the record format, the
//! `LogManager` contract the page cleaner enforces that ordering through,
//! and `WalWriter`, a single-file implementation.

pub mod manager;
pub mod record;
pub mod writer;

pub use kestrel_common::Lsn;
pub use manager::LogManager;
pub use record::{LogRecord, LogRecordType};
pub use writer::{WalWriter, WalWriterConfig};
