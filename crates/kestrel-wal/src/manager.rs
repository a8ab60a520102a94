//! The durability contract between the log and the buffer pool.

use crate::record::LogRecord;
use kestrel_common::{Lsn, Result};

/// What the page cleaner needs from the log.
///
/// LSNs name end positions: a record is durable once `durable_lsn()` is at
/// or past its LSN. A page whose header LSN is `<= durable_lsn()` can be
/// written to its volume without violating write-ahead logging.
pub trait LogManager: Send + Sync {
    /// End position of the last appended record (the log tail).
    fn curr_lsn(&self) -> Lsn;

    /// End position of the durable prefix of the log.
    fn durable_lsn(&self) -> Lsn;

    /// Blocks until every record with LSN `<= lsn` is durable.
    ///
    /// Implementations may make more of the log durable than asked for;
    /// callers only rely on `durable_lsn() >= lsn` afterwards.
    fn flush(&self, lsn: Lsn) -> Result<()>;

    /// Appends a record and returns its assigned LSN.
    fn append(&self, record: LogRecord) -> Result<Lsn>;
}
