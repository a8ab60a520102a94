//! WAL writer for appending log records.

use crate::manager::LogManager;
use crate::record::LogRecord;
use bytes::BytesMut;
use kestrel_common::{KestrelError, Lsn, Result, StorageConfig};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Name of the log file inside `wal_dir`.
const LOG_FILE_NAME: &str = "kestrel.wal";

/// Configuration for the WAL writer.
#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    /// Directory holding the log file.
    pub wal_dir: PathBuf,
    /// Enable fsync on flush.
    pub fsync_enabled: bool,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./data/wal"),
            fsync_enabled: true,
        }
    }
}

impl From<&StorageConfig> for WalWriterConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            wal_dir: config.wal_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

struct WriterState {
    file: Option<File>,
    /// Appended records not yet written to the file.
    pending: BytesMut,
}

/// Thread-safe WAL writer.
///
/// Appends are buffered in memory; `flush` writes the buffer out as one
/// group and advances the durable LSN.
pub struct WalWriter {
    config: WalWriterConfig,
    state: Mutex<WriterState>,
    /// End position of the last appended record.
    tail_lsn: AtomicU64,
    /// End position of the durable prefix.
    durable_lsn: AtomicU64,
}

impl WalWriter {
    /// Opens (or creates) the log in `config.wal_dir`, continuing after any
    /// existing content.
    pub fn new(config: WalWriterConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.wal_dir)?;
        let path = config.wal_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let existing = file.metadata()?.len();
        let tail = Lsn::FIRST.advance(existing);

        Ok(Self {
            config,
            state: Mutex::new(WriterState {
                file: Some(file),
                pending: BytesMut::new(),
            }),
            tail_lsn: AtomicU64::new(tail.0),
            durable_lsn: AtomicU64::new(tail.0),
        })
    }

    /// Returns the directory containing the log.
    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// Flushes and reads every record back in append order.
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        self.flush(self.curr_lsn())?;
        let mut bytes = Vec::new();
        File::open(self.config.wal_dir.join(LOG_FILE_NAME))?.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let record = LogRecord::deserialize(&bytes[offset..])?;
            offset += record.size_on_disk();
            records.push(record);
        }
        Ok(records)
    }

    /// Flushes pending records and closes the file.
    pub fn close(&self) -> Result<()> {
        self.flush(self.curr_lsn())?;
        self.state.lock().file.take();
        Ok(())
    }
}

impl LogManager for WalWriter {
    fn curr_lsn(&self) -> Lsn {
        Lsn(self.tail_lsn.load(Ordering::Acquire))
    }

    fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable_lsn.load(Ordering::Acquire))
    }

    fn flush(&self, lsn: Lsn) -> Result<()> {
        if lsn <= self.durable_lsn() {
            return Ok(());
        }

        let mut state = self.state.lock();
        // Another flusher may have covered us while we waited.
        if lsn <= self.durable_lsn() {
            return Ok(());
        }
        let WriterState { file, pending } = &mut *state;
        let file = file
            .as_mut()
            .ok_or_else(|| KestrelError::WalWriteFailed("WAL closed".to_string()))?;

        let bytes = pending.len();
        file.write_all(&pending[..])?;
        pending.clear();
        if self.config.fsync_enabled {
            file.sync_data()?;
        }

        // The whole pending buffer went out, so durability reaches the tail
        // even when less was requested. Appends happen under the same lock,
        // so the tail is stable here.
        let tail = self.tail_lsn.load(Ordering::Acquire);
        self.durable_lsn.store(tail, Ordering::Release);
        debug!(requested = lsn.0, durable = tail, bytes, "wal.flush");
        Ok(())
    }

    fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            return Err(KestrelError::WalWriteFailed("WAL closed".to_string()));
        }
        if record.payload.len() > LogRecord::MAX_PAYLOAD_SIZE {
            return Err(KestrelError::WalWriteFailed(format!(
                "payload of {} bytes exceeds {}",
                record.payload.len(),
                LogRecord::MAX_PAYLOAD_SIZE
            )));
        }

        let lsn = Lsn(self.tail_lsn.load(Ordering::Acquire)).advance(record.size_on_disk() as u64);
        record.lsn = lsn;
        state.pending.extend_from_slice(&record.serialize());
        self.tail_lsn.store(lsn.0, Ordering::Release);
        Ok(lsn)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
