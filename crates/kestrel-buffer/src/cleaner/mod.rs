//! Background page cleaner.
//!
//! `PageCleaner` owns a fixed set of slave threads and routes flush requests
//! to them. Volume `v` is always served by thread `v % threads`; every path
//! that needs that mapping goes through `cleaner_for_volume`.
//!
//! Requests and failures travel through `CleanerRequestState`, a set of
//! atomics shared by the coordinator and the slaves. Writers publish with
//! release ordering and readers observe with acquire ordering, so a slave
//! that sees a request flag also sees everything written before it was set.

mod slave;
mod write_buffer;

pub use slave::SlaveStatus;

use crate::pool::BufferPool;
use kestrel_common::{CleanerConfig, KestrelError, Lsn, Result, VolumeId, MAX_VOLUME_COUNT};
use kestrel_wal::LogManager;
use parking_lot::Mutex;
use slave::SlaveState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Flush requests and failure flags shared between the coordinator and the
/// slave threads.
#[derive(Debug)]
pub struct CleanerRequestState {
    requested_volumes: [AtomicBool; MAX_VOLUME_COUNT],
    requested_lsn: AtomicU64,
    error_happened: AtomicBool,
    dirty_shutdown: AtomicBool,
    stop_requested: AtomicBool,
}

impl Default for CleanerRequestState {
    fn default() -> Self {
        Self {
            requested_volumes: std::array::from_fn(|_| AtomicBool::new(false)),
            requested_lsn: AtomicU64::new(0),
            error_happened: AtomicBool::new(false),
            dirty_shutdown: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }
}

impl CleanerRequestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the owning slave to write back every dirty page of `vol`.
    /// Out-of-range volumes are ignored.
    pub fn request_volume(&self, vol: VolumeId) {
        if let Some(flag) = self.requested_volumes.get(vol as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn is_volume_requested(&self, vol: VolumeId) -> bool {
        self.requested_volumes
            .get(vol as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn any_volume_requested(&self) -> bool {
        self.requested_volumes
            .iter()
            .any(|flag| flag.load(Ordering::Acquire))
    }

    pub(crate) fn clear_volume_request(&self, vol: VolumeId) {
        if let Some(flag) = self.requested_volumes.get(vol as usize) {
            flag.store(false, Ordering::Release);
        }
    }

    /// Pages first dirtied at or before this LSN are due. Never moves back.
    pub fn requested_lsn(&self) -> Lsn {
        Lsn(self.requested_lsn.load(Ordering::Acquire))
    }

    pub fn request_lsn(&self, lsn: Lsn) {
        self.requested_lsn.fetch_max(lsn.0, Ordering::AcqRel);
    }

    /// Set once a slave has failed. Every slave stops, and the owner is
    /// expected to shut down.
    pub fn error_happened(&self) -> bool {
        self.error_happened.load(Ordering::Acquire)
    }

    pub(crate) fn set_error_happened(&self) {
        self.error_happened.store(true, Ordering::Release);
    }

    /// Marks the shutdown as unclean. Waiting loops return at once and the
    /// slaves stop after their current page.
    pub fn signal_dirty_shutdown(&self) {
        self.dirty_shutdown.store(true, Ordering::Release);
    }

    pub fn is_dirty_shutdown(&self) -> bool {
        self.dirty_shutdown.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }
}

/// State reachable from every slave thread.
pub(crate) struct CleanerShared {
    pool: Arc<BufferPool>,
    log: Arc<dyn LogManager>,
    config: CleanerConfig,
    requests: Arc<CleanerRequestState>,
    slaves: Vec<SlaveState>,
}

impl CleanerShared {
    fn cleaner_for_volume(&self, vol: VolumeId) -> usize {
        vol as usize % self.slaves.len()
    }
}

/// Coordinator for the cleaner slave threads.
pub struct PageCleaner {
    shared: Arc<CleanerShared>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl PageCleaner {
    pub fn new(pool: Arc<BufferPool>, log: Arc<dyn LogManager>, config: CleanerConfig) -> Result<Self> {
        Self::with_request_state(pool, log, config, Arc::new(CleanerRequestState::new()))
    }

    /// Builds a cleaner around a request state the caller also holds, so
    /// other components can signal a dirty shutdown or check for failures.
    pub fn with_request_state(
        pool: Arc<BufferPool>,
        log: Arc<dyn LogManager>,
        config: CleanerConfig,
        requests: Arc<CleanerRequestState>,
    ) -> Result<Self> {
        config.validate()?;
        let slaves = (0..config.threads).map(|_| SlaveState::new()).collect();
        Ok(Self {
            shared: Arc::new(CleanerShared {
                pool,
                log,
                config,
                requests,
                slaves,
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.shared.config
    }

    pub fn request_state(&self) -> &Arc<CleanerRequestState> {
        &self.shared.requests
    }

    pub fn thread_count(&self) -> usize {
        self.shared.slaves.len()
    }

    /// Index of the slave thread that owns `vol`.
    pub fn cleaner_for_volume(&self, vol: VolumeId) -> usize {
        self.shared.cleaner_for_volume(vol)
    }

    pub fn slave_status(&self, id: usize) -> Option<SlaveStatus> {
        self.shared.slaves.get(id).map(|slave| slave.status())
    }

    pub fn completed_lsn(&self, id: usize) -> Option<Lsn> {
        self.shared.slaves.get(id).map(|slave| slave.completed_lsn())
    }

    pub fn error_happened(&self) -> bool {
        self.shared.requests.error_happened()
    }

    pub fn signal_dirty_shutdown(&self) {
        self.shared.requests.signal_dirty_shutdown();
    }

    /// Spawns every slave. With `initially_wakeup` off, a slave idles until
    /// its first wake-up.
    pub fn start_cleaners(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(KestrelError::CleanerFailed("cleaners already started".to_string()));
        }

        for id in 0..self.shared.slaves.len() {
            let slave = &self.shared.slaves[id];
            slave.set_start_requested(self.shared.config.initially_wakeup);
            slave.set_status(SlaveStatus::WaitingForStart);

            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("kestrel-cleaner-{}", id))
                .spawn(move || slave::run(shared, id));
            match spawned {
                Ok(handle) => handles.push(Some(handle)),
                Err(e) => {
                    slave.set_status(SlaveStatus::Stopped);
                    self.shared.requests.request_stop();
                    for started in &self.shared.slaves[..id] {
                        started.wake();
                    }
                    for handle in handles.drain(..).flatten() {
                        let _ = handle.join();
                    }
                    return Err(KestrelError::CleanerFailed(format!(
                        "failed to spawn cleaner thread {}: {}",
                        id, e
                    )));
                }
            }
        }
        info!(threads = handles.len(), "cleaner.started");
        Ok(())
    }

    pub fn wakeup_cleaners(&self) {
        for id in 0..self.shared.slaves.len() {
            self.wakeup_cleaner(id);
        }
    }

    pub fn wakeup_cleaner_for_volume(&self, vol: VolumeId) {
        self.wakeup_cleaner(self.cleaner_for_volume(vol));
    }

    fn wakeup_cleaner(&self, id: usize) {
        let slave = &self.shared.slaves[id];
        if slave.status() == SlaveStatus::Stopped {
            debug!(thread = id, "cleaner.wakeup_stopped");
            return;
        }
        slave.wake();
    }

    /// Asks every slave to stop after its current round.
    pub fn request_stop_cleaners(&self) {
        self.shared.requests.request_stop();
        for slave in &self.shared.slaves {
            slave.wake();
        }
    }

    /// Waits for the slaves to exit. `None` waits as long as it takes.
    ///
    /// On timeout the unfinished threads stay registered, so a later call
    /// can wait for them again.
    pub fn join_cleaners(&self, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let mut handles = self.handles.lock();
        let mut panicked = false;

        for slot in handles.iter_mut() {
            let Some(handle) = slot.take() else {
                continue;
            };
            if let Some(timeout) = timeout {
                while !handle.is_finished() {
                    if started.elapsed() >= timeout {
                        *slot = Some(handle);
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(waited_ms, "cleaner.join_timeout");
                        return Err(KestrelError::CleanerJoinTimeout { waited_ms });
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
            panicked |= handle.join().is_err();
        }
        handles.retain(Option::is_some);

        if panicked {
            return Err(KestrelError::CleanerFailed("cleaner thread panicked".to_string()));
        }
        Ok(())
    }

    /// Writes back every dirty page of every volume.
    ///
    /// Returns once all volume requests have been served, with an error if a
    /// slave failed, and early (successfully) on a dirty shutdown.
    pub fn force_all(&self) -> Result<()> {
        if self.shared.requests.is_dirty_shutdown() {
            return Ok(());
        }
        self.ensure_running()?;

        let requests = &self.shared.requests;
        for vol in 1..MAX_VOLUME_COUNT {
            requests.request_volume(vol as VolumeId);
        }
        self.wakeup_cleaners();
        self.poll_until(|| !requests.any_volume_requested())?;
        debug!("cleaner.force_all_done");
        Ok(())
    }

    /// Writes back `vol` until a scan finds no dirty page left on it.
    ///
    /// A page can be updated again after its copy was taken, so one served
    /// request is not enough. In-doubt pages are not counted: they become
    /// writable only after recovery settles them.
    pub fn force_volume(&self, vol: VolumeId) -> Result<()> {
        if vol as usize >= MAX_VOLUME_COUNT {
            return Err(KestrelError::InvalidVolume {
                vol,
                max: MAX_VOLUME_COUNT as u16 - 1,
            });
        }
        if self.shared.requests.is_dirty_shutdown() {
            return Ok(());
        }
        self.ensure_running()?;

        let requests = &self.shared.requests;
        loop {
            requests.request_volume(vol);
            self.wakeup_cleaner_for_volume(vol);
            self.poll_until(|| !requests.is_volume_requested(vol))?;
            if requests.is_dirty_shutdown() {
                return Ok(());
            }

            let remaining = self.dirty_pages_on(vol);
            if remaining == 0 {
                debug!(vol, "cleaner.force_volume_done");
                return Ok(());
            }
            debug!(vol, remaining, "cleaner.force_volume_rescan");
        }
    }

    /// Writes back every page first dirtied at or before `lsn`. The
    /// checkpoint path.
    pub fn force_until_lsn(&self, lsn: Lsn) -> Result<()> {
        if self.shared.requests.is_dirty_shutdown() {
            return Ok(());
        }
        self.ensure_running()?;

        self.shared.requests.request_lsn(lsn);
        self.wakeup_cleaners();
        self.poll_until(|| {
            self.shared
                .slaves
                .iter()
                .all(|slave| slave.completed_lsn() >= lsn)
        })
    }

    fn dirty_pages_on(&self, vol: VolumeId) -> usize {
        self.shared
            .pool
            .blocks()
            .iter()
            .filter(|cb| {
                cb.is_used()
                    && cb.is_dirty()
                    && !cb.is_in_doubt()
                    && cb.page_id().is_some_and(|page_id| page_id.vol == vol)
            })
            .count()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.requests.error_happened() {
            return Err(KestrelError::CleanerFailed("a cleaner thread has failed".to_string()));
        }
        let running = self.shared.slaves.iter().all(|slave| {
            matches!(
                slave.status(),
                SlaveStatus::WaitingForStart | SlaveStatus::Running
            )
        });
        if !running {
            return Err(KestrelError::CleanerFailed("cleaners are not running".to_string()));
        }
        Ok(())
    }

    /// Sleeps with doubling intervals until `done` holds.
    fn poll_until(&self, done: impl Fn() -> bool) -> Result<()> {
        let config = &self.shared.config;
        let requests = &self.shared.requests;
        let max = Duration::from_millis(config.force_poll_max_ms as u64);
        let mut sleep = Duration::from_millis(config.force_poll_min_ms as u64);

        loop {
            if requests.error_happened() {
                return Err(KestrelError::CleanerFailed("a cleaner thread has failed".to_string()));
            }
            if done() {
                return Ok(());
            }
            if requests.is_dirty_shutdown() {
                let timeout = Duration::from_millis(config.join_timeout_on_dirty_shutdown_ms as u64);
                self.request_stop_cleaners();
                if let Err(e) = self.join_cleaners(Some(timeout)) {
                    warn!(error = %e, "cleaner.dirty_shutdown_join");
                }
                info!("cleaner.dirty_shutdown");
                return Ok(());
            }
            if self
                .shared
                .slaves
                .iter()
                .any(|slave| slave.status() == SlaveStatus::Stopped)
            {
                return Err(KestrelError::CleanerFailed("a cleaner thread has exited".to_string()));
            }
            thread::sleep(sleep);
            sleep = (sleep * 2).min(max);
        }
    }
}

impl Drop for PageCleaner {
    fn drop(&mut self) {
        self.request_stop_cleaners();
        let timeout = self.shared.requests.is_dirty_shutdown().then(|| {
            Duration::from_millis(self.shared.config.join_timeout_on_dirty_shutdown_ms as u64)
        });
        if let Err(e) = self.join_cleaners(timeout) {
            warn!(error = %e, "cleaner.drop_join");
        }
    }
}

impl std::fmt::Debug for PageCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let statuses: Vec<SlaveStatus> = self.shared.slaves.iter().map(|s| s.status()).collect();
        f.debug_struct("PageCleaner")
            .field("threads", &statuses)
            .field("requests", &self.shared.requests)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPoolConfig;
    use kestrel_storage::{DiskManager, DiskManagerConfig};
    use kestrel_wal::LogRecord;
    use tempfile::tempdir;

    /// A log that is always durable.
    struct NullLog;

    impl LogManager for NullLog {
        fn curr_lsn(&self) -> Lsn {
            Lsn(1)
        }
        fn durable_lsn(&self) -> Lsn {
            Lsn(1)
        }
        fn flush(&self, _lsn: Lsn) -> Result<()> {
            Ok(())
        }
        fn append(&self, _record: LogRecord) -> Result<Lsn> {
            Ok(Lsn(1))
        }
    }

    fn cleaner(dir: &std::path::Path, config: CleanerConfig) -> Result<PageCleaner> {
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: dir.to_path_buf(),
            fsync_enabled: false,
        })?;
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 8,
                swizzling: true,
            },
            Arc::new(disk),
        ));
        PageCleaner::new(pool, Arc::new(NullLog), config)
    }

    #[test]
    fn test_request_state_flags() {
        let state = CleanerRequestState::new();
        assert!(!state.any_volume_requested());

        state.request_volume(3);
        assert!(state.is_volume_requested(3));
        assert!(state.any_volume_requested());
        state.clear_volume_request(3);
        assert!(!state.any_volume_requested());

        // Out of range is ignored.
        state.request_volume(MAX_VOLUME_COUNT as VolumeId);
        assert!(!state.is_volume_requested(MAX_VOLUME_COUNT as VolumeId));

        state.request_lsn(Lsn(30));
        state.request_lsn(Lsn(10));
        assert_eq!(state.requested_lsn(), Lsn(30));

        assert!(!state.is_dirty_shutdown());
        state.signal_dirty_shutdown();
        assert!(state.is_dirty_shutdown());
    }

    #[test]
    fn test_cleaner_for_volume_is_modulo() {
        let dir = tempdir().unwrap();
        let config = CleanerConfig {
            threads: 3,
            ..Default::default()
        };
        let cleaner = cleaner(dir.path(), config).unwrap();
        assert_eq!(cleaner.thread_count(), 3);
        assert_eq!(cleaner.cleaner_for_volume(0), 0);
        assert_eq!(cleaner.cleaner_for_volume(4), 1);
        assert_eq!(cleaner.cleaner_for_volume(8), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let config = CleanerConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            cleaner(dir.path(), config),
            Err(KestrelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let config = CleanerConfig {
            threads: 2,
            initially_wakeup: false,
            ..Default::default()
        };
        let cleaner = cleaner(dir.path(), config).unwrap();
        assert_eq!(cleaner.slave_status(0), Some(SlaveStatus::NotStarted));
        assert!(cleaner.force_all().is_err());

        cleaner.start_cleaners().unwrap();
        assert!(cleaner.start_cleaners().is_err());
        cleaner.force_all().unwrap();
        cleaner.force_volume(1).unwrap();
        cleaner.force_until_lsn(Lsn(1)).unwrap();
        assert_eq!(cleaner.completed_lsn(0), Some(Lsn(1)));
        assert_eq!(cleaner.completed_lsn(1), Some(Lsn(1)));

        cleaner.request_stop_cleaners();
        cleaner.join_cleaners(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(cleaner.slave_status(0), Some(SlaveStatus::Stopped));
        assert_eq!(cleaner.slave_status(1), Some(SlaveStatus::Stopped));

        // Waking a stopped thread is a no-op.
        cleaner.wakeup_cleaner_for_volume(1);
        assert!(cleaner.force_all().is_err());
    }

    #[test]
    fn test_force_volume_rejects_out_of_range() {
        let dir = tempdir().unwrap();
        let cleaner = cleaner(dir.path(), CleanerConfig::default()).unwrap();
        assert!(matches!(
            cleaner.force_volume(MAX_VOLUME_COUNT as VolumeId),
            Err(KestrelError::InvalidVolume { .. })
        ));
    }

    #[test]
    fn test_dirty_shutdown_short_circuits_force() {
        let dir = tempdir().unwrap();
        let cleaner = cleaner(dir.path(), CleanerConfig::default()).unwrap();
        cleaner.signal_dirty_shutdown();
        // Not even started, yet nothing blocks or fails.
        cleaner.force_all().unwrap();
        cleaner.force_volume(1).unwrap();
    }
}
