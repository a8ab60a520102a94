//! Cleaner slave threads.
//!
//! A slave owns the volumes `vol % threads == id`. Each round it takes a
//! fuzzy look at the control blocks, picks the dirty pages that are due, and
//! writes them back in page-id order, one contiguous run per write call.

use super::write_buffer::WriteBuffer;
use super::CleanerShared;
use crate::control_block::{ControlBlock, FrameIndex};
use kestrel_common::page::{read_flags, read_lsn, stamp_checksum};
use kestrel_common::{KestrelError, Lsn, PageId, Result, VolumeId, MAX_VOLUME_COUNT};
use kestrel_wal::LogRecord;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a slave thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlaveStatus {
    NotStarted = 0,
    WaitingForStart = 1,
    Running = 2,
    Stopped = 3,
}

impl SlaveStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::WaitingForStart,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// The part of a slave the coordinator talks to.
pub(crate) struct SlaveState {
    status: AtomicU8,
    start_requested: AtomicBool,
    wakeup: Mutex<bool>,
    cond: Condvar,
    /// Highest requested LSN a finished round has covered.
    completed_lsn: AtomicU64,
}

impl SlaveState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(SlaveStatus::NotStarted as u8),
            start_requested: AtomicBool::new(false),
            wakeup: Mutex::new(false),
            cond: Condvar::new(),
            completed_lsn: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SlaveStatus {
        SlaveStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SlaveStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn set_start_requested(&self, requested: bool) {
        self.start_requested.store(requested, Ordering::Release);
    }

    pub fn completed_lsn(&self) -> Lsn {
        Lsn(self.completed_lsn.load(Ordering::Acquire))
    }

    /// Wakes the thread, starting it if it is still waiting for a start.
    pub fn wake(&self) {
        self.start_requested.store(true, Ordering::Release);
        let mut woken = self.wakeup.lock();
        *woken = true;
        self.cond.notify_one();
    }

    /// Sleeps up to `timeout`. Returns true if a wake-up ended the sleep.
    fn wait(&self, timeout: Duration) -> bool {
        let mut woken = self.wakeup.lock();
        if !*woken {
            self.cond.wait_for(&mut woken, timeout);
        }
        std::mem::replace(&mut *woken, false)
    }
}

/// Thread body. Returns when a stop is requested, a dirty shutdown is
/// signalled, or any slave has failed.
pub(crate) fn run(shared: Arc<CleanerShared>, id: usize) {
    let slave = &shared.slaves[id];
    slave.set_status(SlaveStatus::WaitingForStart);

    if !wait_for_start(&shared, id) {
        slave.set_status(SlaveStatus::Stopped);
        debug!(thread = id, "cleaner.stop_before_start");
        return;
    }
    slave.set_status(SlaveStatus::Running);
    info!(thread = id, "cleaner.start");

    let mut worker = SlaveWorker::new(Arc::clone(&shared), id);
    let min = Duration::from_millis(shared.config.interval_min_ms as u64);
    let max = Duration::from_millis(shared.config.interval_max_ms as u64);
    let mut interval = min;

    while !should_stop(&shared) {
        if let Err(e) = worker.do_work() {
            error!(thread = id, error = %e, "cleaner.failed");
            shared.requests.set_error_happened();
            break;
        }
        if should_stop(&shared) {
            break;
        }
        if worker.has_pending_work() {
            continue;
        }
        interval = if slave.wait(interval) {
            min
        } else {
            (interval * 2).min(max)
        };
    }

    slave.set_status(SlaveStatus::Stopped);
    info!(thread = id, "cleaner.stop");
}

fn should_stop(shared: &CleanerShared) -> bool {
    let requests = &shared.requests;
    requests.stop_requested() || requests.error_happened() || requests.is_dirty_shutdown()
}

fn wait_for_start(shared: &CleanerShared, id: usize) -> bool {
    let slave = &shared.slaves[id];
    let poll = Duration::from_millis(shared.config.interval_max_ms as u64);
    loop {
        if should_stop(shared) {
            return false;
        }
        if slave.start_requested.load(Ordering::Acquire) {
            return true;
        }
        slave.wait(poll);
    }
}

/// Per-thread cleaning state.
struct SlaveWorker {
    shared: Arc<CleanerShared>,
    id: usize,
    owned: [bool; MAX_VOLUME_COUNT],
    write_buffer: WriteBuffer,
}

impl SlaveWorker {
    fn new(shared: Arc<CleanerShared>, id: usize) -> Self {
        let mut owned = [false; MAX_VOLUME_COUNT];
        for (vol, owns) in owned.iter_mut().enumerate() {
            *owns = shared.cleaner_for_volume(vol as VolumeId) == id;
        }
        let write_buffer = WriteBuffer::new(shared.config.write_buffer_pages as usize);
        Self {
            shared,
            id,
            owned,
            write_buffer,
        }
    }

    fn owns(&self, vol: VolumeId) -> bool {
        self.owned.get(vol as usize).copied().unwrap_or(false)
    }

    /// True if a request aimed at this thread is still open.
    fn has_pending_work(&self) -> bool {
        let requests = &self.shared.requests;
        let lsn = requests.requested_lsn();
        if lsn.is_valid() && self.shared.slaves[self.id].completed_lsn() < lsn {
            return true;
        }
        (0..MAX_VOLUME_COUNT)
            .any(|vol| self.owned[vol] && requests.is_volume_requested(vol as VolumeId))
    }

    /// One cleaning round over every owned volume.
    fn do_work(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let requests = &shared.requests;
        let pool = &shared.pool;

        let requested_lsn = requests.requested_lsn();
        let completed_lsn = shared.slaves[self.id].completed_lsn();
        let mut requested = [false; MAX_VOLUME_COUNT];
        for (vol, flag) in requested.iter_mut().enumerate() {
            *flag = self.owned[vol] && requests.is_volume_requested(vol as VolumeId);
        }

        let frames = pool.num_frames().max(1);
        let dirty = pool.dirty_page_count();
        let hurry = dirty * 4 > frames * 3;
        let moderate = dirty * 3 > frames * 2;
        let durable = shared.log.durable_lsn();

        let mut candidates: BTreeMap<VolumeId, Vec<FrameIndex>> = BTreeMap::new();
        for cb in pool.blocks() {
            let Some(page_id) = self.dirty_owned_page(cb) else {
                continue;
            };
            let due = (requested_lsn.is_valid() && cb.rec_lsn() <= requested_lsn)
                || requested[page_id.vol as usize]
                || hurry
                || (moderate && cb.page_lsn() <= durable);
            if !due {
                continue;
            }
            candidates.entry(page_id.vol).or_default().push(cb.idx());

            if let Some((dep_idx, dep_page_num, dep_lsn)) = cb.dependency() {
                let Some(dep) = pool.blocks().get(dep_idx as usize) else {
                    continue;
                };
                if let Some(dep_id) = self.dirty_owned_page(dep) {
                    if dep_id.page_num == dep_page_num && dep.rec_lsn() <= dep_lsn {
                        candidates.entry(dep_id.vol).or_default().push(dep_idx);
                    }
                }
            }
        }

        for (vol, list) in candidates {
            let demanded = requested[vol as usize] || requested_lsn > completed_lsn;
            self.clean_volume(vol, list, demanded)?;
        }

        for (vol, flag) in requested.iter().enumerate() {
            if *flag {
                requests.clear_volume_request(vol as VolumeId);
            }
        }
        if requested_lsn.is_valid() {
            shared.slaves[self.id]
                .completed_lsn
                .fetch_max(requested_lsn.0, Ordering::AcqRel);
        }
        Ok(())
    }

    /// The page in `cb` if it is bound, dirty, settled, and on an owned volume.
    fn dirty_owned_page(&self, cb: &ControlBlock) -> Option<PageId> {
        if !cb.is_used() || !cb.is_dirty() || cb.is_in_doubt() {
            return None;
        }
        cb.page_id().filter(|page_id| self.owns(page_id.vol))
    }

    /// Writes back the candidates of one volume.
    ///
    /// Pages latched exclusively by someone else are skipped. When the caller
    /// demanded this volume, skipped pages are retried until they are written
    /// or `max_contention_rounds` is exceeded.
    fn clean_volume(&mut self, vol: VolumeId, mut list: Vec<FrameIndex>, demanded: bool) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let pool = &shared.pool;
        let config = &shared.config;

        // Covers every page dirtied before this point.
        shared.log.flush(shared.log.curr_lsn())?;

        let mut rounds = 0u32;
        let mut backoff = Duration::from_millis(config.interval_min_ms as u64);
        let max_backoff = Duration::from_millis(config.interval_max_ms as u64);
        loop {
            let mut entries: Vec<(PageId, FrameIndex)> = list
                .iter()
                .filter_map(|&idx| {
                    let cb = pool.block(idx);
                    let page_id = cb.page_id()?;
                    (page_id.vol == vol && !cb.is_in_doubt()).then_some((page_id, idx))
                })
                .collect();
            entries.sort_unstable();
            entries.dedup();

            let mut skipped = Vec::new();
            for (page_id, idx) in entries {
                // Writes happen with no page latch held.
                if self.write_buffer.is_full() || !self.write_buffer.continues_run(page_id) {
                    self.flush_write_buffer()?;
                }
                let cb = pool.block(idx);
                let guard = match cb.latch().try_shared() {
                    Ok(guard) => guard,
                    Err(_) => {
                        skipped.push(idx);
                        continue;
                    }
                };
                if cb.page_id() != Some(page_id) || !cb.is_dirty() {
                    continue;
                }

                if read_flags(&guard[..]).is_to_be_deleted() {
                    drop(guard);
                    self.deallocate(idx, page_id)?;
                    continue;
                }

                let copy = self.write_buffer.push(idx, page_id, guard.image())?;
                pool.unswizzle_image(copy)?;
                stamp_checksum(&mut copy[..]);
                drop(guard);
            }
            self.flush_write_buffer()?;

            if skipped.is_empty() || !demanded {
                return Ok(());
            }
            rounds += 1;
            if rounds > config.max_contention_rounds {
                return Err(KestrelError::CleanerContention { rounds });
            }
            if should_stop(&shared) {
                return Ok(());
            }
            debug!(vol, skipped = skipped.len(), round = rounds, "cleaner.contention_retry");
            thread::sleep(backoff);
            backoff = (backoff * 2).min(max_backoff);
            list = skipped;
        }
    }

    /// Frees a page that was marked for deletion instead of writing it.
    fn deallocate(&self, idx: FrameIndex, page_id: PageId) -> Result<()> {
        let pool = &self.shared.pool;
        let log = &self.shared.log;

        let lsn = log.append(LogRecord::page_dealloc(page_id))?;
        log.flush(lsn)?;
        pool.volumes().deallocate_page(page_id)?;
        if !pool.discard_frame(idx, page_id) {
            // Still pinned. The slot is already free on disk, so never write
            // the image back.
            warn!(page = %page_id, frame = idx, "cleaner.discard_busy");
            pool.clear_dirty(idx);
        }
        debug!(page = %page_id, lsn = lsn.0, "cleaner.dealloc");
        Ok(())
    }

    /// Writes the buffered run, then marks clean every frame whose resident
    /// image is still the one that was written. Frames latched exclusively at
    /// that point are left dirty.
    fn flush_write_buffer(&mut self) -> Result<()> {
        let Some(start) = self.write_buffer.start() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let pool = &shared.pool;

        // A page may have been dirtied after this round's log flush.
        let max_lsn = self.write_buffer.max_lsn();
        if max_lsn > shared.log.durable_lsn() {
            shared.log.flush(max_lsn)?;
        }

        let count = self.write_buffer.len();
        pool.volumes()
            .write_many_pages(start, self.write_buffer.as_bytes(), count)?;
        debug!(vol = start.vol, start = start.page_num, pages = count, "cleaner.flush_run");

        for entry in self.write_buffer.entries() {
            let cb = pool.block(entry.idx);
            let Ok(guard) = cb.latch().try_shared() else {
                // Latched exclusively again; stays dirty for the next round.
                trace!(page = %entry.page_id, "cleaner.recheck_busy");
                continue;
            };
            if cb.page_id() != Some(entry.page_id) {
                continue;
            }
            if read_lsn(&guard[..]) == entry.lsn {
                pool.clear_dirty(entry.idx);
            } else {
                trace!(page = %entry.page_id, "cleaner.redirtied");
            }
            cb.set_in_doubt(false);
            cb.set_recovery_access(false);
            cb.clear_dependency();
        }

        pool.stats().add_pages_written(count as u64);
        self.write_buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_u8() {
        for status in [
            SlaveStatus::NotStarted,
            SlaveStatus::WaitingForStart,
            SlaveStatus::Running,
            SlaveStatus::Stopped,
        ] {
            assert_eq!(SlaveStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_wake_interrupts_wait_and_requests_start() {
        let slave = Arc::new(SlaveState::new());
        assert!(!slave.wait(Duration::from_millis(1)));

        let waker = Arc::clone(&slave);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        assert!(slave.wait(Duration::from_secs(10)));
        handle.join().unwrap();

        assert!(slave.start_requested.load(Ordering::Acquire));
        // The wake-up is consumed.
        assert!(!slave.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_wake_before_wait_is_not_lost() {
        let slave = SlaveState::new();
        slave.wake();
        assert!(slave.wait(Duration::from_secs(10)));
    }
}
