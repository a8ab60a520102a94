//! Per-frame reader/writer latch.
//!
//! The latch owns the frame's page image, so holding a guard is the only way
//! to read or write the bytes. Every exclusive acquisition bumps an epoch
//! counter, which lets a shared holder upgrade conditionally: the upgrade
//! succeeds only if no other writer got in between.
//!
//! Exclusive acquisition and upgrades both pass through a gate mutex. While an
//! upgrade holds the gate no writer can be holding or waiting for the image
//! lock, so the upgrader may release its read lock, try the write lock, and
//! take the read lock back without blocking and without a writer slipping in.

use kestrel_common::page::{zeroed_page, PageImage};
use kestrel_common::{KestrelError, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

/// Latch modes a page can be fixed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

pub struct Latch {
    image: RwLock<Box<PageImage>>,
    ex_epoch: AtomicU64,
    /// Held while acquiring the image lock exclusively.
    gate: Mutex<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            image: RwLock::new(zeroed_page()),
            ex_epoch: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    /// Acquires the latch, blocking until it is available.
    pub fn acquire(&self, mode: LatchMode) -> LatchGuard<'_> {
        match mode {
            LatchMode::Shared => self.shared(),
            LatchMode::Exclusive => self.exclusive(),
        }
    }

    /// Acquires the latch or fails with `LatchWouldBlock`.
    pub fn try_acquire(&self, mode: LatchMode) -> Result<LatchGuard<'_>> {
        match mode {
            LatchMode::Shared => self.try_shared(),
            LatchMode::Exclusive => self.try_exclusive(),
        }
    }

    pub fn shared(&self) -> LatchGuard<'_> {
        let guard = self.image.read();
        LatchGuard::Shared {
            epoch: self.ex_epoch.load(Ordering::Acquire),
            guard,
        }
    }

    pub fn exclusive(&self) -> LatchGuard<'_> {
        let _gate = self.gate.lock();
        let guard = self.image.write();
        self.ex_epoch.fetch_add(1, Ordering::AcqRel);
        LatchGuard::Exclusive(guard)
    }

    pub fn try_shared(&self) -> Result<LatchGuard<'_>> {
        let guard = self.image.try_read().ok_or(KestrelError::LatchWouldBlock)?;
        Ok(LatchGuard::Shared {
            epoch: self.ex_epoch.load(Ordering::Acquire),
            guard,
        })
    }

    pub fn try_exclusive(&self) -> Result<LatchGuard<'_>> {
        let _gate = self.gate.try_lock().ok_or(KestrelError::LatchWouldBlock)?;
        let guard = self.image.try_write().ok_or(KestrelError::LatchWouldBlock)?;
        self.ex_epoch.fetch_add(1, Ordering::AcqRel);
        Ok(LatchGuard::Exclusive(guard))
    }

    /// Attempts to turn a shared guard into an exclusive one without
    /// blocking.
    ///
    /// On failure the caller gets its shared guard back with the same epoch
    /// and the error is `LatchWouldBlock`; no writer ran in between. A shared
    /// guard whose epoch is stale (another writer held the latch after it was
    /// taken) never upgrades, since the caller's view of the page may be out
    /// of date.
    pub fn upgrade_conditional<'a>(
        &'a self,
        guard: LatchGuard<'a>,
    ) -> std::result::Result<LatchGuard<'a>, (LatchGuard<'a>, KestrelError)> {
        let epoch = match guard {
            LatchGuard::Exclusive(_) => return Ok(guard),
            LatchGuard::Shared { epoch, .. } => epoch,
        };
        if self.ex_epoch.load(Ordering::Acquire) != epoch {
            return Err((guard, KestrelError::LatchWouldBlock));
        }
        let Some(_gate) = self.gate.try_lock() else {
            // A writer is acquiring or waiting.
            return Err((guard, KestrelError::LatchWouldBlock));
        };
        drop(guard);

        match self.image.try_write() {
            Some(write) => {
                self.ex_epoch.fetch_add(1, Ordering::AcqRel);
                Ok(LatchGuard::Exclusive(write))
            }
            None => {
                // Other readers only. With the gate held no writer is queued,
                // so this read does not wait.
                let read = self.image.read();
                Err((LatchGuard::Shared { epoch, guard: read }, KestrelError::LatchWouldBlock))
            }
        }
    }

    /// True if some thread holds the latch exclusively right now.
    pub fn is_locked_exclusive(&self) -> bool {
        self.image.is_locked_exclusive()
    }

    pub fn is_locked(&self) -> bool {
        self.image.is_locked()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("locked", &self.is_locked())
            .field("exclusive", &self.is_locked_exclusive())
            .field("ex_epoch", &self.ex_epoch.load(Ordering::Relaxed))
            .finish()
    }
}

/// A held latch. Dropping the guard releases it.
#[derive(Debug)]
pub enum LatchGuard<'a> {
    Shared {
        /// Exclusive epoch observed when the shared latch was taken.
        epoch: u64,
        guard: RwLockReadGuard<'a, Box<PageImage>>,
    },
    Exclusive(RwLockWriteGuard<'a, Box<PageImage>>),
}

impl<'a> LatchGuard<'a> {
    pub fn mode(&self) -> LatchMode {
        match self {
            LatchGuard::Shared { .. } => LatchMode::Shared,
            LatchGuard::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    pub fn image(&self) -> &PageImage {
        match self {
            LatchGuard::Shared { guard, .. } => &***guard,
            LatchGuard::Exclusive(guard) => &***guard,
        }
    }

    /// Mutable access, available only under an exclusive latch.
    pub fn image_mut(&mut self) -> Option<&mut PageImage> {
        match self {
            LatchGuard::Shared { .. } => None,
            LatchGuard::Exclusive(guard) => Some(&mut ***guard),
        }
    }

    /// Converts an exclusive guard into a shared one without releasing.
    pub fn downgrade(self, latch: &Latch) -> LatchGuard<'a> {
        match self {
            LatchGuard::Exclusive(guard) => LatchGuard::Shared {
                guard: RwLockWriteGuard::downgrade(guard),
                epoch: latch.ex_epoch.load(Ordering::Acquire),
            },
            shared => shared,
        }
    }
}

impl Deref for LatchGuard<'_> {
    type Target = PageImage;

    fn deref(&self) -> &PageImage {
        self.image()
    }
}
