//! Volume files and the page I/O contract the buffer pool writes through.

use kestrel_common::page::{PageId, PageImage, PAGE_SIZE};
use kestrel_common::{KestrelError, Result, StorageConfig, VolumeId, MAX_VOLUME_COUNT};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Page I/O the buffer pool and cleaner need from the volume layer.
pub trait VolumeStore: Send + Sync {
    /// Reads one page image into `buf`.
    fn read_page(&self, page_id: PageId, buf: &mut PageImage) -> Result<()>;

    /// Writes `count` page images held back to back in `buffer`, starting at
    /// `start` and covering `start.page_num .. start.page_num + count`.
    fn write_many_pages(&self, start: PageId, buffer: &[u8], count: usize) -> Result<()>;

    /// Returns a fresh or recycled page number in `vol`.
    fn allocate_page(&self, vol: VolumeId) -> Result<PageId>;

    /// Returns the page's on-disk slot to the volume for reuse.
    fn deallocate_page(&self, page_id: PageId) -> Result<()>;
}

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for volume files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

impl From<&StorageConfig> for DiskManagerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages one data file per volume.
///
/// Page 0 of every volume is reserved, so allocation starts at page 1 and a
/// zero page number never names real data.
pub struct DiskManager {
    config: DiskManagerConfig,
    volumes: Mutex<HashMap<VolumeId, VolumeHandle>>,
}

struct VolumeHandle {
    file: File,
    /// Number of page slots in the file, including the reserved page 0.
    num_pages: u32,
    /// Deallocated page numbers available for reuse.
    free_pages: BTreeSet<u32>,
}

impl DiskManager {
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            volumes: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn volume_path(&self, vol: VolumeId) -> PathBuf {
        self.config.data_dir.join(format!("{:08}.vol", vol))
    }

    /// Runs `f` against the volume's handle, opening the file on first use.
    fn with_volume<T>(
        &self,
        vol: VolumeId,
        f: impl FnOnce(&mut VolumeHandle) -> Result<T>,
    ) -> Result<T> {
        if vol == 0 || vol as usize >= MAX_VOLUME_COUNT {
            return Err(KestrelError::InvalidVolume {
                vol,
                max: MAX_VOLUME_COUNT as u16 - 1,
            });
        }

        let mut volumes = self.volumes.lock();
        if !volumes.contains_key(&vol) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.volume_path(vol))?;
            let num_pages = ((file.metadata()?.len() / PAGE_SIZE as u64) as u32).max(1);
            volumes.insert(
                vol,
                VolumeHandle {
                    file,
                    num_pages,
                    free_pages: BTreeSet::new(),
                },
            );
        }
        let handle = volumes
            .get_mut(&vol)
            .ok_or(KestrelError::VolumeNotMounted { vol })?;
        f(handle)
    }

    /// Returns the number of page slots in a volume, including page 0.
    pub fn num_pages(&self, vol: VolumeId) -> Result<u32> {
        self.with_volume(vol, |handle| Ok(handle.num_pages))
    }

    /// Returns true if the page was deallocated and not yet reused.
    pub fn is_deallocated(&self, page_id: PageId) -> Result<bool> {
        self.with_volume(page_id.vol, |handle| {
            Ok(handle.free_pages.contains(&page_id.page_num))
        })
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let volumes = self.volumes.lock();
        for handle in volumes.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open volume files.
    pub fn close_all(&self) -> Result<()> {
        let mut volumes = self.volumes.lock();
        for (_, handle) in volumes.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }
}

impl VolumeStore for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut PageImage) -> Result<()> {
        self.with_volume(page_id.vol, |handle| {
            if page_id.page_num == 0 || page_id.page_num >= handle.num_pages {
                return Err(KestrelError::PageNotFound {
                    page_id: page_id.as_u64(),
                });
            }
            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.read_exact(&mut buf[..])?;
            Ok(())
        })
    }

    fn write_many_pages(&self, start: PageId, buffer: &[u8], count: usize) -> Result<()> {
        if buffer.len() < count * PAGE_SIZE {
            return Err(KestrelError::Internal(format!(
                "write of {} pages from a {} byte buffer",
                count,
                buffer.len()
            )));
        }
        if start.page_num == 0 {
            return Err(KestrelError::PageNotFound {
                page_id: start.as_u64(),
            });
        }

        let fsync = self.config.fsync_enabled;
        self.with_volume(start.vol, |handle| {
            let offset = (start.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(&buffer[..count * PAGE_SIZE])?;
            if fsync {
                handle.file.sync_data()?;
            }

            let end = start.page_num + count as u32;
            if end > handle.num_pages {
                handle.num_pages = end;
            }
            debug!(vol = start.vol, start = start.page_num, count, "volume.write_many_pages");
            Ok(())
        })
    }

    fn allocate_page(&self, vol: VolumeId) -> Result<PageId> {
        let fsync = self.config.fsync_enabled;
        self.with_volume(vol, |handle| {
            if let Some(page_num) = handle.free_pages.pop_first() {
                return Ok(PageId::new(vol, page_num));
            }

            let page_num = handle.num_pages;
            let offset = (page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(&[0u8; PAGE_SIZE])?;
            if fsync {
                handle.file.sync_data()?;
            }
            handle.num_pages = page_num + 1;
            Ok(PageId::new(vol, page_num))
        })
    }

    fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        self.with_volume(page_id.vol, |handle| {
            if page_id.page_num == 0 || page_id.page_num >= handle.num_pages {
                return Err(KestrelError::PageNotFound {
                    page_id: page_id.as_u64(),
                });
            }
            handle.free_pages.insert(page_id.page_num);
            debug!(page = %page_id, "volume.deallocate_page");
            Ok(())
        })
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
