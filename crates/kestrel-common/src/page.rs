//! Page identity, the generic page header, and page checksums.

use crate::types::{Lsn, StoreId, VolumeId};
use serde::{Deserialize, Serialize};

/// Page size in bytes (8 KB).
pub const PAGE_SIZE: usize = 8 * 1024;

/// One page-sized image, as held in a buffer frame or written to a volume.
pub type PageImage = [u8; PAGE_SIZE];

/// Returns a zero-filled page image on the heap.
pub fn zeroed_page() -> Box<PageImage> {
    Box::new([0u8; PAGE_SIZE])
}

/// Unique identifier for a page: a volume and a page number within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub vol: VolumeId,
    /// Page number within the volume (0 is never a valid data page).
    pub page_num: u32,
}

impl PageId {
    pub fn new(vol: VolumeId, page_num: u32) -> Self {
        Self { vol, page_num }
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.vol as u64) << 32) | (self.page_num as u64)
    }

    /// Creates a PageId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            vol: (value >> 32) as VolumeId,
            page_num: value as u32,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.vol, self.page_num)
    }
}

/// Page types in Kestrel storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated/free page.
    Free = 0,
    /// B-tree node, leaf or interior.
    BTree = 1,
}

impl PageType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PageType::BTree,
            _ => PageType::Free,
        }
    }
}

/// Header at the beginning of every page.
///
/// Layout (32 bytes, little-endian):
/// - page_num: 4 bytes
/// - vol: 2 bytes
/// - store: 2 bytes
/// - lsn: 8 bytes
/// - page_type: 1 byte
/// - flags: 1 byte
/// - reserved: 2 bytes
/// - checksum: 4 bytes (CRC32 of every other byte of the page)
/// - reserved: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    pub page_id: PageId,
    pub store: StoreId,
    /// LSN of the last logged modification.
    pub lsn: Lsn,
    pub page_type: PageType,
    pub flags: PageFlags,
    pub checksum: u32,
}

const LSN_RANGE: std::ops::Range<usize> = 8..16;
const FLAGS_OFFSET: usize = 17;
const CHECKSUM_RANGE: std::ops::Range<usize> = 20..24;

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    pub fn new(page_id: PageId, store: StoreId, page_type: PageType) -> Self {
        Self {
            page_id,
            store,
            lsn: Lsn::INVALID,
            page_type,
            flags: PageFlags::empty(),
            checksum: 0,
        }
    }

    /// Serializes the header into the first 32 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.page_num.to_le_bytes());
        buf[4..6].copy_from_slice(&self.page_id.vol.to_le_bytes());
        buf[6..8].copy_from_slice(&self.store.to_le_bytes());
        buf[LSN_RANGE].copy_from_slice(&self.lsn.0.to_le_bytes());
        buf[16] = self.page_type as u8;
        buf[FLAGS_OFFSET] = self.flags.0;
        buf[18..20].fill(0);
        buf[CHECKSUM_RANGE].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..32].fill(0);
    }

    /// Deserializes the header from the first 32 bytes of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let page_num = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let vol = u16::from_le_bytes([buf[4], buf[5]]);
        let store = u16::from_le_bytes([buf[6], buf[7]]);
        Self {
            page_id: PageId::new(vol, page_num),
            store,
            lsn: read_lsn(buf),
            page_type: PageType::from_u8(buf[16]),
            flags: PageFlags(buf[FLAGS_OFFSET]),
            checksum: read_checksum(buf),
        }
    }
}

/// Reads the page id stored in a page image's header.
pub fn read_page_id(buf: &[u8]) -> PageId {
    PageId::new(
        u16::from_le_bytes([buf[4], buf[5]]),
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
    )
}

/// Reads the page LSN stored in a page image's header.
pub fn read_lsn(buf: &[u8]) -> Lsn {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[LSN_RANGE]);
    Lsn(u64::from_le_bytes(raw))
}

pub fn write_lsn(buf: &mut [u8], lsn: Lsn) {
    buf[LSN_RANGE].copy_from_slice(&lsn.0.to_le_bytes());
}

pub fn read_flags(buf: &[u8]) -> PageFlags {
    PageFlags(buf[FLAGS_OFFSET])
}

pub fn write_flags(buf: &mut [u8], flags: PageFlags) {
    buf[FLAGS_OFFSET] = flags.0;
}

fn read_checksum(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]])
}

/// Computes the CRC32 of a page image, skipping the checksum field itself.
pub fn compute_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CHECKSUM_RANGE.start]);
    hasher.update(&buf[CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

/// Recomputes and stores the checksum. Called on every write-back.
pub fn stamp_checksum(buf: &mut [u8]) {
    let checksum = compute_checksum(buf);
    buf[CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
}

/// Returns `Err((stored, computed))` when the stored checksum is stale.
pub fn verify_checksum(buf: &[u8]) -> std::result::Result<(), (u32, u32)> {
    let stored = read_checksum(buf);
    let computed = compute_checksum(buf);
    if stored == computed {
        Ok(())
    } else {
        Err((stored, computed))
    }
}

/// Persistent page flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags(u8);

impl PageFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Page was logically deleted and must be deallocated, not written back.
    pub const TO_BE_DELETED: u8 = 0b0000_0001;

    pub fn is_to_be_deleted(&self) -> bool {
        self.0 & Self::TO_BE_DELETED != 0
    }

    pub fn set_to_be_deleted(&mut self, deleted: bool) {
        if deleted {
            self.0 |= Self::TO_BE_DELETED;
        } else {
            self.0 &= !Self::TO_BE_DELETED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 8192);
    }

    #[test]
    fn test_page_id_roundtrip() {
        let page_id = PageId::new(42, 1000);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));

        let page_id = PageId::new(u16::MAX, u32::MAX);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
    }

    #[test]
    fn test_page_id_ordering() {
        let mut ids = vec![PageId::new(2, 1), PageId::new(1, 9), PageId::new(1, 3)];
        ids.sort();
        assert_eq!(
            ids,
            vec![PageId::new(1, 3), PageId::new(1, 9), PageId::new(2, 1)]
        );
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(5, 123).to_string(), "5:123");
    }

    #[test]
    fn test_page_header_layout() {
        let mut header = PageHeader::new(PageId::new(3, 999), 7, PageType::BTree);
        header.lsn = Lsn(12345);
        header.flags.set_to_be_deleted(true);

        let mut buf = zeroed_page();
        header.write_to(&mut buf[..]);

        assert_eq!(&buf[0..4], &999u32.to_le_bytes());
        assert_eq!(&buf[4..6], &3u16.to_le_bytes());
        assert_eq!(&buf[6..8], &7u16.to_le_bytes());
        assert_eq!(buf[16], PageType::BTree as u8);

        let decoded = PageHeader::from_bytes(&buf[..]);
        assert_eq!(decoded, header);
        assert_eq!(read_page_id(&buf[..]), PageId::new(3, 999));
        assert_eq!(read_lsn(&buf[..]), Lsn(12345));
        assert!(read_flags(&buf[..]).is_to_be_deleted());
    }

    #[test]
    fn test_lsn_accessors() {
        let mut buf = zeroed_page();
        write_lsn(&mut buf[..], Lsn(77));
        assert_eq!(read_lsn(&buf[..]), Lsn(77));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut buf = zeroed_page();
        PageHeader::new(PageId::new(1, 5), 1, PageType::BTree).write_to(&mut buf[..]);
        buf[4000] = 0xAB;
        stamp_checksum(&mut buf[..]);
        assert!(verify_checksum(&buf[..]).is_ok());

        buf[4001] = 0xCD;
        let (stored, computed) = verify_checksum(&buf[..]).unwrap_err();
        assert_ne!(stored, computed);
    }

    #[test]
    fn test_checksum_ignores_own_field() {
        let mut buf = zeroed_page();
        buf[100] = 1;
        let before = compute_checksum(&buf[..]);
        buf[21] = 0xFF;
        assert_eq!(compute_checksum(&buf[..]), before);
    }

    #[test]
    fn test_page_flags() {
        let mut flags = PageFlags::empty();
        assert!(!flags.is_to_be_deleted());
        flags.set_to_be_deleted(true);
        assert!(flags.is_to_be_deleted());
        flags.set_to_be_deleted(false);
        assert_eq!(flags, PageFlags::default());
    }
}
