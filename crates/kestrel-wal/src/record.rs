//! WAL log record format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{KestrelError, Lsn, PageId, Result};

/// Types of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Logical change to one page.
    PageUpdate = 10,
    /// Nested system action that returns a page to its volume.
    PageDealloc = 20,
}

impl TryFrom<u8> for LogRecordType {
    type Error = KestrelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            10 => Ok(LogRecordType::PageUpdate),
            20 => Ok(LogRecordType::PageDealloc),
            _ => Err(KestrelError::WalCorrupted {
                lsn: 0,
                reason: format!("invalid record type: {}", value),
            }),
        }
    }
}

/// A single log record.
///
/// Record format on disk:
/// - header (20 bytes):
///   - lsn: 8 bytes (end position of this record in the log)
///   - page_num: 4 bytes
///   - vol: 2 bytes
///   - record_type: 1 byte
///   - flags: 1 byte
///   - payload_len: 4 bytes
/// - payload: variable length
/// - checksum: 4 bytes (CRC32 of header + payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub page_id: PageId,
    pub record_type: LogRecordType,
    pub flags: u8,
    pub payload: Bytes,
}

impl LogRecord {
    pub const HEADER_SIZE: usize = 20;
    pub const CHECKSUM_SIZE: usize = 4;
    /// Maximum payload size: one full page image plus slack.
    pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

    pub fn new(page_id: PageId, record_type: LogRecordType, payload: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            page_id,
            record_type,
            flags: 0,
            payload,
        }
    }

    /// Creates the system-action record for deallocating `page_id`.
    pub fn page_dealloc(page_id: PageId) -> Self {
        Self::new(page_id, LogRecordType::PageDealloc, Bytes::new())
    }

    /// Creates a page-update record with an opaque redo payload.
    pub fn page_update(page_id: PageId, payload: Bytes) -> Self {
        Self::new(page_id, LogRecordType::PageUpdate, payload)
    }

    /// Returns the total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CHECKSUM_SIZE
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());

        buf.put_u64_le(self.lsn.0);
        buf.put_u32_le(self.page_id.page_num);
        buf.put_u16_le(self.page_id.vol);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserializes one record from the front of `data`.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE + Self::CHECKSUM_SIZE {
            return Err(KestrelError::WalCorrupted {
                lsn: 0,
                reason: "record too short".to_string(),
            });
        }

        let mut cursor = data;
        let lsn = Lsn(cursor.get_u64_le());
        let page_num = cursor.get_u32_le();
        let vol = cursor.get_u16_le();
        let record_type = LogRecordType::try_from(cursor.get_u8())?;
        let flags = cursor.get_u8();
        let payload_len = cursor.get_u32_le() as usize;

        if payload_len > Self::MAX_PAYLOAD_SIZE {
            return Err(KestrelError::WalCorrupted {
                lsn: lsn.0,
                reason: format!("payload too large: {}", payload_len),
            });
        }
        if cursor.len() < payload_len + Self::CHECKSUM_SIZE {
            return Err(KestrelError::WalCorrupted {
                lsn: lsn.0,
                reason: "truncated record".to_string(),
            });
        }

        let payload = Bytes::copy_from_slice(&cursor[..payload_len]);
        cursor.advance(payload_len);
        let stored = cursor.get_u32_le();
        let computed = crc32fast::hash(&data[..Self::HEADER_SIZE + payload_len]);
        if stored != computed {
            return Err(KestrelError::WalCorrupted {
                lsn: lsn.0,
                reason: format!("checksum mismatch: stored={}, computed={}", stored, computed),
            });
        }

        Ok(Self {
            lsn,
            page_id: PageId::new(vol, page_num),
            record_type,
            flags,
            payload,
        })
    }
}
