//! Scalar identifiers shared by every Kestrel component.

use serde::{Deserialize, Serialize};

/// Volume identifier. Volumes are numbered from 1.
pub type VolumeId = u16;

/// Store (index) identifier within a volume.
pub type StoreId = u16;

/// Upper bound on mounted volumes; volume ids index fixed-size arrays.
pub const MAX_VOLUME_COUNT: usize = 32;

/// Log Sequence Number: a monotonically increasing position in the WAL.
///
/// `Lsn(0)` is the invalid LSN. A page whose LSN is at or below the log's
/// durable LSN may be written back without flushing the log first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Largest representable LSN, used as a "flush everything" target.
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the LSN advanced by `bytes` of log content.
    pub fn advance(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0 >> 32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_validity() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::FIRST.is_valid());
        assert_eq!(Lsn::default(), Lsn::INVALID);
    }

    #[test]
    fn test_lsn_ordering_and_advance() {
        let lsn = Lsn(100);
        assert!(lsn < lsn.advance(1));
        assert_eq!(lsn.advance(28), Lsn(128));
        assert!(Lsn::MAX > lsn);
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn((3u64 << 32) | 17).to_string(), "3/17");
    }
}
