//! Sign-prefixed key strings and the poor-man's key.

use std::cmp::Ordering;

const SIGN_NEG_INF: u8 = 0;
const SIGN_REGULAR: u8 = 1;
const SIGN_POS_INF: u8 = 2;

/// A key as stored on B-tree pages.
///
/// The first byte is a sign: `-inf`, regular, or `+inf`. Plain byte-wise
/// comparison then orders the infinities correctly around user keys, so
/// fence keys and user keys share one comparison and one prefix scheme.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyStr(Vec<u8>);

impl KeyStr {
    /// The infimum, lower than every regular key.
    pub fn neg_inf() -> Self {
        Self(vec![SIGN_NEG_INF])
    }

    /// The supremum, higher than every regular key.
    pub fn pos_inf() -> Self {
        Self(vec![SIGN_POS_INF])
    }

    /// Wraps user key bytes as a regular key.
    pub fn from_data(data: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(data.len() + 1);
        raw.push(SIGN_REGULAR);
        raw.extend_from_slice(data);
        Self(raw)
    }

    /// Builds a key from its stored form (sign byte included).
    pub fn from_stored(raw: &[u8]) -> Self {
        Self(raw.to_vec())
    }

    /// Builds a key from a prefix and a truncated suffix.
    pub fn from_parts(prefix: &[u8], suffix: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(prefix.len() + suffix.len());
        raw.extend_from_slice(prefix);
        raw.extend_from_slice(suffix);
        Self(raw)
    }

    /// The empty key, used where a page has no chain fence.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Stored form, sign byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// User bytes after the sign, empty for the infinities.
    pub fn data(&self) -> &[u8] {
        match self.0.first() {
            Some(&SIGN_REGULAR) => &self.0[1..],
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_neg_inf(&self) -> bool {
        is_neg_inf(&self.0)
    }

    pub fn is_pos_inf(&self) -> bool {
        is_pos_inf(&self.0)
    }

    pub fn common_leading_bytes(&self, other: &KeyStr) -> usize {
        common_leading_bytes(&self.0, &other.0)
    }
}

impl AsRef<[u8]> for KeyStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub(crate) fn is_neg_inf(raw: &[u8]) -> bool {
    raw == [SIGN_NEG_INF]
}

pub(crate) fn is_pos_inf(raw: &[u8]) -> bool {
    raw == [SIGN_POS_INF]
}

/// Number of leading bytes `a` and `b` share.
pub fn common_leading_bytes(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Byte-wise comparison; a proper prefix sorts first.
#[inline]
pub fn compare_bin_str(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// First two bytes of a truncated key as a big-endian integer.
///
/// Comparing poor-man's keys orders keys the same way their bytes do,
/// except that equal poor keys need a full comparison to break the tie.
pub fn poor_man_key(trunc_key: &[u8]) -> u16 {
    match trunc_key.len() {
        0 => 0,
        1 => (trunc_key[0] as u16) << 8,
        _ => u16::from_be_bytes([trunc_key[0], trunc_key[1]]),
    }
}
