//! Ordering policy for entities.
//!
//! Keys are compared **signed-byte lexicographically**: each byte is read as
//! an `i8`, so `0x80..=0xFF` sort *before* `0x00..=0x7F`. This is not the
//! `Ord` of `[u8]`, which is why every sorted structure in the crate is keyed
//! by [`RegionKey`] instead of a raw `Vec<u8>`.
//!
//! Two entity orders are defined:
//!
//! - [`compare`]: key ascending, then timestamp **descending**. Within a
//!   run of equal keys the most recent version comes first, which is what
//!   the logical view relies on to pick a winner without looking at
//!   timestamps itself.
//! - [`compare_key_only`]: key ascending with no tie-break; the order of a
//!   region file, whose writer has already resolved duplicates.

use std::cmp::Ordering;

use super::Entity;

/// Compares two keys as sequences of signed bytes.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match (*x as i8).cmp(&(*y as i8)) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

/// Key ascending, then timestamp descending.
pub fn compare(a: &Entity, b: &Entity) -> Ordering {
    match compare_keys(a.key(), b.key()) {
        Ordering::Equal => b.timestamp().cmp(&a.timestamp()),
        ord => ord,
    }
}

/// Key ascending only.
pub fn compare_key_only(a: &Entity, b: &Entity) -> Ordering {
    compare_keys(a.key(), b.key())
}

// ------------------------------------------------------------------------------------------------
// RegionKey
// ------------------------------------------------------------------------------------------------

/// An owned key ordered by [`compare_keys`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey(Vec<u8>);

impl RegionKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Ord for RegionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

impl PartialOrd for RegionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&[u8]> for RegionKey {
    fn from(key: &[u8]) -> Self {
        Self(key.to_vec())
    }
}

impl From<Vec<u8>> for RegionKey {
    fn from(key: Vec<u8>) -> Self {
        Self(key)
    }
}
