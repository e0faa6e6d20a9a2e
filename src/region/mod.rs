//! # Region Module
//!
//! A [`Region`] owns a contiguous slice of the key space and stores it in two
//! places:
//!
//! - a **memstore**: a concurrent sorted map holding the latest write per
//!   key since the region was created,
//! - a **disk store**: one immutable, memory-mapped region file sorted by
//!   key, written exactly once by a flush.
//!
//! Reads see the two merged into a single **logical view**: one entity per
//! key, the most recent version, with tombstoned keys hidden.
//!
//! ## Write semantics
//!
//! [`Region::add`] is last-writer-wins by timestamp. A write is applied only
//! if its timestamp is strictly greater than every version of the key the
//! region already holds, tombstones included. Equal or older writes are
//! silently ignored, so replaying writes in any order converges.
//!
//! ## Retirement
//!
//! A flush or destroy **seals** the region before retiring it. Sealed
//! regions refuse writes with [`RegionError::Sealed`]; readers keep working.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

pub(crate) mod disk;
pub(crate) mod iterator;
pub(crate) mod memstore;

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::entity::ordering::compare_keys;
use crate::entity::{CodecError, Entity, HexKey};
use disk::{DiskStore, DiskWriter};
use iterator::{EntitySource, LogicalIterator, MergeIterator, NewestFirst};
use memstore::Memstore;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Region`] operations.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Reading or writing the region file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The region file holds a record that cannot be decoded, or an entity
    /// cannot be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The region has been retired by a flush or destroy and accepts no
    /// further writes.
    #[error("Region is sealed")]
    Sealed,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Region
// ------------------------------------------------------------------------------------------------

/// Observed key bounds.
#[derive(Debug, Default, Clone)]
struct KeyRange {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
}

/// One partition of the key space: a memstore over an immutable region file.
pub struct Region {
    /// File name of the backing region file.
    id: String,
    path: PathBuf,

    disk: DiskStore,
    memstore: Memstore,

    /// Smallest and largest key seen in either store. Advisory only: the
    /// directory routes by start key, but nothing stops a write outside the
    /// range from landing here.
    range: RwLock<KeyRange>,
}

impl Region {
    /// Opens a region over the existing file at `path`.
    ///
    /// The file is scanned once; a corrupt record fails the open. Its
    /// smallest and largest keys seed the region's key range.
    pub fn open(path: impl AsRef<Path>, bloom_fp_rate: f64) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RegionError::Internal(format!("region path {} has no file name", path.display()))
            })?;

        let disk = DiskStore::open(path, bloom_fp_rate)?;
        let range = KeyRange {
            start: disk.min_key().map(<[u8]>::to_vec),
            end: disk.max_key().map(<[u8]>::to_vec),
        };

        info!(
            region = %id,
            records = disk.record_count(),
            start_key = ?range.start.as_deref().map(HexKey),
            end_key = ?range.end.as_deref().map(HexKey),
            "region opened"
        );

        Ok(Self {
            id,
            path: path.to_path_buf(),
            disk,
            memstore: Memstore::new(),
            range: RwLock::new(range),
        })
    }

    /// Backing file name; unique within a directory.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest key observed, or `None` if the region never held data.
    pub fn start_key(&self) -> Option<Vec<u8>> {
        self.read_range().start
    }

    /// Largest key observed, or `None` if the region never held data.
    pub fn end_key(&self) -> Option<Vec<u8>> {
        self.read_range().end
    }

    fn read_range(&self) -> KeyRange {
        // The range is only ever widened; a writer that panicked mid-update
        // leaves a valid, if narrower, range behind.
        match self.range.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of entries buffered in the memstore.
    pub fn memstore_len(&self) -> Result<usize, RegionError> {
        self.memstore.len()
    }

    pub fn is_memstore_empty(&self) -> Result<bool, RegionError> {
        self.memstore.is_empty()
    }

    /// Number of records in the region file.
    pub fn disk_record_count(&self) -> usize {
        self.disk.record_count()
    }

    /// Whether the region has been retired.
    pub fn is_sealed(&self) -> Result<bool, RegionError> {
        self.memstore.is_sealed()
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the logical view of the region: for every key, its most
    /// recent version, unless that version is a tombstone. Keys come out in
    /// signed-byte ascending order.
    ///
    /// The memstore is snapshotted when this is called; later writes are not
    /// observed. The disk side is read lazily.
    pub fn values(&self) -> Result<Values<'_>, RegionError> {
        let snapshot = self.memstore.snapshot()?;

        let sources: Vec<EntitySource<'_>> = vec![
            Box::new(snapshot.into_iter().map(Ok)),
            Box::new(NewestFirst::new(
                self.disk.iter().map(|r| r.map_err(RegionError::from)),
            )),
        ];

        Ok(Values {
            inner: LogicalIterator::new(MergeIterator::new(sources)),
        })
    }

    /// Returns the visible version of `key`, or `None` if the key is absent
    /// or its newest version is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entity>, RegionError> {
        let buffered = self.memstore.get(key)?;
        let on_disk = self.disk.versions_of(key)?;

        let sources: Vec<EntitySource<'_>> = vec![
            Box::new(buffered.into_iter().map(Ok)),
            Box::new(on_disk.into_iter().map(Ok)),
        ];

        LogicalIterator::new(MergeIterator::new(sources))
            .next()
            .transpose()
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Applies `entity` if it is newer than every version of its key already
    /// held by the region, tombstones included.
    ///
    /// Returns `Ok(true)` if the write was applied, `Ok(false)` if it was
    /// ignored as stale.
    ///
    /// The newest on-disk version is found by scanning the region file up to
    /// the key, so writes to keys already on disk cost a partial file scan.
    /// The bloom filter only short-circuits keys the file does not hold.
    ///
    /// # Errors
    ///
    /// - [`RegionError::Codec`] if the key or value exceeds what a region
    ///   file can hold; nothing is stored.
    /// - [`RegionError::Sealed`] if the region has been retired.
    pub fn add(&self, entity: &Entity) -> Result<bool, RegionError> {
        entity.check_limits()?;

        let floor = self
            .disk
            .versions_of(entity.key())?
            .iter()
            .map(Entity::timestamp)
            .max();

        let applied = self.memstore.insert_if_newer(entity, floor)?;
        if applied {
            self.update_range(entity);
            trace!(
                region = %self.id,
                key = %HexKey(entity.key()),
                timestamp = entity.timestamp(),
                deleted = entity.is_deleted(),
                "region: write applied"
            );
        }
        Ok(applied)
    }

    /// Widens the key range to cover `entity`'s key.
    pub fn update_range(&self, entity: &Entity) {
        let mut guard = match self.range.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = entity.key();

        let below = guard
            .start
            .as_deref()
            .is_none_or(|start| compare_keys(key, start) == Ordering::Less);
        if below {
            guard.start = Some(key.to_vec());
        }

        let above = guard
            .end
            .as_deref()
            .is_none_or(|end| compare_keys(key, end) == Ordering::Greater);
        if above {
            guard.end = Some(key.to_vec());
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle (driven by the directory)
    // --------------------------------------------------------------------------------------------

    pub(crate) fn seal(&self) -> Result<(), RegionError> {
        self.memstore.seal()
    }

    pub(crate) fn unseal(&self) -> Result<(), RegionError> {
        self.memstore.unseal()
    }

    /// Streams the logical view into a new region file at `path`.
    ///
    /// Returns the number of records written. On failure the partially
    /// written file is left for the caller to remove.
    pub(crate) fn write_logical_view(&self, path: &Path) -> Result<usize, RegionError> {
        let mut writer = DiskWriter::create(path)?;
        for entity in self.values()? {
            writer.append(&entity?)?;
        }
        let written = writer.finish()?;

        debug!(
            region = %self.id,
            target = %path.display(),
            records = written,
            "region: logical view written"
        );
        Ok(written)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("disk_records", &self.disk.record_count())
            .finish_non_exhaustive()
    }
}

/// Regions are identified by their backing file.
impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Region {}

// ------------------------------------------------------------------------------------------------
// Values
// ------------------------------------------------------------------------------------------------

/// Lazy iterator over a region's logical view, returned by
/// [`Region::values`].
///
/// Yields at most one error; a corrupt region file ends the sequence.
pub struct Values<'a> {
    inner: LogicalIterator<MergeIterator<'a>>,
}

impl Iterator for Values<'_> {
    type Item = Result<Entity, RegionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
