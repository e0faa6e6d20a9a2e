//! # Region Directory
//!
//! The [`RegionDirectory`] is the authoritative map from key ranges to
//! [`Region`]s living under one base directory. Every regular file directly
//! under the base directory is a region file.
//!
//! ## Routing
//!
//! A key belongs to the region with the greatest start key that is less than
//! or equal to it (a *floor* lookup). With a single region there is nothing
//! to look up: it owns the whole key space. With no regions at all, the
//! first lookup creates one.
//!
//! Region bounds are advisory, so routing can go wrong: a key below every
//! start key, or two regions claiming the same start key. Both are *routing
//! anomalies*. They are logged, counted, and resolved to a best-effort
//! region rather than failing the call.
//!
//! ## Concurrency Model
//!
//! - The member set is copy-on-write: readers clone an `Arc` of the current
//!   vector under a short read lock. Every membership change publishes a new
//!   vector and bumps a generation counter.
//! - The range index is derived from the member set and tagged with the
//!   generation it was built from. It is rebuilt lazily by whichever lookup
//!   first finds it stale; racing rebuilders never install an older index
//!   over a newer one.
//! - A single structural mutex serializes region creation, flush and
//!   destruction. Reads and routed writes never take it, except when a write
//!   hits a region that was just retired and has to wait for the retiring
//!   operation to finish.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::entity::ordering::RegionKey;
use crate::entity::{Entity, HexKey};
use crate::region::{Region, RegionError, Values};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`RegionDirectory`] operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Error originating from a region.
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    /// Directory-level I/O failure (listing, creating or removing files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The region is no longer a member of the directory; it was flushed or
    /// destroyed by someone else.
    #[error("Region {0} has been retired")]
    RegionRetired(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options & stats
// ------------------------------------------------------------------------------------------------

/// Settings applied to every region the directory opens.
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    /// Target false-positive rate of each region file's bloom filter.
    pub bloom_false_positive_rate: f64,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            bloom_false_positive_rate: 0.01,
        }
    }
}

/// Snapshot of directory statistics returned by [`RegionDirectory::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Number of live regions.
    pub region_count: usize,
    /// Entries buffered across all memstores.
    pub memstore_entries: usize,
    /// Records stored across all region files.
    pub disk_records: usize,
    /// Routing anomalies observed since open.
    pub routing_anomalies: u64,
    /// Current membership generation.
    pub generation: u64,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

struct RegionSet {
    /// Bumped on every membership change.
    generation: u64,
    members: Arc<Vec<Arc<Region>>>,
}

/// Start key → region, built from one generation of the member set.
struct RangeIndex {
    generation: u64,
    map: BTreeMap<RegionKey, Arc<Region>>,
}

// ------------------------------------------------------------------------------------------------
// RegionDirectory
// ------------------------------------------------------------------------------------------------

/// Owns the regions of one base directory and routes keys to them.
///
/// Thread-safe; share it via `Arc`.
pub struct RegionDirectory {
    base_dir: PathBuf,
    options: DirectoryOptions,

    regions: RwLock<RegionSet>,
    range_index: RwLock<Option<Arc<RangeIndex>>>,

    /// Serializes create / flush / destroy.
    structure: Mutex<()>,

    routing_anomalies: AtomicU64,
}

impl RegionDirectory {
    // --------------------------------------------------------------------------------------------
    // Startup
    // --------------------------------------------------------------------------------------------

    /// Opens the directory at `base`, creating it if missing.
    ///
    /// Every regular file directly under `base` is opened as a region.
    /// Files that fail to open are logged and skipped; they stay on disk
    /// untouched.
    pub fn open(base: impl AsRef<Path>, options: DirectoryOptions) -> Result<Self, DirectoryError> {
        let base_dir = base.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let mut members = Vec::new();
        let mut skipped = 0usize;
        for entry in fs::read_dir(&base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let path = entry.path();
            match Region::open(&path, options.bloom_false_positive_rate) {
                Ok(region) => members.push(Arc::new(region)),
                Err(e) => {
                    error!(path = %path.display(), "skipping unreadable region file: {e}");
                    skipped += 1;
                }
            }
        }
        members.sort_by(|a, b| a.id().cmp(b.id()));

        info!(
            base_dir = %base_dir.display(),
            regions = members.len(),
            skipped,
            "region directory opened"
        );

        Ok(Self {
            base_dir,
            options,
            regions: RwLock::new(RegionSet {
                generation: 0,
                members: Arc::new(members),
            }),
            range_index: RwLock::new(None),
            structure: Mutex::new(()),
            routing_anomalies: AtomicU64::new(0),
        })
    }

    /// Flushes every live region. Returns how many were rewritten.
    pub fn shutdown(&self) -> Result<usize, DirectoryError> {
        let (_, members) = self.snapshot()?;

        let mut flushed = 0usize;
        for region in members.iter() {
            if region.is_memstore_empty()? {
                continue;
            }
            match self.flush_region(region) {
                Ok(_) => flushed += 1,
                Err(DirectoryError::RegionRetired(id)) => {
                    debug!(region = %id, "shutdown: region already retired");
                }
                Err(e) => return Err(e),
            }
        }

        info!(flushed, "region directory shut down");
        Ok(flushed)
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Returns the current generation and member set.
    fn snapshot(&self) -> Result<(u64, Arc<Vec<Arc<Region>>>), DirectoryError> {
        let guard = self.regions.read().map_err(|_| {
            error!("Read-write lock poisoned in region directory");
            DirectoryError::Internal("RwLock poisoned".into())
        })?;
        Ok((guard.generation, Arc::clone(&guard.members)))
    }

    fn lock_structure(&self) -> Result<MutexGuard<'_, ()>, DirectoryError> {
        self.structure.lock().map_err(|_| {
            error!("Structural mutex poisoned in region directory");
            DirectoryError::Internal("Mutex poisoned".into())
        })
    }

    /// Publishes a new member set built by `change` and drops the range
    /// index. Callers must hold the structural lock.
    fn publish(&self, change: impl FnOnce(&mut Vec<Arc<Region>>)) -> Result<u64, DirectoryError> {
        let generation = {
            let mut guard = self.regions.write().map_err(|_| {
                error!("Read-write lock poisoned in region directory");
                DirectoryError::Internal("RwLock poisoned".into())
            })?;

            let mut members = guard.members.as_ref().clone();
            change(&mut members);

            guard.generation += 1;
            guard.members = Arc::new(members);
            guard.generation
        };

        match self.range_index.write() {
            Ok(mut index) => *index = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }

        debug!(generation, "region set published");
        Ok(generation)
    }

    fn is_member(&self, region: &Arc<Region>) -> Result<bool, DirectoryError> {
        let (_, members) = self.snapshot()?;
        Ok(members.iter().any(|member| Arc::ptr_eq(member, region)))
    }

    // --------------------------------------------------------------------------------------------
    // Routing
    // --------------------------------------------------------------------------------------------

    /// Returns the region that owns `key`, creating the first region if the
    /// directory is empty.
    pub fn get_region(&self, key: &[u8]) -> Result<Arc<Region>, DirectoryError> {
        let (generation, members) = self.snapshot()?;

        match members.len() {
            0 => return self.get_or_create_first_region(key),
            1 => return Ok(Arc::clone(&members[0])),
            _ => {}
        }

        let index = self.range_index_for(generation, &members)?;
        if let Some((_, region)) = index.map.range(..=RegionKey::from(key)).next_back() {
            trace!(key = %HexKey(key), region = %region.id(), "routed");
            return Ok(Arc::clone(region));
        }

        self.record_anomaly(key, "key sorts below every region start key");
        let fallback = index.map.values().next().unwrap_or(&members[0]);
        Ok(Arc::clone(fallback))
    }

    fn get_or_create_first_region(&self, key: &[u8]) -> Result<Arc<Region>, DirectoryError> {
        let guard = self.lock_structure()?;

        let (_, members) = self.snapshot()?;
        if members.is_empty() {
            return self.create_region_locked();
        }

        // Someone else populated the directory while we waited.
        drop(guard);
        self.get_region(key)
    }

    /// Returns a range index for `generation`, rebuilding it if the cached
    /// one is stale.
    fn range_index_for(
        &self,
        generation: u64,
        members: &[Arc<Region>],
    ) -> Result<Arc<RangeIndex>, DirectoryError> {
        {
            let cached = self.range_index.read().map_err(|_| {
                error!("Read-write lock poisoned in range index");
                DirectoryError::Internal("RwLock poisoned".into())
            })?;
            // An empty index is rebuilt: regions gain start keys on their
            // first write without a membership change.
            let fresh = cached
                .as_ref()
                .filter(|index| index.generation == generation && !index.map.is_empty());
            if let Some(index) = fresh {
                return Ok(Arc::clone(index));
            }
        }

        // Id order decides which of two regions sharing a start key is kept.
        let mut by_id: Vec<&Arc<Region>> = members.iter().collect();
        by_id.sort_by(|a, b| a.id().cmp(b.id()));

        let mut map: BTreeMap<RegionKey, Arc<Region>> = BTreeMap::new();
        for region in by_id {
            let Some(start) = region.start_key() else {
                continue;
            };
            let start = RegionKey::new(start);
            if let Some(existing) = map.get(&start) {
                warn!(
                    start_key = %HexKey(start.as_bytes()),
                    kept = %existing.id(),
                    ignored = %region.id(),
                    "routing anomaly: regions share a start key"
                );
                self.routing_anomalies.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            map.insert(start, Arc::clone(region));
        }

        debug!(generation, indexed = map.len(), members = members.len(), "range index rebuilt");
        let index = Arc::new(RangeIndex { generation, map });

        let mut slot = self.range_index.write().map_err(|_| {
            error!("Read-write lock poisoned in range index");
            DirectoryError::Internal("RwLock poisoned".into())
        })?;
        let newer_installed = slot
            .as_ref()
            .is_some_and(|installed| installed.generation > generation);
        if !newer_installed {
            *slot = Some(Arc::clone(&index));
        }

        Ok(index)
    }

    fn record_anomaly(&self, key: &[u8], reason: &str) {
        let total = self.routing_anomalies.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(key = %HexKey(key), total, "routing anomaly: {reason}");
    }

    // --------------------------------------------------------------------------------------------
    // Region lifecycle
    // --------------------------------------------------------------------------------------------

    /// Creates and registers a new empty region.
    pub fn create_region(&self) -> Result<Arc<Region>, DirectoryError> {
        let _guard = self.lock_structure()?;
        self.create_region_locked()
    }

    fn create_region_locked(&self) -> Result<Arc<Region>, DirectoryError> {
        let path = self.new_region_path();
        OpenOptions::new().write(true).create_new(true).open(&path)?;

        let region = match Region::open(&path, self.options.bloom_false_positive_rate) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
        };

        self.publish(|members| members.push(Arc::clone(&region)))?;
        info!(region = %region.id(), "region created");
        Ok(region)
    }

    fn new_region_path(&self) -> PathBuf {
        self.base_dir.join(Uuid::new_v4().to_string())
    }

    /// Rewrites `region` as a new region whose file holds its logical view,
    /// then retires `region` and deletes its file.
    ///
    /// Returns `region` itself when its memstore is empty: there is nothing
    /// to flush.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::RegionRetired`] if `region` was already flushed or
    /// destroyed. If writing the new file fails, the partial file is
    /// removed and `region` stays live and writable.
    pub fn flush_region(&self, region: &Arc<Region>) -> Result<Arc<Region>, DirectoryError> {
        if region.is_memstore_empty()? {
            return Ok(Arc::clone(region));
        }

        let _guard = self.lock_structure()?;
        if !self.is_member(region)? {
            return Err(DirectoryError::RegionRetired(region.id().to_string()));
        }

        region.seal()?;

        let path = self.new_region_path();
        let opened = region.write_logical_view(&path).and_then(|written| {
            Region::open(&path, self.options.bloom_false_positive_rate)
                .map(|flushed| (written, flushed))
        });
        let (written, flushed) = match opened {
            Ok((written, flushed)) => (written, Arc::new(flushed)),
            Err(e) => {
                error!(region = %region.id(), "flush failed: {e}");
                if let Err(rm) = remove_region_file(&path) {
                    error!(path = %path.display(), "failed to remove partial region file: {rm}");
                }
                region.unseal()?;
                return Err(e.into());
            }
        };

        self.publish(|members| {
            members.retain(|member| !Arc::ptr_eq(member, region));
            members.push(Arc::clone(&flushed));
        })?;
        remove_region_file(region.path())?;

        info!(
            old = %region.id(),
            new = %flushed.id(),
            records = written,
            "region flushed"
        );
        Ok(flushed)
    }

    /// Retires `region` and deletes its file.
    pub fn destroy_region(&self, region: &Arc<Region>) -> Result<(), DirectoryError> {
        let _guard = self.lock_structure()?;
        if !self.is_member(region)? {
            return Err(DirectoryError::RegionRetired(region.id().to_string()));
        }

        region.seal()?;
        self.publish(|members| members.retain(|member| !Arc::ptr_eq(member, region)))?;
        remove_region_file(region.path())?;

        info!(region = %region.id(), "region destroyed");
        Ok(())
    }

    /// Retires every region and deletes all region files. Returns how many
    /// regions were destroyed.
    pub fn destroy_all_regions(&self) -> Result<usize, DirectoryError> {
        let _guard = self.lock_structure()?;
        let (_, members) = self.snapshot()?;

        for region in members.iter() {
            region.seal()?;
        }
        self.publish(Vec::clear)?;
        for region in members.iter() {
            remove_region_file(region.path())?;
        }

        info!(destroyed = members.len(), "all regions destroyed");
        Ok(members.len())
    }

    // --------------------------------------------------------------------------------------------
    // Data path
    // --------------------------------------------------------------------------------------------

    /// Routes `entity` to its region and applies it there.
    ///
    /// Returns `Ok(true)` if the write was applied, `Ok(false)` if a newer
    /// version of the key already existed.
    pub fn put(&self, entity: &Entity) -> Result<bool, DirectoryError> {
        self.put_routed(entity).map(|(_, applied)| applied)
    }

    /// Like [`put`](Self::put), also returning the region that took the
    /// write.
    pub(crate) fn put_routed(&self, entity: &Entity) -> Result<(Arc<Region>, bool), DirectoryError> {
        loop {
            let region = self.get_region(entity.key())?;
            match region.add(entity) {
                Ok(applied) => return Ok((region, applied)),
                Err(RegionError::Sealed) => {
                    trace!(
                        region = %region.id(),
                        key = %HexKey(entity.key()),
                        "put hit a retired region, re-routing"
                    );
                    // The retiring flush or destroy holds the structural
                    // lock until the member set no longer contains it.
                    drop(self.lock_structure()?);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the visible version of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entity>, DirectoryError> {
        let region = self.get_region(key)?;
        Ok(region.get(key)?)
    }

    /// Returns the logical view of `region`.
    pub fn values<'a>(&self, region: &'a Region) -> Result<Values<'a>, DirectoryError> {
        Ok(region.values()?)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Live regions, ordered by id.
    pub fn regions(&self) -> Result<Vec<Arc<Region>>, DirectoryError> {
        let (_, members) = self.snapshot()?;
        let mut regions = members.as_ref().clone();
        regions.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(regions)
    }

    pub fn region_count(&self) -> Result<usize, DirectoryError> {
        Ok(self.snapshot()?.1.len())
    }

    /// Number of routing anomalies observed since open.
    pub fn routing_anomalies(&self) -> u64 {
        self.routing_anomalies.load(Ordering::Relaxed)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn stats(&self) -> Result<DirectoryStats, DirectoryError> {
        let (generation, members) = self.snapshot()?;

        let mut memstore_entries = 0;
        let mut disk_records = 0;
        for region in members.iter() {
            memstore_entries += region.memstore_len()?;
            disk_records += region.disk_record_count();
        }

        Ok(DirectoryStats {
            region_count: members.len(),
            memstore_entries,
            disk_records,
            routing_anomalies: self.routing_anomalies(),
            generation,
        })
    }
}

impl std::fmt::Debug for RegionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionDirectory")
            .field("base_dir", &self.base_dir)
            .field("routing_anomalies", &self.routing_anomalies())
            .finish_non_exhaustive()
    }
}

/// Removes a retired region's file. A file that is already gone is fine.
fn remove_region_file(path: &Path) -> Result<(), DirectoryError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
