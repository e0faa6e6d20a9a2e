//! # RegionDB
//!
//! An embeddable, range-partitioned key-value storage engine. Keys are
//! opaque byte strings, every write carries a caller-supplied timestamp, and
//! deletes are tombstones. The key space is split into **regions**, each an
//! in-memory memstore over one immutable region file, merged on read.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use regiondb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_regions", DbConfig::default()).unwrap();
//!
//! // Write (last writer by timestamp wins)
//! db.put(b"hello", b"world", 1).unwrap();
//! db.put(b"hello", b"stale", 0).unwrap(); // ignored: older timestamp
//!
//! // Read
//! let entity = db.get(b"hello").unwrap().unwrap();
//! assert_eq!(entity.value(), b"world");
//!
//! // Delete
//! db.delete(b"hello", 2).unwrap();
//! assert!(db.get(b"hello").unwrap().is_none());
//!
//! // Scan a region's logical view
//! let region = db.get_region(b"a").unwrap();
//! for entity in db.values(&region).unwrap() {
//!     println!("{:?}", entity.key());
//! }
//!
//! // Graceful shutdown (flushes every region)
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Last-writer-wins** versioning by timestamp; replays converge.
//! - **Fixed binary record format**, big-endian, shared by every region file.
//! - **Memory-mapped region files** with bloom filters for point lookups.
//! - **Background flushing** of memstores that grow past a threshold.

pub mod directory;
pub mod entity;
pub mod region;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, info};

pub use directory::{DirectoryError, DirectoryOptions, DirectoryStats, RegionDirectory};
pub use entity::{CodecError, Entity, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use region::{Region, RegionError};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use regiondb::DbConfig;
///
/// let config = DbConfig {
///     flush_threshold: 1024,
///     thread_pool_size: 4,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Memstore entry count at which a region is flushed in the background.
    ///
    /// Default: 4096. `0` disables automatic flushing.
    pub flush_threshold: usize,

    /// Number of background worker threads for flushing.
    ///
    /// Default: 2. Must be ≥ 1.
    pub thread_pool_size: usize,

    /// Target false-positive rate of the bloom filter built for each region
    /// file.
    ///
    /// Default: 0.01. Must be in (0.0, 1.0).
    pub bloom_false_positive_rate: f64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 4096,
            thread_pool_size: 2,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.thread_pool_size < 1 {
            return Err(DbError::InvalidConfig("thread_pool_size must be >= 1".into()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(DbError::InvalidConfig(
                "bloom_false_positive_rate must be in (0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }

    fn to_directory_options(&self) -> DirectoryOptions {
        DirectoryOptions {
            bloom_false_positive_rate: self.bloom_false_positive_rate,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A directory or region error occurred.
    #[error("{0}")]
    Directory(#[from] DirectoryError),
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Holds the thread pool sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`; share it across threads via `Arc<Db>`.
///
/// # Background flushing
///
/// When a write leaves a region's memstore at or above
/// [`DbConfig::flush_threshold`] entries, a background task flushes that
/// region: its logical view is written to a new region file and the region
/// is replaced. At most one flush per region is queued at a time.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor will attempt cleanup, but
/// errors are silently ignored.
pub struct Db {
    directory: Arc<RegionDirectory>,
    flush_threshold: usize,

    /// Ids of regions with a queued background flush.
    pending_flushes: Arc<Mutex<HashSet<String>>>,

    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("base_dir", &self.directory.base_dir())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory.
    ///
    /// Every region file found under `path` is opened; unreadable files are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let directory = Arc::new(RegionDirectory::open(
            &path,
            config.to_directory_options(),
        )?);

        // Spawn background worker thread pool.
        let pool_size = config.thread_pool_size;
        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();

        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("regiondb-bg-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(DirectoryError::from)?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        info!(
            path = %path.as_ref().display(),
            pool_size,
            flush_threshold = config.flush_threshold,
            "database opened"
        );

        Ok(Self {
            directory,
            flush_threshold: config.flush_threshold,
            pending_flushes: Arc::new(Mutex::new(HashSet::new())),
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the database.
    ///
    /// Waits for all queued background flushes to complete, then flushes
    /// every region that still holds buffered writes.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.shutdown_pool();
        self.directory.shutdown()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Writes `value` under `key` at `timestamp`.
    ///
    /// Returns `Ok(true)` if the write was applied, `Ok(false)` if the key
    /// already has a version (live or deleted) with an equal or greater
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` or `value` exceeds what
    /// the record format can hold.
    pub fn put(&self, key: &[u8], value: &[u8], timestamp: i64) -> Result<bool, DbError> {
        self.write(&Entity::live(key.to_vec(), value.to_vec(), timestamp))
    }

    /// Deletes `key` at `timestamp` by writing a tombstone.
    ///
    /// Follows the same timestamp rule as [`put`](Self::put): a tombstone
    /// older than the newest version of the key is ignored.
    pub fn delete(&self, key: &[u8], timestamp: i64) -> Result<bool, DbError> {
        self.write(&Entity::tombstone(key.to_vec(), timestamp))
    }

    /// Writes a prepared entity, live or tombstone.
    pub fn write(&self, entity: &Entity) -> Result<bool, DbError> {
        self.check_open()?;
        check_entity(entity)?;

        let (region, applied) = self.directory.put_routed(entity)?;
        if applied && self.flush_threshold > 0 {
            let buffered = region.memstore_len().map_err(DirectoryError::from)?;
            if buffered >= self.flush_threshold {
                self.schedule_flush(region);
            }
        }
        Ok(applied)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Returns the visible version of `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist or has been deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entity>, DbError> {
        self.check_open()?;
        check_key(key)?;

        Ok(self.directory.get(key)?)
    }

    /// Returns the logical view of `region`, sorted by key.
    pub fn values(&self, region: &Region) -> Result<Vec<Entity>, DbError> {
        self.check_open()?;

        let values = self
            .directory
            .values(region)?
            .collect::<Result<Vec<_>, RegionError>>()
            .map_err(DirectoryError::from)?;
        Ok(values)
    }

    /// Returns a snapshot of directory statistics.
    pub fn stats(&self) -> Result<DirectoryStats, DbError> {
        self.check_open()?;
        Ok(self.directory.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Region management
    // --------------------------------------------------------------------------------------------

    /// Returns the region that owns `key`.
    pub fn get_region(&self, key: &[u8]) -> Result<Arc<Region>, DbError> {
        self.check_open()?;
        check_key(key)?;

        Ok(self.directory.get_region(key)?)
    }

    /// Creates a new, empty region.
    pub fn create_region(&self) -> Result<Arc<Region>, DbError> {
        self.check_open()?;
        Ok(self.directory.create_region()?)
    }

    /// Flushes `region` synchronously and returns its replacement.
    pub fn flush(&self, region: &Arc<Region>) -> Result<Arc<Region>, DbError> {
        self.check_open()?;
        Ok(self.directory.flush_region(region)?)
    }

    /// Flushes every region holding buffered writes. Returns how many were
    /// flushed.
    pub fn flush_all(&self) -> Result<usize, DbError> {
        self.check_open()?;
        Ok(self.directory.shutdown()?)
    }

    /// Destroys `region` and deletes its file.
    pub fn destroy_region(&self, region: &Arc<Region>) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.directory.destroy_region(region)?)
    }

    /// Destroys every region. Returns how many were destroyed.
    pub fn destroy_all_regions(&self) -> Result<usize, DbError> {
        self.check_open()?;
        Ok(self.directory.destroy_all_regions()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn lock_bg(&self) -> MutexGuard<'_, Option<BackgroundPool>> {
        match self.bg.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Dispatches a background flush of `region`, unless one is already
    /// queued.
    fn schedule_flush(&self, region: Arc<Region>) {
        let id = region.id().to_string();
        if !lock_pending(&self.pending_flushes).insert(id.clone()) {
            return;
        }

        let guard = self.lock_bg();
        let Some(bg) = guard.as_ref() else {
            lock_pending(&self.pending_flushes).remove(&id);
            return;
        };

        let directory = Arc::clone(&self.directory);
        let pending = Arc::clone(&self.pending_flushes);
        let sent = bg.sender.send(Box::new(move || {
            match directory.flush_region(&region) {
                Ok(flushed) => {
                    debug!(old = %region.id(), new = %flushed.id(), "background: region flushed")
                }
                Err(DirectoryError::RegionRetired(id)) => {
                    debug!(region = %id, "background: region already retired")
                }
                Err(e) => error!(region = %region.id(), "background flush failed: {e}"),
            }
            lock_pending(&pending).remove(region.id());
        }));
        if sent.is_err() {
            lock_pending(&self.pending_flushes).remove(&id);
        }
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) {
        if let Some(bg) = self.lock_bg().take() {
            // Drop sender → workers drain remaining tasks then exit.
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_pool();
            let _ = self.directory.shutdown();
        }
    }
}

fn lock_pending(pending: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.len() > MAX_KEY_LEN {
        return Err(DbError::InvalidArgument(format!(
            "key length {} exceeds {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn check_entity(record: &Entity) -> Result<(), DbError> {
    check_key(record.key())?;
    if record.value().len() > MAX_VALUE_LEN {
        return Err(DbError::InvalidArgument(format!(
            "value length {} exceeds {}",
            record.value().len(),
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}
