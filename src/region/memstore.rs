//! In-memory write buffer of a region.
//!
//! Holds at most one entity per key: the most recent write seen since the
//! region was created. The map is ordered by [`RegionKey`], so snapshots come
//! out in signed-byte key order and can be fed straight into the merge.
//!
//! All methods take `&self`; the map lives behind an internal `RwLock`, so
//! callers never lock anything themselves.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{error, trace};

use super::RegionError;
use crate::entity::ordering::RegionKey;
use crate::entity::{Entity, HexKey};

pub(crate) struct Memstore {
    inner: RwLock<MemstoreInner>,
}

struct MemstoreInner {
    /// Latest write per key.
    tree: BTreeMap<RegionKey, Entity>,

    /// Set once the owning region is being retired; writes are refused.
    sealed: bool,
}

impl Memstore {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(MemstoreInner {
                tree: BTreeMap::new(),
                sealed: false,
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemstoreInner>, RegionError> {
        self.inner.read().map_err(|_| {
            error!("Read-write lock poisoned in memstore");
            RegionError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemstoreInner>, RegionError> {
        self.inner.write().map_err(|_| {
            error!("Read-write lock poisoned in memstore");
            RegionError::Internal("RwLock poisoned".into())
        })
    }

    /// Returns the buffered version of `key`, tombstones included.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Entity>, RegionError> {
        let guard = self.read()?;
        Ok(guard.tree.get(&RegionKey::from(key)).cloned())
    }

    /// Copies out every buffered entity in key order.
    pub(crate) fn snapshot(&self) -> Result<Vec<Entity>, RegionError> {
        let guard = self.read()?;
        Ok(guard.tree.values().cloned().collect())
    }

    /// Inserts `entity` unless an equal-or-newer version already exists.
    ///
    /// `floor` is the timestamp of the newest version of the key held
    /// outside the memstore (on disk), if any. The comparison and the insert
    /// happen under one write lock, so two racing writers of the same key
    /// cannot both win.
    ///
    /// Returns `Ok(true)` if the entity was stored.
    pub(crate) fn insert_if_newer(
        &self,
        entity: &Entity,
        floor: Option<i64>,
    ) -> Result<bool, RegionError> {
        let mut guard = self.write()?;

        if guard.sealed {
            return Err(RegionError::Sealed);
        }

        let key = RegionKey::from(entity.key());
        let buffered = guard.tree.get(&key).map(Entity::timestamp);
        let newest = buffered.into_iter().chain(floor).max();

        if let Some(newest) = newest.filter(|&newest| entity.timestamp() <= newest) {
            trace!(
                key = %HexKey(entity.key()),
                timestamp = entity.timestamp(),
                newest,
                "memstore: stale write ignored"
            );
            return Ok(false);
        }

        guard.tree.insert(key, entity.clone());
        Ok(true)
    }

    pub(crate) fn len(&self) -> Result<usize, RegionError> {
        Ok(self.read()?.tree.len())
    }

    pub(crate) fn is_empty(&self) -> Result<bool, RegionError> {
        Ok(self.read()?.tree.is_empty())
    }

    pub(crate) fn seal(&self) -> Result<(), RegionError> {
        self.write()?.sealed = true;
        Ok(())
    }

    pub(crate) fn unseal(&self) -> Result<(), RegionError> {
        self.write()?.sealed = false;
        Ok(())
    }

    pub(crate) fn is_sealed(&self) -> Result<bool, RegionError> {
        Ok(self.read()?.sealed)
    }
}
