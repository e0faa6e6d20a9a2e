//! Region files: the immutable, on-disk half of a region.
//!
//! A region file is a plain sequence of encoded [`Entity`] records (see
//! [`crate::entity`]) sorted by key, with no header, footer or checksum.
//! Files are written exactly once, by [`DiskWriter`], and never modified.
//!
//! # Reading
//!
//! [`DiskStore::open`] memory-maps the file read-only and decodes every
//! record once to
//!
//! - validate it (a corrupt file fails to open),
//! - count records and find the smallest/largest key,
//! - build a bloom filter over the keys for point lookups.
//!
//! The mapping stays alive for the lifetime of the store, so readers of a
//! region keep working after its file has been unlinked by a flush.
//!
//! # Safety
//!
//! `Mmap::map` is `unsafe` because another process could truncate the file
//! underneath us. Region files are never written after creation, and every
//! decode is bounds-checked.

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use memmap2::Mmap;
use tracing::trace;

use super::RegionError;
use crate::entity::ordering::{compare, compare_keys};
use crate::entity::{CodecError, Entity, HEADER_SIZE};

// ------------------------------------------------------------------------------------------------
// DiskStore
// ------------------------------------------------------------------------------------------------

/// Read side of a region file.
pub(crate) struct DiskStore {
    /// `None` for an empty file; zero-length files cannot be mapped.
    mmap: Option<Mmap>,

    record_count: usize,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,

    /// `None` when the file holds no records.
    bloom: Option<Bloom<[u8]>>,
}

impl DiskStore {
    /// Maps and validates the region file at `path`.
    pub(crate) fn open(path: &Path, bloom_fp_rate: f64) -> Result<Self, RegionError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            return Ok(Self {
                mmap: None,
                record_count: 0,
                min_key: None,
                max_key: None,
                bloom: None,
            });
        }

        let mmap = unsafe { Mmap::map(&file)? };

        // First pass: validate and remember where each key lives.
        let mut key_spans: Vec<(usize, usize)> = Vec::new();
        let mut min_key: Option<&[u8]> = None;
        let mut max_key: Option<&[u8]> = None;
        let mut offset = 0;
        while offset < mmap.len() {
            let (entity, consumed) = Entity::decode_at(&mmap, offset)?;
            let span = (offset + HEADER_SIZE, entity.key().len());
            let key = &mmap[span.0..span.0 + span.1];

            if min_key.is_none_or(|min| compare_keys(key, min) == Ordering::Less) {
                min_key = Some(key);
            }
            if max_key.is_none_or(|max| compare_keys(key, max) == Ordering::Greater) {
                max_key = Some(key);
            }

            key_spans.push(span);
            offset += consumed;
        }

        let mut bloom = Bloom::new_for_fp_rate(key_spans.len().max(1), bloom_fp_rate)
            .map_err(|e| RegionError::Internal(e.to_string()))?;
        for &(start, len) in &key_spans {
            bloom.set(&mmap[start..start + len]);
        }

        trace!(
            path = %path.display(),
            records = key_spans.len(),
            "region file mapped"
        );

        let min_key = min_key.map(<[u8]>::to_vec);
        let max_key = max_key.map(<[u8]>::to_vec);

        Ok(Self {
            record_count: key_spans.len(),
            min_key,
            max_key,
            bloom: Some(bloom),
            mmap: Some(mmap),
        })
    }

    pub(crate) fn record_count(&self) -> usize {
        self.record_count
    }

    pub(crate) fn min_key(&self) -> Option<&[u8]> {
        self.min_key.as_deref()
    }

    pub(crate) fn max_key(&self) -> Option<&[u8]> {
        self.max_key.as_deref()
    }

    /// Returns `false` only when `key` is definitely not in the file.
    pub(crate) fn may_contain(&self, key: &[u8]) -> bool {
        let (Some(min), Some(max)) = (self.min_key(), self.max_key()) else {
            return false;
        };
        if compare_keys(key, min) == Ordering::Less || compare_keys(key, max) == Ordering::Greater
        {
            return false;
        }
        self.bloom.as_ref().is_none_or(|bloom| bloom.check(key))
    }

    /// Iterates every record in file order.
    pub(crate) fn iter(&self) -> DiskIter<'_> {
        DiskIter {
            data: self.mmap.as_deref().unwrap_or_default(),
            offset: 0,
            done: false,
        }
    }

    /// Returns every record stored for `key`, newest first.
    ///
    /// Relies on the file being sorted by key: the scan stops at the first
    /// greater key.
    pub(crate) fn versions_of(&self, key: &[u8]) -> Result<Vec<Entity>, CodecError> {
        let mut versions = Vec::new();
        if !self.may_contain(key) {
            return Ok(versions);
        }

        for entity in self.iter() {
            let entity = entity?;
            match compare_keys(entity.key(), key) {
                Ordering::Less => continue,
                Ordering::Equal => versions.push(entity),
                Ordering::Greater => break,
            }
        }
        versions.sort_by(compare);
        Ok(versions)
    }
}

// ------------------------------------------------------------------------------------------------
// DiskIter
// ------------------------------------------------------------------------------------------------

/// Sequential decoder over a mapped region file.
///
/// Yields at most one error: after a corrupt record the remaining offsets
/// cannot be trusted, so the iterator ends.
pub(crate) struct DiskIter<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl Iterator for DiskIter<'_> {
    type Item = Result<Entity, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        match Entity::decode_at(self.data, self.offset) {
            Ok((entity, consumed)) => {
                self.offset += consumed;
                Some(Ok(entity))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DiskWriter
// ------------------------------------------------------------------------------------------------

/// Writes a new region file.
///
/// Records must arrive in strictly ascending key order; anything else is
/// rejected, since the read path depends on it. The file is created with
/// `create_new`, so an existing region file is never overwritten.
pub(crate) struct DiskWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    buf: Vec<u8>,
    last_key: Option<Vec<u8>>,
    record_count: usize,
}

impl DiskWriter {
    pub(crate) fn create(path: &Path) -> Result<Self, RegionError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            buf: Vec::new(),
            last_key: None,
            record_count: 0,
        })
    }

    pub(crate) fn append(&mut self, entity: &Entity) -> Result<(), RegionError> {
        let in_order = self
            .last_key
            .as_deref()
            .is_none_or(|last| compare_keys(entity.key(), last) == Ordering::Greater);
        if !in_order {
            return Err(RegionError::Internal(format!(
                "region file {} written out of key order",
                self.path.display()
            )));
        }

        self.buf.clear();
        entity.encode_to(&mut self.buf)?;
        self.writer.write_all(&self.buf)?;

        self.last_key = Some(entity.key().to_vec());
        self.record_count += 1;
        Ok(())
    }

    /// Flushes and fsyncs the file. Returns the number of records written.
    pub(crate) fn finish(mut self) -> Result<usize, RegionError> {
        self.writer.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| RegionError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.record_count)
    }
}
