//! Iterators that turn a region's sources into its logical view.
//!
//! - [`MergeIterator`] is a heap-based k-way merge over sorted entity
//!   streams. It yields every version of every key in
//!   [`compare`](crate::entity::ordering::compare) order.
//! - [`NewestFirst`] reorders runs of equal keys inside a single key-sorted
//!   source so that the merge sees them newest first.
//! - [`LogicalIterator`] wraps a merged stream and yields only the newest
//!   live version of each key.
//!
//! All of them carry `Result` items: a source that hits a corrupt record yields one
//! error, which is passed through once, after which the merge ends.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::iter::Peekable;
use std::marker::PhantomData;

use super::RegionError;
use crate::entity::Entity;
use crate::entity::ordering::{RegionKey, compare};

/// A boxed source of entities, sorted by key.
pub(crate) type EntitySource<'a> = Box<dyn Iterator<Item = Result<Entity, RegionError>> + 'a>;

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// Merges sorted sources into one stream ordered by key ascending, then
/// timestamp descending.
///
/// Entities equal under that order (same key, same timestamp) come out in
/// source order, so the source listed first wins the tie.
pub(crate) struct MergeIterator<'a> {
    iters: Vec<EntitySource<'a>>,
    heap: BinaryHeap<MergeHeapEntry<'a>>,

    /// Error pulled from a source while refilling the heap; reported on the
    /// next call.
    pending_error: Option<RegionError>,
    done: bool,
}

struct MergeHeapEntry<'a> {
    entity: Entity,
    source_idx: usize,
    _marker: PhantomData<&'a ()>,
}

impl Ord for MergeHeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the smallest key, newest version, lowest
        // source pops first.
        compare(&self.entity, &other.entity)
            .then(self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for MergeHeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHeapEntry<'_> {}

impl<'a> MergeIterator<'a> {
    pub(crate) fn new(iters: Vec<EntitySource<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(iters.len()),
            iters,
            pending_error: None,
            done: false,
        };

        for idx in 0..merge.iters.len() {
            merge.refill(idx);
            if merge.pending_error.is_some() {
                break;
            }
        }

        merge
    }

    /// Pulls the next entity of source `idx` into the heap.
    fn refill(&mut self, idx: usize) {
        match self.iters[idx].next() {
            Some(Ok(entity)) => self.heap.push(MergeHeapEntry {
                entity,
                source_idx: idx,
                _marker: PhantomData,
            }),
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Entity, RegionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(e) = self.pending_error.take() {
            self.done = true;
            return Some(Err(e));
        }

        let top = self.heap.pop()?;
        self.refill(top.source_idx);
        Some(Ok(top.entity))
    }
}

// ------------------------------------------------------------------------------------------------
// NewestFirst
// ------------------------------------------------------------------------------------------------

/// Sorts each run of equal keys of a key-sorted stream by timestamp
/// descending.
///
/// Region files are only ordered by key. Files produced by a flush hold one
/// record per key, but a file placed in the directory by hand may carry
/// several versions of a key in any order. Equal timestamps keep file order.
pub(crate) struct NewestFirst<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    input: Peekable<I>,
    /// Current run, reversed so that `pop` yields the next entity.
    run: Vec<Entity>,
}

impl<I> NewestFirst<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    pub(crate) fn new(input: I) -> Self {
        Self {
            input: input.peekable(),
            run: Vec::new(),
        }
    }
}

impl<I> Iterator for NewestFirst<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    type Item = Result<Entity, RegionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entity) = self.run.pop() {
            return Some(Ok(entity));
        }

        let first = match self.input.next()? {
            Ok(entity) => entity,
            Err(e) => return Some(Err(e)),
        };

        loop {
            match self.input.peek() {
                Some(Ok(next)) if next.key() == first.key() => {}
                _ => break,
            }
            if let Some(Ok(next)) = self.input.next() {
                self.run.push(next);
            }
        }

        if self.run.is_empty() {
            return Some(Ok(first));
        }

        self.run.insert(0, first);
        self.run.sort_by(compare);
        self.run.reverse();
        self.run.pop().map(Ok)
    }
}

// ------------------------------------------------------------------------------------------------
// LogicalIterator
// ------------------------------------------------------------------------------------------------

/// Yields the newest live version of each key.
///
/// For every run of equal keys only the first entity is considered. If it is
/// live it is emitted, if it is a tombstone the key is skipped. The rest of
/// the run is always dropped, so an older live version never leaks through a
/// newer tombstone.
///
/// The input **must** be sorted by key ascending, timestamp descending, which
/// is what [`MergeIterator`] produces.
pub(crate) struct LogicalIterator<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    input: I,
    /// Key of the run currently being skipped.
    current_key: Option<RegionKey>,
}

impl<I> LogicalIterator<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    pub(crate) fn new(input: I) -> Self {
        Self {
            input,
            current_key: None,
        }
    }
}

impl<I> Iterator for LogicalIterator<I>
where
    I: Iterator<Item = Result<Entity, RegionError>>,
{
    type Item = Result<Entity, RegionError>;

    fn next(&mut self) -> Option<Self::Item> {
        for entity in self.input.by_ref() {
            let entity = match entity {
                Ok(entity) => entity,
                Err(e) => return Some(Err(e)),
            };

            if self.current_key.as_ref().map(RegionKey::as_bytes) == Some(entity.key()) {
                continue;
            }
            self.current_key = Some(RegionKey::from(entity.key()));

            if entity.is_deleted() {
                continue;
            }

            return Some(Ok(entity));
        }

        None
    }
}
