//! The k-way merge engine used by compaction.
//!
//! Grounded on `original_source/LSM-KV_Update/SSTable.cpp`'s `merge`/`merge2`
//! (balanced pairwise reduction, newer side wins on duplicate keys) and on
//! the teacher's `SSTableCompaction::compact_sstables`, redesigned per the
//! spec's note (§9) to stream entries one at a time via [`crate::sstable::SstEntryIter`]
//! instead of materializing whole runs into a `BTreeMap`.

use std::iter::Peekable;

use crate::error::Result;
use crate::table::Entry;

/// A boxed, lazily-evaluated stream of entries in ascending key order. The
/// lifetime lets callers merge iterators that borrow from owned data they
/// hold locally (e.g. an [`crate::sstable::SstCache`]'s `iter_entries`)
/// without forcing everything to be `'static`.
pub type BoxedEntries<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;

type Run<'a> = Peekable<BoxedEntries<'a>>;

/// Merges two streams already in ascending key order. On a key collision `a`
/// wins and `b`'s entry is discarded — callers must present the newer run as
/// `a`.
fn merge_pair<'a>(mut a: Run<'a>, mut b: Run<'a>) -> BoxedEntries<'a> {
    Box::new(std::iter::from_fn(move || loop {
        return match (a.peek(), b.peek()) {
            (Some(Err(_)), _) => a.next(),
            (_, Some(Err(_))) => b.next(),
            (Some(Ok(x)), Some(Ok(y))) => {
                if x.key < y.key {
                    a.next()
                } else if x.key > y.key {
                    b.next()
                } else {
                    // equal keys: a is the newer side, wins and both advance
                    let _ = b.next();
                    a.next()
                }
            }
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => None,
        };
    }))
}

/// Merges `runs`, ordered newest-first (index 0 is the newest), using the
/// same balanced reduction as the source: pair `i` with `i+1`, carry an odd
/// run through unpaired, and recurse until one stream remains.
///
/// Since the input is pre-sorted newest-first, the run at index 0 always
/// survives as the "a" side through every round, so the result is stable
/// with respect to recency without threading timestamps through the merge
/// itself — callers stamp the output with the maximum timestamp among the
/// inputs they selected.
pub fn k_way_merge<'a>(runs: Vec<BoxedEntries<'a>>) -> BoxedEntries<'a> {
    let mut level: Vec<Run<'a>> = runs.into_iter().map(|r| r.peekable()).collect();

    if level.is_empty() {
        return Box::new(std::iter::empty());
    }

    loop {
        if level.len() == 1 {
            let only = level.into_iter().next().unwrap();
            return Box::new(only);
        }

        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(merge_pair(a, b).peekable()),
                None => next.push(a),
            }
        }
        level = next;
    }
}
