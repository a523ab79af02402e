//! # Versioned Memtable
//!
//! The ordered in-memory keyspace of the store. Every key maps to a short
//! chain of `(revision, value | tombstone)` versions, newest last. A reader
//! at revision R sees the newest version with `rev <= R`; a tombstone at
//! that position means the key is absent.
//!
//! Version chains exist to serve snapshots: a snapshot pins a revision, and
//! writes committed after it stack new versions on top without disturbing
//! what the snapshot observes. When a key is touched by a commit, versions
//! below the snapshot floor (the lowest pinned revision) are pruned, keeping
//! exactly one version at or below the floor.
//!
//! Range reads are chunked: the caller asks for up to `limit` visible
//! entries after a resume point and gets back the entries plus the position
//! to resume from. This bounds how long the store lock is held per call.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Bound;

use super::txn::KeyRange;

type VersionChain = SmallVec<[(u64, Option<Vec<u8>>); 1]>;

fn visible(chain: &VersionChain, rev: u64) -> Option<&Vec<u8>> {
    chain
        .iter()
        .rev()
        .find(|(r, _)| *r <= rev)
        .and_then(|(_, v)| v.as_ref())
}

/// A chunk of visible entries plus the resume position. `resume == None`
/// means the range is exhausted.
pub(crate) struct MemChunk {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub resume: Option<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct Memtable {
    entries: BTreeMap<Vec<u8>, VersionChain>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key at a revision, bypassing the WAL and pruning. Used only
    /// while loading a checkpoint.
    pub fn load_entry(&mut self, key: Vec<u8>, rev: u64, value: Vec<u8>) {
        let mut chain = VersionChain::new();
        chain.push((rev, Some(value)));
        self.entries.insert(key, chain);
    }

    /// Applies one committed batch at revision `rev`, pruning each touched
    /// chain down to what revisions `>= floor` can still observe.
    pub fn apply<'a>(
        &mut self,
        rev: u64,
        ops: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)>,
        floor: u64,
    ) {
        for (key, value) in ops {
            let chain = self.entries.entry(key.to_vec()).or_default();
            chain.push((rev, value.map(|v| v.to_vec())));

            // Keep the newest version at or below the floor plus everything
            // above it.
            if let Some(keep_from) = chain.iter().rposition(|(r, _)| *r <= floor) {
                if keep_from > 0 {
                    chain.drain(..keep_from);
                }
            }
            if chain.len() == 1 && chain[0].1.is_none() && chain[0].0 <= floor {
                self.entries.remove(key);
            }
        }
    }

    pub fn get(&self, key: &[u8], rev: u64) -> Option<Vec<u8>> {
        self.entries.get(key).and_then(|c| visible(c, rev)).cloned()
    }

    /// Collects up to `limit` entries visible at `rev` within `range`,
    /// strictly after `after` when given.
    pub fn chunk(
        &self,
        range: &KeyRange,
        after: Option<&[u8]>,
        rev: u64,
        limit: usize,
    ) -> MemChunk {
        let lower: Bound<&[u8]> = match after {
            Some(k) if k >= range.start.as_slice() => Bound::Excluded(k),
            _ => Bound::Included(range.start.as_slice()),
        };
        let upper: Bound<&[u8]> = match &range.end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };

        let mut entries = Vec::new();
        let mut truncated = false;
        for (key, chain) in self.entries.range::<[u8], _>((lower, upper)) {
            if let Some(value) = visible(chain, rev) {
                entries.push((key.clone(), value.clone()));
                if entries.len() == limit {
                    truncated = true;
                    break;
                }
            }
        }
        let resume = if truncated {
            entries.last().map(|(k, _)| k.clone())
        } else {
            None
        };
        MemChunk { entries, resume }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(mem: &mut Memtable, rev: u64, ops: &[(&[u8], Option<&[u8]>)], floor: u64) {
        mem.apply(rev, ops.iter().map(|(k, v)| (*k, *v)), floor);
    }

    #[test]
    fn get_sees_newest_version_at_or_below_revision() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"k", Some(b"v1"))], 0);
        apply(&mut mem, 2, &[(b"k", Some(b"v2"))], 0);

        assert_eq!(mem.get(b"k", 1), Some(b"v1".to_vec()));
        assert_eq!(mem.get(b"k", 2), Some(b"v2".to_vec()));
        assert_eq!(mem.get(b"k", 0), None);
    }

    #[test]
    fn tombstone_hides_key_from_later_revisions_only() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"k", Some(b"v"))], 0);
        apply(&mut mem, 2, &[(b"k", None)], 1);

        assert_eq!(mem.get(b"k", 1), Some(b"v".to_vec()));
        assert_eq!(mem.get(b"k", 2), None);
    }

    #[test]
    fn pruning_with_high_floor_collapses_chain() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"k", Some(b"v1"))], 1);
        apply(&mut mem, 2, &[(b"k", Some(b"v2"))], 2);
        // Chain holds only the newest version now.
        assert_eq!(mem.get(b"k", 2), Some(b"v2".to_vec()));
        assert_eq!(mem.get(b"k", 1), None);
    }

    #[test]
    fn deleted_key_with_no_observers_is_removed() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"k", Some(b"v"))], 1);
        apply(&mut mem, 2, &[(b"k", None)], 2);
        assert_eq!(mem.len(), 0);
    }

    #[test]
    fn deleted_key_pinned_by_snapshot_floor_survives() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"k", Some(b"v"))], 1);
        apply(&mut mem, 2, &[(b"k", None)], 1);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.get(b"k", 1), Some(b"v".to_vec()));
    }

    #[test]
    fn chunk_respects_range_resume_and_limit() {
        let mut mem = Memtable::new();
        apply(
            &mut mem,
            1,
            &[
                (b"a/1", Some(b"1")),
                (b"a/2", Some(b"2")),
                (b"a/3", Some(b"3")),
                (b"b/1", Some(b"4")),
            ],
            0,
        );

        let range = KeyRange::prefix(b"a/");
        let first = mem.chunk(&range, None, 1, 2);
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.resume.as_deref(), Some(b"a/2".as_slice()));

        let second = mem.chunk(&range, first.resume.as_deref(), 1, 2);
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].0, b"a/3");
        assert!(second.resume.is_none());
    }

    #[test]
    fn chunk_filters_by_revision() {
        let mut mem = Memtable::new();
        apply(&mut mem, 1, &[(b"a", Some(b"1"))], 0);
        apply(&mut mem, 2, &[(b"b", Some(b"2"))], 0);

        let range = KeyRange::all();
        let at1 = mem.chunk(&range, None, 1, 16);
        assert_eq!(at1.entries.len(), 1);
        let at2 = mem.chunk(&range, None, 2, 16);
        assert_eq!(at2.entries.len(), 2);
    }
}
