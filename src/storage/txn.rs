//! # Transaction Modes
//!
//! Four ways to touch the store, mirroring what the engine needs:
//!
//! | Mode      | Reads                  | Writes                        |
//! |-----------|------------------------|-------------------------------|
//! | `without` | read-committed         | applied immediately           |
//! | `read`    | snapshot-consistent    | forbidden (panics)            |
//! | `dirty`   | snapshot-consistent    | applied immediately           |
//! | `write`   | snapshot + own batch   | buffered, atomic on success   |
//!
//! Every mutating engine operation runs in a **write** transaction: writes
//! accumulate in an ordered batch and reads see the batch overlaid on the
//! snapshot, so a transaction observes its own effects. On success the batch
//! commits as one WAL frame; on error it is simply dropped.
//!
//! [`WriteTxn::check_flush`] lets long-running, restartable operations
//! (prefix deletion, schema migration) bound batch memory: once the batch
//! exceeds the flush threshold it is committed mid-transaction and the
//! snapshot re-opened. Callers that are not restartable at flush boundaries
//! must not call it.
//!
//! ## Iteration Contract
//!
//! Range reads hand out bounded chunks; between chunks no store lock is
//! held, so caller callbacks may do real work. A chunk's `resume` key is
//! where the next call picks up; `None` means the range is exhausted.

use eyre::Result;
use std::collections::BTreeMap;
use std::ops::Bound;

use super::store::{Snapshot, Store};
use crate::config::{BATCH_FLUSH_OPS, ITER_CHUNK};

/// Half-open key range `[start, end)`; `end == None` means unbounded.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self { start: Vec::new(), end: None }
    }

    pub fn span(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end: Some(end) }
    }

    /// All keys beginning with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: prefix.to_vec(),
            end: prefix_successor(prefix),
        }
    }
}

/// The smallest byte string greater than every string with this prefix, or
/// `None` when the prefix is all `0xff`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

/// A bounded slice of a range scan. `resume == None` means exhausted;
/// otherwise the next call continues strictly after `resume`.
pub struct Chunk {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub resume: Option<Vec<u8>>,
}

/// Read access at some consistency level. Implemented by snapshots, the
/// bare store (read-committed) and write transactions (overlay).
pub trait Reader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn next_chunk(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> Result<Chunk>;

    /// Drives `f` over every entry in the range, in key order, stopping
    /// early when `f` returns `Ok(false)`.
    fn for_each(
        &self,
        range: &KeyRange,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let mut after: Option<Vec<u8>> = None;
        loop {
            let chunk = self.next_chunk(range, after.as_deref(), ITER_CHUNK)?;
            for (key, value) in &chunk.entries {
                if !f(key, value)? {
                    return Ok(());
                }
            }
            match chunk.resume {
                None => return Ok(()),
                Some(resume) => after = Some(resume),
            }
        }
    }
}

/// Write access. Implemented by the store (immediate), write transactions
/// (buffered) and the panicking [`NoWriter`] shim.
pub trait Writer {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}

/// A writer for call sites that are statically known not to write (index
/// lookups that must already exist). Writing through it is a programmer
/// error and panics.
pub struct NoWriter;

impl Writer for NoWriter {
    fn put(&mut self, _key: &[u8], _value: &[u8]) -> Result<()> {
        panic!("bug: put through no-writer");
    }

    fn delete(&mut self, _key: &[u8]) -> Result<()> {
        panic!("bug: delete through no-writer");
    }
}

/// Transaction-less access: read-committed reads, immediate writes.
pub struct WithoutTxn<'s> {
    store: &'s Store,
}

impl<'s> WithoutTxn<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        Self { store }
    }
}

impl Reader for WithoutTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get_committed(key)
    }

    fn next_chunk(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> Result<Chunk> {
        self.store.chunk_committed(range, after, limit)
    }
}

impl Writer for WithoutTxn<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.commit_single(key, Some(value))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.store.commit_single(key, None)
    }
}

/// Snapshot reads with immediate writes. Used where a consistent view is
/// needed while writes may land out of band.
pub struct DirtyTxn<'s> {
    store: &'s Store,
    snap: Snapshot,
}

impl<'s> DirtyTxn<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        let snap = store.snapshot();
        Self { store, snap }
    }
}

impl Reader for DirtyTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snap.get(key)
    }

    fn next_chunk(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> Result<Chunk> {
        self.snap.next_chunk(range, after, limit)
    }
}

impl Writer for DirtyTxn<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.commit_single(key, Some(value))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.store.commit_single(key, None)
    }
}

/// Snapshot reads through a buffered batch, committed atomically on
/// success.
pub struct WriteTxn<'s> {
    store: &'s Store,
    snap: Snapshot,
    batch: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'s> WriteTxn<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        let snap = store.snapshot();
        Self { store, snap, batch: BTreeMap::new() }
    }

    /// Commits the batch and re-opens the snapshot once the batch exceeds
    /// the flush threshold. Only call from operations that can restart at
    /// flush boundaries.
    pub fn check_flush(&mut self) -> Result<()> {
        if self.batch.len() < BATCH_FLUSH_OPS {
            return Ok(());
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.store.commit_map(&batch)?;
        self.snap = self.store.snapshot();
        Ok(())
    }

    pub(crate) fn commit(mut self) -> Result<()> {
        self.flush()
    }
}

impl Reader for WriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.batch.get(key) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => self.snap.get(key),
        }
    }

    fn next_chunk(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> Result<Chunk> {
        let snap_chunk = self.snap.next_chunk(range, after, limit)?;

        let lower: Bound<&[u8]> = match after {
            Some(k) if k >= range.start.as_slice() => Bound::Excluded(k),
            _ => Bound::Included(range.start.as_slice()),
        };
        let upper: Bound<&[u8]> = match &range.end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        let mut batch_entries: Vec<(&Vec<u8>, &Option<Vec<u8>>)> = Vec::new();
        let mut batch_truncated = false;
        for entry in self.batch.range::<[u8], _>((lower, upper)) {
            if batch_entries.len() == limit {
                batch_truncated = true;
                break;
            }
            batch_entries.push(entry);
        }

        // Each source covers the range up to its own truncation point; the
        // merge may only emit keys both sources have covered.
        let snap_cov = snap_chunk.resume.as_deref();
        let batch_cov = if batch_truncated {
            batch_entries.last().map(|(k, _)| k.as_slice())
        } else {
            None
        };
        let coverage: Option<Vec<u8>> = match (snap_cov, batch_cov) {
            (None, None) => None,
            (Some(a), None) => Some(a.to_vec()),
            (None, Some(b)) => Some(b.to_vec()),
            (Some(a), Some(b)) => Some(a.min(b).to_vec()),
        };
        let within = |k: &[u8]| coverage.as_deref().map_or(true, |c| k <= c);

        let mut entries = Vec::new();
        let mut hit_limit = false;
        let mut snap_iter = snap_chunk.entries.into_iter().peekable();
        let mut batch_iter = batch_entries.into_iter().peekable();
        loop {
            if entries.len() == limit {
                hit_limit = true;
                break;
            }
            let take_snap = match (snap_iter.peek(), batch_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                // The batch overlays the snapshot on equal keys.
                (Some((sk, _)), Some((bk, _))) => sk.as_slice() < bk.as_slice(),
            };
            if take_snap {
                let (key, value) = snap_iter.next().unwrap();
                if !within(&key) {
                    break;
                }
                entries.push((key, value));
            } else {
                let (key, value) = batch_iter.next().unwrap();
                if snap_iter.peek().map(|(sk, _)| sk == key).unwrap_or(false) {
                    snap_iter.next();
                }
                if !within(key) {
                    break;
                }
                if let Some(value) = value {
                    entries.push((key.clone(), value.clone()));
                }
            }
        }

        let resume = if hit_limit {
            entries.last().map(|(k, _)| k.clone())
        } else {
            coverage
        };
        Ok(Chunk { entries, resume })
    }
}

impl Writer for WriteTxn<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.batch.insert(key.to_vec(), None);
        Ok(())
    }
}
