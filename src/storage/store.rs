//! # Store
//!
//! The embedded ordered key-value store: a versioned memtable fronted by a
//! write-ahead log, compacted into a checkpoint file, guarded by a
//! single-process file lock.
//!
//! ## Commit Path
//!
//! A committed batch is appended to the WAL (synced), then applied to the
//! memtable at the next revision. The WAL mutex doubles as the commit lock,
//! so batches apply in WAL order. Once the WAL outgrows its threshold the
//! commit also writes a checkpoint and truncates the log.
//!
//! ## Snapshots
//!
//! [`Store::snapshot`] pins the current revision; the memtable keeps enough
//! version history for every pinned revision to read consistently.
//! Snapshot creation briefly takes the memtable read lock so it can never
//! observe a half-applied batch.
//!
//! ## Recovery
//!
//! Opening loads the checkpoint and replays WAL frames committed after it.
//! If the checkpoint reports corruption, a salvage pass rebuilds what the
//! WAL alone holds; if that also fails the store files are wiped and the
//! store reinitializes empty, leaving the next sync to repopulate the
//! index. A second process opening the same directory fails with
//! [`StoreError::AlreadyOpen`].

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::checkpoint;
use super::memtable::Memtable;
use super::txn::{Chunk, DirtyTxn, KeyRange, Reader, WithoutTxn, WriteTxn};
use super::wal::Wal;
use crate::config::WAL_CHECKPOINT_BYTES;

pub const CHECKPOINT_FILE_NAME: &str = "findex.cpt";
pub const WAL_FILE_NAME: &str = "findex.wal";
pub const LOCK_FILE_NAME: &str = "LOCK";

/// Errors callers discriminate on; everything else travels as plain
/// `eyre::Report` context.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds the store lock.
    #[error("store already open at {0} (is another instance running?)")]
    AlreadyOpen(String),
    /// A checksum or framing failure in the store files.
    #[error("store corruption: {0}")]
    Corruption(String),
}

pub(crate) fn is_corruption(err: &eyre::Report) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Corruption(_)))
}

pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("dir", &self.inner.dir).finish_non_exhaustive()
    }
}

struct StoreInner {
    dir: PathBuf,
    mem: RwLock<Memtable>,
    rev: AtomicU64,
    wal: Mutex<Wal>,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    committed: AtomicU64,
    _lock_file: File,
}

impl Store {
    /// Opens or creates the store at `dir`, replaying the WAL and running
    /// corruption recovery if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create store directory {:?}", dir))?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .wrap_err_with(|| format!("failed to open lock file {:?}", lock_path))?;
        match lock_file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(StoreError::AlreadyOpen(dir.display().to_string()).into());
            }
            Err(TryLockError::Error(err)) => {
                return Err(err).wrap_err_with(|| format!("failed to lock store at {:?}", dir));
            }
        }

        let cpt_path = dir.join(CHECKPOINT_FILE_NAME);
        let wal_path = dir.join(WAL_FILE_NAME);
        let (mem, rev, wal) = match Self::load_state(&cpt_path, &wal_path) {
            Ok(state) => state,
            Err(err) if is_corruption(&err) => {
                warn!(%err, "store corruption detected, attempting salvage");
                match Self::salvage_state(&cpt_path, &wal_path) {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(%err, "salvage failed, reinitializing empty store");
                        let _ = fs::remove_file(&cpt_path);
                        let _ = fs::remove_file(&wal_path);
                        Self::load_state(&cpt_path, &wal_path)?
                    }
                }
            }
            Err(err) => return Err(err),
        };

        info!(dir = %dir.display(), rev, entries = mem.len(), "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                dir: dir.to_path_buf(),
                mem: RwLock::new(mem),
                rev: AtomicU64::new(rev),
                wal: Mutex::new(wal),
                snapshots: Mutex::new(BTreeMap::new()),
                committed: AtomicU64::new(0),
                _lock_file: lock_file,
            }),
        })
    }

    fn load_state(cpt_path: &Path, wal_path: &Path) -> Result<(Memtable, u64, Wal)> {
        let mut mem = Memtable::new();
        let cp_rev = checkpoint::load(cpt_path, |key, value| mem.load_entry(key, 0, value))?
            .unwrap_or(0);

        let mut max_rev = cp_rev;
        let wal = Wal::open(wal_path, |rev, ops| {
            // Frames at or below the checkpoint revision were already
            // captured by it (crash between checkpoint and truncation).
            if rev <= cp_rev {
                return;
            }
            mem.apply(rev, ops.iter().map(|(k, v)| (k.as_slice(), v.as_deref())), rev);
            max_rev = max_rev.max(rev);
        })?;

        Ok((mem, max_rev, wal))
    }

    /// Recovery pass that ignores the (corrupt) checkpoint and keeps
    /// whatever the WAL alone can reconstruct.
    fn salvage_state(cpt_path: &Path, wal_path: &Path) -> Result<(Memtable, u64, Wal)> {
        let _ = fs::remove_file(cpt_path);
        let mut mem = Memtable::new();
        let mut max_rev = 0;
        let wal = Wal::open(wal_path, |rev, ops| {
            mem.apply(rev, ops.iter().map(|(k, v)| (k.as_slice(), v.as_deref())), rev);
            max_rev = max_rev.max(rev);
        })?;
        Ok((mem, max_rev, wal))
    }

    /// Pins the current revision for consistent reads.
    pub fn snapshot(&self) -> Snapshot {
        // The memtable lock orders this against batch application, so the
        // pinned revision always reflects fully applied batches.
        let _mem = self.inner.mem.read();
        let rev = self.inner.rev.load(Ordering::Acquire);
        *self.inner.snapshots.lock().entry(rev).or_insert(0) += 1;
        Snapshot { inner: Arc::clone(&self.inner), rev }
    }

    /// Runs `f` with transaction-less access: read-committed reads, dirty
    /// writes.
    pub fn without<T>(&self, f: impl FnOnce(&mut WithoutTxn) -> Result<T>) -> Result<T> {
        f(&mut WithoutTxn::new(self))
    }

    /// Runs `f` against a read snapshot. Writes are unavailable by
    /// construction.
    pub fn read<T>(&self, f: impl FnOnce(&Snapshot) -> Result<T>) -> Result<T> {
        f(&self.snapshot())
    }

    /// Runs `f` with snapshot reads and immediate writes.
    pub fn dirty<T>(&self, f: impl FnOnce(&mut DirtyTxn) -> Result<T>) -> Result<T> {
        f(&mut DirtyTxn::new(self))
    }

    /// Runs `f` in a write transaction: snapshot reads through the batch
    /// overlay, all writes committed atomically when `f` succeeds and
    /// discarded when it fails.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTxn) -> Result<T>) -> Result<T> {
        let mut txn = WriteTxn::new(self);
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes a checkpoint now and truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let mut wal = self.inner.wal.lock();
        self.inner.checkpoint_locked(&mut wal)
    }

    /// Operations committed since open.
    pub fn committed(&self) -> u64 {
        self.inner.committed.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub(crate) fn commit_map(&self, ops: &BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.commit_iter(ops.len(), ops.iter().map(|(k, v)| (k.as_slice(), v.as_deref())))
    }

    pub(crate) fn commit_single(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.commit_iter(1, std::iter::once((key, value)))
    }

    fn commit_iter<'a>(
        &self,
        count: usize,
        ops: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)> + Clone,
    ) -> Result<()> {
        let inner = &*self.inner;
        let mut wal = inner.wal.lock();
        let rev = inner.rev.load(Ordering::Relaxed) + 1;
        wal.append(rev, ops.clone())?;
        {
            let mut mem = inner.mem.write();
            let floor = inner
                .snapshots
                .lock()
                .keys()
                .next()
                .copied()
                .unwrap_or(rev)
                .min(rev);
            mem.apply(rev, ops, floor);
            inner.rev.store(rev, Ordering::Release);
        }
        inner.committed.fetch_add(count as u64, Ordering::Relaxed);

        if wal.bytes() > WAL_CHECKPOINT_BYTES {
            inner.checkpoint_locked(&mut wal)?;
        }
        Ok(())
    }

    pub(crate) fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mem = self.inner.mem.read();
        let rev = self.inner.rev.load(Ordering::Acquire);
        Ok(mem.get(key, rev))
    }

    pub(crate) fn chunk_committed(
        &self,
        range: &KeyRange,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Chunk> {
        let mem = self.inner.mem.read();
        let rev = self.inner.rev.load(Ordering::Acquire);
        let chunk = mem.chunk(range, after, rev, limit);
        Ok(Chunk { entries: chunk.entries, resume: chunk.resume })
    }
}

impl StoreInner {
    /// Writes the keyspace at the current revision to the checkpoint file
    /// and truncates the WAL. The caller holds the WAL (= commit) lock, so
    /// the captured revision is stable.
    fn checkpoint_locked(&self, wal: &mut Wal) -> Result<()> {
        let rev = self.rev.load(Ordering::Acquire);
        let path = self.dir.join(CHECKPOINT_FILE_NAME);
        checkpoint::write(&path, rev, CheckpointEntries::new(self, rev))?;
        wal.truncate()?;
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut wal = self.wal.lock();
        if wal.bytes() == 0 {
            return;
        }
        if let Err(err) = self.checkpoint_locked(&mut wal) {
            warn!(%err, "checkpoint on close failed, WAL retained");
        }
    }
}

/// Streams the keyspace chunk by chunk so checkpointing never holds the
/// memtable lock for the whole write.
struct CheckpointEntries<'a> {
    inner: &'a StoreInner,
    rev: u64,
    range: KeyRange,
    after: Option<Vec<u8>>,
    buf: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl<'a> CheckpointEntries<'a> {
    fn new(inner: &'a StoreInner, rev: u64) -> Self {
        Self {
            inner,
            rev,
            range: KeyRange::all(),
            after: None,
            buf: Vec::new().into_iter(),
            done: false,
        }
    }
}

impl Iterator for CheckpointEntries<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buf.next() {
                return Some(entry);
            }
            if self.done {
                return None;
            }
            let chunk = self.inner.mem.read().chunk(
                &self.range,
                self.after.as_deref(),
                self.rev,
                crate::config::ITER_CHUNK,
            );
            match chunk.resume {
                Some(resume) => self.after = Some(resume),
                None => self.done = true,
            }
            if chunk.entries.is_empty() && self.done {
                return None;
            }
            self.buf = chunk.entries.into_iter();
        }
    }
}

/// A pinned, consistent view of the store at one revision.
pub struct Snapshot {
    inner: Arc<StoreInner>,
    rev: u64,
}

impl Snapshot {
    pub fn rev(&self) -> u64 {
        self.rev
    }
}

impl Reader for Snapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.mem.read().get(key, self.rev))
    }

    fn next_chunk(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> Result<Chunk> {
        let chunk = self.inner.mem.read().chunk(range, after, self.rev, limit);
        Ok(Chunk { entries: chunk.entries, resume: chunk.resume })
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut snapshots = self.inner.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&self.rev) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&self.rev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Writer;

    fn collect(r: &impl Reader, range: &KeyRange) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        r.for_each(range, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })
        .unwrap();
        out
    }

    #[test]
    fn write_transaction_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .write(|t| {
                t.put(b"a", b"1")?;
                t.put(b"b", b"2")?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_committed(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get_committed(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn failed_write_transaction_discards_all_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let result: Result<()> = store.write(|t| {
            t.put(b"a", b"1")?;
            eyre::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(store.get_committed(b"a").unwrap(), None);
    }

    #[test]
    fn write_transaction_reads_its_own_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.without(|t| t.put(b"a", b"old")).unwrap();

        store
            .write(|t| {
                assert_eq!(t.get(b"a")?, Some(b"old".to_vec()));
                t.put(b"a", b"new")?;
                assert_eq!(t.get(b"a")?, Some(b"new".to_vec()));
                t.delete(b"a")?;
                assert_eq!(t.get(b"a")?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn overlay_iteration_merges_batch_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .write(|t| {
                t.put(b"k/a", b"1")?;
                t.put(b"k/c", b"3")?;
                Ok(())
            })
            .unwrap();

        store
            .write(|t| {
                t.put(b"k/b", b"2")?;
                t.delete(b"k/c")?;
                let entries = collect(t, &KeyRange::prefix(b"k/"));
                let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
                assert_eq!(keys, vec![b"k/a".to_vec(), b"k/b".to_vec()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn snapshot_does_not_see_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.without(|t| t.put(b"k", b"v1")).unwrap();

        let snap = store.snapshot();
        store.without(|t| t.put(b"k", b"v2")).unwrap();
        store.without(|t| t.put(b"other", b"x")).unwrap();

        assert_eq!(snap.get(b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(snap.get(b"other").unwrap(), None);
        assert_eq!(store.get_committed(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn reopen_replays_wal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.without(|t| t.put(b"persist", b"yes")).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_committed(b"persist").unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn second_open_fails_with_already_open() {
        let dir = tempfile::tempdir().unwrap();
        let _store = Store::open(dir.path()).unwrap();
        let err = Store::open(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn explicit_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.without(|t| t.put(b"a", b"1")).unwrap();
            store.checkpoint().unwrap();
            store.without(|t| t.put(b"b", b"2")).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_committed(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get_committed(b"b").unwrap(), Some(b"2".to_vec()));
    }
}
