//! # FileSet
//!
//! The per-folder public surface of the index: ingest of announcements,
//! the have/global/need iteration streams, point lookups, availability,
//! counter snapshots and delta-index IDs.
//!
//! Names cross this boundary in native form and are stored in wire form
//! (NFC, forward slashes); every iterator converts back on the way out.
//!
//! ## Locking
//!
//! Each FileSet owns an update mutex. Every mutator takes it for the full
//! extent of its write transaction, so updates to one folder are
//! linearizable; folders are independent. Read methods run against store
//! snapshots and may run concurrently with anything.
//!
//! Iteration callbacks run with a snapshot pinned but no store lock held;
//! a callback that blocks indefinitely pins that snapshot's memory, so
//! return `false` promptly when aborting early.

use eyre::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::blockmap::BlockMap;
use super::instance::{get_file_as, Instance};
use super::meta::{Counts, MetadataTracker};
use super::names;
use super::namespaced::NamespacedKv;
use crate::config::recheck_interval;
use crate::model::fileinfo::FileLike;
use crate::model::{local_flags, DeviceId, FileInfo, FileInfoTruncated, IndexId};

pub struct FileSet {
    folder: String,
    db: Arc<Instance>,
    blockmap: BlockMap,
    meta: MetadataTracker,
    update_mutex: Mutex<()>,
}

impl FileSet {
    /// Opens per-folder state, loading the metadata snapshot or recounting
    /// it when the snapshot is missing or stale.
    pub fn new(folder: &str, db: Arc<Instance>) -> Result<FileSet> {
        let (folder_idx, meta_key) = db.store().without(|t| {
            let idx = db.folder_idx_id(t, folder.as_bytes())?;
            let meta_key = db.folder_meta_key(t, folder.as_bytes())?;
            Ok((idx, meta_key))
        })?;

        let meta = MetadataTracker::new();
        let loaded = db.store().without(|t| meta.load(t, &meta_key))?;
        let set = FileSet {
            folder: folder.to_string(),
            db,
            blockmap: BlockMap::new(folder_idx),
            meta,
            update_mutex: Mutex::new(()),
        };

        if !loaded {
            info!(folder, "no stored folder metadata, recalculating");
            set.recalc_counts(&meta_key)?;
        } else if set.meta.is_stale(recheck_interval()) {
            info!(folder, age_secs = set.meta.age_secs(), "stored folder metadata is stale, recalculating");
            set.recalc_counts(&meta_key)?;
        }

        Ok(set)
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    fn recalc_counts(&self, meta_key: &[u8]) -> Result<()> {
        self.meta.clear();
        self.db.store().write(|t| {
            self.db.check_globals(t, self.folder.as_bytes(), &self.meta)?;
            self.db
                .with_all_folder_truncated(&*t, self.folder.as_bytes(), |device, f| {
                    self.meta.add_file(&device, &f);
                    true
                })?;
            self.meta.set_created();
            self.meta.save(t, meta_key)
        })
    }

    /// Ingests a batch of announcements from `device`. Unchanged entries
    /// are skipped; local announcements get fresh sequence numbers, block
    /// map and sequence lane maintenance.
    pub fn update(&self, device: &DeviceId, files: Vec<FileInfo>) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, count = files.len(), "update");

        let mut files = files;
        for f in &mut files {
            if let std::borrow::Cow::Owned(wire) = names::normalized(&f.name) {
                f.name = wire;
            }
        }
        files.retain(|f| {
            if names::is_valid(&f.name) {
                true
            } else {
                warn!(folder = %self.folder, name = %f.name, "dropping illegal file name");
                false
            }
        });
        // A batch may announce the same name more than once; the last
        // announcement wins, and only it may get a sequence number.
        let mut seen = hashbrown::HashSet::new();
        files.reverse();
        files.retain(|f| seen.insert(f.name.clone()));
        files.reverse();

        let _guard = self.update_mutex.lock();
        let folder = self.folder.as_bytes();
        self.db.store().write(|t| {
            if *device == DeviceId::LOCAL {
                let mut discards = Vec::new();
                let mut kept = Vec::new();
                let mut dk = Vec::new();
                for mut f in files.drain(..) {
                    self.db
                        .device_key_into(t, &mut dk, folder, &DeviceId::LOCAL, f.name.as_bytes())?;
                    let existing = get_file_as::<FileInfo>(&*t, &dk)?;
                    if let Some(ef) = &existing {
                        if ef.version.equal(&f.version) && ef.is_invalid() == f.is_invalid() {
                            continue;
                        }
                    }
                    f.sequence = self.meta.next_seq(&DeviceId::LOCAL);
                    if let Some(ef) = existing {
                        discards.push(ef);
                    }
                    kept.push(f);
                }
                self.blockmap.discard(t, &discards)?;
                self.blockmap.update(t, &kept)?;
                self.db.remove_sequences(t, folder, &discards)?;
                self.db.add_sequences(t, folder, &kept)?;
                self.db.update_files(t, folder, device, &kept, &self.meta)?;
            } else {
                self.db.update_files(t, folder, device, &files, &self.meta)?;
            }
            let meta_key = self.db.folder_meta_key(t, folder)?;
            self.meta.save(t, &meta_key)
        })
    }

    /// Removes all records of `device` in this folder, with counter and
    /// version-list upkeep. For the local device the block map and
    /// sequence lane go too.
    pub fn drop_device(&self, device: &DeviceId) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, "drop");

        let _guard = self.update_mutex.lock();
        let folder = self.folder.as_bytes();
        self.db.store().write(|t| {
            self.db.drop_device_folder(t, device, folder, &self.meta)?;

            if *device == DeviceId::LOCAL {
                self.blockmap.drop_all(t)?;
                // The local sequence survives so delta indexes sent to
                // remotes stay resumable.
                self.meta.reset_counts(device);
            } else {
                // Anything the remote announces from here on must read as
                // newer than what we have.
                self.meta.reset_all(device);
            }

            let meta_key = self.db.folder_meta_key(t, folder)?;
            self.meta.save(t, &meta_key)
        })
    }

    // --- iteration ---

    /// Every record `device` has, in name order.
    pub fn with_have(&self, device: &DeviceId, f: impl FnMut(FileInfo) -> bool) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, "with_have");
        self.db
            .store()
            .read(|t| self.db.with_have(t, self.folder.as_bytes(), device, None, f))
    }

    /// [`with_have`](Self::with_have) without block lists.
    pub fn with_have_truncated(
        &self,
        device: &DeviceId,
        f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, "with_have_truncated");
        self.db
            .store()
            .read(|t| self.db.with_have(t, self.folder.as_bytes(), device, None, f))
    }

    /// Local records in sequence order from `start_seq`, for resuming
    /// delta-index transmission.
    pub fn with_have_sequence(
        &self,
        start_seq: u64,
        f: impl FnMut(FileInfo) -> bool,
    ) -> Result<()> {
        debug!(folder = %self.folder, start_seq, "with_have_sequence");
        self.db
            .store()
            .read(|t| self.db.with_have_sequence(t, self.folder.as_bytes(), start_seq, f))
    }

    /// Truncated records of `device` under `prefix`: the prefix itself and
    /// its children (`"dir"` matches `"dir"` and `"dir/x"`, not
    /// `"dir.x"`).
    pub fn with_prefixed_have_truncated(
        &self,
        device: &DeviceId,
        prefix: &str,
        f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, prefix, "with_prefixed_have_truncated");
        let wire = names::normalized(prefix);
        self.db.store().read(|t| {
            self.db
                .with_have(t, self.folder.as_bytes(), device, Some(wire.as_bytes()), f)
        })
    }

    /// The global (newest) record of every file in the folder.
    pub fn with_global(&self, f: impl FnMut(FileInfo) -> bool) -> Result<()> {
        debug!(folder = %self.folder, "with_global");
        self.db
            .store()
            .read(|t| self.db.with_global(t, self.folder.as_bytes(), None, f))
    }

    /// [`with_global`](Self::with_global) without block lists.
    pub fn with_global_truncated(&self, f: impl FnMut(FileInfoTruncated) -> bool) -> Result<()> {
        debug!(folder = %self.folder, "with_global_truncated");
        self.db
            .store()
            .read(|t| self.db.with_global(t, self.folder.as_bytes(), None, f))
    }

    /// Truncated globals under `prefix`, same matching as
    /// [`with_prefixed_have_truncated`](Self::with_prefixed_have_truncated).
    pub fn with_prefixed_global_truncated(
        &self,
        prefix: &str,
        f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> Result<()> {
        debug!(folder = %self.folder, prefix, "with_prefixed_global_truncated");
        let wire = names::normalized(prefix);
        self.db.store().read(|t| {
            self.db
                .with_global(t, self.folder.as_bytes(), Some(wire.as_bytes()), f)
        })
    }

    /// What `device` must fetch to reach the global state.
    pub fn with_need(&self, device: &DeviceId, f: impl FnMut(FileInfo) -> bool) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, "with_need");
        self.db
            .store()
            .read(|t| self.db.with_need(t, self.folder.as_bytes(), device, f))
    }

    /// [`with_need`](Self::with_need) without block lists.
    pub fn with_need_truncated(
        &self,
        device: &DeviceId,
        f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> Result<()> {
        debug!(folder = %self.folder, device = ?device, "with_need_truncated");
        self.db
            .store()
            .read(|t| self.db.with_need(t, self.folder.as_bytes(), device, f))
    }

    // --- point lookups ---

    /// One device's record for `name`. `None` is the normal "not found".
    pub fn get(&self, device: &DeviceId, name: &str) -> Result<Option<FileInfo>> {
        let wire = names::normalized(name);
        let mut rec = self.db.store().without(|t| {
            self.db
                .get_file(t, self.folder.as_bytes(), device, wire.as_bytes())
        })?;
        if let Some(rec) = &mut rec {
            rec.name = names::native(&rec.name).into_owned();
        }
        Ok(rec)
    }

    /// The global record for `name`.
    pub fn get_global(&self, name: &str) -> Result<Option<FileInfo>> {
        let wire = names::normalized(name);
        let mut rec = self.db.store().without(|t| {
            self.db
                .get_global_as::<FileInfo>(t, self.folder.as_bytes(), wire.as_bytes())
        })?;
        if let Some(rec) = &mut rec {
            rec.name = names::native(&rec.name).into_owned();
        }
        Ok(rec)
    }

    /// The global record for `name`, without blocks.
    pub fn get_global_truncated(&self, name: &str) -> Result<Option<FileInfoTruncated>> {
        let wire = names::normalized(name);
        let mut rec = self.db.store().without(|t| {
            self.db
                .get_global_as::<FileInfoTruncated>(t, self.folder.as_bytes(), wire.as_bytes())
        })?;
        if let Some(rec) = &mut rec {
            rec.name = names::native(&rec.name).into_owned();
        }
        Ok(rec)
    }

    /// The devices holding the global version of `name`, invalid copies
    /// excluded.
    pub fn availability(&self, name: &str) -> Result<Vec<DeviceId>> {
        let wire = names::normalized(name);
        self.db.store().without(|t| {
            self.db
                .availability(t, self.folder.as_bytes(), wire.as_bytes())
        })
    }

    // --- counters ---

    /// The latest known sequence number for `device`.
    pub fn sequence(&self, device: &DeviceId) -> u64 {
        self.meta.sequence(device)
    }

    /// What this device has, receive-only changes included.
    pub fn local_size(&self) -> Counts {
        let plain = self.meta.counts(&DeviceId::LOCAL, 0);
        let receive_only = self.meta.counts(&DeviceId::LOCAL, local_flags::RECEIVE_ONLY);
        plain.add(receive_only)
    }

    /// Locally changed records in a receive-only folder.
    pub fn receive_only_changed_size(&self) -> Counts {
        self.meta.counts(&DeviceId::LOCAL, local_flags::RECEIVE_ONLY)
    }

    /// The cluster-wide merged view.
    pub fn global_size(&self) -> Counts {
        let plain = self.meta.counts(&DeviceId::GLOBAL, 0);
        let receive_only = self.meta.counts(&DeviceId::GLOBAL, local_flags::RECEIVE_ONLY);
        plain.add(receive_only)
    }

    /// Devices present in this folder's metadata.
    pub fn list_devices(&self) -> Vec<DeviceId> {
        self.meta.devices()
    }

    // --- delta-index IDs ---

    /// The delta-index ID for `device`. The local ID is allocated on first
    /// use; a remote without one reads as zero.
    pub fn index_id(&self, device: &DeviceId) -> Result<IndexId> {
        let _guard = self.update_mutex.lock();
        self.db.store().write(|t| {
            let id = self.db.get_index_id(t, device, self.folder.as_bytes())?;
            if id != IndexId::default() || *device != DeviceId::LOCAL {
                return Ok(id);
            }
            let id = IndexId::generate();
            let device_idx = self.db.device_idx_id(t, device)?;
            let folder_idx = self.db.folder_idx_id(t, self.folder.as_bytes())?;
            self.db.put_index_id(t, device_idx, folder_idx, id)?;
            Ok(id)
        })
    }

    /// Records the delta-index ID a remote announced.
    pub fn set_index_id(&self, device: &DeviceId, id: IndexId) -> Result<()> {
        assert!(
            *device != DeviceId::LOCAL,
            "bug: explicitly setting the local index ID"
        );
        self.db.store().without(|t| {
            let device_idx = self.db.device_idx_id(t, device)?;
            let folder_idx = self.db.folder_idx_id(t, self.folder.as_bytes())?;
            self.db.put_index_id(t, device_idx, folder_idx, id)
        })
    }

    /// The namespaced view carrying this folder's virtual modification
    /// times, consumed by the filesystem wrapper.
    pub fn mtimes(&self) -> Result<NamespacedKv> {
        self.db
            .store()
            .without(|t| self.db.mtimes_kv(t, self.folder.as_bytes()))
    }
}

/// Clears out all information related to `folder` from the database.
pub fn drop_folder(db: &Instance, folder: &str) -> Result<()> {
    debug!(folder, "drop folder");
    db.store().write(|t| db.drop_folder_lanes(t, folder.as_bytes()))
}
