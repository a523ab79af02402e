//! # Instance
//!
//! The process-wide owner of the store and the two small indexes, and the
//! home of every algorithm that touches raw keys: record reads and writes,
//! the global version-list update, need-marker maintenance, the sequence
//! lane, iteration internals and folder removal.
//!
//! Components above this layer (FileSet, BlockMap, schema migrations) hold
//! no transaction state: every operation here takes the transaction as an
//! explicit parameter, reads through it and writes through it, and the
//! caller decides the transaction's extent.
//!
//! ## The Update Algorithm
//!
//! For each incoming record, [`Instance::update_files`]:
//!
//! 1. skips it when the stored version and validity are unchanged,
//! 2. adjusts the per-device counters,
//! 3. writes the device-file record,
//! 4. merges the announcement into the file's version list, and
//! 5. lets [`Instance::update_global`] fix the need marker and the
//!    cluster-global counters when the list head changed.
//!
//! All of it happens inside one write transaction under the folder's update
//! mutex, which is what keeps the four correlated key families mutually
//! consistent at every commit point.

use eyre::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::names;
use super::schema;
use super::smallindex::SmallIndex;
use super::NamespacedKv;
use crate::config::ITER_CHUNK;
use crate::encoding::key::{self, KEY_TYPE_DEVICE_IDX, KEY_TYPE_FOLDER_IDX};
use crate::model::{
    DeviceId, FileInfo, FileInfoTruncated, FileLike, FileRecord, IndexId, Vector, VersionList,
};
use crate::storage::{KeyRange, Reader, Store, Writer, WriteTxn};

use super::meta::MetadataTracker;

#[derive(Debug)]
pub struct Instance {
    store: Store,
    folder_idx: Mutex<SmallIndex>,
    device_idx: Mutex<SmallIndex>,
}

impl Instance {
    /// Opens the index database at `dir`, running schema migrations as
    /// needed. Fails when another process holds the store, or when the
    /// on-disk schema is newer than this build understands.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Instance>> {
        let store = Store::open(dir)?;
        let (folder_idx, device_idx) = store.read(|snap| {
            Ok((
                SmallIndex::load(KEY_TYPE_FOLDER_IDX, snap)?,
                SmallIndex::load(KEY_TYPE_DEVICE_IDX, snap)?,
            ))
        })?;
        let instance = Arc::new(Instance {
            store,
            folder_idx: Mutex::new(folder_idx),
            device_idx: Mutex::new(device_idx),
        });
        schema::update_schema(&instance)?;
        Ok(instance)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Operations committed to the store since open.
    pub fn committed(&self) -> u64 {
        self.store.committed()
    }

    /// Folders with at least one global entry, sorted.
    pub fn list_folders(&self) -> Result<Vec<String>> {
        self.store.read(|t| {
            let mut folders = Vec::new();
            t.for_each(&KeyRange::prefix(&[key::KEY_TYPE_GLOBAL]), &mut |k, _| {
                if let Some(val) = self.folder_val(key::global_key_folder(k)) {
                    if let Ok(name) = String::from_utf8(val) {
                        folders.push(name);
                    }
                }
                Ok(true)
            })?;
            folders.sort();
            folders.dedup();
            Ok(folders)
        })
    }

    /// Removes all local delta-index IDs, forcing a full index send on the
    /// next connection.
    pub fn drop_local_delta_index_ids(&self) -> Result<()> {
        self.drop_delta_index_ids(true)
    }

    /// Removes all remote delta-index IDs, forcing remotes to send full
    /// indexes on the next connection.
    pub fn drop_remote_delta_index_ids(&self) -> Result<()> {
        self.drop_delta_index_ids(false)
    }

    fn drop_delta_index_ids(&self, local: bool) -> Result<()> {
        self.store.write(|t| {
            let range = KeyRange::prefix(&[key::KEY_TYPE_INDEX_ID]);
            let mut after: Option<Vec<u8>> = None;
            loop {
                let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
                for (k, _) in &chunk.entries {
                    let device_is_local = self
                        .device_val(key::index_id_key_device(k))
                        .map(|val| val == DeviceId::LOCAL.0)
                        .unwrap_or(false);
                    if device_is_local == local {
                        t.delete(k)?;
                    }
                }
                match chunk.resume {
                    None => return Ok(()),
                    Some(resume) => after = Some(resume),
                }
            }
        })
    }

    // --- small-index plumbing ---

    pub(crate) fn folder_idx_id(&self, w: &mut dyn Writer, folder: &[u8]) -> Result<u32> {
        self.folder_idx.lock().id(w, folder)
    }

    pub(crate) fn device_idx_id(&self, w: &mut dyn Writer, device: &DeviceId) -> Result<u32> {
        self.device_idx.lock().id(w, &device.0)
    }

    pub(crate) fn lookup_folder_idx(&self, folder: &[u8]) -> Option<u32> {
        self.folder_idx.lock().lookup(folder)
    }

    pub(crate) fn lookup_device_idx(&self, device: &DeviceId) -> Option<u32> {
        self.device_idx.lock().lookup(&device.0)
    }

    pub(crate) fn folder_val(&self, idx: u32) -> Option<Vec<u8>> {
        self.folder_idx.lock().val(idx).map(|v| v.to_vec())
    }

    pub(crate) fn device_val(&self, idx: u32) -> Option<Vec<u8>> {
        self.device_idx.lock().val(idx).map(|v| v.to_vec())
    }

    pub(crate) fn stored_device(&self, idx: u32) -> DeviceId {
        let val = self
            .device_val(idx)
            .expect("bug: stored key references unknown device index");
        DeviceId::from_bytes(&val).expect("bug: device index maps to malformed device ID")
    }

    // --- key builders (allocating) ---

    pub(crate) fn device_key_into(
        &self,
        w: &mut dyn Writer,
        buf: &mut Vec<u8>,
        folder: &[u8],
        device: &DeviceId,
        name: &[u8],
    ) -> Result<()> {
        let folder_idx = self.folder_idx_id(w, folder)?;
        let device_idx = self.device_idx_id(w, device)?;
        key::device_key_into(buf, folder_idx, device_idx, name);
        Ok(())
    }

    pub(crate) fn global_key_into(
        &self,
        w: &mut dyn Writer,
        buf: &mut Vec<u8>,
        folder: &[u8],
        name: &[u8],
    ) -> Result<()> {
        let folder_idx = self.folder_idx_id(w, folder)?;
        key::global_key_into(buf, folder_idx, name);
        Ok(())
    }

    pub(crate) fn need_key_into(
        &self,
        w: &mut dyn Writer,
        buf: &mut Vec<u8>,
        folder: &[u8],
        name: &[u8],
    ) -> Result<()> {
        let folder_idx = self.folder_idx_id(w, folder)?;
        key::need_key_into(buf, folder_idx, name);
        Ok(())
    }

    pub(crate) fn folder_meta_key(&self, w: &mut dyn Writer, folder: &[u8]) -> Result<Vec<u8>> {
        let folder_idx = self.folder_idx_id(w, folder)?;
        let mut buf = Vec::new();
        key::folder_meta_key_into(&mut buf, folder_idx);
        Ok(buf)
    }

    /// The namespaced view over a folder's virtual-mtime lane.
    pub(crate) fn mtimes_kv(&self, w: &mut dyn Writer, folder: &[u8]) -> Result<NamespacedKv> {
        let folder_idx = self.folder_idx_id(w, folder)?;
        let mut prefix = Vec::new();
        key::mtimes_prefix_into(&mut prefix, folder_idx);
        Ok(NamespacedKv::new(prefix))
    }

    // --- record updates ---

    /// Ingests a batch of records for one device. Unchanged announcements
    /// (same version, same validity) are skipped without any write.
    pub(crate) fn update_files(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        device: &DeviceId,
        files: &[FileInfo],
        meta: &MetadataTracker,
    ) -> Result<()> {
        let mut fk = Vec::new();
        let mut gk = Vec::new();
        for f in files {
            let name = f.name.as_bytes();
            self.device_key_into(t, &mut fk, folder, device, name)?;

            let existing = get_file_as::<FileInfoTruncated>(&*t, &fk)?;
            if let Some(ef) = &existing {
                // Local flags or the invalid bit may change without a
                // version bump; validity covers both.
                if ef.version.equal(&f.version) && ef.is_invalid() == f.is_invalid() {
                    continue;
                }
            }

            if let Some(ef) = &existing {
                meta.remove_file(device, ef);
            }
            meta.add_file(device, f);

            debug!(device = ?device, name = %f.name, "insert record");
            t.put(&fk, &f.encoded())?;

            self.global_key_into(t, &mut gk, folder, name)?;
            self.update_global(t, &gk, folder, device, f, existing.as_ref(), meta)?;
        }
        Ok(())
    }

    /// Merges an announcement into the file's version list, updating the
    /// need marker and the cluster-global counters when the head changes.
    /// Returns whether the list was modified.
    ///
    /// `old_file` is the record `device` had stored for this name before
    /// the transaction overwrote it. It cannot be re-read here: the
    /// device-file key already holds the new record, and transaction reads
    /// see their own writes.
    pub(crate) fn update_global(
        &self,
        t: &mut WriteTxn,
        gk: &[u8],
        folder: &[u8],
        device: &DeviceId,
        file: &FileInfo,
        old_file: Option<&FileInfoTruncated>,
        meta: &MetadataTracker,
    ) -> Result<bool> {
        debug!(
            device = ?device,
            name = %file.name,
            version = ?file.version,
            invalid = file.is_invalid(),
            "update global",
        );

        let mut fl = match t.get(gk)? {
            Some(bytes) => match VersionList::decode(&bytes) {
                Ok(fl) => fl,
                Err(err) => {
                    debug!(%err, "undecodable version list, rebuilding");
                    VersionList::default()
                }
            },
            None => VersionList::default(),
        };

        let merge = fl.update(device, file);
        let Some(inserted_at) = merge.inserted_at else {
            debug!("same version, global unchanged");
            return Ok(false);
        };

        let name = file.name.as_bytes();
        let new_global: FileInfo = if inserted_at == 0 {
            file.clone()
        } else {
            // The head is unchanged or the previous second entry moved up;
            // either way its record must exist (invariant: every version
            // list head has a backing device-file record).
            let head = fl.versions[0].device;
            let mut dk = Vec::new();
            self.device_key_into(t, &mut dk, folder, &head, name)?;
            match get_file_as::<FileInfo>(&*t, &dk)? {
                Some(f) => f,
                None => panic!(
                    "bug: version list head has no device record for {:?}",
                    file.name
                ),
            }
        };

        self.fixup_need(t, folder, &fl, &new_global, name)?;

        let removed_at = merge.removed.as_ref().map(|(i, _)| *i);
        if removed_at != Some(0) && inserted_at != 0 {
            // The head did not change; counters stay as they are.
            debug!(name = %file.name, "new global list (head unchanged)");
            t.put(gk, &fl.encoded())?;
            return Ok(true);
        }

        // Take the old global out of the cluster-wide counters and put the
        // new one in.
        if removed_at == Some(0) {
            // The announcing device was the head itself; its previous
            // record is gone from the store, so the caller's copy is the
            // only source of the old stats.
            if let Some(old) = old_file {
                meta.remove_file(&DeviceId::GLOBAL, old);
            }
        } else if fl.versions.len() > 1 {
            // The previous head was pushed down to index 1. Its record
            // belongs to another device and is untouched in this
            // transaction.
            let old_fv = fl.versions[1].clone();
            let mut dk = Vec::new();
            self.device_key_into(t, &mut dk, folder, &old_fv.device, name)?;
            if let Some(old) = get_file_as::<FileInfo>(&*t, &dk)? {
                meta.remove_file(&DeviceId::GLOBAL, &old);
            }
        }
        meta.add_file(&DeviceId::GLOBAL, &new_global);

        debug!(name = %file.name, "new global list (head changed)");
        t.put(gk, &fl.encoded())?;
        Ok(true)
    }

    /// Sets or clears the need marker for `name` according to the need
    /// predicate against the (already updated) version list.
    fn fixup_need(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        fl: &VersionList,
        new_global: &impl FileLike,
        name: &[u8],
    ) -> Result<()> {
        let mut nk = Vec::new();
        self.need_key_into(t, &mut nk, folder, name)?;
        let has_marker = t.has(&nk)?;
        let (have_local, local_version) = match fl.get(&DeviceId::LOCAL) {
            Some(fv) => (true, fv.version.clone()),
            None => (false, Vector::new()),
        };
        if need(new_global, have_local, &local_version) {
            if !has_marker {
                debug!(name = %String::from_utf8_lossy(name), "local need insert");
                t.put(&nk, &[])?;
            }
        } else if has_marker {
            debug!(name = %String::from_utf8_lossy(name), "local need delete");
            t.delete(&nk)?;
        }
        Ok(())
    }

    /// Removes `device` from the version list of `name`, deleting the list
    /// when it empties and keeping counters and the need marker in step.
    pub(crate) fn remove_from_global(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        device: &DeviceId,
        name: &[u8],
        meta: Option<&MetadataTracker>,
    ) -> Result<()> {
        debug!(device = ?device, name = %String::from_utf8_lossy(name), "remove from global");

        let mut gk = Vec::new();
        self.global_key_into(t, &mut gk, folder, name)?;
        // The first announcement for a file may already be invalid, in
        // which case there is no global entry to remove a device from.
        let Some(bytes) = t.get(&gk)? else {
            return Ok(());
        };
        let mut fl = match VersionList::decode(&bytes) {
            Ok(fl) => fl,
            Err(err) => {
                debug!(%err, "undecodable version list");
                return Ok(());
            }
        };
        let Some(pos) = fl.versions.iter().position(|v| v.device == *device) else {
            return Ok(());
        };

        let mut head_removed = false;
        if pos == 0 {
            if let Some(meta) = meta {
                let mut dk = Vec::new();
                self.device_key_into(t, &mut dk, folder, device, name)?;
                match get_file_as::<FileInfo>(&*t, &dk)? {
                    Some(f) => {
                        meta.remove_file(&DeviceId::GLOBAL, &f);
                        head_removed = true;
                    }
                    // No backing record for the head; nothing to account
                    // for, leave the list as it is.
                    None => return Ok(()),
                }
            }
        }
        fl.versions.remove(pos);

        if fl.versions.is_empty() {
            t.delete(&gk)?;
            let mut nk = Vec::new();
            self.need_key_into(t, &mut nk, folder, name)?;
            if t.has(&nk)? {
                t.delete(&nk)?;
            }
            return Ok(());
        }

        debug!(name = %String::from_utf8_lossy(name), "new global list after remove");
        t.put(&gk, &fl.encoded())?;

        let head = fl.versions[0].clone();
        let mut dk = Vec::new();
        self.device_key_into(t, &mut dk, folder, &head.device, name)?;
        let head_file = get_file_as::<FileInfo>(&*t, &dk)?;
        if head_removed {
            if let Some(f) = &head_file {
                if let Some(meta) = meta {
                    meta.add_file(&DeviceId::GLOBAL, f);
                }
            }
        }
        if let Some(f) = &head_file {
            self.fixup_need(t, folder, &fl, f, name)?;
        }
        Ok(())
    }

    /// Records local announcements in the sequence lane, keyed by their
    /// sequence number and pointing at the device-file key.
    pub(crate) fn add_sequences(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        files: &[FileInfo],
    ) -> Result<()> {
        let folder_idx = self.folder_idx_id(t, folder)?;
        let device_idx = self.device_idx_id(t, &DeviceId::LOCAL)?;
        let mut sk = Vec::new();
        let mut dk = Vec::new();
        for f in files {
            key::sequence_key_into(&mut sk, folder_idx, f.sequence);
            key::device_key_into(&mut dk, folder_idx, device_idx, f.name.as_bytes());
            t.put(&sk, &dk)?;
        }
        Ok(())
    }

    /// Drops the sequence rows of superseded local records.
    pub(crate) fn remove_sequences(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        files: &[FileInfo],
    ) -> Result<()> {
        let folder_idx = self.folder_idx_id(t, folder)?;
        let mut sk = Vec::new();
        for f in files {
            key::sequence_key_into(&mut sk, folder_idx, f.sequence);
            t.delete(&sk)?;
        }
        Ok(())
    }

    // --- iteration internals ---

    /// Yields every record of `(folder, device)` in name order, optionally
    /// restricted to `prefix` (the prefix itself plus its children, never
    /// siblings like `prefix.foo`).
    pub(crate) fn with_have<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        device: &DeviceId,
        prefix: Option<&[u8]>,
        mut f: impl FnMut(F) -> bool,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let Some(device_idx) = self.lookup_device_idx(device) else {
            return Ok(());
        };

        let mut dk = Vec::new();
        let range = match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let unslashed = prefix.strip_suffix(b"/").unwrap_or(prefix);
                key::device_key_into(&mut dk, folder_idx, device_idx, unslashed);
                if let Some(mut rec) = get_file_as::<F>(r, &dk)? {
                    restore_native_name(&mut rec);
                    if !f(rec) {
                        return Ok(());
                    }
                }
                let mut slashed = unslashed.to_vec();
                slashed.push(b'/');
                key::device_key_into(&mut dk, folder_idx, device_idx, &slashed);
                KeyRange::prefix(&dk)
            }
            None => {
                key::device_key_into(&mut dk, folder_idx, device_idx, b"");
                KeyRange::prefix(&dk)
            }
        };

        r.for_each(&range, &mut |_, value| {
            let mut rec = match F::decode(value) {
                Ok(rec) => rec,
                Err(err) => {
                    debug!(%err, "unmarshal error, skipping entry");
                    return Ok(true);
                }
            };
            restore_native_name(&mut rec);
            Ok(f(rec))
        })
    }

    /// Yields local records in sequence order starting at `start_seq`.
    pub(crate) fn with_have_sequence<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        start_seq: u64,
        mut f: impl FnMut(F) -> bool,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let mut start = Vec::new();
        key::sequence_key_into(&mut start, folder_idx, start_seq);
        let mut end = Vec::new();
        key::sequence_key_into(&mut end, folder_idx, u64::MAX);
        r.for_each(&KeyRange::span(start, end), &mut |sk, dk| {
            match get_file_as::<F>(r, dk)? {
                Some(mut rec) => {
                    restore_native_name(&mut rec);
                    Ok(f(rec))
                }
                None => {
                    debug!(
                        sequence = key::sequence_key_sequence(sk),
                        "missing record for sequence entry",
                    );
                    Ok(true)
                }
            }
        })
    }

    /// Yields every device's records in the folder, raw names, truncated.
    pub(crate) fn with_all_folder_truncated(
        &self,
        r: &impl Reader,
        folder: &[u8],
        mut f: impl FnMut(DeviceId, FileInfoTruncated) -> bool,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let prefix = key::device_folder_prefix(folder_idx);
        r.for_each(&KeyRange::prefix(&prefix), &mut |k, value| {
            let device = self.stored_device(key::device_key_device(k));
            match FileInfoTruncated::decode(value) {
                Ok(rec) => Ok(f(device, rec)),
                Err(err) => {
                    debug!(%err, "unmarshal error, skipping entry");
                    Ok(true)
                }
            }
        })
    }

    /// Yields the global (head) record of every file in the folder,
    /// optionally restricted to `prefix` like
    /// [`with_have`](Self::with_have).
    pub(crate) fn with_global<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        prefix: Option<&[u8]>,
        mut f: impl FnMut(F) -> bool,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };

        let mut gk = Vec::new();
        let range = match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let unslashed = prefix.strip_suffix(b"/").unwrap_or(prefix);
                if let Some(mut rec) = self.get_global_as::<F>(r, folder, unslashed)? {
                    restore_native_name(&mut rec);
                    if !f(rec) {
                        return Ok(());
                    }
                }
                let mut slashed = unslashed.to_vec();
                slashed.push(b'/');
                key::global_key_into(&mut gk, folder_idx, &slashed);
                KeyRange::prefix(&gk)
            }
            None => {
                key::global_key_into(&mut gk, folder_idx, b"");
                KeyRange::prefix(&gk)
            }
        };

        let mut dk = Vec::new();
        r.for_each(&range, &mut |k, value| {
            let Some(vl) = decode_version_list(value) else {
                return Ok(true);
            };
            let name = key::global_key_name(k);
            let Some(device_idx) = self.lookup_device_idx(&vl.versions[0].device) else {
                debug!("version list head references unknown device");
                return Ok(true);
            };
            key::device_key_into(&mut dk, folder_idx, device_idx, name);
            match get_file_as::<F>(r, &dk)? {
                Some(mut rec) => {
                    restore_native_name(&mut rec);
                    Ok(f(rec))
                }
                None => Ok(true),
            }
        })
    }

    /// Point lookup of one device's record.
    pub(crate) fn get_file(
        &self,
        r: &impl Reader,
        folder: &[u8],
        device: &DeviceId,
        name: &[u8],
    ) -> Result<Option<FileInfo>> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(None);
        };
        let Some(device_idx) = self.lookup_device_idx(device) else {
            return Ok(None);
        };
        let mut dk = Vec::new();
        key::device_key_into(&mut dk, folder_idx, device_idx, name);
        get_file_as::<FileInfo>(r, &dk)
    }

    /// Point lookup of the global record for `name`.
    pub(crate) fn get_global_as<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        name: &[u8],
    ) -> Result<Option<F>> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(None);
        };
        let mut gk = Vec::new();
        key::global_key_into(&mut gk, folder_idx, name);
        let Some(bytes) = r.get(&gk)? else {
            return Ok(None);
        };
        let Some(vl) = decode_version_list(&bytes) else {
            return Ok(None);
        };
        let Some(device_idx) = self.lookup_device_idx(&vl.versions[0].device) else {
            return Ok(None);
        };
        let mut dk = Vec::new();
        key::device_key_into(&mut dk, folder_idx, device_idx, name);
        get_file_as::<F>(r, &dk)
    }

    /// The devices holding the global version of `name`, excluding invalid
    /// copies.
    pub(crate) fn availability(
        &self,
        r: &impl Reader,
        folder: &[u8],
        name: &[u8],
    ) -> Result<Vec<DeviceId>> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(Vec::new());
        };
        let mut gk = Vec::new();
        key::global_key_into(&mut gk, folder_idx, name);
        let Some(bytes) = r.get(&gk)? else {
            return Ok(Vec::new());
        };
        let Some(vl) = decode_version_list(&bytes) else {
            return Ok(Vec::new());
        };

        let head_version = vl.versions[0].version.clone();
        let mut devices = Vec::new();
        for fv in &vl.versions {
            if !fv.version.equal(&head_version) {
                break;
            }
            if fv.invalid {
                continue;
            }
            devices.push(fv.device);
        }
        Ok(devices)
    }

    /// Yields what `device` needs: for the local device, the need lane; for
    /// a remote, every global the remote is behind on.
    pub(crate) fn with_need<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        device: &DeviceId,
        mut f: impl FnMut(F) -> bool,
    ) -> Result<()> {
        if *device == DeviceId::LOCAL {
            return self.with_need_local(r, folder, f);
        }
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };

        let prefix = key::folder_prefix(key::KEY_TYPE_GLOBAL, folder_idx);
        let mut dk = Vec::new();
        r.for_each(&KeyRange::prefix(&prefix), &mut |k, value| {
            let Some(vl) = decode_version_list(value) else {
                return Ok(true);
            };

            let have_fv = vl.get(device);
            let have = have_fv.is_some();
            // Concurrent versions count as needed; resolving the conflict
            // is the puller's job, not ours.
            if let Some(fv) = have_fv {
                if fv.version.greater_equal(&vl.versions[0].version) {
                    return Ok(true);
                }
            }

            let name = key::global_key_name(k);
            let need_version = &vl.versions[0].version;

            for fv in &vl.versions {
                if !fv.version.equal(need_version) {
                    // No valid copy of the needed version exists.
                    break;
                }
                if fv.invalid {
                    continue;
                }
                let Some(device_idx) = self.lookup_device_idx(&fv.device) else {
                    debug!("version list entry references unknown device");
                    continue;
                };
                key::device_key_into(&mut dk, folder_idx, device_idx, name);
                let Some(mut rec) = get_file_as::<F>(r, &dk)? else {
                    continue;
                };
                if rec.is_deleted() && !have {
                    // Nobody needs a deletion of something they never had.
                    break;
                }
                restore_native_name(&mut rec);
                if !f(rec) {
                    return Ok(false);
                }
                break;
            }
            Ok(true)
        })
    }

    fn with_need_local<F: FileRecord>(
        &self,
        r: &impl Reader,
        folder: &[u8],
        mut f: impl FnMut(F) -> bool,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let prefix = key::folder_prefix(key::KEY_TYPE_NEED, folder_idx);
        r.for_each(&KeyRange::prefix(&prefix), &mut |k, _| {
            // Need keys share the global key layout.
            match self.get_global_as::<F>(r, folder, key::global_key_name(k))? {
                Some(mut rec) => {
                    restore_native_name(&mut rec);
                    Ok(f(rec))
                }
                None => Ok(true),
            }
        })
    }

    // --- consistency and removal ---

    /// Verifies every version list against the device-file lane, dropping
    /// entries whose backing record is gone, and feeds the surviving heads
    /// into the cluster-global counters. Used when recounting metadata.
    pub(crate) fn check_globals(
        &self,
        t: &mut WriteTxn,
        folder: &[u8],
        meta: &MetadataTracker,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let range = KeyRange::prefix(&key::folder_prefix(key::KEY_TYPE_GLOBAL, folder_idx));
        let mut after: Option<Vec<u8>> = None;
        let mut fk = Vec::new();
        loop {
            let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
            for (gkey, value) in &chunk.entries {
                let Some(vl) = decode_version_list(value) else {
                    continue;
                };
                let name = key::global_key_name(gkey);

                let mut new_vl = VersionList::default();
                for fv in &vl.versions {
                    let Some(device_idx) = self.lookup_device_idx(&fv.device) else {
                        continue;
                    };
                    key::device_key_into(&mut fk, folder_idx, device_idx, name);
                    if t.has(&fk)? {
                        new_vl.versions.push(fv.clone());
                    }
                }

                if let Some(head) = new_vl.versions.first() {
                    let device_idx = self
                        .lookup_device_idx(&head.device)
                        .expect("bug: surviving version list entry lost its device index");
                    key::device_key_into(&mut fk, folder_idx, device_idx, name);
                    if let Some(fi) = get_file_as::<FileInfo>(&*t, &fk)? {
                        meta.add_file(&DeviceId::GLOBAL, &fi);
                    }
                }

                if new_vl.versions.len() != vl.versions.len() {
                    if new_vl.is_empty() {
                        t.delete(gkey)?;
                    } else {
                        t.put(gkey, &new_vl.encoded())?;
                    }
                }
            }
            match chunk.resume {
                None => break,
                Some(resume) => after = Some(resume),
            }
        }
        debug!(folder = %String::from_utf8_lossy(folder), "global list check completed");
        Ok(())
    }

    /// Removes every record of `(folder, device)`, updating version lists
    /// and counters along the way. For the local device the sequence lane
    /// goes too, keeping records and sequence rows in bijection.
    pub(crate) fn drop_device_folder(
        &self,
        t: &mut WriteTxn,
        device: &DeviceId,
        folder: &[u8],
        meta: &MetadataTracker,
    ) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        let Some(device_idx) = self.lookup_device_idx(device) else {
            return Ok(());
        };

        let mut prefix = Vec::new();
        key::device_key_into(&mut prefix, folder_idx, device_idx, b"");
        let range = KeyRange::prefix(&prefix);
        let mut after: Option<Vec<u8>> = None;
        loop {
            let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
            for (dkey, _) in &chunk.entries {
                let name = key::device_key_name(dkey).to_vec();
                self.remove_from_global(t, folder, device, &name, Some(meta))?;
                t.delete(dkey)?;
            }
            t.check_flush()?;
            match chunk.resume {
                None => break,
                Some(resume) => after = Some(resume),
            }
        }

        if *device == DeviceId::LOCAL {
            Self::delete_prefix(t, &key::folder_prefix(key::KEY_TYPE_SEQUENCE, folder_idx))?;
        }
        Ok(())
    }

    /// Removes every lane of the folder: records, sequences, globals, need
    /// markers, block map, virtual mtimes and the metadata snapshot.
    pub(crate) fn drop_folder_lanes(&self, t: &mut WriteTxn, folder: &[u8]) -> Result<()> {
        let Some(folder_idx) = self.lookup_folder_idx(folder) else {
            return Ok(());
        };
        for tag in [
            key::KEY_TYPE_DEVICE,
            key::KEY_TYPE_SEQUENCE,
            key::KEY_TYPE_GLOBAL,
            key::KEY_TYPE_NEED,
            key::KEY_TYPE_BLOCK,
            key::KEY_TYPE_VIRTUAL_MTIME,
            key::KEY_TYPE_FOLDER_META,
        ] {
            Self::delete_prefix(t, &key::folder_prefix(tag, folder_idx))?;
        }
        Ok(())
    }

    /// Deletes everything under `prefix`, flushing the batch periodically.
    pub(crate) fn delete_prefix(t: &mut WriteTxn, prefix: &[u8]) -> Result<()> {
        let range = KeyRange::prefix(prefix);
        let mut after: Option<Vec<u8>> = None;
        loop {
            let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
            for (k, _) in &chunk.entries {
                t.delete(k)?;
            }
            t.check_flush()?;
            match chunk.resume {
                None => return Ok(()),
                Some(resume) => after = Some(resume),
            }
        }
    }

    // --- delta-index IDs ---

    pub(crate) fn get_index_id(
        &self,
        t: &mut WriteTxn,
        device: &DeviceId,
        folder: &[u8],
    ) -> Result<IndexId> {
        let device_idx = self.device_idx_id(t, device)?;
        let folder_idx = self.folder_idx_id(t, folder)?;
        let mut ik = Vec::new();
        key::index_id_key_into(&mut ik, device_idx, folder_idx);
        match t.get(&ik)? {
            Some(bytes) => Ok(IndexId::from_be_bytes(&bytes).unwrap_or_default()),
            None => Ok(IndexId::default()),
        }
    }

    pub(crate) fn put_index_id(
        &self,
        w: &mut dyn Writer,
        device_idx: u32,
        folder_idx: u32,
        id: IndexId,
    ) -> Result<()> {
        let mut ik = Vec::new();
        key::index_id_key_into(&mut ik, device_idx, folder_idx);
        w.put(&ik, &id.to_be_bytes())
    }
}

/// The need predicate: whether the local device must fetch `global`.
pub(crate) fn need(global: &impl FileLike, have_local: bool, local_version: &Vector) -> bool {
    // We never need an invalid file.
    if global.is_invalid() {
        return false;
    }
    // We don't need to delete a file we don't have.
    if global.is_deleted() && !have_local {
        return false;
    }
    // We don't need a file we already have at the global version.
    if have_local && local_version.equal(global.file_version()) {
        return false;
    }
    true
}

/// Reads and decodes a record, logging and swallowing decode failures so a
/// single malformed value never aborts an iteration.
pub(crate) fn get_file_as<F: FileRecord>(r: &impl Reader, key: &[u8]) -> Result<Option<F>> {
    match r.get(key)? {
        None => Ok(None),
        Some(bytes) => match F::decode(&bytes) {
            Ok(rec) => Ok(Some(rec)),
            Err(err) => {
                debug!(%err, "unmarshal error");
                Ok(None)
            }
        },
    }
}

fn decode_version_list(bytes: &[u8]) -> Option<VersionList> {
    match VersionList::decode(bytes) {
        Ok(vl) if !vl.is_empty() => Some(vl),
        Ok(_) => {
            debug!("empty version list");
            None
        }
        Err(err) => {
            debug!(%err, "unmarshal error");
            None
        }
    }
}

fn restore_native_name<F: FileRecord>(rec: &mut F) {
    let name = rec.name_mut();
    if let std::borrow::Cow::Owned(converted) = names::native(name) {
        *name = converted;
    }
}
