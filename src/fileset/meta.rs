//! # Folder Metadata Tracker
//!
//! Per-folder, per-device aggregates kept consistent with the store: counts
//! of files, directories, symlinks and deleted entries, total bytes, and
//! the per-device sequence counter. The counters answer `LocalSize`,
//! `GlobalSize` and `Sequence` without scanning, and they are persisted to
//! the folder-meta key inside the same transaction as the updates they
//! reflect.
//!
//! Counts are bucketed by (device, local-flag bit): a record with several
//! local flags contributes to each flag's bucket, a record with none to the
//! zero bucket. Remote records that are invalid and carry no local flags
//! are not counted at all - such entries are bookkeeping, not content. The
//! [`DeviceId::GLOBAL`] sentinel rows carry the cluster-wide view and are
//! maintained by the global-list update path.
//!
//! The tracker is recomputable: when the persisted snapshot is missing or
//! older than the recheck interval, the folder is recounted from the store
//! (see `FileSet::new`), and the result of recounting always equals the
//! incrementally maintained state.

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::time::{Duration, SystemTime};

use crate::model::{DeviceId, FileLike};
use crate::encoding::varint;
use crate::storage::{Reader, Writer};

/// Aggregate counts for one (device, flag-bucket).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub deleted: u64,
    pub bytes: u64,
}

impl Counts {
    pub fn add(self, other: Counts) -> Counts {
        Counts {
            files: self.files + other.files,
            directories: self.directories + other.directories,
            symlinks: self.symlinks + other.symlinks,
            deleted: self.deleted + other.deleted,
            bytes: self.bytes + other.bytes,
        }
    }

    fn apply<F: FileLike + ?Sized>(&mut self, f: &F, sign: i64) {
        let bump = |field: &mut u64| {
            *field = if sign >= 0 { *field + 1 } else { field.saturating_sub(1) };
        };
        if f.is_deleted() {
            bump(&mut self.deleted);
        } else if f.is_directory() {
            bump(&mut self.directories);
        } else if f.is_symlink() {
            bump(&mut self.symlinks);
        } else {
            bump(&mut self.files);
        }
        let size = f.file_size().max(0) as u64;
        self.bytes = if sign >= 0 { self.bytes + size } else { self.bytes.saturating_sub(size) };
    }
}

/// Calls `f` once for every set bit in `flags`.
pub(crate) fn each_flag_bit(mut flags: u32, mut f: impl FnMut(u32)) {
    while flags != 0 {
        let bit = flags & flags.wrapping_neg();
        f(bit);
        flags ^= bit;
    }
}

#[derive(Default)]
struct MetaInner {
    counts: HashMap<(DeviceId, u32), Counts>,
    seqs: HashMap<DeviceId, u64>,
    created_s: u64,
}

pub struct MetadataTracker {
    inner: RwLock<MetaInner>,
}

impl Default for MetadataTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataTracker {
    pub fn new() -> Self {
        Self { inner: RwLock::new(MetaInner::default()) }
    }

    /// Accounts for a new or updated record from `device`.
    pub fn add_file<F: FileLike + ?Sized>(&self, device: &DeviceId, f: &F) {
        let mut inner = self.inner.write();
        let seq = inner.seqs.entry(*device).or_default();
        if f.file_sequence() > *seq {
            *seq = f.file_sequence();
        }
        // Remote invalid records with no local flags are bookkeeping only.
        if f.is_invalid() && f.file_local_flags() == 0 {
            return;
        }
        let flags = f.file_local_flags();
        if flags == 0 {
            inner.counts.entry((*device, 0)).or_default().apply(f, 1);
        } else {
            each_flag_bit(flags, |bit| {
                inner.counts.entry((*device, bit)).or_default().apply(f, 1);
            });
        }
    }

    /// Reverses a previous [`add_file`](Self::add_file) for the old state
    /// of a record.
    pub fn remove_file<F: FileLike + ?Sized>(&self, device: &DeviceId, f: &F) {
        if f.is_invalid() && f.file_local_flags() == 0 {
            return;
        }
        let mut inner = self.inner.write();
        let flags = f.file_local_flags();
        if flags == 0 {
            inner.counts.entry((*device, 0)).or_default().apply(f, -1);
        } else {
            each_flag_bit(flags, |bit| {
                inner.counts.entry((*device, bit)).or_default().apply(f, -1);
            });
        }
    }

    /// Allocates the next local sequence number.
    pub fn next_seq(&self, device: &DeviceId) -> u64 {
        let mut inner = self.inner.write();
        let seq = inner.seqs.entry(*device).or_default();
        *seq += 1;
        *seq
    }

    /// The highest sequence seen for `device`.
    pub fn sequence(&self, device: &DeviceId) -> u64 {
        self.inner.read().seqs.get(device).copied().unwrap_or(0)
    }

    /// A copy of the counts for one (device, flag-bucket).
    pub fn counts(&self, device: &DeviceId, flag: u32) -> Counts {
        debug_assert!(flag == 0 || flag.is_power_of_two(), "flag must be a single bit");
        self.inner
            .read()
            .counts
            .get(&(*device, flag))
            .copied()
            .unwrap_or_default()
    }

    /// Devices with tracked state, the sentinels excluded.
    pub fn devices(&self) -> Vec<DeviceId> {
        let inner = self.inner.read();
        let mut devices: Vec<DeviceId> = inner
            .counts
            .keys()
            .map(|(d, _)| *d)
            .chain(inner.seqs.keys().copied())
            .filter(|d| *d != DeviceId::LOCAL && *d != DeviceId::GLOBAL)
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Zeroes the counts for `device`, keeping its sequence. Dropping the
    /// local device's records must not disturb delta-index resumption.
    pub fn reset_counts(&self, device: &DeviceId) {
        self.inner.write().counts.retain(|(d, _), _| d != device);
    }

    /// Forgets `device` entirely, sequence included. Files a remote
    /// announces after this are guaranteed newer than our state.
    pub fn reset_all(&self, device: &DeviceId) {
        let mut inner = self.inner.write();
        inner.counts.retain(|(d, _), _| d != device);
        inner.seqs.remove(device);
    }

    pub fn created(&self) -> u64 {
        self.inner.read().created_s
    }

    pub fn set_created(&self) {
        self.inner.write().created_s = unix_now();
    }

    /// Whether the persisted snapshot is old enough to warrant a recount.
    pub fn is_stale(&self, interval: Duration) -> bool {
        let created = self.created();
        if created == 0 {
            return true;
        }
        unix_now().saturating_sub(created) > interval.as_secs()
    }

    /// Age of the persisted snapshot in seconds.
    pub fn age_secs(&self) -> u64 {
        unix_now().saturating_sub(self.created())
    }

    /// Persists the tracker to `key`.
    pub fn save(&self, w: &mut dyn Writer, key: &[u8]) -> Result<()> {
        let inner = self.inner.read();
        let mut buf = Vec::new();
        varint::encode_u64(inner.created_s, &mut buf);

        let mut seqs: Vec<(&DeviceId, &u64)> = inner.seqs.iter().collect();
        seqs.sort_by_key(|(d, _)| **d);
        varint::encode_u64(seqs.len() as u64, &mut buf);
        for (device, seq) in seqs {
            buf.extend_from_slice(&device.0);
            varint::encode_u64(*seq, &mut buf);
        }

        let mut counts: Vec<(&(DeviceId, u32), &Counts)> = inner.counts.iter().collect();
        counts.sort_by_key(|((d, flag), _)| (*d, *flag));
        varint::encode_u64(counts.len() as u64, &mut buf);
        for ((device, flag), c) in counts {
            buf.extend_from_slice(&device.0);
            varint::encode_u64(u64::from(*flag), &mut buf);
            varint::encode_u64(c.files, &mut buf);
            varint::encode_u64(c.directories, &mut buf);
            varint::encode_u64(c.symlinks, &mut buf);
            varint::encode_u64(c.deleted, &mut buf);
            varint::encode_u64(c.bytes, &mut buf);
        }

        w.put(key, &buf)
    }

    /// Replaces this tracker's state from `key`. Returns false when no
    /// snapshot is stored.
    pub fn load(&self, r: &impl Reader, key: &[u8]) -> Result<bool> {
        let Some(bytes) = r.get(key)? else {
            return Ok(false);
        };
        let mut inner = MetaInner::default();
        let bytes = bytes.as_slice();

        let (created_s, mut offset) = varint::decode_u64(bytes)?;
        inner.created_s = created_s;

        let (seq_count, n) = varint::decode_u64(&bytes[offset..])?;
        offset += n;
        for _ in 0..seq_count {
            eyre::ensure!(bytes.len() >= offset + 32, "truncated metadata sequence row");
            let device = DeviceId::from_bytes(&bytes[offset..offset + 32])?;
            offset += 32;
            let (seq, n) = varint::decode_u64(&bytes[offset..])?;
            offset += n;
            inner.seqs.insert(device, seq);
        }

        let (bucket_count, n) = varint::decode_u64(&bytes[offset..])?;
        offset += n;
        for _ in 0..bucket_count {
            eyre::ensure!(bytes.len() >= offset + 32, "truncated metadata count row");
            let device = DeviceId::from_bytes(&bytes[offset..offset + 32])?;
            offset += 32;
            let (flag, n) = varint::decode_u64(&bytes[offset..])?;
            offset += n;
            let mut fields = [0u64; 5];
            for field in &mut fields {
                let (value, n) = varint::decode_u64(&bytes[offset..])?;
                offset += n;
                *field = value;
            }
            inner.counts.insert(
                (device, u32::try_from(flag).map_err(|_| eyre::eyre!("flag out of range"))?),
                Counts {
                    files: fields[0],
                    directories: fields[1],
                    symlinks: fields[2],
                    deleted: fields[3],
                    bytes: fields[4],
                },
            );
        }

        *self.inner.write() = inner;
        Ok(true)
    }

    /// Forgets everything, for a recount from scratch.
    pub fn clear(&self) {
        *self.inner.write() = MetaInner::default();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
