//! # Version Lists
//!
//! Every file name in a folder has one version list: the per-device
//! versions known across the cluster, sorted so the head is the *global*
//! version - the one the cluster should converge on.
//!
//! ## Ordering
//!
//! Valid entries sort before invalid ones; within the same validity,
//! greater version vectors sort first; concurrent vectors tie-break on the
//! device ID so every device computes the identical order. Each device
//! appears at most once. An empty list is never stored - the global key is
//! deleted instead.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::device::DeviceId;
use super::fileinfo::FileLike;
use super::vector::Vector;
use crate::encoding::varint;

/// One device's version of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub device: DeviceId,
    pub version: Vector,
    pub invalid: bool,
}

/// What a merge did: the displaced entry (with its old position) and where
/// the new entry landed. `inserted_at == None` means the announcement
/// matched the existing entry and nothing changed.
#[derive(Debug)]
pub struct Merge {
    pub removed: Option<(usize, FileVersion)>,
    pub inserted_at: Option<usize>,
}

/// The newest-first list of device versions for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionList {
    pub versions: SmallVec<[FileVersion; 2]>,
}

impl VersionList {
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The entry for `device`, if any.
    pub fn get(&self, device: &DeviceId) -> Option<&FileVersion> {
        self.versions.iter().find(|v| v.device == *device)
    }

    /// Merges an announcement from `device` into the list.
    ///
    /// The merge is a pure function of the list and the announcement's
    /// (device, version, invalid) triple: no clocks, no store reads, so
    /// every device that applies the same announcements converges on the
    /// same list.
    pub fn update(&mut self, device: &DeviceId, file: &impl FileLike) -> Merge {
        let new = FileVersion {
            device: *device,
            version: file.file_version().clone(),
            invalid: file.is_invalid(),
        };

        let mut removed = None;
        if let Some(i) = self.versions.iter().position(|v| v.device == *device) {
            if self.versions[i].version.equal(&new.version)
                && self.versions[i].invalid == new.invalid
            {
                return Merge { removed: None, inserted_at: None };
            }
            removed = Some((i, self.versions.remove(i)));
        }

        let inserted_at = self
            .versions
            .iter()
            .position(|existing| sorts_before(&new, existing))
            .unwrap_or(self.versions.len());
        self.versions.insert(inserted_at, new);

        Merge { removed, inserted_at: Some(inserted_at) }
    }

    /// Removes `device` from the list, returning the entry and the index it
    /// held.
    pub fn remove(&mut self, device: &DeviceId) -> Option<(usize, FileVersion)> {
        let i = self.versions.iter().position(|v| v.device == *device)?;
        Some((i, self.versions.remove(i)))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_u64(self.versions.len() as u64, buf);
        for fv in &self.versions {
            buf.extend_from_slice(&fv.device.0);
            buf.push(fv.invalid as u8);
            fv.version.encode(buf);
        }
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.versions.len() * 48);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<VersionList> {
        let (count, mut offset) = varint::decode_u64(bytes)?;
        let mut versions = SmallVec::new();
        for _ in 0..count {
            ensure!(bytes.len() >= offset + 33, "truncated version list entry");
            let device = DeviceId::from_bytes(&bytes[offset..offset + 32])?;
            let invalid = bytes[offset + 32] != 0;
            offset += 33;
            let (version, n) = Vector::decode(&bytes[offset..])?;
            offset += n;
            versions.push(FileVersion { device, version, invalid });
        }
        ensure!(offset == bytes.len(), "trailing bytes after version list");
        Ok(VersionList { versions })
    }
}

/// Whether a freshly merged entry belongs before an existing one.
fn sorts_before(new: &FileVersion, existing: &FileVersion) -> bool {
    if !new.invalid && existing.invalid {
        return true;
    }
    if new.invalid != existing.invalid {
        return false;
    }
    if new.version.greater_equal(&existing.version) && !new.version.equal(&existing.version) {
        return true;
    }
    new.version.concurrent(&existing.version) && new.device < existing.device
}
