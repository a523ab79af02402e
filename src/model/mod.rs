//! # Data Model
//!
//! The record types the index stores and reconciles:
//!
//! - [`device`]: 32-byte device identifiers, the local/global sentinels and
//!   delta-index IDs.
//! - [`vector`]: version vectors, the partial order conflict detection is
//!   built on.
//! - [`fileinfo`]: file announcements - the full record with its block
//!   list, the truncated record without it, and the capability trait both
//!   satisfy.
//! - [`versionlist`]: the per-file, newest-first list of device versions
//!   whose head is the file's global version.

pub mod device;
pub mod fileinfo;
pub mod vector;
pub mod versionlist;

pub use device::{DeviceId, IndexId, ShortId};
pub use fileinfo::{
    local_flags, BlockInfo, FileInfo, FileInfoTruncated, FileLike, FileRecord, FileType,
};
pub use vector::{Counter, Vector};
pub use versionlist::{FileVersion, Merge, VersionList};
