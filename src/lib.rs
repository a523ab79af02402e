//! # findex - File Index and Version Reconciliation Engine
//!
//! findex is the per-folder file index that backs a peer-to-peer file
//! synchronization system. For each synchronized folder it ingests streams of
//! file announcements from the local scanner and from remote peers, stores
//! them durably in an embedded ordered key-value store, reconciles them into
//! a per-file "global" newest-version view using version vectors, and serves
//! the three derived streams the pull scheduler consumes: *have* (what this
//! device has), *global* (what the cluster collectively has) and *need*
//! (what this device must fetch to converge).
//!
//! ## Quick Start
//!
//! ```ignore
//! use findex::{DeviceId, FileSet, Instance};
//!
//! let db = Instance::open("./index-db")?;
//! let set = FileSet::new("default", db.clone())?;
//!
//! set.update(&DeviceId::LOCAL, scanned_files)?;
//! set.with_need(&DeviceId::LOCAL, |f| {
//!     println!("need {} at {:?}", f.name, f.version);
//!     true
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------+
//! |           Public API (FileSet)              |
//! +---------------------------------------------+
//! |  Version reconciliation  |  Metadata counts |
//! |  (VersionList merge)     |  (per device)    |
//! +---------------------------------------------+
//! |  Key families  |  Record codec  |  BlockMap |
//! +---------------------------------------------+
//! |  Transactions (without / read / dirty /     |
//! |  write with batch + overlay reads)          |
//! +---------------------------------------------+
//! |  Ordered KV store (memtable + snapshots)    |
//! +---------------------------------------------+
//! |  WAL + checkpoint file + process lock       |
//! +---------------------------------------------+
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! index_dir/
//! ├── findex.cpt     # checkpoint: full keyspace at one revision
//! ├── findex.wal     # write-ahead log of committed batches
//! └── LOCK           # single-process file lock
//! ```
//!
//! ## Consistency Model
//!
//! Four correlated key families exist per folder (device-file, global, need,
//! sequence) plus the block map and metadata counters. Every mutation runs
//! under the folder's update mutex inside one write transaction, so a
//! committed state always satisfies the cross-family invariants: the global
//! list's first entry has a backing device-file record, the need marker
//! matches the need predicate, local records and sequence rows are in
//! bijection, and the counters equal a full re-aggregation.
//!
//! ## Module Overview
//!
//! - [`storage`]: embedded ordered KV store, snapshots, transaction modes
//! - [`encoding`]: varints and the typed key families
//! - [`model`]: device IDs, version vectors, file records, version lists
//! - [`fileset`]: the index engine itself (FileSet, metadata, block map,
//!   schema migrations)

pub mod config;
pub mod encoding;
pub mod fileset;
pub mod model;
pub mod storage;

pub use fileset::{
    drop_folder, BlockFinder, BlockMap, Counts, DowngradeError, FileSet, Instance, MetadataTracker,
    NamespacedKv, DB_MIN_VERSION, DB_VERSION,
};
pub use model::{
    local_flags, BlockInfo, DeviceId, FileInfo, FileInfoTruncated, FileLike, FileType, FileVersion,
    IndexId, ShortId, Vector, VersionList,
};
pub use storage::{KeyRange, Reader, Snapshot, Store, StoreError, Writer};
