//! # FileSet Engine
//!
//! The per-folder file index and version-reconciliation engine. A
//! [`FileSet`] tracks local and remote files with newness checks: it
//! ingests announcements, merges them into per-file version lists, keeps
//! the need lane and the per-device counters in step, and serves the
//! have/global/need streams to the rest of the system.
//!
//! A certain amount of name normalization happens in here. Paths arrive
//! with either native or wire-format separators and encodings depending on
//! who calls us; they are transformed to wire format (NFC, slashes) on the
//! way to the database and back to native format on the way out.
//!
//! ## Module Organization
//!
//! - `set`: the public per-folder API
//! - `instance`: process-wide state and the raw-key algorithms
//! - `meta`: per-device counters and sequences
//! - `blockmap`: block hash lookup index
//! - `smallindex`: folder/device identifier compression
//! - `schema`: on-disk schema versioning and migrations
//! - `names`: wire/native filename conversion
//! - `namespaced`: prefix-scoped key-value views (misc data, mtimes)

mod blockmap;
mod instance;
mod meta;
mod names;
mod namespaced;
mod schema;
mod set;
mod smallindex;

pub use blockmap::{BlockFinder, BlockMap};
pub use instance::Instance;
pub use meta::{Counts, MetadataTracker};
pub use namespaced::NamespacedKv;
pub use schema::{DowngradeError, DB_MIN_VERSION, DB_VERSION};
pub use set::{drop_folder, FileSet};
