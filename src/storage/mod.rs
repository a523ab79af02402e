//! # Storage Layer
//!
//! The embedded ordered key-value store backing the index, and the
//! transaction modes the engine runs under.
//!
//! ## Architecture Overview
//!
//! ```text
//! +--------------------------------------------------+
//! |  Transaction modes (without / read / dirty /     |
//! |  write with batch overlay + check_flush)         |
//! +--------------------------------------------------+
//! |  Store: commit path, snapshots, recovery         |
//! +-------------------+------------------------------+
//! |  Memtable (MVCC)  |  WAL  |  Checkpoint  | LOCK  |
//! +-------------------+------------------------------+
//! ```
//!
//! The keyspace lives in an ordered memtable with short per-key version
//! chains; durability comes from a synced write-ahead log that is folded
//! into a checkpoint file once it grows past a threshold. Snapshots pin
//! revisions; range scans copy bounded chunks so no store lock is held
//! while caller callbacks run.
//!
//! ## Concurrency
//!
//! The store is `Send + Sync`. Commits serialize on the WAL mutex; readers
//! share the memtable `RwLock`. Snapshot lifetimes are independent of any
//! transaction.
//!
//! ## Module Organization
//!
//! - `memtable`: versioned ordered map
//! - `wal`: write-ahead log frames and recovery
//! - `checkpoint`: full-keyspace checkpoint file
//! - `store`: the store proper, snapshots, corruption handling
//! - `txn`: the four transaction modes and the reader/writer traits

mod checkpoint;
mod memtable;
mod store;
mod txn;
mod wal;

pub use store::{
    Snapshot, Store, StoreError, CHECKPOINT_FILE_NAME, LOCK_FILE_NAME, WAL_FILE_NAME,
};
pub use txn::{Chunk, DirtyTxn, KeyRange, NoWriter, Reader, WithoutTxn, Writer, WriteTxn};
