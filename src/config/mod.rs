//! # Configuration
//!
//! Central location for engine tunables and their environment overrides.

mod constants;

pub use constants::{
    parse_interval, recheck_interval, BATCH_FLUSH_OPS, DEFAULT_RECHECK_INTERVAL, ITER_CHUNK,
    RECHECK_INTERVAL_ENV, WAL_CHECKPOINT_BYTES,
};
