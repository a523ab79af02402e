//! # Engine Constants
//!
//! Tunables for the store and the index engine. Values are chosen for an
//! index database whose working set is dominated by many small records:
//! file entries of a few hundred bytes, version lists and markers of a few
//! tens of bytes.
//!
//! | Constant              | Default | Governs                                |
//! |-----------------------|---------|----------------------------------------|
//! | `BATCH_FLUSH_OPS`     | 2048    | mid-transaction flush threshold        |
//! | `WAL_CHECKPOINT_BYTES`| 16 MiB  | WAL size that triggers a checkpoint    |
//! | `ITER_CHUNK`          | 256     | entries copied per range-scan lock hold|
//! | recheck interval      | 30 days | metadata recount staleness bound       |
//!
//! The metadata recheck interval can be overridden with the
//! `FINDEX_RECHECK_INTERVAL` environment variable, e.g. `45s`, `10m`, `12h`
//! or `7d`. A bare number is taken as seconds.

use std::time::Duration;

/// Write transactions flush their batch once it holds this many operations.
///
/// Only operations that are restartable at flush boundaries (prefix
/// deletion, schema migration) trigger the flush path.
pub const BATCH_FLUSH_OPS: usize = 2048;

/// WAL size after which a commit schedules an inline checkpoint.
pub const WAL_CHECKPOINT_BYTES: u64 = 16 * 1024 * 1024;

/// Entries copied out per lock acquisition during range scans. Keeps the
/// store lock release latency bounded while an iterator callback runs.
pub const ITER_CHUNK: usize = 256;

/// Folder metadata older than this is recounted from the store on open.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Environment variable overriding [`DEFAULT_RECHECK_INTERVAL`].
pub const RECHECK_INTERVAL_ENV: &str = "FINDEX_RECHECK_INTERVAL";

/// The effective metadata recheck interval, honoring the environment
/// override when it parses.
pub fn recheck_interval() -> Duration {
    match std::env::var(RECHECK_INTERVAL_ENV) {
        Ok(val) => parse_interval(&val).unwrap_or(DEFAULT_RECHECK_INTERVAL),
        Err(_) => DEFAULT_RECHECK_INTERVAL,
    }
}

/// Parses `<n>[s|m|h|d]` into a duration. A bare number means seconds.
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(60 * 60)?,
        "d" => n.checked_mul(24 * 60 * 60)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_bare_number_is_seconds() {
        assert_eq!(parse_interval("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parse_interval_with_units() {
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_interval("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_interval("7d"), Some(Duration::from_secs(604800)));
    }

    #[test]
    fn parse_interval_rejects_garbage() {
        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval("10w"), None);
        assert_eq!(parse_interval("ten"), None);
    }
}
