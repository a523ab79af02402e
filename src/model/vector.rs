//! # Version Vectors
//!
//! A version vector maps device short-IDs to update counters and induces
//! the partial order conflict detection rests on. For vectors `a` and `b`:
//!
//! - `a.greater_equal(b)` when every counter in `a` is at least the
//!   matching counter in `b` (absent counters read as zero).
//! - `a.equal(b)` when the non-zero counters coincide exactly.
//! - `a.concurrent(b)` when neither dominates - the two sides changed the
//!   file independently and a conflict exists.
//!
//! Counters are kept sorted by ID so comparisons are linear merges and the
//! encoding is canonical. Zero counters are never stored.

use eyre::Result;
use smallvec::SmallVec;

use super::device::ShortId;
use crate::encoding::varint;

/// One device's counter within a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub id: ShortId,
    pub value: u64,
}

/// An ordered set of per-device counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vector {
    counters: SmallVec<[Counter; 2]>,
}

impl Vector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vector from (id, value) pairs; zero values are dropped and
    /// the rest sorted by ID.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ShortId, u64)>) -> Self {
        let mut counters: SmallVec<[Counter; 2]> = pairs
            .into_iter()
            .filter(|(_, value)| *value > 0)
            .map(|(id, value)| Counter { id, value })
            .collect();
        counters.sort_by_key(|c| c.id);
        counters.dedup_by_key(|c| c.id);
        Self { counters }
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// The counter for `id`, zero when absent.
    pub fn counter(&self, id: ShortId) -> u64 {
        self.counters
            .binary_search_by_key(&id, |c| c.id)
            .map(|i| self.counters[i].value)
            .unwrap_or(0)
    }

    /// Bumps this device's counter, recording a new local change.
    pub fn update(&mut self, id: ShortId) {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => self.counters[i].value += 1,
            Err(i) => self.counters.insert(i, Counter { id, value: 1 }),
        }
    }

    /// Keeps only this device's counter. Used when a modification must no
    /// longer claim to subsume other devices' changes.
    pub fn drop_others(&mut self, id: ShortId) {
        self.counters.retain(|c| c.id == id);
    }

    pub fn equal(&self, other: &Vector) -> bool {
        self.counters == other.counters
    }

    /// True when this vector subsumes `other`.
    pub fn greater_equal(&self, other: &Vector) -> bool {
        for c in &other.counters {
            if self.counter(c.id) < c.value {
                return false;
            }
        }
        true
    }

    /// True when neither vector subsumes the other.
    pub fn concurrent(&self, other: &Vector) -> bool {
        !self.greater_equal(other) && !other.greater_equal(self)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_u64(self.counters.len() as u64, buf);
        for c in &self.counters {
            varint::encode_u64(c.id, buf);
            varint::encode_u64(c.value, buf);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Vector, usize)> {
        let (count, mut offset) = varint::decode_u64(buf)?;
        let mut counters = SmallVec::new();
        for _ in 0..count {
            let (id, n) = varint::decode_u64(&buf[offset..])?;
            offset += n;
            let (value, n) = varint::decode_u64(&buf[offset..])?;
            offset += n;
            counters.push(Counter { id, value });
        }
        Ok((Vector { counters }, offset))
    }
}
