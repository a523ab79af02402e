//! # Device Identifiers
//!
//! Peers are identified by stable 32-byte IDs. Two sentinel IDs never
//! appear on the wire: [`DeviceId::LOCAL`] stands for this device and
//! [`DeviceId::GLOBAL`] exists only in the metadata counters, where it
//! carries the cluster-wide merged view.
//!
//! The short ID is the first eight bytes interpreted big-endian; version
//! vector counters are keyed by it.

use eyre::{ensure, Result};
use std::fmt;

pub type ShortId = u64;

/// A 32-byte device identifier, ordered lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    /// This device.
    pub const LOCAL: DeviceId = DeviceId([0xff; 32]);
    /// Counter sentinel for the cluster-global view.
    pub const GLOBAL: DeviceId = DeviceId([0xf8; 32]);

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 32, "device ID must be 32 bytes, got {}", bytes.len());
        let mut id = [0u8; 32];
        id.copy_from_slice(bytes);
        Ok(DeviceId(id))
    }

    pub fn short_id(&self) -> ShortId {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DeviceId::LOCAL {
            return write!(f, "DeviceId(local)");
        }
        if *self == DeviceId::GLOBAL {
            return write!(f, "DeviceId(global)");
        }
        write!(f, "DeviceId({:016x})", self.short_id())
    }
}

/// Opaque 64-bit value the index exchange protocol uses to detect
/// incompatible delta-index state. Zero means "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexId(pub u64);

impl IndexId {
    /// A fresh, effectively-random ID seeded from the system clock.
    pub fn generate() -> Self {
        use std::time::SystemTime;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mixed = (nanos as u64) ^ ((nanos >> 64) as u64).rotate_left(31) ^ 0x9e37_79b9_7f4a_7c15;
        // Zero is the "unset" marker; avoid generating it.
        IndexId(mixed.max(1))
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 8, "index ID must be 8 bytes, got {}", bytes.len());
        Ok(IndexId(u64::from_be_bytes(bytes.try_into().unwrap())))
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
