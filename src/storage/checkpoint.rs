//! # Checkpoint File
//!
//! A checkpoint captures the entire keyspace visible at one revision. It is
//! the base state the WAL replays on top of, and writing one allows the WAL
//! to be truncated.
//!
//! ## File Format
//!
//! ```text
//! +--------------------+------------------------------------+
//! | Header (64 bytes)  | entries: klen key vlen value ...   |
//! +--------------------+------------------------------------+
//! ```
//!
//! The header holds a magic, a format version, the entry count, the
//! revision, and a CRC-64 over the entry region. Entries are sorted by key
//! (the memtable iterates in order) with varint length prefixes.
//!
//! ## Atomicity
//!
//! The file is written to a temporary sibling, synced, then renamed over
//! the live name. A crash mid-write leaves the previous checkpoint intact;
//! a crash between rename and WAL truncation is handled at replay time by
//! skipping WAL frames at or below the checkpoint revision.
//!
//! A checksum mismatch on load is real corruption (unlike a torn WAL tail)
//! and is reported as [`StoreError::Corruption`].

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::StoreError;
use crate::encoding::varint;

pub const CHECKPOINT_MAGIC: &[u8; 16] = b"findex snap v1\x00\x00";
pub const CHECKPOINT_HEADER_SIZE: usize = 64;
pub const CHECKPOINT_VERSION: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CheckpointHeader {
    magic: [u8; 16],
    version: U32,
    _pad: U32,
    entry_count: U64,
    rev: U64,
    checksum: U64,
    _reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<CheckpointHeader>() == CHECKPOINT_HEADER_SIZE);

/// Writes a checkpoint of `entries` (sorted by key) at `rev`, atomically
/// replacing any previous checkpoint at `path`.
pub(crate) fn write(
    path: &Path,
    rev: u64,
    entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let tmp_path = path.with_extension("cpt.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .wrap_err_with(|| format!("failed to create checkpoint at {:?}", tmp_path))?;

    file.write_all(&[0u8; CHECKPOINT_HEADER_SIZE])
        .wrap_err("failed to reserve checkpoint header")?;

    let mut digest = CRC64.digest();
    let mut entry_count = 0u64;
    let mut buf = Vec::new();
    for (key, value) in entries {
        buf.clear();
        varint::encode_bytes(&key, &mut buf);
        varint::encode_bytes(&value, &mut buf);
        digest.update(&buf);
        file.write_all(&buf)
            .wrap_err("failed to write checkpoint entry")?;
        entry_count += 1;
    }

    let header = CheckpointHeader {
        magic: *CHECKPOINT_MAGIC,
        version: U32::new(CHECKPOINT_VERSION),
        _pad: U32::new(0),
        entry_count: U64::new(entry_count),
        rev: U64::new(rev),
        checksum: U64::new(digest.finalize()),
        _reserved: [0; 16],
    };
    file.seek(SeekFrom::Start(0))
        .wrap_err("failed to seek to checkpoint header")?;
    file.write_all(header.as_bytes())
        .wrap_err("failed to write checkpoint header")?;
    file.sync_all().wrap_err("failed to sync checkpoint")?;
    drop(file);

    std::fs::rename(&tmp_path, path)
        .wrap_err_with(|| format!("failed to activate checkpoint at {:?}", path))?;
    Ok(())
}

/// Loads the checkpoint at `path`, if present, yielding its revision and
/// entries. Checksum or framing failures surface as
/// [`StoreError::Corruption`].
pub(crate) fn load(
    path: &Path,
    mut apply: impl FnMut(Vec<u8>, Vec<u8>),
) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)
        .wrap_err_with(|| format!("failed to open checkpoint at {:?}", path))?;
    let mmap = unsafe { Mmap::map(&file) }
        .wrap_err_with(|| format!("failed to map checkpoint at {:?}", path))?;

    if mmap.len() < CHECKPOINT_HEADER_SIZE {
        return Err(StoreError::Corruption("checkpoint shorter than header".into()).into());
    }
    let header = CheckpointHeader::read_from_bytes(&mmap[..CHECKPOINT_HEADER_SIZE])
        .map_err(|e| StoreError::Corruption(format!("bad checkpoint header: {e:?}")))?;
    if header.magic != *CHECKPOINT_MAGIC {
        return Err(StoreError::Corruption("bad checkpoint magic".into()).into());
    }
    if header.version.get() != CHECKPOINT_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported checkpoint version {}",
            header.version.get()
        ))
        .into());
    }

    let body = &mmap[CHECKPOINT_HEADER_SIZE..];
    if CRC64.checksum(body) != header.checksum.get() {
        return Err(StoreError::Corruption("checkpoint checksum mismatch".into()).into());
    }

    let mut rest = body;
    for _ in 0..header.entry_count.get() {
        let (key, n) = varint::decode_bytes(rest)
            .map_err(|e| StoreError::Corruption(format!("bad checkpoint entry key: {e}")))?;
        rest = &rest[n..];
        let (value, n) = varint::decode_bytes(rest)
            .map_err(|e| StoreError::Corruption(format!("bad checkpoint entry value: {e}")))?;
        let (key, value) = (key.to_vec(), value.to_vec());
        rest = &rest[n..];
        apply(key, value);
    }
    if !rest.is_empty() {
        return Err(StoreError::Corruption("trailing bytes after checkpoint entries".into()).into());
    }

    Ok(Some(header.rev.get()))
}
