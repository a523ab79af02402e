//! # Write-Ahead Log
//!
//! Durability for the store: every committed batch is appended to the WAL
//! as one frame and synced before it is applied to the memtable. On open
//! the WAL is replayed in order to reconstruct everything committed since
//! the last checkpoint.
//!
//! ## Frame Format
//!
//! ```text
//! +-------------------+----------------------+
//! | Frame Header (32) | Op payload (varint)  |
//! +-------------------+----------------------+
//! ```
//!
//! The header carries the payload length, the op count, the revision the
//! batch committed at, and a CRC-64 over the revision, op count and payload.
//! The payload is a sequence of ops: a tag byte (0 = put, 1 = delete), a
//! length-prefixed key, and for puts a length-prefixed value.
//!
//! ## Recovery
//!
//! Replay reads frames until the file ends or a frame fails validation. A
//! short or checksum-mismatched tail is the signature of a torn write at
//! crash time, not corruption: the tail is truncated away and replay ends.
//! The checkpoint file is the only place a checksum failure is treated as
//! real corruption.
//!
//! The checkpoint truncates the WAL after persisting the full keyspace, so
//! a single append-only file suffices; there is no segment rotation.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::varint;

pub const WAL_FRAME_HEADER_SIZE: usize = 32;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalFrameHeader {
    payload_len: U32,
    op_count: U32,
    rev: U64,
    checksum: U64,
    _reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<WalFrameHeader>() == WAL_FRAME_HEADER_SIZE);

fn compute_checksum(rev: u64, op_count: u32, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&rev.to_le_bytes());
    digest.update(&op_count.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// One decoded batch: key plus `Some(value)` for puts, `None` for deletes.
pub(crate) type WalOps = Vec<(Vec<u8>, Option<Vec<u8>>)>;

fn encode_ops<'a>(ops: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)>) -> (Vec<u8>, u32) {
    let mut payload = Vec::new();
    let mut count = 0u32;
    for (key, value) in ops {
        match value {
            Some(v) => {
                payload.push(OP_PUT);
                varint::encode_bytes(key, &mut payload);
                varint::encode_bytes(v, &mut payload);
            }
            None => {
                payload.push(OP_DELETE);
                varint::encode_bytes(key, &mut payload);
            }
        }
        count += 1;
    }
    (payload, count)
}

fn decode_ops(mut payload: &[u8], op_count: u32) -> Result<WalOps> {
    let mut ops = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        eyre::ensure!(!payload.is_empty(), "missing op tag");
        let tag = payload[0];
        payload = &payload[1..];
        let (key, n) = varint::decode_bytes(payload)?;
        let key = key.to_vec();
        payload = &payload[n..];
        match tag {
            OP_PUT => {
                let (value, n) = varint::decode_bytes(payload)?;
                ops.push((key, Some(value.to_vec())));
                payload = &payload[n..];
            }
            OP_DELETE => ops.push((key, None)),
            other => eyre::bail!("unknown op tag {}", other),
        }
    }
    eyre::ensure!(payload.is_empty(), "trailing bytes after ops");
    Ok(ops)
}

pub(crate) struct Wal {
    file: File,
    bytes: u64,
}

impl Wal {
    /// Opens or creates the WAL and replays every valid frame through
    /// `apply`. An invalid tail is truncated away.
    pub fn open(
        path: &Path,
        mut apply: impl FnMut(u64, WalOps),
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let mut offset = 0u64;
        loop {
            let mut header_bytes = [0u8; WAL_FRAME_HEADER_SIZE];
            match file.read_exact(&mut header_bytes) {
                Ok(()) => {}
                Err(_) => break,
            }
            let header = match WalFrameHeader::read_from_bytes(&header_bytes) {
                Ok(h) => h,
                Err(_) => break,
            };
            let payload_len = header.payload_len.get() as usize;
            let mut payload = vec![0u8; payload_len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            let rev = header.rev.get();
            let op_count = header.op_count.get();
            if compute_checksum(rev, op_count, &payload) != header.checksum.get() {
                debug!(offset, "WAL frame checksum mismatch, truncating tail");
                break;
            }
            let ops = match decode_ops(&payload, op_count) {
                Ok(ops) => ops,
                Err(err) => {
                    debug!(offset, %err, "WAL frame payload undecodable, truncating tail");
                    break;
                }
            };
            apply(rev, ops);
            offset += (WAL_FRAME_HEADER_SIZE + payload_len) as u64;
        }

        file.set_len(offset)
            .wrap_err("failed to truncate WAL tail")?;
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to WAL end")?;

        Ok(Self { file, bytes: offset })
    }

    /// Appends and syncs one batch committed at `rev`.
    pub fn append<'a>(
        &mut self,
        rev: u64,
        ops: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)>,
    ) -> Result<()> {
        let (payload, op_count) = encode_ops(ops);
        let header = WalFrameHeader {
            payload_len: U32::new(payload.len() as u32),
            op_count: U32::new(op_count),
            rev: U64::new(rev),
            checksum: U64::new(compute_checksum(rev, op_count, &payload)),
            _reserved: [0; 8],
        };

        self.file
            .write_all(header.as_bytes())
            .wrap_err("failed to write WAL frame header")?;
        self.file
            .write_all(&payload)
            .wrap_err("failed to write WAL frame payload")?;
        self.file
            .sync_data()
            .wrap_err("failed to sync WAL frame")?;

        self.bytes += (WAL_FRAME_HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Discards all frames. Called after a checkpoint has persisted them.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0).wrap_err("failed to truncate WAL")?;
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to rewind WAL")?;
        self.file.sync_data().wrap_err("failed to sync WAL truncate")?;
        self.bytes = 0;
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}
