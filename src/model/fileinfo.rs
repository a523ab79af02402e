//! # File Records
//!
//! A file announcement as stored in the device-file lane. The full record
//! carries the block list; [`FileInfoTruncated`] is the same record decoded
//! without it, for paths that only need metadata (counting, scanning,
//! need evaluation). Both satisfy [`FileLike`], the capability set the
//! engine works against, so reconciliation code never cares which flavor
//! it holds.
//!
//! ## Encoding
//!
//! Fields are encoded in fixed order with varints and length prefixes; the
//! block list comes last so the truncated decode simply stops before it.
//! Only this crate reads these bytes, and the encoding is deterministic:
//! encoding the same record always yields the same bytes.
//!
//! ## Validity
//!
//! A record can be *invalid*: present for bookkeeping, but its content
//! unavailable on that device. Invalidity is the old wire-level flag or any
//! of the ignored / unsupported / must-rescan local flags; the
//! receive-only flag does not make a record invalid.

use eyre::{ensure, Result};
use std::fmt;

use super::device::ShortId;
use super::vector::Vector;
use crate::encoding::varint;

/// Local (never synchronized) state bits on a record.
pub mod local_flags {
    /// The file kind is not supported on this platform.
    pub const UNSUPPORTED: u32 = 1 << 0;
    /// The file matches an ignore pattern.
    pub const IGNORED: u32 = 1 << 1;
    /// The entry must be rescanned before it can be trusted.
    pub const MUST_RESCAN: u32 = 1 << 2;
    /// Locally changed content in a receive-only folder.
    pub const RECEIVE_ONLY: u32 = 1 << 3;

    pub const ALL: u32 = UNSUPPORTED | IGNORED | MUST_RESCAN | RECEIVE_ONLY;
    /// Flags that make a record invalid.
    pub const INVALID_MASK: u32 = UNSUPPORTED | IGNORED | MUST_RESCAN;
}

/// File kind. The two deprecated symlink kinds survive only in old
/// databases and are rewritten to [`FileType::Symlink`] by migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    File,
    Directory,
    DeprecatedSymlinkFile,
    DeprecatedSymlinkDirectory,
    Symlink,
}

impl FileType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => FileType::File,
            1 => FileType::Directory,
            2 => FileType::DeprecatedSymlinkFile,
            3 => FileType::DeprecatedSymlinkDirectory,
            4 => FileType::Symlink,
            other => eyre::bail!("unknown file type {}", other),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FileType::File => 0,
            FileType::Directory => 1,
            FileType::DeprecatedSymlinkFile => 2,
            FileType::DeprecatedSymlinkDirectory => 3,
            FileType::Symlink => 4,
        }
    }

    pub fn is_symlink(self) -> bool {
        matches!(
            self,
            FileType::Symlink
                | FileType::DeprecatedSymlinkFile
                | FileType::DeprecatedSymlinkDirectory
        )
    }
}

/// One content block of a file.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: i64,
    pub size: u32,
    pub hash: Vec<u8>,
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(o={}, s={}, h=", self.offset, self.size)?;
        for b in self.hash.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// The capability set shared by full and truncated records.
pub trait FileLike {
    fn file_name(&self) -> &str;
    fn file_size(&self) -> i64;
    fn file_type(&self) -> FileType;
    fn file_local_flags(&self) -> u32;
    fn file_version(&self) -> &Vector;
    fn file_sequence(&self) -> u64;
    fn is_deleted(&self) -> bool;
    fn raw_invalid(&self) -> bool;

    fn is_directory(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    fn is_symlink(&self) -> bool {
        self.file_type().is_symlink()
    }

    fn is_invalid(&self) -> bool {
        self.raw_invalid() || self.file_local_flags() & local_flags::INVALID_MASK != 0
    }

    fn is_ignored(&self) -> bool {
        self.file_local_flags() & local_flags::IGNORED != 0
    }

    fn is_unsupported(&self) -> bool {
        self.file_local_flags() & local_flags::UNSUPPORTED != 0
    }

    fn must_rescan(&self) -> bool {
        self.file_local_flags() & local_flags::MUST_RESCAN != 0
    }

    fn is_receive_only_changed(&self) -> bool {
        self.file_local_flags() & local_flags::RECEIVE_ONLY != 0
    }
}

/// A decodable record flavor. The engine's read paths are generic over
/// this, so each call site statically picks full or truncated decoding.
pub trait FileRecord: FileLike + Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
    fn name_mut(&mut self) -> &mut String;
}

/// A complete file announcement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub file_type: FileType,
    pub size: i64,
    pub permissions: u32,
    pub modified_s: i64,
    pub modified_ns: i32,
    pub modified_by: ShortId,
    pub deleted: bool,
    pub raw_invalid: bool,
    pub no_permissions: bool,
    pub symlink_target: String,
    pub version: Vector,
    pub sequence: u64,
    pub local_flags: u32,
    pub blocks: Vec<BlockInfo>,
}

/// A file announcement without its block list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileInfoTruncated {
    pub name: String,
    pub file_type: FileType,
    pub size: i64,
    pub permissions: u32,
    pub modified_s: i64,
    pub modified_ns: i32,
    pub modified_by: ShortId,
    pub deleted: bool,
    pub raw_invalid: bool,
    pub no_permissions: bool,
    pub symlink_target: String,
    pub version: Vector,
    pub sequence: u64,
    pub local_flags: u32,
}

const FLAG_DELETED: u8 = 1 << 0;
const FLAG_RAW_INVALID: u8 = 1 << 1;
const FLAG_NO_PERMISSIONS: u8 = 1 << 2;

impl FileInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_bytes(self.name.as_bytes(), buf);
        buf.push(self.file_type.as_u8());
        varint::encode_i64(self.size, buf);
        varint::encode_u64(u64::from(self.permissions), buf);
        varint::encode_i64(self.modified_s, buf);
        varint::encode_u64(self.modified_ns as u32 as u64, buf);
        varint::encode_u64(self.modified_by, buf);
        let mut flags = 0u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.raw_invalid {
            flags |= FLAG_RAW_INVALID;
        }
        if self.no_permissions {
            flags |= FLAG_NO_PERMISSIONS;
        }
        buf.push(flags);
        varint::encode_u64(u64::from(self.local_flags), buf);
        varint::encode_u64(self.sequence, buf);
        varint::encode_bytes(self.symlink_target.as_bytes(), buf);
        self.version.encode(buf);
        varint::encode_u64(self.blocks.len() as u64, buf);
        for block in &self.blocks {
            varint::encode_i64(block.offset, buf);
            varint::encode_u64(u64::from(block.size), buf);
            varint::encode_bytes(&block.hash, buf);
        }
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.name.len() + self.blocks.len() * 40);
        self.encode(&mut buf);
        buf
    }

    /// This record without its block list.
    pub fn truncated(&self) -> FileInfoTruncated {
        FileInfoTruncated {
            name: self.name.clone(),
            file_type: self.file_type,
            size: self.size,
            permissions: self.permissions,
            modified_s: self.modified_s,
            modified_ns: self.modified_ns,
            modified_by: self.modified_by,
            deleted: self.deleted,
            raw_invalid: self.raw_invalid,
            no_permissions: self.no_permissions,
            symlink_target: self.symlink_target.clone(),
            version: self.version.clone(),
            sequence: self.sequence,
            local_flags: self.local_flags,
        }
    }
}

/// Decodes everything up to the block list and returns the offset where
/// blocks begin.
fn decode_head(bytes: &[u8]) -> Result<(FileInfoTruncated, usize)> {
    let (name, mut offset) = varint::decode_bytes(bytes)?;
    let name = std::str::from_utf8(name)
        .map_err(|_| eyre::eyre!("file name is not valid UTF-8"))?
        .to_string();
    ensure!(bytes.len() > offset, "truncated file record");
    let file_type = FileType::from_u8(bytes[offset])?;
    offset += 1;
    let (size, n) = varint::decode_i64(&bytes[offset..])?;
    offset += n;
    let (permissions, n) = varint::decode_u64(&bytes[offset..])?;
    offset += n;
    let (modified_s, n) = varint::decode_i64(&bytes[offset..])?;
    offset += n;
    let (modified_ns, n) = varint::decode_u64(&bytes[offset..])?;
    offset += n;
    let (modified_by, n) = varint::decode_u64(&bytes[offset..])?;
    offset += n;
    ensure!(bytes.len() > offset, "truncated file record");
    let flags = bytes[offset];
    offset += 1;
    let (local_flags, n) = varint::decode_u64(&bytes[offset..])?;
    offset += n;
    let (sequence, n) = varint::decode_u64(&bytes[offset..])?;
    offset += n;
    let (symlink_target, n) = varint::decode_bytes(&bytes[offset..])?;
    let symlink_target = std::str::from_utf8(symlink_target)
        .map_err(|_| eyre::eyre!("symlink target is not valid UTF-8"))?
        .to_string();
    offset += n;
    let (version, n) = Vector::decode(&bytes[offset..])?;
    offset += n;

    Ok((
        FileInfoTruncated {
            name,
            file_type,
            size,
            permissions: u32::try_from(permissions)
                .map_err(|_| eyre::eyre!("permissions out of range"))?,
            modified_s,
            modified_ns: modified_ns as u32 as i32,
            modified_by,
            deleted: flags & FLAG_DELETED != 0,
            raw_invalid: flags & FLAG_RAW_INVALID != 0,
            no_permissions: flags & FLAG_NO_PERMISSIONS != 0,
            symlink_target,
            version,
            sequence,
            local_flags: u32::try_from(local_flags)
                .map_err(|_| eyre::eyre!("local flags out of range"))?,
        },
        offset,
    ))
}

impl FileRecord for FileInfo {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let (head, mut offset) = decode_head(bytes)?;
        let (block_count, n) = varint::decode_u64(&bytes[offset..])?;
        offset += n;
        let mut blocks = Vec::with_capacity(block_count.min(4096) as usize);
        for _ in 0..block_count {
            let (block_offset, n) = varint::decode_i64(&bytes[offset..])?;
            offset += n;
            let (size, n) = varint::decode_u64(&bytes[offset..])?;
            offset += n;
            let (hash, n) = varint::decode_bytes(&bytes[offset..])?;
            let hash = hash.to_vec();
            offset += n;
            blocks.push(BlockInfo {
                offset: block_offset,
                size: u32::try_from(size).map_err(|_| eyre::eyre!("block size out of range"))?,
                hash,
            });
        }
        ensure!(offset == bytes.len(), "trailing bytes after file record");
        Ok(FileInfo {
            name: head.name,
            file_type: head.file_type,
            size: head.size,
            permissions: head.permissions,
            modified_s: head.modified_s,
            modified_ns: head.modified_ns,
            modified_by: head.modified_by,
            deleted: head.deleted,
            raw_invalid: head.raw_invalid,
            no_permissions: head.no_permissions,
            symlink_target: head.symlink_target,
            version: head.version,
            sequence: head.sequence,
            local_flags: head.local_flags,
            blocks,
        })
    }

    fn name_mut(&mut self) -> &mut String {
        &mut self.name
    }
}

impl FileRecord for FileInfoTruncated {
    fn decode(bytes: &[u8]) -> Result<Self> {
        // The block list after the head is intentionally not parsed.
        let (head, _) = decode_head(bytes)?;
        Ok(head)
    }

    fn name_mut(&mut self) -> &mut String {
        &mut self.name
    }
}

macro_rules! impl_file_like {
    ($ty:ty) => {
        impl FileLike for $ty {
            fn file_name(&self) -> &str {
                &self.name
            }
            fn file_size(&self) -> i64 {
                self.size
            }
            fn file_type(&self) -> FileType {
                self.file_type
            }
            fn file_local_flags(&self) -> u32 {
                self.local_flags
            }
            fn file_version(&self) -> &Vector {
                &self.version
            }
            fn file_sequence(&self) -> u64 {
                self.sequence
            }
            fn is_deleted(&self) -> bool {
                self.deleted
            }
            fn raw_invalid(&self) -> bool {
                self.raw_invalid
            }
        }
    };
}

impl_file_like!(FileInfo);
impl_file_like!(FileInfoTruncated);
