//! # Block Map
//!
//! A secondary index from block hash to (folder, file, block index),
//! answering "who has this block locally" for the puller: when a wanted
//! block already exists in some local file, copying beats fetching.
//!
//! Only the local device's records feed the block map. Directories never
//! enter it; deleted and invalid records contribute no blocks and updating
//! to such a record clears the file's previous blocks.

use eyre::Result;
use std::sync::Arc;
use tracing::debug;

use super::instance::Instance;
use super::names;
use crate::encoding::key;
use crate::model::{FileInfo, FileLike};
use crate::storage::{KeyRange, Reader, Writer, WriteTxn};

pub struct BlockMap {
    folder_idx: u32,
}

impl BlockMap {
    pub fn new(folder_idx: u32) -> Self {
        Self { folder_idx }
    }

    /// Adds the blocks of `files`, skipping directories and deleted or
    /// invalid records.
    pub fn add(&self, w: &mut dyn Writer, files: &[FileInfo]) -> Result<()> {
        let mut bk = Vec::new();
        for file in files {
            if file.is_directory() || file.is_deleted() || file.is_invalid() {
                continue;
            }
            for (i, block) in file.blocks.iter().enumerate() {
                key::block_key_into(&mut bk, self.folder_idx, &block.hash, file.name.as_bytes());
                w.put(&bk, &(i as u32).to_be_bytes())?;
            }
        }
        Ok(())
    }

    /// Brings the map up to date with new record states: blocks of records
    /// that became deleted or invalid are removed, the rest are (re)added.
    pub fn update(&self, w: &mut dyn Writer, files: &[FileInfo]) -> Result<()> {
        let mut bk = Vec::new();
        for file in files {
            if file.is_directory() {
                continue;
            }
            if file.is_deleted() || file.is_invalid() {
                for block in &file.blocks {
                    key::block_key_into(&mut bk, self.folder_idx, &block.hash, file.name.as_bytes());
                    w.delete(&bk)?;
                }
                continue;
            }
            for (i, block) in file.blocks.iter().enumerate() {
                key::block_key_into(&mut bk, self.folder_idx, &block.hash, file.name.as_bytes());
                w.put(&bk, &(i as u32).to_be_bytes())?;
            }
        }
        Ok(())
    }

    /// Removes the blocks of the given (old) record states.
    pub fn discard(&self, w: &mut dyn Writer, files: &[FileInfo]) -> Result<()> {
        let mut bk = Vec::new();
        for file in files {
            for block in &file.blocks {
                key::block_key_into(&mut bk, self.folder_idx, &block.hash, file.name.as_bytes());
                w.delete(&bk)?;
            }
        }
        Ok(())
    }

    /// Removes every block entry of this folder.
    pub fn drop_all(&self, t: &mut WriteTxn) -> Result<()> {
        let prefix = key::folder_prefix(key::KEY_TYPE_BLOCK, self.folder_idx);
        Instance::delete_prefix(t, &prefix)
    }
}

/// Cross-folder block lookup over the live store.
pub struct BlockFinder {
    db: Arc<Instance>,
}

impl BlockFinder {
    pub fn new(db: Arc<Instance>) -> Self {
        Self { db }
    }

    /// Calls `f(folder, native name, block index)` for every file holding a
    /// block with `hash`, over the given folders in order, until `f`
    /// returns true. Returns whether any call did.
    pub fn iterate(
        &self,
        folders: &[&str],
        hash: &[u8],
        mut f: impl FnMut(&str, &str, u32) -> bool,
    ) -> Result<bool> {
        let mut found = false;
        self.db.store().without(|t| {
            'outer: for folder in folders {
                let Some(folder_idx) = self.db.lookup_folder_idx(folder.as_bytes()) else {
                    continue;
                };
                let mut prefix = Vec::new();
                key::block_key_into(&mut prefix, folder_idx, hash, b"");
                let mut hit = false;
                t.for_each(&KeyRange::prefix(&prefix), &mut |key_bytes, value| {
                    let name = match std::str::from_utf8(key::block_key_name(key_bytes)) {
                        Ok(name) => name,
                        Err(err) => {
                            debug!(%err, "undecodable name in block key");
                            return Ok(true);
                        }
                    };
                    let index = match <[u8; 4]>::try_from(value) {
                        Ok(raw) => u32::from_be_bytes(raw),
                        Err(_) => {
                            debug!("malformed block index value");
                            return Ok(true);
                        }
                    };
                    if f(folder, &names::native(name), index) {
                        hit = true;
                        return Ok(false);
                    }
                    Ok(true)
                })?;
                if hit {
                    found = true;
                    break 'outer;
                }
            }
            Ok(())
        })?;
        Ok(found)
    }
}
