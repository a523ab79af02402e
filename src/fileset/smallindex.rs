//! # Small Index
//!
//! Folder IDs and device IDs appear in every key; storing them verbatim
//! would multiply the keyspace several times over. The small index is a
//! persistent bidirectional map from those identifiers to 32-bit indices:
//! the indices go into keys, the mapping itself is persisted under a
//! single-byte prefix and mirrored in memory.
//!
//! Indices are allocated once, never reused and never shrink, so a
//! folder's or device's keys stay stable for the life of the database.
//!
//! The instance guards each small index with a mutex; [`SmallIndex::id`]
//! may persist a new mapping through whatever writer the caller is in,
//! which is why allocation is only reachable from writing paths. Read-only
//! paths use [`SmallIndex::lookup`] and treat an unknown identifier as
//! "nothing indexed under this yet".

use eyre::Result;
use hashbrown::HashMap;

use crate::storage::{KeyRange, Reader, Writer};

#[derive(Debug)]
pub struct SmallIndex {
    prefix: u8,
    id_to_val: HashMap<u32, Vec<u8>>,
    val_to_id: HashMap<Vec<u8>, u32>,
    next_id: u32,
}

impl SmallIndex {
    /// Loads the persisted mapping under `prefix` into memory.
    pub fn load(prefix: u8, r: &impl Reader) -> Result<Self> {
        let mut idx = SmallIndex {
            prefix,
            id_to_val: HashMap::new(),
            val_to_id: HashMap::new(),
            next_id: 0,
        };
        r.for_each(&KeyRange::prefix(&[prefix]), &mut |key, value| {
            let id = u32::from_be_bytes(
                key[1..5]
                    .try_into()
                    .map_err(|_| eyre::eyre!("short small-index key"))?,
            );
            idx.id_to_val.insert(id, value.to_vec());
            idx.val_to_id.insert(value.to_vec(), id);
            if id >= idx.next_id {
                idx.next_id = id + 1;
            }
            Ok(true)
        })?;
        Ok(idx)
    }

    /// The index for `val`, allocating and persisting a new one if needed.
    pub fn id(&mut self, w: &mut dyn Writer, val: &[u8]) -> Result<u32> {
        if let Some(&id) = self.val_to_id.get(val) {
            return Ok(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.val_to_id.insert(val.to_vec(), id);
        self.id_to_val.insert(id, val.to_vec());

        let mut key = Vec::with_capacity(5);
        key.push(self.prefix);
        key.extend_from_slice(&id.to_be_bytes());
        w.put(&key, val)?;
        Ok(id)
    }

    /// The index for `val` if one was ever allocated.
    pub fn lookup(&self, val: &[u8]) -> Option<u32> {
        self.val_to_id.get(val).copied()
    }

    /// The value behind an index.
    pub fn val(&self, id: u32) -> Option<&[u8]> {
        self.id_to_val.get(&id).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[test]
    fn ids_are_dense_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .without(|t| {
                let mut idx = SmallIndex::load(0x70, t)?;
                assert_eq!(idx.id(t, b"alpha")?, 0);
                assert_eq!(idx.id(t, b"beta")?, 1);
                assert_eq!(idx.id(t, b"alpha")?, 0);
                assert_eq!(idx.val(1), Some(b"beta".as_slice()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn mapping_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .without(|t| {
                let mut idx = SmallIndex::load(0x70, t)?;
                idx.id(t, b"alpha")?;
                idx.id(t, b"beta")?;
                Ok(())
            })
            .unwrap();

        store
            .without(|t| {
                let mut idx = SmallIndex::load(0x70, t)?;
                // Existing values resolve without allocation, new ones
                // continue after the persisted maximum.
                assert_eq!(idx.lookup(b"beta"), Some(1));
                assert_eq!(idx.id(t, b"gamma")?, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn lookup_of_unknown_value_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .read(|t| {
                let idx = SmallIndex::load(0x70, t)?;
                assert_eq!(idx.lookup(b"nope"), None);
                assert_eq!(idx.val(0), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn distinct_prefixes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .without(|t| {
                let mut folders = SmallIndex::load(0x70, t)?;
                folders.id(t, b"alpha")?;
                let devices = SmallIndex::load(0x71, t)?;
                assert_eq!(devices.lookup(b"alpha"), None);
                Ok(())
            })
            .unwrap();
    }
}
