//! # Schema Manager
//!
//! The misc lane records the on-disk schema version and the minimum
//! release able to read it. On open, a database from a newer release is
//! refused outright (downgrades cannot be migrated), an up-to-date one is
//! left alone, and an older one is migrated forward step by step.
//!
//! ## Versions
//!
//! | version | change |
//! |---------|--------|
//! | 0       | original layout |
//! | 1       | absolute names pruned, deprecated symlink kinds unified, invalid records in version lists |
//! | 2       | sequence lane introduced |
//! | 3       | need lane introduced |
//! | 4, 5    | need lane rebuilt (bugs in the v3/v4 build-out) |
//! | 6       | local invalid records converted to the ignored local flag |
//!
//! Each migration step runs in its own write transaction with periodic
//! flushing; every step is idempotent, and the version keys are written
//! only after the last step succeeds. A crash mid-migration therefore
//! re-runs some steps on next open but never records a half-migrated
//! schema.

use eyre::Result;
use thiserror::Error;
use tracing::info;

use super::instance::{need, Instance};
use super::meta::MetadataTracker;
use super::namespaced::NamespacedKv;
use crate::config::ITER_CHUNK;
use crate::encoding::key;
use crate::model::{
    DeviceId, FileInfo, FileInfoTruncated, FileLike, FileRecord, FileType, local_flags,
};
use crate::storage::{KeyRange, Reader, Writer};

/// The schema version this build reads and writes.
pub const DB_VERSION: i64 = 6;
/// The oldest release able to read schema version [`DB_VERSION`].
pub const DB_MIN_VERSION: &str = "v0.1.0";

const VERSION_KEY: &str = "dbVersion";
const MIN_VERSION_KEY: &str = "dbMinVersion";

/// The on-disk schema is newer than this build; starting up would corrupt
/// it. Carries the minimum release the database demands.
#[derive(Debug, Clone, Error)]
#[error("database requires {min_version} or newer")]
pub struct DowngradeError {
    pub min_version: String,
}

fn misc_kv() -> NamespacedKv {
    NamespacedKv::new(vec![key::KEY_TYPE_MISC_DATA])
}

/// Brings the database to the current schema version, or refuses.
pub(crate) fn update_schema(db: &Instance) -> Result<()> {
    let misc = misc_kv();
    let (prev, min_version) = db.store().without(|t| {
        Ok((
            misc.i64(t, VERSION_KEY)?.unwrap_or(0),
            misc.string(t, MIN_VERSION_KEY)?,
        ))
    })?;

    if prev > DB_VERSION {
        return Err(DowngradeError {
            min_version: min_version.unwrap_or_else(|| "a newer release".into()),
        }
        .into());
    }
    if prev == DB_VERSION {
        return Ok(());
    }

    info!(from = prev, to = DB_VERSION, "updating database schema");

    if prev < 1 {
        migrate_0_to_1(db)?;
    }
    if prev < 2 {
        migrate_1_to_2(db)?;
    }
    if prev < 3 {
        migrate_2_to_3(db)?;
    }
    // Versions 3 and 4 shipped with a miscomputed need lane; rebuild it.
    if prev == 3 || prev == 4 {
        migrate_to_5(db)?;
    }
    if prev < 6 {
        migrate_5_to_6(db)?;
    }

    db.store().write(|t| {
        misc.put_i64(t, VERSION_KEY, DB_VERSION)?;
        misc.put_string(t, MIN_VERSION_KEY, DB_MIN_VERSION)
    })
}

/// v0 to v1: prune absolute names, unify the deprecated symlink kinds,
/// and give invalid records version-list entries.
fn migrate_0_to_1(db: &Instance) -> Result<()> {
    db.store().write(|t| {
        // The counters of folders touched here are stale afterwards; their
        // metadata snapshots are dropped so the next open recounts.
        let mut changed_folders: Vec<Vec<u8>> = Vec::new();
        let dummy_meta = MetadataTracker::new();
        let mut symlinks_converted = 0u64;
        let mut invalids_added = 0u64;

        let range = KeyRange::prefix(&[key::KEY_TYPE_DEVICE]);
        let mut after: Option<Vec<u8>> = None;
        let mut gk = Vec::new();
        loop {
            let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
            for (dkey, value) in &chunk.entries {
                let Some(folder) = db.folder_val(key::device_key_folder(dkey)) else {
                    continue;
                };
                let name = key::device_key_name(dkey).to_vec();

                if name.starts_with(b"/") {
                    if !changed_folders.contains(&folder) {
                        changed_folders.push(folder.clone());
                    }
                    let device = db.stored_device(key::device_key_device(dkey));
                    db.remove_from_global(t, &folder, &device, &name, None)?;
                    t.delete(dkey)?;
                    continue;
                }

                let Ok(mut f) = FileInfo::decode(value) else {
                    continue;
                };
                if matches!(
                    f.file_type,
                    FileType::DeprecatedSymlinkFile | FileType::DeprecatedSymlinkDirectory
                ) {
                    f.file_type = FileType::Symlink;
                    t.put(dkey, &f.encoded())?;
                    symlinks_converted += 1;
                }

                if f.is_invalid() {
                    let device = db.stored_device(key::device_key_device(dkey));
                    db.global_key_into(t, &mut gk, &folder, &name)?;
                    let stored = f.truncated();
                    if db.update_global(t, &gk, &folder, &device, &f, Some(&stored), &dummy_meta)? {
                        if !changed_folders.contains(&folder) {
                            changed_folders.push(folder.clone());
                        }
                        invalids_added += 1;
                    }
                }
            }
            t.check_flush()?;
            match chunk.resume {
                None => break,
                Some(resume) => after = Some(resume),
            }
        }

        for folder in &changed_folders {
            let meta_key = db.folder_meta_key(t, folder)?;
            t.delete(&meta_key)?;
        }
        info!(symlinks_converted, invalids_added, "migrated schema to v1");
        Ok(())
    })
}

/// v1 to v2: build the sequence lane from the local records, enabling
/// iteration in announcement order.
fn migrate_1_to_2(db: &Instance) -> Result<()> {
    let folders = db.list_folders()?;
    db.store().write(|t| {
        for folder in &folders {
            let Some(folder_idx) = db.lookup_folder_idx(folder.as_bytes()) else {
                continue;
            };
            let Some(local_idx) = db.lookup_device_idx(&DeviceId::LOCAL) else {
                continue;
            };
            let mut prefix = Vec::new();
            key::device_key_into(&mut prefix, folder_idx, local_idx, b"");
            let range = KeyRange::prefix(&prefix);
            let mut after: Option<Vec<u8>> = None;
            let mut sk = Vec::new();
            loop {
                let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
                for (dkey, value) in &chunk.entries {
                    let Ok(rec) = FileInfoTruncated::decode(value) else {
                        continue;
                    };
                    key::sequence_key_into(&mut sk, folder_idx, rec.sequence);
                    t.put(&sk, dkey)?;
                }
                t.check_flush()?;
                match chunk.resume {
                    None => break,
                    Some(resume) => after = Some(resume),
                }
            }
        }
        info!("migrated schema to v2");
        Ok(())
    })
}

/// v2 to v3: build the need lane by evaluating the need predicate over
/// every global entry.
fn migrate_2_to_3(db: &Instance) -> Result<()> {
    rebuild_need_lane(db)?;
    info!("migrated schema to v3");
    Ok(())
}

/// v3/v4 to v5: wipe and rebuild the need lane.
fn migrate_to_5(db: &Instance) -> Result<()> {
    let folders = db.list_folders()?;
    db.store().write(|t| {
        for folder in &folders {
            let Some(folder_idx) = db.lookup_folder_idx(folder.as_bytes()) else {
                continue;
            };
            Instance::delete_prefix(t, &key::folder_prefix(key::KEY_TYPE_NEED, folder_idx))?;
        }
        Ok(())
    })?;
    rebuild_need_lane(db)?;
    info!("migrated schema to v5");
    Ok(())
}

fn rebuild_need_lane(db: &Instance) -> Result<()> {
    let folders = db.list_folders()?;
    db.store().write(|t| {
        for folder in &folders {
            let Some(folder_idx) = db.lookup_folder_idx(folder.as_bytes()) else {
                continue;
            };
            let local_idx = db.lookup_device_idx(&DeviceId::LOCAL);
            let range = KeyRange::prefix(&key::folder_prefix(key::KEY_TYPE_GLOBAL, folder_idx));
            let mut after: Option<Vec<u8>> = None;
            let mut dk = Vec::new();
            let mut nk = Vec::new();
            loop {
                let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
                for (gkey, value) in &chunk.entries {
                    let Ok(vl) = crate::model::VersionList::decode(value) else {
                        continue;
                    };
                    if vl.is_empty() {
                        continue;
                    }
                    let name = key::global_key_name(gkey);

                    let mut have_local = false;
                    let mut local_version = crate::model::Vector::new();
                    if let Some(local_idx) = local_idx {
                        key::device_key_into(&mut dk, folder_idx, local_idx, name);
                        if let Some(rec) =
                            super::instance::get_file_as::<FileInfoTruncated>(&*t, &dk)?
                        {
                            have_local = true;
                            local_version = rec.version.clone();
                        }
                    }

                    let Some(head_idx) = db.lookup_device_idx(&vl.versions[0].device) else {
                        continue;
                    };
                    key::device_key_into(&mut dk, folder_idx, head_idx, name);
                    let Some(global) =
                        super::instance::get_file_as::<FileInfoTruncated>(&*t, &dk)?
                    else {
                        continue;
                    };

                    if need(&global, have_local, &local_version) {
                        key::need_key_into(&mut nk, folder_idx, name);
                        t.put(&nk, &[])?;
                    }
                }
                t.check_flush()?;
                match chunk.resume {
                    None => break,
                    Some(resume) => after = Some(resume),
                }
            }
        }
        Ok(())
    })
}

/// v5 to v6: local invalid records become valid records carrying the
/// ignored local flag.
fn migrate_5_to_6(db: &Instance) -> Result<()> {
    let folders = db.list_folders()?;
    db.store().write(|t| {
        for folder in &folders {
            let Some(folder_idx) = db.lookup_folder_idx(folder.as_bytes()) else {
                continue;
            };
            let Some(local_idx) = db.lookup_device_idx(&DeviceId::LOCAL) else {
                continue;
            };
            let mut prefix = Vec::new();
            key::device_key_into(&mut prefix, folder_idx, local_idx, b"");
            let range = KeyRange::prefix(&prefix);
            let mut after: Option<Vec<u8>> = None;
            loop {
                let chunk = t.next_chunk(&range, after.as_deref(), ITER_CHUNK)?;
                for (dkey, value) in &chunk.entries {
                    let Ok(mut f) = FileInfo::decode(value) else {
                        continue;
                    };
                    if !f.is_invalid() {
                        continue;
                    }
                    f.raw_invalid = false;
                    f.local_flags = local_flags::IGNORED;
                    t.put(dkey, &f.encoded())?;
                }
                t.check_flush()?;
                match chunk.resume {
                    None => break,
                    Some(resume) => after = Some(resume),
                }
            }
        }
        info!("migrated schema to v6");
        Ok(())
    })
}
