//! # FileSet Integration Tests
//!
//! End-to-end behavior of the index engine: ingest, reconciliation,
//! have/global/need streams, availability, counters, drops and the
//! cross-lane invariants that must hold after any committed transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tempfile::TempDir;

use findex::encoding::key;
use findex::{
    drop_folder, local_flags, BlockFinder, BlockInfo, Counts, DeviceId, FileInfo, FileLike,
    FileSet, FileType, Instance, IndexId, KeyRange, Reader, Vector, VersionList,
};

const FOLDER: &str = "default";

fn remote_a() -> DeviceId {
    DeviceId([0x01; 32])
}

fn remote_b() -> DeviceId {
    DeviceId([0x02; 32])
}

fn setup() -> (TempDir, Arc<Instance>, FileSet) {
    let dir = tempfile::tempdir().unwrap();
    let db = Instance::open(dir.path()).unwrap();
    let set = FileSet::new(FOLDER, db.clone()).unwrap();
    (dir, db, set)
}

fn file(name: &str, size: i64, version: &[(DeviceId, u64)]) -> FileInfo {
    FileInfo {
        name: name.into(),
        size,
        version: Vector::from_pairs(version.iter().map(|(d, c)| (d.short_id(), *c))),
        blocks: vec![BlockInfo { offset: 0, size: size.max(0) as u32, hash: vec![0xaa; 32] }],
        ..Default::default()
    }
}

fn deleted(name: &str, version: &[(DeviceId, u64)]) -> FileInfo {
    FileInfo {
        name: name.into(),
        deleted: true,
        version: Vector::from_pairs(version.iter().map(|(d, c)| (d.short_id(), *c))),
        ..Default::default()
    }
}

fn have_names(set: &FileSet, device: &DeviceId) -> Vec<String> {
    let mut names = Vec::new();
    set.with_have(device, |f| {
        names.push(f.name);
        true
    })
    .unwrap();
    names
}

fn global_names(set: &FileSet) -> Vec<String> {
    let mut names = Vec::new();
    set.with_global(|f| {
        names.push(f.name);
        true
    })
    .unwrap();
    names
}

fn need_files(set: &FileSet, device: &DeviceId) -> Vec<FileInfo> {
    let mut files = Vec::new();
    set.with_need(device, |f| {
        files.push(f);
        true
    })
    .unwrap();
    files
}

#[test]
fn single_file_single_device() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();

    assert_eq!(have_names(&set, &local), vec!["a"]);
    assert_eq!(global_names(&set), vec!["a"]);
    assert!(need_files(&set, &local).is_empty());
    let expected = Counts { files: 1, bytes: 10, ..Default::default() };
    assert_eq!(set.local_size(), expected);
    assert_eq!(set.global_size(), expected);
    assert_eq!(set.sequence(&local), 1);
}

#[test]
fn remote_introduces_newer_version() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("a", 20, &[(local, 1), (r, 1)])]).unwrap();

    let needs = need_files(&set, &local);
    assert_eq!(needs.len(), 1);
    assert_eq!(needs[0].name, "a");
    assert_eq!(needs[0].size, 20);

    assert_eq!(set.availability("a").unwrap(), vec![r]);
    assert_eq!(set.global_size(), Counts { files: 1, bytes: 20, ..Default::default() });
    assert_eq!(set.local_size(), Counts { files: 1, bytes: 10, ..Default::default() });
}

#[test]
fn concurrent_versions_keep_both_and_need_deterministically() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 2)])]).unwrap();
    set.update(&r, vec![file("a", 20, &[(r, 2)])]).unwrap();

    // The remote's device ID sorts before the local sentinel, so its copy
    // wins the tie-break and becomes global; ours stays in the list.
    let needs = need_files(&set, &local);
    assert_eq!(needs.len(), 1);
    assert_eq!(needs[0].size, 20);
    assert!(!needs[0].is_invalid());

    assert_eq!(set.availability("a").unwrap(), vec![r]);
    let global = set.get_global("a").unwrap().unwrap();
    assert_eq!(global.size, 20);
    // Both devices still have their own entry.
    assert_eq!(have_names(&set, &local), vec!["a"]);
    assert_eq!(have_names(&set, &r), vec!["a"]);
}

#[test]
fn deletion_of_a_file_we_do_not_have_is_not_needed() {
    let (_dir, _db, set) = setup();
    let r = remote_a();

    set.update(&r, vec![deleted("b", &[(r, 1)])]).unwrap();

    assert!(need_files(&set, &DeviceId::LOCAL).is_empty());
    // The deletion still exists globally.
    assert_eq!(global_names(&set), vec!["b"]);
}

#[test]
fn deletion_of_a_file_we_have_is_needed() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&r, vec![deleted("a", &[(local, 1), (r, 1)])]).unwrap();

    let needs = need_files(&set, &local);
    assert_eq!(needs.len(), 1);
    assert!(needs[0].deleted);
}

#[test]
fn repeated_update_is_a_no_op() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let announcement = vec![file("a", 10, &[(local, 1)])];

    set.update(&local, announcement.clone()).unwrap();
    let committed_before = set.sequence(&local);
    set.update(&local, announcement).unwrap();

    assert_eq!(set.sequence(&local), committed_before, "no sequence bump");
    assert_eq!(have_names(&set, &local), vec!["a"]);
    assert_eq!(set.local_size(), Counts { files: 1, bytes: 10, ..Default::default() });
}

#[test]
fn newer_version_replaces_entry_and_bumps_sequence() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&local, vec![file("a", 11, &[(local, 2)])]).unwrap();

    assert_eq!(set.sequence(&local), 2);
    let mut seen = Vec::new();
    set.with_have_sequence(0, |f| {
        seen.push((f.sequence, f.size));
        true
    })
    .unwrap();
    // The superseded sequence row is gone; only the replacement remains.
    assert_eq!(seen, vec![(2, 11)]);
    assert_eq!(set.local_size(), Counts { files: 1, bytes: 11, ..Default::default() });
    assert_eq!(set.global_size(), Counts { files: 1, bytes: 11, ..Default::default() });
}

#[test]
fn head_reannouncing_its_own_file_keeps_global_counts() {
    let (_dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    // Two globally visible files with different owners.
    set.update(&local, vec![file("own", 5, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("big", 100, &[(r, 1)])]).unwrap();
    assert_eq!(set.global_size(), Counts { files: 2, bytes: 105, ..Default::default() });

    // The head of "big" announces a newer version of its own file and
    // remains the head. The other file's contribution must survive.
    set.update(&r, vec![file("big", 500, &[(r, 2)])]).unwrap();
    assert_eq!(set.global_size(), Counts { files: 2, bytes: 505, ..Default::default() });

    // Same churn on the locally owned file.
    set.update(&local, vec![file("own", 7, &[(local, 2)])]).unwrap();
    assert_eq!(set.global_size(), Counts { files: 2, bytes: 507, ..Default::default() });

    assert_invariants(&db, &set);
}

#[test]
fn with_have_sequence_resumes_from_start_seq() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(
        &local,
        vec![
            file("a", 1, &[(local, 1)]),
            file("b", 2, &[(local, 1)]),
            file("c", 3, &[(local, 1)]),
        ],
    )
    .unwrap();

    let mut names = Vec::new();
    set.with_have_sequence(2, |f| {
        names.push(f.name);
        true
    })
    .unwrap();
    assert_eq!(names, vec!["b", "c"]);
}

#[test]
fn prefixed_iteration_matches_children_not_siblings() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(
        &local,
        vec![
            file("dir", 0, &[(local, 1)]),
            file("dir.sibling", 1, &[(local, 1)]),
            file("dir/child1", 2, &[(local, 1)]),
            file("dir/child2", 3, &[(local, 1)]),
            file("other", 4, &[(local, 1)]),
        ],
    )
    .unwrap();

    let mut names = Vec::new();
    set.with_prefixed_have_truncated(&local, "dir", |f| {
        names.push(f.name);
        true
    })
    .unwrap();
    assert_eq!(names, vec!["dir", "dir/child1", "dir/child2"]);

    let mut names = Vec::new();
    set.with_prefixed_global_truncated("dir/", |f| {
        names.push(f.name);
        true
    })
    .unwrap();
    assert_eq!(names, vec!["dir", "dir/child1", "dir/child2"]);
}

#[test]
fn early_termination_stops_iteration() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(
        &local,
        vec![file("a", 1, &[(local, 1)]), file("b", 2, &[(local, 1)]), file("c", 3, &[(local, 1)])],
    )
    .unwrap();

    let mut count = 0;
    set.with_have(&local, |_| {
        count += 1;
        count < 2
    })
    .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn illegal_names_are_dropped_on_ingest() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(
        &local,
        vec![
            file("", 1, &[(local, 1)]),
            file(".", 1, &[(local, 1)]),
            file("..", 1, &[(local, 1)]),
            file("/", 1, &[(local, 1)]),
            file("/absolute", 1, &[(local, 1)]),
            file("fine", 1, &[(local, 1)]),
        ],
    )
    .unwrap();

    assert_eq!(have_names(&set, &local), vec!["fine"]);
    assert_eq!(set.sequence(&local), 1);
}

#[test]
fn availability_excludes_invalid_copies() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let (a, b) = (remote_a(), remote_b());

    let version = [(local, 1), (a, 1)];
    set.update(&a, vec![file("a", 10, &version)]).unwrap();
    let mut unavailable = file("a", 10, &version);
    unavailable.raw_invalid = true;
    set.update(&b, vec![unavailable]).unwrap();

    assert_eq!(set.availability("a").unwrap(), vec![a]);
}

#[test]
fn invalid_global_is_never_needed() {
    let (_dir, _db, set) = setup();
    let r = remote_a();

    let mut f = file("ignored", 10, &[(r, 1)]);
    f.raw_invalid = true;
    set.update(&r, vec![f]).unwrap();

    assert!(need_files(&set, &DeviceId::LOCAL).is_empty());
}

#[test]
fn pulling_a_needed_file_clears_the_need() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    let newer = file("a", 20, &[(local, 1), (r, 1)]);
    set.update(&r, vec![newer.clone()]).unwrap();
    assert_eq!(need_files(&set, &local).len(), 1);

    // The puller finished and announces the new local state.
    set.update(&local, vec![newer]).unwrap();
    assert!(need_files(&set, &local).is_empty());
    assert_eq!(set.availability("a").unwrap(), vec![r, local]);
}

#[test]
fn remote_need_lists_what_the_remote_lacks() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)]), file("b", 5, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("a", 10, &[(local, 1)])]).unwrap();

    let needs: Vec<String> = need_files(&set, &r).into_iter().map(|f| f.name).collect();
    assert_eq!(needs, vec!["b"]);
}

#[test]
fn drop_remote_device_restores_local_global() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("a", 20, &[(local, 1), (r, 1)])]).unwrap();
    assert_eq!(set.availability("a").unwrap(), vec![r]);

    set.drop_device(&r).unwrap();

    assert!(have_names(&set, &r).is_empty());
    assert_eq!(set.availability("a").unwrap(), vec![local]);
    assert!(need_files(&set, &local).is_empty());
    assert_eq!(set.global_size(), Counts { files: 1, bytes: 10, ..Default::default() });
    assert_eq!(set.sequence(&r), 0, "remote sequence forgotten");
}

#[test]
fn drop_local_device_keeps_sequence_counter() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.drop_device(&local).unwrap();

    assert!(have_names(&set, &local).is_empty());
    assert_eq!(set.local_size(), Counts::default());
    assert_eq!(set.sequence(&local), 1, "sequence survives for delta indexes");

    set.update(&local, vec![file("b", 1, &[(local, 1)])]).unwrap();
    assert_eq!(set.sequence(&local), 2);
}

#[test]
fn drop_folder_clears_everything() {
    let (dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("b", 20, &[(r, 1)])]).unwrap();
    drop(set);

    drop_folder(&db, FOLDER).unwrap();
    drop(db);

    let db = Instance::open(dir.path()).unwrap();
    let set = FileSet::new(FOLDER, db.clone()).unwrap();
    assert!(have_names(&set, &local).is_empty());
    assert!(have_names(&set, &r).is_empty());
    assert!(global_names(&set).is_empty());
    assert!(need_files(&set, &local).is_empty());
    assert_eq!(set.local_size(), Counts::default());
    assert_eq!(set.global_size(), Counts::default());
}

#[test]
fn receive_only_changes_are_counted_separately() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    let mut changed = file("b", 5, &[(local, 1)]);
    changed.local_flags = local_flags::RECEIVE_ONLY;
    set.update(&local, vec![changed]).unwrap();

    assert_eq!(set.receive_only_changed_size(), Counts { files: 1, bytes: 5, ..Default::default() });
    assert_eq!(set.local_size(), Counts { files: 2, bytes: 15, ..Default::default() });
}

#[test]
fn list_devices_reports_remotes_with_state() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 1, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("a", 1, &[(local, 1)])]).unwrap();

    assert_eq!(set.list_devices(), vec![r]);
}

#[test]
fn local_index_id_is_lazily_allocated_and_stable() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    let id = set.index_id(&local).unwrap();
    assert_ne!(id, IndexId::default());
    assert_eq!(set.index_id(&local).unwrap(), id);

    assert_eq!(set.index_id(&r).unwrap(), IndexId::default());
    set.set_index_id(&r, IndexId(42)).unwrap();
    assert_eq!(set.index_id(&r).unwrap(), IndexId(42));
}

#[test]
fn dropping_remote_delta_index_ids_keeps_the_local_one() {
    let (_dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    let local_id = set.index_id(&local).unwrap();
    set.set_index_id(&r, IndexId(42)).unwrap();

    db.drop_remote_delta_index_ids().unwrap();
    assert_eq!(set.index_id(&local).unwrap(), local_id);
    assert_eq!(set.index_id(&r).unwrap(), IndexId::default());

    db.drop_local_delta_index_ids().unwrap();
    let new_local = set.index_id(&local).unwrap();
    assert_ne!(new_local, IndexId::default());
    assert_ne!(new_local, local_id);
}

#[test]
fn block_finder_locates_local_blocks() {
    let (_dir, db, set) = setup();
    let local = DeviceId::LOCAL;

    let mut f = file("data.bin", 2048, &[(local, 1)]);
    f.blocks = vec![
        BlockInfo { offset: 0, size: 1024, hash: vec![0x11; 32] },
        BlockInfo { offset: 1024, size: 1024, hash: vec![0x22; 32] },
    ];
    set.update(&local, vec![f]).unwrap();

    let finder = BlockFinder::new(db.clone());
    let mut hits = Vec::new();
    let found = finder
        .iterate(&[FOLDER], &[0x22; 32], |folder, name, index| {
            hits.push((folder.to_string(), name.to_string(), index));
            true
        })
        .unwrap();
    assert!(found);
    assert_eq!(hits, vec![(FOLDER.to_string(), "data.bin".to_string(), 1)]);

    // Deleting the file clears its blocks.
    set.update(&local, vec![deleted("data.bin", &[(local, 2)])]).unwrap();
    let found = finder.iterate(&[FOLDER], &[0x22; 32], |_, _, _| true).unwrap();
    assert!(!found);
}

#[test]
fn list_folders_reports_folders_with_globals() {
    let (_dir, db, set) = setup();
    set.update(&DeviceId::LOCAL, vec![file("a", 1, &[(DeviceId::LOCAL, 1)])]).unwrap();

    let other = FileSet::new("music", db.clone()).unwrap();
    other.update(&DeviceId::LOCAL, vec![file("song", 1, &[(DeviceId::LOCAL, 1)])]).unwrap();

    assert_eq!(db.list_folders().unwrap(), vec!["default".to_string(), "music".to_string()]);
}

// --- cross-lane invariants under a mixed workload ---

struct RawState {
    folder_idx: u32,
    devices: BTreeMap<u32, DeviceId>,
    device_files: BTreeMap<(u32, Vec<u8>), Vec<u8>>,
    globals: BTreeMap<Vec<u8>, VersionList>,
    needs: BTreeSet<Vec<u8>>,
    sequences: BTreeMap<u64, Vec<u8>>,
}

/// Reads the folder's raw lanes straight from the store.
fn raw_state(db: &Instance) -> RawState {
    db.store()
        .read(|t| {
            let mut folder_idx = None;
            t.for_each(&KeyRange::prefix(&[key::KEY_TYPE_FOLDER_IDX]), &mut |k, v| {
                if v == FOLDER.as_bytes() {
                    folder_idx = Some(u32::from_be_bytes(k[1..5].try_into().unwrap()));
                }
                Ok(true)
            })?;
            let folder_idx = folder_idx.expect("folder index allocated");

            let mut devices = BTreeMap::new();
            t.for_each(&KeyRange::prefix(&[key::KEY_TYPE_DEVICE_IDX]), &mut |k, v| {
                let idx = u32::from_be_bytes(k[1..5].try_into().unwrap());
                devices.insert(idx, DeviceId::from_bytes(v).unwrap());
                Ok(true)
            })?;

            let mut device_files = BTreeMap::new();
            let prefix = key::device_folder_prefix(folder_idx);
            t.for_each(&KeyRange::prefix(&prefix), &mut |k, _| {
                device_files
                    .insert((key::device_key_device(k), key::device_key_name(k).to_vec()), k.to_vec());
                Ok(true)
            })?;

            let mut globals = BTreeMap::new();
            let prefix = key::folder_prefix(key::KEY_TYPE_GLOBAL, folder_idx);
            t.for_each(&KeyRange::prefix(&prefix), &mut |k, v| {
                globals.insert(key::global_key_name(k).to_vec(), VersionList::decode(v).unwrap());
                Ok(true)
            })?;

            let mut needs = BTreeSet::new();
            let prefix = key::folder_prefix(key::KEY_TYPE_NEED, folder_idx);
            t.for_each(&KeyRange::prefix(&prefix), &mut |k, _| {
                needs.insert(key::global_key_name(k).to_vec());
                Ok(true)
            })?;

            let mut sequences = BTreeMap::new();
            let prefix = key::folder_prefix(key::KEY_TYPE_SEQUENCE, folder_idx);
            t.for_each(&KeyRange::prefix(&prefix), &mut |k, v| {
                sequences.insert(key::sequence_key_sequence(k), v.to_vec());
                Ok(true)
            })?;

            Ok(RawState { folder_idx, devices, device_files, globals, needs, sequences })
        })
        .unwrap()
}

fn assert_invariants(db: &Arc<Instance>, set: &FileSet) {
    let state = raw_state(db);
    let local_idx = state
        .devices
        .iter()
        .find(|(_, d)| **d == DeviceId::LOCAL)
        .map(|(i, _)| *i)
        .expect("local device indexed");

    // Every version list is non-empty and its head has a backing record.
    for (name, vl) in &state.globals {
        assert!(!vl.is_empty(), "empty version list stored for {name:?}");
        let head = &vl.versions[0];
        let head_idx = state
            .devices
            .iter()
            .find(|(_, d)| *d == &head.device)
            .map(|(i, _)| *i)
            .expect("head device indexed");
        assert!(
            state.device_files.contains_key(&(head_idx, name.clone())),
            "global head for {:?} has no device record",
            String::from_utf8_lossy(name),
        );
    }

    // The need lane matches the need predicate over the globals.
    for (name, vl) in &state.globals {
        let global = set
            .get_global(std::str::from_utf8(name).unwrap())
            .unwrap()
            .expect("global record resolvable");
        let local_fv = vl.get(&DeviceId::LOCAL);
        let needed = !global.is_invalid()
            && !(global.deleted && local_fv.is_none())
            && !local_fv.map(|fv| fv.version.equal(&global.version)).unwrap_or(false);
        assert_eq!(
            state.needs.contains(name),
            needed,
            "need marker mismatch for {:?}",
            String::from_utf8_lossy(name),
        );
    }
    for name in &state.needs {
        assert!(state.globals.contains_key(name), "need marker without global entry");
    }

    // Local records and sequence rows are in bijection.
    let local_files: BTreeSet<Vec<u8>> = state
        .device_files
        .iter()
        .filter(|((idx, _), _)| *idx == local_idx)
        .map(|(_, full_key)| full_key.clone())
        .collect();
    let sequence_targets: BTreeSet<Vec<u8>> = state.sequences.values().cloned().collect();
    assert_eq!(local_files, sequence_targets, "sequence lane out of step");
    assert_eq!(state.sequences.len(), local_files.len());

    // Recounting from the store equals the incrementally maintained
    // counters.
    let meta_key = {
        let mut buf = Vec::new();
        key::folder_meta_key_into(&mut buf, state.folder_idx);
        buf
    };
    let (local_before, global_before) = (set.local_size(), set.global_size());
    db.store()
        .without(|t| {
            use findex::Writer;
            t.delete(&meta_key)
        })
        .unwrap();
    let recounted = FileSet::new(FOLDER, db.clone()).unwrap();
    assert_eq!(recounted.local_size(), local_before, "local counters drifted");
    assert_eq!(recounted.global_size(), global_before, "global counters drifted");
}

#[test]
fn invariants_hold_under_mixed_workload() {
    let (_dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let (a, b) = (remote_a(), remote_b());

    set.update(
        &local,
        vec![
            file("docs/readme", 10, &[(local, 1)]),
            file("docs/guide", 20, &[(local, 1)]),
            file("src/main", 30, &[(local, 1)]),
        ],
    )
    .unwrap();
    set.update(
        &a,
        vec![
            file("docs/readme", 12, &[(local, 1), (a, 1)]),
            file("pictures/cat", 99, &[(a, 1)]),
            deleted("src/main", &[(local, 1), (a, 1)]),
        ],
    )
    .unwrap();
    set.update(
        &b,
        vec![
            file("docs/readme", 12, &[(local, 1), (a, 1)]),
            file("docs/guide", 21, &[(b, 7)]),
        ],
    )
    .unwrap();
    // The guide's head refreshes its own announcement while staying the
    // head.
    set.update(&b, vec![file("docs/guide", 25, &[(b, 8)])]).unwrap();
    // Conflicting concurrent change on docs/guide from the local side.
    set.update(&local, vec![file("docs/guide", 22, &[(local, 2)])]).unwrap();
    // An ignored file only we know about.
    let mut ignored = file("junk/tmp", 1, &[(local, 1)]);
    ignored.local_flags = local_flags::IGNORED;
    set.update(&local, vec![ignored]).unwrap();
    // A remote disappears entirely.
    set.update(&a, vec![file("pictures/dog", 5, &[(a, 2)])]).unwrap();
    set.drop_device(&a).unwrap();
    // And the local side deletes something.
    set.update(&local, vec![deleted("docs/readme", &[(local, 2)])]).unwrap();

    assert_invariants(&db, &set);
}

#[test]
fn invariants_hold_after_simple_converged_state() {
    let (_dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    let shared = vec![
        file("a", 1, &[(local, 1)]),
        file("b", 2, &[(local, 1)]),
    ];
    set.update(&local, shared.clone()).unwrap();
    set.update(&r, shared).unwrap();

    assert_invariants(&db, &set);
}

#[test]
fn metadata_recount_matches_after_reopen() {
    let (dir, db, set) = setup();
    let local = DeviceId::LOCAL;
    let r = remote_a();

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    set.update(&r, vec![file("a", 20, &[(local, 1), (r, 1)])]).unwrap();
    let local_before = set.local_size();
    let global_before = set.global_size();
    let seq_before = set.sequence(&local);

    drop(set);
    drop(db);

    let db = Instance::open(dir.path()).unwrap();
    let set = FileSet::new(FOLDER, db).unwrap();
    assert_eq!(set.local_size(), local_before);
    assert_eq!(set.global_size(), global_before);
    assert_eq!(set.sequence(&local), seq_before);
}

#[test]
fn get_returns_none_for_unknown_names_and_devices() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    assert!(set.get(&local, "nope").unwrap().is_none());
    assert!(set.get(&remote_b(), "nope").unwrap().is_none());
    assert!(set.get_global("nope").unwrap().is_none());
    assert!(set.availability("nope").unwrap().is_empty());

    set.update(&local, vec![file("a", 10, &[(local, 1)])]).unwrap();
    let got = set.get(&local, "a").unwrap().unwrap();
    assert_eq!(got.size, 10);
    assert_eq!(got.blocks.len(), 1);
    let got = set.get_global_truncated("a").unwrap().unwrap();
    assert_eq!(got.size, 10);
}

#[test]
fn directories_and_symlinks_count_by_kind() {
    let (_dir, _db, set) = setup();
    let local = DeviceId::LOCAL;

    let mut d = file("dir", 0, &[(local, 1)]);
    d.file_type = FileType::Directory;
    d.blocks.clear();
    let mut l = file("link", 0, &[(local, 1)]);
    l.file_type = FileType::Symlink;
    l.blocks.clear();
    set.update(&local, vec![d, l]).unwrap();

    let counts = set.local_size();
    assert_eq!(counts.directories, 1);
    assert_eq!(counts.symlinks, 1);
    assert_eq!(counts.files, 0);
}
