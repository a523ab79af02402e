use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

use findex::{BlockInfo, DeviceId, FileInfo, FileSet, Instance, Vector};

fn scan_batch(count: usize, counter: u64) -> Vec<FileInfo> {
    (0..count)
        .map(|i| FileInfo {
            name: format!("dir{:02}/file{:04}.dat", i % 16, i),
            size: 4096,
            version: Vector::from_pairs([(DeviceId::LOCAL.short_id(), counter)]),
            blocks: vec![BlockInfo {
                offset: 0,
                size: 4096,
                hash: {
                    let mut hash = vec![0u8; 32];
                    hash[..8].copy_from_slice(&(i as u64).to_be_bytes());
                    hash
                },
            }],
            ..Default::default()
        })
        .collect()
}

fn setup() -> (TempDir, Arc<Instance>, FileSet) {
    let dir = tempfile::tempdir().unwrap();
    let db = Instance::open(dir.path()).unwrap();
    let set = FileSet::new("bench", db.clone()).unwrap();
    (dir, db, set)
}

fn bench_update(c: &mut Criterion) {
    c.bench_function("update_1k_new_local_files", |b| {
        b.iter_batched(
            || {
                let env = setup();
                let files = scan_batch(1000, 1);
                (env, files)
            },
            |((_dir, _db, set), files)| set.update(&DeviceId::LOCAL, files).unwrap(),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("update_1k_unchanged_local_files", |b| {
        b.iter_batched(
            || {
                let env = setup();
                let files = scan_batch(1000, 1);
                env.2.update(&DeviceId::LOCAL, files.clone()).unwrap();
                (env, files)
            },
            |((_dir, _db, set), files)| set.update(&DeviceId::LOCAL, files).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

fn bench_need_scan(c: &mut Criterion) {
    c.bench_function("with_need_1k_files_half_behind", |b| {
        b.iter_batched(
            || {
                let env = setup();
                let remote = DeviceId([0x01; 32]);
                env.2.update(&DeviceId::LOCAL, scan_batch(1000, 1)).unwrap();
                let mut newer = scan_batch(500, 1);
                for f in &mut newer {
                    f.version = Vector::from_pairs([
                        (DeviceId::LOCAL.short_id(), 1),
                        (remote.short_id(), 1),
                    ]);
                }
                env.2.update(&remote, newer).unwrap();
                env
            },
            |(_dir, _db, set)| {
                let mut needed = 0usize;
                set.with_need(&DeviceId::LOCAL, |_| {
                    needed += 1;
                    true
                })
                .unwrap();
                assert_eq!(needed, 500);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_update, bench_need_scan);
criterion_main!(benches);
