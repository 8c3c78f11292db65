//! End-to-end engine tests against local storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lsm_remote::{DB, Options, ReadOptions, WriteBatch, WriteOptions};
use tempfile::tempdir;

fn small_opts() -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options {
        write_buffer_size: 32 * 1024,
        max_file_size: 32 * 1024,
        l0_compaction_trigger: 2,
        ..Options::default()
    }
}

#[test]
fn batched_writes_apply_atomically_in_order() {
    let dir = tempdir().unwrap();
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let w = WriteOptions::default();
    let r = ReadOptions::new();

    let mut batch = WriteBatch::new();
    batch.put(b"foo", b"a");
    batch.put(b"bar", b"b");
    batch.put(b"box", b"c");
    let mut follow_up = WriteBatch::new();
    follow_up.delete(b"bar");
    batch.append(&follow_up);
    db.write(&w, batch).unwrap();

    assert_eq!(db.get(&r, b"foo").unwrap(), Some(b"a".to_vec()));
    assert_eq!(db.get(&r, b"box").unwrap(), Some(b"c".to_vec()));
    // The delete was appended after the put of the same key, so it wins.
    assert_eq!(db.get(&r, b"bar").unwrap(), None);
}

#[test]
fn data_survives_flush_and_restart() {
    let dir = tempdir().unwrap();
    let sync = WriteOptions { sync: true };
    {
        let db = DB::open(small_opts(), dir.path()).unwrap();
        for i in 0..500 {
            db.put(&sync, key(i).as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        db.flush().unwrap();
        // These stay in the WAL only.
        db.put(&sync, b"wal-only", b"still-here").unwrap();
    }
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let r = ReadOptions::new();
    for i in (0..500).step_by(17) {
        assert_eq!(
            db.get(&r, key(i).as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "missing key {i} after restart"
        );
    }
    assert_eq!(db.get(&r, b"wal-only").unwrap(), Some(b"still-here".to_vec()));
}

#[test]
fn overwrites_and_deletes_converge_under_compaction() {
    let dir = tempdir().unwrap();
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let w = WriteOptions::default();
    let r = ReadOptions::new();

    for round in 0..3 {
        for i in 0..300 {
            db.put(&w, key(i).as_bytes(), format!("round-{round}").as_bytes())
                .unwrap();
        }
        db.flush().unwrap();
    }
    for i in (0..300).step_by(2) {
        db.delete(&w, key(i).as_bytes()).unwrap();
    }
    db.compact_range(None, None).unwrap();

    for i in 0..300 {
        let got = db.get(&r, key(i).as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "deleted key {i} resurfaced");
        } else {
            assert_eq!(got, Some(b"round-2".to_vec()), "key {i} lost an overwrite");
        }
    }
    // Everything merged below level 0.
    assert_eq!(db.num_files_at_level(0), 0);
}

#[test]
fn compact_range_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let w = WriteOptions::default();

    for i in 0..200 {
        db.put(&w, key(i).as_bytes(), b"v").unwrap();
    }
    db.compact_range(None, None).unwrap();
    let files_after_first: Vec<usize> = (0..7).map(|l| db.num_files_at_level(l)).collect();
    db.compact_range(None, None).unwrap();
    let files_after_second: Vec<usize> = (0..7).map(|l| db.num_files_at_level(l)).collect();

    // Files may settle one level deeper, but contents are unchanged.
    assert!(files_after_first.iter().sum::<usize>() > 0);
    assert!(files_after_second.iter().sum::<usize>() > 0);
    let r = ReadOptions::new();
    for i in (0..200).step_by(13) {
        assert_eq!(db.get(&r, key(i).as_bytes()).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn snapshot_isolation_across_flush_and_compaction() {
    let dir = tempdir().unwrap();
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let w = WriteOptions::default();

    for i in 0..100 {
        db.put(&w, key(i).as_bytes(), b"before").unwrap();
    }
    let snap = db.snapshot();

    for i in 0..100 {
        db.put(&w, key(i).as_bytes(), b"after").unwrap();
    }
    for i in (0..100).step_by(3) {
        db.delete(&w, key(i).as_bytes()).unwrap();
    }
    db.flush().unwrap();
    db.compact_range(None, None).unwrap();

    let snap_read = ReadOptions {
        snapshot: Some(snap),
        ..ReadOptions::new()
    };
    for i in (0..100).step_by(7) {
        assert_eq!(
            db.get(&snap_read, key(i).as_bytes()).unwrap(),
            Some(b"before".to_vec()),
            "snapshot lost key {i}"
        );
    }
    let r = ReadOptions::new();
    assert_eq!(db.get(&r, key(0).as_bytes()).unwrap(), None);
    assert_eq!(db.get(&r, key(1).as_bytes()).unwrap(), Some(b"after".to_vec()));
    db.release_snapshot(snap);
}

#[test]
fn iterators_stay_consistent_while_writes_continue() {
    let dir = tempdir().unwrap();
    let db = DB::open(small_opts(), dir.path()).unwrap();
    let w = WriteOptions::default();

    for i in 0..50 {
        db.put(&w, key(i).as_bytes(), b"stable").unwrap();
    }
    let mut it = db.iter(&ReadOptions::new()).unwrap();

    // Mutations after iterator creation are invisible to it.
    for i in 0..50 {
        db.put(&w, key(i).as_bytes(), b"mutated").unwrap();
    }
    db.put(&w, b"zzz-new", b"x").unwrap();

    it.seek_to_first().unwrap();
    let mut count = 0;
    while it.valid() {
        assert_eq!(it.value(), b"stable");
        it.next().unwrap();
        count += 1;
    }
    assert_eq!(count, 50);
}

#[test]
fn approximate_sizes_grow_with_data() {
    let dir = tempdir().unwrap();
    let db = DB::open(
        Options {
            write_buffer_size: 64 * 1024,
            ..Options::default()
        },
        dir.path(),
    )
    .unwrap();
    let w = WriteOptions::default();

    let value = vec![0xABu8; 100];
    for i in 0..20_000u32 {
        db.put(&w, format!("size{i:08}").as_bytes(), &value).unwrap();
    }
    db.flush().unwrap();

    let whole = (b"size00000000".as_slice(), b"size99999999".as_slice());
    let half = (b"size00000000".as_slice(), b"size00010000".as_slice());
    let empty = (b"zz-none-a".as_slice(), b"zz-none-b".as_slice());
    let sizes = db.get_approximate_sizes(&[whole, half, empty]).unwrap();

    assert!(sizes[0] > 1_000_000, "whole range too small: {}", sizes[0]);
    assert!(sizes[1] > sizes[0] / 4 && sizes[1] < sizes[0], "half range: {sizes:?}");
    assert!(sizes[2] < sizes[0] / 100, "empty range: {sizes:?}");
}

#[test]
fn concurrent_readers_and_writer() {
    let dir = tempdir().unwrap();
    let db = Arc::new(DB::open(small_opts(), dir.path()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for t in 0..4 {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        readers.push(std::thread::spawn(move || {
            let r = ReadOptions::new();
            while !stop.load(Ordering::Relaxed) {
                for i in (t..400).step_by(4) {
                    // A key is either absent or holds a full value the
                    // writer committed; never a torn mix.
                    if let Some(v) = db.get(&r, key(i).as_bytes()).unwrap() {
                        assert!(v.starts_with(b"val-"), "torn value: {v:?}");
                    }
                }
            }
        }));
    }

    let w = WriteOptions::default();
    for round in 0..20 {
        for i in 0..400 {
            db.put(&w, key(i).as_bytes(), format!("val-{round}-{i}").as_bytes())
                .unwrap();
        }
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }

    let r = ReadOptions::new();
    assert_eq!(
        db.get(&r, key(123).as_bytes()).unwrap(),
        Some(b"val-19-123".to_vec())
    );
}

#[test]
fn hostile_filter_policy_only_costs_reads() {
    // A policy that denies every probe must degrade to "no filter":
    // lookups get slower, never wrong.
    struct DenyAll;
    impl lsm_remote::FilterPolicy for DenyAll {
        fn name(&self) -> &'static str {
            "test.DenyAll"
        }
        fn create_filter(&self, _keys: &[&[u8]]) -> Vec<u8> {
            Vec::new()
        }
        fn key_may_match(&self, _key: &[u8], _filter: &[u8]) -> bool {
            false
        }
    }

    let dir = tempdir().unwrap();
    let opts = Options {
        filter_policy: Some(Arc::new(DenyAll)),
        ..small_opts()
    };
    let db = DB::open(opts, dir.path()).unwrap();
    let w = WriteOptions::default();
    for i in 0..2000 {
        db.put(&w, key(i).as_bytes(), format!("val{i}").as_bytes())
            .unwrap();
    }
    db.flush().unwrap();
    assert!(db.num_files_at_level(0) >= 1);

    let r = ReadOptions::new();
    for i in 0..2000 {
        assert_eq!(
            db.get(&r, key(i).as_bytes()).unwrap(),
            Some(format!("val{i}").into_bytes()),
            "key {i} lost to a filter that is only a hint"
        );
    }
    assert_eq!(db.get(&r, b"never-written").unwrap(), None);
}

fn key(i: usize) -> String {
    format!("key{i:06}")
}
