use criterion::{Criterion, criterion_group, criterion_main};

use lsm_remote::{DB, Options, ReadOptions, WriteOptions};

fn bench_writes(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = DB::open(Options::default(), dir.path()).unwrap();
    let w = WriteOptions::default();
    let value = vec![0x42u8; 100];

    let mut i = 0u64;
    c.bench_function("put_100b", |b| {
        b.iter(|| {
            db.put(&w, format!("bench{i:012}").as_bytes(), &value).unwrap();
            i += 1;
        })
    });
}

fn bench_reads(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = DB::open(Options::default(), dir.path()).unwrap();
    let w = WriteOptions::default();
    let value = vec![0x42u8; 100];
    for i in 0..10_000u64 {
        db.put(&w, format!("bench{i:012}").as_bytes(), &value).unwrap();
    }
    db.flush().unwrap();

    let r = ReadOptions::new();
    let mut i = 0u64;
    c.bench_function("get_mixed_levels", |b| {
        b.iter(|| {
            let key = format!("bench{:012}", i % 10_000);
            let _ = db.get(&r, key.as_bytes()).unwrap();
            i += 1;
        })
    });
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = DB::open(Options::default(), dir.path()).unwrap();
    let w = WriteOptions::default();
    for i in 0..10_000u64 {
        db.put(&w, format!("bench{i:012}").as_bytes(), b"v").unwrap();
    }
    db.flush().unwrap();

    c.bench_function("scan_10k", |b| {
        b.iter(|| {
            let mut it = db.iter(&ReadOptions::new()).unwrap();
            it.seek_to_first().unwrap();
            let mut n = 0usize;
            while it.valid() {
                n += 1;
                it.next().unwrap();
            }
            assert_eq!(n, 10_000);
        })
    });
}

criterion_group!(benches, bench_writes, bench_reads, bench_scan);
criterion_main!(benches);
