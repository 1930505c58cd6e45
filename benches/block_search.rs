use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::tempdir;

use tickvault::{StorageConfig, Storage};

fn bench_block_search(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let cfg = StorageConfig::test(dir.path());
    let mut storage = Storage::attach(cfg).expect("attach");
    let index = storage.open("MKP", "IST", 0).expect("open");
    let key = index.writer_key();

    let t0: i64 = 1_000_000;
    let n = 6_000usize;
    let times: Vec<i64> = (0..n).map(|i| t0 + (i as i64 / 2) * 20).collect();
    let time_bytes: Vec<u8> = times.iter().flat_map(|t| t.to_le_bytes()).collect();
    let bid: Vec<u8> = (0..n as i64).flat_map(|i| i.to_le_bytes()).collect();
    let ask: Vec<u8> = (0..n as i64).flat_map(|i| (i + 1).to_le_bytes()).collect();
    let avg: Vec<u8> = (0..n).flat_map(|i| (i as f64).to_le_bytes()).collect();
    let vol: Vec<u8> = (0..n).flat_map(|i| (i as f64 * 2.0).to_le_bytes()).collect();
    index.append(key, &times, &[&time_bytes, &bid, &ask, &avg, &vol]).expect("append");

    c.bench_function("index_search_midstream", |b| {
        b.iter(|| {
            let hit = index.search(black_box(times[n / 2])).expect("search");
            black_box(hit);
        });
    });
}

criterion_group!(benches, bench_block_search);
criterion_main!(benches);
