use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::tempdir;

use tickvault::segment::{Segment, SegmentTemplate};

fn template() -> SegmentTemplate<'static> {
    SegmentTemplate { elm_max: 4, region_sizes: &[], elem_sizes: &[8], imp: b"bench-contention" }
}

fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_lease_contention");
    for &threads in &[1_usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let dir = tempdir().expect("tempdir");
            let path = Arc::new(dir.path().join("bench_lease"));
            {
                Segment::attach(&path, &template()).expect("attach");
            }
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let path = path.clone();
                        thread::spawn(move || {
                            let mut seg = Segment::attach(&path, &template()).expect("attach");
                            for _ in 0..1_000 {
                                loop {
                                    match seg.wrt_get() {
                                        Ok(()) => break,
                                        Err(_) => continue,
                                    }
                                }
                                seg.wrt_cpl().expect("cpl");
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().expect("worker");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_contention);
criterion_main!(benches);
