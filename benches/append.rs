use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use tickvault::segment::{Segment, SegmentTemplate};

const APPENDS_PER_ITER: u64 = 10_000;

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_append");
    for &batch in &[1_u64, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let path = dir.path().join("bench_segment");
                    let template = SegmentTemplate {
                        elm_max: APPENDS_PER_ITER * 4,
                        region_sizes: &[],
                        elem_sizes: &[8, 8],
                        imp: b"bench-append",
                    };
                    let writer = Segment::attach(&path, &template).expect("attach");
                    (dir, writer)
                },
                |(_dir, mut writer)| {
                    let mut written = 0u64;
                    while written < APPENDS_PER_ITER {
                        writer.wrt_get().expect("lease");
                        let ptrs = writer.wrt_loc(batch).expect("loc");
                        unsafe {
                            for i in 0..batch {
                                (ptrs[0] as *mut u64).add(i as usize).write(black_box(i));
                                (ptrs[1] as *mut u64).add(i as usize).write(black_box(i * 2));
                            }
                        }
                        writer.wrt_don(batch).expect("don");
                        writer.wrt_cpl().expect("cpl");
                        written += batch;
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
