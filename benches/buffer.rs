//! Throughput of the composite buffer's hot paths: pushing chunks, draining
//! them via vectored I/O slices, and advancing past a partial write.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use weir::buffer::CompositeBuf;

fn push_and_advance(chunk_size: usize, chunk_count: usize) -> usize {
    let mut buf = CompositeBuf::new();
    let chunk = bytes::Bytes::from(vec![0u8; chunk_size]);
    for _ in 0..chunk_count {
        buf.push(chunk.clone());
    }
    let mut total = 0;
    while !buf.is_empty() {
        let slices = buf.io_slices();
        let taken: usize = slices.iter().map(|s| s.len()).sum::<usize>().min(4096);
        buf.advance(taken);
        total += taken;
    }
    total
}

fn bench_push_and_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite_buf_push_and_advance");
    for chunk_count in [4usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_count), &chunk_count, |b, &chunk_count| {
            b.iter(|| black_box(push_and_advance(256, chunk_count)));
        });
    }
    group.finish();
}

fn bench_to_contiguous(c: &mut Criterion) {
    c.bench_function("composite_buf_to_contiguous_64k", |b| {
        b.iter_batched(
            || {
                let mut buf = CompositeBuf::new();
                for _ in 0..256 {
                    buf.push(bytes::Bytes::from(vec![0u8; 256]));
                }
                buf
            },
            |buf| black_box(buf.to_contiguous()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_push_and_advance, bench_to_contiguous);
criterion_main!(benches);
