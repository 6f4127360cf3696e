//! Benchmarks for block fingerprinting and file slicing
//!
//! Characterizes FNV-1a throughput across block sizes and the cost of
//! slicing a file into fingerprinted blocks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sakaban::{fingerprint, slice_file, Block, BLOCK_SIZE};
use std::io::Write;
use tempfile::NamedTempFile;

/// Benchmark fingerprinting of in-memory data of various sizes
fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    let sizes = vec![
        ("4KB", 4 * 1024),
        ("64KB", 64 * 1024),
        ("1MB", BLOCK_SIZE),
    ];

    for (name, size) in sizes {
        let data = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(name), &data, |b, data| {
            b.iter(|| {
                let hash = fingerprint(black_box(data));
                black_box(hash);
            });
        });
    }

    group.finish();
}

/// Benchmark block construction (fingerprint computed at construction)
fn bench_block_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_construction");
    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64));

    group.bench_function("1MB", |b| {
        b.iter_with_setup(
            || vec![0x42u8; BLOCK_SIZE],
            |content| {
                let block = Block::new(black_box(content));
                black_box(block.fingerprint());
            },
        );
    });

    group.finish();
}

/// Benchmark slicing files into fingerprinted blocks
fn bench_slice_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_file");

    let sizes = vec![
        ("64KB", 64 * 1024),
        ("1MB", BLOCK_SIZE),
        ("10MB", 10 * BLOCK_SIZE),
    ];

    for (name, size) in sizes {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data = vec![0x42u8; size];
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let path = temp_file.path().to_path_buf();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(name), &path, |b, path| {
            b.iter(|| {
                let blocks = slice_file(black_box(path)).unwrap();
                black_box(blocks.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_block_construction, bench_slice_file);
criterion_main!(benches);
