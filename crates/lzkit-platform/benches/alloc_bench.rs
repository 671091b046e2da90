//! Allocator benchmarks
//!
//! Measures allocate + free round trips for every allocator variant.
//!
//! Run with: cargo bench --bench alloc_bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use lzkit_platform::alloc::{
    AlignedAllocator, Allocator, LargePagePolicy, OffsetAlignConfig, OffsetAlignedAllocator,
    PageAllocator, PageAllocatorConfig, StandardAllocator,
};

const SIZES: [usize; 4] = [64, 4096, 1 << 16, 1 << 20];

fn round_trip<A: Allocator + ?Sized>(allocator: &A, size: usize) {
    let p = allocator.allocate(black_box(size));
    assert!(!p.is_null());
    // SAFETY: `p` was just returned by `allocator`.
    unsafe {
        p.write(1);
        allocator.free(black_box(p));
    }
}

fn bench_heap(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap");
    let standard = StandardAllocator::new();
    let native = AlignedAllocator::native();
    let manual = AlignedAllocator::manual();
    let offset = OffsetAlignedAllocator::new(StandardAllocator::new(), OffsetAlignConfig::new(24, 6));

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("standard", size), &size, |b, &size| {
            b.iter(|| round_trip(&standard, size));
        });
        group.bench_with_input(BenchmarkId::new("aligned_native", size), &size, |b, &size| {
            b.iter(|| round_trip(&native, size));
        });
        group.bench_with_input(BenchmarkId::new("aligned_manual", size), &size, |b, &size| {
            b.iter(|| round_trip(&manual, size));
        });
        group.bench_with_input(BenchmarkId::new("offset_24_64", size), &size, |b, &size| {
            b.iter(|| round_trip(&offset, size));
        });
    }
    group.finish();
}

fn bench_pages(c: &mut Criterion) {
    let mut group = c.benchmark_group("pages");
    let mid = PageAllocator::mid();
    let big = PageAllocator::big();
    let plain_big = PageAllocator::new(
        PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Disabled)
            .build_unchecked(),
    )
    .unwrap();

    for size in [1 << 16, 1 << 20, 4 << 20] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("mid", size), &size, |b, &size| {
            b.iter(|| round_trip(&mid, size));
        });
        group.bench_with_input(BenchmarkId::new("big", size), &size, |b, &size| {
            b.iter(|| round_trip(&big, size));
        });
        group.bench_with_input(BenchmarkId::new("big_no_large_pages", size), &size, |b, &size| {
            b.iter(|| round_trip(&plain_big, size));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_heap, bench_pages);
criterion_main!(benches);
