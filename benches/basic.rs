use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use heapalloc::{BufferSource, Config, MemAlloc, RawAlloc};

fn allocator() -> MemAlloc<BufferSource> {
    MemAlloc::with_config(BufferSource::new(64 << 20).unwrap(), Config { verbose: false })
}

fn alloc_free_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc/free sizes");

    for size in [8, 16, 32, 64, 128, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let allocator = allocator();

            b.iter(|| unsafe {
                let ptr = allocator.allocate(black_box(size)).unwrap();
                allocator.release(Some(ptr));
            });
        });
    }

    group.finish();
}

fn fragmented_first_fit(c: &mut Criterion) {
    c.bench_function("first fit over fragmented heap", |b| {
        let allocator = allocator();

        // Every other block free, none big enough for the request below.
        let ptrs: Vec<_> = (0..1000).map(|_| allocator.allocate(32).unwrap()).collect();

        for ptr in ptrs.iter().step_by(2) {
            unsafe { allocator.release(Some(*ptr)) };
        }

        b.iter(|| unsafe {
            let ptr = allocator.allocate(black_box(64)).unwrap();
            allocator.release(Some(ptr));
        });
    });
}

fn realloc_growth(c: &mut Criterion) {
    c.bench_function("realloc doubling", |b| {
        let allocator = allocator();

        b.iter(|| unsafe {
            let mut ptr = allocator.allocate(8).unwrap();

            for size in (4..14).map(|shift| 1 << shift) {
                ptr = allocator.reallocate(Some(ptr), size).unwrap().unwrap();
            }

            allocator.release(Some(ptr));
        });
    });
}

criterion_group!(benches, alloc_free_sizes, fragmented_first_fit, realloc_growth);
criterion_main!(benches);
