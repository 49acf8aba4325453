use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// foliomalloc alloc/free throughput.
fn foliomalloc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = foliomalloc::allocate(size);
      black_box(ptr);
      foliomalloc::free(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Keeps a window of live objects so frees land in partially full folios.
fn foliomalloc_window(size: usize) {
  const WINDOW: usize = 256;
  let mut live = [std::ptr::null_mut::<u8>(); WINDOW];
  for i in 0..OPS as usize {
    let slot = &mut live[i % WINDOW];
    unsafe { foliomalloc::free(*slot) };
    *slot = black_box(foliomalloc::allocate(size));
  }
  for p in live {
    unsafe { foliomalloc::free(p) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("foliomalloc", size), &size, |b, &size| {
      b.iter(|| foliomalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("foliomalloc_window", size), &size, |b, &size| {
      b.iter(|| foliomalloc_window(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
