use std::{
  sync::{
    Barrier,
    atomic::{AtomicBool, Ordering},
    mpsc,
  },
  thread,
};

use foliomalloc::{FIRST_LARGE_BIN, Heap, bins::BINS};
use rand::{Rng, SeedableRng, rngs::StdRng};

const THREADS: usize = 8;

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// Fills a block with a byte derived from its address so overlapping
/// allocations show up as corrupted contents.
fn stamp(ptr: *mut u8, len: usize) {
  let tag = (ptr as usize >> 3) as u8;
  unsafe { ptr.write_bytes(tag, len) };
}

fn check_stamp(ptr: *mut u8, len: usize) {
  let tag = (ptr as usize >> 3) as u8;
  for i in 0..len {
    assert_eq!(unsafe { *ptr.add(i) }, tag, "block at {ptr:?} was overwritten");
  }
}

#[test]
fn same_bin_stress_keeps_invariants() {
  init_logger();
  static HEAP: Heap = Heap::new();
  let barrier = Barrier::new(THREADS);

  thread::scope(|s| {
    for t in 0..THREADS {
      let barrier = &barrier;
      s.spawn(move || {
        let mut rng = StdRng::seed_from_u64(t as u64);
        let mut held = Vec::new();
        barrier.wait();
        for _ in 0..50_000 {
          if held.is_empty() || rng.random_bool(0.55) {
            let p = HEAP.allocate(48);
            stamp(p, 48);
            held.push(p as usize);
          } else {
            let i = rng.random_range(0..held.len());
            let p = held.swap_remove(i) as *mut u8;
            check_stamp(p, 48);
            unsafe { HEAP.free(p) };
          }
        }
        for p in held {
          check_stamp(p as *mut u8, 48);
          unsafe { HEAP.free(p as *mut u8) };
        }
      });
    }
  });

  assert_eq!(HEAP.footprint(), 0);
  assert_eq!(HEAP.bin_census(foliomalloc::size_to_bin(48)).unwrap().live, 0);
  HEAP.verify_invariants().unwrap();
}

#[test]
fn invariants_hold_while_threads_run() {
  init_logger();
  static HEAP: Heap = Heap::new();
  // One object per folio, so every free empties a folio and most of them
  // are detached and decommitted.
  let size = 4096;
  assert_eq!(BINS[foliomalloc::size_to_bin(size)].objects_per_folio, 1);
  let done = AtomicBool::new(false);

  thread::scope(|s| {
    let checker = s.spawn(|| {
      let mut checks = 0u64;
      while !done.load(Ordering::Acquire) {
        HEAP.verify_invariants().unwrap();
        checks += 1;
      }
      HEAP.verify_invariants().unwrap();
      checks + 1
    });

    let workers: Vec<_> = (0..THREADS - 2)
      .map(|t| {
        s.spawn(move || {
          let mut rng = StdRng::seed_from_u64(500 + t as u64);
          let mut held = Vec::new();
          for _ in 0..40_000 {
            if held.len() < 32 && (held.is_empty() || rng.random_bool(0.5)) {
              let p = HEAP.allocate(size);
              stamp(p, 64);
              held.push(p as usize);
            } else {
              let p = held.swap_remove(rng.random_range(0..held.len())) as *mut u8;
              check_stamp(p, 64);
              unsafe { HEAP.free(p) };
            }
          }
          for p in held {
            unsafe { HEAP.free(p as *mut u8) };
          }
        })
      })
      .collect();
    for w in workers {
      w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(checker.join().unwrap() >= 1);
  });

  assert_eq!(HEAP.footprint(), 0);
  HEAP.verify_invariants().unwrap();
}

#[test]
fn mixed_sizes_from_many_threads() {
  init_logger();
  static HEAP: Heap = Heap::new();

  thread::scope(|s| {
    for t in 0..THREADS {
      s.spawn(move || {
        let mut rng = StdRng::seed_from_u64(1000 + t as u64);
        let mut held: Vec<(usize, usize)> = Vec::new();
        for _ in 0..5_000 {
          if held.len() < 64 && rng.random_bool(0.6) {
            let size = match rng.random_range(0..10) {
              0 => rng.random_range(16_385..=300_000),
              1..=3 => rng.random_range(257..=14_272),
              _ => rng.random_range(1..=256),
            };
            let p = HEAP.allocate(size);
            assert!(!p.is_null());
            stamp(p, size.min(64));
            held.push((p as usize, size));
          } else if let Some((p, size)) = held.pop() {
            check_stamp(p as *mut u8, size.min(64));
            unsafe { HEAP.free(p as *mut u8) };
          }
        }
        for (p, _) in held {
          unsafe { HEAP.free(p as *mut u8) };
        }
      });
    }
  });

  assert_eq!(HEAP.footprint(), 0);
  HEAP.verify_invariants().unwrap();
}

#[test]
fn objects_freed_on_another_thread() {
  static HEAP: Heap = Heap::new();
  let (tx, rx) = mpsc::channel::<usize>();

  let producer = thread::spawn(move || {
    for i in 0..20_000usize {
      let size = if i % 50 == 0 { 20_000 } else { 8 + i % 500 };
      let p = HEAP.allocate(size);
      stamp(p, 8);
      tx.send(p as usize).unwrap();
    }
  });
  let consumer = thread::spawn(move || {
    for p in rx {
      check_stamp(p as *mut u8, 8);
      unsafe { HEAP.free(p as *mut u8) };
    }
  });
  producer.join().unwrap();
  consumer.join().unwrap();

  assert_eq!(HEAP.footprint(), 0);
  HEAP.verify_invariants().unwrap();
}

#[test]
fn large_lists_survive_contention() {
  static HEAP: Heap = Heap::new();
  let size = BINS[FIRST_LARGE_BIN].object_size;

  thread::scope(|s| {
    for _ in 0..THREADS {
      s.spawn(move || {
        for _ in 0..2_000 {
          let a = HEAP.allocate(size);
          let b = HEAP.allocate(size);
          assert_ne!(a, b);
          stamp(a, 64);
          stamp(b, 64);
          check_stamp(a, 64);
          check_stamp(b, 64);
          unsafe {
            HEAP.free(a);
            HEAP.free(b);
          }
        }
      });
    }
  });

  assert_eq!(HEAP.footprint(), 0);
  // Every cell handed out came back to the list.
  let free = HEAP.large_free_count(FIRST_LARGE_BIN).unwrap();
  assert_eq!(free % BINS[FIRST_LARGE_BIN].objects_per_chunk(), 0);
}
