//! Runs the whole test binary, harness included, on the process-wide heap.

use std::{
  alloc::{GlobalAlloc, Layout},
  collections::HashMap,
  thread,
};

use foliomalloc::{Allocator, PAGE_SIZE};

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn collections_work() {
  let mut map = HashMap::new();
  for i in 0..10_000u64 {
    map.insert(i, format!("value {i}"));
  }
  assert_eq!(map[&4321], "value 4321");

  let mut v: Vec<u64> = Vec::new();
  for i in 0..1_000_000 {
    v.push(i);
  }
  assert_eq!(v.iter().sum::<u64>(), 999_999 * 1_000_000 / 2);
  drop(map);
  drop(v);
  foliomalloc::verify_invariants().unwrap();
}

#[test]
fn threads_allocate_and_drop() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      thread::spawn(move || {
        let strings: Vec<String> = (0..5_000).map(|i| "x".repeat((i + t) % 300)).collect();
        strings.iter().map(String::len).sum::<usize>()
      })
    })
    .collect();
  for h in handles {
    assert!(h.join().unwrap() > 0);
  }
}

#[test]
fn layout_alignment_is_honored() {
  for align in [8, 32, 128, PAGE_SIZE, 4 * PAGE_SIZE] {
    for size in [1, 40, 1000, 70_000] {
      let layout = Layout::from_size_align(size, align).unwrap();
      unsafe {
        let p = GLOBAL.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0, "size {size} align {align}");
        p.write_bytes(1, size);

        let q = GLOBAL.realloc(p, layout, size * 3);
        assert_eq!(q as usize % align, 0);
        assert_eq!(*q.add(size - 1), 1);
        GLOBAL.dealloc(q, Layout::from_size_align(size * 3, align).unwrap());
      }
    }
  }
}

#[test]
fn zeroed_layouts_read_as_zero() {
  let layout = Layout::from_size_align(3000, 16).unwrap();
  unsafe {
    let p = GLOBAL.alloc(layout);
    p.write_bytes(0xEE, 3000);
    GLOBAL.dealloc(p, layout);
    let q = GLOBAL.alloc_zeroed(layout);
    assert!((0..3000).all(|i| *q.add(i) == 0));
    GLOBAL.dealloc(q, layout);
  }
}
