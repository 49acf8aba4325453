//! Lock-wrapped state transitions.
//!
//! Every mutation of shared bin metadata goes through [`atomically`] or
//! [`atomically2`]. The optional `predo` step runs before the lock is taken
//! and may only read: it warms the cache lines the transition is about to
//! write so the critical section is shorter.

use spin::Mutex;

use crate::options::options;

pub struct Lock {
  raw: Mutex<()>,
}

impl Lock {
  pub const fn new() -> Self {
    Self { raw: Mutex::new(()) }
  }

  fn addr(&self) -> usize {
    self as *const Self as usize
  }
}

impl Default for Lock {
  fn default() -> Self {
    Self::new()
  }
}

/// Runs `f` while holding `lock`, after running `predo` unlocked.
#[inline]
pub fn atomically<R>(lock: &Lock, predo: impl FnOnce(), f: impl FnOnce() -> R) -> R {
  if options().predo {
    predo();
  }
  let _guard = lock.raw.lock();
  f()
}

/// Runs `f` while holding both locks. Locks are taken in address order, so two
/// threads naming the same pair in either order cannot deadlock.
#[inline]
pub fn atomically2<R>(a: &Lock, b: &Lock, predo: impl FnOnce(), f: impl FnOnce() -> R) -> R {
  if options().predo {
    predo();
  }
  if core::ptr::eq(a, b) {
    let _guard = a.raw.lock();
    return f();
  }
  let (first, second) = if a.addr() < b.addr() { (a, b) } else { (b, a) };
  let _first = first.raw.lock();
  let _second = second.raw.lock();
  f()
}

/// Hints that `ptr`'s cache line is about to be written.
#[inline(always)]
pub fn prefetch_write<T>(ptr: *const T) {
  #[cfg(target_arch = "x86_64")]
  unsafe {
    use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
    _mm_prefetch::<_MM_HINT_T0>(ptr.cast());
  }
  #[cfg(not(target_arch = "x86_64"))]
  let _ = ptr;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
  };

  #[test]
  fn single_lock_serializes() {
    static LOCK: Lock = Lock::new();
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let handles: Vec<_> = (0..4)
      .map(|_| {
        thread::spawn(|| {
          for _ in 0..10_000 {
            atomically(
              &LOCK,
              || prefetch_write(&COUNTER),
              || {
                // A racy read-modify-write is only correct under the lock.
                let v = COUNTER.load(Ordering::Relaxed);
                COUNTER.store(v + 1, Ordering::Relaxed);
              },
            );
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(COUNTER.load(Ordering::Relaxed), 40_000);
  }

  #[test]
  fn pair_in_either_order_does_not_deadlock() {
    static A: Lock = Lock::new();
    static B: Lock = Lock::new();
    static MOVED: AtomicUsize = AtomicUsize::new(0);

    let forward = thread::spawn(|| {
      for _ in 0..10_000 {
        atomically2(&A, &B, || {}, || MOVED.fetch_add(1, Ordering::Relaxed));
      }
    });
    let backward = thread::spawn(|| {
      for _ in 0..10_000 {
        atomically2(&B, &A, || {}, || MOVED.fetch_add(1, Ordering::Relaxed));
      }
    });
    forward.join().unwrap();
    backward.join().unwrap();
    assert_eq!(MOVED.load(Ordering::Relaxed), 20_000);
  }

  #[test]
  fn same_lock_twice_is_taken_once() {
    let lock = Lock::new();
    assert_eq!(atomically2(&lock, &lock, || {}, || 7), 7);
    assert!(lock.raw.try_lock().is_some());
  }
}
