//! Per-CPU live-byte counters.

use core::{
  cell::Cell,
  sync::atomic::{AtomicI64, Ordering},
};

use crossbeam::utils::CachePadded;

use crate::{options::options, os};

/// Counters per heap; CPU ids are folded into this range.
pub const CPU_LIMIT: usize = 128;

thread_local! {
  /// Cached CPU id and the number of updates left before asking the OS again.
  static CPU_HINT: Cell<(u32, u32)> = const { Cell::new((0, 0)) };
}

fn cpu_hint() -> usize {
  CPU_HINT
    .try_with(|hint| {
      let (cpu, left) = hint.get();
      if left == 0 {
        let cpu = (os::cpu_id() % CPU_LIMIT) as u32;
        hint.set((cpu, options().cpu_refresh - 1));
        cpu
      } else {
        hint.set((cpu, left - 1));
        cpu
      }
    })
    .map_or_else(|_| os::cpu_id(), |cpu| cpu as usize)
    % CPU_LIMIT
}

pub struct Footprint {
  counters: [CachePadded<AtomicI64>; CPU_LIMIT],
}

impl Footprint {
  pub const fn new() -> Self {
    Self {
      counters: [const { CachePadded::new(AtomicI64::new(0)) }; CPU_LIMIT],
    }
  }

  /// Adds a signed byte delta to the counter of the CPU this thread last ran on.
  #[inline]
  pub fn add(&self, delta: i64) {
    self.counters[cpu_hint()].fetch_add(delta, Ordering::Relaxed);
  }

  /// Sum of all counters. Exact once concurrent updates stop.
  pub fn get(&self) -> i64 {
    self
      .counters
      .iter()
      .map(|c| c.load(Ordering::Relaxed))
      .sum()
  }
}

impl Default for Footprint {
  fn default() -> Self {
    Self::new()
  }
}
