//! Per-bin allocation counters, compiled in with the `stats` feature.

use core::{
  fmt,
  sync::atomic::{AtomicI64, AtomicU64, Ordering},
  time::Duration,
};
use std::time::Instant;

use spin::Once;

use crate::{
  bins::{BIN_LIMIT, bin_to_size},
  chunk,
};

static START: Once<Instant> = Once::new();

/// Remembers when the allocator first went to the OS. Called on cold paths only.
pub(crate) fn mark_start() {
  START.call_once(Instant::now);
}

fn uptime() -> Duration {
  START.get().map_or(Duration::ZERO, Instant::elapsed)
}

struct BinCounters {
  mallocs: AtomicU64,
  net: AtomicI64,
  highwater: AtomicI64,
}

impl BinCounters {
  const fn new() -> Self {
    Self {
      mallocs: AtomicU64::new(0),
      net: AtomicI64::new(0),
      highwater: AtomicI64::new(0),
    }
  }
}

pub struct Stats {
  bins: [BinCounters; BIN_LIMIT],
}

impl Stats {
  pub const fn new() -> Self {
    Self {
      bins: [const { BinCounters::new() }; BIN_LIMIT],
    }
  }

  #[inline]
  pub fn record_allocate(&self, bin: usize) {
    let c = &self.bins[bin];
    c.mallocs.fetch_add(1, Ordering::Relaxed);
    let net = c.net.fetch_add(1, Ordering::Relaxed) + 1;
    c.highwater.fetch_max(net, Ordering::Relaxed);
  }

  #[inline]
  pub fn record_free(&self, bin: usize) {
    self.bins[bin].net.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn report(&self, footprint: i64) -> StatsReport {
    let mut bins = [BinReport::default(); BIN_LIMIT];
    for (out, c) in bins.iter_mut().zip(&self.bins) {
      *out = BinReport {
        mallocs: c.mallocs.load(Ordering::Relaxed),
        net: c.net.load(Ordering::Relaxed),
        highwater: c.highwater.load(Ordering::Relaxed),
      };
    }
    StatsReport {
      bins,
      footprint,
      mapped_bytes: chunk::mapped_bytes(),
      unmapped_bytes: chunk::unmapped_bytes(),
      uptime: uptime(),
    }
  }
}

impl Default for Stats {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinReport {
  pub mallocs: u64,
  pub net: i64,
  pub highwater: i64,
}

#[derive(Clone, Debug)]
pub struct StatsReport {
  pub bins: [BinReport; BIN_LIMIT],
  pub footprint: i64,
  pub mapped_bytes: u64,
  pub unmapped_bytes: u64,
  pub uptime: Duration,
}

impl fmt::Display for StatsReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "uptime {:.3}s", self.uptime.as_secs_f64())?;
    writeln!(
      f,
      "footprint {} mapped {} unmapped {}",
      self.footprint, self.mapped_bytes, self.unmapped_bytes
    )?;
    writeln!(f, "{:>4} {:>12} {:>12} {:>10} {:>10}", "bin", "size", "mallocs", "net", "highwater")?;
    for (bin, b) in self.bins.iter().enumerate().filter(|(_, b)| b.mallocs > 0) {
      writeln!(
        f,
        "{bin:>4} {:>12} {:>12} {:>10} {:>10}",
        bin_to_size(bin),
        b.mallocs,
        b.net,
        b.highwater
      )?;
    }
    Ok(())
  }
}
