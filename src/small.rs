//! Small-object allocator: fullest-folio-first placement over occupancy buckets.
//!
//! A small chunk starts with one [`FolioHeader`] per folio, followed by the
//! folios themselves. Every folio of a bin that has a free slot sits in
//! exactly one occupancy bucket: bucket `k` (for `1 <= k <= cap`) holds folios
//! with `k` free slots, and bucket `cap + 1` holds empty folios whose pages
//! were decommitted (or never touched). Full folios are in no bucket.
//!
//! `fullest` caches the lowest nonempty bucket, with `cap + 1` reported as
//! `cap`, or 0 when every folio is full. Allocation always serves that bucket,
//! which keeps objects packed into as few folios as possible.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed},
};

use crossbeam::utils::CachePadded;

use crate::{
  bins::{
    BINS, BUCKET_OFFSETS, BinInfo, FOLIO_BITMAP_WORDS, FOLIO_HEADER_SIZE, SMALL_BINS,
    TOTAL_BUCKETS, bucket_count,
  },
  chunk::{ChunkNumber, allocate_chunks},
  chunk_table::{ChunkInfo, ChunkTable},
  error::{InvalidFree, InvariantViolation, Result},
  lock::{Lock, atomically, prefetch_write},
  os::{self, alloc_log},
};

// =============================================================================
// Folios
// =============================================================================

/// Per-folio bookkeeping, stored in the header pages of its chunk.
/// Only touched while holding the bin lock; predo steps read it relaxed.
#[repr(C, align(64))]
struct FolioHeader {
  next: AtomicU64,
  prev: AtomicU64,
  /// Bit set = slot in use.
  inuse: [AtomicU64; FOLIO_BITMAP_WORDS],
}

const _: () = assert!(size_of::<FolioHeader>() == FOLIO_HEADER_SIZE);

/// A folio named by its chunk and its index inside the chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct FolioRef {
  chunk: ChunkNumber,
  index: u32,
}

/// Encoded "no folio". Zeroed header pages therefore start with empty links.
const NO_FOLIO: u64 = 0;

impl FolioRef {
  #[inline(always)]
  fn pack(self) -> u64 {
    ((self.chunk.index() as u64) << 16 | self.index as u64) + 1
  }

  #[inline(always)]
  fn unpack(raw: u64) -> Option<Self> {
    let v = raw.checked_sub(1)?;
    Some(FolioRef {
      chunk: ChunkNumber::from_index((v >> 16) as usize)?,
      index: (v & 0xFFFF) as u32,
    })
  }

  #[inline(always)]
  fn header(self) -> &'static FolioHeader {
    let addr = self.chunk.base() + self.index as usize * FOLIO_HEADER_SIZE;
    // Header pages of small chunks are mapped for the life of the process.
    unsafe { &*(addr as *const FolioHeader) }
  }

  #[inline(always)]
  fn objects_base(self, info: &BinInfo) -> usize {
    self.chunk.base() + info.overhead_bytes() + self.index as usize * info.folio_size
  }
}

impl FolioHeader {
  fn used(&self) -> usize {
    self.inuse.iter().map(|w| w.load(Relaxed).count_ones() as usize).sum()
  }

  /// Marks the lowest clear slot below `cap` in use.
  fn claim_lowest(&self, cap: usize) -> Option<usize> {
    for (w, word) in self.inuse.iter().enumerate().take(cap.div_ceil(64)) {
      let bits = word.load(Relaxed);
      if bits == u64::MAX {
        continue;
      }
      let bit = (!bits).trailing_zeros() as usize;
      let slot = w * 64 + bit;
      if slot >= cap {
        return None;
      }
      word.store(bits | 1 << bit, Relaxed);
      return Some(slot);
    }
    None
  }
}

// =============================================================================
// Bins
// =============================================================================

struct SmallBin {
  lock: Lock,
  fullest: AtomicU32,
  /// Folios ever added to this bin.
  folios: AtomicU64,
  /// Empty folios between "left bucket cap" and "entered bucket cap + 1".
  detached: AtomicU64,
  live: AtomicU64,
}

impl SmallBin {
  const fn new() -> Self {
    Self {
      lock: Lock::new(),
      fullest: AtomicU32::new(0),
      folios: AtomicU64::new(0),
      detached: AtomicU64::new(0),
      live: AtomicU64::new(0),
    }
  }
}

/// A point-in-time view of one bin, for tests and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinCensus {
  pub fullest: usize,
  pub folios: u64,
  pub live: u64,
  /// Empty folios still backed by physical pages (bucket `cap`).
  pub empty_committed: usize,
  /// Empty folios in bucket `cap + 1`.
  pub empty_decommitted: usize,
}

/// What a free did to its folio.
enum Released {
  Listed,
  /// The folio became empty while another empty folio was committed. It is in
  /// no bucket until its pages are decommitted and it is attached to `cap + 1`.
  Detached,
}

/// One bin's state together with its slice of the bucket array.
struct Bin<'a> {
  number: usize,
  info: &'static BinInfo,
  cap: usize,
  state: &'a SmallBin,
  buckets: &'a [AtomicU64],
}

impl Bin<'_> {
  #[inline]
  fn head(&self, bucket: usize) -> Option<FolioRef> {
    FolioRef::unpack(self.buckets[bucket].load(Relaxed))
  }

  #[inline]
  fn is_empty(&self, bucket: usize) -> bool {
    self.buckets[bucket].load(Relaxed) == NO_FOLIO
  }

  fn push_front(&self, bucket: usize, folio: FolioRef) {
    let header = folio.header();
    let old = self.buckets[bucket].load(Relaxed);
    header.next.store(old, Relaxed);
    header.prev.store(NO_FOLIO, Relaxed);
    if let Some(old) = FolioRef::unpack(old) {
      old.header().prev.store(folio.pack(), Relaxed);
    }
    self.buckets[bucket].store(folio.pack(), Relaxed);
  }

  fn unlink(&self, bucket: usize, folio: FolioRef) {
    let header = folio.header();
    let next = header.next.load(Relaxed);
    let prev = header.prev.load(Relaxed);
    match FolioRef::unpack(prev) {
      Some(p) => p.header().next.store(next, Relaxed),
      None => self.buckets[bucket].store(next, Relaxed),
    }
    if let Some(n) = FolioRef::unpack(next) {
      n.header().prev.store(prev, Relaxed);
    }
    header.next.store(NO_FOLIO, Relaxed);
    header.prev.store(NO_FOLIO, Relaxed);
  }

  /// Lowest nonempty bucket in `1..=cap + 1`, reporting `cap + 1` as `cap`.
  fn lowest_nonempty(&self) -> usize {
    (1..=self.cap + 1)
      .find(|&k| !self.is_empty(k))
      .map_or(0, |k| k.min(self.cap))
  }

  fn prefetch_fullest(&self) {
    let f = self.state.fullest.load(Relaxed) as usize;
    prefetch_write(&self.state.fullest);
    if f > 0 {
      let slot = &self.buckets[f];
      prefetch_write(slot);
      if let Some(folio) = FolioRef::unpack(slot.load(Relaxed)) {
        prefetch_write(folio.header());
      }
    }
  }

  // Locked transitions ---------------------------------------------------------

  /// Links a fresh chain of folios into bucket `cap + 1`.
  fn splice_fresh(&self, first: FolioRef, last: FolioRef, count: u64) {
    let empty = &self.buckets[self.cap + 1];
    let old = empty.load(Relaxed);
    last.header().next.store(old, Relaxed);
    if let Some(old) = FolioRef::unpack(old) {
      old.header().prev.store(last.pack(), Relaxed);
    }
    empty.store(first.pack(), Relaxed);
    self.state.folios.fetch_add(count, Relaxed);
    if self.state.fullest.load(Relaxed) == 0 {
      self.state.fullest.store(self.cap as u32, Relaxed);
    }
  }

  fn take_object(&self) -> Option<usize> {
    let fullest = self.state.fullest.load(Relaxed) as usize;
    if fullest == 0 {
      return None;
    }
    let source = if fullest == self.cap && self.is_empty(self.cap) { self.cap + 1 } else { fullest };
    let Some(folio) = self.head(source) else {
      // Only reachable if the cache went stale; repair it and let the caller retry.
      self.state.fullest.store(self.lowest_nonempty() as u32, Relaxed);
      return None;
    };
    self.unlink(source, folio);
    let slot = folio.header().claim_lowest(self.cap);

    let free = fullest - 1;
    if free > 0 {
      self.push_front(free, folio);
      self.state.fullest.store(free as u32, Relaxed);
    } else {
      self.state.fullest.store(self.lowest_nonempty() as u32, Relaxed);
    }

    let slot = slot?;
    self.state.live.fetch_add(1, Relaxed);
    Some(folio.objects_base(self.info) + slot * self.info.object_size)
  }

  fn release_object(
    &self,
    folio: FolioRef,
    slot: usize,
    ptr: usize,
    decommit: bool,
  ) -> Result<Released, InvalidFree> {
    let header = folio.header();
    let word = &header.inuse[slot / 64];
    let mask = 1u64 << (slot % 64);
    let bits = word.load(Relaxed);
    if bits & mask == 0 {
      return Err(InvalidFree::DoubleFree { ptr });
    }

    let old_free = self.cap - header.used();
    word.store(bits & !mask, Relaxed);
    let new_free = old_free + 1;
    if old_free > 0 {
      self.unlink(old_free, folio);
    }
    self.state.live.fetch_sub(1, Relaxed);

    // Keep one empty folio committed per bin before giving pages back.
    let detach = decommit && new_free == self.cap && !self.is_empty(self.cap);
    if detach {
      self.state.detached.fetch_add(1, Relaxed);
    } else {
      self.push_front(new_free, folio);
    }

    let fullest = self.state.fullest.load(Relaxed) as usize;
    if fullest == 0 || new_free < fullest || (fullest == old_free && self.is_empty(old_free)) {
      self.state.fullest.store(new_free as u32, Relaxed);
    }

    Ok(if detach { Released::Detached } else { Released::Listed })
  }

  fn attach_decommitted(&self, folio: FolioRef) {
    self.push_front(self.cap + 1, folio);
    self.state.detached.fetch_sub(1, Relaxed);
    if self.state.fullest.load(Relaxed) == 0 {
      self.state.fullest.store(self.cap as u32, Relaxed);
    }
  }

  fn detach_committed_empty(&self) -> Option<FolioRef> {
    let folio = self.head(self.cap)?;
    self.unlink(self.cap, folio);
    self.state.detached.fetch_add(1, Relaxed);
    if self.state.fullest.load(Relaxed) as usize == self.cap {
      self.state.fullest.store(self.lowest_nonempty() as u32, Relaxed);
    }
    Some(folio)
  }

  fn census(&self) -> BinCensus {
    let count = |bucket: usize| {
      let mut n = 0;
      let mut cursor = self.head(bucket);
      while let Some(folio) = cursor {
        n += 1;
        cursor = FolioRef::unpack(folio.header().next.load(Relaxed));
      }
      n
    };
    BinCensus {
      fullest: self.state.fullest.load(Relaxed) as usize,
      folios: self.state.folios.load(Relaxed),
      live: self.state.live.load(Relaxed),
      empty_committed: count(self.cap),
      empty_decommitted: count(self.cap + 1),
    }
  }

  fn verify(&self) -> Result<(), InvariantViolation> {
    let bin = self.number;
    let folios = self.state.folios.load(Relaxed);
    let mut listed = 0u64;
    let mut counted = 0u64;

    for bucket in 0..=self.cap + 1 {
      let mut prev = NO_FOLIO;
      let mut cursor = self.buckets[bucket].load(Relaxed);
      while let Some(folio) = FolioRef::unpack(cursor) {
        let header = folio.header();
        if header.prev.load(Relaxed) != prev || listed >= folios {
          return Err(InvariantViolation::BrokenLink { bin, bucket, folio: cursor });
        }
        let free = self.cap - header.used();
        if bucket == 0 || free != bucket.min(self.cap) {
          return Err(InvariantViolation::WrongBucket { bin, bucket, folio: cursor, free });
        }
        listed += 1;
        counted += (self.cap - free) as u64;
        prev = cursor;
        cursor = header.next.load(Relaxed);
      }
    }

    let recorded = self.state.fullest.load(Relaxed) as usize;
    let actual = self.lowest_nonempty();
    if recorded != actual {
      return Err(InvariantViolation::StaleFullest { bin, recorded, actual });
    }

    let detached = self.state.detached.load(Relaxed);
    counted += folios.saturating_sub(listed + detached) * self.cap as u64;
    let live = self.state.live.load(Relaxed);
    if live != counted {
      return Err(InvariantViolation::Conservation { bin, live, counted });
    }
    Ok(())
  }
}

// =============================================================================
// Small heap
// =============================================================================

pub struct SmallHeap {
  bins: [CachePadded<SmallBin>; SMALL_BINS],
  buckets: [AtomicU64; TOTAL_BUCKETS],
}

impl SmallHeap {
  pub const fn new() -> Self {
    Self {
      bins: [const { CachePadded::new(SmallBin::new()) }; SMALL_BINS],
      buckets: [const { AtomicU64::new(NO_FOLIO) }; TOTAL_BUCKETS],
    }
  }

  fn bin(&self, bin: usize) -> Bin<'_> {
    let first = BUCKET_OFFSETS[bin];
    let info = &BINS[bin];
    Bin {
      number: bin,
      info,
      cap: info.objects_per_folio as usize,
      state: &self.bins[bin],
      buckets: &self.buckets[first..first + bucket_count(bin)],
    }
  }

  /// Maps a chunk for `b`, carves it into folios and makes them available.
  fn add_chunk(&self, b: &Bin<'_>, table: &ChunkTable) -> Result<()> {
    let chunk = allocate_chunks(1)?;
    let count = b.info.folios_per_chunk;
    let folio = |index| FolioRef { chunk, index };

    // Fresh pages are zero: bitmaps are clear and links read as "none".
    for index in 0..count {
      let header = folio(index).header();
      if index + 1 < count {
        header.next.store(folio(index + 1).pack(), Relaxed);
      }
      if index > 0 {
        header.prev.store(folio(index - 1).pack(), Relaxed);
      }
    }
    table.set(chunk, ChunkInfo::Small { bin: b.number });

    atomically(
      &b.state.lock,
      || prefetch_write(&b.buckets[b.cap + 1]),
      || b.splice_fresh(folio(0), folio(count - 1), count as u64),
    );
    alloc_log!(trace, "small bin {} grew by {count} folios", b.number);
    Ok(())
  }

  /// Allocates one object of small bin `bin`.
  pub fn allocate(&self, bin: usize, table: &ChunkTable) -> Result<NonNull<u8>> {
    let b = self.bin(bin);
    loop {
      if b.state.fullest.load(Relaxed) == 0 {
        self.add_chunk(&b, table)?;
      }
      let taken = atomically(&b.state.lock, || b.prefetch_fullest(), || b.take_object());
      if let Some(ptr) = taken.and_then(|addr| NonNull::new(addr as *mut u8)) {
        return Ok(ptr);
      }
    }
  }

  /// Frees the object at `ptr`, which lies in a chunk stamped with small bin `bin`.
  ///
  /// Pointers that are not the start of an object, and objects that are
  /// already free, are rejected before any state changes.
  pub fn free(&self, bin: usize, chunk: ChunkNumber, ptr: usize, decommit: bool) -> Result<(), InvalidFree> {
    let b = self.bin(bin);
    let info = b.info;
    let not_an_object = InvalidFree::NotAnObject { ptr };

    let offset = (ptr - chunk.base())
      .checked_sub(info.overhead_bytes())
      .ok_or(not_an_object)?;
    let index = info.folio_index(offset);
    if index >= info.folios_per_chunk as usize {
      return Err(not_an_object);
    }
    let in_folio = offset - index * info.folio_size;
    let slot = info.object_index(in_folio);
    if slot >= b.cap || slot * info.object_size != in_folio {
      return Err(not_an_object);
    }
    let folio = FolioRef { chunk, index: index as u32 };

    let released = atomically(
      &b.state.lock,
      || {
        prefetch_write(folio.header());
        prefetch_write(&b.state.fullest);
      },
      || b.release_object(folio, slot, ptr, decommit),
    )?;

    if let Released::Detached = released {
      self.decommit_folio(&b, folio);
    }
    Ok(())
  }

  /// Gives a detached folio's pages back and files it under bucket `cap + 1`.
  fn decommit_folio(&self, b: &Bin<'_>, folio: FolioRef) {
    let base = folio.objects_base(b.info);
    if let Some(ptr) = NonNull::new(base as *mut u8)
      && let Err(err) = unsafe { os::decommit(ptr, b.info.folio_size) }
    {
      alloc_log!(warn, "madvise of folio at {base:#x} failed: {err}");
    }
    atomically(
      &b.state.lock,
      || prefetch_write(&b.buckets[b.cap + 1]),
      || b.attach_decommitted(folio),
    );
  }

  /// Decommits every empty folio kept committed for hysteresis. Returns the
  /// number of bytes advised away.
  pub fn purge(&self) -> usize {
    let mut released = 0;
    for bin in 0..SMALL_BINS {
      let b = self.bin(bin);
      while let Some(folio) = atomically(&b.state.lock, || {}, || b.detach_committed_empty()) {
        self.decommit_folio(&b, folio);
        released += b.info.folio_size;
      }
    }
    released
  }

  /// Checks bucket membership, links, `fullest` and the conservation law of `bin`.
  pub fn verify_bin(&self, bin: usize) -> Result<(), InvariantViolation> {
    let b = self.bin(bin);
    atomically(&b.state.lock, || {}, || b.verify())
  }

  pub fn census(&self, bin: usize) -> BinCensus {
    let b = self.bin(bin);
    atomically(&b.state.lock, || {}, || b.census())
  }
}

impl Default for SmallHeap {
  fn default() -> Self {
    Self::new()
  }
}
