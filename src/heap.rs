//! The allocator instance: routes each request to the small, large or huge path.

use core::ptr::{self, NonNull, null_mut};

use crate::{
  bins::{BIN_LIMIT, BINS, BinKind, CHUNK_SIZE, SMALL_BINS, size_to_bin},
  chunk::ChunkNumber,
  chunk_table::{self, ChunkInfo},
  error::{AllocError, InvalidFree, InvariantViolation, Result},
  footprint::Footprint,
  huge::{huge_allocate, huge_free},
  large::LargeHeap,
  options::options,
  os::alloc_log,
  small::{BinCensus, SmallHeap},
};

/// A complete allocator: per-bin state for every size class plus footprint
/// counters. Chunks and their metadata index are shared by all heaps, but a
/// pointer must be freed on the heap that allocated it.
pub struct Heap {
  small: SmallHeap,
  large: LargeHeap,
  footprint: Footprint,
  #[cfg(feature = "stats")]
  stats: crate::stats::Stats,
}

impl Heap {
  pub const fn new() -> Self {
    Self {
      small: SmallHeap::new(),
      large: LargeHeap::new(),
      footprint: Footprint::new(),
      #[cfg(feature = "stats")]
      stats: crate::stats::Stats::new(),
    }
  }

  /// The smallest bin holding `size` bytes at an address aligned to `align`.
  fn bin_for(size: usize, align: usize) -> Result<usize> {
    if !align.is_power_of_two() || align > CHUNK_SIZE {
      return Err(AllocError::UnsupportedAlignment(align));
    }
    let mut bin = size_to_bin(size);
    while bin < BIN_LIMIT && BINS[bin].natural_alignment() < align {
      bin += 1;
    }
    if bin >= BIN_LIMIT {
      return Err(AllocError::SizeOverflow);
    }
    Ok(bin)
  }

  fn allocate_in(&self, bin: usize, size: usize) -> Result<NonNull<u8>> {
    let table = chunk_table::table()?;
    let ptr = match BINS[bin].kind {
      BinKind::Small => {
        let ptr = self.small.allocate(bin, table)?;
        self.footprint.add(BINS[bin].object_size as i64);
        self.check_small(bin);
        ptr
      }
      BinKind::Large => self.large.allocate(bin, size, table, &self.footprint)?,
      BinKind::Huge => huge_allocate(bin, table, &self.footprint)?,
    };
    self.record_allocate(bin);
    Ok(ptr)
  }

  #[inline(always)]
  fn record_allocate(&self, _bin: usize) {
    #[cfg(feature = "stats")]
    self.stats.record_allocate(_bin);
  }

  #[inline(always)]
  fn record_free(&self, _bin: usize) {
    #[cfg(feature = "stats")]
    self.stats.record_free(_bin);
  }

  fn check_small(&self, bin: usize) {
    if options().verify
      && let Err(violation) = self.small.verify_bin(bin)
    {
      alloc_log!(error, "heap corrupted: {violation}");
      panic!("heap corrupted: {violation}");
    }
  }

  /// Allocates at least `size` bytes. The address is aligned to the natural
  /// alignment of the chosen bin (the largest power of two dividing its
  /// object size, capped at a page).
  pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>> {
    self.try_allocate_aligned(size, 1)
  }

  /// Allocates at least `size` bytes at a multiple of `align`.
  pub fn try_allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    let bin = Self::bin_for(size, align)?;
    self.allocate_in(bin, size)
  }

  /// Allocates at least `size` bytes, or returns null.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    self.try_allocate(size).map_or(null_mut(), NonNull::as_ptr)
  }

  /// Allocates `count * size` zeroed bytes, or returns null. An overflowing
  /// product is rejected before any memory is touched.
  pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      return null_mut();
    };
    self.try_allocate_zeroed(total, 1).map_or(null_mut(), NonNull::as_ptr)
  }

  pub fn try_allocate_zeroed(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    let bin = Self::bin_for(size, align)?;
    let ptr = self.allocate_in(bin, size)?;
    // Fresh and decommitted pages already read as zero.
    let dirty = match BINS[bin].kind {
      BinKind::Small => true,
      BinKind::Large => !options().decommit,
      BinKind::Huge => false,
    };
    if dirty {
      unsafe { ptr.as_ptr().write_bytes(0, size) };
    }
    Ok(ptr)
  }

  /// Returns `ptr` to the heap, or explains why it cannot be freed. Nothing
  /// changes when an error is returned. Null is accepted.
  ///
  /// # Safety
  ///
  /// `ptr` must not be used after a successful free, and must have been
  /// allocated by this heap.
  pub unsafe fn try_free(&self, ptr: *mut u8) -> Result<(), InvalidFree> {
    if ptr.is_null() {
      return Ok(());
    }
    let addr = ptr as usize;
    let unknown = InvalidFree::UnknownChunk { ptr: addr };
    let (Some(table), Some(chunk)) = (chunk_table::existing(), ChunkNumber::containing(addr)) else {
      return Err(unknown);
    };
    let decommit = options().decommit;

    let bin = match table.get(chunk) {
      ChunkInfo::Small { bin } => {
        self.small.free(bin, chunk, addr, decommit)?;
        self.footprint.add(-(BINS[bin].object_size as i64));
        self.check_small(bin);
        bin
      }
      ChunkInfo::Large { bin } => {
        self.large.free(bin, chunk, addr, &self.footprint, decommit)?;
        bin
      }
      ChunkInfo::Huge { bin } => {
        huge_free(bin, chunk, addr, table, &self.footprint)?;
        bin
      }
      ChunkInfo::Free { .. } if addr == chunk.base() => return Err(InvalidFree::DoubleFree { ptr: addr }),
      ChunkInfo::Free { .. } | ChunkInfo::Unassigned => return Err(unknown),
    };
    self.record_free(bin);
    Ok(())
  }

  /// Returns `ptr` to the heap. Null is ignored.
  ///
  /// # Safety
  ///
  /// See [`Heap::try_free`].
  ///
  /// # Panics
  ///
  /// On pointers that are not live allocations, including double frees.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if let Err(err) = unsafe { self.try_free(ptr) } {
      alloc_log!(error, "invalid free: {err}");
      panic!("invalid free: {err}");
    }
  }

  /// The bin `ptr` was allocated from, if it is the start of a live-looking object.
  fn bin_of(ptr: *mut u8) -> Option<usize> {
    match chunk_table::lookup(ptr as usize) {
      ChunkInfo::Small { bin } | ChunkInfo::Large { bin } | ChunkInfo::Huge { bin } => Some(bin),
      ChunkInfo::Free { .. } | ChunkInfo::Unassigned => None,
    }
  }

  /// Bytes usable at `ptr`: the object size of its bin. Zero for null or
  /// foreign pointers.
  pub fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    Self::bin_of(ptr).map_or(0, |bin| BINS[bin].object_size)
  }

  /// Resizes the allocation at `ptr`, keeping its contents.
  ///
  /// Null behaves like [`Heap::allocate`]; a zero size frees `ptr` and
  /// returns null. When no new memory can be had, null is returned and `ptr`
  /// is left untouched.
  ///
  /// # Safety
  ///
  /// As for [`Heap::free`].
  pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    unsafe { self.reallocate_aligned(ptr, new_size, 1) }
  }

  /// [`Heap::reallocate`] keeping the result aligned to `align`.
  ///
  /// # Safety
  ///
  /// As for [`Heap::free`].
  pub unsafe fn reallocate_aligned(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.try_allocate_aligned(new_size, align).map_or(null_mut(), NonNull::as_ptr);
    }
    if new_size == 0 {
      unsafe { self.free(ptr) };
      return null_mut();
    }

    let Some(old_bin) = Self::bin_of(ptr) else {
      let err = InvalidFree::UnknownChunk { ptr: ptr as usize };
      alloc_log!(error, "invalid reallocate: {err}");
      panic!("invalid reallocate: {err}");
    };
    let Ok(new_bin) = Self::bin_for(new_size, align) else {
      return null_mut();
    };
    if new_bin == old_bin {
      if let BinKind::Large = BINS[old_bin].kind
        && let Some(chunk) = ChunkNumber::containing(ptr as usize)
        && let Err(err) = self.large.recharge(old_bin, chunk, ptr as usize, new_size, &self.footprint)
      {
        alloc_log!(error, "invalid reallocate: {err}");
        panic!("invalid reallocate: {err}");
      }
      return ptr;
    }

    let Ok(new_ptr) = self.allocate_in(new_bin, new_size) else {
      return null_mut();
    };
    let keep = BINS[old_bin].object_size.min(new_size);
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), keep);
      self.free(ptr);
    }
    new_ptr.as_ptr()
  }

  /// Approximate bytes currently allocated from this heap.
  pub fn footprint(&self) -> i64 {
    self.footprint.get()
  }

  /// Checks every small bin's bucket structure and conservation law.
  pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
    (0..SMALL_BINS).try_for_each(|bin| self.small.verify_bin(bin))
  }

  /// Occupancy summary of small bin `bin`, `None` for other bins.
  pub fn bin_census(&self, bin: usize) -> Option<BinCensus> {
    (bin < SMALL_BINS).then(|| self.small.census(bin))
  }

  /// Objects waiting on large bin `bin`'s free list, `None` for other bins.
  pub fn large_free_count(&self, bin: usize) -> Option<usize> {
    matches!(BINS.get(bin)?.kind, BinKind::Large).then(|| self.large.free_count(bin))
  }

  /// Decommits the empty folios small bins keep committed. Returns the number
  /// of bytes given back.
  pub fn purge(&self) -> usize {
    let released = self.small.purge();
    alloc_log!(debug, "purge released {released} bytes");
    released
  }

  #[cfg(feature = "stats")]
  pub fn stats(&self) -> crate::stats::StatsReport {
    self.stats.report(self.footprint())
  }

  #[cfg(feature = "stats")]
  pub fn log_stats(&self) {
    let report = self.stats();
    alloc_log!(info, "{report}");
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}
