#![allow(clippy::missing_safety_doc)]
//! A concurrent size-class allocator.
//!
//! Requests are rounded up to one of a fixed set of bins. Small bins carve
//! 2MB chunks into folios and always allocate from the fullest folio that
//! still has room; large bins keep page-granular objects on lock-free lists
//! threaded through a header page; huge requests get whole chunk runs.
//! Physical memory of idle folios and freed large objects is given back with
//! `madvise`, and a per-CPU footprint counter tracks live bytes.
//!
//! [`Heap`] is the allocator itself. The free functions and [`Allocator`]
//! operate on one process-wide heap.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{NonNull, null_mut},
};

pub mod bins;
#[cfg(feature = "c_api")]
pub mod c_api;
pub mod chunk;
pub mod chunk_table;
pub mod error;
pub mod footprint;
mod heap;
mod huge;
mod large;
pub mod lock;
pub mod options;
mod os;
mod small;
#[cfg(feature = "stats")]
pub mod stats;

pub use bins::{BIN_LIMIT, CHUNK_SIZE, FIRST_HUGE_BIN, FIRST_LARGE_BIN, PAGE_SIZE, bin_to_size, size_to_bin};
pub use error::{AllocError, InvalidFree, InvariantViolation};
pub use heap::Heap;
pub use small::BinCensus;

// =============================================================================
// Process-wide heap
// =============================================================================

static HEAP: Heap = Heap::new();

/// The heap behind [`allocate`], [`free`] and [`Allocator`].
pub fn global_heap() -> &'static Heap {
  &HEAP
}

/// Allocates at least `size` bytes from the process-wide heap, or returns null.
pub fn allocate(size: usize) -> *mut u8 {
  HEAP.allocate(size)
}

/// Frees a pointer returned by [`allocate`]. Null is ignored.
///
/// # Panics
///
/// On pointers that are not live allocations, including double frees.
pub unsafe fn free(ptr: *mut u8) {
  unsafe { HEAP.free(ptr) }
}

/// Object size of the bin `ptr` came from.
pub fn usable_size(ptr: *mut u8) -> usize {
  HEAP.usable_size(ptr)
}

/// Approximate bytes allocated from the process-wide heap.
pub fn footprint() -> i64 {
  HEAP.footprint()
}

/// Checks the small-bin invariants of the process-wide heap.
pub fn verify_invariants() -> Result<(), InvariantViolation> {
  HEAP.verify_invariants()
}

/// Decommits idle folios of the process-wide heap. Returns bytes released.
pub fn purge() -> usize {
  HEAP.purge()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    HEAP
      .try_allocate_aligned(layout.size(), layout.align())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { HEAP.free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    unsafe { HEAP.reallocate_aligned(ptr, new_size, layout.align()) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    HEAP
      .try_allocate_zeroed(layout.size(), layout.align())
      .map_or(null_mut(), NonNull::as_ptr)
  }
}
