//! Chunk manager: chunk-aligned memory straight from the OS.
//!
//! Chunks are never handed back in the hot path. Small and large chunks live
//! for the rest of the process and shed physical memory with page-level
//! decommit; only huge objects unmap their chunks.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  bins::{CHUNK_MASK, CHUNK_SIZE, LOG_CHUNK_SIZE, LOG_MAX_CHUNK_NUMBER},
  chunk_table,
  error::{AllocError, Result},
  os::{self, alloc_log},
};

/// Index of a chunk-aligned chunk: its address shifted right by `LOG_CHUNK_SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkNumber(u32);

impl ChunkNumber {
  /// One past the largest chunk number the metadata index covers.
  pub const LIMIT: usize = 1 << LOG_MAX_CHUNK_NUMBER;

  /// The chunk containing `addr`, if it is inside the indexed address space.
  #[inline(always)]
  pub fn containing(addr: usize) -> Option<Self> {
    let n = addr >> LOG_CHUNK_SIZE;
    (n < Self::LIMIT).then_some(ChunkNumber(n as u32))
  }

  #[inline(always)]
  pub fn from_index(index: usize) -> Option<Self> {
    (index < Self::LIMIT).then_some(ChunkNumber(index as u32))
  }

  #[inline(always)]
  pub fn index(self) -> usize {
    self.0 as usize
  }

  #[inline(always)]
  pub fn base(self) -> usize {
    self.index() << LOG_CHUNK_SIZE
  }

  #[inline(always)]
  pub fn base_ptr(self) -> NonNull<u8> {
    // Chunk 0 is never mapped (address zero).
    NonNull::new(self.base() as *mut u8).unwrap_or(NonNull::dangling())
  }
}

static MAPPED_BYTES: AtomicU64 = AtomicU64::new(0);
static UNMAPPED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Bytes ever obtained from the OS.
pub fn mapped_bytes() -> u64 {
  MAPPED_BYTES.load(Ordering::Relaxed)
}

/// Bytes ever given back to the OS, including slack trimmed by the slow path.
pub fn unmapped_bytes() -> u64 {
  UNMAPPED_BYTES.load(Ordering::Relaxed)
}

fn map_counted(size: usize) -> Result<NonNull<u8>> {
  let ptr = os::map(size).map_err(|source| {
    alloc_log!(warn, "mmap of {size} bytes failed: {source}");
    AllocError::OutOfMemory { bytes: size, source }
  })?;
  MAPPED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
  Ok(ptr)
}

fn unmap_counted(addr: usize, size: usize) {
  let Some(ptr) = NonNull::new(addr as *mut u8) else {
    return;
  };
  match unsafe { os::unmap(ptr, size) } {
    Ok(()) => {
      UNMAPPED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    }
    // Leaks address space but leaves every live object intact.
    Err(err) => alloc_log!(warn, "munmap of {size} bytes at {addr:#x} failed: {err}"),
  }
}

/// Maps `n` contiguous chunks aligned to the chunk size.
///
/// Safe to call from many threads at once: the only shared state touched is
/// the OS mapping itself and two statistics counters. Nothing is published
/// on failure.
pub fn allocate_chunks(n: usize) -> Result<ChunkNumber> {
  let size = n.checked_mul(CHUNK_SIZE).ok_or(AllocError::SizeOverflow)?;
  // Every caller stamps the chunk next, so make sure the index exists first.
  chunk_table::table()?;
  #[cfg(feature = "stats")]
  crate::stats::mark_start();

  let ptr = map_counted(size)?;
  let mut addr = ptr.as_ptr() as usize;

  if addr & CHUNK_MASK != 0 {
    // Slow path: over-map by one chunk and trim both ends to the boundary.
    unmap_counted(addr, size);
    let wide = map_counted(size + CHUNK_SIZE)?.as_ptr() as usize;
    let lead = (CHUNK_SIZE - (wide & CHUNK_MASK)) & CHUNK_MASK;
    if lead > 0 {
      unmap_counted(wide, lead);
    }
    addr = wide + lead;
    unmap_counted(addr + size, CHUNK_SIZE - lead);
    alloc_log!(trace, "trimmed {lead} leading bytes to align {n} chunk(s) at {addr:#x}");
  }

  let Some(first) = ChunkNumber::containing(addr)
    .filter(|_| ChunkNumber::containing(addr + size - 1).is_some())
  else {
    unmap_counted(addr, size);
    return Err(AllocError::AddressOutOfRange { addr });
  };

  alloc_log!(debug, "mapped {n} chunk(s) at {addr:#x}");
  Ok(first)
}

/// Returns `n` chunks starting at `first` to the OS.
///
/// # Safety
///
/// The run must have come from [`allocate_chunks`] and hold no live objects.
pub unsafe fn release_chunks(first: ChunkNumber, n: usize) {
  unmap_counted(first.base(), n * CHUNK_SIZE);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunks_are_aligned() {
    for n in [1, 2, 3] {
      let first = allocate_chunks(n).unwrap();
      assert_eq!(first.base() & CHUNK_MASK, 0);
      unsafe {
        // Every page of the run is usable.
        let base = first.base_ptr().as_ptr();
        for off in (0..n * CHUNK_SIZE).step_by(64 * 1024) {
          assert_eq!(*base.add(off), 0);
          *base.add(off) = 1;
        }
        release_chunks(first, n);
      }
    }
  }

  #[test]
  fn counters_track_traffic() {
    let before = mapped_bytes();
    let first = allocate_chunks(1).unwrap();
    assert!(mapped_bytes() >= before + CHUNK_SIZE as u64);
    let unmapped = unmapped_bytes();
    unsafe { release_chunks(first, 1) };
    assert!(unmapped_bytes() >= unmapped + CHUNK_SIZE as u64);
  }

  #[test]
  fn overflowing_run_is_rejected() {
    assert!(matches!(allocate_chunks(usize::MAX / 2), Err(AllocError::SizeOverflow)));
  }

  #[test]
  fn chunk_numbers() {
    let c = ChunkNumber::containing(5 * CHUNK_SIZE + 17).unwrap();
    assert_eq!(c.index(), 5);
    assert_eq!(c.base(), 5 * CHUNK_SIZE);
    assert!(ChunkNumber::containing(usize::MAX).is_none());
    assert!(ChunkNumber::from_index(ChunkNumber::LIMIT).is_none());
  }
}
