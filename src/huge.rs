//! Huge objects: power-of-two runs of whole chunks, one object per run.
//!
//! Freed runs are unmapped, or, with the `retain_huge_chunks` option,
//! decommitted and kept on a per-size reuse list threaded through the chunk
//! metadata index.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  bins::{BIN_LIMIT, BINS, CHUNK_SIZE, FIRST_HUGE_BIN, HUGE_BINS},
  chunk::{ChunkNumber, allocate_chunks, release_chunks},
  chunk_table::{ChunkInfo, ChunkTable},
  error::{AllocError, InvalidFree, Result},
  footprint::Footprint,
  options::options,
  os::{self, alloc_log},
};

/// Reuse list heads, one per huge bin: a generation tag in the upper half and
/// the first chunk number plus one in the lower half.
static RETAINED: [AtomicU64; HUGE_BINS] = [const { AtomicU64::new(0) }; HUGE_BINS];

fn head_chunk(head: u64) -> Option<ChunkNumber> {
  ((head as u32) as usize)
    .checked_sub(1)
    .and_then(ChunkNumber::from_index)
}

fn replaced_by(head: u64, chunk: Option<ChunkNumber>) -> u64 {
  let tag = (head >> 32).wrapping_add(1);
  tag << 32 | chunk.map_or(0, |c| c.index() as u64 + 1)
}

fn pop_retained(order: usize, table: &ChunkTable) -> Option<ChunkNumber> {
  let head = &RETAINED[order];
  let mut current = head.load(Ordering::Acquire);
  loop {
    let chunk = head_chunk(current)?;
    let ChunkInfo::Free { next } = table.get(chunk) else {
      // Taken by another thread since we read the head.
      current = head.load(Ordering::Acquire);
      continue;
    };
    match head.compare_exchange_weak(current, replaced_by(current, next), Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => return Some(chunk),
      Err(seen) => current = seen,
    }
  }
}

fn push_retained(order: usize, chunk: ChunkNumber, table: &ChunkTable) {
  let head = &RETAINED[order];
  let mut current = head.load(Ordering::Acquire);
  loop {
    table.set(chunk, ChunkInfo::Free { next: head_chunk(current) });
    match head.compare_exchange_weak(current, replaced_by(current, Some(chunk)), Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => return,
      Err(seen) => current = seen,
    }
  }
}

/// Allocates one object of huge bin `bin`.
pub fn huge_allocate(bin: usize, table: &ChunkTable, footprint: &Footprint) -> Result<NonNull<u8>> {
  if !(FIRST_HUGE_BIN..BIN_LIMIT).contains(&bin) {
    return Err(AllocError::SizeOverflow);
  }
  let order = bin - FIRST_HUGE_BIN;

  let retained = if options().retain_huge_chunks { pop_retained(order, table) } else { None };
  let chunk = match retained {
    Some(chunk) => {
      alloc_log!(trace, "reusing retained huge run at {:#x}", chunk.base());
      chunk
    }
    None => allocate_chunks(1 << order)?,
  };

  table.set(chunk, ChunkInfo::Huge { bin });
  footprint.add(BINS[bin].object_size as i64);
  Ok(chunk.base_ptr())
}

/// Frees the huge object at `ptr`, whose first chunk is stamped with `bin`.
pub fn huge_free(
  bin: usize,
  chunk: ChunkNumber,
  ptr: usize,
  table: &ChunkTable,
  footprint: &Footprint,
) -> Result<(), InvalidFree> {
  if ptr != chunk.base() {
    return Err(InvalidFree::NotAnObject { ptr });
  }
  let order = bin - FIRST_HUGE_BIN;
  let size = BINS[bin].object_size;
  footprint.add(-(size as i64));

  if options().retain_huge_chunks {
    if let Err(err) = unsafe { os::decommit(chunk.base_ptr(), size) } {
      alloc_log!(warn, "madvise of huge run at {ptr:#x} failed: {err}");
    }
    push_retained(order, chunk, table);
  } else {
    // Unstamp before the range can be mapped again by anyone else.
    table.set(chunk, ChunkInfo::Unassigned);
    unsafe { release_chunks(chunk, size / CHUNK_SIZE) };
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bins::size_to_bin,
    chunk_table::{lookup, table},
  };

  #[test]
  fn huge_objects_are_chunk_aligned_runs() {
    let fp = Footprint::new();
    let table = table().unwrap();
    let ptr = huge_allocate(size_to_bin(3 * CHUNK_SIZE), table, &fp).unwrap().as_ptr() as usize;
    assert_eq!(ptr % CHUNK_SIZE, 0);
    assert_eq!(lookup(ptr), ChunkInfo::Huge { bin: FIRST_HUGE_BIN + 2 });
    assert_eq!(fp.get(), 4 * CHUNK_SIZE as i64);
    unsafe { (ptr as *mut u8).add(4 * CHUNK_SIZE - 1).write(1) };

    let chunk = ChunkNumber::containing(ptr).unwrap();
    assert_eq!(
      huge_free(FIRST_HUGE_BIN + 2, chunk, ptr + 8, table, &fp),
      Err(InvalidFree::NotAnObject { ptr: ptr + 8 })
    );
    huge_free(FIRST_HUGE_BIN + 2, chunk, ptr, table, &fp).unwrap();
    assert_eq!(fp.get(), 0);
  }

  #[test]
  fn retained_runs_are_reused_last_in_first_out() {
    let table = table().unwrap();
    // The pool is only filled through `huge_free`, so drive it directly.
    let order = HUGE_BINS - 1;
    let a = ChunkNumber::from_index(ChunkNumber::LIMIT - 3).unwrap();
    let b = ChunkNumber::from_index(ChunkNumber::LIMIT - 2).unwrap();
    push_retained(order, a, table);
    push_retained(order, b, table);
    assert_eq!(table.get(b), ChunkInfo::Free { next: Some(a) });
    assert_eq!(pop_retained(order, table), Some(b));
    assert_eq!(pop_retained(order, table), Some(a));
    assert_eq!(pop_retained(order, table), None);
    table.set(a, ChunkInfo::Unassigned);
    table.set(b, ChunkInfo::Unassigned);
  }

  #[test]
  fn oversized_requests_fail_cleanly() {
    let fp = Footprint::new();
    assert!(matches!(huge_allocate(size_to_bin(usize::MAX), table().unwrap(), &fp), Err(AllocError::SizeOverflow)));
    assert_eq!(fp.get(), 0);
  }
}
