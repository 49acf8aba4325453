//! Chunk metadata index: one entry per possible chunk number recording who owns it.
//!
//! The table covers the whole 48-bit address space, so it is reserved lazily
//! with a single no-reserve mapping. Only entries of chunks that were ever
//! mapped get touched, so the resident cost follows the heap size.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use crate::{
  chunk::ChunkNumber,
  error::{AllocError, Result},
  os::{self, alloc_log},
};

/// What a chunk is used for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkInfo {
  /// Never mapped by the allocator, or returned to the OS.
  Unassigned,
  /// First chunk of a retained huge run, linked into a reuse list.
  Free { next: Option<ChunkNumber> },
  /// Holds folios of one small bin.
  Small { bin: usize },
  /// Holds objects of one large bin behind a cell header.
  Large { bin: usize },
  /// First chunk of one huge object.
  Huge { bin: usize },
}

const TAG_BITS: u32 = 3;
const TAG_MASK: u32 = (1 << TAG_BITS) - 1;

const TAG_UNASSIGNED: u32 = 0;
const TAG_FREE: u32 = 1;
const TAG_SMALL: u32 = 2;
const TAG_LARGE: u32 = 3;
const TAG_HUGE: u32 = 4;

const _: () = assert!((ChunkNumber::LIMIT as u64 + 1) << TAG_BITS <= u32::MAX as u64);

impl ChunkInfo {
  fn encode(self) -> u32 {
    match self {
      ChunkInfo::Unassigned => TAG_UNASSIGNED,
      ChunkInfo::Free { next } => {
        let link = next.map_or(0, |c| c.index() as u32 + 1);
        TAG_FREE | link << TAG_BITS
      }
      ChunkInfo::Small { bin } => TAG_SMALL | (bin as u32) << TAG_BITS,
      ChunkInfo::Large { bin } => TAG_LARGE | (bin as u32) << TAG_BITS,
      ChunkInfo::Huge { bin } => TAG_HUGE | (bin as u32) << TAG_BITS,
    }
  }

  fn decode(raw: u32) -> Self {
    let payload = raw >> TAG_BITS;
    match raw & TAG_MASK {
      TAG_FREE => ChunkInfo::Free {
        next: payload
          .checked_sub(1)
          .and_then(|i| ChunkNumber::from_index(i as usize)),
      },
      TAG_SMALL => ChunkInfo::Small { bin: payload as usize },
      TAG_LARGE => ChunkInfo::Large { bin: payload as usize },
      TAG_HUGE => ChunkInfo::Huge { bin: payload as usize },
      _ => ChunkInfo::Unassigned,
    }
  }
}

pub struct ChunkTable {
  entries: [AtomicU32; ChunkNumber::LIMIT],
}

const TABLE_BYTES: usize = size_of::<ChunkTable>();

static TABLE: AtomicPtr<ChunkTable> = AtomicPtr::new(null_mut());

impl ChunkTable {
  #[inline]
  pub fn get(&self, chunk: ChunkNumber) -> ChunkInfo {
    ChunkInfo::decode(self.entries[chunk.index()].load(Ordering::Acquire))
  }

  /// Publishes `info` for `chunk`. The chunk's memory must be initialized first.
  #[inline]
  pub fn set(&self, chunk: ChunkNumber, info: ChunkInfo) {
    self.entries[chunk.index()].store(info.encode(), Ordering::Release);
  }
}

/// The process-wide table, reserved on first call.
pub fn table() -> Result<&'static ChunkTable> {
  if let Some(table) = existing() {
    return Ok(table);
  }

  let fresh = os::map(TABLE_BYTES)
    .map_err(|source| AllocError::OutOfMemory { bytes: TABLE_BYTES, source })?;
  match TABLE.compare_exchange(
    null_mut(),
    fresh.as_ptr().cast(),
    Ordering::AcqRel,
    Ordering::Acquire,
  ) {
    Ok(_) => {
      alloc_log!(debug, "reserved chunk index of {TABLE_BYTES} bytes");
      Ok(unsafe { &*fresh.as_ptr().cast::<ChunkTable>() })
    }
    Err(winner) => {
      // Another thread published first; ours was never seen.
      let _ = unsafe { os::unmap(fresh, TABLE_BYTES) };
      Ok(unsafe { &*winner })
    }
  }
}

/// The table, if any chunk was ever mapped.
#[inline]
pub fn existing() -> Option<&'static ChunkTable> {
  let table = TABLE.load(Ordering::Acquire);
  (!table.is_null()).then(|| unsafe { &*table })
}

/// Looks up the chunk containing `addr` without reserving the table.
#[inline]
pub fn lookup(addr: usize) -> ChunkInfo {
  match (existing(), ChunkNumber::containing(addr)) {
    (Some(table), Some(chunk)) => table.get(chunk),
    _ => ChunkInfo::Unassigned,
  }
}
