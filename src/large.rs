//! Large-object allocator: page-granular objects on compare-and-swap free lists.
//!
//! The first page of a large chunk is an array of 64-bit cells, one per
//! object slot. A free slot's cell links to the next free cell of the same
//! bin; a live slot's cell records the footprint it was charged.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  bins::{BINS, FIRST_LARGE_BIN, LARGE_BINS, OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK, PAGE_SIZE, align_up},
  chunk::{ChunkNumber, allocate_chunks},
  chunk_table::{ChunkInfo, ChunkTable},
  error::{AllocError, InvalidFree, Result},
  footprint::Footprint,
  os::{self, alloc_log},
};

/// A large object slot: its chunk and its index in the chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct CellRef {
  chunk: ChunkNumber,
  slot: u32,
}

impl CellRef {
  const SLOT_BITS: u32 = 8;

  /// Never zero, so that zero can mean "no cell".
  fn encode(self) -> u64 {
    ((self.chunk.index() as u64) << Self::SLOT_BITS | self.slot as u64) + 1
  }

  fn decode(raw: u64) -> Option<Self> {
    let v = raw.checked_sub(1)?;
    Some(CellRef {
      chunk: ChunkNumber::from_index((v >> Self::SLOT_BITS) as usize)?,
      slot: (v & ((1 << Self::SLOT_BITS) - 1)) as u32,
    })
  }

  fn cell(self) -> &'static AtomicU64 {
    let addr = self.chunk.base() + self.slot as usize * size_of::<AtomicU64>();
    // Cell pages of large chunks are mapped for the life of the process.
    unsafe { &*(addr as *const AtomicU64) }
  }

  fn object(self, bin: usize) -> usize {
    self.chunk.base() + OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK + self.slot as usize * BINS[bin].object_size
  }
}

/// Contents of a cell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LargeCell {
  Free { next: Option<CellRef> },
  Live { footprint: u32 },
}

impl LargeCell {
  const LIVE: u64 = 1 << 63;

  fn encode(self) -> u64 {
    match self {
      LargeCell::Free { next } => next.map_or(0, CellRef::encode),
      LargeCell::Live { footprint } => Self::LIVE | footprint as u64,
    }
  }

  fn decode(raw: u64) -> Self {
    if raw & Self::LIVE != 0 {
      LargeCell::Live { footprint: raw as u32 }
    } else {
      LargeCell::Free { next: CellRef::decode(raw) }
    }
  }
}

/// Free-list head: a generation tag over an encoded [`CellRef`]. The tag
/// changes on every successful update, so a head that was popped and pushed
/// back in between never compares equal.
#[derive(Clone, Copy)]
struct Head(u64);

impl Head {
  const REF_BITS: u32 = 40;
  const REF_MASK: u64 = (1 << Self::REF_BITS) - 1;

  fn top(self) -> Option<CellRef> {
    CellRef::decode(self.0 & Self::REF_MASK)
  }

  fn replaced_by(self, top: Option<CellRef>) -> Head {
    let tag = (self.0 >> Self::REF_BITS).wrapping_add(1);
    Head(tag << Self::REF_BITS | top.map_or(0, CellRef::encode))
  }
}

const _: () = assert!(((ChunkNumber::LIMIT as u64) << CellRef::SLOT_BITS) < Head::REF_MASK);

/// Footprint of a `size`-byte request in `bin`: whole pages, at most the object size.
fn charge(bin: usize, size: usize) -> u32 {
  align_up(size.max(1), PAGE_SIZE).min(BINS[bin].object_size) as u32
}

/// The cell of the live object starting at `ptr`, with its current charge.
fn live_cell(bin: usize, chunk: ChunkNumber, ptr: usize) -> Result<(CellRef, u32), InvalidFree> {
  let info = &BINS[bin];
  let not_an_object = InvalidFree::NotAnObject { ptr };
  let offset = (ptr - chunk.base())
    .checked_sub(OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK)
    .ok_or(not_an_object)?;
  let slot = info.object_index(offset);
  if slot >= info.objects_per_chunk() || slot * info.object_size != offset {
    return Err(not_an_object);
  }
  let cell = CellRef { chunk, slot: slot as u32 };
  match LargeCell::decode(cell.cell().load(Ordering::Acquire)) {
    LargeCell::Live { footprint } => Ok((cell, footprint)),
    LargeCell::Free { .. } => Err(InvalidFree::DoubleFree { ptr }),
  }
}

pub struct LargeHeap {
  heads: [AtomicU64; LARGE_BINS],
}

impl LargeHeap {
  pub const fn new() -> Self {
    Self {
      heads: [const { AtomicU64::new(0) }; LARGE_BINS],
    }
  }

  fn head(&self, bin: usize) -> &AtomicU64 {
    &self.heads[bin - FIRST_LARGE_BIN]
  }

  /// Maps a chunk for `bin`, threads its cells into a list and splices the
  /// list in front of whatever the head holds by then.
  fn refill(&self, bin: usize, table: &ChunkTable) -> Result<()> {
    let chunk = allocate_chunks(1)?;
    let count = BINS[bin].objects_per_chunk() as u32;
    let cell = |slot| CellRef { chunk, slot };

    for slot in 0..count - 1 {
      let next = LargeCell::Free { next: Some(cell(slot + 1)) };
      cell(slot).cell().store(next.encode(), Ordering::Relaxed);
    }
    table.set(chunk, ChunkInfo::Large { bin });

    let last = cell(count - 1).cell();
    let head = self.head(bin);
    let mut current = Head(head.load(Ordering::Acquire));
    loop {
      last.store(LargeCell::Free { next: current.top() }.encode(), Ordering::Relaxed);
      let new = current.replaced_by(Some(cell(0)));
      match head.compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => break,
        Err(seen) => current = Head(seen),
      }
    }
    alloc_log!(trace, "large bin {bin} grew by {count} objects");
    Ok(())
  }

  /// Allocates one object of large bin `bin` and charges `size` rounded up to
  /// whole pages to `footprint`.
  pub fn allocate(&self, bin: usize, size: usize, table: &ChunkTable, footprint: &Footprint) -> Result<NonNull<u8>> {
    let head = self.head(bin);
    let charged = charge(bin, size);
    loop {
      let current = Head(head.load(Ordering::Acquire));
      let Some(top) = current.top() else {
        self.refill(bin, table)?;
        continue;
      };
      let LargeCell::Free { next } = LargeCell::decode(top.cell().load(Ordering::Acquire)) else {
        // Popped and handed out by another thread since we read the head.
        continue;
      };
      let new = current.replaced_by(next);
      if head
        .compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        top.cell().store(LargeCell::Live { footprint: charged }.encode(), Ordering::Release);
        footprint.add(charged as i64);
        let addr = top.object(bin);
        return NonNull::new(addr as *mut u8).ok_or(AllocError::AddressOutOfRange { addr });
      }
    }
  }

  /// Frees the object at `ptr`, which lies in a chunk stamped with large bin `bin`.
  pub fn free(
    &self,
    bin: usize,
    chunk: ChunkNumber,
    ptr: usize,
    footprint: &Footprint,
    decommit: bool,
  ) -> Result<(), InvalidFree> {
    let info = &BINS[bin];
    let (cell, charged) = live_cell(bin, chunk, ptr)?;

    if decommit
      && let Some(object) = NonNull::new(ptr as *mut u8)
      && let Err(err) = unsafe { os::decommit(object, info.object_size) }
    {
      alloc_log!(warn, "madvise of large object at {ptr:#x} failed: {err}");
      // Zeroed allocations rely on freed objects reading as zero.
      unsafe { object.as_ptr().write_bytes(0, info.object_size) };
    }
    footprint.add(-(charged as i64));

    let head = self.head(bin);
    let mut current = Head(head.load(Ordering::Acquire));
    loop {
      cell.cell().store(LargeCell::Free { next: current.top() }.encode(), Ordering::Release);
      let new = current.replaced_by(Some(cell));
      match head.compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return Ok(()),
        Err(seen) => current = Head(seen),
      }
    }
  }

  /// Charges the live object at `ptr` for `new_size` bytes instead of what it
  /// was allocated with. Used when a resize stays in the same bin.
  pub fn recharge(
    &self,
    bin: usize,
    chunk: ChunkNumber,
    ptr: usize,
    new_size: usize,
    footprint: &Footprint,
  ) -> Result<(), InvalidFree> {
    let (cell, old) = live_cell(bin, chunk, ptr)?;
    let new = charge(bin, new_size);
    cell.cell().store(LargeCell::Live { footprint: new }.encode(), Ordering::Release);
    footprint.add(new as i64 - old as i64);
    Ok(())
  }

  /// Number of objects on `bin`'s free list. Only meaningful when quiescent.
  pub fn free_count(&self, bin: usize) -> usize {
    let mut n = 0;
    let mut cursor = Head(self.head(bin).load(Ordering::Acquire)).top();
    while let Some(cell) = cursor {
      n += 1;
      cursor = match LargeCell::decode(cell.cell().load(Ordering::Acquire)) {
        LargeCell::Free { next } => next,
        LargeCell::Live { .. } => None,
      };
    }
    n
  }
}

impl Default for LargeHeap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{bins::size_to_bin, chunk_table::table};

  fn alloc(heap: &LargeHeap, fp: &Footprint, size: usize) -> usize {
    heap.allocate(size_to_bin(size), size, table().unwrap(), fp).unwrap().as_ptr() as usize
  }

  fn free(heap: &LargeHeap, fp: &Footprint, ptr: usize) -> Result<(), InvalidFree> {
    let chunk = ChunkNumber::containing(ptr).unwrap();
    let ChunkInfo::Large { bin } = table().unwrap().get(chunk) else {
      panic!("{ptr:#x} is not large");
    };
    heap.free(bin, chunk, ptr, fp, true)
  }

  #[test]
  fn cells_round_trip() {
    let cell = CellRef { chunk: ChunkNumber::from_index(ChunkNumber::LIMIT - 1).unwrap(), slot: 126 };
    assert_eq!(CellRef::decode(cell.encode()), Some(cell));
    for value in [
      LargeCell::Free { next: None },
      LargeCell::Free { next: Some(cell) },
      LargeCell::Live { footprint: 1044480 },
    ] {
      assert_eq!(LargeCell::decode(value.encode()), value);
    }
  }

  #[test]
  fn objects_follow_the_cell_page() {
    static HEAP: LargeHeap = LargeHeap::new();
    let fp = Footprint::new();
    let a = alloc(&HEAP, &fp, 4 * PAGE_SIZE);
    let b = alloc(&HEAP, &fp, 4 * PAGE_SIZE);
    let base = ChunkNumber::containing(a).unwrap().base() + OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK;
    assert_eq!(a - base, 0);
    assert_eq!(b - base, 4 * PAGE_SIZE);
    assert_eq!(fp.get(), 8 * PAGE_SIZE as i64);

    free(&HEAP, &fp, a).unwrap();
    assert_eq!(alloc(&HEAP, &fp, 4 * PAGE_SIZE), a);
    free(&HEAP, &fp, a).unwrap();
    free(&HEAP, &fp, b).unwrap();
    assert_eq!(fp.get(), 0);
  }

  #[test]
  fn footprint_is_page_rounded_request() {
    static HEAP: LargeHeap = LargeHeap::new();
    let fp = Footprint::new();
    let p = alloc(&HEAP, &fp, 100_000);
    assert_eq!(fp.get(), align_up(100_000, PAGE_SIZE) as i64);
    free(&HEAP, &fp, p).unwrap();
    assert_eq!(fp.get(), 0);
  }

  #[test]
  fn recharge_moves_the_footprint_with_the_request() {
    static HEAP: LargeHeap = LargeHeap::new();
    let fp = Footprint::new();
    let p = alloc(&HEAP, &fp, 20_000);
    let chunk = ChunkNumber::containing(p).unwrap();
    let bin = size_to_bin(20_000);
    assert_eq!(fp.get(), 20_480);

    HEAP.recharge(bin, chunk, p, 30_000, &fp).unwrap();
    assert_eq!(fp.get(), 32_768);
    HEAP.recharge(bin, chunk, p, 17_000, &fp).unwrap();
    assert_eq!(fp.get(), 20_480);
    assert_eq!(
      HEAP.recharge(bin, chunk, p + 8, 30_000, &fp),
      Err(InvalidFree::NotAnObject { ptr: p + 8 })
    );

    free(&HEAP, &fp, p).unwrap();
    assert_eq!(fp.get(), 0);
    assert_eq!(HEAP.recharge(bin, chunk, p, 30_000, &fp), Err(InvalidFree::DoubleFree { ptr: p }));
    assert_eq!(fp.get(), 0);
  }

  #[test]
  fn double_and_interior_frees_are_rejected() {
    static HEAP: LargeHeap = LargeHeap::new();
    let fp = Footprint::new();
    let p = alloc(&HEAP, &fp, 40_000);
    assert_eq!(free(&HEAP, &fp, p + PAGE_SIZE), Err(InvalidFree::NotAnObject { ptr: p + PAGE_SIZE }));
    free(&HEAP, &fp, p).unwrap();
    assert_eq!(free(&HEAP, &fp, p), Err(InvalidFree::DoubleFree { ptr: p }));
    assert_eq!(fp.get(), 0);
  }

  #[test]
  fn refill_covers_the_whole_chunk() {
    static HEAP: LargeHeap = LargeHeap::new();
    let fp = Footprint::new();
    let bin = size_to_bin(520192);
    let per_chunk = BINS[bin].objects_per_chunk();
    let first = alloc(&HEAP, &fp, 520192);
    assert_eq!(HEAP.free_count(bin), per_chunk - 1);
    let rest: Vec<_> = (1..per_chunk).map(|_| alloc(&HEAP, &fp, 520192)).collect();
    assert_eq!(HEAP.free_count(bin), 0);
    for p in &rest {
      assert_eq!(ChunkNumber::containing(*p), ChunkNumber::containing(first));
    }
    // The next one needs a new chunk.
    let next = alloc(&HEAP, &fp, 520192);
    assert_ne!(ChunkNumber::containing(next), ChunkNumber::containing(first));
  }
}
