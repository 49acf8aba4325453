//! Size classes ("bins") and the layout constants derived from them.
//!
//! The whole table is computed at compile time. Bins `0..FIRST_LARGE_BIN` are
//! small (many objects per folio, many folios per chunk), bins
//! `FIRST_LARGE_BIN..FIRST_HUGE_BIN` are large (page-granular objects packed
//! into one chunk behind a one-page cell header) and the rest are huge (an
//! object is a power-of-two run of whole chunks).

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE: usize = 4096;
pub const LOG_PAGE_SIZE: u32 = PAGE_SIZE.trailing_zeros();

pub const LOG_CHUNK_SIZE: u32 = 21;
pub const CHUNK_SIZE: usize = 1 << LOG_CHUNK_SIZE; // 2MB
pub const CHUNK_MASK: usize = CHUNK_SIZE - 1;

pub const CACHE_LINE_SIZE: usize = 64;

/// Usable virtual address bits. Chunk numbers stay below `1 << LOG_MAX_CHUNK_NUMBER`.
pub const LOG_ADDRESS_SPACE: u32 = 48;
pub const LOG_MAX_CHUNK_NUMBER: u32 = LOG_ADDRESS_SPACE - LOG_CHUNK_SIZE;

pub const MAX_OBJECTS_PER_FOLIO: usize = 2048;
pub const FOLIO_BITMAP_WORDS: usize = MAX_OBJECTS_PER_FOLIO / 64;

/// Bytes of per-folio bookkeeping at the start of a small chunk: two list links
/// and the in-use bitmap, padded to a cache line.
pub const FOLIO_HEADER_SIZE: usize = align_up(16 + 8 * FOLIO_BITMAP_WORDS, CACHE_LINE_SIZE);

/// Large chunks keep their free-list cells in the first page.
pub const OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK: usize = PAGE_SIZE;

/// Largest power-of-two object size for which a large chunk wastes the tail
/// slot instead of shrinking the object by a page.
const LOG_LARGEST_WASTE_AT_END: u32 = LOG_CHUNK_SIZE - 4;

// =============================================================================
// Types
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinKind {
  Small,
  Large,
  Huge,
}

/// Immutable descriptor of one size class.
#[derive(Clone, Copy, Debug)]
pub struct BinInfo {
  pub kind: BinKind,
  pub object_size: usize,
  pub folio_size: usize,
  pub objects_per_folio: u32,
  pub folios_per_chunk: u32,
  pub overhead_pages: u32,
  object_shift: u32,
  object_multiply: u64,
  folio_shift: u32,
  folio_multiply: u64,
}

impl BinInfo {
  const EMPTY: BinInfo = BinInfo {
    kind: BinKind::Small,
    object_size: 0,
    folio_size: 0,
    objects_per_folio: 0,
    folios_per_chunk: 0,
    overhead_pages: 0,
    object_shift: 0,
    object_multiply: 0,
    folio_shift: 0,
    folio_multiply: 0,
  };

  const fn new(kind: BinKind, object_size: usize) -> Self {
    let folio_size = folio_size_for(object_size);
    let overhead_pages = match kind {
      BinKind::Huge => 0,
      BinKind::Large => 1,
      BinKind::Small => (FOLIO_HEADER_SIZE * (CHUNK_SIZE / folio_size)).div_ceil(PAGE_SIZE) as u32,
    };
    let folios_per_chunk = if object_size < CHUNK_SIZE {
      ((CHUNK_SIZE - overhead_pages as usize * PAGE_SIZE) / folio_size) as u32
    } else {
      1
    };
    BinInfo {
      kind,
      object_size,
      folio_size,
      objects_per_folio: (folio_size / object_size) as u32,
      folios_per_chunk,
      overhead_pages,
      object_shift: shift_magic(object_size),
      object_multiply: multiply_magic(object_size),
      folio_shift: shift_magic(folio_size),
      folio_multiply: multiply_magic(folio_size),
    }
  }

  /// `offset / object_size` for offsets inside one chunk, without a divide.
  #[inline(always)]
  pub const fn object_index(&self, offset: usize) -> usize {
    ((offset as u64 * self.object_multiply) >> self.object_shift) as usize
  }

  /// `offset / folio_size` for offsets inside one chunk, without a divide.
  #[inline(always)]
  pub const fn folio_index(&self, offset: usize) -> usize {
    ((offset as u64 * self.folio_multiply) >> self.folio_shift) as usize
  }

  /// Bytes of header pages at the start of each chunk of this bin.
  #[inline(always)]
  pub const fn overhead_bytes(&self) -> usize {
    self.overhead_pages as usize * PAGE_SIZE
  }

  /// Number of objects one chunk holds.
  #[inline(always)]
  pub const fn objects_per_chunk(&self) -> usize {
    self.objects_per_folio as usize * self.folios_per_chunk as usize
  }

  /// Largest power of two every object address of this bin is a multiple of.
  pub const fn natural_alignment(&self) -> usize {
    match self.kind {
      BinKind::Huge => CHUNK_SIZE,
      BinKind::Large => PAGE_SIZE,
      BinKind::Small => {
        let low_bit = 1 << self.object_size.trailing_zeros();
        if low_bit < PAGE_SIZE { low_bit } else { PAGE_SIZE }
      }
    }
  }
}

// =============================================================================
// Table construction
// =============================================================================

const fn is_prime_or_9_or_15(x: usize) -> bool {
  if x == 9 || x == 15 {
    return true;
  }
  let mut y = 2;
  while y * y <= x {
    if x % y == 0 {
      return false;
    }
    y += 1;
  }
  true
}

const fn next_prime_or_9_or_15(mut x: usize) -> usize {
  loop {
    x += 1;
    if is_prime_or_9_or_15(x) {
      return x;
    }
  }
}

const fn next_prime_or_9_or_15_or_power_of_two(mut x: usize) -> usize {
  loop {
    x += 1;
    if is_prime_or_9_or_15(x) || x.is_power_of_two() {
      return x;
    }
  }
}

const fn ceil_log2(d: usize) -> u32 {
  if d.is_power_of_two() { d.trailing_zeros() } else { usize::BITS - d.leading_zeros() }
}

const fn shift_magic(d: usize) -> u32 {
  if d > CHUNK_SIZE {
    1
  } else if d.is_power_of_two() {
    ceil_log2(d)
  } else {
    32 + ceil_log2(d)
  }
}

const fn multiply_magic(d: usize) -> u64 {
  if d > CHUNK_SIZE || d.is_power_of_two() {
    1
  } else {
    (d as u64 - 1 + (1u64 << shift_magic(d))) / d as u64
  }
}

const fn gcd(mut a: usize, mut b: usize) -> usize {
  while b != 0 {
    let t = a % b;
    a = b;
    b = t;
  }
  a
}

const fn folio_size_for(object_size: usize) -> usize {
  if object_size > CHUNK_SIZE {
    object_size
  } else if object_size.is_power_of_two() {
    if object_size < PAGE_SIZE { PAGE_SIZE } else { object_size }
  } else if object_size > 16 * 1024 {
    object_size
  } else if object_size > 256 {
    // As many pages as the object has cache lines.
    (object_size / CACHE_LINE_SIZE) * PAGE_SIZE
  } else {
    object_size / gcd(object_size, PAGE_SIZE) * PAGE_SIZE
  }
}

/// Capacity of the table under construction; the real length is `BIN_LIMIT`.
const TABLE_CAPACITY: usize = 96;

struct Table {
  bins: [BinInfo; TABLE_CAPACITY],
  len: usize,
  first_large: usize,
  first_huge: usize,
}

const fn build_table() -> Table {
  let mut t = Table {
    bins: [BinInfo::EMPTY; TABLE_CAPACITY],
    len: 0,
    first_large: 0,
    first_huge: 0,
  };

  // Four sizes per doubling, up to four cache lines.
  let mut k = 8;
  'small: loop {
    let mut c = 4;
    while c <= 7 {
      let size = c * k / 4;
      if size > 4 * CACHE_LINE_SIZE {
        break 'small;
      }
      t.bins[t.len] = BinInfo::new(BinKind::Small, size);
      t.len += 1;
      c += 1;
    }
    k *= 2;
  }

  // Cache-line multiples that are powers of two or primes (or 9, 15).
  let mut prev_lines = 4;
  let mut lines = 5;
  while lines < 4 * CACHE_LINE_SIZE {
    if lines.is_power_of_two() || 10 * prev_lines < 7 * next_prime_or_9_or_15(lines) {
      t.bins[t.len] = BinInfo::new(BinKind::Small, lines * CACHE_LINE_SIZE);
      t.len += 1;
      if !lines.is_power_of_two() {
        prev_lines = lines;
      }
    }
    lines = next_prime_or_9_or_15_or_power_of_two(lines);
  }

  t.first_large = t.len;
  let mut log = 14;
  while log < LOG_CHUNK_SIZE {
    let mut size = 1 << log;
    if log > LOG_LARGEST_WASTE_AT_END {
      size -= PAGE_SIZE;
    }
    t.bins[t.len] = BinInfo::new(BinKind::Large, size);
    t.len += 1;
    log += 1;
  }

  t.first_huge = t.len;
  let mut size = CHUNK_SIZE;
  while size < 1 << LOG_ADDRESS_SPACE {
    t.bins[t.len] = BinInfo::new(BinKind::Huge, size);
    t.len += 1;
    size *= 2;
  }
  t
}

const TABLE: Table = build_table();

pub const BIN_LIMIT: usize = TABLE.len;
pub const FIRST_LARGE_BIN: usize = TABLE.first_large;
pub const FIRST_HUGE_BIN: usize = TABLE.first_huge;
pub const SMALL_BINS: usize = FIRST_LARGE_BIN;
pub const LARGE_BINS: usize = FIRST_HUGE_BIN - FIRST_LARGE_BIN;
pub const HUGE_BINS: usize = BIN_LIMIT - FIRST_HUGE_BIN;

pub static BINS: [BinInfo; BIN_LIMIT] = {
  let mut out = [BinInfo::EMPTY; BIN_LIMIT];
  let mut i = 0;
  while i < BIN_LIMIT {
    out[i] = TABLE.bins[i];
    i += 1;
  }
  out
};

pub const LARGEST_SMALL: usize = TABLE.bins[FIRST_LARGE_BIN - 1].object_size;
pub const LARGEST_LARGE: usize = TABLE.bins[FIRST_HUGE_BIN - 1].object_size;
pub const LARGEST_HUGE: usize = TABLE.bins[BIN_LIMIT - 1].object_size;

/// Occupancy buckets of one small bin: `0..=capacity+1`.
pub const fn bucket_count(bin: usize) -> usize {
  TABLE.bins[bin].objects_per_folio as usize + 2
}

/// Index of each small bin's first bucket in a flat bucket array.
pub const BUCKET_OFFSETS: [usize; SMALL_BINS] = {
  let mut out = [0; SMALL_BINS];
  let mut total = 0;
  let mut bin = 0;
  while bin < SMALL_BINS {
    out[bin] = total;
    total += bucket_count(bin);
    bin += 1;
  }
  out
};

pub const TOTAL_BUCKETS: usize = BUCKET_OFFSETS[SMALL_BINS - 1] + bucket_count(SMALL_BINS - 1);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(FOLIO_HEADER_SIZE == 320);
const _: () = assert!(BIN_LIMIT <= TABLE_CAPACITY);
const _: () = assert!(TABLE.bins[0].object_size == 8);
const _: () = assert!(LARGEST_SMALL < 16 * 1024);
const _: () = assert!(LARGEST_LARGE == (CHUNK_SIZE / 2) - PAGE_SIZE);
const _: () = assert!(TABLE.bins[FIRST_HUGE_BIN].object_size == CHUNK_SIZE);
const _: () = {
  let mut bin = 0;
  while bin < BIN_LIMIT {
    let b = &TABLE.bins[bin];
    assert!(b.objects_per_folio as usize <= MAX_OBJECTS_PER_FOLIO);
    assert!(b.folio_size % PAGE_SIZE == 0);
    if bin > 0 {
      assert!(TABLE.bins[bin - 1].object_size < b.object_size);
    }
    // Folio references pack the folio index into 16 bits, large cells the slot into 8.
    assert!(b.folios_per_chunk < 1 << 16);
    if matches!(b.kind, BinKind::Large) {
      assert!(b.objects_per_chunk() * 8 <= OFFSET_OF_FIRST_OBJECT_IN_LARGE_CHUNK);
      assert!(b.objects_per_chunk() < 1 << 8);
    }
    bin += 1;
  }
};

// =============================================================================
// Lookups
// =============================================================================

/// Maps a request to the smallest bin whose objects hold it. Sizes at or below
/// eight bytes map to bin 0; sizes beyond the largest huge bin map to
/// `BIN_LIMIT`, which callers reject.
#[inline]
pub fn size_to_bin(size: usize) -> usize {
  if size <= 8 {
    0
  } else if size <= 320 {
    // Four bins per doubling: round up to the next c<<k with c in 4..=7.
    let s = size as u64;
    let nz = s.leading_zeros();
    let r = s + (1u64 << (61 - nz)) - 1;
    let nz2 = r.leading_zeros();
    (4 * (60 - nz2) + ((r >> (61 - nz2)) & 3) as u32) as usize
  } else if size <= LARGEST_LARGE {
    BINS[..FIRST_HUGE_BIN].partition_point(|b| b.object_size < size)
  } else if size <= CHUNK_SIZE {
    FIRST_HUGE_BIN
  } else if size > LARGEST_HUGE {
    BIN_LIMIT
  } else {
    FIRST_HUGE_BIN + (size.next_power_of_two().trailing_zeros() - LOG_CHUNK_SIZE) as usize
  }
}

#[inline(always)]
pub fn bin_to_size(bin: usize) -> usize {
  BINS[bin].object_size
}

#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================
