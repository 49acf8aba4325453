use std::io;

use thiserror::Error;

/// Why an allocation request produced no memory.
#[derive(Debug, Error)]
pub enum AllocError {
  #[error("the operating system refused to map {bytes} bytes")]
  OutOfMemory {
    bytes: usize,
    #[source]
    source: io::Error,
  },

  #[error("requested size does not fit in the address space")]
  SizeOverflow,

  #[error("alignment {0} is not a supported power of two")]
  UnsupportedAlignment(usize),

  #[error("mapping at {addr:#x} lies beyond the chunk index")]
  AddressOutOfRange { addr: usize },
}

/// A pointer handed to `free` that is not a live allocation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidFree {
  #[error("{ptr:#x} is not inside a chunk owned by the allocator")]
  UnknownChunk { ptr: usize },

  #[error("{ptr:#x} does not point at the start of an object")]
  NotAnObject { ptr: usize },

  #[error("{ptr:#x} was already free")]
  DoubleFree { ptr: usize },
}

/// A broken structural invariant found by a verification pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
  #[error("bin {bin}: folio {folio:#x} in bucket {bucket} has a stale back link")]
  BrokenLink { bin: usize, bucket: usize, folio: u64 },

  #[error("bin {bin}: folio {folio:#x} in bucket {bucket} has {free} free slots")]
  WrongBucket { bin: usize, bucket: usize, folio: u64, free: usize },

  #[error("bin {bin}: fullest offset is {recorded}, lowest nonempty bucket is {actual}")]
  StaleFullest { bin: usize, recorded: usize, actual: usize },

  #[error("bin {bin}: {live} live objects recorded, bitmaps account for {counted}")]
  Conservation { bin: usize, live: u64, counted: u64 },
}

pub type Result<T, E = AllocError> = std::result::Result<T, E>;
