//! `malloc`-family symbols over the process-wide heap, enabled with `--features c_api`.

use core::ptr::{NonNull, null_mut};

use crate::{AllocError, HEAP};

/// Alignment C callers may assume for a `size`-byte block: that of the widest
/// fundamental type that fits in it.
fn fundamental_alignment(size: usize) -> usize {
  const MAX_ALIGN: usize = 16;
  if size >= MAX_ALIGN {
    MAX_ALIGN
  } else {
    1 << (usize::BITS - 1 - size.max(1).leading_zeros())
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  HEAP
    .try_allocate_aligned(size, fundamental_alignment(size))
    .map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { HEAP.free(ptr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  HEAP
    .try_allocate_zeroed(total, fundamental_alignment(total))
    .map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { HEAP.reallocate_aligned(ptr, size, fundamental_alignment(size)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  match HEAP.try_allocate_aligned(size, alignment) {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    Err(AllocError::UnsupportedAlignment(_)) => libc::EINVAL,
    Err(_) => libc::ENOMEM,
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  HEAP
    .try_allocate_aligned(size, alignment)
    .map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  HEAP.usable_size(ptr)
}
