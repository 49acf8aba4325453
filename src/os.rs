//! Platform primitives: mapping, decommit, CPU ids and re-entrancy-safe logging.

use core::{
  cell::Cell,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};
use std::io;

// =============================================================================
// Virtual memory
// =============================================================================

/// Maps `size` bytes of zero-fill-on-demand memory.
pub fn map(size: usize) -> io::Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }
  NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

/// Unmaps a range previously returned by [`map`], or a page-aligned part of it.
pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
  if unsafe { libc::munmap(ptr.as_ptr().cast(), size) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Tells the OS the pages' contents are no longer needed. The range stays
/// mapped and reads back as zeros once the kernel reclaims it.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
  if unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

// =============================================================================
// CPU and thread ids
// =============================================================================

// Each thread gets a different ID
pub fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: Cell<u32> = const { Cell::new(0) };
  }
  static CTR: AtomicU32 = AtomicU32::new(1);

  TID
    .try_with(|tid| {
      if tid.get() == 0 {
        tid.set(CTR.fetch_add(1, Ordering::Relaxed));
      }
      tid.get()
    })
    .unwrap_or(0)
}

// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    // nomem - Doesn't read/write memory
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub fn cpu_id() -> usize {
  // -1 on failure; any value is only a sharding hint.
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 { thread_id_u32() as usize } else { cpu as usize }
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_id() -> usize {
  thread_id_u32() as usize
}

// =============================================================================
// Logging
// =============================================================================

thread_local! {
  static IN_LOGGER: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` unless this thread is already inside it. A logger that allocates
/// re-enters the allocator; the nested log record is dropped.
pub fn without_reentry(f: impl FnOnce()) {
  let entered = IN_LOGGER
    .try_with(|flag| !flag.replace(true))
    .unwrap_or(false);
  if entered {
    f();
    let _ = IN_LOGGER.try_with(|flag| flag.set(false));
  }
}

/// `log` macros routed through [`without_reentry`]. Never use inside a locked section.
macro_rules! alloc_log {
  ($level:ident, $($arg:tt)+) => {
    $crate::os::without_reentry(|| log::$level!($($arg)+))
  };
}
pub(crate) use alloc_log;
