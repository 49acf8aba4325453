//! Runtime knobs, read once from `FOLIOMALLOC_*` environment variables.
//!
//! The environment is read with `getenv` so that building the options never
//! allocates: the first allocation of the process may be the one that reads
//! them.

use core::ffi::CStr;

use spin::Once;

fn always_valid<T>(_: &T) -> bool {
  true
}

macro_rules! options {
  ($($name:ident: $type:ty[$validator:expr] = $default:expr; $env:literal),* $(,)?) => [
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Options {
      $(pub $name: $type),*
    }

    impl Options {
      /// Builds options from `lookup`, which maps a variable name to its raw
      /// value. Unparsable or invalid values keep the default.
      pub fn from_lookup<'a>(lookup: impl Fn(&CStr) -> Option<&'a [u8]>) -> Self {
        let mut options = Self::default();
        $(
          if let Some(val) = lookup($env)
            .and_then(|raw| core::str::from_utf8(raw).ok())
            .and_then(|s| s.trim().parse::<$type>().ok())
          {
            let validate_fn = $validator;
            if validate_fn(&val) {
              options.$name = val;
            }
          }
        )*
        options
      }
    }

    impl Default for Options {
      fn default() -> Self {
        Options {
          $($name: $default),*
        }
      }
    }
  ]
}

options! {
  // Touch the cache lines a locked section will write before taking the lock.
  predo: bool[always_valid] = true; c"FOLIOMALLOC_PREDO",
  // Give empty folios and freed large objects back to the OS.
  decommit: bool[always_valid] = cfg!(feature = "release-mem"); c"FOLIOMALLOC_DECOMMIT",
  // Footprint updates between two CPU id queries.
  cpu_refresh: u32[|v: &u32| *v > 0] = 128; c"FOLIOMALLOC_CPU_REFRESH",
  // Check the small-bin invariants after every small allocate and free.
  verify: bool[always_valid] = false; c"FOLIOMALLOC_VERIFY",
  // Keep freed huge chunks (decommitted) for reuse instead of unmapping them.
  retain_huge_chunks: bool[always_valid] = false; c"FOLIOMALLOC_RETAIN_HUGE",
}

static OPTIONS: Once<Options> = Once::new();

fn getenv(name: &CStr) -> Option<&'static [u8]> {
  let value = unsafe { libc::getenv(name.as_ptr()) };
  if value.is_null() {
    None
  } else {
    Some(unsafe { CStr::from_ptr(value) }.to_bytes())
  }
}

/// Process-wide options, parsed on first use.
pub fn options() -> &'static Options {
  OPTIONS.call_once(|| Options::from_lookup(getenv))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lookup_in<'a>(vars: &'a [(&'a CStr, &'a str)]) -> impl Fn(&CStr) -> Option<&'a [u8]> {
    move |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_bytes())
  }

  #[test]
  fn no_env_var() {
    let options = Options::from_lookup(|_| None);
    assert_eq!(options, Options::default());
    assert!(options.predo);
    assert_eq!(options.cpu_refresh, 128);
  }

  #[test]
  fn with_valid_values() {
    let vars = [
      (c"FOLIOMALLOC_CPU_REFRESH", "16"),
      (c"FOLIOMALLOC_VERIFY", "true"),
      (c"FOLIOMALLOC_PREDO", "false"),
    ];
    let options = Options::from_lookup(lookup_in(&vars));
    assert_eq!(options.cpu_refresh, 16);
    assert!(options.verify);
    assert!(!options.predo);
  }

  #[test]
  fn with_invalid_values() {
    let vars = [(c"FOLIOMALLOC_CPU_REFRESH", "0"), (c"FOLIOMALLOC_VERIFY", "maybe")];
    let options = Options::from_lookup(lookup_in(&vars));
    assert_eq!(options.cpu_refresh, 128);
    assert!(!options.verify);
  }
}
