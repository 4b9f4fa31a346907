//! Allocator configuration.
//!
//! Settings can be given programmatically or read from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REFMEM_CASCADE_LIMIT` | Queue entries reclaimed per allocate/release call | 5 |

use std::env;

/// Default number of deferred frees processed per triggering call.
pub const DEFAULT_CASCADE_LIMIT: usize = 5;

const ENV_CASCADE_LIMIT: &str = "REFMEM_CASCADE_LIMIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Upper bound on reclamations per allocate or release-to-zero.
  /// Zero turns automatic draining off; only `cleanup`/`shutdown` reclaim.
  pub cascade_limit: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cascade_limit: DEFAULT_CASCADE_LIMIT,
    }
  }
}

impl Config {
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Ok(raw) = env::var(ENV_CASCADE_LIMIT) {
      match raw.trim().parse::<usize>() {
        Ok(limit) => config.cascade_limit = limit,
        Err(_) => log::warn!(
          "[refmem] ignoring {}={:?}: not an unsigned integer, using {}",
          ENV_CASCADE_LIMIT,
          raw,
          config.cascade_limit
        ),
      }
    }

    config
  }

  pub fn with_cascade_limit(mut self, limit: usize) -> Self {
    self.cascade_limit = limit;
    self
  }
}
