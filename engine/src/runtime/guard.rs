//! Serialization of data-collection callbacks
//!
//! Injected helper calls run on every virtual CPU thread at once, while
//! most plugins keep plain, unsynchronized counters. When enabled, the guard
//! holds one process-wide lock around each callback. A lock that cannot be
//! taken (poisoned by a panic inside a previous callback) is reported and
//! the call is skipped; execution of the guest carries on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct CallbackGuard {
    enabled: bool,
    lock: Mutex<()>,
    skipped: AtomicU64,
}

impl CallbackGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            lock: Mutex::new(()),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f` under the guard. Returns `None` when the call was skipped.
    pub fn call<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.enabled {
            return Some(f());
        }

        match self.lock.lock() {
            Ok(_held) => Some(f()),
            Err(e) => {
                log::error!("plugin: call_tb_helper() failed to lock: {}", e);
                self.skipped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Number of calls skipped because the lock could not be taken.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for CallbackGuard {
    fn default() -> Self {
        Self::new(true)
    }
}
