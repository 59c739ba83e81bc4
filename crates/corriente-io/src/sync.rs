//! The wait-set primitive backends build their buffer-ready signaling on.
//!
//! A [`SignalSet`] is a fixed group of binary signals and one waiter: the
//! Rust rendition of a multi-object wait. Driver-side threads (or the
//! engine's own control paths) set individual signals; the worker blocks
//! in [`wait_any`](SignalSet::wait_any) until at least one signal is
//! pending or the timeout passes, and receives the pending set, which is
//! cleared atomically with the wake.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A fixed set of up to 32 auto-reset signals with a single waiter.
#[derive(Debug, Default)]
pub struct SignalSet {
    pending: Mutex<u32>,
    ready: Condvar,
}

impl SignalSet {
    /// A set with no pending signals.
    #[must_use]
    pub fn new() -> SignalSet {
        SignalSet::default()
    }

    /// Raise one signal by index. Callable from any thread; never blocks
    /// beyond the internal flag update.
    pub fn signal(&self, index: u32) {
        debug_assert!(index < 32);
        if let Ok(mut pending) = self.pending.lock() {
            *pending |= 1 << index;
            self.ready.notify_one();
        }
    }

    /// Raise several signals at once from a bitmask.
    pub fn signal_mask(&self, mask: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending |= mask;
            self.ready.notify_one();
        }
    }

    /// Block until any signal is pending or `timeout` passes. Returns the
    /// pending bitmask (zero on timeout) and clears it.
    #[must_use]
    pub fn wait_any(&self, timeout: Duration) -> u32 {
        let Ok(mut pending) = self.pending.lock() else {
            return 0;
        };
        if *pending == 0 {
            let result = self
                .ready
                .wait_timeout_while(pending, timeout, |p| *p == 0);
            match result {
                Ok((guard, _)) => pending = guard,
                Err(_) => return 0,
            }
        }
        std::mem::take(&mut *pending)
    }

    /// The pending bitmask without waiting or clearing.
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.pending.lock().map(|p| *p).unwrap_or(0)
    }
}
