//! Minimal cancellation primitive for tearing down a channel's background
//! tasks on `close()`.
//!
//! Every task a channel spawns (accept loop, prune loop, receive loop,
//! receive-monitor loop, failed-destination expiry loop) holds a clone of
//! the channel's [`Cancellation`] and checks it at its suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks the token cancelled. Returns `true` the first time this fires,
    /// `false` on every subsequent call — callers use this to make
    /// `close()` idempotent without a separate "already closed" flag.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn child(&self) -> Self {
        self.clone()
    }
}
