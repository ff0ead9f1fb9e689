//! Shared health state for the /health endpoint.
//! Updated by the feed adapters, trade buffer, and spool.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Shared health metrics. Updated by pipeline components, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// True while at least one feed socket is connected.
    pub feed_connected: AtomicBool,
    /// Epoch-ms timestamp of the last normalized trade (0 = none yet).
    pub last_trade_at_ms: AtomicI64,
    /// Trades currently pending in the batch buffer.
    pub buffer_depth: AtomicU64,
    /// Lines waiting in the on-disk spool.
    pub spool_backlog: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed_connected(&self, v: bool) {
        self.feed_connected.store(v, Ordering::Relaxed);
    }

    pub fn feed_connected(&self) -> bool {
        self.feed_connected.load(Ordering::Relaxed)
    }

    pub fn set_last_trade_at_ms(&self, ms: i64) {
        self.last_trade_at_ms.store(ms, Ordering::Relaxed);
    }

    pub fn last_trade_at_ms(&self) -> i64 {
        self.last_trade_at_ms.load(Ordering::Relaxed)
    }

    pub fn set_buffer_depth(&self, n: u64) {
        self.buffer_depth.store(n, Ordering::Relaxed);
    }

    pub fn buffer_depth(&self) -> u64 {
        self.buffer_depth.load(Ordering::Relaxed)
    }

    pub fn set_spool_backlog(&self, n: u64) {
        self.spool_backlog.store(n, Ordering::Relaxed);
    }

    pub fn spool_backlog(&self) -> u64 {
        self.spool_backlog.load(Ordering::Relaxed)
    }
}
