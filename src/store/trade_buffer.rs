use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::config::BufferConfig;
use crate::store::gateway::StoreGateway;
use crate::store::spool::Spool;
use crate::types::{NormalizedTrade, TradeRow};
use crate::util::now_ms;

// ---------------------------------------------------------------------------
// Dedupe cache
// ---------------------------------------------------------------------------

/// In-memory LRU of `trade id → first-seen ms`, TTL-evicted and size-capped.
/// Drops duplicate ids before they reach the buffer.
pub struct DedupeCache {
    ttl_ms: i64,
    cap: usize,
    seen: HashMap<String, i64>,
    order: VecDeque<(String, i64)>,
}

impl DedupeCache {
    pub fn new(ttl_ms: i64, cap: usize) -> Self {
        Self {
            ttl_ms,
            cap,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if the id is fresh (and records it), false if it is a
    /// duplicate still inside the TTL.
    pub fn insert(&mut self, id: &str, now: i64) -> bool {
        self.evict(now);
        if let Some(&ts) = self.seen.get(id) {
            if now - ts < self.ttl_ms {
                return false;
            }
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        true
    }

    fn evict(&mut self, now: i64) {
        while let Some((id, ts)) = self.order.front() {
            let expired = now - *ts >= self.ttl_ms;
            let over_cap = self.order.len() > self.cap;
            if !expired && !over_cap {
                break;
            }
            // Only drop the map entry when it still refers to this insertion.
            if self.seen.get(id) == Some(ts) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

// ---------------------------------------------------------------------------
// Flush circuit breaker
// ---------------------------------------------------------------------------

/// Rolling-window counter of consecutive flush failures. While open, batches
/// go straight to the spool instead of the store.
pub struct FlushBreaker {
    window_ms: i64,
    threshold: u32,
    consecutive: u32,
    first_failure_at: i64,
    last_failure_at: i64,
}

impl FlushBreaker {
    pub fn new(window_ms: i64, threshold: u32) -> Self {
        Self {
            window_ms,
            threshold,
            consecutive: 0,
            first_failure_at: 0,
            last_failure_at: 0,
        }
    }

    pub fn record_failure(&mut self, now: i64) {
        if self.consecutive == 0 || now - self.first_failure_at > self.window_ms {
            self.consecutive = 0;
            self.first_failure_at = now;
        }
        self.consecutive += 1;
        self.last_failure_at = now;
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Open once the threshold is reached; half-opens (allows one attempt)
    /// after a quiet window since the last failure.
    pub fn is_open(&self, now: i64) -> bool {
        self.consecutive >= self.threshold && now - self.last_failure_at < self.window_ms
    }

    pub fn tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }
}

// ---------------------------------------------------------------------------
// Trade buffer
// ---------------------------------------------------------------------------

/// Cheap cloneable handle; `submit` never blocks the caller.
#[derive(Clone)]
pub struct TradeBufferHandle {
    tx: mpsc::Sender<NormalizedTrade>,
}

impl TradeBufferHandle {
    pub fn submit(&self, trade: NormalizedTrade) {
        if let Err(e) = self.tx.try_send(trade) {
            warn!("trade buffer channel full, dropping submit: {e}");
        }
    }
}

/// Size/time-flushed batch writer for trades. Flushes are serialized: one
/// batch in flight at a time per buffer. Failed batches spill to the spool,
/// never dropped.
pub struct TradeBuffer {
    cfg: BufferConfig,
    store: Arc<StoreGateway>,
    spool: Arc<Spool>,
    health: Arc<HealthState>,
    rx: mpsc::Receiver<NormalizedTrade>,
    pending: Vec<TradeRow>,
    dedupe: DedupeCache,
    breaker: FlushBreaker,
}

impl TradeBuffer {
    pub fn new(
        cfg: BufferConfig,
        store: Arc<StoreGateway>,
        spool: Arc<Spool>,
        health: Arc<HealthState>,
    ) -> (TradeBufferHandle, Self) {
        let (tx, rx) = mpsc::channel(crate::config::CHANNEL_CAPACITY);
        let dedupe = DedupeCache::new(cfg.dedupe_ttl_ms, cfg.dedupe_cap);
        let breaker = FlushBreaker::new(cfg.fail_window_ms, cfg.fail_threshold);
        (
            TradeBufferHandle { tx },
            Self {
                cfg,
                store,
                spool,
                health,
                rx,
                pending: Vec::new(),
                dedupe,
                breaker,
            },
        )
    }

    pub async fn run(mut self) {
        let mut flush_tick = interval(Duration::from_millis(self.cfg.flush_ms));
        flush_tick.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                trade = self.rx.recv() => {
                    match trade {
                        Some(t) => {
                            self.accept(t);
                            if self.pending.len() >= self.cfg.max_trades {
                                self.flush().await;
                            }
                        }
                        None => {
                            // Producers gone; drain and stop.
                            self.flush().await;
                            return;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    fn accept(&mut self, trade: NormalizedTrade) {
        if !self.dedupe.insert(&trade.id, now_ms()) {
            debug!(trade_id = %trade.id, "duplicate trade dropped before buffer");
            return;
        }
        self.pending.push(TradeRow::from_trade(&trade));
        self.health.set_buffer_depth(self.pending.len() as u64);
    }

    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        self.health.set_buffer_depth(0);
        if batch.is_empty() {
            return;
        }

        let now = now_ms();
        if self.breaker.is_open(now) {
            self.to_spool(&batch);
            return;
        }

        match self.store.insert("trades", &batch).await {
            Ok(()) => {
                self.breaker.record_success();
                debug!(count = batch.len(), "trade batch persisted");
            }
            Err(e) if e.is_duplicate() => {
                // Some row in the batch already exists. Retry row-by-row so
                // the fresh rows still land. Idempotent retries are success.
                self.breaker.record_success();
                self.insert_individually(batch).await;
            }
            Err(e) => {
                warn!(count = batch.len(), "trade batch flush failed: {e}");
                self.breaker.record_failure(now);
                self.to_spool(&batch);
                if self.breaker.tripped() {
                    warn!(
                        "insert circuit OPEN after {} consecutive failures, spooling to {}",
                        self.cfg.fail_threshold,
                        self.spool.path().display()
                    );
                }
            }
        }
    }

    async fn insert_individually(&mut self, batch: Vec<TradeRow>) {
        let mut failed = Vec::new();
        for row in batch {
            match self.store.insert_one("trades", &row).await {
                Ok(()) => {}
                Err(e) if e.is_duplicate() => {}
                Err(e) => {
                    warn!(trade_id = %row.id, "single-row insert failed: {e}");
                    failed.push(row);
                }
            }
        }
        if !failed.is_empty() {
            self.breaker.record_failure(now_ms());
            self.to_spool(&failed);
        }
    }

    fn to_spool(&self, batch: &[TradeRow]) {
        match self.spool.append_batch(batch) {
            Ok(()) => {
                info!(count = batch.len(), "batch journaled to spool");
                self.health.set_spool_backlog(self.spool.backlog() as u64);
            }
            Err(e) => warn!("spool append failed, batch lost: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_drops_within_ttl_and_readmits_after() {
        let mut cache = DedupeCache::new(1_000, 100);
        assert!(cache.insert("t1", 0));
        assert!(!cache.insert("t1", 500));
        // TTL expired: id may be resubmitted (the store still rejects it
        // as a duplicate key downstream).
        assert!(cache.insert("t1", 1_500));
    }

    #[test]
    fn dedupe_respects_size_cap() {
        let mut cache = DedupeCache::new(i64::MAX / 2, 3);
        for i in 0..10 {
            assert!(cache.insert(&format!("t{i}"), i));
        }
        assert!(cache.len() <= 4);
        // Recent entries survive.
        assert!(!cache.insert("t9", 11));
    }

    #[test]
    fn breaker_trips_after_threshold_consecutive_failures() {
        let mut b = FlushBreaker::new(60_000, 3);
        b.record_failure(0);
        b.record_failure(100);
        assert!(!b.is_open(150));
        b.record_failure(200);
        assert!(b.is_open(250));
        // Quiet window since last failure half-opens.
        assert!(!b.is_open(200 + 60_001));
    }

    #[test]
    fn breaker_success_resets_count() {
        let mut b = FlushBreaker::new(60_000, 3);
        b.record_failure(0);
        b.record_failure(1);
        b.record_success();
        b.record_failure(2);
        assert!(!b.is_open(3));
    }

    #[test]
    fn breaker_window_rolls_stale_failures_off() {
        let mut b = FlushBreaker::new(1_000, 3);
        b.record_failure(0);
        b.record_failure(10);
        // Next failure starts a fresh window; the first two are stale.
        b.record_failure(5_000);
        assert!(!b.is_open(5_001));
    }
}
