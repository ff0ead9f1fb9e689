use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TICK_BUCKET_MS;
use crate::store::gateway::StoreGateway;
use crate::types::{NormalizedTick, TickRow};
use crate::util::round3;

/// Last accepted tick per `(market, asset, outcome)`, compared at
/// 3-decimal precision.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LastTick {
    bid: f64,
    ask: f64,
    mid: f64,
    bucket: i64,
}

/// Dedup-by-bucket writer for top-of-book ticks. A tick is stored when any
/// of (bid, ask, mid) changed or the 2-second bucket rolled; every accepted
/// tick also overwrites the per-instrument "latest" row.
pub struct MidTickWriter {
    store: Arc<StoreGateway>,
    rx: mpsc::Receiver<NormalizedTick>,
    last: HashMap<(String, String, String), LastTick>,
}

impl MidTickWriter {
    pub fn new(store: Arc<StoreGateway>, rx: mpsc::Receiver<NormalizedTick>) -> Self {
        Self {
            store,
            rx,
            last: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(tick) = self.rx.recv().await {
            if !self.should_emit(&tick) {
                continue;
            }
            self.write(&tick).await;
        }
    }

    /// In-process dedup: emit when any rounded value changed OR the bucket
    /// rolled. Near-equal timestamps inside one bucket with differing price
    /// still emit one event per value change.
    fn should_emit(&mut self, tick: &NormalizedTick) -> bool {
        let key = (
            tick.market_id.clone(),
            tick.asset_id.clone(),
            tick.outcome.clone(),
        );
        let candidate = LastTick {
            bid: round3(tick.best_bid),
            ask: round3(tick.best_ask),
            mid: round3(tick.mid),
            bucket: tick.ts_ms / TICK_BUCKET_MS,
        };
        match self.last.get(&key) {
            Some(prev)
                if prev.bid == candidate.bid
                    && prev.ask == candidate.ask
                    && prev.mid == candidate.mid
                    && prev.bucket == candidate.bucket =>
            {
                false
            }
            _ => {
                self.last.insert(key, candidate);
                true
            }
        }
    }

    async fn write(&self, tick: &NormalizedTick) {
        let row = TickRow::from_tick(tick);

        match self.store.insert_one("market_ticks", &row).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                debug!(asset_id = %tick.asset_id, "tick already stored for bucket");
            }
            Err(e) => {
                warn!(asset_id = %tick.asset_id, "tick insert failed: {e}");
                return;
            }
        }

        if let Err(e) = self
            .store
            .upsert(
                "market_ticks_latest",
                std::slice::from_ref(&row),
                "market_id,asset_id",
            )
            .await
        {
            warn!(asset_id = %tick.asset_id, "latest-tick upsert failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tick(bid: f64, ask: f64, ts_ms: i64) -> NormalizedTick {
        let mid = (bid + ask) / 2.0;
        NormalizedTick {
            market_id: "m1".to_string(),
            asset_id: "a1".to_string(),
            outcome: "Yes".to_string(),
            best_bid: bid,
            best_ask: ask,
            mid,
            spread: ask - bid,
            spread_pct: (ask - bid) / mid,
            bid_size: 100.0,
            ask_size: 100.0,
            ts_ms,
        }
    }

    fn writer() -> MidTickWriter {
        // The store is never reached in these tests; should_emit is pure.
        let cfg = crate::config::StoreConfig {
            base_url: "http://localhost:9".to_string(),
            service_key: "test".to_string(),
        };
        let store = Arc::new(StoreGateway::new(&cfg).unwrap());
        let (_tx, rx) = mpsc::channel(4);
        MidTickWriter::new(store, rx)
    }

    #[test]
    fn identical_tick_in_same_bucket_is_suppressed() {
        let mut w = writer();
        assert!(w.should_emit(&tick(0.50, 0.52, 1_000)));
        assert!(!w.should_emit(&tick(0.50, 0.52, 1_500)));
    }

    #[test]
    fn value_change_within_bucket_emits() {
        let mut w = writer();
        assert!(w.should_emit(&tick(0.50, 0.52, 1_000)));
        assert!(w.should_emit(&tick(0.50, 0.53, 1_200)));
        // Changing back is still a change.
        assert!(w.should_emit(&tick(0.50, 0.52, 1_400)));
    }

    #[test]
    fn bucket_roll_emits_even_when_unchanged() {
        let mut w = writer();
        assert!(w.should_emit(&tick(0.50, 0.52, 1_000)));
        assert!(w.should_emit(&tick(0.50, 0.52, 1_000 + TICK_BUCKET_MS)));
    }

    #[test]
    fn sub_precision_jitter_is_ignored() {
        let mut w = writer();
        assert!(w.should_emit(&tick(0.500, 0.520, 1_000)));
        // Moves below 3-decimal precision are not value changes.
        assert!(!w.should_emit(&tick(0.5001, 0.5202, 1_500)));
    }
}
