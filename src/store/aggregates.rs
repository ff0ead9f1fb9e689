use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::AggregateConfig;
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{AggregateRow, NormalizedTrade, Side};
use crate::util::{ms_to_iso, now_ms};

/// In-memory delta accumulated between flushes for one market.
#[derive(Debug, Clone)]
pub struct AggDelta {
    pub count: i64,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub first_price: f64,
    pub first_ts: i64,
    pub last_price: f64,
    pub last_ts: i64,
}

impl AggDelta {
    fn from_trade(t: &NormalizedTrade) -> Self {
        let (buy, sell) = match t.side {
            Side::Buy => (t.size, 0.0),
            Side::Sell => (0.0, t.size),
        };
        Self {
            count: 1,
            total_volume: t.size,
            buy_volume: buy,
            sell_volume: sell,
            min_price: t.price,
            max_price: t.price,
            first_price: t.price,
            first_ts: t.ts_ms,
            last_price: t.price,
            last_ts: t.ts_ms,
        }
    }

    fn merge_trade(&mut self, t: &NormalizedTrade) {
        self.count += 1;
        self.total_volume += t.size;
        match t.side {
            Side::Buy => self.buy_volume += t.size,
            Side::Sell => self.sell_volume += t.size,
        }
        self.min_price = self.min_price.min(t.price);
        self.max_price = self.max_price.max(t.price);
        if t.ts_ms < self.first_ts {
            self.first_ts = t.ts_ms;
            self.first_price = t.price;
        }
        // Ties on last_ts: the later-merged trade wins.
        if t.ts_ms >= self.last_ts {
            self.last_ts = t.ts_ms;
            self.last_price = t.price;
        }
    }

    /// Re-absorb a delta whose flush failed so nothing is lost.
    fn merge_delta(&mut self, other: &AggDelta) {
        self.count += other.count;
        self.total_volume += other.total_volume;
        self.buy_volume += other.buy_volume;
        self.sell_volume += other.sell_volume;
        self.min_price = self.min_price.min(other.min_price);
        self.max_price = self.max_price.max(other.max_price);
        if other.first_ts < self.first_ts {
            self.first_ts = other.first_ts;
            self.first_price = other.first_price;
        }
        if other.last_ts >= self.last_ts {
            self.last_ts = other.last_ts;
            self.last_price = other.last_price;
        }
    }
}

/// Merge a delta into the current stored row (or mint a fresh row).
/// Counts and volumes are additive, min/max monotone, the average runs.
pub fn merge_row(current: Option<&AggregateRow>, market_id: &str, d: &AggDelta) -> AggregateRow {
    match current {
        None => AggregateRow {
            market_id: market_id.to_string(),
            trade_count: d.count,
            total_volume: d.total_volume,
            buy_volume: d.buy_volume,
            sell_volume: d.sell_volume,
            avg_trade_size: if d.count > 0 { d.total_volume / d.count as f64 } else { 0.0 },
            first_price: d.first_price,
            last_price: d.last_price,
            min_price: d.min_price,
            max_price: d.max_price,
            first_seen: ms_to_iso(d.first_ts),
            last_seen: ms_to_iso(d.last_ts),
        },
        Some(cur) => {
            let new_count = cur.trade_count + d.count;
            let avg = if new_count > 0 {
                (cur.avg_trade_size * cur.trade_count as f64 + d.total_volume) / new_count as f64
            } else {
                0.0
            };
            let cur_first_ms = crate::util::iso_to_ms(&cur.first_seen).unwrap_or(i64::MAX);
            let cur_last_ms = crate::util::iso_to_ms(&cur.last_seen).unwrap_or(0);
            AggregateRow {
                market_id: market_id.to_string(),
                trade_count: new_count,
                total_volume: cur.total_volume + d.total_volume,
                buy_volume: cur.buy_volume + d.buy_volume,
                sell_volume: cur.sell_volume + d.sell_volume,
                avg_trade_size: avg,
                first_price: if d.first_ts < cur_first_ms { d.first_price } else { cur.first_price },
                last_price: if d.last_ts >= cur_last_ms { d.last_price } else { cur.last_price },
                min_price: cur.min_price.min(d.min_price),
                max_price: cur.max_price.max(d.max_price),
                first_seen: ms_to_iso(cur_first_ms.min(d.first_ts)),
                last_seen: ms_to_iso(cur_last_ms.max(d.last_ts)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-market aggregate buffer with adaptive flush cadence. The interval
/// accelerates when recent flushes averaged ≥25 trades and decelerates at ≤3,
/// clamped to the configured envelope. A per-market size trigger flushes
/// early at `max_trades`.
pub struct AggregateEngine {
    cfg: AggregateConfig,
    store: Arc<StoreGateway>,
    rx: mpsc::Receiver<NormalizedTrade>,
    deltas: HashMap<String, AggDelta>,
    current_flush_ms: u64,
    recent_flush_counts: VecDeque<usize>,
}

impl AggregateEngine {
    pub fn new(
        cfg: AggregateConfig,
        store: Arc<StoreGateway>,
        rx: mpsc::Receiver<NormalizedTrade>,
    ) -> Self {
        let current_flush_ms = cfg.flush_ms;
        Self {
            cfg,
            store,
            rx,
            deltas: HashMap::new(),
            current_flush_ms,
            recent_flush_counts: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let sleep = tokio::time::sleep(Duration::from_millis(self.current_flush_ms));
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    trade = self.rx.recv() => {
                        match trade {
                            Some(t) => {
                                if self.submit(&t) {
                                    // Size trigger hit for this market.
                                    let market = t.market_id.clone();
                                    self.flush_market(&market).await;
                                }
                            }
                            None => {
                                self.flush_all().await;
                                return;
                            }
                        }
                    }
                    _ = &mut sleep => break,
                }
            }

            self.flush_all().await;
        }
    }

    /// Merge a trade into its market delta. Returns true when the market hit
    /// the size trigger.
    fn submit(&mut self, t: &NormalizedTrade) -> bool {
        match self.deltas.get_mut(&t.market_id) {
            Some(d) => {
                d.merge_trade(t);
                d.count as usize >= self.cfg.max_trades
            }
            None => {
                self.deltas.insert(t.market_id.clone(), AggDelta::from_trade(t));
                false
            }
        }
    }

    async fn flush_all(&mut self) {
        let markets: Vec<String> = self.deltas.keys().cloned().collect();
        let mut flushed_trades = 0usize;
        for market in markets {
            if let Some(d) = self.deltas.get(&market) {
                flushed_trades += d.count as usize;
            }
            self.flush_market(&market).await;
        }
        self.adapt(flushed_trades);
    }

    async fn flush_market(&mut self, market_id: &str) {
        let Some(delta) = self.deltas.remove(market_id) else {
            return;
        };

        match self.flush_delta(market_id, &delta).await {
            Ok(()) => {
                debug!(market_id, count = delta.count, "aggregate flushed");
            }
            Err(e) => {
                warn!(market_id, "aggregate flush failed, re-buffering delta: {e}");
                // Nothing is lost: the delta folds back into whatever has
                // accumulated since the flush started.
                match self.deltas.get_mut(market_id) {
                    Some(d) => d.merge_delta(&delta),
                    None => {
                        self.deltas.insert(market_id.to_string(), delta);
                    }
                }
            }
        }
    }

    async fn flush_delta(
        &self,
        market_id: &str,
        delta: &AggDelta,
    ) -> std::result::Result<(), crate::store::gateway::StoreError> {
        let current: Vec<AggregateRow> = self
            .store
            .fetch_as("market_aggregates", &Query::new().eq("market_id", market_id).limit(1))
            .await?;
        let merged = merge_row(current.first(), market_id, delta);
        upsert_with_retry(&self.store, &merged, 3).await
    }

    /// Adaptive cadence from the trailing five flush sizes.
    fn adapt(&mut self, flushed_trades: usize) {
        self.recent_flush_counts.push_back(flushed_trades);
        while self.recent_flush_counts.len() > 5 {
            self.recent_flush_counts.pop_front();
        }
        let avg = self.recent_flush_counts.iter().sum::<usize>() as f64
            / self.recent_flush_counts.len().max(1) as f64;

        let next = if avg >= 25.0 {
            self.current_flush_ms / 2
        } else if avg <= 3.0 {
            self.current_flush_ms * 2
        } else {
            self.current_flush_ms
        };
        let clamped = next.clamp(self.cfg.min_flush_ms, self.cfg.max_flush_ms);
        if clamped != self.current_flush_ms {
            debug!(
                from = self.current_flush_ms,
                to = clamped,
                avg_trades = avg,
                "aggregate flush cadence adapted"
            );
            self.current_flush_ms = clamped;
        }
    }
}

/// Small bounded retry for one-off aggregate writes outside the engine loop.
pub async fn upsert_with_retry(
    store: &StoreGateway,
    row: &AggregateRow,
    attempts: u32,
) -> std::result::Result<(), crate::store::gateway::StoreError> {
    let mut last = None;
    for attempt in 0..attempts {
        match store
            .upsert("market_aggregates", std::slice::from_ref(row), "market_id")
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                warn!(market_id = %row.market_id, attempt, "aggregate upsert retry: {e}");
                tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
                last = Some(e);
            }
            Err(e) => {
                error!(market_id = %row.market_id, "aggregate upsert failed: {e}");
                return Err(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        crate::store::gateway::StoreError::Permanent("retry budget exhausted".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NormalizedTrade;

    fn trade(price: f64, size: f64, side: Side, ts_ms: i64) -> NormalizedTrade {
        NormalizedTrade {
            id: format!("t-{ts_ms}-{price}"),
            market_id: "m1".to_string(),
            outcome: "Yes".to_string(),
            outcome_index: 0,
            price,
            size,
            side,
            ts_ms,
            slug: None,
            title: None,
            event_slug: None,
            raw: serde_json::Value::Null,
        }
    }

    fn delta_of(trades: &[NormalizedTrade]) -> AggDelta {
        let mut d = AggDelta::from_trade(&trades[0]);
        for t in &trades[1..] {
            d.merge_trade(t);
        }
        d
    }

    #[test]
    fn fresh_market_first_trade_creates_correct_row() {
        let d = delta_of(&[trade(0.40, 100.0, Side::Buy, 1_000)]);
        let row = merge_row(None, "m1", &d);
        assert_eq!(row.trade_count, 1);
        assert_eq!(row.total_volume, 100.0);
        assert_eq!(row.avg_trade_size, 100.0);
        assert_eq!(row.first_price, 0.40);
        assert_eq!(row.last_price, 0.40);
    }

    #[test]
    fn aggregate_identities_hold_after_n_submissions() {
        let trades = vec![
            trade(0.40, 100.0, Side::Buy, 1_000),
            trade(0.45, 50.0, Side::Sell, 2_000),
            trade(0.50, 150.0, Side::Buy, 3_000),
        ];
        let d = delta_of(&trades);
        let row = merge_row(None, "m1", &d);

        assert_eq!(row.trade_count, 3);
        assert_eq!(row.total_volume, 300.0);
        assert_eq!(row.buy_volume + row.sell_volume, row.total_volume);
        assert!((row.avg_trade_size - 100.0).abs() < 1e-9);
        assert!(row.min_price <= row.last_price && row.last_price <= row.max_price);
    }

    #[test]
    fn running_average_merges_correctly() {
        let first = delta_of(&[trade(0.40, 100.0, Side::Buy, 1_000)]);
        let base = merge_row(None, "m1", &first);

        let second = delta_of(&[
            trade(0.45, 200.0, Side::Buy, 2_000),
            trade(0.50, 300.0, Side::Sell, 3_000),
        ]);
        let merged = merge_row(Some(&base), "m1", &second);

        assert_eq!(merged.trade_count, 3);
        assert_eq!(merged.total_volume, 600.0);
        // (100·1 + 500) / 3
        assert!((merged.avg_trade_size - 200.0).abs() < 1e-9);
        assert_eq!(merged.min_price, 0.40);
        assert_eq!(merged.max_price, 0.50);
        assert_eq!(merged.last_price, 0.50);
    }

    #[test]
    fn first_seen_is_monotone_and_last_tie_goes_to_later_merge() {
        let first = delta_of(&[trade(0.40, 10.0, Side::Buy, 5_000)]);
        let base = merge_row(None, "m1", &first);

        // Earlier trade arrives late; same last_ts as a newer price.
        let second = delta_of(&[
            trade(0.30, 10.0, Side::Buy, 1_000),
            trade(0.55, 10.0, Side::Buy, 5_000),
        ]);
        let merged = merge_row(Some(&base), "m1", &second);

        assert_eq!(merged.first_price, 0.30);
        assert_eq!(crate::util::iso_to_ms(&merged.first_seen), Some(1_000));
        // Equal lastTimestamp: the later-merged entry wins.
        assert_eq!(merged.last_price, 0.55);
    }
}
