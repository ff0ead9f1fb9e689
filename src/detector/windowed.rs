use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{DetectConfig, WindowParams};
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{
    AggregateRow, MovementReason, MovementRow, MovementStatus, NormalizedTrade, TickRow, TradeRow,
    WindowType,
};
use crate::util::{bucket, ms_to_iso, now_ms};

/// Price level quantization for unique-level counting.
const LEVEL_QUANTUM: f64 = 1e-4;

/// Metrics computed over one scan window. Prices come from mid-ticks where
/// available, falling back to trade prints.
#[derive(Debug, Clone, Default)]
pub struct WindowMetrics {
    pub first_price: f64,
    pub last_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub drift: f64,
    pub range: f64,
    pub abs_move: f64,
    pub window_volume: f64,
    pub max_hour_volume: f64,
    pub trades_count: i64,
    pub price_levels: i64,
    pub avg_trade_size: f64,
    pub velocity: f64,
}

/// Compute window metrics from (ts_ms, price) series and (ts_ms, price,
/// size) trades. Returns None when there is no usable price series.
pub fn compute_metrics(
    ticks: &[(i64, f64)],
    trades: &[(i64, f64, f64)],
    window_ms: i64,
) -> Option<WindowMetrics> {
    let series: Vec<(i64, f64)> = if !ticks.is_empty() {
        ticks.to_vec()
    } else {
        trades.iter().map(|(ts, p, _)| (*ts, *p)).collect()
    };
    if series.is_empty() {
        return None;
    }

    let first_price = series.first().map(|(_, p)| *p)?;
    let last_price = series.last().map(|(_, p)| *p)?;
    let mut min_price = f64::INFINITY;
    let mut max_price = f64::NEG_INFINITY;
    let mut levels = std::collections::HashSet::new();
    for (_, p) in &series {
        min_price = min_price.min(*p);
        max_price = max_price.max(*p);
        levels.insert((p / LEVEL_QUANTUM).round() as i64);
    }

    let drift = if first_price > 0.0 {
        (last_price - first_price) / first_price
    } else {
        0.0
    };
    let range = if min_price > 0.0 {
        (max_price - min_price) / min_price
    } else {
        0.0
    };

    let window_volume: f64 = trades.iter().map(|(_, _, s)| s).sum();
    let mut hour_volumes: HashMap<i64, f64> = HashMap::new();
    for (ts, _, size) in trades {
        *hour_volumes.entry(ts / 3_600_000).or_default() += size;
    }
    let max_hour_volume = hour_volumes.values().copied().fold(0.0, f64::max);
    let trades_count = trades.len() as i64;
    let avg_trade_size = if trades_count > 0 {
        window_volume / trades_count as f64
    } else {
        0.0
    };

    let window_minutes = (window_ms as f64 / 60_000.0).max(1.0);
    let velocity = drift.abs() / window_minutes.sqrt();

    Some(WindowMetrics {
        first_price,
        last_price,
        min_price,
        max_price,
        drift,
        range,
        abs_move: (last_price - first_price).abs(),
        window_volume,
        max_hour_volume,
        trades_count,
        price_levels: levels.len() as i64,
        avg_trade_size,
        velocity,
    })
}

/// Hourly volume baseline from the market aggregate:
/// `total_volume / observed_days / 24` with `observed_days = min(30,
/// age_days)`. Volume rules need at least 3 days of history.
pub fn hourly_baseline(aggregate: Option<&AggregateRow>, now: i64) -> Option<f64> {
    let agg = aggregate?;
    let first_seen = crate::util::iso_to_ms(&agg.first_seen)?;
    let age_days = (now - first_seen) as f64 / 86_400_000.0;
    if age_days < 3.0 {
        return None;
    }
    let observed_days = age_days.min(30.0);
    Some(agg.total_volume / observed_days / 24.0)
}

/// Volume ratios against the baseline: `(volume_ratio, hourly_ratio)`.
pub fn volume_ratios(m: &WindowMetrics, baseline_hourly: Option<f64>, window_ms: i64) -> (f64, f64) {
    let Some(hb) = baseline_hourly.filter(|hb| *hb > 0.0) else {
        return (0.0, 0.0);
    };
    let window_hours = (window_ms as f64 / 3_600_000.0).max(1.0 / 60.0);
    let scaled = hb * window_hours;
    (m.window_volume / scaled, m.max_hour_volume / hb)
}

/// Apply the hit rules and pick a reason. None means no movement.
pub fn evaluate_reason(
    m: &WindowMetrics,
    params: &WindowParams,
    min_price_for_alert: f64,
    velocity_threshold: f64,
    thin: bool,
    volume_ratio: f64,
    hourly_ratio: f64,
) -> Option<MovementReason> {
    let threshold = if thin {
        params.thin_threshold
    } else {
        params.price_threshold
    };

    // The first-price floor guards both clauses; a min of zero can never
    // manufacture an infinite range hit. The absolute-move minimum applies
    // to the range clause only.
    let price_floor_ok = m.first_price >= min_price_for_alert && m.min_price > 0.0;
    let price_hit = price_floor_ok
        && (m.drift.abs() >= threshold
            || (m.range >= threshold && m.abs_move >= params.min_abs_move));

    let vol_hit =
        volume_ratio >= params.volume_threshold || hourly_ratio >= params.volume_threshold;

    let velocity_hit = m.velocity >= velocity_threshold;

    match (price_hit, vol_hit, velocity_hit) {
        (true, _, true) => Some(MovementReason::Velocity),
        (true, true, false) => Some(MovementReason::Both),
        (true, false, false) => Some(MovementReason::Price),
        (false, true, _) => Some(MovementReason::Volume),
        _ => None,
    }
}

/// Bucketed idempotency id: `market:outcome:window:bucket`.
pub fn movement_id(
    market_id: &str,
    outcome: &str,
    window: WindowType,
    now: i64,
    divisor_ms: i64,
) -> String {
    format!(
        "{market_id}:{outcome}:{}:{}",
        window.as_str(),
        bucket(now, divisor_ms)
    )
}

// ---------------------------------------------------------------------------
// Detector task
// ---------------------------------------------------------------------------

/// Every trade triggers a scan over the configured windows for its
/// (market, outcome), gated by a per-(market, outcome, window) cooldown.
/// Inserts are idempotent per bucketed id.
pub struct WindowedDetector {
    cfg: DetectConfig,
    store: Arc<StoreGateway>,
    trade_rx: mpsc::Receiver<NormalizedTrade>,
    /// (market, outcome, window) → (last scan ts, price at last scan).
    cooldowns: HashMap<(String, String, WindowType), (i64, f64)>,
}

impl WindowedDetector {
    pub fn new(
        cfg: DetectConfig,
        store: Arc<StoreGateway>,
        trade_rx: mpsc::Receiver<NormalizedTrade>,
    ) -> Self {
        Self {
            cfg,
            store,
            trade_rx,
            cooldowns: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(trade) = self.trade_rx.recv().await {
            let windows: Vec<WindowParams> = self.cfg.windows.clone();
            for params in windows {
                let key = (
                    trade.market_id.clone(),
                    trade.outcome.clone(),
                    params.window,
                );
                let now = now_ms();
                // Gate between trades: a rescan needs either elapsed time or
                // a real price step since the last scan.
                if self.cooldowns.get(&key).is_some_and(|(last_ts, last_price)| {
                    now - last_ts < self.cfg.min_ms_between_scans
                        && (trade.price - last_price).abs() < self.cfg.min_step
                }) {
                    continue;
                }
                self.cooldowns.insert(key, (now, trade.price));

                if let Err(e) = self.scan(&trade.market_id, &trade.outcome, &params).await {
                    warn!(
                        market_id = %trade.market_id,
                        window = params.window.as_str(),
                        "window scan failed: {e}"
                    );
                }
            }
            self.prune_cooldowns();
        }
    }

    async fn scan(
        &self,
        market_id: &str,
        outcome: &str,
        params: &WindowParams,
    ) -> crate::error::Result<()> {
        let now = now_ms();
        let start = now - params.duration_ms;
        let start_iso = ms_to_iso(start);

        let tick_rows: Vec<TickRow> = self
            .store
            .fetch_as(
                "market_ticks",
                &Query::new()
                    .eq("market_id", market_id)
                    .eq("outcome", outcome)
                    .gte("ts", &start_iso)
                    .order_asc("ts")
                    .limit(2_000),
            )
            .await?;
        let trade_rows: Vec<TradeRow> = self
            .store
            .fetch_as(
                "trades",
                &Query::new()
                    .eq("market_id", market_id)
                    .eq("outcome", outcome)
                    .gte("ts", &start_iso)
                    .order_asc("ts")
                    .limit(2_000),
            )
            .await?;

        let ticks: Vec<(i64, f64)> = tick_rows.iter().map(|t| (t.ts_ms(), t.mid)).collect();
        let trades: Vec<(i64, f64, f64)> = trade_rows
            .iter()
            .map(|t| (t.ts_ms(), t.price, t.size))
            .collect();

        let Some(metrics) = compute_metrics(&ticks, &trades, params.duration_ms) else {
            return Ok(());
        };

        let aggregate: Vec<AggregateRow> = self
            .store
            .fetch_as(
                "market_aggregates",
                &Query::new().eq("market_id", market_id).limit(1),
            )
            .await?;
        let baseline = hourly_baseline(aggregate.first(), now);
        let (volume_ratio, hourly_ratio) = volume_ratios(&metrics, baseline, params.duration_ms);

        let thin = metrics.window_volume < self.cfg.thin_volume_floor
            || metrics.trades_count < self.cfg.thin_min_trades;

        let Some(reason) = evaluate_reason(
            &metrics,
            params,
            self.cfg.min_price_for_alert,
            self.cfg.velocity_threshold,
            thin,
            volume_ratio,
            hourly_ratio,
        ) else {
            return Ok(());
        };

        let id = movement_id(market_id, outcome, params.window, now, params.bucket_divisor_ms);
        let row = MovementRow {
            id: id.clone(),
            market_id: market_id.to_string(),
            outcome: outcome.to_string(),
            window_type: params.window.as_str().to_string(),
            window_start: start_iso,
            window_end: ms_to_iso(now),
            start_price: metrics.first_price,
            end_price: metrics.last_price,
            min_price: metrics.min_price,
            max_price: metrics.max_price,
            pct_change: metrics.drift,
            range_pct: metrics.range,
            window_volume: metrics.window_volume,
            volume_ratio,
            hourly_ratio,
            trades_count: metrics.trades_count,
            price_levels: metrics.price_levels,
            avg_trade_size: metrics.avg_trade_size,
            velocity: metrics.velocity,
            reason: reason.as_str().to_string(),
            thin_liquidity: thin,
            status: MovementStatus::Open.as_str().to_string(),
            finalize_at: ms_to_iso(now + params.settle_delay_ms),
        };

        match self.store.insert_one("movements", &row).await {
            Ok(()) => {
                debug!(
                    movement_id = %id,
                    reason = reason.as_str(),
                    drift = metrics.drift,
                    "movement OPEN"
                );
                Ok(())
            }
            Err(e) if e.is_duplicate() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn prune_cooldowns(&mut self) {
        if self.cooldowns.len() < 10_000 {
            return;
        }
        let cutoff = now_ms() - self.cfg.min_ms_between_scans * 4;
        self.cooldowns.retain(|_, (last_ts, _)| *last_ts >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_5m() -> WindowParams {
        WindowParams {
            window: WindowType::M5,
            duration_ms: 300_000,
            price_threshold: 0.06,
            thin_threshold: 0.09,
            min_abs_move: 0.02,
            volume_threshold: 3.0,
            bucket_divisor_ms: 1_800_000,
            settle_delay_ms: 600_000,
            early_finalize_min_ms: 120_000,
        }
    }

    /// Scenario: 20 trades on "Yes" rising 0.40 → 0.50 over 10 minutes.
    fn rising_trades() -> Vec<(i64, f64, f64)> {
        (0..20)
            .map(|i| {
                let ts = i as i64 * 30_000;
                let price = 0.40 + 0.10 * (i as f64 / 19.0);
                (ts, price, 50.0)
            })
            .collect()
    }

    #[test]
    fn drift_and_volume_produce_both() {
        let trades = rising_trades();
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert!((m.drift - 0.25).abs() < 1e-9);
        assert_eq!(m.trades_count, 20);
        assert_eq!(m.window_volume, 1_000.0);

        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 3.5, 0.0);
        assert_eq!(reason, Some(MovementReason::Both));
    }

    #[test]
    fn price_only_when_volume_baseline_missing() {
        let trades = rising_trades();
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0);
        assert_eq!(reason, Some(MovementReason::Price));
    }

    #[test]
    fn velocity_with_price_wins_over_both() {
        let trades = rising_trades();
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        // velocity = 0.25/sqrt(5) ≈ 0.112
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 0.05, false, 3.5, 3.5);
        assert_eq!(reason, Some(MovementReason::Velocity));
    }

    #[test]
    fn min_price_floor_blocks_price_hit() {
        // First price below the alert floor.
        let trades: Vec<(i64, f64, f64)> = vec![(0, 0.01, 10.0), (60_000, 0.05, 10.0)];
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert!(m.drift > 3.0);
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0);
        assert_eq!(reason, None);
    }

    #[test]
    fn zero_min_price_never_passes_price_hit() {
        let trades: Vec<(i64, f64, f64)> = vec![(0, 0.10, 10.0), (30_000, 0.0, 10.0), (60_000, 0.15, 10.0)];
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert_eq!(m.min_price, 0.0);
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0);
        assert_eq!(reason, None);
    }

    #[test]
    fn thin_markets_use_the_looser_threshold() {
        // 7% drift: above the 6% normal threshold, below the 9% thin one.
        let trades: Vec<(i64, f64, f64)> = vec![(0, 0.40, 10.0), (60_000, 0.428, 10.0)];
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert!(evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0).is_some());
        assert!(evaluate_reason(&m, &params_5m(), 0.05, 10.0, true, 0.0, 0.0).is_none());
    }

    #[test]
    fn large_drift_hits_even_with_small_absolute_move() {
        // 20% drift at low prices: 0.060 → 0.072 moves only 1.2 cents,
        // under min_abs_move, but the drift clause carries no such gate.
        let trades: Vec<(i64, f64, f64)> = vec![(0, 0.060, 10.0), (60_000, 0.072, 10.0)];
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert!(m.drift.abs() >= 0.06);
        assert!(m.abs_move < 0.02);
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0);
        assert_eq!(reason, Some(MovementReason::Price));
    }

    #[test]
    fn range_clause_still_requires_the_absolute_minimum() {
        // Round trip: wide range, negligible net drift, tiny absolute move.
        let trades: Vec<(i64, f64, f64)> =
            vec![(0, 0.40, 10.0), (30_000, 0.44, 10.0), (60_000, 0.405, 10.0)];
        let m = compute_metrics(&[], &trades, 300_000).unwrap();
        assert!(m.drift.abs() < 0.06);
        assert!(m.range >= 0.06);
        assert!(m.abs_move < 0.02);
        let reason = evaluate_reason(&m, &params_5m(), 0.05, 10.0, false, 0.0, 0.0);
        assert_eq!(reason, None);
    }

    #[test]
    fn ticks_preferred_over_trades_for_prices() {
        let ticks = vec![(0i64, 0.50), (60_000, 0.55)];
        let trades = vec![(0i64, 0.10, 5.0), (60_000, 0.90, 5.0)];
        let m = compute_metrics(&ticks, &trades, 300_000).unwrap();
        assert_eq!(m.first_price, 0.50);
        assert_eq!(m.last_price, 0.55);
        // Volume still comes from trades.
        assert_eq!(m.window_volume, 10.0);
    }

    #[test]
    fn movement_id_is_stable_within_bucket() {
        let a = movement_id("m1", "Yes", WindowType::M5, 1_800_000 * 40 + 5, 1_800_000);
        let b = movement_id("m1", "Yes", WindowType::M5, 1_800_000 * 40 + 900_000, 1_800_000);
        let c = movement_id("m1", "Yes", WindowType::M5, 1_800_000 * 41, 1_800_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "m1:Yes:5m:40");
    }

    #[test]
    fn baseline_requires_three_days_of_history() {
        let now = 100 * 86_400_000i64;
        let mut agg = AggregateRow {
            market_id: "m1".to_string(),
            trade_count: 100,
            total_volume: 7_200.0,
            buy_volume: 3_600.0,
            sell_volume: 3_600.0,
            avg_trade_size: 72.0,
            first_price: 0.5,
            last_price: 0.5,
            min_price: 0.4,
            max_price: 0.6,
            first_seen: ms_to_iso(now - 10 * 86_400_000),
            last_seen: ms_to_iso(now),
        };
        // 10 observed days → 7200/10/24 = 30/hour.
        let hb = hourly_baseline(Some(&agg), now).unwrap();
        assert!((hb - 30.0).abs() < 1e-9);

        agg.first_seen = ms_to_iso(now - 2 * 86_400_000);
        assert!(hourly_baseline(Some(&agg), now).is_none());

        // Age capped at 30 observed days.
        agg.first_seen = ms_to_iso(now - 90 * 86_400_000);
        let hb = hourly_baseline(Some(&agg), now).unwrap();
        assert!((hb - 10.0).abs() < 1e-9);
    }
}
