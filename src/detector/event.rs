use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{DetectConfig, WindowParams, EVENT_MIN_CHILD_MARKETS};
use crate::detector::windowed::{
    compute_metrics, evaluate_reason, hourly_baseline, volume_ratios, WindowMetrics,
};
use crate::state::MarketCatalog;
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{
    AggregateRow, MovementRow, MovementStatus, NormalizedTrade, TickRow, TradeRow, WindowType,
};
use crate::util::{bucket, ms_to_iso, now_ms};

/// Duration label used in event movement ids (`1h`, `4h`).
fn duration_label(duration_ms: i64) -> &'static str {
    match duration_ms {
        3_600_000 => "1h",
        14_400_000 => "4h",
        _ => "1h",
    }
}

/// Combine per-child metrics into event-level metrics, each child weighted
/// by its window volume. Returns the combined metrics and the top-mover
/// child (largest |drift| among children with volume).
pub fn aggregate_children(
    children: &[(String, WindowMetrics)],
    all_trades: &[(i64, f64, f64)],
    window_ms: i64,
) -> Option<(WindowMetrics, String)> {
    let weighted: Vec<&(String, WindowMetrics)> = children
        .iter()
        .filter(|(_, m)| m.window_volume > 0.0)
        .collect();
    if weighted.is_empty() {
        return None;
    }

    let total_weight: f64 = weighted.iter().map(|(_, m)| m.window_volume).sum();
    let mean = |f: fn(&WindowMetrics) -> f64| -> f64 {
        weighted
            .iter()
            .map(|(_, m)| f(m) * m.window_volume)
            .sum::<f64>()
            / total_weight
    };

    let first_price = mean(|m| m.first_price);
    let last_price = mean(|m| m.last_price);
    let min_price = mean(|m| m.min_price);
    let max_price = mean(|m| m.max_price);

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

    let mut hour_volumes: HashMap<i64, f64> = HashMap::new();
    for (ts, _, size) in all_trades {
        *hour_volumes.entry(ts / 3_600_000).or_default() += size;
    }
    let max_hour_volume = hour_volumes.values().copied().fold(0.0, f64::max);

    let trades_count: i64 = children.iter().map(|(_, m)| m.trades_count).sum();
    let price_levels: i64 = children.iter().map(|(_, m)| m.price_levels).sum();
    let window_minutes = (window_ms as f64 / 60_000.0).max(1.0);

    let top_mover = weighted
        .iter()
        .max_by(|(_, a), (_, b)| {
            a.drift
                .abs()
                .partial_cmp(&b.drift.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, _)| id.clone())?;

    Some((
        WindowMetrics {
            first_price,
            last_price,
            min_price,
            max_price,
            drift,
            range,
            abs_move: (last_price - first_price).abs(),
            window_volume: total_weight,
            max_hour_volume,
            trades_count,
            price_levels,
            avg_trade_size: if trades_count > 0 {
                total_weight / trades_count as f64
            } else {
                0.0
            },
            velocity: drift.abs() / window_minutes.sqrt(),
        },
        top_mover,
    ))
}

// ---------------------------------------------------------------------------
// Detector task
// ---------------------------------------------------------------------------

/// Runs the window-scan algorithm across all child markets of one event,
/// volume-weighted, with slightly looser thresholds than single-market
/// windows. Identity is `event:<slug>`.
pub struct EventMovementDetector {
    cfg: DetectConfig,
    store: Arc<StoreGateway>,
    catalog: Arc<MarketCatalog>,
    trade_rx: mpsc::Receiver<NormalizedTrade>,
    cooldowns: HashMap<(String, i64), i64>,
}

impl EventMovementDetector {
    pub fn new(
        cfg: DetectConfig,
        store: Arc<StoreGateway>,
        catalog: Arc<MarketCatalog>,
        trade_rx: mpsc::Receiver<NormalizedTrade>,
    ) -> Self {
        Self {
            cfg,
            store,
            catalog,
            trade_rx,
            cooldowns: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(trade) = self.trade_rx.recv().await {
            let Some(event_slug) = trade
                .event_slug
                .clone()
                .or_else(|| self.catalog.event_for_market(&trade.market_id))
            else {
                continue;
            };

            let children = self.catalog.event_children(&event_slug);
            if children.len() < EVENT_MIN_CHILD_MARKETS {
                continue;
            }

            let windows: Vec<WindowParams> = self.cfg.event_windows.clone();
            for params in windows {
                let key = (event_slug.clone(), params.duration_ms);
                let now = now_ms();
                if self
                    .cooldowns
                    .get(&key)
                    .is_some_and(|last| now - last < self.cfg.min_ms_between_scans)
                {
                    continue;
                }
                self.cooldowns.insert(key, now);

                if let Err(e) = self.scan(&event_slug, &children, &params).await {
                    warn!(event_slug = %event_slug, "event scan failed: {e}");
                }
            }
        }
    }

    async fn scan(
        &self,
        event_slug: &str,
        children: &[String],
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
                    .in_list("market_id", children.iter())
                    .gte("ts", &start_iso)
                    .order_asc("ts")
                    .limit(4_000),
            )
            .await?;
        let trade_rows: Vec<TradeRow> = self
            .store
            .fetch_as(
                "trades",
                &Query::new()
                    .in_list("market_id", children.iter())
                    .gte("ts", &start_iso)
                    .order_asc("ts")
                    .limit(4_000),
            )
            .await?;

        // Per-child series from its own ticks and trades.
        let mut per_child: Vec<(String, WindowMetrics)> = Vec::new();
        let mut all_trades: Vec<(i64, f64, f64)> = Vec::new();
        for child in children {
            let ticks: Vec<(i64, f64)> = tick_rows
                .iter()
                .filter(|t| &t.market_id == child)
                .map(|t| (t.ts_ms(), t.mid))
                .collect();
            let trades: Vec<(i64, f64, f64)> = trade_rows
                .iter()
                .filter(|t| &t.market_id == child)
                .map(|t| (t.ts_ms(), t.price, t.size))
                .collect();
            all_trades.extend(trades.iter().copied());
            if let Some(m) = compute_metrics(&ticks, &trades, params.duration_ms) {
                per_child.push((child.clone(), m));
            }
        }

        let Some((metrics, top_mover)) =
            aggregate_children(&per_child, &all_trades, params.duration_ms)
        else {
            return Ok(());
        };

        // Event baseline: sum of child aggregates.
        let aggregates: Vec<AggregateRow> = self
            .store
            .fetch_as(
                "market_aggregates",
                &Query::new().in_list("market_id", children.iter()),
            )
            .await?;
        let baseline: Option<f64> = {
            let baselines: Vec<f64> = aggregates
                .iter()
                .filter_map(|a| hourly_baseline(Some(a), now))
                .collect();
            (!baselines.is_empty()).then(|| baselines.iter().sum())
        };
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

        let market_id = format!("event:{event_slug}");
        let id = format!(
            "event:{event_slug}:EVENT:{}:{}",
            duration_label(params.duration_ms),
            bucket(now, params.bucket_divisor_ms)
        );
        let row = MovementRow {
            id: id.clone(),
            market_id,
            outcome: "EVENT".to_string(),
            window_type: WindowType::Event.as_str().to_string(),
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
                    top_mover = %top_mover,
                    reason = reason.as_str(),
                    "event movement OPEN"
                );
                Ok(())
            }
            Err(e) if e.is_duplicate() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, first: f64, last: f64, volume: f64, trades: i64) -> (String, WindowMetrics) {
        (
            id.to_string(),
            WindowMetrics {
                first_price: first,
                last_price: last,
                min_price: first.min(last),
                max_price: first.max(last),
                drift: (last - first) / first,
                range: (first.max(last) - first.min(last)) / first.min(last),
                abs_move: (last - first).abs(),
                window_volume: volume,
                max_hour_volume: volume,
                trades_count: trades,
                price_levels: 4,
                avg_trade_size: if trades > 0 { volume / trades as f64 } else { 0.0 },
                velocity: 0.0,
            },
        )
    }

    #[test]
    fn children_are_volume_weighted() {
        let children = vec![
            child("m1", 0.40, 0.50, 900.0, 9),
            child("m2", 0.60, 0.60, 100.0, 1),
        ];
        let trades = vec![(0i64, 0.45, 900.0), (1_000, 0.60, 100.0)];
        let (m, top) = aggregate_children(&children, &trades, 3_600_000).unwrap();

        // 0.9·0.40 + 0.1·0.60 = 0.42; 0.9·0.50 + 0.1·0.60 = 0.51
        assert!((m.first_price - 0.42).abs() < 1e-9);
        assert!((m.last_price - 0.51).abs() < 1e-9);
        assert_eq!(m.window_volume, 1_000.0);
        assert_eq!(m.trades_count, 10);
        assert_eq!(top, "m1");
    }

    #[test]
    fn zero_volume_children_are_ignored() {
        let children = vec![
            child("m1", 0.40, 0.50, 500.0, 5),
            child("m2", 0.10, 0.90, 0.0, 0),
        ];
        let trades = vec![(0i64, 0.45, 500.0)];
        let (m, top) = aggregate_children(&children, &trades, 3_600_000).unwrap();
        assert!((m.first_price - 0.40).abs() < 1e-9);
        assert_eq!(top, "m1");
    }

    #[test]
    fn all_silent_children_produce_nothing() {
        let children = vec![child("m1", 0.40, 0.50, 0.0, 0)];
        assert!(aggregate_children(&children, &[], 3_600_000).is_none());
    }

    #[test]
    fn event_id_uses_duration_label_and_bucket() {
        assert_eq!(duration_label(3_600_000), "1h");
        assert_eq!(duration_label(14_400_000), "4h");
    }
}
