use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{DetectConfig, FINALIZE_BATCH_SIZE, FINALIZE_TICK_CAP};
use crate::detector::windowed::compute_metrics;
use crate::scorer::signal::SignalScorer;
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{MovementRow, MovementStatus, TickRow, TradeRow, WindowType};
use crate::util::{iso_to_ms, ms_to_iso, now_ms};

/// Range below which a market is considered stabilized for early
/// finalization.
const EARLY_STABLE_RANGE: f64 = 0.01;
/// Samples required to trust the stability reading.
const EARLY_STABLE_SAMPLES: usize = 3;
/// Recent-tick lookback for the stability check.
const EARLY_LOOKBACK_MS: i64 = 120_000;

/// Polls OPEN movements whose settle deadline has passed (or whose recent
/// tick range has stabilized) and re-scores them with settled data.
/// A movement is always marked FINAL, even when scoring fails; a bad row
/// must never loop.
pub struct FinalizeWorker {
    cfg: DetectConfig,
    store: Arc<StoreGateway>,
    scorer: Arc<SignalScorer>,
}

impl FinalizeWorker {
    pub fn new(cfg: DetectConfig, store: Arc<StoreGateway>, scorer: Arc<SignalScorer>) -> Self {
        Self { cfg, store, scorer }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_millis(self.cfg.finalize_poll_ms));
        ticker.tick().await; // consume immediate first tick

        loop {
            ticker.tick().await;
            if let Err(e) = self.finalize_due().await {
                error!("finalize pass failed: {e}");
            }
            if let Err(e) = self.finalize_early().await {
                error!("early-finalize pass failed: {e}");
            }
        }
    }

    /// (a) Due movements, oldest first, bounded batch.
    async fn finalize_due(&self) -> crate::error::Result<()> {
        let now_iso = ms_to_iso(now_ms());
        let due: Vec<MovementRow> = self
            .store
            .fetch_as(
                "movements",
                &Query::new()
                    .eq("status", MovementStatus::Open.as_str())
                    .lte("finalize_at", &now_iso)
                    .order_asc("finalize_at")
                    .limit(FINALIZE_BATCH_SIZE),
            )
            .await?;

        for movement in due {
            if let Err(e) = self.finalize_movement(&movement).await {
                warn!(movement_id = %movement.id, "finalize failed: {e}");
            }
        }
        Ok(())
    }

    /// (b) Early finalization: past the per-window minimum age and the
    /// recent ticks are absent or flat.
    async fn finalize_early(&self) -> crate::error::Result<()> {
        let now = now_ms();
        let not_due: Vec<MovementRow> = self
            .store
            .fetch_as(
                "movements",
                &Query::new()
                    .eq("status", MovementStatus::Open.as_str())
                    .gt("finalize_at", &ms_to_iso(now))
                    .order_asc("window_start")
                    .limit(50),
            )
            .await?;

        for movement in not_due {
            let Some(start_ms) = iso_to_ms(&movement.window_start) else {
                continue;
            };
            let min_age = self.early_min_age_ms(movement.window());
            if now - start_ms < min_age {
                continue;
            }
            if !self.is_stabilized(&movement, now).await? {
                continue;
            }
            info!(movement_id = %movement.id, "early finalization: window stabilized");
            if let Err(e) = self.finalize_movement(&movement).await {
                warn!(movement_id = %movement.id, "early finalize failed: {e}");
            }
        }
        Ok(())
    }

    fn early_min_age_ms(&self, window: WindowType) -> i64 {
        match window {
            WindowType::M5 | WindowType::Event => 120_000,
            WindowType::M15 => 300_000,
            WindowType::H1 => 900_000,
            WindowType::H4 => 3_600_000,
        }
    }

    /// Ticks in the last two minutes are absent, or ≥3 samples span < 1%.
    async fn is_stabilized(&self, movement: &MovementRow, now: i64) -> crate::error::Result<bool> {
        let recent: Vec<TickRow> = self
            .store
            .fetch_as(
                "market_ticks",
                &Query::new()
                    .eq("market_id", &movement.market_id)
                    .eq("outcome", &movement.outcome)
                    .gte("ts", &ms_to_iso(now - EARLY_LOOKBACK_MS))
                    .order_asc("ts")
                    .limit(200),
            )
            .await?;

        if recent.is_empty() {
            return Ok(true);
        }
        if recent.len() < EARLY_STABLE_SAMPLES {
            return Ok(false);
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for t in &recent {
            min = min.min(t.mid);
            max = max.max(t.mid);
        }
        Ok(min > 0.0 && (max - min) / min < EARLY_STABLE_RANGE)
    }

    /// Re-fetch the window extended to now, recompute settled metrics,
    /// patch FINAL, then hand off to the scorer.
    async fn finalize_movement(&self, movement: &MovementRow) -> crate::error::Result<()> {
        let now = now_ms();
        let start_ms = iso_to_ms(&movement.window_start).unwrap_or(now);

        let ticks: Vec<TickRow> = self
            .store
            .fetch_as(
                "market_ticks",
                &Query::new()
                    .eq("market_id", &movement.market_id)
                    .eq("outcome", &movement.outcome)
                    .gte("ts", &movement.window_start)
                    .order_asc("ts")
                    .limit(FINALIZE_TICK_CAP),
            )
            .await?;
        let trades: Vec<TradeRow> = self
            .store
            .fetch_as(
                "trades",
                &Query::new()
                    .eq("market_id", &movement.market_id)
                    .eq("outcome", &movement.outcome)
                    .gte("ts", &movement.window_start)
                    .order_asc("ts")
                    .limit(FINALIZE_TICK_CAP),
            )
            .await?;

        let tick_series: Vec<(i64, f64)> = ticks.iter().map(|t| (t.ts_ms(), t.mid)).collect();
        let trade_series: Vec<(i64, f64, f64)> =
            trades.iter().map(|t| (t.ts_ms(), t.price, t.size)).collect();

        let mut settled = movement.clone();
        settled.window_end = ms_to_iso(now);
        settled.status = MovementStatus::Final.as_str().to_string();

        if let Some(m) = compute_metrics(&tick_series, &trade_series, (now - start_ms).max(60_000))
        {
            settled.end_price = m.last_price;
            settled.pct_change = m.drift;
            settled.min_price = m.min_price;
            settled.max_price = m.max_price;
            settled.range_pct = m.range;
            settled.window_volume = m.window_volume;
            settled.trades_count = m.trades_count;
            settled.price_levels = m.price_levels;
            settled.avg_trade_size = m.avg_trade_size;
            settled.velocity = m.velocity;
        }

        let patch = serde_json::json!({
            "status": settled.status,
            "window_end": settled.window_end,
            "end_price": settled.end_price,
            "pct_change": settled.pct_change,
            "min_price": settled.min_price,
            "max_price": settled.max_price,
            "range_pct": settled.range_pct,
            "window_volume": settled.window_volume,
            "trades_count": settled.trades_count,
            "price_levels": settled.price_levels,
            "avg_trade_size": settled.avg_trade_size,
            "velocity": settled.velocity,
        });
        self.store
            .patch("movements", &Query::new().eq("id", &movement.id), &patch)
            .await?;
        debug!(movement_id = %movement.id, "movement FINAL");

        // Scoring is best-effort: the movement stays FINAL regardless.
        if let Err(e) = self.scorer.score_movement(&settled).await {
            warn!(movement_id = %movement.id, "scoring failed after finalize: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_minimum_age_follows_window_type() {
        let cfg = crate::config::StoreConfig {
            base_url: "http://localhost:9".to_string(),
            service_key: "test".to_string(),
        };
        let store = Arc::new(StoreGateway::new(&cfg).unwrap());
        let scorer = Arc::new(SignalScorer::disconnected(Arc::clone(&store)));
        let worker = FinalizeWorker::new(crate::config::DetectConfig::for_tests(), store, scorer);
        assert_eq!(worker.early_min_age_ms(WindowType::M5), 120_000);
        assert_eq!(worker.early_min_age_ms(WindowType::Event), 120_000);
        assert_eq!(worker.early_min_age_ms(WindowType::M15), 300_000);
        assert_eq!(worker.early_min_age_ms(WindowType::H1), 900_000);
        assert_eq!(worker.early_min_age_ms(WindowType::H4), 3_600_000);
    }
}
