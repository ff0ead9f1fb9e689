use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RtDetectConfig;
use crate::store::gateway::StoreGateway;
use crate::types::{FeedEvent, NormalizedTick, RtEventRow};
use crate::util::{ms_to_iso, now_ms};

const BUCKET_COUNT: usize = 60;
const BUCKET_MS: i64 = 60_000;

/// One-minute OHLC bucket in the rolling ring.
#[derive(Debug, Clone, Copy)]
struct OhlcBucket {
    minute: i64,
    high: f64,
    low: f64,
}

/// Per-asset detector state, mutated under a single owner task.
struct AssetState {
    market_id: String,
    outcome: String,
    last_price: f64,
    last_ts: i64,
    ema_fast: f64,
    ema_slow: f64,
    ema_ready: bool,
    buckets: [Option<OhlcBucket>; BUCKET_COUNT],
    /// reason → last emit ts, for per-(asset, reason) cooldowns.
    last_event_at: HashMap<&'static str, i64>,
    /// Current fast-vs-slow relationship; None until EMAs diverge once.
    ema_dir_up: Option<bool>,
    ema_confirm_count: u32,
    ema_last_fire_at: i64,
    /// Stability tracking: a price must persist before rules may fire.
    pending_price: f64,
    pending_count: u32,
    pending_since: i64,
    last_trade_at: i64,
    last_seen: i64,
}

impl AssetState {
    fn new(tick: &NormalizedTick) -> Self {
        Self {
            market_id: tick.market_id.clone(),
            outcome: tick.outcome.clone(),
            last_price: 0.0,
            last_ts: 0,
            ema_fast: tick.mid,
            ema_slow: tick.mid,
            ema_ready: false,
            buckets: [None; BUCKET_COUNT],
            last_event_at: HashMap::new(),
            ema_dir_up: None,
            ema_confirm_count: 0,
            ema_last_fire_at: 0,
            pending_price: tick.mid,
            pending_count: 0,
            pending_since: tick.ts_ms,
            last_trade_at: 0,
            last_seen: tick.ts_ms,
        }
    }

    fn bucket_update(&mut self, ts_ms: i64, price: f64) {
        let minute = ts_ms / BUCKET_MS;
        let idx = (minute % BUCKET_COUNT as i64) as usize;
        match &mut self.buckets[idx] {
            Some(b) if b.minute == minute => {
                b.high = b.high.max(price);
                b.low = b.low.min(price);
            }
            slot => {
                *slot = Some(OhlcBucket { minute, high: price, low: price });
            }
        }
    }

    /// High/low across retained buckets, excluding the current minute so a
    /// breakout compares against history rather than itself.
    fn ring_extremes(&self, ts_ms: i64) -> Option<(f64, f64)> {
        let current_minute = ts_ms / BUCKET_MS;
        let mut high = f64::NEG_INFINITY;
        let mut low = f64::INFINITY;
        let mut seen = false;
        for b in self.buckets.iter().flatten() {
            if b.minute == current_minute || b.minute + (BUCKET_COUNT as i64) < current_minute {
                continue;
            }
            high = high.max(b.high);
            low = low.min(b.low);
            seen = true;
        }
        seen.then_some((high, low))
    }
}

/// Per-asset EMA and rolling-bucket detector. Emits breakout and EMA-cross
/// events into the `rt_events` table, guarded by stability, cooldowns, and
/// a recent-trade confirmation against pure quote drift.
pub struct RealtimeDetector {
    cfg: RtDetectConfig,
    store: Arc<StoreGateway>,
    rx: mpsc::Receiver<FeedEvent>,
    states: HashMap<String, AssetState>,
    last_evict_scan: i64,
}

impl RealtimeDetector {
    pub fn new(cfg: RtDetectConfig, store: Arc<StoreGateway>, rx: mpsc::Receiver<FeedEvent>) -> Self {
        Self {
            cfg,
            store,
            rx,
            states: HashMap::new(),
            last_evict_scan: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                FeedEvent::Trade(trade) => {
                    // Trades only confirm; they are keyed by the asset's
                    // (market, outcome) identity.
                    for state in self.states.values_mut() {
                        if state.market_id == trade.market_id && state.outcome == trade.outcome {
                            state.last_trade_at = trade.ts_ms;
                        }
                    }
                }
                FeedEvent::Tick(tick) => {
                    let events = self.on_tick(&tick);
                    for row in events {
                        match self.store.insert_one("rt_events", &row).await {
                            Ok(()) => {}
                            Err(e) if e.is_duplicate() => {}
                            Err(e) => warn!(asset_id = %row.asset_id, "rt event insert failed: {e}"),
                        }
                    }
                }
            }
        }
    }

    /// Pure state transition: apply one tick, return any events to persist.
    pub fn on_tick(&mut self, tick: &NormalizedTick) -> Vec<RtEventRow> {
        self.maybe_evict(tick.ts_ms);

        let cfg = self.cfg.clone();
        let state = self
            .states
            .entry(tick.asset_id.clone())
            .or_insert_with(|| AssetState::new(tick));
        state.last_seen = tick.ts_ms;

        let price = tick.mid;

        // Entry gates.
        if tick.spread_pct > cfg.max_spread_pct {
            return vec![];
        }
        if tick.bid_size < cfg.min_top_size && tick.ask_size < cfg.min_top_size {
            return vec![];
        }
        if state.last_ts > 0 && tick.ts_ms - state.last_ts < cfg.min_update_ms {
            return vec![];
        }
        // Moves below min_step don't advance EMAs or buckets, but an
        // unchanged quote still verifies the pending price below.
        let small_step =
            state.last_ts > 0 && (price - state.last_price).abs() < cfg.min_step;

        if !small_step {
            // EMA update: alpha = 1 − exp(−Δt/τ).
            if state.ema_ready {
                let dt_secs = ((tick.ts_ms - state.last_ts).max(1)) as f64 / 1_000.0;
                let alpha_fast = 1.0 - (-dt_secs / cfg.ema_fast_tau_secs).exp();
                let alpha_slow = 1.0 - (-dt_secs / cfg.ema_slow_tau_secs).exp();
                state.ema_fast += alpha_fast * (price - state.ema_fast);
                state.ema_slow += alpha_slow * (price - state.ema_slow);
            } else {
                state.ema_fast = price;
                state.ema_slow = price;
                state.ema_ready = true;
            }
            state.bucket_update(tick.ts_ms, price);
        }

        // The current minute is excluded from the ring comparison, so the
        // just-updated bucket can't confirm its own breakout.
        let ring_extremes = state.ring_extremes(tick.ts_ms);

        // Stability: the price must persist before rules may fire.
        if (price - state.pending_price).abs() <= cfg.min_step {
            state.pending_count += 1;
        } else {
            state.pending_price = price;
            state.pending_count = 1;
            state.pending_since = tick.ts_ms;
        }
        let stable = state.pending_count >= cfg.persist_ticks
            || (state.pending_count > 0 && tick.ts_ms - state.pending_since >= cfg.persist_ms);

        let mut out = Vec::new();
        if stable {
            // Breakout vs the 60-minute ring.
            if let Some((ring_high, ring_low)) = ring_extremes {
                if price >= (1.0 + cfg.breakout_pct) * ring_high {
                    Self::try_emit(&cfg, state, tick, "breakout_up", price, tick.ts_ms, &mut out);
                } else if price <= (1.0 - cfg.breakout_pct) * ring_low {
                    Self::try_emit(&cfg, state, tick, "breakout_down", price, tick.ts_ms, &mut out);
                }
            }

            // EMA cross with gap and distance requirements, confirmed over
            // several ticks, with its own direction cooldown.
            let dir_up = state.ema_fast > state.ema_slow;
            let gap_ok = price > 0.0
                && (state.ema_fast - state.ema_slow).abs() / price >= cfg.ema_gap_pct
                && state.ema_slow > 0.0
                && (price - state.ema_slow).abs() / state.ema_slow >= cfg.ema_min_pct;

            match state.ema_dir_up {
                None => {
                    if gap_ok {
                        state.ema_dir_up = Some(dir_up);
                    }
                }
                Some(prev) if prev != dir_up && gap_ok => {
                    state.ema_confirm_count += 1;
                    if state.ema_confirm_count >= cfg.ema_confirm_ticks
                        && tick.ts_ms - state.ema_last_fire_at >= cfg.ema_dir_cooldown_ms
                    {
                        let kind = if dir_up { "ema_cross_up" } else { "ema_cross_down" };
                        Self::try_emit(&cfg, state, tick, kind, price, tick.ts_ms, &mut out);
                        state.ema_dir_up = Some(dir_up);
                        state.ema_confirm_count = 0;
                        state.ema_last_fire_at = tick.ts_ms;
                    }
                }
                Some(_) => {
                    state.ema_confirm_count = 0;
                }
            }
        }

        if !small_step {
            state.last_price = price;
        }
        state.last_ts = tick.ts_ms;
        out
    }

    fn try_emit(
        cfg: &RtDetectConfig,
        state: &mut AssetState,
        tick: &NormalizedTick,
        kind: &'static str,
        price: f64,
        ts_ms: i64,
        out: &mut Vec<RtEventRow>,
    ) {
        // Per-(asset, reason) cooldown.
        if let Some(&last) = state.last_event_at.get(kind) {
            if ts_ms - last < cfg.event_cooldown_ms {
                return;
            }
        }
        // Quote drift guard: require a recent trade on the same asset.
        if ts_ms - state.last_trade_at > cfg.trade_confirm_ms {
            debug!(asset_id = %tick.asset_id, kind, "rt event suppressed: no trade confirmation");
            return;
        }
        state.last_event_at.insert(kind, ts_ms);
        out.push(RtEventRow {
            id: format!("{}:{kind}:{ts_ms}", tick.asset_id),
            market_id: state.market_id.clone(),
            asset_id: tick.asset_id.clone(),
            outcome: state.outcome.clone(),
            kind: kind.to_string(),
            price,
            ema_fast: state.ema_fast,
            ema_slow: state.ema_slow,
            ts: ms_to_iso(ts_ms),
        });
    }

    fn maybe_evict(&mut self, now: i64) {
        if now - self.last_evict_scan < 60_000 {
            return;
        }
        self.last_evict_scan = now;
        let idle = self.cfg.evict_idle_ms;
        let before = self.states.len();
        self.states.retain(|_, s| now - s.last_seen < idle);
        let evicted = before - self.states.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.states.len(), "rt detector evicted idle assets");
        }
    }

    #[cfg(test)]
    fn mark_trade(&mut self, asset_id: &str, ts_ms: i64) {
        if let Some(s) = self.states.get_mut(asset_id) {
            s.last_trade_at = ts_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtDetectConfig;

    fn cfg() -> RtDetectConfig {
        RtDetectConfig {
            max_spread_pct: 0.15,
            min_top_size: 25.0,
            min_update_ms: 250,
            min_step: 0.005,
            persist_ticks: 2,
            persist_ms: 1_500,
            event_cooldown_ms: 120_000,
            breakout_pct: 0.03,
            ema_fast_tau_secs: 60.0,
            ema_slow_tau_secs: 300.0,
            ema_gap_pct: 0.004,
            ema_min_pct: 0.01,
            ema_confirm_ticks: 2,
            ema_dir_cooldown_ms: 300_000,
            trade_confirm_ms: 90_000,
            evict_idle_ms: 1_800_000,
        }
    }

    fn detector() -> RealtimeDetector {
        let store_cfg = crate::config::StoreConfig {
            base_url: "http://localhost:9".to_string(),
            service_key: "test".to_string(),
        };
        let store = Arc::new(StoreGateway::new(&store_cfg).unwrap());
        let (_tx, rx) = mpsc::channel(4);
        RealtimeDetector::new(cfg(), store, rx)
    }

    fn tick(mid: f64, ts_ms: i64) -> NormalizedTick {
        NormalizedTick {
            market_id: "m1".to_string(),
            asset_id: "a1".to_string(),
            outcome: "Yes".to_string(),
            best_bid: mid - 0.005,
            best_ask: mid + 0.005,
            mid,
            spread: 0.01,
            spread_pct: 0.01 / mid,
            bid_size: 100.0,
            ask_size: 100.0,
            ts_ms,
        }
    }

    /// Walk a flat price for `minutes` so the ring has history.
    fn seed_history(d: &mut RealtimeDetector, price: f64, minutes: i64, start_ms: i64) -> i64 {
        let mut ts = start_ms;
        for _ in 0..minutes {
            // Alternate slightly to clear the min_step gate.
            let _ = d.on_tick(&tick(price, ts));
            let _ = d.on_tick(&tick(price + 0.006, ts + 20_000));
            let _ = d.on_tick(&tick(price, ts + 40_000));
            ts += 60_000;
        }
        ts
    }

    #[test]
    fn breakout_up_fires_after_stability_and_trade_confirm() {
        let mut d = detector();
        let ts = seed_history(&mut d, 0.50, 10, 1_000_000);
        d.mark_trade("a1", ts);

        // Jump well above 1.03 × ring high (~0.506): to 0.60, then persist.
        assert!(d.on_tick(&tick(0.60, ts)).is_empty(), "first tick is not yet stable");
        let events = d.on_tick(&tick(0.60, ts + 500));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "breakout_up");
        assert_eq!(events[0].market_id, "m1");
    }

    #[test]
    fn breakout_requires_trade_confirmation() {
        let mut d = detector();
        let ts = seed_history(&mut d, 0.50, 10, 1_000_000);
        // No trade recorded: pure quote drift must not emit.
        let _ = d.on_tick(&tick(0.60, ts));
        let events = d.on_tick(&tick(0.60, ts + 500));
        assert!(events.is_empty());
    }

    #[test]
    fn cooldown_suppresses_repeat_breakouts() {
        let mut d = detector();
        let ts = seed_history(&mut d, 0.50, 10, 1_000_000);
        d.mark_trade("a1", ts);

        let _ = d.on_tick(&tick(0.60, ts));
        let events = d.on_tick(&tick(0.60, ts + 500));
        assert_eq!(events.len(), 1);

        d.mark_trade("a1", ts + 1_000);
        let _ = d.on_tick(&tick(0.62, ts + 1_000));
        let events = d.on_tick(&tick(0.62, ts + 1_500));
        assert!(events.is_empty(), "second breakout inside cooldown must not emit");
    }

    #[test]
    fn wide_spread_and_small_sizes_are_gated() {
        let mut d = detector();
        let mut t = tick(0.50, 1_000_000);
        t.spread_pct = 0.20;
        assert!(d.on_tick(&t).is_empty());

        let mut t = tick(0.50, 1_000_500);
        t.bid_size = 1.0;
        t.ask_size = 1.0;
        assert!(d.on_tick(&t).is_empty());
    }

    #[test]
    fn sub_step_moves_are_ignored() {
        let mut d = detector();
        let _ = d.on_tick(&tick(0.500, 1_000_000));
        // 0.002 < min_step 0.005, so state must not advance.
        let _ = d.on_tick(&tick(0.502, 1_000_500));
        let s = d.states.get("a1").unwrap();
        assert_eq!(s.last_price, 0.500);
    }

    #[test]
    fn ema_cross_down_fires_after_confirmation() {
        let mut d = detector();
        let mut ts = seed_history(&mut d, 0.50, 10, 1_000_000);

        // Rally and hold so the fast-over-slow direction latches up.
        d.mark_trade("a1", ts);
        let _ = d.on_tick(&tick(0.60, ts));
        ts += 20_000;
        let _ = d.on_tick(&tick(0.60, ts));
        ts += 20_000;

        // Sharp drop, then the price persists at the new level.
        let mut kinds: Vec<String> = Vec::new();
        for _ in 0..4 {
            d.mark_trade("a1", ts);
            for e in d.on_tick(&tick(0.40, ts)) {
                kinds.push(e.kind);
            }
            ts += 20_000;
        }
        assert!(
            kinds.iter().any(|k| k == "ema_cross_down"),
            "expected an ema_cross_down, got {kinds:?}"
        );
    }

    #[test]
    fn idle_assets_are_evicted() {
        let mut d = detector();
        let _ = d.on_tick(&tick(0.50, 1_000_000));
        assert_eq!(d.states.len(), 1);
        // A tick on another asset far in the future triggers the scan.
        let mut other = tick(0.50, 1_000_000 + 3_600_000);
        other.asset_id = "a2".to_string();
        let _ = d.on_tick(&other);
        assert!(!d.states.contains_key("a1"));
    }
}
