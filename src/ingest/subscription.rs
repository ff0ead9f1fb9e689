use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::ingest::SourceAdapter;
use crate::state::dominant::{pick_dominant, DominantOutcomeCache, OutcomeActivity};
use crate::state::MarketCatalog;
use crate::store::gateway::StoreGateway;
use crate::types::{DominantOutcomeRow, NormalizedTrade};
use crate::util::{ms_to_iso, now_ms};

/// Mover score: `|pctMove| · log10(1 + volume)` over the mover window.
pub fn mover_score(pct_move: f64, volume: f64) -> f64 {
    pct_move.abs() * (1.0 + volume.max(0.0)).log10()
}

/// Per-outcome stats over the mover window.
#[derive(Debug, Clone)]
pub struct OutcomeStats {
    pub outcome: String,
    pub pct_move: f64,
    pub volume: f64,
    pub trades: u64,
}

/// Rank a market's outcomes by mover score, keeping at most `max_assets`
/// and always retaining the "Yes" outcome when known.
pub fn rank_outcomes(stats: &[OutcomeStats], max_assets: usize, yes_label: Option<&str>) -> Vec<String> {
    let mut sorted: Vec<&OutcomeStats> = stats.iter().collect();
    sorted.sort_by(|a, b| {
        mover_score(b.pct_move, b.volume)
            .partial_cmp(&mover_score(a.pct_move, a.volume))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<String> = sorted
        .into_iter()
        .take(max_assets)
        .map(|s| s.outcome.clone())
        .collect();

    if let Some(yes) = yes_label {
        if !kept.iter().any(|o| o.eq_ignore_ascii_case(yes)) {
            if kept.len() >= max_assets && !kept.is_empty() {
                kept.pop();
            }
            kept.push(yes.to_string());
        }
    }
    kept
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

type ActivityRing = VecDeque<(i64, f64, f64)>; // (ts_ms, price, size)

/// Tracks which instruments the venue should be subscribed to. Recomputes
/// the set from mover stats and dominant-outcome rules each refresh; the
/// adapter debounces the resulting reconnects.
pub struct SubscriptionController {
    cfg: FeedConfig,
    catalog: Arc<MarketCatalog>,
    dominant: Arc<DominantOutcomeCache>,
    store: Arc<StoreGateway>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    trades_rx: mpsc::Receiver<NormalizedTrade>,
    activity: HashMap<String, HashMap<String, ActivityRing>>,
}

impl SubscriptionController {
    pub fn new(
        cfg: FeedConfig,
        catalog: Arc<MarketCatalog>,
        dominant: Arc<DominantOutcomeCache>,
        store: Arc<StoreGateway>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        trades_rx: mpsc::Receiver<NormalizedTrade>,
    ) -> Self {
        Self {
            cfg,
            catalog,
            dominant,
            store,
            adapters,
            trades_rx,
            activity: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut refresh = interval(Duration::from_millis(self.cfg.mover_refresh_ms));
        refresh.tick().await; // consume immediate first tick

        // Baseline subscription before any trades arrive.
        self.apply_desired_set();

        loop {
            tokio::select! {
                trade = self.trades_rx.recv() => {
                    match trade {
                        Some(t) => self.record(&t),
                        None => return,
                    }
                }
                _ = refresh.tick() => {
                    self.recompute().await;
                }
            }
        }
    }

    fn record(&mut self, t: &NormalizedTrade) {
        let ring = self
            .activity
            .entry(t.market_id.clone())
            .or_default()
            .entry(t.outcome.clone())
            .or_default();
        ring.push_back((t.ts_ms, t.price, t.size));
        let cutoff = now_ms() - self.cfg.mover_window_ms;
        while ring.front().is_some_and(|(ts, _, _)| *ts < cutoff) {
            ring.pop_front();
        }
    }

    async fn recompute(&mut self) {
        let cutoff = now_ms() - self.cfg.mover_window_ms;
        let mut dominant_rows: Vec<DominantOutcomeRow> = Vec::new();

        for (market_id, outcomes) in &mut self.activity {
            let mut by_outcome: HashMap<String, OutcomeActivity> = HashMap::new();
            for (outcome, ring) in outcomes.iter_mut() {
                while ring.front().is_some_and(|(ts, _, _)| *ts < cutoff) {
                    ring.pop_front();
                }
                let volume: f64 = ring.iter().map(|(_, _, s)| s).sum();
                by_outcome.insert(
                    outcome.clone(),
                    OutcomeActivity { volume, trades: ring.len() as u64 },
                );
            }

            if let Some(dominant) = pick_dominant(&by_outcome) {
                self.dominant.set(market_id, dominant.clone());
                dominant_rows.push(DominantOutcomeRow {
                    market_id: market_id.clone(),
                    outcome: dominant,
                    updated_at: ms_to_iso(now_ms()),
                });
            }
        }
        self.activity.retain(|_, outcomes| {
            outcomes.retain(|_, ring| !ring.is_empty());
            !outcomes.is_empty()
        });

        if !dominant_rows.is_empty() {
            if let Err(e) = self
                .store
                .upsert("dominant_outcomes", &dominant_rows, "market_id")
                .await
            {
                warn!("dominant outcome upsert failed: {e}");
            }
        }

        self.apply_desired_set();
    }

    /// Desired instruments: for every cataloged market, the "Yes" outcome
    /// (or index 0) plus the top movers by score, capped per market.
    fn desired_set(&self) -> HashSet<String> {
        let mut desired = HashSet::new();

        for market_id in self.catalog.all_market_ids() {
            let Some(market) = self.catalog.get_market(&market_id) else {
                continue;
            };
            let yes_label = market
                .yes_outcome()
                .map(|o| o.label.clone())
                .or_else(|| market.outcomes.first().map(|o| o.label.clone()));

            let stats: Vec<OutcomeStats> = self
                .activity
                .get(&market_id)
                .map(|outcomes| {
                    outcomes
                        .iter()
                        .filter(|(_, ring)| !ring.is_empty())
                        .map(|(outcome, ring)| {
                            let first = ring.front().map(|(_, p, _)| *p).unwrap_or(0.0);
                            let last = ring.back().map(|(_, p, _)| *p).unwrap_or(0.0);
                            let pct_move = if first > 0.0 { (last - first) / first } else { 0.0 };
                            OutcomeStats {
                                outcome: outcome.clone(),
                                pct_move,
                                volume: ring.iter().map(|(_, _, s)| s).sum(),
                                trades: ring.len() as u64,
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();

            let kept = rank_outcomes(&stats, self.cfg.max_assets_per_market, yes_label.as_deref());
            for outcome in kept {
                if let Some(token) = self.catalog.token_for_outcome(&market_id, &outcome) {
                    desired.insert(token);
                }
            }
        }
        desired
    }

    fn apply_desired_set(&self) {
        let desired = self.desired_set();

        for adapter in &self.adapters {
            let current: HashSet<String> = adapter.subscribed().into_iter().collect();
            let to_add: Vec<&String> = desired.difference(&current).collect();
            let to_remove: Vec<&String> = current.difference(&desired).collect();
            if to_add.is_empty() && to_remove.is_empty() {
                continue;
            }

            for token in &to_add {
                adapter.subscribe(token);
            }
            for token in &to_remove {
                adapter.unsubscribe(token);
            }
            info!(
                adapter = adapter.name(),
                added = to_add.len(),
                removed = to_remove.len(),
                total = desired.len(),
                "subscription set recomputed"
            );
            debug!(
                adapter = adapter.name(),
                "reconnect scheduling delegated to adapter debounce"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(outcome: &str, pct: f64, vol: f64) -> OutcomeStats {
        OutcomeStats {
            outcome: outcome.to_string(),
            pct_move: pct,
            volume: vol,
            trades: 1,
        }
    }

    #[test]
    fn score_scales_with_move_and_volume() {
        assert!(mover_score(0.10, 1_000.0) > mover_score(0.10, 10.0));
        assert!(mover_score(-0.20, 100.0) > mover_score(0.10, 100.0));
        assert_eq!(mover_score(0.0, 1_000.0), 0.0);
    }

    #[test]
    fn ranking_caps_assets_per_market() {
        let stats = vec![
            stat("A", 0.30, 5_000.0),
            stat("B", 0.20, 4_000.0),
            stat("C", 0.10, 3_000.0),
            stat("D", 0.05, 2_000.0),
        ];
        let kept = rank_outcomes(&stats, 2, None);
        assert_eq!(kept, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn yes_is_always_kept_when_known() {
        let stats = vec![
            stat("A", 0.30, 5_000.0),
            stat("B", 0.20, 4_000.0),
            stat("Yes", 0.01, 10.0),
        ];
        let kept = rank_outcomes(&stats, 2, Some("Yes"));
        assert!(kept.iter().any(|o| o == "Yes"));
        assert!(kept.len() <= 2);
        // The top mover survives alongside Yes.
        assert!(kept.iter().any(|o| o == "A"));
    }

    #[test]
    fn yes_included_even_with_no_activity() {
        let kept = rank_outcomes(&[], 4, Some("Yes"));
        assert_eq!(kept, vec!["Yes".to_string()]);
    }
}
