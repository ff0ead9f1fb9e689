use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{recency_weight, ScorerConfig};
use crate::llm::LanguageModel;
use crate::news::{NewsEngine, NewsSignal};
use crate::scorer::explain;
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{
    ExplanationRow, MovementRow, ResolutionRow, SignalClass, SignalScoreRow, TradeRow, WindowType,
};
use crate::util::{clamp01, iso_to_ms, now_ms};

/// Component scores, each in [0,1].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentScores {
    pub capital: f64,
    pub price: f64,
    pub velocity: f64,
    pub liquidity_risk: f64,
    pub info: f64,
    pub time: f64,
    pub news: f64,
}

pub fn component_scores(mv: &MovementRow, time_score: f64, news_score: f64) -> ComponentScores {
    let volume_component = clamp01(mv.volume_ratio / 2.0);
    let capital = 0.6 * volume_component + 0.4 * clamp01(mv.hourly_ratio / 2.0);
    let price =
        0.5 * clamp01(mv.pct_change.abs() / 0.15) + 0.5 * clamp01(mv.range_pct.abs() / 0.15);
    let velocity = clamp01(mv.velocity / 0.02);

    let thin = if mv.thin_liquidity { 1.0 } else { 0.0 };
    let trade_risk = clamp01((15.0 - mv.trades_count as f64) / 15.0);
    let level_risk = clamp01((8.0 - mv.price_levels as f64) / 8.0);
    let liquidity_risk = 0.6 * thin + 0.25 * trade_risk + 0.15 * level_risk;

    let info = clamp01(price * (1.0 - capital) * (1.0 - volume_component));

    ComponentScores {
        capital,
        price,
        velocity,
        liquidity_risk,
        info,
        time: clamp01(time_score),
        news: clamp01(news_score),
    }
}

/// Time urgency from the optional resolution row: 1 when resolved (or in a
/// terminal status), otherwise a linear ramp as the target approaches
/// within the horizon.
pub fn time_score_from_resolution(
    resolution: Option<&ResolutionRow>,
    now: i64,
    horizon_hours: f64,
) -> f64 {
    let Some(r) = resolution else {
        return 0.0;
    };
    let terminal = r.resolved
        || r.status
            .as_deref()
            .map(|s| {
                matches!(
                    s.to_ascii_lowercase().as_str(),
                    "resolved" | "closed" | "settled" | "ended"
                )
            })
            .unwrap_or(false);
    if terminal {
        return 1.0;
    }

    let target = r
        .end_time
        .as_deref()
        .or(r.resolved_at.as_deref())
        .and_then(iso_to_ms);
    let Some(target) = target else {
        return 0.0;
    };
    if target <= now {
        return 1.0;
    }
    let horizon_ms = horizon_hours * 3_600_000.0;
    clamp01(1.0 - (target - now) as f64 / horizon_ms)
}

/// Classification priority, first match wins. Returns the class and the
/// raw (pre-adjustment) confidence.
pub fn classify(cfg: &ScorerConfig, s: &ComponentScores, mv: &MovementRow) -> (SignalClass, f64) {
    let lr = s.liquidity_risk;

    if (mv.thin_liquidity && lr >= cfg.liquidity_override) || lr >= 0.75 {
        return (SignalClass::Liquidity, lr);
    }
    if s.news >= 0.5 && s.info >= 0.3 {
        return (SignalClass::News, 0.6 * s.news + 0.4 * s.info);
    }
    if s.velocity >= 0.6 && s.price >= 0.3 {
        return (SignalClass::Velocity, 0.7 * s.velocity + 0.3 * s.price);
    }
    if s.capital >= 0.6 {
        return (SignalClass::Capital, s.capital);
    }
    if s.info >= 0.5
        && (mv.trades_count >= cfg.min_info_trades || mv.price_levels >= cfg.min_info_levels)
    {
        return (SignalClass::Info, s.info);
    }
    if s.price >= 0.6 {
        if mv.thin_liquidity {
            return (SignalClass::Liquidity, lr.max(0.55));
        }
        return (SignalClass::Info, s.price);
    }
    (SignalClass::Time, s.time)
}

/// `conf · (1 − 0.35·liquidityRisk) · (0.5 + 0.5·recency(window))`.
pub fn adjusted_confidence(conf: f64, liquidity_risk: f64, window: WindowType) -> f64 {
    clamp01(conf * (1.0 - 0.35 * liquidity_risk) * (0.5 + 0.5 * recency_weight(window)))
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Scores settled movements and writes the score row plus an explanation.
/// News and narrative subcalls are best-effort; their failure downgrades
/// the scores, never the row.
pub struct SignalScorer {
    cfg: ScorerConfig,
    store: Arc<StoreGateway>,
    news: Option<Arc<NewsEngine>>,
    llm: Option<Arc<dyn LanguageModel>>,
    /// market_id → (time score, computed_at).
    time_cache: DashMap<String, (f64, i64)>,
}

impl SignalScorer {
    pub fn new(
        cfg: ScorerConfig,
        store: Arc<StoreGateway>,
        news: Option<Arc<NewsEngine>>,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            cfg,
            store,
            news,
            llm,
            time_cache: DashMap::new(),
        }
    }

    /// Scorer with no news or narrative backends; used in tests and when
    /// neither external service is configured.
    pub fn disconnected(store: Arc<StoreGateway>) -> Self {
        Self::new(
            ScorerConfig {
                min_confidence: 0.25,
                liquidity_override: 0.55,
                min_info_trades: 50,
                min_info_levels: 8,
                time_score_horizon_hours: 72.0,
                time_score_cache_ms: 300_000,
            },
            store,
            None,
            None,
        )
    }

    /// Score one movement. Returns the written row, or None when the
    /// adjusted confidence fell below the minimum (dropped silently).
    pub async fn score_movement(&self, mv: &MovementRow) -> crate::error::Result<Option<SignalScoreRow>> {
        let now = now_ms();
        let window = mv.window();
        let window_end = iso_to_ms(&mv.window_end).unwrap_or(now);

        let time_score = self.time_score(&mv.market_id, now).await;
        let news = match &self.news {
            Some(engine) => engine.relevance(&mv.market_id, window, window_end).await,
            None => NewsSignal::default(),
        };

        let scores = component_scores(mv, time_score, news.score);
        let (classification, raw_conf) = classify(&self.cfg, &scores, mv);
        let confidence = adjusted_confidence(raw_conf, scores.liquidity_risk, window);

        if confidence < self.cfg.min_confidence {
            debug!(
                movement_id = %mv.id,
                confidence,
                "signal below minimum confidence, dropped"
            );
            return Ok(None);
        }

        let row = SignalScoreRow {
            movement_id: mv.id.clone(),
            classification: classification.as_str().to_string(),
            confidence,
            capital_score: scores.capital,
            info_score: scores.info,
            velocity_score: scores.velocity,
            liquidity_risk: scores.liquidity_risk,
            time_score: scores.time,
            news_score: scores.news,
        };
        match self.store.insert_one("signal_scores", &row).await {
            Ok(()) => {}
            // Scores are never re-written.
            Err(e) if e.is_duplicate() => return Ok(Some(row)),
            Err(e) => return Err(e.into()),
        }
        info!(
            movement_id = %mv.id,
            classification = classification.as_str(),
            confidence,
            "signal scored"
        );

        self.write_explanation(mv, classification, &news).await;
        Ok(Some(row))
    }

    async fn write_explanation(&self, mv: &MovementRow, class: SignalClass, news: &NewsSignal) {
        let subject = self.event_subject(mv).await;
        let (text, source) =
            explain::generate(self.llm.as_deref(), mv, class, &news.headlines, subject.as_deref())
                .await;
        let row = ExplanationRow {
            movement_id: mv.id.clone(),
            text,
            source: source.to_string(),
        };
        match self.store.insert_one("movement_explanations", &row).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {}
            Err(e) => warn!(movement_id = %mv.id, "explanation insert failed: {e}"),
        }
    }

    /// For event movements, the explanation leads with the top-mover child
    /// market; the newest child trade is a good proxy for it.
    async fn event_subject(&self, mv: &MovementRow) -> Option<String> {
        let slug = mv.market_id.strip_prefix("event:")?;
        let rows: Vec<TradeRow> = self
            .store
            .fetch_as(
                "trades",
                &Query::new()
                    .eq("event_slug", slug)
                    .order_desc("ts")
                    .limit(1),
            )
            .await
            .ok()?;
        rows.into_iter().next().and_then(|t| t.title)
    }

    async fn time_score(&self, market_id: &str, now: i64) -> f64 {
        if let Some(cached) = self.time_cache.get(market_id) {
            let (score, at) = *cached.value();
            if now - at < self.cfg.time_score_cache_ms {
                return score;
            }
        }

        let resolution: Option<ResolutionRow> = self
            .store
            .fetch_as(
                "market_resolutions",
                &Query::new().eq("market_id", market_id).limit(1),
            )
            .await
            .ok()
            .and_then(|rows: Vec<ResolutionRow>| rows.into_iter().next());

        let score =
            time_score_from_resolution(resolution.as_ref(), now, self.cfg.time_score_horizon_hours);
        self.time_cache
            .insert(market_id.to_string(), (score, now));
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ms_to_iso;

    fn cfg() -> ScorerConfig {
        ScorerConfig {
            min_confidence: 0.25,
            liquidity_override: 0.55,
            min_info_trades: 50,
            min_info_levels: 8,
            time_score_horizon_hours: 72.0,
            time_score_cache_ms: 300_000,
        }
    }

    fn movement() -> MovementRow {
        MovementRow {
            id: "m1:Yes:5m:100".to_string(),
            market_id: "m1".to_string(),
            outcome: "Yes".to_string(),
            window_type: "5m".to_string(),
            window_start: ms_to_iso(0),
            window_end: ms_to_iso(300_000),
            start_price: 0.40,
            end_price: 0.50,
            min_price: 0.40,
            max_price: 0.50,
            pct_change: 0.25,
            range_pct: 0.25,
            window_volume: 1_000.0,
            volume_ratio: 2.0,
            hourly_ratio: 2.0,
            trades_count: 60,
            price_levels: 12,
            avg_trade_size: 16.7,
            velocity: 0.0,
            reason: "BOTH".to_string(),
            thin_liquidity: false,
            status: "FINAL".to_string(),
            finalize_at: ms_to_iso(900_000),
        }
    }

    #[test]
    fn thin_sharp_move_classifies_liquidity() {
        // 3 trades, 2 unique price levels, thin.
        let mut mv = movement();
        mv.thin_liquidity = true;
        mv.trades_count = 3;
        mv.price_levels = 2;
        mv.pct_change = 0.80;
        mv.range_pct = 0.80;
        mv.volume_ratio = 0.0;
        mv.hourly_ratio = 0.0;

        let s = component_scores(&mv, 0.0, 0.0);
        assert!((s.liquidity_risk - 0.9125).abs() < 1e-4);

        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Liquidity);
        assert!((conf - 0.9125).abs() < 1e-4);

        let adjusted = adjusted_confidence(conf, s.liquidity_risk, WindowType::M5);
        assert!((adjusted - 0.621).abs() < 0.01);
    }

    #[test]
    fn news_beats_velocity_and_capital_in_priority() {
        let mv = movement();
        let s = ComponentScores {
            capital: 0.3,
            price: 0.5,
            velocity: 0.0,
            liquidity_risk: 0.2,
            info: 0.45,
            time: 0.0,
            news: 0.7,
        };
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::News);
        assert!((conf - 0.60).abs() < 1e-9);

        let adjusted = adjusted_confidence(conf, s.liquidity_risk, WindowType::M5);
        assert!((adjusted - 0.558).abs() < 0.001);
    }

    #[test]
    fn velocity_requires_price_support() {
        let mv = movement();
        let mut s = ComponentScores {
            velocity: 0.8,
            price: 0.2,
            ..Default::default()
        };
        let (class, _) = classify(&cfg(), &s, &mv);
        assert_ne!(class, SignalClass::Velocity);

        s.price = 0.35;
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Velocity);
        assert!((conf - (0.7 * 0.8 + 0.3 * 0.35)).abs() < 1e-9);
    }

    #[test]
    fn capital_fires_at_sixty_pct() {
        let mv = movement();
        let s = ComponentScores {
            capital: 0.65,
            ..Default::default()
        };
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Capital);
        assert_eq!(conf, 0.65);
    }

    #[test]
    fn info_needs_enough_trades_or_levels() {
        let mut mv = movement();
        mv.trades_count = 10;
        mv.price_levels = 3;
        let s = ComponentScores {
            info: 0.6,
            ..Default::default()
        };
        let (class, _) = classify(&cfg(), &s, &mv);
        assert_ne!(class, SignalClass::Info);

        mv.price_levels = 9;
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Info);
        assert_eq!(conf, 0.6);
    }

    #[test]
    fn price_only_thin_falls_back_to_liquidity_floor() {
        let mut mv = movement();
        mv.thin_liquidity = true;
        let s = ComponentScores {
            price: 0.7,
            liquidity_risk: 0.3,
            ..Default::default()
        };
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Liquidity);
        assert_eq!(conf, 0.55);
    }

    #[test]
    fn fallback_is_time() {
        let mv = movement();
        let s = ComponentScores {
            time: 0.4,
            ..Default::default()
        };
        let (class, conf) = classify(&cfg(), &s, &mv);
        assert_eq!(class, SignalClass::Time);
        assert_eq!(conf, 0.4);
    }

    #[test]
    fn capital_score_follows_volume_ratios() {
        let mv = movement();
        // volume_ratio 2.0 → clamp(1.0); hourly 2.0 → clamp(1.0).
        let s = component_scores(&mv, 0.0, 0.0);
        assert!((s.capital - 1.0).abs() < 1e-9);
        // info collapses when capital saturates.
        assert_eq!(s.info, 0.0);
    }

    #[test]
    fn resolved_markets_score_time_one() {
        let r = ResolutionRow {
            market_id: "m1".to_string(),
            end_time: None,
            resolved_at: None,
            resolved: true,
            status: None,
        };
        assert_eq!(time_score_from_resolution(Some(&r), 0, 72.0), 1.0);

        let r = ResolutionRow {
            market_id: "m1".to_string(),
            end_time: Some(ms_to_iso(36 * 3_600_000)),
            resolved_at: None,
            resolved: false,
            status: Some("open".to_string()),
        };
        // 36h away on a 72h horizon → 0.5.
        let score = time_score_from_resolution(Some(&r), 0, 72.0);
        assert!((score - 0.5).abs() < 1e-6);

        assert_eq!(time_score_from_resolution(None, 0, 72.0), 0.0);
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        for conf in [0.0, 0.5, 1.0, 2.0] {
            for lr in [0.0, 0.5, 1.0] {
                for w in [WindowType::M5, WindowType::H4, WindowType::Event] {
                    let adj = adjusted_confidence(conf, lr, w);
                    assert!((0.0..=1.0).contains(&adj));
                }
            }
        }
    }
}
