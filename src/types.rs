use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trade side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized feed shapes: the venue-agnostic contract every adapter produces
// ---------------------------------------------------------------------------

/// A trade normalized to the common schema. `id` is deterministic: venue
/// transaction hash + asset when available, else `market:asset:ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTrade {
    pub id: String,
    pub market_id: String,
    pub outcome: String,
    pub outcome_index: i64,
    /// Probability price in [0,1].
    pub price: f64,
    /// Trade size in quote units, ≥ 0.
    pub size: f64,
    pub side: Side,
    /// UTC epoch milliseconds.
    pub ts_ms: i64,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub event_slug: Option<String>,
    /// Raw venue payload, carried for downstream slug/title recovery.
    pub raw: serde_json::Value,
}

/// Top-of-book tick normalized to the common schema. Crossed books and
/// spreads over 30% never make it into one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTick {
    pub market_id: String,
    pub asset_id: String,
    pub outcome: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub ts_ms: i64,
}

/// Event delivered by every source adapter.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(NormalizedTrade),
    Tick(NormalizedTick),
}

// ---------------------------------------------------------------------------
// Market metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMeta {
    pub label: String,
    pub index: i64,
    pub token_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub event_slug: Option<String>,
    pub outcomes: Vec<OutcomeMeta>,
    pub end_date_iso: Option<String>,
    pub total_volume: Option<f64>,
}

impl MarketMeta {
    /// Binary markets are the Yes/No and Up/Down pairs.
    pub fn is_binary(&self) -> bool {
        if self.outcomes.len() != 2 {
            return false;
        }
        let a = self.outcomes[0].label.to_ascii_lowercase();
        let b = self.outcomes[1].label.to_ascii_lowercase();
        matches!(
            (a.as_str(), b.as_str()),
            ("yes", "no") | ("no", "yes") | ("up", "down") | ("down", "up")
        )
    }

    pub fn yes_outcome(&self) -> Option<&OutcomeMeta> {
        self.outcomes
            .iter()
            .find(|o| o.label.eq_ignore_ascii_case("Yes") || o.label.eq_ignore_ascii_case("Up"))
    }
}

// ---------------------------------------------------------------------------
// Movement vocabulary
// ---------------------------------------------------------------------------

/// Canonical window vocabulary. The legacy `24h` value is accepted on read
/// and translated to `event` on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    Event,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::M5 => "5m",
            WindowType::M15 => "15m",
            WindowType::H1 => "1h",
            WindowType::H4 => "4h",
            WindowType::Event => "event",
        }
    }

    /// Legacy values (`24h`) map onto `event`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5m" => Some(WindowType::M5),
            "15m" => Some(WindowType::M15),
            "1h" => Some(WindowType::H1),
            "4h" => Some(WindowType::H4),
            "event" | "24h" => Some(WindowType::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for WindowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementReason {
    Price,
    Volume,
    Both,
    Velocity,
}

impl MovementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Price => "PRICE",
            MovementReason::Volume => "VOLUME",
            MovementReason::Both => "BOTH",
            MovementReason::Velocity => "VELOCITY",
        }
    }
}

impl std::fmt::Display for MovementReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementStatus {
    Open,
    Final,
}

impl MovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementStatus::Open => "OPEN",
            MovementStatus::Final => "FINAL",
        }
    }
}

impl std::fmt::Display for MovementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Store rows
// ---------------------------------------------------------------------------

/// `trades` table row. Timestamps are ISO strings on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub market_id: String,
    pub outcome: String,
    pub outcome_index: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub ts: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub event_slug: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl TradeRow {
    pub fn from_trade(t: &NormalizedTrade) -> Self {
        Self {
            id: t.id.clone(),
            market_id: t.market_id.clone(),
            outcome: t.outcome.clone(),
            outcome_index: t.outcome_index,
            price: t.price,
            size: t.size,
            side: t.side,
            ts: crate::util::ms_to_iso(t.ts_ms),
            slug: t.slug.clone(),
            title: t.title.clone(),
            event_slug: t.event_slug.clone(),
            raw: t.raw.clone(),
        }
    }

    pub fn ts_ms(&self) -> i64 {
        crate::util::iso_to_ms(&self.ts).unwrap_or(0)
    }
}

/// `market_ticks` append row; also the shape upserted into
/// `market_ticks_latest` keyed by `(market_id, asset_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRow {
    pub market_id: String,
    pub asset_id: String,
    pub outcome: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub ts: String,
}

impl TickRow {
    pub fn from_tick(t: &NormalizedTick) -> Self {
        Self {
            market_id: t.market_id.clone(),
            asset_id: t.asset_id.clone(),
            outcome: t.outcome.clone(),
            best_bid: t.best_bid,
            best_ask: t.best_ask,
            mid: t.mid,
            spread: t.spread,
            spread_pct: t.spread_pct,
            bid_size: t.bid_size,
            ask_size: t.ask_size,
            ts: crate::util::ms_to_iso(t.ts_ms),
        }
    }

    pub fn ts_ms(&self) -> i64 {
        crate::util::iso_to_ms(&self.ts).unwrap_or(0)
    }
}

/// `market_aggregates` row: the running per-market aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRow {
    pub market_id: String,
    pub trade_count: i64,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub avg_trade_size: f64,
    pub first_price: f64,
    pub last_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub first_seen: String,
    pub last_seen: String,
}

/// `movements` row, pk `id = market:outcome:window:bucket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementRow {
    pub id: String,
    pub market_id: String,
    pub outcome: String,
    pub window_type: String,
    pub window_start: String,
    pub window_end: String,
    pub start_price: f64,
    pub end_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub pct_change: f64,
    pub range_pct: f64,
    pub window_volume: f64,
    pub volume_ratio: f64,
    pub hourly_ratio: f64,
    pub trades_count: i64,
    pub price_levels: i64,
    pub avg_trade_size: f64,
    pub velocity: f64,
    pub reason: String,
    pub thin_liquidity: bool,
    pub status: String,
    pub finalize_at: String,
}

impl MovementRow {
    pub fn window(&self) -> WindowType {
        WindowType::parse(&self.window_type).unwrap_or(WindowType::Event)
    }
}

/// `movement_explanations` row, one per movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationRow {
    pub movement_id: String,
    pub text: String,
    /// "ai" when the narrative came from the language model, "template" otherwise.
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalClass {
    Capital,
    Info,
    Velocity,
    Liquidity,
    News,
    Time,
}

impl SignalClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalClass::Capital => "CAPITAL",
            SignalClass::Info => "INFO",
            SignalClass::Velocity => "VELOCITY",
            SignalClass::Liquidity => "LIQUIDITY",
            SignalClass::News => "NEWS",
            SignalClass::Time => "TIME",
        }
    }
}

impl std::fmt::Display for SignalClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `signal_scores` row, written only when adjusted confidence clears the
/// minimum threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalScoreRow {
    pub movement_id: String,
    pub classification: String,
    pub confidence: f64,
    pub capital_score: f64,
    pub info_score: f64,
    pub velocity_score: f64,
    pub liquidity_risk: f64,
    pub time_score: f64,
    pub news_score: f64,
}

/// `rt_events` row: breakout and EMA-cross events from the real-time detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtEventRow {
    pub id: String,
    pub market_id: String,
    pub asset_id: String,
    pub outcome: String,
    pub kind: String,
    pub price: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ts: String,
}

/// `dominant_outcomes` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DominantOutcomeRow {
    pub market_id: String,
    pub outcome: String,
    pub updated_at: String,
}

/// `tracked_slugs` row; at most one row is active per viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSlugRow {
    pub slug: String,
    pub active: bool,
    pub tracked_at: String,
}

/// `news_cache` row keyed by `(cache_slug, bucket)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsCacheRow {
    pub cache_slug: String,
    pub bucket: i64,
    pub articles: serde_json::Value,
    pub article_count: i64,
    pub query: String,
    pub fetched_at: String,
}

/// `market_resolutions` row. Optional; drives the time score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRow {
    pub market_id: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_type_round_trips_canonical_values() {
        for w in [
            WindowType::M5,
            WindowType::M15,
            WindowType::H1,
            WindowType::H4,
            WindowType::Event,
        ] {
            assert_eq!(WindowType::parse(w.as_str()), Some(w));
        }
    }

    #[test]
    fn legacy_window_type_reads_as_event() {
        assert_eq!(WindowType::parse("24h"), Some(WindowType::Event));
    }

    #[test]
    fn side_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
    }

    #[test]
    fn binary_market_detection() {
        let m = MarketMeta {
            id: "m1".into(),
            slug: "test".into(),
            title: "Test?".into(),
            event_slug: None,
            outcomes: vec![
                OutcomeMeta { label: "Yes".into(), index: 0, token_id: "t0".into() },
                OutcomeMeta { label: "No".into(), index: 1, token_id: "t1".into() },
            ],
            end_date_iso: None,
            total_volume: None,
        };
        assert!(m.is_binary());
        assert_eq!(m.yes_outcome().unwrap().token_id, "t0");
    }
}
