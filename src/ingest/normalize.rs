use serde_json::Value;

use crate::config::MAX_TICK_SPREAD_PCT;
use crate::state::catalog::TokenRef;
use crate::types::{MarketMeta, NormalizedTick, NormalizedTrade, Side};
use crate::util::clamp01;

/// Venue quote divisor for prices delivered as raw integer representations.
/// Probability prices above 1.0 are assumed unscaled.
pub const QUOTE_DIVISOR: f64 = 1_000_000.0;

/// Deterministic trade id: venue transaction hash + asset when available,
/// else `market:asset:ts`.
pub fn trade_id(tx_hash: Option<&str>, market_id: &str, asset_id: &str, ts_ms: i64) -> String {
    match tx_hash {
        Some(h) if !h.is_empty() => format!("{h}:{asset_id}"),
        _ => format!("{market_id}:{asset_id}:{ts_ms}"),
    }
}

/// Scale a venue price into [0,1]. Values above 1 are raw integer
/// representations and get divided by the quote divisor first.
pub fn normalize_price(raw: f64) -> f64 {
    let scaled = if raw > 1.0 { raw / QUOTE_DIVISOR } else { raw };
    clamp01(scaled)
}

/// The `{slug, title, outcome label, outcome index}` tuple is the sole
/// slug/title contract; this helper is the one place that knows venues
/// sometimes nest the interesting fields under `payload` or
/// `payload.payload`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlugFields {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub event_slug: Option<String>,
}

pub fn extract_slug_fields(raw: &Value) -> SlugFields {
    let candidates = [
        raw,
        raw.get("payload").unwrap_or(&Value::Null),
        raw.get("payload")
            .and_then(|p| p.get("payload"))
            .unwrap_or(&Value::Null),
    ];
    let mut out = SlugFields::default();
    for v in candidates {
        if out.slug.is_none() {
            out.slug = str_field(v, &["slug", "marketSlug", "market_slug"]);
        }
        if out.title.is_none() {
            out.title = str_field(v, &["title", "question", "name"]);
        }
        if out.event_slug.is_none() {
            out.event_slug = str_field(v, &["eventSlug", "event_slug"]);
        }
    }
    out
}

fn str_field(v: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = v.get(*name).and_then(|x| x.as_str()) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Normalize a venue trade print for a known token into the common shape.
#[allow(clippy::too_many_arguments)]
pub fn normalize_trade(
    market: &MarketMeta,
    token: &TokenRef,
    asset_id: &str,
    price_raw: f64,
    size: f64,
    side: Option<&str>,
    ts_ms: i64,
    tx_hash: Option<&str>,
    raw: Value,
) -> Option<NormalizedTrade> {
    if size < 0.0 {
        return None;
    }
    let price = normalize_price(price_raw);
    let side = side.and_then(Side::parse).unwrap_or(Side::Buy);
    let fields = extract_slug_fields(&raw);

    Some(NormalizedTrade {
        id: trade_id(tx_hash, &token.market_id, asset_id, ts_ms),
        market_id: token.market_id.clone(),
        outcome: token.outcome.clone(),
        outcome_index: token.outcome_index,
        price,
        size: size.max(0.0),
        side,
        ts_ms,
        slug: fields.slug.or_else(|| Some(market.slug.clone())),
        title: fields.title.or_else(|| Some(market.title.clone())),
        event_slug: fields.event_slug.or_else(|| market.event_slug.clone()),
        raw,
    })
}

/// Build a normalized top-of-book tick. Crossed books (`bid ≥ ask`) and
/// spreads at or above 30% of mid are dropped.
#[allow(clippy::too_many_arguments)]
pub fn normalize_tick(
    token: &TokenRef,
    asset_id: &str,
    best_bid_raw: f64,
    best_ask_raw: f64,
    bid_size: f64,
    ask_size: f64,
    ts_ms: i64,
) -> Option<NormalizedTick> {
    let best_bid = normalize_price(best_bid_raw);
    let best_ask = normalize_price(best_ask_raw);

    if best_bid <= 0.0 || best_ask <= 0.0 {
        return None;
    }
    if best_bid >= best_ask {
        return None;
    }

    let mid = (best_bid + best_ask) / 2.0;
    let spread = best_ask - best_bid;
    let spread_pct = if mid > 0.0 { spread / mid } else { f64::INFINITY };
    if spread_pct >= MAX_TICK_SPREAD_PCT {
        return None;
    }

    Some(NormalizedTick {
        market_id: token.market_id.clone(),
        asset_id: asset_id.to_string(),
        outcome: token.outcome.clone(),
        best_bid,
        best_ask,
        mid,
        spread,
        spread_pct,
        bid_size: bid_size.max(0.0),
        ask_size: ask_size.max(0.0),
        ts_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> TokenRef {
        TokenRef {
            market_id: "m1".to_string(),
            outcome: "Yes".to_string(),
            outcome_index: 0,
        }
    }

    #[test]
    fn trade_id_prefers_transaction_hash() {
        assert_eq!(trade_id(Some("0xabc"), "m1", "a1", 123), "0xabc:a1");
        assert_eq!(trade_id(None, "m1", "a1", 123), "m1:a1:123");
        assert_eq!(trade_id(Some(""), "m1", "a1", 123), "m1:a1:123");
    }

    #[test]
    fn raw_integer_prices_scale_down_then_clamp() {
        assert_eq!(normalize_price(0.42), 0.42);
        assert!((normalize_price(420_000.0) - 0.42).abs() < 1e-9);
        assert_eq!(normalize_price(2_000_000.0), 1.0);
        assert_eq!(normalize_price(-0.3), 0.0);
    }

    #[test]
    fn crossed_book_is_dropped() {
        assert!(normalize_tick(&token(), "a1", 0.55, 0.55, 1.0, 1.0, 0).is_none());
        assert!(normalize_tick(&token(), "a1", 0.56, 0.55, 1.0, 1.0, 0).is_none());
    }

    #[test]
    fn wide_spread_is_dropped_at_exactly_thirty_pct() {
        // mid = 0.5, spread = 0.15 → exactly 30%: rejected.
        assert!(normalize_tick(&token(), "a1", 0.425, 0.575, 1.0, 1.0, 0).is_none());
        // Just inside the limit passes.
        let tick = normalize_tick(&token(), "a1", 0.43, 0.57, 1.0, 1.0, 0).unwrap();
        assert!(tick.spread_pct < MAX_TICK_SPREAD_PCT);
        assert!((tick.mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn slug_fields_found_at_any_nesting_level() {
        let flat = json!({"slug": "btc-up", "question": "Up?", "eventSlug": "btc"});
        let f = extract_slug_fields(&flat);
        assert_eq!(f.slug.as_deref(), Some("btc-up"));
        assert_eq!(f.title.as_deref(), Some("Up?"));
        assert_eq!(f.event_slug.as_deref(), Some("btc"));

        let nested = json!({"payload": {"payload": {"market_slug": "eth-down", "name": "Down?"}}});
        let f = extract_slug_fields(&nested);
        assert_eq!(f.slug.as_deref(), Some("eth-down"));
        assert_eq!(f.title.as_deref(), Some("Down?"));
        assert_eq!(f.event_slug, None);
    }

    #[test]
    fn normalize_trade_fills_metadata_fallbacks() {
        let market = crate::state::catalog::market_meta(
            "m1",
            "btc-100k",
            "Will BTC hit $100k?",
            Some("btc"),
            &[("Yes", "a1"), ("No", "a2")],
        );
        let t = normalize_trade(
            &market,
            &token(),
            "a1",
            0.42,
            100.0,
            Some("SELL"),
            1_000,
            Some("0xabc"),
            json!({}),
        )
        .unwrap();
        assert_eq!(t.id, "0xabc:a1");
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.slug.as_deref(), Some("btc-100k"));
        assert_eq!(t.event_slug.as_deref(), Some("btc"));
    }

    #[test]
    fn negative_size_is_rejected() {
        let market = crate::state::catalog::market_meta("m1", "s", "T", None, &[("Yes", "a1")]);
        assert!(normalize_trade(
            &market,
            &token(),
            "a1",
            0.5,
            -1.0,
            None,
            0,
            None,
            serde_json::Value::Null
        )
        .is_none());
    }
}
