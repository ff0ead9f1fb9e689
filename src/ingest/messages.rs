use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::warn;

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// A single price level in a book snapshot.
#[derive(Debug, Deserialize, Clone)]
pub struct BookLevel {
    pub price: String,
    pub size: String,
}

/// One entry inside the `price_changes` array.
#[derive(Debug, Deserialize, Clone)]
pub struct PriceChangeEntry {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
    pub best_bid: Option<String>,
    pub best_ask: Option<String>,
}

/// Raw deserializable shape covering all market-channel WS messages.
/// Fields are optional because different event types carry different subsets.
#[derive(Debug, Deserialize)]
struct RawMarketMsg {
    pub event_type: Option<String>,
    /// Present on `book` and `last_trade_price`; absent on `price_change`.
    pub asset_id: Option<String>,
    pub asks: Option<Vec<BookLevel>>,
    pub bids: Option<Vec<BookLevel>>,
    /// `price_change`: array of per-asset change entries.
    pub price_changes: Option<Vec<PriceChangeEntry>>,
    /// `last_trade_price` fields.
    pub price: Option<String>,
    pub size: Option<String>,
    pub side: Option<String>,
    pub timestamp: Option<String>,
    pub transaction_hash: Option<String>,
}

/// Parsed event from a single WS message object.
#[derive(Debug)]
pub enum ParsedFrame {
    /// Full order book snapshot for one token. Only the top of book
    /// survives normalization.
    BookSnapshot {
        asset_id: String,
        asks: Vec<BookLevel>,
        bids: Vec<BookLevel>,
        ts_ms: Option<i64>,
    },
    /// Incremental change; the server provides the resulting best prices.
    TopOfBookChange {
        asset_id: String,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        level_price: f64,
        level_size: f64,
        is_ask: bool,
        ts_ms: Option<i64>,
    },
    /// A trade printed on the venue tape.
    Trade {
        asset_id: String,
        price: f64,
        size: f64,
        side: Option<String>,
        ts_ms: Option<i64>,
        tx_hash: Option<String>,
    },
}

/// Parse a raw WebSocket text frame into zero or more events.
///
/// Market-channel messages arrive as either a single JSON object or an
/// array of objects; `price_change` messages nest per-asset entries.
pub fn parse_market_frame(raw: &str) -> Vec<ParsedFrame> {
    let msgs: Vec<RawMarketMsg> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawMarketMsg>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..500.min(raw.len())];
            warn!(count, "[WS PARSE] unrecognized frame: {sample}");
        }
        return vec![];
    }

    let mut frames = Vec::new();
    for msg in msgs {
        expand_raw_msg(msg, &mut frames);
    }
    frames
}

fn expand_raw_msg(msg: RawMarketMsg, out: &mut Vec<ParsedFrame>) {
    let ts_ms = msg.timestamp.as_deref().and_then(|s| s.parse::<i64>().ok());
    match msg.event_type.as_deref() {
        Some("book") => {
            if let Some(asset_id) = msg.asset_id {
                out.push(ParsedFrame::BookSnapshot {
                    asset_id,
                    asks: msg.asks.unwrap_or_default(),
                    bids: msg.bids.unwrap_or_default(),
                    ts_ms,
                });
            }
        }
        Some("price_change") => {
            let entries = match msg.price_changes {
                Some(e) if !e.is_empty() => e,
                _ => return,
            };
            for entry in entries {
                let best_bid = entry.best_bid.as_deref().and_then(|s| s.parse::<f64>().ok());
                let best_ask = entry.best_ask.as_deref().and_then(|s| s.parse::<f64>().ok());
                let (Ok(level_price), Ok(level_size)) =
                    (entry.price.parse::<f64>(), entry.size.parse::<f64>())
                else {
                    continue;
                };
                out.push(ParsedFrame::TopOfBookChange {
                    asset_id: entry.asset_id,
                    best_bid,
                    best_ask,
                    level_price,
                    level_size,
                    is_ask: entry.side == "SELL",
                    ts_ms,
                });
            }
        }
        Some("last_trade_price") | Some("trade") => {
            let (Some(asset_id), Some(price_str)) = (msg.asset_id, msg.price.as_deref()) else {
                return;
            };
            let Ok(price) = price_str.parse::<f64>() else {
                return;
            };
            let size = msg
                .size
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            out.push(ParsedFrame::Trade {
                asset_id,
                price,
                size,
                side: msg.side,
                ts_ms,
                tx_hash: msg.transaction_hash,
            });
        }
        _ => {}
    }
}

/// Best ask (minimum price) and its size from snapshot levels.
pub fn best_ask(levels: &[BookLevel]) -> Option<(f64, f64)> {
    levels
        .iter()
        .filter_map(|l| {
            let p = l.price.parse::<f64>().ok()?;
            let s = l.size.parse::<f64>().ok()?;
            (s > 0.0).then_some((p, s))
        })
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
}

/// Best bid (maximum price) and its size from snapshot levels.
pub fn best_bid(levels: &[BookLevel]) -> Option<(f64, f64)> {
    levels
        .iter()
        .filter_map(|l| {
            let p = l.price.parse::<f64>().ok()?;
            let s = l.size.parse::<f64>().ok()?;
            (s > 0.0).then_some((p, s))
        })
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_snapshot_single_object() {
        let raw = r#"{"event_type":"book","asset_id":"tok1","timestamp":"1757908892351","asks":[{"price":"0.55","size":"100"}],"bids":[{"price":"0.54","size":"200"}]}"#;
        let frames = parse_market_frame(raw);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ParsedFrame::BookSnapshot { asset_id, asks, bids, ts_ms } => {
                assert_eq!(asset_id, "tok1");
                assert_eq!(asks.len(), 1);
                assert_eq!(bids.len(), 1);
                assert_eq!(*ts_ms, Some(1757908892351));
            }
            other => panic!("expected BookSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn parses_price_change_entries() {
        let raw = r#"{"event_type":"price_change","market":"0xabc","timestamp":"1757908892351","price_changes":[{"asset_id":"tok1","price":"0.55","size":"200","side":"SELL","best_bid":"0.52","best_ask":"0.55"},{"asset_id":"tok2","price":"0.45","size":"50","side":"BUY","best_bid":"0.45","best_ask":"0.47"}]}"#;
        let frames = parse_market_frame(raw);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ParsedFrame::TopOfBookChange { asset_id, best_bid, best_ask, is_ask, .. } => {
                assert_eq!(asset_id, "tok1");
                assert!((best_bid.unwrap() - 0.52).abs() < 1e-9);
                assert!((best_ask.unwrap() - 0.55).abs() < 1e-9);
                assert!(is_ask);
            }
            other => panic!("expected TopOfBookChange, got {other:?}"),
        }
    }

    #[test]
    fn parses_trade_with_size_and_side() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.57","size":"120.5","side":"BUY","timestamp":"1757908892351","transaction_hash":"0xdeadbeef"}"#;
        let frames = parse_market_frame(raw);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ParsedFrame::Trade { asset_id, price, size, side, tx_hash, .. } => {
                assert_eq!(asset_id, "tok1");
                assert!((price - 0.57).abs() < 1e-9);
                assert!((size - 120.5).abs() < 1e-9);
                assert_eq!(side.as_deref(), Some("BUY"));
                assert_eq!(tx_hash.as_deref(), Some("0xdeadbeef"));
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn array_frames_expand_in_order() {
        let raw = r#"[{"event_type":"last_trade_price","asset_id":"a","price":"0.1"},{"event_type":"last_trade_price","asset_id":"b","price":"0.2"}]"#;
        let frames = parse_market_frame(raw);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn garbage_and_unknown_events_return_empty() {
        assert!(parse_market_frame("PONG").is_empty());
        assert!(parse_market_frame(r#"{"event_type":"tick_size_change","asset_id":"x"}"#).is_empty());
    }

    #[test]
    fn best_levels_ignore_zero_size() {
        let levels = vec![
            BookLevel { price: "0.50".into(), size: "0".into() },
            BookLevel { price: "0.55".into(), size: "10".into() },
            BookLevel { price: "0.60".into(), size: "5".into() },
        ];
        assert_eq!(best_ask(&levels), Some((0.55, 10.0)));
        assert_eq!(best_bid(&levels), Some((0.60, 5.0)));
    }
}
