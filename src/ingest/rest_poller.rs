use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::config::FeedConfig;
use crate::ingest::messages::{best_ask, best_bid, BookLevel};
use crate::ingest::normalize::{normalize_tick, normalize_trade};
use crate::ingest::{BackoffPolicy, SourceAdapter};
use crate::state::MarketCatalog;
use crate::types::FeedEvent;
use crate::util::now_ms;

const CLOB_API_URL: &str = "https://clob.polymarket.com";
const DATA_API_URL: &str = "https://data-api.polymarket.com";

/// Strictly-greater comparison for venue trade ids: numeric when both
/// sides parse, lexicographic otherwise.
pub fn id_gt(a: &str, b: &str) -> bool {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x > y,
        _ => a > b,
    }
}

/// Keep only items with id strictly greater than the cursor, ascending,
/// and return the advanced cursor. The cursor never moves backwards.
pub fn advance_cursor(
    mut items: Vec<(String, serde_json::Value)>,
    cursor: Option<&str>,
) -> (Vec<(String, serde_json::Value)>, Option<String>) {
    items.sort_by(|a, b| {
        if id_gt(&a.0, &b.0) {
            std::cmp::Ordering::Greater
        } else if a.0 == b.0 {
            std::cmp::Ordering::Equal
        } else {
            std::cmp::Ordering::Less
        }
    });
    let fresh: Vec<(String, serde_json::Value)> = items
        .into_iter()
        .filter(|(id, _)| cursor.map_or(true, |c| id_gt(id, c)))
        .collect();
    let next = fresh
        .last()
        .map(|(id, _)| id.clone())
        .or_else(|| cursor.map(|c| c.to_string()));
    (fresh, next)
}

struct PollerShared {
    cfg: FeedConfig,
    catalog: Arc<MarketCatalog>,
    events_tx: mpsc::Sender<FeedEvent>,
    health: Arc<HealthState>,
    /// Round-robin ordered instrument list.
    subs: Mutex<Vec<String>>,
    /// market_id → last delivered trade id.
    cursors: Mutex<HashMap<String, String>>,
    running: AtomicBool,
}

/// Polling adapter: one sequential request queue with a minimum
/// inter-request gap honoring the venue's published QPS. Orderbook polls
/// round-robin across the subscription set, one instrument per tick; trade
/// polls interleave with a monotone id cursor per market.
pub struct RestPollerAdapter {
    shared: Arc<PollerShared>,
}

impl RestPollerAdapter {
    pub fn new(
        cfg: FeedConfig,
        catalog: Arc<MarketCatalog>,
        events_tx: mpsc::Sender<FeedEvent>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                cfg,
                catalog,
                events_tx,
                health,
                subs: Mutex::new(Vec::new()),
                cursors: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl SourceAdapter for RestPollerAdapter {
    fn name(&self) -> &'static str {
        "polymarket-rest"
    }

    async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(poll_loop(shared));
        info!("polymarket-rest poller started");
    }

    async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self, instrument: &str) {
        let mut subs = self.shared.subs.lock().unwrap();
        if !subs.iter().any(|s| s == instrument) {
            subs.push(instrument.to_string());
        }
    }

    fn unsubscribe(&self, instrument: &str) {
        self.shared.subs.lock().unwrap().retain(|s| s != instrument);
    }

    fn subscribed(&self) -> Vec<String> {
        self.shared.subs.lock().unwrap().clone()
    }
}

async fn poll_loop(shared: Arc<PollerShared>) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("rest poller: failed to build HTTP client: {e}");
            return;
        }
    };

    let mut backoff = BackoffPolicy::new(shared.cfg.min_request_gap_ms, shared.cfg.max_backoff_ms);
    let mut rr_index = 0usize;
    let mut step = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(backoff.current_ms())).await;

        // Alternate book polls (round-robin instrument) with trade polls.
        let poll_books = step % 2 == 0;
        step += 1;

        let outcome = if poll_books {
            let instrument = {
                let subs = shared.subs.lock().unwrap();
                if subs.is_empty() {
                    None
                } else {
                    rr_index = (rr_index + 1) % subs.len();
                    Some(subs[rr_index].clone())
                }
            };
            match instrument {
                Some(asset_id) => poll_book(&shared, &client, &asset_id).await,
                None => Ok(()),
            }
        } else {
            let market = {
                let subs = shared.subs.lock().unwrap();
                subs.get(rr_index % subs.len().max(1))
                    .and_then(|a| shared.catalog.token_ref(a))
                    .map(|t| t.market_id)
            };
            match market {
                Some(market_id) => poll_trades(&shared, &client, &market_id).await,
                None => Ok(()),
            }
        };

        match outcome {
            Ok(()) => backoff.on_success(),
            Err(e) => {
                let msg = e.to_string();
                if crate::ingest::is_rate_limited(&msg) {
                    backoff.on_rate_limit();
                    warn!("rest poller throttled, gap now {}ms", backoff.current_ms());
                } else {
                    backoff.on_failure();
                    debug!("rest poll failed: {msg}");
                }
            }
        }
    }
}

async fn poll_book(
    shared: &Arc<PollerShared>,
    client: &reqwest::Client,
    asset_id: &str,
) -> crate::error::Result<()> {
    let Some(token) = shared.catalog.token_ref(asset_id) else {
        return Ok(());
    };
    let url = format!("{CLOB_API_URL}/book?token_id={asset_id}");
    let resp = client.get(&url).send().await?;
    if resp.status().as_u16() == 429 {
        return Err(crate::error::AppError::Feed("429 Too Many Requests".to_string()));
    }
    let book: serde_json::Value = resp.json().await?;

    let asks: Vec<BookLevel> = levels(&book, "asks");
    let bids: Vec<BookLevel> = levels(&book, "bids");
    let (Some((ask, ask_size)), Some((bid, bid_size))) = (best_ask(&asks), best_bid(&bids)) else {
        return Ok(());
    };

    if let Some(tick) = normalize_tick(&token, asset_id, bid, ask, bid_size, ask_size, now_ms()) {
        if let Err(e) = shared.events_tx.try_send(FeedEvent::Tick(tick)) {
            warn!("feed channel full, dropping polled tick: {e}");
        }
    }
    Ok(())
}

fn levels(book: &serde_json::Value, side: &str) -> Vec<BookLevel> {
    book.get(side)
        .and_then(|a| a.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|l| {
                    Some(BookLevel {
                        price: l.get("price")?.as_str()?.to_string(),
                        size: l.get("size")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn poll_trades(
    shared: &Arc<PollerShared>,
    client: &reqwest::Client,
    market_id: &str,
) -> crate::error::Result<()> {
    let url = format!("{DATA_API_URL}/trades?market={market_id}&limit=100");
    let resp = client.get(&url).send().await?;
    if resp.status().as_u16() == 429 {
        return Err(crate::error::AppError::Feed("429 Too Many Requests".to_string()));
    }
    let items: Vec<serde_json::Value> = resp.json().await?;

    let keyed: Vec<(String, serde_json::Value)> = items
        .into_iter()
        .filter_map(|v| {
            let id = v
                .get("id")
                .and_then(|x| x.as_str())
                .or_else(|| v.get("transactionHash").and_then(|x| x.as_str()))?
                .to_string();
            Some((id, v))
        })
        .collect();

    let cursor = shared.cursors.lock().unwrap().get(market_id).cloned();
    let (fresh, next) = advance_cursor(keyed, cursor.as_deref());

    for (_, item) in &fresh {
        deliver_polled_trade(shared, market_id, item);
    }

    if let Some(next) = next {
        shared
            .cursors
            .lock()
            .unwrap()
            .insert(market_id.to_string(), next);
    }
    Ok(())
}

fn deliver_polled_trade(shared: &Arc<PollerShared>, market_id: &str, item: &serde_json::Value) {
    let Some(asset_id) = item.get("asset").and_then(|a| a.as_str()) else {
        return;
    };
    let Some(token) = shared.catalog.token_ref(asset_id) else {
        return;
    };
    let Some(market) = shared.catalog.get_market(market_id) else {
        return;
    };
    let price = item.get("price").and_then(json_f64).unwrap_or(0.0);
    let size = item.get("size").and_then(json_f64).unwrap_or(0.0);
    let side = item.get("side").and_then(|s| s.as_str());
    let ts_ms = item
        .get("timestamp")
        .and_then(|t| t.as_i64())
        .map(|secs| if secs < 100_000_000_000 { secs * 1_000 } else { secs })
        .unwrap_or_else(now_ms);
    let tx_hash = item.get("transactionHash").and_then(|h| h.as_str());

    if let Some(trade) = normalize_trade(
        &market,
        &token,
        asset_id,
        price,
        size,
        side,
        ts_ms,
        tx_hash,
        item.clone(),
    ) {
        shared.health.set_last_trade_at_ms(trade.ts_ms);
        if let Err(e) = shared.events_tx.try_send(FeedEvent::Trade(trade)) {
            warn!("feed channel full, dropping polled trade: {e}");
        }
    }
}

fn json_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_compare_numerically() {
        assert!(id_gt("100", "99"));
        assert!(!id_gt("99", "100"));
        assert!(id_gt("0xb", "0xa"));
    }

    #[test]
    fn cursor_delivers_only_strictly_greater_ids() {
        let items = vec![
            ("5".to_string(), json!({})),
            ("3".to_string(), json!({})),
            ("7".to_string(), json!({})),
        ];
        let (fresh, next) = advance_cursor(items, Some("5"));
        let ids: Vec<&str> = fresh.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["7"]);
        assert_eq!(next.as_deref(), Some("7"));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let items = vec![("2".to_string(), json!({}))];
        let (fresh, next) = advance_cursor(items, Some("9"));
        assert!(fresh.is_empty());
        assert_eq!(next.as_deref(), Some("9"));
    }

    #[test]
    fn first_poll_without_cursor_delivers_everything_sorted() {
        let items = vec![
            ("20".to_string(), json!({})),
            ("10".to_string(), json!({})),
        ];
        let (fresh, next) = advance_cursor(items, None);
        let ids: Vec<&str> = fresh.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["10", "20"]);
        assert_eq!(next.as_deref(), Some("20"));
    }
}
