use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::config::{FeedConfig, CONNECT_THROTTLE_MS, RECONNECT_DEBOUNCE_MS};
use crate::error::{AppError, Result};
use crate::ingest::messages::{best_ask, best_bid, parse_market_frame, ParsedFrame};
use crate::ingest::normalize::{normalize_tick, normalize_trade};
use crate::ingest::{is_rate_limited, BackoffPolicy, SourceAdapter};
use crate::state::MarketCatalog;
use crate::types::FeedEvent;
use crate::util::now_ms;

/// Partition the tracked-asset set into shards of at most `max` assets,
/// one underlying socket per shard.
pub fn partition_shards(assets: &[String], max: usize) -> Vec<Vec<String>> {
    if assets.is_empty() || max == 0 {
        return Vec::new();
    }
    assets.chunks(max).map(|c| c.to_vec()).collect()
}

struct WsShared {
    cfg: FeedConfig,
    catalog: Arc<MarketCatalog>,
    events_tx: mpsc::Sender<FeedEvent>,
    health: Arc<HealthState>,
    /// Desired asset subscriptions; replayed on every (re)open.
    subs: Mutex<HashSet<String>>,
    /// Carried-forward top-of-book sizes per asset, since price_change frames
    /// only describe one changed level.
    top_sizes: DashMap<String, (f64, f64)>,
    running: AtomicBool,
}

/// Streaming adapter for the venue's market channel. Maintains one socket
/// per asset shard, each with its own reconnect/backoff loop; a debounced
/// manager rebuilds all sockets when the subscription set changes.
pub struct PolymarketWsAdapter {
    shared: Arc<WsShared>,
    rebuild_tx: mpsc::Sender<()>,
    rebuild_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl PolymarketWsAdapter {
    pub fn new(
        cfg: FeedConfig,
        catalog: Arc<MarketCatalog>,
        events_tx: mpsc::Sender<FeedEvent>,
        health: Arc<HealthState>,
    ) -> Self {
        let (rebuild_tx, rebuild_rx) = mpsc::channel(16);
        Self {
            shared: Arc::new(WsShared {
                cfg,
                catalog,
                events_tx,
                health,
                subs: Mutex::new(HashSet::new()),
                top_sizes: DashMap::new(),
                running: AtomicBool::new(false),
            }),
            rebuild_tx,
            rebuild_rx: tokio::sync::Mutex::new(Some(rebuild_rx)),
        }
    }

    fn nudge(&self) {
        let _ = self.rebuild_tx.try_send(());
    }
}

#[async_trait]
impl SourceAdapter for PolymarketWsAdapter {
    fn name(&self) -> &'static str {
        "polymarket-ws"
    }

    async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(rebuild_rx) = self.rebuild_rx.lock().await.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(manager_loop(shared, rebuild_rx));
        self.nudge();
        info!("polymarket-ws adapter started");
    }

    async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.nudge();
        info!("polymarket-ws adapter stopping");
    }

    fn subscribe(&self, instrument: &str) {
        let changed = self
            .shared
            .subs
            .lock()
            .unwrap()
            .insert(instrument.to_string());
        if changed {
            self.nudge();
        }
    }

    fn unsubscribe(&self, instrument: &str) {
        let changed = self.shared.subs.lock().unwrap().remove(instrument);
        if changed {
            self.shared.top_sizes.remove(instrument);
            self.nudge();
        }
    }

    fn subscribed(&self) -> Vec<String> {
        self.shared.subs.lock().unwrap().iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Shard manager
// ---------------------------------------------------------------------------

async fn manager_loop(shared: Arc<WsShared>, mut rebuild_rx: mpsc::Receiver<()>) {
    let mut shards: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if rebuild_rx.recv().await.is_none() {
            break;
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        // Debounce: absorb further set changes before tearing sockets down.
        let _ = tokio::time::timeout(Duration::from_millis(RECONNECT_DEBOUNCE_MS), async {
            while rebuild_rx.recv().await.is_some() {}
        })
        .await;

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        for handle in shards.drain(..) {
            handle.abort();
        }

        let mut assets: Vec<String> = shared.subs.lock().unwrap().iter().cloned().collect();
        assets.sort();
        let chunks = partition_shards(&assets, shared.cfg.max_clob_assets);
        info!(
            assets = assets.len(),
            shards = chunks.len(),
            "rebuilding WS shards"
        );
        for chunk in chunks {
            let shared = Arc::clone(&shared);
            shards.push(tokio::spawn(run_shard(shared, chunk)));
        }
    }

    for handle in shards.drain(..) {
        handle.abort();
    }
    shared.health.set_feed_connected(false);
}

async fn run_shard(shared: Arc<WsShared>, assets: Vec<String>) {
    let mut backoff = BackoffPolicy::new(500, shared.cfg.max_backoff_ms);
    let mut last_attempt: Option<Instant> = None;

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        // A connect attempt within 1 s of the last is throttled: re-schedule
        // without connecting.
        if let Some(prev) = last_attempt {
            let since = prev.elapsed();
            let throttle = Duration::from_millis(CONNECT_THROTTLE_MS);
            if since < throttle {
                tokio::time::sleep(throttle - since).await;
            }
        }
        last_attempt = Some(Instant::now());

        match connect_shard(&shared, &assets).await {
            Ok(()) => {
                debug!(assets = assets.len(), "shard closed cleanly");
                backoff.on_success();
            }
            Err(e) => {
                let msg = e.to_string();
                if is_rate_limited(&msg) {
                    backoff.on_rate_limit();
                    warn!(
                        "shard rate-limited, backing off {}ms: {msg}",
                        backoff.current_ms()
                    );
                } else {
                    backoff.on_failure();
                    warn!("shard error, backing off {}ms: {msg}", backoff.current_ms());
                }
                tokio::time::sleep(Duration::from_millis(backoff.jittered_ms())).await;
            }
        }
    }
}

async fn connect_shard(shared: &Arc<WsShared>, assets: &[String]) -> Result<()> {
    let (ws_stream, _) = connect_async(&shared.cfg.ws_url).await?;
    shared.health.set_feed_connected(true);
    let (mut write, mut read) = ws_stream.split();

    // Subscription replay on every (re)open.
    let sub_msg = serde_json::json!({
        "assets_ids": assets,
        "type": "market"
    })
    .to_string();
    write.send(Message::Text(sub_msg.into())).await?;
    debug!(assets = assets.len(), "shard subscribed");

    let mut ping_interval = interval(Duration::from_secs(10));
    ping_interval.tick().await; // consume immediate first tick
    let mut stale_interval = interval(Duration::from_millis(shared.cfg.stale_check_ms));
    stale_interval.tick().await;
    let mut last_msg_at = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_msg_at = Instant::now();
                        if is_rate_limited(&text) {
                            shared.health.set_feed_connected(false);
                            return Err(AppError::Feed(format!("venue throttled: {text}")));
                        }
                        handle_frame(shared, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_msg_at = Instant::now();
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        shared.health.set_feed_connected(false);
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        shared.health.set_feed_connected(false);
                        return Err(e.into());
                    }
                    Some(Ok(_)) => {}
                }
            }

            _ = ping_interval.tick() => {
                write.send(Message::Ping(vec![].into())).await?;
            }

            _ = stale_interval.tick() => {
                if last_msg_at.elapsed() > Duration::from_millis(shared.cfg.stale_ms) {
                    shared.health.set_feed_connected(false);
                    return Err(AppError::Feed(format!(
                        "no messages for {}ms, forcing close",
                        last_msg_at.elapsed().as_millis()
                    )));
                }
                if !shared.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

fn handle_frame(shared: &Arc<WsShared>, text: &str) {
    for frame in parse_market_frame(text) {
        match frame {
            ParsedFrame::BookSnapshot { asset_id, asks, bids, ts_ms } => {
                let Some(token) = shared.catalog.token_ref(&asset_id) else {
                    continue;
                };
                let (Some((ask, ask_size)), Some((bid, bid_size))) =
                    (best_ask(&asks), best_bid(&bids))
                else {
                    continue;
                };
                shared.top_sizes.insert(asset_id.clone(), (bid_size, ask_size));
                let ts = ts_ms.unwrap_or_else(now_ms);
                if let Some(tick) =
                    normalize_tick(&token, &asset_id, bid, ask, bid_size, ask_size, ts)
                {
                    route(shared, FeedEvent::Tick(tick));
                }
            }

            ParsedFrame::TopOfBookChange {
                asset_id,
                best_bid,
                best_ask,
                level_price,
                level_size,
                is_ask,
                ts_ms,
            } => {
                let Some(token) = shared.catalog.token_ref(&asset_id) else {
                    continue;
                };
                let (Some(bid), Some(ask)) = (best_bid, best_ask) else {
                    continue;
                };
                let (mut bid_size, mut ask_size) = shared
                    .top_sizes
                    .get(&asset_id)
                    .map(|e| *e.value())
                    .unwrap_or((0.0, 0.0));
                // The changed level is the new top when its price matches.
                if is_ask && (level_price - ask).abs() < 1e-9 {
                    ask_size = level_size;
                } else if !is_ask && (level_price - bid).abs() < 1e-9 {
                    bid_size = level_size;
                }
                shared.top_sizes.insert(asset_id.clone(), (bid_size, ask_size));

                let ts = ts_ms.unwrap_or_else(now_ms);
                if let Some(tick) =
                    normalize_tick(&token, &asset_id, bid, ask, bid_size, ask_size, ts)
                {
                    route(shared, FeedEvent::Tick(tick));
                }
            }

            ParsedFrame::Trade { asset_id, price, size, side, ts_ms, tx_hash } => {
                let Some(token) = shared.catalog.token_ref(&asset_id) else {
                    continue;
                };
                let Some(market) = shared.catalog.get_market(&token.market_id) else {
                    continue;
                };
                let ts = ts_ms.unwrap_or_else(now_ms);
                let raw = serde_json::json!({
                    "asset_id": asset_id,
                    "price": price,
                    "size": size,
                    "side": side,
                    "timestamp": ts,
                    "transaction_hash": tx_hash,
                    "slug": market.slug,
                    "title": market.title,
                    "eventSlug": market.event_slug,
                });
                if let Some(trade) = normalize_trade(
                    &market,
                    &token,
                    &asset_id,
                    price,
                    size,
                    side.as_deref(),
                    ts,
                    tx_hash.as_deref(),
                    raw,
                ) {
                    shared.health.set_last_trade_at_ms(ts);
                    route(shared, FeedEvent::Trade(trade));
                }
            }
        }
    }
}

fn route(shared: &Arc<WsShared>, event: FeedEvent) {
    if let Err(e) = shared.events_tx.try_send(event) {
        warn!("feed channel full, dropping event: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("asset{i}")).collect()
    }

    #[test]
    fn shards_respect_max_assets_per_socket() {
        let shards = partition_shards(&ids(10), 4);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].len(), 4);
        assert_eq!(shards[2].len(), 2);
        let total: usize = shards.iter().map(|s| s.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn empty_set_produces_no_shards() {
        assert!(partition_shards(&[], 4).is_empty());
        assert!(partition_shards(&ids(3), 0).is_empty());
    }

    #[tokio::test]
    async fn subscribe_tracks_and_dedupes_instruments() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let adapter = PolymarketWsAdapter::new(
            crate::config::FeedConfig {
                ws_url: "wss://localhost".to_string(),
                event_slugs: vec![],
                metadata_url: String::new(),
                backfill_url: None,
                stale_ms: 30_000,
                stale_check_ms: 5_000,
                max_backoff_ms: 60_000,
                max_clob_assets: 400,
                max_assets_per_market: 4,
                mover_window_ms: 1_800_000,
                mover_refresh_ms: 60_000,
                dominant_outcome_ttl_ms: 300_000,
                min_request_gap_ms: 1_500,
            },
            MarketCatalog::new(),
            events_tx,
            Arc::new(HealthState::new()),
        );

        adapter.subscribe("a1");
        adapter.subscribe("a2");
        adapter.subscribe("a1");
        let mut subs = adapter.subscribed();
        subs.sort();
        assert_eq!(subs, vec!["a1".to_string(), "a2".to_string()]);

        adapter.unsubscribe("a1");
        assert_eq!(adapter.subscribed(), vec!["a2".to_string()]);
    }
}
