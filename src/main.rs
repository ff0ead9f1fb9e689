mod api;
mod config;
mod detector;
mod error;
mod ingest;
mod llm;
mod news;
mod scorer;
mod state;
mod store;
mod types;
mod util;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::detector::event::EventMovementDetector;
use crate::detector::finalize::FinalizeWorker;
use crate::detector::realtime::RealtimeDetector;
use crate::detector::windowed::WindowedDetector;
use crate::error::Result;
use crate::ingest::backfill::BackfillWorker;
use crate::ingest::hydrate::{fetch_markets, CatalogRefresher};
use crate::ingest::polymarket_ws::PolymarketWsAdapter;
use crate::ingest::rest_poller::RestPollerAdapter;
use crate::ingest::subscription::SubscriptionController;
use crate::ingest::SourceAdapter;
use crate::llm::{HttpLlm, LanguageModel};
use crate::news::{engine::NewsEngine, provider::NewsProvider};
use crate::scorer::signal::SignalScorer;
use crate::state::dominant::DominantOutcomeCache;
use crate::state::latency::LatencyStats;
use crate::state::MarketCatalog;
use crate::store::aggregates::AggregateEngine;
use crate::store::gateway::StoreGateway;
use crate::store::spool::{Spool, SpoolReplayer};
use crate::store::tick_writer::MidTickWriter;
use crate::store::trade_buffer::TradeBuffer;
use crate::types::{FeedEvent, NormalizedTick, NormalizedTrade};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    match &cfg.log.file {
        Some(path) => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Cannot open LOG_FILE {path}: {e}");
                    std::process::exit(1);
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(&cfg.log_level))
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(&cfg.log_level))
                .init();
        }
    }

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    let store = Arc::new(StoreGateway::new(&cfg.store)?);
    info!("store gateway ready at {}", cfg.store.base_url);

    // --- Market metadata hydration ---
    let catalog = MarketCatalog::new();
    match fetch_markets(&cfg.feed).await {
        Ok(markets) => {
            info!("hydrated {} markets from metadata endpoint", markets.len());
            catalog.add_markets(markets);
        }
        Err(e) => {
            // Not fatal: the refresher keeps retrying and adapters replay
            // their subscriptions once metadata lands.
            warn!("initial hydration failed, continuing with empty catalog: {e}");
        }
    }

    // --- Shared state ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let dominant = DominantOutcomeCache::new(cfg.feed.dominant_outcome_ttl_ms);

    // --- Channels ---
    let (events_tx, events_rx) = mpsc::channel::<FeedEvent>(CHANNEL_CAPACITY);
    let (agg_tx, agg_rx) = mpsc::channel::<NormalizedTrade>(CHANNEL_CAPACITY);
    let (tick_tx, tick_rx) = mpsc::channel::<NormalizedTick>(CHANNEL_CAPACITY);
    let (rt_tx, rt_rx) = mpsc::channel::<FeedEvent>(CHANNEL_CAPACITY);
    let (windowed_tx, windowed_rx) = mpsc::channel::<NormalizedTrade>(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<NormalizedTrade>(CHANNEL_CAPACITY);
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<NormalizedTrade>(CHANNEL_CAPACITY);

    // --- Trade buffer + spool ---
    let spool = Spool::new(cfg.buffer.spool_path.clone());
    let (buffer_handle, trade_buffer) = TradeBuffer::new(
        cfg.buffer.clone(),
        Arc::clone(&store),
        Arc::clone(&spool),
        Arc::clone(&health),
    );
    tokio::spawn(trade_buffer.run());
    let replayer = SpoolReplayer::new(
        Arc::clone(&spool),
        Arc::clone(&store),
        cfg.buffer.spool_replay_ms,
        cfg.log.retry,
    );
    tokio::spawn(replayer.run());

    // --- Aggregates ---
    let aggregates = AggregateEngine::new(cfg.aggregates.clone(), Arc::clone(&store), agg_rx);
    tokio::spawn(aggregates.run());

    // --- Mid-tick writer ---
    let tick_writer = MidTickWriter::new(Arc::clone(&store), tick_rx);
    tokio::spawn(tick_writer.run());

    // --- Detectors ---
    let rt_detector = RealtimeDetector::new(cfg.rt.clone(), Arc::clone(&store), rt_rx);
    tokio::spawn(rt_detector.run());

    let windowed = WindowedDetector::new(cfg.detect.clone(), Arc::clone(&store), windowed_rx);
    tokio::spawn(windowed.run());

    let event_detector = EventMovementDetector::new(
        cfg.detect.clone(),
        Arc::clone(&store),
        Arc::clone(&catalog),
        event_rx,
    );
    tokio::spawn(event_detector.run());

    // --- Scorer + finalize ---
    let llm: Option<Arc<dyn LanguageModel>> = HttpLlm::from_config(&cfg.llm)
        .map(|l| Arc::new(l) as Arc<dyn LanguageModel>);
    let news = NewsProvider::from_config(&cfg.news).map(|provider| {
        Arc::new(NewsEngine::new(
            Arc::clone(&store),
            Some(provider),
            llm.clone(),
        ))
    });
    if news.is_none() {
        warn!("NEWSAPI_KEY not set, news scores degrade to 0");
    }
    let scorer = Arc::new(SignalScorer::new(
        cfg.scorer.clone(),
        Arc::clone(&store),
        news,
        llm,
    ));
    let finalize = FinalizeWorker::new(cfg.detect.clone(), Arc::clone(&store), Arc::clone(&scorer));
    tokio::spawn(finalize.run());

    // --- Source adapters ---
    let ws_adapter: Arc<PolymarketWsAdapter> = Arc::new(PolymarketWsAdapter::new(
        cfg.feed.clone(),
        Arc::clone(&catalog),
        events_tx.clone(),
        Arc::clone(&health),
    ));
    ws_adapter.start().await;

    let rest_adapter: Arc<RestPollerAdapter> = Arc::new(RestPollerAdapter::new(
        cfg.feed.clone(),
        Arc::clone(&catalog),
        events_tx.clone(),
        Arc::clone(&health),
    ));
    rest_adapter.start().await;

    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        ws_adapter as Arc<dyn SourceAdapter>,
        rest_adapter as Arc<dyn SourceAdapter>,
    ];

    // --- Subscription controller ---
    let controller = SubscriptionController::new(
        cfg.feed.clone(),
        Arc::clone(&catalog),
        Arc::clone(&dominant),
        Arc::clone(&store),
        adapters,
        ctrl_rx,
    );
    tokio::spawn(controller.run());

    // --- Backfill + catalog refresh ---
    let backfill = BackfillWorker::new(
        cfg.backfill.clone(),
        cfg.feed.clone(),
        Arc::clone(&catalog),
        buffer_handle.clone(),
        Arc::clone(&health),
    );
    tokio::spawn(backfill.run());

    let refresher = CatalogRefresher::new(cfg.feed.clone(), Arc::clone(&catalog));
    tokio::spawn(refresher.run());

    // --- Dispatcher: fan normalized events out to every consumer ---
    let dispatch_latency = Arc::clone(&latency);
    let dispatch_log = cfg.log.clone();
    tokio::spawn(dispatch(
        events_rx,
        buffer_handle,
        agg_tx,
        tick_tx,
        rt_tx,
        windowed_tx,
        event_tx,
        ctrl_tx,
        dispatch_latency,
        dispatch_log,
    ));

    // --- HTTP API ---
    let api_state = ApiState {
        cfg: Arc::clone(&cfg),
        store,
        catalog,
        dominant,
        health,
        latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes each normalized feed event to every interested component.
/// Hot path: clone-and-try_send only, never blocking on a slow consumer.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    mut events_rx: mpsc::Receiver<FeedEvent>,
    buffer: crate::store::trade_buffer::TradeBufferHandle,
    agg_tx: mpsc::Sender<NormalizedTrade>,
    tick_tx: mpsc::Sender<NormalizedTick>,
    rt_tx: mpsc::Sender<FeedEvent>,
    windowed_tx: mpsc::Sender<NormalizedTrade>,
    event_tx: mpsc::Sender<NormalizedTrade>,
    ctrl_tx: mpsc::Sender<NormalizedTrade>,
    latency: Arc<LatencyStats>,
    log: crate::config::LogConfig,
) {
    let mut grouped_count: u64 = 0;
    let mut grouped_volume: f64 = 0.0;
    let mut group_started = Instant::now();

    while let Some(event) = events_rx.recv().await {
        let started = Instant::now();
        match event {
            FeedEvent::Trade(trade) => {
                if log.trade_grouped {
                    grouped_count += 1;
                    grouped_volume += trade.size;
                    if group_started.elapsed().as_millis() as u64 >= log.trade_group_ms {
                        info!(
                            trades = grouped_count,
                            volume = grouped_volume,
                            "[FEED] {grouped_count} trades / ${grouped_volume:.0} in the last {}ms",
                            log.trade_group_ms
                        );
                        grouped_count = 0;
                        grouped_volume = 0.0;
                        group_started = Instant::now();
                    }
                } else if log.trade_debug {
                    if log.event_slugs {
                        tracing::debug!(
                            trade_id = %trade.id,
                            market_id = %trade.market_id,
                            event_slug = trade.event_slug.as_deref().unwrap_or("-"),
                            price = trade.price,
                            size = trade.size,
                            "trade"
                        );
                    } else {
                        tracing::debug!(
                            trade_id = %trade.id,
                            market_id = %trade.market_id,
                            price = trade.price,
                            size = trade.size,
                            "trade"
                        );
                    }
                }
                buffer.submit(trade.clone());
                send_or_warn(&agg_tx, trade.clone(), "aggregates");
                send_or_warn(&windowed_tx, trade.clone(), "windowed detector");
                send_or_warn(&event_tx, trade.clone(), "event detector");
                send_or_warn(&ctrl_tx, trade.clone(), "subscription controller");
                if let Err(e) = rt_tx.try_send(FeedEvent::Trade(trade)) {
                    warn!("rt detector channel full, dropping trade: {e}");
                }
            }
            FeedEvent::Tick(tick) => {
                if log.mid {
                    tracing::debug!(
                        asset_id = %tick.asset_id,
                        mid = tick.mid,
                        spread_pct = tick.spread_pct,
                        "mid"
                    );
                }
                if let Err(e) = tick_tx.try_send(tick.clone()) {
                    warn!("tick writer channel full, dropping tick: {e}");
                }
                if let Err(e) = rt_tx.try_send(FeedEvent::Tick(tick)) {
                    warn!("rt detector channel full, dropping tick: {e}");
                }
            }
        }
        latency.record(started.elapsed());
    }
}

fn send_or_warn(tx: &mpsc::Sender<NormalizedTrade>, trade: NormalizedTrade, target: &str) {
    if let Err(e) = tx.try_send(trade) {
        warn!("{target} channel full, dropping trade: {e}");
    }
}
