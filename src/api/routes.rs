use std::sync::Arc;

use axum::{extract::State, routing::{get, post}, Json, Router};

use crate::api::health::HealthState;
use crate::api::{stream, track};
use crate::config::Config;
use crate::state::dominant::DominantOutcomeCache;
use crate::state::latency::LatencyStats;
use crate::state::MarketCatalog;
use crate::store::gateway::StoreGateway;
use crate::util::now_ms;

#[derive(Clone)]
pub struct ApiState {
    pub cfg: Arc<Config>,
    pub store: Arc<StoreGateway>,
    pub catalog: Arc<MarketCatalog>,
    pub dominant: Arc<DominantOutcomeCache>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/stream", get(stream::stream_handler))
        .route("/track", post(track::track_handler))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

async fn get_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let last_trade = state.health.last_trade_at_ms();
    let last_trade_age_ms = if last_trade > 0 {
        Some(now_ms() - last_trade)
    } else {
        None
    };
    Json(serde_json::json!({
        "feed_connected": state.health.feed_connected(),
        "last_trade_age_ms": last_trade_age_ms,
        "buffer_depth": state.health.buffer_depth(),
        "spool_backlog": state.health.spool_backlog(),
        "tracked_markets": state.catalog.market_count(),
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (p50, p95, p99) = state.latency.percentiles();
    Json(serde_json::json!({
        "samples": state.latency.len(),
        "p50_us": p50,
        "p95_us": p95,
        "p99_us": p99,
    }))
}
