use crate::error::{AppError, Result};
use crate::types::WindowType;

pub const POLYMARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const POLYMARKET_METADATA_URL: &str = "https://gamma-api.polymarket.com/markets";
pub const NEWSAPI_BASE_URL: &str = "https://newsapi.org/v2";

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Mid-tick dedup bucket width. A tick is stored when any of (bid, ask, mid)
/// changed at 3-decimal precision OR this bucket rolled.
pub const TICK_BUCKET_MS: i64 = 2_000;

/// Ticks with spread% at or above this are rejected outright.
pub const MAX_TICK_SPREAD_PCT: f64 = 0.30;

/// Store request timeout (seconds).
pub const STORE_TIMEOUT_SECS: u64 = 8;

/// News provider request timeout (seconds).
pub const NEWS_TIMEOUT_SECS: u64 = 10;

/// Language-model timeouts (seconds): short calls vs narrative generation.
pub const LLM_TIMEOUT_SECS: u64 = 5;
pub const LLM_EXPLAIN_TIMEOUT_SECS: u64 = 8;

/// Live stream cadence.
pub const STREAM_HEARTBEAT_SECS: u64 = 15;
pub const STREAM_POLL_MS: u64 = 1_000;
pub const STREAM_INITIAL_BURST: usize = 500;
/// Consecutive empty polls (after initial activity) before slugs are
/// re-resolved and a `rotate` event is emitted.
pub const STREAM_STALE_THRESHOLD: u32 = 90;

/// Debounce before streaming sockets are rebuilt after a subscription-set change.
pub const RECONNECT_DEBOUNCE_MS: u64 = 5_000;

/// Minimum gap between consecutive connect attempts on one socket.
pub const CONNECT_THROTTLE_MS: u64 = 1_000;

/// Floor applied to backoff after a venue rate-limit response.
pub const RATE_LIMIT_BACKOFF_MS: u64 = 30_000;

/// Finalize batch size: oldest due movements per tick.
pub const FINALIZE_BATCH_SIZE: usize = 10;

/// Tick fetch cap when settling a movement.
pub const FINALIZE_TICK_CAP: usize = 5_000;

/// Events aggregate at least this many child markets.
pub const EVENT_MIN_CHILD_MARKETS: usize = 2;

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
}

impl StoreConfig {
    fn from_env() -> Result<Self> {
        let base_url = std::env::var("SUPABASE_URL")
            .map_err(|_| AppError::Config("SUPABASE_URL is required".to_string()))?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| AppError::Config("SUPABASE_SERVICE_ROLE_KEY is required".to_string()))?;
        Ok(Self { base_url, service_key })
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    /// Comma-separated slug filter for hydration; empty = no filter.
    pub event_slugs: Vec<String>,
    pub metadata_url: String,
    /// Optional gap-fill endpoint; None disables the backfill loop.
    pub backfill_url: Option<String>,
    pub stale_ms: u64,
    pub stale_check_ms: u64,
    pub max_backoff_ms: u64,
    /// Fan-out caps.
    pub max_clob_assets: usize,
    pub max_assets_per_market: usize,
    /// Mover-stats window and refresh cadence.
    pub mover_window_ms: i64,
    pub mover_refresh_ms: u64,
    pub dominant_outcome_ttl_ms: i64,
    /// Polling adapter minimum inter-request gap.
    pub min_request_gap_ms: u64,
}

impl FeedConfig {
    fn from_env() -> Self {
        Self {
            ws_url: env_str("POLYMARKET_WS_URL", POLYMARKET_WS_URL),
            event_slugs: env_str("POLYMARKET_EVENT_SLUGS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            metadata_url: env_str("POLYMARKET_MARKET_METADATA_URL", POLYMARKET_METADATA_URL),
            backfill_url: std::env::var("POLYMARKET_TRADES_BACKFILL_URL").ok(),
            stale_ms: env_u64("WS_STALE_MS", 30_000),
            stale_check_ms: env_u64("WS_STALE_CHECK_MS", 5_000),
            max_backoff_ms: env_u64("WS_MAX_BACKOFF_MS", 60_000),
            max_clob_assets: env_usize("MAX_CLOB_ASSETS", 400),
            max_assets_per_market: env_usize("MAX_ASSETS_PER_MARKET", 4),
            mover_window_ms: env_i64("MOVER_WINDOW_MS", 1_800_000),
            mover_refresh_ms: env_u64("MOVER_REFRESH_MS", 60_000),
            dominant_outcome_ttl_ms: env_i64("DOMINANT_OUTCOME_TTL_MS", 300_000),
            min_request_gap_ms: env_u64("POLL_MIN_REQUEST_GAP_MS", 1_500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_trades: usize,
    pub flush_ms: u64,
    pub dedupe_ttl_ms: i64,
    pub dedupe_cap: usize,
    pub fail_window_ms: i64,
    pub fail_threshold: u32,
    pub spool_path: String,
    pub spool_replay_ms: u64,
}

impl BufferConfig {
    fn from_env() -> Self {
        Self {
            max_trades: env_usize("TRADE_BUFFER_MAX", 200),
            flush_ms: env_u64("TRADE_BUFFER_FLUSH_MS", 1_000),
            dedupe_ttl_ms: env_i64("TRADE_DEDUPE_TTL_MS", 600_000),
            dedupe_cap: env_usize("TRADE_DEDUPE_CAP", 50_000),
            fail_window_ms: env_i64("INSERT_FAIL_WINDOW_MS", 60_000),
            fail_threshold: env_u64("INSERT_FAIL_THRESHOLD", 3) as u32,
            spool_path: env_str("SPOOL_PATH", "trade-spool.jsonl"),
            spool_replay_ms: env_u64("SPOOL_REPLAY_MS", 15_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateConfig {
    pub flush_ms: u64,
    pub min_flush_ms: u64,
    pub max_flush_ms: u64,
    pub max_trades: usize,
}

impl AggregateConfig {
    fn from_env() -> Self {
        Self {
            flush_ms: env_u64("AGGREGATE_FLUSH_MS", 5_000),
            min_flush_ms: env_u64("AGGREGATE_MIN_FLUSH_MS", 1_000),
            max_flush_ms: env_u64("AGGREGATE_MAX_FLUSH_MS", 30_000),
            max_trades: env_usize("AGGREGATE_MAX_TRADES", 50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub interval_ms: u64,
    pub lookback_ms: i64,
    pub silence_ms: i64,
    pub max_trades_per_slug: usize,
}

impl BackfillConfig {
    fn from_env() -> Self {
        Self {
            interval_ms: env_u64("BACKFILL_INTERVAL_MS", 120_000),
            lookback_ms: env_i64("BACKFILL_LOOKBACK_MS", 900_000),
            silence_ms: env_i64("BACKFILL_SILENCE_MS", 60_000),
            max_trades_per_slug: env_usize("MAX_BACKFILL_TRADES_PER_SLUG", 200),
        }
    }
}

/// Per-window movement-detection parameters.
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub window: WindowType,
    pub duration_ms: i64,
    pub price_threshold: f64,
    /// Threshold used instead of `price_threshold` when liquidity is thin.
    pub thin_threshold: f64,
    pub min_abs_move: f64,
    pub volume_threshold: f64,
    /// Epoch-ms divisor producing the idempotency bucket.
    pub bucket_divisor_ms: i64,
    pub settle_delay_ms: i64,
    /// Minimum age since window_start before early finalization may fire.
    pub early_finalize_min_ms: i64,
}

fn window_params(
    tag: &str,
    window: WindowType,
    duration_ms: i64,
    price: f64,
    thin: f64,
    min_abs: f64,
    volume: f64,
    divisor_ms: i64,
    settle_ms: i64,
    early_ms: i64,
) -> WindowParams {
    WindowParams {
        window,
        duration_ms,
        price_threshold: env_f64(&format!("MOVEMENT_{tag}_PRICE_THRESHOLD"), price),
        thin_threshold: env_f64(&format!("MOVEMENT_{tag}_THIN_THRESHOLD"), thin),
        min_abs_move: env_f64(&format!("MOVEMENT_{tag}_MIN_ABS"), min_abs),
        volume_threshold: env_f64(&format!("MOVEMENT_{tag}_VOLUME_THRESHOLD"), volume),
        bucket_divisor_ms: divisor_ms,
        settle_delay_ms: settle_ms,
        early_finalize_min_ms: early_ms,
    }
}

#[derive(Debug, Clone)]
pub struct DetectConfig {
    /// Gate between consecutive scans for the same (market, outcome, window).
    pub min_ms_between_scans: i64,
    pub min_step: f64,
    pub velocity_threshold: f64,
    pub min_price_for_alert: f64,
    /// Window volume below this, or fewer trades than `thin_min_trades`,
    /// marks the movement thin.
    pub thin_volume_floor: f64,
    pub thin_min_trades: i64,
    pub windows: Vec<WindowParams>,
    pub event_windows: Vec<WindowParams>,
    pub finalize_poll_ms: u64,
}

impl DetectConfig {
    fn from_env() -> Self {
        let windows = vec![
            window_params("5M", WindowType::M5, 300_000, 0.06, 0.09, 0.02, 3.0, 1_800_000, 600_000, 120_000),
            window_params("15M", WindowType::M15, 900_000, 0.08, 0.12, 0.03, 3.0, 3_600_000, 1_200_000, 300_000),
            window_params("1H", WindowType::H1, 3_600_000, 0.10, 0.15, 0.04, 2.5, 7_200_000, 2_700_000, 900_000),
            window_params("4H", WindowType::H4, 14_400_000, 0.12, 0.18, 0.05, 2.0, 14_400_000, 7_200_000, 3_600_000),
        ];
        // Event windows run the same scan across child markets with slightly
        // looser thresholds.
        let event_windows = vec![
            window_params("EVENT_1H", WindowType::Event, 3_600_000, 0.08, 0.12, 0.03, 2.0, 7_200_000, 2_700_000, 120_000),
            window_params("EVENT_4H", WindowType::Event, 14_400_000, 0.10, 0.15, 0.04, 1.8, 14_400_000, 7_200_000, 120_000),
        ];
        Self {
            min_ms_between_scans: env_i64("MOVEMENT_MIN_MS", 15_000),
            min_step: env_f64("MOVEMENT_MIN_STEP", 0.002),
            velocity_threshold: env_f64("MOVEMENT_VELOCITY_THRESHOLD", 0.02),
            min_price_for_alert: env_f64("MOVEMENT_MIN_PRICE_FOR_ALERT", 0.05),
            thin_volume_floor: env_f64("MOVEMENT_THIN_VOLUME_FLOOR", 500.0),
            thin_min_trades: env_i64("MOVEMENT_THIN_MIN_TRADES", 5),
            windows,
            event_windows,
            finalize_poll_ms: env_u64("FINALIZE_POLL_MS", 30_000),
        }
    }

    pub fn params(&self, window: WindowType) -> Option<&WindowParams> {
        self.windows.iter().find(|w| w.window == window)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::from_env()
    }
}

/// Real-time (per-tick) detector tuning. All overridable via `MOVEMENT_RT_*`.
#[derive(Debug, Clone)]
pub struct RtDetectConfig {
    pub max_spread_pct: f64,
    pub min_top_size: f64,
    pub min_update_ms: i64,
    pub min_step: f64,
    pub persist_ticks: u32,
    pub persist_ms: i64,
    pub event_cooldown_ms: i64,
    pub breakout_pct: f64,
    pub ema_fast_tau_secs: f64,
    pub ema_slow_tau_secs: f64,
    pub ema_gap_pct: f64,
    pub ema_min_pct: f64,
    pub ema_confirm_ticks: u32,
    pub ema_dir_cooldown_ms: i64,
    pub trade_confirm_ms: i64,
    pub evict_idle_ms: i64,
}

impl RtDetectConfig {
    fn from_env() -> Self {
        Self {
            max_spread_pct: env_f64("MOVEMENT_RT_MAX_SPREAD_PCT", 0.15),
            min_top_size: env_f64("MOVEMENT_RT_MIN_TOP_SIZE", 25.0),
            min_update_ms: env_i64("MOVEMENT_RT_MIN_UPDATE_MS", 250),
            min_step: env_f64("MOVEMENT_RT_MIN_STEP", 0.005),
            persist_ticks: env_u64("MOVEMENT_RT_PERSIST_TICKS", 3) as u32,
            persist_ms: env_i64("MOVEMENT_RT_PERSIST_MS", 1_500),
            event_cooldown_ms: env_i64("MOVEMENT_RT_EVENT_COOLDOWN_MS", 120_000),
            breakout_pct: env_f64("MOVEMENT_RT_BREAKOUT_PCT", 0.03),
            ema_fast_tau_secs: env_f64("MOVEMENT_RT_EMA_FAST_TAU_SECS", 60.0),
            ema_slow_tau_secs: env_f64("MOVEMENT_RT_EMA_SLOW_TAU_SECS", 300.0),
            ema_gap_pct: env_f64("MOVEMENT_RT_EMA_GAP_PCT", 0.004),
            ema_min_pct: env_f64("MOVEMENT_RT_EMA_MIN_PCT", 0.01),
            ema_confirm_ticks: env_u64("MOVEMENT_RT_EMA_CONFIRM_TICKS", 3) as u32,
            ema_dir_cooldown_ms: env_i64("MOVEMENT_RT_EMA_DIR_COOLDOWN_MS", 300_000),
            trade_confirm_ms: env_i64("MOVEMENT_RT_TRADE_CONFIRM_MS", 90_000),
            evict_idle_ms: env_i64("MOVEMENT_RT_EVICT_IDLE_MS", 1_800_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub min_confidence: f64,
    pub liquidity_override: f64,
    pub min_info_trades: i64,
    pub min_info_levels: i64,
    pub time_score_horizon_hours: f64,
    pub time_score_cache_ms: i64,
}

impl ScorerConfig {
    fn from_env() -> Self {
        Self {
            min_confidence: env_f64("SIGNAL_MIN_CONFIDENCE", 0.25),
            liquidity_override: env_f64("LIQUIDITY_OVERRIDE", 0.55),
            min_info_trades: env_i64("MIN_INFO_TRADES", 50),
            min_info_levels: env_i64("MIN_INFO_LEVELS", 8),
            time_score_horizon_hours: env_f64("TIME_SCORE_HORIZON_HOURS", 72.0),
            time_score_cache_ms: env_i64("TIME_SCORE_CACHE_MS", 300_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewsConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl NewsConfig {
    fn from_env() -> Self {
        Self {
            api_key: std::env::var("NEWSAPI_KEY").ok(),
            base_url: env_str("NEWSAPI_BASE_URL", NEWSAPI_BASE_URL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

impl LlmConfig {
    fn from_env() -> Self {
        Self {
            api_url: std::env::var("LLM_API_URL").ok(),
            api_key: std::env::var("LLM_API_KEY").ok(),
        }
    }
}

/// Logging toggles beyond the base `LOG_LEVEL` filter.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<String>,
    pub trade_grouped: bool,
    pub trade_group_ms: u64,
    pub mid: bool,
    pub retry: bool,
    pub event_slugs: bool,
    pub trade_debug: bool,
}

impl LogConfig {
    fn from_env() -> Self {
        Self {
            file: std::env::var("LOG_FILE").ok(),
            trade_grouped: env_bool("LOG_TRADE_GROUPED", false),
            trade_group_ms: env_u64("TRADE_LOG_GROUP_MS", 5_000),
            mid: env_bool("LOG_MID", false),
            retry: env_bool("LOG_RETRY", true),
            event_slugs: env_bool("LOG_EVENT_SLUGS", false),
            trade_debug: env_bool("LOG_TRADE_DEBUG", false),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub buffer: BufferConfig,
    pub aggregates: AggregateConfig,
    pub backfill: BackfillConfig,
    pub detect: DetectConfig,
    pub rt: RtDetectConfig,
    pub scorer: ScorerConfig,
    pub news: NewsConfig,
    pub llm: LlmConfig,
    pub api_port: u16,
    pub log_level: String,
    pub log: LogConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            store: StoreConfig::from_env()?,
            feed: FeedConfig::from_env(),
            buffer: BufferConfig::from_env(),
            aggregates: AggregateConfig::from_env(),
            backfill: BackfillConfig::from_env(),
            detect: DetectConfig::from_env(),
            rt: RtDetectConfig::from_env(),
            scorer: ScorerConfig::from_env(),
            news: NewsConfig::from_env(),
            llm: LlmConfig::from_env(),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            log_level: env_str("LOG_LEVEL", "info"),
            log: LogConfig::from_env(),
        })
    }
}

/// Recency weight keyed by window type; fresher windows carry more signal.
pub fn recency_weight(window: WindowType) -> f64 {
    match window {
        WindowType::M5 => 1.0,
        WindowType::M15 => 0.85,
        WindowType::H1 => 0.65,
        WindowType::H4 => 0.45,
        WindowType::Event => 0.80,
    }
}

/// News lookback per window type (milliseconds).
pub fn news_lookback_ms(window: WindowType) -> i64 {
    match window {
        WindowType::M5 => 3_600_000,
        WindowType::M15 => 14_400_000,
        WindowType::H1 => 43_200_000,
        WindowType::H4 => 172_800_000,
        WindowType::Event => 86_400_000,
    }
}

/// News cache bucket width per window type (milliseconds).
pub fn news_bucket_ms(window: WindowType) -> i64 {
    match window {
        WindowType::M5 => 900_000,
        WindowType::M15 => 1_800_000,
        WindowType::H1 => 3_600_000,
        WindowType::H4 => 7_200_000,
        WindowType::Event => 3_600_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_matches_window_table() {
        assert_eq!(recency_weight(WindowType::M5), 1.0);
        assert_eq!(recency_weight(WindowType::H4), 0.45);
        assert_eq!(recency_weight(WindowType::Event), 0.80);
    }

    #[test]
    fn default_windows_cover_all_four() {
        let detect = DetectConfig::from_env();
        let tags: Vec<&str> = detect.windows.iter().map(|w| w.window.as_str()).collect();
        assert_eq!(tags, vec!["5m", "15m", "1h", "4h"]);
        // 5m idempotency bucket is the 30-minute slice.
        assert_eq!(detect.params(WindowType::M5).unwrap().bucket_divisor_ms, 1_800_000);
    }
}
