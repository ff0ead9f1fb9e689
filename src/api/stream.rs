use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query as AxumQuery, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::routes::ApiState;
use crate::config::{
    STREAM_HEARTBEAT_SECS, STREAM_INITIAL_BURST, STREAM_POLL_MS, STREAM_STALE_THRESHOLD,
};
use crate::scorer::explain::substitute_market;
use crate::state::dominant::DominantOutcomeCache;
use crate::state::MarketCatalog;
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{DominantOutcomeRow, ExplanationRow, MovementRow, TickRow, TradeRow};
use crate::util::{iso_to_ms, ms_to_iso, now_ms};

/// Cursor reset distance after a slug rotation.
const ROTATE_REWIND_MS: i64 = 120_000;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub market_id: Option<String>,
    pub slugs: Option<String>,
    pub asset_id: Option<String>,
    pub event_slug: Option<String>,
    #[serde(rename = "bucketMinutes")]
    pub bucket_minutes: Option<u32>,
    #[serde(rename = "yesOnly")]
    pub yes_only: Option<u8>,
}

fn parse_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or("")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Include predicate
// ---------------------------------------------------------------------------

/// The single source of truth for which (market, outcome) pairs a session
/// receives: event requests pass everything; yesOnly passes only "Yes";
/// binary markets pass their primary; everything else passes the dominant
/// outcome when known and anything when not.
pub struct IncludePredicate {
    pub is_event: bool,
    pub yes_only: bool,
    /// market_id → whether the market is binary.
    pub binary: HashMap<String, bool>,
    /// market_id → primary outcome for binary markets.
    pub primary: HashMap<String, String>,
    /// market_id → dominant outcome (absent when stale or unknown).
    pub dominant: HashMap<String, String>,
}

impl IncludePredicate {
    pub fn should_include(&self, market_id: &str, outcome: &str) -> bool {
        if self.is_event {
            return true;
        }
        if self.yes_only {
            return outcome.eq_ignore_ascii_case("Yes");
        }
        if self.binary.get(market_id).copied().unwrap_or(false) {
            return self
                .primary
                .get(market_id)
                .map(|p| p.eq_ignore_ascii_case(outcome))
                .unwrap_or(true);
        }
        match self.dominant.get(market_id) {
            Some(d) => d.eq_ignore_ascii_case(outcome),
            None => true,
        }
    }
}

/// Build the predicate for a set of markets. Binary markets fix the
/// primary to the dominant outcome when fresh, else index 0.
pub fn build_predicate(
    catalog: &MarketCatalog,
    dominant_cache: &DominantOutcomeCache,
    stored_dominants: &HashMap<String, String>,
    market_ids: &[String],
    is_event: bool,
    yes_only: bool,
) -> IncludePredicate {
    let mut binary = HashMap::new();
    let mut primary = HashMap::new();
    let mut dominant = HashMap::new();

    for market_id in market_ids {
        let fresh_dominant = dominant_cache
            .get(market_id)
            .or_else(|| stored_dominants.get(market_id).cloned());
        if let Some(d) = &fresh_dominant {
            dominant.insert(market_id.clone(), d.clone());
        }

        if let Some(meta) = catalog.get_market(market_id) {
            let is_binary = meta.is_binary();
            binary.insert(market_id.clone(), is_binary);
            if is_binary {
                let labels: Vec<&str> =
                    meta.outcomes.iter().map(|o| o.label.as_str()).collect();
                let chosen = fresh_dominant
                    .filter(|d| labels.iter().any(|l| l.eq_ignore_ascii_case(d)))
                    .unwrap_or_else(|| meta.outcomes[0].label.clone());
                primary.insert(market_id.clone(), chosen);
            }
        }
    }

    IncludePredicate {
        is_event,
        yes_only,
        binary,
        primary,
        dominant,
    }
}

// ---------------------------------------------------------------------------
// Market resolution
// ---------------------------------------------------------------------------

struct Resolved {
    market_ids: Vec<String>,
    is_event: bool,
}

/// Resolve requested instruments to market ids. Slugs resolve through
/// recent trades (their raw payload carries the event slug), with a
/// fallback to the last 10 minutes of active assets; multiple markets per
/// slug collapse to the one with the newest tick.
async fn resolve_markets(state: &ApiState, q: &StreamQuery) -> Resolved {
    let market_ids = parse_csv(&q.market_id);
    if !market_ids.is_empty() {
        return Resolved { market_ids, is_event: false };
    }

    let asset_ids = parse_csv(&q.asset_id);
    if !asset_ids.is_empty() {
        let mut ids: Vec<String> = asset_ids
            .iter()
            .filter_map(|a| state.catalog.token_ref(a).map(|t| t.market_id))
            .collect();
        ids.sort();
        ids.dedup();
        return Resolved { market_ids: ids, is_event: false };
    }

    let event_slugs = parse_csv(&q.event_slug);
    if !event_slugs.is_empty() {
        let mut ids = Vec::new();
        for slug in &event_slugs {
            ids.extend(state.catalog.market_ids_for_slug(slug));
        }
        if ids.is_empty() {
            ids = markets_from_trades(&state.store, &event_slugs).await;
        }
        ids.sort();
        ids.dedup();
        return Resolved { market_ids: ids, is_event: true };
    }

    let slugs = parse_csv(&q.slugs);
    if slugs.is_empty() {
        return Resolved { market_ids: vec![], is_event: false };
    }
    let market_ids = resolve_slugs(state, &slugs).await;
    Resolved { market_ids, is_event: false }
}

async fn resolve_slugs(state: &ApiState, slugs: &[String]) -> Vec<String> {
    let mut by_slug: HashMap<String, Vec<String>> = HashMap::new();

    let rows: Vec<TradeRow> = state
        .store
        .fetch_as(
            "trades",
            &Query::new()
                .in_list("event_slug", slugs.iter())
                .order_desc("ts")
                .limit(200),
        )
        .await
        .unwrap_or_default();
    for row in &rows {
        let key = row.event_slug.clone().or_else(|| row.slug.clone()).unwrap_or_default();
        let entry = by_slug.entry(key).or_default();
        if !entry.contains(&row.market_id) {
            entry.push(row.market_id.clone());
        }
    }
    // Direct market slugs match too.
    let direct: Vec<TradeRow> = state
        .store
        .fetch_as(
            "trades",
            &Query::new()
                .in_list("slug", slugs.iter())
                .order_desc("ts")
                .limit(200),
        )
        .await
        .unwrap_or_default();
    for row in &direct {
        let key = row.slug.clone().unwrap_or_default();
        let entry = by_slug.entry(key).or_default();
        if !entry.contains(&row.market_id) {
            entry.push(row.market_id.clone());
        }
    }

    if by_slug.values().all(|v| v.is_empty()) {
        // Fallback: anything with a tick in the last 10 minutes.
        let recent: Vec<TickRow> = state
            .store
            .fetch_as(
                "market_ticks",
                &Query::new()
                    .gte("ts", &ms_to_iso(now_ms() - 600_000))
                    .order_desc("ts")
                    .limit(500),
            )
            .await
            .unwrap_or_default();
        let mut ids: Vec<String> = recent.into_iter().map(|t| t.market_id).collect();
        ids.sort();
        ids.dedup();
        return ids;
    }

    // Collapse each slug's candidates to the most recently ticking market.
    let mut out = Vec::new();
    for (_, candidates) in by_slug {
        match candidates.len() {
            0 => {}
            1 => out.push(candidates.into_iter().next().unwrap()),
            _ => {
                let latest: Vec<TickRow> = state
                    .store
                    .fetch_as(
                        "market_ticks_latest",
                        &Query::new()
                            .in_list("market_id", candidates.iter())
                            .order_desc("ts")
                            .limit(1),
                    )
                    .await
                    .unwrap_or_default();
                match latest.into_iter().next() {
                    Some(t) => out.push(t.market_id),
                    None => out.push(candidates.into_iter().next().unwrap()),
                }
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

async fn markets_from_trades(store: &StoreGateway, event_slugs: &[String]) -> Vec<String> {
    let rows: Vec<TradeRow> = store
        .fetch_as(
            "trades",
            &Query::new()
                .in_list("event_slug", event_slugs.iter())
                .order_desc("ts")
                .limit(200),
        )
        .await
        .unwrap_or_default();
    let mut ids: Vec<String> = rows.into_iter().map(|t| t.market_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

async fn stored_dominants(store: &StoreGateway, market_ids: &[String], ttl_ms: i64) -> HashMap<String, String> {
    let rows: Vec<DominantOutcomeRow> = store
        .fetch_as(
            "dominant_outcomes",
            &Query::new().in_list("market_id", market_ids.iter()),
        )
        .await
        .unwrap_or_default();
    let cutoff = now_ms() - ttl_ms;
    rows.into_iter()
        .filter(|r| iso_to_ms(&r.updated_at).is_some_and(|ts| ts >= cutoff))
        .map(|r| (r.market_id, r.outcome))
        .collect()
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub async fn stream_handler(
    State(state): State<ApiState>,
    AxumQuery(q): AxumQuery<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    let resolved = resolve_markets(&state, &q).await;
    if resolved.market_ids.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no markets"));
    }

    let yes_only = q.yes_only.unwrap_or(0) == 1;
    let slugs = parse_csv(&q.slugs);
    let ttl_ms = state.cfg.feed.dominant_outcome_ttl_ms;
    let dominants = stored_dominants(&state.store, &resolved.market_ids, ttl_ms).await;
    let predicate = build_predicate(
        &state.catalog,
        &state.dominant,
        &dominants,
        &resolved.market_ids,
        resolved.is_event,
        yes_only,
    );

    info!(
        markets = resolved.market_ids.len(),
        is_event = resolved.is_event,
        yes_only,
        "live stream opened"
    );

    let session = StreamSession {
        state: state.clone(),
        predicate,
        market_ids: resolved.market_ids,
        slugs,
        is_event: resolved.is_event,
        yes_only,
        last_tick_iso: ms_to_iso(now_ms()),
        last_trade_iso: ms_to_iso(now_ms()),
        last_move_iso: ms_to_iso(now_ms()),
        pending: VecDeque::new(),
        initialized: false,
        had_activity: false,
        empty_polls: 0,
    };

    let stream = futures_util::stream::unfold(session, |mut s| async move {
        loop {
            if let Some(event) = s.pending.pop_front() {
                return Some((Ok::<_, Infallible>(event), s));
            }
            if !s.initialized {
                s.initialized = true;
                s.initial_burst().await;
                continue;
            }
            // 1 s poll cadence; the sequential stream is its own overlap
            // guard; a slow poll simply delays the next one.
            tokio::time::sleep(Duration::from_millis(STREAM_POLL_MS)).await;
            s.poll_once().await;
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(STREAM_HEARTBEAT_SECS))
            .text("keep-alive"),
    ))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct StreamSession {
    state: ApiState,
    predicate: IncludePredicate,
    market_ids: Vec<String>,
    slugs: Vec<String>,
    is_event: bool,
    yes_only: bool,
    last_tick_iso: String,
    last_trade_iso: String,
    last_move_iso: String,
    pending: VecDeque<Event>,
    initialized: bool,
    had_activity: bool,
    empty_polls: u32,
}

impl StreamSession {
    fn push_named(&mut self, name: &str, data: &impl serde::Serialize) {
        match Event::default().event(name).json_data(data) {
            Ok(event) => self.pending.push_back(event),
            Err(e) => warn!("SSE serialization failed for {name}: {e}"),
        }
    }

    fn push_error(&mut self, message: &str) {
        self.push_named("error", &serde_json::json!({ "message": message }));
    }

    /// Latest ticks across all markets, deduped by (market, outcome),
    /// newest wins, one `tick` event per pair.
    async fn initial_burst(&mut self) {
        let result: Result<Vec<TickRow>, _> = self
            .state
            .store
            .fetch_as(
                "market_ticks",
                &Query::new()
                    .in_list("market_id", self.market_ids.iter())
                    .order_desc("ts")
                    .limit(STREAM_INITIAL_BURST),
            )
            .await;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!("initial burst failed: {e}");
                self.push_error("initial tick load failed");
                return;
            }
        };

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut burst: Vec<TickRow> = Vec::new();
        let mut max_ts = 0i64;
        for row in rows {
            // Rows arrive newest-first; the first per pair is the latest.
            let key = (row.market_id.clone(), row.outcome.clone());
            if !seen.insert(key) {
                continue;
            }
            if !self.predicate.should_include(&row.market_id, &row.outcome) {
                continue;
            }
            max_ts = max_ts.max(row.ts_ms());
            burst.push(row);
        }
        // Emit oldest-first so per-pair ordering by ts holds downstream.
        burst.sort_by_key(|r| r.ts_ms());
        let count = burst.len();
        for row in burst {
            self.push_named("tick", &row);
        }
        if count > 0 {
            self.had_activity = true;
        }
        if max_ts > 0 {
            self.last_tick_iso = ms_to_iso(max_ts);
        }
        debug!(count, "initial burst emitted");
    }

    async fn poll_once(&mut self) {
        let movement_ids = self.movement_query_ids();
        let tick_q = Query::new()
            .in_list("market_id", self.market_ids.iter())
            .gt("ts", &self.last_tick_iso)
            .order_asc("ts")
            .limit(500);
        let trade_q = Query::new()
            .in_list("market_id", self.market_ids.iter())
            .gt("ts", &self.last_trade_iso)
            .order_asc("ts")
            .limit(500);
        let move_q = Query::new()
            .in_list("market_id", movement_ids.iter())
            .gt("window_end", &self.last_move_iso)
            .order_asc("window_end")
            .limit(100);

        // All three cursors advance independently; one failing leg must
        // not starve the others.
        let (ticks, trades, movements) = tokio::join!(
            self.state.store.fetch_as::<TickRow>("market_ticks", &tick_q),
            self.state.store.fetch_as::<TradeRow>("trades", &trade_q),
            self.state.store.fetch_as::<MovementRow>("movements", &move_q),
        );

        match ticks {
            Ok(rows) => self.process_ticks(rows).await,
            Err(e) => {
                debug!("tick poll failed: {e}");
                self.push_error("tick poll failed");
            }
        }
        match trades {
            Ok(rows) => self.process_trades(rows),
            Err(e) => {
                debug!("trade poll failed: {e}");
                self.push_error("trade poll failed");
            }
        }
        match movements {
            Ok(rows) => self.process_movements(rows).await,
            Err(e) => {
                debug!("movement poll failed: {e}");
                self.push_error("movement poll failed");
            }
        }
    }

    fn movement_query_ids(&self) -> Vec<String> {
        let mut ids = self.market_ids.clone();
        for slug in &self.slugs {
            ids.push(format!("event:{slug}"));
        }
        for market_id in &self.market_ids {
            if let Some(event) = self.state.catalog.event_for_market(market_id) {
                let id = format!("event:{event}");
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    async fn process_ticks(&mut self, rows: Vec<TickRow>) {
        if rows.is_empty() {
            if self.had_activity {
                self.empty_polls += 1;
                if self.empty_polls >= STREAM_STALE_THRESHOLD && !self.slugs.is_empty() {
                    self.rotate().await;
                }
            }
            return;
        }
        self.empty_polls = 0;
        self.had_activity = true;

        let mut max_ts = iso_to_ms(&self.last_tick_iso).unwrap_or(0);
        for row in rows {
            max_ts = max_ts.max(row.ts_ms());
            if self.predicate.should_include(&row.market_id, &row.outcome) {
                self.push_named("tick", &row);
            }
        }
        self.last_tick_iso = ms_to_iso(max_ts);
    }

    fn process_trades(&mut self, rows: Vec<TradeRow>) {
        let mut max_ts = iso_to_ms(&self.last_trade_iso).unwrap_or(0);
        for row in rows {
            max_ts = max_ts.max(row.ts_ms());
            if self.predicate.should_include(&row.market_id, &row.outcome) {
                self.push_named("trade", &row);
            }
        }
        self.last_trade_iso = ms_to_iso(max_ts.max(iso_to_ms(&self.last_trade_iso).unwrap_or(0)));
    }

    async fn process_movements(&mut self, rows: Vec<MovementRow>) {
        if rows.is_empty() {
            return;
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let explanations: HashMap<String, String> = self
            .state
            .store
            .fetch_as::<ExplanationRow>(
                "movement_explanations",
                &Query::new().in_list("movement_id", ids.iter()),
            )
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.movement_id, e.text))
            .collect();

        let mut max_ts = iso_to_ms(&self.last_move_iso).unwrap_or(0);
        for row in rows {
            max_ts = max_ts.max(iso_to_ms(&row.window_end).unwrap_or(0));
            let mut explanation = explanations.get(&row.id).cloned();
            if let (Some(text), Some(slug)) =
                (&explanation, row.market_id.strip_prefix("event:"))
            {
                // Event movements read better when the first sentence names
                // the leading child market.
                if let Some(title) = self
                    .state
                    .catalog
                    .event_children(slug)
                    .first()
                    .and_then(|id| self.state.catalog.get_market(id))
                    .map(|m| m.title)
                {
                    explanation = Some(substitute_market(text, &title));
                }
            }
            let payload = serde_json::json!({
                "movement": row,
                "explanation": explanation,
            });
            self.push_named("movement", &payload);
        }
        self.last_move_iso = ms_to_iso(max_ts);
    }

    /// The tracked slug's market went quiet: re-resolve, announce the new
    /// ids, and rewind the tick cursor slightly.
    async fn rotate(&mut self) {
        self.empty_polls = 0;
        let new_ids = resolve_slugs(&self.state, &self.slugs).await;
        if new_ids.is_empty() {
            debug!("rotation found no replacement markets");
            return;
        }
        info!(markets = new_ids.len(), "stale stream re-resolved slugs");

        let dominants = stored_dominants(
            &self.state.store,
            &new_ids,
            self.state.cfg.feed.dominant_outcome_ttl_ms,
        )
        .await;
        self.predicate = build_predicate(
            &self.state.catalog,
            &self.state.dominant,
            &dominants,
            &new_ids,
            self.is_event,
            self.yes_only,
        );
        self.market_ids = new_ids.clone();
        self.last_tick_iso = ms_to_iso(now_ms() - ROTATE_REWIND_MS);
        self.push_named("rotate", &serde_json::json!({ "market_ids": new_ids }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::catalog::market_meta;

    fn predicate_for(
        markets: &[(&str, &[(&str, &str)])],
        dominants: &[(&str, &str)],
        is_event: bool,
        yes_only: bool,
    ) -> IncludePredicate {
        let catalog = MarketCatalog::new();
        for (id, outcomes) in markets {
            catalog.add_market(market_meta(id, id, id, None, outcomes));
        }
        let cache = DominantOutcomeCache::new(300_000);
        let stored: HashMap<String, String> = dominants
            .iter()
            .map(|(m, o)| (m.to_string(), o.to_string()))
            .collect();
        let ids: Vec<String> = markets.iter().map(|(id, _)| id.to_string()).collect();
        build_predicate(&catalog, &cache, &stored, &ids, is_event, yes_only)
    }

    #[test]
    fn event_requests_pass_everything() {
        let p = predicate_for(&[("m1", &[("Yes", "t1"), ("No", "t2")])], &[], true, false);
        assert!(p.should_include("m1", "No"));
        assert!(p.should_include("unknown", "Whatever"));
    }

    #[test]
    fn yes_only_passes_only_yes() {
        let p = predicate_for(&[("m1", &[("Yes", "t1"), ("No", "t2")])], &[], false, true);
        assert!(p.should_include("m1", "Yes"));
        assert!(p.should_include("m1", "yes"));
        assert!(!p.should_include("m1", "No"));
    }

    #[test]
    fn binary_market_passes_only_primary() {
        // Dominant says "No", so the primary flips away from index 0.
        let p = predicate_for(
            &[("m1", &[("Yes", "t1"), ("No", "t2")])],
            &[("m1", "No")],
            false,
            false,
        );
        assert!(!p.should_include("m1", "Yes"));
        assert!(p.should_include("m1", "No"));
    }

    #[test]
    fn binary_defaults_to_index_zero_without_dominant() {
        let p = predicate_for(&[("m1", &[("Up", "t1"), ("Down", "t2")])], &[], false, false);
        assert!(p.should_include("m1", "Up"));
        assert!(!p.should_include("m1", "Down"));
    }

    #[test]
    fn multi_outcome_uses_dominant_or_passes_all() {
        let outcomes: &[(&str, &str)] = &[("A", "t1"), ("B", "t2"), ("C", "t3")];
        let with_dominant = predicate_for(&[("m1", outcomes)], &[("m1", "B")], false, false);
        assert!(!with_dominant.should_include("m1", "A"));
        assert!(with_dominant.should_include("m1", "B"));

        // Stale/absent dominant → pass-through.
        let without = predicate_for(&[("m1", outcomes)], &[], false, false);
        assert!(without.should_include("m1", "A"));
        assert!(without.should_include("m1", "C"));
    }

    #[test]
    fn csv_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_csv(&Some(" a, b ,,c".to_string())),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_csv(&None).is_empty());
    }
}
