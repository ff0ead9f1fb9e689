use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::error::{AppError, Result};
use crate::state::MarketCatalog;
use crate::types::{MarketMeta, OutcomeMeta};

/// How often the catalog is re-hydrated from the metadata endpoint (seconds).
const REFRESH_INTERVAL_SECS: u64 = 300;

/// Metadata page size.
const PAGE_SIZE: usize = 500;

/// Fetch active markets from the metadata REST endpoint, optionally filtered
/// to the configured event slugs. Orders by volume descending so the most
/// active markets hydrate first.
pub async fn fetch_markets(cfg: &FeedConfig) -> Result<Vec<MarketMeta>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let mut markets = Vec::new();
    let mut offset = 0usize;

    loop {
        let url = format!(
            "{}?active=true&closed=false&limit={}&offset={}&order=volume24hr&ascending=false",
            cfg.metadata_url, PAGE_SIZE, offset
        );

        let resp: serde_json::Value = client.get(&url).send().await?.json().await?;
        let items = match resp.as_array() {
            Some(a) => a.clone(),
            None => {
                return Err(AppError::Hydration(
                    "metadata response was not an array".to_string(),
                ))
            }
        };
        if items.is_empty() {
            break;
        }

        for item in &items {
            let Some(market) = parse_market_metadata(item) else {
                continue;
            };
            if !cfg.event_slugs.is_empty() {
                let event = market.event_slug.as_deref().unwrap_or("");
                let matched = cfg
                    .event_slugs
                    .iter()
                    .any(|s| event.starts_with(s.as_str()) || market.slug.starts_with(s.as_str()));
                if !matched {
                    continue;
                }
            }
            markets.push(market);
        }

        if items.len() < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    Ok(markets)
}

/// Parse one metadata object into a `MarketMeta`. Token ids and outcome
/// labels arrive as stringified JSON arrays; markets missing either are
/// structurally unusable and skipped.
pub fn parse_market_metadata(v: &serde_json::Value) -> Option<MarketMeta> {
    let id = v.get("conditionId")?.as_str()?.to_string();

    let token_ids: Vec<String> = serde_json::from_str(v.get("clobTokenIds")?.as_str()?).ok()?;
    let labels: Vec<String> = serde_json::from_str(v.get("outcomes")?.as_str()?).ok()?;
    if token_ids.is_empty() || token_ids.len() != labels.len() {
        return None;
    }

    let outcomes = labels
        .into_iter()
        .zip(token_ids)
        .enumerate()
        .map(|(i, (label, token_id))| OutcomeMeta {
            label,
            index: i as i64,
            token_id,
        })
        .collect();

    let slug = v
        .get("slug")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();

    let title = v
        .get("question")
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    let event_slug = v
        .get("events")
        .and_then(|e| e.as_array())
        .and_then(|a| a.first())
        .and_then(|e| e.get("slug"))
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());

    let end_date_iso = v
        .get("endDateIso")
        .and_then(|e| e.as_str())
        .map(|s| s.to_string());

    let total_volume = v
        .get("volume")
        .and_then(|vl| vl.as_f64().or_else(|| vl.as_str().and_then(|s| s.parse().ok())));

    Some(MarketMeta {
        id,
        slug,
        title,
        event_slug,
        outcomes,
        end_date_iso,
        total_volume,
    })
}

// ---------------------------------------------------------------------------
// Refresher
// ---------------------------------------------------------------------------

/// Background loop re-hydrating the catalog so newly created markets are
/// discovered and vanished ones dropped.
pub struct CatalogRefresher {
    cfg: FeedConfig,
    catalog: Arc<MarketCatalog>,
}

impl CatalogRefresher {
    pub fn new(cfg: FeedConfig, catalog: Arc<MarketCatalog>) -> Self {
        Self { cfg, catalog }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
        ticker.tick().await; // skip immediate first tick, bootstrap already ran

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                error!("catalog refresh failed: {e}");
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        let fresh = fetch_markets(&self.cfg).await?;

        let current: HashSet<String> = self.catalog.all_market_ids().into_iter().collect();
        let fresh_ids: HashSet<String> = fresh.iter().map(|m| m.id.clone()).collect();

        let mut removed = 0usize;
        for gone in current.difference(&fresh_ids) {
            self.catalog.remove_market(gone);
            removed += 1;
        }

        let mut added = 0usize;
        for market in fresh {
            if !current.contains(&market.id) {
                debug!(market_id = %market.id, slug = %market.slug, "catalog add");
                added += 1;
            }
            // Re-adding refreshes metadata (volume, end date) in place.
            self.catalog.add_market(market);
        }

        if added > 0 || removed > 0 {
            info!(
                added,
                removed,
                total = self.catalog.market_count(),
                "catalog refresh: +{added} -{removed}, {} tracked",
                self.catalog.market_count()
            );
        } else {
            debug!(total = self.catalog.market_count(), "catalog refresh: no changes");
        }
        if self.catalog.market_count() == 0 {
            warn!("catalog refresh left zero tracked markets");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stringified_token_and_outcome_arrays() {
        let v = json!({
            "conditionId": "0xc0ffee",
            "clobTokenIds": "[\"tok-yes\",\"tok-no\"]",
            "outcomes": "[\"Yes\",\"No\"]",
            "slug": "btc-100k",
            "question": "Will BTC hit $100k?",
            "events": [{"slug": "btc-milestones", "category": "crypto"}],
            "endDateIso": "2026-12-31",
            "volume": "123456.78"
        });
        let m = parse_market_metadata(&v).unwrap();
        assert_eq!(m.id, "0xc0ffee");
        assert_eq!(m.outcomes.len(), 2);
        assert_eq!(m.outcomes[1].label, "No");
        assert_eq!(m.outcomes[1].token_id, "tok-no");
        assert_eq!(m.event_slug.as_deref(), Some("btc-milestones"));
        assert_eq!(m.total_volume, Some(123456.78));
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let v = json!({
            "conditionId": "0x1",
            "clobTokenIds": "[\"a\",\"b\",\"c\"]",
            "outcomes": "[\"Yes\",\"No\"]",
        });
        assert!(parse_market_metadata(&v).is_none());
    }

    #[test]
    fn missing_condition_id_is_rejected() {
        let v = json!({
            "clobTokenIds": "[\"a\"]",
            "outcomes": "[\"Yes\"]",
        });
        assert!(parse_market_metadata(&v).is_none());
    }
}
