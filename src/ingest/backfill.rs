use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::config::{BackfillConfig, FeedConfig};
use crate::error::Result;
use crate::ingest::normalize::normalize_trade;
use crate::state::MarketCatalog;
use crate::store::trade_buffer::TradeBufferHandle;
use crate::util::{ms_to_iso, now_ms};

/// Periodic gap-fill from the venue's historical trades endpoint. Only runs
/// when the live feed has been silent for a while; the dedupe cache and the
/// store's unique key make overlap with live delivery harmless.
pub struct BackfillWorker {
    cfg: BackfillConfig,
    feed: FeedConfig,
    catalog: Arc<MarketCatalog>,
    buffer: TradeBufferHandle,
    health: Arc<HealthState>,
}

impl BackfillWorker {
    pub fn new(
        cfg: BackfillConfig,
        feed: FeedConfig,
        catalog: Arc<MarketCatalog>,
        buffer: TradeBufferHandle,
        health: Arc<HealthState>,
    ) -> Self {
        Self { cfg, feed, catalog, buffer, health }
    }

    pub async fn run(self) {
        let Some(url) = self.feed.backfill_url.clone() else {
            return;
        };
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("backfill: failed to build HTTP client: {e}");
                return;
            }
        };

        let mut ticker = interval(Duration::from_millis(self.cfg.interval_ms));
        ticker.tick().await; // consume immediate first tick

        loop {
            ticker.tick().await;

            let last_trade = self.health.last_trade_at_ms();
            let silent_ms = now_ms() - last_trade;
            if last_trade > 0 && silent_ms < self.cfg.silence_ms {
                debug!(silent_ms, "backfill skipped: feed is live");
                continue;
            }

            for slug in self.slugs() {
                if let Err(e) = self.backfill_slug(&client, &url, &slug).await {
                    warn!(slug = %slug, "backfill failed: {e}");
                }
            }
        }
    }

    fn slugs(&self) -> Vec<String> {
        if !self.feed.event_slugs.is_empty() {
            return self.feed.event_slugs.clone();
        }
        self.catalog.event_slugs(1)
    }

    async fn backfill_slug(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        slug: &str,
    ) -> Result<()> {
        let from = ms_to_iso(now_ms() - self.cfg.lookback_ms);
        let url = format!("{base_url}?slug={slug}&from={from}&limit={}", self.cfg.max_trades_per_slug);
        let items: Vec<serde_json::Value> = client.get(&url).send().await?.json().await?;

        let mut submitted = 0usize;
        for item in items.iter().take(self.cfg.max_trades_per_slug) {
            let Some(asset_id) = item.get("asset").and_then(|a| a.as_str()) else {
                continue;
            };
            let Some(token) = self.catalog.token_ref(asset_id) else {
                continue;
            };
            let Some(market) = self.catalog.get_market(&token.market_id) else {
                continue;
            };

            let price = item
                .get("price")
                .and_then(|p| p.as_f64().or_else(|| p.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(0.0);
            let size = item
                .get("size")
                .and_then(|s| s.as_f64().or_else(|| s.as_str().and_then(|x| x.parse().ok())))
                .unwrap_or(0.0);
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
                self.buffer.submit(trade);
                submitted += 1;
            }
        }

        if submitted > 0 {
            info!(slug = %slug, submitted, "backfill submitted {submitted} trades");
        }
        Ok(())
    }
}
