use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{MarketMeta, OutcomeMeta};

/// Maps a venue token (asset) id back to its market and outcome.
#[derive(Debug, Clone)]
pub struct TokenRef {
    pub market_id: String,
    pub outcome: String,
    pub outcome_index: i64,
}

/// In-memory market metadata catalog shared across the pipeline.
/// Written by the hydration/refresh path, snapshotted by readers.
pub struct MarketCatalog {
    /// market_id → metadata
    markets: DashMap<String, MarketMeta>,
    /// asset_id → (market_id, outcome)
    token_to_market: DashMap<String, TokenRef>,
    /// event_slug → child market ids
    events: DashMap<String, Vec<String>>,
}

impl MarketCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            markets: DashMap::new(),
            token_to_market: DashMap::new(),
            events: DashMap::new(),
        })
    }

    pub fn add_market(&self, market: MarketMeta) {
        for outcome in &market.outcomes {
            self.token_to_market.insert(
                outcome.token_id.clone(),
                TokenRef {
                    market_id: market.id.clone(),
                    outcome: outcome.label.clone(),
                    outcome_index: outcome.index,
                },
            );
        }
        if let Some(event_slug) = &market.event_slug {
            let mut children = self.events.entry(event_slug.clone()).or_default();
            if !children.contains(&market.id) {
                children.push(market.id.clone());
            }
        }
        self.markets.insert(market.id.clone(), market);
    }

    pub fn add_markets(&self, markets: Vec<MarketMeta>) {
        for m in markets {
            self.add_market(m);
        }
    }

    pub fn remove_market(&self, market_id: &str) {
        if let Some((_, market)) = self.markets.remove(market_id) {
            for outcome in &market.outcomes {
                self.token_to_market.remove(&outcome.token_id);
            }
            if let Some(event_slug) = &market.event_slug {
                if let Some(mut children) = self.events.get_mut(event_slug) {
                    children.retain(|id| id != market_id);
                }
            }
        }
    }

    pub fn get_market(&self, market_id: &str) -> Option<MarketMeta> {
        self.markets.get(market_id).map(|m| m.clone())
    }

    pub fn token_ref(&self, asset_id: &str) -> Option<TokenRef> {
        self.token_to_market.get(asset_id).map(|r| r.clone())
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn all_market_ids(&self) -> Vec<String> {
        self.markets.iter().map(|e| e.key().clone()).collect()
    }

    /// Event slugs with at least `min_children` child markets.
    pub fn event_slugs(&self, min_children: usize) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.value().len() >= min_children)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn event_children(&self, event_slug: &str) -> Vec<String> {
        self.events
            .get(event_slug)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn event_for_market(&self, market_id: &str) -> Option<String> {
        self.markets.get(market_id).and_then(|m| m.event_slug.clone())
    }

    /// Token id for a labeled outcome on a market.
    pub fn token_for_outcome(&self, market_id: &str, outcome: &str) -> Option<String> {
        self.markets.get(market_id).and_then(|m| {
            m.outcomes
                .iter()
                .find(|o| o.label.eq_ignore_ascii_case(outcome))
                .map(|o| o.token_id.clone())
        })
    }

    /// Markets whose asset set should be hydrated for a set of slugs.
    pub fn market_ids_for_slug(&self, slug: &str) -> Vec<String> {
        self.markets
            .iter()
            .filter(|e| {
                e.value().slug == slug || e.value().event_slug.as_deref() == Some(slug)
            })
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for MarketCatalog {
    fn default() -> Self {
        Self {
            markets: DashMap::new(),
            token_to_market: DashMap::new(),
            events: DashMap::new(),
        }
    }
}

/// Convenience constructor used in tests across the crate.
#[cfg(test)]
pub fn market_meta(
    id: &str,
    slug: &str,
    title: &str,
    event_slug: Option<&str>,
    outcomes: &[(&str, &str)],
) -> MarketMeta {
    MarketMeta {
        id: id.to_string(),
        slug: slug.to_string(),
        title: title.to_string(),
        event_slug: event_slug.map(|s| s.to_string()),
        outcomes: outcomes
            .iter()
            .enumerate()
            .map(|(i, (label, token))| OutcomeMeta {
                label: label.to_string(),
                index: i as i64,
                token_id: token.to_string(),
            })
            .collect(),
        end_date_iso: None,
        total_volume: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lookup_resolves_market_and_outcome() {
        let catalog = MarketCatalog::new();
        catalog.add_market(market_meta(
            "m1",
            "btc-100k",
            "Will BTC hit $100k?",
            None,
            &[("Yes", "tok-yes"), ("No", "tok-no")],
        ));

        let r = catalog.token_ref("tok-no").unwrap();
        assert_eq!(r.market_id, "m1");
        assert_eq!(r.outcome, "No");
        assert_eq!(r.outcome_index, 1);
        assert!(catalog.token_ref("unknown").is_none());
    }

    #[test]
    fn event_children_track_adds_and_removes() {
        let catalog = MarketCatalog::new();
        catalog.add_market(market_meta("m1", "s1", "A", Some("election"), &[("Yes", "t1")]));
        catalog.add_market(market_meta("m2", "s2", "B", Some("election"), &[("Yes", "t2")]));

        assert_eq!(catalog.event_children("election").len(), 2);
        assert_eq!(catalog.event_slugs(2), vec!["election".to_string()]);

        catalog.remove_market("m1");
        assert_eq!(catalog.event_children("election").len(), 1);
        assert!(catalog.event_slugs(2).is_empty());
        assert!(catalog.token_ref("t1").is_none());
    }

    #[test]
    fn slug_resolution_matches_market_and_event_slug() {
        let catalog = MarketCatalog::new();
        catalog.add_market(market_meta("m1", "direct", "A", Some("umbrella"), &[("Yes", "t1")]));

        assert_eq!(catalog.market_ids_for_slug("direct"), vec!["m1".to_string()]);
        assert_eq!(catalog.market_ids_for_slug("umbrella"), vec!["m1".to_string()]);
        assert!(catalog.market_ids_for_slug("nope").is_empty());
    }
}
