use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::{news_bucket_ms, news_lookback_ms};
use crate::llm::LanguageModel;
use crate::news::entity::{
    derive_entity, is_stopword, significant_tokens, EntityContext, NewsCategory,
};
use crate::news::provider::{Article, NewsProvider};
use crate::store::gateway::{Query, StoreGateway};
use crate::types::{NewsCacheRow, TradeRow, WindowType};
use crate::util::{clamp01, iso_to_ms, ms_to_iso, now_ms, slugify};

const HOUR_MS: i64 = 3_600_000;

/// Query length cap (provider limit).
const MAX_QUERY_CHARS: usize = 250;

/// Sources treated as high quality for the 10% source component.
const QUALITY_SOURCES: &[&str] = &[
    "reuters", "bloomberg", "associated press", "financial times", "wall street journal",
    "cnbc", "bbc", "the guardian", "new york times", "washington post", "axios", "politico",
    "coindesk", "the economist",
];

/// Aggregate news relevance for one movement: a 0..1 score plus the
/// headlines that carried it.
#[derive(Debug, Clone, Default)]
pub struct NewsSignal {
    pub score: f64,
    pub headlines: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

pub fn source_quality(source_name: &str) -> f64 {
    let lower = source_name.to_ascii_lowercase();
    if QUALITY_SOURCES.iter().any(|s| lower.contains(s)) {
        1.0
    } else {
        0.5
    }
}

/// An article must mention at least one entity term, and its text must not
/// reduce to stopwords alone.
pub fn article_passes_filter(article: &Article, terms: &[String]) -> bool {
    let text = format!("{} {}", article.title, article.description).to_ascii_lowercase();
    if !terms.iter().any(|t| text.contains(&t.to_ascii_lowercase())) {
        return false;
    }
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|w| !is_stopword(w))
}

/// 1.0 at (or after) the window end, decaying linearly to 0.05 across the
/// lookback.
pub fn recency_score(published_ms: i64, window_end_ms: i64, lookback_ms: i64) -> f64 {
    if published_ms >= window_end_ms {
        return 1.0;
    }
    let age = (window_end_ms - published_ms) as f64;
    let frac = (age / lookback_ms.max(1) as f64).min(1.0);
    1.0 - frac * 0.95
}

/// Per-article relevance:
/// `0.45·entityHits/terms + 0.35·recency + 0.10·sourceQuality +
///  0.10·queryKeywordHits/nKeywords`.
pub fn article_relevance(
    article: &Article,
    terms: &[String],
    keywords: &[String],
    window_end_ms: i64,
    lookback_ms: i64,
) -> f64 {
    let text = format!("{} {}", article.title, article.description).to_ascii_lowercase();

    let entity_hits = terms
        .iter()
        .filter(|t| text.contains(&t.to_ascii_lowercase()))
        .count();
    let entity_score = if terms.is_empty() {
        0.0
    } else {
        entity_hits as f64 / terms.len() as f64
    };

    let published_ms = iso_to_ms(&article.published_at).unwrap_or(0);
    let recency = recency_score(published_ms, window_end_ms, lookback_ms);

    let keyword_hits = keywords
        .iter()
        .filter(|k| text.contains(&k.to_ascii_lowercase()))
        .count();
    let keyword_score = if keywords.is_empty() {
        0.0
    } else {
        keyword_hits as f64 / keywords.len() as f64
    };

    0.45 * entity_score + 0.35 * recency + 0.10 * source_quality(&article.source_name)
        + 0.10 * keyword_score
}

/// Aggregate 0..1 score:
/// `0.35·avgTop5Relevance + 0.40·clamp(count/8) + 0.25·clamp(uniqueSources/4)`.
pub fn aggregate_score(relevances: &[f64], count: usize, unique_sources: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let mut sorted = relevances.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top: Vec<f64> = sorted.into_iter().take(5).collect();
    let avg_top = if top.is_empty() {
        0.0
    } else {
        top.iter().sum::<f64>() / top.len() as f64
    };
    0.35 * avg_top + 0.40 * clamp01(count as f64 / 8.0) + 0.25 * clamp01(unique_sources as f64 / 4.0)
}

/// Fallback query: title minus stopwords, merged with the top entity
/// terms, capped at the provider limit.
pub fn build_fallback_query(title: &str, terms: &[String]) -> String {
    let mut parts: Vec<String> = significant_tokens(title, 6);
    for term in terms.iter().take(3) {
        if !parts.iter().any(|p| p.eq_ignore_ascii_case(term)) {
            parts.push(term.clone());
        }
    }
    let mut query = parts.join(" ");
    query.truncate(MAX_QUERY_CHARS);
    query
}

fn score_articles(
    articles: &[Article],
    terms: &[String],
    keywords: &[String],
    window_end_ms: i64,
    lookback_ms: i64,
) -> NewsSignal {
    let kept: Vec<&Article> = articles
        .iter()
        .filter(|a| article_passes_filter(a, terms))
        .collect();
    if kept.is_empty() {
        return NewsSignal::default();
    }

    let mut scored: Vec<(f64, &Article)> = kept
        .iter()
        .map(|a| (article_relevance(a, terms, keywords, window_end_ms, lookback_ms), *a))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let relevances: Vec<f64> = scored.iter().map(|(r, _)| *r).collect();
    let unique_sources = scored
        .iter()
        .map(|(_, a)| a.source_name.to_ascii_lowercase())
        .collect::<std::collections::HashSet<_>>()
        .len();

    NewsSignal {
        score: clamp01(aggregate_score(&relevances, scored.len(), unique_sources)),
        headlines: scored.iter().take(5).map(|(_, a)| a.title.clone()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Entity-grounded news relevance with per-(entity, bucket) provider-call
/// dedup through the `news_cache` table. Every failure path degrades to a
/// zero signal; the engine never fails a caller.
pub struct NewsEngine {
    store: Arc<StoreGateway>,
    provider: Option<NewsProvider>,
    llm: Option<Arc<dyn LanguageModel>>,
    /// title → (entity, cached_at), hourly.
    entity_cache: DashMap<String, (EntityContext, i64)>,
    /// title → (keywords, cached_at), hourly.
    keyword_cache: DashMap<String, (Vec<String>, i64)>,
}

impl NewsEngine {
    pub fn new(
        store: Arc<StoreGateway>,
        provider: Option<NewsProvider>,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            store,
            provider,
            llm,
            entity_cache: DashMap::new(),
            keyword_cache: DashMap::new(),
        }
    }

    /// Relevance for a movement on `market_id` with the given window.
    pub async fn relevance(
        &self,
        market_id: &str,
        window: WindowType,
        window_end_ms: i64,
    ) -> NewsSignal {
        // 1. Resolve slug and title from the newest trade.
        let Some((title, slug)) = self.resolve_title(market_id).await else {
            return NewsSignal::default();
        };

        // 2. Entity context: deterministic vocabularies, then LLM fallback.
        let Some(entity) = self.entity_context(&title, &slug).await else {
            debug!(market_id, "no entity context, news score 0");
            return NewsSignal::default();
        };

        // 3. Search window keyed to the detection window.
        let lookback_ms = news_lookback_ms(window);
        let bucket_ms = news_bucket_ms(window);
        let bucket = window_end_ms / bucket_ms;

        // 4. Cache probe.
        let cache_slug = format!("{}__{}", slugify(&entity.canonical), window.as_str());
        let keywords = self.keywords(&title, &entity).await;
        if let Some(articles) = self.cached_articles(&cache_slug, bucket).await {
            return score_articles(&articles, &entity.terms, &keywords, window_end_ms, lookback_ms);
        }

        // 5–6. Build the query and hit the provider.
        let Some(provider) = &self.provider else {
            return NewsSignal::default();
        };
        let query = if keywords.is_empty() {
            build_fallback_query(&title, &entity.terms)
        } else {
            let mut q = keywords.join(" OR ");
            q.truncate(MAX_QUERY_CHARS);
            q
        };
        if query.is_empty() {
            return NewsSignal::default();
        }

        let from = ms_to_iso(window_end_ms - lookback_ms);
        let to = ms_to_iso(window_end_ms);
        let articles = match provider.everything(&query, &from, &to).await {
            Ok(a) => a,
            Err(e) => {
                warn!(market_id, "news query failed, degrading to 0: {e}");
                return NewsSignal::default();
            }
        };

        // 10. Cache write-back, even for empty results.
        let row = NewsCacheRow {
            cache_slug: cache_slug.clone(),
            bucket,
            articles: serde_json::to_value(&articles).unwrap_or(serde_json::Value::Null),
            article_count: articles.len() as i64,
            query,
            fetched_at: ms_to_iso(now_ms()),
        };
        if let Err(e) = self
            .store
            .upsert("news_cache", std::slice::from_ref(&row), "cache_slug,bucket")
            .await
        {
            warn!("news cache write failed: {e}");
        }

        // 7–9. Filter, score, aggregate.
        score_articles(&articles, &entity.terms, &keywords, window_end_ms, lookback_ms)
    }

    async fn resolve_title(&self, market_id: &str) -> Option<(String, String)> {
        let rows: Vec<TradeRow> = self
            .store
            .fetch_as(
                "trades",
                &Query::new()
                    .eq("market_id", market_id)
                    .order_desc("ts")
                    .limit(1),
            )
            .await
            .ok()?;
        let row = rows.into_iter().next()?;
        let title = row.title.unwrap_or_default();
        let slug = row.slug.or(row.event_slug).unwrap_or_default();
        if title.is_empty() && slug.is_empty() {
            return None;
        }
        Some((title, slug))
    }

    async fn entity_context(&self, title: &str, slug: &str) -> Option<EntityContext> {
        if let Some(entity) = derive_entity(title, slug) {
            return Some(entity);
        }

        let now = now_ms();
        if let Some(cached) = self.entity_cache.get(title) {
            let (entity, at) = cached.value();
            if now - at < HOUR_MS {
                return Some(entity.clone());
            }
        }

        let llm = self.llm.as_ref()?;
        match llm.extract_entity(title).await {
            Ok(e) => {
                let mut terms = e.terms;
                terms.truncate(5);
                if terms.is_empty() {
                    terms.push(e.entity.to_ascii_lowercase());
                }
                let entity = EntityContext {
                    canonical: e.entity,
                    category: NewsCategory::parse(&e.category),
                    terms,
                };
                self.entity_cache
                    .insert(title.to_string(), (entity.clone(), now));
                Some(entity)
            }
            Err(e) => {
                debug!("llm entity extraction failed: {e}");
                None
            }
        }
    }

    async fn keywords(&self, title: &str, _entity: &EntityContext) -> Vec<String> {
        let now = now_ms();
        if let Some(cached) = self.keyword_cache.get(title) {
            let (words, at) = cached.value();
            if now - at < HOUR_MS {
                return words.clone();
            }
        }
        let Some(llm) = self.llm.as_ref() else {
            return Vec::new();
        };
        match llm.search_keywords(title).await {
            Ok(words) => {
                self.keyword_cache
                    .insert(title.to_string(), (words.clone(), now));
                words
            }
            Err(e) => {
                debug!("llm keyword extraction failed: {e}");
                Vec::new()
            }
        }
    }

    async fn cached_articles(&self, cache_slug: &str, bucket: i64) -> Option<Vec<Article>> {
        let rows: Vec<NewsCacheRow> = self
            .store
            .fetch_as(
                "news_cache",
                &Query::new()
                    .eq("cache_slug", cache_slug)
                    .eq("bucket", bucket)
                    .limit(1),
            )
            .await
            .ok()?;
        let row = rows.into_iter().next()?;
        serde_json::from_value(row.articles).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(title: &str, desc: &str, source: &str, published_at: &str) -> Article {
        Article {
            title: title.to_string(),
            description: desc.to_string(),
            url: "https://example.com".to_string(),
            source_name: source.to_string(),
            published_at: published_at.to_string(),
        }
    }

    fn terms() -> Vec<String> {
        vec!["bitcoin".to_string(), "btc".to_string()]
    }

    #[test]
    fn filter_requires_an_entity_term() {
        let a = article("Bitcoin rallies", "Spot flows", "Reuters", "");
        assert!(article_passes_filter(&a, &terms()));

        let b = article("Stocks mixed at open", "Quiet day", "Reuters", "");
        assert!(!article_passes_filter(&b, &terms()));
    }

    #[test]
    fn pure_stopword_text_is_rejected() {
        let a = article("will the", "of btc the a an", "X", "");
        // Contains "btc", and "btc" itself is not a stopword → passes.
        assert!(article_passes_filter(&a, &terms()));
        let b = article("will the", "of the a an", "X", "");
        assert!(!article_passes_filter(&b, &terms()));
    }

    #[test]
    fn recency_is_one_after_window_and_decays_to_floor() {
        let end = 1_000_000_000;
        let lookback = 3_600_000;
        assert_eq!(recency_score(end + 1, end, lookback), 1.0);
        assert_eq!(recency_score(end, end, lookback), 1.0);
        let half = recency_score(end - lookback / 2, end, lookback);
        assert!((half - 0.525).abs() < 1e-9);
        let floor = recency_score(end - 2 * lookback, end, lookback);
        assert!((floor - 0.05).abs() < 1e-9);
    }

    #[test]
    fn relevance_weights_sum_as_specified() {
        let end = iso_to_ms("2026-08-01T12:00:00Z").unwrap();
        let a = article(
            "Bitcoin BTC surges",
            "bitcoin btc everywhere",
            "Reuters",
            "2026-08-01T12:00:00Z",
        );
        let keywords = vec!["surges".to_string()];
        let r = article_relevance(&a, &terms(), &keywords, end, 3_600_000);
        // all components max: 0.45 + 0.35 + 0.10 + 0.10
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_rewards_count_and_source_diversity() {
        assert_eq!(aggregate_score(&[], 0, 0), 0.0);
        let one = aggregate_score(&[1.0], 1, 1);
        // 0.35·1 + 0.40·(1/8) + 0.25·(1/4)
        assert!((one - 0.4625).abs() < 1e-9);
        let many = aggregate_score(&[1.0; 10], 10, 5);
        assert!((many - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_query_merges_title_and_terms_capped() {
        let q = build_fallback_query(
            "Will Bitcoin close above $120k before September",
            &terms(),
        );
        assert!(q.contains("Bitcoin"));
        assert!(q.contains("120k"));
        assert!(q.len() <= MAX_QUERY_CHARS);
        // "Will" and "before" are stopwords.
        assert!(!q.contains("Will "));
    }

    #[test]
    fn scoring_uses_only_filtered_articles() {
        let end = iso_to_ms("2026-08-01T12:00:00Z").unwrap();
        let articles = vec![
            article("Bitcoin up big", "btc rally", "Reuters", "2026-08-01T11:00:00Z"),
            article("Weather today", "sunny", "Local", "2026-08-01T11:00:00Z"),
        ];
        let signal = score_articles(&articles, &terms(), &[], end, 3_600_000);
        assert_eq!(signal.headlines.len(), 1);
        assert!(signal.score > 0.0);
    }
}
