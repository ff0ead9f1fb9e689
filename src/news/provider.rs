use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{NewsConfig, NEWS_TIMEOUT_SECS};
use crate::error::Result;

/// One article as returned by the provider, trimmed to the fields the
/// relevance engine scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub source_name: String,
    /// ISO publish timestamp.
    #[serde(default)]
    pub published_at: String,
}

/// Thin client for the news provider's `/everything` search.
pub struct NewsProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NewsProvider {
    /// None when no API key is configured; news scoring then degrades to 0.
    pub fn from_config(cfg: &NewsConfig) -> Option<Self> {
        let api_key = cfg.api_key.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(NEWS_TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub async fn everything(&self, query: &str, from_iso: &str, to_iso: &str) -> Result<Vec<Article>> {
        let url = format!("{}/everything", self.base_url);
        let resp: serde_json::Value = self
            .client
            .get(&url)
            .query(&[
                ("q", query),
                ("from", from_iso),
                ("to", to_iso),
                ("sortBy", "publishedAt"),
                ("language", "en"),
                ("pageSize", "30"),
            ])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .json()
            .await?;

        let articles = resp
            .get("articles")
            .and_then(|a| a.as_array())
            .map(|items| items.iter().filter_map(parse_article).collect::<Vec<_>>())
            .unwrap_or_default();
        debug!(count = articles.len(), query, "news provider query");
        Ok(articles)
    }
}

fn parse_article(v: &serde_json::Value) -> Option<Article> {
    let title = v.get("title")?.as_str()?.to_string();
    Some(Article {
        title,
        description: v
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("")
            .to_string(),
        url: v.get("url").and_then(|u| u.as_str()).unwrap_or("").to_string(),
        source_name: v
            .get("source")
            .and_then(|s| s.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("")
            .to_string(),
        published_at: v
            .get("publishedAt")
            .and_then(|p| p.as_str())
            .unwrap_or("")
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_provider_article_shape() {
        let v = json!({
            "title": "Bitcoin surges past $120k",
            "description": "Spot ETFs drove the rally.",
            "url": "https://example.com/btc",
            "source": {"id": null, "name": "Reuters"},
            "publishedAt": "2026-08-01T10:00:00Z"
        });
        let a = parse_article(&v).unwrap();
        assert_eq!(a.source_name, "Reuters");
        assert_eq!(a.published_at, "2026-08-01T10:00:00Z");
    }

    #[test]
    fn untitled_articles_are_skipped() {
        assert!(parse_article(&json!({"description": "no title"})).is_none());
    }
}
