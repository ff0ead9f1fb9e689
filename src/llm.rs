//! Seam for the external language model. The pipeline only ever asks for
//! three things (entity extraction, search keywords, and a narrative), and
//! every call is best-effort with a hard timeout. Failures degrade to
//! deterministic fallbacks upstream; they never block a score row.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{LlmConfig, LLM_EXPLAIN_TIMEOUT_SECS, LLM_TIMEOUT_SECS};
use crate::error::{AppError, Result};

/// Entity context extracted from a market title.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEntity {
    pub entity: String,
    pub category: String,
    #[serde(default)]
    pub terms: Vec<String>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `{entity, category, terms}` for a market title. Terms are bounded
    /// to 5 by the implementation.
    async fn extract_entity(&self, title: &str) -> Result<LlmEntity>;

    /// 3–5 news search keywords for a market title.
    async fn search_keywords(&self, title: &str) -> Result<Vec<String>>;

    /// Short narrative explanation for a movement summary.
    async fn explain_movement(&self, prompt: &str) -> Result<String>;
}

/// HTTP-backed implementation against a single JSON task endpoint.
pub struct HttpLlm {
    client: reqwest::Client,
    explain_client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpLlm {
    /// Returns None when no endpoint is configured; callers then use their
    /// deterministic fallbacks everywhere.
    pub fn from_config(cfg: &LlmConfig) -> Option<Self> {
        let url = cfg.api_url.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .ok()?;
        let explain_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_EXPLAIN_TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            client,
            explain_client,
            url,
            api_key: cfg.api_key.clone(),
        })
    }

    async fn call(&self, client: &reqwest::Client, task: &str, input: &str) -> Result<serde_json::Value> {
        let mut req = client
            .post(&self.url)
            .json(&serde_json::json!({ "task": task, "input": input }));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Llm(format!("{task} returned {}", resp.status())));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn extract_entity(&self, title: &str) -> Result<LlmEntity> {
        let v = self.call(&self.client, "entity", title).await?;
        let mut entity: LlmEntity = serde_json::from_value(v)?;
        entity.terms.truncate(5);
        Ok(entity)
    }

    async fn search_keywords(&self, title: &str) -> Result<Vec<String>> {
        let v = self.call(&self.client, "keywords", title).await?;
        let words: Vec<String> = serde_json::from_value(v)?;
        Ok(words.into_iter().take(5).collect())
    }

    async fn explain_movement(&self, prompt: &str) -> Result<String> {
        let v = self.call(&self.explain_client, "explain", prompt).await?;
        v.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Llm("explanation was not a string".to_string()))
    }
}
