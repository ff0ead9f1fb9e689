use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::{StoreConfig, STORE_TIMEOUT_SECS};

/// Store failures collapse to the three cases callers act on: retry,
/// give up, or treat as already-done.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("permanent store error: {0}")]
    Permanent(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Query builder
// ---------------------------------------------------------------------------

/// Builds the PostgREST-style query string for a table read or patch:
/// `?market_id=eq.X&ts=gte.2026-01-01T00:00:00Z&order=ts.asc&limit=500`.
#[derive(Debug, Default, Clone)]
pub struct Query {
    params: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, col: &str, val: impl std::fmt::Display) -> Self {
        self.params.push((col.to_string(), format!("eq.{val}")));
        self
    }

    pub fn gt(mut self, col: &str, val: impl std::fmt::Display) -> Self {
        self.params.push((col.to_string(), format!("gt.{val}")));
        self
    }

    pub fn gte(mut self, col: &str, val: impl std::fmt::Display) -> Self {
        self.params.push((col.to_string(), format!("gte.{val}")));
        self
    }

    pub fn lt(mut self, col: &str, val: impl std::fmt::Display) -> Self {
        self.params.push((col.to_string(), format!("lt.{val}")));
        self
    }

    pub fn lte(mut self, col: &str, val: impl std::fmt::Display) -> Self {
        self.params.push((col.to_string(), format!("lte.{val}")));
        self
    }

    pub fn in_list<I, S>(mut self, col: &str, vals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: std::fmt::Display,
    {
        let joined = vals
            .into_iter()
            .map(|v| format!("\"{v}\""))
            .collect::<Vec<_>>()
            .join(",");
        self.params.push((col.to_string(), format!("in.({joined})")));
        self
    }

    pub fn select(mut self, cols: &str) -> Self {
        self.params.push(("select".to_string(), cols.to_string()));
        self
    }

    pub fn order_asc(mut self, col: &str) -> Self {
        self.params.push(("order".to_string(), format!("{col}.asc")));
        self
    }

    pub fn order_desc(mut self, col: &str) -> Self {
        self.params.push(("order".to_string(), format!("{col}.desc")));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.params.push(("limit".to_string(), n.to_string()));
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Thin adapter over the external REST table store. Every other component
/// persists and reads through this; no implicit caching.
pub struct StoreGateway {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl StoreGateway {
    pub fn new(cfg: &StoreConfig) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(STORE_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            service_key: cfg.service_key.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", &self.service_key))
    }

    /// Fetch rows matching a query as raw JSON values.
    pub async fn fetch(&self, table: &str, query: &Query) -> StoreResult<Vec<serde_json::Value>> {
        let req = self
            .authed(self.client.get(self.table_url(table)))
            .query(query.params());

        let resp = req.send().await.map_err(classify_reqwest)?;
        let resp = check_status(resp).await?;
        resp.json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| StoreError::Permanent(format!("decode {table}: {e}")))
    }

    /// Fetch rows matching a query, deserialized to `T`. Rows that fail to
    /// deserialize are skipped; a malformed row must not halt the pipeline.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query,
    ) -> StoreResult<Vec<T>> {
        let raw = self.fetch(table, query).await?;
        let mut out = Vec::with_capacity(raw.len());
        for v in raw {
            match serde_json::from_value::<T>(v) {
                Ok(row) => out.push(row),
                Err(e) => debug!("skipping malformed {table} row: {e}"),
            }
        }
        Ok(out)
    }

    /// Batch insert. A duplicate key anywhere in the batch surfaces as
    /// `StoreError::Duplicate` so the caller can fall back to row-by-row.
    pub async fn insert<T: Serialize>(&self, table: &str, rows: &[T]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let req = self
            .authed(self.client.post(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .json(rows);
        let resp = req.send().await.map_err(classify_reqwest)?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn insert_one<T: Serialize>(&self, table: &str, row: &T) -> StoreResult<()> {
        self.insert(table, std::slice::from_ref(row)).await
    }

    /// Upsert with conflict columns (`on_conflict`), merging duplicates.
    pub async fn upsert<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
        on_conflict: &str,
    ) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let req = self
            .authed(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(rows);
        let resp = req.send().await.map_err(classify_reqwest)?;
        check_status(resp).await?;
        Ok(())
    }

    /// Patch rows matching a predicate with a partial JSON object.
    pub async fn patch(
        &self,
        table: &str,
        query: &Query,
        fields: &serde_json::Value,
    ) -> StoreResult<()> {
        let req = self
            .authed(self.client.patch(self.table_url(table)))
            .query(query.params())
            .header("Prefer", "return=minimal")
            .json(fields);
        let resp = req.send().await.map_err(classify_reqwest)?;
        check_status(resp).await?;
        Ok(())
    }
}

fn classify_reqwest(e: reqwest::Error) -> StoreError {
    // Network-level failures (connect, timeout, reset) are worth retrying.
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Permanent(e.to_string())
    }
}

/// Classify an HTTP response status + body into the store error taxonomy.
pub fn classify_response(status: u16, body: &str) -> Option<StoreError> {
    if status < 400 {
        return None;
    }
    if body.contains("duplicate key value violates unique constraint") || status == 409 {
        return Some(StoreError::Duplicate(truncate(body, 200)));
    }
    if status == 429 || status >= 500 {
        return Some(StoreError::Transient(format!("{status}: {}", truncate(body, 200))));
    }
    Some(StoreError::Permanent(format!("{status}: {}", truncate(body, 200))))
}

async fn check_status(resp: reqwest::Response) -> StoreResult<reqwest::Response> {
    let status = resp.status().as_u16();
    if status < 400 {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_response(status, &body)
        .unwrap_or_else(|| StoreError::Permanent(format!("{status}"))))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}…", &s[..max])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builds_postgrest_predicates() {
        let q = Query::new()
            .eq("market_id", "m1")
            .gte("ts", "2026-01-01T00:00:00Z")
            .order_desc("ts")
            .limit(500);
        assert_eq!(
            q.params(),
            &[
                ("market_id".to_string(), "eq.m1".to_string()),
                ("ts".to_string(), "gte.2026-01-01T00:00:00Z".to_string()),
                ("order".to_string(), "ts.desc".to_string()),
                ("limit".to_string(), "500".to_string()),
            ]
        );
    }

    #[test]
    fn in_list_quotes_values() {
        let q = Query::new().in_list("id", ["a", "b"]);
        assert_eq!(q.params()[0].1, "in.(\"a\",\"b\")");
    }

    #[test]
    fn duplicate_key_body_classifies_as_duplicate() {
        let e = classify_response(
            400,
            "ERROR: duplicate key value violates unique constraint \"trades_pkey\"",
        )
        .unwrap();
        assert!(e.is_duplicate());
    }

    #[test]
    fn conflict_status_classifies_as_duplicate() {
        assert!(classify_response(409, "conflict").unwrap().is_duplicate());
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_permanent() {
        assert!(classify_response(503, "unavailable").unwrap().is_transient());
        assert!(classify_response(429, "slow down").unwrap().is_transient());
        assert!(matches!(
            classify_response(400, "schema mismatch"),
            Some(StoreError::Permanent(_))
        ));
        assert!(classify_response(200, "").is_none());
    }
}
