use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::SearchConfig;
use crate::error::AgentError;
use crate::http::{classify_status, classify_transport, parse_retry_after};
use crate::{CopilotError, SecretValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<NaiveDate>,
    /// Provider relevance score, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl SearchHit {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            published_date: None,
            score: None,
        }
    }

    pub fn published(mut self, date: NaiveDate) -> Self {
        self.published_date = Some(date);
        self
    }

    pub fn scored(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AgentError>;
}

#[async_trait]
impl<T: SearchClient + ?Sized> SearchClient for Arc<T> {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AgentError> {
        (**self).search(request).await
    }
}

/// Tavily web search API client.
pub struct TavilySearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretValue,
}

impl TavilySearchClient {
    pub fn new(config: &SearchConfig, api_key: SecretValue) -> Result<Self, CopilotError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| {
                CopilotError::InvalidConfiguration(format!("search http client: {err}"))
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self, CopilotError> {
        let api_key = crate::require_env(&config.api_key_env)?;
        Self::new(config, api_key)
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    published_date: Option<String>,
}

#[async_trait]
impl SearchClient for TavilySearchClient {
    #[instrument(skip_all, fields(max_results = request.max_results))]
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AgentError> {
        let body = json!({
            "query": request.query,
            "max_results": request.max_results,
            "search_depth": "basic",
        });

        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| classify_transport("search", &err))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("search", status, retry_after, &text));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|err| AgentError::upstream(format!("search returned malformed JSON: {err}")))?;

        let hits: Vec<SearchHit> = parsed
            .results
            .into_iter()
            .map(|result| SearchHit {
                title: result.title,
                url: result.url,
                snippet: result.content,
                published_date: result.published_date.as_deref().and_then(parse_published_date),
                score: result.score,
            })
            .collect();
        debug!(hits = hits.len(), "search completed");
        Ok(hits)
    }
}

/// Accepts RFC 3339, RFC 2822 and plain `YYYY-MM-DD` prefixes.
pub fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.date_naive());
    }
    raw.get(..10)
        .unwrap_or(raw)
        .parse::<NaiveDate>()
        .ok()
}
