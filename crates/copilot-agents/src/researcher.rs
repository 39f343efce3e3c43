use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use copilot_core::{
    Agent, AgentError, AgentKind, AgentResult, Citation, Figure, Payload, SearchClient,
    SearchHit, SearchRequest, SharedContext, Task,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::prompt;

const RELEVANCE_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;
const SNIPPET_CHARS: usize = 300;

static REVENUE_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(revenue|revenues|sales|turnover|earn|earns|earnings)\b")
        .expect("invalid revenue context regex")
});

static MARKET_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(market|industry|sector|nationwide|national|global|worldwide)\b")
        .expect("invalid market context regex")
});

/// Amounts at or above this are market sizes, never one shop's revenue.
const MARKET_SCALE: f64 = 1e9;

static MONEY_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([$€£₹])\s?(\d[\d,]*(?:\.\d+)?)\s*(k|thousand|m|mn|million|b|bn|billion)?\b")
        .expect("invalid money amount regex")
});

/// Web research over a [`SearchClient`]: one search, then deduplicated and
/// ranked citations plus any revenue claims found in the snippets.
pub struct WebResearchAgent {
    search: Arc<dyn SearchClient>,
    max_results: usize,
    reference_date: Option<NaiveDate>,
}

impl WebResearchAgent {
    pub fn new(search: Arc<dyn SearchClient>, max_results: usize) -> Self {
        Self {
            search,
            max_results: max_results.max(1),
            reference_date: None,
        }
    }

    /// Pin "today" for recency scoring.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }
}

#[async_trait]
impl Agent for WebResearchAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Research
    }

    #[instrument(name = "agent.research", skip(self, task, context), fields(attempt = task.attempt()))]
    async fn run(&self, task: &Task, context: &SharedContext) -> Result<AgentResult, AgentError> {
        if task.query().trim().is_empty() {
            return Err(AgentError::invalid_input("research needs a non-empty query"));
        }

        let query = prompt::research_query(task, context.profile());
        info!(%query, "searching the web");
        let hits = self
            .search
            .search(&SearchRequest::new(query.clone(), self.max_results))
            .await?;
        let raw_hits = hits.len();

        let citations = rank_citations(dedupe_hits(hits), self.today());
        debug!(raw_hits, kept = citations.len(), "ranked search results");

        if citations.is_empty() {
            let payload = Payload {
                summary: format!("No web sources were found for \"{}\".", task.query().trim()),
                details: json!({ "search_query": query, "hits": raw_hits }),
                ..Payload::default()
            };
            return Ok(AgentResult::partial(
                payload,
                Some(0.0),
                AgentError::upstream("search returned no usable results"),
            ));
        }

        let claims = revenue_claims(&citations);
        let mut figures = Vec::new();
        if let Some(revenue) = claims.business {
            figures.push(
                Figure::new("revenue", revenue)
                    .with_unit(claims.currency.clone())
                    .with_label("Revenue of comparable businesses reported by web sources (median)"),
            );
        }
        if let Some(market) = claims.market {
            figures.push(
                Figure::new("market_revenue", market)
                    .with_unit(claims.currency.clone())
                    .with_label("Market revenue reported by web sources (median)"),
            );
        }

        let confidence = confidence(&citations, self.today());
        let payload = Payload {
            summary: summarize(task.query(), &citations),
            figures,
            details: json!({
                "search_query": query,
                "hits": raw_hits,
                "deduplicated": citations.len(),
            }),
            citations,
            ..Payload::default()
        };

        Ok(AgentResult::ok(payload, Some(confidence)))
    }
}

/// Lower-cased URL without scheme, `www.`, fragment or trailing slash.
pub fn normalize_url(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    let without_fragment = without_www.split('#').next().unwrap_or(without_www);
    without_fragment.trim_end_matches('/').to_string()
}

/// Keep the first occurrence of every URL, dropping hits without one.
fn dedupe_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| !hit.url.trim().is_empty())
        .filter(|hit| seen.insert(normalize_url(&hit.url)))
        .collect()
}

fn recency(published: Option<NaiveDate>, today: NaiveDate) -> f64 {
    match published {
        Some(date) => {
            let age_days = (today - date).num_days().max(0) as f64;
            1.0 / (1.0 + age_days / 365.0)
        }
        None => 0.0,
    }
}

fn rank_citations(hits: Vec<SearchHit>, today: NaiveDate) -> Vec<Citation> {
    let mut citations: Vec<Citation> = hits
        .into_iter()
        .enumerate()
        .map(|(idx, hit)| {
            let relevance = hit
                .score
                .map(|score| score.clamp(0.0, 1.0))
                .unwrap_or_else(|| 1.0 / (1.0 + idx as f64));
            let rank = RELEVANCE_WEIGHT * relevance
                + RECENCY_WEIGHT * recency(hit.published_date, today);
            let title = if hit.title.trim().is_empty() {
                hit.url.clone()
            } else {
                hit.title.trim().to_string()
            };
            Citation {
                title,
                url: hit.url,
                snippet: truncate(&hit.snippet, SNIPPET_CHARS),
                published_date: hit.published_date,
                relevance: rank,
            }
        })
        .collect();
    // stable sort keeps provider order on equal rank
    citations.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    citations
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn parse_amount(number: &str, scale: Option<&str>) -> Option<f64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    let multiplier = match scale.map(str::to_lowercase).as_deref() {
        Some("k") | Some("thousand") => 1e3,
        Some("m") | Some("mn") | Some("million") => 1e6,
        Some("b") | Some("bn") | Some("billion") => 1e9,
        _ => 1.0,
    };
    Some(value * multiplier)
}

/// Medians of the monetary amounts quoted in revenue sentences, with the
/// currency symbol of the first claim.
#[derive(Debug, Default, PartialEq)]
struct RevenueClaims {
    business: Option<f64>,
    market: Option<f64>,
    currency: String,
}

/// Sentences about a market or industry, and billion-scale amounts, count as
/// market revenue; everything else as revenue of a comparable business.
fn revenue_claims(citations: &[Citation]) -> RevenueClaims {
    let mut business = Vec::new();
    let mut market = Vec::new();
    let mut currency = None;

    for citation in citations {
        for sentence in citation.snippet.split(". ") {
            if !REVENUE_CONTEXT.is_match(sentence) {
                continue;
            }
            let market_sentence = MARKET_CONTEXT.is_match(sentence);
            for caps in MONEY_AMOUNT.captures_iter(sentence) {
                let scale = caps.get(3).map(|m| m.as_str());
                let Some(amount) = parse_amount(&caps[2], scale) else {
                    continue;
                };
                currency.get_or_insert_with(|| caps[1].to_string());
                if market_sentence || amount >= MARKET_SCALE {
                    market.push(amount);
                } else {
                    business.push(amount);
                }
            }
        }
    }

    RevenueClaims {
        business: median(business),
        market: median(market),
        currency: currency.unwrap_or_default(),
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn first_sentence(text: &str) -> &str {
    text.split(". ").next().unwrap_or(text).trim()
}

fn summarize(query: &str, citations: &[Citation]) -> String {
    let highlights: Vec<String> = citations
        .iter()
        .take(3)
        .map(|c| {
            let sentence = first_sentence(&c.snippet);
            if sentence.is_empty() {
                c.title.clone()
            } else {
                format!("{} ({})", sentence.trim_end_matches('.'), c.title)
            }
        })
        .collect();
    format!(
        "Found {} source(s) on \"{}\". Key findings: {}.",
        citations.len(),
        query.trim(),
        highlights.join("; ")
    )
}

/// Half from citation count (saturating at five), the rest from mean
/// recency and the share of citations carrying a snippet.
fn confidence(citations: &[Citation], today: NaiveDate) -> f64 {
    let count = citations.len() as f64;
    let coverage = (count / 5.0).min(1.0);
    let mean_recency = citations
        .iter()
        .map(|c| recency(c.published_date, today))
        .sum::<f64>()
        / count;
    let with_snippets = citations.iter().filter(|c| !c.snippet.is_empty()).count() as f64 / count;
    0.5 * coverage + 0.2 * mean_recency + 0.3 * with_snippets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSearch;
    use copilot_core::{BusinessProfile, ResultStatus};
    use std::collections::BTreeMap;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    fn context() -> SharedContext {
        SharedContext::new(
            "grow revenue",
            BusinessProfile::new("Coffee shop", "small", "Ohio"),
            None,
        )
    }

    fn task() -> Task {
        Task::new(AgentKind::Research, "grow revenue", BTreeMap::new())
    }

    #[test]
    fn urls_normalise_for_deduplication() {
        assert_eq!(
            normalize_url("https://www.Example.com/report/#top"),
            "example.com/report"
        );
        assert_eq!(normalize_url("http://example.com/report"), "example.com/report");
    }

    #[tokio::test]
    async fn dedupes_and_ranks_by_relevance_and_recency() {
        let search = Arc::new(FakeSearch::new(vec![
            SearchHit::new("Old but relevant", "https://a.com/x", "Coffee demand grows.")
                .scored(0.9)
                .published(date("2015-01-01")),
            SearchHit::new("Duplicate", "http://www.a.com/x/", "Same page again.").scored(1.0),
            SearchHit::new("Fresh", "https://b.com/y", "Cafes expand in Ohio.")
                .scored(0.9)
                .published(date("2024-06-01")),
        ]));
        let agent = WebResearchAgent::new(search.clone(), 5).with_reference_date(date("2024-06-01"));

        let result = agent.run(&task(), &context()).await.unwrap();
        let citations = &result.payload().citations;

        assert_eq!(result.status(), ResultStatus::Ok);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].title, "Fresh");
        assert!((citations[0].relevance - 0.93).abs() < 1e-9);
        assert_eq!(
            search.queries(),
            vec!["grow revenue Coffee shop Ohio market trends".to_string()]
        );
    }

    #[tokio::test]
    async fn extracts_median_revenue_claim() {
        let search = Arc::new(FakeSearch::new(vec![
            SearchHit::new("A", "https://a.com", "Typical cafes report revenue of $180,000. Rent is $2,000."),
            SearchHit::new("B", "https://b.com", "Average annual sales reach $250k for small shops."),
            SearchHit::new("C", "https://c.com", "Owners earn $200,000 a year in revenue."),
        ]));
        let agent = WebResearchAgent::new(search, 5);

        let result = agent.run(&task(), &context()).await.unwrap();
        let revenue = result.payload().figure("revenue").unwrap();

        assert_eq!(revenue.value, 200_000.0);
        assert_eq!(revenue.unit.as_deref(), Some("$"));
    }

    #[tokio::test]
    async fn market_sizes_are_kept_apart_from_business_revenue() {
        let search = Arc::new(FakeSearch::new(vec![
            SearchHit::new(
                "Market outlook",
                "https://a.com",
                "US coffee shop sales hit $45 billion last year. A typical cafe reports revenue of $190,000.",
            ),
            SearchHit::new(
                "Industry report",
                "https://b.com",
                "The Ohio cafe market generated revenue of $900 million.",
            ),
        ]));
        let agent = WebResearchAgent::new(search, 5);

        let result = agent.run(&task(), &context()).await.unwrap();
        let payload = result.payload();

        assert_eq!(payload.figure("revenue").unwrap().value, 190_000.0);
        let market = payload.figure("market_revenue").unwrap();
        assert_eq!(market.value, (45e9 + 900e6) / 2.0);
        assert_eq!(market.unit.as_deref(), Some("$"));
    }

    #[tokio::test]
    async fn market_only_claims_yield_no_business_revenue() {
        let search = Arc::new(FakeSearch::new(vec![SearchHit::new(
            "Global coffee",
            "https://a.com",
            "Global coffee sales reach $2.5bn in the region.",
        )]));
        let agent = WebResearchAgent::new(search, 5);

        let result = agent.run(&task(), &context()).await.unwrap();
        assert!(result.payload().figure("revenue").is_none());
        assert_eq!(result.payload().figure("market_revenue").unwrap().value, 2.5e9);
    }

    #[tokio::test]
    async fn zero_hits_is_partial() {
        let agent = WebResearchAgent::new(Arc::new(FakeSearch::new(Vec::new())), 5);
        let result = agent.run(&task(), &context()).await.unwrap();

        assert_eq!(result.status(), ResultStatus::Partial);
        assert!(result.payload().citations.is_empty());
        assert!(result.error().is_some());
    }

    #[tokio::test]
    async fn search_failures_propagate() {
        let search = FakeSearch::failing(AgentError::upstream("429").with_retry_after(
            std::time::Duration::from_secs(1),
        ));
        let agent = WebResearchAgent::new(Arc::new(search), 5);
        let err = agent.run(&task(), &context()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms, Some(1000));
    }
}
