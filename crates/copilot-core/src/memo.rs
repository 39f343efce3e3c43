//! Per-run response caches for the upstream clients.
//!
//! Identical requests within one run return the identical response, which
//! keeps repeated attempts of an unchanged task structurally stable and
//! saves upstream calls. Errors are never cached, and requests flagged
//! `bypass_cache` always reach the upstream client.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::trace;

use crate::error::AgentError;
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient};
use crate::search::{SearchClient, SearchHit, SearchRequest};

fn cache_key<T: Serialize + std::fmt::Debug>(request: &T) -> String {
    serde_json::to_string(request).unwrap_or_else(|_| format!("{request:?}"))
}

pub struct MemoizedLlm<C> {
    inner: C,
    cache: DashMap<String, CompletionResponse>,
}

impl<C> MemoizedLlm<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for MemoizedLlm<C> {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, AgentError> {
        if request.bypass_cache {
            return self.inner.complete(request).await;
        }
        let key = cache_key(request);
        if let Some(hit) = self.cache.get(&key).map(|entry| entry.value().clone()) {
            trace!("llm cache hit");
            return Ok(hit);
        }

        let response = self.inner.complete(request).await?;
        self.cache.insert(key, response.clone());
        Ok(response)
    }
}

pub struct MemoizedSearch<C> {
    inner: C,
    cache: DashMap<String, Vec<SearchHit>>,
}

impl<C> MemoizedSearch<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl<C: SearchClient> SearchClient for MemoizedSearch<C> {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AgentError> {
        let key = cache_key(request);
        if let Some(hit) = self.cache.get(&key).map(|entry| entry.value().clone()) {
            trace!("search cache hit");
            return Ok(hit);
        }

        let hits = self.inner.search(request).await?;
        self.cache.insert(key, hits.clone());
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLlm {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl LlmClient for CountingLlm {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(AgentError::upstream("flaky"));
            }
            Ok(CompletionResponse::new(format!("echo {}", request.prompt)))
        }
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            system: None,
            prompt: prompt.to_string(),
            model: "m".to_string(),
            temperature: 0.0,
            max_tokens: 16,
            bypass_cache: false,
        }
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache() {
        let memo = MemoizedLlm::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let first = memo.complete(&request("a")).await.unwrap();
        let second = memo.complete(&request("a")).await.unwrap();
        memo.complete(&request("b")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(memo.cached(), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let memo = MemoizedLlm::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        assert!(memo.complete(&request("a")).await.is_err());
        assert!(memo.complete(&request("a")).await.is_ok());
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncached_requests_always_reach_upstream() {
        let memo = MemoizedLlm::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        memo.complete(&request("a").uncached()).await.unwrap();
        memo.complete(&request("a").uncached()).await.unwrap();

        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(memo.cached(), 0);
    }
}
