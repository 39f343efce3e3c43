use async_trait::async_trait;
use copilot_core::{AgentResult, Critic, CritiqueVerdict, Rubric};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::prompt::{self, REVIEWER_SYSTEM};
use crate::LlmHandle;

/// Deterministic checklist critic.
#[derive(Debug, Clone, Copy, Default)]
pub struct RubricCritic;

#[async_trait]
impl Critic for RubricCritic {
    async fn critique(&self, result: &AgentResult, rubric: &Rubric) -> CritiqueVerdict {
        rubric.evaluate(result)
    }
}

/// Checklist first, then a model review of results that pass it.
///
/// A failed or unparseable review falls back to the checklist verdict, so
/// the model can only ever tighten the gate. Reviews bypass response caches
/// so repeated critiques of one result are independent samples.
pub struct LlmReviewCritic {
    llm: LlmHandle,
}

#[derive(Debug, Deserialize)]
struct ReviewVerdict {
    accepted: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    revision_hint: Option<String>,
}

impl LlmReviewCritic {
    pub fn new(llm: LlmHandle) -> Self {
        Self { llm: llm.fresh() }
    }
}

#[async_trait]
impl Critic for LlmReviewCritic {
    #[instrument(name = "critic.review", skip_all, fields(kind = %rubric.kind))]
    async fn critique(&self, result: &AgentResult, rubric: &Rubric) -> CritiqueVerdict {
        let checklist = rubric.evaluate(result);
        if !checklist.accepted {
            return checklist;
        }

        let raw = match self
            .llm
            .complete(REVIEWER_SYSTEM, prompt::review_prompt(result, rubric))
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "review call failed, using checklist verdict");
                return checklist;
            }
        };

        let Some(review) = prompt::extract_json_object(&raw)
            .and_then(|value| serde_json::from_value::<ReviewVerdict>(value).ok())
        else {
            warn!("review response was not valid JSON, using checklist verdict");
            return checklist;
        };
        debug!(accepted = review.accepted, "model review");

        if review.accepted {
            return checklist;
        }
        let reason = if review.reason.trim().is_empty() {
            "reviewer rejected the result".to_string()
        } else {
            format!("reviewer: {}", review.reason.trim())
        };
        let hint = review
            .revision_hint
            .filter(|hint| !hint.trim().is_empty())
            .unwrap_or_else(|| reason.clone());
        CritiqueVerdict::reject(reason, hint)
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLlm;
    use copilot_core::{AgentError, AgentKind, LlmConfig, MemoizedLlm, Payload, RubricCheck};
    use std::sync::Arc;

    fn rubric() -> Rubric {
        Rubric::new(AgentKind::Consult).with_check(RubricCheck::MinSummaryChars(10))
    }

    fn good() -> AgentResult {
        AgentResult::ok(Payload::with_summary("Raise prices on lattes."), Some(0.8))
    }

    #[tokio::test]
    async fn rubric_critic_is_deterministic() {
        let critic = RubricCritic;
        assert!(critic.is_deterministic());
        assert!(critic.critique(&good(), &rubric()).await.accepted);

        let short = AgentResult::ok(Payload::with_summary("Hm."), Some(0.8));
        let verdict = critic.critique(&short, &rubric()).await;
        assert!(!verdict.accepted);
        assert!(verdict.revision_hint.is_some());
    }

    #[tokio::test]
    async fn checklist_failures_skip_the_model() {
        let llm = FakeLlm::replying(r#"{"accepted": true}"#);
        let critic = LlmReviewCritic::new(llm.handle());
        let short = AgentResult::ok(Payload::with_summary("Hm."), None);

        assert!(!critic.critique(&short, &rubric()).await.accepted);
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn model_rejection_carries_its_hint() {
        let llm = FakeLlm::replying(
            r#"{"accepted": false, "reason": "too vague", "revision_hint": "Name a price."}"#,
        );
        let critic = LlmReviewCritic::new(llm.handle());

        let verdict = critic.critique(&good(), &rubric()).await;
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, "reviewer: too vague");
        assert_eq!(verdict.revision_hint.as_deref(), Some("Name a price."));
        assert!(!critic.is_deterministic());
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_checklist() {
        let critic = LlmReviewCritic::new(FakeLlm::failing(AgentError::timeout("slow")).handle());
        assert!(critic.critique(&good(), &rubric()).await.accepted);

        let garbled = LlmReviewCritic::new(FakeLlm::replying("looks fine to me").handle());
        assert!(garbled.critique(&good(), &rubric()).await.accepted);
    }

    #[tokio::test]
    async fn repeated_reviews_are_not_served_from_cache() {
        let upstream = FakeLlm::scripted(vec![
            Ok(r#"{"accepted": true, "reason": "specific"}"#.to_string()),
            Ok(r#"{"accepted": false, "reason": "changed my mind"}"#.to_string()),
        ]);
        let memoized = MemoizedLlm::new(upstream.clone());
        let critic = LlmReviewCritic::new(LlmHandle::new(Arc::new(memoized), LlmConfig::default()));

        let first = critic.critique(&good(), &rubric()).await;
        let second = critic.critique(&good(), &rubric()).await;

        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(upstream.prompts().len(), 2);
    }
}
