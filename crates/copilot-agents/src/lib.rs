//! Concrete agents and critics for the business copilot pipeline.

use std::sync::Arc;

use copilot_core::{
    AgentError, AgentSet, CompletionRequest, Config, Critic, LlmClient, LlmConfig, SearchClient,
};

mod analyst;
mod consultant;
mod critic;
mod planner;
pub mod prompt;
mod researcher;
pub mod sales;

pub use analyst::DataAnalystAgent;
pub use consultant::{ConsultantAgent, Opportunity, Risk, Strategy};
pub use critic::{LlmReviewCritic, RubricCritic};
pub use planner::PlannerAgent;
pub use researcher::{normalize_url, WebResearchAgent};

/// Language-model client bound to the configured model parameters.
#[derive(Clone)]
pub struct LlmHandle {
    client: Arc<dyn LlmClient>,
    config: LlmConfig,
    fresh: bool,
}

impl LlmHandle {
    pub fn new(client: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        Self {
            client,
            config,
            fresh: false,
        }
    }

    /// Every completion from this handle skips response caches.
    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }

    /// One completion. Blank answers count as upstream failures.
    pub async fn complete(&self, system: &str, prompt: String) -> Result<String, AgentError> {
        let mut request = CompletionRequest::from_config(&self.config, prompt).with_system(system);
        if self.fresh {
            request = request.uncached();
        }
        let response = self.client.complete(&request).await?;
        if response.text.trim().is_empty() {
            return Err(AgentError::upstream("language model returned an empty completion"));
        }
        Ok(response.text)
    }
}

/// Research, analysis, strategy and planning agents wired to shared clients.
pub fn standard_agents(
    config: &Config,
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchClient>,
) -> AgentSet {
    let handle = LlmHandle::new(llm, config.llm.clone());
    AgentSet::new()
        .with(Arc::new(WebResearchAgent::new(search, config.search.max_results)))
        .with(Arc::new(DataAnalystAgent::new(handle.clone())))
        .with(Arc::new(ConsultantAgent::new(handle.clone())))
        .with(Arc::new(PlannerAgent::new(handle)))
}

/// Checklist critic, or the model-backed reviewer when `critic.llm_review` is set.
pub fn standard_critic(config: &Config, llm: Arc<dyn LlmClient>) -> Arc<dyn Critic> {
    if config.critic.llm_review {
        Arc::new(LlmReviewCritic::new(LlmHandle::new(llm, config.llm.clone())))
    } else {
        Arc::new(RubricCritic)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLlm;
    use copilot_core::AgentKind;

    #[test]
    fn standard_agents_cover_every_stage() {
        let config = Config::default();
        let llm: Arc<dyn LlmClient> = Arc::new(FakeLlm::replying("ok"));
        let search: Arc<dyn SearchClient> = Arc::new(testing::FakeSearch::new(Vec::new()));
        let agents = standard_agents(&config, llm.clone(), search);

        let kinds: Vec<AgentKind> = agents.kinds().collect();
        assert_eq!(
            kinds,
            vec![AgentKind::Research, AgentKind::Analyze, AgentKind::Consult, AgentKind::Plan]
        );
        assert!(standard_critic(&config, llm.clone()).is_deterministic());

        let mut reviewing = Config::default();
        reviewing.critic.llm_review = true;
        assert!(!standard_critic(&reviewing, llm).is_deterministic());
    }

    #[tokio::test]
    async fn blank_completions_are_upstream_errors() {
        let handle = FakeLlm::replying("   ").handle();
        let err = handle.complete("system", "prompt".to_string()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
