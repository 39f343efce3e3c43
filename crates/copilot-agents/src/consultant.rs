use async_trait::async_trait;
use copilot_core::{
    Agent, AgentError, AgentKind, AgentResult, Payload, SharedContext, Task,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::prompt::{self, CONSULTANT_SYSTEM};
use crate::LlmHandle;

/// Strategy document returned by the model. Every field is optional so a
/// thin answer still parses; completeness feeds the confidence score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    pub executive_summary: String,
    pub key_opportunities: Vec<Opportunity>,
    pub recommendations: Vec<String>,
    pub risks_and_mitigations: Vec<Risk>,
    pub assumptions: Vec<String>,
    pub referenced_figures: Vec<String>,
    pub estimated_roi: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Opportunity {
    pub opportunity: String,
    pub potential_gain: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Risk {
    pub risk: String,
    pub likelihood: Option<String>,
    pub mitigation: Option<String>,
}

impl Strategy {
    fn completed_sections(&self) -> usize {
        [
            !self.key_opportunities.is_empty(),
            !self.recommendations.is_empty(),
            !self.risks_and_mitigations.is_empty(),
            !self.referenced_figures.is_empty(),
        ]
        .into_iter()
        .filter(|filled| *filled)
        .count()
    }
}

pub struct ConsultantAgent {
    llm: LlmHandle,
}

impl ConsultantAgent {
    pub fn new(llm: LlmHandle) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for ConsultantAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Consult
    }

    #[instrument(name = "agent.consult", skip(self, task, context), fields(attempt = task.attempt()))]
    async fn run(&self, task: &Task, context: &SharedContext) -> Result<AgentResult, AgentError> {
        if task.input(AgentKind::Research).is_none() {
            return Err(AgentError::invalid_input(
                "strategy requires accepted research results",
            ));
        }

        let prompt = prompt::consult_prompt(task, context.profile());
        let raw = self.llm.complete(CONSULTANT_SYSTEM, prompt).await?;

        let Some(strategy) = prompt::extract_json_object(&raw)
            .and_then(|value| serde_json::from_value::<Strategy>(value).ok())
            .filter(|strategy| !strategy.executive_summary.trim().is_empty())
        else {
            warn!(chars = raw.len(), "strategy response was not valid JSON");
            return Ok(AgentResult::partial(
                Payload::with_summary(raw.trim()),
                Some(0.3),
                AgentError::upstream("strategy response was not valid JSON"),
            ));
        };
        debug!(
            opportunities = strategy.key_opportunities.len(),
            references = strategy.referenced_figures.len(),
            "parsed strategy"
        );

        let mut confidence = 0.5 + 0.1 * strategy.completed_sections() as f64;
        if task.input(AgentKind::Analyze).is_some() {
            confidence += 0.05;
        }

        let payload = Payload {
            summary: strategy_summary(&strategy),
            references: strategy.referenced_figures.clone(),
            details: serde_json::to_value(&strategy).unwrap_or_default(),
            ..Payload::default()
        };
        Ok(AgentResult::ok(payload, Some(confidence)))
    }
}

fn strategy_summary(strategy: &Strategy) -> String {
    let mut summary = strategy.executive_summary.trim().to_string();
    let opportunities: Vec<&str> = strategy
        .key_opportunities
        .iter()
        .map(|o| o.opportunity.trim())
        .filter(|o| !o.is_empty())
        .collect();
    if !opportunities.is_empty() {
        summary.push_str("\n\nKey opportunities: ");
        summary.push_str(&opportunities.join("; "));
        summary.push('.');
    }
    summary
}
