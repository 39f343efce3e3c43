use async_trait::async_trait;
use copilot_core::{
    ActionItem, Agent, AgentError, AgentKind, AgentResult, Payload, Priority, SharedContext, Task,
};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::prompt::{self, PLANNER_SYSTEM};
use crate::LlmHandle;

pub struct PlannerAgent {
    llm: LlmHandle,
}

impl PlannerAgent {
    pub fn new(llm: LlmHandle) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Plan
    }

    #[instrument(name = "agent.plan", skip(self, task, context), fields(attempt = task.attempt()))]
    async fn run(&self, task: &Task, context: &SharedContext) -> Result<AgentResult, AgentError> {
        if task.input(AgentKind::Consult).is_none() {
            return Err(AgentError::invalid_input(
                "action planning requires an accepted strategy",
            ));
        }

        let raw = self
            .llm
            .complete(PLANNER_SYSTEM, prompt::plan_prompt(task, context.profile()))
            .await?;

        // Either the documented object or a bare array of items.
        let parsed = match prompt::extract_json_object(&raw) {
            Some(plan) if plan.get("action_items").is_some() => Some(plan),
            other => prompt::extract_json_array(&raw)
                .map(|items| json!({ "action_items": items }))
                .or(other),
        };
        let Some(plan) = parsed else {
            warn!(chars = raw.len(), "plan response was not valid JSON");
            return Ok(AgentResult::partial(
                Payload::with_summary(raw.trim()),
                Some(0.2),
                AgentError::upstream("plan response was not valid JSON"),
            ));
        };

        let mut items: Vec<ActionItem> = plan["action_items"]
            .as_array()
            .map(|items| items.iter().filter_map(parse_action_item).collect())
            .unwrap_or_default();
        items.sort_by_key(|item| item.priority);

        let weekly_plan = plan.get("weekly_plan").cloned().unwrap_or(Value::Null);
        debug!(items = items.len(), has_weekly_plan = !weekly_plan.is_null(), "parsed plan");

        let summary = plan["summary"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_summary(&items));

        let complete = items.iter().filter(|i| i.is_assigned() && i.is_scheduled()).count();
        let mut confidence = 0.5 + 0.3 * complete as f64 / items.len().max(3) as f64;
        if weekly_plan.is_array() {
            confidence += 0.1;
        }

        let payload = Payload {
            summary,
            action_items: items,
            details: json!({ "weekly_plan": weekly_plan }),
            ..Payload::default()
        };
        Ok(AgentResult::ok(payload, Some(confidence)))
    }
}

fn parse_priority(raw: Option<&str>) -> Priority {
    match raw.map(|p| p.trim().to_lowercase()).as_deref() {
        Some("high") | Some("critical") | Some("urgent") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Medium,
    }
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .filter_map(|field| match field {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .find(|text| !text.is_empty())
}

/// Lenient item parsing: accepts the timeline/deadline spellings models
/// tend to use and skips items without an action.
fn parse_action_item(value: &Value) -> Option<ActionItem> {
    let action = text_field(value, &["action", "task", "title"])?;
    Some(ActionItem {
        action,
        owner: text_field(value, &["owner", "responsible", "assignee"]),
        timeframe: text_field(value, &["timeframe", "timeline", "deadline"]),
        expected_outcome: text_field(value, &["expected_outcome", "outcome"]),
        priority: parse_priority(value.get("priority").and_then(Value::as_str)),
    })
}

fn default_summary(items: &[ActionItem]) -> String {
    match items.first() {
        Some(first) => format!(
            "{} action item(s), starting with: {}.",
            items.len(),
            first.action.trim_end_matches('.')
        ),
        None => "No concrete action items were produced.".to_string(),
    }
}
