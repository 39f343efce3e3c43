//! Fixed task-to-prompt mapping per agent kind.
//!
//! Every prompt is built only from explicit fields of the task, the context
//! snapshot and the business profile, so an identical task always produces
//! an identical prompt.

use std::fmt::Write as _;

use copilot_core::{AgentKind, AgentResult, BusinessProfile, Rubric, Task};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const CONSULTANT_SYSTEM: &str =
    "You are an experienced small-business consultant. Answer with valid JSON only.";
pub const PLANNER_SYSTEM: &str =
    "You turn business strategies into concrete, owned, time-boxed action plans. Answer with valid JSON only.";
pub const ANALYST_SYSTEM: &str =
    "You explain sales statistics to a small-business owner in plain language.";
pub const REVIEWER_SYSTEM: &str =
    "You review consulting deliverables for accuracy and usefulness. Answer with valid JSON only.";

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("invalid json object regex"));
static JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[\s\S]*\]").expect("invalid json array regex"));

/// First-to-last brace span of `text`, parsed as a JSON object.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let span = JSON_OBJECT.find(text)?;
    serde_json::from_str::<Value>(span.as_str())
        .ok()
        .filter(Value::is_object)
}

pub fn extract_json_array(text: &str) -> Option<Value> {
    let span = JSON_ARRAY.find(text)?;
    serde_json::from_str::<Value>(span.as_str())
        .ok()
        .filter(Value::is_array)
}

fn revision_section(task: &Task) -> String {
    match task.revision_hint() {
        Some(hint) => format!(
            "\n=== REVISION REQUEST (attempt {}) ===\nA reviewer rejected the previous answer. {hint}\n",
            task.attempt()
        ),
        None => String::new(),
    }
}

fn profile_section(profile: &BusinessProfile) -> String {
    format!("=== BUSINESS ===\n{}\n", profile.describe())
}

fn result_section(title: &str, result: &AgentResult) -> String {
    let payload = result.payload();
    let mut section = format!("=== {title} ===\n{}\n", payload.summary.trim());
    if !payload.figures.is_empty() {
        section.push_str("Figures:\n");
        for figure in &payload.figures {
            let _ = writeln!(section, "- {} = {}", figure.name, figure.display_value());
        }
    }
    if !payload.citations.is_empty() {
        section.push_str("Sources:\n");
        for citation in payload.citations.iter().take(5) {
            let _ = writeln!(section, "- {}: {}", citation.title, citation.snippet.trim());
        }
    }
    section
}

/// Broader search angles, one per revision.
const RESEARCH_REFINEMENTS: &[&str] = &[
    "industry statistics report",
    "small business revenue benchmarks survey",
    "customer demand growth data",
];

/// Search query for the web research agent. Each revision switches to a
/// different, broader angle so a repeated search never replays the last one.
pub fn research_query(task: &Task, profile: &BusinessProfile) -> String {
    let mut query = format!(
        "{} {} {} market trends",
        task.query().trim(),
        profile.industry.trim(),
        profile.region.trim()
    );
    if task.revision_hint().is_some() {
        let revision = task.attempt().saturating_sub(2) as usize;
        let refinement = RESEARCH_REFINEMENTS[revision % RESEARCH_REFINEMENTS.len()];
        let _ = write!(query, " {refinement}");
        if revision >= RESEARCH_REFINEMENTS.len() {
            let _ = write!(query, " (attempt {})", task.attempt());
        }
    }
    query
}

pub fn analysis_prompt(task: &Task, profile: &BusinessProfile, statistics: &str) -> String {
    format!(
        "{profile}\n=== OWNER'S QUESTION ===\n{query}\n\n=== STATISTICS ===\n{statistics}\n{revision}\n\
Write three to five sentences explaining what these numbers mean for the business. \
Quote the exact figures you rely on. Do not invent numbers that are not listed above.",
        profile = profile_section(profile),
        query = task.query().trim(),
        revision = revision_section(task),
    )
}

pub fn consult_prompt(task: &Task, profile: &BusinessProfile) -> String {
    let mut prompt = profile_section(profile);
    let _ = write!(prompt, "\n=== OWNER'S QUESTION ===\n{}\n\n", task.query().trim());

    if let Some(research) = task.input(AgentKind::Research) {
        prompt.push_str(&result_section("MARKET RESEARCH", research));
        prompt.push('\n');
    }
    match task.input(AgentKind::Analyze) {
        Some(analysis) => prompt.push_str(&result_section("DATA ANALYSIS", analysis)),
        None => prompt.push_str("=== DATA ANALYSIS ===\nNo sales data is available.\n"),
    }
    prompt.push_str(&revision_section(task));

    prompt.push_str(
        r#"
Create a growth strategy as JSON with exactly these fields:
{
  "executive_summary": "2-3 sentences that quote the most important figures",
  "key_opportunities": [{"opportunity": "...", "potential_gain": "...", "priority": "high|medium|low"}],
  "recommendations": ["..."],
  "risks_and_mitigations": [{"risk": "...", "likelihood": "high|medium|low", "mitigation": "..."}],
  "assumptions": ["..."],
  "referenced_figures": ["names of the figures above that the strategy relies on"],
  "estimated_roi": "..."
}
Be specific and realistic for a small business. Return only JSON."#,
    );
    prompt
}

pub fn plan_prompt(task: &Task, profile: &BusinessProfile) -> String {
    let mut prompt = profile_section(profile);
    let _ = write!(prompt, "\n=== OWNER'S QUESTION ===\n{}\n\n", task.query().trim());

    if let Some(strategy) = task.input(AgentKind::Consult) {
        prompt.push_str(&result_section("STRATEGY", strategy));
        let details = &strategy.payload().details;
        if !details.is_null() {
            let _ = writeln!(prompt, "Strategy detail: {details}");
        }
    }
    prompt.push_str(&revision_section(task));

    prompt.push_str(
        r#"
Turn the strategy into an action plan as JSON:
{
  "summary": "one paragraph describing the plan",
  "action_items": [
    {"action": "...", "owner": "role responsible", "timeframe": "e.g. week 1", "expected_outcome": "...", "priority": "high|medium|low"}
  ],
  "weekly_plan": [{"week": 1, "focus_area": "...", "tasks": ["..."], "success_metrics": "..."}]
}
Provide between 3 and 6 action items. Every item needs an owner and a timeframe. Return only JSON."#,
    );
    prompt
}

pub fn review_prompt(result: &AgentResult, rubric: &Rubric) -> String {
    let payload = result.payload();
    let mut prompt = format!(
        "Review this {} deliverable.\n\n=== SUMMARY ===\n{}\n",
        rubric.kind,
        payload.summary.trim()
    );
    if !payload.action_items.is_empty() {
        prompt.push_str("\n=== ACTION ITEMS ===\n");
        for item in &payload.action_items {
            let _ = writeln!(
                prompt,
                "- {} (owner: {}, timeframe: {})",
                item.action,
                item.owner.as_deref().unwrap_or("none"),
                item.timeframe.as_deref().unwrap_or("none")
            );
        }
    }
    prompt.push_str(
        r#"
Is it specific, internally consistent and actionable for a small business?
Respond as JSON: {"accepted": true|false, "reason": "...", "revision_hint": "what to change, if rejected"}"#,
    );
    prompt
}
