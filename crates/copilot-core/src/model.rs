//! Data model shared by the orchestrator and every agent.
//!
//! Tasks and results are value types: a retry or revision produces a new
//! [`Task`], and an [`AgentResult`] is never mutated after an agent returns it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Kind of work an agent performs. Also keys results in the shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Web research over a search service
    Research,
    /// Statistics over caller-supplied tabular data
    Analyze,
    /// Business strategy synthesis
    Consult,
    /// Concrete action planning
    Plan,
    /// Quality review of another agent's output
    Critique,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Research => "research",
            AgentKind::Analyze => "analyze",
            AgentKind::Consult => "consult",
            AgentKind::Plan => "plan",
            AgentKind::Critique => "critique",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AgentKind::Research => "Market Research",
            AgentKind::Analyze => "Data Analysis",
            AgentKind::Consult => "Strategy",
            AgentKind::Plan => "Action Plan",
            AgentKind::Critique => "Review",
        }
    }

    /// Results derived from caller-supplied structured input win confidence ties.
    pub fn is_structured_source(&self) -> bool {
        matches!(self, AgentKind::Analyze)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Started,
    Researching,
    Analyzing,
    Consulting,
    Planning,
    Critiquing,
    Accepted,
    Revising,
    Completed,
    Failed,
}

impl PipelineState {
    /// Working state entered while the given stage's agent runs.
    pub fn for_stage(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Research => PipelineState::Researching,
            AgentKind::Analyze => PipelineState::Analyzing,
            AgentKind::Consult => PipelineState::Consulting,
            AgentKind::Plan => PipelineState::Planning,
            AgentKind::Critique => PipelineState::Critiquing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Started => "started",
            PipelineState::Researching => "researching",
            PipelineState::Analyzing => "analyzing",
            PipelineState::Consulting => "consulting",
            PipelineState::Planning => "planning",
            PipelineState::Critiquing => "critiquing",
            PipelineState::Accepted => "accepted",
            PipelineState::Revising => "revising",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work handed to an agent. Immutable; see [`Task::revise`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    kind: AgentKind,
    query: String,
    inputs: BTreeMap<AgentKind, AgentResult>,
    attempt: u32,
    revision_hint: Option<String>,
}

impl Task {
    pub fn new(
        kind: AgentKind,
        query: impl Into<String>,
        inputs: BTreeMap<AgentKind, AgentResult>,
    ) -> Self {
        Self {
            kind,
            query: query.into(),
            inputs,
            attempt: 1,
            revision_hint: None,
        }
    }

    /// New task for the same stage with the next attempt number and a critic hint.
    pub fn revise(&self, hint: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            query: self.query.clone(),
            inputs: self.inputs.clone(),
            attempt: self.attempt + 1,
            revision_hint: Some(hint.into()),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn inputs(&self) -> &BTreeMap<AgentKind, AgentResult> {
        &self.inputs
    }

    pub fn input(&self, kind: AgentKind) -> Option<&AgentResult> {
        self.inputs.get(&kind)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn revision_hint(&self) -> Option<&str> {
        self.revision_hint.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Partial,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::Partial => "partial",
            ResultStatus::Failed => "failed",
        }
    }
}

/// Source reference attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<NaiveDate>,
    /// Combined relevance/recency rank score in `[0, 1]`
    #[serde(default)]
    pub relevance: f64,
}

/// Named numeric claim, compared across agents for conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Figure {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            unit: None,
            label: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Human rendering with thousands separators, e.g. `200,000` or `12.5`.
    pub fn display_value(&self) -> String {
        format_number(self.value)
    }

    /// Whether `text` quotes this figure's value in any of its common renderings.
    pub fn is_mentioned_in(&self, text: &str) -> bool {
        let renderings = [
            format_number(self.value),
            format!("{:.0}", self.value),
            format!("{:.1}", self.value),
            format!("{:.2}", self.value),
        ];
        renderings
            .iter()
            .any(|rendered| rendered.len() > 1 && text.contains(rendered.as_str()))
    }
}

/// Format with thousands separators and at most two decimals.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let negative = rounded < 0.0;
    let abs = rounded.abs();
    let whole = abs.trunc() as u64;
    let fraction = ((abs - abs.trunc()) * 100.0).round() as u64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if fraction > 0 {
        if fraction % 10 == 0 {
            out.push_str(&format!(".{}", fraction / 10));
        } else {
            out.push_str(&format!(".{fraction:02}"));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    pub values: Vec<f64>,
}

/// Renderer-agnostic chart specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub categories: Vec<String>,
    pub series: Vec<ChartSeries>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl ActionItem {
    pub fn is_assigned(&self) -> bool {
        self.owner.as_deref().is_some_and(|o| !o.trim().is_empty())
    }

    pub fn is_scheduled(&self) -> bool {
        self.timeframe.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Structured output of one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub summary: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub figures: Vec<Figure>,
    #[serde(default)]
    pub charts: Vec<ChartSpec>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    /// Names of figures from other agents this output relies on
    #[serde(default)]
    pub references: Vec<String>,
    /// Agent-specific structured detail
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Payload {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// Names of populated fields. Stable across repeated runs of the same task.
    pub fn structure(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.summary.is_empty() {
            fields.push("summary");
        }
        if !self.citations.is_empty() {
            fields.push("citations");
        }
        if !self.figures.is_empty() {
            fields.push("figures");
        }
        if !self.charts.is_empty() {
            fields.push("charts");
        }
        if !self.action_items.is_empty() {
            fields.push("action_items");
        }
        if !self.references.is_empty() {
            fields.push("references");
        }
        if !self.details.is_null() {
            fields.push("details");
        }
        fields
    }

    pub fn figure(&self, name: &str) -> Option<&Figure> {
        self.figures.iter().find(|f| f.name == name)
    }
}

/// Output of one agent run. `error` is present exactly when status is not `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    status: ResultStatus,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<AgentError>,
}

impl AgentResult {
    pub fn ok(payload: Payload, confidence: Option<f64>) -> Self {
        Self {
            status: ResultStatus::Ok,
            payload,
            confidence: confidence.map(clamp_unit),
            error: None,
        }
    }

    /// Usable but incomplete output; `error` explains what is missing.
    pub fn partial(payload: Payload, confidence: Option<f64>, error: AgentError) -> Self {
        Self {
            status: ResultStatus::Partial,
            payload,
            confidence: confidence.map(clamp_unit),
            error: Some(error),
        }
    }

    pub fn failed(error: AgentError) -> Self {
        Self {
            status: ResultStatus::Failed,
            payload: Payload::default(),
            confidence: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn confidence_or_zero(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }

    pub fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }

    /// `Ok` or `Partial`; the only results allowed into the shared context.
    pub fn is_usable(&self) -> bool {
        matches!(self.status, ResultStatus::Ok | ResultStatus::Partial)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revise_increments_attempt_and_keeps_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            AgentKind::Research,
            AgentResult::ok(Payload::with_summary("findings"), Some(0.7)),
        );
        let task = Task::new(AgentKind::Consult, "grow revenue", inputs);
        let revised = task.revise("cite the revenue figure");
        let again = revised.revise("add owners");

        assert_eq!(task.attempt(), 1);
        assert_eq!(revised.attempt(), 2);
        assert_eq!(again.attempt(), 3);
        assert_eq!(again.revision_hint(), Some("add owners"));
        assert_eq!(again.inputs(), task.inputs());
        assert!(task.revision_hint().is_none());
    }

    #[test]
    fn error_is_present_iff_status_is_not_ok() {
        let ok = AgentResult::ok(Payload::default(), Some(1.4));
        assert!(ok.error().is_none());
        assert_eq!(ok.confidence(), Some(1.0));

        let partial = AgentResult::partial(
            Payload::with_summary("stats only"),
            None,
            AgentError::upstream("narrative unavailable"),
        );
        assert!(partial.is_usable());
        assert!(partial.error().is_some());

        let failed = AgentResult::failed(AgentError::invalid_input("empty table"));
        assert!(!failed.is_usable());
        assert_eq!(failed.status(), ResultStatus::Failed);
    }

    #[test]
    fn numbers_render_with_separators() {
        assert_eq!(format_number(200000.0), "200,000");
        assert_eq!(format_number(1234.5), "1,234.5");
        assert_eq!(format_number(-42.25), "-42.25");
        assert_eq!(format_number(999.0), "999");
    }

    #[test]
    fn figure_mentions_match_common_renderings() {
        let figure = Figure::new("revenue", 200000.0);
        assert!(figure.is_mentioned_in("Revenue of $200,000 suggests"));
        assert!(figure.is_mentioned_in("about 200000 per year"));
        assert!(!figure.is_mentioned_in("about 150,000 per year"));
    }

    #[test]
    fn payload_structure_lists_populated_fields() {
        let payload = Payload {
            summary: "s".into(),
            figures: vec![Figure::new("revenue", 1.0)],
            ..Payload::default()
        };
        assert_eq!(payload.structure(), vec!["summary", "figures"]);
    }
}
