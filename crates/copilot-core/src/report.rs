//! Final, read-only aggregation of a completed pipeline run.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{BusinessProfile, SharedContext};
use crate::model::{format_number, AgentKind, AgentResult, Citation, Payload};
use crate::trace::RunTrace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionStatus {
    /// Accepted by the critic
    Verified,
    /// Best available result after the revision cap, never accepted
    Unverified { reason: String },
    /// Stage produced nothing usable; nothing is shown in its place
    Absent { reason: String },
}

impl SectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SectionStatus::Verified => "verified",
            SectionStatus::Unverified { .. } => "unverified",
            SectionStatus::Absent { .. } => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub kind: AgentKind,
    pub title: String,
    #[serde(flatten)]
    pub status: SectionStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    HigherConfidence,
    StructuredSource,
    FirstReported,
}

impl ResolutionRule {
    pub fn describe(&self) -> &'static str {
        match self {
            ResolutionRule::HigherConfidence => "higher confidence",
            ResolutionRule::StructuredSource => "equal confidence, structured data preferred",
            ResolutionRule::FirstReported => "equal confidence, first reported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictValue {
    pub kind: AgentKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub confidence: f64,
}

/// Two accepted results disagreeing on the same named figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub metric: String,
    pub values: Vec<ConflictValue>,
    pub preferred: AgentKind,
    pub rule: ResolutionRule,
    pub relative_difference: f64,
}

impl Conflict {
    pub fn preferred_value(&self) -> Option<&ConflictValue> {
        self.values.iter().find(|v| v.kind == self.preferred)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSummary {
    /// Mean confidence over present sections; absent sections are excluded
    pub overall: f64,
    pub per_section: BTreeMap<AgentKind, f64>,
    pub verified: usize,
    pub unverified: usize,
    pub absent: usize,
}

/// How a stage ended, as recorded by the orchestrator.
#[derive(Debug, Clone)]
pub(crate) enum StageRecord {
    Accepted {
        attempts: u32,
        verified: bool,
        note: String,
    },
    Absent {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    run_id: String,
    query: String,
    profile: BusinessProfile,
    generated_at: DateTime<Utc>,
    sections: BTreeMap<AgentKind, ReportSection>,
    conflicts: Vec<Conflict>,
    confidence_summary: ConfidenceSummary,
    citations: Vec<Citation>,
    trace: RunTrace,
}

impl Report {
    pub(crate) fn assemble(
        run_id: String,
        context: &SharedContext,
        records: &BTreeMap<AgentKind, StageRecord>,
        conflict_tolerance: f64,
        trace: RunTrace,
    ) -> Self {
        let mut sections = BTreeMap::new();
        for (kind, record) in records {
            let section = match (record, context.get(*kind)) {
                (
                    StageRecord::Accepted {
                        attempts,
                        verified,
                        note,
                    },
                    Some(result),
                ) => ReportSection {
                    kind: *kind,
                    title: kind.title().to_string(),
                    status: if *verified {
                        SectionStatus::Verified
                    } else {
                        SectionStatus::Unverified {
                            reason: note.clone(),
                        }
                    },
                    summary: result.payload().summary.clone(),
                    confidence: result.confidence(),
                    attempts: *attempts,
                    payload: Some(result.payload().clone()),
                },
                (StageRecord::Accepted { attempts, .. }, None) => {
                    absent_section(*kind, *attempts, "result missing from context")
                }
                (StageRecord::Absent { reason }, _) => absent_section(*kind, 0, reason),
            };
            sections.insert(*kind, section);
        }

        let conflicts = detect_conflicts(context.results(), conflict_tolerance);
        let confidence_summary = summarize(&sections);
        let citations = collect_citations(&sections);

        Self {
            run_id,
            query: context.query().to_string(),
            profile: context.profile().clone(),
            generated_at: Utc::now(),
            sections,
            conflicts,
            confidence_summary,
            citations,
            trace,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn profile(&self) -> &BusinessProfile {
        &self.profile
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn sections(&self) -> &BTreeMap<AgentKind, ReportSection> {
        &self.sections
    }

    pub fn section(&self, kind: AgentKind) -> Option<&ReportSection> {
        self.sections.get(&kind)
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn confidence_summary(&self) -> &ConfidenceSummary {
        &self.confidence_summary
    }

    /// Sources across all sections, deduplicated by URL.
    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn trace(&self) -> &RunTrace {
        &self.trace
    }

    pub fn has_unverified_sections(&self) -> bool {
        self.confidence_summary.unverified > 0
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Business Report\n");
        let _ = writeln!(out, "**Query:** {}\n", self.query);
        let _ = writeln!(out, "**Business:** {}\n", self.profile.describe());
        let _ = writeln!(
            out,
            "**Generated:** {} · run `{}`\n",
            self.generated_at.format("%Y-%m-%d %H:%M UTC"),
            self.run_id
        );

        for section in self.sections.values() {
            render_section(&mut out, section);
        }

        if !self.conflicts.is_empty() {
            let _ = writeln!(out, "## Conflicting Figures\n");
            for conflict in &self.conflicts {
                let values: Vec<String> = conflict
                    .values
                    .iter()
                    .map(|v| {
                        format!(
                            "{} reports {} (confidence {:.2})",
                            v.kind,
                            format_number(v.value),
                            v.confidence
                        )
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "- **{}**: {}. Preferred {} ({}).",
                    conflict.metric,
                    values.join("; "),
                    conflict.preferred,
                    conflict.rule.describe()
                );
            }
            out.push('\n');
        }

        if !self.citations.is_empty() {
            let _ = writeln!(out, "## Sources\n");
            for (idx, citation) in self.citations.iter().enumerate() {
                let _ = writeln!(out, "{}. [{}]({})", idx + 1, citation.title, citation.url);
            }
            out.push('\n');
        }

        let summary = &self.confidence_summary;
        let _ = writeln!(out, "## Confidence\n");
        let _ = writeln!(
            out,
            "Overall {:.2}. {} verified, {} unverified, {} absent.",
            summary.overall, summary.verified, summary.unverified, summary.absent
        );
        out
    }
}

fn absent_section(kind: AgentKind, attempts: u32, reason: &str) -> ReportSection {
    ReportSection {
        kind,
        title: kind.title().to_string(),
        status: SectionStatus::Absent {
            reason: reason.to_string(),
        },
        summary: String::new(),
        confidence: None,
        attempts,
        payload: None,
    }
}

fn render_section(out: &mut String, section: &ReportSection) {
    let _ = writeln!(out, "## {}\n", section.title);
    match &section.status {
        SectionStatus::Absent { reason } => {
            let _ = writeln!(out, "_Not available: {reason}_\n");
            return;
        }
        SectionStatus::Unverified { reason } => {
            let _ = writeln!(out, "> **Unverified** ({reason})\n");
        }
        SectionStatus::Verified => {}
    }

    let _ = writeln!(out, "{}\n", section.summary.trim());

    let Some(payload) = &section.payload else {
        return;
    };

    if !payload.figures.is_empty() {
        let _ = writeln!(out, "| Figure | Value |\n|---|---|");
        for figure in &payload.figures {
            let label = figure.label.as_deref().unwrap_or(&figure.name);
            let unit = figure.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default();
            let _ = writeln!(out, "| {label} | {}{unit} |", figure.display_value());
        }
        out.push('\n');
    }

    if !payload.action_items.is_empty() {
        let _ = writeln!(
            out,
            "| Priority | Action | Owner | Timeframe | Expected outcome |\n|---|---|---|---|---|"
        );
        for item in &payload.action_items {
            let _ = writeln!(
                out,
                "| {:?} | {} | {} | {} | {} |",
                item.priority,
                item.action,
                item.owner.as_deref().unwrap_or("-"),
                item.timeframe.as_deref().unwrap_or("-"),
                item.expected_outcome.as_deref().unwrap_or("-"),
            );
        }
        out.push('\n');
    }

    for chart in &payload.charts {
        let _ = writeln!(
            out,
            "_Chart: {} ({} vs {}, {} points)_\n",
            chart.title,
            chart.y_label,
            chart.x_label,
            chart.categories.len()
        );
    }
}

fn summarize(sections: &BTreeMap<AgentKind, ReportSection>) -> ConfidenceSummary {
    let mut summary = ConfidenceSummary::default();
    for section in sections.values() {
        match section.status {
            SectionStatus::Verified => summary.verified += 1,
            SectionStatus::Unverified { .. } => summary.unverified += 1,
            SectionStatus::Absent { .. } => {
                summary.absent += 1;
                continue;
            }
        }
        summary
            .per_section
            .insert(section.kind, section.confidence.unwrap_or(0.0));
    }
    if !summary.per_section.is_empty() {
        summary.overall =
            summary.per_section.values().sum::<f64>() / summary.per_section.len() as f64;
    }
    summary
}

fn collect_citations(sections: &BTreeMap<AgentKind, ReportSection>) -> Vec<Citation> {
    let mut seen = HashSet::new();
    sections
        .values()
        .filter_map(|section| section.payload.as_ref())
        .flat_map(|payload| payload.citations.iter())
        .filter(|citation| seen.insert(citation.url.clone()))
        .cloned()
        .collect()
}

/// Compare same-named figures across accepted results.
///
/// Relative difference is `|a - b| / max(|a|, |b|)`; anything above
/// `tolerance` is a conflict. The higher-confidence value is preferred, and
/// on a tie the value from structured input wins.
pub fn detect_conflicts(
    results: &BTreeMap<AgentKind, AgentResult>,
    tolerance: f64,
) -> Vec<Conflict> {
    let entries: Vec<(&AgentKind, &AgentResult)> = results.iter().collect();
    let mut conflicts = Vec::new();

    for (idx, (first_kind, first)) in entries.iter().enumerate() {
        for (second_kind, second) in &entries[idx + 1..] {
            for figure in &first.payload().figures {
                let Some(other) = second.payload().figure(&figure.name) else {
                    continue;
                };
                let scale = figure.value.abs().max(other.value.abs());
                if scale == 0.0 {
                    continue;
                }
                let relative_difference = (figure.value - other.value).abs() / scale;
                if relative_difference <= tolerance {
                    continue;
                }

                let first_conf = first.confidence_or_zero();
                let second_conf = second.confidence_or_zero();
                let (preferred, rule) = if (first_conf - second_conf).abs() > f64::EPSILON {
                    let kind = if first_conf > second_conf {
                        **first_kind
                    } else {
                        **second_kind
                    };
                    (kind, ResolutionRule::HigherConfidence)
                } else if second_kind.is_structured_source() && !first_kind.is_structured_source()
                {
                    (**second_kind, ResolutionRule::StructuredSource)
                } else if first_kind.is_structured_source() && !second_kind.is_structured_source()
                {
                    (**first_kind, ResolutionRule::StructuredSource)
                } else {
                    (**first_kind, ResolutionRule::FirstReported)
                };

                tracing::info!(
                    metric = %figure.name,
                    %preferred,
                    relative_difference,
                    "conflicting figures recorded"
                );
                conflicts.push(Conflict {
                    metric: figure.name.clone(),
                    values: vec![
                        ConflictValue {
                            kind: **first_kind,
                            value: figure.value,
                            unit: figure.unit.clone(),
                            confidence: first_conf,
                        },
                        ConflictValue {
                            kind: **second_kind,
                            value: other.value,
                            unit: other.unit.clone(),
                            confidence: second_conf,
                        },
                    ],
                    preferred,
                    rule,
                    relative_difference,
                });
            }
        }
    }

    conflicts
}
