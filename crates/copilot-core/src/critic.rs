//! Per-stage rubrics and the critic contract.
//!
//! A [`Rubric`] is a checklist derived from the stage kind, the context the
//! stage was dispatched with and the configured thresholds. Evaluating it is
//! deterministic; critics backed by a language model layer their own
//! judgement on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CriticConfig;
use crate::context::SharedContext;
use crate::model::{AgentKind, AgentResult, Figure};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricCheck {
    MinSummaryChars(usize),
    MinCitations(usize),
    MinFigures(usize),
    /// Output must cite at least one of these figures, by name or value
    ReferencesFigure { from: AgentKind, figures: Vec<Figure> },
    MinActionItems {
        count: usize,
        require_owner: bool,
        require_timeframe: bool,
    },
    MinConfidence(f64),
}

impl RubricCheck {
    /// `None` when the check passes, otherwise what is missing.
    fn failure(&self, result: &AgentResult) -> Option<String> {
        let payload = result.payload();
        match self {
            RubricCheck::MinSummaryChars(min) => {
                let len = payload.summary.trim().chars().count();
                (len < *min).then(|| format!("summary has {len} characters, needs at least {min}"))
            }
            RubricCheck::MinCitations(min) => (payload.citations.len() < *min).then(|| {
                format!(
                    "{} citation(s) provided, at least {min} required",
                    payload.citations.len()
                )
            }),
            RubricCheck::MinFigures(min) => (payload.figures.len() < *min).then(|| {
                format!(
                    "{} figure(s) computed, at least {min} required",
                    payload.figures.len()
                )
            }),
            RubricCheck::ReferencesFigure { from, figures } => {
                let by_name = payload
                    .references
                    .iter()
                    .any(|name| figures.iter().any(|f| &f.name == name));
                let by_value = figures.iter().any(|f| f.is_mentioned_in(&payload.summary));
                (!by_name && !by_value).then(|| {
                    let names: Vec<&str> = figures.iter().map(|f| f.name.as_str()).collect();
                    format!(
                        "does not reference any {from} figure ({})",
                        names.join(", ")
                    )
                })
            }
            RubricCheck::MinActionItems {
                count,
                require_owner,
                require_timeframe,
            } => {
                let complete = payload
                    .action_items
                    .iter()
                    .filter(|item| !item.action.trim().is_empty())
                    .filter(|item| !require_owner || item.is_assigned())
                    .filter(|item| !require_timeframe || item.is_scheduled())
                    .count();
                (complete < *count).then(|| {
                    format!("{complete} complete action item(s) with owner and timeframe, needs {count}")
                })
            }
            RubricCheck::MinConfidence(min) => {
                let confidence = result.confidence_or_zero();
                (confidence < *min)
                    .then(|| format!("confidence {confidence:.2} below required {min:.2}"))
            }
        }
    }

    fn hint(&self) -> String {
        match self {
            RubricCheck::MinSummaryChars(min) => {
                format!("Write a fuller summary of at least {min} characters.")
            }
            RubricCheck::MinCitations(min) => {
                format!("Support the findings with at least {min} cited source(s).")
            }
            RubricCheck::MinFigures(_) => "Report the computed figures explicitly.".to_string(),
            RubricCheck::ReferencesFigure { figures, .. } => {
                let quoted: Vec<String> = figures
                    .iter()
                    .take(3)
                    .map(|f| format!("{} = {}", f.name, f.display_value()))
                    .collect();
                format!(
                    "Ground the advice in the data analysis, e.g. {}, and list the figure names used.",
                    quoted.join("; ")
                )
            }
            RubricCheck::MinActionItems { count, .. } => format!(
                "Provide at least {count} action items, each with an owner and a timeframe."
            ),
            RubricCheck::MinConfidence(_) => {
                "Strengthen the evidence behind the conclusions.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub kind: AgentKind,
    pub checks: Vec<RubricCheck>,
}

impl Rubric {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: RubricCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Standard checklist for a stage dispatched with `context`.
    pub fn for_stage(kind: AgentKind, context: &SharedContext, config: &CriticConfig) -> Self {
        let mut rubric = Self::new(kind).with_check(RubricCheck::MinSummaryChars(config.min_summary_chars));
        if config.min_confidence > 0.0 {
            rubric = rubric.with_check(RubricCheck::MinConfidence(config.min_confidence));
        }

        match kind {
            AgentKind::Research => rubric.with_check(RubricCheck::MinCitations(config.min_citations)),
            AgentKind::Analyze => rubric.with_check(RubricCheck::MinFigures(1)),
            AgentKind::Consult => {
                let figures = context
                    .get(AgentKind::Analyze)
                    .map(|analysis| analysis.payload().figures.clone())
                    .unwrap_or_default();
                if figures.is_empty() {
                    rubric
                } else {
                    rubric.with_check(RubricCheck::ReferencesFigure {
                        from: AgentKind::Analyze,
                        figures,
                    })
                }
            }
            AgentKind::Plan => rubric.with_check(RubricCheck::MinActionItems {
                count: config.min_action_items,
                require_owner: true,
                require_timeframe: true,
            }),
            AgentKind::Critique => rubric,
        }
    }

    /// Deterministic checklist evaluation.
    pub fn evaluate(&self, result: &AgentResult) -> CritiqueVerdict {
        if !result.is_usable() {
            return CritiqueVerdict::reject(
                "agent returned no usable output",
                "Retry the task and return a complete result.",
            );
        }

        let failed: Vec<&RubricCheck> = self
            .checks
            .iter()
            .filter(|check| check.failure(result).is_some())
            .collect();

        if failed.is_empty() {
            return CritiqueVerdict::accept(format!(
                "all {} {} checks passed",
                self.checks.len(),
                self.kind
            ));
        }

        let reason = failed
            .iter()
            .filter_map(|check| check.failure(result))
            .collect::<Vec<_>>()
            .join("; ");
        let hint = failed
            .iter()
            .map(|check| check.hint())
            .collect::<Vec<_>>()
            .join(" ");
        CritiqueVerdict::reject(reason, hint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueVerdict {
    pub accepted: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_hint: Option<String>,
}

impl CritiqueVerdict {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: reason.into(),
            revision_hint: None,
        }
    }

    pub fn reject(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            revision_hint: Some(hint.into()),
        }
    }
}

/// Quality gate applied to every stage result before it enters the context.
#[async_trait]
pub trait Critic: Send + Sync {
    async fn critique(&self, result: &AgentResult, rubric: &Rubric) -> CritiqueVerdict;

    /// Non-deterministic critics must accept an unchanged result twice in a row.
    fn is_deterministic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BusinessProfile;
    use crate::model::{ActionItem, Payload, Priority};

    fn context_with_analysis() -> SharedContext {
        let analysis = Payload {
            summary: "Revenue totals 200,000 across all products this year.".into(),
            figures: vec![Figure::new("revenue", 200_000.0)],
            ..Payload::default()
        };
        SharedContext::new("q", BusinessProfile::new("Cafe", "small", "US"), None)
            .seeded_with(AgentKind::Analyze, AgentResult::ok(analysis, Some(0.9)))
    }

    fn item(action: &str, owner: Option<&str>, timeframe: Option<&str>) -> ActionItem {
        ActionItem {
            action: action.into(),
            owner: owner.map(Into::into),
            timeframe: timeframe.map(Into::into),
            expected_outcome: None,
            priority: Priority::High,
        }
    }

    #[test]
    fn consult_rubric_requires_analysis_reference() {
        let context = context_with_analysis();
        let rubric = Rubric::for_stage(AgentKind::Consult, &context, &CriticConfig::default());

        let vague = AgentResult::ok(
            Payload::with_summary("Focus on loyalty programs and seasonal drinks to grow."),
            Some(0.7),
        );
        let verdict = rubric.evaluate(&vague);
        assert!(!verdict.accepted);
        assert!(verdict.reason.contains("revenue"));
        assert!(verdict.revision_hint.unwrap().contains("200,000"));

        let grounded = AgentResult::ok(
            Payload::with_summary("With revenue of $200,000, a loyalty program can add 5%."),
            Some(0.7),
        );
        assert!(rubric.evaluate(&grounded).accepted);

        let by_name = AgentResult::ok(
            Payload {
                summary: "Focus on loyalty programs and seasonal drinks to grow.".into(),
                references: vec!["revenue".into()],
                ..Payload::default()
            },
            Some(0.7),
        );
        assert!(rubric.evaluate(&by_name).accepted);
    }

    #[test]
    fn consult_rubric_skips_reference_without_analysis() {
        let context = SharedContext::new("q", BusinessProfile::new("Cafe", "small", "US"), None);
        let rubric = Rubric::for_stage(AgentKind::Consult, &context, &CriticConfig::default());
        assert_eq!(rubric.checks, vec![RubricCheck::MinSummaryChars(40)]);
    }

    #[test]
    fn plan_rubric_counts_only_complete_items() {
        let context = context_with_analysis();
        let rubric = Rubric::for_stage(AgentKind::Plan, &context, &CriticConfig::default());
        let mut payload = Payload::with_summary("Four week plan to lift weekday afternoon sales.");
        payload.action_items = vec![
            item("Launch loyalty card", Some("Owner"), Some("Week 1")),
            item("Add oat milk", Some("Barista lead"), Some("Week 2")),
            item("Post on social media", None, Some("Week 1")),
        ];

        let verdict = rubric.evaluate(&AgentResult::ok(payload.clone(), Some(0.8)));
        assert!(!verdict.accepted);
        assert!(verdict.reason.contains("2 complete action item"));

        payload.action_items[2].owner = Some("Marketing".into());
        assert!(rubric.evaluate(&AgentResult::ok(payload, Some(0.8))).accepted);
    }

    #[test]
    fn failed_results_are_rejected() {
        let rubric = Rubric::new(AgentKind::Research);
        let verdict = rubric.evaluate(&AgentResult::failed(crate::AgentError::upstream("down")));
        assert!(!verdict.accepted);
        assert!(verdict.revision_hint.is_some());
    }

    #[test]
    fn min_confidence_is_opt_in() {
        let config = CriticConfig {
            min_confidence: 0.5,
            ..CriticConfig::default()
        };
        let context = context_with_analysis();
        let rubric = Rubric::for_stage(AgentKind::Analyze, &context, &config);
        let low = AgentResult::ok(
            Payload {
                summary: "Revenue totals 200,000 across all products this year.".into(),
                figures: vec![Figure::new("revenue", 200_000.0)],
                ..Payload::default()
            },
            Some(0.3),
        );
        let verdict = rubric.evaluate(&low);
        assert!(!verdict.accepted);
        assert!(verdict.reason.contains("confidence 0.30"));
    }
}
