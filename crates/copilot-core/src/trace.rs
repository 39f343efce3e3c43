use std::fmt::Write as _;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::current_timestamp;
use crate::model::{AgentKind, PipelineState};

/// One state-machine transition, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AgentKind>,
    #[serde(default)]
    pub note: String,
    pub timestamp_ms: u64,
}

impl Transition {
    pub fn new(state: PipelineState, kind: Option<AgentKind>, note: impl Into<String>) -> Self {
        Self {
            state,
            kind,
            note: note.into(),
            timestamp_ms: current_timestamp(),
        }
    }

    fn label(&self) -> String {
        let mut label = self.state.to_string();
        if let Some(kind) = self.kind {
            let _ = write!(label, " [{kind}]");
        }
        if !self.note.is_empty() {
            let _ = write!(label, ": {}", self.note);
        }
        label
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    transitions: Vec<Transition>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, state: PipelineState, kind: Option<AgentKind>, note: impl Into<String>) {
        self.transitions.push(Transition::new(state, kind, note));
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn last_state(&self) -> Option<PipelineState> {
        self.transitions.last().map(|t| t.state)
    }

    /// States entered for one stage, in order.
    pub fn states_for(&self, kind: AgentKind) -> Vec<PipelineState> {
        self.transitions
            .iter()
            .filter(|t| t.kind == Some(kind))
            .map(|t| t.state)
            .collect()
    }

    pub fn render_markdown(&self) -> String {
        if self.transitions.is_empty() {
            return "No transitions recorded.".to_string();
        }
        let mut output = String::from("### Run Trace\n");
        for (idx, transition) in self.transitions.iter().enumerate() {
            let _ = writeln!(output, "{}. {}", idx + 1, transition.label());
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.transitions.is_empty() {
            return "flowchart TD\n  %% no transitions captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for (idx, transition) in self.transitions.iter().enumerate() {
            let label = sanitize_mermaid(&transition.label());
            let _ = writeln!(output, "  step{}[\"{label}\"]", idx + 1);
        }
        for idx in 1..self.transitions.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the trace as `<dir>/<run_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(dir: P, run_id: &str, trace: &RunTrace) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{run_id}.json"));
    let payload = serde_json::to_vec_pretty(trace)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunTrace {
        let mut trace = RunTrace::new();
        trace.record(PipelineState::Started, None, "");
        trace.record(PipelineState::Researching, Some(AgentKind::Research), "attempt 1");
        trace.record(PipelineState::Critiquing, Some(AgentKind::Research), "");
        trace.record(PipelineState::Accepted, Some(AgentKind::Research), "verified");
        trace
    }

    #[test]
    fn markdown_lists_transitions() {
        let markdown = sample().render_markdown();
        assert!(markdown.contains("1. started"));
        assert!(markdown.contains("2. researching [research]: attempt 1"));
        assert_eq!(
            sample().states_for(AgentKind::Research),
            vec![
                PipelineState::Researching,
                PipelineState::Critiquing,
                PipelineState::Accepted
            ]
        );
    }

    #[test]
    fn mermaid_links_sequential_steps() {
        let mermaid = sample().render_mermaid();
        assert!(mermaid.starts_with("flowchart TD"));
        assert!(mermaid.contains("step1 --> step2"));
        assert!(mermaid.contains("step3 --> step4"));
        assert!(mermaid.contains("researching (research)"));
    }

    #[test]
    fn persists_trace_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = persist_trace(dir.path(), "run-42", &sample()).unwrap();
        let restored: RunTrace =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(restored.len(), 4);
        assert_eq!(restored.last_state(), Some(PipelineState::Accepted));
    }
}
