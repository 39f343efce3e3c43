//! Stage dependency graph for the consulting pipeline.
//!
//! Each stage is one agent kind with required and optional input kinds. The
//! graph is executed in topological waves: stages in the same wave have no
//! data dependency on each other and may run concurrently.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::CopilotError;
use crate::model::AgentKind;

/// One dispatchable stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNode {
    pub kind: AgentKind,
    /// Inputs that must be accepted before dispatch
    pub requires: Vec<AgentKind>,
    /// Inputs used when available; their absence degrades, never blocks
    pub optional: Vec<AgentKind>,
    /// A hard failure of a mandatory stage fails the pipeline
    pub mandatory: bool,
}

impl StageNode {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            requires: Vec::new(),
            optional: Vec::new(),
            mandatory: true,
        }
    }

    pub fn requires(mut self, kind: AgentKind) -> Self {
        self.requires.push(kind);
        self
    }

    pub fn uses(mut self, kind: AgentKind) -> Self {
        self.optional.push(kind);
        self
    }

    pub fn optional_stage(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn dependencies(&self) -> impl Iterator<Item = AgentKind> + '_ {
        self.requires.iter().chain(self.optional.iter()).copied()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagePlan {
    nodes: BTreeMap<AgentKind, StageNode>,
    /// kind -> kinds that consume it
    edges: BTreeMap<AgentKind, Vec<AgentKind>>,
}

impl StagePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Research and analysis in parallel, then strategy, then the action plan.
    /// Analysis is optional: without usable data the strategy relies on research.
    pub fn standard() -> Self {
        let mut plan = Self::new();
        let stages = [
            StageNode::new(AgentKind::Research),
            StageNode::new(AgentKind::Analyze).optional_stage(),
            StageNode::new(AgentKind::Consult)
                .requires(AgentKind::Research)
                .uses(AgentKind::Analyze),
            StageNode::new(AgentKind::Plan).requires(AgentKind::Consult),
        ];
        for stage in stages {
            // The standard stages are well-formed; add_stage only rejects
            // duplicates, unknown dependencies and critique stages.
            if let Err(err) = plan.add_stage(stage) {
                tracing::error!(error = %err, "standard stage plan rejected a stage");
            }
        }
        plan
    }

    pub fn add_stage(&mut self, node: StageNode) -> Result<(), CopilotError> {
        if node.kind == AgentKind::Critique {
            return Err(CopilotError::Planning(
                "critique is a review step, not a dispatchable stage".to_string(),
            ));
        }
        if self.nodes.contains_key(&node.kind) {
            return Err(CopilotError::Planning(format!(
                "stage '{}' already exists",
                node.kind
            )));
        }
        for dep in node.dependencies() {
            if !self.nodes.contains_key(&dep) {
                return Err(CopilotError::Planning(format!(
                    "dependency '{dep}' not found for stage '{}'",
                    node.kind
                )));
            }
        }

        for dep in node.dependencies() {
            self.edges.entry(dep).or_default().push(node.kind);
        }
        self.nodes.insert(node.kind, node);
        Ok(())
    }

    pub fn get(&self, kind: AgentKind) -> Option<&StageNode> {
        self.nodes.get(&kind)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological layers via Kahn's algorithm. Errors if the graph has a cycle.
    pub fn waves(&self) -> Result<Vec<Vec<AgentKind>>, CopilotError> {
        let mut in_degree: BTreeMap<AgentKind, usize> = self
            .nodes
            .values()
            .map(|node| (node.kind, node.dependencies().count()))
            .collect();

        let mut current: VecDeque<AgentKind> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(kind, _)| *kind)
            .collect();

        let mut waves = Vec::new();
        let mut visited = 0;

        while !current.is_empty() {
            let wave: Vec<AgentKind> = current.drain(..).collect();
            visited += wave.len();

            let mut next = Vec::new();
            for kind in &wave {
                for dependent in self.edges.get(kind).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort();
            next.dedup();
            current.extend(next);
            waves.push(wave);
        }

        if visited != self.nodes.len() {
            return Err(CopilotError::Planning(
                "stage plan contains a cycle".to_string(),
            ));
        }

        Ok(waves)
    }
}
