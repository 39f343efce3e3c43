use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::SharedContext;
use crate::error::AgentError;
use crate::model::{AgentKind, AgentResult, Task};

/// Uniform contract for every specialised agent.
///
/// `run` reads only the task and the context snapshot it is given. Repeating
/// a call with the same task must be safe: agents perform lookups and
/// completions, never writes to external systems.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn run(&self, task: &Task, context: &SharedContext) -> Result<AgentResult, AgentError>;
}

/// Agents available to the orchestrator, one per kind.
#[derive(Clone, Default)]
pub struct AgentSet {
    agents: BTreeMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own kind, replacing any previous one.
    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.kind(), agent);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<&Arc<dyn Agent>> {
        self.agents.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = AgentKind> + '_ {
        self.agents.keys().copied()
    }
}

impl std::fmt::Debug for AgentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.agents.keys()).finish()
    }
}
