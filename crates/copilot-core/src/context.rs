//! Business profile and the per-run shared context.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AgentError;
use crate::model::{AgentKind, AgentResult};
use crate::table::DataTable;

/// Who the advice is for. `industry`, `size_band` and `region` are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub industry: String,
    pub size_band: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_text_description: Option<String>,
}

impl BusinessProfile {
    pub const REQUIRED_FIELDS: [&'static str; 3] = ["industry", "size_band", "region"];

    pub fn new(
        industry: impl Into<String>,
        size_band: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            industry: industry.into(),
            size_band: size_band.into(),
            region: region.into(),
            free_text_description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.free_text_description = Some(description.into());
        self
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let values = [&self.industry, &self.size_band, &self.region];
        Self::REQUIRED_FIELDS
            .iter()
            .zip(values)
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AgentError::invalid_input(format!(
                "business profile is missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    /// One-line description used in prompts and search queries.
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} business ({}) in {}",
            self.industry.trim(),
            self.size_band.trim(),
            self.region.trim()
        );
        if let Some(description) = self
            .free_text_description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        {
            line.push_str(": ");
            line.push_str(description.trim());
        }
        line
    }
}

/// Accepted results of one pipeline run, keyed by agent kind.
///
/// Agents only ever see `&SharedContext` snapshots; the orchestrator is the
/// single writer. Entries are overwritten per kind, never removed.
#[derive(Debug, Clone)]
pub struct SharedContext {
    query: String,
    profile: BusinessProfile,
    table: Option<Arc<DataTable>>,
    results: BTreeMap<AgentKind, AgentResult>,
}

impl SharedContext {
    pub fn new(query: impl Into<String>, profile: BusinessProfile, table: Option<DataTable>) -> Self {
        Self {
            query: query.into(),
            profile,
            table: table.map(Arc::new),
            results: BTreeMap::new(),
        }
    }

    /// Builder used to prepare a snapshot that already holds accepted results.
    pub fn seeded_with(mut self, kind: AgentKind, result: AgentResult) -> Self {
        self.accept(kind, result);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn profile(&self) -> &BusinessProfile {
        &self.profile
    }

    pub fn table(&self) -> Option<&DataTable> {
        self.table.as_deref()
    }

    pub fn get(&self, kind: AgentKind) -> Option<&AgentResult> {
        self.results.get(&kind)
    }

    pub fn has_usable(&self, kind: AgentKind) -> bool {
        self.get(kind).is_some_and(AgentResult::is_usable)
    }

    pub fn results(&self) -> &BTreeMap<AgentKind, AgentResult> {
        &self.results
    }

    /// Record an accepted result. Failed results never enter the context.
    pub(crate) fn accept(&mut self, kind: AgentKind, result: AgentResult) -> bool {
        if !result.is_usable() {
            warn!(%kind, "refusing to store failed result in shared context");
            return false;
        }
        self.results.insert(kind, result);
        true
    }
}
