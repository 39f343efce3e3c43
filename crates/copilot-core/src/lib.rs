//! Orchestration engine for the MSME business copilot.
//!
//! The [`Orchestrator`] sequences specialised agents (web research, data
//! analysis, strategy, action planning) over a shared context, gates every
//! result through a [`Critic`] and aggregates accepted output into a
//! read-only [`Report`].

mod agent;
mod config;
mod context;
mod critic;
mod error;
mod events;
mod http;
mod llm;
mod logging;
mod memo;
pub mod metrics;
mod model;
mod orchestrator;
mod plan;
mod report;
mod search;
mod security;
mod table;
mod telemetry;
mod trace;

pub use agent::{Agent, AgentSet};
pub use config::{
    Config, ConfigLoader, CriticConfig, LlmConfig, LoggingConfig, OrchestratorConfig,
    SearchConfig,
};
pub use context::{BusinessProfile, SharedContext};
pub use critic::{Critic, CritiqueVerdict, Rubric, RubricCheck};
pub use error::{AgentError, AgentErrorKind, CopilotError};
pub use events::{Event, EventCollector, EventId};
pub use http::{classify_status, classify_transport, parse_retry_after};
pub use llm::{CompletionRequest, CompletionResponse, HttpLlmClient, LlmClient};
pub use logging::{
    log_base_dir, log_run_completion, log_run_completion_in, remove_run_logs,
    remove_run_logs_in, sanitize_text, RunLogInput,
};
pub use memo::{MemoizedLlm, MemoizedSearch};
pub use model::{
    format_number, ActionItem, AgentKind, AgentResult, ChartKind, ChartSeries, ChartSpec,
    Citation, Figure, Payload, PipelineState, Priority, ResultStatus, Task,
};
pub use orchestrator::{Orchestrator, PipelineFailure};
pub use plan::{StageNode, StagePlan};
pub use report::{
    detect_conflicts, ConfidenceSummary, Conflict, ConflictValue, Report, ReportSection,
    ResolutionRule, SectionStatus,
};
pub use search::{parse_published_date, SearchClient, SearchHit, SearchRequest, TavilySearchClient};
pub use security::{require_env, SecretValue};
pub use table::{ColumnStats, DataTable, KNOWN_NUMERIC_COLUMNS};
pub use telemetry::{init_telemetry, TelemetryOptions};
pub use trace::{persist_trace, RunTrace, Transition};
