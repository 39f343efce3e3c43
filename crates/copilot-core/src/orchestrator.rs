//! Pipeline state machine.
//!
//! Stages run in topological waves from the [`StagePlan`]. Every stage result
//! goes through the critic and may be revised up to `max_revisions` times;
//! transient upstream failures are retried with exponential backoff without
//! consuming revisions. All suspension points are bounded by the run's global
//! deadline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentSet};
use crate::config::{Config, CriticConfig, OrchestratorConfig};
use crate::context::{BusinessProfile, SharedContext};
use crate::critic::{Critic, CritiqueVerdict, Rubric};
use crate::error::{AgentError, CopilotError};
use crate::events::EventCollector;
use crate::metrics;
use crate::model::{AgentKind, AgentResult, PipelineState, Task};
use crate::plan::StagePlan;
use crate::report::{Report, StageRecord};
use crate::table::DataTable;
use crate::trace::RunTrace;

/// Terminal `Failed` state of a run.
#[derive(Debug, Error)]
#[error(
    "run {run_id} failed at {}: {error}",
    .stage.map(|kind| kind.as_str()).unwrap_or("input validation")
)]
pub struct PipelineFailure {
    pub run_id: String,
    /// `None` when the run was rejected before any dispatch
    pub stage: Option<AgentKind>,
    pub error: AgentError,
    /// Results accepted before the failure
    pub accepted: BTreeMap<AgentKind, AgentResult>,
    pub trace: RunTrace,
}

enum StageOutcome {
    Accepted {
        result: AgentResult,
        attempts: u32,
        verified: bool,
        note: String,
    },
    Failed(AgentError),
}

/// Single writer of the trace for one run; also forwards progress events.
struct Recorder {
    run_id: String,
    trace: Mutex<RunTrace>,
    events: Option<EventCollector>,
}

impl Recorder {
    fn new(run_id: String, events: Option<EventCollector>) -> Self {
        Self {
            run_id,
            trace: Mutex::new(RunTrace::new()),
            events,
        }
    }

    fn enter(&self, state: PipelineState, kind: Option<AgentKind>, note: impl Into<String>) {
        let note = note.into();
        debug!(run_id = %self.run_id, %state, ?kind, %note, "state transition");
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(state, kind, note);
        if let Some(events) = &self.events {
            events.emit_state(&self.run_id, state, kind);
        }
    }

    fn agent_started(&self, kind: AgentKind, attempt: u32) {
        if let Some(events) = &self.events {
            events.emit_agent_started(kind, attempt);
        }
    }

    fn agent_finished(&self, kind: AgentKind, attempt: u32, result: Option<&AgentResult>, ms: u64) {
        let status = result.map(AgentResult::status);
        metrics::record_agent_run(kind, status, ms);
        if let Some(events) = &self.events {
            events.emit_agent_finished(kind, attempt, status, ms);
        }
    }

    fn verdict(&self, kind: AgentKind, attempt: u32, verdict: &CritiqueVerdict) {
        if let Some(events) = &self.events {
            events.emit_verdict(kind, attempt, verdict.accepted, &verdict.reason);
        }
    }

    fn snapshot(&self) -> RunTrace {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Orchestrator {
    settings: OrchestratorConfig,
    critic_settings: CriticConfig,
    plan: StagePlan,
    waves: Vec<Vec<AgentKind>>,
    agents: AgentSet,
    critic: Arc<dyn Critic>,
    events: Option<EventCollector>,
}

impl Orchestrator {
    /// Orchestrator over the standard research/analysis → strategy → plan pipeline.
    pub fn new(config: &Config, agents: AgentSet, critic: Arc<dyn Critic>) -> Result<Self, CopilotError> {
        Self::with_plan(config, StagePlan::standard(), agents, critic)
    }

    pub fn with_plan(
        config: &Config,
        plan: StagePlan,
        agents: AgentSet,
        critic: Arc<dyn Critic>,
    ) -> Result<Self, CopilotError> {
        let waves = plan.waves()?;
        if let Some(missing) = plan.stages().find(|stage| agents.get(stage.kind).is_none()) {
            return Err(CopilotError::Planning(format!(
                "no agent registered for stage '{}'",
                missing.kind
            )));
        }

        Ok(Self {
            settings: config.orchestrator.clone(),
            critic_settings: config.critic.clone(),
            plan,
            waves,
            agents,
            critic,
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the whole pipeline for one query.
    ///
    /// Returns a [`Report`] whenever every mandatory stage produced a usable
    /// result, even if some sections are unverified or absent.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run(
        &self,
        query: &str,
        profile: BusinessProfile,
        table: Option<DataTable>,
    ) -> Result<Report, PipelineFailure> {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());
        let recorder = Recorder::new(run_id.clone(), self.events.clone());
        let deadline = Instant::now() + self.settings.pipeline_deadline();

        recorder.enter(PipelineState::Started, None, "");
        info!(stages = self.plan.len(), "pipeline started");

        let mut context = SharedContext::new(query, profile, table);

        let rejected = if query.trim().is_empty() {
            Some(AgentError::invalid_input("query must not be empty"))
        } else {
            context.profile().validate().err()
        };
        if let Some(error) = rejected {
            return Err(self.fail(&recorder, &context, None, error));
        }

        let mut records: BTreeMap<AgentKind, StageRecord> = BTreeMap::new();

        for wave in &self.waves {
            let mut tasks = Vec::with_capacity(wave.len());
            for kind in wave {
                let Some(node) = self.plan.get(*kind) else {
                    continue;
                };
                if let Some(missing) = node.requires.iter().find(|dep| !context.has_usable(**dep)) {
                    let error = AgentError::invalid_input(format!(
                        "required input '{missing}' is unavailable"
                    ));
                    return Err(self.fail(&recorder, &context, Some(*kind), error));
                }

                let inputs = node
                    .dependencies()
                    .filter_map(|dep| context.get(dep).map(|result| (dep, result.clone())))
                    .collect();
                tasks.push(Task::new(*kind, query, inputs));
            }

            // Stages in a wave read one immutable snapshot; the context is only
            // written after the whole wave has settled.
            let snapshot = context.clone();
            let outcomes = join_all(
                tasks
                    .iter()
                    .map(|task| self.run_stage(task.clone(), &snapshot, &recorder, deadline)),
            )
            .await;

            let mut first_failure = None;
            for (task, outcome) in tasks.iter().zip(outcomes) {
                let kind = task.kind();
                match outcome {
                    StageOutcome::Accepted {
                        result,
                        attempts,
                        verified,
                        note,
                    } => {
                        recorder.enter(PipelineState::Accepted, Some(kind), note.clone());
                        context.accept(kind, result);
                        records.insert(
                            kind,
                            StageRecord::Accepted {
                                attempts,
                                verified,
                                note,
                            },
                        );
                    }
                    StageOutcome::Failed(error) => {
                        let mandatory = self.plan.get(kind).is_some_and(|node| node.mandatory);
                        if mandatory && first_failure.is_none() {
                            first_failure = Some((kind, error));
                        } else if !mandatory {
                            warn!(%kind, %error, "optional stage failed; section will be absent");
                            records.insert(
                                kind,
                                StageRecord::Absent {
                                    reason: error.to_string(),
                                },
                            );
                        }
                    }
                }
            }

            if let Some((kind, error)) = first_failure {
                return Err(self.fail(&recorder, &context, Some(kind), error));
            }
            if Instant::now() >= deadline {
                let kind = wave.first().copied();
                let error = AgentError::timeout("pipeline deadline elapsed");
                return Err(self.fail(&recorder, &context, kind, error));
            }
        }

        recorder.enter(PipelineState::Completed, None, "");
        metrics::record_pipeline_outcome("completed");
        let report = Report::assemble(
            run_id,
            &context,
            &records,
            self.settings.conflict_tolerance,
            recorder.snapshot(),
        );
        info!(
            sections = report.sections().len(),
            conflicts = report.conflicts().len(),
            unverified = report.confidence_summary().unverified,
            "pipeline completed"
        );
        Ok(report)
    }

    fn fail(
        &self,
        recorder: &Recorder,
        context: &SharedContext,
        stage: Option<AgentKind>,
        error: AgentError,
    ) -> PipelineFailure {
        warn!(stage = ?stage, %error, "pipeline failed");
        recorder.enter(PipelineState::Failed, stage, error.to_string());
        metrics::record_pipeline_outcome("failed");
        PipelineFailure {
            run_id: recorder.run_id.clone(),
            stage,
            error,
            accepted: context.results().clone(),
            trace: recorder.snapshot(),
        }
    }

    /// Invoke, critique and revise one stage until accepted or out of revisions.
    async fn run_stage(
        &self,
        mut task: Task,
        snapshot: &SharedContext,
        recorder: &Recorder,
        deadline: Instant,
    ) -> StageOutcome {
        let kind = task.kind();
        let Some(agent) = self.agents.get(kind) else {
            return StageOutcome::Failed(AgentError::invalid_input(format!(
                "no agent registered for '{kind}'"
            )));
        };
        let rubric = Rubric::for_stage(kind, snapshot, &self.critic_settings);
        let mut best: Option<AgentResult> = None;

        loop {
            let attempt = task.attempt();
            recorder.enter(
                PipelineState::for_stage(kind),
                Some(kind),
                format!("attempt {attempt}"),
            );

            let outcome = match self.invoke(agent.as_ref(), &task, snapshot, recorder, deadline).await {
                Ok(result) if result.is_usable() => Ok(result),
                Ok(result) => Err(result
                    .error()
                    .cloned()
                    .unwrap_or_else(|| AgentError::upstream("agent returned a failed result"))),
                Err(error) => Err(error),
            };

            let result = match outcome {
                Ok(result) => result,
                Err(error) => {
                    // A later attempt failing hard falls back to the best earlier output.
                    return match best {
                        Some(result) if Instant::now() < deadline => StageOutcome::Accepted {
                            result,
                            attempts: attempt,
                            verified: false,
                            note: format!("revision attempt failed: {error}"),
                        },
                        _ => StageOutcome::Failed(error),
                    };
                }
            };

            recorder.enter(PipelineState::Critiquing, Some(kind), "");
            let verdict = match self.review(&result, &rubric, kind, attempt, recorder, deadline).await {
                Ok(verdict) => verdict,
                Err(error) => return StageOutcome::Failed(error),
            };

            if best
                .as_ref()
                .is_none_or(|b| result.confidence_or_zero() >= b.confidence_or_zero())
            {
                best = Some(result.clone());
            }

            if verdict.accepted {
                return StageOutcome::Accepted {
                    result,
                    attempts: attempt,
                    verified: true,
                    note: verdict.reason,
                };
            }

            if attempt > self.settings.max_revisions {
                info!(%kind, attempt, "revision limit reached; keeping best result unverified");
                return StageOutcome::Accepted {
                    result: best.unwrap_or(result),
                    attempts: attempt,
                    verified: false,
                    note: format!("revision limit reached: {}", verdict.reason),
                };
            }

            recorder.enter(PipelineState::Revising, Some(kind), verdict.reason.clone());
            metrics::record_revision(kind);
            let hint = verdict.revision_hint.unwrap_or(verdict.reason);
            task = task.revise(hint);
        }
    }

    /// One agent call with retries for transient upstream failures.
    async fn invoke(
        &self,
        agent: &dyn Agent,
        task: &Task,
        snapshot: &SharedContext,
        recorder: &Recorder,
        deadline: Instant,
    ) -> Result<AgentResult, AgentError> {
        let kind = task.kind();
        let mut backoff = self.settings.initial_backoff();
        let mut retries = 0;

        loop {
            recorder.agent_started(kind, task.attempt());
            let started = Instant::now();
            let call_deadline = (started + self.settings.agent_timeout()).min(deadline);

            let outcome = match timeout_at(call_deadline, agent.run(task, snapshot)).await {
                Ok(outcome) => outcome,
                Err(_) if call_deadline >= deadline => {
                    Err(AgentError::timeout("pipeline deadline elapsed"))
                }
                Err(_) => Err(AgentError::timeout(format!(
                    "{kind} agent exceeded {}ms",
                    self.settings.agent_timeout_ms
                ))),
            };

            let elapsed = started.elapsed().as_millis() as u64;
            recorder.agent_finished(kind, task.attempt(), outcome.as_ref().ok(), elapsed);

            match outcome {
                Err(error) if error.is_retryable() && retries < self.settings.max_retries => {
                    let delay = error
                        .retry_after()
                        .map_or(backoff, |hint| hint.max(backoff));
                    if Instant::now() + delay >= deadline {
                        return Err(error);
                    }
                    retries += 1;
                    warn!(
                        %kind,
                        %error,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "upstream failure, retrying"
                    );
                    metrics::record_retry(kind);
                    sleep(delay).await;
                    backoff = (backoff * 2).min(self.settings.max_backoff());
                }
                other => return other,
            }
        }
    }

    /// Critic verdict, bounded by the deadline. A non-deterministic critic has
    /// to accept the same result twice in a row.
    async fn review(
        &self,
        result: &AgentResult,
        rubric: &Rubric,
        kind: AgentKind,
        attempt: u32,
        recorder: &Recorder,
        deadline: Instant,
    ) -> Result<CritiqueVerdict, AgentError> {
        let mut verdict = self.critique_once(result, rubric, deadline).await?;
        if verdict.accepted && !self.critic.is_deterministic() {
            let confirmation = self.critique_once(result, rubric, deadline).await?;
            if !confirmation.accepted {
                verdict = confirmation;
            }
        }
        recorder.verdict(kind, attempt, &verdict);
        Ok(verdict)
    }

    async fn critique_once(
        &self,
        result: &AgentResult,
        rubric: &Rubric,
        deadline: Instant,
    ) -> Result<CritiqueVerdict, AgentError> {
        timeout_at(deadline, self.critic.critique(result, rubric))
            .await
            .map_err(|_| AgentError::timeout("pipeline deadline elapsed during review"))
    }
}
