//! Progress events for a pipeline run.
//!
//! The orchestrator emits one event per state transition, agent call and
//! critic verdict. Consumers (the CLI progress printer, tests) drain the
//! receiver half; emitting never blocks the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{AgentKind, PipelineState, ResultStatus};

pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateEntered {
        event_id: EventId,
        timestamp: u64,
        run_id: String,
        state: PipelineState,
        kind: Option<AgentKind>,
    },
    AgentStarted {
        event_id: EventId,
        timestamp: u64,
        kind: AgentKind,
        attempt: u32,
    },
    AgentFinished {
        event_id: EventId,
        timestamp: u64,
        kind: AgentKind,
        attempt: u32,
        /// `None` when the call produced an error instead of a result
        status: Option<ResultStatus>,
        duration_ms: u64,
    },
    Verdict {
        event_id: EventId,
        timestamp: u64,
        kind: AgentKind,
        attempt: u32,
        accepted: bool,
        reason: String,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::StateEntered { event_id, .. }
            | Event::AgentStarted { event_id, .. }
            | Event::AgentFinished { event_id, .. }
            | Event::Verdict { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Event::StateEntered { timestamp, .. }
            | Event::AgentStarted { timestamp, .. }
            | Event::AgentFinished { timestamp, .. }
            | Event::Verdict { timestamp, .. } => *timestamp,
        }
    }

    /// One-line human description used by progress printers.
    pub fn describe(&self) -> String {
        match self {
            Event::StateEntered { state, kind, .. } => match kind {
                Some(kind) => format!("{state} ({kind})"),
                None => state.to_string(),
            },
            Event::AgentStarted { kind, attempt, .. } => {
                format!("{kind} agent started (attempt {attempt})")
            }
            Event::AgentFinished {
                kind,
                attempt,
                status,
                duration_ms,
                ..
            } => format!(
                "{kind} agent finished attempt {attempt}: {} in {duration_ms}ms",
                status.map(|s| s.as_str()).unwrap_or("error")
            ),
            Event::Verdict {
                kind,
                attempt,
                accepted,
                reason,
                ..
            } => {
                let verdict = if *accepted { "accepted" } else { "rejected" };
                format!("critic {verdict} {kind} attempt {attempt}: {reason}")
            }
        }
    }
}

#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_state(&self, run_id: &str, state: PipelineState, kind: Option<AgentKind>) {
        self.send(Event::StateEntered {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id: run_id.to_string(),
            state,
            kind,
        });
    }

    pub fn emit_agent_started(&self, kind: AgentKind, attempt: u32) {
        self.send(Event::AgentStarted {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
            attempt,
        });
    }

    pub fn emit_agent_finished(
        &self,
        kind: AgentKind,
        attempt: u32,
        status: Option<ResultStatus>,
        duration_ms: u64,
    ) {
        self.send(Event::AgentFinished {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
            attempt,
            status,
            duration_ms,
        });
    }

    pub fn emit_verdict(&self, kind: AgentKind, attempt: u32, accepted: bool, reason: &str) {
        self.send(Event::Verdict {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
            attempt,
            accepted,
            reason: reason.to_string(),
        });
    }

    fn send(&self, event: Event) {
        // A dropped receiver only means nobody is watching progress.
        if self.sender.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

fn generate_event_id() -> EventId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{id}")
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_arrive_in_order() {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit_state("run-1", PipelineState::Researching, Some(AgentKind::Research));
        collector.emit_agent_started(AgentKind::Research, 1);
        collector.emit_verdict(AgentKind::Research, 1, false, "needs citations");

        match receiver.recv().await.unwrap() {
            Event::StateEntered { run_id, state, .. } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(state, PipelineState::Researching);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            receiver.recv().await.unwrap(),
            Event::AgentStarted { attempt: 1, .. }
        ));
        let verdict = receiver.recv().await.unwrap();
        assert_eq!(
            verdict.describe(),
            "critic rejected research attempt 1: needs citations"
        );
    }

    #[test]
    fn emitting_without_receiver_is_silent() {
        let collector = EventCollector::default();
        collector.emit_agent_finished(AgentKind::Plan, 2, Some(ResultStatus::Ok), 12);
    }
}
