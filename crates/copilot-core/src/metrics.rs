use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use tracing::info;

use crate::model::{AgentKind, ResultStatus};

struct PipelineMetrics {
    agent_runs: Counter<u64>,
    agent_duration_ms: Histogram<f64>,
    revisions: Counter<u64>,
    retries: Counter<u64>,
    pipelines: Counter<u64>,
}

static METRICS: OnceCell<PipelineMetrics> = OnceCell::new();

fn handles() -> &'static PipelineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("copilot.pipeline");
        PipelineMetrics {
            agent_runs: meter
                .u64_counter("agent_runs_total")
                .with_description("Agent invocations by kind and status")
                .init(),
            agent_duration_ms: meter
                .f64_histogram("agent_duration_ms")
                .with_description("Agent invocation latency in milliseconds")
                .init(),
            revisions: meter
                .u64_counter("agent_revisions_total")
                .with_description("Critic-requested revisions by stage")
                .init(),
            retries: meter
                .u64_counter("agent_retries_total")
                .with_description("Upstream retries by stage")
                .init(),
            pipelines: meter
                .u64_counter("pipeline_runs_total")
                .with_description("Pipeline runs by terminal outcome")
                .init(),
        }
    })
}

/// Log where OTEL export is expected to be configured. The meter provider
/// itself is installed by the deployment.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("COPILOT_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "COPILOT_OTEL_METRICS_ENDPOINT detected for {service_name}; install an OTLP meter provider to export pipeline metrics"
        );
    }
    Ok(())
}

pub fn record_agent_run(kind: AgentKind, status: Option<ResultStatus>, duration_ms: u64) {
    let metrics = handles();
    let status = status.map(|s| s.as_str()).unwrap_or("error");
    let attrs = [
        KeyValue::new("agent", kind.as_str()),
        KeyValue::new("status", status),
    ];
    metrics.agent_runs.add(1, &attrs);
    metrics.agent_duration_ms.record(duration_ms as f64, &attrs);
}

pub fn record_revision(kind: AgentKind) {
    handles()
        .revisions
        .add(1, &[KeyValue::new("agent", kind.as_str())]);
}

pub fn record_retry(kind: AgentKind) {
    handles()
        .retries
        .add(1, &[KeyValue::new("agent", kind.as_str())]);
}

pub fn record_pipeline_outcome(outcome: &'static str) {
    handles()
        .pipelines
        .add(1, &[KeyValue::new("outcome", outcome)]);
}
