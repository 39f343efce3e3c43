use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use copilot_core::{
    ActionItem, Agent, AgentError, AgentErrorKind, AgentKind, AgentResult, AgentSet,
    BusinessProfile, Citation, Config, Critic, CritiqueVerdict, Event, EventCollector, Figure,
    Orchestrator, Payload, PipelineState, Priority, ResolutionRule, Rubric, SectionStatus,
    SharedContext, StageNode, StagePlan, Task,
};

type Script = Box<dyn Fn(&Task) -> Result<AgentResult, AgentError> + Send + Sync>;

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct ScriptedAgent {
    kind: AgentKind,
    script: Script,
    delay: Duration,
    hang: bool,
    attempts: Mutex<Vec<u32>>,
    inputs_seen: Mutex<Vec<Vec<AgentKind>>>,
    gauge: Option<Arc<Gauge>>,
}

impl ScriptedAgent {
    fn new(
        kind: AgentKind,
        script: impl Fn(&Task) -> Result<AgentResult, AgentError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            script: Box::new(script),
            delay: Duration::ZERO,
            hang: false,
            attempts: Mutex::new(Vec::new()),
            inputs_seen: Mutex::new(Vec::new()),
            gauge: None,
        }
    }

    fn delayed(mut self, delay: Duration, gauge: Arc<Gauge>) -> Self {
        self.delay = delay;
        self.gauge = Some(gauge);
        self
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn calls(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, task: &Task, _context: &SharedContext) -> Result<AgentResult, AgentError> {
        self.attempts.lock().unwrap().push(task.attempt());
        self.inputs_seen
            .lock()
            .unwrap()
            .push(task.inputs().keys().copied().collect());

        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gauge) = &self.gauge {
            let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.current.fetch_sub(1, Ordering::SeqCst);
        }
        (self.script)(task)
    }
}

struct RubricCritic;

#[async_trait]
impl Critic for RubricCritic {
    async fn critique(&self, result: &AgentResult, rubric: &Rubric) -> CritiqueVerdict {
        rubric.evaluate(result)
    }
}

fn research_result(revenue: f64, confidence: f64) -> AgentResult {
    AgentResult::ok(
        Payload {
            summary: "Independent coffee shops in mid-size towns report steady demand.".into(),
            citations: vec![Citation {
                title: "Coffee industry outlook".into(),
                url: "https://example.com/coffee".into(),
                snippet: "Typical revenue of $200,000 per year".into(),
                published_date: None,
                relevance: 0.8,
            }],
            figures: vec![Figure::new("revenue", revenue)],
            ..Payload::default()
        },
        Some(confidence),
    )
}

fn analysis_result(revenue: f64, confidence: f64) -> AgentResult {
    AgentResult::ok(
        Payload {
            summary: "Sales data shows revenue concentrated in espresso drinks.".into(),
            figures: vec![
                Figure::new("revenue", revenue),
                Figure::new("gross_margin_pct", 62.5),
            ],
            ..Payload::default()
        },
        Some(confidence),
    )
}

/// Strategy quoting the first analysis figure when one was provided.
fn consult_from(task: &Task) -> Result<AgentResult, AgentError> {
    let grounding = task
        .input(AgentKind::Analyze)
        .and_then(|analysis| analysis.payload().figures.first())
        .map(|figure| format!(" Current revenue is {}.", figure.display_value()))
        .unwrap_or_default();
    Ok(AgentResult::ok(
        Payload::with_summary(format!(
            "Introduce a loyalty program and afternoon pastry bundles.{grounding}"
        )),
        Some(0.75),
    ))
}

fn plan_result(items: usize, confidence: f64) -> AgentResult {
    let action_items = (0..items)
        .map(|idx| ActionItem {
            action: format!("Action {idx}"),
            owner: Some("Owner".into()),
            timeframe: Some(format!("Week {}", idx + 1)),
            expected_outcome: Some("More repeat visits".into()),
            priority: Priority::High,
        })
        .collect();
    AgentResult::ok(
        Payload {
            summary: "Four week plan focused on repeat customers and pastry sales.".into(),
            action_items,
            ..Payload::default()
        },
        Some(confidence),
    )
}

fn profile() -> BusinessProfile {
    BusinessProfile::new("Coffee shop", "small", "Mid-size town")
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.initial_backoff_ms = 1;
    config.orchestrator.max_backoff_ms = 5;
    config.orchestrator.pipeline_deadline_ms = 5_000;
    config
}

struct Agents {
    research: Arc<ScriptedAgent>,
    analyze: Arc<ScriptedAgent>,
    consult: Arc<ScriptedAgent>,
    plan: Arc<ScriptedAgent>,
}

impl Agents {
    fn happy() -> Self {
        Self {
            research: Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
                Ok(research_result(200_000.0, 0.7))
            })),
            analyze: Arc::new(ScriptedAgent::new(AgentKind::Analyze, |_| {
                Ok(analysis_result(200_000.0, 0.9))
            })),
            consult: Arc::new(ScriptedAgent::new(AgentKind::Consult, consult_from)),
            plan: Arc::new(ScriptedAgent::new(AgentKind::Plan, |_| Ok(plan_result(3, 0.8)))),
        }
    }

    fn set(&self) -> AgentSet {
        AgentSet::new()
            .with(self.research.clone())
            .with(self.analyze.clone())
            .with(self.consult.clone())
            .with(self.plan.clone())
    }

    fn orchestrator(&self, config: &Config) -> Orchestrator {
        Orchestrator::new(config, self.set(), Arc::new(RubricCritic)).unwrap()
    }
}

const QUERY: &str = "coffee shop in a mid-size town, revenue $200k/year";

#[tokio::test]
async fn coffee_shop_run_completes_with_verified_sections() {
    let gauge = Arc::new(Gauge::default());
    let mut agents = Agents::happy();
    agents.research = Arc::new(
        ScriptedAgent::new(AgentKind::Research, |_| Ok(research_result(200_000.0, 0.7)))
            .delayed(Duration::from_millis(50), gauge.clone()),
    );
    agents.analyze = Arc::new(
        ScriptedAgent::new(AgentKind::Analyze, |_| Ok(analysis_result(200_000.0, 0.9)))
            .delayed(Duration::from_millis(50), gauge.clone()),
    );

    let report = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2, "research and analysis overlap");
    assert_eq!(report.sections().len(), 4);
    assert!(report
        .sections()
        .values()
        .all(|section| section.status == SectionStatus::Verified));
    assert!(!report.has_unverified_sections());
    assert!(report.conflicts().is_empty());

    let strategy = report.section(AgentKind::Consult).unwrap();
    assert!(strategy.summary.contains("200,000"));
    let plan = report.section(AgentKind::Plan).unwrap();
    assert!(plan.payload.as_ref().unwrap().action_items.len() >= 3);
    assert_eq!(report.citations().len(), 1);

    let consult_inputs = agents.consult.inputs_seen.lock().unwrap()[0].clone();
    assert_eq!(consult_inputs, vec![AgentKind::Research, AgentKind::Analyze]);

    let states: Vec<PipelineState> = report.trace().transitions().iter().map(|t| t.state).collect();
    assert_eq!(states.first(), Some(&PipelineState::Started));
    assert_eq!(states.last(), Some(&PipelineState::Completed));
    let consulting = states.iter().position(|s| *s == PipelineState::Consulting).unwrap();
    let analyzing = states.iter().position(|s| *s == PipelineState::Analyzing).unwrap();
    assert!(analyzing < consulting);
}

#[tokio::test]
async fn empty_table_leaves_analysis_absent_and_strategy_proceeds() {
    let mut agents = Agents::happy();
    agents.analyze = Arc::new(ScriptedAgent::new(AgentKind::Analyze, |_| {
        Err(AgentError::invalid_input("table has no rows"))
    }));

    let report = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    let analysis = report.section(AgentKind::Analyze).unwrap();
    assert!(matches!(&analysis.status, SectionStatus::Absent { reason } if reason.contains("no rows")));
    assert!(analysis.payload.is_none());
    assert_eq!(agents.analyze.calls(), 1, "invalid input is never retried");

    let consult_inputs = agents.consult.inputs_seen.lock().unwrap()[0].clone();
    assert_eq!(consult_inputs, vec![AgentKind::Research]);
    assert_eq!(
        report.section(AgentKind::Consult).unwrap().status,
        SectionStatus::Verified
    );
    assert_eq!(report.confidence_summary().absent, 1);
}

#[tokio::test]
async fn revision_cap_keeps_highest_confidence_result_unverified() {
    let mut agents = Agents::happy();
    agents.plan = Arc::new(ScriptedAgent::new(AgentKind::Plan, |task| {
        let confidence = match task.attempt() {
            2 => 0.9,
            _ => 0.4,
        };
        Ok(plan_result(2, confidence))
    }));

    let report = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    assert_eq!(agents.plan.attempts(), vec![1, 2, 3]);
    let plan = report.section(AgentKind::Plan).unwrap();
    assert!(matches!(&plan.status, SectionStatus::Unverified { reason } if reason.contains("revision limit")));
    assert_eq!(plan.attempts, 3);
    assert_eq!(plan.confidence, Some(0.9));
    assert!(report.has_unverified_sections());
}

#[tokio::test]
async fn rejected_result_is_revised_with_hint() {
    let mut agents = Agents::happy();
    agents.plan = Arc::new(ScriptedAgent::new(AgentKind::Plan, |task| {
        match task.revision_hint() {
            Some(hint) if hint.contains("owner") => Ok(plan_result(4, 0.8)),
            _ => Ok(plan_result(1, 0.8)),
        }
    }));

    let mut config = fast_config();
    config.orchestrator.max_revisions = 1;
    let report = agents
        .orchestrator(&config)
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    assert_eq!(agents.plan.attempts(), vec![1, 2]);
    let plan = report.section(AgentKind::Plan).unwrap();
    assert_eq!(plan.status, SectionStatus::Verified);
    assert_eq!(plan.attempts, 2);
    assert!(report
        .trace()
        .states_for(AgentKind::Plan)
        .contains(&PipelineState::Revising));
}

#[tokio::test]
async fn attempts_never_exceed_revision_cap() {
    for max_revisions in 0..=3 {
        let mut agents = Agents::happy();
        agents.research = Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
            Ok(AgentResult::ok(Payload::with_summary("too short"), Some(0.5)))
        }));
        let mut config = fast_config();
        config.orchestrator.max_revisions = max_revisions;

        let report = agents.orchestrator(&config).run(QUERY, profile(), None).await.unwrap();
        let attempts = agents.research.attempts();
        assert_eq!(attempts.len() as u32, max_revisions + 1);
        assert!(attempts.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(
            report.section(AgentKind::Research).unwrap().status.label(),
            "unverified"
        );
    }
}

#[tokio::test]
async fn required_stage_failure_fails_pipeline_before_dependents() {
    let mut agents = Agents::happy();
    agents.research = Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
        Err(AgentError::upstream("search returned HTTP 401").permanent())
    }));

    let failure = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Some(AgentKind::Research));
    assert_eq!(failure.error.kind, AgentErrorKind::UpstreamError);
    assert_eq!(agents.research.calls(), 1, "permanent errors are not retried");
    assert_eq!(agents.consult.calls(), 0);
    assert_eq!(agents.plan.calls(), 0);
    assert!(failure.accepted.contains_key(&AgentKind::Analyze));
    assert_eq!(failure.trace.last_state(), Some(PipelineState::Failed));
    assert!(failure.to_string().contains("failed at research"));
}

#[tokio::test]
async fn invalid_profile_is_rejected_before_dispatch() {
    let agents = Agents::happy();
    let failure = agents
        .orchestrator(&fast_config())
        .run(QUERY, BusinessProfile::new("Coffee shop", "", "Somewhere"), None)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, None);
    assert_eq!(failure.error.kind, AgentErrorKind::InvalidInput);
    assert!(failure.error.message.contains("size_band"));
    assert_eq!(agents.research.calls() + agents.analyze.calls(), 0);
    assert!(failure.to_string().contains("input validation"));
}

#[tokio::test]
async fn transient_upstream_errors_are_retried_without_revisions() {
    let mut agents = Agents::happy();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    agents.research = Arc::new(ScriptedAgent::new(AgentKind::Research, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(AgentError::upstream("HTTP 503").with_retry_after(Duration::from_millis(2)))
        } else {
            Ok(research_result(200_000.0, 0.7))
        }
    }));

    let report = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(agents.research.attempts(), vec![1, 1, 1]);
    let research = report.section(AgentKind::Research).unwrap();
    assert_eq!(research.status, SectionStatus::Verified);
    assert_eq!(research.attempts, 1);
}

#[tokio::test]
async fn hanging_agent_hits_the_deadline_instead_of_hanging() {
    let mut agents = Agents::happy();
    agents.research = Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
        Ok(research_result(1.0, 1.0))
    }).hanging());

    let mut config = fast_config();
    config.orchestrator.pipeline_deadline_ms = 150;
    let orchestrator = agents.orchestrator(&config);

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(QUERY, profile(), None),
    )
    .await
    .expect("pipeline must terminate");

    let failure = outcome.unwrap_err();
    assert_eq!(failure.error.kind, AgentErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(
        failure.accepted.contains_key(&AgentKind::Analyze),
        "results accepted before the deadline are preserved"
    );
}

#[tokio::test]
async fn disagreeing_figures_are_recorded_as_conflicts() {
    let mut agents = Agents::happy();
    agents.research = Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
        Ok(research_result(200_000.0, 0.8))
    }));
    agents.analyze = Arc::new(ScriptedAgent::new(AgentKind::Analyze, |_| {
        Ok(analysis_result(150_000.0, 0.8))
    }));

    let report = agents
        .orchestrator(&fast_config())
        .run(QUERY, profile(), None)
        .await
        .unwrap();

    assert_eq!(report.conflicts().len(), 1);
    let conflict = &report.conflicts()[0];
    assert_eq!(conflict.metric, "revenue");
    assert_eq!(conflict.preferred, AgentKind::Analyze);
    assert_eq!(conflict.rule, ResolutionRule::StructuredSource);
    let values: Vec<f64> = conflict.values.iter().map(|v| v.value).collect();
    assert!(values.contains(&200_000.0) && values.contains(&150_000.0));
    assert!(report.render_markdown().contains("Conflicting Figures"));
}

/// Accepts, then rejects the confirmation, then accepts everything.
struct WaveringCritic {
    calls: AtomicU32,
}

#[async_trait]
impl Critic for WaveringCritic {
    async fn critique(&self, _result: &AgentResult, _rubric: &Rubric) -> CritiqueVerdict {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            1 => CritiqueVerdict::reject("second look found gaps", "add detail"),
            _ => CritiqueVerdict::accept("looks fine"),
        }
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn nondeterministic_critic_needs_two_consecutive_accepts() {
    let research = Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
        Ok(research_result(200_000.0, 0.7))
    }));
    let mut plan = StagePlan::new();
    plan.add_stage(StageNode::new(AgentKind::Research)).unwrap();
    let critic = Arc::new(WaveringCritic {
        calls: AtomicU32::new(0),
    });

    let (events, mut receiver) = EventCollector::new();
    let orchestrator = Orchestrator::with_plan(
        &fast_config(),
        plan,
        AgentSet::new().with(research.clone()),
        critic.clone(),
    )
    .unwrap()
    .with_events(events);

    let report = orchestrator.run(QUERY, profile(), None).await.unwrap();

    assert_eq!(research.attempts(), vec![1, 2]);
    assert_eq!(critic.calls.load(Ordering::SeqCst), 4);
    let section = report.section(AgentKind::Research).unwrap();
    assert_eq!(section.status, SectionStatus::Verified);
    assert_eq!(section.attempts, 2);

    let mut verdicts = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let Event::Verdict { accepted, .. } = event {
            verdicts.push(accepted);
        }
    }
    assert_eq!(verdicts, vec![false, true]);
}

#[test]
fn orchestrator_requires_an_agent_per_stage() {
    let agents = AgentSet::new().with(Arc::new(ScriptedAgent::new(AgentKind::Research, |_| {
        Ok(research_result(1.0, 1.0))
    })));
    let err = Orchestrator::new(&Config::default(), agents, Arc::new(RubricCritic))
        .err()
        .unwrap();
    assert!(err.to_string().contains("no agent registered"));
}
