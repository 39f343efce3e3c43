use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use copilot_agents::{standard_agents, standard_critic};
use copilot_core::metrics::init_metrics_from_env;
use copilot_core::{
    init_telemetry, log_base_dir, log_run_completion, persist_trace, remove_run_logs,
    BusinessProfile, Config, ConfigLoader, DataTable, EventCollector, HttpLlmClient, LlmClient,
    MemoizedLlm, MemoizedSearch, Orchestrator, Report, RunLogInput, SearchClient,
    TavilySearchClient, TelemetryOptions,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "copilot",
    version,
    about = "Multi-agent business consulting for small businesses"
)]
struct Cli {
    /// Configuration file (defaults to $COPILOT_CONFIG, then ./copilot.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full research → analysis → strategy → plan pipeline.
    Run(RunArgs),
    /// Delete every persisted log line for a run.
    PurgeLogs(PurgeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question the business owner wants answered.
    #[arg(long)]
    query: String,

    #[arg(long)]
    industry: String,

    /// Size band, e.g. micro, small, medium.
    #[arg(long)]
    size_band: String,

    #[arg(long)]
    region: String,

    /// Free-text description of the business.
    #[arg(long)]
    description: Option<String>,

    /// Sales data as CSV, or JSON `{"columns": [...], "rows": [...]}` for `.json` files.
    #[arg(long)]
    data: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    format: OutputFormat,

    /// Write the report here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PurgeArgs {
    /// Run ID whose logs should be removed.
    #[arg(long)]
    run: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions {
        json: cli.json_logs,
        ..TelemetryOptions::with_level(config.logging.level.clone())
    })?;
    init_metrics_from_env("copilot-cli")?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(&config, args).await?,
            Command::PurgeLogs(args) => purge_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(config: &Config, args: RunArgs) -> Result<()> {
    let mut profile = BusinessProfile::new(&args.industry, &args.size_band, &args.region);
    if let Some(description) = &args.description {
        profile = profile.with_description(description);
    }
    let table = args.data.as_deref().map(load_table).transpose()?;

    let llm: Arc<dyn LlmClient> =
        Arc::new(MemoizedLlm::new(HttpLlmClient::from_config(&config.llm)?));
    let search: Arc<dyn SearchClient> =
        Arc::new(MemoizedSearch::new(TavilySearchClient::from_config(&config.search)?));

    let (events, mut receiver) = EventCollector::new();
    let progress = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            info!(target: "progress", "{}", event.describe());
        }
    });

    let orchestrator = Orchestrator::new(
        config,
        standard_agents(config, llm.clone(), search),
        standard_critic(config, llm),
    )?
    .with_events(events);

    info!(query = %args.query, "starting pipeline");
    let outcome = orchestrator.run(&args.query, profile, table).await;
    drop(orchestrator);
    let _ = progress.await;

    let report = match outcome {
        Ok(report) => report,
        Err(failure) => {
            if config.logging.persist_runs {
                if let Err(err) = log_run_completion(RunLogInput::from_failure(&failure, &args.query)) {
                    warn!(error = %err, "failed to persist run log");
                }
            }
            return Err(failure.into());
        }
    };

    if config.logging.persist_runs {
        persist_run(&report);
    }

    let rendered = match args.format {
        OutputFormat::Markdown => report.render_markdown(),
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
    };
    match args.output {
        Some(path) => {
            fs::write(&path, rendered)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn load_table(path: &Path) -> Result<DataTable> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read data file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let table = if is_json {
        DataTable::from_json_str(&raw)
    } else {
        DataTable::from_csv_str(&raw)
    };
    table.with_context(|| format!("failed to parse data file {}", path.display()))
}

/// Trace and run log are best effort; the report is still returned.
fn persist_run(report: &Report) {
    let trace_path = match persist_trace(log_base_dir().join("traces"), report.run_id(), report.trace()) {
        Ok(path) => Some(path.display().to_string()),
        Err(err) => {
            warn!(error = %err, "failed to persist run trace");
            None
        }
    };
    if let Err(err) = log_run_completion(RunLogInput::from_report(report, trace_path)) {
        warn!(error = %err, "failed to persist run log");
    }
}

fn purge_command(args: PurgeArgs) -> Result<()> {
    let removed = remove_run_logs(&args.run)?;
    info!(run = %args.run, removed, "purged run logs");
    println!("removed {removed} log entries for run {}", args.run);
    Ok(())
}
