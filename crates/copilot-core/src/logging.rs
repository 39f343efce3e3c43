use std::collections::{BTreeMap, HashSet};
use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

use crate::orchestrator::PipelineFailure;
use crate::report::Report;

const LOG_DIR_ENV: &str = "COPILOT_LOG_DIR";
const RETENTION_ENV: &str = "COPILOT_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;
const RUN_LOG_FILE: &str = "runs.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("api_key", r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("secret", r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("bearer", r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)"),
        ("sk_token", r"(sk-[A-Za-z0-9]{16,})"),
        ("tavily_token", r"(tvly-[A-Za-z0-9]{16,})"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|regex| (name, regex)))
    .collect()
});

/// What gets persisted about one finished run.
#[derive(Debug, Clone)]
pub struct RunLogInput {
    pub run_id: String,
    pub query: String,
    pub outcome: String,
    pub summary: String,
    pub failed_stage: Option<String>,
    pub sections: BTreeMap<String, String>,
    pub sources: Vec<String>,
    pub trace_path: Option<String>,
}

impl RunLogInput {
    pub fn from_report(report: &Report, trace_path: Option<String>) -> Self {
        let summary = report
            .sections()
            .values()
            .rev()
            .find(|section| !section.summary.is_empty())
            .map(|section| section.summary.clone())
            .unwrap_or_default();

        Self {
            run_id: report.run_id().to_string(),
            query: report.query().to_string(),
            outcome: "completed".to_string(),
            summary,
            failed_stage: None,
            sections: report
                .sections()
                .iter()
                .map(|(kind, section)| (kind.to_string(), section.status.label().to_string()))
                .collect(),
            sources: report.citations().iter().map(|c| c.url.clone()).collect(),
            trace_path,
        }
    }

    pub fn from_failure(failure: &PipelineFailure, query: &str) -> Self {
        Self {
            run_id: failure.run_id.clone(),
            query: query.to_string(),
            outcome: "failed".to_string(),
            summary: failure.error.to_string(),
            failed_stage: failure.stage.map(|kind| kind.to_string()),
            sections: failure
                .accepted
                .keys()
                .map(|kind| (kind.to_string(), "accepted".to_string()))
                .collect(),
            sources: failure
                .accepted
                .values()
                .flat_map(|result| result.payload().citations.iter())
                .map(|c| c.url.clone())
                .collect(),
            trace_path: None,
        }
    }
}

#[derive(Serialize)]
struct RunLogRecord {
    timestamp: String,
    run_id: String,
    query: String,
    outcome: String,
    summary: String,
    failed_stage: Option<String>,
    sections: BTreeMap<String, String>,
    sources: Vec<String>,
    trace_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    run_id: String,
    redactions: Vec<String>,
}

pub fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Mask anything that looks like a credential. Names of the patterns that
/// matched are collected into `redactions`.
pub fn sanitize_text(input: &str, redactions: &mut HashSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert((*name).to_string());
        }
    }
    output
}

/// Append a run record under the directory from `COPILOT_LOG_DIR`.
pub fn log_run_completion(input: RunLogInput) -> Result<PathBuf> {
    log_run_completion_in(&log_base_dir(), input)
}

/// Append a run record to `<base>/YYYY/MM/runs.jsonl` and prune old logs.
pub fn log_run_completion_in(base_dir: &Path, input: RunLogInput) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = HashSet::new();

    let query = sanitize_text(&input.query, &mut redactions);
    let summary = sanitize_text(&input.summary, &mut redactions);
    let sources: Vec<String> = input
        .sources
        .iter()
        .map(|source| sanitize_text(source, &mut redactions))
        .collect();

    let mut redactions: Vec<String> = redactions.into_iter().collect();
    redactions.sort();

    let record = RunLogRecord {
        timestamp: timestamp.to_rfc3339(),
        run_id: input.run_id.clone(),
        query,
        outcome: input.outcome,
        summary,
        failed_stage: input.failed_stage,
        sections: input.sections,
        sources,
        trace_path: input.trace_path,
        redactions,
    };

    let month_dir = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    let run_log_path = month_dir.join(RUN_LOG_FILE);
    append_json_line(&run_log_path, &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            run_id: input.run_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            run_id = %input.run_id,
            fields = ?record.redactions,
            "redacted potential secrets from run log"
        );
    }

    enforce_retention(base_dir, retention_days())?;
    Ok(run_log_path)
}

fn enforce_retention(base_dir: &Path, retention: u64) -> Result<()> {
    if retention == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata.modified().is_ok_and(|time| time < cutoff)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

pub fn remove_run_logs(run_id: &str) -> Result<usize> {
    remove_run_logs_in(&log_base_dir(), run_id)
}

/// Delete every record of `run_id`. Returns the number of lines removed.
pub fn remove_run_logs_in(base_dir: &Path, run_id: &str) -> Result<usize> {
    if !base_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for year_entry in fs::read_dir(base_dir)? {
        let year_entry = year_entry?;
        if !year_entry.file_type()?.is_dir() {
            continue;
        }
        for month_entry in fs::read_dir(year_entry.path())? {
            let month_entry = month_entry?;
            if !month_entry.file_type()?.is_dir() {
                continue;
            }
            for name in [RUN_LOG_FILE, AUDIT_LOG_FILE] {
                let path = month_entry.path().join(name);
                removed += rewrite_jsonl_without(&path, run_id)?;
                cleanup_empty_file(&path)?;
            }
            if month_entry.path().read_dir()?.next().is_none() {
                fs::remove_dir(month_entry.path()).ok();
            }
        }
        if year_entry.path().read_dir()?.next().is_none() {
            fs::remove_dir(year_entry.path()).ok();
        }
    }

    Ok(removed)
}

fn rewrite_jsonl_without(path: &Path, run_id: &str) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }

    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut retained = Vec::new();
    let mut removed = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let matches = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .is_some_and(|value| value.get("run_id").and_then(|v| v.as_str()) == Some(run_id));
        if matches {
            removed += 1;
        } else {
            retained.push(line);
        }
    }

    if removed > 0 {
        let file = File::create(path)
            .with_context(|| format!("failed to rewrite log file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for line in retained {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
    }

    Ok(removed)
}

fn cleanup_empty_file(path: &Path) -> Result<()> {
    if path.exists() && path.metadata()?.len() == 0 {
        fs::remove_file(path).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input(run_id: &str) -> RunLogInput {
        RunLogInput {
            run_id: run_id.to_string(),
            query: "Grow my cafe, api_key=abcd1234".to_string(),
            outcome: "completed".to_string(),
            summary: "Summary with secret=topsecret".to_string(),
            failed_stage: None,
            sections: BTreeMap::from([("research".to_string(), "verified".to_string())]),
            sources: vec!["https://example.com/?token=sk-abcdef1234567890XYZ".to_string()],
            trace_path: None,
        }
    }

    #[test]
    fn run_log_is_sanitized_and_audited() -> Result<()> {
        let temp = TempDir::new()?;
        let path = log_run_completion_in(temp.path(), input("run-a"))?;
        assert!(path.ends_with(RUN_LOG_FILE));

        let line = fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["run_id"], "run-a");
        assert_eq!(record["query"], "Grow my cafe, api_key=[REDACTED]");
        assert!(record["summary"].as_str().unwrap().contains("[REDACTED]"));
        assert!(!record["sources"][0].as_str().unwrap().contains("sk-abcdef"));
        assert_eq!(record["sections"]["research"], "verified");

        let audit = path.parent().unwrap().join(AUDIT_LOG_FILE);
        assert!(audit.exists());
        Ok(())
    }

    #[test]
    fn purge_removes_only_the_requested_run() -> Result<()> {
        let temp = TempDir::new()?;
        let path = log_run_completion_in(temp.path(), input("run-a"))?;
        log_run_completion_in(temp.path(), input("run-b"))?;

        let removed = remove_run_logs_in(temp.path(), "run-a")?;
        assert_eq!(removed, 2, "run line and audit line");

        let remaining = fs::read_to_string(&path)?;
        assert!(remaining.contains("run-b"));
        assert!(!remaining.contains("run-a"));
        Ok(())
    }

    #[test]
    fn purging_last_run_cleans_directories() -> Result<()> {
        let temp = TempDir::new()?;
        log_run_completion_in(temp.path(), input("only"))?;
        remove_run_logs_in(temp.path(), "only")?;
        assert!(temp.path().read_dir()?.next().is_none());
        Ok(())
    }
}
