use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{require_env, CopilotError, SecretValue};

const DEFAULT_CONFIG_PATH: &str = "copilot.toml";
const CONFIG_PATH_ENV: &str = "COPILOT_CONFIG";

/// Top-level configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub critic: CriticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the LLM secret (environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, CopilotError> {
        require_env(&self.llm.api_key_env)
    }

    /// Resolve the search secret (environment only).
    pub fn search_api_key(&self) -> Result<SecretValue, CopilotError> {
        require_env(&self.search.api_key_env)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `COPILOT_CONFIG` environment variable.
    /// 3. `copilot.toml` in the current working directory, if it exists.
    ///
    /// Without any file the built-in defaults are used.
    pub fn load(path: Option<PathBuf>) -> Result<Config, CopilotError> {
        let config = match resolve_path(path) {
            Some(candidate) => {
                let raw = fs::read_to_string(&candidate)
                    .map_err(|err| CopilotError::config_io(candidate.clone(), err))?;
                Self::parse(&raw)?
            }
            None => Config::default(),
        };

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Config, CopilotError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| CopilotError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), CopilotError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(CopilotError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.search.api_key_env.trim().is_empty() {
            return Err(CopilotError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }

        let orchestrator = &config.orchestrator;
        if orchestrator.agent_timeout_ms == 0 || orchestrator.pipeline_deadline_ms == 0 {
            return Err(CopilotError::InvalidConfiguration(
                "orchestrator timeouts must be greater than zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&orchestrator.conflict_tolerance) {
            return Err(CopilotError::InvalidConfiguration(
                "orchestrator.conflict_tolerance must be within [0, 1)".into(),
            ));
        }
        if orchestrator.initial_backoff_ms > orchestrator.max_backoff_ms {
            return Err(CopilotError::InvalidConfiguration(
                "orchestrator.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&config.critic.min_confidence) {
            return Err(CopilotError::InvalidConfiguration(
                "critic.min_confidence must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }

    let fallback = Path::new(DEFAULT_CONFIG_PATH);
    fallback.exists().then(|| fallback.to_path_buf())
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_provider")]
    pub provider: String,
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LlmConfig::default_model")]
    pub model: String,
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "LlmConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "LlmConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    fn default_provider() -> String {
        "openai-compatible".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    fn default_api_key_env() -> String {
        "LLM_API_KEY".to_string()
    }

    const fn default_temperature() -> f32 {
        0.4
    }

    const fn default_max_tokens() -> u32 {
        2048
    }

    const fn default_timeout_ms() -> u64 {
        30_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            temperature: Self::default_temperature(),
            max_tokens: Self::default_max_tokens(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "SearchConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "SearchConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "SearchConfig::default_max_results")]
    pub max_results: usize,
    #[serde(default = "SearchConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SearchConfig {
    fn default_base_url() -> String {
        "https://api.tavily.com".to_string()
    }

    fn default_api_key_env() -> String {
        "TAVILY_API_KEY".to_string()
    }

    const fn default_max_results() -> usize {
        5
    }

    const fn default_timeout_ms() -> u64 {
        15_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key_env: Self::default_api_key_env(),
            max_results: Self::default_max_results(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// Revision, retry and deadline policy for a pipeline run.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Critic-driven revisions allowed per stage
    #[serde(default = "OrchestratorConfig::default_max_revisions")]
    pub max_revisions: u32,
    /// Retries of a retryable upstream failure per attempt
    #[serde(default = "OrchestratorConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "OrchestratorConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "OrchestratorConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Budget for a single agent call
    #[serde(default = "OrchestratorConfig::default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Budget for the whole run
    #[serde(default = "OrchestratorConfig::default_pipeline_deadline_ms")]
    pub pipeline_deadline_ms: u64,
    /// Relative difference above which two figures conflict
    #[serde(default = "OrchestratorConfig::default_conflict_tolerance")]
    pub conflict_tolerance: f64,
}

impl OrchestratorConfig {
    const fn default_max_revisions() -> u32 {
        2
    }

    const fn default_max_retries() -> u32 {
        2
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        8_000
    }

    const fn default_agent_timeout_ms() -> u64 {
        60_000
    }

    const fn default_pipeline_deadline_ms() -> u64 {
        300_000
    }

    const fn default_conflict_tolerance() -> f64 {
        0.10
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn pipeline_deadline(&self) -> Duration {
        Duration::from_millis(self.pipeline_deadline_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_revisions: Self::default_max_revisions(),
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            agent_timeout_ms: Self::default_agent_timeout_ms(),
            pipeline_deadline_ms: Self::default_pipeline_deadline_ms(),
            conflict_tolerance: Self::default_conflict_tolerance(),
        }
    }
}

/// Thresholds used to build per-stage rubrics.
#[derive(Debug, Clone, Deserialize)]
pub struct CriticConfig {
    #[serde(default = "CriticConfig::default_min_citations")]
    pub min_citations: usize,
    #[serde(default = "CriticConfig::default_min_action_items")]
    pub min_action_items: usize,
    #[serde(default = "CriticConfig::default_min_summary_chars")]
    pub min_summary_chars: usize,
    #[serde(default)]
    pub min_confidence: f64,
    /// Ask the LLM for a qualitative review after the rubric passes
    #[serde(default)]
    pub llm_review: bool,
}

impl CriticConfig {
    const fn default_min_citations() -> usize {
        1
    }

    const fn default_min_action_items() -> usize {
        3
    }

    const fn default_min_summary_chars() -> usize {
        40
    }
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            min_citations: Self::default_min_citations(),
            min_action_items: Self::default_min_action_items(),
            min_summary_chars: Self::default_min_summary_chars(),
            min_confidence: 0.0,
            llm_review: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default = "LoggingConfig::default_persist_runs")]
    pub persist_runs: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    const fn default_persist_runs() -> bool {
        true
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            persist_runs: Self::default_persist_runs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [orchestrator]
            max_revisions = 3
            pipeline_deadline_ms = 1000

            [critic]
            llm_review = true
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_revisions, 3);
        assert_eq!(config.orchestrator.max_retries, 2);
        assert_eq!(config.orchestrator.pipeline_deadline(), Duration::from_secs(1));
        assert!(config.critic.llm_review);
        assert_eq!(config.critic.min_action_items, 3);
        assert_eq!(config.search.api_key_env, "TAVILY_API_KEY");
        assert_eq!(config.llm.max_tokens, 2048);
    }

    #[test]
    fn rejects_out_of_range_tolerance() {
        let err = ConfigLoader::parse("[orchestrator]\nconflict_tolerance = 1.5\n").unwrap_err();
        assert!(matches!(err, CopilotError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_zero_deadline() {
        assert!(ConfigLoader::parse("[orchestrator]\npipeline_deadline_ms = 0\n").is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copilot.toml");
        fs::write(&path, "[llm]\nmodel = \"local-model\"\n").unwrap();

        let config = ConfigLoader::load(Some(path)).unwrap();
        assert_eq!(config.llm.model, "local-model");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/copilot.toml"))).unwrap_err();
        assert!(matches!(err, CopilotError::ConfigIo { .. }));
    }
}
