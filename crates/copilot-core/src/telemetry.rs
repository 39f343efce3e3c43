use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

use crate::CopilotError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directive; `RUST_LOG` wins when unset
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            json: false,
        }
    }
}

impl TelemetryOptions {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            env_filter: Some(level.into()),
            ..Self::default()
        }
    }
}

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), CopilotError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or(options.env_filter)
        .unwrap_or_else(|| "info".to_string());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi)
        .with_writer(std::io::stderr);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| {
        CopilotError::InvalidConfiguration(format!("telemetry init failed: {err}"))
    })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
