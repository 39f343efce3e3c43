use std::{env, fmt};

use crate::CopilotError;

/// API key or token read from the environment. Never printed.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, CopilotError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(CopilotError::MissingSecret(var.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_env_reads_value() {
        unsafe { env::set_var("COPILOT_TEST_SECRET", "value") };
        let secret = require_env("COPILOT_TEST_SECRET").unwrap();
        assert_eq!(secret.expose(), "value");
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }

    #[test]
    fn require_env_rejects_blank_and_missing() {
        unsafe {
            env::set_var("COPILOT_TEST_SECRET_BLANK", "  ");
            env::remove_var("COPILOT_TEST_SECRET_MISSING");
        }
        assert!(matches!(
            require_env("COPILOT_TEST_SECRET_BLANK"),
            Err(CopilotError::MissingSecret(_))
        ));
        assert!(matches!(
            require_env("COPILOT_TEST_SECRET_MISSING"),
            Err(CopilotError::MissingSecret(name)) if name == "COPILOT_TEST_SECRET_MISSING"
        ));
    }
}
