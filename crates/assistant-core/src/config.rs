use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::UseCase;

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;
pub const DEFAULT_SELECTED_TEXT_LIMIT: usize = 500;
const DEFAULT_STOPPED_MESSAGE: &str = "Generation stopped by user.";

/// Knobs for a conversation session. Every field has a default so partial
/// JSON files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssistantConfig {
    /// Upper bound on engine requests within one turn.
    pub max_tool_rounds: usize,
    pub default_use_case: UseCase,
    pub system_prompt: Option<String>,
    pub selected_text_limit: usize,
    pub stopped_message: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            default_use_case: UseCase::Normal,
            system_prompt: None,
            selected_text_limit: DEFAULT_SELECTED_TEXT_LIMIT,
            stopped_message: DEFAULT_STOPPED_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AssistantConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tool_rounds == 0 {
            return Err(ConfigError::Invalid(
                "maxToolRounds must be at least 1".into(),
            ));
        }
        if self.stopped_message.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "stoppedMessage must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AssistantConfig::from_json_str(
            r#"{ "maxToolRounds": 3, "defaultUseCase": "deep_analysis" }"#,
        )
        .unwrap();
        assert_eq!(config.max_tool_rounds, 3);
        assert_eq!(config.default_use_case, UseCase::DeepAnalysis);
        assert_eq!(config.selected_text_limit, DEFAULT_SELECTED_TEXT_LIMIT);
        assert_eq!(config.stopped_message, DEFAULT_STOPPED_MESSAGE);
    }

    #[test]
    fn zero_rounds_is_rejected() {
        let err = AssistantConfig::from_json_str(r#"{ "maxToolRounds": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
