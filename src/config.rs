//! Configuration for the evaluation engine.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Predictor (vision LLM) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Base URL for the LLM API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Default model name, used when a job does not name one
    pub model: String,

    /// Maximum tokens for response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on a single predictor call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: "claude-latest".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PredictorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the per-invocation evaluation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution budget of one invocation.
    pub time_budget_secs: u64,

    /// Remaining time at which the loop checkpoints and suspends. Must exceed
    /// the predictor timeout so the checkpoint write lands before the deadline.
    pub reserve_secs: u64,

    /// ANLS scores below this value count as zero.
    pub anls_threshold: f64,

    /// How many per-sample error messages are kept on the job record.
    pub max_sample_errors: usize,

    /// Upper bound on persisted error text, in characters.
    pub max_error_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: 900,
            reserve_secs: 120,
            anls_threshold: 0.5,
            max_sample_errors: 10,
            max_error_chars: crate::error::DEFAULT_MAX_ERROR_CHARS,
        }
    }
}

impl EngineConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn reserve(&self) -> Duration {
        Duration::from_secs(self.reserve_secs)
    }
}

/// Where job records, queued messages and datasets live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub jobs_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub datasets_dir: PathBuf,
    /// Optional JSONL file receiving per-sample and summary events.
    pub telemetry_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("data/jobs"),
            queue_dir: PathBuf::from("data/queue"),
            datasets_dir: PathBuf::from("data/datasets"),
            telemetry_path: None,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Predictor settings
    pub predictor: PredictorConfig,
    /// Evaluation loop settings
    pub engine: EngineConfig,
    /// Storage locations
    pub storage: StorageConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    predictor: Option<PredictorFileSection>,
    engine: Option<EngineFileSection>,
    storage: Option<StorageFileSection>,
}

#[derive(Debug, Deserialize)]
struct PredictorFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EngineFileSection {
    time_budget_secs: Option<u64>,
    reserve_secs: Option<u64>,
    anls_threshold: Option<f64>,
    max_sample_errors: Option<usize>,
    max_error_chars: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StorageFileSection {
    jobs_dir: Option<PathBuf>,
    queue_dir: Option<PathBuf>,
    datasets_dir: Option<PathBuf>,
    telemetry_path: Option<PathBuf>,
}

/// Overwrite `target` with a parsed environment variable, if present and valid.
fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_*, EVAL_*)
    /// 2. Config file (~/.config/doc-vqa-eval/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Overlay LLM_* and EVAL_* environment variables.
    pub fn apply_env(&mut self) {
        env_override("LLM_API_BASE", &mut self.predictor.api_base);
        env_override("LLM_API_KEY", &mut self.predictor.api_key);
        env_override("LLM_MODEL", &mut self.predictor.model);
        env_override("LLM_MAX_TOKENS", &mut self.predictor.max_tokens);
        env_override("LLM_TEMPERATURE", &mut self.predictor.temperature);
        env_override("LLM_TIMEOUT_SECS", &mut self.predictor.timeout_secs);

        env_override("EVAL_TIME_BUDGET_SECS", &mut self.engine.time_budget_secs);
        env_override("EVAL_RESERVE_SECS", &mut self.engine.reserve_secs);
        env_override("EVAL_ANLS_THRESHOLD", &mut self.engine.anls_threshold);
        env_override("EVAL_MAX_SAMPLE_ERRORS", &mut self.engine.max_sample_errors);

        env_override("EVAL_JOBS_DIR", &mut self.storage.jobs_dir);
        env_override("EVAL_QUEUE_DIR", &mut self.storage.queue_dir);
        env_override("EVAL_DATASETS_DIR", &mut self.storage.datasets_dir);
        if let Ok(path) = env::var("EVAL_TELEMETRY_PATH") {
            self.storage.telemetry_path = Some(PathBuf::from(path));
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, filling gaps with defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file_config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(predictor) = file_config.predictor {
            let target = &mut config.predictor;
            if let Some(api_base) = predictor.api_base {
                target.api_base = api_base;
            }
            if let Some(api_key) = predictor.api_key {
                target.api_key = api_key;
            }
            if let Some(model) = predictor.model {
                target.model = model;
            }
            if let Some(max_tokens) = predictor.max_tokens {
                target.max_tokens = max_tokens;
            }
            if let Some(temperature) = predictor.temperature {
                target.temperature = temperature;
            }
            if let Some(timeout_secs) = predictor.timeout_secs {
                target.timeout_secs = timeout_secs;
            }
        }

        if let Some(engine) = file_config.engine {
            let target = &mut config.engine;
            if let Some(secs) = engine.time_budget_secs {
                target.time_budget_secs = secs;
            }
            if let Some(secs) = engine.reserve_secs {
                target.reserve_secs = secs;
            }
            if let Some(threshold) = engine.anls_threshold {
                target.anls_threshold = threshold;
            }
            if let Some(max) = engine.max_sample_errors {
                target.max_sample_errors = max;
            }
            if let Some(max) = engine.max_error_chars {
                target.max_error_chars = max;
            }
        }

        if let Some(storage) = file_config.storage {
            let target = &mut config.storage;
            if let Some(dir) = storage.jobs_dir {
                target.jobs_dir = dir;
            }
            if let Some(dir) = storage.queue_dir {
                target.queue_dir = dir;
            }
            if let Some(dir) = storage.datasets_dir {
                target.datasets_dir = dir;
            }
            if storage.telemetry_path.is_some() {
                target.telemetry_path = storage.telemetry_path;
            }
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "doc-vqa-eval")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate the engine settings on their own.
    ///
    /// Stores and queues only need these; the predictor section is checked
    /// by [`Config::validate`].
    pub fn validate_engine(&self) -> Result<()> {
        let engine = &self.engine;

        if engine.reserve_secs >= engine.time_budget_secs {
            return Err(EvalError::InvalidConfig(format!(
                "reserve_secs ({}) must be smaller than time_budget_secs ({})",
                engine.reserve_secs, engine.time_budget_secs
            )));
        }

        if engine.reserve_secs <= self.predictor.timeout_secs {
            return Err(EvalError::InvalidConfig(format!(
                "reserve_secs ({}) must exceed the predictor timeout ({}s) so a checkpoint can be written after the slowest call",
                engine.reserve_secs, self.predictor.timeout_secs
            )));
        }

        if !(0.0..=1.0).contains(&engine.anls_threshold) {
            return Err(EvalError::InvalidConfig(format!(
                "anls_threshold must be within [0, 1], got {}",
                engine.anls_threshold
            )));
        }

        Ok(())
    }

    /// Validate that required configuration is present and consistent.
    pub fn validate(&self) -> Result<()> {
        if self.predictor.api_base.is_empty() {
            return Err(EvalError::Config(
                "LLM API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.predictor.api_key.is_empty() {
            return Err(EvalError::Config(
                "LLM API key is required. Set LLM_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.predictor.model.is_empty() {
            return Err(EvalError::Config(
                "LLM model is required. Set LLM_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        self.validate_engine()
    }

    /// Create a config from explicit predictor values (useful for testing).
    pub fn with_predictor(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            predictor: PredictorConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.predictor.api_base.is_empty());
        assert_eq!(config.predictor.model, "claude-latest");
        assert_eq!(config.predictor.max_tokens, 500);
        assert_eq!(config.engine.time_budget_secs, 900);
        assert_eq!(config.engine.reserve_secs, 120);
        assert_eq!(config.engine.anls_threshold, 0.5);
        assert_eq!(config.storage.jobs_dir, PathBuf::from("data/jobs"));
    }

    #[test]
    fn test_validate_fails_without_required_fields() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_predictor_validates() {
        let config = Config::with_predictor("https://api.example.com", "test-key", "gpt-4o");
        assert_eq!(config.predictor.api_base, "https://api.example.com");
        assert_eq!(config.predictor.model, "gpt-4o");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reserve_must_exceed_predictor_timeout() {
        let mut config = Config::with_predictor("https://api.example.com", "k", "m");
        config.predictor.timeout_secs = 120;
        config.engine.reserve_secs = 90;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("predictor timeout"));
    }

    #[test]
    fn test_reserve_must_fit_in_budget() {
        let mut config = Config::default();
        config.engine.time_budget_secs = 100;
        config.engine.reserve_secs = 100;
        assert!(config.validate_engine().is_err());
    }

    #[test]
    fn test_from_yaml_overrides_defaults() {
        let yaml = r#"
predictor:
  api_base: "https://llm.internal"
  model: "vision-large"
engine:
  time_budget_secs: 600
  reserve_secs: 90
storage:
  telemetry_path: "data/events.jsonl"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.predictor.api_base, "https://llm.internal");
        assert_eq!(config.predictor.model, "vision-large");
        assert_eq!(config.predictor.max_tokens, 500);
        assert_eq!(config.engine.time_budget_secs, 600);
        assert_eq!(config.engine.reserve_secs, 90);
        assert_eq!(config.engine.anls_threshold, 0.5);
        assert_eq!(
            config.storage.telemetry_path,
            Some(PathBuf::from("data/events.jsonl"))
        );
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(Config::from_yaml("predictor: [1, 2").is_err());
    }
}
