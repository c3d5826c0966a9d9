use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub feedback: FeedbackConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub mode: VerificationMode,
    pub auto_approve_low_risk: bool,
    pub approval_confidence_threshold: f64,
    pub max_decomposition_depth: usize,
    pub decomposition_word_threshold: usize,
    pub max_correction_hints: usize,
    pub backup_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FeedbackConfig {
    pub window_days: u32,
    pub weak_area_threshold: f64,
    pub weak_area_min_samples: usize,
    pub training_pair_limit: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    /// No backend; every classification takes the keyword fallback.
    None,
}

/// How much non-mandatory verification runs for low-risk classifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Fast,
    Standard,
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub verification_mode: Option<VerificationMode>,
    pub auto_approve_low_risk: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://opgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: "http://127.0.0.1:11434".to_string(),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                temperature: 0.1,
                top_p: 0.9,
            },
            pipeline: PipelineConfig {
                mode: VerificationMode::Standard,
                auto_approve_low_risk: false,
                approval_confidence_threshold: 0.7,
                max_decomposition_depth: 3,
                decomposition_word_threshold: 30,
                max_correction_hints: 5,
                backup_dir: PathBuf::from(".opgate/backups"),
            },
            feedback: FeedbackConfig {
                window_days: 7,
                weak_area_threshold: 0.7,
                weak_area_min_samples: 5,
                training_pair_limit: 1000,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "none" | "off" => Ok(Self::None),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected ollama|none)"
            ))),
        }
    }
}

impl std::str::FromStr for VerificationMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::Validation(format!(
                "unsupported verification mode `{other}` (expected fast|standard|strict)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("opgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn llm_enabled(&self) -> bool {
        self.llm.provider != LlmProvider::None
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(llm_api_key_value.into());
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(top_p) = llm.top_p {
                self.llm.top_p = top_p;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(mode) = pipeline.mode {
                self.pipeline.mode = mode;
            }
            if let Some(auto_approve) = pipeline.auto_approve_low_risk {
                self.pipeline.auto_approve_low_risk = auto_approve;
            }
            if let Some(threshold) = pipeline.approval_confidence_threshold {
                self.pipeline.approval_confidence_threshold = threshold;
            }
            if let Some(depth) = pipeline.max_decomposition_depth {
                self.pipeline.max_decomposition_depth = depth;
            }
            if let Some(words) = pipeline.decomposition_word_threshold {
                self.pipeline.decomposition_word_threshold = words;
            }
            if let Some(hints) = pipeline.max_correction_hints {
                self.pipeline.max_correction_hints = hints;
            }
            if let Some(backup_dir) = pipeline.backup_dir {
                self.pipeline.backup_dir = backup_dir;
            }
        }

        if let Some(feedback) = patch.feedback {
            if let Some(window_days) = feedback.window_days {
                self.feedback.window_days = window_days;
            }
            if let Some(threshold) = feedback.weak_area_threshold {
                self.feedback.weak_area_threshold = threshold;
            }
            if let Some(min_samples) = feedback.weak_area_min_samples {
                self.feedback.weak_area_min_samples = min_samples;
            }
            if let Some(limit) = feedback.training_pair_limit {
                self.feedback.training_pair_limit = limit;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("OPGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("OPGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("OPGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("OPGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("OPGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("OPGATE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("OPGATE_LLM_API_KEY") {
            self.llm.api_key = Some(value.into());
        }
        if let Some(value) = read_env("OPGATE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("OPGATE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("OPGATE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("OPGATE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OPGATE_LLM_TEMPERATURE") {
            self.llm.temperature = parse_env("OPGATE_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("OPGATE_LLM_TOP_P") {
            self.llm.top_p = parse_env("OPGATE_LLM_TOP_P", &value)?;
        }

        if let Some(value) = read_env("OPGATE_PIPELINE_MODE") {
            self.pipeline.mode = value.parse()?;
        }
        if let Some(value) = read_env("OPGATE_PIPELINE_AUTO_APPROVE_LOW_RISK") {
            self.pipeline.auto_approve_low_risk =
                parse_env("OPGATE_PIPELINE_AUTO_APPROVE_LOW_RISK", &value)?;
        }
        if let Some(value) = read_env("OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH") {
            self.pipeline.max_decomposition_depth =
                parse_env("OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH", &value)?;
        }
        if let Some(value) = read_env("OPGATE_PIPELINE_BACKUP_DIR") {
            self.pipeline.backup_dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("OPGATE_FEEDBACK_WINDOW_DAYS") {
            self.feedback.window_days = parse_env("OPGATE_FEEDBACK_WINDOW_DAYS", &value)?;
        }

        let log_level = read_env("OPGATE_LOGGING_LEVEL").or_else(|| read_env("OPGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("OPGATE_LOGGING_FORMAT").or_else(|| read_env("OPGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(mode) = overrides.verification_mode {
            self.pipeline.mode = mode;
        }
        if let Some(auto_approve) = overrides.auto_approve_low_risk {
            self.pipeline.auto_approve_low_risk = auto_approve;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_pipeline(&self.pipeline)?;
        validate_feedback(&self.feedback)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("opgate.toml"), PathBuf::from("config/opgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation("llm.temperature must be in range 0..=2".to_string()));
    }

    if llm.top_p <= 0.0 || llm.top_p > 1.0 {
        return Err(ConfigError::Validation("llm.top_p must be in range (0, 1]".to_string()));
    }

    if llm.provider == LlmProvider::Ollama {
        if llm.base_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.base_url is required for ollama provider".to_string(),
            ));
        }
        if llm.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.model is required for ollama provider".to_string(),
            ));
        }
        let blank_key = llm.api_key.as_ref().is_some_and(|key| key.expose_secret().trim().is_empty());
        if blank_key {
            return Err(ConfigError::Validation(
                "llm.api_key must not be blank when provided".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&pipeline.approval_confidence_threshold) {
        return Err(ConfigError::Validation(
            "pipeline.approval_confidence_threshold must be in range 0..=1".to_string(),
        ));
    }

    if pipeline.max_decomposition_depth == 0 || pipeline.max_decomposition_depth > 8 {
        return Err(ConfigError::Validation(
            "pipeline.max_decomposition_depth must be in range 1..=8".to_string(),
        ));
    }

    if pipeline.decomposition_word_threshold == 0 {
        return Err(ConfigError::Validation(
            "pipeline.decomposition_word_threshold must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_feedback(feedback: &FeedbackConfig) -> Result<(), ConfigError> {
    if feedback.window_days == 0 {
        return Err(ConfigError::Validation(
            "feedback.window_days must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&feedback.weak_area_threshold) {
        return Err(ConfigError::Validation(
            "feedback.weak_area_threshold must be in range 0..=1".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    pipeline: Option<PipelinePatch>,
    feedback: Option<FeedbackPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    mode: Option<VerificationMode>,
    auto_approve_low_risk: Option<bool>,
    approval_confidence_threshold: Option<f64>,
    max_decomposition_depth: Option<usize>,
    decomposition_word_threshold: Option<usize>,
    max_correction_hints: Option<usize>,
    backup_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedbackPatch {
    window_days: Option<u32>,
    weak_area_threshold: Option<f64>,
    weak_area_min_samples: Option<usize>,
    training_pair_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        VerificationMode,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_conservative() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(!config.pipeline.auto_approve_low_risk, "auto approval must default off")?;
        ensure(config.pipeline.max_decomposition_depth == 3, "default depth should be 3")?;
        ensure(
            config.pipeline.mode == VerificationMode::Standard,
            "default mode should be standard",
        )?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "compact logging by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_OPGATE_LLM_KEY", "key-from-env");
        env::set_var("TEST_OPGATE_MODEL", "qwen2.5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opgate.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_OPGATE_LLM_KEY}"
model = "${TEST_OPGATE_MODEL}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("key-from-env".to_string()),
                "api key should be loaded from environment",
            )?;
            ensure(config.llm.model == "qwen2.5", "model should be interpolated")?;
            Ok(())
        })();

        clear_vars(&["TEST_OPGATE_LLM_KEY", "TEST_OPGATE_MODEL"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_an_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("opgate.toml");
        fs::write(&path, "[llm]\nmodel = \"${OPGATE_TEST_DOES_NOT_EXIST}\"\n")
            .map_err(|err| err.to_string())?;

        let result =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() });
        ensure(
            matches!(result, Err(ConfigError::MissingEnvInterpolation { ref var }) if var == "OPGATE_TEST_DOES_NOT_EXIST"),
            "missing variable should be reported by name",
        )
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPGATE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("OPGATE_PIPELINE_MODE", "strict");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opgate.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[pipeline]
mode = "fast"
auto_approve_low_risk = true

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    llm_provider: Some(LlmProvider::None),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.pipeline.mode == VerificationMode::Strict, "env mode should beat file")?;
            ensure(config.pipeline.auto_approve_low_risk, "file value should beat default")?;
            ensure(!config.llm_enabled(), "override provider should disable the backend")?;
            Ok(())
        })();

        clear_vars(&["OPGATE_DATABASE_URL", "OPGATE_PIPELINE_MODE"]);
        result
    }

    #[test]
    fn invalid_env_override_names_the_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH", "deep");
        let result = AppConfig::load(LoadOptions::default());
        clear_vars(&["OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH"]);

        ensure(
            matches!(result, Err(ConfigError::InvalidEnvOverride { ref key, .. }) if key == "OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH"),
            "invalid override should be reported",
        )
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH", "0");
        let result = AppConfig::load(LoadOptions::default());
        clear_vars(&["OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH"]);

        let has_message = matches!(
            result,
            Err(ConfigError::Validation(ref message)) if message.contains("max_decomposition_depth")
        );
        ensure(has_message, "validation failure should mention max_decomposition_depth")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPGATE_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["OPGATE_LLM_API_KEY"]);
        result
    }
}
