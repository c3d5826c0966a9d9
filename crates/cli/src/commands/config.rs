use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use toml::Value;

use opgate_core::config::{AppConfig, LoadOptions};

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

/// Effective configuration with the source of every value. Secrets are
/// redacted.
pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config(options) {
        Ok(config) => config,
        Err(failure) => {
            return CommandResult::failure("config", failure.error_class, failure.message, failure.exit_code)
        }
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let entries: Vec<ConfigEntry> = effective_values(&config)
        .into_iter()
        .map(|(key, value, env_key)| ConfigEntry {
            key,
            value,
            source: field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref()),
        })
        .collect();

    CommandResult::success_with(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(json!({ "entries": entries })),
    )
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String, Option<&'static str>)> {
    let api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    vec![
        ("database.url", config.database.url.clone(), Some("OPGATE_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("OPGATE_DATABASE_MAX_CONNECTIONS"),
        ),
        ("database.timeout_secs", config.database.timeout_secs.to_string(), Some("OPGATE_DATABASE_TIMEOUT_SECS")),
        ("llm.provider", format!("{:?}", config.llm.provider).to_lowercase(), Some("OPGATE_LLM_PROVIDER")),
        ("llm.base_url", config.llm.base_url.clone(), Some("OPGATE_LLM_BASE_URL")),
        ("llm.model", config.llm.model.clone(), Some("OPGATE_LLM_MODEL")),
        ("llm.api_key", api_key.to_string(), Some("OPGATE_LLM_API_KEY")),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), Some("OPGATE_LLM_TIMEOUT_SECS")),
        ("llm.temperature", config.llm.temperature.to_string(), Some("OPGATE_LLM_TEMPERATURE")),
        ("llm.top_p", config.llm.top_p.to_string(), Some("OPGATE_LLM_TOP_P")),
        ("pipeline.mode", format!("{:?}", config.pipeline.mode).to_lowercase(), Some("OPGATE_PIPELINE_MODE")),
        (
            "pipeline.auto_approve_low_risk",
            config.pipeline.auto_approve_low_risk.to_string(),
            Some("OPGATE_PIPELINE_AUTO_APPROVE_LOW_RISK"),
        ),
        (
            "pipeline.approval_confidence_threshold",
            config.pipeline.approval_confidence_threshold.to_string(),
            None,
        ),
        (
            "pipeline.max_decomposition_depth",
            config.pipeline.max_decomposition_depth.to_string(),
            Some("OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH"),
        ),
        (
            "pipeline.decomposition_word_threshold",
            config.pipeline.decomposition_word_threshold.to_string(),
            None,
        ),
        ("pipeline.max_correction_hints", config.pipeline.max_correction_hints.to_string(), None),
        (
            "pipeline.backup_dir",
            config.pipeline.backup_dir.display().to_string(),
            Some("OPGATE_PIPELINE_BACKUP_DIR"),
        ),
        ("feedback.window_days", config.feedback.window_days.to_string(), Some("OPGATE_FEEDBACK_WINDOW_DAYS")),
        ("feedback.weak_area_threshold", config.feedback.weak_area_threshold.to_string(), None),
        ("feedback.weak_area_min_samples", config.feedback.weak_area_min_samples.to_string(), None),
        ("feedback.training_pair_limit", config.feedback.training_pair_limit.to_string(), None),
        ("logging.level", config.logging.level.clone(), Some("OPGATE_LOGGING_LEVEL")),
        ("logging.format", format!("{:?}", config.logging.format).to_lowercase(), Some("OPGATE_LOGGING_FORMAT")),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    ["opgate.toml", "config/opgate.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{contains_path, field_source};

    #[test]
    fn file_values_are_attributed_to_the_file() {
        let doc: toml::Value = "[llm]\nmodel = \"qwen2.5\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.base_url"));
        assert_eq!(field_source("llm.model", None, Some(&doc), None), "file (config file)");
        assert_eq!(field_source("llm.base_url", None, Some(&doc), None), "default");
    }
}
