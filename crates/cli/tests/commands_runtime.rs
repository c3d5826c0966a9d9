use std::env;
use std::sync::{Mutex, OnceLock};

use opgate_cli::commands::feedback::{self, Behavior};
use opgate_cli::commands::process::ProcessArgs;
use opgate_cli::commands::{classify, config, decompose, metrics, migrate, operations, process};
use opgate_core::config::LoadOptions;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_memory_database() {
    with_env(&[("OPGATE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run(&LoadOptions::default());
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn invalid_config_is_a_config_failure() {
    with_env(&[("OPGATE_PIPELINE_MODE", "reckless")], || {
        let result = migrate::run(&LoadOptions::default());
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn classify_without_backend_uses_keyword_fallback() {
    with_env(&[], || {
        let result = classify::run(&LoadOptions::default(), "good morning");
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let data = &payload["data"];
        assert_eq!(data["classification"]["destination"], "stream");
        assert_eq!(data["classification"]["consumer"], "human");
        assert_eq!(data["classification"]["semantics"], "interpret");
        assert_eq!(data["confident"], false);
        assert_eq!(data["model"], "keyword_fallback");
    });
}

#[test]
fn decompose_splits_on_then() {
    with_env(&[], || {
        let result = decompose::run(&LoadOptions::default(), "list files then delete temp.txt", false);
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let data = &payload["data"];
        assert_eq!(data["decomposed"], true);
        assert_eq!(data["operations"].as_array().map(Vec::len), Some(3));
        assert_eq!(data["operations"][0]["child_ids"].as_array().map(Vec::len), Some(2));
    });
}

#[test]
fn process_then_approve_moves_operation_to_executing() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(&dir);
    with_env(&[("OPGATE_DATABASE_URL", url.as_str())], || {
        let options = LoadOptions::default();
        let result = process::run(&options, &process_args("show memory usage"));
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("Shall I proceed? (yes/no)"));
        let id = payload["data"]["awaiting_approval"][0].as_str().expect("pending operation").to_string();

        let approved = parse_payload(&operations::approve(&options, &id, false).output);
        assert_eq!(approved["status"], "ok");
        assert_eq!(approved["data"]["operations"][0]["status"], "executing");

        let status = parse_payload(&operations::status(&options, &id).output);
        assert_eq!(status["data"]["effective_status"], "executing");

        let rated = parse_payload(&feedback::rate(&options, &id, 4, &[("speed".to_string(), 5)], None).output);
        assert_eq!(rated["status"], "ok");
        assert_eq!(rated["data"]["signal"]["rating"], 4);
    });
}

#[test]
fn blocked_request_reports_the_failing_layer() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(&dir);
    with_env(&[("OPGATE_DATABASE_URL", url.as_str())], || {
        let result = process::run(&LoadOptions::default(), &process_args("sudo rm -rf /"));
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["message"], "I can't perform that operation. Safety verification failed.");
        assert_eq!(payload["data"]["success"], false);
        assert_eq!(payload["data"]["operations"][0]["status"], "failed");
    });
}

#[test]
fn unknown_operations_return_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(&dir);
    with_env(&[("OPGATE_DATABASE_URL", url.as_str())], || {
        let options = LoadOptions::default();
        let outputs = [
            operations::approve(&options, "missing", false),
            operations::reject(&options, "missing", None),
            feedback::rate(&options, "missing", 5, &[], None),
            feedback::correct(&options, "missing", "file", "human", "execute", None),
            feedback::behavior(&options, "missing", Behavior::Undo),
        ];

        for result in outputs {
            assert_eq!(result.exit_code, 4, "expected not-found exit code: {}", result.output);
            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "not_found");
        }
    });
}

#[test]
fn correction_with_illegal_label_is_a_bad_request() {
    with_env(&[("OPGATE_DATABASE_URL", "sqlite::memory:")], || {
        let result = feedback::correct(&LoadOptions::default(), "any", "network", "human", "read", None);
        assert_eq!(result.exit_code, 7);
        assert_eq!(parse_payload(&result.output)["error_class"], "bad_request");
    });
}

#[test]
fn metrics_report_counts_corrected_outcomes() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(&dir);
    with_env(&[("OPGATE_DATABASE_URL", url.as_str())], || {
        let options = LoadOptions::default();
        let payload = parse_payload(&process::run(&options, &process_args("good morning")).output);
        let id = payload["data"]["operations"][0]["id"].as_str().expect("operation id").to_string();

        let corrected = feedback::correct(&options, &id, "stream", "human", "read", None);
        assert_eq!(corrected.exit_code, 0, "{}", corrected.output);

        let report = parse_payload(&metrics::run(&options, "tester").output);
        assert_eq!(report["status"], "ok");
        assert_eq!(report["data"]["metrics"]["sample_size"], 1);
        assert_eq!(report["data"]["metrics"]["correction_rate"], 1.0);
        assert_eq!(report["data"]["training_pairs"].as_array().map(Vec::len), Some(1));
    });
}

#[test]
fn config_attributes_env_overrides() {
    with_env(&[("OPGATE_DATABASE_URL", "sqlite::memory:")], || {
        let payload = parse_payload(&config::run(&LoadOptions::default()).output);
        let entries = payload["data"]["entries"].as_array().cloned().unwrap_or_default();
        let database_url = entries.iter().find(|entry| entry["key"] == "database.url").expect("database.url entry");

        assert_eq!(database_url["value"], "sqlite::memory:");
        assert_eq!(database_url["source"], "env (OPGATE_DATABASE_URL)");
        let api_key = entries.iter().find(|entry| entry["key"] == "llm.api_key").expect("llm.api_key entry");
        assert_eq!(api_key["value"], "<unset>");
    });
}

fn process_args(request: &str) -> ProcessArgs {
    ProcessArgs {
        request: request.to_string(),
        user_id: "tester".to_string(),
        source_agent: "cli-test".to_string(),
        ..ProcessArgs::default()
    }
}

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("opgate.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "OPGATE_DATABASE_URL",
        "OPGATE_DATABASE_MAX_CONNECTIONS",
        "OPGATE_DATABASE_TIMEOUT_SECS",
        "OPGATE_LLM_PROVIDER",
        "OPGATE_LLM_API_KEY",
        "OPGATE_LLM_BASE_URL",
        "OPGATE_LLM_MODEL",
        "OPGATE_LLM_TIMEOUT_SECS",
        "OPGATE_LLM_TEMPERATURE",
        "OPGATE_LLM_TOP_P",
        "OPGATE_PIPELINE_MODE",
        "OPGATE_PIPELINE_MAX_DECOMPOSITION_DEPTH",
        "OPGATE_PIPELINE_AUTO_APPROVE_LOW_RISK",
        "OPGATE_PIPELINE_BACKUP_DIR",
        "OPGATE_FEEDBACK_WINDOW_DAYS",
        "OPGATE_LOGGING_LEVEL",
        "OPGATE_LOGGING_FORMAT",
        "OPGATE_LOG_LEVEL",
        "OPGATE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    env::set_var("OPGATE_LLM_PROVIDER", "none");
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
