pub mod classify;
pub mod config;
pub mod decompose;
pub mod doctor;
pub mod feedback;
pub mod metrics;
pub mod migrate;
pub mod operations;
pub mod process;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use opgate_agent::llm::{LlmClient, OllamaClient};
use opgate_agent::runtime::{OpgateRuntime, RuntimeError};
use opgate_agent::tools::{ExternalPlanner, ToolRegistry};
use opgate_core::config::{AppConfig, LoadOptions};
use opgate_core::errors::{ApplicationError, InterfaceError};
use opgate_db::{connect_with_settings, migrations, DbPool, SqlFeedbackRepository, SqlOperationRepository};

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME_INIT: u8 = 3;
pub const EXIT_NOT_FOUND: u8 = 4;
pub const EXIT_DB_CONNECTIVITY: u8 = 5;
pub const EXIT_MIGRATION: u8 = 6;
pub const EXIT_BAD_REQUEST: u8 = 7;
pub const EXIT_UNAVAILABLE: u8 = 8;
pub const EXIT_INTERNAL: u8 = 9;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// Why a command stopped, mapped onto an error class and exit code.
#[derive(Debug)]
pub struct CommandFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl CommandFailure {
    pub fn new(error_class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message, EXIT_BAD_REQUEST)
    }
}

impl From<RuntimeError> for CommandFailure {
    fn from(error: RuntimeError) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        let detail = error.to_string();
        let interface = ApplicationError::from(error).into_interface(correlation_id);
        let (error_class, exit_code) = match interface {
            InterfaceError::NotFound { .. } => ("not_found", EXIT_NOT_FOUND),
            InterfaceError::BadRequest { .. } => ("bad_request", EXIT_BAD_REQUEST),
            InterfaceError::ServiceUnavailable { .. } => ("service_unavailable", EXIT_UNAVAILABLE),
            InterfaceError::Internal { .. } => ("internal", EXIT_INTERNAL),
        };
        tracing::warn!(
            event_name = "opgate.cli.command_failed",
            correlation_id = interface.correlation_id(),
            error_class,
            error = %detail,
            "command failed"
        );
        Self::new(error_class, format!("{} ({detail})", interface.user_message()), exit_code)
    }
}

/// Runs one async command body on a fresh current-thread runtime.
pub fn block_on_command<F>(command: &str, body: F) -> CommandResult
where
    F: Future<Output = Result<(String, Value), CommandFailure>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME_INIT,
            );
        }
    };

    match runtime.block_on(body) {
        Ok((message, data)) => CommandResult::success_with(command, message, Some(data)),
        Err(failure) => CommandResult::failure(command, failure.error_class, failure.message, failure.exit_code),
    }
}

pub fn load_config(options: &LoadOptions) -> Result<AppConfig, CommandFailure> {
    AppConfig::load(options.clone())
        .map_err(|error| CommandFailure::new("config_validation", format!("configuration issue: {error}"), EXIT_CONFIG))
}

pub fn llm_client(config: &AppConfig) -> Result<Option<Arc<dyn LlmClient>>, CommandFailure> {
    if !config.llm_enabled() {
        return Ok(None);
    }
    let client = OllamaClient::from_config(&config.llm)
        .map_err(|error| CommandFailure::new("llm_client", error.to_string(), EXIT_RUNTIME_INIT))?;
    Ok(Some(Arc::new(client)))
}

pub async fn open_pool(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), EXIT_DB_CONNECTIVITY))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| CommandFailure::new("migration", error.to_string(), EXIT_MIGRATION))?;
    Ok(pool)
}

/// Runtime backed by the configured database. Execution is left to an
/// external runner; the CLI registers no tools.
pub struct Session {
    pub config: AppConfig,
    pub pool: DbPool,
    pub runtime: OpgateRuntime,
}

impl Session {
    pub async fn open(options: &LoadOptions) -> Result<Self, CommandFailure> {
        let config = load_config(options)?;
        let llm = llm_client(&config)?;
        let pool = open_pool(&config).await?;
        let runtime = OpgateRuntime::from_config(
            &config,
            llm,
            Arc::new(SqlOperationRepository::new(pool.clone())),
            Arc::new(SqlFeedbackRepository::new(pool.clone())),
            ToolRegistry::default(),
            Arc::new(ExternalPlanner),
        )
        .map_err(CommandFailure::from)?;
        Ok(Self { config, pool, runtime })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub fn to_data<T: Serialize>(value: &T) -> Result<Value, CommandFailure> {
    serde_json::to_value(value).map_err(|error| CommandFailure::new("serialization", error.to_string(), EXIT_INTERNAL))
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
