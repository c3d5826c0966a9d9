use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::execution::{ExecutionResult, ReversibilityInfo, StateSnapshot};
use crate::domain::operation::{AtomicOperation, OperationId, OperationStatus};
use crate::execution::capture::StateCapture;
use crate::execution::reversibility::derive_reversibility;

/// Output reported by a runner for a successful action
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub files_affected: Vec<String>,
    pub processes_spawned: Vec<u32>,
}

/// Failure reported by a runner
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stderr: None, exit_code: None }
    }
}

/// The external system-mutating side of an operation.
///
/// Invoked exactly once per operation, and only once it is `Executing`.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn execute(&self, name: &str, args: &Value) -> Result<ActionOutput, ActionError>;
}

/// A concrete action resolved for an operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub name: String,
    pub args: Value,
    /// Paths snapshotted before and after the action
    #[serde(default)]
    pub touched_paths: Vec<PathBuf>,
}

/// What happened when an operation ran
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Either `Complete` or `Failed`
    pub status: OperationStatus,
    pub result: ExecutionResult,
    pub state_before: Option<StateSnapshot>,
    pub state_after: Option<StateSnapshot>,
    pub reversibility: ReversibilityInfo,
}

/// Errors that prevent an operation from running at all
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("operation {id} is {status}, only executing operations may run")]
    NotExecuting { id: OperationId, status: OperationStatus },
    #[error("decomposed operation {0} has no action of its own")]
    DecomposedParent(OperationId),
}

/// Runs approved operations through an [`ActionRunner`].
///
/// There is no retry loop: a failed run ends the operation as `Failed`, and
/// a user retry is a new operation.
pub struct OperationExecutor<R> {
    runner: R,
    capture: StateCapture,
}

impl<R> OperationExecutor<R>
where
    R: ActionRunner,
{
    pub fn new(runner: R, capture: StateCapture) -> Self {
        Self { runner, capture }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute the operation, capturing state around the runner call.
    ///
    /// Runner failures and snapshot I/O failures are reported as a `Failed`
    /// outcome with stderr and exit code preserved. Reversibility is derived
    /// even on failure when a before-snapshot exists.
    pub async fn execute(
        &self,
        operation: &AtomicOperation,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if operation.is_decomposed {
            return Err(ExecutionError::DecomposedParent(operation.id.clone()));
        }
        if operation.status != OperationStatus::Executing {
            return Err(ExecutionError::NotExecuting {
                id: operation.id.clone(),
                status: operation.status,
            });
        }

        let started = Instant::now();
        let state_before =
            match self.capture.capture_before(&operation.id, &request.touched_paths).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    tracing::warn!(
                        event_name = "opgate.execute.capture_failed",
                        operation_id = %operation.id,
                        error = %error,
                        "before-snapshot failed; action not run"
                    );
                    let result = ExecutionResult::failed(
                        format!("state capture failed: {error}"),
                        None,
                        elapsed_ms(started),
                    );
                    return Ok(ExecutionOutcome {
                        status: OperationStatus::Failed,
                        result,
                        state_before: None,
                        state_after: None,
                        reversibility: derive_reversibility(None, None),
                    });
                }
            };

        match self.runner.execute(&request.name, &request.args).await {
            Ok(output) => {
                let state_after = self
                    .capture
                    .capture_after(&request.touched_paths, &output.processes_spawned)
                    .await
                    .map_err(|error| {
                        tracing::warn!(
                            event_name = "opgate.execute.after_capture_failed",
                            operation_id = %operation.id,
                            error = %error,
                            "after-snapshot failed"
                        );
                    })
                    .ok();
                let reversibility = derive_reversibility(Some(&state_before), state_after.as_ref());
                let result = ExecutionResult {
                    success: true,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: String::new(),
                    duration_ms: elapsed_ms(started),
                    files_affected: output.files_affected,
                    processes_spawned: output.processes_spawned,
                };
                tracing::info!(
                    event_name = "opgate.execute.completed",
                    operation_id = %operation.id,
                    action = %request.name,
                    duration_ms = result.duration_ms,
                    reversible = reversibility.reversible,
                    "operation executed"
                );
                Ok(ExecutionOutcome {
                    status: OperationStatus::Complete,
                    result,
                    state_before: Some(state_before),
                    state_after,
                    reversibility,
                })
            }
            Err(error) => {
                let stderr = error.stderr.clone().unwrap_or_else(|| error.message.clone());
                let result = ExecutionResult::failed(stderr, error.exit_code, elapsed_ms(started));
                tracing::warn!(
                    event_name = "opgate.execute.failed",
                    operation_id = %operation.id,
                    action = %request.name,
                    exit_code = ?error.exit_code,
                    error = %error,
                    "operation failed"
                );
                Ok(ExecutionOutcome {
                    status: OperationStatus::Failed,
                    result,
                    reversibility: derive_reversibility(Some(&state_before), None),
                    state_before: Some(state_before),
                    state_after: None,
                })
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
