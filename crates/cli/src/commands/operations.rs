use serde_json::json;

use opgate_agent::runtime::RuntimeError;
use opgate_core::config::LoadOptions;
use opgate_core::domain::operation::OperationId;

use crate::commands::{block_on_command, to_data, CommandFailure, CommandResult, Session};

pub fn approve(options: &LoadOptions, operation_id: &str, modified: bool) -> CommandResult {
    block_on_command("approve", async {
        let session = Session::open(options).await?;
        let response = session
            .runtime
            .approve(&OperationId(operation_id.to_string()), modified)
            .await
            .map_err(CommandFailure::from)?;
        session.close().await;

        let status = response.operations.first().map(|operation| operation.status.as_str()).unwrap_or("unknown");
        Ok((format!("operation {operation_id} approved ({status})"), to_data(&response)?))
    })
}

pub fn reject(options: &LoadOptions, operation_id: &str, reason: Option<String>) -> CommandResult {
    block_on_command("reject", async {
        let session = Session::open(options).await?;
        let operation = session
            .runtime
            .reject(&OperationId(operation_id.to_string()), reason)
            .await
            .map_err(CommandFailure::from)?;
        session.close().await;

        Ok((format!("operation {operation_id} rejected"), to_data(&operation)?))
    })
}

/// Effective status: stored for leaves, derived from children for parents.
pub fn status(options: &LoadOptions, operation_id: &str) -> CommandResult {
    block_on_command("status", async {
        let session = Session::open(options).await?;
        let id = OperationId(operation_id.to_string());
        let operation = session
            .runtime
            .processor()
            .get_operation(&id)
            .await
            .map_err(|error| CommandFailure::from(RuntimeError::from(error)))?;
        let effective = session.runtime.effective_status(&id).await.map_err(CommandFailure::from)?;
        session.close().await;

        let data = json!({
            "operation": to_data(&operation)?,
            "effective_status": effective.as_str(),
        });
        Ok((format!("operation {operation_id} is {effective}"), data))
    })
}
