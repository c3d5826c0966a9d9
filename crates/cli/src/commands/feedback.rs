use std::collections::BTreeMap;

use serde_json::{json, Value};

use opgate_core::config::LoadOptions;
use opgate_core::domain::operation::OperationId;
use opgate_core::domain::taxonomy::ClassificationLabel;

use crate::commands::{block_on_command, to_data, CommandFailure, CommandResult, Session};

/// Behavioral signals a user can report after the fact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Retry,
    Undo,
    Abandon,
}

impl Behavior {
    fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Undo => "undo",
            Self::Abandon => "abandon",
        }
    }
}

pub fn rate(
    options: &LoadOptions,
    operation_id: &str,
    rating: u8,
    dimensions: &[(String, u8)],
    comment: Option<String>,
) -> CommandResult {
    block_on_command("rate", async {
        let dimensions: BTreeMap<String, u8> = dimensions.iter().cloned().collect();
        let session = Session::open(options).await?;
        let record = session
            .runtime
            .record_rating(&OperationId(operation_id.to_string()), rating, dimensions, comment)
            .await
            .map_err(CommandFailure::from)?;
        session.close().await;

        Ok((format!("rating recorded for {operation_id}"), to_data(&record)?))
    })
}

pub fn correct(
    options: &LoadOptions,
    operation_id: &str,
    destination: &str,
    consumer: &str,
    semantics: &str,
    reasoning: Option<String>,
) -> CommandResult {
    block_on_command("correct", async {
        let corrected = ClassificationLabel::parse(destination, consumer, semantics)
            .map_err(|error| CommandFailure::bad_request(error.to_string()))?;
        let session = Session::open(options).await?;
        let record = session
            .runtime
            .record_correction(&OperationId(operation_id.to_string()), corrected, reasoning)
            .await
            .map_err(CommandFailure::from)?;
        session.close().await;

        Ok((format!("correction to {corrected} recorded for {operation_id}"), to_data(&record)?))
    })
}

pub fn behavior(options: &LoadOptions, operation_id: &str, behavior: Behavior) -> CommandResult {
    block_on_command(behavior.as_str(), async {
        let session = Session::open(options).await?;
        let id = OperationId(operation_id.to_string());
        let data: Value = match behavior {
            Behavior::Retry => {
                let response = session.runtime.retry(&id).await.map_err(CommandFailure::from)?;
                to_data(&response)?
            }
            Behavior::Undo => {
                let record = session.runtime.undo(&id).await.map_err(CommandFailure::from)?;
                json!({ "feedback": to_data(&record)? })
            }
            Behavior::Abandon => {
                let record = session.runtime.abandon(&id).await.map_err(CommandFailure::from)?;
                json!({ "feedback": to_data(&record)? })
            }
        };
        session.close().await;

        Ok((format!("{} recorded for {operation_id}", behavior.as_str()), data))
    })
}
