use opgate_agent::intents::{seed_classification, DomainIntent, IntentAction};
use opgate_agent::processor::ProcessOptions;
use opgate_core::config::LoadOptions;

use crate::commands::{block_on_command, to_data, CommandFailure, CommandResult, Session};

#[derive(Clone, Debug, Default)]
pub struct ProcessArgs {
    pub request: String,
    pub user_id: String,
    pub source_agent: String,
    pub intent: Option<String>,
    pub action: Option<String>,
    pub force_decomposition: bool,
}

pub fn run(options: &LoadOptions, args: &ProcessArgs) -> CommandResult {
    block_on_command("process", async {
        let mut process_options =
            ProcessOptions { force_decomposition: args.force_decomposition, ..ProcessOptions::default() };
        let action = args
            .action
            .as_deref()
            .map(|value| {
                IntentAction::parse(value)
                    .ok_or_else(|| CommandFailure::bad_request(format!("unknown action `{value}`")))
            })
            .transpose()?;
        match args.intent.as_deref() {
            Some(value) => {
                let intent = DomainIntent::parse(value)
                    .ok_or_else(|| CommandFailure::bad_request(format!("unknown intent `{value}`")))?;
                process_options.seed = Some(seed_classification(intent, action));
            }
            None if action.is_some() => {
                return Err(CommandFailure::bad_request("--action requires --intent"));
            }
            None => {}
        }

        let session = Session::open(options).await?;
        let response = session
            .runtime
            .process_with(&args.request, &args.user_id, &args.source_agent, &process_options)
            .await
            .map_err(CommandFailure::from)?;
        session.close().await;

        let message = response.message.clone().unwrap_or_else(|| {
            if response.success {
                let leaves = response.operations.iter().filter(|operation| operation.is_leaf()).count();
                format!("{leaves} operation(s) ready to execute")
            } else {
                "request could not be processed".to_string()
            }
        });
        Ok((message, to_data(&response)?))
    })
}
