use serde_json::json;

use opgate_agent::classifier::AtomicClassifier;
use opgate_agent::decomposer::{AtomicDecomposer, DecomposeContext};
use opgate_core::config::LoadOptions;

use crate::commands::{block_on_command, llm_client, load_config, to_data, CommandResult};

/// Decomposes and classifies a request without persisting anything.
pub fn run(options: &LoadOptions, request: &str, force: bool) -> CommandResult {
    block_on_command("decompose", async {
        let config = load_config(options)?;
        let classifier = AtomicClassifier::from_config(llm_client(&config)?, &config);
        let decomposer = AtomicDecomposer::from_config(classifier, &config.pipeline);

        let mut context = DecomposeContext::new("cli", "cli");
        context.force = force;
        let decomposition = decomposer.decompose(request, &context).await;

        let message = format!("{} ({} operations)", decomposition.reasoning, decomposition.operations.len());
        let data = json!({
            "original_request": decomposition.original_request,
            "decomposed": decomposition.decomposed,
            "reasoning": decomposition.reasoning,
            "confidence": decomposition.confidence,
            "operations": to_data(&decomposition.operations)?,
            "models": to_data(&decomposition.models)?,
        });
        Ok((message, data))
    })
}
