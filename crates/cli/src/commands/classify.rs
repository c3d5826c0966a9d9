use serde_json::json;

use opgate_agent::classifier::AtomicClassifier;
use opgate_core::config::LoadOptions;

use crate::commands::{block_on_command, llm_client, load_config, CommandResult};

/// Classifies one request without persisting anything.
pub fn run(options: &LoadOptions, request: &str) -> CommandResult {
    block_on_command("classify", async {
        let config = load_config(options)?;
        let classifier = AtomicClassifier::from_config(llm_client(&config)?, &config);
        let output = classifier.classify(request, &[]).await;

        let classification = &output.classification;
        let message = format!(
            "{} ({:.2}{})",
            classification.label(),
            classification.confidence,
            if output.is_fallback() { ", keyword fallback" } else { "" }
        );
        let data = json!({
            "request": request,
            "classification": classification,
            "confident": classification.confident(),
            "model": output.model,
        });
        Ok((message, data))
    })
}
