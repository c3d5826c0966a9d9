use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use opgate_core::config::LlmConfig;
use opgate_core::domain::operation::AtomicOperation;
use opgate_core::domain::taxonomy::Classification;
use opgate_core::domain::verification::{VerificationLayer, VerificationResult};
use opgate_core::verification::intent::check_intent;
use opgate_core::verification::{VerificationContext, Verifier};

use crate::classifier::ClassificationError;
use crate::llm::{extract_json_object, LlmClient, LlmError};

const SYSTEM_PROMPT: &str = r#"You review how a local assistant understood a request.
Given the request and the assistant's classification (destination/consumer/semantics),
decide whether the classification matches what the user actually asked for.
Reply with one JSON object and nothing else:
{"matches": true|false, "confidence": 0.0-1.0, "concern": "short explanation or null"}"#;

#[derive(Debug, Deserialize)]
struct Verdict {
    matches: bool,
    confidence: f64,
    #[serde(default)]
    concern: Option<String>,
}

/// Intent layer that asks the model backend for a second opinion and defers
/// to the deterministic check when the backend cannot answer.
#[derive(Clone)]
pub struct IntentJudge {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    temperature: f32,
    top_p: f32,
}

impl IntentJudge {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, timeout: Duration::from_secs(30), temperature: 0.1, top_p: 0.9 }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(config.timeout_secs),
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn judge(
        &self,
        operation: &AtomicOperation,
        classification: &Classification,
    ) -> Result<Verdict, ClassificationError> {
        let user = format!(
            "Request: {}\nClassification: {}\nReasoning: {}",
            operation.user_request,
            classification.label(),
            classification.reasoning
        );
        let reply = tokio::time::timeout(
            self.timeout,
            self.llm.chat_json(SYSTEM_PROMPT, &user, self.temperature, self.top_p),
        )
        .await
        .map_err(|_| LlmError::Timeout(self.timeout))??;

        let object = extract_json_object(&reply).ok_or(ClassificationError::NoJson)?;
        serde_json::from_str(object).map_err(|error| ClassificationError::Malformed(error.to_string()))
    }
}

#[async_trait]
impl Verifier for IntentJudge {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Intent
    }

    async fn verify(&self, operation: &AtomicOperation, _context: &VerificationContext) -> VerificationResult {
        let Some(classification) = operation.classification.as_ref() else {
            return check_intent(operation);
        };

        match self.judge(operation, classification).await {
            Ok(verdict) => {
                let layer = VerificationLayer::Intent;
                let confidence = verdict.confidence.clamp(0.0, 1.0);
                let concern = verdict.concern.filter(|concern| !concern.trim().is_empty());
                if verdict.matches {
                    VerificationResult::pass(layer, confidence)
                        .with_issues(concern)
                        .with_details("intent confirmed by model")
                } else {
                    VerificationResult::new(layer, false, confidence).with_issue(
                        concern.unwrap_or_else(|| "classification does not match the request".to_string()),
                    )
                }
            }
            Err(error) => {
                tracing::warn!(
                    event_name = "opgate.intent.fallback",
                    operation_id = %operation.id,
                    error = %error,
                    "intent judge unavailable, using deterministic check"
                );
                check_intent(operation)
            }
        }
    }
}
