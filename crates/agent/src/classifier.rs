//! Taxonomy classification of a single request.
//!
//! A configured model backend answers first. Any backend problem (no backend,
//! timeout, transport failure, unparseable or illegal reply) drops to a
//! keyword classifier whose answers are never confident.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use opgate_core::config::AppConfig;
use opgate_core::domain::feedback::CorrectionExample;
use opgate_core::domain::taxonomy::{
    Classification, ClassificationLabel, Consumer, Destination, Semantics,
};
use opgate_core::errors::DomainError;
use opgate_core::lexicon::{
    self, MACHINE_KEYWORDS, MUTATING_VERBS, MUTATION_NOUNS, PROCESS_VERBS, QUERY_VERBS,
};

use crate::llm::{extract_json_object, LlmClient, LlmError};

/// Model id recorded for keyword answers.
pub const FALLBACK_MODEL: &str = "keyword_fallback";

const SYSTEM_PROMPT: &str = r#"You classify user requests for a local assistant.
Every request gets exactly one value on each of three dimensions.

destination - where the output goes:
  stream: shown once and gone (answers, listings, explanations)
  file: saved to persistent storage (notes, documents, config)
  process: starts, stops or controls a system process

consumer - who reads the result:
  human: a person reads it
  machine: another program parses or acts on it (json, csv, test runners, builds)

semantics - what the request does:
  read: retrieves existing data
  interpret: analyzes or explains without side effects
  execute: performs a side-effecting action

Examples:
  "show memory usage" -> stream/human/read
  "save this to notes.txt" -> file/human/execute
  "run pytest" -> process/machine/execute
  "explain this error" -> stream/human/interpret
  "get process list as json" -> stream/machine/read
  "open firefox" -> process/human/execute
  "good morning" -> stream/human/interpret

Reply with one JSON object and nothing else:
{"destination": "...", "consumer": "...", "semantics": "...", "confident": true|false, "reasoning": "..."}
Set confident to false when the request is ambiguous."#;

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error(transparent)]
    Backend(#[from] LlmError),
    #[error("reply did not contain a json object")]
    NoJson,
    #[error("reply json is malformed: {0}")]
    Malformed(String),
    #[error("reply is missing `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Illegal(#[from] DomainError),
}

/// A classification together with the model that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierOutput {
    pub classification: Classification,
    pub model: String,
}

impl ClassifierOutput {
    pub fn is_fallback(&self) -> bool {
        self.model == FALLBACK_MODEL
    }
}

#[derive(Clone)]
pub struct AtomicClassifier {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
    temperature: f32,
    top_p: f32,
    max_correction_hints: usize,
}

impl AtomicClassifier {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm, timeout: Duration::from_secs(30), temperature: 0.1, top_p: 0.9, max_correction_hints: 5 }
    }

    /// Keyword-only classifier.
    pub fn offline() -> Self {
        Self::new(None)
    }

    pub fn from_config(llm: Option<Arc<dyn LlmClient>>, config: &AppConfig) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(config.llm.timeout_secs),
            temperature: config.llm.temperature,
            top_p: config.llm.top_p,
            max_correction_hints: config.pipeline.max_correction_hints,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_correction_hints(mut self, max_correction_hints: usize) -> Self {
        self.max_correction_hints = max_correction_hints;
        self
    }

    pub fn has_backend(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn classify(&self, request: &str, corrections: &[CorrectionExample]) -> ClassifierOutput {
        if let Some(llm) = &self.llm {
            match self.classify_with_backend(llm.as_ref(), request, corrections).await {
                Ok(classification) => {
                    let model = llm.model_name().unwrap_or_else(|| "unknown".to_string());
                    return ClassifierOutput { classification, model };
                }
                Err(error) => {
                    tracing::warn!(
                        event_name = "opgate.classify.fallback",
                        error = %error,
                        "classifier backend failed, using keyword fallback"
                    );
                }
            }
        }

        ClassifierOutput { classification: fallback_classification(request), model: FALLBACK_MODEL.to_string() }
    }

    async fn classify_with_backend(
        &self,
        llm: &dyn LlmClient,
        request: &str,
        corrections: &[CorrectionExample],
    ) -> Result<Classification, ClassificationError> {
        let system = system_prompt(corrections, self.max_correction_hints);
        let user = format!("Request: {request}");
        let reply = tokio::time::timeout(
            self.timeout,
            llm.chat_json(&system, &user, self.temperature, self.top_p),
        )
        .await
        .map_err(|_| LlmError::Timeout(self.timeout))??;
        parse_reply(&reply)
    }
}

impl Default for AtomicClassifier {
    fn default() -> Self {
        Self::offline()
    }
}

pub(crate) fn system_prompt(corrections: &[CorrectionExample], max_hints: usize) -> String {
    let hints: Vec<String> = corrections
        .iter()
        .take(max_hints)
        .map(|hint| {
            format!("- \"{}\" was misclassified as {}, correct is {}", hint.request, hint.system, hint.corrected)
        })
        .collect();
    if hints.is_empty() {
        return SYSTEM_PROMPT.to_string();
    }
    format!("{SYSTEM_PROMPT}\n\nPAST CORRECTIONS (learn from these mistakes):\n{}", hints.join("\n"))
}

/// Parses a backend reply into a classification. Taxonomy values are never coerced.
pub fn parse_reply(reply: &str) -> Result<Classification, ClassificationError> {
    let object = extract_json_object(reply).ok_or(ClassificationError::NoJson)?;
    let value: Value =
        serde_json::from_str(object).map_err(|error| ClassificationError::Malformed(error.to_string()))?;

    let label = ClassificationLabel::parse(
        str_field(&value, "destination")?,
        str_field(&value, "consumer")?,
        str_field(&value, "semantics")?,
    )?;
    let confident = match value.get("confident") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(confident)) => *confident,
        Some(other) => {
            return Err(ClassificationError::Malformed(format!("`confident` must be a boolean, got {other}")))
        }
    };
    let reasoning = value.get("reasoning").and_then(Value::as_str).unwrap_or_default();

    Ok(Classification::from_confident_flag(label, confident, reasoning))
}

fn str_field<'a>(value: &'a Value, name: &'static str) -> Result<&'a str, ClassificationError> {
    value.get(name).and_then(Value::as_str).ok_or(ClassificationError::MissingField(name))
}

/// Keyword classification: destination, then consumer, then semantics, each
/// decided on its own keyword set. Always unconfident.
pub fn fallback_classification(request: &str) -> Classification {
    let tokens = lexicon::tokenize(request);

    let (destination, destination_hit) = if let Some(hit) = lexicon::first_match(&tokens, MUTATION_NOUNS) {
        (Destination::File, Some(hit))
    } else if let Some(hit) = lexicon::first_match(&tokens, PROCESS_VERBS) {
        (Destination::Process, Some(hit))
    } else {
        (Destination::Stream, None)
    };

    let consumer_hit = lexicon::first_match(&tokens, MACHINE_KEYWORDS);
    let consumer = if consumer_hit.is_some() { Consumer::Machine } else { Consumer::Human };

    let (semantics, semantics_hit) = if let Some(hit) = lexicon::first_match(&tokens, QUERY_VERBS) {
        (Semantics::Read, Some(hit))
    } else if let Some(hit) = lexicon::first_match(&tokens, MUTATING_VERBS) {
        (Semantics::Execute, Some(hit))
    } else {
        (Semantics::Interpret, None)
    };

    let reason = |value: &str, hit: Option<&str>| match hit {
        Some(hit) => format!("{value} ('{hit}')"),
        None => format!("{value} (default)"),
    };
    let reasoning = format!(
        "keyword fallback: destination={}, consumer={}, semantics={}",
        reason(destination.as_str(), destination_hit),
        reason(consumer.as_str(), consumer_hit),
        reason(semantics.as_str(), semantics_hit),
    );

    Classification::from_confident_flag(ClassificationLabel::new(destination, consumer, semantics), false, reasoning)
}
