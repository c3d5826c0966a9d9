use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tera::{Context, Tera};
use thiserror::Error;

use opgate_core::config::{AppConfig, FeedbackConfig};
use opgate_core::domain::feedback::{LearningMetrics, TrainingPair, UserFeedback, WeakArea};
use opgate_core::domain::operation::{derive_parent_status, AtomicOperation, OperationId, OperationStatus};
use opgate_core::domain::taxonomy::ClassificationLabel;
use opgate_core::errors::ApplicationError;
use opgate_core::execution::{ExecutionError, OperationExecutor, StateCapture};
use opgate_core::feedback::{FeedbackCollector, LearningAggregator};
use opgate_core::verification::VerificationPipeline;
use opgate_db::{FeedbackRepository, OperationRepository, RepositoryError};

use crate::classifier::AtomicClassifier;
use crate::decomposer::AtomicDecomposer;
use crate::intent_judge::IntentJudge;
use crate::intents::{seed_classification, DomainIntent, IntentAction};
use crate::llm::LlmClient;
use crate::processor::{LeafVerdict, ProcessOptions, ProcessResult, Processor, ProcessorError};
use crate::tools::{ToolPlanner, ToolRegistry};

const APPROVAL_TEMPLATE: &str = "approval.txt";
const FAILURE_TEMPLATE: &str = "failure.txt";
const MAX_NOTES: usize = 3;

const APPROVAL_SOURCE: &str = "I'd like to confirm before proceeding:\n\nRequest: {{ request }}\n\
{% if destination %}This will {{ semantics }} data ({{ destination }}).\n{% endif %}\
{% if notes %}\nNotes:\n{% for note in notes %}  - {{ note }}\n{% endfor %}{% endif %}\
\nShall I proceed? (yes/no)";

const FAILURE_SOURCE: &str = "{% if layer %}I can't perform that operation. {{ layer | capitalize }} verification failed.\
{% elif warnings %}I can't perform that operation: {{ warnings | join(sep=\"; \") }}\
{% else %}I can't perform that operation due to safety checks.{% endif %}";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),
    #[error(transparent)]
    Processor(ProcessorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<ProcessorError> for RuntimeError {
    fn from(error: ProcessorError) -> Self {
        match error {
            ProcessorError::NotFound(id) => Self::NotFound(id),
            other => Self::Processor(other),
        }
    }
}

impl From<RuntimeError> for ApplicationError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::NotFound(id) => Self::NotFound(id.to_string()),
            RuntimeError::Processor(ProcessorError::Transition(error)) => Self::Domain(error.into()),
            RuntimeError::Processor(ProcessorError::NotFound(id)) => Self::NotFound(id.to_string()),
            RuntimeError::Processor(ProcessorError::Repository(error)) | RuntimeError::Repository(error) => {
                Self::Persistence(error.to_string())
            }
            RuntimeError::Execution(error) => Self::Integration(error.to_string()),
            RuntimeError::Template(error) => Self::Configuration(error.to_string()),
        }
    }
}

/// What the caller sees after a request or an approval.
#[derive(Clone, Debug, Serialize)]
pub struct BridgeResponse {
    pub operations: Vec<AtomicOperation>,
    pub success: bool,
    pub awaiting_approval: Vec<OperationId>,
    /// Confirmation or refusal text for the user, if any is needed.
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LearningReport {
    pub metrics: LearningMetrics,
    pub weak_areas: Vec<WeakArea>,
    pub training_pairs: Vec<TrainingPair>,
}

/// Entry point for assistants: processes requests, runs approved operations
/// and turns user reactions into feedback records.
pub struct OpgateRuntime {
    processor: Processor,
    executor: OperationExecutor<ToolRegistry>,
    planner: Arc<dyn ToolPlanner>,
    collector: FeedbackCollector,
    aggregator: LearningAggregator,
    learning: FeedbackConfig,
    templates: Tera,
}

impl OpgateRuntime {
    pub fn new(
        processor: Processor,
        executor: OperationExecutor<ToolRegistry>,
        planner: Arc<dyn ToolPlanner>,
    ) -> Result<Self, RuntimeError> {
        let mut templates = Tera::default();
        templates.add_raw_templates(vec![
            (APPROVAL_TEMPLATE, APPROVAL_SOURCE),
            (FAILURE_TEMPLATE, FAILURE_SOURCE),
        ])?;
        Ok(Self {
            processor,
            executor,
            planner,
            collector: FeedbackCollector::new(),
            aggregator: LearningAggregator::new(),
            learning: AppConfig::default().feedback,
            templates,
        })
    }

    /// Wires classifier, decomposer, pipeline and executor from config. With
    /// an LLM client the intent layer is judged by the model as well.
    pub fn from_config(
        config: &AppConfig,
        llm: Option<Arc<dyn LlmClient>>,
        operations: Arc<dyn OperationRepository>,
        feedback: Arc<dyn FeedbackRepository>,
        tools: ToolRegistry,
        planner: Arc<dyn ToolPlanner>,
    ) -> Result<Self, RuntimeError> {
        let mut pipeline = VerificationPipeline::from_config(&config.pipeline);
        if let Some(llm) = llm.as_ref() {
            pipeline = pipeline.with_verifier(Arc::new(IntentJudge::from_config(llm.clone(), &config.llm)));
        }
        let classifier = AtomicClassifier::from_config(llm, config);
        let decomposer = AtomicDecomposer::from_config(classifier, &config.pipeline);
        let processor = Processor::from_config(decomposer, pipeline, operations, feedback, config);
        let executor = OperationExecutor::new(tools, StateCapture::new(config.pipeline.backup_dir.clone()));

        let mut runtime = Self::new(processor, executor, planner)?;
        runtime.learning = config.feedback.clone();
        Ok(runtime)
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn collector(&self) -> &FeedbackCollector {
        &self.collector
    }

    pub async fn process_request(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
    ) -> Result<BridgeResponse, RuntimeError> {
        self.process_with(request, user_id, source_agent, &ProcessOptions::default()).await
    }

    /// Processes a request an upstream assistant already mapped to a domain
    /// intent. The seeded classification is still verified.
    pub async fn process_intent(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        intent: DomainIntent,
        action: Option<IntentAction>,
    ) -> Result<BridgeResponse, RuntimeError> {
        let options =
            ProcessOptions { seed: Some(seed_classification(intent, action)), ..ProcessOptions::default() };
        self.process_with(request, user_id, source_agent, &options).await
    }

    pub async fn process_with(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        options: &ProcessOptions,
    ) -> Result<BridgeResponse, RuntimeError> {
        let result = self.processor.process_with(request, user_id, source_agent, options).await?;
        let now = Utc::now();
        for operation in &result.operations {
            if !operation.is_leaf() || operation.status.is_terminal() {
                continue;
            }
            self.collector.start_session(operation, now);
            if operation.status == OperationStatus::AwaitingApproval {
                self.collector.mark_presented(&operation.id, now);
            }
        }

        let mut operations = Vec::with_capacity(result.operations.len());
        for operation in &result.operations {
            if operation.status == OperationStatus::Executing && operation.is_leaf() {
                operations.push(self.run(operation.clone()).await?);
            } else {
                operations.push(operation.clone());
            }
        }

        self.respond(operations, &result)
    }

    /// Approves an operation waiting for confirmation, then runs it.
    pub async fn approve(&self, id: &OperationId, modified: bool) -> Result<BridgeResponse, RuntimeError> {
        let operation = self.processor.update_status(id, OperationStatus::Executing).await?;
        let extent = if modified { 1.0 } else { 0.0 };
        self.collector.start_session(&operation, Utc::now());
        let record = self.collector.collect_approval(&operation, true, modified, extent, None, Utc::now());
        self.store(&record).await?;

        let operation = self.run(operation).await?;
        Ok(BridgeResponse {
            success: operation.status != OperationStatus::Failed,
            operations: vec![operation],
            awaiting_approval: Vec::new(),
            message: None,
        })
    }

    pub async fn reject(&self, id: &OperationId, reason: Option<String>) -> Result<AtomicOperation, RuntimeError> {
        let operation = self.processor.update_status(id, OperationStatus::Failed).await?;
        let details = reason.map(|reason| json!({ "reason": reason }));
        self.collector.start_session(&operation, Utc::now());
        let record = self.collector.collect_approval(&operation, false, false, 0.0, details, Utc::now());
        self.store(&record).await?;
        self.collector.end_session(id);
        Ok(operation)
    }

    pub async fn record_rating(
        &self,
        id: &OperationId,
        rating: u8,
        dimensions: BTreeMap<String, u8>,
        comment: Option<String>,
    ) -> Result<UserFeedback, RuntimeError> {
        let operation = self.processor.get_operation(id).await?;
        let record = self.collector.collect_rating(&operation, rating, dimensions, comment);
        self.store(&record).await?;
        Ok(record)
    }

    pub async fn record_correction(
        &self,
        id: &OperationId,
        corrected: ClassificationLabel,
        reasoning: Option<String>,
    ) -> Result<UserFeedback, RuntimeError> {
        let operation = self.processor.get_operation(id).await?;
        let record = self.collector.collect_correction(&operation, corrected, reasoning);
        self.store(&record).await?;
        Ok(record)
    }

    /// Records the retry against the original and processes the request
    /// again as a new operation.
    pub async fn retry(&self, id: &OperationId) -> Result<BridgeResponse, RuntimeError> {
        let operation = self.processor.get_operation(id).await?;
        let now = Utc::now();
        self.collector.start_session(&operation, now);
        self.collector.record_retry(id, now);
        self.store_behavioral(&operation).await?;

        self.process_request(&operation.user_request, &operation.user_id, &operation.source_agent).await
    }

    /// Records that the user undid the operation's effects.
    pub async fn undo(&self, id: &OperationId) -> Result<Option<UserFeedback>, RuntimeError> {
        let operation = self.processor.get_operation(id).await?;
        self.collector.start_session(&operation, Utc::now());
        self.collector.record_undo(id, Utc::now());
        let record = self.store_behavioral(&operation).await?;
        self.collector.end_session(id);
        Ok(record)
    }

    pub async fn abandon(&self, id: &OperationId) -> Result<Option<UserFeedback>, RuntimeError> {
        let operation = self.processor.get_operation(id).await?;
        self.collector.start_session(&operation, Utc::now());
        self.collector.record_abandon(id);
        let record = self.store_behavioral(&operation).await?;
        self.collector.end_session(id);
        Ok(record)
    }

    /// Stored status for leaves; decomposed parents report the status derived
    /// from their children.
    pub async fn effective_status(&self, id: &OperationId) -> Result<OperationStatus, RuntimeError> {
        let root = self.processor.get_operation(id).await?;
        if !root.is_decomposed {
            return Ok(root.status);
        }

        let mut subtree = vec![root];
        let mut cursor = 0;
        while cursor < subtree.len() {
            if subtree[cursor].is_decomposed {
                let children = self.processor.operations().list_children(&subtree[cursor].id).await?;
                subtree.extend(children);
            }
            cursor += 1;
        }

        // Children always follow their parent, so a reverse pass settles
        // every child before the parent reads it.
        let mut settled: BTreeMap<OperationId, OperationStatus> = BTreeMap::new();
        for operation in subtree.iter().rev() {
            let status = if operation.is_decomposed {
                let children: Vec<OperationStatus> = operation
                    .child_ids
                    .iter()
                    .filter_map(|child| settled.get(child).copied())
                    .collect();
                derive_parent_status(&children)
            } else {
                operation.status
            };
            settled.insert(operation.id.clone(), status);
        }
        Ok(settled.get(id).copied().unwrap_or(OperationStatus::Decomposed))
    }

    /// Computes and stores the user's learning metrics for the configured
    /// window, with weak areas and training pairs from the same outcomes.
    pub async fn learning_report(&self, user_id: &str) -> Result<LearningReport, RuntimeError> {
        let now = Utc::now();
        let since = now - chrono::Duration::days(i64::from(self.learning.window_days));
        let feedback = self.processor.feedback();
        let outcomes = feedback.classification_outcomes(user_id, Some(since)).await?;

        let metrics = self.aggregator.compute_metrics(user_id, self.learning.window_days, &outcomes, now);
        feedback.store_learning_metrics(&metrics).await?;
        let weak_areas = self.aggregator.identify_weak_areas(
            &outcomes,
            self.learning.weak_area_threshold,
            self.learning.weak_area_min_samples,
        );
        let training_pairs = self.aggregator.training_pairs(&outcomes, self.learning.training_pair_limit);

        Ok(LearningReport { metrics, weak_areas, training_pairs })
    }

    pub fn approval_text(&self, operation: &AtomicOperation, warnings: &[String]) -> Result<String, RuntimeError> {
        let mut context = Context::new();
        context.insert("request", &operation.user_request);
        let (semantics, destination) = operation
            .classification
            .as_ref()
            .map(|classification| (classification.semantics.as_str(), classification.destination.as_str()))
            .unwrap_or(("", ""));
        context.insert("semantics", semantics);
        context.insert("destination", destination);
        context.insert("notes", &warnings.iter().take(MAX_NOTES).collect::<Vec<_>>());
        Ok(self.templates.render(APPROVAL_TEMPLATE, &context)?)
    }

    pub fn failure_text(&self, verdict: &LeafVerdict) -> Result<String, RuntimeError> {
        let mut context = Context::new();
        let layer = verdict.verification.blocking_layer.map(|layer| layer.as_str()).unwrap_or("");
        context.insert("layer", layer);
        context.insert("warnings", &verdict.verification.warnings.iter().take(MAX_NOTES).collect::<Vec<_>>());
        Ok(self.templates.render(FAILURE_TEMPLATE, &context)?)
    }

    async fn run(&self, operation: AtomicOperation) -> Result<AtomicOperation, RuntimeError> {
        let Some(call) = self.planner.plan(&operation).await else {
            tracing::debug!(
                event_name = "opgate.execute.unplanned",
                operation_id = %operation.id,
                "no tool planned, leaving operation for an external runner"
            );
            return Ok(operation);
        };

        let outcome = self.executor.execute(&operation, &call.into()).await?;
        if outcome.status == OperationStatus::Failed {
            tracing::warn!(
                event_name = "opgate.execute.failed",
                operation_id = %operation.id,
                stderr = %outcome.result.stderr,
                "operation execution failed"
            );
        }
        self.collector.mark_execution_completed(&operation.id, Utc::now());
        Ok(self.processor.record_execution(&operation.id, &outcome).await?)
    }

    fn respond(&self, operations: Vec<AtomicOperation>, result: &ProcessResult) -> Result<BridgeResponse, RuntimeError> {
        let mut texts = Vec::new();
        let mut awaiting_approval = Vec::new();
        for operation in operations.iter().filter(|operation| operation.is_leaf()) {
            let Some(verdict) = result.verdicts.get(&operation.id) else {
                continue;
            };
            if !verdict.verification.passed {
                texts.push(self.failure_text(verdict)?);
            } else if operation.status == OperationStatus::AwaitingApproval {
                awaiting_approval.push(operation.id.clone());
                texts.push(self.approval_text(operation, &verdict.verification.warnings)?);
            }
        }

        let success = result.success && operations.iter().all(|operation| operation.status != OperationStatus::Failed);
        Ok(BridgeResponse {
            operations,
            success,
            awaiting_approval,
            message: (!texts.is_empty()).then(|| texts.join("\n\n")),
        })
    }

    async fn store(&self, record: &UserFeedback) -> Result<(), RuntimeError> {
        self.processor.feedback().store_feedback(record).await?;
        tracing::info!(
            event_name = "opgate.feedback.recorded",
            operation_id = %record.operation_id,
            feedback_type = record.signal.feedback_type().as_str(),
            confidence = record.feedback_confidence,
            "feedback recorded"
        );
        Ok(())
    }

    async fn store_behavioral(&self, operation: &AtomicOperation) -> Result<Option<UserFeedback>, RuntimeError> {
        let Some(record) = self.collector.collect_behavioral(operation) else {
            return Ok(None);
        };
        self.store(&record).await?;
        Ok(Some(record))
    }
}
