//! Request processing: decompose, classify, persist, verify, gate.
//!
//! [`Processor::update_status`] is the only path that changes an operation's
//! stored status. Every transition is checked by the lifecycle engine and
//! audited; the pipeline and the guardrail only return verdicts.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use opgate_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use opgate_core::config::AppConfig;
use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
use opgate_core::domain::taxonomy::Classification;
use opgate_core::execution::ExecutionOutcome;
use opgate_core::flows::{FlowTransitionError, LifecycleEngine, TransitionOutcome};
use opgate_core::verification::{PipelineResult, SafetyLevel, VerificationContext, VerificationPipeline};
use opgate_db::{ClassificationLogEntry, FeedbackRepository, OperationRepository, RepositoryError};

use crate::decomposer::{AtomicDecomposer, DecomposeContext, Decomposition};
use crate::guardrails::{ApprovalDecision, ApprovalGuardrail};

/// Model id recorded for classifications seeded from a domain intent.
pub const SEED_MODEL: &str = "intent_seed";

const ACTOR: &str = "processor";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] FlowTransitionError),
    #[error("operation not found: {0}")]
    NotFound(OperationId),
}

#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    pub force_decomposition: bool,
    /// Used instead of the classifier; the request is not decomposed.
    pub seed: Option<Classification>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafVerdict {
    pub verification: PipelineResult,
    pub decision: ApprovalDecision,
}

#[derive(Clone, Debug)]
pub struct ProcessResult {
    /// Root first, as persisted after gating.
    pub operations: Vec<AtomicOperation>,
    pub verdicts: BTreeMap<OperationId, LeafVerdict>,
    pub reasoning: String,
    /// False when any leaf failed verification.
    pub success: bool,
}

impl ProcessResult {
    pub fn primary(&self) -> Option<&AtomicOperation> {
        self.operations.first()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &AtomicOperation> {
        self.operations.iter().filter(|operation| operation.is_leaf())
    }
}

pub struct Processor {
    decomposer: AtomicDecomposer,
    pipeline: VerificationPipeline,
    guardrail: ApprovalGuardrail,
    operations: Arc<dyn OperationRepository>,
    feedback: Arc<dyn FeedbackRepository>,
    audit: Arc<dyn AuditSink>,
    lifecycle: LifecycleEngine,
    safety_level: SafetyLevel,
    max_correction_hints: usize,
}

impl Processor {
    pub fn new(
        decomposer: AtomicDecomposer,
        pipeline: VerificationPipeline,
        operations: Arc<dyn OperationRepository>,
        feedback: Arc<dyn FeedbackRepository>,
    ) -> Self {
        let policy = pipeline.policy();
        Self {
            decomposer,
            pipeline,
            guardrail: ApprovalGuardrail { auto_approve_low_risk: policy.auto_approve_low_risk },
            operations,
            feedback,
            audit: Arc::new(TracingAuditSink),
            lifecycle: LifecycleEngine,
            safety_level: SafetyLevel::default(),
            max_correction_hints: 5,
        }
    }

    pub fn from_config(
        decomposer: AtomicDecomposer,
        pipeline: VerificationPipeline,
        operations: Arc<dyn OperationRepository>,
        feedback: Arc<dyn FeedbackRepository>,
        config: &AppConfig,
    ) -> Self {
        let mut processor = Self::new(decomposer, pipeline, operations, feedback);
        processor.guardrail = ApprovalGuardrail::from_config(&config.pipeline);
        processor.max_correction_hints = config.pipeline.max_correction_hints;
        processor
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_safety_level(mut self, safety_level: SafetyLevel) -> Self {
        self.safety_level = safety_level;
        self
    }

    pub fn operations(&self) -> &Arc<dyn OperationRepository> {
        &self.operations
    }

    pub fn feedback(&self) -> &Arc<dyn FeedbackRepository> {
        &self.feedback
    }

    pub fn decomposer(&self) -> &AtomicDecomposer {
        &self.decomposer
    }

    pub async fn process_request(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
    ) -> Result<ProcessResult, ProcessorError> {
        self.process_with(request, user_id, source_agent, &ProcessOptions::default()).await
    }

    pub async fn process_with(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessResult, ProcessorError> {
        let correlation_id = Uuid::new_v4().to_string();
        let decomposition = match &options.seed {
            Some(seed) => seeded(request, user_id, source_agent, seed),
            None => {
                let corrections = match self.feedback.recent_corrections(user_id, self.max_correction_hints).await {
                    Ok(corrections) => corrections,
                    Err(error) => {
                        tracing::warn!(
                            event_name = "opgate.process.hints_unavailable",
                            error = %error,
                            "could not load correction hints"
                        );
                        Vec::new()
                    }
                };
                let mut context = DecomposeContext::new(user_id, source_agent).with_corrections(corrections);
                context.force = options.force_decomposition;
                self.decomposer.decompose(request, &context).await
            }
        };

        let Decomposition { mut operations, models, reasoning, decomposed, .. } = decomposition;
        for operation in &operations {
            self.operations.create_operation(operation).await?;
        }
        for operation in operations.iter().filter(|operation| operation.is_leaf()) {
            if let (Some(classification), Some(model)) =
                (operation.classification.as_ref(), models.get(&operation.id))
            {
                self.operations
                    .log_classification(&ClassificationLogEntry::new(operation, classification, model.as_str()))
                    .await?;
            }
        }
        if decomposed {
            if let Some(root) = operations.first() {
                self.audit.emit(
                    AuditEvent::from_context(
                        &AuditContext::new(Some(root.id.clone()), correlation_id.as_str(), ACTOR),
                        "decomposition.completed",
                        AuditCategory::Decomposition,
                        AuditOutcome::Success,
                    )
                    .with_metadata("operations", operations.len().to_string())
                    .with_metadata("reasoning", reasoning.as_str()),
                );
            }
        }

        let mut verdicts = BTreeMap::new();
        for operation in operations.iter_mut() {
            if operation.is_decomposed {
                self.apply_status(operation, OperationStatus::Decomposed, &correlation_id).await?;
                continue;
            }

            self.apply_status(operation, OperationStatus::AwaitingVerification, &correlation_id).await?;
            let context =
                VerificationContext::new(user_id, source_agent).with_safety_level(self.safety_level);
            let verification = self.pipeline.verify(operation, &context).await;
            self.operations.save_verification_results(&operation.id, &verification.results).await?;
            operation.verification_results = verification.results.clone();
            self.audit_verdict(operation, &verification, &correlation_id);

            let decision = self.guardrail.evaluate(&verification);
            self.apply_status(operation, decision.status(), &correlation_id).await?;
            verdicts.insert(operation.id.clone(), LeafVerdict { verification, decision });
        }

        let mut persisted = Vec::with_capacity(operations.len());
        for operation in &operations {
            persisted.push(self.get_operation(&operation.id).await?);
        }
        let success = verdicts.values().all(|verdict| verdict.verification.passed);

        tracing::info!(
            event_name = "opgate.process.completed",
            operation_id = persisted.first().map(|operation| operation.id.as_str()).unwrap_or(""),
            operations = persisted.len(),
            success,
            "request processed"
        );

        Ok(ProcessResult { operations: persisted, verdicts, reasoning, success })
    }

    pub async fn get_operation(&self, id: &OperationId) -> Result<AtomicOperation, ProcessorError> {
        self.operations.get_operation(id).await?.ok_or_else(|| ProcessorError::NotFound(id.clone()))
    }

    /// Moves an operation to `status` if the lifecycle allows it.
    pub async fn update_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
    ) -> Result<AtomicOperation, ProcessorError> {
        let mut operation = self.get_operation(id).await?;
        self.apply_status(&mut operation, status, &Uuid::new_v4().to_string()).await?;
        self.get_operation(id).await
    }

    /// Stores an execution outcome and ends the operation with its status.
    /// Nothing is written when the operation cannot reach that status.
    pub async fn record_execution(
        &self,
        id: &OperationId,
        outcome: &ExecutionOutcome,
    ) -> Result<AtomicOperation, ProcessorError> {
        let mut operation = self.get_operation(id).await?;
        let audit = AuditContext::new(Some(id.clone()), Uuid::new_v4().to_string(), ACTOR);
        let transition =
            self.lifecycle.transition_with_audit(operation.status, outcome.status, self.audit.as_ref(), &audit)?;

        if !self.operations.save_execution(id, outcome).await? {
            return Err(ProcessorError::NotFound(id.clone()));
        }
        self.audit.emit(
            AuditEvent::new(
                Some(id.clone()),
                Uuid::new_v4().to_string(),
                "execution.recorded",
                AuditCategory::Execution,
                ACTOR,
                if outcome.status == OperationStatus::Complete { AuditOutcome::Success } else { AuditOutcome::Failed },
            )
            .with_metadata("reversible", outcome.reversibility.reversible.to_string()),
        );
        self.persist_status(&mut operation, transition).await?;
        self.get_operation(id).await
    }

    async fn apply_status(
        &self,
        operation: &mut AtomicOperation,
        target: OperationStatus,
        correlation_id: &str,
    ) -> Result<(), ProcessorError> {
        let audit = AuditContext::new(Some(operation.id.clone()), correlation_id, ACTOR);
        let outcome =
            self.lifecycle.transition_with_audit(operation.status, target, self.audit.as_ref(), &audit)?;
        self.persist_status(operation, outcome).await
    }

    async fn persist_status(
        &self,
        operation: &mut AtomicOperation,
        outcome: TransitionOutcome,
    ) -> Result<(), ProcessorError> {
        if !self.operations.update_status(&operation.id, outcome.to).await? {
            return Err(ProcessorError::NotFound(operation.id.clone()));
        }
        tracing::debug!(
            event_name = "opgate.lifecycle.transition",
            operation_id = %operation.id,
            from = %outcome.from,
            to = %outcome.to,
            "operation status changed"
        );
        operation.status = outcome.to;
        Ok(())
    }

    fn audit_verdict(&self, operation: &AtomicOperation, verdict: &PipelineResult, correlation_id: &str) {
        let outcome = if verdict.passed { AuditOutcome::Success } else { AuditOutcome::Rejected };
        self.audit.emit(
            AuditEvent::from_context(
                &AuditContext::new(Some(operation.id.clone()), correlation_id, ACTOR),
                "verification.completed",
                AuditCategory::Verification,
                outcome,
            )
            .with_metadata("needs_approval", verdict.needs_approval.to_string())
            .with_metadata("confidence", format!("{:.2}", verdict.confidence))
            .with_metadata(
                "blocking_layer",
                verdict.blocking_layer.map(|layer| layer.as_str()).unwrap_or("none"),
            ),
        );
    }
}

fn seeded(request: &str, user_id: &str, source_agent: &str, seed: &Classification) -> Decomposition {
    let mut operation = AtomicOperation::new(request.trim(), user_id, source_agent);
    operation.classification = Some(seed.clone());
    Decomposition {
        original_request: request.trim().to_string(),
        decomposed: false,
        models: BTreeMap::from([(operation.id.clone(), SEED_MODEL.to_string())]),
        reasoning: "Seeded from domain intent".to_string(),
        confidence: seed.confidence,
        operations: vec![operation],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opgate_core::audit::InMemoryAuditSink;
    use opgate_core::config::VerificationMode;
    use opgate_core::domain::execution::{ExecutionResult, ReversibilityInfo};
    use opgate_core::domain::operation::{OperationId, OperationStatus};
    use opgate_core::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };
    use opgate_core::domain::verification::VerificationLayer;
    use opgate_core::execution::ExecutionOutcome;
    use opgate_core::verification::{ApprovalPolicy, VerificationPipeline};
    use opgate_db::{InMemoryStore, OperationRepository};

    use super::{ProcessOptions, Processor, ProcessorError, SEED_MODEL};
    use crate::classifier::{AtomicClassifier, FALLBACK_MODEL};
    use crate::decomposer::AtomicDecomposer;
    use crate::guardrails::ApprovalDecision;

    fn processor(store: &Arc<InMemoryStore>, auto_approve_low_risk: bool) -> Processor {
        Processor::new(
            AtomicDecomposer::new(AtomicClassifier::offline()),
            VerificationPipeline::new(
                VerificationMode::Standard,
                ApprovalPolicy { confidence_threshold: 0.7, auto_approve_low_risk },
            ),
            store.clone(),
            store.clone(),
        )
    }

    #[tokio::test]
    async fn unconfident_fallback_waits_for_approval() {
        let store = Arc::new(InMemoryStore::new());
        let result = processor(&store, true).process_request("show memory usage", "user-1", "cli").await.expect("process");

        assert!(result.success);
        let operation = result.primary().expect("operation");
        assert_eq!(operation.status, OperationStatus::AwaitingApproval);
        assert!(operation.verification_results.contains_key(&VerificationLayer::Syntax));
        assert!(!operation.verification_results.contains_key(&VerificationLayer::Behavioral));

        let log = store.classification_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].model, FALLBACK_MODEL);
    }

    #[tokio::test]
    async fn compound_request_stores_decomposed_parent() {
        let store = Arc::new(InMemoryStore::new());
        let result = processor(&store, false)
            .process_request("list files then delete temp.txt", "user-1", "cli")
            .await
            .expect("process");

        assert_eq!(result.operations.len(), 3);
        let root = result.primary().expect("root");
        assert_eq!(root.status, OperationStatus::Decomposed);
        assert_eq!(root.child_ids.len(), 2);
        assert!(result.reasoning.contains("then"));
        assert_eq!(result.verdicts.len(), 2);
        for leaf in result.leaves() {
            assert_eq!(leaf.status, OperationStatus::AwaitingApproval);
            assert_eq!(leaf.parent_id.as_ref(), Some(&root.id));
        }
        assert_eq!(store.list_children(&root.id).await.expect("children").len(), 2);
    }

    #[tokio::test]
    async fn unsafe_request_fails_verification() {
        let store = Arc::new(InMemoryStore::new());
        let result = processor(&store, true).process_request("sudo rm -rf /", "user-1", "cli").await.expect("process");

        assert!(!result.success);
        let operation = result.primary().expect("operation");
        assert_eq!(operation.status, OperationStatus::Failed);
        assert!(operation.completed_at.is_some());
        let verdict = &result.verdicts[&operation.id];
        assert!(matches!(verdict.decision, ApprovalDecision::Refuse { .. }));
        assert_eq!(verdict.verification.blocking_layer, Some(VerificationLayer::Safety));
    }

    #[tokio::test]
    async fn confident_low_risk_seed_auto_approves() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::default());
        let seed = Classification::from_confident_flag(
            ClassificationLabel::new(Destination::Stream, Consumer::Human, Semantics::Read),
            true,
            "calendar view",
        );
        let options = ProcessOptions { seed: Some(seed), ..ProcessOptions::default() };

        let result = processor(&store, true)
            .with_audit_sink(audit.clone())
            .process_with("show my calendar for today", "user-1", "cli", &options)
            .await
            .expect("process");

        let operation = result.primary().expect("operation");
        assert_eq!(operation.status, OperationStatus::Executing);
        assert_eq!(store.classification_log().await[0].model, SEED_MODEL);
        let transitions = audit
            .events()
            .into_iter()
            .filter(|event| event.event_type == "lifecycle.transition_applied")
            .count();
        assert_eq!(transitions, 2);
    }

    #[tokio::test]
    async fn status_changes_follow_the_lifecycle() {
        let store = Arc::new(InMemoryStore::new());
        let processor = processor(&store, false);
        let result = processor.process_request("show memory usage", "user-1", "cli").await.expect("process");
        let id = result.primary().expect("operation").id.clone();

        let error = processor.update_status(&id, OperationStatus::Complete).await.expect_err("skip execution");
        assert!(matches!(error, ProcessorError::Transition(_)));
        assert_eq!(processor.get_operation(&id).await.expect("get").status, OperationStatus::AwaitingApproval);

        let executing = processor.update_status(&id, OperationStatus::Executing).await.expect("approve");
        assert_eq!(executing.status, OperationStatus::Executing);

        let missing = OperationId("missing".to_string());
        assert!(matches!(
            processor.update_status(&missing, OperationStatus::Executing).await,
            Err(ProcessorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_execution_record_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::default());
        let processor = processor(&store, false).with_audit_sink(audit.clone());
        let result = processor.process_request("show memory usage", "user-1", "cli").await.expect("process");
        let id = result.primary().expect("operation").id.clone();
        let outcome = ExecutionOutcome {
            status: OperationStatus::Complete,
            result: ExecutionResult::failed("never ran", Some(1), 0),
            state_before: None,
            state_after: None,
            reversibility: ReversibilityInfo::irreversible("no snapshot"),
        };

        let error = processor.record_execution(&id, &outcome).await.expect_err("not executing yet");
        assert!(matches!(error, ProcessorError::Transition(_)));

        let stored = processor.get_operation(&id).await.expect("get");
        assert_eq!(stored.status, OperationStatus::AwaitingApproval);
        assert!(stored.execution_result.is_none());
        assert!(stored.reversibility.is_none());
        assert!(audit.events().iter().all(|event| event.event_type != "execution.recorded"));
        assert!(audit.events().iter().any(|event| event.event_type == "lifecycle.transition_rejected"));
    }
}
