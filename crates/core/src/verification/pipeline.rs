use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, VerificationMode};
use crate::domain::operation::AtomicOperation;
use crate::domain::taxonomy::Classification;
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::verification::{
    BehavioralVerifier, IntentVerifier, SafetyVerifier, SemanticVerifier, SyntaxVerifier,
    VerificationContext, Verifier,
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub confidence_threshold: f64,
    pub auto_approve_low_risk: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self { confidence_threshold: 0.7, auto_approve_low_risk: false }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub passed: bool,
    pub results: BTreeMap<VerificationLayer, VerificationResult>,
    pub warnings: Vec<String>,
    pub blocking_layer: Option<VerificationLayer>,
    pub confidence: f64,
    pub needs_approval: bool,
    /// Reason codes behind `needs_approval`; empty when it is false.
    pub approval_reasons: Vec<String>,
}

/// Why a human must confirm before execution, independent of pass/fail.
///
/// Approval is required when any layer raised an issue, when the
/// classification writes a file or controls a process, or when classification
/// confidence is below the threshold. A missing classification always needs
/// approval.
pub fn approval_reasons(
    classification: Option<&Classification>,
    warnings: &[String],
    confidence_threshold: f64,
) -> Vec<&'static str> {
    let mut reasons = Vec::new();
    match classification {
        None => reasons.push("missing_classification"),
        Some(classification) => {
            if classification.is_mutating() {
                reasons.push("mutating_operation");
            }
            if classification.confidence < confidence_threshold {
                reasons.push("low_confidence");
            }
        }
    }
    if !warnings.is_empty() {
        reasons.push("verification_warnings");
    }
    reasons
}

pub fn needs_approval(
    classification: Option<&Classification>,
    warnings: &[String],
    confidence_threshold: f64,
) -> bool {
    !approval_reasons(classification, warnings, confidence_threshold).is_empty()
}

pub struct VerificationPipeline {
    mode: VerificationMode,
    policy: ApprovalPolicy,
    verifiers: BTreeMap<VerificationLayer, Arc<dyn Verifier>>,
}

impl VerificationPipeline {
    pub fn new(mode: VerificationMode, policy: ApprovalPolicy) -> Self {
        let defaults: [Arc<dyn Verifier>; 5] = [
            Arc::new(SyntaxVerifier),
            Arc::new(SemanticVerifier),
            Arc::new(BehavioralVerifier),
            Arc::new(SafetyVerifier),
            Arc::new(IntentVerifier),
        ];
        let verifiers = defaults.into_iter().map(|verifier| (verifier.layer(), verifier)).collect();
        Self { mode, policy, verifiers }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.mode,
            ApprovalPolicy {
                confidence_threshold: config.approval_confidence_threshold,
                auto_approve_low_risk: config.auto_approve_low_risk,
            },
        )
    }

    /// Replaces the verifier registered for the same layer.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.insert(verifier.layer(), verifier);
        self
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Layers that run for this operation, in pipeline order.
    pub fn layers_for(&self, operation: &AtomicOperation) -> Vec<VerificationLayer> {
        let high_risk = operation.classification.as_ref().map_or(true, Classification::is_mutating);
        VerificationLayer::ORDERED
            .into_iter()
            .filter(|layer| {
                layer.is_mandatory()
                    || high_risk
                    || match self.mode {
                        VerificationMode::Strict => true,
                        VerificationMode::Standard => *layer != VerificationLayer::Behavioral,
                        VerificationMode::Fast => false,
                    }
            })
            .collect()
    }

    pub async fn verify(
        &self,
        operation: &AtomicOperation,
        context: &VerificationContext,
    ) -> PipelineResult {
        let layers = self.layers_for(operation);
        let runs = layers.iter().filter_map(|layer| self.verifiers.get(layer)).map(|verifier| {
            let verifier = Arc::clone(verifier);
            async move {
                let started = Instant::now();
                let mut result = verifier.verify(operation, context).await;
                result.layer = verifier.layer();
                result.execution_time_ms = started.elapsed().as_millis() as u64;
                if !result.passed && result.issues.is_empty() {
                    result.issues.push(format!("{} verification failed", result.layer));
                }
                result
            }
        });
        let results: BTreeMap<VerificationLayer, VerificationResult> =
            join_all(runs).await.into_iter().map(|result| (result.layer, result)).collect();

        let verdict = self.render(operation, results);
        tracing::debug!(
            event_name = "opgate.verify.completed",
            operation_id = %operation.id,
            passed = verdict.passed,
            needs_approval = verdict.needs_approval,
            confidence = verdict.confidence,
            blocking_layer = verdict.blocking_layer.map(|layer| layer.as_str()).unwrap_or("none"),
            "verification completed"
        );
        verdict
    }

    fn render(
        &self,
        operation: &AtomicOperation,
        results: BTreeMap<VerificationLayer, VerificationResult>,
    ) -> PipelineResult {
        let passed = VerificationLayer::MANDATORY
            .iter()
            .all(|layer| results.get(layer).map_or(true, |result| result.passed));
        let blocking_layer = VerificationLayer::ORDERED
            .into_iter()
            .find(|layer| results.get(layer).is_some_and(|result| !result.passed));
        let warnings: Vec<String> = VerificationLayer::ORDERED
            .iter()
            .filter_map(|layer| results.get(layer))
            .flat_map(|result| result.issues.iter().cloned())
            .collect();
        let confidence = results
            .values()
            .map(|result| result.confidence * VerificationLayer::DEFAULT_WEIGHT)
            .sum();
        let approval_reasons: Vec<String> = approval_reasons(
            operation.classification.as_ref(),
            &warnings,
            self.policy.confidence_threshold,
        )
        .into_iter()
        .map(str::to_string)
        .collect();

        PipelineResult {
            passed,
            results,
            warnings,
            blocking_layer,
            confidence,
            needs_approval: !approval_reasons.is_empty(),
            approval_reasons,
        }
    }
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::new(VerificationMode::Standard, ApprovalPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{approval_reasons, needs_approval, ApprovalPolicy, VerificationPipeline};
    use crate::config::VerificationMode;
    use crate::domain::operation::{AtomicOperation, OperationStatus};
    use crate::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };
    use crate::domain::verification::{VerificationLayer, VerificationResult};
    use crate::verification::{VerificationContext, Verifier};

    fn operation(request: &str, label: ClassificationLabel, confident: bool) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification =
            Some(Classification::from_confident_flag(label, confident, "test"));
        operation.status = OperationStatus::AwaitingVerification;
        operation
    }

    fn label(d: Destination, c: Consumer, s: Semantics) -> ClassificationLabel {
        ClassificationLabel::new(d, c, s)
    }

    struct Fixed(VerificationLayer, bool);

    #[async_trait]
    impl Verifier for Fixed {
        fn layer(&self) -> VerificationLayer {
            self.0
        }

        async fn verify(
            &self,
            _operation: &AtomicOperation,
            _context: &VerificationContext,
        ) -> VerificationResult {
            if self.1 {
                VerificationResult::pass(self.0, 1.0)
            } else {
                VerificationResult::new(self.0, false, 0.0)
            }
        }
    }

    fn context() -> VerificationContext {
        VerificationContext::new("user-1", "cli")
    }

    #[test]
    fn mutating_classifications_always_need_approval() {
        for destination in [Destination::File, Destination::Process] {
            for consumer in [Consumer::Human, Consumer::Machine] {
                let classification = Classification::from_confident_flag(
                    label(destination, consumer, Semantics::Execute),
                    true,
                    "sure",
                );
                assert!(needs_approval(Some(&classification), &[], 0.7));
            }
        }
    }

    #[test]
    fn low_confidence_forces_approval_even_for_low_risk() {
        let classification = Classification::from_confident_flag(
            label(Destination::Stream, Consumer::Human, Semantics::Interpret),
            false,
            "keyword fallback",
        );

        assert_eq!(approval_reasons(Some(&classification), &[], 0.7), vec!["low_confidence"]);
        assert_eq!(approval_reasons(None, &[], 0.7), vec!["missing_classification"]);
    }

    #[test]
    fn mode_controls_non_mandatory_layers_for_low_risk() {
        let low_risk =
            operation("show memory usage", label(Destination::Stream, Consumer::Human, Semantics::Read), true);
        let high_risk =
            operation("save to notes.txt", label(Destination::File, Consumer::Human, Semantics::Execute), true);

        let fast = VerificationPipeline::new(VerificationMode::Fast, ApprovalPolicy::default());
        assert_eq!(
            fast.layers_for(&low_risk),
            vec![VerificationLayer::Syntax, VerificationLayer::Safety]
        );
        assert_eq!(fast.layers_for(&high_risk), VerificationLayer::ORDERED.to_vec());

        let standard = VerificationPipeline::default();
        assert!(!standard.layers_for(&low_risk).contains(&VerificationLayer::Behavioral));

        let strict = VerificationPipeline::new(VerificationMode::Strict, ApprovalPolicy::default());
        assert_eq!(strict.layers_for(&low_risk), VerificationLayer::ORDERED.to_vec());
    }

    #[tokio::test]
    async fn safety_failure_is_load_bearing() {
        let pipeline = VerificationPipeline::new(VerificationMode::Strict, ApprovalPolicy::default())
            .with_verifier(Arc::new(Fixed(VerificationLayer::Syntax, true)))
            .with_verifier(Arc::new(Fixed(VerificationLayer::Semantic, true)))
            .with_verifier(Arc::new(Fixed(VerificationLayer::Behavioral, true)))
            .with_verifier(Arc::new(Fixed(VerificationLayer::Safety, false)))
            .with_verifier(Arc::new(Fixed(VerificationLayer::Intent, true)));
        let op = operation("anything", label(Destination::Stream, Consumer::Human, Semantics::Read), true);

        let result = pipeline.verify(&op, &context()).await;

        assert!(!result.passed);
        assert_eq!(result.blocking_layer, Some(VerificationLayer::Safety));
        assert_eq!(result.results.len(), 5);
        assert!(!result.results[&VerificationLayer::Safety].issues.is_empty());
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_mandatory_failure_routes_to_approval() {
        let pipeline = VerificationPipeline::new(
            VerificationMode::Strict,
            ApprovalPolicy { confidence_threshold: 0.7, auto_approve_low_risk: true },
        )
        .with_verifier(Arc::new(Fixed(VerificationLayer::Semantic, false)));
        let op = operation("show memory usage", label(Destination::Stream, Consumer::Human, Semantics::Read), true);

        let result = pipeline.verify(&op, &context()).await;

        assert!(result.passed);
        assert_eq!(result.blocking_layer, Some(VerificationLayer::Semantic));
        assert!(result.approval_reasons.contains(&"verification_warnings".to_string()));
    }

    #[tokio::test]
    async fn greeting_from_fallback_passes_but_needs_approval() {
        let pipeline = VerificationPipeline::default();
        let op = operation("good morning", label(Destination::Stream, Consumer::Human, Semantics::Interpret), false);

        let result = pipeline.verify(&op, &context()).await;

        assert!(result.passed);
        assert!(result.needs_approval);
        assert!(result.approval_reasons.contains(&"low_confidence".to_string()));
    }

    #[tokio::test]
    async fn confident_file_write_passes_but_needs_approval() {
        let pipeline = VerificationPipeline::new(
            VerificationMode::Standard,
            ApprovalPolicy { confidence_threshold: 0.7, auto_approve_low_risk: true },
        );
        let op = operation("save to notes.txt", label(Destination::File, Consumer::Human, Semantics::Execute), true);

        let result = pipeline.verify(&op, &context()).await;

        assert!(result.passed);
        assert!(result.results[&VerificationLayer::Syntax].passed);
        assert!(result.results[&VerificationLayer::Safety].passed);
        assert!(result.approval_reasons.contains(&"mutating_operation".to_string()));
    }

    #[tokio::test]
    async fn clean_low_risk_read_needs_no_approval() {
        let op = operation("show memory usage", label(Destination::Stream, Consumer::Human, Semantics::Read), true);

        let result = VerificationPipeline::default().verify(&op, &context()).await;
        assert!(result.passed);
        assert!(!result.needs_approval);
        assert!(result.approval_reasons.is_empty());
        assert_eq!(result.results.len(), 4);
    }

    #[tokio::test]
    async fn mislabelled_protected_write_is_blocked_by_safety() {
        let pipeline = VerificationPipeline::new(
            VerificationMode::Standard,
            ApprovalPolicy { confidence_threshold: 0.7, auto_approve_low_risk: true },
        );
        let op = operation(
            "check and overwrite /etc/passwd",
            label(Destination::Stream, Consumer::Human, Semantics::Read),
            true,
        );

        let result = pipeline.verify(&op, &context()).await;

        assert!(!result.passed);
        assert_eq!(result.blocking_layer, Some(VerificationLayer::Safety));
        assert!(!result.results.contains_key(&VerificationLayer::Behavioral));
        assert!(result.warnings.contains(&"modifies protected path `/etc/passwd`".to_string()));
    }
}
