use async_trait::async_trait;

use crate::domain::operation::AtomicOperation;
use crate::domain::taxonomy::{Semantics, CONFIDENT_THRESHOLD};
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::lexicon::{self, INTERROGATIVES};
use crate::verification::{VerificationContext, Verifier};

/// Deterministic intent check. An LLM-backed judge can replace this layer.
#[derive(Clone, Debug, Default)]
pub struct IntentVerifier;

#[async_trait]
impl Verifier for IntentVerifier {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Intent
    }

    async fn verify(
        &self,
        operation: &AtomicOperation,
        _context: &VerificationContext,
    ) -> VerificationResult {
        check_intent(operation)
    }
}

pub fn check_intent(operation: &AtomicOperation) -> VerificationResult {
    let layer = VerificationLayer::Intent;
    let Some(classification) = operation.classification.as_ref() else {
        return VerificationResult::fail(layer, "no classification to compare with intent");
    };

    let mut issues = Vec::new();
    if classification.confidence < CONFIDENT_THRESHOLD {
        issues.push(format!("classification is uncertain ({:.2})", classification.confidence));
    }

    let tokens = lexicon::tokenize(&operation.user_request);
    let is_question = operation.user_request.trim_end().ends_with('?')
        || tokens.first().is_some_and(|first| INTERROGATIVES.contains(&first.as_str()));
    if is_question && classification.semantics == Semantics::Execute {
        issues.push("request reads as a question but is classified as execute".to_string());
    }

    VerificationResult::pass(layer, classification.confidence.min(1.0))
        .with_issues(issues)
        .with_details(classification.reasoning.clone())
}

#[cfg(test)]
mod tests {
    use super::check_intent;
    use crate::domain::operation::AtomicOperation;
    use crate::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };

    fn operation(request: &str, semantics: Semantics, confident: bool) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification = Some(Classification::from_confident_flag(
            ClassificationLabel::new(Destination::Stream, Consumer::Human, semantics),
            confident,
            "test",
        ));
        operation
    }

    #[test]
    fn uncertain_classification_is_a_warning() {
        let result = check_intent(&operation("good morning", Semantics::Interpret, false));

        assert!(result.passed);
        assert_eq!(result.issues, vec!["classification is uncertain (0.30)".to_string()]);
        assert_eq!(result.confidence, 0.3);
    }

    #[test]
    fn question_classified_as_execute_is_flagged() {
        let result = check_intent(&operation("what is running on port 80?", Semantics::Execute, true));

        assert!(result.passed);
        assert_eq!(result.issues.len(), 1);
    }

    #[test]
    fn confident_matching_intent_is_clean() {
        let result = check_intent(&operation("show memory usage", Semantics::Read, true));

        assert!(result.issues.is_empty());
        assert_eq!(result.confidence, 0.9);
    }
}
