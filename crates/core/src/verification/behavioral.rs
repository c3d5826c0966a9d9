use async_trait::async_trait;

use crate::domain::operation::AtomicOperation;
use crate::domain::taxonomy::{Destination, Semantics};
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::lexicon::{self, BROAD_SCOPE_MARKERS, DESTRUCTIVE_VERBS};
use crate::verification::{penalized, VerificationContext, Verifier};

/// Predicts side effects of executing the operation. Findings are warnings;
/// this layer does not fail an operation on its own.
#[derive(Clone, Debug, Default)]
pub struct BehavioralVerifier;

#[async_trait]
impl Verifier for BehavioralVerifier {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Behavioral
    }

    async fn verify(
        &self,
        operation: &AtomicOperation,
        _context: &VerificationContext,
    ) -> VerificationResult {
        predict_side_effects(operation)
    }
}

pub fn predict_side_effects(operation: &AtomicOperation) -> VerificationResult {
    let layer = VerificationLayer::Behavioral;
    let Some(classification) = operation.classification.as_ref() else {
        return VerificationResult::fail(layer, "no classification to predict side effects from");
    };

    if classification.semantics != Semantics::Execute {
        return VerificationResult::pass(layer, 0.95)
            .with_details(format!("{} has no side effects", classification.semantics));
    }

    let tokens = lexicon::tokenize(&operation.user_request);
    let destructive = lexicon::all_matches(&tokens, DESTRUCTIVE_VERBS);
    let broad = lexicon::first_match(&tokens, BROAD_SCOPE_MARKERS);
    let mut issues = Vec::new();

    if !destructive.is_empty() {
        issues.push(format!("destructive action predicted: {}", destructive.join(", ")));
        if let Some(marker) = broad {
            issues.push(format!("destructive action has broad scope (`{marker}`)"));
        }
    }
    if classification.destination == Destination::Process
        && (operation.user_request.trim_end().ends_with('&')
            || lexicon::contains_any(&tokens, &["nohup", "daemon", "background"]))
    {
        issues.push("spawns a background process that outlives the request".to_string());
    }

    let details = match classification.destination {
        Destination::File => "writes persistent state to disk",
        Destination::Process => "starts or controls a system process",
        Destination::Stream => "emits output only",
    };
    VerificationResult::pass(layer, penalized(0.9, issues.len(), 0.25, 0.3))
        .with_issues(issues)
        .with_details(details)
}

#[cfg(test)]
mod tests {
    use super::predict_side_effects;
    use crate::domain::operation::AtomicOperation;
    use crate::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };

    fn operation(request: &str, destination: Destination, semantics: Semantics) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification = Some(Classification::from_confident_flag(
            ClassificationLabel::new(destination, Consumer::Human, semantics),
            true,
            "test",
        ));
        operation
    }

    #[test]
    fn read_operations_have_no_side_effects() {
        let result = predict_side_effects(&operation("list files", Destination::Stream, Semantics::Read));

        assert!(result.passed);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn broad_destructive_action_is_flagged_twice() {
        let result = predict_side_effects(&operation(
            "delete all log files",
            Destination::File,
            Semantics::Execute,
        ));

        assert!(result.passed);
        assert_eq!(result.issues.len(), 2);
        assert!(result.issues[0].contains("delete"));
        assert!(result.issues[1].contains("`all`"));
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn plain_write_is_clean() {
        let result = predict_side_effects(&operation(
            "save to notes.txt",
            Destination::File,
            Semantics::Execute,
        ));

        assert!(result.passed);
        assert!(result.issues.is_empty());
        assert_eq!(result.details, "writes persistent state to disk");
    }
}
