use async_trait::async_trait;

use crate::domain::operation::AtomicOperation;
use crate::domain::taxonomy::{Consumer, Destination, Semantics};
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::lexicon::{self, MACHINE_KEYWORDS, MUTATING_VERBS, QUERY_VERBS};
use crate::verification::{penalized, VerificationContext, Verifier};

/// Checks that the classification is coherent with the words of the request.
///
/// Fails only when the classification understates risk, i.e. the request
/// carries a mutating verb but is classified as read or interpret.
#[derive(Clone, Debug, Default)]
pub struct SemanticVerifier;

#[async_trait]
impl Verifier for SemanticVerifier {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Semantic
    }

    async fn verify(
        &self,
        operation: &AtomicOperation,
        _context: &VerificationContext,
    ) -> VerificationResult {
        check_semantics(operation)
    }
}

pub fn check_semantics(operation: &AtomicOperation) -> VerificationResult {
    let layer = VerificationLayer::Semantic;
    let Some(classification) = operation.classification.as_ref() else {
        return VerificationResult::fail(layer, "no classification to check against the request");
    };

    let tokens = lexicon::tokenize(&operation.user_request);
    let mutating = lexicon::first_match(&tokens, MUTATING_VERBS);
    let querying = lexicon::contains_any(&tokens, QUERY_VERBS);

    if classification.semantics != Semantics::Execute && !querying {
        if let Some(verb) = mutating {
            return VerificationResult::fail(
                layer,
                format!(
                    "request contains mutating verb `{verb}` but is classified as {}",
                    classification.semantics
                ),
            )
            .with_details("classification understates side effects");
        }
    }

    let mut issues = Vec::new();
    if classification.semantics == Semantics::Execute && mutating.is_none() && querying {
        issues.push("classified as execute but the request only asks for information".to_string());
    }
    if classification.destination == Destination::File
        && classification.semantics == Semantics::Execute
        && !mentions_file_target(&tokens)
    {
        issues.push("file operation does not name a target file".to_string());
    }
    if classification.consumer == Consumer::Machine
        && !lexicon::contains_any(&tokens, MACHINE_KEYWORDS)
        && classification.semantics == Semantics::Read
    {
        issues.push("machine consumer without a machine-readable format".to_string());
    }

    let confidence = penalized(0.95, issues.len(), 0.2, 0.4);
    VerificationResult::pass(layer, confidence)
        .with_issues(issues)
        .with_details(format!("classification {} is coherent with request", classification.label()))
}

fn mentions_file_target(tokens: &[String]) -> bool {
    tokens.iter().any(|token| {
        token.contains('/')
            || token.rsplit_once('.').is_some_and(|(stem, ext)| {
                !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            || matches!(token.as_str(), "file" | "files" | "notes" | "note" | "scene" | "document")
    })
}

#[cfg(test)]
mod tests {
    use super::check_semantics;
    use crate::domain::operation::AtomicOperation;
    use crate::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };

    fn operation(request: &str, d: Destination, c: Consumer, s: Semantics) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification = Some(Classification::from_confident_flag(
            ClassificationLabel::new(d, c, s),
            true,
            "test",
        ));
        operation
    }

    #[test]
    fn understated_mutation_fails() {
        let result = check_semantics(&operation(
            "delete temp.txt",
            Destination::Stream,
            Consumer::Human,
            Semantics::Interpret,
        ));

        assert!(!result.passed);
        assert!(result.issues[0].contains("`delete`"));
    }

    #[test]
    fn coherent_classification_passes_cleanly() {
        let result = check_semantics(&operation(
            "save to notes.txt",
            Destination::File,
            Consumer::Human,
            Semantics::Execute,
        ));

        assert!(result.passed);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn query_with_execute_semantics_passes_with_warning() {
        let result = check_semantics(&operation(
            "show memory usage",
            Destination::Stream,
            Consumer::Human,
            Semantics::Execute,
        ));

        assert!(result.passed);
        assert_eq!(result.issues.len(), 1);
        assert!(result.confidence < 0.95);
    }

    #[test]
    fn file_write_without_target_warns() {
        let result = check_semantics(&operation(
            "write it down somewhere",
            Destination::File,
            Consumer::Human,
            Semantics::Execute,
        ));

        assert!(result.passed);
        assert_eq!(result.issues, vec!["file operation does not name a target file".to_string()]);
    }
}
