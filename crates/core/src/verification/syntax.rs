use async_trait::async_trait;

use crate::domain::operation::AtomicOperation;
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::verification::{VerificationContext, Verifier};

pub const MAX_REQUEST_CHARS: usize = 4_000;

/// Structural checks: the operation is well formed enough to reason about.
#[derive(Clone, Debug, Default)]
pub struct SyntaxVerifier;

#[async_trait]
impl Verifier for SyntaxVerifier {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Syntax
    }

    async fn verify(
        &self,
        operation: &AtomicOperation,
        _context: &VerificationContext,
    ) -> VerificationResult {
        check_syntax(operation)
    }
}

pub fn check_syntax(operation: &AtomicOperation) -> VerificationResult {
    let layer = VerificationLayer::Syntax;
    let request = operation.user_request.trim();
    let mut issues = Vec::new();

    if request.is_empty() {
        issues.push("request is empty".to_string());
    }
    if request.chars().count() > MAX_REQUEST_CHARS {
        issues.push(format!("request exceeds {MAX_REQUEST_CHARS} characters"));
    }
    if request.chars().any(|c| c.is_control() && !matches!(c, '\n' | '\t' | '\r')) {
        issues.push("request contains control characters".to_string());
    }
    if request.matches('"').count() % 2 != 0 || request.matches('`').count() % 2 != 0 {
        issues.push("request has unbalanced quotes".to_string());
    }
    if operation.classification.is_none() {
        issues.push("operation has not been classified".to_string());
    }
    if operation.is_decomposed {
        issues.push("decomposed parent operations are never executed".to_string());
    }

    if issues.is_empty() {
        VerificationResult::pass(layer, 1.0).with_details("request is well formed")
    } else {
        VerificationResult::new(layer, false, 0.0)
            .with_issues(issues)
            .with_details("request failed structural checks")
    }
}
