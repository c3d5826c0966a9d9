//! Five-layer verification of classified operations.
//!
//! Layers are independent: each inspects the operation and returns a
//! [`VerificationResult`]. The [`VerificationPipeline`] decides which layers
//! run, runs them concurrently and folds their results into a verdict.

pub mod behavioral;
pub mod intent;
pub mod pipeline;
pub mod safety;
pub mod semantic;
pub mod syntax;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::operation::AtomicOperation;
use crate::domain::verification::{VerificationLayer, VerificationResult};

pub use behavioral::BehavioralVerifier;
pub use intent::IntentVerifier;
pub use pipeline::{approval_reasons, needs_approval, ApprovalPolicy, PipelineResult, VerificationPipeline};
pub use safety::SafetyVerifier;
pub use semantic::SemanticVerifier;
pub use syntax::SyntaxVerifier;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Any recursive delete or protected-path write fails.
    Strict,
    #[default]
    Standard,
    /// Protected-path writes warn instead of failing. Blocked commands still fail.
    Permissive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationContext {
    pub user_id: String,
    pub source_agent: String,
    pub safety_level: SafetyLevel,
    /// Extra path prefixes treated like system directories.
    pub protected_paths: Vec<String>,
}

impl VerificationContext {
    pub fn new(user_id: impl Into<String>, source_agent: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            source_agent: source_agent.into(),
            safety_level: SafetyLevel::default(),
            protected_paths: Vec::new(),
        }
    }

    pub fn with_safety_level(mut self, safety_level: SafetyLevel) -> Self {
        self.safety_level = safety_level;
        self
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn layer(&self) -> VerificationLayer;

    /// A failing result must carry at least one issue.
    async fn verify(
        &self,
        operation: &AtomicOperation,
        context: &VerificationContext,
    ) -> VerificationResult;
}

/// Confidence left after deducting a fixed penalty per issue.
pub(crate) fn penalized(base: f64, issues: usize, penalty: f64, floor: f64) -> f64 {
    (base - penalty * issues as f64).max(floor)
}
