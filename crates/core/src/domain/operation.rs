use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::execution::{ExecutionResult, ReversibilityInfo, StateSnapshot};
use crate::domain::taxonomy::{Classification, Consumer, Destination, Semantics};
use crate::domain::verification::{VerificationLayer, VerificationResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Classifying,
    AwaitingVerification,
    AwaitingApproval,
    Executing,
    Complete,
    Failed,
    Decomposed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classifying => "classifying",
            Self::AwaitingVerification => "awaiting_verification",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Decomposed => "decomposed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "classifying" => Some(Self::Classifying),
            "awaiting_verification" => Some(Self::AwaitingVerification),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "executing" => Some(Self::Executing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "decomposed" => Some(Self::Decomposed),
            _ => None,
        }
    }

    /// Complete and failed end an operation. Decomposed ends a parent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Decomposed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest unit of user intent after decomposition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicOperation {
    pub id: OperationId,
    pub user_request: String,
    pub user_id: String,
    pub source_agent: String,
    pub classification: Option<Classification>,
    pub is_decomposed: bool,
    pub parent_id: Option<OperationId>,
    pub child_ids: Vec<OperationId>,
    pub verification_results: BTreeMap<VerificationLayer, VerificationResult>,
    pub status: OperationStatus,
    pub execution_result: Option<ExecutionResult>,
    pub state_before: Option<StateSnapshot>,
    pub state_after: Option<StateSnapshot>,
    pub reversibility: Option<ReversibilityInfo>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AtomicOperation {
    pub fn new(
        user_request: impl Into<String>,
        user_id: impl Into<String>,
        source_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            user_request: user_request.into(),
            user_id: user_id.into(),
            source_agent: source_agent.into(),
            classification: None,
            is_decomposed: false,
            parent_id: None,
            child_ids: Vec::new(),
            verification_results: BTreeMap::new(),
            status: OperationStatus::Classifying,
            execution_result: None,
            state_before: None,
            state_after: None,
            reversibility: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<OperationId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn destination(&self) -> Option<Destination> {
        self.classification.as_ref().map(|c| c.destination)
    }

    pub fn consumer(&self) -> Option<Consumer> {
        self.classification.as_ref().map(|c| c.consumer)
    }

    pub fn semantics(&self) -> Option<Semantics> {
        self.classification.as_ref().map(|c| c.semantics)
    }

    /// Classification confidence, or zero when unclassified.
    pub fn confidence(&self) -> f64 {
        self.classification.as_ref().map_or(0.0, |c| c.confidence)
    }

    /// False when no layer ran, or when syntax or safety ran and failed.
    pub fn is_verified(&self) -> bool {
        if self.verification_results.is_empty() {
            return false;
        }
        VerificationLayer::MANDATORY.iter().all(|layer| {
            self.verification_results.get(layer).map_or(true, |result| result.passed)
        })
    }

    /// Sum of layer confidences weighted 0.2 each, over layers that ran.
    pub fn verification_confidence(&self) -> f64 {
        self.verification_results
            .values()
            .map(|result| result.confidence * VerificationLayer::DEFAULT_WEIGHT)
            .sum()
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_decomposed
    }
}

/// Status of a decomposed parent derived from its children; never stored.
///
/// Any child still in flight keeps the parent `Decomposed`. Once every child
/// is terminal the parent reads `Complete` if all completed, else `Failed`.
pub fn derive_parent_status(children: &[OperationStatus]) -> OperationStatus {
    if children.is_empty() || children.iter().any(|status| !status.is_terminal()) {
        return OperationStatus::Decomposed;
    }
    if children.iter().all(|status| *status == OperationStatus::Complete) {
        OperationStatus::Complete
    } else if children.iter().any(|status| *status == OperationStatus::Failed) {
        OperationStatus::Failed
    } else {
        OperationStatus::Decomposed
    }
}
