use serde::{Deserialize, Serialize};

use crate::domain::operation::OperationStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Classified,
    Decomposed,
    VerificationFailed,
    ApprovalRequired,
    AutoApproved,
    Approved,
    Rejected,
    ExecutionSucceeded,
    ExecutionFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    RunVerification,
    PresentForApproval,
    InvokeRunner,
    RecordOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: OperationStatus,
    pub to: OperationStatus,
    pub event: LifecycleEvent,
    pub actions: Vec<LifecycleAction>,
}
