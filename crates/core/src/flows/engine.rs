use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::operation::OperationStatus;
use crate::flows::states::{LifecycleAction, LifecycleEvent, TransitionOutcome};

/// Operation lifecycle state machine.
///
/// `Classifying -> AwaitingVerification -> {AwaitingApproval | Executing} -> {Complete | Failed}`,
/// with `Classifying -> Decomposed` for compound parents.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleEngine;

impl LifecycleEngine {
    pub fn initial_status(&self) -> OperationStatus {
        OperationStatus::Classifying
    }

    pub fn apply(
        &self,
        current: OperationStatus,
        event: LifecycleEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_operation(current, event)
    }

    /// Resolves the event that moves `current` to `target`, then applies it.
    pub fn transition_to(
        &self,
        current: OperationStatus,
        target: OperationStatus,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        let event = event_for(current, target)
            .ok_or(FlowTransitionError::UnreachableStatus { from: current, to: target })?;
        self.apply(current, event)
    }

    pub fn transition_with_audit<S>(
        &self,
        current: OperationStatus,
        target: OperationStatus,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.transition_to(current, target);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "lifecycle.transition_applied",
                        AuditCategory::Lifecycle,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "lifecycle.transition_rejected",
                        AuditCategory::Lifecycle,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {state} using event {event:?}")]
    InvalidTransition { state: OperationStatus, event: LifecycleEvent },
    #[error("no lifecycle event moves an operation from {from} to {to}")]
    UnreachableStatus { from: OperationStatus, to: OperationStatus },
}

fn event_for(current: OperationStatus, target: OperationStatus) -> Option<LifecycleEvent> {
    use LifecycleEvent::{
        ApprovalRequired, Approved, AutoApproved, Classified, Decomposed, ExecutionFailed,
        ExecutionSucceeded, Rejected, VerificationFailed,
    };
    use OperationStatus as S;

    match (current, target) {
        (S::Classifying, S::AwaitingVerification) => Some(Classified),
        (S::Classifying, S::Decomposed) => Some(Decomposed),
        (S::AwaitingVerification, S::AwaitingApproval) => Some(ApprovalRequired),
        (S::AwaitingVerification, S::Executing) => Some(AutoApproved),
        (S::AwaitingVerification, S::Failed) => Some(VerificationFailed),
        (S::AwaitingApproval, S::Executing) => Some(Approved),
        (S::AwaitingApproval, S::Failed) => Some(Rejected),
        (S::Executing, S::Complete) => Some(ExecutionSucceeded),
        (S::Executing, S::Failed) => Some(ExecutionFailed),
        _ => None,
    }
}

fn transition_operation(
    current: OperationStatus,
    event: LifecycleEvent,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use LifecycleAction::{InvokeRunner, PresentForApproval, RecordOutcome, RunVerification};
    use LifecycleEvent::{
        ApprovalRequired, Approved, AutoApproved, Classified, Decomposed, ExecutionFailed,
        ExecutionSucceeded, Rejected, VerificationFailed,
    };
    use OperationStatus as S;

    let (to, actions) = match (current, event) {
        (S::Classifying, Classified) => (S::AwaitingVerification, vec![RunVerification]),
        (S::Classifying, Decomposed) => (S::Decomposed, Vec::new()),
        (S::AwaitingVerification, ApprovalRequired) => {
            (S::AwaitingApproval, vec![PresentForApproval])
        }
        (S::AwaitingVerification, AutoApproved) => (S::Executing, vec![InvokeRunner]),
        (S::AwaitingVerification, VerificationFailed) => (S::Failed, vec![RecordOutcome]),
        (S::AwaitingApproval, Approved) => (S::Executing, vec![InvokeRunner]),
        (S::AwaitingApproval, Rejected) => (S::Failed, vec![RecordOutcome]),
        (S::Executing, ExecutionSucceeded) => (S::Complete, vec![RecordOutcome]),
        (S::Executing, ExecutionFailed) => (S::Failed, vec![RecordOutcome]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition { state: current, event });
        }
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}
