use opgate_core::config::PipelineConfig;
use opgate_core::domain::operation::OperationStatus;
use opgate_core::domain::verification::VerificationLayer;
use opgate_core::verification::PipelineResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApprove,
    RequireApproval { reason_codes: Vec<String> },
    Refuse { reason_code: &'static str, blocking_layer: Option<VerificationLayer> },
}

impl ApprovalDecision {
    /// Status an operation leaves `AwaitingVerification` for.
    pub fn status(&self) -> OperationStatus {
        match self {
            Self::AutoApprove => OperationStatus::Executing,
            Self::RequireApproval { .. } => OperationStatus::AwaitingApproval,
            Self::Refuse { .. } => OperationStatus::Failed,
        }
    }
}

/// Turns a pipeline verdict into the next lifecycle step. The approval rule
/// itself lives in the pipeline; this only adds the auto-approve switch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApprovalGuardrail {
    pub auto_approve_low_risk: bool,
}

impl ApprovalGuardrail {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self { auto_approve_low_risk: config.auto_approve_low_risk }
    }

    pub fn evaluate(&self, verdict: &PipelineResult) -> ApprovalDecision {
        if !verdict.passed {
            return ApprovalDecision::Refuse {
                reason_code: "verification_failed",
                blocking_layer: verdict.blocking_layer,
            };
        }

        if !verdict.needs_approval && self.auto_approve_low_risk {
            return ApprovalDecision::AutoApprove;
        }
        let mut reason_codes = verdict.approval_reasons.clone();
        if reason_codes.is_empty() {
            reason_codes.push("auto_approve_disabled".to_string());
        }
        ApprovalDecision::RequireApproval { reason_codes }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opgate_core::domain::operation::OperationStatus;
    use opgate_core::domain::verification::VerificationLayer;
    use opgate_core::verification::PipelineResult;

    use super::{ApprovalDecision, ApprovalGuardrail};

    fn verdict(passed: bool, approval_reasons: &[&str]) -> PipelineResult {
        PipelineResult {
            passed,
            results: BTreeMap::new(),
            warnings: Vec::new(),
            blocking_layer: (!passed).then_some(VerificationLayer::Safety),
            confidence: 0.8,
            needs_approval: !approval_reasons.is_empty(),
            approval_reasons: approval_reasons.iter().map(|reason| reason.to_string()).collect(),
        }
    }

    fn auto() -> ApprovalGuardrail {
        ApprovalGuardrail { auto_approve_low_risk: true }
    }

    #[test]
    fn failed_verification_is_refused() {
        let decision = auto().evaluate(&verdict(false, &[]));

        let (reason_code, blocking_layer) = match decision {
            ApprovalDecision::Refuse { reason_code, blocking_layer } => (reason_code, blocking_layer),
            _ => ("", None),
        };
        assert_eq!(reason_code, "verification_failed");
        assert_eq!(blocking_layer, Some(VerificationLayer::Safety));
    }

    #[test]
    fn clean_verdicts_auto_approve_only_when_enabled() {
        assert_eq!(auto().evaluate(&verdict(true, &[])), ApprovalDecision::AutoApprove);
        assert_eq!(
            ApprovalGuardrail::default().evaluate(&verdict(true, &[])),
            ApprovalDecision::RequireApproval { reason_codes: vec!["auto_approve_disabled".to_string()] }
        );
    }

    #[test]
    fn approval_reasons_never_auto_execute() {
        let decision = auto().evaluate(&verdict(true, &["mutating_operation", "low_confidence"]));

        assert_eq!(decision.status(), OperationStatus::AwaitingApproval);
        assert_eq!(
            decision,
            ApprovalDecision::RequireApproval {
                reason_codes: vec!["mutating_operation".to_string(), "low_confidence".to_string()]
            }
        );
    }
}
