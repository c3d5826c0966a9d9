use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use opgate_core::domain::feedback::{
    ClassificationOutcome, ClassificationStats, CorrectionExample, FeedbackSignal, LearningMetrics,
    TrainingPair, UserFeedback,
};
use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
use opgate_core::domain::taxonomy::Classification;
use opgate_core::domain::verification::{VerificationLayer, VerificationResult};
use opgate_core::execution::ExecutionOutcome;

pub mod feedback;
pub mod memory;
pub mod operation;

pub use feedback::SqlFeedbackRepository;
pub use memory::InMemoryStore;
pub use operation::SqlOperationRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One classifier decision, kept for offline analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationLogEntry {
    pub operation_id: OperationId,
    pub request: String,
    pub classification: Classification,
    /// Backend model id, or `keyword_fallback`
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl ClassificationLogEntry {
    pub fn new(operation: &AtomicOperation, classification: &Classification, model: impl Into<String>) -> Self {
        Self {
            operation_id: operation.id.clone(),
            request: operation.user_request.clone(),
            classification: classification.clone(),
            model: model.into(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn create_operation(&self, operation: &AtomicOperation) -> Result<(), RepositoryError>;
    async fn get_operation(&self, id: &OperationId) -> Result<Option<AtomicOperation>, RepositoryError>;
    async fn list_children(&self, parent_id: &OperationId) -> Result<Vec<AtomicOperation>, RepositoryError>;

    /// Returns `false` when no such operation exists.
    async fn update_status(&self, id: &OperationId, status: OperationStatus) -> Result<bool, RepositoryError>;

    async fn save_verification_results(
        &self,
        id: &OperationId,
        results: &BTreeMap<VerificationLayer, VerificationResult>,
    ) -> Result<bool, RepositoryError>;

    async fn save_execution(&self, id: &OperationId, outcome: &ExecutionOutcome) -> Result<bool, RepositoryError>;

    async fn log_classification(&self, entry: &ClassificationLogEntry) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    async fn store_feedback(&self, feedback: &UserFeedback) -> Result<(), RepositoryError>;
    async fn list_feedback(&self, operation_id: &OperationId) -> Result<Vec<UserFeedback>, RepositoryError>;

    /// Most recent corrections first, for classifier hints.
    async fn recent_corrections(&self, user_id: &str, limit: usize)
        -> Result<Vec<CorrectionExample>, RepositoryError>;

    /// Classified leaf operations created at or after `since`, each joined
    /// with its latest correction and rating.
    async fn classification_outcomes(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClassificationOutcome>, RepositoryError>;

    async fn get_classification_stats(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ClassificationStats, RepositoryError>;

    async fn training_data(&self, user_id: Option<&str>, limit: usize)
        -> Result<Vec<TrainingPair>, RepositoryError>;

    async fn store_learning_metrics(&self, metrics: &LearningMetrics) -> Result<(), RepositoryError>;
}

/// Fixed-width UTC timestamps so text comparison matches time order.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

/// Joins classified leaf operations with the feedback they received.
/// Later feedback replaces earlier feedback of the same kind.
pub(crate) fn join_outcomes(
    operations: &[AtomicOperation],
    feedback: &[UserFeedback],
) -> Vec<ClassificationOutcome> {
    let mut by_operation: HashMap<&OperationId, Vec<&UserFeedback>> = HashMap::new();
    for record in feedback {
        by_operation.entry(&record.operation_id).or_default().push(record);
    }

    operations
        .iter()
        .filter(|operation| !operation.is_decomposed)
        .filter_map(|operation| {
            let classification = operation.classification.as_ref()?;
            let mut records = by_operation.get(&operation.id).cloned().unwrap_or_default();
            records.sort_by_key(|record| record.created_at);

            let mut corrected = None;
            let mut rating = None;
            for record in records {
                match &record.signal {
                    FeedbackSignal::Correction { corrected: label, .. } => corrected = Some(*label),
                    FeedbackSignal::ExplicitRating { rating: value, .. } => rating = Some(*value),
                    _ => {}
                }
            }

            Some(ClassificationOutcome {
                operation_id: operation.id.clone(),
                request: operation.user_request.clone(),
                system: classification.label(),
                system_confidence: classification.confidence,
                corrected,
                rating,
                recorded_at: operation.created_at,
            })
        })
        .collect()
}

pub(crate) fn stats_from_outcomes(outcomes: &[ClassificationOutcome], feedback_count: usize) -> ClassificationStats {
    let total = outcomes.len();
    let changed = outcomes
        .iter()
        .filter(|outcome| outcome.corrected.is_some_and(|corrected| corrected != outcome.system))
        .count();
    let corrections = outcomes.iter().filter(|outcome| outcome.corrected.is_some()).count();
    let ratings: Vec<f64> = outcomes.iter().filter_map(|outcome| outcome.rating.map(f64::from)).collect();

    let mut distribution = BTreeMap::new();
    for outcome in outcomes {
        *distribution.entry(outcome.system.to_string()).or_insert(0usize) += 1;
    }

    ClassificationStats {
        accuracy: if total == 0 { 0.0 } else { (total - changed) as f64 / total as f64 },
        feedback_count,
        distribution,
        avg_rating: if ratings.is_empty() {
            None
        } else {
            Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
        },
        correction_rate: if total == 0 { 0.0 } else { corrections as f64 / total as f64 },
    }
}

/// Corrections as examples, newest first; corrections without a system label are skipped.
pub(crate) fn corrections_from(
    feedback: &[UserFeedback],
    requests: &HashMap<OperationId, String>,
    limit: usize,
) -> Vec<CorrectionExample> {
    let mut corrections: Vec<&UserFeedback> = feedback.iter().collect();
    corrections.sort_by(|left, right| right.created_at.cmp(&left.created_at));
    corrections
        .into_iter()
        .filter_map(|record| match &record.signal {
            FeedbackSignal::Correction { system: Some(system), corrected, .. } => Some(CorrectionExample {
                request: requests.get(&record.operation_id)?.clone(),
                system: *system,
                corrected: *corrected,
            }),
            _ => None,
        })
        .take(limit)
        .collect()
}

pub(crate) fn training_pairs_from(
    feedback: &[UserFeedback],
    requests: &HashMap<OperationId, String>,
    limit: usize,
) -> Vec<TrainingPair> {
    let mut corrections: Vec<&UserFeedback> = feedback.iter().collect();
    corrections.sort_by(|left, right| right.created_at.cmp(&left.created_at));
    corrections
        .into_iter()
        .filter_map(|record| match &record.signal {
            FeedbackSignal::Correction { system: Some(system), corrected, .. } => Some(TrainingPair {
                request: requests.get(&record.operation_id)?.clone(),
                system: *system,
                corrected: *corrected,
                confidence: record.feedback_confidence,
            }),
            _ => None,
        })
        .take(limit)
        .collect()
}
