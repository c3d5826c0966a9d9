use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use opgate_core::domain::feedback::{
    ClassificationOutcome, ClassificationStats, CorrectionExample, FeedbackType, LearningMetrics,
    TrainingPair, UserFeedback,
};
use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
use opgate_core::domain::verification::{VerificationLayer, VerificationResult};
use opgate_core::execution::ExecutionOutcome;

use super::{
    corrections_from, join_outcomes, stats_from_outcomes, training_pairs_from, ClassificationLogEntry,
    FeedbackRepository, OperationRepository, RepositoryError,
};

/// Operations and feedback held in process memory. Used by tests and by runs
/// configured without a database.
#[derive(Default)]
pub struct InMemoryStore {
    operations: RwLock<HashMap<String, AtomicOperation>>,
    classification_log: RwLock<Vec<ClassificationLogEntry>>,
    feedback: RwLock<Vec<UserFeedback>>,
    learning_metrics: RwLock<Vec<LearningMetrics>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn classification_log(&self) -> Vec<ClassificationLogEntry> {
        self.classification_log.read().await.clone()
    }

    pub async fn learning_metrics(&self) -> Vec<LearningMetrics> {
        self.learning_metrics.read().await.clone()
    }

    async fn with_operation(
        &self,
        id: &OperationId,
        apply: impl FnOnce(&mut AtomicOperation) + Send,
    ) -> bool {
        let mut operations = self.operations.write().await;
        match operations.get_mut(&id.0) {
            Some(operation) => {
                apply(operation);
                true
            }
            None => false,
        }
    }

    async fn requests(&self) -> HashMap<OperationId, String> {
        self.operations
            .read()
            .await
            .values()
            .map(|operation| (operation.id.clone(), operation.user_request.clone()))
            .collect()
    }

    async fn corrections(&self, user_id: Option<&str>) -> Vec<UserFeedback> {
        self.feedback
            .read()
            .await
            .iter()
            .filter(|record| record.feedback_type() == FeedbackType::Correction)
            .filter(|record| user_id.map_or(true, |user_id| record.user_id == user_id))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl OperationRepository for InMemoryStore {
    async fn create_operation(&self, operation: &AtomicOperation) -> Result<(), RepositoryError> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.id.0) {
            return Err(RepositoryError::Decode(format!("operation `{}` already exists", operation.id)));
        }
        operations.insert(operation.id.0.clone(), operation.clone());
        Ok(())
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<AtomicOperation>, RepositoryError> {
        Ok(self.operations.read().await.get(&id.0).cloned())
    }

    async fn list_children(&self, parent_id: &OperationId) -> Result<Vec<AtomicOperation>, RepositoryError> {
        let operations = self.operations.read().await;
        let Some(parent) = operations.get(&parent_id.0) else {
            return Ok(Vec::new());
        };
        Ok(parent.child_ids.iter().filter_map(|id| operations.get(&id.0).cloned()).collect())
    }

    async fn update_status(&self, id: &OperationId, status: OperationStatus) -> Result<bool, RepositoryError> {
        Ok(self
            .with_operation(id, |operation| {
                operation.status = status;
                if status.is_terminal() {
                    operation.completed_at = Some(Utc::now());
                }
            })
            .await)
    }

    async fn save_verification_results(
        &self,
        id: &OperationId,
        results: &BTreeMap<VerificationLayer, VerificationResult>,
    ) -> Result<bool, RepositoryError> {
        let results = results.clone();
        Ok(self.with_operation(id, |operation| operation.verification_results = results).await)
    }

    async fn save_execution(&self, id: &OperationId, outcome: &ExecutionOutcome) -> Result<bool, RepositoryError> {
        let outcome = outcome.clone();
        Ok(self
            .with_operation(id, |operation| {
                operation.execution_result = Some(outcome.result);
                operation.state_before = outcome.state_before;
                operation.state_after = outcome.state_after;
                operation.reversibility = Some(outcome.reversibility);
            })
            .await)
    }

    async fn log_classification(&self, entry: &ClassificationLogEntry) -> Result<(), RepositoryError> {
        self.classification_log.write().await.push(entry.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl FeedbackRepository for InMemoryStore {
    async fn store_feedback(&self, feedback: &UserFeedback) -> Result<(), RepositoryError> {
        if !self.operations.read().await.contains_key(&feedback.operation_id.0) {
            return Err(RepositoryError::Decode(format!(
                "feedback references unknown operation `{}`",
                feedback.operation_id
            )));
        }
        self.feedback.write().await.push(feedback.clone());
        Ok(())
    }

    async fn list_feedback(&self, operation_id: &OperationId) -> Result<Vec<UserFeedback>, RepositoryError> {
        let mut records: Vec<UserFeedback> = self
            .feedback
            .read()
            .await
            .iter()
            .filter(|record| &record.operation_id == operation_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn recent_corrections(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionExample>, RepositoryError> {
        let corrections = self.corrections(Some(user_id)).await;
        Ok(corrections_from(&corrections, &self.requests().await, limit))
    }

    async fn classification_outcomes(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClassificationOutcome>, RepositoryError> {
        let mut operations: Vec<AtomicOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|operation| operation.user_id == user_id)
            .filter(|operation| since.map_or(true, |since| operation.created_at >= since))
            .cloned()
            .collect();
        operations.sort_by_key(|operation| operation.created_at);

        let feedback: Vec<UserFeedback> =
            self.feedback.read().await.iter().filter(|record| record.user_id == user_id).cloned().collect();
        Ok(join_outcomes(&operations, &feedback))
    }

    async fn get_classification_stats(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ClassificationStats, RepositoryError> {
        let outcomes = self.classification_outcomes(user_id, since).await?;
        let feedback_count = self
            .feedback
            .read()
            .await
            .iter()
            .filter(|record| record.user_id == user_id)
            .filter(|record| since.map_or(true, |since| record.created_at >= since))
            .count();
        Ok(stats_from_outcomes(&outcomes, feedback_count))
    }

    async fn training_data(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TrainingPair>, RepositoryError> {
        let corrections = self.corrections(user_id).await;
        Ok(training_pairs_from(&corrections, &self.requests().await, limit))
    }

    async fn store_learning_metrics(&self, metrics: &LearningMetrics) -> Result<(), RepositoryError> {
        self.learning_metrics.write().await.push(metrics.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opgate_core::domain::feedback::{FeedbackSignal, UserFeedback};
    use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
    use opgate_core::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };

    use super::InMemoryStore;
    use crate::repositories::{FeedbackRepository, OperationRepository};

    fn classified(request: &str) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification = Some(Classification::from_confident_flag(
            ClassificationLabel::new(Destination::Stream, Consumer::Human, Semantics::Read),
            true,
            "test",
        ));
        operation
    }

    #[tokio::test]
    async fn in_memory_store_tracks_status_and_children() {
        let store = InMemoryStore::new();
        let mut parent = AtomicOperation::new("list files then show disk usage", "user-1", "cli");
        let child = classified("list files").with_parent(Some(parent.id.clone()));
        parent.is_decomposed = true;
        parent.child_ids = vec![child.id.clone()];

        store.create_operation(&parent).await.expect("create parent");
        store.create_operation(&child).await.expect("create child");
        assert!(store.create_operation(&child).await.is_err());

        assert!(store.update_status(&child.id, OperationStatus::Failed).await.expect("update"));
        let children = store.list_children(&parent.id).await.expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, OperationStatus::Failed);
        assert!(children[0].completed_at.is_some());

        let missing = OperationId("missing".to_string());
        assert!(!store.update_status(&missing, OperationStatus::Complete).await.expect("update"));
    }

    #[tokio::test]
    async fn feedback_requires_known_operation() {
        let store = InMemoryStore::new();
        let operation = classified("show memory usage");
        let rating = UserFeedback::new(
            operation.id.clone(),
            "user-1",
            FeedbackSignal::ExplicitRating { rating: 5, dimensions: Default::default(), comment: None },
            0.9,
        );

        assert!(store.store_feedback(&rating).await.is_err());

        store.create_operation(&operation).await.expect("create");
        store.store_feedback(&rating).await.expect("store");
        let stats = store.get_classification_stats("user-1", None).await.expect("stats");
        assert_eq!(stats.accuracy, 1.0);
        assert_eq!(stats.avg_rating, Some(5.0));
        assert_eq!(stats.feedback_count, 1);
    }
}
