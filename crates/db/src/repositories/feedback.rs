use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use opgate_core::domain::feedback::{
    ClassificationOutcome, ClassificationStats, CorrectionExample, FeedbackId, FeedbackSignal,
    LearningMetrics, TrainingPair, UserFeedback,
};
use opgate_core::domain::operation::OperationId;

use super::operation::SqlOperationRepository;
use super::{
    corrections_from, format_timestamp, join_outcomes, parse_timestamp, stats_from_outcomes,
    training_pairs_from, FeedbackRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlFeedbackRepository {
    pool: DbPool,
    operations: SqlOperationRepository,
}

impl SqlFeedbackRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { operations: SqlOperationRepository::new(pool.clone()), pool }
    }

    async fn corrections(&self, user_id: Option<&str>) -> Result<Vec<UserFeedback>, RepositoryError> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(
                    "SELECT id, operation_id, user_id, payload_json, feedback_confidence, created_at
                     FROM user_feedback
                     WHERE feedback_type = 'correction' AND user_id = ?
                     ORDER BY created_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, operation_id, user_id, payload_json, feedback_confidence, created_at
                     FROM user_feedback
                     WHERE feedback_type = 'correction'
                     ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(feedback_from_row).collect()
    }

    async fn requests_for(&self, feedback: &[UserFeedback]) -> Result<HashMap<OperationId, String>, RepositoryError> {
        let mut requests = HashMap::new();
        for record in feedback {
            if requests.contains_key(&record.operation_id) {
                continue;
            }
            let request: Option<String> = sqlx::query("SELECT user_request FROM atomic_operations WHERE id = ?")
                .bind(&record.operation_id.0)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get("user_request"))
                .transpose()?;
            if let Some(request) = request {
                requests.insert(record.operation_id.clone(), request);
            }
        }
        Ok(requests)
    }

    async fn feedback_for_user(&self, user_id: &str) -> Result<Vec<UserFeedback>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, operation_id, user_id, payload_json, feedback_confidence, created_at
             FROM user_feedback
             WHERE user_id = ?
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(feedback_from_row).collect()
    }
}

#[async_trait::async_trait]
impl FeedbackRepository for SqlFeedbackRepository {
    async fn store_feedback(&self, feedback: &UserFeedback) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO user_feedback (
                id,
                operation_id,
                user_id,
                feedback_type,
                rating,
                payload_json,
                feedback_confidence,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&feedback.id.0)
        .bind(&feedback.operation_id.0)
        .bind(&feedback.user_id)
        .bind(feedback.feedback_type().as_str())
        .bind(feedback.rating().map(i64::from))
        .bind(serde_json::to_string(&feedback.signal)?)
        .bind(feedback.feedback_confidence)
        .bind(format_timestamp(&feedback.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_feedback(&self, operation_id: &OperationId) -> Result<Vec<UserFeedback>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, operation_id, user_id, payload_json, feedback_confidence, created_at
             FROM user_feedback
             WHERE operation_id = ?
             ORDER BY created_at ASC",
        )
        .bind(&operation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(feedback_from_row).collect()
    }

    async fn recent_corrections(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionExample>, RepositoryError> {
        let corrections = self.corrections(Some(user_id)).await?;
        let requests = self.requests_for(&corrections).await?;
        Ok(corrections_from(&corrections, &requests, limit))
    }

    async fn classification_outcomes(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClassificationOutcome>, RepositoryError> {
        let operations: Vec<_> = self
            .operations
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|operation| since.map_or(true, |since| operation.created_at >= since))
            .collect();
        let feedback = self.feedback_for_user(user_id).await?;
        Ok(join_outcomes(&operations, &feedback))
    }

    async fn get_classification_stats(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ClassificationStats, RepositoryError> {
        let outcomes = self.classification_outcomes(user_id, since).await?;
        let feedback_count = self
            .feedback_for_user(user_id)
            .await?
            .iter()
            .filter(|record| since.map_or(true, |since| record.created_at >= since))
            .count();
        Ok(stats_from_outcomes(&outcomes, feedback_count))
    }

    async fn training_data(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TrainingPair>, RepositoryError> {
        let corrections = self.corrections(user_id).await?;
        let requests = self.requests_for(&corrections).await?;
        Ok(training_pairs_from(&corrections, &requests, limit))
    }

    async fn store_learning_metrics(&self, metrics: &LearningMetrics) -> Result<(), RepositoryError> {
        let by_dimension = serde_json::json!({
            "destination": metrics.accuracy_by_destination,
            "consumer": metrics.accuracy_by_consumer,
            "semantics": metrics.accuracy_by_semantics,
        });

        sqlx::query(
            "INSERT INTO learning_metrics (
                user_id,
                window_start,
                window_end,
                window_days,
                classification_accuracy,
                sample_size,
                accuracy_by_dimension_json,
                avg_rating,
                correction_rate,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metrics.user_id)
        .bind(format_timestamp(&metrics.window_start))
        .bind(format_timestamp(&metrics.window_end))
        .bind(i64::from(metrics.window_days))
        .bind(metrics.classification_accuracy)
        .bind(metrics.sample_size as i64)
        .bind(by_dimension.to_string())
        .bind(metrics.avg_rating)
        .bind(metrics.correction_rate)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn feedback_from_row(row: SqliteRow) -> Result<UserFeedback, RepositoryError> {
    let payload: String = row.try_get("payload_json")?;
    let signal: FeedbackSignal = serde_json::from_str(&payload)
        .map_err(|error| RepositoryError::Decode(format!("invalid feedback payload: {error}")))?;

    Ok(UserFeedback {
        id: FeedbackId(row.try_get("id")?),
        operation_id: OperationId(row.try_get("operation_id")?),
        user_id: row.try_get("user_id")?,
        signal,
        feedback_confidence: row.try_get("feedback_confidence")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
