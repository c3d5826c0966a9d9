use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
use opgate_core::domain::taxonomy::{Classification, ClassificationLabel};
use opgate_core::domain::verification::{VerificationLayer, VerificationResult};
use opgate_core::execution::ExecutionOutcome;

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, ClassificationLogEntry,
    OperationRepository, RepositoryError,
};
use crate::DbPool;

const OPERATION_COLUMNS: &str = "id,
    user_request,
    user_id,
    source_agent,
    destination,
    consumer,
    semantics,
    confidence,
    reasoning,
    alternatives_json,
    is_decomposed,
    parent_id,
    child_ids_json,
    verification_json,
    status,
    execution_result_json,
    state_before_json,
    state_after_json,
    reversibility_json,
    created_at,
    completed_at";

pub struct SqlOperationRepository {
    pool: DbPool,
}

impl SqlOperationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub(crate) async fn list_for_user(&self, user_id: &str) -> Result<Vec<AtomicOperation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM atomic_operations WHERE user_id = ? ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(operation_from_row).collect()
    }
}

#[async_trait::async_trait]
impl OperationRepository for SqlOperationRepository {
    async fn create_operation(&self, operation: &AtomicOperation) -> Result<(), RepositoryError> {
        let classification = operation.classification.as_ref();
        let alternatives = classification.map(|value| value.alternatives.clone()).unwrap_or_default();

        sqlx::query(
            "INSERT INTO atomic_operations (
                id,
                user_request,
                user_id,
                source_agent,
                destination,
                consumer,
                semantics,
                confidence,
                reasoning,
                alternatives_json,
                is_decomposed,
                parent_id,
                child_ids_json,
                verification_json,
                status,
                execution_result_json,
                state_before_json,
                state_after_json,
                reversibility_json,
                created_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&operation.id.0)
        .bind(&operation.user_request)
        .bind(&operation.user_id)
        .bind(&operation.source_agent)
        .bind(classification.map(|value| value.destination.as_str()))
        .bind(classification.map(|value| value.consumer.as_str()))
        .bind(classification.map(|value| value.semantics.as_str()))
        .bind(classification.map(|value| value.confidence))
        .bind(classification.map(|value| value.reasoning.as_str()))
        .bind(serde_json::to_string(&alternatives)?)
        .bind(operation.is_decomposed)
        .bind(operation.parent_id.as_ref().map(|id| id.0.as_str()))
        .bind(serde_json::to_string(&operation.child_ids)?)
        .bind(serde_json::to_string(&operation.verification_results)?)
        .bind(operation.status.as_str())
        .bind(operation.execution_result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(operation.state_before.as_ref().map(serde_json::to_string).transpose()?)
        .bind(operation.state_after.as_ref().map(serde_json::to_string).transpose()?)
        .bind(operation.reversibility.as_ref().map(serde_json::to_string).transpose()?)
        .bind(format_timestamp(&operation.created_at))
        .bind(operation.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<AtomicOperation>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {OPERATION_COLUMNS} FROM atomic_operations WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(operation_from_row).transpose()
    }

    async fn list_children(&self, parent_id: &OperationId) -> Result<Vec<AtomicOperation>, RepositoryError> {
        let Some(parent) = self.get_operation(parent_id).await? else {
            return Ok(Vec::new());
        };

        let mut children = Vec::with_capacity(parent.child_ids.len());
        for child_id in &parent.child_ids {
            if let Some(child) = self.get_operation(child_id).await? {
                children.push(child);
            }
        }
        Ok(children)
    }

    async fn update_status(&self, id: &OperationId, status: OperationStatus) -> Result<bool, RepositoryError> {
        let completed_at = status.is_terminal().then(|| format_timestamp(&Utc::now()));
        let result = sqlx::query(
            "UPDATE atomic_operations
             SET status = ?, completed_at = COALESCE(?, completed_at)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_verification_results(
        &self,
        id: &OperationId,
        results: &BTreeMap<VerificationLayer, VerificationResult>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE atomic_operations SET verification_json = ? WHERE id = ?")
            .bind(serde_json::to_string(results)?)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_execution(&self, id: &OperationId, outcome: &ExecutionOutcome) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE atomic_operations
             SET execution_result_json = ?,
                 state_before_json = ?,
                 state_after_json = ?,
                 reversibility_json = ?
             WHERE id = ?",
        )
        .bind(serde_json::to_string(&outcome.result)?)
        .bind(outcome.state_before.as_ref().map(serde_json::to_string).transpose()?)
        .bind(outcome.state_after.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&outcome.reversibility)?)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn log_classification(&self, entry: &ClassificationLogEntry) -> Result<(), RepositoryError> {
        let classification = &entry.classification;
        sqlx::query(
            "INSERT INTO classification_log (
                operation_id,
                request,
                destination,
                consumer,
                semantics,
                confidence,
                model,
                reasoning,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.operation_id.0)
        .bind(&entry.request)
        .bind(classification.destination.as_str())
        .bind(classification.consumer.as_str())
        .bind(classification.semantics.as_str())
        .bind(classification.confidence)
        .bind(&entry.model)
        .bind(&classification.reasoning)
        .bind(format_timestamp(&entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn operation_from_row(row: SqliteRow) -> Result<AtomicOperation, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = OperationStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown operation status `{status_raw}`")))?;

    Ok(AtomicOperation {
        id: OperationId(row.try_get("id")?),
        user_request: row.try_get("user_request")?,
        user_id: row.try_get("user_id")?,
        source_agent: row.try_get("source_agent")?,
        classification: classification_from_row(&row)?,
        is_decomposed: row.try_get("is_decomposed")?,
        parent_id: row.try_get::<Option<String>, _>("parent_id")?.map(OperationId),
        child_ids: decode_json("child_ids_json", row.try_get("child_ids_json")?)?,
        verification_results: decode_json("verification_json", row.try_get("verification_json")?)?,
        status,
        execution_result: decode_optional_json("execution_result_json", row.try_get("execution_result_json")?)?,
        state_before: decode_optional_json("state_before_json", row.try_get("state_before_json")?)?,
        state_after: decode_optional_json("state_after_json", row.try_get("state_after_json")?)?,
        reversibility: decode_optional_json("reversibility_json", row.try_get("reversibility_json")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

fn classification_from_row(row: &SqliteRow) -> Result<Option<Classification>, RepositoryError> {
    let destination: Option<String> = row.try_get("destination")?;
    let consumer: Option<String> = row.try_get("consumer")?;
    let semantics: Option<String> = row.try_get("semantics")?;
    let (Some(destination), Some(consumer), Some(semantics)) = (destination, consumer, semantics) else {
        return Ok(None);
    };

    let label = ClassificationLabel::parse(&destination, &consumer, &semantics)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let confidence: Option<f64> = row.try_get("confidence")?;
    let reasoning: Option<String> = row.try_get("reasoning")?;
    let alternatives = decode_json("alternatives_json", row.try_get("alternatives_json")?)?;

    Ok(Some(
        Classification::new(label, confidence.unwrap_or_default(), reasoning.unwrap_or_default())
            .with_alternatives(alternatives),
    ))
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, value: String) -> Result<T, RepositoryError> {
    serde_json::from_str(&value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

fn decode_optional_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    value.map(|value| decode_json(column, value)).transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sqlx::Row;

    use opgate_core::domain::execution::{ExecutionResult, ReversibilityInfo};
    use opgate_core::domain::operation::{AtomicOperation, OperationId, OperationStatus};
    use opgate_core::domain::taxonomy::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics,
    };
    use opgate_core::domain::verification::{VerificationLayer, VerificationResult};
    use opgate_core::execution::ExecutionOutcome;

    use super::SqlOperationRepository;
    use crate::migrations;
    use crate::repositories::{ClassificationLogEntry, OperationRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn classified(request: &str, label: ClassificationLabel) -> AtomicOperation {
        let mut operation = AtomicOperation::new(request, "user-1", "cli");
        operation.classification = Some(Classification::from_confident_flag(label, true, "test reasoning"));
        operation.status = OperationStatus::AwaitingVerification;
        operation
    }

    #[tokio::test]
    async fn operation_tree_round_trips() {
        let repo = SqlOperationRepository::new(setup_pool().await);
        let list = ClassificationLabel::new(Destination::Stream, Consumer::Human, Semantics::Read);
        let delete = ClassificationLabel::new(Destination::File, Consumer::Human, Semantics::Execute);

        let mut parent = AtomicOperation::new("list files then delete temp.txt", "user-1", "cli");
        parent.is_decomposed = true;
        parent.status = OperationStatus::Decomposed;
        let first = classified("list files", list).with_parent(Some(parent.id.clone()));
        let second = classified("delete temp.txt", delete).with_parent(Some(parent.id.clone()));
        parent.child_ids = vec![first.id.clone(), second.id.clone()];

        repo.create_operation(&parent).await.expect("create parent");
        repo.create_operation(&first).await.expect("create first");
        repo.create_operation(&second).await.expect("create second");

        let found = repo.get_operation(&second.id).await.expect("get").expect("operation exists");
        assert_eq!(found.classification.as_ref().map(|c| c.label()), Some(delete));
        assert_eq!(found.parent_id, Some(parent.id.clone()));

        let children = repo.list_children(&parent.id).await.expect("children");
        let ids: Vec<_> = children.iter().map(|child| child.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn terminal_status_sets_completed_at() {
        let repo = SqlOperationRepository::new(setup_pool().await);
        let operation = classified(
            "show memory usage",
            ClassificationLabel::new(Destination::Stream, Consumer::Human, Semantics::Read),
        );
        repo.create_operation(&operation).await.expect("create");

        assert!(repo.update_status(&operation.id, OperationStatus::Executing).await.expect("update"));
        let executing = repo.get_operation(&operation.id).await.expect("get").expect("exists");
        assert!(executing.completed_at.is_none());

        assert!(repo.update_status(&operation.id, OperationStatus::Complete).await.expect("update"));
        let complete = repo.get_operation(&operation.id).await.expect("get").expect("exists");
        assert_eq!(complete.status, OperationStatus::Complete);
        assert!(complete.completed_at.is_some());

        let missing = OperationId("missing".to_string());
        assert!(!repo.update_status(&missing, OperationStatus::Failed).await.expect("update"));
    }

    #[tokio::test]
    async fn verification_and_execution_are_persisted() {
        let repo = SqlOperationRepository::new(setup_pool().await);
        let operation = classified(
            "save to notes.txt",
            ClassificationLabel::new(Destination::File, Consumer::Human, Semantics::Execute),
        );
        repo.create_operation(&operation).await.expect("create");

        let results = BTreeMap::from([
            (VerificationLayer::Syntax, VerificationResult::pass(VerificationLayer::Syntax, 1.0)),
            (VerificationLayer::Safety, VerificationResult::fail(VerificationLayer::Safety, "blocked")),
        ]);
        repo.save_verification_results(&operation.id, &results).await.expect("save verification");

        let outcome = ExecutionOutcome {
            status: OperationStatus::Failed,
            result: ExecutionResult::failed("permission denied", Some(13), 4),
            state_before: None,
            state_after: None,
            reversibility: ReversibilityInfo::irreversible("no before-snapshot was captured"),
        };
        repo.save_execution(&operation.id, &outcome).await.expect("save execution");

        let found = repo.get_operation(&operation.id).await.expect("get").expect("exists");
        assert_eq!(found.verification_results, results);
        assert!(!found.is_verified());
        assert_eq!(found.execution_result.map(|result| result.exit_code), Some(Some(13)));
        assert_eq!(found.reversibility.map(|info| info.reversible), Some(false));
    }

    #[tokio::test]
    async fn classification_log_records_model() {
        let pool = setup_pool().await;
        let repo = SqlOperationRepository::new(pool.clone());
        let operation = classified(
            "good morning",
            ClassificationLabel::new(Destination::Stream, Consumer::Human, Semantics::Interpret),
        );
        let classification = operation.classification.clone().expect("classified");

        repo.log_classification(&ClassificationLogEntry::new(&operation, &classification, "keyword_fallback"))
            .await
            .expect("log classification");

        let model = sqlx::query("SELECT model FROM classification_log WHERE operation_id = ?")
            .bind(&operation.id.0)
            .fetch_one(&pool)
            .await
            .expect("log row")
            .get::<String, _>("model");
        assert_eq!(model, "keyword_fallback");
    }
}
