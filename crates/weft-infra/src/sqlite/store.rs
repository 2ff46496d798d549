//! The SQLite orchestration store and its row helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use weft_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of every `weft-core` repository trait.
#[derive(Clone)]
pub struct SqliteOrchestrationStore {
    pub(crate) pool: DatabasePool,
}

impl SqliteOrchestrationStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(DatabasePool::new(database_url).await?))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

pub(crate) fn to_document<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

pub(crate) fn from_document<T: DeserializeOwned>(document: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(document).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Serde name of a unit enum variant (`Status::TaskWaiting` -> `TASK_WAITING`).
pub(crate) fn enum_text<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected a unit variant, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

/// Fixed-width RFC 3339 so that `ORDER BY created_at` sorts chronologically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
pub(crate) async fn test_store() -> SqliteOrchestrationStore {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    std::mem::forget(dir);
    SqliteOrchestrationStore::open(&url).await.unwrap()
}

/// Store with one plan and one running execution of it.
#[cfg(test)]
pub(crate) async fn test_store_with_execution() -> (SqliteOrchestrationStore, weft_types::execution::PlanExecution) {
    use std::collections::HashMap;
    use weft_core::repository::{PlanExecutionRepository, PlanRepository};
    use weft_types::ambiance::Ambiance;
    use weft_types::execution::{PlanExecution, Status};
    use weft_types::plan::Plan;

    let store = test_store().await;
    let plan = Plan {
        id: uuid::Uuid::now_v7(),
        start_node_id: "root".to_string(),
        nodes: HashMap::new(),
        definition: serde_json::Value::Null,
        created_at: Utc::now(),
    };
    store.save_plan(&plan).await.unwrap();
    let id = uuid::Uuid::now_v7();
    let execution = PlanExecution {
        id,
        plan_id: plan.id,
        status: Status::Running,
        ambiance: Ambiance::new(id, plan.id),
        start_ts: Utc::now(),
        end_ts: None,
    };
    store.create_plan_execution(&execution).await.unwrap();
    (store, execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::execution::Status;
    use weft_types::interrupt::InterruptState;

    #[test]
    fn enum_text_uses_serde_names() {
        assert_eq!(enum_text(&Status::TaskWaiting).unwrap(), "TASK_WAITING");
        assert_eq!(
            enum_text(&InterruptState::ProcessedSuccessfully).unwrap(),
            "PROCESSED_SUCCESSFULLY"
        );
        assert!(enum_text(&serde_json::json!({ "a": 1 })).is_err());
    }

    #[test]
    fn formatted_datetimes_sort_lexically() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let b = a + chrono::Duration::milliseconds(5);
        assert!(format_datetime(&a) < format_datetime(&b));
        assert_eq!(format_datetime(&a).len(), format_datetime(&b).len());
    }
}
