//! SQLite implementation of PlanRepository and PlanExecutionRepository.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::{PlanExecutionRepository, PlanRepository};
use weft_types::error::RepositoryError;
use weft_types::execution::{PlanExecution, Status};
use weft_types::plan::Plan;

use super::store::{
    SqliteOrchestrationStore, enum_text, format_datetime, from_document, is_unique_violation,
    query_err, to_document,
};

impl PlanRepository for SqliteOrchestrationStore {
    async fn save_plan(&self, plan: &Plan) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO plans (id, document, created_at) VALUES (?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET document = excluded.document"#,
        )
        .bind(plan.id.to_string())
        .bind(to_document(plan, "plan")?)
        .bind(format_datetime(&plan.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::debug!(plan_id = %plan.id, nodes = plan.nodes.len(), "plan saved");
        Ok(())
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<Plan>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM plans WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("document").map_err(query_err)?;
                Ok(Some(from_document(&document, "plan")?))
            }
            None => Ok(None),
        }
    }
}

impl PlanExecutionRepository for SqliteOrchestrationStore {
    async fn create_plan_execution(&self, execution: &PlanExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO plan_executions (id, plan_id, status, document, start_ts, end_ts)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.plan_id.to_string())
        .bind(enum_text(&execution.status)?)
        .bind(to_document(execution, "plan execution")?)
        .bind(format_datetime(&execution.start_ts))
        .bind(execution.end_ts.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "plan execution {} already exists",
                execution.id
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_plan_execution(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM plan_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("document").map_err(query_err)?;
                Ok(Some(from_document(&document, "plan execution")?))
            }
            None => Ok(None),
        }
    }

    async fn conclude_plan_execution(&self, id: &Uuid, status: Status) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT document FROM plan_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let document: String = row.try_get("document").map_err(query_err)?;
        let mut execution: PlanExecution = from_document(&document, "plan execution")?;

        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = status;
        let end_ts = Utc::now();
        execution.end_ts = Some(end_ts);

        sqlx::query("UPDATE plan_executions SET status = ?, end_ts = ?, document = ? WHERE id = ?")
            .bind(enum_text(&status)?)
            .bind(format_datetime(&end_ts))
            .bind(to_document(&execution, "plan execution")?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::store::{test_store, test_store_with_execution};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_save_plan_is_upsert() {
        let store = test_store().await;
        let mut plan = Plan {
            id: Uuid::now_v7(),
            start_node_id: "a".to_string(),
            nodes: HashMap::new(),
            definition: serde_json::json!({ "pipeline": {} }),
            created_at: Utc::now(),
        };
        store.save_plan(&plan).await.unwrap();
        plan.start_node_id = "b".to_string();
        store.save_plan(&plan).await.unwrap();

        let loaded = store.get_plan(&plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.start_node_id, "b");
        assert_eq!(loaded.definition, plan.definition);
        assert!(store.get_plan(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_execution_is_conflict() {
        let (store, execution) = test_store_with_execution().await;
        let err = store.create_plan_execution(&execution).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_conclude_only_once() {
        let (store, execution) = test_store_with_execution().await;

        assert!(store.conclude_plan_execution(&execution.id, Status::Succeeded).await.unwrap());
        assert!(!store.conclude_plan_execution(&execution.id, Status::Failed).await.unwrap());

        let loaded = store.get_plan_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Succeeded);
        assert!(loaded.end_ts.is_some());

        let err = store
            .conclude_plan_execution(&Uuid::now_v7(), Status::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
