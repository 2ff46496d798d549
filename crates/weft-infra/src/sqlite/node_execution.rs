//! SQLite implementation of NodeExecutionRepository.

use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::NodeExecutionRepository;
use weft_types::ambiance::Ambiance;
use weft_types::error::RepositoryError;
use weft_types::execution::{InputInstance, NodeExecution, NodeExecutionUpdate, UpdatePredicate};

use super::store::{
    SqliteOrchestrationStore, enum_text, format_datetime, from_document, is_unique_violation,
    query_err, to_document,
};

const SELECT_DOCUMENTS: &str = "SELECT document FROM node_executions";

fn decode_all(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<NodeExecution>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let document: String = row.try_get("document").map_err(query_err)?;
            from_document(&document, "node execution")
        })
        .collect()
}

impl NodeExecutionRepository for SqliteOrchestrationStore {
    async fn create_node_execution(&self, record: &NodeExecution) -> Result<(), RepositoryError> {
        let document = to_document(record, "node execution")?;
        let result = sqlx::query(
            r#"INSERT INTO node_executions (id, plan_execution_id, parent_id, status, old_retry, created_at, document)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.plan_execution_id.to_string())
        .bind(record.parent_id.map(|id| id.to_string()))
        .bind(enum_text(&record.status)?)
        .bind(record.old_retry)
        .bind(format_datetime(&record.created_at))
        .bind(&document)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                record.id
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_node_execution(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM node_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("document").map_err(query_err)?;
                Ok(Some(from_document(&document, "node execution")?))
            }
            None => Ok(None),
        }
    }

    async fn update_node_execution_if(
        &self,
        id: &Uuid,
        predicate: &UpdatePredicate,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        // The writer pool has a single connection, so the read and the write
        // below cannot interleave with another conditional update.
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT document FROM node_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let document: String = row.try_get("document").map_err(query_err)?;
        let mut record: NodeExecution = from_document(&document, "node execution")?;

        if !record.try_apply(predicate, update) {
            return Ok(None);
        }

        sqlx::query("UPDATE node_executions SET status = ?, old_retry = ?, document = ? WHERE id = ?")
            .bind(enum_text(&record.status)?)
            .bind(record.old_retry)
            .bind(to_document(&record, "node execution")?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        Ok(Some(record))
    }

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_DOCUMENTS} WHERE plan_execution_id = ? ORDER BY created_at, id"
        ))
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_all(rows)
    }

    async fn list_children(
        &self,
        parent_id: &Uuid,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_DOCUMENTS} WHERE parent_id = ? AND (? OR old_retry = 0) ORDER BY created_at, id"
        ))
        .bind(parent_id.to_string())
        .bind(include_old_retries)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_all(rows)
    }

    async fn list_descendants(&self, ambiance: &Ambiance) -> Result<Vec<NodeExecution>, RepositoryError> {
        let records = self.list_by_plan_execution(&ambiance.plan_execution_id).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.ambiance.levels.len() > ambiance.levels.len() && ambiance.is_prefix_of(&r.ambiance))
            .collect())
    }

    async fn list_non_terminal(&self) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_DOCUMENTS} WHERE status NOT IN ('SUCCEEDED', 'FAILED', 'EXPIRED', 'ABORTED', 'SKIPPED', 'APPROVAL_REJECTED') ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        let records = decode_all(rows)?;
        Ok(records.into_iter().filter(|r| !r.status.is_terminal()).collect())
    }

    async fn save_input_instance(&self, instance: &InputInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO input_instances (node_execution_id, document) VALUES (?, ?)
               ON CONFLICT(node_execution_id) DO UPDATE SET document = excluded.document"#,
        )
        .bind(instance.node_execution_id.to_string())
        .bind(to_document(instance, "input instance")?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_input_instance(
        &self,
        node_execution_id: &Uuid,
    ) -> Result<Option<InputInstance>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM input_instances WHERE node_execution_id = ?")
            .bind(node_execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("document").map_err(query_err)?;
                Ok(Some(from_document(&document, "input instance")?))
            }
            None => Ok(None),
        }
    }
}
