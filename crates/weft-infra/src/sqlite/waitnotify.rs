//! SQLite implementation of WaitNotifyRepository.
//!
//! Correlation ids live in their own table so that a notify can find its
//! waits with an index lookup instead of scanning every wait document.

use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::WaitNotifyRepository;
use weft_types::error::RepositoryError;
use weft_types::waitnotify::{NotifyResponse, WaitInstance};

use super::store::{SqliteOrchestrationStore, format_datetime, from_document, query_err, to_document};

fn decode_waits(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<WaitInstance>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let document: String = row.try_get("document").map_err(query_err)?;
            let fired: bool = row.try_get("fired").map_err(query_err)?;
            let mut wait: WaitInstance = from_document(&document, "wait instance")?;
            wait.fired = fired;
            Ok(wait)
        })
        .collect()
}

impl WaitNotifyRepository for SqliteOrchestrationStore {
    async fn save_wait_instance(&self, wait: &WaitInstance) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO wait_instances (id, node_execution_id, fired, created_at, document)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET fired = excluded.fired, document = excluded.document"#,
        )
        .bind(wait.id.to_string())
        .bind(wait.callback.node_execution_id().to_string())
        .bind(wait.fired)
        .bind(format_datetime(&wait.created_at))
        .bind(to_document(wait, "wait instance")?)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        for correlation_id in &wait.correlation_ids {
            sqlx::query("INSERT OR IGNORE INTO wait_correlations (wait_id, correlation_id) VALUES (?, ?)")
                .bind(wait.id.to_string())
                .bind(correlation_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn waits_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT w.document, w.fired FROM wait_instances w
               JOIN wait_correlations c ON c.wait_id = w.id
               WHERE c.correlation_id = ? AND w.fired = 0
               ORDER BY w.created_at, w.id"#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_waits(rows)
    }

    async fn save_notify_response(&self, response: &NotifyResponse) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO notify_responses (correlation_id, document, created_at) VALUES (?, ?, ?)",
        )
        .bind(&response.correlation_id)
        .bind(to_document(response, "notify response")?)
        .bind(format_datetime(&response.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn responses_for(
        &self,
        correlation_ids: &[String],
    ) -> Result<Vec<NotifyResponse>, RepositoryError> {
        let mut responses = Vec::with_capacity(correlation_ids.len());
        for correlation_id in correlation_ids {
            let row = sqlx::query("SELECT document FROM notify_responses WHERE correlation_id = ?")
                .bind(correlation_id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_err)?;
            if let Some(row) = row {
                let document: String = row.try_get("document").map_err(query_err)?;
                responses.push(from_document(&document, "notify response")?);
            }
        }
        Ok(responses)
    }

    async fn mark_wait_fired(&self, wait_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE wait_instances SET fired = 1 WHERE id = ? AND fired = 0")
            .bind(wait_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM wait_instances WHERE id = ?")
            .bind(wait_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_unfired_waits(&self) -> Result<Vec<WaitInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT document, fired FROM wait_instances WHERE fired = 0 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_waits(rows)
    }

    async fn unfired_waits_for_node(
        &self,
        node_execution_id: &Uuid,
    ) -> Result<Vec<WaitInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT document, fired FROM wait_instances
               WHERE node_execution_id = ? AND fired = 0
               ORDER BY created_at, id"#,
        )
        .bind(node_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_waits(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::store::test_store;
    use weft_types::waitnotify::NotifyCallback;

    fn progress(correlation_id: &str) -> NotifyCallback {
        NotifyCallback::Progress {
            node_execution_id: Uuid::now_v7(),
            correlation_id: correlation_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_waits_found_by_any_correlation_id() {
        let store = test_store().await;
        let wait = WaitInstance::new(vec!["a".to_string(), "b".to_string()], progress("a"));
        store.save_wait_instance(&wait).await.unwrap();

        let by_b = store.waits_for_correlation("b").await.unwrap();
        assert_eq!(by_b.len(), 1);
        assert_eq!(by_b[0].id, wait.id);
        assert_eq!(by_b[0].correlation_ids, wait.correlation_ids);
        assert!(store.waits_for_correlation("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_response_is_insert_if_absent() {
        let store = test_store().await;
        let first = NotifyResponse::new("cb", serde_json::json!(1), false);
        let second = NotifyResponse::new("cb", serde_json::json!(2), true);
        assert!(store.save_notify_response(&first).await.unwrap());
        assert!(!store.save_notify_response(&second).await.unwrap());

        let stored = store
            .responses_for(&["cb".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, serde_json::json!(1));
        assert!(!stored[0].error);
    }

    #[tokio::test]
    async fn test_mark_fired_only_once() {
        let store = test_store().await;
        let wait = WaitInstance::new(vec!["a".to_string()], progress("a"));
        store.save_wait_instance(&wait).await.unwrap();

        assert!(store.mark_wait_fired(&wait.id).await.unwrap());
        assert!(!store.mark_wait_fired(&wait.id).await.unwrap());
        assert!(store.waits_for_correlation("a").await.unwrap().is_empty());
        assert!(store.list_unfired_waits().await.unwrap().is_empty());

        let err = store.mark_wait_fired(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_unfired_waits_in_creation_order() {
        let store = test_store().await;
        let first = WaitInstance::new(vec!["x".to_string()], progress("x"));
        let second = WaitInstance::new(vec!["y".to_string()], progress("y")).with_timeout(Some(500));
        store.save_wait_instance(&second).await.unwrap();
        store.save_wait_instance(&first).await.unwrap();

        let waits = store.list_unfired_waits().await.unwrap();
        let ids: Vec<Uuid> = waits.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(waits[1].timeout_ms, Some(500));
    }

    #[tokio::test]
    async fn test_unfired_waits_by_target_node() {
        let store = test_store().await;
        let target = Uuid::now_v7();
        let resume = NotifyCallback::Progress {
            node_execution_id: target,
            correlation_id: "agg".to_string(),
        };
        let aggregate = WaitInstance::new(vec!["a".to_string(), "b".to_string()], resume.clone());
        let per_id = WaitInstance::new(vec!["a".to_string()], resume);
        let unrelated = WaitInstance::new(vec!["a".to_string()], progress("a"));
        for wait in [&aggregate, &per_id, &unrelated] {
            store.save_wait_instance(wait).await.unwrap();
        }
        store.mark_wait_fired(&per_id.id).await.unwrap();

        let found = store.unfired_waits_for_node(&target).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![aggregate.id]);
    }
}
