//! SQLite implementation of InterruptRepository.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::InterruptRepository;
use weft_types::error::RepositoryError;
use weft_types::interrupt::{Interrupt, InterruptState};

use super::store::{
    SqliteOrchestrationStore, enum_text, format_datetime, from_document, query_err, to_document,
};

impl InterruptRepository for SqliteOrchestrationStore {
    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO interrupts (id, plan_execution_id, state, created_at, document)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET state = excluded.state, document = excluded.document"#,
        )
        .bind(interrupt.id.to_string())
        .bind(interrupt.plan_execution_id.to_string())
        .bind(enum_text(&interrupt.state)?)
        .bind(format_datetime(&interrupt.created_at))
        .bind(to_document(interrupt, "interrupt")?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_interrupt(&self, id: &Uuid) -> Result<Option<Interrupt>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM interrupts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("document").map_err(query_err)?;
                Ok(Some(from_document(&document, "interrupt")?))
            }
            None => Ok(None),
        }
    }

    async fn update_interrupt_state(
        &self,
        id: &Uuid,
        state: InterruptState,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT document FROM interrupts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let document: String = row.try_get("document").map_err(query_err)?;
        let mut interrupt: Interrupt = from_document(&document, "interrupt")?;
        interrupt.state = state;
        interrupt.updated_at = Utc::now();

        sqlx::query("UPDATE interrupts SET state = ?, document = ? WHERE id = ?")
            .bind(enum_text(&state)?)
            .bind(to_document(&interrupt, "interrupt")?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(interrupt_id = %id, state = ?state, "interrupt state updated");
        Ok(())
    }

    async fn list_interrupts(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT document FROM interrupts WHERE plan_execution_id = ? ORDER BY created_at, id",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let document: String = row.try_get("document").map_err(query_err)?;
                from_document(&document, "interrupt")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::store::test_store;
    use weft_types::interrupt::{InterruptConfig, InterruptKind, IssuedBy};

    fn interrupt(plan_execution_id: Uuid, kind: InterruptKind) -> Interrupt {
        Interrupt::new(
            kind,
            plan_execution_id,
            Some(Uuid::now_v7()),
            InterruptConfig::issued_by(IssuedBy::User).with_reason("test"),
        )
    }

    #[tokio::test]
    async fn test_save_and_update_state() {
        let store = test_store().await;
        let saved = interrupt(Uuid::now_v7(), InterruptKind::Abort);
        store.save_interrupt(&saved).await.unwrap();

        store
            .update_interrupt_state(&saved.id, InterruptState::ProcessedSuccessfully)
            .await
            .unwrap();
        let loaded = store.get_interrupt(&saved.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, InterruptState::ProcessedSuccessfully);
        assert_eq!(loaded.kind, InterruptKind::Abort);
        assert!(loaded.updated_at >= saved.updated_at);

        let err = store
            .update_interrupt_state(&Uuid::now_v7(), InterruptState::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_by_plan_execution() {
        let store = test_store().await;
        let plan_execution_id = Uuid::now_v7();
        let first = interrupt(plan_execution_id, InterruptKind::Expire);
        let second = interrupt(plan_execution_id, InterruptKind::Retry);
        store.save_interrupt(&second).await.unwrap();
        store.save_interrupt(&first).await.unwrap();
        store
            .save_interrupt(&interrupt(Uuid::now_v7(), InterruptKind::Abort))
            .await
            .unwrap();

        let listed = store.list_interrupts(&plan_execution_id).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
