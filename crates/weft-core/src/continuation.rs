//! Continuation registry: durable wait/notify correlation.
//!
//! A wait associates a set of correlation ids with a serialized callback.
//! Deliveries are stored as `NotifyResponse`s; once every id of a wait has a
//! response the wait fires exactly once, guarded by the repository's atomic
//! `mark_wait_fired`. Partial deliveries are durable, so a wait registered
//! before a restart still fires when its last id arrives afterwards.
//!
//! The registry never runs callbacks itself. It returns `FiredCallback`s and
//! the engine dispatches them. It has no deadline of its own; expiry is the
//! timeout tracker's job.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::waitnotify::{NotifyCallback, NotifyResponse, ResponseMap, WaitInstance};

use crate::repository::WaitNotifyRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Delivery-side failures. `deliver` logs and drops these.
#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("duplicate delivery for correlation id {0}")]
    DuplicateDelivery(String),

    #[error("malformed delivery: {0}")]
    MalformedDelivery(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// FiredCallback
// ---------------------------------------------------------------------------

/// A wait whose correlation ids are all satisfied, ready to dispatch.
#[derive(Debug, Clone)]
pub struct FiredCallback {
    pub wait_id: Uuid,
    pub callback: NotifyCallback,
    /// Results for every correlation id of the wait.
    pub responses: ResponseMap,
}

// ---------------------------------------------------------------------------
// ContinuationRegistry
// ---------------------------------------------------------------------------

/// Correlates callback ids with pending resumptions.
pub struct ContinuationRegistry<R: WaitNotifyRepository> {
    repo: Arc<R>,
}

impl<R: WaitNotifyRepository> ContinuationRegistry<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Register `callback` to fire once every id in `correlation_ids` has
    /// been delivered. Ids delivered before registration count, so the
    /// returned vector may already contain the fired callback.
    pub async fn wait_for_all(
        &self,
        correlation_ids: Vec<String>,
        callback: NotifyCallback,
        progress_callback: Option<NotifyCallback>,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<FiredCallback>, ContinuationError> {
        if correlation_ids.is_empty() {
            return Err(ContinuationError::MalformedDelivery(
                "wait registered without correlation ids".to_string(),
            ));
        }

        let mut wait = WaitInstance::new(correlation_ids, callback).with_timeout(timeout_ms);
        wait.progress_callback = progress_callback;
        self.repo.save_wait_instance(&wait).await?;

        tracing::debug!(
            wait_id = %wait.id,
            correlation_ids = ?wait.correlation_ids,
            "registered wait"
        );

        Ok(self.try_fire(&wait).await?.into_iter().collect())
    }

    /// Register one single-id wait per correlation id (per-id wake-ups).
    pub async fn wait_for_each(
        &self,
        correlation_ids: &[String],
        callback_for: impl Fn(&str) -> NotifyCallback,
    ) -> Result<Vec<FiredCallback>, ContinuationError> {
        let mut fired = Vec::new();
        for id in correlation_ids {
            fired.extend(
                self.wait_for_all(vec![id.clone()], callback_for(id), None, None)
                    .await?,
            );
        }
        Ok(fired)
    }

    /// Deliver a result for `correlation_id` and return the callbacks that
    /// fired because of it. Duplicate or malformed deliveries are logged
    /// and dropped.
    pub async fn deliver(
        &self,
        correlation_id: &str,
        payload: serde_json::Value,
        is_error: bool,
    ) -> Vec<FiredCallback> {
        match self.try_deliver(correlation_id, payload, is_error).await {
            Ok(fired) => fired,
            Err(ContinuationError::DuplicateDelivery(id)) => {
                tracing::warn!(correlation_id = %id, "dropping duplicate delivery");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(correlation_id, error = %e, "dropping delivery");
                Vec::new()
            }
        }
    }

    /// Like `deliver`, but surfaces why a delivery was dropped.
    pub async fn try_deliver(
        &self,
        correlation_id: &str,
        payload: serde_json::Value,
        is_error: bool,
    ) -> Result<Vec<FiredCallback>, ContinuationError> {
        if correlation_id.trim().is_empty() {
            return Err(ContinuationError::MalformedDelivery(
                "empty correlation id".to_string(),
            ));
        }

        let response = NotifyResponse::new(correlation_id, payload, is_error);
        if !self.repo.save_notify_response(&response).await? {
            return Err(ContinuationError::DuplicateDelivery(
                correlation_id.to_string(),
            ));
        }

        let waits = self.repo.waits_for_correlation(correlation_id).await?;
        if waits.is_empty() {
            tracing::debug!(correlation_id, "delivery stored with no waiting callback");
        }

        let mut fired = Vec::new();
        for wait in &waits {
            if let Some(callback) = self.try_fire(wait).await? {
                fired.push(callback);
            }
        }
        Ok(fired)
    }

    /// Progress data for one correlation id: returns the progress callbacks
    /// of every unfired wait containing it. Nothing is stored or consumed.
    pub async fn deliver_progress(
        &self,
        correlation_id: &str,
        data: serde_json::Value,
    ) -> Result<Vec<FiredCallback>, ContinuationError> {
        let waits = self.repo.waits_for_correlation(correlation_id).await?;
        Ok(waits
            .into_iter()
            .filter_map(|wait| {
                let callback = wait.progress_callback?;
                let mut responses = ResponseMap::new();
                responses.insert(
                    correlation_id.to_string(),
                    NotifyResponse::new(correlation_id, data.clone(), false),
                );
                Some(FiredCallback {
                    wait_id: wait.id,
                    callback,
                    responses,
                })
            })
            .collect())
    }

    /// Fire every unfired wait that became satisfied but never fired (e.g.
    /// the process stopped between storing the last response and firing).
    pub async fn recover(&self) -> Result<Vec<FiredCallback>, ContinuationError> {
        let mut fired = Vec::new();
        for wait in self.repo.list_unfired_waits().await? {
            if let Some(callback) = self.try_fire(&wait).await? {
                fired.push(callback);
            }
        }
        if !fired.is_empty() {
            tracing::info!(count = fired.len(), "recovered satisfied waits");
        }
        Ok(fired)
    }

    /// Retire every unfired wait of a record that was forced terminal, so a
    /// late delivery finds nothing to fire and recovery stops rescanning it.
    /// Returns how many waits were retired.
    pub async fn cancel_waits_for(&self, node_execution_id: Uuid) -> Result<usize, ContinuationError> {
        let mut cancelled = 0;
        for wait in self.repo.unfired_waits_for_node(&node_execution_id).await? {
            if self.repo.mark_wait_fired(&wait.id).await? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(node_execution_id = %node_execution_id, cancelled, "retired waits of concluded record");
        }
        Ok(cancelled)
    }

    async fn try_fire(&self, wait: &WaitInstance) -> Result<Option<FiredCallback>, ContinuationError> {
        let responses = self.repo.responses_for(&wait.correlation_ids).await?;
        let satisfied: HashSet<String> = responses
            .iter()
            .map(|r| r.correlation_id.clone())
            .collect();
        if !wait.is_satisfied_by(&satisfied) {
            return Ok(None);
        }
        if !self.repo.mark_wait_fired(&wait.id).await? {
            return Ok(None);
        }

        tracing::debug!(wait_id = %wait.id, "wait fired");
        Ok(Some(FiredCallback {
            wait_id: wait.id,
            callback: wait.callback.clone(),
            responses: responses
                .into_iter()
                .map(|r| (r.correlation_id.clone(), r))
                .collect(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;
    use serde_json::json;

    fn registry() -> ContinuationRegistry<InMemoryRepository> {
        ContinuationRegistry::new(Arc::new(InMemoryRepository::new()))
    }

    fn progress(id: &str) -> NotifyCallback {
        NotifyCallback::Progress {
            node_execution_id: Uuid::nil(),
            correlation_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn fires_only_when_all_ids_delivered() {
        let reg = registry();
        let fired = reg
            .wait_for_all(vec!["a".into(), "b".into()], progress("agg"), None, Some(60_000))
            .await
            .unwrap();
        assert!(fired.is_empty());

        assert!(reg.deliver("a", json!({"v": 1}), false).await.is_empty());
        let fired = reg.deliver("b", json!({"v": 2}), false).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].responses.len(), 2);
        assert_eq!(fired[0].responses["a"].payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn duplicate_delivery_fires_at_most_once() {
        let reg = registry();
        reg.wait_for_all(vec!["a".into()], progress("a"), None, None)
            .await
            .unwrap();
        assert_eq!(reg.deliver("a", json!(1), false).await.len(), 1);
        assert!(reg.deliver("a", json!(1), false).await.is_empty());
        assert!(matches!(
            reg.try_deliver("a", json!(1), false).await,
            Err(ContinuationError::DuplicateDelivery(_))
        ));
    }

    #[tokio::test]
    async fn delivery_before_registration_fires_on_register() {
        let reg = registry();
        assert!(reg.deliver("early", json!(null), false).await.is_empty());
        let fired = reg
            .wait_for_all(vec!["early".into()], progress("early"), None, None)
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn per_id_waits_fire_individually() {
        let reg = registry();
        let ids = vec!["a".to_string(), "b".to_string()];
        reg.wait_for_all(ids.clone(), progress("agg"), None, None)
            .await
            .unwrap();
        reg.wait_for_each(&ids, progress).await.unwrap();

        let first = reg.deliver("a", json!(1), false).await;
        assert_eq!(first.len(), 1);
        assert!(matches!(
            &first[0].callback,
            NotifyCallback::Progress { correlation_id, .. } if correlation_id == "a"
        ));

        let second = reg.deliver("b", json!(2), false).await;
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn empty_correlation_id_is_dropped() {
        let reg = registry();
        assert!(reg.deliver("  ", json!(1), false).await.is_empty());
        assert!(matches!(
            reg.try_deliver("", json!(1), false).await,
            Err(ContinuationError::MalformedDelivery(_))
        ));
    }

    #[tokio::test]
    async fn progress_does_not_consume_wait() {
        let reg = registry();
        reg.wait_for_all(vec!["a".into()], progress("agg"), Some(progress("p")), None)
            .await
            .unwrap();
        let progress_fired = reg.deliver_progress("a", json!({"pct": 50})).await.unwrap();
        assert_eq!(progress_fired.len(), 1);
        assert_eq!(reg.deliver("a", json!(1), false).await.len(), 1);
    }

    #[tokio::test]
    async fn recover_fires_satisfied_unfired_waits() {
        let repo = Arc::new(InMemoryRepository::new());
        let reg = ContinuationRegistry::new(Arc::clone(&repo));
        let wait = WaitInstance::new(vec!["x".to_string()], progress("x"));
        repo.save_wait_instance(&wait).await.unwrap();
        repo.save_notify_response(&NotifyResponse::new("x", json!(1), false))
            .await
            .unwrap();

        let fired = reg.recover().await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(reg.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_waits_never_fire() {
        let repo = Arc::new(InMemoryRepository::new());
        let reg = ContinuationRegistry::new(Arc::clone(&repo));
        let node = Uuid::now_v7();
        let resume = NotifyCallback::Progress {
            node_execution_id: node,
            correlation_id: "agg".to_string(),
        };
        let ids = vec!["a".to_string(), "b".to_string()];
        reg.wait_for_all(ids.clone(), resume, None, None).await.unwrap();
        reg.wait_for_each(&ids, |id| NotifyCallback::Progress {
            node_execution_id: node,
            correlation_id: id.to_string(),
        })
        .await
        .unwrap();
        reg.wait_for_all(vec!["a".into()], progress("other"), None, None)
            .await
            .unwrap();

        assert_eq!(reg.cancel_waits_for(node).await.unwrap(), 3);
        assert_eq!(reg.cancel_waits_for(node).await.unwrap(), 0);
        assert_eq!(repo.list_unfired_waits().await.unwrap().len(), 1);

        // Only the unrelated wait is left to fire.
        let fired = reg.deliver("a", json!(1), false).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].callback.node_execution_id(), Uuid::nil());
        assert!(reg.deliver("b", json!(2), false).await.is_empty());
    }
}
