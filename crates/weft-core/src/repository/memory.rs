//! In-process implementation of every repository trait.
//!
//! Backed by `DashMap`s. Conditional updates run under the shard write lock
//! of the target entry, which makes `update_node_execution_if` and
//! `mark_wait_fired` atomic in the same way the SQLite implementation's
//! single-writer transactions are.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;
use weft_types::ambiance::Ambiance;
use weft_types::error::RepositoryError;
use weft_types::execution::{
    InputInstance, NodeExecution, NodeExecutionUpdate, PlanExecution, Status, UpdatePredicate,
};
use weft_types::interrupt::{Interrupt, InterruptState};
use weft_types::plan::Plan;
use weft_types::waitnotify::{NotifyResponse, WaitInstance};

use super::{
    InterruptRepository, NodeExecutionRepository, PlanExecutionRepository, PlanRepository,
    WaitNotifyRepository,
};

/// In-memory orchestration store.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    node_executions: DashMap<Uuid, NodeExecution>,
    input_instances: DashMap<Uuid, InputInstance>,
    plans: DashMap<Uuid, Plan>,
    plan_executions: DashMap<Uuid, PlanExecution>,
    waits: DashMap<Uuid, WaitInstance>,
    responses: DashMap<String, NotifyResponse>,
    interrupts: DashMap<Uuid, Interrupt>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted(&self, filter: impl Fn(&NodeExecution) -> bool) -> Vec<NodeExecution> {
        let mut records: Vec<NodeExecution> = self
            .node_executions
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }
}

// ---------------------------------------------------------------------------
// Node executions
// ---------------------------------------------------------------------------

impl NodeExecutionRepository for InMemoryRepository {
    async fn create_node_execution(&self, record: &NodeExecution) -> Result<(), RepositoryError> {
        match self.node_executions.entry(record.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_node_execution(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.node_executions.get(id).map(|r| r.value().clone()))
    }

    async fn update_node_execution_if(
        &self,
        id: &Uuid,
        predicate: &UpdatePredicate,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let mut record = self
            .node_executions
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        if record.try_apply(predicate, update) {
            Ok(Some(record.clone()))
        } else {
            Ok(None)
        }
    }

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.collect_sorted(|r| r.plan_execution_id == *plan_execution_id))
    }

    async fn list_children(
        &self,
        parent_id: &Uuid,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.collect_sorted(|r| {
            r.parent_id == Some(*parent_id) && (include_old_retries || !r.old_retry)
        }))
    }

    async fn list_descendants(&self, ambiance: &Ambiance) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.collect_sorted(|r| {
            r.ambiance.levels.len() > ambiance.levels.len() && ambiance.is_prefix_of(&r.ambiance)
        }))
    }

    async fn list_non_terminal(&self) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.collect_sorted(|r| !r.status.is_terminal()))
    }

    async fn save_input_instance(&self, instance: &InputInstance) -> Result<(), RepositoryError> {
        self.input_instances
            .insert(instance.node_execution_id, instance.clone());
        Ok(())
    }

    async fn get_input_instance(
        &self,
        node_execution_id: &Uuid,
    ) -> Result<Option<InputInstance>, RepositoryError> {
        Ok(self
            .input_instances
            .get(node_execution_id)
            .map(|r| r.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Plans and plan executions
// ---------------------------------------------------------------------------

impl PlanRepository for InMemoryRepository {
    async fn save_plan(&self, plan: &Plan) -> Result<(), RepositoryError> {
        self.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<Plan>, RepositoryError> {
        Ok(self.plans.get(id).map(|r| r.value().clone()))
    }
}

impl PlanExecutionRepository for InMemoryRepository {
    async fn create_plan_execution(&self, execution: &PlanExecution) -> Result<(), RepositoryError> {
        match self.plan_executions.entry(execution.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "plan execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get_plan_execution(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        Ok(self.plan_executions.get(id).map(|r| r.value().clone()))
    }

    async fn conclude_plan_execution(&self, id: &Uuid, status: Status) -> Result<bool, RepositoryError> {
        let mut execution = self
            .plan_executions
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = status;
        execution.end_ts = Some(Utc::now());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Wait / notify
// ---------------------------------------------------------------------------

impl WaitNotifyRepository for InMemoryRepository {
    async fn save_wait_instance(&self, wait: &WaitInstance) -> Result<(), RepositoryError> {
        self.waits.insert(wait.id, wait.clone());
        Ok(())
    }

    async fn waits_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitInstance>, RepositoryError> {
        let mut waits: Vec<WaitInstance> = self
            .waits
            .iter()
            .filter(|w| !w.fired && w.correlation_ids.iter().any(|id| id == correlation_id))
            .map(|w| w.value().clone())
            .collect();
        waits.sort_by_key(|w| w.created_at);
        Ok(waits)
    }

    async fn save_notify_response(&self, response: &NotifyResponse) -> Result<bool, RepositoryError> {
        match self.responses.entry(response.correlation_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(response.clone());
                Ok(true)
            }
        }
    }

    async fn responses_for(
        &self,
        correlation_ids: &[String],
    ) -> Result<Vec<NotifyResponse>, RepositoryError> {
        Ok(correlation_ids
            .iter()
            .filter_map(|id| self.responses.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn mark_wait_fired(&self, wait_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut wait = self.waits.get_mut(wait_id).ok_or(RepositoryError::NotFound)?;
        if wait.fired {
            return Ok(false);
        }
        wait.fired = true;
        Ok(true)
    }

    async fn list_unfired_waits(&self) -> Result<Vec<WaitInstance>, RepositoryError> {
        let mut waits: Vec<WaitInstance> = self
            .waits
            .iter()
            .filter(|w| !w.fired)
            .map(|w| w.value().clone())
            .collect();
        waits.sort_by_key(|w| w.created_at);
        Ok(waits)
    }

    async fn unfired_waits_for_node(
        &self,
        node_execution_id: &Uuid,
    ) -> Result<Vec<WaitInstance>, RepositoryError> {
        let mut waits: Vec<WaitInstance> = self
            .waits
            .iter()
            .filter(|w| !w.fired && w.callback.node_execution_id() == *node_execution_id)
            .map(|w| w.value().clone())
            .collect();
        waits.sort_by_key(|w| w.created_at);
        Ok(waits)
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

impl InterruptRepository for InMemoryRepository {
    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<(), RepositoryError> {
        self.interrupts.insert(interrupt.id, interrupt.clone());
        Ok(())
    }

    async fn get_interrupt(&self, id: &Uuid) -> Result<Option<Interrupt>, RepositoryError> {
        Ok(self.interrupts.get(id).map(|r| r.value().clone()))
    }

    async fn update_interrupt_state(
        &self,
        id: &Uuid,
        state: InterruptState,
    ) -> Result<(), RepositoryError> {
        let mut interrupt = self
            .interrupts
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        interrupt.state = state;
        interrupt.updated_at = Utc::now();
        Ok(())
    }

    async fn list_interrupts(&self, plan_execution_id: &Uuid) -> Result<Vec<Interrupt>, RepositoryError> {
        let mut interrupts: Vec<Interrupt> = self
            .interrupts
            .iter()
            .filter(|i| i.plan_execution_id == *plan_execution_id)
            .map(|i| i.value().clone())
            .collect();
        interrupts.sort_by_key(|i| i.created_at);
        Ok(interrupts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::ambiance::Level;
    use weft_types::execution::StepResponse;
    use weft_types::plan::{ExecutionMode, StepCategory, StepType};
    use weft_types::waitnotify::NotifyCallback;

    fn record(parent: Option<&NodeExecution>) -> NodeExecution {
        let id = Uuid::now_v7();
        let base = parent
            .map(|p| p.ambiance.clone())
            .unwrap_or_else(|| Ambiance::new(Uuid::now_v7(), Uuid::now_v7()));
        let ambiance = base.clone_for_child(Level::new(
            "node",
            id,
            "node",
            StepType::new("T", StepCategory::Step),
            None,
        ));
        let mut rec = NodeExecution::queued(id, ambiance, "node", "node", ExecutionMode::Sync);
        rec.parent_id = parent.map(|p| p.id);
        rec
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let repo = InMemoryRepository::new();
        let rec = record(None);
        repo.create_node_execution(&rec).await.unwrap();
        let err = repo.create_node_execution(&rec).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_if_respects_predicate() {
        let repo = InMemoryRepository::new();
        let rec = record(None);
        repo.create_node_execution(&rec).await.unwrap();

        let claimed = repo
            .update_node_execution_if(
                &rec.id,
                &UpdatePredicate::non_terminal().without_pending_outcome(),
                &NodeExecutionUpdate::new().pending_outcome(Some(StepResponse::succeeded())),
            )
            .await
            .unwrap();
        assert!(claimed.is_some());

        let second = repo
            .update_node_execution_if(
                &rec.id,
                &UpdatePredicate::non_terminal().without_pending_outcome(),
                &NodeExecutionUpdate::new().pending_outcome(Some(StepResponse::succeeded())),
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let missing = repo
            .update_node_execution_if(
                &Uuid::now_v7(),
                &UpdatePredicate::any(),
                &NodeExecutionUpdate::new(),
            )
            .await;
        assert!(matches!(missing, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn children_and_descendants() {
        let repo = InMemoryRepository::new();
        let root = record(None);
        let child = record(Some(&root));
        let mut retried_child = record(Some(&root));
        retried_child.old_retry = true;
        let grandchild = record(Some(&child));
        for r in [&root, &child, &retried_child, &grandchild] {
            repo.create_node_execution(r).await.unwrap();
        }

        assert_eq!(repo.list_children(&root.id, false).await.unwrap().len(), 1);
        assert_eq!(repo.list_children(&root.id, true).await.unwrap().len(), 2);
        assert_eq!(repo.list_descendants(&root.ambiance).await.unwrap().len(), 3);
        assert_eq!(repo.list_descendants(&child.ambiance).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notify_response_is_insert_if_absent() {
        let repo = InMemoryRepository::new();
        let first = NotifyResponse::new("cb", serde_json::json!(1), false);
        let second = NotifyResponse::new("cb", serde_json::json!(2), false);
        assert!(repo.save_notify_response(&first).await.unwrap());
        assert!(!repo.save_notify_response(&second).await.unwrap());
        let stored = repo.responses_for(&["cb".to_string()]).await.unwrap();
        assert_eq!(stored[0].payload, serde_json::json!(1));
    }

    #[tokio::test]
    async fn mark_fired_only_once() {
        let repo = InMemoryRepository::new();
        let wait = WaitInstance::new(
            vec!["a".to_string()],
            NotifyCallback::Progress {
                node_execution_id: Uuid::now_v7(),
                correlation_id: "a".to_string(),
            },
        );
        repo.save_wait_instance(&wait).await.unwrap();
        assert_eq!(repo.waits_for_correlation("a").await.unwrap().len(), 1);
        assert!(repo.mark_wait_fired(&wait.id).await.unwrap());
        assert!(!repo.mark_wait_fired(&wait.id).await.unwrap());
        assert!(repo.waits_for_correlation("a").await.unwrap().is_empty());
        assert!(repo.list_unfired_waits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unfired_waits_are_found_by_target_node() {
        let repo = InMemoryRepository::new();
        let target = Uuid::now_v7();
        let progress = |node_execution_id: Uuid, id: &str| NotifyCallback::Progress {
            node_execution_id,
            correlation_id: id.to_string(),
        };
        let mine = WaitInstance::new(vec!["a".to_string()], progress(target, "a"));
        let fired = WaitInstance::new(vec!["b".to_string()], progress(target, "b"));
        let other = WaitInstance::new(vec!["c".to_string()], progress(Uuid::now_v7(), "c"));
        for wait in [&mine, &fired, &other] {
            repo.save_wait_instance(wait).await.unwrap();
        }
        repo.mark_wait_fired(&fired.id).await.unwrap();

        let found = repo.unfired_waits_for_node(&target).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, mine.id);
    }

    #[tokio::test]
    async fn conclude_plan_execution_once() {
        let repo = InMemoryRepository::new();
        let execution = PlanExecution {
            id: Uuid::now_v7(),
            plan_id: Uuid::now_v7(),
            status: Status::Running,
            ambiance: Ambiance::new(Uuid::now_v7(), Uuid::now_v7()),
            start_ts: Utc::now(),
            end_ts: None,
        };
        repo.create_plan_execution(&execution).await.unwrap();
        assert!(repo
            .conclude_plan_execution(&execution.id, Status::Succeeded)
            .await
            .unwrap());
        assert!(!repo
            .conclude_plan_execution(&execution.id, Status::Failed)
            .await
            .unwrap());
        let stored = repo.get_plan_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
    }
}
