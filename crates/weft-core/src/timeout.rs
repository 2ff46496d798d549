//! Per-node timers.
//!
//! A timer is a spawned sleep racing a `CancellationToken`. Concluding a
//! node cancels all of its timers; a timer that fires runs its callback,
//! which the engine uses to raise an EXPIRE interrupt.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Callback run when a timer fires.
pub type OnTimeout = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Default)]
pub struct TimeoutTracker {
    timers: Arc<DashMap<Uuid, Vec<(String, CancellationToken)>>>,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `node_execution_id` and return its instance id.
    pub fn arm(&self, node_execution_id: Uuid, after: Duration, on_timeout: OnTimeout) -> String {
        let instance_id = Uuid::now_v7().to_string();
        let token = CancellationToken::new();
        self.timers
            .entry(node_execution_id)
            .or_default()
            .push((instance_id.clone(), token.clone()));

        let timers = Arc::clone(&self.timers);
        let id = instance_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    remove_instance(&timers, node_execution_id, &id);
                    tracing::info!(node_execution_id = %node_execution_id, timeout_instance = %id, "node timeout fired");
                    on_timeout().await;
                }
            }
        });

        instance_id
    }

    /// Cancel every timer armed for `node_execution_id`.
    pub fn cancel_all(&self, node_execution_id: Uuid) -> usize {
        match self.timers.remove(&node_execution_id) {
            Some((_, tokens)) => {
                for (_, token) in &tokens {
                    token.cancel();
                }
                tokens.len()
            }
            None => 0,
        }
    }

    pub fn armed_count(&self, node_execution_id: Uuid) -> usize {
        self.timers
            .get(&node_execution_id)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

fn remove_instance(
    timers: &DashMap<Uuid, Vec<(String, CancellationToken)>>,
    node_execution_id: Uuid,
    instance_id: &str,
) {
    let now_empty = match timers.get_mut(&node_execution_id) {
        Some(mut entry) => {
            entry.retain(|(id, _)| id != instance_id);
            entry.is_empty()
        }
        None => false,
    };
    if now_empty {
        timers.remove_if(&node_execution_id, |_, v| v.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_callback(counter: &Arc<AtomicUsize>) -> OnTimeout {
        let counter = Arc::clone(counter);
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn fires_after_duration() {
        let tracker = TimeoutTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let node = Uuid::now_v7();
        tracker.arm(node, Duration::from_millis(20), counter_callback(&fired));
        assert_eq!(tracker.armed_count(node), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.armed_count(node), 0);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let tracker = TimeoutTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let node = Uuid::now_v7();
        tracker.arm(node, Duration::from_millis(50), counter_callback(&fired));
        tracker.arm(node, Duration::from_millis(50), counter_callback(&fired));
        assert_eq!(tracker.cancel_all(node), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
