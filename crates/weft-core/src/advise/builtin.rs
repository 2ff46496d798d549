//! Built-in advisers wired by the built-in plan creators.
//!
//! Failure advisers never act on ABORTED: an abort is an operator decision
//! and must not be retried or redirected by policy. A forced failure is
//! matched as `USER_MARKED_FAILURE` but never retried.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use weft_types::advise::{AdviserResponse, RollbackStrategy};
use weft_types::execution::{FailureType, Status};
use weft_types::interrupt::InterruptKind;

use super::{AdviseError, Adviser, AdvisingEvent};

pub const ADVISER_NEXT_STEP: &str = "NEXT_STEP";
pub const ADVISER_ON_SUCCESS: &str = "ON_SUCCESS";
pub const ADVISER_ON_FAIL: &str = "ON_FAIL";
pub const ADVISER_RETRY: &str = "RETRY";
pub const ADVISER_MANUAL_INTERVENTION: &str = "MANUAL_INTERVENTION";
pub const ADVISER_IGNORE: &str = "IGNORE";
pub const ADVISER_MARK_SUCCESS: &str = "MARK_SUCCESS";
pub const ADVISER_MARK_FAILURE: &str = "MARK_FAILURE";
pub const ADVISER_ROLLBACK: &str = "ROLLBACK";

fn params<T: DeserializeOwned>(adviser: &str, value: &Value) -> Result<T, AdviseError> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|e| AdviseError::InvalidParameters {
        adviser: adviser.to_string(),
        message: e.to_string(),
    })
}

/// Broken (but not aborted) outcome whose failure types intersect
/// `failure_types`; an empty filter matches every failure.
fn failure_matches(event: &AdvisingEvent<'_>, failure_types: &[FailureType]) -> bool {
    let status = event.response.status;
    if !status.is_broken() || status == Status::Aborted {
        return false;
    }
    if failure_types.is_empty() {
        return true;
    }
    let reported = event
        .response
        .failure_info
        .as_ref()
        .map(|f| f.failure_types.as_slice())
        .unwrap_or_default();
    let expired_as_timeout = status == Status::Expired && failure_types.contains(&FailureType::Timeout);
    expired_as_timeout || reported.iter().any(|t| failure_types.contains(t))
}

#[derive(Debug, Default, Deserialize)]
struct FailureFilter {
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    next_node_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NextStepParams {
    next_node_id: String,
}

/// Advance to the next sibling after a positive outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_NEXT_STEP
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, _parameters: &Value) -> Result<bool, AdviseError> {
        Ok(event.response.status.is_positive())
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: NextStepParams = params(ADVISER_NEXT_STEP, parameters)?;
        Ok(Some(AdviserResponse::Advance {
            next_node_id: p.next_node_id,
        }))
    }
}

/// Advance only on SUCCEEDED (not SKIPPED).
#[derive(Debug, Clone, Copy, Default)]
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_ON_SUCCESS
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, _parameters: &Value) -> Result<bool, AdviseError> {
        Ok(event.response.status == Status::Succeeded)
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: NextStepParams = params(ADVISER_ON_SUCCESS, parameters)?;
        Ok(Some(AdviserResponse::Advance {
            next_node_id: p.next_node_id,
        }))
    }
}

// ---------------------------------------------------------------------------
// Failure path
// ---------------------------------------------------------------------------

/// Redirect to another node on a matching failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_ON_FAIL
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: FailureFilter = params(ADVISER_ON_FAIL, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: FailureFilter = params(ADVISER_ON_FAIL, parameters)?;
        Ok(p.next_node_id.map(|next_node_id| AdviserResponse::Advance { next_node_id }))
    }
}

/// Action once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AfterRetryAction {
    MarkFailure,
    MarkSuccess,
    Ignore,
    ManualIntervention,
    Rollback,
}

#[derive(Debug, Clone, Deserialize)]
struct AfterRetry {
    action: AfterRetryAction,
    #[serde(default)]
    next_node_id: Option<String>,
    #[serde(default)]
    rollback_node_id: Option<String>,
    #[serde(default)]
    strategy: Option<RollbackStrategy>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    retry_count: u32,
    #[serde(default)]
    wait_intervals_ms: Vec<u64>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    after_retry: Option<AfterRetry>,
}

/// Retry with per-attempt wait intervals; the last interval repeats.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_RETRY
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        if event.from_interrupt == Some(InterruptKind::UserMarkedFailAll) {
            return Ok(false);
        }
        let p: RetryParams = params(ADVISER_RETRY, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: RetryParams = params(ADVISER_RETRY, parameters)?;
        let retry_index = event.retry_index();

        if retry_index < p.retry_count {
            let wait_interval_ms = p
                .wait_intervals_ms
                .get(retry_index as usize)
                .or(p.wait_intervals_ms.last())
                .copied()
                .unwrap_or(0);
            return Ok(Some(AdviserResponse::Retry {
                wait_interval_ms,
                retry_index,
            }));
        }

        let Some(after) = p.after_retry else {
            return Ok(None);
        };
        let decision = match after.action {
            AfterRetryAction::MarkFailure => AdviserResponse::MarkFailure,
            AfterRetryAction::MarkSuccess => AdviserResponse::MarkSuccess {
                next_node_id: after.next_node_id,
            },
            AfterRetryAction::Ignore => AdviserResponse::Ignore {
                next_node_id: after.next_node_id,
            },
            AfterRetryAction::ManualIntervention => AdviserResponse::WaitIntervention {
                timeout_ms: after.timeout_ms,
            },
            AfterRetryAction::Rollback => match after.rollback_node_id {
                Some(rollback_node_id) => AdviserResponse::Rollback {
                    rollback_node_id,
                    strategy: after.strategy.unwrap_or(RollbackStrategy::Stage),
                },
                None => return Ok(None),
            },
        };
        Ok(Some(decision))
    }
}

#[derive(Debug, Default, Deserialize)]
struct InterventionParams {
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Park the node until an operator acts on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_MANUAL_INTERVENTION
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: InterventionParams = params(ADVISER_MANUAL_INTERVENTION, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: InterventionParams = params(ADVISER_MANUAL_INTERVENTION, parameters)?;
        Ok(Some(AdviserResponse::WaitIntervention {
            timeout_ms: p.timeout_ms,
        }))
    }
}

/// Treat a matching failure as success for propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_IGNORE
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: FailureFilter = params(ADVISER_IGNORE, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: FailureFilter = params(ADVISER_IGNORE, parameters)?;
        Ok(Some(AdviserResponse::Ignore {
            next_node_id: p.next_node_id,
        }))
    }
}

/// Conclude a matching failure as SUCCEEDED.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_MARK_SUCCESS
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: FailureFilter = params(ADVISER_MARK_SUCCESS, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: FailureFilter = params(ADVISER_MARK_SUCCESS, parameters)?;
        Ok(Some(AdviserResponse::MarkSuccess {
            next_node_id: p.next_node_id,
        }))
    }
}

/// Conclude a matching failure as FAILED and stop advancing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkFailureAdviser;

impl Adviser for MarkFailureAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_MARK_FAILURE
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: FailureFilter = params(ADVISER_MARK_FAILURE, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, _parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        Ok(Some(AdviserResponse::MarkFailure))
    }
}

#[derive(Debug, Deserialize)]
struct RollbackParams {
    rollback_node_id: String,
    #[serde(default)]
    strategy: Option<RollbackStrategy>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
}

/// Run the enclosing section's rollback steps on a matching failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackAdviser;

impl Adviser for RollbackAdviser {
    fn adviser_type(&self) -> &'static str {
        ADVISER_ROLLBACK
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError> {
        let p: RollbackParams = params(ADVISER_ROLLBACK, parameters)?;
        Ok(failure_matches(event, &p.failure_types))
    }

    fn advise(&self, _event: &AdvisingEvent<'_>, parameters: &Value) -> Result<Option<AdviserResponse>, AdviseError> {
        let p: RollbackParams = params(ADVISER_ROLLBACK, parameters)?;
        Ok(Some(AdviserResponse::Rollback {
            rollback_node_id: p.rollback_node_id,
            strategy: p.strategy.unwrap_or(RollbackStrategy::Stage),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use weft_types::execution::{FailureInfo, StepResponse};
    use weft_types::plan::AdviserObtainment;

    use crate::advise::AdviserRegistry;
    use crate::advise::tests::{node, record};

    fn decide(
        bindings: Vec<AdviserObtainment>,
        retries_made: usize,
        response: StepResponse,
    ) -> Option<AdviserResponse> {
        let node = node(bindings);
        let mut rec = record();
        rec.retry_ids = (0..retries_made).map(|_| Uuid::now_v7()).collect();
        let event = AdvisingEvent {
            record: &rec,
            node: &node,
            response: &response,
            from_interrupt: None,
        };
        AdviserRegistry::with_builtins().advise(&event).unwrap()
    }

    fn connectivity_failure() -> StepResponse {
        StepResponse::failed(FailureInfo::new("refused", vec![FailureType::Connectivity]))
    }

    #[test]
    fn next_step_only_on_positive() {
        let bindings = vec![AdviserObtainment::new(ADVISER_NEXT_STEP, json!({ "next_node_id": "n2" }))];
        assert_eq!(
            decide(bindings.clone(), 0, StepResponse::skipped()),
            Some(AdviserResponse::Advance { next_node_id: "n2".into() })
        );
        assert_eq!(decide(bindings, 0, connectivity_failure()), None);
    }

    #[test]
    fn on_success_ignores_skipped() {
        let bindings = vec![AdviserObtainment::new(ADVISER_ON_SUCCESS, json!({ "next_node_id": "n2" }))];
        assert_eq!(decide(bindings, 0, StepResponse::skipped()), None);
    }

    #[test]
    fn retry_uses_intervals_then_after_retry_action() {
        let bindings = vec![AdviserObtainment::new(
            ADVISER_RETRY,
            json!({
                "retry_count": 2,
                "wait_intervals_ms": [100, 500],
                "after_retry": { "action": "IGNORE", "next_node_id": "n3" }
            }),
        )];
        assert_eq!(
            decide(bindings.clone(), 0, connectivity_failure()),
            Some(AdviserResponse::Retry { wait_interval_ms: 100, retry_index: 0 })
        );
        assert_eq!(
            decide(bindings.clone(), 1, connectivity_failure()),
            Some(AdviserResponse::Retry { wait_interval_ms: 500, retry_index: 1 })
        );
        assert_eq!(
            decide(bindings, 2, connectivity_failure()),
            Some(AdviserResponse::Ignore { next_node_id: Some("n3".into()) })
        );
    }

    #[test]
    fn retry_exhausted_without_action_gives_no_decision() {
        let bindings = vec![AdviserObtainment::new(ADVISER_RETRY, json!({ "retry_count": 1 }))];
        assert_eq!(decide(bindings, 1, connectivity_failure()), None);
    }

    #[test]
    fn failure_types_filter() {
        let bindings = vec![AdviserObtainment::new(
            ADVISER_MARK_SUCCESS,
            json!({ "failure_types": ["AUTHENTICATION"] }),
        )];
        assert_eq!(decide(bindings, 0, connectivity_failure()), None);
    }

    #[test]
    fn expired_matches_timeout_filter() {
        let bindings = vec![AdviserObtainment::new(
            ADVISER_MANUAL_INTERVENTION,
            json!({ "failure_types": ["TIMEOUT"], "timeout_ms": 1000 }),
        )];
        let expired = StepResponse::broken(Status::Expired, FailureInfo::new("expired", vec![]));
        assert_eq!(
            decide(bindings, 0, expired),
            Some(AdviserResponse::WaitIntervention { timeout_ms: Some(1000) })
        );
    }

    #[test]
    fn aborted_is_never_advised() {
        let bindings = vec![
            AdviserObtainment::new(ADVISER_RETRY, json!({ "retry_count": 3 })),
            AdviserObtainment::new(ADVISER_IGNORE, json!({})),
        ];
        let aborted = StepResponse::broken(Status::Aborted, FailureInfo::new("aborted", vec![]));
        assert_eq!(decide(bindings, 0, aborted), None);
    }

    #[test]
    fn forced_failure_matches_filters_but_is_not_retried() {
        let node = node(vec![
            AdviserObtainment::new(ADVISER_RETRY, json!({ "retry_count": 3 })),
            AdviserObtainment::new(
                ADVISER_MARK_SUCCESS,
                json!({ "failure_types": ["USER_MARKED_FAILURE"], "next_node_id": "cleanup" }),
            ),
        ]);
        let rec = record();
        let response = StepResponse::broken(
            Status::Failed,
            FailureInfo::new("User initiated failure", vec![FailureType::UserMarkedFailure]),
        );
        let event = AdvisingEvent {
            record: &rec,
            node: &node,
            response: &response,
            from_interrupt: Some(InterruptKind::UserMarkedFailAll),
        };
        assert_eq!(
            AdviserRegistry::with_builtins().advise(&event).unwrap(),
            Some(AdviserResponse::MarkSuccess { next_node_id: Some("cleanup".into()) })
        );
    }

    #[test]
    fn rollback_defaults_to_stage_scope() {
        let bindings = vec![AdviserObtainment::new(ADVISER_ROLLBACK, json!({ "rollback_node_id": "rb" }))];
        assert_eq!(
            decide(bindings, 0, connectivity_failure()),
            Some(AdviserResponse::Rollback {
                rollback_node_id: "rb".into(),
                strategy: RollbackStrategy::Stage
            })
        );
    }

    #[test]
    fn invalid_parameters_reported() {
        let node = node(vec![AdviserObtainment::new(ADVISER_NEXT_STEP, json!({}))]);
        let rec = record();
        let response = StepResponse::succeeded();
        let event = AdvisingEvent {
            record: &rec,
            node: &node,
            response: &response,
            from_interrupt: None,
        };
        assert!(matches!(
            AdviserRegistry::with_builtins().advise(&event),
            Err(AdviseError::InvalidParameters { .. })
        ));
    }
}
