//! JEXL evaluation of node `when` and skip conditions.
//!
//! Expressions see a JSON context built by [`ConditionContext`]; values are
//! always passed as context, never spliced into expression text.

use std::collections::HashMap;

use serde_json::{Value, json};
use weft_types::ambiance::Ambiance;
use weft_types::execution::Status;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid condition context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the string and collection transforms conditions use.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` and coerce the result with JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;
        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// ConditionContext
// ---------------------------------------------------------------------------

/// Data a condition can reference.
///
/// Shape:
/// ```json
/// {
///   "step": { "identifier": "...", "status": "..." },
///   "inputs": { ... },
///   "ambiance": { "fqn": "...", "retry_index": 0, "abstractions": { ... } },
///   "outcomes": { "<identifier>": { "status": "...", "outcome": ... } }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub identifier: String,
    pub inputs: Option<Value>,
    pub fqn: String,
    pub retry_index: u32,
    pub abstractions: HashMap<String, String>,
    /// Concluded nodes of the same plan execution, by identifier.
    pub outcomes: HashMap<String, (Status, Option<Value>)>,
}

impl ConditionContext {
    pub fn for_node(identifier: &str, ambiance: &Ambiance, inputs: Option<Value>) -> Self {
        Self {
            identifier: identifier.to_string(),
            inputs,
            fqn: ambiance.fqn(),
            retry_index: ambiance.current_level().map(|l| l.retry_index).unwrap_or(0),
            abstractions: ambiance.setup_abstractions.clone(),
            outcomes: HashMap::new(),
        }
    }

    pub fn with_outcome(mut self, identifier: impl Into<String>, status: Status, outcome: Option<Value>) -> Self {
        self.outcomes.insert(identifier.into(), (status, outcome));
        self
    }

    pub fn to_expression_context(&self) -> Value {
        let outcomes: serde_json::Map<String, Value> = self
            .outcomes
            .iter()
            .map(|(id, (status, outcome))| {
                (id.clone(), json!({ "status": status, "outcome": outcome }))
            })
            .collect();

        json!({
            "step": { "identifier": self.identifier },
            "inputs": self.inputs.clone().unwrap_or(json!({})),
            "ambiance": {
                "fqn": self.fqn,
                "retry_index": self.retry_index,
                "abstractions": self.abstractions,
            },
            "outcomes": outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context() -> Value {
        let ambiance = Ambiance::new(Uuid::now_v7(), Uuid::now_v7()).with_abstraction("env", "prod");
        ConditionContext::for_node("deploy", &ambiance, Some(json!({ "replicas": 3 })))
            .with_outcome("build", Status::Succeeded, Some(json!({ "artifact": "app.tar" })))
            .with_outcome("lint", Status::Failed, None)
            .to_expression_context()
    }

    #[test]
    fn reads_abstractions_and_inputs() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("ambiance.abstractions.env == 'prod'", &context()).unwrap());
        assert!(eval.evaluate_bool("inputs.replicas > 2", &context()).unwrap());
        assert!(!eval.evaluate_bool("inputs.replicas > 5", &context()).unwrap());
    }

    #[test]
    fn reads_sibling_outcomes() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("outcomes.build.status == 'SUCCEEDED'", &context())
            .unwrap());
        assert!(eval
            .evaluate_bool("outcomes.lint.status == 'FAILED'", &context())
            .unwrap());
    }

    #[test]
    fn transforms_apply() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("outcomes.build.outcome.artifact|contains('tar')", &context())
            .unwrap());
        assert!(eval.evaluate_bool("step.identifier|upper == 'DEPLOY'", &context()).unwrap());
    }

    #[test]
    fn missing_values_are_falsy() {
        let eval = ConditionEvaluator::new();
        assert!(!eval.evaluate_bool("inputs.missing", &context()).unwrap());
    }

    #[test]
    fn rejects_non_object_context() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("true", &json!([1])),
            Err(ConditionError::InvalidContext(_))
        ));
    }
}
