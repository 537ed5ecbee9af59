use futures::future::BoxFuture;

use crate::error::{CapabilityError, Result};
use crate::execution::ExecutionState;
use crate::types::{CapabilityKind, InvocationContext, Variables};

/// An invocable unit (agent or tool) addressed by name.
pub trait Capability: Send + Sync + 'static {
    /// Registry name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Tool
    }

    /// Permissions the caller must hold, all of them, to invoke this capability.
    fn required_permissions(&self) -> Vec<String> {
        vec![]
    }

    /// Check parameters before invocation. `Err` carries a human-readable reason.
    fn validate(&self, params: &serde_json::Value) -> std::result::Result<(), String> {
        let _ = params;
        Ok(())
    }

    /// Per-invocation timeout. `None` uses the registry default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Invoke with the given parameters.
    fn invoke(
        &self,
        params: serde_json::Value,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, CapabilityError>>;
}

/// Read view handed to condition evaluators.
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    pub variables: &'a Variables,
    pub results: &'a Variables,
}

impl<'a> ConditionScope<'a> {
    pub fn new(variables: &'a Variables, results: &'a Variables) -> Self {
        Self { variables, results }
    }

    pub fn of(state: &'a ExecutionState) -> Self {
        Self::new(&state.variables, &state.results)
    }

    /// Resolve a dotted path. `results.<node>` and `variables.<key>` address the
    /// two maps explicitly; any other path starts in the variables.
    pub fn lookup(&self, path: &str) -> Option<&'a serde_json::Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let (root, mut current) = match first {
            "results" => (self.results, None),
            "variables" => (self.variables, None),
            key => (self.variables, Some(self.variables.get(key)?)),
        };
        for segment in segments {
            current = Some(match current {
                None => root.get(segment)?,
                Some(value) => match value {
                    serde_json::Value::Object(map) => map.get(segment)?,
                    serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                    _ => return None,
                },
            });
        }
        current
    }
}

/// Condition evaluation hook for conditional edges and condition nodes.
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, expr: &str, scope: &ConditionScope<'_>) -> Result<bool>;
}

/// Decides whether an agent's reflection text signals completion.
pub trait CompletionDetector: Send + Sync + 'static {
    fn is_complete(&self, text: &str) -> bool;
}

/// Latest-snapshot-wins persistence keyed by execution id.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Overwrite the snapshot for `execution_id`.
    fn save(&self, execution_id: &str, state: &ExecutionState) -> Result<()>;

    /// Most recent snapshot, or `CheckpointNotFound`.
    fn load(&self, execution_id: &str) -> Result<ExecutionState>;

    /// Remove the snapshot. Returns whether one existed.
    fn delete(&self, execution_id: &str) -> Result<bool>;

    /// Execution ids with a stored snapshot.
    fn list(&self) -> Result<Vec<String>>;
}
