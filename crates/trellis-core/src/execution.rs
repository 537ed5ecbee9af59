use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{NodeKind, Variables};

/// Status of an execution. RUNNING is initial; COMPLETED, FAILED and
/// CANCELLED are terminal. PAUSED runs can be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The mutable record threaded through one run.
///
/// Owned by the runner task for the lifetime of the run. Checkpoints hold
/// serialized or cloned copies, never references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub graph_id: String,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    /// Node id -> that node's output.
    #[serde(default)]
    pub results: Variables,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Agent iterations consumed so far in this run.
    #[serde(default)]
    pub iterations: u32,
    /// Default iteration ceiling for agent nodes.
    pub max_iterations: u32,
    /// Nodes scheduled for the next step. Empty once the run is finished.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Scheduler steps taken.
    #[serde(default)]
    pub steps: u32,
    /// Permissions granted to capability invocations made by this run.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl ExecutionState {
    pub fn new(graph_id: impl Into<String>, variables: Variables, max_iterations: u32) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            graph_id: graph_id.into(),
            current_node: None,
            variables,
            results: Variables::new(),
            errors: vec![],
            iterations: 0,
            max_iterations,
            pending: vec![],
            steps: 0,
            permissions: vec![],
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Output of a node, if it produced one.
    pub fn result(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.results.get(node_id)
    }
}

/// Externally visible record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub graph_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error message when FAILED.
    #[serde(default)]
    pub error: Option<String>,
    /// Set when a run budget (time or steps) forced termination.
    #[serde(default)]
    pub ceiling: Option<String>,
    pub state: ExecutionState,
    /// Results of END nodes.
    #[serde(default)]
    pub summary: Variables,
}

impl ExecutionRecord {
    /// A fresh RUNNING record for `state`.
    pub fn running(state: &ExecutionState) -> Self {
        Self {
            id: state.execution_id.clone(),
            graph_id: state.graph_id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            ceiling: None,
            state: state.clone(),
            summary: Variables::new(),
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A run started (or resumed).
    RunStarted {
        execution_id: String,
        graph_id: String,
    },
    /// A node handler was dispatched.
    NodeStarted {
        execution_id: String,
        node_id: String,
        kind: NodeKind,
    },
    /// A node handler returned.
    NodeFinished {
        execution_id: String,
        node_id: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
    /// A checkpoint was written after a step.
    CheckpointSaved {
        execution_id: String,
        step: u32,
    },
    /// The run reached a terminal or paused status.
    RunFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}
