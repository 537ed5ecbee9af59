use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StructuralError;

/// Workflow-scoped key/value context. Backed by a sorted map so that
/// serialized definitions and checkpoints are deterministic.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Type tag of a node. Selects the handler in the scheduler's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    End,
    Agent,
    Tool,
    Condition,
    Parallel,
    Wait,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// A typed unit of work in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the owning graph.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Per-kind configuration (e.g. `agent_id` and `task` for agent nodes).
    #[serde(default)]
    pub config: Variables,
    /// Declared input slots. Informational only.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared output slots. Informational only.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            config: Variables::new(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Parallel)
    }

    /// An agent node running `agent_id` on `task`.
    pub fn agent(id: impl Into<String>, agent_id: &str, task: &str) -> Self {
        Self::new(id, NodeKind::Agent)
            .with_config("agent_id", serde_json::json!(agent_id))
            .with_config("task", serde_json::json!(task))
    }

    /// A tool node invoking `tool_name` with `input` as parameters.
    pub fn tool(id: impl Into<String>, tool_name: &str, input: serde_json::Value) -> Self {
        Self::new(id, NodeKind::Tool)
            .with_config("tool_name", serde_json::json!(tool_name))
            .with_config("input", input)
    }

    /// A condition node branching on `expr`.
    pub fn condition(id: impl Into<String>, expr: &str) -> Self {
        Self::new(id, NodeKind::Condition).with_config("condition", serde_json::json!(expr))
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a single config entry.
    pub fn with_config(mut self, key: &str, value: serde_json::Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_inputs(mut self, slots: Vec<String>) -> Self {
        self.inputs = slots;
        self
    }

    pub fn with_outputs(mut self, slots: Vec<String>) -> Self {
        self.outputs = slots;
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    /// Read a config entry holding a list of strings. Non-string items are skipped.
    pub fn config_list(&self, key: &str) -> Vec<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A directed transition between two nodes of the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Opaque condition expression. `None` means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Create an unconditional edge. The id is derived from the endpoints.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition: None,
            label: None,
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::new(source, target).with_condition(expr)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether this edge is the false branch of a condition node
    /// (labelled `false` or `else`, case-insensitive).
    pub fn is_else_branch(&self) -> bool {
        self.label
            .as_deref()
            .map(|l| l.eq_ignore_ascii_case("false") || l.eq_ignore_ascii_case("else"))
            .unwrap_or(false)
    }
}

/// Validated, immutable description of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Default variables, overlaid by the caller's initial variables.
    #[serde(default)]
    pub variables: Variables,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl GraphDefinition {
    /// Build and validate a definition. Rejects the whole graph on the first violation.
    pub fn build(
        name: impl Into<String>,
        description: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> std::result::Result<Self, StructuralError> {
        let definition = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            version: default_version(),
            nodes,
            edges,
            variables: Variables::new(),
            created_at: Utc::now(),
        };
        definition.validate()?;
        Ok(definition)
    }

    /// The built-in agent topology: `start -> agent -> end`.
    pub fn single_agent(
        agent_id: &str,
        task: &str,
        max_iterations: u32,
    ) -> std::result::Result<Self, StructuralError> {
        Self::build(
            format!("agent:{}", agent_id),
            task,
            vec![
                Node::start("start"),
                Node::agent("agent", agent_id, task)
                    .with_config("max_iterations", serde_json::json!(max_iterations)),
                Node::end("end"),
            ],
            vec![Edge::new("start", "agent"), Edge::new("agent", "end")],
        )
    }

    /// Replace the default variables.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Check the definition invariants.
    pub fn validate(&self) -> std::result::Result<(), StructuralError> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(StructuralError::DuplicateNode(node.id.clone()));
            }
        }

        if !self.nodes.iter().any(|n| n.kind == NodeKind::Start) {
            return Err(StructuralError::MissingStart);
        }
        if !self.nodes.iter().any(|n| n.kind == NodeKind::End) {
            return Err(StructuralError::MissingEnd);
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(StructuralError::DuplicateEdge(edge.id.clone()));
            }
            if !node_ids.contains(edge.source.as_str()) {
                return Err(StructuralError::DanglingSource {
                    edge: edge.id.clone(),
                    node: edge.source.clone(),
                });
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(StructuralError::DanglingTarget {
                    edge: edge.id.clone(),
                    node: edge.target.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Whether a capability is an agent (reasoning loop backend) or a plain tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Agent,
    Tool,
}

/// Context passed to capabilities on every invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub execution_id: String,
    pub node_id: String,
}

impl InvocationContext {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
        }
    }
}
