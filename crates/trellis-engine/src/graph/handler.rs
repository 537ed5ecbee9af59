use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use trellis_core::error::CapabilityError;
use trellis_core::traits::{CompletionDetector, ConditionEvaluator, ConditionScope};
use trellis_core::types::{InvocationContext, Node, NodeKind, Variables};
use trellis_core::ExecutionState;
use trellis_tools::{invoke_capability, CapabilityRegistry};

use super::compiler::CompiledGraph;
use crate::agent_loop::AgentLoop;

/// What a node handler produced. The runner merges it into the execution state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Stored under the node's id in `results`.
    pub result: Option<Value>,
    /// Variable updates. Later writers win on key collisions.
    pub variables: Variables,
    /// Node-level errors appended to the run's error list.
    pub errors: Vec<String>,
    /// Outcome of a condition node. Selects the true or else branch.
    pub branch: Option<bool>,
    /// Agent iterations consumed.
    pub iterations: u32,
    /// Suspend the run after this step.
    pub pause: bool,
}

impl NodeOutput {
    pub fn value(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// A node-level failure: the message is recorded as an error and as the
    /// node's result.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result: Some(json!({ "error": message })),
            errors: vec![message],
            ..Self::default()
        }
    }

    /// Also write the result into `variable`.
    pub fn with_output_var(mut self, variable: Option<&str>) -> Self {
        if let (Some(name), Some(result)) = (variable, &self.result) {
            self.variables.insert(name.to_string(), result.clone());
        }
        self
    }
}

/// Shared services available to handlers during a run.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<tokio::sync::RwLock<CapabilityRegistry>>,
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub detector: Arc<dyn CompletionDetector>,
    pub graph: Arc<CompiledGraph>,
}

impl HandlerContext {
    /// Invoke a capability with the run's permissions. The registry lock is
    /// released before the capability runs.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        state: &ExecutionState,
        node_id: &str,
    ) -> Result<Value, CapabilityError> {
        let (capability, default_timeout) = {
            let registry = self.registry.read().await;
            let capability = registry
                .get(name)
                .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
            (capability, registry.default_timeout_secs())
        };
        invoke_capability(
            capability,
            params,
            &state.permissions,
            InvocationContext::new(&state.execution_id, node_id),
            default_timeout,
        )
        .await
    }
}

/// Behavior of one node kind.
pub trait NodeHandler: Send + Sync {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput>;
}

/// The dispatch table.
pub fn handler_for(kind: NodeKind) -> &'static dyn NodeHandler {
    match kind {
        NodeKind::Start => &StartHandler,
        NodeKind::End => &EndHandler,
        NodeKind::Agent => &AgentHandler,
        NodeKind::Tool => &ToolHandler,
        NodeKind::Condition => &ConditionHandler,
        NodeKind::Parallel => &ParallelHandler,
        NodeKind::Wait => &WaitHandler,
    }
}

pub struct StartHandler;

impl NodeHandler for StartHandler {
    fn run<'a>(
        &'a self,
        _node: &'a Node,
        _state: &'a ExecutionState,
        _ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async { NodeOutput::default() })
    }
}

/// Fan-out marker. The runner schedules every selected target concurrently.
pub struct ParallelHandler;

impl NodeHandler for ParallelHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        _state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            let branches: Vec<&str> = ctx
                .graph
                .transitions(&node.id)
                .iter()
                .map(|t| t.target.as_str())
                .collect();
            debug!(node_id = %node.id, ?branches, "Fanning out");
            NodeOutput::default()
        })
    }
}

/// Collects the results of the nodes that lead into it.
pub struct EndHandler;

impl NodeHandler for EndHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            let mut collected = Variables::new();
            for pred in ctx.graph.predecessors(&node.id) {
                if let Some(result) = state.result(pred) {
                    collected.insert(pred.clone(), result.clone());
                }
            }
            NodeOutput::value(Value::Object(collected))
        })
    }
}

/// Invokes `config.tool_name` with `config.input` (or the value at the
/// `config.input_from` path) as parameters.
pub struct ToolHandler;

impl NodeHandler for ToolHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            let Some(tool_name) = node.config_str("tool_name") else {
                return NodeOutput::failed(format!("Tool node {} has no tool_name", node.id));
            };

            let params = match node.config_str("input_from") {
                Some(path) => ConditionScope::of(state)
                    .lookup(path)
                    .cloned()
                    .unwrap_or(Value::Null),
                None => node.config.get("input").cloned().unwrap_or_else(|| json!({})),
            };

            match ctx.invoke(tool_name, params, state, &node.id).await {
                Ok(value) => NodeOutput::value(value).with_output_var(node.config_str("output")),
                Err(e) => {
                    warn!(node_id = %node.id, tool = %tool_name, error = %e, "Tool node failed");
                    NodeOutput::failed(format!("Node {}: {}", node.id, e))
                }
            }
        })
    }
}

/// Evaluates `config.condition` (default `true`) and selects a branch.
pub struct ConditionHandler;

impl NodeHandler for ConditionHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            let expr = node.config_str("condition").unwrap_or("true");
            match ctx.evaluator.evaluate(expr, &ConditionScope::of(state)) {
                Ok(holds) => NodeOutput {
                    branch: Some(holds),
                    ..NodeOutput::value(Value::Bool(holds))
                }
                .with_output_var(node.config_str("output")),
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Condition evaluation failed");
                    NodeOutput {
                        branch: Some(false),
                        ..NodeOutput::failed(format!("Node {}: {}", node.id, e))
                    }
                }
            }
        })
    }
}

/// Sleeps for `config.duration_ms`, or pauses the run when no duration is set.
pub struct WaitHandler;

impl NodeHandler for WaitHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        _state: &'a ExecutionState,
        _ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            match node.config_u64("duration_ms") {
                Some(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    NodeOutput::value(json!({ "waited_ms": ms }))
                }
                None => NodeOutput {
                    pause: true,
                    ..NodeOutput::value(json!({ "paused": true }))
                },
            }
        })
    }
}

/// Runs the plan / execute / reflect loop against `config.agent_id`.
pub struct AgentHandler;

impl NodeHandler for AgentHandler {
    fn run<'a>(
        &'a self,
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            match AgentLoop::from_node(node, state, ctx) {
                Ok(agent) => agent.run().await,
                Err(message) => NodeOutput::failed(message),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{compile, ExpressionEvaluator};
    use crate::reflect::PhraseDetector;
    use trellis_core::types::{Edge, GraphDefinition};
    use trellis_test_utils::MockTool;

    fn context(def: &GraphDefinition, registry: CapabilityRegistry) -> HandlerContext {
        HandlerContext {
            registry: Arc::new(tokio::sync::RwLock::new(registry)),
            evaluator: Arc::new(ExpressionEvaluator),
            detector: Arc::new(PhraseDetector::default()),
            graph: Arc::new(compile(def).unwrap()),
        }
    }

    fn graph(middle: Node) -> GraphDefinition {
        let id = middle.id.clone();
        GraphDefinition::build(
            "g",
            "",
            vec![Node::start("s"), middle, Node::end("e")],
            vec![Edge::new("s", &id), Edge::new(&id, "e")],
        )
        .unwrap()
    }

    fn state_with(vars: Value) -> ExecutionState {
        let vars = vars.as_object().cloned().unwrap_or_default();
        ExecutionState::new("g", vars, 10)
    }

    #[tokio::test]
    async fn test_tool_node_writes_output_var() {
        let node = Node::tool("t", "lookup", json!({"q": "x"})).with_config("output", json!("found"));
        let def = graph(node.clone());
        let mut registry = CapabilityRegistry::new();
        let tool = MockTool::returning("lookup", json!({"hits": 1}));
        let calls = tool.calls();
        registry.register(tool);
        let ctx = context(&def, registry);

        let out = handler_for(NodeKind::Tool)
            .run(&node, &state_with(json!({})), &ctx)
            .await;
        assert_eq!(out.result, Some(json!({"hits": 1})));
        assert_eq!(out.variables.get("found"), Some(&json!({"hits": 1})));
        assert_eq!(calls.lock().unwrap()[0], json!({"q": "x"}));
    }

    #[tokio::test]
    async fn test_tool_node_input_from_path() {
        let node = Node::new("t", NodeKind::Tool)
            .with_config("tool_name", json!("echo"))
            .with_config("input_from", json!("request"));
        let def = graph(node.clone());
        let ctx = context(&def, CapabilityRegistry::with_builtins());

        let out = handler_for(NodeKind::Tool)
            .run(&node, &state_with(json!({"request": {"a": 1}})), &ctx)
            .await;
        assert_eq!(out.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_tool_node_missing_capability() {
        let node = Node::tool("t", "ghost", json!({}));
        let def = graph(node.clone());
        let ctx = context(&def, CapabilityRegistry::new());

        let out = handler_for(NodeKind::Tool)
            .run(&node, &state_with(json!({})), &ctx)
            .await;
        assert_eq!(out.errors, vec!["Node t: Capability not found: ghost"]);
        assert_eq!(
            out.result,
            Some(json!({"error": "Node t: Capability not found: ghost"}))
        );
    }

    #[tokio::test]
    async fn test_tool_node_permission_denied() {
        let node = Node::tool("t", "files", json!({}));
        let def = graph(node.clone());
        let mut registry = CapabilityRegistry::new();
        registry.register(
            MockTool::returning("files", json!("ok")).with_permissions(vec!["fs.read".into()]),
        );
        let ctx = context(&def, registry);

        let denied = handler_for(NodeKind::Tool)
            .run(&node, &state_with(json!({})), &ctx)
            .await;
        assert_eq!(denied.errors.len(), 1);
        assert!(denied.errors[0].contains("Permission denied"));

        let granted = state_with(json!({})).with_permissions(vec!["fs.read".into()]);
        let ok = handler_for(NodeKind::Tool).run(&node, &granted, &ctx).await;
        assert!(ok.errors.is_empty());
        assert_eq!(ok.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_condition_node() {
        let node = Node::condition("c", "count >= 2");
        let def = graph(node.clone());
        let ctx = context(&def, CapabilityRegistry::new());

        let out = handler_for(NodeKind::Condition)
            .run(&node, &state_with(json!({"count": 3})), &ctx)
            .await;
        assert_eq!(out.branch, Some(true));
        assert_eq!(out.result, Some(json!(true)));

        let out = handler_for(NodeKind::Condition)
            .run(&node, &state_with(json!({"count": 1})), &ctx)
            .await;
        assert_eq!(out.branch, Some(false));
    }

    #[tokio::test]
    async fn test_condition_node_defaults_to_true() {
        let node = Node::new("c", NodeKind::Condition);
        let def = graph(node.clone());
        let ctx = context(&def, CapabilityRegistry::new());
        let out = handler_for(NodeKind::Condition)
            .run(&node, &state_with(json!({})), &ctx)
            .await;
        assert_eq!(out.branch, Some(true));
    }

    #[tokio::test]
    async fn test_condition_node_parse_error() {
        let node = Node::condition("c", "count >");
        let def = graph(node.clone());
        let ctx = context(&def, CapabilityRegistry::new());
        let out = handler_for(NodeKind::Condition)
            .run(&node, &state_with(json!({})), &ctx)
            .await;
        assert_eq!(out.branch, Some(false));
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_end_collects_predecessors() {
        let def = graph(Node::parallel("p"));
        let ctx = context(&def, CapabilityRegistry::new());
        let mut state = state_with(json!({}));
        state.results.insert("p".into(), json!("branch output"));
        state.results.insert("unrelated".into(), json!(1));

        let end = def.node("e").unwrap();
        let out = handler_for(NodeKind::End).run(end, &state, &ctx).await;
        assert_eq!(out.result, Some(json!({"p": "branch output"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_and_without_duration() {
        let sleeping = Node::new("w", NodeKind::Wait).with_config("duration_ms", json!(1500));
        let def = graph(sleeping.clone());
        let ctx = context(&def, CapabilityRegistry::new());
        let state = state_with(json!({}));

        let out = handler_for(NodeKind::Wait).run(&sleeping, &state, &ctx).await;
        assert!(!out.pause);
        assert_eq!(out.result, Some(json!({"waited_ms": 1500})));

        let pausing = Node::new("w", NodeKind::Wait);
        let out = handler_for(NodeKind::Wait).run(&pausing, &state, &ctx).await;
        assert!(out.pause);
    }
}
