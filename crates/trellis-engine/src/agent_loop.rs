use serde_json::{json, Value};
use tracing::{debug, info, warn};

use trellis_core::types::{Node, Variables};
use trellis_core::{AgentPhase, AgentReply, AgentRequest, ExecutionState, ToolCall};

use crate::graph::{HandlerContext, NodeOutput};

/// Result recorded when an agent runs out of iterations.
pub const MAX_ITERATIONS_MESSAGE: &str = "Maximum iterations reached. Task may be incomplete.";

/// The plan / execute / reflect loop behind an agent node.
///
/// Each phase is one invocation of the agent capability. The decision point
/// after EXECUTE finishes the loop when a result is present, when the
/// iteration ceiling is reached, or when the agent reported an error;
/// otherwise REFLECT runs and the loop returns to PLAN.
pub struct AgentLoop<'a> {
    node: &'a Node,
    state: &'a ExecutionState,
    ctx: &'a HandlerContext,
    agent_id: String,
    task: String,
    max_iterations: u32,
    /// Tool allow-list. Empty allows every registered tool.
    tools: Vec<String>,
}

/// Working memory of one loop.
#[derive(Default)]
struct Progress {
    context: Variables,
    transcript: Vec<String>,
    iterations: u32,
    result: Option<Value>,
    error: Option<String>,
    last_message: Option<String>,
    max_reached: bool,
}

impl Progress {
    fn record(&mut self, reply: AgentReply) {
        if !reply.message.is_empty() {
            self.transcript.push(reply.message.clone());
            self.last_message = Some(reply.message);
        }
        if self.result.is_none() {
            self.result = reply.result;
        }
        if let Some(error) = reply.error {
            self.error = Some(error);
        }
    }
}

impl<'a> AgentLoop<'a> {
    /// Read the loop settings from the node config. Fails without `agent_id`.
    pub fn from_node(
        node: &'a Node,
        state: &'a ExecutionState,
        ctx: &'a HandlerContext,
    ) -> Result<Self, String> {
        let agent_id = node
            .config_str("agent_id")
            .ok_or_else(|| format!("Agent node {} has no agent_id", node.id))?
            .to_string();
        let task = node.config_str("task").unwrap_or(&node.name).to_string();
        let max_iterations = node
            .config_u64("max_iterations")
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(state.max_iterations);

        Ok(Self {
            node,
            state,
            ctx,
            agent_id,
            task,
            max_iterations,
            tools: node.config_list("tools"),
        })
    }

    pub async fn run(self) -> NodeOutput {
        info!(
            node_id = %self.node.id,
            agent = %self.agent_id,
            max_iterations = self.max_iterations,
            "Agent loop started"
        );

        let mut progress = Progress {
            context: self.state.variables.clone(),
            ..Progress::default()
        };

        loop {
            // PLAN
            match self.ask(AgentPhase::Plan, &progress).await {
                Ok(reply) => {
                    progress
                        .context
                        .insert("plan".to_string(), Value::String(reply.message.clone()));
                    progress.record(reply);
                }
                Err(e) => {
                    progress.error = Some(e);
                    break;
                }
            }

            // EXECUTE
            match self.ask(AgentPhase::Execute, &progress).await {
                Ok(reply) => {
                    self.run_tools(&reply.tool_calls, &mut progress).await;
                    progress.record(reply);
                    progress.iterations += 1;
                }
                Err(e) => {
                    progress.error = Some(e);
                    break;
                }
            }

            // Decide
            if progress.result.is_some() {
                break;
            }
            if progress.iterations >= self.max_iterations {
                warn!(
                    node_id = %self.node.id,
                    iterations = progress.iterations,
                    "Agent reached its iteration ceiling"
                );
                progress.result = Some(Value::String(MAX_ITERATIONS_MESSAGE.to_string()));
                progress.max_reached = true;
                break;
            }
            if progress.error.is_some() {
                break;
            }

            // REFLECT
            match self.ask(AgentPhase::Reflect, &progress).await {
                Ok(reply) => {
                    if progress.result.is_none() && self.ctx.detector.is_complete(&reply.message) {
                        progress.result = Some(Value::String(reply.message.clone()));
                    }
                    progress.record(reply);
                }
                Err(e) => {
                    progress.error = Some(e);
                    break;
                }
            }
        }

        self.finish(progress)
    }

    fn finish(&self, progress: Progress) -> NodeOutput {
        let result = progress
            .result
            .or_else(|| progress.last_message.map(Value::String))
            .unwrap_or(Value::Null);

        let mut summary = json!({
            "result": result,
            "iterations": progress.iterations,
            "max_iterations_reached": progress.max_reached,
        });

        let mut output = NodeOutput {
            iterations: progress.iterations,
            ..NodeOutput::default()
        };
        if let Some(error) = progress.error {
            warn!(node_id = %self.node.id, error = %error, "Agent loop ended with an error");
            summary["error"] = Value::String(error.clone());
            output.errors.push(format!("Node {}: {}", self.node.id, error));
        }
        if let Some(var) = self.node.config_str("output") {
            output.variables.insert(var.to_string(), result);
        }

        info!(
            node_id = %self.node.id,
            iterations = progress.iterations,
            "Agent loop finished"
        );
        output.result = Some(summary);
        output
    }

    async fn ask(&self, phase: AgentPhase, progress: &Progress) -> Result<AgentReply, String> {
        let request = AgentRequest {
            phase,
            task: self.task.clone(),
            iteration: progress.iterations,
            max_iterations: self.max_iterations,
            context: progress.context.clone(),
            transcript: progress.transcript.clone(),
            tools: self.tools.clone(),
        };
        let params = serde_json::to_value(&request).map_err(|e| e.to_string())?;

        debug!(node_id = %self.node.id, ?phase, iteration = progress.iterations, "Agent phase");
        self.ctx
            .invoke(&self.agent_id, params, self.state, &self.node.id)
            .await
            .map(AgentReply::from_value)
            .map_err(|e| e.to_string())
    }

    /// Run requested tools in order, merging each outcome into the context
    /// under `tool_<name>_result` or `tool_<name>_error`.
    async fn run_tools(&self, calls: &[ToolCall], progress: &mut Progress) {
        for call in calls {
            let outcome = if self.tools.is_empty() || self.tools.contains(&call.name) {
                self.ctx
                    .invoke(&call.name, call.arguments.clone(), self.state, &self.node.id)
                    .await
                    .map_err(|e| e.to_string())
            } else {
                Err(format!(
                    "Tool {} is not available to agent node {}",
                    call.name, self.node.id
                ))
            };

            match outcome {
                Ok(value) => {
                    progress
                        .context
                        .insert(format!("tool_{}_result", call.name), value);
                }
                Err(e) => {
                    debug!(node_id = %self.node.id, tool = %call.name, error = %e, "Agent tool call failed");
                    progress
                        .context
                        .insert(format!("tool_{}_error", call.name), Value::String(e));
                }
            }
        }
    }
}
