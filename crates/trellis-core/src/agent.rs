//! Wire contract between agent nodes and agent capabilities.
//!
//! An agent node drives its capability through the plan / execute / reflect
//! phases by invoking it once per phase with an [`AgentRequest`] as parameters
//! and reading an [`AgentReply`] back.

use serde::{Deserialize, Serialize};

use crate::types::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Plan,
    Execute,
    Reflect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub phase: AgentPhase,
    pub task: String,
    /// Completed iterations so far.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Working context: run variables plus the plan and tool outputs.
    pub context: Variables,
    /// Messages produced by earlier phases, oldest first.
    pub transcript: Vec<String>,
    /// Tools the agent may call. Empty means any registered tool.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A tool call requested by the agent during the execute phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Final answer. Presence ends the loop at the next decision point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Agent-reported failure. Presence ends the loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentReply {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        self.tool_calls.push(ToolCall {
            name: name.into(),
            arguments,
        });
        self
    }

    /// Interpret a capability's raw output. Strings become the message; objects
    /// are decoded as a reply; anything else is stringified into the message.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Self::message(text),
            serde_json::Value::Object(_) => match serde_json::from_value::<Self>(value.clone()) {
                Ok(reply) => reply,
                Err(_) => Self::message(value.to_string()),
            },
            serde_json::Value::Null => Self::default(),
            other => Self::message(other.to_string()),
        }
    }
}
