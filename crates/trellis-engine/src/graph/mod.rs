//! Workflow graphs at run time.
//!
//! A [`GraphDefinition`](trellis_core::GraphDefinition) is compiled once into a
//! [`CompiledGraph`]: per-node transitions in declaration order, predecessor
//! lists, the entry START and the fallback END. Compiled graphs are immutable
//! and shared by every run of the definition.
//!
//! Each node kind maps to one [`NodeHandler`](handler::NodeHandler) in a fixed
//! dispatch table. Handlers read the execution state and return a
//! [`NodeOutput`] delta that the runner merges.

pub mod compiler;
pub mod condition;
pub mod handler;

pub use compiler::{compile, CompiledGraph, Route, Transition};
pub use condition::ExpressionEvaluator;
pub use handler::{handler_for, HandlerContext, NodeHandler, NodeOutput};
