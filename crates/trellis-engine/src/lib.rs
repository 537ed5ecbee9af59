pub mod agent_loop;
pub mod book;
pub mod graph;
pub mod orchestrator;
pub mod reflect;
pub mod runner;

pub use agent_loop::{AgentLoop, MAX_ITERATIONS_MESSAGE};
pub use book::ExecutionBook;
pub use graph::{compile, CompiledGraph, ExpressionEvaluator, NodeOutput, Transition};
pub use orchestrator::{EngineBuilder, ExecutionHandle, WorkflowEngine};
pub use reflect::PhraseDetector;
pub use runner::Runner;
