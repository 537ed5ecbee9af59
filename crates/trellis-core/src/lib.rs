pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod traits;
pub mod types;

pub use agent::{AgentPhase, AgentReply, AgentRequest, ToolCall};
pub use config::AppConfig;
pub use error::{CapabilityError, Result, StructuralError, TrellisError};
pub use event::EventBus;
pub use execution::*;
pub use types::*;
