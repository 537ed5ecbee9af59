pub mod builtin;
pub mod registry;

pub use registry::{invoke_capability, CapabilityInfo, CapabilityRegistry};
