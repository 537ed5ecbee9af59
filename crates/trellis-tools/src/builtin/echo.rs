use futures::future::BoxFuture;

use trellis_core::error::CapabilityError;
use trellis_core::traits::Capability;
use trellis_core::types::InvocationContext;

/// Returns its parameters unchanged. Useful for wiring and smoke-testing graphs.
pub struct EchoTool;

impl Capability for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given parameters unchanged."
    }

    fn invoke(
        &self,
        params: serde_json::Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<serde_json::Value, CapabilityError>> {
        Box::pin(async move { Ok(params) })
    }
}
