use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use trellis_core::error::CapabilityError;
use trellis_core::traits::Capability;
use trellis_core::types::{CapabilityKind, InvocationContext};

/// Summary of a registered capability.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub required_permissions: Vec<String>,
}

/// Registry of invocable capabilities.
///
/// Shared across runs as `Arc<tokio::sync::RwLock<CapabilityRegistry>>`:
/// invocations take the read lock only long enough to clone the capability
/// out, register/unregister take the write lock.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    default_timeout_secs: u64,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
            default_timeout_secs: 30,
        }
    }

    /// Set the timeout used by capabilities that do not declare one.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// The timeout applied to capabilities that do not declare one.
    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs
    }

    /// Register a capability. Replaces any capability with the same name.
    pub fn register(&mut self, capability: impl Capability) {
        self.register_arc(Arc::new(capability));
    }

    /// Register an already shared capability.
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if self.capabilities.insert(name.clone(), capability).is_some() {
            debug!(capability = %name, "Replaced registered capability");
        }
    }

    /// Unregister a capability by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.capabilities.remove(name).is_some()
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// List all registered capabilities, sorted by name.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .capabilities
            .values()
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                description: c.description().to_string(),
                kind: c.kind(),
                required_permissions: c.required_permissions(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Invoke a capability by name.
    ///
    /// Checks that `permissions` holds every permission the capability
    /// requires, validates parameters, then runs it under its timeout.
    pub async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
        permissions: &[String],
        ctx: InvocationContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        let capability = self
            .get(name)
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        invoke_capability(capability, params, permissions, ctx, self.default_timeout_secs).await
    }

    /// Create a registry with the built-in capabilities registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::echo::EchoTool);
        registry
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the permission, validation and timeout checks around one invocation.
///
/// Split from [`CapabilityRegistry::invoke`] so callers can resolve the
/// capability under a lock and invoke it after releasing the lock.
pub async fn invoke_capability(
    capability: Arc<dyn Capability>,
    params: serde_json::Value,
    permissions: &[String],
    ctx: InvocationContext,
    default_timeout_secs: u64,
) -> Result<serde_json::Value, CapabilityError> {
    let name = capability.name().to_string();

    let missing: Vec<String> = capability
        .required_permissions()
        .into_iter()
        .filter(|p| !permissions.contains(p))
        .collect();
    if !missing.is_empty() {
        warn!(capability = %name, ?missing, "Capability invocation denied");
        return Err(CapabilityError::PermissionDenied {
            capability: name,
            missing,
        });
    }

    capability
        .validate(&params)
        .map_err(|message| CapabilityError::InvalidParameters {
            capability: name.clone(),
            message,
        })?;

    let timeout_secs = capability.timeout_secs().unwrap_or(default_timeout_secs);
    let timeout = Duration::from_secs(timeout_secs);

    debug!(capability = %name, node_id = %ctx.node_id, "Invoking capability");
    match tokio::time::timeout(timeout, capability.invoke(params, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout {
            capability: name,
            timeout_secs,
        }),
    }
}
