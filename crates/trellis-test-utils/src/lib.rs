//! Mocks and fixtures shared by the Trellis crates' tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use trellis_core::error::{CapabilityError, TrellisError};
use trellis_core::traits::{Capability, CheckpointStore};
use trellis_core::types::{CapabilityKind, InvocationContext};
use trellis_core::{AgentPhase, AgentReply, AgentRequest, ExecutionState};

/// A tool that returns a fixed value and records the parameters it saw.
pub struct MockTool {
    name: String,
    output: std::result::Result<Value, CapabilityError>,
    permissions: Vec<String>,
    require_object: bool,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl MockTool {
    pub fn returning(name: &str, output: Value) -> Self {
        Self {
            name: name.to_string(),
            output: Ok(output),
            permissions: vec![],
            require_object: false,
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// A tool whose every invocation fails with `message`.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            output: Err(CapabilityError::ExecutionFailed(message.to_string())),
            ..Self::returning(name, Value::Null)
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Reject parameters that are not JSON objects.
    pub fn requiring_object(mut self) -> Self {
        self.require_object = true;
        self
    }

    /// Shared handle to the recorded parameters.
    pub fn calls(&self) -> Arc<Mutex<Vec<Value>>> {
        self.calls.clone()
    }
}

impl Capability for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Mock tool"
    }

    fn required_permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }

    fn validate(&self, params: &Value) -> std::result::Result<(), String> {
        if self.require_object && !params.is_object() {
            return Err("expected an object".to_string());
        }
        Ok(())
    }

    fn invoke(
        &self,
        params: Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(params);
            self.output.clone()
        })
    }
}

/// A tool that sleeps before answering. Pair with paused tokio time.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl Capability for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then returns its parameters"
    }

    fn invoke(
        &self,
        params: Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(params)
        })
    }
}

/// A tool whose invocation panics.
pub struct PanickingTool {
    name: String,
}

impl PanickingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Capability for PanickingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Panics when invoked"
    }

    fn invoke(
        &self,
        _params: Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move { panic!("{} exploded", self.name) })
    }
}

/// An agent that answers each phase from a script.
///
/// Replies per phase are consumed in order; once a phase's script runs out
/// its last reply repeats. Phases without a script answer with an empty reply.
pub struct ScriptedAgent {
    name: String,
    scripts: HashMap<&'static str, Vec<AgentReply>>,
    invocations: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
    fail_with: Option<String>,
}

fn phase_key(phase: AgentPhase) -> &'static str {
    match phase {
        AgentPhase::Plan => "plan",
        AgentPhase::Execute => "execute",
        AgentPhase::Reflect => "reflect",
    }
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: HashMap::new(),
            invocations: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(vec![])),
            fail_with: None,
        }
    }

    /// An agent that finishes on its first execute phase with `result`.
    pub fn finishing_with(name: &str, result: Value) -> Self {
        Self::new(name)
            .on(AgentPhase::Plan, AgentReply::message("plan"))
            .on(AgentPhase::Execute, AgentReply::message("done").with_result(result))
    }

    /// An agent that never produces a result nor signals completion.
    pub fn never_finishing(name: &str) -> Self {
        Self::new(name)
            .on(AgentPhase::Plan, AgentReply::message("plan"))
            .on(AgentPhase::Execute, AgentReply::message("still working"))
            .on(AgentPhase::Reflect, AgentReply::message("more to do"))
    }

    /// An agent whose every invocation fails.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(name)
        }
    }

    /// Append a reply to the script for `phase`.
    pub fn on(mut self, phase: AgentPhase, reply: AgentReply) -> Self {
        self.scripts.entry(phase_key(phase)).or_default().push(reply);
        self
    }

    pub fn invocations(&self) -> Arc<AtomicUsize> {
        self.invocations.clone()
    }

    /// Shared handle to every request received, in order.
    pub fn requests(&self) -> Arc<Mutex<Vec<AgentRequest>>> {
        self.requests.clone()
    }

    fn reply_for(&self, request: &AgentRequest) -> AgentReply {
        let key = phase_key(request.phase);
        let seen = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.phase == request.phase)
            .count();
        match self.scripts.get(key) {
            Some(script) if !script.is_empty() => {
                let idx = seen.saturating_sub(1).min(script.len() - 1);
                script[idx].clone()
            }
            _ => AgentReply::default(),
        }
    }
}

impl Capability for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted agent"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Agent
    }

    fn invoke(
        &self,
        params: Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_with {
                return Err(CapabilityError::ExecutionFailed(message.clone()));
            }
            let request: AgentRequest = serde_json::from_value(params)
                .map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.reply_for(&request);
            serde_json::to_value(reply).map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))
        })
    }
}

/// An agent that signals `entered` when invoked, then blocks until released.
pub struct BlockingAgent {
    name: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl BlockingAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    /// Notified once the agent has been invoked.
    pub fn entered(&self) -> Arc<Notify> {
        self.entered.clone()
    }

    /// Notify to let a blocked invocation finish.
    pub fn release(&self) -> Arc<Notify> {
        self.release.clone()
    }
}

impl Capability for BlockingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Blocks until released"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Agent
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(3600)
    }

    fn invoke(
        &self,
        _params: Value,
        _ctx: InvocationContext,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            serde_json::to_value(AgentReply::message("released").with_result(Value::from("released")))
                .map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))
        })
    }
}

/// In-memory checkpoint store that records every save.
#[derive(Default)]
pub struct CountingCheckpointStore {
    snapshots: Mutex<HashMap<String, ExecutionState>>,
    saves: Mutex<Vec<(String, DateTime<Utc>, ExecutionState)>>,
    fail_saves: bool,
}

impl CountingCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose saves always fail.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Number of saves for `execution_id`.
    pub fn save_count(&self, execution_id: &str) -> usize {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == execution_id)
            .count()
    }

    /// Save timestamps for `execution_id`, in save order.
    pub fn save_times(&self, execution_id: &str) -> Vec<DateTime<Utc>> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == execution_id)
            .map(|(_, at, _)| *at)
            .collect()
    }

    /// Every snapshot saved for `execution_id`, oldest first.
    pub fn history(&self, execution_id: &str) -> Vec<ExecutionState> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == execution_id)
            .map(|(_, _, state)| state.clone())
            .collect()
    }
}

impl CheckpointStore for CountingCheckpointStore {
    fn save(&self, execution_id: &str, state: &ExecutionState) -> trellis_core::Result<()> {
        if self.fail_saves {
            return Err(TrellisError::Database("disk full".to_string()));
        }
        self.saves
            .lock()
            .unwrap()
            .push((execution_id.to_string(), Utc::now(), state.clone()));
        self.snapshots
            .lock()
            .unwrap()
            .insert(execution_id.to_string(), state.clone());
        Ok(())
    }

    fn load(&self, execution_id: &str) -> trellis_core::Result<ExecutionState> {
        self.snapshots
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| TrellisError::CheckpointNotFound(execution_id.to_string()))
    }

    fn delete(&self, execution_id: &str) -> trellis_core::Result<bool> {
        Ok(self.snapshots.lock().unwrap().remove(execution_id).is_some())
    }

    fn list(&self) -> trellis_core::Result<Vec<String>> {
        let mut ids: Vec<String> = self.snapshots.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// A fresh temp directory for SQLite-backed tests.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}
