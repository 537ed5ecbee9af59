use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use trellis_core::config::AppConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::{Capability, CheckpointStore, CompletionDetector, ConditionEvaluator};
use trellis_core::types::{Edge, GraphDefinition, Node, Variables};
use trellis_core::{EngineEvent, ExecutionRecord, ExecutionState, ExecutionStatus};
use trellis_store::{open_store, MemoryCheckpointStore};
use trellis_tools::{CapabilityInfo, CapabilityRegistry};

use crate::book::ExecutionBook;
use crate::graph::{compile, CompiledGraph, ExpressionEvaluator};
use crate::reflect::PhraseDetector;
use crate::runner::Runner;

/// A run in flight.
pub struct ExecutionHandle {
    execution_id: String,
    cancel: CancellationToken,
    join: JoinHandle<ExecutionRecord>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Request cancellation. The in-flight step is abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to stop and return its record.
    pub async fn wait(self) -> Result<ExecutionRecord> {
        self.join
            .await
            .map_err(|e| TrellisError::SchedulerFault(format!("Run task failed: {}", e)))
    }
}

struct StoredGraph {
    definition: GraphDefinition,
    compiled: Arc<CompiledGraph>,
}

/// Assembles a [`WorkflowEngine`] from its parts. Anything not supplied
/// falls back to the built-in implementation.
pub struct EngineBuilder {
    config: AppConfig,
    registry: Option<CapabilityRegistry>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    detector: Option<Arc<dyn CompletionDetector>>,
    event_bus: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            checkpoints: None,
            evaluator: None,
            detector: None,
            event_bus: None,
        }
    }

    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn completion_detector(mut self, detector: Arc<dyn CompletionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let timeout = self.config.engine.invocation_timeout_secs;
        let registry = Arc::new(tokio::sync::RwLock::new(
            self.registry
                .unwrap_or_else(CapabilityRegistry::with_builtins)
                .with_default_timeout(timeout),
        ));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(ExpressionEvaluator));
        let detector = self
            .detector
            .unwrap_or_else(|| Arc::new(PhraseDetector::from_config(&self.config.reflect)));
        let event_bus = self.event_bus.unwrap_or_default();
        let book = Arc::new(ExecutionBook::new());

        let runner = Arc::new(Runner::new(
            registry.clone(),
            evaluator,
            detector,
            checkpoints.clone(),
            book.clone(),
            event_bus.clone(),
            self.config.engine.clone(),
        ));

        WorkflowEngine {
            config: self.config,
            graphs: RwLock::new(HashMap::new()),
            registry,
            runner,
            book,
            running: Arc::new(Mutex::new(HashMap::new())),
            checkpoints,
            event_bus,
        }
    }
}

/// Public facade: graph store, capability registry, runs and their records.
pub struct WorkflowEngine {
    config: AppConfig,
    graphs: RwLock<HashMap<String, StoredGraph>>,
    registry: Arc<tokio::sync::RwLock<CapabilityRegistry>>,
    runner: Arc<Runner>,
    book: Arc<ExecutionBook>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    checkpoints: Arc<dyn CheckpointStore>,
    event_bus: Arc<EventBus>,
}

impl WorkflowEngine {
    /// An engine with default config and in-memory checkpoints.
    pub fn new() -> Self {
        EngineBuilder::new(AppConfig::default()).build()
    }

    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// An engine whose checkpoint backend is chosen by `config`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = open_store(&config.checkpoint)?;
        Ok(EngineBuilder::new(config).checkpoint_store(store).build())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // -- Graphs --

    /// Validate and store a new graph under a fresh id.
    pub fn create_graph(
        &self,
        name: &str,
        description: &str,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Result<GraphDefinition> {
        let definition = GraphDefinition::build(name, description, nodes, edges)?;
        self.store_graph(definition)
    }

    /// Store a complete definition (e.g. loaded from a file). Keeps its id
    /// when set, replacing any graph with the same id; otherwise assigns one.
    pub fn create_graph_from(&self, mut definition: GraphDefinition) -> Result<GraphDefinition> {
        if definition.id.is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        self.store_graph(definition)
    }

    fn store_graph(&self, definition: GraphDefinition) -> Result<GraphDefinition> {
        let compiled = Arc::new(compile(&definition)?);
        info!(
            graph_id = %definition.id,
            name = %definition.name,
            nodes = definition.nodes.len(),
            edges = definition.edges.len(),
            "Graph created"
        );
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        graphs.insert(
            definition.id.clone(),
            StoredGraph {
                definition: definition.clone(),
                compiled,
            },
        );
        Ok(definition)
    }

    pub fn get_graph(&self, graph_id: &str) -> Result<GraphDefinition> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs
            .get(graph_id)
            .map(|g| g.definition.clone())
            .ok_or_else(|| TrellisError::GraphNotFound(graph_id.to_string()))
    }

    /// All stored graphs, oldest first.
    pub fn list_graphs(&self) -> Vec<GraphDefinition> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<GraphDefinition> =
            graphs.values().map(|g| g.definition.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Remove a graph. Records of its past runs are kept.
    pub fn delete_graph(&self, graph_id: &str) -> bool {
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        let removed = graphs.remove(graph_id).is_some();
        if removed {
            info!(graph_id, "Graph deleted");
        }
        removed
    }

    fn lookup(&self, graph_id: &str) -> Result<(Arc<CompiledGraph>, Variables)> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs
            .get(graph_id)
            .map(|g| (g.compiled.clone(), g.definition.variables.clone()))
            .ok_or_else(|| TrellisError::GraphNotFound(graph_id.to_string()))
    }

    // -- Runs --

    /// Run a graph to completion with the default permissions.
    pub async fn execute_graph(
        &self,
        graph_id: &str,
        variables: Variables,
    ) -> Result<ExecutionRecord> {
        self.start_execution(graph_id, variables, None)?.wait().await
    }

    /// Start a run in the background. `variables` overlay the graph's
    /// defaults; `permissions` fall back to `engine.default_permissions`.
    pub fn start_execution(
        &self,
        graph_id: &str,
        variables: Variables,
        permissions: Option<Vec<String>>,
    ) -> Result<ExecutionHandle> {
        let (compiled, mut initial) = self.lookup(graph_id)?;
        initial.extend(variables);

        let state = ExecutionState::new(graph_id, initial, self.config.engine.max_iterations)
            .with_permissions(
                permissions.unwrap_or_else(|| self.config.engine.default_permissions.clone()),
            );
        self.book.insert(ExecutionRecord::running(&state));
        Ok(self.launch(compiled, state))
    }

    /// Run a single agent on `task` using the built-in agent topology.
    pub async fn run_agent(
        &self,
        agent_id: &str,
        task: &str,
        variables: Variables,
    ) -> Result<ExecutionRecord> {
        let definition =
            GraphDefinition::single_agent(agent_id, task, self.config.engine.max_iterations)?;
        let definition = self.store_graph(definition)?;
        self.execute_graph(&definition.id, variables).await
    }

    fn launch(&self, compiled: Arc<CompiledGraph>, state: ExecutionState) -> ExecutionHandle {
        let execution_id = state.execution_id.clone();
        let cancel = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution_id.clone(), cancel.clone());

        let runner = self.runner.clone();
        let running = self.running.clone();
        let book = self.book.clone();
        let event_bus = self.event_bus.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let initial = state.clone();
            let run = tokio::spawn(async move { runner.run(compiled, state, token).await });
            let record = match run.await {
                Ok(record) => record,
                Err(e) => {
                    error!(execution_id = %initial.execution_id, error = %e, "Run task failed");
                    let record = book.fail(&initial, format!("Run task failed: {}", e));
                    event_bus.publish(EngineEvent::RunFinished {
                        execution_id: record.id.clone(),
                        status: record.status,
                    });
                    record
                }
            };
            running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&initial.execution_id);
            record
        });

        ExecutionHandle {
            execution_id,
            cancel,
            join,
        }
    }

    /// Cancel a run in flight, or a paused run so it can no longer be
    /// resumed. Returns false when the run is neither.
    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = running.get(execution_id) {
            info!(execution_id, "Cancelling execution");
            token.cancel();
            return true;
        }
        drop(running);

        if !self.book.cancel_paused(execution_id) {
            return false;
        }
        info!(execution_id, "Cancelled paused execution");
        self.event_bus.publish(EngineEvent::RunFinished {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Cancelled,
        });
        true
    }

    /// Continue a paused or interrupted run from its last checkpoint.
    /// Records that already reached a terminal status are returned as-is.
    pub async fn resume_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let active = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(execution_id);
        if active {
            return Err(TrellisError::SchedulerFault(format!(
                "Execution {} is already running",
                execution_id
            )));
        }
        if let Some(record) = self.book.get(execution_id) {
            if record.status.is_terminal() {
                return Ok(record);
            }
        }

        let state = self.checkpoints.load(execution_id)?;
        let (compiled, _) = self.lookup(&state.graph_id)?;
        info!(execution_id, graph_id = %state.graph_id, step = state.steps, "Resuming execution");
        if self.book.get(execution_id).is_none() {
            self.book.insert(ExecutionRecord::running(&state));
        }
        self.launch(compiled, state).wait().await
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.book
            .get(execution_id)
            .ok_or_else(|| TrellisError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Records, optionally of one graph only, sorted by start time.
    pub fn list_executions(&self, graph_id: Option<&str>) -> Vec<ExecutionRecord> {
        self.book.list(graph_id)
    }

    // -- Capabilities --

    pub async fn register_capability(&self, capability: impl Capability) {
        let name = capability.name().to_string();
        self.registry.write().await.register(capability);
        info!(capability = %name, "Capability registered");
    }

    pub async fn unregister_capability(&self, name: &str) -> bool {
        self.registry.write().await.unregister(name)
    }

    pub async fn list_capabilities(&self) -> Vec<CapabilityInfo> {
        self.registry.read().await.list()
    }

    /// The shared registry, for callers that manage capabilities directly.
    pub fn registry(&self) -> Arc<tokio::sync::RwLock<CapabilityRegistry>> {
        self.registry.clone()
    }

    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoints.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}
