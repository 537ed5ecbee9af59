use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::config::EngineConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::{CheckpointStore, CompletionDetector, ConditionEvaluator, ConditionScope};
use trellis_core::types::{Node, NodeKind, Variables};
use trellis_core::{EngineEvent, ExecutionRecord, ExecutionState, ExecutionStatus};
use trellis_tools::CapabilityRegistry;

use crate::book::ExecutionBook;
use crate::graph::{handler_for, CompiledGraph, HandlerContext, NodeOutput};

const MAX_TIME_REACHED: &str = "maximum execution time reached";
const MAX_STEPS_REACHED: &str = "maximum steps reached";

/// How a run loop stopped.
enum Stop {
    Completed,
    Paused,
    Cancelled,
    Failed(String),
}

/// Outcome of one scheduler step.
enum StepOutcome {
    Done(Vec<(String, NodeOutput)>),
    Fault(TrellisError),
    TimedOut,
    Cancelled,
}

/// Drives runs of compiled graphs, one step at a time.
///
/// A step executes every node in the frontier (concurrently when there are
/// several), merges their outputs in frontier order, routes to the next
/// frontier and checkpoints. The run owns its [`ExecutionState`]; nothing
/// else mutates it.
pub struct Runner {
    registry: Arc<tokio::sync::RwLock<CapabilityRegistry>>,
    evaluator: Arc<dyn ConditionEvaluator>,
    detector: Arc<dyn CompletionDetector>,
    checkpoints: Arc<dyn CheckpointStore>,
    book: Arc<ExecutionBook>,
    event_bus: Arc<EventBus>,
    limits: EngineConfig,
}

impl Runner {
    pub fn new(
        registry: Arc<tokio::sync::RwLock<CapabilityRegistry>>,
        evaluator: Arc<dyn ConditionEvaluator>,
        detector: Arc<dyn CompletionDetector>,
        checkpoints: Arc<dyn CheckpointStore>,
        book: Arc<ExecutionBook>,
        event_bus: Arc<EventBus>,
        limits: EngineConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            detector,
            checkpoints,
            book,
            event_bus,
            limits,
        }
    }

    /// Run `state` on `graph` until it completes, pauses, fails or is cancelled.
    ///
    /// A fresh state starts at the entry node; a restored one continues from
    /// its pending frontier.
    pub async fn run(
        &self,
        graph: Arc<CompiledGraph>,
        mut state: ExecutionState,
        cancel: CancellationToken,
    ) -> ExecutionRecord {
        let started = Instant::now();
        // Too large to represent means no wall-clock ceiling.
        let deadline = started.checked_add(Duration::from_secs(self.limits.max_duration_secs));
        let ctx = HandlerContext {
            registry: self.registry.clone(),
            evaluator: self.evaluator.clone(),
            detector: self.detector.clone(),
            graph: graph.clone(),
        };

        if state.pending.is_empty() && state.steps == 0 {
            state.pending = vec![graph.entry().to_string()];
        }

        self.book.update(&state, |r| {
            r.status = ExecutionStatus::Running;
            r.completed_at = None;
        });
        self.event_bus.publish(EngineEvent::RunStarted {
            execution_id: state.execution_id.clone(),
            graph_id: state.graph_id.clone(),
        });
        info!(
            execution_id = %state.execution_id,
            graph_id = %state.graph_id,
            pending = ?state.pending,
            "Run started"
        );

        let mut ceiling: Option<String> = None;
        let stop = loop {
            if state.pending.is_empty() {
                break Stop::Completed;
            }

            // Budgets apply until the run is forced toward END.
            if ceiling.is_none() {
                let exceeded = if state.steps >= self.limits.max_steps {
                    Some(MAX_STEPS_REACHED)
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    Some(MAX_TIME_REACHED)
                } else {
                    None
                };
                if let Some(reason) = exceeded {
                    self.force_end(&graph, &mut state, &mut ceiling, reason);
                    continue;
                }
            }

            let frontier = state.pending.clone();
            let step_deadline = if ceiling.is_none() { deadline } else { None };
            let outcome = {
                let step = self.step(&graph, &state, &frontier, &ctx);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => StepOutcome::Cancelled,
                    outcome = within(step_deadline, step) => match outcome {
                        None => StepOutcome::TimedOut,
                        Some(Ok(outputs)) => StepOutcome::Done(outputs),
                        Some(Err(e)) => StepOutcome::Fault(e),
                    },
                }
            };

            let outputs = match outcome {
                StepOutcome::Done(outputs) => outputs,
                StepOutcome::Cancelled => break Stop::Cancelled,
                StepOutcome::Fault(e) => break Stop::Failed(e.to_string()),
                StepOutcome::TimedOut => {
                    self.force_end(&graph, &mut state, &mut ceiling, MAX_TIME_REACHED);
                    continue;
                }
            };

            let pause = self.advance(&graph, &mut state, &frontier, outputs);

            let start_step = frontier
                .iter()
                .all(|id| graph.node(id).map(|n| n.kind) == Some(NodeKind::Start));
            if !start_step {
                if let Err(e) = self.checkpoint(&state) {
                    error!(execution_id = %state.execution_id, error = %e, "Checkpoint failed");
                    break Stop::Failed(format!("Checkpoint write failed: {}", e));
                }
            }

            if pause {
                break Stop::Paused;
            }
        };

        self.finish(&graph, state, stop, ceiling, started)
    }

    /// Execute every frontier node against the same state snapshot.
    async fn step(
        &self,
        graph: &CompiledGraph,
        state: &ExecutionState,
        frontier: &[String],
        ctx: &HandlerContext,
    ) -> Result<Vec<(String, NodeOutput)>> {
        let mut nodes = Vec::with_capacity(frontier.len());
        for id in frontier {
            let node = graph.node(id).ok_or_else(|| {
                TrellisError::SchedulerFault(format!(
                    "Node '{}' not found in graph {}",
                    id,
                    graph.graph_id()
                ))
            })?;
            nodes.push(node);
        }

        let mut runs: Vec<BoxFuture<'_, (String, NodeOutput)>> = Vec::with_capacity(nodes.len());
        for node in nodes {
            runs.push(Box::pin(self.run_node(node, state, ctx)));
        }

        let outputs = futures::stream::iter(runs)
            .buffered(self.limits.max_parallel.max(1))
            .collect::<Vec<_>>()
            .await;

        Ok(outputs)
    }

    async fn run_node(
        &self,
        node: &Node,
        state: &ExecutionState,
        ctx: &HandlerContext,
    ) -> (String, NodeOutput) {
        self.event_bus.publish(EngineEvent::NodeStarted {
            execution_id: state.execution_id.clone(),
            node_id: node.id.clone(),
            kind: node.kind,
        });
        info!(node_id = %node.id, kind = %node.kind, "Executing node");

        let started = Instant::now();
        let output = handler_for(node.kind).run(node, state, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let succeeded = output.errors.is_empty();
        if succeeded {
            debug!(node_id = %node.id, elapsed_ms, "Node finished");
        } else {
            warn!(node_id = %node.id, elapsed_ms, errors = ?output.errors, "Node finished with errors");
        }

        self.event_bus.publish(EngineEvent::NodeFinished {
            execution_id: state.execution_id.clone(),
            node_id: node.id.clone(),
            succeeded,
            elapsed_ms,
        });
        (node.id.clone(), output)
    }

    /// Merge step outputs in frontier order and compute the next frontier.
    /// Returns whether a node asked to pause.
    fn advance(
        &self,
        graph: &CompiledGraph,
        state: &mut ExecutionState,
        frontier: &[String],
        outputs: Vec<(String, NodeOutput)>,
    ) -> bool {
        let mut pause = false;
        let mut branches = Vec::with_capacity(outputs.len());
        for (node_id, output) in outputs {
            if let Some(result) = output.result {
                state.results.insert(node_id.clone(), result);
            }
            state.variables.extend(output.variables);
            state.errors.extend(output.errors);
            state.iterations += output.iterations;
            pause |= output.pause;
            branches.push((node_id, output.branch));
        }
        state.current_node = frontier.last().cloned();

        let mut next: Vec<String> = Vec::new();
        let mut route_errors = Vec::new();
        {
            let scope = ConditionScope::of(state);
            for (node_id, branch) in &branches {
                let route = graph.route(node_id, *branch, &scope, self.evaluator.as_ref());
                if route.fell_back {
                    debug!(node_id = %node_id, "No transition matched, routing to END");
                }
                route_errors.extend(route.errors);
                for target in route.targets {
                    if !next.contains(&target) {
                        next.push(target);
                    }
                }
            }
        }
        state.errors.extend(route_errors);
        state.steps += 1;
        state.pending = next;
        pause
    }

    fn checkpoint(&self, state: &ExecutionState) -> Result<()> {
        self.checkpoints.save(&state.execution_id, state)?;
        self.book.update(state, |_| {});
        self.event_bus.publish(EngineEvent::CheckpointSaved {
            execution_id: state.execution_id.clone(),
            step: state.steps,
        });
        debug!(execution_id = %state.execution_id, step = state.steps, "Checkpoint saved");
        Ok(())
    }

    /// Abandon the remaining frontier and head for the fallback END.
    fn force_end(
        &self,
        graph: &CompiledGraph,
        state: &mut ExecutionState,
        ceiling: &mut Option<String>,
        reason: &str,
    ) {
        warn!(
            execution_id = %state.execution_id,
            steps = state.steps,
            reason,
            "Run budget exceeded, routing to END"
        );
        *ceiling = Some(reason.to_string());
        state.pending = vec![graph.fallback_end().to_string()];
    }

    fn finish(
        &self,
        graph: &CompiledGraph,
        state: ExecutionState,
        stop: Stop,
        ceiling: Option<String>,
        started: Instant,
    ) -> ExecutionRecord {
        let (status, error) = match stop {
            Stop::Completed => (ExecutionStatus::Completed, None),
            Stop::Paused => (ExecutionStatus::Paused, None),
            Stop::Cancelled => (ExecutionStatus::Cancelled, None),
            Stop::Failed(message) => (ExecutionStatus::Failed, Some(message)),
        };

        let mut summary = Variables::new();
        for node in graph.nodes().filter(|n| n.kind == NodeKind::End) {
            if let Some(result) = state.result(&node.id) {
                summary.insert(node.id.clone(), result.clone());
            }
        }

        let record = self.book.update(&state, |r| {
            r.status = status;
            r.completed_at = status.is_terminal().then(Utc::now);
            r.error = error;
            if ceiling.is_some() {
                r.ceiling = ceiling;
            }
            r.summary = summary;
        });

        match status {
            ExecutionStatus::Failed => error!(
                execution_id = %record.id,
                error = record.error.as_deref().unwrap_or_default(),
                "Run failed"
            ),
            _ => info!(
                execution_id = %record.id,
                %status,
                steps = state.steps,
                errors = state.errors.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Run stopped"
            ),
        }

        self.event_bus.publish(EngineEvent::RunFinished {
            execution_id: record.id.clone(),
            status,
        });
        record
    }
}

/// Await `fut`, giving up at `deadline` when one is set.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
