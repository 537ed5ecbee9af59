use std::collections::HashMap;

use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{ConditionEvaluator, ConditionScope};
use trellis_core::types::{GraphDefinition, Node, NodeKind};

/// An outgoing edge, resolved for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub edge_id: String,
    pub target: String,
    /// `None` for unconditional edges.
    pub condition: Option<String>,
    /// Belongs to the false branch of a condition node.
    pub else_branch: bool,
}

/// Targets selected when leaving a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    pub targets: Vec<String>,
    /// Condition evaluation failures. The offending edges were not taken.
    pub errors: Vec<String>,
    /// No edge matched and the fallback END was chosen.
    pub fell_back: bool,
}

/// Executable form of a graph definition.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    graph_id: String,
    nodes: HashMap<String, Node>,
    /// Node ids in declaration order.
    order: Vec<String>,
    transitions: HashMap<String, Vec<Transition>>,
    predecessors: HashMap<String, Vec<String>>,
    entry: String,
    fallback_end: String,
}

/// Compile a definition. Re-checks the structural invariants first.
pub fn compile(definition: &GraphDefinition) -> Result<CompiledGraph> {
    definition.validate()?;

    let entry = definition
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.clone())
        .ok_or_else(|| TrellisError::NoEntryPoint(definition.id.clone()))?;

    let fallback_end = definition
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::End)
        .map(|n| n.id.clone())
        .ok_or_else(|| TrellisError::NoEntryPoint(definition.id.clone()))?;

    let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &definition.edges {
        transitions
            .entry(edge.source.clone())
            .or_default()
            .push(Transition {
                edge_id: edge.id.clone(),
                target: edge.target.clone(),
                condition: edge.condition.clone(),
                else_branch: edge.is_else_branch(),
            });
        let preds = predecessors.entry(edge.target.clone()).or_default();
        if !preds.contains(&edge.source) {
            preds.push(edge.source.clone());
        }
    }

    debug!(
        graph_id = %definition.id,
        nodes = definition.nodes.len(),
        edges = definition.edges.len(),
        entry = %entry,
        "Compiled graph"
    );

    Ok(CompiledGraph {
        graph_id: definition.id.clone(),
        nodes: definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect(),
        order: definition.nodes.iter().map(|n| n.id.clone()).collect(),
        transitions,
        predecessors,
        entry,
        fallback_end,
    })
}

impl CompiledGraph {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// The first START node declared.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// The first END node declared. Target of forced and unmatched routing.
    pub fn fallback_end(&self) -> &str {
        &self.fallback_end
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn transitions(&self, id: &str) -> &[Transition] {
        self.transitions.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct sources of edges into `id`, in edge declaration order.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Select the successors of `id`.
    ///
    /// `branch` is the outcome of a condition node: `Some(true)` keeps only
    /// edges outside the else branch, `Some(false)` only else-branch edges.
    /// Unconditional edges are always taken; conditional edges are taken when
    /// their expression holds. END nodes have no successors. A node with
    /// outgoing edges none of which is taken routes to the fallback END.
    pub fn route(
        &self,
        id: &str,
        branch: Option<bool>,
        scope: &ConditionScope<'_>,
        evaluator: &dyn ConditionEvaluator,
    ) -> Route {
        let mut route = Route::default();
        if self.node(id).map(|n| n.kind) == Some(NodeKind::End) {
            return route;
        }

        let transitions = self.transitions(id);
        if transitions.is_empty() {
            return route;
        }

        for t in transitions {
            if branch == Some(t.else_branch) {
                continue;
            }
            let taken = match &t.condition {
                None => true,
                Some(expr) => match evaluator.evaluate(expr, scope) {
                    Ok(holds) => holds,
                    Err(e) => {
                        route
                            .errors
                            .push(format!("Edge {} condition failed: {}", t.edge_id, e));
                        false
                    }
                },
            };
            if taken && !route.targets.contains(&t.target) {
                route.targets.push(t.target.clone());
            }
        }

        if route.targets.is_empty() {
            route.targets.push(self.fallback_end.clone());
            route.fell_back = true;
        }
        route
    }
}
