//! Workflow compilation - run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//! 3. The directed graph must be acyclic (topological sort must succeed).
//! 4. Every node type must be registered in the node catalog.
//!
//! On success the definition is turned into an immutable [`CompiledPlan`].
//! Compilation is a pure function of the definition and the catalog, so the
//! same definition always yields the same step order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nodes::NodeCatalog;
use tracing::{debug, instrument};

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::CompileError;
use crate::models::{CompiledPlan, PlanStep, Upstream, WorkflowDefinition};

/// Validate the workflow's DAG and return node IDs in topological order.
///
/// Ready nodes are peeled by (original in-degree, node id) ascending, which
/// makes the order deterministic.
///
/// # Errors
/// - [`CompileError::DuplicateNode`] if two nodes share an ID.
/// - [`CompileError::UnknownNodeReference`] if an edge references a missing node.
/// - [`CompileError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(workflow: &WorkflowDefinition) -> Result<Vec<String>, CompileError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut node_set: HashSet<&str> = HashSet::with_capacity(workflow.nodes.len());
    for node in &workflow.nodes {
        if !node_set.insert(node.id.as_str()) {
            return Err(CompileError::DuplicateNode(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &workflow.edges {
        if !node_set.contains(edge.from.as_str()) {
            return Err(CompileError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !node_set.contains(edge.to.as_str()) {
            return Err(CompileError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // Parallel edges between the same pair of nodes count once.
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

    for node in &workflow.nodes {
        adjacency.entry(node.id.as_str()).or_default();
        predecessors.entry(node.id.as_str()).or_default();
        in_degree.entry(node.id.as_str()).or_insert(0);
    }

    for edge in &workflow.edges {
        let (from, to) = (edge.from.as_str(), edge.to.as_str());
        if !seen_edges.insert((from, to)) {
            continue;
        }
        adjacency.entry(from).or_default().push(to);
        predecessors.entry(to).or_default().push(from);
        *in_degree.entry(to).or_insert(0) += 1;
    }

    let initial_degree = in_degree.clone();

    // Seed the heap with nodes that have no incoming edges.
    let mut ready: BinaryHeap<Reverse<(usize, &str)>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| Reverse((0, id)))
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(workflow.nodes.len());

    while let Some(Reverse((_, node_id))) = ready.pop() {
        sorted.push(node_id.to_owned());

        if let Some(neighbours) = adjacency.get(node_id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse((initial_degree[neighbour], neighbour)));
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != workflow.nodes.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(CompileError::CycleDetected {
            cycle: find_cycle(&remaining, &predecessors),
        });
    }

    Ok(sorted)
}

/// Extract one closed cycle (`a -> b -> a`) from the nodes Kahn's algorithm
/// could not peel, starting at the smallest node id on it.
///
/// Every such node still has a predecessor among them, so walking
/// predecessors from any of them must revisit a node.
fn find_cycle(remaining: &BTreeSet<&str>, predecessors: &HashMap<&str, Vec<&str>>) -> Vec<String> {
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;

    let open: Vec<&str> = loop {
        if let Some(&pos) = position.get(current) {
            // path[pos..] was walked against edge direction.
            break path[pos..].iter().rev().copied().collect();
        }
        position.insert(current, path.len());
        path.push(current);

        let next = predecessors
            .get(current)
            .and_then(|preds| preds.iter().filter(|p| remaining.contains(*p)).min().copied());
        match next {
            Some(pred) => current = pred,
            None => break path.iter().rev().copied().collect(),
        }
    };

    let pivot = open
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut cycle: Vec<String> = open[pivot..]
        .iter()
        .chain(open[..pivot].iter())
        .map(|s| s.to_string())
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

/// Fallbacks applied when neither a node nor its workflow sets a policy.
#[derive(Debug, Clone)]
struct PlanDefaults {
    max_concurrency: usize,
    step_timeout: Duration,
    retry: RetryPolicy,
}

/// Turns [`WorkflowDefinition`]s into [`CompiledPlan`]s.
#[derive(Debug, Clone)]
pub struct WorkflowCompiler {
    catalog: Arc<NodeCatalog>,
    defaults: PlanDefaults,
}

impl WorkflowCompiler {
    pub fn new(catalog: Arc<NodeCatalog>, config: &EngineConfig) -> Self {
        Self {
            catalog,
            defaults: PlanDefaults {
                max_concurrency: config.default_max_concurrency.max(1),
                step_timeout: config.default_step_timeout(),
                retry: config.default_retry,
            },
        }
    }

    pub fn catalog(&self) -> &NodeCatalog {
        &self.catalog
    }

    /// Validate `definition` and build its execution plan.
    #[instrument(skip_all, fields(workflow_id = %definition.id, version = definition.version))]
    pub fn compile(&self, definition: &WorkflowDefinition) -> Result<CompiledPlan, CompileError> {
        let order = validate_dag(definition)?;

        // -------------------------------------------------------------------
        // 4. Every node type must be known
        // -------------------------------------------------------------------
        for node in &definition.nodes {
            if !self.catalog.contains(&node.node_type) {
                return Err(CompileError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let specs: HashMap<&str, _> = definition
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();

        let settings = &definition.settings;
        let workflow_retry = settings.default_retry.unwrap_or(self.defaults.retry);
        let workflow_timeout = settings
            .default_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.defaults.step_timeout);

        let mut steps: Vec<PlanStep> = order
            .iter()
            .enumerate()
            .map(|(index, node_id)| {
                let spec = specs[node_id.as_str()];
                PlanStep {
                    index,
                    node_id: node_id.clone(),
                    node_type: spec.node_type.clone(),
                    parameters: spec.parameters.clone(),
                    upstream: Vec::new(),
                    downstream: Vec::new(),
                    retry: spec.retry.unwrap_or(workflow_retry),
                    timeout: spec.timeout_ms.map(Duration::from_millis).unwrap_or(workflow_timeout),
                    tolerant: spec.tolerant,
                }
            })
            .collect();

        for edge in &definition.edges {
            let from = position[edge.from.as_str()];
            let to = position[edge.to.as_str()];
            // The first edge between a pair decides the output slot.
            if steps[to].upstream.iter().any(|u| u.index == from) {
                continue;
            }
            steps[to].upstream.push(Upstream {
                node_id: edge.from.clone(),
                index: from,
                output_slot: edge.output_slot.clone(),
            });
            steps[from].downstream.push(to);
        }

        for step in &mut steps {
            step.upstream.sort_by_key(|u| u.index);
            step.downstream.sort_unstable();
        }

        let entry_nodes = steps
            .iter()
            .filter(|s| s.upstream.is_empty())
            .map(|s| s.node_id.clone())
            .collect();

        let plan = CompiledPlan {
            workflow_id: definition.id,
            version: definition.version,
            steps,
            entry_nodes,
            max_concurrency: settings
                .max_concurrency
                .unwrap_or(self.defaults.max_concurrency)
                .max(1),
        };

        debug!(order = ?plan.step_order(), "workflow compiled");
        Ok(plan)
    }
}
