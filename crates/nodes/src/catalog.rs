//! Registry mapping node type names to their action implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtin::{DelayNode, PassthroughNode, SetNode};
use crate::ExecutableNode;

/// Maps `node_type` strings to shared `ExecutableNode` implementations.
///
/// The compiler consults the catalog to reject unknown node types, and the
/// scheduler resolves each step's action from it at dispatch time.
#[derive(Clone, Default)]
pub struct NodeCatalog {
    nodes: HashMap<String, Arc<dyn ExecutableNode>>,
}

impl NodeCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog pre-populated with the built-in node types
    /// (`passthrough`, `set`, `delay`).
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("passthrough", PassthroughNode);
        catalog.register("set", SetNode);
        catalog.register("delay", DelayNode);
        catalog
    }

    /// Register (or replace) the implementation for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, node: impl ExecutableNode + 'static) {
        self.nodes.insert(node_type.into(), Arc::new(node));
    }

    /// Register an already-shared implementation, e.g. a mock a test keeps a
    /// handle to.
    pub fn register_shared(&mut self, node_type: impl Into<String>, node: Arc<dyn ExecutableNode>) {
        self.nodes.insert(node_type.into(), node);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn ExecutableNode>> {
        self.nodes.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Registered type names, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for NodeCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCatalog")
            .field("node_types", &self.node_types())
            .finish()
    }
}
