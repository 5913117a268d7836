/// Compiled workflows and the in-memory definition registry
///
/// A `CompiledWorkflow` is a validated, indexed view of a `WorkflowDefinition`:
/// node lookups, outgoing edges in authoring order and pre-parsed actions. The
/// `WorkflowRegistry` keeps compiled workflows behind an `ArcSwap` so lookups
/// never block while the authoring layer pushes new revisions.

use crate::workflow::{
    action::Action,
    types::{NodeType, WorkflowDefinition, WorkflowEdgeData, WorkflowNodeData},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::Bfs,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Validated workflow ready for execution
#[derive(Debug)]
pub struct CompiledWorkflow {
    /// Base workflow definition
    pub definition: WorkflowDefinition,
    /// Node weight = position in `definition.nodes`, edge weight = position in `definition.edges`
    graph: DiGraph<usize, usize>,
    node_index: HashMap<String, NodeIndex>,
    edge_position: HashMap<String, usize>,
    start_node: Option<usize>,
    on_enter: Vec<Vec<Action>>,
    on_exit: Vec<Vec<Action>>,
    edge_actions: Vec<Vec<Action>>,
}

impl CompiledWorkflow {
    /// Validate a definition and build its execution indexes
    ///
    /// Rejects duplicate node or edge ids, edges pointing at unknown nodes and
    /// malformed built-in action configs. A missing start node is accepted here;
    /// starting such a workflow puts the instance in the error state.
    pub fn compile(definition: WorkflowDefinition) -> Result<Self> {
        tracing::debug!("🏗️ Compiling workflow '{}' ({} nodes, {} edges)",
            definition.id, definition.nodes.len(), definition.edges.len());

        let mut graph = DiGraph::new();
        let mut node_index = HashMap::new();
        let mut on_enter = Vec::with_capacity(definition.nodes.len());
        let mut on_exit = Vec::with_capacity(definition.nodes.len());

        for (position, node) in definition.nodes.iter().enumerate() {
            if node_index.contains_key(&node.id) {
                anyhow::bail!("Duplicate node id '{}' in workflow '{}'", node.id, definition.id);
            }
            node_index.insert(node.id.clone(), graph.add_node(position));

            on_enter.push(Action::compile_all(&node.on_enter_actions).map_err(|e| {
                anyhow::anyhow!("Node '{}' onEnterActions: {:#}", node.id, e)
            })?);
            on_exit.push(Action::compile_all(&node.on_exit_actions).map_err(|e| {
                anyhow::anyhow!("Node '{}' onExitActions: {:#}", node.id, e)
            })?);
        }

        let mut edge_position = HashMap::new();
        let mut edge_actions = Vec::with_capacity(definition.edges.len());
        for (position, edge) in definition.edges.iter().enumerate() {
            if edge_position.insert(edge.id.clone(), position).is_some() {
                anyhow::bail!("Duplicate edge id '{}' in workflow '{}'", edge.id, definition.id);
            }
            let from = node_index.get(&edge.source)
                .ok_or_else(|| anyhow::anyhow!("Edge '{}' references unknown node: {}", edge.id, edge.source))?;
            let to = node_index.get(&edge.target)
                .ok_or_else(|| anyhow::anyhow!("Edge '{}' references unknown node: {}", edge.id, edge.target))?;
            graph.add_edge(*from, *to, position);

            edge_actions.push(Action::compile_all(&edge.actions).map_err(|e| {
                anyhow::anyhow!("Edge '{}' actions: {:#}", edge.id, e)
            })?);
        }

        let start_positions: Vec<usize> = definition.nodes.iter()
            .enumerate()
            .filter(|(_, node)| node.node_type == NodeType::Start)
            .map(|(position, _)| position)
            .collect();
        if start_positions.len() > 1 {
            tracing::warn!("⚠️ Workflow '{}' has {} start nodes, using '{}'",
                definition.id, start_positions.len(), definition.nodes[start_positions[0]].id);
        }

        let compiled = Self {
            start_node: start_positions.first().copied(),
            definition,
            graph,
            node_index,
            edge_position,
            on_enter,
            on_exit,
            edge_actions,
        };

        let unreachable = compiled.unreachable_nodes();
        if !unreachable.is_empty() {
            tracing::warn!("⚠️ Workflow '{}' has nodes unreachable from start: {:?}",
                compiled.definition.id, unreachable);
        }

        tracing::debug!("✅ Workflow '{}' compiled", compiled.definition.id);
        Ok(compiled)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNodeData> {
        self.node_index.get(node_id).map(|index| &self.definition.nodes[self.graph[*index]])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.definition.nodes.iter().map(|node| node.id.as_str())
    }

    /// The node of type `start`, if any
    pub fn start_node(&self) -> Option<&WorkflowNodeData> {
        self.start_node.map(|position| &self.definition.nodes[position])
    }

    pub fn edge(&self, edge_id: &str) -> Option<&WorkflowEdgeData> {
        self.edge_position.get(edge_id).map(|position| &self.definition.edges[*position])
    }

    /// Outgoing edges of a node in the order they appear in the definition
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&WorkflowEdgeData> {
        let Some(index) = self.node_index.get(node_id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self.graph.edges(*index).map(|edge| *edge.weight()).collect();
        positions.sort_unstable();
        positions.into_iter().map(|position| &self.definition.edges[position]).collect()
    }

    pub fn on_enter_actions(&self, node_id: &str) -> &[Action] {
        self.node_index.get(node_id)
            .map(|index| self.on_enter[self.graph[*index]].as_slice())
            .unwrap_or(&[])
    }

    pub fn on_exit_actions(&self, node_id: &str) -> &[Action] {
        self.node_index.get(node_id)
            .map(|index| self.on_exit[self.graph[*index]].as_slice())
            .unwrap_or(&[])
    }

    pub fn edge_actions(&self, edge_id: &str) -> &[Action] {
        self.edge_position.get(edge_id)
            .map(|position| self.edge_actions[*position].as_slice())
            .unwrap_or(&[])
    }

    /// Node ids that cannot be reached from the start node
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let Some(start) = self.start_node() else {
            return Vec::new();
        };
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, self.node_index[&start.id]);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(index);
        }

        self.definition.nodes.iter()
            .filter(|node| !reachable.contains(&self.node_index[&node.id]))
            .map(|node| node.id.clone())
            .collect()
    }
}

/// Lock-free registry of compiled workflows
///
/// Every update swaps the whole map, so in-flight instances keep the
/// `Arc<CompiledWorkflow>` they were started with.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: compiled workflow definition
    workflows: ArcSwap<HashMap<String, Arc<CompiledWorkflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and store a definition, replacing any earlier revision
    pub fn register(&self, definition: WorkflowDefinition) -> Result<Arc<CompiledWorkflow>> {
        let compiled = Arc::new(CompiledWorkflow::compile(definition)?);
        let workflow_id = compiled.id().to_string();

        self.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(workflow_id.clone(), Arc::clone(&compiled));
            next
        });

        tracing::info!("Registered workflow: {}", workflow_id);
        Ok(compiled)
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get(&self, workflow_id: &str) -> Option<Arc<CompiledWorkflow>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.load().contains_key(workflow_id)
    }

    /// List all registered workflow IDs, sorted
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a workflow from registry, returning whether it existed
    pub fn remove(&self, workflow_id: &str) -> bool {
        let mut removed = false;
        self.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(workflow_id).is_some();
            next
        });

        if removed {
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
        removed
    }
}
