// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure containing nodes and connections.
//!
//! The graph is an arena of [`NodeEntry`] values keyed by [`NodeId`].
//! Connections are stored on the endpoints themselves as node handles, so
//! removing a node only has to unlink its neighbours.

use crate::connection::{Connection, ConnectionError, Input, InputKey, InputRef, Output, OutputKey, OutputRef};
use crate::node::{DataflowNode, NodeBase, NodeEntry, NodeId, NodeKind, NodeRegistry, Pin, PinDirection};
use crate::timestamp::Timestamp;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

/// Callback fired after a node has been invalidated
pub type InvalidationCallback = Box<dyn Fn(NodeId, Timestamp) + Send + Sync>;

/// Handle to a registered invalidation observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Error for graph-level operations
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Node not found
    #[error("Node not found: {0:?}")]
    NodeNotFound(NodeId),

    /// Node type not present in the registry
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// Connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Document could not be parsed
    #[error("Failed to parse graph: {0}")]
    Parse(#[from] ron::error::SpannedError),

    /// Document could not be written
    #[error("Failed to write graph: {0}")]
    Write(#[from] ron::Error),
}

/// A node graph
pub struct Graph {
    /// Graph name
    pub name: String,
    /// Nodes in the graph
    nodes: IndexMap<NodeId, NodeEntry>,
    observers: Vec<(ObserverId, InvalidationCallback)>,
    next_observer: u64,
}

impl Graph {
    /// Create a new empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Add a node; `constructor` registers the node's connections on its base
    pub fn add_node<N, F>(&mut self, name: impl Into<String>, constructor: F) -> NodeId
    where
        N: DataflowNode,
        F: FnOnce(&mut NodeBase) -> N,
    {
        let mut base = NodeBase::new(name);
        let node = constructor(&mut base);
        self.insert_entry(base, Box::new(node))
    }

    /// Add a node by registered type name
    pub fn add_node_from_registry(
        &mut self,
        registry: &NodeRegistry,
        type_name: &str,
        name: impl Into<String>,
    ) -> Result<NodeId, GraphError> {
        let mut base = NodeBase::new(name);
        let node = registry
            .create(type_name, &mut base)
            .ok_or_else(|| GraphError::UnknownNodeType(type_name.to_string()))?;
        Ok(self.insert_entry(base, node))
    }

    fn insert_entry(&mut self, mut base: NodeBase, node: Box<dyn DataflowNode>) -> NodeId {
        base.set_type_name(node.type_info().type_name);
        let id = base.id();
        tracing::debug!(node = %base.name, type_name = base.type_name(), "Added dataflow node");
        self.nodes.insert(id, NodeEntry { base, node });
        id
    }

    /// Remove a node and its connections.
    ///
    /// Nodes that were reading from it are invalidated.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<NodeEntry> {
        let entry = self.nodes.shift_remove(&node_id)?;
        for input in entry.base.inputs() {
            if let Some(upstream) = input.connection() {
                if let Some(output) = self.output_mut(upstream) {
                    output.remove_connection(InputRef::new(node_id, input.key));
                }
            }
        }
        let mut downstream = Vec::new();
        for output in entry.base.outputs() {
            for target in output.connections() {
                if let Some(input) = self.input_mut(*target) {
                    input.remove_connection(OutputRef::new(node_id, output.key));
                }
                downstream.push(target.node);
            }
        }
        let now = Timestamp::now();
        for target in downstream {
            self.invalidate(target, now);
        }
        Some(entry)
    }

    /// Get a node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&node_id)
    }

    /// Get a node's behavior downcast to its concrete type
    pub fn node_as<N: DataflowNode>(&self, node_id: NodeId) -> Option<&N> {
        self.nodes.get(&node_id)?.downcast_ref::<N>()
    }

    /// Edit a node's properties, then invalidate it
    pub fn edit_node<N: DataflowNode, R>(&mut self, node_id: NodeId, edit: impl FnOnce(&mut N) -> R) -> Option<R> {
        let result = edit(self.nodes.get_mut(&node_id)?.downcast_mut::<N>()?);
        self.invalidate(node_id, Timestamp::now());
        Some(result)
    }

    /// Find a node by name
    pub fn find_node(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.values().find(|entry| entry.base.name == name)
    }

    /// Get all nodes
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Get all node IDs
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Enable or disable a node; disabled nodes forward their passthroughs
    pub fn set_node_active(&mut self, node_id: NodeId, active: bool) {
        let Some(entry) = self.nodes.get_mut(&node_id) else {
            return;
        };
        if entry.base.is_active() != active {
            entry.base.set_active(active);
            self.invalidate(node_id, Timestamp::now());
        }
    }

    fn input_mut(&mut self, input: InputRef) -> Option<&mut Input> {
        self.nodes.get_mut(&input.node)?.base.input_mut(input.key)
    }

    fn output_mut(&mut self, output: OutputRef) -> Option<&mut Output> {
        self.nodes.get_mut(&output.node)?.base.output_mut(output.key)
    }

    /// Connect an output to an input.
    ///
    /// Polymorphic endpoints take the concrete type of the other side. Cycles
    /// are not rejected here; evaluation reports them.
    pub fn connect(&mut self, from: OutputRef, to: InputRef) -> Result<Connection, ConnectionError> {
        if from.node == to.node {
            return Err(ConnectionError::SelfLoop);
        }
        let source = self.nodes.get(&from.node).ok_or(ConnectionError::NodeNotFound(from.node))?;
        let target = self.nodes.get(&to.node).ok_or(ConnectionError::NodeNotFound(to.node))?;
        let output = source.base.output(from.key).ok_or(ConnectionError::OutputNotFound(from.key))?;
        let input = target.base.input(to.key).ok_or(ConnectionError::InputNotFound(to.key))?;

        if let Some(existing) = input.connection() {
            if existing != from {
                return Err(ConnectionError::InputAlreadyConnected(input.name.clone()));
            }
            return Ok(Connection::new(from, to));
        }

        let from_type = output.data_type().clone();
        let to_type = input.data_type().clone();
        let compatible = match (from_type.is_any(), to_type.is_any()) {
            (false, false) => from_type == to_type || input.supports_type(&from_type),
            (false, true) => input.supports_type(&from_type),
            (true, false) => output.supports_type(&to_type),
            (true, true) => true,
        };
        if !compatible {
            return Err(ConnectionError::IncompatibleTypes {
                from: from_type,
                to: to_type,
            });
        }

        if let Some(input) = self.input_mut(to) {
            if !from_type.is_any() {
                input.set_concrete_type(&from_type);
            }
            input.add_connection(from)?;
        }
        if let Some(output) = self.output_mut(from) {
            if !to_type.is_any() {
                output.set_concrete_type(&to_type);
            }
            output.add_connection(to);
        }

        self.invalidate(to.node, Timestamp::now());
        Ok(Connection::new(from, to))
    }

    /// Remove a connection. Returns whether it existed.
    pub fn disconnect(&mut self, from: OutputRef, to: InputRef) -> bool {
        let removed = match self.input_mut(to) {
            Some(input) => {
                let removed = input.remove_connection(from);
                if removed && input.connection_type().is_any_type() {
                    // Unlinked polymorphic inputs accept any policy type again
                    input.reset_concrete_type();
                }
                removed
            }
            None => false,
        };
        if let Some(output) = self.output_mut(from) {
            output.remove_connection(to);
        }
        if removed {
            self.invalidate(to.node, Timestamp::now());
        }
        removed
    }

    /// Get all connections
    pub fn connections(&self) -> Vec<Connection> {
        self.nodes
            .values()
            .flat_map(|entry| {
                let node = entry.id();
                entry
                    .base
                    .inputs()
                    .filter_map(move |input| Some(Connection::new(input.connection()?, InputRef::new(node, input.key))))
            })
            .collect()
    }

    /// Get connections involving a node
    pub fn connections_for_node(&self, node_id: NodeId) -> Vec<Connection> {
        self.connections()
            .into_iter()
            .filter(|connection| connection.involves_node(node_id))
            .collect()
    }

    /// Register a callback fired for every node invalidation
    pub fn on_node_invalidated(&mut self, callback: impl Fn(NodeId, Timestamp) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove an invalidation observer
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        before != self.observers.len()
    }

    /// Invalidate `node_id` and everything downstream of it.
    ///
    /// Nodes already modified at or after `timestamp` stop the propagation.
    /// Paused nodes buffer the timestamp and are replayed on resume.
    pub fn invalidate(&mut self, node_id: NodeId, timestamp: Timestamp) {
        let mut pending = vec![node_id];
        let mut invalidated = Vec::new();
        while let Some(id) = pending.pop() {
            let Some(entry) = self.nodes.get_mut(&id) else {
                continue;
            };
            if entry.base.is_paused() {
                entry.base.buffer_invalidation(timestamp);
                continue;
            }
            if entry.base.last_modified() >= timestamp {
                continue;
            }
            entry.base.set_last_modified(timestamp);
            for output in entry.base.outputs() {
                pending.extend(output.connections().iter().map(|input| input.node));
            }
            invalidated.push(id);
        }

        for id in invalidated {
            tracing::trace!(node = ?id, timestamp = timestamp.value(), "Node invalidated");
            for (_, observer) in &self.observers {
                observer(id, timestamp);
            }
        }
    }

    /// Buffer invalidations of a node until the matching resume
    pub fn pause_invalidations(&mut self, node_id: NodeId) {
        if let Some(entry) = self.nodes.get_mut(&node_id) {
            entry.base.pause();
        }
    }

    /// Release one pause; the last release replays the newest buffered invalidation
    pub fn resume_invalidations(&mut self, node_id: NodeId) {
        let buffered = self
            .nodes
            .get_mut(&node_id)
            .and_then(|entry| entry.base.resume());
        if let Some(timestamp) = buffered {
            self.invalidate(node_id, timestamp);
        }
    }

    /// Pause invalidations of a node for the lifetime of the returned guard
    pub fn pause_guard(&mut self, node_id: NodeId) -> InvalidationPauseGuard<'_> {
        self.pause_invalidations(node_id);
        InvalidationPauseGuard { graph: self, node_id }
    }

    /// Ask a node to add dynamic pins
    pub fn add_pins(&mut self, node_id: NodeId) -> Vec<Pin> {
        let Some(entry) = self.nodes.get_mut(&node_id) else {
            return Vec::new();
        };
        let NodeEntry { base, node } = entry;
        if !node.can_add_pin() {
            return Vec::new();
        }
        let pins = node.add_pins(base);
        if !pins.is_empty() {
            self.invalidate(node_id, Timestamp::now());
        }
        pins
    }

    /// Remove the pins the node reports as removable, unlinking them first
    pub fn remove_pins(&mut self, node_id: NodeId) -> Vec<Pin> {
        let Some(entry) = self.nodes.get(&node_id) else {
            return Vec::new();
        };
        let pins = entry.node.pins_to_remove(&entry.base);
        for pin in &pins {
            self.remove_pin(node_id, pin);
        }
        if !pins.is_empty() {
            self.invalidate(node_id, Timestamp::now());
        }
        pins
    }

    fn remove_pin(&mut self, node_id: NodeId, pin: &Pin) {
        let Some(entry) = self.nodes.get(&node_id) else {
            return;
        };
        match pin.direction {
            PinDirection::Input => {
                let Some(input) = entry.base.find_input(&pin.name) else {
                    return;
                };
                let (key, upstream) = (input.key, input.connection());
                if let Some(upstream) = upstream {
                    self.disconnect(upstream, InputRef::new(node_id, key));
                }
                if let Some(entry) = self.nodes.get_mut(&node_id) {
                    entry.base.unregister_input(key);
                    entry.node.on_pin_removed(pin);
                }
            }
            PinDirection::Output => {
                let Some(output) = entry.base.find_output(&pin.name) else {
                    return;
                };
                let key = output.key;
                let targets = output.connections().to_vec();
                for target in targets {
                    self.disconnect(OutputRef::new(node_id, key), target);
                }
                if let Some(entry) = self.nodes.get_mut(&node_id) {
                    entry.base.unregister_output(key);
                    entry.node.on_pin_removed(pin);
                }
            }
        }
    }

    /// Nodes of [`NodeKind::Terminal`] kind
    pub fn terminal_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .values()
            .filter(|entry| entry.node.kind() == NodeKind::Terminal)
            .map(NodeEntry::id)
    }

    /// Get nodes in topological order, producers before consumers
    pub fn topological_order(&self) -> Result<Vec<NodeId>, CycleError> {
        let mut visited = HashSet::new();
        let mut temp_mark = HashSet::new();
        let mut order = Vec::new();

        for node_id in self.nodes.keys() {
            if !visited.contains(node_id) {
                self.visit(*node_id, &mut visited, &mut temp_mark, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit(
        &self,
        node_id: NodeId,
        visited: &mut HashSet<NodeId>,
        temp_mark: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) -> Result<(), CycleError> {
        if temp_mark.contains(&node_id) {
            return Err(CycleError(node_id));
        }
        if visited.contains(&node_id) {
            return Ok(());
        }

        temp_mark.insert(node_id);

        // Visit all nodes that this node depends on
        if let Some(entry) = self.nodes.get(&node_id) {
            for input in entry.base.inputs() {
                if let Some(upstream) = input.connection() {
                    self.visit(upstream.node, visited, temp_mark, order)?;
                }
            }
        }

        temp_mark.remove(&node_id);
        visited.insert(node_id);
        order.push(node_id);

        Ok(())
    }

    /// Check connection tables for programming errors. Problems are logged.
    pub fn validate_connections(&self) -> bool {
        let mut valid = true;
        for entry in self.nodes.values() {
            let base = &entry.base;
            let mut names = HashSet::new();
            for pin in base.pins() {
                if !names.insert(pin.name.clone()) {
                    tracing::error!(node = %base.name, connection = %pin.name, "Duplicate connection name");
                    valid = false;
                }
            }
            for output in base.outputs() {
                let Some(passthrough) = output.passthrough() else {
                    continue;
                };
                match base.input(passthrough) {
                    None => {
                        tracing::error!(node = %base.name, output = %output.name, "Passthrough input is not registered");
                        valid = false;
                    }
                    Some(input) if !input.supports_type(output.data_type()) && input.data_type() != output.data_type() => {
                        tracing::warn!(
                            node = %base.name,
                            output = %output.name,
                            input = %input.name,
                            "Passthrough input and output types differ"
                        );
                        valid = false;
                    }
                    Some(_) => {}
                }
            }
        }
        valid
    }

    /// Serialize node properties and connections to RON
    pub fn to_ron(&self) -> Result<String, GraphError> {
        let mut document = GraphDocument {
            name: self.name.clone(),
            nodes: Vec::with_capacity(self.nodes.len()),
            connections: self.connections(),
        };
        for entry in self.nodes.values() {
            document.nodes.push(NodeDocument {
                id: entry.id(),
                name: entry.base.name.clone(),
                type_name: entry.base.type_name().to_string(),
                active: entry.base.is_active(),
                properties: entry.node.save_properties()?,
            });
        }
        let pretty = ron::ser::PrettyConfig::default()
            .struct_names(true)
            .enumerate_arrays(false);
        Ok(ron::ser::to_string_pretty(&document, pretty)?)
    }

    /// Rebuild a graph from [`Graph::to_ron`] output
    pub fn from_ron(registry: &NodeRegistry, text: &str) -> Result<Self, GraphError> {
        let document: GraphDocument = ron::from_str(text)?;
        let mut graph = Self::new(document.name);
        for node in document.nodes {
            let mut base = NodeBase::with_id(node.id, node.name);
            let mut behavior = registry
                .create(&node.type_name, &mut base)
                .ok_or_else(|| GraphError::UnknownNodeType(node.type_name.clone()))?;
            if !node.properties.is_empty() {
                behavior.load_properties(&node.properties)?;
            }
            behavior.restore_pins(&mut base);
            base.set_active(node.active);
            graph.insert_entry(base, behavior);
        }
        for connection in document.connections {
            if let Err(error) = graph.connect(connection.from, connection.to) {
                tracing::warn!(%error, "Dropping connection while loading graph");
            }
        }
        Ok(graph)
    }

    /// Output reference by node and output name
    pub fn output_ref(&self, node_id: NodeId, name: &str) -> Option<OutputRef> {
        let output = self.nodes.get(&node_id)?.base.find_output(name)?;
        Some(OutputRef::new(node_id, output.key))
    }

    /// Input reference by node and input name
    pub fn input_ref(&self, node_id: NodeId, name: &str) -> Option<InputRef> {
        let input = self.nodes.get(&node_id)?.base.find_input(name)?;
        Some(InputRef::new(node_id, input.key))
    }

    /// Output reference by key, checked against the node's table
    pub fn output_by_key(&self, node_id: NodeId, key: OutputKey) -> Option<OutputRef> {
        self.nodes.get(&node_id)?.base.output(key)?;
        Some(OutputRef::new(node_id, key))
    }

    /// Input reference by key, checked against the node's table
    pub fn input_by_key(&self, node_id: NodeId, key: InputKey) -> Option<InputRef> {
        self.nodes.get(&node_id)?.base.input(key)?;
        Some(InputRef::new(node_id, key))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Keeps a node's invalidations paused; resumes them when dropped
pub struct InvalidationPauseGuard<'a> {
    graph: &'a mut Graph,
    node_id: NodeId,
}

impl Deref for InvalidationPauseGuard<'_> {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        self.graph
    }
}

impl DerefMut for InvalidationPauseGuard<'_> {
    fn deref_mut(&mut self) -> &mut Graph {
        self.graph
    }
}

impl Drop for InvalidationPauseGuard<'_> {
    fn drop(&mut self) {
        self.graph.resume_invalidations(self.node_id);
    }
}

#[derive(Serialize, Deserialize)]
struct GraphDocument {
    name: String,
    nodes: Vec<NodeDocument>,
    connections: Vec<Connection>,
}

#[derive(Serialize, Deserialize)]
struct NodeDocument {
    id: NodeId,
    name: String,
    type_name: String,
    active: bool,
    properties: String,
}

/// Error when the graph has a cycle
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Graph contains a cycle through node {0:?}")]
pub struct CycleError(pub NodeId);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{register_math_nodes, AddNode, SquareNode, SumNode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn add_square(graph: &mut Graph) -> (NodeId, NodeId) {
        let add = graph.add_node("Add", |base| AddNode::new(base, 2.0, 3.0));
        let square = graph.add_node("Square", |base| SquareNode::new(base, 0.0));
        graph
            .connect(
                OutputRef::new(add, AddNode::RESULT),
                InputRef::new(square, SquareNode::A),
            )
            .unwrap();
        (add, square)
    }

    #[test]
    fn test_connect_concretizes_any_input() {
        let mut graph = Graph::default();
        let (_, square) = add_square(&mut graph);
        let input = graph.node(square).unwrap().base.input(SquareNode::A).unwrap();
        assert_eq!(input.data_type(), &crate::types::DataType::F64);
        assert_eq!(graph.connections().len(), 1);
    }

    #[test]
    fn test_connect_rejects_second_producer_and_self_loop() {
        let mut graph = Graph::default();
        let (add, square) = add_square(&mut graph);
        let other = graph.add_node("Other", |base| AddNode::new(base, 0.0, 0.0));
        assert!(matches!(
            graph.connect(OutputRef::new(other, AddNode::RESULT), InputRef::new(square, SquareNode::A)),
            Err(ConnectionError::InputAlreadyConnected(_))
        ));
        assert_eq!(
            graph.connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(add, AddNode::A)),
            Err(ConnectionError::SelfLoop)
        );
    }

    #[test]
    fn test_connect_rejects_incompatible_types() {
        use crate::evaluation::EvaluationScope;
        use crate::node::NodeTypeInfo;
        use crate::types::DataType;

        struct TextNode;
        static TEXT_INFO: NodeTypeInfo = NodeTypeInfo {
            type_name: "Text",
            display_name: "Text",
            category: "Test",
            tooltip: "",
        };
        impl DataflowNode for TextNode {
            fn type_info(&self) -> &'static NodeTypeInfo {
                &TEXT_INFO
            }
            fn evaluate(&self, _scope: &EvaluationScope<'_>, _output: Option<OutputKey>) {}
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }

        let mut graph = Graph::default();
        let text = graph.add_node("Text", |base| {
            base.register_output(OutputKey(0), "Text", DataType::String);
            TextNode
        });
        let square = graph.add_node("Square", |base| SquareNode::new(base, 0.0));
        let result = graph.connect(OutputRef::new(text, OutputKey(0)), InputRef::new(square, SquareNode::A));
        assert!(matches!(result, Err(ConnectionError::IncompatibleTypes { .. })));
    }

    #[test]
    fn test_invalidate_propagates_downstream() {
        let mut graph = Graph::default();
        let (add, square) = add_square(&mut graph);
        let timestamp = Timestamp::now();
        graph.invalidate(add, timestamp);
        assert_eq!(graph.node(add).unwrap().base.last_modified(), timestamp);
        assert_eq!(graph.node(square).unwrap().base.last_modified(), timestamp);

        // Older timestamps are ignored
        graph.invalidate(add, Timestamp(1));
        assert_eq!(graph.node(add).unwrap().base.last_modified(), timestamp);
    }

    #[test]
    fn test_observers_are_notified() {
        let mut graph = Graph::default();
        let (add, _) = add_square(&mut graph);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let observer = graph.on_node_invalidated(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        graph.invalidate(add, Timestamp::now());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(graph.remove_observer(observer));
        graph.invalidate(add, Timestamp::now());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pause_collapses_invalidations() {
        let mut graph = Graph::default();
        let (add, square) = add_square(&mut graph);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        graph.on_node_invalidated(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let last = {
            let mut paused = graph.pause_guard(add);
            paused.invalidate(add, Timestamp::now());
            let last = Timestamp::now();
            paused.invalidate(add, last);
            assert_eq!(count.load(Ordering::SeqCst), 0);
            last
        };

        // One replay: add and square, each once
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(graph.node(square).unwrap().base.last_modified(), last);
    }

    #[test]
    fn test_remove_node_unlinks_neighbours() {
        let mut graph = Graph::default();
        let (add, square) = add_square(&mut graph);
        graph.remove_node(add);
        let input = graph.node(square).unwrap().base.input(SquareNode::A).unwrap();
        assert!(!input.is_connected());
        assert!(graph.connections().is_empty());
    }

    #[test]
    fn test_topological_order_and_cycles() {
        let mut graph = Graph::default();
        let (add, square) = add_square(&mut graph);
        let order = graph.topological_order().unwrap();
        let position = |id| order.iter().position(|n| *n == id).unwrap();
        assert!(position(add) < position(square));

        graph
            .connect(OutputRef::new(square, SquareNode::RESULT), InputRef::new(add, AddNode::A))
            .unwrap();
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_dynamic_pins() {
        let mut graph = Graph::default();
        let sum = graph.add_node("Sum", SumNode::new);
        let (add, _) = add_square(&mut graph);

        let added = graph.add_pins(sum);
        assert_eq!(added.len(), 1);
        let pin_input = graph.input_ref(sum, &added[0].name).unwrap();
        graph.connect(OutputRef::new(add, AddNode::RESULT), pin_input).unwrap();

        let removed = graph.remove_pins(sum);
        assert_eq!(removed.len(), 1);
        assert!(graph.input_ref(sum, &added[0].name).is_none());
        assert_eq!(graph.connections_for_node(add).len(), 1);
    }

    #[test]
    fn test_ron_document_roundtrip() {
        let mut registry = NodeRegistry::new();
        register_math_nodes(&mut registry);

        let mut graph = Graph::new("Doc");
        let (add, square) = add_square(&mut graph);
        graph.edit_node::<AddNode, _>(add, |node| node.b = 4.0);
        let text = graph.to_ron().unwrap();

        let restored = Graph::from_ron(&registry, &text).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.node_as::<AddNode>(add).map(|node| node.b), Some(4.0));
        assert_eq!(restored.connections_for_node(square).len(), 1);
    }

    #[test]
    fn test_validate_connections() {
        let mut graph = Graph::default();
        add_square(&mut graph);
        assert!(graph.validate_connections());
    }
}
