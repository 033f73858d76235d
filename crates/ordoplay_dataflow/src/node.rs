// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions for the dataflow graph.

use crate::connection::{Input, InputKey, Output, OutputKey};
use crate::evaluation::EvaluationScope;
use crate::timestamp::Timestamp;
use crate::types::DataType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::hash::Hasher;
use uuid::Uuid;

/// Unique identifier for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Closed set of node kinds the evaluator distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Computes outputs from inputs
    Evaluation,
    /// Has no outputs; pushes its inputs somewhere outside the graph
    Terminal,
}

/// Static description of a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTypeInfo {
    /// Unique type identifier
    pub type_name: &'static str,
    /// Display name
    pub display_name: &'static str,
    /// Category path, `|` separated
    pub category: &'static str,
    /// Tooltip
    pub tooltip: &'static str,
}

/// Direction of a dynamic pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinDirection {
    /// Input pin
    Input,
    /// Output pin
    Output,
}

/// Description of a connection as seen by an editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    /// Pin direction
    pub direction: PinDirection,
    /// Connection name
    pub name: String,
    /// Connection type
    pub data_type: DataType,
}

/// Behavior of a node.
///
/// Implementations hold only the node's own property values (the defaults
/// of unconnected inputs). `evaluate` takes `&self`: all state produced by
/// evaluation lives in the context, which is what allows one graph to be
/// evaluated by several contexts at once.
pub trait DataflowNode: Any + Send + Sync {
    /// Static type description
    fn type_info(&self) -> &'static NodeTypeInfo;

    /// Node kind
    fn kind(&self) -> NodeKind {
        NodeKind::Evaluation
    }

    /// Compute `output`, or every output when `None`
    fn evaluate(&self, scope: &EvaluationScope<'_>, output: Option<OutputKey>);

    /// Fingerprint of the node's own property values
    fn value_hash(&self) -> u64 {
        0
    }

    /// Whether [`DataflowNode::add_pins`] would do anything
    fn can_add_pin(&self) -> bool {
        false
    }

    /// Add dynamic pins, registering their connections on `base`
    fn add_pins(&mut self, _base: &mut NodeBase) -> Vec<Pin> {
        Vec::new()
    }

    /// Pins that a "remove pin" request would delete
    fn pins_to_remove(&self, _base: &NodeBase) -> Vec<Pin> {
        Vec::new()
    }

    /// Called after a dynamic pin's connection has been unregistered
    fn on_pin_removed(&mut self, _pin: &Pin) {}

    /// Serialize the node's own properties (not its connections)
    fn save_properties(&self) -> Result<String, ron::Error> {
        Ok(String::new())
    }

    /// Restore properties written by [`DataflowNode::save_properties`]
    fn load_properties(&mut self, _data: &str) -> Result<(), ron::error::SpannedError> {
        Ok(())
    }

    /// Re-register dynamic pins after [`DataflowNode::load_properties`]
    fn restore_pins(&mut self, _base: &mut NodeBase) {}

    /// Upcast for downcasting to the concrete node type
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete node type
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Graph-side state of a node: identity, connections and invalidation
#[derive(Debug, Clone)]
pub struct NodeBase {
    id: NodeId,
    /// Display name
    pub name: String,
    type_name: &'static str,
    active: bool,
    last_modified: Timestamp,
    inputs: IndexMap<InputKey, Input>,
    outputs: IndexMap<OutputKey, Output>,
    pause_count: u32,
    paused_timestamp: Timestamp,
}

impl NodeBase {
    /// Create the base of a node with a fresh GUID
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(NodeId::new(), name)
    }

    /// Create the base of a node with a known GUID
    pub fn with_id(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            type_name: "",
            active: true,
            last_modified: Timestamp::INVALID,
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            pause_count: 0,
            paused_timestamp: Timestamp::INVALID,
        }
    }

    /// Node GUID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Type name of the behavior attached to this node
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn set_type_name(&mut self, type_name: &'static str) {
        self.type_name = type_name;
    }

    /// Whether the node evaluates (inactive nodes forward their passthroughs)
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Last invalidation time
    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    pub(crate) fn set_last_modified(&mut self, timestamp: Timestamp) {
        self.last_modified = timestamp;
    }

    /// Register an input. A duplicate name is reported but still registered.
    pub fn register_input(
        &mut self,
        key: InputKey,
        name: impl Into<String>,
        data_type: DataType,
    ) -> &mut Input {
        let name = name.into();
        if self.has_connection_named(&name) {
            tracing::warn!(node = %self.name, connection = %name, "Duplicate connection name on node");
        }
        self.inputs
            .entry(key)
            .or_insert_with(|| Input::new(name, key, data_type))
    }

    /// Register an output. A duplicate name is reported but still registered.
    pub fn register_output(
        &mut self,
        key: OutputKey,
        name: impl Into<String>,
        data_type: DataType,
    ) -> &mut Output {
        let name = name.into();
        if self.has_connection_named(&name) {
            tracing::warn!(node = %self.name, connection = %name, "Duplicate connection name on node");
        }
        self.outputs
            .entry(key)
            .or_insert_with(|| Output::new(name, key, data_type))
    }

    /// Register an output that aliases `passthrough` when the node is inactive
    pub fn register_output_with_passthrough(
        &mut self,
        key: OutputKey,
        name: impl Into<String>,
        data_type: DataType,
        passthrough: InputKey,
    ) -> &mut Output {
        let output = self.register_output(key, name, data_type);
        output.set_passthrough(Some(passthrough));
        output
    }

    /// Remove an input registration. The caller is responsible for its links.
    pub fn unregister_input(&mut self, key: InputKey) -> Option<Input> {
        self.inputs.shift_remove(&key)
    }

    /// Remove an output registration. The caller is responsible for its links.
    pub fn unregister_output(&mut self, key: OutputKey) -> Option<Output> {
        self.outputs.shift_remove(&key)
    }

    fn has_connection_named(&self, name: &str) -> bool {
        self.inputs.values().any(|input| input.name == name)
            || self.outputs.values().any(|output| output.name == name)
    }

    /// Get an input by key
    pub fn input(&self, key: InputKey) -> Option<&Input> {
        self.inputs.get(&key)
    }

    pub(crate) fn input_mut(&mut self, key: InputKey) -> Option<&mut Input> {
        self.inputs.get_mut(&key)
    }

    /// Get an output by key
    pub fn output(&self, key: OutputKey) -> Option<&Output> {
        self.outputs.get(&key)
    }

    pub(crate) fn output_mut(&mut self, key: OutputKey) -> Option<&mut Output> {
        self.outputs.get_mut(&key)
    }

    /// Find an input by name
    pub fn find_input(&self, name: &str) -> Option<&Input> {
        self.inputs.values().find(|input| input.name == name)
    }

    /// Find an output by name
    pub fn find_output(&self, name: &str) -> Option<&Output> {
        self.outputs.values().find(|output| output.name == name)
    }

    /// All inputs, in registration order
    pub fn inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.values()
    }

    /// All outputs, in registration order
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    /// Output keys, in registration order
    pub fn output_keys(&self) -> impl Iterator<Item = OutputKey> + '_ {
        self.outputs.keys().copied()
    }

    /// Number of outputs
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Every connection as an editor pin
    pub fn pins(&self) -> Vec<Pin> {
        let inputs = self.inputs.values().map(|input| Pin {
            direction: PinDirection::Input,
            name: input.name.clone(),
            data_type: input.data_type().clone(),
        });
        let outputs = self.outputs.values().map(|output| Pin {
            direction: PinDirection::Output,
            name: output.name.clone(),
            data_type: output.data_type().clone(),
        });
        inputs.chain(outputs).collect()
    }

    /// Whether invalidations are currently being buffered
    pub fn is_paused(&self) -> bool {
        self.pause_count > 0
    }

    pub(crate) fn pause(&mut self) {
        self.pause_count += 1;
    }

    /// Returns the buffered timestamp when the last pause is released
    pub(crate) fn resume(&mut self) -> Option<Timestamp> {
        if self.pause_count == 0 {
            return None;
        }
        self.pause_count -= 1;
        if self.pause_count > 0 {
            return None;
        }
        let buffered = std::mem::take(&mut self.paused_timestamp);
        buffered.is_valid().then_some(buffered)
    }

    pub(crate) fn buffer_invalidation(&mut self, timestamp: Timestamp) {
        self.paused_timestamp = self.paused_timestamp.max(timestamp);
    }
}

/// A node in the graph arena: its graph-side state plus its behavior
pub struct NodeEntry {
    /// Identity, connections and invalidation state
    pub base: NodeBase,
    /// Behavior and properties
    pub node: Box<dyn DataflowNode>,
}

impl NodeEntry {
    /// Node GUID
    pub fn id(&self) -> NodeId {
        self.base.id()
    }

    /// Downcast the behavior
    pub fn downcast_ref<N: DataflowNode>(&self) -> Option<&N> {
        self.node.as_any().downcast_ref::<N>()
    }

    /// Downcast the behavior mutably
    pub fn downcast_mut<N: DataflowNode>(&mut self) -> Option<&mut N> {
        self.node.as_any_mut().downcast_mut::<N>()
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("base", &self.base)
            .field("type", &self.node.type_info().type_name)
            .finish()
    }
}

/// Combines property values into a node value hash
#[derive(Debug, Clone)]
pub struct ValueHasher {
    state: u64,
}

impl ValueHasher {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Create a new hasher
    pub fn new() -> Self {
        Self { state: Self::OFFSET }
    }

    /// Mix in a float property
    pub fn float(mut self, value: f64) -> Self {
        self.write_u64(value.to_bits());
        self
    }

    /// Mix in an integer property
    pub fn integer(mut self, value: u64) -> Self {
        self.write_u64(value);
        self
    }

    /// Mix in a string property
    pub fn text(mut self, value: &str) -> Self {
        self.write(value.as_bytes());
        self
    }

    /// Final hash
    pub fn value(&self) -> u64 {
        self.state
    }
}

impl Default for ValueHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for ValueHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

type NodeConstructor = Box<dyn Fn(&mut NodeBase) -> Box<dyn DataflowNode> + Send + Sync>;

/// Registry of available node types
pub struct NodeRegistry {
    /// Registered node types by ID
    types: IndexMap<&'static str, (NodeTypeInfo, NodeConstructor)>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            types: IndexMap::new(),
        }
    }

    /// Register a node type with the constructor that declares its connections
    pub fn register<N: DataflowNode>(&mut self, info: NodeTypeInfo, constructor: fn(&mut NodeBase) -> N) {
        if self.types.contains_key(info.type_name) {
            tracing::warn!(type_name = info.type_name, "Node type registered twice; keeping the latest");
        }
        let constructor: NodeConstructor = Box::new(move |base| Box::new(constructor(base)));
        self.types.insert(info.type_name, (info, constructor));
    }

    /// Get a node type by ID
    pub fn get(&self, type_name: &str) -> Option<&NodeTypeInfo> {
        self.types.get(type_name).map(|(info, _)| info)
    }

    /// Get all registered types
    pub fn types(&self) -> impl Iterator<Item = &NodeTypeInfo> {
        self.types.values().map(|(info, _)| info)
    }

    /// Get types by category
    pub fn types_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a NodeTypeInfo> {
        self.types().filter(move |info| info.category == category)
    }

    /// Construct a node's behavior, registering its connections on `base`
    pub fn create(&self, type_name: &str, base: &mut NodeBase) -> Option<Box<dyn DataflowNode>> {
        let (_, constructor) = self.types.get(type_name)?;
        Some(constructor(base))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_are_still_registered() {
        let mut base = NodeBase::new("Node");
        base.register_input(InputKey::field(0), "A", DataType::F64);
        base.register_output(OutputKey(0), "A", DataType::F64);
        assert!(base.input(InputKey::field(0)).is_some());
        assert!(base.output(OutputKey(0)).is_some());
        assert_eq!(base.pins().len(), 2);
    }

    #[test]
    fn test_pause_resume_returns_highest_buffered() {
        let mut base = NodeBase::new("Node");
        base.pause();
        base.pause();
        base.buffer_invalidation(Timestamp(5));
        base.buffer_invalidation(Timestamp(3));
        assert_eq!(base.resume(), None);
        assert_eq!(base.resume(), Some(Timestamp(5)));
        assert_eq!(base.resume(), None);
    }

    #[test]
    fn test_resume_without_buffered_invalidation() {
        let mut base = NodeBase::new("Node");
        base.pause();
        assert_eq!(base.resume(), None);
        assert!(!base.is_paused());
    }

    #[test]
    fn test_value_hasher_is_order_sensitive() {
        let first = ValueHasher::new().float(1.0).float(2.0).value();
        let second = ValueHasher::new().float(2.0).float(1.0).value();
        assert_ne!(first, second);
        assert_eq!(first, ValueHasher::new().float(1.0).float(2.0).value());
    }
}
