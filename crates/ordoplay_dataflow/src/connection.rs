// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection (input/output endpoint) definitions.
//!
//! Inputs are keyed structurally by the field they read from on the owning
//! node, an optional container index for array-valued inputs, and a
//! sub-field offset inside that element. Outputs are keyed by field only.

use crate::node::NodeId;
use crate::types::DataType;
use serde::{Deserialize, Serialize};

/// Structural key of an input on its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputKey {
    /// Field of the node the input reads its default from
    pub field: u32,
    /// Element index when the field is a container
    pub container_index: Option<u32>,
    /// Offset of the value inside the element
    pub element_field: u32,
}

impl InputKey {
    /// Key of a scalar input
    pub const fn field(field: u32) -> Self {
        Self {
            field,
            container_index: None,
            element_field: 0,
        }
    }

    /// Key of an element of an array input
    pub const fn element(field: u32, index: u32) -> Self {
        Self {
            field,
            container_index: Some(index),
            element_field: 0,
        }
    }

    /// Same key, addressing a sub-field of the element
    pub const fn with_element_field(mut self, element_field: u32) -> Self {
        self.element_field = element_field;
        self
    }
}

/// Structural key of an output on its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputKey(pub u32);

/// Address of an input in a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputRef {
    /// Owning node
    pub node: NodeId,
    /// Input on that node
    pub key: InputKey,
}

impl InputRef {
    /// Create a new input address
    pub fn new(node: NodeId, key: InputKey) -> Self {
        Self { node, key }
    }
}

/// Address of an output in a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    /// Owning node
    pub node: NodeId,
    /// Output on that node
    pub key: OutputKey,
}

impl OutputRef {
    /// Create a new output address
    pub fn new(node: NodeId, key: OutputKey) -> Self {
        Self { node, key }
    }
}

/// How a connection maps onto the node's fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Plain field
    Scalar,
    /// One element of an array field
    ArrayElement {
        /// Element index
        index: u32,
    },
}

/// Declared and resolved type of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionType {
    declared: DataType,
    concrete: Option<DataType>,
}

impl ConnectionType {
    /// Create from a declared type
    pub fn new(declared: DataType) -> Self {
        Self {
            declared,
            concrete: None,
        }
    }

    /// The declared type, possibly "any"
    pub fn declared(&self) -> &DataType {
        &self.declared
    }

    /// The resolved type: the concrete type once set, otherwise the declared one
    pub fn current(&self) -> &DataType {
        self.concrete.as_ref().unwrap_or(&self.declared)
    }

    /// Whether the connection was declared polymorphic
    pub fn is_any_type(&self) -> bool {
        self.declared.is_any()
    }

    /// Whether the connection has a concrete type (declared or resolved)
    pub fn is_concrete(&self) -> bool {
        !self.current().is_any()
    }

    /// Whether a value of `data_type` may flow through this connection
    pub fn supports_type(&self, data_type: &DataType) -> bool {
        match &self.concrete {
            Some(concrete) => concrete == data_type,
            None => self.declared.supports(data_type),
        }
    }

    /// Fix the concrete type of a still-polymorphic connection.
    ///
    /// Returns `true` only when the type changed. Already concrete
    /// connections, "any" arguments and types rejected by the policy leave
    /// the connection untouched.
    pub fn set_concrete_type(&mut self, data_type: &DataType) -> bool {
        if !self.is_any_type() || self.concrete.is_some() || data_type.is_any() {
            return false;
        }
        if !self.declared.supports(data_type) {
            return false;
        }
        self.concrete = Some(data_type.clone());
        true
    }

    /// Drop the resolved type, returning to the declared polymorphic type
    pub fn reset_concrete_type(&mut self) {
        self.concrete = None;
    }
}

/// Input endpoint. Holds at most one upstream output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    /// Name, unique within the node
    pub name: String,
    /// Structural key
    pub key: InputKey,
    /// Scalar or array element
    pub kind: ConnectionKind,
    connection_type: ConnectionType,
    connection: Option<OutputRef>,
}

impl Input {
    /// Create a new unconnected input
    pub fn new(name: impl Into<String>, key: InputKey, data_type: DataType) -> Self {
        let kind = match key.container_index {
            Some(index) => ConnectionKind::ArrayElement { index },
            None => ConnectionKind::Scalar,
        };
        Self {
            name: name.into(),
            key,
            kind,
            connection_type: ConnectionType::new(data_type),
            connection: None,
        }
    }

    /// Type information
    pub fn connection_type(&self) -> &ConnectionType {
        &self.connection_type
    }

    /// Resolved type
    pub fn data_type(&self) -> &DataType {
        self.connection_type.current()
    }

    /// Whether a value of `data_type` may be connected
    pub fn supports_type(&self, data_type: &DataType) -> bool {
        self.connection_type.supports_type(data_type)
    }

    /// See [`ConnectionType::set_concrete_type`]
    pub fn set_concrete_type(&mut self, data_type: &DataType) -> bool {
        self.connection_type.set_concrete_type(data_type)
    }

    /// See [`ConnectionType::reset_concrete_type`]
    pub fn reset_concrete_type(&mut self) {
        self.connection_type.reset_concrete_type();
    }

    /// Upstream output, if connected
    pub fn connection(&self) -> Option<OutputRef> {
        self.connection
    }

    /// Whether an output feeds this input
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Link an upstream output. Fails if another output is already linked.
    pub fn add_connection(&mut self, output: OutputRef) -> Result<(), ConnectionError> {
        if let Some(existing) = self.connection {
            if existing != output {
                return Err(ConnectionError::InputAlreadyConnected(self.name.clone()));
            }
        }
        self.connection = Some(output);
        Ok(())
    }

    /// Unlink `output`. Returns whether it was linked.
    pub fn remove_connection(&mut self, output: OutputRef) -> bool {
        if self.connection == Some(output) {
            self.connection = None;
            true
        } else {
            false
        }
    }
}

/// Output endpoint. Fans out to any number of inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    /// Name, unique within the node
    pub name: String,
    /// Structural key
    pub key: OutputKey,
    connection_type: ConnectionType,
    connections: Vec<InputRef>,
    passthrough: Option<InputKey>,
}

impl Output {
    /// Create a new output with no downstream inputs
    pub fn new(name: impl Into<String>, key: OutputKey, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            key,
            connection_type: ConnectionType::new(data_type),
            connections: Vec::new(),
            passthrough: None,
        }
    }

    /// Type information
    pub fn connection_type(&self) -> &ConnectionType {
        &self.connection_type
    }

    /// Resolved type
    pub fn data_type(&self) -> &DataType {
        self.connection_type.current()
    }

    /// Whether a value of `data_type` may be produced here
    pub fn supports_type(&self, data_type: &DataType) -> bool {
        self.connection_type.supports_type(data_type)
    }

    /// See [`ConnectionType::set_concrete_type`]
    pub fn set_concrete_type(&mut self, data_type: &DataType) -> bool {
        self.connection_type.set_concrete_type(data_type)
    }

    /// Downstream inputs
    pub fn connections(&self) -> &[InputRef] {
        &self.connections
    }

    /// Link a downstream input. Type compatibility is checked by the graph.
    pub fn add_connection(&mut self, input: InputRef) {
        if !self.connections.contains(&input) {
            self.connections.push(input);
        }
    }

    /// Unlink a downstream input. Returns whether it was linked.
    pub fn remove_connection(&mut self, input: InputRef) -> bool {
        let before = self.connections.len();
        self.connections.retain(|existing| *existing != input);
        before != self.connections.len()
    }

    /// Input whose value this output aliases when the node does not compute it
    pub fn passthrough(&self) -> Option<InputKey> {
        self.passthrough
    }

    /// Set the passthrough input
    pub fn set_passthrough(&mut self, input: Option<InputKey>) {
        self.passthrough = input;
    }
}

/// A link between an output and an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Producing output
    pub from: OutputRef,
    /// Consuming input
    pub to: InputRef,
}

impl Connection {
    /// Create a new connection
    pub fn new(from: OutputRef, to: InputRef) -> Self {
        Self { from, to }
    }

    /// Check if this connection involves a specific node
    pub fn involves_node(&self, node_id: NodeId) -> bool {
        self.from.node == node_id || self.to.node == node_id
    }
}

/// Error when creating a connection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    /// Node not found
    #[error("Node not found: {0:?}")]
    NodeNotFound(NodeId),

    /// Input not found
    #[error("Input not found: {0:?}")]
    InputNotFound(InputKey),

    /// Output not found
    #[error("Output not found: {0:?}")]
    OutputNotFound(OutputKey),

    /// Incompatible connection types
    #[error("Incompatible types: {from} -> {to}")]
    IncompatibleTypes {
        /// Output type
        from: DataType,
        /// Input type
        to: DataType,
    },

    /// Input is already fed by another output
    #[error("Input already connected: {0}")]
    InputAlreadyConnected(String),

    /// Self-loop not allowed
    #[error("Self-loop not allowed")]
    SelfLoop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_concrete_type_once() {
        let mut connection = ConnectionType::new(DataType::any_numeric());
        assert!(connection.set_concrete_type(&DataType::F32));
        // Same type again: no change
        assert!(!connection.set_concrete_type(&DataType::F32));
        // Different type: never silently overwritten
        assert!(!connection.set_concrete_type(&DataType::F64));
        assert_eq!(connection.current(), &DataType::F32);
    }

    #[test]
    fn test_set_concrete_type_rejects_any_and_policy_violations() {
        let mut connection = ConnectionType::new(DataType::any_numeric());
        assert!(!connection.set_concrete_type(&DataType::any()));
        assert!(!connection.set_concrete_type(&DataType::String));
        assert!(!connection.is_concrete());

        let mut fixed = ConnectionType::new(DataType::F64);
        assert!(!fixed.set_concrete_type(&DataType::F64));
        assert!(!fixed.set_concrete_type(&DataType::F32));
    }

    #[test]
    fn test_supports_type_after_resolution() {
        let mut connection = ConnectionType::new(DataType::any_numeric());
        assert!(connection.supports_type(&DataType::I32));
        connection.set_concrete_type(&DataType::F64);
        assert!(!connection.supports_type(&DataType::I32));
        connection.reset_concrete_type();
        assert!(connection.supports_type(&DataType::I32));
    }

    #[test]
    fn test_input_single_producer() {
        let upstream = OutputRef::new(NodeId::new(), OutputKey(0));
        let other = OutputRef::new(NodeId::new(), OutputKey(0));
        let mut input = Input::new("A", InputKey::field(0), DataType::F64);

        assert!(input.add_connection(upstream).is_ok());
        assert_eq!(
            input.add_connection(other),
            Err(ConnectionError::InputAlreadyConnected("A".into()))
        );
        assert!(input.remove_connection(upstream));
        assert!(input.add_connection(other).is_ok());
    }

    #[test]
    fn test_output_fan_out() {
        let mut output = Output::new("Result", OutputKey(0), DataType::F64);
        let first = InputRef::new(NodeId::new(), InputKey::field(0));
        let second = InputRef::new(NodeId::new(), InputKey::field(1));
        output.add_connection(first);
        output.add_connection(second);
        output.add_connection(first);
        assert_eq!(output.connections().len(), 2);
        assert!(output.remove_connection(first));
        assert!(!output.remove_connection(first));
    }

    #[test]
    fn test_array_element_kind() {
        let input = Input::new("Values_2", InputKey::element(3, 2), DataType::F64);
        assert_eq!(input.kind, ConnectionKind::ArrayElement { index: 2 });
    }
}
