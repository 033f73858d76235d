// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node-side evaluation API and the terminal-node driver.

use crate::cache::{CacheElement, CacheKey, CachedValue};
use crate::connection::{InputKey, OutputKey, OutputRef};
use crate::context::{evaluate_node, Context, ContextExt};
use crate::graph::CycleError;
use crate::node::{NodeBase, NodeEntry, NodeKind};
use crate::timestamp::Timestamp;
use crate::types::DataflowValue;

/// What a node sees while it evaluates: its own connections and the context
pub struct EvaluationScope<'a> {
    context: &'a dyn Context,
    entry: &'a NodeEntry,
}

impl<'a> EvaluationScope<'a> {
    /// Create a scope for `entry`
    pub fn new(context: &'a dyn Context, entry: &'a NodeEntry) -> Self {
        Self { context, entry }
    }

    /// The evaluating context
    pub fn context(&self) -> &'a dyn Context {
        self.context
    }

    /// The evaluating node's connections
    pub fn node(&self) -> &'a NodeBase {
        &self.entry.base
    }

    /// Timestamp stamped on values written by this node.
    ///
    /// Never older than the node's last invalidation, so a write always
    /// satisfies the node's own staleness check.
    pub fn timestamp(&self) -> Timestamp {
        self.context.timestamp().max(self.entry.base.last_modified())
    }

    /// Whether an output feeds `input`
    pub fn is_connected(&self, input: InputKey) -> bool {
        self.entry
            .base
            .input(input)
            .is_some_and(crate::connection::Input::is_connected)
    }

    fn upstream(&self, input: InputKey) -> Option<Option<OutputRef>> {
        let registered = self.entry.base.input(input);
        debug_assert!(registered.is_some(), "unregistered input {input:?}");
        if registered.is_none() {
            tracing::error!(node = %self.entry.base.name, input = ?input, "No input registered for this key");
        }
        registered.map(crate::connection::Input::connection)
    }

    /// Value of `input`: the connected output's value (evaluated if stale),
    /// or `default` when nothing is connected.
    pub fn get_value<T: DataflowValue>(&self, input: InputKey, default: T) -> T {
        let Some(Some(upstream)) = self.upstream(input) else {
            return default;
        };
        let key = CacheKey::for_output(upstream.node, upstream.key);
        if !self.context.evaluate_output(upstream) {
            self.context.set_data(
                key,
                default.clone(),
                self.entry.id(),
                self.entry.node.value_hash(),
                self.timestamp(),
            );
        }
        self.context.get_data(key, default)
    }

    /// Store `value` as the result of `output`
    pub fn set_value<T: DataflowValue>(&self, value: T, output: OutputKey) {
        let registered = self.entry.base.output(output);
        debug_assert!(registered.is_some(), "unregistered output {output:?}");
        let Some(registered) = registered else {
            tracing::error!(node = %self.entry.base.name, output = ?output, "No output registered for this key");
            return;
        };
        let produced = T::data_type();
        if !registered.data_type().is_any() && *registered.data_type() != produced {
            tracing::warn!(
                node = %self.entry.base.name,
                output = %registered.name,
                expected = %registered.data_type(),
                produced = %produced,
                "Output value type differs from the connection type"
            );
        }
        self.context.set_data_element(
            CacheKey::for_output(self.entry.id(), output),
            CacheElement::typed(
                CachedValue::new(value),
                self.entry.id(),
                self.entry.node.value_hash(),
                self.timestamp(),
            ),
        );
    }

    /// Alias `output` to the value feeding `input` without copying it.
    /// Does nothing when `input` is not connected.
    pub fn forward_input(&self, input: InputKey, output: OutputKey) {
        let Some(Some(upstream)) = self.upstream(input) else {
            return;
        };
        if self.entry.base.output(output).is_none() {
            tracing::error!(node = %self.entry.base.name, output = ?output, "No output registered for this key");
            return;
        }
        if self.context.evaluate_output(upstream) {
            self.context.set_data_reference(
                CacheKey::for_output(self.entry.id(), output),
                CacheKey::for_output(upstream.node, upstream.key),
                self.timestamp(),
            );
        }
    }

    /// Forward `input` when connected, otherwise store `default`
    pub fn safe_forward_input<T: DataflowValue>(&self, input: InputKey, output: OutputKey, default: T) {
        if self.is_connected(input) {
            self.forward_input(input, output);
        } else {
            self.set_value(default, output);
        }
    }
}

/// Evaluate every terminal node, producers first.
///
/// Returns the number of terminal nodes evaluated.
pub fn evaluate_terminals(context: &dyn Context) -> Result<usize, CycleError> {
    let graph = context.graph();
    let order = graph.topological_order()?;
    let mut evaluated = 0;
    for node in order {
        let is_terminal = graph
            .node(node)
            .is_some_and(|entry| entry.node.kind() == NodeKind::Terminal);
        if is_terminal {
            evaluate_node(context, node, None);
            evaluated += 1;
        }
    }
    tracing::debug!(graph = %graph.name, evaluated, "Evaluated terminal nodes");
    Ok(evaluated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InputRef;
    use crate::context::ContextSingle;
    use crate::graph::Graph;
    use crate::math::{AddNode, DivideNode, SquareNode};
    use crate::node::{DataflowNode, NodeTypeInfo};
    use crate::types::DataType;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_add_then_square() {
        let mut graph = Graph::new("Scenario");
        let add = graph.add_node("Add", |base| AddNode::new(base, 2.0, 3.0));
        let square = graph.add_node("Square", |base| SquareNode::new(base, 0.0));
        graph
            .connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(square, SquareNode::A))
            .unwrap();
        let result = CacheKey::for_output(square, SquareNode::RESULT);

        let context = ContextSingle::new(&graph);
        context.evaluate(square, Some(SquareNode::RESULT));
        assert_eq!(context.get_data(result, 0.0), 25.0);
        let cache = context.into_cache();

        graph.edit_node::<AddNode, _>(add, |node| node.b = 4.0);
        let context = ContextSingle::with_cache(&graph, cache);
        context.evaluate(square, Some(SquareNode::RESULT));
        assert_eq!(context.get_data(result, 0.0), 36.0);
    }

    #[test]
    fn test_divide_by_zero_fallback() {
        let mut graph = Graph::new("Scenario");
        let divide = graph.add_node("Divide", |base| DivideNode::new(base, 10.0, 0.0, -1.0));
        let context = ContextSingle::new(&graph);
        context.evaluate(divide, None);
        assert_eq!(context.get_data(CacheKey::for_output(divide, DivideNode::RESULT), 0.0), -1.0);
    }

    static SINK_INFO: NodeTypeInfo = NodeTypeInfo {
        type_name: "TestSink",
        display_name: "Sink",
        category: "Test",
        tooltip: "Collects its input",
    };

    struct SinkNode {
        received: Arc<Mutex<Vec<f64>>>,
    }

    impl SinkNode {
        const VALUE: InputKey = InputKey::field(0);
    }

    impl DataflowNode for SinkNode {
        fn type_info(&self) -> &'static NodeTypeInfo {
            &SINK_INFO
        }

        fn kind(&self) -> NodeKind {
            NodeKind::Terminal
        }

        fn evaluate(&self, scope: &EvaluationScope<'_>, output: Option<OutputKey>) {
            assert!(output.is_none());
            self.received.lock().push(scope.get_value(Self::VALUE, f64::NAN));
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_terminal_driver() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut graph = Graph::new("Terminals");
        let add = graph.add_node("Add", |base| AddNode::new(base, 1.5, 1.5));
        let sink_received = Arc::clone(&received);
        let sink = graph.add_node("Sink", move |base| {
            base.register_input(SinkNode::VALUE, "Value", DataType::F64);
            SinkNode {
                received: sink_received,
            }
        });
        graph
            .connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(sink, SinkNode::VALUE))
            .unwrap();

        let context = ContextSingle::new(&graph);
        assert_eq!(evaluate_terminals(&context).unwrap(), 1);
        assert_eq!(*received.lock(), vec![3.0]);
    }

    #[test]
    fn test_safe_forward_sets_default_when_unconnected() {
        static FORWARD_INFO: NodeTypeInfo = NodeTypeInfo {
            type_name: "TestForward",
            display_name: "Forward",
            category: "Test",
            tooltip: "",
        };
        struct ForwardNode;
        impl DataflowNode for ForwardNode {
            fn type_info(&self) -> &'static NodeTypeInfo {
                &FORWARD_INFO
            }
            fn evaluate(&self, scope: &EvaluationScope<'_>, _output: Option<OutputKey>) {
                scope.safe_forward_input(InputKey::field(0), OutputKey(1), 7.0_f64);
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }

        let mut graph = Graph::default();
        let forward = graph.add_node("Forward", |base| {
            base.register_input(InputKey::field(0), "In", DataType::F64);
            base.register_output(OutputKey(1), "Out", DataType::F64);
            ForwardNode
        });
        {
            let context = ContextSingle::new(&graph);
            context.evaluate(forward, None);
            assert_eq!(context.get_data(CacheKey::for_output(forward, OutputKey(1)), 0.0), 7.0);
        }

        let add = graph.add_node("Add", |base| AddNode::new(base, 4.0, 4.0));
        graph
            .connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(forward, InputKey::field(0)))
            .unwrap();
        let context = ContextSingle::new(&graph);
        context.evaluate(forward, None);
        let out = CacheKey::for_output(forward, OutputKey(1));
        assert_eq!(context.get_data(out, 0.0), 8.0);
    }
}
