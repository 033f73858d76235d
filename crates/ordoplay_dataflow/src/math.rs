// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scalar math nodes.
//!
//! Operands accept any numeric type and are read as `f64`; the result is
//! always `f64`. Disabled nodes forward `A` to `Result`.

use crate::connection::{InputKey, OutputKey};
use crate::evaluation::EvaluationScope;
use crate::node::{DataflowNode, NodeBase, NodeRegistry, NodeTypeInfo, Pin, PinDirection, ValueHasher};
use crate::types::DataType;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Category shared by every node in this module
pub const MATH_CATEGORY: &str = "Math|Scalar";

const RESULT_NAME: &str = "Result";

macro_rules! math_node {
    (
        $(#[$doc:meta])*
        $node:ident {
            type_name: $type_name:literal,
            display_name: $display:literal,
            tooltip: $tooltip:literal,
            operands: [$($operand:ident / $operand_key:ident @ $operand_index:literal => $operand_pin:literal = $operand_default:expr),+ $(,)?],
            extras: [$($extra:ident / $extra_key:ident @ $extra_index:literal => $extra_pin:literal = $extra_default:expr),* $(,)?],
            compute: |$this:ident, $scope:ident, $($arg:ident),+| $body:expr $(,)?
        }
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $node {
            $(
                #[doc = concat!("Value of `", $operand_pin, "` while unconnected")]
                pub $operand: f64,
            )+
            $(
                #[doc = concat!("Value of `", $extra_pin, "` while unconnected")]
                pub $extra: f64,
            )*
        }

        impl $node {
            $(
                #[doc = concat!("`", $operand_pin, "` input")]
                pub const $operand_key: InputKey = InputKey::field($operand_index);
            )+
            $(
                #[doc = concat!("`", $extra_pin, "` input")]
                pub const $extra_key: InputKey = InputKey::field($extra_index);
            )*
            /// `Result` output
            pub const RESULT: OutputKey = OutputKey(0);

            /// Type description
            pub const INFO: NodeTypeInfo = NodeTypeInfo {
                type_name: $type_name,
                display_name: $display,
                category: MATH_CATEGORY,
                tooltip: $tooltip,
            };

            /// Create the node, registering its connections on `base`
            pub fn new(base: &mut NodeBase, $($operand: f64,)+ $($extra: f64,)*) -> Self {
                $(base.register_input(Self::$operand_key, $operand_pin, DataType::any_numeric());)+
                $(base.register_input(Self::$extra_key, $extra_pin, DataType::any_numeric());)*
                base.register_output_with_passthrough(Self::RESULT, RESULT_NAME, DataType::F64, Self::A);
                Self { $($operand,)+ $($extra,)* }
            }

            /// Create the node with default property values
            pub fn create(base: &mut NodeBase) -> Self {
                Self::new(base, $($operand_default,)+ $($extra_default,)*)
            }
        }

        impl DataflowNode for $node {
            fn type_info(&self) -> &'static NodeTypeInfo {
                &Self::INFO
            }

            fn evaluate(&self, $scope: &EvaluationScope<'_>, output: Option<OutputKey>) {
                if output.is_some_and(|key| key != Self::RESULT) {
                    return;
                }
                let $this = self;
                let ($($arg,)+) = ($($scope.get_value(Self::$operand_key, $this.$operand),)+);
                let result: f64 = $body;
                $scope.set_value(result, Self::RESULT);
            }

            fn value_hash(&self) -> u64 {
                ValueHasher::new()
                    $(.float(self.$operand))+
                    $(.float(self.$extra))*
                    .value()
            }

            fn save_properties(&self) -> Result<String, ron::Error> {
                ron::to_string(self)
            }

            fn load_properties(&mut self, data: &str) -> Result<(), ron::error::SpannedError> {
                *self = ron::from_str(data)?;
                Ok(())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
    };
}

math_node! {
    /// `A + B`
    AddNode {
        type_name: "DataflowMathAddNode",
        display_name: "Add",
        tooltip: "Result = A + B",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 0.0],
        extras: [],
        compute: |this, scope, a, b| a + b,
    }
}

math_node! {
    /// `A - B`
    SubtractNode {
        type_name: "DataflowMathSubtractNode",
        display_name: "Subtract",
        tooltip: "Result = A - B",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 0.0],
        extras: [],
        compute: |this, scope, a, b| a - b,
    }
}

math_node! {
    /// `A * B`
    MultiplyNode {
        type_name: "DataflowMathMultiplyNode",
        display_name: "Multiply",
        tooltip: "Result = A * B",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 1.0],
        extras: [],
        compute: |this, scope, a, b| a * b,
    }
}

math_node! {
    /// `A / B`, or `Fallback` when `B` is zero
    DivideNode {
        type_name: "DataflowMathDivideNode",
        display_name: "Divide",
        tooltip: "Result = A / B, Fallback when B is zero",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 1.0],
        extras: [fallback / FALLBACK @ 2 => "Fallback" = 0.0],
        compute: |this, scope, a, b| if b == 0.0 {
            scope.get_value(Self::FALLBACK, this.fallback)
        } else {
            a / b
        },
    }
}

math_node! {
    /// Smaller of `A` and `B`
    MinimumNode {
        type_name: "DataflowMathMinimumNode",
        display_name: "Min",
        tooltip: "Result = min(A, B)",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 0.0],
        extras: [],
        compute: |this, scope, a, b| a.min(b),
    }
}

math_node! {
    /// Larger of `A` and `B`
    MaximumNode {
        type_name: "DataflowMathMaximumNode",
        display_name: "Max",
        tooltip: "Result = max(A, B)",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 0.0],
        extras: [],
        compute: |this, scope, a, b| a.max(b),
    }
}

math_node! {
    /// `A` raised to `B`
    PowNode {
        type_name: "DataflowMathPowNode",
        display_name: "Pow",
        tooltip: "Result = A ^ B",
        operands: [a / A @ 0 => "A" = 0.0, b / B @ 1 => "B" = 1.0],
        extras: [],
        compute: |this, scope, a, b| a.powf(b),
    }
}

math_node! {
    /// `1 / A`, or `Fallback` when `A` is zero
    ReciprocalNode {
        type_name: "DataflowMathReciprocalNode",
        display_name: "Reciprocal",
        tooltip: "Result = 1 / A, Fallback when A is zero",
        operands: [a / A @ 0 => "A" = 1.0],
        extras: [fallback / FALLBACK @ 1 => "Fallback" = 0.0],
        compute: |this, scope, a| if a == 0.0 {
            scope.get_value(Self::FALLBACK, this.fallback)
        } else {
            1.0 / a
        },
    }
}

math_node! {
    /// `A * A`
    SquareNode {
        type_name: "DataflowMathSquareNode",
        display_name: "Square",
        tooltip: "Result = A * A",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a * a,
    }
}

math_node! {
    /// `A * A * A`
    CubeNode {
        type_name: "DataflowMathCubeNode",
        display_name: "Cube",
        tooltip: "Result = A * A * A",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a * a * a,
    }
}

math_node! {
    /// Square root of `A`; zero for negative input
    SquareRootNode {
        type_name: "DataflowMathSquareRootNode",
        display_name: "Sqrt",
        tooltip: "Result = sqrt(A), 0 when A is negative",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| if a < 0.0 { 0.0 } else { a.sqrt() },
    }
}

math_node! {
    /// `1 / sqrt(A)`, or `Fallback` when `A` is zero or negative
    InverseSquareRootNode {
        type_name: "DataflowMathInverseSquareRootNode",
        display_name: "InvSqrt",
        tooltip: "Result = 1 / sqrt(A), Fallback when A <= 0",
        operands: [a / A @ 0 => "A" = 1.0],
        extras: [fallback / FALLBACK @ 1 => "Fallback" = 0.0],
        compute: |this, scope, a| if a <= 0.0 {
            scope.get_value(Self::FALLBACK, this.fallback)
        } else {
            1.0 / a.sqrt()
        },
    }
}

math_node! {
    /// `-A`
    NegateNode {
        type_name: "DataflowMathNegateNode",
        display_name: "Negate",
        tooltip: "Result = -A",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| -a,
    }
}

math_node! {
    /// `|A|`
    AbsNode {
        type_name: "DataflowMathAbsNode",
        display_name: "Abs",
        tooltip: "Result = |A|",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a.abs(),
    }
}

math_node! {
    /// Largest integer not above `A`
    FloorNode {
        type_name: "DataflowMathFloorNode",
        display_name: "Floor",
        tooltip: "Result = floor(A)",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a.floor(),
    }
}

math_node! {
    /// Smallest integer not below `A`
    CeilNode {
        type_name: "DataflowMathCeilNode",
        display_name: "Ceil",
        tooltip: "Result = ceil(A)",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a.ceil(),
    }
}

math_node! {
    /// Nearest integer, halves rounded up
    RoundNode {
        type_name: "DataflowMathRoundNode",
        display_name: "Round",
        tooltip: "Result = round(A), halves towards positive infinity",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| (a + 0.5).floor(),
    }
}

math_node! {
    /// Integer part of `A`
    TruncNode {
        type_name: "DataflowMathTruncNode",
        display_name: "Trunc",
        tooltip: "Result = trunc(A)",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a.trunc(),
    }
}

math_node! {
    /// `A - floor(A)`
    FracNode {
        type_name: "DataflowMathFracNode",
        display_name: "Frac",
        tooltip: "Result = A - floor(A)",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a - a.floor(),
    }
}

math_node! {
    /// Logarithm of `A` in `Base`; zero for a non-positive base or operand
    LogXNode {
        type_name: "DataflowMathLogXNode",
        display_name: "LogX",
        tooltip: "Result = log[Base](A)",
        operands: [a / A @ 0 => "A" = 1.0],
        extras: [log_base / BASE @ 1 => "Base" = 10.0],
        compute: |this, scope, a| {
            let base = scope.get_value(Self::BASE, this.log_base);
            if base <= 0.0 || a <= 0.0 {
                0.0
            } else {
                a.ln() / base.ln()
            }
        },
    }
}

math_node! {
    /// Natural logarithm of `A`
    LogNode {
        type_name: "DataflowMathLogNode",
        display_name: "Log",
        tooltip: "Result = ln(A)",
        operands: [a / A @ 0 => "A" = 1.0],
        extras: [],
        compute: |this, scope, a| a.ln(),
    }
}

math_node! {
    /// `e` raised to `A`
    ExpNode {
        type_name: "DataflowMathExpNode",
        display_name: "Exp",
        tooltip: "Result = e ^ A",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| a.exp(),
    }
}

math_node! {
    /// -1, 0 or 1 following the sign of `A`
    SignNode {
        type_name: "DataflowMathSignNode",
        display_name: "Sign",
        tooltip: "Result = sign(A)",
        operands: [a / A @ 0 => "A" = 0.0],
        extras: [],
        compute: |this, scope, a| if a > 0.0 {
            1.0
        } else if a < 0.0 {
            -1.0
        } else {
            0.0
        },
    }
}

/// Sum of a variable number of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumNode {
    /// Values of unconnected elements
    pub values: Vec<f64>,
}

impl SumNode {
    /// Field holding the element inputs
    pub const VALUES_FIELD: u32 = 0;
    /// `Sum` output
    pub const SUM: OutputKey = OutputKey(0);
    /// Elements the node never drops below
    pub const MIN_VALUES: usize = 2;

    /// Type description
    pub const INFO: NodeTypeInfo = NodeTypeInfo {
        type_name: "DataflowMathSumNode",
        display_name: "Sum",
        category: MATH_CATEGORY,
        tooltip: "Result = sum of every value",
    };

    /// Create the node with two elements
    pub fn new(base: &mut NodeBase) -> Self {
        let node = Self {
            values: vec![0.0; Self::MIN_VALUES],
        };
        base.register_output(Self::SUM, "Sum", DataType::F64);
        node.register_elements(base);
        node
    }

    /// Key of element `index`
    pub fn element(index: usize) -> InputKey {
        InputKey::element(Self::VALUES_FIELD, u32::try_from(index).unwrap_or(u32::MAX))
    }

    fn element_name(index: usize) -> String {
        format!("Values_{index}")
    }

    fn register_elements(&self, base: &mut NodeBase) -> Vec<Pin> {
        let mut added = Vec::new();
        for index in 0..self.values.len() {
            let key = Self::element(index);
            if base.input(key).is_none() {
                let name = Self::element_name(index);
                base.register_input(key, name.clone(), DataType::any_numeric());
                added.push(Pin {
                    direction: PinDirection::Input,
                    name,
                    data_type: DataType::any_numeric(),
                });
            }
        }
        added
    }
}

impl DataflowNode for SumNode {
    fn type_info(&self) -> &'static NodeTypeInfo {
        &Self::INFO
    }

    fn evaluate(&self, scope: &EvaluationScope<'_>, output: Option<OutputKey>) {
        if output.is_some_and(|key| key != Self::SUM) {
            return;
        }
        let sum: f64 = self
            .values
            .iter()
            .enumerate()
            .map(|(index, value)| scope.get_value(Self::element(index), *value))
            .sum();
        scope.set_value(sum, Self::SUM);
    }

    fn value_hash(&self) -> u64 {
        self.values
            .iter()
            .fold(ValueHasher::new().integer(self.values.len() as u64), |hasher, value| hasher.float(*value))
            .value()
    }

    fn can_add_pin(&self) -> bool {
        true
    }

    fn add_pins(&mut self, base: &mut NodeBase) -> Vec<Pin> {
        self.values.push(0.0);
        self.register_elements(base)
    }

    fn pins_to_remove(&self, _base: &NodeBase) -> Vec<Pin> {
        if self.values.len() <= Self::MIN_VALUES {
            return Vec::new();
        }
        vec![Pin {
            direction: PinDirection::Input,
            name: Self::element_name(self.values.len() - 1),
            data_type: DataType::any_numeric(),
        }]
    }

    fn on_pin_removed(&mut self, pin: &Pin) {
        if pin.name == Self::element_name(self.values.len().saturating_sub(1)) {
            self.values.pop();
        }
    }

    fn save_properties(&self) -> Result<String, ron::Error> {
        ron::to_string(self)
    }

    fn load_properties(&mut self, data: &str) -> Result<(), ron::error::SpannedError> {
        *self = ron::from_str(data)?;
        Ok(())
    }

    fn restore_pins(&mut self, base: &mut NodeBase) {
        self.register_elements(base);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

macro_rules! register_all {
    ($registry:expr, $($node:ident),+ $(,)?) => {
        $($registry.register($node::INFO, $node::create);)+
    };
}

/// Register every math node type
pub fn register_math_nodes(registry: &mut NodeRegistry) {
    register_all!(
        registry,
        AddNode,
        SubtractNode,
        MultiplyNode,
        DivideNode,
        MinimumNode,
        MaximumNode,
        PowNode,
        ReciprocalNode,
        SquareNode,
        CubeNode,
        SquareRootNode,
        InverseSquareRootNode,
        NegateNode,
        AbsNode,
        FloorNode,
        CeilNode,
        RoundNode,
        TruncNode,
        FracNode,
        LogXNode,
        LogNode,
        ExpNode,
        SignNode,
    );
    registry.register(SumNode::INFO, SumNode::new);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::connection::{InputRef, OutputRef};
    use crate::context::{ContextExt, ContextSingle};
    use crate::graph::Graph;
    use crate::node::NodeId;

    fn result_of(graph: &Graph, node: NodeId, output: OutputKey) -> f64 {
        let context = ContextSingle::new(graph);
        context.evaluate(node, Some(output));
        context.get_data(CacheKey::for_output(node, output), f64::NAN)
    }

    fn evaluate_single<N: DataflowNode>(constructor: impl FnOnce(&mut NodeBase) -> N) -> f64 {
        let mut graph = Graph::default();
        let node = graph.add_node("Node", constructor);
        result_of(&graph, node, OutputKey(0))
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(evaluate_single(|base| CubeNode::new(base, 3.0)), 27.0);
        assert_eq!(evaluate_single(|base| SquareRootNode::new(base, 16.0)), 4.0);
        assert_eq!(evaluate_single(|base| SquareRootNode::new(base, -4.0)), 0.0);
        assert_eq!(evaluate_single(|base| ReciprocalNode::new(base, 0.0, 9.0)), 9.0);
        assert_eq!(evaluate_single(|base| ReciprocalNode::new(base, 4.0, 9.0)), 0.25);
        assert_eq!(evaluate_single(|base| InverseSquareRootNode::new(base, 4.0, 9.0)), 0.5);
        assert_eq!(evaluate_single(|base| InverseSquareRootNode::new(base, 0.0, 9.0)), 9.0);
        assert_eq!(evaluate_single(|base| NegateNode::new(base, 2.0)), -2.0);
        assert_eq!(evaluate_single(|base| AbsNode::new(base, -2.0)), 2.0);
        assert_eq!(evaluate_single(|base| FloorNode::new(base, 1.7)), 1.0);
        assert_eq!(evaluate_single(|base| CeilNode::new(base, 1.2)), 2.0);
        assert_eq!(evaluate_single(|base| RoundNode::new(base, -2.5)), -2.0);
        assert_eq!(evaluate_single(|base| TruncNode::new(base, -1.7)), -1.0);
        assert_eq!(evaluate_single(|base| FracNode::new(base, -1.25)), 0.75);
        assert_eq!(evaluate_single(|base| ExpNode::new(base, 0.0)), 1.0);
        assert_eq!(evaluate_single(|base| LogNode::new(base, 1.0)), 0.0);
        assert_eq!(evaluate_single(|base| SignNode::new(base, -3.0)), -1.0);
        assert_eq!(evaluate_single(|base| SignNode::new(base, 0.0)), 0.0);
    }

    #[test]
    fn test_log_x() {
        assert!((evaluate_single(|base| LogXNode::new(base, 1000.0, 10.0)) - 3.0).abs() < 1e-12);
        assert_eq!(evaluate_single(|base| LogXNode::new(base, 8.0, -2.0)), 0.0);
        assert_eq!(evaluate_single(|base| LogXNode::new(base, 0.0, 10.0)), 0.0);
    }

    #[test]
    fn test_binary_operators() {
        assert_eq!(evaluate_single(|base| SubtractNode::new(base, 5.0, 3.0)), 2.0);
        assert_eq!(evaluate_single(|base| MultiplyNode::new(base, 5.0, 3.0)), 15.0);
        assert_eq!(evaluate_single(|base| MinimumNode::new(base, 5.0, 3.0)), 3.0);
        assert_eq!(evaluate_single(|base| MaximumNode::new(base, 5.0, 3.0)), 5.0);
        assert_eq!(evaluate_single(|base| PowNode::new(base, 2.0, 10.0)), 1024.0);
        assert_eq!(evaluate_single(|base| DivideNode::new(base, 9.0, 3.0, -1.0)), 3.0);
    }

    #[test]
    fn test_divide_fallback_from_connection() {
        let mut graph = Graph::default();
        let fallback = graph.add_node("Fallback", |base| NegateNode::new(base, 7.0));
        let divide = graph.add_node("Divide", |base| DivideNode::new(base, 1.0, 0.0, 0.0));
        graph
            .connect(
                OutputRef::new(fallback, NegateNode::RESULT),
                InputRef::new(divide, DivideNode::FALLBACK),
            )
            .unwrap();
        assert_eq!(result_of(&graph, divide, DivideNode::RESULT), -7.0);
    }

    #[test]
    fn test_sum_with_dynamic_pins() {
        let mut graph = Graph::default();
        let sum = graph.add_node("Sum", SumNode::new);
        let three = graph.add_node("Three", |base| AddNode::new(base, 1.0, 2.0));
        graph.edit_node::<SumNode, _>(sum, |node| node.values = vec![1.0, 2.0]);
        graph.add_pins(sum);
        graph
            .connect(OutputRef::new(three, AddNode::RESULT), InputRef::new(sum, SumNode::element(2)))
            .unwrap();
        assert_eq!(result_of(&graph, sum, SumNode::SUM), 6.0);

        graph.remove_pins(sum);
        assert_eq!(result_of(&graph, sum, SumNode::SUM), 3.0);
        assert!(graph.remove_pins(sum).is_empty());
    }

    #[test]
    fn test_registry_contains_every_node() {
        let mut registry = NodeRegistry::new();
        register_math_nodes(&mut registry);
        assert_eq!(registry.types_in_category(MATH_CATEGORY).count(), 24);

        let mut graph = Graph::default();
        let node = graph
            .add_node_from_registry(&registry, "DataflowMathLogXNode", "LogX")
            .unwrap();
        assert_eq!(graph.node_as::<LogXNode>(node).map(|node| node.log_base), Some(10.0));
        assert!(graph.add_node_from_registry(&registry, "Missing", "Missing").is_err());
    }

    #[test]
    fn test_value_hash_tracks_properties() {
        let mut base = NodeBase::new("Add");
        let first = AddNode::new(&mut base, 1.0, 2.0);
        let mut second = first.clone();
        assert_eq!(first.value_hash(), second.value_hash());
        second.b = 3.0;
        assert_ne!(first.value_hash(), second.value_hash());
    }
}
