// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dataflow graph evaluation for `OrdoPlay` Editor.
//!
//! Nodes declare typed inputs and outputs and compute their outputs on
//! demand. Evaluation is lazy and memoized: every output owns a cache slot
//! stamped with the time it was written, and a node only runs again when it
//! has been invalidated after that time.
//!
//! ## Architecture
//!
//! - [`Graph`]: arena of nodes keyed by GUID, connections stored as handles
//! - [`DataflowNode`]: node behavior; immutable while evaluating
//! - [`Context`]: cache plus evaluation state, single or multi threaded
//! - [`EvaluationScope`]: what a node reads and writes while evaluating

pub mod cache;
pub mod connection;
pub mod context;
pub mod evaluation;
pub mod graph;
pub mod math;
pub mod node;
pub mod settings;
pub mod timestamp;
pub mod types;

pub use cache::{CacheElement, CacheError, CacheKey, CacheSerializerRegistry, CachedValue, ContextCache};
pub use connection::{Connection, ConnectionError, ConnectionKind, Input, InputKey, InputRef, Output, OutputKey, OutputRef};
pub use context::{evaluate_node, Context, ContextExt, ContextSingle, ContextThreaded};
pub use evaluation::{evaluate_terminals, EvaluationScope};
pub use graph::{CycleError, Graph, GraphError, InvalidationPauseGuard};
pub use node::{DataflowNode, NodeBase, NodeEntry, NodeId, NodeKind, NodeRegistry, NodeTypeInfo, Pin, PinDirection};
pub use settings::{ContextKind, DataflowSettings};
pub use timestamp::Timestamp;
pub use types::{DataType, DataflowValue, Name, TypePolicy};
