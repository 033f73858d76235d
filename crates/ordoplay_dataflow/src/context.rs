// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evaluation contexts.
//!
//! A context owns the cache for one evaluation of a [`Graph`]. The graph and
//! its nodes are only read during evaluation, so several contexts can
//! evaluate the same graph at once. [`ContextSingle`] is for one thread;
//! [`ContextThreaded`] serializes work per output and lets independent
//! outputs evaluate in parallel.

use crate::cache::{self, CacheElement, CacheKey, CacheSerializerRegistry, CachedValue, ContextCache, TypedCacheElement};
use crate::connection::{OutputKey, OutputRef};
use crate::evaluation::EvaluationScope;
use crate::graph::Graph;
use crate::node::NodeId;
use crate::timestamp::Timestamp;
use crate::types::DataflowValue;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Cache and scheduling state for evaluating a graph
pub trait Context {
    /// Graph being evaluated
    fn graph(&self) -> &Graph;

    /// Current evaluation timestamp
    fn timestamp(&self) -> Timestamp;

    /// Set the evaluation timestamp
    fn set_timestamp(&self, timestamp: Timestamp);

    /// Store an element. Returns whether it was stored.
    fn set_data_element(&self, key: CacheKey, element: CacheElement) -> bool;

    /// Typed element at `key`, following references
    fn data_element(&self, key: CacheKey) -> Option<TypedCacheElement>;

    /// Whether `key` holds data written at or after `required`
    fn has_data(&self, key: CacheKey, required: Timestamp) -> bool;

    /// Push an in-flight output. Returns `false` if it is already on the stack.
    fn push_callstack(&self, key: CacheKey) -> bool;

    /// Pop an in-flight output
    fn pop_callstack(&self, key: CacheKey);

    /// Make sure `output` has a value, evaluating its node when stale.
    /// Returns whether a value is available afterwards.
    fn evaluate_output(&self, output: OutputRef) -> bool;

    /// Drop every cached entry
    fn clear_cache(&self);

    /// Number of cache slots
    fn cache_len(&self) -> usize;

    /// Persist typed entries that have a registered serializer
    fn save_cache(&self, serializers: &CacheSerializerRegistry) -> cache::Result<Vec<u8>>;

    /// Restore persisted entries whose producing node still exists with the
    /// same value hash. Returns the number of restored entries.
    fn load_cache(&self, bytes: &[u8], serializers: &CacheSerializerRegistry) -> cache::Result<usize>;
}

/// Typed accessors over any [`Context`]
pub trait ContextExt: Context {
    /// Store a typed value
    fn set_data<T: DataflowValue>(
        &self,
        key: CacheKey,
        value: T,
        node_guid: NodeId,
        node_hash: u64,
        timestamp: Timestamp,
    ) -> bool {
        self.set_data_element(
            key,
            CacheElement::typed(CachedValue::new(value), node_guid, node_hash, timestamp),
        )
    }

    /// Read a typed value; a miss or a type mismatch returns `default`
    fn get_data<T: DataflowValue>(&self, key: CacheKey, default: T) -> T {
        self.data_element(key)
            .and_then(|element| element.value.get::<T>())
            .unwrap_or(default)
    }

    /// Make `key` an alias of `referenced`
    fn set_data_reference(&self, key: CacheKey, referenced: CacheKey, timestamp: Timestamp) -> bool {
        if key == referenced {
            tracing::warn!(key = %key, "Refusing to make a cache entry reference itself");
            return false;
        }
        self.set_data_element(key, CacheElement::reference(referenced, timestamp))
    }
}

impl<C: Context + ?Sized> ContextExt for C {}

/// Pops the callstack when an evaluation frame ends
struct CallstackFrame<'a> {
    context: &'a dyn Context,
    key: CacheKey,
}

impl Drop for CallstackFrame<'_> {
    fn drop(&mut self) {
        self.context.pop_callstack(self.key);
    }
}

/// Per-output memoization check shared by every context kind
fn evaluate_output_impl(context: &dyn Context, output: OutputRef) -> bool {
    let Some(entry) = context.graph().node(output.node) else {
        tracing::warn!(node = ?output.node, "Evaluating an output of a missing node");
        return false;
    };
    let Some(connection) = entry.base.output(output.key) else {
        tracing::error!(node = %entry.base.name, output = ?output.key, "Evaluating an unregistered output");
        return false;
    };
    let key = CacheKey::for_output(output.node, output.key);
    if !context.push_callstack(key) {
        tracing::warn!(
            node = %entry.base.name,
            output = %connection.name,
            "Loop detected while evaluating dataflow graph"
        );
        return false;
    }
    let _frame = CallstackFrame { context, key };

    if entry.base.is_active() {
        if !context.has_data(key, entry.base.last_modified()) {
            let scope = EvaluationScope::new(context, entry);
            entry.node.evaluate(&scope, Some(output.key));
            if !context.has_data(key, Timestamp::INVALID) {
                tracing::debug!(node = %entry.base.name, output = %connection.name, "Node did not set its output");
            }
        }
    } else if let Some(passthrough) = connection.passthrough() {
        if !context.has_data(key, entry.base.last_modified()) {
            EvaluationScope::new(context, entry).forward_input(passthrough, output.key);
        }
    }

    context.has_data(key, Timestamp::INVALID)
}

/// Evaluate a node at a fresh timestamp.
///
/// `Some(output)` evaluates that output; `None` evaluates every output, or
/// runs the node once if it has none (terminal nodes).
pub fn evaluate_node(context: &dyn Context, node: NodeId, output: Option<OutputKey>) {
    context.set_timestamp(Timestamp::now());
    let Some(entry) = context.graph().node(node) else {
        tracing::warn!(node = ?node, "Evaluating a missing node");
        return;
    };
    match output {
        Some(key) => {
            context.evaluate_output(OutputRef::new(node, key));
        }
        None if entry.base.output_count() > 0 => {
            for key in entry.base.output_keys() {
                context.evaluate_output(OutputRef::new(node, key));
            }
        }
        None => {
            if entry.base.is_active() {
                entry.node.evaluate(&EvaluationScope::new(context, entry), None);
            }
        }
    }
}

/// Load a persisted cache and keep the entries still produced by `graph`
fn restore_cache(graph: &Graph, bytes: &[u8], serializers: &CacheSerializerRegistry) -> cache::Result<ContextCache> {
    let mut restored = ContextCache::load(bytes, serializers)?;
    let stale = restored.retain_matching(|guid, hash| {
        graph
            .node(guid)
            .is_some_and(|entry| entry.node.value_hash() == hash)
    });
    if stale > 0 {
        tracing::debug!(stale, "Dropped persisted cache entries from changed nodes");
    }
    Ok(restored)
}

/// Single-threaded context; evaluation recurses on the calling thread
pub struct ContextSingle<'g> {
    graph: &'g Graph,
    timestamp: Cell<Timestamp>,
    cache: RefCell<ContextCache>,
    callstack: RefCell<Vec<CacheKey>>,
}

impl<'g> ContextSingle<'g> {
    /// Create a context over `graph`
    pub fn new(graph: &'g Graph) -> Self {
        Self::with_cache(graph, ContextCache::new())
    }

    /// Create a context that continues from a cache of an earlier context
    pub fn with_cache(graph: &'g Graph, cache: ContextCache) -> Self {
        Self {
            graph,
            timestamp: Cell::new(Timestamp::INVALID),
            cache: RefCell::new(cache),
            callstack: RefCell::new(Vec::new()),
        }
    }

    /// Release the graph borrow, keeping the cache for a later context
    pub fn into_cache(self) -> ContextCache {
        self.cache.into_inner()
    }

    /// See [`evaluate_node`]
    pub fn evaluate(&self, node: NodeId, output: Option<OutputKey>) {
        evaluate_node(self, node, output);
    }
}

impl Context for ContextSingle<'_> {
    fn graph(&self) -> &Graph {
        self.graph
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp.get()
    }

    fn set_timestamp(&self, timestamp: Timestamp) {
        self.timestamp.set(timestamp);
    }

    fn set_data_element(&self, key: CacheKey, element: CacheElement) -> bool {
        self.cache.borrow_mut().insert(key, element);
        true
    }

    fn data_element(&self, key: CacheKey) -> Option<TypedCacheElement> {
        self.cache.borrow().resolve(key).cloned()
    }

    fn has_data(&self, key: CacheKey, required: Timestamp) -> bool {
        self.cache.borrow().has_data(key, required)
    }

    fn push_callstack(&self, key: CacheKey) -> bool {
        let mut callstack = self.callstack.borrow_mut();
        if callstack.contains(&key) {
            return false;
        }
        callstack.push(key);
        true
    }

    fn pop_callstack(&self, key: CacheKey) {
        let mut callstack = self.callstack.borrow_mut();
        if let Some(position) = callstack.iter().rposition(|existing| *existing == key) {
            callstack.remove(position);
        }
    }

    fn evaluate_output(&self, output: OutputRef) -> bool {
        evaluate_output_impl(self, output)
    }

    fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    fn cache_len(&self) -> usize {
        self.cache.borrow().len()
    }

    fn save_cache(&self, serializers: &CacheSerializerRegistry) -> cache::Result<Vec<u8>> {
        self.cache.borrow().save(serializers)
    }

    fn load_cache(&self, bytes: &[u8], serializers: &CacheSerializerRegistry) -> cache::Result<usize> {
        let restored = restore_cache(self.graph, bytes, serializers)?;
        Ok(self.cache.borrow_mut().merge(restored))
    }
}

/// Thread-safe context.
///
/// Each output is evaluated under its own reentrant lock, so two threads
/// asking for the same output evaluate it once while different outputs
/// proceed in parallel. Writes never replace an entry written at the same
/// or a newer timestamp.
pub struct ContextThreaded<'g> {
    graph: &'g Graph,
    timestamp: AtomicU64,
    cache: RwLock<ContextCache>,
    output_locks: Mutex<HashMap<CacheKey, Arc<ReentrantMutex<()>>>>,
    callstacks: Mutex<HashMap<ThreadId, Vec<CacheKey>>>,
}

impl<'g> ContextThreaded<'g> {
    /// Create a context over `graph`
    pub fn new(graph: &'g Graph) -> Self {
        Self::with_cache(graph, ContextCache::new())
    }

    /// Create a context that continues from a cache of an earlier context
    pub fn with_cache(graph: &'g Graph, cache: ContextCache) -> Self {
        Self {
            graph,
            timestamp: AtomicU64::new(Timestamp::INVALID.value()),
            cache: RwLock::new(cache),
            output_locks: Mutex::new(HashMap::new()),
            callstacks: Mutex::new(HashMap::new()),
        }
    }

    /// Release the graph borrow, keeping the cache for a later context
    pub fn into_cache(self) -> ContextCache {
        self.cache.into_inner()
    }

    /// See [`evaluate_node`]
    pub fn evaluate(&self, node: NodeId, output: Option<OutputKey>) {
        evaluate_node(self, node, output);
    }

    /// Evaluate `outputs` on up to `thread_count` scoped threads
    pub fn evaluate_outputs_parallel(&self, outputs: &[OutputRef], thread_count: usize) -> Vec<bool> {
        if outputs.is_empty() {
            return Vec::new();
        }
        self.set_timestamp(Timestamp::now());
        let chunk_size = outputs.len().div_ceil(thread_count.max(1));
        std::thread::scope(|scope| {
            let workers: Vec<_> = outputs
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|output| self.evaluate_output(*output))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| match worker.join() {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::error!("Dataflow evaluation worker panicked");
                        Vec::new()
                    }
                })
                .collect()
        })
    }

    fn output_lock(&self, key: CacheKey) -> Arc<ReentrantMutex<()>> {
        Arc::clone(self.output_locks.lock().entry(key).or_default())
    }
}

impl Context for ContextThreaded<'_> {
    fn graph(&self) -> &Graph {
        self.graph
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp(self.timestamp.load(Ordering::Acquire))
    }

    fn set_timestamp(&self, timestamp: Timestamp) {
        self.timestamp.fetch_max(timestamp.value(), Ordering::AcqRel);
    }

    fn set_data_element(&self, key: CacheKey, element: CacheElement) -> bool {
        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(key) {
            if existing.timestamp() >= element.timestamp() {
                tracing::trace!(key = %key, "Discarding cache write older than the stored entry");
                return false;
            }
        }
        cache.insert(key, element);
        true
    }

    fn data_element(&self, key: CacheKey) -> Option<TypedCacheElement> {
        self.cache.read().resolve(key).cloned()
    }

    fn has_data(&self, key: CacheKey, required: Timestamp) -> bool {
        self.cache.read().has_data(key, required)
    }

    fn push_callstack(&self, key: CacheKey) -> bool {
        let mut callstacks = self.callstacks.lock();
        let callstack = callstacks.entry(std::thread::current().id()).or_default();
        if callstack.contains(&key) {
            return false;
        }
        callstack.push(key);
        true
    }

    fn pop_callstack(&self, key: CacheKey) {
        let thread = std::thread::current().id();
        let mut callstacks = self.callstacks.lock();
        if let Some(callstack) = callstacks.get_mut(&thread) {
            if let Some(position) = callstack.iter().rposition(|existing| *existing == key) {
                callstack.remove(position);
            }
            if callstack.is_empty() {
                callstacks.remove(&thread);
            }
        }
    }

    fn evaluate_output(&self, output: OutputRef) -> bool {
        let key = CacheKey::for_output(output.node, output.key);
        let lock = self.output_lock(key);
        let _guard = lock.lock();
        evaluate_output_impl(self, output)
    }

    fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn save_cache(&self, serializers: &CacheSerializerRegistry) -> cache::Result<Vec<u8>> {
        self.cache.read().save(serializers)
    }

    fn load_cache(&self, bytes: &[u8], serializers: &CacheSerializerRegistry) -> cache::Result<usize> {
        let restored = restore_cache(self.graph, bytes, serializers)?;
        Ok(self.cache.write().merge(restored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{InputKey, InputRef};
    use crate::evaluation::EvaluationScope;
    use crate::math::{AddNode, DivideNode, SquareNode};
    use crate::node::{DataflowNode, NodeBase, NodeTypeInfo};
    use crate::types::DataType;
    use std::sync::atomic::AtomicUsize;

    static PAIR_INFO: NodeTypeInfo = NodeTypeInfo {
        type_name: "TestPair",
        display_name: "Pair",
        category: "Test",
        tooltip: "Writes two outputs per evaluation",
    };

    /// Sets both outputs from one evaluation and counts evaluations
    struct PairNode {
        value: f64,
        evaluations: Arc<AtomicUsize>,
    }

    impl PairNode {
        const VALUE: InputKey = InputKey::field(0);
        const FIRST: OutputKey = OutputKey(1);
        const SECOND: OutputKey = OutputKey(2);

        fn new(base: &mut NodeBase, evaluations: Arc<AtomicUsize>) -> Self {
            base.register_input(Self::VALUE, "Value", DataType::F64);
            base.register_output(Self::FIRST, "First", DataType::F64);
            base.register_output(Self::SECOND, "Second", DataType::F64);
            Self { value: 1.0, evaluations }
        }
    }

    impl DataflowNode for PairNode {
        fn type_info(&self) -> &'static NodeTypeInfo {
            &PAIR_INFO
        }

        fn evaluate(&self, scope: &EvaluationScope<'_>, _output: Option<OutputKey>) {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            let value = scope.get_value(Self::VALUE, self.value);
            scope.set_value(value, Self::FIRST);
            scope.set_value(value * 2.0, Self::SECOND);
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn pair_graph() -> (Graph, NodeId, Arc<AtomicUsize>) {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let mut graph = Graph::default();
        let counter = Arc::clone(&evaluations);
        let pair = graph.add_node("Pair", move |base| PairNode::new(base, counter));
        (graph, pair, evaluations)
    }

    #[test]
    fn test_memoization_evaluates_once_per_invalidation() {
        let (mut graph, pair, evaluations) = pair_graph();
        {
            let context = ContextSingle::new(&graph);
            context.evaluate(pair, None);
            context.evaluate(pair, None);
            context.evaluate(pair, Some(PairNode::SECOND));
            assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        }

        let context_cache = {
            let context = ContextSingle::new(&graph);
            context.evaluate(pair, None);
            context.save_cache(&CacheSerializerRegistry::with_builtin_types()).unwrap()
        };
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);

        graph.invalidate(pair, Timestamp::now());
        let context = ContextSingle::new(&graph);
        context.load_cache(&context_cache, &CacheSerializerRegistry::with_builtin_types()).unwrap();
        context.evaluate(pair, Some(PairNode::FIRST));
        context.evaluate(pair, Some(PairNode::SECOND));
        context.evaluate(pair, None);
        assert_eq!(evaluations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invalidation_forces_one_more_evaluation() {
        let (mut graph, pair, evaluations) = pair_graph();
        let first_key = CacheKey::for_output(pair, PairNode::FIRST);
        let second_key = CacheKey::for_output(pair, PairNode::SECOND);

        let context = ContextSingle::new(&graph);
        context.evaluate(pair, None);
        let cache = context.into_cache();

        // Carried cache, no invalidation: nothing runs
        let context = ContextSingle::with_cache(&graph, cache);
        context.evaluate(pair, None);
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(context.get_data(second_key, 0.0), 2.0);
        let cache = context.into_cache();

        graph.edit_node::<PairNode, _>(pair, |node| node.value = 5.0);
        let context = ContextThreaded::with_cache(&graph, cache);
        context.evaluate(pair, Some(PairNode::FIRST));
        context.evaluate(pair, Some(PairNode::SECOND));
        context.evaluate(pair, None);
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
        assert_eq!(context.get_data(first_key, 0.0), 5.0);
        assert_eq!(context.get_data(second_key, 0.0), 10.0);
    }

    #[test]
    fn test_persisted_entries_survive_only_for_unchanged_nodes() {
        let mut graph = Graph::default();
        let add = graph.add_node("Add", |base| AddNode::new(base, 1.0, 2.0));
        let key = CacheKey::for_output(add, AddNode::RESULT);
        let registry = CacheSerializerRegistry::with_builtin_types();

        let bytes = {
            let context = ContextSingle::new(&graph);
            context.evaluate(add, None);
            context.save_cache(&registry).unwrap()
        };

        {
            let context = ContextSingle::new(&graph);
            assert_eq!(context.load_cache(&bytes, &registry).unwrap(), 1);
            assert_eq!(context.get_data(key, 0.0), 3.0);
        }

        graph.edit_node::<AddNode, _>(add, |node| node.b = 10.0);
        let context = ContextSingle::new(&graph);
        assert_eq!(context.load_cache(&bytes, &registry).unwrap(), 0);
    }

    #[test]
    fn test_passthrough_reference_round_trip() {
        let graph = Graph::default();
        let context = ContextSingle::new(&graph);
        let (alias, target) = (CacheKey(10), CacheKey(20));
        let owner = NodeId::new();

        context.set_data_reference(alias, target, Timestamp::now());
        assert_eq!(context.get_data(alias, -1.0), -1.0);

        context.set_data(target, 4.0_f64, owner, 0, Timestamp::now());
        assert_eq!(context.get_data(alias, -1.0), 4.0);

        context.set_data(target, 9.0_f64, owner, 0, Timestamp::now());
        assert_eq!(context.get_data(alias, -1.0), 9.0);
    }

    #[test]
    fn test_get_data_miss_does_not_mutate() {
        let graph = Graph::default();
        let context = ContextSingle::new(&graph);
        assert_eq!(context.get_data(CacheKey(1), String::from("default")), "default");
        assert_eq!(context.cache_len(), 0);
    }

    #[derive(Clone)]
    struct Block {
        words: Vec<u64>,
        checksum: u64,
    }

    impl Block {
        fn new(seed: u64) -> Self {
            let words: Vec<u64> = (0..16_384).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            let checksum = words.iter().fold(0_u64, |sum, word| sum.wrapping_add(*word));
            Self { words, checksum }
        }

        fn is_intact(&self) -> bool {
            self.words.iter().fold(0_u64, |sum, word| sum.wrapping_add(*word)) == self.checksum
        }
    }

    impl DataflowValue for Block {
        fn data_type() -> DataType {
            DataType::Custom("Block".into())
        }
    }

    #[test]
    fn test_threaded_writes_do_not_clobber() {
        let graph = Graph::default();
        let context = ContextThreaded::new(&graph);
        let key = CacheKey(42);
        let timestamp = Timestamp::now();
        let owner = NodeId::new();

        let stored: Vec<bool> = std::thread::scope(|scope| {
            let writers: Vec<_> = (1..=2_u64)
                .map(|seed| {
                    let context = &context;
                    scope.spawn(move || context.set_data(key, Block::new(seed), owner, 0, timestamp))
                })
                .collect();
            writers.into_iter().map(|writer| writer.join().unwrap()).collect()
        });

        assert_eq!(stored.iter().filter(|stored| **stored).count(), 1);
        let winner = context.get_data(key, Block::new(0));
        assert!(winner.is_intact());
        assert_ne!(winner.checksum, Block::new(0).checksum);
    }

    #[test]
    fn test_threaded_parallel_outputs() {
        let mut graph = Graph::default();
        let divide = graph.add_node("Divide", |base| DivideNode::new(base, 10.0, 2.0, -1.0));
        let squares: Vec<NodeId> = (0..4)
            .map(|i| {
                let square = graph.add_node(format!("Square{i}"), |base| SquareNode::new(base, 0.0));
                graph
                    .connect(OutputRef::new(divide, DivideNode::RESULT), InputRef::new(square, SquareNode::A))
                    .unwrap();
                square
            })
            .collect();
        let outputs: Vec<OutputRef> = squares
            .iter()
            .map(|square| OutputRef::new(*square, SquareNode::RESULT))
            .collect();

        let context = ContextThreaded::new(&graph);
        let results = context.evaluate_outputs_parallel(&outputs, 4);
        assert_eq!(results, vec![true; 4]);
        for output in outputs {
            assert_eq!(context.get_data(CacheKey::for_output(output.node, output.key), 0.0), 25.0);
        }
    }

    #[test]
    fn test_cycle_is_reported_not_looped() {
        let mut graph = Graph::default();
        let first = graph.add_node("First", |base| SquareNode::new(base, 2.0));
        let second = graph.add_node("Second", |base| SquareNode::new(base, 3.0));
        graph
            .connect(OutputRef::new(first, SquareNode::RESULT), InputRef::new(second, SquareNode::A))
            .unwrap();
        graph
            .connect(OutputRef::new(second, SquareNode::RESULT), InputRef::new(first, SquareNode::A))
            .unwrap();

        let context = ContextSingle::new(&graph);
        context.evaluate(first, Some(SquareNode::RESULT));
        // The inner pull of `first` fails, so `second` reads its default and
        // `first` squares that result.
        let key = CacheKey::for_output(first, SquareNode::RESULT);
        assert!(context.has_data(key, Timestamp::INVALID));

        let threaded = ContextThreaded::new(&graph);
        threaded.evaluate(second, Some(SquareNode::RESULT));
        assert!(threaded.has_data(CacheKey::for_output(second, SquareNode::RESULT), Timestamp::INVALID));
    }

    #[test]
    fn test_inactive_node_forwards_passthrough() {
        let mut graph = Graph::default();
        let add = graph.add_node("Add", |base| AddNode::new(base, 1.0, 1.0));
        let square = graph.add_node("Square", |base| SquareNode::new(base, 0.0));
        graph
            .connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(square, SquareNode::A))
            .unwrap();
        graph.set_node_active(square, false);

        let context = ContextSingle::new(&graph);
        context.evaluate(square, Some(SquareNode::RESULT));
        let key = CacheKey::for_output(square, SquareNode::RESULT);
        assert_eq!(context.get_data(key, 0.0), 2.0);
    }
}
