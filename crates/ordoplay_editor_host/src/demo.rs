// SPDX-License-Identifier: MIT OR Apache-2.0
//! Demo workloads driven by the host.

use ordoplay_data_storage::{
    Column, ColumnType, CompatibleObject, DataStorageError, Environment, EnvironmentSettings, ObjectColumn, ObjectId,
    ObjectType, QueryDescription, QueryError, TickGroupName, TickPhase, TransactionError, TypeColumn,
};
use ordoplay_dataflow::math::{AddNode, DivideNode, SquareNode};
use ordoplay_dataflow::{
    CacheKey, ConnectionError, Context, ContextCache, ContextExt, ContextKind, ContextSingle, ContextThreaded,
    DataflowSettings, Graph, InputRef, OutputRef,
};
use thiserror::Error;

/// Demo failures
#[derive(Debug, Error)]
pub enum DemoError {
    /// Graph could not be wired
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Table registration failed
    #[error(transparent)]
    Storage(#[from] DataStorageError),

    /// Query registration failed
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Undo history misuse
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Results of the dataflow demo
#[derive(Debug, Clone, PartialEq)]
pub struct DataflowReport {
    /// `(2 + 3)^2`
    pub square: f64,
    /// `(2 + 4)^2` after editing the add node
    pub square_after_edit: f64,
    /// `10 / 0` with fallback
    pub divide: f64,
}

fn read_outputs(context: &dyn Context, outputs: &[OutputRef]) -> Vec<f64> {
    outputs
        .iter()
        .map(|output| context.get_data(CacheKey::for_output(output.node, output.key), f64::NAN))
        .collect()
}

fn evaluate(
    graph: &Graph,
    cache: ContextCache,
    settings: &DataflowSettings,
    outputs: &[OutputRef],
) -> (Vec<f64>, ContextCache) {
    match settings.context {
        ContextKind::Single => {
            let context = ContextSingle::with_cache(graph, cache);
            for output in outputs {
                context.evaluate(output.node, Some(output.key));
            }
            let values = read_outputs(&context, outputs);
            (values, context.into_cache())
        }
        ContextKind::Threaded => {
            let context = ContextThreaded::with_cache(graph, cache);
            context.evaluate_outputs_parallel(outputs, settings.worker_count());
            let values = read_outputs(&context, outputs);
            (values, context.into_cache())
        }
    }
}

/// Build a small math graph, evaluate it, edit it and evaluate again
pub fn run_dataflow(settings: &DataflowSettings) -> Result<DataflowReport, DemoError> {
    let mut graph = Graph::new("Host demo");
    let add = graph.add_node("Add", |base| AddNode::new(base, 2.0, 3.0));
    let square = graph.add_node("Square", |base| SquareNode::new(base, 0.0));
    let divide = graph.add_node("Divide", |base| DivideNode::new(base, 10.0, 0.0, -1.0));
    graph.connect(OutputRef::new(add, AddNode::RESULT), InputRef::new(square, SquareNode::A))?;
    if settings.validate_before_evaluation && !graph.validate_connections() {
        tracing::warn!(graph = "Host demo", "Graph has connection problems");
    }

    let outputs = [
        OutputRef::new(square, SquareNode::RESULT),
        OutputRef::new(divide, DivideNode::RESULT),
    ];
    let (first, cache) = evaluate(&graph, ContextCache::new(), settings, &outputs);
    tracing::info!(context = ?settings.context, square = first[0], divide = first[1], "Evaluated graph");

    graph.edit_node::<AddNode, _>(add, |node| node.b = 4.0);
    let (second, cache) = evaluate(&graph, cache, settings, &outputs[..1]);
    tracing::info!(square = second[0], cached = cache.len(), "Evaluated edited graph");

    Ok(DataflowReport {
        square: first[0],
        square_after_edit: second[0],
        divide: first[1],
    })
}

/// Position along one axis
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Position(pub f64);

impl Column for Position {}

/// Units moved per cycle
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Velocity(pub f64);

impl Column for Velocity {}

/// Shared counters written by the movement processor
#[derive(Debug, Default)]
pub struct MovementStats {
    /// Rows moved across all cycles
    pub rows_moved: usize,
}

/// Results of the environment demo
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentReport {
    /// Final position of every actor
    pub positions: Vec<(ObjectId, f64)>,
    /// Rows the movement processor visited
    pub rows_moved: usize,
    /// Update cycles run
    pub cycles: u64,
}

/// Mirror two actors into an environment, move them for `cycles` ticks,
/// then delete one and undo the deletion
pub fn run_environment(settings: &EnvironmentSettings, cycles: u32) -> Result<EnvironmentReport, DemoError> {
    let mut environment = Environment::new(settings.clone())?;
    let actor = ObjectType::new("Actor");
    let storage = environment.storage_mut();
    let actors = storage.register_table(
        &[
            ColumnType::of::<ObjectColumn>(),
            ColumnType::of::<TypeColumn>(),
            ColumnType::of::<Position>(),
            ColumnType::of::<Velocity>(),
        ],
        Some("Editor_Actors"),
    )?;
    storage.register_dependency(MovementStats::default());
    storage.register_query(
        QueryDescription::select()
            .read::<Velocity>()
            .write::<Position>()
            .write_dependency::<MovementStats>()
            .processor(TickPhase::PrePhysics, TickGroupName::UPDATE)
            .named("Move actors")
            .function(|context| {
                let moved = match context.read_and_write::<Velocity, Position>() {
                    Some((velocities, positions)) => {
                        for (position, velocity) in positions.iter_mut().zip(velocities) {
                            position.0 += velocity.0;
                        }
                        positions.len()
                    }
                    None => 0,
                };
                if let Some(stats) = context.dependency_mut::<MovementStats>() {
                    stats.rows_moved += moved;
                }
            }),
    )?;
    environment
        .compatibility_mut()
        .register_type_table_association(&actor, actors);

    let ids = [ObjectId(1), ObjectId(2)];
    environment.begin_transaction("Spawn actors")?;
    for id in ids {
        environment.add_compatible_object(&CompatibleObject::new(id, &actor));
    }
    environment.end_transaction()?;
    environment.tick();

    for (speed, id) in (1..).map(f64::from).zip(ids) {
        if let Some(row) = environment.find_row_with_compatible_object(id) {
            environment.storage_mut().add_column_data(row, Velocity(speed));
        }
    }
    for _ in 0..cycles {
        environment.tick();
    }

    environment.begin_transaction("Delete actor")?;
    environment.remove_compatible_object(ids[1]);
    environment.end_transaction()?;
    environment.tick();
    tracing::info!(alive = environment.find_row_with_compatible_object(ids[1]).is_some(), "Deleted actor");

    let undone = environment.undo()?;
    environment.tick();
    tracing::info!(transaction = %undone, "Undid deletion");

    let storage = environment.storage();
    let positions = ids
        .iter()
        .filter_map(|&id| {
            let row = environment.find_row_with_compatible_object(id)?;
            Some((id, storage.get_column::<Position>(row)?.0))
        })
        .collect();
    let rows_moved = storage
        .dependency::<MovementStats>()
        .map_or(0, |stats| stats.rows_moved);
    Ok(EnvironmentReport {
        positions,
        rows_moved,
        cycles: storage.update_cycle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataflow_single() {
        let report = run_dataflow(&DataflowSettings::default()).unwrap();
        assert_eq!(report.square, 25.0);
        assert_eq!(report.square_after_edit, 36.0);
        assert_eq!(report.divide, -1.0);
    }

    #[test]
    fn test_dataflow_threaded() {
        let settings = DataflowSettings {
            context: ContextKind::Threaded,
            thread_count: 2,
            ..DataflowSettings::default()
        };
        let report = run_dataflow(&settings).unwrap();
        assert_eq!(report.square, 25.0);
        assert_eq!(report.square_after_edit, 36.0);
    }

    #[test]
    fn test_environment_restores_deleted_actor() {
        let report = run_environment(&EnvironmentSettings::default(), 3).unwrap();
        assert_eq!(report.positions, vec![(ObjectId(1), 5.0), (ObjectId(2), 8.0)]);
        assert_eq!(report.cycles, 6);
    }

    #[test]
    fn test_environment_without_command_buffer() {
        let mut settings = EnvironmentSettings::default();
        settings.compatibility.use_command_buffer = false;
        let report = run_environment(&settings, 2).unwrap();
        assert_eq!(report.positions, vec![(ObjectId(1), 4.0), (ObjectId(2), 6.0)]);
    }
}
