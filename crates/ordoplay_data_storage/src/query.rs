// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queries.
//!
//! A [`QueryDescription`] is compiled once into a predicate over table
//! compositions and then either run on demand or scheduled as a processor,
//! an observer or a phase preamble/postamble.

use crate::column::{Column, ColumnKey, ColumnType, ColumnValue, DynamicTag, TypedColumn};
use crate::error::QueryError;
use crate::row::RowHandle;
use crate::table::{Composition, Table};
use crate::tick_group::{TickGroupName, TickPhase};
use crate::DataStorage;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Handle to a registered query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryHandle(pub u64);

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({})", self.0)
    }
}

/// What running the query does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueryAction {
    /// Nothing; used by pure callbacks
    None,
    /// Visit matching rows
    #[default]
    Select,
    /// Count matching rows
    Count,
}

/// Access to a selected column or dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Must exist, read only
    ReadOnly,
    /// May be missing, read only
    OptionalReadOnly,
    /// Must exist, readable and writable
    ReadWrite,
}

/// A selected column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedColumn {
    /// Column
    pub column: ColumnType,
    /// Access mode
    pub access: AccessMode,
}

/// Row conditions beyond the selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    /// Every key must be present
    pub all: Vec<ColumnKey>,
    /// At least one key must be present, when not empty
    pub any: Vec<ColumnKey>,
    /// No key may be present
    pub none: Vec<ColumnKey>,
}

impl Conditions {
    /// Require `T`
    pub fn all<T: Column>(mut self) -> Self {
        self.all.push(ColumnKey::of::<T>());
        self
    }

    /// Accept rows with `T` among the `any` set
    pub fn any<T: Column>(mut self) -> Self {
        self.any.push(ColumnKey::of::<T>());
        self
    }

    /// Reject rows with `T`
    pub fn none<T: Column>(mut self) -> Self {
        self.none.push(ColumnKey::of::<T>());
        self
    }

    /// Whether `composition` satisfies the conditions
    pub fn matches(&self, composition: &Composition) -> bool {
        self.all.iter().all(|key| composition.contains(key))
            && (self.any.is_empty() || self.any.iter().any(|key| composition.contains(key)))
            && !self.none.iter().any(|key| composition.contains(key))
    }
}

/// Declared access to a storage dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyAccess {
    /// Dependency type
    pub id: TypeId,
    /// Dependency type name
    pub name: &'static str,
    /// Access mode
    pub access: AccessMode,
}

/// Restricts matches to rows with a dynamic tag, optionally with one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTagFilter {
    /// Tag
    pub tag: DynamicTag,
    /// Required value; any value when `None`
    pub value: Option<Arc<str>>,
}

/// How the query is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallbackKind {
    /// Only run on request
    #[default]
    None,
    /// Runs every tick in its phase and group
    Processor,
    /// Runs for rows that gain the monitored column
    ObserverAdd,
    /// Runs for rows about to lose the monitored column
    ObserverRemove,
    /// Runs once at the start of its phase
    PhasePreamble,
    /// Runs once at the end of its phase
    PhasePostamble,
}

/// Scheduling of a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackDescription {
    /// Scheduling kind
    pub kind: CallbackKind,
    /// Name used in logs and listings
    pub name: String,
    /// Phase for processors and phase callbacks
    pub phase: TickPhase,
    /// Tick group for processors
    pub group: TickGroupName,
    /// Extra groups to run before
    pub before: Vec<TickGroupName>,
    /// Extra groups to run after
    pub after: Vec<TickGroupName>,
    /// Column watched by observers
    pub monitored: Option<ColumnType>,
    /// Run on the ticking thread
    pub force_main_thread: bool,
    /// Only run when activated under this name
    pub activation_name: Option<String>,
}

/// Function run by a query, once per matching table
pub type QueryFunction = Box<dyn FnMut(&mut QueryContext<'_>) + Send + Sync>;

/// Everything needed to compile a query
#[derive(Default)]
pub struct QueryDescription {
    /// What running the query does
    pub action: QueryAction,
    /// Selected columns
    pub selection: Vec<SelectedColumn>,
    /// Extra row conditions
    pub conditions: Conditions,
    /// Dynamic tag filters
    pub dynamic_tag_filters: Vec<DynamicTagFilter>,
    /// Storage dependencies
    pub dependencies: Vec<DependencyAccess>,
    /// Scheduling
    pub callback: CallbackDescription,
    /// Queries this one may run on single rows
    pub subqueries: Vec<QueryHandle>,
    function: Option<QueryFunction>,
}

impl QueryDescription {
    /// Query visiting matching rows
    pub fn select() -> Self {
        Self::default()
    }

    /// Query counting matching rows
    pub fn count() -> Self {
        Self {
            action: QueryAction::Count,
            ..Self::default()
        }
    }

    /// Query without row action, for phase callbacks
    pub fn empty() -> Self {
        Self {
            action: QueryAction::None,
            ..Self::default()
        }
    }

    fn select_column<T: Column>(mut self, access: AccessMode) -> Self {
        self.selection.push(SelectedColumn {
            column: ColumnType::of::<T>(),
            access,
        });
        self
    }

    /// Select `T` read only
    pub fn read<T: Column>(self) -> Self {
        self.select_column::<T>(AccessMode::ReadOnly)
    }

    /// Select `T` read only, tolerating tables without it
    pub fn read_optional<T: Column>(self) -> Self {
        self.select_column::<T>(AccessMode::OptionalReadOnly)
    }

    /// Select `T` read-write
    pub fn write<T: Column>(self) -> Self {
        self.select_column::<T>(AccessMode::ReadWrite)
    }

    /// Require `T`
    pub fn all_of<T: Column>(mut self) -> Self {
        self.conditions = self.conditions.all::<T>();
        self
    }

    /// Add `T` to the any-of set
    pub fn any_of<T: Column>(mut self) -> Self {
        self.conditions = self.conditions.any::<T>();
        self
    }

    /// Reject rows with `T`
    pub fn none_of<T: Column>(mut self) -> Self {
        self.conditions = self.conditions.none::<T>();
        self
    }

    /// Replace the conditions
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Only match rows carrying `tag`, with `value` when given
    pub fn dynamic_tag(mut self, tag: DynamicTag, value: Option<&str>) -> Self {
        self.dynamic_tag_filters.push(DynamicTagFilter {
            tag,
            value: value.map(Arc::from),
        });
        self
    }

    fn dependency<T: Any + Send + Sync>(mut self, access: AccessMode) -> Self {
        self.dependencies.push(DependencyAccess {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            access,
        });
        self
    }

    /// Read dependency `T`
    pub fn read_dependency<T: Any + Send + Sync>(self) -> Self {
        self.dependency::<T>(AccessMode::ReadOnly)
    }

    /// Read and write dependency `T`
    pub fn write_dependency<T: Any + Send + Sync>(self) -> Self {
        self.dependency::<T>(AccessMode::ReadWrite)
    }

    /// Allow running `query` on single rows from callbacks
    pub fn subquery(mut self, query: QueryHandle) -> Self {
        self.subqueries.push(query);
        self
    }

    /// Schedule as a processor in `group` of `phase`
    pub fn processor(mut self, phase: TickPhase, group: TickGroupName) -> Self {
        self.callback.kind = CallbackKind::Processor;
        self.callback.phase = phase;
        self.callback.group = group;
        self
    }

    /// Observe rows gaining `T`
    pub fn observe_add<T: Column>(mut self) -> Self {
        self.callback.kind = CallbackKind::ObserverAdd;
        self.callback.monitored = Some(ColumnType::of::<T>());
        self
    }

    /// Observe rows about to lose `T`
    pub fn observe_remove<T: Column>(mut self) -> Self {
        self.callback.kind = CallbackKind::ObserverRemove;
        self.callback.monitored = Some(ColumnType::of::<T>());
        self
    }

    /// Run once at the start of `phase`
    pub fn phase_preamble(mut self, phase: TickPhase) -> Self {
        self.callback.kind = CallbackKind::PhasePreamble;
        self.callback.phase = phase;
        self
    }

    /// Run once at the end of `phase`
    pub fn phase_postamble(mut self, phase: TickPhase) -> Self {
        self.callback.kind = CallbackKind::PhasePostamble;
        self.callback.phase = phase;
        self
    }

    /// Run before `group`, on top of the group's defaults
    pub fn before(mut self, group: TickGroupName) -> Self {
        self.callback.before.push(group);
        self
    }

    /// Run after `group`, on top of the group's defaults
    pub fn after(mut self, group: TickGroupName) -> Self {
        self.callback.after.push(group);
        self
    }

    /// Run on the ticking thread
    pub fn main_thread(mut self) -> Self {
        self.callback.force_main_thread = true;
        self
    }

    /// Only run after [`DataStorage::activate_queries`] with `name`
    pub fn activation(mut self, name: impl Into<String>) -> Self {
        self.callback.activation_name = Some(name.into());
        self
    }

    /// Name for logs
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.callback.name = name.into();
        self
    }

    /// Function run per matching table
    pub fn function(mut self, function: impl FnMut(&mut QueryContext<'_>) + Send + Sync + 'static) -> Self {
        self.function = Some(Box::new(function));
        self
    }

    /// Whether a function is bound
    pub fn has_function(&self) -> bool {
        self.function.is_some()
    }

    fn display_name(&self) -> String {
        if self.callback.name.is_empty() {
            String::from("<unnamed>")
        } else {
            self.callback.name.clone()
        }
    }
}

impl fmt::Debug for QueryDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescription")
            .field("action", &self.action)
            .field("selection", &self.selection)
            .field("conditions", &self.conditions)
            .field("dynamic_tag_filters", &self.dynamic_tag_filters)
            .field("callback", &self.callback)
            .field("has_function", &self.function.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of running a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryCompletion {
    /// Every matching row was visited
    Fully,
    /// Some rows were visited; reserved for interruptible execution
    Partially,
    /// The action or callback combination cannot run this way
    Unsupported,
    /// The query does not exist
    Unavailable,
}

/// Rows counted or visited plus completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows counted or visited
    pub count: u32,
    /// Completion status
    pub completion: QueryCompletion,
}

impl QueryResult {
    pub(crate) fn fully(count: usize) -> Self {
        Self {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            completion: QueryCompletion::Fully,
        }
    }

    pub(crate) fn with(completion: QueryCompletion) -> Self {
        Self { count: 0, completion }
    }
}

/// Values registered on the storage and shared with query callbacks
#[derive(Default)]
pub struct Dependencies {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Dependencies {
    pub(crate) fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub(crate) fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub(crate) fn contains(&self, id: TypeId) -> bool {
        self.values.contains_key(&id)
    }

    /// Dependency `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    /// Dependency `T`, mutably
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values.get_mut(&TypeId::of::<T>())?.downcast_mut::<T>()
    }
}

/// Structural change requested from inside a query callback
pub enum QueryCommand {
    /// Add columns
    AddColumns(RowHandle, Vec<ColumnKey>),
    /// Remove columns
    RemoveColumns(RowHandle, Vec<ColumnKey>),
    /// Add a column with a value
    AddColumnData(RowHandle, Box<dyn ColumnValue>),
    /// Remove a row
    RemoveRow(RowHandle),
    /// Arbitrary work against the storage
    Custom(Box<dyn FnOnce(&mut DataStorage) + Send>),
}

impl fmt::Debug for QueryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumns(row, columns) => write!(f, "AddColumns({row}, {columns:?})"),
            Self::RemoveColumns(row, columns) => write!(f, "RemoveColumns({row}, {columns:?})"),
            Self::AddColumnData(row, value) => write!(f, "AddColumnData({row}, {value:?})"),
            Self::RemoveRow(row) => write!(f, "RemoveRow({row})"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// What a query function sees: a run of rows in one table, the declared
/// dependencies and a queue for structural changes
pub struct QueryContext<'a> {
    table: Option<&'a mut Table>,
    range: Range<usize>,
    description: &'a QueryDescription,
    dependencies: &'a mut Dependencies,
    commands: &'a mut Vec<QueryCommand>,
    update_cycle: u64,
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(
        table: Option<&'a mut Table>,
        range: Range<usize>,
        description: &'a QueryDescription,
        dependencies: &'a mut Dependencies,
        commands: &'a mut Vec<QueryCommand>,
        update_cycle: u64,
    ) -> Self {
        Self {
            table,
            range,
            description,
            dependencies,
            commands,
            update_cycle,
        }
    }

    /// Rows in scope
    pub fn rows(&self) -> &[RowHandle] {
        match self.table.as_deref() {
            Some(table) => table.rows().get(self.range.clone()).unwrap_or_default(),
            None => &[],
        }
    }

    /// Number of rows in scope
    pub fn row_count(&self) -> usize {
        self.range.len()
    }

    /// Current update cycle
    pub fn update_cycle(&self) -> u64 {
        self.update_cycle
    }

    /// Composition of the table in scope
    pub fn composition(&self) -> Option<&Composition> {
        self.table.as_deref().map(Table::composition)
    }

    /// Whether the rows in scope carry `T`
    pub fn has_column<T: Column>(&self) -> bool {
        self.composition()
            .is_some_and(|composition| composition.contains(&ColumnKey::of::<T>()))
    }

    /// Subqueries declared by the description
    pub fn subqueries(&self) -> &[QueryHandle] {
        &self.description.subqueries
    }

    fn access(&self, column: ColumnType) -> Option<AccessMode> {
        let access = self
            .description
            .selection
            .iter()
            .find(|selected| selected.column == column)
            .map(|selected| selected.access);
        if access.is_none() {
            tracing::debug!(query = %self.description.callback.name, column = %column, "Column not selected by query");
        }
        access
    }

    /// Values of `T` for the rows in scope
    pub fn column<T: Column>(&self) -> Option<&[T]> {
        self.access(ColumnType::of::<T>())?;
        let values = self.table.as_deref()?.column::<T>()?;
        values.get(self.range.clone())
    }

    /// Writable values of `T` for the rows in scope
    pub fn column_mut<T: Column>(&mut self) -> Option<&mut [T]> {
        if self.access(ColumnType::of::<T>())? != AccessMode::ReadWrite {
            tracing::debug!(column = std::any::type_name::<T>(), "Column selected read only");
            return None;
        }
        let range = self.range.clone();
        let values = self.table.as_deref_mut()?.column_mut::<T>()?;
        values.get_mut(range)
    }

    /// Read `R` while writing `W` for the rows in scope
    pub fn read_and_write<R: Column, W: Column>(&mut self) -> Option<(&[R], &mut [W])> {
        let (read, write) = (ColumnType::of::<R>(), ColumnType::of::<W>());
        if read == write {
            return None;
        }
        self.access(read)?;
        if self.access(write)? != AccessMode::ReadWrite {
            return None;
        }
        let range = self.range.clone();
        let table = self.table.as_deref_mut()?;
        let read_position = table.column_position(read)?;
        let write_position = table.column_position(write)?;
        let columns = table.column_data_mut();
        let (read_data, write_data) = if read_position < write_position {
            let (head, tail) = columns.split_at_mut(write_position);
            (&head[read_position], &mut tail[0])
        } else {
            let (head, tail) = columns.split_at_mut(read_position);
            (&tail[0], &mut head[write_position])
        };
        let read_values = read_data.storage.as_any().downcast_ref::<TypedColumn<R>>()?;
        let write_values = write_data.storage.as_any_mut().downcast_mut::<TypedColumn<W>>()?;
        Some((
            read_values.values.get(range.clone())?,
            write_values.values.get_mut(range)?,
        ))
    }

    fn dependency_access(&self, id: TypeId) -> Option<AccessMode> {
        self.description
            .dependencies
            .iter()
            .find(|dependency| dependency.id == id)
            .map(|dependency| dependency.access)
    }

    /// Declared dependency `T`
    pub fn dependency<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.dependency_access(TypeId::of::<T>())?;
        self.dependencies.get::<T>()
    }

    /// Declared writable dependency `T`
    pub fn dependency_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        if self.dependency_access(TypeId::of::<T>())? != AccessMode::ReadWrite {
            return None;
        }
        self.dependencies.get_mut::<T>()
    }

    /// Queue adding tag or default-valued column `T` to `row`
    pub fn add_column<T: Column>(&mut self, row: RowHandle) {
        self.commands
            .push(QueryCommand::AddColumns(row, vec![ColumnKey::of::<T>()]));
    }

    /// Queue adding column `T` with `value` to `row`
    pub fn add_column_data<T: Column>(&mut self, row: RowHandle, value: T) {
        self.commands
            .push(QueryCommand::AddColumnData(row, Box::new(value)));
    }

    /// Queue removing `T` from `row`
    pub fn remove_column<T: Column>(&mut self, row: RowHandle) {
        self.commands
            .push(QueryCommand::RemoveColumns(row, vec![ColumnKey::of::<T>()]));
    }

    /// Queue adding several columns to `row`
    pub fn add_columns(&mut self, row: RowHandle, columns: &[ColumnType]) {
        let keys = columns.iter().copied().map(ColumnKey::Type).collect();
        self.commands.push(QueryCommand::AddColumns(row, keys));
    }

    /// Queue removing several columns from `row`
    pub fn remove_columns(&mut self, row: RowHandle, columns: &[ColumnType]) {
        let keys = columns.iter().copied().map(ColumnKey::Type).collect();
        self.commands.push(QueryCommand::RemoveColumns(row, keys));
    }

    /// Queue removing `row`
    pub fn remove_row(&mut self, row: RowHandle) {
        self.commands.push(QueryCommand::RemoveRow(row));
    }

    /// Queue work that needs the whole storage, such as running a subquery
    pub fn defer(&mut self, work: impl FnOnce(&mut DataStorage) + Send + 'static) {
        self.commands.push(QueryCommand::Custom(Box::new(work)));
    }
}

/// Compiled row predicate
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledQuery {
    required: Vec<ColumnKey>,
    conditions: Conditions,
    dynamic_tags: Vec<DynamicTagFilter>,
}

impl CompiledQuery {
    pub fn matches(&self, composition: &Composition) -> bool {
        self.required.iter().all(|key| composition.contains(key))
            && self.conditions.matches(composition)
            && self.dynamic_tags.iter().all(|filter| {
                composition.iter().any(|key| match key {
                    ColumnKey::DynamicTag { tag, value } => {
                        *tag == filter.tag && filter.value.as_ref().map_or(true, |wanted| wanted == value)
                    }
                    ColumnKey::Type(_) => false,
                })
            })
    }
}

pub(crate) struct QueryEntry {
    pub description: QueryDescription,
    pub function: Option<QueryFunction>,
    pub compiled: CompiledQuery,
    pub activation_count: u32,
}

impl QueryEntry {
    /// Whether a scheduled run may happen this cycle
    pub fn is_active(&self) -> bool {
        self.description.callback.activation_name.is_none() || self.activation_count > 0
    }
}

/// Registered queries and activation state
#[derive(Default)]
pub(crate) struct QueryStore {
    pub entries: IndexMap<QueryHandle, QueryEntry>,
    next: u64,
    activations: HashMap<String, Vec<QueryHandle>>,
    pending: Vec<String>,
    active: Vec<QueryHandle>,
}

impl QueryStore {
    pub fn register(
        &mut self,
        mut description: QueryDescription,
        dependencies: &Dependencies,
    ) -> Result<QueryHandle, QueryError> {
        let compiled = self.compile(&description, dependencies)?;
        let handle = QueryHandle(self.next);
        self.next += 1;
        if let Some(name) = &description.callback.activation_name {
            self.activations.entry(name.clone()).or_default().push(handle);
        }
        tracing::debug!(
            query = %description.display_name(),
            handle = %handle,
            kind = ?description.callback.kind,
            "Registered query"
        );
        let function = description.function.take();
        self.entries.insert(
            handle,
            QueryEntry {
                description,
                function,
                compiled,
                activation_count: 0,
            },
        );
        Ok(handle)
    }

    fn compile(&self, description: &QueryDescription, dependencies: &Dependencies) -> Result<CompiledQuery, QueryError> {
        let name = description.display_name();
        if description.action == QueryAction::Count && !description.selection.is_empty() {
            return Err(QueryError::CountWithSelection(name));
        }

        let mut required = Vec::new();
        for (position, selected) in description.selection.iter().enumerate() {
            if selected.column.is_tag() {
                return Err(QueryError::TagSelected {
                    query: name,
                    column: selected.column.name(),
                });
            }
            if description.selection[..position]
                .iter()
                .any(|earlier| earlier.column == selected.column)
            {
                return Err(QueryError::DuplicateSelection {
                    query: name,
                    column: selected.column.name(),
                });
            }
            if selected.access != AccessMode::OptionalReadOnly {
                required.push(ColumnKey::Type(selected.column));
            }
        }

        for (position, filter) in description.dynamic_tag_filters.iter().enumerate() {
            if description.dynamic_tag_filters[..position]
                .iter()
                .any(|earlier| earlier.tag == filter.tag)
            {
                return Err(QueryError::DuplicateDynamicTagFilter {
                    query: name,
                    tag: filter.tag.name().to_string(),
                });
            }
        }

        if let Some(missing) = description
            .dependencies
            .iter()
            .find(|dependency| !dependencies.contains(dependency.id))
        {
            return Err(QueryError::UnknownDependency {
                query: name,
                dependency: missing.name,
            });
        }

        if let Some(dead) = description
            .subqueries
            .iter()
            .find(|subquery| !self.entries.contains_key(*subquery))
        {
            return Err(QueryError::InvalidSubquery {
                query: name,
                subquery: *dead,
            });
        }

        let kind = description.callback.kind;
        if kind != CallbackKind::None && description.function.is_none() {
            return Err(QueryError::MissingFunction(name));
        }
        if matches!(kind, CallbackKind::ObserverAdd | CallbackKind::ObserverRemove)
            && description.callback.monitored.is_none()
        {
            return Err(QueryError::MissingMonitoredColumn(name));
        }

        Ok(CompiledQuery {
            required,
            conditions: description.conditions.clone(),
            dynamic_tags: description.dynamic_tag_filters.clone(),
        })
    }

    pub fn unregister(&mut self, handle: QueryHandle) -> bool {
        let Some(entry) = self.entries.shift_remove(&handle) else {
            return false;
        };
        if let Some(name) = &entry.description.callback.activation_name {
            if let Some(handles) = self.activations.get_mut(name) {
                handles.retain(|registered| *registered != handle);
            }
        }
        self.active.retain(|active| *active != handle);
        tracing::debug!(query = %entry.description.display_name(), handle = %handle, "Unregistered query");
        true
    }

    pub fn activate(&mut self, name: &str) {
        if !self.pending.iter().any(|pending| pending == name) {
            self.pending.push(name.to_string());
        }
    }

    /// Cycle boundary: last cycle's activations expire, pending ones start
    pub fn advance_activations(&mut self) {
        for handle in self.active.drain(..) {
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.activation_count = entry.activation_count.saturating_sub(1);
            }
        }
        for name in self.pending.drain(..) {
            let Some(handles) = self.activations.get(&name) else {
                tracing::debug!(activation = %name, "No queries registered for activation");
                continue;
            };
            for handle in handles {
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.activation_count = 1;
                    self.active.push(*handle);
                }
            }
        }
    }

    /// Handles of queries with `kind` in registration order
    pub fn handles_of_kind(&self, kind: CallbackKind) -> Vec<QueryHandle> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.description.callback.kind == kind)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn list_callbacks(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.description.callback.kind != CallbackKind::None)
            .map(|(handle, entry)| {
                let callback = &entry.description.callback;
                let mut line = format!(
                    "{handle} {} [{:?}] phase={:?} group={}",
                    entry.description.display_name(),
                    callback.kind,
                    callback.phase,
                    callback.group
                );
                if let Some(monitored) = callback.monitored {
                    line.push_str(&format!(" monitors={monitored}"));
                }
                if let Some(activation) = &callback.activation_name {
                    line.push_str(&format!(" activation={activation}"));
                }
                if callback.force_main_thread {
                    line.push_str(" main-thread");
                }
                line
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnKind;

    #[derive(Debug, Default, Clone)]
    struct Position(f32);
    impl Column for Position {}

    #[derive(Debug, Default, Clone)]
    struct Velocity(f32);
    impl Column for Velocity {}

    #[derive(Default, Clone)]
    struct Hidden;
    impl Column for Hidden {
        const KIND: ColumnKind = ColumnKind::Tag;
    }

    fn composition(keys: &[ColumnKey]) -> Composition {
        keys.iter().cloned().collect()
    }

    #[test]
    fn test_conditions() {
        let conditions = Conditions::default().all::<Position>().none::<Hidden>();
        assert!(conditions.matches(&composition(&[ColumnKey::of::<Position>()])));
        assert!(!conditions.matches(&composition(&[
            ColumnKey::of::<Position>(),
            ColumnKey::of::<Hidden>()
        ])));
        let any = Conditions::default().any::<Position>().any::<Velocity>();
        assert!(any.matches(&composition(&[ColumnKey::of::<Velocity>()])));
        assert!(!any.matches(&composition(&[ColumnKey::of::<Hidden>()])));
    }

    #[test]
    fn test_compile_rejects_invalid_descriptions() {
        let mut store = QueryStore::default();
        let dependencies = Dependencies::default();

        let count = QueryDescription::count().read::<Position>().named("count");
        assert_eq!(
            store.register(count, &dependencies).unwrap_err(),
            QueryError::CountWithSelection("count".into())
        );

        let tag = QueryDescription::select().read::<Hidden>();
        assert!(matches!(
            store.register(tag, &dependencies),
            Err(QueryError::TagSelected { .. })
        ));

        let processor = QueryDescription::select()
            .read::<Position>()
            .processor(TickPhase::PrePhysics, TickGroupName::UPDATE);
        assert!(matches!(
            store.register(processor, &dependencies),
            Err(QueryError::MissingFunction(_))
        ));

        let dependency = QueryDescription::select().read_dependency::<String>();
        assert!(matches!(
            store.register(dependency, &dependencies),
            Err(QueryError::UnknownDependency { .. })
        ));

        let subquery = QueryDescription::select().subquery(QueryHandle(99));
        assert!(matches!(
            store.register(subquery, &dependencies),
            Err(QueryError::InvalidSubquery { .. })
        ));

        let filters = QueryDescription::select()
            .dynamic_tag(DynamicTag::new("Layer"), None)
            .dynamic_tag(DynamicTag::new("Layer"), Some("Top"));
        assert!(matches!(
            store.register(filters, &dependencies),
            Err(QueryError::DuplicateDynamicTagFilter { .. })
        ));

        assert!(store.entries.is_empty());
    }

    #[test]
    fn test_subquery_must_be_registered() {
        let mut store = QueryStore::default();
        let dependencies = Dependencies::default();
        let inner = store
            .register(QueryDescription::select().read::<Position>(), &dependencies)
            .unwrap();
        let outer = store
            .register(QueryDescription::select().read::<Velocity>().subquery(inner), &dependencies)
            .unwrap();
        assert_ne!(outer, inner);

        assert!(store.unregister(inner));
        assert!(matches!(
            store.register(QueryDescription::select().subquery(inner), &dependencies),
            Err(QueryError::InvalidSubquery { subquery, .. }) if subquery == inner
        ));
    }

    #[test]
    fn test_optional_selection_not_required() {
        let mut store = QueryStore::default();
        let handle = store
            .register(
                QueryDescription::select().read::<Position>().read_optional::<Velocity>(),
                &Dependencies::default(),
            )
            .unwrap();
        let compiled = &store.entries[&handle].compiled;
        assert!(compiled.matches(&composition(&[ColumnKey::of::<Position>()])));
        assert!(!compiled.matches(&composition(&[ColumnKey::of::<Velocity>()])));
    }

    #[test]
    fn test_dynamic_tag_filter() {
        let mut store = QueryStore::default();
        let handle = store
            .register(
                QueryDescription::select().dynamic_tag(DynamicTag::new("Layer"), Some("Top")),
                &Dependencies::default(),
            )
            .unwrap();
        let compiled = &store.entries[&handle].compiled;
        let top = ColumnKey::DynamicTag {
            tag: DynamicTag::new("Layer"),
            value: Arc::from("Top"),
        };
        let bottom = ColumnKey::DynamicTag {
            tag: DynamicTag::new("Layer"),
            value: Arc::from("Bottom"),
        };
        assert!(compiled.matches(&composition(&[top])));
        assert!(!compiled.matches(&composition(&[bottom])));
    }

    #[test]
    fn test_activation_lifecycle() {
        let mut store = QueryStore::default();
        let handle = store
            .register(
                QueryDescription::select().activation("refresh"),
                &Dependencies::default(),
            )
            .unwrap();
        assert!(!store.entries[&handle].is_active());
        store.activate("refresh");
        store.advance_activations();
        assert!(store.entries[&handle].is_active());
        store.advance_activations();
        assert!(!store.entries[&handle].is_active());
    }
}
