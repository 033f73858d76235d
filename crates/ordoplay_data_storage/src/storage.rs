// SPDX-License-Identifier: MIT OR Apache-2.0
//! The table data storage.
//!
//! [`DataStorage`] owns the tables, the row allocator, the identity index,
//! registered queries and tick groups. Live rows change immediately; reserved
//! rows, and rows that already have queued changes, queue into the deferred
//! buffer which is replayed once the row is assigned to a table.

use crate::column::{Column, ColumnKey, ColumnType, ColumnValue, DynamicTag};
use crate::deferred::{apply_add_remove, DeferredCommand, DeferredCommands};
use crate::error::{DataStorageError, QueryError, Result};
use crate::index::{IndexHash, RowIndex};
use crate::query::{
    CallbackKind, CompiledQuery, Conditions, Dependencies, QueryAction, QueryCommand, QueryCompletion, QueryContext,
    QueryDescription, QueryEntry, QueryHandle, QueryResult, QueryStore,
};
use crate::row::{RowHandle, RowSlots, RowState};
use crate::settings::DataStorageSettings;
use crate::table::{two_tables_mut, Composition, Table, TableHandle};
use crate::tick_group::{GroupConstraints, TickGroupName, TickGroups, TickPhase};
use indexmap::IndexMap;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Callback run at the start or end of an update cycle
pub type StorageHook = Box<dyn FnMut(&mut DataStorage) + Send>;

/// Tables, rows and queries
pub struct DataStorage {
    settings: DataStorageSettings,
    tables: Vec<Table>,
    names: IndexMap<String, TableHandle>,
    archetypes: HashMap<Composition, TableHandle>,
    rows: RowSlots,
    index: RowIndex,
    deferred: DeferredCommands,
    queries: QueryStore,
    tick_groups: TickGroups,
    dependencies: Dependencies,
    dynamic_values: HashSet<Arc<str>>,
    pending_commands: Vec<QueryCommand>,
    applying_commands: bool,
    on_update: Vec<StorageHook>,
    on_update_completed: Vec<StorageHook>,
    update_cycle: u64,
}

impl Default for DataStorage {
    fn default() -> Self {
        Self::new(DataStorageSettings::default())
    }
}

impl DataStorage {
    /// Create an empty storage with the standard tick groups
    pub fn new(settings: DataStorageSettings) -> Self {
        Self {
            settings,
            tables: Vec::new(),
            names: IndexMap::new(),
            archetypes: HashMap::new(),
            rows: RowSlots::default(),
            index: RowIndex::default(),
            deferred: DeferredCommands::default(),
            queries: QueryStore::default(),
            tick_groups: TickGroups::with_defaults(),
            dependencies: Dependencies::default(),
            dynamic_values: HashSet::new(),
            pending_commands: Vec::new(),
            applying_commands: false,
            on_update: Vec::new(),
            on_update_completed: Vec::new(),
            update_cycle: 0,
        }
    }

    /// Storage settings
    pub fn settings(&self) -> &DataStorageSettings {
        &self.settings
    }

    /// Number of update cycles started so far
    pub fn update_cycle(&self) -> u64 {
        self.update_cycle
    }

    // ---- Tables ----

    /// Register a table with `columns`.
    ///
    /// Registering a name again with the same composition returns the
    /// existing table; a different composition is an error.
    pub fn register_table(&mut self, columns: &[ColumnType], name: Option<&str>) -> Result<TableHandle> {
        let composition = columns.iter().copied().map(ColumnKey::Type).collect();
        self.register_composition(composition, name)
    }

    /// Register a table with the composition of `source` plus `columns`
    pub fn register_table_from(
        &mut self,
        source: TableHandle,
        columns: &[ColumnType],
        name: Option<&str>,
    ) -> Result<TableHandle> {
        let mut composition = self
            .table(source)
            .ok_or(DataStorageError::UnknownTable(source))?
            .composition()
            .clone();
        composition.extend(columns.iter().copied().map(ColumnKey::Type));
        self.register_composition(composition, name)
    }

    fn register_composition(&mut self, composition: Composition, name: Option<&str>) -> Result<TableHandle> {
        if let Some(name) = name {
            if let Some(&existing) = self.names.get(name) {
                let same = self
                    .table(existing)
                    .is_some_and(|table| *table.composition() == composition);
                if same {
                    tracing::debug!(table = name, handle = %existing, "Table already registered");
                    return Ok(existing);
                }
                tracing::warn!(table = name, "Table already registered with a different composition");
                return Err(DataStorageError::TableAlreadyRegistered(name.to_string()));
            }
        }

        let handle = self.table_for(composition);
        if let Some(name) = name {
            self.names.insert(name.to_string(), handle);
            if let Some(table) = self.tables.get_mut(table_position(handle)) {
                if table.name().is_none() {
                    table.set_name(name.to_string());
                }
            }
            tracing::debug!(table = name, handle = %handle, "Registered table");
        }
        Ok(handle)
    }

    /// Table storing `composition`, created on demand
    fn table_for(&mut self, composition: Composition) -> TableHandle {
        if let Some(&handle) = self.archetypes.get(&composition) {
            return handle;
        }
        let handle = TableHandle(u32::try_from(self.tables.len()).unwrap_or(u32::MAX));
        tracing::trace!(handle = %handle, columns = composition.len(), "Created table");
        self.tables.push(Table::new(handle, None, composition.clone()));
        self.archetypes.insert(composition, handle);
        handle
    }

    /// Table registered under `name`
    pub fn find_table(&self, name: &str) -> Option<TableHandle> {
        self.names.get(name).copied()
    }

    /// Table by handle
    pub fn table(&self, handle: TableHandle) -> Option<&Table> {
        self.tables.get(table_position(handle))
    }

    /// Every table, named or not
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    // ---- Rows ----

    /// Hand out a row handle without a table
    pub fn reserve_row(&mut self) -> RowHandle {
        self.rows.reserve()
    }

    /// Reserve `count` rows
    pub fn batch_reserve_rows(&mut self, count: usize) -> Vec<RowHandle> {
        (0..count).map(|_| self.rows.reserve()).collect()
    }

    /// Add a row to `table`
    pub fn add_row(&mut self, table: TableHandle) -> Option<RowHandle> {
        if self.table(table).is_none() {
            tracing::debug!(table = %table, "Add row to unknown table");
            return None;
        }
        let row = self.rows.reserve();
        self.assign_row(row, table);
        self.apply_pending_commands();
        Some(row)
    }

    /// Place a reserved row in `table` and replay its queued changes
    pub fn add_reserved_row(&mut self, row: RowHandle, table: TableHandle) -> bool {
        let assigned = self.assign_reserved(row, table);
        self.apply_pending_commands();
        assigned
    }

    /// Add `count` rows to `table`, calling `on_created` for each
    pub fn batch_add_rows(
        &mut self,
        table: TableHandle,
        count: usize,
        mut on_created: impl FnMut(RowHandle),
    ) -> usize {
        if self.table(table).is_none() {
            tracing::debug!(table = %table, "Batch add rows to unknown table");
            return 0;
        }
        for _ in 0..count {
            let row = self.rows.reserve();
            self.assign_row(row, table);
            on_created(row);
        }
        self.apply_pending_commands();
        count
    }

    /// Place several reserved rows in `table`
    pub fn batch_add_reserved_rows(
        &mut self,
        table: TableHandle,
        rows: &[RowHandle],
        mut on_created: impl FnMut(RowHandle),
    ) -> usize {
        let mut added = 0;
        for &row in rows {
            if self.assign_reserved(row, table) {
                on_created(row);
                added += 1;
            }
        }
        self.apply_pending_commands();
        added
    }

    fn assign_reserved(&mut self, row: RowHandle, table: TableHandle) -> bool {
        let state = self.rows.state(row);
        debug_assert!(
            !matches!(state, Some(RowState::Assigned { .. })),
            "{row} is already assigned to a table"
        );
        match state {
            Some(RowState::Reserved) => {}
            Some(RowState::Assigned { .. }) => {
                tracing::error!(row = %row, "Row is already assigned to a table");
                return false;
            }
            None => {
                tracing::debug!(row = %row, "Add of an invalid row");
                return false;
            }
        }
        if self.table(table).is_none() {
            tracing::debug!(table = %table, "Add reserved row to unknown table");
            return false;
        }
        self.assign_row(row, table);
        if let Some(commands) = self.deferred.take(row) {
            self.replay(row, commands);
        }
        true
    }

    fn assign_row(&mut self, row: RowHandle, table: TableHandle) {
        let Some(target) = self.tables.get_mut(table_position(table)) else {
            return;
        };
        let index = target.push_row(row);
        let added = target.composition().clone();
        self.rows.set_state(row, RowState::Assigned { table, index });
        tracing::trace!(row = %row, table = %table, "Assigned row");
        self.notify_observers(CallbackKind::ObserverAdd, row, &added);
    }

    fn replay(&mut self, row: RowHandle, commands: Vec<DeferredCommand>) {
        for command in commands {
            match command {
                DeferredCommand::AddRemoveColumns { add, remove } => {
                    self.change_composition(row, &add, &remove, Vec::new());
                }
                DeferredCommand::AddColumnData(value) => {
                    let key = ColumnKey::Type(value.column_type());
                    self.change_composition(row, &[key], &[], vec![value]);
                }
            }
        }
    }

    /// Remove a row. Reserved rows drop their queued changes.
    pub fn remove_row(&mut self, row: RowHandle) -> bool {
        let removed = self.remove_row_inner(row);
        self.apply_pending_commands();
        removed
    }

    fn remove_row_inner(&mut self, row: RowHandle) -> bool {
        match self.rows.state(row) {
            None => {
                tracing::debug!(row = %row, "Remove of an invalid row");
                return false;
            }
            Some(RowState::Reserved) => {}
            Some(RowState::Assigned { table, index }) => {
                let composition = self
                    .table(table)
                    .map(|table| table.composition().clone())
                    .unwrap_or_default();
                self.notify_observers(CallbackKind::ObserverRemove, row, &composition);
                if let Some(source) = self.tables.get_mut(table_position(table)) {
                    if let Some(moved) = source.swap_remove_row(index) {
                        self.rows.set_state(moved, RowState::Assigned { table, index });
                    }
                }
            }
        }
        let dropped = self.deferred.discard(row);
        let hashes = self.index.remove_row(row);
        self.rows.release(row);
        tracing::trace!(row = %row, dropped_commands = dropped, index_hashes = hashes, "Removed row");
        true
    }

    /// Where `row` is, or `None` for a stale handle
    pub fn row_state(&self, row: RowHandle) -> Option<RowState> {
        self.rows.state(row)
    }

    /// Whether `row` is assigned to a table
    pub fn is_row_available(&self, row: RowHandle) -> bool {
        self.rows.location(row).is_some()
    }

    /// Whether `row` is reserved or assigned
    pub fn is_row_valid(&self, row: RowHandle) -> bool {
        self.rows.state(row).is_some()
    }

    /// Reserved and assigned rows
    pub fn row_count(&self) -> usize {
        self.rows.live()
    }

    // ---- Composition changes ----

    /// Add tag or default-valued column `T`
    pub fn add_column<T: Column>(&mut self, row: RowHandle) -> bool {
        self.add_columns(row, &[ColumnType::of::<T>()])
    }

    /// Add column `T` holding `value`
    pub fn add_column_data<T: Column>(&mut self, row: RowHandle, value: T) -> bool {
        self.add_column_value(row, Box::new(value))
    }

    /// Add a boxed column value
    pub fn add_column_value(&mut self, row: RowHandle, value: Box<dyn ColumnValue>) -> bool {
        let key = ColumnKey::Type(value.column_type());
        let changed = self.change_composition(row, &[key], &[], vec![value]);
        self.apply_pending_commands();
        changed
    }

    /// Add several columns
    pub fn add_columns(&mut self, row: RowHandle, columns: &[ColumnType]) -> bool {
        self.add_remove_columns(row, columns, &[])
    }

    /// Remove column `T`
    pub fn remove_column<T: Column>(&mut self, row: RowHandle) -> bool {
        self.remove_columns(row, &[ColumnType::of::<T>()])
    }

    /// Remove several columns
    pub fn remove_columns(&mut self, row: RowHandle, columns: &[ColumnType]) -> bool {
        self.add_remove_columns(row, &[], columns)
    }

    /// Add and remove columns in a single move
    pub fn add_remove_columns(&mut self, row: RowHandle, add: &[ColumnType], remove: &[ColumnType]) -> bool {
        let add: Vec<ColumnKey> = add.iter().copied().map(ColumnKey::Type).collect();
        let remove: Vec<ColumnKey> = remove.iter().copied().map(ColumnKey::Type).collect();
        let changed = self.change_composition(row, &add, &remove, Vec::new());
        self.apply_pending_commands();
        changed
    }

    /// [`Self::add_remove_columns`] on every row in `rows`
    pub fn batch_add_remove_columns(&mut self, rows: &[RowHandle], add: &[ColumnType], remove: &[ColumnType]) -> usize {
        let add: Vec<ColumnKey> = add.iter().copied().map(ColumnKey::Type).collect();
        let remove: Vec<ColumnKey> = remove.iter().copied().map(ColumnKey::Type).collect();
        let changed = rows
            .iter()
            .filter(|&&row| self.change_composition(row, &add, &remove, Vec::new()))
            .count();
        self.apply_pending_commands();
        changed
    }

    /// Tag `row` with `value` for `tag`, replacing any other value of `tag`
    pub fn add_dynamic_tag(&mut self, row: RowHandle, tag: DynamicTag, value: &str) -> bool {
        let value = self.intern(value);
        let changed = self.change_composition(row, &[ColumnKey::DynamicTag { tag, value }], &[], Vec::new());
        self.apply_pending_commands();
        changed
    }

    /// Remove whatever value `row` carries for `tag`
    pub fn remove_dynamic_tag(&mut self, row: RowHandle, tag: &DynamicTag) -> bool {
        let Some(composition) = self.row_composition(row) else {
            return false;
        };
        let remove: Vec<ColumnKey> = composition
            .into_iter()
            .filter(|key| key.dynamic_tag() == Some(tag))
            .collect();
        if remove.is_empty() {
            return false;
        }
        let changed = self.change_composition(row, &[], &remove, Vec::new());
        self.apply_pending_commands();
        changed
    }

    fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.dynamic_values.get(value) {
            return Arc::clone(existing);
        }
        let value: Arc<str> = Arc::from(value);
        self.dynamic_values.insert(Arc::clone(&value));
        value
    }

    /// Apply one combined composition change and write `values` afterwards
    fn change_composition(
        &mut self,
        row: RowHandle,
        add: &[ColumnKey],
        remove: &[ColumnKey],
        values: Vec<Box<dyn ColumnValue>>,
    ) -> bool {
        let location = match self.rows.state(row) {
            None => {
                tracing::debug!(row = %row, "Composition change on an invalid row");
                return false;
            }
            Some(RowState::Assigned { table, index }) if !self.deferred.has_commands(row) => (table, index),
            Some(_) => {
                if !add.is_empty() || !remove.is_empty() {
                    self.deferred.push(
                        row,
                        DeferredCommand::AddRemoveColumns {
                            add: add.to_vec(),
                            remove: remove.to_vec(),
                        },
                    );
                }
                for value in values {
                    self.deferred.push(row, DeferredCommand::AddColumnData(value));
                }
                tracing::trace!(row = %row, "Queued composition change");
                return true;
            }
        };
        let (table, index) = location;
        let Some(current) = self.table(table).map(|table| table.composition().clone()) else {
            return false;
        };
        let mut composition = current.clone();
        apply_add_remove(&mut composition, add, remove);

        if composition == current {
            if let Some(source) = self.tables.get_mut(table_position(table)) {
                for value in values {
                    source.set_value(index, value);
                }
            }
            return true;
        }

        let lost: Composition = current.difference(&composition).cloned().collect();
        let gained: Composition = composition.difference(&current).cloned().collect();
        self.notify_observers(CallbackKind::ObserverRemove, row, &lost);

        let target = self.table_for(composition);
        let (new_index, moved) = {
            let (source, destination) = two_tables_mut(&mut self.tables, table_position(table), table_position(target));
            let moved = source.move_row_to(index, destination);
            for value in values {
                destination.set_value(moved.0, value);
            }
            moved
        };
        self.rows.set_state(row, RowState::Assigned { table: target, index: new_index });
        if let Some(moved) = moved {
            self.rows.set_state(moved, RowState::Assigned { table, index });
        }
        tracing::trace!(row = %row, from = %table, to = %target, "Moved row");

        self.notify_observers(CallbackKind::ObserverAdd, row, &gained);
        true
    }

    // ---- Reads ----

    /// Composition of `row` including queued changes
    pub fn row_composition(&self, row: RowHandle) -> Option<Composition> {
        let base = match self.rows.state(row)? {
            RowState::Assigned { table, .. } => self.table(table).map(Table::composition),
            RowState::Reserved => None,
        };
        Some(self.deferred.effective_composition(row, base))
    }

    /// Whether `row` has every column in `columns`
    pub fn has_columns(&self, row: RowHandle, columns: &[ColumnType]) -> bool {
        self.row_composition(row).is_some_and(|composition| {
            columns
                .iter()
                .all(|column| composition.contains(&ColumnKey::Type(*column)))
        })
    }

    /// Whether `row` satisfies `conditions`
    pub fn matches_columns(&self, row: RowHandle, conditions: &Conditions) -> bool {
        self.row_composition(row)
            .is_some_and(|composition| conditions.matches(&composition))
    }

    /// Columns, tags and dynamic tags of `row`
    pub fn list_columns(&self, row: RowHandle) -> Vec<ColumnKey> {
        self.row_composition(row)
            .map(|composition| composition.into_iter().collect())
            .unwrap_or_default()
    }

    /// Value of `T` for `row`, queued or live
    pub fn get_column<T: Column>(&self, row: RowHandle) -> Option<&T> {
        match self.deferred.value::<T>(row) {
            Ok(Some(value)) => return Some(value),
            Err(()) => return None,
            Ok(None) => {}
        }
        let (table, index) = self.rows.location(row)?;
        self.tables.get(table_position(table))?.column::<T>()?.get(index)
    }

    /// Mutable value of `T` for `row`, queued or live
    pub fn get_column_mut<T: Column>(&mut self, row: RowHandle) -> Option<&mut T> {
        match self.deferred.value_mut::<T>(row) {
            Ok(Some(value)) => return Some(value),
            Err(()) => return None,
            Ok(None) => {}
        }
        let (table, index) = self.rows.location(row)?;
        self.tables.get_mut(table_position(table))?.column_mut::<T>()?.get_mut(index)
    }

    /// Copies of every data value of `row`, queued values included
    pub fn row_values(&self, row: RowHandle) -> Vec<Box<dyn ColumnValue>> {
        let Some(composition) = self.row_composition(row) else {
            return Vec::new();
        };
        let mut values = match self.rows.location(row) {
            Some((table, index)) => self.table(table).map(|table| table.values(index)).unwrap_or_default(),
            None => Vec::new(),
        };
        for queued in self.deferred.queued_values(row) {
            let column = queued.column_type();
            values.retain(|value| value.column_type() != column);
            values.push(queued.clone_value());
        }
        values.retain(|value| composition.contains(&ColumnKey::Type(value.column_type())));
        values
    }

    // ---- Index ----

    /// Row registered under `hash`
    pub fn find_indexed_row(&self, hash: IndexHash) -> Option<RowHandle> {
        self.index.find(hash)
    }

    /// Register `row` under `hash`, replacing any previous row
    pub fn index_row(&mut self, hash: IndexHash, row: RowHandle) -> bool {
        if !self.is_row_valid(row) {
            tracing::debug!(row = %row, hash = %hash, "Index of an invalid row");
            return false;
        }
        self.index.insert(hash, row);
        true
    }

    /// [`Self::index_row`] for several pairs
    pub fn batch_index_rows(&mut self, pairs: impl IntoIterator<Item = (IndexHash, RowHandle)>) -> usize {
        pairs
            .into_iter()
            .filter(|&(hash, row)| self.index_row(hash, row))
            .count()
    }

    /// Move the entry under `original` to `hash`
    pub fn reindex_row(&mut self, original: IndexHash, hash: IndexHash, row: RowHandle) -> bool {
        if !self.is_row_valid(row) {
            return false;
        }
        self.index.reindex(original, hash, row);
        true
    }

    /// Drop the entry under `hash`
    pub fn remove_index(&mut self, hash: IndexHash) -> Option<RowHandle> {
        self.index.remove(hash)
    }

    /// Hashes registered for `row`
    pub fn index_hashes(&self, row: RowHandle) -> &[IndexHash] {
        self.index.hashes(row)
    }

    // ---- Dependencies ----

    /// Register a value queries can declare as a dependency
    pub fn register_dependency<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        tracing::debug!(dependency = std::any::type_name::<T>(), "Registered dependency");
        self.dependencies.insert(value)
    }

    /// Remove a dependency
    pub fn unregister_dependency<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.dependencies.remove::<T>()
    }

    /// Dependency `T`
    pub fn dependency<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.dependencies.get::<T>()
    }

    /// Dependency `T`, mutably
    pub fn dependency_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.dependencies.get_mut::<T>()
    }

    // ---- Queries ----

    /// Compile and register a query
    pub fn register_query(&mut self, description: QueryDescription) -> std::result::Result<QueryHandle, QueryError> {
        self.queries.register(description, &self.dependencies).inspect_err(|error| {
            tracing::warn!(%error, "Query rejected");
        })
    }

    /// Remove a query from every schedule
    pub fn unregister_query(&mut self, handle: QueryHandle) -> bool {
        self.queries.unregister(handle)
    }

    /// Description of a registered query
    pub fn query_description(&self, handle: QueryHandle) -> Option<&QueryDescription> {
        self.queries.entries.get(&handle).map(|entry| &entry.description)
    }

    /// One line per scheduled query, for debugging
    pub fn list_query_callbacks(&self) -> Vec<String> {
        self.queries.list_callbacks()
    }

    /// Run a query with its own function
    pub fn run_query(&mut self, handle: QueryHandle) -> QueryResult {
        let Some(entry) = self.queries.entries.get_mut(&handle) else {
            return QueryResult::with(QueryCompletion::Unavailable);
        };
        let action = entry.description.action;
        let result = match action {
            QueryAction::None => QueryResult::fully(0),
            QueryAction::Count => QueryResult::fully(count_rows(&self.tables, &entry.compiled)),
            QueryAction::Select => {
                let QueryEntry {
                    description,
                    function,
                    compiled,
                    ..
                } = entry;
                match function.as_mut() {
                    Some(function) if description.callback.kind == CallbackKind::None => {
                        QueryResult::fully(select_tables(
                            &mut self.tables,
                            compiled,
                            description,
                            &mut **function,
                            &mut self.dependencies,
                            &mut self.pending_commands,
                            self.update_cycle,
                        ))
                    }
                    _ => QueryResult::with(QueryCompletion::Unsupported),
                }
            }
        };
        self.apply_pending_commands();
        result
    }

    /// Run `callback` over the rows matching a query
    pub fn run_query_with(
        &mut self,
        handle: QueryHandle,
        mut callback: impl FnMut(&mut QueryContext<'_>),
    ) -> QueryResult {
        let Some(entry) = self.queries.entries.get(&handle) else {
            return QueryResult::with(QueryCompletion::Unavailable);
        };
        let result = match entry.description.action {
            QueryAction::None => QueryResult::fully(0),
            QueryAction::Count => QueryResult::with(QueryCompletion::Unsupported),
            QueryAction::Select => QueryResult::fully(select_tables(
                &mut self.tables,
                &entry.compiled,
                &entry.description,
                &mut callback,
                &mut self.dependencies,
                &mut self.pending_commands,
                self.update_cycle,
            )),
        };
        self.apply_pending_commands();
        result
    }

    /// Run `callback` on `row` if it matches the query
    pub fn run_subquery_on_row(
        &mut self,
        handle: QueryHandle,
        row: RowHandle,
        mut callback: impl FnMut(&mut QueryContext<'_>),
    ) -> QueryResult {
        let Some(entry) = self.queries.entries.get(&handle) else {
            return QueryResult::with(QueryCompletion::Unavailable);
        };
        let Some((table, index)) = self.rows.location(row) else {
            return QueryResult::fully(0);
        };
        let Some(target) = self.tables.get_mut(table_position(table)) else {
            return QueryResult::fully(0);
        };
        if !entry.compiled.matches(target.composition()) {
            return QueryResult::fully(0);
        }
        let result = match entry.description.action {
            QueryAction::None => QueryResult::fully(0),
            QueryAction::Count => QueryResult::fully(1),
            QueryAction::Select => {
                let mut context = QueryContext::new(
                    Some(target),
                    index..index + 1,
                    &entry.description,
                    &mut self.dependencies,
                    &mut self.pending_commands,
                    self.update_cycle,
                );
                debug_assert_eq!(context.row_count(), 1, "subquery matched more than one row");
                callback(&mut context);
                QueryResult::fully(1)
            }
        };
        self.apply_pending_commands();
        result
    }

    /// Queue every query registered under `name` to run next cycle
    pub fn activate_queries(&mut self, name: &str) {
        if !self.settings.activatable_queries {
            tracing::debug!(activation = name, "Activatable queries are disabled");
            return;
        }
        tracing::trace!(activation = name, "Activation requested");
        self.queries.activate(name);
    }

    /// Register tick group defaults for `phase`
    pub fn register_tick_group(
        &mut self,
        name: TickGroupName,
        phase: TickPhase,
        before: Vec<TickGroupName>,
        after: Vec<TickGroupName>,
        main_thread: bool,
    ) -> bool {
        self.tick_groups.register(name, phase, before, after, main_thread)
    }

    /// Remove tick group defaults
    pub fn unregister_tick_group(&mut self, name: &TickGroupName, phase: TickPhase) -> bool {
        self.tick_groups.unregister(name, phase)
    }

    /// Registered tick groups
    pub fn tick_groups(&self) -> &TickGroups {
        &self.tick_groups
    }

    // ---- Ticking ----

    /// Run `hook` at the start of every update cycle
    pub fn on_update(&mut self, hook: impl FnMut(&mut DataStorage) + Send + 'static) {
        self.on_update.push(Box::new(hook));
    }

    /// Run `hook` at the end of every update cycle
    pub fn on_update_completed(&mut self, hook: impl FnMut(&mut DataStorage) + Send + 'static) {
        self.on_update_completed.push(Box::new(hook));
    }

    /// Start a cycle: run hooks and move activations forward
    pub fn begin_update(&mut self) {
        self.update_cycle += 1;
        tracing::trace!(cycle = self.update_cycle, "Begin update");
        let mut hooks = std::mem::take(&mut self.on_update);
        for hook in &mut hooks {
            hook(self);
        }
        hooks.append(&mut self.on_update);
        self.on_update = hooks;
        self.queries.advance_activations();
        self.apply_pending_commands();
    }

    /// Replay queued changes of rows that have been assigned since
    pub fn flush_deferred(&mut self) -> usize {
        let ready: Vec<RowHandle> = self
            .deferred
            .rows()
            .filter(|&row| self.rows.state(row) != Some(RowState::Reserved))
            .collect();
        let mut flushed = 0;
        for row in ready {
            let Some(commands) = self.deferred.take(row) else {
                continue;
            };
            if self.rows.location(row).is_none() {
                tracing::debug!(row = %row, dropped = commands.len(), "Dropped commands of a stale row");
                continue;
            }
            flushed += commands.len();
            self.replay(row, commands);
        }
        self.apply_pending_commands();
        if flushed > 0 {
            tracing::trace!(commands = flushed, "Flushed deferred commands");
        }
        flushed
    }

    /// Run one phase: preambles, processors in tick-group order, postambles
    pub fn run_phase(&mut self, phase: TickPhase) {
        for handle in self.phase_callbacks(CallbackKind::PhasePreamble, phase) {
            self.run_scheduled(handle);
        }
        for handle in self.ordered_processors(phase) {
            self.run_scheduled(handle);
        }
        for handle in self.phase_callbacks(CallbackKind::PhasePostamble, phase) {
            self.run_scheduled(handle);
        }
        if self.settings.flush_deferred_each_phase {
            self.flush_deferred();
        }
    }

    /// Finish a cycle
    pub fn end_update(&mut self) {
        let mut hooks = std::mem::take(&mut self.on_update_completed);
        for hook in &mut hooks {
            hook(self);
        }
        hooks.append(&mut self.on_update_completed);
        self.on_update_completed = hooks;
        self.apply_pending_commands();
        tracing::trace!(cycle = self.update_cycle, "End update");
    }

    /// One full cycle over every phase
    pub fn tick(&mut self) {
        self.begin_update();
        self.flush_deferred();
        for phase in TickPhase::ALL {
            self.run_phase(phase);
        }
        self.end_update();
    }

    fn phase_callbacks(&self, kind: CallbackKind, phase: TickPhase) -> Vec<QueryHandle> {
        self.queries
            .handles_of_kind(kind)
            .into_iter()
            .filter(|handle| {
                self.queries
                    .entries
                    .get(handle)
                    .is_some_and(|entry| entry.description.callback.phase == phase)
            })
            .collect()
    }

    fn ordered_processors(&self, phase: TickPhase) -> Vec<QueryHandle> {
        let processors: Vec<(QueryHandle, &QueryEntry)> = self
            .queries
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.description.callback.kind == CallbackKind::Processor && entry.description.callback.phase == phase
            })
            .map(|(handle, entry)| (*handle, entry))
            .collect();
        let constraints: Vec<GroupConstraints<'_>> = processors
            .iter()
            .map(|(_, entry)| GroupConstraints {
                group: &entry.description.callback.group,
                before: &entry.description.callback.before,
                after: &entry.description.callback.after,
            })
            .collect();
        self.tick_groups
            .order(phase, &constraints)
            .iter()
            .flat_map(|group| {
                processors
                    .iter()
                    .filter(move |(_, entry)| entry.description.callback.group == *group)
                    .map(|(handle, _)| *handle)
            })
            .collect()
    }

    fn run_scheduled(&mut self, handle: QueryHandle) {
        let Some(entry) = self.queries.entries.get_mut(&handle) else {
            return;
        };
        if !entry.is_active() {
            return;
        }
        let QueryEntry {
            description,
            function,
            compiled,
            ..
        } = entry;
        let Some(function) = function.as_mut() else {
            return;
        };
        tracing::trace!(
            query = %description.callback.name,
            main_thread = description.callback.force_main_thread,
            "Running scheduled query"
        );
        match description.action {
            QueryAction::Select => {
                select_tables(
                    &mut self.tables,
                    compiled,
                    description,
                    &mut **function,
                    &mut self.dependencies,
                    &mut self.pending_commands,
                    self.update_cycle,
                );
            }
            QueryAction::None => {
                let mut context = QueryContext::new(
                    None,
                    0..0,
                    description,
                    &mut self.dependencies,
                    &mut self.pending_commands,
                    self.update_cycle,
                );
                function(&mut context);
            }
            QueryAction::Count => {
                tracing::debug!(query = %description.callback.name, "Count queries are not scheduled");
            }
        }
        self.apply_pending_commands();
    }

    fn notify_observers(&mut self, kind: CallbackKind, row: RowHandle, changed: &Composition) {
        if changed.is_empty() {
            return;
        }
        let Some((table, index)) = self.rows.location(row) else {
            return;
        };
        let observers: Vec<QueryHandle> = self
            .queries
            .entries
            .iter()
            .filter(|(_, entry)| {
                let callback = &entry.description.callback;
                callback.kind == kind
                    && entry.is_active()
                    && callback
                        .monitored
                        .is_some_and(|monitored| changed.contains(&ColumnKey::Type(monitored)))
            })
            .map(|(handle, _)| *handle)
            .collect();

        for handle in observers {
            let Some(entry) = self.queries.entries.get_mut(&handle) else {
                continue;
            };
            let QueryEntry {
                description,
                function,
                compiled,
                ..
            } = entry;
            let Some(target) = self.tables.get_mut(table_position(table)) else {
                return;
            };
            if !compiled.matches(target.composition()) {
                continue;
            }
            let Some(function) = function.as_mut() else {
                continue;
            };
            tracing::trace!(query = %description.callback.name, row = %row, kind = ?kind, "Notifying observer");
            let mut context = QueryContext::new(
                Some(target),
                index..index + 1,
                description,
                &mut self.dependencies,
                &mut self.pending_commands,
                self.update_cycle,
            );
            function(&mut context);
        }
    }

    /// Apply structural changes queued by query callbacks
    fn apply_pending_commands(&mut self) {
        if self.applying_commands {
            return;
        }
        self.applying_commands = true;
        loop {
            let commands = std::mem::take(&mut self.pending_commands);
            if commands.is_empty() {
                break;
            }
            for command in commands {
                match command {
                    QueryCommand::AddColumns(row, columns) => {
                        self.change_composition(row, &columns, &[], Vec::new());
                    }
                    QueryCommand::RemoveColumns(row, columns) => {
                        self.change_composition(row, &[], &columns, Vec::new());
                    }
                    QueryCommand::AddColumnData(row, value) => {
                        let key = ColumnKey::Type(value.column_type());
                        self.change_composition(row, &[key], &[], vec![value]);
                    }
                    QueryCommand::RemoveRow(row) => {
                        self.remove_row_inner(row);
                    }
                    QueryCommand::Custom(work) => work(self),
                }
            }
        }
        self.applying_commands = false;
    }
}

impl fmt::Debug for DataStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStorage")
            .field("tables", &self.tables.len())
            .field("rows", &self.rows.live())
            .field("queries", &self.queries.entries.len())
            .field("deferred", &self.deferred.len())
            .field("indexed", &self.index.len())
            .field("update_cycle", &self.update_cycle)
            .finish_non_exhaustive()
    }
}

fn table_position(handle: TableHandle) -> usize {
    handle.0 as usize
}

fn count_rows(tables: &[Table], compiled: &CompiledQuery) -> usize {
    tables
        .iter()
        .filter(|table| compiled.matches(table.composition()))
        .map(Table::len)
        .sum()
}

fn select_tables(
    tables: &mut [Table],
    compiled: &CompiledQuery,
    description: &QueryDescription,
    function: &mut dyn FnMut(&mut QueryContext<'_>),
    dependencies: &mut Dependencies,
    commands: &mut Vec<QueryCommand>,
    update_cycle: u64,
) -> usize {
    let mut visited = 0;
    for table in tables.iter_mut() {
        if table.is_empty() || !compiled.matches(table.composition()) {
            continue;
        }
        let len = table.len();
        let mut context = QueryContext::new(Some(table), 0..len, description, dependencies, commands, update_cycle);
        function(&mut context);
        visited += len;
    }
    visited
}
