// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compatibility bridge for objects that live outside the storage.
//!
//! Objects are identified by an [`ObjectId`] and indexed by its hash. Adding
//! an object reserves and indexes a row right away; building the row is
//! queued as a [`CompatCommand`] and runs at the next tick, unless the
//! command buffer is disabled. Removal notifications always run
//! synchronously, since a deferred notification could see an object that is
//! already gone.
//!
//! A tick runs the queued commands through a fixed pipeline: collect, patch
//! reinstanced types, prepare (commands that can no longer run become
//! [`CompatCommand::Nop`]), optimize, print and process.

use crate::column::{Column, ColumnKind, ColumnType};
use crate::error::Result;
use crate::index::IndexHash;
use crate::memento::MementoSystem;
use crate::query::{QueryDescription, QueryHandle};
use crate::row::{RowHandle, RowState};
use crate::settings::{CommandBufferPrint, CompatibilitySettings};
use crate::storage::DataStorage;
use crate::table::TableHandle;
use crate::transaction::{Change, TransactionRecorder};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of an object outside the storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:#x})", self.0)
    }
}

/// Shared type information
pub type TypeHandle = Arc<ObjectType>;

/// Runtime type of compatible objects, with single inheritance
#[derive(Debug)]
pub struct ObjectType {
    id: Uuid,
    name: String,
    parent: Option<TypeHandle>,
}

impl ObjectType {
    /// Root type
    pub fn new(name: impl Into<String>) -> TypeHandle {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent: None,
        })
    }

    /// Type deriving from `parent`
    pub fn derived(name: impl Into<String>, parent: &TypeHandle) -> TypeHandle {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Identity; a reinstanced type gets a new one
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent type
    pub fn parent(&self) -> Option<&TypeHandle> {
        self.parent.as_ref()
    }

    /// Whether this type is `other` or derives from it
    pub fn is_a(&self, other: &ObjectType) -> bool {
        let mut current = Some(self);
        while let Some(type_info) = current {
            if type_info.id == other.id {
                return true;
            }
            current = type_info.parent.as_deref();
        }
        false
    }
}

/// An object that can be mirrored into the storage
#[derive(Debug, Clone)]
pub struct CompatibleObject {
    /// Identity
    pub id: ObjectId,
    /// Runtime type
    pub type_info: TypeHandle,
}

impl CompatibleObject {
    /// Object `id` of `type_info`
    pub fn new(id: ObjectId, type_info: &TypeHandle) -> Self {
        Self {
            id,
            type_info: Arc::clone(type_info),
        }
    }
}

/// Object mirrored by a row
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObjectColumn {
    /// Object identity
    pub object: ObjectId,
}

impl Column for ObjectColumn {}

/// External object mirrored by a row
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExternalObjectColumn {
    /// Object identity
    pub object: ObjectId,
}

impl Column for ExternalObjectColumn {}

/// Runtime type of the mirrored object
#[derive(Debug, Default, Clone)]
pub struct TypeColumn {
    /// Type, if known
    pub type_info: Option<TypeHandle>,
}

impl Column for TypeColumn {}

/// The object changed and its row needs a refresh
#[derive(Debug, Default, Clone)]
pub struct SyncFromWorldTag;

impl Column for SyncFromWorldTag {
    const KIND: ColumnKind = ColumnKind::Tag;
}

/// The object is being edited interactively and syncs every tick
#[derive(Debug, Default, Clone)]
pub struct SyncFromWorldInteractiveTag;

impl Column for SyncFromWorldInteractiveTag {
    const KIND: ColumnKind = ColumnKind::Tag;
}

/// Work queued for the next compatibility tick
#[derive(Debug, Clone)]
pub enum CompatCommand {
    /// Cancelled or no longer applicable
    Nop,
    /// Finish adding an object to its reserved row
    AddCompatibleObject {
        /// Object
        object: CompatibleObject,
        /// Reserved row
        row: RowHandle,
    },
    /// Finish adding an external object to its reserved row
    AddExternalObject {
        /// Object
        object: ObjectId,
        /// Object type
        type_info: TypeHandle,
        /// Reserved row
        row: RowHandle,
    },
    /// Remove an object's row
    RemoveCompatibleObject {
        /// Object
        object: ObjectId,
        /// Row at the time of the request
        row: RowHandle,
    },
    /// Flag the object's row for a refresh
    AddSyncFromWorldTag {
        /// Object
        object: ObjectId,
    },
    /// Start syncing every tick
    AddInteractiveSyncTag {
        /// Object
        object: ObjectId,
    },
    /// Stop syncing every tick
    RemoveInteractiveSyncTag {
        /// Object
        object: ObjectId,
    },
    /// Capture `target` into `memento`
    CreateMemento {
        /// Memento row
        memento: RowHandle,
        /// Captured row
        target: RowHandle,
    },
    /// Write `memento` onto `target`
    RestoreMemento {
        /// Memento row
        memento: RowHandle,
        /// Restored row
        target: RowHandle,
    },
    /// Release a memento row
    DestroyMemento {
        /// Memento row
        memento: RowHandle,
    },
    /// A type was replaced by a new instance
    TypeInfoReinstanced {
        /// Old type
        original: TypeHandle,
        /// New type
        reinstanced: TypeHandle,
    },
}

impl CompatCommand {
    /// Object the command targets, if any
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            Self::AddCompatibleObject { object, .. } => Some(object.id),
            Self::AddExternalObject { object, .. }
            | Self::RemoveCompatibleObject { object, .. }
            | Self::AddSyncFromWorldTag { object }
            | Self::AddInteractiveSyncTag { object }
            | Self::RemoveInteractiveSyncTag { object } => Some(*object),
            Self::Nop
            | Self::CreateMemento { .. }
            | Self::RestoreMemento { .. }
            | Self::DestroyMemento { .. }
            | Self::TypeInfoReinstanced { .. } => None,
        }
    }

    /// Short variant name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::AddCompatibleObject { .. } => "AddCompatibleObject",
            Self::AddExternalObject { .. } => "AddExternalObject",
            Self::RemoveCompatibleObject { .. } => "RemoveCompatibleObject",
            Self::AddSyncFromWorldTag { .. } => "AddSyncFromWorldTag",
            Self::AddInteractiveSyncTag { .. } => "AddInteractiveSyncTag",
            Self::RemoveInteractiveSyncTag { .. } => "RemoveInteractiveSyncTag",
            Self::CreateMemento { .. } => "CreateMemento",
            Self::RestoreMemento { .. } => "RestoreMemento",
            Self::DestroyMemento { .. } => "DestroyMemento",
            Self::TypeInfoReinstanced { .. } => "TypeInfoReinstanced",
        }
    }

    fn is_nop(&self) -> bool {
        matches!(self, Self::Nop)
    }
}

/// Thread-safe queue feeding the compatibility tick
#[derive(Debug, Clone, Default)]
pub struct CompatCommandQueue {
    commands: Arc<Mutex<Vec<CompatCommand>>>,
}

impl CompatCommandQueue {
    /// Queue a command
    pub fn push(&self, command: CompatCommand) {
        self.commands.lock().push(command);
    }

    /// Move every queued command into `target`; returns how many moved
    pub fn collect(&self, target: &mut Vec<CompatCommand>) -> usize {
        let mut commands = self.commands.lock();
        let count = commands.len();
        target.append(&mut commands);
        count
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

/// Decides whether an object may be added
pub type RegistrationFilter = Box<dyn Fn(&CompatibleObject) -> bool + Send + Sync>;

/// Maps an object without its own row to the row standing in for it
pub type Dealiaser = Box<dyn Fn(&DataStorage, ObjectId) -> Option<RowHandle> + Send + Sync>;

/// Notified when an object is added or about to be removed
pub type ObjectCallback = Box<dyn FnMut(ObjectId, &TypeHandle, RowHandle) + Send>;

/// Handle to an object callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Name of the table for objects without a closer match
pub const STANDARD_OBJECT_TABLE: &str = "Editor_StandardObjectTable";
/// Name of the table for external objects without a closer match
pub const STANDARD_EXTERNAL_OBJECT_TABLE: &str = "Editor_StandardExternalObjectTable";

fn object_hash(object: ObjectId) -> IndexHash {
    IndexHash::of(&object)
}

/// Mirrors outside objects into the storage
pub struct Compatibility {
    settings: CompatibilitySettings,
    queue: CompatCommandQueue,
    filters: Vec<RegistrationFilter>,
    dealiasers: Vec<Dealiaser>,
    type_tables: IndexMap<Uuid, (TypeHandle, TableHandle)>,
    added_callbacks: IndexMap<CallbackId, ObjectCallback>,
    removed_callbacks: IndexMap<CallbackId, ObjectCallback>,
    next_callback: u64,
    standard_object_table: Option<TableHandle>,
    standard_external_table: Option<TableHandle>,
    object_query: Option<QueryHandle>,
    type_query: Option<QueryHandle>,
    mementos: MementoSystem,
}

impl Compatibility {
    /// Create an uninitialized bridge
    pub fn new(settings: CompatibilitySettings) -> Self {
        Self {
            settings,
            queue: CompatCommandQueue::default(),
            filters: Vec::new(),
            dealiasers: Vec::new(),
            type_tables: IndexMap::new(),
            added_callbacks: IndexMap::new(),
            removed_callbacks: IndexMap::new(),
            next_callback: 0,
            standard_object_table: None,
            standard_external_table: None,
            object_query: None,
            type_query: None,
            mementos: MementoSystem::default(),
        }
    }

    /// Register the standard tables and internal queries
    pub fn initialize(&mut self, storage: &mut DataStorage) -> Result<()> {
        let object_table = storage.register_table(
            &[ColumnType::of::<ObjectColumn>(), ColumnType::of::<TypeColumn>()],
            Some(STANDARD_OBJECT_TABLE),
        )?;
        let external_table = storage.register_table(
            &[ColumnType::of::<ExternalObjectColumn>(), ColumnType::of::<TypeColumn>()],
            Some(STANDARD_EXTERNAL_OBJECT_TABLE),
        )?;
        self.mementos.initialize(storage)?;
        self.object_query = storage
            .register_query(QueryDescription::select().read::<ObjectColumn>().named("Compat objects"))
            .ok();
        self.type_query = storage
            .register_query(QueryDescription::select().write::<TypeColumn>().named("Compat types"))
            .ok();
        self.standard_object_table = Some(object_table);
        self.standard_external_table = Some(external_table);
        tracing::debug!(objects = %object_table, external = %external_table, "Compatibility initialized");
        Ok(())
    }

    /// Whether [`Self::initialize`] ran
    pub fn is_initialized(&self) -> bool {
        self.standard_object_table.is_some()
    }

    /// Settings
    pub fn settings(&self) -> &CompatibilitySettings {
        &self.settings
    }

    /// Memento system backing undo of registrations
    pub fn mementos(&self) -> &MementoSystem {
        &self.mementos
    }

    /// Queue usable from any thread
    pub fn command_queue(&self) -> CompatCommandQueue {
        self.queue.clone()
    }

    /// Table for objects without a closer match
    pub fn standard_object_table(&self) -> Option<TableHandle> {
        self.standard_object_table
    }

    // ---- Registration ----

    /// Objects are only added when every filter accepts them
    pub fn register_registration_filter(&mut self, filter: impl Fn(&CompatibleObject) -> bool + Send + Sync + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Consulted in order when an object has no indexed row
    pub fn register_dealiaser(
        &mut self,
        dealiaser: impl Fn(&DataStorage, ObjectId) -> Option<RowHandle> + Send + Sync + 'static,
    ) {
        self.dealiasers.push(Box::new(dealiaser));
    }

    /// Store objects of `type_info`, and types deriving from it, in `table`
    pub fn register_type_table_association(&mut self, type_info: &TypeHandle, table: TableHandle) {
        tracing::debug!(type_name = type_info.name(), table = %table, "Registered type table");
        self.type_tables
            .insert(type_info.id(), (Arc::clone(type_info), table));
    }

    /// Called after an object's row is built
    pub fn register_object_added_callback(
        &mut self,
        callback: impl FnMut(ObjectId, &TypeHandle, RowHandle) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.added_callbacks.insert(id, Box::new(callback));
        id
    }

    /// Remove an added callback
    pub fn unregister_object_added_callback(&mut self, id: CallbackId) -> bool {
        self.added_callbacks.shift_remove(&id).is_some()
    }

    /// Called before an object's row is removed
    pub fn register_object_removed_callback(
        &mut self,
        callback: impl FnMut(ObjectId, &TypeHandle, RowHandle) + Send + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.removed_callbacks.insert(id, Box::new(callback));
        id
    }

    /// Remove a removed callback
    pub fn unregister_object_removed_callback(&mut self, id: CallbackId) -> bool {
        self.removed_callbacks.shift_remove(&id).is_some()
    }

    fn next_callback_id(&mut self) -> CallbackId {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        id
    }

    /// Table registered for the closest ancestor of `type_info`
    pub fn find_best_matching_table(&self, type_info: &TypeHandle) -> Option<TableHandle> {
        let mut current = Some(type_info);
        while let Some(type_info) = current {
            if let Some((_, table)) = self.type_tables.get(&type_info.id()) {
                return Some(*table);
            }
            current = type_info.parent();
        }
        None
    }

    // ---- Objects ----

    /// Add `object`, returning its row. Idempotent; `None` when a filter
    /// rejects the object.
    pub fn add_compatible_object(&mut self, storage: &mut DataStorage, object: &CompatibleObject) -> Option<RowHandle> {
        self.add_object(storage, object).map(|(row, _)| row)
    }

    /// [`Self::add_compatible_object`], recording the registration for undo
    pub fn add_compatible_object_recorded(
        &mut self,
        storage: &mut DataStorage,
        object: &CompatibleObject,
        recorder: &mut dyn TransactionRecorder,
    ) -> Option<RowHandle> {
        let (row, added) = self.add_object(storage, object)?;
        if added {
            recorder.record(Box::new(RegistrationChange {
                object: object.clone(),
            }));
        }
        Some(row)
    }

    fn add_object(&mut self, storage: &mut DataStorage, object: &CompatibleObject) -> Option<(RowHandle, bool)> {
        debug_assert!(
            self.is_initialized(),
            "compatible objects added before the compatibility bridge was initialized"
        );
        if !self.filters.iter().all(|filter| filter(object)) {
            tracing::trace!(object = %object.id, type_name = object.type_info.name(), "Object filtered out");
            return None;
        }
        if let Some(row) = self.find_row_with_compatible_object(storage, object.id) {
            return Some((row, false));
        }
        let row = storage.reserve_row();
        storage.index_row(object_hash(object.id), row);
        self.submit(
            storage,
            CompatCommand::AddCompatibleObject {
                object: object.clone(),
                row,
            },
        );
        Some((row, true))
    }

    /// Add an object that is not a native object, such as a plain struct
    /// owned elsewhere
    pub fn add_compatible_external_object(
        &mut self,
        storage: &mut DataStorage,
        object: ObjectId,
        type_info: &TypeHandle,
    ) -> RowHandle {
        debug_assert!(
            self.is_initialized(),
            "compatible objects added before the compatibility bridge was initialized"
        );
        if let Some(row) = self.find_row_with_compatible_object(storage, object) {
            return row;
        }
        let row = storage.reserve_row();
        storage.index_row(object_hash(object), row);
        self.submit(
            storage,
            CompatCommand::AddExternalObject {
                object,
                type_info: Arc::clone(type_info),
                row,
            },
        );
        row
    }

    /// Remove `object`. Removal callbacks run now; the row goes now or at
    /// the next tick depending on settings.
    pub fn remove_compatible_object(&mut self, storage: &mut DataStorage, object: ObjectId) -> bool {
        let Some(row) = self.find_row_with_compatible_object(storage, object) else {
            tracing::trace!(object = %object, "Remove of an unknown object");
            return false;
        };
        self.remove_object_row(storage, object, row);
        true
    }

    /// [`Self::remove_compatible_object`], capturing a memento so the
    /// removal can be undone
    pub fn remove_compatible_object_recorded(
        &mut self,
        storage: &mut DataStorage,
        object: ObjectId,
        recorder: &mut dyn TransactionRecorder,
    ) -> bool {
        let Some(row) = self.find_row_with_compatible_object(storage, object) else {
            return false;
        };
        let type_info = storage
            .get_column::<TypeColumn>(row)
            .and_then(|column| column.type_info.clone());
        match type_info {
            Some(type_info) => {
                if let Some(memento) = self.mementos.create_memento(storage, row) {
                    recorder.record(Box::new(DeregistrationChange {
                        object: CompatibleObject { id: object, type_info },
                        memento,
                    }));
                }
            }
            None => tracing::debug!(object = %object, "Removal not recorded, object row is not built yet"),
        }
        self.remove_object_row(storage, object, row);
        true
    }

    fn remove_object_row(&mut self, storage: &mut DataStorage, object: ObjectId, row: RowHandle) {
        self.notify_removed(storage, object, row);
        if self.settings.use_command_buffer && self.settings.deferred_removes {
            // Unindexed now so a re-add before the tick gets a fresh row
            storage.remove_index(object_hash(object));
            self.queue.push(CompatCommand::RemoveCompatibleObject { object, row });
        } else {
            storage.remove_row(row);
        }
    }

    fn notify_removed(&mut self, storage: &DataStorage, object: ObjectId, row: RowHandle) {
        if storage.row_state(row) == Some(RowState::Reserved) {
            return;
        }
        let Some(type_info) = storage
            .get_column::<TypeColumn>(row)
            .and_then(|column| column.type_info.clone())
        else {
            tracing::warn!(object = %object, row = %row, "Missing type information for removed object");
            return;
        };
        for callback in self.removed_callbacks.values_mut() {
            callback(object, &type_info, row);
        }
    }

    /// Row mirroring `object`, including reserved rows still being built
    pub fn find_row_with_compatible_object(&self, storage: &DataStorage, object: ObjectId) -> Option<RowHandle> {
        if let Some(row) = storage.find_indexed_row(object_hash(object)) {
            if storage.is_row_valid(row) {
                return Some(row);
            }
        }
        self.dealiasers
            .iter()
            .filter_map(|dealiaser| dealiaser(storage, object))
            .find(|row| storage.is_row_valid(*row))
    }

    // ---- Object hooks ----

    /// The object changed outside the storage
    pub fn on_object_modified(&self, object: ObjectId) {
        self.queue.push(CompatCommand::AddSyncFromWorldTag { object });
    }

    /// An interactive edit of the object started
    pub fn on_pre_property_changed(&self, object: ObjectId) {
        self.queue.push(CompatCommand::AddInteractiveSyncTag { object });
    }

    /// An interactive edit of the object finished
    pub fn on_post_property_changed(&self, object: ObjectId) {
        self.queue.push(CompatCommand::RemoveInteractiveSyncTag { object });
        self.queue.push(CompatCommand::AddSyncFromWorldTag { object });
    }

    /// Types were replaced by new instances; pairs are (original, reinstanced)
    pub fn on_object_reinstanced(&self, replaced: &[(TypeHandle, TypeHandle)]) {
        for (original, reinstanced) in replaced {
            self.queue.push(CompatCommand::TypeInfoReinstanced {
                original: Arc::clone(original),
                reinstanced: Arc::clone(reinstanced),
            });
        }
    }

    /// Remove rows whose objects did not survive garbage collection
    pub fn on_post_garbage_collection(&mut self, storage: &mut DataStorage, is_alive: impl Fn(ObjectId) -> bool) -> usize {
        if !self.settings.integrate_with_gc {
            return 0;
        }
        let Some(query) = self.object_query else {
            return 0;
        };
        let mut dead = Vec::new();
        storage.run_query_with(query, |context| {
            if let Some(objects) = context.column::<ObjectColumn>() {
                for (row, column) in context.rows().iter().zip(objects) {
                    if !is_alive(column.object) {
                        dead.push((column.object, *row));
                    }
                }
            }
        });
        for &(object, row) in &dead {
            self.remove_object_row(storage, object, row);
        }
        if !dead.is_empty() {
            tracing::debug!(removed = dead.len(), "Swept rows of collected objects");
        }
        dead.len()
    }

    // ---- Command buffer ----

    /// Run `command` now, or queue it when the command buffer is on
    pub fn submit(&mut self, storage: &mut DataStorage, command: CompatCommand) {
        if self.settings.use_command_buffer {
            self.queue.push(command);
        } else {
            self.execute(storage, command);
        }
    }

    /// Run every queued command; returns how many were executed
    pub fn tick(&mut self, storage: &mut DataStorage) -> usize {
        let mut commands = Vec::new();
        if self.queue.collect(&mut commands) == 0 {
            return 0;
        }
        self.patch(storage, &mut commands);
        self.prepare(storage, &mut commands);
        if self.settings.optimize_command_buffer {
            optimize(&mut commands);
        }
        self.print(&commands);

        let mut executed = 0;
        for command in commands {
            if !command.is_nop() {
                executed += 1;
                self.execute(storage, command);
            }
        }
        executed
    }

    /// Resolve reinstanced types everywhere they are referenced
    fn patch(&mut self, storage: &mut DataStorage, commands: &mut [CompatCommand]) {
        let mut replacements: HashMap<Uuid, TypeHandle> = HashMap::new();
        for command in commands.iter_mut() {
            if let CompatCommand::TypeInfoReinstanced { original, reinstanced } = command {
                replacements.insert(original.id(), Arc::clone(reinstanced));
                *command = CompatCommand::Nop;
            }
        }
        if replacements.is_empty() {
            return;
        }
        let resolve = |type_info: &TypeHandle| -> Option<TypeHandle> {
            let mut current = replacements.get(&type_info.id())?;
            let mut steps = 0;
            while let Some(next) = replacements.get(&current.id()) {
                current = next;
                steps += 1;
                if steps > replacements.len() {
                    tracing::warn!(type_name = type_info.name(), "Reinstancing chain loops");
                    break;
                }
            }
            Some(Arc::clone(current))
        };

        for command in commands.iter_mut() {
            match command {
                CompatCommand::AddCompatibleObject { object, .. } => {
                    if let Some(resolved) = resolve(&object.type_info) {
                        object.type_info = resolved;
                    }
                }
                CompatCommand::AddExternalObject { type_info, .. } => {
                    if let Some(resolved) = resolve(type_info) {
                        *type_info = resolved;
                    }
                }
                _ => {}
            }
        }

        let tables = std::mem::take(&mut self.type_tables);
        for (_, (type_info, table)) in tables {
            let type_info = resolve(&type_info).unwrap_or(type_info);
            self.type_tables.insert(type_info.id(), (type_info, table));
        }

        if let Some(query) = self.type_query {
            let mut patched = 0_usize;
            storage.run_query_with(query, |context| {
                if let Some(types) = context.column_mut::<TypeColumn>() {
                    for column in types.iter_mut() {
                        if let Some(resolved) = column.type_info.as_ref().and_then(&resolve) {
                            column.type_info = Some(resolved);
                            patched += 1;
                        }
                    }
                }
            });
            tracing::debug!(types = replacements.len(), rows = patched, "Patched reinstanced types");
        }
    }

    /// Turn commands that can no longer run into no-ops
    fn prepare(&self, storage: &DataStorage, commands: &mut [CompatCommand]) {
        for command in commands.iter_mut() {
            let runnable = match command {
                CompatCommand::Nop | CompatCommand::TypeInfoReinstanced { .. } => true,
                CompatCommand::AddCompatibleObject { row, .. } | CompatCommand::AddExternalObject { row, .. } => {
                    storage.row_state(*row) == Some(RowState::Reserved)
                }
                CompatCommand::RemoveCompatibleObject { row, .. } => storage.is_row_valid(*row),
                CompatCommand::AddSyncFromWorldTag { object }
                | CompatCommand::AddInteractiveSyncTag { object }
                | CompatCommand::RemoveInteractiveSyncTag { object } => {
                    self.find_row_with_compatible_object(storage, *object).is_some()
                }
                CompatCommand::CreateMemento { memento, target } | CompatCommand::RestoreMemento { memento, target } => {
                    storage.is_row_valid(*memento) && storage.is_row_valid(*target)
                }
                CompatCommand::DestroyMemento { memento } => storage.is_row_valid(*memento),
            };
            if !runnable {
                tracing::trace!(command = command.name(), "Command no longer applies");
                *command = CompatCommand::Nop;
            }
        }
    }

    fn print(&self, commands: &[CompatCommand]) {
        match self.settings.print_command_buffer {
            CommandBufferPrint::Off => {}
            CommandBufferPrint::Summary => {
                let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
                for command in commands {
                    *counts.entry(command.name()).or_default() += 1;
                }
                tracing::info!(commands = ?counts, "Pending compatibility commands");
            }
            CommandBufferPrint::Full => {
                for command in commands.iter().filter(|command| !command.is_nop()) {
                    tracing::info!(command = ?command, "Pending compatibility command");
                }
                let nops = commands.iter().filter(|command| command.is_nop()).count();
                tracing::info!(nops, "Pending compatibility commands");
            }
        }
    }

    fn execute(&mut self, storage: &mut DataStorage, command: CompatCommand) {
        match command {
            CompatCommand::Nop | CompatCommand::TypeInfoReinstanced { .. } => {}
            CompatCommand::AddCompatibleObject { object, row } => {
                let table = self
                    .find_best_matching_table(&object.type_info)
                    .or(self.standard_object_table);
                self.build_row(storage, row, table, ObjectColumn { object: object.id }, object.id, &object.type_info);
            }
            CompatCommand::AddExternalObject { object, type_info, row } => {
                let table = self
                    .find_best_matching_table(&type_info)
                    .or(self.standard_external_table);
                self.build_row(storage, row, table, ExternalObjectColumn { object }, object, &type_info);
            }
            CompatCommand::RemoveCompatibleObject { object, row } => {
                tracing::trace!(object = %object, row = %row, "Removing object row");
                storage.remove_row(row);
            }
            CompatCommand::AddSyncFromWorldTag { object } => {
                if let Some(row) = self.find_row_with_compatible_object(storage, object) {
                    storage.add_column::<SyncFromWorldTag>(row);
                }
            }
            CompatCommand::AddInteractiveSyncTag { object } => {
                if let Some(row) = self.find_row_with_compatible_object(storage, object) {
                    storage.add_column::<SyncFromWorldInteractiveTag>(row);
                }
            }
            CompatCommand::RemoveInteractiveSyncTag { object } => {
                if let Some(row) = self.find_row_with_compatible_object(storage, object) {
                    storage.remove_column::<SyncFromWorldInteractiveTag>(row);
                }
            }
            CompatCommand::CreateMemento { memento, target } => {
                self.mementos.capture(storage, memento, target);
            }
            CompatCommand::RestoreMemento { memento, target } => {
                self.mementos.restore_memento(storage, memento, target);
            }
            CompatCommand::DestroyMemento { memento } => {
                self.mementos.destroy_memento(storage, memento);
            }
        }
    }

    fn build_row<C: Column>(
        &mut self,
        storage: &mut DataStorage,
        row: RowHandle,
        table: Option<TableHandle>,
        identity: C,
        object: ObjectId,
        type_info: &TypeHandle,
    ) {
        let Some(table) = table else {
            tracing::error!(object = %object, type_name = type_info.name(), "No table for object");
            return;
        };
        if !storage.add_reserved_row(row, table) {
            return;
        }
        storage.add_column_data(row, identity);
        storage.add_column_data(
            row,
            TypeColumn {
                type_info: Some(Arc::clone(type_info)),
            },
        );
        tracing::trace!(object = %object, row = %row, table = %table, "Added object row");
        for callback in self.added_callbacks.values_mut() {
            callback(object, type_info, row);
        }
    }
}

impl fmt::Debug for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compatibility")
            .field("settings", &self.settings)
            .field("queued", &self.queue.len())
            .field("filters", &self.filters.len())
            .field("dealiasers", &self.dealiasers.len())
            .field("type_tables", &self.type_tables.len())
            .finish_non_exhaustive()
    }
}

/// Cancel and merge commands per object. Execution keeps queue order; only
/// the per-object view is sorted.
fn optimize(commands: &mut [CompatCommand]) {
    let mut by_object: BTreeMap<ObjectId, Vec<usize>> = BTreeMap::new();
    for (position, command) in commands.iter().enumerate() {
        if let Some(object) = command.object() {
            by_object.entry(object).or_default().push(position);
        }
    }

    let mut cancelled = 0;
    for positions in by_object.values() {
        let mut pending_add = None;
        let mut pending_interactive = None;
        let mut sync_queued = false;
        for &position in positions {
            match commands[position] {
                CompatCommand::AddCompatibleObject { .. } | CompatCommand::AddExternalObject { .. } => {
                    pending_add = Some(position);
                    sync_queued = false;
                }
                CompatCommand::RemoveCompatibleObject { .. } => {
                    if let Some(add) = pending_add.take() {
                        commands[add] = CompatCommand::Nop;
                        cancelled += 1;
                    }
                    pending_interactive = None;
                    sync_queued = false;
                }
                CompatCommand::AddInteractiveSyncTag { .. } => pending_interactive = Some(position),
                CompatCommand::RemoveInteractiveSyncTag { .. } => {
                    if let Some(add) = pending_interactive.take() {
                        commands[add] = CompatCommand::Nop;
                        commands[position] = CompatCommand::Nop;
                        cancelled += 2;
                    }
                }
                CompatCommand::AddSyncFromWorldTag { .. } => {
                    if sync_queued {
                        commands[position] = CompatCommand::Nop;
                        cancelled += 1;
                    }
                    sync_queued = true;
                }
                _ => {}
            }
        }
    }
    if cancelled > 0 {
        tracing::trace!(cancelled, "Optimized compatibility commands");
    }
}

/// Undo of an object registration
#[derive(Debug)]
pub struct RegistrationChange {
    object: CompatibleObject,
}

impl Change for RegistrationChange {
    fn describe(&self) -> String {
        format!("Register {} ({})", self.object.id, self.object.type_info.name())
    }

    fn undo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        compatibility.remove_compatible_object(storage, self.object.id);
    }

    fn redo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        compatibility.add_compatible_object(storage, &self.object);
    }
}

/// Undo of an object removal, restoring its columns from a memento
#[derive(Debug)]
pub struct DeregistrationChange {
    object: CompatibleObject,
    memento: RowHandle,
}

impl Change for DeregistrationChange {
    fn describe(&self) -> String {
        format!("Deregister {} ({})", self.object.id, self.object.type_info.name())
    }

    fn undo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        if let Some(row) = compatibility.add_compatible_object(storage, &self.object) {
            compatibility.submit(
                storage,
                CompatCommand::RestoreMemento {
                    memento: self.memento,
                    target: row,
                },
            );
        }
    }

    fn redo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        if let Some(row) = compatibility.find_row_with_compatible_object(storage, self.object.id) {
            compatibility.mementos.capture(storage, self.memento, row);
            compatibility.remove_object_row(storage, self.object.id, row);
        }
    }

    fn discard(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        compatibility.submit(storage, CompatCommand::DestroyMemento { memento: self.memento });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    #[derive(Default, Clone)]
    struct WidgetTag;
    impl Column for WidgetTag {
        const KIND: ColumnKind = ColumnKind::Tag;
    }

    fn setup(settings: CompatibilitySettings) -> (DataStorage, Compatibility) {
        let mut storage = DataStorage::default();
        let mut compatibility = Compatibility::new(settings);
        compatibility.initialize(&mut storage).unwrap();
        (storage, compatibility)
    }

    #[test]
    fn test_add_is_idempotent_and_deferred() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let object = CompatibleObject::new(ObjectId(1), &actor);

        let row = compatibility.add_compatible_object(&mut storage, &object).unwrap();
        assert_eq!(compatibility.add_compatible_object(&mut storage, &object), Some(row));
        assert_eq!(storage.row_state(row), Some(RowState::Reserved));

        assert_eq!(compatibility.tick(&mut storage), 1);
        assert!(storage.is_row_available(row));
        assert_eq!(storage.get_column::<ObjectColumn>(row), Some(&ObjectColumn { object: ObjectId(1) }));
        assert_eq!(
            compatibility.find_row_with_compatible_object(&storage, ObjectId(1)),
            Some(row)
        );
    }

    #[test]
    fn test_filters_and_best_matching_table() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings {
            use_command_buffer: false,
            ..CompatibilitySettings::default()
        });
        let actor = ObjectType::new("Actor");
        let light = ObjectType::derived("Light", &actor);
        let hidden = ObjectType::new("Hidden");
        let actor_table = storage
            .register_table_from(
                compatibility.standard_object_table().unwrap(),
                &[ColumnType::of::<SyncFromWorldTag>()],
                Some("Actors"),
            )
            .unwrap();
        compatibility.register_type_table_association(&actor, actor_table);
        let hidden_id = hidden.id();
        compatibility.register_registration_filter(move |object| object.type_info.id() != hidden_id);

        let row = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(2), &light))
            .unwrap();
        assert_eq!(storage.row_state(row).and_then(|state| match state {
            RowState::Assigned { table, .. } => Some(table),
            RowState::Reserved => None,
        }), Some(actor_table));
        assert!(compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(3), &hidden))
            .is_none());
        assert!(light.is_a(&actor));
    }

    #[test]
    fn test_removal_callbacks_run_synchronously() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        compatibility.register_object_removed_callback(move |object, type_info, _| {
            sink.lock().push((object, type_info.name().to_string()));
        });

        let row = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(4), &actor))
            .unwrap();
        compatibility.tick(&mut storage);
        assert!(compatibility.remove_compatible_object(&mut storage, ObjectId(4)));
        assert_eq!(*removed.lock(), vec![(ObjectId(4), "Actor".to_string())]);
        assert!(compatibility
            .find_row_with_compatible_object(&storage, ObjectId(4))
            .is_none());
        assert!(storage.is_row_valid(row));

        compatibility.tick(&mut storage);
        assert!(!storage.is_row_valid(row));
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let added = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&added);
        compatibility.register_object_added_callback(move |_, _, _| *counter.lock() += 1);

        let row = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(5), &actor))
            .unwrap();
        compatibility.remove_compatible_object(&mut storage, ObjectId(5));
        compatibility.tick(&mut storage);
        assert_eq!(*added.lock(), 0);
        assert!(!storage.is_row_valid(row));
    }

    #[test]
    fn test_sync_tags_collapse() {
        let mut commands = vec![
            CompatCommand::AddInteractiveSyncTag { object: ObjectId(1) },
            CompatCommand::AddSyncFromWorldTag { object: ObjectId(2) },
            CompatCommand::RemoveInteractiveSyncTag { object: ObjectId(1) },
            CompatCommand::AddSyncFromWorldTag { object: ObjectId(2) },
            CompatCommand::AddSyncFromWorldTag { object: ObjectId(1) },
        ];
        optimize(&mut commands);
        let names: Vec<&str> = commands.iter().map(CompatCommand::name).collect();
        assert_eq!(
            names,
            vec!["Nop", "AddSyncFromWorldTag", "Nop", "Nop", "AddSyncFromWorldTag"]
        );
    }

    #[test]
    fn test_modified_object_gets_sync_tag() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let row = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(6), &actor))
            .unwrap();
        compatibility.on_object_modified(ObjectId(6));
        compatibility.on_pre_property_changed(ObjectId(6));
        compatibility.tick(&mut storage);
        assert!(storage.has_columns(
            row,
            &[ColumnType::of::<SyncFromWorldTag>(), ColumnType::of::<SyncFromWorldInteractiveTag>()]
        ));

        compatibility.on_post_property_changed(ObjectId(6));
        compatibility.tick(&mut storage);
        assert!(!storage.has_columns(row, &[ColumnType::of::<SyncFromWorldInteractiveTag>()]));
    }

    #[test]
    fn test_reinstancing_patches_rows_and_pending_commands() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let old = ObjectType::new("Widget");
        let table = storage
            .register_table_from(
                compatibility.standard_object_table().unwrap(),
                &[ColumnType::of::<WidgetTag>()],
                Some("Widgets"),
            )
            .unwrap();
        compatibility.register_type_table_association(&old, table);

        let live = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(7), &old))
            .unwrap();
        compatibility.tick(&mut storage);
        let pending = compatibility
            .add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(8), &old))
            .unwrap();

        let middle = ObjectType::new("Widget");
        let new = ObjectType::new("Widget");
        compatibility.on_object_reinstanced(&[(Arc::clone(&old), Arc::clone(&middle))]);
        compatibility.on_object_reinstanced(&[(Arc::clone(&middle), Arc::clone(&new))]);
        compatibility.tick(&mut storage);

        for row in [live, pending] {
            let type_info = storage.get_column::<TypeColumn>(row).unwrap().type_info.clone().unwrap();
            assert_eq!(type_info.id(), new.id());
        }
        assert_eq!(compatibility.find_best_matching_table(&new), Some(table));
        assert_eq!(compatibility.find_best_matching_table(&old), None);
    }

    #[test]
    fn test_garbage_collection_sweeps_dead_objects() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings {
            deferred_removes: false,
            ..CompatibilitySettings::default()
        });
        let actor = ObjectType::new("Actor");
        for id in 10..14 {
            compatibility.add_compatible_object(&mut storage, &CompatibleObject::new(ObjectId(id), &actor));
        }
        compatibility.tick(&mut storage);

        let swept = compatibility.on_post_garbage_collection(&mut storage, |object| object.0 % 2 == 0);
        assert_eq!(swept, 2);
        assert!(compatibility.find_row_with_compatible_object(&storage, ObjectId(11)).is_none());
        assert!(compatibility.find_row_with_compatible_object(&storage, ObjectId(12)).is_some());
    }

    #[test]
    fn test_deregistration_undo_restores_columns() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let object = CompatibleObject::new(ObjectId(20), &actor);
        let row = compatibility.add_compatible_object(&mut storage, &object).unwrap();
        compatibility.tick(&mut storage);
        storage.add_column::<SyncFromWorldTag>(row);

        let mut transaction = Transaction::new("Delete");
        assert!(compatibility.remove_compatible_object_recorded(&mut storage, ObjectId(20), &mut transaction));
        compatibility.tick(&mut storage);
        assert!(compatibility.find_row_with_compatible_object(&storage, ObjectId(20)).is_none());
        assert_eq!(transaction.len(), 1);

        let mut history = crate::transaction::TransactionHistory::default();
        history.commit(transaction, &mut storage, &mut compatibility);
        history.undo(&mut storage, &mut compatibility).unwrap();
        compatibility.tick(&mut storage);

        let restored = compatibility
            .find_row_with_compatible_object(&storage, ObjectId(20))
            .unwrap();
        assert!(storage.has_columns(restored, &[ColumnType::of::<SyncFromWorldTag>()]));

        history.redo(&mut storage, &mut compatibility).unwrap();
        compatibility.tick(&mut storage);
        assert!(compatibility.find_row_with_compatible_object(&storage, ObjectId(20)).is_none());
    }

    #[test]
    fn test_remove_then_readd_before_tick_keeps_object() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let object = CompatibleObject::new(ObjectId(21), &actor);
        let old = compatibility.add_compatible_object(&mut storage, &object).unwrap();
        compatibility.tick(&mut storage);

        assert!(compatibility.remove_compatible_object(&mut storage, ObjectId(21)));
        let new = compatibility.add_compatible_object(&mut storage, &object).unwrap();
        assert_ne!(new, old);
        compatibility.tick(&mut storage);

        assert!(!storage.is_row_valid(old));
        assert_eq!(compatibility.find_row_with_compatible_object(&storage, ObjectId(21)), Some(new));
        assert_eq!(storage.get_column::<ObjectColumn>(new), Some(&ObjectColumn { object: ObjectId(21) }));
    }

    #[test]
    fn test_deregistration_undo_before_tick_restores_columns() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let object = CompatibleObject::new(ObjectId(22), &actor);
        let row = compatibility.add_compatible_object(&mut storage, &object).unwrap();
        compatibility.tick(&mut storage);
        storage.add_column::<SyncFromWorldTag>(row);

        let mut transaction = Transaction::new("Delete");
        assert!(compatibility.remove_compatible_object_recorded(&mut storage, ObjectId(22), &mut transaction));
        let mut history = crate::transaction::TransactionHistory::default();
        history.commit(transaction, &mut storage, &mut compatibility);
        history.undo(&mut storage, &mut compatibility).unwrap();
        compatibility.tick(&mut storage);

        assert!(!storage.is_row_valid(row));
        let restored = compatibility
            .find_row_with_compatible_object(&storage, ObjectId(22))
            .unwrap();
        assert!(storage.has_columns(restored, &[ColumnType::of::<SyncFromWorldTag>()]));
    }

    #[test]
    fn test_filter_applies_to_known_objects() {
        let (mut storage, mut compatibility) = setup(CompatibilitySettings::default());
        let actor = ObjectType::new("Actor");
        let object = CompatibleObject::new(ObjectId(23), &actor);
        compatibility.add_compatible_object(&mut storage, &object).unwrap();
        compatibility.tick(&mut storage);

        compatibility.register_registration_filter(|object| object.id != ObjectId(23));
        assert!(compatibility.add_compatible_object(&mut storage, &object).is_none());
        assert!(compatibility.find_row_with_compatible_object(&storage, ObjectId(23)).is_some());
    }
}
