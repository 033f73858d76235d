// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed entity data storage for `OrdoPlay` Editor.
//!
//! Rows live in tables grouped by their exact set of columns. Changing a
//! row's columns moves it to the table of its new composition. Rows can be
//! reserved before they have a table; changes made to them are queued and
//! replayed once they are assigned.
//!
//! ## Architecture
//!
//! - [`DataStorage`]: tables, rows, index, queries and tick groups
//! - [`QueryDescription`]: builder for selections, conditions and callbacks
//! - [`Compatibility`]: mirrors outside objects into rows through a command buffer
//! - [`MementoSystem`]: row snapshots used to undo removals
//! - [`Environment`]: everything above plus the transaction history

pub mod column;
pub mod compatibility;
mod deferred;
pub mod environment;
pub mod error;
pub mod index;
pub mod memento;
pub mod query;
pub mod row;
pub mod settings;
pub mod storage;
pub mod table;
pub mod tick_group;
pub mod transaction;

pub use column::{Column, ColumnKey, ColumnKind, ColumnType, ColumnValue, DynamicTag};
pub use compatibility::{
    CallbackId, CompatCommand, CompatCommandQueue, Compatibility, CompatibleObject, ExternalObjectColumn, ObjectColumn,
    ObjectId, ObjectType, SyncFromWorldInteractiveTag, SyncFromWorldTag, TypeColumn, TypeHandle,
};
pub use environment::Environment;
pub use error::{DataStorageError, QueryError, Result};
pub use index::IndexHash;
pub use memento::{MementoColumn, MementoSystem, MementoTag};
pub use query::{
    AccessMode, CallbackKind, Conditions, QueryAction, QueryCommand, QueryCompletion, QueryContext, QueryDescription,
    QueryHandle, QueryResult,
};
pub use row::{RowHandle, RowState};
pub use settings::{CommandBufferPrint, CompatibilitySettings, DataStorageSettings, EnvironmentSettings};
pub use storage::DataStorage;
pub use table::{Composition, Table, TableHandle};
pub use tick_group::{TickGroupName, TickPhase};
pub use transaction::{Change, Transaction, TransactionError, TransactionHistory, TransactionRecorder};
