// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mementos: snapshots of a row's columns kept in their own rows.
//!
//! A memento row lives in `MementoRowBaseTable` and carries only the
//! memento tag and the snapshot, so it never matches queries over regular
//! columns.

use crate::column::{Column, ColumnKey, ColumnKind, ColumnType, ColumnValue};
use crate::error::Result;
use crate::row::{RowHandle, RowState};
use crate::storage::DataStorage;
use crate::table::TableHandle;
use std::sync::Arc;

/// Captured columns of a row
#[derive(Debug, Default)]
pub struct MementoSnapshot {
    /// Tags and dynamic tags
    pub tags: Vec<ColumnKey>,
    /// Data values
    pub values: Vec<Box<dyn ColumnValue>>,
}

/// Snapshot stored in a memento row
#[derive(Debug, Default, Clone)]
pub struct MementoColumn {
    /// Shared snapshot
    pub snapshot: Arc<MementoSnapshot>,
}

impl Column for MementoColumn {}

/// Marks memento rows
#[derive(Debug, Default, Clone)]
pub struct MementoTag;

impl Column for MementoTag {
    const KIND: ColumnKind = ColumnKind::Tag;
}

/// Creates, restores and destroys mementos
#[derive(Debug, Default)]
pub struct MementoSystem {
    table: Option<TableHandle>,
}

impl MementoSystem {
    /// Name of the memento table
    pub const TABLE_NAME: &'static str = "MementoRowBaseTable";

    /// Register the memento table
    pub fn initialize(&mut self, storage: &mut DataStorage) -> Result<()> {
        let table = storage.register_table(
            &[ColumnType::of::<MementoTag>(), ColumnType::of::<MementoColumn>()],
            Some(Self::TABLE_NAME),
        )?;
        self.table = Some(table);
        Ok(())
    }

    /// Memento table, once initialized
    pub fn table(&self) -> Option<TableHandle> {
        self.table
    }

    /// Reserve a memento row and capture `target` into it
    pub fn create_memento(&self, storage: &mut DataStorage, target: RowHandle) -> Option<RowHandle> {
        let memento = storage.reserve_row();
        if self.capture(storage, memento, target) {
            Some(memento)
        } else {
            storage.remove_row(memento);
            None
        }
    }

    /// Capture `target` into `memento`, replacing any earlier snapshot
    pub fn capture(&self, storage: &mut DataStorage, memento: RowHandle, target: RowHandle) -> bool {
        let Some(table) = self.table else {
            tracing::error!("Memento system used before initialization");
            return false;
        };
        let Some(composition) = storage.row_composition(target) else {
            tracing::debug!(target = %target, "Memento of an invalid row");
            return false;
        };
        let snapshot = MementoSnapshot {
            tags: composition.into_iter().filter(|key| !key.is_data()).collect(),
            values: storage.row_values(target),
        };
        tracing::trace!(
            memento = %memento,
            target = %target,
            tags = snapshot.tags.len(),
            values = snapshot.values.len(),
            "Captured memento"
        );
        if storage.row_state(memento) == Some(RowState::Reserved) && !storage.add_reserved_row(memento, table) {
            return false;
        }
        storage.add_column_data(
            memento,
            MementoColumn {
                snapshot: Arc::new(snapshot),
            },
        )
    }

    /// Write the snapshot in `memento` onto `target`
    pub fn restore_memento(&self, storage: &mut DataStorage, memento: RowHandle, target: RowHandle) -> bool {
        let Some(snapshot) = storage
            .get_column::<MementoColumn>(memento)
            .map(|column| Arc::clone(&column.snapshot))
        else {
            tracing::warn!(memento = %memento, "Restore from a row without a snapshot");
            return false;
        };
        for tag in &snapshot.tags {
            match tag {
                ColumnKey::Type(column) => {
                    storage.add_columns(target, &[*column]);
                }
                ColumnKey::DynamicTag { tag, value } => {
                    storage.add_dynamic_tag(target, tag.clone(), value);
                }
            }
        }
        for value in &snapshot.values {
            storage.add_column_value(target, value.clone_value());
        }
        tracing::trace!(memento = %memento, target = %target, "Restored memento");
        true
    }

    /// Release a memento row
    pub fn destroy_memento(&self, storage: &mut DataStorage, memento: RowHandle) -> bool {
        if !storage.has_columns(memento, &[ColumnType::of::<MementoColumn>()])
            && storage.row_state(memento) != Some(RowState::Reserved)
        {
            tracing::debug!(memento = %memento, "Destroy of a row that is not a memento");
            return false;
        }
        storage.remove_row(memento)
    }
}
