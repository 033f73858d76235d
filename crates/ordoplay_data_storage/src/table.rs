// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tables: rows sharing one composition, stored column by column.

use crate::column::{Column, ColumnKey, ColumnStorage, ColumnType, ColumnValue, TypedColumn};
use crate::row::RowHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Set of column keys that identifies a table
pub type Composition = BTreeSet<ColumnKey>;

/// Handle to a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableHandle(pub u32);

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({})", self.0)
    }
}

pub(crate) struct ColumnData {
    pub column: ColumnType,
    pub storage: Box<dyn ColumnStorage>,
}

/// Rows with one composition
pub struct Table {
    handle: TableHandle,
    name: Option<String>,
    composition: Composition,
    columns: Vec<ColumnData>,
    rows: Vec<RowHandle>,
}

impl Table {
    pub(crate) fn new(handle: TableHandle, name: Option<String>, composition: Composition) -> Self {
        let columns = composition
            .iter()
            .filter_map(ColumnKey::column_type)
            .filter(|column| !column.is_tag())
            .map(|column| ColumnData {
                column,
                storage: column.new_storage(),
            })
            .collect();
        Self {
            handle,
            name,
            composition,
            columns,
            rows: Vec::new(),
        }
    }

    /// Table handle
    pub fn handle(&self) -> TableHandle {
        self.handle
    }

    /// Registered name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Columns, tags and dynamic tags of every row
    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    /// Rows in storage order
    pub fn rows(&self) -> &[RowHandle] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn column_position(&self, column: ColumnType) -> Option<usize> {
        self.columns.iter().position(|data| data.column == column)
    }

    pub(crate) fn column_data_mut(&mut self) -> &mut [ColumnData] {
        &mut self.columns
    }

    /// All values of column `T`
    pub fn column<T: Column>(&self) -> Option<&[T]> {
        let position = self.column_position(ColumnType::of::<T>())?;
        self.columns[position]
            .storage
            .as_any()
            .downcast_ref::<TypedColumn<T>>()
            .map(|typed| typed.values.as_slice())
    }

    /// All values of column `T`, mutably
    pub fn column_mut<T: Column>(&mut self) -> Option<&mut [T]> {
        let position = self.column_position(ColumnType::of::<T>())?;
        self.columns[position]
            .storage
            .as_any_mut()
            .downcast_mut::<TypedColumn<T>>()
            .map(|typed| typed.values.as_mut_slice())
    }

    /// Append `row` with default values; returns its index
    pub(crate) fn push_row(&mut self, row: RowHandle) -> usize {
        for data in &mut self.columns {
            data.storage.push_default();
        }
        self.rows.push(row);
        self.rows.len() - 1
    }

    /// Remove the row at `index`; returns the row that moved into its place
    pub(crate) fn swap_remove_row(&mut self, index: usize) -> Option<RowHandle> {
        if index >= self.rows.len() {
            return None;
        }
        for data in &mut self.columns {
            data.storage.swap_remove(index);
        }
        self.rows.swap_remove(index);
        self.rows.get(index).copied()
    }

    /// Move the row at `index` into `target`, keeping the values of shared
    /// columns. Returns the row's new index and the row that moved into the
    /// vacated slot.
    pub(crate) fn move_row_to(&mut self, index: usize, target: &mut Table) -> (usize, Option<RowHandle>) {
        let row = self.rows[index];
        for target_data in &mut target.columns {
            match self.columns.iter_mut().find(|data| data.column == target_data.column) {
                Some(source_data) => source_data.storage.transfer(index, &mut *target_data.storage),
                None => target_data.storage.push_default(),
            }
        }
        for source_data in &mut self.columns {
            if target.column_position(source_data.column).is_none() {
                source_data.storage.swap_remove(index);
            }
        }
        target.rows.push(row);
        self.rows.swap_remove(index);
        debug_assert!(self.columns.iter().all(|data| data.storage.len() == self.rows.len()));
        (target.rows.len() - 1, self.rows.get(index).copied())
    }

    pub(crate) fn set_value(&mut self, index: usize, value: Box<dyn ColumnValue>) -> bool {
        let Some(position) = self.column_position(value.column_type()) else {
            return false;
        };
        self.columns[position].storage.set_value(index, value)
    }

    pub(crate) fn values(&self, index: usize) -> Vec<Box<dyn ColumnValue>> {
        self.columns
            .iter()
            .filter_map(|data| data.storage.value(index))
            .collect()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("composition", &self.composition)
            .field("rows", &self.rows.len())
            .finish()
    }
}

/// Mutable access to two distinct tables
pub(crate) fn two_tables_mut(tables: &mut [Table], a: usize, b: usize) -> (&mut Table, &mut Table) {
    debug_assert_ne!(a, b);
    if a < b {
        let (head, tail) = tables.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = tables.split_at_mut(a);
        (&mut tail[0], &mut head[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnKind;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position(f32);
    impl Column for Position {}

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Velocity(f32);
    impl Column for Velocity {}

    #[derive(Default, Clone)]
    struct Selected;
    impl Column for Selected {
        const KIND: ColumnKind = ColumnKind::Tag;
    }

    fn composition(keys: &[ColumnKey]) -> Composition {
        keys.iter().cloned().collect()
    }

    #[test]
    fn test_tags_have_no_storage() {
        let table = Table::new(
            TableHandle(0),
            None,
            composition(&[ColumnKey::of::<Position>(), ColumnKey::of::<Selected>()]),
        );
        assert!(table.column::<Position>().is_some());
        assert!(table.column::<Selected>().is_none());
        assert_eq!(table.composition().len(), 2);
    }

    #[test]
    fn test_move_row_keeps_shared_values() {
        let mut tables = vec![
            Table::new(
                TableHandle(0),
                None,
                composition(&[ColumnKey::of::<Position>(), ColumnKey::of::<Velocity>()]),
            ),
            Table::new(TableHandle(1), None, composition(&[ColumnKey::of::<Position>()])),
        ];
        let first = RowHandle::INVALID;
        tables[0].push_row(first);
        tables[0].push_row(first);
        tables[0].column_mut::<Position>().unwrap()[0] = Position(1.0);
        tables[0].column_mut::<Position>().unwrap()[1] = Position(2.0);
        tables[0].column_mut::<Velocity>().unwrap()[1] = Velocity(9.0);

        let (source, target) = two_tables_mut(&mut tables, 0, 1);
        let (index, _) = source.move_row_to(0, target);
        assert_eq!(index, 0);
        assert_eq!(tables[1].column::<Position>().unwrap(), &[Position(1.0)]);
        assert_eq!(tables[0].column::<Position>().unwrap(), &[Position(2.0)]);
        assert_eq!(tables[0].column::<Velocity>().unwrap(), &[Velocity(9.0)]);
    }
}
