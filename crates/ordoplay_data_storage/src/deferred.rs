// SPDX-License-Identifier: MIT OR Apache-2.0
//! Composition changes queued for rows that are not live yet.
//!
//! Commands targeting a reserved row, or a row that still has queued
//! commands, wait here until the next flush so replay order always matches
//! call order.

use crate::column::{Column, ColumnKey, ColumnType, ColumnValue};
use crate::row::RowHandle;
use crate::table::Composition;
use indexmap::IndexMap;

/// A queued change to one row
#[derive(Debug)]
pub enum DeferredCommand {
    /// Combined composition change
    AddRemoveColumns {
        /// Keys to add
        add: Vec<ColumnKey>,
        /// Keys to remove
        remove: Vec<ColumnKey>,
    },
    /// Add a data column with a value
    AddColumnData(Box<dyn ColumnValue>),
}

impl DeferredCommand {
    fn apply_to(&self, composition: &mut Composition) {
        match self {
            Self::AddRemoveColumns { add, remove } => {
                apply_add_remove(composition, add, remove);
            }
            Self::AddColumnData(value) => {
                composition.insert(ColumnKey::Type(value.column_type()));
            }
        }
    }
}

/// Composition after adding `add` and removing `remove`.
///
/// A row carries at most one value per dynamic tag, so adding a dynamic tag
/// replaces any other value of the same tag.
pub(crate) fn apply_add_remove(composition: &mut Composition, add: &[ColumnKey], remove: &[ColumnKey]) {
    for key in add {
        if let ColumnKey::DynamicTag { tag, .. } = key {
            composition.retain(|existing| existing.dynamic_tag() != Some(tag));
        }
        composition.insert(key.clone());
    }
    for key in remove {
        composition.remove(key);
    }
}

/// Queued commands per row, in first-queued order
#[derive(Debug, Default)]
pub(crate) struct DeferredCommands {
    rows: IndexMap<RowHandle, Vec<DeferredCommand>>,
}

impl DeferredCommands {
    pub fn push(&mut self, row: RowHandle, command: DeferredCommand) {
        self.rows.entry(row).or_default().push(command);
    }

    pub fn has_commands(&self, row: RowHandle) -> bool {
        self.rows.contains_key(&row)
    }

    pub fn take(&mut self, row: RowHandle) -> Option<Vec<DeferredCommand>> {
        self.rows.shift_remove(&row)
    }

    /// Drop commands for a row that went away
    pub fn discard(&mut self, row: RowHandle) -> usize {
        self.rows.shift_remove(&row).map_or(0, |commands| commands.len())
    }

    pub fn rows(&self) -> impl Iterator<Item = RowHandle> + '_ {
        self.rows.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    /// Values queued for `row`, oldest first
    pub fn queued_values(&self, row: RowHandle) -> impl Iterator<Item = &dyn ColumnValue> + '_ {
        self.rows
            .get(&row)
            .into_iter()
            .flatten()
            .filter_map(|command| match command {
                DeferredCommand::AddColumnData(value) => Some(value.as_ref()),
                DeferredCommand::AddRemoveColumns { .. } => None,
            })
    }

    /// Composition of `base` after replaying the queued commands of `row`
    pub fn effective_composition(&self, row: RowHandle, base: Option<&Composition>) -> Composition {
        let mut composition = base.cloned().unwrap_or_default();
        if let Some(commands) = self.rows.get(&row) {
            for command in commands {
                command.apply_to(&mut composition);
            }
        }
        composition
    }

    /// Most recent queued value of `T` for `row` that was not removed afterwards.
    ///
    /// `Some(None)` means a queued command removes the column.
    fn queued<T: Column>(&self, row: RowHandle) -> Option<Option<usize>> {
        let column = ColumnKey::Type(ColumnType::of::<T>());
        let commands = self.rows.get(&row)?;
        for (position, command) in commands.iter().enumerate().rev() {
            match command {
                DeferredCommand::AddColumnData(value) if value.column_type() == ColumnType::of::<T>() => {
                    return Some(Some(position));
                }
                DeferredCommand::AddRemoveColumns { remove, .. } if remove.contains(&column) => {
                    return Some(None);
                }
                _ => {}
            }
        }
        None
    }

    /// Queued value of `T`; `Err(())` when the queue removes the column
    #[allow(clippy::result_unit_err)]
    pub fn value<T: Column>(&self, row: RowHandle) -> Result<Option<&T>, ()> {
        match self.queued::<T>(row) {
            None => Ok(None),
            Some(None) => Err(()),
            Some(Some(position)) => match &self.rows[&row][position] {
                DeferredCommand::AddColumnData(value) => Ok(value.as_any().downcast_ref::<T>()),
                DeferredCommand::AddRemoveColumns { .. } => Ok(None),
            },
        }
    }

    /// Mutable queued value of `T`
    #[allow(clippy::result_unit_err)]
    pub fn value_mut<T: Column>(&mut self, row: RowHandle) -> Result<Option<&mut T>, ()> {
        match self.queued::<T>(row) {
            None => Ok(None),
            Some(None) => Err(()),
            Some(Some(position)) => match self.rows.get_mut(&row).and_then(|commands| commands.get_mut(position)) {
                Some(DeferredCommand::AddColumnData(value)) => Ok(value.as_any_mut().downcast_mut::<T>()),
                _ => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnKind, DynamicTag};
    use crate::row::RowSlots;
    use std::sync::Arc;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Counter(u32);
    impl Column for Counter {}

    #[derive(Default, Clone)]
    struct Marked;
    impl Column for Marked {
        const KIND: ColumnKind = ColumnKind::Tag;
    }

    #[test]
    fn test_effective_composition_replays_in_order() {
        let mut slots = RowSlots::default();
        let row = slots.reserve();
        let mut deferred = DeferredCommands::default();
        deferred.push(
            row,
            DeferredCommand::AddRemoveColumns {
                add: vec![ColumnKey::of::<Marked>()],
                remove: vec![],
            },
        );
        deferred.push(row, DeferredCommand::AddColumnData(Box::new(Counter(5))));
        deferred.push(
            row,
            DeferredCommand::AddRemoveColumns {
                add: vec![],
                remove: vec![ColumnKey::of::<Marked>()],
            },
        );

        let composition = deferred.effective_composition(row, None);
        assert!(composition.contains(&ColumnKey::of::<Counter>()));
        assert!(!composition.contains(&ColumnKey::of::<Marked>()));
        assert_eq!(deferred.value::<Counter>(row), Ok(Some(&Counter(5))));
        assert_eq!(deferred.len(), 3);
        assert_eq!(deferred.discard(row), 3);
        assert!(!deferred.has_commands(row));
    }

    #[test]
    fn test_dynamic_tag_replaces_previous_value() {
        let tag = DynamicTag::new("Layer");
        let mut composition = Composition::new();
        let first = ColumnKey::DynamicTag {
            tag: tag.clone(),
            value: Arc::from("Background"),
        };
        let second = ColumnKey::DynamicTag {
            tag,
            value: Arc::from("Foreground"),
        };
        apply_add_remove(&mut composition, &[first.clone()], &[]);
        apply_add_remove(&mut composition, &[second.clone()], &[]);
        assert!(!composition.contains(&first));
        assert!(composition.contains(&second));
    }
}
