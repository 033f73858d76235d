// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row handles and the slot allocator behind them.
//!
//! A row moves through three states: free, reserved (a handle exists but
//! the row has no table yet) and assigned (the row lives at an index inside
//! a table). Releasing a row bumps its slot generation so stale handles stop
//! resolving.

use crate::table::TableHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generational handle to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowHandle(u64);

impl RowHandle {
    /// Never refers to a row
    pub const INVALID: Self = Self(u64::MAX);

    fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    /// Slot index
    #[allow(clippy::cast_possible_truncation)]
    pub fn index(&self) -> u32 {
        self.0 as u32
    }

    /// Slot generation
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Packed value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether this is not [`RowHandle::INVALID`]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for RowHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for RowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Row({}:{})", self.index(), self.generation())
        } else {
            f.write_str("Row(invalid)")
        }
    }
}

/// Where a row currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// Handle handed out, no table yet
    Reserved,
    /// Stored in `table` at `index`
    Assigned {
        /// Owning table
        table: TableHandle,
        /// Position inside the table
        index: usize,
    },
}

#[derive(Debug)]
struct RowSlot {
    generation: u32,
    state: Option<RowState>,
}

/// Allocator for row handles
#[derive(Debug, Default)]
pub(crate) struct RowSlots {
    slots: Vec<RowSlot>,
    free: Vec<u32>,
    live: usize,
}

impl RowSlots {
    pub fn reserve(&mut self) -> RowHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(RowState::Reserved);
            return RowHandle::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX - 1);
        self.slots.push(RowSlot {
            generation: 0,
            state: Some(RowState::Reserved),
        });
        RowHandle::new(index, 0)
    }

    fn slot(&self, row: RowHandle) -> Option<&RowSlot> {
        self.slots
            .get(row.index() as usize)
            .filter(|slot| slot.generation == row.generation())
    }

    fn slot_mut(&mut self, row: RowHandle) -> Option<&mut RowSlot> {
        self.slots
            .get_mut(row.index() as usize)
            .filter(|slot| slot.generation == row.generation())
    }

    pub fn state(&self, row: RowHandle) -> Option<RowState> {
        self.slot(row).and_then(|slot| slot.state)
    }

    pub fn location(&self, row: RowHandle) -> Option<(TableHandle, usize)> {
        match self.state(row)? {
            RowState::Assigned { table, index } => Some((table, index)),
            RowState::Reserved => None,
        }
    }

    pub fn set_state(&mut self, row: RowHandle, state: RowState) -> bool {
        match self.slot_mut(row) {
            Some(slot) if slot.state.is_some() => {
                slot.state = Some(state);
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, row: RowHandle) -> bool {
        let Some(slot) = self.slot_mut(row) else {
            return false;
        };
        if slot.state.take().is_none() {
            return false;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(row.index());
        self.live -= 1;
        true
    }

    pub fn live(&self) -> usize {
        self.live
    }
}
