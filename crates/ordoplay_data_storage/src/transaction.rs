// SPDX-License-Identifier: MIT OR Apache-2.0
//! Undoable changes grouped into transactions.

use crate::compatibility::Compatibility;
use crate::storage::DataStorage;
use std::collections::VecDeque;
use thiserror::Error;

/// Maximum number of transactions kept for undo
const MAX_HISTORY: usize = 100;

/// Transaction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Nothing to undo
    #[error("Nothing to undo")]
    NothingToUndo,

    /// Nothing to redo
    #[error("Nothing to redo")]
    NothingToRedo,

    /// A transaction is already being recorded
    #[error("Transaction '{0}' is already open")]
    AlreadyOpen(String),

    /// No transaction is being recorded
    #[error("No open transaction")]
    NotOpen,
}

/// A reversible change to the storage
pub trait Change: Send {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Revert the change
    fn undo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility);

    /// Apply the change again
    fn redo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility);

    /// Release anything held for undo; the change will not be used again
    fn discard(&mut self, _storage: &mut DataStorage, _compatibility: &mut Compatibility) {}
}

/// Receives changes while a transaction is open
pub trait TransactionRecorder {
    /// Add a change to the open transaction
    fn record(&mut self, change: Box<dyn Change>);
}

/// Changes recorded between begin and end
pub struct Transaction {
    description: String,
    changes: Vec<Box<dyn Change>>,
}

impl Transaction {
    /// Start an empty transaction
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            changes: Vec::new(),
        }
    }

    /// Transaction description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Number of recorded changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn undo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        for change in self.changes.iter_mut().rev() {
            tracing::trace!(change = %change.describe(), "Undo change");
            change.undo(storage, compatibility);
        }
    }

    fn redo(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        for change in &mut self.changes {
            tracing::trace!(change = %change.describe(), "Redo change");
            change.redo(storage, compatibility);
        }
    }

    fn discard(mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        for change in &mut self.changes {
            change.discard(storage, compatibility);
        }
    }
}

impl TransactionRecorder for Transaction {
    fn record(&mut self, change: Box<dyn Change>) {
        self.changes.push(change);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("description", &self.description)
            .field("changes", &self.changes.len())
            .finish()
    }
}

/// Undo and redo stacks of committed transactions
#[derive(Debug)]
pub struct TransactionHistory {
    undo_stack: VecDeque<Transaction>,
    redo_stack: Vec<Transaction>,
    max_depth: usize,
}

impl Default for TransactionHistory {
    fn default() -> Self {
        Self::with_max_depth(MAX_HISTORY)
    }
}

impl TransactionHistory {
    /// Create a history keeping at most `max_depth` transactions
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_depth,
        }
    }

    /// Push a finished transaction. Clears the redo stack.
    pub fn commit(&mut self, transaction: Transaction, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        if transaction.is_empty() {
            tracing::trace!(transaction = %transaction.description(), "Skipping empty transaction");
            return;
        }
        for dropped in self.redo_stack.drain(..) {
            dropped.discard(storage, compatibility);
        }
        tracing::debug!(
            transaction = %transaction.description(),
            changes = transaction.len(),
            "Committed transaction"
        );
        self.undo_stack.push_back(transaction);
        while self.undo_stack.len() > self.max_depth {
            if let Some(oldest) = self.undo_stack.pop_front() {
                oldest.discard(storage, compatibility);
            }
        }
    }

    /// Undo the latest transaction; returns its description
    pub fn undo(
        &mut self,
        storage: &mut DataStorage,
        compatibility: &mut Compatibility,
    ) -> Result<String, TransactionError> {
        let mut transaction = self.undo_stack.pop_back().ok_or(TransactionError::NothingToUndo)?;
        transaction.undo(storage, compatibility);
        let description = transaction.description().to_string();
        self.redo_stack.push(transaction);
        Ok(description)
    }

    /// Redo the latest undone transaction; returns its description
    pub fn redo(
        &mut self,
        storage: &mut DataStorage,
        compatibility: &mut Compatibility,
    ) -> Result<String, TransactionError> {
        let mut transaction = self.redo_stack.pop().ok_or(TransactionError::NothingToRedo)?;
        transaction.redo(storage, compatibility);
        let description = transaction.description().to_string();
        self.undo_stack.push_back(transaction);
        Ok(description)
    }

    /// Whether there is anything to undo
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Whether there is anything to redo
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Drop every transaction, releasing what they hold
    pub fn clear(&mut self, storage: &mut DataStorage, compatibility: &mut Compatibility) {
        for transaction in self.undo_stack.drain(..).chain(self.redo_stack.drain(..)) {
            transaction.discard(storage, compatibility);
        }
    }
}
