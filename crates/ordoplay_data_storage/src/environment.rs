// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage, compatibility bridge and undo history bundled together.

use crate::compatibility::{Compatibility, CompatibleObject, ObjectId};
use crate::error::Result;
use crate::row::RowHandle;
use crate::settings::EnvironmentSettings;
use crate::storage::DataStorage;
use crate::tick_group::TickPhase;
use crate::transaction::{Transaction, TransactionError, TransactionHistory};

/// Extension names reported by [`Environment::list_extensions`]
pub const EXTENSION_INTEGRATE_WITH_GC: &str = "IntegrateWithGC";
/// Command buffer extension name
pub const EXTENSION_COMMAND_BUFFER: &str = "CompatibilityUsesCommandBuffer";

/// A data storage with its compatibility bridge and transaction history
pub struct Environment {
    settings: EnvironmentSettings,
    storage: DataStorage,
    compatibility: Compatibility,
    history: TransactionHistory,
    transaction: Option<Transaction>,
}

impl Environment {
    /// Create and initialize an environment
    pub fn new(settings: EnvironmentSettings) -> Result<Self> {
        let mut storage = DataStorage::new(settings.storage.clone());
        let mut compatibility = Compatibility::new(settings.compatibility.clone());
        compatibility.initialize(&mut storage)?;
        tracing::info!(
            command_buffer = settings.compatibility.use_command_buffer,
            gc = settings.compatibility.integrate_with_gc,
            "Environment created"
        );
        Ok(Self {
            settings,
            storage,
            compatibility,
            history: TransactionHistory::default(),
            transaction: None,
        })
    }

    /// Settings the environment was created with
    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    /// Storage
    pub fn storage(&self) -> &DataStorage {
        &self.storage
    }

    /// Mutable storage
    pub fn storage_mut(&mut self) -> &mut DataStorage {
        &mut self.storage
    }

    /// Compatibility bridge
    pub fn compatibility(&self) -> &Compatibility {
        &self.compatibility
    }

    /// Mutable compatibility bridge
    pub fn compatibility_mut(&mut self) -> &mut Compatibility {
        &mut self.compatibility
    }

    /// Both halves at once, for callers driving the bridge directly
    pub fn split_mut(&mut self) -> (&mut DataStorage, &mut Compatibility) {
        (&mut self.storage, &mut self.compatibility)
    }

    /// Add an object; recorded when a transaction is open
    pub fn add_compatible_object(&mut self, object: &CompatibleObject) -> Option<RowHandle> {
        match self.transaction.as_mut() {
            Some(transaction) => {
                self.compatibility
                    .add_compatible_object_recorded(&mut self.storage, object, transaction)
            }
            None => self.compatibility.add_compatible_object(&mut self.storage, object),
        }
    }

    /// Remove an object; recorded when a transaction is open
    pub fn remove_compatible_object(&mut self, object: ObjectId) -> bool {
        match self.transaction.as_mut() {
            Some(transaction) => {
                self.compatibility
                    .remove_compatible_object_recorded(&mut self.storage, object, transaction)
            }
            None => self.compatibility.remove_compatible_object(&mut self.storage, object),
        }
    }

    /// Row of `object`
    pub fn find_row_with_compatible_object(&self, object: ObjectId) -> Option<RowHandle> {
        self.compatibility.find_row_with_compatible_object(&self.storage, object)
    }

    // ---- Transactions ----

    /// Start recording changes
    pub fn begin_transaction(&mut self, description: impl Into<String>) -> std::result::Result<(), TransactionError> {
        if let Some(open) = &self.transaction {
            return Err(TransactionError::AlreadyOpen(open.description().to_string()));
        }
        self.transaction = Some(Transaction::new(description));
        Ok(())
    }

    /// Stop recording and commit; returns the number of recorded changes
    pub fn end_transaction(&mut self) -> std::result::Result<usize, TransactionError> {
        let transaction = self.transaction.take().ok_or(TransactionError::NotOpen)?;
        let changes = transaction.len();
        self.history
            .commit(transaction, &mut self.storage, &mut self.compatibility);
        Ok(changes)
    }

    /// Whether a transaction is being recorded
    pub fn is_transaction_open(&self) -> bool {
        self.transaction.is_some()
    }

    /// Undo the latest transaction
    pub fn undo(&mut self) -> std::result::Result<String, TransactionError> {
        let description = self.history.undo(&mut self.storage, &mut self.compatibility)?;
        tracing::info!(transaction = %description, "Undo");
        Ok(description)
    }

    /// Redo the latest undone transaction
    pub fn redo(&mut self) -> std::result::Result<String, TransactionError> {
        let description = self.history.redo(&mut self.storage, &mut self.compatibility)?;
        tracing::info!(transaction = %description, "Redo");
        Ok(description)
    }

    /// Undo and redo state
    pub fn history(&self) -> &TransactionHistory {
        &self.history
    }

    // ---- Ticking ----

    /// One update cycle. Compatibility commands run before the phases so
    /// processors see rows added since the last tick.
    pub fn tick(&mut self) {
        self.storage.begin_update();
        let executed = self.compatibility.tick(&mut self.storage);
        let flushed = self.storage.flush_deferred();
        for phase in TickPhase::ALL {
            self.storage.run_phase(phase);
        }
        self.storage.end_update();
        tracing::trace!(
            cycle = self.storage.update_cycle(),
            compat_commands = executed,
            flushed,
            "Environment tick"
        );
    }

    /// Remove rows of objects `is_alive` rejects
    pub fn collect_garbage(&mut self, is_alive: impl Fn(ObjectId) -> bool) -> usize {
        self.compatibility
            .on_post_garbage_collection(&mut self.storage, is_alive)
    }

    // ---- Extensions ----

    /// Whether the named extension is enabled
    pub fn supports_extension(&self, name: &str) -> bool {
        self.list_extensions().contains(&name)
    }

    /// Enabled extensions
    pub fn list_extensions(&self) -> Vec<&'static str> {
        let compatibility = &self.settings.compatibility;
        let mut extensions = Vec::new();
        if compatibility.integrate_with_gc {
            extensions.push(EXTENSION_INTEGRATE_WITH_GC);
        }
        if compatibility.use_command_buffer {
            extensions.push(EXTENSION_COMMAND_BUFFER);
        }
        extensions
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .field("compatibility", &self.compatibility)
            .field("history", &self.history)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}
