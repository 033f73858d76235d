// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types.

use crate::query::QueryHandle;
use crate::table::TableHandle;
use thiserror::Error;

/// Table registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataStorageError {
    /// A table with this name exists with another composition
    #[error("Table '{0}' is already registered with a different composition")]
    TableAlreadyRegistered(String),

    /// Handle does not refer to a table
    #[error("Unknown table {0}")]
    UnknownTable(TableHandle),
}

/// Result type for table registration
pub type Result<T> = std::result::Result<T, DataStorageError>;

/// Query compilation errors; the query is not registered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Count queries take no selection
    #[error("Count query '{0}' selects columns")]
    CountWithSelection(String),

    /// Tags carry no data and cannot be selected
    #[error("Tag '{column}' selected by query '{query}'")]
    TagSelected {
        /// Query name
        query: String,
        /// Offending column
        column: &'static str,
    },

    /// The same column selected twice
    #[error("Column '{column}' selected twice by query '{query}'")]
    DuplicateSelection {
        /// Query name
        query: String,
        /// Offending column
        column: &'static str,
    },

    /// A callback kind other than none needs a function
    #[error("Query '{0}' has a callback kind but no function")]
    MissingFunction(String),

    /// Observers need a monitored column
    #[error("Observer '{0}' does not monitor a column")]
    MissingMonitoredColumn(String),

    /// Dependency not registered with the storage
    #[error("Query '{query}' depends on unregistered '{dependency}'")]
    UnknownDependency {
        /// Query name
        query: String,
        /// Dependency type name
        dependency: &'static str,
    },

    /// Subquery handle is not live
    #[error("Query '{query}' uses dead subquery {subquery}")]
    InvalidSubquery {
        /// Query name
        query: String,
        /// Subquery handle
        subquery: QueryHandle,
    },

    /// Two filters on one dynamic tag
    #[error("Query '{query}' filters dynamic tag '{tag}' twice")]
    DuplicateDynamicTagFilter {
        /// Query name
        query: String,
        /// Tag name
        tag: String,
    },
}
