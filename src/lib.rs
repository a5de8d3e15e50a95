//! # Lite3 - Object-relational mapping over SQLite
//!
//! Maps property bags to rows in SQLite tables and resolves many-to-many
//! relationships through dedicated link tables.
//!
//! Lite3 provides:
//! - Per-table compiled statements (upsert, count, delete-by-foreign-key)
//! - Uniform binding from typed entities or JSON maps
//! - Insert-or-replace keyed by an integer identifier
//! - Batch imports that tolerate a class-name wrapper around each row
//! - Link-table association loading and counting without loading the full graph

pub mod value;
pub mod date;
pub mod entity;
pub mod storage;
pub mod config;

// Re-exports for convenient access
pub use value::Value;
pub use date::DateFormatter;
pub use entity::{ArgumentSpec, ColumnType, Entity, FieldReader, Property, Record, RowData};
pub use storage::{Database, LinkTable, LinkTableRef, Table, TableRef};

/// Result type alias for Lite3 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Lite3 operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Table or column absent, or a statement failed to prepare
    #[error("Schema error: {0}")]
    Schema(String),

    /// Operation invoked before the table compiled successfully
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    /// Link table whose other side is not registered or not resolved yet
    #[error("Unresolved link: {0}")]
    UnresolvedLink(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Input value missing the expected shape for its column
    #[error("Binding error: {0}")]
    Binding(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn binding(msg: impl Into<String>) -> Self {
        Self::Binding(msg.into())
    }

    /// True for errors raised before anything touched the database
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Schema(_) | Error::InvalidTable(_) | Error::UnresolvedLink(_) | Error::TableNotFound(_)
        )
    }
}
