//! Compiled statements owned by a table or link table
//!
//! Statements are prepared through the connection's prepared-statement cache,
//! so compiling once validates the SQL against the live schema and every
//! later execution reuses the same handle. Handles are finalized by the
//! connection when the database closes.

use rusqlite::Connection;
use crate::entity::ID_KEY;
use crate::{Error, Result};

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Upsert, count and delete-by-foreign-key SQL for one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementCache {
    upsert: Option<String>,
    count: Option<String>,
    delete_for_primary: Option<String>,
}

impl StatementCache {
    /// Statements for an entity table: `id` first, then `columns` in order
    pub fn for_table(table_name: &str, columns: &[&str]) -> Self {
        let table = quote_ident(table_name);
        let column_list = std::iter::once(ID_KEY)
            .chain(columns.iter().copied())
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len() + 1)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            upsert: Some(format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                table, column_list, placeholders
            )),
            count: Some(format!("SELECT COUNT(*) FROM {}", table)),
            delete_for_primary: None,
        }
    }

    /// The delete statement of a junction table
    pub fn for_link(table_name: &str, primary_column: &str) -> Self {
        Self {
            upsert: None,
            count: None,
            delete_for_primary: Some(format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(table_name),
                quote_ident(primary_column)
            )),
        }
    }

    pub fn upsert(&self) -> Option<&str> {
        self.upsert.as_deref()
    }

    pub fn count(&self) -> Option<&str> {
        self.count.as_deref()
    }

    pub fn delete_for_primary(&self) -> Option<&str> {
        self.delete_for_primary.as_deref()
    }

    fn all(&self) -> impl Iterator<Item = &str> {
        [self.upsert(), self.count(), self.delete_for_primary()].into_iter().flatten()
    }

    /// Prepare every statement; the first failure is reported as a schema error
    pub fn compile(&self, conn: &Connection) -> Result<()> {
        for sql in self.all() {
            conn.prepare_cached(sql)
                .map_err(|e| Error::Schema(format!("{} ({})", e, sql)))?;
        }
        Ok(())
    }
}
