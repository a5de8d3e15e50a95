//! SQLite database: connection, table registry and transactions

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use rusqlite::Connection;
use tracing::{debug, info, warn};
use crate::config::{ensure_db_dir, load_config, Lite3Config};
use crate::date::DateFormatter;
use crate::entity::{ArgumentSpec, ColumnType, Entity, ID_KEY};
use crate::{Error, Result};
use super::link_table::{LinkTable, LinkTableRef};
use super::schema;
use super::table::{Table, TableRef};

/// Owns the connection and every registered table and link table.
///
/// Not safe for concurrent use; callers serialize access to one `Database`.
pub struct Database {
    conn: Connection,
    tables: HashMap<String, Table>,
    link_tables: BTreeMap<String, LinkTable>,
    date_formatter: DateFormatter,
}

impl Database {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        info!("Opened database {}", path.display());
        Ok(Self::with_connection(conn))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn))
    }

    /// Open the database described by a config, creating its directory
    pub fn from_config(config: &Lite3Config) -> Result<Self> {
        let db = match config.database_path() {
            Some(path) => {
                ensure_db_dir(path)?;
                Self::open(path)?
            }
            None => Self::open_in_memory()?,
        };
        if let Some(capacity) = config.statement_cache_capacity {
            db.conn.set_prepared_statement_cache_capacity(capacity);
        }
        match &config.date_format {
            Some(pattern) => Ok(db.with_date_formatter(DateFormatter::new(pattern.clone())?)),
            None => Ok(db),
        }
    }

    /// Open the database named by a config file (`lite3.toml` by default).
    /// A missing file means the default config: an in-memory database.
    pub fn from_config_file(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = load_config(path)?.unwrap_or_default();
        Ok(Self::from_config(&config)?)
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            tables: HashMap::new(),
            link_tables: BTreeMap::new(),
            date_formatter: DateFormatter::default(),
        }
    }

    /// Formatter handed to tables registered through this database
    pub fn with_date_formatter(mut self, date_formatter: DateFormatter) -> Self {
        self.date_formatter = date_formatter;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn date_formatter(&self) -> &DateFormatter {
        &self.date_formatter
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Check the schema catalog for a table name
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // ========== Schema Bootstrapping ==========

    /// Create the table behind `table` if it does not exist
    pub fn ensure_table(&self, table: &Table) -> Result<()> {
        self.conn.execute_batch(&schema::create_table_sql(table))?;
        Ok(())
    }

    /// Create the junction table behind `link` and its indexes if missing
    pub fn ensure_link_table(&self, link: &LinkTable) -> Result<()> {
        for stmt in schema::link_table_statements(link) {
            self.conn.execute_batch(&stmt)?;
        }
        Ok(())
    }

    // ========== Registration ==========

    /// Register a table under its class name, compiled or not.
    /// A table already registered for the class is replaced.
    pub fn add_table(&mut self, table: Table) {
        if let Some(previous) = self.tables.insert(table.class_name().to_string(), table) {
            warn!("Replaced table {} for class {}", previous.name(), previous.class_name());
        }
    }

    /// Build, compile and register the table of an entity type
    pub fn register_entity<T: Entity>(&mut self, table_name: &str) -> Result<()> {
        let mut table = Table::for_entity::<T>(table_name).with_date_formatter(self.date_formatter.clone());
        table.compile_statements(&self.conn)?;
        self.add_table(table);
        Ok(())
    }

    /// Register a table whose argument specs come from the live schema.
    ///
    /// Every column except `id` becomes a spec, typed from its declared type.
    pub fn register_table_from_schema(&mut self, table_name: &str, class_name: &str) -> Result<()> {
        let mut stmt = self.conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let arguments = stmt
            .query_map([table_name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|(name, _)| name != ID_KEY)
            .map(|(name, declared)| ArgumentSpec::new(name, ColumnType::from_declared(&declared)))
            .collect::<Vec<_>>();
        drop(stmt);

        if arguments.is_empty() {
            return Err(Error::Schema(format!("Table {} does not exist or has no columns", table_name)));
        }

        let mut table = Table::new(table_name, class_name, arguments).with_date_formatter(self.date_formatter.clone());
        table.compile_statements(&self.conn)?;
        self.add_table(table);
        Ok(())
    }

    /// Compile a registered table that was added uncompiled
    pub fn compile_table(&mut self, class_name: &str) -> Result<()> {
        let table = self
            .tables
            .get_mut(class_name)
            .ok_or_else(|| Error::TableNotFound(class_name.to_string()))?;
        table.compile_statements(&self.conn)
    }

    pub fn add_link_table(&mut self, link: LinkTable) {
        if let Some(previous) = self.link_tables.insert(link.name().to_string(), link) {
            warn!("Replaced link table {}", previous.name());
        }
    }

    /// Build, compile and register a junction table
    pub fn register_link(&mut self, name: &str, primary_class_name: &str, secondary_class_name: &str) -> Result<()> {
        let mut link = LinkTable::new(name, primary_class_name, secondary_class_name);
        link.compile_statements(&self.conn)?;
        self.add_link_table(link);
        Ok(())
    }

    /// Second bootstrap pass: point every link table at its secondary table.
    ///
    /// Link tables whose secondary class is not registered stay unresolved and
    /// are reported together.
    pub fn resolve_links(&mut self) -> Result<()> {
        let tables = &self.tables;
        let mut unresolved = Vec::new();
        for link in self.link_tables.values_mut() {
            let secondary = link.secondary_class_name().to_string();
            if tables.contains_key(&secondary) {
                link.set_secondary_table(Some(secondary));
            } else {
                link.set_secondary_table(None);
                unresolved.push(format!("{} -> {}", link.name(), secondary));
            }
        }

        if unresolved.is_empty() {
            debug!("Resolved {} link tables", self.link_tables.len());
            Ok(())
        } else {
            Err(Error::UnresolvedLink(unresolved.join(", ")))
        }
    }

    // ========== Lookup ==========

    /// The table registered for a class name
    pub fn table(&self, class_name: &str) -> Result<TableRef<'_>> {
        self.tables
            .get(class_name)
            .map(|table| TableRef::new(self, table))
            .ok_or_else(|| Error::TableNotFound(class_name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = TableRef<'_>> {
        self.tables.values().map(move |table| TableRef::new(self, table))
    }

    pub fn link_table(&self, name: &str) -> Result<LinkTableRef<'_>> {
        self.link_tables
            .get(name)
            .map(|link| LinkTableRef::new(self, link))
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn link_tables(&self) -> impl Iterator<Item = LinkTableRef<'_>> {
        self.link_tables.values().map(move |link| LinkTableRef::new(self, link))
    }

    // ========== Transactions ==========

    /// Begin a transaction for `*_no_transaction` calls
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    /// Commit a transaction
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Rollback a transaction
    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Close the connection, finalizing every cached statement
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Storage(e))
    }
}
