//! Table - maps one entity class to one SQLite table
//!
//! A [`Table`] holds the definition (argument specs, compiled statements, date
//! formatter). Operations run through a [`TableRef`], which pairs the
//! definition with the owning [`Database`] so link properties can reach their
//! link tables and the other side of the relationship.

use std::collections::{HashMap, HashSet};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use crate::date::DateFormatter;
use crate::entity::{ArgumentSpec, Entity, Record, RowData, ID_KEY};
use crate::value::Value;
use crate::{Error, Result};
use super::database::Database;
use super::link_table::LinkTableRef;
use super::statements::{quote_ident, StatementCache};

/// A selected row: identifier plus one value per column spec
type RowValues = (Option<i64>, Vec<Value>);

/// Mapping between one entity class and one table
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    class_name: String,
    class_name_lowercase: String,
    arguments: Vec<ArgumentSpec>,
    statements: Option<StatementCache>,
    date_formatter: DateFormatter,
}

impl Table {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>, arguments: Vec<ArgumentSpec>) -> Self {
        let class_name = class_name.into();
        Self {
            name: name.into(),
            class_name_lowercase: class_name.to_lowercase(),
            class_name,
            arguments,
            statements: None,
            date_formatter: DateFormatter::default(),
        }
    }

    /// Table bound to an entity type, with specs taken from its properties
    pub fn for_entity<T: Entity>(name: impl Into<String>) -> Self {
        Self::new(name, T::CLASS_NAME, T::argument_specs())
    }

    pub fn with_date_formatter(mut self, date_formatter: DateFormatter) -> Self {
        self.date_formatter = date_formatter;
        self
    }

    /// Replace the argument specs; the table must be compiled again
    pub fn set_arguments(&mut self, arguments: Vec<ArgumentSpec>) {
        self.arguments = arguments;
        self.statements = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn class_name_lowercase(&self) -> &str {
        &self.class_name_lowercase
    }

    pub fn arguments(&self) -> &[ArgumentSpec] {
        &self.arguments
    }

    pub fn date_formatter(&self) -> &DateFormatter {
        &self.date_formatter
    }

    /// Specs backed by a column, in placeholder order
    pub fn column_specs(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.arguments.iter().filter(|spec| !spec.is_link())
    }

    pub fn link_specs(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.arguments.iter().filter(|spec| spec.is_link())
    }

    /// Argument specs set and statements compiled
    pub fn is_valid(&self) -> bool {
        !self.arguments.is_empty() && self.statements.is_some()
    }

    /// Compile the upsert and count statements.
    ///
    /// Compiling an already valid table does nothing, so statements are never
    /// prepared twice. On failure the table stays invalid.
    pub fn compile_statements(&mut self, conn: &Connection) -> Result<()> {
        if self.is_valid() {
            warn!("Statements for {} are already compiled", self.name);
            return Ok(());
        }
        if self.arguments.is_empty() {
            return Err(Error::Schema(format!("Table {} has no argument specs", self.name)));
        }

        let columns: Vec<&str> = self.column_specs().map(|spec| spec.property_name.as_str()).collect();
        let statements = StatementCache::for_table(&self.name, &columns);
        if let Err(e) = statements.compile(conn) {
            warn!("Failed to compile statements for {}: {}", self.name, e);
            return Err(e);
        }

        debug!("Compiled statements for {} ({} columns)", self.name, columns.len());
        self.statements = Some(statements);
        Ok(())
    }

    /// Check the schema catalog for this table
    pub fn table_exists(&self, conn: &Connection) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [&self.name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub(crate) fn ensure_valid(&self) -> Result<&StatementCache> {
        match &self.statements {
            Some(statements) if !self.arguments.is_empty() => Ok(statements),
            _ => Err(Error::InvalidTable(format!("{} has no compiled statements", self.name))),
        }
    }

    /// Bind the column values of `data` and execute the upsert.
    /// Returns the bound identifier, or the one assigned by the engine.
    pub(crate) fn upsert_row(&self, conn: &Connection, data: RowData<'_>) -> Result<i64> {
        let statements = self.ensure_valid()?;
        let sql = statements
            .upsert()
            .ok_or_else(|| Error::InvalidTable(format!("{} has no upsert statement", self.name)))?;

        let id = data.identifier()?;
        let mut params = Vec::with_capacity(self.arguments.len() + 1);
        params.push(id.map_or(SqlValue::Null, SqlValue::Integer));
        for spec in self.column_specs() {
            let value = data.field(&spec.accessor_key)?.unwrap_or_default();
            params.push(value.bind(&spec.property_name, spec.column_type, &self.date_formatter)?);
        }

        let mut stmt = conn.prepare_cached(sql)?;
        stmt.execute(params_from_iter(params))?;
        let row_id = id.unwrap_or_else(|| conn.last_insert_rowid());
        debug!("Upserted {} row {}", self.name, row_id);
        Ok(row_id)
    }

    pub(crate) fn count(&self, conn: &Connection, where_clause: Option<&str>) -> Result<usize> {
        let statements = self.ensure_valid()?;
        let count: i64 = match where_clause.map(str::trim).filter(|clause| !clause.is_empty()) {
            None => {
                let sql = statements
                    .count()
                    .ok_or_else(|| Error::InvalidTable(format!("{} has no count statement", self.name)))?;
                conn.prepare_cached(sql)?.query_row([], |row| row.get(0))?
            }
            Some(clause) => {
                let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(&self.name), clause);
                let mut stmt = prepare_without_placeholders(conn, &sql)?;
                stmt.query_row([], |row| row.get(0))?
            }
        };
        Ok(count as usize)
    }

    pub(crate) fn truncate(&self, conn: &Connection) -> Result<usize> {
        self.ensure_valid()?;
        let deleted = conn.execute(&format!("DELETE FROM {}", quote_ident(&self.name)), [])?;
        debug!("Truncated {} ({} rows)", self.name, deleted);
        Ok(deleted)
    }

    fn select_prefix(&self) -> String {
        let columns = std::iter::once(ID_KEY)
            .chain(self.column_specs().map(|spec| spec.property_name.as_str()))
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT {} FROM {}", columns, quote_ident(&self.name))
    }

    /// Run a select and read the whole result set before returning
    fn query_rows(&self, conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<RowValues>> {
        self.ensure_valid()?;
        let mut stmt = conn.prepare(sql)?;
        if stmt.parameter_count() != params.len() {
            return Err(Error::binding(format!("Unbound placeholders in select: {}", sql)));
        }

        let specs: Vec<&ArgumentSpec> = self.column_specs().collect();
        let mut rows = stmt.query(params)?;
        let mut selected = Vec::new();
        while let Some(row) = rows.next()? {
            let id: Option<i64> = row.get(0)?;
            let mut values = Vec::with_capacity(specs.len());
            for (i, spec) in specs.iter().enumerate() {
                values.push(Value::from_column(row.get_ref(i + 1)?, spec.column_type, &self.date_formatter)?);
            }
            selected.push((id, values));
        }
        Ok(selected)
    }

    pub(crate) fn select(&self, conn: &Connection, clause: &str) -> Result<Vec<RowValues>> {
        let sql = format!("{}{}", self.select_prefix(), clause_tail(clause));
        self.query_rows(conn, &sql, &[])
    }

    pub(crate) fn select_range(
        &self,
        conn: &Connection,
        where_clause: Option<&str>,
        start: usize,
        count: Option<usize>,
        order_by: Option<&str>,
    ) -> Result<Vec<RowValues>> {
        self.ensure_valid()?;
        let mut sql = self.select_prefix();
        if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(order) = order_by.map(str::trim).filter(|o| !o.is_empty()) {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        // Caller fragments must not reach the LIMIT/OFFSET parameters
        prepare_without_placeholders(conn, &sql)?;
        sql.push_str(" LIMIT ?1 OFFSET ?2");

        let limit = count.map_or(-1, |n| n as i64);
        let offset = start as i64;
        self.query_rows(conn, &sql, &[&limit, &offset])
    }

    pub(crate) fn select_by_id(&self, conn: &Connection, id: i64) -> Result<Option<RowValues>> {
        let sql = format!("{} WHERE {} = ?1", self.select_prefix(), quote_ident(ID_KEY));
        Ok(self.query_rows(conn, &sql, &[&id])?.into_iter().next())
    }

    fn to_record(&self, (id, values): RowValues) -> Record {
        let mut record = Record::new();
        record.insert(ID_KEY.to_string(), id.map_or(JsonValue::Null, JsonValue::from));
        for (spec, value) in self.column_specs().zip(values) {
            record.insert(spec.property_name.clone(), value.to_json(&self.date_formatter));
        }
        record
    }

    fn to_entity<T: Entity>(&self, (id, values): RowValues) -> T {
        let properties = T::properties();
        let mut entity = T::default();
        if let Some(id) = id {
            entity.set_id(id);
        }
        for (spec, value) in self.column_specs().zip(values) {
            if let Some(property) = properties.iter().find(|p| p.spec.property_name == spec.property_name) {
                (property.set)(&mut entity, value);
            }
        }
        entity
    }

    /// Accept `{ ...row... }` or `{ "<ClassName>": { ...row... } }`
    fn unwrap_import<'a>(&self, object: &'a JsonValue) -> Result<&'a Record> {
        let record = object
            .as_object()
            .ok_or_else(|| Error::binding(format!("Import element for {} is not an object", self.class_name)))?;

        // A single scalar under a class-named key is a bare row whose column
        // happens to share the class name
        if record.len() == 1 {
            if let Some((key, JsonValue::Object(inner))) = record.iter().next() {
                if self.is_class_key(key) {
                    return Ok(inner);
                }
            }
        }
        Ok(record)
    }

    fn is_class_key(&self, key: &str) -> bool {
        key == self.class_name || key == self.class_name_lowercase || key == snake_case(&self.class_name)
    }
}

/// `BlogPost` -> `blog_post`
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Turn a caller clause into the SQL tail after `FROM <table>`.
/// Clauses that start with their own keyword are used as is.
fn clause_tail(clause: &str) -> String {
    const KEYWORDS: [&str; 4] = ["WHERE ", "ORDER BY ", "LIMIT ", "GROUP BY "];

    let clause = clause.trim();
    if clause.is_empty() {
        return String::new();
    }
    let upper = clause.to_uppercase();
    if KEYWORDS.iter().any(|keyword| upper.starts_with(keyword)) {
        format!(" {}", clause)
    } else {
        format!(" WHERE {}", clause)
    }
}

/// Prepare caller-formatted SQL, rejecting it if it carries placeholders
fn prepare_without_placeholders<'c>(conn: &'c Connection, sql: &str) -> Result<rusqlite::Statement<'c>> {
    let stmt = conn.prepare(sql)?;
    if stmt.parameter_count() > 0 {
        return Err(Error::binding(format!("Unbound placeholders in clause: {}", sql)));
    }
    Ok(stmt)
}

/// Keep the first occurrence of every id
fn unique_ids(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// A registered table bound to its database
#[derive(Clone, Copy)]
pub struct TableRef<'db> {
    db: &'db Database,
    table: &'db Table,
}

impl<'db> TableRef<'db> {
    pub(crate) fn new(db: &'db Database, table: &'db Table) -> Self {
        Self { db, table }
    }

    pub fn table(&self) -> &'db Table {
        self.table
    }

    pub fn name(&self) -> &'db str {
        self.table.name()
    }

    pub fn class_name(&self) -> &'db str {
        self.table.class_name()
    }

    pub fn is_valid(&self) -> bool {
        self.table.is_valid()
    }

    pub fn table_exists(&self) -> Result<bool> {
        self.table.table_exists(self.db.connection())
    }

    /// Number of rows in the table
    pub fn count(&self) -> Result<usize> {
        self.table.count(self.db.connection(), None)
    }

    /// Number of rows matching `where_clause`; clauses with placeholders are rejected
    pub fn count_where(&self, where_clause: &str) -> Result<usize> {
        self.table.count(self.db.connection(), Some(where_clause))
    }

    /// Upsert one row in its own transaction
    pub fn update(&self, data: RowData<'_>) -> Result<i64> {
        self.table.ensure_valid()?;
        let tx = self.db.connection().unchecked_transaction()?;
        let id = self.update_no_transaction(data)?;
        tx.commit()?;
        Ok(id)
    }

    /// Upsert one row, then feed every link property its ids.
    /// The caller owns the transaction.
    pub fn update_no_transaction(&self, data: RowData<'_>) -> Result<i64> {
        self.table.ensure_valid()?;
        let links = self
            .table
            .link_specs()
            .map(|spec| Ok((self.require_link(&spec.property_name)?, spec.accessor_key.as_str())))
            .collect::<Result<Vec<_>>>()?;

        let id = self.table.upsert_row(self.db.connection(), data)?;
        for (link, key) in links {
            link.update_from_key(data, key, id)?;
        }
        Ok(id)
    }

    /// Import a batch of JSON rows atomically; each row may be wrapped
    /// under its class name. Returns the number of rows processed.
    pub fn update_all(&self, objects: &[JsonValue]) -> Result<usize> {
        self.table.ensure_valid()?;
        let tx = self.db.connection().unchecked_transaction()?;
        for (index, object) in objects.iter().enumerate() {
            let imported = self
                .table
                .unwrap_import(object)
                .and_then(|record| self.update_no_transaction(RowData::Map(record)));
            if let Err(e) = imported {
                warn!("Rolling back import into {} at row {}: {}", self.table.name, index, e);
                return Err(e);
            }
        }
        tx.commit()?;
        debug!("Imported {} rows into {}", objects.len(), self.table.name);
        Ok(objects.len())
    }

    /// Typed counterpart of [`update_all`](Self::update_all)
    pub fn update_many<T: Entity>(&self, objects: &[T]) -> Result<usize> {
        self.table.ensure_valid()?;
        let tx = self.db.connection().unchecked_transaction()?;
        for object in objects {
            self.update_no_transaction(RowData::object(object))?;
        }
        tx.commit()?;
        Ok(objects.len())
    }

    /// Rows matching an optional clause (`"name = 'A'"`, `"ORDER BY id"`, ...)
    pub fn select(&self, clause: &str) -> Result<Vec<Record>> {
        let rows = self.table.select(self.db.connection(), clause)?;
        Ok(rows.into_iter().map(|row| self.table.to_record(row)).collect())
    }

    pub fn select_as<T: Entity>(&self, clause: &str) -> Result<Vec<T>> {
        let rows = self.table.select(self.db.connection(), clause)?;
        Ok(rows.into_iter().map(|row| self.table.to_entity(row)).collect())
    }

    /// Page through rows; `count` of `None` means no limit
    pub fn select_range(
        &self,
        where_clause: Option<&str>,
        start: usize,
        count: Option<usize>,
        order_by: Option<&str>,
    ) -> Result<Vec<Record>> {
        let rows = self.table.select_range(self.db.connection(), where_clause, start, count, order_by)?;
        Ok(rows.into_iter().map(|row| self.table.to_record(row)).collect())
    }

    pub fn select_range_as<T: Entity>(
        &self,
        where_clause: Option<&str>,
        start: usize,
        count: Option<usize>,
        order_by: Option<&str>,
    ) -> Result<Vec<T>> {
        let rows = self.table.select_range(self.db.connection(), where_clause, start, count, order_by)?;
        Ok(rows.into_iter().map(|row| self.table.to_entity(row)).collect())
    }

    /// First row matching `where_clause`.
    ///
    /// The clause is used verbatim; callers formatting values into it must
    /// escape untrusted input themselves.
    pub fn select_first(&self, where_clause: &str) -> Result<Option<Record>> {
        self.select_first_order_by("", where_clause)
    }

    pub fn select_first_order_by(&self, order_by: &str, where_clause: &str) -> Result<Option<Record>> {
        let rows = self
            .table
            .select_range(self.db.connection(), Some(where_clause), 0, Some(1), Some(order_by))?;
        Ok(rows.into_iter().next().map(|row| self.table.to_record(row)))
    }

    pub fn select_first_as<T: Entity>(&self, where_clause: &str) -> Result<Option<T>> {
        let rows = self
            .table
            .select_range(self.db.connection(), Some(where_clause), 0, Some(1), None)?;
        Ok(rows.into_iter().next().map(|row| self.table.to_entity(row)))
    }

    pub fn select_by_id<T: Entity>(&self, id: i64) -> Result<Option<T>> {
        let row = self.table.select_by_id(self.db.connection(), id)?;
        Ok(row.map(|row| self.table.to_entity(row)))
    }

    /// Delete every row; link tables are not touched
    pub fn truncate(&self) -> Result<usize> {
        self.table.truncate(self.db.connection())
    }

    /// Link table behind a many-to-many property, if the property is one.
    ///
    /// A property naming its junction table resolves to that table; otherwise
    /// the link table is found by primary class and import key.
    pub fn link_table_for(&self, property_name: &str) -> Option<LinkTableRef<'db>> {
        let spec = self
            .table
            .link_specs()
            .find(|spec| spec.property_name == property_name)?;
        if let Some(name) = &spec.link_table {
            return self
                .db
                .link_table(name)
                .ok()
                .filter(|link| link.link().primary_class_name() == self.table.class_name());
        }
        self.db.link_tables().find(|link| {
            link.link().primary_class_name() == self.table.class_name()
                && link.link().import_property_name() == spec.accessor_key
        })
    }

    fn require_link(&self, property_name: &str) -> Result<LinkTableRef<'db>> {
        self.link_table_for(property_name).ok_or_else(|| {
            Error::UnresolvedLink(format!(
                "No link table registered for {}.{}",
                self.table.class_name, property_name
            ))
        })
    }

    /// Members of `pool` linked to `owner`, in link order.
    ///
    /// `pool` must hold every candidate; missing candidates are silently absent
    /// from the result.
    pub fn filter_array<'p, T: Entity, O: Entity>(
        &self,
        pool: &'p [T],
        owner: &O,
        property_name: &str,
    ) -> Result<Vec<&'p T>> {
        let link = self.require_link(property_name)?;
        let Some(owner_id) = owner.id() else {
            return Ok(Vec::new());
        };

        let ids = unique_ids(link.select_links_for(link.link().secondary_side(), owner_id)?);
        Ok(ids
            .iter()
            .filter_map(|id| pool.iter().find(|candidate| candidate.id() == Some(*id)))
            .collect())
    }

    /// Load the other side of a many-to-many property for `owner`.
    ///
    /// Objects found in `cache` are reused; objects loaded from the database
    /// are added to it.
    pub fn load_property<T: Entity, O: Entity>(
        &self,
        property_name: &str,
        owner: &O,
        mut cache: Option<&mut HashMap<i64, T>>,
    ) -> Result<Vec<T>> {
        let link = self.require_link(property_name)?;
        let secondary = link.secondary_table()?;
        if secondary.class_name() != T::CLASS_NAME {
            return Err(Error::binding(format!(
                "{}.{} links to {}, not {}",
                self.table.class_name,
                property_name,
                secondary.class_name(),
                T::CLASS_NAME
            )));
        }
        let Some(owner_id) = owner.id() else {
            return Ok(Vec::new());
        };

        let ids = unique_ids(link.select_links_for(link.link().secondary_side(), owner_id)?);
        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(hit) = cache.as_deref().and_then(|cache| cache.get(&id)) {
                loaded.push(hit.clone());
                continue;
            }
            match secondary.select_by_id::<T>(id)? {
                Some(object) => {
                    if let Some(cache) = cache.as_deref_mut() {
                        cache.insert(id, object.clone());
                    }
                    loaded.push(object);
                }
                None => debug!("Link {} -> {} points at a missing {} row", owner_id, id, T::CLASS_NAME),
            }
        }
        Ok(loaded)
    }

    /// Link rows for `primary` without loading the linked objects
    pub fn count_associations<O: Entity>(&self, primary: &O, property_name: &str) -> Result<usize> {
        let link = self.require_link(property_name)?;
        match primary.id() {
            Some(id) => link.count_links_for(link.link().secondary_side(), id),
            None => Ok(0),
        }
    }

    /// `result[i]` is the association count of `primaries[i]`
    pub fn count_associations_multiple<O: Entity>(&self, primaries: &[O], property_name: &str) -> Result<Vec<usize>> {
        let link = self.require_link(property_name)?;
        primaries
            .iter()
            .map(|primary| match primary.id() {
                Some(id) => link.count_links_for(link.link().secondary_side(), id),
                None => Ok(0),
            })
            .collect()
    }
}
