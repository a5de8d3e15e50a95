//! Database schema definitions
//!
//! `CREATE TABLE` statements derived from argument specs. Only used to
//! bootstrap tables that do not exist yet; existing tables are never altered.

use crate::entity::ID_KEY;
use super::link_table::LinkTable;
use super::statements::quote_ident;
use super::table::Table;

/// SQL to create an entity table: `id` plus one column per column spec
pub fn create_table_sql(table: &Table) -> String {
    let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(ID_KEY))];
    for spec in table.column_specs() {
        if let Some(sql_type) = spec.column_type.sql_type() {
            columns.push(format!("{} {}", quote_ident(&spec.property_name), sql_type));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(table.name()),
        columns.join(",\n    ")
    )
}

/// SQL to create a junction table
pub fn create_link_table_sql(link: &LinkTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {} INTEGER PRIMARY KEY,\n    {} INTEGER NOT NULL,\n    {} INTEGER NOT NULL\n)",
        quote_ident(link.name()),
        quote_ident(ID_KEY),
        quote_ident(link.primary_column()),
        quote_ident(link.secondary_column())
    )
}

/// Indexes on both foreign-key columns of a junction table
pub fn create_link_indexes_sql(link: &LinkTable) -> Vec<String> {
    [link.primary_column(), link.secondary_column()]
        .into_iter()
        .map(|column| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                quote_ident(&format!("idx_{}_{}", link.name(), column)),
                quote_ident(link.name()),
                quote_ident(column)
            )
        })
        .collect()
}

/// All statements needed for a junction table
pub fn link_table_statements(link: &LinkTable) -> Vec<String> {
    let mut stmts = vec![create_link_table_sql(link)];
    stmts.extend(create_link_indexes_sql(link));
    stmts
}
