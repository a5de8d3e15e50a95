//! Storage Layer - SQLite-backed object mapping
//!
//! One [`Database`] owns the connection plus a registry of:
//! - entity tables (`id INTEGER PRIMARY KEY` plus one column per property)
//! - link tables (`id`, `<primary>_id`, `<secondary>_id`)
//!
//! Registration happens in two passes: compile every table and link table,
//! then [`Database::resolve_links`] connects each link table to its
//! secondary table.

pub mod schema;
pub mod statements;
pub mod table;
pub mod link_table;
pub mod database;

pub use database::Database;
pub use link_table::{LinkTable, LinkTableRef};
pub use statements::StatementCache;
pub use table::{Table, TableRef};
