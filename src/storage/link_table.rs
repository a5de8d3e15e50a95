//! Link tables - junction tables behind many-to-many properties
//!
//! A junction table has its own row id plus one foreign-key column per side:
//! `<primary>_id` and `<secondary>_id`. Link rows are written through an
//! internal [`Table`], so each write appends a row: feeding the same ids twice
//! doubles the links unless the caller deletes them first with
//! [`LinkTableRef::delete_links_for`] or [`LinkTableRef::truncate`].
//!
//! The secondary side is only known by class name when the link table is
//! built. [`Database::resolve_links`] fills it in once every table is
//! registered.

use rusqlite::Connection;
use serde_json::Value as JsonValue;
use tracing::debug;
use crate::entity::{foreign_key_column, import_property_name, ArgumentSpec, Record, RowData};
use crate::{Error, Result};
use super::database::Database;
use super::statements::{quote_ident, StatementCache};
use super::table::{Table, TableRef};

/// Mapping of one junction table
#[derive(Debug, Clone)]
pub struct LinkTable {
    own_table: Table,
    primary_class_name: String,
    primary_side: String,
    primary_column: String,
    secondary_class_name: String,
    secondary_side: String,
    secondary_column: String,
    secondary_table: Option<String>,
    statements: Option<StatementCache>,
    import_property_name: String,
}

impl LinkTable {
    pub fn new(
        name: impl Into<String>,
        primary_class_name: impl Into<String>,
        secondary_class_name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let primary_class_name = primary_class_name.into();
        let secondary_class_name = secondary_class_name.into();

        let primary_column = foreign_key_column(&primary_class_name);
        let mut secondary_column = foreign_key_column(&secondary_class_name);
        if secondary_column == primary_column {
            secondary_column = format!("linked_{}", secondary_column);
        }

        let own_table = Table::new(
            name.clone(),
            name,
            vec![
                ArgumentSpec::integer(primary_column.clone()),
                ArgumentSpec::integer(secondary_column.clone()),
            ],
        );

        Self {
            own_table,
            primary_side: primary_class_name.to_lowercase(),
            primary_column,
            secondary_side: secondary_class_name.to_lowercase(),
            secondary_column,
            import_property_name: import_property_name(&secondary_class_name),
            primary_class_name,
            secondary_class_name,
            secondary_table: None,
            statements: None,
        }
    }

    pub fn name(&self) -> &str {
        self.own_table.name()
    }

    /// The junction table itself
    pub fn own_table(&self) -> &Table {
        &self.own_table
    }

    pub fn primary_class_name(&self) -> &str {
        &self.primary_class_name
    }

    pub fn secondary_class_name(&self) -> &str {
        &self.secondary_class_name
    }

    /// Lowercase primary class name, as accepted by `select_links_for`
    pub fn primary_side(&self) -> &str {
        &self.primary_side
    }

    pub fn secondary_side(&self) -> &str {
        &self.secondary_side
    }

    pub fn primary_column(&self) -> &str {
        &self.primary_column
    }

    pub fn secondary_column(&self) -> &str {
        &self.secondary_column
    }

    /// Input key holding the secondary ids (`book_ids`)
    pub fn import_property_name(&self) -> &str {
        &self.import_property_name
    }

    pub fn is_valid(&self) -> bool {
        self.own_table.is_valid() && self.statements.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.secondary_table.is_some()
    }

    /// Compile the junction table's statements and the delete-for-primary statement
    pub fn compile_statements(&mut self, conn: &Connection) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        self.own_table.compile_statements(conn)?;

        let statements = StatementCache::for_link(self.own_table.name(), &self.primary_column);
        statements.compile(conn)?;
        debug!("Compiled link table {}", self.own_table.name());
        self.statements = Some(statements);
        Ok(())
    }

    pub(crate) fn set_secondary_table(&mut self, class_name: Option<String>) {
        self.secondary_table = class_name;
    }

    fn ensure_valid(&self) -> Result<&StatementCache> {
        match &self.statements {
            Some(statements) if self.own_table.is_valid() => Ok(statements),
            _ => Err(Error::InvalidTable(format!(
                "Link table {} has no compiled statements",
                self.own_table.name()
            ))),
        }
    }

    /// `(selected column, filter column)` for the side named by `side`
    fn columns_for(&self, side: &str) -> Result<(&str, &str)> {
        let side = side.to_lowercase();
        if side == self.secondary_side {
            Ok((self.secondary_column.as_str(), self.primary_column.as_str()))
        } else if side == self.primary_side {
            Ok((self.primary_column.as_str(), self.secondary_column.as_str()))
        } else {
            Err(Error::binding(format!(
                "Link table {} joins {} and {}, not {}",
                self.own_table.name(),
                self.primary_side,
                self.secondary_side,
                side
            )))
        }
    }
}

/// A registered link table bound to its database
#[derive(Clone, Copy)]
pub struct LinkTableRef<'db> {
    db: &'db Database,
    link: &'db LinkTable,
}

impl<'db> LinkTableRef<'db> {
    pub(crate) fn new(db: &'db Database, link: &'db LinkTable) -> Self {
        Self { db, link }
    }

    pub fn link(&self) -> &'db LinkTable {
        self.link
    }

    pub fn name(&self) -> &'db str {
        self.link.name()
    }

    pub fn is_valid(&self) -> bool {
        self.link.is_valid()
    }

    pub fn primary_table(&self) -> Result<TableRef<'db>> {
        self.db.table(&self.link.primary_class_name).map_err(|_| {
            Error::UnresolvedLink(format!(
                "{} is not registered for link table {}",
                self.link.primary_class_name,
                self.link.name()
            ))
        })
    }

    /// The other side of the relationship, once resolved
    pub fn secondary_table(&self) -> Result<TableRef<'db>> {
        let class_name = self.link.secondary_table.as_deref().ok_or_else(|| {
            Error::UnresolvedLink(format!(
                "Secondary table {} of {} is not resolved",
                self.link.secondary_class_name,
                self.link.name()
            ))
        })?;
        self.db
            .table(class_name)
            .map_err(|_| Error::UnresolvedLink(format!("{} is not registered", class_name)))
    }

    /// Append one link row per id found under the import key of `data`.
    ///
    /// Existing links are kept; see the module docs. Returns the number of
    /// rows written, zero when `data` has no ids.
    pub fn update_no_transaction(&self, data: RowData<'_>, primary_id: i64) -> Result<usize> {
        self.update_from_key(data, &self.link.import_property_name, primary_id)
    }

    /// Same as `update_no_transaction`, reading the ids under `key`
    pub(crate) fn update_from_key(&self, data: RowData<'_>, key: &str, primary_id: i64) -> Result<usize> {
        self.link.ensure_valid()?;
        let Some(ids) = data.ids(key)? else {
            return Ok(0);
        };

        let conn = self.db.connection();
        for secondary_id in &ids {
            let mut row = Record::new();
            row.insert(self.link.primary_column.clone(), JsonValue::from(primary_id));
            row.insert(self.link.secondary_column.clone(), JsonValue::from(*secondary_id));
            self.link.own_table.upsert_row(conn, RowData::Map(&row))?;
        }
        debug!("Linked {} {} to {} {}", self.link.primary_side, primary_id, ids.len(), self.link.secondary_side);
        Ok(ids.len())
    }

    /// Remove every link row of one primary id
    pub fn delete_links_for(&self, primary_id: i64) -> Result<usize> {
        let sql = self.link.ensure_valid()?.delete_for_primary().ok_or_else(|| {
            Error::InvalidTable(format!("Link table {} has no delete statement", self.link.name()))
        })?;
        let deleted = self.db.connection().prepare_cached(sql)?.execute([primary_id])?;
        Ok(deleted)
    }

    pub fn truncate(&self) -> Result<usize> {
        self.link.ensure_valid()?;
        self.link.own_table.truncate(self.db.connection())
    }

    /// Ids on the `property_name` side linked to `id` on the other side,
    /// in link insertion order
    pub fn select_links_for(&self, property_name: &str, id: i64) -> Result<Vec<i64>> {
        self.link.ensure_valid()?;
        let (selected, filter) = self.link.columns_for(property_name)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid",
            quote_ident(selected),
            quote_ident(self.link.name()),
            quote_ident(filter)
        );

        let mut stmt = self.db.connection().prepare_cached(&sql)?;
        let ids = stmt
            .query_map([id], |row| row.get::<_, Option<i64>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().flatten().collect())
    }

    /// Number of link rows `select_links_for` would return
    pub fn count_links_for(&self, property_name: &str, id: i64) -> Result<usize> {
        self.link.ensure_valid()?;
        let (selected, filter) = self.link.columns_for(property_name)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1 AND {} IS NOT NULL",
            quote_ident(self.link.name()),
            quote_ident(filter),
            quote_ident(selected)
        );
        let count: i64 = self.db.connection().prepare_cached(&sql)?.query_row([id], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use serde_json::json;
    use crate::entity::{Entity, Property};
    use crate::value::Value;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Author {
        id: Option<i64>,
        name: String,
        book_ids: Vec<i64>,
    }

    impl Entity for Author {
        const CLASS_NAME: &'static str = "Author";

        fn properties() -> Vec<Property<Self>> {
            vec![
                Property::new(
                    ArgumentSpec::text("name"),
                    |a| Value::from(&a.name),
                    |a, v| a.name = v.into_text().unwrap_or_default(),
                ),
                Property::link("books", "Book", |a| Value::from(a.book_ids.clone())),
            ]
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Book {
        id: Option<i64>,
        title: String,
    }

    impl Entity for Book {
        const CLASS_NAME: &'static str = "Book";

        fn properties() -> Vec<Property<Self>> {
            vec![Property::new(
                ArgumentSpec::text("title"),
                |b| Value::from(&b.title),
                |b, v| b.title = v.into_text().unwrap_or_default(),
            )]
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    fn book(id: i64, title: &str) -> Book {
        Book { id: Some(id), title: title.to_string() }
    }

    fn library() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let link = LinkTable::new("author_books", "Author", "Book");
        db.ensure_table(&Table::for_entity::<Author>("authors")).unwrap();
        db.ensure_table(&Table::for_entity::<Book>("books")).unwrap();
        db.ensure_link_table(&link).unwrap();

        db.register_entity::<Author>("authors").unwrap();
        db.register_entity::<Book>("books").unwrap();
        db.register_link("author_books", "Author", "Book").unwrap();
        db.resolve_links().unwrap();

        let books = db.table("Book").unwrap();
        books.update_many(&[book(10, "X"), book(11, "Y"), book(12, "Z")]).unwrap();
        db
    }

    #[test]
    fn test_author_books_scenario() {
        let db = library();
        let authors = db.table("Author").unwrap();

        let author = json!({ "id": 1, "name": "A", "book_ids": [10, 11] });
        assert_eq!(authors.update(RowData::map(author.as_object().unwrap())).unwrap(), 1);

        let link = db.link_table("author_books").unwrap();
        assert_eq!(link.count_links_for("book", 1).unwrap(), 2);
        assert_eq!(link.select_links_for("book", 1).unwrap(), vec![10, 11]);
        assert_eq!(link.select_links_for("author", 11).unwrap(), vec![1]);
    }

    #[test]
    fn test_link_updates_are_additive() {
        let db = library();
        let authors = db.table("Author").unwrap();
        let link = db.link_table("author_books").unwrap();

        let author = Author { id: Some(1), name: "A".into(), book_ids: vec![10, 11] };
        authors.update(RowData::object(&author)).unwrap();
        authors.update(RowData::object(&author)).unwrap();

        // Same ids fed twice: the junction rows double rather than being replaced.
        assert_eq!(link.count_links_for("book", 1).unwrap(), 4);
        assert_eq!(link.select_links_for("book", 1).unwrap(), vec![10, 11, 10, 11]);
        assert_eq!(authors.count().unwrap(), 1);

        assert_eq!(link.delete_links_for(1).unwrap(), 4);
        authors.update(RowData::object(&author)).unwrap();
        assert_eq!(link.count_links_for("book", 1).unwrap(), 2);
    }

    #[test]
    fn test_count_matches_select() {
        let db = library();
        let authors = db.table("Author").unwrap();
        let link = db.link_table("author_books").unwrap();

        let rows = vec![
            json!({ "author": { "id": 1, "name": "A", "book_ids": [12, 10] } }),
            json!({ "author": { "id": 2, "name": "B", "book_ids": [] } }),
            json!({ "author": { "id": 3, "name": "C" } }),
        ];
        authors.update_all(&rows).unwrap();

        for id in 1..=3 {
            assert_eq!(
                link.count_links_for("book", id).unwrap(),
                link.select_links_for("book", id).unwrap().len()
            );
        }
        assert_eq!(link.select_links_for("book", 1).unwrap(), vec![12, 10]);
        assert_eq!(link.count_links_for("book", 3).unwrap(), 0);
    }

    #[test]
    fn test_failed_link_binding_rolls_back_the_row() {
        let db = library();
        let authors = db.table("Author").unwrap();

        let author = json!({ "id": 1, "name": "A", "book_ids": "ten" });
        let err = authors.update(RowData::map(author.as_object().unwrap())).unwrap_err();
        assert!(matches!(err, Error::Binding(_)));
        assert_eq!(authors.count().unwrap(), 0);
    }

    #[test]
    fn test_filter_array_keeps_link_order() {
        let db = library();
        let authors = db.table("Author").unwrap();

        let author = Author { id: Some(1), name: "A".into(), book_ids: vec![12, 10] };
        authors.update(RowData::object(&author)).unwrap();

        let pool = vec![book(10, "X"), book(11, "Y"), book(12, "Z")];
        let linked = authors.filter_array(&pool, &author, "books").unwrap();
        let titles: Vec<_> = linked.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, ["Z", "X"]);

        let unsaved = Author::default();
        assert!(authors.filter_array(&pool, &unsaved, "books").unwrap().is_empty());
        assert!(matches!(authors.filter_array(&pool, &author, "name"), Err(Error::UnresolvedLink(_))));
    }

    #[test]
    fn test_load_property_uses_and_fills_cache() {
        let db = library();
        let authors = db.table("Author").unwrap();

        let author = Author { id: Some(1), name: "A".into(), book_ids: vec![11, 10] };
        authors.update(RowData::object(&author)).unwrap();

        let mut cache = HashMap::new();
        cache.insert(11, book(11, "cached copy"));

        let loaded: Vec<Book> = authors.load_property("books", &author, Some(&mut cache)).unwrap();
        assert_eq!(loaded, vec![book(11, "cached copy"), book(10, "X")]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache[&10], book(10, "X"));

        let uncached: Vec<Book> = authors.load_property("books", &author, None).unwrap();
        assert_eq!(uncached, vec![book(11, "Y"), book(10, "X")]);
    }

    #[test]
    fn test_count_associations() {
        let db = library();
        let authors = db.table("Author").unwrap();

        let a = Author { id: Some(1), name: "A".into(), book_ids: vec![10, 11, 12] };
        let b = Author { id: Some(2), name: "B".into(), book_ids: vec![11] };
        let c = Author { id: Some(3), name: "C".into(), book_ids: vec![] };
        authors.update_many(&[a.clone(), b.clone(), c.clone()]).unwrap();

        assert_eq!(authors.count_associations(&a, "books").unwrap(), 3);
        assert_eq!(
            authors.count_associations_multiple(&[c, a, b, Author::default()], "books").unwrap(),
            vec![0, 3, 1, 0]
        );
    }

    #[test]
    fn test_link_table_for() {
        let db = library();
        let authors = db.table("Author").unwrap();
        let link = authors.link_table_for("books").unwrap();
        assert_eq!(link.name(), "author_books");
        assert_eq!(link.link().import_property_name(), "book_ids");
        assert_eq!(link.primary_table().unwrap().name(), "authors");
        assert_eq!(link.secondary_table().unwrap().name(), "books");
        assert!(authors.link_table_for("name").is_none());
        assert!(db.table("Book").unwrap().link_table_for("books").is_none());
    }

    #[test]
    fn test_unresolved_secondary_table() {
        let mut db = Database::open_in_memory().unwrap();
        db.ensure_table(&Table::for_entity::<Author>("authors")).unwrap();
        db.ensure_link_table(&LinkTable::new("author_books", "Author", "Book")).unwrap();
        db.register_entity::<Author>("authors").unwrap();
        db.register_link("author_books", "Author", "Book").unwrap();

        let link = db.link_table("author_books").unwrap();
        assert!(link.is_valid());
        assert!(matches!(link.secondary_table(), Err(Error::UnresolvedLink(_))));
        assert!(matches!(db.resolve_links(), Err(Error::UnresolvedLink(_))));

        let authors = db.table("Author").unwrap();
        let author = Author { id: Some(1), name: "A".into(), book_ids: vec![10] };
        authors.update(RowData::object(&author)).unwrap();
        let err = authors.load_property::<Book, _>("books", &author, None).unwrap_err();
        assert!(matches!(err, Error::UnresolvedLink(_)));
    }

    #[test]
    fn test_uncompiled_link_table_is_invalid() {
        let mut db = Database::open_in_memory().unwrap();
        db.add_link_table(LinkTable::new("missing_links", "Author", "Book"));
        let link = db.link_table("missing_links").unwrap();
        assert!(!link.is_valid());
        assert!(matches!(link.select_links_for("book", 1), Err(Error::InvalidTable(_))));
        assert!(matches!(link.truncate(), Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_side_names_and_truncate() {
        let db = library();
        let link = db.link_table("author_books").unwrap();
        assert!(matches!(link.select_links_for("publisher", 1), Err(Error::Binding(_))));

        let authors = db.table("Author").unwrap();
        authors.update(RowData::object(&Author { id: Some(1), name: "A".into(), book_ids: vec![10] })).unwrap();
        assert_eq!(link.truncate().unwrap(), 1);
        assert_eq!(link.count_links_for("Book", 1).unwrap(), 0);
        assert_eq!(authors.count().unwrap(), 1);
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Person {
        id: Option<i64>,
        name: String,
        friend_ids: Vec<i64>,
        rival_ids: Vec<i64>,
    }

    impl Entity for Person {
        const CLASS_NAME: &'static str = "Person";

        fn properties() -> Vec<Property<Self>> {
            vec![
                Property::new(
                    ArgumentSpec::text("name"),
                    |p| Value::from(&p.name),
                    |p, v| p.name = v.into_text().unwrap_or_default(),
                ),
                Property::link("friends", "Person", |p: &Person| Value::from(p.friend_ids.clone()))
                    .through("friends", "friend_ids"),
                Property::link("rivals", "Person", |p: &Person| Value::from(p.rival_ids.clone()))
                    .through("rivals", "rival_ids"),
            ]
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    #[test]
    fn test_two_links_between_the_same_classes() {
        let mut db = Database::open_in_memory().unwrap();
        db.ensure_table(&Table::for_entity::<Person>("people")).unwrap();
        // "friends" sorts before "rivals", so a lookup by class pair alone
        // would send both properties to the friends table
        for name in ["friends", "rivals"] {
            db.ensure_link_table(&LinkTable::new(name, "Person", "Person")).unwrap();
            db.register_link(name, "Person", "Person").unwrap();
        }
        db.register_entity::<Person>("people").unwrap();
        db.resolve_links().unwrap();

        let people = db.table("Person").unwrap();
        let person = |id: i64, name: &str| Person { id: Some(id), name: name.into(), ..Person::default() };
        people.update_many(&[person(2, "Bo"), person(3, "Cy")]).unwrap();
        let ann = Person { friend_ids: vec![2], rival_ids: vec![3], ..person(1, "Ann") };
        people.update(RowData::object(&ann)).unwrap();

        assert_eq!(people.link_table_for("friends").unwrap().name(), "friends");
        assert_eq!(people.link_table_for("rivals").unwrap().name(), "rivals");

        let friends: Vec<Person> = people.load_property("friends", &ann, None).unwrap();
        let rivals: Vec<Person> = people.load_property("rivals", &ann, None).unwrap();
        assert_eq!(friends.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), ["Bo"]);
        assert_eq!(rivals.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), ["Cy"]);
        assert_eq!(people.count_associations(&ann, "rivals").unwrap(), 1);

        let row = json!({ "id": 4, "name": "Di", "rival_ids": [1, 2] });
        people.update(RowData::map(row.as_object().unwrap())).unwrap();
        let rivals = db.link_table("rivals").unwrap();
        assert_eq!(rivals.select_links_for("person", 4).unwrap(), vec![1, 2]);
        assert_eq!(db.link_table("friends").unwrap().count_links_for("person", 4).unwrap(), 0);
    }

    #[test]
    fn test_self_link_columns() {
        let link = LinkTable::new("friends", "Person", "Person");
        assert_eq!(link.primary_column(), "person_id");
        assert_eq!(link.secondary_column(), "linked_person_id");
        assert_eq!(link.import_property_name(), "person_ids");
    }
}
