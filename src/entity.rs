//! Entity mapping - static property tables instead of runtime reflection
//!
//! An [`Entity`] declares, once, the ordered list of its persistent
//! properties: name, column type, getter and setter. Tables derive their
//! [`ArgumentSpec`] list from it, and updates read values through the
//! [`FieldReader`] capability so that typed entities and JSON maps share one
//! binding path.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use crate::value::Value;
use crate::{Error, Result};

/// Name of the identifier column and input key
pub const ID_KEY: &str = "id";

/// Key/value row: JSON input payloads and untyped select output
pub type Record = serde_json::Map<String, JsonValue>;

/// Column coercion rule of one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    /// UTF-8 text
    Text,
    /// Stored as text in the table's date format
    Date,
    /// No column; backed by a link table
    ManyToManyLink,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::ManyToManyLink => "many_to_many_link",
        }
    }

    /// Declared SQL type used when creating a column
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            ColumnType::Integer => Some("INTEGER"),
            ColumnType::Real => Some("REAL"),
            ColumnType::Text => Some("TEXT"),
            ColumnType::Date => Some("DATETIME"),
            ColumnType::ManyToManyLink => None,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, ColumnType::ManyToManyLink)
    }

    /// Map a declared SQLite column type, following SQLite's affinity rules
    /// with date/time names singled out.
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.to_uppercase();
        if declared.contains("DATE") || declared.contains("TIME") {
            ColumnType::Date
        } else if declared.contains("INT") || declared.contains("BOOL") {
            ColumnType::Integer
        } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Binds one property to one column (or, for links, to one link table)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSpec {
    /// Column name; for links, the property name on the owning class
    pub property_name: String,
    pub column_type: ColumnType,
    /// Key read off the input object or map
    pub accessor_key: String,
    /// Junction table of a link property, when more than one link table
    /// joins the same pair of classes
    pub link_table: Option<String>,
}

impl ArgumentSpec {
    pub fn new(property_name: impl Into<String>, column_type: ColumnType) -> Self {
        let property_name = property_name.into();
        Self {
            accessor_key: property_name.clone(),
            property_name,
            column_type,
            link_table: None,
        }
    }

    pub fn integer(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Integer)
    }

    pub fn real(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Real)
    }

    pub fn text(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Text)
    }

    pub fn date(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Date)
    }

    /// A many-to-many property; its ids are read from `<secondary>_ids`
    pub fn link(property_name: impl Into<String>, secondary_class_name: &str) -> Self {
        Self {
            property_name: property_name.into(),
            column_type: ColumnType::ManyToManyLink,
            accessor_key: import_property_name(secondary_class_name),
            link_table: None,
        }
    }

    /// Bind a link property to a named junction table
    pub fn with_link_table(mut self, link_table: impl Into<String>) -> Self {
        self.link_table = Some(link_table.into());
        self
    }

    pub fn with_accessor_key(mut self, accessor_key: impl Into<String>) -> Self {
        self.accessor_key = accessor_key.into();
        self
    }

    pub fn is_link(&self) -> bool {
        self.column_type.is_link()
    }
}

/// `Book` -> `book_ids`
pub fn import_property_name(class_name: &str) -> String {
    format!("{}_ids", class_name.to_lowercase())
}

/// `Book` -> `book_id`
pub fn foreign_key_column(class_name: &str) -> String {
    format!("{}_id", class_name.to_lowercase())
}

/// One entry of an entity's static property table
pub struct Property<T> {
    pub spec: ArgumentSpec,
    pub get: fn(&T) -> Value,
    pub set: fn(&mut T, Value),
}

impl<T> Property<T> {
    pub fn new(spec: ArgumentSpec, get: fn(&T) -> Value, set: fn(&mut T, Value)) -> Self {
        Self { spec, get, set }
    }

    /// Link properties are written through the link table, never by select
    pub fn link(property_name: &str, secondary_class_name: &str, get: fn(&T) -> Value) -> Self {
        Self {
            spec: ArgumentSpec::link(property_name, secondary_class_name),
            get,
            set: |_, _| {},
        }
    }

    /// Route a link property through `link_table`, reading its ids under `accessor_key`
    pub fn through(mut self, link_table: &str, accessor_key: &str) -> Self {
        self.spec = self.spec.with_link_table(link_table).with_accessor_key(accessor_key);
        self
    }
}

/// A type persisted in one table
pub trait Entity: Default + Clone {
    /// Class name the table is bound to (case preserved)
    const CLASS_NAME: &'static str;

    /// Persistent properties in column order, identifier excluded
    fn properties() -> Vec<Property<Self>>;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    fn argument_specs() -> Vec<ArgumentSpec> {
        Self::properties().into_iter().map(|p| p.spec).collect()
    }
}

/// Read access to the values an update binds
pub trait FieldReader {
    fn identifier(&self) -> Option<i64>;

    /// Value under an accessor key, `None` when the key is unknown
    fn field(&self, key: &str) -> Option<Value>;
}

impl<T: Entity> FieldReader for T {
    fn identifier(&self) -> Option<i64> {
        self.id()
    }

    fn field(&self, key: &str) -> Option<Value> {
        T::properties()
            .iter()
            .find(|p| p.spec.accessor_key == key)
            .map(|p| (p.get)(self))
    }
}

/// Input to an update: a typed object or a key/value map
#[derive(Clone, Copy)]
pub enum RowData<'a> {
    Object(&'a dyn FieldReader),
    Map(&'a Record),
}

impl<'a> RowData<'a> {
    pub fn object<T: Entity>(object: &'a T) -> Self {
        RowData::Object(object)
    }

    pub fn map(record: &'a Record) -> Self {
        RowData::Map(record)
    }

    /// The row identifier; absent or null means "assign one"
    pub fn identifier(&self) -> Result<Option<i64>> {
        match self {
            RowData::Object(object) => Ok(object.identifier()),
            RowData::Map(record) => match record.get(ID_KEY) {
                None | Some(JsonValue::Null) => Ok(None),
                Some(json) => Value::from_json(ID_KEY, json)?
                    .as_integer()
                    .map(Some)
                    .ok_or_else(|| Error::binding(format!("Invalid identifier: {}", json))),
            },
        }
    }

    pub fn field(&self, key: &str) -> Result<Option<Value>> {
        match self {
            RowData::Object(object) => Ok(object.field(key)),
            RowData::Map(record) => record.get(key).map(|json| Value::from_json(key, json)).transpose(),
        }
    }

    /// Identifier list under `key`, used by link tables
    pub fn ids(&self, key: &str) -> Result<Option<Vec<i64>>> {
        match self.field(key)? {
            None => Ok(None),
            Some(value) => value
                .into_ids()
                .map(Some)
                .ok_or_else(|| Error::binding(format!("Expected a list of ids under {:?}", key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Default)]
    struct Tag {
        id: Option<i64>,
        label: String,
        post_ids: Vec<i64>,
    }

    impl Entity for Tag {
        const CLASS_NAME: &'static str = "Tag";

        fn properties() -> Vec<Property<Self>> {
            vec![
                Property::new(
                    ArgumentSpec::text("label"),
                    |t| Value::from(&t.label),
                    |t, v| t.label = v.into_text().unwrap_or_default(),
                ),
                Property::link("posts", "Post", |t| Value::from(t.post_ids.clone())),
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
    fn test_link_spec_uses_import_key() {
        let spec = ArgumentSpec::link("posts", "Post");
        assert_eq!(spec.accessor_key, "post_ids");
        assert!(spec.is_link());
        assert_eq!(foreign_key_column("BlogPost"), "blogpost_id");
    }

    #[test]
    fn test_object_and_map_read_alike() {
        let tag = Tag { id: Some(3), label: "rust".into(), post_ids: vec![1, 2] };
        let record = json!({ "id": 3, "label": "rust", "post_ids": [1, 2] });
        let record = record.as_object().unwrap();

        for row in [RowData::object(&tag), RowData::map(record)] {
            assert_eq!(row.identifier().unwrap(), Some(3));
            assert_eq!(row.field("label").unwrap(), Some(Value::from("rust")));
            assert_eq!(row.ids("post_ids").unwrap(), Some(vec![1, 2]));
            assert_eq!(row.field("missing").unwrap(), None);
        }
    }

    #[test]
    fn test_map_identifier_forms() {
        let null_id = json!({ "id": null });
        assert_eq!(RowData::map(null_id.as_object().unwrap()).identifier().unwrap(), None);

        let text_id = json!({ "id": "12" });
        assert_eq!(RowData::map(text_id.as_object().unwrap()).identifier().unwrap(), Some(12));

        let bad_id = json!({ "id": "twelve" });
        assert!(RowData::map(bad_id.as_object().unwrap()).identifier().is_err());
    }

    #[test]
    fn test_declared_types() {
        assert_eq!(ColumnType::from_declared("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("varchar(255)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("DOUBLE"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("datetime"), ColumnType::Date);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Text);
    }
}
