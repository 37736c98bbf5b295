//! Physical tables and columns.
//!
//! This is the leaf of the model: a [`Table`] owns its [`Column`]s and knows nothing
//! about entities beyond which attribute feeds each column. The metamodel creates
//! tables, binds columns into them, and afterwards treats them as immutable.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::generator::GenerationType;
use crate::identifiers::qualified_name;
use crate::metadata::Locator;
use crate::types::SqlType;

/// Where a column's value comes from when a row is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// The named attribute of the entity.
    Attribute(String),
    /// A key column joining this table to the entity's primary (or supertype) table.
    /// Valued from the id attribute that backs `referenced_column`.
    PrimaryKeyJoin {
        attribute: String,
        referenced_column: String,
    },
}

impl ColumnSource {
    /// The attribute supplying the value.
    pub fn attribute(&self) -> &str {
        match self {
            ColumnSource::Attribute(name) | ColumnSource::PrimaryKeyJoin { attribute: name, .. } => {
                name
            }
        }
    }
}

/// A physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Name of the owning table, set when the column is bound.
    pub table: String,
    pub sql_type: SqlType,
    pub length: u32,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
    /// Requested key generation, only on primary key columns.
    pub generation: Option<GenerationType>,
    /// Generator name for sequence/table generation.
    pub generator: Option<String>,
    pub source: ColumnSource,
    pub locator: Option<Locator>,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType, source: ColumnSource) -> Self {
        Self {
            name: name.into(),
            table: String::new(),
            sql_type,
            length: 255,
            precision: 0,
            scale: 0,
            nullable: true,
            unique: false,
            primary_key: false,
            generation: None,
            generator: None,
            source,
            locator: None,
        }
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Mark as primary key; key columns are never nullable.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn generated(mut self, generation: GenerationType, generator: Option<String>) -> Self {
        self.generation = Some(generation);
        self.generator = generator;
        self
    }

    pub fn locator(mut self, locator: Option<Locator>) -> Self {
        self.locator = locator;
        self
    }

    /// The attribute that supplies this column's value.
    pub fn attribute(&self) -> &str {
        self.source.attribute()
    }

    /// Whether this column joins a secondary/subtype table to its parent row.
    pub fn is_join_column(&self) -> bool {
        matches!(self.source, ColumnSource::PrimaryKeyJoin { .. })
    }
}

/// Role of a table for its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Primary,
    Secondary,
}

/// Foreign key between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Qualified name of the referencing table.
    pub table: String,
    pub columns: Vec<String>,
    /// Qualified name of the referenced table.
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// A named physical relation that exclusively owns its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    schema: Option<String>,
    kind: TableKind,
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
    foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(name: impl Into<String>, schema: Option<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            schema,
            kind,
            columns: Vec::new(),
            by_name: HashMap::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn is_primary(&self) -> bool {
        self.kind == TableKind::Primary
    }

    /// `schema.name` or `name`.
    pub fn qualified_name(&self) -> String {
        qualified_name(self.schema.as_deref(), &self.name)
    }

    /// Take ownership of `column`. Column names are unique per table
    /// (case-insensitively, as most databases fold unquoted names).
    pub fn bind(&mut self, mut column: Column) -> Result<()> {
        let key = column.name.to_ascii_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(Error::mapping(
                format!(
                    "Column {} is mapped more than once in table {}",
                    column.name, self.name
                ),
                column.locator.clone(),
            ));
        }
        column.table.clone_from(&self.name);
        self.by_name.insert(key, self.columns.len());
        self.columns.push(column);
        Ok(())
    }

    pub fn add_foreign_key(&mut self, foreign_key: ForeignKey) {
        self.foreign_keys.push(foreign_key);
    }

    /// Columns in binding order, which is also DDL order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .and_then(|idx| self.columns.get(*idx))
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Columns written by UPDATE: everything except the key.
    pub fn value_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.primary_key)
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str) -> ColumnSource {
        ColumnSource::Attribute(name.to_string())
    }

    #[test]
    fn test_bind_sets_owner_and_preserves_order() {
        let mut table = Table::new("person", Some("PUBLIC".to_string()), TableKind::Primary);
        table
            .bind(Column::new("id", SqlType::BigInt, attr("id")).primary_key())
            .unwrap();
        table
            .bind(Column::new("name", SqlType::Varchar, attr("name")))
            .unwrap();

        let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert_eq!(table.column("NAME").unwrap().table, "person");
        assert_eq!(table.qualified_name(), "PUBLIC.person");
        assert_eq!(table.primary_key_columns().count(), 1);
        assert_eq!(table.value_columns().count(), 1);
    }

    #[test]
    fn test_duplicate_column_is_mapping_error() {
        let mut table = Table::new("person", None, TableKind::Primary);
        table
            .bind(Column::new("name", SqlType::Varchar, attr("name")))
            .unwrap();
        let err = table
            .bind(Column::new("NAME", SqlType::Varchar, attr("alias")))
            .unwrap_err();
        assert!(err.is_mapping());
    }

    #[test]
    fn test_join_column_source() {
        let column = Column::new(
            "person_id",
            SqlType::BigInt,
            ColumnSource::PrimaryKeyJoin {
                attribute: "id".to_string(),
                referenced_column: "id".to_string(),
            },
        )
        .primary_key();
        assert!(column.is_join_column());
        assert_eq!(column.attribute(), "id");
        assert!(!column.nullable);
    }
}
