//! Schema generation from the metamodel.

use std::collections::HashSet;
use std::time::Instant;

use relmap_core::{Connection, IdType, Result, SequenceGenerator, Table, TableGenerator};
use relmap_dialect::SqlDialect;

use crate::config::DdlMode;
use crate::metamodel::Metamodel;

/// What a [`SchemaGenerator::create`] run issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    pub sequences: usize,
    pub generator_tables: usize,
    pub tables: usize,
    pub foreign_keys: usize,
}

/// Creates and drops the database objects a metamodel maps to.
///
/// Objects that already exist are left alone, so `create` can run against a partially
/// initialized database.
#[derive(Debug, Clone, Copy)]
pub struct SchemaGenerator<'a> {
    dialect: &'a dyn SqlDialect,
    metamodel: &'a Metamodel,
    default_schema: Option<&'a str>,
}

impl<'a> SchemaGenerator<'a> {
    pub fn new(dialect: &'a dyn SqlDialect, metamodel: &'a Metamodel) -> Self {
        Self {
            dialect,
            metamodel,
            default_schema: None,
        }
    }

    /// Schema applied to key generators that do not name one.
    pub fn with_default_schema(mut self, schema: Option<&'a str>) -> Self {
        self.default_schema = schema;
        self
    }

    /// Run the DDL `mode` asks for.
    pub fn apply(&self, conn: &dyn Connection, mode: DdlMode) -> Result<SchemaChanges> {
        match mode {
            DdlMode::None => Ok(SchemaChanges::default()),
            DdlMode::Create => self.create(conn),
            DdlMode::DropAndCreate => {
                self.drop_all(conn)?;
                self.create(conn)
            }
        }
    }

    /// Create missing key generators, then tables, then the foreign keys of the tables
    /// created.
    #[tracing::instrument(level = "debug", skip(self, conn), fields(dialect = self.dialect.name()))]
    pub fn create(&self, conn: &dyn Connection) -> Result<SchemaChanges> {
        let start = Instant::now();
        let mut changes = SchemaChanges::default();

        let (sequences, generators) = self.generators()?;
        for sequence in &sequences {
            if self.dialect.create_sequence_if_necessary(conn, sequence)? {
                changes.sequences += 1;
            }
        }
        for generator in &generators {
            if self.dialect.create_table_generator_if_necessary(conn, generator)? {
                changes.generator_tables += 1;
            }
        }

        let mut created: Vec<&Table> = Vec::new();
        for table in self.tables() {
            if self.dialect.table_exists(conn, table.schema(), table.name())? {
                tracing::debug!(table = table.name(), "Table already exists");
                continue;
            }
            let sql = self.dialect.create_table_ddl(table)?;
            tracing::debug!(sql = %sql, "Creating table");
            conn.execute(&sql, &[])?;
            created.push(table);
        }
        changes.tables = created.len();

        // Every table exists by now, so forward references resolve.
        for table in created {
            for fk in table.foreign_keys() {
                self.dialect.create_foreign_key(conn, fk)?;
                changes.foreign_keys += 1;
            }
        }

        tracing::info!(
            sequences = changes.sequences,
            generator_tables = changes.generator_tables,
            tables = changes.tables,
            foreign_keys = changes.foreign_keys,
            elapsed_ms = start.elapsed().as_millis(),
            "Schema created"
        );
        Ok(changes)
    }

    /// Drop mapped tables (subtypes first) and sequences.
    ///
    /// Generator tables are shared between mappings and survive.
    #[tracing::instrument(level = "debug", skip(self, conn), fields(dialect = self.dialect.name()))]
    pub fn drop_all(&self, conn: &dyn Connection) -> Result<()> {
        let names: Vec<String> = self.tables().map(Table::qualified_name).collect();
        let names: Vec<&str> = names.iter().rev().map(String::as_str).collect();
        self.dialect.drop_tables(conn, &names)?;

        let (sequences, _) = self.generators()?;
        let sequences: Vec<&SequenceGenerator> = sequences.iter().collect();
        self.dialect.drop_all_sequences(conn, &sequences)?;

        tracing::info!(tables = names.len(), sequences = sequences.len(), "Schema dropped");
        Ok(())
    }

    /// Declared tables of every entity, supertypes first.
    fn tables(&self) -> impl Iterator<Item = &'a Table> + 'a {
        let metamodel = self.metamodel;
        metamodel.entities().iter().flat_map(|entity| {
            std::iter::once(&**entity.primary_table())
                .chain(entity.secondary_tables().iter().map(|t| &**t))
        })
    }

    /// Generators the dialect will actually use, without duplicates.
    fn generators(&self) -> Result<(Vec<SequenceGenerator>, Vec<TableGenerator>)> {
        let mut sequences = Vec::new();
        let mut tables = Vec::new();
        let mut seen = HashSet::new();
        for entity in self.metamodel.entities() {
            match entity.id_type(self.dialect)? {
                IdType::Sequence => {
                    if let Some(sequence) = entity.sequence_generator(self.default_schema) {
                        let key = (sequence.schema.clone(), sequence.sequence_name.clone());
                        if seen.insert(key) {
                            sequences.push(sequence);
                        }
                    }
                }
                IdType::Table => {
                    if let Some(generator) = entity.table_generator(self.default_schema) {
                        let key = (generator.schema.clone(), generator.table.clone());
                        if seen.insert(key) {
                            tables.push(generator);
                        }
                    }
                }
                IdType::Manual | IdType::Identity => {}
            }
        }
        Ok((sequences, tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::testing::RecordingConnection;
    use relmap_core::{
        AssociationKind, AttributeMetadata, ColumnMetadata, EntityMetadata, GenerationType, Row,
        SqlType, TableMetadata, Value,
    };
    use relmap_dialect::{HsqlDialect, SqliteDialect};

    fn metamodel() -> Metamodel {
        Metamodel::build(
            vec![
                EntityMetadata::new("Customer")
                    .table(TableMetadata::new("customer"))
                    .attribute(AttributeMetadata::generated_id(
                        "id",
                        ColumnMetadata::new(SqlType::BigInt),
                        GenerationType::Auto,
                        None,
                    ))
                    .attribute(AttributeMetadata::basic(
                        "name",
                        ColumnMetadata::new(SqlType::Varchar).length(80),
                    )),
                EntityMetadata::new("Order")
                    .table(TableMetadata::new("purchase_order"))
                    .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
                    .attribute(AttributeMetadata::association(
                        "customer",
                        AssociationKind::ManyToOne,
                        "Customer",
                    )),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_generators_tables_then_foreign_keys() {
        let conn = RecordingConnection::new("HSQL Database Engine");
        let model = metamodel();
        let changes = SchemaGenerator::new(&HsqlDialect, &model).create(&conn).unwrap();

        assert_eq!(
            changes,
            SchemaChanges {
                sequences: 1,
                generator_tables: 0,
                tables: 2,
                foreign_keys: 1,
            }
        );
        let executed = conn.executed_sql();
        assert_eq!(executed.len(), 4);
        assert!(executed[0].starts_with("CREATE SEQUENCE customer_seq AS BIGINT"));
        assert!(executed[1].starts_with("CREATE TABLE customer ("));
        assert!(executed[2].starts_with("CREATE TABLE purchase_order ("));
        assert!(executed[2].contains("customer_id BIGINT"));
        assert_eq!(
            executed[3],
            "ALTER TABLE purchase_order\n\tADD FOREIGN KEY (customer_id)\n\tREFERENCES customer(id)"
        );
    }

    #[test]
    fn test_existing_objects_are_skipped() {
        let conn = RecordingConnection::new("HSQL Database Engine");
        conn.respond(
            "SYSTEM_SEQUENCES",
            vec![Row::from_pairs([("SEQUENCE_NAME", Value::from("CUSTOMER_SEQ"))])],
        );
        conn.respond(
            "SYSTEM_TABLES",
            vec![Row::from_pairs([("TABLE_NAME", Value::from("CUSTOMER"))])],
        );
        let model = metamodel();
        let changes = SchemaGenerator::new(&HsqlDialect, &model).create(&conn).unwrap();
        assert_eq!(changes, SchemaChanges::default());
        assert!(conn.executed_sql().is_empty());
    }

    #[test]
    fn test_drop_and_create() {
        let conn = RecordingConnection::new("HSQL Database Engine");
        let model = metamodel();
        SchemaGenerator::new(&HsqlDialect, &model)
            .apply(&conn, DdlMode::DropAndCreate)
            .unwrap();

        let executed = conn.executed_sql();
        assert_eq!(
            &executed[..3],
            &[
                "DROP TABLE purchase_order IF EXISTS CASCADE",
                "DROP TABLE customer IF EXISTS CASCADE",
                "DROP SEQUENCE customer_seq IF EXISTS CASCADE",
            ]
        );
        assert_eq!(executed.len(), 7);
    }

    #[test]
    fn test_none_mode_is_silent() {
        let conn = RecordingConnection::new("HSQL Database Engine");
        let model = metamodel();
        SchemaGenerator::new(&HsqlDialect, &model)
            .apply(&conn, DdlMode::None)
            .unwrap();
        assert!(conn.statements().is_empty());
    }

    #[test]
    fn test_sqlite_uses_identity_and_skips_foreign_keys() {
        let conn = RecordingConnection::new("SQLite");
        let model = metamodel();
        let changes = SchemaGenerator::new(&SqliteDialect, &model).create(&conn).unwrap();
        assert_eq!(changes.sequences, 0);
        assert_eq!(changes.tables, 2);
        assert!(conn.executed_sql().iter().all(|s| s.starts_with("CREATE TABLE")));
    }
}
