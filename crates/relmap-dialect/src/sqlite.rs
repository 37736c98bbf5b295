//! SQLite dialect.
//!
//! SQLite has no sequences, no row locks and no `ALTER TABLE ... ADD FOREIGN KEY`.
//! Foreign keys are therefore emitted inline in `CREATE TABLE`, and an identity key is
//! declared as `INTEGER PRIMARY KEY AUTOINCREMENT` on the column itself.

use relmap_core::{
    Column, Connection, Error, ForeignKey, GenerationType, IdType, LockMode, Result,
    SequenceGenerator, SqlType, Table, TrimSpec, Value,
};

use crate::{SqlDialect, UNBOUNDED, exists};

const NAME: &str = "sqlite";

/// Dialect for SQLite 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn no_sequences() -> Error {
        Error::unsupported(NAME, "SQLite has no sequences")
    }
}

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        NAME
    }

    fn product_names(&self) -> &'static [&'static str] {
        &["SQLite", "sqlite"]
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn apply_pagination(&self, sql: &str, first_result: u64, max_results: u64) -> String {
        match (first_result, max_results) {
            (0, UNBOUNDED) => sql.to_string(),
            (0, max) => format!("{sql}\nLIMIT {max}"),
            (first, UNBOUNDED) => format!("{sql}\nLIMIT -1 OFFSET {first}"),
            (first, max) => format!("{sql}\nLIMIT {max} OFFSET {first}"),
        }
    }

    fn apply_lock(&self, sql: &str, mode: LockMode) -> String {
        if mode.is_pessimistic() {
            tracing::warn!(dialect = NAME, mode = ?mode, "Row locks are not supported; ignoring lock mode");
        }
        sql.to_string()
    }

    fn apply_trim(&self, spec: Option<TrimSpec>, trim_char: Option<&str>, arg: &str) -> String {
        let func = match spec {
            Some(TrimSpec::Leading) => "LTRIM",
            Some(TrimSpec::Trailing) => "RTRIM",
            Some(TrimSpec::Both) | None => "TRIM",
        };
        match trim_char {
            Some(c) => format!("{func}({arg}, {c})"),
            None => format!("{func}({arg})"),
        }
    }

    fn column_type(&self, column: &Column) -> Result<String> {
        let ty = match column.sql_type {
            SqlType::Bit
            | SqlType::Boolean
            | SqlType::TinyInt
            | SqlType::SmallInt
            | SqlType::Integer
            | SqlType::BigInt => "INTEGER",
            SqlType::Float | SqlType::Real | SqlType::Double => "REAL",
            SqlType::Decimal | SqlType::Numeric => "NUMERIC",
            SqlType::Char
            | SqlType::Varchar
            | SqlType::LongVarchar
            | SqlType::Clob
            | SqlType::Uuid
            | SqlType::Json => "TEXT",
            SqlType::Date | SqlType::Time | SqlType::Timestamp => "INTEGER",
            SqlType::Binary | SqlType::Varbinary | SqlType::Blob => "BLOB",
            SqlType::Other(code) => {
                return Err(Error::unsupported(
                    NAME,
                    format!(
                        "No column type for SQL type code {code} (column {}.{})",
                        column.table, column.name
                    ),
                ));
            }
        };
        Ok(ty.to_string())
    }

    fn supports(&self, generation: Option<GenerationType>) -> Result<IdType> {
        match generation {
            None | Some(GenerationType::Auto | GenerationType::Identity) => Ok(IdType::Identity),
            Some(GenerationType::Table) => Ok(IdType::Table),
            Some(GenerationType::Sequence) => Err(Self::no_sequences()),
        }
    }

    fn identity_clause(&self) -> &'static str {
        "PRIMARY KEY AUTOINCREMENT"
    }

    fn create_column_ddl(&self, column: &Column) -> Result<String> {
        if self.is_identity(column)? {
            // AUTOINCREMENT is only legal on exactly this spelling.
            return Ok(format!("{} INTEGER {}", column.name, self.identity_clause()));
        }
        let mut ddl = format!("{} {}", column.name, self.column_type(column)?);
        if !column.nullable {
            ddl.push_str(" NOT NULL");
        }
        if column.unique {
            ddl.push_str(" UNIQUE");
        }
        Ok(ddl)
    }

    fn create_table_ddl(&self, table: &Table) -> Result<String> {
        let mut parts = Vec::with_capacity(table.columns().len() + 1);
        let mut inline_pk = false;
        for column in table.columns() {
            inline_pk |= self.is_identity(column)?;
            parts.push(format!("\t{}", self.create_column_ddl(column)?));
        }
        let pk: Vec<&str> = table
            .primary_key_columns()
            .map(|c| c.name.as_str())
            .collect();
        if !pk.is_empty() && !inline_pk {
            parts.push(format!("\tPRIMARY KEY ({})", pk.join(", ")));
        }
        for fk in table.foreign_keys() {
            parts.push(format!(
                "\tFOREIGN KEY ({}) REFERENCES {}({})",
                fk.columns.join(", "),
                fk.referenced_table,
                fk.referenced_columns.join(", ")
            ));
        }
        Ok(format!(
            "CREATE TABLE {} (\n{}\n)",
            table.qualified_name(),
            parts.join(",\n")
        ))
    }

    fn create_foreign_key(&self, _conn: &dyn Connection, fk: &ForeignKey) -> Result<()> {
        tracing::debug!(
            dialect = NAME,
            table = %fk.table,
            "Foreign key declared inline with CREATE TABLE"
        );
        Ok(())
    }

    fn drop_table_sql(&self, qualified: &str) -> String {
        format!("DROP TABLE IF EXISTS {qualified}")
    }

    fn create_sequence_sql(&self, _qualified: &str, _sequence: &SequenceGenerator) -> Result<String> {
        Err(Self::no_sequences())
    }

    fn drop_sequence_sql(&self, _qualified: &str) -> Result<String> {
        Err(Self::no_sequences())
    }

    fn next_sequence_sql(&self, _qualified: &str) -> Result<String> {
        Err(Self::no_sequences())
    }

    fn select_last_identity_sql(&self, _column: &Column) -> Result<String> {
        Ok("SELECT last_insert_rowid()".to_string())
    }

    fn default_schema(&self, _conn: &dyn Connection) -> Result<Option<String>> {
        Ok(None)
    }

    fn sequence_exists(
        &self,
        _conn: &dyn Connection,
        _schema: Option<&str>,
        _name: &str,
    ) -> Result<bool> {
        Err(Self::no_sequences())
    }

    fn table_exists(&self, conn: &dyn Connection, schema: Option<&str>, name: &str) -> Result<bool> {
        let catalog = match schema {
            Some(schema) => format!("{schema}.sqlite_master"),
            None => "sqlite_master".to_string(),
        };
        exists(
            conn,
            &format!("SELECT name FROM {catalog} WHERE type = 'table' AND name = ?1"),
            &[Value::Text(name.to_string())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::testing::RecordingConnection;
    use relmap_core::{ColumnSource, TableKind};

    #[test]
    fn test_sequences_unsupported() {
        let conn = RecordingConnection::new("SQLite");
        let seq = SequenceGenerator::new("s");
        let err = SqliteDialect
            .create_sequence_if_necessary(&conn, &seq)
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(SqliteDialect.supports(Some(GenerationType::Sequence)).is_err());
        assert_eq!(SqliteDialect.supports(None).unwrap(), IdType::Identity);
    }

    #[test]
    fn test_lock_passes_through() {
        assert_eq!(
            SqliteDialect.apply_lock("SELECT 1", LockMode::PessimisticWrite),
            "SELECT 1"
        );
    }

    #[test]
    fn test_pagination_unbounded_offset() {
        assert_eq!(SqliteDialect.apply_pagination("q", 4, UNBOUNDED), "q\nLIMIT -1 OFFSET 4");
        assert_eq!(SqliteDialect.apply_pagination("q", 0, UNBOUNDED), "q");
    }

    #[test]
    fn test_trim_functions() {
        let d = SqliteDialect;
        assert_eq!(d.apply_trim(Some(TrimSpec::Leading), Some("'x'"), "a"), "LTRIM(a, 'x')");
        assert_eq!(d.apply_trim(None, None, "a"), "TRIM(a)");
    }

    #[test]
    fn test_identity_table_inlines_key_and_foreign_keys() {
        let mut table = Table::new("detail", None, TableKind::Secondary);
        table
            .bind(
                Column::new("id", SqlType::BigInt, ColumnSource::Attribute("id".into()))
                    .primary_key()
                    .generated(GenerationType::Identity, None),
            )
            .unwrap();
        table
            .bind(Column::new("note", SqlType::Clob, ColumnSource::Attribute("note".into())))
            .unwrap();
        table.add_foreign_key(ForeignKey {
            table: "detail".into(),
            columns: vec!["id".into()],
            referenced_table: "person".into(),
            referenced_columns: vec!["id".into()],
        });

        let ddl = SqliteDialect.create_table_ddl(&table).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE detail (\n\
             \tid INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             \tnote TEXT,\n\
             \tFOREIGN KEY (id) REFERENCES person(id)\n)"
        );

        let conn = RecordingConnection::new("SQLite");
        SqliteDialect
            .create_foreign_key(&conn, &table.foreign_keys()[0])
            .unwrap();
        assert!(conn.statements().is_empty());
    }
}
