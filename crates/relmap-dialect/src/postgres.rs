//! PostgreSQL dialect.

use relmap_core::{
    Column, Connection, Error, GenerationType, IdType, LockMode, Result, SequenceGenerator,
    SqlType, Value,
};

use crate::{SqlDialect, UNBOUNDED, exists, with_precision};

const NAME: &str = "postgres";

/// Dialect for PostgreSQL 10 and later (identity columns).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        NAME
    }

    fn product_names(&self) -> &'static [&'static str] {
        &["PostgreSQL"]
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn apply_pagination(&self, sql: &str, first_result: u64, max_results: u64) -> String {
        match (first_result, max_results) {
            (0, UNBOUNDED) => sql.to_string(),
            (0, max) => format!("{sql}\nLIMIT {max}"),
            (first, UNBOUNDED) => format!("{sql}\nOFFSET {first}"),
            (first, max) => format!("{sql}\nLIMIT {max} OFFSET {first}"),
        }
    }

    fn apply_lock(&self, sql: &str, mode: LockMode) -> String {
        match mode {
            LockMode::PessimisticRead => format!("{sql}\nFOR SHARE"),
            LockMode::PessimisticWrite | LockMode::PessimisticForceIncrement => {
                format!("{sql}\nFOR UPDATE")
            }
            LockMode::None | LockMode::Optimistic | LockMode::OptimisticForceIncrement => {
                sql.to_string()
            }
        }
    }

    fn column_type(&self, column: &Column) -> Result<String> {
        let ty = match column.sql_type {
            SqlType::Bit | SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::TinyInt | SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Float | SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal | SqlType::Numeric => with_precision("NUMERIC", column),
            SqlType::Char => format!("CHAR({})", column.length),
            SqlType::Varchar => format!("VARCHAR({})", column.length),
            SqlType::LongVarchar | SqlType::Clob => "TEXT".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Binary | SqlType::Varbinary | SqlType::Blob => "BYTEA".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSONB".to_string(),
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
        Ok(ty)
    }

    fn supports(&self, generation: Option<GenerationType>) -> Result<IdType> {
        Ok(match generation {
            None | Some(GenerationType::Auto | GenerationType::Sequence) => IdType::Sequence,
            Some(GenerationType::Identity) => IdType::Identity,
            Some(GenerationType::Table) => IdType::Table,
        })
    }

    fn create_sequence_sql(&self, qualified: &str, sequence: &SequenceGenerator) -> Result<String> {
        Ok(format!(
            "CREATE SEQUENCE {qualified} START WITH {} INCREMENT BY {}",
            sequence.initial_value, sequence.allocation_size
        ))
    }

    fn drop_sequence_sql(&self, qualified: &str) -> Result<String> {
        Ok(format!("DROP SEQUENCE IF EXISTS {qualified} CASCADE"))
    }

    fn next_sequence_sql(&self, qualified: &str) -> Result<String> {
        Ok(format!("SELECT nextval('{qualified}')"))
    }

    fn select_last_identity_sql(&self, column: &Column) -> Result<String> {
        Ok(format!(
            "SELECT currval(pg_get_serial_sequence('{}', '{}'))",
            column.table, column.name
        ))
    }

    fn default_schema(&self, conn: &dyn Connection) -> Result<Option<String>> {
        let value = conn.query_scalar("SELECT current_schema()", &[])?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    fn fold_identifier(&self, name: &str) -> String {
        name.to_ascii_lowercase()
    }

    fn sequence_exists(
        &self,
        conn: &dyn Connection,
        schema: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        exists(
            conn,
            "SELECT sequence_name FROM information_schema.sequences \
             WHERE sequence_schema = $1 AND sequence_name = $2",
            &[
                Value::Text(self.fold_identifier(schema.unwrap_or("public"))),
                Value::Text(self.fold_identifier(name)),
            ],
        )
    }

    fn table_exists(&self, conn: &dyn Connection, schema: Option<&str>, name: &str) -> Result<bool> {
        exists(
            conn,
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2",
            &[
                Value::Text(self.fold_identifier(schema.unwrap_or("public"))),
                Value::Text(self.fold_identifier(name)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::testing::RecordingConnection;
    use relmap_core::{ColumnSource, ForeignKey, Row, Table, TableGenerator, TableKind};

    #[test]
    fn test_pagination_and_locks() {
        let d = PostgresDialect;
        assert_eq!(d.apply_pagination("q", 0, UNBOUNDED), "q");
        assert_eq!(d.apply_pagination("q", 10, 5), "q\nLIMIT 5 OFFSET 10");
        assert_eq!(d.apply_pagination("q", 10, UNBOUNDED), "q\nOFFSET 10");
        assert_eq!(d.apply_lock("q", LockMode::PessimisticRead), "q\nFOR SHARE");
        assert_eq!(d.apply_lock("q", LockMode::OptimisticForceIncrement), "q");
    }

    #[test]
    fn test_numeric_precision_only_when_declared() {
        let amount = |precision, scale| {
            Column::new("amount", SqlType::Numeric, ColumnSource::Attribute("amount".into()))
                .precision(precision, scale)
        };
        let d = PostgresDialect;
        assert_eq!(d.column_type(&amount(0, 0)).unwrap(), "NUMERIC");
        assert_eq!(d.column_type(&amount(10, 0)).unwrap(), "NUMERIC(10)");
        assert_eq!(d.column_type(&amount(10, 2)).unwrap(), "NUMERIC(10, 2)");
    }

    #[test]
    fn test_create_table_ddl() {
        let mut table = Table::new("person", Some("app".into()), TableKind::Primary);
        table
            .bind(
                Column::new("id", SqlType::BigInt, ColumnSource::Attribute("id".into()))
                    .primary_key()
                    .generated(GenerationType::Identity, None),
            )
            .unwrap();
        table
            .bind(
                Column::new("email", SqlType::Varchar, ColumnSource::Attribute("email".into()))
                    .length(120)
                    .unique(true),
            )
            .unwrap();

        let ddl = PostgresDialect.create_table_ddl(&table).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE app.person (\n\
             \tid BIGINT NOT NULL GENERATED BY DEFAULT AS IDENTITY,\n\
             \temail VARCHAR(120) UNIQUE,\n\
             \tPRIMARY KEY (id)\n)"
        );
    }

    #[test]
    fn test_foreign_key_ddl() {
        let fk = ForeignKey {
            table: "app.person_detail".into(),
            columns: vec!["person_id".into()],
            referenced_table: "app.person".into(),
            referenced_columns: vec!["id".into()],
        };
        let conn = RecordingConnection::new("PostgreSQL");
        PostgresDialect.create_foreign_key(&conn, &fk).unwrap();
        assert_eq!(
            conn.executed_sql(),
            vec![
                "ALTER TABLE app.person_detail\n\tADD FOREIGN KEY (person_id)\n\tREFERENCES app.person(id)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_generator_table_created_in_default_schema() {
        let conn = RecordingConnection::new("PostgreSQL");
        conn.respond("current_schema", vec![Row::from_pairs([("s", Value::from("public"))])]);
        let generator = TableGenerator::new("person_gen");

        assert!(
            PostgresDialect
                .create_table_generator_if_necessary(&conn, &generator)
                .unwrap()
        );
        assert_eq!(
            conn.executed_sql(),
            vec![
                "CREATE TABLE public.relmap_sequences (\n\tseq_name VARCHAR(255),\n\tseq_value BIGINT,\n\tPRIMARY KEY (seq_name)\n)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_identity_readback_names_column() {
        let column = Column::new("id", SqlType::BigInt, ColumnSource::Attribute("id".into()));
        let mut table = Table::new("person", None, TableKind::Primary);
        table.bind(column).unwrap();
        assert_eq!(
            PostgresDialect
                .select_last_identity_sql(table.column("id").unwrap())
                .unwrap(),
            "SELECT currval(pg_get_serial_sequence('person', 'id'))"
        );
    }
}
