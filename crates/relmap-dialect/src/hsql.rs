//! HSQLDB dialect.
//!
//! Catalog probes go through `INFORMATION_SCHEMA.SYSTEM_*` views. HSQLDB folds
//! unquoted identifiers to upper case, so probe parameters are folded the same way.

use relmap_core::{
    Column, Connection, Error, GenerationType, IdType, LockMode, Result, SequenceGenerator,
    SqlType, Value,
};

use crate::{SqlDialect, UNBOUNDED, exists, with_precision};

const NAME: &str = "hsql";

/// Dialect for HSQLDB 2.x.
#[derive(Debug, Clone, Copy, Default)]
pub struct HsqlDialect;

impl SqlDialect for HsqlDialect {
    fn name(&self) -> &'static str {
        NAME
    }

    fn product_names(&self) -> &'static [&'static str] {
        &["HSQL Database Engine"]
    }

    fn apply_pagination(&self, sql: &str, first_result: u64, max_results: u64) -> String {
        match (first_result, max_results) {
            (0, UNBOUNDED) => sql.to_string(),
            (0, max) => format!("{sql}\nLIMIT {max}"),
            // LIMIT 0 means "no limit" to HSQLDB.
            (first, UNBOUNDED) => format!("{sql}\nLIMIT 0 OFFSET {first}"),
            (first, max) => format!("{sql}\nLIMIT {max} OFFSET {first}"),
        }
    }

    fn apply_lock(&self, sql: &str, mode: LockMode) -> String {
        match mode {
            LockMode::PessimisticRead | LockMode::PessimisticForceIncrement => {
                format!("{sql}\nFOR READ ONLY")
            }
            LockMode::PessimisticWrite => format!("{sql}\nFOR UPDATE"),
            LockMode::None | LockMode::Optimistic | LockMode::OptimisticForceIncrement => {
                sql.to_string()
            }
        }
    }

    fn apply_like_escape(&self, escape: &str) -> String {
        format!(" {{ESCAPE {escape}}}")
    }

    fn column_type(&self, column: &Column) -> Result<String> {
        let ty = match column.sql_type {
            SqlType::Blob | SqlType::Clob | SqlType::Varbinary => {
                format!("VARBINARY({})", column.length)
            }
            SqlType::Varchar => format!("VARCHAR({})", column.length),
            SqlType::LongVarchar => "LONGVARCHAR".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Char => "CHAR".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::TinyInt | SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Float => with_precision("FLOAT", column),
            SqlType::Double => with_precision("DOUBLE", column),
            SqlType::Decimal | SqlType::Numeric => with_precision("DECIMAL", column),
            other => {
                return Err(Error::unsupported(
                    NAME,
                    format!(
                        "No column type for {other:?} (column {}.{})",
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

    fn identity_clause(&self) -> &'static str {
        "GENERATED BY DEFAULT AS IDENTITY (START WITH 1, INCREMENT BY 1)"
    }

    fn drop_table_sql(&self, qualified: &str) -> String {
        format!("DROP TABLE {qualified} IF EXISTS CASCADE")
    }

    fn create_sequence_sql(&self, qualified: &str, sequence: &SequenceGenerator) -> Result<String> {
        Ok(format!(
            "CREATE SEQUENCE {qualified} AS BIGINT START WITH {} INCREMENT BY {}",
            sequence.initial_value, sequence.allocation_size
        ))
    }

    fn drop_sequence_sql(&self, qualified: &str) -> Result<String> {
        Ok(format!("DROP SEQUENCE {qualified} IF EXISTS CASCADE"))
    }

    fn next_sequence_sql(&self, qualified: &str) -> Result<String> {
        Ok(format!("CALL NEXT VALUE FOR {qualified}"))
    }

    fn select_last_identity_sql(&self, _column: &Column) -> Result<String> {
        Ok("CALL IDENTITY()".to_string())
    }

    fn default_schema(&self, conn: &dyn Connection) -> Result<Option<String>> {
        let value = conn.query_scalar("SELECT SCHEMA FROM INFORMATION_SCHEMA.SYSTEM_SESSIONS", &[])?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    fn fold_identifier(&self, name: &str) -> String {
        name.to_ascii_uppercase()
    }

    fn sequence_exists(
        &self,
        conn: &dyn Connection,
        schema: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        exists(
            conn,
            "SELECT SEQUENCE_NAME FROM INFORMATION_SCHEMA.SYSTEM_SEQUENCES \
             WHERE SEQUENCE_SCHEMA = ? AND SEQUENCE_NAME = ?",
            &[
                Value::Text(self.fold_identifier(schema.unwrap_or("PUBLIC"))),
                Value::Text(self.fold_identifier(name)),
            ],
        )
    }

    fn table_exists(&self, conn: &dyn Connection, schema: Option<&str>, name: &str) -> Result<bool> {
        exists(
            conn,
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.SYSTEM_TABLES \
             WHERE TABLE_SCHEM = ? AND TABLE_NAME = ?",
            &[
                Value::Text(self.fold_identifier(schema.unwrap_or("PUBLIC"))),
                Value::Text(self.fold_identifier(name)),
            ],
        )
    }
}
