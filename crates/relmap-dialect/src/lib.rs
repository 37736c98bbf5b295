//! SQL dialect adapters for relmap.
//!
//! A [`SqlDialect`] turns logical operations (paginate, lock, create a sequence, fetch
//! the next key) into product-specific SQL. Most methods are pure string transforms;
//! the ones taking a [`Connection`] introspect the catalog or run DDL and are sequenced
//! by the caller.
//!
//! Dialects are stateless and selected once per data source through the
//! [`DialectRegistry`], by exact product name.
//!
//! # Example
//!
//! ```
//! use relmap_dialect::{DialectRegistry, UNBOUNDED};
//!
//! let dialect = DialectRegistry::with_defaults()
//!     .resolve("HSQL Database Engine")
//!     .unwrap();
//! assert_eq!(dialect.apply_pagination("SELECT 1", 0, UNBOUNDED), "SELECT 1");
//! assert_eq!(
//!     dialect.apply_pagination("SELECT 1", 10, 5),
//!     "SELECT 1\nLIMIT 5 OFFSET 10"
//! );
//! ```

pub mod hsql;
pub mod postgres;
pub mod registry;
pub mod sqlite;

use std::fmt;

use relmap_core::{
    Column, Connection, Error, ForeignKey, GenerationType, IdType, LockMode, QueryError,
    QueryErrorKind, Result, SequenceGenerator, Table, TableGenerator, TrimSpec, Value,
    qualified_name,
};

pub use hsql::HsqlDialect;
pub use postgres::PostgresDialect;
pub use registry::{DialectRegistry, dialect_for_product};
pub use sqlite::SqliteDialect;

/// `max_results` value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Product-specific SQL generation.
///
/// Required methods cover what genuinely differs between products; everything else has
/// a default built on top of them.
pub trait SqlDialect: Send + Sync + fmt::Debug {
    /// Short dialect name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Product names (as reported by the driver) this dialect handles.
    fn product_names(&self) -> &'static [&'static str];

    /// Case-sensitive exact match against [`product_names`](Self::product_names).
    fn matches_product(&self, product: &str) -> bool {
        self.product_names().contains(&product)
    }

    // ------------------------------------------------------------------
    // Query string transforms
    // ------------------------------------------------------------------

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String {
        let _ = index;
        "?".to_string()
    }

    /// Restrict `sql` to `max_results` rows starting at `first_result`.
    ///
    /// `(0, UNBOUNDED)` must return `sql` unchanged.
    fn apply_pagination(&self, sql: &str, first_result: u64, max_results: u64) -> String;

    /// Append a row-lock clause. Modes the product has no clause for pass through.
    fn apply_lock(&self, sql: &str, mode: LockMode) -> String;

    fn apply_concat(&self, args: &[&str]) -> String {
        args.join(" || ")
    }

    fn apply_like_escape(&self, escape: &str) -> String {
        format!(" ESCAPE {escape}")
    }

    /// `TRIM([spec] [char] FROM arg)`, or `TRIM(arg)` when neither is given.
    fn apply_trim(&self, spec: Option<TrimSpec>, trim_char: Option<&str>, arg: &str) -> String {
        if spec.is_none() && trim_char.is_none() {
            return format!("TRIM({arg})");
        }
        let mut sql = String::from("TRIM(");
        if let Some(spec) = spec {
            sql.push_str(spec.as_sql());
            sql.push(' ');
        }
        if let Some(c) = trim_char {
            sql.push_str(c);
            sql.push(' ');
        }
        sql.push_str("FROM ");
        sql.push_str(arg);
        sql.push(')');
        sql
    }

    // ------------------------------------------------------------------
    // DDL rendering
    // ------------------------------------------------------------------

    /// SQL type of `column`; unmapped types are an unsupported error.
    fn column_type(&self, column: &Column) -> Result<String>;

    /// Map a requested generation strategy (or none) to what this dialect uses.
    fn supports(&self, generation: Option<GenerationType>) -> Result<IdType>;

    /// Whether `column` is filled by the database on insert.
    fn is_identity(&self, column: &Column) -> Result<bool> {
        if !column.primary_key || column.generation.is_none() || column.is_join_column() {
            return Ok(false);
        }
        Ok(self.supports(column.generation)? == IdType::Identity)
    }

    /// Trailing column clause for identity columns.
    fn identity_clause(&self) -> &'static str {
        "GENERATED BY DEFAULT AS IDENTITY"
    }

    /// `name type[ NOT NULL][ UNIQUE][ identity]`.
    fn create_column_ddl(&self, column: &Column) -> Result<String> {
        let mut ddl = format!("{} {}", column.name, self.column_type(column)?);
        if !column.nullable {
            ddl.push_str(" NOT NULL");
        }
        if column.unique {
            ddl.push_str(" UNIQUE");
        }
        if self.is_identity(column)? {
            ddl.push(' ');
            ddl.push_str(self.identity_clause());
        }
        Ok(ddl)
    }

    /// `CREATE TABLE` with every column and a table-level primary key.
    fn create_table_ddl(&self, table: &Table) -> Result<String> {
        let mut parts = Vec::with_capacity(table.columns().len() + 1);
        for column in table.columns() {
            parts.push(format!("\t{}", self.create_column_ddl(column)?));
        }
        let pk: Vec<&str> = table
            .primary_key_columns()
            .map(|c| c.name.as_str())
            .collect();
        if !pk.is_empty() {
            parts.push(format!("\tPRIMARY KEY ({})", pk.join(", ")));
        }
        Ok(format!(
            "CREATE TABLE {} (\n{}\n)",
            table.qualified_name(),
            parts.join(",\n")
        ))
    }

    fn foreign_key_ddl(&self, fk: &ForeignKey) -> String {
        format!(
            "ALTER TABLE {}\n\tADD FOREIGN KEY ({})\n\tREFERENCES {}({})",
            fk.table,
            fk.columns.join(", "),
            fk.referenced_table,
            fk.referenced_columns.join(", ")
        )
    }

    fn drop_table_sql(&self, qualified: &str) -> String {
        format!("DROP TABLE IF EXISTS {qualified} CASCADE")
    }

    fn create_sequence_sql(&self, qualified: &str, sequence: &SequenceGenerator) -> Result<String>;

    fn drop_sequence_sql(&self, qualified: &str) -> Result<String>;

    /// Statement returning the next value of the (qualified) sequence as a scalar.
    fn next_sequence_sql(&self, qualified: &str) -> Result<String>;

    /// Statement returning the key the database generated for `column` by the last insert.
    fn select_last_identity_sql(&self, column: &Column) -> Result<String>;

    // ------------------------------------------------------------------
    // DML rendering
    // ------------------------------------------------------------------

    fn insert_sql(&self, table: &Table, columns: &[&Column]) -> String {
        if columns.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES", table.qualified_name());
        }
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.qualified_name(),
            names.join(", "),
            params.join(", ")
        )
    }

    fn update_sql(&self, table: &Table, set: &[&Column], keys: &[&Column]) -> String {
        let assignments: Vec<String> = set
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", c.name, self.placeholder(i + 1)))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            table.qualified_name(),
            assignments.join(", "),
            self.key_predicate(keys, set.len() + 1)
        )
    }

    fn delete_sql(&self, table: &Table, keys: &[&Column]) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            table.qualified_name(),
            self.key_predicate(keys, 1)
        )
    }

    fn select_sql(&self, table: &Table, columns: &[&Column], keys: &[&Column]) -> String {
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        format!(
            "SELECT {} FROM {} WHERE {}",
            names.join(", "),
            table.qualified_name(),
            self.key_predicate(keys, 1)
        )
    }

    /// `SELECT keys FROM table ORDER BY keys`, the base of paginated listings.
    fn select_keys_sql(&self, table: &Table, keys: &[&Column]) -> String {
        let names: Vec<&str> = keys.iter().map(|c| c.name.as_str()).collect();
        let names = names.join(", ");
        format!(
            "SELECT {names} FROM {} ORDER BY {names}",
            table.qualified_name()
        )
    }

    /// `k1 = ? AND k2 = ?` with placeholders numbered from `first_index`.
    fn key_predicate(&self, keys: &[&Column], first_index: usize) -> String {
        keys.iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", c.name, self.placeholder(first_index + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    // ------------------------------------------------------------------
    // Introspection and DDL execution
    // ------------------------------------------------------------------

    /// Schema the connection resolves unqualified names against.
    fn default_schema(&self, conn: &dyn Connection) -> Result<Option<String>>;

    /// `explicit` if given, else the connection's default schema.
    fn schema_of(&self, conn: &dyn Connection, explicit: Option<&str>) -> Result<Option<String>> {
        match explicit {
            Some(schema) => Ok(Some(schema.to_string())),
            None => self.default_schema(conn),
        }
    }

    /// Case folding the catalog applies to unquoted identifiers.
    fn fold_identifier(&self, name: &str) -> String {
        name.to_string()
    }

    fn sequence_exists(&self, conn: &dyn Connection, schema: Option<&str>, name: &str)
    -> Result<bool>;

    fn table_exists(&self, conn: &dyn Connection, schema: Option<&str>, name: &str)
    -> Result<bool>;

    /// Create the sequence unless the catalog already has it. Returns whether a
    /// `CREATE` was issued.
    #[tracing::instrument(level = "debug", skip(self, conn, sequence), fields(dialect = self.name(), sequence = %sequence.sequence_name))]
    fn create_sequence_if_necessary(
        &self,
        conn: &dyn Connection,
        sequence: &SequenceGenerator,
    ) -> Result<bool> {
        let schema = self.schema_of(conn, sequence.schema.as_deref())?;
        if self.sequence_exists(conn, schema.as_deref(), &sequence.sequence_name)? {
            tracing::debug!("Sequence already exists");
            return Ok(false);
        }
        let qualified = qualified_name(schema.as_deref(), &sequence.sequence_name);
        let sql = self.create_sequence_sql(&qualified, sequence)?;
        tracing::debug!(sql = %sql, "Creating sequence");
        conn.execute(&sql, &[])?;
        Ok(true)
    }

    /// Create the generator table unless it exists. Returns whether a `CREATE` was issued.
    #[tracing::instrument(level = "debug", skip(self, conn, generator), fields(dialect = self.name(), table = %generator.table))]
    fn create_table_generator_if_necessary(
        &self,
        conn: &dyn Connection,
        generator: &TableGenerator,
    ) -> Result<bool> {
        let schema = self.schema_of(conn, generator.schema.as_deref())?;
        if self.table_exists(conn, schema.as_deref(), &generator.table)? {
            tracing::debug!("Generator table already exists");
            return Ok(false);
        }
        let sql = format!(
            "CREATE TABLE {} (\n\t{} VARCHAR(255),\n\t{} BIGINT,\n\tPRIMARY KEY ({})\n)",
            qualified_name(schema.as_deref(), &generator.table),
            generator.pk_column_name,
            generator.value_column_name,
            generator.pk_column_name
        );
        tracing::debug!(sql = %sql, "Creating generator table");
        conn.execute(&sql, &[])?;
        Ok(true)
    }

    fn create_foreign_key(&self, conn: &dyn Connection, fk: &ForeignKey) -> Result<()> {
        let sql = self.foreign_key_ddl(fk);
        tracing::debug!(dialect = self.name(), sql = %sql, "Creating foreign key");
        conn.execute(&sql, &[])?;
        Ok(())
    }

    fn drop_all_sequences(
        &self,
        conn: &dyn Connection,
        sequences: &[&SequenceGenerator],
    ) -> Result<()> {
        for sequence in sequences {
            let schema = self.schema_of(conn, sequence.schema.as_deref())?;
            let qualified = qualified_name(schema.as_deref(), &sequence.sequence_name);
            let sql = self.drop_sequence_sql(&qualified)?;
            tracing::debug!(dialect = self.name(), sql = %sql, "Dropping sequence");
            conn.execute(&sql, &[])?;
        }
        Ok(())
    }

    /// Drop in the order given; callers pass dependents first.
    fn drop_tables(&self, conn: &dyn Connection, tables: &[&str]) -> Result<()> {
        for table in tables {
            let sql = self.drop_table_sql(table);
            tracing::debug!(dialect = self.name(), sql = %sql, "Dropping table");
            conn.execute(&sql, &[])?;
        }
        Ok(())
    }

    /// Next value of `sequence_name` (qualified or not).
    fn next_sequence(&self, conn: &dyn Connection, sequence_name: &str) -> Result<i64> {
        let sql = self.next_sequence_sql(sequence_name)?;
        tracing::trace!(sql = %sql, "Fetching next sequence value");
        let value = conn.query_scalar(&sql, &[])?;
        scalar_to_i64(value, &sql, "sequence")
    }

    /// Reserve the next block from a generator table and return its first value.
    ///
    /// Nothing is cached between calls, so consecutive keys differ by
    /// `allocation_size`.
    ///
    /// The increment is a single `UPDATE`, so concurrent callers serialize on the row
    /// lock of the enclosing transaction.
    fn next_table_generator_value(
        &self,
        conn: &dyn Connection,
        generator: &TableGenerator,
    ) -> Result<i64> {
        let schema = self.schema_of(conn, generator.schema.as_deref())?;
        let table = qualified_name(schema.as_deref(), &generator.table);
        let key = Value::Text(generator.pk_column_value.clone());
        let step = Value::BigInt(generator.allocation_size);

        let update = format!(
            "UPDATE {table} SET {v} = {v} + {} WHERE {k} = {}",
            self.placeholder(1),
            self.placeholder(2),
            v = generator.value_column_name,
            k = generator.pk_column_name,
        );
        tracing::trace!(sql = %update, "Advancing generator row");
        if conn.execute(&update, &[step, key.clone()])? == 0 {
            let insert = format!(
                "INSERT INTO {table} ({}, {}) VALUES ({}, {})",
                generator.pk_column_name,
                generator.value_column_name,
                self.placeholder(1),
                self.placeholder(2)
            );
            tracing::trace!(sql = %insert, "Seeding generator row");
            conn.execute(
                &insert,
                &[
                    key,
                    Value::BigInt(generator.initial_value + generator.allocation_size),
                ],
            )?;
            return Ok(generator.initial_value);
        }

        let select = format!(
            "SELECT {} FROM {table} WHERE {} = {}",
            generator.value_column_name,
            generator.pk_column_name,
            self.placeholder(1)
        );
        let value = conn.query_scalar(&select, &[key])?;
        Ok(scalar_to_i64(value, &select, "generator table")? - generator.allocation_size)
    }
}

/// `base`, then `(precision)` or `(precision, scale)` for whichever is positive.
pub(crate) fn with_precision(base: &str, column: &Column) -> String {
    match (column.precision, column.scale) {
        (0, _) => base.to_string(),
        (precision, 0) => format!("{base}({precision})"),
        (precision, scale) => format!("{base}({precision}, {scale})"),
    }
}

/// Interpret a scalar key, failing on absence or a non-integral value.
pub(crate) fn scalar_to_i64(value: Option<Value>, sql: &str, what: &str) -> Result<i64> {
    match value {
        Some(v) => v.as_i64().ok_or_else(|| {
            Error::Query(
                QueryError::new(
                    QueryErrorKind::Decode,
                    format!("{what} returned non-integral value {v}"),
                )
                .with_sql(sql),
            )
        }),
        None => Err(Error::Query(
            QueryError::new(QueryErrorKind::NotFound, format!("{what} returned no value"))
                .with_sql(sql),
        )),
    }
}

/// Parse a `COUNT(*)`-style existence probe.
pub(crate) fn exists(conn: &dyn Connection, sql: &str, params: &[Value]) -> Result<bool> {
    tracing::trace!(sql = %sql, "Probing catalog");
    Ok(!conn.query(sql, params)?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::testing::RecordingConnection;
    use relmap_core::{ColumnSource, Row, SqlType, TableKind};

    fn person_table() -> Table {
        let mut table = Table::new("person", None, TableKind::Primary);
        table
            .bind(
                Column::new("id", SqlType::BigInt, ColumnSource::Attribute("id".into()))
                    .primary_key(),
            )
            .unwrap();
        table
            .bind(Column::new(
                "name",
                SqlType::Varchar,
                ColumnSource::Attribute("name".into()),
            ))
            .unwrap();
        table
    }

    #[test]
    fn test_default_trim() {
        let d = HsqlDialect;
        assert_eq!(d.apply_trim(None, None, "x"), "TRIM(x)");
        assert_eq!(
            d.apply_trim(Some(TrimSpec::Leading), Some("' '"), "x"),
            "TRIM(LEADING ' ' FROM x)"
        );
        assert_eq!(d.apply_trim(None, Some("'_'"), "x"), "TRIM('_' FROM x)");
    }

    #[test]
    fn test_dml_rendering() {
        let table = person_table();
        let id = table.column("id").unwrap();
        let name = table.column("name").unwrap();

        let pg = PostgresDialect;
        assert_eq!(
            pg.insert_sql(&table, &[id, name]),
            "INSERT INTO person (id, name) VALUES ($1, $2)"
        );
        assert_eq!(
            pg.update_sql(&table, &[name], &[id]),
            "UPDATE person SET name = $1 WHERE id = $2"
        );
        assert_eq!(pg.delete_sql(&table, &[id]), "DELETE FROM person WHERE id = $1");
        assert_eq!(
            HsqlDialect.select_sql(&table, &[name], &[id]),
            "SELECT name FROM person WHERE id = ?"
        );
    }

    #[test]
    fn test_table_generator_seeds_then_advances() {
        let conn = RecordingConnection::new("PostgreSQL");
        let generator = TableGenerator::new("person_gen").allocation_size(10);
        conn.affect("UPDATE relmap_sequences", 0);

        let first = PostgresDialect
            .next_table_generator_value(&conn, &generator)
            .unwrap();
        assert_eq!(first, 1);
        let insert = conn.matching("INSERT INTO");
        assert_eq!(insert.len(), 1);
        assert_eq!(insert[0].params[1], Value::BigInt(11));

        let conn = RecordingConnection::new("PostgreSQL");
        conn.respond("SELECT seq_value", vec![Row::from_pairs([("seq_value", Value::BigInt(21))])]);
        let next = PostgresDialect
            .next_table_generator_value(&conn, &generator)
            .unwrap();
        assert_eq!(next, 11);
        assert!(conn.matching("INSERT INTO").is_empty());
    }

    #[test]
    fn test_default_table_generator_steps_by_one() {
        let conn = RecordingConnection::new("PostgreSQL");
        let generator = TableGenerator::new("person_gen");
        conn.respond("SELECT seq_value", vec![Row::from_pairs([("seq_value", Value::BigInt(6))])]);

        let next = PostgresDialect
            .next_table_generator_value(&conn, &generator)
            .unwrap();
        assert_eq!(next, 5);
        let update = conn.matching("UPDATE relmap_sequences");
        assert_eq!(update[0].params[0], Value::BigInt(1));
    }

    #[test]
    fn test_missing_sequence_value_is_not_found() {
        let conn = RecordingConnection::new("HSQL Database Engine");
        let err = HsqlDialect.next_sequence(&conn, "PUBLIC.seq").unwrap_err();
        match err {
            Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }
}
