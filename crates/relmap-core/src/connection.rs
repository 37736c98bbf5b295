//! Blocking connection abstraction.
//!
//! relmap never talks to a wire protocol itself. Drivers implement [`Connection`] and
//! the engine hands them finished SQL text plus positional parameters. All calls block
//! until the database answers; timeouts and cancellation belong to the driver.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// A live database connection.
///
/// Methods take `&self`: drivers are expected to serialize access internally, and the
/// session layer never shares one connection between two units of work.
pub trait Connection {
    /// Product name as reported by the server, used to select a dialect.
    fn product_name(&self) -> &str;

    /// Run a statement that returns rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// First row of a query, `None` when the result is empty.
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// First column of the first row. Absence (no row, or SQL NULL) is `Ok(None)`,
    /// which callers use to tell "not found" apart from a genuine failure.
    fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        Ok(self
            .query_one(sql, params)?
            .and_then(|row| row.into_values().into_iter().next())
            .filter(|v| !v.is_null()))
    }

    fn begin(&self) -> Result<()> {
        self.execute("BEGIN", &[]).map(|_| ())
    }

    fn commit(&self) -> Result<()> {
        self.execute("COMMIT", &[]).map(|_| ())
    }

    fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK", &[]).map(|_| ())
    }
}

impl<C: Connection + ?Sized> Connection for &C {
    fn product_name(&self) -> &str {
        (**self).product_name()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn begin(&self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }
}

/// Identifies one database transaction opened by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}
