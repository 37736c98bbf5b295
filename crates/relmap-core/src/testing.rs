//! A recording [`Connection`] double for unit and integration tests.
//!
//! Every statement is captured with its parameters. Query results are scripted by
//! SQL substring, or computed by a responder closure that can look at the history
//! (useful to model "the CREATE already happened"). Failures are injected by SQL
//! substring as well.

use std::sync::Mutex;

use crate::connection::Connection;
use crate::error::{Error, QueryError, QueryErrorKind, Result};
use crate::row::Row;
use crate::value::Value;

/// Whether a statement went through `query` or `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Execute,
}

/// One captured statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<Value>,
}

type Responder = Box<dyn Fn(&str, &[Value], &[Statement]) -> Option<Vec<Row>> + Send>;

#[derive(Default)]
struct State {
    history: Vec<Statement>,
    scripted: Vec<(String, Vec<Row>)>,
    failures: Vec<(String, QueryErrorKind, String)>,
    affected: Vec<(String, u64)>,
    responders: Vec<Responder>,
}

/// Connection double that records instead of talking to a database.
pub struct RecordingConnection {
    product: String,
    state: Mutex<State>,
}

impl std::fmt::Debug for RecordingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingConnection")
            .field("product", &self.product)
            .field("statements", &self.statements().len())
            .finish()
    }
}

impl RecordingConnection {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test must not poison assertions made by the next one.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Return `rows` for every query containing `sql_fragment`.
    pub fn respond(&self, sql_fragment: impl Into<String>, rows: Vec<Row>) {
        self.lock().scripted.push((sql_fragment.into(), rows));
    }

    /// Compute query results from the statement, its parameters and the history so far.
    /// Responders are consulted before scripted results; `None` falls through.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &[Value], &[Statement]) -> Option<Vec<Row>> + Send + 'static,
    {
        self.lock().responders.push(Box::new(responder));
    }

    /// Fail every statement containing `sql_fragment`.
    pub fn fail_on(
        &self,
        sql_fragment: impl Into<String>,
        kind: QueryErrorKind,
        message: impl Into<String>,
    ) {
        self.lock()
            .failures
            .push((sql_fragment.into(), kind, message.into()));
    }

    /// Report `rows` affected for executes containing `sql_fragment` (default is 1).
    pub fn affect(&self, sql_fragment: impl Into<String>, rows: u64) {
        self.lock().affected.push((sql_fragment.into(), rows));
    }

    /// Everything issued so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().history.clone()
    }

    /// SQL of statements issued through `execute`.
    pub fn executed_sql(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .filter(|s| s.kind == StatementKind::Execute)
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Statements whose SQL contains `fragment`.
    pub fn matching(&self, fragment: &str) -> Vec<Statement> {
        self.lock()
            .history
            .iter()
            .filter(|s| s.sql.contains(fragment))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().history.clear();
    }

    fn record(&self, kind: StatementKind, sql: &str, params: &[Value]) -> Result<()> {
        let mut state = self.lock();
        state.history.push(Statement {
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if let Some((_, kind, message)) = state
            .failures
            .iter()
            .find(|(fragment, _, _)| sql.contains(fragment.as_str()))
        {
            return Err(Error::Query(
                QueryError::new(*kind, message.clone()).with_sql(sql),
            ));
        }
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn product_name(&self) -> &str {
        &self.product
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(StatementKind::Query, sql, params)?;
        let state = self.lock();
        // History excludes the statement being answered.
        let history = &state.history[..state.history.len() - 1];
        for responder in &state.responders {
            if let Some(rows) = responder(sql, params, history) {
                return Ok(rows);
            }
        }
        Ok(state
            .scripted
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(StatementKind::Execute, sql, params)?;
        Ok(self
            .lock()
            .affected
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map_or(1, |(_, rows)| *rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_scripts() {
        let conn = RecordingConnection::new("PostgreSQL");
        conn.respond("FROM t", vec![Row::from_pairs([("a", Value::Int(1))])]);

        let rows = conn.query("SELECT a FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(conn.execute("DELETE FROM t", &[Value::Int(3)]).unwrap(), 1);

        let history = conn.statements();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].params, vec![Value::Int(3)]);
        assert_eq!(conn.executed_sql(), vec!["DELETE FROM t".to_string()]);
    }

    #[test]
    fn test_failure_injection_still_records() {
        let conn = RecordingConnection::new("PostgreSQL");
        conn.fail_on("INSERT", QueryErrorKind::Constraint, "boom");
        let err = conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert_eq!(conn.statements().len(), 1);
    }

    #[test]
    fn test_responder_sees_history() {
        let conn = RecordingConnection::new("PostgreSQL");
        conn.respond_with(|sql, _, history| {
            let created = history.iter().any(|s| s.sql.starts_with("CREATE"));
            (sql.starts_with("SELECT") && created)
                .then(|| vec![Row::from_pairs([("n", Value::from("x"))])])
        });

        assert!(conn.query("SELECT n", &[]).unwrap().is_empty());
        conn.execute("CREATE X", &[]).unwrap();
        assert_eq!(conn.query("SELECT n", &[]).unwrap().len(), 1);
    }
}
