//! Error types shared across the workspace.
//!
//! The taxonomy mirrors where a failure can be diagnosed:
//!
//! - [`MappingError`]: the metadata is inconsistent. Raised while the metamodel is
//!   built, never at DML time, and always carries the source locator.
//! - [`UnsupportedError`]: the mapping asks for something the selected dialect cannot
//!   express (unmapped SQL type, unsupported generation strategy, unknown product).
//! - [`QueryError`] / [`ConnectionError`]: produced by drivers and passed through.
//! - [`DmlError`]: a driver error wrapped with the table and instance it happened on.
//! - [`StateError`]: lifecycle misuse of a managed instance or session.

use std::fmt;

use crate::metadata::Locator;

/// Result alias used throughout relmap.
pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The primary error type.
#[derive(Debug)]
pub enum Error {
    /// Inconsistent mapping metadata.
    Mapping(MappingError),
    /// Operation outside the dialect's capabilities.
    Unsupported(UnsupportedError),
    /// Statement execution failed.
    Query(QueryError),
    /// Connection-level failure.
    Connection(ConnectionError),
    /// Per-table DML failed for a managed instance.
    Dml(DmlError),
    /// Illegal lifecycle transition or use of a closed session.
    State(StateError),
    /// Anything else, with a message.
    Custom(String),
}

impl Error {
    /// Shorthand for a mapping error.
    pub fn mapping(message: impl Into<String>, locator: Option<Locator>) -> Self {
        Error::Mapping(MappingError {
            message: message.into(),
            locator,
        })
    }

    /// Shorthand for an unsupported-operation error.
    pub fn unsupported(dialect: &'static str, message: impl Into<String>) -> Self {
        Error::Unsupported(UnsupportedError {
            dialect,
            message: message.into(),
        })
    }

    /// Shorthand for a lifecycle error.
    pub fn state(message: impl Into<String>) -> Self {
        Error::State(StateError {
            message: message.into(),
        })
    }

    /// Whether this is a configuration problem detectable without a database.
    pub fn is_mapping(&self) -> bool {
        matches!(self, Error::Mapping(_))
    }

    /// Whether this error was raised by a dialect capability check.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }

    /// Walk through `Dml` wrappers to the driver error underneath.
    pub fn root(&self) -> &Error {
        match self {
            Error::Dml(dml) => dml.source.root(),
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "{e}"),
            Error::Unsupported(e) => write!(f, "{e}"),
            Error::Query(e) => write!(f, "{e}"),
            Error::Connection(e) => write!(f, "{e}"),
            Error::Dml(e) => write!(f, "{e}"),
            Error::State(e) => write!(f, "{e}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            Error::Dml(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

/// Metadata could not be resolved into a consistent mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub message: String,
    /// Where the offending declaration came from, if known.
    pub locator: Option<Locator>,
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locator {
            Some(locator) => write!(f, "Mapping error: {} at {}", self.message, locator),
            None => write!(f, "Mapping error: {}", self.message),
        }
    }
}

/// The dialect has no rendering for a requested value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedError {
    /// Name of the dialect that refused.
    pub dialect: &'static str,
    pub message: String,
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported by {}: {}", self.dialect, self.message)
    }
}

/// Classification of statement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error reported by the server.
    Syntax,
    /// Constraint violation (unique, foreign key, not null).
    Constraint,
    /// Object already exists.
    AlreadyExists,
    /// Referenced object does not exist.
    NotFound,
    /// Result had an unexpected shape.
    Decode,
    /// Anything else.
    Database,
}

/// A statement failed to execute.
#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// The statement that failed, when known.
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<BoxedSource>,
}

impl QueryError {
    /// Build a query error without an underlying source.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the failing statement.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query error ({:?}): {}", self.kind, self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " [sql: {sql}]")?;
        }
        Ok(())
    }
}

/// Classification of connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Connect,
    Disconnected,
    Transaction,
}

/// The connection itself failed.
#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<BoxedSource>,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection error ({:?}): {}", self.kind, self.message)
    }
}

/// The DML statement kind that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlOperation {
    Insert,
    Update,
    Remove,
}

impl DmlOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            DmlOperation::Insert => "insert",
            DmlOperation::Update => "update",
            DmlOperation::Remove => "remove",
        }
    }
}

/// A per-table statement failed while flushing an instance.
#[derive(Debug)]
pub struct DmlError {
    pub operation: DmlOperation,
    /// Qualified name of the table the statement targeted.
    pub table: String,
    /// Entity type name.
    pub entity: String,
    /// Rendered identity of the instance.
    pub identity: String,
    /// The driver error, uninterpreted.
    pub source: Box<Error>,
}

impl fmt::Display for DmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to {} {}{} on table {}: {}",
            self.operation.as_str(),
            self.entity,
            self.identity,
            self.table,
            self.source
        )
    }
}

/// Lifecycle misuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub message: String,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state: {}", self.message)
    }
}
