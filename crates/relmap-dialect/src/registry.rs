//! Dialect selection by product name.

use std::sync::{Arc, OnceLock};

use relmap_core::{Error, Result};

use crate::{HsqlDialect, PostgresDialect, SqlDialect, SqliteDialect};

/// Ordered set of dialects, searched first to last.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    dialects: Vec<Arc<dyn SqlDialect>>,
}

impl DialectRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// HSQLDB, PostgreSQL and SQLite.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(HsqlDialect)
            .register(PostgresDialect)
            .register(SqliteDialect)
    }

    /// Add a dialect. Earlier registrations win on overlapping product names.
    #[must_use]
    pub fn register(mut self, dialect: impl SqlDialect + 'static) -> Self {
        self.dialects.push(Arc::new(dialect));
        self
    }

    /// Dialect whose product names contain `product` exactly (case-sensitive).
    pub fn resolve(&self, product: &str) -> Result<Arc<dyn SqlDialect>> {
        let dialect = self
            .dialects
            .iter()
            .find(|d| d.matches_product(product))
            .cloned()
            .ok_or_else(|| {
                Error::unsupported(
                    "registry",
                    format!("No dialect registered for database product '{product}'"),
                )
            })?;
        tracing::debug!(product = %product, dialect = dialect.name(), "Resolved SQL dialect");
        Ok(dialect)
    }

    pub fn len(&self) -> usize {
        self.dialects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialects.is_empty()
    }
}

/// Resolve `product` against the built-in dialects.
pub fn dialect_for_product(product: &str) -> Result<Arc<dyn SqlDialect>> {
    static DEFAULTS: OnceLock<DialectRegistry> = OnceLock::new();
    DEFAULTS
        .get_or_init(DialectRegistry::with_defaults)
        .resolve(product)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_exact_product_names() {
        assert_eq!(dialect_for_product("HSQL Database Engine").unwrap().name(), "hsql");
        assert_eq!(dialect_for_product("PostgreSQL").unwrap().name(), "postgres");
        assert_eq!(dialect_for_product("SQLite").unwrap().name(), "sqlite");
        assert_eq!(dialect_for_product("sqlite").unwrap().name(), "sqlite");
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let err = dialect_for_product("postgresql").unwrap_err();
        assert!(err.is_unsupported());
        assert!(dialect_for_product("HSQL").is_err());
    }

    #[test]
    fn test_empty_registry() {
        let registry = DialectRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.resolve("PostgreSQL").is_err());
        assert_eq!(DialectRegistry::with_defaults().len(), 3);
    }
}
