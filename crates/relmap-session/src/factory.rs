//! Session factory: one per data source.

use std::sync::Arc;

use relmap_core::{Connection, Result};
use relmap_dialect::{SqlDialect, dialect_for_product};

use crate::config::PersistenceConfig;
use crate::metamodel::Metamodel;
use crate::schema::{SchemaChanges, SchemaGenerator};
use crate::session::Session;

/// Binds a metamodel to a database product and opens sessions against it.
///
/// Construction selects the dialect, checks that every entity's key strategy is
/// available under it, and runs the configured schema generation.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    dialect: Arc<dyn SqlDialect>,
    metamodel: Arc<Metamodel>,
    config: PersistenceConfig,
}

impl SessionFactory {
    /// Select the dialect from the connection's product name and initialize.
    pub fn new(
        conn: &dyn Connection,
        metamodel: Arc<Metamodel>,
        config: PersistenceConfig,
    ) -> Result<Self> {
        let dialect = dialect_for_product(conn.product_name())?;
        Self::with_dialect(conn, dialect, metamodel, config)
    }

    /// Initialize with an explicitly chosen dialect.
    #[tracing::instrument(level = "debug", skip_all, fields(dialect = dialect.name()))]
    pub fn with_dialect(
        conn: &dyn Connection,
        dialect: Arc<dyn SqlDialect>,
        metamodel: Arc<Metamodel>,
        config: PersistenceConfig,
    ) -> Result<Self> {
        for entity in metamodel.entities() {
            let id_type = entity.id_type(dialect.as_ref())?;
            tracing::trace!(entity = entity.name(), id_type = ?id_type, "Key strategy");
        }

        let factory = Self {
            dialect,
            metamodel,
            config,
        };
        let changes = factory.generate_schema(conn)?;
        tracing::info!(
            entities = factory.metamodel.len(),
            ddl = ?factory.config.schema.ddl,
            tables_created = changes.tables,
            "Session factory ready"
        );
        Ok(factory)
    }

    fn generate_schema(&self, conn: &dyn Connection) -> Result<SchemaChanges> {
        SchemaGenerator::new(self.dialect.as_ref(), &self.metamodel)
            .with_default_schema(self.config.schema.default_schema.as_deref())
            .apply(conn, self.config.schema.ddl)
    }

    /// Open a session over `connection`.
    pub fn open<C: Connection>(&self, connection: C) -> Session<C> {
        Session::new(
            connection,
            Arc::clone(&self.dialect),
            Arc::clone(&self.metamodel),
        )
        .with_config(self.config.session.clone())
        .with_default_schema(self.config.schema.default_schema.clone())
    }

    pub fn dialect(&self) -> &Arc<dyn SqlDialect> {
        &self.dialect
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }
}
