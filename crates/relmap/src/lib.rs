//! relmap: object-relational mapping for entities spread over several tables.
//!
//! An entity maps to a primary table plus any number of secondary tables, and a
//! subtype adds its own tables below those of its supertypes. relmap resolves those
//! mappings once into a [`Metamodel`], then writes records through a [`Session`]:
//!
//! - INSERT and UPDATE visit an entity's own tables, then those of its supertypes;
//! - DELETE visits them in reverse;
//! - generated keys come from a sequence or generator table before the first INSERT,
//!   or from an identity column right after it;
//! - a failure on any table reports the table, the entity and its identity.
//!
//! SQL differences between databases live behind [`SqlDialect`]. HSQLDB, PostgreSQL
//! and SQLite are built in and chosen by the product name the connection reports.
//!
//! # Example
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let metamodel = Metamodel::build(
//!     vec![
//!         EntityMetadata::new("Person")
//!             .table(TableMetadata::new("person"))
//!             .attribute(AttributeMetadata::generated_id(
//!                 "id",
//!                 ColumnMetadata::new(SqlType::BigInt),
//!                 GenerationType::Auto,
//!                 None,
//!             ))
//!             .attribute(AttributeMetadata::basic(
//!                 "name",
//!                 ColumnMetadata::new(SqlType::Varchar).length(80),
//!             )),
//!     ],
//!     Vec::new(),
//! )?;
//!
//! let config = PersistenceConfig::default()
//!     .schema(SchemaConfig::default().ddl(DdlMode::Create));
//! let factory = SessionFactory::new(&conn, Arc::new(metamodel), config)?;
//!
//! let mut session = factory.open(&conn);
//! session.persist(EntityRecord::new("Person").with("name", "Ada"))?;
//! session.commit()?;
//! ```

pub use relmap_core as core;
pub use relmap_dialect as dialect;
pub use relmap_session as session;

pub use relmap_core::{
    AssociationKind, AttributeMetadata, Column, ColumnMetadata, Connection, DmlError,
    DmlOperation, EntityMetadata, Error, ForeignKey, GenerationType, IdType, JoinColumnMetadata,
    Locator, LockMode, MappedSuperclassMetadata, MappingError, PkJoinColumnMetadata, QueryError,
    QueryErrorKind, Result, Row, SecondaryTableMetadata, SequenceGenerator, SqlType, Table,
    TableGenerator, TableMetadata, TransactionId, Value,
};
pub use relmap_dialect::{
    DialectRegistry, HsqlDialect, PostgresDialect, SqlDialect, SqliteDialect, UNBOUNDED,
    dialect_for_product,
};
pub use relmap_session::{
    DdlMode, EntityRecord, EntityType, ManagedInstance, Metamodel, PersistenceConfig,
    RecordHandle, Reference, SchemaConfig, SchemaGenerator, Session, SessionConfig,
    SessionDebugInfo, SessionFactory, Status,
};

#[cfg(feature = "testing")]
pub use relmap_core::testing;

/// Everything needed to declare mappings and run sessions.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        AssociationKind, AttributeMetadata, ColumnMetadata, Connection, DdlMode, EntityMetadata,
        EntityRecord, Error, GenerationType, LockMode, MappedSuperclassMetadata, Metamodel,
        PersistenceConfig, PkJoinColumnMetadata, RecordHandle, Result, Row,
        SchemaConfig, SecondaryTableMetadata, SequenceGenerator, Session, SessionConfig,
        SessionFactory, SqlType, Status, TableGenerator, TableMetadata, Value,
    };
}
