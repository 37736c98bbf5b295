//! Metamodel and unit of work for relmap.
//!
//! This crate turns mapping metadata into a resolved [`Metamodel`] and writes entity
//! records through a [`Session`], spreading each record over the tables its type maps
//! to.
//!
//! # Role In The Architecture
//!
//! - **Metamodel**: [`EntityType`] binds every attribute to a column of a primary or
//!   secondary table, derives join columns and foreign keys, and follows inheritance
//!   so a subtype row spans the tables of all its supertypes.
//! - **Managed instances**: [`ManagedInstance`] tracks one record's lifecycle
//!   (`MANAGED`, `REMOVED`, `DETACHED`) and runs its per-table DML.
//! - **Unit of work**: [`Session`] owns the connection, the identity map and the open
//!   transaction, and flushes removes, inserts and updates in a fixed order.
//! - **Schema**: [`SchemaGenerator`] creates and drops what the metamodel maps to;
//!   [`SessionFactory`] runs it once per data source and opens sessions.
//!
//! # Example
//!
//! ```ignore
//! let metamodel = Arc::new(Metamodel::build(entities, Vec::new())?);
//! let factory = SessionFactory::new(&conn, metamodel, PersistenceConfig::default())?;
//!
//! let mut session = factory.open(conn);
//! let person = session.persist(EntityRecord::new("Person").with("id", 1_i64))?;
//! session.commit()?;
//! ```

pub mod collection;
pub mod config;
pub mod factory;
pub mod instance;
pub mod metamodel;
pub mod record;
pub mod schema;
pub mod session;
pub mod transaction;

pub use collection::ManagedCollection;
pub use config::{DdlMode, PersistenceConfig, SchemaConfig, SessionConfig};
pub use factory::SessionFactory;
pub use instance::{ManagedId, ManagedInstance, RecordHandle, SessionId, Status};
pub use metamodel::{
    Attribute, AttributeType, ColumnBinding, DmlContext, EntityType, IdGeneration, Metamodel,
    ParentType,
};
pub use record::{EntityRecord, Reference};
pub use schema::{SchemaChanges, SchemaGenerator};
pub use session::{Session, SessionDebugInfo};
pub use transaction::Transaction;
