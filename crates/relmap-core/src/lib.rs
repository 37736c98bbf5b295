//! Core types and traits for relmap.
//!
//! `relmap-core` is the **foundation layer** for the workspace. It defines the
//! physical schema model and the contracts every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `Connection` is the blocking driver abstraction the engine
//!   issues SQL through.
//! - **Physical model**: `Table` and `Column` describe relations independently of any
//!   entity; they carry the type and nullability metadata used for DDL and DML binding.
//! - **Data model**: `Value`, `Row` and `SqlType` are shared by the dialect and
//!   session crates.
//! - **Metadata descriptors**: `EntityMetadata` and friends are what the mapping
//!   front-end hands to the metamodel.
//!
//! # Who Uses This Crate
//!
//! - `relmap-dialect` renders `Column`/`Table` into product-specific DDL.
//! - `relmap-session` resolves `EntityMetadata` into entity types and drives DML.
//! - Driver crates implement `Connection`.

pub mod connection;
pub mod error;
pub mod generator;
pub mod identifiers;
pub mod lock;
pub mod metadata;
pub mod row;
pub mod table;
pub mod types;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{Connection, TransactionId};
pub use error::{
    ConnectionError, ConnectionErrorKind, DmlError, DmlOperation, Error, MappingError,
    QueryError, QueryErrorKind, Result, StateError, UnsupportedError,
};
pub use generator::{GenerationType, IdType, SequenceGenerator, TableGenerator};
pub use identifiers::{is_reserved_word, is_valid_identifier, qualified_name};
pub use lock::{LockMode, TrimSpec};
pub use metadata::{
    AssociationKind, AttributeKind, AttributeMetadata, ColumnMetadata, EntityMetadata,
    JoinColumnMetadata, Locator, MappedSuperclassMetadata, PkJoinColumnMetadata,
    SecondaryTableMetadata, TableMetadata,
};
pub use row::Row;
pub use table::{Column, ColumnSource, ForeignKey, Table, TableKind};
pub use types::SqlType;
pub use value::Value;
