//! Mapping metadata descriptors.
//!
//! These are the plain data structures a mapping front-end (annotations, XML, a
//! derive macro) produces. The metamodel consumes them once at startup and never
//! looks at them again. They derive serde so front-ends may ship them in any format.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::generator::{GenerationType, SequenceGenerator, TableGenerator};
use crate::types::SqlType;

/// Where a declaration came from, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

impl Locator {
    pub fn new(source: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            source: source.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}

/// Primary table of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub schema: Option<String>,
}

impl TableMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Column of a secondary (or subtype) table that references a primary key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkJoinColumnMetadata {
    pub name: String,
    /// Defaults to the primary key column at the same position.
    pub referenced_column_name: Option<String>,
}

impl PkJoinColumnMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column_name: None,
        }
    }

    pub fn references(mut self, column: impl Into<String>) -> Self {
        self.referenced_column_name = Some(column.into());
        self
    }
}

/// An additional table storing part of an entity's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryTableMetadata {
    pub name: String,
    pub schema: Option<String>,
    /// Empty means "same names as the primary key columns".
    pub pk_join_columns: Vec<PkJoinColumnMetadata>,
    pub locator: Option<Locator>,
}

impl SecondaryTableMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            pk_join_columns: Vec::new(),
            locator: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn pk_join_column(mut self, column: PkJoinColumnMetadata) -> Self {
        self.pk_join_columns.push(column);
        self
    }

    pub fn locator(mut self, locator: Locator) -> Self {
        self.locator = Some(locator);
        self
    }
}

/// Physical column settings of a basic or id attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Defaults to the attribute name.
    pub name: Option<String>,
    /// Owning table; `None` means the entity's primary table.
    pub table: Option<String>,
    pub sql_type: SqlType,
    pub length: u32,
    pub precision: u32,
    pub scale: u32,
    pub nullable: bool,
    pub unique: bool,
}

impl ColumnMetadata {
    pub fn new(sql_type: SqlType) -> Self {
        Self {
            name: None,
            table: None,
            sql_type,
            length: 255,
            precision: 0,
            scale: 0,
            nullable: true,
            unique: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// Foreign key column of a singular association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumnMetadata {
    pub name: String,
    /// Defaults to the target's first primary key column.
    pub referenced_column_name: Option<String>,
    /// Owning table; `None` means the entity's primary table.
    pub table: Option<String>,
    pub nullable: bool,
}

impl JoinColumnMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column_name: None,
            table: None,
            nullable: true,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Cardinality of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    /// Collection-valued associations.
    pub const fn is_plural(self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

/// What kind of attribute a declaration describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    Basic {
        column: ColumnMetadata,
    },
    Id {
        column: ColumnMetadata,
        generation: Option<GenerationType>,
        /// Name of a sequence or table generator declared on some entity.
        generator: Option<String>,
    },
    Association {
        kind: AssociationKind,
        /// Target entity name.
        target: String,
        /// Required for singular owning sides.
        join_column: Option<JoinColumnMetadata>,
        /// Attribute on the target that owns the relationship (inverse sides).
        mapped_by: Option<String>,
        cascade_persist: bool,
    },
}

/// One declared attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    pub name: String,
    pub kind: AttributeKind,
    pub locator: Option<Locator>,
}

impl AttributeMetadata {
    pub fn basic(name: impl Into<String>, column: ColumnMetadata) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Basic { column },
            locator: None,
        }
    }

    pub fn id(name: impl Into<String>, column: ColumnMetadata) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Id {
                column: column.nullable(false),
                generation: None,
                generator: None,
            },
            locator: None,
        }
    }

    /// Id attribute with a generated value.
    pub fn generated_id(
        name: impl Into<String>,
        column: ColumnMetadata,
        generation: GenerationType,
        generator: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Id {
                column: column.nullable(false),
                generation: Some(generation),
                generator: generator.map(str::to_string),
            },
            locator: None,
        }
    }

    pub fn association(
        name: impl Into<String>,
        kind: AssociationKind,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Association {
                kind,
                target: target.into(),
                join_column: None,
                mapped_by: None,
                cascade_persist: false,
            },
            locator: None,
        }
    }

    pub fn join_column(mut self, column: JoinColumnMetadata) -> Self {
        if let AttributeKind::Association { join_column, .. } = &mut self.kind {
            *join_column = Some(column);
        }
        self
    }

    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        if let AttributeKind::Association { mapped_by, .. } = &mut self.kind {
            *mapped_by = Some(attribute.into());
        }
        self
    }

    pub fn cascade_persist(mut self, cascade: bool) -> Self {
        if let AttributeKind::Association {
            cascade_persist, ..
        } = &mut self.kind
        {
            *cascade_persist = cascade;
        }
        self
    }

    pub fn locator(mut self, locator: Locator) -> Self {
        self.locator = Some(locator);
        self
    }
}

/// A persistable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    /// Entity or mapped superclass this entity extends.
    pub parent: Option<String>,
    pub table: TableMetadata,
    pub secondary_tables: Vec<SecondaryTableMetadata>,
    pub attributes: Vec<AttributeMetadata>,
    pub sequence_generators: Vec<SequenceGenerator>,
    pub table_generators: Vec<TableGenerator>,
    pub locator: Option<Locator>,
}

impl EntityMetadata {
    /// Entity with its primary table named after it.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: TableMetadata::new(name.clone()),
            name,
            parent: None,
            secondary_tables: Vec::new(),
            attributes: Vec::new(),
            sequence_generators: Vec::new(),
            table_generators: Vec::new(),
            locator: None,
        }
    }

    pub fn table(mut self, table: TableMetadata) -> Self {
        self.table = table;
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn secondary_table(mut self, table: SecondaryTableMetadata) -> Self {
        self.secondary_tables.push(table);
        self
    }

    pub fn attribute(mut self, attribute: AttributeMetadata) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn sequence_generator(mut self, generator: SequenceGenerator) -> Self {
        self.sequence_generators.push(generator);
        self
    }

    pub fn table_generator(mut self, generator: TableGenerator) -> Self {
        self.table_generators.push(generator);
        self
    }

    pub fn locator(mut self, locator: Locator) -> Self {
        self.locator = Some(locator);
        self
    }
}

/// A non-persistable supertype whose attributes are mapped into each subtype's
/// primary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedSuperclassMetadata {
    pub name: String,
    pub parent: Option<String>,
    pub attributes: Vec<AttributeMetadata>,
}

impl MappedSuperclassMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attributes: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn attribute(mut self, attribute: AttributeMetadata) -> Self {
        self.attributes.push(attribute);
        self
    }
}
