//! Resolved attributes.

use relmap_core::{AssociationKind, GenerationType, Locator};

/// The table and column an attribute is stored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub table: String,
    pub column: String,
}

/// What an attribute maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    Basic {
        column: ColumnBinding,
    },
    Id {
        column: ColumnBinding,
        generation: Option<GenerationType>,
    },
    /// Many-to-one or one-to-one. The owning side has a join column.
    Singular {
        kind: AssociationKind,
        target: String,
        join_column: Option<ColumnBinding>,
        mapped_by: Option<String>,
        cascade_persist: bool,
    },
    /// One-to-many or many-to-many.
    Plural {
        kind: AssociationKind,
        target: String,
        mapped_by: Option<String>,
        cascade_persist: bool,
    },
}

/// An attribute after its column has been bound to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    /// Entity or mapped superclass that declared it.
    declared_by: String,
    kind: AttributeType,
    locator: Option<Locator>,
}

impl Attribute {
    pub(crate) fn new(
        name: impl Into<String>,
        declared_by: impl Into<String>,
        kind: AttributeType,
        locator: Option<Locator>,
    ) -> Self {
        Self {
            name: name.into(),
            declared_by: declared_by.into(),
            kind,
            locator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_by(&self) -> &str {
        &self.declared_by
    }

    pub fn kind(&self) -> &AttributeType {
        &self.kind
    }

    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    pub fn is_id(&self) -> bool {
        matches!(self.kind, AttributeType::Id { .. })
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            AttributeType::Singular { .. } | AttributeType::Plural { .. }
        )
    }

    pub fn is_plural(&self) -> bool {
        matches!(self.kind, AttributeType::Plural { .. })
    }

    /// Column holding the value, if the attribute has one on this side.
    pub fn column(&self) -> Option<&ColumnBinding> {
        match &self.kind {
            AttributeType::Basic { column } | AttributeType::Id { column, .. } => Some(column),
            AttributeType::Singular { join_column, .. } => join_column.as_ref(),
            AttributeType::Plural { .. } => None,
        }
    }

    /// Target entity of an association.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttributeType::Singular { target, .. } | AttributeType::Plural { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    pub fn mapped_by(&self) -> Option<&str> {
        match &self.kind {
            AttributeType::Singular { mapped_by, .. } | AttributeType::Plural { mapped_by, .. } => {
                mapped_by.as_deref()
            }
            _ => None,
        }
    }

    pub fn cascades_persist(&self) -> bool {
        match &self.kind {
            AttributeType::Singular {
                cascade_persist, ..
            }
            | AttributeType::Plural {
                cascade_persist, ..
            } => *cascade_persist,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_side_has_no_column() {
        let attr = Attribute::new(
            "profile",
            "Person",
            AttributeType::Singular {
                kind: AssociationKind::OneToOne,
                target: "Profile".into(),
                join_column: None,
                mapped_by: Some("person".into()),
                cascade_persist: true,
            },
            None,
        );
        assert!(attr.is_association());
        assert!(!attr.is_plural());
        assert!(attr.column().is_none());
        assert_eq!(attr.mapped_by(), Some("person"));
        assert!(attr.cascades_persist());
    }
}
