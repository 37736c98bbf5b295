//! Primary-key generation descriptors.

use serde::{Deserialize, Serialize};

/// Strategy requested by the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationType {
    /// Let the dialect choose.
    Auto,
    Identity,
    Sequence,
    Table,
}

/// Strategy a dialect actually uses for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    /// Assigned by the application.
    Manual,
    /// Identity / auto-increment column, read back after insert.
    Identity,
    /// Database sequence, fetched before insert.
    Sequence,
    /// Row in a generator table, fetched before insert.
    Table,
}

impl IdType {
    /// Whether the value must be known before the INSERT is issued.
    pub const fn is_pre_insert(self) -> bool {
        matches!(self, IdType::Sequence | IdType::Table)
    }
}

/// A database sequence backing generated keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGenerator {
    /// Logical generator name referenced by id attributes.
    pub name: String,
    pub schema: Option<String>,
    /// Physical sequence name.
    pub sequence_name: String,
    pub initial_value: i64,
    pub allocation_size: i64,
}

impl SequenceGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            sequence_name: name.clone(),
            name,
            schema: None,
            initial_value: 1,
            allocation_size: 1,
        }
    }

    pub fn sequence_name(mut self, name: impl Into<String>) -> Self {
        self.sequence_name = name.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn initial_value(mut self, value: i64) -> Self {
        self.initial_value = value;
        self
    }

    pub fn allocation_size(mut self, size: i64) -> Self {
        self.allocation_size = size;
        self
    }
}

/// A two-column table whose rows hold the next value per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGenerator {
    /// Logical generator name referenced by id attributes.
    pub name: String,
    pub schema: Option<String>,
    pub table: String,
    pub pk_column_name: String,
    pub value_column_name: String,
    /// Row key for this generator inside the table.
    pub pk_column_value: String,
    pub initial_value: i64,
    /// Values reserved per key. Only the first value of each block is used, so keys
    /// step by this amount; keep the default of 1 for consecutive keys.
    pub allocation_size: i64,
}

impl TableGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            pk_column_value: name.clone(),
            name,
            schema: None,
            table: "relmap_sequences".to_string(),
            pk_column_name: "seq_name".to_string(),
            value_column_name: "seq_value".to_string(),
            initial_value: 1,
            allocation_size: 1,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn columns(mut self, pk_column: impl Into<String>, value_column: impl Into<String>) -> Self {
        self.pk_column_name = pk_column.into();
        self.value_column_name = value_column.into();
        self
    }

    pub fn pk_column_value(mut self, value: impl Into<String>) -> Self {
        self.pk_column_value = value.into();
        self
    }

    pub fn initial_value(mut self, value: i64) -> Self {
        self.initial_value = value;
        self
    }

    pub fn allocation_size(mut self, size: i64) -> Self {
        self.allocation_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_defaults() {
        let seq = SequenceGenerator::new("person_seq");
        assert_eq!(seq.sequence_name, "person_seq");
        assert_eq!(seq.initial_value, 1);
        assert_eq!(seq.allocation_size, 1);
    }

    #[test]
    fn test_table_generator_builder() {
        let generator = TableGenerator::new("person_gen")
            .table("id_gen")
            .columns("gen_key", "gen_value")
            .allocation_size(50);
        assert_eq!(generator.table, "id_gen");
        assert_eq!(generator.pk_column_value, "person_gen");
        assert_eq!(generator.value_column_name, "gen_value");
        assert_eq!(generator.allocation_size, 50);
    }

    #[test]
    fn test_pre_insert() {
        assert!(IdType::Sequence.is_pre_insert());
        assert!(IdType::Table.is_pre_insert());
        assert!(!IdType::Identity.is_pre_insert());
    }
}
