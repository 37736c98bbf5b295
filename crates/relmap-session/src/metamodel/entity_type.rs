//! Entity types: table mapping resolution and multi-table DML.
//!
//! An [`EntityType`] owns its primary table and its secondary tables. Tables inherited
//! from a persistable supertype are reached through the parent and never copied, so
//! the ordered table list of a subtype is its declared tables followed by the parent's
//! own ordered list.
//!
//! DML visits that list in order for insert and update, and in reverse for remove:
//! secondary tables reference their primary table, so their rows go last on insert and
//! first on delete. Subtype tables carry no foreign key to the supertype table, which
//! keeps "declared tables first" a valid insert order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use relmap_core::{
    AttributeKind, AttributeMetadata, Column, ColumnMetadata, ColumnSource, Connection, DmlError,
    DmlOperation, EntityMetadata, Error, ForeignKey, GenerationType, IdType, Locator, LockMode,
    QueryError, QueryErrorKind, Result, SequenceGenerator, SqlType, Table, TableGenerator,
    TableKind, TransactionId, Value, is_reserved_word, is_valid_identifier, qualified_name,
};
use relmap_dialect::SqlDialect;

use super::MetadataIndex;
use super::attribute::{Attribute, AttributeType, ColumnBinding};
use crate::instance::{ManagedId, ManagedInstance, RecordHandle, SessionId, Status};
use crate::record::EntityRecord;

/// Everything DML needs besides the instance: where to send SQL and how to write it.
#[derive(Clone, Copy)]
pub struct DmlContext<'a> {
    pub connection: &'a dyn Connection,
    pub dialect: &'a dyn SqlDialect,
    /// Schema for generators that do not name one.
    pub default_schema: Option<&'a str>,
}

impl std::fmt::Debug for DmlContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmlContext")
            .field("dialect", &self.dialect.name())
            .field("default_schema", &self.default_schema)
            .finish_non_exhaustive()
    }
}

/// Supertype of an entity.
#[derive(Debug, Clone)]
pub enum ParentType {
    None,
    /// A persistable supertype whose tables are written along with the subtype's.
    Entity(Arc<EntityType>),
    /// A non-persistable supertype; its attributes live in the subtype's primary table.
    MappedSuperclass(String),
}

/// How the identity of an entity hierarchy is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdGeneration {
    pub generation: GenerationType,
    /// Used when the dialect resolves the strategy to a sequence.
    pub sequence: SequenceGenerator,
    /// Used when the dialect resolves the strategy to a generator table.
    pub table: TableGenerator,
}

/// Metamodel description of one persistable entity.
#[derive(Debug)]
pub struct EntityType {
    name: String,
    type_hash: u64,
    parent: ParentType,
    primary_table: Arc<Table>,
    secondary_tables: Vec<Arc<Table>>,
    attributes: Vec<Attribute>,
    /// Identity attributes of the hierarchy root, in key-column order.
    id_attributes: Vec<String>,
    id_generation: Option<IdGeneration>,
    locator: Option<Locator>,
    tables: OnceLock<Vec<Arc<Table>>>,
    associations: OnceLock<Vec<Attribute>>,
    associations_persistable: OnceLock<Vec<Attribute>>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable hash of the type name, folded into instance hashes.
    pub fn type_hash(&self) -> u64 {
        self.type_hash
    }

    pub fn parent(&self) -> &ParentType {
        &self.parent
    }

    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    pub fn primary_table(&self) -> &Arc<Table> {
        &self.primary_table
    }

    pub fn secondary_tables(&self) -> &[Arc<Table>] {
        &self.secondary_tables
    }

    /// Declared table by name: the primary table or a secondary table.
    pub fn declared_table(&self, name: &str) -> Option<&Arc<Table>> {
        std::iter::once(&self.primary_table)
            .chain(&self.secondary_tables)
            .find(|t| t.name() == name)
    }

    /// All tables backing this type, inherited ones included.
    ///
    /// Primary table, then secondary tables in declaration order, then the parent's
    /// list when the parent is an entity. Computed on first use.
    pub fn tables(&self) -> &[Arc<Table>] {
        self.tables.get_or_init(|| {
            let mut tables = Vec::with_capacity(1 + self.secondary_tables.len());
            tables.push(Arc::clone(&self.primary_table));
            tables.extend(self.secondary_tables.iter().cloned());
            if let ParentType::Entity(parent) = &self.parent {
                tables.extend(parent.tables().iter().cloned());
            }
            tables
        })
    }

    /// Table by name anywhere in [`tables`](Self::tables).
    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables().iter().find(|t| t.name() == name)
    }

    /// Attributes declared here or by mapped superclasses above.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attribute by name, searching entity supertypes.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name).or_else(|| {
            match &self.parent {
                ParentType::Entity(parent) => parent.attribute(name),
                _ => None,
            }
        })
    }

    /// Association attributes of the whole hierarchy, own first.
    pub fn associations(&self) -> &[Attribute] {
        self.associations.get_or_init(|| {
            let mut associations: Vec<Attribute> = self
                .attributes
                .iter()
                .filter(|a| a.is_association())
                .cloned()
                .collect();
            if let ParentType::Entity(parent) = &self.parent {
                associations.extend(parent.associations().iter().cloned());
            }
            associations
        })
    }

    /// The subset of [`associations`](Self::associations) that cascades persist.
    pub fn associations_persistable(&self) -> &[Attribute] {
        self.associations_persistable.get_or_init(|| {
            self.associations()
                .iter()
                .filter(|a| a.cascades_persist())
                .cloned()
                .collect()
        })
    }

    pub fn id_attributes(&self) -> &[String] {
        &self.id_attributes
    }

    pub fn id_generation(&self) -> Option<&IdGeneration> {
        self.id_generation.as_ref()
    }

    /// Identity values of `record`, if every id attribute is set.
    pub fn id_values(&self, record: &EntityRecord) -> Option<Vec<Value>> {
        self.id_attributes
            .iter()
            .map(|attr| record.get(attr).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Concrete key strategy under `dialect`.
    pub fn id_type(&self, dialect: &dyn SqlDialect) -> Result<IdType> {
        let Some(generation) = &self.id_generation else {
            return Ok(IdType::Manual);
        };
        let id_type = dialect.supports(Some(generation.generation))?;
        if id_type == IdType::Identity {
            if let ParentType::Entity(parent) = &self.parent {
                return Err(Error::unsupported(
                    dialect.name(),
                    format!(
                        "Identity keys are not available for {}: its table is written before \
                         the table of supertype {}. Use sequence or table generation",
                        self.name,
                        parent.name()
                    ),
                ));
            }
        }
        Ok(id_type)
    }

    /// Sequence used for keys, with `default_schema` applied.
    pub fn sequence_generator(&self, default_schema: Option<&str>) -> Option<SequenceGenerator> {
        self.id_generation.as_ref().map(|g| {
            let mut sequence = g.sequence.clone();
            if sequence.schema.is_none() {
                sequence.schema = default_schema.map(str::to_string);
            }
            sequence
        })
    }

    /// Generator table used for keys, with `default_schema` applied.
    pub fn table_generator(&self, default_schema: Option<&str>) -> Option<TableGenerator> {
        self.id_generation.as_ref().map(|g| {
            let mut table = g.table.clone();
            if table.schema.is_none() {
                table.schema = default_schema.map(str::to_string);
            }
            table
        })
    }

    /// Wrap a record of this type for management by `session`.
    pub fn managed_instance(
        self: &Arc<Self>,
        handle: RecordHandle,
        session: SessionId,
        identity: ManagedId,
    ) -> ManagedInstance {
        ManagedInstance::new(Arc::clone(self), handle, session, identity)
    }

    /// Assign key values that must exist before the first INSERT.
    ///
    /// Keys already present in `record` are kept. Identity keys are left for the
    /// database and read back by [`perform_insert`](Self::perform_insert).
    pub fn fill_id_values(&self, ctx: &DmlContext<'_>, record: &mut EntityRecord) -> Result<()> {
        if self.id_values(record).is_some() {
            return Ok(());
        }
        let id_type = self.id_type(ctx.dialect)?;
        let value = match id_type {
            IdType::Manual => {
                return Err(Error::state(format!(
                    "{} has no value for id attribute(s) {} and no generation strategy",
                    self.name,
                    self.id_attributes.join(", ")
                )));
            }
            IdType::Identity => return Ok(()),
            IdType::Sequence => {
                let sequence = self
                    .sequence_generator(ctx.default_schema)
                    .ok_or_else(|| Error::state(format!("{} has no sequence", self.name)))?;
                let name = qualified_name(sequence.schema.as_deref(), &sequence.sequence_name);
                ctx.dialect.next_sequence(ctx.connection, &name)?
            }
            IdType::Table => {
                let generator = self
                    .table_generator(ctx.default_schema)
                    .ok_or_else(|| Error::state(format!("{} has no generator table", self.name)))?;
                ctx.dialect
                    .next_table_generator_value(ctx.connection, &generator)?
            }
        };
        let (attr, column) = self.id_column()?;
        tracing::debug!(entity = %self.name, id_type = ?id_type, value, "Generated key");
        record.set(attr, key_value(column, value)?);
        Ok(())
    }

    /// Insert one row per table, each carrying only that table's columns.
    ///
    /// The instance is associated with `transaction` only after every table succeeded.
    #[tracing::instrument(level = "debug", skip(self, ctx, instance, record), fields(entity = %self.name))]
    pub fn perform_insert(
        &self,
        ctx: &DmlContext<'_>,
        transaction: TransactionId,
        instance: &mut ManagedInstance,
        record: &mut EntityRecord,
    ) -> Result<()> {
        instance.ensure_managed()?;
        if instance.is_executed() {
            tracing::trace!(identity = %instance.identity(), "Already written in this flush");
            return Ok(());
        }
        self.fill_id_values(ctx, record)?;
        let generate_identity = self.id_values(record).is_none();

        for table in self.tables() {
            let mut identity_column = None;
            let columns: Vec<&Column> = table
                .columns()
                .iter()
                .filter(|c| {
                    let generated = generate_identity && c.primary_key && !c.is_join_column();
                    if generated {
                        identity_column = Some(*c);
                    }
                    !generated
                })
                .collect();
            let params: Vec<Value> = columns.iter().map(|c| record.value(c.attribute())).collect();
            let sql = ctx.dialect.insert_sql(table, &columns);
            tracing::trace!(sql = %sql, table = table.name(), "Inserting row");
            ctx.connection
                .execute(&sql, &params)
                .map_err(|e| self.dml_error(DmlOperation::Insert, table, instance.identity(), e))?;

            if let Some(column) = identity_column {
                let value = self
                    .read_identity(ctx, column)
                    .map_err(|e| self.dml_error(DmlOperation::Insert, table, instance.identity(), e))?;
                record.set(column.attribute(), value);
            }
        }

        let identity = self.id_values(record).ok_or_else(|| {
            Error::state(format!("{} has no identity after insert", self.name))
        })?;
        instance.assign_identity(identity);
        instance.set_transaction(transaction);
        instance.set_executed(true);
        tracing::debug!(identity = %instance.identity(), tables = self.tables().len(), "Inserted");
        Ok(())
    }

    /// Update the non-key columns of every table, in insert order.
    #[tracing::instrument(level = "debug", skip(self, ctx, instance, record), fields(entity = %self.name))]
    pub fn perform_update(
        &self,
        ctx: &DmlContext<'_>,
        transaction: TransactionId,
        instance: &mut ManagedInstance,
        record: &EntityRecord,
    ) -> Result<()> {
        instance.ensure_managed()?;
        if instance.is_executed() {
            return Ok(());
        }
        let ids = self.assigned_ids(instance)?;

        for table in self.tables() {
            let set: Vec<&Column> = table.value_columns().collect();
            if set.is_empty() {
                continue;
            }
            let keys: Vec<&Column> = table.primary_key_columns().collect();
            let mut params: Vec<Value> = set.iter().map(|c| record.value(c.attribute())).collect();
            params.extend(self.key_params(&keys, &ids));

            let sql = ctx.dialect.update_sql(table, &set, &keys);
            tracing::trace!(sql = %sql, table = table.name(), "Updating row");
            let updated = ctx
                .connection
                .execute(&sql, &params)
                .map_err(|e| self.dml_error(DmlOperation::Update, table, instance.identity(), e))?;
            if updated == 0 {
                let missing = Error::Query(
                    QueryError::new(QueryErrorKind::NotFound, "No row matched the key").with_sql(sql),
                );
                return Err(self.dml_error(DmlOperation::Update, table, instance.identity(), missing));
            }
        }

        instance.set_transaction(transaction);
        instance.set_executed(true);
        Ok(())
    }

    /// Delete the row of every table, in reverse insert order.
    #[tracing::instrument(level = "debug", skip(self, ctx, instance), fields(entity = %self.name))]
    pub fn perform_remove(
        &self,
        ctx: &DmlContext<'_>,
        transaction: TransactionId,
        instance: &mut ManagedInstance,
    ) -> Result<()> {
        if instance.status() != Status::Removed {
            return Err(Error::state(format!(
                "{} {} must be REMOVED before it is deleted, not {}",
                self.name,
                instance.identity(),
                instance.status()
            )));
        }
        if instance.is_executed() {
            return Ok(());
        }
        let ids = self.assigned_ids(instance)?;

        for table in self.tables().iter().rev() {
            let keys: Vec<&Column> = table.primary_key_columns().collect();
            let sql = ctx.dialect.delete_sql(table, &keys);
            tracing::trace!(sql = %sql, table = table.name(), "Deleting row");
            let deleted = ctx
                .connection
                .execute(&sql, &self.key_params(&keys, &ids))
                .map_err(|e| self.dml_error(DmlOperation::Remove, table, instance.identity(), e))?;
            if deleted == 0 {
                tracing::debug!(table = table.name(), "Row already absent");
            }
        }

        instance.set_transaction(transaction);
        instance.set_executed(true);
        Ok(())
    }

    /// Read the record with identity `ids` from every table.
    ///
    /// `Ok(None)` when the primary table has no such row.
    #[tracing::instrument(level = "debug", skip(self, ctx, ids), fields(entity = %self.name))]
    pub fn perform_select(
        &self,
        ctx: &DmlContext<'_>,
        ids: &[Value],
        lock: LockMode,
    ) -> Result<Option<EntityRecord>> {
        let mut record = EntityRecord::new(&self.name);
        for (attr, value) in self.id_attributes.iter().zip(ids) {
            record.set(attr.clone(), value.clone());
        }

        for (index, table) in self.tables().iter().enumerate() {
            let keys: Vec<&Column> = table.primary_key_columns().collect();
            let values: Vec<&Column> = table.value_columns().collect();
            let selected = if values.is_empty() { &keys } else { &values };
            let sql = ctx
                .dialect
                .apply_lock(&ctx.dialect.select_sql(table, selected, &keys), lock);
            tracing::trace!(sql = %sql, table = table.name(), "Selecting row");

            let Some(row) = ctx.connection.query_one(&sql, &self.key_params(&keys, ids))? else {
                if index == 0 {
                    return Ok(None);
                }
                tracing::debug!(table = table.name(), "Missing row in joined table");
                continue;
            };
            if values.is_empty() {
                continue;
            }
            for (i, column) in values.iter().enumerate() {
                if let Some(value) = row.get(i) {
                    record.set(column.attribute(), value.clone());
                }
            }
        }
        Ok(Some(record))
    }

    /// Identities of the rows of this type, ordered by key and paginated.
    pub fn select_page(
        &self,
        ctx: &DmlContext<'_>,
        first_result: u64,
        max_results: u64,
    ) -> Result<Vec<Vec<Value>>> {
        let table = &self.primary_table;
        let keys: Vec<&Column> = table.primary_key_columns().collect();
        let sql = ctx.dialect.apply_pagination(
            &ctx.dialect.select_keys_sql(table, &keys),
            first_result,
            max_results,
        );
        tracing::trace!(sql = %sql, "Selecting page of keys");
        Ok(ctx
            .connection
            .query(&sql, &[])?
            .into_iter()
            .map(relmap_core::Row::into_values)
            .collect())
    }

    /// Identities of the rows whose `attribute` join column equals `value`.
    pub fn select_ids_by(
        &self,
        ctx: &DmlContext<'_>,
        attribute: &str,
        value: &Value,
    ) -> Result<Vec<Vec<Value>>> {
        let binding = self
            .attribute(attribute)
            .and_then(Attribute::column)
            .ok_or_else(|| {
                Error::state(format!("{}.{attribute} has no column", self.name))
            })?;
        let table = self
            .table(&binding.table)
            .ok_or_else(|| Error::state(format!("{} has no table {}", self.name, binding.table)))?;
        let column = table
            .column(&binding.column)
            .ok_or_else(|| Error::state(format!("{} has no column {}", table.name(), binding.column)))?;

        let keys: Vec<&Column> = table.primary_key_columns().collect();
        let sql = ctx.dialect.select_sql(table, &keys, &[column]);
        tracing::trace!(sql = %sql, "Selecting related keys");
        Ok(ctx
            .connection
            .query(&sql, std::slice::from_ref(value))?
            .into_iter()
            .map(relmap_core::Row::into_values)
            .collect())
    }

    /// The id attribute and its column in the root primary table.
    fn id_column(&self) -> Result<(&str, &Column)> {
        match &self.parent {
            ParentType::Entity(parent) => parent.id_column(),
            _ => {
                let column = self
                    .primary_table
                    .primary_key_columns()
                    .find(|c| !c.is_join_column())
                    .ok_or_else(|| Error::state(format!("{} has no key column", self.name)))?;
                Ok((column.attribute(), column))
            }
        }
    }

    fn read_identity(&self, ctx: &DmlContext<'_>, column: &Column) -> Result<Value> {
        let sql = ctx.dialect.select_last_identity_sql(column)?;
        tracing::trace!(sql = %sql, "Reading generated identity");
        let generated = ctx.connection.query_scalar(&sql, &[])?.and_then(|v| v.as_i64());
        match generated {
            Some(value) => key_value(column, value),
            None => Err(Error::Query(
                QueryError::new(QueryErrorKind::NotFound, "No identity value was generated")
                    .with_sql(sql),
            )),
        }
    }

    fn assigned_ids(&self, instance: &ManagedInstance) -> Result<Vec<Value>> {
        instance.identity().values().map(<[Value]>::to_vec).ok_or_else(|| {
            Error::state(format!(
                "{} {} has not been inserted yet",
                self.name,
                instance.identity()
            ))
        })
    }

    /// Key values for `keys`, matched to id attributes by name.
    fn key_params(&self, keys: &[&Column], ids: &[Value]) -> Vec<Value> {
        keys.iter()
            .map(|c| {
                self.id_attributes
                    .iter()
                    .position(|a| a == c.attribute())
                    .and_then(|i| ids.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    fn dml_error(
        &self,
        operation: DmlOperation,
        table: &Table,
        identity: &ManagedId,
        source: Error,
    ) -> Error {
        tracing::debug!(
            entity = %self.name,
            table = table.name(),
            operation = operation.as_str(),
            error = %source,
            "DML failed"
        );
        Error::Dml(DmlError {
            operation,
            table: table.qualified_name(),
            entity: self.name.clone(),
            identity: identity.to_string(),
            source: Box::new(source),
        })
    }
}

/// Convert a generated key to the column's integer width.
fn key_value(column: &Column, value: i64) -> Result<Value> {
    let converted = match column.sql_type {
        SqlType::TinyInt | SqlType::SmallInt => i16::try_from(value).map(Value::SmallInt),
        SqlType::Integer => i32::try_from(value).map(Value::Int),
        _ => Ok(Value::BigInt(value)),
    };
    converted.map_err(|_| {
        Error::Query(QueryError::new(
            QueryErrorKind::Decode,
            format!("Generated key {value} does not fit column {}", column.name),
        ))
    })
}

fn type_hash(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Construction
// ============================================================================

/// Tables under construction, primary first.
struct TableSet {
    entity: String,
    tables: Vec<Table>,
}

impl TableSet {
    fn get_mut(
        &mut self,
        name: Option<&str>,
        attribute: &str,
        locator: Option<&Locator>,
    ) -> Result<&mut Table> {
        let Some(name) = name else {
            return Ok(&mut self.tables[0]);
        };
        let entity = &self.entity;
        self.tables.iter_mut().find(|t| t.name() == name).ok_or_else(|| {
            Error::mapping(
                format!(
                    "Table {name} referenced by attribute {attribute} of {entity} could not be found"
                ),
                locator.cloned(),
            )
        })
    }
}

fn validate_identifier(kind: &str, name: &str, locator: Option<&Locator>) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else if is_reserved_word(name) {
        Err(Error::mapping(
            format!("Invalid {kind} name '{name}': it is a reserved word; declare another {kind} name"),
            locator.cloned(),
        ))
    } else {
        Err(Error::mapping(
            format!("Invalid {kind} name '{name}'"),
            locator.cloned(),
        ))
    }
}

fn column_from(
    meta: &ColumnMetadata,
    default_name: &str,
    source: ColumnSource,
    locator: Option<&Locator>,
) -> Result<Column> {
    let name = meta.name.as_deref().unwrap_or(default_name);
    validate_identifier("column", name, locator)?;
    Ok(Column::new(name, meta.sql_type, source)
        .length(meta.length)
        .precision(meta.precision, meta.scale)
        .nullable(meta.nullable)
        .unique(meta.unique)
        .locator(locator.cloned()))
}

impl EntityType {
    /// Resolve `meta` into an entity type.
    ///
    /// `inherited` holds mapped-superclass attributes, root first, as
    /// `(declared_by, attribute)`.
    pub(crate) fn build(
        meta: &EntityMetadata,
        parent: ParentType,
        inherited: &[(String, AttributeMetadata)],
        index: &MetadataIndex<'_>,
    ) -> Result<Self> {
        let locator = meta.locator.as_ref();
        validate_identifier("table", &meta.table.name, locator)?;

        let declared: Vec<(&str, &AttributeMetadata)> = inherited
            .iter()
            .map(|(by, a)| (by.as_str(), a))
            .chain(meta.attributes.iter().map(|a| (meta.name.as_str(), a)))
            .collect();

        let mut set = TableSet {
            entity: meta.name.clone(),
            tables: vec![Table::new(
                meta.table.name.clone(),
                meta.table.schema.clone(),
                TableKind::Primary,
            )],
        };
        let mut attributes = Vec::with_capacity(declared.len());

        // Identity: inherited from an entity supertype, or declared in this hierarchy.
        let (id_attributes, id_generation) = match &parent {
            ParentType::Entity(supertype) => {
                if let Some((_, attr)) = declared
                    .iter()
                    .find(|(_, a)| matches!(a.kind, AttributeKind::Id { .. }))
                {
                    return Err(Error::mapping(
                        format!(
                            "{} inherits its identity from {} and cannot declare id attribute {}",
                            meta.name,
                            supertype.name(),
                            attr.name
                        ),
                        attr.locator.clone().or_else(|| locator.cloned()),
                    ));
                }
                for key in supertype.primary_table().primary_key_columns() {
                    let column = Column::new(
                        key.name.clone(),
                        key.sql_type,
                        ColumnSource::PrimaryKeyJoin {
                            attribute: key.attribute().to_string(),
                            referenced_column: key.name.clone(),
                        },
                    )
                    .length(key.length)
                    .precision(key.precision, key.scale)
                    .primary_key();
                    set.tables[0].bind(column)?;
                }
                (
                    supertype.id_attributes().to_vec(),
                    supertype.id_generation().cloned(),
                )
            }
            _ => Self::bind_ids(meta, &declared, &mut set, &mut attributes, index)?,
        };

        // Secondary tables join to the primary key.
        let primary_keys: Vec<Column> = set.tables[0].primary_key_columns().cloned().collect();
        for secondary in &meta.secondary_tables {
            let st_locator = secondary.locator.as_ref().or(locator);
            validate_identifier("table", &secondary.name, st_locator)?;
            if set.tables.iter().any(|t| t.name() == secondary.name) {
                return Err(Error::mapping(
                    format!("Table {} is declared twice by {}", secondary.name, meta.name),
                    st_locator.cloned(),
                ));
            }
            let mut table = Table::new(
                secondary.name.clone(),
                secondary
                    .schema
                    .clone()
                    .or_else(|| meta.table.schema.clone()),
                TableKind::Secondary,
            );
            let mut fk = ForeignKey {
                table: table.qualified_name(),
                columns: Vec::new(),
                referenced_table: set.tables[0].qualified_name(),
                referenced_columns: Vec::new(),
            };
            for (position, key) in primary_keys.iter().enumerate() {
                let join = secondary.pk_join_columns.get(position);
                let name = join.map_or(key.name.as_str(), |j| j.name.as_str());
                let referenced = join
                    .and_then(|j| j.referenced_column_name.as_deref())
                    .unwrap_or(key.name.as_str());
                let target = primary_keys
                    .iter()
                    .find(|k| k.name == referenced)
                    .ok_or_else(|| {
                        Error::mapping(
                            format!(
                                "Join column {name} of table {} references unknown key column {referenced}",
                                secondary.name
                            ),
                            st_locator.cloned(),
                        )
                    })?;
                validate_identifier("column", name, st_locator)?;
                table.bind(
                    Column::new(
                        name,
                        target.sql_type,
                        ColumnSource::PrimaryKeyJoin {
                            attribute: target.attribute().to_string(),
                            referenced_column: target.name.clone(),
                        },
                    )
                    .length(target.length)
                    .precision(target.precision, target.scale)
                    .primary_key()
                    .locator(st_locator.cloned()),
                )?;
                fk.columns.push(name.to_string());
                fk.referenced_columns.push(target.name.clone());
            }
            table.add_foreign_key(fk);
            set.tables.push(table);
        }

        // Everything except ids, in declaration order.
        for (declared_by, attr) in &declared {
            let attr_locator = attr.locator.as_ref().or(locator);
            let kind = match &attr.kind {
                AttributeKind::Id { .. } => continue,
                AttributeKind::Basic { column } => {
                    let table = set.get_mut(column.table.as_deref(), &attr.name, attr_locator)?;
                    let bound = column_from(
                        column,
                        &attr.name,
                        ColumnSource::Attribute(attr.name.clone()),
                        attr_locator,
                    )?;
                    let binding = ColumnBinding {
                        table: table.name().to_string(),
                        column: bound.name.clone(),
                    };
                    table.bind(bound)?;
                    AttributeType::Basic { column: binding }
                }
                AttributeKind::Association {
                    kind,
                    target,
                    join_column,
                    mapped_by,
                    cascade_persist,
                } => {
                    let target_keys = index.id_columns(target, attr_locator)?;
                    if kind.is_plural() {
                        if *kind == relmap_core::AssociationKind::OneToMany && mapped_by.is_none() {
                            return Err(Error::mapping(
                                format!(
                                    "One-to-many attribute {}.{} needs mapped_by; join tables are not supported",
                                    meta.name, attr.name
                                ),
                                attr_locator.cloned(),
                            ));
                        }
                        AttributeType::Plural {
                            kind: *kind,
                            target: target.clone(),
                            mapped_by: mapped_by.clone(),
                            cascade_persist: *cascade_persist,
                        }
                    } else if mapped_by.is_some() {
                        AttributeType::Singular {
                            kind: *kind,
                            target: target.clone(),
                            join_column: None,
                            mapped_by: mapped_by.clone(),
                            cascade_persist: *cascade_persist,
                        }
                    } else {
                        let [(key_attribute, key)] = target_keys.as_slice() else {
                            return Err(Error::mapping(
                                format!(
                                    "Association {}.{} targets {} which has a composite key",
                                    meta.name, attr.name, target
                                ),
                                attr_locator.cloned(),
                            ));
                        };
                        let default_name = format!("{}_id", attr.name);
                        let (name, table_name, nullable) = match join_column {
                            Some(j) => (j.name.as_str(), j.table.as_deref(), j.nullable),
                            None => (default_name.as_str(), None, true),
                        };
                        validate_identifier("column", name, attr_locator)?;
                        let referenced = index.primary_table(target, attr_locator)?;
                        let key_name = key.name.clone().unwrap_or_else(|| key_attribute.clone());
                        let table = set.get_mut(table_name, &attr.name, attr_locator)?;
                        let qualified = table.qualified_name();
                        table.bind(
                            Column::new(name, key.sql_type, ColumnSource::Attribute(attr.name.clone()))
                                .length(key.length)
                                .precision(key.precision, key.scale)
                                .nullable(nullable)
                                .locator(attr_locator.cloned()),
                        )?;
                        table.add_foreign_key(ForeignKey {
                            table: qualified,
                            columns: vec![name.to_string()],
                            referenced_table: referenced,
                            referenced_columns: vec![key_name],
                        });
                        AttributeType::Singular {
                            kind: *kind,
                            target: target.clone(),
                            join_column: Some(ColumnBinding {
                                table: table.name().to_string(),
                                column: name.to_string(),
                            }),
                            mapped_by: None,
                            cascade_persist: *cascade_persist,
                        }
                    }
                }
            };
            attributes.push(Attribute::new(
                attr.name.clone(),
                *declared_by,
                kind,
                attr_locator.cloned(),
            ));
        }

        let mut tables = set.tables.into_iter().map(Arc::new);
        let primary_table = tables
            .next()
            .ok_or_else(|| Error::mapping(format!("{} has no table", meta.name), locator.cloned()))?;

        tracing::debug!(
            entity = %meta.name,
            table = %primary_table.qualified_name(),
            secondary_tables = meta.secondary_tables.len(),
            attributes = attributes.len(),
            "Resolved entity type"
        );

        Ok(Self {
            name: meta.name.clone(),
            type_hash: type_hash(&meta.name),
            parent,
            primary_table,
            secondary_tables: tables.collect(),
            attributes,
            id_attributes,
            id_generation,
            locator: meta.locator.clone(),
            tables: OnceLock::new(),
            associations: OnceLock::new(),
            associations_persistable: OnceLock::new(),
        })
    }

    /// Bind the id attributes of a hierarchy root into its primary table.
    fn bind_ids(
        meta: &EntityMetadata,
        declared: &[(&str, &AttributeMetadata)],
        set: &mut TableSet,
        attributes: &mut Vec<Attribute>,
        index: &MetadataIndex<'_>,
    ) -> Result<(Vec<String>, Option<IdGeneration>)> {
        let primary = set.tables[0].name().to_string();
        let mut ids = Vec::new();
        let mut generated = Vec::new();

        for (declared_by, attr) in declared {
            let AttributeKind::Id {
                column,
                generation,
                generator,
            } = &attr.kind
            else {
                continue;
            };
            let attr_locator = attr.locator.as_ref().or(meta.locator.as_ref());
            if column.table.as_deref().is_some_and(|t| t != primary) {
                return Err(Error::mapping(
                    format!(
                        "Id attribute {}.{} must be stored in primary table {primary}",
                        meta.name, attr.name
                    ),
                    attr_locator.cloned(),
                ));
            }
            let bound = column_from(
                column,
                &attr.name,
                ColumnSource::Attribute(attr.name.clone()),
                attr_locator,
            )?
            .primary_key();
            let bound = match generation {
                Some(g) => bound.generated(*g, generator.clone()),
                None => bound,
            };
            let binding = ColumnBinding {
                table: primary.clone(),
                column: bound.name.clone(),
            };
            set.tables[0].bind(bound)?;
            if let Some(g) = generation {
                generated.push((*g, generator.as_deref(), attr_locator));
            }
            ids.push(attr.name.clone());
            attributes.push(Attribute::new(
                attr.name.clone(),
                *declared_by,
                AttributeType::Id {
                    column: binding,
                    generation: *generation,
                },
                attr_locator.cloned(),
            ));
        }

        if ids.is_empty() {
            return Err(Error::mapping(
                format!("{} declares no id attribute", meta.name),
                meta.locator.clone(),
            ));
        }

        let id_generation = match generated.as_slice() {
            [] => None,
            [(generation, generator, attr_locator)] if ids.len() == 1 => {
                let mut sequence = SequenceGenerator::new(format!("{primary}_seq"));
                let mut table = TableGenerator::new(meta.name.clone());
                if let Some(name) = generator {
                    match (index.sequence(name), index.table_generator(name)) {
                        (Some(s), _) => sequence = s.clone(),
                        (None, Some(t)) => table = t.clone(),
                        (None, None) => {
                            return Err(Error::mapping(
                                format!("Unknown generator {name} for {}", meta.name),
                                attr_locator.cloned(),
                            ));
                        }
                    }
                }
                Some(IdGeneration {
                    generation: *generation,
                    sequence,
                    table,
                })
            }
            _ => {
                return Err(Error::mapping(
                    format!("{} combines a composite key with key generation", meta.name),
                    meta.locator.clone(),
                ));
            }
        };

        Ok((ids, id_generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::Metamodel;
    use relmap_core::testing::RecordingConnection;
    use relmap_core::{
        ColumnMetadata, MappedSuperclassMetadata, PkJoinColumnMetadata, QueryErrorKind, Row,
        SecondaryTableMetadata, TableMetadata,
    };
    use relmap_dialect::{HsqlDialect, PostgresDialect, SqliteDialect};

    fn varchar() -> ColumnMetadata {
        ColumnMetadata::new(SqlType::Varchar).length(80)
    }

    fn person() -> EntityMetadata {
        EntityMetadata::new("Person")
            .table(TableMetadata::new("person"))
            .secondary_table(
                SecondaryTableMetadata::new("person_detail")
                    .pk_join_column(PkJoinColumnMetadata::new("person_id").references("id")),
            )
            .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
            .attribute(AttributeMetadata::basic("name", varchar()))
            .attribute(AttributeMetadata::basic(
                "bio",
                ColumnMetadata::new(SqlType::Clob).table("person_detail"),
            ))
    }

    fn employee() -> EntityMetadata {
        EntityMetadata::new("Employee")
            .table(TableMetadata::new("employee"))
            .parent("Person")
            .secondary_table(SecondaryTableMetadata::new("employee_badge"))
            .attribute(AttributeMetadata::basic("salary", ColumnMetadata::new(SqlType::Integer)))
            .attribute(AttributeMetadata::basic(
                "badge",
                varchar().table("employee_badge"),
            ))
    }

    fn names(tables: &[Arc<Table>]) -> Vec<&str> {
        tables.iter().map(|t| t.name()).collect()
    }

    #[test]
    fn test_attribute_binding_resolves_tables() {
        let model = Metamodel::build(vec![person()], Vec::new()).unwrap();
        let person = model.entity("Person").unwrap();

        let name = person.attribute("name").unwrap().column().unwrap();
        assert_eq!(name.table, "person");
        let bio = person.attribute("bio").unwrap().column().unwrap();
        assert_eq!(bio.table, "person_detail");

        let detail = person.declared_table("person_detail").unwrap();
        let join = detail.column("person_id").unwrap();
        assert!(join.is_join_column());
        assert_eq!(join.attribute(), "id");
        assert_eq!(detail.foreign_keys()[0].referenced_table, "person");
    }

    #[test]
    fn test_unknown_table_is_mapping_error_with_locator() {
        let meta = EntityMetadata::new("Person").attribute(AttributeMetadata::id(
            "id",
            ColumnMetadata::new(SqlType::BigInt),
        ))
        .attribute(
            AttributeMetadata::basic("bio", varchar().table("audit"))
                .locator(Locator::new("orm.xml", 14, 9)),
        );
        let err = Metamodel::build(vec![meta], Vec::new()).unwrap_err();
        match err {
            Error::Mapping(m) => {
                assert!(m.message.contains("audit"));
                assert_eq!(m.locator, Some(Locator::new("orm.xml", 14, 9)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_subtype_table_order() {
        let model = Metamodel::build(vec![employee(), person()], Vec::new()).unwrap();
        let employee = model.entity("Employee").unwrap();
        let person = model.entity("Person").unwrap();

        assert_eq!(names(person.tables()), vec!["person", "person_detail"]);
        assert_eq!(
            names(employee.tables()),
            vec!["employee", "employee_badge", "person", "person_detail"]
        );
        // Cached and stable.
        assert!(std::ptr::eq(employee.tables(), employee.tables()));
        assert!(Arc::ptr_eq(&employee.tables()[2], &person.tables()[0]));

        let key = employee.primary_table().column("id").unwrap();
        assert!(key.primary_key && key.is_join_column());
        assert!(employee.primary_table().foreign_keys().is_empty());
        assert_eq!(employee.id_attributes(), ["id".to_string()]);
        assert!(employee.attribute("name").is_some());
    }

    #[test]
    fn test_mapped_superclass_attributes_live_in_primary_table() {
        let base = MappedSuperclassMetadata::new("Audited")
            .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
            .attribute(AttributeMetadata::basic("created", ColumnMetadata::new(SqlType::Timestamp)));
        let meta = EntityMetadata::new("Invoice").parent("Audited").attribute(
            AttributeMetadata::basic("total", ColumnMetadata::new(SqlType::Decimal).precision(12, 2)),
        );
        let model = Metamodel::build(vec![meta], vec![base]).unwrap();
        let invoice = model.entity("Invoice").unwrap();

        assert!(matches!(invoice.parent(), ParentType::MappedSuperclass(n) if n == "Audited"));
        assert_eq!(names(invoice.tables()), vec!["Invoice"]);
        let columns: Vec<&str> = invoice
            .primary_table()
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(columns, vec!["id", "created", "total"]);
        assert_eq!(invoice.attribute("created").unwrap().declared_by(), "Audited");
    }

    #[test]
    fn test_insert_writes_only_owned_columns() {
        let model = Metamodel::build(vec![person()], Vec::new()).unwrap();
        let person = model.entity("Person").unwrap();
        let conn = RecordingConnection::new("HSQL Database Engine");
        let ctx = DmlContext {
            connection: &conn,
            dialect: &HsqlDialect,
            default_schema: None,
        };
        let mut record = EntityRecord::new("Person")
            .with("id", 5_i64)
            .with("name", "Ada")
            .with("bio", "Analyst");
        let mut instance = person.managed_instance(RecordHandle::new(1), SessionId::next(), ManagedId::Pending(1));
        let tx = TransactionId::next();

        person.perform_insert(&ctx, tx, &mut instance, &mut record).unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].sql, "INSERT INTO person (id, name) VALUES (?, ?)");
        assert_eq!(statements[0].params, vec![Value::BigInt(5), Value::from("Ada")]);
        assert_eq!(statements[1].sql, "INSERT INTO person_detail (person_id, bio) VALUES (?, ?)");
        assert_eq!(statements[1].params, vec![Value::BigInt(5), Value::from("Analyst")]);
        assert_eq!(instance.transaction(), Some(tx));
        assert_eq!(instance.identity(), &ManagedId::Assigned(vec![Value::BigInt(5)]));
        assert!(instance.is_executed());
    }

    #[test]
    fn test_failed_second_insert_leaves_transaction_unset() {
        let model = Metamodel::build(vec![person()], Vec::new()).unwrap();
        let person = model.entity("Person").unwrap();
        let conn = RecordingConnection::new("HSQL Database Engine");
        conn.fail_on("person_detail", QueryErrorKind::Constraint, "duplicate key");
        let ctx = DmlContext {
            connection: &conn,
            dialect: &HsqlDialect,
            default_schema: None,
        };
        let mut record = EntityRecord::new("Person").with("id", 5_i64);
        let mut instance = person.managed_instance(RecordHandle::new(1), SessionId::next(), ManagedId::Pending(1));

        let err = person
            .perform_insert(&ctx, TransactionId::next(), &mut instance, &mut record)
            .unwrap_err();
        match &err {
            Error::Dml(dml) => {
                assert_eq!(dml.table, "person_detail");
                assert_eq!(dml.operation, DmlOperation::Insert);
                assert_eq!(dml.entity, "Person");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root(), Error::Query(q) if q.kind == QueryErrorKind::Constraint));
        assert!(instance.transaction().is_none());
        assert!(!instance.is_executed());
    }

    #[test]
    fn test_update_in_order_and_remove_in_reverse() {
        let model = Metamodel::build(vec![employee(), person()], Vec::new()).unwrap();
        let employee = model.entity("Employee").unwrap();
        let conn = RecordingConnection::new("PostgreSQL");
        let ctx = DmlContext {
            connection: &conn,
            dialect: &PostgresDialect,
            default_schema: None,
        };
        let record = EntityRecord::new("Employee")
            .with("id", 9_i64)
            .with("name", "Lin")
            .with("salary", 10)
            .with("badge", "B-1");
        let mut instance = employee.managed_instance(
            RecordHandle::new(1),
            SessionId::next(),
            ManagedId::Assigned(vec![Value::BigInt(9)]),
        );

        employee
            .perform_update(&ctx, TransactionId::next(), &mut instance, &record)
            .unwrap();
        let updates: Vec<String> = conn.executed_sql();
        assert_eq!(
            updates,
            vec![
                "UPDATE employee SET salary = $1 WHERE id = $2",
                "UPDATE employee_badge SET badge = $1 WHERE id = $2",
                "UPDATE person SET name = $1 WHERE id = $2",
                "UPDATE person_detail SET bio = $1 WHERE person_id = $2",
            ]
        );

        conn.clear();
        instance.set_executed(false);
        instance.mark_removed().unwrap();
        employee
            .perform_remove(&ctx, TransactionId::next(), &mut instance)
            .unwrap();
        assert_eq!(
            conn.executed_sql(),
            vec![
                "DELETE FROM person_detail WHERE person_id = $1",
                "DELETE FROM person WHERE id = $1",
                "DELETE FROM employee_badge WHERE id = $1",
                "DELETE FROM employee WHERE id = $1",
            ]
        );
        assert!(conn.statements().iter().all(|s| s.params == vec![Value::BigInt(9)]));
    }

    #[test]
    fn test_sequence_key_fetched_before_insert() {
        let meta = EntityMetadata::new("Ticket")
            .sequence_generator(SequenceGenerator::new("ticket_gen").sequence_name("ticket_seq"))
            .attribute(AttributeMetadata::generated_id(
                "id",
                ColumnMetadata::new(SqlType::Integer),
                GenerationType::Sequence,
                Some("ticket_gen"),
            ));
        let model = Metamodel::build(vec![meta], Vec::new()).unwrap();
        let ticket = model.entity("Ticket").unwrap();
        let conn = RecordingConnection::new("HSQL Database Engine");
        conn.respond("NEXT VALUE FOR", vec![Row::from_pairs([("v", Value::BigInt(41))])]);
        let ctx = DmlContext {
            connection: &conn,
            dialect: &HsqlDialect,
            default_schema: Some("APP"),
        };
        let mut record = EntityRecord::new("Ticket");
        let mut instance = ticket.managed_instance(RecordHandle::new(1), SessionId::next(), ManagedId::Pending(1));

        ticket
            .perform_insert(&ctx, TransactionId::next(), &mut instance, &mut record)
            .unwrap();

        assert_eq!(conn.statements()[0].sql, "CALL NEXT VALUE FOR APP.ticket_seq");
        assert_eq!(record.get("id"), Some(&Value::Int(41)));
        assert_eq!(instance.identity(), &ManagedId::Assigned(vec![Value::Int(41)]));
    }

    #[test]
    fn test_identity_read_back_and_propagated() {
        let meta = EntityMetadata::new("Note")
            .secondary_table(SecondaryTableMetadata::new("note_body"))
            .attribute(AttributeMetadata::generated_id(
                "id",
                ColumnMetadata::new(SqlType::BigInt),
                GenerationType::Identity,
                None,
            ))
            .attribute(AttributeMetadata::basic("body", varchar().table("note_body")));
        let model = Metamodel::build(vec![meta], Vec::new()).unwrap();
        let note = model.entity("Note").unwrap();
        let conn = RecordingConnection::new("SQLite");
        conn.respond("last_insert_rowid", vec![Row::from_pairs([("id", Value::BigInt(3))])]);
        let ctx = DmlContext {
            connection: &conn,
            dialect: &SqliteDialect,
            default_schema: None,
        };
        let mut record = EntityRecord::new("Note").with("body", "hi");
        let mut instance = note.managed_instance(RecordHandle::new(1), SessionId::next(), ManagedId::Pending(1));

        note.perform_insert(&ctx, TransactionId::next(), &mut instance, &mut record)
            .unwrap();

        let sql: Vec<String> = conn.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(
            sql,
            vec![
                "INSERT INTO Note DEFAULT VALUES",
                "SELECT last_insert_rowid()",
                "INSERT INTO note_body (id, body) VALUES (?1, ?2)",
            ]
        );
        assert_eq!(conn.statements()[2].params[0], Value::BigInt(3));
    }

    #[test]
    fn test_identity_rejected_for_subtypes() {
        let root = EntityMetadata::new("Shape").attribute(AttributeMetadata::generated_id(
            "id",
            ColumnMetadata::new(SqlType::BigInt),
            GenerationType::Auto,
            None,
        ));
        let circle = EntityMetadata::new("Circle")
            .parent("Shape")
            .attribute(AttributeMetadata::basic("radius", ColumnMetadata::new(SqlType::Double)));
        let model = Metamodel::build(vec![root, circle], Vec::new()).unwrap();
        let circle = model.entity("Circle").unwrap();

        assert_eq!(circle.id_type(&HsqlDialect).unwrap(), IdType::Sequence);
        assert!(circle.id_type(&SqliteDialect).unwrap_err().is_unsupported());
        assert_eq!(
            model.entity("Shape").unwrap().id_type(&SqliteDialect).unwrap(),
            IdType::Identity
        );
    }

    #[test]
    fn test_select_reads_every_table_with_lock() {
        let model = Metamodel::build(vec![person()], Vec::new()).unwrap();
        let person = model.entity("Person").unwrap();
        let conn = RecordingConnection::new("HSQL Database Engine");
        conn.respond("FROM person WHERE", vec![Row::from_pairs([("name", Value::from("Ada"))])]);
        conn.respond("FROM person_detail", vec![Row::from_pairs([("bio", Value::from("x"))])]);
        let ctx = DmlContext {
            connection: &conn,
            dialect: &HsqlDialect,
            default_schema: None,
        };

        let record = person
            .perform_select(&ctx, &[Value::BigInt(5)], LockMode::PessimisticWrite)
            .unwrap()
            .unwrap();
        assert_eq!(record.get("id"), Some(&Value::BigInt(5)));
        assert_eq!(record.get("name"), Some(&Value::from("Ada")));
        assert_eq!(record.get("bio"), Some(&Value::from("x")));
        assert_eq!(
            conn.statements()[0].sql,
            "SELECT name FROM person WHERE id = ?\nFOR UPDATE"
        );

        let empty = RecordingConnection::new("HSQL Database Engine");
        let ctx = DmlContext {
            connection: &empty,
            dialect: &HsqlDialect,
            default_schema: None,
        };
        assert!(person.perform_select(&ctx, &[Value::BigInt(6)], LockMode::None).unwrap().is_none());
    }
}
