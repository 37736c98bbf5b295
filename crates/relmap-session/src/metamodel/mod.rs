//! The metamodel: entity types resolved from declared mapping metadata.
//!
//! [`Metamodel::build`] runs once at startup. It orders entities so that every
//! supertype is resolved before its subtypes, binds each attribute to a column of a
//! declared table, derives join columns and foreign keys, and reports every mapping
//! problem as [`Error::Mapping`] with the locator of the offending declaration.

mod attribute;
mod entity_type;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use relmap_core::{
    AttributeKind, AttributeMetadata, ColumnMetadata, EntityMetadata, Error, Locator,
    MappedSuperclassMetadata, Result, SequenceGenerator, TableGenerator, qualified_name,
};

pub use attribute::{Attribute, AttributeType, ColumnBinding};
pub use entity_type::{DmlContext, EntityType, IdGeneration, ParentType};

/// Read-only lookups over the raw metadata, used while entity types are resolved.
///
/// Association targets may not be built yet (or may be part of a cycle), so their
/// key columns and tables are read from metadata directly.
pub(crate) struct MetadataIndex<'a> {
    entities: HashMap<&'a str, &'a EntityMetadata>,
    superclasses: HashMap<&'a str, &'a MappedSuperclassMetadata>,
    sequences: HashMap<&'a str, &'a SequenceGenerator>,
    tables: HashMap<&'a str, &'a TableGenerator>,
}

impl<'a> MetadataIndex<'a> {
    fn new(
        entities: &'a [EntityMetadata],
        superclasses: &'a [MappedSuperclassMetadata],
    ) -> Result<Self> {
        let mut index = Self {
            entities: HashMap::new(),
            superclasses: HashMap::new(),
            sequences: HashMap::new(),
            tables: HashMap::new(),
        };
        for meta in entities {
            if index.entities.insert(meta.name.as_str(), meta).is_some() {
                return Err(Error::mapping(
                    format!("Entity {} is declared more than once", meta.name),
                    meta.locator.clone(),
                ));
            }
            for generator in &meta.sequence_generators {
                if let Some(previous) = index.sequences.insert(generator.name.as_str(), generator) {
                    if previous != generator {
                        return Err(Error::mapping(
                            format!("Sequence generator {} is declared twice with different settings", generator.name),
                            meta.locator.clone(),
                        ));
                    }
                }
            }
            for generator in &meta.table_generators {
                if let Some(previous) = index.tables.insert(generator.name.as_str(), generator) {
                    if previous != generator {
                        return Err(Error::mapping(
                            format!("Table generator {} is declared twice with different settings", generator.name),
                            meta.locator.clone(),
                        ));
                    }
                }
            }
        }
        for meta in superclasses {
            if index.entities.contains_key(meta.name.as_str())
                || index.superclasses.insert(meta.name.as_str(), meta).is_some()
            {
                return Err(Error::mapping(
                    format!("Type {} is declared more than once", meta.name),
                    None,
                ));
            }
        }
        Ok(index)
    }

    pub(crate) fn sequence(&self, name: &str) -> Option<&'a SequenceGenerator> {
        self.sequences.get(name).copied()
    }

    pub(crate) fn table_generator(&self, name: &str) -> Option<&'a TableGenerator> {
        self.tables.get(name).copied()
    }

    fn target(&self, name: &str, locator: Option<&Locator>) -> Result<&'a EntityMetadata> {
        self.entities.get(name).copied().ok_or_else(|| {
            Error::mapping(
                format!("Association target {name} is not a declared entity"),
                locator.cloned(),
            )
        })
    }

    /// Qualified primary table of entity `name`.
    pub(crate) fn primary_table(&self, name: &str, locator: Option<&Locator>) -> Result<String> {
        let meta = self.target(name, locator)?;
        Ok(qualified_name(meta.table.schema.as_deref(), &meta.table.name))
    }

    /// Id attributes of entity `name` as `(attribute, column)`, found by walking up
    /// the hierarchy to the type that declares them.
    pub(crate) fn id_columns(
        &self,
        name: &str,
        locator: Option<&Locator>,
    ) -> Result<Vec<(String, ColumnMetadata)>> {
        let meta = self.target(name, locator)?;
        let mut seen: Vec<&str> = vec![&meta.name];
        let mut attributes: &[AttributeMetadata] = &meta.attributes;
        let mut parent = meta.parent.as_deref();
        loop {
            let ids: Vec<(String, ColumnMetadata)> = attributes
                .iter()
                .filter_map(|a| match &a.kind {
                    AttributeKind::Id { column, .. } => Some((a.name.clone(), column.clone())),
                    _ => None,
                })
                .collect();
            if !ids.is_empty() {
                return Ok(ids);
            }
            let Some(next) = parent else {
                return Err(Error::mapping(
                    format!("{name} has no id attribute"),
                    locator.cloned(),
                ));
            };
            if seen.contains(&next) {
                return Err(Error::mapping(
                    format!("Inheritance cycle through {next}"),
                    locator.cloned(),
                ));
            }
            seen.push(next);
            if let Some(entity) = self.entities.get(next) {
                attributes = &entity.attributes;
                parent = entity.parent.as_deref();
            } else if let Some(superclass) = self.superclasses.get(next) {
                attributes = &superclass.attributes;
                parent = superclass.parent.as_deref();
            } else {
                return Err(Error::mapping(
                    format!("Unknown supertype {next} of {name}"),
                    locator.cloned(),
                ));
            }
        }
    }
}

/// Resolves entities supertype-first.
struct Builder<'a> {
    index: MetadataIndex<'a>,
    built: HashMap<String, Arc<EntityType>>,
    order: Vec<Arc<EntityType>>,
    visiting: Vec<String>,
}

impl Builder<'_> {
    fn build(&mut self, name: &str) -> Result<Arc<EntityType>> {
        if let Some(entity) = self.built.get(name) {
            return Ok(Arc::clone(entity));
        }
        let meta = self
            .index
            .entities
            .get(name)
            .copied()
            .ok_or_else(|| Error::mapping(format!("Unknown entity {name}"), None))?;
        if self.visiting.iter().any(|v| v == name) {
            return Err(Error::mapping(
                format!("Inheritance cycle: {} -> {name}", self.visiting.join(" -> ")),
                meta.locator.clone(),
            ));
        }
        self.visiting.push(name.to_string());

        // Walk mapped superclasses up to the first entity, if any.
        let mut superclasses: Vec<&MappedSuperclassMetadata> = Vec::new();
        let mut entity_parent = None;
        let mut next = meta.parent.as_deref();
        while let Some(parent) = next {
            if self.index.entities.contains_key(parent) {
                if let Some(superclass) = superclasses.last() {
                    return Err(Error::mapping(
                        format!(
                            "Mapped superclass {} cannot extend entity {parent}",
                            superclass.name
                        ),
                        meta.locator.clone(),
                    ));
                }
                entity_parent = Some(self.build(parent)?);
                break;
            }
            let Some(superclass) = self.index.superclasses.get(parent).copied() else {
                return Err(Error::mapping(
                    format!("Unknown supertype {parent} of {}", meta.name),
                    meta.locator.clone(),
                ));
            };
            if superclasses.iter().any(|s| s.name == superclass.name) {
                return Err(Error::mapping(
                    format!("Inheritance cycle through {parent}"),
                    meta.locator.clone(),
                ));
            }
            superclasses.push(superclass);
            next = superclass.parent.as_deref();
        }

        let parent = match (entity_parent, superclasses.first()) {
            (Some(entity), _) => ParentType::Entity(entity),
            (None, Some(superclass)) => ParentType::MappedSuperclass(superclass.name.clone()),
            (None, None) => ParentType::None,
        };
        let inherited: Vec<(String, AttributeMetadata)> = superclasses
            .iter()
            .rev()
            .flat_map(|s| s.attributes.iter().map(|a| (s.name.clone(), a.clone())))
            .collect();

        let entity = Arc::new(EntityType::build(meta, parent, &inherited, &self.index)?);
        self.visiting.pop();
        self.built.insert(name.to_string(), Arc::clone(&entity));
        self.order.push(Arc::clone(&entity));
        Ok(entity)
    }
}

/// All entity types of one persistence unit.
#[derive(Debug)]
pub struct Metamodel {
    /// Supertypes before subtypes.
    entities: Vec<Arc<EntityType>>,
    by_name: HashMap<String, usize>,
    sequence_generators: Vec<SequenceGenerator>,
    table_generators: Vec<TableGenerator>,
}

impl Metamodel {
    /// Resolve declared metadata into entity types.
    ///
    /// # Errors
    ///
    /// [`Error::Mapping`] for unknown or cyclic supertypes, undeclared tables, missing
    /// or conflicting ids, invalid identifiers, unknown generators, and inverse sides
    /// whose `mapped_by` does not name an owning attribute.
    #[tracing::instrument(level = "debug", skip_all, fields(entities = entities.len()))]
    pub fn build(
        entities: Vec<EntityMetadata>,
        mapped_superclasses: Vec<MappedSuperclassMetadata>,
    ) -> Result<Self> {
        let started = Instant::now();
        let index = MetadataIndex::new(&entities, &mapped_superclasses)?;
        let mut sequence_generators: Vec<SequenceGenerator> =
            index.sequences.values().map(|g| (*g).clone()).collect();
        sequence_generators.sort_by(|a, b| a.name.cmp(&b.name));
        let mut table_generators: Vec<TableGenerator> =
            index.tables.values().map(|g| (*g).clone()).collect();
        table_generators.sort_by(|a, b| a.name.cmp(&b.name));

        let mut builder = Builder {
            index,
            built: HashMap::new(),
            order: Vec::with_capacity(entities.len()),
            visiting: Vec::new(),
        };
        for meta in &entities {
            builder.build(&meta.name)?;
        }

        let by_name = builder
            .order
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();
        let model = Self {
            entities: builder.order,
            by_name,
            sequence_generators,
            table_generators,
        };
        model.validate_inverse_sides()?;

        tracing::info!(
            entities = model.entities.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Metamodel built"
        );
        Ok(model)
    }

    /// Every `mapped_by` must name a singular owning attribute of the target.
    fn validate_inverse_sides(&self) -> Result<()> {
        for entity in &self.entities {
            for attr in entity.attributes() {
                let (Some(target), Some(mapped_by)) = (attr.target(), attr.mapped_by()) else {
                    continue;
                };
                let target = self.entity(target)?;
                let owning = target
                    .attribute(mapped_by)
                    .filter(|a| matches!(a.kind(), AttributeType::Singular { join_column: Some(_), .. }));
                if owning.is_none() {
                    return Err(Error::mapping(
                        format!(
                            "{}.{} is mapped by {}.{mapped_by}, which is not an owning association",
                            entity.name(),
                            attr.name(),
                            target.name()
                        ),
                        attr.locator().cloned(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Entity type by name.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.get(name)
            .ok_or_else(|| Error::mapping(format!("Unknown entity {name}"), None))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.by_name.get(name).and_then(|i| self.entities.get(*i))
    }

    /// Entity types, supertypes before subtypes.
    pub fn entities(&self) -> &[Arc<EntityType>] {
        &self.entities
    }

    /// Direct subtypes of `name`.
    pub fn subtypes(&self, name: &str) -> impl Iterator<Item = &Arc<EntityType>> + '_ {
        let name = name.to_string();
        self.entities.iter().filter(move |e| {
            matches!(e.parent(), ParentType::Entity(parent) if parent.name() == name)
        })
    }

    /// Named sequence generators declared anywhere, by name.
    pub fn sequence_generators(&self) -> &[SequenceGenerator] {
        &self.sequence_generators
    }

    pub fn table_generators(&self) -> &[TableGenerator] {
        &self.table_generators
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
