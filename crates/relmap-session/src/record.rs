//! Dynamic entity records.
//!
//! relmap does not require compile-time entity structs. An [`EntityRecord`] is the raw
//! object a session manages: the entity name, a map of attribute values, and any
//! related records attached to association attributes.

use std::collections::BTreeMap;

use relmap_core::Value;
use serde::{Deserialize, Serialize};

use crate::instance::RecordHandle;

/// Target of an association attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// A record not yet known to the session; persisted by cascade.
    New(Box<EntityRecord>),
    /// A record the session already manages.
    Managed(RecordHandle),
}

impl From<EntityRecord> for Reference {
    fn from(record: EntityRecord) -> Self {
        Reference::New(Box::new(record))
    }
}

impl From<RecordHandle> for Reference {
    fn from(handle: RecordHandle) -> Self {
        Reference::Managed(handle)
    }
}

/// A dynamically-typed entity instance.
///
/// # Example
///
/// ```
/// use relmap_session::EntityRecord;
/// use relmap_core::Value;
///
/// let mut person = EntityRecord::new("Person");
/// person.set("name", "Ada");
/// person.set("id", 7_i64);
///
/// assert_eq!(person.get("name").and_then(Value::as_str), Some("Ada"));
/// assert_eq!(person.entity(), "Person");
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityRecord {
    entity: String,
    values: AttributeValues,
    references: BTreeMap<String, Reference>,
    collections: BTreeMap<String, Vec<Reference>>,
}

/// Attribute values, serialized for dirty checking.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct AttributeValues(pub(crate) BTreeMap<String, Value>);

impl EntityRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Self::default()
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.values.0.insert(attribute.into(), value.into());
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values.0.get(attribute)
    }

    /// Value or SQL NULL.
    pub fn value(&self, attribute: &str) -> Value {
        self.get(attribute).cloned().unwrap_or(Value::Null)
    }

    pub fn remove(&mut self, attribute: &str) -> Option<Value> {
        self.values.0.remove(attribute)
    }

    pub fn has(&self, attribute: &str) -> bool {
        self.get(attribute).is_some_and(|v| !v.is_null())
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Point a singular association at another record.
    pub fn set_reference(&mut self, attribute: impl Into<String>, target: impl Into<Reference>) {
        self.references.insert(attribute.into(), target.into());
    }

    /// Builder form of [`set_reference`](Self::set_reference).
    pub fn with_reference(
        mut self,
        attribute: impl Into<String>,
        target: impl Into<Reference>,
    ) -> Self {
        self.set_reference(attribute, target);
        self
    }

    /// Append to a plural association.
    pub fn add_to(&mut self, attribute: impl Into<String>, element: impl Into<Reference>) {
        self.collections
            .entry(attribute.into())
            .or_default()
            .push(element.into());
    }

    pub fn reference(&self, attribute: &str) -> Option<&Reference> {
        self.references.get(attribute)
    }

    /// Singular association targets by attribute.
    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.references.iter().map(|(a, r)| (a.as_str(), r))
    }

    /// Collection elements by attribute.
    pub fn collections(&self) -> impl Iterator<Item = (&str, &[Reference])> {
        self.collections.iter().map(|(a, e)| (a.as_str(), e.as_slice()))
    }

    pub(crate) fn take_references(&mut self) -> BTreeMap<String, Reference> {
        std::mem::take(&mut self.references)
    }

    pub(crate) fn take_collections(&mut self) -> BTreeMap<String, Vec<Reference>> {
        std::mem::take(&mut self.collections)
    }

    /// Serialized attribute values; equal snapshots mean nothing to update.
    pub(crate) fn snapshot(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(&self.values).ok()
    }
}
