//! Managed instances: per-object lifecycle state within a unit of work.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relmap_core::{Error, Result, TransactionId, Value};

use crate::collection::ManagedCollection;
use crate::metamodel::{DmlContext, EntityType};
use crate::record::EntityRecord;

/// Stable handle to a record inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordHandle(u64);

impl RecordHandle {
    pub(crate) const fn new(slot: u64) -> Self {
        Self(slot)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identity of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManagedId {
    /// Not yet assigned; keyed by the session slot until the insert runs.
    Pending(u64),
    /// Primary key values in key-column order.
    Assigned(Vec<Value>),
}

impl ManagedId {
    pub fn is_assigned(&self) -> bool {
        matches!(self, ManagedId::Assigned(_))
    }

    pub fn values(&self) -> Option<&[Value]> {
        match self {
            ManagedId::Assigned(values) => Some(values),
            ManagedId::Pending(_) => None,
        }
    }
}

impl fmt::Display for ManagedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedId::Pending(slot) => write!(f, "<unassigned #{slot}>"),
            ManagedId::Assigned(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not yet assigned an identity and not managed.
    New,
    Managed,
    /// Marked for deletion.
    Removed,
    /// No longer managed by its session.
    Detached,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::New => "NEW",
            Status::Managed => "MANAGED",
            Status::Removed => "REMOVED",
            Status::Detached => "DETACHED",
        })
    }
}

/// Runtime wrapper tracking one object under management.
///
/// Two instances are equal when they have the same entity type and identity; the
/// owning session and status do not take part.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    entity: Arc<EntityType>,
    handle: RecordHandle,
    session: SessionId,
    identity: ManagedId,
    status: Status,
    executed: bool,
    loaded: bool,
    transaction: Option<TransactionId>,
    collections: BTreeMap<String, ManagedCollection>,
}

impl ManagedInstance {
    /// A fresh MANAGED instance with one empty collection per plural attribute.
    pub(crate) fn new(
        entity: Arc<EntityType>,
        handle: RecordHandle,
        session: SessionId,
        identity: ManagedId,
    ) -> Self {
        let collections = entity
            .associations()
            .iter()
            .filter(|a| a.is_plural())
            .map(|a| {
                (
                    a.name().to_string(),
                    ManagedCollection::new(a.name(), handle, session),
                )
            })
            .collect();
        Self {
            entity,
            handle,
            session,
            identity,
            status: Status::Managed,
            executed: false,
            loaded: false,
            transaction: None,
            collections,
        }
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn handle(&self) -> RecordHandle {
        self.handle
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn identity(&self) -> &ManagedId {
        &self.identity
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether DML already ran for this instance in the current flush.
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Whether plural associations were loaded from the database.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Transaction the instance was last written in.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn collection(&self, attribute: &str) -> Option<&ManagedCollection> {
        self.collections.get(attribute)
    }

    pub fn collections(&self) -> impl Iterator<Item = &ManagedCollection> {
        self.collections.values()
    }

    pub(crate) fn collection_mut(&mut self, attribute: &str) -> Option<&mut ManagedCollection> {
        self.collections.get_mut(attribute)
    }

    /// Drop `element` from every collection of this instance.
    pub(crate) fn forget(&mut self, element: RecordHandle) {
        for collection in self.collections.values_mut() {
            collection.remove(element);
        }
    }

    pub(crate) fn set_executed(&mut self, executed: bool) {
        self.executed = executed;
    }

    pub(crate) fn set_loaded(&mut self) {
        self.loaded = true;
    }

    pub(crate) fn set_transaction(&mut self, transaction: TransactionId) {
        self.transaction = Some(transaction);
    }

    pub(crate) fn assign_identity(&mut self, values: Vec<Value>) {
        self.identity = ManagedId::Assigned(values);
    }

    /// MANAGED -> REMOVED.
    pub fn mark_removed(&mut self) -> Result<()> {
        self.transition(Status::Removed)
    }

    /// MANAGED -> DETACHED.
    pub fn detach(&mut self) -> Result<()> {
        self.transition(Status::Detached)
    }

    /// Fail unless the instance is MANAGED.
    pub fn ensure_managed(&self) -> Result<()> {
        if self.status == Status::Managed {
            Ok(())
        } else {
            Err(Error::state(format!(
                "{} {} is {}, not MANAGED",
                self.entity.name(),
                self.identity,
                self.status
            )))
        }
    }

    fn transition(&mut self, to: Status) -> Result<()> {
        if self.status != Status::Managed {
            return Err(Error::state(format!(
                "Illegal transition of {} {} from {} to {}",
                self.entity.name(),
                self.identity,
                self.status,
                to
            )));
        }
        tracing::trace!(entity = %self.entity.name(), identity = %self.identity, to = %to, "Status change");
        self.status = to;
        Ok(())
    }

    /// Write every table of the entity. See [`EntityType::perform_insert`].
    pub fn insert(
        &mut self,
        ctx: &DmlContext<'_>,
        transaction: TransactionId,
        record: &mut EntityRecord,
    ) -> Result<()> {
        let entity = Arc::clone(&self.entity);
        entity.perform_insert(ctx, transaction, self, record)
    }

    pub fn update(
        &mut self,
        ctx: &DmlContext<'_>,
        transaction: TransactionId,
        record: &EntityRecord,
    ) -> Result<()> {
        let entity = Arc::clone(&self.entity);
        entity.perform_update(ctx, transaction, self, record)
    }

    pub fn remove(&mut self, ctx: &DmlContext<'_>, transaction: TransactionId) -> Result<()> {
        let entity = Arc::clone(&self.entity);
        entity.perform_remove(ctx, transaction, self)
    }

    fn key_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.identity.hash(&mut hasher);
        self.entity.type_hash().rotate_left(5) ^ hasher.finish()
    }
}

impl PartialEq for ManagedInstance {
    fn eq(&self, other: &Self) -> bool {
        self.entity.type_hash() == other.entity.type_hash()
            && self.entity.name() == other.entity.name()
            && self.identity == other.identity
    }
}

impl Eq for ManagedInstance {}

impl Hash for ManagedInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key_hash());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::Metamodel;
    use relmap_core::{
        AssociationKind, AttributeMetadata, ColumnMetadata, EntityMetadata, SqlType, TableMetadata,
    };
    use std::collections::HashSet;

    fn metamodel() -> Metamodel {
        Metamodel::build(
            vec![
                EntityMetadata::new("Customer")
                    .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
                    .attribute(
                        AttributeMetadata::association("orders", AssociationKind::OneToMany, "Order")
                            .mapped_by("customer"),
                    )
                    .attribute(AttributeMetadata::association(
                        "tags",
                        AssociationKind::ManyToMany,
                        "Tag",
                    )),
                EntityMetadata::new("Order")
                    .table(TableMetadata::new("purchase_order"))
                    .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
                    .attribute(AttributeMetadata::association(
                        "customer",
                        AssociationKind::ManyToOne,
                        "Customer",
                    )),
                EntityMetadata::new("Tag")
                    .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt))),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    fn instance(model: &Metamodel, entity: &str, id: i64) -> ManagedInstance {
        model
            .entity(entity)
            .unwrap()
            .managed_instance(
                RecordHandle::new(1),
                SessionId::next(),
                ManagedId::Assigned(vec![Value::BigInt(id)]),
            )
    }

    #[test]
    fn test_fresh_instance_state() {
        let model = metamodel();
        let session = SessionId::next();
        let customer = model.entity("Customer").unwrap().managed_instance(
            RecordHandle::new(3),
            session,
            ManagedId::Pending(3),
        );

        assert_eq!(customer.status(), Status::Managed);
        assert!(!customer.is_executed());
        assert!(!customer.is_loaded());
        assert!(customer.transaction().is_none());

        let names: Vec<&str> = customer.collections().map(|c| c.attribute()).collect();
        assert_eq!(names, vec!["orders", "tags"]);
        for collection in customer.collections() {
            assert_eq!(collection.owner(), RecordHandle::new(3));
            assert_eq!(collection.session(), session);
            assert!(collection.is_empty());
        }
        assert!(customer.collection("customer").is_none());
    }

    #[test]
    fn test_equality_by_type_and_identity() {
        let model = metamodel();
        let a = instance(&model, "Customer", 1);
        let b = instance(&model, "Customer", 1);
        let other_id = instance(&model, "Customer", 2);
        let other_type = instance(&model, "Tag", 1);

        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));

        assert_ne!(a, other_id);
        assert_ne!(a, other_type);
        assert!(!set.contains(&other_id));
        assert!(!set.contains(&other_type));
    }

    #[test]
    fn test_only_managed_may_transition() {
        let model = metamodel();
        let mut removed = instance(&model, "Order", 1);
        removed.mark_removed().unwrap();
        assert_eq!(removed.status(), Status::Removed);
        assert!(removed.detach().is_err());
        assert!(removed.mark_removed().is_err());
        assert!(removed.ensure_managed().is_err());

        let mut detached = instance(&model, "Order", 2);
        detached.detach().unwrap();
        let err = detached.mark_removed().unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(detached.status(), Status::Detached);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            ManagedId::Assigned(vec![Value::BigInt(4), Value::from("x")]).to_string(),
            "[4, 'x']"
        );
        assert_eq!(ManagedId::Pending(9).to_string(), "<unassigned #9>");
    }
}
