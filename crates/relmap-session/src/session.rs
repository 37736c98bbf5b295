//! The unit of work.
//!
//! A [`Session`] owns a connection, the records it manages, and at most one open
//! transaction. Records enter through [`persist`](Session::persist) or
//! [`find`](Session::find) and are addressed afterwards by [`RecordHandle`].
//!
//! Changes reach the database only on [`flush`](Session::flush), which runs
//! removes, then inserts in persist order, then updates for records whose values
//! changed since they were last written or loaded.
//!
//! # Example
//!
//! ```ignore
//! let mut session = factory.open(connection);
//!
//! let customer = session.persist(
//!     EntityRecord::new("Customer")
//!         .with("id", 1_i64)
//!         .with("name", "Ada"),
//! )?;
//! session.commit()?;
//!
//! let found = session.find("Customer", vec![Value::BigInt(1)], LockMode::None)?;
//! assert_eq!(found, Some(customer));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use relmap_core::{Connection, Error, LockMode, Result, TransactionId, Value};
use relmap_dialect::SqlDialect;

use crate::config::SessionConfig;
use crate::instance::{ManagedId, ManagedInstance, RecordHandle, SessionId, Status};
use crate::metamodel::{Attribute, DmlContext, EntityType, Metamodel, ParentType};
use crate::record::{EntityRecord, Reference};
use crate::transaction::Transaction;

/// Entity name and identity values, integers widened to `BigInt`.
type IdentityKey = (String, Vec<Value>);

/// One record under management.
#[derive(Debug)]
struct Tracked {
    instance: ManagedInstance,
    record: EntityRecord,
    /// Singular associations: attribute -> target record.
    links: BTreeMap<String, RecordHandle>,
    /// Serialized values as last written or loaded; `None` forces an update.
    snapshot: Option<Vec<u8>>,
}

/// The central unit-of-work manager.
pub struct Session<C: Connection> {
    id: SessionId,
    connection: C,
    dialect: Arc<dyn SqlDialect>,
    metamodel: Arc<Metamodel>,
    config: SessionConfig,
    default_schema: Option<String>,
    transaction: Option<Transaction>,
    tracked: BTreeMap<RecordHandle, Tracked>,
    /// MANAGED records with an assigned identity.
    identity_map: HashMap<IdentityKey, RecordHandle>,
    /// Records waiting for INSERT, in persist order.
    pending_new: Vec<RecordHandle>,
    /// Records waiting for DELETE.
    pending_remove: Vec<RecordHandle>,
    next_handle: u64,
    closed: bool,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("dialect", &self.dialect.name())
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a session over `connection`.
    pub fn new(connection: C, dialect: Arc<dyn SqlDialect>, metamodel: Arc<Metamodel>) -> Self {
        let id = SessionId::next();
        tracing::info!(session = id.get(), dialect = dialect.name(), "Opening session");
        Self {
            id,
            connection,
            dialect,
            metamodel,
            config: SessionConfig::default(),
            default_schema: None,
            transaction: None,
            tracked: BTreeMap::new(),
            identity_map: HashMap::new(),
            pending_new: Vec::new(),
            pending_remove: Vec::new(),
            next_handle: 1,
            closed: false,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Schema for key generators that do not name one.
    pub fn with_default_schema(mut self, schema: Option<String>) -> Self {
        self.default_schema = schema;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Id of the open transaction.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(Transaction::id)
    }

    fn context(&self) -> DmlContext<'_> {
        DmlContext {
            connection: &self.connection,
            dialect: self.dialect.as_ref(),
            default_schema: self.default_schema.as_deref(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::state(format!("Session {} is closed", self.id.get())))
        } else {
            Ok(())
        }
    }

    fn allocate_handle(&mut self) -> RecordHandle {
        let handle = RecordHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn entry(&self, handle: RecordHandle) -> Result<&Tracked> {
        self.tracked
            .get(&handle)
            .ok_or_else(|| Error::state(format!("Record {handle} is not known to this session")))
    }

    fn entry_mut(&mut self, handle: RecordHandle) -> Result<&mut Tracked> {
        self.tracked
            .get_mut(&handle)
            .ok_or_else(|| Error::state(format!("Record {handle} is not known to this session")))
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Make `record` managed. It is INSERTed on the next flush.
    ///
    /// Records attached to owning singular associations are persisted first, and
    /// collection elements and inverse singular targets after, when the association
    /// cascades persist. Handles in references must already be managed.
    #[tracing::instrument(level = "debug", skip(self, record), fields(entity = %record.entity()))]
    pub fn persist(&mut self, record: EntityRecord) -> Result<RecordHandle> {
        self.ensure_open()?;
        self.check_persistable(&record, &mut HashSet::new())?;
        let first = self.next_handle;
        let handle = match self.persist_record(record) {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_since(first);
                return Err(e);
            }
        };
        tracing::info!(
            handle = %handle,
            pending_new = self.pending_new.len(),
            "Persisted record"
        );
        Ok(handle)
    }

    /// Check `record` and everything it cascades to without changing any state.
    ///
    /// `keys` collects the identities seen so far in this persist.
    fn check_persistable(
        &self,
        record: &EntityRecord,
        keys: &mut HashSet<IdentityKey>,
    ) -> Result<()> {
        let entity = self.metamodel.entity(record.entity())?;
        if let Some(ids) = entity.id_values(record) {
            let key = identity_key(entity.name(), &ids);
            if let Some(existing) = self.identity_map.get(&key) {
                return Err(Error::state(format!(
                    "{} [{}] is already managed as {existing}",
                    entity.name(),
                    join_values(&ids)
                )));
            }
            if !keys.insert(key) {
                return Err(Error::state(format!(
                    "{} [{}] appears more than once in one persist",
                    entity.name(),
                    join_values(&ids)
                )));
            }
        }
        for (name, reference) in record.references() {
            let attr = association(entity, name, false)?;
            self.check_reference(entity, attr, reference, keys)?;
        }
        for (name, elements) in record.collections() {
            let attr = association(entity, name, true)?;
            for element in elements {
                self.check_reference(entity, attr, element, keys)?;
            }
        }
        Ok(())
    }

    fn check_reference(
        &self,
        owner: &EntityType,
        attr: &Attribute,
        reference: &Reference,
        keys: &mut HashSet<IdentityKey>,
    ) -> Result<()> {
        match reference {
            Reference::Managed(handle) => {
                let entry = self.entry(*handle)?;
                entry.instance.ensure_managed()?;
                check_target(owner, attr, entry.instance.entity())
            }
            Reference::New(record) => {
                if !attr.cascades_persist() {
                    return Err(Error::state(format!(
                        "{}.{} refers to an unmanaged {}; persist it first or enable cascade persist",
                        owner.name(),
                        attr.name(),
                        record.entity()
                    )));
                }
                check_target(owner, attr, self.metamodel.entity(record.entity())?)?;
                self.check_persistable(record, keys)
            }
        }
    }

    /// Forget every record persisted from handle `first` on, and links to them.
    fn discard_since(&mut self, first: u64) {
        let discarded = self.tracked.split_off(&RecordHandle::new(first));
        self.pending_new.retain(|h| h.get() < first);
        for entry in self.tracked.values_mut() {
            entry.links.retain(|_, target| target.get() < first);
            for handle in discarded.keys() {
                entry.instance.forget(*handle);
            }
        }
        tracing::debug!(discarded = discarded.len(), "Discarded partially persisted records");
    }

    fn persist_record(&mut self, mut record: EntityRecord) -> Result<RecordHandle> {
        let entity = Arc::clone(self.metamodel.entity(record.entity())?);

        let references = record.take_references();
        let collections = record.take_collections();
        let (owning, inverse): (Vec<_>, Vec<_>) = references.into_iter().partition(|(name, _)| {
            entity
                .attribute(name)
                .is_some_and(|a| !a.is_plural() && a.mapped_by().is_none())
        });

        let mut links = BTreeMap::new();
        for (name, reference) in owning {
            let attr = association(&entity, &name, false)?;
            links.insert(name, self.resolve_reference(&entity, attr, reference)?);
        }

        let handle = self.allocate_handle();
        let instance = entity.managed_instance(handle, self.id, ManagedId::Pending(handle.get()));
        let owned: Vec<(String, RecordHandle)> =
            links.iter().map(|(a, t)| (a.clone(), *t)).collect();
        self.tracked.insert(
            handle,
            Tracked {
                instance,
                record,
                links,
                snapshot: None,
            },
        );
        self.pending_new.push(handle);
        for (attribute, target) in owned {
            self.add_to_inverse_collections(handle, &attribute, target);
        }

        for (name, reference) in inverse {
            let attr = association(&entity, &name, false)?;
            let target = self.resolve_reference(&entity, attr, reference)?;
            self.link_inverse(handle, attr, target)?;
        }
        for (name, elements) in collections {
            let attr = association(&entity, &name, true)?;
            for element in elements {
                let child = self.resolve_reference(&entity, attr, element)?;
                self.link_inverse(handle, attr, child)?;
            }
        }
        Ok(handle)
    }

    /// Turn a checked reference into a managed handle, cascading persist for new
    /// records.
    fn resolve_reference(
        &mut self,
        owner: &EntityType,
        attr: &Attribute,
        reference: Reference,
    ) -> Result<RecordHandle> {
        match reference {
            Reference::Managed(handle) => {
                let entry = self.entry(handle)?;
                entry.instance.ensure_managed()?;
                check_target(owner, attr, entry.instance.entity())?;
                Ok(handle)
            }
            Reference::New(record) => {
                check_target(owner, attr, self.metamodel.entity(record.entity())?)?;
                self.persist_record(*record)
            }
        }
    }

    /// Record `child` on the owner side of an inverse association.
    fn link_inverse(
        &mut self,
        owner: RecordHandle,
        attr: &Attribute,
        child: RecordHandle,
    ) -> Result<()> {
        if let Some(mapped_by) = attr.mapped_by() {
            self.entry_mut(child)?
                .links
                .insert(mapped_by.to_string(), owner);
        }
        let entry = self.entry_mut(owner)?;
        if let Some(collection) = entry.instance.collection_mut(attr.name()) {
            collection.push(child);
        } else {
            entry.links.insert(attr.name().to_string(), child);
        }
        Ok(())
    }

    /// Add `child` to the target collections that are mapped by `attribute`.
    fn add_to_inverse_collections(
        &mut self,
        child: RecordHandle,
        attribute: &str,
        target: RecordHandle,
    ) {
        let Some(entry) = self.tracked.get_mut(&target) else {
            return;
        };
        let entity = Arc::clone(entry.instance.entity());
        for attr in entity
            .associations()
            .iter()
            .filter(|a| a.is_plural() && a.mapped_by() == Some(attribute))
        {
            if let Some(collection) = entry.instance.collection_mut(attr.name()) {
                collection.push(child);
            }
        }
    }

    /// The record behind `handle`, whatever its status.
    pub fn get(&self, handle: RecordHandle) -> Option<&EntityRecord> {
        self.tracked.get(&handle).map(|t| &t.record)
    }

    /// Mutable access to a MANAGED record. Changes are written on the next flush.
    pub fn record_mut(&mut self, handle: RecordHandle) -> Result<&mut EntityRecord> {
        let entry = self.entry_mut(handle)?;
        entry.instance.ensure_managed()?;
        Ok(&mut entry.record)
    }

    pub fn instance(&self, handle: RecordHandle) -> Option<&ManagedInstance> {
        self.tracked.get(&handle).map(|t| &t.instance)
    }

    /// Target of a singular association, if linked in this session.
    pub fn link(&self, handle: RecordHandle, attribute: &str) -> Option<RecordHandle> {
        self.tracked
            .get(&handle)
            .and_then(|t| t.links.get(attribute).copied())
    }

    /// Point a singular association at another managed record, or clear it.
    pub fn set_link(
        &mut self,
        handle: RecordHandle,
        attribute: &str,
        target: Option<RecordHandle>,
    ) -> Result<()> {
        self.ensure_open()?;
        let entity = Arc::clone(self.entry(handle)?.instance.entity());
        let attr = association(&entity, attribute, false)?;
        if let Some(target) = target {
            let actual = self.entry(target)?.instance.entity();
            if !is_kind_of(actual, attr.target().unwrap_or_default()) {
                return Err(Error::state(format!(
                    "{}.{attribute} cannot refer to {}",
                    entity.name(),
                    actual.name()
                )));
            }
        }
        let entry = self.entry_mut(handle)?;
        entry.instance.ensure_managed()?;
        match target {
            Some(target) => {
                entry.links.insert(attribute.to_string(), target);
            }
            None => {
                entry.links.remove(attribute);
                if attr.column().is_some() {
                    entry.record.set(attribute, Value::Null);
                }
            }
        }
        Ok(())
    }

    pub fn status(&self, handle: RecordHandle) -> Option<Status> {
        self.tracked.get(&handle).map(|t| t.instance.status())
    }

    /// Status of a raw record judged by its identity.
    ///
    /// No identity: NEW. Identity managed here: that instance's status. Otherwise
    /// DETACHED.
    pub fn status_of(&self, record: &EntityRecord) -> Result<Status> {
        let entity = self.metamodel.entity(record.entity())?;
        let Some(ids) = entity.id_values(record) else {
            return Ok(Status::New);
        };
        let key = identity_key(entity.name(), &ids);
        if let Some(handle) = self.identity_map.get(&key) {
            return Ok(self.status(*handle).unwrap_or(Status::Detached));
        }
        let removed = self.pending_remove.iter().any(|h| {
            self.tracked
                .get(h)
                .and_then(|t| instance_key(&t.instance))
                .is_some_and(|k| k == key)
        });
        Ok(if removed {
            Status::Removed
        } else {
            Status::Detached
        })
    }

    /// Whether `handle` is MANAGED by this session.
    pub fn contains(&self, handle: RecordHandle) -> bool {
        self.status(handle) == Some(Status::Managed)
    }

    /// Load a record by identity, consulting the identity map first.
    ///
    /// A pessimistic `lock` always reaches the database (opening a transaction if
    /// needed) so the row lock is taken, but returns the managed handle if there is one.
    /// A managed record whose row is gone is detached and `None` returned.
    #[tracing::instrument(level = "debug", skip(self, ids))]
    pub fn find(
        &mut self,
        entity: &str,
        ids: Vec<Value>,
        lock: LockMode,
    ) -> Result<Option<RecordHandle>> {
        self.ensure_open()?;
        let entity_type = Arc::clone(self.metamodel.entity(entity)?);
        if ids.len() != entity_type.id_attributes().len() {
            return Err(Error::state(format!(
                "{entity} has {} id attribute(s), got {} value(s)",
                entity_type.id_attributes().len(),
                ids.len()
            )));
        }
        let key = identity_key(entity_type.name(), &ids);
        let cached = self.identity_map.get(&key).copied();
        if let Some(handle) = cached {
            if !lock.is_pessimistic() {
                tracing::trace!(handle = %handle, "Identity map hit");
                return Ok(Some(handle));
            }
        }
        if lock.is_pessimistic() {
            self.active_transaction()?;
        }

        let loaded = entity_type.perform_select(&self.context(), &ids, lock)?;
        if let Some(handle) = cached {
            if loaded.is_none() {
                tracing::debug!(handle = %handle, "Locked row no longer exists");
                self.detach(handle)?;
                return Ok(None);
            }
            return Ok(Some(handle));
        }
        let Some(record) = loaded else {
            tracing::debug!("Not found");
            return Ok(None);
        };

        let handle = self.allocate_handle();
        let instance =
            entity_type.managed_instance(handle, self.id, ManagedId::Assigned(ids));
        let snapshot = record.snapshot();
        self.tracked.insert(
            handle,
            Tracked {
                instance,
                record,
                links: BTreeMap::new(),
                snapshot,
            },
        );
        self.identity_map.insert(key, handle);
        tracing::debug!(handle = %handle, "Loaded record");
        Ok(Some(handle))
    }

    /// Identities of `entity` rows ordered by key, skipping `first_result` and
    /// returning at most `max_results`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn find_page(
        &self,
        entity: &str,
        first_result: u64,
        max_results: u64,
    ) -> Result<Vec<Vec<Value>>> {
        self.ensure_open()?;
        let entity_type = self.metamodel.entity(entity)?;
        entity_type.select_page(&self.context(), first_result, max_results)
    }

    /// Fill the collections of `handle` from the database and mark it loaded.
    ///
    /// Only associations with `mapped_by` can be loaded; the elements are found
    /// through the owning join column on the target side.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn load_collections(&mut self, handle: RecordHandle) -> Result<()> {
        self.ensure_open()?;
        let entry = self.entry(handle)?;
        entry.instance.ensure_managed()?;
        let entity = Arc::clone(entry.instance.entity());
        let owner_id = entry.instance.identity().values().map(<[Value]>::to_vec);
        let Some([owner_key]) = owner_id.as_deref() else {
            return Err(Error::state(format!(
                "{} {} needs a single assigned key to load collections",
                entity.name(),
                entry.instance.identity()
            )));
        };

        for attr in entity.associations().iter().filter(|a| a.is_plural()) {
            let Some(mapped_by) = attr.mapped_by() else {
                tracing::debug!(attribute = attr.name(), "No owning join column to load from");
                continue;
            };
            let target = Arc::clone(self.metamodel.entity(attr.target().unwrap_or_default())?);
            let rows = target.select_ids_by(&self.context(), mapped_by, owner_key)?;
            for ids in rows {
                let Some(child) = self.find(target.name(), ids, LockMode::None)? else {
                    continue;
                };
                let owner = self.entry_mut(handle)?;
                if let Some(collection) = owner.instance.collection_mut(attr.name()) {
                    collection.push(child);
                }
            }
        }
        self.entry_mut(handle)?.instance.set_loaded();
        Ok(())
    }

    /// Mark a managed record for deletion.
    ///
    /// A record still waiting for its INSERT is simply dropped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn remove(&mut self, handle: RecordHandle) -> Result<()> {
        self.ensure_open()?;
        let entry = self.entry_mut(handle)?;
        entry.instance.mark_removed()?;
        let key = instance_key(&entry.instance);

        if let Some(position) = self.pending_new.iter().position(|h| *h == handle) {
            self.pending_new.remove(position);
            self.tracked.remove(&handle);
        } else {
            if let Some(key) = key {
                self.identity_map.remove(&key);
            }
            self.pending_remove.push(handle);
        }
        for entry in self.tracked.values_mut() {
            entry.instance.forget(handle);
        }

        tracing::info!(pending_remove = self.pending_remove.len(), "Marked record for removal");
        Ok(())
    }

    /// Stop managing a record. Pending changes to it are discarded.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detach(&mut self, handle: RecordHandle) -> Result<()> {
        self.ensure_open()?;
        let entry = self.entry_mut(handle)?;
        entry.instance.detach()?;
        if let Some(key) = instance_key(&entry.instance) {
            self.identity_map.remove(&key);
        }
        self.pending_new.retain(|h| *h != handle);
        Ok(())
    }

    fn detach_all(&mut self) -> Result<()> {
        for entry in self.tracked.values_mut() {
            if entry.instance.status() == Status::Managed {
                entry.instance.detach()?;
            }
        }
        self.identity_map.clear();
        self.pending_new.clear();
        self.pending_remove.clear();
        Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    fn active_transaction(&mut self) -> Result<TransactionId> {
        if let Some(transaction) = &self.transaction {
            return Ok(transaction.id());
        }
        if !self.config.auto_begin {
            return Err(Error::state(
                "No transaction is open and auto_begin is disabled",
            ));
        }
        self.begin()
    }

    /// Write pending changes: removes, then inserts in persist order, then updates.
    ///
    /// This executes DML but does NOT commit. On failure the unprocessed records
    /// stay pending.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id.get()))]
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let start = Instant::now();

        tracing::info!(
            inserts = self.pending_new.len(),
            removes = self.pending_remove.len(),
            "Starting flush"
        );

        for entry in self.tracked.values_mut() {
            entry.instance.set_executed(false);
        }
        let transaction = self.active_transaction()?;
        let ctx = DmlContext {
            connection: &self.connection,
            dialect: self.dialect.as_ref(),
            default_schema: self.default_schema.as_deref(),
        };

        // 1. Execute DELETEs first.
        let removes = std::mem::take(&mut self.pending_remove);
        for (position, handle) in removes.iter().enumerate() {
            if let Some(entry) = self.tracked.get_mut(handle) {
                if let Err(e) = entry.instance.remove(&ctx, transaction) {
                    self.pending_remove = removes[position..].to_vec();
                    return Err(e);
                }
            }
            self.tracked.remove(handle);
        }

        // 2. Execute INSERTs; referenced records were queued before their referrers.
        let inserts = std::mem::take(&mut self.pending_new);
        for (position, handle) in inserts.iter().enumerate() {
            if let Err(e) = insert_tracked(
                &ctx,
                transaction,
                &mut self.tracked,
                &mut self.identity_map,
                *handle,
            ) {
                self.pending_new = inserts[position..].to_vec();
                return Err(e);
            }
        }

        // 3. Execute UPDATEs for records changed since their snapshot.
        let candidates: Vec<RecordHandle> = self
            .tracked
            .iter()
            .filter(|(_, t)| {
                t.instance.status() == Status::Managed
                    && !t.instance.is_executed()
                    && t.instance.identity().is_assigned()
            })
            .map(|(h, _)| *h)
            .collect();
        let mut updates = 0_usize;
        for handle in candidates {
            if update_tracked(&ctx, transaction, &mut self.tracked, handle)? {
                updates += 1;
            }
        }

        tracing::info!(
            inserts = inserts.len(),
            removes = removes.len(),
            updates,
            elapsed_ms = start.elapsed().as_millis(),
            "Flush completed"
        );
        Ok(())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction, or return the one already open.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin(&mut self) -> Result<TransactionId> {
        self.ensure_open()?;
        if let Some(transaction) = &self.transaction {
            return Ok(transaction.id());
        }
        let transaction = Transaction::begin(&self.connection)?;
        let id = transaction.id();
        self.transaction = Some(transaction);
        Ok(id)
    }

    /// Flush (if configured) and commit the open transaction.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.config.flush_on_commit {
            self.flush()?;
        }
        if let Some(transaction) = self.transaction.take() {
            transaction.commit(&self.connection)?;
        }
        if self.config.expire_on_commit {
            for entry in self.tracked.values_mut() {
                entry.snapshot = None;
            }
        }
        Ok(())
    }

    /// Roll back the open transaction and detach every managed record.
    ///
    /// Database state and in-memory state cannot be reconciled after a rollback, so
    /// nothing stays managed; records must be found again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = match self.transaction.take() {
            Some(transaction) => transaction.rollback(&self.connection),
            None => Ok(()),
        };
        self.detach_all()?;
        result
    }

    /// Roll back anything open and detach everything. Idempotent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = match self.transaction.take() {
            Some(transaction) => transaction.rollback(&self.connection),
            None => Ok(()),
        };
        self.detach_all()?;
        self.closed = true;
        tracing::info!(session = self.id.get(), "Session closed");
        result
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    pub fn pending_new_count(&self) -> usize {
        self.pending_new.len()
    }

    pub fn pending_remove_count(&self) -> usize {
        self.pending_remove.len()
    }

    /// Records of any status still held by the session.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.tracked_count(),
            managed: self.identity_map.len(),
            pending_new: self.pending_new_count(),
            pending_remove: self.pending_remove_count(),
            in_transaction: self.in_transaction(),
            closed: self.closed,
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Records of any status.
    pub tracked: usize,
    /// MANAGED records with an identity.
    pub managed: usize,
    pub pending_new: usize,
    pub pending_remove: usize,
    pub in_transaction: bool,
    pub closed: bool,
}

fn association<'a>(entity: &'a EntityType, name: &str, plural: bool) -> Result<&'a Attribute> {
    entity
        .attribute(name)
        .filter(|a| a.is_association() && a.is_plural() == plural)
        .ok_or_else(|| {
            Error::state(format!(
                "{} has no {} association {name}",
                entity.name(),
                if plural { "plural" } else { "singular" }
            ))
        })
}

/// Whether `entity` is `name` or one of its subtypes.
fn is_kind_of(entity: &EntityType, name: &str) -> bool {
    entity.name() == name
        || matches!(entity.parent(), ParentType::Entity(parent) if is_kind_of(parent, name))
}

fn check_target(owner: &EntityType, attr: &Attribute, actual: &EntityType) -> Result<()> {
    let target = attr.target().unwrap_or_default();
    if is_kind_of(actual, target) {
        Ok(())
    } else {
        Err(Error::state(format!(
            "{}.{} expects {target}, got {}",
            owner.name(),
            attr.name(),
            actual.name()
        )))
    }
}

/// Identity map key; `Int(41)` and `BigInt(41)` name the same row.
fn identity_key(entity: &str, ids: &[Value]) -> IdentityKey {
    let ids = ids
        .iter()
        .map(|v| v.as_i64().map_or_else(|| v.clone(), Value::BigInt))
        .collect();
    (entity.to_string(), ids)
}

fn instance_key(instance: &ManagedInstance) -> Option<IdentityKey> {
    instance
        .identity()
        .values()
        .map(|ids| identity_key(instance.entity().name(), ids))
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Copy the keys of linked records into the join column attributes of `handle`.
fn resolve_links(tracked: &mut BTreeMap<RecordHandle, Tracked>, handle: RecordHandle) -> Result<()> {
    let Some(entry) = tracked.get(&handle) else {
        return Ok(());
    };
    let entity = entry.instance.entity();
    let mut resolved = Vec::with_capacity(entry.links.len());
    for (attribute, target) in &entry.links {
        if entity.attribute(attribute).and_then(Attribute::column).is_none() {
            continue;
        }
        let value = match tracked.get(target) {
            Some(t) if t.instance.status() != Status::Removed => {
                match t.instance.identity().values() {
                    Some([value]) => value.clone(),
                    Some(_) => {
                        return Err(Error::state(format!(
                            "{}.{attribute} cannot refer to {} which has a composite key",
                            entity.name(),
                            t.instance.entity().name()
                        )));
                    }
                    None => {
                        return Err(Error::state(format!(
                            "{}.{attribute} refers to {} {} which has not been inserted; \
                             persist it before the records that reference it",
                            entity.name(),
                            t.instance.entity().name(),
                            t.instance.identity()
                        )));
                    }
                }
            }
            _ => Value::Null,
        };
        resolved.push((attribute.clone(), value));
    }
    if let Some(entry) = tracked.get_mut(&handle) {
        for (attribute, value) in resolved {
            entry.record.set(attribute, value);
        }
    }
    Ok(())
}

fn insert_tracked(
    ctx: &DmlContext<'_>,
    transaction: TransactionId,
    tracked: &mut BTreeMap<RecordHandle, Tracked>,
    identity_map: &mut HashMap<IdentityKey, RecordHandle>,
    handle: RecordHandle,
) -> Result<()> {
    resolve_links(tracked, handle)?;
    let Some(entry) = tracked.get_mut(&handle) else {
        return Ok(());
    };
    if entry.instance.status() != Status::Managed {
        return Ok(());
    }
    entry.instance.insert(ctx, transaction, &mut entry.record)?;
    entry.snapshot = entry.record.snapshot();
    if let Some(key) = instance_key(&entry.instance) {
        identity_map.insert(key, handle);
    }
    Ok(())
}

/// UPDATE `handle` if its values changed. Returns whether DML ran.
fn update_tracked(
    ctx: &DmlContext<'_>,
    transaction: TransactionId,
    tracked: &mut BTreeMap<RecordHandle, Tracked>,
    handle: RecordHandle,
) -> Result<bool> {
    resolve_links(tracked, handle)?;
    let Some(entry) = tracked.get_mut(&handle) else {
        return Ok(false);
    };
    let current = entry.record.snapshot();
    if entry.snapshot.is_some() && entry.snapshot == current {
        return Ok(false);
    }
    entry.instance.update(ctx, transaction, &entry.record)?;
    entry.snapshot = current;
    Ok(true)
}

// ============================================================================
// Unit Tests
// ============================================================================
