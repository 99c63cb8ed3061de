//! Per-entity-type persistence.
//!
//! An [`EntityPersister`] owns the change-sets of one entity type:
//!
//! - *inserts*: new entities waiting for their first write, in persist order
//! - *updates*: loaded or flushed entities, each with an original row snapshot
//! - *deletes*: entities waiting for removal
//!
//! plus the identity index that maps identifiers to the single tracked
//! instance. Entities are keyed by [`EntityHandle`], so a new entity can be
//! tracked before it has an identifier.
//!
//! The persister speaks field names; its [`EntityDataAdapter`] speaks
//! column names. Every identifier, filter and ordering is translated on the
//! way to the adapter, and rows coming back are mapped through the
//! [`EntityFactory`].

use crate::change_tracker::ChangeTracker;
use crate::config::EntityManagerConfig;
use crate::factory::EntityFactory;
use crate::identity_map::{IdentityIndex, identity_hash};
use aem_core::{
    AnyEntityRef, ClassMetadata, Criteria, EntityDataAdapter, EntityHandle, EntityProxy,
    EntityRef, EntityType, Error, Identifier, LifecycleEvent, MappingErrorKind, OrderBy, Related,
    Result, Row, StateErrorKind, Value, split_criteria_key,
};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Something the persister can track: an entity, a proxy or an association
/// slot.
pub trait Trackable {
    type Entity: EntityType;

    /// Is this a lazy proxy? Proxies are never scheduled for insertion.
    fn is_proxy(&self) -> bool {
        false
    }

    /// The underlying entity, loading a proxy if needed.
    fn resolve(&self) -> Result<Option<EntityRef<Self::Entity>>>;
}

impl<E: EntityType> Trackable for EntityRef<E> {
    type Entity = E;

    fn resolve(&self) -> Result<Option<EntityRef<E>>> {
        Ok(Some(self.clone()))
    }
}

impl<E: EntityType> Trackable for EntityProxy<E> {
    type Entity = E;

    fn is_proxy(&self) -> bool {
        true
    }

    fn resolve(&self) -> Result<Option<EntityRef<E>>> {
        self.load()
    }
}

impl<E: EntityType> Trackable for Related<E> {
    type Entity = E;

    fn is_proxy(&self) -> bool {
        Related::is_proxy(self)
    }

    fn resolve(&self) -> Result<Option<EntityRef<E>>> {
        self.get()
    }
}

/// New entities in the order they were persisted.
struct PendingInserts<E> {
    entries: BTreeMap<EntityHandle, (u64, EntityRef<E>)>,
    order: BTreeMap<u64, EntityHandle>,
    next_seq: u64,
}

impl<E> PendingInserts<E> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, handle: EntityHandle, entity: EntityRef<E>) {
        if self.entries.contains_key(&handle) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, handle);
        self.entries.insert(handle, (seq, entity));
    }

    fn remove(&mut self, handle: &EntityHandle) -> Option<EntityRef<E>> {
        let (seq, entity) = self.entries.remove(handle)?;
        self.order.remove(&seq);
        Some(entity)
    }

    fn contains_key(&self, handle: &EntityHandle) -> bool {
        self.entries.contains_key(handle)
    }

    fn get(&self, handle: &EntityHandle) -> Option<&EntityRef<E>> {
        self.entries.get(handle).map(|(_, entity)| entity)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn handles(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.order.values().copied()
    }

    fn values(&self) -> impl Iterator<Item = &EntityRef<E>> + '_ {
        self.order.values().filter_map(move |handle| self.get(handle))
    }
}

struct ChangeSets<E> {
    inserts: PendingInserts<E>,
    updates: BTreeMap<EntityHandle, EntityRef<E>>,
    deletes: BTreeMap<EntityHandle, EntityRef<E>>,
    tracker: ChangeTracker,
    index: IdentityIndex<E>,
}

impl<E> ChangeSets<E> {
    fn new() -> Self {
        Self {
            inserts: PendingInserts::new(),
            updates: BTreeMap::new(),
            deletes: BTreeMap::new(),
            tracker: ChangeTracker::new(),
            index: IdentityIndex::new(),
        }
    }

    fn is_tracked(&self, handle: EntityHandle) -> bool {
        self.inserts.contains_key(&handle)
            || self.updates.contains_key(&handle)
            || self.deletes.contains_key(&handle)
    }

    fn tracked(&self, handle: EntityHandle) -> Option<&EntityRef<E>> {
        self.inserts
            .get(&handle)
            .or_else(|| self.updates.get(&handle))
            .or_else(|| self.deletes.get(&handle))
    }
}

/// When `postLoad` hooks run relative to the snapshot of a loaded entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HydrateOrder {
    /// Snapshot first: changes made by hooks count as dirty.
    SnapshotFirst,
    /// Hooks first: changes made by hooks are part of the baseline.
    HooksFirst,
}

/// Number of entities waiting in each change-set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

impl std::ops::AddAssign for PendingCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.deletes += other.deletes;
    }
}

/// Collaborators a persister is built from.
#[derive(Clone)]
pub struct PersisterParts {
    pub metadata: Arc<ClassMetadata>,
    pub adapter: Arc<dyn EntityDataAdapter>,
    pub factory: EntityFactory,
    pub config: EntityManagerConfig,
}

/// Change-sets and adapter access for entity type `E`.
pub struct EntityPersister<E> {
    metadata: Arc<ClassMetadata>,
    adapter: Arc<dyn EntityDataAdapter>,
    factory: EntityFactory,
    config: EntityManagerConfig,
    state: Mutex<ChangeSets<E>>,
}

impl<E> fmt::Debug for EntityPersister<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EntityPersister")
            .field("entity", &self.metadata.name())
            .field("inserts", &state.inserts.len())
            .field("updates", &state.updates.len())
            .field("deletes", &state.deletes.len())
            .field("indexed", &state.index.len())
            .finish()
    }
}

impl<E: EntityType> EntityPersister<E> {
    pub fn new(parts: PersisterParts) -> Self {
        Self {
            metadata: parts.metadata,
            adapter: parts.adapter,
            factory: parts.factory,
            config: parts.config,
            state: Mutex::new(ChangeSets::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChangeSets<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metadata(&self) -> &Arc<ClassMetadata> {
        &self.metadata
    }

    pub fn adapter(&self) -> &Arc<dyn EntityDataAdapter> {
        &self.adapter
    }

    fn name(&self) -> &str {
        self.metadata.name()
    }

    /// Run the metadata hooks for `event` on `entity`.
    fn fire(&self, event: LifecycleEvent, entity: &EntityRef<E>) -> Result<()> {
        if !self.metadata.has_callbacks(event) {
            return Ok(());
        }
        let mut guard = entity.write();
        self.metadata.callbacks().dispatch(event, &mut *guard)
    }

    /// Identifier of `entity`, keyed by column.
    fn column_identifier(&self, entity: &EntityRef<E>) -> Result<Identifier> {
        let identifier = self.metadata.identifier_values(&*entity.read())?;
        Ok(self.metadata.fields_to_columns(&identifier))
    }

    fn identity_of(&self, entity: &E) -> Result<u64> {
        Ok(identity_hash(&self.metadata.identifier_values(entity)?))
    }

    // ==== Scheduling

    /// Schedule a new entity for insertion.
    ///
    /// Proxies and entities that are already tracked are ignored.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn add_insert(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        if entity.is_proxy() {
            tracing::trace!("Ignoring persist of a proxy");
            return Ok(());
        }
        let Some(entity) = entity.resolve()? else {
            return Ok(());
        };
        let handle = entity.handle();
        if self.lock().is_tracked(handle) {
            tracing::trace!(%handle, "Entity already tracked");
            return Ok(());
        }

        self.fire(LifecycleEvent::PrePersist, &entity)?;
        self.lock().inserts.insert(handle, entity);
        tracing::debug!(%handle, "Scheduled for insert");
        Ok(())
    }

    /// Schedule an entity for deletion and stop tracking its changes.
    ///
    /// An entity still waiting for its first insert is only dropped from the
    /// insert set, since there is no stored row to delete.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn add_delete(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        let Some(entity) = entity.resolve()? else {
            return Ok(());
        };
        self.fire(LifecycleEvent::PreRemove, &entity)?;

        let handle = entity.handle();
        let mut state = self.lock();
        if state.inserts.remove(&handle).is_some() {
            tracing::debug!(%handle, "Cancelled pending insert");
            return Ok(());
        }
        state.updates.remove(&handle);
        state.tracker.clear(handle);
        state.index.remove_entity(handle);
        state.deletes.insert(handle, entity);
        tracing::debug!(%handle, "Scheduled for delete");
        Ok(())
    }

    // ==== Writes

    /// Write a scheduled entity and start tracking it as persistent.
    ///
    /// The adapter returns the identifier it assigned; the full row is then
    /// reloaded and written back into the entity.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn insert(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        if entity.is_proxy() {
            return Ok(());
        }
        let Some(entity) = entity.resolve()? else {
            return Ok(());
        };
        let handle = entity.handle();
        let any = entity.erase();

        let mut row = self.factory.entity_row(&any, &self.metadata)?;
        if self.config.skip_null_identifiers_on_insert {
            for field in self.metadata.identifier() {
                let column = self.metadata.column_of(field);
                if row.get(column).is_some_and(Value::is_null) {
                    row.remove(column);
                }
            }
        }

        let returned = self.adapter.insert(&row)?;
        let identifier = self
            .metadata
            .fields_to_columns(&self.metadata.columns_to_fields(&returned));
        let fresh = self.adapter.load_by_id(&identifier)?.ok_or_else(|| {
            Error::state(
                StateErrorKind::RowNotFound,
                self.name(),
                "Failed to get entity data row",
            )
        })?;

        self.factory.fill_entity(&any, &self.metadata, &fresh, false)?;
        let snapshot = self.factory.entity_row(&any, &self.metadata)?;
        let hash = self.identity_of(&entity.read())?;
        {
            let mut state = self.lock();
            state.inserts.remove(&handle);
            state.updates.insert(handle, entity.clone());
            state.tracker.snapshot(handle, snapshot);
            state.index.insert(hash, entity.clone());
        }
        tracing::debug!(%handle, identity = ?identifier, "Inserted");

        self.fire(LifecycleEvent::PostPersist, &entity)
    }

    /// Compare the current row of a tracked entity against its snapshot.
    pub fn is_dirty(&self, entity: &impl Trackable<Entity = E>) -> Result<bool> {
        let Some(entity) = entity.resolve()? else {
            return Ok(false);
        };
        let row = self.factory.entity_row(&entity.erase(), &self.metadata)?;
        self.check_dirty(&entity, &row)
    }

    fn check_dirty(&self, entity: &EntityRef<E>, row: &Row) -> Result<bool> {
        let handle = entity.handle();
        let state = self.lock();
        if !state.updates.contains_key(&handle) {
            return Err(Error::state(
                StateErrorKind::NotTracked,
                self.name(),
                format!("Unable to update entity {handle}: it is not tracked"),
            ));
        }
        state.tracker.is_dirty(handle, row).ok_or_else(|| {
            Error::state(
                StateErrorKind::MissingSnapshot,
                self.name(),
                format!("Unable to update entity {handle}: no original row"),
            )
        })
    }

    /// Write a tracked entity if it changed since its snapshot.
    ///
    /// Returns whether the adapter was called. The snapshot keeps its
    /// load-time value unless `advance_snapshot_on_update` is set.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn update(&self, entity: &impl Trackable<Entity = E>) -> Result<bool> {
        let Some(entity) = entity.resolve()? else {
            return Ok(false);
        };
        let handle = entity.handle();
        let any = entity.erase();

        let row = self.factory.entity_row(&any, &self.metadata)?;
        let dirty = self.check_dirty(&entity, &row)?;
        tracing::trace!(%handle, dirty, "Dirty check");
        if !dirty {
            return Ok(false);
        }

        let identifier = self.column_identifier(&entity)?;
        self.fire(LifecycleEvent::PreUpdate, &entity)?;
        let row = self.factory.entity_row(&any, &self.metadata)?;
        self.adapter.update(&identifier, &row)?;
        if self.config.advance_snapshot_on_update {
            self.lock().tracker.snapshot(handle, row);
        }
        tracing::debug!(%handle, identity = ?identifier, "Updated");

        self.fire(LifecycleEvent::PostUpdate, &entity)?;
        Ok(true)
    }

    /// Delete a scheduled entity from the store.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn delete(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        let Some(entity) = entity.resolve()? else {
            return Ok(());
        };
        let handle = entity.handle();
        let identifier = self.column_identifier(&entity)?;
        self.adapter.delete(&identifier)?;
        self.lock().deletes.remove(&handle);
        tracing::debug!(%handle, identity = ?identifier, "Deleted");

        self.fire(LifecycleEvent::PostRemove, &entity)
    }

    /// Reload the fields of `entity` from the store.
    ///
    /// Identifier fields keep their value unless `refresh_identifier` is
    /// set.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn refresh(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        let Some(entity) = entity.resolve()? else {
            return Ok(());
        };
        let identifier = self.column_identifier(&entity)?;
        let row = self.adapter.refresh(&identifier)?.ok_or_else(|| {
            Error::state(
                StateErrorKind::RefreshFailed,
                self.name(),
                "Unable to refresh entity",
            )
        })?;
        self.factory.fill_entity(
            &entity.erase(),
            &self.metadata,
            &row,
            !self.config.refresh_identifier,
        )
    }

    // ==== Bookkeeping

    /// Is the entity in any change-set?
    pub fn exists(&self, entity: &impl Trackable<Entity = E>) -> Result<bool> {
        Ok(match entity.resolve()? {
            Some(entity) => self.lock().is_tracked(entity.handle()),
            None => false,
        })
    }

    /// Forget the entity without touching the store.
    pub fn detach(&self, entity: &impl Trackable<Entity = E>) -> Result<()> {
        if let Some(entity) = entity.resolve()? {
            self.detach_by_handle(entity.handle());
        }
        Ok(())
    }

    fn detach_by_handle(&self, handle: EntityHandle) {
        let mut state = self.lock();
        state.inserts.remove(&handle);
        state.updates.remove(&handle);
        state.deletes.remove(&handle);
        state.tracker.clear(handle);
        state.index.remove_entity(handle);
        tracing::trace!(%handle, entity = self.name(), "Detached");
    }

    /// Pending inserts in persist order.
    pub fn inserts(&self) -> Vec<EntityRef<E>> {
        self.lock().inserts.values().cloned().collect()
    }

    pub fn updates(&self) -> Vec<EntityRef<E>> {
        self.lock().updates.values().cloned().collect()
    }

    pub fn deletes(&self) -> Vec<EntityRef<E>> {
        self.lock().deletes.values().cloned().collect()
    }

    /// Original row recorded for a tracked entity.
    pub fn snapshot(&self, entity: &EntityRef<E>) -> Option<Row> {
        self.lock()
            .tracker
            .get_snapshot(entity.handle())
            .map(|s| s.row().clone())
    }

    pub fn counts(&self) -> PendingCounts {
        let state = self.lock();
        PendingCounts {
            inserts: state.inserts.len(),
            updates: state.updates.len(),
            deletes: state.deletes.len(),
        }
    }

    // ==== Loading

    /// Load one entity by its field-keyed identifier.
    ///
    /// An identity that is already tracked resolves to the tracked
    /// instance.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn load_by_id(&self, identifier: &Identifier) -> Result<Option<EntityRef<E>>> {
        let columns = self.metadata.fields_to_columns(identifier);
        let Some(row) = self.adapter.load_by_id(&columns)? else {
            tracing::trace!(identity = ?identifier, "No row");
            return Ok(None);
        };
        self.hydrate(&row, HydrateOrder::SnapshotFirst).map(Some)
    }

    /// Load every entity matching `criteria`.
    ///
    /// Criteria keys may carry an operator prefix such as `>=` or `%`; the
    /// prefix is kept while the field name is mapped to its column.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.name()))]
    pub fn load_all(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<EntityRef<E>>> {
        let columns: Criteria = criteria
            .iter()
            .map(|(key, value)| {
                let (prefix, field) = split_criteria_key(key);
                (
                    format!("{prefix}{}", self.metadata.column_of(field)),
                    value.clone(),
                )
            })
            .collect();
        let order_by = order_by.map(|o| o.map_names(|name| self.metadata.column_of(name).to_string()));

        let rows = self
            .adapter
            .load_all(&columns, order_by.as_ref(), limit, offset)?;
        tracing::trace!(rows = rows.len(), "Loaded rows");
        rows.iter()
            .map(|row| self.hydrate(row, HydrateOrder::HooksFirst))
            .collect()
    }

    /// Turn a column-keyed row into a tracked entity.
    fn hydrate(&self, row: &Row, order: HydrateOrder) -> Result<EntityRef<E>> {
        let bare: E = self.factory.make_entity(&self.metadata, row)?;
        let hash = self.identity_of(&bare)?;

        let entity = {
            let mut state = self.lock();
            if let Some(existing) = state.index.get(hash) {
                tracing::trace!(handle = %existing.handle(), "Identity map hit");
                return Ok(existing.clone());
            }
            let entity = EntityRef::new(bare);
            state.index.insert(hash, entity.clone());
            entity
        };

        // Indexed before the fill so that self-referencing eager loads
        // find this instance.
        self.factory
            .fill_entity(&entity.erase(), &self.metadata, row, true)?;
        match order {
            HydrateOrder::SnapshotFirst => {
                self.track_loaded(&entity)?;
                self.fire(LifecycleEvent::PostLoad, &entity)?;
            }
            HydrateOrder::HooksFirst => {
                self.fire(LifecycleEvent::PostLoad, &entity)?;
                self.track_loaded(&entity)?;
            }
        }
        tracing::trace!(handle = %entity.handle(), "Hydrated");
        Ok(entity)
    }

    fn track_loaded(&self, entity: &EntityRef<E>) -> Result<()> {
        let row = self.factory.entity_row(&entity.erase(), &self.metadata)?;
        let handle = entity.handle();
        let mut state = self.lock();
        state.tracker.snapshot(handle, row);
        state.updates.insert(handle, entity.clone());
        Ok(())
    }

    fn tracked_ref(&self, handle: EntityHandle) -> Result<EntityRef<E>> {
        self.lock().tracked(handle).cloned().ok_or_else(|| {
            Error::state(
                StateErrorKind::NotTracked,
                self.name(),
                format!("entity {handle} is not tracked"),
            )
        })
    }
}

/// Type-erased persister, as stored by the unit of work.
pub trait PersisterObject: Send + Sync {
    fn entity_name(&self) -> &str;

    fn metadata(&self) -> &Arc<ClassMetadata>;

    fn insert_handles(&self) -> Vec<EntityHandle>;

    fn update_handles(&self) -> Vec<EntityHandle>;

    fn delete_handles(&self) -> Vec<EntityHandle>;

    /// A tracked entity by handle.
    fn tracked(&self, handle: EntityHandle) -> Option<AnyEntityRef>;

    fn insert_handle(&self, handle: EntityHandle) -> Result<()>;

    fn update_handle(&self, handle: EntityHandle) -> Result<bool>;

    fn delete_handle(&self, handle: EntityHandle) -> Result<()>;

    fn detach_handle(&self, handle: EntityHandle);

    fn find_by_erased(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<AnyEntityRef>>;

    fn counts(&self) -> PendingCounts;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: EntityType> PersisterObject for EntityPersister<E> {
    fn entity_name(&self) -> &str {
        self.name()
    }

    fn metadata(&self) -> &Arc<ClassMetadata> {
        &self.metadata
    }

    fn insert_handles(&self) -> Vec<EntityHandle> {
        self.lock().inserts.handles().collect()
    }

    fn update_handles(&self) -> Vec<EntityHandle> {
        self.lock().updates.keys().copied().collect()
    }

    fn delete_handles(&self) -> Vec<EntityHandle> {
        self.lock().deletes.keys().copied().collect()
    }

    fn tracked(&self, handle: EntityHandle) -> Option<AnyEntityRef> {
        self.lock().tracked(handle).map(EntityRef::erase)
    }

    fn insert_handle(&self, handle: EntityHandle) -> Result<()> {
        let entity = self.tracked_ref(handle)?;
        self.insert(&entity)
    }

    fn update_handle(&self, handle: EntityHandle) -> Result<bool> {
        let entity = self.tracked_ref(handle)?;
        self.update(&entity)
    }

    fn delete_handle(&self, handle: EntityHandle) -> Result<()> {
        let entity = self.tracked_ref(handle)?;
        self.delete(&entity)
    }

    fn detach_handle(&self, handle: EntityHandle) {
        self.detach_by_handle(handle);
    }

    fn find_by_erased(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<AnyEntityRef>> {
        Ok(self
            .load_all(criteria, order_by, limit, None)?
            .iter()
            .map(EntityRef::erase)
            .collect())
    }

    fn counts(&self) -> PendingCounts {
        EntityPersister::counts(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type PersisterConstructor = fn(PersisterParts) -> Arc<dyn PersisterObject>;

fn construct<E: EntityType>(parts: PersisterParts) -> Arc<dyn PersisterObject> {
    Arc::new(EntityPersister::<E>::new(parts))
}

/// Builds persisters for registered entity types, by name.
#[derive(Clone, Default)]
pub struct EntityPersisterFactory {
    constructors: HashMap<String, PersisterConstructor>,
}

impl fmt::Debug for EntityPersisterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("EntityPersisterFactory")
            .field("entities", &names)
            .finish()
    }
}

impl EntityPersisterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: EntityType>(&mut self) {
        self.constructors.insert(E::NAME.to_string(), construct::<E>);
    }

    pub fn is_registered(&self, entity: &str) -> bool {
        self.constructors.contains_key(entity)
    }

    /// Build the persister for the entity named by `parts.metadata`.
    pub fn make_persister(&self, parts: PersisterParts) -> Result<Arc<dyn PersisterObject>> {
        let name = parts.metadata.name().to_string();
        let constructor = self.constructors.get(&name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                name.clone(),
                format!("No entity type registered as \"{name}\""),
            )
        })?;
        tracing::debug!(entity = %name, "Creating persister");
        Ok(constructor(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::AssociationResolver;
    use aem_core::{AdapterCall, FieldMapping, FieldType, MemoryAdapter};
    use std::sync::Weak;

    #[derive(Debug, Default)]
    struct Item {
        id: Option<i64>,
        label: String,
        stock: i64,
    }

    aem_core::entity!(Item, "Item" { id, label, stock });

    /// Resolver stand-in for entities without associations.
    struct NoAssociations;

    impl AssociationResolver for NoAssociations {
        fn metadata_for(&self, entity: &str) -> Result<Arc<ClassMetadata>> {
            Err(Error::mapping(MappingErrorKind::UnknownEntity, entity, "none"))
        }

        fn find_by(
            &self,
            _entity: &str,
            _criteria: &Criteria,
            _order_by: Option<&OrderBy>,
            _limit: Option<usize>,
        ) -> Result<Vec<AnyEntityRef>> {
            Ok(Vec::new())
        }
    }

    fn persister_with(config: EntityManagerConfig) -> (EntityPersister<Item>, Arc<MemoryAdapter>) {
        let metadata = ClassMetadata::builder("Item")
            .id(FieldMapping::new("id", FieldType::Integer))
            .field(FieldMapping::new("label", FieldType::String).column("item_label"))
            .field(FieldMapping::new("stock", FieldType::Integer))
            .on::<Item, _>(LifecycleEvent::PrePersist, |item| {
                item.label = item.label.trim().to_string();
                Ok(())
            })
            .build()
            .unwrap();
        let adapter = Arc::new(MemoryAdapter::new("items", ["id"]));
        let resolver: Weak<dyn AssociationResolver> = Weak::<NoAssociations>::new();
        let persister = EntityPersister::new(PersisterParts {
            metadata: Arc::new(metadata),
            adapter: adapter.clone(),
            factory: EntityFactory::new(resolver),
            config,
        });
        (persister, adapter)
    }

    fn persister() -> (EntityPersister<Item>, Arc<MemoryAdapter>) {
        persister_with(EntityManagerConfig::default())
    }

    fn seed(adapter: &MemoryAdapter, id: i64, label: &str, stock: i64) {
        adapter.seed(
            Row::new()
                .with("id", id)
                .with("item_label", label)
                .with("stock", stock),
        );
    }

    #[test]
    fn test_add_insert_fires_pre_persist_once() {
        let (persister, _) = persister();
        let item = EntityRef::new(Item {
            label: "  bolt ".into(),
            ..Item::default()
        });
        persister.add_insert(&item).unwrap();
        persister.add_insert(&item).unwrap();
        assert_eq!(persister.counts().inserts, 1);
        assert_eq!(item.read().label, "bolt");
    }

    #[test]
    fn test_pending_inserts_keep_persist_order() {
        let (persister, _) = persister();
        let items: Vec<_> = ["first", "second", "third"]
            .into_iter()
            .map(|label| {
                EntityRef::new(Item {
                    label: label.into(),
                    ..Item::default()
                })
            })
            .collect();
        for index in [2, 0, 1] {
            persister.add_insert(&items[index]).unwrap();
        }
        persister.detach(&items[0]).unwrap();
        persister.add_insert(&items[0]).unwrap();

        let labels: Vec<String> = persister
            .inserts()
            .iter()
            .map(|item| item.read().label.clone())
            .collect();
        assert_eq!(labels, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_delete_of_pending_insert_only_cancels_it() {
        let (persister, adapter) = persister();
        let item = EntityRef::new(Item {
            label: "washer".into(),
            ..Item::default()
        });
        persister.add_insert(&item).unwrap();
        persister.add_delete(&item).unwrap();

        assert_eq!(persister.counts(), PendingCounts::default());
        assert!(persister.inserts().is_empty());
        assert!(adapter.calls().is_empty());
    }

    #[test]
    fn test_insert_moves_entity_to_updates() {
        let (persister, adapter) = persister();
        let item = EntityRef::new(Item {
            label: "nut".into(),
            stock: 4,
            ..Item::default()
        });
        persister.add_insert(&item).unwrap();
        persister.insert(&item).unwrap();

        assert_eq!(item.read().id, Some(1));
        assert_eq!(
            persister.counts(),
            PendingCounts {
                inserts: 0,
                updates: 1,
                deletes: 0
            }
        );
        let snapshot = persister.snapshot(&item).unwrap();
        assert_eq!(snapshot.get("item_label"), Some(&Value::from("nut")));
        assert_eq!(snapshot.get("id"), Some(&Value::Int(1)));

        match &adapter.calls()[0] {
            AdapterCall::Insert(row) => assert!(!row.contains("id")),
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(adapter.call_count("load_by_id"), 1);
    }

    #[test]
    fn test_insert_keeps_null_identifier_when_configured() {
        let config = EntityManagerConfig::new().skip_null_identifiers_on_insert(false);
        let (persister, adapter) = persister_with(config);
        let item = EntityRef::new(Item::default());
        persister.insert(&item).unwrap();
        match &adapter.calls()[0] {
            AdapterCall::Insert(row) => assert_eq!(row.get("id"), Some(&Value::Null)),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_load_by_id_returns_tracked_instance() {
        let (persister, adapter) = persister();
        seed(&adapter, 7, "gear", 2);
        let id = Identifier::from([("id", 7_i64)]);
        let first = persister.load_by_id(&id).unwrap().unwrap();
        let second = persister.load_by_id(&id).unwrap().unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(first.read().label, "gear");
        assert!(persister.load_by_id(&Identifier::from([("id", 99_i64)])).unwrap().is_none());
    }

    #[test]
    fn test_update_only_when_dirty() {
        let (persister, adapter) = persister();
        seed(&adapter, 1, "gear", 2);
        let item = persister
            .load_by_id(&Identifier::from([("id", 1_i64)]))
            .unwrap()
            .unwrap();

        assert!(!persister.update(&item).unwrap());
        item.write().stock = 5;
        assert!(persister.is_dirty(&item).unwrap());
        assert!(persister.update(&item).unwrap());
        assert_eq!(
            adapter.calls().last(),
            Some(&AdapterCall::Update(
                Identifier::from([("id", 1_i64)]),
                Row::new()
                    .with("id", 1)
                    .with("item_label", "gear")
                    .with("stock", 5)
            ))
        );
        // Snapshot stays at the load-time row.
        assert!(persister.is_dirty(&item).unwrap());
    }

    #[test]
    fn test_update_can_advance_snapshot() {
        let config = EntityManagerConfig::new().advance_snapshot_on_update(true);
        let (persister, adapter) = persister_with(config);
        seed(&adapter, 1, "gear", 2);
        let item = persister
            .load_by_id(&Identifier::from([("id", 1_i64)]))
            .unwrap()
            .unwrap();
        item.write().stock = 9;
        assert!(persister.update(&item).unwrap());
        assert!(!persister.is_dirty(&item).unwrap());
    }

    #[test]
    fn test_update_untracked_entity_fails() {
        let (persister, _) = persister();
        let item = EntityRef::new(Item::default());
        let err = persister.update(&item).unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::NotTracked));
        assert!(err.to_string().contains("Unable to update entity"));
    }

    #[test]
    fn test_delete_flow() {
        let (persister, adapter) = persister();
        seed(&adapter, 3, "cog", 1);
        let id = Identifier::from([("id", 3_i64)]);
        let item = persister.load_by_id(&id).unwrap().unwrap();

        persister.add_delete(&item).unwrap();
        assert_eq!(persister.counts().updates, 0);
        assert_eq!(persister.counts().deletes, 1);
        persister.delete(&item).unwrap();
        assert!(!persister.exists(&item).unwrap());
        assert!(adapter.rows().is_empty());
        assert!(persister.load_by_id(&id).unwrap().is_none());
    }

    #[test]
    fn test_detach_makes_no_adapter_calls() {
        let (persister, adapter) = persister();
        seed(&adapter, 1, "gear", 2);
        let item = persister
            .load_by_id(&Identifier::from([("id", 1_i64)]))
            .unwrap()
            .unwrap();
        adapter.clear_calls();

        persister.detach(&item).unwrap();
        assert!(!persister.exists(&item).unwrap());
        assert!(adapter.calls().is_empty());

        // A new load yields a fresh instance.
        let again = persister
            .load_by_id(&Identifier::from([("id", 1_i64)]))
            .unwrap()
            .unwrap();
        assert!(!again.ptr_eq(&item));
    }

    #[test]
    fn test_refresh_overwrites_fields() {
        let (persister, adapter) = persister();
        seed(&adapter, 1, "gear", 2);
        let item = persister
            .load_by_id(&Identifier::from([("id", 1_i64)]))
            .unwrap()
            .unwrap();
        item.write().label = "local".into();
        persister.refresh(&item).unwrap();
        assert_eq!(item.read().label, "gear");

        let missing = EntityRef::new(Item {
            id: Some(42),
            ..Item::default()
        });
        let err = persister.refresh(&missing).unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::RefreshFailed));
    }

    #[test]
    fn test_load_all_maps_criteria_and_order() {
        let (persister, adapter) = persister();
        seed(&adapter, 1, "gear", 2);
        seed(&adapter, 2, "bolt", 8);
        seed(&adapter, 3, "nut", 5);

        let found = persister
            .load_all(
                &Criteria::from([(">=stock", 3_i64)]),
                Some(&OrderBy::new().asc("label")),
                None,
                None,
            )
            .unwrap();
        let labels: Vec<String> = found.iter().map(|i| i.read().label.clone()).collect();
        assert_eq!(labels, vec!["bolt".to_string(), "nut".to_string()]);

        match adapter.calls().last() {
            Some(AdapterCall::LoadAll { criteria, order_by, .. }) => {
                assert!(criteria.contains(">=stock"));
                assert_eq!(
                    order_by.as_ref().map(|o| o.iter().next().map(|(n, _)| n.to_string())),
                    Some(Some("item_label".to_string()))
                );
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_persister_factory_requires_registration() {
        let (persister, adapter) = persister();
        let mut factory = EntityPersisterFactory::new();
        let parts = PersisterParts {
            metadata: persister.metadata().clone(),
            adapter,
            factory: EntityFactory::new(Weak::<NoAssociations>::new()),
            config: EntityManagerConfig::default(),
        };
        let err = factory.make_persister(parts.clone()).err().unwrap();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnknownEntity));

        factory.register::<Item>();
        let made = factory.make_persister(parts).unwrap();
        assert_eq!(made.entity_name(), "Item");
        assert!(made.into_any().downcast::<EntityPersister<Item>>().is_ok());
    }
}
