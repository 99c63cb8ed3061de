//! The entity manager facade.
//!
//! [`EntityManager`] ties together metadata, adapters, the persister cache
//! and the commit machinery. It is cheap to clone; clones share one unit of
//! work.
//!
//! ```ignore
//! let em = EntityManager::builder()
//!     .entity::<Hero>(hero_metadata, Arc::new(MemoryAdapter::new("heroes", ["id"])))
//!     .connection(Arc::new(my_connection))
//!     .build()?;
//!
//! let hero = EntityRef::new(Hero { name: "Spider-Man".into(), ..Hero::default() });
//! em.persist(&hero)?;
//! em.flush()?;
//!
//! let same = em.find::<Hero>(hero.read().id)?;
//! ```

use crate::config::EntityManagerConfig;
use crate::events::{EntityEvent, EntityEventKind, EventDispatcher};
use crate::factory::{AssociationResolver, EntityFactory};
use crate::persister::{
    EntityPersister, EntityPersisterFactory, PersisterObject, PersisterParts, Trackable,
};
use crate::repository::{EntityRepository, Id};
use crate::unit_of_work::UnitOfWork;
use aem_core::{
    AnyEntityRef, ClassMetadata, ClassMetadataProvider, Criteria, DataAdapterProvider,
    EntityDataAdapter, EntityRef, EntityType, Error, LazyObject, MappingErrorKind, OrderBy,
    Result, StaticAdapterProvider, StaticMetadataProvider, TransactionalConnection, TypeError,
};
use std::fmt;
use std::sync::{Arc, Weak};

/// Metadata lookup over the builder's registrations, then an external
/// provider.
struct MetadataSources {
    local: StaticMetadataProvider,
    external: Option<Arc<dyn ClassMetadataProvider>>,
}

impl ClassMetadataProvider for MetadataSources {
    fn metadata_for(&self, entity: &str) -> Option<Arc<ClassMetadata>> {
        self.local
            .metadata_for(entity)
            .or_else(|| self.external.as_ref()?.metadata_for(entity))
    }
}

/// Adapter lookup over the builder's registrations, then an external
/// provider.
struct AdapterSources {
    local: StaticAdapterProvider,
    external: Option<Arc<dyn DataAdapterProvider>>,
}

impl DataAdapterProvider for AdapterSources {
    fn adapter_for(&self, entity: &str) -> Option<Arc<dyn EntityDataAdapter>> {
        self.local
            .adapter_for(entity)
            .or_else(|| self.external.as_ref()?.adapter_for(entity))
    }
}

/// State shared by all clones of an [`EntityManager`].
struct ManagerShared {
    config: EntityManagerConfig,
    metadata: MetadataSources,
    adapters: AdapterSources,
    persister_factory: EntityPersisterFactory,
    connection: Option<Arc<dyn TransactionalConnection>>,
    events: EventDispatcher,
    unit_of_work: UnitOfWork,
    factory: EntityFactory,
}

impl ManagerShared {
    fn metadata_by_name(&self, entity: &str) -> Result<Arc<ClassMetadata>> {
        self.metadata.metadata_for(entity).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                entity,
                format!("No metadata registered for entity \"{entity}\""),
            )
        })
    }

    fn persister_by_name(&self, entity: &str) -> Result<Arc<dyn PersisterObject>> {
        let metadata = self.metadata_by_name(entity)?;
        self.unit_of_work.get_entity_persister(&metadata, || {
            let adapter = self.adapters.adapter_for(entity).ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    entity,
                    format!("No data adapter registered for entity \"{entity}\""),
                )
            })?;
            self.persister_factory.make_persister(PersisterParts {
                metadata: Arc::clone(&metadata),
                adapter,
                factory: self.factory.clone(),
                config: self.config.clone(),
            })
        })
    }
}

impl AssociationResolver for ManagerShared {
    fn metadata_for(&self, entity: &str) -> Result<Arc<ClassMetadata>> {
        self.metadata_by_name(entity)
    }

    fn find_by(
        &self,
        entity: &str,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<AnyEntityRef>> {
        self.persister_by_name(entity)?
            .find_by_erased(criteria, order_by, limit)
    }
}

/// Entry point for loading, tracking and flushing entities.
#[derive(Clone)]
pub struct EntityManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("config", &self.shared.config)
            .field("unit_of_work", &self.shared.unit_of_work)
            .field("transactional", &self.shared.connection.is_some())
            .field("events", &self.shared.events)
            .finish()
    }
}

impl EntityManager {
    pub fn builder() -> EntityManagerBuilder {
        EntityManagerBuilder::new()
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.shared.config
    }

    pub fn connection(&self) -> Option<&Arc<dyn TransactionalConnection>> {
        self.shared.connection.as_ref()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.shared.unit_of_work
    }

    pub fn class_metadata<E: EntityType>(&self) -> Result<Arc<ClassMetadata>> {
        self.shared.metadata_by_name(E::NAME)
    }

    /// The persister of `E`, created on first use.
    pub fn persister<E: EntityType>(&self) -> Result<Arc<EntityPersister<E>>> {
        self.shared
            .persister_by_name(E::NAME)?
            .into_any()
            .downcast::<EntityPersister<E>>()
            .map_err(|_| {
                Error::Type(TypeError {
                    expected: E::NAME,
                    actual: "persister of another entity type".to_string(),
                    column: None,
                    rust_type: Some(std::any::type_name::<E>()),
                })
            })
    }

    pub fn repository<E: EntityType>(&self) -> EntityRepository<E> {
        EntityRepository::new(self.clone())
    }

    /// Load an entity by identifier. Returns `None` if the store has no row.
    #[tracing::instrument(level = "debug", skip(self, id), fields(entity = E::NAME))]
    pub fn find<E: EntityType>(&self, id: impl Into<Id>) -> Result<Option<EntityRef<E>>> {
        let persister = self.persister::<E>()?;
        let identifier = id.into().into_identifier(persister.metadata())?;
        persister.load_by_id(&identifier)
    }

    /// Schedule a new entity for insertion on the next flush.
    pub fn persist<T: Trackable>(&self, entity: &T) -> Result<()> {
        self.persister::<T::Entity>()?.add_insert(entity)
    }

    /// Schedule an entity for deletion on the next flush.
    pub fn remove<T: Trackable>(&self, entity: &T) -> Result<()> {
        self.persister::<T::Entity>()?.add_delete(entity)
    }

    /// Stop tracking an entity. No adapter is called.
    pub fn detach<T: Trackable>(&self, entity: &T) -> Result<()> {
        self.persister::<T::Entity>()?.detach(entity)
    }

    /// Reload an entity's fields from its adapter.
    pub fn refresh<T: Trackable>(&self, entity: &T) -> Result<()> {
        self.persister::<T::Entity>()?.refresh(entity)
    }

    /// Is the entity tracked by this manager?
    pub fn contains<T: Trackable>(&self, entity: &T) -> Result<bool> {
        self.persister::<T::Entity>()?.exists(entity)
    }

    /// Commit all pending inserts, updates and deletes.
    pub fn flush(&self) -> Result<()> {
        let events = self
            .shared
            .config
            .dispatch_entity_events
            .then_some(&self.shared.events);
        self.shared
            .unit_of_work
            .commit(self.shared.connection.as_deref(), events)
    }

    /// Drop every persister and tracked entity.
    pub fn clear(&self) {
        self.shared.unit_of_work.clear();
    }

    /// Force a proxy or collection to load.
    pub fn initialize_object(&self, object: &dyn LazyObject) -> Result<()> {
        object.initialize()
    }

    pub fn is_uninitialized_object(&self, object: &dyn LazyObject) -> bool {
        !object.is_initialized()
    }
}

/// Builder for [`EntityManager`].
pub struct EntityManagerBuilder {
    config: EntityManagerConfig,
    metadata: StaticMetadataProvider,
    adapters: StaticAdapterProvider,
    external_metadata: Option<Arc<dyn ClassMetadataProvider>>,
    external_adapters: Option<Arc<dyn DataAdapterProvider>>,
    persister_factory: EntityPersisterFactory,
    connection: Option<Arc<dyn TransactionalConnection>>,
    events: EventDispatcher,
    errors: Vec<Error>,
}

impl fmt::Debug for EntityManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManagerBuilder")
            .field("config", &self.config)
            .field("metadata", &self.metadata)
            .field("adapters", &self.adapters)
            .field("persister_factory", &self.persister_factory)
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl Default for EntityManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: EntityManagerConfig::default(),
            metadata: StaticMetadataProvider::new(),
            adapters: StaticAdapterProvider::new(),
            external_metadata: None,
            external_adapters: None,
            persister_factory: EntityPersisterFactory::new(),
            connection: None,
            events: EventDispatcher::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: EntityManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bracket every flush in this connection's transaction.
    #[must_use]
    pub fn connection(mut self, connection: Arc<dyn TransactionalConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Fallback source of metadata for types not registered with
    /// [`entity`](Self::entity).
    #[must_use]
    pub fn metadata_provider(mut self, provider: Arc<dyn ClassMetadataProvider>) -> Self {
        self.external_metadata = Some(provider);
        self
    }

    /// Fallback source of adapters for types not registered with
    /// [`entity`](Self::entity).
    #[must_use]
    pub fn adapter_provider(mut self, provider: Arc<dyn DataAdapterProvider>) -> Self {
        self.external_adapters = Some(provider);
        self
    }

    /// Make `E` known to the persister factory. Metadata and adapter come
    /// from the configured providers.
    #[must_use]
    pub fn register<E: EntityType>(mut self) -> Self {
        self.persister_factory.register::<E>();
        self
    }

    /// Register `E` with its metadata and adapter.
    #[must_use]
    pub fn entity<E: EntityType>(
        mut self,
        metadata: ClassMetadata,
        adapter: Arc<dyn EntityDataAdapter>,
    ) -> Self {
        if metadata.name() != E::NAME {
            self.errors.push(Error::mapping(
                MappingErrorKind::UnknownEntity,
                E::NAME,
                format!(
                    "Metadata for \"{}\" registered for entity type \"{}\"",
                    metadata.name(),
                    E::NAME
                ),
            ));
            return self;
        }
        self.persister_factory.register::<E>();
        self.adapters.register(E::NAME, adapter);
        self.metadata.register(metadata);
        self
    }

    /// Add an entity event listener.
    #[must_use]
    pub fn listen<F>(self, kind: EntityEventKind, listener: F) -> Self
    where
        F: Fn(&mut EntityEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.events.listen(kind, listener);
        self
    }

    /// Build the manager. Fails with the first registration error.
    pub fn build(mut self) -> Result<EntityManager> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }
        tracing::debug!(
            entities = self.metadata.len(),
            transactional = self.connection.is_some(),
            "Building entity manager"
        );

        let shared = Arc::new_cyclic(|weak: &Weak<ManagerShared>| {
            let resolver: Weak<dyn AssociationResolver> = weak.clone();
            ManagerShared {
                config: self.config,
                metadata: MetadataSources {
                    local: self.metadata,
                    external: self.external_metadata,
                },
                adapters: AdapterSources {
                    local: self.adapters,
                    external: self.external_adapters,
                },
                persister_factory: self.persister_factory,
                connection: self.connection,
                events: self.events,
                unit_of_work: UnitOfWork::new(),
                factory: EntityFactory::new(resolver),
            }
        });
        Ok(EntityManager { shared })
    }
}
