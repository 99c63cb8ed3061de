//! Adaptive Entity Manager - identity-mapped, change-tracked persistence
//! over pluggable storage adapters.
//!
//! The entity manager provides:
//!
//! - One in-memory instance per stored identity (identity map)
//! - Dirty detection by comparison with load-time row snapshots
//! - Batched commits: inserts, then updates, then deletes, inside an
//!   optional transaction
//! - Lazy proxies, eager loads and lazy collections for associations
//! - Lifecycle hooks and entity event listeners around every write
//!
//! Storage is not built in. Each entity type is served by an
//! [`EntityDataAdapter`]; [`MemoryAdapter`] is the in-memory reference
//! implementation.
//!
//! # Quick Start
//!
//! ```ignore
//! use aem::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default)]
//! struct Hero {
//!     id: Option<i64>,
//!     name: String,
//!     team_id: Option<i64>,
//!     team: Related<Team>,
//! }
//!
//! aem::entity!(Hero, "Hero" { id, name, team_id, team });
//!
//! let metadata = ClassMetadata::builder_for::<Hero>()
//!     .id(FieldMapping::new("id", FieldType::Integer))
//!     .field(FieldMapping::new("name", FieldType::String))
//!     .field(FieldMapping::new("team_id", FieldType::Integer).nullable(true))
//!     .association(AssociationMapping::has_one("team", "Team").join_column("team_id", "id"))
//!     .build()?;
//!
//! let em = EntityManager::builder()
//!     .entity::<Hero>(metadata, Arc::new(MemoryAdapter::new("heroes", ["id"])))
//!     .build()?;
//!
//! // Insert
//! let hero = EntityRef::new(Hero { name: "Spider-Man".into(), ..Hero::default() });
//! em.persist(&hero)?;
//! em.flush()?;
//!
//! // Query
//! let strong = em
//!     .repository::<Hero>()
//!     .find_by(&Criteria::from([("%name", "Man")]), None, None, None)?;
//!
//! // Update
//! hero.write().name = "Iron Man".into();
//! em.flush()?;
//!
//! // Delete
//! em.remove(&hero)?;
//! em.flush()?;
//! ```

pub use aem_core::{
    // Field data
    Criteria,
    Identifier,
    Row,
    Value,
    // Errors
    AdapterError,
    ConnectionError,
    Error,
    HookError,
    MappingError,
    MappingErrorKind,
    Result,
    StateError,
    StateErrorKind,
    TypeError,
    // Entities
    AnyEntityRef,
    Entity,
    EntityHandle,
    EntityRef,
    EntityType,
    FieldValue,
    Property,
    PropertyKind,
    // Metadata
    AssociationKind,
    AssociationMapping,
    ClassMetadata,
    ClassMetadataBuilder,
    ClassMetadataProvider,
    FetchMode,
    FieldMapping,
    FieldType,
    JoinColumn,
    StaticMetadataProvider,
    // Lifecycle
    LifecycleCallbacks,
    LifecycleEvent,
    LifecycleHook,
    // Lazy associations
    EntityProxy,
    ErasedCollection,
    ErasedProxy,
    ErasedRelated,
    LazyObject,
    PersistentCollection,
    Related,
    // Adapters
    AdapterCall,
    CriteriaOperator,
    DataAdapterProvider,
    EntityDataAdapter,
    MemoryAdapter,
    Order,
    OrderBy,
    StaticAdapterProvider,
    TransactionalConnection,
    // Value objects
    Email,
    Money,
    UserId,
    ValueObject,
    // Macros
    entity,
    value_object,
};

pub use aem_session::{
    ChangeTracker, EntityEvent, EntityEventKind, EntityFactory, EntityManager,
    EntityManagerBuilder, EntityManagerConfig, EntityPersister, EntityRepository, EventDispatcher,
    Id, PendingCounts, Trackable, UnitOfWork,
};

/// Everything needed to map entities and work with an entity manager.
pub mod prelude {
    pub use crate::{
        // Mapping
        AssociationMapping,
        ClassMetadata,
        // Data
        Criteria,
        // Manager
        EntityEventKind,
        EntityManager,
        EntityManagerConfig,
        EntityRef,
        EntityRepository,
        EntityType,
        Error,
        FetchMode,
        FieldMapping,
        FieldType,
        Id,
        LifecycleEvent,
        MemoryAdapter,
        OrderBy,
        PersistentCollection,
        Related,
        Result,
        Row,
        Value,
    };
}
