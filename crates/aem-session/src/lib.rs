//! Identity map, persisters and unit of work for the Adaptive Entity Manager.
//!
//! `aem-session` is the **engine layer**. It tracks which entities are new,
//! changed or deleted, resolves duplicate loads to a single in-memory
//! instance, and commits batches of writes through pluggable adapters.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked instance per identifier and entity type.
//! - **Change tracking**: dirty state by comparison with a row snapshot.
//! - **Unit of work**: inserts, then updates, then deletes, inside an
//!   optional transaction that is rolled back on any failure.
//! - **Association resolution**: lazy proxies, eager loads and lazy
//!   collections built from metadata.
//!
//! # Example
//!
//! ```ignore
//! let em = EntityManager::builder()
//!     .entity::<Hero>(hero_metadata, Arc::new(MemoryAdapter::new("heroes", ["id"])))
//!     .build()?;
//!
//! // Load (uses the identity map)
//! let hero = em.find::<Hero>(1)?.expect("hero 1");
//!
//! // Change and write back
//! hero.write().name = "Iron Man".into();
//! em.flush()?;
//!
//! // Mark for deletion
//! em.remove(&hero)?;
//! em.flush()?;
//! ```

pub mod change_tracker;
pub mod config;
pub mod events;
pub mod factory;
pub mod identity_map;
pub mod manager;
pub mod persister;
pub mod repository;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, RowSnapshot};
pub use config::EntityManagerConfig;
pub use events::{EntityEvent, EntityEventKind, EventDispatcher};
pub use factory::{AssociationResolver, EntityFactory};
pub use identity_map::{IdentityIndex, identity_hash};
pub use manager::{EntityManager, EntityManagerBuilder};
pub use persister::{
    EntityPersister, EntityPersisterFactory, PendingCounts, PersisterObject, PersisterParts,
    Trackable,
};
pub use repository::{EntityRepository, Id};
pub use unit_of_work::UnitOfWork;
