//! Core types and contracts for the Adaptive Entity Manager.
//!
//! This crate provides the leaf abstractions the session engine is built on:
//!
//! - `Value` and `Row` for dynamically typed field data
//! - `Entity` field-descriptor interface and the `entity!` macro
//! - `ClassMetadata` mapping descriptions and metadata providers
//! - `EntityProxy`, `Related` and `PersistentCollection` lazy placeholders
//! - `EntityDataAdapter` and `TransactionalConnection` contracts
//! - `MemoryAdapter`, an in-memory adapter implementation

pub mod adapter;
pub mod connection;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metadata;
pub mod proxy;
pub mod row;
pub mod types;
pub mod validate;
pub mod value;
pub mod value_object;

pub use adapter::{
    CriteriaOperator, DataAdapterProvider, EntityDataAdapter, Order, OrderBy,
    StaticAdapterProvider,
};
pub use connection::TransactionalConnection;
pub use entity::{AnyEntityRef, Entity, EntityHandle, EntityRef, EntityType, FieldValue, Property};
pub use error::{
    AdapterError, ConnectionError, Error, HookError, MappingError, MappingErrorKind, Result,
    StateError, StateErrorKind, TypeError,
};
pub use lifecycle::{LifecycleCallbacks, LifecycleEvent, LifecycleHook};
pub use memory::{AdapterCall, MemoryAdapter};
pub use metadata::{
    AssociationKind, AssociationMapping, ClassMetadata, ClassMetadataBuilder,
    ClassMetadataProvider, FetchMode, FieldMapping, JoinColumn, StaticMetadataProvider,
};
pub use proxy::{
    EntityProxy, ErasedCollection, ErasedProxy, ErasedRelated, LazyObject, PersistentCollection,
    Related,
};
pub use row::{Criteria, Identifier, Row};
pub use types::{FieldType, PropertyKind};
pub use validate::{matches_pattern, split_criteria_key};
pub use value::Value;
pub use value_object::{Email, Money, UserId, ValueObject};
