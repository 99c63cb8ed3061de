//! Lazy association placeholders.
//!
//! - [`EntityProxy`] stands in for a single related entity until first access.
//! - [`PersistentCollection`] holds a collection-valued association and runs
//!   its query on first access.
//! - [`Related`] is the property type of a single-valued association slot.
//!
//! Each placeholder shares its state between clones, and its loader runs
//! exactly once. A failed load is remembered; later accesses report it
//! instead of running the loader again.

use crate::entity::{AnyEntityRef, EntityRef, EntityType, FieldValue, Property};
use crate::error::{Error, Result, StateErrorKind, TypeError};
use crate::row::Criteria;
use crate::types::PropertyKind;
use crate::value::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Loader<T> = Box<dyn FnOnce() -> Result<T> + Send>;

enum CellState<T> {
    Pending(Loader<T>),
    Loading,
    Ready(T),
    Failed(String),
}

/// A value computed once by a deferred loader.
struct LazyCell<T> {
    state: Mutex<CellState<T>>,
}

impl<T: Clone> LazyCell<T> {
    fn pending(loader: Loader<T>) -> Self {
        Self {
            state: Mutex::new(CellState::Pending(loader)),
        }
    }

    fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(CellState::Ready(value)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_initialized(&self) -> bool {
        matches!(&*self.lock(), CellState::Ready(_) | CellState::Failed(_))
    }

    fn peek(&self) -> Option<T> {
        match &*self.lock() {
            CellState::Ready(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Run the loader if it has not run yet and return the cached result.
    ///
    /// The lock is released while the loader runs, so a loader may touch
    /// other placeholders; touching this same placeholder is reported as an
    /// error.
    fn get(&self, target: &str) -> Result<T> {
        let loader = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, CellState::Loading) {
                CellState::Pending(loader) => loader,
                CellState::Ready(v) => {
                    let out = v.clone();
                    *state = CellState::Ready(v);
                    return Ok(out);
                }
                CellState::Failed(message) => {
                    let err = Error::state(
                        StateErrorKind::ProxyFailed,
                        target,
                        format!("lazy load failed earlier: {message}"),
                    );
                    *state = CellState::Failed(message);
                    return Err(err);
                }
                CellState::Loading => {
                    return Err(Error::state(
                        StateErrorKind::ProxyFailed,
                        target,
                        "lazy load re-entered while loading",
                    ));
                }
            }
        };

        tracing::trace!(target_entity = target, "Initializing lazy association");
        let mut guard = LoadGuard {
            cell: self,
            armed: true,
        };
        let result = loader();
        guard.armed = false;
        let mut state = self.lock();
        match result {
            Ok(v) => {
                *state = CellState::Ready(v.clone());
                Ok(v)
            }
            Err(e) => {
                *state = CellState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

/// Marks the cell failed if the loader unwinds.
struct LoadGuard<'a, T> {
    cell: &'a LazyCell<T>,
    armed: bool,
}

impl<T> Drop for LoadGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *self.cell.state.lock().unwrap_or_else(PoisonError::into_inner) =
                CellState::Failed("loader panicked".to_string());
        }
    }
}

fn state_name<T>(cell: &LazyCell<T>) -> &'static str {
    match &*cell.state.lock().unwrap_or_else(PoisonError::into_inner) {
        CellState::Pending(_) => "pending",
        CellState::Loading => "loading",
        CellState::Ready(_) => "loaded",
        CellState::Failed(_) => "failed",
    }
}

// ============================================================================
// Single-valued proxies
// ============================================================================

struct ProxyInner {
    target: String,
    criteria: Criteria,
    cell: LazyCell<Option<AnyEntityRef>>,
}

/// Type-erased [`EntityProxy`].
#[derive(Clone)]
pub struct ErasedProxy {
    inner: Arc<ProxyInner>,
}

impl ErasedProxy {
    /// Create a proxy for `target` that loads with `loader` on first access.
    ///
    /// `criteria` is the field-keyed filter the loader resolves.
    pub fn new<F>(target: impl Into<String>, criteria: Criteria, loader: F) -> Self
    where
        F: FnOnce() -> Result<Option<AnyEntityRef>> + Send + 'static,
    {
        Self {
            inner: Arc::new(ProxyInner {
                target: target.into(),
                criteria,
                cell: LazyCell::pending(Box::new(loader)),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Filter the proxy was built from.
    pub fn criteria(&self) -> &Criteria {
        &self.inner.criteria
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.cell.is_initialized()
    }

    /// Force the load and return the original entity.
    pub fn load(&self) -> Result<Option<AnyEntityRef>> {
        self.inner.cell.get(&self.inner.target)
    }

    /// The loaded entity, without triggering a load.
    pub fn loaded(&self) -> Option<AnyEntityRef> {
        self.inner.cell.peek().flatten()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ErasedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityProxy")
            .field("target", &self.inner.target)
            .field("state", &state_name(&self.inner.cell))
            .field("criteria", &self.inner.criteria)
            .finish()
    }
}

/// Lazy stand-in for a related entity of type `T`.
pub struct EntityProxy<T> {
    erased: ErasedProxy,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityType> EntityProxy<T> {
    /// Create a proxy from a typed loader.
    pub fn new<F>(criteria: Criteria, loader: F) -> Self
    where
        F: FnOnce() -> Result<Option<EntityRef<T>>> + Send + 'static,
    {
        let erased = ErasedProxy::new(T::NAME, criteria, move || {
            loader().map(|found| found.map(|e| e.erase()))
        });
        Self::from_erased(erased)
    }

    pub fn from_erased(erased: ErasedProxy) -> Self {
        Self {
            erased,
            _marker: PhantomData,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.erased.is_initialized()
    }

    /// Force the load. Runs the loader at most once.
    pub fn load(&self) -> Result<Option<EntityRef<T>>> {
        self.erased
            .load()?
            .map(|any| any.downcast::<T>())
            .transpose()
    }

    pub fn criteria(&self) -> &Criteria {
        self.erased.criteria()
    }

    /// The loaded entity, without triggering a load.
    pub fn loaded(&self) -> Option<EntityRef<T>> {
        self.erased.loaded().and_then(|any| any.downcast::<T>().ok())
    }

    pub fn erase(&self) -> ErasedProxy {
        self.erased.clone()
    }
}

impl<T> Clone for EntityProxy<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EntityProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.erased, f)
    }
}

// ============================================================================
// Association slots
// ============================================================================

/// Type-erased [`Related`].
#[derive(Debug, Clone)]
pub enum ErasedRelated {
    Unset,
    Null,
    Entity(AnyEntityRef),
    Proxy(ErasedProxy),
}

impl ErasedRelated {
    /// Does the slot hold an entity or a proxy?
    pub fn is_set(&self) -> bool {
        matches!(self, ErasedRelated::Entity(_) | ErasedRelated::Proxy(_))
    }
}

/// Property type for a single-valued association.
pub enum Related<T> {
    /// Never resolved.
    Unset,
    /// Resolved to no entity.
    Null,
    /// Holds a loaded entity.
    Entity(EntityRef<T>),
    /// Holds a lazy proxy.
    Proxy(EntityProxy<T>),
}

impl<T: EntityType> Related<T> {
    pub fn entity(entity: &EntityRef<T>) -> Self {
        Related::Entity(entity.clone())
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Related::Entity(_) | Related::Proxy(_))
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Related::Proxy(_))
    }

    /// The related entity, loading the proxy if needed.
    pub fn get(&self) -> Result<Option<EntityRef<T>>> {
        match self {
            Related::Unset | Related::Null => Ok(None),
            Related::Entity(e) => Ok(Some(e.clone())),
            Related::Proxy(p) => p.load(),
        }
    }

    pub fn erase(&self) -> ErasedRelated {
        match self {
            Related::Unset => ErasedRelated::Unset,
            Related::Null => ErasedRelated::Null,
            Related::Entity(e) => ErasedRelated::Entity(e.erase()),
            Related::Proxy(p) => ErasedRelated::Proxy(p.erase()),
        }
    }

    pub fn from_erased(erased: ErasedRelated) -> Result<Self> {
        Ok(match erased {
            ErasedRelated::Unset => Related::Unset,
            ErasedRelated::Null => Related::Null,
            ErasedRelated::Entity(any) => Related::Entity(any.downcast()?),
            ErasedRelated::Proxy(p) => Related::Proxy(EntityProxy::from_erased(p)),
        })
    }
}

impl<T> Default for Related<T> {
    fn default() -> Self {
        Related::Unset
    }
}

impl<T> Clone for Related<T> {
    fn clone(&self) -> Self {
        match self {
            Related::Unset => Related::Unset,
            Related::Null => Related::Null,
            Related::Entity(e) => Related::Entity(e.clone()),
            Related::Proxy(p) => Related::Proxy(p.clone()),
        }
    }
}

impl<T> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Related::Unset => f.write_str("Unset"),
            Related::Null => f.write_str("Null"),
            Related::Entity(e) => write!(f, "Entity({})", e.handle()),
            Related::Proxy(p) => fmt::Debug::fmt(p, f),
        }
    }
}

impl<T: EntityType> Property for Related<T> {
    const KIND: PropertyKind = PropertyKind::Reference;

    fn to_field(&self) -> FieldValue {
        FieldValue::Reference(self.erase())
    }

    fn from_field(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Reference(r) => Related::from_erased(r),
            FieldValue::Value(Value::Null) => Ok(Related::Null),
            other => Err(slot_mismatch("reference", &other)),
        }
    }
}

fn slot_mismatch(expected: &'static str, actual: &FieldValue) -> Error {
    let actual = match actual {
        FieldValue::Value(v) => v.type_name(),
        FieldValue::Reference(_) => "reference",
        FieldValue::Collection(_) => "collection",
    };
    Error::Type(TypeError {
        expected,
        actual: actual.to_string(),
        column: None,
        rust_type: None,
    })
}

// ============================================================================
// Collections
// ============================================================================

struct CollectionInner {
    target: String,
    criteria: Criteria,
    cell: LazyCell<Vec<AnyEntityRef>>,
}

/// Type-erased [`PersistentCollection`].
#[derive(Clone)]
pub struct ErasedCollection {
    inner: Arc<CollectionInner>,
}

impl ErasedCollection {
    /// Create a collection that runs `loader` on first access.
    pub fn new<F>(target: impl Into<String>, criteria: Criteria, loader: F) -> Self
    where
        F: FnOnce() -> Result<Vec<AnyEntityRef>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CollectionInner {
                target: target.into(),
                criteria,
                cell: LazyCell::pending(Box::new(loader)),
            }),
        }
    }

    /// Create an already initialized collection.
    pub fn from_entities(target: impl Into<String>, entities: Vec<AnyEntityRef>) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                target: target.into(),
                criteria: Criteria::new(),
                cell: LazyCell::ready(entities),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn criteria(&self) -> &Criteria {
        &self.inner.criteria
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.cell.is_initialized()
    }

    /// Run the collection query if it has not run yet.
    pub fn initialize(&self) -> Result<()> {
        self.entities().map(|_| ())
    }

    pub fn entities(&self) -> Result<Vec<AnyEntityRef>> {
        self.inner.cell.get(&self.inner.target)
    }
}

impl fmt::Debug for ErasedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCollection")
            .field("target", &self.inner.target)
            .field("state", &state_name(&self.inner.cell))
            .field("criteria", &self.inner.criteria)
            .finish()
    }
}

/// Property type for a collection-valued association.
///
/// Counting, indexing or iterating initializes the collection.
pub struct PersistentCollection<T> {
    erased: ErasedCollection,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityType> PersistentCollection<T> {
    /// Create a lazy collection from a typed loader.
    pub fn new<F>(criteria: Criteria, loader: F) -> Self
    where
        F: FnOnce() -> Result<Vec<EntityRef<T>>> + Send + 'static,
    {
        let erased = ErasedCollection::new(T::NAME, criteria, move || {
            loader().map(|items| items.iter().map(EntityRef::erase).collect())
        });
        Self::from_erased(erased)
    }

    /// Create an initialized collection holding `entities`.
    pub fn from_entities(entities: &[EntityRef<T>]) -> Self {
        Self::from_erased(ErasedCollection::from_entities(
            T::NAME,
            entities.iter().map(EntityRef::erase).collect(),
        ))
    }

    pub fn from_erased(erased: ErasedCollection) -> Self {
        Self {
            erased,
            _marker: PhantomData,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.erased.is_initialized()
    }

    pub fn initialize(&self) -> Result<()> {
        self.erased.initialize()
    }

    /// All entities, initializing the collection if needed.
    pub fn entities(&self) -> Result<Vec<EntityRef<T>>> {
        self.erased
            .entities()?
            .iter()
            .map(AnyEntityRef::downcast::<T>)
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.erased.entities()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entity at `index`, initializing the collection if needed.
    pub fn get(&self, index: usize) -> Result<Option<EntityRef<T>>> {
        self.erased
            .entities()?
            .get(index)
            .map(AnyEntityRef::downcast::<T>)
            .transpose()
    }

    pub fn erase(&self) -> ErasedCollection {
        self.erased.clone()
    }
}

impl<T: EntityType> Default for PersistentCollection<T> {
    fn default() -> Self {
        Self::from_erased(ErasedCollection::new(T::NAME, Criteria::new(), || {
            Ok(Vec::new())
        }))
    }
}

impl<T> Clone for PersistentCollection<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for PersistentCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.erased, f)
    }
}

impl<T: EntityType> Property for PersistentCollection<T> {
    const KIND: PropertyKind = PropertyKind::Collection;

    fn to_field(&self) -> FieldValue {
        FieldValue::Collection(self.erase())
    }

    fn from_field(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Collection(c) => Ok(Self::from_erased(c)),
            other => Err(slot_mismatch("collection", &other)),
        }
    }
}

// ============================================================================
// Lazy objects
// ============================================================================

/// Anything that defers a load until first access.
pub trait LazyObject {
    /// Has the deferred load run (successfully or not)?
    fn is_initialized(&self) -> bool;

    /// Run the deferred load if it has not run yet.
    fn initialize(&self) -> Result<()>;
}

impl LazyObject for ErasedProxy {
    fn is_initialized(&self) -> bool {
        ErasedProxy::is_initialized(self)
    }

    fn initialize(&self) -> Result<()> {
        self.load().map(|_| ())
    }
}

impl<T: EntityType> LazyObject for EntityProxy<T> {
    fn is_initialized(&self) -> bool {
        self.erased.is_initialized()
    }

    fn initialize(&self) -> Result<()> {
        self.erased.load().map(|_| ())
    }
}

impl<T: EntityType> LazyObject for Related<T> {
    fn is_initialized(&self) -> bool {
        match self {
            Related::Proxy(p) => p.erased.is_initialized(),
            _ => true,
        }
    }

    fn initialize(&self) -> Result<()> {
        match self {
            Related::Proxy(p) => p.erased.load().map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl LazyObject for ErasedCollection {
    fn is_initialized(&self) -> bool {
        ErasedCollection::is_initialized(self)
    }

    fn initialize(&self) -> Result<()> {
        ErasedCollection::initialize(self)
    }
}

impl<T: EntityType> LazyObject for PersistentCollection<T> {
    fn is_initialized(&self) -> bool {
        self.erased.is_initialized()
    }

    fn initialize(&self) -> Result<()> {
        self.erased.initialize()
    }
}
