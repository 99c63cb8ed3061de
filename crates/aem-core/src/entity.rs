//! Entity field-descriptor interface and shared entity handles.
//!
//! Entities expose their properties by name through [`Entity`], so the
//! factory can move values between rows and objects without reflection.
//! Most types get the implementation from the [`entity!`](crate::entity!)
//! macro:
//!
//! ```ignore
//! #[derive(Debug, Default)]
//! struct Hero {
//!     id: Option<i64>,
//!     name: String,
//!     team: Related<Team>,
//! }
//!
//! aem_core::entity!(Hero, "Hero" { id, name, team });
//! ```
//!
//! Tracked instances are shared through [`EntityRef`], which pairs the
//! entity with a stable [`EntityHandle`]. [`AnyEntityRef`] is the erased
//! form used wherever the concrete type is only known by name.

use crate::error::{Error, MappingError, MappingErrorKind, Result, TypeError};
use crate::proxy::{ErasedCollection, ErasedRelated};
use crate::types::{FieldType, PropertyKind};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Property access for a mapped entity type.
///
/// `field`/`set_field` address properties by their Rust field name, which
/// is also the field name used in [`ClassMetadata`](crate::ClassMetadata).
pub trait Entity: Any + Send + Sync {
    /// Name the entity type is registered under.
    fn entity_name(&self) -> &'static str;

    /// Declared kind of a property, or `None` if the property does not exist.
    fn property_kind(&self, property: &str) -> Option<PropertyKind>;

    /// Read a property.
    fn field(&self, property: &str) -> Result<FieldValue>;

    /// Write a property.
    fn set_field(&mut self, property: &str, value: FieldValue) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Static side of an entity type.
pub trait EntityType: Entity + Sized {
    /// Registered entity name.
    const NAME: &'static str;

    /// A bare instance with every property at its default.
    fn blank() -> Self;
}

/// A property value as seen through [`Entity`].
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Scalar or value-object property.
    Value(Value),
    /// Single-valued association slot.
    Reference(ErasedRelated),
    /// Collection-valued association slot.
    Collection(ErasedCollection),
}

impl FieldValue {
    /// Unwrap a scalar value.
    pub fn into_value(self) -> Result<Value> {
        match self {
            FieldValue::Value(v) => Ok(v),
            FieldValue::Reference(_) => Err(Error::Type(TypeError {
                expected: "value",
                actual: "reference".to_string(),
                column: None,
                rust_type: None,
            })),
            FieldValue::Collection(_) => Err(Error::Type(TypeError {
                expected: "value",
                actual: "collection".to_string(),
                column: None,
                rust_type: None,
            })),
        }
    }

    /// Borrow a scalar value.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

/// Conversion between a concrete property type and [`FieldValue`].
pub trait Property: Sized {
    /// Declared kind reported through [`Entity::property_kind`].
    const KIND: PropertyKind;

    fn to_field(&self) -> FieldValue;

    fn from_field(value: FieldValue) -> Result<Self>;
}

macro_rules! scalar_property {
    ($($ty:ty => $field_type:expr),* $(,)?) => {$(
        impl Property for $ty {
            const KIND: PropertyKind = PropertyKind::Field($field_type);

            #[allow(clippy::clone_on_copy)]
            fn to_field(&self) -> FieldValue {
                FieldValue::Value(Value::from(self.clone()))
            }

            fn from_field(value: FieldValue) -> Result<Self> {
                <$ty>::try_from(value.into_value()?)
            }
        }
    )*};
}

scalar_property!(
    i64 => FieldType::Integer,
    i32 => FieldType::Integer,
    f64 => FieldType::Float,
    bool => FieldType::Boolean,
    String => FieldType::String,
    DateTime<Utc> => FieldType::DateTime,
);

/// Nullable properties map `None` to [`Value::Null`].
impl<T: Property> Property for Option<T> {
    const KIND: PropertyKind = T::KIND;

    fn to_field(&self) -> FieldValue {
        match self {
            Some(v) => v.to_field(),
            None => FieldValue::Value(Value::Null),
        }
    }

    fn from_field(value: FieldValue) -> Result<Self> {
        match value {
            FieldValue::Value(Value::Null) => Ok(None),
            other => T::from_field(other).map(Some),
        }
    }
}

#[doc(hidden)]
pub fn property_kind_of<P: Property>(_: &P) -> PropertyKind {
    P::KIND
}

#[doc(hidden)]
pub fn missing_property(entity: &str, property: &str) -> Error {
    MappingError::new(
        MappingErrorKind::MissingProperty,
        entity,
        format!("Property \"{property}\" does not exist in {entity}"),
    )
    .field(property)
    .into()
}

#[doc(hidden)]
pub fn property_error(err: Error, property: &str) -> Error {
    match err {
        Error::Type(mut e) => {
            if e.column.is_none() {
                e.column = Some(property.to_string());
            }
            Error::Type(e)
        }
        other => other,
    }
}

/// Implement [`Entity`] and [`EntityType`] for a struct whose listed fields
/// all implement [`Property`]. The struct must implement `Default`.
#[macro_export]
macro_rules! entity {
    ($ty:ty, $name:literal { $($field:ident),* $(,)? }) => {
        impl $crate::Entity for $ty {
            fn entity_name(&self) -> &'static str {
                $name
            }

            fn property_kind(&self, property: &str) -> ::std::option::Option<$crate::PropertyKind> {
                match property {
                    $(stringify!($field) => ::std::option::Option::Some(
                        $crate::entity::property_kind_of(&self.$field),
                    ),)*
                    _ => ::std::option::Option::None,
                }
            }

            fn field(&self, property: &str) -> $crate::Result<$crate::FieldValue> {
                match property {
                    $(stringify!($field) => ::std::result::Result::Ok(
                        $crate::Property::to_field(&self.$field),
                    ),)*
                    _ => ::std::result::Result::Err($crate::entity::missing_property($name, property)),
                }
            }

            fn set_field(&mut self, property: &str, value: $crate::FieldValue) -> $crate::Result<()> {
                match property {
                    $(stringify!($field) => {
                        self.$field = $crate::Property::from_field(value)
                            .map_err(|e| $crate::entity::property_error(e, property))?;
                        ::std::result::Result::Ok(())
                    })*
                    _ => ::std::result::Result::Err($crate::entity::missing_property($name, property)),
                }
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }

        impl $crate::EntityType for $ty {
            const NAME: &'static str = $name;

            fn blank() -> Self {
                <Self as ::std::default::Default>::default()
            }
        }
    };
}

/// Stable integer handle of an entity instance.
///
/// Handles are allocated when an [`EntityRef`] is created and shared by all
/// of its clones, so change-sets can key on them instead of on the
/// identifier (which new entities do not have yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityHandle(u64);

impl EntityHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared reference to an entity instance.
pub struct EntityRef<T> {
    handle: EntityHandle,
    inner: Arc<RwLock<T>>,
}

impl<T> EntityRef<T> {
    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    /// Acquire a read guard.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a write guard.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Do both references point at the same instance?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: EntityType> EntityRef<T> {
    /// Wrap a new entity, allocating a fresh handle.
    pub fn new(entity: T) -> Self {
        Self {
            handle: EntityHandle::next(),
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    /// Type-erased view of this reference.
    pub fn erase(&self) -> AnyEntityRef {
        let entity: Arc<RwLock<dyn Entity>> = self.inner.clone();
        let any: Arc<dyn Any + Send + Sync> = self.inner.clone();
        AnyEntityRef {
            handle: self.handle,
            name: T::NAME,
            entity,
            any,
        }
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for EntityRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for EntityRef<T> {}

impl<T: fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("EntityRef");
        s.field("handle", &self.handle);
        match self.inner.try_read() {
            Ok(entity) => s.field("entity", &*entity),
            Err(_) => s.field("entity", &"<locked>"),
        };
        s.finish()
    }
}

/// Type-erased shared reference to an entity instance.
#[derive(Clone)]
pub struct AnyEntityRef {
    handle: EntityHandle,
    name: &'static str,
    entity: Arc<RwLock<dyn Entity>>,
    any: Arc<dyn Any + Send + Sync>,
}

impl AnyEntityRef {
    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    /// Registered name of the referenced entity's type.
    pub fn entity_name(&self) -> &'static str {
        self.name
    }

    pub fn read(&self) -> RwLockReadGuard<'_, dyn Entity> {
        self.entity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, dyn Entity> {
        self.entity.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recover the typed reference.
    pub fn downcast<T: EntityType>(&self) -> Result<EntityRef<T>> {
        match Arc::clone(&self.any).downcast::<RwLock<T>>() {
            Ok(inner) => Ok(EntityRef {
                handle: self.handle,
                inner,
            }),
            Err(_) => Err(Error::Type(TypeError {
                expected: T::NAME,
                actual: self.name.to_string(),
                column: None,
                rust_type: Some(std::any::type_name::<T>()),
            })),
        }
    }
}

impl PartialEq for AnyEntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl fmt::Debug for AnyEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEntityRef")
            .field("entity", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: EntityType> From<&EntityRef<T>> for AnyEntityRef {
    fn from(entity: &EntityRef<T>) -> Self {
        entity.erase()
    }
}
