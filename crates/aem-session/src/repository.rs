//! Typed query entry points for one entity type.

use crate::manager::EntityManager;
use aem_core::{
    ClassMetadata, Criteria, EntityRef, EntityType, Error, Identifier, MappingErrorKind, OrderBy,
    Result, Row, Value,
};
use std::fmt;
use std::marker::PhantomData;

/// Identifier argument of `find`: a scalar for single-field identifiers or
/// a field-keyed row for composite ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Id {
    Single(Value),
    Composite(Identifier),
}

impl Id {
    /// Field-keyed identifier for `metadata`'s entity type.
    pub fn into_identifier(self, metadata: &ClassMetadata) -> Result<Identifier> {
        match self {
            Id::Single(value) => {
                if metadata.is_composite_identifier() {
                    return Err(Error::mapping(
                        MappingErrorKind::InvalidIdentifier,
                        metadata.name(),
                        "Invalid composite identifier",
                    ));
                }
                let field = metadata.identifier().first().ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::MissingIdentifier,
                        metadata.name(),
                        "Entity has no identifier",
                    )
                })?;
                Ok(Identifier::new().with(field.clone(), value))
            }
            Id::Composite(values) => {
                let mut identifier = Identifier::new();
                for field in metadata.identifier() {
                    let value = values.get(field).ok_or_else(|| {
                        Error::mapping(
                            MappingErrorKind::InvalidIdentifier,
                            metadata.name(),
                            format!("Identifier field \"{field}\" is missing"),
                        )
                    })?;
                    identifier.insert(field.clone(), value.clone());
                }
                Ok(identifier)
            }
        }
    }
}

impl From<Value> for Id {
    fn from(value: Value) -> Self {
        Id::Single(value)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Single(Value::Int(value))
    }
}

impl From<i32> for Id {
    fn from(value: i32) -> Self {
        Id::Single(Value::Int(i64::from(value)))
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Single(Value::Text(value.to_string()))
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Single(Value::Text(value))
    }
}

impl From<Row> for Id {
    fn from(values: Row) -> Self {
        Id::Composite(values)
    }
}

/// Repository of entity type `E`, bound to an entity manager.
///
/// ```ignore
/// let heroes = em.repository::<Hero>();
/// let strong = heroes.find_by(&Criteria::from([(">=strength", 90)]), None, None, None)?;
/// ```
pub struct EntityRepository<E> {
    manager: EntityManager,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityRepository<E> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: EntityType> fmt::Debug for EntityRepository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRepository")
            .field("entity", &E::NAME)
            .finish()
    }
}

impl<E: EntityType> EntityRepository<E> {
    pub(crate) fn new(manager: EntityManager) -> Self {
        Self {
            manager,
            _marker: PhantomData,
        }
    }

    pub fn find(&self, id: impl Into<Id>) -> Result<Option<EntityRef<E>>> {
        self.manager.find::<E>(id)
    }

    pub fn find_all(&self) -> Result<Vec<EntityRef<E>>> {
        self.find_by(&Criteria::new(), None, None, None)
    }

    /// Entities matching `criteria`, whose keys are field names with an
    /// optional operator prefix.
    pub fn find_by(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<EntityRef<E>>> {
        self.manager
            .persister::<E>()?
            .load_all(criteria, order_by, limit, offset)
    }

    pub fn find_one_by(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
    ) -> Result<Option<EntityRef<E>>> {
        Ok(self
            .find_by(criteria, order_by, Some(1), None)?
            .into_iter()
            .next())
    }
}
