//! Row to entity mapping.
//!
//! [`EntityFactory`] moves values between adapter rows and entity
//! properties using [`ClassMetadata`], and turns association mappings into
//! related entities, lazy proxies or lazy collections. It never calls an
//! adapter itself: related entities are fetched through an
//! [`AssociationResolver`], normally the entity manager.
//!
//! Entity locks are held only while values are copied. Association
//! resolution runs with the owning entity unlocked, which lets eager loads
//! reach back to entities that are still being filled.

use aem_core::{
    AnyEntityRef, AssociationMapping, ClassMetadata, Criteria, Entity, EntityType, Error,
    ErasedCollection, ErasedProxy, ErasedRelated, FieldMapping, FieldValue, MappingError,
    MappingErrorKind, OrderBy, PropertyKind, Result, Row, StateErrorKind, Value,
};
use std::fmt;
use std::sync::{Arc, Weak};

/// Lookup of related entities during association resolution.
pub trait AssociationResolver: Send + Sync {
    /// Metadata of an entity type, by registered name.
    fn metadata_for(&self, entity: &str) -> Result<Arc<ClassMetadata>>;

    /// Tracked entities of type `entity` matching `criteria`.
    fn find_by(
        &self,
        entity: &str,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<AnyEntityRef>>;

    fn find_one_by(&self, entity: &str, criteria: &Criteria) -> Result<Option<AnyEntityRef>> {
        Ok(self.find_by(entity, criteria, None, Some(1))?.into_iter().next())
    }
}

/// Maps rows to entities and back.
#[derive(Clone)]
pub struct EntityFactory {
    resolver: Weak<dyn AssociationResolver>,
}

impl fmt::Debug for EntityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityFactory")
            .field("resolver_alive", &(self.resolver.strong_count() > 0))
            .finish()
    }
}

fn upgrade(
    resolver: &Weak<dyn AssociationResolver>,
    target: &str,
) -> Result<Arc<dyn AssociationResolver>> {
    resolver.upgrade().ok_or_else(|| {
        Error::state(
            StateErrorKind::ManagerClosed,
            target,
            "entity manager is no longer available",
        )
    })
}

fn invalid_association(metadata: &ClassMetadata, field: &str, message: String) -> Error {
    MappingError::new(MappingErrorKind::InvalidAssociation, metadata.name(), message)
        .field(field)
        .into()
}

fn missing_property(metadata: &ClassMetadata, field: &str) -> Error {
    MappingError::new(
        MappingErrorKind::MissingProperty,
        metadata.name(),
        format!("Property \"{field}\" does not exist in {}", metadata.name()),
    )
    .field(field)
    .into()
}

/// Verify that the entity declares `mapping` with the metadata type.
fn check_field(entity: &dyn Entity, metadata: &ClassMetadata, mapping: &FieldMapping) -> Result<()> {
    match entity.property_kind(&mapping.name) {
        None => Err(missing_property(metadata, &mapping.name)),
        Some(PropertyKind::Field(declared)) if declared == mapping.field_type => Ok(()),
        Some(declared) => Err(MappingError::new(
            MappingErrorKind::TypeMismatch,
            metadata.name(),
            format!(
                "Type of property \"{}\" does not match type of field \"{}\" ({declared:?})",
                mapping.name, mapping.field_type
            ),
        )
        .field(mapping.name.clone())
        .into()),
    }
}

fn check_association(
    entity: &dyn Entity,
    metadata: &ClassMetadata,
    association: &AssociationMapping,
) -> Result<()> {
    let expected = if association.is_single_valued() {
        PropertyKind::Reference
    } else {
        PropertyKind::Collection
    };
    match entity.property_kind(&association.name) {
        None => Err(missing_property(metadata, &association.name)),
        Some(declared) if declared == expected => Ok(()),
        Some(declared) => Err(MappingError::new(
            MappingErrorKind::TypeMismatch,
            metadata.name(),
            format!(
                "Property \"{}\" is {declared:?}, association needs {expected:?}",
                association.name
            ),
        )
        .field(association.name.clone())
        .into()),
    }
}

fn read_value(entity: &AnyEntityRef, field: &str) -> Result<Value> {
    entity.read().field(field)?.into_value()
}

impl EntityFactory {
    pub fn new(resolver: Weak<dyn AssociationResolver>) -> Self {
        Self { resolver }
    }

    fn resolver(&self, target: &str) -> Result<Arc<dyn AssociationResolver>> {
        upgrade(&self.resolver, target)
    }

    /// Instantiate a bare entity and set only its identifier fields from
    /// `row`.
    #[tracing::instrument(level = "trace", skip(self, metadata, row), fields(entity = E::NAME))]
    pub fn make_entity<E: EntityType>(&self, metadata: &ClassMetadata, row: &Row) -> Result<E> {
        let mut entity = E::blank();
        for field in metadata.identifier() {
            let mapping = metadata.field(field).ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::MissingIdentifier,
                    metadata.name(),
                    format!("Identifier \"{field}\" is not a mapped field"),
                )
            })?;
            check_field(&entity, metadata, mapping)?;
            let value = row.get(&mapping.column).ok_or_else(|| missing_column(metadata, mapping))?;
            entity.set_field(&mapping.name, FieldValue::Value(value.clone()))?;
        }
        Ok(entity)
    }

    /// Set fields from `row` and resolve associations.
    ///
    /// Identifier fields are skipped when `without_identifier` is set. A
    /// missing column is an error for non-nullable fields and sets null
    /// otherwise. Association slots that already hold an entity or proxy,
    /// and collections already initialized, are left alone.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = metadata.name(), handle = %entity.handle()))]
    pub fn fill_entity(
        &self,
        entity: &AnyEntityRef,
        metadata: &ClassMetadata,
        row: &Row,
        without_identifier: bool,
    ) -> Result<()> {
        {
            let mut guard = entity.write();
            for mapping in metadata.fields() {
                if without_identifier && metadata.is_identifier(&mapping.name) {
                    continue;
                }
                check_field(&*guard, metadata, mapping)?;
                let value = match row.get(&mapping.column) {
                    Some(value) => value.clone(),
                    None if mapping.nullable => Value::Null,
                    None => return Err(missing_column(metadata, mapping)),
                };
                guard.set_field(&mapping.name, FieldValue::Value(value))?;
            }
        }

        for association in metadata.associations() {
            let current = {
                let guard = entity.read();
                check_association(&*guard, metadata, association)?;
                guard.field(&association.name)?
            };
            match current {
                FieldValue::Reference(related) if related.is_set() => continue,
                FieldValue::Collection(collection) if collection.is_initialized() => continue,
                _ => {}
            }
            let resolved = self.resolve_association(entity, metadata, association)?;
            entity.write().set_field(&association.name, resolved)?;
        }
        Ok(())
    }

    /// Current field values of `entity`, keyed by column.
    ///
    /// Owning single-valued associations override their join column with
    /// the referenced value of the related entity. An uninitialized proxy
    /// supplies the value from its filter without loading.
    pub fn entity_row(&self, entity: &AnyEntityRef, metadata: &ClassMetadata) -> Result<Row> {
        let (mut row, links) = {
            let guard = entity.read();
            let mut row = Row::new();
            for mapping in metadata.fields() {
                if guard.property_kind(&mapping.name).is_none() {
                    return Err(missing_property(metadata, &mapping.name));
                }
                row.insert(mapping.column.clone(), guard.field(&mapping.name)?.into_value()?);
            }

            let mut links = Vec::new();
            for association in metadata.associations() {
                let Some(join) = association.join_column.as_ref() else {
                    continue;
                };
                if !association.is_single_valued() {
                    continue;
                }
                if let FieldValue::Reference(related) = guard.field(&association.name)? {
                    links.push((join, related));
                }
            }
            (row, links)
        };

        for (join, related) in links {
            let referenced = &join.referenced_column_name;
            let value = match related {
                ErasedRelated::Unset | ErasedRelated::Null => continue,
                ErasedRelated::Entity(other) => read_value(&other, referenced)?,
                ErasedRelated::Proxy(proxy) => {
                    if let Some(other) = proxy.loaded() {
                        read_value(&other, referenced)?
                    } else if let Some(value) = proxy.criteria().get(referenced) {
                        value.clone()
                    } else {
                        match proxy.load()? {
                            Some(other) => read_value(&other, referenced)?,
                            None => continue,
                        }
                    }
                }
            };
            row.insert(metadata.column_of(&join.name).to_string(), value);
        }
        Ok(row)
    }

    fn resolve_association(
        &self,
        entity: &AnyEntityRef,
        metadata: &ClassMetadata,
        association: &AssociationMapping,
    ) -> Result<FieldValue> {
        if association.is_single_valued() && !association.is_inverse_side() {
            self.owning_side(entity, metadata, association)
        } else {
            self.inverse_side(entity, metadata, association)
        }
    }

    fn owning_side(
        &self,
        entity: &AnyEntityRef,
        metadata: &ClassMetadata,
        association: &AssociationMapping,
    ) -> Result<FieldValue> {
        let join = association.join_column.as_ref().ok_or_else(|| {
            invalid_association(
                metadata,
                &association.name,
                format!("Association \"{}\" has no join column", association.name),
            )
        })?;
        let local = read_value(entity, &join.name)?;
        if local.is_null() {
            return Ok(FieldValue::Reference(ErasedRelated::Null));
        }
        let criteria = Criteria::new().with(join.referenced_column_name.clone(), local);
        self.single(association, criteria)
    }

    fn inverse_side(
        &self,
        entity: &AnyEntityRef,
        metadata: &ClassMetadata,
        association: &AssociationMapping,
    ) -> Result<FieldValue> {
        let mapped_by = association.mapped_by.as_deref().ok_or_else(|| {
            invalid_association(
                metadata,
                &association.name,
                format!("Association \"{}\" has no mapped-by field", association.name),
            )
        })?;
        let target = self.resolver(&association.target)?.metadata_for(&association.target)?;

        let Some(owning) = target
            .association(mapped_by)
            .filter(|a| a.is_single_valued())
        else {
            return Err(invalid_association(
                metadata,
                &association.name,
                format!("Mapped target field \"{mapped_by}\" is not a single valued association"),
            ));
        };
        if target.is_association_inverse_side(mapped_by) {
            return Err(invalid_association(
                metadata,
                &association.name,
                format!("Mapped target field \"{mapped_by}\" can't be an inverse side"),
            ));
        }
        let Some(join) = owning.join_column.as_ref() else {
            return Err(invalid_association(
                metadata,
                &association.name,
                format!("Target join column \"{mapped_by}\" does not exist"),
            ));
        };

        let local = read_value(entity, &join.referenced_column_name)?;
        if association.is_collection_valued() {
            if local.is_null() {
                return Ok(FieldValue::Collection(ErasedCollection::from_entities(
                    association.target.clone(),
                    Vec::new(),
                )));
            }
            let criteria = Criteria::new().with(join.name.clone(), local);
            let collection = self.collection(&association.target, criteria);
            if association.is_eager() {
                collection.initialize()?;
            }
            return Ok(FieldValue::Collection(collection));
        }

        if local.is_null() {
            return Ok(FieldValue::Reference(ErasedRelated::Null));
        }
        let criteria = Criteria::new().with(join.name.clone(), local);
        self.single(association, criteria)
    }

    fn single(&self, association: &AssociationMapping, criteria: Criteria) -> Result<FieldValue> {
        if association.is_eager() {
            let found = self
                .resolver(&association.target)?
                .find_one_by(&association.target, &criteria)?;
            tracing::trace!(
                target_entity = %association.target,
                found = found.is_some(),
                "Eager association loaded"
            );
            return Ok(FieldValue::Reference(
                found.map_or(ErasedRelated::Null, ErasedRelated::Entity),
            ));
        }
        Ok(FieldValue::Reference(ErasedRelated::Proxy(
            self.proxy(&association.target, criteria),
        )))
    }

    /// Lazy proxy for the `target` entity matching `criteria`.
    pub fn proxy(&self, target: &str, criteria: Criteria) -> ErasedProxy {
        let resolver = self.resolver.clone();
        let name = target.to_string();
        let filter = criteria.clone();
        ErasedProxy::new(target, criteria, move || {
            upgrade(&resolver, &name)?.find_one_by(&name, &filter)
        })
    }

    /// Lazy collection of `target` entities matching `criteria`.
    pub fn collection(&self, target: &str, criteria: Criteria) -> ErasedCollection {
        let resolver = self.resolver.clone();
        let name = target.to_string();
        let filter = criteria.clone();
        ErasedCollection::new(target, criteria, move || {
            upgrade(&resolver, &name)?.find_by(&name, &filter, None, None)
        })
    }
}

fn missing_column(metadata: &ClassMetadata, mapping: &FieldMapping) -> Error {
    MappingError::new(
        MappingErrorKind::MissingColumn,
        metadata.name(),
        format!("Row key \"{}\" does not exist", mapping.column),
    )
    .field(mapping.name.clone())
    .into()
}
