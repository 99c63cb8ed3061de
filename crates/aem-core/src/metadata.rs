//! Per-entity mapping metadata.
//!
//! [`ClassMetadata`] describes how an entity type maps to adapter rows: its
//! identifier, its fields with column names and type tags, its associations,
//! and its lifecycle hooks. Metadata is immutable once built and shared as
//! `Arc<ClassMetadata>`.

use crate::entity::{Entity, EntityType};
use crate::error::{Error, MappingError, MappingErrorKind, Result};
use crate::lifecycle::{LifecycleCallbacks, LifecycleEvent};
use crate::row::{Identifier, Row};
use crate::types::FieldType;
use std::collections::HashMap;
use std::sync::Arc;

/// Mapping of one scalar or value-object field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    /// Property name on the entity.
    pub name: String,
    /// Column name used by the adapter.
    pub column: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldMapping {
    /// Map `name` to a column of the same name.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            field_type,
            nullable: false,
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// How an association is resolved when its owner is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Install a proxy or uninitialized collection.
    #[default]
    Lazy,
    /// Query the target immediately.
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    SingleValued,
    CollectionValued,
}

/// Foreign-key link of an owning association.
///
/// Both names are property names: `name` is the local property holding the
/// key and `referenced_column_name` the target property it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub name: String,
    pub referenced_column_name: String,
}

/// Mapping of one association.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationMapping {
    pub name: String,
    pub kind: AssociationKind,
    /// Registered name of the target entity type.
    pub target: String,
    /// Owning field on the target, for the inverse side.
    pub mapped_by: Option<String>,
    /// Key column, for the owning side.
    pub join_column: Option<JoinColumn>,
    pub fetch: FetchMode,
}

impl AssociationMapping {
    /// A single-valued association to `target`.
    pub fn has_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, AssociationKind::SingleValued)
    }

    /// A collection-valued association to `target`.
    pub fn has_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, AssociationKind::CollectionValued)
    }

    fn new(name: impl Into<String>, target: impl Into<String>, kind: AssociationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            mapped_by: None,
            join_column: None,
            fetch: FetchMode::Lazy,
        }
    }

    #[must_use]
    pub fn join_column(mut self, name: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.join_column = Some(JoinColumn {
            name: name.into(),
            referenced_column_name: referenced.into(),
        });
        self
    }

    #[must_use]
    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    #[must_use]
    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn is_single_valued(&self) -> bool {
        self.kind == AssociationKind::SingleValued
    }

    pub fn is_collection_valued(&self) -> bool {
        self.kind == AssociationKind::CollectionValued
    }

    pub fn is_owning_side(&self) -> bool {
        self.join_column.is_some()
    }

    pub fn is_inverse_side(&self) -> bool {
        self.mapped_by.is_some()
    }

    pub fn is_eager(&self) -> bool {
        self.fetch == FetchMode::Eager
    }
}

/// Immutable mapping description of one entity type.
#[derive(Debug, Clone)]
pub struct ClassMetadata {
    name: String,
    identifier: Vec<String>,
    fields: Vec<FieldMapping>,
    associations: Vec<AssociationMapping>,
    callbacks: LifecycleCallbacks,
}

impl ClassMetadata {
    pub fn builder(name: impl Into<String>) -> ClassMetadataBuilder {
        ClassMetadataBuilder {
            name: name.into(),
            identifier: Vec::new(),
            fields: Vec::new(),
            associations: Vec::new(),
            callbacks: LifecycleCallbacks::new(),
        }
    }

    /// Builder pre-named after entity type `E`.
    pub fn builder_for<E: EntityType>() -> ClassMetadataBuilder {
        Self::builder(E::NAME)
    }

    /// Registered entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier field names, in declaration order.
    pub fn identifier(&self) -> &[String] {
        &self.identifier
    }

    pub fn is_identifier(&self, field: &str) -> bool {
        self.identifier.iter().any(|id| id == field)
    }

    pub fn is_composite_identifier(&self) -> bool {
        self.identifier.len() > 1
    }

    /// Mapped fields, identifier fields included.
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn associations(&self) -> &[AssociationMapping] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn has_association(&self, name: &str) -> bool {
        self.association(name).is_some()
    }

    /// Whether the named association is the inverse side.
    ///
    /// Unknown names are not inverse.
    pub fn is_association_inverse_side(&self, name: &str) -> bool {
        self.association(name)
            .is_some_and(AssociationMapping::is_inverse_side)
    }

    /// Field names followed by association names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.associations.iter().map(|a| a.name.as_str()))
    }

    /// Column of a field; falls back to the field name for unmapped names.
    pub fn column_of<'a>(&'a self, field: &'a str) -> &'a str {
        self.field(field).map_or(field, |f| f.column.as_str())
    }

    /// Field mapped to a column; falls back to the column name.
    pub fn field_of_column<'a>(&'a self, column: &'a str) -> &'a str {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map_or(column, |f| f.name.as_str())
    }

    /// Rename field-keyed entries to column names.
    ///
    /// An entry is not renamed if its column name is already present.
    pub fn fields_to_columns(&self, row: &Row) -> Row {
        let mut out = row.clone();
        for mapping in &self.fields {
            out.rename(&mapping.name, &mapping.column);
        }
        out
    }

    /// Rename column-keyed entries to field names.
    pub fn columns_to_fields(&self, row: &Row) -> Row {
        let mut out = row.clone();
        for mapping in &self.fields {
            out.rename(&mapping.column, &mapping.name);
        }
        out
    }

    pub fn callbacks(&self) -> &LifecycleCallbacks {
        &self.callbacks
    }

    pub fn has_callbacks(&self, event: LifecycleEvent) -> bool {
        self.callbacks.has(event)
    }

    /// Current identifier values of `entity`, keyed by field name.
    pub fn identifier_values(&self, entity: &dyn Entity) -> Result<Identifier> {
        let mut identifier = Identifier::new();
        for field in &self.identifier {
            let value = entity.field(field)?.into_value()?;
            identifier.insert(field.clone(), value);
        }
        Ok(identifier)
    }

    fn mapping_error(&self, kind: MappingErrorKind, message: String) -> Error {
        MappingError::new(kind, self.name.clone(), message).into()
    }
}

/// Builder for [`ClassMetadata`].
#[derive(Debug)]
pub struct ClassMetadataBuilder {
    name: String,
    identifier: Vec<String>,
    fields: Vec<FieldMapping>,
    associations: Vec<AssociationMapping>,
    callbacks: LifecycleCallbacks,
}

impl ClassMetadataBuilder {
    /// Add an identifier field.
    #[must_use]
    pub fn id(mut self, field: FieldMapping) -> Self {
        self.identifier.push(field.name.clone());
        self.fields.push(field);
        self
    }

    /// Add a regular field.
    #[must_use]
    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an association.
    #[must_use]
    pub fn association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    /// Register a typed lifecycle hook.
    #[must_use]
    pub fn on<E, F>(mut self, event: LifecycleEvent, hook: F) -> Self
    where
        E: EntityType,
        F: Fn(&mut E) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register::<E, F>(event, hook);
        self
    }

    /// Replace the hook registry wholesale.
    #[must_use]
    pub fn callbacks(mut self, callbacks: LifecycleCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Validate and build the metadata.
    pub fn build(self) -> Result<ClassMetadata> {
        let metadata = ClassMetadata {
            name: self.name,
            identifier: self.identifier,
            fields: self.fields,
            associations: self.associations,
            callbacks: self.callbacks,
        };
        validate(&metadata)?;
        Ok(metadata)
    }
}

fn validate(metadata: &ClassMetadata) -> Result<()> {
    if metadata.identifier.is_empty() {
        return Err(metadata.mapping_error(
            MappingErrorKind::MissingIdentifier,
            format!("Entity {} declares no identifier", metadata.name),
        ));
    }

    let mut seen = HashMap::new();
    for name in metadata.field_names() {
        if seen.insert(name, ()).is_some() {
            return Err(metadata.mapping_error(
                MappingErrorKind::InvalidAssociation,
                format!("Field \"{name}\" is mapped twice in {}", metadata.name),
            ));
        }
    }

    for association in &metadata.associations {
        match (&association.join_column, &association.mapped_by) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(metadata.mapping_error(
                    MappingErrorKind::InvalidAssociation,
                    format!(
                        "Association \"{}\" of {} must declare exactly one of join column or mapped-by",
                        association.name, metadata.name
                    ),
                ));
            }
            (Some(join), None) => {
                if association.is_collection_valued() {
                    return Err(metadata.mapping_error(
                        MappingErrorKind::InvalidAssociation,
                        format!(
                            "Collection-valued association \"{}\" of {} can only be an inverse side",
                            association.name, metadata.name
                        ),
                    ));
                }
                if metadata.field(&join.name).is_none() {
                    return Err(metadata.mapping_error(
                        MappingErrorKind::InvalidAssociation,
                        format!(
                            "Join column \"{}\" of association \"{}\" is not a mapped field of {}",
                            join.name, association.name, metadata.name
                        ),
                    ));
                }
            }
            (None, Some(_)) => {}
        }
    }
    Ok(())
}

/// Source of metadata by entity name.
pub trait ClassMetadataProvider: Send + Sync {
    fn metadata_for(&self, entity: &str) -> Option<Arc<ClassMetadata>>;
}

/// Metadata registered up front.
#[derive(Debug, Default)]
pub struct StaticMetadataProvider {
    entries: HashMap<String, Arc<ClassMetadata>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metadata: ClassMetadata) -> Arc<ClassMetadata> {
        let metadata = Arc::new(metadata);
        self.entries
            .insert(metadata.name().to_string(), Arc::clone(&metadata));
        metadata
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClassMetadataProvider for StaticMetadataProvider {
    fn metadata_for(&self, entity: &str) -> Option<Arc<ClassMetadata>> {
        self.entries.get(entity).cloned()
    }
}
