//! Identifier index for one entity type.
//!
//! The index guarantees that each persistent identity corresponds to exactly
//! one in-memory instance per entity manager: loading the same identifier
//! twice hands back the [`EntityRef`] that was indexed first.
//!
//! Identifiers are hashed over their key-sorted `(field, value)` pairs, so
//! logically equal identifiers hash the same regardless of how they were
//! assembled.

use aem_core::value::hash_value;
use aem_core::{EntityHandle, EntityRef, Identifier};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Stable 64-bit hash of an identifier tuple.
pub fn identity_hash(identifier: &Identifier) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (field, value) in identifier.iter() {
        field.hash(&mut hasher);
        hash_value(value, &mut hasher);
    }
    hasher.finish()
}

/// Identity hash to tracked entity.
pub struct IdentityIndex<E> {
    entries: HashMap<u64, EntityRef<E>>,
}

impl<E> IdentityIndex<E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, hash: u64) -> Option<&EntityRef<E>> {
        self.entries.get(&hash)
    }

    /// Index `entity` under `hash`, returning the entity it displaced.
    pub fn insert(&mut self, hash: u64, entity: EntityRef<E>) -> Option<EntityRef<E>> {
        self.entries.insert(hash, entity)
    }

    /// Drop every entry that points at `handle`.
    ///
    /// Works even when the entity's identifier changed after it was indexed.
    pub fn remove_entity(&mut self, handle: EntityHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.handle() != handle);
        before != self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for IdentityIndex<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for IdentityIndex<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityIndex")
            .field("entries", &self.entries.len())
            .finish()
    }
}
