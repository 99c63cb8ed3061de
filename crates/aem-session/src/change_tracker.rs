//! Snapshot-based dirty detection.
//!
//! Every tracked entity has one original row snapshot, keyed by its
//! [`EntityHandle`]. An entity is dirty when its current computed row is not
//! structurally equal to that snapshot.

use aem_core::{EntityHandle, Row};
use std::collections::HashMap;

/// Original row of an entity.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    row: Row,
}

impl RowSnapshot {
    pub fn new(row: Row) -> Self {
        Self { row }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }
}

/// Tracks original rows of loaded and flushed entities.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityHandle, RowSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `row` as the original state of `handle`, replacing any
    /// earlier snapshot.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn snapshot(&mut self, handle: EntityHandle, row: Row) {
        tracing::trace!(%handle, columns = row.len(), "Taking row snapshot");
        self.snapshots.insert(handle, RowSnapshot::new(row));
    }

    /// Compare `current` against the snapshot of `handle`.
    ///
    /// Returns `None` when no snapshot exists.
    pub fn is_dirty(&self, handle: EntityHandle, current: &Row) -> Option<bool> {
        let snapshot = self.snapshots.get(&handle)?;
        let dirty = snapshot.row != *current;
        tracing::trace!(%handle, dirty, "Dirty check result");
        Some(dirty)
    }

    pub fn get_snapshot(&self, handle: EntityHandle) -> Option<&RowSnapshot> {
        self.snapshots.get(&handle)
    }

    pub fn clear(&mut self, handle: EntityHandle) {
        self.snapshots.remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
