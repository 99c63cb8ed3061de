//! Unit of Work: the persister cache and the three-pass commit.
//!
//! The unit of work owns exactly one persister per entity type name for its
//! lifetime. A commit walks every cached persister three times:
//!
//! 1. inserts, across all entity types, in persist order per type
//! 2. updates of tracked entities, skipping those inserted by this commit;
//!    clean entities raise update events but are not written
//! 3. deletes, each followed by a detach
//!
//! `preFlush` hooks run once per entity per commit, before its first write.
//! When a [`TransactionalConnection`] is given, the passes run inside its
//! transaction; any failure rolls it back and surfaces as
//! [`Error::CommitFailed`] wrapping the cause.

use crate::events::{EntityEventKind, EventDispatcher};
use crate::persister::{PendingCounts, PersisterObject};
use aem_core::{
    AnyEntityRef, ClassMetadata, EntityHandle, Error, LifecycleEvent, Result,
    TransactionalConnection,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct PersisterCache {
    order: Vec<Arc<dyn PersisterObject>>,
    by_name: HashMap<String, usize>,
}

/// Persister cache plus commit orchestration.
#[derive(Default)]
pub struct UnitOfWork {
    persisters: Mutex<PersisterCache>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.lock();
        let names: Vec<&str> = cache.order.iter().map(|p| p.entity_name()).collect();
        f.debug_struct("UnitOfWork")
            .field("persisters", &names)
            .finish()
    }
}

fn emit(events: Option<&EventDispatcher>, kind: EntityEventKind, entity: &AnyEntityRef) -> Result<()> {
    if let Some(dispatcher) = events {
        dispatcher.dispatch(kind, entity)?;
    }
    Ok(())
}

/// Run `preFlush` hooks unless they already ran for this entity.
fn pre_flush(
    persister: &dyn PersisterObject,
    entity: &AnyEntityRef,
    flushed: &mut HashSet<EntityHandle>,
) -> Result<()> {
    if !flushed.insert(entity.handle()) {
        return Ok(());
    }
    let metadata = persister.metadata();
    if !metadata.has_callbacks(LifecycleEvent::PreFlush) {
        return Ok(());
    }
    let mut guard = entity.write();
    metadata
        .callbacks()
        .dispatch(LifecycleEvent::PreFlush, &mut *guard)
}

impl UnitOfWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PersisterCache> {
        self.persisters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached persister for `metadata`'s entity type, built with `make`
    /// on first use.
    pub fn get_entity_persister<F>(
        &self,
        metadata: &ClassMetadata,
        make: F,
    ) -> Result<Arc<dyn PersisterObject>>
    where
        F: FnOnce() -> Result<Arc<dyn PersisterObject>>,
    {
        if let Some(existing) = self.persister(metadata.name()) {
            return Ok(existing);
        }
        let made = make()?;

        let mut cache = self.lock();
        if let Some(&index) = cache.by_name.get(metadata.name()) {
            return Ok(Arc::clone(&cache.order[index]));
        }
        let index = cache.order.len();
        cache.order.push(Arc::clone(&made));
        cache.by_name.insert(metadata.name().to_string(), index);
        Ok(made)
    }

    pub fn persister(&self, entity: &str) -> Option<Arc<dyn PersisterObject>> {
        let cache = self.lock();
        cache
            .by_name
            .get(entity)
            .map(|&index| Arc::clone(&cache.order[index]))
    }

    /// Cached persisters in creation order.
    pub fn persisters(&self) -> Vec<Arc<dyn PersisterObject>> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Drop every persister, and with them every tracked entity.
    pub fn clear(&self) {
        let mut cache = self.lock();
        tracing::debug!(persisters = cache.order.len(), "Clearing unit of work");
        cache.order.clear();
        cache.by_name.clear();
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut total = PendingCounts::default();
        for persister in self.persisters() {
            total += persister.counts();
        }
        total
    }

    /// Write every pending change.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn commit(
        &self,
        connection: Option<&dyn TransactionalConnection>,
        events: Option<&EventDispatcher>,
    ) -> Result<()> {
        let counts = self.pending_counts();
        tracing::info!(
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            transactional = connection.is_some(),
            "Committing unit of work"
        );

        if let Some(connection) = connection {
            if let Err(e) = connection.begin_transaction() {
                tracing::error!(error = %e, "Failed to begin transaction");
                return Err(Error::CommitFailed(Box::new(e)));
            }
        }

        let result = self.run_passes(events).and_then(|()| match connection {
            Some(connection) => connection.commit_transaction(),
            None => Ok(()),
        });

        match result {
            Ok(()) => {
                tracing::info!("Commit complete");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Commit failed, rolling back");
                if let Some(connection) = connection {
                    if let Err(rollback) = connection.rollback_transaction() {
                        tracing::error!(error = %rollback, "Rollback failed");
                    }
                }
                Err(Error::CommitFailed(Box::new(e)))
            }
        }
    }

    fn run_passes(&self, events: Option<&EventDispatcher>) -> Result<()> {
        let mut flushed = HashSet::new();
        let mut inserted = HashSet::new();

        for persister in self.persisters() {
            for handle in persister.insert_handles() {
                let Some(entity) = persister.tracked(handle) else {
                    continue;
                };
                pre_flush(&*persister, &entity, &mut flushed)?;
                emit(events, EntityEventKind::PrePersist, &entity)?;
                persister.insert_handle(handle)?;
                emit(events, EntityEventKind::PostPersist, &entity)?;
                inserted.insert(handle);
            }
        }

        for persister in self.persisters() {
            for handle in persister.update_handles() {
                if inserted.contains(&handle) {
                    continue;
                }
                let Some(entity) = persister.tracked(handle) else {
                    continue;
                };
                pre_flush(&*persister, &entity, &mut flushed)?;
                emit(events, EntityEventKind::PreUpdate, &entity)?;
                persister.update_handle(handle)?;
                emit(events, EntityEventKind::PostUpdate, &entity)?;
            }
        }

        for persister in self.persisters() {
            for handle in persister.delete_handles() {
                let Some(entity) = persister.tracked(handle) else {
                    continue;
                };
                pre_flush(&*persister, &entity, &mut flushed)?;
                emit(events, EntityEventKind::PreRemove, &entity)?;
                persister.delete_handle(handle)?;
                emit(events, EntityEventKind::PostRemove, &entity)?;
                persister.detach_handle(handle);
            }
        }

        tracing::debug!(
            inserted = inserted.len(),
            flushed = flushed.len(),
            "Commit passes done"
        );
        Ok(())
    }
}
