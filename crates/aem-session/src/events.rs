//! Entity events dispatched around commit-time writes.
//!
//! Unlike lifecycle hooks, which belong to an entity type's metadata,
//! listeners here are registered on the entity manager and see every
//! entity type. A listener may stop propagation to later listeners, and a
//! listener error aborts the commit.

use aem_core::{AnyEntityRef, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Kinds of entity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEventKind {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
}

impl EntityEventKind {
    pub const ALL: [EntityEventKind; 6] = [
        EntityEventKind::PrePersist,
        EntityEventKind::PostPersist,
        EntityEventKind::PreUpdate,
        EntityEventKind::PostUpdate,
        EntityEventKind::PreRemove,
        EntityEventKind::PostRemove,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            EntityEventKind::PrePersist => "entity.pre_persist",
            EntityEventKind::PostPersist => "entity.post_persist",
            EntityEventKind::PreUpdate => "entity.pre_update",
            EntityEventKind::PostUpdate => "entity.post_update",
            EntityEventKind::PreRemove => "entity.pre_remove",
            EntityEventKind::PostRemove => "entity.post_remove",
        }
    }
}

impl fmt::Display for EntityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event as seen by listeners.
#[derive(Debug, Clone)]
pub struct EntityEvent {
    kind: EntityEventKind,
    entity: AnyEntityRef,
    propagation_stopped: bool,
}

impl EntityEvent {
    pub fn new(kind: EntityEventKind, entity: AnyEntityRef) -> Self {
        Self {
            kind,
            entity,
            propagation_stopped: false,
        }
    }

    pub fn kind(&self) -> EntityEventKind {
        self.kind
    }

    pub fn entity(&self) -> &AnyEntityRef {
        &self.entity
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Skip the listeners registered after the current one.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }
}

type EntityListener = Arc<dyn Fn(&mut EntityEvent) -> Result<()> + Send + Sync>;

/// Listener registry keyed by event kind.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EntityEventKind, Vec<EntityListener>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in EntityEventKind::ALL {
            let count = self.listener_count(kind);
            if count > 0 {
                map.entry(&kind.name(), &count);
            }
        }
        map.finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `kind`, after those already registered.
    pub fn listen<F>(&self, kind: EntityEventKind, listener: F)
    where
        F: Fn(&mut EntityEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, kind: EntityEventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, kind: EntityEventKind) -> bool {
        self.listener_count(kind) > 0
    }

    /// Call the listeners for `kind` in order until one stops propagation.
    ///
    /// The registry is not locked while listeners run, so a listener may
    /// register further listeners; they take effect from the next dispatch.
    pub fn dispatch(&self, kind: EntityEventKind, entity: &AnyEntityRef) -> Result<EntityEvent> {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut event = EntityEvent::new(kind, entity.clone());
        if listeners.is_empty() {
            return Ok(event);
        }
        tracing::trace!(
            event = kind.name(),
            entity = entity.entity_name(),
            handle = %entity.handle(),
            listeners = listeners.len(),
            "Dispatching entity event"
        );
        for listener in &listeners {
            listener(&mut event)?;
            if event.is_propagation_stopped() {
                tracing::trace!(event = kind.name(), "Propagation stopped");
                break;
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aem_core::{EntityRef, Error};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Note {
        id: i64,
    }

    aem_core::entity!(Note, "Note" { id });

    #[test]
    fn test_listeners_run_in_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            dispatcher.listen(EntityEventKind::PrePersist, move |event| {
                seen.lock().unwrap().push((tag, event.entity().entity_name()));
                Ok(())
            });
        }
        let note = EntityRef::new(Note::default()).erase();
        let event = dispatcher.dispatch(EntityEventKind::PrePersist, &note).unwrap();
        assert!(!event.is_propagation_stopped());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("first", "Note"), ("second", "Note")]
        );
        assert_eq!(dispatcher.listener_count(EntityEventKind::PostPersist), 0);
    }

    #[test]
    fn test_stop_propagation() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(Mutex::new(0));
        dispatcher.listen(EntityEventKind::PreRemove, |event| {
            event.stop_propagation();
            Ok(())
        });
        let counter = Arc::clone(&calls);
        dispatcher.listen(EntityEventKind::PreRemove, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let note = EntityRef::new(Note::default()).erase();
        let event = dispatcher.dispatch(EntityEventKind::PreRemove, &note).unwrap();
        assert!(event.is_propagation_stopped());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_listener_error_propagates() {
        let dispatcher = EventDispatcher::new();
        dispatcher.listen(EntityEventKind::PostUpdate, |_| Err(Error::Custom("veto".into())));
        let note = EntityRef::new(Note::default()).erase();
        assert!(dispatcher.dispatch(EntityEventKind::PostUpdate, &note).is_err());
        assert_eq!(format!("{dispatcher:?}"), r#"{"entity.post_update": 1}"#);
    }
}
