//! Lifecycle hook registry.
//!
//! Hooks are registered per entity type on its [`ClassMetadata`](crate::ClassMetadata)
//! and fired by the persister and unit of work with the entity as the only
//! argument. A hook returning `Err` aborts the operation that fired it.

use crate::entity::{Entity, EntityType};
use crate::error::{Error, HookError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Entity lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleEvent {
    /// Entity is about to be scheduled for insertion.
    PrePersist,
    /// Entity has been inserted and reloaded.
    PostPersist,
    /// Dirty entity is about to be written.
    PreUpdate,
    /// Dirty entity has been written.
    PostUpdate,
    /// Entity is about to be scheduled for deletion.
    PreRemove,
    /// Entity has been deleted.
    PostRemove,
    /// Entity has been loaded and filled.
    PostLoad,
    /// Commit is about to process the entity.
    PreFlush,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 8] = [
        LifecycleEvent::PrePersist,
        LifecycleEvent::PostPersist,
        LifecycleEvent::PreUpdate,
        LifecycleEvent::PostUpdate,
        LifecycleEvent::PreRemove,
        LifecycleEvent::PostRemove,
        LifecycleEvent::PostLoad,
        LifecycleEvent::PreFlush,
    ];

    /// Event name as spelled in mapping files.
    pub const fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::PrePersist => "prePersist",
            LifecycleEvent::PostPersist => "postPersist",
            LifecycleEvent::PreUpdate => "preUpdate",
            LifecycleEvent::PostUpdate => "postUpdate",
            LifecycleEvent::PreRemove => "preRemove",
            LifecycleEvent::PostRemove => "postRemove",
            LifecycleEvent::PostLoad => "postLoad",
            LifecycleEvent::PreFlush => "preFlush",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registered hook, erased to operate on any entity.
pub type LifecycleHook = Arc<dyn Fn(&mut dyn Entity) -> Result<()> + Send + Sync>;

/// Ordered hook lists keyed by event.
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    hooks: HashMap<LifecycleEvent, Vec<LifecycleHook>>,
}

impl fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in LifecycleEvent::ALL {
            let count = self.len(event);
            if count > 0 {
                map.entry(&event.name(), &count);
            }
        }
        map.finish()
    }
}

impl LifecycleCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for entity type `E`.
    ///
    /// The hook is called with the concrete entity; firing it on an entity
    /// of another type is a hook error.
    pub fn register<E, F>(&mut self, event: LifecycleEvent, hook: F)
    where
        E: EntityType,
        F: Fn(&mut E) -> Result<()> + Send + Sync + 'static,
    {
        self.register_dyn(event, move |entity: &mut dyn Entity| {
            let name = entity.entity_name();
            match entity.as_any_mut().downcast_mut::<E>() {
                Some(typed) => hook(typed),
                None => Err(Error::Hook(HookError {
                    event,
                    entity: name.to_string(),
                    message: format!("hook registered for {} cannot run on {}", E::NAME, name),
                })),
            }
        });
    }

    /// Register a hook that works on any entity.
    pub fn register_dyn<F>(&mut self, event: LifecycleEvent, hook: F)
    where
        F: Fn(&mut dyn Entity) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.entry(event).or_default().push(Arc::new(hook));
    }

    /// Number of hooks registered for `event`.
    pub fn len(&self, event: LifecycleEvent) -> usize {
        self.hooks.get(&event).map_or(0, Vec::len)
    }

    pub fn has(&self, event: LifecycleEvent) -> bool {
        self.len(event) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    /// Invoke every hook for `event` in registration order.
    pub fn dispatch(&self, event: LifecycleEvent, entity: &mut dyn Entity) -> Result<()> {
        let Some(hooks) = self.hooks.get(&event) else {
            return Ok(());
        };
        tracing::trace!(
            entity = entity.entity_name(),
            event = event.name(),
            hooks = hooks.len(),
            "Dispatching lifecycle hooks"
        );
        for hook in hooks {
            hook(&mut *entity)?;
        }
        Ok(())
    }
}
