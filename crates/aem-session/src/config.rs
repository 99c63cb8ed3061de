//! Entity manager configuration.

use serde::{Deserialize, Serialize};

/// Configuration for entity manager behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityManagerConfig {
    /// Replace the dirty-check snapshot with the written row after an update.
    ///
    /// Off by default: the snapshot stays the load-time baseline, so a
    /// state that differs from the baseline is written on every flush.
    pub advance_snapshot_on_update: bool,
    /// Let `refresh` overwrite identifier fields too.
    pub refresh_identifier: bool,
    /// Leave null identifier columns out of inserted rows.
    pub skip_null_identifiers_on_insert: bool,
    /// Dispatch entity events around commit-time persister calls.
    pub dispatch_entity_events: bool,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            advance_snapshot_on_update: false,
            refresh_identifier: false,
            skip_null_identifiers_on_insert: true,
            dispatch_entity_events: true,
        }
    }
}

impl EntityManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn advance_snapshot_on_update(mut self, value: bool) -> Self {
        self.advance_snapshot_on_update = value;
        self
    }

    #[must_use]
    pub fn refresh_identifier(mut self, value: bool) -> Self {
        self.refresh_identifier = value;
        self
    }

    #[must_use]
    pub fn skip_null_identifiers_on_insert(mut self, value: bool) -> Self {
        self.skip_null_identifiers_on_insert = value;
        self
    }

    #[must_use]
    pub fn dispatch_entity_events(mut self, value: bool) -> Self {
        self.dispatch_entity_events = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EntityManagerConfig::default();
        assert!(!config.advance_snapshot_on_update);
        assert!(!config.refresh_identifier);
        assert!(config.skip_null_identifiers_on_insert);
        assert!(config.dispatch_entity_events);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EntityManagerConfig =
            serde_json::from_str(r#"{"advance_snapshot_on_update": true}"#).unwrap();
        assert!(config.advance_snapshot_on_update);
        assert!(config.skip_null_identifiers_on_insert);
        assert_eq!(
            config,
            EntityManagerConfig::new().advance_snapshot_on_update(true)
        );
    }
}
