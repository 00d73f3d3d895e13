use std::collections::HashSet;

use rusqlite::Connection;

use crate::db::repository::{fetch_natural_keys, KeyedEntity};
use crate::db::DatabaseError;

/// Point-in-time snapshot of the natural keys already stored for one entity.
///
/// Loaded once per run and passed to the loader by value. Rows committed by
/// another process after the snapshot are still caught by the store's
/// unique constraints.
#[derive(Debug, Clone)]
pub struct ExistingKeys {
    entity: KeyedEntity,
    keys: HashSet<String>,
}

impl ExistingKeys {
    /// One query, optionally restricted to keys starting with `scope`.
    pub fn load(
        conn: &Connection,
        entity: KeyedEntity,
        scope: Option<&str>,
    ) -> Result<Self, DatabaseError> {
        let keys = fetch_natural_keys(conn, entity, scope)?;
        tracing::debug!(entity = %entity, scope = ?scope, count = keys.len(), "Existing keys loaded");
        Ok(Self { entity, keys })
    }

    /// Full-reload mode: nothing is considered stored.
    pub fn empty(entity: KeyedEntity) -> Self {
        Self {
            entity,
            keys: HashSet::new(),
        }
    }

    pub fn entity(&self) -> KeyedEntity {
        self.entity
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
