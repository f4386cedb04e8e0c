//! In-memory repository with JSON export/import.

use crate::domain::{Entity, SwapError};
use crate::ports::Repository;
use parking_lot::RwLock;
use std::collections::HashMap;

/// `RwLock<HashMap>` backed [`Repository`].
pub struct InMemoryRepository<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T: Entity> InMemoryRepository<T> {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// No records.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// All records as a JSON array sorted by id.
    pub fn export_json(&self) -> Result<String, SwapError> {
        let mut items: Vec<T> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        serde_json::to_string_pretty(&items).map_err(|e| SwapError::Storage(format!("export {}: {e}", T::KIND)))
    }

    /// Load records from [`InMemoryRepository::export_json`] output,
    /// replacing records with the same id. Returns how many were loaded.
    pub fn import_json(&self, json: &str) -> Result<usize, SwapError> {
        let items: Vec<T> =
            serde_json::from_str(json).map_err(|e| SwapError::Storage(format!("import {}: {e}", T::KIND)))?;
        let count = items.len();
        let mut map = self.items.write();
        for item in items {
            map.insert(item.id().to_string(), item);
        }
        Ok(count)
    }
}

impl<T: Entity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    fn get(&self, id: &str) -> Result<Option<T>, SwapError> {
        Ok(self.items.read().get(id).cloned())
    }

    fn put(&self, item: T) -> Result<(), SwapError> {
        self.items.write().insert(item.id().to_string(), item);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, SwapError> {
        Ok(self.items.write().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<T>, SwapError> {
        Ok(self.items.read().values().cloned().collect())
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T) -> Result<(), SwapError>) -> Result<T, SwapError> {
        let mut map = self.items.write();
        let current = map.get(id).ok_or_else(|| SwapError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })?;
        let mut next = current.clone();
        f(&mut next)?;
        map.insert(id.to_string(), next.clone());
        Ok(next)
    }
}
