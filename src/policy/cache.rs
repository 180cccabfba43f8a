//! Cache for compiled policy queries.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use super::rego::PreparedQuery;

/// Caches prepared policy queries keyed by `metricID-targetID-configHash`.
///
/// Keys are content-addressed: any change to a metric's configuration or
/// implementation yields a new key, so stale entries naturally become
/// unreachable. Eviction exists as a cleanup path, not a correctness
/// requirement.
pub struct QueryCache {
    cache: Mutex<HashMap<String, PreparedQuery>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the prepared query for the given key. If the key was not
    /// found in the cache, `or_else` is executed to populate it. A failing
    /// `or_else` does not poison the cache; the next call retries.
    pub fn get(
        &self,
        key: &str,
        or_else: impl FnOnce(&str) -> Result<PreparedQuery>,
    ) -> Result<PreparedQuery> {
        let mut cache = self.cache.lock().unwrap();

        if let Some(query) = cache.get(key) {
            return Ok(query.clone());
        }

        let query = or_else(key)?;
        cache.insert(key.to_string(), query.clone());
        Ok(query)
    }

    /// Deletes all keys that begin with the given metric ID.
    pub fn evict(&self, metric_id: &str) {
        self.cache
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(metric_id));
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The currently cached keys, mainly useful for inspection in tests.
    pub fn keys(&self) -> Vec<String> {
        self.cache.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
