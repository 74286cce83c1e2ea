use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::{endpoint::Endpoint, platform::Platform};

/// Id-keyed set of shared handles, replaceable at runtime.
pub struct Registry<T: ?Sized> {
    items: RwLock<BTreeMap<String, Arc<T>>>,
}

pub type EndpointRegistry = Registry<dyn Endpoint>;
pub type PlatformRegistry = Registry<dyn Platform>;

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`. Returns the replaced handle.
    pub fn insert(&self, id: impl Into<String>, item: Arc<T>) -> Option<Arc<T>> {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), item)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<String> {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of every entry, ordered by id.
    pub fn all(&self) -> Vec<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry<dyn Endpoint> {
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) {
        let id = endpoint.instance_id().to_string();
        tracing::debug!(instance_id = %id, "endpoint registered");
        self.insert(id, endpoint);
    }
}

impl Registry<dyn Platform> {
    pub fn register(&self, platform: Arc<dyn Platform>) {
        let id = platform.id().to_string();
        tracing::debug!(platform_id = %id, "platform registered");
        self.insert(id, platform);
    }
}
