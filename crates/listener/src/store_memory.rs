//! In-memory listener store for tests.

use std::{collections::BTreeMap, sync::Mutex};

use {anyhow::Result, async_trait::async_trait};

use crate::{
    model::{FixedListener, ListenerKey, ListenerSubscription},
    store::ListenerStore,
};

#[derive(Default)]
pub struct InMemoryListenerStore {
    subs: Mutex<BTreeMap<ListenerKey, ListenerSubscription>>,
    fixed: Mutex<Vec<FixedListener>>,
}

impl InMemoryListenerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListenerStore for InMemoryListenerStore {
    async fn load_all(&self) -> Result<Vec<ListenerSubscription>> {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(subs.values().cloned().collect())
    }

    async fn upsert(&self, sub: &ListenerSubscription) -> Result<()> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(sub.key(), sub.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str, who: &str) -> Result<bool> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(subs
            .remove(&(instance_id.to_string(), who.to_string()))
            .is_some())
    }

    async fn list_fixed(&self) -> Result<Vec<FixedListener>> {
        Ok(self.fixed.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn insert_fixed(&self, fixed: &FixedListener) -> Result<bool> {
        let mut all = self.fixed.lock().unwrap_or_else(|e| e.into_inner());
        if all.iter().any(|f| f.session_name == fixed.session_name) {
            return Ok(false);
        }
        all.push(fixed.clone());
        Ok(true)
    }

    async fn update_fixed(&self, fixed: &FixedListener) -> Result<bool> {
        let mut all = self.fixed.lock().unwrap_or_else(|e| e.into_inner());
        match all.iter_mut().find(|f| f.session_name == fixed.session_name) {
            Some(existing) => {
                *existing = fixed.clone();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn delete_fixed(&self, session_name: &str) -> Result<bool> {
        let mut all = self.fixed.lock().unwrap_or_else(|e| e.into_inner());
        let before = all.len();
        all.retain(|f| f.session_name != session_name);
        Ok(all.len() != before)
    }
}
