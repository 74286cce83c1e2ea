//! In-memory rule store for tests.

use std::sync::Mutex;

use {anyhow::Result, async_trait::async_trait};

use crate::{rule::DeliveryRule, store::RuleStore};

#[derive(Default)]
pub struct InMemoryRuleStore {
    inner: Mutex<(i64, Vec<DeliveryRule>)>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list(&self) -> Result<Vec<DeliveryRule>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.1.clone())
    }

    async fn get(&self, rule_id: &str) -> Result<Option<DeliveryRule>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.1.iter().find(|r| r.rule_id == rule_id).cloned())
    }

    async fn insert(&self, rule: &DeliveryRule) -> Result<DeliveryRule> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.1.iter().any(|r| r.rule_id == rule.rule_id) {
            anyhow::bail!("rule already exists: {}", rule.rule_id);
        }
        inner.0 += 1;
        let mut stored = rule.clone();
        stored.seq = inner.0;
        inner.1.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, rule: &DeliveryRule) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.1.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(existing) => {
                let seq = existing.seq;
                *existing = rule.clone();
                existing.seq = seq;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn delete(&self, rule_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.1.len();
        inner.1.retain(|r| r.rule_id != rule_id);
        Ok(inner.1.len() != before)
    }

    async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.1.iter_mut().find(|r| r.rule_id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}
