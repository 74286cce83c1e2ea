//! Rule matching over an immutable, atomically swapped snapshot.
//!
//! Readers clone an `Arc<RuleSnapshot>` and never block a reload. Every
//! mutation goes through the store first, then rebuilds the snapshot and
//! publishes a config change so other services can react.

use std::{
    cmp::Reverse,
    sync::{Arc, RwLock},
};

use {
    serde_json::json,
    tracing::{debug, info, warn},
    wxrelay_channels::at_mention_gate,
    wxrelay_common::{ConfigChangeKind, ConfigNotifier},
    wxrelay_config::RuleSeed,
};

#[cfg(feature = "metrics")]
use wxrelay_metrics::{counter, gauge, routing as routing_metrics};

use crate::{
    Error, Result,
    rule::{ChatPattern, DeliveryRule},
    store::RuleStore,
};

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: DeliveryRule,
    pub chat: ChatPattern,
}

/// Enabled rules ordered by descending priority, then insertion order.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub rules: Vec<CompiledRule>,
}

impl RuleSnapshot {
    pub fn build(rules: Vec<DeliveryRule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.enabled)
            .map(|rule| {
                let chat = ChatPattern::parse(&rule.chat_pattern);
                if chat.is_invalid() {
                    warn!(
                        rule_id = %rule.rule_id,
                        pattern = %rule.chat_pattern,
                        "invalid chat pattern regex, rule will never match"
                    );
                }
                CompiledRule { rule, chat }
            })
            .collect();
        compiled.sort_by_key(|c| (Reverse(c.rule.priority), c.rule.seq));
        Self { rules: compiled }
    }

    pub fn find(&self, instance_id: &str, chat_name: &str) -> Option<&DeliveryRule> {
        self.rules
            .iter()
            .find(|c| c.rule.matches_instance(instance_id) && c.chat.matches(chat_name))
            .map(|c| &c.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Matched(DeliveryRule),
    /// A rule matched but requires an @-mention the content lacks.
    MentionRequired(DeliveryRule),
    NoRule,
}

pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    notifier: Option<Arc<ConfigNotifier>>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<ConfigNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Rebuild the snapshot from the store. Returns the number of enabled rules.
    pub async fn reload(&self) -> Result<usize> {
        let rules = self.store.list().await?;
        let snapshot = Arc::new(RuleSnapshot::build(rules));
        let count = snapshot.len();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        info!(count, "delivery rules loaded");

        #[cfg(feature = "metrics")]
        {
            counter!(routing_metrics::RELOADS_TOTAL).increment(1);
            gauge!(routing_metrics::RULES_LOADED).set(count as f64);
        }

        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Highest-priority enabled rule for the conversation, ignoring mention gating.
    pub fn match_rule(&self, instance_id: &str, chat_name: &str) -> Option<DeliveryRule> {
        self.snapshot().find(instance_id, chat_name).cloned()
    }

    /// Match a rule and apply its @-mention gate to `content`.
    pub fn route(&self, instance_id: &str, chat_name: &str, content: &str) -> Route {
        let Some(rule) = self.match_rule(instance_id, chat_name) else {
            debug!(instance_id, chat_name, "no delivery rule matched");
            return Route::NoRule;
        };
        if at_mention_gate(content, rule.only_at_messages, &rule.at_names) {
            Route::Matched(rule)
        } else {
            Route::MentionRequired(rule)
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn get_all_rules(&self) -> Result<Vec<DeliveryRule>> {
        Ok(self.store.list().await?)
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Option<DeliveryRule>> {
        Ok(self.store.get(rule_id).await?)
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    pub async fn add_rule(&self, rule: DeliveryRule) -> Result<DeliveryRule> {
        rule.validate()?;
        if self.store.get(&rule.rule_id).await?.is_some() {
            return Err(Error::Duplicate {
                rule_id: rule.rule_id,
            });
        }
        let stored = self.store.insert(&rule).await?;
        self.after_change(ConfigChangeKind::RuleAdded, &stored.rule_id)
            .await?;
        Ok(stored)
    }

    pub async fn update_rule(&self, rule: DeliveryRule) -> Result<()> {
        rule.validate()?;
        if !self.store.update(&rule).await? {
            return Err(Error::not_found(rule.rule_id));
        }
        self.after_change(ConfigChangeKind::RuleUpdated, &rule.rule_id)
            .await
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        if !self.store.delete(rule_id).await? {
            return Err(Error::not_found(rule_id));
        }
        self.after_change(ConfigChangeKind::RuleDeleted, rule_id)
            .await
    }

    pub async fn enable_rule(&self, rule_id: &str, enabled: bool) -> Result<()> {
        if !self.store.set_enabled(rule_id, enabled).await? {
            return Err(Error::not_found(rule_id));
        }
        self.after_change(ConfigChangeKind::RuleUpdated, rule_id)
            .await
    }

    /// Insert seeds whose `rule_id` is not yet stored. Existing rules are
    /// left untouched so runtime edits survive restarts.
    pub async fn seed(&self, seeds: &[RuleSeed]) -> Result<usize> {
        let mut inserted = 0;
        for seed in seeds {
            let rule = DeliveryRule::from(seed);
            if let Err(e) = rule.validate() {
                warn!(rule_id = %seed.rule_id, error = %e, "skipping rule seed");
                continue;
            }
            if self.store.get(&rule.rule_id).await?.is_some() {
                continue;
            }
            self.store.insert(&rule).await?;
            inserted += 1;
        }
        if inserted > 0 {
            info!(inserted, "seeded delivery rules from config");
        }
        self.reload().await?;
        Ok(inserted)
    }

    async fn after_change(&self, kind: ConfigChangeKind, rule_id: &str) -> Result<()> {
        self.reload().await?;
        if let Some(notifier) = &self.notifier {
            notifier.notify(kind, json!({ "rule_id": rule_id })).await;
        }
        Ok(())
    }
}
