use {anyhow::Result, async_trait::async_trait};

use crate::rule::DeliveryRule;

/// Persistent storage for delivery rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules in insertion order.
    async fn list(&self) -> Result<Vec<DeliveryRule>>;

    async fn get(&self, rule_id: &str) -> Result<Option<DeliveryRule>>;

    /// Insert a rule and return it with its assigned `seq`.
    /// Fails when the `rule_id` is taken.
    async fn insert(&self, rule: &DeliveryRule) -> Result<DeliveryRule>;

    /// Replace every field except `seq`. Returns `false` when absent.
    async fn update(&self, rule: &DeliveryRule) -> Result<bool>;

    async fn delete(&self, rule_id: &str) -> Result<bool>;

    async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<bool>;
}
