//! SQLite-backed rule store using sqlx.

use {
    anyhow::Result,
    async_trait::async_trait,
    sqlx::SqlitePool,
    wxrelay_channels::parse_at_names,
    wxrelay_common::now_ms,
};

use crate::{rule::DeliveryRule, store::RuleStore};

pub struct SqliteRuleStore {
    pool: SqlitePool,
}

impl SqliteRuleStore {
    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    rule_id: String,
    name: String,
    instance_id: String,
    chat_pattern: String,
    platform_id: String,
    priority: i64,
    enabled: bool,
    only_at_messages: bool,
    at_name: String,
    reply_at_sender: bool,
}

impl From<RuleRow> for DeliveryRule {
    fn from(r: RuleRow) -> Self {
        Self {
            seq: r.id,
            rule_id: r.rule_id,
            name: r.name,
            instance_id: r.instance_id,
            chat_pattern: r.chat_pattern,
            platform_id: r.platform_id,
            priority: r.priority,
            enabled: r.enabled,
            only_at_messages: r.only_at_messages,
            at_names: parse_at_names(&r.at_name),
            reply_at_sender: r.reply_at_sender,
        }
    }
}

const SELECT: &str = "SELECT id, rule_id, name, instance_id, chat_pattern, platform_id, priority, \
                      enabled, only_at_messages, at_name, reply_at_sender FROM delivery_rules";

fn stamp() -> i64 {
    i64::try_from(now_ms()).unwrap_or(i64::MAX)
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn list(&self) -> Result<Vec<DeliveryRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!("{SELECT} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(DeliveryRule::from).collect())
    }

    async fn get(&self, rule_id: &str) -> Result<Option<DeliveryRule>> {
        let row = sqlx::query_as::<_, RuleRow>(&format!("{SELECT} WHERE rule_id = ?"))
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DeliveryRule::from))
    }

    async fn insert(&self, rule: &DeliveryRule) -> Result<DeliveryRule> {
        let now = stamp();
        let result = sqlx::query(
            "INSERT INTO delivery_rules
             (rule_id, name, instance_id, chat_pattern, platform_id, priority, enabled,
              only_at_messages, at_name, reply_at_sender, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.rule_id)
        .bind(&rule.name)
        .bind(&rule.instance_id)
        .bind(&rule.chat_pattern)
        .bind(&rule.platform_id)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.only_at_messages)
        .bind(rule.at_names_joined())
        .bind(rule.reply_at_sender)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let mut stored = rule.clone();
        stored.seq = result.last_insert_rowid();
        Ok(stored)
    }

    async fn update(&self, rule: &DeliveryRule) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_rules SET
                name = ?, instance_id = ?, chat_pattern = ?, platform_id = ?, priority = ?,
                enabled = ?, only_at_messages = ?, at_name = ?, reply_at_sender = ?,
                updated_at = ?
             WHERE rule_id = ?",
        )
        .bind(&rule.name)
        .bind(&rule.instance_id)
        .bind(&rule.chat_pattern)
        .bind(&rule.platform_id)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.only_at_messages)
        .bind(rule.at_names_joined())
        .bind(rule.reply_at_sender)
        .bind(stamp())
        .bind(&rule.rule_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, rule_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM delivery_rules WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE delivery_rules SET enabled = ?, updated_at = ? WHERE rule_id = ?")
                .bind(enabled)
                .bind(stamp())
                .bind(rule_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
