//! Delivery rules: which platform handles a message from a given
//! instance and conversation.
//!
//! Matching precedence:
//! 1. Enabled rules only
//! 2. Instance pattern (`*` or exact id)
//! 3. Chat pattern (`*`, `regex:`, comma list, exact)
//! 4. Highest priority wins; ties go to the earlier-inserted rule

pub mod engine;
pub mod error;
pub mod rule;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    engine::{CompiledRule, Route, RuleEngine, RuleSnapshot},
    error::{Error, Result},
    rule::{ChatPattern, DeliveryRule},
    store::RuleStore,
    store_memory::InMemoryRuleStore,
    store_sqlite::SqliteRuleStore,
};

/// Run database migrations for the rule store.
///
/// Creates the `delivery_rules` table. Call at startup before using
/// [`SqliteRuleStore`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
