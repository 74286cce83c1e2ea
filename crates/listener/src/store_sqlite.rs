//! SQLite-backed listener store using sqlx.

use {anyhow::Result, async_trait::async_trait, sqlx::SqlitePool, wxrelay_common::now_ms};

use crate::{
    model::{FixedListener, ListenerSubscription},
    store::ListenerStore,
};

pub struct SqliteListenerStore {
    pool: SqlitePool,
}

impl SqliteListenerStore {
    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ListenerRow {
    instance_id: String,
    who: String,
    last_message_time: i64,
    last_check_time: i64,
    conversation_id: Option<String>,
    manual_added: bool,
    fixed_listener: bool,
    reset_attempts: i64,
    status: i64,
}

impl From<ListenerRow> for ListenerSubscription {
    fn from(r: ListenerRow) -> Self {
        Self {
            instance_id: r.instance_id,
            who: r.who,
            last_message_at_ms: to_ms(r.last_message_time),
            last_checked_at_ms: to_ms(r.last_check_time),
            active: r.status == 1,
            marked_for_removal: false,
            manually_added: r.manual_added,
            fixed_listener: r.fixed_listener,
            reset_attempts: u32::try_from(r.reset_attempts).unwrap_or_default(),
            conversation_id: r.conversation_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FixedRow {
    session_name: String,
    enabled: bool,
    description: String,
}

impl From<FixedRow> for FixedListener {
    fn from(r: FixedRow) -> Self {
        Self {
            session_name: r.session_name,
            enabled: r.enabled,
            description: r.description,
        }
    }
}

fn to_ms(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ListenerStore for SqliteListenerStore {
    async fn load_all(&self) -> Result<Vec<ListenerSubscription>> {
        let rows = sqlx::query_as::<_, ListenerRow>(
            "SELECT instance_id, who, last_message_time, last_check_time, conversation_id,
                    manual_added, fixed_listener, reset_attempts, status
             FROM listeners ORDER BY instance_id, who",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ListenerSubscription::from).collect())
    }

    async fn upsert(&self, sub: &ListenerSubscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO listeners
             (instance_id, who, last_message_time, last_check_time, conversation_id,
              manual_added, fixed_listener, reset_attempts, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(instance_id, who) DO UPDATE SET
                last_message_time = excluded.last_message_time,
                last_check_time   = excluded.last_check_time,
                conversation_id   = excluded.conversation_id,
                manual_added      = excluded.manual_added,
                fixed_listener    = excluded.fixed_listener,
                reset_attempts    = excluded.reset_attempts,
                status            = excluded.status",
        )
        .bind(&sub.instance_id)
        .bind(&sub.who)
        .bind(to_db(sub.last_message_at_ms))
        .bind(to_db(sub.last_checked_at_ms))
        .bind(&sub.conversation_id)
        .bind(sub.manually_added)
        .bind(sub.fixed_listener)
        .bind(i64::from(sub.reset_attempts))
        .bind(i64::from(sub.active))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str, who: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM listeners WHERE instance_id = ? AND who = ?")
            .bind(instance_id)
            .bind(who)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_fixed(&self) -> Result<Vec<FixedListener>> {
        let rows = sqlx::query_as::<_, FixedRow>(
            "SELECT session_name, enabled, description FROM fixed_listeners ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FixedListener::from).collect())
    }

    async fn insert_fixed(&self, fixed: &FixedListener) -> Result<bool> {
        let now = to_db(now_ms());
        let result = sqlx::query(
            "INSERT INTO fixed_listeners (session_name, enabled, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_name) DO NOTHING",
        )
        .bind(&fixed.session_name)
        .bind(fixed.enabled)
        .bind(&fixed.description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_fixed(&self, fixed: &FixedListener) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE fixed_listeners SET enabled = ?, description = ?, updated_at = ?
             WHERE session_name = ?",
        )
        .bind(fixed.enabled)
        .bind(&fixed.description)
        .bind(to_db(now_ms()))
        .bind(&fixed.session_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_fixed(&self, session_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM fixed_listeners WHERE session_name = ?")
            .bind(session_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
