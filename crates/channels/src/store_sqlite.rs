//! SQLite-backed message store using sqlx.

use std::collections::HashSet;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    sqlx::{QueryBuilder, Sqlite, SqlitePool},
};

use crate::{
    model::{DeliveryStatus, Message, ReplyStatus},
    store::{MessageStore, check_transition},
};

const COLUMNS: &str = "message_id, instance_id, chat_name, sender, sender_remark, content, \
                       message_type, create_time, processed, delivery_status, delivery_time, \
                       platform_id, reply_content, reply_status, reply_time, merged, \
                       merged_count, merged_ids, local_file_path";

/// SQLite-backed persistence for inbound messages.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Create a store using an existing pool (migrations must already be run).
    ///
    /// Call [`crate::run_migrations`] before using this constructor.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    message_id: String,
    instance_id: String,
    chat_name: String,
    sender: String,
    sender_remark: Option<String>,
    content: String,
    message_type: String,
    create_time: i64,
    processed: bool,
    delivery_status: i64,
    delivery_time: Option<i64>,
    platform_id: Option<String>,
    reply_content: Option<String>,
    reply_status: i64,
    reply_time: Option<i64>,
    merged: bool,
    merged_count: i64,
    merged_ids: String,
    local_file_path: Option<String>,
}

fn to_ms(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(r: MessageRow) -> Result<Self> {
        let delivery_status = DeliveryStatus::from_i64(r.delivery_status)
            .with_context(|| format!("bad delivery_status {}", r.delivery_status))?;
        let reply_status = ReplyStatus::from_i64(r.reply_status)
            .with_context(|| format!("bad reply_status {}", r.reply_status))?;
        let merged_ids: Vec<String> = serde_json::from_str(&r.merged_ids)
            .with_context(|| format!("bad merged_ids for {}", r.message_id))?;
        Ok(Self {
            message_id: r.message_id,
            instance_id: r.instance_id,
            chat_name: r.chat_name,
            sender: r.sender,
            sender_remark: r.sender_remark,
            content: r.content,
            message_type: r.message_type,
            create_time_ms: to_ms(r.create_time),
            processed: r.processed,
            delivery_status,
            delivery_time_ms: r.delivery_time.map(to_ms),
            platform_id: r.platform_id,
            reply_content: r.reply_content,
            reply_status,
            reply_time_ms: r.reply_time.map(to_ms),
            merged: r.merged,
            merged_count: u32::try_from(r.merged_count).unwrap_or_default(),
            merged_ids,
            local_file_path: r.local_file_path,
        })
    }
}

fn collect(rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    rows.into_iter().map(Message::try_from).collect()
}

/// Append `(?, ?, ...)` binding every id.
fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    qb.push("(");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.clone());
    }
    sep.push_unseparated(")");
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, m: &Message) -> Result<bool> {
        let merged_ids = serde_json::to_string(&m.merged_ids)?;
        let result = sqlx::query(&format!(
            "INSERT INTO messages ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING"
        ))
        .bind(&m.message_id)
        .bind(&m.instance_id)
        .bind(&m.chat_name)
        .bind(&m.sender)
        .bind(&m.sender_remark)
        .bind(&m.content)
        .bind(&m.message_type)
        .bind(to_db(m.create_time_ms))
        .bind(m.processed)
        .bind(m.delivery_status.as_i64())
        .bind(m.delivery_time_ms.map(to_db))
        .bind(&m.platform_id)
        .bind(&m.reply_content)
        .bind(m.reply_status.as_i64())
        .bind(m.reply_time_ms.map(to_db))
        .bind(m.merged)
        .bind(i64::from(m.merged_count))
        .bind(&merged_ids)
        .bind(&m.local_file_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM messages WHERE message_id = ?"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn fetch_pending(
        &self,
        instance_id: &str,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Message>> {
        // Over-fetch by the exclusion size so excluded rows cannot starve the batch.
        let window = i64::try_from(limit.saturating_add(exclude.len())).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE instance_id = ? AND processed = 0 AND delivery_status = 0
             ORDER BY create_time ASC, id ASC
             LIMIT ?"
        ))
        .bind(instance_id)
        .bind(window)
        .fetch_all(&self.pool)
        .await?;
        Ok(collect(rows)?
            .into_iter()
            .filter(|m| !exclude.contains(&m.message_id))
            .take(limit)
            .collect())
    }

    async fn pending_instances(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT instance_id FROM messages
             WHERE processed = 0 AND delivery_status = 0
             ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn transition(
        &self,
        ids: &[String],
        from: DeliveryStatus,
        to: DeliveryStatus,
        platform_id: Option<&str>,
        at_ms: u64,
    ) -> Result<u64> {
        check_transition(from, to)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET delivery_status = ");
        qb.push_bind(to.as_i64());
        if let Some(p) = platform_id {
            qb.push(", platform_id = ").push_bind(p.to_string());
        }
        if to.is_terminal() {
            qb.push(", delivery_time = ").push_bind(to_db(at_ms));
        }
        qb.push(" WHERE delivery_status = ")
            .push_bind(from.as_i64())
            .push(" AND message_id IN ");
        push_id_list(&mut qb, ids);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn set_reply(
        &self,
        ids: &[String],
        content: &str,
        status: ReplyStatus,
        at_ms: u64,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET reply_content = ");
        qb.push_bind(content.to_string())
            .push(", reply_status = ")
            .push_bind(status.as_i64())
            .push(", reply_time = ")
            .push_bind(to_db(at_ms))
            .push(" WHERE delivery_status = ")
            .push_bind(DeliveryStatus::Delivered.as_i64())
            .push(" AND message_id IN ");
        push_id_list(&mut qb, ids);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn mark_processed(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE messages SET processed = 1 WHERE processed = 0 AND message_id IN ",
        );
        push_id_list(&mut qb, ids);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn record_merge(&self, primary_id: &str, merged_ids: &[String]) -> Result<()> {
        let encoded = serde_json::to_string(merged_ids)?;
        let result = sqlx::query(
            "UPDATE messages SET merged = 1, merged_count = ?, merged_ids = ?
             WHERE message_id = ?",
        )
        .bind(i64::try_from(merged_ids.len()).unwrap_or(i64::MAX))
        .bind(&encoded)
        .bind(primary_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("message not found: {primary_id}");
        }
        Ok(())
    }

    async fn fail_stale_in_flight(&self, at_ms: u64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET delivery_status = ?, delivery_time = ?
             WHERE delivery_status = ?",
        )
        .bind(DeliveryStatus::Failed.as_i64())
        .bind(to_db(at_ms))
        .bind(DeliveryStatus::InFlight.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent(&self, instance_id: Option<&str>, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match instance_id {
            Some(instance) => {
                sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {COLUMNS} FROM messages WHERE instance_id = ?
                     ORDER BY create_time DESC, id DESC LIMIT ?"
                ))
                .bind(instance)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {COLUMNS} FROM messages ORDER BY create_time DESC, id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            },
        };
        collect(rows)
    }
}
