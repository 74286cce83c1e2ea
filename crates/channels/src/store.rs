use std::collections::HashSet;

use {anyhow::Result, async_trait::async_trait};

use crate::model::{DeliveryStatus, Message, ReplyStatus};

/// Persistent storage for inbound messages and their delivery state.
///
/// Status updates are guarded: a row only moves when its current
/// `delivery_status` equals the expected `from`, so concurrent writers can
/// never move a message backwards.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new message. Returns `false` when the id already exists.
    async fn insert(&self, message: &Message) -> Result<bool>;

    async fn get(&self, message_id: &str) -> Result<Option<Message>>;

    /// Up to `limit` undelivered, unprocessed messages for `instance_id`,
    /// oldest first, skipping ids in `exclude`.
    async fn fetch_pending(
        &self,
        instance_id: &str,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Message>>;

    /// Instances that currently have undelivered, unprocessed messages.
    async fn pending_instances(&self) -> Result<Vec<String>>;

    /// Move `ids` from `from` to `to`. Returns how many rows moved.
    ///
    /// `platform_id` is recorded on the rows when given; entering a terminal
    /// state stamps `delivery_time`.
    async fn transition(
        &self,
        ids: &[String],
        from: DeliveryStatus,
        to: DeliveryStatus,
        platform_id: Option<&str>,
        at_ms: u64,
    ) -> Result<u64>;

    /// Record the reply outcome on delivered rows. Rows that are not
    /// delivered are left untouched.
    async fn set_reply(
        &self,
        ids: &[String],
        content: &str,
        status: ReplyStatus,
        at_ms: u64,
    ) -> Result<u64>;

    async fn mark_processed(&self, ids: &[String]) -> Result<u64>;

    /// Mark `primary_id` as the representative of a merged burst.
    async fn record_merge(&self, primary_id: &str, merged_ids: &[String]) -> Result<()>;

    /// Fail every row still in flight, e.g. after an unclean shutdown.
    async fn fail_stale_in_flight(&self, at_ms: u64) -> Result<u64>;

    /// Most recent messages, newest first.
    async fn recent(&self, instance_id: Option<&str>, limit: usize) -> Result<Vec<Message>>;
}

pub(crate) fn check_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<()> {
    if !from.can_transition_to(to) {
        anyhow::bail!("illegal delivery transition {from:?} -> {to:?}");
    }
    Ok(())
}
