//! In-memory message store for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use {anyhow::Result, async_trait::async_trait};

use crate::{
    model::{DeliveryStatus, Message, ReplyStatus},
    store::{MessageStore, check_transition},
};

#[derive(Default)]
struct Inner {
    seq: u64,
    rows: HashMap<String, (u64, Message)>,
}

/// Message store backed by a `HashMap`, keeping insertion order for ties.
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: Mutex<Inner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, ids: &[String], mut f: F) -> u64
    where
        F: FnMut(&mut Message) -> bool,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for id in ids {
            if let Some((_, msg)) = inner.rows.get_mut(id)
                && f(msg)
            {
                changed += 1;
            }
        }
        changed
    }

    fn sorted(&self, filter: impl Fn(&Message) -> bool) -> Vec<(u64, Message)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<(u64, Message)> = inner
            .rows
            .values()
            .filter(|(_, m)| filter(m))
            .cloned()
            .collect();
        rows.sort_by_key(|(seq, m)| (m.create_time_ms, *seq));
        rows
    }
}

fn is_pending(m: &Message) -> bool {
    !m.processed && m.delivery_status == DeliveryStatus::Pending
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: &Message) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.rows.contains_key(&message.message_id) {
            return Ok(false);
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .rows
            .insert(message.message_id.clone(), (seq, message.clone()));
        Ok(true)
    }

    async fn get(&self, message_id: &str) -> Result<Option<Message>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.rows.get(message_id).map(|(_, m)| m.clone()))
    }

    async fn fetch_pending(
        &self,
        instance_id: &str,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Message>> {
        Ok(self
            .sorted(|m| {
                m.instance_id == instance_id && is_pending(m) && !exclude.contains(&m.message_id)
            })
            .into_iter()
            .take(limit)
            .map(|(_, m)| m)
            .collect())
    }

    async fn pending_instances(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .sorted(is_pending)
            .into_iter()
            .map(|(_, m)| m.instance_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
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
        Ok(self.update(ids, |m| {
            if m.delivery_status != from {
                return false;
            }
            m.delivery_status = to;
            if let Some(p) = platform_id {
                m.platform_id = Some(p.to_string());
            }
            if to.is_terminal() {
                m.delivery_time_ms = Some(at_ms);
            }
            true
        }))
    }

    async fn set_reply(
        &self,
        ids: &[String],
        content: &str,
        status: ReplyStatus,
        at_ms: u64,
    ) -> Result<u64> {
        Ok(self.update(ids, |m| {
            if m.delivery_status != DeliveryStatus::Delivered {
                return false;
            }
            m.reply_content = Some(content.to_string());
            m.reply_status = status;
            m.reply_time_ms = Some(at_ms);
            true
        }))
    }

    async fn mark_processed(&self, ids: &[String]) -> Result<u64> {
        Ok(self.update(ids, |m| {
            let changed = !m.processed;
            m.processed = true;
            changed
        }))
    }

    async fn record_merge(&self, primary_id: &str, merged_ids: &[String]) -> Result<()> {
        let changed = self.update(&[primary_id.to_string()], |m| {
            m.merged = true;
            m.merged_count = u32::try_from(merged_ids.len()).unwrap_or(u32::MAX);
            m.merged_ids = merged_ids.to_vec();
            true
        });
        if changed == 0 {
            anyhow::bail!("message not found: {primary_id}");
        }
        Ok(())
    }

    async fn fail_stale_in_flight(&self, at_ms: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for (_, m) in inner.rows.values_mut() {
            if m.delivery_status == DeliveryStatus::InFlight {
                m.delivery_status = DeliveryStatus::Failed;
                m.delivery_time_ms = Some(at_ms);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn recent(&self, instance_id: Option<&str>, limit: usize) -> Result<Vec<Message>> {
        let mut rows = self.sorted(|m| instance_id.is_none_or(|i| m.instance_id == i));
        rows.reverse();
        Ok(rows.into_iter().take(limit).map(|(_, m)| m).collect())
    }
}
