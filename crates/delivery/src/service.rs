//! The delivery pipeline: claim pending messages, route them to a platform,
//! and send any reply back through the [`MessageSender`].
//!
//! Per-unit state machine:
//!
//! ```text
//! PENDING --claim--> IN_FLIGHT --platform ok--> DELIVERED [--reply--> REPLIED | REPLY_FAILED]
//!                        |
//!                        +--no rule / gate / platform error--> FAILED
//! ```

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, RwLock},
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    tokio::{
        sync::{Mutex, Semaphore},
        task::{JoinHandle, JoinSet},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    wxrelay_channels::{DeliveryStatus, MessageStore, PlatformRegistry, ReplyStatus},
    wxrelay_common::{bounded, now_ms},
    wxrelay_config::DeliveryConfig,
    wxrelay_routing::{Route, RuleEngine},
};

#[cfg(feature = "metrics")]
use wxrelay_metrics::{counter, gauge, histogram, labels, delivery as delivery_metrics};

use crate::{
    Result,
    merge::{DeliveryUnit, group_units},
    sender::{MessageSender, SendRequest},
};

/// How a delivery unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Another worker moved the rows first.
    AlreadyClaimed,
    NoRule,
    UnknownPlatform,
    MentionRequired,
    PlatformFailed,
    /// Delivered; the platform had nothing to say back.
    Delivered,
    Replied,
    ReplyFailed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyClaimed => "already_claimed",
            Self::NoRule => "no_rule",
            Self::UnknownPlatform => "unknown_platform",
            Self::MentionRequired => "mention_required",
            Self::PlatformFailed => "platform_failed",
            Self::Delivered => "delivered",
            Self::Replied => "replied",
            Self::ReplyFailed => "reply_failed",
        }
    }
}

type InProgress = Arc<StdMutex<HashSet<String>>>;

/// Holds message ids in the in-progress set until dropped.
struct InProgressGuard {
    set: InProgress,
    ids: Vec<String>,
}

impl InProgressGuard {
    /// Claim every id, or none if any is already taken.
    fn claim(set: &InProgress, ids: &[String]) -> Option<Self> {
        let mut held = set.lock().unwrap_or_else(|e| e.into_inner());
        if ids.iter().any(|id| held.contains(id)) {
            return None;
        }
        held.extend(ids.iter().cloned());
        Some(Self {
            set: Arc::clone(set),
            ids: ids.to_vec(),
        })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            held.remove(id);
        }
    }
}

/// Sleep for `period` unless cancelled first. Returns `false` on cancel.
async fn sleep_or_cancel(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

pub struct DeliveryPipeline {
    messages: Arc<dyn MessageStore>,
    rules: Arc<RuleEngine>,
    platforms: Arc<PlatformRegistry>,
    sender: Arc<MessageSender>,
    settings: RwLock<DeliveryConfig>,
    in_progress: InProgress,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    cancel: StdMutex<Option<CancellationToken>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryPipeline {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        rules: Arc<RuleEngine>,
        platforms: Arc<PlatformRegistry>,
        sender: Arc<MessageSender>,
        settings: DeliveryConfig,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Arc::new(Self {
            messages,
            rules,
            platforms,
            sender,
            settings: RwLock::new(settings),
            in_progress: Arc::new(StdMutex::new(HashSet::new())),
            permits,
            workers: Mutex::new(JoinSet::new()),
            cancel: StdMutex::new(None),
            poller: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> DeliveryConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap batch, merge and timeout tuning. Concurrency is fixed at
    /// construction.
    pub fn update_settings(&self, settings: DeliveryConfig) {
        info!(
            batch_size = settings.batch_size,
            merge_enabled = settings.merge_enabled,
            "delivery settings updated"
        );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Ids currently being delivered.
    pub fn in_progress(&self) -> HashSet<String> {
        self.in_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Load the rule snapshot and settle rows a previous run left in flight.
    pub async fn initialize(&self) -> Result<()> {
        let rules = self.rules.reload().await?;
        let stale = self.messages.fail_stale_in_flight(now_ms()).await?;
        if stale > 0 {
            warn!(count = stale, "failed messages left in flight by a previous run");
        }
        info!(rules, "delivery pipeline initialised");
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        let token = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!("delivery pipeline already running");
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.poll_loop(token).await });
        *self.poller.lock().await = Some(handle);
        info!("delivery pipeline started");
    }

    /// Stop polling and wait for every in-flight delivery to finish.
    pub async fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(token) = token else {
            return;
        };
        token.cancel();
        if let Some(handle) = self.poller.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "delivery poller ended abnormally");
        }
        self.wait_idle().await;
        info!("delivery pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Wait until every dispatched delivery has finished.
    pub async fn wait_idle(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "delivery worker ended abnormally");
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            match self.poll_once().await {
                Ok(0) => {},
                Ok(dispatched) => debug!(dispatched, "delivery units dispatched"),
                Err(e) => warn!(error = %e, "delivery poll failed"),
            }
            if !sleep_or_cancel(&token, self.settings().poll_interval()).await {
                break;
            }
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────────

    /// Fetch pending messages for every instance and dispatch them to
    /// workers. Returns how many units were dispatched.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let settings = self.settings();
        let mut dispatched = 0;

        for instance_id in self.messages.pending_instances().await? {
            let exclude = self.in_progress();
            let batch = self
                .messages
                .fetch_pending(&instance_id, settings.batch_size, &exclude)
                .await?;
            if batch.is_empty() {
                continue;
            }

            for unit in group_units(batch, settings.merge_enabled, settings.merge_window()) {
                let Some(guard) = InProgressGuard::claim(&self.in_progress, &unit.member_ids)
                else {
                    continue;
                };
                let permit = Arc::clone(&self.permits).acquire_owned().await?;
                let this = Arc::clone(self);
                self.workers.lock().await.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    this.run_unit(unit).await;
                });
                dispatched += 1;
            }
        }

        self.reap().await;
        Ok(dispatched)
    }

    async fn reap(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "delivery worker ended abnormally");
            }
        }
    }

    async fn run_unit(&self, unit: DeliveryUnit) {
        let message_id = unit.message.message_id.clone();
        #[cfg(feature = "metrics")]
        gauge!(delivery_metrics::IN_FLIGHT).increment(1.0);

        match self.process_message(unit).await {
            Ok(outcome) => {
                debug!(%message_id, outcome = outcome.as_str(), "delivery finished");
                #[cfg(feature = "metrics")]
                counter!(delivery_metrics::COMPLETED_TOTAL, labels::OUTCOME => outcome.as_str())
                    .increment(1);
            },
            Err(e) => warn!(%message_id, error = %e, "delivery aborted"),
        }

        #[cfg(feature = "metrics")]
        gauge!(delivery_metrics::IN_FLIGHT).decrement(1.0);
    }

    // ── Per-unit processing ─────────────────────────────────────────────────

    /// Deliver one unit to its platform and send the reply, if any.
    ///
    /// Only store failures surface as errors; every routing or platform
    /// failure ends in a terminal state and an outcome.
    pub async fn process_message(&self, unit: DeliveryUnit) -> Result<DeliveryOutcome> {
        let ids = unit.member_ids.as_slice();
        let message = &unit.message;

        let claimed = self
            .messages
            .transition(
                ids,
                DeliveryStatus::Pending,
                DeliveryStatus::InFlight,
                None,
                now_ms(),
            )
            .await?;
        if claimed == 0 {
            return Ok(DeliveryOutcome::AlreadyClaimed);
        }
        if unit.is_merged() {
            self.messages
                .record_merge(&message.message_id, ids)
                .await?;
            #[cfg(feature = "metrics")]
            counter!(delivery_metrics::MERGED_MESSAGES_TOTAL).increment(ids.len() as u64);
        }

        let rule = match self
            .rules
            .route(&message.instance_id, &message.chat_name, &message.content)
        {
            Route::Matched(rule) => rule,
            Route::NoRule => {
                info!(
                    message_id = %message.message_id,
                    instance_id = %message.instance_id,
                    chat_name = %message.chat_name,
                    "no delivery rule, message failed"
                );
                self.fail(ids, None, false).await?;
                return Ok(DeliveryOutcome::NoRule);
            },
            Route::MentionRequired(rule) => {
                debug!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    "message lacks a required mention"
                );
                self.fail(ids, Some(&rule.platform_id), true).await?;
                return Ok(DeliveryOutcome::MentionRequired);
            },
        };

        let Some(platform) = self.platforms.get(&rule.platform_id) else {
            warn!(
                message_id = %message.message_id,
                rule_id = %rule.rule_id,
                platform_id = %rule.platform_id,
                "rule targets an unknown platform"
            );
            self.fail(ids, None, false).await?;
            return Ok(DeliveryOutcome::UnknownPlatform);
        };

        let started = Instant::now();
        let result = bounded(
            "process_message",
            self.settings().platform_timeout(),
            platform.process_message(message),
        )
        .await;
        #[cfg(feature = "metrics")]
        histogram!(
            delivery_metrics::PLATFORM_DURATION_SECONDS,
            labels::PLATFORM => rule.platform_id.clone()
        )
        .record(started.elapsed().as_secs_f64());

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    platform_id = %rule.platform_id,
                    elapsed_ms = started.elapsed().as_millis(),
                    error = %e,
                    "platform failed to process message"
                );
                self.fail(ids, Some(&rule.platform_id), true).await?;
                return Ok(DeliveryOutcome::PlatformFailed);
            },
        };

        self.messages
            .transition(
                ids,
                DeliveryStatus::InFlight,
                DeliveryStatus::Delivered,
                Some(&rule.platform_id),
                now_ms(),
            )
            .await?;
        info!(
            message_id = %message.message_id,
            rule_id = %rule.rule_id,
            platform_id = %rule.platform_id,
            merged = unit.is_merged(),
            "message delivered"
        );

        let outcome = match reply.sendable() {
            Some(text) => {
                let mentions = if rule.reply_at_sender && !unit.is_merged() {
                    vec![message.sender.clone()]
                } else {
                    Vec::new()
                };
                let request = SendRequest {
                    platform_id: Some(rule.platform_id.clone()),
                    mentions,
                    ..SendRequest::new(&message.instance_id, &message.chat_name, text)
                };
                let sent = self.sender.send(&request).await;
                let (status, outcome) = if sent.ok {
                    (ReplyStatus::Replied, DeliveryOutcome::Replied)
                } else {
                    (ReplyStatus::Failed, DeliveryOutcome::ReplyFailed)
                };
                self.messages
                    .set_reply(ids, text, status, now_ms())
                    .await?;
                outcome
            },
            None => DeliveryOutcome::Delivered,
        };

        self.messages.mark_processed(ids).await?;
        Ok(outcome)
    }

    async fn fail(&self, ids: &[String], platform_id: Option<&str>, processed: bool) -> Result<()> {
        self.messages
            .transition(
                ids,
                DeliveryStatus::InFlight,
                DeliveryStatus::Failed,
                platform_id,
                now_ms(),
            )
            .await?;
        if processed {
            self.messages.mark_processed(ids).await?;
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_guard_is_all_or_nothing() {
        let set: InProgress = Arc::new(StdMutex::new(HashSet::new()));
        let first = InProgressGuard::claim(&set, &["a".into(), "b".into()]).unwrap();
        assert!(InProgressGuard::claim(&set, &["b".into(), "c".into()]).is_none());
        assert!(!set.lock().unwrap().contains("c"));

        drop(first);
        assert!(set.lock().unwrap().is_empty());
        assert!(InProgressGuard::claim(&set, &["b".into(), "c".into()]).is_some());
    }

    #[test]
    fn outcome_labels_are_snake_case() {
        assert_eq!(DeliveryOutcome::MentionRequired.as_str(), "mention_required");
        assert_eq!(
            serde_json::to_value(DeliveryOutcome::ReplyFailed).unwrap(),
            serde_json::json!("reply_failed")
        );
    }
}
