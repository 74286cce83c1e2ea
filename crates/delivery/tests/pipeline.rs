#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    wxrelay_channels::{
        DeliveryStatus, EchoGuard, Endpoint, EndpointRegistry, FetchOptions, InMemoryMessageStore,
        Message, MessageStore, Platform, PlatformRegistry, PlatformReply, RawMessage, ReplyStatus,
        SendOptions, SendOutcome,
    },
    wxrelay_common::now_ms,
    wxrelay_config::{DeliveryConfig, SenderConfig},
    wxrelay_delivery::{DeliveryOutcome, DeliveryPipeline, DeliveryUnit, MessageSender},
    wxrelay_listener::PauseGate,
    wxrelay_routing::{DeliveryRule, InMemoryRuleStore, RuleEngine},
};

// ── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingEndpoint {
    reject_sends: AtomicBool,
    sent: Mutex<Vec<(String, String, Vec<String>)>>,
}

#[async_trait]
impl Endpoint for RecordingEndpoint {
    fn instance_id(&self) -> &str {
        "wx1"
    }

    async fn initialize(&self) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn health_check(&self) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn fetch_unread(&self, _opts: &FetchOptions) -> wxrelay_channels::Result<Vec<RawMessage>> {
        Ok(Vec::new())
    }

    async fn add_listener(&self, _who: &str, _opts: &FetchOptions) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn remove_listener(&self, _who: &str) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn fetch_all_listener_messages(
        &self,
    ) -> wxrelay_channels::Result<HashMap<String, Vec<RawMessage>>> {
        Ok(HashMap::new())
    }

    async fn fetch_listener_messages(&self, _who: &str) -> wxrelay_channels::Result<Vec<RawMessage>> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        who: &str,
        text: &str,
        opts: &SendOptions,
    ) -> wxrelay_channels::Result<SendOutcome> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Ok(SendOutcome::failed("chat window closed"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((who.into(), text.into(), opts.mentions.clone()));
        Ok(SendOutcome::ok())
    }
}

/// Replies `re: <content>`.
struct EchoBot;

#[async_trait]
impl Platform for EchoBot {
    fn id(&self) -> &str {
        "bot"
    }

    async fn process_message(&self, message: &Message) -> wxrelay_channels::Result<PlatformReply> {
        Ok(PlatformReply::text(format!("re: {}", message.content)))
    }
}

/// Accepts everything, never replies.
struct Sink;

#[async_trait]
impl Platform for Sink {
    fn id(&self) -> &str {
        "sink"
    }

    async fn process_message(&self, _message: &Message) -> wxrelay_channels::Result<PlatformReply> {
        Ok(PlatformReply::none())
    }
}

struct Broken;

#[async_trait]
impl Platform for Broken {
    fn id(&self) -> &str {
        "broken"
    }

    async fn process_message(&self, _message: &Message) -> wxrelay_channels::Result<PlatformReply> {
        Err(wxrelay_channels::Error::unavailable("upstream 502"))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    messages: Arc<InMemoryMessageStore>,
    rules: Arc<RuleEngine>,
    endpoint: Arc<RecordingEndpoint>,
    echo: Arc<EchoGuard>,
    pipeline: Arc<DeliveryPipeline>,
}

impl Harness {
    fn new(settings: DeliveryConfig) -> Self {
        let messages = Arc::new(InMemoryMessageStore::new());
        let rules = Arc::new(RuleEngine::new(Arc::new(InMemoryRuleStore::new())));
        let endpoint = Arc::new(RecordingEndpoint::default());
        let endpoints = Arc::new(EndpointRegistry::new());
        endpoints.register(Arc::clone(&endpoint) as Arc<dyn Endpoint>);
        let platforms = Arc::new(PlatformRegistry::new());
        platforms.register(Arc::new(EchoBot));
        platforms.register(Arc::new(Sink));
        platforms.register(Arc::new(Broken));
        let echo = Arc::new(EchoGuard::default());
        let sender = Arc::new(MessageSender::new(
            endpoints,
            Arc::clone(&platforms),
            PauseGate::new(),
            Arc::clone(&echo),
            SenderConfig {
                max_retries: 0,
                retry_backoff_ms: 0,
                ..Default::default()
            },
        ));
        let pipeline = DeliveryPipeline::new(
            Arc::clone(&messages) as Arc<dyn MessageStore>,
            Arc::clone(&rules),
            platforms,
            sender,
            settings,
        );
        Self {
            messages,
            rules,
            endpoint,
            echo,
            pipeline,
        }
    }

    async fn rule(&self, rule: DeliveryRule) {
        self.rules.add_rule(rule).await.unwrap();
    }

    async fn insert(&self, id: &str, chat: &str, sender: &str, content: &str, at: u64) {
        let message = Message::new(id, "wx1", chat, sender, content, at);
        assert!(self.messages.insert(&message).await.unwrap());
    }

    async fn get(&self, id: &str) -> Message {
        self.messages.get(id).await.unwrap().unwrap()
    }

    async fn drain(&self) -> usize {
        let dispatched = self.pipeline.poll_once().await.unwrap();
        self.pipeline.wait_idle().await;
        dispatched
    }
}

fn merging() -> DeliveryConfig {
    DeliveryConfig {
        merge_enabled: true,
        merge_window_secs: 60,
        ..Default::default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reply_is_sent_with_sender_mention_and_remembered() {
    let h = Harness::new(DeliveryConfig::default());
    let mut rule = DeliveryRule::new("family", "Family", "bot", 10);
    rule.reply_at_sender = true;
    h.rule(rule).await;
    h.insert("wx1:1", "Family", "alice", "dinner?", 1_000).await;

    assert_eq!(h.drain().await, 1);

    let stored = h.get("wx1:1").await;
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(stored.platform_id.as_deref(), Some("bot"));
    assert_eq!(stored.reply_status, ReplyStatus::Replied);
    assert_eq!(stored.reply_content.as_deref(), Some("re: dinner?"));
    assert!(stored.processed);

    let sent = h.endpoint.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![(
        "Family".to_string(),
        "re: dinner?".to_string(),
        vec!["alice".to_string()]
    )]);
    assert!(h.echo.is_echo("wx1", "Family", "re: dinner?", now_ms()));
    assert!(h.pipeline.in_progress().is_empty());
}

#[tokio::test]
async fn unmatched_message_fails_and_is_not_retried() {
    let h = Harness::new(DeliveryConfig::default());
    h.rule(DeliveryRule::new("family", "Family", "bot", 10)).await;
    h.insert("wx1:1", "Strangers", "bob", "hi", 1_000).await;

    assert_eq!(h.drain().await, 1);
    let stored = h.get("wx1:1").await;
    assert_eq!(stored.delivery_status, DeliveryStatus::Failed);
    assert!(!stored.processed);

    assert_eq!(h.drain().await, 0);
    assert!(h.endpoint.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn burst_is_merged_into_one_delivery() {
    let h = Harness::new(merging());
    let mut rule = DeliveryRule::new("family", "Family", "bot", 10);
    rule.reply_at_sender = true;
    h.rule(rule).await;
    h.insert("wx1:1", "Family", "alice", "one", 1_000).await;
    h.insert("wx1:2", "Family", "bob", "two", 2_000).await;
    h.insert("wx1:3", "Family", "alice", "three", 3_000).await;

    assert_eq!(h.drain().await, 1);

    let primary = h.get("wx1:1").await;
    assert!(primary.merged);
    assert_eq!(primary.merged_count, 3);
    assert_eq!(primary.merged_ids, vec!["wx1:1", "wx1:2", "wx1:3"]);
    for id in ["wx1:1", "wx1:2", "wx1:3"] {
        let m = h.get(id).await;
        assert_eq!(m.delivery_status, DeliveryStatus::Delivered, "{id}");
        assert!(m.processed, "{id}");
    }

    let sent = h.endpoint.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "re: alice: one\nbob: two\nalice: three");
    assert!(sent[0].2.is_empty(), "merged replies mention nobody");
}

#[tokio::test]
async fn bursts_outside_the_window_stay_separate() {
    let h = Harness::new(merging());
    h.rule(DeliveryRule::new("family", "Family", "sink", 10)).await;
    h.insert("wx1:1", "Family", "alice", "one", 0).await;
    h.insert("wx1:2", "Family", "alice", "two", 120_000).await;

    assert_eq!(h.drain().await, 2);
    assert!(!h.get("wx1:1").await.merged);
    assert_eq!(h.get("wx1:2").await.delivery_status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn missing_mention_fails_and_settles() {
    let h = Harness::new(DeliveryConfig::default());
    let mut rule = DeliveryRule::new("group", "Team", "bot", 10);
    rule.only_at_messages = true;
    rule.at_names = vec!["helper".into()];
    h.rule(rule).await;
    h.insert("wx1:1", "Team", "carol", "anyone around?", 1_000).await;
    h.insert("wx1:2", "Team", "carol", "@helper status", 2_000).await;

    assert_eq!(h.drain().await, 2);

    let ignored = h.get("wx1:1").await;
    assert_eq!(ignored.delivery_status, DeliveryStatus::Failed);
    assert!(ignored.processed);

    let answered = h.get("wx1:2").await;
    assert_eq!(answered.reply_status, ReplyStatus::Replied);
}

#[tokio::test]
async fn platform_error_fails_and_settles() {
    let h = Harness::new(DeliveryConfig::default());
    h.rule(DeliveryRule::new("all", "*", "broken", 0)).await;
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;

    h.drain().await;
    let stored = h.get("wx1:1").await;
    assert_eq!(stored.delivery_status, DeliveryStatus::Failed);
    assert_eq!(stored.platform_id.as_deref(), Some("broken"));
    assert!(stored.processed);
}

#[tokio::test]
async fn unknown_platform_fails_without_settling() {
    let h = Harness::new(DeliveryConfig::default());
    h.rule(DeliveryRule::new("all", "*", "retired", 0)).await;
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;

    h.drain().await;
    let stored = h.get("wx1:1").await;
    assert_eq!(stored.delivery_status, DeliveryStatus::Failed);
    assert!(!stored.processed);
}

#[tokio::test]
async fn rejected_reply_is_recorded_as_failed() {
    let h = Harness::new(DeliveryConfig::default());
    h.endpoint.reject_sends.store(true, Ordering::SeqCst);
    h.rule(DeliveryRule::new("all", "*", "bot", 0)).await;
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;

    h.drain().await;
    let stored = h.get("wx1:1").await;
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(stored.reply_status, ReplyStatus::Failed);
    assert!(stored.processed);
    assert!(!h.echo.is_echo("wx1", "Family", "re: hi", now_ms()));
}

#[tokio::test]
async fn claimed_rows_are_not_delivered_twice() {
    let h = Harness::new(DeliveryConfig::default());
    h.rule(DeliveryRule::new("all", "*", "bot", 0)).await;
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;
    let message = h.get("wx1:1").await;

    let first = h
        .pipeline
        .process_message(DeliveryUnit::single(message.clone()))
        .await
        .unwrap();
    let second = h
        .pipeline
        .process_message(DeliveryUnit::single(message))
        .await
        .unwrap();

    assert_eq!(first, DeliveryOutcome::Replied);
    assert_eq!(second, DeliveryOutcome::AlreadyClaimed);
    assert_eq!(h.endpoint.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn initialize_fails_rows_left_in_flight() {
    let h = Harness::new(DeliveryConfig::default());
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;
    h.messages
        .transition(
            &["wx1:1".to_string()],
            DeliveryStatus::Pending,
            DeliveryStatus::InFlight,
            None,
            now_ms(),
        )
        .await
        .unwrap();

    h.pipeline.initialize().await.unwrap();
    assert_eq!(h.get("wx1:1").await.delivery_status, DeliveryStatus::Failed);
}

#[tokio::test]
async fn running_pipeline_delivers_until_stopped() {
    let h = Harness::new(DeliveryConfig::default());
    h.rule(DeliveryRule::new("all", "*", "sink", 0)).await;
    h.insert("wx1:1", "Family", "alice", "hi", 1_000).await;

    h.pipeline.initialize().await.unwrap();
    h.pipeline.start().await;
    assert!(h.pipeline.is_running());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.get("wx1:1").await.processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.pipeline.stop().await;
    assert!(!h.pipeline.is_running());
    assert_eq!(h.get("wx1:1").await.delivery_status, DeliveryStatus::Delivered);
}
