#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    wxrelay_channels::{
        EchoGuard, Endpoint, EndpointRegistry, FetchOptions, InMemoryMessageStore, MessageStore,
        PlatformRegistry, RawMessage, SendOptions, SendOutcome,
    },
    wxrelay_config::{ListenerConfig, SenderConfig},
    wxrelay_delivery::{MessageSender, SendRequest},
    wxrelay_listener::{InMemoryListenerStore, ListenerRegistry, ListenerStore},
    wxrelay_routing::{InMemoryRuleStore, RuleEngine},
};

/// Endpoint whose main-window fetch and sends take a fixed time.
struct PacedEndpoint {
    id: &'static str,
    fetch_delay: Duration,
    send_delay: Duration,
    unread_calls: AtomicUsize,
    sends: AtomicUsize,
}

impl PacedEndpoint {
    fn new(id: &'static str, fetch_delay: Duration, send_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            fetch_delay,
            send_delay,
            unread_calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Endpoint for PacedEndpoint {
    fn instance_id(&self) -> &str {
        self.id
    }

    async fn initialize(&self) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn health_check(&self) -> wxrelay_channels::Result<bool> {
        Ok(true)
    }

    async fn fetch_unread(&self, _opts: &FetchOptions) -> wxrelay_channels::Result<Vec<RawMessage>> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.fetch_delay).await;
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
        _who: &str,
        _text: &str,
        _opts: &SendOptions,
    ) -> wxrelay_channels::Result<SendOutcome> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.send_delay).await;
        Ok(SendOutcome::ok())
    }
}

#[tokio::test(start_paused = true)]
async fn reply_sent_mid_poll_holds_remaining_instances() {
    let first = PacedEndpoint::new("a", Duration::from_secs(1), Duration::from_secs(5));
    let second = PacedEndpoint::new("b", Duration::ZERO, Duration::ZERO);
    let endpoints = Arc::new(EndpointRegistry::new());
    endpoints.register(Arc::clone(&first) as Arc<dyn Endpoint>);
    endpoints.register(Arc::clone(&second) as Arc<dyn Endpoint>);

    let echo = Arc::new(EchoGuard::default());
    let registry = ListenerRegistry::new(
        Arc::clone(&endpoints),
        Arc::new(InMemoryMessageStore::new()) as Arc<dyn MessageStore>,
        Arc::new(InMemoryListenerStore::new()) as Arc<dyn ListenerStore>,
        Arc::new(RuleEngine::new(Arc::new(InMemoryRuleStore::new()))),
        Arc::clone(&echo),
        ListenerConfig::default(),
    );
    let sender = Arc::new(MessageSender::new(
        endpoints,
        Arc::new(PlatformRegistry::new()),
        registry.pause_gate(),
        echo,
        SenderConfig {
            max_retries: 0,
            retry_backoff_ms: 0,
            ..Default::default()
        },
    ));

    let cycle = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.main_window_cycle(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(first.unread_calls.load(Ordering::SeqCst), 1);

    let send = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move { sender.send(&SendRequest::new("a", "Family", "on my way")).await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(first.sends.load(Ordering::SeqCst), 1);
    assert_eq!(second.unread_calls.load(Ordering::SeqCst), 0);
    assert!(!cycle.is_finished());

    assert!(send.await.unwrap().ok);
    cycle.await.unwrap();
    assert_eq!(second.unread_calls.load(Ordering::SeqCst), 1);
}
