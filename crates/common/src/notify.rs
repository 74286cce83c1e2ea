//! In-process pub/sub for configuration changes.
//!
//! Services that hold derived state (the rule snapshot, listener settings,
//! fixed-listener subscriptions) register a [`ConfigSubscriber`] and rebuild
//! when a matching [`ConfigChangeEvent`] is published. Delivery is
//! best-effort: a failing subscriber is logged and never affects the others
//! or the publisher.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::broadcast,
    tracing::{debug, warn},
};

use crate::time::now_ms;

const BROADCAST_CAPACITY: usize = 64;

// ── ConfigChangeKind ────────────────────────────────────────────────────────

/// What part of the configuration changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeKind {
    PlatformAdded,
    PlatformUpdated,
    PlatformDeleted,
    RuleAdded,
    RuleUpdated,
    RuleDeleted,
    InstanceAdded,
    InstanceUpdated,
    InstanceDeleted,
    ListenerSettingsUpdated,
    FixedListenersChanged,
}

impl fmt::Display for ConfigChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ConfigChangeKind {
    pub const ALL: &'static [ConfigChangeKind] = &[
        Self::PlatformAdded,
        Self::PlatformUpdated,
        Self::PlatformDeleted,
        Self::RuleAdded,
        Self::RuleUpdated,
        Self::RuleDeleted,
        Self::InstanceAdded,
        Self::InstanceUpdated,
        Self::InstanceDeleted,
        Self::ListenerSettingsUpdated,
        Self::FixedListenersChanged,
    ];

    pub fn is_platform(&self) -> bool {
        matches!(
            self,
            Self::PlatformAdded | Self::PlatformUpdated | Self::PlatformDeleted
        )
    }

    pub fn is_rule(&self) -> bool {
        matches!(
            self,
            Self::RuleAdded | Self::RuleUpdated | Self::RuleDeleted
        )
    }

    /// Events after which routing decisions may differ.
    pub fn affects_routing(&self) -> bool {
        self.is_platform() || self.is_rule()
    }
}

// ── ConfigChangeEvent ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    pub kind: ConfigChangeKind,
    pub payload: Value,
    pub timestamp_ms: u64,
}

impl ConfigChangeEvent {
    pub fn new(kind: ConfigChangeKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp_ms: now_ms(),
        }
    }
}

// ── ConfigSubscriber ────────────────────────────────────────────────────────

#[async_trait]
pub trait ConfigSubscriber: Send + Sync {
    /// Stable name, used for logging and [`ConfigNotifier::unsubscribe`].
    fn name(&self) -> &str;

    async fn on_config_change(&self, event: &ConfigChangeEvent) -> anyhow::Result<()>;
}

// ── ConfigNotifier ──────────────────────────────────────────────────────────

pub struct ConfigNotifier {
    by_kind: RwLock<HashMap<ConfigChangeKind, Vec<Arc<dyn ConfigSubscriber>>>>,
    global: RwLock<Vec<Arc<dyn ConfigSubscriber>>>,
    tx: broadcast::Sender<ConfigChangeEvent>,
}

impl Default for ConfigNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            by_kind: RwLock::new(HashMap::new()),
            global: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Receive events of a single kind.
    pub fn subscribe(&self, kind: ConfigChangeKind, subscriber: Arc<dyn ConfigSubscriber>) {
        debug!(subscriber = subscriber.name(), %kind, "config subscriber registered");
        self.by_kind
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    /// Receive every event.
    pub fn subscribe_all(&self, subscriber: Arc<dyn ConfigSubscriber>) {
        debug!(
            subscriber = subscriber.name(),
            "config subscriber registered for all events"
        );
        self.global
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    /// Drop every registration made under `name`. Returns how many were removed.
    pub fn unsubscribe(&self, name: &str) -> usize {
        let mut removed = 0;
        {
            let mut global = self.global.write().unwrap_or_else(|e| e.into_inner());
            let before = global.len();
            global.retain(|s| s.name() != name);
            removed += before - global.len();
        }
        let mut by_kind = self.by_kind.write().unwrap_or_else(|e| e.into_inner());
        for subs in by_kind.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.name() != name);
            removed += before - subs.len();
        }
        removed
    }

    /// A raw event stream, for consumers that prefer polling a channel.
    pub fn watch(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that handled it
    /// without error.
    pub async fn notify(&self, kind: ConfigChangeKind, payload: Value) -> usize {
        let event = ConfigChangeEvent::new(kind, payload);
        let targets = self.targets(kind);
        debug!(%kind, count = targets.len(), "publishing config change");

        // No receivers is the normal case when nobody called `watch`.
        let _ = self.tx.send(event.clone());

        let event_ref = &event;
        let results = futures::future::join_all(targets.into_iter().map(|sub| async move {
            let result = sub.on_config_change(event_ref).await;
            (sub, result)
        }))
        .await;

        let mut ok = 0;
        for (sub, result) in results {
            match result {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(subscriber = sub.name(), %kind, error = %e, "config subscriber failed");
                },
            }
        }
        ok
    }

    fn targets(&self, kind: ConfigChangeKind) -> Vec<Arc<dyn ConfigSubscriber>> {
        let mut targets: Vec<Arc<dyn ConfigSubscriber>> = self
            .global
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(subs) = self
            .by_kind
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
        {
            for sub in subs {
                // Registered both globally and per kind: deliver once.
                if !targets.iter().any(|t| Arc::ptr_eq(t, sub)) {
                    targets.push(Arc::clone(sub));
                }
            }
        }
        targets
    }
}
