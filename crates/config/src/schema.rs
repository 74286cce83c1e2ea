/// Config schema types (listener, delivery, sender, instances, platforms, rules).
use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WxRelayConfig {
    pub database: DatabaseConfig,
    pub listener: ListenerConfig,
    pub delivery: DeliveryConfig,
    pub sender: SenderConfig,
    pub instances: Vec<InstanceEntry>,
    pub platforms: Vec<PlatformEntry>,
    /// Rules inserted on startup when no rule with the same id exists.
    pub rules: Vec<RuleSeed>,
    /// Fixed listeners inserted on startup when absent.
    pub fixed_listeners: Vec<FixedListenerSeed>,
}

impl WxRelayConfig {
    pub fn instance(&self, id: &str) -> Option<&InstanceEntry> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn platform(&self, id: &str) -> Option<&PlatformEntry> {
        self.platforms.iter().find(|p| p.id == id)
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `<data_dir>/wxrelay.db`.
    pub path: Option<PathBuf>,
}

/// Listener registry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Seconds between main-window unread polls. Defaults to 5.
    pub poll_interval_secs: u64,
    /// Seconds between listener-window polls. Defaults to 5.
    pub listener_poll_interval_secs: u64,
    /// Upper bound on active subscriptions per instance. Defaults to 30.
    pub max_listeners_per_instance: usize,
    /// Idle minutes before a subscription is evicted. Defaults to 30.
    pub timeout_minutes: u64,
    /// Seconds between eviction sweeps. Defaults to 60.
    pub eviction_interval_secs: u64,
    /// Eviction is suppressed for this long after start. Defaults to 10.
    pub startup_grace_secs: u64,
    /// Extra idle time tolerated past the timeout before the last-chance
    /// fetch runs. Defaults to 0.
    pub last_chance_buffer_secs: u64,
    /// Upper bound for any single call to an instance. Defaults to 10.
    pub endpoint_timeout_secs: u64,
    /// Whether the main-window unread loop runs. Defaults to true.
    pub main_window_enabled: bool,
    /// Delay before a crashed loop is restarted. Defaults to 5.
    pub restart_delay_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            listener_poll_interval_secs: 5,
            max_listeners_per_instance: 30,
            timeout_minutes: 30,
            eviction_interval_secs: 60,
            startup_grace_secs: 10,
            last_chance_buffer_secs: 0,
            endpoint_timeout_secs: 10,
            main_window_enabled: true,
            restart_delay_secs: 5,
        }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn listener_poll_interval(&self) -> Duration {
        Duration::from_secs(self.listener_poll_interval_secs.max(1))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn last_chance_buffer(&self) -> Duration {
        Duration::from_secs(self.last_chance_buffer_secs)
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Delivery pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Seconds between polls for pending messages. Defaults to 5.
    pub poll_interval_secs: u64,
    /// Max pending messages fetched per instance per poll. Defaults to 10.
    pub batch_size: usize,
    /// Combine bursts from one conversation into a single delivery. Defaults to false.
    pub merge_enabled: bool,
    /// Max first-to-last span of a merged burst. Defaults to 60.
    pub merge_window_secs: u64,
    /// Concurrent deliveries in flight. Defaults to 8.
    pub max_concurrent: usize,
    /// Upper bound for a platform call. Defaults to 60.
    pub platform_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 10,
            merge_enabled: false,
            merge_window_secs: 60,
            max_concurrent: 8,
            platform_timeout_secs: 60,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn merge_window(&self) -> Duration {
        Duration::from_secs(self.merge_window_secs)
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.platform_timeout_secs.max(1))
    }
}

/// Outbound reply tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Send attempts after the first failure. Defaults to 3.
    pub max_retries: u32,
    /// Fixed wait between attempts. Defaults to 1000.
    pub retry_backoff_ms: u64,
    /// How long a sent reply is remembered for echo suppression. Defaults to 300.
    pub echo_window_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 1000,
            echo_window_secs: 300,
        }
    }
}

impl SenderConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_secs(self.echo_window_secs)
    }
}

/// A managed WeChat automation instance.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceEntry {
    pub id: String,
    pub name: String,
    /// Base URL of the instance's HTTP API, e.g. `http://127.0.0.1:5000`.
    pub base_url: String,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    pub enabled: bool,
}

impl Default for InstanceEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            base_url: "http://127.0.0.1:5000".into(),
            api_key: None,
            enabled: true,
        }
    }
}

impl std::fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Which adapter backs a platform entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[default]
    Webhook,
    Keyword,
    Openai,
}

/// How a reply is typed into the conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Paste the whole message at once.
    #[default]
    Plain,
    /// Simulate typing, which also supports inline @-mentions.
    Typing,
}

/// A message-processing backend.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformEntry {
    pub id: String,
    pub name: String,
    pub kind: PlatformKind,
    pub enabled: bool,
    pub send_mode: SendMode,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    /// Kind-specific settings (url, model, keyword rules, ...).
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl Default for PlatformEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: PlatformKind::default(),
            enabled: true,
            send_mode: SendMode::default(),
            api_key: None,
            options: Value::Null,
        }
    }
}

impl std::fmt::Debug for PlatformEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("send_mode", &self.send_mode)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("options", &self.options)
            .finish()
    }
}

/// A delivery rule declared in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSeed {
    pub rule_id: String,
    pub name: String,
    /// `"*"` or an exact instance id.
    pub instance_id: String,
    /// `"*"`, `"regex:<expr>"`, a comma list, or an exact chat name.
    pub chat_pattern: String,
    pub platform_id: String,
    pub priority: i64,
    pub enabled: bool,
    pub only_at_messages: bool,
    pub at_names: Vec<String>,
    pub reply_at_sender: bool,
}

impl Default for RuleSeed {
    fn default() -> Self {
        Self {
            rule_id: String::new(),
            name: String::new(),
            instance_id: "*".into(),
            chat_pattern: "*".into(),
            platform_id: String::new(),
            priority: 0,
            enabled: true,
            only_at_messages: false,
            at_names: Vec::new(),
            reply_at_sender: false,
        }
    }
}

/// A conversation that should always be listened to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedListenerSeed {
    pub session_name: String,
    pub enabled: bool,
    pub description: String,
}

impl Default for FixedListenerSeed {
    fn default() -> Self {
        Self {
            session_name: String::new(),
            enabled: true,
            description: String::new(),
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
