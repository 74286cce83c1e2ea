use std::collections::HashMap;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    wxrelay_config::SendMode,
};

use crate::{Result, model::RawMessage};

/// Download switches passed along with fetch and listen requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    pub savepic: bool,
    pub savefile: bool,
    pub savevoice: bool,
    pub parseurl: bool,
}

/// How an outbound message is typed and whom it mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub mode: SendMode,
    /// Names to @-mention. Only honoured in typing mode.
    pub mentions: Vec<String>,
}

/// What the instance reported for a send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// A managed WeChat automation instance.
///
/// Implementations talk to one remote instance. Callers bound every call
/// with a timeout; implementations need not.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Instance identifier (matches `instances[].id` in config).
    fn instance_id(&self) -> &str;

    /// (Re)initialise the automation session.
    async fn initialize(&self) -> Result<bool>;

    /// Whether the instance is up and initialised.
    async fn health_check(&self) -> Result<bool>;

    /// Unread messages from the main chat window.
    async fn fetch_unread(&self, opts: &FetchOptions) -> Result<Vec<RawMessage>>;

    /// Open a listener window for `who`.
    async fn add_listener(&self, who: &str, opts: &FetchOptions) -> Result<bool>;

    async fn remove_listener(&self, who: &str) -> Result<bool>;

    /// New messages for every open listener window, keyed by conversation.
    async fn fetch_all_listener_messages(&self) -> Result<HashMap<String, Vec<RawMessage>>>;

    /// New messages for one listener window.
    async fn fetch_listener_messages(&self, who: &str) -> Result<Vec<RawMessage>>;

    async fn send_message(&self, who: &str, text: &str, opts: &SendOptions) -> Result<SendOutcome>;
}
