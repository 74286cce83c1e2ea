use {async_trait::async_trait, wxrelay_config::SendMode};

use crate::{Result, model::Message};

/// What a platform produced for a message. An empty or missing content
/// means "delivered, nothing to say back".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformReply {
    pub content: Option<String>,
}

impl PlatformReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
        }
    }

    pub fn none() -> Self {
        Self { content: None }
    }

    /// Reply text worth sending, if any.
    pub fn sendable(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// A message-processing backend (bot, webhook, LLM).
#[async_trait]
pub trait Platform: Send + Sync {
    /// Platform identifier referenced by delivery rules.
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    /// Default way replies from this platform are typed.
    fn send_mode(&self) -> SendMode {
        SendMode::Plain
    }

    async fn process_message(&self, message: &Message) -> Result<PlatformReply>;
}
