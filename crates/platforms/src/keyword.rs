//! Local keyword auto-reply.

use {
    async_trait::async_trait,
    rand::seq::IndexedRandom,
    serde::Deserialize,
    tracing::debug,
    wxrelay_channels::{Message, Platform, PlatformReply, Result},
    wxrelay_config::{PlatformEntry, SendMode},
};

use crate::{display_name, parse_options};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Whole content equals a keyword (after trimming).
    Exact,
    #[default]
    Contains,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
    pub replies: Vec<String>,
}

impl KeywordRule {
    pub fn matches(&self, content: &str) -> bool {
        let content = content.trim();
        self.keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .any(|k| match self.match_kind {
                MatchKind::Exact => content == k,
                MatchKind::Contains => content.contains(k),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeywordOptions {
    rules: Vec<KeywordRule>,
}

pub struct KeywordPlatform {
    id: String,
    name: String,
    send_mode: SendMode,
    rules: Vec<KeywordRule>,
}

impl KeywordPlatform {
    pub fn from_entry(entry: &PlatformEntry) -> Result<Self> {
        let options: KeywordOptions = parse_options(entry)?;
        Ok(Self {
            id: entry.id.clone(),
            name: display_name(entry),
            send_mode: entry.send_mode,
            rules: options.rules,
        })
    }

    /// Every reply offered by a rule matching `content`.
    pub fn candidates(&self, content: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.matches(content))
            .flat_map(|r| r.replies.iter().map(String::as_str))
            .filter(|r| !r.trim().is_empty())
            .collect()
    }
}

#[async_trait]
impl Platform for KeywordPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    async fn process_message(&self, message: &Message) -> Result<PlatformReply> {
        let candidates = self.candidates(&message.content);
        let picked = candidates.choose(&mut rand::rng()).copied();
        debug!(
            platform_id = %self.id,
            message_id = %message.message_id,
            candidates = candidates.len(),
            "keyword lookup"
        );
        Ok(match picked {
            Some(reply) => PlatformReply::text(reply),
            None => PlatformReply::none(),
        })
    }
}
