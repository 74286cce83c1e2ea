//! Delivery rules and their compiled chat patterns.

use {
    regex::Regex,
    serde::{Deserialize, Serialize},
    wxrelay_channels::parse_at_names,
    wxrelay_config::RuleSeed,
};

/// Maps (instance, conversation) to a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRule {
    /// Insertion sequence assigned by the store. Breaks priority ties.
    #[serde(default)]
    pub seq: i64,
    pub rule_id: String,
    #[serde(default)]
    pub name: String,
    /// `"*"` or an exact instance id.
    pub instance_id: String,
    /// `"*"`, `"regex:<expr>"`, a comma list, or an exact chat name.
    pub chat_pattern: String,
    pub platform_id: String,
    #[serde(default)]
    pub priority: i64,
    pub enabled: bool,
    #[serde(default)]
    pub only_at_messages: bool,
    #[serde(default)]
    pub at_names: Vec<String>,
    #[serde(default)]
    pub reply_at_sender: bool,
}

impl DeliveryRule {
    pub fn new(
        rule_id: impl Into<String>,
        chat_pattern: impl Into<String>,
        platform_id: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            seq: 0,
            rule_id: rule_id.into(),
            name: String::new(),
            instance_id: "*".into(),
            chat_pattern: chat_pattern.into(),
            platform_id: platform_id.into(),
            priority,
            enabled: true,
            only_at_messages: false,
            at_names: Vec::new(),
            reply_at_sender: false,
        }
    }

    pub fn matches_instance(&self, instance_id: &str) -> bool {
        let pattern = self.instance_id.trim();
        pattern == "*" || pattern.is_empty() || pattern == instance_id
    }

    /// Stored form of `at_names`.
    pub fn at_names_joined(&self) -> String {
        self.at_names.join(",")
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.rule_id.trim().is_empty() {
            return Err(crate::Error::invalid("rule_id is empty"));
        }
        if self.platform_id.trim().is_empty() {
            return Err(crate::Error::invalid(format!(
                "rule {} has no platform_id",
                self.rule_id
            )));
        }
        Ok(())
    }
}

impl From<&RuleSeed> for DeliveryRule {
    fn from(seed: &RuleSeed) -> Self {
        Self {
            seq: 0,
            rule_id: seed.rule_id.clone(),
            name: seed.name.clone(),
            instance_id: seed.instance_id.clone(),
            chat_pattern: seed.chat_pattern.clone(),
            platform_id: seed.platform_id.clone(),
            priority: seed.priority,
            enabled: seed.enabled,
            only_at_messages: seed.only_at_messages,
            at_names: seed
                .at_names
                .iter()
                .flat_map(|n| parse_at_names(n))
                .collect(),
            reply_at_sender: seed.reply_at_sender,
        }
    }
}

/// A chat pattern compiled once per reload.
#[derive(Debug, Clone)]
pub enum ChatPattern {
    Any,
    /// Anchored full match. `None` when the expression failed to compile;
    /// such a pattern never matches.
    Regex(Option<Regex>),
    List(Vec<String>),
    Exact(String),
}

impl ChatPattern {
    /// Precedence: `*`, then `regex:`, then comma list, then exact.
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Self::Any;
        }
        if let Some(expr) = pattern.strip_prefix("regex:") {
            return Self::Regex(Regex::new(&format!("^(?:{expr})$")).ok());
        }
        if pattern.contains(',') {
            return Self::List(
                pattern
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        Self::Exact(pattern.to_string())
    }

    pub fn matches(&self, chat_name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Regex(Some(re)) => re.is_match(chat_name),
            Self::Regex(None) => false,
            Self::List(tokens) => tokens.iter().any(|t| t == chat_name),
            Self::Exact(name) => name == chat_name,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Regex(None))
    }
}
