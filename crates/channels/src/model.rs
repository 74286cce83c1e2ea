//! Inbound message shapes: what an instance returns and what gets persisted.

use {
    serde::{Deserialize, Deserializer, Serialize},
    serde_json::{Map, Value},
};

/// A message exactly as an instance reported it.
///
/// Every interpreted field is optional; anything else the instance sends is
/// kept in `extra` and carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(
        default,
        alias = "msg_id",
        deserialize_with = "lossy_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_remark: Option<String>,
    #[serde(
        default,
        rename = "type",
        alias = "msg_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(
        default,
        deserialize_with = "lossy_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, alias = "chat", skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_self: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sys: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_time: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lossy_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawMessage {
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// Parse one item of an instance payload; malformed items yield `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed message");
                None
            },
        }
    }
}

/// Accept strings, numbers and bools where a string is expected.
fn lossy_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Forward-only delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    InFlight,
}

impl DeliveryStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Delivered => 1,
            Self::Failed => 2,
            Self::InFlight => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Delivered),
            2 => Some(Self::Failed),
            3 => Some(Self::InFlight),
            _ => None,
        }
    }

    /// `Pending -> InFlight -> Delivered | Failed`, nothing else.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Delivered)
                | (Self::InFlight, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Reply state, only meaningful once delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    #[default]
    None,
    Replied,
    Failed,
}

impl ReplyStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Replied => 1,
            Self::Failed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Replied),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub instance_id: String,
    pub chat_name: String,
    pub sender: String,
    pub sender_remark: Option<String>,
    pub content: String,
    pub message_type: String,
    pub create_time_ms: u64,
    pub processed: bool,
    pub delivery_status: DeliveryStatus,
    pub delivery_time_ms: Option<u64>,
    pub platform_id: Option<String>,
    pub reply_content: Option<String>,
    pub reply_status: ReplyStatus,
    pub reply_time_ms: Option<u64>,
    pub merged: bool,
    pub merged_count: u32,
    pub merged_ids: Vec<String>,
    pub local_file_path: Option<String>,
}

impl Message {
    /// A fresh, undelivered message.
    pub fn new(
        message_id: impl Into<String>,
        instance_id: impl Into<String>,
        chat_name: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        create_time_ms: u64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            instance_id: instance_id.into(),
            chat_name: chat_name.into(),
            sender: sender.into(),
            sender_remark: None,
            content: content.into(),
            message_type: "text".into(),
            create_time_ms,
            processed: false,
            delivery_status: DeliveryStatus::Pending,
            delivery_time_ms: None,
            platform_id: None,
            reply_content: None,
            reply_status: ReplyStatus::None,
            reply_time_ms: None,
            merged: false,
            merged_count: 0,
            merged_ids: Vec::new(),
            local_file_path: None,
        }
    }

    /// Build the persisted form of a raw message.
    ///
    /// `chat_name` is used when the raw message does not name its
    /// conversation (listener-window payloads are keyed by conversation).
    /// Instance-reported ids are scoped by instance; messages without one get
    /// a random id.
    pub fn from_raw(instance_id: &str, chat_name: &str, raw: &RawMessage, now_ms: u64) -> Self {
        let message_id = match raw.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => format!("{instance_id}:{id}"),
            _ => format!("{instance_id}:{}", uuid::Uuid::new_v4()),
        };
        let chat = raw
            .chat_name
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(chat_name);
        let create_time_ms = raw
            .time
            .as_deref()
            .and_then(parse_time_ms)
            .unwrap_or(now_ms);

        let mut message = Self::new(
            message_id,
            instance_id,
            chat,
            raw.sender.clone().unwrap_or_default(),
            raw.content_str(),
            create_time_ms,
        );
        message.sender_remark = raw.sender_remark.clone();
        message.message_type = raw
            .kind
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "text".into());
        message
    }

    /// Ids of every persisted row this message stands for.
    pub fn constituent_ids(&self) -> Vec<String> {
        if self.merged && !self.merged_ids.is_empty() {
            self.merged_ids.clone()
        } else {
            vec![self.message_id.clone()]
        }
    }

    /// Name used when addressing the sender, preferring the remark.
    pub fn display_sender(&self) -> &str {
        self.sender_remark
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.sender)
    }
}

/// Parse an instance timestamp: epoch seconds, epoch millis, or a local
/// `YYYY-MM-DD HH:MM:SS` string.
pub fn parse_time_ms(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u64>() {
        return Some(if n < 100_000_000_000 {
            n * 1000
        } else {
            n
        });
    }
    let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok()?;
    let local = naive.and_local_timezone(chrono::Local).earliest()?;
    u64::try_from(local.timestamp_millis()).ok()
}
