//! Decoding of wxauto response payloads.
//!
//! Message lists arrive in a few shapes depending on the route and server
//! version: a bare array, `{chat_name, messages: [...]}`, or a map keyed by
//! conversation. Every shape is flattened into [`RawMessage`]s with the
//! conversation filled in.

use std::collections::HashMap;

use {
    serde::Deserialize,
    serde_json::Value,
    wxrelay_channels::RawMessage,
};

/// Response envelope shared by every route. `code != 0` is an error.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub code: i64,
    pub message: String,
    pub data: Value,
}

fn collect(items: &[Value], chat_name: Option<&str>, out: &mut Vec<RawMessage>) {
    for item in items {
        if let Some(mut raw) = RawMessage::from_value(item.clone()) {
            if raw.chat_name.as_deref().is_none_or(str::is_empty)
                && let Some(chat) = chat_name
            {
                raw.chat_name = Some(chat.to_string());
            }
            out.push(raw);
        }
    }
}

/// Flatten any message-list shape.
pub fn message_list(data: &Value, chat_name: Option<&str>) -> Vec<RawMessage> {
    let mut out = Vec::new();
    match data {
        Value::Array(items) => collect(items, chat_name, &mut out),
        Value::Object(map) => {
            if let Some(messages) = map.get("messages") {
                let chat = map
                    .get("chat_name")
                    .or_else(|| map.get("who"))
                    .and_then(Value::as_str)
                    .or(chat_name);
                return message_list(messages, chat);
            }
            for (chat, items) in map {
                if let Value::Array(items) = items {
                    collect(items, Some(chat), &mut out);
                }
            }
        },
        _ => {},
    }
    out
}

/// Messages per listener window, keyed by conversation.
pub fn listener_map(data: &Value) -> HashMap<String, Vec<RawMessage>> {
    let data = data.get("messages").unwrap_or(data);
    let mut out = HashMap::new();
    if let Value::Object(map) = data {
        for (who, items) in map {
            let messages = message_list(items, Some(who));
            if !messages.is_empty() {
                out.insert(who.clone(), messages);
            }
        }
    }
    out
}

/// Whether a health payload reports a usable session.
pub fn is_healthy(data: &Value) -> bool {
    let status = data
        .get("wechat_status")
        .or_else(|| data.get("status"))
        .and_then(Value::as_str);
    match status {
        Some(s) => matches!(s, "ok" | "online" | "connected" | "running"),
        None => data
            .get("initialized")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    }
}
