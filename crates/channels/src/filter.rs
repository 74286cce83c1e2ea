//! Noise filtering for raw instance batches.
//!
//! A message is dropped when any of several overlapping signals says it is
//! our own, a system notice, a time divider or a bare base message. The
//! signals are redundant on purpose: instances disagree about which field
//! carries the classification.

#[cfg(feature = "metrics")]
use wxrelay_metrics::{counter, labels, listener as listener_metrics};

use crate::model::RawMessage;

/// Classification tokens that mark a message as noise.
const NOISE_TOKENS: &[&str] = &["self", "sys", "time", "base"];

/// System divider separating already-read history from new messages.
const NEW_MESSAGES_MARKERS: &[&str] = &["以下为新消息", "messages below are new"];

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub keep: bool,
    /// `"<predicate>=<token>"` for the first predicate that fired.
    pub reason: Option<String>,
}

impl FilterDecision {
    fn keep() -> Self {
        Self {
            keep: true,
            reason: None,
        }
    }

    fn dropped(predicate: &str, token: &str) -> Self {
        Self {
            keep: false,
            reason: Some(format!("{predicate}={token}")),
        }
    }
}

type Predicate = fn(&RawMessage) -> Option<&'static str>;

/// Ordered, named predicates. Each returns the noise token it detected.
const PREDICATES: &[(&str, Predicate)] = &[
    ("sender", by_sender),
    ("type", by_type),
    ("mtype", by_mtype),
    ("attr", by_attr),
    ("content_tag", by_content_tag),
    ("id_tag", by_id_tag),
    ("flags", by_flags),
];

fn token_of(value: &str) -> Option<&'static str> {
    let value = value.trim();
    NOISE_TOKENS
        .iter()
        .copied()
        .find(|t| value.eq_ignore_ascii_case(t))
}

fn by_sender(raw: &RawMessage) -> Option<&'static str> {
    raw.sender.as_deref().and_then(token_of)
}

fn by_type(raw: &RawMessage) -> Option<&'static str> {
    raw.kind.as_deref().and_then(token_of)
}

fn by_mtype(raw: &RawMessage) -> Option<&'static str> {
    raw.mtype.as_deref().and_then(token_of)
}

fn by_attr(raw: &RawMessage) -> Option<&'static str> {
    raw.extra
        .get("attr")
        .and_then(|v| v.as_str())
        .and_then(token_of)
}

/// Class tags such as `SelfMessage` leaking into the content.
fn by_content_tag(raw: &RawMessage) -> Option<&'static str> {
    let content = raw.content.as_deref()?.to_ascii_lowercase();
    NOISE_TOKENS
        .iter()
        .copied()
        .find(|t| content.contains(&format!("{t}message")))
}

fn by_id_tag(raw: &RawMessage) -> Option<&'static str> {
    let id = raw.id.as_deref()?.to_ascii_lowercase();
    NOISE_TOKENS.iter().copied().find(|t| id.contains(t))
}

fn by_flags(raw: &RawMessage) -> Option<&'static str> {
    if raw.is_self == Some(true) {
        Some("self")
    } else if raw.is_sys == Some(true) {
        Some("sys")
    } else if raw.is_time == Some(true) {
        Some("time")
    } else {
        None
    }
}

/// Decide whether a raw message is real conversation traffic.
pub fn classify(raw: &RawMessage) -> FilterDecision {
    PREDICATES
        .iter()
        .find_map(|(name, predicate)| {
            predicate(raw).map(|token| FilterDecision::dropped(name, token))
        })
        .unwrap_or_else(FilterDecision::keep)
}

fn is_system(raw: &RawMessage) -> bool {
    raw.is_sys == Some(true)
        || [raw.sender.as_deref(), raw.kind.as_deref(), raw.mtype.as_deref()]
            .into_iter()
            .flatten()
            .any(|v| v.trim().eq_ignore_ascii_case("sys"))
}

fn is_new_messages_marker(raw: &RawMessage) -> bool {
    let content = raw.content_str().to_lowercase();
    is_system(raw) && NEW_MESSAGES_MARKERS.iter().any(|m| content.contains(m))
}

/// Keep only what follows the last new-messages divider.
///
/// The divider itself is excluded. Batches without a divider are returned
/// unchanged.
pub fn split_at_marker(mut batch: Vec<RawMessage>) -> Vec<RawMessage> {
    match batch.iter().rposition(is_new_messages_marker) {
        Some(idx) => batch.split_off(idx + 1),
        None => batch,
    }
}

/// Drop every message [`classify`] rejects, logging why at debug level.
pub fn filter_batch(batch: Vec<RawMessage>) -> Vec<RawMessage> {
    batch
        .into_iter()
        .filter(|raw| {
            let decision = classify(raw);
            if let Some(reason) = &decision.reason {
                tracing::debug!(id = ?raw.id, reason = %reason, "filtered message");
                #[cfg(feature = "metrics")]
                counter!(listener_metrics::MESSAGES_FILTERED_TOTAL, labels::REASON => reason.clone())
                    .increment(1);
            }
            decision.keep
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn raw(value: serde_json::Value) -> RawMessage {
        serde_json::from_value(value).unwrap()
    }

    #[rstest]
    #[case::sender_self(json!({"sender": "Self", "content": "hi"}), "sender=self")]
    #[case::sender_upper(json!({"sender": "SELF"}), "sender=self")]
    #[case::type_sys(json!({"type": "sys", "content": "x joined"}), "type=sys")]
    #[case::mtype_time(json!({"mtype": "Time"}), "mtype=time")]
    #[case::attr_base(json!({"attr": "base"}), "attr=base")]
    #[case::content_tag(json!({"content": "<SelfMessage at 0x1>"}), "content_tag=self")]
    #[case::id_tag(json!({"id": "time_001"}), "id_tag=time")]
    #[case::flag(json!({"is_sys": true}), "flags=sys")]
    fn drops_noise(#[case] value: serde_json::Value, #[case] reason: &str) {
        let decision = classify(&raw(value));
        assert!(!decision.keep);
        assert_eq!(decision.reason.as_deref(), Some(reason));
    }

    #[rstest]
    #[case::friend(json!({"sender": "Alice", "type": "friend", "content": "hello"}))]
    #[case::empty(json!({}))]
    #[case::selfish_name(json!({"sender": "Selfie", "content": "system time"}))]
    #[case::false_flags(json!({"is_self": false, "is_sys": false, "is_time": false}))]
    fn keeps_traffic(#[case] value: serde_json::Value) {
        assert_eq!(classify(&raw(value)), FilterDecision::keep());
    }

    #[test]
    fn split_returns_suffix_after_marker() {
        let batch = vec![
            raw(json!({"id": "1", "content": "old"})),
            raw(json!({"type": "sys", "content": "以下为新消息"})),
            raw(json!({"id": "2", "content": "new"})),
            raw(json!({"id": "3", "content": "newer"})),
        ];
        let tail = split_at_marker(batch);
        let ids: Vec<_> = tail.iter().map(|m| m.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn split_uses_last_marker_case_insensitive() {
        let batch = vec![
            raw(json!({"sender": "sys", "content": "Messages below are new"})),
            raw(json!({"id": "1"})),
            raw(json!({"mtype": "SYS", "content": "MESSAGES BELOW ARE NEW"})),
            raw(json!({"id": "2"})),
        ];
        let tail = split_at_marker(batch);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id.as_deref(), Some("2"));
    }

    #[test]
    fn split_ignores_marker_text_from_people() {
        let batch = vec![
            raw(json!({"sender": "Alice", "content": "messages below are new"})),
            raw(json!({"id": "2"})),
        ];
        assert_eq!(split_at_marker(batch).len(), 2);
    }

    #[test]
    fn split_without_marker_is_identity() {
        let batch = vec![raw(json!({"id": "1"})), raw(json!({"id": "2"}))];
        assert_eq!(split_at_marker(batch.clone()), batch);
    }

    #[test]
    fn split_marker_last_yields_empty() {
        let batch = vec![
            raw(json!({"id": "1"})),
            raw(json!({"is_sys": true, "content": "以下为新消息"})),
        ];
        assert!(split_at_marker(batch).is_empty());
    }

    #[test]
    fn filter_batch_keeps_order() {
        let batch = vec![
            raw(json!({"id": "1", "sender": "A"})),
            raw(json!({"id": "2", "sender": "self"})),
            raw(json!({"id": "3", "sender": "B"})),
        ];
        let kept: Vec<_> = filter_batch(batch)
            .into_iter()
            .map(|m| m.id.unwrap())
            .collect();
        assert_eq!(kept, vec!["1", "3"]);
    }
}
