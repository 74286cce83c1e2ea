//! Merge-window grouping of pending messages into delivery units.

use std::{collections::HashMap, time::Duration};

use wxrelay_channels::Message;

/// One dispatchable delivery: a single message, or a synthetic message
/// standing for a burst from one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUnit {
    pub message: Message,
    /// Every persisted id this unit settles, oldest first.
    pub member_ids: Vec<String>,
}

impl DeliveryUnit {
    pub fn single(message: Message) -> Self {
        let member_ids = vec![message.message_id.clone()];
        Self {
            message,
            member_ids,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.member_ids.len() > 1
    }

    /// Combine a chronologically sorted burst. The first message lends its
    /// id and routing fields; content becomes one `sender: content` line
    /// per member.
    fn merged(burst: Vec<Message>) -> Option<Self> {
        let member_ids: Vec<String> = burst.iter().map(|m| m.message_id.clone()).collect();
        let content = burst
            .iter()
            .map(|m| format!("{}: {}", m.display_sender(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let mut message = burst.into_iter().next()?;
        message.content = content;
        message.merged = true;
        message.merged_count = u32::try_from(member_ids.len()).unwrap_or(u32::MAX);
        message.merged_ids = member_ids.clone();
        Some(Self {
            message,
            member_ids,
        })
    }
}

/// Turn a pending batch into delivery units.
///
/// With merging on, messages are grouped by conversation; a group whose
/// first-to-last span fits `window` becomes one unit, any other group is
/// dispatched message by message. Unit order follows the first appearance
/// of each conversation in `batch`.
pub fn group_units(batch: Vec<Message>, merge_enabled: bool, window: Duration) -> Vec<DeliveryUnit> {
    if !merge_enabled {
        return batch.into_iter().map(DeliveryUnit::single).collect();
    }

    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<Message>> = HashMap::new();
    for message in batch {
        let key = (message.instance_id.clone(), message.chat_name.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(message);
    }

    let mut units = Vec::new();
    for key in order {
        let Some(mut group) = groups.remove(&key) else {
            continue;
        };
        group.sort_by_key(|m| m.create_time_ms);
        let span = match (group.first(), group.last()) {
            (Some(first), Some(last)) => last.create_time_ms.saturating_sub(first.create_time_ms),
            _ => continue,
        };
        if group.len() > 1 && span <= window_ms {
            units.extend(DeliveryUnit::merged(group));
        } else {
            units.extend(group.into_iter().map(DeliveryUnit::single));
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn msg(id: &str, chat: &str, sender: &str, content: &str, at: u64) -> Message {
        Message::new(id, "wx1", chat, sender, content, at)
    }

    #[test]
    fn disabled_merge_keeps_messages_apart() {
        let units = group_units(
            vec![msg("1", "A", "a", "x", 0), msg("2", "A", "a", "y", 1)],
            false,
            Duration::from_secs(60),
        );
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| !u.is_merged()));
    }

    #[test]
    fn burst_within_window_merges_in_order() {
        let units = group_units(
            vec![
                msg("2", "A", "bob", "second", 2_000),
                msg("1", "A", "alice", "first", 1_000),
                msg("3", "A", "alice", "third", 3_000),
            ],
            true,
            Duration::from_secs(60),
        );
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.member_ids, vec!["1", "2", "3"]);
        assert_eq!(unit.message.message_id, "1");
        assert_eq!(unit.message.merged_count, 3);
        assert!(unit.message.merged);
        assert_eq!(
            unit.message.content,
            "alice: first\nbob: second\nalice: third"
        );
    }

    #[rstest]
    #[case(60_000, 1)]
    #[case(60_001, 2)]
    fn window_boundary(#[case] last_at: u64, #[case] expected_units: usize) {
        let units = group_units(
            vec![msg("1", "A", "a", "x", 0), msg("2", "A", "a", "y", last_at)],
            true,
            Duration::from_secs(60),
        );
        assert_eq!(units.len(), expected_units);
    }

    #[test]
    fn conversations_merge_independently() {
        let units = group_units(
            vec![
                msg("1", "A", "a", "x", 0),
                msg("2", "B", "b", "y", 0),
                msg("3", "A", "a", "z", 10),
            ],
            true,
            Duration::from_secs(60),
        );
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].member_ids, vec!["1", "3"]);
        assert_eq!(units[1].member_ids, vec!["2"]);
        assert!(!units[1].is_merged());
    }
}
