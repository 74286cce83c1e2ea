use std::{collections::VecDeque, sync::Mutex, time::Duration};

#[derive(Debug, Clone)]
struct SentReply {
    instance_id: String,
    chat_name: String,
    content: String,
    sent_at_ms: u64,
}

/// Remembers recently sent replies so they are not mistaken for inbound
/// traffic when the instance reports them back.
#[derive(Debug)]
pub struct EchoGuard {
    window_ms: u64,
    sent: Mutex<VecDeque<SentReply>>,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a reply sent to `chat_name` at `sent_at_ms`.
    pub fn record(&self, instance_id: &str, chat_name: &str, content: &str, sent_at_ms: u64) {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut sent, self.window_ms, sent_at_ms);
        sent.push_back(SentReply {
            instance_id: instance_id.to_string(),
            chat_name: chat_name.to_string(),
            content: content.trim().to_string(),
            sent_at_ms,
        });
    }

    /// Whether `content` equals a reply sent to the same conversation within
    /// the window ending at `now_ms`.
    pub fn is_echo(&self, instance_id: &str, chat_name: &str, content: &str, now_ms: u64) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut sent, self.window_ms, now_ms);
        sent.iter().any(|r| {
            r.instance_id == instance_id && r.chat_name == chat_name && r.content == content
        })
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(sent: &mut VecDeque<SentReply>, window_ms: u64, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while sent.front().is_some_and(|r| r.sent_at_ms < cutoff) {
            sent.pop_front();
        }
    }
}
