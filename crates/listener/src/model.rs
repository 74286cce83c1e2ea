use {
    serde::{Deserialize, Serialize},
    wxrelay_config::FixedListenerSeed,
};

/// Key of a subscription: `(instance_id, who)`.
pub type ListenerKey = (String, String);

/// One polled conversation on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSubscription {
    pub instance_id: String,
    pub who: String,
    pub last_message_at_ms: u64,
    pub last_checked_at_ms: u64,
    /// `false` once evicted. Evicted rows keep their history.
    pub active: bool,
    /// Set while the last-chance fetch for an eviction is in progress.
    #[serde(default)]
    pub marked_for_removal: bool,
    pub manually_added: bool,
    pub fixed_listener: bool,
    #[serde(default)]
    pub reset_attempts: u32,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl ListenerSubscription {
    pub fn new(instance_id: impl Into<String>, who: impl Into<String>, now_ms: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            who: who.into(),
            last_message_at_ms: now_ms,
            last_checked_at_ms: now_ms,
            active: true,
            marked_for_removal: false,
            manually_added: false,
            fixed_listener: false,
            reset_attempts: 0,
            conversation_id: None,
        }
    }

    pub fn key(&self) -> ListenerKey {
        (self.instance_id.clone(), self.who.clone())
    }

    /// Manual and fixed subscriptions are never evicted.
    pub fn is_exempt(&self) -> bool {
        self.manually_added || self.fixed_listener
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_message_at_ms)
    }
}

/// A conversation every instance listens to for as long as it is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedListener {
    pub session_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

impl FixedListener {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            enabled: true,
            description: String::new(),
        }
    }
}

impl From<&FixedListenerSeed> for FixedListener {
    fn from(seed: &FixedListenerSeed) -> Self {
        Self {
            session_name: seed.session_name.trim().to_string(),
            enabled: seed.enabled,
            description: seed.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(false, false, false)]
    #[case(true, false, true)]
    #[case(false, true, true)]
    #[case(true, true, true)]
    fn exemption(#[case] manual: bool, #[case] fixed: bool, #[case] exempt: bool) {
        let mut sub = ListenerSubscription::new("wx1", "Family", 0);
        sub.manually_added = manual;
        sub.fixed_listener = fixed;
        assert_eq!(sub.is_exempt(), exempt);
    }

    #[test]
    fn idle_time_saturates() {
        let sub = ListenerSubscription::new("wx1", "Family", 5_000);
        assert_eq!(sub.idle_ms(8_000), 3_000);
        assert_eq!(sub.idle_ms(1_000), 0);
    }
}
