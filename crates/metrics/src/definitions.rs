//! Metric name and label definitions.
//!
//! Every metric wxrelay records is named here so the set of series stays
//! documented in one place.

/// Listener registry metrics
pub mod listener {
    /// Raw messages returned by instances, before filtering
    pub const MESSAGES_RECEIVED_TOTAL: &str = "wxrelay_listener_messages_received_total";
    /// Messages dropped by the message filter
    pub const MESSAGES_FILTERED_TOTAL: &str = "wxrelay_listener_messages_filtered_total";
    /// Messages written to the store
    pub const MESSAGES_PERSISTED_TOTAL: &str = "wxrelay_listener_messages_persisted_total";
    /// Messages recognised as our own replies
    pub const ECHOES_SUPPRESSED_TOTAL: &str = "wxrelay_listener_echoes_suppressed_total";
    /// Subscriptions created on an instance
    pub const ADDED_TOTAL: &str = "wxrelay_listener_added_total";
    /// Subscriptions removed for inactivity
    pub const EVICTED_TOTAL: &str = "wxrelay_listener_evicted_total";
    /// Active subscriptions per instance
    pub const ACTIVE: &str = "wxrelay_listener_active";
    /// Poll cycles skipped because the registry was paused
    pub const PAUSED_CYCLES_TOTAL: &str = "wxrelay_listener_paused_cycles_total";
    /// Supervised loop restarts after a panic
    pub const LOOP_RESTARTS_TOTAL: &str = "wxrelay_listener_loop_restarts_total";
}

/// Delivery pipeline metrics
pub mod delivery {
    /// Deliveries finished, labelled by outcome
    pub const COMPLETED_TOTAL: &str = "wxrelay_delivery_completed_total";
    /// Messages folded into a merged delivery
    pub const MERGED_MESSAGES_TOTAL: &str = "wxrelay_delivery_merged_messages_total";
    /// Platform call duration in seconds
    pub const PLATFORM_DURATION_SECONDS: &str = "wxrelay_delivery_platform_duration_seconds";
    /// Deliveries currently in flight
    pub const IN_FLIGHT: &str = "wxrelay_delivery_in_flight";
}

/// Message sender metrics
pub mod sender {
    /// Send operations, labelled by success
    pub const SENDS_TOTAL: &str = "wxrelay_sender_sends_total";
    /// Retried send attempts
    pub const RETRIES_TOTAL: &str = "wxrelay_sender_retries_total";
}

/// Rule engine metrics
pub mod routing {
    /// Full rule reloads
    pub const RELOADS_TOTAL: &str = "wxrelay_routing_reloads_total";
    /// Rules in the active snapshot
    pub const RULES_LOADED: &str = "wxrelay_routing_rules_loaded";
}

/// Common label keys
pub mod labels {
    pub const INSTANCE: &str = "instance";
    pub const PLATFORM: &str = "platform";
    pub const OUTCOME: &str = "outcome";
    pub const REASON: &str = "reason";
    pub const SOURCE: &str = "source";
    pub const SUCCESS: &str = "success";
}
