//! [`Endpoint`] implementation for wxauto-style HTTP instances.
//!
//! Every route answers with an envelope `{code, message, data}`; a non-zero
//! `code` is an instance-side refusal. Requests carry the instance's API key
//! in `X-API-Key`.

use std::{sync::Arc, time::Duration};

use {
    tracing::{info, warn},
    wxrelay_channels::{Endpoint, EndpointRegistry},
    wxrelay_config::InstanceEntry,
};

pub mod client;
pub mod payload;

pub use client::WxAutoClient;

/// Register a client for every enabled instance. Returns how many were
/// registered.
pub fn register_instances(
    entries: &[InstanceEntry],
    registry: &EndpointRegistry,
    timeout: Duration,
) -> usize {
    let mut registered = 0;
    for entry in entries.iter().filter(|e| e.enabled) {
        match WxAutoClient::from_entry(entry, timeout) {
            Ok(client) => {
                registry.register(Arc::new(client) as Arc<dyn Endpoint>);
                registered += 1;
            },
            Err(e) => warn!(instance_id = %entry.id, error = %e, "invalid instance entry"),
        }
    }
    info!(registered, "instances registered");
    registered
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_enabled_instances_only() {
        let entries = vec![
            InstanceEntry {
                id: "wx1".into(),
                ..Default::default()
            },
            InstanceEntry {
                id: "wx2".into(),
                enabled: false,
                ..Default::default()
            },
            InstanceEntry {
                id: "wx3".into(),
                base_url: String::new(),
                ..Default::default()
            },
        ];
        let registry = EndpointRegistry::new();
        assert_eq!(
            register_instances(&entries, &registry, Duration::from_secs(1)),
            1
        );
        assert!(registry.contains("wx1"));
    }
}
