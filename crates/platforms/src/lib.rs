//! Concrete message-processing platforms.
//!
//! Each platform entry in the config names a `kind`; [`build_platform`] turns
//! an entry into the matching [`Platform`] implementation.

use std::{sync::Arc, time::Duration};

use {
    serde::de::DeserializeOwned,
    tracing::{info, warn},
    wxrelay_channels::{Error, Platform, PlatformRegistry, Result},
    wxrelay_config::{PlatformEntry, PlatformKind},
};

pub mod keyword;
pub mod openai;
pub mod webhook;

pub use {keyword::KeywordPlatform, openai::OpenAiPlatform, webhook::WebhookPlatform};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the platform described by `entry`.
pub fn build_platform(entry: &PlatformEntry) -> Result<Arc<dyn Platform>> {
    if entry.id.trim().is_empty() {
        return Err(Error::invalid_input("platform id is empty"));
    }
    let platform: Arc<dyn Platform> = match entry.kind {
        PlatformKind::Webhook => Arc::new(WebhookPlatform::from_entry(entry)?),
        PlatformKind::Keyword => Arc::new(KeywordPlatform::from_entry(entry)?),
        PlatformKind::Openai => Arc::new(OpenAiPlatform::from_entry(entry)?),
    };
    Ok(platform)
}

/// Register every enabled entry. Entries that fail to build are logged and
/// skipped. Returns how many platforms were registered.
pub fn register_platforms(entries: &[PlatformEntry], registry: &PlatformRegistry) -> usize {
    let mut registered = 0;
    for entry in entries {
        if !entry.enabled {
            info!(platform_id = %entry.id, "platform disabled, skipping");
            continue;
        }
        match build_platform(entry) {
            Ok(platform) => {
                registry.register(platform);
                registered += 1;
            },
            Err(e) => warn!(platform_id = %entry.id, error = %e, "invalid platform entry"),
        }
    }
    registered
}

/// Deserialize kind-specific options, treating a missing table as defaults.
pub(crate) fn parse_options<T: DeserializeOwned + Default>(entry: &PlatformEntry) -> Result<T> {
    if entry.options.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(entry.options.clone())?)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::external("failed to build HTTP client", e))
}

pub(crate) fn display_name(entry: &PlatformEntry) -> String {
    if entry.name.trim().is_empty() {
        entry.id.clone()
    } else {
        entry.name.clone()
    }
}
