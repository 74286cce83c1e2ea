//! Outbound replies.
//!
//! Sends are serialised, and listener polling is paused for the whole send
//! (retries included) so the reply cannot be picked up mid-flight. Every
//! successful send is remembered by the echo guard.

use std::{sync::Arc, time::Duration};

use {
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
    wxrelay_channels::{EchoGuard, EndpointRegistry, PlatformRegistry, SendMode, SendOptions},
    wxrelay_common::{bounded, now_ms},
    wxrelay_config::SenderConfig,
    wxrelay_listener::PauseGate,
};

#[cfg(feature = "metrics")]
use wxrelay_metrics::{counter, labels, sender as sender_metrics};

/// Upper bound for a single send attempt.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub instance_id: String,
    /// Target conversation.
    pub who: String,
    pub text: String,
    /// Explicit mode. Falls back to the platform's mode, then plain.
    pub mode: Option<SendMode>,
    /// Platform that produced the reply, used to resolve the mode.
    pub platform_id: Option<String>,
    pub mentions: Vec<String>,
}

impl SendRequest {
    pub fn new(
        instance_id: impl Into<String>,
        who: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            who: who.into(),
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
    pub ok: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl SendResult {
    fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            attempts,
        }
    }
}

pub struct MessageSender {
    endpoints: Arc<EndpointRegistry>,
    platforms: Arc<PlatformRegistry>,
    gate: PauseGate,
    echo: Arc<EchoGuard>,
    settings: SenderConfig,
    send_lock: Mutex<()>,
}

impl MessageSender {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        platforms: Arc<PlatformRegistry>,
        gate: PauseGate,
        echo: Arc<EchoGuard>,
        settings: SenderConfig,
    ) -> Self {
        Self {
            endpoints,
            platforms,
            gate,
            echo,
            settings,
            send_lock: Mutex::new(()),
        }
    }

    pub fn resolve_mode(&self, request: &SendRequest) -> SendMode {
        request
            .mode
            .or_else(|| {
                request
                    .platform_id
                    .as_deref()
                    .and_then(|id| self.platforms.get(id))
                    .map(|p| p.send_mode())
            })
            .unwrap_or_default()
    }

    /// Send a reply. Failures are reported in the result, never raised.
    pub async fn send(&self, request: &SendRequest) -> SendResult {
        let text = request.text.trim();
        if text.is_empty() {
            return SendResult::failed("empty message", 0);
        }
        let Some(endpoint) = self.endpoints.get(&request.instance_id) else {
            warn!(instance_id = %request.instance_id, "send to unknown instance");
            return SendResult::failed(format!("unknown instance: {}", request.instance_id), 0);
        };
        let options = SendOptions {
            mode: self.resolve_mode(request),
            mentions: request.mentions.clone(),
        };

        let _serial = self.send_lock.lock().await;
        let _paused = self.gate.pause();

        let max_attempts = self.settings.max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match bounded(
                "send_message",
                SEND_TIMEOUT,
                endpoint.send_message(&request.who, text, &options),
            )
            .await
            {
                Ok(outcome) if outcome.ok => {
                    self.echo
                        .record(&request.instance_id, &request.who, text, now_ms());
                    info!(
                        instance_id = %request.instance_id,
                        who = %request.who,
                        mode = ?options.mode,
                        attempt,
                        "reply sent"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(sender_metrics::SENDS_TOTAL, labels::SUCCESS => "true").increment(1);
                    return SendResult {
                        ok: true,
                        error: None,
                        attempts: attempt,
                    };
                },
                Ok(outcome) => {
                    last_error = outcome
                        .error
                        .unwrap_or_else(|| "instance rejected the send".into());
                },
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                debug!(
                    instance_id = %request.instance_id,
                    who = %request.who,
                    attempt,
                    error = %last_error,
                    "send failed, retrying"
                );
                #[cfg(feature = "metrics")]
                counter!(sender_metrics::RETRIES_TOTAL).increment(1);
                tokio::time::sleep(self.settings.retry_backoff()).await;
            }
        }

        warn!(
            instance_id = %request.instance_id,
            who = %request.who,
            attempts = max_attempts,
            error = %last_error,
            "reply not sent"
        );
        #[cfg(feature = "metrics")]
        counter!(sender_metrics::SENDS_TOTAL, labels::SUCCESS => "false").increment(1);
        SendResult::failed(last_error, max_attempts)
    }
}
