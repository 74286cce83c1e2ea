//! OpenAI-compatible chat completions.

use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{debug, trace, warn},
    wxrelay_channels::{Error, Message, Platform, PlatformReply, Result},
    wxrelay_config::{PlatformEntry, SendMode},
};

use crate::{DEFAULT_REQUEST_TIMEOUT, display_name, http_client, parse_options};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenAiOptions {
    base_url: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

pub struct OpenAiPlatform {
    id: String,
    name: String,
    send_mode: SendMode,
    base_url: String,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    api_key: Option<Secret<String>>,
    client: reqwest::Client,
}

impl OpenAiPlatform {
    pub fn from_entry(entry: &PlatformEntry) -> Result<Self> {
        let options: OpenAiOptions = parse_options(entry)?;
        let base_url = options
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let timeout = options
            .timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs);
        Ok(Self {
            id: entry.id.clone(),
            name: display_name(entry),
            send_mode: entry.send_mode,
            base_url,
            model: options
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            system_prompt: options.system_prompt.filter(|p| !p.trim().is_empty()),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            api_key: entry.api_key.clone(),
            client: http_client(timeout)?,
        })
    }

    fn request_body(&self, message: &Message) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": prompt }));
        }
        messages.push(json!({ "role": "user", "content": message.content }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

/// Content of the first choice, if any.
fn first_choice(resp: &Value) -> Option<&str> {
    resp["choices"][0]["message"]["content"].as_str()
}

#[async_trait]
impl Platform for OpenAiPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    async fn process_message(&self, message: &Message) -> Result<PlatformReply> {
        let body = self.request_body(message);
        debug!(
            platform_id = %self.id,
            model = %self.model,
            message_id = %message.message_id,
            "chat completion request"
        );
        trace!(body = %body, "chat completion body");

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }
        let http_resp = request
            .send()
            .await
            .map_err(|e| Error::external("chat completion request failed", e))?;

        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(
                platform_id = %self.id,
                status = %status,
                model = %self.model,
                body = %body_text,
                "chat completion API error"
            );
            return Err(Error::unavailable(format!(
                "chat completion HTTP {status}: {body_text}"
            )));
        }

        let resp = http_resp
            .json::<Value>()
            .await
            .map_err(|e| Error::external("chat completion response unreadable", e))?;
        trace!(response = %resp, "chat completion raw response");
        Ok(match first_choice(&resp) {
            Some(text) => PlatformReply::text(text),
            None => PlatformReply::none(),
        })
    }
}
