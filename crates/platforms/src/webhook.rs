//! Forward messages to an HTTP endpoint and relay its answer.
//!
//! The request body is the message as JSON. The response may carry the reply
//! in `content` or `reply`; a non-empty `error` field fails the delivery.

use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::debug,
    wxrelay_channels::{Error, Message, Platform, PlatformReply, Result},
    wxrelay_config::{PlatformEntry, SendMode},
};

use crate::{DEFAULT_REQUEST_TIMEOUT, display_name, http_client, parse_options};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookOptions {
    url: String,
    timeout_secs: Option<u64>,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    message_id: &'a str,
    instance_id: &'a str,
    chat_name: &'a str,
    sender: &'a str,
    sender_remark: Option<&'a str>,
    content: &'a str,
    message_type: &'a str,
    create_time: u64,
    merged: bool,
    merged_count: u32,
}

impl<'a> From<&'a Message> for WebhookRequest<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            message_id: &m.message_id,
            instance_id: &m.instance_id,
            chat_name: &m.chat_name,
            sender: &m.sender,
            sender_remark: m.sender_remark.as_deref(),
            content: &m.content,
            message_type: &m.message_type,
            create_time: m.create_time_ms,
            merged: m.merged,
            merged_count: m.merged_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookResponse {
    content: Option<String>,
    reply: Option<String>,
    error: Option<String>,
}

pub struct WebhookPlatform {
    id: String,
    name: String,
    send_mode: SendMode,
    url: String,
    token: Option<Secret<String>>,
    client: reqwest::Client,
}

impl WebhookPlatform {
    pub fn from_entry(entry: &PlatformEntry) -> Result<Self> {
        let options: WebhookOptions = parse_options(entry)?;
        let url = options.url.trim();
        if url.is_empty() {
            return Err(Error::invalid_input(format!(
                "webhook platform {} has no url",
                entry.id
            )));
        }
        let timeout = options
            .timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs);
        Ok(Self {
            id: entry.id.clone(),
            name: display_name(entry),
            send_mode: entry.send_mode,
            url: url.to_string(),
            token: entry.api_key.clone(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Platform for WebhookPlatform {
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
        let mut request = self
            .client
            .post(&self.url)
            .json(&WebhookRequest::from(message));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::external("webhook request failed", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::unavailable(format!(
                "webhook {} returned HTTP {status}: {body}",
                self.id
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::external("webhook response unreadable", e))?;
        if body.trim().is_empty() {
            return Ok(PlatformReply::none());
        }
        let parsed: WebhookResponse = serde_json::from_str(&body)?;
        if let Some(error) = parsed.error.filter(|e| !e.trim().is_empty()) {
            return Err(Error::unavailable(format!("webhook {}: {error}", self.id)));
        }
        debug!(platform_id = %self.id, message_id = %message.message_id, "webhook answered");
        Ok(match parsed.content.or(parsed.reply) {
            Some(text) => PlatformReply::text(text),
            None => PlatformReply::none(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use {
        axum::{
            Json, Router,
            http::{HeaderMap, StatusCode},
            routing::post,
        },
        serde_json::{Value, json},
    };

    use super::*;

    #[derive(Default)]
    struct Captured {
        bodies: Vec<Value>,
        auth: Vec<Option<String>>,
    }

    async fn start_mock(status: StatusCode, answer: Value) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let cap = Arc::clone(&captured);
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let cap = Arc::clone(&cap);
                let answer = answer.clone();
                async move {
                    let mut cap = cap.lock().unwrap();
                    cap.bodies.push(body);
                    cap.auth.push(
                        headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from),
                    );
                    (status, Json(answer))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), captured)
    }

    fn platform(url: &str, token: Option<&str>) -> WebhookPlatform {
        WebhookPlatform::from_entry(&PlatformEntry {
            id: "hook".into(),
            api_key: token.map(|t| Secret::new(t.to_string())),
            options: json!({ "url": url, "timeout_secs": 5 }),
            ..Default::default()
        })
        .unwrap()
    }

    fn message() -> Message {
        let mut m = Message::new("wx1:1", "wx1", "Family", "alice", "ping", 1_000);
        m.sender_remark = Some("Mom".into());
        m
    }

    #[tokio::test]
    async fn relays_content_and_sends_bearer_token() {
        let (url, captured) = start_mock(StatusCode::OK, json!({ "content": "pong" })).await;
        let reply = platform(&url, Some("s3cret"))
            .process_message(&message())
            .await
            .unwrap();
        assert_eq!(reply.sendable(), Some("pong"));

        let cap = captured.lock().unwrap();
        assert_eq!(cap.auth[0].as_deref(), Some("Bearer s3cret"));
        assert_eq!(cap.bodies[0]["chat_name"], "Family");
        assert_eq!(cap.bodies[0]["sender_remark"], "Mom");
        assert_eq!(cap.bodies[0]["content"], "ping");
    }

    #[tokio::test]
    async fn reply_field_is_accepted() {
        let (url, captured) = start_mock(StatusCode::OK, json!({ "reply": "ok" })).await;
        let reply = platform(&url, None).process_message(&message()).await.unwrap();
        assert_eq!(reply.sendable(), Some("ok"));
        assert_eq!(captured.lock().unwrap().auth[0], None);
    }

    #[tokio::test]
    async fn silent_answer_means_no_reply() {
        let (url, _) = start_mock(StatusCode::OK, json!({})).await;
        let reply = platform(&url, None).process_message(&message()).await.unwrap();
        assert_eq!(reply.sendable(), None);
    }

    #[tokio::test]
    async fn error_field_fails() {
        let (url, _) = start_mock(StatusCode::OK, json!({ "error": "quota exceeded" })).await;
        let err = platform(&url, None)
            .process_message(&message())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn http_error_fails() {
        let (url, _) = start_mock(StatusCode::BAD_GATEWAY, json!({ "content": "x" })).await;
        let err = platform(&url, None)
            .process_message(&message())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
