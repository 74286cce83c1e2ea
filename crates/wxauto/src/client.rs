use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    reqwest::{Method, RequestBuilder},
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tracing::{debug, trace},
    wxrelay_channels::{
        Endpoint, Error, FetchOptions, RawMessage, Result, SendMode, SendOptions, SendOutcome,
    },
    wxrelay_config::InstanceEntry,
};

use crate::payload::{Envelope, is_healthy, listener_map, message_list};

const API_KEY_HEADER: &str = "X-API-Key";

/// HTTP client for one wxauto instance.
pub struct WxAutoClient {
    instance_id: String,
    base_url: String,
    api_key: Option<Secret<String>>,
    client: reqwest::Client,
}

impl WxAutoClient {
    pub fn new(
        instance_id: impl Into<String>,
        base_url: &str,
        api_key: Option<Secret<String>>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::invalid_input("instance base_url is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::external("failed to build HTTP client", e))?;
        Ok(Self {
            instance_id: instance_id.into(),
            base_url: base_url.to_string(),
            api_key,
            client,
        })
    }

    pub fn from_entry(entry: &InstanceEntry, timeout: Duration) -> Result<Self> {
        Self::new(&entry.id, &entry.base_url, entry.api_key.clone(), timeout)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key.expose_secret()),
            None => builder,
        }
    }

    /// Send a request and unwrap the envelope, returning `data`.
    async fn call(&self, operation: &str, request: RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::external(format!("{operation} request failed"), e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::external(format!("{operation} response unreadable"), e))?;
        trace!(instance_id = %self.instance_id, operation, %status, body = %body, "wxauto response");

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::unavailable(format!("{operation} returned HTTP {status}")));
            },
            Err(e) => return Err(e.into()),
        };
        if envelope.code != 0 {
            return Err(Error::rejected(
                &self.instance_id,
                operation,
                format!("code {}: {}", envelope.code, envelope.message),
            ));
        }
        Ok(envelope.data)
    }

    async fn get(&self, operation: &str, path: &str) -> Result<Value> {
        self.call(operation, self.request(Method::GET, path)).await
    }

    async fn post(&self, operation: &str, path: &str, body: Value) -> Result<Value> {
        self.call(operation, self.request(Method::POST, path).json(&body))
            .await
    }
}

/// Turn an instance-side refusal into `Ok(false)`, keeping transport errors.
fn refused_as_false(result: Result<Value>, instance_id: &str, who: &str) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(Error::Rejected { message, .. }) => {
            debug!(instance_id, who, message = %message, "instance refused listener change");
            Ok(false)
        },
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Endpoint for WxAutoClient {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn initialize(&self) -> Result<bool> {
        self.post("initialize", "/api/wechat/initialize", json!({}))
            .await?;
        Ok(true)
    }

    async fn health_check(&self) -> Result<bool> {
        let data = self.get("health", "/api/health").await?;
        Ok(is_healthy(&data))
    }

    async fn fetch_unread(&self, opts: &FetchOptions) -> Result<Vec<RawMessage>> {
        let request = self
            .request(Method::GET, "/api/message/get-next-new")
            .query(opts);
        let data = self.call("get_next_new", request).await?;
        Ok(message_list(&data, None))
    }

    async fn add_listener(&self, who: &str, opts: &FetchOptions) -> Result<bool> {
        let mut body = serde_json::to_value(opts)?;
        body["who"] = json!(who);
        let result = self
            .post("listen_add", "/api/message/listen/add", body)
            .await;
        refused_as_false(result, &self.instance_id, who)
    }

    async fn remove_listener(&self, who: &str) -> Result<bool> {
        let result = self
            .post(
                "listen_remove",
                "/api/message/listen/remove",
                json!({ "who": who }),
            )
            .await;
        refused_as_false(result, &self.instance_id, who)
    }

    async fn fetch_all_listener_messages(&self) -> Result<HashMap<String, Vec<RawMessage>>> {
        let data = self
            .get("listen_get_all", "/api/message/listen/get-all")
            .await?;
        Ok(listener_map(&data))
    }

    async fn fetch_listener_messages(&self, who: &str) -> Result<Vec<RawMessage>> {
        let request = self
            .request(Method::GET, "/api/message/listen/get")
            .query(&[("who", who)]);
        let data = self.call("listen_get", request).await?;
        Ok(message_list(&data, Some(who)))
    }

    async fn send_message(&self, who: &str, text: &str, opts: &SendOptions) -> Result<SendOutcome> {
        let (operation, path) = match opts.mode {
            SendMode::Plain => ("send", "/api/message/send"),
            SendMode::Typing => ("send_typing", "/api/message/send-typing"),
        };
        let mut body = json!({ "who": who, "message": text });
        if !opts.mentions.is_empty() {
            body["at_list"] = json!(opts.mentions);
        }
        match self.post(operation, path, body).await {
            Ok(_) => Ok(SendOutcome::ok()),
            Err(Error::Rejected { message, .. }) => Ok(SendOutcome::failed(message)),
            Err(e) => Err(e),
        }
    }
}
