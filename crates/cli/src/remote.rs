//! HTTP client for a running gateway's API.

use anyhow::{Context, bail};
use channels::http::{
    SendRequest, StatusResponse, WebhookAddedResponse, WebhookListResponse, WebhookRemovedResponse,
    WebhookRequest,
};
use gateway::LoginStatus;
use serde::de::DeserializeOwned;

/// Thin client over the gateway HTTP API.
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends the request and decodes a JSON body, surfacing `{"error"}` bodies.
    async fn execute<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<T> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("gateway not reachable at {}", self.base_url))?;
        let status = response.status();
        let body = response.text().await.context("failed to read response")?;
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(body);
            bail!("{status}: {message}");
        }
        serde_json::from_str(&body).with_context(|| format!("unexpected response: {body}"))
    }

    pub async fn login_status(&self) -> anyhow::Result<LoginStatus> {
        self.execute(self.request(reqwest::Method::GET, "/login"))
            .await
    }

    pub async fn send(&self, to: &str, message: &str) -> anyhow::Result<StatusResponse> {
        let body = SendRequest {
            to: to.to_string(),
            message: message.to_string(),
        };
        self.execute(self.request(reqwest::Method::POST, "/send").json(&body))
            .await
    }

    pub async fn logout(&self) -> anyhow::Result<StatusResponse> {
        self.execute(self.request(reqwest::Method::POST, "/logout"))
            .await
    }

    pub async fn add_webhook(&self, url: &str) -> anyhow::Result<WebhookAddedResponse> {
        let body = WebhookRequest {
            url: url.to_string(),
        };
        self.execute(self.request(reqwest::Method::POST, "/webhook").json(&body))
            .await
    }

    pub async fn remove_webhook(&self, url: &str) -> anyhow::Result<WebhookRemovedResponse> {
        let body = WebhookRequest {
            url: url.to_string(),
        };
        self.execute(self.request(reqwest::Method::DELETE, "/webhook").json(&body))
            .await
    }

    pub async fn list_webhooks(&self) -> anyhow::Result<Vec<String>> {
        let list: WebhookListResponse = self
            .execute(self.request(reqwest::Method::GET, "/webhooks"))
            .await?;
        Ok(list.webhooks)
    }
}
