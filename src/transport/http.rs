//! HTTP transport
//!
//! JSON over HTTP with reqwest. Uploads are multipart: a `data` part with
//! the encoded document, then one part per attachment.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{ServerRef, Transport, UploadRequest};
use crate::config::ServerConfig;
use crate::error::SyncError;

/// Longest response body quoted in an error message
const MAX_ERROR_BODY: usize = 512;

/// reqwest-backed [`Transport`]
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// Create new transport
    ///
    /// # Errors
    /// Returns error if the base URL is invalid or the client cannot be built
    pub fn new(config: &ServerConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.normalized_base_url())
            .map_err(|e| SyncError::Config(format!("invalid server.base_url: {}", e)))?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SyncError::Internal(e.into()))?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
        })
    }

    /// Absolute URL of a server reference, query variables appended
    pub fn url_for(&self, server_ref: &ServerRef) -> Result<Url, SyncError> {
        let mut url = self.resolve(&server_ref.endpoint)?;
        if !server_ref.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &server_ref.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn resolve(&self, endpoint: &str) -> Result<Url, SyncError> {
        if let Ok(absolute) = Url::parse(endpoint) {
            return Ok(absolute);
        }
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| SyncError::Validation(format!("invalid endpoint {}: {}", endpoint, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, server_ref: &ServerRef) -> Result<Value, SyncError> {
        let url = self.url_for(server_ref)?;
        tracing::debug!(url = %url, "Fetching remote payload");

        let response = self
            .authorize(self.client.get(url.clone()))
            .header("Accept", "application/json")
            .send()
            .await
            .inspect_err(|_| observe("GET", "network"))?;

        let status = response.status();
        observe("GET", status.as_str());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport_error(status, &body));
        }

        Ok(response.json::<Value>().await?)
    }

    async fn send(
        &self,
        server_ref: &ServerRef,
        request: &UploadRequest,
    ) -> Result<Value, SyncError> {
        let url = self.url_for(server_ref)?;

        let mut form = Form::new().part(
            "data",
            Part::text(serde_json::to_string(&request.document)?)
                .mime_str("application/json")?,
        );
        for attachment in &request.attachments {
            form = form.part(
                attachment.name.clone(),
                Part::bytes(attachment.bytes.clone()).file_name(attachment.name.clone()),
            );
        }

        tracing::debug!(
            url = %url,
            attachments = request.attachments.len(),
            "Sending upload"
        );

        let response = self
            .authorize(self.client.post(url.clone()))
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await
            .inspect_err(|_| observe("POST", "network"))?;

        let status = response.status();
        observe("POST", status.as_str());
        let body = response.text().await?;
        let parsed = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()))
        };

        if status.is_success() {
            return Ok(parsed);
        }

        // Per-record rejections are reconciled, not treated as a failed request
        if !crate::sync::parse_rejections(&parsed).is_empty() {
            tracing::warn!(
                url = %url,
                status = %status,
                "Server rejected part of the upload"
            );
            return Ok(parsed);
        }

        Err(transport_error(status, &body))
    }

    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        let url = self.resolve(url)?;
        tracing::debug!(url = %url, "Fetching attachment");

        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .inspect_err(|_| observe("GET", "network"))?;

        let status = response.status();
        observe("GET", status.as_str());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport_error(status, &body));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn observe(method: &str, status: &str) {
    crate::metrics::TRANSPORT_REQUESTS_TOTAL
        .with_label_values(&[method, status])
        .inc();
}

fn transport_error(status: reqwest::StatusCode, body: &str) -> SyncError {
    let mut message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if message.is_empty() {
        message = status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    SyncError::Transport {
        status: status.as_u16(),
        message,
    }
}
