//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::errors::AgentError;
use crate::models::ping::{PingRequest, PingResponse};
use crate::storage::settings::ServiceSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the deploy service
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a client for `<url>/<version>`
    pub fn new(service: &ServiceSettings) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = format!(
            "{}/{}",
            service.url.trim_end_matches('/'),
            service.version.trim_matches('/')
        );
        // reject a malformed service url up front
        Url::parse(&base_url)?;

        Ok(Self {
            client,
            base_url,
            token: service.token.clone().map(SecretString::from),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, AgentError> {
        Ok(Url::parse(&format!("{}{}", self.base_url, path))?)
    }

    /// Make a POST request. An empty body decodes as the default value.
    pub async fn post<T: DeserializeOwned + Default, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AgentError> {
        let url = self.endpoint(path)?;
        debug!("POST {}", url);

        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = self.token.as_ref() {
            request = request.header(
                header::AUTHORIZATION,
                format!("token {}", token.expose_secret()),
            );
        }

        let response = request.send().await?;

        let status = response.status();
        if status.as_u16() > 300 {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP POST failed: {} - {}", status, body);
            return Err(AgentError::PingError(format!(
                "Deploy service call failed: {}: {}",
                status, body
            )));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            debug!("Empty response body from {}", path);
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Report host status and receive the next goal
    pub async fn ping(&self, request: &PingRequest) -> Result<PingResponse, AgentError> {
        self.post("/system/ping", request).await
    }
}
