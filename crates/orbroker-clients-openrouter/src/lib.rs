use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use orbroker_core::{BrokerError, HttpTransport, OutboundRequest, TransportResponse};
use reqwest::{Client, RequestBuilder, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tracing::debug;

mod balance;
mod models;

pub use balance::query_balance;
pub use models::list_models;

pub const DEFAULT_APP_REFERER: &str = "https://github.com/orbroker/orbroker";
pub const DEFAULT_APP_TITLE: &str = "orbroker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub referer: String,
    pub title: String,
}

impl Default for AppIdentity {
    fn default() -> Self {
        Self { referer: DEFAULT_APP_REFERER.to_string(), title: DEFAULT_APP_TITLE.to_string() }
    }
}

pub struct OpenRouterTransport {
    client: Client,
    identity: AppIdentity,
}

impl OpenRouterTransport {
    /// Only the connect phase is bounded: a streamed completion may stay open
    /// for as long as the model keeps generating.
    pub fn build_http_client(connect_timeout: Duration) -> Result<Client, BrokerError> {
        Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| BrokerError::Transport(format!("http client init failed: {err}")))
    }

    pub fn new(connect_timeout: Duration, identity: AppIdentity) -> Result<Self, BrokerError> {
        Ok(Self::new_with_http_client(Self::build_http_client(connect_timeout)?, identity))
    }

    pub fn new_with_http_client(client: Client, identity: AppIdentity) -> Self {
        Self { client, identity }
    }

    fn build_http_request(&self, request: RequestBuilder, api_key: &str) -> RequestBuilder {
        let mut request = request
            .header("HTTP-Referer", &self.identity.referer)
            .header("X-Title", &self.identity.title);
        if !api_key.trim().is_empty() {
            request = request.bearer_auth(api_key.trim());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<TransportResponse, BrokerError> {
        let response = request
            .send()
            .await
            .map_err(|err| BrokerError::Transport(format!("request failed: {err}")))?;
        Ok(into_transport_response(response))
    }
}

#[async_trait]
impl HttpTransport for OpenRouterTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, BrokerError> {
        debug!(event = "http.post", url = %request.url);
        let builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body);
        self.send(self.build_http_request(builder, &request.api_key)).await
    }

    async fn get(&self, url: &str, api_key: &str) -> Result<TransportResponse, BrokerError> {
        debug!(event = "http.get", url);
        self.send(self.build_http_request(self.client.get(url), api_key)).await
    }
}

fn into_transport_response(response: reqwest::Response) -> TransportResponse {
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let body = (response.content_length() != Some(0)).then(|| {
        response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|err| BrokerError::Transport(format!("body read failed: {err}")))
            })
            .boxed()
    });
    TransportResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        content_type,
        body,
    }
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    transport: &dyn HttpTransport,
    url: &str,
    api_key: &str,
) -> Result<T, BrokerError> {
    let response = transport.get(url, api_key).await?;
    if !response.is_success() {
        return Err(orbroker_core::mode::api_error_from_response(response).await);
    }
    let bytes = response.read_body().await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| BrokerError::ProtocolViolation(format!("unexpected body from {url}: {err}")))
}
