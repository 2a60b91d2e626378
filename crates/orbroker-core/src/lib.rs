use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use orbroker_contracts::{Credentials, ProgressEvent, RequestPayload, SettingsBlob};
use serde_json::Value;

pub mod dispatch;
pub mod frame;
pub mod mode;
pub mod retry;
pub mod thinking;

pub use dispatch::{StreamCallbacks, StreamDispatcher};
pub use frame::{FrameDecoder, decode_stream};
pub use mode::into_delta_stream;
pub use retry::{RetryController, RetryPolicy};
pub use thinking::{strip_thinking, strip_thinking_from_body};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("OpenRouter API key is not configured")]
    MissingCredential,
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("settings store error: {0}")]
    Store(String),
}

impl BrokerError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, BrokerError>>;

pub type DeltaStream = BoxStream<'static, Result<orbroker_contracts::DecodedDelta, BrokerError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub api_key: String,
    pub body: Value,
}

impl OutboundRequest {
    pub fn chat(credentials: &Credentials, payload: &RequestPayload) -> Result<Self, BrokerError> {
        if !credentials.has_api_key() {
            return Err(BrokerError::MissingCredential);
        }
        let body = serde_json::to_value(payload)
            .map_err(|err| BrokerError::ProtocolViolation(format!("payload encode failed: {err}")))?;
        Ok(Self {
            url: credentials.endpoint_url.clone(),
            api_key: credentials.api_key.trim().to_string(),
            body,
        })
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    pub body: Option<ByteStream>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub async fn read_body(self) -> Result<Vec<u8>, BrokerError> {
        match self.body {
            Some(body) => collect_body(body).await,
            None => Ok(Vec::new()),
        }
    }
}

pub async fn collect_body(mut body: ByteStream) -> Result<Vec<u8>, BrokerError> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected)
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("content_type", &self.content_type)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, BrokerError>;
    async fn get(&self, url: &str, api_key: &str) -> Result<TransportResponse, BrokerError>;
}

pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn notify(&self, _event: ProgressEvent) {}
}

pub trait SettingsBackend: Send + Sync {
    fn load(&self) -> Result<Option<SettingsBlob>, BrokerError>;
    fn save(&self, blob: &SettingsBlob) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait ModelSelector: Send + Sync {
    async fn select_model(&self, caller_id: &str, current: Option<&str>) -> Option<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use futures::stream;
    use tokio::time::Instant;

    use super::*;

    pub(crate) fn body_from_chunks(chunks: Vec<Vec<u8>>) -> ByteStream {
        stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk)))).boxed()
    }

    pub(crate) fn response(status: u16, content_type: &str, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            status_text: status_text(status).to_string(),
            content_type: Some(content_type.to_string()),
            body: Some(body_from_chunks(vec![body.as_bytes().to_vec()])),
        }
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            401 => "Unauthorized",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            _ => "",
        }
    }

    pub(crate) fn credentials() -> Credentials {
        Credentials {
            api_key: "sk-or-test".to_string(),
            endpoint_url: "http://openrouter.test/api/v1/chat/completions".to_string(),
        }
    }

    pub(crate) type Scripted = Box<dyn FnOnce() -> Result<TransportResponse, BrokerError> + Send>;

    pub(crate) fn scripted(
        respond: impl FnOnce() -> Result<TransportResponse, BrokerError> + Send + 'static,
    ) -> Scripted {
        Box::new(respond)
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        pub(crate) requests: Mutex<Vec<(Instant, OutboundRequest)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), requests: Mutex::default() })
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, BrokerError> {
            self.requests.lock().expect("requests lock").push((Instant::now(), request));
            let next = self.script.lock().expect("script lock").pop_front();
            match next {
                Some(respond) => respond(),
                None => Err(BrokerError::Transport("script exhausted".to_string())),
            }
        }

        async fn get(&self, _url: &str, _api_key: &str) -> Result<TransportResponse, BrokerError> {
            Err(BrokerError::Transport("not scripted".to_string()))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingProgress {
        pub(crate) events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingProgress {
        fn notify(&self, event: ProgressEvent) {
            self.events.lock().expect("events lock").push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use orbroker_contracts::ChatMessage;

    use super::*;

    #[test]
    fn chat_request_requires_api_key() {
        let credentials = Credentials {
            api_key: "   ".to_string(),
            endpoint_url: "http://localhost".to_string(),
        };
        let payload = RequestPayload::new("m", vec![ChatMessage::user("hi")]);
        assert_eq!(OutboundRequest::chat(&credentials, &payload), Err(BrokerError::MissingCredential));
    }

    #[test]
    fn chat_request_carries_payload_and_endpoint() {
        let credentials = testing::credentials();
        let payload = RequestPayload::new("openai/gpt-4o", vec![ChatMessage::user("hi")]);
        let request = OutboundRequest::chat(&credentials, &payload).expect("request");
        assert_eq!(request.url, credentials.endpoint_url);
        assert_eq!(request.api_key, "sk-or-test");
        assert_eq!(request.body["model"], "openai/gpt-4o");
        assert_eq!(request.body["messages"][0]["content"], "hi");
    }

    #[test]
    fn only_429_counts_as_rate_limited() {
        let limited = BrokerError::Api { status: 429, message: "slow down".to_string() };
        let server = BrokerError::Api { status: 500, message: "boom".to_string() };
        assert!(limited.is_rate_limited());
        assert!(!server.is_rate_limited());
        assert!(!BrokerError::Transport("reset".to_string()).is_rate_limited());
    }
}
