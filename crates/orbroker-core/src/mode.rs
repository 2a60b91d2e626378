use futures::{StreamExt, stream};
use orbroker_contracts::{ApiErrorBody, ChatCompletionBody, DecodedDelta};
use tracing::debug;

use crate::{BrokerError, DeltaStream, TransportResponse, collect_body, frame::decode_stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    EventStream,
    Document,
}

impl ResponseMode {
    pub fn detect(content_type: Option<&str>) -> Self {
        let is_json = content_type
            .map(|value| value.to_ascii_lowercase())
            .is_some_and(|value| value.contains("application/json"));
        if is_json { Self::Document } else { Self::EventStream }
    }
}

pub async fn into_delta_stream(response: TransportResponse) -> Result<DeltaStream, BrokerError> {
    if !response.is_success() {
        return Err(api_error_from_response(response).await);
    }
    let TransportResponse { status, content_type, body, .. } = response;
    let Some(body) = body else {
        return Err(BrokerError::ProtocolViolation(format!(
            "successful response (status {status}) carried no body"
        )));
    };

    let mode = ResponseMode::detect(content_type.as_deref());
    debug!(event = "stream.mode.detected", mode = ?mode, content_type = content_type.as_deref());
    match mode {
        ResponseMode::EventStream => Ok(decode_stream(body)),
        ResponseMode::Document => {
            let bytes = collect_body(body).await?;
            let deltas = document_deltas(&bytes)?;
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        }
    }
}

pub fn document_deltas(bytes: &[u8]) -> Result<Vec<DecodedDelta>, BrokerError> {
    let body: ChatCompletionBody = serde_json::from_slice(bytes).map_err(|err| {
        BrokerError::ProtocolViolation(format!("response body is not a chat completion: {err}"))
    })?;

    let mut deltas = Vec::with_capacity(3);
    if let Some(message) = body.first_message() {
        if let Some(text) = message.text() {
            deltas.push(DecodedDelta::Text(text));
        }
        if let Some(reasoning) = message.reasoning_text() {
            deltas.push(DecodedDelta::Reasoning(reasoning.to_string()));
        }
    }
    deltas.push(DecodedDelta::Done);
    Ok(deltas)
}

pub async fn api_error_from_response(response: TransportResponse) -> BrokerError {
    let status = response.status;
    let fallback = if response.status_text.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        response.status_text.clone()
    };
    let message = match response.read_body().await {
        Ok(bytes) => serde_json::from_slice::<ApiErrorBody>(&bytes)
            .ok()
            .and_then(|body| body.message().map(ToString::to_string))
            .unwrap_or(fallback),
        Err(err) => {
            debug!(event = "response.error_body.unreadable", status, error = %err);
            fallback
        }
    };
    BrokerError::Api { status, message }
}
