use std::sync::Arc;

use futures::StreamExt;
use orbroker_contracts::{Credentials, DecodedDelta, ProgressEvent, RequestPayload};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{BrokerError, HttpTransport, OutboundRequest, ProgressSink, mode::into_delta_stream};

type TextCallback = Box<dyn FnMut(&str) + Send>;

/// Exactly one of `on_complete` or `on_error` fires, unless the call is cancelled.
pub struct StreamCallbacks {
    on_token: TextCallback,
    on_reasoning: Option<TextCallback>,
    on_complete: Box<dyn FnOnce(String) + Send>,
    on_error: Box<dyn FnOnce(BrokerError) + Send>,
}

impl StreamCallbacks {
    pub fn new(
        on_token: impl FnMut(&str) + Send + 'static,
        on_complete: impl FnOnce(String) + Send + 'static,
        on_error: impl FnOnce(BrokerError) + Send + 'static,
    ) -> Self {
        Self {
            on_token: Box::new(on_token),
            on_reasoning: None,
            on_complete: Box::new(on_complete),
            on_error: Box::new(on_error),
        }
    }

    pub fn with_reasoning(mut self, on_reasoning: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_reasoning = Some(Box::new(on_reasoning));
        self
    }
}

struct StreamSession {
    request_id: String,
    accumulated: String,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct StreamDispatcher {
    transport: Arc<dyn HttpTransport>,
    progress: Arc<dyn ProgressSink>,
}

impl StreamDispatcher {
    pub fn new(transport: Arc<dyn HttpTransport>, progress: Arc<dyn ProgressSink>) -> Self {
        Self { transport, progress }
    }

    /// Outside a tokio runtime the call fails through `on_error`.
    pub fn stream_request(
        &self,
        credentials: Credentials,
        payload: RequestPayload,
        callbacks: StreamCallbacks,
        cancel: CancellationToken,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = "stream.no_runtime", model = %payload.model);
            (callbacks.on_error)(BrokerError::Transport("no tokio runtime available".to_string()));
            return;
        };
        let dispatcher = self.clone();
        runtime.spawn(async move {
            dispatcher.run(&credentials, payload, callbacks, cancel).await;
        });
    }

    pub async fn run(
        &self,
        credentials: &Credentials,
        payload: RequestPayload,
        mut callbacks: StreamCallbacks,
        cancel: CancellationToken,
    ) {
        let mut session = StreamSession {
            request_id: Uuid::new_v4().to_string(),
            accumulated: String::new(),
            cancel,
        };
        let span =
            info_span!("stream_request", request_id = %session.request_id, model = %payload.model);

        async move {
            match self.drive(&mut session, credentials, payload, &mut callbacks).await {
                Ok(()) => {
                    let chars = session.accumulated.chars().count();
                    info!(event = "stream.completed", chars);
                    self.progress.notify(ProgressEvent::Completed {
                        request_id: session.request_id,
                        chars,
                    });
                    (callbacks.on_complete)(session.accumulated);
                }
                Err(BrokerError::Cancelled) => {
                    info!(event = "stream.cancelled", chars = session.accumulated.chars().count());
                }
                Err(err) => {
                    warn!(event = "stream.failed", error = %err);
                    self.progress.notify(ProgressEvent::Failed {
                        request_id: session.request_id,
                        message: err.to_string(),
                    });
                    (callbacks.on_error)(err);
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &mut StreamSession,
        credentials: &Credentials,
        payload: RequestPayload,
        callbacks: &mut StreamCallbacks,
    ) -> Result<(), BrokerError> {
        let payload = payload.into_streaming();
        let request = OutboundRequest::chat(credentials, &payload)?;
        self.progress.notify(ProgressEvent::RequestStarted {
            request_id: session.request_id.clone(),
            model: payload.model.clone(),
            streaming: true,
        });

        let cancel = session.cancel.clone();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            response = self.transport.post(request) => response?,
        };
        let mut deltas = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            deltas = into_delta_stream(response) => deltas?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                next = deltas.next() => next,
            };
            match next {
                Some(Ok(DecodedDelta::Text(text))) => {
                    session.accumulated.push_str(&text);
                    (callbacks.on_token)(&text);
                }
                Some(Ok(DecodedDelta::Reasoning(text))) => {
                    if let Some(on_reasoning) = callbacks.on_reasoning.as_mut() {
                        on_reasoning(&text);
                    }
                }
                Some(Ok(DecodedDelta::Done)) | None => {
                    debug!(event = "stream.drained");
                    return Ok(());
                }
                Some(Err(err)) => return Err(err),
            }
        }
    }
}
