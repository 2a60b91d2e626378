use std::{sync::Arc, time::Duration};

use orbroker_contracts::{
    ChatCompletionBody, CompletionResponse, Credentials, ProgressEvent, RequestPayload,
};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::{
    BrokerError, HttpTransport, OutboundRequest, ProgressSink, mode::api_error_from_response,
    thinking::strip_thinking_from_body,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(2_000);

const RATE_LIMIT_DELAY_FACTOR: f64 = 2.0;
const FAILURE_DELAY_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, initial_delay: DEFAULT_INITIAL_DELAY }
    }
}

#[derive(Clone)]
pub struct RetryController {
    transport: Arc<dyn HttpTransport>,
    progress: Arc<dyn ProgressSink>,
}

impl RetryController {
    pub fn new(transport: Arc<dyn HttpTransport>, progress: Arc<dyn ProgressSink>) -> Self {
        Self { transport, progress }
    }

    pub async fn execute(
        &self,
        credentials: &Credentials,
        payload: &RequestPayload,
        policy: RetryPolicy,
    ) -> Result<CompletionResponse, BrokerError> {
        let request = OutboundRequest::chat(credentials, payload)?;
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("fetch_with_retry", request_id = %request_id, model = %payload.model);

        async move {
            self.progress.notify(ProgressEvent::RequestStarted {
                request_id: request_id.clone(),
                model: payload.model.clone(),
                streaming: false,
            });
            let result = self.run_attempts(request, policy).await;
            match &result {
                Ok(response) => {
                    let chars = response
                        .body
                        .first_message()
                        .and_then(|message| message.text())
                        .map(|text| text.chars().count())
                        .unwrap_or(0);
                    info!(event = "request.completed", status = response.status, chars);
                    self.progress.notify(ProgressEvent::Completed { request_id, chars });
                }
                Err(err) => {
                    warn!(event = "request.failed", error = %err);
                    self.progress
                        .notify(ProgressEvent::Failed { request_id, message: err.to_string() });
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_attempts(
        &self,
        request: OutboundRequest,
        policy: RetryPolicy,
    ) -> Result<CompletionResponse, BrokerError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut delay = policy.initial_delay;
        let mut attempt = 1;

        loop {
            let err = match self.attempt(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                warn!(event = "retry.exhausted", attempt, max_attempts, error = %err);
                return Err(err);
            }

            let delay_ms = delay.as_millis() as u64;
            if err.is_rate_limited() {
                warn!(event = "retry.rate_limited", attempt, delay_ms);
                self.progress.notify(ProgressEvent::RateLimited { attempt, delay_ms });
                tokio::time::sleep(delay).await;
                delay = grow(delay, RATE_LIMIT_DELAY_FACTOR);
            } else {
                warn!(event = "retry.attempt_failed", attempt, delay_ms, error = %err);
                self.progress.notify(ProgressEvent::Retrying {
                    attempt,
                    delay_ms,
                    reason: err.to_string(),
                });
                tokio::time::sleep(delay).await;
                delay = grow(delay, FAILURE_DELAY_FACTOR);
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, request: OutboundRequest) -> Result<CompletionResponse, BrokerError> {
        let response = self.transport.post(request).await?;
        if response.status >= 400 {
            return Err(api_error_from_response(response).await);
        }
        let status = response.status;
        let bytes = response.read_body().await?;
        let mut body: ChatCompletionBody = serde_json::from_slice(&bytes).map_err(|err| {
            BrokerError::ProtocolViolation(format!("response body is not a chat completion: {err}"))
        })?;
        strip_thinking_from_body(&mut body);
        Ok(CompletionResponse { status, body })
    }
}

fn grow(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orbroker_contracts::ChatMessage;

    use super::*;
    use crate::testing::{RecordingProgress, Scripted, ScriptedTransport, credentials, response};

    fn ok_completion(content: &'static str) -> Scripted {
        Box::new(move || {
            let body = serde_json::json!({
                "id": "gen-1",
                "choices": [{"message": {"role": "assistant", "content": content}}]
            });
            Ok(response(200, "application/json", &body.to_string()))
        })
    }

    fn status(code: u16, body: &'static str) -> Scripted {
        Box::new(move || Ok(response(code, "application/json", body)))
    }

    fn network_failure() -> Scripted {
        Box::new(|| Err(BrokerError::Transport("connection reset by peer".to_string())))
    }

    fn payload() -> RequestPayload {
        RequestPayload::new("deepseek/deepseek-r1", vec![ChatMessage::user("hello")])
    }

    fn controller(
        transport: &Arc<ScriptedTransport>,
    ) -> (RetryController, Arc<RecordingProgress>) {
        let progress = Arc::new(RecordingProgress::default());
        (RetryController::new(transport.clone(), progress.clone()), progress)
    }

    fn gaps(transport: &ScriptedTransport) -> Vec<Duration> {
        let requests = transport.requests.lock().expect("requests lock");
        requests.windows(2).map(|pair| pair[1].0 - pair[0].0).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_twice_then_success_doubles_wait() {
        let transport = ScriptedTransport::new(vec![
            status(429, r#"{"error":{"message":"Rate limit exceeded"}}"#),
            status(429, r#"{"error":{"message":"Rate limit exceeded"}}"#),
            ok_completion("Hello"),
        ]);
        let (controller, progress) = controller(&transport);

        let response = controller
            .execute(&credentials(), &payload(), RetryPolicy::default())
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
        assert_eq!(gaps(&transport), vec![Duration::from_millis(2_000), Duration::from_millis(4_000)]);

        let events = progress.events.lock().expect("events lock");
        let limited: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::RateLimited { attempt, delay_ms } => Some((*attempt, *delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(limited, vec![(1, 2_000), (2, 4_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_failures_grow_delay_by_half() {
        let transport = ScriptedTransport::new(vec![
            network_failure(),
            status(500, r#"{"error":{"message":"upstream"}}"#),
            network_failure(),
            ok_completion("fine"),
        ]);
        let (controller, _) = controller(&transport);
        let policy = RetryPolicy { max_attempts: 4, initial_delay: Duration::from_millis(1_000) };

        controller.execute(&credentials(), &payload(), policy).await.expect("fourth attempt");

        assert_eq!(
            gaps(&transport),
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(1_500),
                Duration::from_millis(2_250)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn final_failure_is_propagated() {
        let transport = ScriptedTransport::new(vec![
            status(500, r#"{"error":{"message":"one"}}"#),
            status(502, r#"{"error":{"message":"two"}}"#),
            status(503, r#"{"error":{"message":"three"}}"#),
        ]);
        let (controller, progress) = controller(&transport);

        let err = controller
            .execute(&credentials(), &payload(), RetryPolicy::default())
            .await
            .expect_err("all attempts fail");

        assert_eq!(err, BrokerError::Api { status: 503, message: "three".to_string() });
        assert_eq!(transport.calls(), 3);
        let events = progress.events.lock().expect("events lock");
        assert!(matches!(events.last(), Some(ProgressEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_on_last_attempt_is_returned_without_waiting() {
        let transport = ScriptedTransport::new(vec![status(429, "{}")]);
        let (controller, _) = controller(&transport);
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let started = tokio::time::Instant::now();

        let err = controller.execute(&credentials(), &payload(), policy).await.expect_err("429");

        assert!(err.is_rate_limited());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_request() {
        let transport = ScriptedTransport::new(vec![ok_completion("never")]);
        let (controller, _) = controller(&transport);
        let credentials = Credentials { api_key: String::new(), ..credentials() };

        let err = controller
            .execute(&credentials, &payload(), RetryPolicy::default())
            .await
            .expect_err("no key");

        assert_eq!(err, BrokerError::MissingCredential);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn success_strips_thinking_markup() {
        let transport =
            ScriptedTransport::new(vec![ok_completion("<think>step 1\nstep 2</think>\n\n42")]);
        let (controller, _) = controller(&transport);

        let response = controller
            .execute(&credentials(), &payload(), RetryPolicy::default())
            .await
            .expect("response");

        let text = response.body.first_message().and_then(|message| message.text());
        assert_eq!(text.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn request_is_not_forced_to_stream() {
        let transport = ScriptedTransport::new(vec![ok_completion("ok")]);
        let (controller, _) = controller(&transport);

        controller
            .execute(&credentials(), &payload(), RetryPolicy::default())
            .await
            .expect("response");

        let requests = transport.requests.lock().expect("requests lock");
        assert!(requests[0].1.body.get("stream").is_none());
        assert_eq!(requests[0].1.api_key, "sk-or-test");
    }

    #[test]
    fn delay_growth_saturates_instead_of_overflowing() {
        assert_eq!(grow(Duration::from_millis(2_000), 2.0), Duration::from_millis(4_000));
        assert_eq!(grow(Duration::from_millis(2_000), 1.5), Duration::from_millis(3_000));
        assert_eq!(grow(Duration::MAX, 2.0), Duration::MAX);
        assert_eq!(grow(Duration::from_secs(u64::MAX / 2 + 1), 1.5), Duration::MAX);
    }
}
