use std::sync::Arc;

use orbroker_clients_openrouter::{OpenRouterTransport, list_models, query_balance};
use orbroker_contracts::{
    Balance, CompletionResponse, ModelInfo, OPENROUTER_API_BASE, ProgressEvent, RequestPayload,
};
use orbroker_core::{
    BrokerError, HttpTransport, ModelSelector, ProgressSink, RetryController, RetryPolicy,
    StreamCallbacks, StreamDispatcher,
};
use orbroker_store::{JsonFileBackend, PreferenceStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;

pub struct OpenRouterProvider {
    store: PreferenceStore,
    transport: Arc<dyn HttpTransport>,
    retry: RetryController,
    dispatcher: StreamDispatcher,
    selector: Option<Arc<dyn ModelSelector>>,
    policy: RetryPolicy,
    api_base: String,
}

impl OpenRouterProvider {
    pub fn new(
        store: PreferenceStore,
        transport: Arc<dyn HttpTransport>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store,
            retry: RetryController::new(transport.clone(), progress.clone()),
            dispatcher: StreamDispatcher::new(transport.clone(), progress),
            transport,
            selector: None,
            policy: RetryPolicy::default(),
            api_base: OPENROUTER_API_BASE.to_string(),
        }
    }

    pub fn from_config(
        config: &config::AppConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, BrokerError> {
        let store = PreferenceStore::load(Arc::new(JsonFileBackend::new(&config.settings_path)))?;
        if let Some(endpoint_url) = config.endpoint_url.as_deref() {
            store.set_endpoint_url(endpoint_url)?;
        }
        if let Some(api_key) = config.api_key.as_deref()
            && store.api_key().is_empty()
        {
            info!(event = "settings.api_key_seeded");
            store.set_api_key(api_key)?;
        }
        let transport = Arc::new(OpenRouterTransport::new(config.connect_timeout(), config.identity())?);
        Ok(Self::new(store, transport, progress)
            .with_retry_policy(config.retry_policy())
            .with_api_base(&config.api_base))
    }

    pub fn with_selector(mut self, selector: Arc<dyn ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Root for `/credits`, `/key` and `/models`. Independent of the chat
    /// endpoint stored with the credentials.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().to_string();
        self
    }

    pub fn store(&self) -> &PreferenceStore {
        &self.store
    }

    pub fn api_key(&self) -> String {
        self.store.api_key()
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<(), BrokerError> {
        self.store.set_api_key(api_key)
    }

    pub fn model(&self, caller_id: &str) -> Option<String> {
        self.store.model(caller_id)
    }

    pub fn set_model(&self, caller_id: &str, model_id: &str) -> Result<(), BrokerError> {
        self.store.set_model(caller_id, model_id)
    }

    pub fn callers(&self) -> Vec<String> {
        self.store.callers()
    }

    pub fn favorites(&self) -> Vec<String> {
        self.store.favorites()
    }

    pub fn add_favorite(
        &self,
        model_id: &str,
        context_length: Option<u32>,
    ) -> Result<(), BrokerError> {
        self.store.add_favorite(model_id, context_length)
    }

    pub fn remove_favorite(&self, model_id: &str) -> Result<(), BrokerError> {
        self.store.remove_favorite(model_id)
    }

    pub fn context_length(&self, model_id: &str) -> Option<u32> {
        self.store.context_length(model_id)
    }

    pub async fn fetch_with_retry(
        &self,
        payload: &RequestPayload,
    ) -> Result<CompletionResponse, BrokerError> {
        self.retry.execute(&self.store.credentials(), payload, self.policy).await
    }

    /// Spawns onto the current tokio runtime and returns at once; with no
    /// runtime `on_error` fires immediately. Cancelling the returned token ends
    /// the call without a terminal callback.
    pub fn stream_request(
        &self,
        payload: RequestPayload,
        callbacks: StreamCallbacks,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.dispatcher.stream_request(self.store.credentials(), payload, callbacks, cancel.clone());
        cancel
    }

    pub async fn open_model_selector(
        &self,
        caller_id: &str,
        on_select: impl FnOnce(&str),
    ) -> Result<Option<String>, BrokerError> {
        let Some(selector) = self.selector.as_ref() else {
            warn!(event = "selector.unavailable", caller_id);
            return Ok(None);
        };
        let current = self.store.model(caller_id);
        let Some(model_id) = selector.select_model(caller_id, current.as_deref()).await else {
            info!(event = "selector.dismissed", caller_id);
            return Ok(None);
        };
        self.store.set_model(caller_id, &model_id)?;
        info!(event = "selector.selected", caller_id, model_id = %model_id);
        on_select(&model_id);
        Ok(Some(model_id))
    }

    pub async fn balance(&self) -> Result<Balance, BrokerError> {
        query_balance(self.transport.as_ref(), &self.api_base, &self.store.credentials()).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, BrokerError> {
        list_models(self.transport.as_ref(), &self.api_base, &self.store.credentials()).await
    }
}

pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn notify(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RateLimited { attempt, delay_ms } => {
                warn!(event = "progress.rate_limited", attempt, delay_ms);
            }
            ProgressEvent::Retrying { attempt, delay_ms, reason } => {
                warn!(event = "progress.retrying", attempt, delay_ms, reason = %reason);
            }
            ProgressEvent::Failed { request_id, message } => {
                warn!(event = "progress.failed", request_id = %request_id, error = %message);
            }
            other => info!(event = "progress", detail = ?other),
        }
    }
}
