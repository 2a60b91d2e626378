use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ENDPOINT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Caller id reserved for the settings surface. Never listed as a caller.
pub const SETTINGS_CALLER_ID: &str = "__settings__";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            extra: BTreeMap::new(),
        }
    }

    pub fn system(content: &str) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RequestPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RequestPayload {
    pub fn new(model: &str, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.to_string(), messages, extra: BTreeMap::new() }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn into_streaming(mut self) -> Self {
        self.extra.insert("stream".to_string(), Value::Bool(true));
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.extra.get("stream").and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub endpoint_url: String,
}

impl Credentials {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedDelta {
    Text(String),
    Reasoning(String),
    Done,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingsBlob {
    pub api_key: String,
    pub endpoint_url: String,
    pub favorites: Vec<String>,
    pub context_lengths: BTreeMap<String, u32>,
    pub models: BTreeMap<String, String>,
}

impl Default for SettingsBlob {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            favorites: Vec::new(),
            context_lengths: BTreeMap::new(),
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatCompletionBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatCompletionBody {
    pub fn first_message(&self) -> Option<&CompletionMessage> {
        self.choices.first()?.message.as_ref()
    }

    pub fn first_message_mut(&mut self) -> Option<&mut CompletionMessage> {
        self.choices.first_mut()?.message.as_mut()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CompletionChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<CompletionMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CompletionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CompletionMessage {
    pub fn text(&self) -> Option<String> {
        match self.content.as_ref()? {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Array(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("");
                if text.is_empty() { None } else { Some(text) }
            }
            _ => None,
        }
    }

    pub fn reasoning_text(&self) -> Option<&str> {
        let non_empty = |value: &&str| !value.is_empty();
        self.reasoning
            .as_deref()
            .filter(non_empty)
            .or(self.reasoning_content.as_deref().filter(non_empty))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CompletionUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub status: u16,
    pub body: ChatCompletionBody,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Option<StreamDelta>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .and_then(|detail| detail.message.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| self.message.as_deref().map(str::trim).filter(|value| !value.is_empty()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsResponse {
    pub data: CreditsData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsData {
    #[serde(default)]
    pub total_credits: f64,
    #[serde(default)]
    pub total_usage: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyInfoResponse {
    pub data: KeyInfoData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyInfoData {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub limit_remaining: Option<f64>,
    #[serde(default)]
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Balance {
    Known(f64),
    Unknown,
}

impl Balance {
    pub fn from_parts(account_credit: f64, key_remaining: Option<f64>) -> Self {
        let remaining = match key_remaining {
            Some(limit) => account_credit.min(limit),
            None => account_credit,
        };
        if remaining.is_finite() { Self::Known(remaining) } else { Self::Unknown }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value:.2}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RequestStarted { request_id: String, model: String, streaming: bool },
    RateLimited { attempt: u32, delay_ms: u64 },
    Retrying { attempt: u32, delay_ms: u64, reason: String },
    Completed { request_id: String, chars: usize },
    Failed { request_id: String, message: String },
}
