use std::{env, path::PathBuf, time::Duration};

use orbroker_clients_openrouter::{AppIdentity, DEFAULT_APP_REFERER, DEFAULT_APP_TITLE};
use orbroker_contracts::OPENROUTER_API_BASE;
use orbroker_core::RetryPolicy;
use orbroker_core::retry::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_SETTINGS_PATH: &str = "orbroker-settings.json";
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub settings_path: PathBuf,
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub api_base: String,
    pub connect_timeout_seconds: u64,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub app_referer: String,
    pub app_title: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid ORB_CONNECT_TIMEOUT value: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid ORB_MAX_ATTEMPTS value: {0}")]
    InvalidMaxAttempts(String),
    #[error("invalid ORB_INITIAL_DELAY_MS value: {0}")]
    InvalidInitialDelay(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let settings_path = non_empty("ORB_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let endpoint_url = non_empty("ORB_ENDPOINT_URL").map(|value| value.trim().to_string());
        let api_key = non_empty("OPENROUTER_API_KEY").map(|value| value.trim().to_string());

        let connect_timeout_seconds = match non_empty("ORB_CONNECT_TIMEOUT") {
            Some(raw) => parse_positive_u64(&raw).ok_or(ConfigError::InvalidConnectTimeout(raw))?,
            None => DEFAULT_CONNECT_TIMEOUT_SECONDS,
        };
        let max_attempts = match non_empty("ORB_MAX_ATTEMPTS") {
            Some(raw) => parse_positive_u64(&raw)
                .and_then(|value| u32::try_from(value).ok())
                .ok_or(ConfigError::InvalidMaxAttempts(raw))?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let initial_delay_ms = match non_empty("ORB_INITIAL_DELAY_MS") {
            Some(raw) => {
                raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidInitialDelay(raw.clone()))?
            }
            None => DEFAULT_INITIAL_DELAY.as_millis() as u64,
        };

        Ok(Self {
            settings_path,
            endpoint_url,
            api_key,
            api_base: non_empty("ORB_API_BASE")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| OPENROUTER_API_BASE.to_string()),
            connect_timeout_seconds,
            max_attempts,
            initial_delay_ms,
            app_referer: non_empty("ORB_APP_REFERER")
                .unwrap_or_else(|| DEFAULT_APP_REFERER.to_string()),
            app_title: non_empty("ORB_APP_TITLE").unwrap_or_else(|| DEFAULT_APP_TITLE.to_string()),
        })
    }

    pub fn for_tests() -> Self {
        Self {
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            endpoint_url: None,
            api_key: None,
            api_base: OPENROUTER_API_BASE.to_string(),
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            app_referer: DEFAULT_APP_REFERER.to_string(),
            app_title: DEFAULT_APP_TITLE.to_string(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn identity(&self) -> AppIdentity {
        AppIdentity { referer: self.app_referer.clone(), title: self.app_title.clone() }
    }
}

fn parse_positive_u64(value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<u64>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_matches_test_defaults() {
        assert_eq!(config(&[]).expect("config"), AppConfig::for_tests());
    }

    #[test]
    fn overrides_are_trimmed_and_blank_values_ignored() {
        let parsed = config(&[
            ("ORB_SETTINGS_PATH", "/var/lib/orbroker/settings.json"),
            ("ORB_ENDPOINT_URL", " http://127.0.0.1:8080/api/v1/chat/completions "),
            ("OPENROUTER_API_KEY", "  "),
            ("ORB_MAX_ATTEMPTS", "5"),
            ("ORB_INITIAL_DELAY_MS", "0"),
            ("ORB_APP_TITLE", "notes"),
        ])
        .expect("config");

        assert_eq!(parsed.settings_path, PathBuf::from("/var/lib/orbroker/settings.json"));
        assert_eq!(
            parsed.endpoint_url.as_deref(),
            Some("http://127.0.0.1:8080/api/v1/chat/completions")
        );
        assert_eq!(parsed.api_key, None);
        assert_eq!(parsed.api_base, OPENROUTER_API_BASE);
        assert_eq!(
            parsed.retry_policy(),
            RetryPolicy { max_attempts: 5, initial_delay: Duration::ZERO }
        );
        assert_eq!(parsed.identity().title, "notes");
        assert_eq!(parsed.identity().referer, DEFAULT_APP_REFERER);
    }

    #[test]
    fn api_base_override_is_separate_from_chat_endpoint() {
        let parsed = config(&[
            ("ORB_ENDPOINT_URL", "https://proxy.example/v1/completions"),
            ("ORB_API_BASE", " http://127.0.0.1:8080/api/v1 "),
        ])
        .expect("config");

        assert_eq!(parsed.endpoint_url.as_deref(), Some("https://proxy.example/v1/completions"));
        assert_eq!(parsed.api_base, "http://127.0.0.1:8080/api/v1");
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_variable() {
        assert_eq!(
            config(&[("ORB_CONNECT_TIMEOUT", "soon")]),
            Err(ConfigError::InvalidConnectTimeout("soon".to_string()))
        );
        assert_eq!(
            config(&[("ORB_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::InvalidMaxAttempts("0".to_string()))
        );
        assert_eq!(
            config(&[("ORB_INITIAL_DELAY_MS", "-1")]),
            Err(ConfigError::InvalidInitialDelay("-1".to_string()))
        );
    }

    #[test]
    fn parse_positive_u64_rejects_zero_and_invalid() {
        assert_eq!(parse_positive_u64(" 7 "), Some(7));
        assert_eq!(parse_positive_u64("0"), None);
        assert_eq!(parse_positive_u64("abc"), None);
    }
}
