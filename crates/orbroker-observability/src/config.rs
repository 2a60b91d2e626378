use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub trace_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_span_events: false, trace_enabled: false }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_level = lookup("ORB_LOG_LEVEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self {
            log_level,
            log_span_events: truthy(lookup("ORB_LOG_SPAN_EVENTS"), false),
            trace_enabled: truthy(lookup("ORB_TRACE_ENABLED"), false),
        }
    }

    pub fn fallback_filter(&self) -> String {
        let level = &self.log_level;
        [
            "orbroker_app",
            "orbroker_core",
            "orbroker_clients_openrouter",
            "orbroker_store",
        ]
        .iter()
        .fold(level.clone(), |filter, target| format!("{filter},{target}={level}"))
    }
}

fn truthy(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            let v = value.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(default)
}
