use opentelemetry::trace::TracerProvider;
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

mod config;

pub use config::ObservabilityConfig;

pub fn init_observability(service_name: &str) {
    init_with_config(service_name, &ObservabilityConfig::from_env());
}

pub fn init_with_config(service_name: &str, config: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.fallback_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(if config.log_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });
    let telemetry_layer = config.trace_enabled.then(|| {
        tracing_opentelemetry::layer().with_tracer(
            opentelemetry::trace::noop::NoopTracerProvider::new().tracer(service_name.to_string()),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .ok();
}
