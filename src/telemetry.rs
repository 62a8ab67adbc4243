//! Logging and tracing setup
//!
//! Logs go to stdout, human-readable by default or JSON when
//! `LOG_FORMAT=json`. Spans are additionally exported over OTLP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "sigstore-operator";

/// Telemetry settings, read from the environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
    /// OTLP gRPC endpoint; traces stay local when unset
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("LOG_FORMAT").ok().as_deref(),
            std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        )
    }

    fn from_vars(log_format: Option<&str>, otlp_endpoint: Option<String>) -> Self {
        Self {
            json: log_format.is_some_and(|f| f.eq_ignore_ascii_case("json")),
            otlp_endpoint: otlp_endpoint.filter(|e| !e.trim().is_empty()),
        }
    }
}

/// Install the global subscriber
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    // Option<Layer> is itself a Layer, so the unused format is simply absent
    let (json_layer, text_layer) = if config.json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true);
        (Some(layer), None)
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(trace::config().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)
                .map_err(|e| Error::ConfigError(format!("failed to initialize tracer: {e}")))?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("failed to initialize tracing subscriber: {e}")))
}

/// Flush any spans still buffered for export
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
