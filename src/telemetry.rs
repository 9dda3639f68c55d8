//! Logging and optional OpenTelemetry tracing.
//!
//! The fmt layer is always installed, filtered by `RUST_LOG`. When enabled,
//! spans are also exported to an OTLP collector.
//!
//! # Environment Variables
//!
//! - `FLOWRUN_OTEL_ENABLED`: "true" turns on OTLP export (default: false)
//! - `FLOWRUN_OTEL_ENDPOINT`: OTLP endpoint URL (default: http://localhost:4317)
//! - `FLOWRUN_OTEL_SERVICE_NAME`: Service name for traces (default: flowrun)
//! - `FLOWRUN_OTEL_SAMPLE_RATE`: Sampling rate 0.0-1.0 (default: 1.0)

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct OtelConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub service_name: String,
    /// Fraction of traces kept, clamped by [`OtelConfig::sampler`].
    pub sample_rate: f64,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4317".to_string(),
            service_name: "flowrun".to_string(),
            sample_rate: 1.0,
        }
    }
}

impl OtelConfig {
    /// Defaults overridden by `FLOWRUN_OTEL_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("FLOWRUN_OTEL_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.enabled),
            endpoint: std::env::var("FLOWRUN_OTEL_ENDPOINT").unwrap_or(defaults.endpoint),
            service_name: std::env::var("FLOWRUN_OTEL_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            sample_rate: std::env::var("FLOWRUN_OTEL_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sample_rate),
        }
    }

    pub fn sampler(&self) -> Sampler {
        if self.sample_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_rate)
        }
    }
}

fn fmt_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
}

/// Install the global subscriber. Returns the tracer provider when OTLP
/// export is on, so the caller can flush it at shutdown.
pub fn init_telemetry(
    config: &OtelConfig,
) -> Result<Option<SdkTracerProvider>, Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        tracing_subscriber::registry().with(fmt_layer()).try_init()?;
        return Ok(None);
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    let tracer = provider.tracer("flowrun");
    tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(fmt_layer())
        .try_init()?;

    info!(
        endpoint = %config.endpoint,
        service_name = %config.service_name,
        sample_rate = config.sample_rate,
        "OpenTelemetry tracing initialized"
    );

    Ok(Some(provider))
}

/// Flush and stop the exporter, if one was started.
pub fn shutdown_telemetry(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::error!("Failed to shutdown OpenTelemetry provider: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OtelConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:4317");
        assert_eq!(config.service_name, "flowrun");
    }

    #[test]
    fn test_sampler_clamps_rate() {
        let mut config = OtelConfig {
            sample_rate: 1.5,
            ..OtelConfig::default()
        };
        assert!(matches!(config.sampler(), Sampler::AlwaysOn));
        config.sample_rate = -0.5;
        assert!(matches!(config.sampler(), Sampler::AlwaysOff));
        config.sample_rate = 0.25;
        assert!(matches!(config.sampler(), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }
}
