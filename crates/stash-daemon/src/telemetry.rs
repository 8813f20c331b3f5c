//! Tracing bootstrap: console logs always, OTLP export when an endpoint is
//! configured via `OTEL_EXPORTER_OTLP_ENDPOINT`.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, Sampler, Tracer},
    Resource,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flushes the OTLP pipeline on shutdown when one was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("STASH_OTEL_SAMPLING_RATE").ok().as_deref());

    let tracer = match otlp_endpoint() {
        Some(endpoint) if sampling_rate > 0.0 => {
            match build_tracer(service_name, sampling_rate, &endpoint) {
                Ok(tracer) => Some(tracer),
                Err(error) => {
                    // Console logs still work; only the export pipeline is lost.
                    eprintln!("failed to initialize OTLP exporter ({error}); console logs only");
                    None
                }
            }
        }
        _ => None,
    };

    let tracer_installed = tracer.is_some();
    match tracer {
        Some(tracer) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    info!(sampling_rate, otlp = tracer_installed, "telemetry configured");

    Ok(TelemetryGuard { tracer_installed })
}

fn otlp_endpoint() -> Option<String> {
    env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn build_tracer(service_name: &str, sampling_rate: f64, endpoint: &str) -> Result<Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("STASH_OTEL_SAMPLING_RATE is empty; defaulting to 1.0".to_string()),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "STASH_OTEL_SAMPLING_RATE={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "STASH_OTEL_SAMPLING_RATE='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_sampling_rate;

    #[test]
    fn missing_rate_defaults_to_one() {
        assert_eq!(parse_sampling_rate(None), (1.0, None));
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
    }

    #[test]
    fn out_of_range_rate_is_clamped() {
        let (rate, warning) = parse_sampling_rate(Some("2.5"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("outside 0.0..=1.0"));

        let (rate, _) = parse_sampling_rate(Some("-1"));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn unparsable_rate_falls_back_with_warning() {
        let (rate, warning) = parse_sampling_rate(Some("fast"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("'fast'"));
    }

    #[test]
    fn blank_rate_falls_back_with_warning() {
        let (rate, warning) = parse_sampling_rate(Some("  "));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("is empty"));
    }
}
