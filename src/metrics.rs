use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_transport() -> String {
    "http".into()
}

fn default_endpoint() -> String {
    "http://localhost:8428/opentelemetry/v1/metrics".into()
}

/// Build and register a global meter provider.
/// For gRPC transport, requires an active tokio runtime context.
pub fn init_meter_provider(config: &MetricsConfig) -> Option<SdkMeterProvider> {
    if !config.enabled {
        return None;
    }

    let resource = Resource::builder_empty()
        .with_attributes([KeyValue::new("service.name", "affinity")])
        .build();

    let provider = match config.transport.as_str() {
        "grpc" => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .with_protocol(Protocol::Grpc)
                .with_timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| log::warn!("metrics grpc exporter: {e}"))
                .ok()?;
            SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .with_resource(resource)
                .build()
        }
        _ => {
            let exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(&config.endpoint)
                .with_timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| log::warn!("metrics http exporter: {e}"))
                .ok()?;
            SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .with_resource(resource)
                .build()
        }
    };

    opentelemetry::global::set_meter_provider(provider.clone());
    Some(provider)
}

/// One observable outcome of a CLI command.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Classified { matched: bool },
    Feedback { label: &'static str },
    TrainingJob { status: &'static str },
}

/// Export the events of one command invocation, then flush.
///
/// Runs on a throwaway single-worker runtime so short-lived commands can
/// export without the rest of the binary being async.
pub fn record_command(config: &MetricsConfig, command: &str, events: &[Event], start: Instant) {
    if !config.enabled {
        return;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::warn!("metrics runtime: {e}");
            return;
        }
    };

    let provider = match rt.block_on(async { init_meter_provider(config) }) {
        Some(p) => p,
        None => return,
    };

    let meter = opentelemetry::global::meter("affinity");
    for event in events {
        match event {
            Event::Classified { matched } => {
                meter
                    .u64_counter("affinity_classifications_total")
                    .build()
                    .add(1, &[KeyValue::new("matched", *matched)]);
            }
            Event::Feedback { label } => {
                meter
                    .u64_counter("affinity_feedback_total")
                    .build()
                    .add(1, &[KeyValue::new("label", *label)]);
            }
            Event::TrainingJob { status } => {
                meter
                    .u64_counter("affinity_training_jobs_total")
                    .build()
                    .add(1, &[KeyValue::new("status", *status)]);
            }
        }
    }

    meter
        .f64_histogram("affinity_command_duration_seconds")
        .build()
        .record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("command", command.to_string())],
        );

    if let Err(e) = provider.shutdown() {
        log::warn!("metrics shutdown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_builds_no_provider() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(init_meter_provider(&config).is_none());
    }

    #[test]
    fn record_command_is_noop_when_disabled() {
        let config = MetricsConfig::default();
        record_command(
            &config,
            "classify",
            &[Event::Classified { matched: true }],
            Instant::now(),
        );
    }

    #[test]
    fn defaults_point_at_local_collector() {
        let config: MetricsConfig = toml::from_str("enabled = true").unwrap();
        assert_eq!(config.transport, "http");
        assert!(config.endpoint.starts_with("http://localhost"));
    }
}
