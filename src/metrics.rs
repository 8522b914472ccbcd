//! Runtime metrics for the orchestrator
//!
//! All metrics flow through an explicitly passed [`MetricsSink`] handle with
//! an init-once / flush-at-shutdown lifecycle. Components never touch a
//! process-global registry, which keeps the executor testable in isolation:
//! tests construct a disabled sink and assert on behavior, not on metrics.

use std::time::Duration;

use opentelemetry::metrics::{Gauge, Histogram, Meter, MeterProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{runtime, Resource};
use tracing::{info, warn};

use crate::error::Error;

/// Configuration for metrics export
#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    /// OTLP endpoint for metric export (e.g. "http://otel-collector:4317").
    /// If `None`, instruments are created against a provider without a
    /// reader and every record is a no-op.
    pub otlp_endpoint: Option<String>,
    /// CI job name attached as a resource attribute, if running in CI
    pub job_name: Option<String>,
    /// CI job run identifier attached as a resource attribute
    pub job_run_id: Option<String>,
}

/// Handle publishing scenario and phase runtime metrics.
///
/// Cheap to clone via reference; owned once by the runner and passed down to
/// the decorators in [`crate::retry`].
pub struct MetricsSink {
    provider: SdkMeterProvider,
    scenario_runtime: Histogram<f64>,
    phase_runtime: Histogram<f64>,
    attempt_runtime: Histogram<f64>,
    attempts: Gauge<u64>,
}

impl MetricsSink {
    /// Initialize the sink. Call once at startup.
    pub fn new(config: &MetricsConfig) -> Result<Self, Error> {
        let mut attributes = vec![KeyValue::new("service.name", "konform")];
        if let Some(job) = &config.job_name {
            attributes.push(KeyValue::new("ci.job.name", job.clone()));
        }
        if let Some(run) = &config.job_run_id {
            attributes.push(KeyValue::new("ci.job.run_id", run.clone()));
        }
        let resource = Resource::new(attributes);

        let provider = match &config.otlp_endpoint {
            Some(endpoint) => {
                info!(endpoint = %endpoint, "Exporting runtime metrics via OTLP");
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .map_err(|e| Error::config(format!("failed to build metric exporter: {e}")))?;
                let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            }
            None => SdkMeterProvider::builder().with_resource(resource).build(),
        };

        Ok(Self::from_provider(provider))
    }

    /// A sink that records nothing; used by tests and when metrics are off
    pub fn disabled() -> Self {
        Self::from_provider(SdkMeterProvider::builder().build())
    }

    fn from_provider(provider: SdkMeterProvider) -> Self {
        let meter: Meter = provider.meter("konform");

        let scenario_runtime = meter
            .f64_histogram("konform_scenario_runtime_seconds")
            .with_description("Wall-clock runtime of one scenario lifecycle")
            .with_unit("s")
            .build();

        let phase_runtime = meter
            .f64_histogram("konform_phase_runtime_seconds")
            .with_description("Wall-clock runtime of one lifecycle phase")
            .with_unit("s")
            .build();

        let attempt_runtime = meter
            .f64_histogram("konform_check_attempt_runtime_seconds")
            .with_description("Runtime of a single attempt of a retried check")
            .with_unit("s")
            .build();

        let attempts = meter
            .u64_gauge("konform_check_attempts")
            .with_description("Number of attempts a retried check needed")
            .with_unit("{attempts}")
            .build();

        Self {
            provider,
            scenario_runtime,
            phase_runtime,
            attempt_runtime,
            attempts,
        }
    }

    /// Record the total runtime of one scenario
    pub fn record_scenario_runtime(&self, scenario: &str, duration: Duration) {
        self.scenario_runtime.record(
            duration.as_secs_f64(),
            &[KeyValue::new("scenario", scenario.to_string())],
        );
    }

    /// Record the runtime of one lifecycle phase
    pub fn record_phase_runtime(&self, scenario: &str, phase: &str, duration: Duration) {
        self.phase_runtime.record(
            duration.as_secs_f64(),
            &[
                KeyValue::new("scenario", scenario.to_string()),
                KeyValue::new("phase", phase.to_string()),
            ],
        );
    }

    /// Record the runtime of a single attempt of a retried operation
    pub fn record_attempt_runtime(&self, operation: &str, attempt: u32, duration: Duration) {
        self.attempt_runtime.record(
            duration.as_secs_f64(),
            &[
                KeyValue::new("operation", operation.to_string()),
                KeyValue::new("attempt", i64::from(attempt)),
            ],
        );
    }

    /// Record how many attempts a retried operation consumed in total
    pub fn record_attempts(&self, operation: &str, attempts: u32) {
        self.attempts.record(
            u64::from(attempts),
            &[KeyValue::new("operation", operation.to_string())],
        );
    }

    /// Flush and shut down the exporter. Call once at the end of the run.
    pub fn shutdown(&self) {
        if let Err(e) = self.provider.force_flush() {
            warn!(error = %e, "Failed to flush metrics");
        }
        if let Err(e) = self.provider.shutdown() {
            warn!(error = %e, "Failed to shut down metrics provider");
        }
    }
}
