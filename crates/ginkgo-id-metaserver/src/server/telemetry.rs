//! # Telemetry Features
//!
//! The server always logs through `tracing-subscriber` (filtered by
//! `RUST_LOG`, default `info`). On top of that it can export OpenTelemetry
//! data to stdout.
//!
//! ## Feature matrix
//!
//! - `otel`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (counters and a histogram).
//! - `stdout`: Enables the stdout exporter.
//!
//! ## Feature constraints
//!
//! - `stdout` requires at least one of `otel` or `metrics`.
//!
//! ## Metrics
//!
//! - `machine_ids_allocated`, `segments_allocated`: successful allocations
//! - `allocation_retries`: optimistic attempts that lost a race
//! - `allocation_failures`: allocations answered with an error
//! - `allocation_duration` (ms): time spent in the retry loop
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features otel,metrics,stdout
//! ```

// Disallow using `stdout` without `otel` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

// Core imports - always needed
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

// Either
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors are printed since the log
    /// pipeline may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder("ginkgo-id-metaserver")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Always log to the console via `tracing_subscriber::fmt`. This is
    // unrelated to the `opentelemetry_stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("ginkgo-id-metaserver")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static MACHINE_IDS_ALLOCATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SEGMENTS_ALLOCATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_RETRIES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = MACHINE_IDS_ALLOCATED.set(
        meter
            .u64_counter("machine_ids_allocated")
            .with_description("Machine ids leased to snowflake generators")
            .build(),
    );

    let _ = SEGMENTS_ALLOCATED.set(
        meter
            .u64_counter("segments_allocated")
            .with_description("Id segments leased to segment generators")
            .build(),
    );

    let _ = ALLOCATION_RETRIES.set(
        meter
            .u64_counter("allocation_retries")
            .with_description("Optimistic allocation attempts that lost a race")
            .build(),
    );

    let _ = ALLOCATION_FAILURES.set(
        meter
            .u64_counter("allocation_failures")
            .with_description("Allocations answered with an error")
            .build(),
    );

    let _ = ALLOCATION_DURATION_MS.set(
        meter
            .f64_histogram("allocation_duration")
            .with_unit("ms")
            .with_description("Time spent allocating, retries included")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_machine_ids_allocated() {
    if let Some(counter) = MACHINE_IDS_ALLOCATED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_machine_ids_allocated() {}

#[cfg(feature = "metrics")]
pub fn increment_segments_allocated() {
    if let Some(counter) = SEGMENTS_ALLOCATED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_segments_allocated() {}

#[cfg(feature = "metrics")]
pub fn increment_allocation_retries() {
    if let Some(counter) = ALLOCATION_RETRIES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_allocation_retries() {}

#[cfg(feature = "metrics")]
pub fn increment_allocation_failures() {
    if let Some(counter) = ALLOCATION_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_allocation_failures() {}

#[cfg(feature = "metrics")]
pub fn record_allocation_duration(duration_ms: f64) {
    if let Some(histogram) = ALLOCATION_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_allocation_duration(_duration_ms: f64) {}
