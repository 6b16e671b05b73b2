use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use pin_project::pin_project;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Boundaries for long running work such as converter processes, in seconds.
pub fn job_duration_boundaries() -> Vec<f64> {
    vec![
        0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
    ]
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project]
pub struct TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    #[pin]
    inner: F,
    start: Instant,
    callback: Option<C>, /* This is an Option because the future might be polled even after
                          * completion */
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

pub fn create_timed_future<F, C>(future: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture {
        inner: future,
        start: Instant::now(),
        callback: Some(callback),
    }
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    // Early exit if metrics are disabled
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "storage-gateway"))
        .with_attribute(KeyValue::new("service.name", "storage-gateway"))
        .with_attribute(KeyValue::new(
            "gateway.instance.id",
            instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    tracing::info!(?interval, "metrics exporter initialized");
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("gateway.blob_operations_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store latencies in seconds")
                .build();

            Metrics { operations }
        }
    }
}

pub mod gateway {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Counter<u64>,
        pub bytes_written: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("storage-gateway");
            let operations = meter
                .u64_counter("gateway.operations")
                .with_description("storage operations by kind and outcome")
                .build();
            let bytes_written = meter
                .u64_counter("gateway.bytes_written")
                .with_description("bytes accepted by successful writes")
                .build();
            Metrics {
                operations,
                bytes_written,
            }
        }
    }
}

pub mod conversions {
    use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};

    use crate::job_duration_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub jobs: Counter<u64>,
        pub duration: Histogram<f64>,
        pub in_flight: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("conversions");
            let jobs = meter
                .u64_counter("conversion.jobs")
                .with_description("conversion jobs by terminal outcome")
                .build();
            let duration = meter
                .f64_histogram("conversion.duration")
                .with_unit("s")
                .with_boundaries(job_duration_boundaries())
                .with_description("converter process wall time in seconds")
                .build();
            let in_flight = meter
                .i64_up_down_counter("conversion.in_flight")
                .with_description("converter processes currently running")
                .build();
            Metrics {
                jobs,
                duration,
                in_flight,
            }
        }
    }
}
