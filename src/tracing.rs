use std::path::Path;

use anyhow::{anyhow, Result};
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, Layer, Registry};

use crate::config::{ServerConfig, TracingExporter};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the log file writer and the span exporter alive.
#[derive(Default)]
pub struct TracingGuards {
    _file_guard: Option<WorkerGuard>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl TracingGuards {
    pub fn shutdown(&self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                error!("failed to shut down tracer provider: {:?}", e);
            }
        }
    }
}

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer(config: &ServerConfig) -> BoxedLayer {
    let span_events = match config.telemetry.tracing_exporter {
        Some(TracingExporter::Stdout) => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    };
    if config.structured_logging() {
        return tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .with_span_events(span_events)
            .with_filter(get_env_filter())
            .boxed();
    }

    tracing_subscriber::fmt::layer()
        .compact()
        .with_span_events(span_events)
        .with_filter(get_env_filter())
        .boxed()
}

fn get_file_layer(path: &str) -> Result<(BoxedLayer, WorkerGuard)> {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(get_env_filter())
        .boxed();
    Ok((layer, guard))
}

pub fn setup_tracing(config: &ServerConfig) -> Result<TracingGuards> {
    let mut guards = TracingGuards::default();
    let mut layers: Vec<BoxedLayer> = vec![get_log_layer(config)];

    if let Some(path) = &config.telemetry.local_log_file {
        let (layer, guard) = get_file_layer(path)?;
        layers.push(layer);
        guards._file_guard = Some(guard);
    }

    if let Some(TracingExporter::Otlp) = config.telemetry.tracing_exporter {
        let mut span_exporter = SpanExporter::builder().with_tonic();
        if let Some(endpoint) = &config.telemetry.endpoint {
            span_exporter = span_exporter.with_endpoint(endpoint.clone());
        }
        let tracer_provider = SdkTracerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name("storage-gateway")
                    .build(),
            )
            .with_batch_exporter(span_exporter.build()?)
            .build();
        global::set_tracer_provider(tracer_provider.clone());

        let tracer = tracer_provider.tracer("storage-gateway");
        layers.push(
            tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_filter(get_env_filter())
                .boxed(),
        );
        guards.tracer_provider = Some(tracer_provider);
    }

    let subscriber = Registry::default().with(layers);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
    Ok(guards)
}
