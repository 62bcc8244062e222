use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures::future;
use purple_aqi::cascade::{HttpFetcher, ReadingFetcher, SourceCascade};
use purple_aqi::cli::Args;
use purple_aqi::config::Config;
use purple_aqi::endpoint::{SourceEndpoint, SourceRole};
use purple_aqi::http::{router, HttpState};
use purple_aqi::pipeline::{correct_reading, CycleOutcome, ReadingPipeline};
use purple_aqi::publish::{FeedPublisher, LatestReading, ReadingSink};
use purple_aqi::service;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_LOG_FILTER: &str = "info,purple_aqi=info";

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
}

/// Console-only logging for one-shot commands that never load `Config`.
fn init_console_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

/// Console logging plus, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, span
/// export over OTLP/HTTP.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let tracer = match config.otlp_endpoint.as_deref().and_then(traces_endpoint) {
        Some(endpoint) => Some(otlp_tracer(endpoint, config.sources.len())?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .try_init()?;
    Ok(())
}

fn otlp_tracer(endpoint: String, source_count: usize) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};

    let resource = Resource::new(vec![
        KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("purple.sources", source_count as i64),
    ]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(endpoint))
        .with_trace_config(TraceConfig::default().with_resource(resource))
        .install_batch(Tokio)
        .context("failed to install OTLP trace pipeline")?;
    Ok(tracer)
}

/// Collector base URL to its OTLP/HTTP traces URL. `None` for a blank value.
fn traces_endpoint(base: &str) -> Option<String> {
    let base = base.trim().trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    if base.ends_with("/v1/traces") {
        return Some(base.to_string());
    }
    Some(format!("{base}/v1/traces"))
}

fn log_sources(sources: &[SourceEndpoint]) {
    for source in sources {
        tracing::info!(
            role = source.role.as_str(),
            priority = source.priority,
            host = %source.host,
            port = source.port,
            timeout_secs = source.request_timeout.as_secs(),
            startup_timeout_secs = source.startup_timeout.map(|t| t.as_secs()),
            enabled = source.enabled,
            "configured source"
        );
    }
}

fn outcome_json(outcome: &CycleOutcome) -> Result<String> {
    let value = match outcome {
        CycleOutcome::Updated(reading) => serde_json::json!({ "updated": reading }),
        CycleOutcome::NoUpdate(reason) => serde_json::json!({
            "no_update": reason.kind(),
            "reason": reason.to_string(),
        }),
    };
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Fetches a single endpoint and prints both the decoded and corrected reading.
async fn probe(host: String, port: u16, timeout: Duration) -> Result<()> {
    let endpoint = SourceEndpoint {
        role: SourceRole::Sensor,
        priority: 1,
        host,
        port,
        request_timeout: timeout,
        startup_timeout: None,
        enabled: true,
    };
    let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
    let reading = fetcher
        .fetch(&endpoint, timeout)
        .await
        .with_context(|| format!("probe of {} failed", endpoint.url()))?;
    let corrected = correct_reading(&reading);
    let value = serde_json::json!({ "reading": reading, "corrected": corrected });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(host) = args.probe_host {
        init_console_tracing()?;
        return probe(host, args.probe_port, Duration::from_secs(args.probe_timeout_secs)).await;
    }

    let config = Config::from_env()?;
    init_tracing(&config)?;
    config.log_warnings();
    log_sources(&config.sources);

    let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
    let mut pipeline = ReadingPipeline::new(
        SourceCascade::new(config.sources.clone(), fetcher),
        config.validation_policy(),
    );

    if args.once {
        let outcome = pipeline.run_cycle(Utc::now()).await;
        println!("{}", outcome_json(&outcome)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let latest = LatestReading::new();
    let mut sinks: Vec<Arc<dyn ReadingSink>> = vec![latest.clone() as Arc<dyn ReadingSink>];
    if let Some(feed) = FeedPublisher::new(&config) {
        tracing::info!("forwarding readings to feed");
        sinks.push(Arc::new(feed));
    }

    let http_handle = match config.http_bind.as_deref() {
        Some(bind) => {
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
            tracing::info!(bind, "HTTP query surface listening");
            let app = router(HttpState {
                latest: latest.clone(),
                publish_window: config.publish_window(),
            });
            let shutdown = cancel.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let poller = tokio::spawn(service::run(
        pipeline,
        sinks,
        config.poll_interval(),
        cancel.clone(),
    ));

    tokio::select! {
        _ = async {
            if let Some(handle) = http_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                    Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error=%err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(err) = poller.await {
        tracing::warn!(error=%err, "poller task failed");
    }

    Ok(())
}
