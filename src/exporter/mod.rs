use crate::{
    brokerinfo::{FileDirectory, InstanceDirectory},
    cli::telemetry::shutdown_tracer,
    collectors::{
        CollectorDriver,
        cloudwatch::{AwsStatisticsSource, CloudWatchDriver},
        mysql, postgres,
    },
    config::Config,
    emitter::{MetricsSink, PrometheusSink, SinkKind, StdoutSink},
    scheduler::Scheduler,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{Next, from_fn},
    response::Response,
    routing::get,
};
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry_http::HeaderExtractor;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use ulid::Ulid;

mod handlers;
mod shutdown;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

/// Shared with every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Set when metrics are exposed on `/metrics`.
    pub prometheus: Option<Arc<PrometheusSink>>,
}

/// Load the config, start the scheduler and serve `/health` and `/metrics`
/// until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the config is invalid, the address cannot be bound or
/// the scheduler refuses to start
pub async fn new(
    port: u16,
    listen: Option<String>,
    config_path: PathBuf,
    sink: SinkKind,
) -> Result<()> {
    let config = Config::load(&config_path).await?;

    let directory: Arc<dyn InstanceDirectory> = Arc::new(FileDirectory::new(
        &config_path,
        config.instances.clone(),
    ));

    let (metrics_sink, prometheus): (Arc<dyn MetricsSink>, Option<Arc<PrometheusSink>>) =
        match sink {
            SinkKind::Prometheus => {
                let prometheus = Arc::new(PrometheusSink::new());
                (prometheus.clone(), Some(prometheus))
            }
            SinkKind::Stdout => (Arc::new(StdoutSink::new()), None),
        };

    let drivers = build_drivers(&config, &directory).await;

    let scheduler = Arc::new(
        Scheduler::new(directory, metrics_sink, config.scheduler.refresh_interval())
            .with_drain_timeout(config.scheduler.drain_timeout())
            .with_drivers(drivers),
    );

    let driver_names: Vec<String> = scheduler
        .driver_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let (listener, bind_addr) = bind(port, listen).await?;

    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown::shutdown_signal().await;
            info!("shutdown signal received");
            token.cancel();
        }
    });

    let (ready_tx, ready_rx) = oneshot::channel();

    let scheduler_task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let token = token.clone();
        async move { scheduler.run(token, Some(ready_tx)).await }
    });

    if ready_rx.await.is_err() {
        return match scheduler_task.await {
            Ok(Err(err)) => Err(err).context("Failed to start scheduler"),
            Ok(Ok(())) => Err(anyhow!("scheduler exited before it was ready")),
            Err(err) => Err(err).context("scheduler task failed"),
        };
    }

    let app = router(AppState {
        scheduler: Arc::clone(&scheduler),
        prometheus,
    });

    eprintln!(
        "{} {} - Listening on {bind_addr}\n\nDrivers:\n{}\n\nSink: {sink}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        format_list(&driver_names),
    );

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await
    {
        error!(error=%e, "server error");
    }

    info!("shutting down");

    // the server may also stop on its own error
    token.cancel();

    match scheduler_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "scheduler error"),
        Err(err) => error!(error = %err, "scheduler task failed"),
    }

    shutdown_tracer();

    Ok(())
}

/// Drivers enabled in `config`.
async fn build_drivers(
    config: &Config,
    directory: &Arc<dyn InstanceDirectory>,
) -> Vec<Arc<dyn CollectorDriver>> {
    let mut drivers: Vec<Arc<dyn CollectorDriver>> = Vec::new();

    if config.postgres.enabled {
        drivers.push(Arc::new(postgres::driver(
            Arc::clone(directory),
            &config.postgres,
        )));
    }

    if config.mysql.enabled {
        drivers.push(Arc::new(mysql::driver(Arc::clone(directory), &config.mysql)));
    }

    if config.cloudwatch.enabled
        && let Some(region) = &config.cloudwatch.region
    {
        let source = AwsStatisticsSource::from_region(region.clone()).await;
        drivers.push(Arc::new(CloudWatchDriver::new(
            Arc::new(source),
            Arc::clone(directory),
            Duration::from_secs(config.cloudwatch.collect_interval),
        )));
    }

    drivers
}

pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(make_span)
        .on_response(on_response);

    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(from_fn(add_trace_headers))
                .layer(Extension(state)),
        )
}

async fn bind(port: u16, listen: Option<String>) -> Result<(TcpListener, String)> {
    match listen {
        Some(addr) => {
            let ip = addr.parse::<std::net::IpAddr>().map_err(|_| {
                anyhow!(
                    "Invalid IP address: '{addr}'. Expected IPv4 (e.g., 0.0.0.0, 127.0.0.1) or IPv6 (e.g., ::, ::1)"
                )
            })?;

            let bind_addr = if ip.is_ipv6() {
                format!("[{ip}]:{port}")
            } else {
                format!("{ip}:{port}")
            };

            let listener = TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("Failed to bind to {bind_addr}"))?;

            Ok((listener, bind_addr))
        }
        None => {
            // IPv6 first, IPv4 as fallback
            match TcpListener::bind(format!("[::]:{port}")).await {
                Ok(l) => Ok((l, format!("[::]:{port}"))),
                Err(_) => Ok((
                    TcpListener::bind(format!("0.0.0.0:{port}"))
                        .await
                        .with_context(|| format!("Failed to bind to 0.0.0.0:{port}"))?,
                    format!("0.0.0.0:{port}"),
                )),
            }
        }
    }
}

// Helper to format a list of items with a leading dash and indentation for the
// start up message
fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_span(request: &Request<Body>) -> Span {
    let parent_cx =
        global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(request.headers())));

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let span = info_span!(
        "http.server.request",
        otel.kind = "server",
        http.method = request.method().as_str(),
        http.route = request.uri().path(),
        http.user_agent = user_agent,
        request_id = request_id,
    );

    let _ = span.set_parent(parent_cx);

    span
}

fn on_response<B>(response: &axum::http::Response<B>, latency: Duration, span: &Span) {
    if response.status().is_server_error() {
        span.record("otel.status_code", "ERROR");
    } else {
        span.record("otel.status_code", "OK");
    }

    let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    let trace_id = span.context().span().span_context().trace_id();

    if trace_id == TraceId::INVALID {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            "request completed"
        );
    } else {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            trace_id = %trace_id,
            "request completed"
        );
    }
}

async fn add_trace_headers(req: Request<Body>, next: Next) -> Response {
    let mut res = next.run(req).await;

    let span_context = Span::current().context().span().span_context().clone();

    if span_context.is_valid()
        && let Ok(val) = HeaderValue::from_str(&span_context.trace_id().to_string())
    {
        res.headers_mut()
            .insert(HeaderName::from_static("x-trace-id"), val);
    }

    res
}
