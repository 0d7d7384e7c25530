//! Prometheus metrics for a csmr node.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server exposing `/metrics`, `/health` and `/status`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Macro-step duration histogram buckets (in seconds).
const STEP_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

/// Service call duration histogram buckets (in seconds).
const INVOCATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for one node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Events fed to interpreters, by instance.
    pub events_processed_total: CounterVec,
    /// Events that enabled no transition, by instance.
    pub events_discarded_total: CounterVec,
    /// Duplicate deliveries suppressed, by instance.
    pub events_duplicate_total: CounterVec,
    /// Events handed to the router, by instance.
    pub events_published_total: CounterVec,
    /// Macro-step duration by instance.
    pub step_duration: HistogramVec,
    /// Recovered guard and action failures, by instance.
    pub evaluation_errors_total: CounterVec,
    /// Finished service calls by service and outcome.
    pub invocations_total: CounterVec,
    /// Service call duration by service.
    pub invocation_duration: HistogramVec,
    /// Events the router gave up on.
    pub delivery_failures_total: Counter,
    /// Checkpoints written.
    pub checkpoints_total: Counter,
    /// Checkpoint writes that failed.
    pub checkpoint_errors_total: Counter,
    /// Leases lost to session expiry.
    pub leases_lost_total: Counter,
    /// Instances driven by this node, by status.
    pub instances: GaugeVec,
    /// Supervisors waiting for an instance lease.
    pub instances_waiting: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_processed_total = CounterVec::new(
            Opts::new("csmr_events_processed_total", "Events processed by instance"),
            &["instance"],
        )?;
        registry.register(Box::new(events_processed_total.clone()))?;

        let events_discarded_total = CounterVec::new(
            Opts::new(
                "csmr_events_discarded_total",
                "Events that enabled no transition, by instance",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(events_discarded_total.clone()))?;

        let events_duplicate_total = CounterVec::new(
            Opts::new(
                "csmr_events_duplicate_total",
                "Duplicate deliveries suppressed, by instance",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(events_duplicate_total.clone()))?;

        let events_published_total = CounterVec::new(
            Opts::new("csmr_events_published_total", "Events published by instance"),
            &["instance"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let step_duration = HistogramVec::new(
            HistogramOpts::new(
                "csmr_step_duration_seconds",
                "Macro-step duration in seconds by instance",
            )
            .buckets(STEP_BUCKETS.to_vec()),
            &["instance"],
        )?;
        registry.register(Box::new(step_duration.clone()))?;

        let evaluation_errors_total = CounterVec::new(
            Opts::new(
                "csmr_evaluation_errors_total",
                "Recovered expression failures by instance",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(evaluation_errors_total.clone()))?;

        let invocations_total = CounterVec::new(
            Opts::new(
                "csmr_invocations_total",
                "Finished service invocations by service and outcome",
            ),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(invocations_total.clone()))?;

        let invocation_duration = HistogramVec::new(
            HistogramOpts::new(
                "csmr_invocation_duration_seconds",
                "Service invocation duration in seconds by service",
            )
            .buckets(INVOCATION_BUCKETS.to_vec()),
            &["service"],
        )?;
        registry.register(Box::new(invocation_duration.clone()))?;

        let delivery_failures_total = Counter::with_opts(Opts::new(
            "csmr_delivery_failures_total",
            "Events dropped after exhausting delivery retries",
        ))?;
        registry.register(Box::new(delivery_failures_total.clone()))?;

        let checkpoints_total = Counter::with_opts(Opts::new(
            "csmr_checkpoints_total",
            "Checkpoints written",
        ))?;
        registry.register(Box::new(checkpoints_total.clone()))?;

        let checkpoint_errors_total = Counter::with_opts(Opts::new(
            "csmr_checkpoint_errors_total",
            "Checkpoint writes that failed",
        ))?;
        registry.register(Box::new(checkpoint_errors_total.clone()))?;

        let leases_lost_total = Counter::with_opts(Opts::new(
            "csmr_leases_lost_total",
            "Instance leases lost to session expiry",
        ))?;
        registry.register(Box::new(leases_lost_total.clone()))?;

        let instances = GaugeVec::new(
            Opts::new("csmr_instances", "Instances driven by this node, by status"),
            &["status"],
        )?;
        registry.register(Box::new(instances.clone()))?;

        let instances_waiting = Gauge::with_opts(Opts::new(
            "csmr_instances_waiting",
            "Supervisors waiting for an instance lease",
        ))?;
        registry.register(Box::new(instances_waiting.clone()))?;

        Ok(Self {
            registry,
            events_processed_total,
            events_discarded_total,
            events_duplicate_total,
            events_published_total,
            step_duration,
            evaluation_errors_total,
            invocations_total,
            invocation_duration,
            delivery_failures_total,
            checkpoints_total,
            checkpoint_errors_total,
            leases_lost_total,
            instances,
            instances_waiting,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Produces the JSON served at `/status`.
pub type StatusFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// HTTP endpoint for metrics and instance status.
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until `shutdown` fires.
    pub async fn run(self, metrics: Arc<Metrics>, status: StatusFn, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Metrics server listening on http://{}/metrics", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let metrics = metrics.clone();
                            let status = status.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let metrics = metrics.clone();
                                    let status = status.clone();
                                    async move { handle_request(req, metrics, status).await }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    tracing::debug!("Metrics connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Metrics server accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Binds `addr` and serves until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    status: StatusFn,
    shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let server = MetricsServer::bind(addr).await?;
    server.run(metrics, status, shutdown).await;
    Ok(())
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    status: StatusFn,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body),
            Err(e) => {
                tracing::error!("failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encoding failed")
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        "/status" => respond(StatusCode::OK, "application/json", status().to_string()),
        "/" => respond(
            StatusCode::OK,
            "text/html",
            r#"<!DOCTYPE html>
<html>
<head><title>csmr</title></head>
<body>
<h1>csmr</h1>
<p><a href="/metrics">Metrics</a> | <a href="/status">Status</a></p>
</body>
</html>"#,
        ),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}
