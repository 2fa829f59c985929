//! Prometheus metrics for the hermes proxy, scraped over a small HTTP
//! text exporter.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Process-wide metrics, created on first use
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Access the process-wide metrics
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Proxy metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    /// Commands routed, by target bitfield
    pub commands_routed_total: IntCounterVec,
    /// Completed backend replies, by outcome
    pub replies_total: IntCounterVec,
    /// Backend failures, by connection phase
    pub backend_errors_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hermes_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "hermes_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "hermes_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let commands_routed_total = IntCounterVec::new(
            Opts::new(
                "hermes_commands_routed_total",
                "Total number of commands routed by target",
            ),
            &["target"],
        )
        .unwrap();

        let replies_total = IntCounterVec::new(
            Opts::new(
                "hermes_replies_total",
                "Total number of completed backend replies",
            ),
            &["outcome"], // ok, error
        )
        .unwrap();

        let backend_errors_total = IntCounterVec::new(
            Opts::new(
                "hermes_backend_errors_total",
                "Total number of backend failures by phase",
            ),
            &["phase"], // connect, auth, routing
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(commands_routed_total.clone()))
            .unwrap();
        registry.register(Box::new(replies_total.clone())).unwrap();
        registry
            .register(Box::new(backend_errors_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            commands_routed_total,
            replies_total,
            backend_errors_total,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record a route decision
    pub fn record_route(&self, target: &str) {
        self.commands_routed_total.with_label_values(&[target]).inc();
    }

    /// Record a completed reply
    pub fn record_reply(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.replies_total.with_label_values(&[outcome]).inc();
    }

    /// Record a backend failure
    pub fn record_backend_error(&self, phase: &str) {
        self.backend_errors_total.with_label_values(&[phase]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick status and body for one exporter request. The exporter speaks
/// Prometheus text on `/metrics` and answers liveness probes on `/health`;
/// everything else is a 404.
fn route(path: &str) -> (StatusCode, String) {
    match path {
        "/metrics" => (StatusCode::OK, metrics().gather()),
        "/health" => (StatusCode::OK, "OK\n".to_string()),
        _ => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Serve the Prometheus text endpoint until the task is dropped
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "metrics exporter listening");

    loop {
        let (stream, peer) = listener.accept().await?;

        tokio::spawn(async move {
            let service = service_fn(|request: Request<Incoming>| async move {
                let (status, body) = route(request.uri().path());
                let response = Response::builder()
                    .status(status)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap();
                Ok::<_, Infallible>(response)
            });

            let connection =
                hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            if let Err(e) = connection.await {
                // Scrapers dropping the connection early is routine
                debug!(peer = %peer, error = %e, "metrics connection closed");
            }
        });
    }
}
