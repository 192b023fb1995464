//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "plclinkd_starts_total",
            "Total number of times the PLClink daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "plclinkd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new(
                "plclinkd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "transport"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, transport: &str) {
        self.build_info
            .with_label_values(&[version, transport])
            .set(1);
    }
}

/// Tag layer instrumentation: per-tag operation outcomes, wire latency and
/// monitoring session lifecycle.
#[derive(Clone, Debug)]
pub struct LinkMetrics {
    registry: SharedRegistry,
    tag_operations: IntCounterVec,
    wire_latency: HistogramVec,
    sessions_active: IntGauge,
    sessions_finished: IntCounterVec,
}

impl LinkMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let tag_operations = IntCounterVec::new(
            Opts::new(
                "plclink_tag_operations_total",
                "Tag reads and writes by tag, operation and outcome",
            ),
            &["tag", "op", "outcome"],
        )?;
        registry.register(Box::new(tag_operations.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let wire_latency = HistogramVec::new(
            HistogramOpts::new(
                "plclink_wire_operation_seconds",
                "Latency of single wire operations against the controller",
            )
            .buckets(buckets),
            &["transport", "op"],
        )?;
        registry.register(Box::new(wire_latency.clone()))?;

        let sessions_active = IntGauge::with_opts(Opts::new(
            "plclink_monitor_sessions_active",
            "Monitoring sessions currently polling the controller",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let sessions_finished = IntCounterVec::new(
            Opts::new(
                "plclink_monitor_sessions_total",
                "Finished monitoring sessions by terminal state",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(sessions_finished.clone()))?;

        Ok(Self {
            registry,
            tag_operations,
            wire_latency,
            sessions_active,
            sessions_finished,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tag_operation(&self, tag: &str, op: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.tag_operations
            .with_label_values(&[tag, op, outcome])
            .inc();
    }

    pub fn observe_wire(&self, transport: &str, op: &str, elapsed: Duration) {
        self.wire_latency
            .with_label_values(&[transport, op])
            .observe(elapsed.as_secs_f64());
    }

    pub fn session_started(&self) {
        self.sessions_active.inc();
    }

    pub fn session_finished(&self, outcome: &str) {
        self.sessions_active.dec();
        self.sessions_finished.with_label_values(&[outcome]).inc();
    }
}

pub use prometheus;
