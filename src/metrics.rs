//! Prometheus metrics for the controller.
//!
//! Initialize once at startup with [`init`], hand clones of the returned
//! [`Metrics`] to the engines, and serve them with [`run_metrics_server`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder, core::Collector,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Histogram buckets for metadata sync jobs (in seconds); loads can take many minutes
const SYNC_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0];

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    dataset_ufs_total_bytes: GaugeVec,
    dataset_file_num: GaugeVec,
    metadata_sync_duration: HistogramVec,

    reconcile_total: CounterVec,
    ports_reserved: Gauge,
    workers_scaled_in: CounterVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a finished metadata sync.
    pub fn record_metadata_sync(
        &self,
        namespace: &str,
        dataset: &str,
        ufs_total_bytes: u64,
        file_num: u64,
        duration_secs: f64,
    ) {
        self.dataset_ufs_total_bytes
            .with_label_values(&[namespace, dataset])
            .set(ufs_total_bytes as f64);
        self.dataset_file_num
            .with_label_values(&[namespace, dataset])
            .set(file_num as f64);
        self.metadata_sync_duration
            .with_label_values(&[namespace])
            .observe(duration_secs);
    }

    /// Record one reconcile step. `result` is "ok" or "error".
    pub fn record_reconcile(&self, step: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconcile_total.with_label_values(&[step, result]).inc();
    }

    pub fn set_ports_reserved(&self, count: usize) {
        self.ports_reserved.set(count as f64);
    }

    pub fn record_worker_scaled_in(&self, namespace: &str, runtime: &str) {
        self.workers_scaled_in
            .with_label_values(&[namespace, runtime])
            .inc();
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a dedicated Prometheus registry.
pub fn init() -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let dataset_ufs_total_bytes = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "ddc_dataset_ufs_total_bytes",
                "Total bytes in the dataset's under storage as of the last metadata sync",
            ),
            &["namespace", "dataset"],
        )?,
    );

    let dataset_file_num = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "ddc_dataset_file_num",
                "Number of files in the dataset as of the last metadata sync",
            ),
            &["namespace", "dataset"],
        )?,
    );

    let metadata_sync_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "ddc_metadata_sync_duration_seconds",
                "Wall time of background metadata sync jobs",
            )
            .buckets(SYNC_DURATION_BUCKETS.to_vec()),
            &["namespace"],
        )?,
    );

    let reconcile_total = register(
        &registry,
        CounterVec::new(
            Opts::new("ddc_reconcile_total", "Reconcile steps by outcome"),
            &["step", "result"],
        )?,
    );

    let ports_reserved = register(
        &registry,
        Gauge::new("ddc_ports_reserved", "Host ports currently reserved")?,
    );

    let workers_scaled_in = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "ddc_workers_scaled_in_total",
                "Nodes removed from a runtime's cache by scale-in or shutdown",
            ),
            &["namespace", "runtime"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        dataset_ufs_total_bytes,
        dataset_file_num,
        metadata_sync_duration,
        reconcile_total,
        ports_reserved,
        workers_scaled_in,
    })
}

/// Encode every registered metric in the Prometheus text format.
pub fn encode(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match encode(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when shutdown signal is received.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
