use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flowtap";

/// Prometheus metrics for the ingestion and dispatch pipeline.
///
/// All metrics use the "flowtap" namespace. Organized by stage:
/// - Connection: socket lifecycle and raw byte counters
/// - Ingestion: framing, decoding and flow tracking
/// - Dispatch: per-category queues and sink outcomes
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Connection ===
    /// Successful connections to the distributor, by address type.
    pub connects: CounterVec,
    /// Whether the client is currently connected (1=yes, 0=no).
    pub connected: Gauge,
    /// Connection terminations by error kind.
    pub disconnects: CounterVec,
    /// Total bytes read from the socket.
    pub bytes_received: Counter,

    // === Ingestion ===
    /// Total complete frames extracted.
    pub frames_received: Counter,
    /// Frame payload size distribution.
    pub frame_size: Histogram,
    /// Decoded events by category.
    pub events_by_category: CounterVec,
    /// Failed lines by error kind.
    pub failed_lines: CounterVec,
    /// Flow evictions by cleanup reason.
    pub evictions: CounterVec,
    /// Number of daemon instances currently tracked.
    pub instances_tracked: Gauge,
    /// Number of flows currently tracked.
    pub flows_tracked: Gauge,

    // === Dispatch ===
    /// Dispatch outcomes by category and outcome.
    pub dispatch_outcomes: CounterVec,
    /// Current queued jobs per category.
    pub queue_length: GaugeVec,
    /// Queue capacity per category.
    pub queue_capacity: GaugeVec,
    /// Sink errors per category.
    pub sink_errors: CounterVec,
    /// Sink panics per category.
    pub sink_panics: CounterVec,
    /// Sink call duration per category.
    pub sink_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Connection ===
        let connects = CounterVec::new(
            Opts::new(
                "connects_total",
                "Total successful connections to the distributor by address type.",
            )
            .namespace(NAMESPACE),
            &["address_type"],
        )?;
        let connected = Gauge::with_opts(
            Opts::new(
                "connected",
                "Whether the distributor connection is established (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let disconnects = CounterVec::new(
            Opts::new(
                "disconnects_total",
                "Total connection terminations by error kind.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let bytes_received = Counter::with_opts(
            Opts::new("bytes_received_total", "Total bytes read from the socket.")
                .namespace(NAMESPACE),
        )?;

        // === Ingestion ===
        let frames_received = Counter::with_opts(
            Opts::new(
                "frames_received_total",
                "Total complete frames extracted from the stream.",
            )
            .namespace(NAMESPACE),
        )?;
        let frame_size = Histogram::with_opts(
            HistogramOpts::new("frame_size_bytes", "Frame payload size in bytes.")
                .namespace(NAMESPACE)
                .buckets(vec![128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 33792.0]),
        )?;
        let events_by_category = CounterVec::new(
            Opts::new(
                "events_by_category_total",
                "Total decoded events by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let failed_lines = CounterVec::new(
            Opts::new("failed_lines_total", "Total failed lines by error kind.")
                .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let evictions = CounterVec::new(
            Opts::new(
                "flow_evictions_total",
                "Total flow evictions by cleanup reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let instances_tracked = Gauge::with_opts(
            Opts::new(
                "instances_tracked",
                "Number of daemon instances currently tracked.",
            )
            .namespace(NAMESPACE),
        )?;
        let flows_tracked = Gauge::with_opts(
            Opts::new("flows_tracked", "Number of flows currently tracked.").namespace(NAMESPACE),
        )?;

        // === Dispatch ===
        let dispatch_outcomes = CounterVec::new(
            Opts::new(
                "dispatch_total",
                "Total dispatch decisions by category and outcome.",
            )
            .namespace(NAMESPACE),
            &["category", "outcome"],
        )?;
        let queue_length = GaugeVec::new(
            Opts::new(
                "dispatch_queue_length",
                "Current number of jobs in the category queue.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let queue_capacity = GaugeVec::new(
            Opts::new(
                "dispatch_queue_capacity",
                "Capacity of the category queue.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let sink_errors = CounterVec::new(
            Opts::new("sink_errors_total", "Total sink errors by category.").namespace(NAMESPACE),
            &["category"],
        )?;
        let sink_panics = CounterVec::new(
            Opts::new("sink_panics_total", "Total sink panics by category.").namespace(NAMESPACE),
            &["category"],
        )?;
        let sink_duration = HistogramVec::new(
            HistogramOpts::new(
                "sink_duration_seconds",
                "Time spent in a single sink call by category.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
            &["category"],
        )?;

        // Connection
        registry.register(Box::new(connects.clone()))?;
        registry.register(Box::new(connected.clone()))?;
        registry.register(Box::new(disconnects.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        // Ingestion
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frame_size.clone()))?;
        registry.register(Box::new(events_by_category.clone()))?;
        registry.register(Box::new(failed_lines.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(instances_tracked.clone()))?;
        registry.register(Box::new(flows_tracked.clone()))?;
        // Dispatch
        registry.register(Box::new(dispatch_outcomes.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(sink_panics.clone()))?;
        registry.register(Box::new(sink_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            connects,
            connected,
            disconnects,
            bytes_received,
            frames_received,
            frame_size,
            events_by_category,
            failed_lines,
            evictions,
            instances_tracked,
            flows_tracked,
            dispatch_outcomes,
            queue_length,
            queue_capacity,
            sink_errors,
            sink_panics,
            sink_duration,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// An empty listen address disables the server; the bound address is
    /// returned otherwise.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if self.addr.is_empty() {
            tracing::debug!("health metrics server disabled");
            return Ok(None);
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(Some(local_addr))
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
