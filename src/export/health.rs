use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use humantime_serde::re::humantime;
use parking_lot::Mutex;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dashboard::CollectionControl;
use crate::window::MetricWindows;

/// Prometheus metrics for the dashboard, plus the HTTP server exposing them
/// alongside the window API.
///
/// All metrics use the "envwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Sensor polls by status (success/error).
    pub polls_total: CounterVec,
    /// Sensor request duration.
    pub poll_duration: Histogram,
    /// Records that failed numeric decoding for the windows.
    pub decode_errors: Counter,
    /// Records discarded because collection stopped while they were in flight.
    pub records_dropped: Counter,
    /// Rows appended to the CSV file.
    pub rows_written: Counter,
    /// Failed CSV flushes.
    pub flush_errors: Counter,
    /// Records waiting for the next CSV flush.
    pub pending_records: Gauge,
    /// Samples currently held per metric window.
    pub window_samples: GaugeVec,
    /// Dashboard frames drawn.
    pub renders_total: Counter,
    /// Whether collection is running (1=yes, 0=no).
    pub collecting: Gauge,
    /// Current sensor poll interval.
    pub poll_interval: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let polls_total = CounterVec::new(
            Opts::new("polls_total", "Total sensor polls by status.").namespace("envwatch"),
            &["status"],
        )?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new("poll_duration_seconds", "Sensor request duration.")
                .namespace("envwatch")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let decode_errors = Counter::with_opts(
            Opts::new(
                "decode_errors_total",
                "Total records whose tracked metrics could not be decoded.",
            )
            .namespace("envwatch"),
        )?;
        let records_dropped = Counter::with_opts(
            Opts::new(
                "records_dropped_total",
                "Total records dropped because collection stopped mid-request.",
            )
            .namespace("envwatch"),
        )?;
        let rows_written = Counter::with_opts(
            Opts::new("csv_rows_written_total", "Total rows appended to the CSV file.")
                .namespace("envwatch"),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new("csv_flush_errors_total", "Total failed CSV flushes.")
                .namespace("envwatch"),
        )?;
        let pending_records = Gauge::with_opts(
            Opts::new(
                "csv_pending_records",
                "Records waiting for the next CSV flush.",
            )
            .namespace("envwatch"),
        )?;
        let window_samples = GaugeVec::new(
            Opts::new("window_samples", "Samples currently held per metric window.")
                .namespace("envwatch"),
            &["metric"],
        )?;
        let renders_total = Counter::with_opts(
            Opts::new("renders_total", "Total dashboard frames drawn.").namespace("envwatch"),
        )?;
        let collecting = Gauge::with_opts(
            Opts::new(
                "collecting",
                "Whether sensor collection is running (1=yes, 0=no).",
            )
            .namespace("envwatch"),
        )?;

        let poll_interval = Gauge::with_opts(
            Opts::new("poll_interval_seconds", "Current sensor poll interval.")
                .namespace("envwatch"),
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(pending_records.clone()))?;
        registry.register(Box::new(window_samples.clone()))?;
        registry.register(Box::new(renders_total.clone()))?;
        registry.register(Box::new(collecting.clone()))?;
        registry.register(Box::new(poll_interval.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            polls_total,
            poll_duration,
            decode_errors,
            records_dropped,
            rows_written,
            flush_errors,
            pending_records,
            window_samples,
            renders_total,
            collecting,
            poll_interval,
        })
    }

    /// Refreshes the per-window sample gauges.
    pub fn observe_windows(&self, windows: &MetricWindows) {
        for metric in windows.metrics() {
            let len = windows.window(metric).map_or(0, |w| w.len());
            self.window_samples
                .with_label_values(&[metric.as_str()])
                .set(len as f64);
        }
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz, the window API and
    /// the collection controls.
    ///
    /// Returns the bound address.
    pub async fn start(
        &self,
        windows: Arc<Mutex<MetricWindows>>,
        control: Arc<dyn CollectionControl>,
    ) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            windows,
            control,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/windows", get(windows_handler))
            .route("/windows/:metric", get(window_handler))
            .route("/selected", get(selected_handler))
            .route("/selected/:metric", put(select_handler))
            .route("/collection", get(collection_handler))
            .route("/collection/start", post(start_collection_handler))
            .route("/collection/stop", post(stop_collection_handler))
            .route("/collection/interval/:interval", put(interval_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    windows: Arc<Mutex<MetricWindows>>,
    control: Arc<dyn CollectionControl>,
}

#[derive(Debug, Serialize)]
struct WindowBody {
    metric: String,
    samples: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct WindowsBody {
    selected: String,
    windows: Vec<WindowBody>,
}

#[derive(Debug, Serialize)]
struct CollectionBody {
    collecting: bool,
    poll_interval: String,
}

impl CollectionBody {
    fn from_control(control: &dyn CollectionControl) -> Self {
        Self {
            collecting: control.is_collecting(),
            poll_interval: humantime::format_duration(control.poll_interval()).to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(error: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error })).into_response()
}

fn bad_request(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
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

/// GET /windows - Every window, in configured order.
async fn windows_handler(State(state): State<Arc<AppState>>) -> Json<WindowsBody> {
    let windows = state.windows.lock();
    let body = WindowsBody {
        selected: windows.selected().to_string(),
        windows: windows
            .metrics()
            .iter()
            .map(|metric| WindowBody {
                metric: metric.clone(),
                samples: windows.snapshot(metric).unwrap_or_default(),
            })
            .collect(),
    };
    Json(body)
}

/// GET /windows/{metric} - One window's snapshot.
async fn window_handler(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
) -> Response {
    let samples = state.windows.lock().snapshot(&metric);
    match samples {
        Some(samples) => Json(WindowBody { metric, samples }).into_response(),
        None => not_found(format!("unknown metric {metric:?}")),
    }
}

/// GET /selected - Snapshot of the charted window.
async fn selected_handler(State(state): State<Arc<AppState>>) -> Json<WindowBody> {
    let (metric, samples) = state.windows.lock().selected_snapshot();
    Json(WindowBody { metric, samples })
}

/// PUT /selected/{metric} - Switch the charted window.
async fn select_handler(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
) -> Response {
    let result = state.windows.lock().select(&metric);
    match result {
        Ok(()) => {
            tracing::info!(metric = %metric, "selected metric changed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => not_found(e.to_string()),
    }
}

/// GET /collection - Whether collection runs, and how often it polls.
async fn collection_handler(State(state): State<Arc<AppState>>) -> Json<CollectionBody> {
    Json(CollectionBody::from_control(state.control.as_ref()))
}

/// POST /collection/start - Resume polling.
async fn start_collection_handler(State(state): State<Arc<AppState>>) -> Json<CollectionBody> {
    state.control.start_collection();
    Json(CollectionBody::from_control(state.control.as_ref()))
}

/// POST /collection/stop - Pause polling.
async fn stop_collection_handler(State(state): State<Arc<AppState>>) -> Json<CollectionBody> {
    state.control.stop_collection();
    Json(CollectionBody::from_control(state.control.as_ref()))
}

/// PUT /collection/interval/{interval} - Change the poll interval, e.g. `500ms`.
async fn interval_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let interval = match humantime::parse_duration(&raw) {
        Ok(interval) => interval,
        Err(e) => return bad_request(format!("invalid interval {raw:?}: {e}")),
    };

    if let Err(e) = state.control.set_poll_interval(interval) {
        return bad_request(format!("{e:#}"));
    }

    Json(CollectionBody::from_control(state.control.as_ref())).into_response()
}
