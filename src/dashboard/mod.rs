use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RenderConfig};
use crate::export::health::HealthMetrics;
use crate::record::Record;
use crate::render::{Frame, TerminalRenderer};
use crate::sink::csv::{session_path, CsvBatchWriter};
use crate::sink::Sink;
use crate::source::{self, SensorSource};
use crate::window::MetricWindows;

/// Runtime control over sensor collection, exposed on the HTTP API.
pub trait CollectionControl: Send + Sync {
    /// Starts polling. Returns false if collection was already running.
    fn start_collection(&self) -> bool;

    /// Stops polling. Returns false if collection was not running.
    fn stop_collection(&self) -> bool;

    /// Changes the poll interval, restarting collection if it is running.
    fn set_poll_interval(&self, interval: Duration) -> Result<()>;

    fn poll_interval(&self) -> Duration;

    fn is_collecting(&self) -> bool;
}

/// State touched by both the poll and render tasks.
#[derive(Clone)]
struct Shared {
    windows: Arc<Mutex<MetricWindows>>,
    sink: Arc<Mutex<Box<dyn Sink>>>,
    latest: Arc<Mutex<Option<Record>>>,
    health: Arc<HealthMetrics>,
}

impl Shared {
    /// Feeds one polled record into the windows and the sink.
    ///
    /// Returns false, leaving everything untouched, when `cancel` has fired.
    /// Collection is cancelled under the windows lock, so a record either
    /// lands completely before the stop or not at all.
    fn ingest(&self, record: Record, cancel: &CancellationToken) -> bool {
        {
            let mut windows = self.windows.lock();
            if cancel.is_cancelled() {
                self.health.records_dropped.inc();
                debug!("collection stopped during request, dropping record");
                return false;
            }
            if let Err(e) = windows.ingest(&record) {
                self.health.decode_errors.inc();
                warn!(error = %e, "record not added to windows");
            }
            self.health.observe_windows(&windows);
            *self.latest.lock() = Some(record.clone());
        }

        let mut sink = self.sink.lock();
        let queued = sink.pending_len() + 1;
        match sink.add_record(record) {
            Ok(()) => {
                if sink.pending_len() == 0 {
                    self.health.rows_written.inc_by(queued as f64);
                }
            }
            Err(e) => {
                self.health.flush_errors.inc();
                warn!(
                    sink = sink.name(),
                    pending = sink.pending_len(),
                    error = %format!("{e:#}"),
                    "flush failed, batch kept for retry",
                );
            }
        }
        self.health.pending_records.set(sink.pending_len() as f64);
        true
    }

    /// Writes out a partial batch.
    fn flush_pending(&self) {
        let mut sink = self.sink.lock();
        match sink.flush() {
            Ok(rows) => {
                self.health.rows_written.inc_by(rows as f64);
                info!(rows, sink = sink.name(), "final flush complete");
            }
            Err(e) => {
                self.health.flush_errors.inc();
                warn!(
                    sink = sink.name(),
                    pending = sink.pending_len(),
                    error = %format!("{e:#}"),
                    "final flush failed, pending records lost",
                );
            }
        }
        self.health.pending_records.set(sink.pending_len() as f64);
    }

    fn frame(&self, collecting: bool) -> Frame {
        let windows = self.windows.lock();
        let (metric, samples) = windows.selected_snapshot();
        Frame {
            latest: self.latest.lock().clone(),
            metric,
            samples,
            collecting,
        }
    }
}

/// Poll and render tasks for one start/stop cycle of collection.
struct Collection {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Collection {
    fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "collection task join failed");
            }
        }
    }
}

struct CollectorState {
    poll_interval: Duration,
    running: Option<Collection>,
    /// Cancelled collections whose tasks may still be finishing a request.
    stopped: Vec<Collection>,
}

/// Starts and stops the poll and render tasks.
struct Collector<S> {
    source: Arc<S>,
    shared: Shared,
    render: RenderConfig,
    state: Mutex<CollectorState>,
}

impl<S: SensorSource + 'static> Collector<S> {
    /// Cancelled collections not yet joined.
    fn take_stopped(&self) -> Vec<Collection> {
        std::mem::take(&mut self.state.lock().stopped)
    }
}

impl<S: SensorSource + 'static> CollectionControl for Collector<S> {
    fn start_collection(&self) -> bool {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return false;
        }
        state.stopped.retain(|collection| !collection.is_finished());

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        tasks.push(tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            self.shared.clone(),
            state.poll_interval,
            cancel.clone(),
        )));

        if self.render.enabled {
            let renderer = TerminalRenderer::new(
                io::stdout(),
                self.render.fields.clone(),
                self.render.width,
                self.render.height,
            );
            tasks.push(tokio::spawn(render_loop(
                renderer,
                self.shared.clone(),
                self.render.interval,
                cancel.clone(),
            )));
        }

        self.shared.health.collecting.set(1.0);
        info!(poll_interval = ?state.poll_interval, "collection started");
        state.running = Some(Collection { cancel, tasks });
        true
    }

    fn stop_collection(&self) -> bool {
        let mut state = self.state.lock();
        let Some(collection) = state.running.take() else {
            return false;
        };

        {
            let _windows = self.shared.windows.lock();
            collection.cancel.cancel();
        }

        state.stopped.push(collection);
        self.shared.health.collecting.set(0.0);
        info!("collection stopped");
        true
    }

    fn set_poll_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            bail!("poll interval must be positive");
        }

        let running = {
            let mut state = self.state.lock();
            state.poll_interval = interval;
            state.running.is_some()
        };
        self.shared
            .health
            .poll_interval
            .set(interval.as_secs_f64());
        info!(?interval, "poll interval changed");

        if running {
            self.stop_collection();
            self.start_collection();
        }

        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.state.lock().poll_interval
    }

    fn is_collecting(&self) -> bool {
        self.state.lock().running.is_some()
    }
}

/// Dashboard owns the metric windows, the CSV sink and the sensor source,
/// and drives the poll and render tasks.
pub struct Dashboard<S = source::Client> {
    cfg: Config,
    collector: Arc<Collector<S>>,
    health_addr: Option<SocketAddr>,
}

impl Dashboard<source::Client> {
    /// Creates a dashboard polling the configured HTTP endpoint and writing
    /// to a fresh CSV file for this run.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let client = source::Client::new(&cfg.source).context("creating sensor client")?;
        let metrics = Arc::clone(&health);
        let client = client.with_metrics(Box::new(move |status: &str, duration: Duration| {
            metrics.polls_total.with_label_values(&[status]).inc();
            metrics.poll_duration.observe(duration.as_secs_f64());
        }));

        let path = session_path(&cfg.csv.dir, &cfg.csv.prefix, Local::now());
        let writer = CsvBatchWriter::new(path, cfg.csv.batch_size).context("creating csv sink")?;
        info!(path = %writer.path().display(), "csv output assigned");

        Self::build(cfg, client, Box::new(writer), health)
    }
}

impl<S: SensorSource + 'static> Dashboard<S> {
    /// Creates a dashboard around an arbitrary source and sink.
    pub fn with_source(cfg: Config, source: S, sink: Box<dyn Sink>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        Self::build(cfg, source, sink, health)
    }

    fn build(
        cfg: Config,
        source: S,
        sink: Box<dyn Sink>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let mut windows = MetricWindows::new(&cfg.window.metrics, cfg.window.capacity)
            .context("creating metric windows")?;
        if let Some(selected) = &cfg.window.selected {
            windows.select(selected).context("selecting initial metric")?;
        }
        health.observe_windows(&windows);
        health
            .poll_interval
            .set(cfg.source.poll_interval.as_secs_f64());

        let collector = Collector {
            source: Arc::new(source),
            shared: Shared {
                windows: Arc::new(Mutex::new(windows)),
                sink: Arc::new(Mutex::new(sink)),
                latest: Arc::new(Mutex::new(None)),
                health,
            },
            render: cfg.render.clone(),
            state: Mutex::new(CollectorState {
                poll_interval: cfg.source.poll_interval,
                running: None,
                stopped: Vec::new(),
            }),
        };

        Ok(Self {
            cfg,
            collector: Arc::new(collector),
            health_addr: None,
        })
    }

    /// Starts the health server (if enabled) and collection.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.health.enabled {
            let control: Arc<dyn CollectionControl> = self.collector.clone();
            let addr = self
                .collector
                .shared
                .health
                .start(self.windows(), control)
                .await
                .context("starting health server")?;
            self.health_addr = Some(addr);
        }

        self.start_collection();

        info!(
            render_interval = ?self.cfg.render.interval,
            metrics = ?self.cfg.window.metrics,
            "dashboard started",
        );

        Ok(())
    }

    /// Spawns the poll and render tasks. No-op while already collecting.
    pub fn start_collection(&self) {
        self.collector.start_collection();
    }

    /// Stops the poll and render timers.
    ///
    /// A request already in flight is not aborted; its record is dropped when
    /// it arrives.
    pub fn stop_collection(&self) {
        self.collector.stop_collection();
    }

    /// Changes the poll interval, restarting collection if it is running.
    pub fn set_poll_interval(&self, interval: Duration) -> Result<()> {
        self.collector.set_poll_interval(interval)
    }

    pub fn poll_interval(&self) -> Duration {
        self.collector.poll_interval()
    }

    pub fn is_collecting(&self) -> bool {
        self.collector.is_collecting()
    }

    /// Address the health server bound to, once started.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Switches the charted metric.
    pub fn select(&self, metric: &str) -> Result<()> {
        self.collector.shared.windows.lock().select(metric)?;
        info!(metric, "selected metric changed");
        Ok(())
    }

    /// Shared handle to the metric windows.
    pub fn windows(&self) -> Arc<Mutex<MetricWindows>> {
        Arc::clone(&self.collector.shared.windows)
    }

    /// The most recently polled record.
    pub fn latest(&self) -> Option<Record> {
        self.collector.shared.latest.lock().clone()
    }

    /// Records waiting for the next CSV flush.
    pub fn pending_records(&self) -> usize {
        self.collector.shared.sink.lock().pending_len()
    }

    /// What the render task would draw right now.
    pub fn frame(&self) -> Frame {
        self.collector.shared.frame(self.is_collecting())
    }

    /// Gracefully stop collection, flush a partial batch and stop the server.
    pub async fn stop(&self) -> Result<()> {
        self.stop_collection();

        // Wait for in-flight polls so nothing lands in the sink after the
        // final flush.
        for collection in self.collector.take_stopped() {
            collection.join().await;
        }

        if self.cfg.csv.flush_on_shutdown {
            let shared = self.collector.shared.clone();
            tokio::task::spawn_blocking(move || shared.flush_pending())
                .await
                .context("final flush task")?;
        }

        self.collector.shared.health.stop().await?;

        Ok(())
    }
}

/// Polls the source on every tick until cancelled.
async fn poll_loop<S: SensorSource>(
    source: Arc<S>,
    shared: Shared,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match source.fetch().await {
            Ok(record) => {
                // The CSV append can block on the filesystem.
                let task_shared = shared.clone();
                let task_cancel = cancel.clone();
                let ingest =
                    tokio::task::spawn_blocking(move || task_shared.ingest(record, &task_cancel));
                match ingest.await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => warn!(error = %e, "record ingest task failed"),
                }
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "sensor poll failed, skipping cycle");
            }
        }
    }
}

/// Redraws the dashboard on every tick until cancelled.
async fn render_loop<W: io::Write + Send + 'static>(
    mut renderer: TerminalRenderer<W>,
    shared: Shared,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let frame = shared.frame(true);
                match renderer.draw(&frame) {
                    Ok(()) => shared.health.renders_total.inc(),
                    Err(e) => warn!(error = %e, "drawing dashboard failed"),
                }
            }
        }
    }
}
