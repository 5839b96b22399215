use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the envwatch dashboard.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sensor endpoint configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Sliding window configuration.
    #[serde(default)]
    pub window: WindowConfig,

    /// CSV persistence configuration.
    #[serde(default)]
    pub csv: CsvConfig,

    /// Terminal rendering configuration.
    #[serde(default)]
    pub render: RenderConfig,

    /// Metrics and control server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Sensor endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Sensor HTTP endpoint (e.g., "http://192.168.2.222:33200/sensor/getAllSensor").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How often to poll the endpoint. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Field name used to stamp each record with its local receive time.
    /// Default: "timestamp".
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

/// Sliding window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Samples kept per metric. Default: 10.
    #[serde(default = "default_window_capacity")]
    pub capacity: usize,

    /// Record fields tracked as numeric windows.
    #[serde(default = "default_window_metrics")]
    pub metrics: Vec<String>,

    /// Metric charted at startup. Default: first metric.
    #[serde(default)]
    pub selected: Option<String>,
}

/// CSV persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    /// Directory holding one CSV file per run. Default: "./env-data".
    #[serde(default = "default_csv_dir")]
    pub dir: PathBuf,

    /// File name prefix. Default: "env_data".
    #[serde(default = "default_csv_prefix")]
    pub prefix: String,

    /// Records per append. Default: 10.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Write a partial batch on shutdown. Default: true.
    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,
}

/// Terminal rendering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Draw the dashboard on stdout. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redraw interval. Default: 1s.
    #[serde(default = "default_render_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Chart width in columns. Default: 60.
    #[serde(default = "default_chart_width")]
    pub width: usize,

    /// Chart height in rows. Default: 10.
    #[serde(default = "default_chart_height")]
    pub height: usize,

    /// Readings shown in the form, in display order.
    #[serde(default = "default_fields")]
    pub fields: Vec<FieldConfig>,
}

/// One labelled reading in the form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldConfig {
    /// Record field name.
    pub key: String,
    /// Label shown next to the value. Default: the key.
    #[serde(default)]
    pub label: Option<String>,
}

impl FieldConfig {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.key)
    }
}

/// Metrics and control server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and the window API. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_window_capacity() -> usize {
    10
}

fn default_window_metrics() -> Vec<String> {
    ["Noise", "Temperature", "Humidity", "PM2.5"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("./env-data")
}

fn default_csv_prefix() -> String {
    "env_data".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_render_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_chart_width() -> usize {
    60
}

fn default_chart_height() -> usize {
    10
}

fn default_fields() -> Vec<FieldConfig> {
    const FIELDS: &[(&str, &str)] = &[
        ("Noise", "Noise"),
        ("Temperature", "Temperature"),
        ("Humidity", "Humidity"),
        ("Wind_Speed", "Wind speed"),
        ("Wind_Direction", "Wind direction"),
        ("Rainfall", "Rainfall"),
        ("Radiation", "Radiation"),
        ("Illumination", "Illumination"),
        ("AirPressure", "Air pressure"),
        ("PM2.5", "PM2.5"),
        ("PM10", "PM10"),
        ("Ultraviolet_Ray", "Ultraviolet"),
        ("CO", "CO"),
        ("SO2", "SO2"),
        ("NO2", "NO2"),
        ("O3", "O3"),
        ("TVOC", "TVOC"),
        ("People_Number", "People"),
        ("Car_Sum", "Cars"),
        ("Car_Number_green", "EV cars"),
        ("Car_Number_Notgreen", "Fuel cars"),
    ];

    FIELDS
        .iter()
        .map(|(key, label)| FieldConfig {
            key: key.to_string(),
            label: Some(label.to_string()),
        })
        .collect()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            window: WindowConfig::default(),
            csv: CsvConfig::default(),
            render: RenderConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_source_timeout(),
            poll_interval: default_poll_interval(),
            timestamp_field: default_timestamp_field(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: default_window_capacity(),
            metrics: default_window_metrics(),
            selected: None,
        }
    }
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            dir: default_csv_dir(),
            prefix: default_csv_prefix(),
            batch_size: default_batch_size(),
            flush_on_shutdown: true,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_render_interval(),
            width: default_chart_width(),
            height: default_chart_height(),
            fields: default_fields(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The result is not validated so command-line overrides can be applied
    /// first; call [`Config::validate`] afterwards.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text, filling in defaults.
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("decoding YAML")
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.endpoint.is_empty() {
            bail!("source.endpoint is required");
        }

        if self.source.timeout.is_zero() {
            bail!("source.timeout must be positive");
        }

        if self.source.poll_interval.is_zero() {
            bail!("source.poll_interval must be positive");
        }

        if self.window.capacity == 0 {
            bail!("window.capacity must be at least 1");
        }

        if self.window.metrics.is_empty() {
            bail!("window.metrics must name at least one metric");
        }

        let mut seen = HashSet::new();
        for metric in &self.window.metrics {
            if !seen.insert(metric.as_str()) {
                bail!("metric appears more than once in window.metrics: {metric}");
            }
        }

        if let Some(selected) = &self.window.selected {
            if !seen.contains(selected.as_str()) {
                bail!("window.selected {selected:?} is not listed in window.metrics");
            }
        }

        if self.csv.batch_size == 0 {
            bail!("csv.batch_size must be positive");
        }

        if self.csv.prefix.is_empty() {
            bail!("csv.prefix is required");
        }

        if self.render.enabled {
            if self.render.interval.is_zero() {
                bail!("render.interval must be positive");
            }
            if self.render.width < 2 || self.render.height < 2 {
                bail!("render.width and render.height must be at least 2");
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}
