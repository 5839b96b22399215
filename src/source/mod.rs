use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::SourceConfig;
use crate::record::Record;

/// Local receive-time format stamped onto each record.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Callback type for recording sensor request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Source of sensor records.
pub trait SensorSource: Send + Sync {
    /// Fetch the current readings as one record.
    fn fetch(&self) -> impl std::future::Future<Output = Result<Record>> + Send;
}

/// HTTP sensor client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    timestamp_field: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new sensor client.
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            timestamp_field: cfg.timestamp_field.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(status, duration);
        }
    }

    async fn get_readings(&self) -> Result<Map<String, Value>> {
        let response = self
            .http
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {}", self.endpoint))?;

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "unexpected status {} from {}: {}",
                status_code,
                self.endpoint,
                body
            );
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("reading response from {}", self.endpoint))?;

        decode_readings(&body).with_context(|| format!("decoding response from {}", self.endpoint))
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct SensorApiResponse {
    data: SensorData,
}

#[derive(Deserialize)]
struct SensorData {
    sensor: Map<String, Value>,
}

/// Extract the sensor object from a `{"data": {"sensor": {...}}}` body.
fn decode_readings(body: &str) -> Result<Map<String, Value>> {
    let resp: SensorApiResponse = serde_json::from_str(body)?;
    Ok(resp.data.sensor)
}

/// Wrap decoded readings in a record and append the receive time.
fn stamp_record(readings: Map<String, Value>, field: &str, received: DateTime<Local>) -> Record {
    let mut record = Record::from_fields(readings);
    record.insert(field, received.format(TIMESTAMP_FORMAT).to_string());
    record
}

impl SensorSource for Client {
    async fn fetch(&self) -> Result<Record> {
        debug!(endpoint = %self.endpoint, "fetching sensor readings");

        let start = Instant::now();
        match self.get_readings().await {
            Ok(readings) => {
                self.record_request("success", start.elapsed());
                Ok(stamp_record(readings, &self.timestamp_field, Local::now()))
            }
            Err(e) => {
                self.record_request("error", start.elapsed());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_decode_readings_valid() {
        let body = r#"{"code":200,"data":{"sensor":{"Noise":"35","Temperature":"-6"}}}"#;
        let readings = decode_readings(body).expect("should decode");
        let keys: Vec<&String> = readings.keys().collect();
        assert_eq!(keys, vec!["Noise", "Temperature"]);
        assert_eq!(readings["Noise"], Value::String("35".into()));
    }

    #[test]
    fn test_decode_readings_missing_envelope() {
        assert!(decode_readings(r#"{"data":{}}"#).is_err());
        assert!(decode_readings(r#"{"sensor":{"Noise":"35"}}"#).is_err());
        assert!(decode_readings("not json").is_err());
    }

    #[test]
    fn test_stamp_record_appends_timestamp() {
        let readings = decode_readings(r#"{"data":{"sensor":{"Noise":"35"}}}"#).expect("decode");
        let received = Local
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .single()
            .expect("valid time");

        let record = stamp_record(readings, "timestamp", received);
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["Noise", "timestamp"]);
        assert_eq!(
            record.text("timestamp").as_deref(),
            Some("2024-03-05 14:07:09.000000")
        );
    }

    #[test]
    fn test_client_zero_timeout_falls_back() {
        let cfg = SourceConfig {
            endpoint: "http://localhost:1/sensor".to_string(),
            timeout: Duration::ZERO,
            ..Default::default()
        };
        let client = Client::new(&cfg).expect("client");
        assert_eq!(client.endpoint(), "http://localhost:1/sensor");
    }
}
