use std::collections::HashMap;

use crate::record::{DecodeError, Record};

use super::{SlidingWindow, WindowError};

/// One sliding window per monitored metric plus the metric currently shown
/// by the chart.
#[derive(Debug, Clone)]
pub struct MetricWindows {
    /// Metric names in configured order.
    order: Vec<String>,
    windows: HashMap<String, SlidingWindow>,
    selected: String,
}

impl MetricWindows {
    /// Creates an empty window of `capacity` for every metric.
    ///
    /// The first metric starts out selected.
    pub fn new<S: AsRef<str>>(metrics: &[S], capacity: usize) -> Result<Self, WindowError> {
        let first = metrics.first().ok_or(WindowError::NoMetrics)?;

        let mut order = Vec::with_capacity(metrics.len());
        let mut windows = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let name = metric.as_ref().to_string();
            if windows.contains_key(&name) {
                return Err(WindowError::DuplicateMetric(name));
            }
            windows.insert(name.clone(), SlidingWindow::new(capacity)?);
            order.push(name);
        }

        Ok(Self {
            order,
            windows,
            selected: first.as_ref().to_string(),
        })
    }

    /// Switches the chart to `metric`. Unknown names leave the selection as is.
    pub fn select(&mut self, metric: &str) -> Result<(), WindowError> {
        if !self.windows.contains_key(metric) {
            return Err(WindowError::UnknownMetric(metric.to_string()));
        }
        self.selected = metric.to_string();
        Ok(())
    }

    pub fn selected(&self) -> &str {
        &self.selected
    }

    /// Metric names in configured order.
    pub fn metrics(&self) -> &[String] {
        &self.order
    }

    pub fn window(&self, metric: &str) -> Option<&SlidingWindow> {
        self.windows.get(metric)
    }

    pub fn snapshot(&self, metric: &str) -> Option<Vec<f64>> {
        self.windows.get(metric).map(SlidingWindow::snapshot)
    }

    /// Snapshot of the selected window, paired with its metric name.
    pub fn selected_snapshot(&self) -> (String, Vec<f64>) {
        let samples = self.snapshot(&self.selected).unwrap_or_default();
        (self.selected.clone(), samples)
    }

    /// Pushes every tracked metric of `record` into its window.
    ///
    /// All metrics are decoded before anything is pushed, so a record with a
    /// missing or non-numeric metric leaves every window untouched.
    pub fn ingest(&mut self, record: &Record) -> Result<(), DecodeError> {
        let values = self
            .order
            .iter()
            .map(|metric| record.metric(metric))
            .collect::<Result<Vec<f64>, DecodeError>>()?;

        for (metric, value) in self.order.iter().zip(values) {
            if let Some(window) = self.windows.get_mut(metric) {
                window.push(value);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn windows() -> MetricWindows {
        MetricWindows::new(&["Noise", "Temperature"], 3).expect("valid windows")
    }

    fn reading(noise: &str, temperature: &str) -> Record {
        [("Noise", json!(noise)), ("Temperature", json!(temperature))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_new_validates_metrics() {
        let empty: [&str; 0] = [];
        assert_eq!(
            MetricWindows::new(&empty, 3).unwrap_err(),
            WindowError::NoMetrics
        );
        assert_eq!(
            MetricWindows::new(&["Noise", "Noise"], 3).unwrap_err(),
            WindowError::DuplicateMetric("Noise".into())
        );
        assert_eq!(
            MetricWindows::new(&["Noise"], 0).unwrap_err(),
            WindowError::ZeroCapacity
        );
    }

    #[test]
    fn test_first_metric_selected_by_default() {
        let w = windows();
        assert_eq!(w.selected(), "Noise");
        assert_eq!(w.metrics(), ["Noise".to_string(), "Temperature".to_string()]);
    }

    #[test]
    fn test_select_unknown_keeps_previous() {
        let mut w = windows();
        w.select("Temperature").expect("known metric");
        assert_eq!(w.selected(), "Temperature");

        let err = w.select("Humidity").expect_err("unknown metric");
        assert_eq!(err, WindowError::UnknownMetric("Humidity".into()));
        assert_eq!(w.selected(), "Temperature");
    }

    #[test]
    fn test_ingest_pushes_each_metric() {
        let mut w = windows();
        for i in 0..5 {
            w.ingest(&reading(&format!("{}", 30 + i), &format!("-{i}")))
                .expect("ingest");
        }

        assert_eq!(w.snapshot("Noise"), Some(vec![32.0, 33.0, 34.0]));
        assert_eq!(w.snapshot("Temperature"), Some(vec![-2.0, -3.0, -4.0]));
        assert_eq!(w.snapshot("Humidity"), None);
    }

    #[test]
    fn test_ingest_missing_field_leaves_windows_untouched() {
        let mut w = windows();
        w.ingest(&reading("35", "-6")).expect("ingest");

        let partial: Record = [("Noise", json!("40"))].into_iter().collect();
        let err = w.ingest(&partial).expect_err("missing temperature");
        assert_eq!(err, DecodeError::MissingField("Temperature".into()));

        assert_eq!(w.snapshot("Noise"), Some(vec![35.0]));
        assert_eq!(w.snapshot("Temperature"), Some(vec![-6.0]));
    }

    #[test]
    fn test_ingest_non_numeric_rejected() {
        let mut w = windows();
        let err = w.ingest(&reading("N/A", "1")).expect_err("not numeric");
        assert!(matches!(err, DecodeError::NotNumeric { .. }));
        assert!(w.window("Noise").expect("window").is_empty());
    }

    #[test]
    fn test_selected_snapshot_follows_selection() {
        let mut w = windows();
        w.ingest(&reading("35", "-6")).expect("ingest");
        w.ingest(&reading("36", "-7")).expect("ingest");

        assert_eq!(w.selected_snapshot(), ("Noise".to_string(), vec![35.0, 36.0]));

        w.select("Temperature").expect("known metric");
        assert_eq!(
            w.selected_snapshot(),
            ("Temperature".to_string(), vec![-6.0, -7.0])
        );
    }
}
