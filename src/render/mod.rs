use std::fmt::Write as _;
use std::io;

use crate::config::FieldConfig;
use crate::record::Record;

/// Clears the terminal and homes the cursor.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Everything needed to draw one dashboard frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub latest: Option<Record>,
    pub metric: String,
    pub samples: Vec<f64>,
    pub collecting: bool,
}

/// Renders the readings form and the selected metric's chart as text.
pub struct TerminalRenderer<W: io::Write> {
    out: W,
    fields: Vec<FieldConfig>,
    width: usize,
    height: usize,
}

impl<W: io::Write> TerminalRenderer<W> {
    pub fn new(out: W, fields: Vec<FieldConfig>, width: usize, height: usize) -> Self {
        Self {
            out,
            fields,
            width: width.max(2),
            height: height.max(2),
        }
    }

    /// Writes a complete frame, replacing whatever was on screen.
    pub fn draw(&mut self, frame: &Frame) -> io::Result<()> {
        let text = self.compose(frame);
        self.out.write_all(CLEAR_SCREEN.as_bytes())?;
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }

    fn compose(&self, frame: &Frame) -> String {
        let status = if frame.collecting {
            "collecting"
        } else {
            "stopped"
        };

        let mut text = format!("envwatch [{status}]\n\n");
        text.push_str(&render_readings(frame.latest.as_ref(), &self.fields));
        text.push('\n');
        text.push_str(&render_chart(
            &format!("{} Data", frame.metric),
            &frame.samples,
            self.width,
            self.height,
        ));
        text
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Fixed form layout: one `label: value` line per field, `-` when absent.
pub fn render_readings(record: Option<&Record>, fields: &[FieldConfig]) -> String {
    let label_width = fields
        .iter()
        .map(|f| f.label().chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for field in fields {
        let value = record
            .and_then(|r| r.text(&field.key))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "{:>label_width$}: {value}", field.label());
    }
    out
}

/// Text line chart of `samples` (oldest on the left).
///
/// The chart is `height` rows tall with min/max labels on the y axis. When
/// there are more samples than columns only the newest `width` are drawn.
pub fn render_chart(title: &str, samples: &[f64], width: usize, height: usize) -> String {
    let mut out = format!("{title}\n");

    let width = width.max(2);
    let height = height.max(2);
    let visible = &samples[samples.len().saturating_sub(width)..];

    let finite: Vec<f64> = visible.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        out.push_str("(no data)\n");
        return out;
    }

    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;

    let row_of = |v: f64| -> Option<usize> {
        if !v.is_finite() {
            return None;
        }
        if span == 0.0 {
            return Some(height / 2);
        }
        let scaled = ((v - min) / span * (height - 1) as f64).round() as usize;
        Some((height - 1) - scaled.min(height - 1))
    };

    let mut grid = vec![vec![' '; visible.len()]; height];
    for (col, value) in visible.iter().enumerate() {
        if let Some(row) = row_of(*value) {
            grid[row][col] = '*';
        }
    }

    let max_label = format_axis(max);
    let min_label = format_axis(min);
    let label_width = max_label.len().max(min_label.len());

    for (i, row) in grid.iter().enumerate() {
        let label = if i == 0 {
            max_label.as_str()
        } else if i == height - 1 {
            min_label.as_str()
        } else {
            ""
        };
        let line: String = row.iter().collect();
        let _ = writeln!(out, "{label:>label_width$} |{}", line.trim_end());
    }

    let _ = writeln!(
        out,
        "{:>label_width$} +{}",
        "",
        "-".repeat(visible.len())
    );
    let _ = writeln!(out, "{:>label_width$}  Time", "");
    out
}

fn format_axis(v: f64) -> String {
    format!("{v:.1}")
}
