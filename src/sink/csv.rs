use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::record::{Cell, Record};

use super::Sink;

/// Batches records and appends them to a CSV file once `batch_size` is reached.
///
/// The header row comes from the field order of the first record written to
/// an empty file. Later records are assumed to share that field set; rows
/// that don't are written as-is.
///
/// A failed flush keeps the whole batch queued and is retried by the next
/// `add_record`.
pub struct CsvBatchWriter {
    path: PathBuf,
    batch_size: usize,
    pending: Vec<Record>,
}

impl CsvBatchWriter {
    /// Creates a writer for `path`. Nothing touches the filesystem until the
    /// first flush.
    pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be positive");
        }

        Ok(Self {
            path: path.into(),
            batch_size,
            pending: Vec::with_capacity(batch_size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Writes all pending records in one append.
    fn write_pending(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;

        let start_len = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", self.path.display()))?
            .len();

        let payload = encode_batch(&self.pending, start_len == 0)?;

        if let Err(e) = file.write_all(&payload).and_then(|()| file.flush()) {
            // Drop whatever part of the batch made it to disk so a retry
            // doesn't duplicate rows.
            if let Err(truncate_err) = file.set_len(start_len) {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "failed to roll back partial csv write",
                );
            }
            return Err(e).with_context(|| format!("appending to {}", self.path.display()));
        }

        Ok(())
    }
}

impl Sink for CsvBatchWriter {
    fn name(&self) -> &str {
        "csv"
    }

    fn add_record(&mut self, record: Record) -> Result<()> {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        self.write_pending()?;

        let rows = self.pending.len();
        self.pending.clear();

        debug!(rows, path = %self.path.display(), "flushed csv batch");

        Ok(rows)
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Builds the per-run file path `<dir>/<prefix>_<YYYY-MM-DD_HH-MM-SS>.csv`.
pub fn session_path(dir: &Path, prefix: &str, started: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{prefix}_{}.csv",
        started.format("%Y-%m-%d_%H-%M-%S")
    ))
}

/// Encodes an optional header plus one row per record.
fn encode_batch(records: &[Record], with_header: bool) -> Result<Vec<u8>> {
    let mut writer = ::csv::WriterBuilder::new()
        .flexible(true)
        .terminator(::csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    if with_header {
        if let Some(first) = records.first() {
            writer
                .write_record(first.field_names())
                .context("encoding csv header")?;
        }
    }

    for record in records {
        let row = record
            .values()
            .map(|value| Cell::from_value(value).to_string());
        writer.write_record(row).context("encoding csv row")?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow!("finishing csv payload: {}", e.error()))
}
