pub mod csv;

use anyhow::Result;

use crate::record::Record;

/// Sink persists poll records.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Queue a record, persisting the queue once the sink's threshold is reached.
    fn add_record(&mut self, record: Record) -> Result<()>;

    /// Persist everything queued so far. Returns the number of records written.
    fn flush(&mut self) -> Result<usize>;

    /// Number of records queued but not yet persisted.
    fn pending_len(&self) -> usize;
}
