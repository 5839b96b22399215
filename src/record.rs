use std::fmt;

use serde_json::{Map, Value};

/// Errors raised when a tracked metric cannot be read from a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record has no value for field {0:?}")]
    MissingField(String),
    #[error("field {field:?} is not numeric: {value}")]
    NotNumeric { field: String, value: String },
}

/// One poll response: field names mapped to values in arrival order.
///
/// The field set is whatever the source sent; nothing is declared up front.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already decoded JSON object.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Sets a field. New fields go to the end; existing fields keep their position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field names in record order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Field values in record order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Display text for a field, without JSON quoting.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Decodes a field as a numeric sample.
    ///
    /// Absent and null fields are `MissingField`; strings must parse as a
    /// float after trimming.
    pub fn metric(&self, name: &str) -> Result<f64, DecodeError> {
        let not_numeric = |value: &Value| DecodeError::NotNumeric {
            field: name.to_string(),
            value: value.to_string(),
        };

        match self.fields.get(name) {
            None | Some(Value::Null) => Err(DecodeError::MissingField(name.to_string())),
            Some(value @ Value::Number(n)) => n.as_f64().ok_or_else(|| not_numeric(value)),
            Some(value @ Value::String(s)) => s.trim().parse().map_err(|_| not_numeric(value)),
            Some(value) => Err(not_numeric(value)),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

/// A single CSV cell after numeric-string conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    /// Converts a record value into the cell written to disk.
    ///
    /// Numeric-looking strings become numbers; JSON numbers keep their
    /// original text; null becomes an empty cell.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => match numeric_value(s) {
                Some(n) => Cell::Number(n),
                None => Cell::Text(s.clone()),
            },
            Value::Null => Cell::Text(String::new()),
            Value::Number(n) => Cell::Text(n.to_string()),
            Value::Bool(b) => Cell::Text(b.to_string()),
            other => Cell::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Debug keeps the trailing ".0" on integral floats.
            Cell::Number(n) => write!(f, "{n:?}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// Parses `s` as a number if it looks numeric.
///
/// Accepts an optional leading sign followed by ASCII digits containing at
/// most one decimal point. Anything else (`"N/A"`, `""`, `"1.2.3"`, `"1e3"`)
/// is left as text.
pub fn numeric_value(s: &str) -> Option<f64> {
    let body = s.strip_prefix(&['-', '+'][..]).unwrap_or(s);

    let mut seen_dot = false;
    let mut seen_digit = false;
    for b in body.bytes() {
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            _ => return None,
        }
    }

    if !seen_digit {
        return None;
    }

    s.parse().ok()
}
