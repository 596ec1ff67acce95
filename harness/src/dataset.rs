//! Dataset rows handed to the engine.
//!
//! A row is a flat mapping from column name to scalar. Two columns are
//! reserved: `query` (the chat message for chatflow agents) and the reference
//! answer (`reference_answer`, or the legacy `ref_answer`). Every other column
//! is passed to the agent as a named input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const QUERY_FIELD: &str = "query";
pub const REFERENCE_FIELD: &str = "reference_answer";
pub const LEGACY_REFERENCE_FIELD: &str = "ref_answer";

/// Columns never forwarded to the agent as named inputs.
pub const RESERVED_FIELDS: [&str; 3] = [QUERY_FIELD, REFERENCE_FIELD, LEGACY_REFERENCE_FIELD];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid dataset JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Invalid dataset JSON at line {line}: {source}")]
    ParseLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported dataset format: {extension} (expected .json or .jsonl)")]
    UnsupportedFormat { extension: String },

    #[error("Dataset contains no rows")]
    Empty,
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Null, or text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Number(n) => Value::Number(n.clone()),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Null => Value::Null,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Null => Ok(()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Null)
    }
}

/// One test case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// The chat query, stringified. Empty when the column is absent.
    pub fn query(&self) -> String {
        self.get(QUERY_FIELD).map(|v| v.to_string()).unwrap_or_default()
    }

    /// The reference answer, if present and not blank.
    pub fn reference_answer(&self) -> Option<String> {
        [REFERENCE_FIELD, LEGACY_REFERENCE_FIELD]
            .iter()
            .filter_map(|name| self.get(name))
            .find(|value| !value.is_blank())
            .map(|value| value.to_string())
    }

    /// Named agent inputs: every non-reserved column.
    pub fn inputs(&self) -> serde_json::Map<String, Value> {
        self.fields
            .iter()
            .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

/// Ordered rows of one benchmark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    rows: Vec<Row>,
}

impl Dataset {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Load a `.json` array of objects or a `.jsonl` file with one object per line.
    pub fn from_path(path: impl AsRef<Path>) -> DatasetResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let dataset = match extension.as_str() {
            "json" => Self::from_json(&content)?,
            "jsonl" | "ndjson" => Self::from_json_lines(&content)?,
            _ => return Err(DatasetError::UnsupportedFormat { extension }),
        };
        if dataset.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(dataset)
    }

    pub fn from_json(content: &str) -> DatasetResult<Self> {
        let rows: Vec<Row> = serde_json::from_str(content)
            .map_err(DatasetError::Parse)?;
        Ok(Self { rows })
    }

    pub fn from_json_lines(content: &str) -> DatasetResult<Self> {
        let mut rows = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(line).map_err(|source| DatasetError::ParseLine {
                line: index + 1,
                source,
            })?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The first `n` rows.
    pub fn preview(&self, n: usize) -> Dataset {
        Dataset {
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }
}
