//! Declared input parameters of an agent and row checks against them.

use crate::dataset::{FieldValue, Row, RESERVED_FIELDS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Parameter response has no user_input_form list")]
    MissingForm,

    #[error("Invalid user_input_form entry {index}: {message}")]
    InvalidEntry { index: usize, message: String },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Control type of an input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamKind {
    TextInput,
    Paragraph,
    Number,
    Select,
    Unknown(String),
}

impl ParamKind {
    pub fn from_control(control: &str) -> Self {
        match control {
            "text-input" => ParamKind::TextInput,
            "paragraph" => ParamKind::Paragraph,
            "number" => ParamKind::Number,
            "select" => ParamKind::Select,
            other => ParamKind::Unknown(other.to_string()),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ParamKind::TextInput | ParamKind::Paragraph)
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::TextInput => f.write_str("text-input"),
            ParamKind::Paragraph => f.write_str("paragraph"),
            ParamKind::Number => f.write_str("number"),
            ParamKind::Select => f.write_str("select"),
            ParamKind::Unknown(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub variable: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

impl InputParameter {
    pub fn new(variable: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            variable: variable.into(),
            kind,
            label: None,
            max_length: None,
            required: false,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

/// The agent's full input form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub parameters: Vec<InputParameter>,
}

impl ParameterSchema {
    pub fn new(parameters: Vec<InputParameter>) -> Self {
        Self { parameters }
    }

    /// Parse the body of `GET {base_url}/parameters`.
    ///
    /// Each `user_input_form` entry is an object with a single key naming the
    /// control type, e.g. `{"text-input": {"variable": "city", ...}}`.
    pub fn from_response(body: &Value) -> SchemaResult<Self> {
        let form = body
            .get("user_input_form")
            .and_then(Value::as_array)
            .ok_or(SchemaError::MissingForm)?;

        let mut parameters = Vec::with_capacity(form.len());
        for (index, item) in form.iter().enumerate() {
            let invalid = |message: &str| SchemaError::InvalidEntry {
                index,
                message: message.to_string(),
            };
            let (control, entry) = item
                .as_object()
                .and_then(|obj| obj.iter().next())
                .ok_or_else(|| invalid("expected a single-key object"))?;
            let variable = entry
                .get("variable")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("missing variable name"))?;
            let kind = entry
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(control);

            parameters.push(InputParameter {
                variable: variable.to_string(),
                kind: ParamKind::from_control(kind),
                label: entry.get("label").and_then(Value::as_str).map(str::to_string),
                max_length: entry
                    .get("max_length")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize),
                required: entry.get("required").and_then(Value::as_bool).unwrap_or(false),
                options: entry
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|opts| {
                        opts.iter()
                            .filter_map(|o| o.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }

        debug!(parameters = parameters.len(), "Parsed agent parameter schema");
        Ok(Self { parameters })
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        self.parameters.iter().map(|p| p.variable.as_str()).collect()
    }

    /// Coerce a row's values to the declared control types.
    ///
    /// Missing columns are added as null. Text fields are stringified, number
    /// fields parsed from text when possible, and select values outside the
    /// option list are nulled out so validation reports them.
    pub fn align_row(&self, row: &mut Row) {
        for param in &self.parameters {
            let Some(value) = row.get(&param.variable).cloned() else {
                warn!(variable = %param.variable, "Missing column in dataset");
                row.insert(param.variable.clone(), FieldValue::Null);
                continue;
            };

            let aligned = match &param.kind {
                ParamKind::TextInput | ParamKind::Paragraph => match value {
                    FieldValue::Null | FieldValue::Text(_) => value,
                    other => FieldValue::Text(other.to_string()),
                },
                ParamKind::Number => match &value {
                    FieldValue::Text(s) => parse_number(s).unwrap_or(FieldValue::Null),
                    FieldValue::Bool(_) => FieldValue::Null,
                    _ => value,
                },
                ParamKind::Select => {
                    let text = match value {
                        FieldValue::Null => FieldValue::Null,
                        other => FieldValue::Text(other.to_string()),
                    };
                    match text.as_text() {
                        Some(choice)
                            if !param.options.is_empty()
                                && !param.options.iter().any(|o| o == choice) =>
                        {
                            warn!(variable = %param.variable, value = %choice, "Invalid choice");
                            FieldValue::Null
                        }
                        _ => text,
                    }
                }
                ParamKind::Unknown(kind) => {
                    debug!(variable = %param.variable, kind = %kind, "Unknown type left unchanged");
                    value
                }
            };
            if param.required && aligned.is_blank() {
                warn!(variable = %param.variable, "Required field has no usable value");
            }
            row.insert(param.variable.clone(), aligned);
        }
    }

    /// All problems with `row`; empty when the row conforms.
    pub fn validate_row(&self, row: &Row) -> Vec<String> {
        let mut errors = Vec::new();

        for param in &self.parameters {
            let var = &param.variable;
            let value = row.get(var);
            let missing = match value {
                None | Some(FieldValue::Null) => true,
                Some(FieldValue::Text(s)) => s.is_empty(),
                _ => false,
            };
            if param.required && missing {
                errors.push(format!("[{}] is required but missing.", var));
                continue;
            }
            let Some(value) = value.filter(|v| !matches!(v, FieldValue::Null)) else {
                continue;
            };

            match &param.kind {
                ParamKind::TextInput | ParamKind::Paragraph => match value {
                    FieldValue::Text(s) => {
                        let len = s.chars().count();
                        if let Some(max) = param.max_length.filter(|max| len > *max) {
                            errors.push(format!(
                                "[{}] length {} exceeds max_length {}.",
                                var, len, max
                            ));
                        }
                    }
                    _ => errors.push(format!("[{}] should be a string.", var)),
                },
                ParamKind::Number => {
                    if !matches!(value, FieldValue::Number(_)) {
                        errors.push(format!("[{}] should be a number.", var));
                    }
                }
                ParamKind::Select => {
                    let choice = value.to_string();
                    if !param.options.iter().any(|o| *o == choice) {
                        errors.push(format!(
                            "[{}] value '{}' not in allowed options {:?}.",
                            var, choice, param.options
                        ));
                    }
                }
                ParamKind::Unknown(kind) => {
                    errors.push(format!("[{}] unknown type '{}'.", var, kind));
                }
            }
        }

        let declared = self.variables();
        let extra: Vec<&str> = row
            .field_names()
            .filter(|name| !declared.contains(name) && !RESERVED_FIELDS.contains(name))
            .collect();
        if !extra.is_empty() {
            errors.push(format!("Unexpected fields in entry: {:?}", extra));
        }

        errors
    }
}

fn parse_number(text: &str) -> Option<FieldValue> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Some(FieldValue::from(n));
    }
    text.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(FieldValue::from)
}
