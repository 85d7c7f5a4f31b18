//! # Entity Field Schemas
//!
//! One generic decoder serves every entity. What differs per entity is
//! described by an [`EntitySchema`]: which column is the key, and for each
//! target field where it comes from, how it is coerced and what it defaults to.
//!
//! ## Defaults
//!
//! | Kind | Default |
//! |------|---------|
//! | `text` | `""` |
//! | `integer` | `0` |
//! | `decimal` | `0.0` |
//! | `boolean` | `false` |
//! | `text_list` | `[]` |
//! | `timestamp` | `0` |
//! | `json` | `null` |
//!
//! ## YAML
//!
//! ```yaml
//! entity: titles
//! key_field: tconst
//! fields:
//!   - name: primary_title
//!     source: primaryTitle
//!     type: text
//!   - name: rating
//!     type: decimal
//!     scale: 1
//!   - name: genres
//!     type: text_list
//!     separator: ","
//! ```

use crate::error::{MaterializeError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Decoded row image: target field name to typed value.
pub type Fields = BTreeMap<String, FieldValue>;

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }
}

fn default_separator() -> String {
    ",".to_string()
}

/// How a source column is coerced into a [`FieldValue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// UTF-8 text; scalars are stringified
    Text,
    /// 64-bit signed integer
    Integer,
    /// Fixed-point source decimal decoded as `f64`.
    ///
    /// With `precise` set, strings that are not plain numbers are read as
    /// Debezium "precise" decimals: base64 unscaled integers at `scale`.
    Decimal {
        #[serde(default)]
        scale: Option<u32>,
        #[serde(default)]
        precise: bool,
    },
    /// Boolean; accepts `0`/`1` and `"true"`/`"false"`
    Boolean,
    /// Delimited text split into an ordered list
    TextList {
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Epoch millis or RFC 3339
    Timestamp,
    /// Raw JSON, kept as-is
    Json,
}

impl FieldKind {
    pub fn decimal(scale: u32) -> Self {
        FieldKind::Decimal {
            scale: Some(scale),
            precise: false,
        }
    }

    /// Decimal that also accepts the base64 "precise" encoding.
    pub fn precise_decimal(scale: u32) -> Self {
        FieldKind::Decimal {
            scale: Some(scale),
            precise: true,
        }
    }

    pub fn text_list(separator: impl Into<String>) -> Self {
        FieldKind::TextList {
            separator: separator.into(),
        }
    }

    /// Value used when the column is absent, null or cannot be coerced.
    pub fn default_value(&self) -> FieldValue {
        match self {
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::Integer | FieldKind::Timestamp => FieldValue::Int(0),
            FieldKind::Decimal { .. } => FieldValue::Float(0.0),
            FieldKind::Boolean => FieldValue::Bool(false),
            FieldKind::TextList { .. } => FieldValue::List(Vec::new()),
            FieldKind::Json => FieldValue::Json(serde_json::Value::Null),
        }
    }

    /// Coerce a source value. `None` means "use the default".
    pub fn coerce(&self, value: &serde_json::Value) -> Option<FieldValue> {
        use serde_json::Value;

        if value.is_null() {
            return None;
        }

        match self {
            FieldKind::Text => match value {
                Value::String(s) => Some(FieldValue::Text(s.clone())),
                Value::Number(n) => Some(FieldValue::Text(n.to_string())),
                Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
                _ => None,
            },
            FieldKind::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(FieldValue::Int),
                Value::String(s) => s.trim().parse::<i64>().ok().map(FieldValue::Int),
                _ => None,
            },
            FieldKind::Decimal { scale, precise } => match value {
                Value::Number(n) => n.as_f64().map(FieldValue::Float),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .or_else(|| match scale {
                        Some(scale) if *precise => decode_precise_decimal(s, *scale),
                        _ => None,
                    })
                    .map(FieldValue::Float),
                _ => None,
            },
            FieldKind::Boolean => match value {
                Value::Bool(b) => Some(FieldValue::Bool(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(FieldValue::Bool(false)),
                    Some(1) => Some(FieldValue::Bool(true)),
                    _ => None,
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Some(FieldValue::Bool(true)),
                    "false" | "f" | "0" => Some(FieldValue::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            FieldKind::TextList { separator } => match value {
                Value::String(s) => Some(FieldValue::List(split_list(s, separator))),
                Value::Array(items) => Some(FieldValue::List(
                    items
                        .iter()
                        .filter_map(|item| match item {
                            Value::String(s) => Some(s.clone()),
                            Value::Null => None,
                            other => Some(other.to_string()),
                        })
                        .collect(),
                )),
                _ => None,
            },
            FieldKind::Timestamp => match value {
                Value::Number(n) => n.as_i64().map(FieldValue::Int),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        chrono::DateTime::parse_from_rfc3339(s.trim())
                            .ok()
                            .map(|dt| dt.timestamp_millis())
                    })
                    .map(FieldValue::Int),
                _ => None,
            },
            FieldKind::Json => Some(FieldValue::Json(value.clone())),
        }
    }
}

/// Split a delimited string. The empty string is the empty list.
fn split_list(s: &str, separator: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    if separator.is_empty() {
        return vec![s.to_string()];
    }
    s.split(separator).map(str::to_string).collect()
}

/// Decode a base64 big-endian two's-complement unscaled integer.
fn decode_precise_decimal(encoded: &str, scale: u32) -> Option<f64> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    if bytes.is_empty() || bytes.len() > 16 {
        return None;
    }

    let negative = bytes[0] & 0x80 != 0;
    let mut buf = if negative { [0xFFu8; 16] } else { [0u8; 16] };
    buf[16 - bytes.len()..].copy_from_slice(&bytes);
    let unscaled = i128::from_be_bytes(buf);

    let divisor = 10f64.powi(i32::try_from(scale).ok()?);
    Some(unscaled as f64 / divisor)
}

/// Extraction rule for one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Target field name
    pub name: String,
    /// Source column name (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Overrides the kind's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
}

impl FieldRule {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            source: None,
            kind,
            default: None,
        }
    }

    /// Read from a differently named source column.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_default(mut self, default: FieldValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn source_column(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    /// Extract the field from a row image. The flag is true when the
    /// default was substituted.
    pub fn extract(
        &self,
        image: &serde_json::Map<String, serde_json::Value>,
    ) -> (FieldValue, bool) {
        match image
            .get(self.source_column())
            .and_then(|v| self.kind.coerce(v))
        {
            Some(value) => (value, false),
            None => (
                self.default
                    .clone()
                    .unwrap_or_else(|| self.kind.default_value()),
                true,
            ),
        }
    }
}

/// Per-entity extraction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Entity / source table name
    pub entity: String,
    /// Mandatory key column
    pub key_field: String,
    /// Target fields
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    /// Keep columns not named by any rule as raw JSON
    #[serde(default)]
    pub passthrough_unknown: bool,
}

impl EntitySchema {
    pub fn new(entity: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key_field: key_field.into(),
            fields: Vec::new(),
            passthrough_unknown: false,
        }
    }

    /// Add a field rule.
    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    pub fn passthrough_unknown(mut self, enabled: bool) -> Self {
        self.passthrough_unknown = enabled;
        self
    }

    /// Validate the schema.
    pub fn validate(&self) -> Result<()> {
        if self.entity.trim().is_empty() {
            return Err(MaterializeError::config("entity name must not be empty"));
        }
        if self.key_field.trim().is_empty() {
            return Err(MaterializeError::config(format!(
                "entity '{}' must declare a key_field",
                self.entity
            )));
        }

        let mut seen = HashSet::new();
        for rule in &self.fields {
            if !seen.insert(rule.name.as_str()) {
                return Err(MaterializeError::config(format!(
                    "entity '{}' declares field '{}' twice",
                    self.entity, rule.name
                )));
            }
        }
        Ok(())
    }

    /// Extract the key value. Absent, null and blank keys yield `None`.
    pub fn extract_key(
        &self,
        image: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<String> {
        match image.get(&self.key_field)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Extract all declared fields. Returns the fields and the names of those
    /// that fell back to their default.
    pub fn extract_fields<'a>(
        &'a self,
        image: &serde_json::Map<String, serde_json::Value>,
    ) -> (Fields, Vec<&'a str>) {
        let mut fields = Fields::new();
        let mut defaulted = Vec::new();

        for rule in &self.fields {
            let (value, was_defaulted) = rule.extract(image);
            if was_defaulted {
                defaulted.push(rule.name.as_str());
            }
            fields.insert(rule.name.clone(), value);
        }

        if self.passthrough_unknown {
            let claimed: HashSet<&str> = self.fields.iter().map(|r| r.source_column()).collect();
            for (column, value) in image {
                if column != &self.key_field
                    && !claimed.contains(column.as_str())
                    && !fields.contains_key(column)
                {
                    fields.insert(column.clone(), FieldValue::Json(value.clone()));
                }
            }
        }

        (fields, defaulted)
    }
}
