//! Change event representation
//!
//! Two shapes live here:
//!
//! - [`RawChangeEvent`]: the wire shape delivered by the transport. Loosely
//!   typed, accepts Debezium-style envelopes (`op`, `before`, `after`,
//!   `source.ts_ms`).
//! - [`ChangeEvent`]: the normalized event produced by the decoder, with a
//!   mandatory key, a resolved operation and schema-typed images.
//!
//! ```ignore
//! let raw = RawChangeEvent::from_json(br#"{"op":"c","table":"titles","ts_ms":100,"after":{"id":"k1"}}"#)?;
//! let event = decoder.decode(raw)?;
//! assert_eq!(event.op, ChangeOp::Create);
//! ```

use crate::error::DecodeError;
use crate::schema::Fields;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a materialized row: the entity (source table) plus the
/// row's key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Entity / source table name
    pub entity: String,
    /// Stringified key field value
    pub id: String,
}

impl RecordKey {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.id)
    }
}

/// Which row image an operation reads its fields from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSide {
    Before,
    After,
}

impl ImageSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSide::Before => "before",
            ImageSide::After => "after",
        }
    }
}

/// Change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row inserted
    Create,
    /// Row updated
    Update,
    /// Snapshot read (initial sync)
    Snapshot,
    /// Row deleted
    Delete,
}

impl ChangeOp {
    /// Parse a wire operation code.
    ///
    /// Accepts Debezium short codes (`c`, `u`, `r`, `d`) and the long names,
    /// case-insensitively.
    pub fn parse(code: &str) -> std::result::Result<Self, DecodeError> {
        match code.trim().to_ascii_lowercase().as_str() {
            "c" | "create" | "insert" => Ok(ChangeOp::Create),
            "u" | "update" => Ok(ChangeOp::Update),
            "r" | "snapshot" | "read" => Ok(ChangeOp::Snapshot),
            "d" | "delete" => Ok(ChangeOp::Delete),
            _ => Err(DecodeError::UnknownOperation(code.to_string())),
        }
    }

    /// Debezium short code.
    pub fn as_code(&self) -> &'static str {
        match self {
            ChangeOp::Create => "c",
            ChangeOp::Update => "u",
            ChangeOp::Snapshot => "r",
            ChangeOp::Delete => "d",
        }
    }

    /// The image field extraction reads from: deletes carry only the
    /// before image, everything else the after image.
    pub fn image_side(&self) -> ImageSide {
        match self {
            ChangeOp::Delete => ImageSide::Before,
            _ => ImageSide::After,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeOp::Delete)
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Create => write!(f, "CREATE"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Snapshot => write!(f, "SNAPSHOT"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// Source block of a Debezium envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSource {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
    /// Log position of the change (Postgres LSN)
    #[serde(default)]
    pub lsn: Option<u64>,
}

/// Change event as delivered by the transport, one per source row mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    /// Entity name; Debezium puts it in `source.table`
    #[serde(default, alias = "table", skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Operation code
    #[serde(default)]
    pub op: String,
    /// Row state before the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    /// Row state after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    /// Event timestamp (Unix epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RawSource>,
    /// Ingestion sequence, when the transport assigns one
    #[serde(default, alias = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl RawChangeEvent {
    fn new(
        entity: impl Into<String>,
        op: ChangeOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        ts_ms: i64,
    ) -> Self {
        Self {
            entity: Some(entity.into()),
            op: op.as_code().to_string(),
            before,
            after,
            ts_ms: Some(ts_ms),
            source: None,
            sequence: None,
        }
    }

    /// Create a new CREATE event
    pub fn create(entity: impl Into<String>, after: serde_json::Value, ts_ms: i64) -> Self {
        Self::new(entity, ChangeOp::Create, None, Some(after), ts_ms)
    }

    /// Create a new UPDATE event
    pub fn update(entity: impl Into<String>, after: serde_json::Value, ts_ms: i64) -> Self {
        Self::new(entity, ChangeOp::Update, None, Some(after), ts_ms)
    }

    /// Create a new SNAPSHOT read event
    pub fn snapshot(entity: impl Into<String>, after: serde_json::Value, ts_ms: i64) -> Self {
        Self::new(entity, ChangeOp::Snapshot, None, Some(after), ts_ms)
    }

    /// Create a new DELETE event
    pub fn delete(entity: impl Into<String>, before: serde_json::Value, ts_ms: i64) -> Self {
        Self::new(entity, ChangeOp::Delete, Some(before), None, ts_ms)
    }

    /// Attach an explicit sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Parse a JSON-encoded event.
    ///
    /// Events wrapped in a `{"schema": .., "payload": {..}}` envelope are
    /// unwrapped first.
    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build from an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> std::result::Result<Self, DecodeError> {
        let value = match value {
            serde_json::Value::Object(mut map)
                if !map.contains_key("op")
                    && map.get("payload").is_some_and(|p| p.is_object()) =>
            {
                map.remove("payload").unwrap_or_default()
            }
            other => other,
        };

        if !value.is_object() {
            return Err(DecodeError::Malformed("event is not a JSON object".into()));
        }

        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Entity name from the event or its source block.
    pub fn entity_name(&self) -> Option<&str> {
        self.entity
            .as_deref()
            .or_else(|| self.source.as_ref().and_then(|s| s.table.as_deref()))
            .filter(|name| !name.is_empty())
    }

    /// Ordering position carried on the wire: the transport's sequence, else
    /// the source log position.
    pub fn wire_sequence(&self) -> Option<u64> {
        self.sequence
            .or_else(|| self.source.as_ref().and_then(|s| s.lsn))
    }

    /// Source commit timestamp, preferring `source.ts_ms` over the envelope's
    /// processing timestamp.
    pub fn source_ts_ms(&self) -> Option<i64> {
        self.source.as_ref().and_then(|s| s.ts_ms).or(self.ts_ms)
    }
}

/// Normalized change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity key (mandatory)
    pub key: RecordKey,
    /// Operation type
    pub op: ChangeOp,
    /// Previous row state, populated for deletes
    pub before: Option<Fields>,
    /// Current row state, populated for create/update/snapshot
    pub after: Option<Fields>,
    /// Source timestamp (Unix epoch millis)
    pub source_ts_ms: i64,
    /// Strictly increasing ingestion sequence
    pub sequence: u64,
}

impl ChangeEvent {
    /// The image this event's operation reads from.
    pub fn image(&self) -> Option<&Fields> {
        match self.op.image_side() {
            ImageSide::Before => self.before.as_ref(),
            ImageSide::After => self.after.as_ref(),
        }
    }

    /// Check if this event marks its key deleted.
    pub fn is_delete(&self) -> bool {
        self.op.is_delete()
    }
}
