//! # Event Decoder
//!
//! Turns a [`RawChangeEvent`] into a normalized [`ChangeEvent`].
//!
//! Decoding order matters:
//!
//! 1. Resolve the operation code. It selects the image: deletes read the
//!    before image, all other operations the after image.
//! 2. Resolve the entity schema and the mandatory key from that image.
//! 3. Extract each schema field, failing soft to the field's default.
//!
//! Only envelope problems (unknown op, missing image, missing key, missing
//! timestamp) reject an event. A bad optional field never does.

use crate::error::DecodeError;
use crate::event::{ChangeEvent, ChangeOp, ImageSide, RawChangeEvent, RecordKey};
use crate::metrics::MaterializeMetrics;
use crate::schema::{EntitySchema, Fields};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Strictly increasing sequence numbers, independent of wall-clock time.
///
/// Gives events with identical source timestamps a total order. Numbers
/// reflect arrival at this decoder, so a redelivered event without a wire
/// sequence or source LSN is ordered after everything decoded before it and
/// can win a timestamp tie it lost the first time. Transports that redeliver
/// should send a sequence.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future allocations are strictly greater than `seen`.
    pub fn observe(&self, seen: u64) {
        self.next.fetch_max(seen.saturating_add(1), Ordering::SeqCst);
    }

    /// Peek at the next value without allocating it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Schema-driven change event decoder.
#[derive(Debug)]
pub struct EventDecoder {
    schemas: HashMap<String, EntitySchema>,
    sequence: SequenceGenerator,
    metrics: Option<Arc<MaterializeMetrics>>,
}

impl EventDecoder {
    /// Create a decoder for the given entity schemas.
    pub fn new(schemas: impl IntoIterator<Item = EntitySchema>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|s| (s.entity.clone(), s))
                .collect(),
            sequence: SequenceGenerator::new(),
            metrics: None,
        }
    }

    /// Record field defaults into the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<MaterializeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register or replace an entity schema.
    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.entity.clone(), schema);
    }

    pub fn schema(&self, entity: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn sequence(&self) -> &SequenceGenerator {
        &self.sequence
    }

    /// Decode a JSON-encoded event.
    pub fn decode_json(&self, bytes: &[u8]) -> Result<ChangeEvent, DecodeError> {
        self.decode(&RawChangeEvent::from_json(bytes)?)
    }

    /// Decode a raw change event.
    pub fn decode(&self, raw: &RawChangeEvent) -> Result<ChangeEvent, DecodeError> {
        let op = ChangeOp::parse(&raw.op)?;
        let side = op.image_side();

        let entity = raw
            .entity_name()
            .ok_or_else(|| DecodeError::Malformed("event names no entity".into()))?;
        let schema = self
            .schemas
            .get(entity)
            .ok_or_else(|| DecodeError::UnknownEntity(entity.to_string()))?;

        let image_value = match side {
            ImageSide::Before => raw.before.as_ref(),
            ImageSide::After => raw.after.as_ref(),
        };
        let image = image_value
            .and_then(|v| v.as_object())
            .ok_or_else(|| DecodeError::MissingImage {
                op: op.to_string(),
                image: side.as_str(),
            })?;

        let id = schema
            .extract_key(image)
            .ok_or_else(|| DecodeError::MissingKey {
                entity: entity.to_string(),
                field: schema.key_field.clone(),
            })?;

        let source_ts_ms = raw
            .source_ts_ms()
            .ok_or_else(|| DecodeError::Malformed("event carries no source timestamp".into()))?;

        let (fields, defaulted) = schema.extract_fields(image);
        if !defaulted.is_empty() {
            debug!(
                entity = %entity,
                key = %id,
                fields = ?defaulted,
                "Substituted defaults for absent or malformed fields"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_field_defaults(entity, defaulted.len() as u64);
            }
        }

        let sequence = match raw.wire_sequence() {
            Some(seq) => {
                self.sequence.observe(seq);
                seq
            }
            None => self.sequence.next(),
        };

        let (before, after): (Option<Fields>, Option<Fields>) = match side {
            ImageSide::Before => (Some(fields), None),
            ImageSide::After => (None, Some(fields)),
        };

        Ok(ChangeEvent {
            key: RecordKey::new(entity, id),
            op,
            before,
            after,
            source_ts_ms,
            sequence,
        })
    }
}
