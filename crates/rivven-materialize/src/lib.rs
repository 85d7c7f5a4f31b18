//! # rivven-materialize - CDC Materialization for Rivven
//!
//! Turns a stream of row-level change events into a versioned, queryable
//! current-state store with soft-delete semantics, plus a lag-aware bulk
//! loader for large initial loads.
//!
//! ## Architecture
//!
//! ```text
//!  raw change events                        bulk source
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────┐                      ┌─────────────────┐   LagMonitor
//! │ EventDecoder │◄──── Ingestor ◄──────│   BulkLoader    │◄── (transport)
//! │ (per-entity  │         │            │ chunk → drain   │
//! │   schemas)   │         ▼            └─────────────────┘
//! └──────────────┘  ┌──────────────────────────────────────┐
//!                   │            VersionStore              │
//!                   │  append-only versions, LWW at read   │
//!                   └──────────────────────────────────────┘
//!                      │                │              ▲
//!                      ▼                ▼              │
//!          ┌────────────────────┐ ┌───────────┐ ┌──────────────────┐
//!          │SoftDeleteProjector │ │ Compactor │◄│ RetentionManager │
//!          │ Current / Active   │ │(background│ └──────────────────┘
//!          └────────────────────┘ └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rivven_materialize::{
//!     EntitySchema, EventDecoder, FieldKind, FieldRule, Ingestor, MemoryVersionStore,
//!     RawChangeEvent, RecordKey, SoftDeleteProjector, VersionStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> rivven_materialize::Result<()> {
//! let decoder = EventDecoder::new([EntitySchema::new("titles", "id")
//!     .field(FieldRule::new("rating", FieldKind::decimal(1)))]);
//! let store = Arc::new(MemoryVersionStore::new());
//! let ingestor = Ingestor::new(decoder, store.clone());
//!
//! ingestor.ingest(&RawChangeEvent::create("titles", json!({"id": "k1", "rating": 8.5}), 100))?;
//! ingestor.ingest(&RawChangeEvent::delete("titles", json!({"id": "k1", "rating": 8.5}), 110))?;
//!
//! let key = RecordKey::new("titles", "k1");
//! assert!(store.current_of(&key)?.unwrap().is_deleted);
//! assert!(!SoftDeleteProjector::new(store).contains(&key)?);
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod compaction;
pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod projector;
pub mod record;
pub mod retention;
pub mod schema;
pub mod store;

// Core types
pub use error::{DecodeError, ErrorCategory, MaterializeError, Result};
pub use event::{ChangeEvent, ChangeOp, RawChangeEvent, RecordKey};
pub use record::{resolve_current, VersionOrder, VersionedRecord};
pub use schema::{EntitySchema, FieldKind, FieldRule, FieldValue, Fields};

// Components
pub use backpressure::{
    BulkLoadConfig, BulkLoader, ChunkReport, DrainOutcome, DrainTimeoutPolicy, LagMonitor,
    LoadReport, LoadState, SharedLagGauge,
};
pub use compaction::{CompactionConfig, CompactionPassResult, Compactor};
pub use config::MaterializeConfig;
pub use decoder::{EventDecoder, SequenceGenerator};
pub use ingest::{IngestConfig, IngestOutcome, IngestReport, Ingestor, PartitionedIngestor};
pub use metrics::{MaterializeMetrics, MaterializeMetricsSnapshot};
pub use projector::{SoftDeleteProjector, ViewKind, ViewScan};
pub use retention::{RetentionChange, RetentionManager, RetentionPolicy};
pub use store::{MemoryVersionStore, VersionStore};
