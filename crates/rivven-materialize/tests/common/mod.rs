//! Shared helpers for materialization integration tests

#![allow(dead_code)]

use rivven_materialize::{
    EntitySchema, EventDecoder, FieldKind, FieldRule, Ingestor, MemoryVersionStore,
    RawChangeEvent,
};
use serde_json::json;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_materialize=debug".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

/// Schema for the `titles` entity used across tests.
pub fn titles_schema() -> EntitySchema {
    EntitySchema::new("titles", "id")
        .field(FieldRule::new("rating", FieldKind::decimal(1)))
        .field(FieldRule::new("votes", FieldKind::Integer))
        .field(FieldRule::new("genres", FieldKind::text_list(",")))
        .field(FieldRule::new("title", FieldKind::Text))
}

pub fn ingestor() -> Arc<Ingestor<MemoryVersionStore>> {
    Arc::new(Ingestor::new(
        EventDecoder::new([titles_schema()]),
        Arc::new(MemoryVersionStore::new()),
    ))
}

/// `n` snapshot records with distinct keys.
pub fn title_records(n: usize) -> Vec<RawChangeEvent> {
    (0..n)
        .map(|i| {
            RawChangeEvent::snapshot(
                "titles",
                json!({"id": format!("tt{:05}", i), "rating": (i % 100) as f64 / 10.0}),
                1_000 + i as i64,
            )
        })
        .collect()
}
