//! Configuration for rivven-materialize
//!
//! One YAML document configures the whole engine. `${VAR}` and
//! `${VAR:-default}` references are expanded from the environment before
//! parsing. Durations are given in milliseconds.
//!
//! ```yaml
//! entities:
//!   - entity: titles
//!     key_field: tconst
//!     fields:
//!       - name: rating
//!         type: decimal
//!         scale: 1
//! compaction:
//!   superseded_retention_ms: 3600000
//! bulk_load:
//!   chunk_size: ${CHUNK_SIZE:-5000}
//!   lag_threshold: 1000
//!   timeout_policy: warn_and_proceed
//! retention:
//!   streams:
//!     titles:
//!       retention_ms: 86400000
//! ```

use crate::backpressure::{BulkLoadConfig, DrainTimeoutPolicy};
use crate::compaction::CompactionConfig;
use crate::decoder::EventDecoder;
use crate::error::{MaterializeError, Result};
use crate::ingest::IngestConfig;
use crate::retention::{RetentionManager, RetentionPolicy};
use crate::schema::EntitySchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MaterializeConfig {
    /// Per-entity field schemas
    #[serde(default)]
    pub entities: Vec<EntitySchema>,

    #[serde(default)]
    pub compaction: CompactionSettings,

    #[serde(default)]
    pub bulk_load: BulkLoadSettings,

    #[serde(default)]
    pub ingest: IngestSettings,

    #[serde(default)]
    pub retention: RetentionSettings,
}

/// Compaction settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionSettings {
    #[serde(default = "default_superseded_retention_ms")]
    pub superseded_retention_ms: u64,
    #[serde(default = "default_compaction_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_min_versions")]
    pub min_versions: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            superseded_retention_ms: default_superseded_retention_ms(),
            interval_ms: default_compaction_interval_ms(),
            min_versions: default_min_versions(),
        }
    }
}

fn default_superseded_retention_ms() -> u64 {
    86_400_000
}

fn default_compaction_interval_ms() -> u64 {
    300_000
}

fn default_min_versions() -> usize {
    1
}

/// Bulk-load settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkLoadSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_lag_threshold")]
    pub lag_threshold: u64,
    #[serde(default = "default_max_wait_per_chunk_ms")]
    pub max_wait_per_chunk_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub timeout_policy: DrainTimeoutPolicy,
    #[serde(default = "default_true")]
    pub drain_after_final_chunk: bool,
}

impl Default for BulkLoadSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            lag_threshold: default_lag_threshold(),
            max_wait_per_chunk_ms: default_max_wait_per_chunk_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_policy: DrainTimeoutPolicy::default(),
            drain_after_final_chunk: true,
        }
    }
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_lag_threshold() -> u64 {
    10_000
}

fn default_max_wait_per_chunk_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Partitioned ingestion settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestSettings {
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            channel_capacity: default_channel_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_partitions() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

/// Retention settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetentionSettings {
    /// Policy for streams not listed below
    #[serde(default)]
    pub default: RetentionPolicy,
    /// Per-stream policies
    #[serde(default)]
    pub streams: BTreeMap<String, RetentionPolicy>,
}

impl MaterializeConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut entities = HashSet::new();
        for schema in &self.entities {
            schema.validate()?;
            if !entities.insert(schema.entity.as_str()) {
                return Err(MaterializeError::config(format!(
                    "entity '{}' is configured twice",
                    schema.entity
                )));
            }
        }

        self.bulk_load_config().validate()?;

        if self.ingest.partitions == 0 {
            return Err(MaterializeError::config("ingest.partitions must be greater than 0"));
        }
        if self.ingest.channel_capacity == 0 {
            return Err(MaterializeError::config(
                "ingest.channel_capacity must be greater than 0",
            ));
        }
        if self.compaction.interval_ms == 0 {
            return Err(MaterializeError::config(
                "compaction.interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Decoder for the configured entities.
    pub fn decoder(&self) -> EventDecoder {
        EventDecoder::new(self.entities.iter().cloned())
    }

    pub fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig::builder()
            .superseded_retention(Duration::from_millis(self.compaction.superseded_retention_ms))
            .interval(Duration::from_millis(self.compaction.interval_ms))
            .min_versions(self.compaction.min_versions)
            .build()
    }

    pub fn bulk_load_config(&self) -> BulkLoadConfig {
        BulkLoadConfig::builder()
            .chunk_size(self.bulk_load.chunk_size)
            .lag_threshold(self.bulk_load.lag_threshold)
            .max_wait_per_chunk(Duration::from_millis(self.bulk_load.max_wait_per_chunk_ms))
            .poll_interval(Duration::from_millis(self.bulk_load.poll_interval_ms))
            .timeout_policy(self.bulk_load.timeout_policy)
            .drain_after_final_chunk(self.bulk_load.drain_after_final_chunk)
            .build()
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig::builder()
            .partitions(self.ingest.partitions)
            .channel_capacity(self.ingest.channel_capacity)
            .shutdown_timeout(Duration::from_millis(self.ingest.shutdown_timeout_ms))
            .build()
    }

    /// Retention manager seeded with the configured stream policies.
    pub fn retention_manager(&self) -> RetentionManager {
        let manager = RetentionManager::new(self.retention.default);
        for (stream, policy) in &self.retention.streams {
            manager.set_policy_at(stream, *policy, i64::MIN);
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    const CONFIG: &str = r#"
entities:
  - entity: titles
    key_field: tconst
    fields:
      - name: rating
        type: decimal
        scale: 1
      - name: genres
        type: text_list
compaction:
  superseded_retention_ms: 60000
bulk_load:
  chunk_size: ${RIVVEN_MATERIALIZE_TEST_CHUNK:-500}
  lag_threshold: 100
  timeout_policy: fail
retention:
  streams:
    titles:
      retention_ms: 3600000
      retention_bytes: 1048576
"#;

    #[test]
    fn test_parse_full_config() {
        let config = MaterializeConfig::from_yaml_str(CONFIG).unwrap();

        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities[0].fields[0].kind, FieldKind::decimal(1));

        let bulk = config.bulk_load_config();
        assert_eq!(bulk.chunk_size, 500);
        assert_eq!(bulk.lag_threshold, 100);
        assert_eq!(bulk.timeout_policy, DrainTimeoutPolicy::Fail);
        assert_eq!(bulk.poll_interval, Duration::from_secs(5));

        let compaction = config.compaction_config();
        assert_eq!(compaction.superseded_retention, Duration::from_secs(60));
        assert_eq!(compaction.interval, Duration::from_secs(300));

        assert_eq!(config.ingest_config().partitions, 4);
        assert!(config.decoder().schema("titles").is_some());
    }

    #[test]
    fn test_retention_manager_from_config() {
        let config = MaterializeConfig::from_yaml_str(CONFIG).unwrap();
        let manager = config.retention_manager();

        let policy = manager.policy("titles");
        assert_eq!(policy.retention(), Duration::from_secs(3600));
        assert_eq!(policy.retention_bytes, Some(1_048_576));
        // Applies to every segment, including old ones
        assert_eq!(manager.policy_for_segment("titles", 0).retention_ms, 3_600_000);
    }

    #[test]
    fn test_keep_forever_windows_from_yaml() {
        let config = MaterializeConfig::from_yaml_str(
            r#"
compaction:
  superseded_retention_ms: 18446744073709551615
retention:
  default:
    retention_ms: 18446744073709551615
"#,
        )
        .unwrap();

        let window = config.compaction_config().superseded_retention;
        assert_eq!(window, Duration::from_millis(u64::MAX));
        let versions = [1_000, 2_000].map(|ingest| crate::record::VersionedRecord {
            key: crate::event::RecordKey::new("titles", "k1"),
            payload: crate::schema::Fields::new(),
            operation: crate::event::ChangeOp::Update,
            event_ts_ms: ingest / 10,
            sequence: 1,
            is_deleted: false,
            ingest_ts_ms: ingest,
        });
        assert!(crate::compaction::expired_superseded(&versions, window, 2_001).is_empty());

        let manager = config.retention_manager();
        assert!(!manager.is_segment_expired("titles", 0, 0, i64::MAX - 1));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_MATERIALIZE_TEST_PARTITIONS", "7");
        let expanded = MaterializeConfig::expand_env_vars(
            "a: ${RIVVEN_MATERIALIZE_TEST_PARTITIONS}\nb: ${RIVVEN_MATERIALIZE_UNSET_VAR:-fallback}\nc: ${RIVVEN_MATERIALIZE_UNSET_VAR}",
        );
        assert_eq!(expanded, "a: 7\nb: fallback\nc: ");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MaterializeConfig::from_yaml_str("{}").unwrap();
        assert!(config.entities.is_empty());
        assert_eq!(config.bulk_load_config().chunk_size, 10_000);
        assert!(config.bulk_load_config().drain_after_final_chunk);
    }

    #[test]
    fn test_validation_errors() {
        let zero_chunk = "bulk_load:\n  chunk_size: 0\n";
        assert!(matches!(
            MaterializeConfig::from_yaml_str(zero_chunk),
            Err(MaterializeError::Config(_))
        ));

        let duplicate = r#"
entities:
  - entity: titles
    key_field: id
  - entity: titles
    key_field: id
"#;
        assert!(MaterializeConfig::from_yaml_str(duplicate).is_err());

        let no_key = "entities:\n  - entity: titles\n    key_field: \"\"\n";
        assert!(MaterializeConfig::from_yaml_str(no_key).is_err());

        assert!(matches!(
            MaterializeConfig::from_yaml_str("bulk_load: [1, 2"),
            Err(MaterializeError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_missing_file() {
        let err = MaterializeConfig::from_file("/nonexistent/materialize.yaml").unwrap_err();
        assert!(matches!(err, MaterializeError::Io(_)));
    }
}
