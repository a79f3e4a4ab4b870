//! Configuration parsing and validation.
//!
//! Handles loading configuration from YAML files with environment-variable
//! interpolation, and defines the per-type partitioning specs that are
//! immutable for the process lifetime.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, DuplicateTypeSnafu, EnvInterpolationSnafu, NoTypesSnafu, ReadFileSnafu,
    UnknownTypeSnafu, YamlParseSnafu, ZeroRetentionSnafu,
};
use crate::time::Granularity;
use crate::warehouse::Dialect;

/// Main configuration structure for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
    /// Configured data types, in processing order.
    pub types: Vec<TypeConfig>,
    /// Retry policy for top-level load attempts (optional).
    #[serde(default)]
    pub retry: RetryConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Warehouse connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// SQL dialect family of the target warehouse.
    #[serde(default)]
    pub dialect: Dialect,
    /// libpq-style connection string, e.g.
    /// `"host=localhost dbname=warehouse user=loader"`.
    pub connection: String,
}

/// Object-store layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root URL under which data files live, e.g. `"s3://bucket/events"`.
    /// Data keys follow `<root>/<type>/d=<yyyy-MM-dd>/h=<HH>/<name>.<ext>`.
    pub url: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub options: std::collections::HashMap<String, String>,

    /// Directory under the root holding `*.ddl` migration files.
    #[serde(default = "default_ddl_dir")]
    pub ddl_dir: String,

    /// Directory under the root where column-mapping artifacts are written.
    #[serde(default = "default_mappings_dir")]
    pub mappings_dir: String,

    /// Directory under the root where transient bulk-copy manifests are written.
    #[serde(default = "default_manifests_dir")]
    pub manifests_dir: String,
}

fn default_ddl_dir() -> String {
    "ddl".to_string()
}

fn default_mappings_dir() -> String {
    "jsonpaths".to_string()
}

fn default_manifests_dir() -> String {
    "manifests".to_string()
}

/// Configuration for one mirrored data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    /// Type name; also the object-store directory, the canonical table name,
    /// and (for partitioned types) the union view name.
    pub name: String,

    /// Time-bucket partitioning; absent means a single unpartitioned table.
    #[serde(default)]
    pub partitioning: Option<PartitioningConfig>,

    /// Whether each file is a full snapshot of its bucket rather than an
    /// increment. Snapshot types import only the most recent new file.
    #[serde(default)]
    pub snapshot_mode: bool,

    /// Timestamp column used for range deletes; a type without one is
    /// deleted wholesale.
    #[serde(default)]
    pub timestamp_column: Option<String>,
}

impl TypeConfig {
    /// Whether this type is spread over bucket tables behind a union view.
    pub fn is_partitioned(&self) -> bool {
        self.partitioning.is_some()
    }
}

/// Partitioning spec for one type; immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitioningConfig {
    /// Bucket granularity (hourly, daily, weekly, monthly, yearly).
    pub granularity: Granularity,
    /// Number of most-recent buckets to retain.
    pub retained_buckets: usize,
}

/// Retry policy for top-level load attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts before giving up (default: 30).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed backoff between attempts in seconds (default: 60).
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Send an alert every Nth consecutive failure (default: 5).
    #[serde(default = "default_escalate_every")]
    pub escalate_every: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            escalate_every: default_escalate_every(),
        }
    }
}

impl RetryConfig {
    /// Backoff between attempts as a [`Duration`].
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

fn default_max_attempts() -> u32 {
    30
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_escalate_every() -> u32 {
    5
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment
    /// variables first.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = vars::interpolate(raw);
        ensure!(
            interpolated.is_ok(),
            EnvInterpolationSnafu {
                message: interpolated.errors.join("\n"),
            }
        );

        let config: Config =
            serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.types.is_empty(), NoTypesSnafu);

        let mut seen = HashSet::new();
        for type_config in &self.types {
            ensure!(
                seen.insert(type_config.name.as_str()),
                DuplicateTypeSnafu {
                    name: type_config.name.clone(),
                }
            );
            if let Some(partitioning) = &type_config.partitioning {
                ensure!(
                    partitioning.retained_buckets > 0,
                    ZeroRetentionSnafu {
                        name: type_config.name.clone(),
                    }
                );
            }
        }
        Ok(())
    }

    /// Look up a configured type by name.
    pub fn type_named(&self, name: &str) -> Result<&TypeConfig, ConfigError> {
        self.types
            .iter()
            .find(|t| t.name == name)
            .context(UnknownTypeSnafu { name })
    }
}
