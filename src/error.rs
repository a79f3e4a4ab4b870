//! Error types for snowdrift using snafu.
//!
//! One error enum per subsystem, aggregated by [`SyncError`] at the top
//! level. The retry loop uses [`SyncError::is_fatal`] to separate
//! configuration errors (fail immediately) from transient ones (retry).

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during object-store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// No data types configured.
    #[snafu(display("At least one data type must be configured"))]
    NoTypes,

    /// The same type is configured twice.
    #[snafu(display("Type '{name}' is configured more than once"))]
    DuplicateType { name: String },

    /// A partitioned type has a retention window of zero buckets.
    #[snafu(display("Type '{name}' must retain at least one partition bucket"))]
    ZeroRetention { name: String },

    /// A type was requested that is not in the configuration.
    #[snafu(display("Unknown type: '{name}'"))]
    UnknownType { name: String },

    /// Failed to parse a `yyyy-MM-dd:HH` time argument.
    #[snafu(display("Invalid time '{input}': expected yyyy-MM-dd:HH"))]
    TimeParse { input: String },
}

// ============ Catalog Errors ============

/// Errors that can occur while listing and parsing data files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// An object key does not follow the `<type>/d=.../h=.../<name>.<ext>` convention.
    #[snafu(display("Malformed object key '{key}': {reason}"))]
    MalformedKey { key: String, reason: String },

    /// Listing the object store failed.
    #[snafu(display("File listing failed"))]
    CatalogStorage { source: StorageError },
}

// ============ Warehouse Errors ============

/// Errors raised by the warehouse client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// Failed to connect to the warehouse.
    #[snafu(display("Warehouse connection failed"))]
    Connect { source: tokio_postgres::Error },

    /// A SQL statement failed.
    #[snafu(display("SQL execution failed: {sql}"))]
    Execute {
        sql: String,
        source: tokio_postgres::Error,
    },

    /// A metadata query returned a row that could not be decoded.
    #[snafu(display("Could not decode metadata row from '{query}'"))]
    RowDecode { query: String },

    /// The connection task exited while statements were outstanding.
    #[snafu(display("Warehouse connection lost"))]
    ConnectionLost,
}

// ============ Ledger Errors ============

/// Errors raised by the import and DDL ledgers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// A ledger query or write failed.
    #[snafu(display("Ledger operation failed"))]
    LedgerWarehouse { source: WarehouseError },
}

impl LedgerError {
    /// Unwrap the underlying warehouse error.
    pub fn into_warehouse(self) -> WarehouseError {
        match self {
            LedgerError::LedgerWarehouse { source } => source,
        }
    }
}

// ============ Partition Errors ============

/// Errors raised by the partition manager.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PartitionError {
    /// The requested range needs buckets that retention would immediately evict.
    ///
    /// This is a configuration error: either widen `retained_buckets` or
    /// narrow the requested range. Nothing has been created or dropped.
    #[snafu(display(
        "Retention window too small for requested range on type '{type_name}': \
         buckets {buckets:?} would be created and immediately evicted"
    ))]
    RetentionWindowTooSmall {
        type_name: String,
        buckets: Vec<String>,
    },

    /// A structural operation against the warehouse failed.
    #[snafu(display("Partition maintenance failed"))]
    PartitionWarehouse { source: WarehouseError },
}

// ============ Schema Errors ============

/// Errors raised by the schema syncer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Listing or reading DDL files failed.
    #[snafu(display("DDL file access failed"))]
    SchemaStorage { source: StorageError },

    /// A DDL file is not valid UTF-8.
    #[snafu(display("DDL file '{file}' is not valid UTF-8"))]
    DdlNotUtf8 { file: String },

    /// Applying a DDL statement failed; the whole file was rolled back.
    #[snafu(display("DDL file '{file}' failed and was rolled back"))]
    DdlApply {
        file: String,
        source: WarehouseError,
    },

    /// Recording the DDL ledger entry failed.
    #[snafu(display("DDL ledger update failed"))]
    DdlLedger { source: WarehouseError },

    /// Rebuilding a union view after DDL replication failed.
    #[snafu(display("View rebuild for '{type_name}' failed"))]
    ViewRebuild {
        type_name: String,
        source: PartitionError,
    },

    /// Discovering a partitioned type's bucket tables failed.
    #[snafu(display("Bucket discovery for '{type_name}' failed"))]
    ReplicaDiscovery {
        type_name: String,
        source: PartitionError,
    },

    /// Writing a column-mapping artifact failed.
    #[snafu(display("Column mapping regeneration for '{table}' failed"))]
    MappingWrite { table: String, source: StorageError },

    /// Reading destination columns for a mapping failed.
    #[snafu(display("Could not describe table '{table}' for column mapping"))]
    MappingDescribe {
        table: String,
        source: WarehouseError,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Sync Error (top-level) ============

/// Top-level errors that aggregate all subsystem error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    SyncStorage { source: StorageError },

    /// Catalog error.
    #[snafu(display("Catalog error"))]
    Catalog { source: CatalogError },

    /// Warehouse error.
    #[snafu(display("Warehouse error"))]
    Warehouse { source: WarehouseError },

    /// Ledger error.
    #[snafu(display("Ledger error"))]
    Ledger { source: LedgerError },

    /// Partition error.
    #[snafu(display("Partition error"))]
    Partition { source: PartitionError },

    /// Schema sync error.
    #[snafu(display("Schema sync error"))]
    Schema { source: SchemaError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address"))]
    AddressParse { source: std::net::AddrParseError },

    /// All retry attempts were exhausted.
    #[snafu(display("Giving up after {attempts} failed attempts"))]
    RetriesExhausted {
        attempts: u32,
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Whether this error is a configuration error that retrying cannot fix.
    ///
    /// Fatal errors abort the retry loop immediately; everything else is
    /// treated as transient and retried up to the policy's attempt budget.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Config { .. } => true,
            SyncError::Partition { source } => {
                matches!(source, PartitionError::RetentionWindowTooSmall { .. })
            }
            SyncError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}
