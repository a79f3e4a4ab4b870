//! Online schema migration.
//!
//! DDL is authored externally as `*.ddl` files in the object store; this
//! module only applies and replicates it. Each file is applied in one
//! transaction, statement by statement. `ALTER TABLE` statements targeting a
//! partitioned type are replayed against the canonical table and every
//! existing bucket table, and the type's union view is rebuilt afterward.
//! Column-mapping artifacts are regenerated for every known table whenever
//! any DDL applies (or when forced) since regeneration is idempotent and
//! cheap relative to DDL.

mod mapping;

pub use mapping::ColumnMapping;

use bytes::Bytes;
use regex::Regex;
use snafu::prelude::*;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::config::TypeConfig;
use crate::emit;
use crate::error::{
    DdlApplySnafu, DdlNotUtf8Snafu, MappingDescribeSnafu, MappingWriteSnafu,
    ReplicaDiscoverySnafu, SchemaError, SchemaStorageSnafu, ViewRebuildSnafu,
};
use crate::ledger::DdlLedger;
use crate::metrics::events::DdlFilesApplied;
use crate::partition::PartitionManager;
use crate::storage::StorageProviderRef;
use crate::warehouse::Warehouse;

/// One parsed DDL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    /// `ALTER TABLE <table> <rest>`, candidate for partition replication.
    AlterTable { table: String, rest: String },
    /// Anything else, executed verbatim.
    Other(String),
}

fn alter_table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?is)^\s*ALTER\s+TABLE\s+[`"]?([A-Za-z_][A-Za-z0-9_]*)[`"]?\s+(.+)$"#)
            .expect("valid regex")
    })
}

/// Strip `//`-prefixed line comments and split the text on `;`.
fn parse_statements(ddl_text: &str) -> Vec<Statement> {
    let stripped: String = ddl_text
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");

    stripped
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(|stmt| match alter_table_pattern().captures(stmt) {
            Some(caps) => Statement::AlterTable {
                table: caps[1].to_string(),
                rest: caps[2].trim().to_string(),
            },
            None => Statement::Other(stmt.to_string()),
        })
        .collect()
}

/// Detects and applies new DDL files, replicating structural changes across
/// every bucket table of a partitioned type.
pub struct SchemaSyncer {
    storage: StorageProviderRef,
    warehouse: Arc<dyn Warehouse>,
    ddl_ledger: DdlLedger,
    partitions: Arc<PartitionManager>,
    types: Vec<TypeConfig>,
    ddl_dir: String,
    mappings_dir: String,
}

impl SchemaSyncer {
    pub fn new(
        storage: StorageProviderRef,
        warehouse: Arc<dyn Warehouse>,
        partitions: Arc<PartitionManager>,
        types: Vec<TypeConfig>,
        ddl_dir: String,
        mappings_dir: String,
    ) -> Self {
        let ddl_ledger = DdlLedger::new(warehouse.clone());
        Self {
            storage,
            warehouse,
            ddl_ledger,
            partitions,
            types,
            ddl_dir,
            mappings_dir,
        }
    }

    /// Apply any not-yet-applied DDL files and republish column mappings.
    ///
    /// Returns `true` if any DDL was applied. With
    /// `force_regenerate_mappings`, mappings are republished even when no
    /// DDL is pending.
    pub async fn sync(&self, force_regenerate_mappings: bool) -> Result<bool, SchemaError> {
        let listed = self
            .storage
            .list_prefix(&self.ddl_dir)
            .await
            .context(SchemaStorageSnafu)?;
        let applied = self
            .ddl_ledger
            .applied_files()
            .await
            .map_err(|e| SchemaError::DdlLedger {
                source: e.into_warehouse(),
            })?;

        let to_apply: Vec<String> = listed
            .into_iter()
            .map(|object| object.key)
            .filter(|key| key.ends_with(".ddl") && !applied.contains(key))
            .collect();

        if to_apply.is_empty() && !force_regenerate_mappings {
            debug!("No new DDL files");
            return Ok(false);
        }

        let mut altered_types: Vec<String> = Vec::new();
        for file in &to_apply {
            self.apply_file(file, &mut altered_types).await?;
        }
        if !to_apply.is_empty() {
            emit!(DdlFilesApplied {
                count: to_apply.len() as u64,
            });
        }

        for type_name in &altered_types {
            let type_config = self
                .types
                .iter()
                .find(|t| &t.name == type_name)
                .expect("altered types come from the configured set");
            self.partitions
                .recreate_view(type_config)
                .await
                .context(ViewRebuildSnafu { type_name })?;
        }

        self.regenerate_mappings().await?;

        Ok(!to_apply.is_empty())
    }

    /// Apply one DDL file inside a single transaction and record it in the
    /// DDL ledger. A statement failure rolls back the whole file so the next
    /// sync reprocesses it from scratch.
    async fn apply_file(
        &self,
        file: &str,
        altered_types: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        let raw = self
            .storage
            .get(file)
            .await
            .context(SchemaStorageSnafu)?;
        let ddl_text = std::str::from_utf8(&raw)
            .ok()
            .context(DdlNotUtf8Snafu { file })?
            .to_string();

        let statements = parse_statements(&ddl_text);
        info!("Applying DDL file '{}' ({} statements)", file, statements.len());

        self.warehouse.begin().await.context(DdlApplySnafu { file })?;
        let result = self
            .apply_statements(file, &statements, altered_types)
            .await;
        match result {
            Ok(()) => {
                self.ddl_ledger
                    .record(file, &ddl_text)
                    .await
                    .map_err(|e| SchemaError::DdlLedger {
                        source: e.into_warehouse(),
                    })?;
                self.warehouse
                    .commit()
                    .await
                    .context(DdlApplySnafu { file })?;
                Ok(())
            }
            Err(error) => {
                // Best effort; the warehouse also rolls back on disconnect.
                let _ = self.warehouse.rollback().await;
                Err(error)
            }
        }
    }

    async fn apply_statements(
        &self,
        file: &str,
        statements: &[Statement],
        altered_types: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        let dialect = self.warehouse.dialect();
        for statement in statements {
            match statement {
                Statement::AlterTable { table, rest }
                    if self.partitioned_type(table).is_some() =>
                {
                    let type_config = self.partitioned_type(table).expect("checked above");
                    let partitioning =
                        type_config.partitioning.as_ref().expect("partitioned type");

                    // Canonical table first, then every bucket replica.
                    let canonical = PartitionManager::canonical_table(type_config);
                    let sql =
                        format!("ALTER TABLE {} {}", dialect.quote_ident(&canonical), rest);
                    self.warehouse
                        .execute(&sql)
                        .await
                        .context(DdlApplySnafu { file })?;

                    let buckets = self
                        .partitions
                        .existing_buckets(table, partitioning.granularity)
                        .await
                        .context(ReplicaDiscoverySnafu { type_name: table })?;
                    for key in &buckets {
                        let bucket_table = PartitionManager::bucket_table(table, key);
                        let sql = format!(
                            "ALTER TABLE {} {}",
                            dialect.quote_ident(&bucket_table),
                            rest
                        );
                        self.warehouse
                            .execute(&sql)
                            .await
                            .context(DdlApplySnafu { file })?;
                    }

                    if !altered_types.contains(table) {
                        altered_types.push(table.clone());
                    }
                }
                Statement::AlterTable { table, rest } => {
                    let sql = format!("ALTER TABLE {} {}", dialect.quote_ident(table), rest);
                    self.warehouse
                        .execute(&sql)
                        .await
                        .context(DdlApplySnafu { file })?;
                }
                Statement::Other(sql) => {
                    self.warehouse
                        .execute(sql)
                        .await
                        .context(DdlApplySnafu { file })?;
                }
            }
        }
        Ok(())
    }

    fn partitioned_type(&self, name: &str) -> Option<&TypeConfig> {
        self.types
            .iter()
            .find(|t| t.name == name && t.is_partitioned())
    }

    /// Republish the column-mapping artifact for every configured type.
    ///
    /// Column order comes from the type's canonical table; bucket tables are
    /// structural clones, so one artifact per type serves them all.
    async fn regenerate_mappings(&self) -> Result<(), SchemaError> {
        for type_config in &self.types {
            let table = PartitionManager::canonical_table(type_config);
            let columns = self
                .warehouse
                .describe_table(&table)
                .await
                .context(MappingDescribeSnafu { table: &table })?;
            if columns.is_empty() {
                debug!("Skipping mapping for '{}': table not found", table);
                continue;
            }

            let mapping = ColumnMapping::from_columns(&columns);
            let body = serde_json::to_vec(&mapping).expect("mapping serializes");
            let path = ColumnMapping::artifact_path(&self.mappings_dir, &type_config.name);
            self.storage
                .put(&path, Bytes::from(body))
                .await
                .context(MappingWriteSnafu { table: &type_config.name })?;
        }
        Ok(())
    }
}
