//! Load orchestration.
//!
//! Ties the catalog, ledger, partition manager, and schema syncer together:
//! every invocation runs schema sync, then partition maintenance, then ledger
//! retention cleanup, then the chunk x type load loop. Each chunk x type unit
//! runs in one warehouse transaction that covers the data write and its
//! ledger entries, so a crash anywhere leaves the ledger exactly describing
//! what committed and the next scan re-derives the remaining work.
//!
//! The orchestrator only ever issues DML; all structural changes go through
//! the partition manager and schema syncer in their own transactions.

mod retry;

pub use retry::retry_with_policy;

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::catalog::{DataFile, FileCatalog};
use crate::config::{Config, TypeConfig};
use crate::emit;
use crate::error::{
    CatalogSnafu, LedgerSnafu, PartitionSnafu, SchemaSnafu, SyncError, SyncStorageSnafu,
    WarehouseSnafu,
};
use crate::ledger::ImportLedger;
use crate::metrics::events::{ChunkCommitted, ChunkSkipped, FilesLoaded, LedgerEntriesDeleted};
use crate::notify::Notifier;
use crate::partition::{PartitionManager, parse_bucket_key};
use crate::schema::SchemaSyncer;
use crate::storage::StorageProviderRef;
use crate::time::{Chunking, TimeChunk};
use crate::warehouse::Warehouse;

/// Minimum spacing between ledger retention-cleanup passes, in hours.
const RETENTION_CLEANUP_HOURS: i64 = 24;

/// One chunk x type unit of work.
type UnitKey = (DateTime<Utc>, String);

/// Statistics about a load run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    pub files_loaded: usize,
    pub units_committed: usize,
    pub units_skipped: usize,
    pub ledger_entries_cleaned: u64,
}

/// Bulk-copy manifest: `{"entries":[{"url":...,"mandatory":true},...]}`.
#[derive(Debug, Serialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    url: String,
    mandatory: bool,
}

/// Orchestrates chunked, transactional, idempotent loads.
pub struct LoadOrchestrator {
    config: Arc<Config>,
    storage: StorageProviderRef,
    warehouse: Arc<dyn Warehouse>,
    catalog: FileCatalog,
    ledger: ImportLedger,
    partitions: Arc<PartitionManager>,
    schema: SchemaSyncer,
    notifier: Arc<dyn Notifier>,
    /// High-water mark of the last retention-cleanup pass; explicit state
    /// scoped to this orchestrator, not a global.
    last_retention_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl LoadOrchestrator {
    pub fn new(
        config: Arc<Config>,
        storage: StorageProviderRef,
        warehouse: Arc<dyn Warehouse>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let catalog = FileCatalog::new(storage.clone());
        let ledger = ImportLedger::new(warehouse.clone());
        let partitions = Arc::new(PartitionManager::new(warehouse.clone()));
        let schema = SchemaSyncer::new(
            storage.clone(),
            warehouse.clone(),
            partitions.clone(),
            config.types.clone(),
            config.storage.ddl_dir.clone(),
            config.storage.mappings_dir.clone(),
        );
        Self {
            config,
            storage,
            warehouse,
            catalog,
            ledger,
            partitions,
            schema,
            notifier,
            last_retention_cleanup: Mutex::new(None),
        }
    }

    /// Create the ledger tables in the warehouse.
    pub async fn init(&self) -> Result<(), SyncError> {
        let sql = crate::ledger::bootstrap_sql(self.warehouse.dialect());
        self.warehouse
            .batch_execute(&sql)
            .await
            .context(WarehouseSnafu)?;
        info!("Ledger tables ready");
        Ok(())
    }

    /// Rebuild the union view of every partitioned type.
    pub async fn recreate_views(&self) -> Result<(), SyncError> {
        for type_config in &self.config.types {
            self.partitions
                .recreate_view(type_config)
                .await
                .context(PartitionSnafu)?;
        }
        Ok(())
    }

    /// Load all new files with bucket hours in `[from, to]`, split into
    /// chunks at `chunking` granularity.
    ///
    /// With `replace`, each chunk's existing rows and ledger entries are
    /// deleted first (even when the chunk has no new files). Retries follow
    /// the configured policy; a unit that committed is skipped on
    /// re-attempts through the completed-units set, which lives for this
    /// invocation only and is cleared after a successful full pass.
    pub async fn load(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        chunking: Chunking,
        replace: bool,
    ) -> Result<LoadStats, SyncError> {
        let completed: Mutex<HashSet<UnitKey>> = Mutex::new(HashSet::new());
        let stats: Mutex<LoadStats> = Mutex::new(LoadStats::default());
        let (completed_ref, stats_ref) = (&completed, &stats);

        retry_with_policy(&self.config.retry, &*self.notifier, "load", move || {
            self.load_attempt(from, to, chunking, replace, completed_ref, stats_ref)
        })
        .await?;

        completed.lock().expect("completed set lock").clear();
        let stats = *stats.lock().expect("stats lock");
        info!(
            "Load complete: {} files in {} units ({} skipped on resume)",
            stats.files_loaded, stats.units_committed, stats.units_skipped
        );
        Ok(stats)
    }

    async fn load_attempt(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        chunking: Chunking,
        replace: bool,
        completed: &Mutex<HashSet<UnitKey>>,
        stats: &Mutex<LoadStats>,
    ) -> Result<(), SyncError> {
        self.schema.sync(false).await.context(SchemaSnafu)?;
        self.partitions
            .partition(&self.config.types, from, to)
            .await
            .context(PartitionSnafu)?;
        self.clean_ledger(stats).await?;

        for chunk in chunking.split(from, to) {
            for type_config in &self.config.types {
                let unit: UnitKey = (chunk.from, type_config.name.clone());
                if completed.lock().expect("completed set lock").contains(&unit) {
                    debug!(
                        "Skipping already-completed unit {}@{}",
                        type_config.name, chunk.from
                    );
                    emit!(ChunkSkipped);
                    stats.lock().expect("stats lock").units_skipped += 1;
                    continue;
                }

                let loaded = self.load_unit(type_config, chunk, replace).await?;

                completed.lock().expect("completed set lock").insert(unit);
                let mut stats = stats.lock().expect("stats lock");
                stats.units_committed += 1;
                stats.files_loaded += loaded;
            }
        }
        Ok(())
    }

    /// Load one chunk x type in a single transaction. Returns the number of
    /// files loaded.
    async fn load_unit(
        &self,
        type_config: &TypeConfig,
        chunk: TimeChunk,
        replace: bool,
    ) -> Result<usize, SyncError> {
        self.warehouse.begin().await.context(WarehouseSnafu)?;
        match self.load_unit_inner(type_config, chunk, replace).await {
            Ok(loaded) => {
                self.warehouse.commit().await.context(WarehouseSnafu)?;
                emit!(ChunkCommitted);
                if loaded > 0 {
                    emit!(FilesLoaded {
                        count: loaded as u64,
                    });
                }
                Ok(loaded)
            }
            Err(error) => {
                // Best effort; an uncommitted transaction is rolled back by
                // the warehouse on disconnect anyway.
                let _ = self.warehouse.rollback().await;
                Err(error)
            }
        }
    }

    async fn load_unit_inner(
        &self,
        type_config: &TypeConfig,
        chunk: TimeChunk,
        replace: bool,
    ) -> Result<usize, SyncError> {
        if replace {
            self.delete_type_data(type_config, chunk.from, chunk.to)
                .await?;
        }

        let ledger_ids = self
            .ledger
            .find(&type_config.name, chunk.from, chunk.to)
            .await
            .context(LedgerSnafu)?;
        let mut files = self
            .catalog
            .list_new(&type_config.name, chunk.from, chunk.to, &ledger_ids)
            .await
            .context(CatalogSnafu)?;

        // Snapshot types: every file is a full snapshot, so only the most
        // recent new file per scan is worth importing.
        if type_config.snapshot_mode && files.len() > 1 {
            files = vec![files.pop().expect("len checked")];
        }

        if files.is_empty() {
            debug!("No new files for {}@{}", type_config.name, chunk.from);
            return Ok(0);
        }

        let mut by_table: BTreeMap<String, Vec<DataFile>> = BTreeMap::new();
        for file in files {
            let table = PartitionManager::table_for(type_config, file.bucket_start());
            by_table.entry(table).or_default().push(file);
        }

        let mut loaded = 0;
        let chunk_key = chunk.from.format("%Y%m%d%H").to_string();
        for (table, group) in &by_table {
            self.bulk_load(type_config, table, group, &chunk_key).await?;
            loaded += group.len();
        }

        info!(
            "Loaded {} files into {} tables for {}@{}",
            loaded,
            by_table.len(),
            type_config.name,
            chunk.from
        );
        Ok(loaded)
    }

    /// Bulk-copy a group of files into one destination table: write a
    /// manifest naming every file, issue one copy, record the ledger rows.
    async fn bulk_load(
        &self,
        type_config: &TypeConfig,
        table: &str,
        files: &[DataFile],
        manifest_tag: &str,
    ) -> Result<(), SyncError> {
        let manifest = Manifest {
            entries: files
                .iter()
                .map(|file| ManifestEntry {
                    url: self.storage.url_for(&file.key),
                    mandatory: true,
                })
                .collect(),
        };
        let manifest_path = format!(
            "{}/{}-{}.json",
            self.config.storage.manifests_dir, table, manifest_tag
        );
        let body = serde_json::to_vec(&manifest).expect("manifest serializes");
        self.storage
            .put(&manifest_path, body.into())
            .await
            .context(SyncStorageSnafu)?;

        let jsonpaths_path = crate::schema::ColumnMapping::artifact_path(
            &self.config.storage.mappings_dir,
            &type_config.name,
        );
        self.warehouse
            .copy_from_manifest(
                table,
                &self.storage.url_for(&manifest_path),
                &self.storage.url_for(&jsonpaths_path),
            )
            .await
            .context(WarehouseSnafu)?;

        self.ledger
            .record(files, table)
            .await
            .context(LedgerSnafu)?;
        Ok(())
    }

    /// For slowly-changing dimension types: replace each type's entire
    /// contents with its single most-recent new file in `[from, to]`.
    ///
    /// Every new file is ledger-recorded, imported or not, so superseded
    /// files are never considered "new" again.
    pub async fn replace_all_with_latest(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LoadStats, SyncError> {
        let stats: Mutex<LoadStats> = Mutex::new(LoadStats::default());
        let stats_ref = &stats;
        retry_with_policy(
            &self.config.retry,
            &*self.notifier,
            "replace-all-with-latest",
            move || self.replace_all_attempt(from, to, stats_ref),
        )
        .await?;
        Ok(*stats.lock().expect("stats lock"))
    }

    async fn replace_all_attempt(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        stats: &Mutex<LoadStats>,
    ) -> Result<(), SyncError> {
        self.schema.sync(false).await.context(SchemaSnafu)?;
        self.partitions
            .partition(&self.config.types, from, to)
            .await
            .context(PartitionSnafu)?;

        for type_config in &self.config.types {
            let ledger_ids = self
                .ledger
                .find(&type_config.name, from, to)
                .await
                .context(LedgerSnafu)?;
            let files = self
                .catalog
                .list_new(&type_config.name, from, to, &ledger_ids)
                .await
                .context(CatalogSnafu)?;
            let Some(latest) = files.last().cloned() else {
                debug!("No new files for '{}', keeping current rows", type_config.name);
                continue;
            };

            self.warehouse.begin().await.context(WarehouseSnafu)?;
            let result = self
                .replace_type_with(type_config, &latest, &files)
                .await;
            match result {
                Ok(()) => {
                    self.warehouse.commit().await.context(WarehouseSnafu)?;
                    emit!(ChunkCommitted);
                    emit!(FilesLoaded { count: 1 });
                    let mut stats = stats.lock().expect("stats lock");
                    stats.units_committed += 1;
                    stats.files_loaded += 1;
                }
                Err(error) => {
                    let _ = self.warehouse.rollback().await;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    async fn replace_type_with(
        &self,
        type_config: &TypeConfig,
        latest: &DataFile,
        all_new: &[DataFile],
    ) -> Result<(), SyncError> {
        self.delete_all_rows(type_config).await?;

        let table = PartitionManager::table_for(type_config, latest.bucket_start());
        self.bulk_load_single(type_config, &table, latest).await?;

        // Ledger-record every new file, not just the imported one.
        let superseded: Vec<DataFile> = all_new
            .iter()
            .filter(|f| f.id() != latest.id())
            .cloned()
            .collect();
        if !superseded.is_empty() {
            self.ledger
                .record(&superseded, &table)
                .await
                .context(LedgerSnafu)?;
        }

        info!(
            "Replaced '{}' with {} ({} superseded files retired)",
            type_config.name,
            latest.id(),
            superseded.len()
        );
        Ok(())
    }

    async fn bulk_load_single(
        &self,
        type_config: &TypeConfig,
        table: &str,
        file: &DataFile,
    ) -> Result<(), SyncError> {
        self.bulk_load(type_config, table, std::slice::from_ref(file), "latest")
            .await
    }

    /// Delete rows and ledger entries for every type in `[from, to]`.
    ///
    /// A type without a timestamp column cannot be range-deleted, so all of
    /// its rows and ledger entries go. Each type is one transaction so rows
    /// and ledger entries never diverge.
    pub async fn delete(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), SyncError> {
        for type_config in &self.config.types {
            self.warehouse.begin().await.context(WarehouseSnafu)?;
            let result = self.delete_type_data(type_config, from, to).await;
            match result {
                Ok(()) => self.warehouse.commit().await.context(WarehouseSnafu)?,
                Err(error) => {
                    let _ = self.warehouse.rollback().await;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Delete one type's rows and ledger entries in `[from, to]`, falling
    /// back to a full delete when the type has no timestamp column. Must run
    /// inside the caller's open transaction.
    async fn delete_type_data(
        &self,
        type_config: &TypeConfig,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let Some(ts_column) = &type_config.timestamp_column else {
            self.delete_all_rows(type_config).await?;
            self.ledger
                .delete_all_by_type(&type_config.name)
                .await
                .context(LedgerSnafu)?;
            return Ok(());
        };

        let dialect = self.warehouse.dialect();
        let predicate = format!(
            "{} >= {} AND {} < {}",
            dialect.quote_ident(ts_column),
            dialect.timestamp_literal(from),
            dialect.quote_ident(ts_column),
            dialect.timestamp_literal(to + chrono::Duration::hours(1)),
        );

        match &type_config.partitioning {
            Some(partitioning) => {
                // Only bucket tables overlapping the range are touched.
                let granularity = partitioning.granularity;
                for key in self
                    .partitions
                    .existing_buckets(&type_config.name, granularity)
                    .await
                    .context(PartitionSnafu)?
                {
                    let Some(bucket_start) = parse_bucket_key(granularity, &key) else {
                        continue;
                    };
                    let bucket_end = granularity.next_bucket(bucket_start);
                    if bucket_start > to || bucket_end <= from {
                        continue;
                    }
                    let table = PartitionManager::bucket_table(&type_config.name, &key);
                    let sql = format!(
                        "DELETE FROM {} WHERE {}",
                        dialect.quote_ident(&table),
                        predicate
                    );
                    self.warehouse.execute(&sql).await.context(WarehouseSnafu)?;
                }
            }
            None => {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    dialect.quote_ident(&type_config.name),
                    predicate
                );
                self.warehouse.execute(&sql).await.context(WarehouseSnafu)?;
            }
        }

        self.ledger
            .delete_by_time_range(&type_config.name, from, to)
            .await
            .context(LedgerSnafu)?;
        Ok(())
    }

    /// Delete every row of a type (all bucket tables, or the flat table).
    async fn delete_all_rows(&self, type_config: &TypeConfig) -> Result<(), SyncError> {
        let dialect = self.warehouse.dialect();
        match &type_config.partitioning {
            Some(partitioning) => {
                for key in self
                    .partitions
                    .existing_buckets(&type_config.name, partitioning.granularity)
                    .await
                    .context(PartitionSnafu)?
                {
                    let table = PartitionManager::bucket_table(&type_config.name, &key);
                    let sql = format!("DELETE FROM {}", dialect.quote_ident(&table));
                    self.warehouse.execute(&sql).await.context(WarehouseSnafu)?;
                }
            }
            None => {
                let sql = format!(
                    "DELETE FROM {}",
                    dialect.quote_ident(&type_config.name)
                );
                self.warehouse.execute(&sql).await.context(WarehouseSnafu)?;
            }
        }
        Ok(())
    }

    /// Ledger retention cleanup, at most once per 24h: drop entries older
    /// than the oldest retained partition bucket of each partitioned type.
    async fn clean_ledger(&self, stats: &Mutex<LoadStats>) -> Result<(), SyncError> {
        let now = Utc::now();
        {
            let last = self
                .last_retention_cleanup
                .lock()
                .expect("cleanup clock lock");
            if let Some(last) = *last
                && now - last < chrono::Duration::hours(RETENTION_CLEANUP_HOURS)
            {
                return Ok(());
            }
        }

        let mut deleted_total = 0;
        for type_config in &self.config.types {
            let Some(partitioning) = &type_config.partitioning else {
                continue;
            };
            let buckets = self
                .partitions
                .existing_buckets(&type_config.name, partitioning.granularity)
                .await
                .context(PartitionSnafu)?;
            let Some(oldest) = buckets
                .first()
                .and_then(|key| parse_bucket_key(partitioning.granularity, key))
            else {
                continue;
            };

            let deleted = self
                .ledger
                .delete_older_than(&type_config.name, oldest)
                .await
                .context(LedgerSnafu)?;
            deleted_total += deleted;
        }

        if deleted_total > 0 {
            info!("Retention cleanup removed {} ledger entries", deleted_total);
            emit!(LedgerEntriesDeleted {
                count: deleted_total,
            });
        }
        stats.lock().expect("stats lock").ledger_entries_cleaned += deleted_total;
        *self
            .last_retention_cleanup
            .lock()
            .expect("cleanup clock lock") = Some(now);
        Ok(())
    }
}
