//! Integration tests for snowdrift.
//!
//! Scenario tests run the orchestrator end to end against an in-memory
//! object store and the fake warehouse from `common`.

mod common;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use common::FakeWarehouse;
use snowdrift::config::{
    Config, MetricsConfig, PartitioningConfig, RetryConfig, StorageConfig, TypeConfig,
    WarehouseConfig,
};
use snowdrift::error::{PartitionError, SyncError};
use snowdrift::load::LoadOrchestrator;
use snowdrift::notify::LogNotifier;
use snowdrift::storage::StorageProvider;
use snowdrift::time::{Chunking, Granularity};
use snowdrift::warehouse::Dialect;
use std::collections::HashMap;
use std::sync::Arc;

fn hour(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
}

fn metrics_type(retained_buckets: usize) -> TypeConfig {
    TypeConfig {
        name: "metrics".to_string(),
        partitioning: Some(PartitioningConfig {
            granularity: Granularity::Hourly,
            retained_buckets,
        }),
        snapshot_mode: false,
        timestamp_column: Some("event_time".to_string()),
    }
}

fn accounts_type() -> TypeConfig {
    TypeConfig {
        name: "accounts".to_string(),
        partitioning: None,
        snapshot_mode: true,
        timestamp_column: None,
    }
}

fn test_config(types: Vec<TypeConfig>) -> Arc<Config> {
    Arc::new(Config {
        warehouse: WarehouseConfig {
            dialect: Dialect::Redshift,
            connection: "host=unused".to_string(),
        },
        storage: StorageConfig {
            url: "mem://".to_string(),
            options: HashMap::new(),
            ddl_dir: "ddl".to_string(),
            mappings_dir: "jsonpaths".to_string(),
            manifests_dir: "manifests".to_string(),
        },
        types,
        retry: RetryConfig {
            max_attempts: 3,
            backoff_secs: 0,
            escalate_every: 5,
        },
        metrics: MetricsConfig::default(),
    })
}

struct Harness {
    storage: Arc<StorageProvider>,
    warehouse: Arc<FakeWarehouse>,
    orchestrator: LoadOrchestrator,
}

fn harness(types: Vec<TypeConfig>, warehouse: FakeWarehouse) -> Harness {
    let storage = Arc::new(StorageProvider::in_memory());
    let warehouse = Arc::new(warehouse);
    let orchestrator = LoadOrchestrator::new(
        test_config(types),
        storage.clone(),
        warehouse.clone(),
        Arc::new(LogNotifier),
    );
    Harness {
        storage,
        warehouse,
        orchestrator,
    }
}

async fn seed_file(storage: &StorageProvider, key: &str) {
    storage.put(key, Bytes::from_static(b"rows")).await.unwrap();
}

fn loads_into<'a>(
    state: &'a common::WarehouseState,
    table: &str,
) -> Vec<&'a (String, String)> {
    state.loads.iter().filter(|(t, _)| t == table).collect()
}

mod round_trip {
    use super::*;

    #[tokio::test]
    async fn test_load_creates_bucket_loads_files_and_records_ledger() {
        let h = harness(
            vec![metrics_type(72)],
            FakeWarehouse::new().with_table("metrics_template", &["id", "event_time", "value"]),
        );
        seed_file(&h.storage, "metrics/d=2024-01-02/h=03/m1.a1b2.avro").await;
        seed_file(&h.storage, "metrics/d=2024-01-02/h=03/m2.c3d4.avro").await;

        let stats = h
            .orchestrator
            .load(hour(2024, 1, 2, 3), hour(2024, 1, 2, 3), Chunking::Hourly, false)
            .await
            .unwrap();
        assert_eq!(stats.files_loaded, 2);
        assert_eq!(stats.units_committed, 1);

        let state = h.warehouse.state();
        let bucket = "metrics_partition_2024010203";

        // (a) bucket table exists, cloned from the template
        assert!(state.tables.contains_key(bucket));

        // (b) one bulk copy covered both files
        let copies = loads_into(&state, bucket);
        assert_eq!(copies.len(), 1);
        let manifest_body = h
            .storage
            .get("manifests/metrics_partition_2024010203-2024010203.json")
            .await
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest_body).unwrap();
        let entries = manifest["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e["mandatory"] == true));

        // (c) two ledger rows naming the bucket table
        let ledger: Vec<_> = state
            .import_ledger
            .iter()
            .map(|(f, t, _)| (f.as_str(), t.as_str()))
            .collect();
        assert_eq!(
            ledger,
            vec![
                ("2024010203-metrics-m1.a1b2", bucket),
                ("2024010203-metrics-m2.c3d4", bucket),
            ]
        );

        // (d) union view lists exactly the bucket table
        assert_eq!(state.views["metrics"], vec![bucket.to_string()]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let h = harness(
            vec![metrics_type(72)],
            FakeWarehouse::new().with_table("metrics_template", &["id", "event_time"]),
        );
        seed_file(&h.storage, "metrics/d=2024-01-02/h=03/m1.a1b2.avro").await;

        let range = (hour(2024, 1, 2, 3), hour(2024, 1, 2, 3));
        h.orchestrator
            .load(range.0, range.1, Chunking::Hourly, false)
            .await
            .unwrap();
        let stats = h
            .orchestrator
            .load(range.0, range.1, Chunking::Hourly, false)
            .await
            .unwrap();

        // Second pass found nothing new: no duplicate copy, no duplicate row.
        assert_eq!(stats.files_loaded, 0);
        let state = h.warehouse.state();
        assert_eq!(state.loads.len(), 1);
        assert_eq!(state.import_ledger.len(), 1);
    }
}

mod resumption {
    use super::*;

    #[tokio::test]
    async fn test_failed_unit_resumes_without_repeating_committed_units() {
        let h = harness(
            vec![metrics_type(72)],
            FakeWarehouse::new().with_table("metrics_template", &["id", "event_time"]),
        );
        seed_file(&h.storage, "metrics/d=2024-01-02/h=03/m1.a1b2.avro").await;
        seed_file(&h.storage, "metrics/d=2024-01-02/h=04/m3.e5f6.avro").await;

        // First copy into the second chunk's bucket fails once.
        h.warehouse
            .fail_on("COPY \"metrics_partition_2024010204\"", 1);

        let stats = h
            .orchestrator
            .load(hour(2024, 1, 2, 3), hour(2024, 1, 2, 4), Chunking::Hourly, false)
            .await
            .unwrap();

        // Unit 1 committed in attempt 1 and was skipped in attempt 2.
        assert_eq!(stats.units_committed, 2);
        assert_eq!(stats.units_skipped, 1);

        let state = h.warehouse.state();
        assert_eq!(loads_into(&state, "metrics_partition_2024010203").len(), 1);
        assert_eq!(loads_into(&state, "metrics_partition_2024010204").len(), 1);
        assert_eq!(state.import_ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_exhausts_retries() {
        let h = harness(
            vec![metrics_type(72)],
            FakeWarehouse::new().with_table("metrics_template", &["id", "event_time"]),
        );
        seed_file(&h.storage, "metrics/d=2024-01-02/h=03/m1.a1b2.avro").await;
        h.warehouse
            .fail_on("COPY \"metrics_partition_2024010203\"", 100);

        let result = h
            .orchestrator
            .load(hour(2024, 1, 2, 3), hour(2024, 1, 2, 3), Chunking::Hourly, false)
            .await;
        assert!(matches!(
            result,
            Err(SyncError::RetriesExhausted { attempts: 3, .. })
        ));

        // Rollback left no ledger rows behind.
        assert!(h.warehouse.state().import_ledger.is_empty());
    }
}

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_type_imports_only_latest_file() {
        let h = harness(
            vec![accounts_type()],
            FakeWarehouse::new().with_table("accounts", &["id", "name"]),
        );
        seed_file(&h.storage, "accounts/d=2024-01-02/h=01/snap1.avro").await;
        seed_file(&h.storage, "accounts/d=2024-01-02/h=02/snap2.avro").await;
        seed_file(&h.storage, "accounts/d=2024-01-02/h=03/snap3.avro").await;

        let stats = h
            .orchestrator
            .load(hour(2024, 1, 2, 0), hour(2024, 1, 2, 5), Chunking::Disable, false)
            .await
            .unwrap();
        assert_eq!(stats.files_loaded, 1);

        let state = h.warehouse.state();
        let copies = loads_into(&state, "accounts");
        assert_eq!(copies.len(), 1);

        let manifest_body = h
            .storage
            .get("manifests/accounts-2024010200.json")
            .await
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest_body).unwrap();
        let entries = manifest["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0]["url"].as_str().unwrap().ends_with("snap3.avro"));

        assert_eq!(state.import_ledger.len(), 1);
        assert_eq!(state.import_ledger[0].0, "2024010203-accounts-snap3");
    }

    #[tokio::test]
    async fn test_replace_all_with_latest_retires_superseded_files() {
        let h = harness(
            vec![accounts_type()],
            FakeWarehouse::new().with_table("accounts", &["id", "name"]),
        );
        seed_file(&h.storage, "accounts/d=2024-01-02/h=01/snap1.avro").await;
        seed_file(&h.storage, "accounts/d=2024-01-02/h=02/snap2.avro").await;
        seed_file(&h.storage, "accounts/d=2024-01-02/h=03/snap3.avro").await;

        let stats = h
            .orchestrator
            .replace_all_with_latest(hour(2024, 1, 2, 0), hour(2024, 1, 2, 5))
            .await
            .unwrap();
        assert_eq!(stats.files_loaded, 1);

        let state = h.warehouse.state();

        // Existing rows were wiped before the single import.
        assert!(state.sql_log.iter().any(|sql| sql == "DELETE FROM \"accounts\""));
        assert_eq!(loads_into(&state, "accounts").len(), 1);

        // Every new file is ledger-recorded; superseded ones never come back.
        let mut filenames: Vec<_> = state
            .import_ledger
            .iter()
            .map(|(f, _, _)| f.as_str())
            .collect();
        filenames.sort();
        assert_eq!(
            filenames,
            vec![
                "2024010201-accounts-snap1",
                "2024010202-accounts-snap2",
                "2024010203-accounts-snap3",
            ]
        );

        // A re-run sees nothing new and leaves the rows alone.
        let stats = h
            .orchestrator
            .replace_all_with_latest(hour(2024, 1, 2, 0), hour(2024, 1, 2, 5))
            .await
            .unwrap();
        assert_eq!(stats.files_loaded, 0);
        assert_eq!(loads_into(&h.warehouse.state(), "accounts").len(), 1);
    }
}

mod partitions {
    use super::*;

    #[tokio::test]
    async fn test_retention_violation_is_fatal_and_mutates_nothing() {
        let h = harness(
            vec![metrics_type(2)],
            FakeWarehouse::new().with_table("metrics_template", &["id", "event_time"]),
        );

        let result = h
            .orchestrator
            .load(hour(2024, 1, 1, 0), hour(2024, 1, 1, 3), Chunking::Disable, false)
            .await;
        assert!(matches!(
            result,
            Err(SyncError::Partition {
                source: PartitionError::RetentionWindowTooSmall { .. }
            })
        ));

        // No partial mutation: no bucket created, no view touched, and the
        // fatal error never reached a data transaction.
        let state = h.warehouse.state();
        assert!(!state.tables.keys().any(|t| t.starts_with("metrics_partition_")));
        assert!(state.views.is_empty());
        assert!(!state.sql_log.iter().any(|sql| sql.starts_with("CREATE TABLE ")));
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest_buckets_and_view_in_sync() {
        let warehouse = FakeWarehouse::new()
            .with_table("metrics_template", &["id", "event_time"])
            .with_table("metrics_partition_2024010100", &["id", "event_time"])
            .with_table("metrics_partition_2024010101", &["id", "event_time"]);
        let h = harness(vec![metrics_type(3)], warehouse);

        h.orchestrator
            .load(hour(2024, 1, 1, 2), hour(2024, 1, 1, 3), Chunking::Disable, false)
            .await
            .unwrap();

        let state = h.warehouse.state();
        let buckets: Vec<_> = state
            .tables
            .keys()
            .filter(|t| t.starts_with("metrics_partition_"))
            .cloned()
            .collect();
        assert_eq!(
            buckets,
            vec![
                "metrics_partition_2024010101",
                "metrics_partition_2024010102",
                "metrics_partition_2024010103",
            ]
        );
        assert_eq!(state.views["metrics"], buckets);
    }
}

mod schema_sync {
    use super::*;

    #[tokio::test]
    async fn test_alter_replicates_to_template_and_all_buckets() {
        let warehouse = FakeWarehouse::new()
            .with_table("events_template", &["id", "ts"])
            .with_table("events_partition_2024010100", &["id", "ts"])
            .with_table("events_partition_2024010200", &["id", "ts"]);
        let h = harness(
            vec![TypeConfig {
                name: "events".to_string(),
                partitioning: Some(PartitioningConfig {
                    granularity: Granularity::Hourly,
                    retained_buckets: 72,
                }),
                snapshot_mode: false,
                timestamp_column: Some("ts".to_string()),
            }],
            warehouse,
        );
        h.storage
            .put(
                "ddl/001_add_region.ddl",
                Bytes::from_static(
                    b"// widen events with a region\n\
                      ALTER TABLE events ADD COLUMN region VARCHAR(10);\n",
                ),
            )
            .await
            .unwrap();

        h.orchestrator
            .load(hour(2024, 1, 1, 0), hour(2024, 1, 1, 0), Chunking::Hourly, false)
            .await
            .unwrap();

        let state = h.warehouse.state();

        // The ALTER hit the canonical table and both bucket replicas.
        let altered: Vec<_> = state.alters.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            altered,
            vec![
                "events_template",
                "events_partition_2024010100",
                "events_partition_2024010200",
            ]
        );
        assert!(
            state
                .alters
                .iter()
                .all(|(_, rest)| rest == "ADD COLUMN region VARCHAR(10)")
        );

        // One ledger entry for the whole file.
        assert_eq!(state.ddl_ledger.len(), 1);
        assert_eq!(state.ddl_ledger[0].0, "ddl/001_add_region.ddl");

        // The union view was rebuilt over the existing buckets.
        assert_eq!(
            state.views["events"],
            vec![
                "events_partition_2024010100".to_string(),
                "events_partition_2024010200".to_string(),
            ]
        );

        // Column mappings were republished with the new column last.
        let mapping = h.storage.get("jsonpaths/events.json").await.unwrap();
        let mapping: serde_json::Value = serde_json::from_slice(&mapping).unwrap();
        assert_eq!(
            mapping["jsonpaths"].as_array().unwrap().last().unwrap().as_str(),
            Some("$.region")
        );
    }

    #[tokio::test]
    async fn test_applied_ddl_is_not_reapplied() {
        let warehouse = FakeWarehouse::new().with_table("events_template", &["id", "ts"]);
        let h = harness(
            vec![TypeConfig {
                name: "events".to_string(),
                partitioning: Some(PartitioningConfig {
                    granularity: Granularity::Hourly,
                    retained_buckets: 72,
                }),
                snapshot_mode: false,
                timestamp_column: None,
            }],
            warehouse,
        );
        h.storage
            .put(
                "ddl/001_add_region.ddl",
                Bytes::from_static(b"ALTER TABLE events ADD COLUMN region VARCHAR(10);"),
            )
            .await
            .unwrap();

        let range = (hour(2024, 1, 1, 0), hour(2024, 1, 1, 0));
        h.orchestrator
            .load(range.0, range.1, Chunking::Hourly, false)
            .await
            .unwrap();
        h.orchestrator
            .load(range.0, range.1, Chunking::Hourly, false)
            .await
            .unwrap();

        let state = h.warehouse.state();
        assert_eq!(state.ddl_ledger.len(), 1);
        let template_alters = state
            .alters
            .iter()
            .filter(|(t, _)| t == "events_template")
            .count();
        assert_eq!(template_alters, 1);
    }
}

mod deletion {
    use super::*;

    #[tokio::test]
    async fn test_delete_touches_only_overlapping_buckets() {
        let warehouse = FakeWarehouse::new()
            .with_table("metrics_template", &["id", "event_time"])
            .with_table("metrics_partition_2024010100", &["id", "event_time"])
            .with_table("metrics_partition_2024010101", &["id", "event_time"])
            .with_table("metrics_partition_2024010102", &["id", "event_time"])
            .with_table("metrics_partition_2024010103", &["id", "event_time"]);
        let h = harness(vec![metrics_type(24), accounts_type()], warehouse);

        h.orchestrator
            .delete(hour(2024, 1, 1, 1), hour(2024, 1, 1, 2))
            .await
            .unwrap();

        let state = h.warehouse.state();
        let deletes: Vec<_> = state
            .sql_log
            .iter()
            .filter(|sql| sql.starts_with("DELETE FROM \"metrics_partition_"))
            .cloned()
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0].contains("metrics_partition_2024010101"));
        assert!(deletes[1].contains("metrics_partition_2024010102"));
        assert!(deletes.iter().all(|sql| {
            sql.contains("\"event_time\" >= '2024-01-01 01:00:00'")
                && sql.contains("\"event_time\" < '2024-01-01 03:00:00'")
        }));

        // The timestamp-less type is deleted wholesale.
        assert!(state.sql_log.iter().any(|sql| sql == "DELETE FROM \"accounts\""));
    }
}

mod bootstrap {
    use super::*;

    #[tokio::test]
    async fn test_init_creates_ledger_tables() {
        let h = harness(vec![accounts_type()], FakeWarehouse::new());
        h.orchestrator.init().await.unwrap();

        let state = h.warehouse.state();
        assert!(
            state
                .sql_log
                .iter()
                .any(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS import_ledger"))
        );
        assert!(
            state
                .sql_log
                .iter()
                .any(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS ddl_ledger"))
        );
    }
}
