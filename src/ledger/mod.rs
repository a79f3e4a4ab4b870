//! Idempotency ledgers.
//!
//! The import ledger records which data files have been applied to which
//! table; the DDL ledger records which migration files have been applied.
//! Both live as tables in the target warehouse so that ledger updates share
//! a transaction with the writes they describe. Entries are append-only;
//! import-ledger rows are deleted only by retention cleanup.
//!
//! File ids carry a fixed-width `yyyyMMddHH` prefix (see
//! [`crate::catalog::DataFile::id`]), so time-range queries become plain
//! string-range predicates on the `filename` column.

use chrono::{DateTime, Duration, Utc};
use snafu::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use crate::catalog::DataFile;
use crate::error::{LedgerError, LedgerWarehouseSnafu};
use crate::warehouse::Warehouse;

/// Import-ledger table name in the warehouse.
pub const IMPORT_LEDGER_TABLE: &str = "import_ledger";
/// DDL-ledger table name in the warehouse.
pub const DDL_LEDGER_TABLE: &str = "ddl_ledger";

/// Rows inserted per INSERT statement when recording files.
const INSERT_BATCH: usize = 100;

/// Bootstrap DDL for both ledger tables, executed by the `init` verb.
pub fn bootstrap_sql(dialect: crate::warehouse::Dialect) -> String {
    let text_type = match dialect {
        crate::warehouse::Dialect::Mysql => "TEXT",
        crate::warehouse::Dialect::Redshift => "VARCHAR(65535)",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {IMPORT_LEDGER_TABLE} (
    filename VARCHAR(512) NOT NULL,
    tablename VARCHAR(256) NOT NULL,
    etl_tstamp VARCHAR(32) NOT NULL
);
CREATE TABLE IF NOT EXISTS {DDL_LEDGER_TABLE} (
    file VARCHAR(512) NOT NULL,
    ddl_text {text_type} NOT NULL,
    applied_at VARCHAR(32) NOT NULL
);"
    )
}

/// Hour-key bounds `[key(from), key(to + 1 hour))` for a filename range scan.
///
/// One bucket unit is added to `to` before filtering so the boundary hour is
/// never lost.
fn key_bounds(from: DateTime<Utc>, to: DateTime<Utc>) -> (String, String) {
    (
        from.format("%Y%m%d%H").to_string(),
        (to + Duration::hours(1)).format("%Y%m%d%H").to_string(),
    )
}

/// Whether a ledger filename belongs to `type_name`.
///
/// Ids are `<yyyyMMddHH>-<type>-<name>`; the type sits between the first
/// hyphen after the fixed-width hour key and its matching trailing hyphen.
fn id_matches_type(filename: &str, type_name: &str) -> bool {
    filename
        .get(10..)
        .is_some_and(|rest| {
            rest.strip_prefix('-')
                .and_then(|rest| rest.strip_prefix(type_name))
                .is_some_and(|rest| rest.starts_with('-'))
        })
}

/// LIKE pattern matching any id of `type_name`: ten single-character
/// wildcards for the hour key, then the escaped `-<type>-` segment.
fn type_pattern(dialect: crate::warehouse::Dialect, type_name: &str) -> String {
    format!("__________-{}-%", dialect.escape_like(type_name))
}

/// Repository for the import ledger.
pub struct ImportLedger {
    warehouse: Arc<dyn Warehouse>,
}

impl ImportLedger {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// File ids already applied for `type_name` with bucket hours in
    /// `[from, to]`.
    pub async fn find(
        &self,
        type_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashSet<String>, LedgerError> {
        let (low, high) = key_bounds(from, to);
        let dialect = self.warehouse.dialect();
        let sql = format!(
            "SELECT filename FROM {IMPORT_LEDGER_TABLE} \
             WHERE filename >= {} AND filename < {}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let rows = self
            .warehouse
            .query_with(&sql, &[&low, &high])
            .await
            .context(LedgerWarehouseSnafu)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .filter(|filename| id_matches_type(filename, type_name))
            .collect())
    }

    /// Record `files` as applied to `table`.
    ///
    /// Must be called inside the same open transaction as the data write:
    /// a file is never marked imported without its data committing, and
    /// never committed without being marked.
    pub async fn record(&self, files: &[DataFile], table: &str) -> Result<(), LedgerError> {
        let dialect = self.warehouse.dialect();
        let applied_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        for batch in files.chunks(INSERT_BATCH) {
            let mut values = Vec::with_capacity(batch.len());
            let mut owned: Vec<String> = Vec::with_capacity(batch.len() * 3);
            for (row, file) in batch.iter().enumerate() {
                let base = row * 3;
                values.push(format!(
                    "({}, {}, {})",
                    dialect.placeholder(base + 1),
                    dialect.placeholder(base + 2),
                    dialect.placeholder(base + 3)
                ));
                owned.push(file.id());
                owned.push(table.to_string());
                owned.push(applied_at.clone());
            }
            let sql = format!(
                "INSERT INTO {IMPORT_LEDGER_TABLE} (filename, tablename, etl_tstamp) VALUES {}",
                values.join(", ")
            );
            let params: Vec<&str> = owned.iter().map(String::as_str).collect();
            self.warehouse
                .execute_with(&sql, &params)
                .await
                .context(LedgerWarehouseSnafu)?;
        }
        Ok(())
    }

    /// Delete entries for `type_name` with bucket hours in `[from, to]`.
    pub async fn delete_by_time_range(
        &self,
        type_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let (low, high) = key_bounds(from, to);
        let dialect = self.warehouse.dialect();
        let pattern = type_pattern(dialect, type_name);
        let sql = format!(
            "DELETE FROM {IMPORT_LEDGER_TABLE} \
             WHERE filename >= {} AND filename < {} AND filename LIKE {}",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3)
        );
        self.warehouse
            .execute_with(&sql, &[&low, &high, &pattern])
            .await
            .context(LedgerWarehouseSnafu)
    }

    /// Delete entries for `type_name` strictly older than `cutoff`.
    ///
    /// Used by retention cleanup; `cutoff` is the start of the oldest
    /// retained partition bucket, so entries inside the retained window are
    /// never touched.
    pub async fn delete_older_than(
        &self,
        type_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let dialect = self.warehouse.dialect();
        let high = cutoff.format("%Y%m%d%H").to_string();
        let pattern = type_pattern(dialect, type_name);
        let sql = format!(
            "DELETE FROM {IMPORT_LEDGER_TABLE} WHERE filename < {} AND filename LIKE {}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        self.warehouse
            .execute_with(&sql, &[&high, &pattern])
            .await
            .context(LedgerWarehouseSnafu)
    }

    /// Delete every entry for `type_name`.
    pub async fn delete_all_by_type(&self, type_name: &str) -> Result<u64, LedgerError> {
        let dialect = self.warehouse.dialect();
        let pattern = type_pattern(dialect, type_name);
        let sql = format!(
            "DELETE FROM {IMPORT_LEDGER_TABLE} WHERE filename LIKE {}",
            dialect.placeholder(1)
        );
        self.warehouse
            .execute_with(&sql, &[&pattern])
            .await
            .context(LedgerWarehouseSnafu)
    }
}

/// Repository for the DDL ledger.
pub struct DdlLedger {
    warehouse: Arc<dyn Warehouse>,
}

impl DdlLedger {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Files already applied, in no particular order.
    pub async fn applied_files(&self) -> Result<HashSet<String>, LedgerError> {
        let sql = format!("SELECT file FROM {DDL_LEDGER_TABLE}");
        let rows = self
            .warehouse
            .query_with(&sql, &[])
            .await
            .context(LedgerWarehouseSnafu)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    /// Record one applied DDL file; one entry per file, never per statement.
    ///
    /// Must be called inside the transaction that applied the file, so a
    /// mid-file failure leaves no ledger entry behind.
    pub async fn record(&self, file: &str, ddl_text: &str) -> Result<(), LedgerError> {
        let dialect = self.warehouse.dialect();
        let applied_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let sql = format!(
            "INSERT INTO {DDL_LEDGER_TABLE} (file, ddl_text, applied_at) VALUES ({}, {}, {})",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3)
        );
        self.warehouse
            .execute_with(&sql, &[file, ddl_text, &applied_at])
            .await
            .context(LedgerWarehouseSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::Dialect;
    use chrono::TimeZone;

    #[test]
    fn test_key_bounds_add_one_bucket() {
        let from = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 23, 0, 0).unwrap();
        let (low, high) = key_bounds(from, to);
        assert_eq!(low, "2024010203");
        assert_eq!(high, "2024010300");
    }

    #[test]
    fn test_id_matches_type() {
        assert!(id_matches_type("2024010203-metrics-m1.a1b2", "metrics"));
        assert!(!id_matches_type("2024010203-metrics-m1.a1b2", "metric"));
        assert!(!id_matches_type("2024010203-metrics_v2-m1", "metrics"));
        assert!(!id_matches_type("2024010203-accounts-snap", "metrics"));
        assert!(!id_matches_type("garbage", "metrics"));
    }

    #[test]
    fn test_type_pattern_escapes_wildcards() {
        assert_eq!(
            type_pattern(Dialect::Redshift, "my_events"),
            "__________-my\\_events-%"
        );
    }

    #[test]
    fn test_bootstrap_sql_per_dialect() {
        assert!(bootstrap_sql(Dialect::Redshift).contains("VARCHAR(65535)"));
        assert!(bootstrap_sql(Dialect::Mysql).contains("TEXT"));
        assert!(bootstrap_sql(Dialect::Redshift).contains("import_ledger"));
        assert!(bootstrap_sql(Dialect::Redshift).contains("ddl_ledger"));
    }
}
