//! Warehouse client interface.
//!
//! The engine drives the warehouse through the [`Warehouse`] trait: plain
//! statement execution, bind-parameter queries, explicit transaction control,
//! bulk copies from a manifest, and the metadata capabilities the partition
//! manager and schema syncer need (`list_tables_with_prefix`,
//! `describe_table`). Dialect differences live in [`Dialect`]; the trait's
//! default methods compose the two so concrete clients only implement the
//! wire-level primitives.

mod dialect;
mod postgres;

pub use dialect::Dialect;
pub use postgres::PostgresWarehouse;

use async_trait::async_trait;

use crate::error::WarehouseError;

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A warehouse client.
///
/// A single client owns one connection; the orchestrator never runs more
/// than one unit of work inside an open transaction, so `begin`/`commit`/
/// `rollback` pair up without nesting.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// The SQL dialect this client speaks.
    fn dialect(&self) -> Dialect;

    /// Execute a single statement, returning the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError>;

    /// Execute several `;`-separated statements as one batch.
    async fn batch_execute(&self, sql: &str) -> Result<(), WarehouseError>;

    /// Execute a statement with string bind parameters.
    async fn execute_with(&self, sql: &str, params: &[&str]) -> Result<u64, WarehouseError>;

    /// Run a query with string bind parameters, returning rows of nullable
    /// string columns.
    async fn query_with(
        &self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, WarehouseError>;

    /// Open a transaction.
    async fn begin(&self) -> Result<(), WarehouseError> {
        self.execute("BEGIN").await.map(|_| ())
    }

    /// Commit the open transaction.
    async fn commit(&self) -> Result<(), WarehouseError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    /// Roll back the open transaction.
    async fn rollback(&self) -> Result<(), WarehouseError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Bulk-load the files named by a manifest into `table`.
    async fn copy_from_manifest(
        &self,
        table: &str,
        manifest_url: &str,
        jsonpaths_url: &str,
    ) -> Result<u64, WarehouseError> {
        let sql = self
            .dialect()
            .copy_from_manifest(table, manifest_url, jsonpaths_url);
        self.execute(&sql).await
    }

    /// List table names starting with `prefix`, sorted ascending.
    async fn list_tables_with_prefix(&self, prefix: &str) -> Result<Vec<String>, WarehouseError> {
        let dialect = self.dialect();
        let pattern = format!("{}%", dialect.escape_like(prefix));
        let sql = dialect.list_tables_sql();
        let rows = self.query_with(&sql, &[&pattern]).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row
                .first()
                .and_then(|c| c.clone())
                .ok_or_else(|| WarehouseError::RowDecode { query: sql.clone() })?;
            tables.push(name);
        }
        Ok(tables)
    }

    /// Describe a table's columns in ordinal position order.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, WarehouseError> {
        let sql = self.dialect().describe_table_sql();
        let rows = self.query_with(&sql, &[table]).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            match row.as_slice() {
                [Some(name), Some(data_type), Some(nullable)] => columns.push(ColumnInfo {
                    name: name.clone(),
                    data_type: data_type.clone(),
                    nullable: nullable.eq_ignore_ascii_case("yes"),
                }),
                _ => return Err(WarehouseError::RowDecode { query: sql.clone() }),
            }
        }
        Ok(columns)
    }
}
