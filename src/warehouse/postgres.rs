//! Redshift-family warehouse client over the postgres wire protocol.

use async_trait::async_trait;
use snafu::prelude::*;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::error;

use crate::error::{ConnectSnafu, ExecuteSnafu, WarehouseError};

use super::{Dialect, Warehouse};

/// Warehouse client backed by `tokio-postgres`.
///
/// Redshift speaks the postgres wire protocol, so this client serves both
/// Redshift proper and plain Postgres targets. The connection driver runs in
/// a background task for the lifetime of the client.
pub struct PostgresWarehouse {
    client: tokio_postgres::Client,
    dialect: Dialect,
}

impl PostgresWarehouse {
    /// Connect with a libpq-style connection string.
    pub async fn connect(connstr: &str, dialect: Dialect) -> Result<Self, WarehouseError> {
        let (client, connection) = tokio_postgres::connect(connstr, NoTls)
            .await
            .context(ConnectSnafu)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Warehouse connection error: {e}");
            }
        });

        Ok(Self { client, dialect })
    }

    fn bind<'a>(params: &'a [&'a str]) -> Vec<&'a (dyn ToSql + Sync)> {
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        self.client
            .execute(sql, &[])
            .await
            .context(ExecuteSnafu { sql })
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), WarehouseError> {
        self.client
            .batch_execute(sql)
            .await
            .context(ExecuteSnafu { sql })
    }

    async fn execute_with(&self, sql: &str, params: &[&str]) -> Result<u64, WarehouseError> {
        self.client
            .execute(sql, &Self::bind(params))
            .await
            .context(ExecuteSnafu { sql })
    }

    async fn query_with(
        &self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, WarehouseError> {
        let rows = self
            .client
            .query(sql, &Self::bind(params))
            .await
            .context(ExecuteSnafu { sql })?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let mut columns = Vec::with_capacity(row.len());
            for index in 0..row.len() {
                let value: Option<String> =
                    row.try_get(index)
                        .map_err(|_| WarehouseError::RowDecode {
                            query: sql.to_string(),
                        })?;
                columns.push(value);
            }
            result.push(columns);
        }
        Ok(result)
    }
}
