//! Emulated time-bucket partitioning.
//!
//! The warehouse has no native partitioning, so each partitioned type is
//! spread over physical bucket tables named `<type>_partition_<bucketKey>`,
//! unioned behind a view carrying the type's name. This module owns every
//! structural mutation: bucket creation (structural clones of the canonical
//! table), view rebuilds, and eviction. The load orchestrator only ever
//! issues DML, which keeps structural and data changes from racing.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TypeConfig;
use crate::emit;
use crate::error::{PartitionError, PartitionWarehouseSnafu, RetentionWindowTooSmallSnafu};
use crate::metrics::events::{BucketTablesCreated, BucketTablesDropped};
use crate::time::Granularity;
use crate::warehouse::Warehouse;

/// Suffix separating a type name from its bucket key in physical table names.
const PARTITION_INFIX: &str = "_partition_";

/// The changes one partitioning pass will make for a type.
///
/// Computed in full, and guarded, before anything touches the warehouse so a
/// configuration error performs no partial mutation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Bucket keys to create, ascending.
    pub to_add: Vec<String>,
    /// Bucket keys to evict, ascending.
    pub to_remove: Vec<String>,
    /// Bucket keys retained after the pass, ascending; the union view lists
    /// exactly these.
    pub retained: Vec<String>,
}

impl PartitionPlan {
    /// Whether this pass changes nothing.
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute the partitioning plan for one type.
///
/// `existing` and `needed` are bucket keys; keys are fixed-width per
/// granularity, so lexicographic order is chronological order.
pub fn plan_buckets(
    type_name: &str,
    existing: &[String],
    needed: &[String],
    retained_buckets: usize,
) -> Result<PartitionPlan, PartitionError> {
    let existing_set: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    let to_add: Vec<String> = needed
        .iter()
        .filter(|key| !existing_set.contains(key.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut all: Vec<String> = existing
        .iter()
        .chain(needed.iter())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    all.reverse();

    let to_remove: Vec<String> = all
        .iter()
        .skip(retained_buckets)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let overlap: Vec<String> = to_add
        .iter()
        .filter(|key| to_remove.binary_search(key).is_ok())
        .cloned()
        .collect();
    ensure!(
        overlap.is_empty(),
        RetentionWindowTooSmallSnafu {
            type_name,
            buckets: overlap,
        }
    );

    let retained: Vec<String> = all.into_iter().take(retained_buckets).rev().collect();

    Ok(PartitionPlan {
        to_add,
        to_remove,
        retained,
    })
}

/// Parse a bucket key back into the bucket's start time.
pub fn parse_bucket_key(granularity: Granularity, key: &str) -> Option<DateTime<Utc>> {
    let date = |y: i32, m: u32, d: u32| {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    };
    match granularity {
        Granularity::Hourly => {
            if key.len() != 10 {
                return None;
            }
            let t = date(key[0..4].parse().ok()?, key[4..6].parse().ok()?, key[6..8].parse().ok()?)?;
            let hour: i64 = key[8..10].parse().ok()?;
            (hour < 24).then(|| t + chrono::Duration::hours(hour))
        }
        Granularity::Daily => {
            if key.len() != 8 {
                return None;
            }
            date(key[0..4].parse().ok()?, key[4..6].parse().ok()?, key[6..8].parse().ok()?)
        }
        Granularity::Weekly => {
            if key.len() != 6 {
                return None;
            }
            let year: i32 = key[0..4].parse().ok()?;
            let week: u32 = key[4..6].parse().ok()?;
            NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Granularity::Monthly => {
            if key.len() != 6 {
                return None;
            }
            date(key[0..4].parse().ok()?, key[4..6].parse().ok()?, 1)
        }
        Granularity::Yearly => {
            if key.len() != 4 {
                return None;
            }
            date(key.parse().ok()?, 1, 1)
        }
    }
}

/// Manages bucket tables and union views for partitioned types.
pub struct PartitionManager {
    warehouse: Arc<dyn Warehouse>,
}

impl PartitionManager {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Physical table-name prefix for a type's bucket tables.
    pub fn bucket_prefix(type_name: &str) -> String {
        format!("{type_name}{PARTITION_INFIX}")
    }

    /// Physical table name for a bucket key.
    pub fn bucket_table(type_name: &str, bucket_key: &str) -> String {
        format!("{type_name}{PARTITION_INFIX}{bucket_key}")
    }

    /// The canonical table carrying a type's authoritative structure.
    ///
    /// A partitioned type's union view takes the type name, and views and
    /// tables share a namespace, so the canonical table of a partitioned
    /// type lives under `<type>_template`. Bucket tables are cloned from it
    /// and DDL replication targets it first.
    pub fn canonical_table(type_config: &TypeConfig) -> String {
        if type_config.is_partitioned() {
            format!("{}_template", type_config.name)
        } else {
            type_config.name.clone()
        }
    }

    /// Destination table for a file landing at `hour`: the matching bucket
    /// table for partitioned types, the canonical table otherwise.
    pub fn table_for(type_config: &TypeConfig, hour: DateTime<Utc>) -> String {
        match &type_config.partitioning {
            Some(partitioning) => Self::bucket_table(
                &type_config.name,
                &partitioning.granularity.bucket_key(hour),
            ),
            None => type_config.name.clone(),
        }
    }

    /// Bucket keys of the currently-existing bucket tables for a type,
    /// ascending. Tables with unparseable suffixes are skipped with a
    /// warning rather than evicted.
    pub async fn existing_buckets(
        &self,
        type_name: &str,
        granularity: Granularity,
    ) -> Result<Vec<String>, PartitionError> {
        let prefix = Self::bucket_prefix(type_name);
        let tables = self
            .warehouse
            .list_tables_with_prefix(&prefix)
            .await
            .context(PartitionWarehouseSnafu)?;

        let mut keys = Vec::with_capacity(tables.len());
        for table in tables {
            let key = table[prefix.len()..].to_string();
            if parse_bucket_key(granularity, &key).is_some() {
                keys.push(key);
            } else {
                warn!("Ignoring table '{table}' with unparseable bucket suffix");
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Ensure bucket tables and union views match `[from, to]` for every
    /// partitioned type in `types`, evicting buckets past each type's
    /// retention window.
    pub async fn partition(
        &self,
        types: &[TypeConfig],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), PartitionError> {
        self.partition_at(types, from, to, Utc::now()).await
    }

    /// [`Self::partition`] with an explicit clock.
    pub async fn partition_at(
        &self,
        types: &[TypeConfig],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), PartitionError> {
        for type_config in types {
            let Some(partitioning) = &type_config.partitioning else {
                continue;
            };

            let existing = self
                .existing_buckets(&type_config.name, partitioning.granularity)
                .await?;

            // Buckets wholly in the future are never created.
            let needed: Vec<String> = partitioning
                .granularity
                .buckets_between(from, to)
                .into_iter()
                .filter(|bucket| *bucket <= now)
                .map(|bucket| partitioning.granularity.bucket_key(bucket))
                .collect();

            let plan = plan_buckets(
                &type_config.name,
                &existing,
                &needed,
                partitioning.retained_buckets,
            )?;

            if plan.is_noop() {
                debug!("Partitions for '{}' already current", type_config.name);
                continue;
            }
            self.apply(type_config, &plan).await?;
        }
        Ok(())
    }

    /// Apply a computed plan: create new buckets, rebuild the union view
    /// over the retained set, then drop evicted buckets. The view is rebuilt
    /// before any drop so it never references a dropped table.
    async fn apply(
        &self,
        type_config: &TypeConfig,
        plan: &PartitionPlan,
    ) -> Result<(), PartitionError> {
        let dialect = self.warehouse.dialect();
        let type_name = &type_config.name;
        let canonical = Self::canonical_table(type_config);

        for key in &plan.to_add {
            let table = Self::bucket_table(type_name, key);
            self.warehouse
                .execute(&dialect.create_table_like(&table, &canonical))
                .await
                .context(PartitionWarehouseSnafu)?;
        }
        if !plan.to_add.is_empty() {
            emit!(BucketTablesCreated {
                count: plan.to_add.len() as u64,
            });
        }

        self.rebuild_view(type_name, &plan.retained).await?;

        for key in &plan.to_remove {
            let table = Self::bucket_table(type_name, key);
            self.warehouse
                .execute(&dialect.drop_table(&table))
                .await
                .context(PartitionWarehouseSnafu)?;
        }
        if !plan.to_remove.is_empty() {
            emit!(BucketTablesDropped {
                count: plan.to_remove.len() as u64,
            });
        }

        info!(
            "Partitioned '{}': +{} buckets, -{} buckets, {} retained",
            type_name,
            plan.to_add.len(),
            plan.to_remove.len(),
            plan.retained.len()
        );
        Ok(())
    }

    /// Rebuild the union view for a type from its current bucket tables.
    pub async fn recreate_view(&self, type_config: &TypeConfig) -> Result<(), PartitionError> {
        let Some(partitioning) = &type_config.partitioning else {
            return Ok(());
        };
        let keys = self
            .existing_buckets(&type_config.name, partitioning.granularity)
            .await?;
        self.rebuild_view(&type_config.name, &keys).await
    }

    async fn rebuild_view(&self, type_name: &str, keys: &[String]) -> Result<(), PartitionError> {
        let dialect = self.warehouse.dialect();
        if keys.is_empty() {
            self.warehouse
                .execute(&dialect.drop_view(type_name))
                .await
                .context(PartitionWarehouseSnafu)?;
            return Ok(());
        }
        let tables: Vec<String> = keys
            .iter()
            .map(|key| Self::bucket_table(type_name, key))
            .collect();
        self.warehouse
            .execute(&dialect.create_union_view(type_name, &tables))
            .await
            .context(PartitionWarehouseSnafu)?;
        Ok(())
    }
}
