//! File catalog: discovery of time-partitioned data files.
//!
//! Lists a type's object-store directory for a time window and parses every
//! key into a [`DataFile`]. Windows spanning full calendar days are listed
//! one day per worker with bounded concurrency; partial leading and trailing
//! hour spans are listed hour by hour and merged. Ordering is imposed after
//! the merge by an explicit sort.

mod file;

pub use file::DataFile;

use chrono::{DateTime, Duration, Timelike, Utc};
use futures::StreamExt;
use futures::stream;
use snafu::prelude::*;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{CatalogError, CatalogStorageSnafu};
use crate::storage::StorageProviderRef;
use crate::time::truncate_to_hour;

/// Maximum concurrent listing workers.
const MAX_LIST_WORKERS: usize = 20;

/// Read-only catalog over the object store's data directory.
pub struct FileCatalog {
    storage: StorageProviderRef,
}

impl FileCatalog {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// List all data files for `type_name` with bucket hours in `[from, to]`,
    /// sorted ascending by timestamp.
    pub async fn list(
        &self,
        type_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataFile>, CatalogError> {
        let prefixes = list_prefixes(type_name, from, to);
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let workers = prefixes.len().min(MAX_LIST_WORKERS);
        debug!(
            "Listing {} prefixes for type '{}' with {} workers",
            prefixes.len(),
            type_name,
            workers
        );

        let mut listings = stream::iter(prefixes)
            .map(|prefix| {
                let storage = self.storage.clone();
                async move { storage.list_prefix(&prefix).await }
            })
            .buffer_unordered(workers);

        let mut files = Vec::new();
        while let Some(listed) = listings.next().await {
            for object in listed.context(CatalogStorageSnafu)? {
                files.push(DataFile::parse(&object.key, object.last_modified)?);
            }
        }

        files.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id().cmp(&b.id())));
        Ok(files)
    }

    /// Like [`Self::list`], minus files whose ids are already in the ledger.
    ///
    /// The ascending timestamp order of the result determines bucket-table
    /// creation order and, for snapshot types, which file is "latest".
    pub async fn list_new(
        &self,
        type_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        ledger_ids: &HashSet<String>,
    ) -> Result<Vec<DataFile>, CatalogError> {
        let mut files = self.list(type_name, from, to).await?;
        files.retain(|f| !ledger_ids.contains(&f.id()));
        Ok(files)
    }
}

/// Compute the listing prefixes covering `[from, to]` exactly: whole-day
/// prefixes where the window spans a full calendar day, hour prefixes at the
/// ragged edges.
fn list_prefixes(type_name: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut cursor = truncate_to_hour(from);
    let to = truncate_to_hour(to);

    while cursor <= to {
        let remaining_hours = (to - cursor).num_hours() + 1;
        if cursor.hour() == 0 && remaining_hours >= 24 {
            prefixes.push(format!("{}/d={}", type_name, cursor.format("%Y-%m-%d")));
            cursor += Duration::hours(24);
        } else {
            prefixes.push(format!(
                "{}/d={}/h={:02}",
                type_name,
                cursor.format("%Y-%m-%d"),
                cursor.hour()
            ));
            cursor += Duration::hours(1);
        }
    }
    prefixes
}
