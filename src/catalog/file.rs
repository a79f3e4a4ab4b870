//! Data-file descriptors parsed from object keys.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use snafu::prelude::*;

use crate::error::{CatalogError, MalformedKeySnafu};

/// A time-partitioned data file in the object store.
///
/// Parsed from keys of the form `<type>/d=<yyyy-MM-dd>/h=<HH>/<name>.<ext>`
/// (relative to the storage root). Immutable once parsed; [`DataFile::id`] is
/// the idempotency key recorded in the import ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub type_name: String,
    pub bucket_date: NaiveDate,
    pub bucket_hour: u32,
    pub name: String,
    pub ext: String,
    /// Last-modified time from the object store; orders files within a
    /// bucket and decides "latest" for snapshot types.
    pub timestamp: DateTime<Utc>,
    /// Object key relative to the storage root.
    pub key: String,
}

impl DataFile {
    /// Parse an object key into a descriptor.
    ///
    /// Keys that do not follow the path convention are rejected with a
    /// descriptive error, never silently skipped.
    pub fn parse(key: &str, last_modified: DateTime<Utc>) -> Result<Self, CatalogError> {
        let segments: Vec<&str> = key.split('/').collect();
        let [type_name, date_segment, hour_segment, filename] = segments.as_slice() else {
            return MalformedKeySnafu {
                key,
                reason: "expected <type>/d=<date>/h=<hour>/<file>",
            }
            .fail();
        };

        ensure!(
            !type_name.is_empty(),
            MalformedKeySnafu {
                key,
                reason: "empty type segment",
            }
        );

        let date_value = date_segment.strip_prefix("d=").context(MalformedKeySnafu {
            key,
            reason: "second segment must be d=<yyyy-MM-dd>",
        })?;
        let bucket_date = NaiveDate::parse_from_str(date_value, "%Y-%m-%d")
            .ok()
            .context(MalformedKeySnafu {
                key,
                reason: "unparseable date",
            })?;

        let hour_value = hour_segment.strip_prefix("h=").context(MalformedKeySnafu {
            key,
            reason: "third segment must be h=<HH>",
        })?;
        let bucket_hour: u32 = hour_value.parse().ok().context(MalformedKeySnafu {
            key,
            reason: "unparseable hour",
        })?;
        ensure!(
            hour_value.len() == 2 && bucket_hour <= 23,
            MalformedKeySnafu {
                key,
                reason: "hour must be 00..23",
            }
        );

        let (name, ext) = split_extension(filename).context(MalformedKeySnafu {
            key,
            reason: "file must have a name and extension",
        })?;

        Ok(Self {
            type_name: type_name.to_string(),
            bucket_date,
            bucket_hour,
            name: name.to_string(),
            ext: ext.to_string(),
            timestamp: last_modified,
            key: key.to_string(),
        })
    }

    /// Deterministic idempotency key: `<yyyyMMdd><HH>-<type>-<name>`.
    ///
    /// The fixed-width time prefix makes ids sort chronologically, which the
    /// ledger exploits for range queries.
    pub fn id(&self) -> String {
        format!(
            "{}{:02}-{}-{}",
            self.bucket_date.format("%Y%m%d"),
            self.bucket_hour,
            self.type_name,
            self.name
        )
    }

    /// Start of the hour bucket this file belongs to.
    pub fn bucket_start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &self
                .bucket_date
                .and_hms_opt(self.bucket_hour, 0, 0)
                .expect("validated hour is in range"),
        )
    }
}

/// Split a filename into (name, extension), honoring compound `.gz` suffixes:
/// `data.json.gz` -> ("data", "json.gz"), `m1.a1b2.avro` -> ("m1.a1b2", "avro").
fn split_extension(filename: &str) -> Option<(&str, &str)> {
    let (stem, last) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    if last == "gz" {
        if let Some((name, _)) = stem.rsplit_once('.')
            && !name.is_empty()
        {
            return Some((name, &filename[name.len() + 1..]));
        }
    }
    Some((stem, last))
}
