//! Time buckets and chunk arithmetic.
//!
//! All engine APIs take hour-resolution `[from, to]` bounds where both ends
//! are inclusive; the exclusive end of a range is `to` plus one hour (or one
//! bucket, at the ledger boundary). Bucket keys are fixed-width strings so
//! that lexicographic order equals chronological order.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TimeParseSnafu};
use snafu::prelude::*;

/// Bucket granularity for a partitioned type.
///
/// Immutable for the process lifetime; the bucket-key format is fixed per
/// granularity and becomes part of physical table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Granularity {
    /// Format the bucket key for the bucket containing `t`.
    ///
    /// Weekly keys use the ISO week and ISO week-based year so buckets at
    /// year boundaries do not collide.
    pub fn bucket_key(&self, t: DateTime<Utc>) -> String {
        match self {
            Granularity::Hourly => t.format("%Y%m%d%H").to_string(),
            Granularity::Daily => t.format("%Y%m%d").to_string(),
            Granularity::Weekly => t.format("%G%V").to_string(),
            Granularity::Monthly => t.format("%Y%m").to_string(),
            Granularity::Yearly => t.format("%Y").to_string(),
        }
    }

    /// Truncate `t` to the start of its bucket.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let hour = truncate_to_hour(t);
        match self {
            Granularity::Hourly => hour,
            Granularity::Daily => start_of_day(hour.date_naive()),
            Granularity::Weekly => {
                let date = hour.date_naive();
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                start_of_day(monday)
            }
            Granularity::Monthly => {
                start_of_day(hour.date_naive().with_day(1).expect("day 1 is valid"))
            }
            Granularity::Yearly => {
                let date = hour.date_naive();
                start_of_day(NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("jan 1 is valid"))
            }
        }
    }

    /// The start of the bucket after the one containing `t`.
    pub fn next_bucket(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.truncate(t);
        match self {
            Granularity::Hourly => start + Duration::hours(1),
            Granularity::Daily => start + Duration::days(1),
            Granularity::Weekly => start + Duration::days(7),
            Granularity::Monthly => start + Months::new(1),
            Granularity::Yearly => start + Months::new(12),
        }
    }

    /// Bucket start times covering the inclusive range `[from, to]`.
    pub fn buckets_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut buckets = Vec::new();
        let mut cursor = self.truncate(from);
        while cursor <= to {
            buckets.push(cursor);
            cursor = self.next_bucket(cursor);
        }
        buckets
    }
}

/// Chunk granularity for splitting a load range into transactional units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunking {
    #[default]
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// Process the whole requested range as a single chunk.
    Disable,
}

impl Chunking {
    fn granularity(&self) -> Option<Granularity> {
        match self {
            Chunking::Hourly => Some(Granularity::Hourly),
            Chunking::Daily => Some(Granularity::Daily),
            Chunking::Weekly => Some(Granularity::Weekly),
            Chunking::Monthly => Some(Granularity::Monthly),
            Chunking::Disable => None,
        }
    }

    /// First hour of the chunk containing `t` (identity for `Disable`).
    pub fn chunk_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.granularity() {
            Some(g) => g.truncate(t),
            None => truncate_to_hour(t),
        }
    }

    /// Last hour of the chunk containing `t` (identity for `Disable`).
    pub fn chunk_end(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.granularity() {
            Some(g) => g.next_bucket(t) - Duration::hours(1),
            None => truncate_to_hour(t),
        }
    }

    /// Subtract `units` chunks from `t` (hours for `Disable`).
    pub fn subtract(&self, t: DateTime<Utc>, units: u32) -> DateTime<Utc> {
        match self {
            Chunking::Hourly | Chunking::Disable => t - Duration::hours(units as i64),
            Chunking::Daily => t - Duration::days(units as i64),
            Chunking::Weekly => t - Duration::days(7 * units as i64),
            Chunking::Monthly => t - Months::new(units),
        }
    }

    /// Split the inclusive range `[from, to]` into chunks, ascending.
    ///
    /// The first and last chunks may be partial; every other chunk spans a
    /// full granularity unit. `Disable` yields the whole range as one chunk.
    pub fn split(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<TimeChunk> {
        let from = truncate_to_hour(from);
        let to = truncate_to_hour(to);
        if to < from {
            return Vec::new();
        }
        let Some(granularity) = self.granularity() else {
            return vec![TimeChunk { from, to }];
        };

        let mut chunks = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            let bucket_last = granularity.next_bucket(cursor) - Duration::hours(1);
            let chunk_to = bucket_last.min(to);
            chunks.push(TimeChunk {
                from: cursor,
                to: chunk_to,
            });
            cursor = chunk_to + Duration::hours(1);
        }
        chunks
    }
}

/// A `[from, to]` hour-resolution sub-range, the unit of transactional
/// atomicity for the load orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeChunk {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeChunk {
    /// The exclusive end of this chunk.
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        self.to + Duration::hours(1)
    }
}

/// Truncate to the start of the hour.
pub fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-hour fields is valid")
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

/// Parse a CLI time argument of the form `yyyy-MM-dd:HH` into an hour start.
pub fn parse_hour_arg(input: &str) -> Result<DateTime<Utc>, ConfigError> {
    let naive = chrono::NaiveDateTime::parse_from_str(&format!("{input}:00"), "%Y-%m-%d:%H:%M")
        .ok()
        .context(TimeParseSnafu { input })?;
    Ok(Utc.from_utc_datetime(&naive))
}
