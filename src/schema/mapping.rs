//! Column-mapping artifacts.
//!
//! A mapping file tells the bulk-copy step how source record fields line up
//! with destination columns positionally. One JSON artifact per mapped
//! table, shaped `{"jsonpaths": ["$.field1", "$.field2", ...]}`, written to
//! the configured mappings directory and referenced by COPY statements.

use serde::{Deserialize, Serialize};

use crate::warehouse::ColumnInfo;

/// Ordered source-field paths for one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub jsonpaths: Vec<String>,
}

impl ColumnMapping {
    /// Build a mapping from a table's columns in ordinal order.
    ///
    /// Destination column order is the authority: `$.{column}` per column,
    /// which stays correct after any `ADD COLUMN` because mappings are
    /// regenerated whenever DDL changes.
    pub fn from_columns(columns: &[ColumnInfo]) -> Self {
        Self {
            jsonpaths: columns.iter().map(|c| format!("$.{}", c.name)).collect(),
        }
    }

    /// Artifact path for a table under the mappings directory.
    pub fn artifact_path(mappings_dir: &str, table: &str) -> String {
        format!("{mappings_dir}/{table}.json")
    }
}
