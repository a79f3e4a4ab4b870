//! SQL dialect strategies.
//!
//! The engine supports two warehouse families: MySQL-style (Aurora) and
//! Redshift-style. Structural DDL, metadata queries, bulk-copy statements,
//! and identifier quoting differ between them; everything else is shared.
//!
//! Identifiers interpolated into SQL text always pass through
//! [`Dialect::quote_ident`] and originate from trusted configuration or from
//! the warehouse's own metadata, never from user input.

use serde::{Deserialize, Serialize};

/// Warehouse SQL dialect family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// MySQL-family warehouses (Aurora).
    Mysql,
    /// Redshift-family warehouses (Redshift, Postgres-compatible).
    #[default]
    Redshift,
}

impl Dialect {
    /// Quote an identifier, doubling any embedded quote characters.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Redshift => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Escape LIKE-pattern wildcards in a literal fragment.
    ///
    /// Both families treat backslash as the default LIKE escape character.
    pub fn escape_like(&self, fragment: &str) -> String {
        fragment
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_")
    }

    /// Placeholder for the `n`th bind parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Mysql => "?".to_string(),
            Dialect::Redshift => format!("${n}"),
        }
    }

    /// A timestamp literal for data-table range predicates.
    pub fn timestamp_literal(&self, t: chrono::DateTime<chrono::Utc>) -> String {
        format!("'{}'", t.format("%Y-%m-%d %H:%M:%S"))
    }

    /// Create `table` as a structural clone of `template`.
    pub fn create_table_like(&self, table: &str, template: &str) -> String {
        let table = self.quote_ident(table);
        let template = self.quote_ident(template);
        match self {
            Dialect::Mysql => format!("CREATE TABLE {table} LIKE {template}"),
            Dialect::Redshift => format!("CREATE TABLE {table} (LIKE {template})"),
        }
    }

    /// Drop a table if it exists.
    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_ident(table))
    }

    /// Create or replace a view unioning `tables`, in the given order.
    pub fn create_union_view(&self, view: &str, tables: &[String]) -> String {
        let selects: Vec<String> = tables
            .iter()
            .map(|t| format!("SELECT * FROM {}", self.quote_ident(t)))
            .collect();
        format!(
            "CREATE OR REPLACE VIEW {} AS {}",
            self.quote_ident(view),
            selects.join(" UNION ALL ")
        )
    }

    /// Drop a view if it exists.
    pub fn drop_view(&self, view: &str) -> String {
        format!("DROP VIEW IF EXISTS {}", self.quote_ident(view))
    }

    /// Metadata query returning table names matching a LIKE pattern, sorted.
    ///
    /// Takes one bind parameter: the (pre-escaped) pattern.
    pub fn list_tables_sql(&self) -> String {
        match self {
            Dialect::Mysql => format!(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name LIKE {} \
                 ORDER BY table_name",
                self.placeholder(1)
            ),
            Dialect::Redshift => format!(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name LIKE {} \
                 ORDER BY table_name",
                self.placeholder(1)
            ),
        }
    }

    /// Metadata query returning (column_name, data_type, is_nullable) for a
    /// table in ordinal position order. Takes one bind parameter: the table.
    pub fn describe_table_sql(&self) -> String {
        match self {
            Dialect::Mysql => format!(
                "SELECT column_name, data_type, is_nullable \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = {} \
                 ORDER BY ordinal_position",
                self.placeholder(1)
            ),
            Dialect::Redshift => format!(
                "SELECT column_name, data_type, is_nullable \
                 FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = {} \
                 ORDER BY ordinal_position",
                self.placeholder(1)
            ),
        }
    }

    /// Bulk-copy statement loading a manifest of object URLs into `table`.
    pub fn copy_from_manifest(
        &self,
        table: &str,
        manifest_url: &str,
        jsonpaths_url: &str,
    ) -> String {
        let table = self.quote_ident(table);
        match self {
            Dialect::Mysql => {
                format!("LOAD DATA FROM S3 MANIFEST '{manifest_url}' INTO TABLE {table}")
            }
            Dialect::Redshift => format!(
                "COPY {table} FROM '{manifest_url}' MANIFEST \
                 FORMAT AS JSON '{jsonpaths_url}' TIMEFORMAT 'auto'"
            ),
        }
    }
}
