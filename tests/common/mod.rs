//! Shared test fixtures: an in-memory warehouse fake.
//!
//! The fake interprets exactly the statements the engine issues (structural
//! DDL, ledger DML, metadata queries, COPY) against in-memory state, with
//! snapshot-based transactions so rollback semantics match a real warehouse.

use async_trait::async_trait;
use snowdrift::error::WarehouseError;
use snowdrift::warehouse::{Dialect, Warehouse};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Committed + staged warehouse state.
#[derive(Debug, Clone, Default)]
pub struct WarehouseState {
    /// table -> columns as (name, data_type).
    pub tables: BTreeMap<String, Vec<(String, String)>>,
    /// view -> unioned tables, in order.
    pub views: BTreeMap<String, Vec<String>>,
    /// Applied ALTER statements as (table, rest).
    pub alters: Vec<(String, String)>,
    /// Committed COPY operations as (table, manifest_url).
    pub loads: Vec<(String, String)>,
    /// import_ledger rows as (filename, tablename, etl_tstamp).
    pub import_ledger: Vec<(String, String, String)>,
    /// ddl_ledger rows as (file, ddl_text, applied_at).
    pub ddl_ledger: Vec<(String, String, String)>,
    /// Executed statement log (committed or not).
    pub sql_log: Vec<String>,
}

struct Inner {
    state: WarehouseState,
    /// Snapshot taken at BEGIN, restored on ROLLBACK.
    snapshot: Option<WarehouseState>,
    /// Inject failures: statements containing the substring fail while the
    /// countdown is positive.
    fail_on: Option<(String, usize)>,
}

pub struct FakeWarehouse {
    inner: Mutex<Inner>,
}

impl Default for FakeWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: WarehouseState::default(),
                snapshot: None,
                fail_on: None,
            }),
        }
    }

    /// Seed a table with columns.
    pub fn with_table(self, name: &str, columns: &[&str]) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state.tables.insert(
                name.to_string(),
                columns
                    .iter()
                    .map(|c| (c.to_string(), "varchar".to_string()))
                    .collect(),
            );
        }
        self
    }

    /// Fail the next `times` statements containing `substring`.
    pub fn fail_on(&self, substring: &str, times: usize) {
        self.inner.lock().unwrap().fail_on = Some((substring.to_string(), times));
    }

    /// Snapshot of committed state for assertions.
    pub fn state(&self) -> WarehouseState {
        self.inner.lock().unwrap().state.clone()
    }

    fn check_injected_failure(inner: &mut Inner, sql: &str) -> Result<(), WarehouseError> {
        if let Some((substring, remaining)) = &mut inner.fail_on {
            if *remaining > 0 && sql.contains(substring.as_str()) {
                *remaining -= 1;
                return Err(WarehouseError::ConnectionLost);
            }
        }
        Ok(())
    }

    fn apply(inner: &mut Inner, sql: &str, params: &[&str]) -> Result<u64, WarehouseError> {
        Self::check_injected_failure(inner, sql)?;
        inner.state.sql_log.push(sql.to_string());

        match sql {
            "BEGIN" => {
                inner.snapshot = Some(inner.state.clone());
                return Ok(0);
            }
            "COMMIT" => {
                inner.snapshot = None;
                return Ok(0);
            }
            "ROLLBACK" => {
                if let Some(snapshot) = inner.snapshot.take() {
                    let sql_log = inner.state.sql_log.clone();
                    inner.state = snapshot;
                    inner.state.sql_log = sql_log;
                }
                return Ok(0);
            }
            _ => {}
        }

        let state = &mut inner.state;
        if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
            // init bootstrap; ledger tables are implicit here.
        } else if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            // CREATE TABLE "x" (LIKE "y")
            let table = unquote(rest.split_whitespace().next().unwrap());
            let template = unquote(
                rest.trim_end_matches(')')
                    .rsplit("(LIKE ")
                    .next()
                    .unwrap()
                    .trim_end_matches(')'),
            );
            let columns = state.tables.get(&template).cloned().unwrap_or_default();
            state.tables.insert(table, columns);
        } else if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            state.tables.remove(&unquote(rest.trim()));
        } else if let Some(rest) = sql.strip_prefix("CREATE OR REPLACE VIEW ") {
            let (view, body) = rest.split_once(" AS ").unwrap();
            let tables: Vec<String> = body
                .split(" UNION ALL ")
                .map(|select| unquote(select.trim().strip_prefix("SELECT * FROM ").unwrap()))
                .collect();
            state.views.insert(unquote(view), tables);
        } else if let Some(rest) = sql.strip_prefix("DROP VIEW IF EXISTS ") {
            state.views.remove(&unquote(rest.trim()));
        } else if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
            let (table, alteration) = rest.split_once(' ').unwrap();
            let table = unquote(table);
            if !state.tables.contains_key(&table) {
                return Err(WarehouseError::ConnectionLost);
            }
            if let Some(column_spec) = alteration.strip_prefix("ADD COLUMN ") {
                let mut parts = column_spec.split_whitespace();
                let column = parts.next().unwrap().to_string();
                let data_type = parts.next().unwrap_or("varchar").to_lowercase();
                state
                    .tables
                    .get_mut(&table)
                    .unwrap()
                    .push((column, data_type));
            }
            state.alters.push((table, alteration.to_string()));
        } else if let Some(rest) = sql.strip_prefix("COPY ") {
            let table = unquote(rest.split_whitespace().next().unwrap());
            let manifest_url = rest.split('\'').nth(1).unwrap_or("").to_string();
            state.loads.push((table, manifest_url));
        } else if sql.starts_with("INSERT INTO import_ledger") {
            for row in params.chunks(3) {
                state
                    .import_ledger
                    .push((row[0].into(), row[1].into(), row[2].into()));
            }
            return Ok((params.len() / 3) as u64);
        } else if sql.starts_with("INSERT INTO ddl_ledger") {
            state
                .ddl_ledger
                .push((params[0].into(), params[1].into(), params[2].into()));
            return Ok(1);
        } else if sql.starts_with("DELETE FROM import_ledger") {
            let before = state.import_ledger.len();
            let keep = |filename: &str| !ledger_predicate(sql, params, filename);
            state.import_ledger.retain(|(filename, _, _)| keep(filename));
            return Ok((before - state.import_ledger.len()) as u64);
        } else if sql.starts_with("DELETE FROM ") {
            // Data-table deletes: nothing row-level to simulate; the log is
            // the assertion surface.
        } else {
            panic!("FakeWarehouse cannot interpret: {sql}");
        }
        Ok(0)
    }
}

/// Evaluate the WHERE clause of an import-ledger DELETE against a filename.
fn ledger_predicate(sql: &str, params: &[&str], filename: &str) -> bool {
    let mut next = 0;
    let mut matched = true;
    if sql.contains("filename >= ") {
        matched &= filename >= params[next];
        next += 1;
    }
    if sql.contains("filename < ") {
        matched &= filename < params[next];
        next += 1;
    }
    if sql.contains("filename LIKE ") {
        matched &= like_match(params[next], filename);
    }
    matched
}

/// Minimal LIKE evaluator: `%` any run, `_` any char, `\` escapes.
pub fn like_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('%') => (0..=t.len()).any(|skip| inner(&p[1..], &t[skip..])),
            Some('_') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some('\\') => {
                p.len() > 1 && !t.is_empty() && t[0] == p[1] && inner(&p[2..], &t[1..])
            }
            Some(c) => !t.is_empty() && t[0] == *c && inner(&p[1..], &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

fn unquote(ident: &str) -> String {
    ident.trim_matches(|c| c == '"' || c == '`').to_string()
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::Redshift
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        FakeWarehouse::apply(&mut inner, sql, &[])
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            FakeWarehouse::apply(&mut inner, statement, &[])?;
        }
        Ok(())
    }

    async fn execute_with(&self, sql: &str, params: &[&str]) -> Result<u64, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        FakeWarehouse::apply(&mut inner, sql, params)
    }

    async fn query_with(
        &self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        FakeWarehouse::check_injected_failure(&mut inner, sql)?;
        let state = &inner.state;

        if sql.starts_with("SELECT filename FROM import_ledger") {
            let (low, high) = (params[0], params[1]);
            return Ok(state
                .import_ledger
                .iter()
                .filter(|(filename, _, _)| filename.as_str() >= low && filename.as_str() < high)
                .map(|(filename, _, _)| vec![Some(filename.clone())])
                .collect());
        }
        if sql.starts_with("SELECT file FROM ddl_ledger") {
            return Ok(state
                .ddl_ledger
                .iter()
                .map(|(file, _, _)| vec![Some(file.clone())])
                .collect());
        }
        if sql.contains("information_schema.tables") {
            return Ok(state
                .tables
                .keys()
                .filter(|table| like_match(params[0], table))
                .map(|table| vec![Some(table.clone())])
                .collect());
        }
        if sql.contains("information_schema.columns") {
            let columns = state.tables.get(params[0]).cloned().unwrap_or_default();
            return Ok(columns
                .into_iter()
                .map(|(name, data_type)| {
                    vec![Some(name), Some(data_type), Some("YES".to_string())]
                })
                .collect());
        }
        panic!("FakeWarehouse cannot interpret query: {sql}");
    }
}
