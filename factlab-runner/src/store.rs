//! Target stores: where derived rows end up.
//!
//! Two implementations:
//! - [`MemoryStore`]: shared in-memory tables; handles are cheap clones.
//! - [`SqliteStore`]: one rusqlite connection per handle, WAL mode, tables
//!   created on first write with the key columns as primary key.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use factlab_core::retry::Retryable;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Stable text form used to compare keys across rows.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(i) => format!("i:{i}"),
            Value::Float(f) => format!("f:{f:?}"),
            Value::Text(s) => format!("t:{s}"),
            Value::Date(d) => format!("d:{d}"),
            Value::Timestamp(ts) => format!("ts:{}", format_timestamp(ts)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Column name → value, in column order.
pub type Row = BTreeMap<String, Value>;

/// Build a row from `(column, value)` pairs.
pub fn row<I, K, V>(cells: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    cells
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Canonical key of `row` over `key_columns`, or the first missing column.
pub fn row_key(row: &Row, key_columns: &[&str]) -> Result<String, String> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for col in key_columns {
        match row.get(*col) {
            Some(v) => parts.push(v.canonical()),
            None => return Err((*col).to_string()),
        }
    }
    Ok(parts.join("\u{1f}"))
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("row for table '{table}' is missing key column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("store lock poisoned")]
    Poisoned,
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

/// Destination for loader writes. One handle is used by one task at a time.
pub trait TargetStore: Send {
    fn name(&self) -> &str;

    /// Insert rows; on key collision overwrite only `update_columns`.
    /// Empty `update_columns` leaves existing rows untouched.
    fn upsert(
        &mut self,
        table: &str,
        rows: &[Row],
        key_columns: &[&str],
        update_columns: &[&str],
    ) -> Result<usize, StoreError>;

    /// Write-once insert without key handling.
    fn append(&mut self, table: &str, rows: &[Row]) -> Result<usize, StoreError>;

    fn row_count(&mut self, table: &str) -> Result<usize, StoreError>;

    /// Every row of `table`; empty when the table does not exist.
    fn fetch_all(&mut self, table: &str) -> Result<Vec<Row>, StoreError>;
}

// ── Memory ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryTable {
    keyed: BTreeMap<String, Row>,
    appended: Vec<Row>,
}

/// In-memory store. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<BTreeMap<String, MemoryTable>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `n` handles over the same tables.
    pub fn handles(&self, n: usize) -> Vec<Box<dyn TargetStore>> {
        (0..n)
            .map(|_| Box::new(self.clone()) as Box<dyn TargetStore>)
            .collect()
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.keys().cloned().collect())
    }
}

impl TargetStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert(
        &mut self,
        table: &str,
        rows: &[Row],
        key_columns: &[&str],
        update_columns: &[&str],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let target = tables.entry(table.to_string()).or_default();
        let mut affected = 0;
        for row in rows {
            let key = row_key(row, key_columns).map_err(|column| StoreError::MissingColumn {
                table: table.to_string(),
                column,
            })?;
            match target.keyed.get_mut(&key) {
                Some(existing) => {
                    if update_columns.is_empty() {
                        continue;
                    }
                    for col in update_columns {
                        let v = row.get(*col).cloned().unwrap_or(Value::Null);
                        existing.insert((*col).to_string(), v);
                    }
                    affected += 1;
                }
                None => {
                    target.keyed.insert(key, row.clone());
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    fn append(&mut self, table: &str, rows: &[Row]) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let target = tables.entry(table.to_string()).or_default();
        target.appended.extend_from_slice(rows);
        Ok(rows.len())
    }

    fn row_count(&mut self, table: &str) -> Result<usize, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables
            .get(table)
            .map_or(0, |t| t.keyed.len() + t.appended.len()))
    }

    fn fetch_all(&mut self, table: &str) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables
            .get(table)
            .map(|t| t.keyed.values().chain(t.appended.iter()).cloned().collect())
            .unwrap_or_default())
    }
}

// ── SQLite ───────────────────────────────────────────────────────────

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(Sql::Null),
            Value::Int(i) => ToSqlOutput::Owned(Sql::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(Sql::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Date(d) => ToSqlOutput::Owned(Sql::Text(d.to_string())),
            Value::Timestamp(ts) => ToSqlOutput::Owned(Sql::Text(format_timestamp(ts))),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

/// SQLite-backed store. Each handle owns its own connection.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    /// Columns of tables this handle has already ensured.
    known: BTreeMap<String, BTreeSet<String>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(path = %path.display(), journal_mode = %journal_mode, "WAL mode not active");
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            known: BTreeMap::new(),
        })
    }

    /// `n` independent connections to the same database file.
    pub fn open_handles(path: &Path, n: usize) -> Result<Vec<Box<dyn TargetStore>>, StoreError> {
        let handles = (0..n)
            .map(|_| Self::open(path).map(|s| Box::new(s) as Box<dyn TargetStore>))
            .collect::<Result<Vec<_>, _>>()?;
        info!(path = %path.display(), handles = n, "sqlite target store opened");
        Ok(handles)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn existing_columns(&self, table: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(cols)
    }

    /// Create the table, or add columns it lacks.
    fn ensure_table(
        &mut self,
        table: &str,
        columns: &BTreeSet<String>,
        key_columns: &[&str],
    ) -> Result<(), StoreError> {
        check_identifier(table)?;
        for col in columns {
            check_identifier(col)?;
        }

        if let Some(known) = self.known.get(table) {
            if columns.is_subset(known) {
                return Ok(());
            }
        }

        let mut existing = self.existing_columns(table)?;
        if existing.is_empty() {
            let mut defs: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            if !key_columns.is_empty() {
                let keys: Vec<String> = key_columns.iter().map(|c| quote(c)).collect();
                defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
            }
            let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(table), defs.join(", "));
            self.conn.execute_batch(&sql)?;
            debug!(table, columns = columns.len(), "created table");
            existing = columns.clone();
        } else {
            let missing: Vec<String> = columns.difference(&existing).cloned().collect();
            for col in missing {
                let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote(table), quote(&col));
                self.conn.execute_batch(&sql)?;
                debug!(table, column = %col, "added column");
                existing.insert(col);
            }
        }
        self.known.insert(table.to_string(), existing);
        Ok(())
    }

    fn insert_rows(
        &mut self,
        table: &str,
        rows: &[Row],
        key_columns: &[&str],
        update_columns: &[&str],
        upsert: bool,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for key in key_columns {
            if rows.iter().any(|r| !r.contains_key(*key)) {
                return Err(StoreError::MissingColumn {
                    table: table.to_string(),
                    column: (*key).to_string(),
                });
            }
        }

        let mut columns: BTreeSet<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        columns.extend(key_columns.iter().map(|c| c.to_string()));
        columns.extend(update_columns.iter().map(|c| c.to_string()));
        self.ensure_table(table, &columns, if upsert { key_columns } else { &[] })?;

        let col_list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            col_list.join(", "),
            placeholders.join(", ")
        );
        if upsert {
            for col in update_columns {
                check_identifier(col)?;
            }
            let keys: Vec<String> = key_columns.iter().map(|c| quote(c)).collect();
            if update_columns.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
            } else {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{0} = excluded.{0}", quote(c)))
                    .collect();
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    keys.join(", "),
                    sets.join(", ")
                ));
            }
        }

        let null = Value::Null;
        let tx = self.conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                let values = columns.iter().map(|c| row.get(c).unwrap_or(&null));
                affected += stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

impl TargetStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn upsert(
        &mut self,
        table: &str,
        rows: &[Row],
        key_columns: &[&str],
        update_columns: &[&str],
    ) -> Result<usize, StoreError> {
        self.insert_rows(table, rows, key_columns, update_columns, true)
    }

    fn append(&mut self, table: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.insert_rows(table, rows, &[], &[], false)
    }

    fn row_count(&mut self, table: &str) -> Result<usize, StoreError> {
        check_identifier(table)?;
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| {
                row.get(0)
            })?;
        Ok(n as usize)
    }

    fn fetch_all(&mut self, table: &str) -> Result<Vec<Row>, StoreError> {
        check_identifier(table)?;
        if !self.table_exists(table)? {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote(table)))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt
            .query_map([], |r| {
                let mut out = Row::new();
                for (i, name) in names.iter().enumerate() {
                    out.insert(name.clone(), from_sql(r.get_ref(i)?));
                }
                Ok(out)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
