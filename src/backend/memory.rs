//! In-process reference backend (`memory://<database>`).
//!
//! Understands a small SQL subset that is enough to observe everything the proxy core promises:
//! connection-local temp tables and session variables, deferred inserts inside local and XA
//! transactions, prepared XA branches that outlive their connection, and large objects stored
//! database-wide so a locator written on one connection can be read on another.
//!
//! Supported statements (case-insensitive, `?` placeholders):
//! `CREATE [GLOBAL|LOCAL] TEMP[ORARY] TABLE`, `CREATE TABLE [#]name (...)`,
//! `DECLARE GLOBAL TEMPORARY TABLE`, `DROP TABLE`, `INSERT INTO .. [(cols)] VALUES (..),(..)`,
//! `SELECT *|cols|COUNT(*) FROM t [WHERE c = v] [ORDER BY c [DESC]]`, `SELECT expr, ..`,
//! `UPDATE t SET c = v [WHERE c = v]`, `DELETE FROM t [WHERE c = v]`, `TRUNCATE [TABLE] t`,
//! `SET @v = x`, `SET [SESSION|LOCAL] name = x`, `SET name TO x`, `SET AUTOCOMMIT = x`,
//! `SET TRANSACTION ISOLATION LEVEL ..`, `SHOW name`, `SHOW TRANSACTION ISOLATION LEVEL`,
//! `BEGIN`, `START TRANSACTION`, `COMMIT`, `ROLLBACK`, `SELECT SLEEP(ms)`.
//!
//! Only inserts into shared tables are transactional; updates and deletes apply immediately.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};

use super::{
    BackendConnection, BackendCursor, BackendDriver, BackendTarget, BranchOp, BranchReply, EndFlags, Execution,
    IsolationLevel, ResetOutcome, StartFlags, XaVote, Xid,
};
use crate::error::BackendError;
use crate::value::{Column, LobKind, LobLocator, Row, Value};

const XA_RBROLLBACK: i32 = 100;
const XAER_NOTA: i32 = -4;
const XAER_PROTO: i32 = -6;
const XAER_DUPID: i32 = -8;
const XAER_RMFAIL: i32 = -7;

fn xa_error(code: i32, message: String) -> BackendError {
    let state = match code {
        XA_RBROLLBACK => "XA100",
        XAER_NOTA => "XAE04",
        XAER_PROTO => "XAE06",
        XAER_DUPID => "XAE08",
        _ => "XAE03",
    };
    BackendError::with_state(state, message).with_code(code)
}

fn syntax(sql: &str) -> BackendError {
    BackendError::with_state("42601", format!("syntax error or unsupported statement: {sql}")).with_code(1064)
}

fn no_table(name: &str) -> BackendError {
    BackendError::with_state("42P01", format!("table '{name}' does not exist")).with_code(1146)
}

fn no_column(name: &str) -> BackendError {
    BackendError::with_state("42703", format!("unknown column '{name}'")).with_code(1054)
}

macro_rules! sql_regex {
    ($name:ident, $re:expr) => {
        static $name: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(concat!("(?is)", $re)).ok());
    };
}

sql_regex!(RE_SLEEP, r"^SELECT\s+SLEEP\s*\(\s*(\d+)\s*\)$");
sql_regex!(RE_CREATE_TEMP, r"^CREATE\s+(?:(?:GLOBAL|LOCAL)\s+)?(?:TEMPORARY|TEMP)\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([\w#.]+)\s*\((.*)\)(?:\s+ON\s+COMMIT\s+\w+\s+ROWS)?$");
sql_regex!(RE_DECLARE_TEMP, r"^DECLARE\s+GLOBAL\s+TEMPORARY\s+TABLE\s+([\w#.]+)\s*\((.*?)\)(?:\s+[\w\s]*)?$");
sql_regex!(RE_CREATE, r"^CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?([\w#.]+)\s*\((.*)\)$");
sql_regex!(RE_DROP, r"^DROP\s+TABLE\s+(IF\s+EXISTS\s+)?([\w#.]+)$");
sql_regex!(RE_INSERT, r"^INSERT\s+INTO\s+([\w#.]+)\s*(?:\(([^)]*)\))?\s*VALUES\s*(.+)$");
sql_regex!(RE_SELECT_FROM, r"^SELECT\s+(.+?)\s+FROM\s+([\w#.]+)(?:\s+WHERE\s+(\w+)\s*=\s*(.+?))?(?:\s+ORDER\s+BY\s+(\w+)(?:\s+(ASC|DESC))?)?$");
sql_regex!(RE_SELECT_EXPR, r"^SELECT\s+(.+)$");
sql_regex!(RE_UPDATE, r"^UPDATE\s+([\w#.]+)\s+SET\s+(\w+)\s*=\s*(.+?)(?:\s+WHERE\s+(\w+)\s*=\s*(.+))?$");
sql_regex!(RE_DELETE, r"^DELETE\s+FROM\s+([\w#.]+)(?:\s+WHERE\s+(\w+)\s*=\s*(.+))?$");
sql_regex!(RE_TRUNCATE, r"^TRUNCATE\s+(?:TABLE\s+)?([\w#.]+)$");
sql_regex!(RE_SET_AUTOCOMMIT, r"^SET\s+AUTOCOMMIT\s*(?:=|\s+TO\s+)?\s*(\w+)$");
sql_regex!(RE_SET_ISOLATION, r"^SET\s+(?:SESSION\s+)?TRANSACTION\s+ISOLATION\s+LEVEL\s+(.+)$");
sql_regex!(RE_SET_USER_VAR, r"^SET\s+@(\w+)\s*:?=\s*(.+)$");
sql_regex!(RE_SET_VAR, r"^SET\s+(?:SESSION\s+|LOCAL\s+)?([\w.]+)\s*(?:=|\s+TO\s+)\s*(.+)$");
sql_regex!(RE_SHOW_ISOLATION, r"^SHOW\s+TRANSACTION\s+ISOLATION\s+LEVEL$");
sql_regex!(RE_SHOW, r"^SHOW\s+([\w.@]+)$");
sql_regex!(RE_BEGIN, r"^(?:BEGIN(?:\s+(?:WORK|TRANSACTION))?|START\s+TRANSACTION(?:\s+.*)?)$");
sql_regex!(RE_COMMIT, r"^(?:COMMIT|END)(?:\s+(?:WORK|TRANSACTION))?$");
sql_regex!(RE_ROLLBACK, r"^(?:ROLLBACK|ABORT)(?:\s+(?:WORK|TRANSACTION))?$");

fn caps<'t>(re: &Lazy<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref().and_then(|r| r.captures(text))
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize, BackendError> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| no_column(name))
    }
}

#[derive(Debug, Clone)]
struct PendingInsert {
    table: String,
    row: Row,
}

/// One named in-memory database shared by every connection opened against it.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    name: String,
    tables: Mutex<HashMap<String, Table>>,
    prepared: Mutex<HashMap<Xid, Vec<PendingInsert>>>,
    lobs: Mutex<HashMap<u64, Vec<u8>>>,
    next_lob: AtomicU64,
    next_conn: AtomicU64,
    open_connections: AtomicUsize,
    opened_total: AtomicU64,
    unreachable: AtomicBool,
    unverifiable_reset: AtomicBool,
    failing_rollback: AtomicBool,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self { Self { name: name.to_string(), ..Default::default() } }

    pub fn name(&self) -> &str { &self.name }

    /// Make every subsequent open fail as if the server were down.
    pub fn set_unreachable(&self, on: bool) { self.unreachable.store(on, Ordering::SeqCst); }

    /// Make `reset_session` report that it cannot vouch for a clean session.
    pub fn set_unverifiable_reset(&self, on: bool) { self.unverifiable_reset.store(on, Ordering::SeqCst); }

    /// Make every branch rollback fail as if the resource manager dropped the request.
    pub fn set_failing_rollback(&self, on: bool) { self.failing_rollback.store(on, Ordering::SeqCst); }

    pub fn open_connections(&self) -> usize { self.open_connections.load(Ordering::SeqCst) }
    pub fn opened_total(&self) -> u64 { self.opened_total.load(Ordering::SeqCst) }

    pub fn prepared_xids(&self) -> Vec<Xid> {
        let mut v: Vec<Xid> = self.prepared.lock().keys().cloned().collect();
        v.sort_by_key(|x| x.to_string());
        v
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.lock().get(&table.to_ascii_lowercase()).map(|t| t.rows.len())
    }

    fn apply_inserts(&self, ops: Vec<PendingInsert>) {
        let mut tables = self.tables.lock();
        for op in ops {
            // a table dropped mid-transaction swallows its pending rows
            if let Some(t) = tables.get_mut(&op.table) {
                t.rows.push(op.row);
            }
        }
    }
}

pub struct MemoryDriver {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl Default for MemoryDriver {
    fn default() -> Self { Self::new() }
}

impl MemoryDriver {
    pub fn new() -> Self { Self { databases: Mutex::new(HashMap::new()) } }

    /// Get or create the database behind `memory://<name>`.
    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let key = name.to_ascii_lowercase();
        self.databases.lock().entry(key.clone()).or_insert_with(|| Arc::new(MemoryDatabase::new(&key))).clone()
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn family(&self) -> &str { "memory" }

    async fn open(&self, target: &BackendTarget) -> Result<Box<dyn BackendConnection>, BackendError> {
        let name = target.location().split(['?', '/']).next().unwrap_or_default();
        let db = self.database(name);
        if db.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::with_state("08001", format!("memory database '{name}' is unreachable")).with_code(2003));
        }
        let id = db.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        db.open_connections.fetch_add(1, Ordering::SeqCst);
        db.opened_total.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(target: "proxima::backend::memory", db = %db.name, conn = id, "open");
        Ok(Box::new(MemoryConnection::new(id, db)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XaAssoc {
    Active,
    Ended,
    Suspended,
}

#[derive(Debug, Clone)]
struct XaState {
    xid: Xid,
    assoc: XaAssoc,
    rollback_only: bool,
}

pub struct MemoryConnection {
    id: u64,
    db: Arc<MemoryDatabase>,
    temp: HashMap<String, Table>,
    vars: HashMap<String, Value>,
    autocommit: bool,
    tx_block: bool,
    isolation: IsolationLevel,
    read_only: bool,
    pending: Vec<PendingInsert>,
    xa: Option<XaState>,
    xa_timeout: u32,
    closed: bool,
}

struct Params<'a> {
    values: &'a [Value],
    next: usize,
}

impl<'a> Params<'a> {
    fn take(&mut self) -> Result<Value, BackendError> {
        let v = self.values.get(self.next).cloned().ok_or_else(|| {
            BackendError::with_state("07001", format!("no value supplied for parameter {}", self.next + 1))
        })?;
        self.next += 1;
        Ok(v)
    }
}

impl MemoryConnection {
    fn new(id: u64, db: Arc<MemoryDatabase>) -> Self {
        Self {
            id,
            db,
            temp: HashMap::new(),
            vars: HashMap::new(),
            autocommit: true,
            tx_block: false,
            isolation: IsolationLevel::default(),
            read_only: false,
            pending: Vec::new(),
            xa: None,
            xa_timeout: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 { self.id }

    fn in_transaction(&self) -> bool { !self.autocommit || self.tx_block || self.xa.is_some() }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::with_state("08003", "connection is closed"));
        }
        Ok(())
    }

    fn check_writable(&self, table: &str) -> Result<(), BackendError> {
        if self.read_only && !self.temp.contains_key(table) {
            return Err(BackendError::with_state("25006", "cannot write in a read-only transaction"));
        }
        Ok(())
    }

    fn commit_pending(&mut self) {
        let ops = std::mem::take(&mut self.pending);
        if !ops.is_empty() {
            self.db.apply_inserts(ops);
        }
    }

    fn eval(&self, raw: &str, params: &mut Params<'_>) -> Result<Value, BackendError> {
        let t = raw.trim();
        if t == "?" {
            return params.take();
        }
        let upper = t.to_ascii_uppercase();
        match upper.as_str() {
            "NULL" => return Ok(Value::Null),
            "TRUE" => return Ok(Value::Bool(true)),
            "FALSE" => return Ok(Value::Bool(false)),
            _ => {}
        }
        if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
            return Ok(Value::Text(t[1..t.len() - 1].replace("''", "'")));
        }
        if (upper.starts_with("X'") || upper.starts_with("0X")) && t.len() >= 2 {
            let hex = if upper.starts_with("X'") { t[2..].trim_end_matches('\'') } else { &t[2..] };
            return decode_hex(hex).map(Value::Bytes).ok_or_else(|| syntax(t));
        }
        if let Some(name) = t.strip_prefix('@') {
            return Ok(self.vars.get(&format!("@{}", name.to_ascii_lowercase())).cloned().unwrap_or(Value::Null));
        }
        if let Ok(i) = t.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Ok(f) = t.parse::<f64>() {
            return Ok(Value::Float(f));
        }
        Err(syntax(t))
    }

    fn create_table(&mut self, name: &str, defs: &str, temp: bool, if_not_exists: bool) -> Result<Execution, BackendError> {
        let key = name.to_ascii_lowercase();
        let columns = parse_columns(defs)?;
        let table = Table { columns, rows: Vec::new() };
        let exists = if temp { self.temp.contains_key(&key) } else { self.db.tables.lock().contains_key(&key) };
        if exists {
            if if_not_exists {
                return Ok(Execution::UpdateCount(0));
            }
            return Err(BackendError::with_state("42P07", format!("table '{name}' already exists")).with_code(1050));
        }
        if temp {
            self.temp.insert(key, table);
        } else {
            self.db.tables.lock().insert(key, table);
        }
        Ok(Execution::UpdateCount(0))
    }

    /// Snapshot of a table as this connection sees it (own pending inserts included).
    fn visible(&self, name: &str) -> Result<Table, BackendError> {
        let key = name.to_ascii_lowercase();
        if let Some(t) = self.temp.get(&key) {
            return Ok(t.clone());
        }
        let mut t = self.db.tables.lock().get(&key).cloned().ok_or_else(|| no_table(name))?;
        t.rows.extend(self.pending.iter().filter(|p| p.table == key).map(|p| p.row.clone()));
        Ok(t)
    }

    fn with_table<R>(&mut self, name: &str, f: impl FnOnce(&mut Table) -> Result<R, BackendError>) -> Result<R, BackendError> {
        let key = name.to_ascii_lowercase();
        if let Some(t) = self.temp.get_mut(&key) {
            return f(t);
        }
        let mut tables = self.db.tables.lock();
        let t = tables.get_mut(&key).ok_or_else(|| no_table(name))?;
        f(t)
    }

    fn insert(&mut self, c: &Captures<'_>, params: &mut Params<'_>) -> Result<Execution, BackendError> {
        let name = c[1].to_ascii_lowercase();
        self.check_writable(&name)?;
        let shape = self.visible(&name)?;
        let target_cols: Vec<usize> = match c.get(2) {
            Some(list) => list
                .as_str()
                .split(',')
                .map(|s| shape.column_index(s.trim()))
                .collect::<Result<_, _>>()?,
            None => (0..shape.columns.len()).collect(),
        };
        let mut rows = Vec::new();
        for tuple in split_tuples(&c[3]).ok_or_else(|| syntax(&c[3]))? {
            let exprs = split_top_level(tuple);
            if exprs.len() != target_cols.len() {
                return Err(BackendError::with_state("21S01", "column count doesn't match value count").with_code(1136));
            }
            let mut row = vec![Value::Null; shape.columns.len()];
            for (expr, idx) in exprs.iter().zip(&target_cols) {
                row[*idx] = self.eval(expr, params)?;
            }
            rows.push(row);
        }
        let n = rows.len() as u64;
        if self.temp.contains_key(&name) || !self.in_transaction() {
            self.with_table(&name, |t| {
                t.rows.extend(rows);
                Ok(())
            })?;
        } else {
            self.pending.extend(rows.into_iter().map(|row| PendingInsert { table: name.clone(), row }));
        }
        Ok(Execution::UpdateCount(n))
    }

    fn select_from(&mut self, c: &Captures<'_>, params: &mut Params<'_>) -> Result<Execution, BackendError> {
        let table = self.visible(&c[2])?;
        let mut rows = table.rows.clone();
        if let (Some(col), Some(val)) = (c.get(3), c.get(4)) {
            let idx = table.column_index(col.as_str())?;
            let want = self.eval(val.as_str(), params)?;
            rows.retain(|r| values_equal(&r[idx], &want));
        }
        if let Some(col) = c.get(5) {
            let idx = table.column_index(col.as_str())?;
            rows.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
            if c.get(6).is_some_and(|d| d.as_str().eq_ignore_ascii_case("DESC")) {
                rows.reverse();
            }
        }
        let projection = c[1].trim();
        if projection.eq_ignore_ascii_case("COUNT(*)") {
            let cols = vec![Column::new("count", "BIGINT")];
            return Ok(cursor(cols, vec![vec![Value::Int(rows.len() as i64)]]));
        }
        if projection == "*" {
            return Ok(cursor(table.columns, rows));
        }
        let idxs: Vec<usize> = projection
            .split(',')
            .map(|s| table.column_index(s.trim()))
            .collect::<Result<_, _>>()?;
        let cols = idxs.iter().map(|i| table.columns[*i].clone()).collect();
        let projected = rows.into_iter().map(|r| idxs.iter().map(|i| r[*i].clone()).collect()).collect();
        Ok(cursor(cols, projected))
    }

    fn select_exprs(&self, list: &str, params: &mut Params<'_>) -> Result<Execution, BackendError> {
        let mut cols = Vec::new();
        let mut row = Vec::new();
        for expr in split_top_level(list) {
            let v = self.eval(expr, params)?;
            let ty = match &v {
                Value::Int(_) => "BIGINT",
                Value::Float(_) => "DOUBLE",
                Value::Bool(_) => "BOOLEAN",
                Value::Bytes(_) => "VARBINARY",
                _ => "VARCHAR",
            };
            cols.push(Column::new(expr.trim().to_string(), ty.to_string()));
            row.push(v);
        }
        Ok(cursor(cols, vec![row]))
    }

    fn update(&mut self, c: &Captures<'_>, params: &mut Params<'_>) -> Result<Execution, BackendError> {
        let name = c[1].to_ascii_lowercase();
        self.check_writable(&name)?;
        let new_value = self.eval(&c[3], params)?;
        let filter = match (c.get(4), c.get(5)) {
            (Some(col), Some(v)) => Some((col.as_str().to_string(), self.eval(v.as_str(), params)?)),
            _ => None,
        };
        let set_col = c[2].to_string();
        let n = self.with_table(&name, |t| {
            let idx = t.column_index(&set_col)?;
            let fidx = match &filter {
                Some((col, _)) => Some(t.column_index(col)?),
                None => None,
            };
            let mut n = 0u64;
            for r in t.rows.iter_mut() {
                let hit = match (&filter, fidx) {
                    (Some((_, want)), Some(fi)) => values_equal(&r[fi], want),
                    _ => true,
                };
                if hit {
                    r[idx] = new_value.clone();
                    n += 1;
                }
            }
            Ok(n)
        })?;
        Ok(Execution::UpdateCount(n))
    }

    fn delete(&mut self, c: &Captures<'_>, params: &mut Params<'_>) -> Result<Execution, BackendError> {
        let name = c[1].to_ascii_lowercase();
        self.check_writable(&name)?;
        let filter = match (c.get(2), c.get(3)) {
            (Some(col), Some(v)) => Some((col.as_str().to_string(), self.eval(v.as_str(), params)?)),
            _ => None,
        };
        let n = self.with_table(&name, |t| {
            let before = t.rows.len();
            match &filter {
                Some((col, want)) => {
                    let idx = t.column_index(col)?;
                    t.rows.retain(|r| !values_equal(&r[idx], want));
                }
                None => t.rows.clear(),
            }
            Ok((before - t.rows.len()) as u64)
        })?;
        Ok(Execution::UpdateCount(n))
    }

    fn run(&mut self, sql: &str, params: &[Value]) -> Result<Execution, BackendError> {
        let text = sql.trim().trim_end_matches(';').trim();
        let mut params = Params { values: params, next: 0 };

        if let Some(c) = caps(&RE_CREATE_TEMP, text) {
            return self.create_table(&c[1], &c[2], true, false);
        }
        if let Some(c) = caps(&RE_DECLARE_TEMP, text) {
            return self.create_table(&c[1], &c[2], true, false);
        }
        if let Some(c) = caps(&RE_CREATE, text) {
            let temp = c[2].starts_with('#');
            return self.create_table(&c[2], &c[3], temp, c.get(1).is_some());
        }
        if let Some(c) = caps(&RE_DROP, text) {
            let key = c[2].to_ascii_lowercase();
            let removed = self.temp.remove(&key).is_some() || self.db.tables.lock().remove(&key).is_some();
            if !removed && c.get(1).is_none() {
                return Err(no_table(&c[2]));
            }
            return Ok(Execution::UpdateCount(0));
        }
        if let Some(c) = caps(&RE_INSERT, text) {
            return self.insert(&c, &mut params);
        }
        if let Some(c) = caps(&RE_SELECT_FROM, text) {
            return self.select_from(&c, &mut params);
        }
        if let Some(c) = caps(&RE_UPDATE, text) {
            return self.update(&c, &mut params);
        }
        if let Some(c) = caps(&RE_DELETE, text) {
            return self.delete(&c, &mut params);
        }
        if let Some(c) = caps(&RE_TRUNCATE, text) {
            let name = c[1].to_ascii_lowercase();
            self.check_writable(&name)?;
            let n = self.with_table(&name, |t| {
                let n = t.rows.len() as u64;
                t.rows.clear();
                Ok(n)
            })?;
            return Ok(Execution::UpdateCount(n));
        }
        if let Some(c) = caps(&RE_SET_AUTOCOMMIT, text) {
            let on = matches!(c[1].to_ascii_uppercase().as_str(), "1" | "ON" | "TRUE");
            if on && !self.autocommit {
                self.commit_pending();
            }
            self.autocommit = on;
            return Ok(Execution::UpdateCount(0));
        }
        if let Some(c) = caps(&RE_SET_ISOLATION, text) {
            self.isolation = IsolationLevel::parse(&c[1]).ok_or_else(|| syntax(text))?;
            return Ok(Execution::UpdateCount(0));
        }
        if let Some(c) = caps(&RE_SET_USER_VAR, text) {
            let v = self.eval(&c[2], &mut params)?;
            self.vars.insert(format!("@{}", c[1].to_ascii_lowercase()), v);
            return Ok(Execution::UpdateCount(0));
        }
        if let Some(c) = caps(&RE_SET_VAR, text) {
            let v = self.eval(&c[2], &mut params)?;
            self.vars.insert(c[1].to_ascii_lowercase(), v);
            return Ok(Execution::UpdateCount(0));
        }
        if caps(&RE_SHOW_ISOLATION, text).is_some() {
            let cols = vec![Column::new("transaction_isolation", "VARCHAR")];
            return Ok(cursor(cols, vec![vec![Value::Text(self.isolation.as_sql().to_string())]]));
        }
        if let Some(c) = caps(&RE_SHOW, text) {
            let key = c[1].to_ascii_lowercase();
            let v = self
                .vars
                .get(&key)
                .cloned()
                .ok_or_else(|| BackendError::with_state("42704", format!("unrecognized configuration parameter '{key}'")))?;
            return Ok(cursor(vec![Column::new(key, "VARCHAR".to_string())], vec![vec![v]]));
        }
        if caps(&RE_BEGIN, text).is_some() {
            if self.xa.is_some() {
                return Err(xa_error(XAER_PROTO, "cannot BEGIN inside an XA branch".into()));
            }
            self.tx_block = true;
            return Ok(Execution::UpdateCount(0));
        }
        if caps(&RE_COMMIT, text).is_some() {
            self.commit_pending();
            self.tx_block = false;
            return Ok(Execution::UpdateCount(0));
        }
        if caps(&RE_ROLLBACK, text).is_some() {
            self.pending.clear();
            self.tx_block = false;
            return Ok(Execution::UpdateCount(0));
        }
        if let Some(c) = caps(&RE_SELECT_EXPR, text) {
            return self.select_exprs(&c[1], &mut params);
        }
        Err(syntax(text))
    }

    fn xa_mismatch(&self, xid: &Xid) -> BackendError {
        match &self.xa {
            Some(s) => xa_error(XAER_PROTO, format!("connection is associated with {} not {xid}", s.xid)),
            None => xa_error(XAER_NOTA, format!("unknown xid {xid}")),
        }
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, BackendError> {
        self.check_open()?;
        if let Some(c) = caps(&RE_SLEEP, sql.trim().trim_end_matches(';').trim()) {
            let ms: u64 = c[1].parse().map_err(|_| syntax(sql))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(cursor(vec![Column::new("sleep", "BIGINT")], vec![vec![Value::Int(0)]]));
        }
        self.run(sql, params)
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        self.commit_pending();
        self.tx_block = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        self.pending.clear();
        self.tx_block = false;
        Ok(())
    }

    async fn set_autocommit(&mut self, on: bool) -> Result<(), BackendError> {
        self.check_open()?;
        if on && !self.autocommit {
            self.commit_pending();
        }
        self.autocommit = on;
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), BackendError> {
        self.check_open()?;
        self.isolation = level;
        Ok(())
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), BackendError> {
        self.check_open()?;
        self.read_only = read_only;
        Ok(())
    }

    async fn reset_session(&mut self) -> Result<ResetOutcome, BackendError> {
        self.check_open()?;
        if self.db.unverifiable_reset.load(Ordering::SeqCst) {
            return Ok(ResetOutcome::Unverified);
        }
        self.temp.clear();
        self.vars.clear();
        self.pending.clear();
        self.tx_block = false;
        self.read_only = false;
        self.xa = None;
        Ok(ResetOutcome::Verified)
    }

    async fn ping(&mut self) -> bool { !self.closed }

    async fn participate(&mut self, op: BranchOp<'_>) -> Result<BranchReply, BackendError> {
        self.check_open()?;
        match op {
            BranchOp::Start { xid, flags: StartFlags::NoFlags } => {
                if self.xa.is_some() || self.tx_block {
                    return Err(xa_error(XAER_PROTO, "connection already has a transaction in progress".into()));
                }
                if self.db.prepared.lock().contains_key(xid) {
                    return Err(xa_error(XAER_DUPID, format!("xid {xid} already exists")));
                }
                self.xa = Some(XaState { xid: xid.clone(), assoc: XaAssoc::Active, rollback_only: false });
                Ok(BranchReply::Done)
            }
            BranchOp::Start { xid, flags: StartFlags::Join | StartFlags::Resume } => {
                let resumable = self.xa.as_ref().is_some_and(|s| &s.xid == xid && s.assoc != XaAssoc::Active);
                if !resumable {
                    return Err(self.xa_mismatch(xid));
                }
                if let Some(s) = self.xa.as_mut() {
                    s.assoc = XaAssoc::Active;
                }
                Ok(BranchReply::Done)
            }
            BranchOp::End { xid, flags } => {
                let active = self.xa.as_ref().is_some_and(|s| &s.xid == xid && s.assoc == XaAssoc::Active);
                if !active {
                    return Err(self.xa_mismatch(xid));
                }
                if let Some(s) = self.xa.as_mut() {
                    s.assoc = if flags == EndFlags::Suspend { XaAssoc::Suspended } else { XaAssoc::Ended };
                    s.rollback_only |= flags == EndFlags::Fail;
                }
                Ok(BranchReply::Done)
            }
            BranchOp::Prepare { xid } => {
                let state = match &self.xa {
                    Some(s) if &s.xid == xid && s.assoc == XaAssoc::Ended => s.clone(),
                    _ => return Err(self.xa_mismatch(xid)),
                };
                self.xa = None;
                if state.rollback_only {
                    self.pending.clear();
                    return Err(xa_error(XA_RBROLLBACK, format!("branch {xid} was marked rollback-only")));
                }
                let work = std::mem::take(&mut self.pending);
                if work.is_empty() {
                    return Ok(BranchReply::Vote(XaVote::ReadOnly));
                }
                self.db.prepared.lock().insert(xid.clone(), work);
                Ok(BranchReply::Vote(XaVote::Commit))
            }
            BranchOp::Commit { xid, one_phase: true } => {
                let state = match &self.xa {
                    Some(s) if &s.xid == xid => s.clone(),
                    _ => return Err(self.xa_mismatch(xid)),
                };
                self.xa = None;
                if state.rollback_only {
                    self.pending.clear();
                    return Err(xa_error(XA_RBROLLBACK, format!("branch {xid} was marked rollback-only")));
                }
                self.commit_pending();
                Ok(BranchReply::Done)
            }
            BranchOp::Commit { xid, one_phase: false } => {
                let work = self.db.prepared.lock().remove(xid);
                match work {
                    Some(ops) => {
                        self.db.apply_inserts(ops);
                        Ok(BranchReply::Done)
                    }
                    None => Err(xa_error(XAER_NOTA, format!("xid {xid} is not prepared"))),
                }
            }
            BranchOp::Rollback { xid } => {
                if self.db.failing_rollback.load(Ordering::SeqCst) {
                    return Err(xa_error(XAER_RMFAIL, format!("resource manager failed rolling back {xid}")));
                }
                if self.xa.as_ref().is_some_and(|s| &s.xid == xid) {
                    self.xa = None;
                    self.pending.clear();
                    return Ok(BranchReply::Done);
                }
                if self.db.prepared.lock().remove(xid).is_some() {
                    return Ok(BranchReply::Done);
                }
                Err(xa_error(XAER_NOTA, format!("unknown xid {xid}")))
            }
            BranchOp::Recover => Ok(BranchReply::Recovered(self.db.prepared_xids())),
            BranchOp::Forget { xid } => Err(xa_error(XAER_NOTA, format!("no heuristic outcome recorded for {xid}"))),
            BranchOp::SetTimeout { seconds } => {
                self.xa_timeout = seconds;
                Ok(BranchReply::Done)
            }
        }
    }

    async fn create_lob(&mut self, kind: LobKind) -> Result<LobLocator, BackendError> {
        self.check_open()?;
        let id = self.db.next_lob.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.lobs.lock().insert(id, Vec::new());
        Ok(LobLocator { id, kind })
    }

    async fn write_lob(&mut self, lob: &LobLocator, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        self.check_open()?;
        let mut lobs = self.db.lobs.lock();
        let data = lobs.get_mut(&lob.id).ok_or_else(|| unknown_lob(lob))?;
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn read_lob(&mut self, lob: &LobLocator, offset: u64, max: usize) -> Result<Vec<u8>, BackendError> {
        self.check_open()?;
        let lobs = self.db.lobs.lock();
        let data = lobs.get(&lob.id).ok_or_else(|| unknown_lob(lob))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(max).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn lob_length(&mut self, lob: &LobLocator) -> Result<Option<u64>, BackendError> {
        self.check_open()?;
        let lobs = self.db.lobs.lock();
        let data = lobs.get(&lob.id).ok_or_else(|| unknown_lob(lob))?;
        Ok(Some(data.len() as u64))
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if !this.closed {
            this.closed = true;
            this.db.open_connections.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(target: "proxima::backend::memory", db = %this.db.name, conn = this.id, "close");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.db.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn unknown_lob(lob: &LobLocator) -> BackendError {
    BackendError::with_state("0F001", format!("invalid large object locator {}", lob.id))
}

struct MemoryCursor {
    columns: Vec<Column>,
    rows: VecDeque<Row>,
}

fn cursor(columns: Vec<Column>, rows: Vec<Row>) -> Execution {
    Execution::Rows(Box::new(MemoryCursor { columns, rows: rows.into() }))
}

#[async_trait]
impl BackendCursor for MemoryCursor {
    fn columns(&self) -> &[Column] { &self.columns }

    async fn fetch(&mut self, n: usize) -> Result<Vec<Row>, BackendError> {
        let take = n.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn close(self: Box<Self>) {}
}

fn parse_columns(defs: &str) -> Result<Vec<Column>, BackendError> {
    let mut cols = Vec::new();
    for def in split_top_level(defs) {
        let mut parts = def.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let upper = name.to_ascii_uppercase();
        if matches!(upper.as_str(), "PRIMARY" | "CONSTRAINT" | "UNIQUE" | "FOREIGN" | "CHECK") {
            continue;
        }
        let ty = parts.next().unwrap_or("VARCHAR");
        let ty = ty.split('(').next().unwrap_or(ty).to_ascii_uppercase();
        cols.push(Column::new(name.trim_matches('"').to_string(), ty));
    }
    if cols.is_empty() {
        return Err(syntax(defs));
    }
    Ok(cols)
}

/// Split on commas that are outside quotes and parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut in_str, mut start) = (0i32, false, 0usize);
    for (i, ch) in s.char_indices() {
        match ch {
            '\'' => in_str = !in_str,
            '(' if !in_str => depth += 1,
            ')' if !in_str => depth -= 1,
            ',' if !in_str && depth == 0 => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

/// `(a, b), (c, d)` -> [`a, b`, `c, d`]
fn split_tuples(s: &str) -> Option<Vec<&str>> {
    let mut out = Vec::new();
    let (mut depth, mut in_str, mut open) = (0i32, false, None);
    for (i, ch) in s.char_indices() {
        match ch {
            '\'' => in_str = !in_str,
            '(' if !in_str => {
                if depth == 0 {
                    open = Some(i + 1);
                }
                depth += 1;
            }
            ')' if !in_str => {
                depth -= 1;
                if depth == 0 {
                    out.push(&s[open?..i]);
                }
            }
            ',' | ' ' | '\t' | '\n' | '\r' if depth == 0 => {}
            _ if depth == 0 => return None,
            _ => {}
        }
    }
    if depth != 0 || out.is_empty() { None } else { Some(out) }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Int(x), Value::Text(s)) | (Value::Text(s), Value::Int(x)) => s.trim().parse::<i64>().ok() == Some(*x),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(CmpOrdering::Equal),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(CmpOrdering::Equal),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(CmpOrdering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
