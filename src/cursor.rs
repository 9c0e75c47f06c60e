//! Statements and result cursors.
//!
//! `fetch_next` is pull based: the caller asks for a block, the engine keeps up to one more
//! block buffered from the backend so `has_more` is exact. The backend cursor is closed the moment
//! it runs dry, even while the session stays pinned; the cursor handle lingers as a closed
//! tombstone (so a late fetch is reported as a protocol error and the last block's large values
//! can still be streamed) until the client closes it or the session ends.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::affinity::{AffinityContext, AffinityDetector, Classification, PinReason, TransactionBoundary};
use crate::backend::{BackendCursor, Execution};
use crate::config::LobSettings;
use crate::error::{HandleKind, ProxyError, ProxyResult};
use crate::lob::StreamOwner;
use crate::pool::PoolManager;
use crate::segregation::operation_hash;
use crate::session::{guarded, interrupted, CursorId, Session, StatementId};
use crate::value::{Column, LobKind, LobLocator, Row, Value};

/// Number of `?` placeholders outside quoted text and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let mut n = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                for d in chars.by_ref() {
                    if d == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for d in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for d in chars.by_ref() {
                    if prev == '*' && d == '/' {
                        break;
                    }
                    prev = d;
                }
            }
            '?' => n += 1,
            _ => {}
        }
    }
    n
}

pub struct Statement {
    pub(crate) id: StatementId,
    pub(crate) sql: String,
    pub(crate) params: Vec<Option<Value>>,
    pub(crate) fetch_size: usize,
    /// 1-based parameter index -> write stream still being filled.
    pub(crate) open_writes: BTreeMap<usize, crate::session::StreamId>,
    /// Created by `execute_sql`; dropped once its result is consumed.
    pub(crate) ephemeral: bool,
    op_hash: u64,
}

impl Statement {
    fn new(sql: &str, fetch_size: usize, ephemeral: bool) -> Self {
        Self {
            id: StatementId::new(),
            sql: sql.to_string(),
            params: vec![None; count_placeholders(sql)],
            fetch_size,
            open_writes: BTreeMap::new(),
            ephemeral,
            op_hash: operation_hash(sql),
        }
    }

    pub fn param_count(&self) -> usize { self.params.len() }

    pub(crate) fn check_index(&self, index: usize) -> ProxyResult<()> {
        if index == 0 || index > self.params.len() {
            return Err(ProxyError::protocol(format!(
                "parameter index {index} out of range (statement has {} parameters)",
                self.params.len()
            )));
        }
        Ok(())
    }
}

/// A large value of the most recently delivered block, kept for `open_read`.
#[derive(Debug, Clone)]
pub(crate) enum Retained {
    Bytes { data: Arc<[u8]>, kind: LobKind },
    Locator { lob: LobLocator, length: Option<u64> },
    Null { kind: LobKind },
}

pub struct ResultCursor {
    pub(crate) id: CursorId,
    pub(crate) statement_id: StatementId,
    columns: Vec<Column>,
    backend: Option<Box<dyn BackendCursor>>,
    ahead: VecDeque<Row>,
    fetch_size: usize,
    delivered: u64,
    exhausted: bool,
    retained: HashMap<(u64, usize), Retained>,
}

impl ResultCursor {
    fn new(id: CursorId, statement_id: StatementId, backend: Box<dyn BackendCursor>, fetch_size: usize) -> Self {
        Self {
            id,
            statement_id,
            columns: backend.columns().to_vec(),
            backend: Some(backend),
            ahead: VecDeque::new(),
            fetch_size,
            delivered: 0,
            exhausted: false,
            retained: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[Column] { &self.columns }
    pub fn is_exhausted(&self) -> bool { self.exhausted }
    pub(crate) fn holds_backend(&self) -> bool { self.backend.is_some() }
    pub(crate) fn retained(&self, row: u64, column: usize) -> Option<&Retained> { self.retained.get(&(row, column)) }

    async fn release_backend(&mut self) {
        if let Some(b) = self.backend.take() {
            b.close().await;
            debug!(target: "proxima::cursor", cursor = %self.id, "backend cursor released");
        }
    }
}

/// One cell as sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    Inline(Value),
    /// Too large to embed; read it with `open_read` on this row and column.
    Stream { kind: LobKind, length: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchBlock {
    /// Position of the first row of this block within the result.
    pub first_row: u64,
    pub rows: Vec<Vec<WireValue>>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    UpdateCount { count: u64 },
    Cursor { cursor_id: CursorId, columns: Vec<Column> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepared {
    pub statement_id: StatementId,
    pub param_count: usize,
}

pub struct CursorEngine {
    pools: Arc<PoolManager>,
    detector: Arc<AffinityDetector>,
    lobs: LobSettings,
}

impl CursorEngine {
    pub fn new(pools: Arc<PoolManager>, detector: Arc<AffinityDetector>, lobs: LobSettings) -> Self {
        Self { pools, detector, lobs }
    }

    pub fn prepare(&self, s: &mut Session, sql: &str) -> Prepared {
        let stmt = Statement::new(sql, s.config.fetch_size, false);
        let out = Prepared { statement_id: stmt.id, param_count: stmt.param_count() };
        debug!(target: "proxima::cursor", session = %s.id, statement = %stmt.id, "prepared");
        s.statements.insert(stmt.id, stmt);
        out
    }

    pub fn bind(&self, s: &mut Session, statement_id: StatementId, index: usize, value: Value) -> ProxyResult<()> {
        let stmt = s.statements.get_mut(&statement_id).ok_or_else(|| ProxyError::stale(HandleKind::Statement, statement_id))?;
        stmt.check_index(index)?;
        if stmt.open_writes.contains_key(&index) {
            return Err(ProxyError::protocol(format!("parameter {index} is being written through a stream")));
        }
        if matches!(value, Value::Lob(_)) {
            return Err(ProxyError::protocol("large object locators are bound through write streams"));
        }
        if value.byte_len() >= self.lobs.inline_threshold {
            return Err(ProxyError::protocol(format!(
                "parameter {index} is {} bytes; values of {} bytes or more must be sent through a write stream",
                value.byte_len(),
                self.lobs.inline_threshold
            )));
        }
        stmt.params[index - 1] = Some(value);
        Ok(())
    }

    pub async fn execute(&self, s: &mut Session, token: &CancellationToken, statement_id: StatementId) -> ProxyResult<ExecuteOutcome> {
        let stmt = s.statements.get(&statement_id).ok_or_else(|| ProxyError::stale(HandleKind::Statement, statement_id))?;
        if let Some(index) = stmt.open_writes.keys().next() {
            return Err(ProxyError::protocol(format!("parameter {index} still has an open write stream")));
        }
        if let Some(pos) = stmt.params.iter().position(Option::is_none) {
            return Err(ProxyError::protocol(format!("parameter {} is not bound", pos + 1)));
        }
        let params: Vec<Value> = stmt.params.iter().flatten().cloned().collect();
        let sql = stmt.sql.clone();
        let op = stmt.op_hash;
        let fetch_size = stmt.fetch_size;
        let ephemeral = stmt.ephemeral;

        let boundary = self.detector.transaction_boundary(&sql);
        if let Some(xid) = &s.branch {
            if !s.branch_active {
                return Err(ProxyError::conflict(format!(
                    "session's connection is held by branch {xid}, which is not active; resume or complete it first"
                )));
            }
            if boundary.is_some() {
                return Err(ProxyError::conflict(format!("local transaction control inside branch {xid}")));
            }
        }

        // a re-executed statement drops its previous result
        let previous: Vec<CursorId> = s.cursors.values().filter(|c| c.statement_id == statement_id).map(|c| c.id).collect();
        for id in previous {
            discard_cursor(s, id).await;
        }

        let ctx = AffinityContext { state: s.pins.state(), branch_active: s.branch_active };
        let reason = match self.detector.classify(&sql, &ctx) {
            Classification::RequiresPinning(r) => Some(r),
            Classification::NoAffinity => None,
        };
        // wait for an execution slot before leasing, so queued sessions hold no connection
        let pool = self.pools.pool(&s.datasource)?;
        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProxyError::Cancelled),
            r = pool.segregation().admit(op) => r,
        };
        let _slot = match slot {
            Ok(slot) => slot,
            Err(e) => {
                if ephemeral {
                    s.statements.remove(&statement_id);
                }
                s.settle(&self.pools).await;
                return Err(e);
            }
        };
        let newly_pinned = reason.is_some_and(|r| s.pin(r));
        if let Err(e) = s.ensure_connection(&self.pools, token).await {
            if let (true, Some(r)) = (newly_pinned, reason) {
                if s.conn.is_none() {
                    s.unpin_reason(r);
                }
            }
            s.settle(&self.pools).await;
            return Err(e);
        }

        let limit = s.config.network_timeout();
        let conn = s.connection()?;
        let result = pool.segregation().measure(op, guarded(token, limit, conn.backend().execute(&sql, &params))).await;
        let exec = match result {
            Ok(exec) => exec,
            Err(e) => {
                if interrupted(&e) {
                    conn.state.interrupted = true;
                    warn!(target: "proxima::cursor", session = %s.id, error = %e, "execution abandoned");
                }
                if ephemeral {
                    s.statements.remove(&statement_id);
                }
                s.settle(&self.pools).await;
                return Err(e);
            }
        };
        if reason.is_some_and(|r| r != PinReason::Branch) {
            conn.state.session_dirty = true;
        }
        if boundary == Some(TransactionBoundary::End) && s.config.autocommit {
            s.unpin_reason(PinReason::LocalTransaction);
        }

        match exec {
            Execution::UpdateCount(count) => {
                if ephemeral {
                    s.statements.remove(&statement_id);
                }
                s.settle(&self.pools).await;
                Ok(ExecuteOutcome::UpdateCount { count })
            }
            Execution::Rows(backend) => {
                let id = CursorId::new();
                let cursor = ResultCursor::new(id, statement_id, backend, fetch_size);
                let columns = cursor.columns.clone();
                s.cursors.insert(id, cursor);
                debug!(target: "proxima::cursor", session = %s.id, cursor = %id, "cursor opened");
                Ok(ExecuteOutcome::Cursor { cursor_id: id, columns })
            }
        }
    }

    /// Ad-hoc execution of literal SQL with positional parameters.
    pub async fn execute_sql(&self, s: &mut Session, token: &CancellationToken, sql: &str, params: Vec<Value>) -> ProxyResult<ExecuteOutcome> {
        let mut stmt = Statement::new(sql, s.config.fetch_size, true);
        if params.len() != stmt.param_count() {
            return Err(ProxyError::protocol(format!(
                "statement has {} parameters but {} values were supplied",
                stmt.param_count(),
                params.len()
            )));
        }
        let id = stmt.id;
        stmt.params = params.into_iter().map(Some).collect();
        s.statements.insert(id, stmt);
        self.execute(s, token, id).await
    }

    pub async fn fetch_next(&self, s: &mut Session, token: &CancellationToken, cursor_id: CursorId, block: usize) -> ProxyResult<FetchBlock> {
        let limit = s.config.network_timeout();
        let cap = s.config.max_fetch_rows.max(1);
        let cur = s.cursors.get_mut(&cursor_id).ok_or_else(|| ProxyError::stale(HandleKind::Cursor, cursor_id))?;
        if cur.exhausted {
            return Err(ProxyError::protocol(format!("cursor {cursor_id} is closed: its rows were exhausted")));
        }
        let n = (if block == 0 { cur.fetch_size.max(1) } else { block }).min(cap);

        let filled = async {
            while cur.ahead.len() <= n {
                let Some(backend) = cur.backend.as_mut() else { break };
                let rows = guarded(token, limit, backend.fetch(n)).await?;
                if rows.is_empty() {
                    cur.release_backend().await;
                    break;
                }
                cur.ahead.extend(rows);
            }
            Ok::<(), ProxyError>(())
        }
        .await;
        if let Err(e) = filled {
            if interrupted(&e) {
                if let Some(conn) = s.conn.as_mut() {
                    conn.state.interrupted = true;
                }
            }
            warn!(target: "proxima::cursor", session = %s.id, cursor = %cursor_id, error = %e, "fetch failed; cursor closed");
            discard_cursor(s, cursor_id).await;
            s.settle(&self.pools).await;
            return Err(e);
        }

        let take = n.min(cur.ahead.len());
        let rows: Vec<Row> = cur.ahead.drain(..take).collect();
        let first_row = cur.delivered;
        cur.delivered += rows.len() as u64;
        let has_more = !cur.ahead.is_empty() || cur.backend.is_some();

        cur.retained.clear();
        let threshold = self.lobs.inline_threshold;
        let mut out = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            let pos = first_row + i as u64;
            let mut cells = Vec::with_capacity(row.len());
            for (c, value) in row.into_iter().enumerate() {
                let large_column = cur.columns.get(c).is_some_and(|col| col.large);
                let cell = match value {
                    Value::Lob(lob) => {
                        let Some(conn) = s.conn.as_mut() else {
                            return Err(ProxyError::internal("large object without a backing connection"));
                        };
                        let length = guarded(token, limit, conn.backend().lob_length(&lob)).await?;
                        match length {
                            Some(len) if (len as usize) < threshold => {
                                let bytes = guarded(token, limit, conn.backend().read_lob(&lob, 0, len as usize)).await?;
                                WireValue::Inline(inline_lob(lob.kind, bytes))
                            }
                            _ => {
                                cur.retained.insert((pos, c), Retained::Locator { lob, length });
                                WireValue::Stream { kind: lob.kind, length }
                            }
                        }
                    }
                    Value::Bytes(b) if b.len() >= threshold => {
                        let length = Some(b.len() as u64);
                        cur.retained.insert((pos, c), Retained::Bytes { data: Arc::from(b), kind: LobKind::Binary });
                        WireValue::Stream { kind: LobKind::Binary, length }
                    }
                    Value::Text(t) if t.len() >= threshold => {
                        let length = Some(t.len() as u64);
                        cur.retained.insert((pos, c), Retained::Bytes { data: Arc::from(t.into_bytes()), kind: LobKind::Character });
                        WireValue::Stream { kind: LobKind::Character, length }
                    }
                    Value::Null if large_column => {
                        let kind = cur.columns.get(c).map(|col| lob_kind_of(&col.type_name)).unwrap_or(LobKind::Binary);
                        cur.retained.insert((pos, c), Retained::Null { kind });
                        WireValue::Inline(Value::Null)
                    }
                    other => WireValue::Inline(other),
                };
                cells.push(cell);
            }
            out.push(cells);
        }

        if !has_more {
            cur.exhausted = true;
            cur.release_backend().await;
            debug!(target: "proxima::cursor", session = %s.id, cursor = %cursor_id, rows = cur.delivered, "cursor exhausted");
            s.settle(&self.pools).await;
        }
        Ok(FetchBlock { first_row, rows: out, has_more })
    }

    pub async fn close_cursor(&self, s: &mut Session, cursor_id: CursorId) -> ProxyResult<()> {
        if !s.cursors.contains_key(&cursor_id) {
            return Err(ProxyError::stale(HandleKind::Cursor, cursor_id));
        }
        discard_cursor(s, cursor_id).await;
        s.settle(&self.pools).await;
        Ok(())
    }

    pub async fn close_statement(&self, s: &mut Session, statement_id: StatementId) -> ProxyResult<()> {
        if s.statements.remove(&statement_id).is_none() {
            return Err(ProxyError::stale(HandleKind::Statement, statement_id));
        }
        let cursors: Vec<CursorId> = s.cursors.values().filter(|c| c.statement_id == statement_id).map(|c| c.id).collect();
        for id in cursors {
            discard_cursor(s, id).await;
        }
        s.streams.retain(|_, st| !matches!(st.owner, StreamOwner::Parameter { statement, .. } if statement == statement_id));
        s.settle(&self.pools).await;
        Ok(())
    }
}

/// Drop a cursor, its backend resource and any stream reading from it. Ephemeral statements go
/// with their cursor.
pub(crate) async fn discard_cursor(s: &mut Session, cursor_id: CursorId) {
    let Some(mut cur) = s.cursors.remove(&cursor_id) else { return };
    cur.release_backend().await;
    let before = s.streams.len();
    s.streams.retain(|_, st| st.owner != StreamOwner::Cursor(cursor_id));
    if s.streams.len() < before {
        debug!(target: "proxima::cursor", cursor = %cursor_id, abandoned = before - s.streams.len(), "abandoned read streams");
    }
    let ephemeral = s.statements.get(&cur.statement_id).is_some_and(|st| st.ephemeral);
    if ephemeral && !s.cursors.values().any(|c| c.statement_id == cur.statement_id) {
        s.statements.remove(&cur.statement_id);
    }
}

fn inline_lob(kind: LobKind, bytes: Vec<u8>) -> Value {
    match kind {
        LobKind::Binary => Value::Bytes(bytes),
        LobKind::Character => match String::from_utf8(bytes) {
            Ok(s) => Value::Text(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
    }
}

fn lob_kind_of(type_name: &str) -> LobKind {
    let t = type_name.to_ascii_uppercase();
    if t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB") { LobKind::Character } else { LobKind::Binary }
}
