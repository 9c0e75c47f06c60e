//! PostgreSQL family over `tokio-postgres`.
//!
//! Autocommit off is emulated with an explicit BEGIN before the first statement of each unit
//! of work. XA branches map onto `PREPARE TRANSACTION` with a global id derived from the xid,
//! and large objects onto the server-side `lo_*` functions.
//!
//! Result rows stream from the server as the cursor is fetched. One client carries one request
//! at a time, so before the connection is used for anything else the open stream is drained
//! into its cursor's buffer.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, RowStream, Statement};
use tracing::{debug, warn};

use super::{
    BackendConnection, BackendCursor, BackendDriver, BackendTarget, BranchOp, BranchReply, EndFlags, Execution,
    IsolationLevel, ResetOutcome, StartFlags, XaVote, Xid,
};
use crate::affinity::{AffinityPattern, PinReason};
use crate::error::{BackendError, XaCode};
use crate::value::{Column, LobKind, LobLocator, Row, Value};

type Param = Box<dyn ToSql + Sync + Send>;

const EXTRA_PATTERNS: &[(&str, &str, PinReason)] = &[
    ("listen", r"^LISTEN\s+\S", PinReason::SessionVariable),
    ("lo-open", r"\bLO_OPEN\s*\(", PinReason::LargeObject),
    ("declare-cursor", r"^DECLARE\s+\S+\s+.*\bCURSOR\b", PinReason::PreparedSql),
];

#[derive(Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self { Self }
}

#[async_trait]
impl BackendDriver for PostgresDriver {
    fn family(&self) -> &str { "postgres" }

    async fn open(&self, target: &BackendTarget) -> Result<Box<dyn BackendConnection>, BackendError> {
        let url = format!("postgresql://{}", target.location());
        let mut config: tokio_postgres::Config =
            url.parse().map_err(|e| BackendError::with_state("08001", format!("invalid postgres url: {e}")))?;
        if let Some(user) = &target.username {
            config.user(user);
        }
        if let Some(password) = &target.password {
            config.password(password);
        }
        let (client, connection) = config.connect(NoTls).await.map_err(pg_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(target: "proxima::backend", error = %e, "postgres connection ended");
            }
        });
        Ok(Box::new(PostgresConnection {
            client,
            autocommit: true,
            in_tx: false,
            branch: None,
            open_feed: Mutex::new(None),
        }))
    }

    fn affinity_patterns(&self) -> Vec<AffinityPattern> {
        EXTRA_PATTERNS
            .iter()
            .filter_map(|(name, pat, reason)| AffinityPattern::new(name, pat, *reason).ok())
            .collect()
    }
}

struct OpenBranch {
    xid: Xid,
    ended: bool,
    rollback_only: bool,
}

pub struct PostgresConnection {
    client: Client,
    autocommit: bool,
    in_tx: bool,
    branch: Option<OpenBranch>,
    /// Row stream of the most recent query, while its cursor is alive.
    open_feed: Mutex<Option<Weak<tokio::sync::Mutex<RowFeed>>>>,
}

fn pg_error(e: tokio_postgres::Error) -> BackendError {
    match e.as_db_error() {
        Some(db) => BackendError::with_state(db.code().code(), db.message().to_string()),
        None if e.is_closed() => BackendError::with_state("08006", e.to_string()),
        None => BackendError::with_state("08000", e.to_string()),
    }
}

fn xa_error(code: XaCode, message: String) -> BackendError {
    let state = match code {
        XaCode::RbRollback => "XA100",
        XaCode::Nota => "XAE04",
        XaCode::Proto => "XAE06",
        XaCode::DupId => "XAE08",
        _ => "XAE03",
    };
    BackendError::with_state(state, message).with_code(code.code())
}

/// Global transaction id used with `PREPARE TRANSACTION`. Hex keeps it quote-free.
fn gid(xid: &Xid) -> String {
    format!("{}_{}_{}", xid.format_id, hex(&xid.gtrid), hex(&xid.bqual))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok()).collect()
}

fn parse_gid(gid: &str) -> Option<Xid> {
    let mut parts = gid.splitn(3, '_');
    let format_id = parts.next()?.parse().ok()?;
    let gtrid = unhex(parts.next()?)?;
    let bqual = unhex(parts.next()?)?;
    Some(Xid::new(format_id, gtrid, bqual))
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start().split(|c: char| !c.is_ascii_alphabetic()).next().unwrap_or("").to_ascii_uppercase()
}

fn int_param<T: TryFrom<i64>>(value: &Value) -> Option<Option<T>> {
    match value {
        Value::Null => Some(None),
        Value::Lob(l) => T::try_from(l.id as i64).ok().map(Some),
        other => other.as_i64().and_then(|i| T::try_from(i).ok()).map(Some),
    }
}

fn float_param(value: &Value) -> Option<Option<f64>> {
    match value {
        Value::Null => Some(None),
        Value::Float(f) => Some(Some(*f)),
        Value::Int(i) => Some(Some(*i as f64)),
        Value::Text(s) => s.trim().parse().ok().map(Some),
        _ => None,
    }
}

/// Convert one bound value to the wire type the server inferred for its placeholder.
fn param(value: &Value, ty: &Type) -> Result<Param, BackendError> {
    let mismatch = || BackendError::with_state("22023", format!("cannot bind {} to a {} parameter", value.type_name(), ty.name()));
    let boxed: Param = match *ty {
        Type::BOOL => Box::new(match value {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            other => Some(other.as_i64().ok_or_else(mismatch)? != 0),
        }),
        Type::INT2 => Box::new(int_param::<i16>(value).ok_or_else(mismatch)?),
        Type::INT4 => Box::new(int_param::<i32>(value).ok_or_else(mismatch)?),
        Type::INT8 => Box::new(int_param::<i64>(value).ok_or_else(mismatch)?),
        Type::OID => Box::new(int_param::<u32>(value).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(float_param(value).ok_or_else(mismatch)?.map(|f| f as f32)),
        Type::FLOAT8 => Box::new(float_param(value).ok_or_else(mismatch)?),
        Type::BYTEA => Box::new(match value {
            Value::Null => None,
            Value::Bytes(b) => Some(b.clone()),
            Value::Text(s) => Some(s.as_bytes().to_vec()),
            _ => return Err(mismatch()),
        }),
        _ => Box::new(match value {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
    };
    Ok(boxed)
}

fn cell<'a, T, F>(row: &'a tokio_postgres::Row, idx: usize, f: F) -> Value
where
    T: tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => f(v),
        _ => Value::Null,
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| match *col.type_() {
            Type::BOOL => cell(row, i, Value::Bool),
            Type::INT2 => cell(row, i, |v: i16| Value::Int(v.into())),
            Type::INT4 => cell(row, i, |v: i32| Value::Int(v.into())),
            Type::INT8 => cell(row, i, Value::Int),
            Type::OID => cell(row, i, |v: u32| Value::Int(v.into())),
            Type::FLOAT4 => cell(row, i, |v: f32| Value::Float(v.into())),
            Type::FLOAT8 => cell(row, i, Value::Float),
            Type::BYTEA => cell(row, i, Value::Bytes),
            _ => cell(row, i, Value::Text),
        })
        .collect()
}

impl PostgresConnection {
    /// The client, once any row stream still in flight has been read to its end.
    async fn client(&self) -> &Client {
        let open = self.open_feed.lock().take().and_then(|w| w.upgrade());
        if let Some(feed) = open {
            let mut feed = feed.lock().await;
            let before = feed.buffered.len();
            feed.pull(usize::MAX).await;
            debug!(target: "proxima::backend", rows = feed.buffered.len() - before, "drained open row stream");
        }
        &self.client
    }

    async fn simple(&self, sql: &str) -> Result<(), BackendError> {
        self.client().await.batch_execute(sql).await.map_err(pg_error)
    }

    async fn bind(&self, sql: &str, params: &[Value]) -> Result<(Statement, Vec<Param>), BackendError> {
        let stmt = self.client().await.prepare(sql).await.map_err(pg_error)?;
        if stmt.params().len() != params.len() {
            return Err(BackendError::with_state(
                "08P01",
                format!("statement expects {} parameters, got {}", stmt.params().len(), params.len()),
            ));
        }
        let bound = params.iter().zip(stmt.params()).map(|(v, ty)| param(v, ty)).collect::<Result<Vec<_>, _>>()?;
        Ok((stmt, bound))
    }

    /// Open the implicit transaction for autocommit-off work.
    async fn ensure_tx(&mut self) -> Result<(), BackendError> {
        if !self.autocommit && !self.in_tx && self.branch.is_none() {
            self.simple("BEGIN").await?;
            self.in_tx = true;
        }
        Ok(())
    }

    fn track(&mut self, sql: &str) {
        match leading_keyword(sql).as_str() {
            "BEGIN" | "START" => self.in_tx = true,
            "COMMIT" | "ROLLBACK" | "END" | "ABORT" => self.in_tx = false,
            _ => {}
        }
    }

    fn branch_for(&self, xid: &Xid) -> Option<&OpenBranch> {
        self.branch.as_ref().filter(|b| &b.xid == xid)
    }

    async fn recover(&self) -> Result<Vec<Xid>, BackendError> {
        let rows = self
            .client()
            .await
            .query("SELECT gid FROM pg_prepared_xacts WHERE database = current_database()", &[])
            .await
            .map_err(pg_error)?;
        Ok(rows.iter().filter_map(|r| r.try_get::<_, String>(0).ok()).filter_map(|g| parse_gid(&g)).collect())
    }

    async fn finish_prepared(&self, verb: &str, xid: &Xid) -> Result<(), BackendError> {
        if self.in_tx || self.branch.is_some() {
            return Err(xa_error(XaCode::Proto, format!("{verb} PREPARED {xid} inside an open transaction")));
        }
        match self.simple(&format!("{verb} PREPARED '{}'", gid(xid))).await {
            Err(e) if e.sqlstate.as_deref() == Some("42704") => Err(xa_error(XaCode::Nota, format!("unknown xid {xid}"))),
            other => other,
        }
    }
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, BackendError> {
        self.ensure_tx().await?;
        let (stmt, bound) = self.bind(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        if stmt.columns().is_empty() {
            let n = self.client.execute(&stmt, &refs).await.map_err(pg_error)?;
            self.track(sql);
            return Ok(Execution::UpdateCount(n));
        }
        let columns = stmt.columns().iter().map(|c| Column::new(c.name(), c.type_().name())).collect();
        let stream = self.client.query_raw(&stmt, refs.iter().copied()).await.map_err(pg_error)?;
        let feed = Arc::new(tokio::sync::Mutex::new(RowFeed::new(stream)));
        *self.open_feed.lock() = Some(Arc::downgrade(&feed));
        Ok(Execution::Rows(Box::new(PgCursor { columns, feed })))
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        if self.in_tx {
            self.simple("COMMIT").await?;
            self.in_tx = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        if self.in_tx {
            self.simple("ROLLBACK").await?;
            self.in_tx = false;
        }
        Ok(())
    }

    async fn set_autocommit(&mut self, on: bool) -> Result<(), BackendError> {
        if on && !self.autocommit {
            self.commit().await?;
        }
        self.autocommit = on;
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), BackendError> {
        self.simple(&format!("SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}", level.as_sql())).await
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), BackendError> {
        let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
        self.simple(&format!("SET SESSION CHARACTERISTICS AS TRANSACTION {mode}")).await
    }

    async fn reset_session(&mut self) -> Result<ResetOutcome, BackendError> {
        if self.in_tx || self.branch.is_some() {
            self.simple("ROLLBACK").await?;
        }
        self.in_tx = false;
        self.branch = None;
        self.autocommit = true;
        self.simple("DISCARD ALL").await?;
        Ok(ResetOutcome::Verified)
    }

    async fn ping(&mut self) -> bool {
        !self.client.is_closed() && self.client().await.simple_query("SELECT 1").await.is_ok()
    }

    async fn participate(&mut self, op: BranchOp<'_>) -> Result<BranchReply, BackendError> {
        match op {
            BranchOp::Start { xid, flags: StartFlags::NoFlags } => {
                if let Some(open) = &self.branch {
                    let code = if open.xid == *xid { XaCode::DupId } else { XaCode::Proto };
                    return Err(xa_error(code, format!("connection already carries branch {}", open.xid)));
                }
                if self.in_tx {
                    return Err(xa_error(XaCode::Proto, "local transaction in progress".to_string()));
                }
                self.simple("BEGIN").await?;
                self.branch = Some(OpenBranch { xid: xid.clone(), ended: false, rollback_only: false });
                Ok(BranchReply::Done)
            }
            BranchOp::Start { xid, .. } => match self.branch.as_mut().filter(|b| &b.xid == xid) {
                Some(open) => {
                    open.ended = false;
                    Ok(BranchReply::Done)
                }
                None => Err(xa_error(XaCode::Nota, format!("unknown xid {xid}"))),
            },
            BranchOp::End { xid, flags } => match self.branch.as_mut().filter(|b| &b.xid == xid) {
                Some(open) => {
                    open.ended = true;
                    if flags == EndFlags::Fail {
                        open.rollback_only = true;
                    }
                    Ok(BranchReply::Done)
                }
                None => Err(xa_error(XaCode::Nota, format!("unknown xid {xid}"))),
            },
            BranchOp::Prepare { xid } => {
                let Some(open) = self.branch_for(xid) else {
                    return Err(xa_error(XaCode::Nota, format!("unknown xid {xid}")));
                };
                if open.rollback_only {
                    self.simple("ROLLBACK").await?;
                    self.branch = None;
                    return Err(xa_error(XaCode::RbRollback, format!("branch {xid} was marked rollback-only")));
                }
                let row = self.client().await.query_one("SELECT txid_current_if_assigned() IS NULL", &[]).await.map_err(pg_error)?;
                let untouched: bool = row.try_get(0).map_err(pg_error)?;
                let vote = if untouched {
                    self.simple("COMMIT").await?;
                    XaVote::ReadOnly
                } else {
                    self.simple(&format!("PREPARE TRANSACTION '{}'", gid(xid))).await?;
                    XaVote::Commit
                };
                self.branch = None;
                Ok(BranchReply::Vote(vote))
            }
            BranchOp::Commit { xid, one_phase: true } => {
                let Some(open) = self.branch_for(xid) else {
                    return Err(xa_error(XaCode::Nota, format!("unknown xid {xid}")));
                };
                let rollback_only = open.rollback_only;
                self.branch = None;
                if rollback_only {
                    self.simple("ROLLBACK").await?;
                    return Err(xa_error(XaCode::RbRollback, format!("branch {xid} was marked rollback-only")));
                }
                self.simple("COMMIT").await?;
                Ok(BranchReply::Done)
            }
            BranchOp::Commit { xid, one_phase: false } => {
                self.finish_prepared("COMMIT", xid).await?;
                Ok(BranchReply::Done)
            }
            BranchOp::Rollback { xid } => {
                if self.branch_for(xid).is_some() {
                    self.branch = None;
                    self.simple("ROLLBACK").await?;
                } else {
                    self.finish_prepared("ROLLBACK", xid).await?;
                }
                Ok(BranchReply::Done)
            }
            BranchOp::Recover => Ok(BranchReply::Recovered(self.recover().await?)),
            BranchOp::Forget { xid } => Err(xa_error(XaCode::Nota, format!("no heuristic outcome recorded for {xid}"))),
            // branch timeouts are enforced by the coordinator
            BranchOp::SetTimeout { .. } => Ok(BranchReply::Done),
        }
    }

    async fn create_lob(&mut self, kind: LobKind) -> Result<LobLocator, BackendError> {
        self.ensure_tx().await?;
        let row = self.client().await.query_one("SELECT lo_create(0)", &[]).await.map_err(pg_error)?;
        let oid: u32 = row.try_get(0).map_err(pg_error)?;
        Ok(LobLocator { id: oid.into(), kind })
    }

    async fn write_lob(&mut self, lob: &LobLocator, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        let oid = lob_oid(lob)?;
        let offset = i64::try_from(offset).map_err(|_| BackendError::with_state("22003", "lob offset out of range"))?;
        self.client()
            .await
            .execute("SELECT lo_put($1, $2, $3)", &[&oid, &offset, &bytes])
            .await
            .map_err(pg_error)?;
        Ok(())
    }

    async fn read_lob(&mut self, lob: &LobLocator, offset: u64, max: usize) -> Result<Vec<u8>, BackendError> {
        let oid = lob_oid(lob)?;
        let offset = i64::try_from(offset).map_err(|_| BackendError::with_state("22003", "lob offset out of range"))?;
        let len = i32::try_from(max).unwrap_or(i32::MAX);
        let row = self
            .client()
            .await
            .query_one("SELECT lo_get($1, $2, $3)", &[&oid, &offset, &len])
            .await
            .map_err(pg_error)?;
        row.try_get::<_, Vec<u8>>(0).map_err(pg_error)
    }

    async fn lob_length(&mut self, _lob: &LobLocator) -> Result<Option<u64>, BackendError> {
        // only known by reading to the end
        Ok(None)
    }

    async fn close(self: Box<Self>) {
        if self.in_tx || self.branch.is_some() {
            if let Err(e) = self.client().await.batch_execute("ROLLBACK").await {
                warn!(target: "proxima::backend", error = %e, "rollback on close failed");
            }
        }
    }
}

fn lob_oid(lob: &LobLocator) -> Result<u32, BackendError> {
    u32::try_from(lob.id).map_err(|_| BackendError::with_state("22023", format!("lob locator {} is not a postgres oid", lob.id)))
}

/// Rows read off the wire but not yet fetched, plus the rest of the stream.
struct RowFeed {
    stream: Option<Pin<Box<RowStream>>>,
    buffered: VecDeque<Row>,
    failed: Option<BackendError>,
}

impl RowFeed {
    fn new(stream: RowStream) -> Self { Self { stream: Some(Box::pin(stream)), buffered: VecDeque::new(), failed: None } }

    /// Read until `want` rows are buffered or the stream ends. A stream error is kept for the
    /// fetch that reaches it.
    async fn pull(&mut self, want: usize) {
        while self.buffered.len() < want {
            let Some(stream) = self.stream.as_mut() else { return };
            match stream.next().await {
                Some(Ok(row)) => self.buffered.push_back(convert_row(&row)),
                Some(Err(e)) => {
                    self.failed = Some(pg_error(e));
                    self.stream = None;
                }
                None => self.stream = None,
            }
        }
    }
}

struct PgCursor {
    columns: Vec<Column>,
    feed: Arc<tokio::sync::Mutex<RowFeed>>,
}

#[async_trait]
impl BackendCursor for PgCursor {
    fn columns(&self) -> &[Column] { &self.columns }

    async fn fetch(&mut self, n: usize) -> Result<Vec<Row>, BackendError> {
        let mut feed = self.feed.lock().await;
        feed.pull(n).await;
        if feed.buffered.is_empty() {
            if let Some(e) = feed.failed.take() {
                return Err(e);
            }
        }
        let take = n.min(feed.buffered.len());
        Ok(feed.buffered.drain(..take).collect())
    }

    // dropping the stream lets the client discard whatever the server still sends
    async fn close(self: Box<Self>) {}
}
