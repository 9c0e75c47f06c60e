//! Transport-agnostic request envelope.
//!
//! A `Request` is one client call, tagged by `op`. `Dispatcher::dispatch` routes it to the
//! `Proxy` and folds the outcome into a `Reply`, so any transport (the HTTP server here, or a
//! test calling it directly) sees exactly the same JSON shapes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::backend::{EndFlags, StartFlags, Xid};
use crate::error::{ErrorCategory, ProxyError, ProxyResult};
use crate::proxy::Proxy;
use crate::session::{CursorId, SessionId, SessionOption, StatementId, StreamId};
use crate::value::{b64, LobKind, Value};

fn default_start_flags() -> StartFlags { StartFlags::NoFlags }
fn default_end_flags() -> EndFlags { EndFlags::Success }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    OpenSession { datasource: String },
    CloseSession { session: SessionId },
    Touch { session: SessionId },
    Cancel { session: SessionId },
    Describe { session: SessionId },
    GetConfig { session: SessionId },
    SetConfig { session: SessionId, option: SessionOption },
    Begin { session: SessionId },
    Commit { session: SessionId },
    Rollback { session: SessionId },
    Unpin { session: SessionId },

    Prepare { session: SessionId, sql: String },
    Bind { session: SessionId, statement: StatementId, index: usize, value: Value },
    Execute { session: SessionId, statement: StatementId },
    ExecuteSql {
        session: SessionId,
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    CloseStatement { session: SessionId, statement: StatementId },
    FetchNext {
        session: SessionId,
        cursor: CursorId,
        #[serde(default)]
        block: usize,
    },
    CloseCursor { session: SessionId, cursor: CursorId },

    OpenRead { session: SessionId, cursor: CursorId, row: u64, column: usize },
    ReadChunk { session: SessionId, stream: StreamId, max_bytes: usize },
    OpenWrite { session: SessionId, statement: StatementId, index: usize, kind: LobKind },
    WriteChunk {
        session: SessionId,
        stream: StreamId,
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    CloseWrite { session: SessionId, stream: StreamId },
    Abandon { session: SessionId, stream: StreamId },

    XaStart {
        session: SessionId,
        xid: Xid,
        #[serde(default = "default_start_flags")]
        flags: StartFlags,
    },
    XaEnd {
        session: SessionId,
        xid: Xid,
        #[serde(default = "default_end_flags")]
        flags: EndFlags,
    },
    XaPrepare { session: SessionId, xid: Xid },
    XaCommit {
        session: SessionId,
        xid: Xid,
        #[serde(default)]
        one_phase: bool,
    },
    XaRollback { session: SessionId, xid: Xid },
    XaRecover { session: SessionId },
    XaForget { session: SessionId, xid: Xid },
    XaSetTimeout {
        session: SessionId,
        #[serde(default)]
        xid: Option<Xid>,
        seconds: u32,
    },
    XaGetTimeout {
        session: SessionId,
        #[serde(default)]
        xid: Option<Xid>,
    },
    XaIsSameRm { session: SessionId, other: SessionId },
}

impl Request {
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::OpenSession { .. } => "open_session",
            Request::CloseSession { .. } => "close_session",
            Request::Touch { .. } => "touch",
            Request::Cancel { .. } => "cancel",
            Request::Describe { .. } => "describe",
            Request::GetConfig { .. } => "get_config",
            Request::SetConfig { .. } => "set_config",
            Request::Begin { .. } => "begin",
            Request::Commit { .. } => "commit",
            Request::Rollback { .. } => "rollback",
            Request::Unpin { .. } => "unpin",
            Request::Prepare { .. } => "prepare",
            Request::Bind { .. } => "bind",
            Request::Execute { .. } => "execute",
            Request::ExecuteSql { .. } => "execute_sql",
            Request::CloseStatement { .. } => "close_statement",
            Request::FetchNext { .. } => "fetch_next",
            Request::CloseCursor { .. } => "close_cursor",
            Request::OpenRead { .. } => "open_read",
            Request::ReadChunk { .. } => "read_chunk",
            Request::OpenWrite { .. } => "open_write",
            Request::WriteChunk { .. } => "write_chunk",
            Request::CloseWrite { .. } => "close_write",
            Request::Abandon { .. } => "abandon",
            Request::XaStart { .. } => "xa_start",
            Request::XaEnd { .. } => "xa_end",
            Request::XaPrepare { .. } => "xa_prepare",
            Request::XaCommit { .. } => "xa_commit",
            Request::XaRollback { .. } => "xa_rollback",
            Request::XaRecover { .. } => "xa_recover",
            Request::XaForget { .. } => "xa_forget",
            Request::XaSetTimeout { .. } => "xa_set_timeout",
            Request::XaGetTimeout { .. } => "xa_get_timeout",
            Request::XaIsSameRm { .. } => "xa_is_same_rm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub category: ErrorCategory,
    pub code: String,
    pub sqlstate: Option<String>,
    pub vendor_code: Option<i32>,
    pub message: String,
}

impl From<&ProxyError> for ErrorBody {
    fn from(e: &ProxyError) -> Self {
        Self {
            category: e.category(),
            code: e.code_str().to_string(),
            sqlstate: e.sqlstate().map(str::to_string),
            vendor_code: e.vendor_code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(result: Json) -> Self { Self { ok: true, result: Some(result), error: None } }

    pub fn failure(err: &ProxyError) -> Self { Self { ok: false, result: None, error: Some(err.into()) } }
}

fn to_json<T: Serialize>(v: T) -> ProxyResult<Json> {
    serde_json::to_value(v).map_err(|e| ProxyError::internal(format!("encoding reply: {e}")))
}

fn done() -> ProxyResult<Json> { Ok(json!({})) }

#[derive(Clone)]
pub struct Dispatcher {
    proxy: Arc<Proxy>,
}

impl Dispatcher {
    pub fn new(proxy: Arc<Proxy>) -> Self { Self { proxy } }

    pub fn proxy(&self) -> &Arc<Proxy> { &self.proxy }

    pub async fn dispatch(&self, req: Request) -> Reply { self.handle(req).await.1 }

    /// Reply plus the HTTP status its outcome maps to.
    pub async fn handle(&self, req: Request) -> (u16, Reply) {
        let op = req.op_name();
        match self.route(req).await {
            Ok(v) => (200, Reply::success(v)),
            Err(e) => {
                debug!(target: "proxima::server", op = op, error = %e, "call failed");
                (e.http_status(), Reply::failure(&e))
            }
        }
    }

    async fn route(&self, req: Request) -> ProxyResult<Json> {
        let p = &self.proxy;
        match req {
            Request::OpenSession { datasource } => to_json(json!({ "session": p.open_session(&datasource).await? })),
            Request::CloseSession { session } => {
                p.close_session(session).await?;
                done()
            }
            Request::Touch { session } => {
                p.touch(session)?;
                done()
            }
            Request::Cancel { session } => {
                p.cancel(session)?;
                done()
            }
            Request::Describe { session } => to_json(p.describe(session).await?),
            Request::GetConfig { session } => to_json(p.get_config(session).await?),
            Request::SetConfig { session, option } => to_json(p.set_config(session, option).await?),
            Request::Begin { session } => {
                p.begin(session).await?;
                done()
            }
            Request::Commit { session } => {
                p.commit(session).await?;
                done()
            }
            Request::Rollback { session } => {
                p.rollback(session).await?;
                done()
            }
            Request::Unpin { session } => {
                p.unpin(session).await?;
                done()
            }

            Request::Prepare { session, sql } => to_json(p.prepare(session, &sql).await?),
            Request::Bind { session, statement, index, value } => {
                p.bind(session, statement, index, value).await?;
                done()
            }
            Request::Execute { session, statement } => to_json(p.execute(session, statement).await?),
            Request::ExecuteSql { session, sql, params } => to_json(p.execute_sql(session, &sql, params).await?),
            Request::CloseStatement { session, statement } => {
                p.close_statement(session, statement).await?;
                done()
            }
            Request::FetchNext { session, cursor, block } => to_json(p.fetch_next(session, cursor, block).await?),
            Request::CloseCursor { session, cursor } => {
                p.close_cursor(session, cursor).await?;
                done()
            }

            Request::OpenRead { session, cursor, row, column } => to_json(p.open_read(session, cursor, row, column).await?),
            Request::ReadChunk { session, stream, max_bytes } => to_json(p.read_chunk(session, stream, max_bytes).await?),
            Request::OpenWrite { session, statement, index, kind } => {
                to_json(json!({ "stream": p.open_write(session, statement, index, kind).await? }))
            }
            Request::WriteChunk { session, stream, bytes } => {
                to_json(json!({ "written": p.write_chunk(session, stream, &bytes).await? }))
            }
            Request::CloseWrite { session, stream } => {
                let length = p.close_write(session, stream).await?;
                to_json(json!({ "length": length, "null": length.is_none() }))
            }
            Request::Abandon { session, stream } => {
                p.abandon(session, stream).await?;
                done()
            }

            Request::XaStart { session, xid, flags } => {
                p.xa_start(session, &xid, flags).await?;
                done()
            }
            Request::XaEnd { session, xid, flags } => {
                p.xa_end(session, &xid, flags).await?;
                done()
            }
            Request::XaPrepare { session, xid } => to_json(json!({ "vote": p.xa_prepare(session, &xid).await? })),
            Request::XaCommit { session, xid, one_phase } => {
                p.xa_commit(session, &xid, one_phase).await?;
                done()
            }
            Request::XaRollback { session, xid } => {
                p.xa_rollback(session, &xid).await?;
                done()
            }
            Request::XaRecover { session } => to_json(json!({ "xids": p.xa_recover(session).await? })),
            Request::XaForget { session, xid } => {
                p.xa_forget(session, &xid).await?;
                done()
            }
            Request::XaSetTimeout { session, xid, seconds } => {
                to_json(json!({ "applied": p.xa_set_timeout(session, xid.as_ref(), seconds).await? }))
            }
            Request::XaGetTimeout { session, xid } => {
                to_json(json!({ "seconds": p.xa_get_timeout(session, xid.as_ref()).await? }))
            }
            Request::XaIsSameRm { session, other } => to_json(json!({ "same": p.xa_is_same_rm(session, other)? })),
        }
    }
}
