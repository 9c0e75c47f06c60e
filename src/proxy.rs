//!
//! proxima engine
//! --------------
//! `Proxy` wires the pool manager, affinity detector, session registry, cursor engine, LOB
//! manager and XA coordinator together and is the only thing the dispatcher talks to.
//!
//! Every client call resolves its session, waits for the session's previous call to finish,
//! and runs under that session's cancel token. Two background loops run next to the calls:
//! the idle-session reaper and the pool housekeeping pass (idle eviction, leak detection and
//! branch timeouts).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::affinity::{AffinityDetector, PinReason};
use crate::backend::{DriverRegistry, EndFlags, StartFlags, XaVote, Xid};
use crate::config::ProxyConfig;
use crate::cursor::{discard_cursor, CursorEngine, ExecuteOutcome, FetchBlock, Prepared};
use crate::error::{ProxyError, ProxyResult};
use crate::lob::{Chunk, LobManager, ReadOpened};
use crate::pool::{IdleInfo, PoolManager, PoolStats};
use crate::segregation::SegregationStatus;
use crate::session::{
    guarded, interrupted, CursorId, Session, SessionCall, SessionConfig, SessionId, SessionInfo, SessionOption,
    SessionRegistry, StatementId, StreamId,
};
use crate::value::{LobKind, Value};
use crate::xa::TransactionCoordinator;

/// Pool view served by the introspection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    pub stats: PoolStats,
    pub idle: Vec<IdleInfo>,
    pub segregation: SegregationStatus,
}

pub struct Proxy {
    config: Arc<ProxyConfig>,
    pools: Arc<PoolManager>,
    sessions: SessionRegistry,
    cursors: CursorEngine,
    lobs: LobManager,
    xa: TransactionCoordinator,
    stop: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, drivers: DriverRegistry) -> ProxyResult<Arc<Self>> {
        config.validate()?;
        let detector = Arc::new(AffinityDetector::from_config(&config.affinity, &drivers)?);
        let config = Arc::new(config);
        let pools = Arc::new(PoolManager::new(config.clone(), drivers));
        info!(
            target: "proxima::session",
            patterns = detector.patterns().len(),
            default_target = %config.default_target,
            "proxy engine ready"
        );
        Ok(Arc::new(Self {
            cursors: CursorEngine::new(pools.clone(), detector, config.lobs.clone()),
            lobs: LobManager::new(pools.clone(), config.lobs.clone()),
            xa: TransactionCoordinator::new(pools.clone()),
            sessions: SessionRegistry::new(),
            pools,
            config,
            stop: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &ProxyConfig { &self.config }
    pub fn pools(&self) -> &Arc<PoolManager> { &self.pools }
    pub fn sessions(&self) -> &SessionRegistry { &self.sessions }
    pub fn coordinator(&self) -> &TransactionCoordinator { &self.xa }

    /// Spawn the reaper and housekeeping loops. They stop on `shutdown`.
    pub fn start_background(self: &Arc<Self>) {
        let reaper = {
            let this = self.clone();
            let every = self.config.sessions.reap_interval().max(Duration::from_millis(10));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.stop.cancelled() => break,
                        _ = tokio::time::sleep(every) => {}
                    }
                    let reaped = this.reap_idle().await;
                    if reaped > 0 {
                        debug!(target: "proxima::session", reaped = reaped, "reaper pass");
                    }
                }
            })
        };
        let housekeeper = {
            let this = self.clone();
            let every = self.config.defaults.housekeeping_interval().max(Duration::from_millis(10));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.stop.cancelled() => break,
                        _ = tokio::time::sleep(every) => {}
                    }
                    this.pools.housekeep().await;
                    this.expire_branches().await;
                }
            })
        };
        self.background.lock().extend([reaper, housekeeper]);
    }

    async fn call(&self, id: SessionId) -> ProxyResult<SessionCall> { self.sessions.begin_call(id).await }

    // ---- sessions ----

    pub async fn open_session(&self, datasource: &str) -> ProxyResult<SessionId> {
        if datasource.trim().is_empty() {
            return Err(ProxyError::protocol("datasource name is empty"));
        }
        if self.stop.is_cancelled() {
            return Err(ProxyError::exhausted(datasource, "proxy is shutting down"));
        }
        // fail fast on a datasource whose backend family is not compiled in
        self.pools.pool(datasource)?;
        Ok(self.sessions.open(datasource, SessionConfig::from_config(&self.config, datasource)))
    }

    pub async fn close_session(&self, id: SessionId) -> ProxyResult<()> {
        let slot = self.sessions.remove(id)?;
        slot.cancel_permanently();
        let mut s = slot.lock_for_close().await;
        self.teardown(&mut s, "closed").await;
        Ok(())
    }

    /// Streams, then cursors, then statements, then the branch, then the connection.
    async fn teardown(&self, s: &mut Session, why: &str) {
        if s.closed {
            return;
        }
        s.closed = true;
        let streams = s.streams.len();
        s.streams.clear();
        let cursors: Vec<CursorId> = s.cursors.keys().copied().collect();
        for id in &cursors {
            discard_cursor(s, *id).await;
        }
        s.statements.clear();
        self.xa.on_session_close(s).await;
        s.pins.clear();
        let conn = s.connection_id();
        if let Some(c) = s.conn.take() {
            self.pools.release(c).await;
        }
        info!(
            target: "proxima::session",
            session = %s.id,
            reason = why,
            streams = streams,
            cursors = cursors.len(),
            conn = ?conn,
            "session closed"
        );
    }

    pub fn touch(&self, id: SessionId) -> ProxyResult<()> { self.sessions.touch(id) }

    pub fn cancel(&self, id: SessionId) -> ProxyResult<()> { self.sessions.cancel(id) }

    pub async fn describe(&self, id: SessionId) -> ProxyResult<SessionInfo> {
        let idle = self.sessions.resolve(id)?.idle_for();
        let call = self.call(id).await?;
        Ok(call.info(idle))
    }

    /// Force-close sessions idle past the configured threshold.
    pub async fn reap_idle(&self) -> usize {
        let threshold = self.config.sessions.idle_timeout();
        let mut reaped = 0;
        for id in self.sessions.idle_candidates(threshold) {
            let Ok(slot) = self.sessions.remove(id) else { continue };
            warn!(target: "proxima::session", session = %id, idle_ms = slot.idle_for().as_millis() as u64, "reaping idle session");
            slot.cancel_permanently();
            let mut s = slot.lock_for_close().await;
            self.teardown(&mut s, "idle timeout").await;
            reaped += 1;
        }
        reaped
    }

    /// Roll back branches that outlived their timeout.
    pub async fn expire_branches(&self) -> usize {
        let mut rolled = 0;
        for (xid, sid) in self.xa.expired() {
            let Ok(slot) = self.sessions.resolve(sid) else { continue };
            let mut s = slot.lock_for_close().await;
            if s.closed {
                continue;
            }
            self.xa.expire(&mut s, &xid).await;
            rolled += 1;
        }
        rolled
    }

    // ---- configuration and local transactions ----

    pub async fn get_config(&self, id: SessionId) -> ProxyResult<SessionConfig> { Ok(self.call(id).await?.config.clone()) }

    pub async fn set_config(&self, id: SessionId, option: SessionOption) -> ProxyResult<SessionConfig> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        let before = s.config.clone();
        match option {
            SessionOption::Isolation(level) => s.config.isolation = level,
            SessionOption::ReadOnly(on) => s.config.read_only = on,
            SessionOption::NetworkTimeoutMs(ms) => s.config.network_timeout_ms = ms,
            SessionOption::FetchSize(0) => return Err(ProxyError::protocol("fetch size must be positive")),
            SessionOption::FetchSize(n) => s.config.fetch_size = n.min(s.config.max_fetch_rows),
            SessionOption::Autocommit(false) => {
                if let Some(xid) = &s.branch {
                    return Err(ProxyError::conflict(format!("autocommit is governed by branch {xid}")));
                }
                s.config.autocommit = false;
                let newly = s.pin(PinReason::LocalTransaction);
                if let Err(e) = s.ensure_connection(&self.pools, &token).await {
                    s.config = before;
                    if newly {
                        s.unpin_reason(PinReason::LocalTransaction);
                    }
                    s.settle(&self.pools).await;
                    return Err(e);
                }
                debug!(target: "proxima::session", session = %s.id, "local transaction opened");
                return Ok(s.config.clone());
            }
            SessionOption::Autocommit(true) => {
                if let Some(xid) = &s.branch {
                    return Err(ProxyError::conflict(format!("autocommit is governed by branch {xid}")));
                }
                s.config.autocommit = true;
                if s.conn.is_some() {
                    s.ensure_connection(&self.pools, &token).await?;
                }
                s.unpin_reason(PinReason::LocalTransaction);
                s.settle(&self.pools).await;
                return Ok(s.config.clone());
            }
        }
        if s.conn.is_some() {
            if let Err(e) = s.ensure_connection(&self.pools, &token).await {
                s.config = before;
                return Err(e);
            }
        }
        Ok(s.config.clone())
    }

    pub async fn begin(&self, id: SessionId) -> ProxyResult<()> {
        self.set_config(id, SessionOption::Autocommit(false)).await.map(|_| ())
    }

    pub async fn commit(&self, id: SessionId) -> ProxyResult<()> { self.end_local(id, true).await }

    pub async fn rollback(&self, id: SessionId) -> ProxyResult<()> { self.end_local(id, false).await }

    async fn end_local(&self, id: SessionId, commit: bool) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        if let Some(xid) = &s.branch {
            return Err(ProxyError::conflict(format!("local transaction control while branch {xid} is open")));
        }
        let limit = s.config.network_timeout();
        if let Some(conn) = s.conn.as_mut() {
            let out = if commit {
                guarded(&token, limit, conn.backend().commit()).await
            } else {
                guarded(&token, limit, conn.backend().rollback()).await
            };
            if let Err(e) = out {
                if interrupted(&e) {
                    conn.state.interrupted = true;
                }
                return Err(e);
            }
        }
        // with autocommit off the next transaction starts right away and stays pinned
        if s.config.autocommit {
            s.unpin_reason(PinReason::LocalTransaction);
            s.settle(&self.pools).await;
        }
        debug!(target: "proxima::session", session = %s.id, commit = commit, "local transaction ended");
        Ok(())
    }

    /// Drop every pin reason the session holds, unless a transaction still needs the connection.
    pub async fn unpin(&self, id: SessionId) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let s: &mut Session = &mut call;
        if let Some(xid) = &s.branch {
            return Err(ProxyError::conflict(format!("session is pinned by branch {xid}")));
        }
        if s.pins.contains(PinReason::LocalTransaction) {
            return Err(ProxyError::conflict("session has an open local transaction"));
        }
        s.pins.clear();
        s.settle(&self.pools).await;
        debug!(target: "proxima::session", session = %s.id, "session unpinned");
        Ok(())
    }

    // ---- statements and cursors ----

    pub async fn prepare(&self, id: SessionId, sql: &str) -> ProxyResult<Prepared> {
        let mut call = self.call(id).await?;
        Ok(self.cursors.prepare(&mut call, sql))
    }

    pub async fn bind(&self, id: SessionId, statement: StatementId, index: usize, value: Value) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        self.cursors.bind(&mut call, statement, index, value)
    }

    pub async fn execute(&self, id: SessionId, statement: StatementId) -> ProxyResult<ExecuteOutcome> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.cursors.execute(&mut call, &token, statement).await
    }

    pub async fn execute_sql(&self, id: SessionId, sql: &str, params: Vec<Value>) -> ProxyResult<ExecuteOutcome> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.cursors.execute_sql(&mut call, &token, sql, params).await
    }

    pub async fn close_statement(&self, id: SessionId, statement: StatementId) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        self.cursors.close_statement(&mut call, statement).await
    }

    /// `block` of 0 uses the cursor's fetch size.
    pub async fn fetch_next(&self, id: SessionId, cursor: CursorId, block: usize) -> ProxyResult<FetchBlock> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.cursors.fetch_next(&mut call, &token, cursor, block).await
    }

    pub async fn close_cursor(&self, id: SessionId, cursor: CursorId) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        self.cursors.close_cursor(&mut call, cursor).await
    }

    // ---- large objects ----

    pub async fn open_read(&self, id: SessionId, cursor: CursorId, row: u64, column: usize) -> ProxyResult<ReadOpened> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.lobs.open_read(&mut call, &token, cursor, row, column).await
    }

    pub async fn read_chunk(&self, id: SessionId, stream: StreamId, max_bytes: usize) -> ProxyResult<Chunk> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.lobs.read_chunk(&mut call, &token, stream, max_bytes).await
    }

    pub async fn open_write(&self, id: SessionId, statement: StatementId, index: usize, kind: LobKind) -> ProxyResult<StreamId> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.lobs.open_write(&mut call, &token, statement, index, kind).await
    }

    pub async fn write_chunk(&self, id: SessionId, stream: StreamId, bytes: &[u8]) -> ProxyResult<u64> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.lobs.write_chunk(&mut call, &token, stream, bytes).await
    }

    /// Returns the committed length, or `None` when no chunk was written (a NULL value).
    pub async fn close_write(&self, id: SessionId, stream: StreamId) -> ProxyResult<Option<u64>> {
        let mut call = self.call(id).await?;
        self.lobs.close_write(&mut call, stream).await
    }

    pub async fn abandon(&self, id: SessionId, stream: StreamId) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        self.lobs.abandon(&mut call, stream).await
    }

    // ---- XA ----

    pub async fn xa_start(&self, id: SessionId, xid: &Xid, flags: StartFlags) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.start(&mut call, &token, xid, flags).await
    }

    pub async fn xa_end(&self, id: SessionId, xid: &Xid, flags: EndFlags) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.end(&mut call, &token, xid, flags).await
    }

    pub async fn xa_prepare(&self, id: SessionId, xid: &Xid) -> ProxyResult<XaVote> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.prepare(&mut call, &token, xid).await
    }

    pub async fn xa_commit(&self, id: SessionId, xid: &Xid, one_phase: bool) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.commit(&mut call, &token, xid, one_phase).await
    }

    pub async fn xa_rollback(&self, id: SessionId, xid: &Xid) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.rollback(&mut call, &token, xid).await
    }

    pub async fn xa_recover(&self, id: SessionId) -> ProxyResult<Vec<Xid>> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.recover(&mut call, &token).await
    }

    pub async fn xa_forget(&self, id: SessionId, xid: &Xid) -> ProxyResult<()> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.forget(&mut call, &token, xid).await
    }

    pub async fn xa_set_timeout(&self, id: SessionId, xid: Option<&Xid>, seconds: u32) -> ProxyResult<bool> {
        let mut call = self.call(id).await?;
        let token = call.token.clone();
        self.xa.set_timeout(&mut call, &token, xid, seconds).await
    }

    pub async fn xa_get_timeout(&self, id: SessionId, xid: Option<&Xid>) -> ProxyResult<u32> {
        let call = self.call(id).await?;
        self.xa.get_timeout(&call, xid)
    }

    /// Two sessions reach the same resource manager when they share a datasource.
    pub fn xa_is_same_rm(&self, a: SessionId, b: SessionId) -> ProxyResult<bool> {
        let a = self.sessions.resolve(a)?;
        let b = self.sessions.resolve(b)?;
        Ok(a.datasource() == b.datasource())
    }

    // ---- introspection and lifecycle ----

    pub fn pool_report(&self, datasource: &str) -> ProxyResult<PoolReport> {
        let pool = self
            .pools
            .existing(datasource)
            .ok_or_else(|| ProxyError::config(format!("no pool has been created for datasource '{datasource}'")))?;
        Ok(PoolReport { stats: pool.stats(), idle: pool.idle_snapshot(), segregation: pool.segregation().status() })
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> { self.pools.stats() }

    /// Stop background work, close every session, then close the pools.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
        for id in self.sessions.ids() {
            let _ = self.close_session(id).await;
        }
        self.pools.shutdown().await;
        info!(target: "proxima::session", "proxy shut down");
    }
}
