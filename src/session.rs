//! Session registry.
//!
//! Maps opaque session handles to live state. Each session owns an arena of statements, cursors
//! and streams keyed by generated ids, plus at most one physical connection. A session's calls run
//! strictly one at a time (a second call queues on the session lock); different sessions never
//! contend on anything broader than the pool.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::affinity::{AffinityState, PinReason, PinSet};
use crate::backend::{IsolationLevel, Xid};
use crate::config::ProxyConfig;
use crate::cursor::{ResultCursor, Statement};
use crate::error::{BackendError, HandleKind, ProxyError, ProxyResult};
use crate::lob::LobStream;
use crate::pool::{ConnectionId, PhysicalConnection, PoolManager};

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self { Self(Uuid::new_v4()) }

            pub fn parse(s: &str) -> ProxyResult<Self> {
                Uuid::parse_str(s.trim()).map(Self).map_err(|_| ProxyError::stale($kind, s))
            }
        }

        impl Default for $name {
            fn default() -> Self { Self::new() }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(&self.0, f) }
        }
    };
}

handle_id!(SessionId, HandleKind::Session);
handle_id!(StatementId, HandleKind::Statement);
handle_id!(CursorId, HandleKind::Cursor);
handle_id!(StreamId, HandleKind::Stream);

/// Per-session settings, applied to whichever connection currently backs the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub isolation: IsolationLevel,
    pub autocommit: bool,
    pub fetch_size: usize,
    /// Fetch blocks never carry more rows than this.
    pub max_fetch_rows: usize,
    /// 0 disables the bound.
    pub network_timeout_ms: u64,
    pub read_only: bool,
}

impl SessionConfig {
    pub fn from_config(config: &ProxyConfig, datasource: &str) -> Self {
        let pool = config.resolve(datasource).pool;
        let max_fetch_rows = config.sessions.max_fetch_rows.max(1);
        Self {
            isolation: pool.default_isolation,
            autocommit: pool.default_autocommit,
            fetch_size: config.sessions.default_fetch_size.clamp(1, max_fetch_rows),
            max_fetch_rows,
            network_timeout_ms: 0,
            read_only: false,
        }
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        (self.network_timeout_ms > 0).then(|| Duration::from_millis(self.network_timeout_ms))
    }
}

/// One settable session option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "snake_case")]
pub enum SessionOption {
    Isolation(IsolationLevel),
    Autocommit(bool),
    FetchSize(usize),
    NetworkTimeoutMs(u64),
    ReadOnly(bool),
}

/// Introspection snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub datasource: String,
    pub affinity: AffinityState,
    pub pin_reasons: Vec<PinReason>,
    pub connection: Option<ConnectionId>,
    pub statements: usize,
    pub cursors: usize,
    pub streams: usize,
    pub branch: Option<Xid>,
    pub branch_active: bool,
    pub config: SessionConfig,
    pub opened_at: DateTime<Utc>,
    pub idle_ms: u64,
}

pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) datasource: String,
    pub(crate) pins: PinSet,
    pub(crate) conn: Option<PhysicalConnection>,
    pub(crate) statements: HashMap<StatementId, Statement>,
    pub(crate) cursors: HashMap<CursorId, ResultCursor>,
    pub(crate) streams: HashMap<StreamId, LobStream>,
    /// Branch the session's connection is dedicated to until it completes or detaches.
    pub(crate) branch: Option<Xid>,
    /// The branch is associated (ACTIVE) rather than ended or suspended.
    pub(crate) branch_active: bool,
    /// Seconds applied to branches this session starts; 0 means none.
    pub(crate) xa_timeout: u32,
    pub(crate) config: SessionConfig,
    pub(crate) opened_at: DateTime<Utc>,
    pub(crate) closed: bool,
}

impl Session {
    fn new(id: SessionId, datasource: &str, config: SessionConfig) -> Self {
        Self {
            id,
            datasource: datasource.to_string(),
            pins: PinSet::default(),
            conn: None,
            statements: HashMap::new(),
            cursors: HashMap::new(),
            streams: HashMap::new(),
            branch: None,
            branch_active: false,
            xa_timeout: 0,
            config,
            opened_at: Utc::now(),
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId { self.id }
    pub fn datasource(&self) -> &str { &self.datasource }
    pub fn affinity(&self) -> AffinityState { self.pins.state() }
    pub fn connection_id(&self) -> Option<ConnectionId> { self.conn.as_ref().map(|c| c.id()) }

    /// Returns true when the reason was not already held.
    pub(crate) fn pin(&mut self, reason: PinReason) -> bool {
        let before = self.pins.state();
        let added = self.pins.add(reason);
        if added && before == AffinityState::Floating {
            debug!(target: "proxima::session", session = %self.id, reason = ?reason, "session pinned");
        }
        added
    }

    pub(crate) fn unpin_reason(&mut self, reason: PinReason) {
        if self.pins.remove(reason) && self.pins.is_empty() {
            debug!(target: "proxima::session", session = %self.id, "session floating again");
        }
    }

    /// Something besides pinning still needs the current connection.
    pub(crate) fn has_leases(&self) -> bool {
        self.cursors.values().any(|c| c.holds_backend()) || self.streams.values().any(|s| s.needs_connection())
    }

    /// Make sure a connection backs the session and carries the session's settings.
    pub(crate) async fn ensure_connection(&mut self, pools: &PoolManager, token: &CancellationToken) -> ProxyResult<()> {
        if self.conn.is_none() {
            let holder = format!("session {}", self.id);
            let acquired = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ProxyError::Cancelled),
                r = pools.acquire(&self.datasource, &holder) => r?,
            };
            debug!(target: "proxima::session", session = %self.id, conn = %acquired.id(), "connection attached");
            self.conn = Some(acquired);
        }
        self.apply_config(token).await
    }

    async fn apply_config(&mut self, token: &CancellationToken) -> ProxyResult<()> {
        let want = self.config.clone();
        let Some(conn) = self.conn.as_mut() else { return Ok(()) };
        let limit = want.network_timeout();
        if conn.state.isolation != want.isolation {
            guarded(token, limit, conn.backend().set_isolation(want.isolation)).await?;
            conn.state.isolation = want.isolation;
        }
        if conn.state.autocommit != want.autocommit {
            guarded(token, limit, conn.backend().set_autocommit(want.autocommit)).await?;
            conn.state.autocommit = want.autocommit;
        }
        if conn.state.read_only != want.read_only {
            guarded(token, limit, conn.backend().set_read_only(want.read_only)).await?;
            conn.state.read_only = want.read_only;
        }
        Ok(())
    }

    pub(crate) fn connection(&mut self) -> ProxyResult<&mut PhysicalConnection> {
        self.conn.as_mut().ok_or_else(|| ProxyError::internal("session has no connection"))
    }

    /// Hand the connection back when nothing holds it any more.
    pub(crate) async fn settle(&mut self, pools: &PoolManager) {
        if !self.pins.is_empty() || self.branch.is_some() || self.has_leases() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            debug!(target: "proxima::session", session = %self.id, conn = %conn.id(), "connection returned");
            pools.release(conn).await;
        }
    }

    pub fn info(&self, idle: Duration) -> SessionInfo {
        SessionInfo {
            id: self.id,
            datasource: self.datasource.clone(),
            affinity: self.pins.state(),
            pin_reasons: self.pins.reasons(),
            connection: self.connection_id(),
            statements: self.statements.len(),
            cursors: self.cursors.len(),
            streams: self.streams.len(),
            branch: self.branch.clone(),
            branch_active: self.branch_active,
            config: self.config.clone(),
            opened_at: self.opened_at,
            idle_ms: idle.as_millis() as u64,
        }
    }
}

pub struct SessionSlot {
    id: SessionId,
    datasource: String,
    state: Arc<tokio::sync::Mutex<Session>>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    cancel: Mutex<CancellationToken>,
}

impl SessionSlot {
    pub fn id(&self) -> SessionId { self.id }
    pub fn datasource(&self) -> &str { &self.datasource }
    pub fn touch(&self) { *self.last_activity.lock() = Instant::now(); }
    pub fn idle_for(&self) -> Duration { self.last_activity.lock().elapsed() }
    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::SeqCst) }

    /// Abort the in-flight call and give later calls a fresh token.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Abort the in-flight call for good.
    pub fn cancel_permanently(&self) { self.cancel.lock().cancel(); }

    /// Lock the session for teardown, bypassing the closed check.
    pub(crate) async fn lock_for_close(&self) -> OwnedMutexGuard<Session> { self.state.clone().lock_owned().await }
}

struct InFlight(Arc<SessionSlot>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

/// Exclusive access to one session for the duration of one call.
pub struct SessionCall {
    session: OwnedMutexGuard<Session>,
    pub token: CancellationToken,
    _in_flight: InFlight,
}

impl Deref for SessionCall {
    type Target = Session;
    fn deref(&self) -> &Session { &self.session }
}

impl DerefMut for SessionCall {
    fn deref_mut(&mut self) -> &mut Session { &mut self.session }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn open(&self, datasource: &str, config: SessionConfig) -> SessionId {
        let id = SessionId::new();
        let slot = Arc::new(SessionSlot {
            id,
            datasource: datasource.to_string(),
            state: Arc::new(tokio::sync::Mutex::new(Session::new(id, datasource, config))),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            cancel: Mutex::new(CancellationToken::new()),
        });
        self.sessions.write().insert(id, slot);
        info!(target: "proxima::session", session = %id, datasource = datasource, "session opened");
        id
    }

    pub fn resolve(&self, id: SessionId) -> ProxyResult<Arc<SessionSlot>> {
        self.sessions.read().get(&id).cloned().ok_or_else(|| ProxyError::stale(HandleKind::Session, id))
    }

    pub fn touch(&self, id: SessionId) -> ProxyResult<()> {
        self.resolve(id)?.touch();
        Ok(())
    }

    /// Detach a session from the registry; later lookups see a stale handle.
    pub fn remove(&self, id: SessionId) -> ProxyResult<Arc<SessionSlot>> {
        self.sessions.write().remove(&id).ok_or_else(|| ProxyError::stale(HandleKind::Session, id))
    }

    /// Wait for the session's previous call to finish, then take it over.
    pub async fn begin_call(&self, id: SessionId) -> ProxyResult<SessionCall> {
        let slot = self.resolve(id)?;
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight(slot.clone());
        let session = slot.state.clone().lock_owned().await;
        if session.closed {
            return Err(ProxyError::stale(HandleKind::Session, id));
        }
        slot.touch();
        let token = slot.cancel.lock().clone();
        Ok(SessionCall { session, token, _in_flight: in_flight })
    }

    pub fn cancel(&self, id: SessionId) -> ProxyResult<()> {
        let slot = self.resolve(id)?;
        slot.cancel();
        info!(target: "proxima::session", session = %id, "cancel requested");
        Ok(())
    }

    /// Sessions idle past `threshold` with no call running or queued.
    pub fn idle_candidates(&self, threshold: Duration) -> Vec<SessionId> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.in_flight() == 0 && s.idle_for() >= threshold)
            .map(|s| s.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> { self.sessions.read().keys().copied().collect() }

    pub fn len(&self) -> usize { self.sessions.read().len() }

    pub fn is_empty(&self) -> bool { self.sessions.read().is_empty() }
}

/// Run one backend suspension point under the call's cancel token and optional network timeout.
pub(crate) async fn guarded<T, F>(token: &CancellationToken, limit: Option<Duration>, fut: F) -> ProxyResult<T>
where
    F: Future<Output = Result<T, BackendError>>,
{
    let work = async { fut.await.map_err(ProxyError::from) };
    let bounded = async {
        match limit {
            Some(d) => tokio::time::timeout(d, work)
                .await
                .unwrap_or_else(|_| Err(ProxyError::Timeout { millis: d.as_millis() as u64 })),
            None => work.await,
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ProxyError::Cancelled),
        r = bounded => r,
    }
}

/// True for failures that abandoned a backend call halfway.
pub(crate) fn interrupted(err: &ProxyError) -> bool { matches!(err, ProxyError::Cancelled | ProxyError::Timeout { .. }) }

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_session() -> (SessionRegistry, SessionId) {
        let reg = SessionRegistry::new();
        let cfg = SessionConfig::from_config(&ProxyConfig::default(), "reports");
        let id = reg.open("reports", cfg);
        (reg, id)
    }

    #[test]
    fn handles_parse_or_go_stale() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()).unwrap(), id);
        assert!(matches!(CursorId::parse("nope"), Err(ProxyError::StaleHandle { kind: HandleKind::Cursor, .. })));
    }

    #[test]
    fn default_config_follows_pool_defaults() {
        let mut cfg = ProxyConfig::default();
        cfg.defaults.default_isolation = IsolationLevel::Serializable;
        let sc = SessionConfig::from_config(&cfg, "any");
        assert_eq!(sc.isolation, IsolationLevel::Serializable);
        assert!(sc.autocommit);
        assert_eq!(sc.fetch_size, 100);
        assert_eq!(sc.network_timeout(), None);
    }

    #[tokio::test]
    async fn removed_session_is_stale() {
        let (reg, id) = registry_with_session();
        assert!(reg.touch(id).is_ok());
        reg.remove(id).unwrap();
        assert!(matches!(reg.resolve(id), Err(ProxyError::StaleHandle { kind: HandleKind::Session, .. })));
        assert!(matches!(reg.begin_call(id).await, Err(ProxyError::StaleHandle { .. })));
    }

    #[tokio::test]
    async fn calls_on_one_session_queue() {
        let (reg, id) = registry_with_session();
        let reg = Arc::new(reg);
        let first = reg.begin_call(id).await.unwrap();
        let r2 = reg.clone();
        let second = tokio::spawn(async move { r2.begin_call(id).await.map(|c| c.id()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());
        assert_eq!(reg.resolve(id).unwrap().in_flight(), 2);
        drop(first);
        assert_eq!(second.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn busy_sessions_are_never_reap_candidates() {
        let (reg, id) = registry_with_session();
        let call = reg.begin_call(id).await.unwrap();
        assert!(reg.idle_candidates(Duration::ZERO).is_empty());
        drop(call);
        assert_eq!(reg.idle_candidates(Duration::ZERO), vec![id]);
        assert!(reg.idle_candidates(Duration::from_secs(3600)).is_empty());
    }

    #[tokio::test]
    async fn cancel_aborts_the_running_call_only() {
        let (reg, id) = registry_with_session();
        let call = reg.begin_call(id).await.unwrap();
        let token = call.token.clone();
        reg.cancel(id).unwrap();
        let r: ProxyResult<()> =
            guarded(&token, None, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(r, Err(ProxyError::Cancelled));
        drop(call);
        let next = reg.begin_call(id).await.unwrap();
        assert!(!next.token.is_cancelled());
    }

    #[tokio::test]
    async fn guarded_applies_network_timeout() {
        let token = CancellationToken::new();
        let r: ProxyResult<()> = guarded(&token, Some(Duration::from_millis(5)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(r, Err(ProxyError::Timeout { millis: 5 }));
        assert!(interrupted(&r.unwrap_err()));
    }
}
