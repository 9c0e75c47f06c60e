//!
//! proxima pool manager
//! --------------------
//! One pool per datasource name, created on first reference from the merged configuration.
//! A pool hands out `PhysicalConnection`s under a semaphore sized to `max_size`; every
//! connection handed back goes through sanitization before it may be reused, and anything the
//! pool cannot prove clean is closed instead.
//!
//! Accounting: a permit is held for as long as a connection is borrowed, and a released
//! connection is pushed to the idle list *before* its permit is dropped. Together with only
//! opening a new connection when the idle list is empty, this keeps `in_use + idle <= max_size`.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnection, BackendDriver, BackendTarget, DriverRegistry, IsolationLevel, ResetOutcome, Xid};
use crate::config::{PoolSettings, ProxyConfig, SegregationSettings};
use crate::error::{ProxyError, ProxyResult};
use crate::segregation::SegregationManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "conn-{}", self.0) }
}

/// What the pool knows about a connection's session state. Used to decide what sanitization
/// has to undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnState {
    pub autocommit: bool,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Temp tables, variables or other session-local SQL state may exist on the backend.
    pub session_dirty: bool,
    /// A backend call was abandoned mid-flight (cancel or timeout).
    pub interrupted: bool,
    /// XA branch the connection is currently doing work for.
    pub branch: Option<Xid>,
    /// Fatal error seen; never reuse.
    pub broken: bool,
}

impl ConnState {
    fn pristine(settings: &PoolSettings) -> Self {
        Self {
            autocommit: settings.default_autocommit,
            isolation: settings.default_isolation,
            read_only: false,
            session_dirty: false,
            interrupted: false,
            branch: None,
            broken: false,
        }
    }
}

pub struct PhysicalConnection {
    id: ConnectionId,
    datasource: Arc<str>,
    backend: Box<dyn BackendConnection>,
    pub(crate) state: ConnState,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl PhysicalConnection {
    pub fn id(&self) -> ConnectionId { self.id }
    pub fn datasource(&self) -> &str { &self.datasource }
    pub fn state(&self) -> &ConnState { &self.state }
    pub fn backend(&mut self) -> &mut dyn BackendConnection { self.backend.as_mut() }
    pub fn age(&self) -> Duration { self.created_at.elapsed() }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("datasource", &self.datasource)
            .field("state", &self.state)
            .finish()
    }
}

struct IdleEntry {
    conn: PhysicalConnection,
    since: Instant,
}

struct Borrow {
    since: Instant,
    holder: String,
    leak_reported: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
    leaks: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub datasource: String,
    pub max_size: usize,
    pub min_idle: usize,
    pub in_use: usize,
    pub idle: usize,
    pub live: usize,
    pub created: u64,
    pub destroyed: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub timeouts: u64,
    pub leaks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleInfo {
    pub id: ConnectionId,
    pub isolation: IsolationLevel,
    pub autocommit: bool,
    pub idle_ms: u64,
}

pub struct Pool {
    name: Arc<str>,
    settings: PoolSettings,
    target: BackendTarget,
    driver: Arc<dyn BackendDriver>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    borrowed: Mutex<HashMap<ConnectionId, Borrow>>,
    counters: PoolCounters,
    live: AtomicUsize,
    closed: AtomicBool,
    ids: Arc<AtomicU64>,
    segregation: SegregationManager,
}

impl Pool {
    fn new(
        name: &str,
        settings: PoolSettings,
        target: BackendTarget,
        driver: Arc<dyn BackendDriver>,
        ids: Arc<AtomicU64>,
        segregation: &SegregationSettings,
    ) -> Self {
        let segregation = SegregationManager::new(name, settings.max_size, segregation);
        Self {
            name: Arc::from(name),
            permits: Arc::new(Semaphore::new(settings.max_size)),
            settings,
            target,
            driver,
            idle: Mutex::new(VecDeque::new()),
            borrowed: Mutex::new(HashMap::new()),
            counters: PoolCounters::default(),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            ids,
            segregation,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn settings(&self) -> &PoolSettings { &self.settings }
    pub fn target(&self) -> &BackendTarget { &self.target }
    pub fn segregation(&self) -> &SegregationManager { &self.segregation }

    /// Borrow a connection, waiting up to `acquire_timeout` for a free slot.
    /// `holder` names the borrower in leak reports.
    pub async fn acquire(&self, holder: &str) -> ProxyResult<PhysicalConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::exhausted(&self.name, "pool is shut down"));
        }
        let wait = self.settings.acquire_timeout();
        let permit = match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(ProxyError::exhausted(&self.name, "pool is shut down")),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(target: "proxima::pool", datasource = %self.name, wait_ms = wait.as_millis() as u64, "acquire timed out");
                return Err(ProxyError::exhausted(
                    &self.name,
                    format!("no connection available within {} ms (max_size {})", wait.as_millis(), self.settings.max_size),
                ));
            }
        };

        let mut conn = match self.take_idle().await {
            Some(c) => c,
            None => self.open().await?,
        };
        conn.permit = Some(permit);
        self.borrowed.lock().insert(conn.id, Borrow { since: Instant::now(), holder: holder.to_string(), leak_reported: false });
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, holder = holder, "acquired");
        Ok(conn)
    }

    async fn take_idle(&self) -> Option<PhysicalConnection> {
        loop {
            let entry = self.idle.lock().pop_back()?;
            let mut conn = entry.conn;
            if conn.age() >= self.settings.max_lifetime() {
                debug!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, "retiring connection past max lifetime");
                self.destroy(conn).await;
                continue;
            }
            if self.settings.test_on_borrow && !conn.backend.ping().await {
                warn!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, "idle connection failed validation");
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.destroy(conn).await;
                continue;
            }
            return Some(conn);
        }
    }

    async fn open(&self) -> ProxyResult<PhysicalConnection> {
        let limit = self.settings.connection_timeout();
        let mut backend = match tokio::time::timeout(limit, self.driver.open(&self.target)).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => {
                warn!(target: "proxima::pool", datasource = %self.name, error = %e, "backend unreachable");
                return Err(ProxyError::exhausted(&self.name, format!("backend unreachable: {e}")));
            }
            Err(_) => {
                warn!(target: "proxima::pool", datasource = %self.name, "opening backend connection timed out");
                return Err(ProxyError::exhausted(&self.name, format!("connect timed out after {} ms", limit.as_millis())));
            }
        };
        // start every connection from the pool's documented defaults
        let applied = async {
            backend.set_autocommit(self.settings.default_autocommit).await?;
            backend.set_isolation(self.settings.default_isolation).await
        }
        .await;
        if let Err(e) = applied {
            backend.close().await;
            return Err(ProxyError::exhausted(&self.name, format!("could not initialize connection: {e}")));
        }
        let id = ConnectionId(self.ids.fetch_add(1, Ordering::SeqCst) + 1);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(target: "proxima::pool", datasource = %self.name, conn = %id, "opened connection");
        Ok(PhysicalConnection {
            id,
            datasource: self.name.clone(),
            backend,
            state: ConnState::pristine(&self.settings),
            created_at: Instant::now(),
            permit: None,
        })
    }

    /// Return a borrowed connection. It re-enters the idle list only if sanitization succeeds.
    pub async fn release(&self, mut conn: PhysicalConnection) {
        self.borrowed.lock().remove(&conn.id);
        let permit = conn.permit.take();
        let verdict = if let Some(xid) = &conn.state.branch {
            error!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, branch = %xid, "connection released with an open branch");
            Err(format!("branch {xid} still open"))
        } else if self.closed.load(Ordering::SeqCst) {
            Err("pool is shut down".to_string())
        } else if conn.state.broken {
            Err("connection is broken".to_string())
        } else {
            self.sanitize(&mut conn).await
        };
        match verdict {
            Ok(()) => {
                debug!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, "released");
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                self.idle.lock().push_back(IdleEntry { conn, since: Instant::now() });
            }
            Err(reason) => {
                warn!(target: "proxima::pool", datasource = %self.name, conn = %conn.id, reason = %reason, "discarding connection");
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.destroy(conn).await;
            }
        }
        drop(permit);
    }

    async fn sanitize(&self, conn: &mut PhysicalConnection) -> Result<(), String> {
        let defaults = &self.settings;
        let st = conn.state.clone();
        let backend = conn.backend.as_mut();
        if !st.autocommit || st.interrupted {
            backend.rollback().await.map_err(|e| format!("rollback failed: {e}"))?;
        }
        let mut reset = false;
        if (st.session_dirty || st.interrupted) && !self.driver.resets_on_reuse() {
            match backend.reset_session().await {
                Ok(ResetOutcome::Verified) => reset = true,
                Ok(ResetOutcome::Unverified) => return Err("session reset could not be verified".to_string()),
                Err(e) => return Err(format!("session reset failed: {e}")),
            }
        }
        if reset || st.autocommit != defaults.default_autocommit {
            backend.set_autocommit(defaults.default_autocommit).await.map_err(|e| format!("autocommit reset failed: {e}"))?;
        }
        if reset || st.isolation != defaults.default_isolation {
            backend.set_isolation(defaults.default_isolation).await.map_err(|e| format!("isolation reset failed: {e}"))?;
        }
        if reset || st.read_only {
            backend.set_read_only(false).await.map_err(|e| format!("read-only reset failed: {e}"))?;
        }
        conn.state = ConnState::pristine(defaults);
        Ok(())
    }

    async fn destroy(&self, conn: PhysicalConnection) {
        let id = conn.id;
        conn.backend.close().await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "proxima::pool", datasource = %self.name, conn = %id, "closed connection");
    }

    /// Close idle connections beyond `min_idle` that sat unused past `idle_timeout`, plus any
    /// idle connection past `max_lifetime`. Borrowed connections are never touched.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let victims: Vec<PhysicalConnection> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut out = Vec::new();
            let mut surplus = idle.len().saturating_sub(self.settings.min_idle);
            // oldest first
            while let Some(e) = idle.pop_front() {
                let expired = e.conn.age() >= self.settings.max_lifetime();
                let stale = surplus > 0 && now.duration_since(e.since) >= self.settings.idle_timeout();
                if expired || stale {
                    surplus = surplus.saturating_sub(1);
                    out.push(e.conn);
                } else {
                    keep.push_back(e);
                }
            }
            *idle = keep;
            out
        };
        let n = victims.len();
        for c in victims {
            self.destroy(c).await;
        }
        if n > 0 {
            debug!(target: "proxima::pool", datasource = %self.name, evicted = n, "idle eviction");
        }
        n
    }

    /// Eviction plus leak detection. Returns the number of newly reported leaks.
    pub async fn housekeep(&self) -> usize {
        self.evict_idle().await;
        let limit = self.settings.leak_timeout();
        let mut reported = 0;
        for (id, b) in self.borrowed.lock().iter_mut() {
            if !b.leak_reported && b.since.elapsed() >= limit {
                b.leak_reported = true;
                reported += 1;
                self.counters.leaks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "proxima::pool",
                    datasource = %self.name,
                    conn = %id,
                    holder = %b.holder,
                    held_ms = b.since.elapsed().as_millis() as u64,
                    "possible connection leak"
                );
            }
        }
        reported
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let in_use = self.borrowed.lock().len();
        PoolStats {
            datasource: self.name.to_string(),
            max_size: self.settings.max_size,
            min_idle: self.settings.min_idle,
            in_use,
            idle,
            live: self.live.load(Ordering::SeqCst),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            leaks: self.counters.leaks.load(Ordering::Relaxed),
        }
    }

    pub fn idle_snapshot(&self) -> Vec<IdleInfo> {
        self.idle
            .lock()
            .iter()
            .map(|e| IdleInfo {
                id: e.conn.id,
                isolation: e.conn.state.isolation,
                autocommit: e.conn.state.autocommit,
                idle_ms: e.since.elapsed().as_millis() as u64,
            })
            .collect()
    }

    pub fn is_idle(&self, id: ConnectionId) -> bool { self.idle.lock().iter().any(|e| e.conn.id == id) }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let drained: Vec<IdleEntry> = self.idle.lock().drain(..).collect();
        for e in drained {
            self.destroy(e.conn).await;
        }
        info!(target: "proxima::pool", datasource = %self.name, "pool shut down");
    }
}

/// Owns every datasource pool.
pub struct PoolManager {
    config: Arc<ProxyConfig>,
    drivers: DriverRegistry,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    ids: Arc<AtomicU64>,
}

impl PoolManager {
    pub fn new(config: Arc<ProxyConfig>, drivers: DriverRegistry) -> Self {
        Self { config, drivers, pools: RwLock::new(HashMap::new()), ids: Arc::new(AtomicU64::new(0)) }
    }

    /// Pool for a datasource, created from configuration on first reference.
    pub fn pool(&self, datasource: &str) -> ProxyResult<Arc<Pool>> {
        if let Some(p) = self.pools.read().get(datasource) {
            return Ok(p.clone());
        }
        let resolved = self.config.resolve(datasource);
        resolved.pool.validate(datasource)?;
        let target = BackendTarget::parse(&resolved.url, resolved.username.clone(), resolved.password.clone())?;
        let driver = self
            .drivers
            .get(&target.family)
            .ok_or_else(|| ProxyError::config(format!("no backend driver for '{}' (datasource '{datasource}')", target.family)))?;
        let mut pools = self.pools.write();
        let pool = pools
            .entry(datasource.to_string())
            .or_insert_with(|| {
                info!(
                    target: "proxima::pool",
                    datasource = datasource,
                    family = %target.family,
                    max_size = resolved.pool.max_size,
                    min_idle = resolved.pool.min_idle,
                    "creating pool"
                );
                Arc::new(Pool::new(datasource, resolved.pool.clone(), target, driver, self.ids.clone(), &self.config.segregation))
            })
            .clone();
        Ok(pool)
    }

    pub fn existing(&self, datasource: &str) -> Option<Arc<Pool>> { self.pools.read().get(datasource).cloned() }

    pub async fn acquire(&self, datasource: &str, holder: &str) -> ProxyResult<PhysicalConnection> {
        self.pool(datasource)?.acquire(holder).await
    }

    pub async fn release(&self, conn: PhysicalConnection) {
        match self.existing(conn.datasource()) {
            Some(pool) => pool.release(conn).await,
            None => {
                warn!(target: "proxima::pool", conn = %conn.id, "released connection has no pool; closing");
                conn.backend.close().await;
            }
        }
    }

    fn all(&self) -> Vec<Arc<Pool>> { self.pools.read().values().cloned().collect() }

    pub async fn evict_idle(&self) -> usize {
        let mut n = 0;
        for p in self.all() {
            n += p.evict_idle().await;
        }
        n
    }

    pub async fn housekeep(&self) -> usize {
        let mut n = 0;
        for p in self.all() {
            n += p.housekeep().await;
        }
        n
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut v: Vec<PoolStats> = self.all().iter().map(|p| p.stats()).collect();
        v.sort_by(|a, b| a.datasource.cmp(&b.datasource));
        v
    }

    pub fn is_idle(&self, id: ConnectionId) -> bool { self.all().iter().any(|p| p.is_idle(id)) }

    pub async fn shutdown(&self) {
        for p in self.all() {
            p.shutdown().await;
        }
    }
}
