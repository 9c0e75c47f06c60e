//! XA transaction coordinator.
//!
//! Branch life cycle: `ACTIVE -> ENDED -> PREPARED -> COMMITTED`, with `ROLLED_BACK` reachable
//! from every non-terminal phase and a one-phase commit straight from `ENDED`. A branch pins its
//! session to one connection from `start` until it reaches a terminal state; only then does the
//! connection go back through the pool's sanitize-and-release path.
//!
//! A PREPARED branch outlives its session: when the session closes the branch is detached, and a
//! later commit or rollback from any session on the same datasource runs on a freshly borrowed
//! connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::affinity::PinReason;
use crate::backend::{BranchOp, BranchReply, EndFlags, StartFlags, XaVote, Xid};
use crate::error::{ProxyError, ProxyResult, XaCode};
use crate::pool::PoolManager;
use crate::session::{guarded, interrupted, Session, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchPhase {
    Active,
    Suspended,
    Ended,
    Prepared,
}

#[derive(Debug, Clone)]
struct BranchEntry {
    datasource: String,
    session: Option<SessionId>,
    phase: BranchPhase,
    rollback_only: bool,
    timeout_secs: u32,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl BranchEntry {
    fn retime(&mut self, seconds: u32) {
        self.timeout_secs = seconds;
        self.deadline = (seconds > 0).then(|| self.started_at + Duration::from_secs(seconds as u64));
    }

    fn expired(&self) -> bool {
        self.phase != BranchPhase::Prepared && self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub xid: Xid,
    pub datasource: String,
    pub session: Option<SessionId>,
    pub phase: BranchPhase,
    pub rollback_only: bool,
    pub timeout_secs: u32,
}

enum Owner {
    This,
    Detached,
}

pub struct TransactionCoordinator {
    pools: Arc<PoolManager>,
    branches: Mutex<HashMap<Xid, BranchEntry>>,
}

impl TransactionCoordinator {
    pub fn new(pools: Arc<PoolManager>) -> Self { Self { pools, branches: Mutex::new(HashMap::new()) } }

    fn entry(&self, xid: &Xid) -> ProxyResult<BranchEntry> {
        self.branches
            .lock()
            .get(xid)
            .cloned()
            .ok_or_else(|| ProxyError::xa(XaCode::Nota, format!("unknown branch {xid}")))
    }

    fn update<F: FnOnce(&mut BranchEntry)>(&self, xid: &Xid, f: F) {
        if let Some(e) = self.branches.lock().get_mut(xid) {
            f(e);
        }
    }

    fn owner(&self, s: &Session, xid: &Xid, entry: &BranchEntry) -> ProxyResult<Owner> {
        match entry.session {
            Some(id) if id == s.id => Ok(Owner::This),
            Some(_) => Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is associated with another session"))),
            None if entry.datasource == s.datasource => Ok(Owner::Detached),
            None => Err(ProxyError::xa(
                XaCode::Proto,
                format!("branch {xid} belongs to datasource '{}', not '{}'", entry.datasource, s.datasource),
            )),
        }
    }

    /// Forward one branch verb to the session's connection.
    async fn on_session_conn(&self, s: &mut Session, token: &CancellationToken, op: BranchOp<'_>) -> ProxyResult<BranchReply> {
        let limit = s.config.network_timeout();
        let conn = s.connection()?;
        let out = guarded(token, limit, conn.backend().participate(op)).await;
        if let Err(e) = &out {
            if interrupted(e) {
                conn.state.interrupted = true;
            }
        }
        out
    }

    /// Roll back the session's branch on its own connection. A failed rollback leaves the
    /// backend state unknown, so the connection is marked broken and never reused.
    async fn roll_back_or_discard(&self, s: &mut Session, token: &CancellationToken, xid: &Xid, why: &str) {
        if let Err(e) = self.on_session_conn(s, token, BranchOp::Rollback { xid }).await {
            warn!(target: "proxima::xa", branch = %xid, error = %e, "rollback {why} failed; connection will be discarded");
            if let Some(conn) = s.conn.as_mut() {
                conn.state.broken = true;
            }
        }
    }

    /// Run one branch verb on a connection borrowed just for it.
    async fn on_fresh_conn(&self, datasource: &str, token: &CancellationToken, op: BranchOp<'_>) -> ProxyResult<BranchReply> {
        let mut conn = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ProxyError::Cancelled),
            c = self.pools.acquire(datasource, "xa coordinator") => c?,
        };
        let out = guarded(token, None, conn.backend().participate(op)).await;
        if let Err(e) = &out {
            if interrupted(e) {
                conn.state.interrupted = true;
            }
        }
        self.pools.release(conn).await;
        out
    }

    pub async fn start(&self, s: &mut Session, token: &CancellationToken, xid: &Xid, flags: StartFlags) -> ProxyResult<()> {
        match flags {
            StartFlags::NoFlags => self.start_new(s, token, xid).await,
            StartFlags::Join | StartFlags::Resume => self.reactivate(s, token, xid, flags).await,
        }
    }

    async fn start_new(&self, s: &mut Session, token: &CancellationToken, xid: &Xid) -> ProxyResult<()> {
        if let Some(current) = &s.branch {
            if current == xid {
                return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} already started on this session")));
            }
            return Err(ProxyError::conflict(format!("session already holds branch {current}")));
        }
        if s.pins.contains(PinReason::LocalTransaction) {
            return Err(ProxyError::xa(XaCode::Proto, "a local transaction is open on this session"));
        }
        if self.branches.lock().contains_key(xid) {
            return Err(ProxyError::xa(XaCode::DupId, format!("branch {xid} already exists")));
        }

        let newly_pinned = s.pin(PinReason::Branch);
        let seconds = s.xa_timeout;
        let started = async {
            s.ensure_connection(&self.pools, token).await?;
            self.on_session_conn(s, token, BranchOp::Start { xid, flags: StartFlags::NoFlags }).await?;
            if seconds > 0 {
                self.on_session_conn(s, token, BranchOp::SetTimeout { seconds }).await?;
            }
            Ok::<(), ProxyError>(())
        }
        .await;
        if let Err(e) = started {
            if newly_pinned {
                s.unpin_reason(PinReason::Branch);
            }
            s.settle(&self.pools).await;
            return Err(e);
        }

        let conn = s.connection()?;
        conn.state.branch = Some(xid.clone());
        let conn_id = conn.id();
        s.branch = Some(xid.clone());
        s.branch_active = true;
        let mut entry = BranchEntry {
            datasource: s.datasource.clone(),
            session: Some(s.id),
            phase: BranchPhase::Active,
            rollback_only: false,
            timeout_secs: 0,
            started_at: Instant::now(),
            deadline: None,
        };
        entry.retime(seconds);
        self.branches.lock().insert(xid.clone(), entry);
        debug!(target: "proxima::xa", session = %s.id, branch = %xid, conn = %conn_id, "branch started");
        Ok(())
    }

    async fn reactivate(&self, s: &mut Session, token: &CancellationToken, xid: &Xid, flags: StartFlags) -> ProxyResult<()> {
        let entry = self.entry(xid)?;
        if !matches!(self.owner(s, xid, &entry)?, Owner::This) {
            return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is detached")));
        }
        if !matches!(entry.phase, BranchPhase::Ended | BranchPhase::Suspended) {
            return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is {:?}; only ended or suspended branches resume", entry.phase)));
        }
        if entry.rollback_only {
            return Err(ProxyError::xa(XaCode::RbRollback, format!("branch {xid} is marked rollback-only")));
        }
        self.on_session_conn(s, token, BranchOp::Start { xid, flags }).await?;
        self.update(xid, |e| e.phase = BranchPhase::Active);
        s.branch_active = true;
        debug!(target: "proxima::xa", session = %s.id, branch = %xid, flags = ?flags, "branch re-activated");
        Ok(())
    }

    pub async fn end(&self, s: &mut Session, token: &CancellationToken, xid: &Xid, flags: EndFlags) -> ProxyResult<()> {
        let entry = self.entry(xid)?;
        if !matches!(self.owner(s, xid, &entry)?, Owner::This) || entry.phase != BranchPhase::Active {
            return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is not active on this session")));
        }
        self.on_session_conn(s, token, BranchOp::End { xid, flags }).await?;
        let phase = if flags == EndFlags::Suspend { BranchPhase::Suspended } else { BranchPhase::Ended };
        self.update(xid, |e| {
            e.phase = phase;
            e.rollback_only |= flags == EndFlags::Fail;
        });
        s.branch_active = false;
        debug!(target: "proxima::xa", session = %s.id, branch = %xid, flags = ?flags, "branch ended");
        Ok(())
    }

    pub async fn prepare(&self, s: &mut Session, token: &CancellationToken, xid: &Xid) -> ProxyResult<XaVote> {
        let entry = self.entry(xid)?;
        if !matches!(self.owner(s, xid, &entry)?, Owner::This) || entry.phase != BranchPhase::Ended {
            return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} must be ended on this session before prepare")));
        }
        if entry.rollback_only {
            self.roll_back_or_discard(s, token, xid, "of rollback-only branch").await;
            self.finish(s, xid, "rolled back (rollback-only)").await;
            return Err(ProxyError::xa(XaCode::RbRollback, format!("branch {xid} was marked rollback-only and has been rolled back")));
        }
        let vote = match self.on_session_conn(s, token, BranchOp::Prepare { xid }).await? {
            BranchReply::Vote(v) => v,
            other => return Err(ProxyError::xa(XaCode::RmErr, format!("backend answered prepare with {other:?}"))),
        };
        match vote {
            XaVote::ReadOnly => self.finish(s, xid, "read-only, completed at prepare").await,
            XaVote::Commit => {
                self.update(xid, |e| e.phase = BranchPhase::Prepared);
                debug!(target: "proxima::xa", session = %s.id, branch = %xid, "branch prepared");
            }
        }
        Ok(vote)
    }

    pub async fn commit(&self, s: &mut Session, token: &CancellationToken, xid: &Xid, one_phase: bool) -> ProxyResult<()> {
        let entry = self.entry(xid)?;
        match self.owner(s, xid, &entry)? {
            Owner::This => {
                let ready = if one_phase { entry.phase == BranchPhase::Ended } else { entry.phase == BranchPhase::Prepared };
                if !ready {
                    let need = if one_phase { "ended" } else { "prepared" };
                    return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is {:?}; commit needs it {need}", entry.phase)));
                }
                if entry.rollback_only {
                    self.roll_back_or_discard(s, token, xid, "of rollback-only branch").await;
                    self.finish(s, xid, "rolled back (rollback-only)").await;
                    return Err(ProxyError::xa(XaCode::RbRollback, format!("branch {xid} was marked rollback-only and has been rolled back")));
                }
                self.on_session_conn(s, token, BranchOp::Commit { xid, one_phase }).await?;
                self.finish(s, xid, if one_phase { "committed (one phase)" } else { "committed" }).await;
            }
            Owner::Detached => {
                if one_phase {
                    return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is prepared; one-phase commit not allowed")));
                }
                self.on_fresh_conn(&entry.datasource, token, BranchOp::Commit { xid, one_phase: false }).await?;
                self.branches.lock().remove(xid);
                info!(target: "proxima::xa", session = %s.id, branch = %xid, "detached branch committed");
            }
        }
        Ok(())
    }

    pub async fn rollback(&self, s: &mut Session, token: &CancellationToken, xid: &Xid) -> ProxyResult<()> {
        let entry = self.entry(xid)?;
        match self.owner(s, xid, &entry)? {
            Owner::This => {
                self.on_session_conn(s, token, BranchOp::Rollback { xid }).await?;
                self.finish(s, xid, "rolled back").await;
            }
            Owner::Detached => {
                self.on_fresh_conn(&entry.datasource, token, BranchOp::Rollback { xid }).await?;
                self.branches.lock().remove(xid);
                info!(target: "proxima::xa", session = %s.id, branch = %xid, "detached branch rolled back");
            }
        }
        Ok(())
    }

    /// In-doubt branches known to the session's datasource.
    pub async fn recover(&self, s: &mut Session, token: &CancellationToken) -> ProxyResult<Vec<Xid>> {
        let reply = if s.conn.is_some() {
            self.on_session_conn(s, token, BranchOp::Recover).await?
        } else {
            self.on_fresh_conn(&s.datasource, token, BranchOp::Recover).await?
        };
        let mut xids = match reply {
            BranchReply::Recovered(x) => x,
            _ => Vec::new(),
        };
        for (xid, e) in self.branches.lock().iter() {
            if e.phase == BranchPhase::Prepared && e.datasource == s.datasource && !xids.contains(xid) {
                xids.push(xid.clone());
            }
        }
        Ok(xids)
    }

    pub async fn forget(&self, s: &mut Session, token: &CancellationToken, xid: &Xid) -> ProxyResult<()> {
        if self.branches.lock().contains_key(xid) {
            return Err(ProxyError::xa(XaCode::Proto, format!("branch {xid} is still in progress")));
        }
        if s.conn.is_some() {
            self.on_session_conn(s, token, BranchOp::Forget { xid }).await?;
        } else {
            self.on_fresh_conn(&s.datasource, token, BranchOp::Forget { xid }).await?;
        }
        Ok(())
    }

    /// With a branch id, retime that branch; without one, set the timeout for branches this
    /// session starts later.
    pub async fn set_timeout(&self, s: &mut Session, token: &CancellationToken, xid: Option<&Xid>, seconds: u32) -> ProxyResult<bool> {
        match xid {
            None => s.xa_timeout = seconds,
            Some(xid) => {
                let entry = self.entry(xid)?;
                if matches!(self.owner(s, xid, &entry)?, Owner::This) {
                    self.on_session_conn(s, token, BranchOp::SetTimeout { seconds }).await?;
                }
                self.update(xid, |e| e.retime(seconds));
            }
        }
        Ok(true)
    }

    pub fn get_timeout(&self, s: &Session, xid: Option<&Xid>) -> ProxyResult<u32> {
        match xid {
            None => Ok(s.xa_timeout),
            Some(xid) => Ok(self.entry(xid)?.timeout_secs),
        }
    }

    pub fn branch(&self, xid: &Xid) -> Option<BranchInfo> {
        self.branches.lock().get(xid).map(|e| BranchInfo {
            xid: xid.clone(),
            datasource: e.datasource.clone(),
            session: e.session,
            phase: e.phase,
            rollback_only: e.rollback_only,
            timeout_secs: e.timeout_secs,
        })
    }

    pub fn len(&self) -> usize { self.branches.lock().len() }

    pub fn is_empty(&self) -> bool { self.branches.lock().is_empty() }

    /// Non-prepared branches past their timeout, with the session holding each.
    pub fn expired(&self) -> Vec<(Xid, SessionId)> {
        self.branches
            .lock()
            .iter()
            .filter(|(_, e)| e.expired())
            .filter_map(|(x, e)| e.session.map(|s| (x.clone(), s)))
            .collect()
    }

    /// Roll back a timed-out branch. Re-checks the deadline under the session lock.
    pub async fn expire(&self, s: &mut Session, xid: &Xid) {
        let still_expired = self.branches.lock().get(xid).is_some_and(|e| e.expired() && e.session == Some(s.id));
        if !still_expired {
            return;
        }
        let token = CancellationToken::new();
        self.roll_back_or_discard(s, &token, xid, "of timed-out branch").await;
        warn!(target: "proxima::xa", session = %s.id, branch = %xid, "branch timed out and was rolled back");
        self.finish(s, xid, "rolled back (timeout)").await;
    }

    /// Session teardown: unfinished branches roll back, prepared ones detach and stay in doubt.
    pub async fn on_session_close(&self, s: &mut Session) {
        let Some(xid) = s.branch.clone() else { return };
        let phase = self.branches.lock().get(&xid).map(|e| e.phase);
        match phase {
            Some(BranchPhase::Prepared) => {
                self.update(&xid, |e| e.session = None);
                if let Some(conn) = s.conn.as_mut() {
                    conn.state.branch = None;
                }
                s.branch = None;
                s.branch_active = false;
                s.unpin_reason(PinReason::Branch);
                warn!(target: "proxima::xa", session = %s.id, branch = %xid, "session closed with a prepared branch; branch detached");
            }
            _ => {
                let token = CancellationToken::new();
                self.roll_back_or_discard(s, &token, &xid, "on session close").await;
                warn!(target: "proxima::xa", session = %s.id, branch = %xid, "open branch rolled back on session close");
                self.finish(s, &xid, "rolled back (session closed)").await;
            }
        }
    }

    /// Terminal state: forget the branch and let the connection go back to the pool.
    async fn finish(&self, s: &mut Session, xid: &Xid, outcome: &str) {
        self.branches.lock().remove(xid);
        if let Some(conn) = s.conn.as_mut() {
            if conn.state.branch.as_ref() == Some(xid) {
                conn.state.branch = None;
            }
        }
        if s.branch.as_ref() == Some(xid) {
            s.branch = None;
            s.branch_active = false;
        }
        s.unpin_reason(PinReason::Branch);
        debug!(target: "proxima::xa", session = %s.id, branch = %xid, outcome = outcome, "branch finished");
        s.settle(&self.pools).await;
    }
}
