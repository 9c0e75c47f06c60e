//!
//! proxima backend capability
//! --------------------------
//! The core never branches on vendor identity. Everything vendor specific (SQL dialect, type
//! mapping, how a session is reset, how XA verbs are spelled) lives behind the traits in this
//! module, with one driver per backend family selected when a pool is created.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::affinity::AffinityPattern;
use crate::error::{BackendError, ProxyError, ProxyResult};
use crate::value::{b64, Column, LobKind, LobLocator, Row, Value};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match norm.as_str() {
            "READ UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// XA transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    #[serde(with = "b64")]
    pub gtrid: Vec<u8>,
    #[serde(with = "b64")]
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Self { format_id, gtrid: gtrid.into(), bqual: bqual.into() }
    }
}

impl Display for Xid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.gtrid { write!(f, "{b:02x}")?; }
        f.write_str(":")?;
        for b in &self.bqual { write!(f, "{b:02x}")?; }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFlags {
    NoFlags,
    Join,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndFlags {
    Success,
    Fail,
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XaVote {
    Commit,
    ReadOnly,
}

/// One branch lifecycle operation forwarded to a backend connection.
#[derive(Debug, Clone, Copy)]
pub enum BranchOp<'a> {
    Start { xid: &'a Xid, flags: StartFlags },
    End { xid: &'a Xid, flags: EndFlags },
    Prepare { xid: &'a Xid },
    Commit { xid: &'a Xid, one_phase: bool },
    Rollback { xid: &'a Xid },
    Recover,
    Forget { xid: &'a Xid },
    SetTimeout { seconds: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchReply {
    Done,
    Vote(XaVote),
    Recovered(Vec<Xid>),
}

/// Outcome of asking a connection to drop its session-local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Verified,
    /// The backend cannot prove the session is clean; the pool discards the connection.
    Unverified,
}

pub enum Execution {
    UpdateCount(u64),
    Rows(Box<dyn BackendCursor>),
}

/// Where and as whom a pool opens its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub url: String,
    pub family: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BackendTarget {
    pub fn parse(url: &str, username: Option<String>, password: Option<String>) -> ProxyResult<Self> {
        let (scheme, _) = url
            .split_once("://")
            .ok_or_else(|| ProxyError::config(format!("datasource url '{url}' has no scheme")))?;
        if scheme.is_empty() {
            return Err(ProxyError::config(format!("datasource url '{url}' has no scheme")));
        }
        Ok(Self { url: url.to_string(), family: scheme.to_ascii_lowercase(), username, password })
    }

    /// Part of the url after `scheme://`.
    pub fn location(&self) -> &str {
        self.url.split_once("://").map(|(_, rest)| rest).unwrap_or(&self.url)
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn family(&self) -> &str;

    async fn open(&self, target: &BackendTarget) -> Result<Box<dyn BackendConnection>, BackendError>;

    /// True when the backend already hands out a clean session on reuse, so the pool can skip
    /// the explicit reset.
    fn resets_on_reuse(&self) -> bool { false }

    /// Extra patterns that force session pinning on this family.
    fn affinity_patterns(&self) -> Vec<AffinityPattern> { Vec::new() }
}

#[async_trait]
pub trait BackendConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, BackendError>;
    async fn commit(&mut self) -> Result<(), BackendError>;
    async fn rollback(&mut self) -> Result<(), BackendError>;
    async fn set_autocommit(&mut self, on: bool) -> Result<(), BackendError>;
    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), BackendError>;
    async fn set_read_only(&mut self, _read_only: bool) -> Result<(), BackendError> { Ok(()) }
    /// Drop temp tables, session variables and any other session-local state.
    async fn reset_session(&mut self) -> Result<ResetOutcome, BackendError>;
    async fn ping(&mut self) -> bool;
    async fn participate(&mut self, op: BranchOp<'_>) -> Result<BranchReply, BackendError>;

    async fn create_lob(&mut self, kind: LobKind) -> Result<LobLocator, BackendError>;
    async fn write_lob(&mut self, lob: &LobLocator, offset: u64, bytes: &[u8]) -> Result<(), BackendError>;
    async fn read_lob(&mut self, lob: &LobLocator, offset: u64, max: usize) -> Result<Vec<u8>, BackendError>;
    async fn lob_length(&mut self, lob: &LobLocator) -> Result<Option<u64>, BackendError>;

    async fn close(self: Box<Self>);
}

/// Forward-only row source. A fetch returning no rows means the cursor is exhausted.
#[async_trait]
pub trait BackendCursor: Send {
    fn columns(&self) -> &[Column];
    async fn fetch(&mut self, n: usize) -> Result<Vec<Row>, BackendError>;
    async fn close(self: Box<Self>);
}

/// Family name -> driver, handed explicitly to the proxy.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn BackendDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry with every family compiled into this build.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(memory::MemoryDriver::new()));
        #[cfg(feature = "postgres")]
        reg.register(Arc::new(postgres::PostgresDriver::new()));
        reg
    }

    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.family().to_ascii_lowercase(), driver);
    }

    pub fn get(&self, family: &str) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.get(&family.to_ascii_lowercase()).cloned()
    }

    pub fn families(&self) -> Vec<String> {
        let mut v: Vec<String> = self.drivers.keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_family_is_url_scheme() {
        let t = BackendTarget::parse("Memory://reports", None, None).unwrap();
        assert_eq!(t.family, "memory");
        assert_eq!(t.location(), "reports");
        assert!(BackendTarget::parse("reports", None, None).is_err());
    }

    #[test]
    fn isolation_parse_accepts_common_spellings() {
        assert_eq!(IsolationLevel::parse("read_committed"), Some(IsolationLevel::ReadCommitted));
        assert_eq!(IsolationLevel::parse("Serializable"), Some(IsolationLevel::Serializable));
        assert_eq!(IsolationLevel::parse("repeatable-read"), Some(IsolationLevel::RepeatableRead));
        assert_eq!(IsolationLevel::parse("chaos"), None);
    }

    #[test]
    fn xid_display_is_hex() {
        let x = Xid::new(1, b"g1".to_vec(), vec![0x0a]);
        assert_eq!(x.to_string(), "1:6731:0a");
    }

    #[test]
    fn builtin_registry_has_memory() {
        let reg = DriverRegistry::with_builtin();
        assert!(reg.get("MEMORY").is_some());
        assert!(reg.families().contains(&"memory".to_string()));
    }
}
