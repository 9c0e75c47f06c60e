//! Unified proxy error model and mapping helpers.
//! Every call on the client surface fails with a `ProxyError`; the category decides who detected
//! it (the core itself, or the backend) and how it maps onto HTTP statuses and SQLSTATE codes.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Kind of opaque handle a caller referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Session,
    Statement,
    Cursor,
    Stream,
    Branch,
}

impl Display for HandleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandleKind::Session => "session",
            HandleKind::Statement => "statement",
            HandleKind::Cursor => "cursor",
            HandleKind::Stream => "stream",
            HandleKind::Branch => "branch",
        };
        f.write_str(s)
    }
}

/// Failure reported by a backend driver. Never rewritten by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    pub vendor_code: Option<i32>,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl BackendError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { vendor_code: None, sqlstate: None, message: message.into() }
    }

    pub fn with_state<S: Into<String>>(sqlstate: &str, message: S) -> Self {
        Self { vendor_code: None, sqlstate: Some(sqlstate.to_string()), message: message.into() }
    }

    pub fn with_code(mut self, vendor_code: i32) -> Self {
        self.vendor_code = Some(vendor_code);
        self
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.sqlstate, self.vendor_code) {
            (Some(state), Some(code)) => write!(f, "[{state}/{code}] {}", self.message),
            (Some(state), None) => write!(f, "[{state}] {}", self.message),
            (None, Some(code)) => write!(f, "[{code}] {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// XA error codes for branch errors the coordinator detects on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaCode {
    #[serde(rename = "XAER_NOTA")]
    Nota,
    #[serde(rename = "XAER_PROTO")]
    Proto,
    #[serde(rename = "XAER_DUPID")]
    DupId,
    #[serde(rename = "XAER_INVAL")]
    Inval,
    #[serde(rename = "XAER_RMERR")]
    RmErr,
    #[serde(rename = "XA_RBROLLBACK")]
    RbRollback,
}

impl XaCode {
    pub fn code(&self) -> i32 {
        match self {
            XaCode::Nota => -4,
            XaCode::Proto => -6,
            XaCode::DupId => -8,
            XaCode::Inval => -5,
            XaCode::RmErr => -3,
            XaCode::RbRollback => 100,
        }
    }
}

impl Display for XaCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            XaCode::Nota => "XAER_NOTA",
            XaCode::Proto => "XAER_PROTO",
            XaCode::DupId => "XAER_DUPID",
            XaCode::Inval => "XAER_INVAL",
            XaCode::RmErr => "XAER_RMERR",
            XaCode::RbRollback => "XA_RBROLLBACK",
        };
        f.write_str(s)
    }
}

/// Coarse error category as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    StaleHandle,
    PoolExhausted,
    AffinityConflict,
    Backend,
    Protocol,
    Cancelled,
    Timeout,
    Config,
    Internal,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyError {
    #[error("stale handle: unknown {kind} '{id}'")]
    StaleHandle { kind: HandleKind, id: String },
    #[error("pool exhausted for datasource '{datasource}': {reason}")]
    PoolExhausted { datasource: String, reason: String },
    #[error("affinity conflict: {message}")]
    AffinityConflict { message: String },
    #[error("backend error: {error}")]
    Backend { error: BackendError },
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    #[error("{code}: {message}")]
    Xa { code: XaCode, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {millis} ms")]
    Timeout { millis: u64 },
    #[error("configuration error: {message}")]
    Config { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn stale<S: ToString>(kind: HandleKind, id: S) -> Self { ProxyError::StaleHandle { kind, id: id.to_string() } }
    pub fn exhausted<S: Into<String>>(datasource: &str, reason: S) -> Self { ProxyError::PoolExhausted { datasource: datasource.to_string(), reason: reason.into() } }
    pub fn conflict<S: Into<String>>(message: S) -> Self { ProxyError::AffinityConflict { message: message.into() } }
    pub fn protocol<S: Into<String>>(message: S) -> Self { ProxyError::Protocol { message: message.into() } }
    pub fn config<S: Into<String>>(message: S) -> Self { ProxyError::Config { message: message.into() } }
    pub fn internal<S: Into<String>>(message: S) -> Self { ProxyError::Internal { message: message.into() } }
    pub fn xa<S: Into<String>>(code: XaCode, message: S) -> Self { ProxyError::Xa { code, message: message.into() } }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::StaleHandle { .. } => ErrorCategory::StaleHandle,
            ProxyError::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            ProxyError::AffinityConflict { .. } => ErrorCategory::AffinityConflict,
            ProxyError::Backend { .. } => ErrorCategory::Backend,
            ProxyError::Protocol { .. } => ErrorCategory::Protocol,
            ProxyError::Xa { code, .. } => match code {
                XaCode::Nota => ErrorCategory::StaleHandle,
                XaCode::Proto | XaCode::DupId | XaCode::Inval => ErrorCategory::Protocol,
                XaCode::RmErr | XaCode::RbRollback => ErrorCategory::Backend,
            },
            ProxyError::Cancelled => ErrorCategory::Cancelled,
            ProxyError::Timeout { .. } => ErrorCategory::Timeout,
            ProxyError::Config { .. } => ErrorCategory::Config,
            ProxyError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            ProxyError::StaleHandle { .. } => "stale_handle",
            ProxyError::PoolExhausted { .. } => "pool_exhausted",
            ProxyError::AffinityConflict { .. } => "affinity_conflict",
            ProxyError::Backend { .. } => "backend_error",
            ProxyError::Protocol { .. } => "protocol_violation",
            ProxyError::Xa { .. } => "xa_error",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::Config { .. } => "config_error",
            ProxyError::Internal { .. } => "internal_error",
        }
    }

    /// SQLSTATE to report. Backend errors keep whatever the backend said (possibly nothing).
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ProxyError::Backend { error } => error.sqlstate.as_deref(),
            ProxyError::StaleHandle { .. } => Some("08003"),
            ProxyError::PoolExhausted { .. } => Some("08004"),
            ProxyError::AffinityConflict { .. } => Some("25000"),
            ProxyError::Protocol { .. } => Some("HY010"),
            ProxyError::Xa { code, .. } => Some(match code {
                XaCode::Nota => "08003",
                XaCode::RbRollback => "40000",
                XaCode::RmErr => "HY000",
                _ => "HY010",
            }),
            ProxyError::Cancelled => Some("57014"),
            ProxyError::Timeout { .. } => Some("HYT00"),
            ProxyError::Config { .. } => Some("HY000"),
            ProxyError::Internal { .. } => Some("XX000"),
        }
    }

    pub fn vendor_code(&self) -> Option<i32> {
        match self {
            ProxyError::Backend { error } => error.vendor_code,
            ProxyError::Xa { code, .. } => Some(code.code()),
            _ => None,
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::StaleHandle { .. } => 404,
            ProxyError::PoolExhausted { .. } => 503,
            ProxyError::AffinityConflict { .. } => 409,
            ProxyError::Backend { .. } => 422,
            ProxyError::Protocol { .. } => 400,
            ProxyError::Xa { code, .. } => match code {
                XaCode::Nota => 404,
                XaCode::RmErr | XaCode::RbRollback => 422,
                _ => 400,
            },
            ProxyError::Cancelled => 499,
            ProxyError::Timeout { .. } => 504,
            ProxyError::Config { .. } => 400,
            ProxyError::Internal { .. } => 500,
        }
    }
}

impl From<BackendError> for ProxyError {
    fn from(error: BackendError) -> Self { ProxyError::Backend { error } }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ProxyError::stale(HandleKind::Session, "s1").http_status(), 404);
        assert_eq!(ProxyError::exhausted("reports", "timed out").http_status(), 503);
        assert_eq!(ProxyError::conflict("other branch").http_status(), 409);
        assert_eq!(ProxyError::protocol("bad order").http_status(), 400);
        assert_eq!(ProxyError::Timeout { millis: 5 }.http_status(), 504);
        assert_eq!(ProxyError::internal("x").http_status(), 500);
    }

    #[test]
    fn backend_error_passes_through_verbatim() {
        let be = BackendError::with_state("42P01", "relation \"nope\" does not exist").with_code(7);
        let err: ProxyError = be.clone().into();
        assert_eq!(err.category(), ErrorCategory::Backend);
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert_eq!(err.vendor_code(), Some(7));
        match err {
            ProxyError::Backend { error } => assert_eq!(error, be),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn backend_error_without_state_stays_empty() {
        let err: ProxyError = BackendError::new("boom").into();
        assert_eq!(err.sqlstate(), None);
        assert_eq!(err.to_string(), "backend error: boom");
    }

    #[test]
    fn stale_handle_display() {
        let e = ProxyError::stale(HandleKind::Cursor, "abc");
        assert_eq!(e.to_string(), "stale handle: unknown cursor 'abc'");
        assert_eq!(e.code_str(), "stale_handle");
        assert_eq!(e.sqlstate(), Some("08003"));
    }

    #[test]
    fn xa_errors_carry_their_code() {
        let e = ProxyError::xa(XaCode::Nota, "unknown branch");
        assert_eq!(e.category(), ErrorCategory::StaleHandle);
        assert_eq!(e.vendor_code(), Some(-4));
        assert_eq!(e.to_string(), "XAER_NOTA: unknown branch");
        let e = ProxyError::xa(XaCode::Proto, "prepare before end");
        assert_eq!(e.category(), ErrorCategory::Protocol);
        assert_eq!(e.vendor_code(), Some(-6));
        assert_eq!(ProxyError::xa(XaCode::RbRollback, "rollback only").vendor_code(), Some(100));
    }

    #[test]
    fn serde_roundtrip_keeps_category() {
        let e = ProxyError::exhausted("reports", "no permit within 10 ms");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"pool_exhausted\""));
        let back: ProxyError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
