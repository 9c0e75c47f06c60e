//! Session affinity detection.
//!
//! Decides from SQL text alone whether a statement leaves state behind on the physical
//! connection it ran on (temp tables, session variables, session locks, open transactions).
//! Such a statement pins its session to that connection. Classification works on a normalized
//! form of the text so literal values, comments, case and spacing never change the answer.
//! A missed pattern corrupts client state while an extra pin only costs pool capacity, so
//! anything that looks like a temp table and is not otherwise recognized still pins.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::DriverRegistry;
use crate::config::AffinitySettings;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinReason {
    TemporaryTable,
    SessionVariable,
    SessionLock,
    PreparedSql,
    LocalTransaction,
    Branch,
    LargeObject,
    Suspicious,
}

impl PinReason {
    /// Reasons that end with the unit of work instead of the session.
    pub fn is_transactional(&self) -> bool {
        matches!(self, PinReason::LocalTransaction | PinReason::Branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NoAffinity,
    RequiresPinning(PinReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityState {
    Floating,
    Pinned,
}

/// Set of reasons currently holding a session pinned. Empty means floating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    reasons: BTreeSet<PinReason>,
}

impl PinSet {
    pub fn state(&self) -> AffinityState {
        if self.reasons.is_empty() { AffinityState::Floating } else { AffinityState::Pinned }
    }
    pub fn add(&mut self, r: PinReason) -> bool { self.reasons.insert(r) }
    pub fn remove(&mut self, r: PinReason) -> bool { self.reasons.remove(&r) }
    pub fn contains(&self, r: PinReason) -> bool { self.reasons.contains(&r) }
    pub fn clear(&mut self) { self.reasons.clear(); }
    pub fn is_empty(&self) -> bool { self.reasons.is_empty() }
    pub fn reasons(&self) -> Vec<PinReason> { self.reasons.iter().copied().collect() }
}

/// Session context visible to the classifier.
#[derive(Debug, Clone, Copy)]
pub struct AffinityContext {
    pub state: AffinityState,
    pub branch_active: bool,
}

impl AffinityContext {
    pub fn floating() -> Self { Self { state: AffinityState::Floating, branch_active: false } }
}

#[derive(Debug, Clone)]
pub struct AffinityPattern {
    pub name: String,
    pub reason: PinReason,
    regex: Regex,
}

impl AffinityPattern {
    pub fn new(name: &str, pattern: &str, reason: PinReason) -> Result<Self, regex::Error> {
        Ok(Self { name: name.to_string(), reason, regex: Regex::new(pattern)? })
    }

    pub fn is_match(&self, normalized: &str) -> bool { self.regex.is_match(normalized) }

    pub fn as_str(&self) -> &str { self.regex.as_str() }
}

const BUILTIN_PATTERNS: &[(&str, &str, PinReason)] = &[
    // transaction control comes first so SET AUTOCOMMIT is not read as a plain variable
    ("begin", r"^(?:BEGIN(?:\s+(?:WORK|TRANSACTION|TRAN))?|START\s+TRANSACTION)\b", PinReason::LocalTransaction),
    ("autocommit-off", r"^SET\s+AUTOCOMMIT\s*(?:=|\bTO\b)?\s*(?:0|OFF|FALSE)\b", PinReason::LocalTransaction),
    ("temporary-object", r"\bCREATE\s+(?:OR\s+REPLACE\s+)?(?:GLOBAL\s+|LOCAL\s+)?(?:TEMPORARY|TEMP)\s+(?:TABLE|VIEW|SEQUENCE)\b", PinReason::TemporaryTable),
    ("hash-temp-table", r"\bCREATE\s+TABLE\s+#", PinReason::TemporaryTable),
    ("select-into-temp", r"\bSELECT\b.*\bINTO\s+(?:#|(?:LOCAL\s+)?TEMP(?:ORARY)?\b)", PinReason::TemporaryTable),
    ("declared-temp-table", r"\bDECLARE\s+GLOBAL\s+TEMPORARY\s+TABLE\b", PinReason::TemporaryTable),
    ("preserve-rows", r"\bON\s+COMMIT\s+PRESERVE\s+ROWS\b", PinReason::TemporaryTable),
    ("session-qualified", r"\bSESSION\.[A-Z_#]", PinReason::TemporaryTable),
    ("user-variable", r"^SET\s+@", PinReason::SessionVariable),
    ("scoped-set", r"^SET\s+(?:SESSION|LOCAL)\s+", PinReason::SessionVariable),
    ("session-setting", r"^SET\s+(?:ROLE|SCHEMA|SEARCH_PATH|NAMES|TIME\s+ZONE|TRANSACTION|CHARACTERISTICS|SESSION\s+AUTHORIZATION)\b", PinReason::SessionVariable),
    ("generic-set", r"^SET\s+[A-Z_][A-Z0-9_.]*\s*(?:=|\bTO\b)", PinReason::SessionVariable),
    ("select-assign", r"@[A-Z_][A-Z0-9_]*\s*:=", PinReason::SessionVariable),
    ("set-config", r"\bSET_CONFIG\s*\(", PinReason::SessionVariable),
    ("alter-session", r"^ALTER\s+SESSION\s+SET\b", PinReason::SessionVariable),
    ("use-database", r"^USE\s+\S", PinReason::SessionVariable),
    ("lock-tables", r"^LOCK\s+TABLES?\b", PinReason::SessionLock),
    ("named-lock", r"\b(?:GET_LOCK|PG_ADVISORY_LOCK|PG_ADVISORY_LOCK_SHARED|SP_GETAPPLOCK)\b", PinReason::SessionLock),
    ("prepare-sql", r"^PREPARE\s+[A-Z_][A-Z0-9_]*\s+(?:FROM|AS)\b", PinReason::PreparedSql),
    ("held-cursor", r"\bDECLARE\s+\S+\s+.*\bCURSOR\s+WITH\s+HOLD\b", PinReason::PreparedSql),
];

static BUILTIN: Lazy<Vec<AffinityPattern>> = Lazy::new(|| {
    BUILTIN_PATTERNS
        .iter()
        .filter_map(|(name, pat, reason)| AffinityPattern::new(name, pat, *reason).ok())
        .collect()
});

static TEMP_WORD: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\bTEMP(?:ORARY)?\b").ok());
static TABLE_WORD: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\bTABLE\b").ok());
static TX_END: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:COMMIT|ROLLBACK|END|ABORT)(?:\s+(?:WORK|TRANSACTION|TRAN))?$|^SET\s+AUTOCOMMIT\s*(?:=|\bTO\b)?\s*(?:1|ON|TRUE)$").ok()
});
static TX_BEGIN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:BEGIN(?:\s+(?:WORK|TRANSACTION|TRAN))?|START\s+TRANSACTION\b.*|SET\s+AUTOCOMMIT\s*(?:=|\bTO\b)?\s*(?:0|OFF|FALSE))$").ok()
});

/// Whether a raw statement opens or closes a local transaction on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionBoundary {
    Begin,
    End,
}

#[derive(Debug, Clone)]
pub struct AffinityDetector {
    patterns: Vec<AffinityPattern>,
}

impl Default for AffinityDetector {
    fn default() -> Self { Self::new() }
}

impl AffinityDetector {
    pub fn new() -> Self { Self { patterns: BUILTIN.clone() } }

    pub fn with_extra<I: IntoIterator<Item = AffinityPattern>>(extra: I) -> Self {
        let mut d = Self::new();
        d.patterns.extend(extra);
        d
    }

    /// Built-in table plus every registered family's patterns plus configured extras.
    pub fn from_config(settings: &AffinitySettings, drivers: &DriverRegistry) -> ProxyResult<Self> {
        let mut extra = Vec::new();
        for family in drivers.families() {
            if let Some(d) = drivers.get(&family) {
                extra.extend(d.affinity_patterns());
            }
        }
        for p in &settings.extra_patterns {
            let compiled = AffinityPattern::new(&p.name, &p.pattern, p.reason)
                .map_err(|e| ProxyError::config(format!("affinity pattern '{}': {e}", p.name)))?;
            extra.push(compiled);
        }
        Ok(Self::with_extra(extra))
    }

    pub fn patterns(&self) -> &[AffinityPattern] { &self.patterns }

    pub fn classify(&self, sql: &str, ctx: &AffinityContext) -> Classification {
        if ctx.branch_active {
            return Classification::RequiresPinning(PinReason::Branch);
        }
        let norm = normalize(sql);
        if let Some(p) = self.patterns.iter().find(|p| p.is_match(&norm)) {
            tracing::debug!(target: "proxima::affinity", pattern = %p.name, "statement requires pinning");
            return Classification::RequiresPinning(p.reason);
        }
        if looks_like_temp_table(&norm) {
            tracing::debug!(target: "proxima::affinity", "unrecognized temp-table shape, pinning");
            return Classification::RequiresPinning(PinReason::Suspicious);
        }
        Classification::NoAffinity
    }

    pub fn transaction_boundary(&self, sql: &str) -> Option<TransactionBoundary> {
        let norm = normalize(sql);
        if TX_END.as_ref().is_some_and(|r| r.is_match(&norm)) {
            return Some(TransactionBoundary::End);
        }
        if TX_BEGIN.as_ref().is_some_and(|r| r.is_match(&norm)) {
            return Some(TransactionBoundary::Begin);
        }
        None
    }
}

fn looks_like_temp_table(norm: &str) -> bool {
    match (TEMP_WORD.as_ref(), TABLE_WORD.as_ref()) {
        (Some(temp), Some(table)) => temp.is_match(norm) && table.is_match(norm),
        _ => true,
    }
}

/// Upper-cases, strips comments, replaces string literals with `?`, collapses whitespace and
/// drops a trailing semicolon.
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' { break; }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' { break; }
                    prev = n;
                }
                pending_space = true;
            }
            '\'' => {
                // '' inside a literal is an escaped quote
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => { chars.next(); }
                        Some('\'') | None => break,
                        Some(_) => {}
                    }
                }
                push_token(&mut out, &mut pending_space, '?');
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                for u in c.to_uppercase() {
                    push_token(&mut out, &mut pending_space, u);
                }
            }
        }
    }
    let trimmed = out.trim_end_matches(';').trim_end();
    trimmed.to_string()
}

fn push_token(out: &mut String, pending_space: &mut bool, c: char) {
    if *pending_space && !out.is_empty() {
        out.push(' ');
    }
    *pending_space = false;
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins(sql: &str) -> Option<PinReason> {
        match AffinityDetector::new().classify(sql, &AffinityContext::floating()) {
            Classification::RequiresPinning(r) => Some(r),
            Classification::NoAffinity => None,
        }
    }

    #[test]
    fn builtin_patterns_all_compile() {
        assert_eq!(BUILTIN.len(), BUILTIN_PATTERNS.len());
        assert!(TEMP_WORD.is_some() && TABLE_WORD.is_some() && TX_END.is_some() && TX_BEGIN.is_some());
    }

    #[test]
    fn normalize_strips_comments_literals_and_case() {
        assert_eq!(
            normalize("  select /* hi */ *\n from t -- trailing\n where a = 'it''s;' ;"),
            "SELECT * FROM T WHERE A = ?"
        );
    }

    #[test]
    fn temp_table_dialects_pin() {
        for sql in [
            "CREATE TEMPORARY TABLE t(id INT)",
            "create temp table t (id int)",
            "CREATE LOCAL TEMPORARY TABLE t(id INT)",
            "CREATE GLOBAL TEMPORARY TABLE t(id INT) ON COMMIT PRESERVE ROWS",
            "CREATE TABLE #t (id INT)",
            "SELECT a INTO #scratch FROM src",
            "SELECT * INTO TEMP scratch FROM src",
            "select id, total into temporary scratch from orders where total > 10",
            "SELECT * INTO TEMP TABLE scratch FROM src",
            "SELECT * INTO LOCAL TEMPORARY scratch FROM src",
            "DECLARE GLOBAL TEMPORARY TABLE SESSION.t (id INT) ON COMMIT PRESERVE ROWS NOT LOGGED",
            "INSERT INTO SESSION.t VALUES (1)",
            "create or replace temp view v as select 1",
        ] {
            assert_eq!(pins(sql), Some(PinReason::TemporaryTable), "{sql}");
        }
    }

    #[test]
    fn session_variables_pin() {
        for sql in [
            "SET @counter = 1",
            "set session sql_mode = 'ANSI'",
            "SET LOCAL work_mem = '64MB'",
            "SET search_path TO app, public",
            "SET statement_timeout = 5000",
            "SELECT @x := 5",
            "select set_config('app.user', 'bob', false)",
            "ALTER SESSION SET NLS_DATE_FORMAT = 'YYYY-MM-DD'",
            "USE reports",
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        ] {
            assert_eq!(pins(sql), Some(PinReason::SessionVariable), "{sql}");
        }
    }

    #[test]
    fn transactions_and_locks_pin() {
        assert_eq!(pins("BEGIN"), Some(PinReason::LocalTransaction));
        assert_eq!(pins("start transaction read only"), Some(PinReason::LocalTransaction));
        assert_eq!(pins("SET autocommit = 0"), Some(PinReason::LocalTransaction));
        assert_eq!(pins("LOCK TABLES t WRITE"), Some(PinReason::SessionLock));
        assert_eq!(pins("SELECT pg_advisory_lock(42)"), Some(PinReason::SessionLock));
        assert_eq!(pins("PREPARE q FROM 'SELECT 1'"), Some(PinReason::PreparedSql));
    }

    #[test]
    fn plain_statements_float() {
        for sql in [
            "SELECT * FROM orders WHERE id = ?",
            "INSERT INTO orders VALUES (1, 'create temporary table')",
            "UPDATE t SET a = 1 WHERE b = 2",
            "DELETE FROM t",
            "SELECT @@version",
            "SELECT * INTO temp_orders FROM orders",
            "-- CREATE TEMPORARY TABLE x\nSELECT 1",
        ] {
            assert_eq!(pins(sql), None, "{sql}");
        }
    }

    #[test]
    fn suspicious_temp_shapes_pin_conservatively() {
        assert_eq!(pins("CREATE UNLOGGED TEMP SNAPSHOT TABLE foo AS SELECT 1"), Some(PinReason::Suspicious));
    }

    #[test]
    fn active_branch_always_pins() {
        let d = AffinityDetector::new();
        let ctx = AffinityContext { state: AffinityState::Pinned, branch_active: true };
        assert_eq!(d.classify("SELECT 1", &ctx), Classification::RequiresPinning(PinReason::Branch));
    }

    #[test]
    fn classification_is_deterministic_and_value_blind() {
        let d = AffinityDetector::new();
        let ctx = AffinityContext::floating();
        let a = d.classify("SET @v = 'one'", &ctx);
        let b = d.classify("SELECT 1", &ctx);
        let c = d.classify("set   @v='two'", &ctx);
        assert_eq!(a, c);
        assert_eq!(b, Classification::NoAffinity);
        assert_eq!(d.classify("SET @v = 'one'", &ctx), a);
    }

    #[test]
    fn transaction_boundaries() {
        let d = AffinityDetector::new();
        assert_eq!(d.transaction_boundary("commit;"), Some(TransactionBoundary::End));
        assert_eq!(d.transaction_boundary("ROLLBACK WORK"), Some(TransactionBoundary::End));
        assert_eq!(d.transaction_boundary("set autocommit = on"), Some(TransactionBoundary::End));
        assert_eq!(d.transaction_boundary("begin"), Some(TransactionBoundary::Begin));
        assert_eq!(d.transaction_boundary("ROLLBACK TO SAVEPOINT a"), None);
        assert_eq!(d.transaction_boundary("COMMIT PREPARED 'x'"), None);
    }

    #[test]
    fn extra_patterns_extend_the_table() {
        let extra = AffinityPattern::new("listen", r"^LISTEN\b", PinReason::SessionVariable).unwrap();
        let d = AffinityDetector::with_extra(vec![extra]);
        assert_eq!(
            d.classify("listen jobs", &AffinityContext::floating()),
            Classification::RequiresPinning(PinReason::SessionVariable)
        );
    }

    #[test]
    fn pin_set_tracks_state() {
        let mut s = PinSet::default();
        assert_eq!(s.state(), AffinityState::Floating);
        s.add(PinReason::LocalTransaction);
        s.add(PinReason::TemporaryTable);
        assert_eq!(s.state(), AffinityState::Pinned);
        s.remove(PinReason::LocalTransaction);
        assert_eq!(s.reasons(), vec![PinReason::TemporaryTable]);
    }
}
