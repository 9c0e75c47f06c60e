//! Explicit proxy configuration.
//!
//! Nothing in the core reads ambient state: a `ProxyConfig` is built once (JSON file, then
//! `proxima.`-prefixed properties, then CLI flags) and handed to `Proxy::new`. Every field has
//! a documented default so an empty file, or no file at all, is a valid configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::affinity::PinReason;
use crate::backend::IsolationLevel;
use crate::error::{ProxyError, ProxyResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerSettings,
    /// Pool sizing used for every datasource unless overridden.
    #[serde(default)]
    pub defaults: PoolSettings,
    /// Target for datasource names without an explicit entry; `{datasource}` is substituted.
    #[serde(default = "ProxyConfig::default_target")]
    pub default_target: String,
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub lobs: LobSettings,
    #[serde(default)]
    pub segregation: SegregationSettings,
    #[serde(default)]
    pub affinity: AffinitySettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            defaults: PoolSettings::default(),
            default_target: Self::default_target(),
            datasources: HashMap::new(),
            sessions: SessionSettings::default(),
            lobs: LobSettings::default(),
            segregation: SegregationSettings::default(),
            affinity: AffinitySettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_bind")]
    pub bind: String,
}

impl ServerSettings {
    fn default_bind() -> String { "127.0.0.1:1059".to_string() }
}

impl Default for ServerSettings {
    fn default() -> Self { Self { bind: Self::default_bind() } }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "PoolSettings::default_max_size")]
    pub max_size: usize,
    #[serde(default = "PoolSettings::default_min_idle")]
    pub min_idle: usize,
    /// How long an acquire may wait for a free slot.
    #[serde(default = "PoolSettings::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// How long opening a new backend connection may take.
    #[serde(default = "PoolSettings::default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    #[serde(default = "PoolSettings::default_leak_timeout_ms")]
    pub leak_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    #[serde(default = "PoolSettings::default_true")]
    pub test_on_borrow: bool,
    #[serde(default)]
    pub default_isolation: IsolationLevel,
    #[serde(default = "PoolSettings::default_true")]
    pub default_autocommit: bool,
}

impl PoolSettings {
    fn default_max_size() -> usize { 20 }
    fn default_min_idle() -> usize { 5 }
    fn default_acquire_timeout_ms() -> u64 { 10_000 }
    fn default_connection_timeout_ms() -> u64 { 10_000 }
    fn default_idle_timeout_ms() -> u64 { 600_000 }
    fn default_max_lifetime_ms() -> u64 { 1_800_000 }
    fn default_leak_timeout_ms() -> u64 { 300_000 }
    fn default_housekeeping_interval_ms() -> u64 { 60_000 }
    fn default_true() -> bool { true }

    pub fn acquire_timeout(&self) -> Duration { Duration::from_millis(self.acquire_timeout_ms) }
    pub fn connection_timeout(&self) -> Duration { Duration::from_millis(self.connection_timeout_ms) }
    pub fn idle_timeout(&self) -> Duration { Duration::from_millis(self.idle_timeout_ms) }
    pub fn max_lifetime(&self) -> Duration { Duration::from_millis(self.max_lifetime_ms) }
    pub fn leak_timeout(&self) -> Duration { Duration::from_millis(self.leak_timeout_ms) }
    pub fn housekeeping_interval(&self) -> Duration { Duration::from_millis(self.housekeeping_interval_ms) }

    pub fn validate(&self, name: &str) -> ProxyResult<()> {
        if self.max_size == 0 {
            return Err(ProxyError::config(format!("datasource '{name}': max_size must be at least 1")));
        }
        if self.min_idle > self.max_size {
            return Err(ProxyError::config(format!(
                "datasource '{name}': min_idle {} exceeds max_size {}",
                self.min_idle, self.max_size
            )));
        }
        Ok(())
    }

    /// Apply one `key=value` setting. Accepts the snake_case field names and the usual
    /// camelCase pool property spellings.
    fn set(&mut self, key: &str, value: &str) -> Result<bool, String> {
        fn num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T, String> {
            v.trim().parse::<T>().map_err(|_| format!("invalid value '{v}' for {key}"))
        }
        fn flag(key: &str, v: &str) -> Result<bool, String> {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(format!("invalid value '{v}' for {key}")),
            }
        }
        match key {
            "max_size" | "maximumPoolSize" | "maxPoolSize" => self.max_size = num(key, value)?,
            "min_idle" | "minimumIdle" | "minIdle" => self.min_idle = num(key, value)?,
            "acquire_timeout_ms" | "acquireTimeout" => self.acquire_timeout_ms = num(key, value)?,
            "connection_timeout_ms" | "connectionTimeout" => self.connection_timeout_ms = num(key, value)?,
            "idle_timeout_ms" | "idleTimeout" => self.idle_timeout_ms = num(key, value)?,
            "max_lifetime_ms" | "maxLifetime" => self.max_lifetime_ms = num(key, value)?,
            "leak_timeout_ms" | "leakDetectionThreshold" => self.leak_timeout_ms = num(key, value)?,
            "housekeeping_interval_ms" => self.housekeeping_interval_ms = num(key, value)?,
            "test_on_borrow" => self.test_on_borrow = flag(key, value)?,
            "default_autocommit" | "autoCommit" => self.default_autocommit = flag(key, value)?,
            "default_isolation" | "transactionIsolation" => {
                self.default_isolation = IsolationLevel::parse(value.trim_start_matches("TRANSACTION_"))
                    .ok_or_else(|| format!("invalid isolation level '{value}'"))?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
            min_idle: Self::default_min_idle(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
            connection_timeout_ms: Self::default_connection_timeout_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            max_lifetime_ms: Self::default_max_lifetime_ms(),
            leak_timeout_ms: Self::default_leak_timeout_ms(),
            housekeeping_interval_ms: Self::default_housekeeping_interval_ms(),
            test_on_borrow: true,
            default_isolation: IsolationLevel::default(),
            default_autocommit: true,
        }
    }
}

/// Per-datasource overrides; unset fields inherit `ProxyConfig::defaults`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolOverrides {
    pub max_size: Option<usize>,
    pub min_idle: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub max_lifetime_ms: Option<u64>,
    pub leak_timeout_ms: Option<u64>,
    pub test_on_borrow: Option<bool>,
    pub default_isolation: Option<IsolationLevel>,
}

impl PoolOverrides {
    pub fn apply(&self, base: &PoolSettings) -> PoolSettings {
        let mut s = base.clone();
        if let Some(v) = self.max_size { s.max_size = v; }
        if let Some(v) = self.min_idle { s.min_idle = v; }
        if let Some(v) = self.acquire_timeout_ms { s.acquire_timeout_ms = v; }
        if let Some(v) = self.connection_timeout_ms { s.connection_timeout_ms = v; }
        if let Some(v) = self.idle_timeout_ms { s.idle_timeout_ms = v; }
        if let Some(v) = self.max_lifetime_ms { s.max_lifetime_ms = v; }
        if let Some(v) = self.leak_timeout_ms { s.leak_timeout_ms = v; }
        if let Some(v) = self.test_on_borrow { s.test_on_borrow = v; }
        if let Some(v) = self.default_isolation { s.default_isolation = v; }
        s
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, flatten)]
    pub pool: PoolOverrides,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Sessions idle longer than this are force-closed by the reaper.
    #[serde(default = "SessionSettings::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "SessionSettings::default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Rows per fetch block when neither statement nor caller says otherwise.
    #[serde(default = "SessionSettings::default_fetch_size")]
    pub default_fetch_size: usize,
    /// Upper bound on rows in one fetch block, whatever the caller asks for.
    #[serde(default = "SessionSettings::default_max_fetch_rows")]
    pub max_fetch_rows: usize,
}

impl SessionSettings {
    fn default_idle_timeout_ms() -> u64 { 1_800_000 }
    fn default_reap_interval_ms() -> u64 { 5_000 }
    fn default_fetch_size() -> usize { 100 }
    fn default_max_fetch_rows() -> usize { 10_000 }
    pub fn idle_timeout(&self) -> Duration { Duration::from_millis(self.idle_timeout_ms) }
    pub fn reap_interval(&self) -> Duration { Duration::from_millis(self.reap_interval_ms) }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            reap_interval_ms: Self::default_reap_interval_ms(),
            default_fetch_size: Self::default_fetch_size(),
            max_fetch_rows: Self::default_max_fetch_rows(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LobSettings {
    /// Values at or above this many bytes are only reachable through streams.
    #[serde(default = "LobSettings::default_inline_threshold")]
    pub inline_threshold: usize,
    /// Upper bound for a single read chunk.
    #[serde(default = "LobSettings::default_max_chunk")]
    pub max_chunk: usize,
}

impl LobSettings {
    fn default_inline_threshold() -> usize { 8 * 1024 }
    fn default_max_chunk() -> usize { 64 * 1024 }
}

impl Default for LobSettings {
    fn default() -> Self { Self { inline_threshold: Self::default_inline_threshold(), max_chunk: Self::default_max_chunk() } }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegregationSettings {
    #[serde(default = "SegregationSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "SegregationSettings::default_slow_slot_percentage")]
    pub slow_slot_percentage: u8,
    #[serde(default = "SegregationSettings::default_slow_slot_timeout_ms")]
    pub slow_slot_timeout_ms: u64,
    #[serde(default = "SegregationSettings::default_fast_slot_timeout_ms")]
    pub fast_slot_timeout_ms: u64,
    /// A class unused for this long lends free slots to the other class.
    #[serde(default = "SegregationSettings::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl SegregationSettings {
    fn default_enabled() -> bool { true }
    fn default_slow_slot_percentage() -> u8 { 20 }
    fn default_slow_slot_timeout_ms() -> u64 { 120_000 }
    fn default_fast_slot_timeout_ms() -> u64 { 60_000 }
    fn default_idle_timeout_ms() -> u64 { 10_000 }
}

impl Default for SegregationSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            slow_slot_percentage: Self::default_slow_slot_percentage(),
            slow_slot_timeout_ms: Self::default_slow_slot_timeout_ms(),
            fast_slot_timeout_ms: Self::default_fast_slot_timeout_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AffinitySettings {
    #[serde(default)]
    pub extra_patterns: Vec<PatternConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    /// Regex matched against normalized (upper-cased, literal-free) SQL.
    pub pattern: String,
    #[serde(default = "PatternConfig::default_reason")]
    pub reason: PinReason,
}

impl PatternConfig {
    fn default_reason() -> PinReason { PinReason::Suspicious }
}

/// Everything a pool needs, after defaults and overrides are merged.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedDatasource {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool: PoolSettings,
}

impl ProxyConfig {
    fn default_target() -> String { "memory://{datasource}".to_string() }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg: ProxyConfig = serde_json::from_slice(&bytes).with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        self.defaults.validate("<defaults>")?;
        for (name, ds) in &self.datasources {
            ds.pool.apply(&self.defaults).validate(name)?;
        }
        if self.sessions.max_fetch_rows == 0 {
            return Err(ProxyError::config("session.max_fetch_rows must be at least 1"));
        }
        if self.segregation.slow_slot_percentage > 100 {
            return Err(ProxyError::config("segregation.slow_slot_percentage must be within 0..=100"));
        }
        if self.lobs.max_chunk == 0 {
            return Err(ProxyError::config("lobs.max_chunk must be positive"));
        }
        Ok(())
    }

    /// Merge defaults and per-datasource overrides. Unknown names fall back to the defaults
    /// and `default_target`.
    pub fn resolve(&self, datasource: &str) -> ResolvedDatasource {
        let entry = self.datasources.get(datasource);
        let url = entry
            .and_then(|d| d.url.clone())
            .unwrap_or_else(|| self.default_target.replace("{datasource}", datasource));
        ResolvedDatasource {
            name: datasource.to_string(),
            url,
            username: entry.and_then(|d| d.username.clone()),
            password: entry.and_then(|d| d.password.clone()),
            pool: entry.map(|d| d.pool.apply(&self.defaults)).unwrap_or_else(|| self.defaults.clone()),
        }
    }

    /// Apply `proxima.`-prefixed properties. Returns the keys that were not understood.
    pub fn apply_properties<I, K, V>(&mut self, props: I) -> ProxyResult<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut unknown = Vec::new();
        for (k, v) in props {
            let (key, value) = (k.as_ref(), v.as_ref());
            let Some(rest) = key.strip_prefix("proxima.") else {
                unknown.push(key.to_string());
                continue;
            };
            let known = self.apply_one(rest, value).map_err(ProxyError::config)?;
            if !known {
                tracing::warn!(target: "proxima::config", key = key, "ignoring unknown property");
                unknown.push(key.to_string());
            }
        }
        self.validate()?;
        Ok(unknown)
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<bool, String> {
        let parse_u64 = |v: &str| v.trim().parse::<u64>().map_err(|_| format!("invalid number '{v}' for {key}"));
        if let Some(field) = key.strip_prefix("pool.") {
            return self.defaults.set(field, value);
        }
        if let Some(rest) = key.strip_prefix("datasource.") {
            let Some((name, field)) = rest.rsplit_once('.') else { return Ok(false) };
            let ds = self.datasources.entry(name.to_string()).or_default();
            match field {
                "url" => ds.url = Some(value.to_string()),
                "username" | "user" => ds.username = Some(value.to_string()),
                "password" => ds.password = Some(value.to_string()),
                _ => {
                    // route through a scratch PoolSettings so both spellings are accepted
                    let mut scratch = ds.pool.apply(&self.defaults);
                    if !scratch.set(field, value)? {
                        return Ok(false);
                    }
                    ds.pool = diff_overrides(&self.defaults, &scratch, &ds.pool);
                }
            }
            return Ok(true);
        }
        match key {
            "server.bind" => self.server.bind = value.to_string(),
            "default_target" => self.default_target = value.to_string(),
            "session.idle_timeout_ms" => self.sessions.idle_timeout_ms = parse_u64(value)?,
            "session.reap_interval_ms" => self.sessions.reap_interval_ms = parse_u64(value)?,
            "session.default_fetch_size" => self.sessions.default_fetch_size = parse_u64(value)? as usize,
            "session.max_fetch_rows" => self.sessions.max_fetch_rows = parse_u64(value)? as usize,
            "lob.inline_threshold" => self.lobs.inline_threshold = parse_u64(value)? as usize,
            "lob.max_chunk" => self.lobs.max_chunk = parse_u64(value)? as usize,
            "segregation.enabled" => self.segregation.enabled = matches!(value.trim(), "1" | "true" | "yes" | "on"),
            "segregation.slow_slot_percentage" => self.segregation.slow_slot_percentage = parse_u64(value)?.min(100) as u8,
            "segregation.slow_slot_timeout_ms" => self.segregation.slow_slot_timeout_ms = parse_u64(value)?,
            "segregation.fast_slot_timeout_ms" => self.segregation.fast_slot_timeout_ms = parse_u64(value)?,
            "segregation.idle_timeout_ms" => self.segregation.idle_timeout_ms = parse_u64(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// Keeps previous overrides and records every field where `updated` now differs from the defaults.
fn diff_overrides(base: &PoolSettings, updated: &PoolSettings, prev: &PoolOverrides) -> PoolOverrides {
    fn pick<T: PartialEq + Copy>(b: T, u: T, p: Option<T>) -> Option<T> {
        if b != u { Some(u) } else { p.filter(|v| *v == u) }
    }
    PoolOverrides {
        max_size: pick(base.max_size, updated.max_size, prev.max_size),
        min_idle: pick(base.min_idle, updated.min_idle, prev.min_idle),
        acquire_timeout_ms: pick(base.acquire_timeout_ms, updated.acquire_timeout_ms, prev.acquire_timeout_ms),
        connection_timeout_ms: pick(base.connection_timeout_ms, updated.connection_timeout_ms, prev.connection_timeout_ms),
        idle_timeout_ms: pick(base.idle_timeout_ms, updated.idle_timeout_ms, prev.idle_timeout_ms),
        max_lifetime_ms: pick(base.max_lifetime_ms, updated.max_lifetime_ms, prev.max_lifetime_ms),
        leak_timeout_ms: pick(base.leak_timeout_ms, updated.leak_timeout_ms, prev.leak_timeout_ms),
        test_on_borrow: pick(base.test_on_borrow, updated.test_on_borrow, prev.test_on_borrow),
        default_isolation: pick(base.default_isolation, updated.default_isolation, prev.default_isolation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_json_is_all_defaults() {
        let cfg: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.defaults.max_size, 20);
        assert_eq!(cfg.defaults.min_idle, 5);
        assert_eq!(cfg.defaults.idle_timeout_ms, 600_000);
        assert_eq!(cfg.defaults.max_lifetime_ms, 1_800_000);
        assert_eq!(cfg.server.bind, "127.0.0.1:1059");
        assert_eq!(cfg.sessions.default_fetch_size, 100);
        assert!(cfg.segregation.enabled);
    }

    #[test]
    fn unknown_datasource_falls_back_to_defaults() {
        let cfg = ProxyConfig::default();
        let r = cfg.resolve("reports");
        assert_eq!(r.url, "memory://reports");
        assert_eq!(r.pool, PoolSettings::default());
    }

    #[test]
    fn datasource_overrides_merge_over_defaults() {
        let json = r#"{
            "defaults": { "max_size": 8 },
            "datasources": { "billing": { "url": "memory://billing-db", "max_size": 2, "min_idle": 0 } }
        }"#;
        let cfg: ProxyConfig = serde_json::from_str(json).unwrap();
        let r = cfg.resolve("billing");
        assert_eq!(r.url, "memory://billing-db");
        assert_eq!(r.pool.max_size, 2);
        assert_eq!(r.pool.min_idle, 0);
        assert_eq!(r.pool.acquire_timeout_ms, 10_000);
        assert_eq!(cfg.resolve("other").pool.max_size, 8);
    }

    #[test]
    fn properties_accept_both_spellings() {
        let mut cfg = ProxyConfig::default();
        let unknown = cfg
            .apply_properties(vec![
                ("proxima.datasource.reports.maximumPoolSize", "3"),
                ("proxima.datasource.reports.min_idle", "1"),
                ("proxima.datasource.reports.url", "memory://r"),
                ("proxima.pool.acquireTimeout", "250"),
                ("proxima.lob.inline_threshold", "16"),
                ("proxima.session.max_fetch_rows", "500"),
                ("proxima.nonsense", "1"),
                ("other.key", "x"),
            ])
            .unwrap();
        assert_eq!(unknown, vec!["proxima.nonsense".to_string(), "other.key".to_string()]);
        let r = cfg.resolve("reports");
        assert_eq!(r.pool.max_size, 3);
        assert_eq!(r.pool.min_idle, 1);
        assert_eq!(r.pool.acquire_timeout_ms, 250);
        assert_eq!(r.url, "memory://r");
        assert_eq!(cfg.lobs.inline_threshold, 16);
        assert_eq!(cfg.sessions.max_fetch_rows, 500);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        let mut cfg = ProxyConfig::default();
        let err = cfg.apply_properties(vec![("proxima.datasource.x.min_idle", "50")]).unwrap_err();
        assert!(err.to_string().contains("min_idle"));
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "server": {{ "bind": "0.0.0.0:9000" }}, "sessions": {{ "idle_timeout_ms": 1000 }} }}"#).unwrap();
        let cfg = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.sessions.idle_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.sessions.reap_interval_ms, 5_000);
    }
}
