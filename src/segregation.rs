//! Slow-query segregation.
//!
//! Every statement execution is keyed by a hash of its normalized SQL. A per-operation moving
//! average `(avg * 4 + sample) / 5` is compared with the mean of all operation averages: at two
//! times the mean or more an operation counts as slow and must take one of the (few) slow slots,
//! everything else competes for the fast slots. Slow slots stay bounded, so a burst of reporting
//! queries cannot starve short lookups of pool capacity. A class that has been quiet for the idle
//! timeout lends its free slots to the other class, so a lopsided load still gets the whole pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::affinity::normalize;
use crate::config::SegregationSettings;
use crate::error::{ProxyError, ProxyResult};

/// Hash of the normalized statement text; literal values do not change it.
pub fn operation_hash(sql: &str) -> u64 { xxh3_64(normalize(sql).as_bytes()) }

const BORROW_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct OpRecord {
    avg_ms: f64,
    count: u64,
}

#[derive(Debug, Default)]
struct MonitorInner {
    ops: HashMap<u64, OpRecord>,
    overall_ms: f64,
    total: u64,
}

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new() -> Self { Self::default() }

    pub fn record(&self, op: u64, elapsed_ms: f64) {
        if !elapsed_ms.is_finite() || elapsed_ms < 0.0 {
            return;
        }
        let mut g = self.inner.lock();
        g.ops
            .entry(op)
            .and_modify(|r| {
                r.avg_ms = (r.avg_ms * 4.0 + elapsed_ms) / 5.0;
                r.count += 1;
            })
            .or_insert(OpRecord { avg_ms: elapsed_ms, count: 1 });
        g.total += 1;
        let sum: f64 = g.ops.values().map(|r| r.avg_ms).sum();
        g.overall_ms = sum / g.ops.len() as f64;
    }

    pub fn average(&self, op: u64) -> f64 { self.inner.lock().ops.get(&op).map(|r| r.avg_ms).unwrap_or(0.0) }

    pub fn executions(&self, op: u64) -> u64 { self.inner.lock().ops.get(&op).map(|r| r.count).unwrap_or(0) }

    pub fn overall(&self) -> f64 { self.inner.lock().overall_ms }

    pub fn is_slow(&self, op: u64) -> bool {
        let g = self.inner.lock();
        // nothing is slow until there is a meaningful baseline
        if g.overall_ms <= 1.0 {
            return false;
        }
        g.ops.get(&op).is_some_and(|r| r.avg_ms >= g.overall_ms * 2.0)
    }

    pub fn tracked(&self) -> usize { self.inner.lock().ops.len() }

    pub fn total(&self) -> u64 { self.inner.lock().total }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegregationStatus {
    pub enabled: bool,
    pub slow_slots: usize,
    pub fast_slots: usize,
    pub slow_available: usize,
    pub fast_available: usize,
    /// Slow slots currently running fast work.
    pub slow_lent: usize,
    /// Fast slots currently running slow work.
    pub fast_lent: usize,
    pub tracked_operations: usize,
    pub total_executions: u64,
    pub overall_avg_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotClass {
    Slow,
    Fast,
}

impl SlotClass {
    fn as_str(&self) -> &'static str {
        match self {
            SlotClass::Slow => "slow",
            SlotClass::Fast => "fast",
        }
    }
}

struct ClassState {
    sem: Arc<Semaphore>,
    slots: usize,
    active: AtomicUsize,
    last_used: Mutex<Option<Instant>>,
    lent: AtomicUsize,
}

impl ClassState {
    fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            sem: Arc::new(Semaphore::new(slots)),
            slots,
            active: AtomicUsize::new(0),
            last_used: Mutex::new(None),
            lent: AtomicUsize::new(0),
        })
    }

    fn mark_used(&self) { *self.last_used.lock() = Some(Instant::now()); }

    /// Nothing of this class is running and it has not run within `idle`.
    fn is_idle(&self, idle: Duration) -> bool {
        self.active.load(Ordering::SeqCst) == 0 && self.last_used.lock().map_or(true, |t| t.elapsed() >= idle)
    }
}

/// Admission to run one statement. Dropping it frees the slot, returning a borrowed slot to
/// the class it came from.
pub struct SlotPermit {
    _permit: Option<OwnedSemaphorePermit>,
    class: Option<Arc<ClassState>>,
    lender: Option<Arc<ClassState>>,
}

impl SlotPermit {
    fn unlimited() -> Self { Self { _permit: None, class: None, lender: None } }

    pub fn is_borrowed(&self) -> bool { self.lender.is_some() }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(class) = &self.class {
            class.active.fetch_sub(1, Ordering::SeqCst);
            class.mark_used();
        }
        if let Some(lender) = &self.lender {
            lender.lent.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Per-datasource slot gate in front of backend execution.
pub struct SegregationManager {
    datasource: String,
    enabled: bool,
    monitor: PerformanceMonitor,
    slow: Arc<ClassState>,
    fast: Arc<ClassState>,
    slow_timeout: Duration,
    fast_timeout: Duration,
    idle_timeout: Duration,
}

impl SegregationManager {
    pub fn new(datasource: &str, total_slots: usize, settings: &SegregationSettings) -> Self {
        let total = total_slots.max(2);
        let pct = settings.slow_slot_percentage.min(100) as usize;
        let slow_slots = (total * pct / 100).clamp(1, total - 1);
        let fast_slots = total - slow_slots;
        if settings.enabled {
            info!(
                target: "proxima::segregation",
                datasource = datasource,
                slow_slots = slow_slots,
                fast_slots = fast_slots,
                slow_timeout_ms = settings.slow_slot_timeout_ms,
                fast_timeout_ms = settings.fast_slot_timeout_ms,
                idle_timeout_ms = settings.idle_timeout_ms,
                "segregation enabled"
            );
        }
        Self {
            datasource: datasource.to_string(),
            enabled: settings.enabled,
            monitor: PerformanceMonitor::new(),
            slow: ClassState::new(slow_slots),
            fast: ClassState::new(fast_slots),
            slow_timeout: Duration::from_millis(settings.slow_slot_timeout_ms),
            fast_timeout: Duration::from_millis(settings.fast_slot_timeout_ms),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }

    pub fn monitor(&self) -> &PerformanceMonitor { &self.monitor }

    /// Wait for a slot of the class `op` currently belongs to. While the own class is full, a
    /// free slot of the other class is borrowed once that class has sat idle for the idle
    /// timeout.
    pub async fn admit(&self, op: u64) -> ProxyResult<SlotPermit> {
        if !self.enabled {
            return Ok(SlotPermit::unlimited());
        }
        let class = if self.monitor.is_slow(op) { SlotClass::Slow } else { SlotClass::Fast };
        let (own, other, wait) = match class {
            SlotClass::Slow => (&self.slow, &self.fast, self.slow_timeout),
            SlotClass::Fast => (&self.fast, &self.slow, self.fast_timeout),
        };
        let deadline = tokio::time::Instant::now() + wait;
        let acquire = own.sem.clone().acquire_owned();
        tokio::pin!(acquire);
        let mut tick = tokio::time::Instant::now();
        loop {
            tokio::select! {
                biased;
                r = &mut acquire => {
                    let permit = r.map_err(|_| ProxyError::exhausted(&self.datasource, format!("{} slots closed", class.as_str())))?;
                    own.active.fetch_add(1, Ordering::SeqCst);
                    own.mark_used();
                    debug!(target: "proxima::segregation", datasource = %self.datasource, op = op, class = class.as_str(), "slot acquired");
                    return Ok(SlotPermit { _permit: Some(permit), class: Some(own.clone()), lender: None });
                }
                _ = tokio::time::sleep_until(tick) => {}
            }
            if other.is_idle(self.idle_timeout) {
                if let Ok(permit) = other.sem.clone().try_acquire_owned() {
                    own.active.fetch_add(1, Ordering::SeqCst);
                    own.mark_used();
                    other.lent.fetch_add(1, Ordering::SeqCst);
                    debug!(target: "proxima::segregation", datasource = %self.datasource, op = op, class = class.as_str(), "slot borrowed from idle class");
                    return Ok(SlotPermit { _permit: Some(permit), class: Some(own.clone()), lender: Some(other.clone()) });
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ProxyError::exhausted(
                    &self.datasource,
                    format!("no {} slot available within {} ms", class.as_str(), wait.as_millis()),
                ));
            }
            tick = (now + BORROW_POLL).min(deadline);
        }
    }

    /// Time `fut` and feed the duration to the monitor, whether it fails or not.
    pub async fn measure<T, F>(&self, op: u64, fut: F) -> ProxyResult<T>
    where
        F: Future<Output = ProxyResult<T>>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.monitor.record(op, started.elapsed().as_secs_f64() * 1000.0);
        out
    }

    /// `admit` then `measure`, holding the slot for the duration of `fut`.
    pub async fn run<T, F>(&self, op: u64, fut: F) -> ProxyResult<T>
    where
        F: Future<Output = ProxyResult<T>>,
    {
        let _slot = self.admit(op).await?;
        self.measure(op, fut).await
    }

    pub fn status(&self) -> SegregationStatus {
        SegregationStatus {
            enabled: self.enabled,
            slow_slots: self.slow.slots,
            fast_slots: self.fast.slots,
            slow_available: self.slow.sem.available_permits(),
            fast_available: self.fast.sem.available_permits(),
            slow_lent: self.slow.lent.load(Ordering::SeqCst),
            fast_lent: self.fast.lent.load(Ordering::SeqCst),
            tracked_operations: self.monitor.tracked(),
            total_executions: self.monitor.total(),
            overall_avg_ms: self.monitor.overall(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_do_not_change_the_hash() {
        assert_eq!(operation_hash("select * from t where a = 'x'"), operation_hash("SELECT *  FROM t WHERE a = 'yy'"));
        assert_ne!(operation_hash("select 1"), operation_hash("select 2 from t"));
    }

    #[test]
    fn moving_average_weights_history() {
        let m = PerformanceMonitor::new();
        m.record(1, 100.0);
        m.record(1, 200.0);
        assert!((m.average(1) - 120.0).abs() < 1e-9);
        assert_eq!(m.executions(1), 2);
        m.record(1, -5.0);
        assert_eq!(m.total(), 2);
    }

    #[test]
    fn slow_means_twice_the_overall_mean() {
        let m = PerformanceMonitor::new();
        m.record(1, 0.5);
        m.record(2, 0.5);
        assert!(!m.is_slow(1), "tiny baseline never flags anything");
        m.record(3, 10.0);
        m.record(4, 10.0);
        m.record(5, 100.0);
        // mean of averages = 24.2
        assert!(m.is_slow(5));
        assert!(!m.is_slow(3));
        assert!(!m.is_slow(999));
    }

    fn settings(slow_pct: u8, wait_ms: u64, idle_ms: u64) -> SegregationSettings {
        SegregationSettings {
            enabled: true,
            slow_slot_percentage: slow_pct,
            slow_slot_timeout_ms: wait_ms,
            fast_slot_timeout_ms: wait_ms,
            idle_timeout_ms: idle_ms,
        }
    }

    /// Monitor state where op 7 is slow and ops 1 and 2 are fast.
    fn with_slow_op(m: &SegregationManager) {
        m.monitor().record(1, 1.0);
        m.monitor().record(2, 1.0);
        m.monitor().record(7, 50.0);
        assert!(m.monitor().is_slow(7));
        assert!(!m.monitor().is_slow(1));
    }

    #[test]
    fn slot_split_keeps_one_of_each() {
        let s = settings(20, 10, 10);
        let m = SegregationManager::new("ds", 10, &s);
        assert_eq!((m.status().slow_slots, m.status().fast_slots), (2, 8));
        let m = SegregationManager::new("ds", 1, &s);
        assert_eq!((m.status().slow_slots, m.status().fast_slots), (1, 1));
        let all = SegregationSettings { slow_slot_percentage: 100, ..s };
        let m = SegregationManager::new("ds", 4, &all);
        assert_eq!((m.status().slow_slots, m.status().fast_slots), (3, 1));
    }

    #[tokio::test]
    async fn busy_slow_slots_time_out_as_exhaustion() {
        let m = Arc::new(SegregationManager::new("ds", 2, &settings(50, 20, 60_000)));
        with_slow_op(&m);
        // recent fast work keeps the fast class from lending
        m.run(1, async { Ok(()) }).await.unwrap();

        let holder = m.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let long = tokio::spawn(async move {
            holder
                .run(7, async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = m.run(7, async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ProxyError::PoolExhausted { .. }));
        // fast work is unaffected
        assert!(m.run(1, async { Ok(()) }).await.is_ok());
        let _ = tx.send(());
        long.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unused_class_lends_its_slots() {
        let m = SegregationManager::new("ds", 2, &settings(50, 1_000, 60_000));
        let first = m.admit(1).await.unwrap();
        assert!(!first.is_borrowed());
        let second = tokio::time::timeout(Duration::from_millis(200), m.admit(1)).await.expect("borrowed promptly").unwrap();
        assert!(second.is_borrowed());
        let st = m.status();
        assert_eq!((st.slow_lent, st.slow_available, st.fast_available), (1, 0, 0));

        drop(second);
        drop(first);
        let st = m.status();
        assert_eq!((st.slow_lent, st.slow_available, st.fast_available), (0, 1, 1));
    }

    #[tokio::test]
    async fn recently_used_class_does_not_lend() {
        let m = SegregationManager::new("ds", 2, &settings(50, 30, 60_000));
        with_slow_op(&m);
        drop(m.admit(7).await.unwrap());
        let _held = m.admit(1).await.unwrap();
        let err = m.admit(1).await.err().expect("fast class is full");
        assert!(matches!(err, ProxyError::PoolExhausted { .. }));
        assert_eq!(m.status().slow_lent, 0);
    }

    #[tokio::test]
    async fn class_lends_once_it_goes_quiet() {
        let m = Arc::new(SegregationManager::new("ds", 2, &settings(50, 1_000, 40)));
        with_slow_op(&m);
        drop(m.admit(7).await.unwrap());
        let _held = m.admit(1).await.unwrap();

        let started = Instant::now();
        let borrowed = m.admit(1).await.unwrap();
        assert!(borrowed.is_borrowed());
        assert!(started.elapsed() >= Duration::from_millis(30), "waited for the slow class to go idle");
        assert_eq!(m.status().slow_lent, 1);

        // the lent slot is what a slow statement now waits for
        drop(borrowed);
        assert_eq!(m.status().slow_available, 1);
        assert!(!m.admit(7).await.unwrap().is_borrowed());
    }

    #[tokio::test]
    async fn disabled_gate_admits_everything() {
        let s = SegregationSettings { enabled: false, ..SegregationSettings::default() };
        let m = SegregationManager::new("ds", 2, &s);
        let permits: Vec<SlotPermit> = futures::future::join_all((0..10).map(|_| m.admit(1)))
            .await
            .into_iter()
            .collect::<ProxyResult<_>>()
            .unwrap();
        assert_eq!(permits.len(), 10);
        assert_eq!(m.status().fast_available, 1);
    }

    #[tokio::test]
    async fn failures_are_still_measured() {
        let s = SegregationSettings { enabled: false, ..SegregationSettings::default() };
        let m = SegregationManager::new("ds", 4, &s);
        let r: ProxyResult<()> = m.run(9, async { Err(ProxyError::Cancelled) }).await;
        assert!(r.is_err());
        assert_eq!(m.monitor().executions(9), 1);
    }
}
