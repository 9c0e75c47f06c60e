//! Pool sizing, exhaustion and connection hygiene as seen through sessions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proxima::backend::IsolationLevel;
use proxima::config::ProxyConfig;
use proxima::cursor::ExecuteOutcome;
use proxima::session::SessionOption;
use proxima::{DriverRegistry, Proxy, ProxyError, SessionId};

fn proxy_with(f: impl FnOnce(&mut ProxyConfig)) -> Arc<Proxy> {
    let mut cfg = ProxyConfig::default();
    cfg.defaults.min_idle = 0;
    f(&mut cfg);
    Proxy::new(cfg, DriverRegistry::with_builtin()).expect("proxy")
}

async fn sleep_through(p: &Proxy, id: SessionId, ms: u64) -> Result<(), ProxyError> {
    let out = p.execute_sql(id, &format!("SELECT SLEEP({ms})"), vec![]).await?;
    let ExecuteOutcome::Cursor { cursor_id, .. } = out else { panic!("sleep returns a row") };
    let block = p.fetch_next(id, cursor_id, 0).await?;
    assert!(!block.has_more);
    Ok(())
}

/// Three sessions sleep at once against a pool of two; returns the wall time taken.
async fn three_sleepers_on_two_connections(p: &Arc<Proxy>, ds: &str) -> Duration {
    let ids: Vec<SessionId> = futures::future::join_all((0..3).map(|_| p.open_session(ds)))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let (p, done, peak, ds) = (p.clone(), done.clone(), peak.clone(), ds.to_string());
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                if let Ok(report) = p.pool_report(&ds) {
                    peak.fetch_max(report.stats.in_use, Ordering::SeqCst);
                    assert!(report.stats.live <= 2, "live {} over max", report.stats.live);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let started = Instant::now();
    let results = futures::future::join_all(ids.iter().map(|id| sleep_through(p, *id, 150))).await;
    let elapsed = started.elapsed();
    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();
    for r in results {
        r.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    let stats = p.pool_report(ds).unwrap().stats;
    assert!(stats.created <= 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.timeouts, 0);
    elapsed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_exceed_max_size() {
    let p = proxy_with(|cfg| {
        cfg.defaults.max_size = 2;
        cfg.defaults.acquire_timeout_ms = 5_000;
        cfg.segregation.enabled = false;
    });
    // the third session had to wait for a connection to come back
    assert!(three_sleepers_on_two_connections(&p, "pool_bound").await >= Duration::from_millis(300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_size_holds_with_default_segregation() {
    let p = proxy_with(|cfg| {
        cfg.defaults.max_size = 2;
        cfg.defaults.acquire_timeout_ms = 5_000;
    });
    assert!(p.config().segregation.enabled);
    let elapsed = three_sleepers_on_two_connections(&p, "pool_bound_seg").await;
    assert!(elapsed >= Duration::from_millis(300));
    // two rounds of 150 ms, not three
    assert!(elapsed < Duration::from_millis(440), "took {elapsed:?}");
    let seg = p.pool_report("pool_bound_seg").unwrap().segregation;
    assert_eq!((seg.slow_lent, seg.fast_lent), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_connections_work_in_parallel_under_segregation() {
    let p = proxy_with(|cfg| {
        cfg.defaults.max_size = 2;
        cfg.defaults.acquire_timeout_ms = 5_000;
    });
    let a = p.open_session("pool_parallel").await.unwrap();
    let b = p.open_session("pool_parallel").await.unwrap();
    let started = Instant::now();
    let (ra, rb) = tokio::join!(sleep_through(&p, a, 300), sleep_through(&p, b, 300));
    ra.unwrap();
    rb.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(550), "statements ran one after the other: {elapsed:?}");
}

#[tokio::test]
async fn exhausted_pool_reports_and_recovers() {
    let p = proxy_with(|cfg| {
        cfg.defaults.max_size = 1;
        cfg.defaults.acquire_timeout_ms = 100;
    });
    let holder = p.open_session("pool_tight").await.unwrap();
    let waiter = p.open_session("pool_tight").await.unwrap();
    p.execute_sql(holder, "CREATE TEMPORARY TABLE mine (n INT)", vec![]).await.unwrap();

    let err = p.execute_sql(waiter, "SELECT 1", vec![]).await.unwrap_err();
    assert!(matches!(err, ProxyError::PoolExhausted { .. }), "{err:?}");
    assert_eq!(err.sqlstate(), Some("08004"));
    assert_eq!(p.pool_report("pool_tight").unwrap().stats.timeouts, 1);

    p.close_session(holder).await.unwrap();
    assert!(p.execute_sql(waiter, "SELECT 1", vec![]).await.is_ok());
}

#[tokio::test]
async fn idle_connections_carry_pool_defaults() {
    let p = proxy_with(|_| {});
    let a = p.open_session("pool_hygiene").await.unwrap();
    p.set_config(a, SessionOption::Isolation(IsolationLevel::Serializable)).await.unwrap();
    p.set_config(a, SessionOption::ReadOnly(true)).await.unwrap();
    p.execute_sql(a, "SET @leftover = 1", vec![]).await.unwrap();
    p.close_session(a).await.unwrap();

    let report = p.pool_report("pool_hygiene").unwrap();
    assert!(!report.idle.is_empty());
    for idle in &report.idle {
        assert_eq!(idle.isolation, IsolationLevel::ReadCommitted);
        assert!(idle.autocommit);
    }

    // the variable went with the reset
    let b = p.open_session("pool_hygiene").await.unwrap();
    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(b, "SELECT @leftover", vec![]).await.unwrap() else {
        panic!("rows")
    };
    let block = p.fetch_next(b, cursor_id, 1).await.unwrap();
    assert_eq!(block.rows[0][0], proxima::cursor::WireValue::Inline(proxima::value::Value::Null));
}

/// Close a session while its statement is still running on a connection it holds.
async fn close_mid_statement(p: &Arc<Proxy>, ds: &str) {
    let a = p.open_session(ds).await.unwrap();
    p.set_config(a, SessionOption::Isolation(IsolationLevel::Serializable)).await.unwrap();
    p.execute_sql(a, "SET @leftover = 1", vec![]).await.unwrap();
    let runner = {
        let p = p.clone();
        tokio::spawn(async move { p.execute_sql(a, "SELECT SLEEP(5000)", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(1), p.close_session(a)).await.expect("close waited out the sleep").unwrap();
    let out = tokio::time::timeout(Duration::from_secs(1), runner).await.expect("statement kept running").unwrap();
    assert!(matches!(out, Err(ProxyError::Cancelled)), "{out:?}");
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(matches!(p.describe(a).await, Err(ProxyError::StaleHandle { .. })));

    let report = p.pool_report(ds).unwrap();
    assert_eq!(report.stats.in_use, 0);
    // the interrupted connection is either reset for reuse or gone
    assert_eq!(report.stats.idle + report.stats.discarded as usize, 1);
    for idle in &report.idle {
        assert_eq!(idle.isolation, IsolationLevel::ReadCommitted);
        assert!(idle.autocommit);
    }

    let b = p.open_session(ds).await.unwrap();
    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(b, "SELECT @leftover", vec![]).await.unwrap() else {
        panic!("rows")
    };
    let block = p.fetch_next(b, cursor_id, 1).await.unwrap();
    assert_eq!(block.rows[0][0], proxima::cursor::WireValue::Inline(proxima::value::Value::Null));
    sleep_through(p, b, 10).await.unwrap();
    p.close_session(b).await.unwrap();
}

#[tokio::test]
async fn closing_a_session_interrupts_its_running_statement() {
    let p = proxy_with(|cfg| cfg.segregation.enabled = false);
    close_mid_statement(&p, "pool_close_mid").await;
}

#[tokio::test]
async fn closing_mid_statement_frees_the_execution_slot() {
    let p = proxy_with(|cfg| {
        cfg.defaults.max_size = 2;
        cfg.defaults.acquire_timeout_ms = 2_000;
    });
    assert!(p.config().segregation.enabled);
    close_mid_statement(&p, "pool_close_mid_seg").await;
    let seg = p.pool_report("pool_close_mid_seg").unwrap().segregation;
    assert_eq!((seg.slow_lent, seg.fast_lent), (0, 0));
}

#[tokio::test]
async fn unknown_pool_has_no_report() {
    let p = proxy_with(|_| {});
    assert!(matches!(p.pool_report("never_opened"), Err(ProxyError::Config { .. })));
    p.open_session("now_opened").await.unwrap();
    let stats = p.pool_stats();
    assert!(stats.iter().any(|s| s.datasource == "now_opened"));
}

#[tokio::test]
async fn shutdown_refuses_new_sessions() {
    let p = proxy_with(|_| {});
    let a = p.open_session("pool_stop").await.unwrap();
    p.execute_sql(a, "CREATE TEMP TABLE t (n INT)", vec![]).await.unwrap();
    p.shutdown().await;
    assert!(matches!(p.describe(a).await, Err(ProxyError::StaleHandle { .. })));
    assert!(matches!(p.open_session("pool_stop").await, Err(ProxyError::PoolExhausted { .. })));
}
