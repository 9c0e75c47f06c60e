//! Session affinity end to end: which statements keep a session on its connection, and what a
//! floating session can and cannot rely on.

use std::sync::Arc;

use proxima::affinity::{AffinityState, PinReason};
use proxima::config::{PatternConfig, ProxyConfig};
use proxima::cursor::{ExecuteOutcome, WireValue};
use proxima::value::Value;
use proxima::{DriverRegistry, Proxy, ProxyError, SessionId};

fn proxy_with(f: impl FnOnce(&mut ProxyConfig)) -> Arc<Proxy> {
    let mut cfg = ProxyConfig::default();
    cfg.defaults.min_idle = 0;
    f(&mut cfg);
    Proxy::new(cfg, DriverRegistry::with_builtin()).expect("proxy")
}

async fn run(p: &Proxy, id: SessionId, sql: &str) {
    if let Err(e) = p.execute_sql(id, sql, vec![]).await {
        panic!("SQL failed: {} => {}", sql, e);
    }
}

async fn single(p: &Proxy, id: SessionId, sql: &str) -> Value {
    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(id, sql, vec![]).await.expect(sql) else {
        panic!("expected rows from {sql}")
    };
    let block = p.fetch_next(id, cursor_id, 10).await.expect("fetch");
    match &block.rows[0][0] {
        WireValue::Inline(v) => v.clone(),
        other => panic!("unexpected cell {other:?}"),
    }
}

#[tokio::test]
async fn temp_table_keeps_the_same_connection() {
    let p = proxy_with(|_| {});
    let a = p.open_session("aff_temp").await.unwrap();
    let b = p.open_session("aff_temp").await.unwrap();

    run(&p, a, "CREATE TEMPORARY TABLE scratch (id INT, name VARCHAR(20))").await;
    run(&p, a, "INSERT INTO scratch VALUES (1, 'x'), (2, 'y')").await;
    let info = p.describe(a).await.unwrap();
    assert_eq!(info.affinity, AffinityState::Pinned);
    assert!(info.pin_reasons.contains(&PinReason::TemporaryTable));
    let pinned_to = info.connection.expect("pinned session holds a connection");

    // other traffic on the pool must not steal or disturb it
    run(&p, b, "CREATE TABLE shared (id INT)").await;
    run(&p, b, "INSERT INTO shared VALUES (1)").await;
    assert_eq!(single(&p, a, "SELECT COUNT(*) FROM scratch").await, Value::Int(2));
    assert_eq!(p.describe(a).await.unwrap().connection, Some(pinned_to));
    assert_ne!(p.describe(b).await.unwrap().connection, Some(pinned_to));
}

#[tokio::test]
async fn floating_session_holds_nothing_between_calls() {
    let p = proxy_with(|_| {});
    let a = p.open_session("aff_float").await.unwrap();
    run(&p, a, "CREATE TABLE items (id INT)").await;
    run(&p, a, "INSERT INTO items VALUES (1), (2), (3)").await;
    assert_eq!(single(&p, a, "SELECT COUNT(*) FROM items").await, Value::Int(3));

    let info = p.describe(a).await.unwrap();
    assert_eq!(info.affinity, AffinityState::Floating);
    assert_eq!(info.connection, None);
    let stats = p.pool_report("aff_float").unwrap().stats;
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn session_variables_survive_other_traffic() {
    let p = proxy_with(|_| {});
    let a = p.open_session("aff_vars").await.unwrap();
    let others: Vec<SessionId> = futures::future::join_all((0..3).map(|_| p.open_session("aff_vars")))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    run(&p, a, "SET @who = 'alice'").await;
    for o in &others {
        run(&p, *o, "SET @who = 'mallory'").await;
        p.unpin(*o).await.unwrap();
    }
    assert_eq!(single(&p, a, "SELECT @who").await, Value::Text("alice".into()));
    assert!(p.describe(a).await.unwrap().pin_reasons.contains(&PinReason::SessionVariable));
}

#[tokio::test]
async fn unpinned_session_loses_its_connection_state() {
    let p = proxy_with(|_| {});
    let a = p.open_session("aff_unpin").await.unwrap();
    run(&p, a, "CREATE TEMP TABLE t (n INT)").await;
    p.unpin(a).await.unwrap();
    assert_eq!(p.describe(a).await.unwrap().connection, None);

    // the released connection was reset, so the temp table is gone wherever we land
    let err = p.execute_sql(a, "SELECT * FROM t", vec![]).await.unwrap_err();
    let ProxyError::Backend { error } = err else { panic!("expected backend error") };
    assert_eq!(error.sqlstate.as_deref(), Some("42P01"));
}

#[tokio::test]
async fn configured_patterns_pin_too() {
    let p = proxy_with(|cfg| {
        cfg.affinity.extra_patterns.push(PatternConfig {
            name: "sleepers".into(),
            pattern: r"^SELECT\s+SLEEP\b".into(),
            reason: PinReason::SessionLock,
        });
    });
    let a = p.open_session("aff_extra").await.unwrap();
    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(a, "select sleep(1)", vec![]).await.unwrap() else {
        panic!("expected rows")
    };
    p.close_cursor(a, cursor_id).await.unwrap();
    let info = p.describe(a).await.unwrap();
    assert_eq!(info.pin_reasons, vec![PinReason::SessionLock]);
    assert!(info.connection.is_some());
}

#[tokio::test]
async fn raw_commit_ends_a_raw_transaction() {
    let p = proxy_with(|_| {});
    let a = p.open_session("aff_raw_tx").await.unwrap();
    run(&p, a, "CREATE TABLE ledger (n INT)").await;
    run(&p, a, "BEGIN").await;
    run(&p, a, "INSERT INTO ledger VALUES (1)").await;
    assert!(p.describe(a).await.unwrap().pin_reasons.contains(&PinReason::LocalTransaction));
    run(&p, a, "COMMIT").await;
    let info = p.describe(a).await.unwrap();
    assert_eq!(info.affinity, AffinityState::Floating);
    assert_eq!(info.connection, None);
}
