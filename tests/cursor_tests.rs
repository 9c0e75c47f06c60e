//! Result cursors through the proxy: block sizes, statement reuse and handle lifetimes.

use std::sync::Arc;

use proxima::config::ProxyConfig;
use proxima::cursor::{ExecuteOutcome, WireValue};
use proxima::session::{CursorId, SessionId, SessionOption};
use proxima::value::Value;
use proxima::{DriverRegistry, Proxy, ProxyError};

fn proxy() -> Arc<Proxy> {
    let mut cfg = ProxyConfig::default();
    cfg.defaults.min_idle = 0;
    cfg.sessions.default_fetch_size = 3;
    Proxy::new(cfg, DriverRegistry::with_builtin()).expect("proxy")
}

async fn seeded(p: &Proxy, ds: &str, rows: i64) -> SessionId {
    let id = p.open_session(ds).await.unwrap();
    p.execute_sql(id, "CREATE TABLE seq (n INT, label VARCHAR(10))", vec![]).await.unwrap();
    let stmt = p.prepare(id, "INSERT INTO seq VALUES (?, ?)").await.unwrap();
    for n in 0..rows {
        p.bind(id, stmt.statement_id, 1, Value::Int(n)).await.unwrap();
        p.bind(id, stmt.statement_id, 2, Value::Text(format!("row{n}"))).await.unwrap();
        assert_eq!(p.execute(id, stmt.statement_id).await.unwrap(), ExecuteOutcome::UpdateCount { count: 1 });
    }
    p.close_statement(id, stmt.statement_id).await.unwrap();
    id
}

fn cursor_of(out: ExecuteOutcome) -> CursorId {
    match out {
        ExecuteOutcome::Cursor { cursor_id, .. } => cursor_id,
        other => panic!("expected a cursor, got {other:?}"),
    }
}

#[tokio::test]
async fn blocks_follow_the_session_fetch_size() {
    let p = proxy();
    let id = seeded(&p, "cur_blocks", 7).await;
    let c = cursor_of(p.execute_sql(id, "SELECT n FROM seq ORDER BY n", vec![]).await.unwrap());

    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    loop {
        let block = p.fetch_next(id, c, 0).await.unwrap();
        assert_eq!(block.first_row, seen.len() as u64);
        sizes.push(block.rows.len());
        for row in block.rows {
            let WireValue::Inline(Value::Int(n)) = row[0] else { panic!("int cell") };
            seen.push(n);
        }
        if !block.has_more {
            break;
        }
    }
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(seen, (0..7).collect::<Vec<_>>());

    // an explicit block size wins, and a changed session size applies to new cursors
    p.set_config(id, SessionOption::FetchSize(5)).await.unwrap();
    let c = cursor_of(p.execute_sql(id, "SELECT n FROM seq", vec![]).await.unwrap());
    assert_eq!(p.fetch_next(id, c, 0).await.unwrap().rows.len(), 5);
    assert_eq!(p.fetch_next(id, c, 1).await.unwrap().rows.len(), 1);
}

#[tokio::test]
async fn re_executing_a_statement_replaces_its_cursor() {
    let p = proxy();
    let id = seeded(&p, "cur_reexec", 4).await;
    let stmt = p.prepare(id, "SELECT label FROM seq WHERE n = ?").await.unwrap();
    p.bind(id, stmt.statement_id, 1, Value::Int(1)).await.unwrap();
    let first = cursor_of(p.execute(id, stmt.statement_id).await.unwrap());
    p.bind(id, stmt.statement_id, 1, Value::Int(2)).await.unwrap();
    let second = cursor_of(p.execute(id, stmt.statement_id).await.unwrap());

    assert!(matches!(p.fetch_next(id, first, 1).await, Err(ProxyError::StaleHandle { .. })));
    let block = p.fetch_next(id, second, 1).await.unwrap();
    assert_eq!(block.rows[0][0], WireValue::Inline(Value::Text("row2".into())));
}

#[tokio::test]
async fn closing_a_statement_closes_its_cursors() {
    let p = proxy();
    let id = seeded(&p, "cur_cascade", 10).await;
    let stmt = p.prepare(id, "SELECT n FROM seq").await.unwrap();
    let c = cursor_of(p.execute(id, stmt.statement_id).await.unwrap());
    p.fetch_next(id, c, 2).await.unwrap();
    assert_eq!(p.describe(id).await.unwrap().cursors, 1);
    assert!(p.describe(id).await.unwrap().connection.is_some(), "open cursor holds its connection");

    p.close_statement(id, stmt.statement_id).await.unwrap();
    let info = p.describe(id).await.unwrap();
    assert_eq!((info.statements, info.cursors, info.connection), (0, 0, None));
    assert!(matches!(p.fetch_next(id, c, 2).await, Err(ProxyError::StaleHandle { .. })));
    assert!(matches!(p.execute(id, stmt.statement_id).await, Err(ProxyError::StaleHandle { .. })));
}

#[tokio::test]
async fn handles_do_not_cross_sessions() {
    let p = proxy();
    let a = seeded(&p, "cur_cross", 3).await;
    let b = p.open_session("cur_cross").await.unwrap();
    let c = cursor_of(p.execute_sql(a, "SELECT n FROM seq", vec![]).await.unwrap());
    assert!(matches!(p.fetch_next(b, c, 1).await, Err(ProxyError::StaleHandle { .. })));
    assert!(matches!(p.close_cursor(b, c).await, Err(ProxyError::StaleHandle { .. })));
    p.close_cursor(a, c).await.unwrap();
}

#[tokio::test]
async fn wrong_parameter_count_is_refused_before_execution() {
    let p = proxy();
    let id = seeded(&p, "cur_params", 1).await;
    let err = p.execute_sql(id, "SELECT n FROM seq WHERE n = ?", vec![]).await.unwrap_err();
    assert!(matches!(err, ProxyError::Protocol { .. }));
    assert_eq!(err.sqlstate(), Some("HY010"));
    assert!(p.describe(id).await.unwrap().connection.is_none());
}

#[tokio::test]
async fn cancel_interrupts_a_slow_statement() {
    let p = proxy();
    let id = p.open_session("cur_cancel").await.unwrap();
    let runner = {
        let p = p.clone();
        tokio::spawn(async move { p.execute_sql(id, "SELECT SLEEP(5000)", vec![]).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    p.cancel(id).unwrap();
    let out = runner.await.unwrap();
    assert!(matches!(out, Err(ProxyError::Cancelled)), "{out:?}");

    // the session stays usable after the cancelled call
    let c = cursor_of(p.execute_sql(id, "SELECT 1", vec![]).await.unwrap());
    assert_eq!(p.fetch_next(id, c, 1).await.unwrap().rows[0][0], WireValue::Inline(Value::Int(1)));
}

#[tokio::test]
async fn oversized_blocks_are_capped() {
    let mut cfg = ProxyConfig::default();
    cfg.defaults.min_idle = 0;
    cfg.sessions.max_fetch_rows = 4;
    let p = Proxy::new(cfg, DriverRegistry::with_builtin()).expect("proxy");
    let id = seeded(&p, "cur_cap", 10).await;

    // the session fetch size is held to the cap as well
    let conf = p.set_config(id, SessionOption::FetchSize(1_000)).await.unwrap();
    assert_eq!(conf.fetch_size, 4);

    let c = cursor_of(p.execute_sql(id, "SELECT n FROM seq ORDER BY n", vec![]).await.unwrap());
    let first = p.fetch_next(id, c, usize::MAX).await.unwrap();
    assert_eq!((first.first_row, first.rows.len(), first.has_more), (0, 4, true));
    let second = p.fetch_next(id, c, 0).await.unwrap();
    assert_eq!((second.first_row, second.rows.len(), second.has_more), (4, 4, true));
    let last = p.fetch_next(id, c, 100).await.unwrap();
    assert_eq!((last.first_row, last.rows.len(), last.has_more), (8, 2, false));
    assert_eq!(last.rows[1][0], WireValue::Inline(Value::Int(9)));
}
