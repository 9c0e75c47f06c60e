//! Large values in both directions through the proxy: chunked writes bound as parameters and
//! chunked reads of values too large to inline.

use std::sync::Arc;

use proxima::config::ProxyConfig;
use proxima::cursor::{ExecuteOutcome, WireValue};
use proxima::session::{SessionId, StreamId};
use proxima::value::{LobKind, Value};
use proxima::{DriverRegistry, Proxy, ProxyError};

fn proxy(inline_threshold: usize, max_chunk: usize) -> Arc<Proxy> {
    let mut cfg = ProxyConfig::default();
    cfg.defaults.min_idle = 0;
    cfg.lobs.inline_threshold = inline_threshold;
    cfg.lobs.max_chunk = max_chunk;
    Proxy::new(cfg, DriverRegistry::with_builtin()).expect("proxy")
}

async fn drain(p: &Proxy, id: SessionId, stream: StreamId, ask: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = p.read_chunk(id, stream, ask).await.unwrap();
        out.extend_from_slice(&chunk.bytes);
        if chunk.eof {
            return out;
        }
    }
}

#[tokio::test]
async fn blob_written_in_chunks_reads_back_identically() {
    let p = proxy(256, 1024);
    let id = p.open_session("lob_blob").await.unwrap();
    p.execute_sql(id, "CREATE TABLE docs (id INT, body BLOB)", vec![]).await.unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let stmt = p.prepare(id, "INSERT INTO docs VALUES (?, ?)").await.unwrap();
    assert_eq!(stmt.param_count, 2);
    p.bind(id, stmt.statement_id, 1, Value::Int(42)).await.unwrap();
    let w = p.open_write(id, stmt.statement_id, 2, LobKind::Binary).await.unwrap();
    let mut written = 0;
    for chunk in payload.chunks(1000) {
        written = p.write_chunk(id, w, chunk).await.unwrap();
    }
    assert_eq!(written, 10_000);
    assert_eq!(p.close_write(id, w).await.unwrap(), Some(10_000));
    p.execute(id, stmt.statement_id).await.unwrap();

    let ExecuteOutcome::Cursor { cursor_id, columns } = p.execute_sql(id, "SELECT body FROM docs WHERE id = 42", vec![]).await.unwrap()
    else {
        panic!("rows")
    };
    assert!(columns[0].large);
    let block = p.fetch_next(id, cursor_id, 0).await.unwrap();
    assert_eq!(block.rows[0][0], WireValue::Stream { kind: LobKind::Binary, length: Some(10_000) });

    let opened = p.open_read(id, cursor_id, block.first_row, 0).await.unwrap();
    assert_eq!(opened.length, Some(10_000));
    assert!(!opened.null);
    // asking for more than the chunk limit is clamped, not refused
    assert_eq!(drain(&p, id, opened.stream_id, 4096).await, payload);
}

#[tokio::test]
async fn long_text_is_streamed_and_short_text_is_inline() {
    let p = proxy(32, 16);
    let id = p.open_session("lob_text").await.unwrap();
    p.execute_sql(id, "CREATE TABLE notes (id INT, body TEXT)", vec![]).await.unwrap();
    let long = "lorem ipsum dolor sit amet ".repeat(10);
    p.execute_sql(id, "INSERT INTO notes VALUES (?, ?)", vec![Value::Int(1), Value::Text("short".into())]).await.unwrap();
    p.execute_sql(id, "INSERT INTO notes VALUES (?, ?)", vec![Value::Int(2), Value::Text(long.clone())]).await.unwrap();

    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(id, "SELECT body FROM notes ORDER BY id", vec![]).await.unwrap() else {
        panic!("rows")
    };
    let block = p.fetch_next(id, cursor_id, 2).await.unwrap();
    assert_eq!(block.rows[0][0], WireValue::Inline(Value::Text("short".into())));
    assert_eq!(block.rows[1][0], WireValue::Stream { kind: LobKind::Character, length: Some(long.len() as u64) });

    let opened = p.open_read(id, cursor_id, 1, 0).await.unwrap();
    assert_eq!(opened.kind, LobKind::Character);
    let back = drain(&p, id, opened.stream_id, 16).await;
    assert_eq!(String::from_utf8(back).unwrap(), long);
}

#[tokio::test]
async fn streams_die_with_their_session() {
    let p = proxy(8, 64);
    let id = p.open_session("lob_close").await.unwrap();
    let stmt = p.prepare(id, "SELECT ?").await.unwrap();
    let w = p.open_write(id, stmt.statement_id, 1, LobKind::Binary).await.unwrap();
    p.write_chunk(id, w, b"partial").await.unwrap();
    assert!(p.describe(id).await.unwrap().connection.is_some(), "write stream holds the connection");
    p.close_session(id).await.unwrap();
    assert!(matches!(p.write_chunk(id, w, b"more").await, Err(ProxyError::StaleHandle { .. })));
    assert_eq!(p.pool_report("lob_close").unwrap().stats.in_use, 0);
}

#[tokio::test]
async fn null_large_column_reads_as_null_stream() {
    let p = proxy(8, 64);
    let id = p.open_session("lob_null").await.unwrap();
    p.execute_sql(id, "CREATE TABLE maybe (id INT, data BLOB)", vec![]).await.unwrap();
    p.execute_sql(id, "INSERT INTO maybe VALUES (1, NULL)", vec![]).await.unwrap();
    let ExecuteOutcome::Cursor { cursor_id, .. } = p.execute_sql(id, "SELECT data FROM maybe", vec![]).await.unwrap() else {
        panic!("rows")
    };
    let block = p.fetch_next(id, cursor_id, 1).await.unwrap();
    assert_eq!(block.rows[0][0], WireValue::Inline(Value::Null));
    let opened = p.open_read(id, cursor_id, 0, 0).await.unwrap();
    assert!(opened.null);
    let chunk = p.read_chunk(id, opened.stream_id, 10).await.unwrap();
    assert!(chunk.null && chunk.eof && chunk.bytes.is_empty());
}
