//! Chunked large-object transfer.
//!
//! Read streams are opened on a large cell of a cursor's most recent block; write streams fill one
//! statement parameter. Chunks are capped at `max_chunk` so server memory stays bounded no matter
//! how big the value is. A write stream that is closed without ever receiving a chunk binds SQL
//! NULL; one that received a single empty chunk binds an empty value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LobSettings;
use crate::cursor::Retained;
use crate::error::{HandleKind, ProxyError, ProxyResult};
use crate::pool::PoolManager;
use crate::session::{guarded, interrupted, CursorId, Session, StatementId, StreamId};
use crate::value::{b64, LobKind, LobLocator, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOwner {
    Cursor(CursorId),
    Parameter { statement: StatementId, index: usize },
}

enum Source {
    Buffered(Arc<[u8]>),
    Backend(LobLocator),
    Null,
}

enum Direction {
    Read(Source),
    Write { lob: LobLocator, chunks: u64 },
}

pub struct LobStream {
    pub(crate) owner: StreamOwner,
    kind: LobKind,
    direction: Direction,
    position: u64,
    length: Option<u64>,
}

impl LobStream {
    pub(crate) fn needs_connection(&self) -> bool {
        matches!(self.direction, Direction::Read(Source::Backend(_)) | Direction::Write { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOpened {
    pub stream_id: StreamId,
    pub kind: LobKind,
    pub length: Option<u64>,
    pub null: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
    pub eof: bool,
    pub null: bool,
}

pub struct LobManager {
    pools: Arc<PoolManager>,
    settings: LobSettings,
}

impl LobManager {
    pub fn new(pools: Arc<PoolManager>, settings: LobSettings) -> Self { Self { pools, settings } }

    pub fn max_chunk(&self) -> usize { self.settings.max_chunk }

    /// `row` is the absolute row position reported in the fetch block, `column` is 0-based.
    pub async fn open_read(&self, s: &mut Session, token: &CancellationToken, cursor_id: CursorId, row: u64, column: usize) -> ProxyResult<ReadOpened> {
        let cur = s.cursors.get(&cursor_id).ok_or_else(|| ProxyError::stale(HandleKind::Cursor, cursor_id))?;
        let retained = cur.retained(row, column).cloned().ok_or_else(|| {
            ProxyError::protocol(format!("no large value at row {row} column {column} of the current block of cursor {cursor_id}"))
        })?;
        let (kind, source, length) = match retained {
            Retained::Bytes { data, kind } => {
                let len = data.len() as u64;
                (kind, Source::Buffered(data), Some(len))
            }
            Retained::Locator { lob, length } => {
                // the backend cursor may be gone already; locators stay valid on any connection
                s.ensure_connection(&self.pools, token).await?;
                (lob.kind, Source::Backend(lob), length)
            }
            Retained::Null { kind } => (kind, Source::Null, None),
        };
        let null = matches!(source, Source::Null);
        let id = StreamId::new();
        s.streams.insert(
            id,
            LobStream { owner: StreamOwner::Cursor(cursor_id), kind, direction: Direction::Read(source), position: 0, length },
        );
        debug!(target: "proxima::lob", session = %s.id, stream = %id, cursor = %cursor_id, row = row, column = column, "read stream opened");
        Ok(ReadOpened { stream_id: id, kind, length, null })
    }

    pub async fn read_chunk(&self, s: &mut Session, token: &CancellationToken, stream_id: StreamId, max_bytes: usize) -> ProxyResult<Chunk> {
        let limit = s.config.network_timeout();
        let max = max_bytes.clamp(1, self.settings.max_chunk);
        let st = s.streams.get_mut(&stream_id).ok_or_else(|| ProxyError::stale(HandleKind::Stream, stream_id))?;
        let Direction::Read(source) = &st.direction else {
            return Err(ProxyError::protocol(format!("stream {stream_id} is a write stream")));
        };
        let chunk = match source {
            Source::Null => Chunk { bytes: Vec::new(), eof: true, null: true },
            Source::Buffered(data) => {
                let start = (st.position as usize).min(data.len());
                let end = start.saturating_add(max).min(data.len());
                let bytes = data[start..end].to_vec();
                Chunk { eof: end >= data.len(), bytes, null: false }
            }
            Source::Backend(lob) => {
                let lob = *lob;
                let Some(conn) = s.conn.as_mut() else {
                    return Err(ProxyError::internal("read stream lost its connection"));
                };
                match guarded(token, limit, conn.backend().read_lob(&lob, st.position, max)).await {
                    Ok(bytes) => {
                        let end = st.position + bytes.len() as u64;
                        let eof = bytes.len() < max || st.length.is_some_and(|l| end >= l);
                        Chunk { bytes, eof, null: false }
                    }
                    Err(e) => {
                        if interrupted(&e) {
                            conn.state.interrupted = true;
                        }
                        s.streams.remove(&stream_id);
                        debug!(target: "proxima::lob", stream = %stream_id, error = %e, "read stream abandoned");
                        s.settle(&self.pools).await;
                        return Err(e);
                    }
                }
            }
        };
        st.position += chunk.bytes.len() as u64;
        if chunk.eof {
            let (kind, total) = (st.kind, st.position);
            s.streams.remove(&stream_id);
            debug!(target: "proxima::lob", stream = %stream_id, kind = ?kind, bytes = total, "read stream consumed");
            s.settle(&self.pools).await;
        }
        Ok(chunk)
    }

    /// `index` is the 1-based statement parameter the stream fills.
    pub async fn open_write(&self, s: &mut Session, token: &CancellationToken, statement_id: StatementId, index: usize, kind: LobKind) -> ProxyResult<StreamId> {
        let stmt = s.statements.get(&statement_id).ok_or_else(|| ProxyError::stale(HandleKind::Statement, statement_id))?;
        stmt.check_index(index)?;
        if stmt.open_writes.contains_key(&index) {
            return Err(ProxyError::protocol(format!("parameter {index} already has an open write stream")));
        }
        s.ensure_connection(&self.pools, token).await?;
        let limit = s.config.network_timeout();
        let conn = s.connection()?;
        let lob = match guarded(token, limit, conn.backend().create_lob(kind)).await {
            Ok(lob) => lob,
            Err(e) => {
                if interrupted(&e) {
                    conn.state.interrupted = true;
                }
                s.settle(&self.pools).await;
                return Err(e);
            }
        };
        let id = StreamId::new();
        if let Some(stmt) = s.statements.get_mut(&statement_id) {
            stmt.open_writes.insert(index, id);
            stmt.params[index - 1] = None;
        }
        s.streams.insert(
            id,
            LobStream {
                owner: StreamOwner::Parameter { statement: statement_id, index },
                kind,
                direction: Direction::Write { lob, chunks: 0 },
                position: 0,
                length: None,
            },
        );
        debug!(target: "proxima::lob", session = %s.id, stream = %id, statement = %statement_id, index = index, "write stream opened");
        Ok(id)
    }

    pub async fn write_chunk(&self, s: &mut Session, token: &CancellationToken, stream_id: StreamId, bytes: &[u8]) -> ProxyResult<u64> {
        if bytes.len() > self.settings.max_chunk {
            return Err(ProxyError::protocol(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.settings.max_chunk
            )));
        }
        let limit = s.config.network_timeout();
        let st = s.streams.get_mut(&stream_id).ok_or_else(|| ProxyError::stale(HandleKind::Stream, stream_id))?;
        let Direction::Write { lob, chunks } = &mut st.direction else {
            return Err(ProxyError::protocol(format!("stream {stream_id} is a read stream")));
        };
        if !bytes.is_empty() {
            let Some(conn) = s.conn.as_mut() else {
                return Err(ProxyError::internal("write stream lost its connection"));
            };
            if let Err(e) = guarded(token, limit, conn.backend().write_lob(lob, st.position, bytes)).await {
                if interrupted(&e) {
                    conn.state.interrupted = true;
                }
                self.drop_write(s, stream_id);
                s.settle(&self.pools).await;
                return Err(e);
            }
        }
        *chunks += 1;
        st.position += bytes.len() as u64;
        Ok(st.position)
    }

    /// Bind the written value to its parameter. `None` means zero chunks were written and the
    /// parameter is NULL.
    pub async fn close_write(&self, s: &mut Session, stream_id: StreamId) -> ProxyResult<Option<u64>> {
        let st = s.streams.get(&stream_id).ok_or_else(|| ProxyError::stale(HandleKind::Stream, stream_id))?;
        let Direction::Write { lob, chunks } = st.direction else {
            return Err(ProxyError::protocol(format!("stream {stream_id} is a read stream")));
        };
        let (committed, value) = if chunks == 0 { (None, Value::Null) } else { (Some(st.position), Value::Lob(lob)) };
        let StreamOwner::Parameter { statement, index } = st.owner else {
            return Err(ProxyError::internal("write stream without a parameter"));
        };
        s.streams.remove(&stream_id);
        if let Some(stmt) = s.statements.get_mut(&statement) {
            stmt.open_writes.remove(&index);
            stmt.params[index - 1] = Some(value);
        }
        debug!(target: "proxima::lob", stream = %stream_id, length = ?committed, "write stream closed");
        s.settle(&self.pools).await;
        Ok(committed)
    }

    pub async fn abandon(&self, s: &mut Session, stream_id: StreamId) -> ProxyResult<()> {
        let Some(st) = s.streams.get(&stream_id) else {
            return Err(ProxyError::stale(HandleKind::Stream, stream_id));
        };
        if matches!(st.direction, Direction::Write { .. }) {
            self.drop_write(s, stream_id);
        } else {
            s.streams.remove(&stream_id);
        }
        debug!(target: "proxima::lob", stream = %stream_id, "stream abandoned");
        s.settle(&self.pools).await;
        Ok(())
    }

    fn drop_write(&self, s: &mut Session, stream_id: StreamId) {
        if let Some(st) = s.streams.remove(&stream_id) {
            if let StreamOwner::Parameter { statement, index } = st.owner {
                if let Some(stmt) = s.statements.get_mut(&statement) {
                    stmt.open_writes.remove(&index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::AffinityDetector;
    use crate::backend::DriverRegistry;
    use crate::config::ProxyConfig;
    use crate::cursor::{CursorEngine, ExecuteOutcome, WireValue};
    use crate::session::{SessionConfig, SessionRegistry};

    struct Rig {
        cursors: CursorEngine,
        lobs: LobManager,
        registry: SessionRegistry,
    }

    fn rig() -> Rig {
        let mut cfg = ProxyConfig::default();
        cfg.lobs.inline_threshold = 64;
        cfg.lobs.max_chunk = 100;
        let cfg = Arc::new(cfg);
        let pools = Arc::new(PoolManager::new(cfg.clone(), DriverRegistry::with_builtin()));
        Rig {
            cursors: CursorEngine::new(pools.clone(), Arc::new(AffinityDetector::new()), cfg.lobs.clone()),
            lobs: LobManager::new(pools, cfg.lobs.clone()),
            registry: SessionRegistry::new(),
        }
    }

    #[tokio::test]
    async fn chunked_write_then_read_returns_the_same_bytes() {
        let rig = rig();
        let id = rig.registry.open("lob_unit", SessionConfig::from_config(&ProxyConfig::default(), "lob_unit"));
        let mut call = rig.registry.begin_call(id).await.unwrap();
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        rig.cursors.execute_sql(s, &token, "CREATE TABLE blobs (id INT, data BLOB)", vec![]).await.unwrap();

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let p = rig.cursors.prepare(s, "INSERT INTO blobs VALUES (?, ?)");
        rig.cursors.bind(s, p.statement_id, 1, Value::Int(1)).unwrap();
        let w = rig.lobs.open_write(s, &token, p.statement_id, 2, LobKind::Binary).await.unwrap();
        assert!(matches!(rig.cursors.execute(s, &token, p.statement_id).await, Err(ProxyError::Protocol { .. })));
        for chunk in payload.chunks(70) {
            rig.lobs.write_chunk(s, &token, w, chunk).await.unwrap();
        }
        assert_eq!(rig.lobs.close_write(s, w).await.unwrap(), Some(1000));
        rig.cursors.execute(s, &token, p.statement_id).await.unwrap();

        let ExecuteOutcome::Cursor { cursor_id, .. } =
            rig.cursors.execute_sql(s, &token, "SELECT data FROM blobs WHERE id = 1", vec![]).await.unwrap()
        else {
            panic!("rows")
        };
        let block = rig.cursors.fetch_next(s, &token, cursor_id, 10).await.unwrap();
        assert_eq!(block.rows[0][0], WireValue::Stream { kind: LobKind::Binary, length: Some(1000) });
        let r = rig.lobs.open_read(s, &token, cursor_id, block.first_row, 0).await.unwrap();
        let mut back = Vec::new();
        loop {
            let c = rig.lobs.read_chunk(s, &token, r.stream_id, 4096).await.unwrap();
            assert!(c.bytes.len() <= 100);
            back.extend_from_slice(&c.bytes);
            if c.eof {
                break;
            }
        }
        assert_eq!(back, payload);
        assert!(matches!(rig.lobs.read_chunk(s, &token, r.stream_id, 10).await, Err(ProxyError::StaleHandle { .. })));
    }

    #[tokio::test]
    async fn zero_chunks_bind_null() {
        let rig = rig();
        let id = rig.registry.open("lob_null", SessionConfig::from_config(&ProxyConfig::default(), "lob_null"));
        let mut call = rig.registry.begin_call(id).await.unwrap();
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        let p = rig.cursors.prepare(s, "SELECT ?");
        let w = rig.lobs.open_write(s, &token, p.statement_id, 1, LobKind::Character).await.unwrap();
        assert_eq!(rig.lobs.close_write(s, w).await.unwrap(), None);
        assert_eq!(s.statements[&p.statement_id].params[0], Some(Value::Null));

        let w = rig.lobs.open_write(s, &token, p.statement_id, 1, LobKind::Character).await.unwrap();
        rig.lobs.write_chunk(s, &token, w, b"").await.unwrap();
        assert_eq!(rig.lobs.close_write(s, w).await.unwrap(), Some(0));
        assert!(matches!(s.statements[&p.statement_id].params[0], Some(Value::Lob(_))));
    }

    #[tokio::test]
    async fn oversized_chunks_and_wrong_directions_are_rejected() {
        let rig = rig();
        let id = rig.registry.open("lob_rules", SessionConfig::from_config(&ProxyConfig::default(), "lob_rules"));
        let mut call = rig.registry.begin_call(id).await.unwrap();
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        let p = rig.cursors.prepare(s, "SELECT ?");
        let w = rig.lobs.open_write(s, &token, p.statement_id, 1, LobKind::Binary).await.unwrap();
        assert!(matches!(rig.lobs.write_chunk(s, &token, w, &[0; 101]).await, Err(ProxyError::Protocol { .. })));
        assert!(matches!(rig.lobs.read_chunk(s, &token, w, 10).await, Err(ProxyError::Protocol { .. })));
        assert!(s.conn.is_some(), "open write stream leases the connection");
        rig.lobs.abandon(s, w).await.unwrap();
        assert!(s.conn.is_none());
        assert!(s.statements[&p.statement_id].open_writes.is_empty());
        assert!(matches!(rig.lobs.abandon(s, w).await, Err(ProxyError::StaleHandle { .. })));
    }

    #[tokio::test]
    async fn closing_the_cursor_abandons_its_read_streams() {
        let rig = rig();
        let id = rig.registry.open("lob_cascade", SessionConfig::from_config(&ProxyConfig::default(), "lob_cascade"));
        let mut call = rig.registry.begin_call(id).await.unwrap();
        let token = call.token.clone();
        let s: &mut Session = &mut call;
        rig.cursors.execute_sql(s, &token, "CREATE TABLE notes (body TEXT)", vec![]).await.unwrap();
        rig.cursors
            .execute_sql(s, &token, "INSERT INTO notes VALUES (?)", vec![Value::Text("x".repeat(63))])
            .await
            .unwrap();
        let ExecuteOutcome::Cursor { cursor_id, .. } = rig.cursors.execute_sql(s, &token, "SELECT body FROM notes", vec![]).await.unwrap() else {
            panic!("rows")
        };
        let block = rig.cursors.fetch_next(s, &token, cursor_id, 1).await.unwrap();
        assert!(matches!(block.rows[0][0], WireValue::Inline(_)));
        assert!(rig.lobs.open_read(s, &token, cursor_id, 0, 0).await.is_err());
        rig.cursors.close_cursor(s, cursor_id).await.unwrap();
        assert!(s.streams.is_empty());
    }
}
