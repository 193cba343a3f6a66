// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The append-only event log. Every message that crosses either wire,
//! plus daemon and connection lifecycle events, lands here and becomes
//! queryable through the store-backed virtual tables.
//!
//! sqlite connections are not Sync, so a single writer thread owns the
//! connection and everything else talks to it over a channel. Appends
//! are buffered in the writer and flushed on a timer tick or when the
//! buffer passes its high-water mark, whichever comes first. Queries
//! force a flush first so a reader always sees its own writes.

use std::{
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicI64, Ordering},
    },
    thread,
};

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, Sender};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::consts;

/// A fully formed event row. `data` is JSON text.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub ts: i64,
    pub source: String,
    pub category: String,
    pub method: String,
    pub data: String,
    pub session_id: Option<String>,
}

/// An event as handed to `record`, before the store assigns an id and
/// timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Where the event came from: bwp_send, bwp_recv, ndap_send,
    /// ndap_recv, daemon, connection.
    pub source: String,
    pub category: String,
    pub method: String,
    pub data: Value,
    pub session_id: Option<String>,
    /// Force a synchronous flush once this event is buffered.
    pub flush_now: bool,
}

impl NewEvent {
    pub fn wire(source: &str, method: &str, data: Value, session: &str) -> NewEvent {
        NewEvent {
            source: String::from(source),
            category: String::from("wire"),
            method: String::from(method),
            data,
            session_id: Some(String::from(session)),
            flush_now: false,
        }
    }

    pub fn connection(method: &str, data: Value, session: &str) -> NewEvent {
        NewEvent {
            source: String::from("connection"),
            category: String::from("connection"),
            method: String::from(method),
            data,
            session_id: Some(String::from(session)),
            flush_now: true,
        }
    }

    pub fn daemon(method: &str, data: Value) -> NewEvent {
        NewEvent {
            source: String::from("daemon"),
            category: String::from("daemon"),
            method: String::from(method),
            data,
            session_id: None,
            flush_now: false,
        }
    }
}

/// Rows out of a read-only query against the log.
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

enum Msg {
    Record(EventRecord),
    Query { sql: String, params: Vec<Value>, reply: Sender<anyhow::Result<QueryRows>> },
    Flush { reply: Sender<()> },
    Close { reply: Sender<()> },
}

pub struct EventStore {
    next_id: AtomicI64,
    tx: Sender<Msg>,
    writer_join_h: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventStore {
    /// Open the store, file backed if a path is given, otherwise in
    /// memory. The id counter picks up after whatever the file already
    /// holds so ids stay totally ordered across restarts.
    #[instrument(skip_all)]
    pub fn open(path: Option<PathBuf>) -> anyhow::Result<EventStore> {
        let conn = match &path {
            Some(p) => Connection::open(p)
                .with_context(|| format!("opening event log at {}", p.display()))?,
            None => Connection::open_in_memory().context("opening in-memory event log")?,
        };
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                ts INTEGER NOT NULL,
                source TEXT NOT NULL,
                category TEXT NOT NULL,
                method TEXT NOT NULL,
                data TEXT NOT NULL,
                session_id TEXT
            );
            CREATE INDEX IF NOT EXISTS events_ts ON events(ts);
            CREATE INDEX IF NOT EXISTS events_source ON events(source);
            "#,
        )
        .context("creating events schema")?;

        let max_id: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| row.get(0))
            .context("reading max event id")?;
        info!("event log open, starting after id {}", max_id);

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer_join_h = thread::Builder::new()
            .name(String::from("event-store"))
            .spawn(move || writer_loop(conn, rx))
            .context("spawning event store writer")?;

        Ok(EventStore {
            next_id: AtomicI64::new(max_id + 1),
            tx,
            writer_join_h: Mutex::new(Some(writer_join_h)),
        })
    }

    /// Append an event, returning its assigned id. Ids are handed out
    /// before the row is flushed, so two records made in order observe
    /// ordered ids even while both are still buffered.
    pub fn record(&self, ev: NewEvent) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = EventRecord {
            id,
            ts: chrono::Utc::now().timestamp_millis(),
            source: ev.source,
            category: ev.category,
            method: ev.method,
            data: ev.data.to_string(),
            session_id: ev.session_id,
        };
        let flush_now = ev.flush_now;
        if self.tx.send(Msg::Record(record)).is_err() {
            warn!("event store already closed, dropping event {}", id);
            return id;
        }
        if flush_now {
            self.flush();
        }
        id
    }

    /// Run read-only SQL over the log. Writes are rejected.
    pub fn query(&self, sql: &str, params: &[Value]) -> anyhow::Result<QueryRows> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Msg::Query {
                sql: String::from(sql),
                params: params.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("event store closed"))?;
        reply_rx.recv().context("event store writer hung up")?
    }

    /// Block until everything buffered so far is on disk.
    pub fn flush(&self) {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Msg::Flush { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Flush and shut down the writer thread.
    pub fn close(&self) {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Msg::Close { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv();
        }
        if let Some(h) = self.writer_join_h.lock().unwrap().take() {
            if h.join().is_err() {
                error!("event store writer panicked");
            }
        }
    }
}

fn writer_loop(conn: Connection, rx: Receiver<Msg>) {
    let ticker = crossbeam_channel::tick(consts::STORE_FLUSH_INTERVAL);
    let mut buf: Vec<EventRecord> = Vec::with_capacity(consts::STORE_FLUSH_THRESHOLD);

    loop {
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok(Msg::Record(record)) => {
                    buf.push(record);
                    if buf.len() >= consts::STORE_FLUSH_THRESHOLD {
                        flush_buf(&conn, &mut buf);
                    }
                }
                Ok(Msg::Query { sql, params, reply }) => {
                    flush_buf(&conn, &mut buf);
                    let _ = reply.send(run_query(&conn, &sql, &params));
                }
                Ok(Msg::Flush { reply }) => {
                    flush_buf(&conn, &mut buf);
                    let _ = reply.send(());
                }
                Ok(Msg::Close { reply }) => {
                    flush_buf(&conn, &mut buf);
                    let _ = reply.send(());
                    return;
                }
                // all senders gone, nothing more will arrive
                Err(_) => {
                    flush_buf(&conn, &mut buf);
                    return;
                }
            },
            recv(ticker) -> _ => {
                if !buf.is_empty() {
                    flush_buf(&conn, &mut buf);
                }
            },
        }
    }
}

fn flush_buf(conn: &Connection, buf: &mut Vec<EventRecord>) {
    if buf.is_empty() {
        return;
    }
    let res: anyhow::Result<()> = (|| {
        let tx = conn.unchecked_transaction().context("starting flush txn")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO events (id, ts, source, category, method, data, session_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("preparing insert")?;
            for ev in buf.iter() {
                stmt.execute(rusqlite::params![
                    ev.id,
                    ev.ts,
                    ev.source,
                    ev.category,
                    ev.method,
                    ev.data,
                    ev.session_id,
                ])
                .context("inserting event")?;
            }
        }
        tx.commit().context("committing flush txn")?;
        Ok(())
    })();
    if let Err(e) = res {
        error!("flushing {} events: {:?}", buf.len(), e);
    }
    buf.clear();
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> anyhow::Result<QueryRows> {
    let mut stmt = conn.prepare(sql).context("preparing query")?;
    if !stmt.readonly() {
        return Err(anyhow!("event log queries must be read-only"));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| String::from(*c)).collect();
    let ncols = columns.len();

    for (i, p) in params.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, json_to_sql(p)).context("binding parameter")?;
    }

    let mut rows = Vec::new();
    let mut raw = stmt.raw_query();
    while let Some(row) = raw.next().context("stepping query")? {
        let mut out = Vec::with_capacity(ncols);
        for i in 0..ncols {
            out.push(sql_to_json(row.get_ref(i).context("reading cell")?));
        }
        rows.push(out);
    }

    Ok(QueryRows { columns, rows })
}

fn json_to_sql(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // compound values bind as their JSON text, for json_extract
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(v: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    fn ev(method: &str) -> NewEvent {
        NewEvent {
            source: String::from("daemon"),
            category: String::from("test"),
            method: String::from(method),
            data: serde_json::json!({"k": method}),
            session_id: None,
            flush_now: false,
        }
    }

    #[test]
    #[timeout(30000)]
    fn record_ids_are_ordered() {
        let store = EventStore::open(None).expect("store to open");
        let a = store.record(ev("a"));
        let b = store.record(ev("b"));
        assert!(a < b);

        store.flush();
        let rows = store
            .query("SELECT id, method FROM events ORDER BY id", &[])
            .expect("query to succeed");
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0][1], Value::from("a"));
        assert_eq!(rows.rows[1][1], Value::from("b"));
        store.close();
    }

    #[test]
    #[timeout(30000)]
    fn query_sees_buffered_writes() {
        let store = EventStore::open(None).expect("store to open");
        // no explicit flush: the query itself must flush the buffer
        store.record(ev("buffered"));
        let rows = store
            .query("SELECT method FROM events", &[])
            .expect("query to succeed");
        assert_eq!(rows.rows.len(), 1);
        store.close();
    }

    #[test]
    #[timeout(30000)]
    fn json_extract_works() {
        let store = EventStore::open(None).expect("store to open");
        store.record(ev("x"));
        let rows = store
            .query("SELECT json_extract(data, '$.k') FROM events", &[])
            .expect("query to succeed");
        assert_eq!(rows.rows[0][0], Value::from("x"));
        store.close();
    }

    #[test]
    #[timeout(30000)]
    fn writes_rejected() {
        let store = EventStore::open(None).expect("store to open");
        let res = store.query("DELETE FROM events", &[]);
        assert!(res.is_err());
        store.close();
    }

    #[test]
    #[timeout(30000)]
    fn params_bind() {
        let store = EventStore::open(None).expect("store to open");
        store.record(ev("wanted"));
        store.record(ev("other"));
        let rows = store
            .query("SELECT method FROM events WHERE method = ?1", &[Value::from("wanted")])
            .expect("query to succeed");
        assert_eq!(rows.rows.len(), 1);
        store.close();
    }

    #[test]
    #[timeout(30000)]
    fn file_backed_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");

        let store = EventStore::open(Some(path.clone())).expect("store to open");
        let first = store.record(ev("persisted"));
        store.close();

        let store = EventStore::open(Some(path)).expect("store to reopen");
        let next = store.record(ev("after"));
        assert!(next > first, "ids must keep increasing across reopen");
        store.close();
    }
}
