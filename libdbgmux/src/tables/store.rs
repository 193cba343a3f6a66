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

//! Store-backed tables: SQL over the event log. Equality filters on
//! the indexed-ish columns are pushed down into the SQL where clause;
//! everything else is handled by the normal post-fetch filter pass.

use serde_json::Value;

use crate::{
    query::registry::{FetchCtx, Fetched, Registry, TableDef},
    session::executor::Executor,
    tables::{cols, eq_text},
};

const EVENTS_COLS: &[&str] =
    &["id", "ts", "source", "category", "method", "data", "session_id"];
const CDP_COLS: &[&str] = &["id", "ts", "direction", "method", "data", "session_id"];
const CONNECTIONS_COLS: &[&str] = &["id", "ts", "method", "data", "session_id"];
const TIMELINE_COLS: &[&str] = &["id", "ts", "source", "category", "method", "session_id"];

pub fn register(reg: &mut Registry) {
    for def in [
        TableDef {
            name: "events",
            columns: EVENTS_COLS,
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_events,
        },
        TableDef {
            name: "cdp",
            columns: CDP_COLS,
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_cdp,
        },
        // same definition under its long name
        TableDef {
            name: "cdp_messages",
            columns: CDP_COLS,
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_cdp,
        },
        TableDef {
            name: "connections",
            columns: CONNECTIONS_COLS,
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_connections,
        },
        TableDef {
            name: "timeline",
            columns: TIMELINE_COLS,
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_timeline,
        },
    ] {
        reg.register(def);
    }
}

/// Build `AND col = ?n` fragments for the equality filters the caller
/// supplied on pushdown-friendly columns.
fn pushdown(
    ctx: &FetchCtx,
    columns: &[&str],
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    for col in columns {
        if let Some(value) = eq_text(ctx, col) {
            params.push(Value::from(value));
            sql.push_str(&format!(" AND {} = ?{}", col, params.len()));
        }
    }
}

fn run_store_query(
    ctx: &FetchCtx,
    static_cols: &[&str],
    sql: String,
    params: Vec<Value>,
) -> anyhow::Result<Fetched> {
    let Some(store) = ctx.executor.store() else {
        return Ok(Fetched::empty(static_cols));
    };
    let rows = store.query(&sql, &params)?;
    Ok(Fetched { columns: rows.columns, rows: rows.rows })
}

fn fetch_events(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let mut sql = String::from(
        "SELECT id, ts, source, category, method, data, session_id FROM events WHERE 1=1",
    );
    let mut params = vec![];
    pushdown(ctx, &["source", "category", "method", "session_id"], &mut sql, &mut params);
    sql.push_str(" ORDER BY id");
    run_store_query(ctx, EVENTS_COLS, sql, params)
}

fn fetch_cdp(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let mut sql = String::from(
        "SELECT id, ts, \
         CASE source WHEN 'bwp_send' THEN 'send' ELSE 'recv' END AS direction, \
         method, data, session_id \
         FROM events WHERE source IN ('bwp_send', 'bwp_recv')",
    );
    let mut params = vec![];
    pushdown(ctx, &["method", "session_id"], &mut sql, &mut params);
    sql.push_str(" ORDER BY id");
    run_store_query(ctx, CDP_COLS, sql, params)
}

fn fetch_connections(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let mut sql = String::from(
        "SELECT id, ts, method, data, session_id FROM events WHERE category = 'connection'",
    );
    let mut params = vec![];
    pushdown(ctx, &["method", "session_id"], &mut sql, &mut params);
    sql.push_str(" ORDER BY id");
    run_store_query(ctx, CONNECTIONS_COLS, sql, params)
}

/// Everything that happened, in time order: a catch-all debugging aid
/// that leaves the payloads out to stay readable.
fn fetch_timeline(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let mut sql = String::from(
        "SELECT id, ts, source, category, method, session_id FROM events WHERE 1=1",
    );
    let mut params = vec![];
    pushdown(ctx, &["source", "category", "session_id"], &mut sql, &mut params);
    sql.push_str(" ORDER BY ts, id");
    run_store_query(ctx, TIMELINE_COLS, sql, params)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::json;

    use crate::{
        events::{EventStore, NewEvent},
        query,
        session::executor::test_support::FakeExecutor,
        tables,
    };

    fn seeded_store() -> Arc<EventStore> {
        let store = Arc::new(EventStore::open(None).expect("store"));
        store.record(NewEvent::wire("bwp_send", "Debugger.resume", json!({}), "s1"));
        store.record(NewEvent::wire(
            "bwp_recv",
            "Debugger.paused",
            json!({"params": {"reason": "other"}}),
            "s1",
        ));
        store.record(NewEvent::connection("attached", json!({"protocol": "bwp"}), "s1"));
        store.record(NewEvent::daemon("started", json!({})));
        store.flush();
        store
    }

    #[test]
    fn events_table_orders_by_id() {
        let exec = FakeExecutor::bwp().with_store(seeded_store());
        let out = query::run("SELECT id, method FROM events", &tables::registry(), &exec)
            .expect("query");
        assert_eq!(out.rows.len(), 4);
        let ids: Vec<i64> = out.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn events_pushdown_source_filter() {
        let exec = FakeExecutor::bwp().with_store(seeded_store());
        let out = query::run(
            "SELECT method FROM events WHERE source = 'bwp_recv'",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(out.rows, vec![vec![json!("Debugger.paused")]]);
    }

    #[test]
    fn cdp_table_derives_direction() {
        let exec = FakeExecutor::bwp().with_store(seeded_store());
        let out = query::run(
            "SELECT direction, method FROM cdp ORDER BY id ASC",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(
            out.rows,
            vec![
                vec![json!("send"), json!("Debugger.resume")],
                vec![json!("recv"), json!("Debugger.paused")],
            ]
        );

        // the long alias serves the same rows
        let alias = query::run(
            "SELECT direction, method FROM cdp_messages ORDER BY id ASC",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(alias.rows, out.rows);
    }

    #[test]
    fn connections_table_filters_category() {
        let exec = FakeExecutor::bwp().with_store(seeded_store());
        let out = query::run("SELECT method FROM connections", &tables::registry(), &exec)
            .expect("query");
        assert_eq!(out.rows, vec![vec![json!("attached")]]);
    }

    #[test]
    fn no_store_degrades_to_empty() {
        let exec = FakeExecutor::bwp();
        let out = query::run("SELECT * FROM events", &tables::registry(), &exec).expect("query");
        assert!(out.rows.is_empty());
    }

    #[test]
    fn timeline_spans_all_sources() {
        let exec = FakeExecutor::bwp().with_store(seeded_store());
        let out =
            query::run("SELECT source FROM timeline", &tables::registry(), &exec).expect("query");
        assert_eq!(out.rows.len(), 4);
    }
}
