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

//! State-reflecting tables: rows come straight out of session state
//! under one lock acquisition, no io. Every fetch here is coherent at
//! a single stop epoch.

use serde_json::{Value, json};

use crate::{
    query::registry::{FetchCtx, Fetched, Registry, TableDef},
    session::{Protocol, executor::Executor},
    tables::{cols, opt_str},
};

const BWP: &[Protocol] = &[Protocol::Bwp];
const NDAP: &[Protocol] = &[Protocol::Ndap];

pub fn register(reg: &mut Registry) {
    for def in [
        TableDef {
            name: "frames",
            columns: &["id", "function", "url", "file", "line", "col", "script_id"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_frames,
        },
        TableDef {
            name: "scopes",
            columns: &["frame_id", "index", "type", "name", "object_id"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_scopes,
        },
        TableDef {
            name: "async_frames",
            columns: &["id", "function", "file", "line", "parent_id", "description"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_async_frames,
        },
        TableDef {
            name: "breakpoints",
            columns: &["id", "file", "line", "condition", "hits", "enabled", "wire_id"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_breakpoints,
        },
        TableDef {
            name: "scripts",
            columns: &["script_id", "file", "url", "lines", "source_map", "is_module"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_scripts,
        },
        TableDef {
            name: "console",
            columns: &["ts", "level", "text"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_console,
        },
        TableDef {
            name: "exceptions",
            columns: &["ts", "uncaught", "text"],
            required_filters: &[],
            fetch_params: &[],
            protocols: None,
            fetch: fetch_exceptions,
        },
        TableDef {
            name: "threads",
            columns: &["id", "name", "stopped"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(NDAP),
            fetch: fetch_threads,
        },
        TableDef {
            name: "modules",
            columns: &["id", "name", "path", "address"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(NDAP),
            fetch: fetch_modules,
        },
        TableDef {
            name: "page_events",
            columns: &["ts", "name", "data"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_page_events,
        },
        TableDef {
            name: "network",
            columns: &["request_id", "url", "method", "status", "mime_type", "finished"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_network,
        },
        TableDef {
            name: "ws_frames",
            columns: &["ts", "direction", "opcode", "payload"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_ws_frames,
        },
    ] {
        reg.register(def);
    }
}

fn fetch_frames(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .call_frames
        .iter()
        .map(|f| {
            vec![
                Value::from(f.id.clone()),
                Value::from(f.function_name.clone()),
                Value::from(f.url.clone()),
                Value::from(f.file.clone()),
                Value::from(f.line),
                Value::from(f.col),
                Value::from(f.script_id.clone()),
            ]
        })
        .collect();
    Ok(Fetched {
        columns: cols(&["id", "function", "url", "file", "line", "col", "script_id"]),
        rows,
    })
}

fn fetch_scopes(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let mut rows = vec![];
    for frame in &state.call_frames {
        for (i, scope) in frame.scope_chain.iter().enumerate() {
            rows.push(vec![
                Value::from(frame.id.clone()),
                Value::from(i as i64),
                Value::from(scope.kind.clone()),
                opt_str(&scope.name),
                opt_str(&scope.object_id),
            ]);
        }
    }
    Ok(Fetched { columns: cols(&["frame_id", "index", "type", "name", "object_id"]), rows })
}

fn fetch_async_frames(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .async_stack
        .iter()
        .map(|f| {
            vec![
                Value::from(f.id.clone()),
                Value::from(f.function_name.clone()),
                Value::from(f.file.clone()),
                Value::from(f.line),
                opt_str(&f.parent_id),
                Value::from(f.description.clone()),
            ]
        })
        .collect();
    Ok(Fetched {
        columns: cols(&["id", "function", "file", "line", "parent_id", "description"]),
        rows,
    })
}

fn fetch_breakpoints(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .breakpoints
        .iter()
        .map(|(id, bp)| {
            vec![
                Value::from(id.clone()),
                Value::from(bp.file.clone()),
                Value::from(bp.line),
                opt_str(&bp.condition),
                Value::from(bp.hits),
                Value::from(bp.enabled),
                Value::from(bp.wire_id.clone()),
            ]
        })
        .collect();
    Ok(Fetched {
        columns: cols(&["id", "file", "line", "condition", "hits", "enabled", "wire_id"]),
        rows,
    })
}

fn fetch_scripts(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .scripts
        .iter()
        .map(|(id, s)| {
            vec![
                Value::from(id.clone()),
                Value::from(s.file.clone()),
                Value::from(s.url.clone()),
                Value::from(s.lines),
                opt_str(&s.source_map),
                Value::from(s.is_module),
            ]
        })
        .collect();
    Ok(Fetched {
        columns: cols(&["script_id", "file", "url", "lines", "source_map", "is_module"]),
        rows,
    })
}

fn fetch_console(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .console
        .iter()
        .map(|e| {
            vec![Value::from(e.ts), Value::from(e.level.clone()), Value::from(e.text.clone())]
        })
        .collect();
    Ok(Fetched { columns: cols(&["ts", "level", "text"]), rows })
}

fn fetch_exceptions(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .exceptions
        .iter()
        .map(|e| vec![Value::from(e.ts), Value::from(e.uncaught), Value::from(e.text.clone())])
        .collect();
    Ok(Fetched { columns: cols(&["ts", "uncaught", "text"]), rows })
}

fn fetch_threads(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .wire
        .ndap()
        .map(|ndap| {
            ndap.active_threads
                .iter()
                .map(|t| {
                    vec![Value::from(t.id), Value::from(t.name.clone()), Value::from(t.stopped)]
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Fetched { columns: cols(&["id", "name", "stopped"]), rows })
}

fn fetch_modules(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .wire
        .ndap()
        .map(|ndap| {
            ndap.modules
                .iter()
                .map(|m| {
                    vec![
                        Value::from(m.id.clone()),
                        Value::from(m.name.clone()),
                        Value::from(m.path.clone()),
                        opt_str(&m.address),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Fetched { columns: cols(&["id", "name", "path", "address"]), rows })
}

fn fetch_page_events(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .wire
        .bwp()
        .map(|bwp| {
            bwp.page_events
                .iter()
                .map(|e| vec![Value::from(e.ts), Value::from(e.name.clone()), e.data.clone()])
                .collect()
        })
        .unwrap_or_default();
    Ok(Fetched { columns: cols(&["ts", "name", "data"]), rows })
}

fn fetch_network(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .wire
        .bwp()
        .map(|bwp| {
            bwp.network_requests
                .values()
                .map(|r| {
                    vec![
                        Value::from(r.request_id.clone()),
                        Value::from(r.url.clone()),
                        Value::from(r.method.clone()),
                        r.status.map(Value::from).unwrap_or(Value::Null),
                        opt_str(&r.mime_type),
                        Value::from(r.finished),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Fetched {
        columns: cols(&["request_id", "url", "method", "status", "mime_type", "finished"]),
        rows,
    })
}

fn fetch_ws_frames(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    let rows = state
        .wire
        .bwp()
        .map(|bwp| {
            bwp.ws_frames
                .iter()
                .map(|f| {
                    vec![
                        Value::from(f.ts),
                        Value::from(f.direction.clone()),
                        Value::from(f.opcode),
                        Value::from(f.payload.clone()),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Fetched { columns: cols(&["ts", "direction", "opcode", "payload"]), rows })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    use crate::{
        query,
        session::{executor::test_support::FakeExecutor, state::*},
        tables,
    };

    #[test]
    fn frames_reflect_state() {
        let exec = FakeExecutor::bwp();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            state.push_frame_for_test("boot", "main.ts", 5);
        }
        let out = query::run("SELECT function, file, line FROM frames", &tables::registry(), &exec)
            .expect("query");
        assert_eq!(out.rows, vec![vec![json!("boot"), json!("main.ts"), json!(5)]]);
    }

    #[test]
    fn breakpoints_list_in_insertion_order() {
        let exec = FakeExecutor::bwp();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            for file in ["b.ts", "a.ts"] {
                state.add_breakpoint(Breakpoint {
                    file: String::from(file),
                    line: 3,
                    condition: None,
                    hits: 0,
                    enabled: true,
                    wire_id: format!("w:{file}"),
                });
            }
        }
        let out =
            query::run("SELECT id, file FROM breakpoints", &tables::registry(), &exec).expect("query");
        assert_eq!(
            out.rows,
            vec![vec![json!("b1"), json!("b.ts")], vec![json!("b2"), json!("a.ts")]]
        );
    }

    #[test]
    fn ndap_only_tables_reject_bwp_sessions() {
        let exec = FakeExecutor::bwp();
        let err = query::run("SELECT * FROM threads", &tables::registry(), &exec)
            .expect_err("threads should not serve a bwp session");
        assert_eq!(err.code(), "ErrTableNotAvailableForProtocol");
    }

    #[test]
    fn console_rows_filterable_by_level() {
        let exec = FakeExecutor::ndap();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            for (level, text) in [("log", "fine"), ("error", "boom"), ("log", "more")] {
                state.push_console(ConsoleEntry {
                    ts: 1,
                    level: String::from(level),
                    text: String::from(text),
                });
            }
        }
        let out = query::run(
            "SELECT text FROM console WHERE level = 'error'",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(out.rows, vec![vec![json!("boom")]]);
    }
}
