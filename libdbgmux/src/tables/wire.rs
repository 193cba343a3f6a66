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

//! On-demand tables: each fetch issues protocol requests through the
//! executor. A failed request degrades to zero rows; these tables
//! never surface wire errors to the query caller.

use base64::Engine as _;
use serde_json::{Value, json};

use crate::{
    errors::QueryError,
    query::registry::{FetchCtx, Fetched, Registry, TableDef},
    session::{Protocol, executor::Executor},
    tables::{cols, eq_text, text_predicate},
};

const BWP: &[Protocol] = &[Protocol::Bwp];
const NDAP: &[Protocol] = &[Protocol::Ndap];

/// Prototype chains are walked to a fixed depth rather than doing
/// cycle detection by object id.
const PROTO_DEPTH_CAP: usize = 20;

const SOURCE_COLS: &[&str] = &["script_id", "file", "line", "text"];
const PROPS_COLS: &[&str] = &["name", "value", "type", "object_id"];
const VARS_COLS: &[&str] = &["scope", "name", "value", "type"];

pub fn register(reg: &mut Registry) {
    for def in [
        TableDef {
            name: "source",
            columns: SOURCE_COLS,
            required_filters: &[],
            fetch_params: &["file", "script_id"],
            protocols: Some(BWP),
            fetch: fetch_source_bwp,
        },
        TableDef {
            name: "source",
            columns: SOURCE_COLS,
            required_filters: &[],
            fetch_params: &["file", "script_id"],
            protocols: Some(NDAP),
            fetch: fetch_source_ndap,
        },
        TableDef {
            name: "props",
            columns: PROPS_COLS,
            required_filters: &["object_id"],
            fetch_params: &["object_id"],
            protocols: Some(BWP),
            fetch: fetch_props_bwp,
        },
        TableDef {
            name: "props",
            columns: PROPS_COLS,
            required_filters: &["object_id"],
            fetch_params: &["object_id"],
            protocols: Some(NDAP),
            fetch: fetch_props_ndap,
        },
        TableDef {
            name: "proto",
            columns: &["depth", "class", "object_id"],
            required_filters: &["object_id"],
            fetch_params: &["object_id"],
            protocols: Some(BWP),
            fetch: fetch_proto,
        },
        TableDef {
            name: "this",
            columns: PROPS_COLS,
            required_filters: &[],
            fetch_params: &["frame_id"],
            protocols: Some(BWP),
            fetch: fetch_this_bwp,
        },
        TableDef {
            name: "this",
            columns: PROPS_COLS,
            required_filters: &[],
            fetch_params: &["frame_id"],
            protocols: Some(NDAP),
            fetch: fetch_this_ndap,
        },
        TableDef {
            name: "vars",
            columns: VARS_COLS,
            required_filters: &[],
            fetch_params: &["frame_id"],
            protocols: Some(BWP),
            fetch: fetch_vars_bwp,
        },
        TableDef {
            name: "vars",
            columns: VARS_COLS,
            required_filters: &[],
            fetch_params: &["frame_id"],
            protocols: Some(NDAP),
            fetch: fetch_vars_ndap,
        },
        TableDef {
            name: "registers",
            columns: &["name", "value"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(NDAP),
            fetch: fetch_registers,
        },
        TableDef {
            name: "dom",
            columns: &["node_id", "parent_id", "node_name", "node_type", "attributes"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_dom,
        },
        TableDef {
            name: "styles",
            columns: &["name", "value"],
            required_filters: &["node_id"],
            fetch_params: &["node_id"],
            protocols: Some(BWP),
            fetch: fetch_styles,
        },
        TableDef {
            name: "storage",
            columns: &["name", "value", "domain", "path", "expires"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_storage,
        },
        TableDef {
            name: "coverage",
            columns: &["script_id", "url", "function", "count", "start_offset", "end_offset"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_coverage,
        },
        TableDef {
            name: "performance",
            columns: &["name", "value"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(BWP),
            fetch: fetch_performance,
        },
        TableDef {
            name: "memory",
            columns: &["address", "offset", "hex", "ascii"],
            required_filters: &["address", "length"],
            fetch_params: &["address", "length"],
            protocols: Some(NDAP),
            fetch: fetch_memory,
        },
        TableDef {
            name: "disassembly",
            columns: &["address", "instruction", "bytes"],
            required_filters: &["address"],
            fetch_params: &["address", "length"],
            protocols: Some(NDAP),
            fetch: fetch_disassembly,
        },
        TableDef {
            name: "signals",
            columns: &["signal", "pass", "stop", "notify"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(NDAP),
            fetch: fetch_signals,
        },
        TableDef {
            name: "watchpoints",
            columns: &["id", "address", "size", "enabled"],
            required_filters: &[],
            fetch_params: &[],
            protocols: Some(NDAP),
            fetch: fetch_watchpoints,
        },
    ] {
        reg.register(def);
    }
}

fn source_rows(script_id: &str, file: &str, text: &str) -> Vec<Vec<Value>> {
    text.lines()
        .enumerate()
        .map(|(i, line)| {
            vec![
                Value::from(script_id),
                Value::from(file),
                Value::from(i as i64 + 1),
                Value::from(line),
            ]
        })
        .collect()
}

/// `source` wants `file =`, `file LIKE`, or `script_id =`; when both
/// forms are present the script id wins. The file comparison runs
/// against the script table at fetch time so only matching scripts are
/// fetched from the wire.
fn fetch_source_bwp(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let targets: Vec<(String, String)> = {
        let state = ctx.executor.state();
        let state = state.lock().unwrap();
        if let Some(id) = eq_text(ctx, "script_id") {
            state
                .scripts
                .get(&id)
                .map(|s| vec![(id.clone(), s.file.clone())])
                .unwrap_or_default()
        } else {
            let wants_file = ctx
                .where_clause
                .map(|w| {
                    let mut comps = vec![];
                    w.comparisons_for("file", &mut comps);
                    !comps.is_empty()
                })
                .unwrap_or(false);
            if !wants_file {
                return Err(QueryError::RequiredFilter {
                    table: String::from("source"),
                    column: String::from("file"),
                }
                .into());
            }
            let matches = text_predicate(ctx.where_clause, "file");
            state
                .scripts
                .iter()
                .filter(|(_, s)| matches(&s.file))
                .map(|(id, s)| (id.clone(), s.file.clone()))
                .collect()
        }
    };

    let mut rows = vec![];
    for (script_id, file) in targets {
        match ctx
            .executor
            .send("Debugger.getScriptSource", json!({"scriptId": script_id}), None)
        {
            Ok(resp) => {
                let text = resp["scriptSource"].as_str().unwrap_or("");
                rows.extend(source_rows(&script_id, &file, text));
            }
            // stale script: best effort, skip it
            Err(_) => continue,
        }
    }
    Ok(Fetched { columns: cols(SOURCE_COLS), rows })
}

fn fetch_source_ndap(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let (params, script_id, file) = if let Some(id) = eq_text(ctx, "script_id") {
        match id.parse::<i64>() {
            Ok(reference) => (json!({"sourceReference": reference}), id, String::new()),
            Err(_) => return Ok(Fetched { columns: cols(SOURCE_COLS), rows: vec![] }),
        }
    } else if let Some(file) = eq_text(ctx, "file") {
        (json!({"source": {"path": file}}), String::new(), file)
    } else {
        return Err(QueryError::RequiredFilter {
            table: String::from("source"),
            column: String::from("file"),
        }
        .into());
    };

    let rows = match ctx.executor.send("source", params, None) {
        Ok(resp) => source_rows(&script_id, &file, resp["content"].as_str().unwrap_or("")),
        Err(_) => vec![],
    };
    Ok(Fetched { columns: cols(SOURCE_COLS), rows })
}

fn props_rows_bwp(resp: &Value) -> Vec<Vec<Value>> {
    resp["result"]
        .as_array()
        .map(|props| {
            props
                .iter()
                .map(|p| {
                    let value = &p["value"];
                    vec![
                        Value::from(p["name"].as_str().unwrap_or("")),
                        value
                            .get("value")
                            .cloned()
                            .unwrap_or_else(|| {
                                Value::from(value["description"].as_str().unwrap_or(""))
                            }),
                        Value::from(value["type"].as_str().unwrap_or("undefined")),
                        value["objectId"].as_str().map(Value::from).unwrap_or(Value::Null),
                    ]
                })
                .collect()
        })
        .unwrap_or_default()
}

fn fetch_props_bwp(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let object_id = eq_text(ctx, "object_id").expect("gated by required_filters");
    let rows = match ctx.executor.send(
        "Runtime.getProperties",
        json!({"objectId": object_id, "ownProperties": true}),
        None,
    ) {
        Ok(resp) => props_rows_bwp(&resp),
        Err(_) => vec![],
    };
    Ok(Fetched { columns: cols(PROPS_COLS), rows })
}

fn variables_rows(resp: &Value, scope: Option<&str>) -> Vec<Vec<Value>> {
    resp["variables"]
        .as_array()
        .map(|vars| {
            vars.iter()
                .map(|v| {
                    let mut row = vec![];
                    if let Some(scope) = scope {
                        row.push(Value::from(scope));
                    }
                    row.push(Value::from(v["name"].as_str().unwrap_or("")));
                    row.push(Value::from(v["value"].as_str().unwrap_or("")));
                    row.push(Value::from(v["type"].as_str().unwrap_or("")));
                    if scope.is_none() {
                        let reference = v["variablesReference"].as_i64().unwrap_or(0);
                        row.push(if reference > 0 {
                            Value::from(reference.to_string())
                        } else {
                            Value::Null
                        });
                    }
                    row
                })
                .collect()
        })
        .unwrap_or_default()
}

fn fetch_props_ndap(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let object_id = eq_text(ctx, "object_id").expect("gated by required_filters");
    let Ok(reference) = object_id.parse::<i64>() else {
        return Ok(Fetched { columns: cols(PROPS_COLS), rows: vec![] });
    };
    let rows = match ctx
        .executor
        .send("variables", json!({"variablesReference": reference}), None)
    {
        Ok(resp) => variables_rows(&resp, None),
        Err(_) => vec![],
    };
    Ok(Fetched { columns: cols(PROPS_COLS), rows })
}

fn fetch_proto(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let mut object_id = eq_text(ctx, "object_id").expect("gated by required_filters");
    let mut rows = vec![];

    for depth in 0..PROTO_DEPTH_CAP {
        let resp = match ctx.executor.send(
            "Runtime.getProperties",
            json!({"objectId": object_id, "ownProperties": true}),
            None,
        ) {
            Ok(resp) => resp,
            Err(_) => break,
        };

        let proto = resp["internalProperties"]
            .as_array()
            .and_then(|props| props.iter().find(|p| p["name"] == "[[Prototype]]"));
        let Some(proto) = proto else { break };

        let class = proto["value"]["description"].as_str().unwrap_or("Object").to_string();
        let Some(next_id) = proto["value"]["objectId"].as_str().map(String::from) else {
            break;
        };
        rows.push(vec![
            Value::from(depth as i64 + 1),
            Value::from(class),
            Value::from(next_id.clone()),
        ]);
        object_id = next_id;
    }

    Ok(Fetched { columns: cols(&["depth", "class", "object_id"]), rows })
}

fn frame_for(ctx: &FetchCtx) -> Option<crate::session::state::CallFrame> {
    let state = ctx.executor.state();
    let state = state.lock().unwrap();
    match eq_text(ctx, "frame_id") {
        Some(id) => state.call_frames.iter().find(|f| f.id == id).cloned(),
        None => state.call_frames.first().cloned(),
    }
}

fn fetch_this_bwp(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let Some(frame) = frame_for(ctx) else {
        return Ok(Fetched { columns: cols(PROPS_COLS), rows: vec![] });
    };
    let Some(this_id) = frame.this_object_id else {
        return Ok(Fetched { columns: cols(PROPS_COLS), rows: vec![] });
    };
    let rows = match ctx.executor.send(
        "Runtime.getProperties",
        json!({"objectId": this_id, "ownProperties": true}),
        None,
    ) {
        Ok(resp) => props_rows_bwp(&resp),
        Err(_) => vec![],
    };
    Ok(Fetched { columns: cols(PROPS_COLS), rows })
}

fn fetch_this_ndap(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let Some(frame) = frame_for(ctx) else {
        return Ok(Fetched { columns: cols(PROPS_COLS), rows: vec![] });
    };
    let mut params = json!({"expression": "this", "context": "repl"});
    if let Ok(fid) = frame.id.parse::<i64>() {
        params["frameId"] = Value::from(fid);
    }
    let rows = match ctx.executor.send("evaluate", params, None) {
        Ok(resp) => {
            let reference = resp["variablesReference"].as_i64().unwrap_or(0);
            vec![vec![
                Value::from("this"),
                Value::from(resp["result"].as_str().unwrap_or("")),
                Value::from(resp["type"].as_str().unwrap_or("")),
                if reference > 0 {
                    Value::from(reference.to_string())
                } else {
                    Value::Null
                },
            ]]
        }
        Err(_) => vec![],
    };
    Ok(Fetched { columns: cols(PROPS_COLS), rows })
}

fn fetch_vars_bwp(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let Some(frame) = frame_for(ctx) else {
        return Ok(Fetched { columns: cols(VARS_COLS), rows: vec![] });
    };
    let mut rows = vec![];
    for scope in &frame.scope_chain {
        let Some(object_id) = &scope.object_id else { continue };
        let resp = match ctx.executor.send(
            "Runtime.getProperties",
            json!({"objectId": object_id, "ownProperties": true}),
            None,
        ) {
            Ok(resp) => resp,
            Err(_) => continue,
        };
        for prop in props_rows_bwp(&resp) {
            let mut row = vec![Value::from(scope.kind.clone())];
            // drop the trailing object_id to fit the vars shape
            row.extend(prop.into_iter().take(3));
            rows.push(row);
        }
    }
    Ok(Fetched { columns: cols(VARS_COLS), rows })
}

fn fetch_vars_ndap(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let Some(frame) = frame_for(ctx) else {
        return Ok(Fetched { columns: cols(VARS_COLS), rows: vec![] });
    };
    let Ok(frame_id) = frame.id.parse::<i64>() else {
        return Ok(Fetched { columns: cols(VARS_COLS), rows: vec![] });
    };

    let scopes = match ctx.executor.send("scopes", json!({"frameId": frame_id}), None) {
        Ok(resp) => resp["scopes"].as_array().cloned().unwrap_or_default(),
        Err(_) => vec![],
    };

    let mut rows = vec![];
    for scope in scopes {
        let name = scope["name"].as_str().unwrap_or("scope").to_string();
        let Some(reference) = scope["variablesReference"].as_i64().filter(|r| *r > 0) else {
            continue;
        };
        if let Ok(resp) = ctx
            .executor
            .send("variables", json!({"variablesReference": reference}), None)
        {
            rows.extend(variables_rows(&resp, Some(&name)));
        }
    }
    Ok(Fetched { columns: cols(VARS_COLS), rows })
}

/// Cached registers from the current stop when available; one wire
/// round trip through the register scope otherwise.
fn fetch_registers(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["name", "value"]);

    let (cached, frame_id) = {
        let state = ctx.executor.state();
        let state = state.lock().unwrap();
        let cached: Vec<Vec<Value>> = state
            .wire
            .ndap()
            .map(|n| {
                n.registers
                    .iter()
                    .map(|r| vec![Value::from(r.name.clone()), Value::from(r.value.clone())])
                    .collect()
            })
            .unwrap_or_default();
        let frame_id =
            state.call_frames.first().and_then(|f| f.id.parse::<i64>().ok());
        (cached, frame_id)
    };
    if !cached.is_empty() {
        return Ok(Fetched { columns, rows: cached });
    }

    let Some(frame_id) = frame_id else {
        return Ok(Fetched { columns, rows: vec![] });
    };
    let scopes = match ctx.executor.send("scopes", json!({"frameId": frame_id}), None) {
        Ok(resp) => resp["scopes"].as_array().cloned().unwrap_or_default(),
        Err(_) => return Ok(Fetched { columns, rows: vec![] }),
    };
    let Some(reference) = scopes
        .iter()
        .find(|s| {
            s["name"]
                .as_str()
                .map(|n| n.eq_ignore_ascii_case("registers"))
                .unwrap_or(false)
        })
        .and_then(|s| s["variablesReference"].as_i64())
    else {
        return Ok(Fetched { columns, rows: vec![] });
    };

    let rows = match ctx
        .executor
        .send("variables", json!({"variablesReference": reference}), None)
    {
        Ok(resp) => {
            let rows: Vec<Vec<Value>> = resp["variables"]
                .as_array()
                .map(|vars| {
                    vars.iter()
                        .map(|v| {
                            vec![
                                Value::from(v["name"].as_str().unwrap_or("")),
                                Value::from(v["value"].as_str().unwrap_or("")),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            // refill the cache for this stop
            let state = ctx.executor.state();
            let mut state = state.lock().unwrap();
            if let Some(ndap) = state.wire.ndap_mut() {
                ndap.registers = rows
                    .iter()
                    .map(|r| crate::session::state::RegisterValue {
                        name: r[0].as_str().unwrap_or("").to_string(),
                        value: r[1].as_str().unwrap_or("").to_string(),
                    })
                    .collect();
            }
            rows
        }
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn flatten_dom(node: &Value, parent: Option<i64>, rows: &mut Vec<Vec<Value>>) {
    let Some(node_id) = node["nodeId"].as_i64() else { return };
    let attributes = node["attributes"]
        .as_array()
        .map(|attrs| {
            attrs
                .chunks(2)
                .map(|pair| {
                    format!(
                        "{}={}",
                        pair.first().and_then(Value::as_str).unwrap_or(""),
                        pair.get(1).and_then(Value::as_str).unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    rows.push(vec![
        Value::from(node_id),
        parent.map(Value::from).unwrap_or(Value::Null),
        Value::from(node["nodeName"].as_str().unwrap_or("")),
        Value::from(node["nodeType"].as_i64().unwrap_or(0)),
        Value::from(attributes),
    ]);
    if let Some(children) = node["children"].as_array() {
        for child in children {
            flatten_dom(child, Some(node_id), rows);
        }
    }
}

fn fetch_dom(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["node_id", "parent_id", "node_name", "node_type", "attributes"]);
    let rows = match ctx.executor.send("DOM.getDocument", json!({"depth": -1}), None) {
        Ok(resp) => {
            let mut rows = vec![];
            flatten_dom(&resp["root"], None, &mut rows);
            rows
        }
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn fetch_styles(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["name", "value"]);
    let node_id = eq_text(ctx, "node_id").expect("gated by required_filters");
    let Ok(node_id) = node_id.parse::<i64>() else {
        return Ok(Fetched { columns, rows: vec![] });
    };
    let rows = match ctx
        .executor
        .send("CSS.getComputedStyleForNode", json!({"nodeId": node_id}), None)
    {
        Ok(resp) => resp["computedStyle"]
            .as_array()
            .map(|styles| {
                styles
                    .iter()
                    .map(|s| {
                        vec![
                            Value::from(s["name"].as_str().unwrap_or("")),
                            Value::from(s["value"].as_str().unwrap_or("")),
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn fetch_storage(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["name", "value", "domain", "path", "expires"]);
    let rows = match ctx.executor.send("Network.getCookies", Value::Null, None) {
        Ok(resp) => resp["cookies"]
            .as_array()
            .map(|cookies| {
                cookies
                    .iter()
                    .map(|c| {
                        vec![
                            Value::from(c["name"].as_str().unwrap_or("")),
                            Value::from(c["value"].as_str().unwrap_or("")),
                            Value::from(c["domain"].as_str().unwrap_or("")),
                            Value::from(c["path"].as_str().unwrap_or("")),
                            c["expires"].as_f64().map(Value::from).unwrap_or(Value::Null),
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn coverage_rows(snapshot: &Value) -> Vec<Vec<Value>> {
    let mut rows = vec![];
    if let Some(scripts) = snapshot["result"].as_array() {
        for script in scripts {
            let script_id = script["scriptId"].as_str().unwrap_or("");
            let url = script["url"].as_str().unwrap_or("");
            if let Some(functions) = script["functions"].as_array() {
                for func in functions {
                    let name = func["functionName"].as_str().unwrap_or("");
                    if let Some(ranges) = func["ranges"].as_array() {
                        for range in ranges {
                            rows.push(vec![
                                Value::from(script_id),
                                Value::from(url),
                                Value::from(name),
                                Value::from(range["count"].as_i64().unwrap_or(0)),
                                Value::from(range["startOffset"].as_i64().unwrap_or(0)),
                                Value::from(range["endOffset"].as_i64().unwrap_or(0)),
                            ]);
                        }
                    }
                }
            }
        }
    }
    rows
}

/// The cached snapshot from the last `coverage` command wins; with no
/// snapshot the table takes one itself.
fn fetch_coverage(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["script_id", "url", "function", "count", "start_offset", "end_offset"]);

    let cached = {
        let state = ctx.executor.state();
        let state = state.lock().unwrap();
        state.wire.bwp().and_then(|b| b.coverage_snapshot.clone())
    };
    let snapshot = match cached {
        Some(snap) => snap,
        None => match ctx.executor.send("Profiler.takePreciseCoverage", Value::Null, None) {
            Ok(resp) => resp,
            Err(_) => return Ok(Fetched { columns, rows: vec![] }),
        },
    };
    Ok(Fetched { columns, rows: coverage_rows(&snapshot) })
}

fn fetch_performance(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["name", "value"]);
    let _ = ctx.executor.send("Performance.enable", Value::Null, None);
    let rows = match ctx.executor.send("Performance.getMetrics", Value::Null, None) {
        Ok(resp) => resp["metrics"]
            .as_array()
            .map(|metrics| {
                metrics
                    .iter()
                    .map(|m| {
                        vec![
                            Value::from(m["name"].as_str().unwrap_or("")),
                            m["value"].clone(),
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn parse_address(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    }
}

/// 16 bytes per row: address, offset, hex bytes, printable ascii.
fn hexdump_rows(base: Option<u64>, data: &[u8]) -> Vec<Vec<Value>> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let offset = (i * 16) as u64;
            let address = match base {
                Some(base) => format!("0x{:016x}", base + offset),
                None => format!("+0x{offset:x}"),
            };
            let hex = chunk.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ");
            let ascii: String = chunk
                .iter()
                .map(|b| {
                    if b.is_ascii_graphic() || *b == b' ' {
                        *b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            vec![
                Value::from(address),
                Value::from(offset),
                Value::from(hex),
                Value::from(ascii),
            ]
        })
        .collect()
}

fn fetch_memory(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["address", "offset", "hex", "ascii"]);
    let address = eq_text(ctx, "address").expect("gated by required_filters");
    let length = eq_text(ctx, "length").expect("gated by required_filters");
    let Ok(count) = length.parse::<u64>() else {
        return Ok(Fetched { columns, rows: vec![] });
    };

    let rows = match ctx.executor.send(
        "readMemory",
        json!({"memoryReference": address, "count": count}),
        None,
    ) {
        Ok(resp) => {
            let data = resp["data"]
                .as_str()
                .and_then(|d| base64::engine::general_purpose::STANDARD.decode(d).ok())
                .unwrap_or_default();
            let base = resp["address"]
                .as_str()
                .and_then(parse_address)
                .or_else(|| parse_address(&address));
            hexdump_rows(base, &data)
        }
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn fetch_disassembly(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["address", "instruction", "bytes"]);
    let address = eq_text(ctx, "address").expect("gated by required_filters");
    let count = eq_text(ctx, "length")
        .and_then(|l| l.parse::<u64>().ok())
        .unwrap_or(32);

    let rows = match ctx.executor.send(
        "disassemble",
        json!({"memoryReference": address, "instructionCount": count}),
        None,
    ) {
        Ok(resp) => resp["instructions"]
            .as_array()
            .map(|instrs| {
                instrs
                    .iter()
                    .map(|i| {
                        vec![
                            Value::from(i["address"].as_str().unwrap_or("")),
                            Value::from(i["instruction"].as_str().unwrap_or("")),
                            Value::from(i["instructionBytes"].as_str().unwrap_or("")),
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => vec![],
    };
    Ok(Fetched { columns, rows })
}

fn repl_output(ctx: &FetchCtx, command: &str) -> Option<String> {
    ctx.executor
        .send("evaluate", json!({"expression": command, "context": "repl"}), None)
        .ok()
        .and_then(|resp| resp["result"].as_str().map(String::from))
}

/// Parse the `process handle` listing: NAME PASS STOP NOTIFY columns
/// after a header.
fn parse_signal_lines(text: &str) -> Vec<Vec<Value>> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || !fields[0].starts_with("SIG") {
                return None;
            }
            let flag = |s: &str| s.eq_ignore_ascii_case("true") || s == "1";
            // some formats carry a numeric column after the name
            let tail = &fields[fields.len() - 3..];
            Some(vec![
                Value::from(fields[0]),
                Value::from(flag(tail[0])),
                Value::from(flag(tail[1])),
                Value::from(flag(tail[2])),
            ])
        })
        .collect()
}

fn fetch_signals(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["signal", "pass", "stop", "notify"]);
    let rows = repl_output(ctx, "process handle")
        .map(|text| parse_signal_lines(&text))
        .unwrap_or_default();
    Ok(Fetched { columns, rows })
}

/// Parse `watchpoint list` output lines like
/// `Watchpoint 1: addr = 0x7ffee4 size = 4 state = enabled`.
fn parse_watchpoint_lines(text: &str) -> Vec<Vec<Value>> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("Watchpoint ")?;
            let (id, rest) = rest.split_once(':')?;
            let field = |key: &str| {
                rest.split(key)
                    .nth(1)?
                    .trim_start_matches([' ', '='])
                    .split_whitespace()
                    .next()
                    .map(String::from)
            };
            Some(vec![
                id.trim().parse::<i64>().ok().map(Value::from).unwrap_or(Value::Null),
                field("addr").map(Value::from).unwrap_or(Value::Null),
                field("size")
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                Value::from(field("state").map(|s| s == "enabled").unwrap_or(false)),
            ])
        })
        .collect()
}

fn fetch_watchpoints(ctx: &FetchCtx) -> anyhow::Result<Fetched> {
    let columns = cols(&["id", "address", "size", "enabled"]);
    let rows = repl_output(ctx, "watchpoint list")
        .map(|text| parse_watchpoint_lines(&text))
        .unwrap_or_default();
    Ok(Fetched { columns, rows })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    use crate::{
        errors::{NdapError, WireError},
        query,
        session::{
            executor::test_support::FakeExecutor,
            state::{RegisterValue, ScriptInfo},
        },
        tables,
    };

    fn add_script(exec: &FakeExecutor, id: &str, file: &str) {
        let state = exec.state();
        let mut state = state.lock().unwrap();
        state.add_script(
            String::from(id),
            ScriptInfo {
                file: String::from(file),
                url: format!("file://{file}"),
                lines: 1,
                source_map: None,
                is_module: false,
            },
        );
    }

    // A LIKE pattern with a regex metacharacter must select scripts
    // literally: 'app.ts' fetches source for app.ts, never appXts.
    #[test]
    fn source_like_is_literal_safe() {
        let exec = FakeExecutor::bwp();
        add_script(&exec, "1", "appXts");
        add_script(&exec, "2", "app.ts");
        exec.respond("Debugger.getScriptSource", json!({"scriptSource": "const x = 1;"}));

        let out = query::run(
            "SELECT * FROM source WHERE file LIKE 'app.ts'",
            &tables::registry(),
            &exec,
        )
        .expect("query");

        let calls = exec.calls_for("Debugger.getScriptSource");
        assert_eq!(calls.len(), 1, "exactly one source fetch expected");
        assert_eq!(calls[0]["scriptId"], "2");
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0][3], json!("const x = 1;"));
    }

    #[test]
    fn source_script_id_wins_over_file() {
        let exec = FakeExecutor::bwp();
        add_script(&exec, "1", "a.ts");
        add_script(&exec, "2", "b.ts");
        exec.respond("Debugger.getScriptSource", json!({"scriptSource": "b"}));

        query::run(
            "SELECT * FROM source WHERE file = 'a.ts' AND script_id = '2'",
            &tables::registry(),
            &exec,
        )
        .expect("query");

        let calls = exec.calls_for("Debugger.getScriptSource");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["scriptId"], "2");
    }

    #[test]
    fn source_without_filters_requires_file() {
        let exec = FakeExecutor::bwp();
        let err = query::run("SELECT * FROM source", &tables::registry(), &exec)
            .expect_err("source with no filter must fail");
        assert_eq!(err.code(), "ErrRequiredFilter");
    }

    #[test]
    fn stale_object_yields_zero_rows() {
        let exec = FakeExecutor::bwp();
        exec.fail(
            "Runtime.getProperties",
            WireError::Bwp(crate::errors::BwpError::RequestFailed {
                method: String::from("Runtime.getProperties"),
                message: String::from("Could not find object with given id"),
            }),
        );
        let out = query::run(
            "SELECT * FROM props WHERE object_id = 'gone'",
            &tables::registry(),
            &exec,
        )
        .expect("query degrades to empty");
        assert!(out.rows.is_empty());
    }

    #[test]
    fn props_rows_shape() {
        let exec = FakeExecutor::bwp();
        exec.respond(
            "Runtime.getProperties",
            json!({"result": [
                {"name": "count", "value": {"type": "number", "value": 3}},
                {"name": "items", "value": {"type": "object", "description": "Array(2)",
                                            "objectId": "obj:9"}},
            ]}),
        );
        let out = query::run(
            "SELECT * FROM props WHERE object_id = 'obj:1'",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(
            out.rows,
            vec![
                vec![json!("count"), json!(3), json!("number"), Value::Null],
                vec![json!("items"), json!("Array(2)"), json!("object"), json!("obj:9")],
            ]
        );
    }

    #[test]
    fn proto_walk_respects_depth_cap() {
        let exec = FakeExecutor::bwp();
        // every object reports another prototype below it, forever
        for i in 0..PROTO_DEPTH_CAP + 5 {
            exec.respond(
                "Runtime.getProperties",
                json!({"internalProperties": [
                    {"name": "[[Prototype]]",
                     "value": {"description": "Object", "objectId": format!("proto:{i}")}}
                ]}),
            );
        }
        let out = query::run(
            "SELECT * FROM proto WHERE object_id = 'obj:0'",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(out.rows.len(), PROTO_DEPTH_CAP);
        assert_eq!(exec.calls_for("Runtime.getProperties").len(), PROTO_DEPTH_CAP);
    }

    #[test]
    fn registers_prefer_cache() {
        let exec = FakeExecutor::ndap();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            if let Some(ndap) = state.wire.ndap_mut() {
                ndap.registers.push(RegisterValue {
                    name: String::from("rip"),
                    value: String::from("0x1000"),
                });
            }
        }
        let out = query::run("SELECT * FROM registers", &tables::registry(), &exec)
            .expect("query");
        assert_eq!(out.rows, vec![vec![json!("rip"), json!("0x1000")]]);
        // cache hit: nothing went over the wire
        assert!(exec.calls_for("scopes").is_empty());
    }

    #[test]
    fn registers_fall_back_to_wire_when_cache_empty() {
        let exec = FakeExecutor::ndap();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            state.push_frame_for_test("main", "/src/main.c", 3);
            // frame ids must parse as DAP frame ids
            state.call_frames[0].id = String::from("1000");
        }
        exec.respond(
            "scopes",
            json!({"scopes": [
                {"name": "Locals", "variablesReference": 7},
                {"name": "Registers", "variablesReference": 8},
            ]}),
        );
        exec.respond(
            "variables",
            json!({"variables": [
                {"name": "rax", "value": "0x2a"},
                {"name": "rbx", "value": "0x0"},
            ]}),
        );

        let out = query::run("SELECT * FROM registers", &tables::registry(), &exec)
            .expect("query");
        assert_eq!(out.rows.len(), 2);
        assert_eq!(exec.calls_for("variables")[0]["variablesReference"], 8);

        // and the fetch refilled the cache
        let state = exec.state();
        let state = state.lock().unwrap();
        assert_eq!(state.wire.ndap().unwrap().registers.len(), 2);
    }

    #[test]
    fn memory_requires_address_and_length() {
        let exec = FakeExecutor::ndap();
        let err = query::run(
            "SELECT * FROM memory WHERE address = '0x1000'",
            &tables::registry(),
            &exec,
        )
        .expect_err("length filter required");
        assert_eq!(err.code(), "ErrRequiredFilter");
        assert!(err.to_string().contains("length"));
    }

    #[test]
    fn memory_hexdump_shape() {
        use base64::Engine as _;
        let exec = FakeExecutor::ndap();
        let payload: Vec<u8> = (0u8..20).chain(*b"Hi!?").collect();
        exec.respond(
            "readMemory",
            json!({
                "address": "0x1000",
                "data": base64::engine::general_purpose::STANDARD.encode(&payload),
            }),
        );

        let out = query::run(
            "SELECT * FROM memory WHERE address = '0x1000' AND length = 24",
            &tables::registry(),
            &exec,
        )
        .expect("query");

        assert_eq!(out.rows.len(), 2, "24 bytes is two 16-byte rows");
        assert_eq!(out.rows[0][0], json!("0x0000000000001000"));
        assert_eq!(out.rows[1][0], json!("0x0000000000001010"));
        assert_eq!(out.rows[1][1], json!(16));
        let ascii = out.rows[1][3].as_str().unwrap();
        assert!(ascii.contains("Hi!?"), "ascii column was {ascii:?}");
        let hex = out.rows[0][2].as_str().unwrap();
        assert!(hex.starts_with("00 01 02"));
    }

    #[test]
    fn ndap_source_by_path() {
        let exec = FakeExecutor::ndap();
        exec.respond("source", json!({"content": "int main() {\n}\n"}));
        let out = query::run(
            "SELECT line, text FROM source WHERE file = '/src/main.c'",
            &tables::registry(),
            &exec,
        )
        .expect("query");
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0], vec![json!(1), json!("int main() {")]);
        let calls = exec.calls_for("source");
        assert_eq!(calls[0]["source"]["path"], "/src/main.c");
    }

    #[test]
    fn wire_failure_degrades_to_empty_not_error() {
        let exec = FakeExecutor::ndap();
        exec.fail(
            "disassemble",
            WireError::Ndap(NdapError::RequestTimeout {
                command: String::from("disassemble"),
                timeout_ms: 10,
            }),
        );
        let out = query::run(
            "SELECT * FROM disassembly WHERE address = '0x1000'",
            &tables::registry(),
            &exec,
        )
        .expect("query degrades");
        assert!(out.rows.is_empty());
    }

    #[test]
    fn signal_listing_parses() {
        let rows = parse_signal_lines(
            "NAME         PASS   STOP   NOTIFY\n\
             ===========  =====  =====  ======\n\
             SIGHUP       true   true   true\n\
             SIGINT       false  true   true\n",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], json!("SIGHUP"));
        assert_eq!(rows[1][1], json!(false));
    }

    #[test]
    fn watchpoint_listing_parses() {
        let rows = parse_watchpoint_lines(
            "Number of supported hardware watchpoints: 4\n\
             Watchpoint 1: addr = 0x7ffee4a8 size = 4 state = enabled type = w\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!(1));
        assert_eq!(rows[0][1], json!("0x7ffee4a8"));
        assert_eq!(rows[0][2], json!(4));
        assert_eq!(rows[0][3], json!(true));
    }
}
