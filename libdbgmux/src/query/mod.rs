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

//! The query dispatcher: parse, resolve, gate, fetch, filter, format.

use serde_derive::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{errors::QueryError, session::executor::Executor};

pub mod ast;
pub mod filter;
pub mod parse;
pub mod registry;

use registry::{FetchCtx, Fetched, Registry};

/// A trailing `\j` on the query text selects json output; the default
/// is tab separated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Tsv,
    Json,
}

#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub format: OutputFormat,
}

impl QueryOutput {
    /// Header first, one row per line, tab separated. Null cells are
    /// empty, primitives print bare, compound values print as JSON.
    pub fn to_tsv(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.columns.join("\t"));
        for row in &self.rows {
            out.push('\n');
            let mut first = true;
            for cell in row {
                if !first {
                    out.push('\t');
                }
                first = false;
                out.push_str(&tsv_cell(cell));
            }
        }
        out
    }
}

fn tsv_cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Run one query end to end against a session's executor.
pub fn run(
    input: &str,
    registry: &Registry,
    executor: &dyn Executor,
) -> Result<QueryOutput, QueryError> {
    let trimmed = input.trim();
    let (text, format) = match trimmed.strip_suffix("\\j") {
        Some(stripped) => (stripped.trim(), OutputFormat::Json),
        None => (trimmed, OutputFormat::Tsv),
    };

    let query = parse::parse(text)?;

    let def = registry.lookup(&query.table, executor.protocol())?;
    registry::check_required_filters(def, query.where_clause.as_ref())?;

    let ctx = FetchCtx { where_clause: query.where_clause.as_ref(), executor };
    let fetched = match (def.fetch)(&ctx) {
        Ok(f) => f,
        Err(e) => match e.downcast::<QueryError>() {
            Ok(qe) => return Err(qe),
            Err(e) => {
                // wire trouble mid-fetch degrades to an empty result
                debug!("fetch for '{}' failed: {:?}", def.name, e);
                Fetched::empty(def.columns)
            }
        },
    };

    let Fetched { columns, rows } = fetched;
    let mut rows = match &query.where_clause {
        Some(expr) => filter::apply_where_skipping(&columns, rows, expr, def.fetch_params),
        None => rows,
    };
    if let Some(order_by) = &query.order_by {
        filter::order_rows(&columns, &mut rows, order_by);
    }
    let (columns, mut rows) = filter::project(&query.table, &query.columns, columns, rows)?;
    filter::apply_limit(&mut rows, query.limit);

    Ok(QueryOutput { columns, rows, format })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    use crate::{
        session::executor::test_support::FakeExecutor,
        tables,
    };

    fn frames_executor() -> FakeExecutor {
        let exec = FakeExecutor::bwp();
        {
            let state = exec.state();
            let mut state = state.lock().unwrap();
            state.push_frame_for_test("boot", "main.ts", 5);
            state.push_frame_for_test("work", "main.ts", 20);
        }
        exec
    }

    // End-to-end scenario: filter, order, limit, projection, and the
    // json suffix all at once.
    #[test]
    fn query_with_suffix() {
        let exec = frames_executor();
        let out = run(
            r"SELECT function, line FROM frames WHERE line > 5 ORDER BY line DESC LIMIT 1\j",
            &tables::registry(),
            &exec,
        )
        .expect("query to succeed");

        assert_eq!(out.format, OutputFormat::Json);
        assert_eq!(out.columns, vec![String::from("function"), String::from("line")]);
        assert_eq!(out.rows, vec![vec![json!("work"), json!(20)]]);
    }

    #[test]
    fn unknown_table() {
        let exec = frames_executor();
        match run("SELECT * FROM nope", &tables::registry(), &exec) {
            Err(e @ QueryError::UnknownTable(_)) => {
                assert_eq!(e.code(), "ErrUnknownTable");
                assert!(e.to_string().contains("'nope'"));
            }
            other => panic!("wrong result: {other:?}"),
        }
    }

    #[test]
    fn missing_required_filter() {
        let exec = frames_executor();
        match run("SELECT * FROM props", &tables::registry(), &exec) {
            Err(e @ QueryError::RequiredFilter { .. }) => {
                assert_eq!(e.code(), "ErrRequiredFilter");
                assert!(e.to_string().contains("object_id"));
            }
            other => panic!("wrong result: {other:?}"),
        }
    }

    #[test]
    fn unknown_projection_column() {
        let exec = frames_executor();
        match run("SELECT missing FROM frames", &tables::registry(), &exec) {
            Err(e @ QueryError::UnknownColumn { .. }) => {
                assert_eq!(e.code(), "ErrUnknownColumn");
                let msg = e.to_string();
                assert!(msg.contains("'missing'"));
                assert!(msg.contains("'frames'"));
            }
            other => panic!("wrong result: {other:?}"),
        }
    }

    #[test]
    fn tsv_output_shape() {
        let exec = frames_executor();
        let out = run("SELECT function, line FROM frames ORDER BY line ASC", &tables::registry(), &exec)
            .expect("query to succeed");
        assert_eq!(out.format, OutputFormat::Tsv);
        assert_eq!(out.to_tsv(), "function\tline\nboot\t5\nwork\t20");
    }

    #[test]
    fn null_cells_render_empty_in_tsv() {
        let out = QueryOutput {
            columns: vec![String::from("a"), String::from("b")],
            rows: vec![vec![Value::Null, json!({"k": 1})]],
            format: OutputFormat::Tsv,
        };
        assert_eq!(out.to_tsv(), "a\tb\n\t{\"k\":1}");
    }
}
