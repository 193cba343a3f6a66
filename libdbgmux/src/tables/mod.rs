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

//! The virtual table definitions, split by archetype: state-reflecting
//! tables read session state without io, wire tables issue protocol
//! requests on demand, and store tables run SQL over the event log.

use serde_json::Value;

use crate::query::{
    ast::{CmpOp, Comparison, Expr},
    filter::like_match,
    registry::{FetchCtx, Registry},
};

pub mod state;
pub mod store;
pub mod wire;

/// Build the full registry the daemon serves queries from.
pub fn registry() -> Registry {
    let mut reg = Registry::new();
    state::register(&mut reg);
    wire::register(&mut reg);
    store::register(&mut reg);
    reg
}

pub(crate) fn cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| String::from(*s)).collect()
}

/// The text bound to `column` by an equality on the WHERE clause, in
/// either literal form (`id = 2` and `id = '2'` are the same filter).
pub(crate) fn eq_text(ctx: &FetchCtx, column: &str) -> Option<String> {
    ctx.where_clause.and_then(|w| w.eq_value(column)).map(|lit| lit.to_text())
}

/// A predicate over a column built from the WHERE clause's equality
/// and LIKE comparisons, for tables that pre-filter at fetch time.
/// Other operators are left for the post-fetch filter pass.
pub(crate) fn text_predicate(
    where_clause: Option<&Expr>,
    column: &str,
) -> impl Fn(&str) -> bool + use<> {
    let comparisons: Vec<Comparison> = match where_clause {
        Some(w) => {
            let mut out = vec![];
            w.comparisons_for(column, &mut out);
            out.into_iter().cloned().collect()
        }
        None => vec![],
    };
    move |text: &str| {
        comparisons.iter().all(|c| match c.op {
            CmpOp::Eq => c.value.to_text() == text,
            CmpOp::Like => c.value.as_str().map(|p| like_match(p, text)).unwrap_or(false),
            _ => true,
        })
    }
}

pub(crate) fn opt_str(v: &Option<String>) -> Value {
    v.clone().map(Value::from).unwrap_or(Value::Null)
}
