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

use std::collections::HashMap;

use serde_json::Value;

use crate::{
    errors::QueryError,
    query::ast::Expr,
    session::{Protocol, executor::Executor},
};

/// What a table's fetch hands back: a schema plus rows. The schema
/// usually matches the static definition but store-backed tables may
/// shape it from their SQL.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Fetched {
    /// An empty result carrying the table's static schema. On-demand
    /// tables answer with this when the wire call fails.
    pub fn empty(columns: &[&str]) -> Fetched {
        Fetched {
            columns: columns.iter().map(|c| String::from(*c)).collect(),
            rows: vec![],
        }
    }
}

pub struct FetchCtx<'a> {
    pub where_clause: Option<&'a Expr>,
    pub executor: &'a dyn Executor,
}

pub type FetchFn = fn(&FetchCtx) -> anyhow::Result<Fetched>;

/// A virtual table definition. Definitions are static data plus a
/// fetch function; the same name may be registered several times with
/// different protocol gates.
#[derive(Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// Columns that must appear under an equality comparison in the
    /// WHERE clause before the fetch will be attempted.
    pub required_filters: &'static [&'static str],
    /// Columns the fetch interprets as inputs (object ids, addresses,
    /// frame selectors). Comparisons on these are consumed at fetch
    /// time and skipped by the post-fetch filter pass, since they are
    /// not meaningful against the produced rows.
    pub fetch_params: &'static [&'static str],
    /// None means the table is available to every session protocol.
    pub protocols: Option<&'static [Protocol]>,
    pub fetch: FetchFn,
}

#[derive(Default)]
pub struct Registry {
    tables: HashMap<&'static str, Vec<TableDef>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registration order is lookup order for a given name.
    pub fn register(&mut self, def: TableDef) {
        self.tables.entry(def.name).or_default().push(def);
    }

    /// Resolve a table for a session protocol. A name with no entry at
    /// all is distinguished from a name whose every entry is gated to
    /// some other protocol.
    pub fn lookup(&self, name: &str, protocol: Protocol) -> Result<&TableDef, QueryError> {
        let defs = self
            .tables
            .get(name)
            .ok_or_else(|| QueryError::UnknownTable(String::from(name)))?;
        defs.iter()
            .find(|d| d.protocols.map(|ps| ps.contains(&protocol)).unwrap_or(true))
            .ok_or(QueryError::NotAvailableForProtocol { name: String::from(name), protocol })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Check that every required filter is bound by an equality on the
/// WHERE clause's AND/paren spine.
pub fn check_required_filters(
    def: &TableDef,
    where_clause: Option<&Expr>,
) -> Result<(), QueryError> {
    for col in def.required_filters {
        let bound = where_clause.map(|w| w.has_eq(col)).unwrap_or(false);
        if !bound {
            return Err(QueryError::RequiredFilter {
                table: String::from(def.name),
                column: String::from(*col),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::query::parse::parse;

    fn noop_fetch(_: &FetchCtx) -> anyhow::Result<Fetched> {
        Ok(Fetched::default())
    }

    fn def(
        name: &'static str,
        protocols: Option<&'static [Protocol]>,
        required: &'static [&'static str],
    ) -> TableDef {
        TableDef {
            name,
            columns: &["a"],
            required_filters: required,
            fetch_params: required,
            protocols,
            fetch: noop_fetch,
        }
    }

    #[test]
    fn lookup_dispatch() {
        let mut reg = Registry::new();
        reg.register(def("everywhere", None, &[]));
        reg.register(def("browser_only", Some(&[Protocol::Bwp]), &[]));
        reg.register(def("native_only", Some(&[Protocol::Ndap]), &[]));

        assert!(reg.lookup("everywhere", Protocol::Bwp).is_ok());
        assert!(reg.lookup("everywhere", Protocol::Ndap).is_ok());
        assert!(reg.lookup("browser_only", Protocol::Bwp).is_ok());

        // name exists but protocol does not match
        match reg.lookup("browser_only", Protocol::Ndap) {
            Err(QueryError::NotAvailableForProtocol { name, protocol }) => {
                assert_eq!(name, "browser_only");
                assert_eq!(protocol, Protocol::Ndap);
            }
            other => panic!("wrong result: {other:?}", other = other.map(|d| d.name)),
        }

        // name missing entirely
        match reg.lookup("nope", Protocol::Bwp) {
            Err(QueryError::UnknownTable(name)) => assert_eq!(name, "nope"),
            other => panic!("wrong result: {other:?}", other = other.map(|d| d.name)),
        }
    }

    #[test]
    fn same_name_multiple_protocols() {
        let mut reg = Registry::new();
        reg.register(def("source", Some(&[Protocol::Bwp]), &[]));
        reg.register(def("source", Some(&[Protocol::Ndap]), &[]));

        let bwp = reg.lookup("source", Protocol::Bwp).expect("bwp entry");
        let ndap = reg.lookup("source", Protocol::Ndap).expect("ndap entry");
        assert_eq!(bwp.protocols, Some(&[Protocol::Bwp][..]));
        assert_eq!(ndap.protocols, Some(&[Protocol::Ndap][..]));
    }

    fn where_of(input: &str) -> Option<crate::query::ast::Expr> {
        parse(&format!("SELECT * FROM t WHERE {input}")).expect("parse").where_clause
    }

    #[test]
    fn required_filter_gating() {
        let d = def("props", None, &["object_id"]);

        // plain equality satisfies the gate, including under parens
        // and mixed into an AND chain
        for ok in ["object_id = '4'", "(object_id = '4')", "a = 1 AND object_id = '4'"] {
            let w = where_of(ok);
            assert!(check_required_filters(&d, w.as_ref()).is_ok(), "case {ok}");
        }

        // missing entirely, under an OR branch, or bound with a
        // non-equality op: all rejected
        let missing: Vec<Option<crate::query::ast::Expr>> = vec![
            None,
            where_of("a = 1"),
            where_of("object_id != '4'"),
            where_of("object_id LIKE '4'"),
            where_of("object_id = '4' OR a = 1"),
            where_of("(object_id = '4' OR a = 1)"),
        ];
        for w in missing {
            match check_required_filters(&d, w.as_ref()) {
                Err(QueryError::RequiredFilter { table, column }) => {
                    assert_eq!(table, "props");
                    assert_eq!(column, "object_id");
                }
                Ok(()) => panic!("expected required-filter error for {w:?}"),
                Err(other) => panic!("wrong error: {other:?}"),
            }
        }
    }
}
