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

//! Row filtering, ordering, projection, and limiting over fetched
//! result sets. Evaluation follows SQL-ish null semantics: a missing
//! column binds NULL and no comparison against NULL holds, so such
//! rows simply drop out.

use std::cmp::Ordering;

use serde_json::Value;

use crate::{
    errors::QueryError,
    query::ast::{CmpOp, Columns, Comparison, Dir, Expr, Literal, OrderBy},
};

pub fn apply_where(columns: &[String], rows: Vec<Vec<Value>>, expr: &Expr) -> Vec<Vec<Value>> {
    apply_where_skipping(columns, rows, expr, &[])
}

/// Filter rows, treating comparisons on `skip` columns as already
/// satisfied: those are fetch inputs the table consumed before
/// producing rows.
pub fn apply_where_skipping(
    columns: &[String],
    rows: Vec<Vec<Value>>,
    expr: &Expr,
    skip: &[&str],
) -> Vec<Vec<Value>> {
    rows.into_iter().filter(|row| eval_skipping(expr, columns, row, skip)).collect()
}

pub fn eval(expr: &Expr, columns: &[String], row: &[Value]) -> bool {
    eval_skipping(expr, columns, row, &[])
}

fn eval_skipping(expr: &Expr, columns: &[String], row: &[Value], skip: &[&str]) -> bool {
    match expr {
        Expr::Cmp(c) if skip.contains(&c.column.as_str()) => true,
        Expr::Cmp(c) => eval_cmp(c, columns, row),
        Expr::And(l, r) => {
            eval_skipping(l, columns, row, skip) && eval_skipping(r, columns, row, skip)
        }
        Expr::Or(l, r) => {
            eval_skipping(l, columns, row, skip) || eval_skipping(r, columns, row, skip)
        }
        Expr::Paren(e) => eval_skipping(e, columns, row, skip),
    }
}

fn eval_cmp(cmp: &Comparison, columns: &[String], row: &[Value]) -> bool {
    let cell = match columns.iter().position(|c| c == &cmp.column) {
        Some(i) => row.get(i).unwrap_or(&Value::Null),
        None => &Value::Null,
    };
    if cell.is_null() {
        return false;
    }

    match (&cmp.op, &cmp.value) {
        (CmpOp::Like, Literal::Str(pattern)) => match cell {
            Value::String(s) => like_match(pattern, s),
            _ => like_match(pattern, &cell_text(cell)),
        },
        (CmpOp::Like, Literal::Num(_)) => false,
        (op, Literal::Num(want)) => match cell.as_f64() {
            Some(have) => ord_holds(op, have.partial_cmp(want)),
            None => false,
        },
        (op, Literal::Str(want)) => match cell {
            Value::String(have) => ord_holds(op, Some(have.as_str().cmp(want.as_str()))),
            _ => false,
        },
    }
}

fn ord_holds(op: &CmpOp, ord: Option<Ordering>) -> bool {
    let Some(ord) = ord else {
        return false;
    };
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Like => false,
    }
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translate a LIKE pattern to an anchored, case-insensitive regex.
/// `%` matches any run, `_` matches one char; everything else,
/// including regex metacharacters like `.`, matches itself.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

pub fn like_match(pattern: &str, text: &str) -> bool {
    match regex::Regex::new(&like_to_regex(pattern)) {
        Ok(re) => re.is_match(text),
        // escape() makes the translation infallible in practice
        Err(_) => false,
    }
}

/// Sort rows in place. An ORDER BY naming a column that is not in the
/// schema leaves the rows in source order.
pub fn order_rows(columns: &[String], rows: &mut [Vec<Value>], order_by: &OrderBy) {
    let Some(idx) = columns.iter().position(|c| c == &order_by.column) else {
        return;
    };
    rows.sort_by(|a, b| {
        let ord = value_cmp(
            a.get(idx).unwrap_or(&Value::Null),
            b.get(idx).unwrap_or(&Value::Null),
        );
        match order_by.dir {
            Dir::Asc => ord,
            Dir::Desc => ord.reverse(),
        }
    });
}

/// Total order over cell values for sorting: null, then booleans, then
/// numbers, then strings, then compound values by their JSON text.
fn value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (x, y) if rank(x) == rank(y) => x.to_string().cmp(&y.to_string()),
        (x, y) => rank(x).cmp(&rank(y)),
    }
}

/// Narrow rows to the requested columns. Every requested column must
/// exist in the fetched schema.
pub fn project(
    table: &str,
    requested: &Columns,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
) -> Result<(Vec<String>, Vec<Vec<Value>>), QueryError> {
    let wanted = match requested {
        Columns::Star => return Ok((columns, rows)),
        Columns::List(cols) => cols,
    };

    let mut indices = Vec::with_capacity(wanted.len());
    for col in wanted {
        match columns.iter().position(|c| c == col) {
            Some(i) => indices.push(i),
            None => {
                return Err(QueryError::UnknownColumn {
                    column: col.clone(),
                    table: String::from(table),
                });
            }
        }
    }

    let rows = rows
        .into_iter()
        .map(|row| {
            indices
                .iter()
                .map(|i| row.get(*i).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    Ok((wanted.clone(), rows))
}

pub fn apply_limit(rows: &mut Vec<Vec<Value>>, limit: Option<u64>) {
    if let Some(n) = limit {
        rows.truncate(n as usize);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::query::parse::parse;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| String::from(*s)).collect()
    }

    fn where_of(input: &str) -> Expr {
        parse(&format!("SELECT * FROM t WHERE {input}"))
            .expect("test where clause to parse")
            .where_clause
            .expect("where clause present")
    }

    #[test]
    fn comparison_ops() {
        let columns = cols(&["line"]);
        let row = vec![Value::from(20)];
        for (input, want) in [
            ("line = 20", true),
            ("line != 20", false),
            ("line > 5", true),
            ("line >= 20", true),
            ("line < 20", false),
            ("line <= 20", true),
        ] {
            assert_eq!(eval(&where_of(input), &columns, &row), want, "case {input}");
        }
    }

    #[test]
    fn short_circuit_and_or() {
        let columns = cols(&["a", "b"]);
        let row = vec![Value::from(1), Value::from("x")];
        assert!(eval(&where_of("a = 1 AND b = 'x'"), &columns, &row));
        assert!(!eval(&where_of("a = 2 AND b = 'x'"), &columns, &row));
        assert!(eval(&where_of("a = 2 OR b = 'x'"), &columns, &row));
        assert!(eval(&where_of("(a = 2 OR b = 'x') AND a = 1"), &columns, &row));
    }

    #[test]
    fn missing_column_binds_null() {
        let columns = cols(&["a"]);
        let row = vec![Value::from(1)];
        // no comparison against NULL holds, not even !=
        assert!(!eval(&where_of("nope = 1"), &columns, &row));
        assert!(!eval(&where_of("nope != 1"), &columns, &row));
        assert!(!eval(&where_of("nope LIKE '%'"), &columns, &row));
    }

    #[test]
    fn like_is_case_insensitive() {
        let columns = cols(&["file"]);
        let row = vec![Value::from("App.TS")];
        assert!(eval(&where_of("file LIKE 'app.ts'"), &columns, &row));
        assert!(eval(&where_of("file LIKE 'APP%'"), &columns, &row));
    }

    #[test]
    fn like_wildcards() {
        let columns = cols(&["file"]);
        let hit = vec![Value::from("src/main.rs")];
        assert!(eval(&where_of("file LIKE 'src/%.rs'"), &columns, &hit));
        assert!(eval(&where_of("file LIKE 'src/mai_.rs'"), &columns, &hit));
        assert!(!eval(&where_of("file LIKE 'src/mai.rs'"), &columns, &hit));
    }

    // A pattern containing `.` matches a literal dot and not any
    // character.
    #[test]
    fn like_is_literal_safe() {
        let columns = cols(&["file"]);
        let dotted = vec![Value::from("app.ts")];
        let undotted = vec![Value::from("appXts")];
        let expr = where_of("file LIKE 'app.ts'");
        assert!(eval(&expr, &columns, &dotted));
        assert!(!eval(&expr, &columns, &undotted));

        // other regex metacharacters are inert too
        let weird = vec![Value::from("a+b")];
        assert!(eval(&where_of("file LIKE 'a+b'"), &columns, &weird));
        assert!(!eval(&where_of("file LIKE 'aab'"), &columns, &weird));
    }

    // filter(R, A AND B) == filter(filter(R, A), B)
    #[test]
    fn and_decomposes_into_chained_filters() {
        let columns = cols(&["a", "b"]);
        let rows: Vec<Vec<Value>> = (0..10)
            .map(|i| vec![Value::from(i), Value::from(i % 3)])
            .collect();

        let a = where_of("a > 2");
        let b = where_of("b = 1");
        let both = where_of("a > 2 AND b = 1");

        let chained = apply_where(&columns, apply_where(&columns, rows.clone(), &a), &b);
        let combined = apply_where(&columns, rows, &both);
        assert_eq!(chained, combined);
    }

    #[test]
    fn order_by_sorts_and_is_stable() {
        let columns = cols(&["k", "tag"]);
        let mut rows = vec![
            vec![Value::from(2), Value::from("a")],
            vec![Value::from(1), Value::from("b")],
            vec![Value::from(2), Value::from("c")],
        ];
        order_rows(
            &columns,
            &mut rows,
            &OrderBy { column: String::from("k"), dir: Dir::Asc },
        );
        assert_eq!(rows[0][1], Value::from("b"));
        // equal keys keep their source order
        assert_eq!(rows[1][1], Value::from("a"));
        assert_eq!(rows[2][1], Value::from("c"));
    }

    #[test]
    fn order_by_unknown_column_is_a_noop() {
        let columns = cols(&["k"]);
        let mut rows = vec![vec![Value::from(2)], vec![Value::from(1)]];
        order_rows(
            &columns,
            &mut rows,
            &OrderBy { column: String::from("nope"), dir: Dir::Asc },
        );
        assert_eq!(rows[0][0], Value::from(2));
    }

    #[test]
    fn projection_validates_columns() {
        let columns = cols(&["a", "b"]);
        let rows = vec![vec![Value::from(1), Value::from(2)]];
        let err = project(
            "frames",
            &Columns::List(vec![String::from("missing")]),
            columns,
            rows,
        )
        .expect_err("projection of a missing column must fail");
        match err {
            QueryError::UnknownColumn { column, table } => {
                assert_eq!(column, "missing");
                assert_eq!(table, "frames");
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn projection_narrows_and_reorders() {
        let columns = cols(&["a", "b", "c"]);
        let rows = vec![vec![Value::from(1), Value::from(2), Value::from(3)]];
        let (out_cols, out_rows) = project(
            "t",
            &Columns::List(vec![String::from("c"), String::from("a")]),
            columns,
            rows,
        )
        .expect("projection to succeed");
        assert_eq!(out_cols, vec![String::from("c"), String::from("a")]);
        assert_eq!(out_rows, vec![vec![Value::from(3), Value::from(1)]]);
    }
}
