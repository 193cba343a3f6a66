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

use std::fmt;

/// A parsed query. The grammar is the `SELECT <cols> FROM <table>
/// [WHERE <expr>] [ORDER BY <col> [ASC|DESC]] [LIMIT <n>]` subset; no
/// joins, no aggregation, one table per query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub columns: Columns,
    pub table: String,
    pub where_clause: Option<Expr>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Columns {
    Star,
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub dir: Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Asc,
    Desc,
}

/// OR binds loosest, then AND, then comparison; parentheses are kept
/// in the tree so the formatter can reproduce the input shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp(Comparison),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: CmpOp,
    pub value: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Num(f64),
    Str(String),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s.as_str()),
            Literal::Num(_) => None,
        }
    }

    /// The literal as a display string, for filters that accept either
    /// form (script_id = 2 and script_id = '2' should both work).
    pub fn to_text(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            Literal::Num(n) => fmt_num(*n),
        }
    }
}

impl Expr {
    /// True if the expression constrains `column` with an equality
    /// somewhere along a pure AND/paren spine. An equality under an OR
    /// branch does not count: the branch may not hold for every row,
    /// so it cannot satisfy a required filter.
    pub fn has_eq(&self, column: &str) -> bool {
        match self {
            Expr::Cmp(c) => c.op == CmpOp::Eq && c.column == column,
            Expr::And(l, r) => l.has_eq(column) || r.has_eq(column),
            Expr::Paren(e) => e.has_eq(column),
            Expr::Or(_, _) => false,
        }
    }

    /// The literal bound to `column` by an equality along the AND/paren
    /// spine, if any.
    pub fn eq_value(&self, column: &str) -> Option<&Literal> {
        match self {
            Expr::Cmp(c) if c.op == CmpOp::Eq && c.column == column => Some(&c.value),
            Expr::And(l, r) => l.eq_value(column).or_else(|| r.eq_value(column)),
            Expr::Paren(e) => e.eq_value(column),
            _ => None,
        }
    }

    /// Every comparison mentioning `column` along the AND/paren spine.
    /// Tables that pre-filter at fetch time (like `source` matching
    /// files) use this to honor LIKE as well as equality.
    pub fn comparisons_for<'a>(&'a self, column: &str, out: &mut Vec<&'a Comparison>) {
        match self {
            Expr::Cmp(c) if c.column == column => out.push(c),
            Expr::And(l, r) => {
                l.comparisons_for(column, out);
                r.comparisons_for(column, out);
            }
            Expr::Paren(e) => e.comparisons_for(column, out),
            _ => {}
        }
    }
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn fmt_str(s: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "'")?;
    for c in s.chars() {
        match c {
            '\'' | '\\' => write!(f, "\\{c}")?,
            _ => write!(f, "{c}")?,
        }
    }
    write!(f, "'")
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Num(n) => write!(f, "{}", fmt_num(*n)),
            Literal::Str(s) => fmt_str(s, f),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Like => "LIKE",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Cmp(c) => write!(f, "{} {} {}", c.column, c.op, c.value),
            Expr::And(l, r) => write!(f, "{l} AND {r}"),
            Expr::Or(l, r) => write!(f, "{l} OR {r}"),
            Expr::Paren(e) => write!(f, "({e})"),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        match &self.columns {
            Columns::Star => write!(f, "*")?,
            Columns::List(cols) => write!(f, "{}", cols.join(", "))?,
        }
        write!(f, " FROM {}", self.table)?;
        if let Some(w) = &self.where_clause {
            write!(f, " WHERE {w}")?;
        }
        if let Some(o) = &self.order_by {
            let dir = match o.dir {
                Dir::Asc => "ASC",
                Dir::Desc => "DESC",
            };
            write!(f, " ORDER BY {} {}", o.column, dir)?;
        }
        if let Some(n) = self.limit {
            write!(f, " LIMIT {n}")?;
        }
        Ok(())
    }
}
