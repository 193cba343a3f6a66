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

//! A hand written tokenizer and recursive descent parser for the query
//! subset. Both are pure: same input, same output, no side effects.

use crate::{
    errors::QueryError,
    query::ast::{CmpOp, Columns, Comparison, Dir, Expr, Literal, OrderBy, Query},
};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Kw(Kw),
    Comma,
    LParen,
    RParen,
    Star,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Keywords are reserved: an identifier spelled like one of these (in
/// any case) always lexes as the keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kw {
    Select,
    From,
    Where,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    And,
    Or,
    Like,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier '{s}'"),
            Tok::Num(n) => format!("number {n}"),
            Tok::Str(s) => format!("string '{s}'"),
            Tok::Kw(k) => format!("keyword {k:?}").to_uppercase(),
            Tok::Comma => String::from("','"),
            Tok::LParen => String::from("'('"),
            Tok::RParen => String::from("')'"),
            Tok::Star => String::from("'*'"),
            Tok::Eq => String::from("'='"),
            Tok::Ne => String::from("'!='"),
            Tok::Lt => String::from("'<'"),
            Tok::Le => String::from("'<='"),
            Tok::Gt => String::from("'>'"),
            Tok::Ge => String::from("'>='"),
        }
    }
}

fn keyword(ident: &str) -> Option<Kw> {
    match ident.to_ascii_uppercase().as_str() {
        "SELECT" => Some(Kw::Select),
        "FROM" => Some(Kw::From),
        "WHERE" => Some(Kw::Where),
        "ORDER" => Some(Kw::Order),
        "BY" => Some(Kw::By),
        "ASC" => Some(Kw::Asc),
        "DESC" => Some(Kw::Desc),
        "LIMIT" => Some(Kw::Limit),
        "AND" => Some(Kw::And),
        "OR" => Some(Kw::Or),
        "LIKE" => Some(Kw::Like),
        _ => None,
    }
}

fn err_at(offset: usize, token: impl Into<String>) -> QueryError {
    QueryError::Parse { offset, token: token.into() }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Tok)>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            ',' => {
                toks.push((start, Tok::Comma));
                i += 1;
            }
            '(' => {
                toks.push((start, Tok::LParen));
                i += 1;
            }
            ')' => {
                toks.push((start, Tok::RParen));
                i += 1;
            }
            '*' => {
                toks.push((start, Tok::Star));
                i += 1;
            }
            '=' => {
                toks.push((start, Tok::Eq));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push((start, Tok::Ne));
                    i += 2;
                } else {
                    return Err(err_at(start, "'!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push((start, Tok::Le));
                    i += 2;
                } else {
                    toks.push((start, Tok::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push((start, Tok::Ge));
                    i += 2;
                } else {
                    toks.push((start, Tok::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err_at(start, "unterminated string")),
                        Some('\\') => match chars.get(i + 1) {
                            None => return Err(err_at(start, "unterminated string")),
                            Some(escaped) => {
                                s.push(*escaped);
                                i += 2;
                            }
                        },
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                toks.push((start, Tok::Str(s)));
            }
            '-' | '0'..='9' => {
                if c == '-' && !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    return Err(err_at(start, "'-'"));
                }
                let mut s = String::new();
                s.push(c);
                i += 1;
                let mut seen_dot = false;
                while let Some(ch) = chars.get(i) {
                    if ch.is_ascii_digit() {
                        s.push(*ch);
                        i += 1;
                    } else if *ch == '.' && !seen_dot {
                        seen_dot = true;
                        s.push(*ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                let n: f64 = s.parse().map_err(|_| err_at(start, format!("'{s}'")))?;
                toks.push((start, Tok::Num(n)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(ch) = chars.get(i) {
                    if ch.is_ascii_alphanumeric() || *ch == '_' {
                        s.push(*ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                match keyword(&s) {
                    Some(kw) => toks.push((start, Tok::Kw(kw))),
                    None => toks.push((start, Tok::Ident(s))),
                }
            }
            other => return Err(err_at(start, format!("'{other}'"))),
        }
    }

    Ok(toks)
}

struct Parser {
    toks: Vec<(usize, Tok)>,
    pos: usize,
    end_offset: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.toks.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end_offset)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn unexpected(&self) -> QueryError {
        match self.toks.get(self.pos) {
            Some((offset, tok)) => err_at(*offset, tok.describe()),
            None => err_at(self.end_offset, "end of input"),
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> Result<(), QueryError> {
        match self.peek() {
            Some(Tok::Kw(k)) if *k == kw => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected()),
        }
    }

    fn expect_ident(&mut self) -> Result<String, QueryError> {
        match self.peek() {
            Some(Tok::Ident(_)) => match self.next() {
                Some(Tok::Ident(s)) => Ok(s),
                _ => unreachable!("peeked an ident"),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn parse_query(&mut self) -> Result<Query, QueryError> {
        self.expect_kw(Kw::Select)?;

        let columns = if let Some(Tok::Star) = self.peek() {
            self.pos += 1;
            Columns::Star
        } else {
            let mut cols = vec![self.expect_ident()?];
            while let Some(Tok::Comma) = self.peek() {
                self.pos += 1;
                cols.push(self.expect_ident()?);
            }
            Columns::List(cols)
        };

        self.expect_kw(Kw::From)?;
        let table = self.expect_ident()?;

        let mut where_clause = None;
        if let Some(Tok::Kw(Kw::Where)) = self.peek() {
            self.pos += 1;
            where_clause = Some(self.parse_or()?);
        }

        let mut order_by = None;
        if let Some(Tok::Kw(Kw::Order)) = self.peek() {
            self.pos += 1;
            self.expect_kw(Kw::By)?;
            let column = self.expect_ident()?;
            let dir = match self.peek() {
                Some(Tok::Kw(Kw::Asc)) => {
                    self.pos += 1;
                    Dir::Asc
                }
                Some(Tok::Kw(Kw::Desc)) => {
                    self.pos += 1;
                    Dir::Desc
                }
                _ => Dir::Asc,
            };
            order_by = Some(OrderBy { column, dir });
        }

        let mut limit = None;
        if let Some(Tok::Kw(Kw::Limit)) = self.peek() {
            self.pos += 1;
            let offset = self.offset();
            match self.next() {
                Some(Tok::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                    limit = Some(n as u64);
                }
                Some(tok) => return Err(err_at(offset, tok.describe())),
                None => return Err(err_at(offset, "end of input")),
            }
        }

        if self.peek().is_some() {
            return Err(self.unexpected());
        }

        Ok(Query { columns, table, where_clause, order_by, limit })
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_and()?;
        while let Some(Tok::Kw(Kw::Or)) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_cmp()?;
        while let Some(Tok::Kw(Kw::And)) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, QueryError> {
        if let Some(Tok::LParen) = self.peek() {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.peek() {
                Some(Tok::RParen) => {
                    self.pos += 1;
                    Ok(Expr::Paren(Box::new(inner)))
                }
                _ => Err(self.unexpected()),
            }
        } else {
            let column = self.expect_ident()?;
            let op = match self.peek() {
                Some(Tok::Eq) => CmpOp::Eq,
                Some(Tok::Ne) => CmpOp::Ne,
                Some(Tok::Lt) => CmpOp::Lt,
                Some(Tok::Le) => CmpOp::Le,
                Some(Tok::Gt) => CmpOp::Gt,
                Some(Tok::Ge) => CmpOp::Ge,
                Some(Tok::Kw(Kw::Like)) => CmpOp::Like,
                _ => return Err(self.unexpected()),
            };
            self.pos += 1;
            let offset = self.offset();
            let value = match self.next() {
                Some(Tok::Num(n)) => Literal::Num(n),
                Some(Tok::Str(s)) => Literal::Str(s),
                Some(tok) => return Err(err_at(offset, tok.describe())),
                None => return Err(err_at(offset, "end of input")),
            };
            Ok(Expr::Cmp(Comparison { column, op, value }))
        }
    }
}

pub fn parse(input: &str) -> Result<Query, QueryError> {
    let toks = tokenize(input)?;
    let mut parser = Parser { toks, pos: 0, end_offset: input.chars().count() };
    parser.parse_query()
}
