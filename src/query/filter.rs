// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter expression compiler.
//!
//! Compiles backend-style filter strings into parameterized SQLite
//! predicates over the `data` JSON column.
//!
//! # SQL Syntax Generated
//!
//! ```sql
//! json_extract(data, '$.field') = ?                 -- comparison
//! json_extract(data, '$.field') LIKE ?              -- ~ (param wrapped in %...%)
//! LOWER(json_extract(data, '$.field')) = ?          -- :lower modifier
//! json_array_length(json_extract(data, '$.f')) > ?  -- :length modifier
//! EXISTS (SELECT 1 FROM json_each(json_extract(data, '$.tags'))
//!         WHERE value LIKE ?)                       -- ?~ (any-of operators)
//! json_extract(data, '$.field') IS NULL             -- = null
//! ```
//!
//! Literals are always bound as parameters. Field names are constrained to
//! identifier characters by the lexer and everything that is not a base
//! field falls through to `json_extract`, which safely yields NULL for
//! unknown paths. Line comments (`// ...`) are stripped, and double-quoted
//! strings are accepted alongside single-quoted ones.

use std::fmt;

use time::{Month, OffsetDateTime, Time};

use crate::error::SyncError;
use crate::record::format_iso;

/// Fields stored as real columns; everything else lives in the JSON blob.
const BASE_FIELDS: &[&str] = &["id", "service"];

/// A compiled predicate: SQL text plus its bind parameters, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// A single bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Number(f64),
    Integer(i64),
}

/// Compile a filter string against the current instant.
pub fn compile(filter: &str) -> Result<CompiledFilter, SyncError> {
    compile_at(filter, OffsetDateTime::now_utc())
}

/// Compile a filter string, resolving `@`-macros against `now`.
pub fn compile_at(filter: &str, now: OffsetDateTime) -> Result<CompiledFilter, SyncError> {
    let expr = parse(filter)?;
    Ok(expr.to_sql(now))
}

/// Parse a filter string into its AST without generating SQL.
pub fn parse(filter: &str) -> Result<Expr, SyncError> {
    let tokens = lex(filter)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SyncError::Filter(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Cmp(Box<Cmp>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cmp {
    pub lhs: Operand,
    pub op: CmpOp,
    pub rhs: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(FieldRef),
    Literal(Lit),
    Macro(MacroKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub path: Vec<String>,
    pub modifier: Option<Modifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Lower,
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    AnyEq,
    AnyNe,
    AnyGt,
    AnyGe,
    AnyLt,
    AnyLe,
    AnyLike,
    AnyNotLike,
}

impl CmpOp {
    fn from_symbol(sym: &str) -> Option<Self> {
        Some(match sym {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "~" => Self::Like,
            "!~" => Self::NotLike,
            "?=" => Self::AnyEq,
            "?!=" => Self::AnyNe,
            "?>" => Self::AnyGt,
            "?>=" => Self::AnyGe,
            "?<" => Self::AnyLt,
            "?<=" => Self::AnyLe,
            "?~" => Self::AnyLike,
            "?!~" => Self::AnyNotLike,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "~",
            Self::NotLike => "!~",
            Self::AnyEq => "?=",
            Self::AnyNe => "?!=",
            Self::AnyGt => "?>",
            Self::AnyGe => "?>=",
            Self::AnyLt => "?<",
            Self::AnyLe => "?<=",
            Self::AnyLike => "?~",
            Self::AnyNotLike => "?!~",
        }
    }

    fn is_any(self) -> bool {
        matches!(
            self,
            Self::AnyEq
                | Self::AnyNe
                | Self::AnyGt
                | Self::AnyGe
                | Self::AnyLt
                | Self::AnyLe
                | Self::AnyLike
                | Self::AnyNotLike
        )
    }

    /// The plain comparison this operator applies element-wise (for any-of
    /// variants) or directly.
    fn base_sql(self) -> &'static str {
        match self {
            Self::Eq | Self::AnyEq => "=",
            Self::Ne | Self::AnyNe => "!=",
            Self::Gt | Self::AnyGt => ">",
            Self::Ge | Self::AnyGe => ">=",
            Self::Lt | Self::AnyLt => "<",
            Self::Le | Self::AnyLe => "<=",
            Self::Like | Self::AnyLike => "LIKE",
            Self::NotLike | Self::AnyNotLike => "NOT LIKE",
        }
    }

    fn is_like(self) -> bool {
        matches!(self, Self::Like | Self::NotLike | Self::AnyLike | Self::AnyNotLike)
    }
}

/// `@`-macros resolved at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Now,
    TodayStart,
    TodayEnd,
    Yesterday,
    Tomorrow,
    MonthStart,
    MonthEnd,
    YearStart,
    YearEnd,
    Second,
    Minute,
    Hour,
    Day,
    Weekday,
    Month,
    Year,
}

impl MacroKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "now" => Self::Now,
            "todayStart" => Self::TodayStart,
            "todayEnd" => Self::TodayEnd,
            "yesterday" => Self::Yesterday,
            "tomorrow" => Self::Tomorrow,
            "monthStart" => Self::MonthStart,
            "monthEnd" => Self::MonthEnd,
            "yearStart" => Self::YearStart,
            "yearEnd" => Self::YearEnd,
            "second" => Self::Second,
            "minute" => Self::Minute,
            "hour" => Self::Hour,
            "day" => Self::Day,
            "weekday" => Self::Weekday,
            "month" => Self::Month,
            "year" => Self::Year,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::TodayStart => "todayStart",
            Self::TodayEnd => "todayEnd",
            Self::Yesterday => "yesterday",
            Self::Tomorrow => "tomorrow",
            Self::MonthStart => "monthStart",
            Self::MonthEnd => "monthEnd",
            Self::YearStart => "yearStart",
            Self::YearEnd => "yearEnd",
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Weekday => "weekday",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    fn value(self, now: OffsetDateTime) -> SqlParam {
        let end_of_day = Time::from_hms_milli(23, 59, 59, 999).unwrap_or(Time::MIDNIGHT);
        match self {
            Self::Now => SqlParam::Text(format_iso(now)),
            Self::TodayStart => SqlParam::Text(format_iso(now.replace_time(Time::MIDNIGHT))),
            Self::TodayEnd => SqlParam::Text(format_iso(now.replace_time(end_of_day))),
            Self::Yesterday => SqlParam::Text(format_iso(now - time::Duration::days(1))),
            Self::Tomorrow => SqlParam::Text(format_iso(now + time::Duration::days(1))),
            Self::MonthStart => {
                let dt = now.replace_day(1).unwrap_or(now).replace_time(Time::MIDNIGHT);
                SqlParam::Text(format_iso(dt))
            }
            Self::MonthEnd => {
                let last = time::util::days_in_year_month(now.year(), now.month());
                let dt = now.replace_day(last).unwrap_or(now).replace_time(end_of_day);
                SqlParam::Text(format_iso(dt))
            }
            Self::YearStart => {
                let dt = now
                    .replace_month(Month::January)
                    .and_then(|d| d.replace_day(1))
                    .unwrap_or(now)
                    .replace_time(Time::MIDNIGHT);
                SqlParam::Text(format_iso(dt))
            }
            Self::YearEnd => {
                let dt = now
                    .replace_month(Month::December)
                    .and_then(|d| d.replace_day(31))
                    .unwrap_or(now)
                    .replace_time(end_of_day);
                SqlParam::Text(format_iso(dt))
            }
            Self::Second => SqlParam::Integer(i64::from(now.second())),
            Self::Minute => SqlParam::Integer(i64::from(now.minute())),
            Self::Hour => SqlParam::Integer(i64::from(now.hour())),
            Self::Day => SqlParam::Integer(i64::from(now.day())),
            Self::Weekday => SqlParam::Integer(i64::from(now.weekday().number_days_from_sunday())),
            Self::Month => SqlParam::Integer(i64::from(u8::from(now.month()))),
            Self::Year => SqlParam::Integer(i64::from(now.year())),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    MacroTok(String),
    Op(String),
    LParen,
    RParen,
    AndOp,
    OrOp,
    Dot,
    Colon,
}

fn lex(input: &str) -> Result<Vec<Token>, SyncError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                // Line comment: skip to end of line.
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndOp);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOp);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        text.push(chars[i + 1]);
                        i += 2;
                    } else if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    } else {
                        text.push(ch);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(SyncError::Filter("unterminated string literal".into()));
                }
                tokens.push(Token::Str(text));
            }
            '@' => {
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if start == i {
                    return Err(SyncError::Filter("dangling '@'".into()));
                }
                tokens.push(Token::MacroTok(chars[start..i].iter().collect()));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot only continues the number when followed by a digit,
                    // so "5.tags" lexes as Number(5), Dot, Ident.
                    if chars[i] == '.'
                        && !chars.get(i + 1).is_some_and(char::is_ascii_digit)
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| SyncError::Filter(format!("bad number literal '{text}'")))?;
                tokens.push(Token::Number(num));
            }
            '-' if chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| SyncError::Filter(format!("bad number literal '{text}'")))?;
                tokens.push(Token::Number(num));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "AND" => tokens.push(Token::AndOp),
                    "OR" => tokens.push(Token::OrOp),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                // Longest-match operator lexing.
                let rest: String = chars[i..].iter().take(3).collect();
                let mut matched = None;
                for len in (1..=rest.chars().count().min(3)).rev() {
                    let candidate: String = rest.chars().take(len).collect();
                    if CmpOp::from_symbol(&candidate).is_some() {
                        matched = Some(candidate);
                        break;
                    }
                }
                match matched {
                    Some(op) => {
                        i += op.chars().count();
                        tokens.push(Token::Op(op));
                    }
                    None => {
                        return Err(SyncError::Filter(format!(
                            "unexpected character '{c}' at offset {i}"
                        )))
                    }
                }
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, wanted: &Token) -> Result<(), SyncError> {
        match self.next() {
            Some(ref tok) if tok == wanted => Ok(()),
            other => Err(SyncError::Filter(format!(
                "expected {wanted:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, SyncError> {
        let mut parts = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::OrOp)) {
            self.next();
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Expr::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, SyncError> {
        let mut parts = vec![self.parse_cmp()?];
        while matches!(self.peek(), Some(Token::AndOp)) {
            self.next();
            parts.push(self.parse_cmp()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            Expr::And(parts)
        })
    }

    fn parse_cmp(&mut self) -> Result<Expr, SyncError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Op(sym)) => CmpOp::from_symbol(&sym)
                .ok_or_else(|| SyncError::Filter(format!("unknown operator '{sym}'")))?,
            other => {
                return Err(SyncError::Filter(format!(
                    "expected comparison operator, found {other:?}"
                )))
            }
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Cmp(Box::new(Cmp { lhs, op, rhs })))
    }

    fn parse_operand(&mut self) -> Result<Operand, SyncError> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Operand::Literal(Lit::Str(text))),
            Some(Token::Number(num)) => Ok(Operand::Literal(Lit::Num(num))),
            Some(Token::MacroTok(name)) => MacroKind::from_name(&name)
                .map(Operand::Macro)
                .ok_or_else(|| SyncError::Filter(format!("unknown macro '@{name}'"))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Operand::Literal(Lit::Bool(true))),
                "false" => Ok(Operand::Literal(Lit::Bool(false))),
                "null" => Ok(Operand::Literal(Lit::Null)),
                _ => self.parse_field_tail(word),
            },
            other => Err(SyncError::Filter(format!(
                "expected operand, found {other:?}"
            ))),
        }
    }

    fn parse_field_tail(&mut self, head: String) -> Result<Operand, SyncError> {
        let mut path = vec![head];
        while matches!(self.peek(), Some(Token::Dot)) {
            self.next();
            match self.next() {
                Some(Token::Ident(part)) => path.push(part),
                Some(Token::Number(num)) if num.fract() == 0.0 && num >= 0.0 => {
                    // Array index segments like "tags.0".
                    path.push(format!("{}", num as u64));
                }
                other => {
                    return Err(SyncError::Filter(format!(
                        "expected field segment after '.', found {other:?}"
                    )))
                }
            }
        }
        let mut modifier = None;
        if matches!(self.peek(), Some(Token::Colon)) {
            self.next();
            modifier = match self.next() {
                Some(Token::Ident(word)) if word == "lower" => Some(Modifier::Lower),
                Some(Token::Ident(word)) if word == "length" => Some(Modifier::Length),
                other => {
                    return Err(SyncError::Filter(format!(
                        "unknown field modifier {other:?}"
                    )))
                }
            };
        }
        Ok(Operand::Field(FieldRef { path, modifier }))
    }
}

// ---------------------------------------------------------------------------
// SQL generation
// ---------------------------------------------------------------------------

impl Expr {
    /// Translate to a parameterized SQLite predicate, resolving macros
    /// against `now`.
    #[must_use]
    pub fn to_sql(&self, now: OffsetDateTime) -> CompiledFilter {
        let mut params = Vec::new();
        let sql = self.emit(now, &mut params);
        CompiledFilter { sql, params }
    }

    fn emit(&self, now: OffsetDateTime, params: &mut Vec<SqlParam>) -> String {
        match self {
            Self::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.emit(now, params)).collect();
                format!("({})", rendered.join(" AND "))
            }
            Self::Or(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.emit(now, params)).collect();
                format!("({})", rendered.join(" OR "))
            }
            Self::Cmp(cmp) => cmp.emit(now, params),
        }
    }
}

impl Cmp {
    fn emit(&self, now: OffsetDateTime, params: &mut Vec<SqlParam>) -> String {
        // Null comparisons compile to IS [NOT] NULL regardless of side.
        if let Operand::Literal(Lit::Null) = self.rhs {
            return self.emit_null(&self.lhs, now, params);
        }
        if let Operand::Literal(Lit::Null) = self.lhs {
            return self.emit_null(&self.rhs, now, params);
        }

        if self.op.is_any() {
            let lhs_sql = operand_sql(&self.lhs, now, params);
            let rhs_sql = value_sql(&self.rhs, self.op, now, params);
            return format!(
                "EXISTS (SELECT 1 FROM json_each({lhs_sql}) WHERE value {} {rhs_sql})",
                self.op.base_sql()
            );
        }

        let lhs_sql = operand_sql(&self.lhs, now, params);
        let rhs_sql = value_sql(&self.rhs, self.op, now, params);
        format!("{lhs_sql} {} {rhs_sql}", self.op.base_sql())
    }

    fn emit_null(
        &self,
        side: &Operand,
        now: OffsetDateTime,
        params: &mut Vec<SqlParam>,
    ) -> String {
        match side {
            // null vs null: equality holds, anything else does not.
            Operand::Literal(Lit::Null) => match self.op {
                CmpOp::Eq => "1 = 1".into(),
                _ => "1 = 0".into(),
            },
            other => {
                let sql = operand_sql(other, now, params);
                match self.op {
                    CmpOp::Ne | CmpOp::NotLike | CmpOp::AnyNe | CmpOp::AnyNotLike => {
                        format!("{sql} IS NOT NULL")
                    }
                    _ => format!("{sql} IS NULL"),
                }
            }
        }
    }
}

/// Render an operand in value position: literals and macros become bound
/// placeholders, fields become column expressions.
fn value_sql(
    operand: &Operand,
    op: CmpOp,
    now: OffsetDateTime,
    params: &mut Vec<SqlParam>,
) -> String {
    match operand {
        Operand::Field(_) => operand_sql(operand, now, params),
        Operand::Literal(lit) => {
            params.push(literal_param(lit, op));
            "?".into()
        }
        Operand::Macro(kind) => {
            let mut param = kind.value(now);
            if op.is_like() {
                if let SqlParam::Text(ref text) = param {
                    param = SqlParam::Text(format!("%{text}%"));
                }
            }
            params.push(param);
            "?".into()
        }
    }
}

fn literal_param(lit: &Lit, op: CmpOp) -> SqlParam {
    match lit {
        Lit::Str(text) if op.is_like() => SqlParam::Text(format!("%{text}%")),
        Lit::Str(text) => SqlParam::Text(text.clone()),
        Lit::Num(num) if op.is_like() => SqlParam::Text(format!("%{num}%")),
        Lit::Num(num) => SqlParam::Number(*num),
        // JSON booleans extract as 1/0 in SQLite.
        Lit::Bool(b) => SqlParam::Integer(i64::from(*b)),
        Lit::Null => SqlParam::Text(String::new()),
    }
}

fn operand_sql(operand: &Operand, now: OffsetDateTime, params: &mut Vec<SqlParam>) -> String {
    match operand {
        Operand::Field(field) => field_sql(field),
        Operand::Literal(lit) => {
            params.push(literal_param(lit, CmpOp::Eq));
            "?".into()
        }
        Operand::Macro(kind) => {
            params.push(kind.value(now));
            "?".into()
        }
    }
}

/// Translate a field reference: base fields map to their columns, everything
/// else goes through `json_extract` on the data blob.
#[must_use]
pub fn field_sql(field: &FieldRef) -> String {
    let base = if field.path.len() == 1 && BASE_FIELDS.contains(&field.path[0].as_str()) {
        field.path[0].clone()
    } else {
        format!("json_extract(data,'$.{}')", field.path.join("."))
    };
    match field.modifier {
        Some(Modifier::Lower) => format!("LOWER({base})"),
        Some(Modifier::Length) => format!("json_array_length({base})"),
        None => base,
    }
}

// ---------------------------------------------------------------------------
// Unparse (round-trip support)
// ---------------------------------------------------------------------------

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "({})", rendered.join(" && "))
            }
            Self::Or(parts) => {
                let rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "({})", rendered.join(" || "))
            }
            Self::Cmp(cmp) => write!(f, "{} {} {}", cmp.lhs, cmp.op.symbol(), cmp.rhs),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => {
                write!(f, "{}", field.path.join("."))?;
                match field.modifier {
                    Some(Modifier::Lower) => write!(f, ":lower"),
                    Some(Modifier::Length) => write!(f, ":length"),
                    None => Ok(()),
                }
            }
            Self::Literal(Lit::Str(text)) => write!(f, "'{}'", text.replace('\'', "\\'")),
            Self::Literal(Lit::Num(num)) => write!(f, "{num}"),
            Self::Literal(Lit::Bool(b)) => write!(f, "{b}"),
            Self::Literal(Lit::Null) => write!(f, "null"),
            Self::Macro(kind) => write!(f, "@{}", kind.name()),
        }
    }
}
