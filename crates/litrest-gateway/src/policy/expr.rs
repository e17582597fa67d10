//! Restricted policy predicate language
//!
//! Deliberately narrower than SQL: column and literal atoms, principal
//! functions, comparisons, IN, IS [NOT] NULL, AND/OR/NOT, parentheses.
//! Expressions parse to a closed AST; SQL emission walks the tree and binds
//! every literal and every principal attribute as a parameter. Policy text
//! is never spliced into a query.

use rusqlite::types::Value;

use litrest_common::{quote_ident, validate_ident, GatewayError, Result};

use crate::auth::Principal;
use crate::engine::schema::TableSchema;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        }
    }
}

/// Policy expression tree. The node set is closed on purpose; see the
/// emitter and evaluator for the two walks over it.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
    CurrentUserId,
    CurrentRole,
    CurrentTenantId,
    HasRole(String),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    InList {
        needle: Box<Expr>,
        items: Vec<Expr>,
    },
    IsNull {
        operand: Box<Expr>,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Parse policy text into an expression tree
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(GatewayError::Validation(format!(
                "unexpected trailing input in policy expression: {input}"
            )));
        }
        Ok(expr)
    }

    /// Render to SQL with bound parameters, validating column references
    /// against the target table.
    ///
    /// Parameters appear in left-to-right traversal order; callers rely on
    /// that for deterministic statement construction.
    pub fn to_sql(
        &self,
        principal: &Principal,
        schema: &TableSchema,
    ) -> Result<(String, Vec<Value>)> {
        let mut params = Vec::new();
        let sql = self.render(principal, schema, &mut params)?;
        Ok((sql, params))
    }

    fn render(
        &self,
        principal: &Principal,
        schema: &TableSchema,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        Ok(match self {
            Expr::Column(name) => {
                validate_ident(name)?;
                if !schema.has_column(name) {
                    return Err(GatewayError::UnknownColumn(name.clone()));
                }
                quote_ident(name)
            }
            Expr::Str(s) => {
                params.push(Value::Text(s.clone()));
                "?".to_string()
            }
            Expr::Int(i) => {
                params.push(Value::Integer(*i));
                "?".to_string()
            }
            Expr::Bool(b) => {
                params.push(Value::Integer(*b as i64));
                "?".to_string()
            }
            Expr::Null => "NULL".to_string(),
            Expr::CurrentUserId => {
                params.push(if principal.authenticated {
                    Value::Text(principal.user_id.clone())
                } else {
                    Value::Null
                });
                "?".to_string()
            }
            Expr::CurrentRole => {
                params.push(Value::Text(principal.role.clone()));
                "?".to_string()
            }
            Expr::CurrentTenantId => {
                params.push(match &principal.tenant_id {
                    Some(t) if principal.authenticated => Value::Text(t.clone()),
                    _ => Value::Null,
                });
                "?".to_string()
            }
            Expr::HasRole(role) => {
                params.push(Value::Text(principal.role.clone()));
                params.push(Value::Text(role.clone()));
                "? = ?".to_string()
            }
            Expr::Cmp { op, lhs, rhs } => {
                let l = lhs.render(principal, schema, params)?;
                let r = rhs.render(principal, schema, params)?;
                format!("{l} {} {r}", op.sql())
            }
            Expr::InList { needle, items } => {
                let n = needle.render(principal, schema, params)?;
                let rendered: Result<Vec<String>> = items
                    .iter()
                    .map(|item| item.render(principal, schema, params))
                    .collect();
                format!("{n} IN ({})", rendered?.join(", "))
            }
            Expr::IsNull { operand, negated } => {
                let o = operand.render(principal, schema, params)?;
                if *negated {
                    format!("{o} IS NOT NULL")
                } else {
                    format!("{o} IS NULL")
                }
            }
            Expr::And(lhs, rhs) => {
                let l = lhs.render(principal, schema, params)?;
                let r = rhs.render(principal, schema, params)?;
                format!("({l} AND {r})")
            }
            Expr::Or(lhs, rhs) => {
                let l = lhs.render(principal, schema, params)?;
                let r = rhs.render(principal, schema, params)?;
                format!("({l} OR {r})")
            }
            Expr::Not(inner) => {
                let i = inner.render(principal, schema, params)?;
                format!("NOT ({i})")
            }
        })
    }

    /// Evaluate against a candidate row, for INSERT-time checks.
    ///
    /// Column atoms read from the row (absent keys are NULL); principal
    /// functions read from the principal. Comparisons involving NULL are
    /// false, matching how the same predicate filters rows in SQL.
    pub fn evaluate(
        &self,
        principal: &Principal,
        row: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        match self.eval_value(principal, row) {
            EvalValue::Bool(b) => b,
            _ => false,
        }
    }

    fn eval_value(
        &self,
        principal: &Principal,
        row: &serde_json::Map<String, serde_json::Value>,
    ) -> EvalValue {
        match self {
            Expr::Column(name) => row
                .get(name)
                .map(EvalValue::from_json)
                .unwrap_or(EvalValue::Null),
            Expr::Str(s) => EvalValue::Str(s.clone()),
            Expr::Int(i) => EvalValue::Int(*i),
            Expr::Bool(b) => EvalValue::Bool(*b),
            Expr::Null => EvalValue::Null,
            Expr::CurrentUserId => {
                if principal.authenticated {
                    EvalValue::Str(principal.user_id.clone())
                } else {
                    EvalValue::Null
                }
            }
            Expr::CurrentRole => EvalValue::Str(principal.role.clone()),
            Expr::CurrentTenantId => match &principal.tenant_id {
                Some(t) if principal.authenticated => EvalValue::Str(t.clone()),
                _ => EvalValue::Null,
            },
            Expr::HasRole(role) => EvalValue::Bool(principal.role == *role),
            Expr::Cmp { op, lhs, rhs } => {
                let l = lhs.eval_value(principal, row);
                let r = rhs.eval_value(principal, row);
                EvalValue::Bool(compare(*op, &l, &r))
            }
            Expr::InList { needle, items } => {
                let n = needle.eval_value(principal, row);
                EvalValue::Bool(items.iter().any(|item| {
                    compare(CmpOp::Eq, &n, &item.eval_value(principal, row))
                }))
            }
            Expr::IsNull { operand, negated } => {
                let is_null = matches!(operand.eval_value(principal, row), EvalValue::Null);
                EvalValue::Bool(is_null != *negated)
            }
            Expr::And(lhs, rhs) => EvalValue::Bool(
                lhs.evaluate(principal, row) && rhs.evaluate(principal, row),
            ),
            Expr::Or(lhs, rhs) => EvalValue::Bool(
                lhs.evaluate(principal, row) || rhs.evaluate(principal, row),
            ),
            Expr::Not(inner) => EvalValue::Bool(!inner.evaluate(principal, row)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl EvalValue {
    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => EvalValue::Null,
            serde_json::Value::Bool(b) => EvalValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    EvalValue::Int(i)
                } else {
                    EvalValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => EvalValue::Str(s.clone()),
            other => EvalValue::Str(other.to_string()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            EvalValue::Int(i) => Some(*i as f64),
            EvalValue::Float(f) => Some(*f),
            // Text comparing against a number follows SQLite affinity
            EvalValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn compare(op: CmpOp, lhs: &EvalValue, rhs: &EvalValue) -> bool {
    use std::cmp::Ordering;

    if matches!(lhs, EvalValue::Null) || matches!(rhs, EvalValue::Null) {
        return false;
    }
    let ordering = match (lhs, rhs) {
        (EvalValue::Str(a), EvalValue::Str(b)) => a.cmp(b),
        (EvalValue::Bool(a), EvalValue::Bool(b)) => a.cmp(b),
        _ => match (lhs.as_number(), rhs.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Less),
            _ => return false,
        },
    };
    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Neq => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Lte => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Gte => ordering != Ordering::Less,
    }
}

// Tokenizer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Cmp(CmpOp::Neq));
                i += 2;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Cmp(CmpOp::Lte));
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push(Token::Cmp(CmpOp::Neq));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Cmp(CmpOp::Gte));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            value.push(b as char);
                            i += 1;
                        }
                        None => {
                            return Err(GatewayError::Validation(
                                "unterminated string literal in policy expression".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                let text = &input[start..i];
                let value = text.parse().map_err(|_| {
                    GatewayError::Validation(format!("invalid integer literal: {text}"))
                })?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => {
                return Err(GatewayError::Validation(format!(
                    "unexpected character in policy expression: {other}"
                )))
            }
        }
    }
    Ok(tokens)
}

// Recursive-descent parser: OR < AND < NOT < predicate

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(GatewayError::Validation(format!(
                "expected {token:?} in policy expression, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(expr);
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr> {
        let operand = self.parse_operand()?;

        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.parse_operand()?;
            return Ok(Expr::Cmp {
                op,
                lhs: Box::new(operand),
                rhs: Box::new(rhs),
            });
        }

        if self.peek_keyword("in") {
            self.pos += 1;
            self.expect(Token::LParen)?;
            let mut items = Vec::new();
            loop {
                items.push(self.parse_operand()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => {
                        return Err(GatewayError::Validation(format!(
                            "expected , or ) in IN list, found {other:?}"
                        )))
                    }
                }
            }
            return Ok(Expr::InList {
                needle: Box::new(operand),
                items,
            });
        }

        if self.peek_keyword("is") {
            self.pos += 1;
            let negated = if self.peek_keyword("not") {
                self.pos += 1;
                true
            } else {
                false
            };
            if !self.peek_keyword("null") {
                return Err(GatewayError::Validation(
                    "IS must be followed by [NOT] NULL".to_string(),
                ));
            }
            self.pos += 1;
            return Ok(Expr::IsNull {
                operand: Box::new(operand),
                negated,
            });
        }

        Ok(operand)
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Ident(name)) => {
                if name.eq_ignore_ascii_case("true") {
                    return Ok(Expr::Bool(true));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Ok(Expr::Bool(false));
                }
                if name.eq_ignore_ascii_case("null") {
                    return Ok(Expr::Null);
                }
                if self.peek() == Some(&Token::LParen) {
                    return self.parse_function(&name);
                }
                Ok(Expr::Column(name))
            }
            other => Err(GatewayError::Validation(format!(
                "expected operand in policy expression, found {other:?}"
            ))),
        }
    }

    fn parse_function(&mut self, name: &str) -> Result<Expr> {
        self.expect(Token::LParen)?;
        match name.to_ascii_lowercase().as_str() {
            "current_user_id" => {
                self.expect(Token::RParen)?;
                Ok(Expr::CurrentUserId)
            }
            "current_role" => {
                self.expect(Token::RParen)?;
                Ok(Expr::CurrentRole)
            }
            "current_tenant_id" => {
                self.expect(Token::RParen)?;
                Ok(Expr::CurrentTenantId)
            }
            "has_role" => {
                let role = match self.next() {
                    Some(Token::Str(s)) => s,
                    other => {
                        return Err(GatewayError::Validation(format!(
                            "has_role takes one string argument, found {other:?}"
                        )))
                    }
                };
                self.expect(Token::RParen)?;
                Ok(Expr::HasRole(role))
            }
            other => Err(GatewayError::Validation(format!(
                "unknown policy function: {other}"
            ))),
        }
    }
}
