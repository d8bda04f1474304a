//! Criteria predicates gating interceptors.
//!
//! A predicate is a boolean expression over fields of the candidate data:
//!
//! ```text
//! status = 'paid' && (total >= 100 || customer.vip)
//! items[0].sku ~= '^A-' and not archived
//! ```
//!
//! Applied to a list it keeps the matching elements; applied to a map it yields the
//! map or `null`.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

use crate::core::error::{CoreError, CoreResult};

/// Evaluates `criteria` against `data`. `None` means the interceptor does not apply.
pub fn gate(criteria: &str, data: &Value) -> CoreResult<Option<Value>> {
    if criteria.trim().is_empty() {
        return Ok(Some(data.clone()));
    }
    let expr = parse(criteria)?;
    let selected = match data {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| expr.eval(item))
                .cloned()
                .collect(),
        ),
        other if expr.eval(other) => other.clone(),
        _ => Value::Null,
    };
    Ok(match &selected {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        _ => Some(selected),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Matches(Regex),
}

#[derive(Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Vec<Segment>, Op, Value),
    Truthy(Vec<Segment>),
    Literal(bool),
}

impl Expr {
    fn eval(&self, item: &Value) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(item) || b.eval(item),
            Expr::And(a, b) => a.eval(item) && b.eval(item),
            Expr::Not(e) => !e.eval(item),
            Expr::Literal(b) => *b,
            Expr::Truthy(path) => truthy(resolve(item, path)),
            Expr::Compare(path, op, lit) => {
                let left = resolve(item, path);
                match op {
                    Op::Eq => loose_eq(left, lit),
                    Op::Ne => !loose_eq(left, lit),
                    Op::Gt => compare(left, lit) == Some(Ordering::Greater),
                    Op::Ge => matches!(compare(left, lit), Some(Ordering::Greater | Ordering::Equal)),
                    Op::Lt => compare(left, lit) == Some(Ordering::Less),
                    Op::Le => matches!(compare(left, lit), Some(Ordering::Less | Ordering::Equal)),
                    Op::Matches(re) => match left {
                        Value::String(s) => re.is_match(s),
                        Value::Number(n) => re.is_match(&n.to_string()),
                        _ => false,
                    },
                }
            }
        }
    }
}

fn resolve<'a>(item: &'a Value, path: &[Segment]) -> &'a Value {
    let mut current = item;
    for seg in path {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k).unwrap_or(&Value::Null),
            (Segment::Index(i), Value::Array(items)) => items.get(*i).unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::String(_)) => false,
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Null, _) | (_, Value::Null) => None,
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<Segment>),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Cmp(&'static str),
}

fn lex(input: &str) -> CoreResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp("!="));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '~' if next == Some('=') => {
                tokens.push(Token::Cmp("~="));
                i += 2;
            }
            '=' => {
                tokens.push(Token::Cmp("="));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '<' | '>' => {
                let op = match (c, next) {
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', Some('>')) => "!=",
                    ('<', _) => "<",
                    _ => ">",
                };
                i += if op.len() == 2 { 2 } else { 1 };
                tokens.push(Token::Cmp(op));
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(CoreError::Criteria("unterminated string".to_string())),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
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
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw
                    .parse()
                    .map_err(|_| CoreError::Criteria(format!("bad number '{}'", raw)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '[' | ']'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Path(parse_path(&word)?),
                });
            }
            other => {
                return Err(CoreError::Criteria(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }
    Ok(tokens)
}

fn parse_path(raw: &str) -> CoreResult<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in raw.split('.') {
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        if key_end > 0 {
            segments.push(Segment::Key(rest[..key_end].to_string()));
        }
        rest = &rest[key_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| CoreError::Criteria(format!("unclosed index in '{}'", raw)))?;
            let index = stripped[..close]
                .parse()
                .map_err(|_| CoreError::Criteria(format!("bad index in '{}'", raw)))?;
            segments.push(Segment::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return Err(CoreError::Criteria(format!("bad path '{}'", raw)));
        }
    }
    if segments.is_empty() {
        return Err(CoreError::Criteria(format!("bad path '{}'", raw)));
    }
    Ok(segments)
}

// --- Parser ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse(input: &str) -> CoreResult<Expr> {
    let mut parser = Parser {
        tokens: lex(input)?,
        pos: 0,
    };
    let expr = parser.or()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::Criteria(format!(
            "unexpected token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> CoreResult<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> CoreResult<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> CoreResult<Expr> {
        match self.bump() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CoreError::Criteria("missing ')'".to_string())),
                }
            }
            Some(Token::Bool(b)) => Ok(Expr::Literal(b)),
            Some(Token::Path(path)) => match self.peek() {
                Some(Token::Cmp(op)) => {
                    let op = *op;
                    self.pos += 1;
                    let literal = match self.bump() {
                        Some(Token::Str(s)) => Value::String(s),
                        Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                        Some(Token::Bool(b)) => Value::Bool(b),
                        Some(Token::Null) => Value::Null,
                        other => {
                            return Err(CoreError::Criteria(format!(
                                "expected a literal after '{}', found {:?}",
                                op, other
                            )));
                        }
                    };
                    Ok(Expr::Compare(path, compile_op(op, &literal)?, literal))
                }
                _ => Ok(Expr::Truthy(path)),
            },
            other => Err(CoreError::Criteria(format!("unexpected token {:?}", other))),
        }
    }
}

fn compile_op(op: &str, literal: &Value) -> CoreResult<Op> {
    Ok(match op {
        "=" => Op::Eq,
        "!=" => Op::Ne,
        ">" => Op::Gt,
        ">=" => Op::Ge,
        "<" => Op::Lt,
        "<=" => Op::Le,
        "~=" => {
            let pattern = literal
                .as_str()
                .ok_or_else(|| CoreError::Criteria("'~=' needs a string pattern".to_string()))?;
            Op::Matches(
                Regex::new(pattern)
                    .map_err(|e| CoreError::Criteria(format!("bad pattern: {}", e)))?,
            )
        }
        other => return Err(CoreError::Criteria(format!("unknown operator '{}'", other))),
    })
}
