//! Restricted expression evaluator for condition and iterator expressions.
//!
//! The grammar covers property paths, comparisons, and boolean operators
//! over a fixed-shape JSON context (`result.data.length > 0`). It is not a
//! scripting language: no function calls, no arithmetic, no assignment, no
//! access to anything outside the supplied context value.
//!
//! Comparison semantics follow loose JSON coercion: numeric strings compare
//! numerically, `length` resolves to the element/character count of
//! arrays, strings, and objects, and missing paths resolve to null.

use serde_json::Value;

use crate::core::errors::{EngineError, Result};

/// Evaluates `expression` against `context`, yielding the resulting value
/// (a bare path expression yields whatever the path resolves to).
pub fn evaluate(expression: &str, context: &Value) -> Result<Value> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Expression(format!(
            "unexpected trailing input in '{expression}'"
        )));
    }
    Ok(eval(&ast, context))
}

/// Evaluates `expression` and collapses the result to a boolean by JSON
/// truthiness: null, false, 0, "", [] and {} are false.
pub fn evaluate_bool(expression: &str, context: &Value) -> Result<bool> {
    Ok(truthy(&evaluate(expression, context)?))
}

/// JSON truthiness used by boolean operators and condition nodes.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolves a dotted path (`node.data.0.id`) inside `context`. Missing
/// segments yield null; `length` yields the size of strings, arrays, and
/// objects.
pub fn resolve_path<'a, I>(context: &Value, segments: I) -> Value
where
    I: IntoIterator<Item = &'a str>,
{
    let mut current = context.clone();
    for segment in segments {
        current = match &current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value.clone(),
                // `length` acts on the container itself unless shadowed by
                // an actual key of that name.
                None if segment == "length" => Value::from(map.len()),
                None => Value::Null,
            },
            Value::Array(items) => {
                if segment == "length" {
                    Value::from(items.len())
                } else if let Ok(index) = segment.parse::<usize>() {
                    items.get(index).cloned().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            }
            Value::String(s) if segment == "length" => Value::from(s.chars().count()),
            _ => Value::Null,
        };
    }
    current
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Dot,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(unexpected(input, i, c));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(unexpected(input, i, c));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(unexpected(input, i, c));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(EngineError::Expression(format!(
                                "unterminated string literal in '{input}'"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '-' if chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                let (number, next) = read_number(&chars, i)?;
                tokens.push(Token::Number(number));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (number, next) = read_number(&chars, i)?;
                tokens.push(Token::Number(number));
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(unexpected(input, i, other)),
        }
    }

    Ok(tokens)
}

fn unexpected(input: &str, pos: usize, c: char) -> EngineError {
    EngineError::Expression(format!("unexpected character '{c}' at {pos} in '{input}'"))
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize)> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        // A dot only belongs to the number when a digit follows; otherwise
        // it is a path separator (`items.0.length`).
        if chars[i] == '.' && !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            break;
        }
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| EngineError::Expression(format!("malformed number '{text}'")))
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_term()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_term(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::Expression(
                        "expected closing parenthesis".to_string(),
                    )),
                }
            }
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => segments.push(seg),
                        Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push((n as u64).to_string())
                        }
                        _ => {
                            return Err(EngineError::Expression(
                                "expected property name after '.'".to_string(),
                            ))
                        }
                    }
                }
                Ok(Expr::Path(segments))
            }
            other => Err(EngineError::Expression(format!(
                "expected a value, got {other:?}"
            ))),
        }
    }
}

fn eval(expr: &Expr, context: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => resolve_path(context, segments.iter().map(String::as_str)),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, context))),
        Expr::Binary { op, lhs, rhs } => {
            let left = eval(lhs, context);
            match op {
                BinOp::And => {
                    if !truthy(&left) {
                        return Value::Bool(false);
                    }
                    Value::Bool(truthy(&eval(rhs, context)))
                }
                BinOp::Or => {
                    if truthy(&left) {
                        return Value::Bool(true);
                    }
                    Value::Bool(truthy(&eval(rhs, context)))
                }
                BinOp::Eq => Value::Bool(loose_eq(&left, &eval(rhs, context))),
                BinOp::Ne => Value::Bool(!loose_eq(&left, &eval(rhs, context))),
                BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
                    let right = eval(rhs, context);
                    match (as_f64(&left), as_f64(&right)) {
                        (Some(a), Some(b)) => Value::Bool(match op {
                            BinOp::Gt => a > b,
                            BinOp::Ge => a >= b,
                            BinOp::Lt => a < b,
                            BinOp::Le => a <= b,
                            _ => unreachable!(),
                        }),
                        // Non-numeric operands do not order; the comparison
                        // is simply false rather than a hard failure.
                        _ => Value::Bool(false),
                    }
                }
            }
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return (x - y).abs() < f64::EPSILON;
    }
    match (a, b) {
        (Value::Bool(flag), Value::String(s)) | (Value::String(s), Value::Bool(flag)) => {
            match s.to_lowercase().as_str() {
                "true" => *flag,
                "false" => !*flag,
                _ => false,
            }
        }
        _ => false,
    }
}
