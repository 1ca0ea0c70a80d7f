//! ESI expression engine: lexer, shunting-yard parser, and typed postfix
//! evaluator. Used for `<esi:when test="…">`.
//!
//! The lexer is a token table applied first-match-wins in declaration
//! order. Variable tokens are resolved against the stream's variables at
//! lex time and carry a typed value into evaluation. The whole pipeline is
//! forgiving by contract: any failure makes the enclosing `when` test
//! false rather than failing the stream.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ExecutionError, Result};
use crate::variables::{unquote, variable_reference, Variables};

/// A typed expression value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(i64),
    Str(String),
    Boolean(bool),
    Undefined,
}

impl Value {
    fn textual(&self) -> Option<String> {
        match self {
            Self::Number(n) => Some(n.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::Boolean(_) | Self::Undefined => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Not => 3,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 4,
        }
    }

    fn is_right_associative(self) -> bool {
        self == Self::Not
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Value(Value),
    Op(Op),
    OpenParen,
    CloseParen,
}

// Token table, first match wins in declaration order.
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+").expect("ws pattern"));
static STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^'(?:[^'\\]|\\.)*'").expect("string pattern"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+(?:\.\d*)?|\.\d+)").expect("number pattern"));
static BOOLEAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:true|false)").expect("boolean pattern"));
static OPERATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:==|!=|>=|<=|>|<|!|&|\||\(|\))").expect("operator pattern"));
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\([A-Za-z0-9_]+(?:\{[^}]*\})?(?:\|(?:'(?:[^'\\]|\\.)*'|[^)]*))?\)")
        .expect("variable pattern")
});

static NUMERIC_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+(?:\.\d*)?|\.\d+)$").expect("numeric value pattern"));

fn lex(expr: &str, vars: &dyn Variables) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = expr;
    while !rest.is_empty() {
        if let Some(m) = WHITESPACE.find(rest) {
            rest = &rest[m.end()..];
            continue;
        }
        if let Some(m) = STRING.find(rest) {
            let inner = &m.as_str()[1..m.as_str().len() - 1];
            tokens.push(Token::Value(Value::Str(unescape(inner))));
            rest = &rest[m.end()..];
            continue;
        }
        if let Some(m) = NUMBER.find(rest) {
            tokens.push(Token::Value(Value::Number(parse_number(m.as_str())?)));
            rest = &rest[m.end()..];
            continue;
        }
        if let Some(m) = BOOLEAN.find(rest) {
            tokens.push(Token::Value(Value::Boolean(m.as_str() == "true")));
            rest = &rest[m.end()..];
            continue;
        }
        if let Some(m) = OPERATOR.find(rest) {
            tokens.push(match m.as_str() {
                "(" => Token::OpenParen,
                ")" => Token::CloseParen,
                "==" => Token::Op(Op::Eq),
                "!=" => Token::Op(Op::Ne),
                ">=" => Token::Op(Op::Ge),
                "<=" => Token::Op(Op::Le),
                ">" => Token::Op(Op::Gt),
                "<" => Token::Op(Op::Lt),
                "!" => Token::Op(Op::Not),
                "&" => Token::Op(Op::And),
                _ => Token::Op(Op::Or),
            });
            rest = &rest[m.end()..];
            continue;
        }
        if let Some(m) = VARIABLE.find(rest) {
            tokens.push(Token::Value(resolve_variable(m.as_str(), vars)?));
            rest = &rest[m.end()..];
            continue;
        }
        return Err(ExecutionError::ExpressionError(format!(
            "unexpected input at `{rest}`"
        )));
    }
    Ok(tokens)
}

fn unescape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

// Numbers carry integer semantics even when written with a decimal point;
// the fractional part is dropped.
fn parse_number(text: &str) -> Result<i64> {
    let integer_part = text.split('.').next().unwrap_or("");
    if integer_part.is_empty() {
        return Ok(0);
    }
    integer_part
        .parse()
        .map_err(|_| ExecutionError::ExpressionError(format!("invalid number `{text}`")))
}

fn resolve_variable(token: &str, vars: &dyn Variables) -> Result<Value> {
    let (rest, reference) = variable_reference(token)
        .map_err(|_| ExecutionError::ExpressionError(format!("invalid variable `{token}`")))?;
    if !rest.is_empty() {
        return Err(ExecutionError::ExpressionError(format!(
            "invalid variable `{token}`"
        )));
    }

    let raw = match reference.sub {
        Some(key) => vars.get_sub_value(reference.name, key),
        None => vars.get_value(reference.name),
    };
    Ok(match raw {
        Some(v) => type_value(&v),
        None => reference
            .default
            .map_or(Value::Undefined, |d| type_value(d)),
    })
}

fn type_value(raw: &str) -> Value {
    let unquoted = unquote(raw);
    match unquoted.as_str() {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        text if NUMERIC_VALUE.is_match(text) => match parse_number(text) {
            Ok(n) => Value::Number(n),
            Err(_) => Value::Str(unquoted),
        },
        _ => Value::Str(unquoted),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PostfixItem {
    Value(Value),
    Op(Op),
}

fn to_postfix(tokens: Vec<Token>) -> Result<Vec<PostfixItem>> {
    let mut output = Vec::new();
    let mut stack = Vec::new();

    for token in tokens {
        match token {
            Token::Value(v) => output.push(PostfixItem::Value(v)),
            Token::Op(op) => {
                while let Some(Token::Op(top)) = stack.last() {
                    let unwind = if op.is_right_associative() {
                        top.precedence() > op.precedence()
                    } else {
                        top.precedence() >= op.precedence()
                    };
                    if !unwind {
                        break;
                    }
                    output.push(PostfixItem::Op(*top));
                    stack.pop();
                }
                stack.push(Token::Op(op));
            }
            Token::OpenParen => stack.push(Token::OpenParen),
            Token::CloseParen => loop {
                match stack.pop() {
                    Some(Token::Op(op)) => output.push(PostfixItem::Op(op)),
                    Some(Token::OpenParen) => break,
                    _ => {
                        return Err(ExecutionError::ExpressionError(
                            "mismatched parentheses".to_owned(),
                        ))
                    }
                }
            },
        }
    }

    while let Some(token) = stack.pop() {
        match token {
            Token::Op(op) => output.push(PostfixItem::Op(op)),
            _ => {
                return Err(ExecutionError::ExpressionError(
                    "mismatched parentheses".to_owned(),
                ))
            }
        }
    }
    Ok(output)
}

fn evaluate_postfix(items: Vec<PostfixItem>) -> Result<Value> {
    let mut stack: Vec<Value> = Vec::new();
    for item in items {
        match item {
            PostfixItem::Value(v) => stack.push(v),
            PostfixItem::Op(op) => {
                let value = match op {
                    Op::Not => {
                        let operand = pop_operand(&mut stack)?;
                        match operand {
                            Value::Boolean(b) => Value::Boolean(!b),
                            _ => Value::Undefined,
                        }
                    }
                    Op::And | Op::Or => {
                        let right = pop_operand(&mut stack)?;
                        let left = pop_operand(&mut stack)?;
                        match (left, right) {
                            (Value::Boolean(a), Value::Boolean(b)) => {
                                Value::Boolean(if op == Op::And { a && b } else { a || b })
                            }
                            _ => Value::Undefined,
                        }
                    }
                    _ => {
                        let right = pop_operand(&mut stack)?;
                        let left = pop_operand(&mut stack)?;
                        compare(op, &left, &right)
                    }
                };
                stack.push(value);
            }
        }
    }
    if stack.len() == 1 {
        Ok(stack.remove(0))
    } else {
        Err(ExecutionError::ExpressionError(
            "expression did not reduce to a single value".to_owned(),
        ))
    }
}

fn pop_operand(stack: &mut Vec<Value>) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| ExecutionError::ExpressionError("missing operand".to_owned()))
}

fn compare(op: Op, left: &Value, right: &Value) -> Value {
    if matches!(left, Value::Undefined) || matches!(right, Value::Undefined) {
        return Value::Boolean(false);
    }
    if let (Value::Number(a), Value::Number(b)) = (left, right) {
        return Value::Boolean(apply_ordering(op, a.cmp(b)));
    }
    match (left.textual(), right.textual()) {
        (Some(a), Some(b)) => Value::Boolean(apply_ordering(op, a.cmp(&b))),
        _ => Value::Undefined,
    }
}

fn apply_ordering(op: Op, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Op::Eq => ordering == Equal,
        Op::Ne => ordering != Equal,
        Op::Lt => ordering == Less,
        Op::Le => ordering != Greater,
        Op::Gt => ordering == Greater,
        Op::Ge => ordering != Less,
        Op::And | Op::Or | Op::Not => false,
    }
}

/// Evaluate an expression to a typed value.
pub fn evaluate_value(expr: &str, vars: &dyn Variables) -> Result<Value> {
    let tokens = lex(expr, vars)?;
    let postfix = to_postfix(tokens)?;
    evaluate_postfix(postfix)
}

/// Evaluate a `when` test. True only when the expression reduces to the
/// boolean `true`; every failure mode (undefined results, parse errors,
/// leftover values) is false.
pub fn evaluate(expr: &str, vars: &dyn Variables) -> bool {
    match evaluate_value(expr, vars) {
        Ok(Value::Boolean(true)) => true,
        Ok(other) => {
            log::debug!("expression `{expr}` evaluated to {other:?}");
            false
        }
        Err(e) => {
            log::debug!("expression `{expr}` failed: {e}");
            false
        }
    }
}
