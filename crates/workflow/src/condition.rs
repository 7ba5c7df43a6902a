//! Restricted boolean expressions for conditional steps.
//!
//! Grammar: property paths, literals, comparison and boolean operators,
//! parentheses, `!`. Nothing else — no calls, no assignment, no host APIs.
//! Anything outside the grammar fails the parse, and the engine treats a
//! failed parse as `true` with a warning so a malformed condition can never
//! halt a DAG.
//!
//! ```text
//! expr  := or
//! or    := and ("||" and)*
//! and   := cmp ("&&" cmp)*
//! cmp   := unary (("==" | "!=" | "<" | "<=" | ">" | ">=") unary)?
//! unary := "!" unary | primary
//! primary := literal | path | "(" expr ")"
//! path  := ident ("." ident)*        (optional leading "context.")
//! ```

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CondError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("trailing input after expression")]
    TrailingInput,

    #[error("function calls are not allowed")]
    CallRejected,
}

/// Evaluate `expr` against the workflow context. `context` maps step id →
/// result value.
pub fn evaluate(expr: &str, context: &serde_json::Map<String, Value>) -> Result<bool, CondError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0, context };
    let value = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(CondError::TrailingInput);
    }
    Ok(truthy(&value))
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Bang,
    AndAnd,
    OrOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CondError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                // `ident(` is a call — reject outright.
                if matches!(tokens.last(), Some(Token::Ident(_))) {
                    return Err(CondError::CallRejected);
                }
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
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(CondError::UnexpectedChar('&'));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(CondError::UnexpectedChar('|'));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    // Single '=' is assignment — outside the grammar.
                    return Err(CondError::UnexpectedChar('='));
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
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
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
                        None => return Err(CondError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw.parse().map_err(|_| CondError::UnexpectedToken(raw))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
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
            other => return Err(CondError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

// ── Parser / evaluator ────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    context: &'a serde_json::Map<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Value, CondError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, CondError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.parse_cmp()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Value, CondError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge) => {
                self.bump()
            }
            _ => return Ok(left),
        };
        let right = self.parse_unary()?;
        let result = match op {
            Some(Token::Eq) => values_equal(&left, &right),
            Some(Token::Ne) => !values_equal(&left, &right),
            Some(Token::Lt) => compare(&left, &right, |o| o == std::cmp::Ordering::Less),
            Some(Token::Le) => compare(&left, &right, |o| o != std::cmp::Ordering::Greater),
            Some(Token::Gt) => compare(&left, &right, |o| o == std::cmp::Ordering::Greater),
            Some(Token::Ge) => compare(&left, &right, |o| o != std::cmp::Ordering::Less),
            _ => false,
        };
        Ok(Value::Bool(result))
    }

    fn parse_unary(&mut self) -> Result<Value, CondError> {
        if self.peek() == Some(&Token::Bang) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Value::Bool(!truthy(&inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value, CondError> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(serde_json::json!(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CondError::UnexpectedToken(")".to_string())),
                }
            }
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(part)) => path.push(part),
                        other => {
                            return Err(CondError::UnexpectedToken(format!("{other:?}")));
                        }
                    }
                }
                Ok(self.resolve(&path))
            }
            other => Err(CondError::UnexpectedToken(format!("{other:?}"))),
        }
    }

    /// Resolve a dotted path against the context. A leading `context`
    /// segment is optional. Missing paths resolve to null.
    fn resolve(&self, path: &[String]) -> Value {
        let segments: &[String] = if path.first().map(String::as_str) == Some("context") {
            &path[1..]
        } else {
            path
        };
        let Some((head, rest)) = segments.split_first() else {
            return Value::Null;
        };
        let mut current = match self.context.get(head) {
            Some(value) => value.clone(),
            None => return Value::Null,
        };
        for part in rest {
            current = match current.get(part) {
                Some(value) => value.clone(),
                None => return Value::Null,
            };
        }
        current
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value, ok: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => ok(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).map(&ok).unwrap_or(false),
            _ => false,
        },
    }
}
