//! Restricted condition evaluator.
//!
//! Conditions are small expressions over a JSON context, e.g.
//! `env.DEPLOY_ENV == 'production' && tasks.build.exit_code == 0`.
//! The grammar covers literals, dotted property access, arithmetic,
//! comparisons, boolean operators, and the ternary operator. There is no
//! function call syntax and no host access of any kind.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number at position {0}")]
    InvalidNumber(usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("expected a number, found {0}")]
    NotANumber(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// Evaluate an expression against a JSON object context.
pub fn evaluate(expr: &str, ctx: &Value) -> Result<Value, ExprError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx,
    };
    let value = parser.ternary()?;
    match parser.peek() {
        None => Ok(value),
        Some(tok) => Err(ExprError::UnexpectedToken(format!("{tok:?}"))),
    }
}

/// Evaluate a gate condition, failing closed: any parse or evaluation
/// error logs a warning and yields `false`.
pub fn evaluate_condition(expr: &str, ctx: &Value) -> bool {
    match evaluate(expr, ctx) {
        Ok(value) => is_truthy(&value),
        Err(err) => {
            tracing::warn!(condition = expr, error = %err, "condition evaluation failed, treating as false");
            false
        }
    }
}

/// JavaScript-style truthiness over JSON values
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    Dot,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
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
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('=', i));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
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
                    return Err(ExprError::UnexpectedChar('&', i));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('|', i));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&escaped) => s.push(escaped),
                                None => return Err(ExprError::UnterminatedString),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // stop at a dot followed by a non-digit so `1.foo` fails
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| ExprError::InvalidNumber(start))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a Value,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(tok) if &tok == expected => Ok(()),
            Some(tok) => Err(ExprError::UnexpectedToken(format!("{tok:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    // cond ? a : b, right associative
    fn ternary(&mut self) -> Result<Value, ExprError> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.advance();
            let if_true = self.ternary()?;
            self.expect(&Token::Colon)?;
            let if_false = self.ternary()?;
            Ok(if is_truthy(&cond) { if_true } else { if_false })
        } else {
            Ok(cond)
        }
    }

    fn or(&mut self) -> Result<Value, ExprError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.and()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, ExprError> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.equality()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Value, ExprError> {
        let mut left = self.comparison()?;
        loop {
            let negate = match self.peek() {
                Some(Token::EqEq) => false,
                Some(Token::NotEq) => true,
                _ => break,
            };
            self.advance();
            let right = self.comparison()?;
            let equal = values_equal(&left, &right);
            left = Value::Bool(equal != negate);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, ExprError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => Token::Lt,
                Some(Token::Le) => Token::Le,
                Some(Token::Gt) => Token::Gt,
                Some(Token::Ge) => Token::Ge,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            let result = match (as_number(&left), as_number(&right)) {
                (Some(a), Some(b)) => match op {
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    _ => unreachable!(),
                },
                _ => {
                    let a = to_display_string(&left);
                    let b = to_display_string(&right);
                    match op {
                        Token::Lt => a < b,
                        Token::Le => a <= b,
                        Token::Gt => a > b,
                        Token::Ge => a >= b,
                        _ => unreachable!(),
                    }
                }
            };
            left = Value::Bool(result);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Value, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Token::Plus,
                Some(Token::Minus) => Token::Minus,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = match op {
                Token::Plus => {
                    if left.is_string() || right.is_string() {
                        Value::String(format!(
                            "{}{}",
                            to_display_string(&left),
                            to_display_string(&right)
                        ))
                    } else {
                        number_value(require_number(&left)? + require_number(&right)?)
                    }
                }
                Token::Minus => number_value(require_number(&left)? - require_number(&right)?),
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Token::Star,
                Some(Token::Slash) => Token::Slash,
                Some(Token::Percent) => Token::Percent,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            let a = require_number(&left)?;
            let b = require_number(&right)?;
            left = match op {
                Token::Star => number_value(a * b),
                Token::Slash => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    number_value(a / b)
                }
                Token::Percent => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    number_value(a % b)
                }
                _ => unreachable!(),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                let value = self.unary()?;
                Ok(Value::Bool(!is_truthy(&value)))
            }
            Some(Token::Minus) => {
                self.advance();
                let value = self.unary()?;
                Ok(number_value(-require_number(&value)?))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Value, ExprError> {
        let value = match self.advance() {
            Some(Token::Number(n)) => number_value(n),
            Some(Token::Str(s)) => Value::String(s),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen)?;
                inner
            }
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                name => self
                    .ctx
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExprError::UnknownIdentifier(name.to_string()))?,
            },
            Some(tok) => return Err(ExprError::UnexpectedToken(format!("{tok:?}"))),
            None => return Err(ExprError::UnexpectedEnd),
        };

        // dotted property access; missing members resolve to null
        let mut value = value;
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(key)) => {
                    value = value.get(&key).cloned().unwrap_or(Value::Null);
                }
                Some(tok) => return Err(ExprError::UnexpectedToken(format!("{tok:?}"))),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
        Ok(value)
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

fn require_number(value: &Value) -> Result<f64, ExprError> {
    as_number(value).ok_or_else(|| ExprError::NotANumber(to_display_string(value)))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        _ => a == b,
    }
}

fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
