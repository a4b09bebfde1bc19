//! The expression language inside `{{ ... }}` templates
//!
//! A deliberately closed little language: dotted paths with array indexing,
//! string/number/boolean/null literals, `==` `!=` `<` `>` `<=` `>=`,
//! `&&` `||` `!`, binary `+` (numeric addition, string concatenation when
//! either side is a string), and calls to a whitelisted set of functions
//! (`length`, `upper`, `lower`, `now`, `date`, `json`). There is no ternary
//! and no pipe syntax.
//!
//! Unknown identifiers evaluate to [`ExprValue::Undefined`], which
//! stringifies to the empty string and compares unequal to every literal,
//! including `null`.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::context::RunContext;

/// Evaluation failures
///
/// Parse errors surface as validation failures on the owning step; a
/// well-formed expression over missing data does not error, it yields
/// `Undefined`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// An unbound identifier or missing path segment
    Undefined,
    /// A concrete JSON value
    Value(Value),
}

impl ExprValue {
    pub fn from_json(v: Value) -> Self {
        Self::Value(v)
    }

    /// Truthiness: false, null, undefined, 0, "" and empty arrays are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Value(Value::Null) => false,
            Self::Value(Value::Bool(b)) => *b,
            Self::Value(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Self::Value(Value::String(s)) => !s.is_empty(),
            Self::Value(Value::Array(a)) => !a.is_empty(),
            Self::Value(Value::Object(_)) => true,
        }
    }

    /// String form used when a template is embedded in a larger string
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Undefined => String::new(),
            Self::Value(Value::Null) => String::new(),
            Self::Value(Value::String(s)) => s.clone(),
            Self::Value(Value::Number(n)) => n.to_string(),
            Self::Value(Value::Bool(b)) => b.to_string(),
            Self::Value(v) => v.to_string(),
        }
    }

    /// JSON form used when a template is the whole value; undefined maps to null
    pub fn into_json(self) -> Value {
        match self {
            Self::Undefined => Value::Null,
            Self::Value(v) => v,
        }
    }

    fn equals(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) => true,
            (Self::Undefined, _) | (_, Self::Undefined) => false,
            (Self::Value(a), Self::Value(b)) => json_eq(a, b),
        }
    }
}

/// Structural equality with numeric comparison by value (1 == 1.0)
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
        _ => a == b,
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
    True,
    False,
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Bang,
    Plus,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    AndAnd,
    OrOr,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, ExprError> {
        let mut tokens = Vec::new();
        while self.pos < self.src.len() {
            let start = self.pos;
            let c = self.src[self.pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                    continue;
                }
                b'.' => {
                    self.pos += 1;
                    tokens.push((start, Token::Dot));
                }
                b'[' => {
                    self.pos += 1;
                    tokens.push((start, Token::LBracket));
                }
                b']' => {
                    self.pos += 1;
                    tokens.push((start, Token::RBracket));
                }
                b'(' => {
                    self.pos += 1;
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((start, Token::RParen));
                }
                b',' => {
                    self.pos += 1;
                    tokens.push((start, Token::Comma));
                }
                b'+' => {
                    self.pos += 1;
                    tokens.push((start, Token::Plus));
                }
                b'=' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::EqEq));
                    } else {
                        return Err(self.error("expected '=='"));
                    }
                }
                b'!' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::NotEq));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Bang));
                    }
                }
                b'<' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Le));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Lt));
                    }
                }
                b'>' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Ge));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Gt));
                    }
                }
                b'&' => {
                    if self.src.get(self.pos + 1) == Some(&b'&') {
                        self.pos += 2;
                        tokens.push((start, Token::AndAnd));
                    } else {
                        return Err(self.error("expected '&&'"));
                    }
                }
                b'|' => {
                    if self.src.get(self.pos + 1) == Some(&b'|') {
                        self.pos += 2;
                        tokens.push((start, Token::OrOr));
                    } else {
                        return Err(self.error("expected '||'"));
                    }
                }
                b'\'' | b'"' => {
                    let quote = c;
                    self.pos += 1;
                    let mut s = String::new();
                    loop {
                        match self.src.get(self.pos) {
                            None => return Err(self.error("unterminated string literal")),
                            Some(&b) if b == quote => {
                                self.pos += 1;
                                break;
                            }
                            Some(&b'\\') => {
                                let escaped = self
                                    .src
                                    .get(self.pos + 1)
                                    .ok_or_else(|| self.error("dangling escape"))?;
                                s.push(match escaped {
                                    b'n' => '\n',
                                    b't' => '\t',
                                    other => *other as char,
                                });
                                self.pos += 2;
                            }
                            Some(&b) => {
                                s.push(b as char);
                                self.pos += 1;
                            }
                        }
                    }
                    tokens.push((start, Token::Str(s)));
                }
                b'0'..=b'9' => {
                    tokens.push((start, self.lex_number()?));
                }
                b'-' if matches!(self.src.get(self.pos + 1), Some(b'0'..=b'9')) => {
                    self.pos += 1;
                    let tok = self.lex_number()?;
                    let Token::Number(n) = tok else { unreachable!() };
                    tokens.push((start, Token::Number(-n)));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    let mut end = self.pos;
                    while end < self.src.len()
                        && (self.src[end].is_ascii_alphanumeric() || self.src[end] == b'_')
                    {
                        end += 1;
                    }
                    let ident = std::str::from_utf8(&self.src[self.pos..end])
                        .map_err(|_| self.error("invalid identifier"))?
                        .to_string();
                    self.pos = end;
                    tokens.push((
                        start,
                        match ident.as_str() {
                            "true" => Token::True,
                            "false" => Token::False,
                            "null" => Token::Null,
                            _ => Token::Ident(ident),
                        },
                    ));
                }
                other => return Err(self.error(format!("unexpected character '{}'", other as char))),
            }
        }
        Ok(tokens)
    }

    fn lex_number(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.src.get(self.pos) == Some(&b'.')
            && matches!(self.src.get(self.pos + 1), Some(b'0'..=b'9'))
        {
            self.pos += 1;
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error("invalid number literal"))
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(Value),
    /// Root identifier followed by path segments
    Path(String, Vec<PathSeg>),
    Call(String, Vec<Ast>),
    Not(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Field(String),
    Index(Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> ExprError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(usize::MAX);
        ExprError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn parse(mut self) -> Result<Ast, ExprError> {
        let ast = self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(self.error("trailing input after expression"));
        }
        Ok(ast)
    }

    fn parse_or(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Ast::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.parse_equality()?;
            left = Ast::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Ast::Binary(BinOp::Add, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast, ExprError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Ast, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Ast::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                self.parse_path_suffix_on(inner)
            }
            Some(Token::Ident(name)) => {
                // A call only when '(' immediately follows the bare identifier
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    return Ok(Ast::Call(name, args));
                }
                let mut segs = Vec::new();
                self.parse_path_segments(&mut segs)?;
                Ok(Ast::Path(name, segs))
            }
            _ => Err(self.error("expected expression")),
        }
    }

    /// Allow indexing/field access on a parenthesised expression
    fn parse_path_suffix_on(&mut self, base: Ast) -> Result<Ast, ExprError> {
        let mut segs = Vec::new();
        self.parse_path_segments(&mut segs)?;
        if segs.is_empty() {
            return Ok(base);
        }
        // Normalize: wrap the base as a synthetic call so evaluation can
        // navigate into its result.
        Ok(Ast::Call("__nav".into(), {
            let mut v = vec![base];
            v.extend(segs.into_iter().map(|s| match s {
                PathSeg::Field(f) => Ast::Literal(Value::String(f)),
                PathSeg::Index(i) => *i,
            }));
            v
        }))
    }

    fn parse_path_segments(&mut self, segs: &mut Vec<PathSeg>) -> Result<(), ExprError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(f)) => segs.push(PathSeg::Field(f)),
                        _ => return Err(self.error("expected field name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let idx = self.parse_or()?;
                    self.expect(&Token::RBracket, "']'")?;
                    segs.push(PathSeg::Index(Box::new(idx)));
                }
                _ => return Ok(()),
            }
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Parse and evaluate an expression against a run context
pub fn evaluate(expr: &str, ctx: &RunContext) -> Result<ExprValue, ExprError> {
    let tokens = Lexer::new(expr).tokenize()?;
    if tokens.is_empty() {
        return Ok(ExprValue::Undefined);
    }
    let ast = Parser { tokens, pos: 0 }.parse()?;
    eval_ast(&ast, ctx)
}

fn eval_ast(ast: &Ast, ctx: &RunContext) -> Result<ExprValue, ExprError> {
    match ast {
        Ast::Literal(v) => Ok(ExprValue::Value(v.clone())),
        Ast::Path(root, segs) => {
            let Some(mut current) = ctx.get_root(root) else {
                return Ok(ExprValue::Undefined);
            };
            for seg in segs {
                let next = match seg {
                    PathSeg::Field(f) => current.get(f.as_str()),
                    PathSeg::Index(idx_ast) => match eval_ast(idx_ast, ctx)? {
                        ExprValue::Value(Value::Number(n)) => n
                            .as_u64()
                            .and_then(|i| current.get(i as usize)),
                        ExprValue::Value(Value::String(s)) => current.get(s.as_str()),
                        _ => None,
                    },
                };
                match next {
                    Some(v) => current = v,
                    None => return Ok(ExprValue::Undefined),
                }
            }
            Ok(ExprValue::Value(current.clone()))
        }
        Ast::Not(inner) => {
            let v = eval_ast(inner, ctx)?;
            Ok(ExprValue::Value(Value::Bool(!v.is_truthy())))
        }
        Ast::Binary(op, left, right) => eval_binary(*op, left, right, ctx),
        Ast::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_binary(
    op: BinOp,
    left: &Ast,
    right: &Ast,
    ctx: &RunContext,
) -> Result<ExprValue, ExprError> {
    // Short-circuit logic first
    match op {
        BinOp::And => {
            let l = eval_ast(left, ctx)?;
            if !l.is_truthy() {
                return Ok(ExprValue::Value(Value::Bool(false)));
            }
            let r = eval_ast(right, ctx)?;
            return Ok(ExprValue::Value(Value::Bool(r.is_truthy())));
        }
        BinOp::Or => {
            let l = eval_ast(left, ctx)?;
            if l.is_truthy() {
                return Ok(l);
            }
            return eval_ast(right, ctx);
        }
        _ => {}
    }

    let l = eval_ast(left, ctx)?;
    let r = eval_ast(right, ctx)?;

    match op {
        BinOp::Eq => Ok(ExprValue::Value(Value::Bool(l.equals(&r)))),
        BinOp::NotEq => Ok(ExprValue::Value(Value::Bool(!l.equals(&r)))),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let result = compare(&l, &r)
                .map(|ord| match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                })
                .unwrap_or(false);
            Ok(ExprValue::Value(Value::Bool(result)))
        }
        BinOp::Add => Ok(add(&l, &r)),
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

/// Ordering requires two numbers or two strings; anything else does not compare
fn compare(l: &ExprValue, r: &ExprValue) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (ExprValue::Value(Value::Number(a)), ExprValue::Value(Value::Number(b))) => {
            a.as_f64().partial_cmp(&b.as_f64())
        }
        (ExprValue::Value(Value::String(a)), ExprValue::Value(Value::String(b))) => {
            Some(a.cmp(b))
        }
        _ => None,
    }
}

/// `+` is numeric addition, or concatenation when either side is a string
fn add(l: &ExprValue, r: &ExprValue) -> ExprValue {
    match (l, r) {
        (ExprValue::Value(Value::Number(a)), ExprValue::Value(Value::Number(b))) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => ExprValue::Value(number_value(x + y)),
                _ => ExprValue::Undefined,
            }
        }
        (ExprValue::Value(Value::String(_)), _) | (_, ExprValue::Value(Value::String(_))) => {
            ExprValue::Value(Value::String(format!(
                "{}{}",
                l.to_display_string(),
                r.to_display_string()
            )))
        }
        _ => ExprValue::Undefined,
    }
}

fn eval_call(name: &str, args: &[Ast], ctx: &RunContext) -> Result<ExprValue, ExprError> {
    let arity = |expected: usize| -> Result<(), ExprError> {
        if args.len() != expected {
            Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        } else {
            Ok(())
        }
    };

    match name {
        "now" => {
            arity(0)?;
            Ok(ExprValue::Value(Value::String(
                ctx.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )))
        }
        "length" => {
            arity(1)?;
            let v = eval_ast(&args[0], ctx)?;
            let len = match &v {
                ExprValue::Value(Value::String(s)) => Some(s.chars().count()),
                ExprValue::Value(Value::Array(a)) => Some(a.len()),
                ExprValue::Value(Value::Object(o)) => Some(o.len()),
                _ => None,
            };
            Ok(match len {
                Some(n) => ExprValue::Value(Value::Number(Number::from(n as u64))),
                None => ExprValue::Undefined,
            })
        }
        "upper" => {
            arity(1)?;
            let v = eval_ast(&args[0], ctx)?;
            Ok(ExprValue::Value(Value::String(
                v.to_display_string().to_uppercase(),
            )))
        }
        "lower" => {
            arity(1)?;
            let v = eval_ast(&args[0], ctx)?;
            Ok(ExprValue::Value(Value::String(
                v.to_display_string().to_lowercase(),
            )))
        }
        "date" => {
            // date(value) -> RFC 3339; date(value, fmt) -> strftime
            if args.is_empty() || args.len() > 2 {
                return Err(ExprError::Arity {
                    name: name.to_string(),
                    expected: 1,
                    got: args.len(),
                });
            }
            let v = eval_ast(&args[0], ctx)?;
            let parsed: Option<DateTime<Utc>> = match &v {
                ExprValue::Value(Value::String(s)) => {
                    DateTime::parse_from_rfc3339(s).ok().map(|d| d.to_utc())
                }
                ExprValue::Value(Value::Number(n)) => {
                    n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                }
                _ => None,
            };
            let Some(dt) = parsed else {
                return Ok(ExprValue::Undefined);
            };
            let formatted = if args.len() == 2 {
                let fmt = eval_ast(&args[1], ctx)?.to_display_string();
                dt.format(&fmt).to_string()
            } else {
                dt.to_rfc3339_opts(SecondsFormat::Secs, true)
            };
            Ok(ExprValue::Value(Value::String(formatted)))
        }
        "json" => {
            arity(1)?;
            let v = eval_ast(&args[0], ctx)?;
            Ok(ExprValue::Value(Value::String(
                serde_json::to_string(&v.into_json()).unwrap_or_default(),
            )))
        }
        // Internal navigation helper for parenthesised bases
        "__nav" => {
            let mut iter = args.iter();
            let base = iter
                .next()
                .ok_or_else(|| ExprError::UnknownFunction("__nav".into()))?;
            let mut current = match eval_ast(base, ctx)? {
                ExprValue::Undefined => return Ok(ExprValue::Undefined),
                ExprValue::Value(v) => v,
            };
            for seg in iter {
                let key = eval_ast(seg, ctx)?;
                let next = match &key {
                    ExprValue::Value(Value::String(s)) => current.get(s.as_str()).cloned(),
                    ExprValue::Value(Value::Number(n)) => {
                        n.as_u64().and_then(|i| current.get(i as usize)).cloned()
                    }
                    _ => None,
                };
                match next {
                    Some(v) => current = v,
                    None => return Ok(ExprValue::Undefined),
                }
            }
            Ok(ExprValue::Value(current))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(Uuid::nil(), Uuid::nil());
        ctx.set_input(json!({ "count": 5, "name": "ada", "enabled": true, "items": ["a", "b", "c"] }));
        ctx.bind_step_output("fetch", json!({ "status": 200, "body": { "id": 7 } }));
        ctx
    }

    fn eval(expr: &str) -> ExprValue {
        evaluate(expr, &ctx()).unwrap()
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("42"), ExprValue::Value(json!(42)));
        assert_eq!(eval("4.5"), ExprValue::Value(json!(4.5)));
        assert_eq!(eval("-3"), ExprValue::Value(json!(-3)));
        assert_eq!(eval("'hi'"), ExprValue::Value(json!("hi")));
        assert_eq!(eval("\"hi\""), ExprValue::Value(json!("hi")));
        assert_eq!(eval("true"), ExprValue::Value(json!(true)));
        assert_eq!(eval("null"), ExprValue::Value(Value::Null));
    }

    #[test]
    fn test_paths() {
        assert_eq!(eval("input.count"), ExprValue::Value(json!(5)));
        assert_eq!(eval("input.items[1]"), ExprValue::Value(json!("b")));
        assert_eq!(eval("steps.fetch.body.id"), ExprValue::Value(json!(7)));
        assert_eq!(eval("input.missing.deep"), ExprValue::Undefined);
        assert_eq!(eval("nosuch"), ExprValue::Undefined);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("input.count == 5"), ExprValue::Value(json!(true)));
        assert_eq!(eval("input.count != 5"), ExprValue::Value(json!(false)));
        assert_eq!(eval("input.count > 3"), ExprValue::Value(json!(true)));
        assert_eq!(eval("input.count < 3"), ExprValue::Value(json!(false)));
        assert_eq!(eval("input.name == 'ada'"), ExprValue::Value(json!(true)));
        // Mixed types never order
        assert_eq!(eval("input.name > 3"), ExprValue::Value(json!(false)));
    }

    #[test]
    fn test_undefined_comparisons() {
        // Undefined compares unequal to every literal, including null
        assert_eq!(eval("nosuch == null"), ExprValue::Value(json!(false)));
        assert_eq!(eval("nosuch == ''"), ExprValue::Value(json!(false)));
        assert_eq!(eval("nosuch == 0"), ExprValue::Value(json!(false)));
        assert_eq!(eval("nosuch != 'x'"), ExprValue::Value(json!(true)));
    }

    #[test]
    fn test_logic() {
        assert_eq!(
            eval("input.enabled && input.count > 1"),
            ExprValue::Value(json!(true))
        );
        assert_eq!(eval("!input.enabled"), ExprValue::Value(json!(false)));
        assert_eq!(eval("nosuch || 'fallback'"), ExprValue::Value(json!("fallback")));
    }

    #[test]
    fn test_add() {
        assert_eq!(eval("input.count + 3"), ExprValue::Value(json!(8)));
        assert_eq!(eval("1.5 + 1"), ExprValue::Value(json!(2.5)));
        assert_eq!(
            eval("'id-' + input.count"),
            ExprValue::Value(json!("id-5"))
        );
        assert_eq!(eval("nosuch + 1"), ExprValue::Undefined);
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("length(input.items)"), ExprValue::Value(json!(3)));
        assert_eq!(eval("length(input.name)"), ExprValue::Value(json!(3)));
        assert_eq!(eval("upper(input.name)"), ExprValue::Value(json!("ADA")));
        assert_eq!(eval("lower('ADA')"), ExprValue::Value(json!("ada")));
        assert_eq!(
            eval("json(input.items)"),
            ExprValue::Value(json!("[\"a\",\"b\",\"c\"]"))
        );
        assert!(matches!(
            evaluate("nope(1)", &ctx()),
            Err(ExprError::UnknownFunction(_))
        ));
        assert!(matches!(
            evaluate("length()", &ctx()),
            Err(ExprError::Arity { .. })
        ));
    }

    #[test]
    fn test_date_function() {
        assert_eq!(
            eval("date(0)"),
            ExprValue::Value(json!("1970-01-01T00:00:00Z"))
        );
        assert_eq!(
            eval("date(0, '%Y-%m-%d')"),
            ExprValue::Value(json!("1970-01-01"))
        );
        assert_eq!(eval("date('not a date')"), ExprValue::Undefined);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            evaluate("input.count ==", &ctx()),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(
            evaluate("(input.count", &ctx()),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(
            evaluate("'unterminated", &ctx()),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(
            evaluate("a @ b", &ctx()),
            Err(ExprError::Parse { .. })
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!ExprValue::Value(json!(0)).is_truthy());
        assert!(!ExprValue::Value(json!("")).is_truthy());
        assert!(!ExprValue::Value(json!([])).is_truthy());
        assert!(!ExprValue::Value(Value::Null).is_truthy());
        assert!(!ExprValue::Undefined.is_truthy());
        assert!(ExprValue::Value(json!({})).is_truthy());
        assert!(ExprValue::Value(json!(1)).is_truthy());
    }
}
