//! `$filter` expressions.
//!
//! Grammar (OData subset):
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | operand cmp operand | "true" | "false"
//! cmp     := eq | ne | gt | ge | lt | le
//! operand := identifier | literal
//! literal := 'str' | 123 | 123L | 1.5 | true | false
//!          | datetime'..' | guid'..' | X'..' | binary'..'
//! ```
//!
//! Comparisons between incompatible types, or against a missing property, are false.
//! Expressions nest at most [`MAX_FILTER_DEPTH`] levels, counting parentheses, `not`
//! and each chained `and`/`or`.

use std::cmp::Ordering;

use crate::entity::Timestamp;
use crate::value::EdmValue;

/// Deepest expression tree a client filter may produce
pub const MAX_FILTER_DEPTH: usize = 100;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

/// Comparison operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Property(String),
    Literal(EdmValue),
}

/// Parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Constant(bool),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Not(Box<Filter>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let filter = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected token {tok:?}"));
        }
        Ok(filter)
    }

    /// Evaluate against a property lookup.
    pub fn matches<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<EdmValue>,
    {
        match self {
            Filter::Constant(b) => *b,
            Filter::Not(inner) => !inner.matches(lookup),
            Filter::And(a, b) => a.matches(lookup) && b.matches(lookup),
            Filter::Or(a, b) => a.matches(lookup) || b.matches(lookup),
            Filter::Compare { left, op, right } => {
                let resolve = |operand: &Operand| match operand {
                    Operand::Property(name) => lookup(name),
                    Operand::Literal(v) => Some(v.clone()),
                };
                match (resolve(left), resolve(right)) {
                    (Some(l), Some(r)) => compare(&l, &r).is_some_and(|o| op.holds(o)),
                    _ => false,
                }
            }
        }
    }
}

/// Order two values of compatible types. Numeric types compare across widths.
pub fn compare(left: &EdmValue, right: &EdmValue) -> Option<Ordering> {
    use EdmValue::*;
    match (left, right) {
        (String(a), String(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (Guid(a), Guid(b)) => Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())),
        (Binary(a), Binary(b)) => Some(a.cmp(b)),
        (DateTime(a), DateTime(b)) => Some(Timestamp::parse(a)?.cmp(&Timestamp::parse(b)?)),
        (Int32(_) | Int64(_), Int32(_) | Int64(_)) => Some(as_i64(left)?.cmp(&as_i64(right)?)),
        (Int32(_) | Int64(_) | Double(_), Int32(_) | Int64(_) | Double(_)) => {
            as_f64(left)?.partial_cmp(&as_f64(right)?)
        }
        _ => None,
    }
}

fn as_i64(v: &EdmValue) -> Option<i64> {
    match v {
        EdmValue::Int32(i) => Some(i64::from(*i)),
        EdmValue::Int64(i) => Some(*i),
        _ => None,
    }
}

fn as_f64(v: &EdmValue) -> Option<f64> {
    match v {
        EdmValue::Int32(i) => Some(f64::from(*i)),
        EdmValue::Int64(i) => Some(*i as f64),
        EdmValue::Double(d) => Some(*d),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Literal(EdmValue),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '\'' {
            let (s, next) = read_quoted(&chars, i)?;
            tokens.push(Token::Literal(EdmValue::String(s)));
            i = next;
        } else if c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
        {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            tokens.push(Token::Literal(parse_number(&raw)?));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if chars.get(i) == Some(&'\'') {
                let (body, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Literal(typed_literal(&word, &body)?));
                i = next;
            } else {
                tokens.push(Token::Word(word));
            }
        } else {
            return Err(format!("unexpected character '{c}' at position {i}"));
        }
    }

    Ok(tokens)
}

/// Read a single-quoted literal starting at `start`; `''` escapes a quote.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(chars[i]);
        i += 1;
    }
    Err("unterminated string literal".to_string())
}

fn parse_number(raw: &str) -> Result<EdmValue, String> {
    if let Some(digits) = raw.strip_suffix(['L', 'l']) {
        return digits
            .parse()
            .map(EdmValue::Int64)
            .map_err(|_| format!("invalid Int64 literal '{raw}'"));
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(i32::try_from(i).map_or(EdmValue::Int64(i), EdmValue::Int32));
    }
    raw.strip_suffix(['d', 'D', 'm', 'M', 'f', 'F'])
        .unwrap_or(raw)
        .parse()
        .map(EdmValue::Double)
        .map_err(|_| format!("invalid numeric literal '{raw}'"))
}

fn typed_literal(prefix: &str, body: &str) -> Result<EdmValue, String> {
    match prefix.to_ascii_lowercase().as_str() {
        "datetime" => {
            Timestamp::parse(body).ok_or_else(|| format!("invalid datetime literal '{body}'"))?;
            Ok(EdmValue::DateTime(body.to_string()))
        }
        "guid" => {
            uuid::Uuid::parse_str(body).map_err(|_| format!("invalid guid literal '{body}'"))?;
            Ok(EdmValue::Guid(body.to_string()))
        }
        "x" | "binary" => decode_hex(body).map(EdmValue::Binary),
        _ => Err(format!("unknown literal prefix '{prefix}'")),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(format!("invalid binary literal '{s}'"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| format!("invalid binary literal '{s}'"))
        })
        .collect()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_FILTER_DEPTH {
            return Err(format!("filter nests deeper than {MAX_FILTER_DEPTH} levels"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Filter, String> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while self.eat_keyword("or") {
            self.descend()?;
            chained += 1;
            let right = self.parse_and()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, String> {
        let mut left = self.parse_unary()?;
        let mut chained = 0;
        while self.eat_keyword("and") {
            self.descend()?;
            chained += 1;
            let right = self.parse_unary()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, String> {
        if self.eat_keyword("not") {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Filter::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Filter, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing closing parenthesis".to_string()),
            };
        }

        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Word(w)) => CompareOp::from_keyword(&w.to_ascii_lowercase()),
            _ => None,
        };
        let Some(op) = op else {
            // A bare boolean literal is a complete expression
            return match left {
                Operand::Literal(EdmValue::Boolean(b)) => Ok(Filter::Constant(b)),
                other => Err(format!("expected comparison operator after {other:?}")),
            };
        };
        self.pos += 1;
        let right = self.parse_operand()?;
        Ok(Filter::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(Token::Word(w)) if w == "true" => Ok(Operand::Literal(EdmValue::Boolean(true))),
            Some(Token::Word(w)) if w == "false" => Ok(Operand::Literal(EdmValue::Boolean(false))),
            Some(Token::Word(w)) => Ok(Operand::Property(w)),
            Some(tok) => Err(format!("unexpected token {tok:?}")),
            None => Err("unexpected end of filter".to_string()),
        }
    }
}
