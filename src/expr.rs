//! Expression language for `expression` validation rules and `calculated` fields.
//!
//! Grammar (lowest to highest precedence):
//! `||`, `&&`, comparisons (`== != < <= > >=`), `+ -`, `* / %`, unary `! -`,
//! then literals (numbers, `'strings'`, `true`, `false`, `null`), field
//! names, `(` groups `)` and calls `len(x)`, `lower(x)`, `upper(x)`,
//! `coalesce(a, b, ..)`, `is_null(x)`.
//!
//! Null propagates through arithmetic and comparisons; `&&`/`||` use
//! three-valued logic.

use serde_json::{Map, Number, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("expression error: {0}")]
pub struct ExprError(pub String);

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Len,
    Lower,
    Upper,
    Coalesce,
    IsNull,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Function::Len,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "coalesce" => Function::Coalesce,
            "is_null" => Function::IsNull,
            _ => return None,
        })
    }
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.or()?;
    if p.pos != p.tokens.len() {
        return Err(ExprError(format!("unexpected token {:?}", p.tokens[p.pos])));
    }
    Ok(expr)
}

impl Expr {
    /// Field names referenced anywhere in the expression.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(name) => {
                out.insert(name.clone());
            }
            Expr::Not(e) | Expr::Neg(e) => e.collect_fields(out),
            Expr::Binary(_, l, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
            Expr::Call(_, args) => {
                for a in args {
                    a.collect_fields(out);
                }
            }
        }
    }

    pub fn eval(&self, record: &Map<String, Value>) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(name) => Ok(record.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Not(e) => match as_bool(&e.eval(record)?)? {
                Some(b) => Ok(Value::Bool(!b)),
                None => Ok(Value::Null),
            },
            Expr::Neg(e) => match e.eval(record)? {
                Value::Null => Ok(Value::Null),
                Value::Number(n) => Ok(match n.as_i64() {
                    Some(i) => Value::Number(Number::from(-i)),
                    None => float(-n.as_f64().unwrap_or(0.0)),
                }),
                other => Err(ExprError(format!("cannot negate {}", other))),
            },
            Expr::Binary(BinaryOp::And, l, r) => {
                let l = as_bool(&l.eval(record)?)?;
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = as_bool(&r.eval(record)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let l = as_bool(&l.eval(record)?)?;
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = as_bool(&r.eval(record)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            Expr::Binary(op, l, r) => binary(*op, l.eval(record)?, r.eval(record)?),
            Expr::Call(f, args) => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(a.eval(record)?);
                }
                call(*f, vals)
            }
        }
    }
}

fn as_bool(v: &Value) -> Result<Option<bool>, ExprError> {
    match v {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(ExprError(format!("expected boolean, got {}", other))),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExprError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(&l, &r)
                .ok_or_else(|| ExprError(format!("cannot compare {} with {}", l, r)))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::Add if l.is_string() || r.is_string() => {
            Ok(Value::String(format!("{}{}", display(&l), display(&r))))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (&l, &r) else {
                return Err(ExprError(format!("arithmetic on non-numbers {} and {}", l, r)));
            };
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                let out = match op {
                    BinaryOp::Add => x.checked_add(y),
                    BinaryOp::Sub => x.checked_sub(y),
                    BinaryOp::Mul => x.checked_mul(y),
                    BinaryOp::Rem if y == 0 => return Err(ExprError("division by zero".into())),
                    BinaryOp::Rem => x.checked_rem(y),
                    _ => None,
                };
                if let Some(n) = out {
                    return Ok(Value::Number(Number::from(n)));
                }
            }
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            if matches!(op, BinaryOp::Div | BinaryOp::Rem) && y == 0.0 {
                return Err(ExprError("division by zero".into()));
            }
            Ok(float(match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                _ => x % y,
            }))
        }
        BinaryOp::And | BinaryOp::Or => Err(ExprError("logical operator outside boolean context".into())),
    }
}

/// Equality that treats `1` and `1.0` as equal.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering for numbers, strings and booleans; `None` for mixed or unordered kinds.
pub fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn call(f: Function, args: Vec<Value>) -> Result<Value, ExprError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExprError(format!("{:?} expects {} argument(s)", f, n)))
        }
    };
    match f {
        Function::Len => {
            arity(1)?;
            Ok(match &args[0] {
                Value::String(s) => Value::Number(Number::from(s.chars().count() as i64)),
                Value::Array(a) => Value::Number(Number::from(a.len() as i64)),
                Value::Null => Value::Null,
                other => return Err(ExprError(format!("len() of {}", other))),
            })
        }
        Function::Lower | Function::Upper => {
            arity(1)?;
            Ok(match &args[0] {
                Value::String(s) if f == Function::Lower => Value::String(s.to_lowercase()),
                Value::String(s) => Value::String(s.to_uppercase()),
                Value::Null => Value::Null,
                other => return Err(ExprError(format!("{:?}() of {}", f, other))),
            })
        }
        Function::Coalesce => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        Function::IsNull => {
            arity(1)?;
            Ok(Value::Bool(args[0].is_null()))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError("unterminated string".into())),
                        Some('\\') => {
                            if let Some(n) = chars.get(i + 1) {
                                s.push(*n);
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
                out.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>().ok().map(float)
                } else {
                    text.parse::<i64>().ok().map(|n| Value::Number(Number::from(n)))
                };
                out.push(Token::Number(
                    value.ok_or_else(|| ExprError(format!("invalid number '{}'", text)))?,
                ));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| ExprError(format!("unexpected character '{}'", c)))?;
                out.push(Token::Op(op));
                i += op.len();
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self, ops: &[&'static str]) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) if ops.contains(op) => Some(op),
            _ => None,
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.peek_op(&["||"]).is_some() {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.comparison()?;
        while self.peek_op(&["&&"]).is_some() {
            self.pos += 1;
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.additive()?;
        if let Some(op) = self.peek_op(&["==", "!=", "<", "<=", ">", ">="]) {
            self.pos += 1;
            let right = self.additive()?;
            let op = match op {
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                _ => BinaryOp::Ge,
            };
            return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.peek_op(&["+", "-"]) {
            self.pos += 1;
            let right = self.multiplicative()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek_op(&["*", "/", "%"]) {
            self.pos += 1;
            let right = self.unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek_op(&["!"]).is_some() {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek_op(&["-"]).is_some() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ExprError("unexpected end of expression".into()))?;
        self.pos += 1;
        match token {
            Token::Number(v) => Ok(Expr::Literal(v)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.tokens.get(self.pos) == Some(&Token::LParen) => {
                    let f = Function::from_name(&name)
                        .ok_or_else(|| ExprError(format!("unknown function '{}'", name)))?;
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.tokens.get(self.pos) != Some(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.tokens.get(self.pos) == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(f, args))
                }
                _ => Ok(Expr::Field(name)),
            },
            other => Err(ExprError(format!("unexpected token {:?}", other))),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.tokens.get(self.pos) == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError(format!("expected {:?}", token)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn arithmetic_keeps_integers() {
        let e = parse("quantity * unit_price + 1").unwrap();
        let r = record(json!({"quantity": 3, "unit_price": 4}));
        assert_eq!(e.eval(&r).unwrap(), json!(13));
    }

    #[test]
    fn string_concatenation() {
        let e = parse("first_name + ' ' + last_name").unwrap();
        let r = record(json!({"first_name": "Ada", "last_name": "Lovelace"}));
        assert_eq!(e.eval(&r).unwrap(), json!("Ada Lovelace"));
    }

    #[test]
    fn cross_field_comparison_and_null_propagation() {
        let e = parse("end_date >= start_date").unwrap();
        let ok = record(json!({"start_date": "2024-01-01", "end_date": "2024-02-01"}));
        let bad = record(json!({"start_date": "2024-03-01", "end_date": "2024-02-01"}));
        let missing = record(json!({"start_date": "2024-03-01"}));
        assert_eq!(e.eval(&ok).unwrap(), json!(true));
        assert_eq!(e.eval(&bad).unwrap(), json!(false));
        assert_eq!(e.eval(&missing).unwrap(), Value::Null);
    }

    #[test]
    fn logical_operators_short_circuit() {
        let e = parse("is_null(discount) || (discount >= 0 && discount <= 100)").unwrap();
        assert_eq!(e.eval(&record(json!({}))).unwrap(), json!(true));
        assert_eq!(e.eval(&record(json!({"discount": 150}))).unwrap(), json!(false));
        assert_eq!(e.eval(&record(json!({"discount": 15}))).unwrap(), json!(true));
    }

    #[test]
    fn functions() {
        let e = parse("len(lower(code)) == 3").unwrap();
        assert_eq!(e.eval(&record(json!({"code": "ABC"}))).unwrap(), json!(true));
        let e = parse("coalesce(nickname, name)").unwrap();
        assert_eq!(e.eval(&record(json!({"name": "Ada"}))).unwrap(), json!("Ada"));
    }

    #[test]
    fn collects_referenced_fields() {
        let e = parse("a + b > c && len(d) == 1").unwrap();
        let fields: Vec<_> = e.fields().into_iter().collect();
        assert_eq!(fields, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("a +").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("nope(a)").is_err());
        assert!(parse("a # b").is_err());
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let e = parse("a / b").unwrap();
        assert!(e.eval(&record(json!({"a": 1, "b": 0}))).is_err());
    }
}
