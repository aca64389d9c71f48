//! Scalar expression language of the `where` and `eval` pipeline stages.
//!
//! Expressions read record attributes by name plus the special fields
//! `_raw`, `_write_ts`, `_ingest_ts`, `_source_ts`. The function list is
//! fixed; unknown names are rejected at parse time.

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, opt, verify},
    multi::{many0, separated_list},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::store::Record;
use crate::{Error, Result};

/// Runtime value. Integers and floats are kept apart so nanosecond
/// timestamps survive arithmetic unharmed.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Text rendering used when an `eval` result lands in an attribute.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.0}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => s.clone(),
        }
    }

    /// Ordering used by `sort by` and the comparison operators:
    /// null < numbers < strings; booleans compare as integers.
    pub fn compare(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) | Value::Int(_) | Value::Float(_) => 1,
                Value::Str(_) => 2,
            }
        }
        // strings holding numbers still compare numerically against numbers
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => match (self, other) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => Ordering::Equal,
            },
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Field(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

const FUNCTIONS: &[&str] = &[
    "len", "lower", "upper", "trim", "abs", "floor", "ceil", "round", "tonumber", "tostring",
    "coalesce", "contains", "replace", "substr",
];

impl Expr {
    pub fn parse(input: &str) -> Result<Expr> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid("empty expression"));
        }
        let expr = match all_consuming(delimited(multispace0, or_expr, multispace0))(trimmed) {
            Ok((_, expr)) => expr,
            Err(_) => return Err(Error::invalid(format!("bad expression '{}'", input))),
        };
        expr.validate()?;
        Ok(expr)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Expr::Call { name, args } => {
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(Error::invalid(format!("unknown function '{}'", name)));
                }
                for arg in args {
                    arg.validate()?;
                }
                Ok(())
            }
            Expr::Unary { expr, .. } => expr.validate(),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.validate()?;
                rhs.validate()
            }
            _ => Ok(()),
        }
    }

    pub fn eval(&self, rec: &Record) -> Value {
        match self {
            Expr::Lit(value) => value.clone(),
            Expr::Field(name) => field_value(rec, name),
            Expr::Unary { op, expr } => {
                let v = expr.eval(rec);
                match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => match v {
                        Value::Int(n) => Value::Int(-n),
                        other => match other.as_f64() {
                            Some(f) => Value::Float(-f),
                            None => Value::Null,
                        },
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs.eval(rec), rhs.eval(rec)),
            Expr::Call { name, args } => {
                let values: Vec<Value> = args.iter().map(|a| a.eval(rec)).collect();
                eval_call(name, &values)
            }
        }
    }
}

fn field_value(rec: &Record, name: &str) -> Value {
    match name {
        "_raw" => Value::Str(String::from_utf8_lossy(&rec.raw).into_owned()),
        "_write_ts" => Value::Int(rec.write_ts),
        "_ingest_ts" => Value::Int(rec.ingest_ts),
        "_source_ts" => Value::Int(rec.source_ts),
        name => match rec.attrs.get(name) {
            Some(value) => Value::Str(value.clone()),
            None => Value::Null,
        },
    }
}

fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> Value {
    use std::cmp::Ordering;
    match op {
        BinOp::And => Value::Bool(lhs.truthy() && rhs.truthy()),
        BinOp::Or => Value::Bool(lhs.truthy() || rhs.truthy()),
        BinOp::Eq => Value::Bool(values_equal(&lhs, &rhs)),
        BinOp::Ne => Value::Bool(!values_equal(&lhs, &rhs)),
        BinOp::Lt => Value::Bool(lhs.compare(&rhs) == Ordering::Less),
        BinOp::Le => Value::Bool(lhs.compare(&rhs) != Ordering::Greater),
        BinOp::Gt => Value::Bool(lhs.compare(&rhs) == Ordering::Greater),
        BinOp::Ge => Value::Bool(lhs.compare(&rhs) != Ordering::Less),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            eval_arithmetic(op, lhs, rhs)
        }
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a == b;
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn eval_arithmetic(op: BinOp, lhs: Value, rhs: Value) -> Value {
    // string concatenation
    if op == BinOp::Add {
        if let (Value::Str(a), b) = (&lhs, &rhs) {
            if b.as_f64().is_none() || lhs.as_f64().is_none() {
                return Value::Str(format!("{}{}", a, b.render()));
            }
        }
        if let (a, Value::Str(b)) = (&lhs, &rhs) {
            if a.as_f64().is_none() {
                return Value::Str(format!("{}{}", a.render(), b));
            }
        }
    }

    // integer arithmetic stays exact
    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        return match op {
            BinOp::Add => Value::Int(a.wrapping_add(b)),
            BinOp::Sub => Value::Int(a.wrapping_sub(b)),
            BinOp::Mul => Value::Int(a.wrapping_mul(b)),
            BinOp::Div => {
                if b == 0 {
                    Value::Null
                } else {
                    Value::Float(a as f64 / b as f64)
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    Value::Null
                } else {
                    Value::Int(a.rem_euclid(b))
                }
            }
            _ => Value::Null,
        };
    }

    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Value::Null,
    };
    match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Float(a / b)
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Float(a.rem_euclid(b))
            }
        }
        _ => Value::Null,
    }
}

fn eval_call(name: &str, args: &[Value]) -> Value {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match name {
        "len" => match arg(0) {
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            Value::Null => Value::Null,
            other => Value::Int(other.render().chars().count() as i64),
        },
        "lower" => Value::Str(arg(0).render().to_lowercase()),
        "upper" => Value::Str(arg(0).render().to_uppercase()),
        "trim" => Value::Str(arg(0).render().trim().to_owned()),
        "abs" => match arg(0) {
            Value::Int(n) => Value::Int(n.abs()),
            other => other.as_f64().map(|f| Value::Float(f.abs())).unwrap_or(Value::Null),
        },
        "floor" => arg(0)
            .as_f64()
            .map(|f| Value::Int(f.floor() as i64))
            .unwrap_or(Value::Null),
        "ceil" => arg(0)
            .as_f64()
            .map(|f| Value::Int(f.ceil() as i64))
            .unwrap_or(Value::Null),
        "round" => arg(0)
            .as_f64()
            .map(|f| Value::Int(f.round() as i64))
            .unwrap_or(Value::Null),
        "tonumber" => match arg(0) {
            Value::Int(n) => Value::Int(n),
            Value::Float(f) => Value::Float(f),
            Value::Str(s) => {
                if let Ok(n) = s.parse::<i64>() {
                    Value::Int(n)
                } else if let Ok(f) = s.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            _ => Value::Null,
        },
        "tostring" => Value::Str(arg(0).render()),
        "coalesce" => args
            .iter()
            .find(|v| !matches!(v, Value::Null))
            .cloned()
            .unwrap_or(Value::Null),
        "contains" => Value::Bool(arg(0).render().contains(&arg(1).render())),
        "replace" => Value::Str(arg(0).render().replace(&arg(1).render(), &arg(2).render())),
        "substr" => {
            let s = arg(0).render();
            let off = arg(1).as_i64().unwrap_or(0).max(0) as usize;
            let len = arg(2).as_i64().unwrap_or(i64::MAX).max(0) as usize;
            Value::Str(s.chars().skip(off).take(len).collect())
        }
        _ => Value::Null,
    }
}

// ---- parser ----

fn ws(i: &str) -> IResult<&str, &str> {
    multispace0(i)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_byte(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn ident(i: &str) -> IResult<&str, &str> {
    verify(take_while1(is_ident_byte), |word: &str| {
        word.chars().next().map(is_ident_start).unwrap_or(false)
    })(i)
}

fn number(i: &str) -> IResult<&str, Value> {
    let (rest, text) = take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E')(i)?;
    if text.contains('.') || text.contains('e') || text.contains('E') {
        match text.parse::<f64>() {
            Ok(f) => Ok((rest, Value::Float(f))),
            Err(_) => Err(nom::Err::Error((i, nom::error::ErrorKind::Float))),
        }
    } else {
        match text.parse::<i64>() {
            Ok(n) => Ok((rest, Value::Int(n))),
            Err(_) => Err(nom::Err::Error((i, nom::error::ErrorKind::Digit))),
        }
    }
}

fn string_lit(i: &str) -> IResult<&str, Value> {
    let (i, _) = char('"')(i)?;
    let end = match i.find('"') {
        Some(end) => end,
        None => return Err(nom::Err::Error((i, nom::error::ErrorKind::Char))),
    };
    let (value, rest) = i.split_at(end);
    Ok((&rest[1..], Value::Str(value.to_owned())))
}

fn call(i: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            ident,
            preceded(ws, char('(')),
            preceded(ws, separated_list(tuple((ws, char(','), ws)), or_expr)),
            preceded(ws, char(')')),
        )),
        |(name, _, args, _)| Expr::Call {
            name: name.to_owned(),
            args,
        },
    )(i)
}

fn keyword_or_field(i: &str) -> IResult<&str, Expr> {
    map(ident, |word: &str| {
        if word.eq_ignore_ascii_case("true") {
            Expr::Lit(Value::Bool(true))
        } else if word.eq_ignore_ascii_case("false") {
            Expr::Lit(Value::Bool(false))
        } else if word.eq_ignore_ascii_case("null") {
            Expr::Lit(Value::Null)
        } else {
            Expr::Field(word.to_owned())
        }
    })(i)
}

fn atom(i: &str) -> IResult<&str, Expr> {
    alt((
        delimited(pair(char('('), ws), or_expr, pair(ws, char(')'))),
        map(number, Expr::Lit),
        map(string_lit, Expr::Lit),
        call,
        keyword_or_field,
    ))(i)
}

fn unary(i: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(pair(char('-'), ws), unary), |e| Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(e),
        }),
        map(preceded(pair(char('!'), ws), unary), |e| Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(e),
        }),
        atom,
    ))(i)
}

fn fold_binary(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn mul_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = unary(i)?;
    let (i, rest) = many0(tuple((
        delimited(
            ws,
            alt((
                map(char('*'), |_| BinOp::Mul),
                map(char('/'), |_| BinOp::Div),
                map(char('%'), |_| BinOp::Mod),
            )),
            ws,
        ),
        unary,
    )))(i)?;
    Ok((i, fold_binary(first, rest)))
}

fn add_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = mul_expr(i)?;
    let (i, rest) = many0(tuple((
        delimited(
            ws,
            alt((
                map(char('+'), |_| BinOp::Add),
                map(char('-'), |_| BinOp::Sub),
            )),
            ws,
        ),
        mul_expr,
    )))(i)?;
    Ok((i, fold_binary(first, rest)))
}

fn cmp_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = add_expr(i)?;
    let (i, rest) = opt(tuple((
        delimited(
            ws,
            alt((
                map(tag("=="), |_| BinOp::Eq),
                map(tag("!="), |_| BinOp::Ne),
                map(tag("<="), |_| BinOp::Le),
                map(tag(">="), |_| BinOp::Ge),
                map(tag("<"), |_| BinOp::Lt),
                map(tag(">"), |_| BinOp::Gt),
                map(tag("="), |_| BinOp::Eq),
            )),
            ws,
        ),
        add_expr,
    )))(i)?;
    match rest {
        Some((op, rhs)) => Ok((i, fold_binary(first, vec![(op, rhs)]))),
        None => Ok((i, first)),
    }
}

fn and_keyword(i: &str) -> IResult<&str, BinOp> {
    alt((
        map(tag("&&"), |_| BinOp::And),
        map(
            verify(take_while1(|c: char| c.is_ascii_alphabetic()), |w: &str| {
                w.eq_ignore_ascii_case("and")
            }),
            |_| BinOp::And,
        ),
    ))(i)
}

fn or_keyword(i: &str) -> IResult<&str, BinOp> {
    alt((
        map(tag("||"), |_| BinOp::Or),
        map(
            verify(take_while1(|c: char| c.is_ascii_alphabetic()), |w: &str| {
                w.eq_ignore_ascii_case("or")
            }),
            |_| BinOp::Or,
        ),
    ))(i)
}

fn and_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = cmp_expr(i)?;
    let (i, rest) = many0(tuple((delimited(ws, and_keyword, ws), cmp_expr)))(i)?;
    Ok((i, fold_binary(first, rest)))
}

fn or_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = and_expr(i)?;
    let (i, rest) = many0(tuple((delimited(ws, or_keyword, ws), and_expr)))(i)?;
    Ok((i, fold_binary(first, rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> Record {
        let mut r = Record::new(&b"GET /api/users done"[..]);
        r.attrs.insert("latency".into(), "250".into());
        r.attrs.insert("host".into(), "web1".into());
        r.write_ts = 1_000_000;
        r
    }

    fn eval(text: &str) -> Value {
        Expr::parse(text).unwrap().eval(&rec())
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(eval("10 / 4"), Value::Float(2.5));
        assert_eq!(eval("10 % 3"), Value::Int(1));
        assert_eq!(eval("1 / 0"), Value::Null);
    }

    #[test]
    fn fields_and_comparisons() {
        assert_eq!(eval("latency > 100"), Value::Bool(true));
        assert_eq!(eval("latency > 300"), Value::Bool(false));
        assert_eq!(eval("host == \"web1\""), Value::Bool(true));
        assert_eq!(eval("missing == null"), Value::Bool(true));
        assert_eq!(eval("_write_ts"), Value::Int(1_000_000));
    }

    #[test]
    fn boolean_logic() {
        assert_eq!(eval("latency > 100 and host == \"web1\""), Value::Bool(true));
        assert_eq!(eval("latency > 300 or host == \"web1\""), Value::Bool(true));
        assert_eq!(eval("!(latency > 100)"), Value::Bool(false));
    }

    #[test]
    fn functions() {
        assert_eq!(eval("len(host)"), Value::Int(4));
        assert_eq!(eval("upper(host)"), Value::Str("WEB1".into()));
        assert_eq!(eval("coalesce(missing, host)"), Value::Str("web1".into()));
        assert_eq!(eval("contains(_raw, \"api\")"), Value::Bool(true));
        assert_eq!(eval("tonumber(latency) + 50"), Value::Int(300));
        assert_eq!(eval("substr(host, 0, 3)"), Value::Str("web".into()));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval("host + \"-x\""), Value::Str("web1-x".into()));
    }

    #[test]
    fn unknown_function_rejected() {
        assert!(matches!(
            Expr::parse("frob(1)"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn timestamps_survive_arithmetic() {
        let big = 1_700_000_000_000_000_123i64;
        let mut r = rec();
        r.write_ts = big;
        let v = Expr::parse("_write_ts - 123").unwrap().eval(&r);
        assert_eq!(v, Value::Int(1_700_000_000_000_000_000));
    }
}
