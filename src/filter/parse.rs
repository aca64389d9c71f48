//! Filter grammar parser.
//!
//! Parsing is split from compilation: the parser produces a raw tree with
//! uncompiled pattern strings, and [`compile`](crate::filter::compile)
//! validates regexes and numeric operands with proper error reporting.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, verify},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::{Error, Result};

/// Raw parse tree; pattern and number operands are still strings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawExpr {
    All,
    Token(String),
    Predicate {
        key: String,
        op: RawOp,
        value: String,
        quoted: bool,
    },
    And(Vec<RawExpr>),
    Or(Vec<RawExpr>),
    Not(Box<RawExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawOp {
    Eq,
    Tilde,
    Gt,
    Ge,
    Lt,
    Le,
}

fn is_ident_byte(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn is_keyword(word: &str) -> bool {
    word.eq_ignore_ascii_case("and")
        || word.eq_ignore_ascii_case("or")
        || word.eq_ignore_ascii_case("not")
}

fn ident(i: &str) -> IResult<&str, &str> {
    verify(take_while1(is_ident_byte), |word: &str| !is_keyword(word))(i)
}

fn bare_value(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '(' && c != ')')(i)
}

// quoted string without escape processing, consistent with the kv
// extraction in the indexer
fn quoted_value(i: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while_quoted, char('"'))(i)
}

fn take_while_quoted(i: &str) -> IResult<&str, &str> {
    let end = i.find('"').unwrap_or(i.len());
    Ok((&i[end..], &i[..end]))
}

fn operator(i: &str) -> IResult<&str, RawOp> {
    alt((
        map(tag(">="), |_| RawOp::Ge),
        map(tag("<="), |_| RawOp::Le),
        map(tag(">"), |_| RawOp::Gt),
        map(tag("<"), |_| RawOp::Lt),
        map(tag("="), |_| RawOp::Eq),
        map(tag("~"), |_| RawOp::Tilde),
    ))(i)
}

fn predicate(i: &str) -> IResult<&str, RawExpr> {
    map(
        tuple((
            ident,
            operator,
            alt((
                map(quoted_value, |v: &str| (v, true)),
                map(bare_value, |v: &str| (v, false)),
            )),
        )),
        |(key, op, (value, quoted))| RawExpr::Predicate {
            key: key.to_owned(),
            op,
            value: value.to_owned(),
            quoted,
        },
    )(i)
}

fn token(i: &str) -> IResult<&str, RawExpr> {
    map(ident, |word: &str| RawExpr::Token(word.to_ascii_lowercase()))(i)
}

fn group(i: &str) -> IResult<&str, RawExpr> {
    delimited(
        pair(char('('), multispace0),
        or_expr,
        pair(multispace0, char(')')),
    )(i)
}

fn primary(i: &str) -> IResult<&str, RawExpr> {
    alt((
        group,
        map(char('*'), |_| RawExpr::All),
        predicate,
        token,
    ))(i)
}

fn not_expr(i: &str) -> IResult<&str, RawExpr> {
    alt((
        map(
            preceded(pair(tag_no_case("not"), multispace1), not_expr),
            |inner| RawExpr::Not(Box::new(inner)),
        ),
        primary,
    ))(i)
}

// juxtaposition is AND; the explicit keyword is accepted too
fn and_expr(i: &str) -> IResult<&str, RawExpr> {
    let (i, first) = not_expr(i)?;
    let (i, rest) = many0(alt((
        preceded(
            tuple((multispace1, tag_no_case("and"), multispace1)),
            not_expr,
        ),
        preceded(multispace1, not_expr),
    )))(i)?;
    if rest.is_empty() {
        return Ok((i, first));
    }
    let mut children = vec![first];
    children.extend(rest);
    Ok((i, RawExpr::And(children)))
}

fn or_expr(i: &str) -> IResult<&str, RawExpr> {
    let (i, first) = and_expr(i)?;
    let (i, rest) = many0(preceded(
        tuple((multispace1, tag_no_case("or"), multispace1)),
        and_expr,
    ))(i)?;
    if rest.is_empty() {
        return Ok((i, first));
    }
    let mut children = vec![first];
    children.extend(rest);
    Ok((i, RawExpr::Or(children)))
}

pub(crate) fn parse_raw(input: &str) -> Result<RawExpr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("empty filter expression"));
    }
    match all_consuming(delimited(multispace0, or_expr, multispace0))(trimmed) {
        Ok((_, expr)) => Ok(expr),
        Err(_) => Err(Error::invalid(format!("bad filter expression '{}'", input))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> RawExpr {
        RawExpr::Token(s.into())
    }

    #[test]
    fn bare_tokens_lowercase() {
        assert_eq!(parse_raw("Error").unwrap(), token("error"));
    }

    #[test]
    fn juxtaposition_is_and() {
        assert_eq!(
            parse_raw("user login").unwrap(),
            RawExpr::And(vec![token("user"), token("login")])
        );
        assert_eq!(
            parse_raw("user AND login").unwrap(),
            RawExpr::And(vec![token("user"), token("login")])
        );
    }

    #[test]
    fn or_binds_looser_than_and() {
        assert_eq!(
            parse_raw("a b OR c").unwrap(),
            RawExpr::Or(vec![
                RawExpr::And(vec![token("a"), token("b")]),
                token("c"),
            ])
        );
    }

    #[test]
    fn grouping_and_not() {
        assert_eq!(
            parse_raw("NOT (a OR b)").unwrap(),
            RawExpr::Not(Box::new(RawExpr::Or(vec![token("a"), token("b")])))
        );
    }

    #[test]
    fn predicates() {
        assert_eq!(
            parse_raw("host=web1").unwrap(),
            RawExpr::Predicate {
                key: "host".into(),
                op: RawOp::Eq,
                value: "web1".into(),
                quoted: false,
            }
        );
        assert_eq!(
            parse_raw("level~\"err*\"").unwrap(),
            RawExpr::Predicate {
                key: "level".into(),
                op: RawOp::Tilde,
                value: "err*".into(),
                quoted: true,
            }
        );
        assert_eq!(
            parse_raw("latency>=250").unwrap(),
            RawExpr::Predicate {
                key: "latency".into(),
                op: RawOp::Ge,
                value: "250".into(),
                quoted: false,
            }
        );
    }

    #[test]
    fn star_matches_all() {
        assert_eq!(parse_raw("*").unwrap(), RawExpr::All);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_raw("").is_err());
        assert!(parse_raw("AND").is_err());
        assert!(parse_raw("(unclosed").is_err());
        assert!(parse_raw("a OR").is_err());
    }

    #[test]
    fn quoted_values_keep_spaces() {
        assert_eq!(
            parse_raw("msg=\"user logged in\"").unwrap(),
            RawExpr::Predicate {
                key: "msg".into(),
                op: RawOp::Eq,
                value: "user logged in".into(),
                quoted: true,
            }
        );
    }
}
