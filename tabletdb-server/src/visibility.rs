//! Column-visibility expressions.
//!
//! A cell's visibility is a boolean expression over labels, e.g.
//! `admin & (audit | billing)`. A scanner or conditional writer sees the
//! cell only if its authorizations satisfy the expression. The empty
//! expression is visible to everyone.

use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0};
use nom::combinator::{all_consuming, map};
use nom::multi::separated_list1;
use nom::sequence::delimited;
use nom::IResult;
use tabletdb_common::Authorizations;
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// Parsed form of a visibility expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityExpr {
    /// A single label
    Label(Vec<u8>),
    /// All branches must be satisfied
    And(Vec<VisibilityExpr>),
    /// At least one branch must be satisfied
    Or(Vec<VisibilityExpr>),
}

impl VisibilityExpr {
    /// Parse an expression. The empty string parses to an expression that
    /// everyone satisfies.
    pub fn parse(expression: &[u8]) -> TabletDbResult<Option<VisibilityExpr>> {
        if expression.is_empty() {
            return Ok(None);
        }
        let input = std::str::from_utf8(expression).map_err(|_| {
            TabletDbError::InvalidArgument("visibility is not valid utf-8".into())
        })?;
        match all_consuming(expr)(input) {
            Ok((_, parsed)) => Ok(Some(parsed)),
            Err(_) => Err(TabletDbError::InvalidArgument(format!(
                "bad visibility expression: {input}"
            ))),
        }
    }

    /// Whether `auths` satisfies this expression.
    pub fn satisfied_by(&self, auths: &Authorizations) -> bool {
        match self {
            VisibilityExpr::Label(label) => auths.contains(label),
            VisibilityExpr::And(branches) => branches.iter().all(|b| b.satisfied_by(auths)),
            VisibilityExpr::Or(branches) => branches.iter().any(|b| b.satisfied_by(auths)),
        }
    }
}

/// Whether `auths` may see a cell carrying `visibility`.
pub fn can_see(visibility: &[u8], auths: &Authorizations) -> TabletDbResult<bool> {
    Ok(match VisibilityExpr::parse(visibility)? {
        None => true,
        Some(expr) => expr.satisfied_by(auths),
    })
}

fn expr(input: &str) -> IResult<&str, VisibilityExpr> {
    // & binds tighter than |
    alt((or_expr, and_expr, primary))(input)
}

fn or_expr(input: &str) -> IResult<&str, VisibilityExpr> {
    map(
        separated_list1(spaced(char('|')), alt((and_expr, primary))),
        |mut branches| {
            if branches.len() == 1 {
                branches.pop().expect("nonempty")
            } else {
                VisibilityExpr::Or(branches)
            }
        },
    )(input)
}

fn and_expr(input: &str) -> IResult<&str, VisibilityExpr> {
    map(separated_list1(spaced(char('&')), primary), |mut branches| {
        if branches.len() == 1 {
            branches.pop().expect("nonempty")
        } else {
            VisibilityExpr::And(branches)
        }
    })(input)
}

fn primary(input: &str) -> IResult<&str, VisibilityExpr> {
    alt((
        delimited(spaced(char('(')), expr, spaced(char(')'))),
        label,
    ))(input)
}

fn label(input: &str) -> IResult<&str, VisibilityExpr> {
    map(
        delimited(
            multispace0,
            take_while1(|c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')),
            multispace0,
        ),
        |s: &str| VisibilityExpr::Label(s.as_bytes().to_vec()),
    )(input)
}

fn spaced<'a, F>(parser: F) -> impl FnMut(&'a str) -> IResult<&'a str, char>
where
    F: FnMut(&'a str) -> IResult<&'a str, char>,
{
    delimited(multispace0, parser, multispace0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auths(labels: &[&str]) -> Authorizations {
        Authorizations::new(labels.iter().map(|l| l.as_bytes().to_vec()))
    }

    #[test]
    fn empty_visibility_is_public() {
        assert!(can_see(b"", &Authorizations::empty()).unwrap());
    }

    #[test]
    fn single_label() {
        assert!(can_see(b"admin", &auths(&["admin"])).unwrap());
        assert!(!can_see(b"admin", &auths(&["user"])).unwrap());
        assert!(!can_see(b"admin", &Authorizations::empty()).unwrap());
    }

    #[test]
    fn conjunction_and_disjunction() {
        assert!(can_see(b"a&b", &auths(&["a", "b"])).unwrap());
        assert!(!can_see(b"a&b", &auths(&["a"])).unwrap());
        assert!(can_see(b"a|b", &auths(&["b"])).unwrap());
        assert!(!can_see(b"a|b", &auths(&["c"])).unwrap());
    }

    #[test]
    fn parenthesized_nesting() {
        let expr = b"admin & (audit | billing)";
        assert!(can_see(expr, &auths(&["admin", "billing"])).unwrap());
        assert!(!can_see(expr, &auths(&["admin"])).unwrap());
        assert!(!can_see(expr, &auths(&["audit", "billing"])).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(can_see(b"a &", &auths(&["a"])).is_err());
        assert!(can_see(b"(a", &auths(&["a"])).is_err());
        assert!(can_see(b"&a", &auths(&["a"])).is_err());
    }
}
