//! Expression grammar
//!
//! Precedence, loosest first:
//!
//! ```text
//! conditional  := or ( "?" conditional ":" conditional )?
//! or           := and ( ("||" | "or") and )*
//! and          := equality ( ("&&" | "and") equality )*
//! equality     := comparison ( ("===" | "!==" | "==" | "!=") comparison )*
//! comparison   := additive ( ("<=" | ">=" | "<" | ">") additive )*
//! additive     := multiplicative ( ("+" | "-") multiplicative )*
//! multiplicative := unary ( ("*" | "/" | "%") unary )*
//! unary        := ("!" | "not" | "-") unary | postfix
//! postfix      := primary ( "." ident | "[" conditional "]" )*
//! primary      := number | string | true | false | null | ident | "(" conditional ")"
//! ```

use super::ast::{BinaryOp, Expr, UnaryOp};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value, verify},
    error::{context, ErrorKind, ParseError as _, VerboseError, VerboseErrorKind},
    multi::fold_many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde_json::Value;
use thiserror::Error;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

const RESERVED: [&str; 6] = ["true", "false", "null", "and", "or", "not"];

/// Malformed expression text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }

    fn from_verbose(source: &str, error: &VerboseError<&str>) -> Self {
        let Some((remaining, _)) = error.errors.first() else {
            return Self::new("invalid expression", 0);
        };
        let offset = source.len() - remaining.len();
        let expected = error.errors.iter().find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(ctx) => Some(*ctx),
            _ => None,
        });

        let found = match remaining.chars().next() {
            Some(c) => format!("unexpected '{c}'"),
            None => "unexpected end of expression".to_string(),
        };
        match expected {
            Some(ctx) if ctx.starts_with("unterminated") || ctx == TOO_DEEP => Self::new(ctx, offset),
            Some(ctx) => Self::new(format!("{found}, expected {ctx}"), offset),
            None => Self::new(found, offset),
        }
    }
}

/// Deepest allowed nesting of parentheses, indexes, ternaries and unary operators.
pub const MAX_NESTING: usize = 64;

/// Longest accepted source; binary chains build one tree level per operator.
pub const MAX_SOURCE_LEN: usize = 1024;

const TOO_DEEP: &str = "expression nested too deeply";

/// Parse expression text into a syntax tree.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    if source.trim().is_empty() {
        return Err(ParseError::new("empty expression", 0));
    }
    if source.len() > MAX_SOURCE_LEN {
        return Err(ParseError::new(
            format!("expression longer than {MAX_SOURCE_LEN} bytes"),
            MAX_SOURCE_LEN,
        ));
    }
    match all_consuming(terminated(|i| conditional(i, 0), multispace0))(source) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(ParseError::from_verbose(source, &e)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::new("incomplete expression", source.len())),
    }
}

fn sp<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    preceded(multispace0, inner)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

/// Run `inner` one level deeper, failing hard once the budget is spent.
fn nested<'a>(
    input: &'a str,
    depth: usize,
    inner: fn(&'a str, usize) -> PResult<'a, Expr>,
) -> PResult<'a, Expr> {
    if depth >= MAX_NESTING {
        return Err(nom::Err::Failure(VerboseError {
            errors: vec![(input, VerboseErrorKind::Context(TOO_DEEP))],
        }));
    }
    inner(input, depth + 1)
}

// ============================================================================
// Binary levels
// ============================================================================

fn binary_level<'a>(
    input: &'a str,
    depth: usize,
    operand: fn(&'a str, usize) -> PResult<'a, Expr>,
    operator: fn(&'a str) -> PResult<'a, BinaryOp>,
) -> PResult<'a, Expr> {
    let (input, first) = operand(input, depth)?;
    fold_many0(
        pair(operator, move |i| operand(i, depth)),
        move || first.clone(),
        |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
    )(input)
}

fn conditional(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, test) = logical_or(input, depth)?;
    let (input, branches) = opt(pair(
        preceded(sp(char('?')), |i| nested(i, depth, conditional)),
        preceded(sp(char(':')), |i| nested(i, depth, conditional)),
    ))(input)?;
    let expr = match branches {
        Some((then, otherwise)) => {
            Expr::Conditional(Box::new(test), Box::new(then), Box::new(otherwise))
        }
        None => test,
    };
    Ok((input, expr))
}

fn logical_or(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, logical_and, or_op)
}

fn logical_and(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, equality, and_op)
}

fn equality(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, comparison, equality_op)
}

fn comparison(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, additive, comparison_op)
}

fn additive(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, multiplicative, additive_op)
}

fn multiplicative(input: &str, depth: usize) -> PResult<'_, Expr> {
    binary_level(input, depth, unary, multiplicative_op)
}

fn or_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::Or, tag("||")),
        value(BinaryOp::Or, keyword("or")),
    )))(input)
}

fn and_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::And, tag("&&")),
        value(BinaryOp::And, keyword("and")),
    )))(input)
}

fn equality_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::Eq, tag("===")),
        value(BinaryOp::Ne, tag("!==")),
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
    )))(input)
}

fn comparison_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
    )))(input)
}

fn additive_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::Add, char('+')),
        value(BinaryOp::Sub, char('-')),
    )))(input)
}

fn multiplicative_op(input: &str) -> PResult<'_, BinaryOp> {
    sp(alt((
        value(BinaryOp::Mul, char('*')),
        value(BinaryOp::Div, char('/')),
        value(BinaryOp::Rem, char('%')),
    )))(input)
}

// ============================================================================
// Unary, postfix and primary
// ============================================================================

fn unary(input: &str, depth: usize) -> PResult<'_, Expr> {
    alt((
        map(
            preceded(sp(alt((tag("!"), keyword("not")))), |i| nested(i, depth, unary)),
            |operand| Expr::unary(UnaryOp::Not, operand),
        ),
        map(preceded(sp(char('-')), |i| nested(i, depth, unary)), |operand| {
            Expr::unary(UnaryOp::Neg, operand)
        }),
        |i| postfix(i, depth),
    ))(input)
}

enum Accessor {
    Member(String),
    Index(Expr),
}

fn postfix(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, base) = primary(input, depth)?;
    fold_many0(
        alt((
            map(preceded(sp(char('.')), sp(identifier_text)), |name: &str| {
                Accessor::Member(name.to_string())
            }),
            map(
                delimited(
                    sp(char('[')),
                    |i| nested(i, depth, conditional),
                    sp(char(']')),
                ),
                Accessor::Index,
            ),
        )),
        move || base.clone(),
        |target, accessor| match accessor {
            Accessor::Member(name) => Expr::Member(Box::new(target), name),
            Accessor::Index(index) => Expr::Index(Box::new(target), Box::new(index)),
        },
    )(input)
}

fn primary(input: &str, depth: usize) -> PResult<'_, Expr> {
    sp(alt((
        context("number", map(number, Expr::Literal)),
        context(
            "string",
            map(string_literal, |text| Expr::Literal(Value::String(text))),
        ),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        map(identifier, |name: &str| Expr::Ident(name.to_string())),
        context(
            "expression",
            delimited(char('('), |i| nested(i, depth, conditional), sp(char(')'))),
        ),
    )))(input)
}

fn identifier_text(input: &str) -> PResult<'_, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

fn identifier(input: &str) -> PResult<'_, &str> {
    context(
        "identifier",
        verify(identifier_text, |name: &str| !RESERVED.contains(&name)),
    )(input)
}

fn number(input: &str) -> PResult<'_, Value> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        number_literal,
    )(input)
}

fn number_literal(text: &str) -> Result<Value, String> {
    if !text.contains('.') {
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::from(int));
        }
    }
    let float: f64 = text.parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    serde_json::Number::from_f64(float)
        .map(Value::Number)
        .ok_or_else(|| format!("number out of range: {text}"))
}

/// Single- or double-quoted string with backslash escapes.
fn string_literal(input: &str) -> PResult<'_, String> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, c @ ('"' | '\''))) => c,
        _ => {
            return Err(nom::Err::Error(VerboseError::from_error_kind(
                input,
                ErrorKind::Char,
            )))
        }
    };

    let mut text = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            text.push(match c {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            let (_, rest) = input.split_at(idx + c.len_utf8());
            return Ok((rest, text));
        } else {
            text.push(c);
        }
    }

    Err(nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context("unterminated string"))],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn lit(v: Value) -> Expr {
        Expr::Literal(v)
    }

    #[test]
    fn test_precedence_multiplication_binds_tighter() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::Add,
                lit(json!(1)),
                Expr::binary(BinaryOp::Mul, lit(json!(2)), lit(json!(3)))
            )
        );
    }

    #[test]
    fn test_left_associative_subtraction() {
        let expr = parse("10 - 4 - 3").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::Sub,
                Expr::binary(BinaryOp::Sub, lit(json!(10)), lit(json!(4))),
                lit(json!(3))
            )
        );
    }

    #[test]
    fn test_member_and_index_access() {
        let expr = parse("responses.amount[0]").unwrap();
        assert_eq!(
            expr,
            Expr::Index(
                Box::new(Expr::Member(
                    Box::new(ident("responses")),
                    "amount".to_string()
                )),
                Box::new(lit(json!(0)))
            )
        );
    }

    #[test]
    fn test_keywords_are_not_identifiers() {
        assert_eq!(parse("true").unwrap(), lit(json!(true)));
        assert_eq!(parse("null").unwrap(), lit(Value::Null));
        // Identifiers that merely start with a keyword stay identifiers
        assert_eq!(parse("order").unwrap(), ident("order"));
        assert_eq!(parse("notes").unwrap(), ident("notes"));
    }

    #[test]
    fn test_word_and_symbol_logic_operators() {
        let words = parse("a and not b or c").unwrap();
        let symbols = parse("a && !b || c").unwrap();
        assert_eq!(words, symbols);
    }

    #[test]
    fn test_equality_variants_are_strict() {
        assert_eq!(parse("a == 1").unwrap(), parse("a === 1").unwrap());
        assert_eq!(parse("a != 1").unwrap(), parse("a !== 1").unwrap());
    }

    #[test]
    fn test_strings_with_escapes() {
        assert_eq!(parse(r#""say \"hi\"""#).unwrap(), lit(json!("say \"hi\"")));
        assert_eq!(parse("'it\\'s'").unwrap(), lit(json!("it's")));
        assert_eq!(parse("'日本'").unwrap(), lit(json!("日本")));
    }

    #[test]
    fn test_conditional_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").unwrap();
        match expr {
            Expr::Conditional(_, _, otherwise) => {
                assert!(matches!(*otherwise, Expr::Conditional(..)));
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn test_fractional_numbers() {
        assert_eq!(parse("1.5").unwrap(), lit(json!(1.5)));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("a = 1").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let inside = format!("{}1{}", "(".repeat(MAX_NESTING - 1), ")".repeat(MAX_NESTING - 1));
        assert_eq!(parse(&inside).unwrap(), lit(json!(1)));

        let parens = format!("{}1{}", "(".repeat(400), ")".repeat(400));
        assert_eq!(parse(&parens).unwrap_err().message, "expression nested too deeply");

        let nots = format!("{}true", "!".repeat(500));
        assert_eq!(parse(&nots).unwrap_err().message, "expression nested too deeply");

        let ternaries = "a ? ".repeat(100) + "1" + &" : 2".repeat(100);
        assert_eq!(parse(&ternaries).unwrap_err().message, "expression nested too deeply");

        let indexes = format!("{}0{}", "a[".repeat(100), "]".repeat(100));
        assert_eq!(parse(&indexes).unwrap_err().message, "expression nested too deeply");
    }

    #[test]
    fn test_overlong_source_is_rejected() {
        let chain = format!("1{}", " + 1".repeat(MAX_SOURCE_LEN));
        let err = parse(&chain).unwrap_err();
        assert!(err.message.contains("longer than"), "{}", err.message);
        assert!(parse(&format!("1{}", "+1".repeat(200))).is_ok());
    }

    #[test]
    fn test_error_reports_offset() {
        let err = parse("amount > ").unwrap_err();
        assert!(err.offset >= 6, "offset was {}", err.offset);

        let err = parse("'open").unwrap_err();
        assert_eq!(err.message, "unterminated string");
    }
}
