//! Token recognizers for formula source.
//!
//! The parser drives these one position at a time: [`atom`] at the start of
//! an operand and [`infix`] after one. Alternatives are tried in a fixed
//! priority order, so `log10` is matched before `log` and numbers before
//! identifiers.

use chrono::{NaiveDate, NaiveDateTime};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit0, digit1, multispace0, one_of, satisfy},
    combinator::{map, map_res, not, opt, recognize, value},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

use crate::formula::ast::{BinaryOp, NullableOp, RelationOp, UnaryOp, TERNARY_PRECEDENCE};
use crate::formula::value::Value;

/// An operand-position token.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom<'a> {
    Open,
    /// Prefix `-`, `+` or `!`.
    Prefix(char),
    Number(f64),
    Letter(&'a str),
    /// `letter(95)`: a letter grade given by its numeric encoding.
    LetterCode(f64),
    /// `pi`, `null`, `true` and `false`.
    Constant(Value),
    Now,
    Unary(UnaryOp),
    /// `min`, `max`, `rank` or `rlookup`; an argument list follows.
    Function(&'a str),
    /// `is:x`, `year:1-4`, `namematch:text`.
    Predicate(&'a str, &'a str),
    /// Text after `@`.
    Time(&'a str),
    /// `pset.entry`, `self.entry` or `global.name`.
    Pair(&'a str, &'a str),
    Word(&'a str),
}

/// An operator-position token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Infix {
    Binary(BinaryOp),
    Relation(RelationOp),
    Nullable(NullableOp),
    /// `?` of a ternary.
    Question,
}

impl Infix {
    pub fn precedence(&self) -> u8 {
        match self {
            Infix::Binary(op) => op.precedence(),
            Infix::Relation(op) => op.precedence(),
            Infix::Nullable(op) => op.precedence(),
            Infix::Question => TERNARY_PRECEDENCE,
        }
    }
}

pub fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn boundary(input: &str) -> IResult<&str, ()> {
    not(satisfy(is_word_char)).parse(input)
}

pub fn word(input: &str) -> IResult<&str, &str> {
    take_while1(is_word_char).parse(input)
}

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        alt((
            recognize((digit1, opt(char('.')), digit0)),
            recognize((char('.'), digit1)),
        )),
        str::parse::<f64>,
    )
    .parse(input)
}

/// `A`..`D` with an optional sign, or `F`. The sign is given back when it
/// would glue the letter to a following word.
fn letter_grade(input: &str) -> IResult<&str, &str> {
    alt((
        terminated(recognize((one_of("ABCD"), one_of("+-"))), boundary),
        terminated(recognize(one_of("ABCDF")), boundary),
    ))
    .parse(input)
}

/// Whether `text` is exactly one letter grade token.
pub fn is_letter_grade(text: &str) -> bool {
    matches!(letter_grade(text), Ok(("", _)))
}

fn letter_code(input: &str) -> IResult<&str, f64> {
    delimited(
        (tag("letter"), multispace0, char('('), multispace0),
        signed_number,
        (multispace0, char(')')),
    )
    .parse(input)
}

fn constant(input: &str) -> IResult<&str, Value> {
    alt((
        value(
            Value::Number(std::f64::consts::PI),
            terminated(alt((tag_no_case("m_pi"), tag_no_case("pi"), tag("π"))), boundary),
        ),
        value(Value::Null, terminated(tag("null"), boundary)),
        value(Value::Boolean(true), terminated(tag("true"), boundary)),
        value(Value::Boolean(false), terminated(tag("false"), boundary)),
    ))
    .parse(input)
}

fn unary_function(input: &str) -> IResult<&str, UnaryOp> {
    terminated(
        alt((
            value(UnaryOp::Log10, tag("log10")),
            value(UnaryOp::Log10, tag("log")),
            value(UnaryOp::Ln, tag("ln")),
            value(UnaryOp::Lg, tag("lg")),
            value(UnaryOp::Exp, tag("exp")),
        )),
        boundary,
    )
    .parse(input)
}

fn function_name(input: &str) -> IResult<&str, &str> {
    terminated(
        alt((tag("min"), tag("max"), tag("rlookup"), tag("rank"))),
        boundary,
    )
    .parse(input)
}

fn predicate(input: &str) -> IResult<&str, (&str, &str)> {
    alt((
        (
            terminated(alt((tag("is"), tag("year"))), char(':')),
            take_while(|c: char| is_word_char(c) || matches!(c, '-' | '–' | '—' | ',')),
        ),
        (
            terminated(tag("namematch"), char(':')),
            alt((
                delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
                take_while(is_pattern_char),
            )),
        ),
    ))
    .parse(input)
}

/// Characters a `namematch:` pattern may hold without quotes.
pub fn is_pattern_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '"')
}

fn time_literal(input: &str) -> IResult<&str, &str> {
    preceded(
        char('@'),
        take_while1(|c: char| c.is_ascii_digit() || matches!(c, '-' | ':' | 'T' | 'Z')),
    )
    .parse(input)
}

fn pair(input: &str) -> IResult<&str, (&str, &str)> {
    (word, delimited(multispace0, char('.'), multispace0), word)
        .map(|(a, _, b)| (a, b))
        .parse(input)
}

/// Recognize the token that starts an operand.
pub fn atom(input: &str) -> IResult<&str, Atom<'_>> {
    alt((
        value(Atom::Open, char('(')),
        map(one_of("-+!"), Atom::Prefix),
        map(number, Atom::Number),
        map(letter_grade, Atom::Letter),
        map(constant, Atom::Constant),
        value(Atom::Now, terminated(tag("now"), boundary)),
        map(unary_function, Atom::Unary),
        map(function_name, Atom::Function),
        map(letter_code, Atom::LetterCode),
        map(predicate, |(kind, arg)| Atom::Predicate(kind, arg)),
        map(time_literal, Atom::Time),
        map(pair, |(a, b)| Atom::Pair(a, b)),
        map(word, Atom::Word),
    ))
    .parse(input)
}

/// Recognize a binary or ternary operator, normalizing synonyms.
pub fn infix(input: &str) -> IResult<&str, Infix> {
    use Infix::*;
    alt((
        value(Binary(BinaryOp::Pow), tag("**")),
        value(Nullable(NullableOp::AddOrZero), tag("+?")),
        value(Nullable(NullableOp::Coalesce), tag("??")),
        map(relation, Relation),
        value(Nullable(NullableOp::And), tag("&&")),
        value(Nullable(NullableOp::Or), tag("||")),
        value(Nullable(NullableOp::Xor), tag("^^")),
        value(Binary(BinaryOp::Add), char('+')),
        value(Binary(BinaryOp::Sub), char('-')),
        value(Binary(BinaryOp::Mul), char('*')),
        value(Binary(BinaryOp::Div), char('/')),
        value(Binary(BinaryOp::Rem), char('%')),
        value(Question, char('?')),
    ))
    .parse(input)
}

/// Recognize a comparison operator, normalizing `=`, `≠`, `≤` and `≥`.
pub fn relation(input: &str) -> IResult<&str, RelationOp> {
    alt((
        value(RelationOp::Le, alt((tag("<="), tag("≤")))),
        value(RelationOp::Ge, alt((tag(">="), tag("≥")))),
        value(RelationOp::Eq, alt((tag("=="), tag("=")))),
        value(RelationOp::Ne, alt((tag("!="), tag("≠")))),
        value(RelationOp::Lt, char('<')),
        value(RelationOp::Gt, char('>')),
    ))
    .parse(input)
}

/// A decimal number with an optional sign, as used in search comparisons.
pub fn signed_number(input: &str) -> IResult<&str, f64> {
    (opt(one_of("+-")), number)
        .map(|(sign, n)| if sign == Some('-') { -n } else { n })
        .parse(input)
}

/// Seconds since the epoch for the text of an `@` literal.
///
/// Ten or more bare digits are a raw timestamp. Anything else is a UTC
/// calendar time from year 2000 on, as precise as `YYYY-MM-DDTHH:MM:SS`.
pub fn parse_time(text: &str) -> Option<i64> {
    let text = text.strip_suffix('Z').unwrap_or(text);
    if text.len() >= 10 && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok();
    }
    let year: i32 = text.get(..4)?.parse().ok()?;
    if year < 2000 {
        return None;
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    let date = match text.len() {
        4 => format!("{text}-01-01"),
        7 => format!("{text}-01"),
        _ => text.to_string(),
    };
    let day = NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}
