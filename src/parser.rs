//! S-expression parser.
//!
//! Source text is whitespace-separated tokens: `(` … `)` forms a list,
//! `{` … `}` forms an object literal whose body is a sequence of `KEY EXPR`
//! pairs or `... EXPR` spreads, `"…"` forms a string with the escapes
//! `\" \\ \/ \n \t \r`, a leading `-` followed by a digit or `.` (or a bare
//! digit) begins a number, `'` quotes the following expression, and anything
//! else is a symbol terminated by whitespace, `(`, `)` or `}`.
//!
//! The parser produces an [`Expr`] tree; it performs no evaluation and no
//! heap allocation — symbols stay as plain strings until the compiler
//! interns them.

use std::fmt;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{opt, recognize},
    error::ErrorKind,
};

use crate::{MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Symbol(String),
    List(Vec<Expr>),
    Object(Vec<ObjectEntry>),
    Quote(Box<Expr>),
}

/// One entry of an object literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    /// `KEY EXPR`
    Pair(String, Expr),
    /// `... EXPR` — merge another object's entries
    Spread(Expr),
}

/// Parse a complete expression from `input`; trailing whitespace is allowed,
/// any other trailing content is an error.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    match parse_expr(input, 0) {
        Ok((rest, expr)) => {
            if rest.trim().is_empty() {
                Ok(expr)
            } else {
                let offset = input.len() - rest.len();
                Err(ParseError::with_context(
                    ParseErrorKind::TrailingContent,
                    format!("unexpected input after expression: '{}'", rest.trim()),
                    input,
                    offset,
                ))
            }
        }
        Err(err) => Err(convert_error(input, err)),
    }
}

fn parse_expr(input: &str, depth: usize) -> IResult<&str, Expr> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    let (input, _) = multispace0.parse(input)?;
    if input.is_empty() {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::Eof,
        )));
    }
    alt((
        |i| parse_quote(i, depth),
        |i| parse_list(i, depth),
        |i| parse_object(i, depth),
        parse_number,
        parse_string,
        parse_symbol,
    ))
    .parse(input)
}

/// Parse quoted expression ('expr)
fn parse_quote(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = char('\'').parse(input)?;
    let (input, inner) = parse_expr(input, depth + 1)?;
    Ok((input, Expr::Quote(Box::new(inner))))
}

fn parse_list(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (mut input, _) = char('(').parse(input)?;
    let mut items = Vec::new();
    loop {
        let (rest, _) = multispace0.parse(input)?;
        if let Some(after) = rest.strip_prefix(')') {
            return Ok((after, Expr::List(items)));
        }
        if rest.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                ErrorKind::Eof,
            )));
        }
        let (rest, item) = parse_expr(rest, depth + 1)?;
        items.push(item);
        input = rest;
    }
}

fn parse_object(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (mut input, _) = char('{').parse(input)?;
    let mut entries = Vec::new();
    loop {
        let (rest, _) = multispace0.parse(input)?;
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((after, Expr::Object(entries)));
        }
        if rest.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                ErrorKind::Eof,
            )));
        }
        let key_start = rest;
        let (rest, key) = parse_expr(rest, depth + 1)?;
        match key {
            // The three-dot token is an ordinary symbol; in key position it
            // marks a spread entry.
            Expr::Symbol(name) if name == "..." => {
                let (rest, value) = parse_expr(rest, depth + 1)?;
                entries.push(ObjectEntry::Spread(value));
                input = rest;
            }
            Expr::Symbol(name) => {
                let (rest, value) = parse_expr(rest, depth + 1)?;
                entries.push(ObjectEntry::Pair(name, value));
                input = rest;
            }
            _ => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    key_start,
                    ErrorKind::Tag,
                )));
            }
        }
    }
}

/// Parse a number: digits begin a number, as does a leading `-` followed by
/// a digit or `.`; one decimal point is allowed.
fn parse_number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = recognize((
        opt(char('-')),
        alt((
            recognize((digit1, opt((char('.'), take_while(|c: char| c.is_ascii_digit()))))),
            recognize((char('.'), digit1)),
        )),
    ))
    .parse(input)?;

    // A bare leading dot does not begin a number; ".5" is a symbol.
    if text.starts_with('.') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        )));
    }
    // The token must end at whitespace or a delimiter ("123abc" is not a
    // number and not a valid symbol either).
    if let Some(c) = rest.chars().next() {
        if !is_token_terminator(c) {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                ErrorKind::Digit,
            )));
        }
    }
    match text.parse::<f64>() {
        Ok(n) => Ok((rest, Expr::Number(n))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        ))),
    }
}

fn parse_string(input: &str) -> IResult<&str, Expr> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut chars = Vec::new();

    loop {
        let mut iter = remaining.chars();
        match iter.next() {
            Some('"') => {
                return Ok((iter.as_str(), Expr::Str(chars.into_iter().collect())));
            }
            Some('\\') => {
                match iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('/') => chars.push('/'),
                    Some('"') => chars.push('"'),
                    Some(_) => {
                        return Err(nom::Err::Failure(nom::error::Error::new(
                            remaining,
                            ErrorKind::Escaped,
                        )));
                    }
                    None => {
                        return Err(nom::Err::Failure(nom::error::Error::new(
                            remaining,
                            ErrorKind::Eof,
                        )));
                    }
                }
                remaining = iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = iter.as_str();
            }
            None => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    remaining,
                    ErrorKind::Eof,
                )));
            }
        }
    }
}

fn parse_symbol(input: &str) -> IResult<&str, Expr> {
    let (rest, token) = take_while1(|c: char| !is_token_terminator(c)).parse(input)?;
    if !is_symbol_token(token) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )));
    }
    Ok((rest, Expr::Symbol(token.to_string())))
}

/// Symbols (and numbers) end at whitespace, `(`, `)` or `}`.
fn is_token_terminator(c: char) -> bool {
    c.is_whitespace() || c == '(' || c == ')' || c == '}'
}

/// Anything not shaped like a number or string literal is a symbol.
fn is_symbol_token(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        None => false,
        Some('"') => false,
        Some(c) if c.is_ascii_digit() => false,
        Some('-') => !matches!(chars.next(), Some(c) if c.is_ascii_digit() || c == '.'),
        Some(_) => true,
    }
}

/// Convert nom errors to structured parse errors.
fn convert_error(input: &str, err: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = input.len().saturating_sub(e.input.len());
            match e.code {
                ErrorKind::Eof => ParseError::with_context(
                    ParseErrorKind::UnexpectedEof,
                    "unexpected end of input",
                    input,
                    offset,
                ),
                ErrorKind::Tag => ParseError::with_context(
                    ParseErrorKind::InvalidObjectKey,
                    "object literal keys must be symbols",
                    input,
                    offset,
                ),
                ErrorKind::TooLarge => ParseError::from_message(
                    ParseErrorKind::InvalidSyntax,
                    format!("expression nested deeper than {MAX_PARSE_DEPTH} levels"),
                ),
                _ => ParseError::with_context(
                    ParseErrorKind::InvalidSyntax,
                    "invalid syntax",
                    input,
                    offset,
                ),
            }
        }
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::UnexpectedEof, "incomplete input")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Str(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Symbol(s) => write!(f, "{s}"),
            Expr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Expr::Object(entries) => {
                write!(f, "{{")?;
                for entry in entries {
                    match entry {
                        ObjectEntry::Pair(key, value) => write!(f, " {key} {value}")?,
                        ObjectEntry::Spread(value) => write!(f, " ... {value}")?,
                    }
                }
                write!(f, " }}")
            }
            Expr::Quote(inner) => write!(f, "'{inner}"),
        }
    }
}
