//! Boolean search queries over the roster.
//!
//! A query is a sequence of terms combined with `NOT` (`-`, `!`), `AND`
//! (`&&` or plain juxtaposition), `XOR` (`^^`) and `OR` (`||`), binding in
//! that order, with parentheses for grouping. A term is a word, a
//! `"quoted phrase"`, or `keyword:text` where the text may itself be quoted.
//! The parser never fails: unbalanced parentheses and dangling operators are
//! tolerated.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, one_of},
    combinator::{map, opt, value},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    And(Vec<SearchQuery>),
    Or(Vec<SearchQuery>),
    Xor(Vec<SearchQuery>),
    /// `None` when the operator had no operand.
    Not(Option<Box<SearchQuery>>),
    Term(SearchTerm),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchTerm {
    pub keyword: Option<String>,
    pub text: String,
    pub quoted: bool,
}

impl SearchTerm {
    pub fn text(text: impl Into<String>) -> Self {
        SearchTerm {
            keyword: None,
            text: text.into(),
            quoted: false,
        }
    }

    pub fn keyword(keyword: impl Into<String>, text: impl Into<String>) -> Self {
        SearchTerm {
            keyword: Some(keyword.into()),
            text: text.into(),
            quoted: false,
        }
    }
}

impl SearchQuery {
    pub fn parse(text: &str) -> SearchQuery {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SearchQuery::Term(SearchTerm::default());
        }
        let mut parser = QueryParser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let mut parts = vec![parser.or()];
        // only an unmatched `)` stops `or` early
        while parser.pos < parser.tokens.len() {
            parser.pos += 1;
            let part = parser.or();
            if !part.is_empty() {
                parts.push(part);
            }
        }
        collapse(parts, SearchQuery::And)
    }

    fn is_empty(&self) -> bool {
        matches!(self, SearchQuery::And(items) if items.is_empty())
    }
}

fn collapse(mut items: Vec<SearchQuery>, group: fn(Vec<SearchQuery>) -> SearchQuery) -> SearchQuery {
    if items.len() == 1 {
        items.remove(0)
    } else {
        group(items)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Xor,
    Not,
    Term(SearchTerm),
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), opt(char('"'))).parse(input)
}

fn bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, '(' | ')' | '"')).parse(input)
}

fn keyword(input: &str) -> IResult<&str, &str> {
    terminated(
        take_while1(|c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.')),
        char(':'),
    )
    .parse(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    preceded(
        multispace0,
        alt((
            value(Token::Open, char('(')),
            value(Token::Close, char(')')),
            value(Token::And, tag("&&")),
            value(Token::Or, tag("||")),
            value(Token::Xor, tag("^^")),
            value(Token::Not, one_of("-!")),
            map(quoted, |text| {
                Token::Term(SearchTerm {
                    quoted: true,
                    ..SearchTerm::text(text)
                })
            }),
            map(
                (
                    keyword,
                    alt((map(quoted, |t| (t, true)), map(opt(bare), |t| (t.unwrap_or(""), false)))),
                ),
                |(keyword, (text, quoted))| {
                    Token::Term(SearchTerm {
                        quoted,
                        ..SearchTerm::keyword(keyword, text)
                    })
                },
            ),
            map(bare, |word| match word {
                "AND" => Token::And,
                "OR" => Token::Or,
                "XOR" => Token::Xor,
                "NOT" => Token::Not,
                _ => Token::Term(SearchTerm::text(word)),
            }),
        )),
    )
    .parse(input)
}

fn tokenize(mut input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    while !input.trim_start().is_empty() {
        match token(input) {
            Ok((rest, t)) => {
                tokens.push(t);
                input = rest;
            }
            Err(_) => break,
        }
    }
    tokens
}

/// Deepest nesting of groups and negations that is parsed. Anything
/// deeper is read as an empty group.
const MAX_NESTING: usize = 64;

struct QueryParser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl QueryParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> SearchQuery {
        let mut items = vec![self.xor()];
        while self.eat(&Token::Or) {
            items.push(self.xor());
        }
        collapse(items, SearchQuery::Or)
    }

    fn xor(&mut self) -> SearchQuery {
        let mut items = vec![self.and()];
        while self.eat(&Token::Xor) {
            items.push(self.and());
        }
        collapse(items, SearchQuery::Xor)
    }

    fn and(&mut self) -> SearchQuery {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::Close | Token::Or | Token::Xor) => break,
                Some(Token::And) => self.pos += 1,
                Some(_) => items.push(self.unary()),
            }
        }
        collapse(items, SearchQuery::And)
    }

    /// Skip to the `)` that closes the current group, or to the end.
    fn skip_group(&mut self) {
        let mut open = 0;
        while let Some(token) = self.peek() {
            match token {
                Token::Open => open += 1,
                Token::Close if open == 0 => break,
                Token::Close => open -= 1,
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> T) -> T {
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> SearchQuery {
        if self.depth >= MAX_NESTING {
            self.skip_group();
            return SearchQuery::And(Vec::new());
        }
        let token = self.peek().cloned();
        self.pos += 1;
        match token {
            Some(Token::Not) => match self.peek() {
                None | Some(Token::Close | Token::And | Token::Or | Token::Xor) => {
                    SearchQuery::Not(None)
                }
                Some(_) => SearchQuery::Not(Some(Box::new(self.nested(Self::unary)))),
            },
            Some(Token::Open) => {
                let inner = self.nested(Self::or);
                self.eat(&Token::Close);
                inner
            }
            Some(Token::Term(term)) => SearchQuery::Term(term),
            _ => SearchQuery::And(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str) -> SearchQuery {
        SearchQuery::Term(SearchTerm::text(text))
    }

    #[test]
    fn test_terms() {
        assert_eq!(SearchQuery::parse("ada"), word("ada"));
        assert_eq!(
            SearchQuery::parse(r#""ada lovelace""#),
            SearchQuery::Term(SearchTerm {
                keyword: None,
                text: "ada lovelace".to_string(),
                quoted: true,
            })
        );
        assert_eq!(
            SearchQuery::parse("pset1.tests:>=80"),
            SearchQuery::Term(SearchTerm::keyword("pset1.tests", ">=80"))
        );
        assert_eq!(
            SearchQuery::parse(r#"name:"de la""#),
            SearchQuery::Term(SearchTerm {
                keyword: Some("name".to_string()),
                text: "de la".to_string(),
                quoted: true,
            })
        );
        assert_eq!(SearchQuery::parse(""), SearchQuery::Term(SearchTerm::default()));
        assert_eq!(SearchQuery::parse("tests>=80"), word("tests>=80"));
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(
            SearchQuery::parse("a b OR c"),
            SearchQuery::Or(vec![
                SearchQuery::And(vec![word("a"), word("b")]),
                word("c"),
            ])
        );
        assert_eq!(
            SearchQuery::parse("a || b ^^ c && d"),
            SearchQuery::Or(vec![
                word("a"),
                SearchQuery::Xor(vec![
                    word("b"),
                    SearchQuery::And(vec![word("c"), word("d")]),
                ]),
            ])
        );
        assert_eq!(
            SearchQuery::parse("NOT a AND -b"),
            SearchQuery::And(vec![
                SearchQuery::Not(Some(Box::new(word("a")))),
                SearchQuery::Not(Some(Box::new(word("b")))),
            ])
        );
        assert_eq!(
            SearchQuery::parse("(a OR b) c"),
            SearchQuery::And(vec![
                SearchQuery::Or(vec![word("a"), word("b")]),
                word("c"),
            ])
        );
    }

    #[test]
    fn test_tolerates_malformed_input() {
        assert_eq!(SearchQuery::parse("NOT"), SearchQuery::Not(None));
        assert_eq!(SearchQuery::parse("(a"), word("a"));
        assert_eq!(
            SearchQuery::parse("a) b"),
            SearchQuery::And(vec![word("a"), word("b")])
        );
        assert_eq!(SearchQuery::parse("()"), SearchQuery::And(Vec::new()));
        assert_eq!(
            SearchQuery::parse("a OR"),
            SearchQuery::Or(vec![word("a"), SearchQuery::And(Vec::new())])
        );
    }

    fn depth(query: &SearchQuery) -> usize {
        1 + match query {
            SearchQuery::And(items) | SearchQuery::Or(items) | SearchQuery::Xor(items) => {
                items.iter().map(depth).max().unwrap_or(0)
            }
            SearchQuery::Not(inner) => inner.as_deref().map_or(0, depth),
            SearchQuery::Term(_) => 0,
        }
    }

    #[test]
    fn test_deep_nesting_is_cut_off() {
        let deep = format!("{}a{} b", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(
            SearchQuery::parse(&deep),
            SearchQuery::And(vec![SearchQuery::And(Vec::new()), word("b")])
        );

        let query = SearchQuery::parse(&format!("{}a", "NOT ".repeat(100_000)));
        assert!(depth(&query) <= MAX_NESTING + 1);

        let shallow = format!("{}a{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(SearchQuery::parse(&shallow), word("a"));
    }
}
