use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid character at position {position}")]
    InvalidToken { position: usize },

    #[error("unexpected token at position {position}: got \"{actual}\", expected {expected}")]
    UnexpectedToken {
        position: usize,
        actual: String,
        expected: &'static str,
    },

    #[error("empty identifier set at position {position}")]
    EmptyIdentifierSet { position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Operator,
    Number,
    Identifier,
    End,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    kind: TokenKind,
    start: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, FilterError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let c = bytes[index];
        if c.is_ascii_whitespace() {
            index += 1;
            continue;
        }

        let start = index;
        if matches!(c, b'(' | b')' | b'{' | b'}') {
            index += 1;
            tokens.push(Token {
                text: &source[start..index],
                kind: TokenKind::Operator,
                start,
            });
        } else if c.is_ascii_digit() {
            while index < bytes.len() && bytes[index].is_ascii_digit() {
                index += 1;
            }
            tokens.push(Token {
                text: &source[start..index],
                kind: TokenKind::Number,
                start,
            });
        } else if c.is_ascii_alphabetic() {
            while index < bytes.len() && bytes[index].is_ascii_alphanumeric() {
                index += 1;
            }
            tokens.push(Token {
                text: &source[start..index],
                kind: TokenKind::Identifier,
                start,
            });
        } else {
            return Err(FilterError::InvalidToken { position: index });
        }
    }

    tokens.push(Token {
        text: "",
        kind: TokenKind::End,
        start: source.len(),
    });
    Ok(tokens)
}

/// Photo aspect predicates, compiled to width/height comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    Landscape,
    Portrait,
    Square,
}

/// A parsed selection filter.
///
/// `to_sql` emits a fragment whose only interpolated user data are
/// identifier-set members, which the tokenizer restricts to
/// `[A-Za-z][A-Za-z0-9]*` — quoting them is therefore safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Literal(bool),
    Aspect(Aspect),
    Favorite,
    Not(Box<Filter>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Collections(Vec<String>),
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;

        let end = parser.peek();
        if end.kind != TokenKind::End {
            return Err(FilterError::UnexpectedToken {
                position: end.start,
                actual: end.text.to_string(),
                expected: "end of input",
            });
        }
        Ok(filter)
    }

    pub fn to_sql(&self) -> String {
        match self {
            Filter::Literal(true) => "1".to_string(),
            Filter::Literal(false) => "0".to_string(),
            Filter::Aspect(aspect) => {
                let op = match aspect {
                    Aspect::Landscape => ">",
                    Aspect::Portrait => "<",
                    Aspect::Square => "=",
                };
                format!("photos.width {} photos.height", op)
            }
            Filter::Favorite => "COALESCE(photos.favorite, 0)".to_string(),
            Filter::Not(operand) => format!("NOT ({})", operand.to_sql()),
            Filter::And(left, right) => format!("({}) AND ({})", left.to_sql(), right.to_sql()),
            Filter::Or(left, right) => format!("({}) OR ({})", left.to_sql(), right.to_sql()),
            Filter::Collections(identifiers) => identifiers
                .iter()
                .map(|identifier| format!("collections.identifier = '{}'", identifier))
                .collect::<Vec<_>>()
                .join(" OR "),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Filter::parse(source)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Literal(true) => f.write_str("true"),
            Filter::Literal(false) => f.write_str("false"),
            Filter::Aspect(Aspect::Landscape) => f.write_str("landscape"),
            Filter::Aspect(Aspect::Portrait) => f.write_str("portrait"),
            Filter::Aspect(Aspect::Square) => f.write_str("square"),
            Filter::Favorite => f.write_str("favorite"),
            Filter::Not(operand) => write!(f, "not ({})", operand),
            Filter::And(left, right) => write!(f, "({}) and ({})", left, right),
            Filter::Or(left, right) => write!(f, "({}) or ({})", left, right),
            Filter::Collections(identifiers) => {
                write!(f, "{{{}}}", identifiers.join(" "))
            }
        }
    }
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Token<'a> {
        self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Filter, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek().text == "or" {
            self.advance();
            let right = self.parse_and()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek().text == "and" {
            self.advance();
            let right = self.parse_unary()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, FilterError> {
        if self.peek().text == "not" {
            self.advance();
            let operand = self.parse_atom()?;
            return Ok(Filter::Not(Box::new(operand)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Filter, FilterError> {
        let token = self.advance();
        match token.text {
            "landscape" => Ok(Filter::Aspect(Aspect::Landscape)),
            "portrait" => Ok(Filter::Aspect(Aspect::Portrait)),
            "square" => Ok(Filter::Aspect(Aspect::Square)),
            "favorite" => Ok(Filter::Favorite),
            "true" => Ok(Filter::Literal(true)),
            "false" => Ok(Filter::Literal(false)),
            "(" => {
                let expression = self.parse_or()?;
                let close = self.advance();
                if close.text != ")" {
                    return Err(FilterError::UnexpectedToken {
                        position: close.start,
                        actual: close.text.to_string(),
                        expected: "\")\"",
                    });
                }
                Ok(expression)
            }
            "{" => {
                let mut identifiers: Vec<String> = Vec::new();
                loop {
                    let token = self.advance();
                    match (token.text, token.kind) {
                        ("}", _) => {
                            if identifiers.is_empty() {
                                return Err(FilterError::EmptyIdentifierSet {
                                    position: token.start,
                                });
                            }
                            return Ok(Filter::Collections(identifiers));
                        }
                        (identifier, TokenKind::Identifier) => {
                            if !identifiers.iter().any(|i| i == identifier) {
                                identifiers.push(identifier.to_string());
                            }
                        }
                        (actual, _) => {
                            return Err(FilterError::UnexpectedToken {
                                position: token.start,
                                actual: actual.to_string(),
                                expected: "an identifier or \"}\"",
                            })
                        }
                    }
                }
            }
            actual => Err(FilterError::UnexpectedToken {
                position: token.start,
                actual: actual.to_string(),
                expected: "an expression",
            }),
        }
    }
}
