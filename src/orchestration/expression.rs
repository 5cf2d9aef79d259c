//! # Concurrency Key Expressions
//!
//! A step's concurrency expression turns the triggering input into the string
//! key its runs are grouped under. The language is deliberately small:
//!
//! ```text
//! expr    := term ( "+" term )*
//! term    := STRING | INT | path
//! path    := root ( "." IDENT | "[" ( STRING | INT ) "]" )*
//! root    := "input" | "additional_metadata"
//! ```
//!
//! `input.user_id`, `input["tenant-name"]`, `input.items[0].sku` and
//! `"user:" + input.user_id` are all valid. Paths must resolve to a string,
//! number or boolean; anything else fails with
//! [`ValidationError::ExpressionEval`].
//!
//! Expressions are parsed once when a definition is validated and evaluated
//! against [`WorkflowRun::trigger_context`](crate::models::WorkflowRun::trigger_context)
//! when a step is enqueued.

use crate::error::ValidationError;
use logos::Logos;
use serde_json::Value;
use std::fmt;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u64>().ok())]
    Int(u64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    #[regex(r"'[^']*'", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),

    #[token(".")]
    Dot,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("+")]
    Plus,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Int(n) => write!(f, "integer {n}"),
            Token::Str(s) => write!(f, "string \"{s}\""),
            Token::Dot => f.write_str("'.'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Plus => f.write_str("'+'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Input,
    AdditionalMetadata,
}

impl Root {
    fn key(&self) -> &'static str {
        match self {
            Root::Input => "input",
            Root::AdditionalMetadata => "additional_metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Literal(String),
    Path { root: Root, segments: Vec<Segment> },
}

/// A parsed concurrency expression
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyExpression {
    source: String,
    terms: Vec<Term>,
}

impl ConcurrencyExpression {
    pub fn parse(source: &str) -> Result<Self, ValidationError> {
        let mut tokens = Vec::new();
        let mut lexer = Token::lexer(source);
        while let Some(token) = lexer.next() {
            match token {
                Ok(token) => tokens.push(token),
                Err(()) => {
                    return Err(ValidationError::expression(
                        source,
                        format!("unexpected character at offset {}", lexer.span().start),
                    ))
                }
            }
        }

        let terms = Parser {
            source,
            tokens,
            pos: 0,
        }
        .parse()?;

        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a trigger context of the form
    /// `{"input": ..., "additional_metadata": ...}`
    pub fn evaluate(&self, context: &Value) -> Result<String, ValidationError> {
        let mut key = String::new();
        for term in &self.terms {
            match term {
                Term::Literal(s) => key.push_str(s),
                Term::Path { root, segments } => key.push_str(&self.resolve(*root, segments, context)?),
            }
        }
        Ok(key)
    }

    fn resolve(
        &self,
        root: Root,
        segments: &[Segment],
        context: &Value,
    ) -> Result<String, ValidationError> {
        let mut path = root.key().to_string();
        let mut current = context
            .get(root.key())
            .ok_or_else(|| self.error(format!("'{path}' is not available")))?;

        for segment in segments {
            let next = match segment {
                Segment::Field(name) => {
                    path.push('.');
                    path.push_str(name);
                    current.get(name.as_str())
                }
                Segment::Index(index) => {
                    path.push_str(&format!("[{index}]"));
                    current.get(*index)
                }
            };
            current = next.ok_or_else(|| self.error(format!("'{path}' does not exist")))?;
        }

        match current {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Err(self.error(format!("'{path}' is null"))),
            Value::Array(_) | Value::Object(_) => {
                Err(self.error(format!("'{path}' is not a scalar value")))
            }
        }
    }

    fn error(&self, reason: String) -> ValidationError {
        ValidationError::expression(&self.source, reason)
    }
}

impl fmt::Display for ConcurrencyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate in one step
pub fn resolve_key(expression: &str, context: &Value) -> Result<String, ValidationError> {
    ConcurrencyExpression::parse(expression)?.evaluate(context)
}

struct Parser<'source> {
    source: &'source str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn parse(mut self) -> Result<Vec<Term>, ValidationError> {
        if self.tokens.is_empty() {
            return Err(self.error("expression is empty"));
        }

        let mut terms = vec![self.parse_term()?];
        while let Some(token) = self.advance() {
            match token {
                Token::Plus => terms.push(self.parse_term()?),
                other => return Err(self.error(format!("expected '+', found {other}"))),
            }
        }
        Ok(terms)
    }

    fn parse_term(&mut self) -> Result<Term, ValidationError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Term::Literal(s)),
            Some(Token::Int(n)) => Ok(Term::Literal(n.to_string())),
            Some(Token::Ident(name)) => {
                let root = match name.as_str() {
                    "input" => Root::Input,
                    "additional_metadata" => Root::AdditionalMetadata,
                    _ => {
                        return Err(self.error(format!(
                            "unknown root '{name}', expected 'input' or 'additional_metadata'"
                        )))
                    }
                };
                let segments = self.parse_segments()?;
                Ok(Term::Path { root, segments })
            }
            Some(other) => Err(self.error(format!("unexpected {other}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_segments(&mut self) -> Result<Vec<Segment>, ValidationError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(name)) => segments.push(Segment::Field(name)),
                        Some(other) => {
                            return Err(self.error(format!("expected field name after '.', found {other}")))
                        }
                        None => return Err(self.error("expected field name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let segment = match self.advance() {
                        Some(Token::Str(key)) => Segment::Field(key),
                        Some(Token::Int(index)) => Segment::Index(index as usize),
                        Some(other) => {
                            return Err(self.error(format!("expected string or index, found {other}")))
                        }
                        None => return Err(self.error("unterminated '['")),
                    };
                    match self.advance() {
                        Some(Token::RBracket) => segments.push(segment),
                        _ => return Err(self.error("expected ']'")),
                    }
                }
                _ => return Ok(segments),
            }
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::expression(self.source, reason)
    }
}
