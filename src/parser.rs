use crate::Span;
use crate::evaluator::max_eval_depth;
use crate::lexer::{Token, TokenKind};
use crate::types::{Node, Sexpr};
use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Parse Error: Unexpected end of input")]
    UnexpectedEndOfInput(Span),
    #[error("Parse Error [at {0}]: Unexpected ')'")]
    UnexpectedCloseParen(Span),
    #[error("Parse Error [at {span}]: Lists nested deeper than {limit} levels")]
    NestingTooDeep { limit: usize, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedEndOfInput(span)
            | ParseError::UnexpectedCloseParen(span)
            | ParseError::NestingTooDeep { span, .. } => *span,
        }
    }
}

// Result type alias for convenience
pub type ParseResult<T> = Result<T, ParseError>;

/// Reads expressions from a token sequence, advancing a cursor rather than
/// consuming the tokens.
///
/// List nesting is capped (by default at the evaluation depth limit), so a
/// parsed tree is never deeper than the evaluator and printer can walk.
pub struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    end: usize, // Byte offset just past the last token, for EOF errors
    depth: usize,
    max_depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let end = tokens.last().map_or(0, |t| t.span.end);
        Parser {
            tokens,
            cursor: 0,
            end,
            depth: 0,
            max_depth: max_eval_depth(),
        }
    }

    /// Overrides the maximum list nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    // Consumes the next token if available.
    fn next_token(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.cursor)?;
        self.cursor += 1;
        Some(token)
    }

    // Peeks at the next token without consuming.
    fn peek_token(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn eof_error(&self) -> ParseError {
        ParseError::UnexpectedEndOfInput(Span::new(self.end, self.end))
    }

    /// Number of tokens not yet consumed.
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.cursor
    }

    /// Parses a single S-expression from the token stream.
    pub fn parse_expr(&mut self) -> ParseResult<Node> {
        let token = self.next_token().cloned().ok_or_else(|| self.eof_error())?;
        match token.kind {
            TokenKind::LParen => self.parse_list(token.span),
            TokenKind::RParen => Err(ParseError::UnexpectedCloseParen(token.span)),
            TokenKind::Atom(text) => Ok(Node::new(classify_atom(&text), token.span)),
        }
    }

    /// Parses the rest of a list whose `(` has already been consumed.
    fn parse_list(&mut self, open_span: Span) -> ParseResult<Node> {
        if self.depth >= self.max_depth {
            return Err(ParseError::NestingTooDeep {
                limit: self.max_depth,
                span: open_span,
            });
        }
        self.depth += 1;
        let list = self.parse_list_elements(open_span);
        self.depth -= 1;
        list
    }

    fn parse_list_elements(&mut self, open_span: Span) -> ParseResult<Node> {
        let mut elements = Vec::new();
        loop {
            match self.peek_token() {
                Some(Token {
                    kind: TokenKind::RParen,
                    span,
                }) => {
                    let span = open_span.merge(*span);
                    self.cursor += 1;
                    return Ok(Node::new_list(elements, span));
                }
                Some(_) => elements.push(self.parse_expr()?),
                None => return Err(self.eof_error()),
            }
        }
    }

    /// Parses one top-level expression. Tokens after it are ignored; use
    /// [`Parser::parse_expr`] and [`Parser::remaining`] to be strict.
    pub fn parse(mut self) -> ParseResult<Node> {
        let expr = self.parse_expr()?;
        if self.remaining() > 0 {
            debug!("ignoring {} trailing token(s)", self.remaining());
        }
        Ok(expr)
    }

    /// Parses every expression in the token stream.
    pub fn parse_all(mut self) -> ParseResult<Vec<Node>> {
        let mut expressions = Vec::new();
        while self.peek_token().is_some() {
            expressions.push(self.parse_expr()?);
        }
        Ok(expressions)
    }
}

/// Integer if the token is a base-10 whole number, real if it is a float
/// literal, symbol otherwise.
pub fn classify_atom(token: &str) -> Sexpr {
    if let Ok(n) = token.parse::<i64>() {
        Sexpr::Integer(n)
    } else if let Ok(n) = token.parse::<f64>() {
        Sexpr::Real(n)
    } else {
        Sexpr::Symbol(token.to_string())
    }
}

// Helper function to lex and parse a string directly (useful for tests and REPL)
pub fn parse_str(input: &str) -> ParseResult<Node> {
    let tokens = crate::lexer::tokenize(input);
    Parser::new(tokens).parse()
}
