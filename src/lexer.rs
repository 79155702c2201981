use logos::Logos;
use std::fmt;

use crate::Span;

/// Lexical token kinds. Parentheses always stand alone; any other run of
/// non-whitespace is an atom whose meaning is decided later by the parser.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"\s+")] // Skip whitespace
pub enum TokenKind {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[regex(r"[^\s()]+", |lex| lex.slice().to_string())]
    Atom(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Atom(s) => write!(f, "{}", s),
        }
    }
}

/// Splits `input` into tokens. Never fails: quotes, semicolons and any other
/// punctuation are ordinary atom content.
pub fn tokenize(input: &str) -> Vec<Token> {
    TokenKind::lexer(input)
        .spanned()
        .map(|(result, range)| {
            let span = Span::new(range.start, range.end);
            // Every non-whitespace byte is covered by a rule, so an error slot
            // can only hold atom text.
            let kind = result.unwrap_or_else(|_| TokenKind::Atom(input[range].to_string()));
            Token { kind, span }
        })
        .collect()
}
