// Declare modules publicly so they are part of the library interface
pub mod environment;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod pretty_print;
pub mod primitives;
pub mod source;
pub mod types;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

pub use environment::{EnvError, Environment};
pub use evaluator::{EvalError, EvalResult, evaluate};
pub use lexer::{Token, TokenKind, tokenize};
pub use parser::{ParseError, Parser, parse_str};
pub use source::Span;
pub use types::{Node, Sexpr};

/// Anything that can go wrong between reading source text and producing a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl Error {
    pub fn span(&self) -> Span {
        match self {
            Error::Parse(err) => err.span(),
            Error::Eval(err) => err.span(),
        }
    }
}

/// Reads the first expression in `input` and evaluates it in `env`.
pub fn eval_str(input: &str, env: &Rc<RefCell<Environment>>) -> Result<Node, Error> {
    let node = parse_str(input)?;
    Ok(evaluate(&node, env)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_str_session() {
        let env = Environment::new_global_populated();
        let run = |input: &str| eval_str(input, &env).map(|n| n.to_string());

        assert_eq!(run("(define r 10)"), Ok(String::new()));
        assert_eq!(run("(* pi (* r r))"), Ok("314.1592653589793".to_string()));
        assert_eq!(run("(if (> (* 11 11) 120) (* 7 6) oops)"), Ok("42".to_string()));
        assert_eq!(
            run("(define fact (lambda (n) (if (<= n 1) 1 (* n (fact (- n 1))))))"),
            Ok(String::new())
        );
        assert_eq!(run("(fact 10)"), Ok("3628800".to_string()));
        assert_eq!(run("(fact 21)"), Ok("51090942171709440000.0".to_string()));
        assert_eq!(run("(quote (a b c))"), Ok("(a b c)".to_string()));
    }

    #[test]
    fn test_eval_str_errors() {
        let env = Environment::new_global_populated();
        assert!(matches!(
            eval_str("(+ 1", &env),
            Err(Error::Parse(ParseError::UnexpectedEndOfInput(_)))
        ));
        assert!(matches!(
            eval_str(")", &env),
            Err(Error::Parse(ParseError::UnexpectedCloseParen(_)))
        ));
        let err = eval_str("(+ 1 missing)", &env).unwrap_err();
        assert!(matches!(
            err,
            Error::Eval(EvalError::EnvError(EnvError::UnboundSymbol(ref name, _))) if name == "missing"
        ));
        assert_eq!(err.span(), Span::new(5, 12));
    }

    #[test]
    fn test_deeply_nested_input_is_an_error() {
        let env = Environment::new_global_populated();
        let depth = 200_000;
        let input = format!("(quote {}{})", "(".repeat(depth), ")".repeat(depth));
        assert!(matches!(
            eval_str(&input, &env),
            Err(Error::Parse(ParseError::NestingTooDeep { .. }))
        ));
        assert_eq!(eval_str("(+ 1 2)", &env).map(|n| n.kind), Ok(Sexpr::Integer(3)));
    }

    #[test]
    fn test_failed_evaluation_keeps_environment_usable() {
        let env = Environment::new_global_populated();
        assert!(eval_str("(define x 1)", &env).is_ok());
        assert!(eval_str("(car (list))", &env).is_err());
        assert_eq!(eval_str("x", &env).map(|n| n.kind), Ok(Sexpr::Integer(1)));
    }
}
