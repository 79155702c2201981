use crate::{EnvError, Error, EvalError, ParseError};
use ariadne::{Label, Report, ReportKind, Source};
use std::io;

const SOURCE_ID: &str = "REPL";

type ErrorReport<'a> = Report<'a, (&'static str, std::ops::Range<usize>)>;

impl EvalError {
    fn report(&self) -> ErrorReport<'static> {
        let range = self.span().to_range();
        let report = Report::build(ReportKind::Error, (SOURCE_ID, range.clone()));
        let label = Label::new((SOURCE_ID, range));
        let report = match self {
            EvalError::EnvError(env_error) => match env_error {
                EnvError::UnboundSymbol(symbol, _) => report
                    .with_message(format!("Unbound symbol `{}`", symbol))
                    .with_label(
                        label.with_message("This symbol is not defined in the current scope"),
                    ),
                EnvError::ArityMismatch {
                    name,
                    expected,
                    found,
                    ..
                } => report
                    .with_message(format!("Wrong number of arguments to `{}`", name))
                    .with_label(label.with_message(format!(
                        "Expected {} arguments, found {}",
                        expected, found
                    ))),
            },
            EvalError::NotCallable(sexpr, _) => report
                .with_message(format!("Not a procedure: {}", sexpr))
                .with_label(label.with_message(format!(
                    "A {} cannot be called as a procedure",
                    sexpr.type_name()
                ))),
            EvalError::MalformedSpecialForm(message, _) => report
                .with_message("Malformed special form")
                .with_label(label.with_message(message)),
            EvalError::DivisionByZero(_) => report
                .with_message("Division by zero")
                .with_label(label.with_message("A divisor here is zero")),
            EvalError::IndexOutOfRange(message, _) => report
                .with_message("Index out of range")
                .with_label(label.with_message(message)),
            EvalError::TypeMismatch {
                name,
                expected,
                found,
                ..
            } => report
                .with_message(format!("Type mismatch in `{}`", name))
                .with_label(label.with_message(format!("Expected {}, found {}", expected, found))),
            EvalError::DomainError(name, _) => report
                .with_message(format!("Math domain error in `{}`", name))
                .with_label(label.with_message("The result is not a finite real number")),
            EvalError::StackExhausted(_) => report
                .with_message("Maximum evaluation depth exceeded")
                .with_label(label.with_message("Recursion ran too deep while evaluating this")),
        };
        report.finish()
    }

    /// Writes a source-annotated report of this error to stderr.
    pub fn pretty_print(&self, input: &str) -> io::Result<()> {
        self.report().eprint((SOURCE_ID, Source::from(input)))
    }
}

impl ParseError {
    fn report(&self) -> ErrorReport<'static> {
        let range = self.span().to_range();
        let report = Report::build(ReportKind::Error, (SOURCE_ID, range.clone()));
        let label = Label::new((SOURCE_ID, range));
        let report = match self {
            ParseError::UnexpectedEndOfInput(_) => report
                .with_message("Unexpected EOF")
                .with_label(label.with_message("Expected an expression or ')'")),
            ParseError::UnexpectedCloseParen(_) => report
                .with_message("Unexpected ')'")
                .with_label(label.with_message("This ')' has no matching '('")),
            ParseError::NestingTooDeep { limit, .. } => report
                .with_message(format!("Lists nested deeper than {} levels", limit))
                .with_label(label.with_message("Nesting exceeds the limit here")),
        };
        report.finish()
    }

    pub fn pretty_print(&self, input: &str) -> io::Result<()> {
        self.report().eprint((SOURCE_ID, Source::from(input)))
    }
}

impl Error {
    pub fn pretty_print(&self, input: &str) -> io::Result<()> {
        match self {
            Error::Parse(err) => err.pretty_print(input),
            Error::Eval(err) => err.pretty_print(input),
        }
    }
}
